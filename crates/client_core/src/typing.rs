use std::time::Duration;

use shared::domain::ConversationId;
use tokio::time::Instant;

pub const DEFAULT_TYPING_IDLE: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypingSignal {
    Started(ConversationId),
    Stopped(ConversationId),
}

impl TypingSignal {
    pub fn conversation_id(&self) -> &ConversationId {
        match self {
            Self::Started(id) | Self::Stopped(id) => id,
        }
    }

    pub fn is_typing(&self) -> bool {
        matches!(self, Self::Started(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TypingState {
    Idle,
    Active {
        conversation_id: ConversationId,
        deadline: Instant,
    },
}

/// Collapses a burst of keystrokes into one started/stopped pair per conversation.
#[derive(Debug)]
pub struct TypingDebouncer {
    idle_timeout: Duration,
    state: TypingState,
}

impl Default for TypingDebouncer {
    fn default() -> Self {
        Self::new(DEFAULT_TYPING_IDLE)
    }
}

impl TypingDebouncer {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            idle_timeout,
            state: TypingState::Idle,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, TypingState::Active { .. })
    }

    /// When the pending stop signal becomes due.
    pub fn deadline(&self) -> Option<Instant> {
        match &self.state {
            TypingState::Idle => None,
            TypingState::Active { deadline, .. } => Some(*deadline),
        }
    }

    /// Records a draft change. An empty draft stops an active burst immediately.
    pub fn keystroke(
        &mut self,
        conversation_id: &ConversationId,
        draft_non_empty: bool,
        now: Instant,
    ) -> Vec<TypingSignal> {
        let mut signals = Vec::new();
        if let TypingState::Active {
            conversation_id: active,
            ..
        } = &self.state
        {
            if active != conversation_id || !draft_non_empty {
                signals.push(TypingSignal::Stopped(active.clone()));
                self.state = TypingState::Idle;
            }
        }
        if !draft_non_empty {
            return signals;
        }

        let deadline = now + self.idle_timeout;
        match &mut self.state {
            TypingState::Active {
                deadline: current, ..
            } => *current = deadline,
            TypingState::Idle => {
                signals.push(TypingSignal::Started(conversation_id.clone()));
                self.state = TypingState::Active {
                    conversation_id: conversation_id.clone(),
                    deadline,
                };
            }
        }
        signals
    }

    /// Emits the stop signal once the idle timeout has elapsed.
    pub fn poll(&mut self, now: Instant) -> Option<TypingSignal> {
        match &self.state {
            TypingState::Active { deadline, .. } if now >= *deadline => self.flush(),
            _ => None,
        }
    }

    /// Ends the current burst regardless of the deadline.
    pub fn flush(&mut self) -> Option<TypingSignal> {
        match std::mem::replace(&mut self.state, TypingState::Idle) {
            TypingState::Active {
                conversation_id, ..
            } => Some(TypingSignal::Stopped(conversation_id)),
            TypingState::Idle => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conv(id: &str) -> ConversationId {
        ConversationId::new(id)
    }

    #[test]
    fn burst_of_keystrokes_emits_one_start_and_one_stop() {
        let start = Instant::now();
        let mut typing = TypingDebouncer::default();
        let at = |ms: u64| start + Duration::from_millis(ms);

        assert_eq!(
            typing.keystroke(&conv("c1"), true, at(0)),
            vec![TypingSignal::Started(conv("c1"))]
        );
        for ms in [200, 400, 600] {
            assert!(typing.keystroke(&conv("c1"), true, at(ms)).is_empty());
        }

        assert_eq!(typing.deadline(), Some(at(1600)));
        assert_eq!(typing.poll(at(1599)), None);
        assert_eq!(typing.poll(at(1600)), Some(TypingSignal::Stopped(conv("c1"))));
        assert_eq!(typing.poll(at(5000)), None);
        assert!(!typing.is_active());
    }

    #[test]
    fn empty_draft_stops_immediately_and_is_silent_when_idle() {
        let now = Instant::now();
        let mut typing = TypingDebouncer::default();
        assert!(typing.keystroke(&conv("c1"), false, now).is_empty());

        typing.keystroke(&conv("c1"), true, now);
        assert_eq!(
            typing.keystroke(&conv("c1"), false, now),
            vec![TypingSignal::Stopped(conv("c1"))]
        );
        assert_eq!(typing.deadline(), None);
    }

    #[test]
    fn switching_conversation_stops_the_previous_one() {
        let now = Instant::now();
        let mut typing = TypingDebouncer::new(Duration::from_millis(500));
        typing.keystroke(&conv("c1"), true, now);

        let signals = typing.keystroke(&conv("c2"), true, now);
        assert_eq!(
            signals,
            vec![
                TypingSignal::Stopped(conv("c1")),
                TypingSignal::Started(conv("c2"))
            ]
        );
        assert!(signals[1].is_typing());
        assert_eq!(typing.flush(), Some(TypingSignal::Stopped(conv("c2"))));
        assert_eq!(typing.flush(), None);
    }
}
