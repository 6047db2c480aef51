use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use shared::domain::{ConversationId, DeliveryStatus, Message, MessageId, User, UserId};
use std::collections::HashSet;

use crate::error::{ClientError, ClientResult};

/// How far apart an optimistic entry and its confirmation may be stamped and still match.
pub const OPTIMISTIC_MATCH_WINDOW_SECS: i64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Idle,
    Loading,
    Loaded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Already present under the same server id.
    Duplicate,
    ReplacedOptimistic { temp_id: MessageId, index: usize },
    Inserted { index: usize },
    /// Belongs to a conversation other than the one held.
    WrongConversation,
}

impl ReconcileOutcome {
    pub fn changed(&self) -> bool {
        matches!(
            self,
            Self::ReplacedOptimistic { .. } | Self::Inserted { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayGroup<'a> {
    pub day: NaiveDate,
    pub messages: Vec<&'a Message>,
}

/// Ordered, deduplicated messages of the open conversation.
#[derive(Debug)]
pub struct MessageLog {
    conversation_id: Option<ConversationId>,
    messages: Vec<Message>,
    state: LoadState,
    next_temp_sequence: u64,
}

impl Default for MessageLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageLog {
    pub fn new() -> Self {
        Self {
            conversation_id: None,
            messages: Vec::new(),
            state: LoadState::Idle,
            next_temp_sequence: 1,
        }
    }

    pub fn conversation_id(&self) -> Option<&ConversationId> {
        self.conversation_id.as_ref()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn state(&self) -> LoadState {
        self.state
    }

    pub fn find(&self, id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|message| &message.id == id)
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Switches to `conversation_id` with an empty log awaiting history.
    pub fn reset(&mut self, conversation_id: ConversationId) {
        self.conversation_id = Some(conversation_id);
        self.messages.clear();
        self.state = LoadState::Loading;
    }

    pub fn clear(&mut self) {
        self.conversation_id = None;
        self.messages.clear();
        self.state = LoadState::Idle;
    }

    /// Installs fetched history. Entries that arrived while loading and are absent from the
    /// history (live pushes, optimistic sends) are kept in timestamp order.
    pub fn load(&mut self, conversation_id: ConversationId, history: Vec<Message>) {
        if self.conversation_id.as_ref() != Some(&conversation_id) {
            self.reset(conversation_id);
        }

        let arrived_during_load = std::mem::take(&mut self.messages);
        let mut seen = HashSet::with_capacity(history.len());
        let mut merged: Vec<Message> = history
            .into_iter()
            .filter(|message| seen.insert(message.id.clone()))
            .collect();
        merged.sort_by_key(|message| message.created_at);
        self.messages = merged;

        for message in arrived_during_load {
            if !seen.contains(&message.id) {
                self.insert_ordered(message);
            }
        }
        self.state = LoadState::Loaded;
    }

    /// Appends a pending entry with a temporary id for content typed locally.
    pub fn append_optimistic(
        &mut self,
        sender: &User,
        content: &str,
        now: DateTime<Utc>,
    ) -> ClientResult<Message> {
        let Some(conversation_id) = self.conversation_id.clone() else {
            return Err(ClientError::validation("no conversation selected"));
        };
        let content = content.trim();
        if content.is_empty() {
            return Err(ClientError::validation("message content is empty"));
        }

        let message = Message {
            id: MessageId::temporary(self.next_temp_sequence),
            conversation_id,
            sender_id: sender.id.clone(),
            sender_name: Some(sender.name.clone()),
            content: content.to_string(),
            created_at: now,
            read_by: Vec::new(),
            is_guest: sender.is_guest,
            status: DeliveryStatus::Pending,
        };
        self.next_temp_sequence += 1;
        self.messages.push(message.clone());
        Ok(message)
    }

    /// Merges a server-confirmed message that arrived from any source.
    pub fn reconcile_incoming(&mut self, message: Message, me: &UserId) -> ReconcileOutcome {
        if self.conversation_id.as_ref() != Some(&message.conversation_id) {
            return ReconcileOutcome::WrongConversation;
        }
        if self.position_of(&message.id).is_some() {
            return ReconcileOutcome::Duplicate;
        }

        if &message.sender_id == me {
            if let Some(index) = self.matching_optimistic(&message) {
                return self.replace_at(index, message);
            }
        }

        let index = self.insert_ordered(message);
        ReconcileOutcome::Inserted { index }
    }

    /// Resolves the optimistic entry `temp_id` with the REST confirmation of the same send.
    pub fn confirm_optimistic(
        &mut self,
        temp_id: &MessageId,
        confirmed: Message,
        me: &UserId,
    ) -> ReconcileOutcome {
        let temp_index = self.position_of(temp_id);
        if self.position_of(&confirmed.id).is_some() {
            // The realtime echo already took its place.
            if let Some(index) = temp_index {
                self.messages.remove(index);
            }
            return ReconcileOutcome::Duplicate;
        }
        match temp_index {
            Some(index) => self.replace_at(index, confirmed),
            None => self.reconcile_incoming(confirmed, me),
        }
    }

    pub fn mark_failed(&mut self, temp_id: &MessageId) -> bool {
        match self.messages.iter_mut().find(|message| &message.id == temp_id) {
            Some(message) if message.status == DeliveryStatus::Pending => {
                message.status = DeliveryStatus::Failed;
                true
            }
            _ => false,
        }
    }

    /// Puts a failed entry back in flight and returns it for resending.
    pub fn retry(&mut self, temp_id: &MessageId) -> Option<Message> {
        let message = self
            .messages
            .iter_mut()
            .find(|message| &message.id == temp_id && message.status == DeliveryStatus::Failed)?;
        message.status = DeliveryStatus::Pending;
        Some(message.clone())
    }

    pub fn mark_read(
        &mut self,
        message_id: &MessageId,
        reader: &UserId,
        read_at: Option<DateTime<Utc>>,
    ) -> bool {
        self.messages
            .iter_mut()
            .find(|message| &message.id == message_id)
            .map(|message| message.record_read(reader.clone(), read_at))
            .unwrap_or(false)
    }

    /// Persisted messages from other people that `me` has not read yet.
    pub fn unread_from_others(&self, me: &UserId) -> Vec<MessageId> {
        self.messages
            .iter()
            .filter(|message| {
                &message.sender_id != me && !message.id.is_temporary() && !message.is_read_by(me)
            })
            .map(|message| message.id.clone())
            .collect()
    }

    fn position_of(&self, id: &MessageId) -> Option<usize> {
        self.messages.iter().position(|message| &message.id == id)
    }

    fn matching_optimistic(&self, confirmed: &Message) -> Option<usize> {
        let content = confirmed.content.trim();
        self.messages.iter().position(|candidate| {
            candidate.is_pending()
                && candidate.sender_id == confirmed.sender_id
                && candidate.content == content
                && (candidate.created_at - confirmed.created_at)
                    .num_seconds()
                    .abs()
                    <= OPTIMISTIC_MATCH_WINDOW_SECS
        })
    }

    fn replace_at(&mut self, index: usize, mut confirmed: Message) -> ReconcileOutcome {
        confirmed.status = DeliveryStatus::Sent;
        let previous = std::mem::replace(&mut self.messages[index], confirmed);
        ReconcileOutcome::ReplacedOptimistic {
            temp_id: previous.id,
            index,
        }
    }

    /// Inserts after every entry stamped at or before `message`.
    fn insert_ordered(&mut self, message: Message) -> usize {
        let index = self
            .messages
            .iter()
            .rposition(|existing| existing.created_at <= message.created_at)
            .map(|position| position + 1)
            .unwrap_or(0);
        self.messages.insert(index, message);
        index
    }
}

/// Partitions an ordered log by calendar day in `tz`.
pub fn group_by_day<'a, Tz: TimeZone>(messages: &'a [Message], tz: &Tz) -> Vec<DayGroup<'a>> {
    let mut groups: Vec<DayGroup<'a>> = Vec::new();
    for message in messages {
        let day = message.created_at.with_timezone(tz).date_naive();
        match groups.last_mut() {
            Some(group) if group.day == day => group.messages.push(message),
            _ => groups.push(DayGroup {
                day,
                messages: vec![message],
            }),
        }
    }
    groups
}

#[cfg(test)]
#[path = "tests/message_log_tests.rs"]
mod tests;
