use shared::{
    domain::{CallId, ConversationId, User, UserId},
    protocol::{CallPayload, CallSignal, ClientCommand, IncomingCallPayload},
};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Ringing {
        conversation_id: ConversationId,
        initiator: User,
        call: Option<CallPayload>,
    },
    Active {
        conversation_id: ConversationId,
        call: Option<CallPayload>,
    },
}

/// Call signaling state for the session. Media is handled elsewhere.
#[derive(Debug)]
pub struct CallTracker {
    state: CallState,
}

impl Default for CallTracker {
    fn default() -> Self {
        Self {
            state: CallState::Idle,
        }
    }
}

impl CallTracker {
    pub fn state(&self) -> &CallState {
        &self.state
    }

    pub fn conversation_id(&self) -> Option<&ConversationId> {
        match &self.state {
            CallState::Idle => None,
            CallState::Ringing {
                conversation_id, ..
            }
            | CallState::Active {
                conversation_id, ..
            } => Some(conversation_id),
        }
    }

    pub fn call_id(&self) -> Option<&CallId> {
        match &self.state {
            CallState::Idle => None,
            CallState::Ringing { call, .. } | CallState::Active { call, .. } => {
                call.as_ref().map(|call| &call.id)
            }
        }
    }

    /// Rings for calls started by someone else while no other call is in progress.
    pub fn incoming(&mut self, payload: IncomingCallPayload, me: &UserId) -> bool {
        if &payload.initiator.id == me {
            return false;
        }
        if self.state != CallState::Idle {
            debug!(
                conversation_id = %payload.conversation,
                "ignoring incoming call while another call is in progress"
            );
            return false;
        }
        self.state = CallState::Ringing {
            conversation_id: payload.conversation,
            initiator: payload.initiator,
            call: payload.call,
        };
        true
    }

    /// `callEnded` for the tracked conversation returns to idle.
    pub fn remote_ended(&mut self, conversation_id: &ConversationId) -> bool {
        if self.conversation_id() != Some(conversation_id) {
            return false;
        }
        self.state = CallState::Idle;
        true
    }

    pub fn start(&mut self, conversation_id: ConversationId, call: CallPayload) -> ClientCommand {
        let signal = CallSignal {
            conversation: conversation_id.clone(),
            call: Some(call.clone()),
        };
        self.state = CallState::Active {
            conversation_id,
            call: Some(call),
        };
        ClientCommand::InitiateCall(signal)
    }

    pub fn accept(&mut self) -> Option<ClientCommand> {
        let CallState::Ringing {
            conversation_id,
            call,
            ..
        } = std::mem::replace(&mut self.state, CallState::Idle)
        else {
            return None;
        };
        let signal = CallSignal {
            conversation: conversation_id.clone(),
            call: call.clone(),
        };
        self.state = CallState::Active {
            conversation_id,
            call,
        };
        Some(ClientCommand::AcceptCall(signal))
    }

    pub fn decline(&mut self) -> Option<ClientCommand> {
        match std::mem::replace(&mut self.state, CallState::Idle) {
            CallState::Ringing {
                conversation_id, ..
            } => Some(ClientCommand::DeclineCall(CallSignal {
                conversation: conversation_id,
                call: None,
            })),
            other => {
                self.state = other;
                None
            }
        }
    }

    pub fn end(&mut self) -> Option<ClientCommand> {
        match std::mem::replace(&mut self.state, CallState::Idle) {
            CallState::Active {
                conversation_id, ..
            } => Some(ClientCommand::EndCall(CallSignal {
                conversation: conversation_id,
                call: None,
            })),
            other => {
                self.state = other;
                None
            }
        }
    }
}
