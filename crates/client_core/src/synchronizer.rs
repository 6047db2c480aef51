use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use shared::{
    domain::{CallId, Conversation, ConversationId, Message, MessageId, User, UserId},
    protocol::{
        CallPayload, ClientCommand, ConversationPayload, ConversationUpdatePayload,
        MarkAsReadCommand, MessageCreatedCommand, MessagePayload, MessageReadPayload,
        NewMessagePayload, ServerEvent, TypingCommand, TypingPayload,
    },
};
use tokio::{sync::broadcast, time::Instant};
use tracing::{debug, info, warn};

use crate::{
    calls::{CallState, CallTracker},
    conversation_list::{ConversationList, ConversationUpdate, NewMessageOutcome},
    error::{ClientError, ClientResult},
    message_log::{LoadState, MessageLog},
    realtime::{ChannelEvent, ChannelState, CommandSink},
    typing::{TypingDebouncer, TypingSignal},
};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// Change notifications for front ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    ConversationsChanged,
    MessagesChanged {
        conversation_id: ConversationId,
    },
    HistoryLoading {
        conversation_id: ConversationId,
    },
    HistoryLoaded {
        conversation_id: ConversationId,
        count: usize,
    },
    SendFailed {
        temp_id: MessageId,
        error: String,
    },
    TypingChanged {
        conversation_id: ConversationId,
        user_id: UserId,
        is_typing: bool,
    },
    IncomingCall {
        conversation_id: ConversationId,
        initiator: User,
    },
    CallEnded {
        conversation_id: ConversationId,
    },
    ChannelState(ChannelState),
    Notice {
        level: NoticeLevel,
        message: String,
    },
}

/// Identifies one history request; results carrying an outdated generation are dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryTicket {
    pub conversation_id: ConversationId,
    generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConversationsTicket {
    generation: u64,
}

/// An optimistic entry waiting for its REST confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSend {
    pub temp_id: MessageId,
    pub conversation_id: ConversationId,
    pub content: String,
    optimistic: Message,
}

/// REST work a channel event asks the caller to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FollowUp {
    RefreshConversations(ConversationsTicket),
    ReloadHistory(HistoryTicket),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSnapshot {
    pub conversations: Vec<Conversation>,
    pub active_conversation: Option<ConversationId>,
    pub load_state: LoadState,
    pub messages: Vec<Message>,
    pub typing: Vec<UserId>,
    pub call: CallState,
    pub channel_state: ChannelState,
}

/// Single writer of the message log and the conversation list.
pub struct Synchronizer {
    me: User,
    commands: Arc<dyn CommandSink>,
    log: MessageLog,
    conversations: ConversationList,
    typing: TypingDebouncer,
    typing_users: HashMap<ConversationId, BTreeSet<UserId>>,
    calls: CallTracker,
    channel_state: ChannelState,
    history_generation: u64,
    conversations_generation: u64,
    events: broadcast::Sender<SyncEvent>,
}

impl Synchronizer {
    pub fn new(me: User, commands: Arc<dyn CommandSink>, typing_idle: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            me,
            commands,
            log: MessageLog::new(),
            conversations: ConversationList::new(),
            typing: TypingDebouncer::new(typing_idle),
            typing_users: HashMap::new(),
            calls: CallTracker::default(),
            channel_state: ChannelState::Connecting,
            history_generation: 0,
            conversations_generation: 0,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub(crate) fn event_sender(&self) -> broadcast::Sender<SyncEvent> {
        self.events.clone()
    }

    pub fn me(&self) -> &User {
        &self.me
    }

    pub fn log(&self) -> &MessageLog {
        &self.log
    }

    pub fn conversations(&self) -> &ConversationList {
        &self.conversations
    }

    pub fn active_conversation(&self) -> Option<&ConversationId> {
        self.log.conversation_id()
    }

    pub fn call_state(&self) -> &CallState {
        self.calls.state()
    }

    pub fn typing_users(&self, conversation_id: &ConversationId) -> Vec<UserId> {
        self.typing_users
            .get(conversation_id)
            .map(|users| users.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> SyncSnapshot {
        SyncSnapshot {
            conversations: self.conversations.conversations().to_vec(),
            active_conversation: self.active_conversation().cloned(),
            load_state: self.log.state(),
            messages: self.log.messages().to_vec(),
            typing: self
                .active_conversation()
                .map(|id| self.typing_users(id))
                .unwrap_or_default(),
            call: self.calls.state().clone(),
            channel_state: self.channel_state,
        }
    }

    /// Opens `conversation_id`. Returns the history request to run, or `None` when it is
    /// already the active conversation.
    pub fn select_conversation(&mut self, conversation_id: ConversationId) -> Option<HistoryTicket> {
        if self.active_conversation() == Some(&conversation_id) {
            return None;
        }
        self.stop_typing();
        if let Some(previous) = self.active_conversation().cloned() {
            self.emit(ClientCommand::LeaveConversation(previous));
        }
        self.emit(ClientCommand::JoinConversation(conversation_id.clone()));

        self.history_generation += 1;
        self.log.reset(conversation_id.clone());
        info!(conversation_id = %conversation_id, generation = self.history_generation, "selected conversation");
        self.notify(SyncEvent::HistoryLoading {
            conversation_id: conversation_id.clone(),
        });
        Some(HistoryTicket {
            conversation_id,
            generation: self.history_generation,
        })
    }

    /// Commits a history response unless a newer selection superseded it.
    pub fn apply_history(&mut self, ticket: HistoryTicket, result: ClientResult<Vec<Message>>) -> bool {
        if ticket.generation != self.history_generation
            || self.active_conversation() != Some(&ticket.conversation_id)
        {
            debug!(
                conversation_id = %ticket.conversation_id,
                generation = ticket.generation,
                current = self.history_generation,
                "discarding stale history response"
            );
            return false;
        }

        let conversation_id = ticket.conversation_id;
        match result {
            Ok(history) => {
                self.log.load(conversation_id.clone(), history);
                self.mark_active_read();
                self.notify(SyncEvent::HistoryLoaded {
                    conversation_id: conversation_id.clone(),
                    count: self.log.messages().len(),
                });
            }
            Err(err) => {
                warn!(conversation_id = %conversation_id, error = %err, "history request failed");
                // Leave the loading state with whatever arrived live.
                self.log.load(conversation_id.clone(), Vec::new());
                self.notice(NoticeLevel::Error, format!("could not load messages: {err}"));
            }
        }
        self.notify(SyncEvent::MessagesChanged { conversation_id });
        true
    }

    pub fn close_conversation(&mut self) {
        let Some(conversation_id) = self.active_conversation().cloned() else {
            return;
        };
        self.stop_typing();
        self.emit(ClientCommand::LeaveConversation(conversation_id.clone()));
        self.history_generation += 1;
        self.conversations.forget(&conversation_id);
        self.typing_users.remove(&conversation_id);
        self.log.clear();
        self.notify(SyncEvent::MessagesChanged { conversation_id });
    }

    /// Appends the optimistic entry for `content` in the active conversation.
    pub fn begin_send(&mut self, content: &str) -> ClientResult<PendingSend> {
        let optimistic = self.log.append_optimistic(&self.me, content, Utc::now())?;
        self.stop_typing();
        self.conversations.record_local_send(&optimistic);
        self.notify(SyncEvent::MessagesChanged {
            conversation_id: optimistic.conversation_id.clone(),
        });
        self.notify(SyncEvent::ConversationsChanged);
        Ok(PendingSend {
            temp_id: optimistic.id.clone(),
            conversation_id: optimistic.conversation_id.clone(),
            content: optimistic.content.clone(),
            optimistic,
        })
    }

    /// Settles a send. `messageCreated` is relayed either way; a failure leaves the entry
    /// visible as failed.
    pub fn complete_send(&mut self, pending: PendingSend, result: ClientResult<Message>) {
        let PendingSend {
            temp_id,
            conversation_id,
            optimistic,
            ..
        } = pending;
        let is_open = self.active_conversation() == Some(&conversation_id);

        match result {
            Ok(confirmed) => {
                if is_open {
                    self.log
                        .confirm_optimistic(&temp_id, confirmed.clone(), &self.me.id);
                    self.notify(SyncEvent::MessagesChanged {
                        conversation_id: conversation_id.clone(),
                    });
                }
                if self.conversations.record_local_send(&confirmed) {
                    self.notify(SyncEvent::ConversationsChanged);
                }
                self.emit_message_created(&conversation_id, &confirmed);
            }
            Err(err) => {
                warn!(conversation_id = %conversation_id, temp_id = %temp_id, error = %err, "send failed");
                if is_open && self.log.mark_failed(&temp_id) {
                    self.notify(SyncEvent::MessagesChanged {
                        conversation_id: conversation_id.clone(),
                    });
                }
                self.emit_message_created(&conversation_id, &optimistic);
                self.notify(SyncEvent::SendFailed {
                    temp_id,
                    error: err.to_string(),
                });
                self.notice(NoticeLevel::Error, format!("message not sent: {err}"));
            }
        }
    }

    /// Puts a failed entry back in flight.
    pub fn retry_send(&mut self, temp_id: &MessageId) -> ClientResult<PendingSend> {
        let Some(optimistic) = self.log.retry(temp_id) else {
            return Err(ClientError::validation(format!(
                "no failed message {temp_id} to retry"
            )));
        };
        self.notify(SyncEvent::MessagesChanged {
            conversation_id: optimistic.conversation_id.clone(),
        });
        Ok(PendingSend {
            temp_id: optimistic.id.clone(),
            conversation_id: optimistic.conversation_id.clone(),
            content: optimistic.content.clone(),
            optimistic,
        })
    }

    pub fn begin_conversations_refresh(&mut self) -> ConversationsTicket {
        self.conversations_generation += 1;
        ConversationsTicket {
            generation: self.conversations_generation,
        }
    }

    pub fn apply_conversations(
        &mut self,
        ticket: ConversationsTicket,
        result: ClientResult<Vec<Conversation>>,
    ) -> bool {
        if ticket.generation != self.conversations_generation {
            debug!(
                generation = ticket.generation,
                current = self.conversations_generation,
                "discarding stale conversation list"
            );
            return false;
        }
        match result {
            Ok(conversations) => {
                self.conversations.load_all(conversations);
                if let Some(open) = self.active_conversation().cloned() {
                    self.conversations.mark_read(&open);
                }
                self.notify(SyncEvent::ConversationsChanged);
            }
            Err(err) => {
                warn!(error = %err, "conversation list request failed");
                self.notice(NoticeLevel::Error, format!("could not load conversations: {err}"));
            }
        }
        true
    }

    /// Marks everything in the open conversation read.
    pub fn mark_conversation_read(&mut self) {
        if self.active_conversation().is_some() {
            self.mark_active_read();
        }
    }

    pub fn keystroke(&mut self, now: Instant, draft: &str) {
        let Some(conversation_id) = self.active_conversation().cloned() else {
            return;
        };
        for signal in self
            .typing
            .keystroke(&conversation_id, !draft.trim().is_empty(), now)
        {
            self.emit_typing(signal);
        }
    }

    pub fn typing_tick(&mut self, now: Instant) {
        if let Some(signal) = self.typing.poll(now) {
            self.emit_typing(signal);
        }
    }

    pub fn typing_deadline(&self) -> Option<Instant> {
        self.typing.deadline()
    }

    pub fn call_started(&mut self, conversation_id: ConversationId, call: CallPayload) {
        let command = self.calls.start(conversation_id, call);
        self.emit(command);
    }

    /// Answers the ringing call. Returns its id for the REST join.
    pub fn call_accepted(&mut self) -> Option<CallId> {
        let call_id = self.calls.call_id().cloned();
        let command = self.calls.accept()?;
        self.emit(command);
        call_id
    }

    pub fn call_declined(&mut self) -> Option<CallId> {
        let call_id = self.calls.call_id().cloned();
        let conversation_id = self.calls.conversation_id().cloned();
        let command = self.calls.decline()?;
        self.emit(command);
        if let Some(conversation_id) = conversation_id {
            self.notify(SyncEvent::CallEnded { conversation_id });
        }
        call_id
    }

    pub fn call_ended(&mut self) -> Option<CallId> {
        let call_id = self.calls.call_id().cloned();
        let conversation_id = self.calls.conversation_id().cloned();
        let command = self.calls.end()?;
        self.emit(command);
        if let Some(conversation_id) = conversation_id {
            self.notify(SyncEvent::CallEnded { conversation_id });
        }
        call_id
    }

    /// Routes one realtime event into the stores.
    pub fn handle_channel_event(&mut self, event: ChannelEvent) -> Vec<FollowUp> {
        match event {
            ChannelEvent::Server(event) => self.handle_server_event(event),
            ChannelEvent::Authenticated { resumed } => self.handle_authenticated(resumed),
            ChannelEvent::StateChanged(state) => {
                self.channel_state = state;
                self.notify(SyncEvent::ChannelState(state));
                match state {
                    ChannelState::Disconnected => self.notice(
                        NoticeLevel::Warning,
                        "realtime connection lost, retrying".to_string(),
                    ),
                    ChannelState::Closed => self.notice(
                        NoticeLevel::Warning,
                        "realtime updates unavailable, use refresh to update".to_string(),
                    ),
                    ChannelState::Connecting | ChannelState::Authenticated => {}
                }
                Vec::new()
            }
            ChannelEvent::Error(message) => {
                warn!(error = %message, "realtime channel error");
                self.notice(NoticeLevel::Warning, message);
                Vec::new()
            }
        }
    }

    fn handle_authenticated(&mut self, resumed: bool) -> Vec<FollowUp> {
        if !resumed {
            return Vec::new();
        }
        let mut follow_ups = vec![FollowUp::RefreshConversations(
            self.begin_conversations_refresh(),
        )];
        if let Some(active) = self.active_conversation().cloned() {
            info!(conversation_id = %active, "rejoining conversation after reconnect");
            self.emit(ClientCommand::JoinConversation(active.clone()));
            self.history_generation += 1;
            follow_ups.push(FollowUp::ReloadHistory(HistoryTicket {
                conversation_id: active,
                generation: self.history_generation,
            }));
        }
        follow_ups
    }

    fn handle_server_event(&mut self, event: ServerEvent) -> Vec<FollowUp> {
        match event {
            ServerEvent::NewConversation(payload) | ServerEvent::NewGroup(payload) => {
                self.on_conversation_created(payload);
            }
            ServerEvent::GroupUpdated(payload) => {
                if self
                    .conversations
                    .apply_group_update(payload.into_conversation(Utc::now()))
                {
                    self.notify(SyncEvent::ConversationsChanged);
                }
            }
            ServerEvent::ConversationUpdate(payload) => self.on_conversation_update(payload),
            ServerEvent::NewMessage(payload) => return self.on_new_message(payload),
            ServerEvent::UserTyping(payload) => self.on_user_typing(payload),
            ServerEvent::MessageRead(payload) => self.on_message_read(payload),
            ServerEvent::IncomingCall(payload) => {
                if !self.conversations.contains(&payload.conversation) {
                    debug!(conversation_id = %payload.conversation, "incoming call for unknown conversation");
                    return Vec::new();
                }
                let conversation_id = payload.conversation.clone();
                let initiator = payload.initiator.clone();
                if self.calls.incoming(payload, &self.me.id) {
                    self.notify(SyncEvent::IncomingCall {
                        conversation_id,
                        initiator,
                    });
                }
            }
            ServerEvent::CallEnded(payload) => {
                if self.calls.remote_ended(&payload.conversation) {
                    self.notify(SyncEvent::CallEnded {
                        conversation_id: payload.conversation,
                    });
                }
            }
            ServerEvent::Authenticated(_) => {}
        }
        Vec::new()
    }

    fn on_conversation_created(&mut self, payload: ConversationPayload) {
        let conversation = payload.into_conversation(Utc::now());
        if self.conversations.upsert_created(conversation) {
            self.notify(SyncEvent::ConversationsChanged);
        }
    }

    fn on_conversation_update(&mut self, payload: ConversationUpdatePayload) {
        let ConversationUpdatePayload {
            conversation_id,
            last_message,
            last_activity,
            unread_count,
        } = payload;
        let last_message = last_message.and_then(|message| {
            normalize(message, &conversation_id, Utc::now())
        });
        let changed = self.conversations.apply_conversation_update(ConversationUpdate {
            conversation_id: conversation_id.clone(),
            last_message,
            last_activity,
            unread_count,
        });
        if self.active_conversation() == Some(&conversation_id) {
            self.conversations.mark_read(&conversation_id);
        }
        if changed {
            self.notify(SyncEvent::ConversationsChanged);
        }
    }

    fn on_new_message(&mut self, payload: NewMessagePayload) -> Vec<FollowUp> {
        if payload.message.id.is_temporary() {
            debug!(message_id = %payload.message.id, "ignoring relay of an unpersisted message");
            return Vec::new();
        }
        let Some(message) = normalize(payload.message, &payload.conversation, Utc::now()) else {
            return Vec::new();
        };
        let conversation_id = message.conversation_id.clone();
        let is_open = self.active_conversation() == Some(&conversation_id);

        if is_open {
            if self
                .log
                .reconcile_incoming(message.clone(), &self.me.id)
                .changed()
            {
                self.notify(SyncEvent::MessagesChanged {
                    conversation_id: conversation_id.clone(),
                });
            }
            if message.sender_id != self.me.id && !message.is_read_by(&self.me.id) {
                self.emit(ClientCommand::MarkAsRead(MarkAsReadCommand {
                    conversation_id: conversation_id.clone(),
                    message_id: message.id.clone(),
                }));
                self.log
                    .mark_read(&message.id, &self.me.id, Some(Utc::now()));
            }
        }
        self.clear_typing(&conversation_id, &message.sender_id);

        match self
            .conversations
            .apply_new_message(&message, &self.me.id, is_open)
        {
            NewMessageOutcome::UnknownConversation => {
                debug!(conversation_id = %conversation_id, "message for unknown conversation, refreshing list");
                vec![FollowUp::RefreshConversations(
                    self.begin_conversations_refresh(),
                )]
            }
            NewMessageOutcome::Updated { .. } => {
                self.notify(SyncEvent::ConversationsChanged);
                Vec::new()
            }
            NewMessageOutcome::AlreadyApplied => Vec::new(),
        }
    }

    fn on_user_typing(&mut self, payload: TypingPayload) {
        let Some(conversation_id) = payload
            .conversation_id
            .or_else(|| self.active_conversation().cloned())
        else {
            return;
        };
        if payload.user_id == self.me.id {
            return;
        }
        let users = self.typing_users.entry(conversation_id.clone()).or_default();
        let changed = if payload.is_typing {
            users.insert(payload.user_id.clone())
        } else {
            users.remove(&payload.user_id)
        };
        if changed {
            self.notify(SyncEvent::TypingChanged {
                conversation_id,
                user_id: payload.user_id,
                is_typing: payload.is_typing,
            });
        }
    }

    fn on_message_read(&mut self, payload: MessageReadPayload) {
        let Some(active) = self.active_conversation().cloned() else {
            return;
        };
        if payload
            .conversation_id
            .as_ref()
            .is_some_and(|conversation_id| conversation_id != &active)
        {
            return;
        }
        if self
            .log
            .mark_read(&payload.message_id, &payload.user_id, payload.read_at)
        {
            self.notify(SyncEvent::MessagesChanged {
                conversation_id: active,
            });
        }
    }

    fn mark_active_read(&mut self) {
        let Some(conversation_id) = self.active_conversation().cloned() else {
            return;
        };
        let now = Utc::now();
        for message_id in self.log.unread_from_others(&self.me.id) {
            self.emit(ClientCommand::MarkAsRead(MarkAsReadCommand {
                conversation_id: conversation_id.clone(),
                message_id: message_id.clone(),
            }));
            self.log.mark_read(&message_id, &self.me.id, Some(now));
        }
        if self.conversations.mark_read(&conversation_id) {
            self.notify(SyncEvent::ConversationsChanged);
        }
    }

    fn clear_typing(&mut self, conversation_id: &ConversationId, user_id: &UserId) {
        let removed = self
            .typing_users
            .get_mut(conversation_id)
            .is_some_and(|users| users.remove(user_id));
        if removed {
            self.notify(SyncEvent::TypingChanged {
                conversation_id: conversation_id.clone(),
                user_id: user_id.clone(),
                is_typing: false,
            });
        }
    }

    fn stop_typing(&mut self) {
        if let Some(signal) = self.typing.flush() {
            self.emit_typing(signal);
        }
    }

    fn emit_typing(&self, signal: TypingSignal) {
        let is_typing = signal.is_typing();
        self.emit(ClientCommand::Typing(TypingCommand {
            conversation_id: signal.conversation_id().clone(),
            is_typing,
        }));
    }

    fn emit_message_created(&self, conversation_id: &ConversationId, message: &Message) {
        self.emit(ClientCommand::MessageCreated(MessageCreatedCommand {
            conversation_id: conversation_id.clone(),
            message: MessagePayload::from_message(message),
        }));
    }

    fn emit(&self, command: ClientCommand) {
        self.commands.emit(command);
    }

    fn notice(&self, level: NoticeLevel, message: String) {
        self.notify(SyncEvent::Notice { level, message });
    }

    fn notify(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

fn normalize(
    payload: MessagePayload,
    conversation_id: &ConversationId,
    received_at: DateTime<Utc>,
) -> Option<Message> {
    match payload.into_message(Some(conversation_id), received_at) {
        Ok(message) => Some(message),
        Err(err) => {
            warn!(conversation_id = %conversation_id, error = %err, "skipping malformed message payload");
            None
        }
    }
}

#[cfg(test)]
#[path = "tests/synchronizer_tests.rs"]
mod tests;
