use std::sync::Arc;

use futures::StreamExt;
use shared::{
    domain::{CallId, CallKind, Conversation, ConversationId, Message, MessageId},
    protocol::{CallPayload, ClientCommand},
};
use tokio::{
    sync::{broadcast, mpsc, oneshot},
    time::{sleep_until, Instant},
};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{debug, info, warn};

use crate::{
    api::ChatBackend,
    config::ClientSettings,
    error::{ClientError, ClientResult},
    realtime::{ChannelEvent, CommandSink, RealtimeHandle},
    session::Session,
    synchronizer::{
        ConversationsTicket, FollowUp, HistoryTicket, NoticeLevel, PendingSend, SyncEvent,
        SyncSnapshot, Synchronizer,
    },
};

enum SyncCommand {
    Select(ConversationId),
    Close,
    Send {
        content: String,
        reply: oneshot::Sender<ClientResult<MessageId>>,
    },
    Retry {
        temp_id: MessageId,
        reply: oneshot::Sender<ClientResult<MessageId>>,
    },
    Keystroke(String),
    MarkRead,
    Refresh,
    StartCall {
        conversation_id: ConversationId,
        kind: CallKind,
    },
    AcceptCall,
    DeclineCall,
    EndCall,
    Snapshot(oneshot::Sender<SyncSnapshot>),
    Shutdown,
}

enum Completion {
    History(HistoryTicket, ClientResult<Vec<Message>>),
    Conversations(ConversationsTicket, ClientResult<Vec<Conversation>>),
    Sent(PendingSend, ClientResult<Message>),
    CallCreated(ConversationId, ClientResult<CallPayload>),
    CallAction(&'static str, ClientResult<()>),
}

/// Forwards synchronizer commands to the session's channel.
struct ChannelSink(Arc<dyn RealtimeHandle>);

impl CommandSink for ChannelSink {
    fn emit(&self, command: ClientCommand) {
        self.0.emit(command);
    }
}

pub struct SyncEngine {
    core: Synchronizer,
    backend: Arc<dyn ChatBackend>,
    session: Session,
    completions: mpsc::UnboundedSender<Completion>,
}

impl SyncEngine {
    /// Starts the task that owns the stores for `session` and returns its handle.
    pub fn spawn(
        backend: Arc<dyn ChatBackend>,
        session: Session,
        channel: Arc<dyn RealtimeHandle>,
        settings: &ClientSettings,
    ) -> SyncHandle {
        let channel_events = BroadcastStream::new(channel.subscribe());
        let initial_state = channel.state();
        let core = Synchronizer::new(
            session.user.clone(),
            Arc::new(ChannelSink(channel)),
            settings.typing_idle(),
        );
        let events = core.event_sender();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();

        let mut engine = SyncEngine {
            core,
            backend,
            session,
            completions: completion_tx,
        };
        engine.on_channel_event(ChannelEvent::StateChanged(initial_state));
        let ticket = engine.core.begin_conversations_refresh();
        engine.fetch_conversations(ticket);

        tokio::spawn(engine.run(command_rx, completion_rx, channel_events));
        SyncHandle {
            commands: command_tx,
            events,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<SyncCommand>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
        mut channel_events: BroadcastStream<ChannelEvent>,
    ) {
        info!(user_id = %self.session.user_id(), "synchronizer started");
        let mut channel_open = true;
        loop {
            let typing_deadline = self.core.typing_deadline();
            tokio::select! {
                command = commands.recv() => match command {
                    Some(SyncCommand::Shutdown) | None => break,
                    Some(command) => self.on_command(command),
                },
                Some(completion) = completions.recv() => self.on_completion(completion),
                event = channel_events.next(), if channel_open => match event {
                    Some(Ok(event)) => self.on_channel_event(event),
                    Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                        warn!(skipped, "synchronizer fell behind the realtime channel, refreshing");
                        let ticket = self.core.begin_conversations_refresh();
                        self.fetch_conversations(ticket);
                    }
                    None => {
                        debug!("realtime channel dropped");
                        channel_open = false;
                    }
                },
                _ = sleep_until(typing_deadline.unwrap_or_else(Instant::now)), if typing_deadline.is_some() => {
                    self.core.typing_tick(Instant::now());
                }
            }
        }
        self.core.close_conversation();
        info!("synchronizer stopped");
    }

    fn on_command(&mut self, command: SyncCommand) {
        match command {
            SyncCommand::Select(conversation_id) => {
                if let Some(ticket) = self.core.select_conversation(conversation_id) {
                    self.fetch_history(ticket);
                }
            }
            SyncCommand::Close => self.core.close_conversation(),
            SyncCommand::Send { content, reply } => {
                let result = self.core.begin_send(&content).map(|pending| {
                    let temp_id = pending.temp_id.clone();
                    self.deliver(pending);
                    temp_id
                });
                let _ = reply.send(result);
            }
            SyncCommand::Retry { temp_id, reply } => {
                let result = self.core.retry_send(&temp_id).map(|pending| {
                    let temp_id = pending.temp_id.clone();
                    self.deliver(pending);
                    temp_id
                });
                let _ = reply.send(result);
            }
            SyncCommand::Keystroke(draft) => self.core.keystroke(Instant::now(), &draft),
            SyncCommand::MarkRead => self.core.mark_conversation_read(),
            SyncCommand::Refresh => {
                let ticket = self.core.begin_conversations_refresh();
                self.fetch_conversations(ticket);
            }
            SyncCommand::StartCall {
                conversation_id,
                kind,
            } => self.create_call(conversation_id, kind),
            SyncCommand::AcceptCall => {
                if let Some(call_id) = self.core.call_accepted() {
                    self.call_action("join", call_id);
                }
            }
            SyncCommand::DeclineCall => {
                if let Some(call_id) = self.core.call_declined() {
                    self.call_action("decline", call_id);
                }
            }
            SyncCommand::EndCall => {
                if let Some(call_id) = self.core.call_ended() {
                    self.call_action("end", call_id);
                }
            }
            SyncCommand::Snapshot(reply) => {
                let _ = reply.send(self.core.snapshot());
            }
            SyncCommand::Shutdown => {}
        }
    }

    fn on_completion(&mut self, completion: Completion) {
        match completion {
            Completion::History(ticket, result) => {
                self.core.apply_history(ticket, result);
            }
            Completion::Conversations(ticket, result) => {
                self.core.apply_conversations(ticket, result);
            }
            Completion::Sent(pending, result) => self.core.complete_send(pending, result),
            Completion::CallCreated(conversation_id, result) => match result {
                Ok(call) => self.core.call_started(conversation_id, call),
                Err(err) => self.notice(format!("could not start call: {err}")),
            },
            Completion::CallAction(action, result) => {
                if let Err(err) = result {
                    warn!(action, error = %err, "call request failed");
                    self.notice(format!("call {action} failed: {err}"));
                }
            }
        }
    }

    fn on_channel_event(&mut self, event: ChannelEvent) {
        for follow_up in self.core.handle_channel_event(event) {
            match follow_up {
                FollowUp::RefreshConversations(ticket) => self.fetch_conversations(ticket),
                FollowUp::ReloadHistory(ticket) => self.fetch_history(ticket),
            }
        }
    }

    fn fetch_history(&self, ticket: HistoryTicket) {
        let backend = Arc::clone(&self.backend);
        let session = self.session.clone();
        let completions = self.completions.clone();
        tokio::spawn(async move {
            let result = backend
                .fetch_history(&session, &ticket.conversation_id)
                .await;
            let _ = completions.send(Completion::History(ticket, result));
        });
    }

    fn fetch_conversations(&self, ticket: ConversationsTicket) {
        let backend = Arc::clone(&self.backend);
        let session = self.session.clone();
        let completions = self.completions.clone();
        tokio::spawn(async move {
            let result = backend.list_conversations(&session).await;
            let _ = completions.send(Completion::Conversations(ticket, result));
        });
    }

    fn deliver(&self, pending: PendingSend) {
        let backend = Arc::clone(&self.backend);
        let session = self.session.clone();
        let completions = self.completions.clone();
        tokio::spawn(async move {
            let result = backend
                .send_message(&session, &pending.conversation_id, &pending.content)
                .await;
            let _ = completions.send(Completion::Sent(pending, result));
        });
    }

    fn create_call(&self, conversation_id: ConversationId, kind: CallKind) {
        let backend = Arc::clone(&self.backend);
        let session = self.session.clone();
        let completions = self.completions.clone();
        tokio::spawn(async move {
            let result = backend.create_call(&session, &conversation_id, kind).await;
            let _ = completions.send(Completion::CallCreated(conversation_id, result));
        });
    }

    fn call_action(&self, action: &'static str, call_id: CallId) {
        let backend = Arc::clone(&self.backend);
        let session = self.session.clone();
        let completions = self.completions.clone();
        tokio::spawn(async move {
            let result = match action {
                "join" => backend.join_call(&session, &call_id).await.map(|_| ()),
                "decline" => backend.decline_call(&session, &call_id).await,
                _ => backend.end_call(&session, &call_id).await,
            };
            let _ = completions.send(Completion::CallAction(action, result));
        });
    }

    fn notice(&self, message: String) {
        let _ = self.core.event_sender().send(SyncEvent::Notice {
            level: NoticeLevel::Error,
            message,
        });
    }
}

/// Cloneable front-end handle to a running [`SyncEngine`].
#[derive(Clone)]
pub struct SyncHandle {
    commands: mpsc::UnboundedSender<SyncCommand>,
    events: broadcast::Sender<SyncEvent>,
}

impl SyncHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn select(&self, conversation_id: ConversationId) -> ClientResult<()> {
        self.submit(SyncCommand::Select(conversation_id))
    }

    pub fn close(&self) -> ClientResult<()> {
        self.submit(SyncCommand::Close)
    }

    /// Sends `content` to the open conversation. Resolves to the temporary id once the
    /// optimistic entry is in the log; delivery is reported through events.
    pub async fn send(&self, content: impl Into<String>) -> ClientResult<MessageId> {
        let (reply, response) = oneshot::channel();
        self.submit(SyncCommand::Send {
            content: content.into(),
            reply,
        })?;
        response.await.map_err(|_| stopped())?
    }

    pub async fn retry(&self, temp_id: MessageId) -> ClientResult<MessageId> {
        let (reply, response) = oneshot::channel();
        self.submit(SyncCommand::Retry { temp_id, reply })?;
        response.await.map_err(|_| stopped())?
    }

    pub fn keystroke(&self, draft: impl Into<String>) -> ClientResult<()> {
        self.submit(SyncCommand::Keystroke(draft.into()))
    }

    pub fn mark_read(&self) -> ClientResult<()> {
        self.submit(SyncCommand::MarkRead)
    }

    pub fn refresh(&self) -> ClientResult<()> {
        self.submit(SyncCommand::Refresh)
    }

    pub fn start_call(&self, conversation_id: ConversationId, kind: CallKind) -> ClientResult<()> {
        self.submit(SyncCommand::StartCall {
            conversation_id,
            kind,
        })
    }

    pub fn accept_call(&self) -> ClientResult<()> {
        self.submit(SyncCommand::AcceptCall)
    }

    pub fn decline_call(&self) -> ClientResult<()> {
        self.submit(SyncCommand::DeclineCall)
    }

    pub fn end_call(&self) -> ClientResult<()> {
        self.submit(SyncCommand::EndCall)
    }

    pub async fn snapshot(&self) -> ClientResult<SyncSnapshot> {
        let (reply, response) = oneshot::channel();
        self.submit(SyncCommand::Snapshot(reply))?;
        response.await.map_err(|_| stopped())
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(SyncCommand::Shutdown);
    }

    fn submit(&self, command: SyncCommand) -> ClientResult<()> {
        self.commands.send(command).map_err(|_| stopped())
    }
}

fn stopped() -> ClientError {
    ClientError::Connection("synchronizer stopped".into())
}

#[cfg(test)]
#[path = "tests/engine_tests.rs"]
mod tests;
