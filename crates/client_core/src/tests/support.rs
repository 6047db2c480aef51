use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use chrono::{DateTime, TimeZone, Utc};
use shared::{
    domain::{
        Conversation, ConversationId, ConversationKind, DeliveryStatus, Message, MessageId, User,
        UserId,
    },
    protocol::{ClientCommand, EventKind, ServerEvent},
};
use tokio::sync::broadcast;

use crate::{
    realtime::{
        ChannelEvent, ChannelState, CommandSink, EventHandler, HandlerId, HandlerRegistry,
        RealtimeHandle,
    },
    session::{ChannelFactory, Session},
};

pub(crate) fn ts(seconds: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap() + chrono::Duration::seconds(seconds)
}

pub(crate) fn server_message(
    id: &str,
    conversation: &str,
    sender: &str,
    content: &str,
    at: DateTime<Utc>,
) -> Message {
    Message {
        id: MessageId::new(id),
        conversation_id: ConversationId::new(conversation),
        sender_id: UserId::new(sender),
        sender_name: None,
        content: content.into(),
        created_at: at,
        read_by: Vec::new(),
        is_guest: false,
        status: DeliveryStatus::Sent,
    }
}

pub(crate) fn private_conversation(id: &str, me: &str, other: &str) -> Conversation {
    Conversation {
        id: ConversationId::new(id),
        kind: ConversationKind::Private,
        participants: vec![User::new(me, "Me"), User::new(other, "Other")],
        group: None,
        last_message: None,
        unread_count: 0,
        last_activity: None,
    }
}

pub(crate) fn registered_session(user_id: &str) -> Session {
    Session::registered(User::new(user_id, "Ana"), format!("token-{user_id}"))
}

/// In-memory channel that records emitted commands and lets tests inject events.
pub(crate) struct RecordingChannel {
    commands: Mutex<Vec<ClientCommand>>,
    events: broadcast::Sender<ChannelEvent>,
    handlers: HandlerRegistry,
    state: Mutex<ChannelState>,
    closed: AtomicBool,
}

impl RecordingChannel {
    pub(crate) fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            commands: Mutex::new(Vec::new()),
            events,
            handlers: HandlerRegistry::default(),
            state: Mutex::new(ChannelState::Authenticated),
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn take_commands(&self) -> Vec<ClientCommand> {
        std::mem::take(&mut *self.commands.lock().expect("commands lock"))
    }

    pub(crate) fn push(&self, event: ChannelEvent) {
        if let ChannelEvent::Server(server) = &event {
            self.handlers.dispatch(server);
        }
        if let ChannelEvent::StateChanged(state) = &event {
            *self.state.lock().expect("state lock") = *state;
        }
        let _ = self.events.send(event);
    }

    pub(crate) fn push_server(&self, event: ServerEvent) {
        self.push(ChannelEvent::Server(event));
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl CommandSink for RecordingChannel {
    fn emit(&self, command: ClientCommand) {
        self.commands.lock().expect("commands lock").push(command);
    }
}

impl RealtimeHandle for RecordingChannel {
    fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    fn state(&self) -> ChannelState {
        *self.state.lock().expect("state lock")
    }

    fn on(&self, kind: EventKind, handler: EventHandler) -> HandlerId {
        self.handlers.register(kind, handler)
    }

    fn off(&self, id: HandlerId) -> bool {
        self.handlers.remove(id)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        *self.state.lock().expect("state lock") = ChannelState::Closed;
    }
}

#[derive(Default)]
pub(crate) struct RecordingFactory {
    opened: Mutex<Vec<(Session, Arc<RecordingChannel>)>>,
}

impl RecordingFactory {
    pub(crate) fn opened(&self) -> Vec<(Session, Arc<RecordingChannel>)> {
        self.opened.lock().expect("opened lock").clone()
    }
}

impl ChannelFactory for RecordingFactory {
    fn open(&self, session: &Session) -> Arc<dyn RealtimeHandle> {
        let channel = RecordingChannel::new();
        self.opened
            .lock()
            .expect("opened lock")
            .push((session.clone(), Arc::clone(&channel)));
        channel
    }
}
