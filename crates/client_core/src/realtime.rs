use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use futures::{Sink, SinkExt, StreamExt};
use shared::protocol::{ClientCommand, EventKind, ServerEvent};
use tokio::{
    net::TcpStream,
    sync::{broadcast, mpsc, watch},
    time::{sleep_until, Instant},
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, Message as WsMessage},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

use crate::{config::ClientSettings, session::Credential};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Authenticated,
    /// Connection lost; a reconnect is scheduled.
    Disconnected,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Server(ServerEvent),
    /// The backend accepted the credential. `resumed` is set on every acknowledgment after the first.
    Authenticated { resumed: bool },
    StateChanged(ChannelState),
    Error(String),
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    base_delay_ms: u64,
    max_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms,
        }
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let shift = attempt.min(20);
        let multiplier = 1_u64 << shift;
        let calculated = self.base_delay_ms.saturating_mul(multiplier);
        Duration::from_millis(calculated.min(self.max_delay_ms))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(500, 30_000)
    }
}

pub type EventHandler = Arc<dyn Fn(&ServerEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Callbacks registered per inbound event name.
#[derive(Default)]
pub struct HandlerRegistry {
    next_id: AtomicU64,
    handlers: Mutex<Vec<(HandlerId, EventKind, EventHandler)>>,
}

impl HandlerRegistry {
    pub fn register(&self, kind: EventKind, handler: EventHandler) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push((id, kind, handler));
        id
    }

    pub fn remove(&self, id: HandlerId) -> bool {
        let mut handlers = self.lock();
        let before = handlers.len();
        handlers.retain(|(existing, _, _)| *existing != id);
        handlers.len() != before
    }

    /// Runs every handler registered for the event's kind and returns how many ran.
    pub fn dispatch(&self, event: &ServerEvent) -> usize {
        let kind = event.kind();
        let matching: Vec<EventHandler> = self
            .lock()
            .iter()
            .filter(|(_, registered, _)| *registered == kind)
            .map(|(_, _, handler)| Arc::clone(handler))
            .collect();
        for handler in &matching {
            handler(event);
        }
        matching.len()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(HandlerId, EventKind, EventHandler)>> {
        match self.handlers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

pub trait CommandSink: Send + Sync {
    fn emit(&self, command: ClientCommand);
}

pub trait RealtimeHandle: CommandSink {
    fn subscribe(&self) -> broadcast::Receiver<ChannelEvent>;
    fn state(&self) -> ChannelState;
    fn on(&self, kind: EventKind, handler: EventHandler) -> HandlerId;
    fn off(&self, id: HandlerId) -> bool;
    fn close(&self);
}

#[derive(Debug, Clone, Copy)]
pub struct ChannelOptions {
    pub retry: RetryPolicy,
    pub outbound_queue_limit: usize,
}

impl ChannelOptions {
    pub fn from_settings(settings: &ClientSettings) -> Self {
        Self {
            retry: settings.retry_policy(),
            outbound_queue_limit: settings.outbound_queue_limit,
        }
    }
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            outbound_queue_limit: 256,
        }
    }
}

/// Commands held back until the backend acknowledges the credential.
#[derive(Debug)]
pub(crate) struct OutboundQueue {
    limit: usize,
    pending: VecDeque<ClientCommand>,
}

impl OutboundQueue {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            pending: VecDeque::new(),
        }
    }

    /// Appends a command, evicting the oldest one when full.
    pub(crate) fn push(&mut self, command: ClientCommand) -> Option<ClientCommand> {
        let evicted = if self.pending.len() >= self.limit {
            self.pending.pop_front()
        } else {
            None
        };
        if let Some(dropped) = &evicted {
            warn!(
                command = dropped.name(),
                limit = self.limit,
                "realtime outbound queue full, dropping oldest command"
            );
        }
        self.pending.push_back(command);
        evicted
    }

    pub(crate) fn push_front(&mut self, command: ClientCommand) {
        if self.pending.len() >= self.limit {
            self.pending.pop_back();
        }
        self.pending.push_front(command);
    }

    pub(crate) fn pop_front(&mut self) -> Option<ClientCommand> {
        self.pending.pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }
}

/// One websocket per session, kept alive by a supervisor task that reconnects with backoff.
pub struct RealtimeChannel {
    commands: mpsc::UnboundedSender<ClientCommand>,
    events: broadcast::Sender<ChannelEvent>,
    state: watch::Receiver<ChannelState>,
    handlers: Arc<HandlerRegistry>,
    shutdown: watch::Sender<bool>,
}

impl RealtimeChannel {
    /// Spawns the supervisor on the current tokio runtime and returns immediately.
    pub fn connect(
        url: impl Into<String>,
        credential: Credential,
        options: ChannelOptions,
    ) -> Arc<Self> {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(1024);
        let (state_tx, state) = watch::channel(ChannelState::Connecting);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handlers = Arc::new(HandlerRegistry::default());

        let supervisor = Supervisor {
            url: url.into(),
            credential,
            retry: options.retry,
            queue: OutboundQueue::new(options.outbound_queue_limit),
            commands: command_rx,
            events: events.clone(),
            state: state_tx,
            handlers: Arc::clone(&handlers),
            shutdown: shutdown_rx,
            authenticated_once: false,
        };
        tokio::spawn(supervisor.run());

        Arc::new(Self {
            commands,
            events,
            state,
            handlers,
            shutdown,
        })
    }

    /// Resolves once the supervisor has stopped for good.
    pub async fn closed(&self) {
        let mut state = self.state.clone();
        let _ = state
            .wait_for(|current| *current == ChannelState::Closed)
            .await;
    }
}

impl CommandSink for RealtimeChannel {
    fn emit(&self, command: ClientCommand) {
        let name = command.name();
        if self.commands.send(command).is_err() {
            debug!(command = name, "realtime channel closed, command discarded");
        }
    }
}

impl RealtimeHandle for RealtimeChannel {
    fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    fn on(&self, kind: EventKind, handler: EventHandler) -> HandlerId {
        self.handlers.register(kind, handler)
    }

    fn off(&self, id: HandlerId) -> bool {
        self.handlers.remove(id)
    }

    fn close(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl Drop for RealtimeChannel {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

enum SessionOutcome {
    Lost,
    Rejected,
    Shutdown,
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Supervisor {
    url: String,
    credential: Credential,
    retry: RetryPolicy,
    queue: OutboundQueue,
    commands: mpsc::UnboundedReceiver<ClientCommand>,
    events: broadcast::Sender<ChannelEvent>,
    state: watch::Sender<ChannelState>,
    handlers: Arc<HandlerRegistry>,
    shutdown: watch::Receiver<bool>,
    authenticated_once: bool,
}

impl Supervisor {
    async fn run(mut self) {
        let mut attempt: u32 = 0;
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            self.set_state(ChannelState::Connecting);

            let connected = tokio::select! {
                _ = wait_for_shutdown(&mut self.shutdown) => break,
                result = connect_async(self.url.as_str()) => result,
            };
            let outcome = match connected {
                Ok((socket, _)) => {
                    debug!(url = %self.url, "realtime socket connected");
                    self.drive(socket, &mut attempt).await
                }
                Err(err) => {
                    warn!(url = %self.url, error = %err, attempt, "realtime connect failed");
                    self.broadcast(ChannelEvent::Error(format!(
                        "realtime connect failed: {err}"
                    )));
                    SessionOutcome::Lost
                }
            };

            match outcome {
                SessionOutcome::Shutdown | SessionOutcome::Rejected => break,
                SessionOutcome::Lost => {}
            }

            self.set_state(ChannelState::Disconnected);
            let delay = self.retry.delay_for_attempt(attempt);
            attempt = attempt.saturating_add(1);
            info!(delay_ms = delay.as_millis() as u64, attempt, "realtime reconnect scheduled");
            if !self.wait_before_retry(delay).await {
                break;
            }
        }
        self.set_state(ChannelState::Closed);
    }

    async fn drive(&mut self, socket: Socket, attempt: &mut u32) -> SessionOutcome {
        let (mut writer, mut reader) = socket.split();
        let authenticate = self.credential.authentication_command();
        if let Err(err) = send_command(&mut writer, &authenticate).await {
            warn!(error = %err, "failed to send realtime credential");
            return SessionOutcome::Lost;
        }

        let mut authenticated = false;
        loop {
            tokio::select! {
                _ = wait_for_shutdown(&mut self.shutdown) => {
                    let _ = writer.close().await;
                    return SessionOutcome::Shutdown;
                }
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        let _ = writer.close().await;
                        return SessionOutcome::Shutdown;
                    };
                    if command.is_authentication() {
                        debug!("ignoring caller-issued authentication command");
                        continue;
                    }
                    if !authenticated {
                        self.queue.push(command);
                        continue;
                    }
                    if let Err(err) = send_command(&mut writer, &command).await {
                        warn!(command = command.name(), error = %err, "realtime send failed");
                        self.queue.push_front(command);
                        return SessionOutcome::Lost;
                    }
                }
                frame = reader.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        let event = match serde_json::from_str::<ServerEvent>(&text) {
                            Ok(event) => event,
                            Err(err) => {
                                warn!(error = %err, "skipping unrecognized realtime frame");
                                continue;
                            }
                        };
                        self.handlers.dispatch(&event);
                        let ack = match event {
                            ServerEvent::Authenticated(ack) => ack,
                            other => {
                                self.broadcast(ChannelEvent::Server(other));
                                continue;
                            }
                        };
                        if !ack.success {
                            let reason = ack
                                .error
                                .unwrap_or_else(|| "credential rejected".to_string());
                            warn!(reason = %reason, "realtime authentication rejected");
                            self.broadcast(ChannelEvent::Error(format!(
                                "realtime authentication rejected: {reason}"
                            )));
                            let _ = writer.close().await;
                            return SessionOutcome::Rejected;
                        }

                        authenticated = true;
                        *attempt = 0;
                        let resumed = self.authenticated_once;
                        self.authenticated_once = true;
                        self.set_state(ChannelState::Authenticated);
                        info!(resumed, queued = self.queue.len(), "realtime channel authenticated");
                        self.broadcast(ChannelEvent::Authenticated { resumed });

                        while let Some(command) = self.queue.pop_front() {
                            if let Err(err) = send_command(&mut writer, &command).await {
                                warn!(command = command.name(), error = %err, "realtime flush failed");
                                self.queue.push_front(command);
                                return SessionOutcome::Lost;
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        info!("realtime socket closed by peer");
                        return SessionOutcome::Lost;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(error = %err, "realtime receive failed");
                        return SessionOutcome::Lost;
                    }
                },
            }
        }
    }

    /// Sleeps out the backoff while still accepting commands. Returns false on shutdown.
    async fn wait_before_retry(&mut self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = sleep_until(deadline) => return true,
                _ = wait_for_shutdown(&mut self.shutdown) => return false,
                command = self.commands.recv() => match command {
                    Some(command) if command.is_authentication() => {}
                    Some(command) => {
                        self.queue.push(command);
                    }
                    None => return false,
                },
            }
        }
    }

    fn set_state(&self, next: ChannelState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            self.broadcast(ChannelEvent::StateChanged(next));
        }
    }

    fn broadcast(&self, event: ChannelEvent) {
        let _ = self.events.send(event);
    }
}

async fn send_command<S>(writer: &mut S, command: &ClientCommand) -> Result<(), String>
where
    S: Sink<WsMessage, Error = tungstenite::Error> + Unpin,
{
    let frame = serde_json::to_string(command).map_err(|err| err.to_string())?;
    writer
        .send(WsMessage::Text(frame))
        .await
        .map_err(|err| err.to_string())
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
#[path = "tests/realtime_tests.rs"]
mod tests;
