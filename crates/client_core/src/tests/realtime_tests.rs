use super::*;
use axum::{
    extract::{
        ws::{Message as AxumMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use shared::protocol::{AuthenticatedPayload, MessagePayload, NewMessagePayload};
use std::sync::atomic::AtomicUsize;
use tokio::net::TcpListener;

#[derive(Clone)]
struct FakeRealtime {
    sessions: Arc<AtomicUsize>,
    received: mpsc::UnboundedSender<(usize, ClientCommand)>,
    drop_first_session: bool,
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<FakeRealtime>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_socket(socket, state))
}

async fn serve_socket(mut socket: WebSocket, state: FakeRealtime) {
    let session = state.sessions.fetch_add(1, Ordering::SeqCst);
    while let Some(Ok(frame)) = socket.recv().await {
        let AxumMessage::Text(text) = frame else {
            continue;
        };
        let command: ClientCommand = serde_json::from_str(&text).expect("client command");
        let _ = state.received.send((session, command.clone()));
        match command {
            ClientCommand::Authenticate(token) => {
                let ack = AuthenticatedPayload {
                    success: token == "good",
                    error: (token != "good").then(|| "Token inválido".to_string()),
                };
                let frame = serde_json::to_string(&ServerEvent::Authenticated(ack)).expect("ack");
                if socket.send(AxumMessage::Text(frame)).await.is_err() {
                    return;
                }
                if session == 0 && state.drop_first_session {
                    return;
                }
            }
            ClientCommand::JoinConversation(conversation) => {
                let event = ServerEvent::NewMessage(NewMessagePayload {
                    message: MessagePayload {
                        id: "m1".into(),
                        conversation: None,
                        sender: None,
                        sender_id: Some("u9".into()),
                        sender_name: Some("Lucia".into()),
                        sender_type: None,
                        content: "hola".into(),
                        created_at: None,
                        read_by: Vec::new(),
                    },
                    conversation,
                });
                let frame = serde_json::to_string(&event).expect("event");
                let _ = socket.send(AxumMessage::Text("not json".into())).await;
                if socket.send(AxumMessage::Text(frame)).await.is_err() {
                    return;
                }
            }
            _ => {}
        }
    }
}

async fn spawn_realtime_server(
    drop_first_session: bool,
) -> (String, mpsc::UnboundedReceiver<(usize, ClientCommand)>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (received, received_rx) = mpsc::unbounded_channel();
    let state = FakeRealtime {
        sessions: Arc::new(AtomicUsize::new(0)),
        received,
        drop_first_session,
    };
    let app = Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("ws://{addr}/ws"), received_rx)
}

fn fast_options() -> ChannelOptions {
    ChannelOptions {
        retry: RetryPolicy::new(10, 50),
        outbound_queue_limit: 8,
    }
}

async fn next_matching(
    events: &mut broadcast::Receiver<ChannelEvent>,
    predicate: impl Fn(&ChannelEvent) -> bool,
) -> ChannelEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("channel event");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for channel event")
}

#[test]
fn retry_policy_grows_exponentially_and_caps() {
    let policy = RetryPolicy::new(500, 30_000);
    assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(500));
    assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(4_000));
    assert_eq!(policy.delay_for_attempt(12), Duration::from_millis(30_000));
}

#[test]
fn outbound_queue_drops_oldest_when_full() {
    let mut queue = OutboundQueue::new(2);
    assert!(queue
        .push(ClientCommand::JoinConversation("c1".into()))
        .is_none());
    assert!(queue
        .push(ClientCommand::JoinConversation("c2".into()))
        .is_none());
    let evicted = queue.push(ClientCommand::JoinConversation("c3".into()));

    assert_eq!(evicted, Some(ClientCommand::JoinConversation("c1".into())));
    assert_eq!(queue.len(), 2);
    assert_eq!(
        queue.pop_front(),
        Some(ClientCommand::JoinConversation("c2".into()))
    );
}

#[test]
fn handlers_fire_only_for_their_event_until_removed() {
    let registry = HandlerRegistry::default();
    let hits = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&hits);
    let id = registry.register(
        EventKind::CallEnded,
        Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    );

    let ended = ServerEvent::CallEnded(shared::protocol::CallEndedPayload {
        conversation: "c1".into(),
    });
    let ack = ServerEvent::Authenticated(AuthenticatedPayload {
        success: true,
        error: None,
    });
    assert_eq!(registry.dispatch(&ended), 1);
    assert_eq!(registry.dispatch(&ack), 0);
    assert!(registry.remove(id));
    assert!(!registry.remove(id));
    assert_eq!(registry.dispatch(&ended), 0);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn queues_commands_until_authenticated_then_delivers_events() {
    let (url, mut received) = spawn_realtime_server(false).await;
    let channel = RealtimeChannel::connect(
        url,
        Credential::Registered {
            token: "good".into(),
        },
        fast_options(),
    );
    let mut events = channel.subscribe();
    let hits = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&hits);
    channel.on(
        EventKind::NewMessage,
        Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    );

    channel.emit(ClientCommand::JoinConversation("conv-1".into()));

    let first = received.recv().await.expect("first frame");
    assert_eq!(first, (0, ClientCommand::Authenticate("good".into())));
    let second = received.recv().await.expect("second frame");
    assert_eq!(second, (0, ClientCommand::JoinConversation("conv-1".into())));

    let authenticated = next_matching(&mut events, |event| {
        matches!(event, ChannelEvent::Authenticated { .. })
    })
    .await;
    assert_eq!(authenticated, ChannelEvent::Authenticated { resumed: false });

    let pushed = next_matching(&mut events, |event| {
        matches!(event, ChannelEvent::Server(ServerEvent::NewMessage(_)))
    })
    .await;
    let ChannelEvent::Server(ServerEvent::NewMessage(payload)) = pushed else {
        panic!("expected new message");
    };
    assert_eq!(payload.conversation.as_str(), "conv-1");
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(channel.state(), ChannelState::Authenticated);

    channel.close();
    tokio::time::timeout(Duration::from_secs(5), channel.closed())
        .await
        .expect("closed");
}

#[tokio::test]
async fn reconnect_reauthenticates_and_reports_resumed() {
    let (url, mut received) = spawn_realtime_server(true).await;
    let channel = RealtimeChannel::connect(
        url,
        Credential::Registered {
            token: "good".into(),
        },
        fast_options(),
    );
    let mut events = channel.subscribe();

    let resumed = next_matching(&mut events, |event| {
        matches!(event, ChannelEvent::Authenticated { resumed: true })
    })
    .await;
    assert_eq!(resumed, ChannelEvent::Authenticated { resumed: true });

    let mut sessions_authenticated = Vec::new();
    while let Ok((session, command)) = received.try_recv() {
        if command.is_authentication() {
            sessions_authenticated.push(session);
        }
    }
    assert_eq!(sessions_authenticated, vec![0, 1]);
    channel.close();
}

#[tokio::test]
async fn rejected_credential_closes_channel() {
    let (url, _received) = spawn_realtime_server(false).await;
    let channel = RealtimeChannel::connect(
        url,
        Credential::Registered {
            token: "expired".into(),
        },
        fast_options(),
    );
    let mut events = channel.subscribe();

    let error = next_matching(&mut events, |event| matches!(event, ChannelEvent::Error(_))).await;
    let ChannelEvent::Error(message) = error else {
        panic!("expected error");
    };
    assert!(message.contains("Token inválido"), "{message}");

    tokio::time::timeout(Duration::from_secs(5), channel.closed())
        .await
        .expect("closed after rejection");
    assert_eq!(channel.state(), ChannelState::Closed);
}
