use super::*;
use crate::{
    message_log::LoadState,
    test_support::{private_conversation, registered_session, server_message, ts, RecordingChannel},
};
use async_trait::async_trait;
use shared::{
    domain::DeliveryStatus,
    protocol::{MessagePayload, NewMessagePayload, ServerEvent},
};
use std::{collections::HashMap, sync::Mutex, time::Duration};

#[derive(Default)]
struct FakeBackend {
    history: HashMap<String, Vec<Message>>,
    delays: HashMap<String, Duration>,
    fail_sends: bool,
    sent: Mutex<Vec<String>>,
}

#[async_trait]
impl ChatBackend for FakeBackend {
    async fn list_conversations(&self, _session: &Session) -> ClientResult<Vec<Conversation>> {
        Ok(vec![
            private_conversation("a", "u1", "u9"),
            private_conversation("b", "u1", "u9"),
        ])
    }

    async fn fetch_history(
        &self,
        _session: &Session,
        conversation_id: &ConversationId,
    ) -> ClientResult<Vec<Message>> {
        if let Some(delay) = self.delays.get(conversation_id.as_str()) {
            tokio::time::sleep(*delay).await;
        }
        Ok(self
            .history
            .get(conversation_id.as_str())
            .cloned()
            .unwrap_or_default())
    }

    async fn send_message(
        &self,
        _session: &Session,
        conversation_id: &ConversationId,
        content: &str,
    ) -> ClientResult<Message> {
        if self.fail_sends {
            return Err(ClientError::Remote {
                status: 500,
                message: "boom".into(),
            });
        }
        let mut sent = self.sent.lock().expect("sent lock");
        sent.push(content.to_string());
        Ok(server_message(
            &format!("srv-{}", sent.len()),
            conversation_id.as_str(),
            "u1",
            content,
            ts(60),
        ))
    }

    async fn create_call(
        &self,
        _session: &Session,
        _conversation_id: &ConversationId,
        _kind: CallKind,
    ) -> ClientResult<CallPayload> {
        Err(ClientError::Unauthenticated("not in tests".into()))
    }

    async fn join_call(&self, _session: &Session, _call_id: &CallId) -> ClientResult<CallPayload> {
        Err(ClientError::Unauthenticated("not in tests".into()))
    }

    async fn end_call(&self, _session: &Session, _call_id: &CallId) -> ClientResult<()> {
        Ok(())
    }

    async fn decline_call(&self, _session: &Session, _call_id: &CallId) -> ClientResult<()> {
        Ok(())
    }
}

fn spawn(backend: FakeBackend) -> (SyncHandle, Arc<RecordingChannel>) {
    let channel = RecordingChannel::new();
    let handle = SyncEngine::spawn(
        Arc::new(backend),
        registered_session("u1"),
        channel.clone(),
        &ClientSettings::default(),
    );
    (handle, channel)
}

async fn wait_for(handle: &SyncHandle, mut ready: impl FnMut(&SyncSnapshot) -> bool) -> SyncSnapshot {
    for _ in 0..200 {
        let snapshot = handle.snapshot().await.expect("snapshot");
        if ready(&snapshot) {
            return snapshot;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("synchronizer never reached the expected state");
}

fn message_ids(snapshot: &SyncSnapshot) -> Vec<&str> {
    snapshot
        .messages
        .iter()
        .map(|message| message.id.as_str())
        .collect()
}

#[tokio::test]
async fn loads_conversations_and_history_on_select() {
    let mut backend = FakeBackend::default();
    backend.history.insert(
        "a".into(),
        vec![server_message("m1", "a", "u9", "hola", ts(0))],
    );
    let (handle, channel) = spawn(backend);

    wait_for(&handle, |snapshot| snapshot.conversations.len() == 2).await;
    handle.select(ConversationId::new("a")).expect("select");
    let snapshot = wait_for(&handle, |snapshot| !snapshot.messages.is_empty()).await;

    assert_eq!(message_ids(&snapshot), vec!["m1"]);
    assert_eq!(snapshot.active_conversation, Some(ConversationId::new("a")));
    let commands = channel.take_commands();
    assert_eq!(
        commands[0],
        ClientCommand::JoinConversation(ConversationId::new("a"))
    );
    handle.shutdown();
}

#[tokio::test]
async fn slow_history_of_abandoned_selection_is_ignored() {
    let mut backend = FakeBackend::default();
    backend.history.insert(
        "a".into(),
        vec![server_message("a1", "a", "u9", "from a", ts(0))],
    );
    backend.history.insert(
        "b".into(),
        vec![server_message("b1", "b", "u9", "from b", ts(0))],
    );
    backend.delays.insert("b".into(), Duration::from_millis(150));
    let (handle, _channel) = spawn(backend);

    handle.select(ConversationId::new("a")).expect("a");
    handle.select(ConversationId::new("b")).expect("b");
    handle.select(ConversationId::new("a")).expect("a again");

    wait_for(&handle, |snapshot| !snapshot.messages.is_empty()).await;
    tokio::time::sleep(Duration::from_millis(250)).await;
    let snapshot = handle.snapshot().await.expect("snapshot");
    assert_eq!(message_ids(&snapshot), vec!["a1"]);
    assert_eq!(snapshot.active_conversation, Some(ConversationId::new("a")));
}

#[tokio::test]
async fn send_is_confirmed_and_relayed() {
    let (handle, channel) = spawn(FakeBackend::default());
    handle.select(ConversationId::new("a")).expect("select");
    wait_for(&handle, |snapshot| snapshot.load_state == LoadState::Loaded).await;

    let temp_id = handle.send("hello").await.expect("send");
    assert!(temp_id.is_temporary());
    let snapshot = wait_for(&handle, |snapshot| {
        snapshot
            .messages
            .iter()
            .any(|message| message.id.as_str() == "srv-1")
    })
    .await;

    assert_eq!(message_ids(&snapshot), vec!["srv-1"]);
    assert!(channel.take_commands().iter().any(|command| matches!(
        command,
        ClientCommand::MessageCreated(created) if created.message.id.as_str() == "srv-1"
    )));
    let err = handle.send("   ").await.expect_err("empty");
    assert!(matches!(err, ClientError::Validation(_)));
}

#[tokio::test]
async fn failed_send_is_reported_and_kept() {
    let backend = FakeBackend {
        fail_sends: true,
        ..FakeBackend::default()
    };
    let (handle, _channel) = spawn(backend);
    let mut events = handle.subscribe();
    handle.select(ConversationId::new("a")).expect("select");
    wait_for(&handle, |snapshot| snapshot.load_state == LoadState::Loaded).await;

    let temp_id = handle.send("hello").await.expect("send");
    let failed = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Ok(SyncEvent::SendFailed { temp_id, error }) = events.recv().await {
                return (temp_id, error);
            }
        }
    })
    .await
    .expect("send failure event");

    assert_eq!(failed, (temp_id.clone(), "boom".to_string()));
    let snapshot = handle.snapshot().await.expect("snapshot");
    assert_eq!(snapshot.messages.len(), 1);
    assert_eq!(snapshot.messages[0].id, temp_id);
    assert_eq!(snapshot.messages[0].status, DeliveryStatus::Failed);
}

#[tokio::test]
async fn pushed_messages_reach_the_open_log() {
    let (handle, channel) = spawn(FakeBackend::default());
    handle.select(ConversationId::new("a")).expect("select");
    wait_for(&handle, |snapshot| {
        snapshot.load_state == LoadState::Loaded && snapshot.conversations.len() == 2
    })
    .await;

    let pushed = server_message("m5", "a", "u9", "live", ts(5));
    channel.push_server(ServerEvent::NewMessage(NewMessagePayload {
        message: MessagePayload::from_message(&pushed),
        conversation: ConversationId::new("a"),
    }));
    let other = server_message("m6", "b", "u9", "elsewhere", ts(6));
    channel.push_server(ServerEvent::NewMessage(NewMessagePayload {
        message: MessagePayload::from_message(&other),
        conversation: ConversationId::new("b"),
    }));

    let snapshot = wait_for(&handle, |snapshot| {
        snapshot
            .conversations
            .iter()
            .any(|conversation| conversation.unread_count == 1)
    })
    .await;
    assert_eq!(message_ids(&snapshot), vec!["m5"]);
    let b = snapshot
        .conversations
        .iter()
        .find(|conversation| conversation.id.as_str() == "b")
        .expect("b");
    assert_eq!(b.unread_count, 1);
}

#[tokio::test]
async fn handle_reports_stopped_engine() {
    let (handle, _channel) = spawn(FakeBackend::default());
    handle.shutdown();
    let mut stopped = false;
    for _ in 0..100 {
        if handle.refresh().is_err() {
            stopped = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(stopped);
    assert!(handle.snapshot().await.is_err());
}
