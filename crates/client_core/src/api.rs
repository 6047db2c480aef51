use async_trait::async_trait;
use chrono::Utc;
use reqwest::{header::AUTHORIZATION, Client, RequestBuilder, Response};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use shared::{
    domain::{CallId, CallKind, Conversation, ConversationId, Message, PinnedMessageId, UserId},
    protocol::{
        AddMembersRequest, AuthResponse, CallPayload, ConversationPayload,
        CreateCallRequest, CreateConversationRequest, CreateGroupRequest, GuestJoinRequest,
        GuestJoinResponse, InviteGenerated, InviteInfo, LoginRequest, MessagePayload,
        PinMessageRequest, PinnedMessagePayload, RegisterRequest, ReorderPinnedRequest,
        SendMessageRequest, UpdateAdminRequest, UpdateGroupRequest,
    },
};
use tracing::{debug, warn};

use crate::{
    error::{ClientError, ClientResult},
    session::Session,
};

pub const MIN_GUEST_NAME_CHARS: usize = 2;

/// The REST operations the synchronizer drives.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn list_conversations(&self, session: &Session) -> ClientResult<Vec<Conversation>>;
    async fn fetch_history(
        &self,
        session: &Session,
        conversation_id: &ConversationId,
    ) -> ClientResult<Vec<Message>>;
    async fn send_message(
        &self,
        session: &Session,
        conversation_id: &ConversationId,
        content: &str,
    ) -> ClientResult<Message>;
    async fn create_call(
        &self,
        session: &Session,
        conversation_id: &ConversationId,
        kind: CallKind,
    ) -> ClientResult<CallPayload>;
    async fn join_call(&self, session: &Session, call_id: &CallId) -> ClientResult<CallPayload>;
    async fn end_call(&self, session: &Session, call_id: &CallId) -> ClientResult<()>;
    async fn decline_call(&self, session: &Session, call_id: &CallId) -> ClientResult<()>;
}

#[derive(Clone)]
pub struct HttpBackend {
    http: Client,
    base_url: String,
}

impl HttpBackend {
    /// `base_url` is the REST root including `/api`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(http: Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn register(&self, name: &str, email: &str, password: &str) -> ClientResult<AuthResponse> {
        if name.trim().is_empty() || email.trim().is_empty() || password.is_empty() {
            return Err(ClientError::validation("name, email and password are required"));
        }
        let request = RegisterRequest {
            name: name.trim().to_string(),
            email: email.trim().to_string(),
            password: password.to_string(),
        };
        decode(self.http.post(self.url("/auth/register")).json(&request).send().await?).await
    }

    pub async fn login(&self, email: &str, password: &str) -> ClientResult<AuthResponse> {
        if email.trim().is_empty() || password.is_empty() {
            return Err(ClientError::validation("email and password are required"));
        }
        let request = LoginRequest {
            email: email.trim().to_string(),
            password: password.to_string(),
        };
        decode(self.http.post(self.url("/auth/login")).json(&request).send().await?).await
    }

    pub async fn logout(&self, session: &Session) -> ClientResult<()> {
        let request = self.authorized(self.http.post(self.url("/auth/logout")), session);
        expect_success(request.send().await?).await
    }

    pub async fn create_conversation(
        &self,
        session: &Session,
        participant_id: &UserId,
    ) -> ClientResult<Conversation> {
        require_registered(session)?;
        let request = CreateConversationRequest {
            participant_id: participant_id.clone(),
        };
        let payload: ConversationPayload = self
            .send_json(self.http.post(self.url("/conversations")), session, &request)
            .await?;
        Ok(payload.into_conversation(Utc::now()))
    }

    pub async fn generate_invite(&self, session: &Session) -> ClientResult<InviteGenerated> {
        require_registered(session)?;
        let request = self.authorized(self.http.post(self.url("/invite/generate")), session);
        decode(request.send().await?).await
    }

    pub async fn verify_invite(&self, token: &str) -> ClientResult<InviteInfo> {
        let token = non_blank(token, "invite token")?;
        decode(
            self.http
                .get(self.url(&format!("/invite/verify/{token}")))
                .send()
                .await?,
        )
        .await
    }

    /// Joins an invite as a guest. The name is checked before anything is sent.
    pub async fn join_invite(&self, token: &str, guest_name: &str) -> ClientResult<GuestJoinResponse> {
        let token = non_blank(token, "invite token")?;
        let guest_name = validate_guest_name(guest_name)?;
        let request = GuestJoinRequest { guest_name };
        decode(
            self.http
                .post(self.url(&format!("/invite/join/{token}")))
                .json(&request)
                .send()
                .await?,
        )
        .await
    }

    pub async fn create_group(
        &self,
        session: &Session,
        request: &CreateGroupRequest,
    ) -> ClientResult<Conversation> {
        require_registered(session)?;
        if request.name.trim().is_empty() {
            return Err(ClientError::validation("group name is required"));
        }
        let payload: ConversationPayload = self
            .send_json(self.http.post(self.url("/groups")), session, request)
            .await?;
        Ok(payload.into_conversation(Utc::now()))
    }

    pub async fn list_groups(&self, session: &Session) -> ClientResult<Vec<Conversation>> {
        require_registered(session)?;
        let payloads: Vec<ConversationPayload> = self.get_json("/groups", session).await?;
        let received_at = Utc::now();
        Ok(payloads
            .into_iter()
            .map(|payload| payload.into_conversation(received_at))
            .collect())
    }

    pub async fn get_group(
        &self,
        session: &Session,
        group_id: &ConversationId,
    ) -> ClientResult<Conversation> {
        require_registered(session)?;
        let payload: ConversationPayload = self.get_json(&format!("/groups/{group_id}"), session).await?;
        Ok(payload.into_conversation(Utc::now()))
    }

    pub async fn update_group(
        &self,
        session: &Session,
        group_id: &ConversationId,
        request: &UpdateGroupRequest,
    ) -> ClientResult<Conversation> {
        require_registered(session)?;
        let payload: ConversationPayload = self
            .send_json(
                self.http.put(self.url(&format!("/groups/{group_id}"))),
                session,
                request,
            )
            .await?;
        Ok(payload.into_conversation(Utc::now()))
    }

    pub async fn add_group_members(
        &self,
        session: &Session,
        group_id: &ConversationId,
        user_ids: Vec<UserId>,
    ) -> ClientResult<Conversation> {
        require_registered(session)?;
        if user_ids.is_empty() {
            return Err(ClientError::validation("select at least one member"));
        }
        let payload: ConversationPayload = self
            .send_json(
                self.http.post(self.url(&format!("/groups/{group_id}/members"))),
                session,
                &AddMembersRequest { user_ids },
            )
            .await?;
        Ok(payload.into_conversation(Utc::now()))
    }

    pub async fn remove_group_member(
        &self,
        session: &Session,
        group_id: &ConversationId,
        user_id: &UserId,
    ) -> ClientResult<()> {
        require_registered(session)?;
        let request = self.authorized(
            self.http
                .delete(self.url(&format!("/groups/{group_id}/members/{user_id}"))),
            session,
        );
        expect_success(request.send().await?).await
    }

    pub async fn set_group_admin(
        &self,
        session: &Session,
        group_id: &ConversationId,
        user_id: &UserId,
        is_admin: bool,
    ) -> ClientResult<()> {
        require_registered(session)?;
        let request = self
            .authorized(
                self.http
                    .put(self.url(&format!("/groups/{group_id}/members/{user_id}/admin"))),
                session,
            )
            .json(&UpdateAdminRequest { is_admin });
        expect_success(request.send().await?).await
    }

    pub async fn leave_group(&self, session: &Session, group_id: &ConversationId) -> ClientResult<()> {
        require_registered(session)?;
        self.post_empty(&format!("/groups/{group_id}/leave"), session).await
    }

    pub async fn conversation_calls(
        &self,
        session: &Session,
        conversation_id: &ConversationId,
    ) -> ClientResult<Vec<CallPayload>> {
        require_registered(session)?;
        self.get_json(&format!("/calls/conversation/{conversation_id}"), session)
            .await
    }

    pub async fn call_history(&self, session: &Session) -> ClientResult<Vec<CallPayload>> {
        require_registered(session)?;
        self.get_json("/calls/user/history", session).await
    }

    pub async fn pin_message(
        &self,
        session: &Session,
        request: &PinMessageRequest,
    ) -> ClientResult<PinnedMessagePayload> {
        require_registered(session)?;
        self.send_json(self.http.post(self.url("/pinned-messages")), session, request)
            .await
    }

    pub async fn pinned_messages(
        &self,
        session: &Session,
        conversation_id: &ConversationId,
    ) -> ClientResult<Vec<PinnedMessagePayload>> {
        self.get_json(
            &format!("/pinned-messages/conversation/{conversation_id}"),
            session,
        )
        .await
    }

    pub async fn unpin_message(&self, session: &Session, pinned_id: &PinnedMessageId) -> ClientResult<()> {
        require_registered(session)?;
        let request = self.authorized(
            self.http
                .delete(self.url(&format!("/pinned-messages/{pinned_id}"))),
            session,
        );
        expect_success(request.send().await?).await
    }

    pub async fn reorder_pinned_message(
        &self,
        session: &Session,
        pinned_id: &PinnedMessageId,
        order: u32,
    ) -> ClientResult<()> {
        require_registered(session)?;
        let request = self
            .authorized(
                self.http
                    .put(self.url(&format!("/pinned-messages/{pinned_id}/order"))),
                session,
            )
            .json(&ReorderPinnedRequest { order });
        expect_success(request.send().await?).await
    }

    pub async fn settings(&self, session: &Session) -> ClientResult<Value> {
        require_registered(session)?;
        self.get_json("/settings", session).await
    }

    pub async fn update_settings(&self, session: &Session, settings: &Value) -> ClientResult<Value> {
        require_registered(session)?;
        self.send_json(self.http.put(self.url("/settings")), session, settings)
            .await
    }

    pub async fn block_user(&self, session: &Session, user_id: &UserId) -> ClientResult<()> {
        require_registered(session)?;
        self.post_empty(&format!("/settings/block/{user_id}"), session).await
    }

    pub async fn unblock_user(&self, session: &Session, user_id: &UserId) -> ClientResult<()> {
        require_registered(session)?;
        self.post_empty(&format!("/settings/unblock/{user_id}"), session).await
    }

    pub async fn mute_conversation(
        &self,
        session: &Session,
        conversation_id: &ConversationId,
    ) -> ClientResult<()> {
        require_registered(session)?;
        self.post_empty(&format!("/settings/mute/{conversation_id}"), session)
            .await
    }

    pub async fn unmute_conversation(
        &self,
        session: &Session,
        conversation_id: &ConversationId,
    ) -> ClientResult<()> {
        require_registered(session)?;
        self.post_empty(&format!("/settings/unmute/{conversation_id}"), session)
            .await
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn authorized(&self, request: RequestBuilder, session: &Session) -> RequestBuilder {
        request.header(AUTHORIZATION, session.auth_header())
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, session: &Session) -> ClientResult<T> {
        let request = self.authorized(self.http.get(self.url(path)), session);
        decode(request.send().await?).await
    }

    async fn send_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        session: &Session,
        body: &B,
    ) -> ClientResult<T> {
        let request = self.authorized(request, session).json(body);
        decode(request.send().await?).await
    }

    async fn post_empty(&self, path: &str, session: &Session) -> ClientResult<()> {
        let request = self.authorized(self.http.post(self.url(path)), session);
        expect_success(request.send().await?).await
    }
}

#[async_trait]
impl ChatBackend for HttpBackend {
    async fn list_conversations(&self, session: &Session) -> ClientResult<Vec<Conversation>> {
        let path = if session.is_guest() {
            "/conversations/guest"
        } else {
            "/conversations"
        };
        let payloads: Vec<ConversationPayload> = self.get_json(path, session).await?;
        let received_at = Utc::now();
        debug!(count = payloads.len(), guest = session.is_guest(), "fetched conversations");
        Ok(payloads
            .into_iter()
            .map(|payload| payload.into_conversation(received_at))
            .collect())
    }

    async fn fetch_history(
        &self,
        session: &Session,
        conversation_id: &ConversationId,
    ) -> ClientResult<Vec<Message>> {
        let path = if session.is_guest() {
            format!("/messages/conversation/{conversation_id}/guest")
        } else {
            format!("/messages/conversation/{conversation_id}")
        };
        let payloads: Vec<MessagePayload> = self.get_json(&path, session).await?;
        let received_at = Utc::now();
        let mut messages = Vec::with_capacity(payloads.len());
        for payload in payloads {
            match payload.into_message(Some(conversation_id), received_at) {
                Ok(message) => messages.push(message),
                Err(err) => warn!(conversation_id = %conversation_id, error = %err, "skipping malformed history entry"),
            }
        }
        Ok(messages)
    }

    async fn send_message(
        &self,
        session: &Session,
        conversation_id: &ConversationId,
        content: &str,
    ) -> ClientResult<Message> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ClientError::validation("message content is empty"));
        }
        let path = if session.is_guest() {
            "/messages/guest"
        } else {
            "/messages"
        };
        let request = SendMessageRequest {
            conversation_id: conversation_id.clone(),
            content: content.to_string(),
        };
        let payload: MessagePayload = self
            .send_json(self.http.post(self.url(path)), session, &request)
            .await?;
        let mut message = payload.into_message(Some(conversation_id), Utc::now())?;
        if session.is_guest() {
            message.is_guest = true;
        }
        Ok(message)
    }

    async fn create_call(
        &self,
        session: &Session,
        conversation_id: &ConversationId,
        kind: CallKind,
    ) -> ClientResult<CallPayload> {
        require_registered(session)?;
        let request = CreateCallRequest {
            conversation_id: conversation_id.clone(),
            kind,
        };
        self.send_json(self.http.post(self.url("/calls")), session, &request)
            .await
    }

    async fn join_call(&self, session: &Session, call_id: &CallId) -> ClientResult<CallPayload> {
        require_registered(session)?;
        let request = self.authorized(
            self.http.post(self.url(&format!("/calls/{call_id}/join"))),
            session,
        );
        decode(request.send().await?).await
    }

    async fn end_call(&self, session: &Session, call_id: &CallId) -> ClientResult<()> {
        require_registered(session)?;
        self.post_empty(&format!("/calls/{call_id}/end"), session).await
    }

    async fn decline_call(&self, session: &Session, call_id: &CallId) -> ClientResult<()> {
        require_registered(session)?;
        self.post_empty(&format!("/calls/{call_id}/decline"), session)
            .await
    }
}

pub fn validate_guest_name(raw: &str) -> ClientResult<String> {
    let name = raw.trim();
    if name.chars().count() < MIN_GUEST_NAME_CHARS {
        return Err(ClientError::validation(format!(
            "guest name must have at least {MIN_GUEST_NAME_CHARS} characters"
        )));
    }
    Ok(name.to_string())
}

fn require_registered(session: &Session) -> ClientResult<()> {
    if session.is_guest() {
        return Err(ClientError::Unauthenticated(
            "this action requires a registered account".into(),
        ));
    }
    Ok(())
}

fn non_blank<'a>(value: &'a str, what: &str) -> ClientResult<&'a str> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ClientError::validation(format!("{what} is required")));
    }
    Ok(value)
}

async fn decode<T: DeserializeOwned>(response: Response) -> ClientResult<T> {
    let status = response.status();
    let body = response.bytes().await?;
    if !status.is_success() {
        return Err(ClientError::from_response(status, &body));
    }
    serde_json::from_slice(&body).map_err(|err| ClientError::Payload(err.to_string()))
}

async fn expect_success(response: Response) -> ClientResult<()> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.bytes().await?;
    Err(ClientError::from_response(status, &body))
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
