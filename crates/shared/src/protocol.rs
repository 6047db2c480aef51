use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{
        CallId, CallKind, Conversation, ConversationId, ConversationKind, DeliveryStatus,
        GroupDetails, GroupSettings, Message, MessageId, PinnedMessageId, ReadReceipt, User,
        UserId,
    },
    error::NormalizationError,
};

/// Reference to another record: either a bare id or an embedded object carrying `_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityRef {
    Id(String),
    Object {
        #[serde(rename = "_id", alias = "id")]
        id: String,
    },
}

impl EntityRef {
    pub fn id(&self) -> &str {
        match self {
            Self::Id(id) => id,
            Self::Object { id } => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderPayload {
    #[serde(
        rename = "_id",
        alias = "id",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub is_guest: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadByPayload {
    pub user: EntityRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
}

/// Message as the backend sends it over REST and the realtime channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    #[serde(rename = "_id", alias = "id")]
    pub id: MessageId,
    #[serde(
        default,
        alias = "conversationId",
        skip_serializing_if = "Option::is_none"
    )]
    pub conversation: Option<EntityRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<SenderPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_type: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default, alias = "timestamp", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub read_by: Vec<ReadByPayload>,
}

impl MessagePayload {
    pub fn sender_user_id(&self) -> Option<UserId> {
        self.sender
            .as_ref()
            .and_then(|sender| sender.id.clone())
            .or_else(|| self.sender_id.clone())
    }

    /// Normalizes the payload into a confirmed domain message.
    ///
    /// `fallback_conversation` is used when the payload does not name its conversation
    /// (history responses omit it); `received_at` stands in for a missing timestamp.
    pub fn into_message(
        self,
        fallback_conversation: Option<&ConversationId>,
        received_at: DateTime<Utc>,
    ) -> Result<Message, NormalizationError> {
        if self.id.as_str().trim().is_empty() {
            return Err(NormalizationError::MissingId);
        }
        let sender_id = self
            .sender_user_id()
            .ok_or_else(|| NormalizationError::MissingSender(self.id.to_string()))?;
        let conversation_id = self
            .conversation
            .as_ref()
            .map(|conversation| ConversationId::new(conversation.id()))
            .or_else(|| fallback_conversation.cloned())
            .ok_or_else(|| NormalizationError::MissingConversation(self.id.to_string()))?;
        let is_guest = self.sender.as_ref().map(|s| s.is_guest).unwrap_or(false)
            || self.sender_type.as_deref() == Some("guest");
        let sender_name = self
            .sender
            .and_then(|sender| sender.name)
            .or(self.sender_name);
        let read_by = self
            .read_by
            .into_iter()
            .map(|entry| ReadReceipt {
                user: UserId::new(entry.user.id()),
                read_at: entry.read_at,
            })
            .collect();

        Ok(Message {
            id: self.id,
            conversation_id,
            sender_id,
            sender_name,
            content: self.content,
            created_at: self.created_at.unwrap_or(received_at),
            read_by,
            is_guest,
            status: DeliveryStatus::Sent,
        })
    }

    pub fn from_message(message: &Message) -> Self {
        Self {
            id: message.id.clone(),
            conversation: Some(EntityRef::Id(message.conversation_id.to_string())),
            sender: None,
            sender_id: Some(message.sender_id.clone()),
            sender_name: message.sender_name.clone(),
            sender_type: message.is_guest.then(|| "guest".to_owned()),
            content: message.content.clone(),
            created_at: Some(message.created_at),
            read_by: message
                .read_by
                .iter()
                .map(|receipt| ReadByPayload {
                    user: EntityRef::Id(receipt.user.to_string()),
                    read_at: receipt.read_at,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationPayload {
    #[serde(rename = "_id", alias = "id")]
    pub id: ConversationId,
    #[serde(default)]
    pub participants: Vec<User>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub admins: Vec<EntityRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<GroupSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<MessagePayload>,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<DateTime<Utc>>,
}

impl ConversationPayload {
    pub fn conversation_kind(&self) -> ConversationKind {
        match self.kind.as_deref() {
            Some("group") => ConversationKind::Group,
            Some("invite") => ConversationKind::Invite,
            _ => ConversationKind::Private,
        }
    }

    pub fn into_conversation(self, received_at: DateTime<Utc>) -> Conversation {
        let kind = self.conversation_kind();
        let last_message = self
            .last_message
            .and_then(|payload| payload.into_message(Some(&self.id), received_at).ok());
        let last_activity = self
            .last_activity
            .or_else(|| last_message.as_ref().map(|message| message.created_at));
        let group = (kind == ConversationKind::Group).then(|| GroupDetails {
            name: self.name.clone().unwrap_or_default(),
            description: self.description.clone(),
            admins: self
                .admins
                .iter()
                .map(|admin| UserId::new(admin.id()))
                .collect(),
            settings: self.settings.unwrap_or_default(),
        });

        Conversation {
            id: self.id,
            kind,
            participants: self.participants,
            group,
            last_message,
            unread_count: self.unread_count,
            last_activity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationUpdatePayload {
    pub conversation_id: ConversationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<MessagePayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unread_count: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessagePayload {
    pub message: MessagePayload,
    pub conversation: ConversationId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageReadPayload {
    pub message_id: MessageId,
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallPayload {
    #[serde(rename = "_id", alias = "id")]
    pub id: CallId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation: Option<EntityRef>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<CallKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initiator: Option<User>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingCallPayload {
    pub conversation: ConversationId,
    pub initiator: User,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call: Option<CallPayload>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallEndedPayload {
    pub conversation: ConversationId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticatedPayload {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Inbound realtime frame, `{"event": <name>, "data": <payload>}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    Authenticated(AuthenticatedPayload),
    NewConversation(ConversationPayload),
    NewGroup(ConversationPayload),
    GroupUpdated(ConversationPayload),
    ConversationUpdate(ConversationUpdatePayload),
    NewMessage(NewMessagePayload),
    UserTyping(TypingPayload),
    MessageRead(MessageReadPayload),
    IncomingCall(IncomingCallPayload),
    CallEnded(CallEndedPayload),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Authenticated,
    NewConversation,
    NewGroup,
    GroupUpdated,
    ConversationUpdate,
    NewMessage,
    UserTyping,
    MessageRead,
    IncomingCall,
    CallEnded,
}

impl EventKind {
    pub fn wire_name(self) -> &'static str {
        match self {
            Self::Authenticated => "authenticated",
            Self::NewConversation => "newConversation",
            Self::NewGroup => "newGroup",
            Self::GroupUpdated => "groupUpdated",
            Self::ConversationUpdate => "conversationUpdate",
            Self::NewMessage => "newMessage",
            Self::UserTyping => "userTyping",
            Self::MessageRead => "messageRead",
            Self::IncomingCall => "incomingCall",
            Self::CallEnded => "callEnded",
        }
    }
}

impl ServerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Authenticated(_) => EventKind::Authenticated,
            Self::NewConversation(_) => EventKind::NewConversation,
            Self::NewGroup(_) => EventKind::NewGroup,
            Self::GroupUpdated(_) => EventKind::GroupUpdated,
            Self::ConversationUpdate(_) => EventKind::ConversationUpdate,
            Self::NewMessage(_) => EventKind::NewMessage,
            Self::UserTyping(_) => EventKind::UserTyping,
            Self::MessageRead(_) => EventKind::MessageRead,
            Self::IncomingCall(_) => EventKind::IncomingCall,
            Self::CallEnded(_) => EventKind::CallEnded,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingCommand {
    pub conversation_id: ConversationId,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkAsReadCommand {
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageCreatedCommand {
    pub conversation_id: ConversationId,
    pub message: MessagePayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSignal {
    pub conversation: ConversationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call: Option<CallPayload>,
}

/// Outbound realtime frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientCommand {
    Authenticate(String),
    AuthenticateGuest(String),
    JoinConversation(ConversationId),
    LeaveConversation(ConversationId),
    Typing(TypingCommand),
    MarkAsRead(MarkAsReadCommand),
    MessageCreated(MessageCreatedCommand),
    InitiateCall(CallSignal),
    AcceptCall(CallSignal),
    DeclineCall(CallSignal),
    EndCall(CallSignal),
}

impl ClientCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Authenticate(_) => "authenticate",
            Self::AuthenticateGuest(_) => "authenticateGuest",
            Self::JoinConversation(_) => "joinConversation",
            Self::LeaveConversation(_) => "leaveConversation",
            Self::Typing(_) => "typing",
            Self::MarkAsRead(_) => "markAsRead",
            Self::MessageCreated(_) => "messageCreated",
            Self::InitiateCall(_) => "initiateCall",
            Self::AcceptCall(_) => "acceptCall",
            Self::DeclineCall(_) => "declineCall",
            Self::EndCall(_) => "endCall",
        }
    }

    pub fn is_authentication(&self) -> bool {
        matches!(self, Self::Authenticate(_) | Self::AuthenticateGuest(_))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub conversation_id: ConversationId,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateConversationRequest {
    pub participant_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResponse {
    pub token: String,
    pub user: User,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InviteGenerated {
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InviteInfo {
    pub host_user: User,
    #[serde(default = "default_true")]
    pub is_valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uses_remaining: Option<u32>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuestJoinRequest {
    pub guest_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuestJoinResponse {
    pub guest_user: User,
    pub guest_token: String,
    pub conversation: ConversationPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateGroupRequest {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub participants: Vec<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<GroupSettings>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateGroupRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<GroupSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddMembersRequest {
    pub user_ids: Vec<UserId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateAdminRequest {
    pub is_admin: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCallRequest {
    pub conversation_id: ConversationId,
    #[serde(rename = "type")]
    pub kind: CallKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PinMessageRequest {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReorderPinnedRequest {
    pub order: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PinnedMessagePayload {
    #[serde(rename = "_id", alias = "id")]
    pub id: PinnedMessageId,
    pub message: MessagePayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinned_by: Option<SenderPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub order: u32,
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
