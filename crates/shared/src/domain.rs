use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(ConversationId);
id_newtype!(MessageId);
id_newtype!(CallId);
id_newtype!(PinnedMessageId);

/// Prefix reserved for locally generated message ids. Server ids never use it.
pub const TEMP_MESSAGE_ID_PREFIX: &str = "temp-";

impl MessageId {
    pub fn temporary(sequence: u64) -> Self {
        Self(format!(
            "{TEMP_MESSAGE_ID_PREFIX}{sequence}-{}",
            Uuid::new_v4().simple()
        ))
    }

    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(TEMP_MESSAGE_ID_PREFIX)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(rename = "_id", alias = "id")]
    pub id: UserId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default)]
    pub is_online: bool,
    #[serde(default)]
    pub is_guest: bool,
}

impl User {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: UserId::new(id),
            name: name.into(),
            email: None,
            avatar: None,
            is_online: false,
            is_guest: false,
        }
    }

    pub fn guest(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            is_guest: true,
            ..Self::new(id, name)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadReceipt {
    pub user: UserId,
    pub read_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub sender_name: Option<String>,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub read_by: Vec<ReadReceipt>,
    pub is_guest: bool,
    pub status: DeliveryStatus,
}

impl Message {
    pub fn is_pending(&self) -> bool {
        self.status == DeliveryStatus::Pending && self.id.is_temporary()
    }

    pub fn is_read_by(&self, user: &UserId) -> bool {
        self.read_by.iter().any(|receipt| &receipt.user == user)
    }

    /// Read by anyone other than the sender.
    pub fn is_read(&self) -> bool {
        self.read_by
            .iter()
            .any(|receipt| receipt.user != self.sender_id)
    }

    pub fn record_read(&mut self, reader: UserId, read_at: Option<DateTime<Utc>>) -> bool {
        if self.is_read_by(&reader) {
            return false;
        }
        self.read_by.push(ReadReceipt {
            user: reader,
            read_at,
        });
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    #[default]
    Private,
    Group,
    Invite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSettings {
    #[serde(default)]
    pub only_admins_can_message: bool,
    #[serde(default)]
    pub only_admins_can_add_members: bool,
    #[serde(default)]
    pub only_admins_can_edit_info: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupDetails {
    pub name: String,
    pub description: Option<String>,
    pub admins: Vec<UserId>,
    pub settings: GroupSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub kind: ConversationKind,
    pub participants: Vec<User>,
    pub group: Option<GroupDetails>,
    pub last_message: Option<Message>,
    pub unread_count: u32,
    pub last_activity: Option<DateTime<Utc>>,
}

impl Conversation {
    /// Group name, or the other participants' names for one-to-one chats.
    pub fn display_name(&self, me: &UserId) -> String {
        if let Some(group) = &self.group {
            return group.name.clone();
        }
        let names: Vec<&str> = self
            .participants
            .iter()
            .filter(|participant| &participant.id != me)
            .map(|participant| participant.name.as_str())
            .collect();
        if names.is_empty() {
            self.id.to_string()
        } else {
            names.join(", ")
        }
    }

    pub fn has_participant(&self, user: &UserId) -> bool {
        self.participants
            .iter()
            .any(|participant| &participant.id == user)
    }

    pub fn is_admin(&self, user: &UserId) -> bool {
        self.group
            .as_ref()
            .map(|group| group.admins.contains(user))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Audio,
    Video,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temporary_ids_are_distinguishable_and_unique() {
        let first = MessageId::temporary(1);
        let second = MessageId::temporary(1);
        assert!(first.is_temporary());
        assert_ne!(first, second);
        assert!(!MessageId::new("65f1c2a9e4b0a1b2c3d4e5f6").is_temporary());
    }

    #[test]
    fn user_accepts_backend_underscore_id() {
        let user: User =
            serde_json::from_str(r#"{"_id":"u1","name":"Ana","isGuest":true}"#).expect("json");
        assert_eq!(user.id, UserId::new("u1"));
        assert!(user.is_guest);
        assert!(!user.is_online);

        let user: User = serde_json::from_str(r#"{"id":"u2","name":"Bo"}"#).expect("json");
        assert_eq!(user.id.as_str(), "u2");
    }

    #[test]
    fn display_name_prefers_group_name_then_other_participants() {
        let me = UserId::new("me");
        let mut conversation = Conversation {
            id: ConversationId::new("c1"),
            kind: ConversationKind::Private,
            participants: vec![User::new("me", "Me"), User::new("u2", "Lucia")],
            group: None,
            last_message: None,
            unread_count: 0,
            last_activity: None,
        };
        assert_eq!(conversation.display_name(&me), "Lucia");

        conversation.group = Some(GroupDetails {
            name: "Equipo".into(),
            description: None,
            admins: vec![me.clone()],
            settings: GroupSettings::default(),
        });
        assert_eq!(conversation.display_name(&me), "Equipo");
        assert!(conversation.is_admin(&me));
    }
}
