use chrono::{DateTime, Local, TimeZone};
use client_core::message_log::group_by_day;
use shared::domain::{Conversation, ConversationKind, DeliveryStatus, Message, UserId};

pub fn conversation_line(conversation: &Conversation, me: &UserId) -> String {
    let kind = match conversation.kind {
        ConversationKind::Private => "private",
        ConversationKind::Group => "group",
        ConversationKind::Invite => "invite",
    };
    let unread = if conversation.unread_count > 0 {
        format!(" ({} unread)", conversation.unread_count)
    } else {
        String::new()
    };
    let preview = conversation
        .last_message
        .as_ref()
        .map(|message| format!(" - {}", truncate(&message.content, 40)))
        .unwrap_or_default();
    format!(
        "{}  [{kind}] {}{unread}{preview}",
        conversation.id,
        conversation.display_name(me)
    )
}

pub fn message_line<Tz: TimeZone>(message: &Message, tz: &Tz) -> String
where
    Tz::Offset: std::fmt::Display,
{
    let sender = message
        .sender_name
        .clone()
        .unwrap_or_else(|| message.sender_id.to_string());
    let marker = match message.status {
        DeliveryStatus::Pending => " (sending)",
        DeliveryStatus::Failed => " (failed, /retry to resend)",
        DeliveryStatus::Sent => "",
    };
    format!(
        "[{}] {sender}: {}{marker}",
        message.created_at.with_timezone(tz).format("%H:%M"),
        message.content
    )
}

/// History with a header line per calendar day.
pub fn history_lines<Tz: TimeZone>(messages: &[Message], tz: &Tz) -> Vec<String>
where
    Tz::Offset: std::fmt::Display,
{
    let mut lines = Vec::new();
    for group in group_by_day(messages, tz) {
        lines.push(format!("-- {} --", group.day.format("%Y-%m-%d")));
        lines.extend(group.messages.iter().map(|message| message_line(message, tz)));
    }
    lines
}

pub fn local_time(at: DateTime<chrono::Utc>) -> String {
    at.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string()
}

pub fn redact(value: &str) -> String {
    let visible: String = value.chars().take(4).collect();
    format!("{visible}... ({} chars)", value.chars().count())
}

fn truncate(text: &str, max_chars: usize) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{}...", head.trim_end())
    } else {
        head
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use shared::domain::{ConversationId, MessageId, User};

    fn message(id: &str, content: &str, day: u32, status: DeliveryStatus) -> Message {
        Message {
            id: MessageId::new(id),
            conversation_id: ConversationId::new("c1"),
            sender_id: UserId::new("u2"),
            sender_name: Some("Lucia".into()),
            content: content.into(),
            created_at: Utc.with_ymd_and_hms(2024, 5, day, 9, 30, 0).unwrap(),
            read_by: Vec::new(),
            is_guest: false,
            status,
        }
    }

    #[test]
    fn history_is_grouped_by_day() {
        let messages = vec![
            message("m1", "hola", 1, DeliveryStatus::Sent),
            message("m2", "que tal", 1, DeliveryStatus::Sent),
            message("m3", "buenas", 2, DeliveryStatus::Failed),
        ];
        let lines = history_lines(&messages, &Utc);
        assert_eq!(
            lines,
            vec![
                "-- 2024-05-01 --".to_string(),
                "[09:30] Lucia: hola".to_string(),
                "[09:30] Lucia: que tal".to_string(),
                "-- 2024-05-02 --".to_string(),
                "[09:30] Lucia: buenas (failed, /retry to resend)".to_string(),
            ]
        );
    }

    #[test]
    fn conversation_line_shows_unread_and_preview() {
        let me = UserId::new("u1");
        let conversation = Conversation {
            id: ConversationId::new("c1"),
            kind: ConversationKind::Private,
            participants: vec![User::new("u1", "Ana"), User::new("u2", "Lucia")],
            group: None,
            last_message: Some(message(
                "m1",
                "a message that is long enough to be cut somewhere",
                1,
                DeliveryStatus::Sent,
            )),
            unread_count: 3,
            last_activity: None,
        };
        assert_eq!(
            conversation_line(&conversation, &me),
            "c1  [private] Lucia (3 unread) - a message that is long enough to be cut..."
        );
    }

    #[test]
    fn redact_keeps_a_short_prefix() {
        assert_eq!(redact("abcdefgh"), "abcd... (8 chars)");
        assert_eq!(redact("ab"), "ab... (2 chars)");
    }
}
