use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use shared::domain::{Conversation, ConversationId, Message, MessageId, UserId};

/// Upper bound on remembered message ids per conversation.
pub const SEEN_IDS_PER_CONVERSATION: usize = 512;

/// Message ids already applied to a conversation's summary, oldest evicted first.
#[derive(Debug, Default)]
struct SeenIds {
    order: VecDeque<MessageId>,
    members: HashSet<MessageId>,
}

impl SeenIds {
    fn insert(&mut self, id: &MessageId) -> bool {
        if self.members.contains(id) {
            return false;
        }
        if self.order.len() >= SEEN_IDS_PER_CONVERSATION {
            if let Some(evicted) = self.order.pop_front() {
                self.members.remove(&evicted);
            }
        }
        self.order.push_back(id.clone());
        self.members.insert(id.clone());
        true
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationUpdate {
    pub conversation_id: ConversationId,
    pub last_message: Option<Message>,
    pub last_activity: Option<DateTime<Utc>>,
    /// Server-computed unread count; replaces the local tally when present.
    pub unread_count: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NewMessageOutcome {
    UnknownConversation,
    Updated { counted_unread: bool },
    AlreadyApplied,
}

#[derive(Debug, Default)]
pub struct ConversationList {
    conversations: Vec<Conversation>,
    seen: HashMap<ConversationId, SeenIds>,
}

impl ConversationList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn get(&self, id: &ConversationId) -> Option<&Conversation> {
        self.conversations
            .iter()
            .find(|conversation| &conversation.id == id)
    }

    pub fn contains(&self, id: &ConversationId) -> bool {
        self.get(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    /// Replaces the whole collection with a fresh fetch.
    pub fn load_all(&mut self, conversations: Vec<Conversation>) {
        let mut ids = HashSet::with_capacity(conversations.len());
        self.conversations = conversations
            .into_iter()
            .filter(|conversation| ids.insert(conversation.id.clone()))
            .collect();
        self.seen.clear();
        for conversation in &self.conversations {
            if let Some(last) = &conversation.last_message {
                self.seen
                    .entry(conversation.id.clone())
                    .or_default()
                    .insert(&last.id);
            }
        }
    }

    /// `newConversation` / `newGroup`: inserted at the front unless already known.
    pub fn upsert_created(&mut self, conversation: Conversation) -> bool {
        if self.contains(&conversation.id) {
            return false;
        }
        self.conversations.insert(0, conversation);
        true
    }

    /// `groupUpdated`: replaces metadata, keeping the local unread tally and last message
    /// when the update carries none.
    pub fn apply_group_update(&mut self, mut updated: Conversation) -> bool {
        let Some(existing) = self.get_mut(&updated.id) else {
            self.conversations.insert(0, updated);
            return true;
        };
        updated.unread_count = existing.unread_count;
        if updated.last_message.is_none() {
            updated.last_message = existing.last_message.take();
        }
        if updated.last_activity.is_none() {
            updated.last_activity = existing.last_activity;
        }
        *existing = updated;
        true
    }

    pub fn apply_conversation_update(&mut self, update: ConversationUpdate) -> bool {
        let ConversationUpdate {
            conversation_id,
            last_message,
            last_activity,
            unread_count,
        } = update;
        if !self.contains(&conversation_id) {
            return false;
        }
        // A carried message only counts as applied when the unread tally came with it;
        // otherwise the matching newMessage still has to count it.
        if let (Some(message), Some(_)) = (&last_message, unread_count) {
            self.seen
                .entry(conversation_id.clone())
                .or_default()
                .insert(&message.id);
        }
        let Some(conversation) = self.get_mut(&conversation_id) else {
            return false;
        };

        let activity = last_activity.or_else(|| last_message.as_ref().map(|m| m.created_at));
        if let Some(message) = last_message {
            conversation.last_message = Some(message);
        }
        if let Some(activity) = activity {
            conversation.last_activity = Some(activity);
        }
        if let Some(unread) = unread_count {
            conversation.unread_count = unread;
        }
        true
    }

    /// `newMessage`: bumps the summary and counts the message as unread at most once,
    /// and only when someone else wrote it and the conversation is not open.
    pub fn apply_new_message(
        &mut self,
        message: &Message,
        me: &UserId,
        is_open: bool,
    ) -> NewMessageOutcome {
        if !self.contains(&message.conversation_id) {
            return NewMessageOutcome::UnknownConversation;
        }
        let first_delivery = self
            .seen
            .entry(message.conversation_id.clone())
            .or_default()
            .insert(&message.id);
        if !first_delivery {
            return NewMessageOutcome::AlreadyApplied;
        }

        let Some(conversation) = self.get_mut(&message.conversation_id) else {
            return NewMessageOutcome::UnknownConversation;
        };
        bump_last_message(conversation, message);

        let counted_unread = &message.sender_id != me && !is_open;
        if counted_unread {
            conversation.unread_count = conversation.unread_count.saturating_add(1);
        }
        NewMessageOutcome::Updated { counted_unread }
    }

    /// Local send (optimistic or confirmed) shown as the conversation's latest activity.
    pub fn record_local_send(&mut self, message: &Message) -> bool {
        if !message.id.is_temporary() {
            self.seen
                .entry(message.conversation_id.clone())
                .or_default()
                .insert(&message.id);
        }
        match self.get_mut(&message.conversation_id) {
            Some(conversation) => {
                bump_last_message(conversation, message);
                true
            }
            None => false,
        }
    }

    /// Resets the unread count. Returns whether anything changed.
    pub fn mark_read(&mut self, id: &ConversationId) -> bool {
        match self.get_mut(id) {
            Some(conversation) if conversation.unread_count > 0 => {
                conversation.unread_count = 0;
                true
            }
            _ => false,
        }
    }

    /// Drops the remembered ids for a conversation that is no longer open.
    pub fn forget(&mut self, id: &ConversationId) {
        self.seen.remove(id);
    }

    pub fn remembered_ids(&self, id: &ConversationId) -> usize {
        self.seen.get(id).map(SeenIds::len).unwrap_or(0)
    }

    /// Most recent activity first; conversations without activity last.
    pub fn sorted_by_activity(&self) -> Vec<&Conversation> {
        let mut sorted: Vec<&Conversation> = self.conversations.iter().collect();
        sorted.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        sorted
    }

    pub fn total_unread(&self) -> u32 {
        self.conversations
            .iter()
            .map(|conversation| conversation.unread_count)
            .sum()
    }

    fn get_mut(&mut self, id: &ConversationId) -> Option<&mut Conversation> {
        self.conversations
            .iter_mut()
            .find(|conversation| &conversation.id == id)
    }
}

fn bump_last_message(conversation: &mut Conversation, message: &Message) {
    let newer = conversation
        .last_activity
        .map_or(true, |activity| message.created_at >= activity);
    // A confirmation may carry a server timestamp older than its local placeholder.
    let confirms_pending = conversation.last_message.as_ref().is_some_and(|last| {
        last.id.is_temporary()
            && last.sender_id == message.sender_id
            && last.content == message.content
    });
    if newer || confirms_pending {
        conversation.last_message = Some(message.clone());
        conversation.last_activity = Some(message.created_at);
    }
}

#[cfg(test)]
#[path = "tests/conversation_list_tests.rs"]
mod tests;
