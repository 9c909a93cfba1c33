use std::collections::{HashMap, HashSet};

use shared::{
    domain::{ConversationId, MessageId, UserId},
    protocol::{Conversation, Message},
};
use tracing::{debug, warn};

use crate::reconciler::MessageReconciler;

/// Conversation list, newest activity first.
#[derive(Debug, Default)]
pub struct ConversationIndex {
    conversations: Vec<Conversation>,
    /// Server ids already reflected in a preview or unread count.
    recorded: HashMap<ConversationId, HashSet<MessageId>>,
}

impl ConversationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn sort(&mut self) {
        self.conversations
            .sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    }

    fn find_mut(&mut self, id: &ConversationId) -> Option<&mut Conversation> {
        self.conversations.iter_mut().find(|c| &c.id == id)
    }

    fn remember_last(&mut self, conversation: &Conversation) {
        if let Some(last) = &conversation.last_message {
            self.recorded
                .entry(conversation.id.clone())
                .or_default()
                .insert(last.id.clone());
        }
    }

    /// Server counts in `conversations` already include every message seen
    /// so far, so recorded ids are kept across reloads.
    pub fn replace_all(&mut self, conversations: Vec<Conversation>) {
        self.conversations.clear();
        for conversation in conversations {
            if !self.contains(&conversation.id) {
                self.remember_last(&conversation);
                self.conversations.push(conversation);
            }
        }
        self.sort();
    }

    /// Returns false when the conversation is unknown or the message was
    /// already recorded.
    pub fn record_message(&mut self, message: &Message, me: &UserId) -> bool {
        let Some(conversation) = self
            .conversations
            .iter_mut()
            .find(|c| c.id == message.chat)
        else {
            warn!(conversation_id = %message.chat, "message for unknown conversation");
            return false;
        };
        if !self
            .recorded
            .entry(message.chat.clone())
            .or_default()
            .insert(message.id.clone())
        {
            debug!(conversation_id = %message.chat, message_id = %message.id, "message already recorded");
            return false;
        }
        conversation.updated_at = conversation.updated_at.max(message.created_at);
        let newer = conversation
            .last_message
            .as_ref()
            .map_or(true, |last| message.created_at >= last.created_at);
        if newer {
            conversation.last_message = Some(message.clone());
        }
        if !message.is_from(me) {
            conversation.unread_count = conversation.unread_count.saturating_add(1);
        }
        self.sort();
        true
    }

    /// Adds a conversation once; later inserts of the same id are ignored.
    pub fn insert(&mut self, conversation: Conversation) -> bool {
        if self.contains(&conversation.id) {
            return false;
        }
        self.remember_last(&conversation);
        self.conversations.insert(0, conversation);
        self.sort();
        true
    }

    pub fn clear_unread(&mut self, id: &ConversationId) -> bool {
        match self.find_mut(id) {
            Some(conversation) => {
                conversation.unread_count = 0;
                true
            }
            None => false,
        }
    }

    /// Counted from loaded history when available, otherwise the server's count.
    pub fn unread_count(
        &self,
        id: &ConversationId,
        reconciler: &MessageReconciler,
        me: &UserId,
    ) -> u32 {
        reconciler.unread_in(id, me).unwrap_or_else(|| {
            self.get(id)
                .map(|conversation| conversation.unread_count)
                .unwrap_or(0)
        })
    }

    pub fn total_unread_count(&self, reconciler: &MessageReconciler, me: &UserId) -> u32 {
        self.conversations
            .iter()
            .map(|conversation| self.unread_count(&conversation.id, reconciler, me))
            .fold(0, u32::saturating_add)
    }

    pub fn contains(&self, id: &ConversationId) -> bool {
        self.conversations.iter().any(|c| &c.id == id)
    }

    pub fn get(&self, id: &ConversationId) -> Option<&Conversation> {
        self.conversations.iter().find(|c| &c.id == id)
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        self.conversations.clone()
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }
}

#[cfg(test)]
#[path = "tests/conversations_tests.rs"]
mod tests;
