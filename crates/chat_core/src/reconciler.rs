use std::collections::{HashMap, HashSet};

use chrono::Utc;
use shared::{
    domain::{ConversationId, MessageId, MessageStatus, UserId},
    protocol::{Message, MessageContent, Page},
};
use tracing::debug;

/// What a pushed message did to the loaded sequences.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Appended,
    /// Our own send came back over the channel before the REST response.
    ReplacedTemp { temp_id: MessageId },
    Duplicate,
    /// History for the conversation has not been loaded; only the
    /// conversation list should account for it.
    NotLoaded,
}

#[derive(Debug, Default)]
struct Thread {
    messages: Vec<Message>,
    loaded: bool,
    has_more: bool,
    next_page: u32,
    /// Temp ids resolved by a push echo, mapped to the server id.
    echoed: HashMap<MessageId, MessageId>,
}

impl Thread {
    fn contains(&self, id: &MessageId) -> bool {
        self.messages.iter().any(|message| &message.id == id)
    }

    fn position(&self, id: &MessageId) -> Option<usize> {
        self.messages.iter().position(|message| &message.id == id)
    }

    fn normalize(&mut self) {
        let mut seen = HashSet::new();
        self.messages.retain(|message| seen.insert(message.id.clone()));
        self.messages.sort_by_key(|message| message.created_at);
    }
}

/// Canonical per-conversation message sequences. Ordered by `created_at`,
/// at most one entry per id, temps resolved in place.
#[derive(Debug, Default)]
pub struct MessageReconciler {
    threads: HashMap<ConversationId, Thread>,
}

impl MessageReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_send(
        &mut self,
        conversation_id: &ConversationId,
        content: MessageContent,
        me: &UserId,
    ) -> Message {
        let temp = Message {
            id: MessageId::temp(),
            chat: conversation_id.clone(),
            sender: me.clone(),
            sender_username: None,
            content,
            created_at: Utc::now(),
            is_read: false,
            status: MessageStatus::Sending,
            is_temp: true,
        };
        let thread = self.threads.entry(conversation_id.clone()).or_default();
        thread.messages.push(temp.clone());
        thread.normalize();
        temp
    }

    /// Swaps the temp for the server's copy. Returns false when the push echo
    /// already resolved it.
    pub fn confirm_send(
        &mut self,
        conversation_id: &ConversationId,
        temp_id: &MessageId,
        mut confirmed: Message,
    ) -> bool {
        let Some(thread) = self.threads.get_mut(conversation_id) else {
            return false;
        };
        let temp_at = thread.position(temp_id);
        if thread.contains(&confirmed.id) {
            if let Some(index) = temp_at {
                thread.messages.remove(index);
            }
            thread.echoed.remove(temp_id);
            debug!(message_id = %confirmed.id, "send confirmation already applied");
            return false;
        }
        let Some(index) = temp_at else {
            return false;
        };
        confirmed.status = MessageStatus::Sent;
        confirmed.is_temp = false;
        thread.messages[index] = confirmed;
        thread.normalize();
        true
    }

    pub fn fail_send(&mut self, conversation_id: &ConversationId, temp_id: &MessageId) -> bool {
        let Some(message) = self
            .threads
            .get_mut(conversation_id)
            .and_then(|thread| thread.messages.iter_mut().find(|m| &m.id == temp_id))
        else {
            return false;
        };
        if !message.is_temp {
            return false;
        }
        message.status = MessageStatus::Error;
        true
    }

    pub fn on_push(&mut self, mut message: Message, me: &UserId) -> PushOutcome {
        let Some(thread) = self.threads.get_mut(&message.chat) else {
            return PushOutcome::NotLoaded;
        };
        if thread.contains(&message.id) {
            return PushOutcome::Duplicate;
        }
        message.is_temp = false;

        if message.is_from(me) {
            let pending = thread.messages.iter().position(|candidate| {
                candidate.is_temp
                    && candidate.status == MessageStatus::Sending
                    && candidate.content == message.content
            });
            if let Some(index) = pending {
                let temp_id = thread.messages[index].id.clone();
                thread.echoed.insert(temp_id.clone(), message.id.clone());
                message.status = MessageStatus::Delivered;
                thread.messages[index] = message;
                thread.normalize();
                return PushOutcome::ReplacedTemp { temp_id };
            }
        }

        if !thread.loaded {
            return PushOutcome::NotLoaded;
        }
        thread.messages.push(message);
        thread.normalize();
        PushOutcome::Appended
    }

    /// The server copy of a send whose temp was already replaced by its
    /// push echo.
    pub fn take_echoed(
        &mut self,
        conversation_id: &ConversationId,
        temp_id: &MessageId,
    ) -> Option<Message> {
        let thread = self.threads.get_mut(conversation_id)?;
        let server_id = thread.echoed.remove(temp_id)?;
        thread
            .messages
            .iter()
            .find(|message| message.id == server_id)
            .cloned()
    }

    /// The other side read the conversation.
    pub fn on_read_receipt(&mut self, conversation_id: &ConversationId, me: &UserId) -> usize {
        let Some(thread) = self.threads.get_mut(conversation_id) else {
            return 0;
        };
        let mut updated = 0;
        for message in thread.messages.iter_mut().filter(|m| !m.is_temp) {
            if message.is_from(me) {
                if message.status != MessageStatus::Read {
                    message.status = MessageStatus::Read;
                    message.is_read = true;
                    updated += 1;
                }
            } else if !message.is_read {
                message.is_read = true;
                updated += 1;
            }
        }
        updated
    }

    pub fn mark_incoming_read(&mut self, conversation_id: &ConversationId, me: &UserId) -> usize {
        let Some(thread) = self.threads.get_mut(conversation_id) else {
            return 0;
        };
        let mut updated = 0;
        for message in thread
            .messages
            .iter_mut()
            .filter(|m| !m.is_from(me) && !m.is_read)
        {
            message.is_read = true;
            updated += 1;
        }
        updated
    }

    /// Replaces the loaded sequence with the newest page. Temps that are
    /// still pending or failed survive the reload.
    pub fn load_history(&mut self, conversation_id: &ConversationId, page: Page<Message>) {
        let has_more = page.has_next();
        let thread = self.threads.entry(conversation_id.clone()).or_default();
        let pending: Vec<Message> = thread
            .messages
            .drain(..)
            .filter(|message| message.is_temp)
            .collect();
        thread.messages = page.results.into_iter().rev().collect();
        thread.messages.extend(pending);
        thread.normalize();
        thread.loaded = true;
        thread.has_more = has_more;
        thread.next_page = 2;
    }

    /// Merges an older page. Returns how many messages were new.
    pub fn prepend_history(&mut self, conversation_id: &ConversationId, page: Page<Message>) -> usize {
        let has_more = page.has_next();
        let thread = self.threads.entry(conversation_id.clone()).or_default();
        let before = thread.messages.len();
        let older: Vec<Message> = page
            .results
            .into_iter()
            .filter(|message| !thread.contains(&message.id))
            .collect();
        thread.messages.extend(older);
        thread.normalize();
        thread.loaded = true;
        thread.has_more = has_more;
        thread.next_page = thread.next_page.max(2) + 1;
        thread.messages.len() - before
    }

    /// Removes a failed temp so it can be sent again.
    pub fn take_failed(
        &mut self,
        conversation_id: &ConversationId,
        temp_id: &MessageId,
    ) -> Option<Message> {
        let thread = self.threads.get_mut(conversation_id)?;
        let index = thread.messages.iter().position(|message| {
            &message.id == temp_id && message.is_temp && message.status == MessageStatus::Error
        })?;
        Some(thread.messages.remove(index))
    }

    pub fn messages(&self, conversation_id: &ConversationId) -> Vec<Message> {
        self.threads
            .get(conversation_id)
            .map(|thread| thread.messages.clone())
            .unwrap_or_default()
    }

    pub fn is_loaded(&self, conversation_id: &ConversationId) -> bool {
        self.threads
            .get(conversation_id)
            .is_some_and(|thread| thread.loaded)
    }

    pub fn has_more(&self, conversation_id: &ConversationId) -> bool {
        self.threads
            .get(conversation_id)
            .is_some_and(|thread| thread.loaded && thread.has_more)
    }

    /// Page number to request for older history, if there is one.
    pub fn next_page(&self, conversation_id: &ConversationId) -> Option<u32> {
        self.threads
            .get(conversation_id)
            .filter(|thread| thread.loaded && thread.has_more)
            .map(|thread| thread.next_page)
    }

    /// Unread messages from others, or `None` when history is not loaded.
    pub fn unread_in(&self, conversation_id: &ConversationId, me: &UserId) -> Option<u32> {
        let thread = self.threads.get(conversation_id).filter(|t| t.loaded)?;
        let unread = thread
            .messages
            .iter()
            .filter(|message| !message.is_temp && !message.is_read && !message.is_from(me))
            .count();
        Some(u32::try_from(unread).unwrap_or(u32::MAX))
    }
}

#[cfg(test)]
#[path = "tests/reconciler_tests.rs"]
mod tests;
