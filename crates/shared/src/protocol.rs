use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{ConversationId, MessageId, MessageStatus, MessageType, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: UserId,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

/// Message body, discriminated on the wire by `message_type`. Serializes to
/// exactly the send payload (`{message_type, text_content | image_url}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
pub enum MessageContent {
    Text { text_content: String },
    Image { image_url: String },
}

impl MessageContent {
    pub fn text(text: impl Into<String>) -> Self {
        MessageContent::Text {
            text_content: text.into(),
        }
    }

    pub fn image(url: impl Into<String>) -> Self {
        MessageContent::Image {
            image_url: url.into(),
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            MessageContent::Text { .. } => MessageType::Text,
            MessageContent::Image { .. } => MessageType::Image,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub chat: ConversationId,
    pub sender: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_username: Option<String>,
    #[serde(flatten)]
    pub content: MessageContent,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub is_read: bool,
    /// Local delivery state; the backend does not send it.
    #[serde(default)]
    pub status: MessageStatus,
    #[serde(default)]
    pub is_temp: bool,
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        self.content.message_type()
    }

    pub fn is_from(&self, user_id: &UserId) -> bool {
        &self.sender == user_id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    #[serde(default)]
    pub participants: Vec<Participant>,
    #[serde(default)]
    pub last_message: Option<Message>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub unread_count: u32,
}

/// Frame received over the push channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushFrame {
    ConnectionSuccess {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    NewMessage {
        message_data: Message,
    },
    NewChat {
        chat_data: Conversation,
    },
    MessageRead {
        chat_id: ConversationId,
    },
    Error {
        message: String,
    },
}

impl PushFrame {
    pub fn kind(&self) -> &'static str {
        match self {
            PushFrame::ConnectionSuccess { .. } => "connection_success",
            PushFrame::NewMessage { .. } => "new_message",
            PushFrame::NewChat { .. } => "new_chat",
            PushFrame::MessageRead { .. } => "message_read",
            PushFrame::Error { .. } => "error",
        }
    }
}

/// Django-style page. History pages are ordered newest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    #[serde(default)]
    pub count: u64,
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub previous: Option<String>,
    pub results: Vec<T>,
}

impl<T> Page<T> {
    pub fn has_next(&self) -> bool {
        self.next.is_some()
    }
}

/// List endpoints answer either with a bare array or a page.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ListResponse<T> {
    Paged(Page<T>),
    Plain(Vec<T>),
}

impl<T> ListResponse<T> {
    pub fn into_items(self) -> Vec<T> {
        match self {
            ListResponse::Paged(page) => page.results,
            ListResponse::Plain(items) => items,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateConversationRequest {
    pub participant_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshResponse {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}
