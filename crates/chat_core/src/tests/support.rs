//! Fakes for the collaborator traits, shared by the unit tests.

use std::{
    collections::{HashMap, VecDeque},
    sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use jsonwebtoken::{EncodingKey, Header};
use serde::Serialize;
use shared::{
    domain::{ConversationId, MessageId, MessageStatus, UserId},
    error::{ApiError, ErrorCode},
    protocol::{Conversation, Message, MessageContent, Page, Participant, RefreshResponse},
};
use tokio::sync::{mpsc, oneshot, Mutex, Notify, Semaphore};
use url::Url;

use crate::{
    api::ChatApi,
    credentials::TokenRefresher,
    transport::{Channel, ChannelConnector, ChannelEvent, CloseInfo},
};

static NEXT_JTI: AtomicU64 = AtomicU64::new(1);

#[derive(Serialize)]
struct TestClaims {
    sub: String,
    exp: i64,
    jti: u64,
}

pub(crate) fn jwt_expiring_in(seconds: i64) -> String {
    let claims = TestClaims {
        sub: "7".to_string(),
        exp: (Utc::now() + Duration::seconds(seconds)).timestamp(),
        jti: NEXT_JTI.fetch_add(1, Ordering::SeqCst),
    };
    jsonwebtoken::encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(b"test-secret"),
    )
    .expect("encode jwt")
}

pub(crate) fn at(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_714_557_600 + seconds, 0)
        .single()
        .expect("timestamp")
}

pub(crate) fn me() -> UserId {
    UserId::from("me")
}

pub(crate) fn them() -> UserId {
    UserId::from("them")
}

pub(crate) fn chat(id: &str) -> ConversationId {
    ConversationId::from(id)
}

pub(crate) fn server_message(
    id: &str,
    conversation: &str,
    sender: &UserId,
    text: &str,
    created_at: DateTime<Utc>,
) -> Message {
    Message {
        id: MessageId::from(id),
        chat: chat(conversation),
        sender: sender.clone(),
        sender_username: None,
        content: MessageContent::text(text),
        created_at,
        is_read: false,
        status: MessageStatus::Sent,
        is_temp: false,
    }
}

pub(crate) fn conversation(id: &str, updated_at: DateTime<Utc>, unread_count: u32) -> Conversation {
    Conversation {
        id: chat(id),
        participants: vec![
            Participant {
                id: me(),
                username: "me".to_string(),
                avatar: None,
            },
            Participant {
                id: them(),
                username: "them".to_string(),
                avatar: None,
            },
        ],
        last_message: None,
        updated_at,
        unread_count,
    }
}

pub(crate) fn page(results: Vec<Message>, has_next: bool) -> Page<Message> {
    Page {
        count: results.len() as u64,
        next: has_next.then(|| "next".to_string()),
        previous: None,
        results,
    }
}

pub(crate) struct FakeRefresher {
    pub calls: AtomicUsize,
    gate: Option<Semaphore>,
    called: Notify,
    fail: bool,
    rotated_refresh_token: Option<String>,
    seen: Mutex<Vec<String>>,
}

impl FakeRefresher {
    pub fn succeeding() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            gate: None,
            called: Notify::new(),
            fail: false,
            rotated_refresh_token: None,
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Blocks every refresh until [`FakeRefresher::release`].
    pub fn gated() -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::succeeding()
        }
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn rotating(mut self, refresh_token: &str) -> Self {
        self.rotated_refresh_token = Some(refresh_token.to_string());
        self
    }

    pub fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(1024);
        }
    }

    pub async fn wait_until_called(&self) {
        self.called.notified().await;
    }

    pub async fn seen_refresh_tokens(&self) -> Vec<String> {
        self.seen.lock().await.clone()
    }
}

#[async_trait]
impl TokenRefresher for FakeRefresher {
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshResponse, ApiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().await.push(refresh_token.to_string());
        self.called.notify_one();
        if let Some(gate) = &self.gate {
            let _permit = gate.acquire().await;
        }
        if self.fail {
            return Err(ApiError::new(ErrorCode::Unauthorized, "refresh token rejected"));
        }
        Ok(RefreshResponse {
            access_token: jwt_expiring_in(600),
            refresh_token: self.rotated_refresh_token.clone(),
        })
    }
}

/// In-memory backend. Sent messages are echoed back with `srv-<n>` ids.
pub(crate) struct FakeChatApi {
    pub sender: UserId,
    pub conversations: Mutex<Vec<Conversation>>,
    pub pages: Mutex<HashMap<(ConversationId, u32), Page<Message>>>,
    pub sent: Mutex<Vec<(ConversationId, MessageContent)>>,
    pub mark_read_calls: Mutex<Vec<ConversationId>>,
    pub search_queries: Mutex<Vec<String>>,
    pub fail_sends: AtomicBool,
    pub fail_mark_read: AtomicBool,
    next_id: AtomicU64,
    send_gate: Option<Semaphore>,
    send_started: Notify,
}

impl FakeChatApi {
    pub fn new(sender: UserId) -> Self {
        Self {
            sender,
            conversations: Mutex::new(Vec::new()),
            pages: Mutex::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
            mark_read_calls: Mutex::new(Vec::new()),
            search_queries: Mutex::new(Vec::new()),
            fail_sends: AtomicBool::new(false),
            fail_mark_read: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            send_gate: None,
            send_started: Notify::new(),
        }
    }

    /// Holds every send response until [`FakeChatApi::release_sends`].
    pub fn with_gated_sends(mut self) -> Self {
        self.send_gate = Some(Semaphore::new(0));
        self
    }

    pub fn release_sends(&self) {
        if let Some(gate) = &self.send_gate {
            gate.add_permits(1024);
        }
    }

    pub async fn wait_for_send(&self) {
        self.send_started.notified().await;
    }

    /// Id the next successful send will be answered with.
    pub fn peek_next_id(&self) -> MessageId {
        MessageId::new(format!("srv-{}", self.next_id.load(Ordering::SeqCst)))
    }
}

#[async_trait]
impl ChatApi for FakeChatApi {
    async fn list_conversations(&self, _token: &str) -> Result<Vec<Conversation>, ApiError> {
        Ok(self.conversations.lock().await.clone())
    }

    async fn message_page(
        &self,
        _token: &str,
        conversation_id: &ConversationId,
        page: u32,
    ) -> Result<Page<Message>, ApiError> {
        self.pages
            .lock()
            .await
            .get(&(conversation_id.clone(), page))
            .cloned()
            .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "no such page"))
    }

    async fn send_message(
        &self,
        _token: &str,
        conversation_id: &ConversationId,
        content: &MessageContent,
    ) -> Result<Message, ApiError> {
        self.sent
            .lock()
            .await
            .push((conversation_id.clone(), content.clone()));
        self.send_started.notify_one();
        if let Some(gate) = &self.send_gate {
            let _permit = gate.acquire().await;
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(ApiError::network("connection refused"));
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(Message {
            id: MessageId::new(format!("srv-{n}")),
            chat: conversation_id.clone(),
            sender: self.sender.clone(),
            sender_username: None,
            content: content.clone(),
            created_at: Utc::now(),
            is_read: false,
            status: MessageStatus::Sent,
            is_temp: false,
        })
    }

    async fn mark_read(
        &self,
        _token: &str,
        conversation_id: &ConversationId,
    ) -> Result<(), ApiError> {
        self.mark_read_calls
            .lock()
            .await
            .push(conversation_id.clone());
        if self.fail_mark_read.load(Ordering::SeqCst) {
            return Err(ApiError::network("connection reset"));
        }
        Ok(())
    }

    async fn create_conversation(
        &self,
        _token: &str,
        participant_id: &UserId,
    ) -> Result<Conversation, ApiError> {
        let mut created = conversation(&format!("with-{participant_id}"), Utc::now(), 0);
        created.participants[1].id = participant_id.clone();
        Ok(created)
    }

    async fn search_participants(
        &self,
        _token: &str,
        query: &str,
    ) -> Result<Vec<Participant>, ApiError> {
        self.search_queries.lock().await.push(query.to_string());
        Ok(vec![Participant {
            id: them(),
            username: format!("{query}-match"),
            avatar: None,
        }])
    }
}

pub(crate) enum OpenBehavior {
    Accept,
    Reject(CloseInfo),
}

/// Test-side ends of an accepted channel.
pub(crate) struct FakeChannelHandle {
    pub events: mpsc::Sender<ChannelEvent>,
    pub closed: oneshot::Receiver<u16>,
}

/// Connector whose open attempts follow a script; once the script runs out
/// every attempt gets `fallback`.
pub(crate) struct FakeConnector {
    pub opened: Mutex<Vec<(tokio::time::Instant, Url)>>,
    script: Mutex<VecDeque<OpenBehavior>>,
    fallback: CloseInfo,
    accepted: Mutex<VecDeque<FakeChannelHandle>>,
    accepted_notify: Notify,
}

impl FakeConnector {
    pub fn new(script: Vec<OpenBehavior>) -> Self {
        Self {
            opened: Mutex::new(Vec::new()),
            script: Mutex::new(script.into()),
            fallback: CloseInfo::abnormal("connection refused"),
            accepted: Mutex::new(VecDeque::new()),
            accepted_notify: Notify::new(),
        }
    }

    pub async fn open_count(&self) -> usize {
        self.opened.lock().await.len()
    }

    pub async fn next_accepted(&self) -> FakeChannelHandle {
        loop {
            let notified = self.accepted_notify.notified();
            if let Some(handle) = self.accepted.lock().await.pop_front() {
                return handle;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl ChannelConnector for FakeConnector {
    async fn open(&self, url: &Url) -> Result<Channel, CloseInfo> {
        self.opened
            .lock()
            .await
            .push((tokio::time::Instant::now(), url.clone()));
        let behavior = self.script.lock().await.pop_front();
        match behavior {
            Some(OpenBehavior::Accept) => {
                let (events_tx, events_rx) = mpsc::channel(16);
                let (close_tx, close_rx) = oneshot::channel();
                self.accepted.lock().await.push_back(FakeChannelHandle {
                    events: events_tx,
                    closed: close_rx,
                });
                self.accepted_notify.notify_waiters();
                Ok(Channel::new(events_rx, close_tx))
            }
            Some(OpenBehavior::Reject(close)) => Err(close),
            None => Err(self.fallback.clone()),
        }
    }
}
