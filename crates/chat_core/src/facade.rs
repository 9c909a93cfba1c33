use std::sync::{Arc, Weak};

use shared::{
    domain::{ConversationId, MessageId, MessageStatus, UserId},
    protocol::{Conversation, Message, MessageContent, Participant, PushFrame},
};
use tokio::{
    sync::{broadcast, broadcast::error::RecvError, watch, Mutex, RwLock},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    api::{AuthorizedApi, ChatApi, HttpChatApi},
    config::{ChatSettings, ConnectionSettings},
    connection::{ConnectionManager, ConnectionSnapshot},
    conversations::ConversationIndex,
    credentials::{Credential, CredentialStore, RefreshCoordinator},
    error::{ChatError, ChatResult},
    reconciler::{MessageReconciler, PushOutcome},
    transport::{ChannelConnector, WsConnector},
};

const SEARCH_QUERY_CHARS: std::ops::RangeInclusive<usize> = 2..=64;

#[derive(Default)]
struct ChatState {
    me: Option<UserId>,
    reconciler: MessageReconciler,
    index: ConversationIndex,
}

/// Public surface of the chat core. UI code calls into it and reads
/// snapshots; push frames are applied by a background pump.
pub struct ChatFacade {
    api: AuthorizedApi,
    connection: Arc<ConnectionManager>,
    state: RwLock<ChatState>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl ChatFacade {
    /// HTTP backend and WebSocket channel described by `settings`.
    pub fn new(
        settings: &ChatSettings,
        store: Arc<dyn CredentialStore>,
    ) -> anyhow::Result<Arc<Self>> {
        let http = Arc::new(HttpChatApi::new(settings.api_base()?));
        let credentials =
            RefreshCoordinator::new(store, http.clone(), settings.token_refresh_leeway());
        Ok(Self::new_with_dependencies(
            http,
            credentials,
            Arc::new(WsConnector),
            settings.connection_settings()?,
        ))
    }

    pub fn new_with_dependencies(
        api: Arc<dyn ChatApi>,
        credentials: Arc<RefreshCoordinator>,
        connector: Arc<dyn ChannelConnector>,
        settings: ConnectionSettings,
    ) -> Arc<Self> {
        let connection = ConnectionManager::new(settings, connector, Arc::clone(&credentials));
        Arc::new(Self {
            api: AuthorizedApi::new(api, credentials),
            connection,
            state: RwLock::new(ChatState::default()),
            pump: Mutex::new(None),
        })
    }

    pub async fn sign_in(&self, credential: Credential, me: UserId) {
        self.api.credentials().store().set(credential);
        {
            let mut state = self.state.write().await;
            if state.me.as_ref() != Some(&me) {
                *state = ChatState::default();
            }
            state.me = Some(me.clone());
        }
        self.connection.set_authenticated(true).await;
        info!(user_id = %me, "signed in");
    }

    pub async fn sign_out(&self) {
        self.connection.set_authenticated(false).await;
        self.api.credentials().store().clear();
        *self.state.write().await = ChatState::default();
        if let Some(pump) = self.pump.lock().await.take() {
            pump.abort();
        }
        info!("signed out");
    }

    pub async fn connect(self: &Arc<Self>) {
        self.ensure_pump().await;
        self.connection.connect().await;
    }

    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }

    async fn ensure_pump(self: &Arc<Self>) {
        let mut pump = self.pump.lock().await;
        if pump.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let frames = self.connection.subscribe();
        *pump = Some(tokio::spawn(Self::pump_frames(Arc::downgrade(self), frames)));
    }

    async fn pump_frames(facade: Weak<Self>, mut frames: broadcast::Receiver<PushFrame>) {
        loop {
            match frames.recv().await {
                Ok(frame) => {
                    let Some(facade) = facade.upgrade() else {
                        break;
                    };
                    facade.handle_push(frame).await;
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "push pump fell behind; frames dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    /// Applies one push frame to the local state.
    pub async fn handle_push(&self, frame: PushFrame) {
        let mut guard = self.state.write().await;
        let ChatState {
            me,
            reconciler,
            index,
        } = &mut *guard;
        let Some(me) = me.as_ref() else {
            debug!(kind = frame.kind(), "push ignored; not signed in");
            return;
        };

        match frame {
            PushFrame::NewMessage { message_data } => {
                let conversation_id = message_data.chat.clone();
                match reconciler.on_push(message_data.clone(), me) {
                    PushOutcome::Duplicate => {
                        debug!(conversation_id = %conversation_id, message_id = %message_data.id, "duplicate push dropped");
                    }
                    outcome => {
                        debug!(conversation_id = %conversation_id, ?outcome, "push applied");
                        index.record_message(&message_data, me);
                    }
                }
            }
            PushFrame::NewChat { chat_data } => {
                let conversation_id = chat_data.id.clone();
                if index.insert(chat_data) {
                    info!(conversation_id = %conversation_id, "conversation added");
                }
            }
            PushFrame::MessageRead { chat_id } => {
                let updated = reconciler.on_read_receipt(&chat_id, me);
                debug!(conversation_id = %chat_id, updated, "read receipt applied");
            }
            PushFrame::ConnectionSuccess { message } => {
                debug!(message = message.as_deref().unwrap_or_default(), "channel acknowledged");
            }
            PushFrame::Error { .. } => {}
        }
    }

    /// Any call that ends in `AuthExpired` ends the session for the channel too.
    async fn observe<T>(&self, result: ChatResult<T>) -> ChatResult<T> {
        if let Err(ChatError::AuthExpired) = &result {
            self.connection.expire_session().await;
        }
        result
    }

    async fn me(&self) -> ChatResult<UserId> {
        self.state
            .read()
            .await
            .me
            .clone()
            .ok_or(ChatError::NoCredential)
    }

    pub async fn load_conversations(&self) -> ChatResult<Vec<Conversation>> {
        let conversations = self.observe(self.api.list_conversations().await).await?;
        let mut state = self.state.write().await;
        state.index.replace_all(conversations);
        info!(count = state.index.len(), "conversations loaded");
        Ok(state.index.conversations())
    }

    /// Loads the newest history page. Does not mark anything read.
    pub async fn select_conversation(&self, id: &ConversationId) -> ChatResult<Vec<Message>> {
        let page = self.observe(self.api.message_page(id, 1).await).await?;
        let mut state = self.state.write().await;
        state.reconciler.load_history(id, page);
        Ok(state.reconciler.messages(id))
    }

    /// Returns how many older messages were added.
    pub async fn load_older_messages(&self, id: &ConversationId) -> ChatResult<usize> {
        let Some(page_number) = self.state.read().await.reconciler.next_page(id) else {
            debug!(conversation_id = %id, "no older messages to load");
            return Ok(0);
        };
        let page = self
            .observe(self.api.message_page(id, page_number).await)
            .await?;
        let added = self
            .state
            .write()
            .await
            .reconciler
            .prepend_history(id, page);
        debug!(conversation_id = %id, page = page_number, added, "older messages loaded");
        Ok(added)
    }

    pub async fn send_message(
        &self,
        id: &ConversationId,
        content: MessageContent,
    ) -> ChatResult<Message> {
        validate_content(&content)?;
        let me = self.me().await?;
        let temp = self
            .state
            .write()
            .await
            .reconciler
            .begin_send(id, content.clone(), &me);

        let result = self.observe(self.api.send_message(id, &content).await).await;
        let mut guard = self.state.write().await;
        let ChatState {
            reconciler, index, ..
        } = &mut *guard;
        match result {
            Ok(mut confirmed) => {
                confirmed.status = MessageStatus::Sent;
                confirmed.is_temp = false;
                if !reconciler.confirm_send(id, &temp.id, confirmed.clone()) {
                    debug!(conversation_id = %id, message_id = %confirmed.id, "send already resolved by push");
                }
                index.record_message(&confirmed, &me);
                Ok(confirmed)
            }
            Err(err) => {
                if !reconciler.fail_send(id, &temp.id) {
                    if let Some(delivered) = reconciler.take_echoed(id, &temp.id) {
                        info!(conversation_id = %id, message_id = %delivered.id, error = %err, "send errored after its echo was delivered");
                        return Ok(delivered);
                    }
                }
                warn!(conversation_id = %id, temp_id = %temp.id, error = %err, "message send failed");
                Err(ChatError::SendFailed {
                    temp_id: temp.id,
                    reason: err.to_string(),
                })
            }
        }
    }

    /// Re-sends a failed message as a new send.
    pub async fn retry_message(
        &self,
        id: &ConversationId,
        temp_id: &MessageId,
    ) -> ChatResult<Message> {
        let failed = self
            .state
            .write()
            .await
            .reconciler
            .take_failed(id, temp_id)
            .ok_or_else(|| ChatError::Validation(format!("no failed message {temp_id}")))?;
        self.send_message(id, failed.content).await
    }

    /// Returns whether a read receipt was sent.
    pub async fn mark_as_viewed(&self, id: &ConversationId) -> ChatResult<bool> {
        if self.unread_count(id).await == 0 {
            debug!(conversation_id = %id, "nothing unread");
            return Ok(false);
        }
        self.observe(self.api.mark_read(id).await).await?;
        let mut state = self.state.write().await;
        state.index.clear_unread(id);
        if let Some(me) = state.me.clone() {
            state.reconciler.mark_incoming_read(id, &me);
        }
        Ok(true)
    }

    pub async fn search_participants(&self, query: &str) -> ChatResult<Vec<Participant>> {
        let query = query.trim();
        if !SEARCH_QUERY_CHARS.contains(&query.chars().count()) {
            return Err(ChatError::Validation(format!(
                "search query must be {} to {} characters",
                SEARCH_QUERY_CHARS.start(),
                SEARCH_QUERY_CHARS.end()
            )));
        }
        self.observe(self.api.search_participants(query).await).await
    }

    pub async fn create_conversation(&self, participant: &UserId) -> ChatResult<Conversation> {
        let conversation = self
            .observe(self.api.create_conversation(participant).await)
            .await?;
        self.state.write().await.index.insert(conversation.clone());
        Ok(conversation)
    }

    pub fn connection_state(&self) -> ConnectionSnapshot {
        self.connection.snapshot()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.connection.watch_state()
    }

    pub fn subscribe_frames(&self) -> broadcast::Receiver<PushFrame> {
        self.connection.subscribe()
    }

    pub async fn conversations(&self) -> Vec<Conversation> {
        self.state.read().await.index.conversations()
    }

    pub async fn messages(&self, id: &ConversationId) -> Vec<Message> {
        self.state.read().await.reconciler.messages(id)
    }

    pub async fn has_more_messages(&self, id: &ConversationId) -> bool {
        self.state.read().await.reconciler.has_more(id)
    }

    pub async fn unread_count(&self, id: &ConversationId) -> u32 {
        let state = self.state.read().await;
        match &state.me {
            Some(me) => state.index.unread_count(id, &state.reconciler, me),
            None => 0,
        }
    }

    pub async fn total_unread_count(&self) -> u32 {
        let state = self.state.read().await;
        match &state.me {
            Some(me) => state.index.total_unread_count(&state.reconciler, me),
            None => 0,
        }
    }
}

fn validate_content(content: &MessageContent) -> ChatResult<()> {
    let empty = match content {
        MessageContent::Text { text_content } => text_content.trim().is_empty(),
        MessageContent::Image { image_url } => image_url.trim().is_empty(),
    };
    if empty {
        return Err(ChatError::Validation("message is empty".into()));
    }
    Ok(())
}

#[cfg(test)]
#[path = "tests/facade_tests.rs"]
mod tests;
