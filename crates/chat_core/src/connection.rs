use std::sync::Arc;

use futures::future::BoxFuture;
use shared::protocol::PushFrame;
use thiserror::Error;
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    config::ConnectionSettings,
    credentials::RefreshCoordinator,
    error::ChatError,
    transport::{channel_url, ChannelConnector, ChannelEvent, CloseInfo, NORMAL_CLOSURE},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Why the channel is not (or was not) connected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionIssue {
    #[error("no credential")]
    NoCredential,
    #[error("session expired, please sign in again")]
    AuthExpired,
    #[error("max reconnect attempts exceeded")]
    RetriesExhausted,
    #[error("server error: {0}")]
    Server(String),
    #[error("connection lost: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub reconnect_attempt: u32,
    pub last_error: Option<ConnectionIssue>,
}

struct ConnectionInner {
    state: ConnectionState,
    reconnect_attempt: u32,
    last_error: Option<ConnectionIssue>,
    authenticated: bool,
    /// Bumped for every channel attempt and every teardown; completions
    /// carrying an older value are ignored.
    generation: u64,
    close_tx: Option<oneshot::Sender<u16>>,
    reader: Option<JoinHandle<()>>,
    timer: Option<JoinHandle<()>>,
}

impl ConnectionInner {
    fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            state: self.state,
            reconnect_attempt: self.reconnect_attempt,
            last_error: self.last_error.clone(),
        }
    }

    fn close_channel(&mut self) {
        if let Some(close) = self.close_tx.take() {
            let _ = close.send(NORMAL_CLOSURE);
        }
    }

    fn stop_tasks(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// Owns the push channel: opens it with a fresh access token, decodes and
/// broadcasts inbound frames, and reconnects with capped exponential backoff.
pub struct ConnectionManager {
    settings: ConnectionSettings,
    connector: Arc<dyn ChannelConnector>,
    credentials: Arc<RefreshCoordinator>,
    inner: Mutex<ConnectionInner>,
    events: broadcast::Sender<PushFrame>,
    state: watch::Sender<ConnectionSnapshot>,
}

impl ConnectionManager {
    pub fn new(
        settings: ConnectionSettings,
        connector: Arc<dyn ChannelConnector>,
        credentials: Arc<RefreshCoordinator>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(settings.event_buffer.max(1));
        let (state, _) = watch::channel(ConnectionSnapshot::default());
        Arc::new(Self {
            settings,
            connector,
            credentials,
            inner: Mutex::new(ConnectionInner {
                state: ConnectionState::Disconnected,
                reconnect_attempt: 0,
                last_error: None,
                authenticated: false,
                generation: 0,
                close_tx: None,
                reader: None,
                timer: None,
            }),
            events,
            state,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PushFrame> {
        self.events.subscribe()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.state.borrow().clone()
    }

    fn publish(&self, inner: &ConnectionInner) {
        self.state.send_replace(inner.snapshot());
    }

    /// Opens the channel unless one is already open or opening. While a
    /// reconnect is pending the timer is cancelled and the attempt made now.
    pub async fn connect(self: &Arc<Self>) {
        let generation = {
            let mut inner = self.inner.lock().await;
            match inner.state {
                ConnectionState::Connecting | ConnectionState::Connected => {
                    debug!(state = ?inner.state, "connect ignored; channel already active");
                    return;
                }
                ConnectionState::Reconnecting => {
                    if let Some(timer) = inner.timer.take() {
                        timer.abort();
                    }
                }
                ConnectionState::Disconnected => inner.reconnect_attempt = 0,
            }
            if !inner.authenticated {
                inner.state = ConnectionState::Disconnected;
                inner.last_error = Some(ConnectionIssue::NoCredential);
                self.publish(&inner);
                debug!("connect skipped; not authenticated");
                return;
            }
            inner.generation += 1;
            inner.state = ConnectionState::Connecting;
            self.publish(&inner);
            inner.generation
        };
        self.open_channel(generation).await;
    }

    /// Closes the channel with a normal closure and cancels any pending reconnect.
    pub async fn disconnect(&self) {
        let mut inner = self.inner.lock().await;
        self.teardown(&mut inner, None);
        info!("push channel disconnected");
    }

    /// Signing out (or losing the session) tears the channel down; only an
    /// authenticated manager opens channels.
    pub async fn set_authenticated(&self, authenticated: bool) {
        let mut inner = self.inner.lock().await;
        inner.authenticated = authenticated;
        if !authenticated && inner.state != ConnectionState::Disconnected {
            self.teardown(&mut inner, None);
            info!("push channel closed after sign-out");
        }
    }

    /// The session could not be renewed anywhere in the client.
    pub async fn expire_session(&self) {
        let mut inner = self.inner.lock().await;
        inner.authenticated = false;
        self.teardown(&mut inner, Some(ConnectionIssue::AuthExpired));
        warn!("session expired; push channel stopped");
    }

    fn teardown(&self, inner: &mut ConnectionInner, issue: Option<ConnectionIssue>) {
        inner.generation += 1;
        inner.close_channel();
        inner.stop_tasks();
        inner.state = ConnectionState::Disconnected;
        inner.reconnect_attempt = 0;
        inner.last_error = issue;
        self.publish(inner);
    }

    async fn open_channel(self: &Arc<Self>, generation: u64) {
        let token = match self.credentials.access_token().await {
            Ok(token) => token,
            Err(err) => {
                self.credential_unavailable(generation, err).await;
                return;
            }
        };
        let url = match channel_url(&self.settings.ws_base_url, &token) {
            Ok(url) => url,
            Err(err) => {
                let mut inner = self.inner.lock().await;
                if inner.generation == generation {
                    self.fail_terminal(
                        &mut inner,
                        ConnectionIssue::Transport(format!("invalid channel url: {err}")),
                    );
                }
                return;
            }
        };

        debug!(generation, "opening push channel");
        match self.connector.open(&url).await {
            Ok(channel) => {
                let mut inner = self.inner.lock().await;
                if inner.generation != generation || inner.state != ConnectionState::Connecting {
                    debug!(generation, "closing channel opened for a superseded attempt");
                    let _ = channel.close.send(NORMAL_CLOSURE);
                    return;
                }
                inner.state = ConnectionState::Connected;
                inner.reconnect_attempt = 0;
                inner.last_error = None;
                inner.close_tx = Some(channel.close);
                inner.reader = Some(tokio::spawn(Arc::clone(self).read_loop(
                    generation,
                    channel.events,
                    token,
                )));
                self.publish(&inner);
                info!(generation, "push channel connected");
            }
            Err(close) => self.handle_close(generation, close, &token).await,
        }
    }

    async fn credential_unavailable(&self, generation: u64, err: ChatError) {
        let mut inner = self.inner.lock().await;
        if inner.generation != generation {
            return;
        }
        match err {
            ChatError::NoCredential => {
                inner.state = ConnectionState::Disconnected;
                inner.last_error = Some(ConnectionIssue::NoCredential);
                self.publish(&inner);
                warn!("no credential available for the push channel");
            }
            _ => {
                inner.authenticated = false;
                self.fail_terminal(&mut inner, ConnectionIssue::AuthExpired);
            }
        }
    }

    async fn read_loop(
        self: Arc<Self>,
        generation: u64,
        mut events: mpsc::Receiver<ChannelEvent>,
        token: String,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                ChannelEvent::Frame(text) => self.dispatch_frame(generation, &text).await,
                ChannelEvent::Closed(close) => {
                    self.handle_close(generation, close, &token).await;
                    return;
                }
            }
        }
        self.handle_close(generation, CloseInfo::abnormal("channel dropped"), &token)
            .await;
    }

    async fn dispatch_frame(&self, generation: u64, text: &str) {
        let frame = match decode_frame(text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "dropping push frame");
                return;
            }
        };
        {
            let mut inner = self.inner.lock().await;
            if inner.generation != generation {
                debug!(kind = frame.kind(), "dropping frame from superseded channel");
                return;
            }
            if let PushFrame::Error { message } = &frame {
                warn!(message = %message, "server reported an error on the push channel");
                inner.last_error = Some(ConnectionIssue::Server(message.clone()));
                self.publish(&inner);
            }
        }
        debug!(kind = frame.kind(), "push frame received");
        let _ = self.events.send(frame);
    }

    async fn handle_close(self: &Arc<Self>, generation: u64, close: CloseInfo, token: &str) {
        {
            let mut inner = self.inner.lock().await;
            if inner.generation != generation {
                debug!(code = close.code, "ignoring close of superseded channel");
                return;
            }
            // The reader (or the opener) is the caller; its handle is released, not aborted.
            inner.close_tx = None;
            inner.reader = None;

            if !inner.authenticated {
                inner.state = ConnectionState::Disconnected;
                self.publish(&inner);
                return;
            }
            if close.is_normal() {
                info!(code = close.code, "push channel closed by server");
                inner.state = ConnectionState::Disconnected;
                inner.reconnect_attempt = 0;
                inner.last_error = None;
                self.publish(&inner);
                return;
            }
            if inner.reconnect_attempt >= self.settings.max_reconnect_attempts {
                self.fail_terminal(&mut inner, ConnectionIssue::RetriesExhausted);
                return;
            }

            let attempt = inner.reconnect_attempt;
            inner.reconnect_attempt += 1;
            inner.state = ConnectionState::Reconnecting;
            inner.last_error = Some(ConnectionIssue::Transport(if close.reason.is_empty() {
                format!("closed with code {}", close.code)
            } else {
                close.reason.clone()
            }));
            self.publish(&inner);
            info!(
                attempt = attempt + 1,
                code = close.code,
                reason = %close.reason,
                "push channel lost; reconnect scheduled"
            );
        }

        if close.is_auth_rejection() {
            if let Err(err) = self.credentials.force_refresh(token).await {
                warn!(error = %err, "credential rejected by push channel and refresh failed");
                let mut inner = self.inner.lock().await;
                if inner.generation == generation {
                    inner.authenticated = false;
                    self.fail_terminal(&mut inner, ConnectionIssue::AuthExpired);
                }
                return;
            }
        }

        self.schedule_reconnect(generation).await;
    }

    async fn schedule_reconnect(self: &Arc<Self>, generation: u64) {
        let mut inner = self.inner.lock().await;
        if inner.generation != generation || inner.state != ConnectionState::Reconnecting {
            return;
        }
        let delay = self
            .settings
            .backoff_delay(inner.reconnect_attempt.saturating_sub(1));
        debug!(
            attempt = inner.reconnect_attempt,
            delay_ms = delay.as_millis() as u64,
            "arming reconnect timer"
        );
        let manager = Arc::clone(self);
        inner.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            manager.reconnect(generation).await;
        }));
    }

    /// Boxed so the reconnect path can be spawned from inside the close handler.
    fn reconnect(self: Arc<Self>, generation: u64) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let next = {
                let mut inner = self.inner.lock().await;
                if inner.generation != generation || inner.state != ConnectionState::Reconnecting {
                    return;
                }
                inner.timer = None;
                inner.generation += 1;
                inner.state = ConnectionState::Connecting;
                self.publish(&inner);
                info!(attempt = inner.reconnect_attempt, "reconnecting push channel");
                inner.generation
            };
            self.open_channel(next).await;
        })
    }

    fn fail_terminal(&self, inner: &mut ConnectionInner, issue: ConnectionIssue) {
        warn!(issue = %issue, attempts = inner.reconnect_attempt, "push channel stopped");
        inner.close_channel();
        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }
        inner.state = ConnectionState::Disconnected;
        inner.last_error = Some(issue);
        self.publish(inner);
    }
}

/// Unknown frame types and malformed payloads are protocol errors.
pub(crate) fn decode_frame(text: &str) -> Result<PushFrame, ChatError> {
    serde_json::from_str(text).map_err(|err| ChatError::Protocol(err.to_string()))
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
