use std::borrow::Cow;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        protocol::{frame::coding::CloseCode, CloseFrame},
        Error as WsError, Message as WsMessage,
    },
};
use tracing::{debug, warn};
use url::Url;

pub const NORMAL_CLOSURE: u16 = 1000;
pub const NO_STATUS: u16 = 1005;
pub const ABNORMAL_CLOSURE: u16 = 1006;
/// Close codes the backend uses when it refuses the token on the channel.
pub const AUTH_REJECTED_CODES: [u16; 2] = [4001, 4003];

const CHANNEL_PATH: &str = "ws/chat/user/";
const EVENT_QUEUE: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

impl CloseInfo {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self::new(ABNORMAL_CLOSURE, reason)
    }

    pub fn auth_rejected(reason: impl Into<String>) -> Self {
        Self::new(AUTH_REJECTED_CODES[0], reason)
    }

    pub fn is_normal(&self) -> bool {
        self.code == NORMAL_CLOSURE
    }

    pub fn is_auth_rejection(&self) -> bool {
        AUTH_REJECTED_CODES.contains(&self.code)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Frame(String),
    Closed(CloseInfo),
}

/// An open push channel: inbound events plus a one-shot close request that
/// carries the close code to send.
pub struct Channel {
    pub events: mpsc::Receiver<ChannelEvent>,
    pub close: oneshot::Sender<u16>,
}

impl Channel {
    pub fn new(events: mpsc::Receiver<ChannelEvent>, close: oneshot::Sender<u16>) -> Self {
        Self { events, close }
    }
}

/// Opens the push channel. A failed handshake is reported as the close it
/// amounts to, so the caller runs one code path for both.
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    async fn open(&self, url: &Url) -> Result<Channel, CloseInfo>;
}

/// `<ws_base>/ws/chat/user/?token=<access_token>`
pub fn channel_url(ws_base: &Url, access_token: &str) -> Result<Url, url::ParseError> {
    let mut url = ws_base.join(CHANNEL_PATH)?;
    url.query_pairs_mut()
        .clear()
        .append_pair("token", access_token);
    Ok(url)
}

pub struct WsConnector;

fn handshake_failure(err: WsError) -> CloseInfo {
    match err {
        WsError::Http(response) if matches!(response.status().as_u16(), 401 | 403) => {
            CloseInfo::auth_rejected(format!("handshake rejected: {}", response.status()))
        }
        other => CloseInfo::abnormal(format!("handshake failed: {other}")),
    }
}

#[async_trait]
impl ChannelConnector for WsConnector {
    async fn open(&self, url: &Url) -> Result<Channel, CloseInfo> {
        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(handshake_failure)?;
        let (mut writer, mut reader) = stream.split();
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let (close_tx, mut close_rx) = oneshot::channel::<u16>();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = reader.next() => {
                        let close = match frame {
                            Some(Ok(WsMessage::Text(text))) => {
                                if events_tx.send(ChannelEvent::Frame(text)).await.is_err() {
                                    break;
                                }
                                continue;
                            }
                            Some(Ok(WsMessage::Close(frame))) => frame
                                .map(|frame| CloseInfo::new(u16::from(frame.code), frame.reason.into_owned()))
                                .unwrap_or_else(|| CloseInfo::new(NO_STATUS, "")),
                            Some(Ok(_)) => continue,
                            Some(Err(err)) => {
                                warn!(error = %err, "push channel receive failed");
                                CloseInfo::abnormal(err.to_string())
                            }
                            None => CloseInfo::abnormal("stream ended"),
                        };
                        let _ = events_tx.send(ChannelEvent::Closed(close)).await;
                        break;
                    }
                    code = &mut close_rx => {
                        let code = code.unwrap_or(NORMAL_CLOSURE);
                        debug!(code, "closing push channel");
                        let _ = writer
                            .send(WsMessage::Close(Some(CloseFrame {
                                code: CloseCode::from(code),
                                reason: Cow::Borrowed("client closing"),
                            })))
                            .await;
                        break;
                    }
                }
            }
        });

        Ok(Channel::new(events_rx, close_tx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_url_carries_token_under_fixed_path() {
        let base = Url::parse("wss://market.example/").expect("base");
        let url = channel_url(&base, "abc.def").expect("url");
        assert_eq!(url.as_str(), "wss://market.example/ws/chat/user/?token=abc.def");
    }

    #[test]
    fn classifies_close_codes() {
        assert!(CloseInfo::new(NORMAL_CLOSURE, "bye").is_normal());
        assert!(CloseInfo::new(4003, "forbidden").is_auth_rejection());
        assert!(!CloseInfo::abnormal("reset").is_auth_rejection());
        assert!(!CloseInfo::abnormal("reset").is_normal());
    }
}
