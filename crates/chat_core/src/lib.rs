//! Client core for marketplace chat: a self-healing push channel, a
//! single-flight credential refresher, and reconciliation of optimistic
//! sends with server state.

pub mod api;
pub mod config;
pub mod connection;
pub mod conversations;
pub mod credentials;
pub mod error;
pub mod facade;
pub mod reconciler;
pub mod transport;

pub use api::{AuthorizedApi, ChatApi, HttpChatApi};
pub use config::{load_settings, ChatSettings, ConnectionSettings};
pub use connection::{ConnectionIssue, ConnectionManager, ConnectionSnapshot, ConnectionState};
pub use conversations::ConversationIndex;
pub use credentials::{
    Credential, CredentialStore, MemoryCredentialStore, RefreshCoordinator, TokenRefresher,
};
pub use error::{ChatError, ChatResult};
pub use facade::ChatFacade;
pub use reconciler::{MessageReconciler, PushOutcome};
pub use transport::{ChannelConnector, WsConnector};

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;
