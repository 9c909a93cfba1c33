use shared::{
    domain::MessageId,
    error::{ApiError, ErrorCode},
};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    #[error("network error: {0}")]
    TransientNetwork(String),
    #[error("session expired, please sign in again")]
    AuthExpired,
    #[error("no credential")]
    NoCredential,
    #[error("failed to send message {temp_id}: {reason}")]
    SendFailed { temp_id: MessageId, reason: String },
    /// Push frame that could not be decoded; logged and dropped.
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("api error: {0}")]
    Api(ApiError),
}

impl From<ApiError> for ChatError {
    fn from(err: ApiError) -> Self {
        match err.code {
            ErrorCode::Network => ChatError::TransientNetwork(err.message),
            _ => ChatError::Api(err),
        }
    }
}

pub type ChatResult<T> = std::result::Result<T, ChatError>;
