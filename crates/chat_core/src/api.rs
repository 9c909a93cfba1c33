use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use shared::{
    domain::{ConversationId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        Conversation, CreateConversationRequest, ListResponse, Message, MessageContent, Page,
        Participant, RefreshRequest, RefreshResponse,
    },
};
use tracing::debug;
use url::Url;

use crate::{
    credentials::{RefreshCoordinator, TokenRefresher},
    error::{ChatError, ChatResult},
};

/// REST contract of the messaging backend. Every call takes the bearer
/// token explicitly; [`AuthorizedApi`] supplies it.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn list_conversations(&self, token: &str) -> Result<Vec<Conversation>, ApiError>;
    async fn message_page(
        &self,
        token: &str,
        conversation_id: &ConversationId,
        page: u32,
    ) -> Result<Page<Message>, ApiError>;
    async fn send_message(
        &self,
        token: &str,
        conversation_id: &ConversationId,
        content: &MessageContent,
    ) -> Result<Message, ApiError>;
    async fn mark_read(&self, token: &str, conversation_id: &ConversationId)
        -> Result<(), ApiError>;
    async fn create_conversation(
        &self,
        token: &str,
        participant_id: &UserId,
    ) -> Result<Conversation, ApiError>;
    async fn search_participants(
        &self,
        token: &str,
        query: &str,
    ) -> Result<Vec<Participant>, ApiError>;
}

pub struct HttpChatApi {
    http: Client,
    base: Url,
}

impl HttpChatApi {
    pub fn new(base: Url) -> Self {
        Self {
            http: Client::new(),
            base,
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        self.base.join(path).map_err(|err| {
            ApiError::new(ErrorCode::Internal, format!("invalid endpoint '{path}': {err}"))
        })
    }

    async fn check(response: Response) -> Result<Response, ApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ApiError::new(
            ErrorCode::from_status(status.as_u16()),
            format!("{status}: {body}"),
        ))
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
        Self::check(response)
            .await?
            .json::<T>()
            .await
            .map_err(|err| ApiError::new(ErrorCode::Internal, format!("invalid response body: {err}")))
    }
}

fn transport_error(err: reqwest::Error) -> ApiError {
    ApiError::network(err.to_string())
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn list_conversations(&self, token: &str) -> Result<Vec<Conversation>, ApiError> {
        let response = self
            .http
            .get(self.endpoint("chat/")?)
            .bearer_auth(token)
            .send()
            .await
            .map_err(transport_error)?;
        Self::decode::<ListResponse<Conversation>>(response)
            .await
            .map(ListResponse::into_items)
    }

    async fn message_page(
        &self,
        token: &str,
        conversation_id: &ConversationId,
        page: u32,
    ) -> Result<Page<Message>, ApiError> {
        let response = self
            .http
            .get(self.endpoint(&format!("chat/{conversation_id}/messages/"))?)
            .query(&[("page", page)])
            .bearer_auth(token)
            .send()
            .await
            .map_err(transport_error)?;
        Self::decode(response).await
    }

    async fn send_message(
        &self,
        token: &str,
        conversation_id: &ConversationId,
        content: &MessageContent,
    ) -> Result<Message, ApiError> {
        let response = self
            .http
            .post(self.endpoint(&format!("chat/{conversation_id}/messages/"))?)
            .bearer_auth(token)
            .json(content)
            .send()
            .await
            .map_err(transport_error)?;
        Self::decode(response).await
    }

    async fn mark_read(
        &self,
        token: &str,
        conversation_id: &ConversationId,
    ) -> Result<(), ApiError> {
        let response = self
            .http
            .post(self.endpoint(&format!("chat/{conversation_id}/mark_read/"))?)
            .bearer_auth(token)
            .send()
            .await
            .map_err(transport_error)?;
        Self::check(response).await.map(|_| ())
    }

    async fn create_conversation(
        &self,
        token: &str,
        participant_id: &UserId,
    ) -> Result<Conversation, ApiError> {
        let response = self
            .http
            .post(self.endpoint("chat/")?)
            .bearer_auth(token)
            .json(&CreateConversationRequest {
                participant_id: participant_id.clone(),
            })
            .send()
            .await
            .map_err(transport_error)?;
        Self::decode(response).await
    }

    async fn search_participants(
        &self,
        token: &str,
        query: &str,
    ) -> Result<Vec<Participant>, ApiError> {
        let response = self
            .http
            .get(self.endpoint("chat/search_users/")?)
            .query(&[("q", query)])
            .bearer_auth(token)
            .send()
            .await
            .map_err(transport_error)?;
        Self::decode::<ListResponse<Participant>>(response)
            .await
            .map(ListResponse::into_items)
    }
}

#[async_trait]
impl TokenRefresher for HttpChatApi {
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshResponse, ApiError> {
        let response = self
            .http
            .post(self.endpoint("auth/refresh/")?)
            .json(&RefreshRequest {
                refresh_token: refresh_token.to_string(),
            })
            .send()
            .await
            .map_err(transport_error)?;
        Self::decode(response).await
    }
}

/// Runs REST calls with a currently valid access token. A 401 forces one
/// refresh and one retry.
pub struct AuthorizedApi {
    api: Arc<dyn ChatApi>,
    credentials: Arc<RefreshCoordinator>,
}

impl AuthorizedApi {
    pub fn new(api: Arc<dyn ChatApi>, credentials: Arc<RefreshCoordinator>) -> Self {
        Self { api, credentials }
    }

    pub fn credentials(&self) -> &Arc<RefreshCoordinator> {
        &self.credentials
    }

    pub async fn call<'f, T, F>(&self, op: F) -> ChatResult<T>
    where
        F: Fn(String) -> BoxFuture<'f, Result<T, ApiError>>,
    {
        let credential = self.credentials.valid_credential().await?;
        match op(credential.access_token.clone()).await {
            Err(err) if err.is_unauthorized() => {
                debug!("access token rejected by backend; refreshing once");
                let renewed = self
                    .credentials
                    .force_refresh(&credential.access_token)
                    .await?;
                op(renewed.access_token).await.map_err(ChatError::from)
            }
            other => other.map_err(ChatError::from),
        }
    }

    pub async fn list_conversations(&self) -> ChatResult<Vec<Conversation>> {
        let api = self.api.as_ref();
        self.call(move |token| Box::pin(async move { api.list_conversations(&token).await }))
            .await
    }

    pub async fn message_page(
        &self,
        conversation_id: &ConversationId,
        page: u32,
    ) -> ChatResult<Page<Message>> {
        let api = self.api.as_ref();
        self.call(move |token| {
            Box::pin(async move { api.message_page(&token, conversation_id, page).await })
        })
        .await
    }

    pub async fn send_message(
        &self,
        conversation_id: &ConversationId,
        content: &MessageContent,
    ) -> ChatResult<Message> {
        let api = self.api.as_ref();
        self.call(move |token| {
            Box::pin(async move { api.send_message(&token, conversation_id, content).await })
        })
        .await
    }

    pub async fn mark_read(&self, conversation_id: &ConversationId) -> ChatResult<()> {
        let api = self.api.as_ref();
        self.call(move |token| {
            Box::pin(async move { api.mark_read(&token, conversation_id).await })
        })
        .await
    }

    pub async fn create_conversation(&self, participant_id: &UserId) -> ChatResult<Conversation> {
        let api = self.api.as_ref();
        self.call(move |token| {
            Box::pin(async move { api.create_conversation(&token, participant_id).await })
        })
        .await
    }

    pub async fn search_participants(&self, query: &str) -> ChatResult<Vec<Participant>> {
        let api = self.api.as_ref();
        self.call(move |token| {
            Box::pin(async move { api.search_participants(&token, query).await })
        })
        .await
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
