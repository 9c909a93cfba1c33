use std::{fmt, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{DecodingKey, Validation};
use serde::Deserialize;
use shared::{error::ApiError, protocol::RefreshResponse};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::error::{ChatError, ChatResult};

#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .finish()
    }
}

#[derive(Deserialize)]
struct ExpiryClaims {
    exp: i64,
}

impl Credential {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
        }
    }

    /// Reads the `exp` claim of the access token. The signature is not
    /// checked; the backend does that, this only decides when to refresh.
    pub fn access_expires_at(&self) -> Option<DateTime<Utc>> {
        let mut validation = Validation::default();
        validation.insecure_disable_signature_validation();
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        let data = jsonwebtoken::decode::<ExpiryClaims>(
            &self.access_token,
            &DecodingKey::from_secret(&[]),
            &validation,
        )
        .ok()?;
        DateTime::from_timestamp(data.claims.exp, 0)
    }

    /// Tokens without a readable expiry count as expired.
    pub fn is_access_valid(&self, now: DateTime<Utc>, leeway: chrono::Duration) -> bool {
        match self.access_expires_at() {
            Some(expires_at) => expires_at - leeway > now,
            None => false,
        }
    }
}

pub trait CredentialStore: Send + Sync {
    fn get(&self) -> Option<Credential>;
    fn set(&self, credential: Credential);
    fn clear(&self);
}

#[derive(Default)]
pub struct MemoryCredentialStore {
    inner: std::sync::RwLock<Option<Credential>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credential(credential: Credential) -> Self {
        Self {
            inner: std::sync::RwLock::new(Some(credential)),
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self) -> Option<Credential> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set(&self, credential: Credential) {
        *self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(credential);
    }

    fn clear(&self) {
        *self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
    }
}

#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshResponse, ApiError>;
}

type RefreshOutcome = ChatResult<Credential>;

#[derive(Default)]
struct RefreshState {
    in_flight: bool,
    waiters: Vec<oneshot::Sender<RefreshOutcome>>,
}

enum Step {
    Ready(Credential),
    Wait(oneshot::Receiver<RefreshOutcome>),
}

/// Single-flight access token refresh shared by the channel opener and REST
/// callers. The refresh call runs on its own task so a caller being dropped
/// never strands the wait-list.
pub struct RefreshCoordinator {
    store: Arc<dyn CredentialStore>,
    refresher: Arc<dyn TokenRefresher>,
    leeway: chrono::Duration,
    state: Mutex<RefreshState>,
}

impl RefreshCoordinator {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        refresher: Arc<dyn TokenRefresher>,
        leeway: chrono::Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            refresher,
            leeway,
            state: Mutex::new(RefreshState::default()),
        })
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    pub async fn valid_credential(self: &Arc<Self>) -> ChatResult<Credential> {
        let step = {
            let mut state = self.state.lock().await;
            if state.in_flight {
                Step::Wait(Self::join_wait_list(&mut state))
            } else {
                let current = self.store.get().ok_or(ChatError::NoCredential)?;
                if current.is_access_valid(Utc::now(), self.leeway) {
                    Step::Ready(current)
                } else {
                    Step::Wait(self.start_refresh(&mut state, current))
                }
            }
        };
        Self::finish(step).await
    }

    pub async fn access_token(self: &Arc<Self>) -> ChatResult<String> {
        self.valid_credential()
            .await
            .map(|credential| credential.access_token)
    }

    /// Called when the backend rejected `rejected_access_token` even though it
    /// looked valid locally. A token already replaced by a concurrent refresh
    /// is returned without another network call.
    pub async fn force_refresh(
        self: &Arc<Self>,
        rejected_access_token: &str,
    ) -> ChatResult<Credential> {
        let step = {
            let mut state = self.state.lock().await;
            if state.in_flight {
                Step::Wait(Self::join_wait_list(&mut state))
            } else {
                let current = self.store.get().ok_or(ChatError::NoCredential)?;
                if current.access_token != rejected_access_token {
                    debug!("rejected token already replaced; skipping refresh");
                    Step::Ready(current)
                } else {
                    Step::Wait(self.start_refresh(&mut state, current))
                }
            }
        };
        Self::finish(step).await
    }

    async fn finish(step: Step) -> ChatResult<Credential> {
        match step {
            Step::Ready(credential) => Ok(credential),
            Step::Wait(rx) => rx.await.unwrap_or(Err(ChatError::AuthExpired)),
        }
    }

    fn join_wait_list(state: &mut RefreshState) -> oneshot::Receiver<RefreshOutcome> {
        let (tx, rx) = oneshot::channel();
        state.waiters.push(tx);
        rx
    }

    fn start_refresh(
        self: &Arc<Self>,
        state: &mut RefreshState,
        current: Credential,
    ) -> oneshot::Receiver<RefreshOutcome> {
        state.in_flight = true;
        let rx = Self::join_wait_list(state);
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            coordinator.run_refresh(current).await;
        });
        rx
    }

    async fn run_refresh(&self, current: Credential) {
        info!("refreshing access token");
        let outcome = match self.refresher.refresh(&current.refresh_token).await {
            Ok(response) => {
                let renewed = Credential {
                    access_token: response.access_token,
                    refresh_token: response.refresh_token.unwrap_or(current.refresh_token),
                };
                self.store.set(renewed.clone());
                info!("access token refreshed");
                Ok(renewed)
            }
            Err(err) => {
                warn!(error = %err, "token refresh failed; clearing stored credentials");
                self.store.clear();
                Err(ChatError::AuthExpired)
            }
        };

        let waiters = {
            let mut state = self.state.lock().await;
            state.in_flight = false;
            std::mem::take(&mut state.waiters)
        };
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }
}

#[cfg(test)]
#[path = "tests/credentials_tests.rs"]
mod tests;
