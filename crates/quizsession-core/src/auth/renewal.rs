//! Single-flight token renewal.
//!
//! At most one refresh call is in flight per session. The first caller to find
//! the coordinator idle spawns the renewal task and parks a shared handle to
//! its outcome; every caller arriving before it settles awaits that same
//! handle. The task runs on its own, so callers that give up do not stall it
//! and the stored credentials always end up consistent.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::credentials::TokenPair;
use super::error::RenewalError;
use super::state::{SessionState, TerminationReason};
use crate::api::ApiError;
use crate::models::Identity;

pub(crate) const REFRESH_PATH: &str = "/api/auth/refresh";

type RenewalOutcome = Result<TokenPair, RenewalError>;

#[derive(Serialize)]
struct RefreshRequest<'a> {
    token: &'a str,
}

#[derive(Deserialize)]
struct RefreshResponse {
    #[serde(flatten)]
    tokens: TokenPair,
    #[serde(default)]
    user: Option<Identity>,
}

struct PendingRenewal {
    id: u64,
    outcome: Shared<BoxFuture<'static, RenewalOutcome>>,
}

type PendingSlot = Arc<Mutex<Option<PendingRenewal>>>;

/// Empties the pending slot when the renewal task finishes, panics included.
/// Only the task that filled the slot may empty it.
struct PendingGuard {
    slot: PendingSlot,
    id: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|pending| pending.id == self.id) {
            *slot = None;
        }
    }
}

pub(crate) struct RenewalCoordinator {
    http: Client,
    refresh_url: String,
    state: Arc<SessionState>,
    timeout: Duration,
    pending: PendingSlot,
    next_id: AtomicU64,
}

impl RenewalCoordinator {
    pub(crate) fn new(
        http: Client,
        base_url: &str,
        state: Arc<SessionState>,
        timeout: Duration,
    ) -> Self {
        Self {
            http,
            refresh_url: format!("{}{}", base_url, REFRESH_PATH),
            state,
            timeout,
            pending: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(0),
        }
    }

    #[cfg(test)]
    fn is_renewing(&self) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Obtain a renewed token pair.
    ///
    /// `rejected` is the access token the server just refused. If the store
    /// already holds a different one, an earlier renewal has replaced it and
    /// that pair is returned without another refresh call. `None` forces a
    /// renewal unless one is already in flight.
    pub(crate) async fn renew(&self, rejected: Option<&str>) -> RenewalOutcome {
        let outcome = {
            let mut slot = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            match slot.as_ref() {
                Some(pending) => {
                    debug!(renewal = pending.id, "Joining in-flight renewal");
                    pending.outcome.clone()
                }
                None => {
                    if let (Some(rejected), Some(current)) = (rejected, self.state.store().read()) {
                        if current.access_token != rejected {
                            debug!("Token already renewed, reusing current pair");
                            return Ok(current);
                        }
                    }

                    let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
                    let guard = PendingGuard {
                        slot: Arc::clone(&self.pending),
                        id,
                    };
                    let task = RenewalTask {
                        http: self.http.clone(),
                        refresh_url: self.refresh_url.clone(),
                        state: Arc::clone(&self.state),
                        timeout: self.timeout,
                    };
                    debug!(renewal = id, "Starting renewal");
                    let handle = tokio::spawn(async move {
                        let _guard = guard;
                        task.run().await
                    });
                    let outcome = async move {
                        match handle.await {
                            Ok(outcome) => outcome,
                            Err(e) => Err(RenewalError::Aborted(e.to_string())),
                        }
                    }
                    .boxed()
                    .shared();
                    *slot = Some(PendingRenewal {
                        id,
                        outcome: outcome.clone(),
                    });
                    outcome
                }
            }
        };
        outcome.await
    }
}

/// Everything the spawned renewal needs, detached from the coordinator
struct RenewalTask {
    http: Client,
    refresh_url: String,
    state: Arc<SessionState>,
    timeout: Duration,
}

impl RenewalTask {
    async fn run(self) -> RenewalOutcome {
        let epoch = self.state.epoch();
        let Some(refresh_token) = self.state.store().refresh_token() else {
            debug!("No refresh token stored");
            self.state
                .terminate(Some(epoch), TerminationReason::RenewalFailed);
            return Err(RenewalError::NoSession);
        };

        let previous = self.state.begin_renewal();
        let exchanged = match tokio::time::timeout(self.timeout, self.exchange(&refresh_token)).await {
            Ok(result) => result,
            Err(_) => Err(RenewalError::TimedOut(self.timeout)),
        };

        let outcome = exchanged.and_then(|response| {
            self.state
                .complete_renewal(epoch, &response.tokens, response.user, previous)
                .map(|()| response.tokens)
        });

        match outcome {
            Ok(tokens) => {
                info!("Session renewed");
                Ok(tokens)
            }
            Err(e) if e.is_terminal() => {
                warn!(error = %e, "Renewal failed, ending session");
                self.state
                    .terminate(Some(epoch), TerminationReason::RenewalFailed);
                Err(e)
            }
            Err(e) => {
                warn!(error = %e, "Renewal did not complete, keeping stored credentials");
                self.state.settle_renewal(epoch, previous);
                Err(e)
            }
        }
    }

    async fn exchange(&self, refresh_token: &str) -> Result<RefreshResponse, RenewalError> {
        let response = self
            .http
            .post(&self.refresh_url)
            .json(&RefreshRequest {
                token: refresh_token,
            })
            .send()
            .await
            .map_err(|e| RenewalError::Unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RenewalError::Rejected(format!(
                "{}: {}",
                status,
                ApiError::server_message(&body)
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| RenewalError::Unreachable(e.to_string()))?;
        serde_json::from_str(&body).map_err(|e| RenewalError::InvalidResponse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{CredentialStore, MemoryCredentialStore};

    fn coordinator(store: MemoryCredentialStore) -> RenewalCoordinator {
        let state = Arc::new(SessionState::new(Arc::new(store)));
        // Nothing listens on port 9; these tests never reach the network
        RenewalCoordinator::new(
            Client::new(),
            "http://127.0.0.1:9",
            state,
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn test_no_refresh_token_fails_fast() {
        let coordinator = coordinator(MemoryCredentialStore::new());
        assert_eq!(coordinator.renew(None).await, Err(RenewalError::NoSession));
        assert!(!coordinator.is_renewing());
    }

    #[tokio::test]
    async fn test_already_renewed_token_is_reused() {
        let coordinator = coordinator(MemoryCredentialStore::with_tokens(TokenPair::new(
            "A2", "R2",
        )));
        let tokens = coordinator.renew(Some("A1")).await.unwrap();
        assert_eq!(tokens, TokenPair::new("A2", "R2"));
        assert_eq!(coordinator.state.store().refresh_token().as_deref(), Some("R2"));
    }

    #[test]
    fn test_refresh_response_without_user() {
        let response: RefreshResponse =
            serde_json::from_str(r#"{"token":"A2","refreshToken":"R2"}"#).unwrap();
        assert_eq!(response.tokens, TokenPair::new("A2", "R2"));
        assert!(response.user.is_none());
    }
}
