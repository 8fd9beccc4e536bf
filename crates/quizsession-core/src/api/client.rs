//! API client for the quiz service.
//!
//! Every call made through [`ApiClient::request`] runs the token pipeline:
//! the current access token is attached as a bearer credential, a 401 asks
//! the renewal coordinator for a fresh token and re-issues the call once, and
//! a 429 is retried with backoff.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use reqwest::{Client, Method, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use super::ApiError;
use crate::auth::renewal::RenewalCoordinator;
use crate::auth::state::SessionState;

// ============================================================================
// Constants
// ============================================================================

/// A call is re-issued at most this many times after a 401.
const MAX_AUTH_RETRIES: u32 = 1;

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Upper bound of the random jitter added to each backoff, in milliseconds.
const BACKOFF_JITTER_MS: u64 = 250;

/// Per-call retry bookkeeping, carried through the pipeline for one call only
#[derive(Debug, Clone, Copy)]
struct CallContext {
    auth_retries: u32,
    rate_limit_retries: u32,
    backoff_ms: u64,
    renew_on_401: bool,
}

impl CallContext {
    fn new() -> Self {
        Self {
            auth_retries: 0,
            rate_limit_retries: 0,
            backoff_ms: INITIAL_BACKOFF_MS,
            renew_on_401: true,
        }
    }

    /// For calls that must not start a renewal, e.g. server-side logout
    fn without_renewal() -> Self {
        Self {
            renew_on_401: false,
            ..Self::new()
        }
    }

    fn may_renew(&self) -> bool {
        self.renew_on_401 && self.auth_retries < MAX_AUTH_RETRIES
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        if self.rate_limit_retries >= MAX_RATE_LIMIT_RETRIES {
            return None;
        }
        self.rate_limit_retries += 1;
        let jitter = rand::thread_rng().gen_range(0..=BACKOFF_JITTER_MS);
        let delay = Duration::from_millis(self.backoff_ms + jitter);
        self.backoff_ms *= 2; // Exponential backoff
        Some(delay)
    }
}

/// API client bound to one session.
/// Clone is cheap - the reqwest::Client and the session state are shared.
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    base_url: Arc<str>,
    state: Arc<SessionState>,
    renewal: Arc<RenewalCoordinator>,
}

impl ApiClient {
    pub(crate) fn new(
        http: Client,
        base_url: &str,
        state: Arc<SessionState>,
        renewal: Arc<RenewalCoordinator>,
    ) -> Self {
        Self {
            http,
            base_url: Arc::from(base_url),
            state,
            renewal,
        }
    }

    pub(crate) fn state(&self) -> &Arc<SessionState> {
        &self.state
    }

    pub(crate) fn renewal(&self) -> &RenewalCoordinator {
        &self.renewal
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Issue an authenticated call through the token pipeline.
    ///
    /// Success responses are returned as-is. A 401 triggers one renewal and
    /// one re-issue; a 401 on the re-issued call, a 403, and every other
    /// error status are returned as [`ApiError`] without renewal.
    ///
    /// If the renewal itself fails, the call returns
    /// [`ApiError::RenewalFailed`] with the [`RenewalError`] behind it, not
    /// the 401 that started it. Match on that variant (or use
    /// [`ApiError::is_auth_failure`]) to detect a lost session.
    ///
    /// [`RenewalError`]: crate::auth::RenewalError
    pub async fn request<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<Response, ApiError> {
        self.run(method, path, body, CallContext::new()).await
    }

    pub(crate) async fn request_without_renewal<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<Response, ApiError> {
        self.run(method, path, body, CallContext::without_renewal())
            .await
    }

    async fn run<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        mut call: CallContext,
    ) -> Result<Response, ApiError> {
        let url = self.url(path);

        loop {
            let token = self.state.store().access_token();
            let mut builder = self.http.request(method.clone(), &url);
            if let Some(ref token) = token {
                builder = builder.bearer_auth(token);
            }
            if let Some(body) = body {
                builder = builder.json(body);
            }

            let response = builder.send().await?;
            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }

            match status {
                StatusCode::UNAUTHORIZED if call.may_renew() => {
                    call.auth_retries += 1;
                    debug!(%method, path, "Unauthorized, renewing session before retry");
                    self.renewal
                        .renew(token.as_deref())
                        .await
                        .map_err(ApiError::RenewalFailed)?;
                }
                StatusCode::TOO_MANY_REQUESTS => match call.next_backoff() {
                    Some(delay) => {
                        warn!(
                            path,
                            retry = call.rate_limit_retries,
                            backoff_ms = delay.as_millis() as u64,
                            "Rate limited, backing off"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(ApiError::RateLimited),
                },
                _ => {
                    let body = response.text().await.unwrap_or_default();
                    debug!(%method, path, %status, "Request failed");
                    return Err(ApiError::from_status(status, &body));
                }
            }
        }
    }

    /// Unauthenticated POST for the sign-in endpoints: no bearer token, no renewal
    pub(crate) async fn post_public<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let response = self.http.post(self.url(path)).json(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::from_status(status, &body));
        }
        Self::parse(response, path).await
    }

    async fn parse<T: DeserializeOwned>(response: Response, path: &str) -> Result<T, ApiError> {
        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| {
            ApiError::InvalidResponse(format!("Failed to parse response from {}: {}", path, e))
        })
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let response = self.request::<()>(Method::GET, path, None).await?;
        Self::parse(response, path).await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let response = self.request(Method::POST, path, Some(body)).await?;
        Self::parse(response, path).await
    }

    pub async fn put<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let response = self.request(Method::PUT, path, Some(body)).await?;
        Self::parse(response, path).await
    }

    pub async fn delete(&self, path: &str) -> Result<(), ApiError> {
        self.request::<()>(Method::DELETE, path, None).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_context_allows_one_renewal() {
        let mut call = CallContext::new();
        assert!(call.may_renew());
        call.auth_retries += 1;
        assert!(!call.may_renew());
    }

    #[test]
    fn test_call_context_without_renewal() {
        assert!(!CallContext::without_renewal().may_renew());
    }

    #[test]
    fn test_backoff_doubles_and_gives_up() {
        let mut call = CallContext::new();
        let first = call.next_backoff().unwrap();
        let second = call.next_backoff().unwrap();
        let third = call.next_backoff().unwrap();

        assert!(first >= Duration::from_millis(INITIAL_BACKOFF_MS));
        assert!(first <= Duration::from_millis(INITIAL_BACKOFF_MS + BACKOFF_JITTER_MS));
        assert!(second >= Duration::from_millis(INITIAL_BACKOFF_MS * 2));
        assert!(third >= Duration::from_millis(INITIAL_BACKOFF_MS * 4));
        assert!(call.next_backoff().is_none());
    }
}
