use std::sync::Arc;

use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use super::credentials::{
    CredentialStore, FileCredentialStore, KeyringCredentialStore, TokenPair,
};
use super::renewal::RenewalCoordinator;
use super::state::{SessionEvent, SessionSnapshot, SessionState, SessionStatus, TerminationReason};
use crate::api::{ApiClient, ApiError};
use crate::config::{Config, CredentialBackend};
use crate::models::{Identity, Role};

const LOGIN_PATH: &str = "/api/auth/login";
const SIGNUP_PATH: &str = "/api/auth/signup";
const ME_PATH: &str = "/api/auth/me";
const LOGOUT_PATH: &str = "/api/auth/logout";

#[derive(Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct SignupRequest<'a> {
    name: &'a str,
    email: &'a str,
    password: &'a str,
    role: Role,
}

#[derive(Deserialize)]
struct AuthResponse {
    #[serde(flatten)]
    tokens: TokenPair,
    user: Identity,
}

/// The client's session: who is signed in, and the API handle that carries
/// their credentials.
///
/// Each `Session` is independent: it owns its credential store, its state
/// and its renewal coordinator, and [`Session::client`] hands out API clients
/// bound to it.
pub struct Session {
    client: ApiClient,
}

impl Session {
    pub fn new(config: &Config, store: Arc<dyn CredentialStore>) -> Result<Self, ApiError> {
        let http = Client::builder().timeout(config.request_timeout()).build()?;
        let state = Arc::new(SessionState::new(store));
        let renewal = Arc::new(RenewalCoordinator::new(
            http.clone(),
            config.base_url(),
            Arc::clone(&state),
            config.renewal_timeout(),
        ));

        Ok(Self {
            client: ApiClient::new(http, config.base_url(), state, renewal),
        })
    }

    /// Session backed by the credential store named in `config`
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let store: Arc<dyn CredentialStore> = match config.credential_backend {
            CredentialBackend::Keyring => Arc::new(KeyringCredentialStore::new()?),
            CredentialBackend::File => Arc::new(FileCredentialStore::open(config.cache_dir()?)?),
        };
        Ok(Self::new(config, store)?)
    }

    /// API client that authenticates with this session. Cheap to call.
    pub fn client(&self) -> ApiClient {
        self.client.clone()
    }

    fn state(&self) -> &SessionState {
        self.client.state()
    }

    pub fn status(&self) -> SessionStatus {
        self.state().snapshot().status
    }

    pub fn current_user(&self) -> Option<Identity> {
        self.state().snapshot().identity
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.state().snapshot()
    }

    /// Follow status and identity changes
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.state().subscribe()
    }

    /// Session transitions, including the one-off `Terminated` signal
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.state().events()
    }

    pub fn has_stored_credentials(&self) -> bool {
        self.state().store().has_credentials()
    }

    /// Restore the session from stored tokens at start-up.
    ///
    /// Asks the server who the stored token belongs to. A 401 or 403 ends the
    /// session and clears the store; any other failure, e.g. the server being
    /// unreachable, keeps the stored tokens and reports `Unauthenticated`.
    pub async fn restore(&self) -> SessionStatus {
        let state = self.state();
        if state.store().access_token().is_none() {
            debug!("No stored session to restore");
            return self.status();
        }

        let epoch = state.epoch();
        state.set_status(SessionStatus::Authenticating);

        match self.client.get::<Identity>(ME_PATH).await {
            Ok(identity) => {
                info!(user_id = identity.id, "Session restored");
                state.confirm(identity);
            }
            Err(ApiError::Unauthorized(_) | ApiError::AccessDenied(_)) => {
                info!("Stored session rejected by server");
                state.terminate(Some(epoch), TerminationReason::Rejected);
            }
            Err(ApiError::RenewalFailed(ref e)) if e.is_terminal() => {
                // The coordinator has already torn the session down
                debug!(error = %e, "Stored session could not be renewed");
            }
            Err(e) => {
                warn!(error = %e, "Could not verify stored session, keeping credentials");
                state.abandon_sign_in(epoch, SessionSnapshot::unauthenticated());
            }
        }
        self.status()
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<Identity, ApiError> {
        self.authenticate(LOGIN_PATH, &LoginRequest { email, password })
            .await
    }

    pub async fn signup(
        &self,
        name: &str,
        email: &str,
        password: &str,
        role: Role,
    ) -> Result<Identity, ApiError> {
        let request = SignupRequest {
            name,
            email,
            password,
            role,
        };
        self.authenticate(SIGNUP_PATH, &request).await
    }

    /// Exchange credentials for a token pair. Errors carry the server's
    /// message unchanged and leave the previous state in place.
    async fn authenticate<B: Serialize>(&self, path: &str, body: &B) -> Result<Identity, ApiError> {
        let state = self.state();
        let epoch = state.epoch();
        let previous = state.set_status(SessionStatus::Authenticating);

        let result = match self.client.post_public::<AuthResponse, _>(path, body).await {
            Ok(response) => state
                .sign_in(&response.tokens, response.user.clone())
                .map(|()| response.user)
                .map_err(|e| ApiError::CredentialStorage(format!("{:#}", e))),
            Err(e) => Err(e),
        };

        if let Err(ref e) = result {
            debug!(path, error = %e, "Authentication failed");
            state.abandon_sign_in(epoch, previous);
        }
        result
    }

    /// Renew the access token now, sharing any renewal already in flight.
    /// Returns the current identity when the session survives.
    pub async fn refresh(&self) -> Result<Option<Identity>, ApiError> {
        self.client
            .renewal()
            .renew(None)
            .await
            .map_err(ApiError::RenewalFailed)?;
        Ok(self.current_user())
    }

    /// Sign out. The server is told on a best-effort basis; local credentials
    /// are always cleared. Calling this on a signed-out session does nothing.
    pub async fn logout(&self) {
        if self.state().store().access_token().is_some() {
            match self
                .client
                .request_without_renewal::<()>(Method::POST, LOGOUT_PATH, None)
                .await
            {
                Ok(_) => debug!("Server-side logout acknowledged"),
                Err(e) => warn!(error = %e, "Server-side logout failed"),
            }
        }
        self.state().terminate(None, TerminationReason::LoggedOut);
    }
}
