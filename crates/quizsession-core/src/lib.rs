//! Client-side session management for the quiz service.
//!
//! A [`Session`] owns the credential store, the observable session state and
//! the renewal coordinator. Feature code talks to the API through
//! [`ApiClient`] handles obtained from [`Session::client`]; every call carries
//! the current bearer token and an expired token is renewed at most once per
//! burst of failures, no matter how many calls hit the 401 together.

pub mod api;
pub mod auth;
pub mod config;
pub mod models;

pub use api::{ApiClient, ApiError};
pub use auth::{
    CredentialStore, FileCredentialStore, KeyringCredentialStore, MemoryCredentialStore,
    RenewalError, Session, SessionEvent, SessionSnapshot, SessionStatus, TerminationReason,
    TokenPair,
};
pub use config::{Config, CredentialBackend};
pub use models::{Attempt, Difficulty, Identity, Quiz, Role};
