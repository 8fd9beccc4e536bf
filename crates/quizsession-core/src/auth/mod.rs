//! Authentication module for managing client sessions and credentials.
//!
//! This module provides:
//! - `Session`: the session context (login, signup, logout, restore, status)
//! - `CredentialStore`: durable token storage (memory, OS keychain, file)
//! - single-flight token renewal shared by every API call of a session
//!
//! Access tokens are short-lived; an expired one is renewed with the refresh
//! token the first time the server answers 401.

pub mod credentials;
pub mod error;
pub(crate) mod renewal;
pub mod session;
pub(crate) mod state;

pub use credentials::{
    CredentialStore, FileCredentialStore, KeyringCredentialStore, MemoryCredentialStore,
    TokenPair,
};
pub use error::RenewalError;
pub use session::Session;
pub use state::{SessionEvent, SessionSnapshot, SessionStatus, TerminationReason};
