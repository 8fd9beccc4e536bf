use std::time::Duration;

use thiserror::Error;

/// Outcome of a failed token renewal.
///
/// Cloneable because a single renewal outcome is handed to every caller that
/// was waiting on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RenewalError {
    #[error("No session to renew")]
    NoSession,

    #[error("Refresh token rejected: {0}")]
    Rejected(String),

    #[error("Invalid renewal response: {0}")]
    InvalidResponse(String),

    #[error("Failed to store renewed tokens: {0}")]
    Storage(String),

    #[error("Renewal endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("Renewal timed out after {}s", .0.as_secs())]
    TimedOut(Duration),

    #[error("Renewal task aborted: {0}")]
    Aborted(String),
}

impl RenewalError {
    /// Terminal failures end the session; the rest leave stored credentials alone.
    ///
    /// A refresh that got no answer (`Unreachable`, `TimedOut`, `Aborted`) is
    /// not terminal: the stored pair is kept and the next 401 renews again.
    /// Only a refusal or unusable answer from the refresh endpoint, a missing
    /// refresh token or a failure to store the renewed pair clears the session.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RenewalError::NoSession
                | RenewalError::Rejected(_)
                | RenewalError::InvalidResponse(_)
                | RenewalError::Storage(_)
        )
    }
}
