use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

use super::credentials::{CredentialStore, TokenPair};
use super::error::RenewalError;
use crate::models::Identity;

/// Capacity of the session event channel. Slow listeners lose the oldest events.
const EVENT_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum SessionStatus {
    Unauthenticated,
    Authenticating,
    Authenticated,
    Renewing,
}

/// What observers see. `identity` is only ever set alongside `Authenticated`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub status: SessionStatus,
    pub identity: Option<Identity>,
}

impl SessionSnapshot {
    pub(crate) fn unauthenticated() -> Self {
        Self {
            status: SessionStatus::Unauthenticated,
            identity: None,
        }
    }

    fn with_status(status: SessionStatus) -> Self {
        Self {
            status,
            identity: None,
        }
    }

    fn authenticated(identity: Identity) -> Self {
        Self {
            status: SessionStatus::Authenticated,
            identity: Some(identity),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// The user asked to sign out
    LoggedOut,
    /// The refresh token was missing or refused
    RenewalFailed,
    /// The server refused the stored token on start-up
    Rejected,
}

/// Emitted on session transitions. `Terminated` is the application's cue to
/// navigate back to its sign-in surface, and fires once per session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Authenticated(Identity),
    Renewed,
    Terminated(TerminationReason),
}

/// State shared by the session context, the token pipeline and the renewal
/// coordinator.
///
/// Every change to the stored tokens goes through here under the epoch lock.
/// Sign-in and teardown bump the epoch, and a renewal only commits tokens if
/// the epoch it started in is still current. A renewal that settles after a
/// logout therefore cannot bring the old session back.
pub(crate) struct SessionState {
    store: Arc<dyn CredentialStore>,
    epoch: Mutex<u64>,
    // Identity kept across `Renewing`, where the public snapshot hides it
    identity: Mutex<Option<Identity>>,
    snapshot: watch::Sender<SessionSnapshot>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionState {
    pub(crate) fn new(store: Arc<dyn CredentialStore>) -> Self {
        let (snapshot, _) = watch::channel(SessionSnapshot::unauthenticated());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            epoch: Mutex::new(0),
            identity: Mutex::new(None),
            snapshot,
            events,
        }
    }

    pub(crate) fn store(&self) -> &dyn CredentialStore {
        self.store.as_ref()
    }

    pub(crate) fn epoch(&self) -> u64 {
        *self.epoch.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.subscribe()
    }

    pub(crate) fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SessionEvent) {
        // No listeners is fine
        let _ = self.events.send(event);
    }

    fn remember(&self, identity: Option<Identity>) {
        *self.identity.lock().unwrap_or_else(PoisonError::into_inner) = identity;
    }

    fn remembered(&self) -> Option<Identity> {
        self.identity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the public snapshot, returning the one it replaced
    pub(crate) fn set_status(&self, status: SessionStatus) -> SessionSnapshot {
        self.snapshot.send_replace(SessionSnapshot::with_status(status))
    }

    /// Put `snapshot` back after a sign-in attempt that did not succeed.
    ///
    /// Nothing happens if the session was replaced or torn down since
    /// `started_epoch`, or if the status has already moved on from
    /// `Authenticating`. Returns true when the snapshot was put back.
    pub(crate) fn abandon_sign_in(&self, started_epoch: u64, snapshot: SessionSnapshot) -> bool {
        let epoch = self.epoch.lock().unwrap_or_else(PoisonError::into_inner);
        if *epoch != started_epoch {
            return false;
        }
        self.snapshot.send_if_modified(|current| {
            if current.status == SessionStatus::Authenticating {
                *current = snapshot;
                true
            } else {
                false
            }
        })
    }

    /// Store a fresh token pair from login or signup and publish the identity
    pub(crate) fn sign_in(&self, tokens: &TokenPair, identity: Identity) -> anyhow::Result<()> {
        {
            let mut epoch = self.epoch.lock().unwrap_or_else(PoisonError::into_inner);
            self.store.save(tokens)?;
            *epoch += 1;
        }
        self.confirm(identity.clone());
        info!(user_id = identity.id, role = %identity.role, "Signed in");
        Ok(())
    }

    /// The server vouched for the current token and told us who we are
    pub(crate) fn confirm(&self, identity: Identity) {
        self.remember(Some(identity.clone()));
        self.snapshot
            .send_replace(SessionSnapshot::authenticated(identity.clone()));
        self.emit(SessionEvent::Authenticated(identity));
    }

    /// Enter `Renewing`, returning the status to fall back to
    pub(crate) fn begin_renewal(&self) -> SessionStatus {
        let mut previous = SessionStatus::Unauthenticated;
        self.snapshot.send_modify(|snapshot| {
            previous = snapshot.status;
            *snapshot = SessionSnapshot::with_status(SessionStatus::Renewing);
        });
        previous
    }

    /// Commit renewed tokens if the session that asked for them still exists
    pub(crate) fn complete_renewal(
        &self,
        started_epoch: u64,
        tokens: &TokenPair,
        identity: Option<Identity>,
        previous: SessionStatus,
    ) -> Result<(), RenewalError> {
        {
            let epoch = self.epoch.lock().unwrap_or_else(PoisonError::into_inner);
            if *epoch != started_epoch {
                return Err(RenewalError::Aborted(
                    "session changed while renewing".to_string(),
                ));
            }
            self.store
                .save(tokens)
                .map_err(|e| RenewalError::Storage(format!("{:#}", e)))?;
        }

        if let Some(identity) = identity {
            self.remember(Some(identity));
        }
        self.settle_renewal(started_epoch, previous);
        self.emit(SessionEvent::Renewed);
        Ok(())
    }

    /// Leave `Renewing` without touching the stored tokens. A session that was
    /// replaced or torn down meanwhile keeps its own status.
    pub(crate) fn settle_renewal(&self, started_epoch: u64, previous: SessionStatus) {
        if self.epoch() != started_epoch {
            return;
        }
        let next = match self.remembered() {
            Some(identity) => SessionSnapshot::authenticated(identity),
            None => SessionSnapshot::with_status(previous),
        };
        self.snapshot.send_replace(next);
    }

    /// Clear credentials and move to `Unauthenticated`.
    ///
    /// With `expected_epoch` set, nothing happens if the session has changed
    /// since. Returns true when this call performed the transition; only that
    /// call emits `Terminated`.
    pub(crate) fn terminate(&self, expected_epoch: Option<u64>, reason: TerminationReason) -> bool {
        {
            let mut epoch = self.epoch.lock().unwrap_or_else(PoisonError::into_inner);
            if expected_epoch.is_some_and(|expected| expected != *epoch) {
                return false;
            }
            if let Err(e) = self.store.clear() {
                warn!(error = %e, "Failed to clear stored credentials");
            }
            *epoch += 1;
        }
        self.remember(None);

        let transitioned = self.snapshot.send_if_modified(|snapshot| {
            if snapshot.status == SessionStatus::Unauthenticated {
                false
            } else {
                *snapshot = SessionSnapshot::unauthenticated();
                true
            }
        });

        if transitioned {
            info!(?reason, "Session terminated");
            self.emit(SessionEvent::Terminated(reason));
        }
        transitioned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MemoryCredentialStore;
    use crate::models::Role;

    fn teacher() -> Identity {
        Identity {
            id: 1,
            display_name: "T".to_string(),
            email: None,
            role: Role::Teacher,
        }
    }

    fn state() -> SessionState {
        SessionState::new(Arc::new(MemoryCredentialStore::new()))
    }

    #[test]
    fn test_sign_in_publishes_identity() {
        let state = state();
        let mut events = state.events();
        state.sign_in(&TokenPair::new("A1", "R1"), teacher()).unwrap();

        let snapshot = state.snapshot();
        assert_eq!(snapshot.status, SessionStatus::Authenticated);
        assert_eq!(snapshot.identity, Some(teacher()));
        assert_eq!(state.store().access_token().as_deref(), Some("A1"));
        assert_eq!(events.try_recv().unwrap(), SessionEvent::Authenticated(teacher()));
    }

    #[test]
    fn test_renewing_hides_identity_until_settled() {
        let state = state();
        state.sign_in(&TokenPair::new("A1", "R1"), teacher()).unwrap();
        let epoch = state.epoch();

        let previous = state.begin_renewal();
        assert_eq!(previous, SessionStatus::Authenticated);
        assert_eq!(state.snapshot().identity, None);

        state
            .complete_renewal(epoch, &TokenPair::new("A2", "R2"), None, previous)
            .unwrap();
        assert_eq!(state.snapshot(), SessionSnapshot::authenticated(teacher()));
        assert_eq!(state.store().refresh_token().as_deref(), Some("R2"));
    }

    #[test]
    fn test_renewal_after_logout_is_discarded() {
        let state = state();
        state.sign_in(&TokenPair::new("A1", "R1"), teacher()).unwrap();
        let epoch = state.epoch();
        let previous = state.begin_renewal();

        assert!(state.terminate(None, TerminationReason::LoggedOut));
        let result = state.complete_renewal(epoch, &TokenPair::new("A2", "R2"), None, previous);

        assert!(matches!(result, Err(RenewalError::Aborted(_))));
        assert!(state.store().read().is_none());
    }

    #[test]
    fn test_terminate_emits_once() {
        let state = state();
        state.sign_in(&TokenPair::new("A1", "R1"), teacher()).unwrap();
        let mut events = state.events();

        assert!(state.terminate(None, TerminationReason::RenewalFailed));
        assert!(!state.terminate(None, TerminationReason::LoggedOut));

        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::Terminated(TerminationReason::RenewalFailed)
        );
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_abandoned_sign_in_after_teardown_stays_signed_out() {
        let state = state();
        state.sign_in(&TokenPair::new("A1", "R1"), teacher()).unwrap();
        let epoch = state.epoch();
        let previous = state.set_status(SessionStatus::Authenticating);

        assert!(state.terminate(None, TerminationReason::RenewalFailed));
        assert!(!state.abandon_sign_in(epoch, previous));

        assert_eq!(state.snapshot(), SessionSnapshot::unauthenticated());
        assert!(state.store().read().is_none());
    }

    #[test]
    fn test_abandoned_sign_in_restores_previous_snapshot() {
        let state = state();
        state.sign_in(&TokenPair::new("A1", "R1"), teacher()).unwrap();
        let epoch = state.epoch();
        let previous = state.set_status(SessionStatus::Authenticating);

        assert!(state.abandon_sign_in(epoch, previous));
        assert_eq!(state.snapshot(), SessionSnapshot::authenticated(teacher()));
    }

    #[test]
    fn test_stale_epoch_does_not_terminate_new_session() {
        let state = state();
        state.sign_in(&TokenPair::new("A1", "R1"), teacher()).unwrap();
        let old_epoch = state.epoch();
        state.sign_in(&TokenPair::new("B1", "S1"), teacher()).unwrap();

        assert!(!state.terminate(Some(old_epoch), TerminationReason::RenewalFailed));
        assert_eq!(state.store().access_token().as_deref(), Some("B1"));
    }
}
