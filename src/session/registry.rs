//! # Session Registry
//!
//! The single source of truth for "who is connected". A lock-protected map
//! from session id to session, mutated only through its synchronized
//! operations: the acceptor inserts, the connection task's terminal handler
//! removes.
//!
//! ## Thread Safety:
//! `RwLock<HashMap>` allows concurrent readers (snapshots for broadcast or
//! metrics) or one writer at a time. Every operation holds the lock for a
//! bounded critical section; iteration always happens on a snapshot, never
//! under the lock.
//!
//! ## Invariant:
//! Every registered session is Connecting, Active or Closing. Closed sessions
//! are absent - removal is part of the close transition, not a separate step.

use crate::session::state::{CloseReason, Session, SessionId};

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{info, warn};

/// Returned when a registration would exceed the session limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityExceeded;

pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_sessions,
        }
    }

    /// Register a session, refusing when the registry is at its limit.
    ///
    /// The capacity check and the insert happen inside the same write-lock
    /// critical section, so concurrent registrations can never push the
    /// registry past `max_sessions`.
    ///
    /// ## Panics:
    /// On a duplicate id. Session ids are generated tokens owned by the
    /// acceptor, so a collision means the identity generation is broken - a
    /// programming error that must be surfaced loudly, not swallowed.
    pub fn try_insert(&self, session: Arc<Session>) -> Result<(), CapacityExceeded> {
        let id = session.id();
        let mut sessions = self.sessions.write().unwrap();

        if sessions.len() >= self.max_sessions {
            return Err(CapacityExceeded);
        }
        if sessions.insert(id, session).is_some() {
            panic!("registry invariant violated: duplicate session id {}", id);
        }

        Ok(())
    }

    /// Remove a session. Returns it if it was present; a second removal of the
    /// same id is a no-op.
    pub fn remove(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.write().unwrap().remove(&id)
    }

    /// Look up a session by id. Absence is an ordinary result, not an error.
    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.read().unwrap().get(&id).cloned()
    }

    /// Point-in-time copy of all live sessions. The lock is released before
    /// the caller iterates, so a broadcast over the snapshot never blocks
    /// inserts or removals.
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.read().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().unwrap().is_empty()
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    /// Whether the acceptor should refuse new connections. Advisory only: the
    /// answer can be stale by the time a caller acts on it, so admission is
    /// ultimately decided by [`SessionRegistry::try_insert`].
    pub fn at_capacity(&self) -> bool {
        self.len() >= self.max_sessions
    }

    /// Broadcast a close to every registered session. Each session observes
    /// it through its own mailbox and begins its Closing transition; this call
    /// does not wait for any of them.
    pub fn close_all(&self, reason: CloseReason) {
        let sessions = self.snapshot();
        info!(sessions = sessions.len(), reason = %reason, "closing all sessions");
        for session in sessions {
            session.close(reason.clone());
        }
    }

    /// Wait for the registry to empty out, up to `timeout`.
    ///
    /// ## Returns:
    /// - **true**: every session finished draining and was removed
    /// - **false**: the timeout expired with sessions still registered
    pub async fn await_drained(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;

        while !self.is_empty() {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        true
    }

    /// Force-close and remove every session still registered. Used after the
    /// drain timeout so one stalled transport cannot delay shutdown.
    pub fn force_close_remaining(&self) -> usize {
        let remaining = self.snapshot();
        let count = remaining.len();

        for session in remaining {
            warn!(session_id = %session.id(), "force-closing session after drain timeout");
            session.force_close();
            self.remove(session.id());
        }

        count
    }

    /// Summaries of all live sessions for the observability endpoints.
    pub fn summaries(&self) -> Vec<crate::session::state::SessionSummary> {
        self.snapshot().iter().map(|s| s.summary()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::state::{SessionSettings, SessionState};
    use std::thread;

    fn make_session() -> Arc<Session> {
        let session = Arc::new(Session::new(&SessionSettings::default()));
        session.activate().unwrap();
        session
    }

    #[test]
    fn test_insert_get_remove() {
        let registry = SessionRegistry::new(10);
        let session = make_session();
        let id = session.id();

        registry.try_insert(session).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.get(id).is_some());

        assert!(registry.remove(id).is_some());
        assert!(registry.get(id).is_none());
        // Removing again is a no-op, not an error.
        assert!(registry.remove(id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    #[should_panic(expected = "duplicate session id")]
    fn test_duplicate_insert_panics() {
        let registry = SessionRegistry::new(10);
        let session = make_session();
        registry.try_insert(session.clone()).unwrap();
        let _ = registry.try_insert(session);
    }

    #[test]
    fn test_try_insert_refuses_at_capacity() {
        let registry = SessionRegistry::new(1);
        registry.try_insert(make_session()).unwrap();

        // The registry itself enforces the limit; it never grows past it.
        assert_eq!(registry.try_insert(make_session()), Err(CapacityExceeded));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_concurrent_inserts_never_exceed_limit() {
        let registry = Arc::new(SessionRegistry::new(5));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            handles.push(thread::spawn(move || {
                registry.try_insert(make_session()).is_ok()
            }));
        }

        let accepted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|accepted| *accepted)
            .count();

        // Exactly the limit is admitted regardless of interleaving.
        assert_eq!(accepted, 5);
        assert_eq!(registry.len(), 5);
    }

    #[test]
    fn test_snapshot_reflects_completed_operations() {
        let registry = Arc::new(SessionRegistry::new(100));
        let mut ids = Vec::new();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            handles.push(thread::spawn(move || {
                let mut local = Vec::new();
                for _ in 0..10 {
                    let session = make_session();
                    local.push(session.id());
                    registry.try_insert(session).unwrap();
                }
                local
            }));
        }
        for handle in handles {
            ids.extend(handle.join().unwrap());
        }

        // 80 inserts completed, 0 removes.
        assert_eq!(registry.snapshot().len(), 80);

        // Remove half concurrently.
        let (removed, _kept) = ids.split_at(40);
        let mut handles = Vec::new();
        for chunk in removed.chunks(10) {
            let registry = registry.clone();
            let chunk = chunk.to_vec();
            handles.push(thread::spawn(move || {
                for id in chunk {
                    registry.remove(id);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.snapshot().len(), 40);
    }

    #[test]
    fn test_at_capacity() {
        let registry = SessionRegistry::new(2);
        assert!(!registry.at_capacity());
        registry.try_insert(make_session()).unwrap();
        registry.try_insert(make_session()).unwrap();
        assert!(registry.at_capacity());
    }

    #[test]
    fn test_close_all_transitions_every_session() {
        let registry = SessionRegistry::new(10);
        let a = make_session();
        let b = make_session();
        registry.try_insert(a.clone()).unwrap();
        registry.try_insert(b.clone()).unwrap();

        registry.close_all(CloseReason::ServerShutdown);

        assert_eq!(a.state(), SessionState::Closing);
        assert_eq!(b.state(), SessionState::Closing);
        // close_all does not remove; the terminal handler does.
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_force_closes_slow_session_after_timeout() {
        let registry = Arc::new(SessionRegistry::new(10));
        let fast = make_session();
        let slow = make_session();
        registry.try_insert(fast.clone()).unwrap();
        registry.try_insert(slow.clone()).unwrap();

        registry.close_all(CloseReason::ServerShutdown);

        // The fast session drains promptly; the slow one never finishes.
        {
            let registry = registry.clone();
            let fast = fast.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                fast.mark_closed();
                registry.remove(fast.id());
            });
        }

        let drained = registry.await_drained(Duration::from_millis(150)).await;
        assert!(!drained, "slow session should have outlived the timeout");

        let forced = registry.force_close_remaining();
        assert_eq!(forced, 1);

        assert!(registry.is_empty());
        assert_eq!(fast.state(), SessionState::Closed);
        assert_eq!(slow.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_await_drained_returns_immediately_when_empty() {
        let registry = SessionRegistry::new(10);
        assert!(registry.await_drained(Duration::from_millis(50)).await);
    }
}
