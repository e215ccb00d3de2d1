//! Per-session mutual exclusion.
//!
//! A session's entry exists only while someone holds or waits for its lock,
//! so the map stays as small as the set of sessions in flight.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use relaydesk_core::ids::SessionId;

type LockMap = DashMap<SessionId, Arc<Mutex<()>>>;

/// One async mutex per session. Unrelated sessions never contend.
#[derive(Default)]
pub struct SessionLocks {
    locks: Arc<LockMap>,
}

/// Exclusive access to one session. Releasing it prunes the session's entry
/// when no other task is waiting.
pub struct SessionGuard {
    // Field order matters: the mutex guard must drop before the entry.
    _guard: OwnedMutexGuard<()>,
    _entry: EntryRef,
}

/// Removes the map entry on drop once nothing else references its mutex.
struct EntryRef {
    locks: Arc<LockMap>,
    session_id: SessionId,
}

impl Drop for EntryRef {
    fn drop(&mut self) {
        let _ = self
            .locks
            .remove_if(&self.session_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `session_id`. Dropping the future while
    /// it waits leaves no entry behind.
    pub async fn lock(&self, session_id: &SessionId) -> SessionGuard {
        let entry = EntryRef {
            locks: Arc::clone(&self.locks),
            session_id: session_id.clone(),
        };
        let lock = self
            .locks
            .entry(session_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        SessionGuard {
            _guard: lock.lock_owned().await,
            _entry: entry,
        }
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_session_is_exclusive() {
        let locks = Arc::new(SessionLocks::new());
        let sid = SessionId::from_raw("s1");
        let guard = locks.lock(&sid).await;

        let l2 = locks.clone();
        let s2 = sid.clone();
        let waiter = tokio::spawn(async move {
            let _g = l2.lock(&s2).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(guard);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn different_sessions_do_not_contend() {
        let locks = SessionLocks::new();
        let _a = locks.lock(&SessionId::from_raw("s1")).await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock(&SessionId::from_raw("s2"))).await;
        assert!(b.is_ok());
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn entry_removed_after_release() {
        let locks = SessionLocks::new();
        let sid = SessionId::from_raw("s1");
        let guard = locks.lock(&sid).await;
        assert_eq!(locks.len(), 1);
        drop(guard);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn entry_kept_while_someone_waits() {
        let locks = Arc::new(SessionLocks::new());
        let sid = SessionId::from_raw("s1");
        let guard = locks.lock(&sid).await;

        let l2 = locks.clone();
        let s2 = sid.clone();
        let (held_tx, held_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let waiter = tokio::spawn(async move {
            let _g = l2.lock(&s2).await;
            let _ = held_tx.send(());
            let _ = release_rx.await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);
        held_rx.await.unwrap();
        assert_eq!(locks.len(), 1);

        let _ = release_tx.send(());
        waiter.await.unwrap();
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn cancelled_waiter_leaves_no_entry() {
        let locks = SessionLocks::new();
        let sid = SessionId::from_raw("s1");
        let guard = locks.lock(&sid).await;
        let waited = tokio::time::timeout(Duration::from_millis(20), locks.lock(&sid)).await;
        assert!(waited.is_err());
        drop(guard);
        assert!(locks.is_empty());
    }
}
