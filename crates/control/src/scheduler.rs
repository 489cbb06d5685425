//! Auto-stop scheduler: at most one pending deferred stop per irrigation
//! system.
//!
//! Each pending stop is a spawned task sleeping until its deadline, indexed
//! by system id together with the session token it was scheduled for.
//! Cancelling aborts the task, but an abort can lose the race against a task
//! that has already woken, so the fire handler must re-validate the token
//! against the system's current running log before acting.
//!
//! ```text
//! schedule(S, t1) ──▶ pending[S] = t1 ──[deadline]──▶ on_fire(S, t1)
//!        │                  │
//! schedule(S, t2)      cancel(S)
//!        │                  │
//!  abort t1, pending[S] = t2   abort, pending[S] removed
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::model::SessionToken;

struct PendingStop {
    token: SessionToken,
    handle: JoinHandle<()>,
}

type PendingMap = HashMap<String, PendingStop>;

#[derive(Default)]
pub struct AutoStopScheduler {
    pending: Arc<Mutex<PendingMap>>,
}

fn lock(pending: &Mutex<PendingMap>) -> MutexGuard<'_, PendingMap> {
    pending.lock().unwrap_or_else(|e| e.into_inner())
}

impl AutoStopScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arrange for `on_fire` to run once `after` has elapsed, replacing any
    /// stop already pending for `system_id`.
    pub fn schedule<F, Fut>(&self, system_id: &str, after: Duration, token: SessionToken, on_fire: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let pending = Arc::clone(&self.pending);
        let key = system_id.to_string();

        // Hold the table lock across spawn so the task can't look itself up
        // before its entry exists.
        let mut table = lock(&self.pending);

        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;

            {
                let mut table = lock(&pending);
                match table.get(&key) {
                    Some(entry) if entry.token == token => {
                        table.remove(&key);
                    }
                    // Replaced or cancelled after we woke up.
                    _ => return,
                }
            }

            debug!(system = %key, %token, "auto-stop due");
            // Detached so a late cancel can't abort a stop halfway through.
            tokio::spawn(on_fire());
        });

        if let Some(previous) = table.insert(system_id.to_string(), PendingStop { token, handle }) {
            previous.handle.abort();
            info!(
                system = %system_id,
                replaced = %previous.token,
                "pending auto-stop replaced"
            );
        }

        info!(
            system = %system_id,
            %token,
            after_sec = after.as_secs(),
            "auto-stop scheduled"
        );
    }

    /// Cancel the pending stop for `system_id`. Returns whether one existed.
    pub fn cancel(&self, system_id: &str) -> bool {
        match lock(&self.pending).remove(system_id) {
            Some(entry) => {
                entry.handle.abort();
                info!(system = %system_id, token = %entry.token, "auto-stop cancelled");
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub fn pending_token(&self, system_id: &str) -> Option<SessionToken> {
        lock(&self.pending).get(system_id).map(|e| e.token)
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }
}

impl Drop for AutoStopScheduler {
    fn drop(&mut self) {
        for (_, entry) in lock(&self.pending).drain() {
            entry.handle.abort();
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const MINUTE: Duration = Duration::from_secs(60);

    /// Returns an `on_fire` closure that records `tag` into `fired`.
    fn recorder(
        fired: &Arc<Mutex<Vec<&'static str>>>,
        tag: &'static str,
    ) -> impl FnOnce() -> std::future::Ready<()> + Send + 'static {
        let fired = Arc::clone(fired);
        move || {
            fired.lock().unwrap().push(tag);
            std::future::ready(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_delay() {
        let sched = AutoStopScheduler::new();
        let fired = Arc::new(Mutex::new(Vec::new()));
        sched.schedule("s1", 30 * MINUTE, SessionToken(1), recorder(&fired, "t1"));
        assert_eq!(sched.pending_token("s1"), Some(SessionToken(1)));

        tokio::time::sleep(29 * MINUTE).await;
        assert!(fired.lock().unwrap().is_empty());

        tokio::time::sleep(2 * MINUTE).await;
        assert_eq!(*fired.lock().unwrap(), vec!["t1"]);
        assert_eq!(sched.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reschedule_replaces_pending_stop() {
        let sched = AutoStopScheduler::new();
        let fired = Arc::new(Mutex::new(Vec::new()));
        sched.schedule("s1", 10 * MINUTE, SessionToken(1), recorder(&fired, "old"));
        sched.schedule("s1", 20 * MINUTE, SessionToken(2), recorder(&fired, "new"));
        assert_eq!(sched.pending_count(), 1);
        assert_eq!(sched.pending_token("s1"), Some(SessionToken(2)));

        tokio::time::sleep(30 * MINUTE).await;
        assert_eq!(*fired.lock().unwrap(), vec!["new"]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_firing() {
        let sched = AutoStopScheduler::new();
        let fired = Arc::new(Mutex::new(Vec::new()));
        sched.schedule("s1", 5 * MINUTE, SessionToken(1), recorder(&fired, "t1"));
        assert!(sched.cancel("s1"));

        tokio::time::sleep(10 * MINUTE).await;
        assert!(fired.lock().unwrap().is_empty());
        assert_eq!(sched.pending_token("s1"), None);
    }

    #[tokio::test]
    async fn cancel_without_pending_stop_is_noop() {
        let sched = AutoStopScheduler::new();
        assert!(!sched.cancel("nothing-here"));
    }

    #[tokio::test(start_paused = true)]
    async fn systems_are_independent() {
        let sched = AutoStopScheduler::new();
        let fired = Arc::new(Mutex::new(Vec::new()));
        sched.schedule("a", 5 * MINUTE, SessionToken(1), recorder(&fired, "a"));
        sched.schedule("b", 5 * MINUTE, SessionToken(2), recorder(&fired, "b"));
        sched.cancel("a");

        tokio::time::sleep(6 * MINUTE).await;
        assert_eq!(*fired.lock().unwrap(), vec!["b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_scheduler_aborts_pending_stops() {
        let count = Arc::new(AtomicUsize::new(0));
        {
            let sched = AutoStopScheduler::new();
            let count = Arc::clone(&count);
            sched.schedule("s1", MINUTE, SessionToken(1), move || async move {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        tokio::time::sleep(2 * MINUTE).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
