use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::trace;
use crate::protocol::fault::SessionError;
use crate::util::deadline::deadline_after;


struct GuardState {
    max_entries: usize,
    entries: usize,
    closed: bool,
    aborted: bool,
}

/// A gate that admits up to a fixed number of concurrent entrants until it is closed or
///  aborted. Closing waits for current entrants to leave, so it doubles as a 'drain' for
///  in-flight operations.
pub struct Guard {
    state: Mutex<GuardState>,
    changed: Notify,
}

/// Leaves the [Guard] when dropped
pub struct GuardEntry<'a> {
    guard: &'a Guard,
}

impl Drop for GuardEntry<'_> {
    fn drop(&mut self) {
        self.guard.exit();
    }
}

/// A [GuardEntry] that can be moved into a spawned task
pub struct OwnedGuardEntry {
    guard: Arc<Guard>,
}

impl Drop for OwnedGuardEntry {
    fn drop(&mut self) {
        self.guard.exit();
    }
}

impl Guard {
    pub fn new(max_entries: usize) -> Guard {
        assert!(max_entries > 0);
        Guard {
            state: Mutex::new(GuardState {
                max_entries,
                entries: 0,
                closed: false,
                aborted: false,
            }),
            changed: Notify::new(),
        }
    }

    /// no limit on concurrent entrants: used purely as a close / abort safe gate
    pub fn unbounded() -> Guard {
        Self::new(usize::MAX)
    }

    /// Waits for a free slot. Returns `None` once the guard is closed or aborted.
    pub async fn enter(&self) -> Option<GuardEntry<'_>> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().unwrap();
                if state.closed || state.aborted {
                    return None;
                }
                if state.entries < state.max_entries {
                    state.entries += 1;
                    return Some(GuardEntry { guard: self });
                }
            }

            notified.await;
        }
    }

    fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.closed || state.aborted || state.entries >= state.max_entries {
            return false;
        }
        state.entries += 1;
        true
    }

    /// Enters without waiting. Returns `None` if the guard is closed, aborted or full.
    pub fn try_enter(&self) -> Option<GuardEntry<'_>> {
        self.try_acquire()
            .then_some(GuardEntry { guard: self })
    }

    pub fn try_enter_owned(self: &Arc<Self>) -> Option<OwnedGuardEntry> {
        self.try_acquire()
            .then(|| OwnedGuardEntry { guard: self.clone() })
    }

    fn exit(&self) {
        let mut state = self.state.lock().unwrap();
        state.entries -= 1;
        let entries = state.entries;
        drop(state);

        trace!("left guard, {} entries remaining", entries);
        self.changed.notify_waiters();
    }

    /// Rejects new entrants and waits for current ones to leave
    pub async fn close(&self, timeout: Duration) -> Result<(), SessionError> {
        let deadline = deadline_after(timeout);

        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().unwrap();
                if state.aborted {
                    return Err(SessionError::Aborted);
                }
                state.closed = true;
                if state.entries == 0 {
                    return Ok(());
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(SessionError::Timeout(timeout));
            }
        }
    }

    /// Rejects new entrants and releases callers waiting in [Guard::close] with an error.
    ///  Current entrants are not affected.
    pub fn abort(&self) {
        self.state.lock().unwrap().aborted = true;
        self.changed.notify_waiters();
    }

    pub fn entries(&self) -> usize {
        self.state.lock().unwrap().entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_enter_exit() {
        let guard = Guard::unbounded();
        {
            let _a = guard.enter().await.unwrap();
            let _b = guard.enter().await.unwrap();
            assert_eq!(guard.entries(), 2);
        }
        assert_eq!(guard.entries(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_enter_waits() {
        let guard = Arc::new(Guard::new(1));
        let entry = guard.enter().await.unwrap();

        let cloned = guard.clone();
        let second = tokio::spawn(async move {
            let _entry = cloned.enter().await.is_some();
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!second.is_finished());

        drop(entry);
        second.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_drains() {
        let guard = Arc::new(Guard::unbounded());

        let cloned = guard.clone();
        let entrant = tokio::spawn(async move {
            let _entry = cloned.enter().await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let before = tokio::time::Instant::now();
        guard.close(Duration::from_secs(1)).await.unwrap();
        assert!(before.elapsed() >= Duration::from_millis(90));
        assert!(guard.enter().await.is_none());
        entrant.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_enter_owned() {
        let guard = Arc::new(Guard::new(1));
        let entry = guard.try_enter_owned().unwrap();
        assert!(guard.try_enter().is_none());

        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            drop(entry);
        });
        guard.close(Duration::from_secs(1)).await.unwrap();
        assert_eq!(guard.entries(), 0);
        assert!(guard.try_enter_owned().is_none());
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_timeout() {
        let guard = Guard::unbounded();
        let _entry = guard.enter().await.unwrap();
        assert_eq!(guard.close(Duration::from_millis(50)).await, Err(SessionError::Timeout(Duration::from_millis(50))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_releases_close() {
        let guard = Arc::new(Guard::unbounded());
        let entry = guard.enter().await.unwrap();

        let cloned = guard.clone();
        let closer = tokio::spawn(async move {
            cloned.close(Duration::from_secs(10)).await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        guard.abort();
        assert_eq!(closer.await.unwrap(), Err(SessionError::Aborted));
        drop(entry);
    }
}
