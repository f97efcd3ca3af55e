use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::trace;


struct TimerState {
    handle: Option<JoinHandle<()>>,
    aborted: bool,
}

/// A single-shot timer that can be re-armed and cancelled. Each arming spawns a task that calls
///  the callback after the timeout, replacing a previously armed task.
///
/// Once aborted, the timer can not be armed again.
pub struct InterruptibleTimer {
    timeout: Duration,
    callback: Arc<dyn Fn() + Send + Sync>,
    state: Mutex<TimerState>,
}

impl InterruptibleTimer {
    pub fn new(timeout: Duration, callback: impl Fn() + Send + Sync + 'static) -> InterruptibleTimer {
        InterruptibleTimer {
            timeout,
            callback: Arc::new(callback),
            state: Mutex::new(TimerState {
                handle: None,
                aborted: false,
            }),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// (re-)arms the timer
    pub fn set(&self) {
        let mut state = self.state.lock().unwrap();
        if state.aborted {
            return;
        }
        if let Some(handle) = state.handle.take() {
            handle.abort();
        }
        state.handle = Some(self.spawn());
    }

    /// arms the timer unless it is armed and not yet expired
    pub fn set_if_not_set(&self) {
        let mut state = self.state.lock().unwrap();
        if state.aborted {
            return;
        }
        if let Some(handle) = &state.handle {
            if !handle.is_finished() {
                return;
            }
        }
        state.handle = Some(self.spawn());
    }

    fn spawn(&self) -> JoinHandle<()> {
        let timeout = self.timeout;
        let callback = self.callback.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            trace!("timer expired after {:?}", timeout);
            callback();
        })
    }

    /// Disarms the timer, returning true if it was armed
    pub fn cancel(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.handle.take() {
            Some(handle) => {
                let was_armed = !handle.is_finished();
                handle.abort();
                was_armed
            }
            None => false,
        }
    }

    pub fn abort(&self) {
        self.cancel();
        self.state.lock().unwrap().aborted = true;
    }
}

impl Drop for InterruptibleTimer {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(handle) = state.handle.take() {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use super::*;

    fn counting_timer(millis: u64) -> (InterruptibleTimer, Arc<AtomicUsize>) {
        let counter = Arc::new(AtomicUsize::new(0));
        let cloned = counter.clone();
        let timer = InterruptibleTimer::new(Duration::from_millis(millis), move || {
            cloned.fetch_add(1, Ordering::SeqCst);
        });
        (timer, counter)
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_once() {
        let (timer, counter) = counting_timer(50);
        timer.set();

        tokio::time::sleep(Duration::from_millis(49)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_rearms() {
        let (timer, counter) = counting_timer(50);
        timer.set();
        tokio::time::sleep(Duration::from_millis(30)).await;
        timer.set();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_if_not_set_keeps_deadline() {
        let (timer, counter) = counting_timer(50);
        timer.set();
        tokio::time::sleep(Duration::from_millis(30)).await;
        timer.set_if_not_set();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_and_abort() {
        let (timer, counter) = counting_timer(50);
        assert!(!timer.cancel());
        timer.set();
        assert!(timer.cancel());

        timer.abort();
        timer.set();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
