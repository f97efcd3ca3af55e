use std::time::Duration;
use tokio::sync::watch;
use crate::protocol::fault::SessionError;


/// A one-shot signal carrying an outcome. The first outcome wins; waiters that arrive after the
///  signal see it immediately.
pub struct WaitObject {
    outcome: watch::Sender<Option<Result<(), SessionError>>>,
}

impl WaitObject {
    pub fn new() -> WaitObject {
        let (outcome, _) = watch::channel(None);
        WaitObject { outcome }
    }

    /// signals success, returning false if an outcome was set before
    pub fn set(&self) -> bool {
        self.complete(Ok(()))
    }

    pub fn fault(&self, error: SessionError) -> bool {
        self.complete(Err(error))
    }

    fn complete(&self, outcome: Result<(), SessionError>) -> bool {
        self.outcome.send_if_modified(move |current| {
            if current.is_some() {
                return false;
            }
            *current = Some(outcome);
            true
        })
    }

    pub fn is_set(&self) -> bool {
        self.outcome.borrow().is_some()
    }

    pub async fn wait(&self, timeout: Duration) -> Result<(), SessionError> {
        let mut rx = self.outcome.subscribe();
        let result = match tokio::time::timeout(timeout, rx.wait_for(|o| o.is_some())).await {
            Err(_) => Err(SessionError::Timeout(timeout)),
            Ok(Err(_)) => Err(SessionError::Aborted),
            Ok(Ok(outcome)) => (*outcome).clone().unwrap_or(Ok(())),
        };
        result
    }
}

impl Default for WaitObject {
    fn default() -> Self {
        Self::new()
    }
}
