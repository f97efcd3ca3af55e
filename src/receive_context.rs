use std::sync::{Arc, Mutex};
use std::time::Duration;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use thiserror::Error;
use tracing::{debug, trace};


#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ReceiveContextState {
    Received,
    Completing,
    Completed,
    Abandoning,
    Abandoned,
    Faulted,
}

impl ReceiveContextState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReceiveContextState::Completed | ReceiveContextState::Abandoned | ReceiveContextState::Faulted)
    }
}

#[derive(Debug, Error)]
pub enum ReceiveContextError {
    #[error("can not {operation} a received message in state {state:?}")]
    InvalidTransition { operation: &'static str, state: ReceiveContextState },
    #[error("{operation} failed: {source:#}")]
    Failed { operation: &'static str, source: anyhow::Error },
}

/// What actually happens when a received message is completed or abandoned, e.g. removing it
///  from a durable queue
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReceiveContextHandler: Send + Sync + 'static {
    async fn on_complete(&self, timeout: Duration) -> anyhow::Result<()>;
    async fn on_abandon(&self, timeout: Duration) -> anyhow::Result<()>;
}

/// Tracks the settlement of a single received message: it is completed or abandoned at most
///  once, and state transitions only ever move forward.
pub struct ReceiveContext {
    state: Mutex<ReceiveContextState>,
    handler: Arc<dyn ReceiveContextHandler>,
}

impl ReceiveContext {
    pub fn new(handler: Arc<dyn ReceiveContextHandler>) -> ReceiveContext {
        ReceiveContext {
            state: Mutex::new(ReceiveContextState::Received),
            handler,
        }
    }

    pub fn state(&self) -> ReceiveContextState {
        *self.state.lock().unwrap()
    }

    fn transition(&self, operation: &'static str, from: ReceiveContextState, to: ReceiveContextState) -> Result<(), ReceiveContextError> {
        let mut state = self.state.lock().unwrap();
        if *state != from {
            return Err(ReceiveContextError::InvalidTransition { operation, state: *state });
        }
        trace!("receive context: {:?} -> {:?}", from, to);
        *state = to;
        Ok(())
    }

    /// Moves forward from `from` unless the context was faulted concurrently
    fn finish(&self, from: ReceiveContextState, to: ReceiveContextState) {
        let mut state = self.state.lock().unwrap();
        if *state == from {
            *state = to;
        }
    }

    pub async fn complete(&self, timeout: Duration) -> Result<(), ReceiveContextError> {
        self.transition("complete", ReceiveContextState::Received, ReceiveContextState::Completing)?;

        match self.handler.on_complete(timeout).await {
            Ok(()) => {
                self.finish(ReceiveContextState::Completing, ReceiveContextState::Completed);
                Ok(())
            }
            Err(source) => {
                debug!("completing a received message failed: {:#}", source);
                self.fault();
                Err(ReceiveContextError::Failed { operation: "complete", source })
            }
        }
    }

    pub async fn abandon(&self, timeout: Duration) -> Result<(), ReceiveContextError> {
        self.transition("abandon", ReceiveContextState::Received, ReceiveContextState::Abandoning)?;

        match self.handler.on_abandon(timeout).await {
            Ok(()) => {
                self.finish(ReceiveContextState::Abandoning, ReceiveContextState::Abandoned);
                Ok(())
            }
            Err(source) => {
                debug!("abandoning a received message failed: {:#}", source);
                self.fault();
                Err(ReceiveContextError::Failed { operation: "abandon", source })
            }
        }
    }

    /// Returns `false` if the context had reached a terminal state already
    pub fn fault(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.is_terminal() {
            return false;
        }
        *state = ReceiveContextState::Faulted;
        true
    }
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;
    use rstest::rstest;
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(1);

    fn handler(complete_ok: bool, abandon_ok: bool) -> Arc<MockReceiveContextHandler> {
        let mut handler = MockReceiveContextHandler::new();
        handler.expect_on_complete()
            .returning(move |_| if complete_ok { Ok(()) } else { Err(anyhow!("queue unavailable")) });
        handler.expect_on_abandon()
            .returning(move |_| if abandon_ok { Ok(()) } else { Err(anyhow!("queue unavailable")) });
        Arc::new(handler)
    }

    #[rstest]
    #[case::complete_ok(true, true, ReceiveContextState::Completed)]
    #[case::complete_fails(true, false, ReceiveContextState::Faulted)]
    #[case::abandon_ok(false, true, ReceiveContextState::Abandoned)]
    #[case::abandon_fails(false, false, ReceiveContextState::Faulted)]
    #[tokio::test]
    async fn test_settle(#[case] complete: bool, #[case] succeeds: bool, #[case] expected: ReceiveContextState) {
        let context = ReceiveContext::new(handler(succeeds, succeeds));
        let result = if complete {
            context.complete(TIMEOUT).await
        }
        else {
            context.abandon(TIMEOUT).await
        };

        assert_eq!(result.is_ok(), succeeds);
        assert_eq!(context.state(), expected);
    }

    #[tokio::test]
    async fn test_at_most_once() {
        let mut handler = MockReceiveContextHandler::new();
        handler.expect_on_complete()
            .times(1)
            .returning(|_| Ok(()));
        handler.expect_on_abandon()
            .never();
        let context = ReceiveContext::new(Arc::new(handler));

        context.complete(TIMEOUT).await.unwrap();
        assert!(matches!(context.complete(TIMEOUT).await, Err(ReceiveContextError::InvalidTransition { state: ReceiveContextState::Completed, .. })));
        assert!(matches!(context.abandon(TIMEOUT).await, Err(ReceiveContextError::InvalidTransition { .. })));
        assert!(!context.fault());
        assert_eq!(context.state(), ReceiveContextState::Completed);
    }

    #[tokio::test]
    async fn test_fault_prevents_settlement() {
        let context = ReceiveContext::new(handler(true, true));
        assert!(context.fault());
        assert!(!context.fault());
        assert!(context.complete(TIMEOUT).await.is_err());
        assert_eq!(context.state(), ReceiveContextState::Faulted);
    }
}
