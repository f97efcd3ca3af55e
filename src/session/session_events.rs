use tokio::sync::broadcast;
use tracing::trace;
use crate::protocol::fault::SessionError;


#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FaultOrigin {
    /// this side detected the problem, and may tell the peer
    Local,
    /// the peer reported the problem
    Remote,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SessionEvent {
    /// The session left `NotFaulted`. This is sent exactly once per session, and `error` is what
    ///  pending and subsequent operations report.
    Faulted(SessionFaultedData),
    /// the session completed its close handshake
    Closed,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionFaultedData {
    pub origin: FaultOrigin,
    pub error: SessionError,
}


pub struct SessionEventNotifier {
    sender: broadcast::Sender<SessionEvent>,
}
impl SessionEventNotifier {
    pub fn new() -> SessionEventNotifier {
        let (sender, _) = broadcast::channel(16);

        SessionEventNotifier {
            sender
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    pub fn send_event(&self, event: SessionEvent) {
        trace!("event: {:?}", event);
        let _ = self.sender.send(event);
    }
}
