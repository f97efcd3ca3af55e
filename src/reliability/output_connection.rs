use std::sync::{Arc, Mutex};
use std::time::Duration;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use crate::binder::QuotaExceededError;
use crate::config::TransmissionSettings;
use crate::protocol::fault::{FaultCode, FaultReason, SessionError, WsrmFault};
use crate::protocol::message::Message;
use crate::protocol::sequence_id::SequenceId;
use crate::protocol::version::{ReliableMessagingVersion, WsrmActions};
use crate::reliability::sequence_range::{SequenceRange, SequenceRangeCollection};
use crate::reliability::transmission_strategy::{MessageAttemptInfo, TransmissionStrategy};
use crate::util::deadline::{deadline_after, remaining};
use crate::util::guard::Guard;
use crate::util::wait_object::WaitObject;


/// Puts sequenced messages on the wire on behalf of a [ReliableOutputConnection]
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendHandler: Send + Sync + 'static {
    async fn send(&self, attempt: MessageAttemptInfo, timeout: Duration, is_retry: bool) -> anyhow::Result<()>;

    async fn send_ack_requested(&self, timeout: Duration) -> anyhow::Result<()>;
}

/// The single receiver of faults detected by a [ReliableOutputConnection]. The connection only
///  reports a fault, it is up to the receiver to decide what to do about it.
pub trait ConnectionFaultHandler: Send + Sync {
    fn on_connection_fault(&self, fault: WsrmFault);
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OutputConnectionState {
    Open,
    /// the last message is known, waiting for it to be acknowledged
    Closing,
    Closed,
    Faulted,
    Terminated,
}

struct ConnectionShared {
    id: SequenceId,
    actions: Arc<WsrmActions>,
    strategy: TransmissionStrategy,
    send_handler: Arc<dyn SendHandler>,
    fault_handler: Arc<dyn ConnectionFaultHandler>,
    state: Mutex<OutputConnectionState>,
    send_guard: Guard,
    shutdown: WaitObject,
    retry_wakeup: Notify,
    retry_send_timeout: Duration,
}

impl ConnectionShared {
    fn state(&self) -> OutputConnectionState {
        *self.state.lock().unwrap()
    }

    /// returns false if the connection should stop sending
    async fn send_attempt(&self, attempt: MessageAttemptInfo, timeout: Duration, is_retry: bool) -> bool {
        let _entry = match self.send_guard.enter().await {
            Some(entry) => entry,
            None => return false,
        };

        let number = attempt.number;
        trace!("sending message #{} (attempt {}) on sequence {}", number, attempt.attempt, self.id);
        match self.send_handler.send(attempt, timeout, is_retry).await {
            Ok(()) => true,
            Err(e) => {
                if e.downcast_ref::<QuotaExceededError>().is_some() {
                    warn!("message #{} on sequence {} exceeds the transport quota: {}", number, self.id, e);
                    self.raise_fault(WsrmFault::terminated(Some(self.id), FaultCode::Receiver, FaultReason::QuotaExceeded));
                    return false;
                }
                debug!("error sending message #{} on sequence {} - leaving it for retry: {:#}", number, self.id, e);
                true
            }
        }
    }

    async fn send_ack_requested(&self, timeout: Duration) {
        if let Some(_entry) = self.send_guard.enter().await {
            if let Err(e) = self.send_handler.send_ack_requested(timeout).await {
                debug!("error sending AckRequested on sequence {}: {:#}", self.id, e);
            }
        }
    }

    fn raise_fault(&self, fault: WsrmFault) {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                OutputConnectionState::Faulted | OutputConnectionState::Terminated | OutputConnectionState::Closed => return,
                _ => *state = OutputConnectionState::Faulted,
            }
        }

        info!("output sequence {} faulted: {}", self.id, fault);
        self.shutdown.fault(SessionError::Fault(fault.clone()));
        self.retry_wakeup.notify_one();
        self.fault_handler.on_connection_fault(fault);
    }

    /// Signals shutdown once the final message is acknowledged
    fn terminate(&self) -> bool {
        if !self.strategy.done_transmitting() {
            return false;
        }

        {
            let mut state = self.state.lock().unwrap();
            match *state {
                OutputConnectionState::Open | OutputConnectionState::Closing => *state = OutputConnectionState::Closed,
                _ => return false,
            }
        }
        debug!("all messages on sequence {} are acknowledged", self.id);
        self.shutdown.set();
        self.retry_wakeup.notify_one();
        true
    }

    fn is_terminal(&self) -> bool {
        !matches!(self.state(), OutputConnectionState::Open | OutputConnectionState::Closing)
    }

    async fn retry_loop(self: Arc<Self>) {
        loop {
            if self.is_terminal() {
                trace!("retry loop for sequence {} ends", self.id);
                return;
            }

            match self.strategy.next_retry_deadline() {
                None => {
                    self.retry_wakeup.notified().await;
                    continue;
                }
                Some(deadline) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => {}
                        _ = self.retry_wakeup.notified() => continue,
                    }
                }
            }

            loop {
                match self.strategy.get_message_info_for_retry(Instant::now()) {
                    Ok(Some(attempt)) => {
                        if !self.send_attempt(attempt, self.retry_send_timeout, true).await {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(fault) => {
                        self.raise_fault(fault);
                        return;
                    }
                }
            }

            if self.actions.reliable_messaging_version == ReliableMessagingVersion::V1_1
                && self.state() == OutputConnectionState::Closing
            {
                self.send_ack_requested(self.retry_send_timeout).await;
            }
        }
    }
}


/// The sending side of a sequence: assigns numbers to application messages, sends them, resends
///  them until they are acknowledged and carries out the version specific close handshake.
///
/// Retries run in a background task that is started with the connection and stopped when it
///  closes, faults or is dropped. Sends from the application and from the retry task are
///  serialized by a [Guard], since transport channels generally do not support concurrent sends.
pub struct ReliableOutputConnection {
    shared: Arc<ConnectionShared>,
    retry_task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ReliableOutputConnection {
    fn drop(&mut self) {
        if let Ok(mut task) = self.retry_task.lock() {
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }
    }
}

impl ReliableOutputConnection {
    pub fn new(
        id: SequenceId,
        settings: TransmissionSettings,
        actions: Arc<WsrmActions>,
        send_handler: Arc<dyn SendHandler>,
        fault_handler: Arc<dyn ConnectionFaultHandler>,
    ) -> ReliableOutputConnection {
        let retry_send_timeout = settings.max_rto;
        let shared = Arc::new(ConnectionShared {
            id,
            actions,
            strategy: TransmissionStrategy::new(id, settings),
            send_handler,
            fault_handler,
            state: Mutex::new(OutputConnectionState::Open),
            send_guard: Guard::new(1),
            shutdown: WaitObject::new(),
            retry_wakeup: Notify::new(),
            retry_send_timeout,
        });

        let retry_task = tokio::spawn(shared.clone().retry_loop());

        ReliableOutputConnection {
            shared,
            retry_task: Mutex::new(Some(retry_task)),
        }
    }

    pub fn id(&self) -> SequenceId {
        self.shared.id
    }

    pub fn state(&self) -> OutputConnectionState {
        self.shared.state()
    }

    pub fn strategy(&self) -> &TransmissionStrategy {
        &self.shared.strategy
    }

    pub fn last(&self) -> u64 {
        self.shared.strategy.last()
    }

    /// Adds a message to the sequence and sends it. This waits while the transfer window is full.
    ///
    /// Returns `Ok(false)` if the connection was closed before the message was accepted. A failed
    ///  send is not reported here: the message stays in the window and is retried.
    pub async fn add_message(&self, message: Message, timeout: Duration) -> Result<bool, SessionError> {
        if self.state() != OutputConnectionState::Open {
            return Ok(false);
        }

        let attempt = match self.shared.strategy.add(message, timeout).await {
            Ok(Some(attempt)) => attempt,
            Ok(None) => return Ok(false),
            Err(SessionError::Fault(fault)) => {
                self.shared.raise_fault(fault.clone());
                return Err(SessionError::Fault(fault));
            }
            Err(e) => return Err(e),
        };

        self.shared.retry_wakeup.notify_one();
        self.shared.send_attempt(attempt, timeout, false).await;
        Ok(true)
    }

    /// Ends the sequence and waits until all messages are acknowledged. Only the first of
    ///  several concurrent callers sends the version specific 'last message' marker, all of them
    ///  wait for the same outcome.
    pub async fn close(&self, timeout: Duration) -> Result<(), SessionError> {
        let deadline = deadline_after(timeout);

        let initiate = {
            let mut state = self.shared.state.lock().unwrap();
            match *state {
                OutputConnectionState::Open => {
                    *state = OutputConnectionState::Closing;
                    true
                }
                OutputConnectionState::Closing => false,
                OutputConnectionState::Closed => return Ok(()),
                OutputConnectionState::Faulted | OutputConnectionState::Terminated => false,
            }
        };

        if initiate {
            debug!("closing output sequence {}", self.shared.id);
            match Message::last_message(&self.shared.actions) {
                Some(last_message) => {
                    match self.shared.strategy.add_last(last_message, remaining(deadline)).await {
                        Ok(Some(attempt)) => {
                            self.shared.retry_wakeup.notify_one();
                            self.shared.send_attempt(attempt, remaining(deadline), false).await;
                        }
                        Ok(None) => {
                            debug!("output sequence {} was closed concurrently", self.shared.id);
                        }
                        Err(SessionError::Timeout(_)) => {
                            self.shared.raise_fault(WsrmFault::terminated(Some(self.shared.id), FaultCode::Receiver, FaultReason::AddLastToWindowTimedOut));
                            return Err(SessionError::Timeout(timeout));
                        }
                        Err(SessionError::Fault(fault)) => {
                            self.shared.raise_fault(fault);
                        }
                        Err(e) => {
                            warn!("unexpected error adding the last message to sequence {}: {}", self.shared.id, e);
                            self.shared.raise_fault(WsrmFault::terminated(Some(self.shared.id), FaultCode::Receiver, FaultReason::UnknownAddToWindowError));
                        }
                    }
                }
                None => {
                    self.shared.strategy.set_last();
                    self.shared.retry_wakeup.notify_one();
                    self.shared.send_ack_requested(remaining(deadline)).await;
                }
            }
            self.shared.terminate();
        }

        self.shared.shutdown.wait(remaining(deadline)).await?;
        self.shared.strategy.close();
        self.shared.send_guard.close(remaining(deadline)).await
    }

    /// Fires the shutdown signal if everything up to the final message is acknowledged
    pub fn terminate(&self) -> bool {
        self.shared.terminate()
    }

    /// Acknowledgement of a single message number. The session itself only receives range
    ///  acknowledgements (see [ReliableOutputConnection::process_transferred_ranges]); this is
    ///  for request / reply layers on top of a session (reached through
    ///  `ReliableSession::output`) where a reply acknowledges exactly the request it answers.
    ///
    /// Acknowledging a number that was never sent is a fault. Since the acknowledgement covers a
    ///  single number, it is not checked for consistency.
    pub fn process_transferred_number(&self, number: u64, quota_remaining: Option<u64>) {
        if number == 0 || number > self.shared.strategy.last() {
            let ranges = SequenceRange::try_new(number, number)
                .map(|r| SequenceRangeCollection::from_ranges([r]))
                .unwrap_or_default();
            self.shared.raise_fault(WsrmFault::InvalidAcknowledgement { id: self.shared.id, ranges });
            return;
        }

        if self.shared.strategy.process_transferred_number(number, quota_remaining) {
            self.shared.retry_wakeup.notify_one();
        }
        self.shared.terminate();
    }

    /// Processes a full `SequenceAcknowledgement`. Acknowledging a number that was never sent is
    ///  always a fault. An acknowledgement that 'forgets' previously acknowledged numbers is a fault
    ///  for WS-RM 1.1; February 2005 peers in request / reply mode can legitimately send such
    ///  acknowledgements, so it is only logged there.
    pub fn process_transferred_ranges(&self, ranges: &SequenceRangeCollection, quota_remaining: Option<u64>) {
        let (invalid, inconsistent) = self.shared.strategy.process_acknowledgement(ranges);

        let fault_on_inconsistent = self.shared.actions.reliable_messaging_version == ReliableMessagingVersion::V1_1;
        if invalid || (inconsistent && fault_on_inconsistent) {
            debug!("invalid acknowledgement {} for sequence {} (invalid: {}, inconsistent: {})", ranges, self.shared.id, invalid, inconsistent);
            self.shared.raise_fault(WsrmFault::InvalidAcknowledgement { id: self.shared.id, ranges: ranges.clone() });
            return;
        }
        if inconsistent {
            debug!("ignoring inconsistent acknowledgement {} for sequence {}", ranges, self.shared.id);
        }

        if self.shared.strategy.process_transferred_ranges(ranges, quota_remaining) {
            self.shared.retry_wakeup.notify_one();
        }
        self.shared.terminate();
    }

    /// Stops all activity, releasing waiters with [SessionError::Aborted]. Idempotent.
    pub fn abort(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            if *state == OutputConnectionState::Terminated {
                return;
            }
            if *state != OutputConnectionState::Closed {
                *state = OutputConnectionState::Terminated;
            }
        }

        debug!("aborting output sequence {}", self.shared.id);
        self.shared.strategy.abort();
        self.shared.send_guard.abort();
        self.shared.shutdown.fault(SessionError::Aborted);
        if let Some(handle) = self.retry_task.lock().unwrap().take() {
            handle.abort();
        }
    }
}
