use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use async_trait::async_trait;
use tokio::sync::RwLock;
use crate::binder::QuotaExceededError;
use crate::protocol::fault::WsrmFault;
use crate::protocol::message::Message;
use crate::reliability::output_connection::{ConnectionFaultHandler, SendHandler};
use crate::reliability::transmission_strategy::MessageAttemptInfo;


#[derive(Clone, Debug)]
pub struct SentAttempt {
    pub number: u64,
    pub attempt: u32,
    pub is_retry: bool,
    pub last_message: bool,
    pub message: Message,
}

#[derive(Default)]
pub struct RecordingSendHandler {
    tracker: RwLock<Vec<SentAttempt>>,
    ack_requested: AtomicUsize,
    quota_exceeded: AtomicBool,
}

impl RecordingSendHandler {
    pub fn new() -> RecordingSendHandler {
        Default::default()
    }

    /// all attempts recorded so far, in the order they were sent
    pub async fn sent(&self) -> Vec<SentAttempt> {
        self.tracker.read().await.clone()
    }

    pub fn ack_requested_count(&self) -> usize {
        self.ack_requested.load(Ordering::SeqCst)
    }

    /// all subsequent sends fail with a [QuotaExceededError]
    pub fn fail_with_quota_exceeded(&self) {
        self.quota_exceeded.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl SendHandler for RecordingSendHandler {
    async fn send(&self, attempt: MessageAttemptInfo, _timeout: Duration, is_retry: bool) -> anyhow::Result<()> {
        if self.quota_exceeded.load(Ordering::SeqCst) {
            return Err(QuotaExceededError { quota: 0 }.into());
        }

        let last_message = attempt.message.sequence.as_ref()
            .map(|s| s.last_message)
            .unwrap_or(false);
        self.tracker.write().await.push(SentAttempt {
            number: attempt.number,
            attempt: attempt.attempt,
            is_retry,
            last_message,
            message: attempt.message,
        });
        Ok(())
    }

    async fn send_ack_requested(&self, _timeout: Duration) -> anyhow::Result<()> {
        self.ack_requested.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}


#[derive(Default)]
pub struct RecordingFaultHandler {
    faults: Mutex<Vec<WsrmFault>>,
}

impl RecordingFaultHandler {
    pub fn new() -> RecordingFaultHandler {
        Default::default()
    }

    pub fn faults(&self) -> Vec<WsrmFault> {
        self.faults.lock().unwrap().clone()
    }
}

impl ConnectionFaultHandler for RecordingFaultHandler {
    fn on_connection_fault(&self, fault: WsrmFault) {
        self.faults.lock().unwrap().push(fault);
    }
}
