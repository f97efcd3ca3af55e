use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use anyhow::bail;
use async_trait::async_trait;
use crate::binder::{InboundMessage, TransportChannel};
use crate::protocol::message::Message;


/// A transport channel that records sent messages and serves inbound messages from a queue
pub struct RecordingChannel {
    sent: Mutex<Vec<Message>>,
    inbound: Mutex<VecDeque<InboundMessage>>,
    open: AtomicBool,
    fail_sends: AtomicBool,
    fail_receives: AtomicBool,
    abort_count: AtomicUsize,
    close_count: AtomicUsize,
}

impl Default for RecordingChannel {
    fn default() -> Self {
        RecordingChannel {
            sent: Default::default(),
            inbound: Default::default(),
            open: AtomicBool::new(true),
            fail_sends: AtomicBool::new(false),
            fail_receives: AtomicBool::new(false),
            abort_count: AtomicUsize::new(0),
            close_count: AtomicUsize::new(0),
        }
    }
}

impl RecordingChannel {
    pub fn new() -> RecordingChannel {
        Default::default()
    }

    pub fn with_inbound(message: Message) -> RecordingChannel {
        let result = Self::new();
        result.push_inbound(InboundMessage { message, context: None });
        result
    }

    pub fn sent(&self) -> Vec<Message> {
        self.sent.lock().unwrap().clone()
    }

    pub fn push_inbound(&self, message: InboundMessage) {
        self.inbound.lock().unwrap().push_back(message);
    }

    pub fn fail_sends(&self) {
        self.fail_sends.store(true, Ordering::SeqCst);
    }

    pub fn fail_receives(&self) {
        self.fail_receives.store(true, Ordering::SeqCst);
    }

    pub fn abort_count(&self) -> usize {
        self.abort_count.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportChannel for RecordingChannel {
    async fn send(&self, message: Message, _timeout: Duration) -> anyhow::Result<()> {
        if !self.is_open() {
            bail!("channel is closed");
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            bail!("simulated send failure");
        }
        self.sent.lock().unwrap().push(message);
        Ok(())
    }

    async fn receive(&self, timeout: Duration) -> anyhow::Result<Option<InboundMessage>> {
        if self.fail_receives.load(Ordering::SeqCst) {
            bail!("simulated receive failure");
        }
        let next = self.inbound.lock().unwrap().pop_front();
        if next.is_none() {
            tokio::time::sleep(timeout).await;
        }
        Ok(next)
    }

    async fn close(&self, _timeout: Duration) -> anyhow::Result<()> {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn abort(&self) {
        self.abort_count.fetch_add(1, Ordering::SeqCst);
        self.open.store(false, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}
