use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use anyhow::{anyhow, bail};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;
use crate::binder::{BinderState, InboundMessage, ReliableChannelBinder, RequestContext};
use crate::protocol::message::Message;


/// A binder that records everything sent through it. Replies to requests are served from a
///  queue that the test fills up front.
pub struct RecordingBinder {
    sent: RwLock<Vec<Message>>,
    requests: RwLock<Vec<Message>>,
    replies: Mutex<VecDeque<Result<Message, String>>>,
    inbound: Mutex<VecDeque<InboundMessage>>,
    state: Mutex<BinderState>,
    connected: AtomicBool,
    fail_sends: AtomicBool,
    send_delay: Mutex<Option<Duration>>,
    abort_count: AtomicUsize,
    close_count: AtomicUsize,
}

impl Default for RecordingBinder {
    fn default() -> Self {
        RecordingBinder {
            sent: Default::default(),
            requests: Default::default(),
            replies: Default::default(),
            inbound: Default::default(),
            state: Mutex::new(BinderState::Opened),
            connected: AtomicBool::new(true),
            fail_sends: AtomicBool::new(false),
            send_delay: Mutex::new(None),
            abort_count: AtomicUsize::new(0),
            close_count: AtomicUsize::new(0),
        }
    }
}

impl RecordingBinder {
    pub fn new() -> RecordingBinder {
        Default::default()
    }

    pub async fn sent_messages(&self) -> Vec<Message> {
        self.sent.read().await.clone()
    }

    /// the sent messages that are faults
    pub async fn sent_faults(&self) -> Vec<Message> {
        self.sent.read().await.iter()
            .filter(|m| m.is_fault())
            .cloned()
            .collect()
    }

    pub async fn requests(&self) -> Vec<Message> {
        self.requests.read().await.clone()
    }

    pub fn push_reply(&self, reply: Result<Message, String>) {
        self.replies.lock().unwrap().push_back(reply);
    }

    pub fn push_inbound(&self, message: InboundMessage) {
        self.inbound.lock().unwrap().push_back(message);
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn fail_sends(&self) {
        self.fail_sends.store(true, Ordering::SeqCst);
    }

    pub fn set_send_delay(&self, delay: Duration) {
        *self.send_delay.lock().unwrap() = Some(delay);
    }

    pub fn abort_count(&self) -> usize {
        self.abort_count.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReliableChannelBinder for RecordingBinder {
    async fn send(&self, message: Message, _timeout: Duration) -> anyhow::Result<()> {
        let delay = *self.send_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            bail!("simulated send failure");
        }
        self.sent.write().await.push(message);
        Ok(())
    }

    async fn request(&self, message: Message, _timeout: Duration) -> anyhow::Result<Message> {
        self.requests.write().await.push(message);
        let reply = self.replies.lock().unwrap().pop_front();
        match reply {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(e)) => Err(anyhow!(e)),
            None => bail!("no reply"),
        }
    }

    async fn try_receive(&self, timeout: Duration) -> anyhow::Result<Option<InboundMessage>> {
        let next = self.inbound.lock().unwrap().pop_front();
        if next.is_none() {
            tokio::time::sleep(timeout).await;
        }
        Ok(next)
    }

    async fn close(&self, _timeout: Duration) -> anyhow::Result<()> {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        *self.state.lock().unwrap() = BinderState::Closed;
        Ok(())
    }

    fn abort(&self) {
        self.abort_count.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        *self.state.lock().unwrap() = BinderState::Closed;
    }

    fn state(&self) -> BinderState {
        *self.state.lock().unwrap()
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.state() == BinderState::Opened
    }
}


pub struct RecordingRequestContext {
    request: Message,
    replies: Mutex<Vec<Message>>,
    abort_count: AtomicUsize,
}

impl RecordingRequestContext {
    pub fn new(request: Message) -> RecordingRequestContext {
        RecordingRequestContext {
            request,
            replies: Default::default(),
            abort_count: AtomicUsize::new(0),
        }
    }

    /// a context for a request without meaningful content
    pub fn anonymous() -> RecordingRequestContext {
        Self::new(Message::new("urn:test/Request", Bytes::new()).with_message_id("urn:uuid:00000000-0000-0000-0000-000000000001"))
    }

    pub fn replies(&self) -> Vec<Message> {
        self.replies.lock().unwrap().clone()
    }

    pub fn abort_count(&self) -> usize {
        self.abort_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RequestContext for RecordingRequestContext {
    fn request_message(&self) -> Message {
        self.request.clone()
    }

    async fn reply(&self, message: Message, _timeout: Duration) -> anyhow::Result<()> {
        self.replies.lock().unwrap().push(message);
        Ok(())
    }

    fn abort(&self) {
        self.abort_count.fetch_add(1, Ordering::SeqCst);
    }
}
