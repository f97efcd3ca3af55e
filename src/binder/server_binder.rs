use std::sync::{Arc, Mutex};
use std::time::Duration;
use anyhow::{anyhow, bail};
use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::{debug, trace};
use crate::binder::{BinderState, InboundMessage, ReliableChannelBinder, RequestContext, TransportChannel};
use crate::protocol::message::{AddressingHeaders, Message};
use crate::util::deadline::{deadline_after, remaining};


struct Channels {
    state: BinderState,
    active: Option<Arc<dyn TransportChannel>>,
    /// replaces `active` on the next operation
    pending: Option<Arc<dyn TransportChannel>>,
}

impl Channels {
    fn is_open(&self) -> bool {
        matches!(self.state, BinderState::Created | BinderState::Opened)
    }
}

/// The server side binder: it wraps the transport channel a session was accepted on, and it
///  can switch to a new channel when the client reconnects.
///
/// Outbound messages are addressed based on the request that created the session. Malformed
///  addressing headers on that request do not fail the exchange: messages are sent unaddressed
///  instead.
pub struct ServerReliableChannelBinder {
    tolerate_faults: bool,
    request_addressing: AddressingHeaders,
    channels: Mutex<Channels>,
    channel_changed: Notify,
}

impl ServerReliableChannelBinder {
    pub fn new(channel: Arc<dyn TransportChannel>, request_addressing: AddressingHeaders, tolerate_faults: bool) -> ServerReliableChannelBinder {
        ServerReliableChannelBinder {
            tolerate_faults,
            request_addressing,
            channels: Mutex::new(Channels {
                state: BinderState::Opened,
                active: Some(channel),
                pending: None,
            }),
            channel_changed: Notify::new(),
        }
    }

    /// If true, a failing channel does not fault the binder: the binder waits for a replacement
    ///  channel instead
    pub fn tolerate_faults(&self) -> bool {
        self.tolerate_faults
    }

    /// Hands the binder a new channel for the session, e.g. after a client reconnected.
    ///
    /// Returns `false` (and aborts the channel) if the binder does not accept it: because it is
    ///  no longer open, or because it already has a channel and does not tolerate faults. A
    ///  previously pending channel that was never used is aborted.
    pub fn use_new_channel(&self, channel: Arc<dyn TransportChannel>) -> bool {
        let (accepted, superseded) = {
            let mut channels = self.channels.lock().unwrap();
            let has_channel = channels.active.is_some() || channels.pending.is_some();

            if !channels.is_open() || (has_channel && !self.tolerate_faults) {
                (false, None)
            }
            else if channels.active.is_none() {
                channels.active = Some(channel.clone());
                (true, None)
            }
            else {
                (true, channels.pending.replace(channel.clone()))
            }
        };

        if !accepted {
            debug!("binder does not accept a new channel - aborting it");
            channel.abort();
            return false;
        }
        if let Some(superseded) = superseded {
            debug!("new channel supersedes a pending channel");
            superseded.abort();
        }

        self.channel_changed.notify_waiters();
        true
    }

    /// the channel to use right now, promoting a pending channel
    fn current_channel(&self) -> Option<Arc<dyn TransportChannel>> {
        let (current, superseded) = {
            let mut channels = self.channels.lock().unwrap();
            if !channels.is_open() {
                return None;
            }
            let superseded = match channels.pending.take() {
                Some(pending) => channels.active.replace(pending),
                None => None,
            };
            (channels.active.clone(), superseded)
        };

        if let Some(superseded) = superseded {
            trace!("switching to the new channel");
            superseded.abort();
        }
        current
    }

    async fn wait_for_channel(&self, timeout: Duration) -> anyhow::Result<Arc<dyn TransportChannel>> {
        let deadline = deadline_after(timeout);
        loop {
            let notified = self.channel_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(channel) = self.current_channel() {
                return Ok(channel);
            }
            let state = self.state();
            if !matches!(state, BinderState::Created | BinderState::Opened) {
                bail!("binder is {:?}", state);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                bail!("no transport channel within {:?}", timeout);
            }
        }
    }

    fn on_channel_failure(&self, channel: &Arc<dyn TransportChannel>) {
        let released = {
            let mut channels = self.channels.lock().unwrap();
            if self.tolerate_faults {
                if channels.active.as_ref().map(|a| same_channel(a, channel)).unwrap_or(false) {
                    channels.active = None;
                }
                vec![]
            }
            else {
                if channels.is_open() {
                    channels.state = BinderState::Faulted;
                }
                channels.active.take().into_iter()
                    .chain(channels.pending.take())
                    .filter(|other| !same_channel(other, channel))
                    .collect::<Vec<_>>()
            }
        };

        debug!("transport channel failed (tolerating faults: {})", self.tolerate_faults);
        channel.abort();
        for other in released {
            other.abort();
        }
        self.channel_changed.notify_waiters();
    }

    fn is_open(&self) -> bool {
        self.channels.lock().unwrap().is_open()
    }

    /// addresses a message the session sends on its own initiative
    pub fn add_output_headers(&self, mut message: Message) -> Message {
        if message.addressing.to.is_some() {
            return message;
        }
        match self.request_addressing.reply_to.as_deref().map(parse_uri).transpose() {
            Ok(to) => message.addressing.to = to.map(str::to_string),
            Err(e) => debug!("sending {} unaddressed: {}", message.action, e),
        }
        message
    }

    fn wrap_context(&self, inbound: InboundMessage) -> InboundMessage {
        InboundMessage {
            message: inbound.message,
            context: inbound.context.map(|inner| Arc::new(AddressingRequestContext { inner }) as Arc<dyn RequestContext>),
        }
    }
}

fn same_channel(a: &Arc<dyn TransportChannel>, b: &Arc<dyn TransportChannel>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

fn parse_uri(value: &str) -> anyhow::Result<&str> {
    if value.is_empty() || value.chars().any(char::is_whitespace) || !value.contains(':') {
        bail!("malformed URI {:?}", value);
    }
    Ok(value)
}

/// Addresses a reply based on the request it answers. If the request's addressing headers are
///  malformed, the reply is sent unaddressed.
pub fn address_response(request: &AddressingHeaders, mut reply: Message) -> Message {
    let relates_to = request.message_id.as_deref().map(parse_uri).transpose();
    let to = request.reply_to.as_deref().map(parse_uri).transpose();

    match (relates_to, to) {
        (Ok(relates_to), Ok(to)) => {
            reply.addressing.relates_to = relates_to.map(str::to_string);
            if let Some(to) = to {
                reply.addressing.to = Some(to.to_string());
            }
        }
        (Err(e), _) | (_, Err(e)) => {
            debug!("sending reply {} unaddressed: {}", reply.action, e);
            reply.addressing = AddressingHeaders {
                message_id: reply.addressing.message_id.take(),
                ..AddressingHeaders::default()
            };
        }
    }
    reply
}

struct AddressingRequestContext {
    inner: Arc<dyn RequestContext>,
}

#[async_trait]
impl RequestContext for AddressingRequestContext {
    fn request_message(&self) -> Message {
        self.inner.request_message()
    }

    async fn reply(&self, message: Message, timeout: Duration) -> anyhow::Result<()> {
        let request = self.inner.request_message();
        self.inner.reply(address_response(&request.addressing, message), timeout).await
    }

    fn abort(&self) {
        self.inner.abort()
    }
}

#[async_trait]
impl ReliableChannelBinder for ServerReliableChannelBinder {
    async fn send(&self, message: Message, timeout: Duration) -> anyhow::Result<()> {
        let deadline = deadline_after(timeout);
        let message = self.add_output_headers(message);
        let channel = self.wait_for_channel(timeout).await?;

        match tokio::time::timeout_at(deadline, channel.send(message, remaining(deadline))).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.on_channel_failure(&channel);
                Err(e)
            }
            Err(_) => bail!("send did not complete within {:?}", timeout),
        }
    }

    async fn request(&self, _message: Message, _timeout: Duration) -> anyhow::Result<Message> {
        bail!("a server binder does not send requests")
    }

    async fn try_receive(&self, timeout: Duration) -> anyhow::Result<Option<InboundMessage>> {
        let deadline = deadline_after(timeout);
        let channel = match self.wait_for_channel(timeout).await {
            Ok(channel) => channel,
            Err(_) if self.is_open() => return Ok(None),
            Err(e) => return Err(e),
        };

        match channel.receive(remaining(deadline)).await {
            Ok(inbound) => Ok(inbound.map(|i| self.wrap_context(i))),
            Err(e) => {
                self.on_channel_failure(&channel);
                if self.tolerate_faults {
                    debug!("receive failed, waiting for a new channel: {:#}", e);
                    Ok(None)
                }
                else {
                    Err(e)
                }
            }
        }
    }

    async fn close(&self, timeout: Duration) -> anyhow::Result<()> {
        let (active, pending) = {
            let mut channels = self.channels.lock().unwrap();
            match channels.state {
                BinderState::Closed => return Ok(()),
                BinderState::Faulted => {
                    channels.state = BinderState::Closed;
                    bail!("binder is faulted");
                }
                _ => {}
            }
            channels.state = BinderState::Closing;
            (channels.active.take(), channels.pending.take())
        };
        self.channel_changed.notify_waiters();

        if let Some(pending) = pending {
            pending.abort();
        }
        let result = match active {
            Some(channel) => match tokio::time::timeout(timeout, channel.close(timeout)).await {
                Ok(result) => result,
                Err(_) => {
                    channel.abort();
                    Err(anyhow!("closing the channel did not complete within {:?}", timeout))
                }
            },
            None => Ok(()),
        };

        self.channels.lock().unwrap().state = BinderState::Closed;
        result
    }

    fn abort(&self) {
        let (active, pending) = {
            let mut channels = self.channels.lock().unwrap();
            channels.state = BinderState::Closed;
            (channels.active.take(), channels.pending.take())
        };

        for channel in active.into_iter().chain(pending) {
            debug!("aborting transport channel");
            channel.abort();
        }
        self.channel_changed.notify_waiters();
    }

    fn state(&self) -> BinderState {
        self.channels.lock().unwrap().state
    }

    fn connected(&self) -> bool {
        let channels = self.channels.lock().unwrap();
        channels.state == BinderState::Opened
            && channels.pending.as_ref().or(channels.active.as_ref())
                .map(|c| c.is_open())
                .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use rstest::rstest;
    use crate::test_util::{RecordingChannel, RecordingRequestContext};
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn request_addressing() -> AddressingHeaders {
        AddressingHeaders {
            message_id: Some("urn:uuid:1b1c0a4e-ffa1-4c36-8a1f-0b47de2d7d01".to_string()),
            relates_to: None,
            reply_to: Some("http://client.example/reply".to_string()),
            to: None,
        }
    }

    fn binder(tolerate_faults: bool) -> (ServerReliableChannelBinder, Arc<RecordingChannel>) {
        let channel = Arc::new(RecordingChannel::new());
        (ServerReliableChannelBinder::new(channel.clone(), request_addressing(), tolerate_faults), channel)
    }

    fn message() -> Message {
        Message::new("urn:app/Notify", Bytes::from_static(b"x"))
    }

    #[tokio::test]
    async fn test_send_is_addressed() {
        let (binder, channel) = binder(false);
        binder.send(message(), TIMEOUT).await.unwrap();

        let sent = channel.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].addressing.to.as_deref(), Some("http://client.example/reply"));
        assert!(binder.connected());
    }

    #[tokio::test]
    async fn test_new_channel_rejected_without_fault_tolerance() {
        let (binder, old) = binder(false);
        let new = Arc::new(RecordingChannel::new());

        assert!(!binder.use_new_channel(new.clone()));
        assert_eq!(new.abort_count(), 1);
        assert_eq!(old.abort_count(), 0);
    }

    #[tokio::test]
    async fn test_new_channel_replaces_active() {
        let (binder, old) = binder(true);
        let new = Arc::new(RecordingChannel::new());

        assert!(binder.use_new_channel(new.clone()));
        assert_eq!(old.abort_count(), 0);

        binder.send(message(), TIMEOUT).await.unwrap();
        assert_eq!(old.abort_count(), 1);
        assert!(old.sent().is_empty());
        assert_eq!(new.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_new_channel_supersedes_pending() {
        let (binder, old) = binder(true);
        let first = Arc::new(RecordingChannel::new());
        let second = Arc::new(RecordingChannel::new());

        assert!(binder.use_new_channel(first.clone()));
        assert!(binder.use_new_channel(second.clone()));
        assert_eq!(first.abort_count(), 1);
        assert_eq!(old.abort_count(), 0);

        binder.send(message(), TIMEOUT).await.unwrap();
        assert_eq!(second.sent().len(), 1);
    }

    #[rstest]
    #[case::closed(true)]
    #[case::aborted(false)]
    #[tokio::test]
    async fn test_new_channel_after_shutdown(#[case] close: bool) {
        let (binder, _) = binder(true);
        if close {
            binder.close(TIMEOUT).await.unwrap();
        }
        else {
            binder.abort();
        }

        let new = Arc::new(RecordingChannel::new());
        assert!(!binder.use_new_channel(new.clone()));
        assert_eq!(new.abort_count(), 1);
        assert_eq!(binder.state(), BinderState::Closed);
    }

    #[tokio::test]
    async fn test_send_failure_faults_binder() {
        let (binder, channel) = binder(false);
        channel.fail_sends();

        assert!(binder.send(message(), TIMEOUT).await.is_err());
        assert_eq!(binder.state(), BinderState::Faulted);
        assert_eq!(channel.abort_count(), 1);
        assert!(!binder.connected());
        assert!(binder.close(TIMEOUT).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_failure_tolerated() {
        let (binder, channel) = binder(true);
        let binder = Arc::new(binder);
        channel.fail_sends();

        assert!(binder.send(message(), TIMEOUT).await.is_err());
        assert_eq!(binder.state(), BinderState::Opened);
        assert!(!binder.connected());

        let cloned = binder.clone();
        let send = tokio::spawn(async move { cloned.send(message(), TIMEOUT).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!send.is_finished());

        let new = Arc::new(RecordingChannel::new());
        assert!(binder.use_new_channel(new.clone()));
        send.await.unwrap().unwrap();
        assert_eq!(new.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_without_channel_times_out() {
        let (binder, channel) = binder(true);
        channel.fail_sends();
        let _ = binder.send(message(), TIMEOUT).await;

        assert!(binder.send(message(), Duration::from_millis(100)).await.is_err());
        assert_eq!(binder.try_receive(Duration::from_millis(100)).await.unwrap().map(|i| i.message), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_timeouts() {
        let (binder, channel) = binder(false);
        channel.push_inbound(InboundMessage { message: message(), context: None });

        binder.send(message(), Duration::MAX).await.unwrap();
        assert!(binder.try_receive(Duration::MAX).await.unwrap().is_some());
        assert_eq!(channel.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_receive_addresses_replies() {
        let (binder, channel) = binder(false);
        let mut request = Message::new("urn:app/Echo", Bytes::new()).with_message_id("urn:uuid:6f1f1b32-6d1e-4a55-bb52-f4f0a4a3a001");
        request.addressing.reply_to = Some("http://client.example/echo".to_string());
        let context = Arc::new(RecordingRequestContext::new(request.clone()));
        channel.push_inbound(InboundMessage { message: request, context: Some(context.clone()) });

        let inbound = binder.try_receive(TIMEOUT).await.unwrap().unwrap();
        inbound.context.unwrap().reply(message(), TIMEOUT).await.unwrap();

        let replies = context.replies();
        assert_eq!(replies[0].addressing.relates_to.as_deref(), Some("urn:uuid:6f1f1b32-6d1e-4a55-bb52-f4f0a4a3a001"));
        assert_eq!(replies[0].addressing.to.as_deref(), Some("http://client.example/echo"));
    }

    #[tokio::test]
    async fn test_receive_failure() {
        let (binder, channel) = binder(false);
        channel.fail_receives();
        assert!(binder.try_receive(TIMEOUT).await.is_err());
        assert_eq!(binder.state(), BinderState::Faulted);
        assert_eq!(channel.abort_count(), 1);

        binder.abort();
        assert_eq!(channel.abort_count(), 1);
    }

    #[rstest]
    #[case::well_formed(Some("urn:uuid:1"), Some("http://a/b"), Some("urn:uuid:1"), Some("http://a/b"))]
    #[case::no_reply_to(Some("urn:uuid:1"), None, Some("urn:uuid:1"), None)]
    #[case::malformed_message_id(Some("not a uri"), Some("http://a/b"), None, None)]
    #[case::malformed_reply_to(Some("urn:uuid:1"), Some(""), None, None)]
    fn test_address_response(#[case] message_id: Option<&str>, #[case] reply_to: Option<&str>, #[case] relates_to: Option<&str>, #[case] to: Option<&str>) {
        let request = AddressingHeaders {
            message_id: message_id.map(str::to_string),
            relates_to: None,
            reply_to: reply_to.map(str::to_string),
            to: None,
        };
        let reply = address_response(&request, message().with_message_id("urn:uuid:2"));

        assert_eq!(reply.addressing.relates_to.as_deref(), relates_to);
        assert_eq!(reply.addressing.to.as_deref(), to);
        assert_eq!(reply.addressing.message_id.as_deref(), Some("urn:uuid:2"));
    }

    #[tokio::test]
    async fn test_close_and_abort() {
        let (binder, channel) = binder(false);
        binder.close(TIMEOUT).await.unwrap();
        assert_eq!(channel.close_count(), 1);
        assert_eq!(binder.state(), BinderState::Closed);
        assert!(binder.send(message(), TIMEOUT).await.is_err());

        binder.abort();
        binder.abort();
        assert_eq!(channel.abort_count(), 0);
    }
}
