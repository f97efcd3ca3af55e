//! The transport seam: a reliable session sends and receives through a
//!  [ReliableChannelBinder], which hides the concrete transport channel (and its replacement on
//!  reconnect) behind a uniform interface.

pub mod server_binder;

use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use thiserror::Error;
use crate::protocol::message::Message;


#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BinderState {
    Created,
    Opened,
    Closing,
    Closed,
    Faulted,
}

/// Returned (inside an `anyhow::Error`) by a send that exceeds the transport's message quota.
///  This is fatal to the sequence, other send failures are retried.
#[derive(Debug, Error)]
#[error("message exceeds the transport quota of {quota} bytes")]
pub struct QuotaExceededError {
    pub quota: usize,
}

/// The pending reply of a request / reply exchange
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RequestContext: Send + Sync + 'static {
    fn request_message(&self) -> Message;
    async fn reply(&self, message: Message, timeout: Duration) -> anyhow::Result<()>;
    fn abort(&self);
}

pub struct InboundMessage {
    pub message: Message,
    /// present if the message is a request that expects a reply
    pub context: Option<Arc<dyn RequestContext>>,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReliableChannelBinder: Send + Sync + 'static {
    async fn send(&self, message: Message, timeout: Duration) -> anyhow::Result<()>;

    /// Sends a request and waits for its reply. Binders that do not support request / reply
    ///  return an error.
    async fn request(&self, message: Message, timeout: Duration) -> anyhow::Result<Message>;

    /// Returns `None` if no message arrived within the timeout
    async fn try_receive(&self, timeout: Duration) -> anyhow::Result<Option<InboundMessage>>;

    async fn close(&self, timeout: Duration) -> anyhow::Result<()>;

    /// NB: must not block and must be safe to call repeatedly
    fn abort(&self);

    fn state(&self) -> BinderState;

    /// true if there is a transport channel that messages can be sent through right now
    fn connected(&self) -> bool;
}

/// A concrete transport channel as accepted by a listener. A binder may replace its channel
///  over the lifetime of a session.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TransportChannel: Send + Sync + 'static {
    async fn send(&self, message: Message, timeout: Duration) -> anyhow::Result<()>;

    /// Returns `None` if no message arrived within the timeout
    async fn receive(&self, timeout: Duration) -> anyhow::Result<Option<InboundMessage>>;

    async fn close(&self, timeout: Duration) -> anyhow::Result<()>;

    fn abort(&self);

    fn is_open(&self) -> bool;
}

/// identity of a binder instance, for registries keyed by binder
pub fn binder_key(binder: &Arc<dyn ReliableChannelBinder>) -> usize {
    Arc::as_ptr(binder) as *const () as usize
}
