//! Routes newly accepted transport channels to the dispatcher responsible for them, based on the
//!  first message that arrives on the channel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use anyhow::bail;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tracing::{debug, trace, warn};
use crate::binder::{InboundMessage, TransportChannel};
use crate::protocol::message::{Message, ProtocolBody};
use crate::protocol::sequence_id::SequenceId;


#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MessageFilter {
    Action(String),
    /// matches messages referring to the sequence in any WS-RM header or body
    SequenceId(SequenceId),
    MatchAll,
}

impl MessageFilter {
    pub fn matches(&self, message: &Message) -> bool {
        match self {
            MessageFilter::Action(action) => &message.action == action,
            MessageFilter::SequenceId(id) => referenced_sequence_ids(message).contains(id),
            MessageFilter::MatchAll => true,
        }
    }
}

fn referenced_sequence_ids(message: &Message) -> Vec<SequenceId> {
    let mut result = Vec::new();
    if let Some(sequence) = &message.sequence {
        result.push(sequence.id);
    }
    if let Some(ack) = &message.acknowledgement {
        result.push(ack.id);
    }
    if let Some(ack_requested) = &message.ack_requested {
        result.push(ack_requested.id);
    }
    match &message.body {
        Some(ProtocolBody::CreateSequenceResponse(csr)) => result.push(csr.identifier),
        Some(ProtocolBody::TerminateSequence(ts)) => result.push(ts.identifier),
        Some(ProtocolBody::TerminateSequenceResponse(tsr)) => result.push(tsr.identifier),
        Some(ProtocolBody::CloseSequence(cs)) => result.push(cs.identifier),
        Some(ProtocolBody::CloseSequenceResponse(csr)) => result.push(csr.identifier),
        Some(ProtocolBody::Fault(fault)) => result.extend(fault.sequence_id()),
        Some(ProtocolBody::CreateSequence(_)) | None => {}
    }
    result
}

/// Takes over a channel whose first message matched the dispatcher's filter
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChannelDispatcher: Send + Sync + 'static {
    async fn dispatch(&self, channel: Arc<dyn TransportChannel>, first: InboundMessage) -> anyhow::Result<()>;
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct FilterHandle(u64);

struct FilterEntry {
    filter: MessageFilter,
    priority: i32,
    dispatcher: Arc<dyn ChannelDispatcher>,
}

enum Selection {
    Matched(Arc<dyn ChannelDispatcher>),
    NoMatch,
    Ambiguous(usize),
}

/// Filters are evaluated by priority, highest first. Several matching filters on the highest
///  matching priority make the channel's routing ambiguous, and the channel is aborted.
pub struct ChannelDemuxer {
    filters: RwLock<FxHashMap<FilterHandle, FilterEntry>>,
    next_handle: AtomicU64,
    peek_timeout: Duration,
}

impl ChannelDemuxer {
    /// `peek_timeout` bounds the wait for a new channel's first message
    pub fn new(peek_timeout: Duration) -> ChannelDemuxer {
        ChannelDemuxer {
            filters: Default::default(),
            next_handle: AtomicU64::new(1),
            peek_timeout,
        }
    }

    pub async fn add_filter(&self, filter: MessageFilter, priority: i32, dispatcher: Arc<dyn ChannelDispatcher>) -> FilterHandle {
        let handle = FilterHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        debug!("registering filter {:?} with priority {}", filter, priority);
        self.filters.write().await
            .insert(handle, FilterEntry { filter, priority, dispatcher });
        handle
    }

    pub async fn remove_filter(&self, handle: FilterHandle) -> bool {
        self.filters.write().await
            .remove(&handle)
            .is_some()
    }

    async fn select(&self, message: &Message) -> Selection {
        let filters = self.filters.read().await;

        let best = filters.values()
            .filter(|e| e.filter.matches(message))
            .fold(None, |acc: Option<(i32, Vec<&FilterEntry>)>, entry| match acc {
                Some((priority, mut entries)) if priority == entry.priority => {
                    entries.push(entry);
                    Some((priority, entries))
                }
                Some((priority, entries)) if priority > entry.priority => Some((priority, entries)),
                _ => Some((entry.priority, vec![entry])),
            });

        match best {
            None => Selection::NoMatch,
            Some((_, entries)) if entries.len() == 1 => Selection::Matched(entries[0].dispatcher.clone()),
            Some((_, entries)) => Selection::Ambiguous(entries.len()),
        }
    }

    /// Waits for the channel's first message and hands the channel to the matching dispatcher.
    ///  Channels that send nothing, or that no single filter matches, are aborted.
    pub async fn on_channel(&self, channel: Arc<dyn TransportChannel>) -> anyhow::Result<()> {
        let first = match channel.receive(self.peek_timeout).await {
            Ok(Some(first)) => first,
            Ok(None) => {
                debug!("no message on new channel within {:?} - aborting it", self.peek_timeout);
                channel.abort();
                return Ok(());
            }
            Err(e) => {
                channel.abort();
                return Err(e);
            }
        };

        match self.select(&first.message).await {
            Selection::Matched(dispatcher) => {
                trace!("dispatching channel with first message {}", first.message.action);
                dispatcher.dispatch(channel, first).await
            }
            Selection::NoMatch => {
                warn!("no dispatcher for message {} - aborting the channel", first.message.action);
                abort_exchange(&channel, first);
                Ok(())
            }
            Selection::Ambiguous(num_matches) => {
                abort_exchange(&channel, first);
                bail!("{} filters with the same priority match the message - aborting the channel", num_matches)
            }
        }
    }
}

fn abort_exchange(channel: &Arc<dyn TransportChannel>, first: InboundMessage) {
    if let Some(context) = first.context {
        context.abort();
    }
    channel.abort();
}
