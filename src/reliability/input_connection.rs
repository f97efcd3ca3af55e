use std::collections::BTreeMap;
use std::sync::Mutex;
use tracing::{debug, trace};
use crate::protocol::fault::{FaultCode, FaultReason, WsrmFault};
use crate::protocol::message::{AcknowledgementInfo, Message, SequenceHeader};
use crate::protocol::sequence_id::SequenceId;
use crate::protocol::version::ReliableMessagingVersion;
use crate::reliability::sequence_range::{SequenceRange, SequenceRangeCollection};


/// What happened to a sequenced message handed to [ReliableInputConnection::add]
#[derive(Debug, Eq, PartialEq)]
pub enum InputOutcome {
    /// The message was new. These are the messages that became deliverable as a result, in
    ///  delivery order - possibly none (ordered delivery waiting for a gap to be filled), possibly
    ///  several.
    Accepted(Vec<Message>),
    /// the message was received before, it should only be acknowledged again
    Duplicate,
    /// there is no room to buffer the message, it is neither delivered nor acknowledged
    Dropped,
}

struct InputState {
    ranges: SequenceRangeCollection,
    last: Option<u64>,
    closed: bool,
    terminated: bool,
    next_delivery: u64,
    pending: BTreeMap<u64, Message>,
}

/// The receiving side of a sequence. It keeps track of the received message numbers (which are
///  what acknowledgements are built from), validates numbers against the sequence's end, and
///  restores sequence order for ordered delivery.
pub struct ReliableInputConnection {
    id: SequenceId,
    version: ReliableMessagingVersion,
    ordered: bool,
    flow_control_enabled: bool,
    max_pending: u64,
    state: Mutex<InputState>,
}

impl ReliableInputConnection {
    pub fn new(id: SequenceId, version: ReliableMessagingVersion, ordered: bool, flow_control_enabled: bool, max_pending: u32) -> ReliableInputConnection {
        ReliableInputConnection {
            id,
            version,
            ordered,
            flow_control_enabled,
            max_pending: max_pending as u64,
            state: Mutex::new(InputState {
                ranges: SequenceRangeCollection::empty(),
                last: None,
                closed: false,
                terminated: false,
                next_delivery: 1,
                pending: BTreeMap::default(),
            }),
        }
    }

    pub fn id(&self) -> SequenceId {
        self.id
    }

    pub fn ranges(&self) -> SequenceRangeCollection {
        self.state.lock().unwrap().ranges.clone()
    }

    pub fn last(&self) -> Option<u64> {
        self.state.lock().unwrap().last
    }

    /// true if a message with the given number may still arrive
    pub fn is_valid(&self, number: u64) -> bool {
        let state = self.state.lock().unwrap();
        match state.last {
            Some(last) => number <= last,
            None => true,
        }
    }

    pub fn add(&self, header: &SequenceHeader, message: Message) -> Result<InputOutcome, WsrmFault> {
        let number = header.number;
        let mut state = self.state.lock().unwrap();

        if let Some(last) = state.last {
            if number > last {
                return Err(match self.version {
                    ReliableMessagingVersion::February2005 => WsrmFault::LastMessageNumberExceeded { id: self.id },
                    ReliableMessagingVersion::V1_1 => WsrmFault::SequenceClosed { id: self.id },
                });
            }
        }

        if state.ranges.contains(number) {
            trace!("duplicate message #{} on sequence {}", number, self.id);
            return Ok(InputOutcome::Duplicate);
        }

        if self.ordered && number >= state.next_delivery + self.max_pending {
            debug!("no room to buffer message #{} on sequence {} - dropping it", number, self.id);
            return Ok(InputOutcome::Dropped);
        }

        if header.last_message {
            if let Some(upper) = state.ranges.upper_bound() {
                if upper > number {
                    return Err(WsrmFault::terminated(Some(self.id), FaultCode::Sender, FaultReason::SmallLastMessageNumber));
                }
            }
            state.last = Some(number);
        }

        state.ranges = state.ranges.merge_number(number);

        // the February 2005 LastMessage carries no application content
        let is_marker = header.last_message && self.version == ReliableMessagingVersion::February2005;

        if !self.ordered {
            return Ok(InputOutcome::Accepted(if is_marker { vec![] } else { vec![message] }));
        }

        if !is_marker {
            state.pending.insert(number, message);
        }
        let mut deliverable = Vec::new();
        loop {
            let next = state.next_delivery;
            if !state.ranges.contains(next) {
                break;
            }
            if let Some(m) = state.pending.remove(&next) {
                deliverable.push(m);
            }
            state.next_delivery += 1;
        }
        Ok(InputOutcome::Accepted(deliverable))
    }

    /// WS-RM 1.1 CloseSequence: no messages beyond `last` are accepted afterwards
    pub fn set_close_sequence_last(&self, last: u64) -> Result<(), WsrmFault> {
        if self.version != ReliableMessagingVersion::V1_1 {
            return Err(WsrmFault::terminated(Some(self.id), FaultCode::Sender, FaultReason::UnsupportedClose));
        }
        let mut state = self.state.lock().unwrap();
        self.set_last(&mut state, last)?;
        state.closed = true;
        Ok(())
    }

    /// TerminateSequence: the peer will not send any further messages. A 1.1 peer announces the
    ///  final number, which must be consistent with what was received.
    pub fn set_terminate_sequence_last(&self, last: Option<u64>) -> Result<(), WsrmFault> {
        let mut state = self.state.lock().unwrap();
        if let Some(last) = last {
            self.set_last(&mut state, last)?;
        }
        state.terminated = true;
        Ok(())
    }

    fn set_last(&self, state: &mut InputState, last: u64) -> Result<(), WsrmFault> {
        if let Some(upper) = state.ranges.upper_bound() {
            if upper > last {
                return Err(WsrmFault::terminated(Some(self.id), FaultCode::Sender, FaultReason::SmallLastMessageNumber));
            }
        }
        match state.last {
            Some(previous) if previous != last => {
                Err(WsrmFault::terminated(Some(self.id), FaultCode::Sender, FaultReason::InconsistentLastMessageNumber))
            }
            _ => {
                state.last = Some(last);
                Ok(())
            }
        }
    }

    /// true once the final message number is known and every message up to it was received
    pub fn all_added(&self) -> bool {
        let state = self.state.lock().unwrap();
        match state.last {
            None => false,
            Some(0) => state.ranges.is_empty(),
            Some(last) => state.ranges.contains_range(&SequenceRange::new(1, last)),
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.state.lock().unwrap().terminated
    }

    /// numbers within `[1, last]` that were not received yet - for diagnosing a sequence that
    ///  is terminated while incomplete
    pub fn missing(&self) -> SequenceRangeCollection {
        let state = self.state.lock().unwrap();
        match state.last.or(state.ranges.upper_bound()) {
            None | Some(0) => SequenceRangeCollection::empty(),
            Some(upper) => state.ranges.excluded(SequenceRange::new(1, upper)),
        }
    }

    pub fn acknowledgement_info(&self) -> AcknowledgementInfo {
        let state = self.state.lock().unwrap();
        let buffer_remaining = if self.flow_control_enabled {
            Some(self.max_pending.saturating_sub(state.pending.len() as u64))
        }
        else {
            None
        };

        AcknowledgementInfo {
            id: self.id,
            ranges: state.ranges.clone(),
            buffer_remaining,
            is_final: self.version == ReliableMessagingVersion::V1_1 && (state.closed || state.terminated),
        }
    }
}
