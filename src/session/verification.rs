//! Checks that the WS-RM elements of an inbound message fit the session: every element must refer
//!  to one of the session's sequences, and it must be an element that the session's role can
//!  legitimately receive.

use crate::protocol::fault::{FaultCode, FaultReason, WsrmFault};
use crate::protocol::message_info::WsrmMessageInfo;
use crate::protocol::sequence_id::SequenceId;
use crate::protocol::version::ReliableMessagingVersion;


#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SessionSide {
    /// accepted a CreateSequence
    Server,
    /// sent a CreateSequence
    Client,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SessionShape {
    /// an input and an output sequence
    Duplex,
    /// a single sequence: input on the server side, output on the client side
    Simplex,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SessionRole {
    pub side: SessionSide,
    pub shape: SessionShape,
}

impl SessionRole {
    pub fn new(side: SessionSide, shape: SessionShape) -> SessionRole {
        SessionRole { side, shape }
    }

    pub fn has_input(&self) -> bool {
        self.shape == SessionShape::Duplex || self.side == SessionSide::Server
    }

    pub fn has_output(&self) -> bool {
        self.shape == SessionShape::Duplex || self.side == SessionSide::Client
    }
}

/// The sequence identifiers a session knows at the time a message is verified. Either may be
///  `None` before the handshake completes.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct SequenceIds {
    pub input: Option<SequenceId>,
    pub output: Option<SequenceId>,
}

impl SequenceIds {
    pub fn is_own(&self, id: SequenceId) -> bool {
        self.input == Some(id) || self.output == Some(id)
    }

    /// the id that session level faults refer to
    pub fn primary(&self) -> Option<SequenceId> {
        self.input.or(self.output)
    }
}

fn unknown(id: SequenceId) -> Option<WsrmFault> {
    Some(WsrmFault::UnknownSequence { id })
}

fn protocol_fault(id: Option<SequenceId>, reason: FaultReason) -> Option<WsrmFault> {
    Some(WsrmFault::terminated(id, FaultCode::Sender, reason))
}

/// Rules for a session that sends and receives. Elements are checked in a fixed order, and the
///  first violation is reported.
pub fn verify_duplex(version: ReliableMessagingVersion, side: SessionSide, ids: &SequenceIds, info: &WsrmMessageInfo) -> Option<WsrmFault> {
    if let Some(ack) = &info.acknowledgement_info {
        if Some(ack.id) != ids.output {
            return unknown(ack.id);
        }
    }

    if let Some(ack_requested) = &info.ack_requested_info {
        if Some(ack_requested.id) != ids.input {
            return unknown(ack_requested.id);
        }
    }

    if let Some(sequence) = &info.sequenced_message_info {
        if Some(sequence.id) != ids.input {
            return unknown(sequence.id);
        }
    }

    if let Some(terminate) = &info.terminate_sequence_info {
        let id = terminate.identifier;
        if Some(id) != ids.input {
            if version == ReliableMessagingVersion::February2005 {
                return protocol_fault(ids.output, FaultReason::UnexpectedTerminateSequence);
            }
            // a 1.1 peer may terminate the sequence it receives from us
            if Some(id) != ids.output {
                return unknown(id);
            }
        }
    }

    if let Some(response) = &info.terminate_sequence_response_info {
        if Some(response.identifier) != ids.output {
            return unknown(response.identifier);
        }
    }

    if let Some(close) = &info.close_sequence_info {
        let id = close.identifier;
        if Some(id) != ids.input {
            if Some(id) == ids.output {
                return protocol_fault(ids.input, FaultReason::UnsupportedClose);
            }
            return unknown(id);
        }
    }

    if let Some(response) = &info.close_sequence_response_info {
        let id = response.identifier;
        if Some(id) != ids.output {
            if Some(id) == ids.input {
                return protocol_fault(ids.input, FaultReason::UnexpectedCloseSequenceResponse);
            }
            return unknown(id);
        }
    }

    if info.create_sequence_response_info.is_some() && side == SessionSide::Server {
        return protocol_fault(ids.primary(), FaultReason::UnexpectedCreateSequenceResponse);
    }

    None
}

/// Rules for a session with a single sequence. The server side only receives, so it must never
///  see an acknowledgement for its own sequence; the client side only sends, so it must never
///  be asked for an acknowledgement or receive sequenced messages.
pub fn verify_simplex(version: ReliableMessagingVersion, side: SessionSide, ids: &SequenceIds, info: &WsrmMessageInfo) -> Option<WsrmFault> {
    match side {
        SessionSide::Server => verify_simplex_input(ids, info),
        SessionSide::Client => verify_simplex_output(version, ids, info),
    }
}

fn verify_simplex_input(ids: &SequenceIds, info: &WsrmMessageInfo) -> Option<WsrmFault> {
    if let Some(ack) = &info.acknowledgement_info {
        if Some(ack.id) == ids.input {
            return protocol_fault(ids.input, FaultReason::UnexpectedAcknowledgement);
        }
        return unknown(ack.id);
    }

    if let Some(ack_requested) = &info.ack_requested_info {
        if Some(ack_requested.id) != ids.input {
            return unknown(ack_requested.id);
        }
    }

    if let Some(sequence) = &info.sequenced_message_info {
        if Some(sequence.id) != ids.input {
            return unknown(sequence.id);
        }
    }

    if let Some(terminate) = &info.terminate_sequence_info {
        if Some(terminate.identifier) != ids.input {
            return unknown(terminate.identifier);
        }
    }

    if let Some(response) = &info.terminate_sequence_response_info {
        if Some(response.identifier) == ids.input {
            return protocol_fault(ids.input, FaultReason::UnexpectedTerminateSequenceResponse);
        }
        return unknown(response.identifier);
    }

    if let Some(close) = &info.close_sequence_info {
        if Some(close.identifier) != ids.input {
            return unknown(close.identifier);
        }
    }

    if let Some(response) = &info.close_sequence_response_info {
        if Some(response.identifier) == ids.input {
            return protocol_fault(ids.input, FaultReason::UnexpectedCloseSequenceResponse);
        }
        return unknown(response.identifier);
    }

    if info.create_sequence_response_info.is_some() {
        return protocol_fault(ids.input, FaultReason::UnexpectedCreateSequenceResponse);
    }

    None
}

fn verify_simplex_output(version: ReliableMessagingVersion, ids: &SequenceIds, info: &WsrmMessageInfo) -> Option<WsrmFault> {
    if let Some(ack) = &info.acknowledgement_info {
        if Some(ack.id) != ids.output {
            return unknown(ack.id);
        }
    }

    if info.ack_requested_info.is_some() {
        return protocol_fault(ids.output, FaultReason::UnexpectedAckRequested);
    }

    if let Some(sequence) = &info.sequenced_message_info {
        if Some(sequence.id) == ids.output {
            return protocol_fault(ids.output, FaultReason::UnexpectedSequencedMessage);
        }
        return unknown(sequence.id);
    }

    if let Some(terminate) = &info.terminate_sequence_info {
        if version == ReliableMessagingVersion::February2005 {
            return protocol_fault(ids.output, FaultReason::UnexpectedTerminateSequence);
        }
        if Some(terminate.identifier) != ids.output {
            return unknown(terminate.identifier);
        }
    }

    if let Some(response) = &info.terminate_sequence_response_info {
        if Some(response.identifier) != ids.output {
            return unknown(response.identifier);
        }
    }

    if let Some(close) = &info.close_sequence_info {
        if Some(close.identifier) == ids.output {
            return protocol_fault(ids.output, FaultReason::UnsupportedClose);
        }
        return unknown(close.identifier);
    }

    if let Some(response) = &info.close_sequence_response_info {
        if Some(response.identifier) != ids.output {
            return unknown(response.identifier);
        }
    }

    None
}
