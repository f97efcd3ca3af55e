use bytes::Bytes;
use crate::protocol::fault::WsrmFault;
use crate::protocol::sequence_id::SequenceId;
use crate::protocol::version::WsrmActions;
use crate::reliability::sequence_range::SequenceRangeCollection;


/// WS-Addressing headers, kept as raw strings: they are produced by the peer and may be malformed,
///  which the receiving side must tolerate.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AddressingHeaders {
    pub message_id: Option<String>,
    pub relates_to: Option<String>,
    pub reply_to: Option<String>,
    pub to: Option<String>,
}

/// The `Sequence` header of a sequenced message
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SequenceHeader {
    pub id: SequenceId,
    pub number: u64,
    /// February 2005 `LastMessage` element, or the 1.1 'last' marker of this implementation
    pub last_message: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AcknowledgementInfo {
    pub id: SequenceId,
    pub ranges: SequenceRangeCollection,
    /// the receiver's remaining buffer (`netrm:BufferRemaining`), present if it uses flow control
    pub buffer_remaining: Option<u64>,
    /// 1.1 `Final`: the receiver will not accept any further messages
    pub is_final: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AckRequestedInfo {
    pub id: SequenceId,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CreateSequenceInfo {
    pub acks_to: String,
    pub offer_identifier: Option<SequenceId>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CreateSequenceResponseInfo {
    pub identifier: SequenceId,
    /// true if an offered sequence was accepted as the responder's output sequence
    pub offer_accepted: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TerminateSequenceInfo {
    pub identifier: SequenceId,
    /// 1.1 only
    pub last_msg_number: Option<u64>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TerminateSequenceResponseInfo {
    pub identifier: SequenceId,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CloseSequenceInfo {
    pub identifier: SequenceId,
    pub last_msg_number: Option<u64>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CloseSequenceResponseInfo {
    pub identifier: SequenceId,
}

/// The body of a WS-RM protocol message
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProtocolBody {
    CreateSequence(CreateSequenceInfo),
    CreateSequenceResponse(CreateSequenceResponseInfo),
    TerminateSequence(TerminateSequenceInfo),
    TerminateSequenceResponse(TerminateSequenceResponseInfo),
    CloseSequence(CloseSequenceInfo),
    CloseSequenceResponse(CloseSequenceResponseInfo),
    Fault(WsrmFault),
}

impl ProtocolBody {
    /// the action a message carrying this body must have, `None` if the version does not know
    ///  the element
    pub fn expected_action<'a>(&self, actions: &'a WsrmActions) -> Option<&'a str> {
        match self {
            ProtocolBody::CreateSequence(_) => Some(&actions.create_sequence),
            ProtocolBody::CreateSequenceResponse(_) => Some(&actions.create_sequence_response),
            ProtocolBody::TerminateSequence(_) => Some(&actions.terminate_sequence),
            ProtocolBody::TerminateSequenceResponse(_) => actions.terminate_sequence_response.as_deref(),
            ProtocolBody::CloseSequence(_) => actions.close_sequence.as_deref(),
            ProtocolBody::CloseSequenceResponse(_) => actions.close_sequence_response.as_deref(),
            ProtocolBody::Fault(_) => Some(&actions.fault),
        }
    }

    pub fn element_name(&self) -> &'static str {
        match self {
            ProtocolBody::CreateSequence(_) => "CreateSequence",
            ProtocolBody::CreateSequenceResponse(_) => "CreateSequenceResponse",
            ProtocolBody::TerminateSequence(_) => "TerminateSequence",
            ProtocolBody::TerminateSequenceResponse(_) => "TerminateSequenceResponse",
            ProtocolBody::CloseSequence(_) => "CloseSequence",
            ProtocolBody::CloseSequenceResponse(_) => "CloseSequenceResponse",
            ProtocolBody::Fault(_) => "Fault",
        }
    }
}


/// A message as the reliable messaging layer sees it. Encoding is the business of the layer
///  below, so headers are kept in structured form.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Message {
    pub action: String,
    pub addressing: AddressingHeaders,
    pub sequence: Option<SequenceHeader>,
    pub acknowledgement: Option<AcknowledgementInfo>,
    pub ack_requested: Option<AckRequestedInfo>,
    pub body: Option<ProtocolBody>,
    pub payload: Bytes,
}

impl Message {
    pub fn new(action: impl Into<String>, payload: Bytes) -> Message {
        Message {
            action: action.into(),
            addressing: AddressingHeaders::default(),
            sequence: None,
            acknowledgement: None,
            ack_requested: None,
            body: None,
            payload,
        }
    }

    pub fn protocol(action: impl Into<String>, body: ProtocolBody) -> Message {
        Message {
            body: Some(body),
            ..Message::new(action, Bytes::new())
        }
    }

    pub fn create_sequence(actions: &WsrmActions, acks_to: impl Into<String>, offer_identifier: Option<SequenceId>) -> Message {
        Self::protocol(actions.create_sequence.clone(), ProtocolBody::CreateSequence(CreateSequenceInfo {
            acks_to: acks_to.into(),
            offer_identifier,
        }))
    }

    pub fn create_sequence_response(actions: &WsrmActions, identifier: SequenceId, offer_accepted: bool) -> Message {
        Self::protocol(actions.create_sequence_response.clone(), ProtocolBody::CreateSequenceResponse(CreateSequenceResponseInfo {
            identifier,
            offer_accepted,
        }))
    }

    pub fn terminate_sequence(actions: &WsrmActions, identifier: SequenceId, last_msg_number: Option<u64>) -> Message {
        Self::protocol(actions.terminate_sequence.clone(), ProtocolBody::TerminateSequence(TerminateSequenceInfo {
            identifier,
            last_msg_number,
        }))
    }

    /// 1.1 only
    pub fn terminate_sequence_response(actions: &WsrmActions, identifier: SequenceId) -> Option<Message> {
        actions.terminate_sequence_response.as_ref()
            .map(|action| Self::protocol(action.clone(), ProtocolBody::TerminateSequenceResponse(TerminateSequenceResponseInfo { identifier })))
    }

    /// 1.1 only
    pub fn close_sequence(actions: &WsrmActions, identifier: SequenceId, last_msg_number: Option<u64>) -> Option<Message> {
        actions.close_sequence.as_ref()
            .map(|action| Self::protocol(action.clone(), ProtocolBody::CloseSequence(CloseSequenceInfo { identifier, last_msg_number })))
    }

    /// 1.1 only
    pub fn close_sequence_response(actions: &WsrmActions, identifier: SequenceId) -> Option<Message> {
        actions.close_sequence_response.as_ref()
            .map(|action| Self::protocol(action.clone(), ProtocolBody::CloseSequenceResponse(CloseSequenceResponseInfo { identifier })))
    }

    /// February 2005 only: the empty sequenced message that marks the end of a sequence
    pub fn last_message(actions: &WsrmActions) -> Option<Message> {
        actions.last_message.as_ref()
            .map(|action| Message::new(action.clone(), Bytes::new()))
    }

    pub fn ack_requested(actions: &WsrmActions, id: SequenceId) -> Message {
        Message::new(actions.ack_requested.clone(), Bytes::new())
            .with_ack_requested(AckRequestedInfo { id })
    }

    pub fn acknowledgement(actions: &WsrmActions, ack: AcknowledgementInfo) -> Message {
        Message::new(actions.sequence_acknowledgement.clone(), Bytes::new())
            .with_acknowledgement(ack)
    }

    pub fn with_sequence(mut self, sequence: SequenceHeader) -> Message {
        self.sequence = Some(sequence);
        self
    }

    pub fn with_acknowledgement(mut self, ack: AcknowledgementInfo) -> Message {
        self.acknowledgement = Some(ack);
        self
    }

    pub fn with_ack_requested(mut self, ack_requested: AckRequestedInfo) -> Message {
        self.ack_requested = Some(ack_requested);
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Message {
        self.addressing.message_id = Some(message_id.into());
        self
    }

    pub fn is_fault(&self) -> bool {
        matches!(self.body, Some(ProtocolBody::Fault(_)))
    }
}
