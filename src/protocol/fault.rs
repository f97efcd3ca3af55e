use std::time::Duration;
use thiserror::Error;
use crate::protocol::message::{Message, ProtocolBody};
use crate::protocol::sequence_id::SequenceId;
use crate::protocol::version::WsrmActions;
use crate::reliability::sequence_range::SequenceRangeCollection;


#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum FaultCode {
    /// the party receiving the fault caused it
    Sender,
    /// the party sending the fault failed on its own
    Receiver,
}

/// The distinct reasons for which a sequence is terminated. The text is informational, the
///  variant is what callers and peers can rely on.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Error)]
pub enum FaultReason {
    #[error("the sequence was terminated because the session was aborted")]
    OnAbort,
    #[error("the last message could not be added to the transfer window in time")]
    AddLastToWindowTimedOut,
    #[error("an unknown error occurred while adding a message to the transfer window")]
    UnknownAddToWindowError,
    #[error("a message exceeded the transport's quota")]
    QuotaExceeded,
    #[error("a message was not acknowledged within the maximum retry count")]
    RetryCountExceeded,
    #[error("inactivity timeout exceeded")]
    InactivityTimeout,
    #[error("an unexpected TerminateSequence was received")]
    UnexpectedTerminateSequence,
    #[error("an unexpected TerminateSequenceResponse was received")]
    UnexpectedTerminateSequenceResponse,
    #[error("the peer closed the sequence, which is not supported by this session")]
    UnsupportedClose,
    #[error("an unexpected CloseSequence was received")]
    UnexpectedCloseSequence,
    #[error("an unexpected CloseSequenceResponse was received")]
    UnexpectedCloseSequenceResponse,
    #[error("an acknowledgement was received on a simplex input sequence")]
    UnexpectedAcknowledgement,
    #[error("an AckRequested was received on a simplex output sequence")]
    UnexpectedAckRequested,
    #[error("a sequenced message was received on a simplex output sequence")]
    UnexpectedSequencedMessage,
    #[error("an unexpected CreateSequenceResponse was received")]
    UnexpectedCreateSequenceResponse,
    #[error("the message could not be parsed")]
    CouldNotParse,
    #[error("the message contains an element that is not supported by the negotiated protocol version")]
    ElementNotSupportedByVersion,
    #[error("message number 0 is not a valid message number")]
    InvalidMessageNumber,
    #[error("the last message number is smaller than the number of a message that was already received")]
    SmallLastMessageNumber,
    #[error("a different last message number was announced before")]
    InconsistentLastMessageNumber,
    #[error("the sequence was terminated before all messages were received")]
    IncompleteSequence,
}


/// A WS-ReliableMessaging fault, either raised locally or received from the peer.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum WsrmFault {
    #[error("unknown sequence {id}")]
    UnknownSequence { id: SequenceId },
    #[error("sequence {id:?} was terminated: {reason}")]
    SequenceTerminated {
        id: Option<SequenceId>,
        code: FaultCode,
        reason: FaultReason,
    },
    #[error("invalid acknowledgement {ranges} for sequence {id}")]
    InvalidAcknowledgement { id: SequenceId, ranges: SequenceRangeCollection },
    #[error("message number rollover on sequence {id}")]
    MessageNumberRollover { id: SequenceId },
    #[error("last message number exceeded on sequence {id}")]
    LastMessageNumberExceeded { id: SequenceId },
    #[error("sequence {id} is closed")]
    SequenceClosed { id: SequenceId },
    #[error("CreateSequence was refused: {reason}")]
    CreateSequenceRefused { reason: String },
}

impl WsrmFault {
    pub fn terminated(id: Option<SequenceId>, code: FaultCode, reason: FaultReason) -> WsrmFault {
        WsrmFault::SequenceTerminated { id, code, reason }
    }

    pub fn code(&self) -> FaultCode {
        match self {
            WsrmFault::SequenceTerminated { code, .. } => *code,
            _ => FaultCode::Sender,
        }
    }

    /// the fault subcode as it appears on the wire
    pub fn subcode(&self) -> &'static str {
        match self {
            WsrmFault::UnknownSequence { .. } => "UnknownSequence",
            WsrmFault::SequenceTerminated { .. } => "SequenceTerminated",
            WsrmFault::InvalidAcknowledgement { .. } => "InvalidAcknowledgement",
            WsrmFault::MessageNumberRollover { .. } => "MessageNumberRollover",
            WsrmFault::LastMessageNumberExceeded { .. } => "LastMessageNumberExceeded",
            WsrmFault::SequenceClosed { .. } => "SequenceClosed",
            WsrmFault::CreateSequenceRefused { .. } => "CreateSequenceRefused",
        }
    }

    pub fn sequence_id(&self) -> Option<SequenceId> {
        match self {
            WsrmFault::UnknownSequence { id } => Some(*id),
            WsrmFault::SequenceTerminated { id, .. } => *id,
            WsrmFault::InvalidAcknowledgement { id, .. } => Some(*id),
            WsrmFault::MessageNumberRollover { id } => Some(*id),
            WsrmFault::LastMessageNumberExceeded { id } => Some(*id),
            WsrmFault::SequenceClosed { id } => Some(*id),
            WsrmFault::CreateSequenceRefused { .. } => None,
        }
    }

    pub fn reason(&self) -> Option<FaultReason> {
        match self {
            WsrmFault::SequenceTerminated { reason, .. } => Some(*reason),
            _ => None,
        }
    }

    pub fn to_message(&self, actions: &WsrmActions) -> Message {
        Message::protocol(actions.fault.clone(), ProtocolBody::Fault(self.clone()))
    }
}


/// A message that was received but could not be interpreted as a valid WS-RM message.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[error("{reason}: {detail}")]
pub struct ParseError {
    pub reason: FaultReason,
    pub detail: String,
}

impl ParseError {
    pub fn new(reason: FaultReason, detail: impl Into<String>) -> ParseError {
        ParseError {
            reason,
            detail: detail.into(),
        }
    }
}


/// What a caller of a session operation observes when the operation does not succeed.
///
/// This is `Clone` so that a session's terminal error can be handed out to every waiter; underlying
///  collaborator errors are therefore stored as strings.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum SessionError {
    #[error("the operation did not complete within {0:?}")]
    Timeout(Duration),
    #[error("the session was aborted")]
    Aborted,
    #[error("the session faulted: {0}")]
    Fault(WsrmFault),
    #[error("the peer faulted the session: {0}")]
    RemoteFault(WsrmFault),
    #[error("communication failure: {0}")]
    Communication(String),
    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl SessionError {
    pub fn fault(&self) -> Option<&WsrmFault> {
        match self {
            SessionError::Fault(f) | SessionError::RemoteFault(f) => Some(f),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for SessionError {
    fn from(value: anyhow::Error) -> Self {
        SessionError::Communication(format!("{:#}", value))
    }
}

impl From<ParseError> for SessionError {
    fn from(value: ParseError) -> Self {
        SessionError::Protocol(value.to_string())
    }
}
