use tracing::trace;
use crate::protocol::fault::{FaultCode, FaultReason, ParseError, SessionError, WsrmFault};
use crate::protocol::message::*;
use crate::protocol::version::{ReliableMessagingVersion, WsrmActions};


/// The result of interpreting the WS-RM content of an inbound [Message].
///
/// Every field is optional: a single message can carry an application payload with a `Sequence`
///  header plus a piggybacked acknowledgement, or a protocol body, or a fault. If the message could
///  not be interpreted at all, only `parsing_exception` is set.
#[derive(Clone, Debug)]
pub struct WsrmMessageInfo {
    pub message: Message,
    pub action: String,

    pub parsing_exception: Option<ParseError>,
    /// fault message to send back in reply to a malformed WS-RM header
    pub fault_reply: Option<Message>,
    /// the error corresponding to `fault_reply`, or an unrecognized fault
    pub fault_exception: Option<SessionError>,
    pub wsrm_header_fault: Option<WsrmFault>,
    /// a WS-RM fault received from the peer
    pub fault_info: Option<WsrmFault>,

    pub acknowledgement_info: Option<AcknowledgementInfo>,
    pub ack_requested_info: Option<AckRequestedInfo>,
    pub sequenced_message_info: Option<SequenceHeader>,
    pub create_sequence_info: Option<CreateSequenceInfo>,
    pub create_sequence_response_info: Option<CreateSequenceResponseInfo>,
    pub terminate_sequence_info: Option<TerminateSequenceInfo>,
    pub terminate_sequence_response_info: Option<TerminateSequenceResponseInfo>,
    pub close_sequence_info: Option<CloseSequenceInfo>,
    pub close_sequence_response_info: Option<CloseSequenceResponseInfo>,
}

impl WsrmMessageInfo {
    fn empty(message: Message) -> WsrmMessageInfo {
        WsrmMessageInfo {
            action: message.action.clone(),
            message,
            parsing_exception: None,
            fault_reply: None,
            fault_exception: None,
            wsrm_header_fault: None,
            fault_info: None,
            acknowledgement_info: None,
            ack_requested_info: None,
            sequenced_message_info: None,
            create_sequence_info: None,
            create_sequence_response_info: None,
            terminate_sequence_info: None,
            terminate_sequence_response_info: None,
            close_sequence_info: None,
            close_sequence_response_info: None,
        }
    }

    pub fn get(actions: &WsrmActions, message: Message) -> WsrmMessageInfo {
        let mut info = Self::empty(message);

        if let Err(e) = Self::check_structure(actions, &info.message) {
            trace!("could not parse message with action {}: {}", info.action, e);
            info.parsing_exception = Some(e);
            return info;
        }

        let message = info.message.clone();

        if let Some(sequence) = &message.sequence {
            let header_fault = if sequence.number == 0 {
                Some(WsrmFault::terminated(Some(sequence.id), FaultCode::Sender, FaultReason::InvalidMessageNumber))
            }
            else if sequence.number > actions.reliable_messaging_version.max_message_number() {
                Some(WsrmFault::MessageNumberRollover { id: sequence.id })
            }
            else {
                None
            };

            if let Some(fault) = header_fault {
                info.fault_reply = Some(fault.to_message(actions));
                info.fault_exception = Some(SessionError::Fault(fault.clone()));
                info.wsrm_header_fault = Some(fault);
                return info;
            }

            let mut sequence = sequence.clone();
            if actions.last_message.as_deref() == Some(message.action.as_str()) {
                sequence.last_message = true;
            }
            info.sequenced_message_info = Some(sequence);
        }

        info.acknowledgement_info = message.acknowledgement.clone();
        info.ack_requested_info = message.ack_requested.clone();

        match message.body {
            None => {
                if message.action == actions.fault {
                    info.fault_exception = Some(SessionError::Protocol("received a fault that is not a WS-RM fault".to_string()));
                }
            }
            Some(ProtocolBody::CreateSequence(cs)) => info.create_sequence_info = Some(cs),
            Some(ProtocolBody::CreateSequenceResponse(csr)) => info.create_sequence_response_info = Some(csr),
            Some(ProtocolBody::TerminateSequence(ts)) => info.terminate_sequence_info = Some(ts),
            Some(ProtocolBody::TerminateSequenceResponse(tsr)) => info.terminate_sequence_response_info = Some(tsr),
            Some(ProtocolBody::CloseSequence(cs)) => info.close_sequence_info = Some(cs),
            Some(ProtocolBody::CloseSequenceResponse(csr)) => info.close_sequence_response_info = Some(csr),
            Some(ProtocolBody::Fault(fault)) => info.fault_info = Some(fault),
        }

        info
    }

    fn check_structure(actions: &WsrmActions, message: &Message) -> Result<(), ParseError> {
        if let Some(body) = &message.body {
            match body.expected_action(actions) {
                None => {
                    return Err(ParseError::new(FaultReason::ElementNotSupportedByVersion,
                        format!("{} is not part of {:?}", body.element_name(), actions.reliable_messaging_version)));
                }
                Some(expected) if expected != message.action => {
                    return Err(ParseError::new(FaultReason::CouldNotParse,
                        format!("{} arrived with action {}", body.element_name(), message.action)));
                }
                _ => {}
            }
        }
        else {
            let body_actions = [
                Some(&actions.create_sequence),
                Some(&actions.create_sequence_response),
                Some(&actions.terminate_sequence),
                actions.terminate_sequence_response.as_ref(),
                actions.close_sequence.as_ref(),
                actions.close_sequence_response.as_ref(),
            ];
            if body_actions.into_iter().flatten().any(|a| a == &message.action) {
                return Err(ParseError::new(FaultReason::CouldNotParse, format!("missing body for action {}", message.action)));
            }
        }

        if message.action == actions.ack_requested && message.ack_requested.is_none() {
            return Err(ParseError::new(FaultReason::CouldNotParse, "AckRequested action without AckRequested header"));
        }
        if message.action == actions.sequence_acknowledgement && message.acknowledgement.is_none() {
            return Err(ParseError::new(FaultReason::CouldNotParse, "SequenceAcknowledgement action without acknowledgement header"));
        }
        if actions.last_message.as_deref() == Some(message.action.as_str()) && message.sequence.is_none() {
            return Err(ParseError::new(FaultReason::CouldNotParse, "LastMessage action without Sequence header"));
        }

        if actions.reliable_messaging_version == ReliableMessagingVersion::February2005 {
            if let Some(ack) = &message.acknowledgement {
                if ack.is_final {
                    return Err(ParseError::new(FaultReason::ElementNotSupportedByVersion, "Final acknowledgement"));
                }
            }
        }

        Ok(())
    }
}
