use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;
use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};
use crate::binder::{InboundMessage, ReliableChannelBinder, RequestContext};
use crate::config::{ReliableSessionConfig, ABORT_FAULT_FLUSH_TIMEOUT};
use crate::protocol::fault::{FaultCode, FaultReason, SessionError, WsrmFault};
use crate::protocol::message::{CreateSequenceInfo, Message};
use crate::protocol::message_info::WsrmMessageInfo;
use crate::protocol::sequence_id::SequenceId;
use crate::protocol::version::{ReliableMessagingVersion, WsrmActions};
use crate::reliability::input_connection::{InputOutcome, ReliableInputConnection};
use crate::reliability::output_connection::{ConnectionFaultHandler, ReliableOutputConnection, SendHandler};
use crate::reliability::retry_timing::RetryTiming;
use crate::reliability::transmission_strategy::MessageAttemptInfo;
use crate::session::fault_helper::{FaultDelivery, FaultHelper};
use crate::session::session_events::{FaultOrigin, SessionEvent, SessionEventNotifier, SessionFaultedData};
use crate::session::verification::{verify_duplex, verify_simplex, SequenceIds, SessionRole, SessionShape, SessionSide};
use crate::util::deadline::{deadline_after, remaining};
use crate::util::guard::Guard;
use crate::util::interruptible_timer::InterruptibleTimer;
use crate::util::wait_object::WaitObject;


/// The fault state of a session only ever moves forward: `NotFaulted` to one of the faulted
///  states, and from there to `CleanedUp`. Whoever makes a transition owns its consequences, in
///  particular sending the (single) terminating fault.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SessionFaultState {
    NotFaulted,
    LocallyFaulted,
    RemotelyFaulted,
    CleanedUp,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ProcessOutcome {
    /// the message should be processed further
    Continue,
    /// the message was consumed and must not be processed further
    Drop,
}

struct FaultData {
    fault_state: SessionFaultState,
    origin: Option<FaultOrigin>,
    can_send_fault: bool,
    terminating_fault: Option<Message>,
    reply_context: Option<Arc<dyn RequestContext>>,
    error: Option<SessionError>,
    is_session_closed: bool,
    close_started: bool,
}

/// A WS-RM session: a pair of sequences (or a single one for simplex roles), the inactivity
///  timeout that guards them, and the fault state machine that decides whether and how the peer
///  is told about a failure.
///
/// The session owns its output connection and fault helper. The binder is shared with the
///  transport layer, the session drives its close / abort though.
pub struct ReliableSession {
    myself: Weak<ReliableSession>,
    role: SessionRole,
    config: ReliableSessionConfig,
    actions: Arc<WsrmActions>,
    binder: Arc<dyn ReliableChannelBinder>,
    fault_helper: Arc<FaultHelper>,
    events: SessionEventNotifier,
    guard: Guard,
    input: OnceLock<Arc<ReliableInputConnection>>,
    output: OnceLock<ReliableOutputConnection>,
    inactivity_timer: InterruptibleTimer,
    ack_timer: InterruptibleTimer,
    /// outcome of the first `close()`, shared with later and concurrent callers
    closed: WaitObject,
    state: Mutex<FaultData>,
}

impl ReliableSession {
    pub fn new(role: SessionRole, config: ReliableSessionConfig, binder: Arc<dyn ReliableChannelBinder>) -> anyhow::Result<Arc<ReliableSession>> {
        config.validate()?;

        let actions = Arc::new(config.actions());
        let delivery = match role.side {
            SessionSide::Server => FaultDelivery::Reply,
            SessionSide::Client => FaultDelivery::Send,
        };
        let fault_helper = Arc::new(FaultHelper::new(delivery, config.fault_helper_send_timeout));

        Ok(Arc::new_cyclic(|myself: &Weak<ReliableSession>| {
            let inactivity_timer = {
                let myself = myself.clone();
                InterruptibleTimer::new(config.inactivity_timeout, move || {
                    if let Some(session) = myself.upgrade() {
                        session.on_inactivity_timeout();
                    }
                })
            };
            let ack_timer = {
                let myself = myself.clone();
                InterruptibleTimer::new(config.acknowledgement_interval, move || {
                    if let Some(session) = myself.upgrade() {
                        tokio::spawn(async move {
                            session.send_acknowledgement().await;
                        });
                    }
                })
            };

            ReliableSession {
                myself: myself.clone(),
                role,
                actions,
                binder,
                fault_helper,
                events: SessionEventNotifier::new(),
                guard: Guard::unbounded(),
                input: OnceLock::new(),
                output: OnceLock::new(),
                inactivity_timer,
                ack_timer,
                closed: WaitObject::new(),
                state: Mutex::new(FaultData {
                    fault_state: SessionFaultState::NotFaulted,
                    origin: None,
                    can_send_fault: true,
                    terminating_fault: None,
                    reply_context: None,
                    error: None,
                    is_session_closed: false,
                    close_started: false,
                }),
                config,
            }
        }))
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn actions(&self) -> &Arc<WsrmActions> {
        &self.actions
    }

    pub fn ids(&self) -> SequenceIds {
        SequenceIds {
            input: self.input_id(),
            output: self.output_id(),
        }
    }

    pub fn input_id(&self) -> Option<SequenceId> {
        self.input.get().map(|i| i.id())
    }

    pub fn output_id(&self) -> Option<SequenceId> {
        self.output.get().map(|o| o.id())
    }

    pub fn input(&self) -> Option<&Arc<ReliableInputConnection>> {
        self.input.get()
    }

    pub fn output(&self) -> Option<&ReliableOutputConnection> {
        self.output.get()
    }

    pub fn fault_state(&self) -> SessionFaultState {
        self.state.lock().unwrap().fault_state
    }

    pub fn fault_origin(&self) -> Option<FaultOrigin> {
        self.state.lock().unwrap().origin
    }

    /// the error that ended the session, if any
    pub fn error(&self) -> Option<SessionError> {
        self.state.lock().unwrap().error.clone()
    }

    pub fn is_session_closed(&self) -> bool {
        self.state.lock().unwrap().is_session_closed
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// the error to report if the session is no longer usable
    fn fault_error(&self) -> Option<SessionError> {
        let state = self.state.lock().unwrap();
        match state.fault_state {
            SessionFaultState::NotFaulted => None,
            _ => Some(state.error.clone().unwrap_or(SessionError::Aborted)),
        }
    }

    fn install_input(&self, id: SequenceId) -> bool {
        let input = ReliableInputConnection::new(
            id,
            self.config.reliable_messaging_version,
            self.config.ordered,
            self.config.flow_control_enabled,
            self.config.max_transfer_window_size,
        );
        self.input.set(Arc::new(input)).is_ok()
    }

    fn install_output(&self, id: SequenceId) -> bool {
        if self.output.get().is_some() {
            return false;
        }
        let relay = Arc::new(OutputRelay {
            session: self.myself.clone(),
        });
        let output = ReliableOutputConnection::new(id, self.config.transmission_settings(), self.actions.clone(), relay.clone(), relay);
        self.output.set(output).is_ok()
    }

    /// Server side of the handshake: sets up the session's sequences and returns the
    ///  CreateSequenceResponse. A duplex session requires the peer to offer the sequence that
    ///  becomes our output.
    pub fn accept_create_sequence(&self, create_sequence: &CreateSequenceInfo) -> Result<Message, SessionError> {
        if self.role.side != SessionSide::Server {
            return Err(SessionError::Protocol("only a server session accepts a CreateSequence".to_string()));
        }

        let offer = match (self.role.shape, create_sequence.offer_identifier) {
            (SessionShape::Duplex, None) => {
                return Err(SessionError::Fault(WsrmFault::CreateSequenceRefused {
                    reason: "a duplex session requires an offered sequence".to_string(),
                }));
            }
            (SessionShape::Duplex, Some(offer)) => Some(offer),
            (SessionShape::Simplex, _) => None,
        };

        let input_id = SequenceId::new_unique();
        if !self.install_input(input_id) {
            return Err(SessionError::Protocol("the session is already open".to_string()));
        }
        if let Some(offer) = offer {
            self.install_output(offer);
        }

        info!("accepted CreateSequence: input sequence {}, output sequence {:?}", input_id, offer);
        self.start_inactivity_timer();
        Ok(Message::create_sequence_response(&self.actions, input_id, offer.is_some()))
    }

    /// Client side of the handshake. The CreateSequence is retried with the same backoff as
    ///  sequenced messages, up to the configured retry count.
    pub async fn open(&self, timeout: Duration) -> Result<(), SessionError> {
        if self.role.side != SessionSide::Client {
            return Err(SessionError::Protocol("only a client session sends a CreateSequence".to_string()));
        }
        if self.output.get().is_some() {
            return Err(SessionError::Protocol("the session is already open".to_string()));
        }

        let deadline = deadline_after(timeout);
        let offer = (self.role.shape == SessionShape::Duplex).then(SequenceId::new_unique);
        let acks_to = self.actions.addressing_version.anonymous_uri();
        let timing = RetryTiming::new(&self.config.transmission_settings());

        for attempt in 1..=self.config.max_retry_count {
            let attempt_timeout = timing.retry_timeout(attempt).min(remaining(deadline));
            if attempt_timeout.is_zero() {
                break;
            }
            let attempt_deadline = deadline_after(attempt_timeout);

            trace!("sending CreateSequence (attempt {})", attempt);
            let request = Message::create_sequence(&self.actions, acks_to, offer);
            match tokio::time::timeout(attempt_timeout, self.binder.request(request, attempt_timeout)).await {
                Ok(Ok(reply)) => return self.on_create_sequence_response(offer, reply),
                Ok(Err(e)) => {
                    debug!("CreateSequence attempt {} failed: {:#}", attempt, e);
                    tokio::time::sleep_until(attempt_deadline).await;
                }
                Err(_) => {
                    debug!("no CreateSequenceResponse within {:?}", attempt_timeout);
                }
            }
        }

        warn!("no CreateSequenceResponse after {} attempts", self.config.max_retry_count);
        Err(SessionError::Timeout(timeout))
    }

    fn on_create_sequence_response(&self, offer: Option<SequenceId>, reply: Message) -> Result<(), SessionError> {
        let info = WsrmMessageInfo::get(&self.actions, reply);
        if let Some(e) = info.parsing_exception {
            return Err(e.into());
        }
        if let Some(fault) = info.fault_info {
            return Err(SessionError::RemoteFault(fault));
        }
        let response = info.create_sequence_response_info
            .ok_or_else(|| SessionError::Protocol(format!("unexpected reply {} to CreateSequence", info.action)))?;

        if offer.is_some() && !response.offer_accepted {
            return Err(SessionError::Protocol("the peer did not accept the offered sequence".to_string()));
        }
        if !self.install_output(response.identifier) {
            return Err(SessionError::Protocol("the session is already open".to_string()));
        }
        if let Some(offer) = offer {
            self.install_input(offer);
        }

        info!("session open: output sequence {}, input sequence {:?}", response.identifier, offer);
        self.start_inactivity_timer();
        Ok(())
    }

    /// Sends an application message on the output sequence. This waits while the transfer window
    ///  is full.
    pub async fn send(&self, message: Message, timeout: Duration) -> Result<(), SessionError> {
        let _entry = match self.guard.enter().await {
            Some(entry) => entry,
            None => return Err(self.unavailable_error()),
        };
        if let Some(e) = self.fault_error() {
            return Err(e);
        }

        let output = self.output.get()
            .ok_or_else(|| SessionError::Protocol("the session has no output sequence".to_string()))?;

        if output.add_message(message, timeout).await? {
            Ok(())
        }
        else {
            Err(self.unavailable_error())
        }
    }

    fn unavailable_error(&self) -> SessionError {
        self.fault_error()
            .unwrap_or_else(|| SessionError::Protocol("the session is closed".to_string()))
    }

    /// Processes a message received through the binder, returning the application messages that
    ///  became deliverable.
    pub async fn on_message(&self, inbound: InboundMessage) -> Result<Vec<Message>, SessionError> {
        let InboundMessage { message, context } = inbound;

        if let Some(e) = self.fault_error() {
            trace!("session is faulted - discarding {}", message.action);
            if let Some(context) = context {
                context.abort();
            }
            return Err(e);
        }

        let info = WsrmMessageInfo::get(&self.actions, message);
        if self.process_info(&info, context.clone())? == ProcessOutcome::Drop || info.fault_info.is_some() {
            if let Some(context) = context {
                context.abort();
            }
            return Ok(vec![]);
        }
        self.verify_protocol_elements(&info, context.clone())?;

        if let (Some(ack), Some(output)) = (&info.acknowledgement_info, self.output.get()) {
            output.process_transferred_ranges(&ack.ranges, ack.buffer_remaining);
            if let Some(e) = self.fault_error() {
                if let Some(context) = context {
                    context.abort();
                }
                return Err(e);
            }
        }

        let mut replied = false;
        let mut ack_now = info.ack_requested_info.is_some();
        let mut deliverable = Vec::new();

        if let (Some(header), Some(input)) = (&info.sequenced_message_info, self.input.get()) {
            match input.add(header, info.message.clone()) {
                Ok(InputOutcome::Accepted(messages)) => {
                    deliverable = messages;
                    if header.last_message {
                        ack_now = true;
                    }
                    else {
                        self.ack_timer.set_if_not_set();
                    }
                }
                Ok(InputOutcome::Duplicate) => ack_now = true,
                Ok(InputOutcome::Dropped) => {}
                Err(fault) => return Err(self.fault_locally(fault, context)),
            }
        }

        if let Some(terminate) = &info.terminate_sequence_info {
            match self.input.get().filter(|i| i.id() == terminate.identifier) {
                Some(input) => {
                    if let Err(fault) = input.set_terminate_sequence_last(terminate.last_msg_number) {
                        return Err(self.fault_locally(fault, context));
                    }
                    let missing = input.missing();
                    if !missing.is_empty() {
                        debug!("sequence {} was terminated while messages {} are missing", input.id(), missing);
                        let fault = WsrmFault::terminated(Some(input.id()), FaultCode::Sender, FaultReason::IncompleteSequence);
                        return Err(self.fault_locally(fault, context));
                    }
                    debug!("input sequence {} terminated", input.id());
                    if let Some(response) = Message::terminate_sequence_response(&self.actions, input.id()) {
                        self.reply(&context, response.with_acknowledgement(input.acknowledgement_info())).await;
                        replied = true;
                    }
                }
                None => debug!("peer terminated output sequence {}", terminate.identifier),
            }
        }

        if let Some(close) = &info.close_sequence_info {
            if let Some(input) = self.input.get().filter(|i| i.id() == close.identifier) {
                let last = close.last_msg_number
                    .or(input.ranges().upper_bound())
                    .unwrap_or(0);
                if let Err(fault) = input.set_close_sequence_last(last) {
                    return Err(self.fault_locally(fault, context));
                }
                debug!("input sequence {} closed at #{}", input.id(), last);
                if let Some(response) = Message::close_sequence_response(&self.actions, input.id()) {
                    self.reply(&context, response.with_acknowledgement(input.acknowledgement_info())).await;
                    replied = true;
                }
            }
        }

        if !replied {
            match (&context, self.acknowledgement_message()) {
                (Some(_), Some(ack)) => {
                    self.ack_timer.cancel();
                    self.reply(&context, ack).await;
                }
                (Some(context), None) => context.abort(),
                (None, Some(ack)) if ack_now => {
                    self.ack_timer.cancel();
                    self.send_protocol_message(ack).await;
                }
                _ => {}
            }
        }

        Ok(deliverable)
    }

    /// Handles the parts of an inbound message that concern the session as a whole: parse
    ///  failures, faults the peer sent and header faults. Anything that is not fine here
    ///  faults the session.
    pub fn process_info(&self, info: &WsrmMessageInfo, context: Option<Arc<dyn RequestContext>>) -> Result<ProcessOutcome, SessionError> {
        let ids = self.ids();

        if let Some(e) = &info.parsing_exception {
            debug!("received a message that could not be parsed: {}", e);
            let fault = ids.primary()
                .map(|id| WsrmFault::terminated(Some(id), FaultCode::Sender, e.reason));
            let error = SessionError::from(e.clone());
            self.on_local_fault(error.clone(), fault, context);
            return Err(error);
        }

        if let Some(header_fault) = &info.wsrm_header_fault {
            if let Some(id) = header_fault.sequence_id().filter(|id| !ids.is_own(*id)) {
                let fault = WsrmFault::UnknownSequence { id };
                return Err(self.fault_locally(fault, context));
            }
        }

        if info.fault_reply.is_some() {
            let error = info.fault_exception.clone()
                .unwrap_or_else(|| SessionError::Protocol("invalid WS-RM header".to_string()));
            self.on_local_fault(error.clone(), info.wsrm_header_fault.clone(), context);
            return Err(error);
        }

        if let Some(fault) = &info.fault_info {
            if self.is_session_closed() {
                if let WsrmFault::UnknownSequence { id } = fault {
                    if ids.is_own(*id) {
                        trace!("ignoring UnknownSequence for closed sequence {}", id);
                        return Ok(match self.config.reliable_messaging_version {
                            ReliableMessagingVersion::V1_1 => ProcessOutcome::Drop,
                            ReliableMessagingVersion::February2005 => ProcessOutcome::Continue,
                        });
                    }
                }
            }

            let error = SessionError::RemoteFault(fault.clone());
            self.on_remote_fault(error.clone());
            if let Some(context) = context {
                context.abort();
            }
            return Err(error);
        }

        if let Some(error) = &info.fault_exception {
            self.on_remote_fault(error.clone());
            if let Some(context) = context {
                context.abort();
            }
            return Err(error.clone());
        }

        self.on_remote_activity();
        Ok(ProcessOutcome::Continue)
    }

    /// Checks the message's WS-RM elements against the rules for the session's shape
    pub fn verify_protocol_elements(&self, info: &WsrmMessageInfo, context: Option<Arc<dyn RequestContext>>) -> Result<(), SessionError> {
        match self.role.shape {
            SessionShape::Duplex => self.verify_duplex_protocol_elements(info, context),
            SessionShape::Simplex => self.verify_simplex_protocol_elements(info, context),
        }
    }

    pub fn verify_duplex_protocol_elements(&self, info: &WsrmMessageInfo, context: Option<Arc<dyn RequestContext>>) -> Result<(), SessionError> {
        let fault = verify_duplex(self.config.reliable_messaging_version, self.role.side, &self.ids(), info);
        self.on_verification_result(fault, context)
    }

    pub fn verify_simplex_protocol_elements(&self, info: &WsrmMessageInfo, context: Option<Arc<dyn RequestContext>>) -> Result<(), SessionError> {
        let fault = verify_simplex(self.config.reliable_messaging_version, self.role.side, &self.ids(), info);
        self.on_verification_result(fault, context)
    }

    fn on_verification_result(&self, fault: Option<WsrmFault>, context: Option<Arc<dyn RequestContext>>) -> Result<(), SessionError> {
        match fault {
            None => Ok(()),
            Some(fault) => {
                debug!("protocol violation: {}", fault);
                Err(self.fault_locally(fault, context))
            }
        }
    }

    fn fault_locally(&self, fault: WsrmFault, context: Option<Arc<dyn RequestContext>>) -> SessionError {
        let error = SessionError::Fault(fault.clone());
        self.on_local_fault(error.clone(), Some(fault), context);
        error
    }

    /// The fault message that is sent to the peer, carrying a final acknowledgement for the
    ///  input sequence if there is one
    fn terminating_fault_message(&self, fault: &WsrmFault) -> Message {
        let message = fault.to_message(&self.actions);
        match self.input.get() {
            Some(input) => message.with_acknowledgement(input.acknowledgement_info()),
            None => message,
        }
    }

    /// This side detected a problem. Only the first fault of a session is acted upon: it is
    ///  reported to subscribers, and the fault (if any) is sent to the peer.
    pub fn on_local_fault(&self, error: SessionError, fault: Option<WsrmFault>, context: Option<Arc<dyn RequestContext>>) {
        let terminating_fault = fault.map(|f| self.terminating_fault_message(&f));

        {
            let mut state = self.state.lock().unwrap();
            if state.fault_state != SessionFaultState::NotFaulted {
                drop(state);
                trace!("session is faulted already - ignoring {}", error);
                if let Some(context) = context {
                    context.abort();
                }
                return;
            }

            state.fault_state = SessionFaultState::LocallyFaulted;
            state.origin = Some(FaultOrigin::Local);
            state.error = Some(error.clone());
            state.terminating_fault = terminating_fault;
            state.reply_context = context;
        }

        info!("session faulted: {}", error);
        self.events.send_event(SessionEvent::Faulted(SessionFaultedData { origin: FaultOrigin::Local, error }));
        self.on_faulted();
    }

    /// The peer reported a problem. No fault is sent back in this case.
    pub fn on_remote_fault(&self, error: SessionError) {
        {
            let mut state = self.state.lock().unwrap();
            if state.fault_state != SessionFaultState::NotFaulted {
                return;
            }
            state.fault_state = SessionFaultState::RemotelyFaulted;
            state.origin = Some(FaultOrigin::Remote);
            state.error = Some(error.clone());
        }

        info!("peer faulted the session: {}", error);
        self.events.send_event(SessionEvent::Faulted(SessionFaultedData { origin: FaultOrigin::Remote, error }));
        self.on_faulted();
    }

    /// A failure that may have compromised the session's ability to build a valid fault, so
    ///  nothing is sent to the peer.
    pub fn on_unknown_exception(&self, error: SessionError) {
        self.state.lock().unwrap().can_send_fault = false;
        self.on_local_fault(error, None, None);
    }

    /// Releases everything the fault left behind, exactly once: the terminating fault goes to
    ///  the fault helper, or the binder is aborted if there is nothing to send. Also called when
    ///  the underlying channel fails on its own.
    pub fn on_faulted(&self) {
        let (send_fault, terminating_fault, context, newly_faulted) = {
            let mut state = self.state.lock().unwrap();
            let newly_faulted = match state.fault_state {
                SessionFaultState::CleanedUp => return,
                SessionFaultState::NotFaulted => {
                    state.origin = Some(FaultOrigin::Local);
                    Some(state.error.get_or_insert(SessionError::Communication("the underlying channel faulted".to_string())).clone())
                }
                _ => None,
            };

            let send_fault = state.can_send_fault && state.fault_state != SessionFaultState::RemotelyFaulted;
            state.fault_state = SessionFaultState::CleanedUp;
            (send_fault, state.terminating_fault.take(), state.reply_context.take(), newly_faulted)
        };

        if let Some(error) = newly_faulted {
            info!("session faulted: {}", error);
            self.events.send_event(SessionEvent::Faulted(SessionFaultedData { origin: FaultOrigin::Local, error }));
        }

        self.stop_activity();

        match (send_fault, terminating_fault) {
            (true, Some(fault)) => {
                debug!("sending terminating fault");
                self.fault_helper.send_fault(self.binder.clone(), context, fault);
            }
            _ => {
                if let Some(context) = context {
                    context.abort();
                }
                self.binder.abort();
            }
        }
    }

    fn stop_activity(&self) {
        self.inactivity_timer.abort();
        self.ack_timer.abort();
        self.guard.abort();
        if let Some(output) = self.output.get() {
            output.abort();
        }
        self.closed.fault(SessionError::Aborted);
    }

    /// Tears the session down without waiting. If nothing went wrong before, a single attempt is
    ///  made to tell the peer, bounded by a short fixed timeout. Idempotent, and a no-op after
    ///  the session's fault was handled.
    pub fn abort(&self) {
        let connected = self.binder.connected();
        let primary_id = self.ids().primary();

        let (flush, context) = {
            let mut state = self.state.lock().unwrap();
            let previous = state.fault_state;
            if previous == SessionFaultState::CleanedUp {
                drop(state);
                self.stop_activity();
                return;
            }

            state.fault_state = SessionFaultState::CleanedUp;
            let context = state.reply_context.take();
            let flush = match previous {
                SessionFaultState::NotFaulted => {
                    state.error.get_or_insert(SessionError::Aborted);
                    let can_send_fault = state.can_send_fault && connected;
                    primary_id
                        .filter(|_| can_send_fault)
                        .map(|id| self.terminating_fault_message(&WsrmFault::terminated(Some(id), FaultCode::Receiver, FaultReason::OnAbort)))
                }
                SessionFaultState::LocallyFaulted if state.can_send_fault => state.terminating_fault.take(),
                _ => None,
            };
            (flush, context)
        };

        debug!("aborting session");
        self.stop_activity();

        match flush {
            Some(fault) => {
                self.fault_helper.send_fault_with_timeout(self.binder.clone(), context, fault, ABORT_FAULT_FLUSH_TIMEOUT);
            }
            None => {
                if let Some(context) = context {
                    context.abort();
                }
                self.binder.abort();
                self.fault_helper.abort();
            }
        }
    }

    /// Graceful shutdown: waits for pending sends, for the output sequence to be fully
    ///  acknowledged and for pending fault sends, then closes the binder.
    ///
    /// Only the first call does the work. Later and concurrent calls wait for its outcome.
    pub async fn close(&self, timeout: Duration) -> Result<(), SessionError> {
        if let Some(e) = self.fault_error() {
            return Err(e);
        }

        let close_started = std::mem::replace(&mut self.state.lock().unwrap().close_started, true);
        if close_started {
            trace!("session close was started before - waiting for its outcome");
            return self.closed.wait(timeout).await;
        }

        let result = self.do_close(timeout).await;
        match &result {
            Ok(()) => self.closed.set(),
            Err(e) => self.closed.fault(e.clone()),
        };
        result
    }

    async fn do_close(&self, timeout: Duration) -> Result<(), SessionError> {
        let deadline = deadline_after(timeout);

        self.guard.close(timeout).await
            .map_err(|e| self.close_error(e, timeout))?;

        if let Some(output) = self.output.get() {
            output.close(remaining(deadline)).await
                .map_err(|e| self.close_error(e, timeout))?;

            if self.role.side == SessionSide::Client {
                let last = (self.config.reliable_messaging_version == ReliableMessagingVersion::V1_1).then(|| output.last());
                let terminate = Message::terminate_sequence(&self.actions, output.id(), last);
                tokio::time::timeout(remaining(deadline), self.binder.send(terminate, remaining(deadline))).await
                    .map_err(|_| SessionError::Timeout(timeout))??;
            }
        }

        self.inactivity_timer.abort();
        self.ack_timer.abort();

        self.fault_helper.close(remaining(deadline)).await
            .map_err(|e| self.close_error(e, timeout))?;

        match tokio::time::timeout(remaining(deadline), self.binder.close(remaining(deadline))).await {
            Ok(result) => result?,
            Err(_) => {
                self.binder.abort();
                return Err(SessionError::Timeout(timeout));
            }
        }

        self.close_session();
        debug!("session closed");
        self.events.send_event(SessionEvent::Closed);
        Ok(())
    }

    fn close_error(&self, error: SessionError, timeout: Duration) -> SessionError {
        match error {
            SessionError::Timeout(_) => SessionError::Timeout(timeout),
            SessionError::Aborted => self.fault_error().unwrap_or(SessionError::Aborted),
            other => other,
        }
    }

    /// From now on, UnknownSequence faults for this session's sequences are expected
    pub fn close_session(&self) {
        self.state.lock().unwrap().is_session_closed = true;
    }

    pub fn start_inactivity_timer(&self) {
        self.inactivity_timer.set();
    }

    pub fn on_remote_activity(&self) {
        if self.fault_state() == SessionFaultState::NotFaulted {
            self.inactivity_timer.set();
        }
    }

    fn on_inactivity_timeout(&self) {
        info!("no message from the peer within {:?}", self.inactivity_timer.timeout());
        let fault = WsrmFault::terminated(self.ids().primary(), FaultCode::Receiver, FaultReason::InactivityTimeout);
        self.on_local_fault(SessionError::Fault(fault.clone()), Some(fault), None);
    }

    fn acknowledgement_message(&self) -> Option<Message> {
        self.input.get()
            .map(|input| Message::acknowledgement(&self.actions, input.acknowledgement_info()))
    }

    /// sends a standalone acknowledgement for the input sequence
    pub async fn send_acknowledgement(&self) {
        if self.fault_error().is_some() {
            return;
        }
        if let Some(ack) = self.acknowledgement_message() {
            self.send_protocol_message(ack).await;
        }
    }

    fn protocol_send_timeout(&self) -> Duration {
        self.config.max_retransmission_timeout
    }

    async fn send_protocol_message(&self, message: Message) {
        trace!("sending {}", message.action);
        if let Err(e) = self.binder.send(message, self.protocol_send_timeout()).await {
            debug!("error sending protocol message: {:#}", e);
        }
    }

    async fn reply(&self, context: &Option<Arc<dyn RequestContext>>, message: Message) {
        match context {
            Some(context) => {
                if let Err(e) = context.reply(message, self.protocol_send_timeout()).await {
                    debug!("error sending reply: {:#}", e);
                }
            }
            None => self.send_protocol_message(message).await,
        }
    }
}

/// Connects the output connection to its session without keeping the session alive
struct OutputRelay {
    session: Weak<ReliableSession>,
}

#[async_trait]
impl SendHandler for OutputRelay {
    async fn send(&self, attempt: MessageAttemptInfo, timeout: Duration, is_retry: bool) -> anyhow::Result<()> {
        let session = self.session.upgrade()
            .ok_or_else(|| anyhow!("the session is gone"))?;

        if is_retry {
            trace!("resending message #{} (attempt {})", attempt.number, attempt.attempt);
        }

        let mut message = attempt.message;
        if let Some(input) = session.input.get() {
            message = message.with_acknowledgement(input.acknowledgement_info());
            session.ack_timer.cancel();
        }
        session.binder.send(message, timeout).await
    }

    async fn send_ack_requested(&self, timeout: Duration) -> anyhow::Result<()> {
        let session = self.session.upgrade()
            .ok_or_else(|| anyhow!("the session is gone"))?;
        let id = session.output_id()
            .ok_or_else(|| anyhow!("no output sequence"))?;
        session.binder.send(Message::ack_requested(&session.actions, id), timeout).await
    }
}

impl ConnectionFaultHandler for OutputRelay {
    fn on_connection_fault(&self, fault: WsrmFault) {
        if let Some(session) = self.session.upgrade() {
            session.on_local_fault(SessionError::Fault(fault.clone()), Some(fault), None);
        }
    }
}
