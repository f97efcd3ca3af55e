//! The session layer: the fault state machine tying a session's sequences together, the checks
//!  applied to inbound protocol elements, and the background sending of terminating faults.

pub mod fault_helper;
pub mod reliable_session;
pub mod session_events;
pub mod verification;
