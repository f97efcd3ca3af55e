//! The WS-ReliableMessaging vocabulary: identifiers, version-specific actions, the structured
//!  message model and the fault taxonomy.

pub mod fault;
pub mod message;
pub mod message_info;
pub mod sequence_id;
pub mod version;
