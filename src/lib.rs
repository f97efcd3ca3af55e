//! A WS-ReliableMessaging session engine (February 2005 and 1.1).
//!
//! The crate implements the protocol machinery between an application that sends and receives
//!  messages and a transport that may lose, duplicate or reorder them: sequence numbering,
//!  acknowledgement tracking, retransmission with adaptive timeouts, windowed flow control and
//!  the fault handling that ties the two sequences of a session together.
//!
//! Message encoding is not part of this crate. Messages are handled in the structured form of
//!  [protocol::message::Message], and transports plug in through the traits in [binder].

pub mod binder;
pub mod config;
pub mod demux;
pub mod protocol;
pub mod receive_context;
pub mod reliability;
pub mod session;
pub mod test_util;
pub mod util;
