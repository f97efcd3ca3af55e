//! Sequence mechanics: acknowledgement ranges, retransmission timing, the transfer window and
//!  the sending / receiving ends of a sequence.

pub mod input_connection;
pub mod output_connection;
pub mod retry_timing;
pub mod sequence_range;
pub mod transmission_strategy;
