use std::time::Duration;
use anyhow::bail;
use crate::protocol::version::{AddressingVersion, ReliableMessagingVersion, WsrmActions};


/// When a session is aborted, it makes a single attempt to send a pending fault to the peer. That
///  attempt is bounded by this fixed timeout.
pub const ABORT_FAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub struct ReliableSessionConfig {
    /// The WS-RM version is fixed for the lifetime of a session; peers using a different version
    ///  can not talk to each other.
    pub reliable_messaging_version: ReliableMessagingVersion,
    pub addressing_version: AddressingVersion,

    /// If true, messages are delivered to the application in sequence number order (exactly once,
    ///  in order). Otherwise they are delivered as they arrive (exactly once).
    pub ordered: bool,

    /// If true, the sender additionally respects the receiver's announced remaining buffer space
    ///  on top of the transfer window.
    pub flow_control_enabled: bool,

    /// This is the maximum number of messages (not bytes) that are sent but not yet acknowledged.
    ///  Adding a message when the window is full suspends the caller until an acknowledgement
    ///  frees a slot.
    pub max_transfer_window_size: u32,
    /// upper bound for `max_transfer_window_size`
    pub max_transfer_window_size_bound: u32,

    /// The number of times a single message is sent before the sequence is given up. Running out
    ///  of retries is fatal to the whole session.
    pub max_retry_count: u32,

    /// the number of sessions a listener accepts before they are picked up by the application
    pub max_pending_channels: u32,
    pub max_pending_channels_bound: u32,

    /// If no message from the peer arrives for this duration, the session faults
    pub inactivity_timeout: Duration,

    /// The receiver batches acknowledgements for this long before sending them
    pub acknowledgement_interval: Duration,

    /// Seed for the round trip time estimate, used until the first acknowledgement is measured
    pub initial_rtt: Duration,
    pub min_retransmission_timeout: Duration,
    pub max_retransmission_timeout: Duration,

    pub fault_helper_send_timeout: Duration,
    pub fault_helper_close_timeout: Duration,
}

impl ReliableSessionConfig {
    pub fn new() -> ReliableSessionConfig {
        ReliableSessionConfig {
            reliable_messaging_version: ReliableMessagingVersion::February2005,
            addressing_version: AddressingVersion::WsAddressing10,
            ordered: true,
            flow_control_enabled: true,
            max_transfer_window_size: 8,
            max_transfer_window_size_bound: 4096,
            max_retry_count: 8,
            max_pending_channels: 4,
            max_pending_channels_bound: 16384,
            inactivity_timeout: Duration::from_secs(600),
            acknowledgement_interval: Duration::from_millis(200),
            initial_rtt: Duration::from_millis(200),
            min_retransmission_timeout: Duration::from_millis(50),
            max_retransmission_timeout: Duration::from_secs(60),
            fault_helper_send_timeout: Duration::from_secs(5),
            fault_helper_close_timeout: Duration::from_secs(5),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_transfer_window_size == 0 {
            bail!("transfer window size must be at least 1");
        }
        if self.max_transfer_window_size > self.max_transfer_window_size_bound {
            bail!("transfer window size {} exceeds the upper bound of {}", self.max_transfer_window_size, self.max_transfer_window_size_bound);
        }
        if self.max_retry_count == 0 {
            bail!("max retry count must be at least 1");
        }
        if self.max_pending_channels == 0 {
            bail!("max pending channels must be at least 1");
        }
        if self.max_pending_channels > self.max_pending_channels_bound {
            bail!("max pending channels {} exceeds the upper bound of {}", self.max_pending_channels, self.max_pending_channels_bound);
        }
        if self.inactivity_timeout.is_zero() {
            bail!("inactivity timeout must be positive");
        }
        if self.acknowledgement_interval.is_zero() {
            bail!("acknowledgement interval must be positive");
        }
        if self.acknowledgement_interval >= self.inactivity_timeout {
            bail!("acknowledgement interval must be shorter than the inactivity timeout - otherwise the peer times out before it sees an acknowledgement");
        }
        if self.initial_rtt.is_zero() {
            bail!("initial RTT must be positive");
        }
        if self.min_retransmission_timeout > self.max_retransmission_timeout {
            bail!("minimum retransmission timeout is above the maximum");
        }

        Ok(())
    }

    pub fn actions(&self) -> WsrmActions {
        WsrmActions::new(self.reliable_messaging_version, self.addressing_version)
    }

    pub fn transmission_settings(&self) -> TransmissionSettings {
        TransmissionSettings {
            reliable_messaging_version: self.reliable_messaging_version,
            max_transfer_window_size: self.max_transfer_window_size,
            flow_control_enabled: self.flow_control_enabled,
            max_retry_count: self.max_retry_count,
            initial_rtt: self.initial_rtt,
            min_rto: self.min_retransmission_timeout,
            max_rto: self.max_retransmission_timeout,
        }
    }
}

/// The part of the configuration the sending side of a sequence works with
#[derive(Clone, Debug)]
pub struct TransmissionSettings {
    pub reliable_messaging_version: ReliableMessagingVersion,
    pub max_transfer_window_size: u32,
    pub flow_control_enabled: bool,
    pub max_retry_count: u32,
    pub initial_rtt: Duration,
    pub min_rto: Duration,
    pub max_rto: Duration,
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ReliableSessionConfig::new();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_transfer_window_size, 8);
        assert_eq!(config.max_retry_count, 8);
        assert_eq!(config.transmission_settings().max_transfer_window_size, 8);
    }

    #[rstest]
    #[case::zero_window(|c: &mut ReliableSessionConfig| c.max_transfer_window_size = 0)]
    #[case::window_above_bound(|c: &mut ReliableSessionConfig| c.max_transfer_window_size = 4097)]
    #[case::zero_retries(|c: &mut ReliableSessionConfig| c.max_retry_count = 0)]
    #[case::zero_pending(|c: &mut ReliableSessionConfig| c.max_pending_channels = 0)]
    #[case::pending_above_bound(|c: &mut ReliableSessionConfig| c.max_pending_channels = 16385)]
    #[case::zero_inactivity(|c: &mut ReliableSessionConfig| c.inactivity_timeout = Duration::ZERO)]
    #[case::ack_interval_too_long(|c: &mut ReliableSessionConfig| c.acknowledgement_interval = Duration::from_secs(600))]
    #[case::zero_rtt(|c: &mut ReliableSessionConfig| c.initial_rtt = Duration::ZERO)]
    fn test_validate_invalid(#[case] modify: fn(&mut ReliableSessionConfig)) {
        let mut config = ReliableSessionConfig::new();
        modify(&mut config);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bound_is_configurable() {
        let mut config = ReliableSessionConfig::new();
        config.max_transfer_window_size_bound = 10_000;
        config.max_transfer_window_size = 5_000;
        assert!(config.validate().is_ok());
    }
}
