use std::cmp::min;
use std::time::Duration;
use crate::config::TransmissionSettings;


const RTT_ALPHA: f64 = 0.125;
const RTT_BETA: f64 = 0.25;
const RTT_K: u32 = 4;
const MAX_BACKOFF_EXPONENT: u32 = 6;

/// Round trip time estimate and the resulting retransmission timeout for a sequence, following
///  RFC 6298 (smoothed RTT plus four times its variation).
///
/// Samples are only taken from messages that were acknowledged after their first attempt: for a
///  retransmitted message there is no telling which attempt the acknowledgement refers to.
#[derive(Debug, Clone)]
pub struct RetryTiming {
    srtt: Duration,
    rttvar: Duration,
    rto: Duration,
    min_rto: Duration,
    max_rto: Duration,
}

impl RetryTiming {
    pub fn new(settings: &TransmissionSettings) -> RetryTiming {
        Self::with_bounds(settings.initial_rtt, settings.min_rto, settings.max_rto)
    }

    fn with_bounds(initial_rtt: Duration, min_rto: Duration, max_rto: Duration) -> RetryTiming {
        let srtt = initial_rtt;
        let rttvar = initial_rtt / 2;
        RetryTiming {
            srtt,
            rttvar,
            rto: (srtt + rttvar * RTT_K).clamp(min_rto, max_rto),
            min_rto,
            max_rto,
        }
    }

    pub fn on_rtt_sample(&mut self, sample: Duration) {
        let diff = sample.abs_diff(self.srtt);

        self.rttvar = self.rttvar.mul_f64(1.0 - RTT_BETA) + diff.mul_f64(RTT_BETA);
        self.srtt = self.srtt.mul_f64(1.0 - RTT_ALPHA) + sample.mul_f64(RTT_ALPHA);
        self.rto = (self.srtt + self.rttvar * RTT_K).clamp(self.min_rto, self.max_rto);
    }

    pub fn srtt(&self) -> Duration {
        self.srtt
    }

    pub fn rto(&self) -> Duration {
        self.rto
    }

    /// The time to wait after the given attempt (1-based) before sending the next one. The timeout
    ///  doubles with every attempt, up to 2^6 times the base timeout and never beyond the maximum.
    pub fn retry_timeout(&self, attempt: u32) -> Duration {
        let exponent = min(attempt.saturating_sub(1), MAX_BACKOFF_EXPONENT);
        min(self.rto * (1 << exponent), self.max_rto)
    }
}
