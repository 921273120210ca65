//! Round-trip estimation using the Jacobson/Karels algorithm (RFC 6298).
//!
//! SRTT   = 7/8 * SRTT   + 1/8 * sample
//! RTTVAR = 3/4 * RTTVAR + 1/4 * |SRTT - sample|
//! RTO    = SRTT + max(1ms, 4 * RTTVAR)
//!
//! Until the first sample arrives the RTO is the configured base resend
//! timeout. Samples come from two exchanges: a DATA packet with
//! REQUEST_ACK answered by a REQUESTED ACK, and a PING answered by a
//! PING_RESPONSE.

use std::time::Duration;

/// Minimum RTO after samples exist.
const MIN_RTO: Duration = Duration::from_millis(200);
/// Granularity floor for the variance component.
const GRANULARITY: Duration = Duration::from_millis(1);

/// Per-call RTT estimator.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    /// Smoothed RTT.
    srtt: Option<Duration>,
    /// RTT variance.
    rttvar: Option<Duration>,
    /// Current retransmission timeout.
    rto: Duration,
    /// Ceiling applied to the derived RTO.
    max_rto: Duration,
}

impl RttEstimator {
    /// Create an estimator whose pre-sample RTO is `initial_rto`.
    pub fn new(initial_rto: Duration, max_rto: Duration) -> Self {
        Self {
            srtt: None,
            rttvar: None,
            rto: initial_rto,
            max_rto,
        }
    }

    /// Feed a new round-trip sample and re-derive the RTO.
    pub fn update(&mut self, sample: Duration) {
        match self.srtt {
            None => {
                self.srtt = Some(sample);
                self.rttvar = Some(sample / 2);
            }
            Some(srtt) => {
                let diff = if srtt > sample {
                    srtt - sample
                } else {
                    sample - srtt
                };
                let rttvar = self.rttvar.unwrap_or(diff);
                self.rttvar = Some((rttvar * 3 + diff) / 4);
                self.srtt = Some((srtt * 7 + sample) / 8);
            }
        }

        if let (Some(srtt), Some(rttvar)) = (self.srtt, self.rttvar) {
            let var_component = std::cmp::max(GRANULARITY, rttvar * 4);
            self.rto = (srtt + var_component).clamp(MIN_RTO, self.max_rto);
        }
    }

    /// Returns the smoothed RTT, or `None` before the first sample.
    pub fn srtt(&self) -> Option<Duration> {
        self.srtt
    }

    /// Returns the RTT variance, or `None` before the first sample.
    pub fn rttvar(&self) -> Option<Duration> {
        self.rttvar
    }

    /// Returns the current retransmission timeout.
    pub fn rto(&self) -> Duration {
        self.rto
    }
}
