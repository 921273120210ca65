//! Process-wide tunables for the reliable-delivery engine.
//!
//! The defaults reproduce the classic deployment values: a 32-packet
//! receive window inside a 64-slot ring, a 5692-byte receive MTU with up
//! to 4 jumbo fragments, and a 4-second resend timeout before any RTT
//! sample has been taken.

use std::time::Duration;

use crate::error::{Result, SkeinError};

/// Engine-wide configuration, shared by every connection and call.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum number of inbound service calls held awaiting acceptance.
    /// Further callers receive a BUSY packet.
    pub max_backlog: usize,
    /// How long to wait before acknowledging a DATA packet that carried
    /// the REQUEST_ACK flag.
    pub requested_ack_delay: Duration,
    /// How long to wait before acknowledging new in-order data when the
    /// sender did not ask for an ACK.
    pub soft_ack_delay: Duration,
    /// How long to wait before acknowledging consumed buffer space when no
    /// new data is arriving, so the peer can reuse its transmit slots.
    pub idle_ack_delay: Duration,
    /// Receive window in packets: the maximum number of unconsumed
    /// received packets retained per call. Must be at most
    /// `rxtx_ring_size - 1`.
    pub rx_window_size: usize,
    /// Capacity of the per-call transmit and receive rings. Must be a
    /// power of two strictly greater than `rx_window_size`.
    pub rxtx_ring_size: usize,
    /// Largest datagram we advertise willingness to receive, bounding
    /// jumbo aggregation.
    pub rx_mtu: usize,
    /// Maximum number of fragments accepted in one jumbo datagram.
    pub rx_jumbo_max: usize,
    /// Retransmission timeout used before any RTT sample exists.
    pub resend_timeout: Duration,
    /// Ceiling for the adaptive retransmission timeout, including backoff.
    pub max_rto: Duration,
    /// Retransmission attempts per packet before the call is aborted.
    pub max_resend_attempts: u32,
    /// Concurrent call slots multiplexed onto one connection.
    pub max_channels: usize,
    /// How long a fully idle client connection survives before being
    /// culled from its bundle.
    pub idle_conn_expiry: Duration,
    /// Cap on simultaneously live client connections across all bundles.
    pub max_client_connections: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_backlog: 10,
            requested_ack_delay: Duration::from_millis(1),
            soft_ack_delay: Duration::from_secs(1),
            idle_ack_delay: Duration::from_millis(500),
            rx_window_size: 32,
            rxtx_ring_size: 64,
            rx_mtu: 5692,
            rx_jumbo_max: 4,
            resend_timeout: Duration::from_secs(4),
            max_rto: Duration::from_secs(60),
            max_resend_attempts: 5,
            max_channels: 4,
            idle_conn_expiry: Duration::from_secs(60),
            max_client_connections: 64,
        }
    }
}

impl Config {
    /// Check the cross-field invariants the rings and multiplexer rely on.
    pub fn validate(&self) -> Result<()> {
        if !self.rxtx_ring_size.is_power_of_two() {
            return Err(SkeinError::InvalidConfig(
                "rxtx_ring_size must be a power of two",
            ));
        }
        if self.rx_window_size > self.rxtx_ring_size - 1 {
            return Err(SkeinError::InvalidConfig(
                "rx_window_size must be at most rxtx_ring_size - 1",
            ));
        }
        if self.rx_window_size == 0 {
            return Err(SkeinError::InvalidConfig("rx_window_size must be nonzero"));
        }
        if self.max_channels == 0 || self.max_channels > u8::MAX as usize {
            return Err(SkeinError::InvalidConfig(
                "max_channels must be between 1 and 255",
            ));
        }
        if self.rx_jumbo_max == 0 {
            return Err(SkeinError::InvalidConfig("rx_jumbo_max must be nonzero"));
        }
        Ok(())
    }
}
