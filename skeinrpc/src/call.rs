//! One logical RPC exchange.
//!
//! A `Call` owns its transmit/receive rings, ACK scheduler, resend timers
//! and RTT estimator, and is the unit of mutual exclusion: every packet
//! arrival and timer expiry for the call is applied under its owner's
//! lock, so the three mechanisms always observe a consistent view.
//!
//! The call itself is purely reactive. Inbound events are applied through
//! `on_*` methods, outbound traffic accumulates in a staging buffer, and
//! [`Call::poll`] drains it together with whatever the timers produced.

use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::ack::AckScheduler;
use crate::config::Config;
use crate::error::{Result, SkeinError};
use crate::packet::{AckReason, Packet, PacketFlags, Seq, SeqRange, ABORT_TIMEOUT};
use crate::retransmit::RetransmitQueue;
use crate::ring::{RxOutcome, RxRing, TxRing};
use crate::rtt::RttEstimator;

/// Which side of the exchange this call is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Client,
    Service,
}

/// Call completion state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    InProgress,
    /// Both sides sent their final packet and everything was delivered.
    Complete,
    /// Terminated locally or by the peer with an abort code.
    Aborted(u32),
}

#[derive(Debug)]
pub struct Call {
    direction: Direction,
    state: CallState,
    tx: TxRing,
    rx: RxRing,
    acks: AckScheduler,
    timers: RetransmitQueue,
    rtt: RttEstimator,
    window: usize,
    /// The final outbound packet has been submitted.
    tx_ended: bool,
    /// The final inbound packet has been consumed.
    rx_ended: bool,
    /// Inbound probe awaiting its PING_RESPONSE echo.
    pending_ping_echo: Option<u64>,
    /// Outbound probe awaiting the peer's answer.
    ping_out: Option<(u64, Instant)>,
    /// Outbound packets staged for the next poll.
    staged: Vec<Packet>,
}

impl Call {
    pub fn new(cfg: &Config, direction: Direction) -> Self {
        Self {
            direction,
            state: CallState::InProgress,
            tx: TxRing::new(cfg.rxtx_ring_size, cfg.rx_window_size),
            rx: RxRing::new(cfg.rxtx_ring_size, cfg.rx_window_size),
            acks: AckScheduler::new(cfg),
            timers: RetransmitQueue::new(cfg.max_resend_attempts, cfg.max_rto),
            rtt: RttEstimator::new(cfg.resend_timeout, cfg.max_rto),
            window: cfg.rx_window_size,
            tx_ended: false,
            rx_ended: false,
            pending_ping_echo: None,
            ping_out: None,
            staged: Vec::new(),
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    /// True once every transmitted packet has been acknowledged: the gate
    /// for reusing this call's channel, since channel + sequence space is
    /// recycled by the successor.
    pub fn is_drained(&self) -> bool {
        self.tx.is_drained()
    }

    pub fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    fn ensure_live(&self) -> Result<()> {
        match self.state {
            CallState::Aborted(code) => Err(SkeinError::CallAborted { code }),
            _ => Ok(()),
        }
    }

    /// Submit one outbound payload, assigning it the next sequence number
    /// and arming its resend timer.
    ///
    /// An ACK is requested when this is the final packet, when the
    /// window is half consumed, or when no earlier in-flight packet is
    /// already asking for one, so the peer keeps our ring moving even
    /// across short bursts.
    pub fn send(&mut self, payload: Bytes, is_last: bool, now: Instant) -> Result<Seq> {
        self.ensure_live()?;
        if self.tx_ended {
            return Err(SkeinError::CallEnded);
        }

        let request_ack = is_last
            || (self.tx.in_flight() + 1) * 2 >= self.window
            || !self.timers.has_request_pending();
        let mut flags = PacketFlags::NONE;
        if is_last {
            flags = flags.with(PacketFlags::LAST_PACKET);
        }
        if request_ack {
            flags = flags.with(PacketFlags::REQUEST_ACK);
        }

        let seq = self.tx.submit(payload.clone(), flags)?;
        self.timers.on_send(seq, self.rtt.rto(), request_ack, now);
        self.staged.push(Packet::Data {
            seq,
            flags,
            payload,
        });
        if is_last {
            self.tx_ended = true;
        }
        trace!(seq, is_last, request_ack, "queued data packet");
        Ok(seq)
    }

    /// Apply one inbound DATA packet (already de-jumboed).
    pub fn on_data(&mut self, seq: Seq, flags: PacketFlags, payload: Bytes, now: Instant) {
        if self.state != CallState::InProgress {
            trace!(seq, state = ?self.state, "data for finished call ignored");
            return;
        }

        let prior_cumulative = self.rx.cumulative();
        let is_last = flags.contains(PacketFlags::LAST_PACKET);
        match self.rx.receive(seq, payload, is_last) {
            RxOutcome::Accepted => {
                if flags.contains(PacketFlags::REQUEST_ACK) {
                    self.acks.note(AckReason::Requested, now);
                }
                if seq != prior_cumulative + 1 {
                    // Landed beyond a hole.
                    self.acks.note(AckReason::OutOfSequence, now);
                } else {
                    self.acks.note(AckReason::Delay, now);
                }
            }
            RxOutcome::Duplicate => self.acks.note(AckReason::Duplicate, now),
            RxOutcome::OutOfWindow => self.acks.note(AckReason::ExceedsWindow, now),
        }
    }

    /// Apply one inbound ACK packet.
    ///
    /// Every reason carries a cumulative acknowledgment, so rotation and
    /// timer cancellation happen unconditionally; PING and PING_RESPONSE
    /// additionally drive the probe exchange.
    pub fn on_ack(
        &mut self,
        reason: AckReason,
        ack_seq: Seq,
        ping_id: u64,
        ranges: &[SeqRange],
        now: Instant,
    ) {
        if matches!(self.state, CallState::Aborted(_)) {
            return;
        }

        self.tx.rotate(ack_seq);
        if let Some(sample) = self.timers.on_ack(ack_seq, now) {
            self.rtt.update(sample);
            trace!(rto = ?self.rtt.rto(), "rtt sample from requested ack");
        }
        self.timers.on_sack(ranges);

        match reason {
            AckReason::Ping => {
                self.pending_ping_echo = Some(ping_id);
                self.acks.note(AckReason::PingResponse, now);
            }
            AckReason::PingResponse => {
                if let Some((id, sent_at)) = self.ping_out.take() {
                    if id == ping_id {
                        self.rtt.update(now.saturating_duration_since(sent_at));
                        trace!(rto = ?self.rtt.rto(), "rtt sample from ping response");
                    } else {
                        self.ping_out = Some((id, sent_at));
                    }
                }
            }
            _ => {}
        }

        self.maybe_complete();
    }

    /// The peer acknowledged everything sent so far in one stroke.
    pub fn on_ack_all(&mut self) {
        if matches!(self.state, CallState::Aborted(_)) {
            return;
        }
        let top = self.tx.top();
        self.tx.rotate(top);
        self.timers.cancel_all();
        self.maybe_complete();
    }

    /// The peer aborted the call.
    pub fn on_abort(&mut self, code: u32) {
        if matches!(self.state, CallState::Aborted(_)) {
            return;
        }
        debug!(code, "call aborted by peer");
        self.terminate(code);
    }

    /// Abort locally, notifying the peer.
    pub fn abort(&mut self, code: u32) {
        if matches!(self.state, CallState::Aborted(_) | CallState::Complete) {
            return;
        }
        debug!(code, "call aborted locally");
        self.terminate(code);
        self.staged.push(Packet::Abort { code });
    }

    /// Release all timers and ring slots exactly once.
    fn terminate(&mut self, code: u32) {
        self.state = CallState::Aborted(code);
        self.timers.cancel_all();
        self.acks.fire();
        self.tx.clear();
        self.rx.clear();
        self.staged.retain(|p| matches!(p, Packet::Abort { .. }));
    }

    /// Pop the next in-order inbound payload, if one is ready.
    ///
    /// Consuming frees receive-window space; when the buffer runs dry an
    /// IDLE ack is scheduled so the peer can release its transmit slots.
    pub fn consume(&mut self, now: Instant) -> Option<Bytes> {
        let (_, payload, is_last) = self.rx.consume()?;
        if is_last {
            self.rx_ended = true;
        }
        if self.rx.cumulative() < self.rx.next_expected() {
            // Nothing further is immediately consumable.
            self.acks.note(AckReason::Idle, now);
        }
        self.maybe_complete();
        Some(payload)
    }

    /// True once the peer's final packet has been consumed.
    pub fn rx_ended(&self) -> bool {
        self.rx_ended
    }

    /// Send a keep-alive probe; the answering PING_RESPONSE yields an RTT
    /// sample even when no data is moving.
    pub fn ping(&mut self, ping_id: u64, now: Instant) {
        if self.state != CallState::InProgress {
            return;
        }
        self.ping_out = Some((ping_id, now));
        self.staged.push(Packet::Ack {
            reason: AckReason::Ping,
            ack_seq: self.rx.cumulative(),
            ping_id,
            ranges: self.rx.sack_ranges(),
        });
    }

    /// External buffer-memory pressure: demand the peer back off now.
    pub fn note_no_space(&mut self, now: Instant) {
        self.acks.note(AckReason::NoSpace, now);
    }

    /// Drain staged traffic, fire due timers, and emit retransmissions.
    ///
    /// If a packet has exhausted its retransmission budget the call
    /// aborts here with a timeout code, which is also the packet this
    /// poll returns.
    pub fn poll(&mut self, now: Instant) -> Vec<Packet> {
        let mut out = std::mem::take(&mut self.staged);

        let (resend, exhausted) = self.timers.poll_expired(now);
        for seq in resend {
            if let Some(slot) = self.tx.slot(seq) {
                debug!(seq, "retransmitting");
                out.push(Packet::Data {
                    seq,
                    flags: slot.flags,
                    payload: slot.payload.clone(),
                });
            }
        }

        if let Some(ex) = exhausted.first() {
            debug!(seq = ex.seq, attempts = ex.attempts, "retransmission budget spent");
            self.terminate(ABORT_TIMEOUT);
            out.push(Packet::Abort {
                code: ABORT_TIMEOUT,
            });
            return out;
        }

        if self.acks.is_due(now) {
            if let Some(reason) = self.acks.fire() {
                out.push(self.build_ack(reason));
            }
        }

        out
    }

    /// The next instant at which `poll` has work, for timer scheduling.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.acks.deadline(), self.timers.next_deadline()) {
            (Some(a), Some(b)) => Some(std::cmp::min(a, b)),
            (a, b) => a.or(b),
        }
    }

    fn build_ack(&mut self, reason: AckReason) -> Packet {
        let ping_id = match reason {
            AckReason::PingResponse => self.pending_ping_echo.take().unwrap_or(0),
            _ => 0,
        };
        Packet::Ack {
            reason,
            ack_seq: self.rx.cumulative(),
            ping_id,
            ranges: self.rx.sack_ranges(),
        }
    }

    fn maybe_complete(&mut self) {
        if self.state == CallState::InProgress
            && self.tx_ended
            && self.rx_ended
            && self.tx.is_drained()
        {
            debug!("call complete");
            self.state = CallState::Complete;
        }
    }
}
