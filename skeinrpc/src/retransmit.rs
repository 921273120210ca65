//! Per-packet retransmission timers.
//!
//! One timer exists per unacknowledged sequence number, kept in a binary
//! heap ordered by deadline with a side map for cancellation: acking a
//! sequence removes it from the map and any stale heap entry is skipped
//! when it surfaces, so cancellation is O(1) and idempotent. Payloads are
//! not duplicated here; the transmit ring keeps them until rotation.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::packet::{Seq, SeqRange};

#[derive(Debug)]
struct TimerEntry {
    seq: Seq,
    deadline: Instant,
}

// Reverse ordering so the earliest deadline pops first; ties break on
// the lower sequence number.
impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then(other.seq.cmp(&self.seq))
    }
}

#[derive(Debug)]
struct TimerState {
    /// Current per-packet timeout; doubles on every resend, capped.
    rto: Duration,
    /// Resend attempts so far.
    attempts: u32,
    /// When the packet (original transmission) went out.
    sent_at: Instant,
    /// The packet asked the peer for a prompt ACK, making it a valid
    /// round-trip probe.
    request_ack: bool,
    /// The deadline of the live heap entry for this sequence.
    deadline: Instant,
}

/// A packet that used up its retransmission budget.
#[derive(Debug, Clone, Copy)]
pub struct Exhausted {
    pub seq: Seq,
    pub attempts: u32,
}

/// Resend timer wheel for one call's transmit side.
#[derive(Debug)]
pub struct RetransmitQueue {
    heap: BinaryHeap<TimerEntry>,
    pending: HashMap<Seq, TimerState>,
    max_attempts: u32,
    max_rto: Duration,
}

impl RetransmitQueue {
    pub fn new(max_attempts: u32, max_rto: Duration) -> Self {
        Self {
            heap: BinaryHeap::new(),
            pending: HashMap::new(),
            max_attempts,
            max_rto,
        }
    }

    /// Arm a resend timer for a freshly transmitted packet.
    pub fn on_send(&mut self, seq: Seq, rto: Duration, request_ack: bool, now: Instant) {
        let deadline = now + rto;
        self.pending.insert(
            seq,
            TimerState {
                rto,
                attempts: 0,
                sent_at: now,
                request_ack,
                deadline,
            },
        );
        self.heap.push(TimerEntry { seq, deadline });
    }

    /// Cumulative acknowledgment: cancel every timer at or below `up_to`.
    ///
    /// Returns an RTT sample taken from the newest request-tagged packet
    /// in the retired range that was never retransmitted (a resent packet
    /// is ambiguous about which transmission the ACK answers, so it never
    /// produces a sample). Re-acking an already retired range cancels
    /// nothing and samples nothing.
    pub fn on_ack(&mut self, up_to: Seq, now: Instant) -> Option<Duration> {
        let mut sample: Option<(Seq, Duration)> = None;
        self.pending.retain(|&seq, state| {
            if seq > up_to {
                return true;
            }
            if state.request_ack && state.attempts == 0 {
                let elapsed = now.saturating_duration_since(state.sent_at);
                match sample {
                    Some((best_seq, _)) if best_seq > seq => {}
                    _ => sample = Some((seq, elapsed)),
                }
            }
            false
        });
        sample.map(|(_, elapsed)| elapsed)
    }

    /// Selective acknowledgment: cancel timers for specific higher ranges.
    pub fn on_sack(&mut self, ranges: &[SeqRange]) {
        for range in ranges {
            for seq in range.start..=range.end {
                self.pending.remove(&seq);
            }
        }
    }

    /// Collect packets whose timer has expired.
    ///
    /// Each expired packet either comes back for retransmission with its
    /// per-packet timeout doubled (capped at the configured maximum), or,
    /// once the attempt budget is spent, is reported as exhausted. A
    /// timer that fires after its sequence was acknowledged is a no-op.
    pub fn poll_expired(&mut self, now: Instant) -> (Vec<Seq>, Vec<Exhausted>) {
        let mut resend = Vec::new();
        let mut exhausted = Vec::new();

        while let Some(entry) = self.heap.peek() {
            if entry.deadline > now {
                break;
            }
            let entry = self.heap.pop().expect("peeked entry");

            let Some(state) = self.pending.get_mut(&entry.seq) else {
                // Acked since the timer was armed.
                continue;
            };
            if state.deadline != entry.deadline {
                // Stale entry from before a re-arm.
                continue;
            }

            if state.attempts >= self.max_attempts {
                trace!(seq = entry.seq, attempts = state.attempts, "retransmission exhausted");
                exhausted.push(Exhausted {
                    seq: entry.seq,
                    attempts: state.attempts,
                });
                self.pending.remove(&entry.seq);
            } else {
                state.attempts += 1;
                state.rto = std::cmp::min(state.rto * 2, self.max_rto);
                state.deadline = now + state.rto;
                self.heap.push(TimerEntry {
                    seq: entry.seq,
                    deadline: state.deadline,
                });
                resend.push(entry.seq);
            }
        }

        (resend, exhausted)
    }

    /// The earliest armed deadline, if any timer is live.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|s| s.deadline).min()
    }

    /// Cancel everything. Used on abort; idempotent.
    pub fn cancel_all(&mut self) {
        self.pending.clear();
        self.heap.clear();
    }

    /// Number of sequences still awaiting acknowledgment.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// True while an unacknowledged packet still carries an ACK request.
    pub fn has_request_pending(&self) -> bool {
        self.pending.values().any(|s| s.request_ack)
    }
}
