//! The per-call acknowledgment scheduler.
//!
//! Every event that might justify an ACK is funneled through [`AckScheduler::note`].
//! The scheduler keeps exactly one pending reason (the highest-priority
//! one seen since the last ACK went out) and exactly one deadline (the
//! minimum over all noted reasons' own delays), so there is one timer per
//! call and no event queue. Firing clears both and emits a single ACK
//! that opportunistically reports the winning reason.

use std::time::{Duration, Instant};

use tracing::trace;

use crate::config::Config;
use crate::packet::AckReason;

/// Coalesces ACK triggers into one pending reason and one deadline.
#[derive(Debug)]
pub struct AckScheduler {
    requested_ack_delay: Duration,
    soft_ack_delay: Duration,
    idle_ack_delay: Duration,
    pending: Option<AckReason>,
    deadline: Option<Instant>,
}

impl AckScheduler {
    pub fn new(cfg: &Config) -> Self {
        Self {
            requested_ack_delay: cfg.requested_ack_delay,
            soft_ack_delay: cfg.soft_ack_delay,
            idle_ack_delay: cfg.idle_ack_delay,
            pending: None,
            deadline: None,
        }
    }

    /// The delay a reason tolerates before its ACK must go out.
    fn delay_for(&self, reason: AckReason) -> Duration {
        if reason.is_immediate() {
            return Duration::ZERO;
        }
        match reason {
            AckReason::Requested => self.requested_ack_delay,
            AckReason::Delay => self.soft_ack_delay,
            AckReason::Idle => self.idle_ack_delay,
            // OutOfSequence rides the soft delay: it is new data, just not
            // immediately consumable.
            AckReason::OutOfSequence => self.soft_ack_delay,
            _ => Duration::ZERO,
        }
    }

    /// Record a candidate reason.
    ///
    /// The highest-priority reason observed wins and determines what the
    /// eventual ACK reports; the deadline only ever moves earlier.
    pub fn note(&mut self, reason: AckReason, now: Instant) {
        let due = now + self.delay_for(reason);

        match self.pending {
            Some(current) if current.priority() >= reason.priority() => {}
            _ => {
                trace!(?reason, "ack reason promoted");
                self.pending = Some(reason);
            }
        }

        self.deadline = Some(match self.deadline {
            Some(existing) => std::cmp::min(existing, due),
            None => due,
        });
    }

    /// True if a reason is pending, due or not.
    pub fn is_armed(&self) -> bool {
        self.pending.is_some()
    }

    /// The instant at which the pending ACK must be emitted, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// True when the pending ACK is due at `now`.
    pub fn is_due(&self, now: Instant) -> bool {
        matches!(self.deadline, Some(d) if d <= now)
    }

    /// Consume the pending state, returning the reason to stamp on the
    /// one ACK emitted for this decision. `None` if nothing was armed.
    pub fn fire(&mut self) -> Option<AckReason> {
        self.deadline = None;
        self.pending.take()
    }
}
