//! Per-call transmit and receive rings.
//!
//! Both sides are fixed-capacity arenas indexed `seq % capacity`, so the
//! packet path never allocates and lookup by sequence number is O(1).
//! Sequence numbers start at 1; slot occupancy is bounded by the
//! advertised window, which is strictly smaller than the ring.

use bytes::Bytes;

use crate::error::{Result, SkeinError};
use crate::packet::{PacketFlags, Seq, SeqRange};

/// One transmit slot: the payload is retained until the peer acknowledges
/// it, so retransmission reads straight from the ring.
#[derive(Debug, Clone)]
pub struct TxSlot {
    pub payload: Bytes,
    pub flags: PacketFlags,
}

/// Outcome of placing one inbound DATA packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxOutcome {
    /// Stored, possibly out of order.
    Accepted,
    /// Below the low-water mark or already held; dropped.
    Duplicate,
    /// Beyond the advertised window top; dropped.
    OutOfWindow,
}

/// Transmit side: assigns sequence numbers and holds unacknowledged
/// payloads until they rotate out.
#[derive(Debug)]
pub struct TxRing {
    slots: Vec<Option<TxSlot>>,
    mask: usize,
    window: usize,
    /// Next sequence number to assign.
    next_seq: Seq,
    /// Lowest sequence number not yet acknowledged.
    lowest_unacked: Seq,
}

impl TxRing {
    /// `capacity` must be a power of two greater than `window`
    /// (enforced by [`crate::config::Config::validate`]).
    pub fn new(capacity: usize, window: usize) -> Self {
        debug_assert!(capacity.is_power_of_two() && window < capacity);
        Self {
            slots: vec![None; capacity],
            mask: capacity - 1,
            window,
            next_seq: 1,
            lowest_unacked: 1,
        }
    }

    fn index(&self, seq: Seq) -> usize {
        seq as usize & self.mask
    }

    /// Packets sent but not yet acknowledged.
    pub fn in_flight(&self) -> usize {
        (self.next_seq - self.lowest_unacked) as usize
    }

    /// True once every transmitted packet has been acknowledged.
    pub fn is_drained(&self) -> bool {
        self.lowest_unacked == self.next_seq
    }

    /// Highest sequence number assigned so far (0 if none).
    pub fn top(&self) -> Seq {
        self.next_seq - 1
    }

    /// Store a payload and assign it the next sequence number.
    ///
    /// Fails with `WindowFull` when the unacknowledged count already
    /// equals the window; the caller retries after the peer's ACK
    /// advances the ring.
    pub fn submit(&mut self, payload: Bytes, flags: PacketFlags) -> Result<Seq> {
        let in_flight = self.in_flight();
        if in_flight >= self.window {
            return Err(SkeinError::WindowFull { in_flight });
        }

        let seq = self.next_seq;
        let idx = self.index(seq);
        debug_assert!(self.slots[idx].is_none());
        self.slots[idx] = Some(TxSlot { payload, flags });
        self.next_seq += 1;
        Ok(seq)
    }

    /// Retire every slot up to and including `to`, releasing capacity.
    ///
    /// Returns the retired sequence numbers. Re-acknowledging an already
    /// rotated range retires nothing.
    pub fn rotate(&mut self, to: Seq) -> Vec<Seq> {
        let top = std::cmp::min(to, self.top());
        let mut retired = Vec::new();
        while self.lowest_unacked <= top {
            let idx = self.index(self.lowest_unacked);
            if self.slots[idx].take().is_some() {
                retired.push(self.lowest_unacked);
            }
            self.lowest_unacked += 1;
        }
        retired
    }

    /// Fetch an unacknowledged slot for retransmission.
    pub fn slot(&self, seq: Seq) -> Option<&TxSlot> {
        if seq < self.lowest_unacked || seq >= self.next_seq {
            return None;
        }
        self.slots[self.index(seq)].as_ref()
    }

    /// Drop everything, releasing all slots. Used on abort.
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.lowest_unacked = self.next_seq;
    }
}

#[derive(Debug, Clone)]
struct RxSlot {
    payload: Bytes,
    is_last: bool,
}

/// Receive side: accepts packets out of order within the window and
/// yields them strictly in sequence.
#[derive(Debug)]
pub struct RxRing {
    slots: Vec<Option<RxSlot>>,
    mask: usize,
    window: usize,
    /// Lowest unconsumed sequence number; the window extends from here.
    next_consume: Seq,
}

impl RxRing {
    pub fn new(capacity: usize, window: usize) -> Self {
        debug_assert!(capacity.is_power_of_two() && window < capacity);
        Self {
            slots: vec![None; capacity],
            mask: capacity - 1,
            window,
            next_consume: 1,
        }
    }

    fn index(&self, seq: Seq) -> usize {
        seq as usize & self.mask
    }

    /// Place one inbound packet.
    pub fn receive(&mut self, seq: Seq, payload: Bytes, is_last: bool) -> RxOutcome {
        if seq < self.next_consume {
            return RxOutcome::Duplicate;
        }
        if seq >= self.next_consume + self.window as Seq {
            return RxOutcome::OutOfWindow;
        }
        let idx = self.index(seq);
        if self.slots[idx].is_some() {
            return RxOutcome::Duplicate;
        }
        self.slots[idx] = Some(RxSlot { payload, is_last });
        RxOutcome::Accepted
    }

    /// Pop the next in-order payload, never skipping a hole.
    pub fn consume(&mut self) -> Option<(Seq, Bytes, bool)> {
        let idx = self.index(self.next_consume);
        let slot = self.slots[idx].take()?;
        let seq = self.next_consume;
        self.next_consume += 1;
        Some((seq, slot.payload, slot.is_last))
    }

    /// Lowest unconsumed sequence number.
    pub fn next_expected(&self) -> Seq {
        self.next_consume
    }

    /// Highest sequence number such that everything at or below it has
    /// been received (0 if nothing has).
    pub fn cumulative(&self) -> Seq {
        let mut seq = self.next_consume;
        while seq < self.next_consume + self.window as Seq {
            if self.slots[self.index(seq)].is_none() {
                break;
            }
            seq += 1;
        }
        seq - 1
    }

    /// True if a received packet is stranded behind a missing one.
    pub fn has_hole(&self) -> bool {
        let cumulative = self.cumulative();
        let top = self.next_consume + self.window as Seq;
        ((cumulative + 1)..top).any(|seq| self.slots[self.index(seq)].is_some())
    }

    /// Ranges received out of order beyond the cumulative mark, for the
    /// selective portion of an ACK.
    pub fn sack_ranges(&self) -> Vec<SeqRange> {
        let mut ranges = Vec::new();
        let mut run: Option<SeqRange> = None;
        let top = self.next_consume + self.window as Seq;
        for seq in (self.cumulative() + 1)..top {
            if self.slots[self.index(seq)].is_some() {
                match &mut run {
                    Some(r) if r.end + 1 == seq => r.end = seq,
                    Some(r) => {
                        ranges.push(*r);
                        *r = SeqRange { start: seq, end: seq };
                    }
                    None => run = Some(SeqRange { start: seq, end: seq }),
                }
            }
        }
        if let Some(r) = run {
            ranges.push(r);
        }
        ranges
    }

    /// Drop everything. Used on abort.
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(n: u8) -> Bytes {
        Bytes::from(vec![n])
    }

    #[test]
    fn submit_assigns_increasing_seqs() {
        let mut tx = TxRing::new(8, 4);
        for expect in 1..=4u32 {
            let seq = tx.submit(payload(0), PacketFlags::NONE).unwrap();
            assert_eq!(seq, expect);
        }
    }

    #[test]
    fn submit_blocks_at_window() {
        let mut tx = TxRing::new(8, 4);
        for _ in 0..4 {
            tx.submit(payload(0), PacketFlags::NONE).unwrap();
        }
        assert!(matches!(
            tx.submit(payload(0), PacketFlags::NONE),
            Err(SkeinError::WindowFull { in_flight: 4 })
        ));

        // Acknowledging one packet frees exactly one slot.
        assert_eq!(tx.rotate(1), vec![1]);
        tx.submit(payload(0), PacketFlags::NONE).unwrap();
    }

    #[test]
    fn rotate_is_idempotent() {
        let mut tx = TxRing::new(8, 4);
        for _ in 0..3 {
            tx.submit(payload(0), PacketFlags::NONE).unwrap();
        }
        assert_eq!(tx.rotate(2), vec![1, 2]);
        assert!(tx.rotate(2).is_empty());
        assert_eq!(tx.in_flight(), 1);
    }

    #[test]
    fn slot_lookup_only_covers_unacked() {
        let mut tx = TxRing::new(8, 4);
        tx.submit(payload(1), PacketFlags::NONE).unwrap();
        tx.submit(payload(2), PacketFlags::NONE).unwrap();
        tx.rotate(1);
        assert!(tx.slot(1).is_none());
        assert!(tx.slot(2).is_some());
        assert!(tx.slot(3).is_none());
    }

    #[test]
    fn rx_out_of_order_consume_in_order() {
        let mut rx = RxRing::new(8, 4);
        // Arrival order 1, 3, 4, 2.
        assert_eq!(rx.receive(1, payload(1), false), RxOutcome::Accepted);
        assert_eq!(rx.receive(3, payload(3), false), RxOutcome::Accepted);
        assert_eq!(rx.receive(4, payload(4), false), RxOutcome::Accepted);

        assert_eq!(rx.consume().unwrap().0, 1);
        assert!(rx.consume().is_none()); // hole at 2

        assert_eq!(rx.receive(2, payload(2), false), RxOutcome::Accepted);
        assert_eq!(rx.consume().unwrap().0, 2);
        assert_eq!(rx.consume().unwrap().0, 3);
        assert_eq!(rx.consume().unwrap().0, 4);
        assert!(rx.consume().is_none());
    }

    #[test]
    fn rx_duplicate_and_window() {
        let mut rx = RxRing::new(8, 4);
        assert_eq!(rx.receive(1, payload(1), false), RxOutcome::Accepted);
        assert_eq!(rx.receive(1, payload(1), false), RxOutcome::Duplicate);
        // Window is 1..=4 while nothing is consumed.
        assert_eq!(rx.receive(5, payload(5), false), RxOutcome::OutOfWindow);
        rx.consume().unwrap();
        // Consuming seq 1 slides the window to 2..=5.
        assert_eq!(rx.receive(5, payload(5), false), RxOutcome::Accepted);
        // And a packet below the low-water mark is a duplicate.
        assert_eq!(rx.receive(1, payload(1), false), RxOutcome::Duplicate);
    }

    #[test]
    fn cumulative_and_sack() {
        let mut rx = RxRing::new(16, 8);
        rx.receive(1, payload(1), false);
        rx.receive(2, payload(2), false);
        rx.receive(4, payload(4), false);
        rx.receive(5, payload(5), false);
        rx.receive(7, payload(7), false);

        assert_eq!(rx.cumulative(), 2);
        assert!(rx.has_hole());
        assert_eq!(
            rx.sack_ranges(),
            vec![SeqRange { start: 4, end: 5 }, SeqRange { start: 7, end: 7 }]
        );

        rx.receive(3, payload(3), false);
        assert_eq!(rx.cumulative(), 5);
        assert_eq!(rx.sack_ranges(), vec![SeqRange { start: 7, end: 7 }]);
    }

    #[test]
    fn wraparound_past_ring_capacity() {
        let mut tx = TxRing::new(8, 4);
        let mut rx = RxRing::new(8, 4);
        for round in 0..10u32 {
            let seq = tx.submit(payload(round as u8), PacketFlags::NONE).unwrap();
            assert_eq!(seq, round + 1);
            assert_eq!(rx.receive(seq, payload(round as u8), false), RxOutcome::Accepted);
            assert_eq!(rx.consume().unwrap().0, seq);
            tx.rotate(seq);
        }
        assert!(tx.is_drained());
    }
}
