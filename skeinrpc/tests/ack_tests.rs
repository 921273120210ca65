//! ACK coalescing behavior observed at the call level.

use std::time::{Duration, Instant};

use bytes::Bytes;
use skeinrpc::call::{Call, Direction};
use skeinrpc::packet::{AckReason, Packet, PacketFlags};
use skeinrpc::Config;

fn receiver() -> Call {
    Call::new(&Config::default(), Direction::Service)
}

fn acks(out: &[Packet]) -> Vec<(AckReason, u32)> {
    out.iter()
        .filter_map(|p| match p {
            Packet::Ack { reason, ack_seq, .. } => Some((*reason, *ack_seq)),
            _ => None,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// One ACK per decision
// ---------------------------------------------------------------------------

#[test]
fn coalesced_events_produce_one_ack_with_top_reason() {
    let mut call = receiver();
    let now = Instant::now();

    // Fresh data arms a soft delay; the duplicate escalates to an
    // immediate ACK. Only one packet leaves, stamped with the winner.
    call.on_data(1, PacketFlags::NONE, Bytes::from_static(b"a"), now);
    call.on_data(1, PacketFlags::NONE, Bytes::from_static(b"a"), now);

    let out = call.poll(now);
    assert_eq!(acks(&out), vec![(AckReason::Duplicate, 1)]);

    // The decision is consumed: nothing further fires later.
    assert!(acks(&call.poll(now + Duration::from_secs(5))).is_empty());
}

#[test]
fn requested_ack_fires_after_its_short_delay() {
    let mut call = receiver();
    let now = Instant::now();

    call.on_data(1, PacketFlags::REQUEST_ACK, Bytes::from_static(b"a"), now);
    assert!(acks(&call.poll(now)).is_empty());

    let out = call.poll(now + Duration::from_millis(1));
    assert_eq!(acks(&out), vec![(AckReason::Requested, 1)]);
}

#[test]
fn idle_ack_follows_consumption() {
    let mut call = receiver();
    let now = Instant::now();

    call.on_data(1, PacketFlags::NONE, Bytes::from_static(b"a"), now);
    call.consume(now).unwrap();

    // The idle deadline (500ms) beats the soft delay (1s) and the idle
    // reason outranks the delayed-data one.
    assert!(acks(&call.poll(now + Duration::from_millis(499))).is_empty());
    let out = call.poll(now + Duration::from_millis(500));
    assert_eq!(acks(&out), vec![(AckReason::Idle, 1)]);
}

// ---------------------------------------------------------------------------
// Selective ranges
// ---------------------------------------------------------------------------

#[test]
fn ack_reports_cumulative_and_sack_ranges() {
    let mut call = receiver();
    let now = Instant::now();

    call.on_data(1, PacketFlags::NONE, Bytes::from_static(b"a"), now);
    call.on_data(3, PacketFlags::NONE, Bytes::from_static(b"c"), now);
    call.on_data(4, PacketFlags::NONE, Bytes::from_static(b"d"), now);

    let out = call.poll(now + Duration::from_secs(1));
    let ack = out
        .iter()
        .find_map(|p| match p {
            Packet::Ack {
                reason,
                ack_seq,
                ranges,
                ..
            } => Some((*reason, *ack_seq, ranges.clone())),
            _ => None,
        })
        .expect("one ack due");

    // Data landed beyond a hole, so the out-of-sequence reason wins.
    assert_eq!(ack.0, AckReason::OutOfSequence);
    assert_eq!(ack.1, 1);
    assert_eq!(ack.2.len(), 1);
    assert_eq!((ack.2[0].start, ack.2[0].end), (3, 4));
}

#[test]
fn sack_cancels_only_the_named_timers() {
    let cfg = Config::default();
    let mut sender = Call::new(&cfg, Direction::Client);
    let now = Instant::now();

    for i in 0..5u8 {
        sender.send(Bytes::from(vec![i]), false, now).unwrap();
    }
    sender.poll(now);

    // Selective ack for 3..=4 with nothing cumulative: 1, 2 and 5 still
    // retransmit at the original deadline.
    sender.on_ack(
        AckReason::OutOfSequence,
        0,
        0,
        &[skeinrpc::SeqRange { start: 3, end: 4 }],
        now,
    );
    let out = sender.poll(now + Duration::from_secs(4));
    let resent: Vec<u32> = out
        .iter()
        .filter_map(|p| match p {
            Packet::Data { seq, .. } => Some(*seq),
            _ => None,
        })
        .collect();
    assert_eq!(resent, vec![1, 2, 5]);
}
