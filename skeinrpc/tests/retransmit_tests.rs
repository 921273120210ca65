//! Retransmission and RTT behavior observed at the call level.

use std::time::{Duration, Instant};

use bytes::Bytes;
use skeinrpc::call::{Call, CallState, Direction};
use skeinrpc::packet::{AckReason, Packet, ABORT_TIMEOUT};
use skeinrpc::Config;

fn sender(cfg: &Config) -> Call {
    Call::new(cfg, Direction::Client)
}

fn data_seqs(out: &[Packet]) -> Vec<u32> {
    out.iter()
        .filter_map(|p| match p {
            Packet::Data { seq, .. } => Some(*seq),
            _ => None,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Backoff and exhaustion
// ---------------------------------------------------------------------------

#[test]
fn resend_backs_off_exponentially_then_aborts() {
    let cfg = Config::default();
    let mut call = sender(&cfg);
    let t0 = Instant::now();
    call.send(Bytes::from_static(b"p"), false, t0).unwrap();
    call.poll(t0);

    // 4s, then 8s, 16s, 32s, 60s (capped) between attempts.
    let mut t = t0;
    let mut gaps = Vec::new();
    for _ in 0..5 {
        let deadline = call.next_deadline().expect("timer armed");
        gaps.push(deadline - t);
        t = deadline;
        assert_eq!(data_seqs(&call.poll(t)), vec![1]);
    }
    assert_eq!(
        gaps,
        vec![
            Duration::from_secs(4),
            Duration::from_secs(8),
            Duration::from_secs(16),
            Duration::from_secs(32),
            Duration::from_secs(60),
        ]
    );

    // The sixth expiry exceeds the five-attempt budget.
    let deadline = call.next_deadline().unwrap();
    let out = call.poll(deadline);
    assert!(out
        .iter()
        .any(|p| matches!(p, Packet::Abort { code: ABORT_TIMEOUT })));
    assert_eq!(call.state(), CallState::Aborted(ABORT_TIMEOUT));
    assert!(call.next_deadline().is_none());
}

#[test]
fn ack_before_deadline_cancels_the_timer() {
    let cfg = Config::default();
    let mut call = sender(&cfg);
    let t0 = Instant::now();
    call.send(Bytes::from_static(b"p"), true, t0).unwrap();
    call.poll(t0);

    call.on_ack(AckReason::Requested, 1, 0, &[], t0 + Duration::from_millis(10));
    assert!(call.is_drained());
    assert!(data_seqs(&call.poll(t0 + Duration::from_secs(10))).is_empty());
}

// ---------------------------------------------------------------------------
// RTT sampling
// ---------------------------------------------------------------------------

#[test]
fn prompt_ack_seeds_the_estimator() {
    let cfg = Config::default();
    let mut call = sender(&cfg);
    let t0 = Instant::now();
    call.send(Bytes::from_static(b"p"), true, t0).unwrap();
    call.poll(t0);

    call.on_ack(AckReason::Requested, 1, 0, &[], t0 + Duration::from_millis(100));
    assert_eq!(call.rtt().srtt(), Some(Duration::from_millis(100)));
    // First sample: RTO = 100ms + 4 * 50ms.
    assert_eq!(call.rtt().rto(), Duration::from_millis(300));
}

#[test]
fn retransmitted_packet_never_samples() {
    let cfg = Config::default();
    let mut call = sender(&cfg);
    let t0 = Instant::now();
    call.send(Bytes::from_static(b"p"), true, t0).unwrap();
    call.poll(t0);

    // Let the timer fire once, then ack: the ACK is ambiguous between
    // the two transmissions and must not feed the estimator.
    let deadline = call.next_deadline().unwrap();
    assert_eq!(data_seqs(&call.poll(deadline)), vec![1]);
    call.on_ack(AckReason::Requested, 1, 0, &[], deadline + Duration::from_millis(50));

    assert!(call.rtt().srtt().is_none());
    assert_eq!(call.rtt().rto(), Duration::from_secs(4));
    assert!(call.is_drained());
}

#[test]
fn new_rto_applies_to_subsequent_sends() {
    let cfg = Config::default();
    let mut call = sender(&cfg);
    let t0 = Instant::now();
    call.send(Bytes::from_static(b"a"), false, t0).unwrap();
    call.poll(t0);
    // The burst opener asks for a prompt ack; the 40ms answer seeds the
    // estimator.
    call.on_ack(AckReason::Requested, 1, 0, &[], t0 + Duration::from_millis(40));
    assert_eq!(call.rtt().srtt(), Some(Duration::from_millis(40)));

    // The next send arms its timer with the derived RTO, not the base
    // 4s timeout.
    let t1 = t0 + Duration::from_millis(50);
    call.send(Bytes::from_static(b"b"), false, t1).unwrap();
    call.poll(t1);
    let deadline = call.next_deadline().unwrap();
    assert!(deadline < t1 + Duration::from_secs(1), "rto should have shrunk");
    assert_eq!(deadline, t1 + call.rtt().rto());
}
