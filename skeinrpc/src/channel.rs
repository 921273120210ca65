//! Channel state machine.
//!
//! A connection carries a small fixed number of channels; each channel
//! hosts at most one live call plus one parked successor. Channels number
//! their calls so that a trailing retransmission from a finished call can
//! never be mistaken for traffic of its successor, and a successor is
//! only activated once the previous call's transmit ring has fully
//! drained, because the new call reuses the same sequence space.

use tracing::{debug, trace};

use crate::call::{Call, CallState};
use crate::error::{Result, SkeinError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Never carried a call.
    Unstarted,
    /// A call is live.
    Active,
    /// A call is live and a successor is parked behind it.
    Waiting,
    /// Between calls; immediately reusable.
    Idle,
    /// Torn down by the idle culler.
    Culled,
    /// Connection shut down; terminal.
    Inactive,
}

impl ChannelState {
    pub fn name(self) -> &'static str {
        match self {
            ChannelState::Unstarted => "unstarted",
            ChannelState::Active => "active",
            ChannelState::Waiting => "waiting",
            ChannelState::Idle => "idle",
            ChannelState::Culled => "culled",
            ChannelState::Inactive => "inactive",
        }
    }
}

/// The live call bound to a channel, tagged with the caller's handle id
/// and the channel-local call number.
#[derive(Debug)]
pub struct CallSlot {
    pub user_id: u64,
    pub call_number: u32,
    pub call: Call,
}

#[derive(Debug)]
struct Parked {
    user_id: u64,
    call: Call,
}

/// What `try_release` did, reported so the owner can notify callers.
#[derive(Debug)]
pub struct Released {
    /// The channel the release happened on.
    pub channel: u8,
    /// The finished call's handle id and final state.
    pub retired: (u64, CallState),
    /// A parked successor that just went live, with its call number.
    pub promoted: Option<(u64, u32)>,
}

pub struct Channel {
    index: u8,
    state: ChannelState,
    next_call_number: u32,
    current: Option<CallSlot>,
    waiting: Option<Parked>,
}

impl Channel {
    pub fn new(index: u8) -> Self {
        Self {
            index,
            state: ChannelState::Unstarted,
            next_call_number: 1,
            current: None,
            waiting: None,
        }
    }

    pub fn index(&self) -> u8 {
        self.index
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// True if a new call can go live here right now.
    pub fn can_accept(&self) -> bool {
        matches!(self.state, ChannelState::Unstarted | ChannelState::Idle)
    }

    /// True if a successor can be parked behind the live call.
    pub fn can_park(&self) -> bool {
        self.state == ChannelState::Active && self.waiting.is_none()
    }

    /// Bind a call, making the channel active. Each binding consumes the
    /// next call number.
    pub fn bind(&mut self, user_id: u64, call: Call) -> Result<u32> {
        if !self.can_accept() {
            return Err(SkeinError::ChannelStateViolation {
                index: self.index,
                state: self.state.name(),
            });
        }
        let call_number = self.next_call_number;
        self.next_call_number += 1;
        self.current = Some(CallSlot {
            user_id,
            call_number,
            call,
        });
        self.state = ChannelState::Active;
        trace!(channel = self.index, call_number, "call bound");
        Ok(call_number)
    }

    /// The number the next binding will take.
    pub fn next_call_number(&self) -> u32 {
        self.next_call_number
    }

    /// Bind an inbound call under the peer's numbering. The local counter
    /// jumps to the adopted number first, so the binding answers to the
    /// peer's packets and no later binding can reuse it.
    pub fn adopt(&mut self, user_id: u64, call_number: u32, call: Call) -> Result<u32> {
        if !self.can_accept() {
            return Err(SkeinError::ChannelStateViolation {
                index: self.index,
                state: self.state.name(),
            });
        }
        self.next_call_number = self.next_call_number.max(call_number);
        self.bind(user_id, call)
    }

    /// Park a successor behind the live call.
    pub fn park(&mut self, user_id: u64, call: Call) -> Result<()> {
        if !self.can_park() {
            return Err(SkeinError::ChannelStateViolation {
                index: self.index,
                state: self.state.name(),
            });
        }
        self.waiting = Some(Parked { user_id, call });
        self.state = ChannelState::Waiting;
        trace!(channel = self.index, "successor parked");
        Ok(())
    }

    pub fn current_mut(&mut self) -> Option<&mut CallSlot> {
        self.current.as_mut()
    }

    pub fn current(&self) -> Option<&CallSlot> {
        self.current.as_ref()
    }

    /// Retire the live call if it is finished and its transmit ring has
    /// drained, promoting a parked successor when one exists.
    ///
    /// The drain check is the reuse gate: a successor started before the
    /// predecessor's packets were all acknowledged could collide with
    /// them in the shared sequence space.
    pub fn try_release(&mut self) -> Option<Released> {
        let slot = self.current.as_ref()?;
        let done = match slot.call.state() {
            CallState::InProgress => false,
            CallState::Complete => slot.call.is_drained(),
            CallState::Aborted(_) => true,
        };
        if !done {
            return None;
        }

        let slot = self.current.take().expect("checked above");
        let retired = (slot.user_id, slot.call.state());
        debug!(
            channel = self.index,
            call_number = slot.call_number,
            state = ?slot.call.state(),
            "call retired"
        );

        let promoted = match self.waiting.take() {
            Some(parked) => {
                self.state = ChannelState::Idle;
                let call_number = self
                    .bind(parked.user_id, parked.call)
                    .expect("idle channel accepts");
                Some((parked.user_id, call_number))
            }
            None => {
                self.state = ChannelState::Idle;
                None
            }
        };

        Some(Released {
            channel: self.index,
            retired,
            promoted,
        })
    }

    /// Abort whatever lives here and collect the affected handle ids.
    /// Used on connection teardown.
    pub fn shutdown(&mut self, code: u32, victims: &mut Vec<(u64, CallState)>) {
        if let Some(mut slot) = self.current.take() {
            slot.call.abort(code);
            victims.push((slot.user_id, slot.call.state()));
        }
        if let Some(parked) = self.waiting.take() {
            victims.push((parked.user_id, CallState::Aborted(code)));
        }
        self.state = ChannelState::Inactive;
    }

    /// Mark an idle channel as culled. Only meaningful without a call.
    pub fn cull(&mut self) {
        debug_assert!(self.current.is_none() && self.waiting.is_none());
        self.state = ChannelState::Culled;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::Direction;
    use crate::config::Config;
    use crate::packet::{AckReason, PacketFlags, ABORT_CONN_DEAD};
    use bytes::Bytes;
    use std::time::Instant;

    fn call() -> Call {
        Call::new(&Config::default(), Direction::Client)
    }

    #[test]
    fn bind_assigns_increasing_call_numbers() {
        let mut ch = Channel::new(0);
        assert_eq!(ch.bind(1, call()).unwrap(), 1);
        assert_eq!(ch.state(), ChannelState::Active);

        // Finish the call without traffic: abort retires it instantly.
        ch.current_mut().unwrap().call.abort(1);
        let released = ch.try_release().unwrap();
        assert_eq!(released.retired.0, 1);
        assert!(released.promoted.is_none());
        assert_eq!(ch.state(), ChannelState::Idle);

        assert_eq!(ch.bind(2, call()).unwrap(), 2);
    }

    #[test]
    fn adopt_advances_past_the_peers_number() {
        let mut ch = Channel::new(0);
        assert_eq!(ch.adopt(1, 5, call()).unwrap(), 5);

        // The counter moved past the adopted number, so the successor
        // cannot collide with the peer's numbering.
        ch.current_mut().unwrap().call.abort(9);
        ch.try_release().unwrap();
        assert_eq!(ch.bind(2, call()).unwrap(), 6);
    }

    #[test]
    fn bind_on_active_channel_is_a_state_violation() {
        let mut ch = Channel::new(3);
        ch.bind(1, call()).unwrap();
        match ch.bind(2, call()) {
            Err(SkeinError::ChannelStateViolation { index: 3, state }) => {
                assert_eq!(state, "active")
            }
            other => panic!("expected violation, got {other:?}"),
        }
    }

    #[test]
    fn successor_waits_for_predecessor_drain() {
        let mut ch = Channel::new(0);
        let now = Instant::now();
        ch.bind(1, call()).unwrap();
        ch.park(2, call()).unwrap();
        assert_eq!(ch.state(), ChannelState::Waiting);
        assert!(!ch.can_park());

        // Predecessor finishes its exchange but still has an unacked
        // packet in flight: no promotion yet.
        {
            let slot = ch.current_mut().unwrap();
            slot.call.send(Bytes::from_static(b"x"), true, now).unwrap();
            slot.call
                .on_data(1, PacketFlags::LAST_PACKET, Bytes::from_static(b"y"), now);
            slot.call.consume(now).unwrap();
        }
        assert!(ch.try_release().is_none());

        // The ACK drains the ring; now the waiter goes live with the
        // next call number.
        ch.current_mut()
            .unwrap()
            .call
            .on_ack(AckReason::Requested, 1, 0, &[], now);
        let released = ch.try_release().unwrap();
        assert_eq!(released.retired, (1, CallState::Complete));
        assert_eq!(released.promoted, Some((2, 2)));
        assert_eq!(ch.state(), ChannelState::Active);
        assert_eq!(ch.current().unwrap().user_id, 2);
    }

    #[test]
    fn shutdown_aborts_live_and_parked() {
        let mut ch = Channel::new(0);
        ch.bind(1, call()).unwrap();
        ch.park(2, call()).unwrap();

        let mut victims = Vec::new();
        ch.shutdown(ABORT_CONN_DEAD, &mut victims);
        assert_eq!(ch.state(), ChannelState::Inactive);
        assert_eq!(victims.len(), 2);
        assert!(victims
            .iter()
            .all(|(_, s)| matches!(s, CallState::Aborted(ABORT_CONN_DEAD))));
        assert!(!ch.can_accept());
    }
}
