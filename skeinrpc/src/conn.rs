//! A connection: one peer, one security context, four call channels.
//!
//! The connection routes classified packets to the owning channel and
//! call, polls every live call for outbound traffic, and tracks when it
//! goes fully idle so the client pool can schedule it for culling. All
//! of this happens under one lock held by the endpoint, which makes the
//! connection the serialization domain for its calls.

use std::net::SocketAddr;
use std::time::Instant;

use tracing::{debug, trace, warn};

use crate::call::{Call, CallState, Direction};
use crate::channel::{Channel, Released};
use crate::config::Config;
use crate::error::{Result, SkeinError};
use crate::packet::{Header, Packet, ABORT_CONN_DEAD};

/// How an outbound call was placed on this connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Bound to a free channel and live immediately.
    Bound { channel: u8, call_number: u32 },
    /// Parked behind a live call; goes live when that call drains.
    Parked { channel: u8 },
}

/// Where an inbound packet ended up.
#[derive(Debug, PartialEq, Eq)]
pub enum Dispatch {
    Handled,
    /// First DATA of a call we have not accepted yet; the endpoint
    /// decides whether to admit it or answer BUSY.
    NewCall { channel: u8 },
    /// Stale, unroutable or not call-addressed; nothing to do.
    Dropped,
}

/// One poll round's output.
#[derive(Debug, Default)]
pub struct ConnPoll {
    pub packets: Vec<(Header, Packet)>,
    pub released: Vec<Released>,
}

pub struct Connection {
    conn_id: u32,
    peer: SocketAddr,
    direction: Direction,
    channels: Vec<Channel>,
    /// Set when the last call retired; cleared by any new binding.
    idle_since: Option<Instant>,
    /// Connection-level replies awaiting the next poll.
    staged: Vec<(Header, Packet)>,
    closed: bool,
}

impl Connection {
    pub fn new(conn_id: u32, peer: SocketAddr, direction: Direction, cfg: &Config) -> Self {
        Self {
            conn_id,
            peer,
            direction,
            channels: (0..cfg.max_channels as u8).map(Channel::new).collect(),
            idle_since: None,
            staged: Vec::new(),
            closed: false,
        }
    }

    pub fn conn_id(&self) -> u32 {
        self.conn_id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// True if `admit` would succeed without queueing at the pool.
    pub fn has_room(&self) -> bool {
        !self.closed && self.channels.iter().any(|c| c.can_accept() || c.can_park())
    }

    /// True if a channel is free for an immediately live call.
    pub fn channels_accepting(&self) -> bool {
        !self.closed && self.channels.iter().any(|c| c.can_accept())
    }

    /// Place an outbound call: a reusable channel first, then a parking
    /// slot behind a live call, else the caller queues at the pool.
    pub fn admit(&mut self, user_id: u64, cfg: &Config) -> Result<Admission> {
        if self.closed {
            return Err(SkeinError::ConnectionClosed);
        }

        if let Some(ch) = self.channels.iter_mut().find(|c| c.can_accept()) {
            let channel = ch.index();
            let call_number = ch.bind(user_id, Call::new(cfg, self.direction))?;
            self.idle_since = None;
            return Ok(Admission::Bound {
                channel,
                call_number,
            });
        }

        if let Some(ch) = self.channels.iter_mut().find(|c| c.can_park()) {
            let channel = ch.index();
            ch.park(user_id, Call::new(cfg, self.direction))?;
            return Ok(Admission::Parked { channel });
        }

        Err(SkeinError::NoChannelFree)
    }

    /// Bind a service-side call for an inbound `NewCall` the endpoint
    /// chose to accept, adopting the call number the peer used so its
    /// packets route to the new call.
    pub fn accept_inbound(
        &mut self,
        channel: u8,
        call_number: u32,
        user_id: u64,
        cfg: &Config,
    ) -> Result<u32> {
        if self.closed {
            return Err(SkeinError::ConnectionClosed);
        }
        let ch = self
            .channels
            .get_mut(channel as usize)
            .ok_or(SkeinError::UnknownCall)?;
        let bound = ch.adopt(user_id, call_number, Call::new(cfg, Direction::Service))?;
        self.idle_since = None;
        Ok(bound)
    }

    /// Access a live call by its channel and call number.
    pub fn call_mut(&mut self, channel: u8, call_number: u32) -> Option<&mut Call> {
        let slot = self.channels.get_mut(channel as usize)?.current_mut()?;
        (slot.call_number == call_number).then_some(&mut slot.call)
    }

    /// Route one classified packet.
    pub fn dispatch(&mut self, header: &Header, packet: Packet, now: Instant) -> Dispatch {
        if self.closed {
            return Dispatch::Dropped;
        }

        // Connection-level packets are not addressed to a call.
        match packet {
            Packet::Challenge { nonce } => {
                // Security handshake seam: echo the nonce back.
                self.staged.push((
                    Header {
                        conn_id: self.conn_id,
                        channel: 0,
                        call_number: 0,
                    },
                    Packet::Response { nonce },
                ));
                return Dispatch::Handled;
            }
            Packet::Response { .. } | Packet::Debug { .. } | Packet::Version { .. } => {
                trace!(conn = self.conn_id, ty = ?packet.packet_type(), "connection-level packet ignored");
                return Dispatch::Dropped;
            }
            _ => {}
        }

        let Some(ch) = self.channels.get_mut(header.channel as usize) else {
            warn!(conn = self.conn_id, channel = header.channel, "channel out of range");
            return Dispatch::Dropped;
        };

        let current_number = ch.current().map(|slot| slot.call_number);
        match current_number {
            Some(n) if n == header.call_number => {}
            Some(n) if header.call_number < n => {
                // Trailing retransmission from a finished call.
                trace!(
                    conn = self.conn_id,
                    channel = header.channel,
                    call_number = header.call_number,
                    "stale call traffic dropped"
                );
                return Dispatch::Dropped;
            }
            _ => {
                // No live call, or the peer has moved on to a new one. A
                // number below the channel counter is a retransmission
                // from a retired call, never the start of a fresh one.
                if self.direction == Direction::Service
                    && matches!(packet, Packet::Data { .. })
                    && ch.can_accept()
                    && header.call_number >= ch.next_call_number()
                {
                    return Dispatch::NewCall {
                        channel: header.channel,
                    };
                }
                trace!(
                    conn = self.conn_id,
                    channel = header.channel,
                    call_number = header.call_number,
                    "unroutable call traffic dropped"
                );
                return Dispatch::Dropped;
            }
        }

        let slot = ch.current_mut().expect("matched call number");
        match packet {
            Packet::Data {
                seq,
                flags,
                payload,
            } => slot.call.on_data(seq, flags, payload, now),
            Packet::Ack {
                reason,
                ack_seq,
                ping_id,
                ranges,
            } => slot.call.on_ack(reason, ack_seq, ping_id, &ranges, now),
            Packet::AckAll => slot.call.on_ack_all(),
            Packet::Abort { code } => slot.call.on_abort(code),
            Packet::Busy => {
                debug!(conn = self.conn_id, channel = header.channel, "peer is busy");
                slot.call.on_abort(ABORT_CONN_DEAD);
            }
            Packet::Jumbo { .. } => {
                // The classifier splits jumbos before dispatch.
                debug_assert!(false, "jumbo reached dispatch");
            }
            _ => unreachable!("connection-level packets handled above"),
        }
        Dispatch::Handled
    }

    /// Drive every live call, retire finished ones, and surface outbound
    /// traffic stamped with its routing header.
    pub fn poll(&mut self, now: Instant) -> ConnPoll {
        let mut out = ConnPoll {
            packets: std::mem::take(&mut self.staged),
            released: Vec::new(),
        };
        if self.closed {
            return out;
        }

        for ch in &mut self.channels {
            let channel = ch.index();
            if let Some(slot) = ch.current_mut() {
                let header = Header {
                    conn_id: self.conn_id,
                    channel,
                    call_number: slot.call_number,
                };
                for packet in slot.call.poll(now) {
                    out.packets.push((header, packet));
                }
            }
            if let Some(released) = ch.try_release() {
                out.released.push(released);
            }
        }

        if self.idle_since.is_none() && self.is_idle() {
            self.idle_since = Some(now);
            debug!(conn = self.conn_id, "connection idle");
        }

        out
    }

    /// The earliest instant any live call needs another poll.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.channels
            .iter()
            .filter_map(|ch| ch.current().and_then(|slot| slot.call.next_deadline()))
            .min()
    }

    /// True when no channel carries or queues a call.
    pub fn is_idle(&self) -> bool {
        !self.closed
            && self.channels.iter().all(|ch| {
                ch.current().is_none()
                    && matches!(
                        ch.state(),
                        crate::channel::ChannelState::Unstarted
                            | crate::channel::ChannelState::Idle
                    )
            })
    }

    /// When the connection last went fully idle, if it still is.
    pub fn idle_since(&self) -> Option<Instant> {
        self.idle_since
    }

    /// Tear down every call and mark the connection dead. Returns the
    /// affected handle ids with their final states.
    pub fn close(&mut self, code: u32) -> Vec<(u64, CallState)> {
        if self.closed {
            return Vec::new();
        }
        debug!(conn = self.conn_id, code, "connection closing");
        let mut victims = Vec::new();
        for ch in &mut self.channels {
            ch.shutdown(code, &mut victims);
        }
        self.closed = true;
        victims
    }

    /// Mark an idle connection culled.
    pub fn cull(&mut self) {
        debug_assert!(self.is_idle());
        debug!(conn = self.conn_id, "connection culled");
        for ch in &mut self.channels {
            ch.cull();
        }
        self.closed = true;
    }
}
