//! The socket-facing driver and user API.
//!
//! One endpoint owns one UDP socket and a driver task that multiplexes
//! the receive loop with a millisecond timer tick. Inbound datagrams are
//! classified and routed connection, channel, call; the tick polls every
//! connection for due ACKs, retransmissions and idle culling. Outbound
//! datagrams cross from the locked state to the socket through a
//! lock-free queue so no await happens under a lock.
//!
//! Lock order is endpoint state first, then a connection. Nothing ever
//! takes them the other way around.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::bundle::{Acquired, BundleKey, ClientPool};
use crate::call::{CallState, Direction};
use crate::channel::Released;
use crate::config::Config;
use crate::conn::{Admission, Connection, Dispatch};
use crate::demux::classify;
use crate::error::{Result, SkeinError};
use crate::packet::{encode_datagram, Packet, ABORT_CONN_DEAD};

/// How often the driver polls timers.
const TICK_INTERVAL: Duration = Duration::from_millis(1);

/// Opaque reference to one call on this endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallHandle(u64);

/// Result of a non-blocking receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    /// The next in-order payload.
    Data(Bytes),
    /// Nothing consumable yet; the call is still live.
    WouldBlock,
    /// The peer's final packet has been delivered.
    Ended,
}

enum CallLocation {
    Bound {
        conn: Arc<Mutex<Connection>>,
        channel: u8,
        call_number: u32,
    },
    Parked {
        conn: Arc<Mutex<Connection>>,
    },
    Queued,
}

struct CallRecord {
    key: Option<BundleKey>,
    location: CallLocation,
    /// Terminal state observed when the call retired from its channel.
    finished: Option<CallState>,
    /// Payloads waiting to enter the call, in submission order: those
    /// sent before it went live, plus any overflow the transmit window
    /// could not take yet.
    buffered: Vec<(Bytes, bool)>,
    /// Requested abort code for a call that was never bound.
    abort_requested: Option<u32>,
}

struct EndpointState {
    pool: ClientPool,
    /// Connections keyed by peer and connection id; ids are only unique
    /// per peer.
    conns: HashMap<(SocketAddr, u32), Arc<Mutex<Connection>>>,
    calls: HashMap<u64, CallRecord>,
    accept_queue: VecDeque<CallHandle>,
    next_user_id: u64,
}

struct Inner {
    cfg: Config,
    socket: UdpSocket,
    state: Mutex<EndpointState>,
    outbound: SegQueue<(SocketAddr, Bytes)>,
}

/// A bound UDP endpoint carrying client and service calls.
pub struct Endpoint {
    inner: Arc<Inner>,
    driver: JoinHandle<()>,
}

impl Endpoint {
    /// Bind a socket and start the driver task.
    pub async fn bind(addr: SocketAddr, cfg: Config) -> Result<Self> {
        cfg.validate()?;
        let socket = UdpSocket::bind(addr).await?;
        let inner = Arc::new(Inner {
            socket,
            state: Mutex::new(EndpointState {
                pool: ClientPool::new(cfg.clone()),
                conns: HashMap::new(),
                calls: HashMap::new(),
                accept_queue: VecDeque::new(),
                next_user_id: 1,
            }),
            outbound: SegQueue::new(),
            cfg,
        });
        let driver = tokio::spawn(drive(Arc::clone(&inner)));
        Ok(Self { inner, driver })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.socket.local_addr()?)
    }

    /// Start an outbound call toward `key`, placing it on a bundle
    /// connection or queueing it until capacity frees up.
    pub fn open_call(&self, key: BundleKey) -> Result<CallHandle> {
        let mut state = self.inner.state.lock();
        let user_id = state.next_user_id;
        state.next_user_id += 1;

        let location = match state.pool.acquire(key, user_id)? {
            Acquired::Admitted { conn, admission } => {
                let conn_id = conn.lock().conn_id();
                state
                    .conns
                    .entry((key.peer, conn_id))
                    .or_insert_with(|| Arc::clone(&conn));
                match admission {
                    Admission::Bound {
                        channel,
                        call_number,
                    } => CallLocation::Bound {
                        conn,
                        channel,
                        call_number,
                    },
                    Admission::Parked { .. } => CallLocation::Parked { conn },
                }
            }
            Acquired::Queued => CallLocation::Queued,
        };

        state.calls.insert(
            user_id,
            CallRecord {
                key: Some(key),
                location,
                finished: None,
                buffered: Vec::new(),
                abort_requested: None,
            },
        );
        trace!(user_id, peer = %key.peer, "call opened");
        Ok(CallHandle(user_id))
    }

    /// Submit one payload on a call. Queued or parked calls buffer it
    /// until they go live.
    pub fn send(&self, handle: CallHandle, payload: Bytes, is_last: bool) -> Result<()> {
        let now = Instant::now();
        let mut state = self.inner.state.lock();
        let record = state
            .calls
            .get_mut(&handle.0)
            .ok_or(SkeinError::UnknownCall)?;
        if let Some(CallState::Aborted(code)) = record.finished {
            return Err(SkeinError::CallAborted { code });
        }

        match &record.location {
            CallLocation::Bound {
                conn,
                channel,
                call_number,
            } => {
                if !record.buffered.is_empty() {
                    // An activation backlog is still draining; keep the
                    // submission order.
                    record.buffered.push((payload, is_last));
                    return Ok(());
                }
                let mut guard = conn.lock();
                let call = guard
                    .call_mut(*channel, *call_number)
                    .ok_or(SkeinError::UnknownCall)?;
                call.send(payload, is_last, now)?;
            }
            CallLocation::Parked { .. } | CallLocation::Queued => {
                record.buffered.push((payload, is_last));
            }
        }
        Ok(())
    }

    /// Non-blocking receive of the next in-order payload.
    pub fn receive(&self, handle: CallHandle) -> Result<Received> {
        let now = Instant::now();
        let mut state = self.inner.state.lock();
        let record = state
            .calls
            .get_mut(&handle.0)
            .ok_or(SkeinError::UnknownCall)?;

        match record.finished {
            Some(CallState::Aborted(code)) => return Err(SkeinError::CallAborted { code }),
            Some(CallState::Complete) => return Ok(Received::Ended),
            _ => {}
        }

        match &record.location {
            CallLocation::Bound {
                conn,
                channel,
                call_number,
            } => {
                let mut guard = conn.lock();
                let call = guard
                    .call_mut(*channel, *call_number)
                    .ok_or(SkeinError::UnknownCall)?;
                if let CallState::Aborted(code) = call.state() {
                    return Err(SkeinError::CallAborted { code });
                }
                match call.consume(now) {
                    Some(payload) => Ok(Received::Data(payload)),
                    None if call.rx_ended() => Ok(Received::Ended),
                    None => Ok(Received::WouldBlock),
                }
            }
            CallLocation::Parked { .. } | CallLocation::Queued => Ok(Received::WouldBlock),
        }
    }

    /// Abort a call with the given code, notifying the peer if it ever
    /// went live.
    pub fn abort(&self, handle: CallHandle, code: u32) -> Result<()> {
        let mut state = self.inner.state.lock();
        let record = state
            .calls
            .get_mut(&handle.0)
            .ok_or(SkeinError::UnknownCall)?;

        match &record.location {
            CallLocation::Bound {
                conn,
                channel,
                call_number,
            } => {
                let mut guard = conn.lock();
                if let Some(call) = guard.call_mut(*channel, *call_number) {
                    call.abort(code);
                }
            }
            CallLocation::Parked { .. } | CallLocation::Queued => {
                record.abort_requested = Some(code);
                record.finished = Some(CallState::Aborted(code));
            }
        }
        Ok(())
    }

    /// Probe the peer for liveness; the echoed PING_RESPONSE feeds the
    /// call's RTT estimator even when no data is moving.
    pub fn ping(&self, handle: CallHandle) -> Result<()> {
        let now = Instant::now();
        let state = self.inner.state.lock();
        let record = state.calls.get(&handle.0).ok_or(SkeinError::UnknownCall)?;
        if let CallLocation::Bound {
            conn,
            channel,
            call_number,
        } = &record.location
        {
            let mut guard = conn.lock();
            if let Some(call) = guard.call_mut(*channel, *call_number) {
                call.ping(rand::random(), now);
            }
        }
        Ok(())
    }

    /// Pop the next inbound service call awaiting acceptance.
    pub fn accept(&self) -> Option<CallHandle> {
        self.inner.state.lock().accept_queue.pop_front()
    }

    /// Forget a finished call's record.
    pub fn forget(&self, handle: CallHandle) {
        self.inner.state.lock().calls.remove(&handle.0);
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

async fn drive(inner: Arc<Inner>) {
    let mut buf = vec![0u8; inner.cfg.rx_mtu + 1];
    let mut tick = tokio::time::interval(TICK_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            result = inner.socket.recv_from(&mut buf) => match result {
                Ok((len, peer)) => inner.ingest(&buf[..len], peer),
                Err(e) => warn!(error = %e, "socket receive failed"),
            },
            _ = tick.tick() => inner.tick(Instant::now()),
        }
        inner.flush().await;
    }
}

impl Inner {
    /// Route one inbound datagram.
    fn ingest(&self, datagram: &[u8], peer: SocketAddr) {
        let now = Instant::now();
        let (header, packets) = match classify(datagram, &self.cfg) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!(%peer, error = %e, "undecodable datagram dropped");
                return;
            }
        };

        let mut state = self.state.lock();
        let conn = match state.conns.get(&(peer, header.conn_id)) {
            Some(conn) => Arc::clone(conn),
            None => {
                // First traffic of a peer-initiated connection.
                if !packets.iter().any(|p| matches!(p, Packet::Data { .. })) {
                    trace!(conn = header.conn_id, %peer, "traffic for unknown connection dropped");
                    return;
                }
                let conn = Arc::new(Mutex::new(Connection::new(
                    header.conn_id,
                    peer,
                    Direction::Service,
                    &self.cfg,
                )));
                debug!(conn = header.conn_id, %peer, "service connection created");
                state.conns.insert((peer, header.conn_id), Arc::clone(&conn));
                conn
            }
        };

        for packet in packets {
            let outcome = conn.lock().dispatch(&header, packet.clone(), now);
            if let Dispatch::NewCall { channel } = outcome {
                if state.accept_queue.len() >= self.cfg.max_backlog {
                    debug!(conn = header.conn_id, channel, "backlog full, answering busy");
                    self.outbound
                        .push((peer, encode_datagram(&header, &Packet::Busy)));
                    continue;
                }
                let user_id = state.next_user_id;
                state.next_user_id += 1;
                let accepted = {
                    let mut guard = conn.lock();
                    guard
                        .accept_inbound(channel, header.call_number, user_id, &self.cfg)
                        .map(|call_number| {
                            let d = guard.dispatch(&header, packet.clone(), now);
                            debug_assert_eq!(d, Dispatch::Handled);
                            call_number
                        })
                };
                match accepted {
                    Ok(call_number) => {
                        state.calls.insert(
                            user_id,
                            CallRecord {
                                key: None,
                                location: CallLocation::Bound {
                                    conn: Arc::clone(&conn),
                                    channel,
                                    call_number,
                                },
                                finished: None,
                                buffered: Vec::new(),
                                abort_requested: None,
                            },
                        );
                        state.accept_queue.push_back(CallHandle(user_id));
                        debug!(conn = header.conn_id, channel, user_id, "inbound call accepted");
                    }
                    Err(e) => {
                        warn!(conn = header.conn_id, channel, error = %e, "inbound call refused");
                        self.outbound
                            .push((peer, encode_datagram(&header, &Packet::Busy)));
                    }
                }
            }
        }

        // Flush anything the dispatch made due immediately.
        self.poll_conn(&mut state, &conn, now);
    }

    /// One timer round: poll every connection, then cull idle ones.
    fn tick(&self, now: Instant) {
        let mut state = self.state.lock();

        let conns: Vec<_> = state.conns.values().cloned().collect();
        for conn in conns {
            self.poll_conn(&mut state, &conn, now);
        }

        // Calls with a send backlog drain as their windows reopen.
        let backlog: Vec<u64> = state
            .calls
            .iter()
            .filter(|(_, record)| {
                !record.buffered.is_empty()
                    && record.finished.is_none()
                    && matches!(record.location, CallLocation::Bound { .. })
            })
            .map(|(&user_id, _)| user_id)
            .collect();
        for user_id in backlog {
            self.replay_buffered(&mut state, user_id, now);
        }

        state.pool.poll_cull(now);

        // Service connections are not pooled; expire them here.
        let expiry = self.cfg.idle_conn_expiry;
        for conn in state.conns.values() {
            let mut guard = conn.lock();
            if guard.direction() == Direction::Service {
                if let Some(since) = guard.idle_since() {
                    if now.saturating_duration_since(since) >= expiry {
                        guard.cull();
                    }
                }
            }
        }

        // Anything the cull closed loses its routing entry.
        state.conns.retain(|_, conn| !conn.lock().is_closed());
    }

    /// Poll one connection: emit its traffic and apply call retirements
    /// and promotions.
    fn poll_conn(
        &self,
        state: &mut EndpointState,
        conn: &Arc<Mutex<Connection>>,
        now: Instant,
    ) {
        let (peer, out) = {
            let mut guard = conn.lock();
            (guard.peer(), guard.poll(now))
        };
        for (header, packet) in &out.packets {
            self.outbound.push((peer, encode_datagram(header, packet)));
        }
        for released in out.released {
            self.apply_release(state, conn, released, now);
        }
    }

    fn apply_release(
        &self,
        state: &mut EndpointState,
        conn: &Arc<Mutex<Connection>>,
        released: Released,
        now: Instant,
    ) {
        let (retired_id, final_state) = released.retired;
        let mut promote_key = None;
        if let Some(record) = state.calls.get_mut(&retired_id) {
            record.finished = Some(final_state);
            promote_key = record.key;
        }

        if let Some((user_id, call_number)) = released.promoted {
            self.activate(
                state,
                user_id,
                Arc::clone(conn),
                released.channel,
                call_number,
                now,
            );
        }

        // Capacity freed on a client bundle: wake the oldest waiters.
        if let Some(key) = promote_key {
            let placements = state.pool.promote(&key);
            for (user_id, conn, admission) in placements {
                match admission {
                    Admission::Bound {
                        channel,
                        call_number,
                    } => self.activate(state, user_id, conn, channel, call_number, now),
                    Admission::Parked { .. } => {
                        if let Some(record) = state.calls.get_mut(&user_id) {
                            record.location = CallLocation::Parked { conn };
                        }
                    }
                }
            }
        }
    }

    /// A queued or parked call just went live: rebind its record and
    /// start replaying anything the caller submitted while it waited.
    fn activate(
        &self,
        state: &mut EndpointState,
        user_id: u64,
        conn: Arc<Mutex<Connection>>,
        channel: u8,
        call_number: u32,
        now: Instant,
    ) {
        let Some(record) = state.calls.get_mut(&user_id) else {
            // Caller vanished; release the channel again.
            let mut guard = conn.lock();
            if let Some(call) = guard.call_mut(channel, call_number) {
                call.abort(ABORT_CONN_DEAD);
            }
            return;
        };

        let abort_requested = record.abort_requested.take();
        record.location = CallLocation::Bound {
            conn: Arc::clone(&conn),
            channel,
            call_number,
        };
        trace!(user_id, channel, call_number, "waiting call activated");

        if let Some(code) = abort_requested {
            let mut guard = conn.lock();
            if let Some(call) = guard.call_mut(channel, call_number) {
                call.abort(code);
            }
            return;
        }
        self.replay_buffered(state, user_id, now);
    }

    /// Push buffered payloads into a live call until the transmit window
    /// refuses more. The remainder stays buffered and drains on later
    /// rounds as acknowledgments reopen the window.
    fn replay_buffered(&self, state: &mut EndpointState, user_id: u64, now: Instant) {
        let Some(record) = state.calls.get_mut(&user_id) else {
            return;
        };
        if record.buffered.is_empty() {
            return;
        }
        let CallLocation::Bound {
            conn,
            channel,
            call_number,
        } = &record.location
        else {
            return;
        };
        let conn = Arc::clone(conn);
        let (channel, call_number) = (*channel, *call_number);
        let mut pending = std::mem::take(&mut record.buffered);

        let mut sent = 0;
        {
            let mut guard = conn.lock();
            match guard.call_mut(channel, call_number) {
                Some(call) => {
                    for (payload, is_last) in &pending {
                        match call.send(payload.clone(), *is_last, now) {
                            Ok(_) => sent += 1,
                            Err(SkeinError::WindowFull { .. }) => break,
                            Err(e) => {
                                warn!(user_id, error = %e, "buffered send dropped");
                                sent = pending.len();
                                break;
                            }
                        }
                    }
                }
                None => {
                    warn!(user_id, "buffered sends dropped, call gone");
                    sent = pending.len();
                }
            }
        }

        if sent < pending.len() {
            pending.drain(..sent);
            if let Some(record) = state.calls.get_mut(&user_id) {
                record.buffered = pending;
            }
        }
    }

    /// Drain the outbound queue to the socket.
    async fn flush(&self) {
        while let Some((peer, datagram)) = self.outbound.pop() {
            if let Err(e) = self.socket.send_to(&datagram, peer).await {
                warn!(%peer, error = %e, "socket send failed");
            }
        }
    }
}
