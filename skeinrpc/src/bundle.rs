//! Client connection bundles.
//!
//! Outbound calls to the same peer, service and security context share a
//! bundle of connections. Placement prefers a free channel on an existing
//! connection, then a fresh connection under the global cap, then a
//! parking slot behind a live call; when all of those are taken the call
//! waits in the bundle's FIFO queue. Fully idle connections are culled
//! after an expiry unless a new call reclaims them first.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::call::Direction;
use crate::config::Config;
use crate::conn::{Admission, Connection};
use crate::error::Result;

/// Identity of a bundle: calls may only share a connection when all
/// three components match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BundleKey {
    pub security_key: u64,
    pub service: u16,
    pub peer: SocketAddr,
}

struct Bundle {
    conns: Vec<Arc<Mutex<Connection>>>,
    /// Calls waiting for any channel, oldest first.
    waiters: VecDeque<u64>,
}

/// Outcome of placing a call.
pub enum Acquired {
    Admitted {
        conn: Arc<Mutex<Connection>>,
        admission: Admission,
    },
    /// No capacity anywhere; the call waits its turn.
    Queued,
}

pub struct ClientPool {
    cfg: Config,
    bundles: HashMap<BundleKey, Bundle>,
    next_conn_id: u32,
    live_connections: usize,
}

impl ClientPool {
    pub fn new(cfg: Config) -> Self {
        Self {
            cfg,
            bundles: HashMap::new(),
            next_conn_id: 1,
            live_connections: 0,
        }
    }

    pub fn live_connections(&self) -> usize {
        self.live_connections
    }

    /// Place an outbound call within its bundle.
    pub fn acquire(&mut self, key: BundleKey, user_id: u64) -> Result<Acquired> {
        let at_conn_cap = self.live_connections >= self.cfg.max_client_connections;
        let bundle = self.bundles.entry(key).or_insert_with(|| Bundle {
            conns: Vec::new(),
            waiters: VecDeque::new(),
        });

        // A free channel on an existing connection wins.
        for conn in &bundle.conns {
            let mut guard = conn.lock();
            if guard.channels_accepting() {
                let admission = guard.admit(user_id, &self.cfg)?;
                return Ok(Acquired::Admitted {
                    conn: Arc::clone(conn),
                    admission,
                });
            }
        }

        // Then a fresh connection, under the global cap.
        if !at_conn_cap {
            let conn_id = self.next_conn_id;
            self.next_conn_id += 1;
            let conn = Arc::new(Mutex::new(Connection::new(
                conn_id,
                key.peer,
                Direction::Client,
                &self.cfg,
            )));
            let admission = conn.lock().admit(user_id, &self.cfg)?;
            debug!(conn_id, peer = %key.peer, "client connection created");
            bundle.conns.push(Arc::clone(&conn));
            self.live_connections += 1;
            return Ok(Acquired::Admitted {
                conn,
                admission,
            });
        }

        // Then a parking slot behind a live call.
        for conn in &bundle.conns {
            let mut guard = conn.lock();
            if guard.has_room() {
                let admission = guard.admit(user_id, &self.cfg)?;
                return Ok(Acquired::Admitted {
                    conn: Arc::clone(conn),
                    admission,
                });
            }
        }

        trace!(peer = %key.peer, user_id, "bundle full, call queued");
        bundle.waiters.push_back(user_id);
        Ok(Acquired::Queued)
    }

    /// After capacity frees up in a bundle, move the oldest waiters onto
    /// it. Returns the placements made, oldest first.
    pub fn promote(&mut self, key: &BundleKey) -> Vec<(u64, Arc<Mutex<Connection>>, Admission)> {
        let Some(bundle) = self.bundles.get_mut(key) else {
            return Vec::new();
        };
        let mut placed = Vec::new();
        'outer: while let Some(&user_id) = bundle.waiters.front() {
            for conn in &bundle.conns {
                let mut guard = conn.lock();
                if guard.has_room() {
                    if let Ok(admission) = guard.admit(user_id, &self.cfg) {
                        bundle.waiters.pop_front();
                        placed.push((user_id, Arc::clone(conn), admission));
                        continue 'outer;
                    }
                }
            }
            break;
        }
        placed
    }

    /// Tear down connections idle past the expiry, unless a waiter could
    /// still use them. Returns the culled connection ids so the caller
    /// can drop its routing entries.
    pub fn poll_cull(&mut self, now: Instant) -> Vec<u32> {
        let expiry = self.cfg.idle_conn_expiry;
        let mut culled = Vec::new();

        for bundle in self.bundles.values_mut() {
            if !bundle.waiters.is_empty() {
                continue;
            }
            bundle.conns.retain(|conn| {
                let mut guard = conn.lock();
                if guard.is_closed() {
                    culled.push(guard.conn_id());
                    return false;
                }
                match guard.idle_since() {
                    Some(since) if now.saturating_duration_since(since) >= expiry => {
                        guard.cull();
                        culled.push(guard.conn_id());
                        false
                    }
                    _ => true,
                }
            });
        }
        self.live_connections -= culled.len();
        self.bundles
            .retain(|_, b| !b.conns.is_empty() || !b.waiters.is_empty());
        culled
    }

    /// Every connection in every bundle, for the driver's poll loop.
    pub fn connections(&self) -> Vec<Arc<Mutex<Connection>>> {
        self.bundles
            .values()
            .flat_map(|b| b.conns.iter().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn key() -> BundleKey {
        BundleKey {
            security_key: 1,
            service: 52,
            peer: "10.0.0.1:7001".parse().unwrap(),
        }
    }

    fn pool(max_conns: usize) -> ClientPool {
        ClientPool::new(Config {
            max_client_connections: max_conns,
            ..Config::default()
        })
    }

    fn admit_one(pool: &mut ClientPool, user_id: u64) -> Acquired {
        pool.acquire(key(), user_id).unwrap()
    }

    #[test]
    fn four_calls_share_one_connection() {
        let mut p = pool(8);
        for user in 0..4 {
            match admit_one(&mut p, user) {
                Acquired::Admitted { admission, .. } => {
                    assert!(matches!(admission, Admission::Bound { .. }))
                }
                Acquired::Queued => panic!("should not queue"),
            }
        }
        assert_eq!(p.live_connections(), 1);

        // The fifth call overflows onto a second connection.
        assert!(matches!(
            admit_one(&mut p, 4),
            Acquired::Admitted {
                admission: Admission::Bound { channel: 0, .. },
                ..
            }
        ));
        assert_eq!(p.live_connections(), 2);
    }

    #[test]
    fn fifth_call_parks_when_conn_cap_reached() {
        let mut p = pool(1);
        for user in 0..4 {
            admit_one(&mut p, user);
        }
        match admit_one(&mut p, 4) {
            Acquired::Admitted { admission, .. } => {
                assert!(matches!(admission, Admission::Parked { .. }))
            }
            Acquired::Queued => panic!("parking slot available"),
        }

        // 4 bound + 4 parked exhaust the connection; the ninth queues.
        for user in 5..8 {
            admit_one(&mut p, user);
        }
        assert!(matches!(admit_one(&mut p, 8), Acquired::Queued));
        assert_eq!(p.live_connections(), 1);
    }

    #[test]
    fn promote_is_fifo() {
        let mut p = pool(1);
        let conn = match admit_one(&mut p, 0) {
            Acquired::Admitted { conn, .. } => conn,
            Acquired::Queued => unreachable!(),
        };
        for user in 1..8 {
            admit_one(&mut p, user);
        }
        assert!(matches!(admit_one(&mut p, 100), Acquired::Queued));
        assert!(matches!(admit_one(&mut p, 101), Acquired::Queued));

        // Free two channels worth of capacity and promote.
        {
            let mut guard = conn.lock();
            for channel in 0..2 {
                guard.call_mut(channel, 1).unwrap().abort(9);
            }
            guard.poll(Instant::now());
        }
        let placed = p.promote(&key());
        assert_eq!(placed.len(), 2);
        assert_eq!(placed[0].0, 100);
        assert_eq!(placed[1].0, 101);
    }

    #[test]
    fn idle_connection_is_culled_after_expiry() {
        let mut p = pool(4);
        let now = Instant::now();
        let conn = match admit_one(&mut p, 0) {
            Acquired::Admitted { conn, .. } => conn,
            Acquired::Queued => unreachable!(),
        };
        {
            let mut guard = conn.lock();
            guard.call_mut(0, 1).unwrap().abort(9);
            guard.poll(now);
            assert_eq!(guard.idle_since(), Some(now));
        }

        // Not yet expired.
        assert!(p.poll_cull(now + Duration::from_secs(30)).is_empty());
        let culled = p.poll_cull(now + Duration::from_secs(60));
        assert_eq!(culled.len(), 1);
        assert_eq!(p.live_connections(), 0);
        assert!(conn.lock().is_closed());
    }

    #[test]
    fn reclaim_before_cull_keeps_the_connection() {
        let mut p = pool(4);
        let now = Instant::now();
        let conn = match admit_one(&mut p, 0) {
            Acquired::Admitted { conn, .. } => conn,
            Acquired::Queued => unreachable!(),
        };
        {
            let mut guard = conn.lock();
            guard.call_mut(0, 1).unwrap().abort(9);
            guard.poll(now);
        }

        // A new call lands past the idle deadline but before the cull
        // tick: the connection must survive.
        match admit_one(&mut p, 1) {
            Acquired::Admitted { conn: reused, .. } => {
                assert!(Arc::ptr_eq(&reused, &conn))
            }
            Acquired::Queued => panic!("idle connection must be reusable"),
        }
        assert!(p.poll_cull(now + Duration::from_secs(120)).is_empty());
        assert_eq!(p.live_connections(), 1);
    }
}
