//! # Connection Pool
//!
//! Purpose: Share a fixed number of TCP connections between caller threads,
//! blocking callers when every connection is busy.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: A fixed slot array, sized once, never resized.
//! 2. **Scoped Lease**: `acquire` returns a guard; dropping it gives the
//!    connection back on every path, including `?` and panics.
//! 3. **Minimal Locking**: The mutex covers slot bookkeeping only. Sockets are
//!    opened lazily by the lease holder, outside the lock.
//! 4. **Lazy Replacement**: A faulted connection stays in its slot until a
//!    scan lands on it, then it is swapped for a fresh one.
//! 5. **Clean Session**: A lease that switched databases does not hand that
//!    socket to the next holder.
//!
//! ## Structure Overview
//!
//! ```text
//! ConnectionPool ── Arc<PoolInner>
//!                     ├── slots: Mutex<Vec<Slot>>   Slot { conn, in_use }
//!                     └── available: Condvar        notified on every release
//! PooledConnection ── (pool, slot index, Connection moved out of the slot)
//! ```

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::buffer::BufferPool;
use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::error::{ClientError, ClientResult};

/// Rescan interval when no pool timeout is configured.
const RECHECK_INTERVAL: Duration = Duration::from_millis(100);

struct Slot {
    // Moved out into the lease while `in_use` is set.
    conn: Option<Connection>,
    in_use: bool,
}

struct PoolInner {
    config: Arc<ClientConfig>,
    buffers: Arc<BufferPool>,
    slots: Mutex<Vec<Slot>>,
    available: Condvar,
}

/// Connection pool handle.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Creates a pool of `config.pool_size` empty slots.
    pub fn new(config: Arc<ClientConfig>, buffers: Arc<BufferPool>) -> ClientResult<Self> {
        if config.pool_size == 0 {
            return Err(ClientError::argument("pool_size must be at least 1"));
        }

        let slots = (0..config.pool_size)
            .map(|_| Slot {
                conn: None,
                in_use: false,
            })
            .collect();

        Ok(ConnectionPool {
            inner: Arc::new(PoolInner {
                config,
                buffers,
                slots: Mutex::new(slots),
                available: Condvar::new(),
            }),
        })
    }

    /// Number of slots.
    pub fn size(&self) -> usize {
        self.inner.config.pool_size
    }

    /// Number of slots currently leased.
    pub fn in_use(&self) -> usize {
        self.inner.slots.lock().iter().filter(|slot| slot.in_use).count()
    }

    /// Leases a connection, waiting while every slot is busy.
    ///
    /// With `pool_timeout` set the total wait is bounded and expiry returns
    /// `ClientError::Timeout`; otherwise the slots are rescanned until one
    /// frees up.
    pub fn acquire(&self) -> ClientResult<PooledConnection> {
        let started = Instant::now();
        let deadline = self.inner.config.pool_timeout.map(|timeout| started + timeout);

        let mut slots = self.inner.slots.lock();
        loop {
            if let Some((index, conn)) = self.inner.claim(&mut slots) {
                return Ok(PooledConnection {
                    pool: self.inner.clone(),
                    index,
                    conn: Some(conn),
                });
            }

            trace!(size = slots.len(), "all pooled connections busy, waiting");
            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return Err(ClientError::Timeout {
                            waited: started.elapsed(),
                        });
                    }
                    self.inner.available.wait_until(&mut slots, deadline);
                }
                None => {
                    self.inner.available.wait_for(&mut slots, RECHECK_INTERVAL);
                }
            }
        }
    }
}

impl PoolInner {
    /// Scans slots in index order and claims the first usable one.
    fn claim(&self, slots: &mut [Slot]) -> Option<(usize, Connection)> {
        for (index, slot) in slots.iter_mut().enumerate() {
            if slot.in_use {
                continue;
            }

            match slot.conn.take() {
                Some(conn) if !conn.is_faulted() => {
                    slot.in_use = true;
                    return Some((index, conn));
                }
                stale => {
                    if stale.is_some() {
                        debug!(slot = index, "replacing faulted connection");
                    }
                    // A faulted connection has already released its socket.
                    drop(stale);
                    slot.in_use = true;
                    let conn = Connection::new(self.config.clone(), self.buffers.clone());
                    return Some((index, conn));
                }
            }
        }
        None
    }

    /// Returns a connection to its slot.
    ///
    /// A connection left on a database other than the configured one is
    /// closed instead, so the next holder starts from a fresh handshake.
    fn give_back(&self, index: usize, mut conn: Connection) {
        let conn = if conn.db() == self.config.db {
            Some(conn)
        } else {
            debug!(slot = index, db = conn.db(), "discarding connection left on another db");
            conn.close();
            None
        };
        {
            let mut slots = self.slots.lock();
            let slot = &mut slots[index];
            slot.conn = conn;
            slot.in_use = false;
        }
        self.available.notify_one();
    }
}

/// Exclusive lease on one pooled connection; returns it to its slot on drop.
pub struct PooledConnection {
    pool: Arc<PoolInner>,
    index: usize,
    conn: Option<Connection>,
}

impl PooledConnection {
    /// Index of the slot this lease occupies.
    pub fn slot(&self) -> usize {
        self.index
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("lease holds its connection until drop")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("lease holds its connection until drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.give_back(self.index, conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionState;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;

    fn pool(size: usize, timeout: Option<Duration>) -> ConnectionPool {
        let mut config = ClientConfig::new("127.0.0.1");
        config.pool_size = size;
        config.pool_timeout = timeout;
        ConnectionPool::new(Arc::new(config), Arc::new(BufferPool::new(4, 64))).unwrap()
    }

    #[test]
    fn zero_sized_pool_is_rejected() {
        let mut config = ClientConfig::new("127.0.0.1");
        config.pool_size = 0;
        let result = ConnectionPool::new(Arc::new(config), Arc::new(BufferPool::default()));
        assert!(matches!(result, Err(ClientError::Argument { .. })));
    }

    #[test]
    fn slots_are_handed_out_in_index_order() {
        let pool = pool(3, None);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_eq!((a.slot(), b.slot()), (0, 1));
        assert_eq!(pool.in_use(), 2);

        drop(a);
        assert_eq!(pool.in_use(), 1);
        assert_eq!(pool.acquire().unwrap().slot(), 0);
    }

    #[test]
    fn faulted_connection_is_replaced_on_next_scan() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut config = ClientConfig::new("127.0.0.1");
        config.port = listener.local_addr().unwrap().port();
        config.pool_size = 1;
        drop(listener);
        let pool = ConnectionPool::new(Arc::new(config), Arc::new(BufferPool::new(4, 64))).unwrap();

        {
            let mut lease = pool.acquire().unwrap();
            let err = lease.execute(&crate::resp::Command::new(b"PING")).unwrap_err();
            assert!(err.is_connection());
            assert!(lease.is_faulted());
        }

        let lease = pool.acquire().unwrap();
        assert_eq!(lease.slot(), 0);
        assert_eq!(lease.state(), ConnectionState::Disconnected);
        assert_eq!(pool.size(), 1);
    }

    #[test]
    fn timeout_when_exhausted() {
        let pool = pool(1, Some(Duration::from_millis(100)));
        let holder = pool.clone();
        let (tx, rx) = std::sync::mpsc::channel();
        let handle = thread::spawn(move || {
            let _lease = holder.acquire().unwrap();
            tx.send(()).unwrap();
            thread::sleep(Duration::from_millis(600));
        });
        rx.recv().unwrap();

        let started = Instant::now();
        let err = pool.acquire().err().unwrap();
        let waited = started.elapsed();
        assert!(err.is_timeout());
        assert!(waited >= Duration::from_millis(100));
        assert!(waited < Duration::from_millis(500));

        handle.join().unwrap();
        assert!(pool.acquire().is_ok());
    }

    #[test]
    fn waiter_wakes_when_lease_is_dropped() {
        let pool = pool(1, None);
        let lease = pool.acquire().unwrap();
        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.acquire().map(|lease| lease.slot()))
        };
        thread::sleep(Duration::from_millis(50));
        drop(lease);
        assert_eq!(waiter.join().unwrap().unwrap(), 0);
    }

    #[test]
    fn lease_is_returned_on_panic() {
        let pool = pool(1, Some(Duration::from_millis(200)));
        let clone = pool.clone();
        let result = thread::spawn(move || {
            let _lease = clone.acquire().unwrap();
            panic!("caller failed while holding a lease");
        })
        .join();
        assert!(result.is_err());
        assert_eq!(pool.in_use(), 0);
        assert!(pool.acquire().is_ok());
    }

    #[test]
    fn no_two_holders_share_a_slot() {
        let pool = pool(3, None);
        let held = Arc::new((0..3).map(|_| AtomicBool::new(false)).collect::<Vec<_>>());
        let rounds = Arc::new(AtomicUsize::new(0));

        let handles = (0..8)
            .map(|_| {
                let pool = pool.clone();
                let held = held.clone();
                let rounds = rounds.clone();
                thread::spawn(move || {
                    for _ in 0..50 {
                        let lease = pool.acquire().unwrap();
                        let flag = &held[lease.slot()];
                        assert!(!flag.swap(true, Ordering::SeqCst), "slot leased twice");
                        thread::yield_now();
                        flag.store(false, Ordering::SeqCst);
                        rounds.fetch_add(1, Ordering::Relaxed);
                    }
                })
            })
            .collect::<Vec<_>>();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(rounds.load(Ordering::Relaxed), 8 * 50);
        assert_eq!(pool.in_use(), 0);
    }
}
