//! # Correction Fan-out Dispatcher
//!
//! The `Dispatcher` takes every frame that leaves the station side and hands it
//! to every connected consumer. A single `Bytes` is shared by all sessions, so
//! fan-out costs one reference count bump per consumer, not a copy.
//!
//! ## Core Design Principles:
//!
//! 1.  **Never block on a consumer**: `broadcast` only pushes into each
//!     session's bounded queue. Slow consumers lose their oldest chunks; they
//!     never slow down the station or the other sessions.
//!
//! 2.  **Snapshot, then deliver**: the session table lock is held only to copy
//!     the current `Arc<ClientSession>` list. Enqueueing and cleanup happen
//!     outside it, so registration and listing never wait on delivery.
//!
//! 3.  **Lazy cleanup**: sessions mark themselves dead when their socket ends;
//!     the next broadcast removes them from the table.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::session::{ClientSession, SessionInfo, SessionTimings};

/// # Session Entry
///
/// The dispatcher's handle on one running session: the shared state plus the
/// task driving its socket.
struct SessionEntry {
    session: Arc<ClientSession>,
    task: JoinHandle<()>,
}

/// # Core Dispatcher
///
/// Manages registration, broadcasting and teardown of downstream sessions.
pub struct Dispatcher {
    /// Live sessions keyed by id, so listings come out in connection order.
    sessions: Mutex<BTreeMap<u64, SessionEntry>>,
    /// Monotonic id source.
    next_id: AtomicU64,
    /// Per-session queue bound and write timeout.
    timings: SessionTimings,
    /// Parent of every session token.
    cancel: CancellationToken,
}

impl Dispatcher {
    /// Creates an empty dispatcher.
    pub fn new(timings: SessionTimings) -> Self {
        Self {
            sessions: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            timings,
            cancel: CancellationToken::new(),
        }
    }

    /// # Register Client
    ///
    /// Wraps an accepted consumer socket in a [`ClientSession`], starts its
    /// task and adds it to the table.
    ///
    /// # Returns
    /// The id assigned to the session.
    pub fn register_client(&self, stream: TcpStream, address: SocketAddr) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(ClientSession::new(
            id,
            address,
            self.timings.queue_bound,
            self.cancel.child_token(),
        ));
        let task = tokio::spawn(Arc::clone(&session).run(stream, self.timings.write_timeout));

        self.lock().insert(id, SessionEntry { session, task });
        log::info!("Client {} ({}) registered", id, address);
        id
    }

    /// # Broadcast
    ///
    /// Queues `chunk` on every live session.
    ///
    /// ## Logic:
    /// 1.  Copies the session list under the lock.
    /// 2.  Enqueues into each alive session (drop-oldest at the bound).
    /// 3.  Removes sessions found dead.
    ///
    /// # Returns
    /// The number of sessions that were handed the chunk.
    pub fn broadcast(&self, chunk: Bytes) -> usize {
        let snapshot: Vec<Arc<ClientSession>> =
            self.lock().values().map(|entry| Arc::clone(&entry.session)).collect();

        let mut delivered = 0;
        let mut dead = Vec::new();
        for session in snapshot {
            if session.enqueue(chunk.clone()) {
                delivered += 1;
            } else {
                dead.push(session.id());
            }
        }

        if !dead.is_empty() {
            let mut sessions = self.lock();
            for id in dead {
                if sessions.remove(&id).is_some() {
                    log::debug!("Client {} removed from dispatcher", id);
                }
            }
        }
        delivered
    }

    /// Lists `(id, address, sent_count)` of every session still in the table.
    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.lock()
            .values()
            .filter(|entry| entry.session.is_alive())
            .map(|entry| entry.session.info())
            .collect()
    }

    /// Number of sessions currently in the table.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True if no session is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// # Close All
    ///
    /// Marks every session dead, stops it and waits for its task.
    pub async fn close_all(&self) {
        let entries: Vec<SessionEntry> = std::mem::take(&mut *self.lock()).into_values().collect();
        for entry in &entries {
            entry.session.stop();
        }
        for entry in entries {
            if let Err(e) = entry.task.await {
                log::warn!("Client {} task failed: {}", entry.session.id(), e);
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<u64, SessionEntry>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};
    use crate::core::session::DEFAULT_QUEUE_BOUND;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn connect_client(dispatcher: &Dispatcher, listener: &TcpListener) -> TcpStream {
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server_side, addr) = listener.accept().await.unwrap();
        dispatcher.register_client(server_side, addr);
        client
    }

    #[tokio::test]
    async fn broadcast_reaches_every_client_in_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dispatcher = Dispatcher::new(SessionTimings::default());
        let mut a = connect_client(&dispatcher, &listener).await;
        let mut b = connect_client(&dispatcher, &listener).await;

        assert_eq!(dispatcher.broadcast(Bytes::from_static(b"one,")), 2);
        assert_eq!(dispatcher.broadcast(Bytes::from_static(b"two")), 2);

        for client in [&mut a, &mut b] {
            let mut buf = [0u8; 7];
            client.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"one,two");
        }

        let ids: Vec<u64> = dispatcher.sessions().iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![1, 2]);
        dispatcher.close_all().await;
        assert!(dispatcher.is_empty());
    }

    #[tokio::test]
    async fn disconnected_client_is_removed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dispatcher = Dispatcher::new(SessionTimings::default());
        let keep = connect_client(&dispatcher, &listener).await;
        let gone = connect_client(&dispatcher, &listener).await;
        drop(gone);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(dispatcher.broadcast(Bytes::from_static(b"x")), 1);
        assert_eq!(dispatcher.len(), 1);
        drop(keep);
        dispatcher.close_all().await;
    }

    #[tokio::test]
    async fn close_all_ends_client_sockets() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dispatcher = Dispatcher::new(SessionTimings::default());
        let mut client = connect_client(&dispatcher, &listener).await;

        dispatcher.close_all().await;
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
        assert_eq!(dispatcher.broadcast(Bytes::from_static(b"late")), 0);
    }

    #[tokio::test]
    async fn stalled_client_neither_blocks_broadcast_nor_starves_others() {
        const CHUNK: usize = 64 * 1024;
        const ROUNDS: usize = 400;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dispatcher = Dispatcher::new(SessionTimings {
            write_timeout: Duration::from_secs(60),
            ..SessionTimings::default()
        });
        let _stalled = connect_client(&dispatcher, &listener).await;
        let mut reader = connect_client(&dispatcher, &listener).await;
        let stalled_session = Arc::clone(&dispatcher.lock().get(&1).unwrap().session);

        let mut slowest = Duration::ZERO;
        let mut buf = vec![0u8; CHUNK];
        for round in 0..ROUNDS {
            let chunk = Bytes::from(vec![round as u8; CHUNK]);
            let started = Instant::now();
            assert_eq!(dispatcher.broadcast(chunk), 2);
            slowest = slowest.max(started.elapsed());

            tokio::time::timeout(Duration::from_secs(5), reader.read_exact(&mut buf))
                .await
                .expect("reading client keeps receiving")
                .unwrap();
            assert!(buf.iter().all(|&b| b == round as u8));
        }

        assert!(slowest < Duration::from_millis(100), "broadcast took {:?}", slowest);
        assert!(stalled_session.is_alive());
        assert_eq!(stalled_session.queue().len(), DEFAULT_QUEUE_BOUND);
        assert!(stalled_session.queue().dropped() > 0);

        dispatcher.close_all().await;
    }

    #[tokio::test]
    async fn broadcast_burst_keeps_the_newest_ten_per_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dispatcher = Dispatcher::new(SessionTimings::default());
        let mut client = connect_client(&dispatcher, &listener).await;

        // No await between broadcasts: the session task cannot drain in between.
        for i in 0..15u8 {
            dispatcher.broadcast(Bytes::from(vec![i]));
        }

        let mut got = [0u8; 10];
        client.read_exact(&mut got).await.unwrap();
        assert_eq!(got.to_vec(), (5..15).collect::<Vec<u8>>());

        let mut extra = [0u8; 1];
        let more = tokio::time::timeout(Duration::from_millis(100), client.read(&mut extra)).await;
        assert!(more.is_err(), "dropped chunks must not arrive late");
        dispatcher.close_all().await;
    }
}
