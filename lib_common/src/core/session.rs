//! # Downstream Client Session
//!
//! One task per consumer socket. Broadcasts land in a small bounded queue;
//! when the consumer falls behind, the oldest chunks are dropped so the
//! dispatcher never waits on a slow reader and a reconnecting rover always
//! gets the freshest corrections.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Pending chunks kept per session before the oldest are dropped.
pub const DEFAULT_QUEUE_BOUND: usize = 10;

/// Session side timeouts.
#[derive(Debug, Clone)]
pub struct SessionTimings {
    /// Bound on writing one chunk.
    pub write_timeout: Duration,
    /// Queue bound.
    pub queue_bound: usize,
}

impl Default for SessionTimings {
    fn default() -> Self {
        Self {
            write_timeout: Duration::from_secs(5),
            queue_bound: DEFAULT_QUEUE_BOUND,
        }
    }
}

/// # Drop-Oldest Queue
///
/// FIFO of byte chunks that never holds more than `bound` entries. Pushing
/// never blocks.
#[derive(Debug)]
pub struct SessionQueue {
    chunks: Mutex<VecDeque<Bytes>>,
    notify: Notify,
    bound: usize,
    dropped: AtomicU64,
}

impl SessionQueue {
    /// Creates an empty queue. A bound of zero is treated as one.
    pub fn new(bound: usize) -> Self {
        let bound = bound.max(1);
        Self {
            chunks: Mutex::new(VecDeque::with_capacity(bound)),
            notify: Notify::new(),
            bound,
            dropped: AtomicU64::new(0),
        }
    }

    /// Appends `chunk`, discarding the oldest entries beyond the bound.
    /// Returns how many were discarded.
    pub fn push(&self, chunk: Bytes) -> usize {
        let discarded = {
            let mut chunks = self.chunks.lock().unwrap_or_else(PoisonError::into_inner);
            chunks.push_back(chunk);
            let excess = chunks.len().saturating_sub(self.bound);
            chunks.drain(..excess);
            excess
        };
        if discarded > 0 {
            self.dropped.fetch_add(discarded as u64, Ordering::Relaxed);
        }
        self.notify.notify_one();
        discarded
    }

    /// Takes the oldest chunk, if any.
    pub fn pop(&self) -> Option<Bytes> {
        self.chunks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    /// Waits for the next chunk. Cancel-safe: a chunk is only removed in the
    /// poll that returns it.
    pub async fn pop_wait(&self) -> Bytes {
        loop {
            if let Some(chunk) = self.pop() {
                return chunk;
            }
            self.notify.notified().await;
        }
    }

    /// Chunks currently queued.
    pub fn len(&self) -> usize {
        self.chunks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// True if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total chunks discarded since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// What the control port shows for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    /// Dispatcher-assigned id.
    pub id: u64,
    /// Consumer address.
    pub address: SocketAddr,
    /// Chunks written so far.
    pub sent_count: u64,
}

/// State shared between a session task and the dispatcher.
#[derive(Debug)]
pub struct ClientSession {
    id: u64,
    address: SocketAddr,
    queue: SessionQueue,
    sent_count: AtomicU64,
    alive: AtomicBool,
    cancel: CancellationToken,
}

impl ClientSession {
    pub(crate) fn new(id: u64, address: SocketAddr, bound: usize, cancel: CancellationToken) -> Self {
        Self {
            id,
            address,
            queue: SessionQueue::new(bound),
            sent_count: AtomicU64::new(0),
            alive: AtomicBool::new(true),
            cancel,
        }
    }

    /// Session id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// False once the socket is done.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Queues a chunk for the consumer. Returns false if the session is dead.
    pub fn enqueue(&self, chunk: Bytes) -> bool {
        if !self.is_alive() {
            return false;
        }
        let discarded = self.queue.push(chunk);
        if discarded > 0 {
            log::debug!("Session {} ({}) is behind, dropped {} chunk(s)", self.id, self.address, discarded);
        }
        true
    }

    /// Marks the session dead and asks its task to stop.
    pub fn stop(&self) {
        self.alive.store(false, Ordering::Release);
        self.cancel.cancel();
    }

    /// Snapshot for listings.
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            address: self.address,
            sent_count: self.sent_count.load(Ordering::Relaxed),
        }
    }

    /// The bounded outbound queue.
    pub fn queue(&self) -> &SessionQueue {
        &self.queue
    }

    /// Drives the socket until EOF, error, timeout or stop.
    pub(crate) async fn run(self: Arc<Self>, stream: TcpStream, write_timeout: Duration) {
        let (mut reader, mut writer) = stream.into_split();
        let mut discard = [0u8; 256];

        let reason = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break "stopped".to_string(),
                chunk = self.queue.pop_wait() => {
                    // A consumer that stopped reading must not hold up stop.
                    let written = tokio::select! {
                        _ = self.cancel.cancelled() => break "stopped".to_string(),
                        written = timeout(write_timeout, writer.write_all(&chunk)) => written,
                    };
                    match written {
                        Ok(Ok(())) => {
                            self.sent_count.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(Err(e)) => break format!("write failed: {}", e),
                        Err(_) => break "write timed out".to_string(),
                    }
                }
                read = reader.read(&mut discard) => match read {
                    Ok(0) => break "closed by client".to_string(),
                    Ok(_) => {}
                    Err(e) => break format!("read failed: {}", e),
                },
            }
        };

        self.alive.store(false, Ordering::Release);
        let _ = writer.shutdown().await;
        log::info!(
            "Session {} ({}) ended: {}, {} chunk(s) sent, {} dropped",
            self.id,
            self.address,
            reason,
            self.sent_count.load(Ordering::Relaxed),
            self.queue.dropped()
        );
    }
}
