//! # Station Connection
//!
//! Owns one station socket. Its task reads chunks, feeds them through the
//! [`FrameParser`], and forwards accepted frames to whatever is attached.
//! Bytes queued for the station are drained and written in one combined
//! write between reads.
//!
//! A connection is born either authoritative (dial role, attached at spawn) or
//! as a candidate (accept role, detached until an arbiter promotes it). A
//! candidate must pass its [`Handshake`] before any frame leaves it.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

use crate::core::rtcm::{FilterSpec, Frame, FrameParser, ParseEvent};
use crate::core::station::LinkTimings;
use crate::core::status::{ServiceStatus, Transition};
use crate::loggers::FrameAudit;

/// Largest single read from a station socket.
pub const READ_CHUNK: usize = 4096;

/// Bytes an unconfirmed candidate may keep buffered; older ones are dropped.
pub const PENDING_LIMIT: usize = 4 * READ_CHUNK;

/// Which side opened the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// We connected to the station.
    Dial,
    /// The station connected to us.
    Accept,
}

/// Why a connection task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEnd {
    /// The station closed the socket.
    PeerClosed,
    /// Too many consecutive read timeouts.
    Idle,
    /// Read or write error.
    Failed(std::io::ErrorKind),
    /// Stop was requested.
    Stopped,
}

/// Confirms that an inbound peer is a station before it may become active.
pub trait Handshake: Send {
    /// Bytes to send right after the socket opens.
    fn probe(&self) -> Option<Bytes> {
        None
    }

    /// Called with every chunk until it returns true.
    fn verify(&mut self, received: &[u8]) -> bool;
}

/// Builds a fresh handshake per connection.
pub type HandshakeFactory = Arc<dyn Fn() -> Box<dyn Handshake> + Send + Sync>;

/// Accepts the peer as soon as it sends anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAny;

impl Handshake for AcceptAny {
    fn verify(&mut self, received: &[u8]) -> bool {
        !received.is_empty()
    }
}

/// Sends a probe and waits until an expected reply shows up in the stream.
#[derive(Debug, Clone)]
pub struct ProbeHandshake {
    probe: Bytes,
    reply: Vec<u8>,
    seen: Vec<u8>,
}

impl ProbeHandshake {
    /// `reply` must not be empty; use [`AcceptAny`] for that.
    pub fn new(probe: impl Into<Bytes>, reply: impl Into<Vec<u8>>) -> Self {
        Self {
            probe: probe.into(),
            reply: reply.into(),
            seen: Vec::new(),
        }
    }
}

impl Handshake for ProbeHandshake {
    fn probe(&self) -> Option<Bytes> {
        (!self.probe.is_empty()).then(|| self.probe.clone())
    }

    fn verify(&mut self, received: &[u8]) -> bool {
        if self.reply.is_empty() {
            return !received.is_empty();
        }
        self.seen.extend_from_slice(received);
        if self.seen.windows(self.reply.len()).any(|w| w == self.reply.as_slice()) {
            self.seen.clear();
            return true;
        }
        // Keep just enough tail to match a reply split across reads.
        let keep = self.reply.len() - 1;
        if self.seen.len() > keep {
            self.seen.drain(..self.seen.len() - keep);
        }
        false
    }
}

/// Where an authoritative connection delivers its output.
#[derive(Debug, Clone)]
pub struct Attachment {
    /// Accepted frames, in arrival order.
    pub frames: mpsc::UnboundedSender<Frame>,
    /// Status of the owning service.
    pub status: ServiceStatus,
}

/// Per-connection settings.
#[derive(Clone)]
pub struct ConnectionOptions {
    /// Connection number, for logs.
    pub id: u64,
    /// Service name, for logs.
    pub service: Arc<str>,
    /// Message type filter.
    pub filter: FilterSpec,
    /// Read timeout and idle limit.
    pub timings: LinkTimings,
    /// Raw mirror of every read.
    pub audit: Option<Arc<dyn FrameAudit>>,
    /// Log every read and frame at debug level.
    pub verbose: bool,
}

struct Shared {
    id: u64,
    peer: SocketAddr,
    role: Role,
    established_at: Instant,
    handshake_ok: AtomicBool,
    attachment: Mutex<Option<Attachment>>,
    attached: Notify,
    outbound: mpsc::UnboundedSender<Bytes>,
    cancel: CancellationToken,
}

impl Shared {
    fn attachment(&self) -> Option<Attachment> {
        self.attachment
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Handle to a running connection task.
pub struct StationConnection {
    shared: Arc<Shared>,
    task: Option<JoinHandle<LinkEnd>>,
}

impl StationConnection {
    /// Spawns the connection task.
    ///
    /// `handshake == None` makes the link trusted from the start (dial role).
    /// The task also stops when `parent` is cancelled.
    pub fn spawn(
        stream: TcpStream,
        peer: SocketAddr,
        role: Role,
        options: ConnectionOptions,
        handshake: Option<Box<dyn Handshake>>,
        attachment: Option<Attachment>,
        parent: &CancellationToken,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            id: options.id,
            peer,
            role,
            established_at: Instant::now(),
            handshake_ok: AtomicBool::new(handshake.is_none()),
            attachment: Mutex::new(attachment),
            attached: Notify::new(),
            outbound: outbound_tx,
            cancel: parent.child_token(),
        });

        let link = Link {
            shared: Arc::clone(&shared),
            parser: FrameParser::new(options.filter.clone()),
            handshake,
            options,
        };
        let task = tokio::spawn(link.run(stream, outbound_rx));

        Self {
            shared,
            task: Some(task),
        }
    }

    /// Connection number.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Remote address.
    pub fn peer(&self) -> SocketAddr {
        self.shared.peer
    }

    /// Which side opened the socket.
    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// When the socket was handed to this connection.
    pub fn established_at(&self) -> Instant {
        self.shared.established_at
    }

    /// True once the peer is confirmed.
    pub fn handshake_complete(&self) -> bool {
        self.shared.handshake_ok.load(Ordering::Acquire)
    }

    /// Starts delivering frames and status to `attachment`.
    pub fn attach(&self, attachment: Attachment) {
        *self
            .shared
            .attachment
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(attachment);
        self.shared.attached.notify_one();
    }

    /// Stops delivering anything.
    pub fn detach(&self) {
        self.shared
            .attachment
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Queue for bytes to send to the station.
    pub fn outbound(&self) -> mpsc::UnboundedSender<Bytes> {
        self.shared.outbound.clone()
    }

    /// Requests the task to end. Does not wait.
    pub fn stop(&self) {
        self.shared.cancel.cancel();
    }

    /// True once the task has ended.
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Waits for the task to end. Cancel-safe; later calls return `Stopped`.
    pub async fn wait(&mut self) -> LinkEnd {
        let Some(task) = self.task.as_mut() else {
            return LinkEnd::Stopped;
        };
        let end = match task.await {
            Ok(end) => end,
            Err(e) => {
                log::error!("Station connection {} task failed: {}", self.shared.id, e);
                LinkEnd::Failed(std::io::ErrorKind::Other)
            }
        };
        self.task = None;
        end
    }
}

impl std::fmt::Debug for StationConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StationConnection")
            .field("id", &self.shared.id)
            .field("peer", &self.shared.peer)
            .field("role", &self.shared.role)
            .field("handshake_complete", &self.handshake_complete())
            .finish()
    }
}

/// State owned by the connection task.
struct Link {
    shared: Arc<Shared>,
    parser: FrameParser,
    handshake: Option<Box<dyn Handshake>>,
    options: ConnectionOptions,
}

impl Link {
    async fn run(mut self, stream: TcpStream, mut outbound_rx: mpsc::UnboundedReceiver<Bytes>) -> LinkEnd {
        let (mut reader, mut writer) = stream.into_split();
        let timings = self.options.timings.clone();

        if let Some(probe) = self.handshake.as_ref().and_then(|h| h.probe()) {
            if let Err(kind) = write_with_timeout(&mut writer, &probe, timings.write_timeout).await {
                return self.finish(LinkEnd::Failed(kind));
            }
        }

        let mut buf = vec![0u8; READ_CHUNK];
        let mut idle_reads = 0u32;

        let end = loop {
            tokio::select! {
                biased;
                _ = self.shared.cancel.cancelled() => break LinkEnd::Stopped,
                _ = self.shared.attached.notified() => self.drain_frames(),
                Some(first) = outbound_rx.recv() => {
                    let mut combined = BytesMut::from(&first[..]);
                    while let Ok(more) = outbound_rx.try_recv() {
                        combined.extend_from_slice(&more);
                    }
                    log::debug!("{}: sending {} bytes to station {}", self.options.service, combined.len(), self.shared.peer);
                    if let Err(kind) = write_with_timeout(&mut writer, &combined, timings.write_timeout).await {
                        break LinkEnd::Failed(kind);
                    }
                }
                read = timeout(timings.read_timeout, reader.read(&mut buf)) => match read {
                    Err(_) => {
                        idle_reads += 1;
                        if idle_reads >= timings.max_idle_reads {
                            break LinkEnd::Idle;
                        }
                    }
                    Ok(Ok(0)) => break LinkEnd::PeerClosed,
                    Ok(Ok(n)) => {
                        idle_reads = 0;
                        self.on_data(&buf[..n]);
                    }
                    Ok(Err(e)) => break LinkEnd::Failed(e.kind()),
                },
            }
        };

        let _ = writer.shutdown().await;
        self.finish(end)
    }

    fn finish(&self, end: LinkEnd) -> LinkEnd {
        log::info!(
            "{}: station connection {} from {} ended: {:?}",
            self.options.service,
            self.shared.id,
            self.shared.peer,
            end
        );
        end
    }

    fn on_data(&mut self, data: &[u8]) {
        if let Some(audit) = &self.options.audit {
            audit.record(data);
        }
        if self.options.verbose {
            log::debug!("{}: read {} bytes from {}", self.options.service, data.len(), self.shared.peer);
        }
        self.parser.append(data);

        if !self.shared.handshake_ok.load(Ordering::Acquire) {
            let confirmed = self.handshake.as_mut().map_or(true, |h| h.verify(data));
            if !confirmed {
                let dropped = self.parser.discard_oldest(PENDING_LIMIT);
                if dropped > 0 && self.options.verbose {
                    log::debug!("{}: unconfirmed candidate {}, dropped {} old bytes", self.options.service, self.shared.id, dropped);
                }
                return;
            }
            self.shared.handshake_ok.store(true, Ordering::Release);
            log::info!(
                "{}: station connection {} from {} completed handshake",
                self.options.service,
                self.shared.id,
                self.shared.peer
            );
        }

        self.drain_frames();
    }

    fn drain_frames(&mut self) {
        if !self.shared.handshake_ok.load(Ordering::Acquire) {
            return;
        }

        // Held per event so a concurrent detach stops output at the next frame.
        loop {
            let guard = self.shared.attachment.lock().unwrap_or_else(PoisonError::into_inner);
            // Detached links keep buffering until promoted or stopped.
            let Some(attachment) = guard.as_ref() else {
                return;
            };
            let Some(event) = self.parser.poll() else {
                return;
            };
            match event {
                ParseEvent::Frame(frame) => {
                    if self.options.verbose {
                        log::debug!("{}: frame type {} ({} bytes)", self.options.service, frame.msg_type(), frame.total_length());
                    }
                    attachment.status.report(Transition::Received);
                    if attachment.frames.send(frame).is_err() {
                        return;
                    }
                }
                ParseEvent::Filtered(frame) => {
                    if self.options.verbose {
                        log::debug!("{}: filtered frame type {}", self.options.service, frame.msg_type());
                    }
                    attachment.status.report(Transition::Received);
                }
                ParseEvent::Skipped(n) => {
                    log::debug!("{}: skipped {} bytes without preamble", self.options.service, n);
                }
                ParseEvent::Corrupt(reason) => {
                    log::debug!("{}: dropped corrupt frame start ({:?})", self.options.service, reason);
                }
            }
        }
    }
}

async fn write_with_timeout(
    writer: &mut OwnedWriteHalf,
    data: &[u8],
    limit: Duration,
) -> Result<(), std::io::ErrorKind> {
    match timeout(limit, writer.write_all(data)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.kind()),
        Err(_) => Err(std::io::ErrorKind::TimedOut),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rtcm::encode_frame;
    use crate::core::status::{StatusSink, StatusTracker, RtkState};
    use tokio::net::TcpListener;

    async fn socket_pair() -> (TcpStream, TcpStream, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        (client, server, peer)
    }

    fn options(timings: LinkTimings) -> ConnectionOptions {
        ConnectionOptions {
            id: 1,
            service: Arc::from("test"),
            filter: FilterSpec::Unfiltered,
            timings,
            audit: None,
            verbose: true,
        }
    }

    fn attachment(tracker: &Arc<StatusTracker>) -> (Attachment, mpsc::UnboundedReceiver<Frame>) {
        tracker.register("test");
        let (tx, rx) = mpsc::unbounded_channel();
        let status = ServiceStatus::new("test", tracker.clone());
        (Attachment { frames: tx, status }, rx)
    }

    fn frame(msg_type: u16) -> Bytes {
        encode_frame(&[(msg_type >> 4) as u8, ((msg_type & 0x0F) << 4) as u8, 1, 2, 3]).unwrap()
    }

    #[test]
    fn handshake_reply_split_across_reads_still_matches() {
        let mut hs = ProbeHandshake::new(&b"PING"[..], b"PONG".to_vec());
        assert_eq!(hs.probe(), Some(Bytes::from_static(b"PING")));
        assert!(!hs.verify(b"xxPO"));
        assert!(hs.verify(b"NGyy"));

        let mut hs = ProbeHandshake::new(Bytes::new(), b"OK".to_vec());
        assert_eq!(hs.probe(), None);
        assert!(!hs.verify(b"nope"));
    }

    #[tokio::test]
    async fn dial_link_forwards_frames_and_reports_received() {
        let (mut station, local, peer) = socket_pair().await;
        let tracker = Arc::new(StatusTracker::new());
        let (att, mut frames) = attachment(&tracker);
        let cancel = CancellationToken::new();
        let mut conn = StationConnection::spawn(
            local,
            peer,
            Role::Dial,
            options(LinkTimings::fast()),
            None,
            Some(att),
            &cancel,
        );
        assert!(conn.handshake_complete());

        let bytes = frame(1005);
        station.write_all(&bytes).await.unwrap();
        let got = frames.recv().await.unwrap();
        assert_eq!(got.raw(), &bytes);
        assert_eq!(tracker.get("test").unwrap().state, RtkState::Receiving);

        drop(station);
        assert_eq!(conn.wait().await, LinkEnd::PeerClosed);
    }

    #[tokio::test]
    async fn outbound_bytes_reach_station() {
        let (mut station, local, peer) = socket_pair().await;
        let cancel = CancellationToken::new();
        let mut conn = StationConnection::spawn(local, peer, Role::Dial, options(LinkTimings::fast()), None, None, &cancel);

        conn.outbound().send(Bytes::from_static(b"GGA,")).unwrap();
        conn.outbound().send(Bytes::from_static(b"1234")).unwrap();

        let mut buf = [0u8; 8];
        station.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"GGA,1234");

        cancel.cancel();
        assert_eq!(conn.wait().await, LinkEnd::Stopped);
        assert!(conn.is_finished());
    }

    #[tokio::test]
    async fn silent_link_goes_idle() {
        let (_station, local, peer) = socket_pair().await;
        let cancel = CancellationToken::new();
        let mut conn = StationConnection::spawn(local, peer, Role::Dial, options(LinkTimings::fast()), None, None, &cancel);
        assert_eq!(conn.wait().await, LinkEnd::Idle);
    }

    #[tokio::test]
    async fn candidate_holds_frames_until_handshake_and_attach() {
        let (mut station, local, peer) = socket_pair().await;
        let tracker = Arc::new(StatusTracker::new());
        let (att, mut frames) = attachment(&tracker);
        let cancel = CancellationToken::new();
        let hs: Box<dyn Handshake> = Box::new(ProbeHandshake::new(&b"?"[..], b"READY".to_vec()));
        let conn = StationConnection::spawn(local, peer, Role::Accept, options(LinkTimings::fast()), Some(hs), None, &cancel);

        let mut probe = [0u8; 1];
        station.read_exact(&mut probe).await.unwrap();
        assert_eq!(&probe, b"?");

        station.write_all(&frame(1077)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!conn.handshake_complete());

        station.write_all(b"READY").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(conn.handshake_complete());
        assert!(frames.try_recv().is_err(), "detached candidate must not emit");

        conn.attach(att);
        station.write_all(&frame(1005)).await.unwrap();
        assert_eq!(frames.recv().await.unwrap().msg_type(), 1077);
        assert_eq!(frames.recv().await.unwrap().msg_type(), 1005);

        conn.detach();
        conn.stop();
    }

    #[tokio::test]
    async fn detached_link_holds_frames_until_reattached() {
        let (mut station, local, peer) = socket_pair().await;
        let tracker = Arc::new(StatusTracker::new());
        let (att, mut frames) = attachment(&tracker);
        let cancel = CancellationToken::new();
        let conn = StationConnection::spawn(local, peer, Role::Dial, options(LinkTimings::fast()), None, Some(att.clone()), &cancel);

        station.write_all(&frame(1005)).await.unwrap();
        assert_eq!(frames.recv().await.unwrap().msg_type(), 1005);

        conn.detach();
        station.write_all(&frame(1077)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(frames.try_recv().is_err(), "detached link must not emit");

        conn.attach(att);
        assert_eq!(frames.recv().await.unwrap().msg_type(), 1077);
        conn.stop();
    }

    #[tokio::test]
    async fn unconfirmed_candidate_keeps_only_a_bounded_backlog() {
        let (mut station, local, peer) = socket_pair().await;
        let tracker = Arc::new(StatusTracker::new());
        let (att, mut frames) = attachment(&tracker);
        let cancel = CancellationToken::new();
        let timings = LinkTimings {
            read_timeout: Duration::from_secs(1),
            ..LinkTimings::fast()
        };
        let hs: Box<dyn Handshake> = Box::new(ProbeHandshake::new(&b"?"[..], b"READY".to_vec()));
        let conn = StationConnection::spawn(local, peer, Role::Accept, options(timings), Some(hs), None, &cancel);

        let mut probe = [0u8; 1];
        station.read_exact(&mut probe).await.unwrap();

        let one = frame(1077);
        let flood: Vec<u8> = one.iter().copied().cycle().take(one.len() * 8_000).collect();
        station.write_all(&flood).await.unwrap();
        station.write_all(&frame(1230)).await.unwrap();
        station.write_all(b"READY").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(conn.handshake_complete());

        conn.attach(att);
        let mut held = 0;
        loop {
            let got = tokio::time::timeout(Duration::from_secs(2), frames.recv()).await.unwrap().unwrap();
            if got.msg_type() == 1230 {
                break;
            }
            held += 1;
        }
        assert!(held > 0);
        assert!(held * one.len() <= PENDING_LIMIT + READ_CHUNK, "{} frames were kept", held);
        conn.stop();
    }
}
