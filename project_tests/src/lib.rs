//! Loopback helpers shared by the end-to-end scenarios under `tests/`.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

use lib_common::core::rtcm::{encode_frame, HEADER_SIZE, TRAILER_SIZE};

/// Longest a scenario waits for any single condition.
pub const PATIENCE: Duration = Duration::from_secs(5);

/// A valid RTCM3 frame of type `msg_type` followed by `body`.
pub fn frame(msg_type: u16, body: &[u8]) -> Bytes {
    let mut payload = vec![(msg_type >> 4) as u8, ((msg_type & 0x0F) << 4) as u8];
    payload.extend_from_slice(body);
    encode_frame(&payload).expect("payload fits in one frame")
}

/// Connects to the loopback side of a service socket bound on `0.0.0.0`.
pub async fn connect(addr: SocketAddr) -> TcpStream {
    TcpStream::connect(("127.0.0.1", addr.port()))
        .await
        .expect("service socket accepts")
}

/// Connects a rover and gives the downstream listener time to register it,
/// so the next broadcast includes it.
pub async fn connect_rover(addr: SocketAddr) -> TcpStream {
    let rover = connect(addr).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    rover
}

/// Reads exactly one frame, header to CRC, from `stream`.
pub async fn read_frame(stream: &mut TcpStream) -> Vec<u8> {
    let mut header = [0u8; HEADER_SIZE];
    tokio::time::timeout(PATIENCE, stream.read_exact(&mut header))
        .await
        .expect("frame arrives in time")
        .expect("stream stays open");
    let length = (usize::from(header[1] & 0x03) << 8) | usize::from(header[2]);

    let mut frame = header.to_vec();
    frame.resize(HEADER_SIZE + length + TRAILER_SIZE, 0);
    stream
        .read_exact(&mut frame[HEADER_SIZE..])
        .await
        .expect("frame body arrives");
    frame
}

/// Polls `check` every 20 ms until it holds or [`PATIENCE`] runs out.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + PATIENCE;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
