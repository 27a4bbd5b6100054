//! Dial-mode manager: the station listens, we keep one outbound connection.

use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::core::station::connection::{Role, StationConnection};
use crate::core::station::{pause, ActiveOutbound, StationContext};
use crate::core::status::Transition;

pub(crate) async fn run(
    address: String,
    port: u16,
    ctx: StationContext,
    active: ActiveOutbound,
    cancel: CancellationToken,
) {
    let status = ctx.attachment.status.clone();
    let mut next_id = 0u64;
    log::info!("{}: dialing station {}:{}", ctx.service, address, port);

    loop {
        let attempt = tokio::select! {
            _ = cancel.cancelled() => break,
            r = timeout(ctx.timings.connect_timeout, TcpStream::connect((address.as_str(), port))) => r,
        };

        let connected = match attempt {
            Ok(Ok(stream)) => stream.peer_addr().map(|peer| (stream, peer)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out")),
        };

        let (stream, peer) = match connected {
            Ok(pair) => pair,
            Err(e) => {
                log::warn!("{}: connect to {}:{} failed: {}", ctx.service, address, port, e);
                if pause(&cancel, ctx.timings.reconnect_backoff).await {
                    continue;
                }
                break;
            }
        };

        next_id += 1;
        log::info!("{}: connected to station {}", ctx.service, peer);
        status.report(Transition::Connected);

        let mut conn = StationConnection::spawn(
            stream,
            peer,
            Role::Dial,
            ctx.options(next_id),
            None,
            Some(ctx.attachment.clone()),
            &cancel,
        );
        active.set(conn.outbound());
        conn.wait().await;
        active.clear();
        status.report(Transition::Disconnected);

        if cancel.is_cancelled() {
            break;
        }
    }

    log::info!("{}: dial manager stopped", ctx.service);
}
