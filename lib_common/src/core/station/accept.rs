//! Accept-mode manager: the station dials us; sockets race to become active.

use tokio::net::TcpListener;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::core::station::arbiter::{Arbiter, Candidate};
use crate::core::station::connection::{Attachment, Role, StationConnection};
use crate::core::station::{pause, ActiveOutbound, StationContext};
use crate::core::status::Transition;

impl Candidate for StationConnection {
    type Attachment = Attachment;

    fn handshake_complete(&self) -> bool {
        StationConnection::handshake_complete(self)
    }

    fn established_at(&self) -> Instant {
        StationConnection::established_at(self)
    }

    fn is_finished(&self) -> bool {
        StationConnection::is_finished(self)
    }

    fn attach(&self, attachment: Attachment) {
        StationConnection::attach(self, attachment);
    }

    fn detach(&self) {
        StationConnection::detach(self);
    }

    fn stop(&self) {
        StationConnection::stop(self);
    }
}

pub(crate) async fn run(
    listener: TcpListener,
    ctx: StationContext,
    active: ActiveOutbound,
    cancel: CancellationToken,
) {
    let status = ctx.attachment.status.clone();
    let mut arbiter: Arbiter<StationConnection> =
        Arbiter::new(ctx.attachment.clone(), ctx.timings.handshake_timeout);
    let mut ticker = interval(ctx.timings.arbitration_tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut next_id = 0u64;

    match listener.local_addr() {
        Ok(addr) => log::info!("{}: waiting for station on {}", ctx.service, addr),
        Err(_) => log::info!("{}: waiting for station", ctx.service),
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    next_id += 1;
                    log::info!("{}: station candidate {} from {}", ctx.service, next_id, peer);
                    let conn = StationConnection::spawn(
                        stream,
                        peer,
                        Role::Accept,
                        ctx.options(next_id),
                        Some((ctx.handshake)()),
                        None,
                        &cancel,
                    );
                    arbiter.add_candidate(conn);
                }
                Err(e) => {
                    log::warn!("{}: station accept failed: {}", ctx.service, e);
                    if !pause(&cancel, ctx.timings.arbitration_tick).await {
                        break;
                    }
                }
            },
            _ = ticker.tick() => {
                let outcome = arbiter.tick(Instant::now());
                if outcome.expired > 0 {
                    log::info!("{}: dropped {} candidate(s) without handshake", ctx.service, outcome.expired);
                }
                if outcome.active_lost {
                    active.clear();
                    status.report(Transition::Disconnected);
                }
                if outcome.promoted > 0 {
                    if let Some(conn) = arbiter.active() {
                        log::info!("{}: station connection {} from {} is now active", ctx.service, conn.id(), conn.peer());
                        active.set(conn.outbound());
                    }
                    status.report(Transition::Connected);
                }
            }
        }
    }

    active.clear();
    for mut conn in arbiter.drain() {
        conn.wait().await;
    }
    drop(listener);
    log::info!("{}: accept manager stopped", ctx.service);
}
