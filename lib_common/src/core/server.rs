//! # Downstream Listener
//!
//! Accepts consumers on the service's listen port and registers each one with
//! its own [`Dispatcher`]. A reset replaces the whole server, listener and
//! dispatcher together.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::dispatcher::Dispatcher;
use crate::core::error::RelayError;
use crate::core::session::SessionTimings;

/// Pause after a failed accept before trying again.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// A bound listener plus the dispatcher its clients join.
pub struct DownstreamServer {
    local_addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl DownstreamServer {
    /// Binds `port` on all interfaces and starts accepting. The listener also
    /// closes when `parent` is cancelled.
    pub async fn bind(port: u16, timings: SessionTimings, parent: &CancellationToken) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|source| RelayError::Bind { what: "downstream", port, source })?;
        let local_addr = listener.local_addr()?;
        let dispatcher = Arc::new(Dispatcher::new(timings));
        let cancel = parent.child_token();

        let task = tokio::spawn(accept_loop(listener, Arc::clone(&dispatcher), cancel.clone()));
        log::info!("Downstream listener on {}", local_addr);

        Ok(Self {
            local_addr,
            dispatcher,
            cancel,
            task,
        })
    }

    /// Bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The dispatcher that receives frames for this listener's clients.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Closes the listener, then every session.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            log::warn!("Downstream accept task failed: {}", e);
        }
        self.dispatcher.close_all().await;
        log::info!("Downstream listener on {} closed", self.local_addr);
    }
}

async fn accept_loop(listener: TcpListener, dispatcher: Arc<Dispatcher>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, address)) => {
                    dispatcher.register_client(stream, address);
                }
                Err(e) => {
                    log::warn!("Downstream accept failed: {}", e);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => {}
                    }
                }
            },
        }
    }
}
