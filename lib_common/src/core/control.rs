//! # Control Port
//!
//! Plain TCP, one command per line. Each parsed command is handed to the
//! service actor together with a oneshot responder; the rendered reply is
//! written back on the same connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::core::command::{AdminCommand, CommandReply};
use crate::core::error::RelayError;

/// Longest accepted control line.
const MAX_LINE: usize = 4096;
/// Bound on waiting for the service to answer a command.
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// A command plus the channel its reply goes back on.
pub type CommandRequest = (AdminCommand, oneshot::Sender<CommandReply>);

/// Listener of one service's control port.
pub struct ControlServer {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ControlServer {
    /// Binds `port` and starts serving operators.
    pub async fn bind(
        port: u16,
        service: Arc<str>,
        commands: mpsc::Sender<CommandRequest>,
        parent: &CancellationToken,
    ) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|source| RelayError::Bind { what: "control", port, source })?;
        let local_addr = listener.local_addr()?;
        let cancel = parent.child_token();
        log::info!("{}: control port on {}", service, local_addr);

        let task = tokio::spawn(accept_loop(listener, service, commands, cancel.clone()));
        Ok(Self {
            local_addr,
            cancel,
            task,
        })
    }

    /// Bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Closes the listener and every operator connection.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            log::warn!("Control accept task failed: {}", e);
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    service: Arc<str>,
    commands: mpsc::Sender<CommandRequest>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    log::info!("{}: operator connected from {}", service, peer);
                    tokio::spawn(serve_operator(
                        stream,
                        peer,
                        Arc::clone(&service),
                        commands.clone(),
                        cancel.child_token(),
                    ));
                }
                Err(e) => log::warn!("{}: control accept failed: {}", service, e),
            },
        }
    }
}

async fn serve_operator(
    stream: TcpStream,
    peer: SocketAddr,
    service: Arc<str>,
    commands: mpsc::Sender<CommandRequest>,
    cancel: CancellationToken,
) {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();

    loop {
        line.clear();
        let mut limited = (&mut reader).take(MAX_LINE as u64 + 1);
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            r = limited.read_until(b'\n', &mut line) => r,
        };
        match read {
            Ok(0) => break,
            Ok(_) if line.len() > MAX_LINE && line.last() != Some(&b'\n') => {
                log::warn!("{}: control line from {} too long, closing", service, peer);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                log::debug!("{}: control read from {} failed: {}", service, peer, e);
                break;
            }
        }

        while matches!(line.last(), Some(b'\n' | b'\r')) {
            line.pop();
        }
        if line.is_empty() {
            continue;
        }

        let reply = match AdminCommand::parse(&line) {
            None => CommandReply::Unknown,
            Some(command) => {
                log::info!("{}: control command from {}: {:?}", service, peer, command);
                let (tx, rx) = oneshot::channel();
                if commands.send((command, tx)).await.is_err() {
                    break;
                }
                match timeout(REPLY_TIMEOUT, rx).await {
                    Ok(Ok(reply)) => reply,
                    _ => break,
                }
            }
        };

        if writer.write_all(reply.to_string().as_bytes()).await.is_err() {
            break;
        }
    }

    log::info!("{}: operator {} disconnected", service, peer);
}
