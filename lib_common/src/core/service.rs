//! # Relay Service
//!
//! One configured entry brought to life: a station manager, a downstream
//! listener with its dispatcher, and an optional control port, glued together
//! by a single actor task.
//!
//! The actor is the only place frames and admin commands meet, so a
//! `reset server` swaps the dispatcher between two frames and `list` always
//! sees the dispatcher frames are going to.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::configs::{Entry, HandshakeSpec};
use crate::core::command::{AdminCommand, CommandReply};
use crate::core::control::{CommandRequest, ControlServer};
use crate::core::error::RelayError;
use crate::core::rtcm::{FilterSpec, Frame};
use crate::core::server::DownstreamServer;
use crate::core::session::SessionTimings;
use crate::core::station::{
    AcceptAny, Attachment, Handshake, HandshakeFactory, LinkTimings, ProbeHandshake, StationContext,
    StationHandle,
};
use crate::core::status::{ServiceStatus, StatusSink, Transition};
use crate::loggers::{FrameAudit, RawAuditLog};

/// Shared collaborators every service is started with.
#[derive(Clone)]
pub struct ServiceDeps {
    /// Status table.
    pub status: Arc<dyn StatusSink>,
    /// Directory for `<service>_raw.log` files; raw audit is off without it.
    pub raw_log_dir: Option<PathBuf>,
    /// Station side timeouts.
    pub link_timings: LinkTimings,
    /// Downstream side timeouts and queue bound.
    pub session_timings: SessionTimings,
}

impl ServiceDeps {
    /// Default timings, no raw audit directory.
    pub fn new(status: Arc<dyn StatusSink>) -> Self {
        Self {
            status,
            raw_log_dir: None,
            link_timings: LinkTimings::default(),
            session_timings: SessionTimings::default(),
        }
    }
}

/// How a service actor ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceExit {
    /// Stop was requested.
    Stopped,
    /// Something the service cannot recover from by itself.
    Failed(String),
    /// The actor task panicked.
    Panicked,
}

/// Builds the candidate handshake for an entry.
pub fn handshake_factory(spec: Option<HandshakeSpec>) -> HandshakeFactory {
    match spec {
        None => Arc::new(|| Box::new(AcceptAny) as Box<dyn Handshake>),
        Some(spec) => {
            let probe = Bytes::from(spec.probe);
            let reply = spec.reply;
            Arc::new(move || Box::new(ProbeHandshake::new(probe.clone(), reply.clone())) as Box<dyn Handshake>)
        }
    }
}

/// Handle to a running service.
pub struct RtkService {
    name: String,
    cancel: CancellationToken,
    task: Option<JoinHandle<ServiceExit>>,
    downstream_addr: SocketAddr,
    station_addr: Option<SocketAddr>,
    control_addr: Option<SocketAddr>,
}

impl RtkService {
    /// Binds every listener of `entry` and starts the actor.
    ///
    /// On error nothing is left running.
    pub async fn start(entry: Entry, deps: ServiceDeps, parent: &CancellationToken) -> Result<Self, RelayError> {
        let cancel = parent.child_token();
        let name: Arc<str> = Arc::from(entry.name.as_str());
        let status = ServiceStatus::new(&entry.name, Arc::clone(&deps.status));

        let audit: Option<Arc<dyn FrameAudit>> = match (&deps.raw_log_dir, entry.enable_raw) {
            (Some(dir), true) => Some(Arc::new(RawAuditLog::open(dir, &entry.name)?)),
            _ => None,
        };

        let server = DownstreamServer::bind(entry.listen_port, deps.session_timings.clone(), &cancel).await?;

        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let ctx = StationContext {
            service: Arc::clone(&name),
            filter: FilterSpec::from_config(entry.filter.as_deref()),
            timings: deps.link_timings.clone(),
            attachment: Attachment {
                frames: frames_tx,
                status: status.clone(),
            },
            audit,
            verbose: entry.enable_log,
            handshake: handshake_factory(entry.handshake.clone()),
        };
        let station = match StationHandle::start(&entry.station, ctx, &cancel).await {
            Ok(station) => station,
            Err(e) => {
                server.stop().await;
                return Err(e);
            }
        };

        let (commands_tx, commands_rx) = mpsc::channel(16);
        let control = match entry.control_port {
            Some(port) => match ControlServer::bind(port, Arc::clone(&name), commands_tx, &cancel).await {
                Ok(control) => Some(control),
                Err(e) => {
                    station.stop().await;
                    server.stop().await;
                    return Err(e);
                }
            },
            None => None,
        };

        let downstream_addr = server.local_addr();
        let station_addr = station.local_addr();
        let control_addr = control.as_ref().map(ControlServer::local_addr);

        log::info!(
            "{}: service started, station {}, downstream {}",
            name,
            entry.station,
            downstream_addr
        );

        let actor = ServiceActor {
            name: Arc::clone(&name),
            listen_port: downstream_addr.port(),
            verbose: entry.enable_log,
            session_timings: deps.session_timings,
            status,
            server: Some(server),
            station: Some(station),
            control,
            frames_rx,
            commands_rx,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(actor.run());

        Ok(Self {
            name: entry.name,
            cancel,
            task: Some(task),
            downstream_addr,
            station_addr,
            control_addr,
        })
    }

    /// Service name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Downstream listener address. Stable across `reset server`.
    pub fn downstream_addr(&self) -> SocketAddr {
        self.downstream_addr
    }

    /// Station listener address (accept mode only).
    pub fn station_addr(&self) -> Option<SocketAddr> {
        self.station_addr
    }

    /// Control port address, if enabled.
    pub fn control_addr(&self) -> Option<SocketAddr> {
        self.control_addr
    }

    /// Waits for the actor to end. Cancel-safe; any leftover listener is
    /// cancelled once it has.
    pub async fn wait(&mut self) -> ServiceExit {
        let Some(task) = self.task.as_mut() else {
            return ServiceExit::Stopped;
        };
        let exit = match task.await {
            Ok(exit) => exit,
            Err(e) => {
                log::error!("{}: service task failed: {}", self.name, e);
                ServiceExit::Panicked
            }
        };
        self.task = None;
        self.cancel.cancel();
        exit
    }

    /// Requests shutdown and waits for it to complete.
    pub async fn stop(mut self) -> ServiceExit {
        self.cancel.cancel();
        self.wait().await
    }
}

struct ServiceActor {
    name: Arc<str>,
    listen_port: u16,
    verbose: bool,
    session_timings: SessionTimings,
    status: ServiceStatus,
    server: Option<DownstreamServer>,
    station: Option<StationHandle>,
    control: Option<ControlServer>,
    frames_rx: mpsc::UnboundedReceiver<Frame>,
    commands_rx: mpsc::Receiver<CommandRequest>,
    cancel: CancellationToken,
}

impl ServiceActor {
    async fn run(mut self) -> ServiceExit {
        let exit = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break ServiceExit::Stopped,
                Some(frame) = self.frames_rx.recv() => self.dispatch(frame),
                Some((command, responder)) = self.commands_rx.recv() => {
                    let reply = self.execute(command).await;
                    let _ = responder.send(reply);
                    if self.server.is_none() {
                        break ServiceExit::Failed("downstream listener could not be rebound".to_string());
                    }
                }
                _ = wait_station(&mut self.station) => {
                    break ServiceExit::Failed("station manager ended".to_string());
                }
            }
        };

        if let Some(control) = self.control.take() {
            control.stop().await;
        }
        if let Some(station) = self.station.take() {
            station.stop().await;
        }
        if let Some(server) = self.server.take() {
            server.stop().await;
        }

        match &exit {
            ServiceExit::Stopped => {
                self.status.report(Transition::Terminated);
                log::info!("{}: service stopped", self.name);
            }
            other => {
                self.status.report(Transition::Disconnected);
                log::error!("{}: service failed: {:?}", self.name, other);
            }
        }
        exit
    }

    fn dispatch(&self, frame: Frame) {
        let Some(server) = &self.server else {
            return;
        };
        let msg_type = frame.msg_type();
        let delivered = server.dispatcher().broadcast(frame.into_raw());
        if self.verbose {
            log::debug!("{}: frame type {} sent to {} client(s)", self.name, msg_type, delivered);
        }
    }

    async fn execute(&mut self, command: AdminCommand) -> CommandReply {
        match command {
            AdminCommand::ListSessions => CommandReply::Sessions(
                self.server
                    .as_ref()
                    .map(|server| server.dispatcher().sessions())
                    .unwrap_or_default(),
            ),
            AdminCommand::SendUpstream(bytes) => {
                let sent = match &self.station {
                    Some(station) => station.send(bytes),
                    None => Err(RelayError::NoActiveStation),
                };
                match sent {
                    Ok(n) => CommandReply::Queued(n),
                    Err(_) => CommandReply::NoActiveStation,
                }
            }
            AdminCommand::ResetDownstream => {
                log::info!("{}: resetting downstream listener", self.name);
                if let Some(old) = self.server.take() {
                    old.stop().await;
                }
                match DownstreamServer::bind(self.listen_port, self.session_timings.clone(), &self.cancel).await {
                    Ok(server) => {
                        self.server = Some(server);
                        CommandReply::DownstreamReset
                    }
                    Err(e) => CommandReply::ResetFailed(e.to_string()),
                }
            }
        }
    }
}

async fn wait_station(station: &mut Option<StationHandle>) {
    match station {
        Some(station) => station.wait().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::StationMode;
    use crate::core::rtcm::encode_frame;
    use crate::core::status::{RtkState, StatusTracker};
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpStream;

    fn entry(control: bool) -> Entry {
        Entry {
            name: "svc".to_string(),
            listen_port: 0,
            station: StationMode::Accept { port: 0 },
            control_port: control.then_some(0),
            filter: None,
            enable_log: true,
            enable_raw: false,
            handshake: None,
        }
    }

    fn deps(tracker: &Arc<StatusTracker>) -> ServiceDeps {
        tracker.register("svc");
        ServiceDeps {
            status: tracker.clone(),
            raw_log_dir: None,
            link_timings: LinkTimings {
                read_timeout: Duration::from_secs(1),
                ..LinkTimings::fast()
            },
            session_timings: SessionTimings::default(),
        }
    }

    /// Sends one command line and reads the complete reply.
    async fn request(control: &mut BufReader<TcpStream>, line: &str) -> String {
        control.get_mut().write_all(format!("{}\r\n", line).as_bytes()).await.unwrap();
        let mut reply = String::new();
        control.read_line(&mut reply).await.unwrap();
        if let Some(count) = reply.strip_prefix("client count: ") {
            let count: usize = count.trim().parse().unwrap();
            for _ in 0..count {
                control.read_line(&mut reply).await.unwrap();
            }
        }
        reply
    }

    async fn wait_for_clients(control: &mut BufReader<TcpStream>, expected: usize) {
        for _ in 0..50 {
            if request(control, "list").await.starts_with(&format!("client count: {}\r\n", expected)) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("never saw {} client(s)", expected);
    }

    #[tokio::test]
    async fn relays_frames_and_answers_commands() {
        let tracker = Arc::new(StatusTracker::new());
        let root = CancellationToken::new();
        let service = RtkService::start(entry(true), deps(&tracker), &root).await.unwrap();

        let control = TcpStream::connect(("127.0.0.1", service.control_addr().unwrap().port())).await.unwrap();
        let mut control = BufReader::new(control);
        assert_eq!(request(&mut control, "send:hi").await, "no active station connection\r\n");
        assert_eq!(request(&mut control, "status").await, "unknown command\r\n");

        let mut rover = TcpStream::connect(("127.0.0.1", service.downstream_addr().port())).await.unwrap();
        wait_for_clients(&mut control, 1).await;

        let mut station = TcpStream::connect(("127.0.0.1", service.station_addr().unwrap().port())).await.unwrap();
        let frame = encode_frame(&[0x3E, 0xD0, 0x01, 0x02]).unwrap();
        station.write_all(&frame).await.unwrap();

        let mut got = vec![0u8; frame.len()];
        rover.read_exact(&mut got).await.unwrap();
        assert_eq!(got, frame.to_vec());
        assert_eq!(tracker.get("svc").unwrap().state, RtkState::Receiving);

        assert_eq!(request(&mut control, "send:hi").await, "queued 2 bytes\r\n");
        let mut upstream = [0u8; 2];
        station.read_exact(&mut upstream).await.unwrap();
        assert_eq!(&upstream, b"hi");

        assert_eq!(request(&mut control, "reset server").await, "downstream listener reset\r\n");
        let mut buf = [0u8; 16];
        assert_eq!(rover.read(&mut buf).await.unwrap(), 0, "old sessions are closed by a reset");

        let mut rover = TcpStream::connect(("127.0.0.1", service.downstream_addr().port())).await.unwrap();
        wait_for_clients(&mut control, 1).await;
        station.write_all(&frame).await.unwrap();
        rover.read_exact(&mut got).await.unwrap();
        assert_eq!(got, frame.to_vec());

        assert_eq!(service.stop().await, ServiceExit::Stopped);
        assert_eq!(tracker.get("svc").unwrap().state, RtkState::Terminated);
    }

    #[tokio::test]
    async fn bind_failure_leaves_nothing_running() {
        let tracker = Arc::new(StatusTracker::new());
        let root = CancellationToken::new();
        let first = RtkService::start(entry(false), deps(&tracker), &root).await.unwrap();

        let mut clash = entry(false);
        clash.station = StationMode::Accept { port: first.downstream_addr().port() };
        let err = RtkService::start(clash, deps(&tracker), &root).await.err().unwrap();
        assert!(matches!(err, RelayError::Bind { what: "station", .. }));

        first.stop().await;
    }
}
