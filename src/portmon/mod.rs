//! Periodic port-state monitors.
//!
//! A monitor samples the socket tables on an interval, diffs each sample
//! against the previous one and emits one batched `port-changes` event per
//! tick that saw a change. Monitors are keyed by
//! (connection, protocol, interface); starting a monitor under an existing
//! key stops the old loop, waits for it, and then replaces it.

pub mod diff;
pub mod sockets;

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::control::ConnectionContext;
use crate::protocol::{EventSink, PortChange, PortStatus, ServerEvent};
use crate::registry::{ConnectionId, RegistryError, Session, SessionKey};

pub use diff::{diff_ports, PortDelta};
pub use sockets::{SocketTableReader, ANY_INTERFACE};

#[derive(Error, Debug)]
pub enum PortMonError {
    #[error("invalid protocol: {0} (expected tcp, udp or both)")]
    InvalidProtocol(String),

    #[error("interface must not be empty")]
    EmptyInterface,

    #[error("parse error: {0}")]
    Parse(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("connection closed before the monitor started")]
    Revoked,

    #[error("port sample failed: {0}")]
    Sample(#[from] tokio::task::JoinError),
}

/// Which socket tables a monitor samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Both,
}

impl Protocol {
    /// File names under `<proc>/net/` read for this protocol.
    pub fn tables(self) -> &'static [&'static str] {
        match self {
            Protocol::Tcp => &["tcp"],
            Protocol::Udp => &["udp"],
            Protocol::Both => &["tcp", "udp"],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Both => "both",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = PortMonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "both" => Ok(Protocol::Both),
            other => Err(PortMonError::InvalidProtocol(other.to_string())),
        }
    }
}

/// Positive intervals are taken as seconds; anything else falls back to
/// `default`.
pub fn normalize_interval(interval: Option<i64>, default: Duration) -> Duration {
    match interval {
        Some(secs) if secs >= 1 => Duration::from_secs(secs as u64),
        _ => default,
    }
}

/// One running (or stopped) port monitor.
pub struct PortMonitor {
    owner: ConnectionId,
    protocol: Protocol,
    interface: String,
    interval: Duration,
    previous: Mutex<BTreeSet<u16>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PortMonitor {
    pub fn new(
        owner: ConnectionId,
        protocol: Protocol,
        interface: String,
        interval: Duration,
    ) -> Self {
        Self {
            owner,
            protocol,
            interface,
            interval,
            previous: Mutex::new(BTreeSet::new()),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    pub fn owner(&self) -> ConnectionId {
        self.owner
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// The most recent sample.
    pub fn previous(&self) -> BTreeSet<u16> {
        self.previous.lock().clone()
    }

    /// Signal the loop to stop. Idempotent; does not wait.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// True while the polling task exists and has not finished.
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Signal the loop to stop and wait until it has exited.
    pub async fn stop_and_wait(&self) {
        self.cancel.cancel();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "port monitor task failed");
            }
        }
    }

    fn spawn(self: &Arc<Self>, reader: SocketTableReader, sink: EventSink) {
        let monitor = self.clone();
        let handle = tokio::spawn(async move { monitor.run(reader, sink).await });
        *self.task.lock() = Some(handle);
    }

    async fn run(self: Arc<Self>, reader: SocketTableReader, sink: EventSink) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Some(event) = self.tick(&reader).await {
                        if !sink.emit(event).await {
                            tracing::debug!(conn = %self.owner, "connection gone, stopping port monitor");
                            break;
                        }
                    }
                }
            }
        }

        tracing::debug!(
            conn = %self.owner,
            protocol = %self.protocol,
            interface = %self.interface,
            "port monitor stopped"
        );
    }

    /// Take one sample, replace the previous one, and build the change event
    /// if anything moved.
    async fn tick(&self, reader: &SocketTableReader) -> Option<ServerEvent> {
        let current = match reader.sample_blocking(self.protocol, &self.interface).await {
            Ok(current) => current,
            Err(e) => {
                tracing::warn!(conn = %self.owner, error = %e, "port sample failed, skipping tick");
                return None;
            }
        };
        let delta = {
            let mut previous = self.previous.lock();
            let delta = diff_ports(&previous, &current);
            *previous = current;
            delta
        };
        if delta.is_empty() {
            return None;
        }

        let timestamp = Utc::now();
        let change = |port, status| PortChange {
            port,
            status,
            protocol: self.protocol,
            interface: self.interface.clone(),
            timestamp,
        };
        let changes = delta
            .opened
            .iter()
            .map(|&port| change(port, PortStatus::Opened))
            .chain(delta.closed.iter().map(|&port| change(port, PortStatus::Closed)))
            .collect();

        tracing::debug!(
            conn = %self.owner,
            opened = ?delta.opened,
            closed = ?delta.closed,
            "port changes detected"
        );
        Some(ServerEvent::PortChanges { changes, timestamp })
    }
}

/// Start a monitor for this connection, replacing any existing monitor with
/// the same protocol and interface.
///
/// Arguments are validated before anything is touched, so an invalid request
/// leaves an existing monitor running.
pub async fn start(
    ctx: &ConnectionContext,
    protocol: &str,
    interface: &str,
    interval: Option<i64>,
) -> Result<Arc<PortMonitor>, PortMonError> {
    let protocol: Protocol = protocol.parse()?;
    if interface.is_empty() {
        return Err(PortMonError::EmptyInterface);
    }
    let interval = normalize_interval(interval, ctx.settings().monitor_interval);

    let key = SessionKey::Monitor {
        owner: ctx.id(),
        protocol,
        interface: interface.to_string(),
    };
    let (reservation, evicted) = ctx.registry().create_replacing(ctx.id(), key)?;
    match evicted {
        Some(Session::Monitor(old)) => {
            old.stop_and_wait().await;
            tracing::debug!(conn = %ctx.id(), %protocol, interface, "replaced port monitor");
        }
        Some(other) => {
            if let Err(e) = other.terminate() {
                tracing::warn!(conn = %ctx.id(), error = %e, "failed to terminate evicted session");
            }
        }
        None => {}
    }

    let reader = SocketTableReader::new(ctx.settings().proc_root.clone());
    let monitor = Arc::new(PortMonitor::new(
        ctx.id(),
        protocol,
        interface.to_string(),
        interval,
    ));
    *monitor.previous.lock() = reader.sample_blocking(protocol, interface).await?;

    if reservation.commit(Session::Monitor(monitor.clone())).is_err() {
        return Err(PortMonError::Revoked);
    }

    tracing::info!(
        conn = %ctx.id(),
        %protocol,
        interface,
        interval_secs = interval.as_secs(),
        initial_ports = monitor.previous.lock().len(),
        "port monitor started"
    );
    ctx.sink()
        .emit(ServerEvent::MonitorStarted {
            protocol,
            interface: interface.to_string(),
            interval: interval.as_secs(),
            timestamp: Utc::now(),
        })
        .await;
    monitor.spawn(reader, ctx.sink().clone());
    Ok(monitor)
}

/// Stop this connection's monitor for the protocol and interface.
///
/// Returns `Ok(false)` when there was nothing to stop.
pub async fn stop(
    ctx: &ConnectionContext,
    protocol: &str,
    interface: &str,
) -> Result<bool, PortMonError> {
    let protocol: Protocol = protocol.parse()?;
    let key = SessionKey::Monitor {
        owner: ctx.id(),
        protocol,
        interface: interface.to_string(),
    };

    match ctx.registry().remove(&key) {
        Some(Session::Monitor(monitor)) => {
            monitor.stop_and_wait().await;
            tracing::info!(conn = %ctx.id(), %protocol, interface, "port monitor stopped by client");
            ctx.sink()
                .emit(ServerEvent::MonitorStopped {
                    protocol,
                    interface: interface.to_string(),
                    timestamp: Utc::now(),
                })
                .await;
            Ok(true)
        }
        Some(other) => {
            if let Err(e) = other.terminate() {
                tracing::warn!(conn = %ctx.id(), error = %e, "failed to terminate session");
            }
            Ok(true)
        }
        None => {
            tracing::debug!(conn = %ctx.id(), %protocol, interface, "no port monitor to stop");
            Ok(false)
        }
    }
}
