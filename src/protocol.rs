//! Wire protocol for the control socket.
//!
//! Every frame is a JSON text message of the form
//! `{"event": "<name>", "data": {...}}`. Both directions are closed enums so
//! an unknown event name is a decode error rather than a silently ignored
//! string.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::portmon::Protocol;

/// Events sent by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    WatchStart {
        path: String,
    },
    WatchStop {
        path: String,
    },
    MonitorStart {
        protocol: String,
        interface: String,
        #[serde(default)]
        interval: Option<i64>,
    },
    MonitorStop {
        protocol: String,
        interface: String,
    },
    ShellSpawn {
        #[serde(default)]
        command: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ShellInput {
        session_id: String,
        text: String,
        #[serde(default)]
        encoding: InputEncoding,
    },
    #[serde(rename_all = "camelCase")]
    ShellKill {
        session_id: String,
    },
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::WatchStart { .. } => "watch-start",
            ClientEvent::WatchStop { .. } => "watch-stop",
            ClientEvent::MonitorStart { .. } => "monitor-start",
            ClientEvent::MonitorStop { .. } => "monitor-stop",
            ClientEvent::ShellSpawn { .. } => "shell-spawn",
            ClientEvent::ShellInput { .. } => "shell-input",
            ClientEvent::ShellKill { .. } => "shell-kill",
        }
    }
}

/// How the `text` of a `shell-input` event is encoded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputEncoding {
    #[default]
    Utf8,
    Base64,
}

/// Whether a port appeared or disappeared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortStatus {
    Opened,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortChange {
    pub port: u16,
    pub status: PortStatus,
    pub protocol: Protocol,
    pub interface: String,
    pub timestamp: DateTime<Utc>,
}

/// Events sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    WatchConfirmed {
        path: String,
        timestamp: DateTime<Utc>,
    },
    WatchStopped {
        path: String,
        timestamp: DateTime<Utc>,
    },
    WatchChange {
        path: String,
        operation: String,
        timestamp: DateTime<Utc>,
    },
    WatchError {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
    MonitorStarted {
        protocol: Protocol,
        interface: String,
        interval: u64,
        timestamp: DateTime<Utc>,
    },
    MonitorStopped {
        protocol: Protocol,
        interface: String,
        timestamp: DateTime<Utc>,
    },
    PortChanges {
        changes: Vec<PortChange>,
        timestamp: DateTime<Utc>,
    },
    NetError {
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    ShellSpawned {
        session_id: String,
        command: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    ShellOutput {
        session_id: String,
        data: String,
        stream: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    ShellExit {
        session_id: String,
        exit_code: i32,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    ShellKilled {
        session_id: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    ShellError {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    /// A frame that could not be decoded as a [`ClientEvent`].
    Error {
        message: String,
    },
}

impl ServerEvent {
    /// The wire name of this event, as it appears in the `event` field.
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::WatchConfirmed { .. } => "watch-confirmed",
            ServerEvent::WatchStopped { .. } => "watch-stopped",
            ServerEvent::WatchChange { .. } => "watch-change",
            ServerEvent::WatchError { .. } => "watch-error",
            ServerEvent::MonitorStarted { .. } => "monitor-started",
            ServerEvent::MonitorStopped { .. } => "monitor-stopped",
            ServerEvent::PortChanges { .. } => "port-changes",
            ServerEvent::NetError { .. } => "net-error",
            ServerEvent::ShellSpawned { .. } => "shell-spawned",
            ServerEvent::ShellOutput { .. } => "shell-output",
            ServerEvent::ShellExit { .. } => "shell-exit",
            ServerEvent::ShellKilled { .. } => "shell-killed",
            ServerEvent::ShellError { .. } => "shell-error",
            ServerEvent::Error { .. } => "error",
        }
    }
}

/// Outbound half of one connection's event queue.
///
/// Cloned into every activity the connection owns. Events from a single
/// activity arrive in the order they were emitted; there is no ordering
/// between activities. Sends fail only once the connection's writer is gone.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<ServerEvent>,
}

impl EventSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Queue an event. Returns `false` if the connection has gone away.
    pub async fn emit(&self, event: ServerEvent) -> bool {
        self.tx.send(event).await.is_ok()
    }

    /// Queue an event from a blocking thread (PTY reader, notify callback).
    pub fn blocking_emit(&self, event: ServerEvent) -> bool {
        self.tx.blocking_send(event).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
