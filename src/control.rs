//! Per-connection dispatch of control events.
//!
//! A [`ConnectionContext`] bundles everything a session component needs to
//! act on behalf of one connection: its identity, its outbound event queue,
//! the shared registry, and the runtime settings. Component errors are
//! turned into their kind-specific error events here and nowhere else.

use std::sync::Arc;

use crate::config::SessionSettings;
use crate::portmon::{self, PortMonError};
use crate::protocol::{ClientEvent, EventSink, ServerEvent};
use crate::registry::{CleanupReport, ConnectionId, SessionRegistry};
use crate::shell::{self, ShellError};
use crate::watch::{self, WatchError};

#[derive(Clone)]
pub struct ConnectionContext {
    id: ConnectionId,
    sink: EventSink,
    registry: SessionRegistry,
    settings: Arc<SessionSettings>,
}

impl ConnectionContext {
    pub fn new(
        id: ConnectionId,
        sink: EventSink,
        registry: SessionRegistry,
        settings: Arc<SessionSettings>,
    ) -> Self {
        Self {
            id,
            sink,
            registry,
            settings,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn sink(&self) -> &EventSink {
        &self.sink
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Decode one text frame and dispatch it. Undecodable frames are
    /// answered with a generic `error` event.
    pub async fn handle_frame(&self, text: &str) {
        match serde_json::from_str::<ClientEvent>(text) {
            Ok(event) => self.dispatch(event).await,
            Err(e) => {
                tracing::debug!(conn = %self.id, error = %e, "undecodable client frame");
                self.sink
                    .emit(ServerEvent::Error {
                        message: format!("invalid event: {}", e),
                    })
                    .await;
            }
        }
    }

    /// Route a client event to its component.
    pub async fn dispatch(&self, event: ClientEvent) {
        tracing::debug!(conn = %self.id, event = event.name(), "client event");

        let failure = match event {
            ClientEvent::WatchStart { path } => watch::watch(self, &path)
                .await
                .err()
                .map(|e| watch_error_event(&e, &path)),
            ClientEvent::WatchStop { path } => watch::unwatch(self, &path)
                .await
                .err()
                .map(|e| watch_error_event(&e, &path)),
            ClientEvent::MonitorStart {
                protocol,
                interface,
                interval,
            } => portmon::start(self, &protocol, &interface, interval)
                .await
                .err()
                .map(|e| net_error_event(&e)),
            ClientEvent::MonitorStop {
                protocol,
                interface,
            } => portmon::stop(self, &protocol, &interface)
                .await
                .err()
                .map(|e| net_error_event(&e)),
            ClientEvent::ShellSpawn { command } => shell::spawn(self, command.as_deref())
                .await
                .err()
                .map(|e| shell_error_event(&e, None)),
            ClientEvent::ShellInput {
                session_id,
                text,
                encoding,
            } => shell::send_input(self, &session_id, &text, encoding)
                .await
                .err()
                .map(|e| shell_error_event(&e, Some(&session_id))),
            ClientEvent::ShellKill { session_id } => shell::kill(self, &session_id)
                .await
                .err()
                .map(|e| shell_error_event(&e, Some(&session_id))),
        };

        if let Some(event) = failure {
            tracing::debug!(conn = %self.id, event = event.name(), "request failed");
            self.sink.emit(event).await;
        }
    }

    /// Terminate everything this connection owns.
    pub fn cleanup(&self) -> CleanupReport {
        self.registry.cleanup_connection(self.id)
    }
}

fn watch_error_event(err: &WatchError, path: &str) -> ServerEvent {
    ServerEvent::WatchError {
        message: err.to_string(),
        path: Some(path.to_string()),
    }
}

fn net_error_event(err: &PortMonError) -> ServerEvent {
    ServerEvent::NetError {
        message: err.to_string(),
    }
}

/// Not-found and access-denied produce the same event shape, so a client
/// learns nothing about sessions it does not own.
fn shell_error_event(err: &ShellError, session_id: Option<&str>) -> ServerEvent {
    let message = match err {
        ShellError::NotFound(_) => "session not found".to_string(),
        ShellError::AccessDenied => "access denied".to_string(),
        other => other.to_string(),
    };
    ServerEvent::ShellError {
        message,
        session_id: session_id.map(str::to_string),
    }
}
