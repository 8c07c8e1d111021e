//! Recursive filesystem watches.
//!
//! Every directory under the watched path is registered individually
//! (non-recursive) so that a failure anywhere aborts the whole watch instead
//! of producing a partial one. Notifications are funnelled from the notify
//! callback thread into a channel and forwarded by one task per watch.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::control::ConnectionContext;
use crate::protocol::{EventSink, ServerEvent};
use crate::registry::{ConnectionId, RegistryError, Session, SessionKey};

#[derive(Error, Debug)]
pub enum WatchError {
    #[error("path must not be empty")]
    EmptyPath,

    #[error("already watching {0}")]
    AlreadyWatching(String),

    #[error("not watching {0}")]
    NotWatched(String),

    #[error("cannot watch {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot watch {path}: {source}")]
    Notify {
        path: String,
        #[source]
        source: notify::Error,
    },

    #[error("cannot walk {path}: {source}")]
    Walk {
        path: String,
        #[source]
        source: walkdir::Error,
    },

    #[error(transparent)]
    Registry(RegistryError),

    #[error("connection closed before the watch started")]
    Revoked,

    #[error("watch task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

type NotifyResult = notify::Result<Event>;

/// One active watch of a path for one connection.
pub struct WatchSession {
    owner: ConnectionId,
    path: String,
    root: PathBuf,
    watcher: Mutex<Option<RecommendedWatcher>>,
    cancel: CancellationToken,
}

impl WatchSession {
    /// A watch with no underlying watcher, for registry bookkeeping tests.
    #[cfg(test)]
    pub(crate) fn detached(owner: ConnectionId, path: &str) -> Self {
        Self {
            owner,
            path: path.to_string(),
            root: PathBuf::from(path),
            watcher: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    pub fn owner(&self) -> ConnectionId {
        self.owner
    }

    /// The path as the client requested it.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Stop forwarding and drop the watcher. Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
        let watcher = self.watcher.lock().take();
        if watcher.is_some() {
            tracing::debug!(conn = %self.owner, path = %self.path, "watch closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Register a directory created after the watch started, along with
    /// anything already inside it.
    fn add_tree(&self, dir: &Path) {
        let mut guard = self.watcher.lock();
        let Some(watcher) = guard.as_mut() else {
            return;
        };
        for entry in WalkDir::new(dir).into_iter().filter_map(Result::ok) {
            if entry.file_type().is_dir() {
                if let Err(e) = watcher.watch(entry.path(), RecursiveMode::NonRecursive) {
                    tracing::debug!(path = %entry.path().display(), error = %e, "failed to watch new directory");
                }
            }
        }
    }
}

/// Change operation name for a notify event, or `None` for events that are
/// not forwarded.
pub fn operation_name(kind: &EventKind) -> Option<&'static str> {
    match kind {
        EventKind::Create(_) => Some("CREATE"),
        EventKind::Remove(_) => Some("REMOVE"),
        EventKind::Modify(ModifyKind::Name(_)) => Some("RENAME"),
        EventKind::Modify(ModifyKind::Metadata(_)) => Some("CHMOD"),
        EventKind::Modify(_) => Some("WRITE"),
        EventKind::Access(_) => None,
        EventKind::Any | EventKind::Other => Some("OTHER"),
    }
}

/// Build a watcher with every directory under `path` registered.
fn open_watcher(
    path: &str,
    tx: mpsc::UnboundedSender<NotifyResult>,
) -> Result<(RecommendedWatcher, PathBuf), WatchError> {
    let root = std::fs::canonicalize(path).map_err(|source| WatchError::Io {
        path: path.to_string(),
        source,
    })?;

    let mut watcher = notify::recommended_watcher(move |res: NotifyResult| {
        let _ = tx.send(res);
    })
    .map_err(|source| WatchError::Notify {
        path: path.to_string(),
        source,
    })?;

    if !root.is_dir() {
        watcher
            .watch(&root, RecursiveMode::NonRecursive)
            .map_err(|source| WatchError::Notify {
                path: root.display().to_string(),
                source,
            })?;
        return Ok((watcher, root));
    }

    let mut directories = 0usize;
    for entry in WalkDir::new(&root) {
        let entry = entry.map_err(|source| WatchError::Walk {
            path: path.to_string(),
            source,
        })?;
        if entry.file_type().is_dir() {
            watcher
                .watch(entry.path(), RecursiveMode::NonRecursive)
                .map_err(|source| WatchError::Notify {
                    path: entry.path().display().to_string(),
                    source,
                })?;
            directories += 1;
        }
    }
    tracing::debug!(path = %root.display(), directories, "registered watch directories");

    Ok((watcher, root))
}

async fn forward(
    session: Arc<WatchSession>,
    mut rx: mpsc::UnboundedReceiver<NotifyResult>,
    sink: EventSink,
) {
    'forward: loop {
        tokio::select! {
            biased;
            _ = session.cancel.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(Ok(event)) => {
                    let Some(operation) = operation_name(&event.kind) else {
                        continue;
                    };
                    if matches!(event.kind, EventKind::Create(_)) {
                        for path in event.paths.iter().filter(|p| p.is_dir()) {
                            session.add_tree(path);
                        }
                    }
                    for path in event.paths {
                        let change = ServerEvent::WatchChange {
                            path: path.display().to_string(),
                            operation: operation.to_string(),
                            timestamp: Utc::now(),
                        };
                        if !sink.emit(change).await {
                            break 'forward;
                        }
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!(conn = %session.owner, path = %session.path, error = %e, "watcher error");
                    let error = ServerEvent::WatchError {
                        message: e.to_string(),
                        path: Some(session.path.clone()),
                    };
                    if !sink.emit(error).await {
                        break;
                    }
                }
                None => break,
            }
        }
    }
    tracing::debug!(conn = %session.owner, path = %session.path, "watch forwarder finished");
}

/// Start watching `path` for this connection.
///
/// On any registration failure nothing stays registered: the partially
/// built watcher is dropped and the reservation released.
pub async fn watch(ctx: &ConnectionContext, path: &str) -> Result<Arc<WatchSession>, WatchError> {
    if path.is_empty() {
        return Err(WatchError::EmptyPath);
    }

    let key = SessionKey::Watch {
        owner: ctx.id(),
        path: path.to_string(),
    };
    let reservation = ctx.registry().create(ctx.id(), key).map_err(|e| match e {
        RegistryError::AlreadyExists(_) => WatchError::AlreadyWatching(path.to_string()),
        other => WatchError::Registry(other),
    })?;

    let (tx, rx) = mpsc::unbounded_channel();
    let requested = path.to_string();
    let (watcher, root) =
        tokio::task::spawn_blocking(move || open_watcher(&requested, tx)).await??;

    let session = Arc::new(WatchSession {
        owner: ctx.id(),
        path: path.to_string(),
        root,
        watcher: Mutex::new(Some(watcher)),
        cancel: CancellationToken::new(),
    });

    if reservation.commit(Session::Watch(session.clone())).is_err() {
        session.close();
        return Err(WatchError::Revoked);
    }

    tracing::info!(conn = %ctx.id(), path, root = %session.root.display(), "watch started");
    ctx.sink()
        .emit(ServerEvent::WatchConfirmed {
            path: path.to_string(),
            timestamp: Utc::now(),
        })
        .await;
    tokio::spawn(forward(session.clone(), rx, ctx.sink().clone()));
    Ok(session)
}

/// Stop this connection's watch of `path`.
pub async fn unwatch(ctx: &ConnectionContext, path: &str) -> Result<(), WatchError> {
    let key = SessionKey::Watch {
        owner: ctx.id(),
        path: path.to_string(),
    };
    match ctx.registry().remove(&key) {
        Some(session) => {
            if let Err(e) = session.terminate() {
                tracing::warn!(conn = %ctx.id(), path, error = %e, "failed to close watch");
            }
            tracing::info!(conn = %ctx.id(), path, "watch stopped");
            ctx.sink()
                .emit(ServerEvent::WatchStopped {
                    path: path.to_string(),
                    timestamp: Utc::now(),
                })
                .await;
            Ok(())
        }
        None => Err(WatchError::NotWatched(path.to_string())),
    }
}
