//! Directory of every live session, of every kind, across all connections.
//!
//! The registry owns the only shared index: one `RwLock` around the key map
//! and the per-connection key sets. Callers never see the lock; they get a
//! small capability API (reserve, commit, lookup, authorize, remove, cleanup)
//! and each session guards its own state with its own lock.
//!
//! Creation is two-phase. [`SessionRegistry::create`] atomically reserves the
//! key; the caller then acquires the OS resource and either commits the
//! session or drops the [`Reservation`], which frees the key again. A slot
//! that is only reserved is invisible to [`SessionRegistry::lookup`].

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use uuid::Uuid;

use crate::portmon::{PortMonitor, Protocol};
use crate::shell::ShellSession;
use crate::watch::WatchSession;

/// Identity of one authenticated control connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of a shell session, generated at creation.
pub type SessionId = Uuid;

/// Registry-wide unique key of a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SessionKey {
    Shell(SessionId),
    Watch {
        owner: ConnectionId,
        path: String,
    },
    Monitor {
        owner: ConnectionId,
        protocol: Protocol,
        interface: String,
    },
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionKey::Shell(id) => write!(f, "shell:{}", id),
            SessionKey::Watch { path, .. } => write!(f, "watch:{}", path),
            SessionKey::Monitor {
                protocol, interface, ..
            } => write!(f, "monitor:{}:{}", protocol, interface),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("session already exists: {0}")]
    AlreadyExists(String),

    #[error("session not found: {0}")]
    NotFound(String),

    #[error("access denied")]
    AccessDenied,
}

/// A registered session of any kind.
#[derive(Clone)]
pub enum Session {
    Shell(Arc<ShellSession>),
    Watch(Arc<WatchSession>),
    Monitor(Arc<PortMonitor>),
}

impl Session {
    pub fn owner(&self) -> ConnectionId {
        match self {
            Session::Shell(s) => s.owner(),
            Session::Watch(w) => w.owner(),
            Session::Monitor(m) => m.owner(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Session::Shell(_) => "shell",
            Session::Watch(_) => "watch",
            Session::Monitor(_) => "monitor",
        }
    }

    /// Run this session's termination procedure.
    ///
    /// Shells are signalled and have their terminal released, watches are
    /// closed and monitors are cancelled. Every path is idempotent.
    pub fn terminate(&self) -> std::io::Result<()> {
        match self {
            Session::Shell(s) => s.kill(),
            Session::Watch(w) => {
                w.close();
                Ok(())
            }
            Session::Monitor(m) => {
                m.stop();
                Ok(())
            }
        }
    }

    fn same(&self, other: &Session) -> bool {
        match (self, other) {
            (Session::Shell(a), Session::Shell(b)) => Arc::ptr_eq(a, b),
            (Session::Watch(a), Session::Watch(b)) => Arc::ptr_eq(a, b),
            (Session::Monitor(a), Session::Monitor(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("kind", &self.kind())
            .field("owner", &self.owner())
            .finish()
    }
}

enum Slot {
    Reserved(ConnectionId),
    Live(Session),
}

impl Slot {
    fn owner(&self) -> ConnectionId {
        match self {
            Slot::Reserved(owner) => *owner,
            Slot::Live(session) => session.owner(),
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    slots: HashMap<SessionKey, Slot>,
    by_connection: HashMap<ConnectionId, HashSet<SessionKey>>,
}

impl RegistryInner {
    fn insert(&mut self, key: SessionKey, slot: Slot) {
        self.by_connection
            .entry(slot.owner())
            .or_default()
            .insert(key.clone());
        self.slots.insert(key, slot);
    }

    fn take(&mut self, key: &SessionKey) -> Option<Slot> {
        let slot = self.slots.remove(key)?;
        let owner = slot.owner();
        if let Some(keys) = self.by_connection.get_mut(&owner) {
            keys.remove(key);
            if keys.is_empty() {
                self.by_connection.remove(&owner);
            }
        }
        Some(slot)
    }
}

/// Outcome of [`SessionRegistry::cleanup_connection`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupReport {
    pub terminated: usize,
    pub failed: usize,
}

/// Thread-safe registry of all sessions.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `key` for `owner`.
    ///
    /// Fails with `AlreadyExists` if the key is reserved or live.
    pub fn create(
        &self,
        owner: ConnectionId,
        key: SessionKey,
    ) -> Result<Reservation, RegistryError> {
        let mut inner = self.inner.write();
        if inner.slots.contains_key(&key) {
            return Err(RegistryError::AlreadyExists(key.to_string()));
        }
        inner.insert(key.clone(), Slot::Reserved(owner));
        Ok(Reservation::new(self.clone(), owner, key))
    }

    /// Reserve `key` for `owner`, evicting a live session under the same key.
    ///
    /// The evicted session is handed back for the caller to terminate. A key
    /// that is only reserved (another creation in flight) still fails with
    /// `AlreadyExists`.
    pub fn create_replacing(
        &self,
        owner: ConnectionId,
        key: SessionKey,
    ) -> Result<(Reservation, Option<Session>), RegistryError> {
        let mut inner = self.inner.write();
        let live = inner.slots.get(&key).map(|slot| matches!(slot, Slot::Live(_)));
        let evicted = match live {
            None => None,
            Some(false) => return Err(RegistryError::AlreadyExists(key.to_string())),
            Some(true) => match inner.take(&key) {
                Some(Slot::Live(session)) => Some(session),
                _ => None,
            },
        };
        inner.insert(key.clone(), Slot::Reserved(owner));
        Ok((Reservation::new(self.clone(), owner, key), evicted))
    }

    /// Find a live session by key. Reserved slots are not visible.
    pub fn lookup(&self, key: &SessionKey) -> Result<Session, RegistryError> {
        match self.inner.read().slots.get(key) {
            Some(Slot::Live(session)) => Ok(session.clone()),
            _ => Err(RegistryError::NotFound(key.to_string())),
        }
    }

    /// Deny unless `connection` owns `session`.
    pub fn authorize(
        &self,
        session: &Session,
        connection: ConnectionId,
    ) -> Result<(), RegistryError> {
        if session.owner() == connection {
            Ok(())
        } else {
            Err(RegistryError::AccessDenied)
        }
    }

    /// [`lookup`](Self::lookup) followed by [`authorize`](Self::authorize).
    pub fn lookup_owned(
        &self,
        key: &SessionKey,
        connection: ConnectionId,
    ) -> Result<Session, RegistryError> {
        let session = self.lookup(key)?;
        self.authorize(&session, connection)?;
        Ok(session)
    }

    /// Remove a live session. Removing an absent key is a no-op.
    pub fn remove(&self, key: &SessionKey) -> Option<Session> {
        let mut inner = self.inner.write();
        if !matches!(inner.slots.get(key), Some(Slot::Live(_))) {
            return None;
        }
        match inner.take(key) {
            Some(Slot::Live(session)) => Some(session),
            _ => None,
        }
    }

    /// Remove and terminate every session owned by `connection`.
    ///
    /// In-flight reservations are revoked so their eventual commit fails.
    /// Termination runs outside the lock; a failing session is logged and
    /// the rest are still terminated. Calling this twice is harmless.
    pub fn cleanup_connection(&self, connection: ConnectionId) -> CleanupReport {
        let sessions: Vec<(SessionKey, Session)> = {
            let mut inner = self.inner.write();
            let keys = inner.by_connection.remove(&connection).unwrap_or_default();
            keys.into_iter()
                .filter_map(|key| match inner.slots.remove(&key) {
                    Some(Slot::Live(session)) => Some((key, session)),
                    _ => None,
                })
                .collect()
        };

        let mut report = CleanupReport::default();
        for (key, session) in sessions {
            match session.terminate() {
                Ok(()) => report.terminated += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(conn = %connection, session = %key, error = %e, "failed to terminate session");
                }
            }
        }

        if report.terminated + report.failed > 0 {
            tracing::info!(
                conn = %connection,
                terminated = report.terminated,
                failed = report.failed,
                "cleaned up connection sessions"
            );
        }
        report
    }

    /// Clean up every connection. Used at server shutdown.
    pub fn drain(&self) -> CleanupReport {
        let connections: Vec<ConnectionId> =
            self.inner.read().by_connection.keys().copied().collect();
        connections
            .into_iter()
            .map(|conn| self.cleanup_connection(conn))
            .fold(CleanupReport::default(), |acc, r| CleanupReport {
                terminated: acc.terminated + r.terminated,
                failed: acc.failed + r.failed,
            })
    }

    /// Keys of the live sessions owned by `connection`.
    pub fn keys_for(&self, connection: ConnectionId) -> Vec<SessionKey> {
        let inner = self.inner.read();
        inner
            .by_connection
            .get(&connection)
            .map(|keys| {
                keys.iter()
                    .filter(|k| matches!(inner.slots.get(*k), Some(Slot::Live(_))))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of slots, live or reserved.
    pub fn len(&self) -> usize {
        self.inner.read().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn commit(&self, owner: ConnectionId, key: &SessionKey, session: Session) -> Result<(), Session> {
        let mut inner = self.inner.write();
        match inner.slots.get_mut(key) {
            Some(slot) if matches!(&*slot, Slot::Reserved(o) if *o == owner) => {
                *slot = Slot::Live(session);
                Ok(())
            }
            _ => Err(session),
        }
    }

    fn release(&self, owner: ConnectionId, key: &SessionKey) {
        let mut inner = self.inner.write();
        if matches!(inner.slots.get(key), Some(Slot::Reserved(o)) if *o == owner) {
            inner.take(key);
        }
    }
}

/// A reserved key waiting for its session.
///
/// Dropping the reservation without committing frees the key.
pub struct Reservation {
    registry: SessionRegistry,
    owner: ConnectionId,
    key: SessionKey,
    committed: bool,
}

impl Reservation {
    fn new(registry: SessionRegistry, owner: ConnectionId, key: SessionKey) -> Self {
        Self {
            registry,
            owner,
            key,
            committed: false,
        }
    }

    /// Publish the session under the reserved key.
    ///
    /// If the reservation was revoked in the meantime (the owning connection
    /// was cleaned up), the session is handed back so the caller can release
    /// whatever it acquired.
    pub fn commit(mut self, session: Session) -> Result<(), Session> {
        self.committed = true;
        self.registry.commit(self.owner, &self.key, session)
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.committed {
            self.registry.release(self.owner, &self.key);
        }
    }
}

impl fmt::Debug for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation")
            .field("owner", &self.owner)
            .field("key", &self.key)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn monitor_key(owner: ConnectionId, interface: &str) -> SessionKey {
        SessionKey::Monitor {
            owner,
            protocol: Protocol::Tcp,
            interface: interface.to_string(),
        }
    }

    fn monitor(owner: ConnectionId, interface: &str) -> Session {
        Session::Monitor(Arc::new(PortMonitor::new(
            owner,
            Protocol::Tcp,
            interface.to_string(),
            Duration::from_secs(2),
        )))
    }

    fn watch(owner: ConnectionId, path: &str) -> Session {
        Session::Watch(Arc::new(WatchSession::detached(owner, path)))
    }

    #[test]
    fn registry_create_commit_lookup() {
        let registry = SessionRegistry::new();
        let conn = ConnectionId::new();
        let key = monitor_key(conn, "any");

        let reservation = registry.create(conn, key.clone()).unwrap();
        assert!(matches!(registry.lookup(&key), Err(RegistryError::NotFound(_))));

        reservation.commit(monitor(conn, "any")).unwrap();
        let found = registry.lookup(&key).unwrap();
        assert_eq!(found.owner(), conn);
        assert_eq!(found.kind(), "monitor");
    }

    #[test]
    fn registry_duplicate_key_is_rejected() {
        let registry = SessionRegistry::new();
        let conn = ConnectionId::new();
        let key = SessionKey::Watch {
            owner: conn,
            path: "/tmp".into(),
        };

        let _held = registry.create(conn, key.clone()).unwrap();
        assert!(matches!(
            registry.create(conn, key),
            Err(RegistryError::AlreadyExists(_))
        ));
    }

    #[test]
    fn registry_same_path_different_connections() {
        let registry = SessionRegistry::new();
        let a = ConnectionId::new();
        let b = ConnectionId::new();

        let ra = registry
            .create(a, SessionKey::Watch { owner: a, path: "/tmp".into() })
            .unwrap();
        let rb = registry
            .create(b, SessionKey::Watch { owner: b, path: "/tmp".into() })
            .unwrap();
        ra.commit(watch(a, "/tmp")).unwrap();
        rb.commit(watch(b, "/tmp")).unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn registry_dropped_reservation_frees_key() {
        let registry = SessionRegistry::new();
        let conn = ConnectionId::new();
        let key = monitor_key(conn, "any");

        drop(registry.create(conn, key.clone()).unwrap());
        assert!(registry.is_empty());
        assert!(registry.create(conn, key).is_ok());
    }

    #[test]
    fn registry_authorize_denies_non_owner() {
        let registry = SessionRegistry::new();
        let owner = ConnectionId::new();
        let intruder = ConnectionId::new();
        let key = monitor_key(owner, "any");
        registry
            .create(owner, key.clone())
            .unwrap()
            .commit(monitor(owner, "any"))
            .unwrap();

        let session = registry.lookup(&key).unwrap();
        assert!(registry.authorize(&session, owner).is_ok());
        assert_eq!(
            registry.authorize(&session, intruder).unwrap_err(),
            RegistryError::AccessDenied
        );
        assert_eq!(
            registry.lookup_owned(&key, intruder).unwrap_err(),
            RegistryError::AccessDenied
        );
    }

    #[test]
    fn registry_remove_is_idempotent() {
        let registry = SessionRegistry::new();
        let conn = ConnectionId::new();
        let key = monitor_key(conn, "any");
        registry
            .create(conn, key.clone())
            .unwrap()
            .commit(monitor(conn, "any"))
            .unwrap();

        assert!(registry.remove(&key).is_some());
        assert!(registry.remove(&key).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn registry_remove_ignores_reserved_slots() {
        let registry = SessionRegistry::new();
        let conn = ConnectionId::new();
        let key = monitor_key(conn, "any");
        let _reservation = registry.create(conn, key.clone()).unwrap();
        assert!(registry.remove(&key).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn registry_create_replacing_evicts_live_session() {
        let registry = SessionRegistry::new();
        let conn = ConnectionId::new();
        let key = monitor_key(conn, "any");
        let first = monitor(conn, "any");
        registry
            .create(conn, key.clone())
            .unwrap()
            .commit(first.clone())
            .unwrap();

        let (reservation, evicted) = registry.create_replacing(conn, key.clone()).unwrap();
        assert!(evicted.unwrap().same(&first));
        assert!(registry.lookup(&key).is_err());

        reservation.commit(monitor(conn, "any")).unwrap();
        assert!(!registry.lookup(&key).unwrap().same(&first));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn registry_cleanup_removes_everything_owned() {
        let registry = SessionRegistry::new();
        let conn = ConnectionId::new();
        let other = ConnectionId::new();

        let m = monitor(conn, "any");
        let w = watch(conn, "/tmp");
        registry.create(conn, monitor_key(conn, "any")).unwrap().commit(m.clone()).unwrap();
        registry
            .create(conn, SessionKey::Watch { owner: conn, path: "/tmp".into() })
            .unwrap()
            .commit(w.clone())
            .unwrap();
        registry
            .create(other, monitor_key(other, "any"))
            .unwrap()
            .commit(monitor(other, "any"))
            .unwrap();

        let report = registry.cleanup_connection(conn);
        assert_eq!(report, CleanupReport { terminated: 2, failed: 0 });
        assert!(registry.keys_for(conn).is_empty());
        assert_eq!(registry.len(), 1);

        let Session::Monitor(m) = m else { unreachable!() };
        assert!(m.is_stopped());
        let Session::Watch(w) = w else { unreachable!() };
        assert!(w.is_closed());

        assert_eq!(registry.cleanup_connection(conn), CleanupReport::default());
    }

    #[test]
    fn registry_cleanup_revokes_reservations() {
        let registry = SessionRegistry::new();
        let conn = ConnectionId::new();
        let key = monitor_key(conn, "any");
        let reservation = registry.create(conn, key.clone()).unwrap();

        registry.cleanup_connection(conn);
        assert!(registry.is_empty());

        let handed_back = reservation.commit(monitor(conn, "any"));
        assert!(handed_back.is_err());
        assert!(registry.lookup(&key).is_err());
    }

    #[test]
    fn registry_drain_cleans_all_connections() {
        let registry = SessionRegistry::new();
        for _ in 0..3 {
            let conn = ConnectionId::new();
            registry
                .create(conn, monitor_key(conn, "any"))
                .unwrap()
                .commit(monitor(conn, "any"))
                .unwrap();
        }
        assert_eq!(registry.drain().terminated, 3);
        assert!(registry.is_empty());
    }
}
