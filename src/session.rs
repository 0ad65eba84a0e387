use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::SystemTime;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast as tokio_broadcast;
use tokio_util::sync::CancellationToken;

/// Default ssh port when a session does not name one.
pub const DEFAULT_PORT: u16 = 22;

/// A stored secret. Never printed by `Debug`.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.is_empty() {
            f.write_str("Credential(<empty>)")
        } else {
            f.write_str("Credential(<redacted>)")
        }
    }
}

/// Remote connection parameters for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    pub host: String,
    pub port: u16,
    pub username: String,
    /// Password answered to prompts on stderr. May be empty.
    pub credential: Credential,
    /// Private key passed to the client. `None` when not configured.
    pub identity_file: Option<PathBuf>,
}

impl ConnectionParams {
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            username: username.into(),
            credential: Credential::default(),
            identity_file: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Credential::new(credential);
        self
    }

    /// Set the identity file. An empty path means none.
    pub fn with_identity_file(mut self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        self.identity_file = if path.as_os_str().is_empty() { None } else { Some(path) };
        self
    }

    /// Check the parameters are usable on a command line.
    pub fn validate(&self) -> Result<(), RegistryError> {
        if self.host.is_empty() {
            return Err(RegistryError::InvalidParams("host must not be empty".into()));
        }
        if self.username.is_empty() {
            return Err(RegistryError::InvalidParams("username must not be empty".into()));
        }
        if self.port == 0 {
            return Err(RegistryError::InvalidParams("port must not be 0".into()));
        }
        if self.host.starts_with('-') || self.username.starts_with('-') {
            return Err(RegistryError::InvalidParams("host and username must not start with '-'".into()));
        }
        let bad = |s: &str| s.chars().any(|c| c.is_whitespace() || c == '@' || c.is_control());
        if bad(&self.host) || bad(&self.username) {
            return Err(RegistryError::InvalidParams(
                "host and username must not contain whitespace, '@' or control characters".into(),
            ));
        }
        Ok(())
    }
}

struct BridgeControl {
    id: u64,
    attached_at: SystemTime,
    pid: OnceLock<u32>,
    /// Set once the process is reaped. Held while signalling so a reaped
    /// pid is never killed.
    exited: Mutex<bool>,
    cancel: CancellationToken,
}

/// Shared handle to a session's live bridge.
///
/// The bridge task owns the process; this handle lets the registry cancel
/// the bridge and kill its process from outside the task.
#[derive(Clone)]
pub struct BridgeHandle {
    inner: Arc<BridgeControl>,
}

impl std::fmt::Debug for BridgeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeHandle")
            .field("id", &self.inner.id)
            .field("pid", &self.inner.pid.get())
            .field("exited", &self.has_exited())
            .finish_non_exhaustive()
    }
}

impl BridgeHandle {
    pub(crate) fn new(id: u64) -> Self {
        Self {
            inner: Arc::new(BridgeControl {
                id,
                attached_at: SystemTime::now(),
                pid: OnceLock::new(),
                exited: Mutex::new(false),
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn attached_at(&self) -> SystemTime {
        self.inner.attached_at
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.pid.get().copied()
    }

    /// Record the spawned process id. Only the first call takes effect.
    pub fn set_pid(&self, pid: u32) {
        let _ = self.inner.pid.set(pid);
    }

    /// Run a non-blocking reap attempt under the signal lock.
    ///
    /// If `try_wait` yields a status the process is marked exited before the
    /// lock is released, so a concurrent [`BridgeHandle::terminate`] either
    /// signals a still-unreaped child or skips it.
    pub fn reap_with<F>(&self, try_wait: F) -> std::io::Result<Option<ExitStatus>>
    where
        F: FnOnce() -> std::io::Result<Option<ExitStatus>>,
    {
        let mut exited = self.inner.exited.lock();
        if *exited {
            return Ok(None);
        }
        let status = try_wait()?;
        if status.is_some() {
            *exited = true;
        }
        Ok(status)
    }

    pub fn has_exited(&self) -> bool {
        *self.inner.exited.lock()
    }

    /// Token the bridge task watches for forced termination.
    pub fn cancellation(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Cancel the bridge and SIGKILL its process.
    ///
    /// Skips the signal if the process was already reaped, so a recycled
    /// PID is never hit.
    pub fn terminate(&self) {
        self.inner.cancel.cancel();
        let Some(pid) = self.pid() else {
            return;
        };
        if pid == 0 || pid > i32::MAX as u32 {
            tracing::warn!(pid, "PID is 0 or exceeds i32::MAX, cannot send signal");
            return;
        }
        let exited = self.inner.exited.lock();
        if *exited {
            tracing::debug!(pid, "bridge process already exited, skipping SIGKILL");
            return;
        }
        #[cfg(unix)]
        unsafe {
            libc::kill(pid as i32, libc::SIGKILL);
        }
        drop(exited);
    }
}

/// Whether a session currently has a bridge.
#[derive(Debug, Clone, Default)]
pub enum BridgeSlot {
    #[default]
    Vacant,
    Occupied(BridgeHandle),
}

impl BridgeSlot {
    pub fn is_occupied(&self) -> bool {
        matches!(self, Self::Occupied(_))
    }
}

/// A stored set of connection parameters, independent of any live process.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub params: ConnectionParams,
    pub created_at: SystemTime,
    pub bridge: BridgeSlot,
}

/// Server-level session lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Created { id: String },
    BridgeAttached { id: String, bridge: u64 },
    BridgeReleased { id: String, bridge: u64 },
    Removed { id: String },
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("session already has an active bridge: {0}")]
    BridgeActive(String),
    #[error("invalid connection parameters: {0}")]
    InvalidParams(String),
}

struct RegistryInner {
    sessions: HashMap<String, Session>,
}

/// Owns every live session.
///
/// Mutations, including the attach transition, happen under one write lock
/// so a session never holds two bridges.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RwLock<RegistryInner>>,
    next_bridge_id: Arc<AtomicU64>,
    events_tx: tokio_broadcast::Sender<SessionEvent>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        let (events_tx, _) = tokio_broadcast::channel(64);
        Self {
            inner: Arc::new(RwLock::new(RegistryInner {
                sessions: HashMap::new(),
            })),
            next_bridge_id: Arc::new(AtomicU64::new(1)),
            events_tx,
        }
    }

    /// Store a new session under a freshly generated id.
    pub fn create(&self, params: ConnectionParams) -> Session {
        let mut inner = self.inner.write();
        let id = loop {
            let candidate = uuid::Uuid::new_v4().to_string();
            if !inner.sessions.contains_key(&candidate) {
                break candidate;
            }
        };
        let session = Session {
            id: id.clone(),
            params,
            created_at: SystemTime::now(),
            bridge: BridgeSlot::Vacant,
        };
        inner.sessions.insert(id.clone(), session.clone());
        drop(inner);

        tracing::info!(session = %id, "session created");
        let _ = self.events_tx.send(SessionEvent::Created { id });
        session
    }

    /// Look up a session by id, returning a snapshot if found.
    pub fn lookup(&self, id: &str) -> Option<Session> {
        self.inner.read().sessions.get(id).cloned()
    }

    /// Remove a session, killing its bridge process first if one is attached.
    ///
    /// Unknown ids are a no-op.
    pub fn remove(&self, id: &str) -> Option<Session> {
        let removed = self.inner.write().sessions.remove(id);
        if let Some(ref session) = removed {
            if let BridgeSlot::Occupied(handle) = &session.bridge {
                tracing::info!(session = %id, pid = ?handle.pid(), "terminating bridge of removed session");
                handle.terminate();
            }
            tracing::info!(session = %id, "session removed");
            let _ = self.events_tx.send(SessionEvent::Removed { id: id.to_string() });
        }
        removed
    }

    pub fn list(&self) -> Vec<Session> {
        let inner = self.inner.read();
        let mut sessions: Vec<Session> = inner.sessions.values().cloned().collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        sessions
    }

    pub fn len(&self) -> usize {
        self.inner.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().sessions.is_empty()
    }

    /// Claim the session's bridge slot.
    ///
    /// Fails with [`RegistryError::BridgeActive`] if another bridge holds
    /// it. The slot is freed when the returned lease is dropped.
    pub fn acquire_bridge(&self, id: &str) -> Result<BridgeLease, RegistryError> {
        let mut inner = self.inner.write();
        let session = inner
            .sessions
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        if session.bridge.is_occupied() {
            return Err(RegistryError::BridgeActive(id.to_string()));
        }
        let handle = BridgeHandle::new(self.next_bridge_id.fetch_add(1, Ordering::Relaxed));
        session.bridge = BridgeSlot::Occupied(handle.clone());
        let session = session.clone();
        drop(inner);

        let _ = self.events_tx.send(SessionEvent::BridgeAttached {
            id: id.to_string(),
            bridge: handle.id(),
        });
        Ok(BridgeLease {
            registry: self.clone(),
            session,
            handle,
        })
    }

    fn release_bridge(&self, id: &str, bridge: u64) {
        let mut inner = self.inner.write();
        let Some(session) = inner.sessions.get_mut(id) else {
            return;
        };
        let held = matches!(&session.bridge, BridgeSlot::Occupied(h) if h.id() == bridge);
        if !held {
            return;
        }
        session.bridge = BridgeSlot::Vacant;
        drop(inner);
        let _ = self.events_tx.send(SessionEvent::BridgeReleased {
            id: id.to_string(),
            bridge,
        });
    }

    /// Remove every session and terminate every live bridge.
    ///
    /// Returns the number of sessions removed.
    pub fn shutdown(&self) -> usize {
        let drained: Vec<Session> = {
            let mut inner = self.inner.write();
            inner.sessions.drain().map(|(_, s)| s).collect()
        };
        for session in &drained {
            if let BridgeSlot::Occupied(handle) = &session.bridge {
                handle.terminate();
            }
            let _ = self.events_tx.send(SessionEvent::Removed {
                id: session.id.clone(),
            });
        }
        if !drained.is_empty() {
            tracing::info!(count = drained.len(), "registry shut down");
        }
        drained.len()
    }

    /// Subscribe to session lifecycle events.
    pub fn subscribe_events(&self) -> tokio_broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }
}

/// Exclusive claim on a session's bridge slot.
///
/// Dropping the lease frees the slot, unless the session was removed or the
/// slot already belongs to another bridge.
pub struct BridgeLease {
    registry: SessionRegistry,
    session: Session,
    handle: BridgeHandle,
}

impl BridgeLease {
    pub fn handle(&self) -> &BridgeHandle {
        &self.handle
    }

    /// Snapshot of the session taken when the slot was claimed.
    pub fn session(&self) -> &Session {
        &self.session
    }
}

impl Drop for BridgeLease {
    fn drop(&mut self) {
        self.registry.release_bridge(&self.session.id, self.handle.id());
    }
}
