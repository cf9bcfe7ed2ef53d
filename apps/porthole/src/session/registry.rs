//! Process-wide session bookkeeping. Sessions are keyed by
//! `(namespace, id)` and shared across subscriber connections; the last
//! detach destroys the session. Lifecycle transitions fan out over a
//! broadcast bus so multiplexer channels can surface them as envelopes.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info};
use uuid::Uuid;

use crate::renderer::RendererFactory;
use crate::session::{ConnectionHooks, Session, SessionConfig, SessionError, SessionHandle, SessionId};

const EVENT_BUS_CAPACITY: usize = 64;

/// Identity of one subscriber channel, allocated at accept time.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Public address of a session: an opaque id scoped by a namespace.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub namespace: String,
    pub id: String,
}

impl SessionKey {
    pub fn new(namespace: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.id)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegistryEventKind {
    /// A new id appeared in the namespace.
    Discovered,
    /// The session for the id is producing frames.
    Connected,
    /// The session was destroyed.
    Closed,
}

#[derive(Clone, Debug)]
pub struct RegistryEvent {
    pub key: SessionKey,
    pub kind: RegistryEventKind,
}

struct SessionEntry {
    handle: SessionHandle,
    subscribers: usize,
}

#[derive(Default)]
struct RegistryInner {
    sessions: HashMap<SessionKey, SessionEntry>,
    connections: HashMap<ConnectionId, HashSet<SessionKey>>,
}

pub struct SessionRegistry {
    factory: Arc<dyn RendererFactory>,
    hooks: Arc<dyn ConnectionHooks>,
    defaults: SessionConfig,
    inner: Mutex<RegistryInner>,
    events: broadcast::Sender<RegistryEvent>,
}

impl SessionRegistry {
    pub fn new(
        factory: Arc<dyn RendererFactory>,
        hooks: Arc<dyn ConnectionHooks>,
        defaults: SessionConfig,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Arc::new(Self {
            factory,
            hooks,
            defaults,
            inner: Mutex::new(RegistryInner::default()),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Attach `connection` to the session for `key`, creating it when it
    /// does not exist yet. The optional size hint seeds the initial
    /// renderer dimensions (clamped to the configured maxima);
    /// authoritative size is still whatever `resize` later sets.
    pub async fn attach(
        &self,
        connection: &ConnectionId,
        key: &SessionKey,
        size_hint: Option<(u16, u16)>,
    ) -> Result<SessionHandle, SessionError> {
        {
            let mut inner = self.inner.lock().await;
            if let Some(entry) = inner.sessions.get_mut(key) {
                entry.subscribers += 1;
                let handle = entry.handle.clone();
                inner
                    .connections
                    .entry(connection.clone())
                    .or_default()
                    .insert(key.clone());
                debug!(%key, %connection, "joined existing session");
                return Ok(handle);
            }
        }

        // Renderer creation may suspend; never hold the registry lock
        // across it.
        let mut config = self.defaults;
        if let Some((cols, rows)) = size_hint {
            config = config.with_size(
                cols.clamp(1, config.max_cols),
                rows.clamp(1, config.max_rows),
            );
        }
        let handle =
            Session::create(SessionId::random(), config, self.factory.as_ref(), self.hooks.clone())
                .await?;

        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.sessions.get_mut(key) {
            // Another connection created the session while ours was being
            // built; keep theirs.
            existing.subscribers += 1;
            let winner = existing.handle.clone();
            inner
                .connections
                .entry(connection.clone())
                .or_default()
                .insert(key.clone());
            drop(inner);
            handle.destroy();
            return Ok(winner);
        }

        inner.sessions.insert(
            key.clone(),
            SessionEntry {
                handle: handle.clone(),
                subscribers: 1,
            },
        );
        inner
            .connections
            .entry(connection.clone())
            .or_default()
            .insert(key.clone());
        drop(inner);

        info!(%key, session = %handle.id(), "session registered");
        self.emit(key, RegistryEventKind::Discovered);
        self.emit(key, RegistryEventKind::Connected);
        Ok(handle)
    }

    /// Detach `connection` from `key`; the session is destroyed when no
    /// subscriber remains.
    pub async fn detach(&self, connection: &ConnectionId, key: &SessionKey) {
        let removed = {
            let mut inner = self.inner.lock().await;
            if let Some(keys) = inner.connections.get_mut(connection) {
                if !keys.remove(key) {
                    return;
                }
                if keys.is_empty() {
                    inner.connections.remove(connection);
                }
            } else {
                return;
            }
            let orphaned = match inner.sessions.get_mut(key) {
                Some(entry) => {
                    entry.subscribers = entry.subscribers.saturating_sub(1);
                    entry.subscribers == 0
                }
                None => false,
            };
            if orphaned {
                inner.sessions.remove(key)
            } else {
                None
            }
        };

        if let Some(entry) = removed {
            info!(%key, "last subscriber left, destroying session");
            entry.handle.destroy();
            self.emit(key, RegistryEventKind::Closed);
        }
    }

    /// Detach `connection` from every session it holds; called on channel
    /// close.
    pub async fn detach_all(&self, connection: &ConnectionId) {
        let keys: Vec<SessionKey> = {
            let inner = self.inner.lock().await;
            inner
                .connections
                .get(connection)
                .map(|keys| keys.iter().cloned().collect())
                .unwrap_or_default()
        };
        for key in keys {
            self.detach(connection, &key).await;
        }
    }

    /// Every key currently live in `namespace`; lets late-joining
    /// channels catch up on lifecycle state.
    pub async fn keys_in(&self, namespace: &str) -> Vec<SessionKey> {
        let inner = self.inner.lock().await;
        inner
            .sessions
            .keys()
            .filter(|key| key.namespace == namespace)
            .cloned()
            .collect()
    }

    pub async fn get(&self, key: &SessionKey) -> Option<SessionHandle> {
        let inner = self.inner.lock().await;
        inner.sessions.get(key).map(|entry| entry.handle.clone())
    }

    pub async fn session_count(&self) -> usize {
        self.inner.lock().await.sessions.len()
    }

    fn emit(&self, key: &SessionKey, kind: RegistryEventKind) {
        let _ = self.events.send(RegistryEvent {
            key: key.clone(),
            kind,
        });
    }
}
