//! Relay routing state: which upstream is bound to each `(namespace, id)`
//! and which downstream watchers receive its frames. All maps are lock-free
//! dashmaps; nothing here suspends while a map guard is held.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use dashmap::DashMap;
use porthole_protocol::{ErrorInfo, InboundEnvelope, UpstreamEvent, REASON_TUNNEL_INACTIVE};
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tracing::{info, warn};

pub type ConnId = u64;

/// A bound upstream: the host process serving frames for one tunnel id.
pub struct Upstream {
    pub conn: ConnId,
    pub tx: mpsc::UnboundedSender<Message>,
    pub last_seen: Arc<RwLock<Instant>>,
}

/// A downstream viewer channel. An empty id list is a wildcard
/// subscription over the whole namespace.
pub struct Watcher {
    pub tx: mpsc::UnboundedSender<Message>,
    pub ids: Vec<String>,
}

impl Watcher {
    pub fn is_wildcard(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn admits(&self, id: &str) -> bool {
        self.is_wildcard() || self.ids.iter().any(|candidate| candidate == id)
    }
}

#[derive(Default)]
pub struct NamespaceState {
    tunnels: DashMap<String, Upstream>,
    watchers: DashMap<ConnId, Watcher>,
}

impl NamespaceState {
    /// Bind an upstream for `id`; false when the id is already taken.
    pub fn bind_upstream(&self, id: &str, upstream: Upstream) -> bool {
        match self.tunnels.entry(id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(upstream);
                true
            }
        }
    }

    /// Release the upstream for `id` if `conn` still owns it; true when
    /// something was removed.
    pub fn release_upstream(&self, id: &str, conn: ConnId) -> bool {
        self.tunnels
            .remove_if(id, |_, upstream| upstream.conn == conn)
            .is_some()
    }

    pub fn has_upstream(&self, id: &str) -> bool {
        self.tunnels.contains_key(id)
    }

    pub fn upstream_tx(&self, id: &str) -> Option<mpsc::UnboundedSender<Message>> {
        self.tunnels.get(id).map(|upstream| upstream.tx.clone())
    }

    pub fn bound_ids(&self) -> Vec<String> {
        self.tunnels.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn add_watcher(&self, conn: ConnId, watcher: Watcher) {
        self.watchers.insert(conn, watcher);
    }

    pub fn remove_watcher(&self, conn: ConnId) {
        self.watchers.remove(&conn);
    }

    /// Fan a lifecycle event out to watchers. `upstream_discovered` goes
    /// to wildcard subscribers only; everything else reaches every
    /// watcher whose subscription admits the id.
    pub fn broadcast_event(&self, id: &str, event: UpstreamEvent, error: Option<ErrorInfo>) {
        let Some(text) = event_frame(id, event, error) else {
            return;
        };
        let wildcard_only = event == UpstreamEvent::UpstreamDiscovered;
        for watcher in self.watchers.iter() {
            let deliver = if wildcard_only {
                watcher.is_wildcard()
            } else {
                watcher.admits(id)
            };
            if deliver {
                let _ = watcher.tx.send(Message::Text(text.clone()));
            }
        }
    }

    /// Forward one upstream data frame to every admitting watcher.
    pub fn forward_to_watchers(&self, id: &str, text: &str) {
        for watcher in self.watchers.iter() {
            if watcher.admits(id) {
                let _ = watcher.tx.send(Message::Text(text.to_string()));
            }
        }
    }
}

pub struct RelayState {
    namespaces: DashMap<String, Arc<NamespaceState>>,
    next_conn: AtomicU64,
    upstream_timeout: Duration,
}

impl RelayState {
    pub fn new(upstream_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            namespaces: DashMap::new(),
            next_conn: AtomicU64::new(1),
            upstream_timeout,
        })
    }

    pub fn namespace(&self, name: &str) -> Arc<NamespaceState> {
        self.namespaces
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(NamespaceState::default()))
            .clone()
    }

    pub fn next_conn(&self) -> ConnId {
        self.next_conn.fetch_add(1, Ordering::Relaxed)
    }

    /// Drop upstreams that have not pinged within the timeout and tell
    /// their watchers. The handler's own cleanup is a no-op afterwards
    /// because the connection token no longer matches.
    pub async fn sweep_stale_upstreams(&self) {
        let mut stale = Vec::new();
        for namespace in self.namespaces.iter() {
            for tunnel in namespace.tunnels.iter() {
                stale.push((
                    namespace.key().clone(),
                    tunnel.key().clone(),
                    tunnel.conn,
                    tunnel.last_seen.clone(),
                    tunnel.tx.clone(),
                ));
            }
        }
        for (namespace_name, id, conn, last_seen, tx) in stale {
            let elapsed = last_seen.read().await.elapsed();
            if elapsed <= self.upstream_timeout {
                continue;
            }
            warn!(namespace = %namespace_name, id = %id, ?elapsed, "removing stale upstream");
            let namespace = self.namespace(&namespace_name);
            if namespace.release_upstream(&id, conn) {
                let _ = tx.send(Message::Close(None));
                namespace.broadcast_event(&id, UpstreamEvent::UpstreamClosed, None);
            }
        }
    }

    /// Start the periodic stale-upstream sweep.
    pub fn start_sweeper(self: &Arc<Self>, period: Duration) {
        let state = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                state.sweep_stale_upstreams().await;
            }
        });
        info!(?period, "stale upstream sweeper running");
    }
}

fn event_frame(id: &str, event: UpstreamEvent, error: Option<ErrorInfo>) -> Option<String> {
    let frame = InboundEnvelope::Event {
        id: id.to_string(),
        event,
        error,
    };
    serde_json::to_string(&frame).ok()
}

/// The error payload sent when a downstream addresses an unbound id.
pub fn tunnel_inactive_error(id: &str) -> Option<String> {
    event_frame(
        id,
        UpstreamEvent::UpstreamError,
        Some(ErrorInfo::new(REASON_TUNNEL_INACTIVE, "TunnelNotActive")),
    )
}
