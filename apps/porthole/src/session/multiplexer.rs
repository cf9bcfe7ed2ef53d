//! Per-channel envelope router. One WebSocket connection declares a
//! namespace and an id set (empty = wildcard); this component routes
//! data envelopes to sessions, wraps session output back into envelopes,
//! replays messages that raced session creation, and surfaces registry
//! lifecycle transitions as `upstream_*` events.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::protocol::{
    envelope_server_message, ClientMessage, ErrorInfo, InboundEnvelope, UpstreamEvent,
};
use crate::session::registry::{
    ConnectionId, RegistryEvent, RegistryEventKind, SessionKey, SessionRegistry,
};
use crate::session::SessionHandle;

/// Messages buffered per id between the first envelope and session
/// readiness; overflow drops the oldest.
pub const PENDING_FIFO_CAPACITY: usize = 256;

/// What one channel subscribed to. An empty id set is the wildcard: every
/// id in the namespace is admitted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MuxSubscription {
    pub namespace: String,
    pub ids: Vec<String>,
}

impl MuxSubscription {
    pub fn new(namespace: impl Into<String>, ids: Vec<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ids,
        }
    }

    pub fn is_wildcard(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn admits(&self, id: &str) -> bool {
        self.is_wildcard() || self.ids.iter().any(|candidate| candidate == id)
    }
}

/// Completion of an asynchronous session bind, fed back into the channel
/// loop.
pub enum MuxUpdate {
    Bound {
        id: String,
        result: Result<SessionHandle, String>,
    },
}

enum IdState {
    Binding {
        queue: VecDeque<ClientMessage>,
        dropped: usize,
    },
    Ready {
        handle: SessionHandle,
        forward: JoinHandle<()>,
    },
}

pub struct ChannelMultiplexer {
    connection: ConnectionId,
    registry: Arc<SessionRegistry>,
    subscription: MuxSubscription,
    size_hint: Option<(u16, u16)>,
    outbound: mpsc::UnboundedSender<String>,
    updates: mpsc::UnboundedSender<MuxUpdate>,
    states: HashMap<String, IdState>,
}

impl ChannelMultiplexer {
    pub fn new(
        registry: Arc<SessionRegistry>,
        subscription: MuxSubscription,
        size_hint: Option<(u16, u16)>,
        outbound: mpsc::UnboundedSender<String>,
        updates: mpsc::UnboundedSender<MuxUpdate>,
    ) -> Self {
        Self {
            connection: ConnectionId::random(),
            registry,
            subscription,
            size_hint,
            outbound,
            updates,
            states: HashMap::new(),
        }
    }

    pub fn connection(&self) -> &ConnectionId {
        &self.connection
    }

    /// Bind every explicitly subscribed id up front. Wildcard channels
    /// bind on demand when the first envelope for an id arrives.
    pub fn bind_subscribed(&mut self) {
        for id in self.subscription.ids.clone() {
            if !self.states.contains_key(&id) {
                self.begin_bind(id);
            }
        }
    }

    /// Tell a late-joining channel about ids that were live before it
    /// attached, so discovery always precedes data.
    pub fn announce_existing(&self, keys: &[SessionKey]) {
        for key in keys {
            if key.namespace != self.subscription.namespace || !self.subscription.admits(&key.id) {
                continue;
            }
            if self.subscription.is_wildcard() {
                self.send_event(&key.id, UpstreamEvent::UpstreamDiscovered, None);
            }
            self.send_event(&key.id, UpstreamEvent::UpstreamConnected, None);
        }
    }

    /// Handle one text frame read from the channel.
    pub fn handle_frame(&mut self, text: &str) {
        let envelope = match serde_json::from_str::<InboundEnvelope>(text) {
            Ok(envelope) => envelope,
            Err(error) => {
                warn!(%error, "dropping malformed envelope");
                return;
            }
        };
        match envelope {
            InboundEnvelope::Data { id, data } => match serde_json::from_str::<ClientMessage>(&data)
            {
                Ok(message) => self.route(id, message),
                Err(error) => warn!(%error, %id, "dropping malformed client message"),
            },
            InboundEnvelope::Event { id, .. } => {
                debug!(%id, "ignoring lifecycle event from subscriber");
            }
        }
    }

    fn route(&mut self, id: String, message: ClientMessage) {
        if !self.subscription.admits(&id) {
            debug!(%id, "dropping envelope outside subscription");
            return;
        }
        if !self.states.contains_key(&id) {
            self.begin_bind(id.clone());
        }
        match self.states.get_mut(&id) {
            Some(IdState::Ready { handle, .. }) => handle.handle_message(message),
            Some(IdState::Binding { queue, dropped }) => {
                if queue.len() >= PENDING_FIFO_CAPACITY {
                    queue.pop_front();
                    *dropped += 1;
                    warn!(%id, "pre-ready queue full, dropping oldest message");
                }
                queue.push_back(message);
            }
            None => unreachable!("state inserted above"),
        }
    }

    fn begin_bind(&mut self, id: String) {
        self.states.insert(
            id.clone(),
            IdState::Binding {
                queue: VecDeque::new(),
                dropped: 0,
            },
        );
        let registry = self.registry.clone();
        let connection = self.connection.clone();
        let key = SessionKey::new(self.subscription.namespace.clone(), id.clone());
        let size_hint = self.size_hint;
        let updates = self.updates.clone();
        tokio::spawn(async move {
            let result = registry
                .attach(&connection, &key, size_hint)
                .await
                .map_err(|error| error.to_string());
            let _ = updates.send(MuxUpdate::Bound { id, result });
        });
    }

    pub fn on_update(&mut self, update: MuxUpdate) {
        let MuxUpdate::Bound { id, result } = update;
        let prior = self.states.remove(&id);
        match result {
            Ok(handle) => {
                // Subscribe before forcing the full snapshot so the
                // forward task observes it: a diff must never reach a
                // viewer ahead of the full it patches.
                let receiver = handle.subscribe();
                let forward = tokio::spawn(forward_session_output(
                    id.clone(),
                    receiver,
                    handle.clone(),
                    self.outbound.clone(),
                ));
                handle.force_full();
                if let Some(IdState::Binding { queue, dropped }) = prior {
                    if dropped > 0 {
                        warn!(%id, dropped, "pre-ready queue overflowed; oldest messages lost");
                    }
                    for message in queue {
                        handle.handle_message(message);
                    }
                }
                self.states.insert(id, IdState::Ready { handle, forward });
            }
            Err(message) => {
                warn!(%id, error = %message, "session bind failed");
                self.send_event(
                    &id,
                    UpstreamEvent::UpstreamError,
                    Some(ErrorInfo::new(message, "SessionCreateError")),
                );
            }
        }
    }

    pub fn on_registry_event(&mut self, event: RegistryEvent) {
        if event.key.namespace != self.subscription.namespace
            || !self.subscription.admits(&event.key.id)
        {
            return;
        }
        let id = &event.key.id;
        match event.kind {
            RegistryEventKind::Discovered => {
                if self.subscription.is_wildcard() {
                    self.send_event(id, UpstreamEvent::UpstreamDiscovered, None);
                }
            }
            RegistryEventKind::Connected => {
                self.send_event(id, UpstreamEvent::UpstreamConnected, None);
            }
            RegistryEventKind::Closed => {
                self.send_event(id, UpstreamEvent::UpstreamClosed, None);
                // Drop any stale binding so a later envelope re-creates
                // the session instead of addressing a destroyed one.
                if let Some(IdState::Ready { handle, forward }) = self.states.get(id) {
                    if handle.is_destroyed() {
                        forward.abort();
                        self.states.remove(id);
                    }
                }
            }
        }
    }

    fn send_event(&self, id: &str, event: UpstreamEvent, error: Option<ErrorInfo>) {
        let frame = InboundEnvelope::Event {
            id: id.to_string(),
            event,
            error,
        };
        match serde_json::to_string(&frame) {
            Ok(text) => {
                let _ = self.outbound.send(text);
            }
            Err(error) => warn!(%error, "failed to encode lifecycle event"),
        }
    }

    /// Tear down on channel close: stop forward tasks and release every
    /// session this connection held.
    pub async fn shutdown(self) {
        for (_, state) in self.states {
            if let IdState::Ready { forward, .. } = state {
                forward.abort();
            }
        }
        self.registry.detach_all(&self.connection).await;
    }
}

/// Forward one session's outbound stream into the channel as `{id, data}`
/// envelopes. A lagging subscriber missed frames, so the session is asked
/// for a fresh full snapshot to resynchronize.
async fn forward_session_output(
    id: String,
    mut receiver: broadcast::Receiver<crate::protocol::ServerMessage>,
    handle: SessionHandle,
    outbound: mpsc::UnboundedSender<String>,
) {
    loop {
        match receiver.recv().await {
            Ok(message) => {
                let envelope = match envelope_server_message(&id, &message) {
                    Ok(envelope) => envelope,
                    Err(error) => {
                        warn!(%id, %error, "failed to encode server message");
                        continue;
                    }
                };
                let text = match serde_json::to_string(&envelope) {
                    Ok(text) => text,
                    Err(error) => {
                        warn!(%id, %error, "failed to encode envelope");
                        continue;
                    }
                };
                if outbound.send(text).is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(%id, skipped, "subscriber lagged; requesting full resync");
                handle.force_full();
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_admits_everything() {
        let subscription = MuxSubscription::new("demo", vec![]);
        assert!(subscription.is_wildcard());
        assert!(subscription.admits("anything"));
    }

    #[test]
    fn explicit_subscription_filters() {
        let subscription = MuxSubscription::new("demo", vec!["a".into(), "b".into()]);
        assert!(subscription.admits("a"));
        assert!(subscription.admits("b"));
        assert!(!subscription.admits("c"));
    }
}
