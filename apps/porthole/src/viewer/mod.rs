//! Subscriber-side counterpart of the server multiplexer: one WebSocket
//! channel demultiplexed into per-id event streams, with global and
//! per-id subscriber fan-out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::connect_async;
use tracing::{debug, warn};
use url::Url;

use crate::protocol::{
    envelope_client_message, ClientMessage, ErrorInfo, InboundEnvelope, ProtocolError,
    ServerMessage, UpstreamEvent,
};

#[derive(Debug, Error)]
pub enum ViewerError {
    #[error("channel url is invalid: {0}")]
    InvalidUrl(String),
    #[error("failed to reach channel: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("channel is closed")]
    ChannelClosed,
    #[error(transparent)]
    Encode(#[from] ProtocolError),
}

/// Everything a subscriber can observe on a multiplexed channel.
#[derive(Clone, Debug)]
pub enum ViewerEvent {
    /// A server→client message for one stream.
    Data { id: String, message: ServerMessage },
    /// Lifecycle transition of one stream's upstream.
    Upstream {
        id: String,
        event: UpstreamEvent,
        error: Option<ErrorInfo>,
    },
    MultiplexerConnected,
    MultiplexerDisconnected,
}

struct ListenerSet {
    next_token: u64,
    global: HashMap<u64, mpsc::UnboundedSender<ViewerEvent>>,
    per_id: HashMap<String, HashMap<u64, mpsc::UnboundedSender<ViewerEvent>>>,
}

impl ListenerSet {
    fn new() -> Self {
        Self {
            next_token: 0,
            global: HashMap::new(),
            per_id: HashMap::new(),
        }
    }

    fn subscribe_global(&mut self) -> (u64, mpsc::UnboundedReceiver<ViewerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let token = self.next_token;
        self.next_token += 1;
        self.global.insert(token, tx);
        (token, rx)
    }

    fn subscribe_id(&mut self, id: &str) -> (u64, mpsc::UnboundedReceiver<ViewerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let token = self.next_token;
        self.next_token += 1;
        self.per_id.entry(id.to_string()).or_default().insert(token, tx);
        (token, rx)
    }

    /// Remove a listener. Safe to call repeatedly; empty per-id entries
    /// are dropped so wildcard discovery churn cannot grow the map.
    fn unsubscribe(&mut self, token: u64, id: Option<&str>) {
        match id {
            None => {
                self.global.remove(&token);
            }
            Some(id) => {
                if let Some(listeners) = self.per_id.get_mut(id) {
                    listeners.remove(&token);
                    if listeners.is_empty() {
                        self.per_id.remove(id);
                    }
                }
            }
        }
    }

    /// Deliver an event that belongs to one stream: its per-id listeners
    /// plus every global listener.
    fn dispatch_for(&self, id: &str, event: ViewerEvent) {
        if let Some(listeners) = self.per_id.get(id) {
            for tx in listeners.values() {
                let _ = tx.send(event.clone());
            }
        }
        self.dispatch_global(event);
    }

    /// Deliver a channel-level event to global listeners only.
    fn dispatch_global(&self, event: ViewerEvent) {
        for tx in self.global.values() {
            let _ = tx.send(event.clone());
        }
    }
}

struct ViewerShared {
    outbound: mpsc::UnboundedSender<WsMessage>,
    listeners: Mutex<ListenerSet>,
    connected: AtomicBool,
}

/// Unsubscribe token returned from every subscribe call. Unsubscribing
/// twice is a no-op.
pub struct SubscriptionHandle {
    shared: Weak<ViewerShared>,
    token: u64,
    id: Option<String>,
}

impl SubscriptionHandle {
    pub fn unsubscribe(&self) {
        if let Some(shared) = self.shared.upgrade() {
            let mut listeners = shared.listeners.lock().expect("listener set poisoned");
            listeners.unsubscribe(self.token, self.id.as_deref());
        }
    }
}

pub struct ViewerMultiplexer {
    shared: Arc<ViewerShared>,
    task: JoinHandle<()>,
}

impl ViewerMultiplexer {
    /// Open the channel and subscribe to `ids` within `namespace`; an
    /// empty id set subscribes to the whole namespace.
    pub async fn connect(
        channel_url: &str,
        namespace: &str,
        ids: &[String],
    ) -> Result<Self, ViewerError> {
        let mut url = Url::parse(channel_url)
            .map_err(|error| ViewerError::InvalidUrl(error.to_string()))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("namespace", namespace);
            for id in ids {
                query.append_pair("id", id);
            }
        }

        let (ws, _response) = connect_async(url.as_str()).await?;
        let (mut ws_tx, mut ws_rx) = ws.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<WsMessage>();
        let shared = Arc::new(ViewerShared {
            outbound: outbound_tx,
            listeners: Mutex::new(ListenerSet::new()),
            connected: AtomicBool::new(false),
        });

        let writer = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if ws_tx.send(frame).await.is_err() {
                    break;
                }
            }
        });

        let reader_shared = shared.clone();
        let task = tokio::spawn(async move {
            set_connected(&reader_shared, true);
            while let Some(frame) = ws_rx.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => dispatch_frame(&reader_shared, &text),
                    Ok(WsMessage::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            set_connected(&reader_shared, false);
            writer.abort();
        });

        Ok(Self { shared, task })
    }

    /// Listen to every event on the channel, including lifecycle and
    /// connection transitions. A subscriber that joins an already-open
    /// channel sees `MultiplexerConnected` first.
    pub fn subscribe(&self) -> (SubscriptionHandle, mpsc::UnboundedReceiver<ViewerEvent>) {
        let mut listeners = self.shared.listeners.lock().expect("listener set poisoned");
        let (token, rx) = listeners.subscribe_global();
        if self.shared.connected.load(Ordering::SeqCst) {
            if let Some(tx) = listeners.global.get(&token) {
                let _ = tx.send(ViewerEvent::MultiplexerConnected);
            }
        }
        (
            SubscriptionHandle {
                shared: Arc::downgrade(&self.shared),
                token,
                id: None,
            },
            rx,
        )
    }

    /// Listen only to events whose envelope id matches.
    pub fn subscribe_id(&self, id: &str) -> (SubscriptionHandle, mpsc::UnboundedReceiver<ViewerEvent>) {
        let mut listeners = self.shared.listeners.lock().expect("listener set poisoned");
        let (token, rx) = listeners.subscribe_id(id);
        (
            SubscriptionHandle {
                shared: Arc::downgrade(&self.shared),
                token,
                id: Some(id.to_string()),
            },
            rx,
        )
    }

    /// Envelope and write one client→server message for `id`.
    pub fn send(&self, id: &str, message: &ClientMessage) -> Result<(), ViewerError> {
        let envelope = envelope_client_message(id, message)?;
        let text = serde_json::to_string(&envelope).map_err(ProtocolError::from)?;
        self.shared
            .outbound
            .send(WsMessage::Text(text))
            .map_err(|_| ViewerError::ChannelClosed)
    }

    pub fn send_key(&self, id: &str, key: &str) -> Result<(), ViewerError> {
        self.send(
            id,
            &ClientMessage::Key {
                key: key.to_string(),
                modifiers: None,
            },
        )
    }

    pub fn send_resize(&self, id: &str, cols: u16, rows: u16) -> Result<(), ViewerError> {
        self.send(id, &ClientMessage::Resize { cols, rows })
    }

    /// Wheel input always uses the explicit scroll form on the wire.
    pub fn send_scroll(&self, id: &str, x: u16, y: u16, lines: i32) -> Result<(), ViewerError> {
        self.send(id, &ClientMessage::Scroll { x, y, lines })
    }

    /// Close the channel and stop the pump.
    pub async fn close(self) {
        let _ = self.shared.outbound.send(WsMessage::Close(None));
        let _ = tokio::time::timeout(std::time::Duration::from_secs(1), self.task).await;
    }
}

/// Flip the connection flag and announce it under the listener lock, so
/// a concurrent subscribe sees either the flag or the event, never both.
fn set_connected(shared: &Arc<ViewerShared>, connected: bool) {
    let listeners = shared.listeners.lock().expect("listener set poisoned");
    shared.connected.store(connected, Ordering::SeqCst);
    let event = if connected {
        ViewerEvent::MultiplexerConnected
    } else {
        ViewerEvent::MultiplexerDisconnected
    };
    listeners.dispatch_global(event);
}

fn dispatch_frame(shared: &Arc<ViewerShared>, text: &str) {
    let envelope = match serde_json::from_str::<InboundEnvelope>(text) {
        Ok(envelope) => envelope,
        Err(error) => {
            warn!(%error, "dropping malformed channel frame");
            return;
        }
    };
    let listeners = shared.listeners.lock().expect("listener set poisoned");
    match envelope {
        InboundEnvelope::Data { id, data } => match serde_json::from_str::<ServerMessage>(&data) {
            Ok(message) => {
                let stream = id.clone();
                listeners.dispatch_for(&stream, ViewerEvent::Data { id, message });
            }
            Err(error) => warn!(%error, "dropping malformed server message"),
        },
        InboundEnvelope::Event { id, event, error } => {
            debug!(%id, ?event, "upstream lifecycle event");
            let stream = id.clone();
            listeners.dispatch_for(&stream, ViewerEvent::Upstream { id, event, error });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_event(id: &str) -> ViewerEvent {
        ViewerEvent::Data {
            id: id.to_string(),
            message: ServerMessage::Pong,
        }
    }

    #[test]
    fn per_id_listeners_only_see_their_stream() {
        let mut listeners = ListenerSet::new();
        let (_token_a, mut rx_a) = listeners.subscribe_id("a");
        let (_token_b, mut rx_b) = listeners.subscribe_id("b");
        listeners.dispatch_for("a", data_event("a"));
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn global_listeners_see_everything() {
        let mut listeners = ListenerSet::new();
        let (_token, mut rx) = listeners.subscribe_global();
        listeners.dispatch_for("a", data_event("a"));
        listeners.dispatch_global(ViewerEvent::MultiplexerDisconnected);
        assert!(matches!(rx.try_recv().unwrap(), ViewerEvent::Data { .. }));
        assert!(matches!(
            rx.try_recv().unwrap(),
            ViewerEvent::MultiplexerDisconnected
        ));
    }

    #[test]
    fn unsubscribe_is_idempotent_and_bounds_memory() {
        let mut listeners = ListenerSet::new();
        let (token, _rx) = listeners.subscribe_id("a");
        listeners.unsubscribe(token, Some("a"));
        listeners.unsubscribe(token, Some("a"));
        assert!(listeners.per_id.is_empty());
    }
}
