//! The host's WebSocket surface: channel upgrade at
//! `/multiplexer?namespace=<ns>&id=<id>[&id=..][&cols=<n>&rows=<n>]`.
//! Repeated or comma-separated `id` parameters form the subscription; an
//! absent id set subscribes to the whole namespace (wildcard).

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{RawQuery, State};
use axum::http::Method;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::session::multiplexer::{ChannelMultiplexer, MuxSubscription};
use crate::session::registry::SessionRegistry;

pub const DEFAULT_NAMESPACE: &str = "default";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelParams {
    pub namespace: String,
    pub ids: Vec<String>,
    pub size_hint: Option<(u16, u16)>,
}

impl ChannelParams {
    /// Parse the upgrade request's query string. Unknown parameters are
    /// ignored; a malformed size hint is treated as absent.
    pub fn parse(query: &str) -> Self {
        let mut namespace = DEFAULT_NAMESPACE.to_string();
        let mut ids = Vec::new();
        let mut cols = None;
        let mut rows = None;
        for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match name.as_ref() {
                "namespace" if !value.is_empty() => namespace = value.into_owned(),
                "id" => {
                    for id in value.split(',').filter(|id| !id.is_empty()) {
                        ids.push(id.to_string());
                    }
                }
                "cols" => cols = value.parse::<u16>().ok(),
                "rows" => rows = value.parse::<u16>().ok(),
                _ => {}
            }
        }
        let size_hint = cols.zip(rows);
        Self {
            namespace,
            ids,
            size_hint,
        }
    }
}

pub fn build_router(registry: Arc<SessionRegistry>) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET])
        .allow_origin(tower_http::cors::Any);
    Router::new()
        .route("/multiplexer", get(multiplexer_handler))
        .route("/health", get(|| async { "ok" }))
        .with_state(registry)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

async fn multiplexer_handler(
    ws: WebSocketUpgrade,
    RawQuery(query): RawQuery,
    State(registry): State<Arc<SessionRegistry>>,
) -> Response {
    let params = ChannelParams::parse(query.as_deref().unwrap_or(""));
    ws.on_upgrade(move |socket| handle_channel(registry, params, socket))
        .into_response()
}

async fn handle_channel(registry: Arc<SessionRegistry>, params: ChannelParams, socket: WebSocket) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        while let Some(text) = outbound_rx.recv().await {
            if ws_tx.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let (updates_tx, mut updates_rx) = mpsc::unbounded_channel();
    let mut events = registry.subscribe_events();
    let subscription = MuxSubscription::new(params.namespace.clone(), params.ids);
    let mut mux = ChannelMultiplexer::new(
        registry.clone(),
        subscription,
        params.size_hint,
        outbound_tx,
        updates_tx,
    );
    debug!(connection = %mux.connection(), "multiplexer channel open");
    mux.announce_existing(&registry.keys_in(&params.namespace).await);
    mux.bind_subscribed();

    loop {
        tokio::select! {
            frame = ws_rx.next() => match frame {
                Some(Ok(Message::Text(text))) => mux.handle_frame(&text),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            },
            Some(update) = updates_rx.recv() => mux.on_update(update),
            event = events.recv() => match event {
                Ok(event) => mux.on_registry_event(event),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    debug!(connection = %mux.connection(), "multiplexer channel closed");
    mux.shutdown().await;
    writer.abort();
}
