//! WebSocket surface of the relay. Upstreams bind at
//! `/_tunnel/upstream?namespace=<ns>&id=<id>`; downstream viewers attach
//! at `/_tunnel/multiplexer?namespace=<ns>[&id=..]` with wildcard support.

use std::borrow::Cow;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{RawQuery, State};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use porthole_protocol::{
    ClientMessage, InboundEnvelope, ServerMessage, UpstreamEvent, CLOSE_TUNNEL_INACTIVE,
    CLOSE_UPSTREAM_TAKEN, REASON_TUNNEL_INACTIVE, REASON_UPSTREAM_TAKEN,
};
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::share::{share_page, share_page_default_namespace};
use crate::state::{tunnel_inactive_error, RelayState, Upstream, Watcher};

pub fn build_router(state: Arc<RelayState>) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET])
        .allow_origin(tower_http::cors::Any);
    Router::new()
        .route("/_tunnel/upstream", get(upstream_handler))
        .route("/_tunnel/multiplexer", get(downstream_handler))
        .route("/s/:id", get(share_page_default_namespace))
        .route("/s/:namespace/:id", get(share_page))
        .route("/health", get(|| async { "ok" }))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

#[derive(Debug, PartialEq, Eq)]
struct TunnelParams {
    namespace: Option<String>,
    ids: Vec<String>,
}

impl TunnelParams {
    fn parse(query: &str) -> Self {
        let mut namespace = None;
        let mut ids = Vec::new();
        for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match name.as_ref() {
                "namespace" if !value.is_empty() => namespace = Some(value.into_owned()),
                "id" => {
                    for id in value.split(',').filter(|id| !id.is_empty()) {
                        ids.push(id.to_string());
                    }
                }
                _ => {}
            }
        }
        Self { namespace, ids }
    }
}

async fn upstream_handler(
    ws: WebSocketUpgrade,
    RawQuery(query): RawQuery,
    State(state): State<Arc<RelayState>>,
) -> Response {
    let params = TunnelParams::parse(query.as_deref().unwrap_or(""));
    let Some(id) = params.ids.first().cloned() else {
        return (StatusCode::BAD_REQUEST, "missing id").into_response();
    };
    let namespace = params.namespace.unwrap_or_else(|| id.clone());
    ws.on_upgrade(move |socket| handle_upstream(state, namespace, id, socket))
        .into_response()
}

async fn handle_upstream(
    state: Arc<RelayState>,
    namespace_name: String,
    id: String,
    mut socket: WebSocket,
) {
    let namespace = state.namespace(&namespace_name);
    let conn = state.next_conn();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let last_seen = Arc::new(RwLock::new(Instant::now()));

    let bound = namespace.bind_upstream(
        &id,
        Upstream {
            conn,
            tx: tx.clone(),
            last_seen: last_seen.clone(),
        },
    );
    if !bound {
        warn!(namespace = %namespace_name, id = %id, "rejecting duplicate upstream bind");
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_UPSTREAM_TAKEN,
                reason: Cow::Borrowed(REASON_UPSTREAM_TAKEN),
            })))
            .await;
        return;
    }

    info!(namespace = %namespace_name, id = %id, conn, "upstream bound");
    namespace.broadcast_event(&id, UpstreamEvent::UpstreamDiscovered, None);
    namespace.broadcast_event(&id, UpstreamEvent::UpstreamConnected, None);

    let (mut ws_tx, mut ws_rx) = socket.split();
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let closing = matches!(frame, Message::Close(_));
            if ws_tx.send(frame).await.is_err() || closing {
                break;
            }
        }
    });

    while let Some(frame) = ws_rx.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                match serde_json::from_str::<InboundEnvelope>(&text) {
                    Ok(InboundEnvelope::Data { id: envelope_id, .. }) => {
                        if envelope_id == id {
                            namespace.forward_to_watchers(&id, &text);
                        } else {
                            debug!(%envelope_id, bound = %id, "dropping mismatched envelope");
                        }
                    }
                    Ok(InboundEnvelope::Event { .. }) => {
                        debug!(%id, "ignoring lifecycle event from upstream");
                    }
                    Err(_) => match serde_json::from_str::<ClientMessage>(&text) {
                        Ok(ClientMessage::Ping) => {
                            *last_seen.write().await = Instant::now();
                            if let Ok(pong) = serde_json::to_string(&ServerMessage::Pong) {
                                let _ = tx.send(Message::Text(pong));
                            }
                        }
                        _ => debug!(%id, "dropping unrecognized upstream frame"),
                    },
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    writer.abort();
    if namespace.release_upstream(&id, conn) {
        info!(namespace = %namespace_name, id = %id, "upstream closed");
        namespace.broadcast_event(&id, UpstreamEvent::UpstreamClosed, None);
    }
}

async fn downstream_handler(
    ws: WebSocketUpgrade,
    RawQuery(query): RawQuery,
    State(state): State<Arc<RelayState>>,
) -> Response {
    let params = TunnelParams::parse(query.as_deref().unwrap_or(""));
    let namespace = params
        .namespace
        .or_else(|| params.ids.first().cloned())
        .unwrap_or_else(|| "default".to_string());
    ws.on_upgrade(move |socket| handle_downstream(state, namespace, params.ids, socket))
        .into_response()
}

async fn handle_downstream(
    state: Arc<RelayState>,
    namespace_name: String,
    ids: Vec<String>,
    mut socket: WebSocket,
) {
    let namespace = state.namespace(&namespace_name);

    if !ids.is_empty() && !ids.iter().any(|id| namespace.has_upstream(id)) {
        debug!(namespace = %namespace_name, ?ids, "no upstream for requested ids");
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_TUNNEL_INACTIVE,
                reason: Cow::Borrowed(REASON_TUNNEL_INACTIVE),
            })))
            .await;
        return;
    }

    let conn = state.next_conn();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if ws_tx.send(frame).await.is_err() {
                break;
            }
        }
    });

    // Late joiners learn about already-bound upstreams before any data
    // flows for them.
    let wildcard = ids.is_empty();
    for bound in namespace.bound_ids() {
        if wildcard || ids.contains(&bound) {
            if wildcard {
                send_event(&tx, &bound, UpstreamEvent::UpstreamDiscovered);
            }
            send_event(&tx, &bound, UpstreamEvent::UpstreamConnected);
        }
    }

    let watcher = Watcher {
        tx: tx.clone(),
        ids: ids.clone(),
    };
    namespace.add_watcher(conn, watcher);
    debug!(namespace = %namespace_name, conn, wildcard, "downstream attached");

    while let Some(frame) = ws_rx.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<InboundEnvelope>(&text) {
                Ok(InboundEnvelope::Data { id, .. }) => {
                    if !wildcard && !ids.contains(&id) {
                        debug!(%id, "dropping envelope outside subscription");
                        continue;
                    }
                    match namespace.upstream_tx(&id) {
                        Some(upstream) => {
                            let _ = upstream.send(Message::Text(text));
                        }
                        None => {
                            if let Some(error) = tunnel_inactive_error(&id) {
                                let _ = tx.send(Message::Text(error));
                            }
                        }
                    }
                }
                Ok(InboundEnvelope::Event { .. }) => {
                    debug!("ignoring lifecycle event from downstream");
                }
                Err(_) => match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(ClientMessage::Ping) => {
                        if let Ok(pong) = serde_json::to_string(&ServerMessage::Pong) {
                            let _ = tx.send(Message::Text(pong));
                        }
                    }
                    _ => debug!("dropping unrecognized downstream frame"),
                },
            },
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    namespace.remove_watcher(conn);
    writer.abort();
    debug!(namespace = %namespace_name, conn, "downstream detached");
}

fn send_event(tx: &mpsc::UnboundedSender<Message>, id: &str, event: UpstreamEvent) {
    let frame = InboundEnvelope::event(id, event);
    if let Ok(text) = serde_json::to_string(&frame) {
        let _ = tx.send(Message::Text(text));
    }
}
