//! Reverse-polarity operation: the host dials a shared relay and serves
//! one session through it, so viewers the host can never reach directly
//! get a public share URL.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use once_cell::sync::OnceCell;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::protocol::{
    envelope_server_message, ClientMessage, InboundEnvelope, ServerMessage, CLOSE_UPSTREAM_TAKEN,
};
use crate::renderer::RendererFactory;
use crate::session::{ConnectionHooks, Session, SessionConfig, SessionError, SessionHandle, SessionId};

/// Keep-alive cadence on the tunnel socket.
const KEEPALIVE_PERIOD: Duration = Duration::from_secs(20);
/// How long after the handshake the relay gets to reject a duplicate bind
/// before we consider the tunnel established.
const ADMISSION_GRACE: Duration = Duration::from_millis(500);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

static SIGNAL_GUARD: OnceCell<()> = OnceCell::new();

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("relay url is invalid: {0}")]
    InvalidUrl(String),
    #[error("upstream already connected for this id")]
    AlreadyConnected,
    #[error("failed to reach relay: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("relay closed the connection")]
    Closed,
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Notifications surfaced to the embedding application.
#[derive(Debug)]
pub enum TunnelEvent {
    Connected,
    Disconnected,
    Error(TunnelError),
}

#[derive(Clone, Debug)]
pub struct TunnelConfig {
    pub relay_url: String,
    pub id: String,
    /// Defaults to the tunnel id when absent.
    pub namespace: Option<String>,
    pub session: SessionConfig,
}

impl TunnelConfig {
    pub fn new(relay_url: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
            id: id.into(),
            namespace: None,
            session: SessionConfig::default(),
        }
    }

    fn namespace(&self) -> &str {
        self.namespace.as_deref().unwrap_or(&self.id)
    }
}

/// Derive the human-facing share URL from the relay URL: ws(s) becomes
/// http(s) and the path becomes `/s/<namespace>/<id>`, collapsing to
/// `/s/<id>` when the namespace defaults to the id.
pub fn share_url(relay_url: &str, namespace: &str, id: &str) -> Result<Url, TunnelError> {
    let mut url =
        Url::parse(relay_url).map_err(|error| TunnelError::InvalidUrl(error.to_string()))?;
    let scheme = match url.scheme() {
        "ws" | "http" => "http",
        "wss" | "https" => "https",
        other => return Err(TunnelError::InvalidUrl(format!("unsupported scheme {other}"))),
    };
    url.set_scheme(scheme)
        .map_err(|_| TunnelError::InvalidUrl("scheme rewrite failed".into()))?;
    if namespace == id {
        url.set_path(&format!("/s/{id}"));
    } else {
        url.set_path(&format!("/s/{namespace}/{id}"));
    }
    url.set_query(None);
    Ok(url)
}

fn upstream_url(config: &TunnelConfig) -> Result<Url, TunnelError> {
    let mut url = Url::parse(&config.relay_url)
        .map_err(|error| TunnelError::InvalidUrl(error.to_string()))?;
    url.set_path("/_tunnel/upstream");
    url.query_pairs_mut()
        .clear()
        .append_pair("namespace", config.namespace())
        .append_pair("id", &config.id);
    Ok(url)
}

/// A host-side tunnel: one session bound to one relay id.
#[derive(Debug)]
pub struct TunnelClient {
    share_url: Url,
    session: SessionHandle,
    shutdown: Arc<Notify>,
    task: JoinHandle<()>,
}

impl TunnelClient {
    /// Dial the relay, bind the session, and start the pump. The
    /// returned receiver carries connection lifecycle events; a 4009
    /// rejection during admission fails the connect itself.
    pub async fn connect(
        config: TunnelConfig,
        factory: &dyn RendererFactory,
        hooks: Arc<dyn ConnectionHooks>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TunnelEvent>), TunnelError> {
        let url = upstream_url(&config)?;
        let share = share_url(&config.relay_url, config.namespace(), &config.id)?;

        debug!(url = %url, "dialing relay");
        let (ws, _response) = connect_async(url.as_str()).await?;
        let (ws_tx, mut ws_rx) = ws.split();

        // The relay answers a duplicate bind by accepting the upgrade and
        // immediately closing with 4009; give it a moment to say so.
        let mut pending = None;
        match timeout(ADMISSION_GRACE, ws_rx.next()).await {
            Ok(Some(Ok(WsMessage::Close(frame)))) => {
                if close_code(&frame) == Some(CLOSE_UPSTREAM_TAKEN) {
                    return Err(TunnelError::AlreadyConnected);
                }
                return Err(TunnelError::Closed);
            }
            Ok(Some(Ok(frame))) => pending = Some(frame),
            Ok(Some(Err(error))) => return Err(error.into()),
            Ok(None) => return Err(TunnelError::Closed),
            Err(_) => {}
        }

        let session = Session::create(
            SessionId::from(config.id.as_str()),
            config.session,
            factory,
            hooks,
        )
        .await?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shutdown = Arc::new(Notify::new());
        let pump = TunnelPump {
            id: config.id.clone(),
            session: session.clone(),
            events: events_tx,
            shutdown: shutdown.clone(),
        };
        let task = tokio::spawn(pump.run(ws_tx, ws_rx, pending));

        info!(id = %config.id, share = %share, "tunnel established");
        Ok((
            Self {
                share_url: share,
                session,
                shutdown,
                task,
            },
            events_rx,
        ))
    }

    pub fn share_url(&self) -> &Url {
        &self.share_url
    }

    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    /// Ask the pump to close the channel and destroy the session.
    pub fn trigger_shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Wait for the pump to finish, however it ends.
    pub async fn closed(self) {
        let _ = self.task.await;
    }

    pub async fn shutdown(self) {
        self.shutdown.notify_one();
        let _ = self.task.await;
    }
}

/// Route SIGINT/SIGTERM into a tunnel shutdown. Returns false when the
/// handlers were already installed by an earlier tunnel in this process.
pub fn install_signal_handlers(client: &TunnelClient) -> bool {
    if SIGNAL_GUARD.set(()).is_err() {
        return false;
    }
    let shutdown = client.shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received, closing tunnel");
        shutdown.notify_one();
    });
    true
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(error) => {
            warn!(%error, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

struct TunnelPump {
    id: String,
    session: SessionHandle,
    events: mpsc::UnboundedSender<TunnelEvent>,
    shutdown: Arc<Notify>,
}

impl TunnelPump {
    async fn run(self, mut ws_tx: WsSink, mut ws_rx: WsSource, pending: Option<WsMessage>) {
        let _ = self.events.send(TunnelEvent::Connected);
        let mut output = self.session.subscribe();
        let mut keepalive = interval(KEEPALIVE_PERIOD);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        if let Some(frame) = pending {
            self.handle_ws_frame(frame);
        }

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    let _ = ws_tx.send(WsMessage::Close(None)).await;
                    break;
                }
                _ = keepalive.tick() => {
                    let ping = serde_json::to_string(&ClientMessage::Ping)
                        .expect("ping serialization is infallible");
                    if ws_tx.send(WsMessage::Text(ping)).await.is_err() {
                        let _ = self.events.send(TunnelEvent::Error(TunnelError::Closed));
                        break;
                    }
                }
                message = output.recv() => match message {
                    Ok(message) => {
                        if self.forward_outbound(&mut ws_tx, &message).await.is_err() {
                            let _ = self.events.send(TunnelEvent::Error(TunnelError::Closed));
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(id = %self.id, skipped, "tunnel lagged behind session output");
                        self.session.force_full();
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                frame = ws_rx.next() => match frame {
                    Some(Ok(WsMessage::Close(frame))) => {
                        if close_code(&frame) == Some(CLOSE_UPSTREAM_TAKEN) {
                            let _ = self
                                .events
                                .send(TunnelEvent::Error(TunnelError::AlreadyConnected));
                        }
                        break;
                    }
                    Some(Ok(frame)) => self.handle_ws_frame(frame),
                    Some(Err(error)) => {
                        let _ = self.events.send(TunnelEvent::Error(error.into()));
                        break;
                    }
                    None => break,
                },
            }
        }

        self.session.destroy();
        let _ = self.events.send(TunnelEvent::Disconnected);
    }

    async fn forward_outbound(
        &self,
        ws_tx: &mut WsSink,
        message: &ServerMessage,
    ) -> Result<(), ()> {
        let envelope = match envelope_server_message(&self.id, message) {
            Ok(envelope) => envelope,
            Err(error) => {
                warn!(id = %self.id, %error, "failed to encode outbound frame");
                return Ok(());
            }
        };
        let text = match serde_json::to_string(&envelope) {
            Ok(text) => text,
            Err(error) => {
                warn!(id = %self.id, %error, "failed to encode envelope");
                return Ok(());
            }
        };
        ws_tx.send(WsMessage::Text(text)).await.map_err(|_| ())
    }

    fn handle_ws_frame(&self, frame: WsMessage) {
        let WsMessage::Text(text) = frame else {
            return;
        };
        if let Ok(envelope) = serde_json::from_str::<InboundEnvelope>(&text) {
            match envelope {
                InboundEnvelope::Data { id, data } => {
                    if id != self.id {
                        debug!(%id, bound = %self.id, "dropping envelope for foreign id");
                        return;
                    }
                    match serde_json::from_str::<ClientMessage>(&data) {
                        Ok(message) => self.session.handle_message(message),
                        Err(error) => warn!(%error, "dropping malformed client message"),
                    }
                }
                InboundEnvelope::Event { .. } => {}
            }
            return;
        }
        match serde_json::from_str::<ServerMessage>(&text) {
            // Keep-alive answer; nothing to do.
            Ok(ServerMessage::Pong) => {}
            _ => debug!("dropping unrecognized tunnel frame"),
        }
    }
}

fn close_code(
    frame: &Option<tokio_tungstenite::tungstenite::protocol::CloseFrame<'_>>,
) -> Option<u16> {
    frame.as_ref().map(|frame| u16::from(frame.code))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn share_url_rewrites_scheme_and_path() {
        let url = share_url("wss://relay.example.com/_anything?x=1", "demo", "tty-1").unwrap();
        assert_eq!(url.as_str(), "https://relay.example.com/s/demo/tty-1");
    }

    #[test]
    fn share_url_collapses_default_namespace() {
        let url = share_url("ws://127.0.0.1:8080", "tty-1", "tty-1").unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:8080/s/tty-1");
    }

    #[test]
    fn share_url_rejects_unknown_scheme() {
        assert!(share_url("ftp://relay", "a", "a").is_err());
    }

    #[test]
    fn upstream_url_carries_namespace_and_id() {
        let config = TunnelConfig {
            relay_url: "ws://relay:9000".into(),
            id: "tty-9".into(),
            namespace: Some("team".into()),
            session: SessionConfig::default(),
        };
        let url = upstream_url(&config).unwrap();
        assert_eq!(url.path(), "/_tunnel/upstream");
        assert_eq!(url.query(), Some("namespace=team&id=tty-9"));
    }
}
