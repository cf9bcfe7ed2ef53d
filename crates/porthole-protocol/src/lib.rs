//! Wire schema shared by both polarities: client→server input messages,
//! server→client frame messages, the multiplexed envelope layer, and the
//! styled span/line/frame data model those messages carry.
//!
//! Everything is encoded as JSON text frames. Message enums are internally
//! tagged on `type`; unknown or garbled frames are dropped at the edge
//! without closing the channel.

pub mod envelope;
pub mod messages;
pub mod model;

pub use envelope::{Envelope, ErrorInfo, InboundEnvelope, UpstreamEvent};
pub use messages::{ClientMessage, Modifiers, MouseAction, ServerMessage};

use thiserror::Error;

/// Application close code: a downstream asked for a tunnel id with no
/// bound upstream.
pub const CLOSE_TUNNEL_INACTIVE: u16 = 4008;
/// Application close code: a second upstream tried to bind an id that is
/// already active.
pub const CLOSE_UPSTREAM_TAKEN: u16 = 4009;

pub const REASON_TUNNEL_INACTIVE: &str = "tunnel not active";
pub const REASON_UPSTREAM_TAKEN: &str = "Upstream already connected";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Serialize a server→client message into an envelope for `id`.
pub fn envelope_server_message(
    id: &str,
    message: &ServerMessage,
) -> Result<Envelope, ProtocolError> {
    Ok(Envelope {
        id: id.to_string(),
        data: serde_json::to_string(message)?,
    })
}

/// Serialize a client→server message into an envelope for `id`.
pub fn envelope_client_message(
    id: &str,
    message: &ClientMessage,
) -> Result<Envelope, ProtocolError> {
    Ok(Envelope {
        id: id.to_string(),
        data: serde_json::to_string(message)?,
    })
}
