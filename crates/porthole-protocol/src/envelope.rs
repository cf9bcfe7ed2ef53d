use serde::{Deserialize, Serialize};

/// One frame on a multiplexed channel, addressed to a logical stream id.
/// `data` carries a serialized wire message so the relay can route frames
/// without understanding them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    pub data: String,
}

impl Envelope {
    pub fn new(id: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            data: data.into(),
        }
    }
}

/// Lifecycle transitions of an upstream within a namespace.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamEvent {
    UpstreamDiscovered,
    UpstreamConnected,
    UpstreamClosed,
    UpstreamError,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub message: String,
    pub name: String,
}

impl ErrorInfo {
    pub fn new(message: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            name: name.into(),
        }
    }
}

/// A frame arriving from the relay side of a multiplexed channel: either
/// a data envelope or a lifecycle event for an id.
///
/// Untagged: the `event` field distinguishes the variants, so lifecycle
/// frames must be tried first.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InboundEnvelope {
    Event {
        id: String,
        event: UpstreamEvent,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorInfo>,
    },
    Data { id: String, data: String },
}

impl InboundEnvelope {
    pub fn id(&self) -> &str {
        match self {
            InboundEnvelope::Event { id, .. } => id,
            InboundEnvelope::Data { id, .. } => id,
        }
    }

    pub fn event(id: impl Into<String>, event: UpstreamEvent) -> Self {
        InboundEnvelope::Event {
            id: id.into(),
            event,
            error: None,
        }
    }

    pub fn error(id: impl Into<String>, error: ErrorInfo) -> Self {
        InboundEnvelope::Event {
            id: id.into(),
            event: UpstreamEvent::UpstreamError,
            error: Some(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_envelope_round_trips() {
        let envelope = Envelope::new("tty-1", r#"{"type":"ping"}"#);
        let json = serde_json::to_string(&envelope).unwrap();
        let back: InboundEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(
            back,
            InboundEnvelope::Data {
                id: "tty-1".into(),
                data: r#"{"type":"ping"}"#.into(),
            }
        );
    }

    #[test]
    fn event_envelope_parses_before_data() {
        let json = r#"{"id":"tty-1","event":"upstream_connected"}"#;
        let back: InboundEnvelope = serde_json::from_str(json).unwrap();
        assert_eq!(
            back,
            InboundEnvelope::event("tty-1", UpstreamEvent::UpstreamConnected)
        );
    }

    #[test]
    fn error_event_carries_details() {
        let json = r#"{"id":"a","event":"upstream_error","error":{"message":"boom","name":"RenderError"}}"#;
        let back: InboundEnvelope = serde_json::from_str(json).unwrap();
        match back {
            InboundEnvelope::Event {
                event: UpstreamEvent::UpstreamError,
                error: Some(error),
                ..
            } => {
                assert_eq!(error.message, "boom");
                assert_eq!(error.name, "RenderError");
            }
            other => panic!("unexpected envelope: {other:?}"),
        }
    }
}
