//! Wire envelopes exchanged between the coordinator and runners.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Queue carrying script (app) execution requests.
pub const APP_QUEUE: &str = "runner.gptscript.app";
/// Queue carrying tool execution requests.
pub const TOOL_QUEUE: &str = "runner.gptscript.tool";
/// Queue group shared by every connected runner.
pub const RUNNER_QUEUE_GROUP: &str = "runner";

/// Category of work routed on its own queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkKind {
    #[serde(rename = "app")]
    Script,
    #[serde(rename = "tool")]
    Tool,
}

impl WorkKind {
    pub const ALL: [WorkKind; 2] = [WorkKind::Script, WorkKind::Tool];

    /// Bus subject this kind of work is published on.
    pub fn subject(self) -> &'static str {
        match self {
            Self::Script => APP_QUEUE,
            Self::Tool => TOOL_QUEUE,
        }
    }
}

impl std::fmt::Display for WorkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Script => "app",
            Self::Tool => "tool",
        };
        write!(f, "{s}")
    }
}

/// Request frame written to a runner connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkEnvelope {
    /// Inbox the runner must answer on.
    pub reply: String,
    #[serde(rename = "type")]
    pub kind: WorkKind,
    #[serde(with = "base64_bytes")]
    pub payload: Bytes,
}

/// Response frame read from a runner connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    pub reply: String,
    #[serde(with = "base64_bytes", default)]
    pub payload: Bytes,
}

impl ReplyEnvelope {
    /// Parse a frame body. Rejects frames without a reply subject, since
    /// there is nowhere to route them.
    pub fn parse(frame: &[u8]) -> Result<Self, crate::error::RelayError> {
        let envelope: ReplyEnvelope = serde_json::from_slice(frame)?;
        if envelope.reply.trim().is_empty() {
            return Err(crate::error::RelayError::MalformedFrame(
                "reply subject is empty".to_string(),
            ));
        }
        Ok(envelope)
    }
}

/// Payloads travel as base64 strings, the same encoding JSON byte arrays
/// get elsewhere in the stack.
pub(crate) mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_envelope_wire_format() {
        let envelope = WorkEnvelope {
            reply: "R1".into(),
            kind: WorkKind::Tool,
            payload: Bytes::from_static(b"ping"),
        };
        let json: serde_json::Value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["reply"], "R1");
        assert_eq!(json["type"], "tool");
        assert_eq!(json["payload"], "cGluZw==");
    }

    #[test]
    fn reply_envelope_parses_base64_payload() {
        let envelope = ReplyEnvelope::parse(br#"{"reply":"R1","payload":"cG9uZw=="}"#).unwrap();
        assert_eq!(envelope.reply, "R1");
        assert_eq!(&envelope.payload[..], b"pong");
    }

    #[test]
    fn reply_envelope_null_payload_is_empty() {
        let envelope = ReplyEnvelope::parse(br#"{"reply":"R1","payload":null}"#).unwrap();
        assert!(envelope.payload.is_empty());
    }

    #[test]
    fn reply_envelope_rejects_garbage() {
        assert!(ReplyEnvelope::parse(b"not json").is_err());
        assert!(ReplyEnvelope::parse(br#"{"payload":"cG9uZw=="}"#).is_err());
        assert!(ReplyEnvelope::parse(br#"{"reply":"","payload":""}"#).is_err());
        assert!(ReplyEnvelope::parse(br#"{"reply":"R1","payload":"%%%"}"#).is_err());
    }

    #[test]
    fn kinds_map_to_queues() {
        assert_eq!(WorkKind::Script.subject(), APP_QUEUE);
        assert_eq!(WorkKind::Tool.subject(), TOOL_QUEUE);
        assert_eq!(WorkKind::Script.to_string(), "app");
    }
}
