use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{FleetError, Result};
use crate::proto::RawMessage;

/// Version marker every envelope must carry in its `jsonrpc` field.
pub const PROTOCOL_VERSION: &str = "2.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Request,
    Notification,
    Response,
    Error,
    Unknown,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageKind::Request => write!(f, "request"),
            MessageKind::Notification => write!(f, "notification"),
            MessageKind::Response => write!(f, "response"),
            MessageKind::Error => write!(f, "error"),
            MessageKind::Unknown => write!(f, "unknown"),
        }
    }
}

/// A classified protocol envelope.
///
/// Only the top-level fields needed for routing are decoded; the payload is
/// kept verbatim in `raw` and relayed as-is.
#[derive(Debug, Clone)]
pub struct Message {
    raw: Arc<str>,
    /// `id` exactly as it appeared in the envelope (JSON text)
    id: Option<String>,
    method: Option<String>,
    kind: MessageKind,
    /// Tracking id carried next to the envelope on the wire
    uuid: String,
}

impl Message {
    /// Parse and classify an envelope.
    ///
    /// Classification, first match wins: `id` and `method` -> Request;
    /// `method` only -> Notification; `result` -> Response; `error` -> Error;
    /// anything else -> Unknown.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let fields: HashMap<String, Box<RawValue>> = serde_json::from_slice(data)
            .map_err(|e| FleetError::InvalidEnvelope(format!("invalid JSON: {}", e)))?;

        let version = fields
            .get("jsonrpc")
            .and_then(|raw| serde_json::from_str::<String>(raw.get()).ok());
        if version.as_deref() != Some(PROTOCOL_VERSION) {
            return Err(FleetError::InvalidEnvelope(
                "missing or invalid jsonrpc version".to_string(),
            ));
        }

        let id = fields.get("id").map(|raw| raw.get().to_string());
        let method = fields
            .get("method")
            .and_then(|raw| serde_json::from_str::<String>(raw.get()).ok());

        let kind = match (&id, &method) {
            (Some(_), Some(_)) => MessageKind::Request,
            (None, Some(_)) => MessageKind::Notification,
            _ if fields.contains_key("result") => MessageKind::Response,
            _ if fields.contains_key("error") => MessageKind::Error,
            _ => MessageKind::Unknown,
        };

        Ok(Self {
            raw: Arc::from(String::from_utf8_lossy(data).as_ref()),
            id,
            method,
            kind,
            uuid: Uuid::new_v4().to_string(),
        })
    }

    /// Parse the envelope carried by a wire frame, keeping its tracking id.
    pub fn from_frame(frame: &RawMessage) -> Result<Self> {
        if frame.message.is_empty() {
            return Err(FleetError::InvalidEnvelope("empty message".to_string()));
        }

        let message = Self::parse(frame.message.as_bytes())?;
        if frame.uuid.is_empty() {
            Ok(message)
        } else {
            Ok(message.with_uuid(frame.uuid.clone()))
        }
    }

    pub fn to_frame(&self) -> RawMessage {
        RawMessage {
            message: self.raw.to_string(),
            uuid: self.uuid.clone(),
        }
    }

    pub fn request(id: impl Into<Value>, method: &str, params: Value) -> Result<Self> {
        Self::from_value(serde_json::json!({
            "jsonrpc": PROTOCOL_VERSION,
            "id": id.into(),
            "method": method,
            "params": params,
        }))
    }

    pub fn notification(method: &str, params: Value) -> Result<Self> {
        Self::from_value(serde_json::json!({
            "jsonrpc": PROTOCOL_VERSION,
            "method": method,
            "params": params,
        }))
    }

    /// Build a Response echoing the id of `request`.
    pub fn response_to(request: &Message, result: Value) -> Result<Self> {
        Self::from_value(serde_json::json!({
            "jsonrpc": PROTOCOL_VERSION,
            "id": request.id_value().unwrap_or(Value::Null),
            "result": result,
        }))
    }

    fn from_value(value: Value) -> Result<Self> {
        let data = serde_json::to_vec(&value)
            .map_err(|e| FleetError::Internal(format!("failed to encode message: {}", e)))?;
        Self::parse(&data)
    }

    pub fn with_uuid(mut self, uuid: String) -> Self {
        self.uuid = uuid;
        self
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn method(&self) -> Option<&str> {
        self.method.as_deref()
    }

    /// The `id` as raw JSON text, e.g. `"abc"` or `7`.
    pub fn id_json(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// The `id` with string quoting removed.
    pub fn id_string(&self) -> Option<String> {
        match self.id_value()? {
            Value::String(s) => Some(s),
            other => Some(other.to_string()),
        }
    }

    fn id_value(&self) -> Option<Value> {
        self.id
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Whether `self` answers `request`: a Response or Error carrying the
    /// same id.
    pub fn is_response_to(&self, request: &Message) -> bool {
        if !matches!(self.kind, MessageKind::Response | MessageKind::Error) {
            return false;
        }
        match (self.id_value(), request.id_value()) {
            (Some(ours), Some(theirs)) => ours == theirs,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kind_of(json: &str) -> MessageKind {
        Message::parse(json.as_bytes()).unwrap().kind()
    }

    #[test]
    fn classifies_each_kind() {
        assert_eq!(
            kind_of(r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#),
            MessageKind::Request
        );
        assert_eq!(
            kind_of(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#),
            MessageKind::Notification
        );
        assert_eq!(
            kind_of(r#"{"jsonrpc":"2.0","id":1,"result":{}}"#),
            MessageKind::Response
        );
        assert_eq!(
            kind_of(r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32601}}"#),
            MessageKind::Error
        );
        assert_eq!(kind_of(r#"{"jsonrpc":"2.0","id":1}"#), MessageKind::Unknown);
    }

    #[test]
    fn method_wins_over_result() {
        assert_eq!(
            kind_of(r#"{"jsonrpc":"2.0","id":"a","method":"ping","result":1}"#),
            MessageKind::Request
        );
    }

    #[test]
    fn result_without_id_is_still_a_response() {
        assert_eq!(
            kind_of(r#"{"jsonrpc":"2.0","result":true}"#),
            MessageKind::Response
        );
    }

    #[test]
    fn non_string_method_is_ignored() {
        let msg = Message::parse(br#"{"jsonrpc":"2.0","id":3,"method":5}"#).unwrap();
        assert_eq!(msg.method(), None);
        assert_eq!(msg.kind(), MessageKind::Unknown);
    }

    #[test]
    fn rejects_missing_or_wrong_version() {
        for bad in [
            r#"{"id":1,"method":"x"}"#,
            r#"{"jsonrpc":"1.0","id":1,"method":"x"}"#,
            r#"{"jsonrpc":2.0,"id":1,"method":"x"}"#,
        ] {
            assert!(matches!(
                Message::parse(bad.as_bytes()),
                Err(FleetError::InvalidEnvelope(_))
            ));
        }
    }

    #[test]
    fn rejects_malformed_input() {
        for bad in ["", "not json", "[1,2]", "\"2.0\"", "{\"jsonrpc\":"] {
            assert!(matches!(
                Message::parse(bad.as_bytes()),
                Err(FleetError::InvalidEnvelope(_))
            ));
        }
    }

    #[test]
    fn classification_is_deterministic() {
        let data = br#"{"jsonrpc":"2.0","id":"x","method":"initialize","params":{}}"#;
        let kinds: Vec<MessageKind> = (0..5).map(|_| Message::parse(data).unwrap().kind()).collect();
        assert!(kinds.iter().all(|k| *k == MessageKind::Request));
    }

    #[test]
    fn keeps_raw_payload_verbatim() {
        let data = r#"{"jsonrpc":"2.0", "method":"log", "params":{"level":"info"}}"#;
        let msg = Message::parse(data.as_bytes()).unwrap();
        assert_eq!(msg.raw(), data);
    }

    #[test]
    fn id_accessors() {
        let msg = Message::parse(br#"{"jsonrpc":"2.0","id":"abc","method":"x"}"#).unwrap();
        assert_eq!(msg.id_json(), Some("\"abc\""));
        assert_eq!(msg.id_string().as_deref(), Some("abc"));

        let numeric = Message::parse(br#"{"jsonrpc":"2.0","id":42,"method":"x"}"#).unwrap();
        assert_eq!(numeric.id_string().as_deref(), Some("42"));
    }

    #[test]
    fn built_request_and_response_correlate() {
        let request = Message::request("req-1", "tools/call", serde_json::json!({"name": "echo"})).unwrap();
        assert_eq!(request.kind(), MessageKind::Request);
        assert_eq!(request.method(), Some("tools/call"));

        let response = Message::response_to(&request, serde_json::json!({"ok": true})).unwrap();
        assert_eq!(response.kind(), MessageKind::Response);
        assert!(response.is_response_to(&request));

        let other = Message::request("req-2", "tools/call", Value::Null).unwrap();
        assert!(!response.is_response_to(&other));
        // a request never answers a request
        assert!(!request.is_response_to(&request));
    }

    #[test]
    fn numeric_and_string_ids_do_not_match() {
        let request = Message::request(1, "ping", Value::Null).unwrap();
        let response = Message::parse(br#"{"jsonrpc":"2.0","id":"1","result":{}}"#).unwrap();
        assert!(!response.is_response_to(&request));
    }

    #[test]
    fn frame_keeps_tracking_uuid() {
        let frame = RawMessage {
            message: r#"{"jsonrpc":"2.0","method":"ping"}"#.to_string(),
            uuid: "track-1".to_string(),
        };
        let msg = Message::from_frame(&frame).unwrap();
        assert_eq!(msg.uuid(), "track-1");
        assert_eq!(msg.to_frame(), frame);
    }

    #[test]
    fn empty_frame_is_invalid() {
        let frame = RawMessage {
            message: String::new(),
            uuid: String::new(),
        };
        assert!(matches!(
            Message::from_frame(&frame),
            Err(FleetError::InvalidEnvelope(_))
        ));
    }
}
