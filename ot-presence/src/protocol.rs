//! JSON wire protocol for presence messages.
//!
//! Wire format (short keys, JSON object):
//! ```text
//! { a: "p", id, c, d, v, p, t, r, u, seq, src? }
//!   │       │   │  │  │  │  │  │  │   │    └─ authoring connection (stamped by server)
//!   │       │   │  │  │  │  │  │  │   └─ per-connection sequence number
//!   │       │   │  │  │  │  │  │  └─ sender is unsubscribing
//!   │       │   │  │  │  │  │  └─ ask receivers to re-send their presence
//!   │       │   │  │  │  │  └─ OT type URI (stamped at flush)
//!   │       │   │  │  │  └─ presence value (null = cleared)
//!   │       │   │  │  └─ document version (stamped at flush)
//!   │       │   │  └─ document id
//!   │       │   └─ collection
//!   │       └─ presence id
//!   └─ action
//! ```
//!
//! Inbound JSON is first decoded loosely into [`RawPresenceMessage`] and then
//! validated into a [`PresenceMessage`]; every violation is a
//! [`ProtocolError`] (code class 4000).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::connection::ConnectionId;
use crate::error::PresenceError;

/// Action tag of presence messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    #[serde(rename = "p")]
    Presence,
}

/// Per-update send options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Ask every peer on the document to re-send its presence.
    pub request_presence: bool,
    /// Tell the server this connection is leaving the presence channel.
    pub unsubscribe: bool,
}

impl SendOptions {
    pub fn request_presence() -> Self {
        Self {
            request_presence: true,
            ..Self::default()
        }
    }
}

/// A validated presence message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceMessage {
    #[serde(rename = "a")]
    pub action: Action,
    #[serde(rename = "id")]
    pub presence_id: String,
    #[serde(rename = "c")]
    pub collection: String,
    #[serde(rename = "d")]
    pub doc_id: String,
    /// Document version the value is relative to. `None` until flushed.
    #[serde(rename = "v")]
    pub version: Option<u64>,
    #[serde(rename = "p")]
    pub value: Option<Value>,
    /// Document type URI. `None` until flushed.
    #[serde(rename = "t")]
    pub type_uri: Option<String>,
    #[serde(rename = "r")]
    pub request_presence: bool,
    #[serde(rename = "u")]
    pub unsubscribe: bool,
    pub seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<ConnectionId>,
}

impl PresenceMessage {
    /// Build an unstamped message; version and type are filled in at flush.
    pub fn new(
        presence_id: impl Into<String>,
        collection: impl Into<String>,
        doc_id: impl Into<String>,
        value: Option<Value>,
        seq: u64,
        options: SendOptions,
    ) -> Self {
        Self {
            action: Action::Presence,
            presence_id: presence_id.into(),
            collection: collection.into(),
            doc_id: doc_id.into(),
            version: None,
            value,
            type_uri: None,
            request_presence: options.request_presence,
            unsubscribe: options.unsubscribe,
            seq,
            src: None,
        }
    }

    /// Serialize to JSON wire format.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Decode and validate JSON wire format.
    pub fn decode(json: &str) -> Result<Self, ProtocolError> {
        RawPresenceMessage::decode(json)?.validate()
    }
}

/// Loosely-typed inbound message, as received before validation.
///
/// Every field is kept as raw JSON so a message with wrongly typed fields
/// still decodes and can be routed to its document's error channel.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawPresenceMessage {
    #[serde(rename = "a", default)]
    pub action: Value,
    #[serde(default)]
    pub id: Value,
    #[serde(rename = "c", default)]
    pub collection: Value,
    #[serde(rename = "d", default)]
    pub doc_id: Value,
    #[serde(rename = "v", default)]
    pub version: Value,
    #[serde(rename = "p", default)]
    pub value: Value,
    #[serde(rename = "t", default)]
    pub type_uri: Value,
    #[serde(rename = "r", default)]
    pub request_presence: Value,
    #[serde(rename = "u", default)]
    pub unsubscribe: Value,
    #[serde(default)]
    pub seq: Value,
    #[serde(default)]
    pub src: Value,
}

impl RawPresenceMessage {
    pub fn decode(json: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(json).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    /// `(collection, doc id)` the message names, rendered as text even when
    /// the fields have the wrong JSON type. Used to find the document whose
    /// error channel receives a validation failure.
    pub fn route_key(&self) -> Option<(String, String)> {
        let collection = text_of(&self.collection)?;
        let doc_id = text_of(&self.doc_id)?;
        Some((collection, doc_id))
    }

    pub fn validate(self) -> Result<PresenceMessage, ProtocolError> {
        match &self.action {
            Value::Null => {}
            Value::String(action) if action == "p" => {}
            other => return Err(ProtocolError::InvalidAction(plain_text(other))),
        }
        let presence_id = match self.id {
            Value::String(id) if !id.is_empty() => id,
            _ => return Err(ProtocolError::MissingPresenceId),
        };
        let collection = match self.collection {
            Value::String(collection) => collection,
            other => return Err(ProtocolError::InvalidCollection(other.to_string())),
        };
        let doc_id = match self.doc_id {
            Value::String(doc_id) => doc_id,
            other => return Err(ProtocolError::InvalidDocId(other.to_string())),
        };
        let version = match &self.version {
            Value::Null => None,
            other => Some(
                other
                    .as_u64()
                    .ok_or_else(|| ProtocolError::InvalidVersion(other.to_string()))?,
            ),
        };
        let seq = self
            .seq
            .as_u64()
            .ok_or_else(|| ProtocolError::InvalidSeq(self.seq.to_string()))?;
        let type_uri = match self.type_uri {
            Value::Null => None,
            Value::String(uri) => Some(uri),
            other => return Err(ProtocolError::InvalidTypeUri(other.to_string())),
        };
        let request_presence = flag("r", &self.request_presence)?;
        let unsubscribe = flag("u", &self.unsubscribe)?;
        let src = match &self.src {
            Value::Null => None,
            Value::String(src) => Some(
                src.parse::<ConnectionId>()
                    .map_err(|_| ProtocolError::InvalidSource(src.clone()))?,
            ),
            other => return Err(ProtocolError::InvalidSource(other.to_string())),
        };

        Ok(PresenceMessage {
            action: Action::Presence,
            presence_id,
            collection,
            doc_id,
            version,
            value: Some(self.value).filter(|value| !value.is_null()),
            type_uri,
            request_presence,
            unsubscribe,
            seq,
            src,
        })
    }
}

impl From<PresenceMessage> for RawPresenceMessage {
    fn from(message: PresenceMessage) -> Self {
        Self {
            action: Value::from("p"),
            id: Value::String(message.presence_id),
            collection: Value::String(message.collection),
            doc_id: Value::String(message.doc_id),
            version: message.version.map(Value::from).unwrap_or(Value::Null),
            value: message.value.unwrap_or(Value::Null),
            type_uri: message.type_uri.map(Value::String).unwrap_or(Value::Null),
            request_presence: Value::Bool(message.request_presence),
            unsubscribe: Value::Bool(message.unsubscribe),
            seq: Value::from(message.seq),
            src: message
                .src
                .map(|src| Value::String(src.to_string()))
                .unwrap_or(Value::Null),
        }
    }
}

/// Boolean flag; absent means `false`.
fn flag(name: &'static str, value: &Value) -> Result<bool, ProtocolError> {
    match value {
        Value::Null => Ok(false),
        Value::Bool(set) => Ok(*set),
        other => Err(ProtocolError::InvalidFlag(name, other.to_string())),
    }
}

fn plain_text(value: &Value) -> String {
    value
        .as_str()
        .map_or_else(|| value.to_string(), str::to_owned)
}

fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Server acknowledgement of one outbound presence message.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceAck {
    pub collection: String,
    pub doc_id: String,
    pub presence_id: String,
    pub seq: u64,
    pub error: Option<PresenceError>,
}

impl PresenceAck {
    /// Successful acknowledgement of `message`.
    pub fn ok(message: &PresenceMessage) -> Self {
        Self {
            collection: message.collection.clone(),
            doc_id: message.doc_id.clone(),
            presence_id: message.presence_id.clone(),
            seq: message.seq,
            error: None,
        }
    }

    /// Failed acknowledgement of `message`.
    pub fn err(message: &PresenceMessage, error: PresenceError) -> Self {
        Self {
            error: Some(error),
            ..Self::ok(message)
        }
    }
}

/// Protocol errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Missing presence ID")]
    MissingPresenceId,
    #[error("Invalid collection: {0}")]
    InvalidCollection(String),
    #[error("Invalid document ID: {0}")]
    InvalidDocId(String),
    #[error("Invalid version: {0}")]
    InvalidVersion(String),
    #[error("Invalid action: {0}")]
    InvalidAction(String),
    #[error("Invalid sequence number: {0}")]
    InvalidSeq(String),
    #[error("Invalid type URI: {0}")]
    InvalidTypeUri(String),
    #[error("Invalid flag {0}: {1}")]
    InvalidFlag(&'static str, String),
    #[error("Invalid source connection: {0}")]
    InvalidSource(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: Value) -> RawPresenceMessage {
        serde_json::from_value(value).unwrap()
    }

    fn valid() -> Value {
        json!({
            "a": "p", "id": "presence-1", "c": "books", "d": "northern-lights",
            "v": 1, "p": {"index": 3}, "t": "text", "r": false, "u": false, "seq": 4
        })
    }

    #[test]
    fn test_validate_ok() {
        let msg = raw(valid()).validate().unwrap();
        assert_eq!(msg.presence_id, "presence-1");
        assert_eq!(msg.collection, "books");
        assert_eq!(msg.doc_id, "northern-lights");
        assert_eq!(msg.version, Some(1));
        assert_eq!(msg.value, Some(json!({"index": 3})));
        assert_eq!(msg.type_uri.as_deref(), Some("text"));
        assert_eq!(msg.seq, 4);
        assert!(msg.src.is_none());
    }

    #[test]
    fn test_null_version_and_value() {
        let mut value = valid();
        value["v"] = Value::Null;
        value["p"] = Value::Null;
        let msg = raw(value).validate().unwrap();
        assert_eq!(msg.version, None);
        assert_eq!(msg.value, None);
    }

    #[test]
    fn test_missing_id_rejected() {
        let mut value = valid();
        value["id"] = Value::Null;
        assert_eq!(raw(value).validate(), Err(ProtocolError::MissingPresenceId));

        let mut value = valid();
        value["id"] = json!("");
        assert_eq!(raw(value).validate(), Err(ProtocolError::MissingPresenceId));
    }

    #[test]
    fn test_numeric_collection_rejected() {
        let mut value = valid();
        value["c"] = json!(1);
        let message = raw(value);
        assert_eq!(
            message.route_key(),
            Some(("1".to_string(), "northern-lights".to_string()))
        );
        assert_eq!(
            message.validate(),
            Err(ProtocolError::InvalidCollection("1".into()))
        );
    }

    #[test]
    fn test_negative_version_rejected() {
        let mut value = valid();
        value["v"] = json!(-1);
        assert!(matches!(
            raw(value).validate(),
            Err(ProtocolError::InvalidVersion(_))
        ));
    }

    #[test]
    fn test_fractional_version_rejected() {
        let mut value = valid();
        value["v"] = json!(1.5);
        assert!(matches!(
            raw(value).validate(),
            Err(ProtocolError::InvalidVersion(_))
        ));
    }

    #[test]
    fn test_wrong_action_rejected() {
        let mut value = valid();
        value["a"] = json!("op");
        assert_eq!(
            raw(value).validate(),
            Err(ProtocolError::InvalidAction("op".into()))
        );
    }

    #[test]
    fn test_missing_seq_rejected() {
        let mut value = valid();
        value.as_object_mut().unwrap().remove("seq");
        assert_eq!(
            raw(value).validate(),
            Err(ProtocolError::InvalidSeq("null".into()))
        );
    }

    #[test]
    fn test_mistyped_fields_still_routable() {
        for (field, bad) in [
            ("seq", json!("4")),
            ("r", json!(1)),
            ("u", json!("yes")),
            ("t", json!(7)),
            ("src", json!("not-a-uuid")),
        ] {
            let mut value = valid();
            value[field] = bad;
            let message = raw(value);
            assert_eq!(
                message.route_key(),
                Some(("books".to_string(), "northern-lights".to_string()))
            );
            assert!(message.validate().is_err(), "{field} accepted");
        }
    }

    #[test]
    fn test_absent_flags_default_off() {
        let mut value = valid();
        let fields = value.as_object_mut().unwrap();
        fields.remove("r");
        fields.remove("u");
        fields.remove("t");
        let msg = raw(value).validate().unwrap();
        assert!(!msg.request_presence);
        assert!(!msg.unsubscribe);
        assert_eq!(msg.type_uri, None);
    }

    #[test]
    fn test_raw_round_trip_keeps_source() {
        let mut msg = PresenceMessage::new("p1", "books", "doc", None, 3, SendOptions::default());
        msg.src = Some(uuid::Uuid::new_v4());
        msg.version = Some(2);
        let validated = RawPresenceMessage::from(msg.clone()).validate().unwrap();
        assert_eq!(validated, msg);
    }

    #[test]
    fn test_encode_uses_short_keys() {
        let msg = PresenceMessage::new(
            "presence-1",
            "books",
            "northern-lights",
            Some(json!({"index": 1})),
            7,
            SendOptions::request_presence(),
        );
        let encoded: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(encoded["a"], json!("p"));
        assert_eq!(encoded["id"], json!("presence-1"));
        assert_eq!(encoded["v"], Value::Null);
        assert_eq!(encoded["r"], json!(true));
        assert_eq!(encoded["u"], json!(false));
        assert_eq!(encoded["seq"], json!(7));
        assert!(encoded.get("src").is_none());
    }

    #[test]
    fn test_decode_garbage() {
        assert!(matches!(
            PresenceMessage::decode("{not json"),
            Err(ProtocolError::Deserialization(_))
        ));
    }

    #[test]
    fn test_decode_validates() {
        let json = r#"{"a":"p","c":"books","d":"doc","v":1,"p":null,"seq":1}"#;
        assert_eq!(
            PresenceMessage::decode(json),
            Err(ProtocolError::MissingPresenceId)
        );
    }

    #[test]
    fn test_ack_helpers() {
        let msg = PresenceMessage::new("p1", "books", "doc", None, 3, SendOptions::default());
        let ack = PresenceAck::ok(&msg);
        assert_eq!(ack.seq, 3);
        assert!(ack.error.is_none());

        let ack = PresenceAck::err(&msg, PresenceError::rejected(4000, "bad"));
        assert_eq!(ack.error.and_then(|e| e.code()), Some(4000));
    }
}
