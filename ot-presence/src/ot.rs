//! Presence capability of an OT type.
//!
//! The presence layer never applies ops itself; it only needs an OT type to
//! move a presence value across an op. Types that cannot do that report
//! `supports_presence() == false` and are rejected at update time.

use serde_json::{json, Value};
use thiserror::Error;

/// Errors raised by a type's presence transform.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransformError {
    #[error("Invalid op: {0}")]
    InvalidOp(String),
    #[error("Invalid presence: {0}")]
    InvalidPresence(String),
}

/// The slice of an OT type the presence layer depends on.
pub trait PresenceType {
    /// Stable type identifier stamped on outbound messages.
    fn uri(&self) -> &str;

    fn supports_presence(&self) -> bool {
        true
    }

    /// Move `presence` across `op`.
    ///
    /// `is_own_op` is true when the op was authored by the same client as the
    /// presence, which lets a type push an author's cursor past its own
    /// insertion while leaving other cursors at the same position in place.
    fn transform_presence(
        &self,
        presence: &Value,
        op: &Value,
        is_own_op: bool,
    ) -> Result<Value, TransformError>;
}

/// Transform the value in `slot` across `op`, leaving an empty slot alone.
///
/// On failure the slot keeps its previous value.
pub(crate) fn transform_in_place(
    doc_type: &dyn PresenceType,
    slot: &mut Option<Value>,
    op: &Value,
    is_own_op: bool,
) -> Result<(), TransformError> {
    if let Some(current) = slot.as_ref() {
        let next = doc_type.transform_presence(current, op, is_own_op)?;
        *slot = Some(next).filter(|value| !value.is_null());
    }
    Ok(())
}

/// Plain-text type with `{index}` cursors.
///
/// Ops are a single insert `{"index": n, "value": "text"}` or delete
/// `{"index": n, "del": count}`; lengths are counted in chars.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextType;

impl TextType {
    pub const URI: &'static str = "http://ot-presence.dev/types/text";
}

/// A parsed text op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TextOp {
    Insert { index: u64, len: u64 },
    Delete { index: u64, len: u64 },
}

impl TextOp {
    fn parse(op: &Value) -> Result<Self, TransformError> {
        let index = op
            .get("index")
            .and_then(Value::as_u64)
            .ok_or_else(|| TransformError::InvalidOp(format!("missing index in {op}")))?;

        if let Some(text) = op.get("value").and_then(Value::as_str) {
            return Ok(TextOp::Insert {
                index,
                len: text.chars().count() as u64,
            });
        }
        if let Some(len) = op.get("del").and_then(Value::as_u64) {
            return Ok(TextOp::Delete { index, len });
        }
        Err(TransformError::InvalidOp(format!("expected value or del in {op}")))
    }

    fn transform_index(self, cursor: u64, is_own_op: bool) -> u64 {
        match self {
            TextOp::Insert { index, len } => {
                if cursor > index || (cursor == index && is_own_op) {
                    cursor.saturating_add(len)
                } else {
                    cursor
                }
            }
            TextOp::Delete { index, len } => {
                if cursor > index {
                    cursor - len.min(cursor - index)
                } else {
                    cursor
                }
            }
        }
    }
}

impl PresenceType for TextType {
    fn uri(&self) -> &str {
        Self::URI
    }

    fn transform_presence(
        &self,
        presence: &Value,
        op: &Value,
        is_own_op: bool,
    ) -> Result<Value, TransformError> {
        let cursor = presence
            .get("index")
            .and_then(Value::as_u64)
            .ok_or_else(|| TransformError::InvalidPresence(presence.to_string()))?;
        let op = TextOp::parse(op)?;

        let mut transformed = presence.clone();
        transformed["index"] = json!(op.transform_index(cursor, is_own_op));
        Ok(transformed)
    }
}
