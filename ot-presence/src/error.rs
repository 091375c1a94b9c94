//! Crate-level error type.
//!
//! Numeric codes are part of the wire contract and must stay stable:
//!
//! | Class | Code | Meaning |
//! |-------|------|---------|
//! | Malformed presence message | 4000 | [`ProtocolError`] |
//! | Document not created / type without presence | 9999 | capability errors |
//! | Server rejection (e.g. apply-time rollback) | 4002 | [`PresenceError::Rejected`] |

use thiserror::Error;

use crate::ot::TransformError;
use crate::protocol::ProtocolError;

/// Code for malformed presence messages.
pub const CODE_INVALID_MESSAGE: u16 = 4000;
/// Code for presence submitted against a document that cannot carry it.
pub const CODE_PRESENCE_UNAVAILABLE: u16 = 9999;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PresenceError {
    #[error("Invalid presence message: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Cannot submit presence. Document has not been created")]
    DocumentNotCreated,

    #[error("Cannot submit presence. Document type does not support presence")]
    PresenceNotSupported,

    #[error("Document has been destroyed")]
    DocumentDestroyed,

    #[error("Presence has been destroyed")]
    Destroyed,

    /// Queued message dropped by a document reload before it was sent.
    #[error("Presence message discarded by document reload")]
    Discarded,

    #[error("Presence ID must be a non-empty string")]
    InvalidPresenceId,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Presence transform failed: {0}")]
    Transform(#[from] TransformError),

    /// Error reported by the server for a presence message or an op.
    #[error("Rejected by server ({code}): {message}")]
    Rejected { code: u16, message: String },
}

impl PresenceError {
    /// Numeric error class, if this error has one on the wire.
    pub fn code(&self) -> Option<u16> {
        match self {
            PresenceError::Protocol(_) => Some(CODE_INVALID_MESSAGE),
            PresenceError::DocumentNotCreated | PresenceError::PresenceNotSupported => {
                Some(CODE_PRESENCE_UNAVAILABLE)
            }
            PresenceError::Rejected { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn rejected(code: u16, message: impl Into<String>) -> Self {
        PresenceError::Rejected {
            code,
            message: message.into(),
        }
    }
}
