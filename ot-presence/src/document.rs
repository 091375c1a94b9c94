//! Document collaborator interface.
//!
//! A document owns the authoritative version counter and the OT type for one
//! `(collection, id)` pair. Presence trackers read `version`/`doc_type`,
//! listen to [`DocEvent`]s and publish remote values into the document's
//! presence registry; they never mutate document data or version.

use std::rc::{Rc, Weak};

use serde::Serialize;
use serde_json::Value;

use crate::connection::ConnectionId;
use crate::error::PresenceError;
use crate::ot::PresenceType;

/// An op the document has just applied. The document version has already
/// been advanced when listeners see it.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedOp {
    pub op: Value,
    /// Submitted through this client's document (including rollback
    /// inverses of such ops).
    pub local: bool,
    /// Connection credited as the op's author.
    pub origin: Option<ConnectionId>,
}

/// Events a document emits to presence trackers.
#[derive(Debug, Clone, PartialEq)]
pub enum DocEvent {
    Applied(AppliedOp),
    /// The document was (re)created; all version-relative presence is void.
    Recreated,
    Deleted,
    /// Fresh load or hard rollback; history can no longer be reconciled.
    Reloaded,
}

/// Receiver of document events.
pub trait DocListener {
    fn on_event(&self, event: &DocEvent);
}

/// Token returned by [`Document::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// One entry of a document's presence listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PresenceEntry {
    pub id: String,
    pub data: Value,
}

/// A `presence` notification.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceEvent {
    pub presence_id: String,
    pub value: Option<Value>,
}

pub trait Document {
    fn collection(&self) -> &str;
    fn id(&self) -> &str;

    /// Number of ops applied so far; increases by exactly one per op.
    fn version(&self) -> u64;

    /// The document's type, or `None` if it has not been created (or was
    /// deleted).
    fn doc_type(&self) -> Option<Rc<dyn PresenceType>>;

    fn is_destroyed(&self) -> bool {
        false
    }

    /// Ask the server for ops this document is missing.
    fn fetch(&self);

    /// Run `callback` once the document has no unacknowledged local ops.
    fn when_nothing_pending(&self, callback: Box<dyn FnOnce()>);

    /// Register a listener. Listeners are held weakly; a dropped listener
    /// simply stops receiving events.
    fn subscribe(&self, listener: Weak<dyn DocListener>) -> SubscriptionId;

    fn unsubscribe(&self, subscription: SubscriptionId) -> bool;

    /// Whether the server has confirmed this document's presence channel.
    fn subscribed_to_presence(&self) -> bool;

    fn set_subscribed_to_presence(&self, subscribed: bool);

    fn remote_presence(&self, presence_id: &str) -> Option<Value>;

    /// Store (or with `None`, remove) a peer's value, returning the previous one.
    fn set_remote_presence(&self, presence_id: &str, value: Option<Value>) -> Option<Value>;

    fn emit_presence(&self, presence_id: &str, value: Option<&Value>);

    fn emit_error(&self, error: PresenceError);
}
