//! Connection collaborator interface.
//!
//! The transport itself (framing, reconnect, send gating) lives outside this
//! crate. Trackers only need the operations below, and they hold the
//! connection weakly so a connection can own its trackers without a cycle.

use std::rc::Rc;

use uuid::Uuid;

use crate::document::Document;
use crate::error::PresenceError;
use crate::protocol::PresenceMessage;

/// Identifier credited as the author of ops and presence updates.
pub type ConnectionId = Uuid;

/// Callback for [`Connection::subscribe_to_presence`].
pub type SubscribeCallback = Box<dyn FnOnce(Result<(), PresenceError>)>;

pub trait Connection {
    /// Id assigned by the server, once connected.
    fn id(&self) -> Option<ConnectionId>;

    /// The document for `(collection, id)`; repeated calls return the same one.
    fn get(&self, collection: &str, id: &str) -> Rc<dyn Document>;

    /// Next value of the connection-wide monotonic sequence counter.
    fn next_seq(&self) -> u64;

    /// Whether messages can be transmitted right now.
    fn can_send(&self) -> bool;

    fn send(&self, message: PresenceMessage);

    /// Ask the server to (re)subscribe this connection to presence on the
    /// document, which makes peers re-send their current values.
    fn subscribe_to_presence(&self, collection: &str, id: &str, callback: SubscribeCallback);

    /// Forget the local presence registered for this tuple.
    fn destroy_local_presence(&self, collection: &str, id: &str, presence_id: &str);
}
