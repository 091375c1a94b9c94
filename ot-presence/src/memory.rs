//! In-process document and connection.
//!
//! These implement the collaborator traits without a network or a store, so
//! trackers can be driven deterministically: tests submit and acknowledge
//! ops by hand and read back what the connection would have transmitted.
//!
//! ```text
//!   MemoryConnection
//!     ├── documents: (collection, id) → Rc<MemoryDocument>
//!     ├── outbox:    Vec<PresenceMessage>   (drained by the caller)
//!     └── registry:  PresenceRegistry       (local + remote trackers)
//! ```

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::rc::{Rc, Weak};

use serde_json::Value;
use uuid::Uuid;

use crate::config::PresenceConfig;
use crate::connection::{Connection, ConnectionId, SubscribeCallback};
use crate::document::{
    AppliedOp, DocEvent, DocListener, Document, PresenceEntry, PresenceEvent, SubscriptionId,
};
use crate::error::PresenceError;
use crate::events::{Emitter, ListenerId};
use crate::local::LocalPresence;
use crate::ot::PresenceType;
use crate::protocol::{PresenceAck, PresenceMessage, RawPresenceMessage};
use crate::registry::PresenceRegistry;
use crate::remote::RemotePresence;

// ───────────────────────────────────────────────────────────────────
// Document
// ───────────────────────────────────────────────────────────────────

struct DocState {
    version: u64,
    doc_type: Option<Rc<dyn PresenceType>>,
    pending_ops: usize,
    fetches: usize,
    subscribed_to_presence: bool,
    destroyed: bool,
    remote_presences: BTreeMap<String, Value>,
}

/// A document whose version, type and op flow are driven by the caller.
pub struct MemoryDocument {
    collection: String,
    id: String,
    state: RefCell<DocState>,
    next_subscription: Cell<u64>,
    listeners: RefCell<Vec<(SubscriptionId, Weak<dyn DocListener>)>>,
    waiters: RefCell<Vec<Box<dyn FnOnce()>>>,
    presence: Emitter<PresenceEvent>,
    errors: Emitter<PresenceError>,
}

impl MemoryDocument {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Rc<Self> {
        Rc::new(Self {
            collection: collection.into(),
            id: id.into(),
            state: RefCell::new(DocState {
                version: 0,
                doc_type: None,
                pending_ops: 0,
                fetches: 0,
                subscribed_to_presence: false,
                destroyed: false,
                remote_presences: BTreeMap::new(),
            }),
            next_subscription: Cell::new(0),
            listeners: RefCell::new(Vec::new()),
            waiters: RefCell::new(Vec::new()),
            presence: Emitter::new(),
            errors: Emitter::new(),
        })
    }

    /// Create the document with `doc_type`. Counts as one version.
    pub fn create(&self, doc_type: Rc<dyn PresenceType>) {
        {
            let mut state = self.state.borrow_mut();
            state.version += 1;
            state.doc_type = Some(doc_type);
        }
        log::debug!("Created {}/{}", self.collection, self.id);
        self.notify(&DocEvent::Recreated);
    }

    /// Delete the document. Counts as one version.
    pub fn delete(&self) {
        {
            let mut state = self.state.borrow_mut();
            state.version += 1;
            state.doc_type = None;
        }
        log::debug!("Deleted {}/{}", self.collection, self.id);
        self.notify(&DocEvent::Deleted);
    }

    /// Submit a local op: applied immediately, pending until [`ack_op`].
    ///
    /// [`ack_op`]: MemoryDocument::ack_op
    pub fn submit_op(&self, op: Value, origin: Option<ConnectionId>) {
        self.state.borrow_mut().pending_ops += 1;
        self.apply_op(AppliedOp {
            op,
            local: true,
            origin,
        });
    }

    /// Acknowledge the oldest pending local op.
    pub fn ack_op(&self) {
        let drained = {
            let mut state = self.state.borrow_mut();
            state.pending_ops = state.pending_ops.saturating_sub(1);
            state.pending_ops == 0
        };
        if drained {
            self.run_waiters();
        }
    }

    /// Reject the oldest pending local op by applying its inverse.
    ///
    /// The rejected op's version is withdrawn before listeners see the
    /// inverse, so the document ends at the version it had before submitting.
    pub fn rollback(&self, inverse: Value, origin: Option<ConnectionId>) {
        let drained = {
            let mut state = self.state.borrow_mut();
            state.version = state.version.saturating_sub(1);
            state.pending_ops = state.pending_ops.saturating_sub(1);
            state.pending_ops == 0
        };
        log::debug!("Rolled back op on {}/{}", self.collection, self.id);
        self.notify(&DocEvent::Applied(AppliedOp {
            op: inverse,
            local: true,
            origin,
        }));
        if drained {
            self.run_waiters();
        }
    }

    /// Apply an op authored elsewhere.
    pub fn apply_remote_op(&self, op: Value, origin: Option<ConnectionId>) {
        self.apply_op(AppliedOp {
            op,
            local: false,
            origin,
        });
    }

    /// Advance the version by one and notify listeners.
    pub fn apply_op(&self, applied: AppliedOp) {
        let version = {
            let mut state = self.state.borrow_mut();
            state.version += 1;
            state.version
        };
        log::trace!("{}/{} applied op -> v{version}", self.collection, self.id);
        self.notify(&DocEvent::Applied(applied));
    }

    /// Replace the snapshot wholesale, as a fresh load or hard rollback does.
    pub fn reload(&self, version: u64, doc_type: Option<Rc<dyn PresenceType>>) {
        {
            let mut state = self.state.borrow_mut();
            state.version = version;
            state.doc_type = doc_type;
            state.pending_ops = 0;
        }
        log::debug!("Reloaded {}/{} at v{version}", self.collection, self.id);
        self.notify(&DocEvent::Reloaded);
        self.run_waiters();
    }

    /// Mark destroyed and drop every listener.
    pub fn destroy(&self) {
        self.state.borrow_mut().destroyed = true;
        self.listeners.borrow_mut().clear();
    }

    pub fn pending_ops(&self) -> usize {
        self.state.borrow().pending_ops
    }

    /// How many times a tracker asked for missing ops.
    pub fn fetch_count(&self) -> usize {
        self.state.borrow().fetches
    }

    /// Live event subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.listeners
            .borrow()
            .iter()
            .filter(|(_, listener)| listener.strong_count() > 0)
            .count()
    }

    /// Current remote presence listing, ordered by presence id.
    pub fn presences(&self) -> Vec<PresenceEntry> {
        self.state
            .borrow()
            .remote_presences
            .iter()
            .map(|(id, data)| PresenceEntry {
                id: id.clone(),
                data: data.clone(),
            })
            .collect()
    }

    pub fn on_presence(&self, listener: impl Fn(&PresenceEvent) + 'static) -> ListenerId {
        self.presence.on(listener)
    }

    pub fn off_presence(&self, id: ListenerId) -> bool {
        self.presence.off(id)
    }

    pub fn on_error(&self, listener: impl Fn(&PresenceError) + 'static) -> ListenerId {
        self.errors.on(listener)
    }

    pub fn off_error(&self, id: ListenerId) -> bool {
        self.errors.off(id)
    }

    fn notify(&self, event: &DocEvent) {
        let listeners: Vec<Rc<dyn DocListener>> = self
            .listeners
            .borrow()
            .iter()
            .filter_map(|(_, listener)| listener.upgrade())
            .collect();
        for listener in listeners {
            listener.on_event(event);
        }
    }

    fn run_waiters(&self) {
        let waiters = std::mem::take(&mut *self.waiters.borrow_mut());
        for waiter in waiters {
            waiter();
        }
    }
}

impl Document for MemoryDocument {
    fn collection(&self) -> &str {
        &self.collection
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn version(&self) -> u64 {
        self.state.borrow().version
    }

    fn doc_type(&self) -> Option<Rc<dyn PresenceType>> {
        self.state.borrow().doc_type.clone()
    }

    fn is_destroyed(&self) -> bool {
        self.state.borrow().destroyed
    }

    fn fetch(&self) {
        self.state.borrow_mut().fetches += 1;
    }

    fn when_nothing_pending(&self, callback: Box<dyn FnOnce()>) {
        if self.state.borrow().pending_ops == 0 {
            callback();
        } else {
            self.waiters.borrow_mut().push(callback);
        }
    }

    fn subscribe(&self, listener: Weak<dyn DocListener>) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.get());
        self.next_subscription.set(id.0 + 1);
        let mut listeners = self.listeners.borrow_mut();
        listeners.retain(|(_, listener)| listener.strong_count() > 0);
        listeners.push((id, listener));
        id
    }

    fn unsubscribe(&self, subscription: SubscriptionId) -> bool {
        let mut listeners = self.listeners.borrow_mut();
        let before = listeners.len();
        listeners.retain(|(id, _)| *id != subscription);
        listeners.len() != before
    }

    fn subscribed_to_presence(&self) -> bool {
        self.state.borrow().subscribed_to_presence
    }

    fn set_subscribed_to_presence(&self, subscribed: bool) {
        self.state.borrow_mut().subscribed_to_presence = subscribed;
    }

    fn remote_presence(&self, presence_id: &str) -> Option<Value> {
        self.state.borrow().remote_presences.get(presence_id).cloned()
    }

    fn set_remote_presence(&self, presence_id: &str, value: Option<Value>) -> Option<Value> {
        let mut state = self.state.borrow_mut();
        match value {
            Some(value) => state.remote_presences.insert(presence_id.to_owned(), value),
            None => state.remote_presences.remove(presence_id),
        }
    }

    fn emit_presence(&self, presence_id: &str, value: Option<&Value>) {
        self.presence.emit(&PresenceEvent {
            presence_id: presence_id.to_owned(),
            value: value.cloned(),
        });
    }

    fn emit_error(&self, error: PresenceError) {
        if self.errors.emit(&error) == 0 {
            log::warn!(
                "Unhandled presence error on {}/{}: {error}",
                self.collection,
                self.id
            );
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Connection
// ───────────────────────────────────────────────────────────────────

/// A connection whose transport is a plain outbox.
pub struct MemoryConnection {
    id: Cell<Option<ConnectionId>>,
    seq: Cell<u64>,
    can_send: Cell<bool>,
    outbox: RefCell<Vec<PresenceMessage>>,
    documents: RefCell<HashMap<(String, String), Rc<MemoryDocument>>>,
    presence_subscriptions: RefCell<Vec<(String, String)>>,
    registry: PresenceRegistry,
}

impl MemoryConnection {
    pub fn new() -> Rc<Self> {
        Self::with_config(PresenceConfig::default())
    }

    pub fn with_config(config: PresenceConfig) -> Rc<Self> {
        Rc::new(Self {
            id: Cell::new(Some(Uuid::new_v4())),
            seq: Cell::new(1),
            can_send: Cell::new(true),
            outbox: RefCell::new(Vec::new()),
            documents: RefCell::new(HashMap::new()),
            presence_subscriptions: RefCell::new(Vec::new()),
            registry: PresenceRegistry::new(config),
        })
    }

    pub fn set_id(&self, id: Option<ConnectionId>) {
        self.id.set(id);
    }

    /// The document for `(collection, id)`, created on first access.
    pub fn document(&self, collection: &str, id: &str) -> Rc<MemoryDocument> {
        let key = (collection.to_owned(), id.to_owned());
        Rc::clone(
            self.documents
                .borrow_mut()
                .entry(key)
                .or_insert_with(|| MemoryDocument::new(collection, id)),
        )
    }

    pub fn registry(&self) -> &PresenceRegistry {
        &self.registry
    }

    /// Get or create the local tracker for `presence_id`.
    pub fn get_presence(
        self: &Rc<Self>,
        collection: &str,
        id: &str,
        presence_id: &str,
    ) -> Result<LocalPresence, PresenceError> {
        self.registry
            .local_presence(&self.as_connection(), collection, id, presence_id)
    }

    /// Get or create the remote tracker for `presence_id`.
    pub fn remote_presence(
        self: &Rc<Self>,
        collection: &str,
        id: &str,
        presence_id: &str,
    ) -> RemotePresence {
        self.registry
            .remote_presence(&self.as_connection(), collection, id, presence_id)
    }

    /// Deliver a validated inbound message.
    pub fn receive(self: &Rc<Self>, message: PresenceMessage) {
        self.registry.dispatch(&self.as_connection(), message);
    }

    /// Deliver a raw inbound frame.
    pub fn receive_json(self: &Rc<Self>, json: &str) -> Result<(), PresenceError> {
        let raw = RawPresenceMessage::decode(json).inspect_err(|e| {
            log::warn!("Failed to decode presence message: {e}");
        })?;
        self.registry.handle_message(&self.as_connection(), raw)
    }

    pub fn receive_ack(&self, ack: PresenceAck) {
        self.registry.handle_ack(ack);
    }

    /// A peer asked for our presence on `(collection, id)`.
    pub fn request_presence(&self, collection: &str, id: &str) {
        self.registry.request_presence(collection, id);
    }

    /// Toggle the transport. Re-enabling flushes queued presence.
    pub fn set_can_send(&self, can_send: bool) {
        let was = self.can_send.replace(can_send);
        if can_send && !was {
            log::debug!("Connection resumed, flushing presence");
            self.registry.on_connection_state_changed();
        }
    }

    /// Drain everything sent so far.
    pub fn take_outbox(&self) -> Vec<PresenceMessage> {
        std::mem::take(&mut *self.outbox.borrow_mut())
    }

    /// Drain recorded presence re-subscription requests.
    pub fn take_presence_subscriptions(&self) -> Vec<(String, String)> {
        std::mem::take(&mut *self.presence_subscriptions.borrow_mut())
    }

    fn as_connection(self: &Rc<Self>) -> Rc<dyn Connection> {
        Rc::clone(self) as Rc<dyn Connection>
    }
}

impl Connection for MemoryConnection {
    fn id(&self) -> Option<ConnectionId> {
        self.id.get()
    }

    fn get(&self, collection: &str, id: &str) -> Rc<dyn Document> {
        self.document(collection, id)
    }

    fn next_seq(&self) -> u64 {
        let seq = self.seq.get();
        self.seq.set(seq + 1);
        seq
    }

    fn can_send(&self) -> bool {
        self.can_send.get()
    }

    fn send(&self, message: PresenceMessage) {
        log::trace!(
            "Outbound presence {}/{}/{} seq={}",
            message.collection,
            message.doc_id,
            message.presence_id,
            message.seq
        );
        self.outbox.borrow_mut().push(message);
    }

    fn subscribe_to_presence(&self, collection: &str, id: &str, callback: SubscribeCallback) {
        self.presence_subscriptions
            .borrow_mut()
            .push((collection.to_owned(), id.to_owned()));
        callback(Ok(()));
    }

    fn destroy_local_presence(&self, collection: &str, id: &str, presence_id: &str) {
        self.registry.remove_local(collection, id, presence_id);
    }
}
