//! Inbound presence tracker with version reconciliation.
//!
//! A peer's update is stamped with the document version it was computed
//! against. Before it can be shown it has to be brought to *our* version:
//!
//! ```text
//!   update.v  >  doc.version   ─► wait for missing ops (fetch)
//!   update.v  == doc.version   ─► commit, publish
//!   update.v  <  doc.version   ─► catch up:
//!                                   start an OpCache, fetch, ask peers to
//!                                   re-send; replay cached ops as they cover
//!                                   the gap, then commit
//! ```
//!
//! Updates older (by `seq`) than the committed one are dropped. At most one
//! pending update is kept; a newer arrival replaces it.
//!
//! Reference: Ellis & Gibbs, "Concurrency Control in Groupware Systems" §4

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use serde_json::Value;

use crate::config::PresenceConfig;
use crate::connection::{Connection, ConnectionId};
use crate::document::{AppliedOp, DocEvent, DocListener, Document, SubscriptionId};
use crate::error::PresenceError;
use crate::op_cache::{CachedOp, OpCache};
use crate::ot::{transform_in_place, PresenceType};
use crate::protocol::PresenceMessage;

/// A received update waiting to be reconciled.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceUpdate {
    pub value: Option<Value>,
    /// Version the value was computed against. `None` means "current".
    pub version: Option<u64>,
    pub seq: u64,
    pub src: Option<ConnectionId>,
    pub type_uri: Option<String>,
}

impl From<PresenceMessage> for PresenceUpdate {
    fn from(message: PresenceMessage) -> Self {
        Self {
            value: message.value,
            version: message.version,
            seq: message.seq,
            src: message.src,
            type_uri: message.type_uri,
        }
    }
}

/// Where a remote tracker is in its reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// Nothing pending; the committed value is current.
    Idle,
    /// Pending update is ahead of the document.
    AwaitingOps,
    /// Pending update is behind; ops are being cached.
    CatchingUp,
}

/// Outcome of one reconciliation step.
#[derive(Debug, PartialEq)]
enum Reconcile {
    Idle,
    Discarded,
    AwaitFetch,
    StartCatchUp,
    CatchingUp,
    Committed,
    Abandoned(PresenceError),
}

#[derive(Debug, Default)]
struct RemoteState {
    value: Option<Value>,
    src: Option<ConnectionId>,
    seq: Option<u64>,
    pending: Option<PresenceUpdate>,
    op_cache: Option<OpCache>,
    destroyed: bool,
}

impl RemoteState {
    /// Try to turn the pending update into the committed value.
    ///
    /// Pure state transition; side effects are left to the caller.
    fn reconcile(&mut self, doc_version: u64, doc_type: Option<&dyn PresenceType>) -> Reconcile {
        let Some(mut pending) = self.pending.take() else {
            return Reconcile::Idle;
        };

        if self.seq.is_some_and(|seq| pending.seq < seq) {
            self.op_cache = None;
            return Reconcile::Discarded;
        }

        let version = *pending.version.get_or_insert(doc_version);
        if version > doc_version {
            self.op_cache = None;
            self.pending = Some(pending);
            return Reconcile::AwaitFetch;
        }

        if version < doc_version {
            let Some(cache) = self.op_cache.as_ref() else {
                self.op_cache = Some(OpCache::new());
                self.pending = Some(pending);
                return Reconcile::StartCatchUp;
            };
            match cache.replay(version, pending.value.take(), doc_type) {
                Ok((reached, value)) => {
                    pending.version = Some(reached);
                    pending.value = value;
                }
                Err(error) => {
                    self.op_cache = None;
                    return Reconcile::Abandoned(error);
                }
            }
            if pending.version < Some(doc_version) {
                self.pending = Some(pending);
                return Reconcile::CatchingUp;
            }
        }

        self.op_cache = None;
        self.value = pending.value;
        self.seq = Some(pending.seq);
        Reconcile::Committed
    }

    fn status(&self) -> SyncStatus {
        match (&self.pending, &self.op_cache) {
            (None, _) => SyncStatus::Idle,
            (Some(_), Some(_)) => SyncStatus::CatchingUp,
            (Some(_), None) => SyncStatus::AwaitingOps,
        }
    }
}

struct RemoteInner {
    presence_id: String,
    collection: String,
    id: String,
    connection: Weak<dyn Connection>,
    doc: Rc<dyn Document>,
    max_cached_ops: usize,
    state: RefCell<RemoteState>,
    subscription: Cell<Option<SubscriptionId>>,
}

/// A peer's presence on one document, as seen by this client.
#[derive(Clone)]
pub struct RemotePresence {
    inner: Rc<RemoteInner>,
}

impl RemotePresence {
    pub fn new(
        connection: &Rc<dyn Connection>,
        collection: &str,
        id: &str,
        presence_id: &str,
        config: &PresenceConfig,
    ) -> Self {
        let inner = Rc::new(RemoteInner {
            presence_id: presence_id.to_owned(),
            collection: collection.to_owned(),
            id: id.to_owned(),
            connection: Rc::downgrade(connection),
            doc: connection.get(collection, id),
            max_cached_ops: config.max_cached_ops,
            state: RefCell::new(RemoteState::default()),
            subscription: Cell::new(None),
        });
        let listener: Weak<dyn DocListener> = Rc::downgrade(&inner) as Weak<dyn DocListener>;
        inner.subscription.set(Some(inner.doc.subscribe(listener)));

        log::debug!("Tracking remote presence {presence_id} on {collection}/{id}");
        Self { inner }
    }

    pub fn presence_id(&self) -> &str {
        &self.inner.presence_id
    }

    pub fn collection(&self) -> &str {
        &self.inner.collection
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn document(&self) -> Rc<dyn Document> {
        Rc::clone(&self.inner.doc)
    }

    /// Committed value.
    pub fn value(&self) -> Option<Value> {
        self.inner.state.borrow().value.clone()
    }

    /// Seq of the committed update.
    pub fn seq(&self) -> Option<u64> {
        self.inner.state.borrow().seq
    }

    /// Connection that authored the committed update.
    pub fn src(&self) -> Option<ConnectionId> {
        self.inner.state.borrow().src
    }

    pub fn pending(&self) -> Option<PresenceUpdate> {
        self.inner.state.borrow().pending.clone()
    }

    pub fn status(&self) -> SyncStatus {
        self.inner.state.borrow().status()
    }

    pub fn cached_ops(&self) -> usize {
        self.inner
            .state
            .borrow()
            .op_cache
            .as_ref()
            .map_or(0, OpCache::len)
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.state.borrow().destroyed
    }

    /// Accept an update unless an older one than what is already pending.
    pub fn receive_update(&self, update: PresenceUpdate) {
        {
            let mut state = self.inner.state.borrow_mut();
            if state.destroyed {
                log::debug!("Ignoring update for destroyed {}", self.inner.presence_id);
                return;
            }
            if state
                .pending
                .as_ref()
                .is_some_and(|pending| update.seq < pending.seq)
            {
                log::debug!(
                    "Dropping out-of-order presence {} seq={}",
                    self.inner.presence_id,
                    update.seq
                );
                return;
            }
            if update.src.is_some() {
                state.src = update.src;
            }
            state.pending = Some(update);
        }
        self.inner.set_pending_presence();
    }

    /// Stop tracking: unsubscribe and publish an absence if one was shown.
    ///
    /// Reached through [`PresenceRegistry::remove_remote`] so the registry
    /// never hands out a destroyed tracker.
    ///
    /// [`PresenceRegistry::remove_remote`]: crate::registry::PresenceRegistry::remove_remote
    pub(crate) fn destroy(&self) {
        if let Some(subscription) = self.inner.subscription.take() {
            self.inner.doc.unsubscribe(subscription);
        }
        {
            let mut state = self.inner.state.borrow_mut();
            state.value = None;
            state.pending = None;
            state.op_cache = None;
            state.destroyed = true;
        }
        self.inner.publish();
    }
}

impl RemoteInner {
    fn set_pending_presence(&self) {
        let doc_type = self.doc.doc_type();
        let version = self.doc.version();
        let step = self
            .state
            .borrow_mut()
            .reconcile(version, doc_type.as_deref());

        match step {
            Reconcile::Idle | Reconcile::CatchingUp => {}
            Reconcile::Discarded => {
                log::debug!("Discarded stale presence for {}", self.presence_id);
            }
            Reconcile::AwaitFetch => {
                log::debug!(
                    "Presence {} is ahead of v{version}, fetching",
                    self.presence_id
                );
                self.doc.fetch();
            }
            Reconcile::StartCatchUp => {
                log::debug!(
                    "Presence {} is behind v{version}, catching up",
                    self.presence_id
                );
                self.doc.fetch();
                self.request_fresh_presence();
            }
            Reconcile::Committed => self.publish(),
            Reconcile::Abandoned(error) => {
                log::warn!("Abandoned catch-up for {}: {error}", self.presence_id);
                self.doc.emit_error(error);
            }
        }
    }

    /// Re-subscribe to the document's presence so peers re-send current values.
    fn request_fresh_presence(&self) {
        let Some(connection) = self.connection.upgrade() else {
            return;
        };
        let doc = Rc::clone(&self.doc);
        connection.subscribe_to_presence(
            &self.collection,
            &self.id,
            Box::new(move |result| {
                if let Err(error) = result {
                    doc.emit_error(error);
                }
            }),
        );
    }

    fn publish(&self) {
        let value = self.state.borrow().value.clone();
        match value {
            Some(value) => {
                self.doc
                    .set_remote_presence(&self.presence_id, Some(value.clone()));
                self.doc.emit_presence(&self.presence_id, Some(&value));
            }
            None => {
                if self
                    .doc
                    .set_remote_presence(&self.presence_id, None)
                    .is_some()
                {
                    self.doc.emit_presence(&self.presence_id, None);
                }
            }
        }
    }

    fn handle_op(&self, applied: &AppliedOp) {
        let is_own_op = {
            let state = self.state.borrow();
            applied.origin.is_some() && applied.origin == state.src
        };
        self.transform_committed(&applied.op, is_own_op);
        self.cache_op(CachedOp::Operation {
            op: applied.op.clone(),
            is_own_op,
        });
        self.set_pending_presence();
    }

    fn transform_committed(&self, op: &Value, is_own_op: bool) {
        if self.state.borrow().value.is_none() {
            return;
        }
        let result = match self.doc.doc_type() {
            Some(doc_type) => transform_in_place(
                &*doc_type,
                &mut self.state.borrow_mut().value,
                op,
                is_own_op,
            )
            .map_err(PresenceError::from),
            None => Err(PresenceError::DocumentNotCreated),
        };
        if let Err(error) = result {
            self.doc.emit_error(error);
        }
        self.publish();
    }

    fn handle_create_del(&self) {
        let had_value = self.state.borrow_mut().value.take().is_some();
        if had_value {
            self.publish();
        }
        self.cache_op(CachedOp::Reset);
        self.set_pending_presence();
    }

    fn handle_load(&self) {
        {
            let mut state = self.state.borrow_mut();
            state.value = None;
            state.pending = None;
            state.op_cache = None;
        }
        self.publish();
    }

    /// Record the change that just advanced the document, if catching up.
    fn cache_op(&self, entry: CachedOp) {
        let version = self.doc.version().saturating_sub(1);
        let mut state = self.state.borrow_mut();
        let Some(cache) = state.op_cache.as_mut() else {
            return;
        };
        cache.insert(version, entry);
        if cache.len() > self.max_cached_ops {
            log::warn!(
                "Op cache for {} exceeded {} entries, waiting for a fresh value",
                self.presence_id,
                self.max_cached_ops
            );
            state.op_cache = None;
            state.pending = None;
        }
    }
}

impl DocListener for RemoteInner {
    fn on_event(&self, event: &DocEvent) {
        match event {
            DocEvent::Applied(applied) => self.handle_op(applied),
            DocEvent::Recreated | DocEvent::Deleted => self.handle_create_del(),
            DocEvent::Reloaded => self.handle_load(),
        }
    }
}
