//! Outbound presence tracker.
//!
//! A [`LocalPresence`] owns this client's value for one `(collection, id,
//! presence_id)` and keeps it, plus every message still waiting to be sent,
//! expressed against the document's current version.
//!
//! ```text
//! update(v) ──► pending queue ──► (doc idle?) ──► stamp {t, v} ──► Connection::send
//!                   ▲                                 │
//!                   │ transform on every op           │ ack(seq)
//!               Document                              ▼
//!                                               callbacks_by_seq
//! ```
//!
//! Messages are stamped only at flush time: ops applied while a message is
//! queued transform its value, so the version must be the one current when
//! it actually leaves.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use serde_json::Value;

use crate::config::PresenceConfig;
use crate::connection::Connection;
use crate::document::{DocEvent, DocListener, Document, SubscriptionId};
use crate::error::PresenceError;
use crate::events::{emit_error, report, Completion, Emitter, ListenerId};
use crate::ot::transform_in_place;
use crate::protocol::{PresenceMessage, SendOptions};

#[derive(Default)]
struct LocalState {
    value: Option<Value>,
    pending_messages: Vec<PresenceMessage>,
    callbacks_by_seq: HashMap<u64, Completion>,
    last_seq: Option<u64>,
    destroyed: bool,
}

struct LocalInner {
    presence_id: String,
    collection: String,
    id: String,
    connection: Weak<dyn Connection>,
    doc: Rc<dyn Document>,
    config: PresenceConfig,
    state: RefCell<LocalState>,
    errors: Emitter<PresenceError>,
    subscription: Cell<Option<SubscriptionId>>,
}

/// This client's presence on one document.
///
/// Cloning yields another handle to the same tracker.
#[derive(Clone)]
pub struct LocalPresence {
    inner: Rc<LocalInner>,
}

impl LocalPresence {
    pub fn new(
        connection: &Rc<dyn Connection>,
        collection: &str,
        id: &str,
        presence_id: &str,
        config: &PresenceConfig,
    ) -> Result<Self, PresenceError> {
        if presence_id.is_empty() {
            return Err(PresenceError::InvalidPresenceId);
        }

        let inner = Rc::new(LocalInner {
            presence_id: presence_id.to_owned(),
            collection: collection.to_owned(),
            id: id.to_owned(),
            connection: Rc::downgrade(connection),
            doc: connection.get(collection, id),
            config: config.clone(),
            state: RefCell::new(LocalState::default()),
            errors: Emitter::new(),
            subscription: Cell::new(None),
        });
        let listener: Weak<dyn DocListener> = Rc::downgrade(&inner) as Weak<dyn DocListener>;
        inner.subscription.set(Some(inner.doc.subscribe(listener)));

        log::debug!("Created local presence {presence_id} on {collection}/{id}");
        Ok(Self { inner })
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

    /// Current value, transformed up to the document's version.
    pub fn value(&self) -> Option<Value> {
        self.inner.state.borrow().value.clone()
    }

    /// Messages queued but not yet handed to the connection.
    pub fn pending_messages(&self) -> Vec<PresenceMessage> {
        self.inner.state.borrow().pending_messages.clone()
    }

    pub fn pending_len(&self) -> usize {
        self.inner.state.borrow().pending_messages.len()
    }

    /// Seq of the most recently queued message.
    pub fn last_seq(&self) -> Option<u64> {
        self.inner.state.borrow().last_seq
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.state.borrow().destroyed
    }

    pub fn on_error(&self, listener: impl Fn(&PresenceError) + 'static) -> ListenerId {
        self.inner.errors.on(listener)
    }

    pub fn off_error(&self, id: ListenerId) -> bool {
        self.inner.errors.off(id)
    }

    /// Set the value and queue it for sending.
    ///
    /// Returns the seq of the queued message, or `None` if the update was
    /// refused; the error then goes to `completion` or the error channel and
    /// nothing else changes.
    pub fn update(&self, value: Option<Value>, completion: Option<Completion>) -> Option<u64> {
        self.update_with_options(value, SendOptions::default(), completion)
    }

    pub fn update_with_options(
        &self,
        value: Option<Value>,
        options: SendOptions,
        completion: Option<Completion>,
    ) -> Option<u64> {
        if let Err(error) = self.inner.check_capability() {
            log::debug!(
                "Refused presence update for {}: {error}",
                self.inner.presence_id
            );
            report(completion, &self.inner.errors, error);
            return None;
        }

        self.inner.state.borrow_mut().value = value.filter(|v| !v.is_null());
        self.inner.queue(options, completion)
    }

    /// Shorthand for `update(None, ..)`.
    pub fn clear(&self, completion: Option<Completion>) -> Option<u64> {
        self.update(None, completion)
    }

    /// Re-queue the current value without changing it.
    pub fn send(&self, options: SendOptions, completion: Option<Completion>) -> Option<u64> {
        if let Err(error) = self.inner.check_capability() {
            report(completion, &self.inner.errors, error);
            return None;
        }
        self.inner.queue(options, completion)
    }

    /// Clear the value, then detach from the document and the connection.
    ///
    /// `completion` fires once the clearing message has been acknowledged,
    /// or immediately when the clear cannot be sent.
    pub fn destroy(&self, completion: Option<Completion>) {
        if self.is_destroyed() {
            if let Some(completion) = completion {
                completion.complete(Ok(()));
            }
            return;
        }

        if self.inner.doc.is_destroyed() {
            self.inner.teardown();
            report(completion, &self.inner.errors, PresenceError::DocumentDestroyed);
            return;
        }

        let inner = Rc::clone(&self.inner);
        let on_cleared = Completion::new(move |result| {
            inner.teardown();
            match result {
                Ok(()) => {
                    if let Some(completion) = completion {
                        completion.complete(Ok(()));
                    }
                }
                Err(error) => report(completion, &inner.errors, error),
            }
        });
        self.update(None, Some(on_cleared));
    }

    /// Server acknowledgement for the message with `seq`.
    pub fn ack(&self, seq: u64, error: Option<PresenceError>) {
        if error.is_none() {
            self.inner.doc.set_subscribed_to_presence(true);
        }

        let callback = self.inner.state.borrow_mut().callbacks_by_seq.remove(&seq);
        match (callback, error) {
            (Some(callback), error) => callback.complete(error.map_or(Ok(()), Err)),
            (None, Some(error)) => emit_error(&self.inner.errors, error),
            (None, None) => log::trace!("Ack for seq {seq} without callback"),
        }
    }

    /// Retry queued messages once the connection can send again.
    pub fn on_connection_state_changed(&self) {
        let can_send = self
            .inner
            .connection
            .upgrade()
            .is_some_and(|connection| connection.can_send());
        if can_send && !self.inner.state.borrow().pending_messages.is_empty() {
            self.inner.send_pending();
        }
    }
}

impl LocalInner {
    fn check_capability(&self) -> Result<(), PresenceError> {
        if self.state.borrow().destroyed {
            return Err(PresenceError::Destroyed);
        }
        if self.doc.is_destroyed() {
            return Err(PresenceError::DocumentDestroyed);
        }
        match self.doc.doc_type() {
            None => Err(PresenceError::DocumentNotCreated),
            Some(doc_type) if !doc_type.supports_presence() => {
                Err(PresenceError::PresenceNotSupported)
            }
            Some(_) => Ok(()),
        }
    }

    fn queue(self: &Rc<Self>, options: SendOptions, completion: Option<Completion>) -> Option<u64> {
        let Some(connection) = self.connection.upgrade() else {
            report(completion, &self.errors, PresenceError::ConnectionClosed);
            return None;
        };

        let seq = connection.next_seq();
        let request_presence = options.request_presence
            || (self.config.request_until_subscribed && !self.doc.subscribed_to_presence());
        let options = SendOptions {
            request_presence,
            ..options
        };

        {
            let mut state = self.state.borrow_mut();
            let message = PresenceMessage::new(
                &self.presence_id,
                &self.collection,
                &self.id,
                state.value.clone(),
                seq,
                options,
            );
            state.pending_messages.push(message);
            state.last_seq = Some(seq);
            if let Some(completion) = completion {
                state.callbacks_by_seq.insert(seq, completion);
            }
        }

        self.send_pending();
        Some(seq)
    }

    /// Flush as soon as the document has no unacknowledged ops.
    fn send_pending(self: &Rc<Self>) {
        let weak = Rc::downgrade(self);
        self.doc.when_nothing_pending(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.flush();
            }
        }));
    }

    fn flush(&self) {
        let Some(connection) = self.connection.upgrade() else {
            log::debug!("Connection gone, dropping flush for {}", self.presence_id);
            return;
        };
        if !connection.can_send() {
            log::trace!("Connection cannot send, keeping {} queued", self.presence_id);
            return;
        }

        let type_uri = self.doc.doc_type().map(|doc_type| doc_type.uri().to_owned());
        let version = self.doc.version();
        let messages = std::mem::take(&mut self.state.borrow_mut().pending_messages);
        for mut message in messages {
            message.type_uri = type_uri.clone();
            message.version = Some(version);
            connection.send(message);
        }
    }

    fn transform_against_op(&self, op: &Value, is_own_op: bool) {
        let Some(doc_type) = self.doc.doc_type() else {
            log::warn!("Op applied to {}/{} without a type", self.collection, self.id);
            return;
        };

        let mut errors = Vec::new();
        {
            let mut state = self.state.borrow_mut();
            let LocalState {
                value,
                pending_messages,
                ..
            } = &mut *state;
            for message in pending_messages.iter_mut() {
                if let Err(error) = transform_in_place(&*doc_type, &mut message.value, op, is_own_op)
                {
                    errors.push(error);
                }
            }
            if let Err(error) = transform_in_place(&*doc_type, value, op, is_own_op) {
                errors.push(error);
            }
        }

        for error in errors {
            emit_error(&self.errors, error.into());
        }
    }

    /// Create/delete: every queued value becomes an absence.
    fn reset_values(&self) {
        let mut state = self.state.borrow_mut();
        state.value = None;
        for message in &mut state.pending_messages {
            message.value = None;
        }
    }

    /// Load/hard rollback: drop the value and everything queued.
    ///
    /// Callbacks of the dropped messages complete with `Discarded`.
    fn discard(&self) {
        let callbacks: Vec<Completion> = {
            let mut state = self.state.borrow_mut();
            state.value = None;
            let discarded = std::mem::take(&mut state.pending_messages);
            discarded
                .iter()
                .filter_map(|message| state.callbacks_by_seq.remove(&message.seq))
                .collect()
        };
        if !callbacks.is_empty() {
            log::debug!(
                "Discarded queued presence for {}, failing {} callbacks",
                self.presence_id,
                callbacks.len()
            );
        }
        for callback in callbacks {
            callback.complete(Err(PresenceError::Discarded));
        }
    }

    fn teardown(&self) {
        if let Some(subscription) = self.subscription.take() {
            self.doc.unsubscribe(subscription);
        }
        self.state.borrow_mut().destroyed = true;
        if let Some(connection) = self.connection.upgrade() {
            connection.destroy_local_presence(&self.collection, &self.id, &self.presence_id);
        }
        log::info!(
            "Destroyed local presence {} on {}/{}",
            self.presence_id,
            self.collection,
            self.id
        );
    }
}

impl DocListener for LocalInner {
    fn on_event(&self, event: &DocEvent) {
        match event {
            DocEvent::Applied(applied) => self.transform_against_op(&applied.op, applied.local),
            DocEvent::Recreated | DocEvent::Deleted => self.reset_values(),
            DocEvent::Reloaded => self.discard(),
        }
    }
}
