//! Narrow observable helpers used by trackers and documents.
//!
//! Trackers only ever emit two things: errors and presence changes. Rather
//! than a string-keyed emitter, each channel is an [`Emitter`] typed by its
//! payload, and listeners are removed with the [`ListenerId`] returned at
//! registration.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use tokio::sync::oneshot;

use crate::error::PresenceError;

/// Token returned by [`Emitter::on`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Single-threaded typed event channel.
pub struct Emitter<E> {
    next_id: Cell<u64>,
    listeners: RefCell<Vec<(ListenerId, Rc<dyn Fn(&E)>)>>,
}

impl<E> Emitter<E> {
    pub fn new() -> Self {
        Self {
            next_id: Cell::new(0),
            listeners: RefCell::new(Vec::new()),
        }
    }

    /// Register a listener.
    pub fn on(&self, listener: impl Fn(&E) + 'static) -> ListenerId {
        let id = ListenerId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        self.listeners.borrow_mut().push((id, Rc::new(listener)));
        id
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.borrow_mut();
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    /// Deliver `event` to every listener, returning how many were called.
    ///
    /// The listener list is snapshotted first, so listeners may register or
    /// remove listeners while being notified.
    pub fn emit(&self, event: &E) -> usize {
        let listeners: Vec<Rc<dyn Fn(&E)>> = self
            .listeners
            .borrow()
            .iter()
            .map(|(_, listener)| Rc::clone(listener))
            .collect();
        for listener in &listeners {
            listener(event);
        }
        listeners.len()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.borrow().len()
    }
}

impl<E> Default for Emitter<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for Emitter<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

/// Emit an error, logging it when nobody is listening.
pub(crate) fn emit_error(channel: &Emitter<PresenceError>, error: PresenceError) {
    if channel.emit(&error) == 0 {
        log::warn!("Unhandled presence error: {error}");
    }
}

/// One-shot completion handle for an asynchronous presence operation.
///
/// Operations that accept an `Option<Completion>` report their outcome to
/// it; without one, failures are routed to the owning tracker's error
/// channel instead.
pub struct Completion(Box<dyn FnOnce(Result<(), PresenceError>)>);

impl Completion {
    pub fn new(callback: impl FnOnce(Result<(), PresenceError>) + 'static) -> Self {
        Self(Box::new(callback))
    }

    /// Completion backed by a oneshot channel, for async callers.
    pub fn channel() -> (Self, oneshot::Receiver<Result<(), PresenceError>>) {
        let (tx, rx) = oneshot::channel();
        let completion = Self::new(move |result| {
            // Receiver may have been dropped; the outcome is then irrelevant.
            let _ = tx.send(result);
        });
        (completion, rx)
    }

    pub fn complete(self, result: Result<(), PresenceError>) {
        (self.0)(result)
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Completion")
    }
}

/// Deliver `error` to `completion` if present, else to `channel`.
pub(crate) fn report(
    completion: Option<Completion>,
    channel: &Emitter<PresenceError>,
    error: PresenceError,
) {
    match completion {
        Some(completion) => completion.complete(Err(error)),
        None => emit_error(channel, error),
    }
}
