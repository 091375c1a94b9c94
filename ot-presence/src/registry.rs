//! Per-connection routing of presence trackers.
//!
//! Trackers are keyed by `(collection, doc_id, presence_id)`. Inbound
//! messages create remote trackers on demand; acknowledgements are routed to
//! the local tracker that sent the message.
//!
//! Trackers are cloned out of the maps before being called, since a tracker
//! may call back into the registry (e.g. `destroy` removing itself).

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::config::PresenceConfig;
use crate::connection::Connection;
use crate::error::PresenceError;
use crate::local::LocalPresence;
use crate::protocol::{PresenceAck, PresenceMessage, RawPresenceMessage, SendOptions};
use crate::remote::{PresenceUpdate, RemotePresence};

type PresenceKey = (String, String, String);

fn key(collection: &str, id: &str, presence_id: &str) -> PresenceKey {
    (collection.to_owned(), id.to_owned(), presence_id.to_owned())
}

/// All presence trackers owned by one connection.
#[derive(Default)]
pub struct PresenceRegistry {
    config: PresenceConfig,
    local: RefCell<HashMap<PresenceKey, LocalPresence>>,
    remote: RefCell<HashMap<PresenceKey, RemotePresence>>,
}

impl PresenceRegistry {
    pub fn new(config: PresenceConfig) -> Self {
        Self {
            config,
            local: RefCell::new(HashMap::new()),
            remote: RefCell::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &PresenceConfig {
        &self.config
    }

    /// Get or create this client's tracker for `presence_id`.
    pub fn local_presence(
        &self,
        connection: &Rc<dyn Connection>,
        collection: &str,
        id: &str,
        presence_id: &str,
    ) -> Result<LocalPresence, PresenceError> {
        let key = key(collection, id, presence_id);
        if let Some(existing) = self.local.borrow().get(&key) {
            return Ok(existing.clone());
        }

        let presence = LocalPresence::new(connection, collection, id, presence_id, &self.config)?;
        self.local.borrow_mut().insert(key, presence.clone());
        Ok(presence)
    }

    /// Get or create the tracker for a peer's `presence_id`.
    pub fn remote_presence(
        &self,
        connection: &Rc<dyn Connection>,
        collection: &str,
        id: &str,
        presence_id: &str,
    ) -> RemotePresence {
        let key = key(collection, id, presence_id);
        if let Some(existing) = self.remote.borrow().get(&key) {
            return existing.clone();
        }

        let presence = RemotePresence::new(connection, collection, id, presence_id, &self.config);
        self.remote.borrow_mut().insert(key, presence.clone());
        presence
    }

    pub fn local_presences(&self, collection: &str, id: &str) -> Vec<LocalPresence> {
        self.local
            .borrow()
            .iter()
            .filter(|((c, d, _), _)| c == collection && d == id)
            .map(|(_, presence)| presence.clone())
            .collect()
    }

    pub fn remote_presences(&self, collection: &str, id: &str) -> Vec<RemotePresence> {
        self.remote
            .borrow()
            .iter()
            .filter(|((c, d, _), _)| c == collection && d == id)
            .map(|(_, presence)| presence.clone())
            .collect()
    }

    pub fn remove_local(&self, collection: &str, id: &str, presence_id: &str) -> Option<LocalPresence> {
        self.local
            .borrow_mut()
            .remove(&key(collection, id, presence_id))
    }

    /// Forget a peer's tracker, publishing its absence.
    pub fn remove_remote(
        &self,
        collection: &str,
        id: &str,
        presence_id: &str,
    ) -> Option<RemotePresence> {
        let removed = self
            .remote
            .borrow_mut()
            .remove(&key(collection, id, presence_id));
        if let Some(presence) = &removed {
            presence.destroy();
        }
        removed
    }

    /// Validate and route a raw inbound message.
    ///
    /// A malformed message is reported on its document's error channel when
    /// it names one, and returned.
    pub fn handle_message(
        &self,
        connection: &Rc<dyn Connection>,
        raw: RawPresenceMessage,
    ) -> Result<(), PresenceError> {
        let route = raw.route_key();
        match raw.validate() {
            Ok(message) => {
                self.dispatch(connection, message);
                Ok(())
            }
            Err(error) => {
                let error = PresenceError::from(error);
                log::warn!("Rejected presence message: {error}");
                match route {
                    Some((collection, id)) => connection.get(&collection, &id).emit_error(error.clone()),
                    None => log::debug!("Presence message names no document"),
                }
                Err(error)
            }
        }
    }

    /// Route a validated inbound message to its remote tracker.
    pub fn dispatch(&self, connection: &Rc<dyn Connection>, message: PresenceMessage) {
        let collection = message.collection.clone();
        let id = message.doc_id.clone();
        let requested = message.request_presence;

        if message.unsubscribe {
            log::debug!(
                "Peer {} unsubscribed from {collection}/{id}",
                message.presence_id
            );
        }

        let remote = self.remote_presence(connection, &collection, &id, &message.presence_id);
        remote.receive_update(PresenceUpdate::from(message));

        if requested {
            self.request_presence(&collection, &id);
        }
    }

    /// A peer asked for current values: re-send every non-empty local one.
    pub fn request_presence(&self, collection: &str, id: &str) {
        for presence in self.local_presences(collection, id) {
            if presence.value().is_some() {
                presence.send(SendOptions::default(), None);
            }
        }
    }

    pub fn handle_ack(&self, ack: PresenceAck) {
        let presence = self
            .local
            .borrow()
            .get(&key(&ack.collection, &ack.doc_id, &ack.presence_id))
            .cloned();
        match presence {
            Some(presence) => presence.ack(ack.seq, ack.error),
            None => log::debug!(
                "Ack for unknown presence {}/{}/{}",
                ack.collection,
                ack.doc_id,
                ack.presence_id
            ),
        }
    }

    /// Retry every local tracker's queued messages.
    pub fn on_connection_state_changed(&self) {
        let locals: Vec<LocalPresence> = self.local.borrow().values().cloned().collect();
        for presence in locals {
            presence.on_connection_state_changed();
        }
    }

    /// Drop trackers whose document has been destroyed. Returns how many.
    pub fn prune_destroyed(&self) -> usize {
        let mut pruned = 0;
        {
            let mut local = self.local.borrow_mut();
            let before = local.len();
            local.retain(|_, presence| !presence.document().is_destroyed());
            pruned += before - local.len();
        }
        let removed: Vec<RemotePresence> = {
            let mut remote = self.remote.borrow_mut();
            let doomed: Vec<PresenceKey> = remote
                .iter()
                .filter(|(_, presence)| presence.document().is_destroyed())
                .map(|(key, _)| key.clone())
                .collect();
            doomed.iter().filter_map(|key| remote.remove(key)).collect()
        };
        pruned += removed.len();
        for presence in removed {
            presence.destroy();
        }
        if pruned > 0 {
            log::info!("Pruned {pruned} presence trackers on destroyed documents");
        }
        pruned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryConnection;
    use crate::ot::TextType;
    use serde_json::json;

    fn message(presence_id: &str, index: u64, version: u64, seq: u64) -> PresenceMessage {
        let mut message = PresenceMessage::new(
            presence_id,
            "books",
            "persuasion",
            Some(json!({"index": index})),
            seq,
            SendOptions::default(),
        );
        message.version = Some(version);
        message.type_uri = Some(TextType::URI.to_owned());
        message
    }

    fn setup() -> Rc<MemoryConnection> {
        let connection = MemoryConnection::new();
        connection
            .document("books", "persuasion")
            .create(Rc::new(TextType));
        connection
    }

    #[test]
    fn test_local_presence_is_reused() {
        let connection = setup();
        let a = connection.get_presence("books", "persuasion", "me").unwrap();
        let b = connection.get_presence("books", "persuasion", "me").unwrap();
        a.update(Some(json!({"index": 2})), None);
        assert_eq!(b.value(), Some(json!({"index": 2})));
        assert_eq!(connection.registry().local_presences("books", "persuasion").len(), 1);
    }

    #[test]
    fn test_dispatch_creates_remote_tracker() {
        let connection = setup();
        connection.receive(message("peer", 3, 1, 1));
        let remotes = connection.registry().remote_presences("books", "persuasion");
        assert_eq!(remotes.len(), 1);
        assert_eq!(remotes[0].value(), Some(json!({"index": 3})));
    }

    #[test]
    fn test_request_answered_with_current_values() {
        let connection = setup();
        let me = connection.get_presence("books", "persuasion", "me").unwrap();
        connection.get_presence("books", "persuasion", "idle").unwrap();
        me.update(Some(json!({"index": 1})), None);
        connection.take_outbox();

        let mut request = message("peer", 3, 1, 1);
        request.request_presence = true;
        connection.receive(request);

        let sent = connection.take_outbox();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].presence_id, "me");
    }

    #[test]
    fn test_request_answered_even_when_update_is_stale() {
        let connection = setup();
        let me = connection.get_presence("books", "persuasion", "me").unwrap();
        me.update(Some(json!({"index": 1})), None);
        connection.receive(message("peer", 3, 1, 5));
        connection.take_outbox();

        let mut request = message("peer", 9, 1, 2);
        request.request_presence = true;
        connection.receive(request);

        assert_eq!(connection.take_outbox().len(), 1);
        let remote = connection.remote_presence("books", "persuasion", "peer");
        assert_eq!(remote.value(), Some(json!({"index": 3})));
    }

    #[test]
    fn test_invalid_message_reported_on_document() {
        let connection = setup();
        let doc = connection.document("books", "persuasion");
        let errors = Rc::new(RefCell::new(Vec::new()));
        let sink = errors.clone();
        doc.on_error(move |e| sink.borrow_mut().push(e.clone()));

        let result =
            connection.receive_json(r#"{"a":"p","c":"books","d":"persuasion","id":"","seq":1}"#);
        assert!(result.is_err());
        assert_eq!(errors.borrow().len(), 1);
        assert_eq!(errors.borrow()[0].code(), Some(4000));
    }

    #[test]
    fn test_ack_for_unknown_presence_is_ignored() {
        let connection = setup();
        connection.receive_ack(PresenceAck {
            collection: "books".into(),
            doc_id: "persuasion".into(),
            presence_id: "ghost".into(),
            seq: 1,
            error: None,
        });
    }

    #[test]
    fn test_remove_remote_publishes_absence() {
        let connection = setup();
        connection.receive(message("peer", 3, 1, 1));
        let doc = connection.document("books", "persuasion");
        assert_eq!(doc.presences().len(), 1);

        let removed = connection
            .registry()
            .remove_remote("books", "persuasion", "peer");
        assert!(removed.is_some_and(|r| r.is_destroyed()));
        assert!(doc.presences().is_empty());
    }

    #[test]
    fn test_peer_tracked_again_after_removal() {
        let connection = setup();
        connection.receive(message("peer", 3, 1, 1));
        connection
            .registry()
            .remove_remote("books", "persuasion", "peer");

        connection.receive(message("peer", 7, 1, 2));
        let remote = connection.remote_presence("books", "persuasion", "peer");
        assert!(!remote.is_destroyed());
        assert_eq!(remote.value(), Some(json!({"index": 7})));
    }

    #[test]
    fn test_prune_destroyed() {
        let connection = setup();
        connection.get_presence("books", "persuasion", "me").unwrap();
        connection.receive(message("peer", 3, 1, 1));
        connection.document("books", "other").create(Rc::new(TextType));
        connection.get_presence("books", "other", "me").unwrap();

        connection.document("books", "persuasion").destroy();
        assert_eq!(connection.registry().prune_destroyed(), 2);
        assert!(connection.registry().local_presences("books", "persuasion").is_empty());
        assert_eq!(connection.registry().local_presences("books", "other").len(), 1);
        assert_eq!(connection.registry().prune_destroyed(), 0);
    }
}
