//! Broker and rooms shared by in-process transports.
//!
//! A [`Room`] maps client identities to receive callbacks. Transports bound to
//! the same room reach each other; rooms are isolated from one another. The
//! [`Broker`] hands out rooms by name and is passed explicitly to whoever
//! builds transports, so two brokers never share receivers.

use crate::error::{Result, TransportError};
use crate::packet::ClientId;
use crate::transport::ReceiveCallback;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// A named set of receivers.
pub struct Room {
    name: String,
    receivers: RwLock<HashMap<ClientId, ReceiveCallback>>,
}

impl Room {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            receivers: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn register(&self, client_id: &ClientId, callback: ReceiveCallback) -> Result<()> {
        let mut receivers = self.receivers.write();
        if receivers.contains_key(client_id) {
            return Err(TransportError::RegistrationConflict(client_id.clone()));
        }
        receivers.insert(client_id.clone(), callback);
        debug!(room = %self.name, client_id = %client_id, "receiver joined room");
        Ok(())
    }

    pub fn deregister(&self, client_id: &ClientId) -> bool {
        let removed = self.receivers.write().remove(client_id).is_some();
        if removed {
            debug!(room = %self.name, client_id = %client_id, "receiver left room");
        }
        removed
    }

    pub fn receiver(&self, client_id: &ClientId) -> Option<ReceiveCallback> {
        self.receivers.read().get(client_id).cloned()
    }

    /// Snapshot of every receiver except `source`, in client id order.
    pub fn targets(&self, source: &ClientId) -> Vec<(ClientId, ReceiveCallback)> {
        let mut targets: Vec<_> = self
            .receivers
            .read()
            .iter()
            .filter(|(id, _)| *id != source)
            .map(|(id, callback)| (id.clone(), callback.clone()))
            .collect();
        targets.sort_by(|(a, _), (b, _)| a.cmp(b));
        targets
    }

    pub fn client_ids(&self) -> Vec<ClientId> {
        let mut ids: Vec<_> = self.receivers.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.receivers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.receivers.read().is_empty()
    }
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("name", &self.name)
            .field("clients", &self.client_ids())
            .finish()
    }
}

/// Registry of rooms. Cloning shares the same rooms.
#[derive(Clone, Default)]
pub struct Broker {
    rooms: Arc<RwLock<HashMap<String, Arc<Room>>>>,
}

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the room called `name`, creating it on first use.
    pub fn room(&self, name: &str) -> Arc<Room> {
        if let Some(room) = self.rooms.read().get(name) {
            return room.clone();
        }
        self.rooms
            .write()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Room::new(name)))
            .clone()
    }

    pub fn room_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.rooms.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Drop empty rooms.
    pub fn prune(&self) {
        self.rooms.write().retain(|_, room| !room.is_empty());
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("rooms", &self.room_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> ReceiveCallback {
        Arc::new(|_| {})
    }

    #[test]
    fn test_room_reused_by_name() {
        let broker = Broker::new();
        let a = broker.room("lobby");
        let b = broker.room("lobby");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(broker.room_names(), vec!["lobby".to_string()]);
    }

    #[test]
    fn test_registration_conflict() {
        let room = Room::new("lobby");
        let id = ClientId::new("a");
        room.register(&id, noop()).unwrap();
        assert_eq!(
            room.register(&id, noop()),
            Err(TransportError::RegistrationConflict(id.clone()))
        );
        assert!(room.deregister(&id));
        assert!(room.register(&id, noop()).is_ok());
    }

    #[test]
    fn test_targets_exclude_source() {
        let room = Room::new("lobby");
        for id in ["a", "b", "c"] {
            room.register(&ClientId::new(id), noop()).unwrap();
        }
        let targets: Vec<_> = room
            .targets(&ClientId::new("b"))
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(targets, vec![ClientId::new("a"), ClientId::new("c")]);
    }

    #[test]
    fn test_prune_empty_rooms() {
        let broker = Broker::new();
        broker.room("empty");
        broker
            .room("busy")
            .register(&ClientId::new("a"), noop())
            .unwrap();
        broker.prune();
        assert_eq!(broker.room_names(), vec!["busy".to_string()]);
    }
}
