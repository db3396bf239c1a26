use crate::byte_stack::{ByteStack, StackEnum};
use crate::clock::Timestamp;
use crate::error::Result;
use crate::id_manager::IdManager;
use crate::protocol::{DeliveryClass, Message, ObjectId, BYTES_PER_ID, IDS_REGISTER_KEY};
use ahash::AHashMap;
use log::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterCommand {
    BindIdAndKey = 0,
    UnbindIdAndKey = 1,
}

impl StackEnum for RegisterCommand {
    const MAX_ORDINAL: u64 = 1;
    const NAME: &'static str = "RegisterCommand";

    fn ordinal(self) -> u64 {
        self as u64
    }

    fn from_ordinal(ordinal: u64) -> Option<Self> {
        match ordinal {
            0 => Some(RegisterCommand::BindIdAndKey),
            1 => Some(RegisterCommand::UnbindIdAndKey),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingChange {
    Bound { key: String, id: ObjectId },
    Unbound { key: String, id: ObjectId },
}

/// Two-way mapping between object keys and the compact ids used on the wire.
///
/// The master assigns ids and announces them; clients only follow the
/// announcements. Both sides bind the register itself first, so its id is
/// known without any exchange.
#[derive(Debug)]
pub struct IdsRegister {
    assign_ids: bool,
    id_manager: IdManager,
    self_id: ObjectId,
    id_to_key: AHashMap<ObjectId, String>,
    key_to_id: AHashMap<String, ObjectId>,
    bind_times: AHashMap<ObjectId, Timestamp>,
}

impl IdsRegister {
    pub fn new(assign_ids: bool) -> Self {
        let mut id_manager = IdManager::new();
        let self_id = id_manager.get_id();

        let mut register = Self {
            assign_ids,
            id_manager,
            self_id,
            id_to_key: AHashMap::new(),
            key_to_id: AHashMap::new(),
            bind_times: AHashMap::new(),
        };
        register.bind(IDS_REGISTER_KEY.to_string(), self_id, Timestamp::ZERO);
        register
    }

    pub fn assigns_ids(&self) -> bool {
        self.assign_ids
    }

    pub fn self_id(&self) -> ObjectId {
        self.self_id
    }

    pub fn resolve_id(&self, key: &str) -> Option<ObjectId> {
        self.key_to_id.get(key).copied()
    }

    pub fn resolve_key(&self, id: ObjectId) -> Option<&str> {
        self.id_to_key.get(&id).map(String::as_str)
    }

    pub fn bind_time(&self, id: ObjectId) -> Option<Timestamp> {
        self.bind_times.get(&id).copied()
    }

    pub fn bound_count(&self) -> usize {
        self.key_to_id.len()
    }

    fn bind(&mut self, key: String, id: ObjectId, timestamp: Timestamp) {
        if let Some(previous_id) = self.key_to_id.insert(key.clone(), id) {
            if previous_id != id {
                self.id_to_key.remove(&previous_id);
                self.bind_times.remove(&previous_id);
            }
        }
        if let Some(previous_key) = self.id_to_key.insert(id, key.clone()) {
            if previous_key != key {
                self.key_to_id.remove(&previous_key);
            }
        }
        self.bind_times.insert(id, timestamp);
    }

    fn unbind(&mut self, key: &str) -> Option<ObjectId> {
        let id = self.key_to_id.remove(key)?;
        self.id_to_key.remove(&id);
        self.bind_times.remove(&id);
        Some(id)
    }

    fn command_message(&self, command: RegisterCommand, key: &str, id: ObjectId) -> Message {
        let mut content = ByteStack::with_capacity(key.len() + 9);
        content.push_u32(id, BYTES_PER_ID);
        content.push_str(key);
        content.push_enum(command);
        Message::new(IDS_REGISTER_KEY, content, DeliveryClass::ReliableOrdered)
    }

    /// Binds `key` to a fresh id on the master and returns the announcement.
    pub fn register_key(&mut self, key: &str, now: Timestamp) -> Option<Message> {
        if !self.assign_ids || self.key_to_id.contains_key(key) {
            return None;
        }

        let id = self.id_manager.get_id();
        self.bind(key.to_string(), id, now);
        debug!("Bound '{}' to id {}", key, id);
        Some(self.command_message(RegisterCommand::BindIdAndKey, key, id))
    }

    /// Releases the id of `key` on the master and returns the announcement.
    pub fn unregister_key(&mut self, key: &str) -> Option<Message> {
        if !self.assign_ids || key == IDS_REGISTER_KEY {
            return None;
        }

        let id = self.unbind(key)?;
        self.id_manager.return_id(id);
        debug!("Unbound '{}' from id {}", key, id);
        Some(self.command_message(RegisterCommand::UnbindIdAndKey, key, id))
    }

    /// Every current binding, for a peer that just connected.
    pub fn initial_messages(&self) -> Vec<Message> {
        if !self.assign_ids {
            return Vec::new();
        }

        let mut bindings: Vec<(&ObjectId, &String)> = self
            .id_to_key
            .iter()
            .filter(|(id, _)| **id != self.self_id)
            .collect();
        bindings.sort_by_key(|(id, _)| **id);

        bindings
            .into_iter()
            .map(|(id, key)| self.command_message(RegisterCommand::BindIdAndKey, key, *id))
            .collect()
    }

    /// Applies a bind or unbind announcement. The master ignores them.
    pub fn receive(&mut self, message: &mut Message) -> Result<Option<BindingChange>> {
        let command: RegisterCommand = message.content.pop_enum()?;
        let key = message.content.pop_str()?;
        let id = message.content.pop_u32(BYTES_PER_ID)?;

        if self.assign_ids {
            return Ok(None);
        }
        if key == IDS_REGISTER_KEY || id == self.self_id {
            if id != self.self_id {
                warn!("Ignoring register rebind to id {}", id);
            }
            return Ok(None);
        }

        match command {
            RegisterCommand::BindIdAndKey => {
                self.bind(key.clone(), id, message.timestamp);
                debug!("Bound '{}' to id {}", key, id);
                Ok(Some(BindingChange::Bound { key, id }))
            }
            RegisterCommand::UnbindIdAndKey => {
                if self.resolve_id(&key) != Some(id) {
                    return Ok(None);
                }
                self.unbind(&key);
                debug!("Unbound '{}' from id {}", key, id);
                Ok(Some(BindingChange::Unbound { key, id }))
            }
        }
    }

    /// Forgets every binding learned from the master.
    pub fn revoke_ids(&mut self) {
        if self.assign_ids {
            return;
        }

        let self_id = self.self_id;
        self.id_to_key.retain(|id, _| *id == self_id);
        self.key_to_id.retain(|_, id| *id == self_id);
        self.bind_times.retain(|id, _| *id == self_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deliver(from: &Message, to: &mut IdsRegister) -> Option<BindingChange> {
        let mut copy = from.clone();
        to.receive(&mut copy).unwrap()
    }

    #[test]
    fn test_register_ids_agree_without_exchange() {
        let master = IdsRegister::new(true);
        let client = IdsRegister::new(false);

        assert_eq!(master.self_id(), client.self_id());
        assert_eq!(client.resolve_id(IDS_REGISTER_KEY), Some(client.self_id()));
    }

    #[test]
    fn test_master_assigns_and_client_follows() {
        let mut master = IdsRegister::new(true);
        let mut client = IdsRegister::new(false);

        let bind = master.register_key("car", Timestamp::ZERO).unwrap();
        assert_eq!(bind.delivery, DeliveryClass::ReliableOrdered);
        assert!(master.register_key("car", Timestamp::ZERO).is_none());

        let id = master.resolve_id("car").unwrap();
        assert_eq!(
            deliver(&bind, &mut client),
            Some(BindingChange::Bound { key: "car".to_string(), id })
        );
        assert_eq!(client.resolve_key(id), Some("car"));

        let unbind = master.unregister_key("car").unwrap();
        assert_eq!(
            deliver(&unbind, &mut client),
            Some(BindingChange::Unbound { key: "car".to_string(), id })
        );
        assert!(client.resolve_id("car").is_none());
    }

    #[test]
    fn test_client_never_assigns() {
        let mut client = IdsRegister::new(false);
        assert!(client.register_key("car", Timestamp::ZERO).is_none());
        assert!(client.unregister_key(IDS_REGISTER_KEY).is_none());
        assert_eq!(client.bound_count(), 1);
    }

    #[test]
    fn test_released_id_is_reused() {
        let mut master = IdsRegister::new(true);
        master.register_key("a", Timestamp::ZERO);
        master.register_key("b", Timestamp::ZERO);
        master.register_key("c", Timestamp::ZERO);
        let b = master.resolve_id("b");

        master.unregister_key("b");
        master.register_key("d", Timestamp::ZERO);

        assert_eq!(master.resolve_id("d"), b);
    }

    #[test]
    fn test_initial_messages_replay_bindings() {
        let mut master = IdsRegister::new(true);
        master.register_key("a", Timestamp::ZERO);
        master.register_key("b", Timestamp::ZERO);

        let mut late_client = IdsRegister::new(false);
        let messages = master.initial_messages();
        assert_eq!(messages.len(), 2);
        for message in &messages {
            deliver(message, &mut late_client);
        }

        assert_eq!(late_client.resolve_id("a"), master.resolve_id("a"));
        assert_eq!(late_client.resolve_id("b"), master.resolve_id("b"));
    }

    #[test]
    fn test_rebinding_key_moves_id() {
        let mut client = IdsRegister::new(false);
        let mut master = IdsRegister::new(true);
        let first = master.register_key("a", Timestamp::ZERO).unwrap();
        deliver(&first, &mut client);

        let moved = master.command_message(RegisterCommand::BindIdAndKey, "a", 9);
        deliver(&moved, &mut client);

        assert_eq!(client.resolve_id("a"), Some(9));
        assert!(client.resolve_key(1).is_none());
    }

    #[test]
    fn test_revoke_keeps_register_binding() {
        let mut master = IdsRegister::new(true);
        let mut client = IdsRegister::new(false);
        deliver(&master.register_key("a", Timestamp::ZERO).unwrap(), &mut client);

        client.revoke_ids();

        assert!(client.resolve_id("a").is_none());
        assert_eq!(client.resolve_id(IDS_REGISTER_KEY), Some(client.self_id()));
    }

    #[test]
    fn test_truncated_command_is_error() {
        let mut client = IdsRegister::new(false);
        let mut message = Message::new(IDS_REGISTER_KEY, ByteStack::from_slice(&[0]), DeliveryClass::ReliableOrdered);
        assert!(client.receive(&mut message).is_err());
    }
}
