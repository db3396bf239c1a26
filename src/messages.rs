use crate::clock::{TimeManager, Timestamp};
use crate::connection::{ConnectionEvent, ConnectionManager};
use crate::debug::log_message;
use crate::error::Result;
use crate::ids_register::{BindingChange, IdsRegister};
use crate::protocol::{DeliveryClass, Message, ObjectId, BYTES_PER_ID};
use crate::byte_stack::ByteStack;
use crate::transport::Transport;
use ahash::AHashMap;
use log::{debug, trace, warn};
use std::net::SocketAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Broadcast,
    Unicast(SocketAddr),
}

#[derive(Debug, Clone)]
pub struct Outgoing {
    pub destination: Destination,
    pub message: Message,
}

/// Messages produced during a tick, sent once the tick finishes.
#[derive(Debug, Default)]
pub struct Outbox {
    messages: Vec<Outgoing>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn broadcast(&mut self, message: Message) {
        self.messages.push(Outgoing {
            destination: Destination::Broadcast,
            message,
        });
    }

    pub fn unicast(&mut self, address: SocketAddr, message: Message) {
        self.messages.push(Outgoing {
            destination: Destination::Unicast(address),
            message,
        });
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Outgoing> {
        self.messages.iter()
    }

    pub fn drain(&mut self) -> std::vec::Drain<'_, Outgoing> {
        self.messages.drain(..)
    }
}

#[derive(Debug, Clone)]
pub enum MessagesEvent {
    PeerConnected(SocketAddr),
    PeerDisconnected(SocketAddr),
    Received { from: SocketAddr, message: Message },
}

#[derive(Debug)]
struct AwaitingIncoming {
    from: SocketAddr,
    message: Message,
    held_at: Timestamp,
}

/// Routes messages between keyed objects and the connection manager.
///
/// Outgoing payloads get the object id and send time pushed on top; incoming
/// ones have both popped, the time corrected by the sender's clock offset and
/// the id resolved back to a key. Messages whose id or key is not bound yet
/// are held until the binding arrives.
pub struct MessagesManager<T: Transport> {
    connection: ConnectionManager<T>,
    register: IdsRegister,
    time: TimeManager,
    awaiting_incoming: AHashMap<ObjectId, Vec<AwaitingIncoming>>,
    awaiting_outgoing: AHashMap<String, Vec<Outgoing>>,
}

impl<T: Transport> MessagesManager<T> {
    pub fn new(connection: ConnectionManager<T>) -> Self {
        let register = IdsRegister::new(connection.is_master());
        Self {
            connection,
            register,
            time: TimeManager,
            awaiting_incoming: AHashMap::new(),
            awaiting_outgoing: AHashMap::new(),
        }
    }

    pub fn connection(&self) -> &ConnectionManager<T> {
        &self.connection
    }

    pub fn connection_mut(&mut self) -> &mut ConnectionManager<T> {
        &mut self.connection
    }

    pub fn register(&self) -> &IdsRegister {
        &self.register
    }

    pub fn awaiting_incoming_count(&self) -> usize {
        self.awaiting_incoming.values().map(Vec::len).sum()
    }

    pub fn awaiting_outgoing_count(&self) -> usize {
        self.awaiting_outgoing.values().map(Vec::len).sum()
    }

    pub fn register_key(&mut self, key: &str, now: Timestamp) {
        if let Some(announcement) = self.register.register_key(key, now) {
            self.broadcast(announcement, now);
        }
        self.flush_outgoing(key, now);
    }

    pub fn unregister_key(&mut self, key: &str, now: Timestamp) {
        if let Some(announcement) = self.register.unregister_key(key) {
            self.broadcast(announcement, now);
        }
        self.awaiting_outgoing.remove(key);
    }

    pub fn send(&mut self, outgoing: Outgoing, now: Timestamp) {
        match outgoing.destination {
            Destination::Broadcast => self.broadcast(outgoing.message, now),
            Destination::Unicast(address) => self.unicast(address, outgoing.message, now),
        }
    }

    pub fn send_all(&mut self, outbox: &mut Outbox, now: Timestamp) {
        for outgoing in outbox.drain() {
            self.send(outgoing, now);
        }
    }

    fn stamp(&self, message: &mut Message, now: Timestamp) -> bool {
        let id = match self.register.resolve_id(&message.key) {
            Some(id) => id,
            None => return false,
        };

        message.content.push_u32(id, BYTES_PER_ID);
        self.time.push_timestamp(&mut message.content, now);
        message.timestamp = now;
        true
    }

    fn hold_outgoing(&mut self, destination: Destination, message: Message) {
        trace!("Holding '{}' until its key is bound", message.key);
        self.awaiting_outgoing
            .entry(message.key.clone())
            .or_default()
            .push(Outgoing { destination, message });
    }

    pub fn unicast(&mut self, address: SocketAddr, mut message: Message, now: Timestamp) {
        if !self.stamp(&mut message, now) {
            self.hold_outgoing(Destination::Unicast(address), message);
            return;
        }
        log_message("Unicast", &message);
        self.connection.unicast(address, &message);
    }

    pub fn broadcast(&mut self, mut message: Message, now: Timestamp) {
        if !self.stamp(&mut message, now) {
            self.hold_outgoing(Destination::Broadcast, message);
            return;
        }
        log_message("Broadcast", &message);
        self.connection.broadcast(&message);
    }

    fn flush_outgoing(&mut self, key: &str, now: Timestamp) {
        if let Some(waiting) = self.awaiting_outgoing.remove(key) {
            debug!("Sending {} held message(s) for '{}'", waiting.len(), key);
            for outgoing in waiting {
                self.send(outgoing, now);
            }
        }
    }

    /// Pumps the connection once and returns routed events in arrival order.
    pub fn poll(&mut self, now: Timestamp) -> Vec<MessagesEvent> {
        let mut events = Vec::new();

        for event in self.connection.poll_events() {
            match event {
                ConnectionEvent::PeerConnected(address) => {
                    for announcement in self.register.initial_messages() {
                        self.unicast(address, announcement, now);
                    }
                    events.push(MessagesEvent::PeerConnected(address));
                }
                ConnectionEvent::PeerDisconnected(address) => {
                    if !self.connection.is_master() && self.connection.master_peer().is_none() {
                        self.revoke_identifiers();
                    }
                    events.push(MessagesEvent::PeerDisconnected(address));
                }
                ConnectionEvent::MessageReceived { from, content, delivery } => {
                    if let Err(e) = self.route(from, content, delivery, now, &mut events) {
                        warn!("Dropping malformed message from {}: {}", from, e);
                    }
                }
            }
        }

        self.expire_incoming(now);
        events
    }

    fn route(
        &mut self,
        from: SocketAddr,
        mut content: ByteStack,
        delivery: DeliveryClass,
        now: Timestamp,
        events: &mut Vec<MessagesEvent>,
    ) -> Result<()> {
        let offset = self.connection.clock_offset(&from).unwrap_or(0);
        let timestamp = self.time.pop_timestamp(&mut content, offset)?;
        let id = content.pop_u32(BYTES_PER_ID)?;

        let mut message = Message::new(String::new(), content, delivery).with_timestamp(timestamp);

        if id == self.register.self_id() {
            message.key = self.register.resolve_key(id).unwrap_or_default().to_string();
            log_message("Received", &message);
            if let Some(change) = self.register.receive(&mut message)? {
                self.apply_binding_change(change, now, events);
            }
            return Ok(());
        }

        match self.register.resolve_key(id) {
            Some(key) => {
                if self.register.bind_time(id).map_or(false, |bound_at| message.timestamp < bound_at) {
                    trace!("Dropping message for a previous owner of id {}", id);
                    return Ok(());
                }
                message.key = key.to_string();
                log_message("Received", &message);
                events.push(MessagesEvent::Received { from, message });
            }
            None => {
                trace!("Holding message for unbound id {}", id);
                self.awaiting_incoming.entry(id).or_default().push(AwaitingIncoming {
                    from,
                    message,
                    held_at: now,
                });
            }
        }
        Ok(())
    }

    fn apply_binding_change(&mut self, change: BindingChange, now: Timestamp, events: &mut Vec<MessagesEvent>) {
        match change {
            BindingChange::Bound { key, id } => {
                let bound_at = self.register.bind_time(id).unwrap_or(Timestamp::ZERO);
                if let Some(waiting) = self.awaiting_incoming.remove(&id) {
                    for held in waiting {
                        // Addressed to an earlier owner of this id
                        if held.message.timestamp < bound_at {
                            continue;
                        }
                        let mut message = held.message;
                        message.key = key.clone();
                        events.push(MessagesEvent::Received {
                            from: held.from,
                            message,
                        });
                    }
                }
                self.flush_outgoing(&key, now);
            }
            BindingChange::Unbound { key, id } => {
                self.awaiting_incoming.remove(&id);
                self.awaiting_outgoing.remove(&key);
            }
        }
    }

    fn expire_incoming(&mut self, now: Timestamp) {
        let timeout = self.connection.timeout();
        let mut expired = 0usize;

        self.awaiting_incoming.retain(|_, waiting| {
            let before = waiting.len();
            waiting.retain(|held| now < held.held_at + timeout);
            expired += before - waiting.len();
            !waiting.is_empty()
        });

        if expired > 0 {
            warn!("Dropped {} message(s) addressed to ids that were never bound", expired);
        }
    }

    /// Client side: forget bindings and held messages after losing the master.
    pub fn revoke_identifiers(&mut self) {
        if self.register.assigns_ids() {
            return;
        }

        self.awaiting_incoming.clear();
        self.awaiting_outgoing.clear();
        self.register.revoke_ids();
    }

    pub fn stop(&mut self) {
        self.connection.stop();
        self.revoke_identifiers();
    }
}
