use crate::byte_stack::ByteStack;
use crate::error::Result;
use crate::messages::Outbox;
use crate::protocol::{DeliveryClass, Message, PayloadType};
use crate::serialization::BinarySerializer;
use log::{debug, trace};
use serde::{Deserialize, Serialize};

/// One command for an externally controlled object, e.g. a traffic light.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlAction {
    pub name: String,
    pub value: String,
}

impl ControlAction {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Applies control actions to the local copy of a controllable object. The
/// same routine runs on the master and on every client.
pub trait ControlPolicy: Send {
    fn apply(&mut self, actions: &[ControlAction]);
}

impl<F> ControlPolicy for F
where
    F: FnMut(&[ControlAction]) + Send,
{
    fn apply(&mut self, actions: &[ControlAction]) {
        self(actions)
    }
}

pub struct DistributedControl {
    key: String,
    policy: Box<dyn ControlPolicy>,
    serializer: BinarySerializer,
    pending: Vec<Message>,
}

impl DistributedControl {
    pub fn new(key: impl Into<String>, policy: impl ControlPolicy + 'static) -> Self {
        Self {
            key: key.into(),
            policy: Box::new(policy),
            serializer: BinarySerializer::default(),
            pending: Vec::new(),
        }
    }

    pub fn with_serializer(mut self, serializer: BinarySerializer) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Applies `actions` locally and queues them for every client.
    pub fn apply_actions(&mut self, actions: Vec<ControlAction>) -> Result<()> {
        self.policy.apply(&actions);
        if actions.is_empty() {
            return Ok(());
        }

        let data = self.serializer.serialize_actions(&actions)?;
        let mut content = ByteStack::with_capacity(data.len() + 5);
        content.push_bytes_with_length(&data);
        content.push_enum(PayloadType::Delta);

        debug!("'{}' forwarding {} control action(s)", self.key, actions.len());
        self.pending
            .push(Message::new(self.key.clone(), content, DeliveryClass::ReliableOrdered));
        Ok(())
    }

    pub fn update(&mut self, outbox: &mut Outbox) {
        for message in self.pending.drain(..) {
            outbox.broadcast(message);
        }
    }
}

pub struct MockedControl {
    key: String,
    policy: Box<dyn ControlPolicy>,
    serializer: BinarySerializer,
}

impl MockedControl {
    pub fn new(key: impl Into<String>, policy: impl ControlPolicy + 'static) -> Self {
        Self {
            key: key.into(),
            policy: Box::new(policy),
            serializer: BinarySerializer::default(),
        }
    }

    pub fn with_serializer(mut self, serializer: BinarySerializer) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn receive(&mut self, message: &mut Message) -> Result<()> {
        let payload: PayloadType = message.content.pop_enum()?;
        if payload != PayloadType::Delta {
            trace!("'{}' ignores {:?} payloads", self.key, payload);
            return Ok(());
        }

        let data = message.content.pop_bytes_with_length()?;
        let actions = self.serializer.deserialize_actions(&data)?;
        self.policy.apply(&actions);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn recorder() -> (Arc<Mutex<Vec<ControlAction>>>, impl ControlPolicy + 'static) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        (log, move |actions: &[ControlAction]| sink.lock().extend_from_slice(actions))
    }

    #[test]
    fn test_actions_replayed_on_replica() {
        let (master_log, master_policy) = recorder();
        let (client_log, client_policy) = recorder();
        let mut authority = DistributedControl::new("light-1", master_policy);
        let mut replica = MockedControl::new("light-1", client_policy);

        let actions = vec![ControlAction::new("state", "green"), ControlAction::new("wait", "3")];
        authority.apply_actions(actions.clone()).unwrap();

        let mut outbox = Outbox::new();
        authority.update(&mut outbox);
        let mut sent: Vec<Message> = outbox.drain().map(|o| o.message).collect();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].delivery, DeliveryClass::ReliableOrdered);

        replica.receive(&mut sent[0]).unwrap();
        assert_eq!(*master_log.lock(), actions);
        assert_eq!(*client_log.lock(), actions);
    }

    #[test]
    fn test_empty_actions_not_forwarded() {
        let (_, policy) = recorder();
        let mut authority = DistributedControl::new("light-1", policy);
        authority.apply_actions(Vec::new()).unwrap();

        let mut outbox = Outbox::new();
        authority.update(&mut outbox);
        assert!(outbox.is_empty());
    }

    #[test]
    fn test_formats_must_match() {
        let (_, master_policy) = recorder();
        let (_, client_policy) = recorder();
        let mut authority =
            DistributedControl::new("light", master_policy).with_serializer(BinarySerializer::json());
        let mut replica =
            MockedControl::new("light", client_policy).with_serializer(BinarySerializer::bincode());

        authority.apply_actions(vec![ControlAction::new("state", "red")]).unwrap();
        let mut outbox = Outbox::new();
        authority.update(&mut outbox);
        let mut message = outbox.drain().next().unwrap().message;

        assert!(replica.receive(&mut message).is_err());
    }
}
