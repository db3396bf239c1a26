use crate::byte_stack::{ByteStack, StackEnum};
use crate::clock::Timestamp;
use crate::error::{ClusterError, Result};
use crate::messages::Outbox;
use crate::protocol::{DeliveryClass, Message, PayloadType};
use log::{trace, warn};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ParameterValue {
    Float(f32),
    Int(i32),
    Bool(bool),
    Trigger(bool),
}

impl ParameterValue {
    fn push(self, content: &mut ByteStack) {
        match self {
            ParameterValue::Float(value) => content.push_f32(value),
            ParameterValue::Int(value) => content.push_i32(value),
            ParameterValue::Bool(value) | ParameterValue::Trigger(value) => content.push_bool(value),
        }
    }

    /// Pops a value of the same type as `self`.
    fn pop_like(self, content: &mut ByteStack) -> Result<Self> {
        Ok(match self {
            ParameterValue::Float(_) => ParameterValue::Float(content.pop_f32()?),
            ParameterValue::Int(_) => ParameterValue::Int(content.pop_i32()?),
            ParameterValue::Bool(_) => ParameterValue::Bool(content.pop_bool()?),
            ParameterValue::Trigger(_) => ParameterValue::Trigger(content.pop_bool()?),
        })
    }

    fn same_type(self, other: ParameterValue) -> bool {
        std::mem::discriminant(&self) == std::mem::discriminant(&other)
    }
}

/// Ordered parameter table. Both ends must declare the same table, ids are
/// positions in it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnimatorParameters {
    parameters: Vec<(String, ParameterValue)>,
}

impl AnimatorParameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: ParameterValue) -> Self {
        self.parameters.push((name.into(), value));
        self
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    pub fn id_of(&self, name: &str) -> Option<usize> {
        self.parameters.iter().position(|(n, _)| n == name)
    }

    pub fn get(&self, name: &str) -> Option<ParameterValue> {
        self.id_of(name).and_then(|id| self.get_by_id(id))
    }

    pub fn get_by_id(&self, id: usize) -> Option<ParameterValue> {
        self.parameters.get(id).map(|(_, v)| *v)
    }

    pub fn set_by_id(&mut self, id: usize, value: ParameterValue) -> Result<()> {
        let slot = self
            .parameters
            .get_mut(id)
            .ok_or_else(|| ClusterError::UnboundKey(format!("animation parameter #{}", id)))?;
        if !slot.1.same_type(value) {
            return Err(ClusterError::InvalidConfig(format!(
                "parameter '{}' is {:?}, not {:?}",
                slot.0, slot.1, value
            )));
        }
        slot.1 = value;
        Ok(())
    }

    pub fn set(&mut self, name: &str, value: ParameterValue) -> Result<()> {
        let id = self
            .id_of(name)
            .ok_or_else(|| ClusterError::UnboundKey(name.to_string()))?;
        self.set_by_id(id, value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, ParameterValue)> {
        self.parameters.iter().map(|(n, v)| (n.as_str(), *v))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnimationCommand {
    SetFloatByName = 0,
    SetFloatById = 1,
    SetIntByName = 2,
    SetIntById = 3,
    SetBoolByName = 4,
    SetBoolById = 5,
    SetTrigger = 6,
    ResetTrigger = 7,
}

impl StackEnum for AnimationCommand {
    const MAX_ORDINAL: u64 = 7;
    const NAME: &'static str = "AnimationCommand";

    fn ordinal(self) -> u64 {
        self as u64
    }

    fn from_ordinal(ordinal: u64) -> Option<Self> {
        match ordinal {
            0 => Some(AnimationCommand::SetFloatByName),
            1 => Some(AnimationCommand::SetFloatById),
            2 => Some(AnimationCommand::SetIntByName),
            3 => Some(AnimationCommand::SetIntById),
            4 => Some(AnimationCommand::SetBoolByName),
            5 => Some(AnimationCommand::SetBoolById),
            6 => Some(AnimationCommand::SetTrigger),
            7 => Some(AnimationCommand::ResetTrigger),
            _ => None,
        }
    }
}

#[derive(Clone, Copy)]
enum Target<'a> {
    Name(&'a str),
    Id(usize),
}

fn command_for(value: ParameterValue, target: &Target<'_>) -> AnimationCommand {
    let by_name = matches!(target, Target::Name(_));
    match (value, by_name) {
        (ParameterValue::Float(_), true) => AnimationCommand::SetFloatByName,
        (ParameterValue::Float(_), false) => AnimationCommand::SetFloatById,
        (ParameterValue::Int(_), true) => AnimationCommand::SetIntByName,
        (ParameterValue::Int(_), false) => AnimationCommand::SetIntById,
        (ParameterValue::Bool(_), true) => AnimationCommand::SetBoolByName,
        (ParameterValue::Bool(_), false) => AnimationCommand::SetBoolById,
        (ParameterValue::Trigger(true), _) => AnimationCommand::SetTrigger,
        (ParameterValue::Trigger(false), _) => AnimationCommand::ResetTrigger,
    }
}

fn snapshot_content(parameters: &AnimatorParameters) -> ByteStack {
    let mut content = ByteStack::with_capacity(parameters.len() * 4 + 5);
    for (_, value) in parameters.parameters.iter().rev() {
        value.push(&mut content);
    }
    content.push_i32(parameters.len() as i32);
    content.push_enum(PayloadType::Snapshot);
    content
}

/// Authoritative animator state. Every change goes out as a delta; the full
/// table goes out once on start and to each new peer.
pub struct DistributedAnimation {
    key: String,
    parameters: AnimatorParameters,
    pending: Vec<Message>,
    snapshot_sent: bool,
}

impl DistributedAnimation {
    pub fn new(key: impl Into<String>, parameters: AnimatorParameters) -> Self {
        Self {
            key: key.into(),
            parameters,
            pending: Vec::new(),
            snapshot_sent: false,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn parameters(&self) -> &AnimatorParameters {
        &self.parameters
    }

    fn queue_delta(&mut self, target: Target<'_>, value: ParameterValue) -> Result<()> {
        let id = match target {
            Target::Name(name) => self
                .parameters
                .id_of(name)
                .ok_or_else(|| ClusterError::UnboundKey(name.to_string()))?,
            Target::Id(id) => id,
        };
        self.parameters.set_by_id(id, value)?;

        let command = command_for(value, &target);
        let mut content = ByteStack::new();
        match command {
            AnimationCommand::SetTrigger | AnimationCommand::ResetTrigger => {}
            _ => value.push(&mut content),
        }
        match target {
            Target::Name(name) => content.push_str(name),
            Target::Id(id) => content.push_i32(id as i32),
        }
        content.push_enum(command);
        content.push_enum(PayloadType::Delta);

        self.pending
            .push(Message::new(self.key.clone(), content, DeliveryClass::ReliableSequenced));
        Ok(())
    }

    pub fn set_float(&mut self, name: &str, value: f32) -> Result<()> {
        self.queue_delta(Target::Name(name), ParameterValue::Float(value))
    }

    pub fn set_float_by_id(&mut self, id: usize, value: f32) -> Result<()> {
        self.queue_delta(Target::Id(id), ParameterValue::Float(value))
    }

    pub fn set_int(&mut self, name: &str, value: i32) -> Result<()> {
        self.queue_delta(Target::Name(name), ParameterValue::Int(value))
    }

    pub fn set_int_by_id(&mut self, id: usize, value: i32) -> Result<()> {
        self.queue_delta(Target::Id(id), ParameterValue::Int(value))
    }

    pub fn set_bool(&mut self, name: &str, value: bool) -> Result<()> {
        self.queue_delta(Target::Name(name), ParameterValue::Bool(value))
    }

    pub fn set_bool_by_id(&mut self, id: usize, value: bool) -> Result<()> {
        self.queue_delta(Target::Id(id), ParameterValue::Bool(value))
    }

    pub fn set_trigger(&mut self, name: &str) -> Result<()> {
        self.queue_delta(Target::Name(name), ParameterValue::Trigger(true))
    }

    pub fn reset_trigger(&mut self, name: &str) -> Result<()> {
        self.queue_delta(Target::Name(name), ParameterValue::Trigger(false))
    }

    pub fn update(&mut self, outbox: &mut Outbox) {
        if !self.snapshot_sent {
            outbox.broadcast(self.initial_message());
            self.snapshot_sent = true;
            // The snapshot already carries every queued change
            self.pending.clear();
        }
        for message in self.pending.drain(..) {
            outbox.broadcast(message);
        }
    }

    pub fn initial_message(&self) -> Message {
        Message::new(
            self.key.clone(),
            snapshot_content(&self.parameters),
            DeliveryClass::ReliableUnordered,
        )
    }
}

/// Replica animator.
pub struct MockedAnimation {
    key: String,
    parameters: AnimatorParameters,
    last_snapshot: Option<Timestamp>,
    last_applied: Option<Timestamp>,
}

impl MockedAnimation {
    pub fn new(key: impl Into<String>, parameters: AnimatorParameters) -> Self {
        Self {
            key: key.into(),
            parameters,
            last_snapshot: None,
            last_applied: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn parameters(&self) -> &AnimatorParameters {
        &self.parameters
    }

    /// Returns whether `name` was triggered, resetting it.
    pub fn consume_trigger(&mut self, name: &str) -> bool {
        if self.parameters.get(name) != Some(ParameterValue::Trigger(true)) {
            return false;
        }
        self.parameters.set(name, ParameterValue::Trigger(false)).is_ok()
    }

    pub fn receive(&mut self, message: &mut Message) -> Result<()> {
        let payload: PayloadType = message.content.pop_enum()?;
        match payload {
            PayloadType::Snapshot => self.apply_snapshot(message),
            PayloadType::Delta => {
                if self.last_snapshot.map_or(false, |last| message.timestamp < last) {
                    trace!("'{}' ignores a delta older than its snapshot", self.key);
                    return Ok(());
                }
                self.apply_delta(&mut message.content)?;
                self.advance(message.timestamp);
                Ok(())
            }
        }
    }

    fn apply_snapshot(&mut self, message: &mut Message) -> Result<()> {
        // Deltas travel on another channel and may overtake a snapshot
        if self.last_applied.map_or(false, |last| message.timestamp <= last) {
            trace!("'{}' ignores a snapshot older than its state", self.key);
            return Ok(());
        }

        let count = message.content.pop_i32()?;
        if count < 0 || count as usize != self.parameters.len() {
            warn!(
                "'{}' received {} parameters, expected {}",
                self.key,
                count,
                self.parameters.len()
            );
            return Err(ClusterError::InvalidLength(count));
        }

        let mut values = Vec::with_capacity(self.parameters.len());
        for (_, template) in self.parameters.iter() {
            values.push(template.pop_like(&mut message.content)?);
        }
        for (id, value) in values.into_iter().enumerate() {
            self.parameters.set_by_id(id, value)?;
        }
        self.last_snapshot = Some(message.timestamp);
        self.advance(message.timestamp);
        Ok(())
    }

    fn advance(&mut self, timestamp: Timestamp) {
        if self.last_applied.map_or(true, |last| timestamp > last) {
            self.last_applied = Some(timestamp);
        }
    }

    fn apply_delta(&mut self, content: &mut ByteStack) -> Result<()> {
        let command: AnimationCommand = content.pop_enum()?;
        let id = match command {
            AnimationCommand::SetFloatById | AnimationCommand::SetIntById | AnimationCommand::SetBoolById => {
                let id = content.pop_i32()?;
                if id < 0 {
                    return Err(ClusterError::InvalidLength(id));
                }
                id as usize
            }
            _ => {
                let name = content.pop_str()?;
                self.parameters
                    .id_of(&name)
                    .ok_or(ClusterError::UnboundKey(name))?
            }
        };

        let value = match command {
            AnimationCommand::SetFloatByName | AnimationCommand::SetFloatById => {
                ParameterValue::Float(content.pop_f32()?)
            }
            AnimationCommand::SetIntByName | AnimationCommand::SetIntById => {
                ParameterValue::Int(content.pop_i32()?)
            }
            AnimationCommand::SetBoolByName | AnimationCommand::SetBoolById => {
                ParameterValue::Bool(content.pop_bool()?)
            }
            AnimationCommand::SetTrigger => ParameterValue::Trigger(true),
            AnimationCommand::ResetTrigger => ParameterValue::Trigger(false),
        };
        self.parameters.set_by_id(id, value)
    }
}
