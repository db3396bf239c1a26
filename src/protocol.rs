use crate::byte_stack::{ByteStack, StackEnum};
use crate::clock::Timestamp;
use serde::{Deserialize, Serialize};

pub const IDS_REGISTER_KEY: &str = "IdsRegister";
pub const SIMULATION_MANAGER_KEY: &str = "SimulationManager";
pub const DEFAULT_APPLICATION_KEY: &str = "CLUSTER-SYNC";
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

pub type ObjectId = u32;
pub const BYTES_PER_ID: usize = 4;

/// Delivery guarantee requested for a message.
///
/// Ordinals are part of the wire format and must never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DeliveryClass {
    ReliableUnordered = 0,
    UnreliableSequenced = 1,
    ReliableOrdered = 2,
    ReliableSequenced = 3,
    Unreliable = 4,
}

impl DeliveryClass {
    pub fn ordinal(self) -> u8 {
        self as u8
    }

    pub fn from_ordinal(ordinal: u8) -> Option<Self> {
        match ordinal {
            0 => Some(DeliveryClass::ReliableUnordered),
            1 => Some(DeliveryClass::UnreliableSequenced),
            2 => Some(DeliveryClass::ReliableOrdered),
            3 => Some(DeliveryClass::ReliableSequenced),
            4 => Some(DeliveryClass::Unreliable),
            _ => None,
        }
    }

    pub fn is_reliable(self) -> bool {
        matches!(
            self,
            DeliveryClass::ReliableUnordered
                | DeliveryClass::ReliableOrdered
                | DeliveryClass::ReliableSequenced
        )
    }

    pub fn is_ordered(self) -> bool {
        matches!(self, DeliveryClass::ReliableOrdered)
    }

    pub fn is_sequenced(self) -> bool {
        matches!(
            self,
            DeliveryClass::UnreliableSequenced | DeliveryClass::ReliableSequenced
        )
    }
}

/// Payload addressed to a replicated object by its key.
#[derive(Debug, Clone)]
pub struct Message {
    pub key: String,
    pub content: ByteStack,
    pub delivery: DeliveryClass,
    pub timestamp: Timestamp,
}

impl Message {
    pub fn new(key: impl Into<String>, content: ByteStack, delivery: DeliveryClass) -> Self {
        Self {
            key: key.into(),
            content,
            delivery,
            timestamp: Timestamp::ZERO,
        }
    }

    pub fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Tag on top of every replicated object's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum PayloadType {
    Snapshot = 0,
    Delta = 1,
}

impl StackEnum for PayloadType {
    const MAX_ORDINAL: u64 = 1;
    const NAME: &'static str = "PayloadType";

    fn ordinal(self) -> u64 {
        self as u64
    }

    fn from_ordinal(ordinal: u64) -> Option<Self> {
        match ordinal {
            0 => Some(PayloadType::Snapshot),
            1 => Some(PayloadType::Delta),
            _ => None,
        }
    }
}

/// Commands exchanged between the master and its clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterCommand {
    Info { version: String, identifier: String },
    Load,
    Ready,
    Run,
    Stop,
    Ping { id: u32 },
    Pong { id: u32 },
}

impl ClusterCommand {
    pub fn delivery(&self) -> DeliveryClass {
        match self {
            ClusterCommand::Ping { .. } | ClusterCommand::Pong { .. } => DeliveryClass::Unreliable,
            _ => DeliveryClass::ReliableOrdered,
        }
    }
}
