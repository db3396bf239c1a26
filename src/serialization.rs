use crate::error::Result;
use crate::protocol::ClusterCommand;
use crate::replication::control::ControlAction;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryFormat {
    Json,
    MessagePack,
    #[default]
    Bincode,
}

/// Encodes structured payloads that ride inside a byte stack.
#[derive(Debug, Clone, Copy)]
pub struct BinarySerializer {
    format: BinaryFormat,
}

impl Default for BinarySerializer {
    fn default() -> Self {
        Self::new(BinaryFormat::default())
    }
}

impl BinarySerializer {
    pub fn new(format: BinaryFormat) -> Self {
        Self { format }
    }

    pub fn json() -> Self {
        Self::new(BinaryFormat::Json)
    }

    pub fn messagepack() -> Self {
        Self::new(BinaryFormat::MessagePack)
    }

    pub fn bincode() -> Self {
        Self::new(BinaryFormat::Bincode)
    }

    pub fn serialize<T: Serialize>(&self, value: &T) -> Result<Bytes> {
        match self.format {
            BinaryFormat::Json => {
                let json = serde_json::to_vec(value)?;
                Ok(Bytes::from(json))
            }
            BinaryFormat::MessagePack => {
                let msgpack = rmp_serde::to_vec_named(value)?;
                Ok(Bytes::from(msgpack))
            }
            BinaryFormat::Bincode => {
                let bincode_data = bincode::serialize(value)?;
                Ok(Bytes::from(bincode_data))
            }
        }
    }

    pub fn deserialize<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        match self.format {
            BinaryFormat::Json => Ok(serde_json::from_slice(data)?),
            BinaryFormat::MessagePack => Ok(rmp_serde::from_slice(data)?),
            BinaryFormat::Bincode => Ok(bincode::deserialize(data)?),
        }
    }

    pub fn serialize_command(&self, command: &ClusterCommand) -> Result<Bytes> {
        self.serialize(command)
    }

    pub fn deserialize_command(&self, data: &[u8]) -> Result<ClusterCommand> {
        self.deserialize(data)
    }

    pub fn serialize_actions(&self, actions: &[ControlAction]) -> Result<Bytes> {
        self.serialize(&actions)
    }

    pub fn deserialize_actions(&self, data: &[u8]) -> Result<Vec<ControlAction>> {
        self.deserialize(data)
    }

    pub fn get_format(&self) -> BinaryFormat {
        self.format
    }
}
