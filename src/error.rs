use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("Stack underflow: requested {requested} bytes, {available} available")]
    StackUnderflow { requested: usize, available: usize },

    #[error("Invalid string payload: {0}")]
    InvalidString(#[from] std::string::FromUtf8Error),

    #[error("Invalid length prefix: {0}")]
    InvalidLength(i32),

    #[error("Invalid {kind} ordinal: {value}")]
    InvalidOrdinal { kind: &'static str, value: u64 },

    #[error("Value {value} out of bounds [{min}, {max}]")]
    ValueOutOfBounds { value: f32, min: f32, max: f32 },

    #[error("Invalid byte count: {0} (expected 1..=4)")]
    InvalidByteCount(usize),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Address already in use: {0}")]
    AddressInUse(std::net::SocketAddr),

    #[error("Peer not connected: {0}")]
    NotConnected(std::net::SocketAddr),

    #[error("Packet too large: {size} bytes (max {max})")]
    PacketTooLarge { size: usize, max: usize },

    #[error("No identifier bound for key: {0}")]
    UnboundKey(String),

    #[error("Timed out waiting for {0}")]
    ConnectTimeout(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("MessagePack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    #[error("MessagePack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    #[error("Bincode error: {0}")]
    Bincode(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, ClusterError>;
