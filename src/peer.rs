use std::net::SocketAddr;

/// One connection owned by the connection manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerHandle {
    pub endpoint: SocketAddr,
    pub identifier: Option<String>,
    pub connected: bool,
    /// Estimate of (remote clock - local clock) in ticks.
    pub clock_offset_ticks: i64,
}

impl PeerHandle {
    pub fn new(endpoint: SocketAddr) -> Self {
        Self {
            endpoint,
            identifier: None,
            connected: false,
            clock_offset_ticks: 0,
        }
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }
}
