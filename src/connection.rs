use crate::byte_stack::ByteStack;
use crate::debug::{trace_transport_receive, trace_transport_send};
use crate::error::{ClusterError, Result};
use crate::peer::PeerHandle;
use crate::protocol::{DeliveryClass, Message, DEFAULT_APPLICATION_KEY};
use crate::transport::{ConnectRequest, Transport, TransportEvent};
use ahash::AHashMap;
use bytes::Bytes;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Master,
    Client,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub application_key: String,
    pub identifier: String,
    /// Client identifiers the master accepts. Empty accepts anyone.
    pub acceptable_identifiers: Vec<String>,
    pub timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            application_key: DEFAULT_APPLICATION_KEY.to_string(),
            identifier: String::new(),
            acceptable_identifiers: Vec::new(),
            timeout: Duration::from_secs(30),
        }
    }
}

impl ConnectionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_application_key(mut self, key: impl Into<String>) -> Self {
        self.application_key = key.into();
        self
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = identifier.into();
        self
    }

    pub fn with_acceptable_identifiers(mut self, identifiers: Vec<String>) -> Self {
        self.acceptable_identifiers = identifiers;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    PeerConnected(SocketAddr),
    PeerDisconnected(SocketAddr),
    MessageReceived {
        from: SocketAddr,
        content: ByteStack,
        delivery: DeliveryClass,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub messages_received: u64,
    pub bytes_received: u64,
    pub dropped_oversize: u64,
    pub dropped_disconnected: u64,
}

/// Owns every peer connection of one process, in either role.
pub struct ConnectionManager<T: Transport> {
    transport: T,
    role: Role,
    config: ConnectionConfig,
    port: Option<u16>,
    peers: AHashMap<SocketAddr, PeerHandle>,
    master: Option<SocketAddr>,
    stats: ConnectionStats,
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new(transport: T, role: Role, config: ConnectionConfig) -> Self {
        Self {
            transport,
            role,
            config,
            port: None,
            peers: AHashMap::new(),
            master: None,
            stats: ConnectionStats::default(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_master(&self) -> bool {
        self.role == Role::Master
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }

    pub fn local_address(&self) -> Option<SocketAddr> {
        self.transport.local_address()
    }

    pub fn start(&mut self, port: u16) -> bool {
        match self.transport.start(port) {
            Ok(address) => {
                info!("Listening for cluster peers on {}", address);
                self.port = Some(address.port());
                true
            }
            Err(e) => {
                error!("Failed to start listening on port {}: {}", port, e);
                false
            }
        }
    }

    /// Starts an asynchronous connect; the handle turns connected once the
    /// transport confirms it during [`ConnectionManager::poll_events`].
    pub fn connect(&mut self, address: SocketAddr) -> Result<&PeerHandle> {
        if self.peers.contains_key(&address) {
            warn!("Already connected or connecting to {}", address);
        } else {
            let request = ConnectRequest {
                application_key: self.config.application_key.clone(),
                identifier: self.config.identifier.clone(),
            };
            self.transport.connect(address, request)?;
            self.peers.insert(address, PeerHandle::new(address));
        }

        self.peers
            .get(&address)
            .ok_or(ClusterError::NotConnected(address))
    }

    pub fn peer(&self, address: &SocketAddr) -> Option<&PeerHandle> {
        self.peers.get(address)
    }

    pub fn connected_peers(&self) -> impl Iterator<Item = &PeerHandle> {
        self.peers.values().filter(|p| p.connected)
    }

    pub fn connected_count(&self) -> usize {
        self.connected_peers().count()
    }

    pub fn master_peer(&self) -> Option<&PeerHandle> {
        self.master.and_then(|address| self.peers.get(&address))
    }

    pub fn clock_offset(&self, address: &SocketAddr) -> Option<i64> {
        self.peers
            .get(address)
            .filter(|p| p.connected)
            .map(|p| p.clock_offset_ticks)
    }

    fn accepts(&self, request: &ConnectRequest) -> std::result::Result<(), &'static str> {
        if request.application_key != self.config.application_key {
            return Err("application key mismatch");
        }
        let already_connected = self
            .peers
            .values()
            .any(|p| p.identifier.as_deref() == Some(request.identifier.as_str()));
        if already_connected {
            return Err("identifier already connected");
        }
        if !self.config.acceptable_identifiers.is_empty()
            && !self.config.acceptable_identifiers.contains(&request.identifier)
        {
            return Err("identifier not acceptable");
        }
        Ok(())
    }

    fn handle_request(&mut self, from: SocketAddr, request: ConnectRequest) -> Result<()> {
        if self.role == Role::Client {
            warn!("Client rejects incoming connection request from {}", from);
            return self.transport.reject(from);
        }

        match self.accepts(&request) {
            Ok(()) => {
                self.transport.accept(from)?;
                self.peers
                    .insert(from, PeerHandle::new(from).with_identifier(request.identifier));
            }
            Err(reason) => {
                warn!(
                    "Rejected connection request from {} ({}): {}",
                    from, request.identifier, reason
                );
                self.transport.reject(from)?;
            }
        }
        Ok(())
    }

    /// Pumps the transport once and reports what happened, in arrival order.
    pub fn poll_events(&mut self) -> Vec<ConnectionEvent> {
        let mut events = Vec::new();

        for event in self.transport.poll() {
            match event {
                TransportEvent::ConnectionRequest { from, request } => {
                    if let Err(e) = self.handle_request(from, request) {
                        error!("Failed to answer connection request from {}: {}", from, e);
                    }
                }
                TransportEvent::Connected { peer } => {
                    let handle = self.peers.entry(peer).or_insert_with(|| PeerHandle::new(peer));
                    handle.connected = true;
                    if self.role == Role::Client {
                        self.master = Some(peer);
                    }
                    info!("Peer {} connected", peer);
                    events.push(ConnectionEvent::PeerConnected(peer));
                }
                TransportEvent::Disconnected { peer } => {
                    if let Some(handle) = self.peers.remove(&peer) {
                        if self.master == Some(peer) {
                            self.master = None;
                        }
                        if handle.connected {
                            info!("Peer {} disconnected", peer);
                        } else {
                            warn!("Connection attempt with {} failed", peer);
                        }
                        events.push(ConnectionEvent::PeerDisconnected(peer));
                    }
                }
                TransportEvent::Received { from, data, delivery } => {
                    if !self.peers.get(&from).map(|p| p.connected).unwrap_or(false) {
                        debug!("Dropping {} bytes from unknown peer {}", data.len(), from);
                        continue;
                    }
                    trace_transport_receive(data.len(), &from.to_string());
                    self.stats.messages_received += 1;
                    self.stats.bytes_received += data.len() as u64;
                    events.push(ConnectionEvent::MessageReceived {
                        from,
                        content: ByteStack::from(data),
                        delivery,
                    });
                }
                TransportEvent::ClockOffset { peer, offset_ticks } => {
                    if let Some(handle) = self.peers.get_mut(&peer) {
                        handle.clock_offset_ticks = offset_ticks;
                    }
                }
            }
        }

        events
    }

    fn send_to(&mut self, peer: SocketAddr, data: Bytes, delivery: DeliveryClass) {
        let max = self.transport.max_packet_size();
        if data.len() > max {
            error!(
                "Dropping message to {}: {} bytes exceeds the {} byte packet limit",
                peer,
                data.len(),
                max
            );
            self.stats.dropped_oversize += 1;
            return;
        }

        let size = data.len();
        match self.transport.send(peer, data, delivery) {
            Ok(()) => {
                trace_transport_send(size, &peer.to_string());
                self.stats.messages_sent += 1;
                self.stats.bytes_sent += size as u64;
            }
            Err(ClusterError::PacketTooLarge { size, max }) => {
                error!("Dropping message to {}: {} bytes exceeds {}", peer, size, max);
                self.stats.dropped_oversize += 1;
            }
            Err(e) => {
                warn!("Failed to send message to {}: {}", peer, e);
                self.stats.dropped_disconnected += 1;
            }
        }
    }

    pub fn unicast(&mut self, address: SocketAddr, message: &Message) {
        if !self.peers.get(&address).map(|p| p.connected).unwrap_or(false) {
            warn!("Cannot send '{}' to disconnected peer {}", message.key, address);
            self.stats.dropped_disconnected += 1;
            return;
        }

        self.send_to(address, message.content.to_bytes(), message.delivery);
    }

    pub fn broadcast(&mut self, message: &Message) {
        let data = message.content.to_bytes();
        let peers: Vec<SocketAddr> = self.connected_peers().map(|p| p.endpoint).collect();
        for peer in peers {
            self.send_to(peer, data.clone(), message.delivery);
        }
    }

    pub fn disconnect(&mut self, address: SocketAddr) {
        if let Err(e) = self.transport.disconnect(address) {
            warn!("Failed to disconnect {}: {}", address, e);
        }
    }

    /// Closes every peer and the listener. Safe to call when idle.
    pub fn stop(&mut self) {
        if self.peers.is_empty() && self.port.is_none() && self.transport.local_address().is_none() {
            return;
        }

        let peers: Vec<SocketAddr> = self.peers.keys().copied().collect();
        for peer in peers {
            self.disconnect(peer);
        }
        self.transport.stop();
        self.peers.clear();
        self.master = None;
        self.port = None;
        info!("Connection manager stopped");
    }

    pub fn get_stats(&self) -> &ConnectionStats {
        &self.stats
    }

    pub fn get_config(&self) -> &ConnectionConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryNetwork;
    use crate::transport::MemoryTransport;

    fn master(network: &MemoryNetwork, config: ConnectionConfig) -> ConnectionManager<MemoryTransport> {
        let mut manager = ConnectionManager::new(network.transport(), Role::Master, config);
        assert!(manager.start(8000));
        manager
    }

    fn client(network: &MemoryNetwork, identifier: &str) -> ConnectionManager<MemoryTransport> {
        ConnectionManager::new(
            network.transport(),
            Role::Client,
            ConnectionConfig::new().with_identifier(identifier),
        )
    }

    fn master_address() -> SocketAddr {
        "127.0.0.1:8000".parse().unwrap()
    }

    fn pump(master: &mut ConnectionManager<MemoryTransport>, clients: &mut [&mut ConnectionManager<MemoryTransport>]) {
        for _ in 0..3 {
            master.poll_events();
            for client in clients.iter_mut() {
                client.poll_events();
            }
        }
    }

    #[test]
    fn test_start_fails_on_used_port() {
        let network = MemoryNetwork::new();
        let _first = master(&network, ConnectionConfig::new());
        let mut second = ConnectionManager::new(network.transport(), Role::Master, ConnectionConfig::new());

        assert!(!second.start(8000));
    }

    #[test]
    fn test_client_connects_and_tracks_master() {
        let network = MemoryNetwork::new();
        let mut server = master(&network, ConnectionConfig::new());
        let mut c = client(&network, "client-a");

        let handle = c.connect(master_address()).unwrap();
        assert!(!handle.connected);

        server.poll_events();
        let events = c.poll_events();
        assert!(matches!(&events[..], [ConnectionEvent::PeerConnected(addr)] if *addr == master_address()));
        assert_eq!(c.master_peer().map(|p| p.endpoint), Some(master_address()));

        assert_eq!(server.connected_count(), 0);
        server.poll_events();
        assert_eq!(server.connected_count(), 1);
    }

    #[test]
    fn test_master_rejects_unknown_identifier_and_key() {
        let network = MemoryNetwork::new();
        let config = ConnectionConfig::new().with_acceptable_identifiers(vec!["good".to_string()]);
        let mut server = master(&network, config);

        let mut bad = client(&network, "bad");
        let mut wrong_key = ConnectionManager::new(
            network.transport(),
            Role::Client,
            ConnectionConfig::new().with_identifier("good").with_application_key("other"),
        );
        let mut good = client(&network, "good");
        bad.connect(master_address()).unwrap();
        wrong_key.connect(master_address()).unwrap();
        good.connect(master_address()).unwrap();

        pump(&mut server, &mut [&mut bad, &mut wrong_key, &mut good]);

        assert_eq!(server.connected_count(), 1);
        assert!(bad.master_peer().is_none());
        assert!(wrong_key.master_peer().is_none());
        assert!(good.master_peer().is_some());
    }

    #[test]
    fn test_duplicate_identifier_rejected() {
        let network = MemoryNetwork::new();
        let mut server = master(&network, ConnectionConfig::new());
        let mut first = client(&network, "same");
        let mut second = client(&network, "same");
        first.connect(master_address()).unwrap();
        second.connect(master_address()).unwrap();

        pump(&mut server, &mut [&mut first, &mut second]);

        assert_eq!(server.connected_count(), 1);
        assert!(second.master_peer().is_none());
    }

    #[test]
    fn test_oversize_and_disconnected_sends_are_dropped() {
        let network = MemoryNetwork::new().with_max_packet_size(8);
        let mut server = master(&network, ConnectionConfig::new());
        let mut c = client(&network, "a");
        c.connect(master_address()).unwrap();
        pump(&mut server, &mut [&mut c]);

        let mut big = ByteStack::new();
        big.push_bytes(&[0; 16]);
        server.broadcast(&Message::new("key", big, DeliveryClass::Unreliable));
        assert_eq!(server.get_stats().dropped_oversize, 1);

        let small = Message::new("key", ByteStack::from_slice(&[1, 2]), DeliveryClass::Unreliable);
        server.unicast("127.0.0.1:1".parse().unwrap(), &small);
        assert_eq!(server.get_stats().dropped_disconnected, 1);

        server.broadcast(&small);
        let received: Vec<ConnectionEvent> = c
            .poll_events()
            .into_iter()
            .filter(|e| matches!(e, ConnectionEvent::MessageReceived { .. }))
            .collect();
        assert_eq!(received.len(), 1);
    }

    #[test]
    fn test_clock_offset_updates_peer() {
        let network = MemoryNetwork::new();
        let mut server = master(&network, ConnectionConfig::new());
        let mut c = client(&network, "a");
        c.connect(master_address()).unwrap();
        pump(&mut server, &mut [&mut c]);

        network.set_clock_skew(master_address(), 1_000);
        c.poll_events();

        assert_eq!(c.clock_offset(&master_address()), Some(1_000));
    }

    #[test]
    fn test_stop_is_safe_when_idle() {
        let network = MemoryNetwork::new();
        let mut idle = client(&network, "a");
        idle.stop();

        let mut server = master(&network, ConnectionConfig::new());
        let mut c = client(&network, "b");
        c.connect(master_address()).unwrap();
        pump(&mut server, &mut [&mut c]);

        server.stop();
        server.stop();
        let events = c.poll_events();
        assert!(events.iter().any(|e| matches!(e, ConnectionEvent::PeerDisconnected(_))));
        assert!(c.master_peer().is_none());
    }
}
