use crate::error::{ClusterError, Result};
use crate::protocol::DeliveryClass;
use ahash::{AHashMap, AHashSet};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

pub const DEFAULT_MAX_PACKET_SIZE: usize = 1200;

/// Credentials a connecting peer presents to the listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub application_key: String,
    pub identifier: String,
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    ConnectionRequest { from: SocketAddr, request: ConnectRequest },
    Connected { peer: SocketAddr },
    Disconnected { peer: SocketAddr },
    Received { from: SocketAddr, data: Bytes, delivery: DeliveryClass },
    /// New estimate of (peer clock - local clock) in ticks.
    ClockOffset { peer: SocketAddr, offset_ticks: i64 },
}

/// Datagram transport the connection layer is built on.
///
/// Implementations queue their events internally; nothing is delivered until
/// [`Transport::poll`] is called from the owning thread.
pub trait Transport {
    fn start(&mut self, port: u16) -> Result<SocketAddr>;
    fn connect(&mut self, address: SocketAddr, request: ConnectRequest) -> Result<()>;
    fn accept(&mut self, peer: SocketAddr) -> Result<()>;
    fn reject(&mut self, peer: SocketAddr) -> Result<()>;
    fn send(&mut self, peer: SocketAddr, data: Bytes, delivery: DeliveryClass) -> Result<()>;
    fn disconnect(&mut self, peer: SocketAddr) -> Result<()>;
    fn stop(&mut self);
    fn poll(&mut self) -> Vec<TransportEvent>;
    fn max_packet_size(&self) -> usize;
    fn local_address(&self) -> Option<SocketAddr>;
}

#[derive(Default)]
struct Endpoint {
    inbox: VecDeque<TransportEvent>,
    links: AHashSet<SocketAddr>,
    clock_skew: i64,
}

struct NetworkState {
    endpoints: AHashMap<SocketAddr, Endpoint>,
    pending: AHashMap<(SocketAddr, SocketAddr), ConnectRequest>,
    next_ephemeral_port: u16,
    max_packet_size: usize,
    sent_datagrams: u64,
}

impl NetworkState {
    fn push(&mut self, to: SocketAddr, event: TransportEvent) {
        if let Some(endpoint) = self.endpoints.get_mut(&to) {
            endpoint.inbox.push_back(event);
        }
    }

    fn skew(&self, address: SocketAddr) -> i64 {
        self.endpoints.get(&address).map(|e| e.clock_skew).unwrap_or(0)
    }

    fn unlink(&mut self, a: SocketAddr, b: SocketAddr) {
        let mut was_linked = false;
        if let Some(endpoint) = self.endpoints.get_mut(&a) {
            was_linked |= endpoint.links.remove(&b);
        }
        if let Some(endpoint) = self.endpoints.get_mut(&b) {
            was_linked |= endpoint.links.remove(&a);
        }
        if was_linked {
            self.push(a, TransportEvent::Disconnected { peer: b });
            self.push(b, TransportEvent::Disconnected { peer: a });
        }
    }
}

/// In-process hub connecting [`MemoryTransport`]s by socket address.
///
/// Delivery is lossless and FIFO per link for every delivery class.
#[derive(Clone)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(NetworkState {
                endpoints: AHashMap::new(),
                pending: AHashMap::new(),
                next_ephemeral_port: 49152,
                max_packet_size: DEFAULT_MAX_PACKET_SIZE,
                sent_datagrams: 0,
            })),
        }
    }

    pub fn with_max_packet_size(self, size: usize) -> Self {
        self.state.lock().max_packet_size = size;
        self
    }

    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
            address: None,
        }
    }

    /// Shifts the clock of `address` and reports the new offsets to its peers.
    pub fn set_clock_skew(&self, address: SocketAddr, skew_ticks: i64) {
        let mut state = self.state.lock();
        let links: Vec<SocketAddr> = match state.endpoints.get_mut(&address) {
            Some(endpoint) => {
                endpoint.clock_skew = skew_ticks;
                endpoint.links.iter().copied().collect()
            }
            None => return,
        };

        for peer in links {
            let offset = skew_ticks - state.skew(peer);
            state.push(peer, TransportEvent::ClockOffset { peer: address, offset_ticks: offset });
            state.push(address, TransportEvent::ClockOffset { peer, offset_ticks: -offset });
        }
    }

    /// Drops every link of `address` as if its process vanished.
    pub fn sever(&self, address: SocketAddr) {
        let mut state = self.state.lock();
        let links: Vec<SocketAddr> = state
            .endpoints
            .get(&address)
            .map(|e| e.links.iter().copied().collect())
            .unwrap_or_default();
        for peer in links {
            state.unlink(address, peer);
        }
    }

    pub fn sent_datagrams(&self) -> u64 {
        self.state.lock().sent_datagrams
    }
}

pub struct MemoryTransport {
    network: MemoryNetwork,
    address: Option<SocketAddr>,
}

fn loopback(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

impl MemoryTransport {
    fn bind(&mut self, address: SocketAddr) -> Result<SocketAddr> {
        let mut state = self.network.state.lock();
        if state.endpoints.contains_key(&address) {
            return Err(ClusterError::AddressInUse(address));
        }
        state.endpoints.insert(address, Endpoint::default());
        self.address = Some(address);
        Ok(address)
    }

    fn bound_address(&mut self) -> Result<SocketAddr> {
        if let Some(address) = self.address {
            return Ok(address);
        }

        let port = {
            let mut state = self.network.state.lock();
            loop {
                let port = state.next_ephemeral_port;
                state.next_ephemeral_port = state.next_ephemeral_port.checked_add(1).unwrap_or(49152);
                if !state.endpoints.contains_key(&loopback(port)) {
                    break port;
                }
            }
        };
        self.bind(loopback(port))
    }

    fn require_address(&self) -> Result<SocketAddr> {
        self.address
            .ok_or_else(|| ClusterError::Transport("transport is not started".to_string()))
    }
}

impl Transport for MemoryTransport {
    fn start(&mut self, port: u16) -> Result<SocketAddr> {
        if let Some(address) = self.address {
            return Err(ClusterError::AddressInUse(address));
        }
        self.bind(loopback(port))
    }

    fn connect(&mut self, address: SocketAddr, request: ConnectRequest) -> Result<()> {
        let local = self.bound_address()?;
        let mut state = self.network.state.lock();
        if !state.endpoints.contains_key(&address) {
            // Nobody listening: the attempt times out as a disconnect
            state.push(local, TransportEvent::Disconnected { peer: address });
            return Ok(());
        }

        state.pending.insert((local, address), request.clone());
        state.push(address, TransportEvent::ConnectionRequest { from: local, request });
        Ok(())
    }

    fn accept(&mut self, peer: SocketAddr) -> Result<()> {
        let local = self.require_address()?;
        let mut state = self.network.state.lock();
        if state.pending.remove(&(peer, local)).is_none() {
            return Err(ClusterError::Transport(format!("no pending request from {}", peer)));
        }

        if let Some(endpoint) = state.endpoints.get_mut(&local) {
            endpoint.links.insert(peer);
        }
        if let Some(endpoint) = state.endpoints.get_mut(&peer) {
            endpoint.links.insert(local);
        }

        let offset = state.skew(peer) - state.skew(local);
        state.push(local, TransportEvent::Connected { peer });
        state.push(local, TransportEvent::ClockOffset { peer, offset_ticks: offset });
        state.push(peer, TransportEvent::Connected { peer: local });
        state.push(peer, TransportEvent::ClockOffset { peer: local, offset_ticks: -offset });
        Ok(())
    }

    fn reject(&mut self, peer: SocketAddr) -> Result<()> {
        let local = self.require_address()?;
        let mut state = self.network.state.lock();
        state.pending.remove(&(peer, local));
        state.push(peer, TransportEvent::Disconnected { peer: local });
        Ok(())
    }

    fn send(&mut self, peer: SocketAddr, data: Bytes, delivery: DeliveryClass) -> Result<()> {
        let local = self.require_address()?;
        let mut state = self.network.state.lock();
        if data.len() > state.max_packet_size {
            return Err(ClusterError::PacketTooLarge {
                size: data.len(),
                max: state.max_packet_size,
            });
        }

        let linked = state
            .endpoints
            .get(&local)
            .map(|e| e.links.contains(&peer))
            .unwrap_or(false);
        if !linked {
            return Err(ClusterError::NotConnected(peer));
        }

        state.sent_datagrams += 1;
        state.push(peer, TransportEvent::Received { from: local, data, delivery });
        Ok(())
    }

    fn disconnect(&mut self, peer: SocketAddr) -> Result<()> {
        let local = self.require_address()?;
        let mut state = self.network.state.lock();
        state.pending.remove(&(local, peer));
        state.unlink(local, peer);
        Ok(())
    }

    fn stop(&mut self) {
        let local = match self.address.take() {
            Some(address) => address,
            None => return,
        };

        let mut state = self.network.state.lock();
        let links: Vec<SocketAddr> = state
            .endpoints
            .get(&local)
            .map(|e| e.links.iter().copied().collect())
            .unwrap_or_default();
        for peer in links {
            state.unlink(local, peer);
        }
        state.pending.retain(|(from, to), _| *from != local && *to != local);
        state.endpoints.remove(&local);
    }

    fn poll(&mut self) -> Vec<TransportEvent> {
        let local = match self.address {
            Some(address) => address,
            None => return Vec::new(),
        };

        let mut state = self.network.state.lock();
        match state.endpoints.get_mut(&local) {
            Some(endpoint) => endpoint.inbox.drain(..).collect(),
            None => Vec::new(),
        }
    }

    fn max_packet_size(&self) -> usize {
        self.network.state.lock().max_packet_size
    }

    fn local_address(&self) -> Option<SocketAddr> {
        self.address
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(identifier: &str) -> ConnectRequest {
        ConnectRequest {
            application_key: "test".to_string(),
            identifier: identifier.to_string(),
        }
    }

    #[test]
    fn test_start_rejects_used_port() {
        let network = MemoryNetwork::new();
        let mut a = network.transport();
        let mut b = network.transport();

        assert_eq!(a.start(9000).unwrap(), loopback(9000));
        assert!(matches!(b.start(9000), Err(ClusterError::AddressInUse(_))));
    }

    #[test]
    fn test_handshake_and_fifo_delivery() {
        let network = MemoryNetwork::new();
        let mut server = network.transport();
        let mut client = network.transport();
        let server_address = server.start(9000).unwrap();

        client.connect(server_address, request("client-1")).unwrap();
        let events = server.poll();
        let from = match &events[..] {
            [TransportEvent::ConnectionRequest { from, request }] => {
                assert_eq!(request.identifier, "client-1");
                *from
            }
            other => panic!("unexpected events: {:?}", other),
        };
        server.accept(from).unwrap();

        assert!(client
            .poll()
            .iter()
            .any(|e| matches!(e, TransportEvent::Connected { peer } if *peer == server_address)));

        for i in 0..3u8 {
            server.send(from, Bytes::from(vec![i]), DeliveryClass::Unreliable).unwrap();
        }
        let payloads: Vec<u8> = client
            .poll()
            .into_iter()
            .filter_map(|e| match e {
                TransportEvent::Received { data, .. } => Some(data[0]),
                _ => None,
            })
            .collect();
        assert_eq!(payloads, vec![0, 1, 2]);
    }

    #[test]
    fn test_send_limits() {
        let network = MemoryNetwork::new().with_max_packet_size(4);
        let mut server = network.transport();
        let address = server.start(9000).unwrap();

        let result = server.send(address, Bytes::from(vec![0; 5]), DeliveryClass::Unreliable);
        assert!(matches!(result, Err(ClusterError::PacketTooLarge { size: 5, max: 4 })));

        let result = server.send(loopback(1), Bytes::from(vec![0]), DeliveryClass::Unreliable);
        assert!(matches!(result, Err(ClusterError::NotConnected(_))));
    }

    #[test]
    fn test_clock_skew_reported_to_peers() {
        let network = MemoryNetwork::new();
        let mut server = network.transport();
        let mut client = network.transport();
        let server_address = server.start(9000).unwrap();

        client.connect(server_address, request("c")).unwrap();
        let from = match server.poll().pop() {
            Some(TransportEvent::ConnectionRequest { from, .. }) => from,
            other => panic!("unexpected event: {:?}", other),
        };
        server.accept(from).unwrap();
        server.poll();
        client.poll();

        network.set_clock_skew(from, 500);

        assert!(server.poll().iter().any(|e| matches!(
            e,
            TransportEvent::ClockOffset { offset_ticks: 500, .. }
        )));
        assert!(client.poll().iter().any(|e| matches!(
            e,
            TransportEvent::ClockOffset { offset_ticks: -500, .. }
        )));
    }

    #[test]
    fn test_stop_disconnects_peers() {
        let network = MemoryNetwork::new();
        let mut server = network.transport();
        let mut client = network.transport();
        let server_address = server.start(9000).unwrap();

        client.connect(server_address, request("c")).unwrap();
        if let Some(TransportEvent::ConnectionRequest { from, .. }) = server.poll().pop() {
            server.accept(from).unwrap();
        }
        client.poll();

        server.stop();
        server.stop();

        assert!(client
            .poll()
            .iter()
            .any(|e| matches!(e, TransportEvent::Disconnected { .. })));
        assert!(server.local_address().is_none());
    }
}
