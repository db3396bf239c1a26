use crate::byte_stack::ByteStack;
use crate::clock::Timestamp;
use crate::connection::{ConnectionConfig, Role};
use crate::error::{ClusterError, Result};
use crate::messages::Outbox;
use crate::protocol::{ClusterCommand, Message, DEFAULT_APPLICATION_KEY, PROTOCOL_VERSION, SIMULATION_MANAGER_KEY};
use crate::replication::ReplicationConfig;
use crate::serialization::{BinaryFormat, BinarySerializer};
use ahash::{AHashMap, AHashSet};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 9133;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(1);

/// Run parameters of one process, read once before the cluster starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub role: Role,
    pub port: u16,
    pub master_address: Option<SocketAddr>,
    pub identifier: String,
    pub application_key: String,
    /// Identifiers of the clients the master waits for.
    pub clients: Vec<String>,
    pub connect_timeout: Duration,
    pub ping_interval: Duration,
    pub binary_format: BinaryFormat,
    pub replication: ReplicationConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            role: Role::Master,
            port: DEFAULT_PORT,
            master_address: None,
            identifier: String::new(),
            application_key: DEFAULT_APPLICATION_KEY.to_string(),
            clients: Vec::new(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            ping_interval: DEFAULT_PING_INTERVAL,
            binary_format: BinaryFormat::default(),
            replication: ReplicationConfig::default(),
        }
    }
}

impl ClusterConfig {
    pub fn master(port: u16) -> Self {
        Self {
            role: Role::Master,
            port,
            identifier: "master".to_string(),
            ..Self::default()
        }
    }

    pub fn client(master_address: SocketAddr, identifier: impl Into<String>) -> Self {
        Self {
            role: Role::Client,
            master_address: Some(master_address),
            identifier: identifier.into(),
            ..Self::default()
        }
    }

    pub fn with_clients(mut self, clients: Vec<String>) -> Self {
        self.clients = clients;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_application_key(mut self, key: impl Into<String>) -> Self {
        self.application_key = key.into();
        self
    }

    pub fn with_binary_format(mut self, format: BinaryFormat) -> Self {
        self.binary_format = format;
        self
    }

    pub fn with_replication(mut self, replication: ReplicationConfig) -> Self {
        self.replication = replication;
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: ClusterConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.role == Role::Client {
            if self.master_address.is_none() {
                return Err(ClusterError::InvalidConfig(
                    "a client needs the master address".to_string(),
                ));
            }
            if self.identifier.is_empty() {
                return Err(ClusterError::InvalidConfig(
                    "a client needs an identifier".to_string(),
                ));
            }
        }

        let unique: AHashSet<&String> = self.clients.iter().collect();
        if unique.len() != self.clients.len() {
            return Err(ClusterError::InvalidConfig(
                "client identifiers must be unique".to_string(),
            ));
        }
        if self.connect_timeout.is_zero() || self.ping_interval.is_zero() {
            return Err(ClusterError::InvalidConfig(
                "timeouts and intervals must be positive".to_string(),
            ));
        }
        self.replication.validate()
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig::new()
            .with_application_key(self.application_key.clone())
            .with_identifier(self.identifier.clone())
            .with_acceptable_identifiers(self.clients.clone())
            .with_timeout(self.connect_timeout)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    PeerConnected(SocketAddr),
    PeerDisconnected(SocketAddr),
    ClientIdentified { address: SocketAddr, identifier: String },
    ClientReady(SocketAddr),
    /// The master asked this client to load the scene; answer with `mark_ready`.
    LoadRequested,
    Running,
    Stopped,
    HeartbeatMissed { ping_id: u32, missing: usize },
}

pub(crate) fn command_message(serializer: &BinarySerializer, command: &ClusterCommand) -> Result<Message> {
    let data = serializer.serialize_command(command)?;
    let mut content = ByteStack::with_capacity(data.len() + 4);
    content.push_bytes_with_length(&data);
    Ok(Message::new(SIMULATION_MANAGER_KEY, content, command.delivery()))
}

pub(crate) fn parse_command(serializer: &BinarySerializer, message: &mut Message) -> Result<ClusterCommand> {
    let data = message.content.pop_bytes_with_length()?;
    serializer.deserialize_command(&data)
}

/// Ping rounds run by the master. Missing pongs are only reported.
#[derive(Debug)]
pub struct Heartbeat {
    interval: Duration,
    ping_id: u32,
    round_started: Option<Timestamp>,
    expected: usize,
    pongs: AHashSet<SocketAddr>,
    missed_rounds: u64,
}

impl Heartbeat {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            ping_id: 0,
            round_started: None,
            expected: 0,
            pongs: AHashSet::new(),
            missed_rounds: 0,
        }
    }

    pub fn ping_id(&self) -> u32 {
        self.ping_id
    }

    pub fn missed_rounds(&self) -> u64 {
        self.missed_rounds
    }

    pub fn record_pong(&mut self, from: SocketAddr, id: u32) {
        if id == self.ping_id {
            self.pongs.insert(from);
        } else {
            debug!("Late pong {} from {} (current round {})", id, from, self.ping_id);
        }
    }

    /// Closes the running round once the interval elapsed and starts a new
    /// one. Returns the closed round's id and missing pong count if any.
    pub fn update(
        &mut self,
        now: Timestamp,
        connected: usize,
        serializer: &BinarySerializer,
        outbox: &mut Outbox,
    ) -> Result<Option<(u32, usize)>> {
        let mut missed = None;
        if let Some(started) = self.round_started {
            if now < started + self.interval {
                return Ok(None);
            }
            let missing = self.expected.saturating_sub(self.pongs.len());
            if missing > 0 {
                warn!("{} peer(s) did not answer ping {}", missing, self.ping_id);
                self.missed_rounds += 1;
                missed = Some((self.ping_id, missing));
            }
        }

        self.ping_id = self.ping_id.wrapping_add(1);
        self.pongs.clear();
        self.expected = connected;
        self.round_started = Some(now);
        if connected > 0 {
            outbox.broadcast(command_message(serializer, &ClusterCommand::Ping { id: self.ping_id })?);
        }
        Ok(missed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MasterState {
    Initial,
    Loading,
    Starting,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Default)]
struct ClientRecord {
    identifier: Option<String>,
    ready: bool,
}

/// Master side run-state machine: wait for every client, have them load,
/// start the run and watch it with heartbeats.
pub struct MasterLifecycle {
    state: MasterState,
    expected: Vec<String>,
    clients: AHashMap<SocketAddr, ClientRecord>,
    connect_timeout: Duration,
    deadline: Option<Timestamp>,
    heartbeat: Heartbeat,
    serializer: BinarySerializer,
}

impl MasterLifecycle {
    pub fn new(config: &ClusterConfig) -> Self {
        Self {
            state: MasterState::Initial,
            expected: config.clients.clone(),
            clients: AHashMap::new(),
            connect_timeout: config.connect_timeout,
            deadline: None,
            heartbeat: Heartbeat::new(config.ping_interval),
            serializer: BinarySerializer::new(config.binary_format),
        }
    }

    pub fn state(&self) -> MasterState {
        self.state
    }

    pub fn heartbeat(&self) -> &Heartbeat {
        &self.heartbeat
    }

    fn set_state(&mut self, state: MasterState) {
        info!("Master state {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    pub fn start(&mut self, now: Timestamp) {
        if self.state != MasterState::Initial {
            return;
        }
        self.deadline = Some(now + self.connect_timeout);
        self.set_state(MasterState::Loading);
    }

    fn is_identified(&self, identifier: &str) -> bool {
        self.clients
            .values()
            .any(|c| c.identifier.as_deref() == Some(identifier))
    }

    fn is_ready(&self, identifier: &str) -> bool {
        self.clients
            .values()
            .any(|c| c.ready && c.identifier.as_deref() == Some(identifier))
    }

    pub fn connected_clients(&self) -> usize {
        self.expected.iter().filter(|id| self.is_identified(id)).count()
    }

    pub fn on_peer_connected(&mut self, address: SocketAddr) {
        self.clients.entry(address).or_default();
    }

    pub fn on_peer_disconnected(&mut self, address: SocketAddr, outbox: &mut Outbox) -> Result<()> {
        let record = match self.clients.remove(&address) {
            Some(record) => record,
            None => return Ok(()),
        };

        if matches!(self.state, MasterState::Starting | MasterState::Running) {
            warn!(
                "Client {} ({}) lost, stopping the run",
                address,
                record.identifier.as_deref().unwrap_or("unidentified")
            );
            self.stop(outbox)?;
        }
        Ok(())
    }

    pub fn receive(
        &mut self,
        from: SocketAddr,
        message: &mut Message,
        events: &mut Vec<ClusterEvent>,
    ) -> Result<()> {
        let command = parse_command(&self.serializer, message)?;
        match command {
            ClusterCommand::Info { version, identifier } => {
                if version != PROTOCOL_VERSION {
                    warn!(
                        "Client {} runs version {}, master runs {}",
                        identifier, version, PROTOCOL_VERSION
                    );
                }
                let record = self.clients.entry(from).or_default();
                record.identifier = Some(identifier.clone());
                info!("Client '{}' identified at {}", identifier, from);
                events.push(ClusterEvent::ClientIdentified {
                    address: from,
                    identifier,
                });
            }
            ClusterCommand::Ready => {
                if let Some(record) = self.clients.get_mut(&from) {
                    record.ready = true;
                    events.push(ClusterEvent::ClientReady(from));
                }
            }
            ClusterCommand::Pong { id } => self.heartbeat.record_pong(from, id),
            other => warn!("Master ignores {:?} from {}", other, from),
        }
        Ok(())
    }

    pub fn update(&mut self, now: Timestamp, outbox: &mut Outbox, events: &mut Vec<ClusterEvent>) -> Result<()> {
        match self.state {
            MasterState::Loading => {
                if self.expected.iter().all(|id| self.is_identified(id)) {
                    outbox.broadcast(command_message(&self.serializer, &ClusterCommand::Load)?);
                    self.deadline = Some(now + self.connect_timeout);
                    self.set_state(MasterState::Starting);
                } else if self.deadline.map_or(false, |deadline| now >= deadline) {
                    warn!(
                        "Timed out waiting for clients ({} of {} connected), still waiting",
                        self.connected_clients(),
                        self.expected.len()
                    );
                    self.deadline = Some(now + self.connect_timeout);
                }
            }
            MasterState::Starting => {
                if self.expected.iter().all(|id| self.is_ready(id)) {
                    outbox.broadcast(command_message(&self.serializer, &ClusterCommand::Run)?);
                    self.set_state(MasterState::Running);
                    events.push(ClusterEvent::Running);
                } else if self.deadline.map_or(false, |deadline| now >= deadline) {
                    self.stop(outbox)?;
                    return Err(ClusterError::ConnectTimeout("clients to load the simulation".to_string()));
                }
            }
            MasterState::Stopping => {
                self.set_state(MasterState::Stopped);
                events.push(ClusterEvent::Stopped);
                return Ok(());
            }
            MasterState::Running | MasterState::Initial | MasterState::Stopped => {}
        }

        if matches!(
            self.state,
            MasterState::Loading | MasterState::Starting | MasterState::Running
        ) {
            let connected = self.clients.len();
            if let Some((ping_id, missing)) = self.heartbeat.update(now, connected, &self.serializer, outbox)? {
                events.push(ClusterEvent::HeartbeatMissed { ping_id, missing });
            }
        }
        Ok(())
    }

    /// Tells every client to stop. The state settles to `Stopped` on the
    /// next update.
    pub fn stop(&mut self, outbox: &mut Outbox) -> Result<()> {
        if matches!(
            self.state,
            MasterState::Initial | MasterState::Stopping | MasterState::Stopped
        ) {
            return Ok(());
        }
        outbox.broadcast(command_message(&self.serializer, &ClusterCommand::Stop)?);
        self.set_state(MasterState::Stopping);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ClientState {
    Initial,
    Connecting,
    Connected,
    Loading,
    Ready,
    Running,
    Stopped,
}

pub struct ClientLifecycle {
    state: ClientState,
    identifier: String,
    master_address: Option<SocketAddr>,
    connect_timeout: Duration,
    deadline: Option<Timestamp>,
    serializer: BinarySerializer,
}

impl ClientLifecycle {
    pub fn new(config: &ClusterConfig) -> Self {
        Self {
            state: ClientState::Initial,
            identifier: config.identifier.clone(),
            master_address: config.master_address,
            connect_timeout: config.connect_timeout,
            deadline: None,
            serializer: BinarySerializer::new(config.binary_format),
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    fn set_state(&mut self, state: ClientState) {
        info!("Client state {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    pub fn start(&mut self, now: Timestamp) {
        if self.state != ClientState::Initial {
            return;
        }
        self.deadline = Some(now + self.connect_timeout);
        self.set_state(ClientState::Connecting);
    }

    fn is_master(&self, address: SocketAddr) -> bool {
        self.master_address == Some(address)
    }

    pub fn on_peer_connected(&mut self, address: SocketAddr, outbox: &mut Outbox) -> Result<()> {
        if !self.is_master(address) || self.state != ClientState::Connecting {
            return Ok(());
        }

        let info = ClusterCommand::Info {
            version: PROTOCOL_VERSION.to_string(),
            identifier: self.identifier.clone(),
        };
        outbox.unicast(address, command_message(&self.serializer, &info)?);
        self.set_state(ClientState::Connected);
        Ok(())
    }

    pub fn on_peer_disconnected(&mut self, address: SocketAddr, events: &mut Vec<ClusterEvent>) {
        if !self.is_master(address) || self.state == ClientState::Stopped {
            return;
        }
        if self.state == ClientState::Connecting {
            warn!("Could not connect to the master at {}", address);
        } else {
            warn!("Lost connection to the master at {}", address);
        }
        self.set_state(ClientState::Stopped);
        events.push(ClusterEvent::Stopped);
    }

    pub fn receive(
        &mut self,
        from: SocketAddr,
        message: &mut Message,
        outbox: &mut Outbox,
        events: &mut Vec<ClusterEvent>,
    ) -> Result<()> {
        let command = parse_command(&self.serializer, message)?;
        match command {
            ClusterCommand::Load if self.state == ClientState::Connected => {
                self.set_state(ClientState::Loading);
                events.push(ClusterEvent::LoadRequested);
            }
            ClusterCommand::Run if self.state == ClientState::Ready => {
                self.set_state(ClientState::Running);
                events.push(ClusterEvent::Running);
            }
            ClusterCommand::Stop => {
                if self.state != ClientState::Stopped {
                    self.set_state(ClientState::Stopped);
                    events.push(ClusterEvent::Stopped);
                }
            }
            ClusterCommand::Ping { id } => {
                outbox.unicast(from, command_message(&self.serializer, &ClusterCommand::Pong { id })?);
            }
            other => warn!("Client in state {:?} ignores {:?}", self.state, other),
        }
        Ok(())
    }

    /// Reports the scene loaded. Returns false outside the loading state.
    pub fn mark_ready(&mut self, outbox: &mut Outbox) -> Result<bool> {
        if self.state != ClientState::Loading {
            warn!("Cannot report ready in state {:?}", self.state);
            return Ok(false);
        }
        let master = match self.master_address {
            Some(address) => address,
            None => return Ok(false),
        };

        outbox.unicast(master, command_message(&self.serializer, &ClusterCommand::Ready)?);
        self.set_state(ClientState::Ready);
        Ok(true)
    }

    pub fn update(&mut self, now: Timestamp, events: &mut Vec<ClusterEvent>) -> Result<()> {
        if self.state == ClientState::Connecting && self.deadline.map_or(false, |deadline| now >= deadline) {
            self.set_state(ClientState::Stopped);
            events.push(ClusterEvent::Stopped);
            let master = self
                .master_address
                .map(|a| a.to_string())
                .unwrap_or_default();
            return Err(ClusterError::ConnectTimeout(format!("the master at {}", master)));
        }
        Ok(())
    }

    pub fn stop(&mut self) {
        if self.state != ClientState::Stopped {
            self.set_state(ClientState::Stopped);
        }
    }
}
