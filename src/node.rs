use crate::clock::Timestamp;
use crate::cluster::{ClientLifecycle, ClientState, ClusterConfig, ClusterEvent, MasterLifecycle, MasterState};
use crate::connection::{ConnectionManager, Role};
use crate::debug::init_debug_mode;
use crate::dispatch::Dispatcher;
use crate::error::{ClusterError, Result};
use crate::messages::{MessagesEvent, MessagesManager, Outbox};
use crate::protocol::{Message, SIMULATION_MANAGER_KEY};
use crate::replication::{ObjectsRoot, ReplicatedObject};
use crate::semaphore::GatingSemaphore;
use crate::transport::Transport;
use log::{debug, info, warn};
use std::net::SocketAddr;

enum Lifecycle {
    Master(MasterLifecycle),
    Client(ClientLifecycle),
}

/// One process of the cluster: connection, id bindings, run lifecycle and
/// the replicated objects, driven by [`ClusterNode::tick`].
pub struct ClusterNode<T: Transport> {
    config: ClusterConfig,
    messages: MessagesManager<T>,
    objects: ObjectsRoot,
    lifecycle: Lifecycle,
    semaphore: GatingSemaphore,
    dispatcher: Dispatcher<ClusterNode<T>>,
    outbox: Outbox,
    holds_setup_lock: bool,
}

impl<T: Transport> ClusterNode<T> {
    pub fn new(transport: T, config: ClusterConfig) -> Result<Self> {
        config.validate()?;
        init_debug_mode();

        let connection = ConnectionManager::new(transport, config.role, config.connection_config());
        let lifecycle = match config.role {
            Role::Master => Lifecycle::Master(MasterLifecycle::new(&config)),
            Role::Client => Lifecycle::Client(ClientLifecycle::new(&config)),
        };

        Ok(Self {
            config,
            messages: MessagesManager::new(connection),
            objects: ObjectsRoot::new(),
            lifecycle,
            semaphore: GatingSemaphore::new(),
            dispatcher: Dispatcher::new(),
            outbox: Outbox::new(),
            holds_setup_lock: false,
        })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn is_master(&self) -> bool {
        self.config.role == Role::Master
    }

    pub fn messages(&self) -> &MessagesManager<T> {
        &self.messages
    }

    pub fn objects(&self) -> &ObjectsRoot {
        &self.objects
    }

    pub fn objects_mut(&mut self) -> &mut ObjectsRoot {
        &mut self.objects
    }

    pub fn semaphore(&self) -> &GatingSemaphore {
        &self.semaphore
    }

    pub fn semaphore_mut(&mut self) -> &mut GatingSemaphore {
        &mut self.semaphore
    }

    /// Handle for queuing work onto this node from other threads.
    pub fn dispatcher(&self) -> Dispatcher<ClusterNode<T>> {
        self.dispatcher.clone()
    }

    pub fn master_state(&self) -> Option<MasterState> {
        match &self.lifecycle {
            Lifecycle::Master(master) => Some(master.state()),
            Lifecycle::Client(_) => None,
        }
    }

    pub fn client_state(&self) -> Option<ClientState> {
        match &self.lifecycle {
            Lifecycle::Client(client) => Some(client.state()),
            Lifecycle::Master(_) => None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.master_state() == Some(MasterState::Running) || self.client_state() == Some(ClientState::Running)
    }

    /// Master: listens on the configured port. Client: connects to the master.
    pub fn start(&mut self, now: Timestamp) -> Result<()> {
        match &mut self.lifecycle {
            Lifecycle::Master(master) => {
                if !self.messages.connection_mut().start(self.config.port) {
                    return Err(ClusterError::Transport(format!(
                        "cannot listen on port {}",
                        self.config.port
                    )));
                }
                self.messages.register_key(SIMULATION_MANAGER_KEY, now);
                master.start(now);
            }
            Lifecycle::Client(client) => {
                let master = self
                    .config
                    .master_address
                    .ok_or_else(|| ClusterError::InvalidConfig("missing master address".to_string()))?;
                self.messages.connection_mut().connect(master)?;
                client.start(now);
            }
        }

        if !self.holds_setup_lock {
            self.semaphore.lock();
            self.holds_setup_lock = true;
        }
        Ok(())
    }

    /// Binds the object's key and adds it to the local registry. Masters only
    /// announce bindings; clients wait for them.
    pub fn register_object(&mut self, object: impl Into<ReplicatedObject>, now: Timestamp) {
        let object = object.into();
        if self.is_master() {
            self.messages.register_key(object.key(), now);
        }
        if let Some(previous) = self.objects.register(object) {
            warn!("Replaced replicated object '{}'", previous.key());
        }
    }

    pub fn unregister_object(&mut self, key: &str, now: Timestamp) -> Option<ReplicatedObject> {
        if self.is_master() {
            self.messages.unregister_key(key, now);
        }
        self.objects.unregister(key)
    }

    /// Client only: reports the scene loaded after a `LoadRequested` event.
    pub fn mark_ready(&mut self) -> Result<bool> {
        match &mut self.lifecycle {
            Lifecycle::Client(client) => client.mark_ready(&mut self.outbox),
            Lifecycle::Master(_) => Ok(false),
        }
    }

    pub fn tick(&mut self, now: Timestamp) -> Result<Vec<ClusterEvent>> {
        let dispatcher = self.dispatcher.clone();
        let dispatched = dispatcher.drain(self);
        if dispatched > 0 {
            debug!("Ran {} dispatched task(s)", dispatched);
        }

        let mut events = Vec::new();
        for event in self.messages.poll(now) {
            if let Err(e) = self.handle_event(event, &mut events) {
                warn!("Failed to handle cluster event: {}", e);
            }
        }

        let result = match &mut self.lifecycle {
            Lifecycle::Master(master) => master.update(now, &mut self.outbox, &mut events),
            Lifecycle::Client(client) => client.update(now, &mut events),
        };

        if events
            .iter()
            .any(|e| matches!(e, ClusterEvent::Running | ClusterEvent::Stopped))
        {
            self.release_setup_lock();
        }

        self.objects.tick(now, &mut self.outbox, self.semaphore.is_locked());
        self.messages.send_all(&mut self.outbox, now);

        result.map(|_| events)
    }

    fn handle_event(&mut self, event: MessagesEvent, events: &mut Vec<ClusterEvent>) -> Result<()> {
        match event {
            MessagesEvent::PeerConnected(address) => {
                events.push(ClusterEvent::PeerConnected(address));
                match &mut self.lifecycle {
                    Lifecycle::Master(master) => {
                        master.on_peer_connected(address);
                        self.objects.unicast_initial(address, &mut self.outbox);
                    }
                    Lifecycle::Client(client) => client.on_peer_connected(address, &mut self.outbox)?,
                }
            }
            MessagesEvent::PeerDisconnected(address) => {
                events.push(ClusterEvent::PeerDisconnected(address));
                match &mut self.lifecycle {
                    Lifecycle::Master(master) => master.on_peer_disconnected(address, &mut self.outbox)?,
                    Lifecycle::Client(client) => client.on_peer_disconnected(address, events),
                }
            }
            MessagesEvent::Received { from, message } => self.route(from, message, events)?,
        }
        Ok(())
    }

    fn route(&mut self, from: SocketAddr, mut message: Message, events: &mut Vec<ClusterEvent>) -> Result<()> {
        if message.key != SIMULATION_MANAGER_KEY {
            self.objects.receive(message);
            return Ok(());
        }

        match &mut self.lifecycle {
            Lifecycle::Master(master) => master.receive(from, &mut message, events),
            Lifecycle::Client(client) => client.receive(from, &mut message, &mut self.outbox, events),
        }
    }

    fn release_setup_lock(&mut self) {
        if self.holds_setup_lock {
            self.semaphore.unlock();
            self.holds_setup_lock = false;
        }
    }

    /// Tells peers the run is over and shuts the connection down.
    pub fn stop(&mut self, now: Timestamp) -> Result<()> {
        match &mut self.lifecycle {
            Lifecycle::Master(master) => master.stop(&mut self.outbox)?,
            Lifecycle::Client(client) => client.stop(),
        }
        self.messages.send_all(&mut self.outbox, now);
        self.messages.stop();
        self.release_setup_lock();
        info!("Cluster node stopped");
        Ok(())
    }
}
