pub mod byte_stack;
pub mod compression;
pub mod clock;
pub mod error;
pub mod id_manager;
pub mod protocol;
pub mod transport;
pub mod peer;
pub mod connection;
pub mod ids_register;
pub mod messages;
pub mod serialization;
pub mod rate_limit;
pub mod replication;
pub mod cluster;
pub mod dispatch;
pub mod semaphore;
pub mod node;
pub mod debug;

pub use byte_stack::{
    ByteStack, StackEnum,
};

pub use compression::{
    CompressedStack, PositionBounds,
    required_bytes, compress_value, decompress_value,
};

pub use clock::{
    Clock, ManualClock, SystemClock, Timestamp, TimeManager,
};

pub use error::{
    ClusterError, Result,
};

pub use protocol::{
    ClusterCommand, DeliveryClass, Message, ObjectId, PayloadType,
    IDS_REGISTER_KEY, SIMULATION_MANAGER_KEY, PROTOCOL_VERSION,
};

pub use transport::{
    Transport, TransportEvent, ConnectRequest,
    MemoryNetwork, MemoryTransport,
};

pub use connection::{
    ConnectionConfig, ConnectionEvent, ConnectionManager, Role,
};

pub use ids_register::{
    IdsRegister, BindingChange,
};

pub use messages::{
    MessagesManager, MessagesEvent, Outbox, Outgoing, Destination,
};

pub use serialization::{
    BinarySerializer, BinaryFormat,
};

pub use rate_limit::{
    RateLimiter, RateLimitConfig,
};

pub use replication::{
    ObjectsRoot, ReplicatedObject, ReplicationConfig,
    DistributedTransform, MockedTransform, TransformState,
    DistributedRigidbody, MockedRigidbody, RigidbodyState, SimulationMode,
    DistributedAnimation, MockedAnimation, AnimatorParameters, AnimationCommand, ParameterValue,
    DistributedControl, MockedControl, ControlAction, ControlPolicy,
    ExtrapolationBuffer, MotionSnapshot, Pose,
};

pub use cluster::{
    ClusterConfig, ClusterEvent, ClientLifecycle, ClientState,
    MasterLifecycle, MasterState, Heartbeat,
};

pub use dispatch::Dispatcher;

pub use semaphore::{
    GatingSemaphore, SemaphoreEvent,
};

pub use node::ClusterNode;

pub use debug::{
    init_debug_mode, is_debug_enabled, is_trace_enabled,
    log_message, message_summary, format_bytes,
};
