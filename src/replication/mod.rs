pub mod animation;
pub mod control;
pub mod extrapolation;
pub mod rigidbody;
pub mod transform;

use crate::clock::Timestamp;
use crate::compression::PositionBounds;
use crate::error::{ClusterError, Result};
use crate::messages::Outbox;
use crate::protocol::Message;
use crate::rate_limit::{RateLimitConfig, DEFAULT_SNAPSHOTS_PER_SECOND};
use ahash::AHashMap;
use log::{debug, error, warn};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

pub use animation::{AnimationCommand, AnimatorParameters, DistributedAnimation, MockedAnimation, ParameterValue};
pub use control::{ControlAction, ControlPolicy, DistributedControl, MockedControl};
pub use extrapolation::{ExtrapolationBuffer, MotionSnapshot, Pose};
pub use rigidbody::{DistributedRigidbody, MockedRigidbody, RigidbodyState, SimulationMode};
pub use transform::{DistributedTransform, MockedTransform, TransformState};

pub const DEFAULT_EXTRAPOLATION_LIMIT: f32 = 0.3;
pub const DEFAULT_SLEEP_THRESHOLD: f32 = 0.1;
pub const DEFAULT_VELOCITY_RANGE: f32 = 200.0;
pub const DEFAULT_ANGULAR_VELOCITY_RANGE: f32 = 10.0;
pub const DEFAULT_BYTES_FOR_VELOCITY: usize = 2;

/// Tuning shared by every replicated object of a node. Both ends of a link
/// must use the same bounds and ranges.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    pub snapshots_per_second: u32,
    /// Seconds past the newest snapshot after which a replica stops projecting.
    pub extrapolation_limit: f32,
    pub sleep_linear_threshold: f32,
    pub sleep_angular_threshold: f32,
    pub position_bounds: PositionBounds,
    pub velocity_range: f32,
    pub angular_velocity_range: f32,
    pub velocity_bytes: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            snapshots_per_second: DEFAULT_SNAPSHOTS_PER_SECOND,
            extrapolation_limit: DEFAULT_EXTRAPOLATION_LIMIT,
            sleep_linear_threshold: DEFAULT_SLEEP_THRESHOLD,
            sleep_angular_threshold: DEFAULT_SLEEP_THRESHOLD,
            position_bounds: PositionBounds::default(),
            velocity_range: DEFAULT_VELOCITY_RANGE,
            angular_velocity_range: DEFAULT_ANGULAR_VELOCITY_RANGE,
            velocity_bytes: DEFAULT_BYTES_FOR_VELOCITY,
        }
    }
}

impl ReplicationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshots_per_second(mut self, limit: u32) -> Self {
        self.snapshots_per_second = limit;
        self
    }

    pub fn with_extrapolation_limit(mut self, seconds: f32) -> Self {
        self.extrapolation_limit = seconds;
        self
    }

    pub fn with_sleep_thresholds(mut self, linear: f32, angular: f32) -> Self {
        self.sleep_linear_threshold = linear;
        self.sleep_angular_threshold = angular;
        self
    }

    pub fn with_position_bounds(mut self, bounds: PositionBounds) -> Self {
        self.position_bounds = bounds;
        self
    }

    pub fn rate_limit_config(&self) -> RateLimitConfig {
        RateLimitConfig::new().with_max_per_second(self.snapshots_per_second)
    }

    pub fn validate(&self) -> Result<()> {
        self.rate_limit_config().validate()?;
        self.position_bounds.validate()?;

        if self.extrapolation_limit.is_nan() || self.extrapolation_limit < 0.0 {
            return Err(ClusterError::InvalidConfig(format!(
                "extrapolation limit must not be negative, got {}",
                self.extrapolation_limit
            )));
        }
        if self.velocity_range <= 0.0 || self.angular_velocity_range <= 0.0 {
            return Err(ClusterError::InvalidConfig(
                "velocity ranges must be positive".to_string(),
            ));
        }
        if !(1..=4).contains(&self.velocity_bytes) {
            return Err(ClusterError::InvalidByteCount(self.velocity_bytes));
        }
        Ok(())
    }
}

/// Every replicated kind in either role.
///
/// `Distributed*` variants hold authoritative state and emit snapshots or
/// deltas; `Mocked*` variants are replicas driven by what they receive.
pub enum ReplicatedObject {
    DistributedTransform(DistributedTransform),
    MockedTransform(MockedTransform),
    DistributedRigidbody(DistributedRigidbody),
    MockedRigidbody(MockedRigidbody),
    DistributedAnimation(DistributedAnimation),
    MockedAnimation(MockedAnimation),
    DistributedControl(DistributedControl),
    MockedControl(MockedControl),
}

impl ReplicatedObject {
    pub fn key(&self) -> &str {
        match self {
            ReplicatedObject::DistributedTransform(o) => o.key(),
            ReplicatedObject::MockedTransform(o) => o.key(),
            ReplicatedObject::DistributedRigidbody(o) => o.key(),
            ReplicatedObject::MockedRigidbody(o) => o.key(),
            ReplicatedObject::DistributedAnimation(o) => o.key(),
            ReplicatedObject::MockedAnimation(o) => o.key(),
            ReplicatedObject::DistributedControl(o) => o.key(),
            ReplicatedObject::MockedControl(o) => o.key(),
        }
    }

    pub fn is_authoritative(&self) -> bool {
        matches!(
            self,
            ReplicatedObject::DistributedTransform(_)
                | ReplicatedObject::DistributedRigidbody(_)
                | ReplicatedObject::DistributedAnimation(_)
                | ReplicatedObject::DistributedControl(_)
        )
    }

    /// Kinds whose updates follow simulation time and stop while it is paused.
    pub fn is_time_sensitive(&self) -> bool {
        matches!(
            self,
            ReplicatedObject::DistributedTransform(_)
                | ReplicatedObject::MockedTransform(_)
                | ReplicatedObject::DistributedRigidbody(_)
                | ReplicatedObject::MockedRigidbody(_)
        )
    }

    pub fn tick(&mut self, now: Timestamp, outbox: &mut Outbox) -> Result<()> {
        match self {
            ReplicatedObject::DistributedTransform(o) => o.update(now, outbox),
            ReplicatedObject::DistributedRigidbody(o) => o.update(now, outbox),
            ReplicatedObject::MockedRigidbody(o) => {
                o.update(now);
                Ok(())
            }
            ReplicatedObject::DistributedAnimation(o) => {
                o.update(outbox);
                Ok(())
            }
            ReplicatedObject::DistributedControl(o) => {
                o.update(outbox);
                Ok(())
            }
            ReplicatedObject::MockedTransform(_)
            | ReplicatedObject::MockedAnimation(_)
            | ReplicatedObject::MockedControl(_) => Ok(()),
        }
    }

    /// Applies an incoming payload. Authoritative objects ignore them.
    pub fn receive(&mut self, message: &mut Message) -> Result<()> {
        match self {
            ReplicatedObject::MockedTransform(o) => o.receive(message),
            ReplicatedObject::MockedRigidbody(o) => o.receive(message),
            ReplicatedObject::MockedAnimation(o) => o.receive(message),
            ReplicatedObject::MockedControl(o) => o.receive(message),
            _ => Ok(()),
        }
    }

    /// Full state for a peer that just connected.
    pub fn initial_message(&self) -> Result<Option<Message>> {
        match self {
            ReplicatedObject::DistributedTransform(o) => o.initial_message().map(Some),
            ReplicatedObject::DistributedRigidbody(o) => o.initial_message().map(Some),
            ReplicatedObject::DistributedAnimation(o) => Ok(Some(o.initial_message())),
            _ => Ok(None),
        }
    }
}

impl From<DistributedTransform> for ReplicatedObject {
    fn from(object: DistributedTransform) -> Self {
        ReplicatedObject::DistributedTransform(object)
    }
}

impl From<MockedTransform> for ReplicatedObject {
    fn from(object: MockedTransform) -> Self {
        ReplicatedObject::MockedTransform(object)
    }
}

impl From<DistributedRigidbody> for ReplicatedObject {
    fn from(object: DistributedRigidbody) -> Self {
        ReplicatedObject::DistributedRigidbody(object)
    }
}

impl From<MockedRigidbody> for ReplicatedObject {
    fn from(object: MockedRigidbody) -> Self {
        ReplicatedObject::MockedRigidbody(object)
    }
}

impl From<DistributedAnimation> for ReplicatedObject {
    fn from(object: DistributedAnimation) -> Self {
        ReplicatedObject::DistributedAnimation(object)
    }
}

impl From<MockedAnimation> for ReplicatedObject {
    fn from(object: MockedAnimation) -> Self {
        ReplicatedObject::MockedAnimation(object)
    }
}

impl From<DistributedControl> for ReplicatedObject {
    fn from(object: DistributedControl) -> Self {
        ReplicatedObject::DistributedControl(object)
    }
}

impl From<MockedControl> for ReplicatedObject {
    fn from(object: MockedControl) -> Self {
        ReplicatedObject::MockedControl(object)
    }
}

/// Key-indexed registry of the replicated objects living in one node.
#[derive(Default)]
pub struct ObjectsRoot {
    objects: AHashMap<String, ReplicatedObject>,
}

impl ObjectsRoot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `object`, returning whatever was registered under its key before.
    pub fn register(&mut self, object: ReplicatedObject) -> Option<ReplicatedObject> {
        let key = object.key().to_string();
        debug!("Registered replicated object '{}'", key);
        self.objects.insert(key, object)
    }

    pub fn unregister(&mut self, key: &str) -> Option<ReplicatedObject> {
        self.objects.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&ReplicatedObject> {
        self.objects.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut ReplicatedObject> {
        self.objects.get_mut(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.objects.keys().map(String::as_str)
    }

    /// Runs snapshot and extrapolation updates. While `paused`, time
    /// sensitive kinds are skipped.
    pub fn tick(&mut self, now: Timestamp, outbox: &mut Outbox, paused: bool) {
        for object in self.objects.values_mut() {
            if paused && object.is_time_sensitive() {
                continue;
            }
            if let Err(e) = object.tick(now, outbox) {
                error!("'{}' could not push a snapshot: {}", object.key(), e);
            }
        }
    }

    pub fn receive(&mut self, mut message: Message) {
        match self.objects.get_mut(&message.key) {
            Some(object) => {
                if let Err(e) = object.receive(&mut message) {
                    warn!("Dropping malformed payload for '{}': {}", message.key, e);
                }
            }
            None => warn!("No receiver registered for '{}', dropping message", message.key),
        }
    }

    /// Queues the current state of every authoritative object for `address`.
    pub fn unicast_initial(&self, address: SocketAddr, outbox: &mut Outbox) {
        for object in self.objects.values().filter(|o| o.is_authoritative()) {
            match object.initial_message() {
                Ok(Some(message)) => outbox.unicast(address, message),
                Ok(None) => {}
                Err(e) => error!("'{}' could not push its initial state: {}", object.key(), e),
            }
        }
    }
}
