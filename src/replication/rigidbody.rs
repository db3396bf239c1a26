use super::extrapolation::{ExtrapolationBuffer, MotionSnapshot, Pose};
use super::ReplicationConfig;
use crate::byte_stack::ByteStack;
use crate::clock::Timestamp;
use crate::compression::{CompressedStack, ROTATION_MAX_REQUIRED_BYTES};
use crate::error::Result;
use crate::messages::Outbox;
use crate::protocol::{DeliveryClass, Message, PayloadType};
use crate::rate_limit::RateLimiter;
use glam::{Quat, Vec3};
use log::trace;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimulationMode {
    #[default]
    ApplySnapshotsOnly,
    ExtrapolateVelocities,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RigidbodyState {
    pub position: Vec3,
    pub rotation: Quat,
    pub velocity: Vec3,
    pub angular_velocity: Vec3,
}

impl Default for RigidbodyState {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            velocity: Vec3::ZERO,
            angular_velocity: Vec3::ZERO,
        }
    }
}

/// Authoritative rigid body fed by the physics step of the master.
pub struct DistributedRigidbody {
    key: String,
    mode: SimulationMode,
    state: RigidbodyState,
    config: ReplicationConfig,
    limiter: RateLimiter,
    sleeping: bool,
    sent_any: bool,
}

impl DistributedRigidbody {
    pub fn new(key: impl Into<String>, mode: SimulationMode, config: &ReplicationConfig) -> Self {
        Self {
            key: key.into(),
            mode,
            state: RigidbodyState::default(),
            config: config.clone(),
            limiter: RateLimiter::new(config.rate_limit_config()),
            sleeping: false,
            sent_any: false,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn mode(&self) -> SimulationMode {
        self.mode
    }

    pub fn state(&self) -> &RigidbodyState {
        &self.state
    }

    pub fn set_state(&mut self, state: RigidbodyState) {
        self.state = state;
    }

    pub fn is_sleeping(&self) -> bool {
        self.sleeping
    }

    fn is_resting(&self) -> bool {
        self.state.velocity.length() < self.config.sleep_linear_threshold
            && self.state.angular_velocity.length() < self.config.sleep_angular_threshold
    }

    fn snapshot(&self, delivery: DeliveryClass) -> Result<Message> {
        let config = &self.config;
        let velocity_bytes = config.velocity_bytes;
        let mut content = ByteStack::with_capacity(
            config.position_bounds.required_bytes() + ROTATION_MAX_REQUIRED_BYTES + 6 * velocity_bytes + 1,
        );

        if self.mode == SimulationMode::ExtrapolateVelocities {
            content.push_compressed_vec3(
                self.state.angular_velocity,
                -config.angular_velocity_range,
                config.angular_velocity_range,
                velocity_bytes,
            )?;
            content.push_compressed_vec3(
                self.state.velocity,
                -config.velocity_range,
                config.velocity_range,
                velocity_bytes,
            )?;
        }
        content.push_compressed_rotation(self.state.rotation);
        content.push_compressed_position(self.state.position, &config.position_bounds)?;
        content.push_enum(PayloadType::Snapshot);

        Ok(Message::new(self.key.clone(), content, delivery))
    }

    /// Broadcasts a snapshot when the cadence allows. A body at rest sends one
    /// reliable snapshot and then stays quiet until it moves again.
    pub fn update(&mut self, now: Timestamp, outbox: &mut Outbox) -> Result<()> {
        let resting = self.is_resting();
        if resting && self.sleeping {
            return Ok(());
        }
        if !self.limiter.check_for(&self.key, now) {
            return Ok(());
        }

        let reliable = resting || !self.sent_any;
        let delivery = if reliable {
            DeliveryClass::ReliableUnordered
        } else {
            DeliveryClass::Unreliable
        };
        outbox.broadcast(self.snapshot(delivery)?);

        if resting {
            trace!("'{}' fell asleep", self.key);
        }
        self.sleeping = resting;
        self.sent_any = true;
        Ok(())
    }

    pub fn initial_message(&self) -> Result<Message> {
        self.snapshot(DeliveryClass::ReliableUnordered)
    }
}

/// Replica of a [`DistributedRigidbody`].
pub struct MockedRigidbody {
    key: String,
    mode: SimulationMode,
    pose: Pose,
    config: ReplicationConfig,
    buffer: ExtrapolationBuffer,
}

impl MockedRigidbody {
    pub fn new(key: impl Into<String>, mode: SimulationMode, config: &ReplicationConfig) -> Self {
        Self {
            key: key.into(),
            mode,
            pose: Pose {
                position: Vec3::ZERO,
                rotation: Quat::IDENTITY,
            },
            config: config.clone(),
            buffer: ExtrapolationBuffer::new(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn mode(&self) -> SimulationMode {
        self.mode
    }

    pub fn pose(&self) -> &Pose {
        &self.pose
    }

    pub fn newest_snapshot(&self) -> Option<&MotionSnapshot> {
        self.buffer.newest()
    }

    pub fn receive(&mut self, message: &mut Message) -> Result<()> {
        let payload: PayloadType = message.content.pop_enum()?;
        if payload != PayloadType::Snapshot {
            trace!("'{}' ignores {:?} payloads", self.key, payload);
            return Ok(());
        }
        if self
            .buffer
            .last_timestamp()
            .map_or(false, |last| message.timestamp <= last)
        {
            return Ok(());
        }

        let config = &self.config;
        let content = &mut message.content;
        let position = content.pop_decompressed_position(&config.position_bounds)?;
        let rotation = content.pop_decompressed_rotation()?;
        let (mut velocity, mut angular_velocity) = (Vec3::ZERO, Vec3::ZERO);
        if self.mode == SimulationMode::ExtrapolateVelocities && !content.is_empty() {
            velocity = content.pop_decompressed_vec3(
                -config.velocity_range,
                config.velocity_range,
                config.velocity_bytes,
            )?;
            angular_velocity = content.pop_decompressed_vec3(
                -config.angular_velocity_range,
                config.angular_velocity_range,
                config.velocity_bytes,
            )?;
        }

        let snapshot = MotionSnapshot {
            timestamp: message.timestamp,
            position,
            rotation,
            velocity,
            angular_velocity,
        };
        self.buffer.push(snapshot);

        // Anything sent reliably is a keyframe and applies at once
        if self.mode == SimulationMode::ApplySnapshotsOnly || message.delivery != DeliveryClass::Unreliable {
            self.pose = Pose::from(&snapshot);
        }
        Ok(())
    }

    pub fn update(&mut self, now: Timestamp) {
        if self.mode != SimulationMode::ExtrapolateVelocities {
            return;
        }
        if let Some(pose) = self.buffer.sample(now, self.config.extrapolation_limit) {
            self.pose = pose;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn moving(x: f32, vx: f32) -> RigidbodyState {
        RigidbodyState {
            position: Vec3::new(x, 0.0, 0.0),
            velocity: Vec3::new(vx, 0.0, 0.0),
            ..RigidbodyState::default()
        }
    }

    fn at(seconds: f64) -> Timestamp {
        Timestamp::from_secs_f64(seconds)
    }

    fn snapshot_at(authority: &DistributedRigidbody, seconds: f64, delivery: DeliveryClass) -> Message {
        let mut message = authority.initial_message().unwrap().with_timestamp(at(seconds));
        message.delivery = delivery;
        message
    }

    #[test]
    fn test_sleeping_body_sends_one_snapshot() {
        let config = ReplicationConfig::default();
        let mut body = DistributedRigidbody::new("box", SimulationMode::ApplySnapshotsOnly, &config);
        let mut outbox = Outbox::new();

        body.set_state(moving(0.0, 5.0));
        body.update(at(0.0), &mut outbox).unwrap();
        body.set_state(moving(1.0, 5.0));
        body.update(at(0.1), &mut outbox).unwrap();
        let deliveries: Vec<DeliveryClass> = outbox.drain().map(|o| o.message.delivery).collect();
        assert_eq!(deliveries, vec![DeliveryClass::ReliableUnordered, DeliveryClass::Unreliable]);

        body.set_state(moving(1.0, 0.01));
        for i in 2..10 {
            body.update(at(0.1 * f64::from(i)), &mut outbox).unwrap();
        }
        assert!(body.is_sleeping());
        let deliveries: Vec<DeliveryClass> = outbox.drain().map(|o| o.message.delivery).collect();
        assert_eq!(deliveries, vec![DeliveryClass::ReliableUnordered]);

        body.set_state(moving(1.0, 3.0));
        body.update(at(1.0), &mut outbox).unwrap();
        assert!(!body.is_sleeping());
        assert_eq!(outbox.len(), 1);
    }

    #[test]
    fn test_velocities_only_in_extrapolate_mode() {
        let config = ReplicationConfig::default();
        let mut plain = DistributedRigidbody::new("a", SimulationMode::ApplySnapshotsOnly, &config);
        let mut extrapolated = DistributedRigidbody::new("b", SimulationMode::ExtrapolateVelocities, &config);
        plain.set_state(moving(1.0, 5.0));
        extrapolated.set_state(moving(1.0, 5.0));

        let plain_size = plain.initial_message().unwrap().content.count();
        let extrapolated_size = extrapolated.initial_message().unwrap().content.count();
        assert_eq!(extrapolated_size - plain_size, 2 * 3 * config.velocity_bytes);
    }

    #[test]
    fn test_duplicate_snapshot_is_noop() {
        let config = ReplicationConfig::default();
        let mut authority = DistributedRigidbody::new("box", SimulationMode::ExtrapolateVelocities, &config);
        let mut replica = MockedRigidbody::new("box", SimulationMode::ExtrapolateVelocities, &config);

        authority.set_state(moving(4.0, 1.0));
        replica
            .receive(&mut snapshot_at(&authority, 10.0, DeliveryClass::ReliableUnordered))
            .unwrap();
        let pose = *replica.pose();
        let newest = *replica.newest_snapshot().unwrap();

        authority.set_state(moving(8.0, 1.0));
        replica
            .receive(&mut snapshot_at(&authority, 10.0, DeliveryClass::ReliableUnordered))
            .unwrap();

        assert_eq!(*replica.pose(), pose);
        assert_eq!(*replica.newest_snapshot().unwrap(), newest);
    }

    #[test]
    fn test_replica_extrapolates_between_snapshots() {
        let config = ReplicationConfig::default();
        let mut authority = DistributedRigidbody::new("box", SimulationMode::ExtrapolateVelocities, &config);
        let mut replica = MockedRigidbody::new("box", SimulationMode::ExtrapolateVelocities, &config);

        authority.set_state(moving(0.0, 10.0));
        replica
            .receive(&mut snapshot_at(&authority, 0.0, DeliveryClass::Unreliable))
            .unwrap();
        authority.set_state(moving(1.0, 10.0));
        replica
            .receive(&mut snapshot_at(&authority, 0.1, DeliveryClass::Unreliable))
            .unwrap();

        replica.update(at(0.35));
        assert!((replica.pose().position.x - 3.5).abs() < 0.01, "{}", replica.pose().position.x);

        replica.update(at(0.1) + Duration::from_millis(400));
        assert!((replica.pose().position.x - 1.0).abs() < 0.001);
    }

    #[test]
    fn test_keyframe_applies_instantly() {
        let config = ReplicationConfig::default();
        let mut authority = DistributedRigidbody::new("box", SimulationMode::ExtrapolateVelocities, &config);
        let mut replica = MockedRigidbody::new("box", SimulationMode::ExtrapolateVelocities, &config);

        authority.set_state(moving(2.0, 0.0));
        replica
            .receive(&mut snapshot_at(&authority, 1.0, DeliveryClass::Unreliable))
            .unwrap();
        assert_eq!(replica.pose().position, Vec3::ZERO);

        authority.set_state(moving(3.0, 0.0));
        replica
            .receive(&mut snapshot_at(&authority, 2.0, DeliveryClass::ReliableUnordered))
            .unwrap();
        assert!((replica.pose().position.x - 3.0).abs() < 0.001);
    }
}
