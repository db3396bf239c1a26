use super::ReplicationConfig;
use crate::byte_stack::ByteStack;
use crate::clock::Timestamp;
use crate::compression::{CompressedStack, PositionBounds, ROTATION_MAX_REQUIRED_BYTES};
use crate::error::Result;
use crate::messages::Outbox;
use crate::protocol::{DeliveryClass, Message, PayloadType};
use crate::rate_limit::RateLimiter;
use glam::{Quat, Vec3};
use log::trace;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransformState {
    pub position: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl Default for TransformState {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
        }
    }
}

fn snapshot_content(state: &TransformState, bounds: &PositionBounds) -> Result<ByteStack> {
    let mut content = ByteStack::with_capacity(bounds.required_bytes() + ROTATION_MAX_REQUIRED_BYTES + 13);
    content.push_uncompressed_vec3(state.scale);
    content.push_compressed_rotation(state.rotation);
    content.push_compressed_position(state.position, bounds)?;
    content.push_enum(PayloadType::Snapshot);
    Ok(content)
}

/// Authoritative local transform of a scene object.
pub struct DistributedTransform {
    key: String,
    state: TransformState,
    last_sent: Option<TransformState>,
    bounds: PositionBounds,
    limiter: RateLimiter,
}

impl DistributedTransform {
    pub fn new(key: impl Into<String>, config: &ReplicationConfig) -> Self {
        Self {
            key: key.into(),
            state: TransformState::default(),
            last_sent: None,
            bounds: config.position_bounds,
            limiter: RateLimiter::new(config.rate_limit_config()),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn state(&self) -> &TransformState {
        &self.state
    }

    pub fn set_state(&mut self, state: TransformState) {
        self.state = state;
    }

    pub fn set_position(&mut self, position: Vec3) {
        self.state.position = position;
    }

    pub fn set_rotation(&mut self, rotation: Quat) {
        self.state.rotation = rotation;
    }

    pub fn set_scale(&mut self, scale: Vec3) {
        self.state.scale = scale;
    }

    pub fn is_dirty(&self) -> bool {
        let last = match &self.last_sent {
            Some(last) => last,
            None => return true,
        };

        last.position.distance(self.state.position) > self.bounds.precision
            || last.rotation.angle_between(self.state.rotation) > self.bounds.precision
            || last.scale != self.state.scale
    }

    fn snapshot(&self, delivery: DeliveryClass) -> Result<Message> {
        let content = snapshot_content(&self.state, &self.bounds)?;
        Ok(Message::new(self.key.clone(), content, delivery))
    }

    pub fn update(&mut self, now: Timestamp, outbox: &mut Outbox) -> Result<()> {
        if !self.is_dirty() || !self.limiter.check_for(&self.key, now) {
            return Ok(());
        }

        // First snapshot must arrive
        let delivery = if self.last_sent.is_none() {
            DeliveryClass::ReliableUnordered
        } else {
            DeliveryClass::Unreliable
        };
        outbox.broadcast(self.snapshot(delivery)?);
        self.last_sent = Some(self.state);
        Ok(())
    }

    pub fn initial_message(&self) -> Result<Message> {
        self.snapshot(DeliveryClass::ReliableUnordered)
    }
}

/// Replica of a [`DistributedTransform`], overwritten by newer snapshots.
pub struct MockedTransform {
    key: String,
    state: TransformState,
    bounds: PositionBounds,
    last_applied: Option<Timestamp>,
}

impl MockedTransform {
    pub fn new(key: impl Into<String>, config: &ReplicationConfig) -> Self {
        Self {
            key: key.into(),
            state: TransformState::default(),
            bounds: config.position_bounds,
            last_applied: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn state(&self) -> &TransformState {
        &self.state
    }

    pub fn last_applied(&self) -> Option<Timestamp> {
        self.last_applied
    }

    pub fn receive(&mut self, message: &mut Message) -> Result<()> {
        let payload: PayloadType = message.content.pop_enum()?;
        if payload != PayloadType::Snapshot {
            trace!("'{}' ignores {:?} payloads", self.key, payload);
            return Ok(());
        }
        if self.last_applied.map_or(false, |last| message.timestamp <= last) {
            return Ok(());
        }

        let position = message.content.pop_decompressed_position(&self.bounds)?;
        let rotation = message.content.pop_decompressed_rotation()?;
        let scale = message.content.pop_uncompressed_vec3()?;

        self.state = TransformState {
            position,
            rotation,
            scale,
        };
        self.last_applied = Some(message.timestamp);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> ReplicationConfig {
        ReplicationConfig::default()
    }

    fn sent(outbox: &mut Outbox) -> Vec<Message> {
        outbox.drain().map(|o| o.message).collect()
    }

    #[test]
    fn test_first_snapshot_reliable_then_unreliable() {
        let mut transform = DistributedTransform::new("car", &config());
        let mut outbox = Outbox::new();

        transform.update(Timestamp::ZERO, &mut outbox).unwrap();
        let first = sent(&mut outbox);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].delivery, DeliveryClass::ReliableUnordered);

        transform.set_position(Vec3::new(5.0, 0.0, 0.0));
        transform
            .update(Timestamp::ZERO + Duration::from_millis(20), &mut outbox)
            .unwrap();
        let second = sent(&mut outbox);
        assert_eq!(second[0].delivery, DeliveryClass::Unreliable);
    }

    #[test]
    fn test_unchanged_transform_is_not_resent() {
        let mut transform = DistributedTransform::new("car", &config());
        let mut outbox = Outbox::new();
        transform.update(Timestamp::ZERO, &mut outbox).unwrap();
        outbox.drain();

        transform.set_position(Vec3::new(0.0001, 0.0, 0.0));
        assert!(!transform.is_dirty());
        transform
            .update(Timestamp::ZERO + Duration::from_secs(1), &mut outbox)
            .unwrap();
        assert!(outbox.is_empty());

        transform.set_scale(Vec3::splat(2.0));
        assert!(transform.is_dirty());
    }

    #[test]
    fn test_snapshots_capped_by_rate() {
        let mut transform = DistributedTransform::new("car", &config().with_snapshots_per_second(10));
        let mut outbox = Outbox::new();

        for ms in 0..100u64 {
            transform.set_position(Vec3::new(ms as f32, 0.0, 0.0));
            transform
                .update(Timestamp::ZERO + Duration::from_millis(ms), &mut outbox)
                .unwrap();
        }
        assert_eq!(outbox.len(), 1);
    }

    #[test]
    fn test_replica_applies_and_rejects_stale() {
        let mut authority = DistributedTransform::new("car", &config());
        let mut replica = MockedTransform::new("car", &config());

        authority.set_state(TransformState {
            position: Vec3::new(10.0, -3.5, 2.25),
            rotation: Quat::from_rotation_y(0.7),
            scale: Vec3::new(1.0, 2.0, 1.0),
        });
        let mut newer = authority
            .initial_message()
            .unwrap()
            .with_timestamp(Timestamp::from_ticks(10));
        let mut duplicate = newer.clone();
        replica.receive(&mut newer).unwrap();

        let state = *replica.state();
        assert!(state.position.distance(Vec3::new(10.0, -3.5, 2.25)) < 0.002);
        assert!(state.rotation.angle_between(Quat::from_rotation_y(0.7)) < 0.001);
        assert_eq!(state.scale, Vec3::new(1.0, 2.0, 1.0));

        // Same timestamp again is a no-op
        replica.receive(&mut duplicate).unwrap();
        assert_eq!(*replica.state(), state);

        authority.set_position(Vec3::ZERO);
        let mut older = authority
            .initial_message()
            .unwrap()
            .with_timestamp(Timestamp::from_ticks(5));
        replica.receive(&mut older).unwrap();
        assert_eq!(*replica.state(), state);
        assert_eq!(replica.last_applied(), Some(Timestamp::from_ticks(10)));
    }

    #[test]
    fn test_out_of_bounds_position_is_error() {
        let mut transform = DistributedTransform::new("car", &config());
        transform.set_position(Vec3::new(1.0e6, 0.0, 0.0));
        let mut outbox = Outbox::new();

        assert!(transform.update(Timestamp::ZERO, &mut outbox).is_err());
        assert!(outbox.is_empty());
    }
}
