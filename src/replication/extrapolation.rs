use crate::clock::Timestamp;
use glam::{Quat, Vec3};

const EPSILON: f32 = 1.0e-6;

/// Received rigid body state, timestamped in local time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionSnapshot {
    pub timestamp: Timestamp,
    pub position: Vec3,
    pub rotation: Quat,
    pub velocity: Vec3,
    pub angular_velocity: Vec3,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub position: Vec3,
    pub rotation: Quat,
}

impl From<&MotionSnapshot> for Pose {
    fn from(snapshot: &MotionSnapshot) -> Self {
        Self {
            position: snapshot.position,
            rotation: snapshot.rotation,
        }
    }
}

/// Spherical interpolation of vectors, with `t` allowed outside `[0, 1]`.
///
/// Direction rotates by the angle between the inputs while the length is
/// interpolated linearly.
pub fn slerp_unclamped(from: Vec3, to: Vec3, t: f32) -> Vec3 {
    let from_length = from.length();
    let to_length = to.length();
    if from_length < EPSILON || to_length < EPSILON {
        return from.lerp(to, t);
    }

    let from_direction = from / from_length;
    let to_direction = to / to_length;
    let angle = from_direction.angle_between(to_direction);
    let sin = angle.sin();
    if sin.abs() < EPSILON {
        return from.lerp(to, t);
    }

    let direction = from_direction * (((1.0 - t) * angle).sin() / sin)
        + to_direction * ((t * angle).sin() / sin);
    direction * (from_length + (to_length - from_length) * t)
}

/// The two newest snapshots of a replica and the velocity it last applied.
#[derive(Debug, Clone, Default)]
pub struct ExtrapolationBuffer {
    previous: Option<MotionSnapshot>,
    newest: Option<MotionSnapshot>,
    previous_applied_velocity: Option<Vec3>,
}

impl ExtrapolationBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn newest(&self) -> Option<&MotionSnapshot> {
        self.newest.as_ref()
    }

    pub fn previous(&self) -> Option<&MotionSnapshot> {
        self.previous.as_ref()
    }

    pub fn last_timestamp(&self) -> Option<Timestamp> {
        self.newest.map(|s| s.timestamp)
    }

    /// Stores `snapshot` as the newest one. Returns false, leaving the buffer
    /// untouched, when it is not newer than what is already held.
    pub fn push(&mut self, snapshot: MotionSnapshot) -> bool {
        if self.last_timestamp().map_or(false, |last| snapshot.timestamp <= last) {
            return false;
        }

        self.previous = self.newest.replace(snapshot);
        true
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Projects the newest snapshot forward to `now`.
    ///
    /// Falls back to the newest raw pose when there is a single snapshot, when
    /// `now` is more than `limit` seconds past it, or when the projected
    /// velocity opposes the one applied on the previous call.
    pub fn sample(&mut self, now: Timestamp, limit: f32) -> Option<Pose> {
        let newest = self.newest?;
        let after = now.seconds_since(newest.timestamp);

        let previous = match self.previous {
            Some(previous) if after <= limit => previous,
            _ => return Some(Pose::from(&newest)),
        };

        let between = newest.timestamp.seconds_since(previous.timestamp);
        if between <= 0.0 {
            return Some(Pose::from(&newest));
        }
        let t = (after + between) / between;

        let angular_velocity = slerp_unclamped(previous.angular_velocity, newest.angular_velocity, t);
        let rotation = (newest.rotation * Quat::from_scaled_axis(angular_velocity * after)).normalize();

        let velocity = previous.velocity.lerp(newest.velocity, t);
        let same_direction = self
            .previous_applied_velocity
            .map_or(true, |applied| velocity.dot(applied) > 0.0);
        let position = if same_direction {
            newest.position + velocity * after
        } else {
            newest.position
        };
        self.previous_applied_velocity = Some(velocity);

        Some(Pose { position, rotation })
    }
}
