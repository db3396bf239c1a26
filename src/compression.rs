use crate::byte_stack::ByteStack;
use crate::error::{ClusterError, Result};
use glam::{Quat, Vec3, Vec4};
use serde::{Deserialize, Serialize};

pub const DEFAULT_BYTES_FOR_COMPRESSED_FLOAT: usize = 2;
pub const POSITION_PRECISION: f32 = 0.001;
pub const DEFAULT_POSITION_EXTENT: f32 = 4096.0;

/// Byte count of the rotation encoding when all three small components are present.
pub const ROTATION_MAX_REQUIRED_BYTES: usize = 1 + 3 * DEFAULT_BYTES_FOR_COMPRESSED_FLOAT;

const ROTATION_ONE_TOLERANCE: f32 = 1.0e-6;

/// Number of bytes needed to hold `number`. Zero still takes one byte.
pub fn required_bytes(number: u64) -> usize {
    let mut bytes = 1;
    let mut rest = number >> 8;
    while rest != 0 {
        bytes += 1;
        rest >>= 8;
    }
    bytes
}

/// Largest integer held by `bytes` bytes, with `bytes` clamped to `1..=4`.
pub fn max_int_value(bytes: usize) -> u64 {
    (1u64 << (8 * bytes.clamp(1, 4))) - 1
}

/// Largest distance between a value and its decoded form for the given range.
pub fn quantization_step(min: f32, max: f32, bytes: usize) -> f32 {
    ((f64::from(max) - f64::from(min)) / max_int_value(bytes) as f64) as f32
}

fn check_byte_count(bytes: usize) -> Result<()> {
    if bytes == 0 || bytes > 4 {
        return Err(ClusterError::InvalidByteCount(bytes));
    }
    Ok(())
}

/// Maps `value` from `[min, max]` onto `[0, 2^(8*bytes) - 1]`, clamping outside values.
pub fn compress_value(value: f32, min: f32, max: f32, bytes: usize) -> u32 {
    let max_int = max_int_value(bytes) as f64;
    let range = f64::from(max) - f64::from(min);
    if range <= 0.0 || value.is_nan() {
        return 0;
    }

    let scaled = (max_int * (f64::from(value) - f64::from(min)) / range).round();
    scaled.clamp(0.0, max_int) as u32
}

pub fn decompress_value(value: u32, min: f32, max: f32, bytes: usize) -> f32 {
    let max_int = max_int_value(bytes) as f64;
    let range = f64::from(max) - f64::from(min);
    (f64::from(value) / max_int * range + f64::from(min)) as f32
}

/// Axis-aligned region positions must stay inside to be compressed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionBounds {
    pub min: Vec3,
    pub max: Vec3,
    pub precision: f32,
}

impl Default for PositionBounds {
    fn default() -> Self {
        Self::from_center_size(Vec3::ZERO, Vec3::splat(DEFAULT_POSITION_EXTENT))
    }
}

impl PositionBounds {
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self {
            min,
            max,
            precision: POSITION_PRECISION,
        }
    }

    pub fn from_center_size(center: Vec3, size: Vec3) -> Self {
        let half = size * 0.5;
        Self::new(center - half, center + half)
    }

    pub fn with_precision(mut self, precision: f32) -> Self {
        self.precision = precision;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.precision.is_nan() || self.precision <= 0.0 {
            return Err(ClusterError::InvalidConfig(format!(
                "position precision must be positive, got {}",
                self.precision
            )));
        }
        if self.min.cmpge(self.max).any() {
            return Err(ClusterError::InvalidConfig(format!(
                "position bounds are empty: min {} max {}",
                self.min, self.max
            )));
        }
        if self.axis_bytes().iter().any(|b| *b > 4) {
            return Err(ClusterError::InvalidConfig(
                "position bounds need more than 4 bytes per axis at this precision".to_string(),
            ));
        }
        Ok(())
    }

    pub fn axis_bytes(&self) -> [usize; 3] {
        let steps = ((self.max - self.min) / self.precision).ceil();
        [
            required_bytes(steps.x as u64),
            required_bytes(steps.y as u64),
            required_bytes(steps.z as u64),
        ]
    }

    pub fn required_bytes(&self) -> usize {
        self.axis_bytes().iter().sum()
    }

    fn compress_axis(&self, value: f32, axis: usize, bytes: usize) -> Result<u32> {
        let (min, max) = (self.min[axis], self.max[axis]);
        if value < min - self.precision || value > max + self.precision || value.is_nan() {
            return Err(ClusterError::ValueOutOfBounds { value, min, max });
        }

        Ok(compress_value(value.clamp(min, max), min, max, bytes))
    }
}

/// Quantized and raw encodings of math types on top of [`ByteStack`].
pub trait CompressedStack {
    fn push_compressed_f32(&mut self, value: f32, min: f32, max: f32, bytes: usize) -> Result<()>;
    fn pop_decompressed_f32(&mut self, min: f32, max: f32, bytes: usize) -> Result<f32>;

    fn push_compressed_vec3(&mut self, value: Vec3, min: f32, max: f32, bytes: usize) -> Result<()>;
    fn pop_decompressed_vec3(&mut self, min: f32, max: f32, bytes: usize) -> Result<Vec3>;

    fn push_uncompressed_vec3(&mut self, value: Vec3);
    fn pop_uncompressed_vec3(&mut self) -> Result<Vec3>;

    fn push_compressed_color(&mut self, rgba: Vec4, bytes: usize) -> Result<()>;
    fn pop_decompressed_color(&mut self, bytes: usize) -> Result<Vec4>;

    fn push_compressed_position(&mut self, position: Vec3, bounds: &PositionBounds) -> Result<()>;
    fn pop_decompressed_position(&mut self, bounds: &PositionBounds) -> Result<Vec3>;

    fn push_compressed_rotation(&mut self, rotation: Quat);
    fn pop_decompressed_rotation(&mut self) -> Result<Quat>;
}

impl CompressedStack for ByteStack {
    fn push_compressed_f32(&mut self, value: f32, min: f32, max: f32, bytes: usize) -> Result<()> {
        check_byte_count(bytes)?;
        self.push_u32(compress_value(value, min, max, bytes), bytes);
        Ok(())
    }

    fn pop_decompressed_f32(&mut self, min: f32, max: f32, bytes: usize) -> Result<f32> {
        check_byte_count(bytes)?;
        let raw = self.pop_u32(bytes)?;
        Ok(decompress_value(raw, min, max, bytes))
    }

    fn push_compressed_vec3(&mut self, value: Vec3, min: f32, max: f32, bytes: usize) -> Result<()> {
        self.push_compressed_f32(value.z, min, max, bytes)?;
        self.push_compressed_f32(value.y, min, max, bytes)?;
        self.push_compressed_f32(value.x, min, max, bytes)
    }

    fn pop_decompressed_vec3(&mut self, min: f32, max: f32, bytes: usize) -> Result<Vec3> {
        let x = self.pop_decompressed_f32(min, max, bytes)?;
        let y = self.pop_decompressed_f32(min, max, bytes)?;
        let z = self.pop_decompressed_f32(min, max, bytes)?;
        Ok(Vec3::new(x, y, z))
    }

    fn push_uncompressed_vec3(&mut self, value: Vec3) {
        self.push_f32(value.z);
        self.push_f32(value.y);
        self.push_f32(value.x);
    }

    fn pop_uncompressed_vec3(&mut self) -> Result<Vec3> {
        let x = self.pop_f32()?;
        let y = self.pop_f32()?;
        let z = self.pop_f32()?;
        Ok(Vec3::new(x, y, z))
    }

    fn push_compressed_color(&mut self, rgba: Vec4, bytes: usize) -> Result<()> {
        self.push_compressed_f32(rgba.w, 0.0, 1.0, bytes)?;
        self.push_compressed_f32(rgba.z, 0.0, 1.0, bytes)?;
        self.push_compressed_f32(rgba.y, 0.0, 1.0, bytes)?;
        self.push_compressed_f32(rgba.x, 0.0, 1.0, bytes)
    }

    fn pop_decompressed_color(&mut self, bytes: usize) -> Result<Vec4> {
        let r = self.pop_decompressed_f32(0.0, 1.0, bytes)?;
        let g = self.pop_decompressed_f32(0.0, 1.0, bytes)?;
        let b = self.pop_decompressed_f32(0.0, 1.0, bytes)?;
        let a = self.pop_decompressed_f32(0.0, 1.0, bytes)?;
        Ok(Vec4::new(r, g, b, a))
    }

    fn push_compressed_position(&mut self, position: Vec3, bounds: &PositionBounds) -> Result<()> {
        let bytes = bounds.axis_bytes();
        let x = bounds.compress_axis(position.x, 0, bytes[0])?;
        let y = bounds.compress_axis(position.y, 1, bytes[1])?;
        let z = bounds.compress_axis(position.z, 2, bytes[2])?;

        self.push_u32(z, bytes[2]);
        self.push_u32(y, bytes[1]);
        self.push_u32(x, bytes[0]);
        Ok(())
    }

    fn pop_decompressed_position(&mut self, bounds: &PositionBounds) -> Result<Vec3> {
        let bytes = bounds.axis_bytes();
        let mut position = Vec3::ZERO;
        for axis in 0..3 {
            let raw = self.pop_u32(bytes[axis])?;
            position[axis] = decompress_value(raw, bounds.min[axis], bounds.max[axis], bytes[axis]);
        }
        Ok(position)
    }

    // Smallest three: the largest component is dropped and rebuilt from the
    // unit length, the other three are quantized into [-1, 1].
    fn push_compressed_rotation(&mut self, rotation: Quat) {
        let components = rotation.to_array();
        let mut max_index = 0usize;
        let mut max_value = f32::MIN;
        let mut sign = 1.0f32;

        for (i, component) in components.iter().enumerate() {
            let abs = component.abs();
            if abs > max_value {
                sign = if *component < 0.0 { -1.0 } else { 1.0 };
                max_index = i;
                max_value = abs;
            }
        }

        if (max_value - 1.0).abs() < ROTATION_ONE_TOLERANCE {
            self.push_byte(max_index as u8 + 4);
            return;
        }

        for i in (0..4).rev() {
            if i == max_index {
                continue;
            }
            let value = compress_value(
                components[i] * sign,
                -1.0,
                1.0,
                DEFAULT_BYTES_FOR_COMPRESSED_FLOAT,
            );
            self.push_u32(value, DEFAULT_BYTES_FOR_COMPRESSED_FLOAT);
        }
        self.push_byte(max_index as u8);
    }

    fn pop_decompressed_rotation(&mut self) -> Result<Quat> {
        let max_index = self.pop_byte()?;

        if (4..=7).contains(&max_index) {
            let mut components = [0.0f32; 4];
            components[usize::from(max_index - 4)] = 1.0;
            return Ok(Quat::from_array(components));
        }
        if max_index > 3 {
            return Err(ClusterError::InvalidOrdinal {
                kind: "rotation index",
                value: u64::from(max_index),
            });
        }

        let max_index = usize::from(max_index);
        let mut components = [0.0f32; 4];
        let mut squares = 0.0f32;
        for (i, component) in components.iter_mut().enumerate() {
            if i == max_index {
                continue;
            }
            let raw = self.pop_u32(DEFAULT_BYTES_FOR_COMPRESSED_FLOAT)?;
            *component = decompress_value(raw, -1.0, 1.0, DEFAULT_BYTES_FOR_COMPRESSED_FLOAT);
            squares += *component * *component;
        }
        components[max_index] = (1.0 - squares).max(0.0).sqrt();

        Ok(Quat::from_array(components).normalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_required_bytes() {
        assert_eq!(required_bytes(0), 1);
        assert_eq!(required_bytes(255), 1);
        assert_eq!(required_bytes(256), 2);
        assert_eq!(required_bytes(65_535), 2);
        assert_eq!(required_bytes(4_096_000), 3);
        assert_eq!(required_bytes(u32::MAX as u64), 4);
    }

    #[test]
    fn test_quantized_position_component() {
        let encoded = compress_value(37.25, -100.0, 100.0, 2);
        let decoded = decompress_value(encoded, -100.0, 100.0, 2);

        assert!((decoded - 37.25).abs() <= 200.0 / 65_535.0);
    }

    #[test]
    fn test_compress_clamps_outside_values() {
        assert_eq!(compress_value(-5.0, 0.0, 1.0, 1), 0);
        assert_eq!(compress_value(5.0, 0.0, 1.0, 1), 255);
        assert_eq!(compress_value(1.0, 0.0, 1.0, 4), u32::MAX);
    }

    #[test]
    fn test_invalid_byte_count() {
        let mut stack = ByteStack::new();
        assert!(matches!(
            stack.push_compressed_f32(0.5, 0.0, 1.0, 5),
            Err(ClusterError::InvalidByteCount(5))
        ));
        assert!(stack.is_empty());
    }

    #[test]
    fn test_byte_count_clamped_for_range_helpers() {
        assert_eq!(max_int_value(0), 0xFF);
        assert_eq!(max_int_value(4), u64::from(u32::MAX));
        assert_eq!(max_int_value(8), u64::from(u32::MAX));
        assert_eq!(max_int_value(usize::MAX), u64::from(u32::MAX));
        assert_eq!(quantization_step(0.0, 1.0, 16), quantization_step(0.0, 1.0, 4));
    }

    #[test]
    fn test_default_position_bounds() {
        let bounds = PositionBounds::default();
        assert_eq!(bounds.axis_bytes(), [3, 3, 3]);
        assert_eq!(bounds.required_bytes(), 9);
        assert!(bounds.validate().is_ok());
    }

    #[test]
    fn test_position_round_trip_precision() {
        let bounds = PositionBounds::default();
        let mut stack = ByteStack::new();
        let position = Vec3::new(12.345, -1500.5, 2047.9);

        stack.push_compressed_position(position, &bounds).unwrap();
        assert_eq!(stack.count(), 9);
        let decoded = stack.pop_decompressed_position(&bounds).unwrap();

        assert!((decoded - position).abs().max_element() <= bounds.precision);
    }

    #[test]
    fn test_position_snaps_within_precision() {
        let bounds = PositionBounds::new(Vec3::splat(-10.0), Vec3::splat(10.0));
        let mut stack = ByteStack::new();

        stack
            .push_compressed_position(Vec3::new(10.0005, 0.0, -10.0005), &bounds)
            .unwrap();
        let decoded = stack.pop_decompressed_position(&bounds).unwrap();
        assert_eq!(decoded.x, 10.0);
        assert_eq!(decoded.z, -10.0);

        let result = stack.push_compressed_position(Vec3::new(11.0, 0.0, 0.0), &bounds);
        assert!(matches!(result, Err(ClusterError::ValueOutOfBounds { .. })));
    }

    #[test]
    fn test_identity_rotation_is_one_byte() {
        let mut stack = ByteStack::new();
        stack.push_compressed_rotation(Quat::IDENTITY);
        assert_eq!(stack.count(), 1);
        assert_eq!(stack.pop_decompressed_rotation().unwrap(), Quat::IDENTITY);
    }

    #[test]
    fn test_rotation_round_trip() {
        let rotation = Quat::from_euler(glam::EulerRot::YXZ, 1.2, -0.4, 2.9);
        let mut stack = ByteStack::new();

        stack.push_compressed_rotation(rotation);
        assert_eq!(stack.count(), ROTATION_MAX_REQUIRED_BYTES);
        let decoded = stack.pop_decompressed_rotation().unwrap();

        assert!(decoded.dot(rotation).abs() > 0.9999);
        assert!((decoded.length() - 1.0).abs() < 1.0e-5);
    }

    #[test]
    fn test_rotation_negative_largest_component() {
        let rotation = Quat::from_xyzw(0.1, -0.9, 0.2, 0.3).normalize();
        let mut stack = ByteStack::new();

        stack.push_compressed_rotation(rotation);
        let decoded = stack.pop_decompressed_rotation().unwrap();

        // q and -q describe the same orientation
        assert!(decoded.dot(rotation).abs() > 0.9999);
    }

    #[test]
    fn test_vectors_and_colors() {
        let mut stack = ByteStack::new();
        stack.push_uncompressed_vec3(Vec3::new(1.0, 2.0, 3.0));
        stack.push_compressed_vec3(Vec3::new(-5.0, 0.0, 5.0), -10.0, 10.0, 2).unwrap();
        stack.push_compressed_color(Vec4::new(1.0, 0.5, 0.0, 1.0), 1).unwrap();

        let color = stack.pop_decompressed_color(1).unwrap();
        assert!((color - Vec4::new(1.0, 0.5, 0.0, 1.0)).abs().max_element() <= 1.0 / 255.0);

        let vector = stack.pop_decompressed_vec3(-10.0, 10.0, 2).unwrap();
        assert!((vector - Vec3::new(-5.0, 0.0, 5.0)).abs().max_element() <= quantization_step(-10.0, 10.0, 2));

        assert_eq!(stack.pop_uncompressed_vec3().unwrap(), Vec3::new(1.0, 2.0, 3.0));
        assert!(stack.is_empty());
    }

    proptest! {
        #[test]
        fn test_quantization_error_is_bounded(
            min in -1000.0f32..0.0,
            span in 10.0f32..2000.0,
            fraction in 0.0f32..=1.0,
            bytes in 1usize..=4,
        ) {
            let max = min + span;
            let value = (min + span * fraction).clamp(min, max);

            let decoded = decompress_value(compress_value(value, min, max, bytes), min, max, bytes);

            prop_assert!((decoded - value).abs() <= quantization_step(min, max, bytes));
        }
    }
}
