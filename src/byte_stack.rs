use crate::compression::required_bytes;
use crate::error::{ClusterError, Result};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// Enumerations that can be packed into the smallest integer able to hold
/// their largest ordinal.
pub trait StackEnum: Sized + Copy {
    const MAX_ORDINAL: u64;
    const NAME: &'static str;

    fn ordinal(self) -> u64;
    fn from_ordinal(ordinal: u64) -> Option<Self>;
}

/// LIFO byte buffer used as the payload of every message.
///
/// Values are popped in reverse push order. Multi-byte integers are pushed
/// least significant byte first so the most significant byte sits on top.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ByteStack {
    buffer: BytesMut,
}

impl ByteStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
        }
    }

    pub fn from_slice(data: &[u8]) -> Self {
        Self {
            buffer: BytesMut::from(data),
        }
    }

    pub fn count(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.buffer)
    }

    pub fn into_bytes(self) -> Bytes {
        self.buffer.freeze()
    }

    fn ensure(&self, requested: usize) -> Result<()> {
        if requested > self.buffer.len() {
            return Err(ClusterError::StackUnderflow {
                requested,
                available: self.buffer.len(),
            });
        }
        Ok(())
    }

    pub fn push_byte(&mut self, value: u8) {
        self.buffer.put_u8(value);
    }

    pub fn pop_byte(&mut self) -> Result<u8> {
        self.ensure(1)?;
        let last = self.buffer.len() - 1;
        let value = self.buffer[last];
        self.buffer.truncate(last);
        Ok(value)
    }

    pub fn peek_byte(&self, offset: usize) -> Result<u8> {
        self.ensure(offset + 1)?;
        Ok(self.buffer[self.buffer.len() - 1 - offset])
    }

    /// Pushes the lowest `bytes` bytes of `value`.
    pub fn push_uint(&mut self, value: u64, bytes: usize) {
        debug_assert!(bytes <= 8);
        for i in 0..bytes {
            self.buffer.put_u8((value >> (8 * i)) as u8);
        }
    }

    pub fn pop_uint(&mut self, bytes: usize) -> Result<u64> {
        let value = self.peek_uint(bytes, 0)?;
        let len = self.buffer.len();
        self.buffer.truncate(len - bytes);
        Ok(value)
    }

    pub fn peek_uint(&self, bytes: usize, offset: usize) -> Result<u64> {
        debug_assert!(bytes <= 8);
        self.ensure(offset + bytes)?;
        let top = self.buffer.len() - offset;
        let value = self.buffer[top - bytes..top]
            .iter()
            .rev()
            .fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
        Ok(value)
    }

    pub fn push_u32(&mut self, value: u32, bytes: usize) {
        self.push_uint(u64::from(value), bytes.min(4));
    }

    pub fn pop_u32(&mut self, bytes: usize) -> Result<u32> {
        Ok(self.pop_uint(bytes.min(4))? as u32)
    }

    pub fn push_i32(&mut self, value: i32) {
        self.push_uint(u64::from(value as u32), 4);
    }

    pub fn pop_i32(&mut self) -> Result<i32> {
        Ok(self.pop_uint(4)? as u32 as i32)
    }

    pub fn peek_i32(&self, offset: usize) -> Result<i32> {
        Ok(self.peek_uint(4, offset)? as u32 as i32)
    }

    pub fn push_i64(&mut self, value: i64) {
        self.push_uint(value as u64, 8);
    }

    pub fn pop_i64(&mut self) -> Result<i64> {
        Ok(self.pop_uint(8)? as i64)
    }

    pub fn peek_i64(&self, offset: usize) -> Result<i64> {
        Ok(self.peek_uint(8, offset)? as i64)
    }

    pub fn push_f32(&mut self, value: f32) {
        self.push_uint(u64::from(value.to_bits()), 4);
    }

    pub fn pop_f32(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.pop_uint(4)? as u32))
    }

    pub fn push_f64(&mut self, value: f64) {
        self.push_uint(value.to_bits(), 8);
    }

    pub fn pop_f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.pop_uint(8)?))
    }

    pub fn push_bool(&mut self, value: bool) {
        self.push_byte(u8::from(value));
    }

    pub fn pop_bool(&mut self) -> Result<bool> {
        Ok(self.pop_byte()? != 0)
    }

    pub fn peek_bool(&self, offset: usize) -> Result<bool> {
        Ok(self.peek_byte(offset)? != 0)
    }

    /// Raw bytes, popped back in their original order.
    pub fn push_bytes(&mut self, data: &[u8]) {
        self.buffer.put_slice(data);
    }

    pub fn pop_bytes(&mut self, count: usize) -> Result<Vec<u8>> {
        self.ensure(count)?;
        let start = self.buffer.len() - count;
        let data = self.buffer.split_off(start);
        Ok(data.to_vec())
    }

    pub fn push_bytes_with_length(&mut self, data: &[u8]) {
        self.push_bytes(data);
        self.push_i32(data.len() as i32);
    }

    pub fn pop_bytes_with_length(&mut self) -> Result<Vec<u8>> {
        let length = self.pop_i32()?;
        if length < 0 {
            return Err(ClusterError::InvalidLength(length));
        }
        self.pop_bytes(length as usize)
    }

    /// `None` is encoded as a length of -1, distinct from the empty string.
    pub fn push_string(&mut self, value: Option<&str>) {
        match value {
            Some(text) => self.push_bytes_with_length(text.as_bytes()),
            None => self.push_i32(-1),
        }
    }

    pub fn pop_string(&mut self) -> Result<Option<String>> {
        let length = self.pop_i32()?;
        match length {
            -1 => Ok(None),
            n if n < 0 => Err(ClusterError::InvalidLength(n)),
            n => {
                let data = self.pop_bytes(n as usize)?;
                Ok(Some(String::from_utf8(data)?))
            }
        }
    }

    pub fn push_str(&mut self, value: &str) {
        self.push_string(Some(value));
    }

    pub fn pop_str(&mut self) -> Result<String> {
        Ok(self.pop_string()?.unwrap_or_default())
    }

    pub fn push_enum<E: StackEnum>(&mut self, value: E) {
        self.push_uint(value.ordinal(), required_bytes(E::MAX_ORDINAL));
    }

    pub fn pop_enum<E: StackEnum>(&mut self) -> Result<E> {
        let ordinal = self.pop_uint(required_bytes(E::MAX_ORDINAL))?;
        E::from_ordinal(ordinal).ok_or(ClusterError::InvalidOrdinal {
            kind: E::NAME,
            value: ordinal,
        })
    }

    pub fn peek_enum<E: StackEnum>(&self, offset: usize) -> Result<E> {
        let ordinal = self.peek_uint(required_bytes(E::MAX_ORDINAL), offset)?;
        E::from_ordinal(ordinal).ok_or(ClusterError::InvalidOrdinal {
            kind: E::NAME,
            value: ordinal,
        })
    }
}

impl From<Bytes> for ByteStack {
    fn from(data: Bytes) -> Self {
        Self::from_slice(&data)
    }
}

impl From<Vec<u8>> for ByteStack {
    fn from(data: Vec<u8>) -> Self {
        Self {
            buffer: BytesMut::from(&data[..]),
        }
    }
}

impl fmt::Debug for ByteStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteStack")
            .field("count", &self.buffer.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Mode {
        Idle,
        Walking,
        Running,
    }

    impl StackEnum for Mode {
        const MAX_ORDINAL: u64 = 2;
        const NAME: &'static str = "Mode";

        fn ordinal(self) -> u64 {
            self as u64
        }

        fn from_ordinal(ordinal: u64) -> Option<Self> {
            match ordinal {
                0 => Some(Mode::Idle),
                1 => Some(Mode::Walking),
                2 => Some(Mode::Running),
                _ => None,
            }
        }
    }

    #[test]
    fn test_lifo_order() {
        let mut stack = ByteStack::new();
        stack.push_i32(-7);
        stack.push_bool(true);
        stack.push_f32(1.5);
        stack.push_str("hello");
        stack.push_i64(i64::MIN + 3);

        assert_eq!(stack.pop_i64().unwrap(), i64::MIN + 3);
        assert_eq!(stack.pop_str().unwrap(), "hello");
        assert_eq!(stack.pop_f32().unwrap(), 1.5);
        assert!(stack.pop_bool().unwrap());
        assert_eq!(stack.pop_i32().unwrap(), -7);
        assert!(stack.is_empty());
    }

    #[test]
    fn test_msb_on_top() {
        let mut stack = ByteStack::new();
        stack.push_uint(0x0102_03, 3);
        assert_eq!(stack.as_slice(), &[0x03, 0x02, 0x01]);
        assert_eq!(stack.peek_byte(0).unwrap(), 0x01);
        assert_eq!(stack.pop_uint(3).unwrap(), 0x0102_03);
    }

    #[test]
    fn test_null_and_empty_strings() {
        let mut stack = ByteStack::new();
        stack.push_string(None);
        stack.push_string(Some(""));

        assert_eq!(stack.pop_string().unwrap(), Some(String::new()));
        assert_eq!(stack.pop_string().unwrap(), None);
    }

    #[test]
    fn test_underflow_is_error() {
        let mut stack = ByteStack::new();
        stack.push_byte(1);

        let result = stack.pop_i32();
        assert!(matches!(
            result,
            Err(ClusterError::StackUnderflow { requested: 4, available: 1 })
        ));
        assert_eq!(stack.count(), 1);

        assert!(ByteStack::new().pop_byte().is_err());
    }

    #[test]
    fn test_peek_with_offset() {
        let mut stack = ByteStack::new();
        stack.push_i32(42);
        stack.push_byte(9);

        assert_eq!(stack.peek_byte(0).unwrap(), 9);
        assert_eq!(stack.peek_i32(1).unwrap(), 42);
        assert_eq!(stack.count(), 5);
    }

    #[test]
    fn test_enum_uses_minimal_bytes() {
        let mut stack = ByteStack::new();
        stack.push_enum(Mode::Running);
        assert_eq!(stack.count(), 1);
        assert_eq!(stack.peek_enum::<Mode>(0).unwrap(), Mode::Running);
        assert_eq!(stack.pop_enum::<Mode>().unwrap(), Mode::Running);

        stack.push_byte(7);
        assert!(matches!(
            stack.pop_enum::<Mode>(),
            Err(ClusterError::InvalidOrdinal { kind: "Mode", value: 7 })
        ));
    }

    #[test]
    fn test_bytes_keep_order() {
        let mut stack = ByteStack::new();
        stack.push_bytes_with_length(&[1, 2, 3]);
        stack.push_f64(-0.25);

        let frozen = stack.to_bytes();
        let mut copy = ByteStack::from(frozen);

        assert_eq!(copy.pop_f64().unwrap(), -0.25);
        assert_eq!(copy.pop_bytes_with_length().unwrap(), vec![1, 2, 3]);
    }
}
