//! Name-value message bodies: `[count:i32]{[name:u8][value]}`.
//!
//! Values use the buffer stream's own encodings. The reader dispatches each
//! pair to [`NvMessage::hydrate_value`]; a name the message does not know
//! is a protocol error.

use super::ProtocolError;
use crate::buffers::{ByteBufferInput, ByteBufferOutput, StreamError};

/// A typed message carried as name-value pairs.
pub trait NvMessage: Default {
    /// Write every field through `out`.
    fn dehydrate(&self, out: &mut NvWriter<'_>) -> Result<(), StreamError>;

    /// Read the value for `name` from `input`. Return `false` for a name
    /// this message does not define.
    fn hydrate_value(&mut self, name: u8, input: &mut ByteBufferInput) -> Result<bool, ProtocolError>;

    /// Cross-field checks after all pairs are read.
    fn finish(&self) -> Result<(), ProtocolError> {
        Ok(())
    }
}

/// Writes pairs and counts them. The count is backpatched when the body is
/// complete.
pub struct NvWriter<'a> {
    out: &'a mut ByteBufferOutput,
    count: i32,
}

impl NvWriter<'_> {
    fn name(&mut self, name: u8) -> &mut ByteBufferOutput {
        self.count += 1;
        self.out.write_u8(name);
        &mut *self.out
    }

    pub fn put_bool(&mut self, name: u8, v: bool) {
        self.name(name).write_bool(v);
    }

    pub fn put_u8(&mut self, name: u8, v: u8) {
        self.name(name).write_u8(v);
    }

    pub fn put_i16(&mut self, name: u8, v: i16) {
        self.name(name).write_i16(v);
    }

    pub fn put_i32(&mut self, name: u8, v: i32) {
        self.name(name).write_i32(v);
    }

    pub fn put_i64(&mut self, name: u8, v: i64) {
        self.name(name).write_i64(v);
    }

    pub fn put_f64(&mut self, name: u8, v: f64) {
        self.name(name).write_f64(v);
    }

    pub fn put_string(&mut self, name: u8, v: &str) -> Result<(), StreamError> {
        self.name(name).write_string(Some(v))
    }

    pub fn put_bytes(&mut self, name: u8, v: &[u8]) -> Result<(), StreamError> {
        self.name(name).write_byte_array(v)
    }

    /// A value with its own encoding.
    pub fn put_with<E>(
        &mut self,
        name: u8,
        write: impl FnOnce(&mut ByteBufferOutput) -> Result<(), E>,
    ) -> Result<(), E> {
        write(self.name(name))
    }
}

/// Append `message` to `out` as a name-value body.
pub fn encode<M: NvMessage>(message: &M, out: &mut ByteBufferOutput) -> Result<(), StreamError> {
    let count_at = out.mark();
    out.write_i32(0);
    let mut writer = NvWriter {
        out: &mut *out,
        count: 0,
    };
    message.dehydrate(&mut writer)?;
    let count = writer.count;
    count_at.write_i32(out, count)
}

/// Read one name-value body.
pub fn decode<M: NvMessage>(input: &mut ByteBufferInput) -> Result<M, ProtocolError> {
    let count = input.read_i32()?;
    if count < 0 {
        return Err(ProtocolError::NegativeCount(count));
    }
    let mut message = M::default();
    for _ in 0..count {
        let name = input.read_u8()?;
        if !message.hydrate_value(name, input)? {
            return Err(ProtocolError::UnknownName(name));
        }
    }
    message.finish()?;
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::ChunkPool;

    #[derive(Debug, Default, PartialEq)]
    struct StripeInfo {
        name: String,
        members: Vec<i64>,
        active: bool,
    }

    const NAME: u8 = 0;
    const MEMBER: u8 = 1;
    const ACTIVE: u8 = 2;

    impl NvMessage for StripeInfo {
        fn dehydrate(&self, out: &mut NvWriter<'_>) -> Result<(), StreamError> {
            out.put_string(NAME, &self.name)?;
            for m in &self.members {
                out.put_i64(MEMBER, *m);
            }
            out.put_bool(ACTIVE, self.active);
            Ok(())
        }

        fn hydrate_value(
            &mut self,
            name: u8,
            input: &mut ByteBufferInput,
        ) -> Result<bool, ProtocolError> {
            match name {
                NAME => self.name = input.read_string()?.unwrap_or_default(),
                MEMBER => self.members.push(input.read_i64()?),
                ACTIVE => self.active = input.read_bool()?,
                _ => return Ok(false),
            }
            Ok(true)
        }
    }

    #[test]
    fn repeated_names_round_trip() {
        let pool = ChunkPool::default();
        let info = StripeInfo {
            name: "stripe-1".into(),
            members: vec![3, 1, 2],
            active: true,
        };
        let mut out = ByteBufferOutput::new(&pool);
        encode(&info, &mut out).unwrap();
        let mut input = out.into_input();
        assert_eq!(input.duplicate().read_i32().unwrap(), 5);
        assert_eq!(decode::<StripeInfo>(&mut input).unwrap(), info);
        assert_eq!(input.available(), 0);
    }

    #[test]
    fn unknown_name_is_fatal() {
        let pool = ChunkPool::default();
        let mut out = ByteBufferOutput::new(&pool);
        out.write_i32(1);
        out.write_u8(99);
        out.write_i32(0);
        assert_eq!(
            decode::<StripeInfo>(&mut out.into_input()),
            Err(ProtocolError::UnknownName(99))
        );
    }

    #[test]
    fn negative_count_is_fatal() {
        let pool = ChunkPool::default();
        let mut out = ByteBufferOutput::new(&pool);
        out.write_i32(-2);
        assert_eq!(
            decode::<StripeInfo>(&mut out.into_input()),
            Err(ProtocolError::NegativeCount(-2))
        );
    }
}
