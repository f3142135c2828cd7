//! Read side: walk the actions and metadata of one record.

use bytes::Bytes;

use super::encoding::decode_action;
use super::{
    DnaAction, DnaError, DnaHeader, StringCodec, FIXED_HEADER_LENGTH, HAS_ARRAY_LENGTH,
    HAS_PARENT_ID, HAS_VERSION, IGNORE_MISSING_OBJECT, IS_DELTA,
};
use crate::buffers::ByteBufferInput;
use crate::wire::ProtocolError;

/// Cursor over one record. Actions and metadata are read through separate
/// views, so either can be replayed without touching the other.
pub struct DnaCursor<'s, S> {
    strings: &'s S,
    header: DnaHeader,
    total_length: usize,
    action_count: i32,
    actions_read: i32,
    actions: ByteBufferInput,
    metadata: ByteBufferInput,
}

impl<'s, S: StringCodec> DnaCursor<'s, S> {
    /// Parse the record at the current position of `input` and move
    /// `input` past it.
    pub fn read(input: &mut ByteBufferInput, strings: &'s S) -> Result<Self, DnaError> {
        let start = input.position();
        let total_length = input.read_i32()?;
        let action_count = input.read_i32()?;
        let meta_offset = input.read_i32()?;
        for v in [total_length, action_count, meta_offset] {
            if v < 0 {
                return Err(ProtocolError::NegativeCount(v).into());
            }
        }
        let total_length = total_length as usize;
        let meta_offset = meta_offset as usize;

        let flags = input.read_u8()?;
        let object_id = input.read_i64()?;
        let is_delta = flags & IS_DELTA != 0;
        let class_name = if is_delta {
            None
        } else {
            Some(strings.read_string(input)?)
        };
        let version = read_if(flags, HAS_VERSION, || input.read_i64())?;
        let parent_id = read_if(flags, HAS_PARENT_ID, || input.read_i64())?;
        let array_length = read_if(flags, HAS_ARRAY_LENGTH, || input.read_i32())?;
        let header = DnaHeader {
            object_id,
            class_name,
            is_delta,
            version,
            parent_id,
            array_length,
            ignore_missing: flags & IGNORE_MISSING_OBJECT != 0,
        };

        let header_len = input.position() - start;
        debug_assert!(header_len >= FIXED_HEADER_LENGTH);
        if total_length < header_len {
            return Err(DnaError::Malformed(format!(
                "total length {total_length} shorter than header {header_len}"
            )));
        }
        let action_end = if meta_offset == 0 {
            total_length
        } else {
            meta_offset
        };
        if action_end < header_len || action_end > total_length {
            return Err(DnaError::Malformed(format!(
                "metadata offset {meta_offset} outside record of {total_length} bytes"
            )));
        }

        let actions = input.duplicate_and_limit(action_end - header_len)?;
        input.skip(action_end - header_len);
        let metadata = input.duplicate_and_limit(total_length - action_end)?;
        input.skip(total_length - action_end);

        Ok(Self {
            strings,
            header,
            total_length,
            action_count,
            actions_read: 0,
            actions,
            metadata,
        })
    }

    pub fn header(&self) -> &DnaHeader {
        &self.header
    }

    pub fn object_id(&self) -> i64 {
        self.header.object_id
    }

    pub fn class_name(&self) -> Option<&str> {
        self.header.class_name.as_deref()
    }

    pub fn version(&self) -> Option<i64> {
        self.header.version
    }

    pub fn is_delta(&self) -> bool {
        self.header.is_delta
    }

    pub fn action_count(&self) -> i32 {
        self.action_count
    }

    pub fn total_length(&self) -> usize {
        self.total_length
    }

    /// Next action, or `None` after the last one.
    pub fn next_action(&mut self) -> Result<Option<DnaAction>, DnaError> {
        if self.actions_read == self.action_count {
            if self.actions.available() != 0 {
                return Err(DnaError::Malformed(format!(
                    "{} bytes after the last action",
                    self.actions.available()
                )));
            }
            return Ok(None);
        }
        let action = decode_action(&mut self.actions, self.strings)?;
        self.actions_read += 1;
        Ok(Some(action))
    }

    /// Every remaining action.
    pub fn actions(&mut self) -> Result<Vec<DnaAction>, DnaError> {
        let mut out = Vec::with_capacity((self.action_count - self.actions_read) as usize);
        while let Some(action) = self.next_action()? {
            out.push(action);
        }
        Ok(out)
    }

    /// Next metadata block, or `None` when there are no more.
    pub fn next_meta_data(&mut self) -> Result<Option<Bytes>, DnaError> {
        if self.metadata.available() == 0 {
            return Ok(None);
        }
        Ok(Some(self.metadata.read_byte_array()?))
    }
}

fn read_if<T, E>(flags: u8, bit: u8, read: impl FnOnce() -> Result<T, E>) -> Result<Option<T>, E> {
    if flags & bit == 0 {
        return Ok(None);
    }
    read().map(Some)
}

impl<S> std::fmt::Debug for DnaCursor<'_, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DnaCursor")
            .field("header", &self.header)
            .field("action_count", &self.action_count)
            .field("actions_read", &self.actions_read)
            .finish()
    }
}
