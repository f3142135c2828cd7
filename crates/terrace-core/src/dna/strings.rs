//! String codecs for DNA: interned ids or inline strings.

use std::collections::HashMap;

use bytes::Bytes;

use crate::buffers::{ByteBufferInput, ByteBufferOutput, StreamError};
use crate::wire::ProtocolError;

/// How class names, field names and string values are put on the wire.
pub trait StringCodec {
    fn write_string(&mut self, out: &mut ByteBufferOutput, s: &str) -> Result<(), StreamError>;

    fn write_string_bytes(&mut self, out: &mut ByteBufferOutput, bytes: &[u8]) -> Result<(), StreamError>;

    fn read_string(&self, input: &mut ByteBufferInput) -> Result<String, ProtocolError>;

    fn read_string_bytes(&self, input: &mut ByteBufferInput) -> Result<Bytes, ProtocolError>;
}

// ── Inline ────────────────────────────────────────────────────────────────────

/// Writes every string in full. For standalone records that travel without
/// a dictionary.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineStrings;

impl StringCodec for InlineStrings {
    fn write_string(&mut self, out: &mut ByteBufferOutput, s: &str) -> Result<(), StreamError> {
        out.write_string(Some(s))
    }

    fn write_string_bytes(&mut self, out: &mut ByteBufferOutput, bytes: &[u8]) -> Result<(), StreamError> {
        out.write_byte_array(bytes)
    }

    fn read_string(&self, input: &mut ByteBufferInput) -> Result<String, ProtocolError> {
        Ok(input.read_string()?.unwrap_or_default())
    }

    fn read_string_bytes(&self, input: &mut ByteBufferInput) -> Result<Bytes, ProtocolError> {
        Ok(input.read_byte_array()?)
    }
}

// ── Interning dictionary ──────────────────────────────────────────────────────

/// Append-only `string ⇄ id` and `bytes ⇄ id` dictionary. Each string is
/// written as an `[id:i32]`; the dictionary itself travels once alongside a
/// batch:
///
/// ```text
/// [stringCount:i32]{[string][id:i32]}  [byteKeyCount:i32]{[len:i32][bytes][id:i32]}
/// ```
///
/// Ids start at 1 and are never reassigned.
#[derive(Debug, Clone, Default)]
pub struct ObjectStringSerializer {
    string_ids: HashMap<String, i32>,
    bytes_ids: HashMap<Bytes, i32>,
    strings: HashMap<i32, String>,
    byte_keys: HashMap<i32, Bytes>,
    last_id: i32,
}

impl ObjectStringSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of interned entries of either kind.
    pub fn len(&self) -> usize {
        self.strings.len() + self.byte_keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Id for `s`, assigning the next one on first sight.
    pub fn intern(&mut self, s: &str) -> i32 {
        if let Some(&id) = self.string_ids.get(s) {
            return id;
        }
        self.last_id += 1;
        let id = self.last_id;
        self.string_ids.insert(s.to_string(), id);
        self.strings.insert(id, s.to_string());
        id
    }

    pub fn intern_bytes(&mut self, bytes: &[u8]) -> i32 {
        if let Some(&id) = self.bytes_ids.get(bytes) {
            return id;
        }
        self.last_id += 1;
        let id = self.last_id;
        let key = Bytes::copy_from_slice(bytes);
        self.bytes_ids.insert(key.clone(), id);
        self.byte_keys.insert(id, key);
        id
    }

    pub fn string(&self, id: i32) -> Option<&str> {
        self.strings.get(&id).map(String::as_str)
    }

    pub fn serialize(&self, out: &mut ByteBufferOutput) -> Result<(), StreamError> {
        let mut strings: Vec<(&i32, &String)> = self.strings.iter().collect();
        strings.sort_unstable_by_key(|(id, _)| **id);
        out.write_length(strings.len())?;
        for (id, s) in strings {
            out.write_string(Some(s))?;
            out.write_i32(*id);
        }

        let mut byte_keys: Vec<(&i32, &Bytes)> = self.byte_keys.iter().collect();
        byte_keys.sort_unstable_by_key(|(id, _)| **id);
        out.write_length(byte_keys.len())?;
        for (id, bytes) in byte_keys {
            out.write_byte_array(bytes)?;
            out.write_i32(*id);
        }
        Ok(())
    }

    /// Rebuild a dictionary. Null strings, non-positive ids and ids used
    /// twice (across both kinds) are rejected.
    pub fn deserialize(input: &mut ByteBufferInput) -> Result<Self, ProtocolError> {
        let mut dict = Self::new();

        let count = read_count(input)?;
        for _ in 0..count {
            let s = input
                .read_string()?
                .ok_or(ProtocolError::MissingValue("dictionary string"))?;
            let id = dict.claim_id(input)?;
            dict.string_ids.insert(s.clone(), id);
            dict.strings.insert(id, s);
        }

        let count = read_count(input)?;
        for _ in 0..count {
            let bytes = input.read_byte_array()?;
            let id = dict.claim_id(input)?;
            dict.bytes_ids.insert(bytes.clone(), id);
            dict.byte_keys.insert(id, bytes);
        }
        Ok(dict)
    }

    fn claim_id(&mut self, input: &mut ByteBufferInput) -> Result<i32, ProtocolError> {
        let id = input.read_i32()?;
        if id <= 0 {
            return Err(ProtocolError::InvalidDictionaryId(id));
        }
        if self.strings.contains_key(&id) || self.byte_keys.contains_key(&id) {
            return Err(ProtocolError::DuplicateDictionaryId(id));
        }
        self.last_id = self.last_id.max(id);
        Ok(id)
    }
}

fn read_count(input: &mut ByteBufferInput) -> Result<i32, ProtocolError> {
    let count = input.read_i32()?;
    if count < 0 {
        return Err(ProtocolError::NegativeCount(count));
    }
    Ok(count)
}

impl StringCodec for ObjectStringSerializer {
    fn write_string(&mut self, out: &mut ByteBufferOutput, s: &str) -> Result<(), StreamError> {
        let id = self.intern(s);
        out.write_i32(id);
        Ok(())
    }

    fn write_string_bytes(&mut self, out: &mut ByteBufferOutput, bytes: &[u8]) -> Result<(), StreamError> {
        let id = self.intern_bytes(bytes);
        out.write_i32(id);
        Ok(())
    }

    fn read_string(&self, input: &mut ByteBufferInput) -> Result<String, ProtocolError> {
        let id = input.read_i32()?;
        self.strings
            .get(&id)
            .cloned()
            .ok_or(ProtocolError::UnknownDictionaryId(id))
    }

    fn read_string_bytes(&self, input: &mut ByteBufferInput) -> Result<Bytes, ProtocolError> {
        let id = input.read_i32()?;
        self.byte_keys
            .get(&id)
            .cloned()
            .ok_or(ProtocolError::UnknownDictionaryId(id))
    }
}
