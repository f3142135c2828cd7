//! Value and action encodings.

use bytes::Bytes;

use super::{DnaError, StringCodec};
use crate::buffers::{ByteBufferInput, ByteBufferOutput};
use crate::wire::ProtocolError;

// ── Type ids ──────────────────────────────────────────────────────────────────

const TYPE_ID_REFERENCE: u8 = 1;
const TYPE_ID_BOOLEAN: u8 = 2;
const TYPE_ID_BYTE: u8 = 3;
const TYPE_ID_CHAR: u8 = 4;
const TYPE_ID_DOUBLE: u8 = 5;
const TYPE_ID_FLOAT: u8 = 6;
const TYPE_ID_INT: u8 = 7;
const TYPE_ID_LONG: u8 = 10;
const TYPE_ID_SHORT: u8 = 11;
const TYPE_ID_STRING: u8 = 12;
const TYPE_ID_STRING_BYTES: u8 = 13;
const TYPE_ID_ARRAY: u8 = 14;
const TYPE_ID_CLASS: u8 = 15;
const TYPE_ID_ENUM: u8 = 22;

const ARRAY_TYPE_PRIMITIVE: u8 = 1;
const ARRAY_TYPE_NON_PRIMITIVE: u8 = 2;

const LOGICAL_ACTION: u8 = 1;
const PHYSICAL_ACTION: u8 = 2;
const ARRAY_ELEMENT_ACTION: u8 = 3;
const ENTIRE_ARRAY_ACTION: u8 = 4;
const LITERAL_VALUE_ACTION: u8 = 5;
const PHYSICAL_REF_ACTION: u8 = 6;
const SUB_ARRAY_ACTION: u8 = 7;

/// Logical change id meaning "none".
const NO_CHANGE_ID: i64 = -1;

// ── Values ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum DnaValue {
    /// Another shared object, by id.
    Reference(i64),
    Boolean(bool),
    Byte(i8),
    /// UTF-16 code unit.
    Char(u16),
    Double(f64),
    Float(f32),
    Int(i32),
    Long(i64),
    Short(i16),
    String(String),
    /// Pre-encoded string bytes.
    StringBytes(Bytes),
    /// `None` is the null array.
    Array(Option<DnaArray>),
    /// A class, by name.
    Class(String),
    Enum { class: String, name: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum DnaArray {
    Boolean(Vec<bool>),
    Byte(Bytes),
    Char(Vec<u16>),
    Short(Vec<i16>),
    Int(Vec<i32>),
    Long(Vec<i64>),
    Float(Vec<f32>),
    Double(Vec<f64>),
    Object(Vec<DnaValue>),
}

impl DnaArray {
    pub fn len(&self) -> usize {
        match self {
            DnaArray::Boolean(v) => v.len(),
            DnaArray::Byte(v) => v.len(),
            DnaArray::Char(v) => v.len(),
            DnaArray::Short(v) => v.len(),
            DnaArray::Int(v) => v.len(),
            DnaArray::Long(v) => v.len(),
            DnaArray::Float(v) => v.len(),
            DnaArray::Double(v) => v.len(),
            DnaArray::Object(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Actions ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum DnaAction {
    /// Set a field. `is_reference` marks the value as an object reference.
    Physical {
        field: String,
        value: DnaValue,
        is_reference: bool,
    },
    /// Replay a method call.
    Logical {
        method: i32,
        params: Vec<DnaValue>,
        change_id: Option<i64>,
    },
    ArrayElement { index: i32, value: DnaValue },
    EntireArray(Option<DnaArray>),
    SubArray { start: i32, array: DnaArray },
    Literal(DnaValue),
}

// ── Encoding ──────────────────────────────────────────────────────────────────

pub(crate) fn encode_action<S: StringCodec>(
    out: &mut ByteBufferOutput,
    strings: &mut S,
    action: &DnaAction,
) -> Result<(), DnaError> {
    match action {
        DnaAction::Physical {
            field,
            value,
            is_reference,
        } => {
            out.write_u8(if *is_reference {
                PHYSICAL_REF_ACTION
            } else {
                PHYSICAL_ACTION
            });
            strings.write_string(out, field)?;
            encode_value(out, strings, value)?;
        }
        DnaAction::Logical {
            method,
            params,
            change_id,
        } => {
            out.write_u8(LOGICAL_ACTION);
            out.write_i32(*method);
            out.write_i64(change_id.unwrap_or(NO_CHANGE_ID));
            out.write_length(params.len())?;
            for param in params {
                encode_value(out, strings, param)?;
            }
        }
        DnaAction::ArrayElement { index, value } => {
            out.write_u8(ARRAY_ELEMENT_ACTION);
            out.write_i32(*index);
            encode_value(out, strings, value)?;
        }
        DnaAction::EntireArray(array) => {
            out.write_u8(ENTIRE_ARRAY_ACTION);
            encode_array(out, strings, array.as_ref())?;
        }
        DnaAction::SubArray { start, array } => {
            out.write_u8(SUB_ARRAY_ACTION);
            out.write_i32(*start);
            encode_array(out, strings, Some(array))?;
        }
        DnaAction::Literal(value) => {
            out.write_u8(LITERAL_VALUE_ACTION);
            encode_value(out, strings, value)?;
        }
    }
    Ok(())
}

pub(crate) fn encode_value<S: StringCodec>(
    out: &mut ByteBufferOutput,
    strings: &mut S,
    value: &DnaValue,
) -> Result<(), DnaError> {
    match value {
        DnaValue::Reference(id) => {
            out.write_u8(TYPE_ID_REFERENCE);
            out.write_i64(*id);
        }
        DnaValue::Boolean(v) => {
            out.write_u8(TYPE_ID_BOOLEAN);
            out.write_bool(*v);
        }
        DnaValue::Byte(v) => {
            out.write_u8(TYPE_ID_BYTE);
            out.write_i8(*v);
        }
        DnaValue::Char(v) => {
            out.write_u8(TYPE_ID_CHAR);
            out.write_char(*v);
        }
        DnaValue::Double(v) => {
            out.write_u8(TYPE_ID_DOUBLE);
            out.write_f64(*v);
        }
        DnaValue::Float(v) => {
            out.write_u8(TYPE_ID_FLOAT);
            out.write_f32(*v);
        }
        DnaValue::Int(v) => {
            out.write_u8(TYPE_ID_INT);
            out.write_i32(*v);
        }
        DnaValue::Long(v) => {
            out.write_u8(TYPE_ID_LONG);
            out.write_i64(*v);
        }
        DnaValue::Short(v) => {
            out.write_u8(TYPE_ID_SHORT);
            out.write_i16(*v);
        }
        DnaValue::String(s) => {
            out.write_u8(TYPE_ID_STRING);
            strings.write_string(out, s)?;
        }
        DnaValue::StringBytes(b) => {
            out.write_u8(TYPE_ID_STRING_BYTES);
            strings.write_string_bytes(out, b)?;
        }
        DnaValue::Array(array) => encode_array(out, strings, array.as_ref())?,
        DnaValue::Class(name) => {
            out.write_u8(TYPE_ID_CLASS);
            strings.write_string(out, name)?;
        }
        DnaValue::Enum { class, name } => {
            out.write_u8(TYPE_ID_ENUM);
            strings.write_string(out, class)?;
            strings.write_string(out, name)?;
        }
    }
    Ok(())
}

/// `[14][len:i32 (-1 = null)][1|2]{elemType}{elements}`
fn encode_array<S: StringCodec>(
    out: &mut ByteBufferOutput,
    strings: &mut S,
    array: Option<&DnaArray>,
) -> Result<(), DnaError> {
    out.write_u8(TYPE_ID_ARRAY);
    let Some(array) = array else {
        out.write_i32(-1);
        return Ok(());
    };
    out.write_length(array.len())?;
    if let DnaArray::Object(values) = array {
        out.write_u8(ARRAY_TYPE_NON_PRIMITIVE);
        for v in values {
            encode_value(out, strings, v)?;
        }
        return Ok(());
    }

    out.write_u8(ARRAY_TYPE_PRIMITIVE);
    match array {
        DnaArray::Boolean(v) => {
            out.write_u8(TYPE_ID_BOOLEAN);
            v.iter().for_each(|x| out.write_bool(*x));
        }
        DnaArray::Byte(v) => {
            out.write_u8(TYPE_ID_BYTE);
            out.write_bytes(v);
        }
        DnaArray::Char(v) => {
            out.write_u8(TYPE_ID_CHAR);
            v.iter().for_each(|x| out.write_char(*x));
        }
        DnaArray::Short(v) => {
            out.write_u8(TYPE_ID_SHORT);
            v.iter().for_each(|x| out.write_i16(*x));
        }
        DnaArray::Int(v) => {
            out.write_u8(TYPE_ID_INT);
            v.iter().for_each(|x| out.write_i32(*x));
        }
        DnaArray::Long(v) => {
            out.write_u8(TYPE_ID_LONG);
            v.iter().for_each(|x| out.write_i64(*x));
        }
        DnaArray::Float(v) => {
            out.write_u8(TYPE_ID_FLOAT);
            v.iter().for_each(|x| out.write_f32(*x));
        }
        DnaArray::Double(v) => {
            out.write_u8(TYPE_ID_DOUBLE);
            v.iter().for_each(|x| out.write_f64(*x));
        }
        DnaArray::Object(_) => {}
    }
    Ok(())
}

// ── Decoding ──────────────────────────────────────────────────────────────────

pub(crate) fn decode_action<S: StringCodec>(
    input: &mut ByteBufferInput,
    strings: &S,
) -> Result<DnaAction, DnaError> {
    let action = match input.read_u8()? {
        tag @ (PHYSICAL_ACTION | PHYSICAL_REF_ACTION) => DnaAction::Physical {
            field: strings.read_string(input)?,
            value: decode_value(input, strings)?,
            is_reference: tag == PHYSICAL_REF_ACTION,
        },
        LOGICAL_ACTION => {
            let method = input.read_i32()?;
            let change_id = match input.read_i64()? {
                NO_CHANGE_ID => None,
                id => Some(id),
            };
            let count = read_len(input)?;
            let mut params = Vec::with_capacity(count.min(input.available()));
            for _ in 0..count {
                params.push(decode_value(input, strings)?);
            }
            DnaAction::Logical {
                method,
                params,
                change_id,
            }
        }
        ARRAY_ELEMENT_ACTION => DnaAction::ArrayElement {
            index: input.read_i32()?,
            value: decode_value(input, strings)?,
        },
        ENTIRE_ARRAY_ACTION => DnaAction::EntireArray(decode_array_value(input, strings)?),
        SUB_ARRAY_ACTION => {
            let start = input.read_i32()?;
            let array = decode_array_value(input, strings)?
                .ok_or_else(|| DnaError::Malformed("null sub-array".into()))?;
            DnaAction::SubArray { start, array }
        }
        LITERAL_VALUE_ACTION => DnaAction::Literal(decode_value(input, strings)?),
        tag => return Err(DnaError::UnknownActionType(tag)),
    };
    Ok(action)
}

/// Object arrays nested deeper than this are rejected as malformed.
pub(crate) const MAX_ARRAY_DEPTH: usize = 64;

pub(crate) fn decode_value<S: StringCodec>(
    input: &mut ByteBufferInput,
    strings: &S,
) -> Result<DnaValue, DnaError> {
    decode_nested_value(input, strings, 0)
}

fn decode_nested_value<S: StringCodec>(
    input: &mut ByteBufferInput,
    strings: &S,
    depth: usize,
) -> Result<DnaValue, DnaError> {
    let value = match input.read_u8()? {
        TYPE_ID_REFERENCE => DnaValue::Reference(input.read_i64()?),
        TYPE_ID_BOOLEAN => DnaValue::Boolean(input.read_bool()?),
        TYPE_ID_BYTE => DnaValue::Byte(input.read_i8()?),
        TYPE_ID_CHAR => DnaValue::Char(input.read_char()?),
        TYPE_ID_DOUBLE => DnaValue::Double(input.read_f64()?),
        TYPE_ID_FLOAT => DnaValue::Float(input.read_f32()?),
        TYPE_ID_INT => DnaValue::Int(input.read_i32()?),
        TYPE_ID_LONG => DnaValue::Long(input.read_i64()?),
        TYPE_ID_SHORT => DnaValue::Short(input.read_i16()?),
        TYPE_ID_STRING => DnaValue::String(strings.read_string(input)?),
        TYPE_ID_STRING_BYTES => DnaValue::StringBytes(strings.read_string_bytes(input)?),
        TYPE_ID_ARRAY => DnaValue::Array(decode_array_body(input, strings, depth)?),
        TYPE_ID_CLASS => DnaValue::Class(strings.read_string(input)?),
        TYPE_ID_ENUM => DnaValue::Enum {
            class: strings.read_string(input)?,
            name: strings.read_string(input)?,
        },
        tag => return Err(DnaError::UnknownValueType(tag)),
    };
    Ok(value)
}

fn decode_array_value<S: StringCodec>(
    input: &mut ByteBufferInput,
    strings: &S,
) -> Result<Option<DnaArray>, DnaError> {
    match input.read_u8()? {
        TYPE_ID_ARRAY => decode_array_body(input, strings, 0),
        tag => Err(DnaError::UnknownValueType(tag)),
    }
}

fn decode_array_body<S: StringCodec>(
    input: &mut ByteBufferInput,
    strings: &S,
    depth: usize,
) -> Result<Option<DnaArray>, DnaError> {
    if depth >= MAX_ARRAY_DEPTH {
        return Err(DnaError::Malformed("array nesting too deep".into()));
    }
    let len = input.read_i32()?;
    if len < 0 {
        return Ok(None);
    }
    let len = len as usize;
    let array = match input.read_u8()? {
        ARRAY_TYPE_NON_PRIMITIVE => {
            let mut values = Vec::with_capacity(len.min(input.available()));
            for _ in 0..len {
                values.push(decode_nested_value(input, strings, depth + 1)?);
            }
            DnaArray::Object(values)
        }
        ARRAY_TYPE_PRIMITIVE => match input.read_u8()? {
            TYPE_ID_BOOLEAN => DnaArray::Boolean(read_n(input, len, |i| i.read_bool())?),
            TYPE_ID_BYTE => DnaArray::Byte(input.read_bytes(len)?),
            TYPE_ID_CHAR => DnaArray::Char(read_n(input, len, |i| i.read_char())?),
            TYPE_ID_SHORT => DnaArray::Short(read_n(input, len, |i| i.read_i16())?),
            TYPE_ID_INT => DnaArray::Int(read_n(input, len, |i| i.read_i32())?),
            TYPE_ID_LONG => DnaArray::Long(read_n(input, len, |i| i.read_i64())?),
            TYPE_ID_FLOAT => DnaArray::Float(read_n(input, len, |i| i.read_f32())?),
            TYPE_ID_DOUBLE => DnaArray::Double(read_n(input, len, |i| i.read_f64())?),
            tag => return Err(DnaError::UnknownValueType(tag)),
        },
        tag => return Err(DnaError::UnknownArrayType(tag)),
    };
    Ok(Some(array))
}

fn read_n<T, E>(
    input: &mut ByteBufferInput,
    len: usize,
    mut read: impl FnMut(&mut ByteBufferInput) -> Result<T, E>,
) -> Result<Vec<T>, DnaError>
where
    DnaError: From<E>,
{
    let mut out = Vec::with_capacity(len.min(input.available()));
    for _ in 0..len {
        out.push(read(input)?);
    }
    Ok(out)
}

fn read_len(input: &mut ByteBufferInput) -> Result<usize, DnaError> {
    let len = input.read_i32()?;
    if len < 0 {
        return Err(ProtocolError::NegativeCount(len).into());
    }
    Ok(len as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::ChunkPool;
    use crate::dna::{InlineStrings, ObjectStringSerializer};

    fn round_trip_with<S: StringCodec>(strings: &mut S, action: &DnaAction) -> DnaAction {
        let pool = ChunkPool::default();
        let mut out = ByteBufferOutput::new(&pool);
        encode_action(&mut out, strings, action).unwrap();
        let mut input = out.into_input();
        let decoded = decode_action(&mut input, strings).unwrap();
        assert_eq!(input.available(), 0);
        decoded
    }

    fn samples() -> Vec<DnaAction> {
        vec![
            DnaAction::Physical {
                field: "count".into(),
                value: DnaValue::Int(42),
                is_reference: false,
            },
            DnaAction::Physical {
                field: "next".into(),
                value: DnaValue::Reference(1001),
                is_reference: true,
            },
            DnaAction::Logical {
                method: 3,
                params: vec![
                    DnaValue::String("key".into()),
                    DnaValue::Enum {
                        class: "Color".into(),
                        name: "RED".into(),
                    },
                    DnaValue::Array(None),
                ],
                change_id: Some(77),
            },
            DnaAction::Logical {
                method: 9,
                params: vec![],
                change_id: None,
            },
            DnaAction::ArrayElement {
                index: 4,
                value: DnaValue::Char(0x263a),
            },
            DnaAction::EntireArray(Some(DnaArray::Long(vec![1, -2, 3]))),
            DnaAction::EntireArray(Some(DnaArray::Object(vec![
                DnaValue::Double(0.5),
                DnaValue::Class("Foo".into()),
                DnaValue::StringBytes(Bytes::from_static(b"utf")),
            ]))),
            DnaAction::SubArray {
                start: 2,
                array: DnaArray::Byte(Bytes::from_static(&[1, 2, 3])),
            },
            DnaAction::Literal(DnaValue::Short(-7)),
        ]
    }

    #[test]
    fn actions_round_trip_inline() {
        for action in samples() {
            assert_eq!(round_trip_with(&mut InlineStrings, &action), action);
        }
    }

    #[test]
    fn actions_round_trip_interned() {
        let mut dict = ObjectStringSerializer::new();
        for action in samples() {
            assert_eq!(round_trip_with(&mut dict, &action), action);
        }
        assert!(dict.string(1).is_some());
    }

    #[test]
    fn null_array_layout() {
        let pool = ChunkPool::default();
        let mut out = ByteBufferOutput::new(&pool);
        encode_value(&mut out, &mut InlineStrings, &DnaValue::Array(None)).unwrap();
        let bytes: Vec<u8> = out.finalize().iter().flat_map(|c| c.iter().copied()).collect();
        assert_eq!(bytes, vec![TYPE_ID_ARRAY, 0xff, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn unknown_tags_are_rejected() {
        let mut input = ByteBufferInput::from(Bytes::from_static(&[99]));
        assert_eq!(
            decode_value(&mut input, &InlineStrings),
            Err(DnaError::UnknownValueType(99))
        );
        let mut input = ByteBufferInput::from(Bytes::from_static(&[42]));
        assert_eq!(
            decode_action(&mut input, &InlineStrings),
            Err(DnaError::UnknownActionType(42))
        );
        let mut input = ByteBufferInput::from(Bytes::from_static(&[14, 0, 0, 0, 1, 9]));
        assert_eq!(
            decode_value(&mut input, &InlineStrings),
            Err(DnaError::UnknownArrayType(9))
        );
    }

    fn nested_object_arrays(levels: usize) -> Bytes {
        let mut bytes = Vec::with_capacity(levels * 6 + 5);
        for _ in 0..levels {
            bytes.extend_from_slice(&[TYPE_ID_ARRAY, 0, 0, 0, 1, ARRAY_TYPE_NON_PRIMITIVE]);
        }
        bytes.extend_from_slice(&[TYPE_ID_INT, 0, 0, 0, 0]);
        Bytes::from(bytes)
    }

    #[test]
    fn deep_array_nesting_is_malformed() {
        let mut input = ByteBufferInput::from(nested_object_arrays(200_000));
        assert_eq!(
            decode_value(&mut input, &InlineStrings),
            Err(DnaError::Malformed("array nesting too deep".into()))
        );

        let mut input = ByteBufferInput::from(nested_object_arrays(MAX_ARRAY_DEPTH));
        assert!(decode_value(&mut input, &InlineStrings).is_ok());
        let mut input = ByteBufferInput::from(nested_object_arrays(MAX_ARRAY_DEPTH + 1));
        assert!(matches!(
            decode_value(&mut input, &InlineStrings),
            Err(DnaError::Malformed(_))
        ));
    }
}
