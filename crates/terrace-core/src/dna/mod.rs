//! DNA: serialized deltas (or full snapshots) of one object's state.
//!
//! Record layout, big-endian:
//!
//! ```text
//! [totalLength:i32][actionCount:i32][metaDataOffset:i32][flags:u8][objectId:i64]
//! {className:string      unless IS_DELTA}
//! {version:i64           if HAS_VERSION}
//! {parentId:i64          if HAS_PARENT_ID}
//! {arrayLength:i32       if HAS_ARRAY_LENGTH}
//! {actions...}
//! {[len:i32][bytes]...   metadata blocks}
//! ```
//!
//! `metaDataOffset` counts from the start of the record and is 0 when the
//! record has no metadata.

mod cursor;
mod encoding;
mod strings;
mod writer;

pub use cursor::DnaCursor;
pub use encoding::{DnaAction, DnaArray, DnaValue};
pub use strings::{InlineStrings, ObjectStringSerializer, StringCodec};
pub use writer::{DnaActions, DnaAppender, DnaBatch, DnaWriter};

use crate::buffers::StreamError;
use crate::wire::ProtocolError;

// ── Flags ─────────────────────────────────────────────────────────────────────

pub const IS_DELTA: u8 = 0x01;
pub const HAS_VERSION: u8 = 0x02;
pub const HAS_PARENT_ID: u8 = 0x04;
pub const HAS_ARRAY_LENGTH: u8 = 0x08;
pub const IGNORE_MISSING_OBJECT: u8 = 0x10;

/// Object id meaning "no object".
pub const NULL_OBJECT_ID: i64 = -1;

/// Fixed prefix: total length, action count, metadata offset, flags, object id.
const FIXED_HEADER_LENGTH: usize = 4 + 4 + 4 + 1 + 8;

// ── Header ────────────────────────────────────────────────────────────────────

/// Identity and optional fields of one DNA record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnaHeader {
    pub object_id: i64,
    pub class_name: Option<String>,
    pub is_delta: bool,
    pub version: Option<i64>,
    pub parent_id: Option<i64>,
    pub array_length: Option<i32>,
    pub ignore_missing: bool,
}

impl DnaHeader {
    /// Full object state. Carries its class name.
    pub fn object(object_id: i64, class_name: impl Into<String>) -> Self {
        Self {
            object_id,
            class_name: Some(class_name.into()),
            is_delta: false,
            version: None,
            parent_id: None,
            array_length: None,
            ignore_missing: false,
        }
    }

    /// Changes to an object the receiver already knows.
    pub fn delta(object_id: i64) -> Self {
        Self {
            object_id,
            class_name: None,
            is_delta: true,
            version: None,
            parent_id: None,
            array_length: None,
            ignore_missing: false,
        }
    }

    pub fn with_version(mut self, version: i64) -> Self {
        self.version = Some(version);
        self
    }

    pub fn with_parent(mut self, parent_id: i64) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn with_array_length(mut self, len: i32) -> Self {
        self.array_length = Some(len);
        self
    }

    pub fn ignoring_missing(mut self) -> Self {
        self.ignore_missing = true;
        self
    }

    pub fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.is_delta {
            flags |= IS_DELTA;
        }
        if self.version.is_some() {
            flags |= HAS_VERSION;
        }
        if self.parent_id.is_some() {
            flags |= HAS_PARENT_ID;
        }
        if self.array_length.is_some() {
            flags |= HAS_ARRAY_LENGTH;
        }
        if self.ignore_missing {
            flags |= IGNORE_MISSING_OBJECT;
        }
        flags
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DnaError {
    #[error("delta for object {0} has no actions")]
    EmptyDelta(i64),

    #[error("object {0} is not a delta and has no class name")]
    MissingClassName(i64),

    #[error("header already finalized")]
    AlreadyFinalized,

    #[error("header not finalized")]
    NotFinalized,

    #[error("unknown value type id: {0}")]
    UnknownValueType(u8),

    #[error("unknown action type: {0}")]
    UnknownActionType(u8),

    #[error("unknown array type: {0}")]
    UnknownArrayType(u8),

    #[error("malformed record: {0}")]
    Malformed(String),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
