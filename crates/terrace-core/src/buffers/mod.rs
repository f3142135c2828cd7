//! Zero-copy byte buffer streams.
//!
//! Output streams build a list of chunks that are later handed to a wire
//! message without copying. Input streams read a list of chunks through a
//! cursor that can be duplicated, marked, rewound and limited.
//!
//! Neither stream type is safe for concurrent use. Hand another thread its
//! own cursor with [`ByteBufferInput::duplicate`].

mod input;
mod output;
mod pool;
mod strings;

pub use input::{ByteBufferInput, InputMark};
pub use output::{ByteBufferOutput, OutputMark};
pub use pool::ChunkPool;

use std::sync::atomic::{AtomicU64, Ordering};

// ── Constants ─────────────────────────────────────────────────────────────────

/// First chunk size of a default output stream.
pub const DEFAULT_INITIAL_BLOCK_SIZE: usize = 32;

/// Chunk growth ceiling and consolidation target of a default output stream.
pub const DEFAULT_MAX_BLOCK_SIZE: usize = 512 * 1024;

/// Capacity of chunks retained by the pool.
pub const DEFAULT_POOLED_CHUNK_SIZE: usize = 4096;

/// Free chunks retained by the pool.
pub const DEFAULT_MAX_POOLED_CHUNKS: usize = 1024;

/// String discriminator: modified UTF-8 with a 2-byte length.
pub const STRING_ENCODING_UTF: u8 = 0;

/// String discriminator: raw UTF-16 code units with a 4-byte count.
pub const STRING_ENCODING_RAW: u8 = 1;

/// Longest modified UTF-8 payload the short encoding can carry.
pub const MAX_UTF_ENCODED_LENGTH: usize = u16::MAX as usize;

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

/// Every stream instance gets a distinct id so marks can be checked
/// against the stream that produced them.
fn next_stream_id() -> u64 {
    NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed)
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Misuse of a buffer stream, or input that ran out early.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    #[error("invalid block sizes: initial {initial}, max {max}")]
    InvalidBlockSize { initial: usize, max: usize },

    #[error("range offset {offset} len {len} outside buffer of {size} bytes")]
    OutOfRange { offset: usize, len: usize, size: usize },

    #[error("mark belongs to a different stream")]
    ForeignMark,

    #[error("write of {len} bytes at mark {position} passes the {written} bytes written")]
    MarkOverrun {
        position: usize,
        len: usize,
        written: usize,
    },

    #[error("cannot write through a mark into a shared chunk at {position}")]
    SharedChunk { position: usize },

    #[error("end of stream: needed {needed} bytes, {available} available")]
    EndOfStream { needed: usize, available: usize },

    #[error("negative length prefix: {0}")]
    NegativeLength(i32),

    #[error("length {0} does not fit a 4-byte prefix")]
    LengthOverflow(usize),

    #[error("unknown string encoding tag: 0x{0:02x}")]
    UnknownStringEncoding(u8),

    #[error("string bytes are not valid modified UTF-8 / UTF-16")]
    InvalidString,
}

/// `len` as a 4-byte length prefix.
pub fn length_prefix(len: usize) -> Result<i32, StreamError> {
    i32::try_from(len).map_err(|_| StreamError::LengthOverflow(len))
}

/// Sum of chunk lengths.
pub fn total_len(chunks: &[bytes::Bytes]) -> usize {
    chunks.iter().map(|c| c.len()).sum()
}
