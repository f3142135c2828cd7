//! Message header: a fixed 16-byte base followed by 4-byte-aligned options.

use bytes::{BufMut, Bytes, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::network_endian::{U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use super::{MessageError, MessageType, ProtocolError};

/// The only protocol version this implementation speaks.
pub const PROTOCOL_VERSION: u8 = 1;

/// Length of [`HeaderBase`]; a header without options.
pub const MIN_HEADER_LENGTH: usize = 16;

/// Header length is carried in one byte as a count of 4-byte words.
pub const MAX_HEADER_LENGTH: usize = u8::MAX as usize * 4;

// ── Header base ───────────────────────────────────────────────────────────────

/// Fixed part of every message header. Multi-byte fields are big-endian.
///
/// Wire size: 16 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct HeaderBase {
    /// Must equal [`PROTOCOL_VERSION`]. Anything else is fatal.
    pub version: u8,

    /// Total header length divided by 4, options included.
    pub header_words: u8,

    /// Numeric [`MessageType`].
    pub message_type: U16,

    /// Per-type payload version.
    pub type_version: U16,

    /// Reserved, must be zero.
    pub reserved: U16,

    /// Payload bytes following the header. Values above `i32::MAX` are
    /// corrupt.
    pub data_length: U32,

    /// Adler-32 of the whole header computed with this field zeroed.
    /// 0 = not computed.
    pub checksum: U32,
}

// Compile-time size guard.
assert_eq_size!(HeaderBase, [u8; 16]);

// ── Header ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireHeader {
    base: HeaderBase,
    /// Option bytes, already zero-padded to a multiple of 4.
    options: Vec<u8>,
}

impl WireHeader {
    pub fn new(message_type: MessageType) -> Self {
        Self::with_type(message_type.into(), 0)
    }

    pub fn with_type(message_type: u16, type_version: u16) -> Self {
        Self {
            base: HeaderBase {
                version: PROTOCOL_VERSION,
                header_words: (MIN_HEADER_LENGTH / 4) as u8,
                message_type: U16::new(message_type),
                type_version: U16::new(type_version),
                reserved: U16::new(0),
                data_length: U32::new(0),
                checksum: U32::new(0),
            },
            options: Vec::new(),
        }
    }

    /// Replace the option bytes. They are zero-padded to a multiple of 4 and
    /// count towards the header length.
    pub fn set_options(&mut self, options: &[u8]) -> Result<(), MessageError> {
        let padded = options.len().div_ceil(4) * 4;
        if MIN_HEADER_LENGTH + padded > MAX_HEADER_LENGTH {
            return Err(MessageError::OptionsTooLong(options.len()));
        }
        self.options = options.to_vec();
        self.options.resize(padded, 0);
        self.base.header_words = ((MIN_HEADER_LENGTH + padded) / 4) as u8;
        Ok(())
    }

    pub fn options(&self) -> &[u8] {
        &self.options
    }

    pub fn header_length(&self) -> usize {
        self.base.header_words as usize * 4
    }

    pub fn version(&self) -> u8 {
        self.base.version
    }

    pub fn message_type(&self) -> u16 {
        self.base.message_type.get()
    }

    pub fn type_version(&self) -> u16 {
        self.base.type_version.get()
    }

    pub fn data_length(&self) -> u32 {
        self.base.data_length.get()
    }

    pub fn checksum(&self) -> u32 {
        self.base.checksum.get()
    }

    pub(crate) fn set_data_length(&mut self, len: u32) {
        self.base.data_length = U32::new(len);
    }

    /// Store the Adler-32 of the current header bytes.
    pub fn compute_checksum(&mut self) {
        self.base.checksum = U32::new(self.adler());
    }

    /// True when no checksum was stored or the stored one matches.
    pub fn is_checksum_valid(&self) -> bool {
        let stored = self.checksum();
        stored == 0 || stored == self.adler()
    }

    fn adler(&self) -> u32 {
        let mut base = self.base;
        base.checksum = U32::new(0);
        let mut hasher = adler::Adler32::new();
        hasher.write_slice(base.as_bytes());
        hasher.write_slice(&self.options);
        hasher.checksum()
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.header_length());
        buf.put_slice(self.base.as_bytes());
        buf.put_slice(&self.options);
        buf.freeze()
    }

    /// Header length declared by the first [`MIN_HEADER_LENGTH`] bytes.
    /// Checks only the version and the length range, so a receiver knows how
    /// many option bytes to wait for.
    pub fn declared_length(base: &[u8]) -> Result<usize, ProtocolError> {
        let base = HeaderBase::read_from_prefix(base)
            .ok_or(ProtocolError::BadHeaderLength(base.len()))?;
        if base.version != PROTOCOL_VERSION {
            return Err(ProtocolError::BadVersion(base.version));
        }
        let len = base.header_words as usize * 4;
        if len < MIN_HEADER_LENGTH {
            return Err(ProtocolError::BadHeaderLength(len));
        }
        Ok(len)
    }

    /// Parse and validate a header from the front of `bytes`.
    pub fn decode(bytes: &[u8], max_data_length: u32) -> Result<Self, ProtocolError> {
        let len = Self::declared_length(bytes)?;
        if bytes.len() < len {
            return Err(ProtocolError::BadHeaderLength(len));
        }
        let base = HeaderBase::read_from_prefix(bytes)
            .ok_or(ProtocolError::BadHeaderLength(bytes.len()))?;
        let header = Self {
            base,
            options: bytes[MIN_HEADER_LENGTH..len].to_vec(),
        };
        header.validate(max_data_length)?;
        Ok(header)
    }

    pub fn validate(&self, max_data_length: u32) -> Result<(), ProtocolError> {
        if self.base.version != PROTOCOL_VERSION {
            return Err(ProtocolError::BadVersion(self.base.version));
        }
        let reserved = self.base.reserved.get();
        if reserved != 0 {
            return Err(ProtocolError::ReservedBitsSet(reserved));
        }
        let data_length = self.data_length();
        if data_length > i32::MAX as u32 {
            return Err(ProtocolError::CorruptDataLength(data_length));
        }
        if data_length > max_data_length {
            return Err(ProtocolError::MessageTooLarge {
                len: data_length,
                max: max_data_length,
            });
        }
        if !self.is_checksum_valid() {
            return Err(ProtocolError::ChecksumMismatch {
                stored: self.checksum(),
                computed: self.adler(),
            });
        }
        Ok(())
    }
}
