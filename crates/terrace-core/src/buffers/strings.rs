//! Modified UTF-8: the short string encoding.
//!
//! Works on UTF-16 code units: NUL and U+0080..U+07FF take two bytes,
//! U+0001..U+007F one byte, every other unit three bytes. Supplementary
//! characters are therefore written as two three-byte surrogates.

use super::StreamError;

pub(crate) fn encoded_len(s: &str) -> usize {
    s.encode_utf16().map(unit_len).sum()
}

fn unit_len(unit: u16) -> usize {
    match unit {
        0x0001..=0x007f => 1,
        0x0000 | 0x0080..=0x07ff => 2,
        _ => 3,
    }
}

pub(crate) fn encode(s: &str, out: &mut Vec<u8>) {
    for unit in s.encode_utf16() {
        match unit {
            0x0001..=0x007f => out.push(unit as u8),
            0x0000 | 0x0080..=0x07ff => {
                out.push(0xc0 | ((unit >> 6) & 0x1f) as u8);
                out.push(0x80 | (unit & 0x3f) as u8);
            }
            _ => {
                out.push(0xe0 | ((unit >> 12) & 0x0f) as u8);
                out.push(0x80 | ((unit >> 6) & 0x3f) as u8);
                out.push(0x80 | (unit & 0x3f) as u8);
            }
        }
    }
}

pub(crate) fn decode(bytes: &[u8]) -> Result<String, StreamError> {
    let mut units = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b0 = bytes[i] as u16;
        match b0 >> 4 {
            0x0..=0x7 => {
                units.push(b0);
                i += 1;
            }
            0xc | 0xd => {
                let b1 = continuation(bytes, i + 1)?;
                units.push(((b0 & 0x1f) << 6) | b1);
                i += 2;
            }
            0xe => {
                let b1 = continuation(bytes, i + 1)?;
                let b2 = continuation(bytes, i + 2)?;
                units.push(((b0 & 0x0f) << 12) | (b1 << 6) | b2);
                i += 3;
            }
            _ => return Err(StreamError::InvalidString),
        }
    }
    String::from_utf16(&units).map_err(|_| StreamError::InvalidString)
}

fn continuation(bytes: &[u8], at: usize) -> Result<u16, StreamError> {
    match bytes.get(at) {
        Some(&b) if b & 0xc0 == 0x80 => Ok((b & 0x3f) as u16),
        _ => Err(StreamError::InvalidString),
    }
}
