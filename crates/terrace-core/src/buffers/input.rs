//! Input stream: a read cursor over a list of frozen chunks.

use bytes::{Buf, Bytes, BytesMut};

use super::{next_stream_id, strings, StreamError, STRING_ENCODING_RAW, STRING_ENCODING_UTF};

/// Cursor over shared chunk storage. Cloning chunk views is cheap, so
/// [`duplicate`](Self::duplicate) and
/// [`duplicate_and_limit`](Self::duplicate_and_limit) never copy bytes.
///
/// Invariant: `offset < chunks[index].len()` unless `index == chunks.len()`.
pub struct ByteBufferInput {
    id: u64,
    chunks: Vec<Bytes>,
    index: usize,
    offset: usize,
    position: usize,
    total: usize,
}

/// A read position that [`ByteBufferInput::reset`] can rewind to. Only
/// valid on the stream that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputMark {
    stream_id: u64,
    position: usize,
}

impl InputMark {
    pub fn position(&self) -> usize {
        self.position
    }
}

impl ByteBufferInput {
    pub fn new(chunks: Vec<Bytes>) -> Self {
        let chunks: Vec<Bytes> = chunks.into_iter().filter(|c| !c.is_empty()).collect();
        let total = super::total_len(&chunks);
        Self {
            id: next_stream_id(),
            chunks,
            index: 0,
            offset: 0,
            position: 0,
            total,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Bytes left to read.
    pub fn available(&self) -> usize {
        self.total - self.position
    }

    /// Bytes in the stream, read or not.
    pub fn total_length(&self) -> usize {
        self.total
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// Underlying chunk views, including bytes already read.
    pub fn chunks(&self) -> &[Bytes] {
        &self.chunks
    }

    // ── Views ─────────────────────────────────────────────────────────────────

    /// Independent cursor at the same position over the same storage.
    pub fn duplicate(&self) -> Self {
        Self {
            id: next_stream_id(),
            chunks: self.chunks.clone(),
            index: self.index,
            offset: self.offset,
            position: self.position,
            total: self.total,
        }
    }

    /// Independent stream over exactly the next `len` bytes. This stream's
    /// cursor does not move.
    pub fn duplicate_and_limit(&self, len: usize) -> Result<Self, StreamError> {
        self.ensure(len)?;
        Ok(Self::new(self.slices(self.position, len)))
    }

    /// Discard everything past the next `len` bytes.
    pub fn limit(&mut self, len: usize) -> Result<(), StreamError> {
        self.ensure(len)?;
        let end = self.position + len;
        let mut start = 0;
        let mut keep = 0;
        for chunk in self.chunks.iter_mut() {
            if start >= end {
                break;
            }
            if start + chunk.len() > end {
                chunk.truncate(end - start);
            }
            start += chunk.len();
            keep += 1;
        }
        self.chunks.truncate(keep);
        self.total = end;
        self.normalize();
        Ok(())
    }

    // ── Marks ─────────────────────────────────────────────────────────────────

    pub fn mark(&self) -> InputMark {
        InputMark {
            stream_id: self.id,
            position: self.position,
        }
    }

    /// Rewind (or fast-forward) to a mark taken on this stream.
    pub fn reset(&mut self, mark: &InputMark) -> Result<(), StreamError> {
        self.check_mark(mark)?;
        self.seek(mark.position);
        Ok(())
    }

    /// Copy of the bytes between two marks taken on this stream.
    pub fn to_array(&self, start: &InputMark, end: &InputMark) -> Result<Vec<u8>, StreamError> {
        self.check_mark(start)?;
        self.check_mark(end)?;
        if end.position < start.position {
            return Err(StreamError::OutOfRange {
                offset: start.position,
                len: 0,
                size: end.position,
            });
        }
        let len = end.position - start.position;
        let mut out = Vec::with_capacity(len);
        for slice in self.slices(start.position, len) {
            out.extend_from_slice(&slice);
        }
        Ok(out)
    }

    fn check_mark(&self, mark: &InputMark) -> Result<(), StreamError> {
        if mark.stream_id != self.id {
            return Err(StreamError::ForeignMark);
        }
        if mark.position > self.total {
            return Err(StreamError::OutOfRange {
                offset: mark.position,
                len: 0,
                size: self.total,
            });
        }
        Ok(())
    }

    // ── Reads ─────────────────────────────────────────────────────────────────

    fn ensure(&self, needed: usize) -> Result<(), StreamError> {
        let available = self.available();
        if needed > available {
            return Err(StreamError::EndOfStream { needed, available });
        }
        Ok(())
    }

    /// Skip up to `n` bytes; returns how many were skipped.
    pub fn skip(&mut self, n: usize) -> usize {
        let n = n.min(self.available());
        self.advance(n);
        n
    }

    /// Fill `buf` completely or fail without consuming anything.
    pub fn read_fully(&mut self, buf: &mut [u8]) -> Result<(), StreamError> {
        self.ensure(buf.len())?;
        self.copy_to_slice(buf);
        Ok(())
    }

    /// The next `len` bytes. A range inside one chunk is returned as a view
    /// of it; a range spanning chunks is copied into one buffer.
    pub fn read_bytes(&mut self, len: usize) -> Result<Bytes, StreamError> {
        self.ensure(len)?;
        let mut slices = self.slices(self.position, len);
        self.advance(len);
        if slices.len() == 1 {
            return Ok(slices.remove(0));
        }
        let mut joined = BytesMut::with_capacity(len);
        for slice in slices {
            joined.extend_from_slice(&slice);
        }
        Ok(joined.freeze())
    }

    pub fn read_u8(&mut self) -> Result<u8, StreamError> {
        self.ensure(1)?;
        Ok(self.get_u8())
    }

    pub fn read_i8(&mut self) -> Result<i8, StreamError> {
        self.ensure(1)?;
        Ok(self.get_i8())
    }

    pub fn read_bool(&mut self) -> Result<bool, StreamError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_i16(&mut self) -> Result<i16, StreamError> {
        self.ensure(2)?;
        Ok(self.get_i16())
    }

    pub fn read_u16(&mut self) -> Result<u16, StreamError> {
        self.ensure(2)?;
        Ok(self.get_u16())
    }

    /// A UTF-16 code unit.
    pub fn read_char(&mut self) -> Result<u16, StreamError> {
        self.read_u16()
    }

    pub fn read_i32(&mut self) -> Result<i32, StreamError> {
        self.ensure(4)?;
        Ok(self.get_i32())
    }

    pub fn read_i64(&mut self) -> Result<i64, StreamError> {
        self.ensure(8)?;
        Ok(self.get_i64())
    }

    pub fn read_f32(&mut self) -> Result<f32, StreamError> {
        self.ensure(4)?;
        Ok(self.get_f32())
    }

    pub fn read_f64(&mut self) -> Result<f64, StreamError> {
        self.ensure(8)?;
        Ok(self.get_f64())
    }

    /// `[len:i32][bytes]`
    pub fn read_byte_array(&mut self) -> Result<Bytes, StreamError> {
        let len = self.read_i32()?;
        if len < 0 {
            return Err(StreamError::NegativeLength(len));
        }
        self.read_bytes(len as usize)
    }

    /// Reads what [`ByteBufferOutput::write_string`](super::ByteBufferOutput::write_string)
    /// writes. `None` is the null string.
    pub fn read_string(&mut self) -> Result<Option<String>, StreamError> {
        if self.read_bool()? {
            return Ok(None);
        }
        match self.read_u8()? {
            STRING_ENCODING_UTF => {
                let len = self.read_u16()? as usize;
                let bytes = self.read_bytes(len)?;
                strings::decode(&bytes).map(Some)
            }
            STRING_ENCODING_RAW => {
                let count = self.read_i32()?;
                if count < 0 {
                    return Err(StreamError::NegativeLength(count));
                }
                self.ensure(count as usize * 2)?;
                let units: Vec<u16> = (0..count).map(|_| self.get_u16()).collect();
                String::from_utf16(&units)
                    .map(Some)
                    .map_err(|_| StreamError::InvalidString)
            }
            tag => Err(StreamError::UnknownStringEncoding(tag)),
        }
    }

    // ── Cursor bookkeeping ────────────────────────────────────────────────────

    /// Views covering `[from, from + len)`.
    fn slices(&self, from: usize, len: usize) -> Vec<Bytes> {
        let end = from + len;
        let mut out = Vec::new();
        let mut start = 0;
        for chunk in &self.chunks {
            let chunk_end = start + chunk.len();
            if chunk_end > from && start < end {
                let lo = from.saturating_sub(start);
                let hi = end.min(chunk_end) - start;
                out.push(chunk.slice(lo..hi));
            }
            if chunk_end >= end {
                break;
            }
            start = chunk_end;
        }
        out
    }

    fn seek(&mut self, position: usize) {
        self.index = 0;
        self.offset = position;
        self.position = position;
        self.normalize();
    }

    fn normalize(&mut self) {
        while self.index < self.chunks.len() && self.offset >= self.chunks[self.index].len() {
            self.offset -= self.chunks[self.index].len();
            self.index += 1;
        }
    }
}

impl Buf for ByteBufferInput {
    fn remaining(&self) -> usize {
        self.available()
    }

    fn chunk(&self) -> &[u8] {
        match self.chunks.get(self.index) {
            Some(c) => &c[self.offset..],
            None => &[],
        }
    }

    fn advance(&mut self, cnt: usize) {
        assert!(
            cnt <= self.available(),
            "advance of {cnt} past end of stream ({} available)",
            self.available()
        );
        self.position += cnt;
        self.offset += cnt;
        self.normalize();
    }
}

impl std::io::Read for ByteBufferInput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = buf.len().min(self.available());
        self.copy_to_slice(&mut buf[..n]);
        Ok(n)
    }
}

impl From<Bytes> for ByteBufferInput {
    fn from(b: Bytes) -> Self {
        Self::new(vec![b])
    }
}

impl From<Vec<Bytes>> for ByteBufferInput {
    fn from(chunks: Vec<Bytes>) -> Self {
        Self::new(chunks)
    }
}

impl std::fmt::Debug for ByteBufferInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteBufferInput")
            .field("id", &self.id)
            .field("chunks", &self.chunks.len())
            .field("position", &self.position)
            .field("total", &self.total)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use proptest::prelude::*;

    use super::*;
    use crate::buffers::{ByteBufferOutput, ChunkPool};

    fn split(data: &[u8], sizes: &[usize]) -> Vec<Bytes> {
        let mut out = Vec::new();
        let mut rest = data;
        for &n in sizes {
            let n = n.min(rest.len());
            out.push(Bytes::copy_from_slice(&rest[..n]));
            rest = &rest[n..];
        }
        out.push(Bytes::copy_from_slice(rest));
        out
    }

    fn sample() -> ByteBufferInput {
        let data: Vec<u8> = (0u8..100).collect();
        ByteBufferInput::new(split(&data, &[0, 7, 1, 30, 0, 12]))
    }

    #[test]
    fn typed_values_cross_chunk_boundaries() {
        let pool = ChunkPool::new(64, 4);
        let mut out = ByteBufferOutput::with_block_size(&pool, 3).unwrap();
        out.write_bool(true);
        out.write_i8(-3);
        out.write_i16(-12345);
        out.write_char(0x263a);
        out.write_i32(i32::MIN + 7);
        out.write_i64(0x0102_0304_0506_0708);
        out.write_f32(1.5);
        out.write_f64(-0.25);
        out.write_byte_array(b"abc").unwrap();
        out.write_string(Some("h\u{e9}llo")).unwrap();

        let mut input = out.into_input();
        assert!(input.read_bool().unwrap());
        assert_eq!(input.read_i8().unwrap(), -3);
        assert_eq!(input.read_i16().unwrap(), -12345);
        assert_eq!(input.read_char().unwrap(), 0x263a);
        assert_eq!(input.read_i32().unwrap(), i32::MIN + 7);
        assert_eq!(input.read_i64().unwrap(), 0x0102_0304_0506_0708);
        assert_eq!(input.read_f32().unwrap(), 1.5);
        assert_eq!(input.read_f64().unwrap(), -0.25);
        assert_eq!(&input.read_byte_array().unwrap()[..], b"abc");
        assert_eq!(input.read_string().unwrap().as_deref(), Some("h\u{e9}llo"));
        assert_eq!(input.available(), 0);
    }

    #[test]
    fn short_read_fails_without_consuming() {
        let mut input = ByteBufferInput::from(Bytes::from_static(&[1, 2, 3]));
        assert_eq!(
            input.read_i32(),
            Err(StreamError::EndOfStream {
                needed: 4,
                available: 3
            })
        );
        assert_eq!(input.available(), 3);
        let mut buf = [0u8; 4];
        assert!(input.read_fully(&mut buf).is_err());
        assert_eq!(input.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], &[1, 2, 3]);
        assert_eq!(input.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn empty_chunks_are_ignored() {
        let input = ByteBufferInput::new(vec![Bytes::new(), Bytes::new()]);
        assert_eq!(input.available(), 0);
        assert_eq!(input.duplicate_and_limit(0).unwrap().available(), 0);
    }

    #[test]
    fn duplicate_has_its_own_cursor() {
        let mut input = sample();
        input.read_u8().unwrap();
        let mut dupe = input.duplicate();
        assert_eq!(dupe.available(), input.available());

        let read = input.read_u8().unwrap();
        assert_eq!(dupe.available() - 1, input.available());
        assert_eq!(dupe.read_u8().unwrap(), read);
    }

    #[test]
    fn duplicate_and_limit_leaves_source_in_place() {
        let mut input = sample();
        input.skip(5);
        let mut dupe = input.duplicate_and_limit(40).unwrap();
        assert_eq!(dupe.total_length(), 40);
        for _ in 0..40 {
            assert_eq!(dupe.read_u8().unwrap(), input.read_u8().unwrap());
        }
        assert_eq!(dupe.available(), 0);
        assert!(input.duplicate_and_limit(1000).is_err());
    }

    #[test]
    fn limit_truncates_the_rest() {
        let mut input = sample();
        input.skip(10);
        let mark = input.mark();
        input.limit(20).unwrap();
        assert_eq!(input.available(), 20);
        assert_eq!(input.total_length(), 30);
        input.skip(20);
        assert!(input.read_u8().is_err());
        input.reset(&mark).unwrap();
        assert_eq!(input.read_u8().unwrap(), 10);

        input.limit(0).unwrap();
        assert_eq!(input.available(), 0);
    }

    #[test]
    fn mark_and_reset() {
        let mut input = sample();
        input.skip(3);
        let mark = input.mark();
        let first: Vec<u8> = (0..50).map(|_| input.read_u8().unwrap()).collect();
        input.reset(&mark).unwrap();
        let again: Vec<u8> = (0..50).map(|_| input.read_u8().unwrap()).collect();
        assert_eq!(first, again);

        let other = sample();
        assert_eq!(input.reset(&other.mark()), Err(StreamError::ForeignMark));
        assert_eq!(
            input.duplicate().reset(&mark),
            Err(StreamError::ForeignMark)
        );
    }

    #[test]
    fn to_array_between_marks() {
        let mut input = sample();
        input.skip(6);
        let start = input.mark();
        input.skip(10);
        let end = input.mark();
        assert_eq!(input.to_array(&start, &end).unwrap(), (6u8..16).collect::<Vec<_>>());
        assert!(input.to_array(&end, &start).is_err());
    }

    #[test]
    fn read_bytes_within_a_chunk_is_a_view() {
        let chunk = Bytes::from(vec![9u8; 32]);
        let mut input = ByteBufferInput::new(vec![chunk.clone(), Bytes::from_static(b"xy")]);
        let view = input.read_bytes(16).unwrap();
        assert_eq!(view.as_ptr(), chunk.as_ptr());
        let spanning = input.read_bytes(17).unwrap();
        assert_eq!(&spanning[16..], b"x");
    }

    #[test]
    fn unknown_string_tag_is_rejected() {
        let mut input = ByteBufferInput::from(Bytes::from_static(&[0, 9]));
        assert_eq!(
            input.read_string(),
            Err(StreamError::UnknownStringEncoding(9))
        );
    }

    proptest! {
        #[test]
        fn values_round_trip(
            ints in prop::collection::vec(any::<i32>(), 0..20),
            longs in prop::collection::vec(any::<i64>(), 0..20),
            strings in prop::collection::vec(prop::option::of(".{0,40}"), 0..10),
            block in 1usize..64,
        ) {
            let pool = ChunkPool::new(64, 8);
            let mut out = ByteBufferOutput::with_block_sizes(&pool, block, 128).unwrap();
            for v in &ints {
                out.write_i32(*v);
            }
            for v in &longs {
                out.write_i64(*v);
            }
            for s in &strings {
                out.write_string(s.as_deref()).unwrap();
            }

            let mut input = out.into_input();
            for v in &ints {
                prop_assert_eq!(input.read_i32().unwrap(), *v);
            }
            for v in &longs {
                prop_assert_eq!(input.read_i64().unwrap(), *v);
            }
            for s in &strings {
                prop_assert_eq!(&input.read_string().unwrap(), s);
            }
            prop_assert_eq!(input.available(), 0);
        }

        #[test]
        fn duplicates_advance_independently(
            data in prop::collection::vec(any::<u8>(), 1..200),
            sizes in prop::collection::vec(0usize..17, 0..12),
            a in 0usize..200,
            b in 0usize..200,
        ) {
            let mut original = ByteBufferInput::new(split(&data, &sizes));
            let mut dupe = original.duplicate();
            let a = original.skip(a);
            let before = dupe.position();
            let b = dupe.skip(b);
            prop_assert_eq!(original.position(), a);
            prop_assert_eq!(dupe.position(), before + b);
            if original.available() > 0 {
                prop_assert_eq!(original.read_u8().unwrap(), data[a]);
            }
            if dupe.available() > 0 {
                prop_assert_eq!(dupe.read_u8().unwrap(), data[b]);
            }
        }
    }
}
