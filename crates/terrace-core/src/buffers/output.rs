//! Output stream: a growable list of chunks with backpatching marks.

use bytes::{Bytes, BytesMut};

use super::{
    next_stream_id, strings, ChunkPool, StreamError, DEFAULT_INITIAL_BLOCK_SIZE,
    DEFAULT_MAX_BLOCK_SIZE, MAX_UTF_ENCODED_LENGTH, STRING_ENCODING_RAW, STRING_ENCODING_UTF,
};
use crate::config::BuffersConfig;

enum Chunk {
    /// Allocated by this stream or handed over as `BytesMut`. Bytes
    /// `[0, len)` are written; the stream only appends up to `cap`.
    Writable { buf: BytesMut, cap: usize },
    /// Handed over frozen. Spliced through as-is, never written through.
    Shared(Bytes),
}

impl Chunk {
    fn len(&self) -> usize {
        match self {
            Chunk::Writable { buf, .. } => buf.len(),
            Chunk::Shared(b) => b.len(),
        }
    }

    fn as_slice(&self) -> &[u8] {
        match self {
            Chunk::Writable { buf, .. } => buf,
            Chunk::Shared(b) => b,
        }
    }

    fn freeze(self) -> Bytes {
        match self {
            Chunk::Writable { buf, .. } => buf.freeze(),
            Chunk::Shared(b) => b,
        }
    }

    fn release(self, pool: &ChunkPool) {
        match self {
            Chunk::Writable { buf, .. } => pool.recycle(buf),
            Chunk::Shared(b) => pool.recycle_frozen(b),
        }
    }
}

/// A contiguous piece of a byte range: `(chunk index, start in chunk, len)`.
type Span = (usize, usize, usize);

/// Growable output stream. Chunk sizes double from the initial block size
/// up to the max block size. [`finalize`](Self::finalize) consumes the
/// stream and returns a consolidated, read-only chunk list.
pub struct ByteBufferOutput {
    id: u64,
    pool: ChunkPool,
    chunks: Vec<Chunk>,
    next_block_size: usize,
    max_block_size: usize,
    written: usize,
}

impl ByteBufferOutput {
    pub fn new(pool: &ChunkPool) -> Self {
        Self::build(pool, DEFAULT_INITIAL_BLOCK_SIZE, DEFAULT_MAX_BLOCK_SIZE)
    }

    /// Fixed-size chunks: initial and max block size are equal.
    pub fn with_block_size(pool: &ChunkPool, block_size: usize) -> Result<Self, StreamError> {
        Self::with_block_sizes(pool, block_size, block_size)
    }

    pub fn with_block_sizes(
        pool: &ChunkPool,
        initial: usize,
        max: usize,
    ) -> Result<Self, StreamError> {
        if initial == 0 || max < initial {
            return Err(StreamError::InvalidBlockSize { initial, max });
        }
        Ok(Self::build(pool, initial, max))
    }

    pub fn from_config(pool: &ChunkPool, config: &BuffersConfig) -> Result<Self, StreamError> {
        Self::with_block_sizes(pool, config.initial_block_size, config.max_block_size)
    }

    fn build(pool: &ChunkPool, initial: usize, max: usize) -> Self {
        Self {
            id: next_stream_id(),
            pool: pool.clone(),
            chunks: Vec::new(),
            next_block_size: initial,
            max_block_size: max,
            written: 0,
        }
    }

    pub fn bytes_written(&self) -> usize {
        self.written
    }

    pub fn is_empty(&self) -> bool {
        self.written == 0
    }

    pub fn pool(&self) -> &ChunkPool {
        &self.pool
    }

    // ── Raw writes ────────────────────────────────────────────────────────────

    pub fn write_u8(&mut self, b: u8) {
        let (buf, _) = self.writable_tail();
        buf.extend_from_slice(&[b]);
        self.written += 1;
    }

    pub fn write_bytes(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let (buf, spare) = self.writable_tail();
            let n = spare.min(data.len());
            buf.extend_from_slice(&data[..n]);
            data = &data[n..];
            self.written += n;
        }
    }

    /// Write `len` bytes of `data` starting at `offset`. Nothing is written
    /// when the range is out of bounds.
    pub fn write_slice(&mut self, data: &[u8], offset: usize, len: usize) -> Result<(), StreamError> {
        let end = offset.checked_add(len).filter(|end| *end <= data.len()).ok_or(
            StreamError::OutOfRange {
                offset,
                len,
                size: data.len(),
            },
        )?;
        self.write_bytes(&data[offset..end]);
        Ok(())
    }

    /// Take ownership of a filled chunk. Its bytes become part of the stream
    /// without a copy; the caller must not touch it again.
    pub fn write_chunk(&mut self, chunk: BytesMut) {
        self.written += chunk.len();
        let cap = chunk.len();
        self.chunks.push(Chunk::Writable { buf: chunk, cap });
    }

    /// Take ownership of frozen chunks, spliced in without a copy.
    pub fn write_chunks(&mut self, chunks: impl IntoIterator<Item = Bytes>) {
        for chunk in chunks {
            self.written += chunk.len();
            self.chunks.push(Chunk::Shared(chunk));
        }
    }

    // ── Typed writes (big-endian) ─────────────────────────────────────────────

    pub fn write_bool(&mut self, v: bool) {
        self.write_u8(v as u8);
    }

    pub fn write_i8(&mut self, v: i8) {
        self.write_u8(v as u8);
    }

    pub fn write_i16(&mut self, v: i16) {
        self.write_bytes(&v.to_be_bytes());
    }

    pub fn write_u16(&mut self, v: u16) {
        self.write_bytes(&v.to_be_bytes());
    }

    /// A UTF-16 code unit.
    pub fn write_char(&mut self, v: u16) {
        self.write_u16(v);
    }

    pub fn write_i32(&mut self, v: i32) {
        self.write_bytes(&v.to_be_bytes());
    }

    pub fn write_i64(&mut self, v: i64) {
        self.write_bytes(&v.to_be_bytes());
    }

    pub fn write_f32(&mut self, v: f32) {
        self.write_bytes(&v.to_bits().to_be_bytes());
    }

    pub fn write_f64(&mut self, v: f64) {
        self.write_bytes(&v.to_bits().to_be_bytes());
    }

    /// A 4-byte length or count prefix.
    pub fn write_length(&mut self, len: usize) -> Result<(), StreamError> {
        self.write_i32(super::length_prefix(len)?);
        Ok(())
    }

    /// `[len:i32][bytes]`
    pub fn write_byte_array(&mut self, bytes: &[u8]) -> Result<(), StreamError> {
        self.write_length(bytes.len())?;
        self.write_bytes(bytes);
        Ok(())
    }

    /// `[isNull:1][encodingTag:1]{encoded}`.
    ///
    /// Modified UTF-8 with a 2-byte length is tried first. When the encoded
    /// form is too long the tag is rewritten through a mark and the string
    /// goes out as raw UTF-16 code units behind a 4-byte count.
    pub fn write_string(&mut self, value: Option<&str>) -> Result<(), StreamError> {
        let Some(s) = value else {
            self.write_bool(true);
            return Ok(());
        };
        self.write_bool(false);

        let tag = self.mark();
        self.write_u8(STRING_ENCODING_UTF);

        let encoded_len = strings::encoded_len(s);
        if encoded_len <= MAX_UTF_ENCODED_LENGTH {
            let mut encoded = Vec::with_capacity(encoded_len);
            strings::encode(s, &mut encoded);
            self.write_u16(encoded_len as u16);
            self.write_bytes(&encoded);
            return Ok(());
        }

        tag.write_u8(self, STRING_ENCODING_RAW)?;
        let units: Vec<u16> = s.encode_utf16().collect();
        self.write_length(units.len())?;
        for unit in units {
            self.write_u16(unit);
        }
        Ok(())
    }

    // ── Marks ─────────────────────────────────────────────────────────────────

    /// Remember the current write position.
    pub fn mark(&self) -> OutputMark {
        let (chunk_index, chunk_offset) = match self.chunks.last() {
            Some(last) => (self.chunks.len() - 1, last.len()),
            None => (0, 0),
        };
        OutputMark {
            stream_id: self.id,
            chunk_index,
            chunk_offset,
            position: self.written,
        }
    }

    fn check_mark(&self, mark: &OutputMark) -> Result<(), StreamError> {
        if mark.stream_id != self.id {
            return Err(StreamError::ForeignMark);
        }
        Ok(())
    }

    /// Break `len` bytes starting at a mark into per-chunk spans.
    fn spans(&self, mark: &OutputMark, len: usize) -> Vec<Span> {
        let mut spans = Vec::new();
        let (mut index, mut offset, mut remaining) = (mark.chunk_index, mark.chunk_offset, len);
        while remaining > 0 && index < self.chunks.len() {
            let available = self.chunks[index].len() - offset;
            let n = available.min(remaining);
            if n > 0 {
                spans.push((index, offset, n));
                remaining -= n;
            }
            index += 1;
            offset = 0;
        }
        spans
    }

    // ── Finalize ──────────────────────────────────────────────────────────────

    /// Close the stream and return its chunks. Zero-length chunks are
    /// dropped and adjacent chunks are merged while the merged size stays
    /// within the max block size.
    pub fn finalize(mut self) -> Vec<Bytes> {
        let chunks = std::mem::take(&mut self.chunks);
        consolidate(&self.pool, chunks, self.max_block_size)
    }

    /// Finalize and open the result for reading.
    pub fn into_input(self) -> super::ByteBufferInput {
        super::ByteBufferInput::new(self.finalize())
    }

    /// The last chunk if it still has room, otherwise a freshly leased one.
    fn writable_tail(&mut self) -> (&mut BytesMut, usize) {
        let has_room = matches!(
            self.chunks.last(),
            Some(Chunk::Writable { buf, cap }) if buf.len() < *cap
        );
        if !has_room {
            let size = self.next_block_size;
            self.next_block_size = size.saturating_mul(2).min(self.max_block_size);
            let buf = self.pool.acquire(size);
            self.chunks.push(Chunk::Writable { buf, cap: size });
        }
        match self.chunks.last_mut() {
            Some(Chunk::Writable { buf, cap }) => {
                let spare = *cap - buf.len();
                (buf, spare)
            }
            _ => unreachable!("tail chunk was just checked or pushed as writable"),
        }
    }
}

impl Drop for ByteBufferOutput {
    fn drop(&mut self) {
        for chunk in self.chunks.drain(..) {
            chunk.release(&self.pool);
        }
    }
}

impl std::io::Write for ByteBufferOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.write_bytes(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl std::fmt::Debug for ByteBufferOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteBufferOutput")
            .field("id", &self.id)
            .field("chunks", &self.chunks.len())
            .field("written", &self.written)
            .finish()
    }
}

fn consolidate(pool: &ChunkPool, chunks: Vec<Chunk>, max: usize) -> Vec<Bytes> {
    let mut out = Vec::new();
    let mut group: Vec<Chunk> = Vec::new();
    let mut group_len = 0;

    for chunk in chunks {
        if chunk.len() == 0 {
            chunk.release(pool);
            continue;
        }
        if !group.is_empty() && group_len + chunk.len() > max {
            out.push(merge(pool, std::mem::take(&mut group), group_len));
            group_len = 0;
        }
        group_len += chunk.len();
        group.push(chunk);
    }
    if !group.is_empty() {
        out.push(merge(pool, group, group_len));
    }
    out
}

fn merge(pool: &ChunkPool, group: Vec<Chunk>, len: usize) -> Bytes {
    if group.len() == 1 {
        if let Some(only) = group.into_iter().next() {
            return only.freeze();
        }
        return Bytes::new();
    }
    let mut merged = pool.acquire(len);
    for chunk in group {
        merged.extend_from_slice(chunk.as_slice());
        chunk.release(pool);
    }
    merged.freeze()
}

// ── Output mark ───────────────────────────────────────────────────────────────

/// A position in an output stream's history, usable for backpatching bytes
/// already written and for copying bytes out. Only valid with the stream
/// that produced it and only until that stream is finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputMark {
    stream_id: u64,
    chunk_index: usize,
    chunk_offset: usize,
    position: usize,
}

impl OutputMark {
    /// Absolute byte position in the stream.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Overwrite bytes at the mark. The range must already be written and
    /// must not cross a shared chunk. The stream length does not change.
    pub fn write(&self, out: &mut ByteBufferOutput, data: &[u8]) -> Result<(), StreamError> {
        out.check_mark(self)?;
        if self.position + data.len() > out.written {
            return Err(StreamError::MarkOverrun {
                position: self.position,
                len: data.len(),
                written: out.written,
            });
        }

        let spans = out.spans(self, data.len());
        let mut at = self.position;
        for &(index, _, n) in &spans {
            if matches!(out.chunks[index], Chunk::Shared(_)) {
                return Err(StreamError::SharedChunk { position: at });
            }
            at += n;
        }

        let mut consumed = 0;
        for (index, start, n) in spans {
            if let Chunk::Writable { buf, .. } = &mut out.chunks[index] {
                buf[start..start + n].copy_from_slice(&data[consumed..consumed + n]);
            }
            consumed += n;
        }
        Ok(())
    }

    pub fn write_u8(&self, out: &mut ByteBufferOutput, b: u8) -> Result<(), StreamError> {
        self.write(out, &[b])
    }

    pub fn write_i32(&self, out: &mut ByteBufferOutput, v: i32) -> Result<(), StreamError> {
        self.write(out, &v.to_be_bytes())
    }

    /// Append `len` bytes starting at this mark in `src` to `dest`. Shared
    /// chunks are spliced by reference; writable ones are copied.
    pub fn copy_to(
        &self,
        src: &ByteBufferOutput,
        dest: &mut ByteBufferOutput,
        len: usize,
    ) -> Result<(), StreamError> {
        src.check_mark(self)?;
        if self.position + len > src.written {
            return Err(StreamError::MarkOverrun {
                position: self.position,
                len,
                written: src.written,
            });
        }
        for (index, start, n) in src.spans(self, len) {
            match &src.chunks[index] {
                Chunk::Shared(b) => dest.write_chunks([b.slice(start..start + n)]),
                Chunk::Writable { buf, .. } => dest.write_bytes(&buf[start..start + n]),
            }
        }
        Ok(())
    }
}
