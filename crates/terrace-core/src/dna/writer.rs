//! DNA writers.
//!
//! A [`DnaBatch`] owns the output stream and string codec shared by every
//! record in a batch. A [`DnaWriter`] does not hold the stream: each call
//! borrows the batch, so writers for different objects may interleave
//! their bytes. Each writer tracks the byte ranges it wrote and, when they
//! are not one contiguous span, [`DnaWriter::copy_to`] reassembles the
//! record as header, then every action, then every metadata block.

use super::encoding::encode_action;
use super::{
    DnaAction, DnaArray, DnaError, DnaHeader, DnaValue, StringCodec, FIXED_HEADER_LENGTH,
};
use crate::buffers::{length_prefix, ByteBufferOutput, OutputMark};

// ── Batch ─────────────────────────────────────────────────────────────────────

/// Output stream plus string codec for a batch of records.
#[derive(Debug)]
pub struct DnaBatch<S> {
    out: ByteBufferOutput,
    strings: S,
}

impl<S: StringCodec> DnaBatch<S> {
    pub fn new(out: ByteBufferOutput, strings: S) -> Self {
        Self { out, strings }
    }

    pub fn output(&self) -> &ByteBufferOutput {
        &self.out
    }

    pub fn output_mut(&mut self) -> &mut ByteBufferOutput {
        &mut self.out
    }

    pub fn strings(&self) -> &S {
        &self.strings
    }

    pub fn into_parts(self) -> (ByteBufferOutput, S) {
        (self.out, self.strings)
    }
}

// ── Segments ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegmentKind {
    Actions,
    MetaData,
}

/// A run of bytes this writer produced, in write order.
#[derive(Debug, Clone, Copy)]
struct Segment {
    kind: SegmentKind,
    start: OutputMark,
    len: usize,
}

impl Segment {
    fn end(&self) -> usize {
        self.start.position() + self.len
    }
}

// ── Action API ────────────────────────────────────────────────────────────────

/// Operations shared by writers and their appenders.
pub trait DnaActions {
    fn add_action<S: StringCodec>(
        &mut self,
        batch: &mut DnaBatch<S>,
        action: &DnaAction,
    ) -> Result<(), DnaError>;

    /// Append an opaque metadata block. Metadata is kept apart from actions
    /// in the finished record.
    fn add_meta_data<S: StringCodec>(
        &mut self,
        batch: &mut DnaBatch<S>,
        data: &[u8],
    ) -> Result<(), DnaError>;

    /// Actions recorded through this handle.
    fn action_count(&self) -> i32;

    fn add_physical_action<S: StringCodec>(
        &mut self,
        batch: &mut DnaBatch<S>,
        field: &str,
        value: DnaValue,
        is_reference: bool,
    ) -> Result<(), DnaError> {
        self.add_action(
            batch,
            &DnaAction::Physical {
                field: field.to_string(),
                value,
                is_reference,
            },
        )
    }

    fn add_logical_action<S: StringCodec>(
        &mut self,
        batch: &mut DnaBatch<S>,
        method: i32,
        params: Vec<DnaValue>,
        change_id: Option<i64>,
    ) -> Result<(), DnaError> {
        self.add_action(
            batch,
            &DnaAction::Logical {
                method,
                params,
                change_id,
            },
        )
    }

    fn add_array_element_action<S: StringCodec>(
        &mut self,
        batch: &mut DnaBatch<S>,
        index: i32,
        value: DnaValue,
    ) -> Result<(), DnaError> {
        self.add_action(batch, &DnaAction::ArrayElement { index, value })
    }

    fn add_entire_array<S: StringCodec>(
        &mut self,
        batch: &mut DnaBatch<S>,
        array: Option<DnaArray>,
    ) -> Result<(), DnaError> {
        self.add_action(batch, &DnaAction::EntireArray(array))
    }

    fn add_sub_array_action<S: StringCodec>(
        &mut self,
        batch: &mut DnaBatch<S>,
        start: i32,
        array: DnaArray,
    ) -> Result<(), DnaError> {
        self.add_action(batch, &DnaAction::SubArray { start, array })
    }

    fn add_literal_value<S: StringCodec>(
        &mut self,
        batch: &mut DnaBatch<S>,
        value: DnaValue,
    ) -> Result<(), DnaError> {
        self.add_action(batch, &DnaAction::Literal(value))
    }
}

// ── Writer ────────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct DnaWriter {
    header: DnaHeader,
    header_mark: OutputMark,
    header_len: usize,
    segments: Vec<Segment>,
    action_count: i32,
    action_bytes: usize,
    meta_bytes: usize,
    finalized: bool,
}

impl DnaWriter {
    /// Start a record: writes the header with placeholder lengths.
    pub fn new<S: StringCodec>(batch: &mut DnaBatch<S>, header: DnaHeader) -> Result<Self, DnaError> {
        if !header.is_delta && header.class_name.is_none() {
            return Err(DnaError::MissingClassName(header.object_id));
        }
        let DnaBatch { out, strings } = batch;
        let header_mark = out.mark();
        out.write_i32(0);
        out.write_i32(0);
        out.write_i32(0);
        out.write_u8(header.flags());
        out.write_i64(header.object_id);
        if let Some(class_name) = header.class_name.as_deref().filter(|_| !header.is_delta) {
            strings.write_string(out, class_name)?;
        }
        if let Some(version) = header.version {
            out.write_i64(version);
        }
        if let Some(parent_id) = header.parent_id {
            out.write_i64(parent_id);
        }
        if let Some(len) = header.array_length {
            out.write_i32(len);
        }
        let header_len = out.bytes_written() - header_mark.position();
        debug_assert!(header_len >= FIXED_HEADER_LENGTH);

        Ok(Self {
            header,
            header_mark,
            header_len,
            segments: Vec::new(),
            action_count: 0,
            action_bytes: 0,
            meta_bytes: 0,
            finalized: false,
        })
    }

    pub fn header(&self) -> &DnaHeader {
        &self.header
    }

    /// A child handle that writes into this record.
    pub fn create_appender(&mut self) -> DnaAppender<'_> {
        DnaAppender {
            parent: self,
            action_count: 0,
        }
    }

    /// Length of the finished record.
    pub fn total_length(&self) -> usize {
        self.header_len + self.action_bytes + self.meta_bytes
    }

    fn meta_data_offset(&self) -> usize {
        if self.meta_bytes == 0 {
            0
        } else {
            self.header_len + self.action_bytes
        }
    }

    /// True when header, actions and metadata sit in one span, in that
    /// order, so the record can be copied in one piece.
    pub fn is_contiguous(&self) -> bool {
        let mut at = self.header_mark.position() + self.header_len;
        let mut seen_meta = false;
        for segment in &self.segments {
            if segment.start.position() != at {
                return false;
            }
            match segment.kind {
                SegmentKind::Actions if seen_meta => return false,
                SegmentKind::MetaData => seen_meta = true,
                SegmentKind::Actions => {}
            }
            at = segment.end();
        }
        true
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Backpatch total length, action count and metadata offset.
    pub fn finalize_header<S: StringCodec>(&mut self, batch: &mut DnaBatch<S>) -> Result<(), DnaError> {
        if self.finalized {
            return Err(DnaError::AlreadyFinalized);
        }
        if self.header.is_delta && self.action_count == 0 {
            tracing::warn!(object_id = self.header.object_id, "refusing empty delta");
            return Err(DnaError::EmptyDelta(self.header.object_id));
        }
        let total_length = length_prefix(self.total_length())?;
        let meta_data_offset = length_prefix(self.meta_data_offset())?;
        let mut fixed = [0u8; 12];
        fixed[..4].copy_from_slice(&total_length.to_be_bytes());
        fixed[4..8].copy_from_slice(&self.action_count.to_be_bytes());
        fixed[8..].copy_from_slice(&meta_data_offset.to_be_bytes());
        self.header_mark.write(&mut batch.out, &fixed)?;
        self.finalized = true;
        Ok(())
    }

    /// Append the finished record to `dest`. One bulk copy when contiguous,
    /// otherwise header, actions, then metadata, range by range.
    pub fn copy_to<S: StringCodec>(
        &self,
        batch: &DnaBatch<S>,
        dest: &mut ByteBufferOutput,
    ) -> Result<(), DnaError> {
        if !self.finalized {
            return Err(DnaError::NotFinalized);
        }
        let src = &batch.out;
        if self.is_contiguous() {
            self.header_mark.copy_to(src, dest, self.total_length())?;
            return Ok(());
        }
        self.header_mark.copy_to(src, dest, self.header_len)?;
        for kind in [SegmentKind::Actions, SegmentKind::MetaData] {
            for segment in self.segments.iter().filter(|s| s.kind == kind) {
                segment.start.copy_to(src, dest, segment.len)?;
            }
        }
        Ok(())
    }

    fn record<S: StringCodec>(
        &mut self,
        batch: &mut DnaBatch<S>,
        kind: SegmentKind,
        write: impl FnOnce(&mut ByteBufferOutput, &mut S) -> Result<(), DnaError>,
    ) -> Result<usize, DnaError> {
        if self.finalized {
            return Err(DnaError::AlreadyFinalized);
        }
        let start = batch.out.mark();
        write(&mut batch.out, &mut batch.strings)?;
        let len = batch.out.bytes_written() - start.position();

        match self.segments.last_mut() {
            Some(last) if last.kind == kind && last.end() == start.position() => last.len += len,
            _ => self.segments.push(Segment { kind, start, len }),
        }
        match kind {
            SegmentKind::Actions => self.action_bytes += len,
            SegmentKind::MetaData => self.meta_bytes += len,
        }
        Ok(len)
    }
}

impl DnaActions for DnaWriter {
    fn add_action<S: StringCodec>(
        &mut self,
        batch: &mut DnaBatch<S>,
        action: &DnaAction,
    ) -> Result<(), DnaError> {
        self.record(batch, SegmentKind::Actions, |out, strings| {
            encode_action(out, strings, action)
        })?;
        self.action_count += 1;
        Ok(())
    }

    fn add_meta_data<S: StringCodec>(
        &mut self,
        batch: &mut DnaBatch<S>,
        data: &[u8],
    ) -> Result<(), DnaError> {
        self.record(batch, SegmentKind::MetaData, |out, _| {
            out.write_byte_array(data)?;
            Ok(())
        })?;
        Ok(())
    }

    fn action_count(&self) -> i32 {
        self.action_count
    }
}

// ── Appender ──────────────────────────────────────────────────────────────────

/// Child writer for the same record. Everything it writes counts towards
/// the parent; its own count is kept separately.
#[derive(Debug)]
pub struct DnaAppender<'w> {
    parent: &'w mut DnaWriter,
    action_count: i32,
}

impl DnaActions for DnaAppender<'_> {
    fn add_action<S: StringCodec>(
        &mut self,
        batch: &mut DnaBatch<S>,
        action: &DnaAction,
    ) -> Result<(), DnaError> {
        self.parent.add_action(batch, action)?;
        self.action_count += 1;
        Ok(())
    }

    fn add_meta_data<S: StringCodec>(
        &mut self,
        batch: &mut DnaBatch<S>,
        data: &[u8],
    ) -> Result<(), DnaError> {
        self.parent.add_meta_data(batch, data)
    }

    fn action_count(&self) -> i32 {
        self.action_count
    }
}
