//! Protocol adaptor: turns raw connection reads into complete messages.
//!
//! The caller's read loop asks for [`read_buffers`](ProtocolAdaptor::read_buffers),
//! reads into them (vectored), and reports the byte count with
//! [`commit`](ProtocolAdaptor::commit). The adaptor first fills a header
//! region, validates it, then fills payload chunks sized to exactly the
//! declared length. Any [`ProtocolError`] is fatal: drop the adaptor and
//! close the connection.

use bytes::{Bytes, BytesMut};

use super::{ProtocolError, WireHeader, WireMessage, MIN_HEADER_LENGTH};
use crate::buffers::ChunkPool;
use crate::config::ProtocolConfig;

enum State {
    /// Waiting for header bytes. `buf` starts at the base size and grows
    /// once the declared header length is known.
    Header { buf: Vec<u8>, filled: usize },
    /// Waiting for payload bytes. Chunks are pre-sized; `filled` counts
    /// across all of them.
    Data {
        header: WireHeader,
        header_chunk: Bytes,
        chunks: Vec<BytesMut>,
        filled: usize,
    },
}

impl State {
    fn header() -> Self {
        State::Header {
            buf: vec![0; MIN_HEADER_LENGTH],
            filled: 0,
        }
    }
}

pub struct ProtocolAdaptor {
    pool: ChunkPool,
    max_data_length: u32,
    state: State,
    ready: Vec<WireMessage>,
}

impl ProtocolAdaptor {
    pub fn new(pool: &ChunkPool, max_data_length: u32) -> Self {
        Self {
            pool: pool.clone(),
            max_data_length,
            state: State::header(),
            ready: Vec::new(),
        }
    }

    pub fn from_config(pool: &ChunkPool, config: &ProtocolConfig) -> Self {
        Self::new(pool, config.max_message_size)
    }

    /// True between messages.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, State::Header { filled: 0, .. })
    }

    /// Regions still waiting for bytes, in fill order. Never empty and never
    /// contains a full region.
    pub fn read_buffers(&mut self) -> Vec<&mut [u8]> {
        match &mut self.state {
            State::Header { buf, filled } => vec![&mut buf[*filled..]],
            State::Data { chunks, filled, .. } => {
                let mut skip = *filled;
                let mut out = Vec::new();
                for chunk in chunks.iter_mut() {
                    if skip >= chunk.len() {
                        skip -= chunk.len();
                        continue;
                    }
                    out.push(&mut chunk[skip..]);
                    skip = 0;
                }
                out
            }
        }
    }

    fn free_space(&self) -> usize {
        match &self.state {
            State::Header { buf, filled } => buf.len() - filled,
            State::Data { header, filled, .. } => header.data_length() as usize - filled,
        }
    }

    /// Record that `n` bytes were read into the regions from
    /// [`read_buffers`](Self::read_buffers).
    pub fn commit(&mut self, n: usize) -> Result<(), ProtocolError> {
        let free = self.free_space();
        if n > free {
            tracing::warn!(offered = n, free, "more bytes committed than requested");
            return Err(ProtocolError::OverDelivery { offered: n, free });
        }
        match &mut self.state {
            State::Header { filled, .. } => *filled += n,
            State::Data { filled, .. } => *filled += n,
        }
        if n == free {
            self.region_complete()?;
        }
        Ok(())
    }

    /// Copy `data` into the read buffers, however many messages it spans.
    pub fn add_read_data(&mut self, mut data: &[u8]) -> Result<(), ProtocolError> {
        while !data.is_empty() {
            let mut copied = 0;
            for region in self.read_buffers() {
                let n = region.len().min(data.len() - copied);
                region[..n].copy_from_slice(&data[copied..copied + n]);
                copied += n;
                if copied == data.len() {
                    break;
                }
            }
            self.commit(copied)?;
            data = &data[copied..];
        }
        Ok(())
    }

    /// Messages completed so far, oldest first.
    pub fn take_messages(&mut self) -> Vec<WireMessage> {
        std::mem::take(&mut self.ready)
    }

    fn region_complete(&mut self) -> Result<(), ProtocolError> {
        match std::mem::replace(&mut self.state, State::header()) {
            State::Header { mut buf, filled } => {
                if buf.len() == MIN_HEADER_LENGTH {
                    let len = WireHeader::declared_length(&buf)?;
                    if len > MIN_HEADER_LENGTH {
                        buf.resize(len, 0);
                        self.state = State::Header { buf, filled };
                        return Ok(());
                    }
                }
                self.header_complete(buf)
            }
            State::Data {
                header,
                header_chunk,
                chunks,
                ..
            } => {
                let payload = chunks.into_iter().map(BytesMut::freeze).collect();
                self.emit(WireMessage::received(header, header_chunk, payload, &self.pool));
                Ok(())
            }
        }
    }

    fn header_complete(&mut self, buf: Vec<u8>) -> Result<(), ProtocolError> {
        let header = WireHeader::decode(&buf, self.max_data_length).map_err(|e| {
            tracing::warn!(error = %e, "rejecting message header");
            e
        })?;
        let header_chunk = Bytes::from(buf);
        let data_len = header.data_length() as usize;
        if data_len == 0 {
            self.emit(WireMessage::received(header, header_chunk, Vec::new(), &self.pool));
            return Ok(());
        }

        let chunk_size = self.pool.chunk_size();
        let mut chunks = Vec::with_capacity(data_len.div_ceil(chunk_size));
        let mut left = data_len;
        while left > 0 {
            let n = left.min(chunk_size);
            let mut chunk = self.pool.acquire(n);
            chunk.resize(n, 0);
            chunks.push(chunk);
            left -= n;
        }
        tracing::trace!(
            message_type = header.message_type(),
            data_len,
            chunks = chunks.len(),
            "header accepted, reading payload"
        );
        self.state = State::Data {
            header,
            header_chunk,
            chunks,
            filled: 0,
        };
        Ok(())
    }

    fn emit(&mut self, message: WireMessage) {
        tracing::trace!(message_type = message.header().message_type(), "message assembled");
        self.ready.push(message);
    }
}

impl std::fmt::Debug for ProtocolAdaptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state {
            State::Header { .. } => "header",
            State::Data { .. } => "data",
        };
        f.debug_struct("ProtocolAdaptor")
            .field("state", &state)
            .field("ready", &self.ready.len())
            .finish()
    }
}
