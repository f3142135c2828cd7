//! Wire message: one header plus an ordered payload chunk list.
//!
//! Lifecycle: unsealed → sealed → (sent) → recycled. Sealing fixes the
//! lengths and builds the header chunk; after that the message is
//! immutable. Recycling hands every chunk back to the pool exactly once.

use bytes::Bytes;

use super::{MessageError, MessageType, ProtocolError, WireHeader};
use crate::buffers::{total_len, ByteBufferInput, ByteBufferOutput, ChunkPool, StreamError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Unsealed,
    Sealed,
    Recycled,
}

type SentCallback = Box<dyn FnOnce() + Send>;

pub struct WireMessage {
    header: WireHeader,
    /// Encoded header. Present once sealed.
    header_chunk: Option<Bytes>,
    payload: Vec<Bytes>,
    state: State,
    checksum: bool,
    pool: ChunkPool,
    on_sent: Option<SentCallback>,
}

impl WireMessage {
    pub fn new(header: WireHeader, payload: Vec<Bytes>, pool: &ChunkPool) -> Self {
        Self {
            header,
            header_chunk: None,
            payload,
            state: State::Unsealed,
            checksum: false,
            pool: pool.clone(),
            on_sent: None,
        }
    }

    /// Message whose payload is the finalized content of `out`.
    pub fn from_output(message_type: MessageType, out: ByteBufferOutput) -> Self {
        let pool = out.pool().clone();
        Self::new(WireHeader::new(message_type), out.finalize(), &pool)
    }

    /// A message assembled from received bytes. Already sealed.
    pub(crate) fn received(
        header: WireHeader,
        header_chunk: Bytes,
        payload: Vec<Bytes>,
        pool: &ChunkPool,
    ) -> Self {
        Self {
            header,
            header_chunk: Some(header_chunk),
            payload,
            state: State::Sealed,
            checksum: false,
            pool: pool.clone(),
            on_sent: None,
        }
    }

    /// Split one contiguous frame into header and payload views over the
    /// same storage.
    pub fn parse(frame: Bytes, max_data_length: u32, pool: &ChunkPool) -> Result<Self, ProtocolError> {
        let header = WireHeader::decode(&frame, max_data_length)?;
        let header_len = header.header_length();
        let expected = header_len + header.data_length() as usize;
        if frame.len() < expected {
            return Err(ProtocolError::Stream(StreamError::EndOfStream {
                needed: expected,
                available: frame.len(),
            }));
        }
        if frame.len() > expected {
            return Err(ProtocolError::OverDelivery {
                offered: frame.len(),
                free: expected,
            });
        }
        let header_chunk = frame.slice(..header_len);
        let payload = if expected > header_len {
            vec![frame.slice(header_len..)]
        } else {
            Vec::new()
        };
        Ok(Self::received(header, header_chunk, payload, pool))
    }

    /// Compute a header checksum when sealing.
    pub fn with_checksum(mut self, enabled: bool) -> Self {
        self.checksum = enabled;
        self
    }

    pub fn header(&self) -> &WireHeader {
        &self.header
    }

    pub fn header_mut(&mut self) -> Result<&mut WireHeader, MessageError> {
        self.check_unsealed()?;
        Ok(&mut self.header)
    }

    pub fn message_type(&self) -> Result<MessageType, ProtocolError> {
        MessageType::try_from(self.header.message_type())
    }

    /// Replace the payload of an unsealed message. The previous chunks go
    /// back to the pool.
    pub fn set_payload(&mut self, payload: Vec<Bytes>) -> Result<(), MessageError> {
        self.check_unsealed()?;
        for chunk in std::mem::replace(&mut self.payload, payload) {
            self.pool.recycle_frozen(chunk);
        }
        Ok(())
    }

    pub fn set_sent_callback(&mut self, callback: impl FnOnce() + Send + 'static) {
        self.on_sent = Some(Box::new(callback));
    }

    pub fn is_sealed(&self) -> bool {
        self.state == State::Sealed
    }

    pub fn is_recycled(&self) -> bool {
        self.state == State::Recycled
    }

    /// Fix the lengths and build the header chunk. One time only.
    pub fn seal(&mut self) -> Result<(), MessageError> {
        self.check_unsealed()?;
        let data_len = total_len(&self.payload) as u64;
        if data_len > i32::MAX as u64 {
            return Err(MessageError::LengthOverflow(
                data_len + self.header.header_length() as u64,
            ));
        }
        self.header.set_data_length(data_len as u32);
        if self.checksum {
            self.header.compute_checksum();
        }
        self.header_chunk = Some(self.header.to_bytes());
        self.state = State::Sealed;
        tracing::trace!(
            message_type = self.header.message_type(),
            data_len,
            "wire message sealed"
        );
        Ok(())
    }

    pub fn header_length(&self) -> Result<u32, MessageError> {
        self.check_sealed()?;
        Ok(self.header.header_length() as u32)
    }

    pub fn data_length(&self) -> Result<u32, MessageError> {
        self.check_sealed()?;
        Ok(self.header.data_length())
    }

    pub fn total_length(&self) -> Result<u32, MessageError> {
        Ok(self.header_length()? + self.data_length()?)
    }

    /// Header chunk followed by the payload chunks, ready for a vectored
    /// socket write.
    pub fn entire_message(&self) -> Result<Vec<Bytes>, MessageError> {
        self.check_sealed()?;
        let mut out = Vec::with_capacity(self.payload.len() + 1);
        out.extend(self.header_chunk.iter().cloned());
        out.extend(self.payload.iter().cloned());
        Ok(out)
    }

    pub fn payload(&self) -> Result<&[Bytes], MessageError> {
        self.check_live()?;
        Ok(&self.payload)
    }

    /// Read cursor over the payload. Shares chunk storage.
    pub fn payload_input(&self) -> Result<ByteBufferInput, MessageError> {
        Ok(ByteBufferInput::new(self.payload()?.to_vec()))
    }

    /// Fire the completion callback, at most once, then recycle.
    pub fn was_sent(&mut self) -> Result<(), MessageError> {
        self.check_sealed()?;
        if let Some(callback) = self.on_sent.take() {
            callback();
        }
        self.recycle();
        Ok(())
    }

    /// Return every chunk to the pool. Recycling twice is a bug: it trips a
    /// debug assertion and is otherwise ignored.
    pub fn recycle(&mut self) {
        if self.state == State::Recycled {
            debug_assert!(false, "wire message recycled twice");
            tracing::warn!(
                message_type = self.header.message_type(),
                "wire message recycled twice, ignoring"
            );
            return;
        }
        let aliased = self.header_aliases_payload();
        if let Some(header) = self.header_chunk.take() {
            if !aliased {
                self.pool.recycle_frozen(header);
            }
        }
        for chunk in self.payload.drain(..) {
            self.pool.recycle_frozen(chunk);
        }
        self.state = State::Recycled;
    }

    /// True when the header chunk and the first payload chunk are adjacent
    /// views of one allocation, as produced by [`parse`](Self::parse).
    fn header_aliases_payload(&self) -> bool {
        match (&self.header_chunk, self.payload.first()) {
            (Some(header), Some(first)) => {
                header.as_ptr().wrapping_add(header.len()) == first.as_ptr()
            }
            _ => false,
        }
    }

    fn check_unsealed(&self) -> Result<(), MessageError> {
        match self.state {
            State::Unsealed => Ok(()),
            State::Sealed => Err(MessageError::AlreadySealed),
            State::Recycled => Err(MessageError::Recycled),
        }
    }

    fn check_sealed(&self) -> Result<(), MessageError> {
        match self.state {
            State::Sealed => Ok(()),
            State::Unsealed => Err(MessageError::NotSealed),
            State::Recycled => Err(MessageError::Recycled),
        }
    }

    fn check_live(&self) -> Result<(), MessageError> {
        match self.state {
            State::Recycled => Err(MessageError::Recycled),
            _ => Ok(()),
        }
    }
}

impl std::fmt::Debug for WireMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireMessage")
            .field("message_type", &self.header.message_type())
            .field("state", &self.state)
            .field("payload_chunks", &self.payload.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use bytes::BufMut;

    use super::*;

    const MAX: u32 = 1 << 20;

    fn ping(pool: &ChunkPool, payload: &[&'static [u8]]) -> WireMessage {
        let chunks = payload.iter().copied().map(Bytes::from_static).collect();
        WireMessage::new(WireHeader::new(MessageType::Ping), chunks, pool)
    }

    #[test]
    fn seal_fixes_lengths() {
        let pool = ChunkPool::new(64, 4);
        let mut msg = ping(&pool, &[b"hello", b" ", b"world"]);
        assert_eq!(msg.total_length(), Err(MessageError::NotSealed));

        msg.seal().unwrap();
        assert_eq!(msg.header_length().unwrap(), 16);
        assert_eq!(msg.data_length().unwrap(), 11);
        assert_eq!(msg.total_length().unwrap(), 27);
        assert_eq!(msg.entire_message().unwrap().len(), 4);
        assert_eq!(msg.seal(), Err(MessageError::AlreadySealed));
        assert!(msg.header_mut().is_err());
        assert!(msg.set_payload(Vec::new()).is_err());
    }

    #[test]
    fn sealed_frame_parses_back() {
        let pool = ChunkPool::new(64, 4);
        let mut msg = ping(&pool, &[b"abc", b"def"]).with_checksum(true);
        msg.header_mut().unwrap().set_options(&[1, 2]).unwrap();
        msg.seal().unwrap();

        let frame: Vec<u8> = msg
            .entire_message()
            .unwrap()
            .iter()
            .flat_map(|c| c.iter().copied())
            .collect();
        let parsed = WireMessage::parse(Bytes::from(frame), MAX, &pool).unwrap();
        assert_eq!(parsed.message_type().unwrap(), MessageType::Ping);
        assert_eq!(parsed.header().options(), &[1, 2, 0, 0]);
        assert_ne!(parsed.header().checksum(), 0);
        assert_eq!(parsed.total_length().unwrap(), 20 + 6);
        assert_eq!(&parsed.payload().unwrap()[0][..], b"abcdef");
    }

    #[test]
    fn parse_rejects_length_mismatch() {
        let pool = ChunkPool::new(64, 4);
        let mut msg = ping(&pool, &[b"abc"]);
        msg.seal().unwrap();
        let mut frame: Vec<u8> = msg
            .entire_message()
            .unwrap()
            .iter()
            .flat_map(|c| c.iter().copied())
            .collect();
        frame.push(0);
        assert!(matches!(
            WireMessage::parse(Bytes::from(frame.clone()), MAX, &pool),
            Err(ProtocolError::OverDelivery { .. })
        ));
        frame.truncate(17);
        assert!(matches!(
            WireMessage::parse(Bytes::from(frame), MAX, &pool),
            Err(ProtocolError::Stream(_))
        ));
    }

    #[test]
    fn was_sent_fires_once_and_recycles() {
        let pool = ChunkPool::new(64, 4);
        let fired = Arc::new(AtomicUsize::new(0));
        let mut msg = ping(&pool, &[b"x"]);
        let counter = fired.clone();
        msg.set_sent_callback(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(msg.was_sent(), Err(MessageError::NotSealed));
        msg.seal().unwrap();
        msg.was_sent().unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(msg.is_recycled());
        assert_eq!(msg.payload(), Err(MessageError::Recycled));
        assert_eq!(msg.was_sent(), Err(MessageError::Recycled));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn aliased_header_is_released_once() {
        let pool = ChunkPool::new(64, 4);
        let mut buf = pool.acquire(64);
        let mut header = WireHeader::new(MessageType::Pong);
        header.set_data_length(8);
        buf.put_slice(&header.to_bytes());
        buf.put_slice(b"payload!");
        assert_eq!(pool.leased(), 1);

        let mut msg = WireMessage::parse(buf.freeze(), MAX, &pool).unwrap();
        assert!(msg.header_aliases_payload());
        msg.was_sent().unwrap();
        assert_eq!(pool.leased(), 0);
    }

    #[test]
    fn zero_length_payload() {
        let pool = ChunkPool::new(64, 4);
        let mut msg = ping(&pool, &[]);
        msg.seal().unwrap();
        assert_eq!(msg.total_length().unwrap(), 16);
        let frame = msg.entire_message().unwrap().remove(0);
        let parsed = WireMessage::parse(frame, MAX, &pool).unwrap();
        assert!(parsed.payload().unwrap().is_empty());
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "recycled twice")]
    fn double_recycle_asserts() {
        let pool = ChunkPool::new(64, 4);
        let mut msg = ping(&pool, &[b"x"]);
        msg.recycle();
        msg.recycle();
    }
}
