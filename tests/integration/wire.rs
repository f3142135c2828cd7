use crate::*;

use terrace_core::buffers::ByteBufferOutput;
use terrace_core::config::TerraceConfig;
use terrace_core::wire::{MessageType, ProtocolError};

fn ping(pool: &ChunkPool, payload: &[u8], checksum: bool) -> WireMessage {
    let mut out = ByteBufferOutput::new(pool);
    out.write_bytes(payload);
    WireMessage::from_output(MessageType::Ping, out).with_checksum(checksum)
}

#[test]
fn fragment_size_does_not_matter() -> Result<()> {
    init_tracing();
    let pool = ChunkPool::default();
    let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    for fragment in [1, 7, 16, 4096, 1 << 20] {
        let received = transmit(ping(&pool, &payload, true), &pool, fragment)?;
        assert_eq!(received.len(), 1);
        let message = &received[0];
        assert!(message.header().is_checksum_valid());
        assert_eq!(message.data_length()? as usize, payload.len());
        let mut body = vec![0u8; payload.len()];
        message.payload_input()?.read_fully(&mut body)?;
        assert_eq!(body, payload);
    }
    Ok(())
}

#[test]
fn tampered_header_is_fatal() -> Result<()> {
    init_tracing();
    let pool = ChunkPool::default();
    let mut message = ping(&pool, b"payload", true);
    message.seal()?;
    let mut frame: Vec<u8> = message.entire_message()?.concat();
    message.was_sent()?;
    frame[5] ^= 0x01; // type version

    let config = TerraceConfig::default();
    let mut adaptor = ProtocolAdaptor::from_config(&pool, &config.protocol);
    let err = adaptor
        .add_read_data(&frame)
        .expect_err("tampered header accepted");
    assert!(matches!(err, ProtocolError::ChecksumMismatch { .. }));
    Ok(())
}

#[test]
fn parsed_frame_releases_once() -> Result<()> {
    init_tracing();
    let pool = ChunkPool::default();
    let mut message = ping(&pool, b"abc", false);
    message.seal()?;
    let frame = Bytes::from(message.entire_message()?.concat());
    message.was_sent()?;

    let mut parsed = WireMessage::parse(frame, 1024, &pool)?;
    assert_eq!(parsed.total_length()?, parsed.header_length()? + 3);
    parsed.was_sent()?;
    assert!(parsed.is_recycled());
    Ok(())
}
