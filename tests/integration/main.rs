//! Terrace integration test harness.
//!
//! Everything runs in-process: DNA records and group messages go through
//! the full encode → wire message → protocol adaptor → decode path.
//!
//!   cargo test --test integration
//!
//! Set RUST_LOG (e.g. `RUST_LOG=terrace_group=debug`) to see the logs.

mod dna;
mod group;
mod wire;

use std::sync::Once;

use anyhow::{Context, Result};
use bytes::Bytes;
use terrace_core::buffers::ChunkPool;
use terrace_core::wire::{ProtocolAdaptor, WireMessage};

// ── Harness ───────────────────────────────────────────────────────────────────

static TRACING: Once = Once::new();

/// Install a test subscriber once per process.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Seal `message` and push its bytes through a fresh adaptor in pieces of
/// `fragment` bytes, the way a socket would deliver them.
pub fn transmit(mut message: WireMessage, pool: &ChunkPool, fragment: usize) -> Result<Vec<WireMessage>> {
    message.seal()?;
    let bytes: Vec<u8> = message
        .entire_message()?
        .iter()
        .flat_map(|chunk: &Bytes| chunk.iter().copied())
        .collect();
    message.was_sent()?;

    let mut adaptor = ProtocolAdaptor::new(pool, 1 << 20);
    for piece in bytes.chunks(fragment.max(1)) {
        adaptor
            .add_read_data(piece)
            .context("adaptor rejected a well-formed frame")?;
    }
    anyhow::ensure!(adaptor.is_idle(), "adaptor holds a partial message");
    Ok(adaptor.take_messages())
}
