//! Payload compression.
//!
//! Values at or above the configured threshold are LZ4-compressed before the
//! envelope is written. Compression is skipped when it does not shrink the
//! payload, so already-compressed data is stored as-is.

use crate::error::{Error, Result};
use lz4_flex::{compress_prepend_size, decompress_size_prepended};
use tracing::trace;

/// Compress `data` if it is at least `threshold` bytes and compression
/// actually helps. Returns the stored bytes and whether they are compressed.
pub fn maybe_compress(data: &[u8], threshold: usize) -> (Vec<u8>, bool) {
    if data.len() < threshold {
        return (data.to_vec(), false);
    }
    let compressed = compress_prepend_size(data);
    if compressed.len() >= data.len() {
        trace!(len = data.len(), "compression skipped, no gain");
        return (data.to_vec(), false);
    }
    trace!(
        raw = data.len(),
        compressed = compressed.len(),
        "payload compressed"
    );
    (compressed, true)
}

/// Invert [`maybe_compress`] for an envelope whose compressed marker is set.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    decompress_size_prepended(data)
        .map_err(|e| Error::Serialization(format!("lz4 decompression failed: {e}")))
}
