//! Compression codec for snapshot content.
//!
//! Content is LZ4 block-compressed with the uncompressed length prepended.
//! Rows written before compression existed have no storage type and carry
//! plain UTF-8; [`decode_content`] reads both.

use crate::error::{HistoryError, Result};
use crate::types::EditRecord;

/// Compress text. The empty string compresses to an empty buffer.
pub fn compress(text: &str) -> Vec<u8> {
    if text.is_empty() {
        return Vec::new();
    }
    lz4_flex::compress_prepend_size(text.as_bytes())
}

/// Decompress bytes produced by [`compress`].
pub fn decompress(bytes: &[u8]) -> Result<String> {
    if bytes.is_empty() {
        return Ok(String::new());
    }
    let raw = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| HistoryError::Security(format!("decompression failed: {e}")))?;
    String::from_utf8(raw)
        .map_err(|e| HistoryError::Security(format!("decompressed content is not UTF-8: {e}")))
}

/// Read the payload of a stored record, full text or patch.
pub fn decode_content(record: &EditRecord) -> Result<String> {
    if record.is_legacy() {
        return decode_legacy(&record.content);
    }
    decompress(&record.content)
}

fn decode_legacy(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|e| HistoryError::Security(format!("legacy content is not UTF-8: {e}")))
}
