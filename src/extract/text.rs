//! Plain-text documents (txt, csv, json, xml).

use crate::{Result, SweepError};

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

/// Strict UTF-8 with the byte-order mark removed.
pub fn primary(bytes: &[u8]) -> Result<String> {
    let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    String::from_utf8(bytes.to_vec())
        .map_err(|e| SweepError::Extraction(format!("text is not UTF-8: {}", e)))
}

/// Latin-1: every byte is one code point, so this never fails.
pub fn secondary(bytes: &[u8]) -> Result<String> {
    Ok(bytes.iter().map(|&b| b as char).collect())
}
