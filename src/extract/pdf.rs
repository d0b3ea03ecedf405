//! PDF text extraction.

use std::panic;

use tracing::debug;

use crate::{Result, SweepError};

/// Whole-document extraction with `pdf-extract`.
pub fn primary(bytes: &[u8]) -> Result<String> {
    // pdf-extract panics on some malformed fonts and streams.
    match panic::catch_unwind(|| pdf_extract::extract_text_from_mem(bytes)) {
        Ok(Ok(text)) => Ok(text),
        Ok(Err(e)) => Err(SweepError::Extraction(format!("pdf: {}", e))),
        Err(_) => Err(SweepError::Extraction("pdf: extractor panicked".to_string())),
    }
}

/// Page-by-page extraction with `lopdf`; unreadable pages are skipped.
pub fn secondary(bytes: &[u8]) -> Result<String> {
    let document = lopdf::Document::load_mem(bytes)
        .map_err(|e| SweepError::Extraction(format!("pdf: {}", e)))?;

    let mut pages = Vec::new();
    for number in document.get_pages().keys() {
        match document.extract_text(&[*number]) {
            Ok(text) => pages.push(text),
            Err(e) => debug!("Skipping unreadable PDF page {}: {}", number, e),
        }
    }
    Ok(pages.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_garbage_is_an_error() {
        assert!(primary(b"not a pdf").is_err());
        assert!(secondary(b"not a pdf").is_err());
    }
}
