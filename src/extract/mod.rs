//! Text extraction for pages and binary documents.
//!
//! Every binary format has a primary and a secondary extractor. The secondary
//! one runs when the primary fails or returns near-empty text.

pub mod html;
pub mod office;
pub mod pdf;
pub mod text;

use tracing::debug;

use crate::classify::DocFormat;
use crate::{Result, SweepError};

pub use html::visible_text;

/// Text with fewer non-whitespace characters than this counts as empty.
pub const NEAR_EMPTY_CHARS: usize = 20;

pub fn is_near_empty(text: &str) -> bool {
    text.chars().filter(|c| !c.is_whitespace()).count() < NEAR_EMPTY_CHARS
}

/// Runs the extractor chain for `format` on the current thread.
pub fn extract_blocking(format: DocFormat, bytes: &[u8]) -> Result<String> {
    let first = match format {
        DocFormat::Pdf => pdf::primary(bytes),
        DocFormat::Word | DocFormat::Spreadsheet | DocFormat::Presentation => {
            office::primary(format, bytes)
        }
        DocFormat::PlainText => text::primary(bytes),
    };

    let first = match first {
        Ok(text) if !is_near_empty(&text) => return Ok(text),
        Ok(text) => {
            debug!(format = format.as_str(), "Primary extractor returned near-empty text");
            Some(text)
        }
        Err(e) => {
            debug!(format = format.as_str(), "Primary extractor failed: {}", e);
            None
        }
    };

    let second = match format {
        DocFormat::Pdf => pdf::secondary(bytes),
        DocFormat::Word | DocFormat::Spreadsheet | DocFormat::Presentation => {
            office::secondary(bytes)
        }
        DocFormat::PlainText => text::secondary(bytes),
    };

    let best = match (first, second) {
        (Some(a), Ok(b)) => {
            if b.trim().len() > a.trim().len() {
                b
            } else {
                a
            }
        }
        (Some(a), Err(_)) => a,
        (None, Ok(b)) => b,
        (None, Err(e)) => return Err(e),
    };

    if best.trim().is_empty() {
        return Err(SweepError::Extraction(format!(
            "no text in {} document",
            format.as_str()
        )));
    }
    Ok(best)
}

/// Runs the extractor chain on a blocking thread.
pub async fn extract_document(format: DocFormat, bytes: Vec<u8>) -> Result<String> {
    tokio::task::spawn_blocking(move || extract_blocking(format, &bytes))
        .await
        .map_err(|e| SweepError::Extraction(format!("extraction task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_near_empty() {
        assert!(is_near_empty("   a b c   "));
        assert!(!is_near_empty("twenty-characters-here"));
    }

    #[test]
    fn test_plain_text_chain() {
        let text = "Cotton is grown in many regions of southern Europe.";
        assert_eq!(
            extract_blocking(DocFormat::PlainText, text.as_bytes()).unwrap(),
            text
        );
    }

    #[test]
    fn test_short_text_still_returned() {
        assert_eq!(extract_blocking(DocFormat::PlainText, b"short").unwrap(), "short");
    }

    #[test]
    fn test_empty_document_is_error() {
        assert!(extract_blocking(DocFormat::PlainText, b"   ").is_err());
    }

    #[test]
    fn test_office_falls_back_to_tag_strip() {
        let bytes = office::tests::container(&[(
            "word/other.xml",
            "<w:body><w:x>Text kept outside the main document part</w:x></w:body>",
        )]);
        let text = extract_blocking(DocFormat::Word, &bytes).unwrap();
        assert!(text.contains("Text kept outside"));
    }

    #[tokio::test]
    async fn test_extract_document_async() {
        let text = extract_document(DocFormat::PlainText, b"hello async world".to_vec())
            .await
            .unwrap();
        assert_eq!(text, "hello async world");
    }
}
