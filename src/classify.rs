//! Media classification of candidate URLs.
//!
//! Classification is computed once per URL, from the path extension first and
//! from a `Content-Type` probe when the extension is inconclusive.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Binary document formats with a dedicated text extractor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocFormat {
    Pdf,
    Word,
    Spreadsheet,
    Presentation,
    PlainText,
}

impl DocFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocFormat::Pdf => "pdf",
            DocFormat::Word => "word",
            DocFormat::Spreadsheet => "spreadsheet",
            DocFormat::Presentation => "presentation",
            DocFormat::PlainText => "text",
        }
    }
}

/// How a URL's content is acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaKind {
    /// Download directly and run the format's extractor.
    Binary(DocFormat),
    /// Render and scrape visible text.
    Page,
    /// Needs a header probe.
    Unknown,
}

impl MediaKind {
    pub fn is_binary(&self) -> bool {
        matches!(self, MediaKind::Binary(_))
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Binary(format) => write!(f, "binary/{}", format.as_str()),
            MediaKind::Page => write!(f, "page"),
            MediaKind::Unknown => write!(f, "unknown"),
        }
    }
}

const PAGE_EXTENSIONS: &[&str] = &["html", "htm", "php", "asp", "aspx", "jsp", "shtml", "xhtml"];

/// Classifies a URL by the extension of its path.
pub fn classify_url(url: &str) -> MediaKind {
    let path = match url::Url::parse(url) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => url
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .to_string(),
    };

    let last_segment = path.rsplit('/').next().unwrap_or_default();
    let extension = match last_segment.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => ext.to_ascii_lowercase(),
        _ => return MediaKind::Unknown,
    };

    if let Some(format) = format_for_extension(&extension) {
        return MediaKind::Binary(format);
    }
    if PAGE_EXTENSIONS.contains(&extension.as_str()) {
        return MediaKind::Page;
    }
    MediaKind::Unknown
}

pub fn format_for_extension(extension: &str) -> Option<DocFormat> {
    match extension.to_ascii_lowercase().as_str() {
        "pdf" => Some(DocFormat::Pdf),
        "docx" | "doc" => Some(DocFormat::Word),
        "xlsx" | "xls" => Some(DocFormat::Spreadsheet),
        "pptx" | "ppt" => Some(DocFormat::Presentation),
        "txt" | "csv" | "json" | "xml" => Some(DocFormat::PlainText),
        _ => None,
    }
}

/// Classifies a `Content-Type` header value.
pub fn classify_content_type(content_type: &str) -> MediaKind {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    match mime.as_str() {
        "application/pdf" | "application/x-pdf" => MediaKind::Binary(DocFormat::Pdf),
        "application/msword"
        | "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => {
            MediaKind::Binary(DocFormat::Word)
        }
        "application/vnd.ms-excel"
        | "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet" => {
            MediaKind::Binary(DocFormat::Spreadsheet)
        }
        "application/vnd.ms-powerpoint"
        | "application/vnd.openxmlformats-officedocument.presentationml.presentation" => {
            MediaKind::Binary(DocFormat::Presentation)
        }
        "text/html" | "application/xhtml+xml" => MediaKind::Page,
        "text/plain" | "text/csv" | "application/json" | "application/xml" | "text/xml" => {
            MediaKind::Binary(DocFormat::PlainText)
        }
        _ => MediaKind::Unknown,
    }
}
