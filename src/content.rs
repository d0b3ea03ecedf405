//! Content acquisition: URL in, extracted text out.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::analysis::{count_words, keyword_counts, KeywordCounts};
use crate::classify::{classify_content_type, classify_url, DocFormat, MediaKind};
use crate::extract::{extract_document, visible_text};
use crate::fetcher::{PageRenderer, RenderedPage};
use crate::fetcher_http::{HttpDownloader, HttpRenderer};
use crate::{Result, SweepError};

/// Text pulled from one URL.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedDocument {
    pub url: String,
    pub media: MediaKind,
    pub raw_text: String,
    pub word_count: usize,
    /// Filled by [`ExtractedDocument::score`].
    pub keyword_counts: KeywordCounts,
}

impl ExtractedDocument {
    pub fn new(url: impl Into<String>, media: MediaKind, raw_text: impl Into<String>) -> Self {
        let raw_text = raw_text.into();
        Self {
            url: url.into(),
            media,
            word_count: count_words(&raw_text),
            raw_text,
            keyword_counts: KeywordCounts::default(),
        }
    }

    /// Counts the query keywords in the text.
    pub fn score(mut self, query: &str) -> Self {
        self.keyword_counts = keyword_counts(&self.raw_text, query);
        self
    }
}

/// Turns a URL into an [`ExtractedDocument`].
///
/// `allow_browser = false` forbids any browser navigation for this call.
#[async_trait]
pub trait ContentFetcher: Send + Sync {
    async fn fetch(&self, url: &str, allow_browser: bool) -> Result<ExtractedDocument>;
}

/// Production fetcher: classify, then download-and-extract or render.
pub struct ContentAcquirer {
    downloader: Arc<HttpDownloader>,
    http: HttpRenderer,
    browser: Option<Arc<dyn PageRenderer>>,
}

impl ContentAcquirer {
    pub fn new(downloader: Arc<HttpDownloader>) -> Self {
        Self {
            http: HttpRenderer::new(Arc::clone(&downloader)),
            downloader,
            browser: None,
        }
    }

    pub fn with_browser(mut self, renderer: Arc<dyn PageRenderer>) -> Self {
        self.browser = Some(renderer);
        self
    }

    async fn classify(&self, url: &str) -> Result<MediaKind> {
        match classify_url(url) {
            MediaKind::Unknown => {}
            known => return Ok(known),
        }
        match self.downloader.probe(url).await {
            Some(content_type) => match classify_content_type(&content_type) {
                MediaKind::Unknown => Err(SweepError::Extraction(format!(
                    "unsupported content type {} at {}",
                    content_type, url
                ))),
                kind => Ok(kind),
            },
            None => Ok(MediaKind::Page),
        }
    }

    async fn fetch_binary(&self, url: &str, format: DocFormat) -> Result<ExtractedDocument> {
        let download = self.downloader.download(url).await?;
        let text = extract_document(format, download.bytes).await?;
        debug!(url = %url, format = format.as_str(), "Extracted binary document");
        Ok(ExtractedDocument::new(url, MediaKind::Binary(format), text))
    }

    async fn fetch_page(&self, url: &str, allow_browser: bool) -> Result<ExtractedDocument> {
        let renderer: &dyn PageRenderer = match (&self.browser, allow_browser) {
            (Some(browser), true) => browser.as_ref(),
            _ => &self.http,
        };
        let page = renderer.render(url).await?;

        if let Some(format) = redirected_binary(&page) {
            debug!(url = %url, final_url = %page.final_url, "Page resolved to a document");
            return self.fetch_binary(&page.final_url, format).await;
        }

        Ok(ExtractedDocument::new(url, MediaKind::Page, visible_text(&page.html)))
    }
}

/// The document format when a page navigation ended on a file.
fn redirected_binary(page: &RenderedPage) -> Option<DocFormat> {
    if let MediaKind::Binary(format) = classify_url(&page.final_url) {
        return Some(format);
    }
    match page.content_type.as_deref().map(classify_content_type) {
        Some(MediaKind::Binary(format)) => Some(format),
        _ => None,
    }
}

#[async_trait]
impl ContentFetcher for ContentAcquirer {
    async fn fetch(&self, url: &str, allow_browser: bool) -> Result<ExtractedDocument> {
        match self.classify(url).await? {
            MediaKind::Binary(format) => self.fetch_binary(url, format).await,
            _ => self.fetch_page(url, allow_browser).await,
        }
    }
}

/// In-memory fetcher keyed by URL.
#[derive(Default)]
pub struct StaticContentFetcher {
    pages: HashMap<String, String>,
    failures: HashSet<String>,
    latency: HashMap<String, Duration>,
    calls: Mutex<Vec<(String, bool)>>,
}

impl StaticContentFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(mut self, url: impl Into<String>, text: impl Into<String>) -> Self {
        self.pages.insert(url.into(), text.into());
        self
    }

    pub fn with_failure(mut self, url: impl Into<String>) -> Self {
        self.failures.insert(url.into());
        self
    }

    /// Delays answers for `url`.
    pub fn with_latency(mut self, url: impl Into<String>, latency: Duration) -> Self {
        self.latency.insert(url.into(), latency);
        self
    }

    /// Every `(url, allow_browser)` pair seen, in call order.
    pub fn calls(&self) -> Vec<(String, bool)> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl ContentFetcher for StaticContentFetcher {
    async fn fetch(&self, url: &str, allow_browser: bool) -> Result<ExtractedDocument> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((url.to_string(), allow_browser));

        if let Some(latency) = self.latency.get(url) {
            tokio::time::sleep(*latency).await;
        }
        if self.failures.contains(url) {
            return Err(SweepError::Extraction(format!("scripted failure for {}", url)));
        }
        match self.pages.get(url) {
            Some(text) => Ok(ExtractedDocument::new(url, MediaKind::Page, text.clone())),
            None => Err(SweepError::Status {
                status: 404,
                url: url.to_string(),
            }),
        }
    }
}
