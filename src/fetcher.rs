//! Page renderer abstraction for retrieving HTML content.

use async_trait::async_trait;

use crate::Result;

/// Strategy for waiting until a page is considered settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitStrategy {
    /// Wait until a CSS selector matches an element on the page.
    Selector {
        /// CSS selector to wait for.
        css: String,
        /// Maximum time to wait in milliseconds before giving up.
        timeout_ms: u64,
    },
}

impl WaitStrategy {
    /// Upper bound on one settle.
    pub fn timeout(&self) -> std::time::Duration {
        match self {
            WaitStrategy::Selector { timeout_ms, .. } => std::time::Duration::from_millis(*timeout_ms),
        }
    }
}

impl Default for WaitStrategy {
    /// Content settles once `body` exists, bounded at 15 seconds.
    fn default() -> Self {
        WaitStrategy::Selector {
            css: "body".to_string(),
            timeout_ms: 15_000,
        }
    }
}

/// A rendered page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPage {
    /// URL after redirects.
    pub final_url: String,
    pub html: String,
    /// `Content-Type` of the final response, when the transport exposes it.
    pub content_type: Option<String>,
}

impl RenderedPage {
    pub fn new(final_url: impl Into<String>, html: impl Into<String>) -> Self {
        Self {
            final_url: final_url.into(),
            html: html.into(),
            content_type: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// Trait for turning a URL into rendered HTML.
///
/// Implementations may use plain HTTP requests or a headless browser.
/// All configuration (user-agent, timeouts, wait strategy) is set at
/// construction time; `render` is a simple URL-in, page-out interface.
#[async_trait]
pub trait PageRenderer: Send + Sync {
    async fn render(&self, url: &str) -> Result<RenderedPage>;
}
