//! Google search driven like a person on a pooled browser page.
//!
//! This backend requires the `headless` feature. The first result page is
//! reached by typing into the home page search box; later pages use the
//! `start=` parameter on the same page.

use std::sync::Arc;

use async_trait::async_trait;
use chromiumoxide::Page;
use scraper::Html;
use tracing::{debug, info};

use super::{element_text, selector};
use crate::backend::{paginate, BackendKind, SearchBackend, SearchHit, SearchRequest};
use crate::browser::{clear_challenge, current_url, page_html, settle, SessionPool};
use crate::captcha::CaptchaHandler;
use crate::fetcher::WaitStrategy;
use crate::human::{
    accept_consent, scroll_like_human, short_pause, thinking_time, type_like_human, wander_mouse,
    SearchThrottle,
};
use crate::{Result, SweepError};

const HOME_URL: &str = "https://www.google.com/";
const RESULTS_PER_PAGE: usize = 10;
const SEARCH_BOX: &str = "textarea[name=q], input[name=q]";
const THROTTLE_SESSION: &str = "google";

/// Google search backend.
pub struct Google {
    pool: Arc<SessionPool>,
    captcha: Option<Arc<CaptchaHandler>>,
    throttle: Arc<SearchThrottle>,
}

impl Google {
    pub fn new(pool: Arc<SessionPool>, throttle: Arc<SearchThrottle>) -> Self {
        Self {
            pool,
            captcha: None,
            throttle,
        }
    }

    pub fn with_captcha(mut self, handler: Arc<CaptchaHandler>) -> Self {
        self.captcha = Some(handler);
        self
    }

    pub fn page_url(query: &str, page: usize) -> String {
        format!(
            "https://www.google.com/search?q={}&hl=en&start={}",
            urlencoding::encode(query),
            page * RESULTS_PER_PAGE
        )
    }

    fn results_wait() -> WaitStrategy {
        WaitStrategy::Selector {
            css: "#search".to_string(),
            timeout_ms: 40_000,
        }
    }

    async fn first_page(&self, page: &Page, query: &str) -> Result<String> {
        page.goto(HOME_URL)
            .await
            .map_err(|e| SweepError::Browser(format!("Failed to open Google: {}", e)))?;
        settle(page, &WaitStrategy::default()).await;
        accept_consent(page).await;
        wander_mouse(page).await;
        tokio::time::sleep(thinking_time()).await;

        type_like_human(page, SEARCH_BOX, query).await?;
        tokio::time::sleep(short_pause()).await;
        let search_box = page
            .find_element(SEARCH_BOX)
            .await
            .map_err(|e| SweepError::Browser(format!("Search box vanished: {}", e)))?;
        search_box
            .press_key("Enter")
            .await
            .map_err(|e| SweepError::Browser(format!("Failed to submit search: {}", e)))?;
        settle(page, &Self::results_wait()).await;
        page_html(page).await
    }

    async fn next_page(&self, page: &Page, query: &str, index: usize) -> Result<String> {
        tokio::time::sleep(thinking_time()).await;
        page.goto(Self::page_url(query, index))
            .await
            .map_err(|e| SweepError::Browser(format!("Failed to open result page: {}", e)))?;
        settle(page, &Self::results_wait()).await;
        page_html(page).await
    }

    async fn fetch_page(&self, page: &Page, query: &str, index: usize) -> Result<Vec<SearchHit>> {
        let html = if index == 0 {
            self.first_page(page, query).await?
        } else {
            self.next_page(page, query, index).await?
        };
        let url = current_url(page, HOME_URL).await;
        let html = clear_challenge(page, self.captcha.as_deref(), &url, html, &Self::results_wait()).await?;
        scroll_like_human(page).await;
        let hits = parse_results(&html)?;
        debug!(page = index, hits = hits.len(), "Google result page parsed");
        Ok(hits)
    }
}

#[async_trait]
impl SearchBackend for Google {
    fn kind(&self) -> BackendKind {
        BackendKind::Google
    }

    async fn search(&self, request: &SearchRequest) -> Result<Vec<SearchHit>> {
        let query = request.web_query();
        self.throttle.wait(THROTTLE_SESSION).await;

        let pooled = self.pool.checkout().await?;
        let page = pooled.page();
        let result = paginate(request.max_pages, |index| self.fetch_page(page, &query, index)).await;

        match &result {
            Ok(hits) => {
                info!(query = %query, hits = hits.len(), "Google search finished");
                self.pool.checkin(pooled).await;
            }
            Err(_) => self.pool.discard(pooled).await,
        }
        result
    }
}

pub fn parse_results(html: &str) -> Result<Vec<SearchHit>> {
    let document = Html::parse_document(html);

    let container_selector = selector("div.g")?;
    let title_selector = selector("h3")?;
    let link_selector = selector("a[href]")?;
    let snippet_selector = selector("div[data-sncf], div.VwiC3b")?;

    let mut results = Vec::new();

    for element in document.select(&container_selector) {
        let title = match element.select(&title_selector).next() {
            Some(el) => element_text(el),
            None => continue,
        };

        let url = match element.select(&link_selector).next() {
            Some(el) => {
                let href = el.value().attr("href").unwrap_or_default();
                // Google-internal links
                if href.starts_with('/') && !href.starts_with("/url?") {
                    continue;
                }
                if href.starts_with("https://www.google.com/search?") {
                    continue;
                }
                if let Some(q) = href.strip_prefix("/url?q=") {
                    let target = q.split('&').next().unwrap_or(q);
                    urlencoding::decode(target)
                        .map(|t| t.into_owned())
                        .unwrap_or_else(|_| target.to_string())
                } else {
                    href.to_string()
                }
            }
            None => continue,
        };

        let content = element
            .select(&snippet_selector)
            .next()
            .map(element_text)
            .unwrap_or_default();

        if !url.is_empty() && !title.is_empty() {
            results.push(SearchHit::new(url, title, content));
        }
    }

    Ok(results)
}
