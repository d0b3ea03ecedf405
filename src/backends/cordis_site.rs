//! CORDIS site search, rendered through a pooled browser page.

use std::sync::Arc;

use async_trait::async_trait;
use scraper::Html;
use tracing::info;
use url::Url;

use super::{element_text, selector};
use crate::analysis::filter_stop_words;
use crate::backend::{paginate, BackendKind, SearchBackend, SearchHit, SearchMode, SearchRequest};
use crate::fetcher::PageRenderer;
use crate::Result;

const SITE_ROOT: &str = "https://cordis.europa.eu";

/// Site search backend for cordis.europa.eu.
///
/// The renderer is expected to accept the site's consent banner and to wait
/// for `app-card-search` result cards.
pub struct CordisSite {
    renderer: Arc<dyn PageRenderer>,
}

impl CordisSite {
    pub fn new(renderer: Arc<dyn PageRenderer>) -> Self {
        Self { renderer }
    }

    /// Broad queries drop stop words; exact queries are quoted.
    pub fn query_text(request: &SearchRequest) -> String {
        match request.mode {
            SearchMode::Broad => filter_stop_words(&request.query),
            SearchMode::Exact => request.mode.apply(&request.query),
        }
    }

    /// 1-based `p` parameter, ten results per page, archived projects included.
    pub fn page_url(query: &str, page: usize) -> String {
        format!(
            "{}/search?q={}&p={}&num=10&srt=Relevance:decreasing&archived=true",
            SITE_ROOT,
            urlencoding::encode(query),
            page + 1
        )
    }

    async fn fetch_page(&self, query: &str, page: usize) -> Result<Vec<SearchHit>> {
        let rendered = self.renderer.render(&Self::page_url(query, page)).await?;
        parse_results(&rendered.html)
    }
}

#[async_trait]
impl SearchBackend for CordisSite {
    fn kind(&self) -> BackendKind {
        BackendKind::CordisSite
    }

    async fn search(&self, request: &SearchRequest) -> Result<Vec<SearchHit>> {
        let query = Self::query_text(request);
        let hits = paginate(request.max_pages, |page| self.fetch_page(&query, page)).await?;
        info!(query = %query, hits = hits.len(), "CORDIS site search finished");
        Ok(hits)
    }
}

pub fn parse_results(html: &str) -> Result<Vec<SearchHit>> {
    let document = Html::parse_document(html);
    let card_selector = selector("app-card-search")?;
    let title_selector = selector("a.c-card-search__title")?;
    let block_selector = selector("div.c-card-search__block")?;
    let root = Url::parse(SITE_ROOT)?;

    let mut results = Vec::new();
    for card in document.select(&card_selector) {
        let Some(link) = card.select(&title_selector).next() else {
            continue;
        };
        let Some(href) = link.value().attr("href").filter(|h| !h.trim().is_empty()) else {
            continue;
        };
        let url = root.join(href.trim())?.to_string();
        let description = card
            .select(&block_selector)
            .next()
            .map(element_text)
            .unwrap_or_default();
        results.push(SearchHit::new(url, element_text(link), description));
    }
    Ok(results)
}
