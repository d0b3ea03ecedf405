//! Search backend trait and the types flowing out of it.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::registry::SearchTerm;
use crate::{Result, SweepError};

/// Available search backends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Structured project API, plain HTTP.
    #[default]
    CordisApi,
    /// Project site search through the browser.
    CordisSite,
    Google,
    DuckDuckGo,
}

impl BackendKind {
    pub const ALL: [BackendKind; 4] = [
        BackendKind::CordisApi,
        BackendKind::CordisSite,
        BackendKind::Google,
        BackendKind::DuckDuckGo,
    ];

    /// Short identifier used on the command line and in output file names.
    pub fn slug(&self) -> &'static str {
        match self {
            BackendKind::CordisApi => "cordis-api",
            BackendKind::CordisSite => "cordis",
            BackendKind::Google => "google",
            BackendKind::DuckDuckGo => "ddg",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            BackendKind::CordisApi => "CORDIS API",
            BackendKind::CordisSite => "CORDIS",
            BackendKind::Google => "Google",
            BackendKind::DuckDuckGo => "DuckDuckGo",
        }
    }

    /// Whether searching (and fetching results) goes through the browser pool.
    pub fn requires_browser(&self) -> bool {
        !matches!(self, BackendKind::CordisApi)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

impl FromStr for BackendKind {
    type Err = SweepError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cordis-api" | "cordis_api" | "api" => Ok(BackendKind::CordisApi),
            "cordis" | "cordis-site" => Ok(BackendKind::CordisSite),
            "google" | "g" => Ok(BackendKind::Google),
            "ddg" | "duckduckgo" => Ok(BackendKind::DuckDuckGo),
            other => Err(SweepError::Config(format!("unknown backend '{}'", other))),
        }
    }
}

/// How the query text is matched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    #[default]
    Broad,
    /// The whole query as a quoted phrase.
    Exact,
}

impl SearchMode {
    pub fn apply(&self, query: &str) -> String {
        match self {
            SearchMode::Broad => query.to_string(),
            SearchMode::Exact => format!("\"{}\"", query.trim_matches('"')),
        }
    }
}

impl FromStr for SearchMode {
    type Err = SweepError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "broad" => Ok(SearchMode::Broad),
            "exact" => Ok(SearchMode::Exact),
            other => Err(SweepError::Config(format!("unknown search mode '{}'", other))),
        }
    }
}

/// One query sent to a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    pub mode: SearchMode,
    /// Restricts web engines to one site (`site:` operator).
    pub site_domain: Option<String>,
    pub max_pages: usize,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            mode: SearchMode::Broad,
            site_domain: None,
            max_pages: 10,
        }
    }

    pub fn with_mode(mut self, mode: SearchMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_site(mut self, domain: impl Into<String>) -> Self {
        let domain = domain.into();
        self.site_domain = (!domain.trim().is_empty()).then_some(domain);
        self
    }

    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }

    /// Query text for a general web engine: mode applied, site filter prepended.
    pub fn web_query(&self) -> String {
        let query = self.mode.apply(&self.query);
        match &self.site_domain {
            Some(domain) => format!("site:{} {}", domain.trim(), query),
            None => query,
        }
    }
}

/// A raw search result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    pub url: String,
    pub title: String,
    pub description: String,
}

impl SearchHit {
    pub fn new(url: impl Into<String>, title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
            description: description.into(),
        }
    }
}

/// An unfetched search hit tied to the term that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateReference {
    pub url: String,
    pub title: String,
    pub description: String,
    pub term: SearchTerm,
    pub backend: BackendKind,
}

impl CandidateReference {
    pub fn from_hit(hit: SearchHit, term: &SearchTerm, backend: BackendKind) -> Self {
        Self {
            url: hit.url,
            title: hit.title,
            description: hit.description,
            term: term.clone(),
            backend,
        }
    }

    /// Deduplication key.
    pub fn normalized_url(&self) -> String {
        normalize_url(&self.url)
    }
}

/// Normalized URL for deduplication and caching: no scheme, no fragment,
/// no trailing slash, lowercase host. Path and query keep their case.
pub fn normalize_url(url: &str) -> String {
    let url = url.trim();
    let url = url.split('#').next().unwrap_or(url);
    let url = ["https://", "http://"]
        .iter()
        .find_map(|scheme| {
            url.get(..scheme.len())
                .filter(|prefix| prefix.eq_ignore_ascii_case(scheme))
                .map(|_| &url[scheme.len()..])
        })
        .unwrap_or(url)
        .trim_end_matches('/');
    match url.find(|c| c == '/' || c == '?') {
        Some(split) => format!("{}{}", url[..split].to_lowercase(), &url[split..]),
        None => url.to_lowercase(),
    }
}

/// A source of search hits.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Runs one query, following pagination up to `request.max_pages`.
    async fn search(&self, request: &SearchRequest) -> Result<Vec<SearchHit>>;

    fn name(&self) -> &str {
        self.kind().display_name()
    }

    fn requires_browser(&self) -> bool {
        self.kind().requires_browser()
    }
}

/// Consecutive empty pages after which pagination stops.
pub const MAX_EMPTY_PAGES: usize = 3;

/// Drives a page-by-page search. `fetch_page` receives the 0-based page index.
///
/// Stops after [`MAX_EMPTY_PAGES`] consecutive empty pages, on a non-empty page
/// that adds no new URL (past the first page), or at `max_pages`. A failure on
/// the first page is returned; later failures end pagination with the hits
/// gathered so far.
pub async fn paginate<F, Fut>(max_pages: usize, mut fetch_page: F) -> Result<Vec<SearchHit>>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<Vec<SearchHit>>>,
{
    let mut hits = Vec::new();
    let mut seen = HashSet::new();
    let mut empty_streak = 0;

    for page in 0..max_pages.max(1) {
        let page_hits = match fetch_page(page).await {
            Ok(page_hits) => page_hits,
            Err(e) if page == 0 => return Err(e),
            Err(e) => {
                warn!(page, "Stopping pagination after page error: {}", e);
                break;
            }
        };

        if page_hits.is_empty() {
            empty_streak += 1;
            debug!(page, empty_streak, "Empty result page");
            if empty_streak >= MAX_EMPTY_PAGES {
                break;
            }
            continue;
        }
        empty_streak = 0;

        let mut added = 0;
        for hit in page_hits {
            if seen.insert(normalize_url(&hit.url)) {
                hits.push(hit);
                added += 1;
            }
        }
        if added == 0 && page > 0 {
            debug!(page, "Page repeated earlier results, stopping");
            break;
        }
    }
    Ok(hits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn hits(urls: &[&str]) -> Vec<SearchHit> {
        urls.iter().map(|u| SearchHit::new(*u, "t", "d")).collect()
    }

    #[test]
    fn test_backend_kind_parse_and_slug() {
        for kind in BackendKind::ALL {
            assert_eq!(kind.slug().parse::<BackendKind>().unwrap(), kind);
        }
        assert_eq!("DuckDuckGo".parse::<BackendKind>().unwrap(), BackendKind::DuckDuckGo);
        assert!("bing".parse::<BackendKind>().is_err());
        assert!(!BackendKind::CordisApi.requires_browser());
        assert!(BackendKind::Google.requires_browser());
    }

    #[test]
    fn test_backend_kind_serde() {
        let json = serde_json::to_string(&BackendKind::CordisApi).unwrap();
        assert_eq!(json, "\"cordis-api\"");
    }

    #[test]
    fn test_search_mode() {
        assert_eq!(SearchMode::Exact.apply("iron ore"), "\"iron ore\"");
        assert_eq!(SearchMode::Exact.apply("\"iron ore\""), "\"iron ore\"");
        assert_eq!(SearchMode::Broad.apply("iron ore"), "iron ore");
        assert_eq!("EXACT".parse::<SearchMode>().unwrap(), SearchMode::Exact);
    }

    #[test]
    fn test_web_query() {
        let request = SearchRequest::new("cotton")
            .with_mode(SearchMode::Exact)
            .with_site("europa.eu");
        assert_eq!(request.web_query(), "site:europa.eu \"cotton\"");
        let request = SearchRequest::new("cotton").with_site("  ");
        assert!(request.site_domain.is_none());
        assert_eq!(request.web_query(), "cotton");
    }

    #[test]
    fn test_normalize_url() {
        assert_eq!(normalize_url("https://Example.com/A/"), "example.com/A");
        assert_eq!(normalize_url("HTTPS://WWW.Example.com"), "www.example.com");
        assert_eq!(normalize_url("http://example.com/a#section"), "example.com/a");
        assert_eq!(
            normalize_url("https://example.com/a?x=1"),
            normalize_url("http://EXAMPLE.com/a?x=1/")
        );
    }

    #[test]
    fn test_normalize_url_keeps_path_and_query_case() {
        assert_ne!(
            normalize_url("https://e.org/doc?id=AbC"),
            normalize_url("https://e.org/doc?id=abc")
        );
        assert_eq!(
            normalize_url("https://E.ORG/Report.PDF?id=AbC"),
            "e.org/Report.PDF?id=AbC"
        );
        assert_eq!(normalize_url("https://e.org?q=X"), "e.org?q=X");
    }

    #[test]
    fn test_candidate_from_hit() {
        let term = SearchTerm::new("01.0", "Cotton");
        let candidate = CandidateReference::from_hit(
            SearchHit::new("https://example.com/x/", "T", "D"),
            &term,
            BackendKind::Google,
        );
        assert_eq!(candidate.term, term);
        assert_eq!(candidate.normalized_url(), "example.com/x");
    }

    #[tokio::test]
    async fn test_paginate_stops_at_max_pages() {
        let result = paginate(3, |page| async move {
            Ok(hits(&[&format!("https://e.com/{}", page)]))
        })
        .await
        .unwrap();
        assert_eq!(result.len(), 3);
    }

    #[tokio::test]
    async fn test_paginate_stops_after_three_empty_pages() {
        let calls = AtomicUsize::new(0);
        let result = paginate(10, |page| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if page == 0 {
                    Ok(hits(&["https://e.com/0"]))
                } else {
                    Ok(Vec::new())
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_paginate_empty_streak_resets() {
        let result = paginate(6, |page| async move {
            match page {
                0 | 3 => Ok(hits(&[&format!("https://e.com/{}", page)])),
                _ => Ok(Vec::new()),
            }
        })
        .await
        .unwrap();
        assert_eq!(result.len(), 2);
    }

    #[tokio::test]
    async fn test_paginate_stops_on_repeated_page() {
        let calls = AtomicUsize::new(0);
        let result = paginate(10, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(hits(&["https://e.com/a", "https://e.com/b"])) }
        })
        .await
        .unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_paginate_first_page_error_propagates() {
        let result = paginate(5, |_| async {
            Err::<Vec<SearchHit>, _>(SweepError::Timeout("page".to_string()))
        })
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_paginate_later_error_keeps_hits() {
        let result = paginate(5, |page| async move {
            if page == 0 {
                Ok(hits(&["https://e.com/0"]))
            } else {
                Err(SweepError::Timeout("page".to_string()))
            }
        })
        .await
        .unwrap();
        assert_eq!(result.len(), 1);
    }
}
