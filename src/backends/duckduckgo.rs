//! DuckDuckGo HTML endpoint, rendered through a pooled browser page.

use std::sync::Arc;

use async_trait::async_trait;
use scraper::Html;
use tracing::info;

use super::{element_text, selector};
use crate::backend::{paginate, BackendKind, SearchBackend, SearchHit, SearchRequest};
use crate::fetcher::PageRenderer;
use crate::Result;

const BASE_URL: &str = "https://html.duckduckgo.com/html/";
const RESULTS_PER_PAGE: usize = 30;

/// DuckDuckGo search backend.
pub struct DuckDuckGo {
    renderer: Arc<dyn PageRenderer>,
}

impl DuckDuckGo {
    pub fn new(renderer: Arc<dyn PageRenderer>) -> Self {
        Self { renderer }
    }

    /// Result page URL; `s` is the offset of the first result.
    pub fn page_url(query: &str, page: usize) -> String {
        let mut url = format!("{}?q={}", BASE_URL, urlencoding::encode(query));
        if page > 0 {
            let offset = page * RESULTS_PER_PAGE;
            url.push_str(&format!("&s={}&dc={}", offset, offset + 1));
        }
        url
    }

    async fn fetch_page(&self, query: &str, page: usize) -> Result<Vec<SearchHit>> {
        let rendered = self.renderer.render(&Self::page_url(query, page)).await?;
        parse_results(&rendered.html)
    }
}

#[async_trait]
impl SearchBackend for DuckDuckGo {
    fn kind(&self) -> BackendKind {
        BackendKind::DuckDuckGo
    }

    async fn search(&self, request: &SearchRequest) -> Result<Vec<SearchHit>> {
        let query = request.web_query();
        let hits = paginate(request.max_pages, |page| self.fetch_page(&query, page)).await?;
        info!(query = %query, hits = hits.len(), "DuckDuckGo search finished");
        Ok(hits)
    }
}

pub fn parse_results(html: &str) -> Result<Vec<SearchHit>> {
    let document = Html::parse_document(html);
    let result_selector = selector(".result")?;
    let title_selector = selector(".result__title a, a.result__a")?;
    let snippet_selector = selector(".result__snippet")?;

    let mut results = Vec::new();

    for element in document.select(&result_selector) {
        let Some(title_elem) = element.select(&title_selector).next() else {
            continue;
        };
        let title = element_text(title_elem);
        let href = title_elem.value().attr("href").unwrap_or_default();

        let url = if href.contains("duckduckgo.com/l/") {
            extract_redirect_url(href).unwrap_or_else(|| href.to_string())
        } else {
            href.to_string()
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

/// Decodes the target of a `duckduckgo.com/l/?uddg=` redirect link.
pub fn extract_redirect_url(url: &str) -> Option<String> {
    let start = url.find("uddg=")? + "uddg=".len();
    let encoded = &url[start..];
    let encoded = &encoded[..encoded.find('&').unwrap_or(encoded.len())];
    let decoded = urlencoding::decode(encoded).ok()?;
    Some(decoded.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::RenderedPage;
    use std::sync::Mutex;

    struct FakeRenderer {
        pages: Vec<String>,
        urls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PageRenderer for FakeRenderer {
        async fn render(&self, url: &str) -> Result<RenderedPage> {
            let mut urls = self.urls.lock().unwrap();
            let html = self.pages.get(urls.len()).cloned().unwrap_or_default();
            urls.push(url.to_string());
            Ok(RenderedPage::new(url, html))
        }
    }

    fn result(href: &str, title: &str) -> String {
        format!(
            r#"<div class="result"><h2 class="result__title"><a class="result__a" href="{}">{}</a></h2>
               <a class="result__snippet">About {}</a></div>"#,
            href, title, title
        )
    }

    #[test]
    fn test_extract_redirect_url() {
        let url = "//duckduckgo.com/l/?uddg=https%3A%2F%2Fexample.com%2Fpage&rut=abc";
        assert_eq!(extract_redirect_url(url), Some("https://example.com/page".to_string()));
    }

    #[test]
    fn test_extract_redirect_url_no_params() {
        let url = "//duckduckgo.com/l/?uddg=https%3A%2F%2Fexample.com";
        assert_eq!(extract_redirect_url(url), Some("https://example.com".to_string()));
        assert_eq!(extract_redirect_url("https://example.com"), None);
    }

    #[test]
    fn test_parse_results_empty_html() {
        assert!(parse_results("<html><body></body></html>").unwrap().is_empty());
    }

    #[test]
    fn test_parse_results_decodes_links() {
        let html = format!(
            "<html><body>{}{}</body></html>",
            result("//duckduckgo.com/l/?uddg=https%3A%2F%2Fa.org%2Fcotton&rut=1", "Cotton  report"),
            result("https://b.org/", "Wool")
        );
        let hits = parse_results(&html).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].url, "https://a.org/cotton");
        assert_eq!(hits[0].title, "Cotton report");
        assert_eq!(hits[0].description, "About Cotton report");
        assert_eq!(hits[1].url, "https://b.org/");
    }

    #[test]
    fn test_page_url_offsets() {
        assert_eq!(
            DuckDuckGo::page_url("site:a.org cotton", 0),
            "https://html.duckduckgo.com/html/?q=site%3Aa.org%20cotton"
        );
        assert!(DuckDuckGo::page_url("cotton", 2).ends_with("&s=60&dc=61"));
    }

    #[tokio::test]
    async fn test_search_follows_pages() {
        let page1 = format!("<html><body>{}</body></html>", result("https://a.org/1", "One"));
        let page2 = format!("<html><body>{}</body></html>", result("https://a.org/2", "Two"));
        let renderer = Arc::new(FakeRenderer {
            pages: vec![page1.clone(), page2, page1],
            urls: Mutex::new(Vec::new()),
        });
        let ddg = DuckDuckGo::new(renderer.clone());

        let hits = ddg
            .search(&SearchRequest::new("cotton").with_site("a.org").with_max_pages(5))
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        let urls = renderer.urls.lock().unwrap();
        assert_eq!(urls.len(), 3);
        assert!(urls[0].contains("q=site%3Aa.org%20cotton"));
    }
}
