//! CORDIS open-data SPARQL endpoint.
//!
//! Searches project publications whose title contains the query and returns
//! their download URL. Publications without one get a `cordis://<title>`
//! reference that is scored from its title and description and never fetched.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use crate::analysis::significant_words;
use crate::backend::{paginate, BackendKind, SearchBackend, SearchHit, SearchMode, SearchRequest};
use crate::fetcher_http::HttpDownloader;
use crate::{Result, SweepError};

pub const SPARQL_ENDPOINT: &str = "https://cordis.europa.eu/datalab/sparql";

/// Scheme of references that have no downloadable document.
pub const CORDIS_SCHEME: &str = "cordis://";

const SPARQL_ACCEPT: &str = "application/sparql-results+json, application/json";
const DESCRIPTION_CHARS: usize = 200;

#[derive(Debug, Deserialize)]
struct SparqlResponse {
    results: SparqlResults,
}

#[derive(Debug, Deserialize)]
struct SparqlResults {
    #[serde(default)]
    bindings: Vec<HashMap<String, SparqlValue>>,
}

#[derive(Debug, Deserialize)]
struct SparqlValue {
    value: String,
}

/// Structured project API backend.
pub struct CordisApi {
    downloader: Arc<HttpDownloader>,
    endpoint: String,
    page_size: usize,
}

impl CordisApi {
    pub fn new(downloader: Arc<HttpDownloader>) -> Self {
        Self {
            downloader,
            endpoint: SPARQL_ENDPOINT.to_string(),
            page_size: 20,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    async fn fetch_page(&self, request: &SearchRequest, page: usize) -> Result<Vec<SearchHit>> {
        let query = sparql_query(request, self.page_size, page * self.page_size);
        debug!(page, "SPARQL query: {}", query);
        let body = self
            .downloader
            .post_form(&self.endpoint, &[("query", query)], SPARQL_ACCEPT)
            .await?;
        parse_bindings(&body)
    }
}

#[async_trait]
impl SearchBackend for CordisApi {
    fn kind(&self) -> BackendKind {
        BackendKind::CordisApi
    }

    async fn search(&self, request: &SearchRequest) -> Result<Vec<SearchHit>> {
        let hits = paginate(request.max_pages, |page| self.fetch_page(request, page)).await?;
        info!(query = %request.query, hits = hits.len(), "CORDIS API search finished");
        Ok(hits)
    }
}

fn escape_literal(text: &str) -> String {
    text.to_lowercase().replace('\\', "\\\\").replace('"', "\\\"")
}

/// Exact mode matches the whole query in the title; broad mode requires each
/// significant word.
pub fn sparql_query(request: &SearchRequest, limit: usize, offset: usize) -> String {
    let mut needles = match request.mode {
        SearchMode::Exact => vec![request.query.trim().to_string()],
        SearchMode::Broad => significant_words(&request.query),
    };
    if needles.is_empty() {
        needles.push(request.query.trim().to_string());
    }
    let filters = needles
        .iter()
        .map(|n| format!("CONTAINS(LCASE(STR(?pubTitle)), \"{}\")", escape_literal(n)))
        .collect::<Vec<_>>()
        .join(" && ");

    format!(
        r#"PREFIX eurio: <http://data.europa.eu/s66#>
SELECT ?pubTitle ?pubUrl ?projectTitle ?projectDesc WHERE {{
  ?pub a eurio:ProjectPublication .
  ?pub eurio:title ?pubTitle .
  OPTIONAL {{ ?pub eurio:hasDownloadURL ?pubUrl }}
  OPTIONAL {{
    ?pub eurio:hasProject ?proj .
    ?proj eurio:title ?projectTitle .
    OPTIONAL {{ ?proj eurio:description ?projectDesc }}
  }}
  FILTER({filters})
}}
LIMIT {limit}
OFFSET {offset}"#
    )
}

/// Converts a SPARQL JSON result set into hits.
pub fn parse_bindings(body: &str) -> Result<Vec<SearchHit>> {
    let response: SparqlResponse = serde_json::from_str(body)
        .map_err(|e| SweepError::Parse(format!("Invalid SPARQL response: {}", e)))?;

    let value = |row: &HashMap<String, SparqlValue>, key: &str| {
        row.get(key)
            .map(|v| v.value.trim().to_string())
            .filter(|v| !v.is_empty())
    };

    Ok(response
        .results
        .bindings
        .iter()
        .map(|row| {
            let title = value(row, "pubTitle").unwrap_or_else(|| "No Title".to_string());
            let url = value(row, "pubUrl").unwrap_or_else(|| format!("{}{}", CORDIS_SCHEME, title));
            let project = value(row, "projectTitle").unwrap_or_default();
            let summary: String = value(row, "projectDesc")
                .unwrap_or_default()
                .chars()
                .take(DESCRIPTION_CHARS)
                .collect();
            SearchHit::new(url, title, format!("Project: {}. {}...", project, summary))
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DelaySettings;
    use crate::delay::AdaptiveDelay;
    use crate::proxy::ProxyPool;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn downloader() -> Arc<HttpDownloader> {
        let delay = Arc::new(AdaptiveDelay::new(&DelaySettings {
            initial_ms: 0,
            floor_ms: 0,
            ceiling_ms: 0,
            jitter: 0.0,
        }));
        Arc::new(HttpDownloader::new(delay, Arc::new(ProxyPool::new())).with_retry(1, Duration::ZERO))
    }

    const TWO_ROWS: &str = r#"{"head":{"vars":[]},"results":{"bindings":[
        {"pubTitle":{"type":"literal","value":"Cotton fibre quality"},
         "pubUrl":{"type":"uri","value":"https://cordis.europa.eu/docs/cotton.pdf"},
         "projectTitle":{"type":"literal","value":"COTFIB"},
         "projectDesc":{"type":"literal","value":"Improving cotton."}},
        {"pubTitle":{"type":"literal","value":"Cotton genome"}}
    ]}}"#;

    #[test]
    fn test_parse_bindings_formats_hits() {
        let hits = parse_bindings(TWO_ROWS).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].url, "https://cordis.europa.eu/docs/cotton.pdf");
        assert_eq!(hits[0].description, "Project: COTFIB. Improving cotton....");
        assert_eq!(hits[1].url, "cordis://Cotton genome");
        assert_eq!(hits[1].description, "Project: . ...");
    }

    #[test]
    fn test_description_is_truncated() {
        let long = "x".repeat(500);
        let body = format!(
            r#"{{"results":{{"bindings":[{{"pubTitle":{{"value":"T"}},"projectDesc":{{"value":"{}"}}}}]}}}}"#,
            long
        );
        let hits = parse_bindings(&body).unwrap();
        assert_eq!(hits[0].description.len(), "Project: . ".len() + 200 + 3);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(parse_bindings("<html>"), Err(SweepError::Parse(_))));
    }

    #[test]
    fn test_query_modes() {
        let broad = sparql_query(&SearchRequest::new("Cotton and wool"), 20, 40);
        assert!(broad.contains("CONTAINS(LCASE(STR(?pubTitle)), \"cotton\")"));
        assert!(broad.contains("\"wool\""));
        assert!(!broad.contains("\"and\""));
        assert!(broad.contains("LIMIT 20"));
        assert!(broad.contains("OFFSET 40"));

        let exact = sparql_query(
            &SearchRequest::new("Cotton \"raw\"").with_mode(SearchMode::Exact),
            10,
            0,
        );
        assert!(exact.contains(r#""cotton \"raw\"""#));
    }

    #[tokio::test]
    async fn test_search_pages_until_empty() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sparql"))
            .respond_with(ResponseTemplate::new(200).set_body_string(TWO_ROWS))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/sparql"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"results":{"bindings":[]}}"#))
            .expect(3)
            .mount(&server)
            .await;

        let api = CordisApi::new(downloader())
            .with_endpoint(format!("{}/sparql", server.uri()))
            .with_page_size(2);
        let hits = api
            .search(&SearchRequest::new("cotton").with_max_pages(10))
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[tokio::test]
    async fn test_search_error_on_first_page() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let api = CordisApi::new(downloader()).with_endpoint(format!("{}/sparql", server.uri()));
        assert!(api.search(&SearchRequest::new("cotton")).await.is_err());
    }
}
