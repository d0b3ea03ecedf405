//! Direct HTTP transfers: paced, proxied, cached and retried.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tracing::{debug, warn};

use crate::cache::UrlCache;
use crate::delay::{domain_of, AdaptiveDelay};
use crate::fetcher::{PageRenderer, RenderedPage};
use crate::fingerprint::UserAgentRotator;
use crate::proxy::ProxyPool;
use crate::{Result, SweepError};

/// Bytes of a downloaded resource.
#[derive(Debug, Clone)]
pub struct Download {
    pub final_url: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
    pub from_cache: bool,
}

/// HTTP client wrapper shared by the API backend and content acquisition.
///
/// Every request waits on the per-domain adaptive delay first and reports
/// success or failure back to it. Defense-heavy domains go through the proxy
/// pool. Transient failures (network errors, 429, 5xx) are retried with a
/// linear backoff; other statuses fail immediately.
pub struct HttpDownloader {
    delay: Arc<AdaptiveDelay>,
    proxies: Arc<ProxyPool>,
    cache: Option<Arc<UrlCache>>,
    agents: Mutex<UserAgentRotator>,
    attempts: u32,
    backoff: Duration,
}

impl HttpDownloader {
    /// Three attempts, 2 s x attempt backoff, no cache.
    pub fn new(delay: Arc<AdaptiveDelay>, proxies: Arc<ProxyPool>) -> Self {
        Self {
            delay,
            proxies,
            cache: None,
            agents: Mutex::new(UserAgentRotator::default()),
            attempts: 3,
            backoff: Duration::from_secs(2),
        }
    }

    pub fn with_cache(mut self, cache: Arc<UrlCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.attempts = attempts.max(1);
        self.backoff = backoff;
        self
    }

    pub fn with_agents(mut self, agents: UserAgentRotator) -> Self {
        self.agents = Mutex::new(agents);
        self
    }

    pub fn delay(&self) -> &Arc<AdaptiveDelay> {
        &self.delay
    }

    /// Reads the `Content-Type` with a single HEAD request.
    /// `None` when the server does not answer the probe usefully.
    pub async fn probe(&self, url: &str) -> Option<String> {
        let domain = domain_of(url);
        self.delay.wait(&domain).await;
        let agent = self.next_agent();
        let client = match self.proxies.client_for(url, &agent).await {
            Ok(client) => client,
            Err(e) => {
                debug!(url = %url, "Probe skipped: {}", e);
                return None;
            }
        };

        match client.head(url).send().await {
            Ok(response) if response.status().is_success() => {
                self.delay.record_success(&domain).await;
                content_type(&response)
            }
            Ok(response) => {
                debug!(url = %url, status = response.status().as_u16(), "Probe refused");
                None
            }
            Err(e) => {
                debug!(url = %url, "Probe failed: {}", e);
                None
            }
        }
    }

    /// Downloads `url`, answering from the cache when possible.
    pub async fn download(&self, url: &str) -> Result<Download> {
        if let Some(cache) = &self.cache {
            if let Some(bytes) = cache.get(url).await {
                return Ok(Download {
                    final_url: url.to_string(),
                    content_type: None,
                    bytes,
                    from_cache: true,
                });
            }
        }

        let response = self.execute(url, |client| client.get(url)).await?;
        let final_url = response.url().to_string();
        let content_type = content_type(&response);
        let bytes = response.bytes().await?.to_vec();
        debug!(url = %url, bytes = bytes.len(), "Downloaded");

        if let Some(cache) = &self.cache {
            if let Err(e) = cache.put(url, &bytes).await {
                warn!(url = %url, "Failed to cache download: {}", e);
            }
        }

        Ok(Download {
            final_url,
            content_type,
            bytes,
            from_cache: false,
        })
    }

    /// GETs `url` as text, following redirects.
    pub async fn get_text(&self, url: &str) -> Result<RenderedPage> {
        let response = self.execute(url, |client| client.get(url)).await?;
        let final_url = response.url().to_string();
        let content_type = content_type(&response);
        let body = response.text().await?;
        let mut page = RenderedPage::new(final_url, body);
        page.content_type = content_type;
        Ok(page)
    }

    /// POSTs a form and returns the response body.
    pub async fn post_form(&self, url: &str, form: &[(&str, String)], accept: &str) -> Result<String> {
        let response = self
            .execute(url, |client| client.post(url).header(ACCEPT, accept).form(form))
            .await?;
        Ok(response.text().await?)
    }

    async fn execute<F>(&self, url: &str, build: F) -> Result<Response>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let domain = domain_of(url);
        let mut last_error = None;

        for attempt in 1..=self.attempts {
            self.delay.wait(&domain).await;
            let agent = self.next_agent();
            let client = self.proxies.client_for(url, &agent).await?;

            match build(&client).send().await {
                Ok(response) if response.status().is_success() => {
                    self.delay.record_success(&domain).await;
                    return Ok(response);
                }
                Ok(response) => {
                    let status = response.status();
                    let error = SweepError::Status {
                        status: status.as_u16(),
                        url: url.to_string(),
                    };
                    if !is_retryable(status) {
                        return Err(error);
                    }
                    self.delay.record_failure(&domain).await;
                    last_error = Some(error);
                }
                Err(e) => {
                    self.delay.record_failure(&domain).await;
                    last_error = Some(SweepError::Http(e));
                }
            }

            if attempt < self.attempts {
                let wait = self.backoff * attempt;
                warn!(url = %url, attempt, wait_ms = wait.as_millis() as u64, "Request failed, retrying");
                tokio::time::sleep(wait).await;
            }
        }

        Err(last_error.unwrap_or_else(|| SweepError::Other(format!("no attempt made for {}", url))))
    }

    fn next_agent(&self) -> String {
        self.agents
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .next_agent()
    }
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

fn content_type(response: &Response) -> Option<String> {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// A `PageRenderer` over plain HTTP. No JavaScript runs.
pub struct HttpRenderer {
    downloader: Arc<HttpDownloader>,
}

impl HttpRenderer {
    pub fn new(downloader: Arc<HttpDownloader>) -> Self {
        Self { downloader }
    }
}

#[async_trait]
impl PageRenderer for HttpRenderer {
    async fn render(&self, url: &str) -> Result<RenderedPage> {
        self.downloader.get_text(url).await
    }
}
