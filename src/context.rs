//! Process-wide resources, built once from a [`SweepConfig`].
//!
//! The context owns the per-domain delay table, the download cache, the
//! proxy pool and the CAPTCHA plumbing, and hands each worker a backend and
//! a content fetcher wired to them. Workers that need a browser get their
//! own session pool.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{info, warn};

use crate::backend::{BackendKind, SearchBackend};
use crate::backends::CordisApi;
use crate::cache::UrlCache;
use crate::captcha::{CaptchaHandler, ManualCaptchaChannel};
use crate::config::SweepConfig;
use crate::content::{ContentAcquirer, ContentFetcher};
use crate::delay::AdaptiveDelay;
use crate::fetcher_http::HttpDownloader;
use crate::human::SearchThrottle;
use crate::proxy::ProxyPool;
use crate::Result;

#[cfg(feature = "headless")]
use crate::backends::{CordisSite, DuckDuckGo, Google};
#[cfg(feature = "headless")]
use crate::browser::{BrowserRenderer, SessionPool, SessionPoolConfig};
#[cfg(feature = "headless")]
use crate::fetcher::{PageRenderer, WaitStrategy};

/// The backend and fetcher one worker runs with.
pub struct WorkerStack {
    pub backend: Arc<dyn SearchBackend>,
    pub fetcher: Arc<dyn ContentFetcher>,
    #[cfg(feature = "headless")]
    pub pool: Option<Arc<SessionPool>>,
}

impl WorkerStack {
    pub fn new(backend: Arc<dyn SearchBackend>, fetcher: Arc<dyn ContentFetcher>) -> Self {
        Self {
            backend,
            fetcher,
            #[cfg(feature = "headless")]
            pool: None,
        }
    }

    /// Closes the worker's browser, if it has one.
    pub async fn shutdown(&self) {
        #[cfg(feature = "headless")]
        if let Some(pool) = &self.pool {
            pool.shutdown().await;
        }
    }
}

/// Builds worker stacks.
#[async_trait]
pub trait WorkerProvider: Send + Sync {
    /// Fails with `FatalInit` when a required browser cannot be launched.
    async fn provide(&self, backend: BackendKind, headless: bool) -> Result<WorkerStack>;
}

pub struct SweepContext {
    config: SweepConfig,
    delay: Arc<AdaptiveDelay>,
    cache: Option<Arc<UrlCache>>,
    proxies: Arc<ProxyPool>,
    channel: Arc<ManualCaptchaChannel>,
    captcha: Arc<CaptchaHandler>,
    downloader: Arc<HttpDownloader>,
    throttle: Arc<SearchThrottle>,
}

impl SweepContext {
    /// Validates the configuration and opens the cache.
    pub async fn new(config: SweepConfig) -> Result<Self> {
        config.validate()?;
        let request_timeout = Duration::from_secs(config.extraction.request_timeout_secs);

        let delay = Arc::new(AdaptiveDelay::new(&config.delay));
        let proxies = Arc::new(ProxyPool::from_settings(&config.proxies).with_request_timeout(request_timeout));

        let cache = if config.cache.enabled {
            match UrlCache::open(&config.cache).await {
                Ok(cache) => Some(Arc::new(cache)),
                Err(e) => {
                    warn!("Download cache disabled: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let mut downloader = HttpDownloader::new(Arc::clone(&delay), Arc::clone(&proxies)).with_retry(
            config.extraction.download_attempts,
            Duration::from_millis(config.extraction.retry_backoff_ms),
        );
        if let Some(cache) = &cache {
            downloader = downloader.with_cache(Arc::clone(cache));
        }

        let solver_client = Client::builder().timeout(request_timeout).build()?;
        let channel = Arc::new(ManualCaptchaChannel::new());
        let captcha = Arc::new(CaptchaHandler::from_settings(
            &config.captcha,
            Arc::clone(&channel),
            solver_client,
        ));
        info!(captcha = captcha.path(), cache = cache.is_some(), "Sweep context ready");

        Ok(Self {
            config,
            delay,
            cache,
            proxies,
            channel,
            captcha,
            downloader: Arc::new(downloader),
            throttle: Arc::new(SearchThrottle::new()),
        })
    }

    pub fn config(&self) -> &SweepConfig {
        &self.config
    }

    pub fn delay(&self) -> &Arc<AdaptiveDelay> {
        &self.delay
    }

    pub fn cache(&self) -> Option<&Arc<UrlCache>> {
        self.cache.as_ref()
    }

    pub fn proxies(&self) -> &Arc<ProxyPool> {
        &self.proxies
    }

    pub fn captcha_channel(&self) -> &Arc<ManualCaptchaChannel> {
        &self.channel
    }

    pub fn captcha(&self) -> &Arc<CaptchaHandler> {
        &self.captcha
    }

    pub fn downloader(&self) -> &Arc<HttpDownloader> {
        &self.downloader
    }

    /// Fetcher that never touches a browser.
    pub fn http_fetcher(&self) -> Arc<dyn ContentFetcher> {
        Arc::new(ContentAcquirer::new(Arc::clone(&self.downloader)))
    }

    pub fn cordis_api(&self) -> CordisApi {
        CordisApi::new(Arc::clone(&self.downloader))
            .with_endpoint(self.config.search.cordis_sparql_endpoint.clone())
            .with_page_size(self.config.search.api_page_size)
    }

    /// Launches a browser session pool for one worker.
    #[cfg(feature = "headless")]
    pub async fn session_pool(&self, headless: bool) -> Result<Arc<SessionPool>> {
        let proxy_url = if self.proxies.is_empty().await {
            None
        } else {
            self.proxies.next_proxy().await.map(|p| p.url())
        };
        let pool = SessionPool::new(SessionPoolConfig::from_settings(&self.config.browser, proxy_url));
        pool.initialize(headless).await?;
        Ok(Arc::new(pool))
    }

    #[cfg(feature = "headless")]
    fn renderer(&self, pool: &Arc<SessionPool>) -> BrowserRenderer {
        BrowserRenderer::new(Arc::clone(pool)).with_captcha(Arc::clone(&self.captcha))
    }

    #[cfg(feature = "headless")]
    async fn browser_stack(&self, kind: BackendKind, headless: bool) -> Result<WorkerStack> {
        let pool = self.session_pool(headless).await?;
        let backend: Arc<dyn SearchBackend> = match kind {
            BackendKind::CordisApi => Arc::new(self.cordis_api()),
            BackendKind::CordisSite => {
                let renderer = self.renderer(&pool).with_consent().with_wait(WaitStrategy::Selector {
                    css: "app-card-search".to_string(),
                    timeout_ms: 15_000,
                });
                Arc::new(CordisSite::new(Arc::new(renderer)))
            }
            BackendKind::DuckDuckGo => Arc::new(DuckDuckGo::new(Arc::new(self.renderer(&pool)))),
            BackendKind::Google => Arc::new(
                Google::new(Arc::clone(&pool), Arc::clone(&self.throttle)).with_captcha(Arc::clone(&self.captcha)),
            ),
        };
        let page_renderer: Arc<dyn PageRenderer> = Arc::new(self.renderer(&pool));
        let fetcher = ContentAcquirer::new(Arc::clone(&self.downloader)).with_browser(page_renderer);
        Ok(WorkerStack {
            backend,
            fetcher: Arc::new(fetcher),
            pool: Some(pool),
        })
    }
}

#[async_trait]
impl WorkerProvider for SweepContext {
    async fn provide(&self, backend: BackendKind, headless: bool) -> Result<WorkerStack> {
        if !backend.requires_browser() {
            return Ok(WorkerStack::new(Arc::new(self.cordis_api()), self.http_fetcher()));
        }
        #[cfg(feature = "headless")]
        {
            self.browser_stack(backend, headless).await
        }
        #[cfg(not(feature = "headless"))]
        {
            let _ = headless;
            Err(crate::SweepError::FatalInit(format!(
                "{} needs a browser; rebuild with the `headless` feature",
                backend.display_name()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SweepError;

    fn config(dir: &std::path::Path) -> SweepConfig {
        let mut config = SweepConfig::default();
        config.cache.dir = dir.join("cache");
        config.output.dir = dir.join("out");
        config
    }

    #[tokio::test]
    async fn test_context_opens_cache_and_picks_manual_path() {
        let dir = tempfile::tempdir().unwrap();
        let context = SweepContext::new(config(dir.path())).await.unwrap();
        assert!(context.cache().is_some());
        assert_eq!(context.captcha().path(), "manual");
        assert!(context.captcha_channel().pending().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.extraction.fan_out = 0;
        assert!(matches!(SweepContext::new(config).await, Err(SweepError::Config(_))));
    }

    #[tokio::test]
    async fn test_api_backend_needs_no_browser() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.cache.enabled = false;
        let context = SweepContext::new(config).await.unwrap();
        let stack = context.provide(BackendKind::CordisApi, true).await.unwrap();
        assert_eq!(stack.backend.kind(), BackendKind::CordisApi);
        assert!(!stack.backend.requires_browser());
        stack.shutdown().await;
    }
}
