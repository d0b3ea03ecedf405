//! Browser session pool and the browser-backed page renderer.
//!
//! This module is only available when the `headless` Cargo feature is enabled.
//! One Chrome process serves a bounded set of pages. Warm pages are kept
//! between checkouts, every checkout gets a fresh fingerprint, and a page that
//! misbehaves is closed instead of being returned to the pool.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::emulation::{
    SetDeviceMetricsOverrideParams, SetTimezoneOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::network::{
    ClearBrowserCookiesParams, SetUserAgentOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::page::{
    AddScriptToEvaluateOnNewDocumentParams, RemoveScriptToEvaluateOnNewDocumentParams,
    ScriptIdentifier,
};
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::Page;
use futures::StreamExt;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::browser_setup::{full_launch_args, locate_chrome, reduced_launch_args};
use crate::captcha::{
    detect_challenge, token_injection_script, CaptchaChallenge, CaptchaHandler, ChallengeKind,
};
use crate::config::BrowserSettings;
use crate::fetcher::{PageRenderer, RenderedPage, WaitStrategy};
use crate::fingerprint::{Fingerprint, FingerprintGenerator};
use crate::human::accept_consent;
use crate::{Result, SweepError};

/// Configuration for the session pool.
#[derive(Debug, Clone)]
pub struct SessionPoolConfig {
    /// Pages kept open between checkouts.
    pub warm_pages: usize,
    /// Hard cap on simultaneously open pages.
    pub max_pages: usize,
    pub headless: bool,
    /// Path to the Chrome/Chromium executable. If `None`, auto-detected.
    pub chrome_path: Option<String>,
    /// Proxy URL for the browser to use.
    pub proxy_url: Option<String>,
    /// Additional launch arguments, dropped on the reduced retry.
    pub launch_args: Vec<String>,
    /// Bound on one wait for a free page slot.
    pub checkout_wait: Duration,
    pub checkout_attempts: u32,
    pub navigation_timeout: Duration,
}

impl Default for SessionPoolConfig {
    fn default() -> Self {
        Self {
            warm_pages: 3,
            max_pages: 5,
            headless: true,
            chrome_path: None,
            proxy_url: None,
            launch_args: Vec::new(),
            checkout_wait: Duration::from_secs(10),
            checkout_attempts: 3,
            navigation_timeout: Duration::from_secs(30),
        }
    }
}

impl SessionPoolConfig {
    pub fn from_settings(settings: &BrowserSettings, proxy_url: Option<String>) -> Self {
        Self {
            warm_pages: settings.warm_pages,
            max_pages: settings.max_pages.max(1),
            headless: settings.headless,
            chrome_path: settings.chrome_path.clone(),
            proxy_url,
            launch_args: settings.launch_args.clone(),
            checkout_wait: Duration::from_secs(settings.checkout_wait_secs),
            checkout_attempts: settings.checkout_attempts.max(1),
            navigation_timeout: Duration::from_secs(settings.navigation_timeout_secs),
        }
    }
}

/// Bounded page slots with a retried, bounded wait.
pub struct PageSlots {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    wait: Duration,
    attempts: u32,
}

impl PageSlots {
    pub fn new(capacity: usize, wait: Duration, attempts: u32) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            wait,
            attempts: attempts.max(1),
        }
    }

    /// Waits up to `wait` per attempt; `PoolExhausted` after the last one.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        for attempt in 1..=self.attempts {
            match tokio::time::timeout(self.wait, Arc::clone(&self.semaphore).acquire_owned()).await {
                Ok(Ok(permit)) => return Ok(permit),
                Ok(Err(_)) => return Err(SweepError::PoolUninitialized),
                Err(_) => {
                    debug!(attempt, capacity = self.capacity, "All browser pages busy, waiting");
                }
            }
        }
        Err(SweepError::PoolExhausted(format!(
            "no free page among {} after {} attempts",
            self.capacity, self.attempts
        )))
    }

    pub fn in_use(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }

    pub fn close(&self) {
        self.semaphore.close();
    }
}

/// Counters reported by [`SessionPool::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub initialized: bool,
    pub warm: usize,
    pub in_use: usize,
    pub created: u64,
    pub destroyed: u64,
    pub checkouts: u64,
}

/// A page checked out of the pool with the fingerprint applied to it.
///
/// Hand it back with [`SessionPool::checkin`] or [`SessionPool::discard`].
/// A page dropped without either, e.g. when the future holding it is
/// cancelled by a timeout, is closed in the background before its slot is
/// released.
pub struct PooledPage {
    page: Page,
    fingerprint: Fingerprint,
    script: Option<ScriptIdentifier>,
    permit: Option<OwnedSemaphorePermit>,
    destroyed: Arc<AtomicU64>,
    returned: bool,
}

impl PooledPage {
    pub fn page(&self) -> &Page {
        &self.page
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    fn release(mut self) -> (Page, Option<ScriptIdentifier>, Option<OwnedSemaphorePermit>) {
        self.returned = true;
        (self.page.clone(), self.script.take(), self.permit.take())
    }
}

impl Drop for PooledPage {
    fn drop(&mut self) {
        if self.returned {
            return;
        }
        let page = self.page.clone();
        let permit = self.permit.take();
        let destroyed = Arc::clone(&self.destroyed);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = page.close().await {
                        debug!("Failed to close abandoned page: {}", e);
                    }
                    destroyed.fetch_add(1, Ordering::Relaxed);
                    drop(permit);
                });
            }
            Err(_) => warn!("Abandoned browser page dropped outside a runtime"),
        }
    }
}

/// Pool of browser pages over one lazily launched Chrome process.
pub struct SessionPool {
    config: SessionPoolConfig,
    browser: Mutex<Option<Arc<Browser>>>,
    warm: Mutex<Vec<Page>>,
    slots: PageSlots,
    fingerprints: std::sync::Mutex<FingerprintGenerator>,
    created: AtomicU64,
    destroyed: Arc<AtomicU64>,
    checkouts: AtomicU64,
}

impl SessionPool {
    pub fn new(config: SessionPoolConfig) -> Self {
        let slots = PageSlots::new(config.max_pages, config.checkout_wait, config.checkout_attempts);
        Self {
            config,
            browser: Mutex::new(None),
            warm: Mutex::new(Vec::new()),
            slots,
            fingerprints: std::sync::Mutex::new(FingerprintGenerator::default()),
            created: AtomicU64::new(0),
            destroyed: Arc::new(AtomicU64::new(0)),
            checkouts: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &SessionPoolConfig {
        &self.config
    }

    /// Launches the browser. A failed launch is retried once with the
    /// reduced argument set; a second failure is `FatalInit`.
    pub async fn initialize(&self, headless: bool) -> Result<()> {
        let mut guard = self.browser.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        let chrome = locate_chrome(self.config.chrome_path.as_deref())?;
        debug!("Using Chrome at: {}", chrome.display());

        let mut full = full_launch_args(headless, self.config.proxy_url.as_deref());
        full.extend(self.config.launch_args.iter().cloned());

        let browser = match launch(&chrome, headless, &full).await {
            Ok(browser) => browser,
            Err(first) => {
                warn!("Browser launch failed, retrying with reduced arguments: {}", first);
                launch(&chrome, headless, &reduced_launch_args(headless))
                    .await
                    .map_err(|second| {
                        SweepError::FatalInit(format!(
                            "browser failed to launch twice ({}; {})",
                            first, second
                        ))
                    })?
            }
        };

        info!(headless, max_pages = self.config.max_pages, "Browser session pool ready");
        *guard = Some(Arc::new(browser));
        Ok(())
    }

    pub async fn is_initialized(&self) -> bool {
        self.browser.lock().await.is_some()
    }

    /// Checks out a page, preferring a warm one.
    pub async fn checkout(&self) -> Result<PooledPage> {
        let browser = self
            .browser
            .lock()
            .await
            .clone()
            .ok_or(SweepError::PoolUninitialized)?;
        let permit = self.slots.acquire().await?;
        let fingerprint = self
            .fingerprints
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .generate();

        let reused = self.warm.lock().await.pop();
        let page = match reused {
            Some(page) => page,
            None => {
                let page = browser
                    .new_page("about:blank")
                    .await
                    .map_err(|e| SweepError::Browser(format!("Failed to open page: {}", e)))?;
                self.created.fetch_add(1, Ordering::Relaxed);
                page
            }
        };

        let script = match apply_fingerprint(&page, &fingerprint).await {
            Ok(script) => script,
            Err(e) => {
                warn!("Discarding page that rejected its fingerprint: {}", e);
                self.destroy(page).await;
                return Err(e);
            }
        };

        self.checkouts.fetch_add(1, Ordering::Relaxed);
        Ok(PooledPage {
            page,
            fingerprint,
            script: Some(script),
            permit: Some(permit),
            destroyed: Arc::clone(&self.destroyed),
            returned: false,
        })
    }

    /// Resets the page and returns it to the warm set, or closes it when the
    /// warm set is full or the reset fails.
    pub async fn checkin(&self, pooled: PooledPage) {
        let (page, script, _permit) = pooled.release();
        match reset_page(&page, script).await {
            Ok(()) => {
                let mut warm = self.warm.lock().await;
                if warm.len() < self.config.warm_pages {
                    warm.push(page);
                    return;
                }
            }
            Err(e) => warn!("Page failed to reset, closing it: {}", e),
        }
        self.destroy(page).await;
    }

    /// Closes a page that must not be reused.
    pub async fn discard(&self, pooled: PooledPage) {
        let (page, _, _permit) = pooled.release();
        self.destroy(page).await;
    }

    async fn destroy(&self, page: Page) {
        if let Err(e) = page.close().await {
            debug!("Failed to close browser page: {}", e);
        }
        self.destroyed.fetch_add(1, Ordering::Relaxed);
    }

    /// Closes every warm page and the browser process.
    pub async fn shutdown(&self) {
        let pages: Vec<Page> = self.warm.lock().await.drain(..).collect();
        for page in pages {
            self.destroy(page).await;
        }
        let mut guard = self.browser.lock().await;
        if let Some(browser) = guard.take() {
            if let Ok(mut browser) = Arc::try_unwrap(browser) {
                if let Err(e) = browser.close().await {
                    debug!("Browser close failed: {}", e);
                }
            }
            debug!("Browser session pool shut down");
        }
    }

    pub async fn stats(&self) -> PoolStats {
        PoolStats {
            initialized: self.browser.lock().await.is_some(),
            warm: self.warm.lock().await.len(),
            in_use: self.slots.in_use(),
            created: self.created.load(Ordering::Relaxed),
            destroyed: self.destroyed.load(Ordering::Relaxed),
            checkouts: self.checkouts.load(Ordering::Relaxed),
        }
    }
}

async fn launch(chrome: &std::path::Path, headless: bool, args: &[String]) -> Result<Browser> {
    let mut builder = BrowserConfig::builder().chrome_executable(chrome);
    if !headless {
        builder = builder.with_head();
    }
    for arg in args {
        builder = builder.arg(arg);
    }
    let config = builder
        .build()
        .map_err(|e| SweepError::Browser(format!("Failed to build browser config: {}", e)))?;

    let (browser, mut handler) = Browser::launch(config)
        .await
        .map_err(|e| SweepError::Browser(format!("Failed to launch browser: {}", e)))?;

    tokio::spawn(async move {
        while let Some(event) = handler.next().await {
            if let Err(e) = event {
                warn!("Browser CDP handler error: {}", e);
            }
        }
        debug!("Browser CDP handler exited");
    });

    Ok(browser)
}

/// Applies `fingerprint` and returns the id of its init script, which the
/// page keeps until [`reset_page`] removes it.
async fn apply_fingerprint(page: &Page, fingerprint: &Fingerprint) -> Result<ScriptIdentifier> {
    let cdp = |e: chromiumoxide::error::CdpError| SweepError::Browser(format!("Fingerprint rejected: {}", e));

    let agent = SetUserAgentOverrideParams::builder()
        .user_agent(fingerprint.user_agent.clone())
        .accept_language(fingerprint.accept_language())
        .build()
        .map_err(SweepError::Browser)?;
    page.set_user_agent(agent).await.map_err(cdp)?;

    let (width, height) = fingerprint.viewport;
    page.execute(SetDeviceMetricsOverrideParams::new(
        width as i64,
        height as i64,
        fingerprint.device_pixel_ratio,
        false,
    ))
    .await
    .map_err(cdp)?;

    page.execute(SetTimezoneOverrideParams::new(fingerprint.timezone.clone()))
        .await
        .map_err(cdp)?;

    page.evaluate_on_new_document(AddScriptToEvaluateOnNewDocumentParams::new(
        fingerprint.init_script(),
    ))
    .await
    .map_err(cdp)
}

async fn reset_page(page: &Page, script: Option<ScriptIdentifier>) -> Result<()> {
    let cdp = |e: chromiumoxide::error::CdpError| SweepError::Browser(format!("Reset failed: {}", e));
    if let Some(script) = script {
        page.execute(RemoveScriptToEvaluateOnNewDocumentParams::new(script))
            .await
            .map_err(cdp)?;
    }
    page.evaluate("try { localStorage.clear(); sessionStorage.clear(); } catch (e) {}")
        .await
        .map_err(cdp)?;
    page.execute(ClearBrowserCookiesParams::default())
        .await
        .map_err(cdp)?;
    page.goto("about:blank").await.map_err(cdp)?;
    Ok(())
}

/// Waits for the page to settle according to `wait`.
pub async fn settle(page: &Page, wait: &WaitStrategy) {
    let WaitStrategy::Selector { css, timeout_ms } = wait;
    // A missing selector usually means a challenge or error page;
    // the caller inspects whatever content is there.
    let found = tokio::time::timeout(wait.timeout(), async {
        page.find_element(css.as_str()).await
    })
    .await;
    if let Err(_) | Ok(Err(_)) = found {
        debug!(
            "Selector '{}' not found within {}ms, proceeding with current page content",
            css, timeout_ms
        );
    }
}

pub async fn current_url(page: &Page, fallback: &str) -> String {
    match page.url().await {
        Ok(Some(url)) => url,
        _ => fallback.to_string(),
    }
}

pub async fn page_html(page: &Page) -> Result<String> {
    page.content()
        .await
        .map_err(|e| SweepError::Browser(format!("Failed to get page content: {}", e)))
}

/// Detects a challenge in `html` and makes one resolution attempt.
///
/// Returns the page content after the challenge is gone. A challenge that
/// survives the attempt, or that appears with no handler, is a `Challenge`
/// error for this navigation only.
pub async fn clear_challenge(
    page: &Page,
    handler: Option<&CaptchaHandler>,
    url: &str,
    html: String,
    wait: &WaitStrategy,
) -> Result<String> {
    let Some(detected) = detect_challenge(&html, url) else {
        return Ok(html);
    };
    info!(url = %url, reason = detected.reason, "CAPTCHA detected");
    let handler = handler.ok_or_else(|| {
        SweepError::Challenge(format!("{} at {} and no resolver configured", detected.reason, url))
    })?;

    let challenge = match (detected.kind, &detected.site_key) {
        (ChallengeKind::Interactive, Some(key)) => {
            CaptchaChallenge::interactive(detected.provider, key.clone(), url)
        }
        _ => {
            let png = page
                .screenshot(ScreenshotParams::builder().build())
                .await
                .map_err(|e| SweepError::Browser(format!("Challenge screenshot failed: {}", e)))?;
            CaptchaChallenge::image(base64::engine::general_purpose::STANDARD.encode(png))
        }
    };

    let solution = handler.resolve(&challenge).await?;
    page.evaluate(token_injection_script(detected.provider, &solution.value))
        .await
        .map_err(|e| SweepError::Browser(format!("Token injection failed: {}", e)))?;
    settle(page, wait).await;

    let html = page_html(page).await?;
    let after = current_url(page, url).await;
    if detect_challenge(&html, &after).is_some() {
        return Err(SweepError::Challenge(format!(
            "challenge still present at {} after resolution",
            after
        )));
    }
    Ok(html)
}

/// A `PageRenderer` over pooled browser pages.
///
/// Each `render()` checks out a page, navigates under the navigation timeout,
/// waits for content to settle, clears a CAPTCHA if one shows up and returns
/// the rendered HTML. A page whose navigation failed is closed.
pub struct BrowserRenderer {
    pool: Arc<SessionPool>,
    captcha: Option<Arc<CaptchaHandler>>,
    wait: WaitStrategy,
    accept_consent: bool,
}

impl BrowserRenderer {
    pub fn new(pool: Arc<SessionPool>) -> Self {
        Self {
            pool,
            captcha: None,
            wait: WaitStrategy::default(),
            accept_consent: false,
        }
    }

    /// Clicks a cookie/consent banner after each navigation.
    pub fn with_consent(mut self) -> Self {
        self.accept_consent = true;
        self
    }

    pub fn with_captcha(mut self, handler: Arc<CaptchaHandler>) -> Self {
        self.captcha = Some(handler);
        self
    }

    /// Sets the wait strategy for page rendering.
    pub fn with_wait(mut self, wait: WaitStrategy) -> Self {
        self.wait = wait;
        self
    }

    async fn navigate(&self, page: &Page, url: &str) -> Result<RenderedPage> {
        let timeout = self.pool.config().navigation_timeout;
        match tokio::time::timeout(timeout, page.goto(url)).await {
            Err(_) => return Err(SweepError::Timeout(format!("navigation to {}", url))),
            Ok(Err(e)) => {
                return Err(SweepError::Browser(format!("Navigation to {} failed: {}", url, e)))
            }
            Ok(Ok(_)) => {}
        }
        settle(page, &self.wait).await;
        if self.accept_consent && accept_consent(page).await {
            settle(page, &self.wait).await;
        }

        let html = page_html(page).await?;
        let landed = current_url(page, url).await;
        let html = clear_challenge(page, self.captcha.as_deref(), &landed, html, &self.wait).await?;
        let final_url = current_url(page, &landed).await;
        Ok(RenderedPage::new(final_url, html))
    }
}

#[async_trait]
impl PageRenderer for BrowserRenderer {
    async fn render(&self, url: &str) -> Result<RenderedPage> {
        let pooled = self.pool.checkout().await?;
        match self.navigate(pooled.page(), url).await {
            Ok(rendered) => {
                self.pool.checkin(pooled).await;
                Ok(rendered)
            }
            Err(e) => {
                debug!(url = %url, "Navigation failed, closing page: {}", e);
                self.pool.discard(pooled).await;
                Err(e)
            }
        }
    }
}
