//! CAPTCHA detection and resolution.
//!
//! A challenge moves through `Detected -> Dispatched -> Solving` and ends as
//! `Solved`, `TimedOut` or `Rejected`. Each call to
//! [`CaptchaHandler::resolve`] takes exactly one path: the automatic solver
//! service when one is configured, otherwise the manual channel, where an
//! operator answers by challenge id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::CaptchaSettings;
use crate::{Result, SweepError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeKind {
    /// A picture with distorted text typed into an input.
    Image,
    /// A widget solved with a token (reCAPTCHA, hCaptcha, Turnstile).
    Interactive,
}

/// Who serves the challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeProvider {
    ReCaptcha,
    HCaptcha,
    Turnstile,
    ImageInput,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChallengePayload {
    Image { png_base64: String },
    Interactive { site_key: String, page_url: String },
}

/// A challenge awaiting resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptchaChallenge {
    pub id: Uuid,
    pub kind: ChallengeKind,
    pub provider: ChallengeProvider,
    pub payload: ChallengePayload,
    pub detected_at: DateTime<Utc>,
}

impl CaptchaChallenge {
    pub fn image(png_base64: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: ChallengeKind::Image,
            provider: ChallengeProvider::ImageInput,
            payload: ChallengePayload::Image {
                png_base64: png_base64.into(),
            },
            detected_at: Utc::now(),
        }
    }

    pub fn interactive(
        provider: ChallengeProvider,
        site_key: impl Into<String>,
        page_url: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: ChallengeKind::Interactive,
            provider,
            payload: ChallengePayload::Interactive {
                site_key: site_key.into(),
                page_url: page_url.into(),
            },
            detected_at: Utc::now(),
        }
    }
}

/// An answer to a challenge, matched by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptchaSolution {
    pub id: Uuid,
    pub value: String,
}

impl CaptchaSolution {
    pub fn new(id: Uuid, value: impl Into<String>) -> Self {
        Self {
            id,
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChallengeState {
    Detected,
    Dispatched,
    Solving,
    Solved,
    TimedOut,
    Rejected,
}

impl ChallengeState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ChallengeState::Solved | ChallengeState::TimedOut | ChallengeState::Rejected
        )
    }

    fn from_error(error: &SweepError) -> Self {
        match error {
            SweepError::Timeout(_) => ChallengeState::TimedOut,
            _ => ChallengeState::Rejected,
        }
    }
}

/// What the page detector found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedChallenge {
    pub kind: ChallengeKind,
    pub provider: ChallengeProvider,
    pub site_key: Option<String>,
    pub reason: &'static str,
}

fn site_key_patterns() -> &'static [Regex; 2] {
    static RES: OnceLock<[Regex; 2]> = OnceLock::new();
    RES.get_or_init(|| {
        [
            Regex::new(r#"data-sitekey=["']([^"']+)["']"#).expect("valid sitekey regex"),
            Regex::new(r#"(?:recaptcha|hcaptcha)[^"']*[?&](?:k|sitekey)=([A-Za-z0-9_\-]+)"#)
                .expect("valid sitekey regex"),
        ]
    })
}

fn extract_site_key(html: &str) -> Option<String> {
    site_key_patterns()
        .iter()
        .find_map(|re| re.captures(html))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Looks for challenge widgets, image-captcha inputs and bot-check redirects.
pub fn detect_challenge(html: &str, url: &str) -> Option<DetectedChallenge> {
    let url_lc = url.to_ascii_lowercase();
    let html_lc = html.to_ascii_lowercase();
    let interactive = |provider, reason| {
        Some(DetectedChallenge {
            kind: ChallengeKind::Interactive,
            provider,
            site_key: extract_site_key(html),
            reason,
        })
    };

    if html_lc.contains("cf-turnstile") || html_lc.contains("challenges.cloudflare.com/turnstile") {
        return interactive(ChallengeProvider::Turnstile, "Turnstile widget");
    }
    if html_lc.contains("h-captcha") || html_lc.contains("hcaptcha.com/captcha") {
        return interactive(ChallengeProvider::HCaptcha, "hCaptcha widget");
    }
    if html_lc.contains("g-recaptcha")
        || html_lc.contains("www.google.com/recaptcha/api2/anchor")
        || html_lc.contains("recaptcha/api.js")
    {
        return interactive(ChallengeProvider::ReCaptcha, "reCAPTCHA widget");
    }
    if url_lc.contains("/sorry/") {
        return interactive(ChallengeProvider::ReCaptcha, "bot-check redirect (/sorry/)");
    }
    if html_lc.contains("name=\"captcha\"")
        || html_lc.contains("name='captcha'")
        || html_lc.contains("id=\"captcha\"")
        || html_lc.contains("id=\"captcha_input\"")
    {
        return Some(DetectedChallenge {
            kind: ChallengeKind::Image,
            provider: ChallengeProvider::ImageInput,
            site_key: None,
            reason: "image captcha input",
        });
    }
    None
}

/// Script that hands a solved token to the widget on the page.
pub fn token_injection_script(provider: ChallengeProvider, token: &str) -> String {
    let token = serde_json::to_string(token).unwrap_or_else(|_| "\"\"".to_string());
    match provider {
        ChallengeProvider::ReCaptcha => format!(
            r#"(() => {{
    const token = {token};
    document.querySelectorAll('textarea[name="g-recaptcha-response"], #g-recaptcha-response')
        .forEach(el => {{ el.style.display = 'block'; el.value = token; }});
    const widget = document.querySelector('.g-recaptcha[data-callback]');
    if (widget && typeof window[widget.dataset.callback] === 'function') {{
        window[widget.dataset.callback](token);
    }} else {{
        const form = document.querySelector('#captcha-form, form');
        if (form) form.submit();
    }}
}})();"#
        ),
        ChallengeProvider::HCaptcha => format!(
            r#"(() => {{
    const token = {token};
    document.querySelectorAll('textarea[name="h-captcha-response"], textarea[name="g-recaptcha-response"]')
        .forEach(el => {{ el.value = token; }});
    const form = document.querySelector('form');
    if (form) form.submit();
}})();"#
        ),
        ChallengeProvider::Turnstile => format!(
            r#"(() => {{
    const token = {token};
    document.querySelectorAll('input[name="cf-turnstile-response"]').forEach(el => {{ el.value = token; }});
    const form = document.querySelector('form');
    if (form) form.submit();
}})();"#
        ),
        ChallengeProvider::ImageInput => format!(
            r#"(() => {{
    const input = document.querySelector('input[name="captcha"], #captcha, #captcha_input');
    if (!input) return;
    input.value = {token};
    if (input.form) input.form.submit();
}})();"#
        ),
    }
}

/// Turns a challenge into a solution.
#[async_trait]
pub trait CaptchaResolver: Send + Sync {
    fn name(&self) -> &str;

    async fn resolve(&self, challenge: &CaptchaChallenge) -> Result<CaptchaSolution>;
}

/// Client for the 2Captcha-compatible solving service.
pub struct TwoCaptchaSolver {
    client: Client,
    api_key: String,
    base_url: String,
    initial_wait: Duration,
    poll_interval: Duration,
    max_attempts: u32,
}

impl TwoCaptchaSolver {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: "http://2captcha.com".to_string(),
            initial_wait: Duration::from_secs(10),
            poll_interval: Duration::from_secs(5),
            max_attempts: 30,
        }
    }

    pub fn from_settings(settings: &CaptchaSettings, client: Client) -> Self {
        Self {
            client,
            api_key: settings.api_key.clone().unwrap_or_default(),
            base_url: settings.solver_base_url.trim_end_matches('/').to_string(),
            initial_wait: Duration::from_millis(settings.solver_initial_wait_ms),
            poll_interval: Duration::from_millis(settings.solver_poll_interval_ms),
            max_attempts: settings.solver_max_attempts.max(1),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_schedule(mut self, initial_wait: Duration, poll_interval: Duration, max_attempts: u32) -> Self {
        self.initial_wait = initial_wait;
        self.poll_interval = poll_interval;
        self.max_attempts = max_attempts.max(1);
        self
    }

    async fn submit(&self, challenge: &CaptchaChallenge) -> Result<String> {
        let mut form: Vec<(&str, String)> = vec![("key", self.api_key.clone())];
        match &challenge.payload {
            ChallengePayload::Image { png_base64 } => {
                form.push(("method", "base64".to_string()));
                form.push(("body", png_base64.clone()));
            }
            ChallengePayload::Interactive { site_key, page_url } => {
                let (method, key_field) = match challenge.provider {
                    ChallengeProvider::HCaptcha => ("hcaptcha", "sitekey"),
                    ChallengeProvider::Turnstile => ("turnstile", "sitekey"),
                    _ => ("userrecaptcha", "googlekey"),
                };
                form.push(("method", method.to_string()));
                form.push((key_field, site_key.clone()));
                form.push(("pageurl", page_url.clone()));
            }
        }

        let body = self
            .client
            .post(format!("{}/in.php", self.base_url))
            .form(&form)
            .send()
            .await?
            .text()
            .await?;
        let body = body.trim();
        match body.strip_prefix("OK|") {
            Some(ticket) => Ok(ticket.to_string()),
            None => Err(SweepError::Challenge(format!("solver refused challenge: {}", body))),
        }
    }

    async fn poll(&self, ticket: &str) -> Result<String> {
        tokio::time::sleep(self.initial_wait).await;
        for attempt in 1..=self.max_attempts {
            let body = self
                .client
                .get(format!("{}/res.php", self.base_url))
                .query(&[("key", self.api_key.as_str()), ("action", "get"), ("id", ticket)])
                .send()
                .await?
                .text()
                .await?;
            let body = body.trim();

            if let Some(answer) = body.strip_prefix("OK|") {
                return Ok(answer.to_string());
            }
            if body != "CAPCHA_NOT_READY" {
                return Err(SweepError::Challenge(format!("solver rejected ticket: {}", body)));
            }
            debug!(ticket = %ticket, attempt, "Solver not ready");
            tokio::time::sleep(self.poll_interval).await;
        }
        Err(SweepError::Timeout(format!(
            "solver ticket {} not ready after {} polls",
            ticket, self.max_attempts
        )))
    }
}

#[async_trait]
impl CaptchaResolver for TwoCaptchaSolver {
    fn name(&self) -> &str {
        "2captcha"
    }

    async fn resolve(&self, challenge: &CaptchaChallenge) -> Result<CaptchaSolution> {
        let ticket = self.submit(challenge).await?;
        debug!(challenge = %challenge.id, ticket = %ticket, "Challenge submitted to solver");
        let answer = self.poll(&ticket).await?;
        Ok(CaptchaSolution::new(challenge.id, answer))
    }
}

struct PendingChallenge {
    challenge: CaptchaChallenge,
    reply: oneshot::Sender<String>,
}

/// Rendezvous between a waiting resolver and an operator.
///
/// Challenges are published to subscribers and listed by [`pending`]; an
/// operator answers with [`submit`]. Only a solution carrying the id of a
/// pending challenge is accepted, and only once.
///
/// [`pending`]: ManualCaptchaChannel::pending
/// [`submit`]: ManualCaptchaChannel::submit
pub struct ManualCaptchaChannel {
    pending: Mutex<HashMap<Uuid, PendingChallenge>>,
    announcements: broadcast::Sender<CaptchaChallenge>,
}

impl ManualCaptchaChannel {
    pub fn new() -> Self {
        let (announcements, _) = broadcast::channel(32);
        Self {
            pending: Mutex::new(HashMap::new()),
            announcements,
        }
    }

    /// Registers a challenge and returns the receiver its answer arrives on.
    pub fn dispatch(&self, challenge: CaptchaChallenge) -> oneshot::Receiver<String> {
        let (reply, answer) = oneshot::channel();
        let id = challenge.id;
        // No subscribers is fine; `pending()` still lists it.
        let _ = self.announcements.send(challenge.clone());
        self.lock().insert(id, PendingChallenge { challenge, reply });
        info!(challenge = %id, "CAPTCHA waiting for manual solution");
        answer
    }

    /// Delivers a solution. Returns `false` if no pending challenge has its id.
    pub fn submit(&self, solution: CaptchaSolution) -> bool {
        let entry = self.lock().remove(&solution.id);
        match entry {
            Some(pending) => pending.reply.send(solution.value).is_ok(),
            None => {
                warn!(challenge = %solution.id, "Solution for unknown challenge ignored");
                false
            }
        }
    }

    /// Drops a pending challenge without answering it.
    pub fn cancel(&self, id: Uuid) {
        self.lock().remove(&id);
    }

    /// Challenges awaiting an answer, oldest first.
    pub fn pending(&self) -> Vec<CaptchaChallenge> {
        let mut list: Vec<CaptchaChallenge> = self
            .lock()
            .values()
            .map(|p| p.challenge.clone())
            .collect();
        list.sort_by_key(|c| c.detected_at);
        list
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CaptchaChallenge> {
        self.announcements.subscribe()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, PendingChallenge>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for ManualCaptchaChannel {
    fn default() -> Self {
        Self::new()
    }
}

/// Waits on the manual channel for a bounded time.
pub struct ManualResolver {
    channel: Arc<ManualCaptchaChannel>,
    timeout: Duration,
}

impl ManualResolver {
    pub fn new(channel: Arc<ManualCaptchaChannel>, timeout: Duration) -> Self {
        Self { channel, timeout }
    }
}

#[async_trait]
impl CaptchaResolver for ManualResolver {
    fn name(&self) -> &str {
        "manual"
    }

    async fn resolve(&self, challenge: &CaptchaChallenge) -> Result<CaptchaSolution> {
        let answer = self.channel.dispatch(challenge.clone());
        let _pending = PendingGuard {
            channel: &self.channel,
            id: challenge.id,
        };
        match tokio::time::timeout(self.timeout, answer).await {
            Ok(Ok(value)) => Ok(CaptchaSolution::new(challenge.id, value)),
            Ok(Err(_)) => Err(SweepError::Challenge(format!(
                "challenge {} was dropped",
                challenge.id
            ))),
            Err(_) => Err(SweepError::Timeout(format!(
                "no manual solution for {} within {}s",
                challenge.id,
                self.timeout.as_secs()
            ))),
        }
    }
}

/// Withdraws a dispatched challenge when its waiter goes away, whether it
/// timed out, was answered or was cancelled from outside.
struct PendingGuard<'a> {
    channel: &'a ManualCaptchaChannel,
    id: Uuid,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.channel.cancel(self.id);
    }
}

/// Fixed-answer resolver for tests.
pub struct StaticResolver {
    answer: Option<String>,
    calls: AtomicUsize,
}

impl StaticResolver {
    pub fn solving(answer: impl Into<String>) -> Self {
        Self {
            answer: Some(answer.into()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn rejecting() -> Self {
        Self {
            answer: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CaptchaResolver for StaticResolver {
    fn name(&self) -> &str {
        "static"
    }

    async fn resolve(&self, challenge: &CaptchaChallenge) -> Result<CaptchaSolution> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.answer {
            Some(answer) => Ok(CaptchaSolution::new(challenge.id, answer.clone())),
            None => Err(SweepError::Challenge("rejected".to_string())),
        }
    }
}

/// Picks the resolution path and keeps the counters.
pub struct CaptchaHandler {
    automatic: Option<Arc<dyn CaptchaResolver>>,
    manual: Arc<dyn CaptchaResolver>,
    detected: AtomicU64,
    solved: AtomicU64,
}

impl CaptchaHandler {
    pub fn new(automatic: Option<Arc<dyn CaptchaResolver>>, manual: Arc<dyn CaptchaResolver>) -> Self {
        Self {
            automatic,
            manual,
            detected: AtomicU64::new(0),
            solved: AtomicU64::new(0),
        }
    }

    /// Automatic solver when enabled and keyed, manual channel otherwise.
    pub fn from_settings(
        settings: &CaptchaSettings,
        channel: Arc<ManualCaptchaChannel>,
        client: Client,
    ) -> Self {
        let automatic = match &settings.api_key {
            Some(key) if settings.solver_enabled && !key.trim().is_empty() => {
                Some(Arc::new(TwoCaptchaSolver::from_settings(settings, client)) as Arc<dyn CaptchaResolver>)
            }
            _ => None,
        };
        let manual = Arc::new(ManualResolver::new(
            channel,
            Duration::from_secs(settings.manual_timeout_secs),
        ));
        Self::new(automatic, manual)
    }

    /// Name of the path `resolve` will take.
    pub fn path(&self) -> &str {
        match &self.automatic {
            Some(resolver) => resolver.name(),
            None => self.manual.name(),
        }
    }

    /// Resolves one challenge through exactly one path.
    pub async fn resolve(&self, challenge: &CaptchaChallenge) -> Result<CaptchaSolution> {
        self.detected.fetch_add(1, Ordering::SeqCst);
        let resolver = self.automatic.as_ref().unwrap_or(&self.manual);
        debug!(challenge = %challenge.id, state = ?ChallengeState::Detected, "CAPTCHA detected");
        debug!(challenge = %challenge.id, state = ?ChallengeState::Dispatched, path = resolver.name(), "CAPTCHA dispatched");
        debug!(challenge = %challenge.id, state = ?ChallengeState::Solving, "CAPTCHA solving");

        match resolver.resolve(challenge).await {
            Ok(solution) => {
                self.solved.fetch_add(1, Ordering::SeqCst);
                info!(challenge = %challenge.id, state = ?ChallengeState::Solved, "CAPTCHA solved");
                Ok(solution)
            }
            Err(e) => {
                warn!(
                    challenge = %challenge.id,
                    state = ?ChallengeState::from_error(&e),
                    "CAPTCHA unresolved: {}", e
                );
                Err(match e {
                    SweepError::Challenge(_) => e,
                    other => SweepError::Challenge(other.to_string()),
                })
            }
        }
    }

    pub fn detected(&self) -> u64 {
        self.detected.load(Ordering::SeqCst)
    }

    pub fn solved(&self) -> u64 {
        self.solved.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_solver(server: &MockServer) -> TwoCaptchaSolver {
        TwoCaptchaSolver::new("test-key")
            .with_base_url(server.uri())
            .with_schedule(Duration::ZERO, Duration::ZERO, 3)
    }

    #[test]
    fn test_detect_recaptcha_with_site_key() {
        let html = r#"<div class="g-recaptcha" data-sitekey="6LcKEY_abc"></div>"#;
        let found = detect_challenge(html, "https://example.com").unwrap();
        assert_eq!(found.kind, ChallengeKind::Interactive);
        assert_eq!(found.provider, ChallengeProvider::ReCaptcha);
        assert_eq!(found.site_key.as_deref(), Some("6LcKEY_abc"));
    }

    #[test]
    fn test_detect_recaptcha_iframe_key() {
        let html = r#"<iframe src="https://www.google.com/recaptcha/api2/anchor?ar=1&k=6LfIFRAME&co=x"></iframe>"#;
        let found = detect_challenge(html, "https://example.com").unwrap();
        assert_eq!(found.site_key.as_deref(), Some("6LfIFRAME"));
    }

    #[test]
    fn test_detect_other_providers() {
        let h = detect_challenge(r#"<div class="h-captcha" data-sitekey="abc"></div>"#, "x").unwrap();
        assert_eq!(h.provider, ChallengeProvider::HCaptcha);
        let t = detect_challenge(r#"<div class="cf-turnstile"></div>"#, "x").unwrap();
        assert_eq!(t.provider, ChallengeProvider::Turnstile);
        let s = detect_challenge("<html></html>", "https://www.google.com/sorry/index?q=1").unwrap();
        assert_eq!(s.provider, ChallengeProvider::ReCaptcha);
    }

    #[test]
    fn test_detect_image_captcha() {
        let html = r#"<img src="/c.png"><input type="text" name="captcha">"#;
        let found = detect_challenge(html, "https://example.com").unwrap();
        assert_eq!(found.kind, ChallengeKind::Image);
        assert!(found.site_key.is_none());
    }

    #[test]
    fn test_detect_nothing() {
        assert!(detect_challenge("<p>Cotton farming</p>", "https://example.com/a").is_none());
    }

    #[test]
    fn test_token_injection_escapes_token() {
        let script = token_injection_script(ChallengeProvider::ReCaptcha, "abc\"def");
        assert!(script.contains(r#""abc\"def""#));
        assert!(token_injection_script(ChallengeProvider::ImageInput, "x7k").contains("\"x7k\""));
    }

    #[test]
    fn test_state_terminal() {
        assert!(ChallengeState::Solved.is_terminal());
        assert!(!ChallengeState::Solving.is_terminal());
        assert_eq!(
            ChallengeState::from_error(&SweepError::Timeout("x".into())),
            ChallengeState::TimedOut
        );
    }

    #[tokio::test]
    async fn test_manual_mismatched_id_never_resolves() {
        let channel = Arc::new(ManualCaptchaChannel::new());
        let challenge = CaptchaChallenge::image("cG5n");
        let mut answer = channel.dispatch(challenge.clone());

        assert!(!channel.submit(CaptchaSolution::new(Uuid::new_v4(), "wrong")));
        assert!(answer.try_recv().is_err());
        assert_eq!(channel.pending().len(), 1);

        assert!(channel.submit(CaptchaSolution::new(challenge.id, "right")));
        assert_eq!(answer.await.unwrap(), "right");
        assert!(!channel.submit(CaptchaSolution::new(challenge.id, "again")));
        assert!(channel.pending().is_empty());
    }

    #[tokio::test]
    async fn test_manual_resolver_receives_solution() {
        let channel = Arc::new(ManualCaptchaChannel::new());
        let resolver = ManualResolver::new(channel.clone(), Duration::from_secs(5));
        let mut announcements = channel.subscribe();

        let operator = tokio::spawn({
            let channel = channel.clone();
            async move {
                let challenge = announcements.recv().await.unwrap();
                channel.submit(CaptchaSolution::new(challenge.id, "solved-text"))
            }
        });

        let challenge = CaptchaChallenge::interactive(ChallengeProvider::ReCaptcha, "key", "https://e.com");
        let solution = resolver.resolve(&challenge).await.unwrap();
        assert_eq!(solution.id, challenge.id);
        assert_eq!(solution.value, "solved-text");
        assert!(operator.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_resolver_times_out() {
        let channel = Arc::new(ManualCaptchaChannel::new());
        let resolver = ManualResolver::new(channel.clone(), Duration::from_secs(300));
        let result = resolver.resolve(&CaptchaChallenge::image("x")).await;
        assert!(matches!(result, Err(SweepError::Timeout(_))));
        assert!(channel.pending().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_manual_wait_withdraws_challenge() {
        let channel = Arc::new(ManualCaptchaChannel::new());
        let handler = CaptchaHandler::new(
            None,
            Arc::new(ManualResolver::new(channel.clone(), Duration::from_secs(300))),
        );
        let challenge = CaptchaChallenge::image("x");

        let outer = tokio::time::timeout(Duration::from_secs(60), handler.resolve(&challenge)).await;
        assert!(outer.is_err());
        assert!(channel.pending().is_empty());
        assert!(!channel.submit(CaptchaSolution::new(challenge.id, "late")));
    }

    #[tokio::test]
    async fn test_two_captcha_solves_after_not_ready() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/in.php"))
            .respond_with(ResponseTemplate::new(200).set_body_string("OK|9001"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/res.php"))
            .and(query_param("id", "9001"))
            .respond_with(ResponseTemplate::new(200).set_body_string("CAPCHA_NOT_READY"))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/res.php"))
            .respond_with(ResponseTemplate::new(200).set_body_string("OK|token-xyz"))
            .mount(&server)
            .await;

        let challenge = CaptchaChallenge::interactive(ChallengeProvider::ReCaptcha, "site", "https://e.com");
        let solution = fast_solver(&server).resolve(&challenge).await.unwrap();
        assert_eq!(solution.value, "token-xyz");
        assert_eq!(solution.id, challenge.id);
    }

    #[tokio::test]
    async fn test_two_captcha_submit_error_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/in.php"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ERROR_WRONG_USER_KEY"))
            .mount(&server)
            .await;
        let result = fast_solver(&server).resolve(&CaptchaChallenge::image("x")).await;
        assert!(matches!(result, Err(SweepError::Challenge(_))));
    }

    #[tokio::test]
    async fn test_two_captcha_gives_up_after_max_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/in.php"))
            .respond_with(ResponseTemplate::new(200).set_body_string("OK|1"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/res.php"))
            .respond_with(ResponseTemplate::new(200).set_body_string("CAPCHA_NOT_READY"))
            .expect(3)
            .mount(&server)
            .await;
        let result = fast_solver(&server).resolve(&CaptchaChallenge::image("x")).await;
        assert!(matches!(result, Err(SweepError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_handler_uses_exactly_one_path() {
        let automatic = Arc::new(StaticResolver::rejecting());
        let manual = Arc::new(StaticResolver::solving("never"));
        let handler = CaptchaHandler::new(Some(automatic.clone()), manual.clone());

        let result = handler.resolve(&CaptchaChallenge::image("x")).await;
        assert!(matches!(result, Err(SweepError::Challenge(_))));
        assert_eq!(automatic.calls(), 1);
        assert_eq!(manual.calls(), 0);
        assert_eq!(handler.detected(), 1);
        assert_eq!(handler.solved(), 0);
    }

    #[tokio::test]
    async fn test_handler_counts_solutions() {
        let manual = Arc::new(StaticResolver::solving("ok"));
        let handler = CaptchaHandler::new(None, manual);
        assert_eq!(handler.path(), "static");
        handler.resolve(&CaptchaChallenge::image("x")).await.unwrap();
        assert_eq!(handler.detected(), 1);
        assert_eq!(handler.solved(), 1);
    }

    #[test]
    fn test_handler_from_settings_without_key_is_manual() {
        let settings = CaptchaSettings::default();
        let handler = CaptchaHandler::from_settings(
            &settings,
            Arc::new(ManualCaptchaChannel::new()),
            Client::new(),
        );
        assert_eq!(handler.path(), "manual");

        let keyed = CaptchaSettings {
            api_key: Some("k".to_string()),
            solver_enabled: true,
            ..CaptchaSettings::default()
        };
        let handler = CaptchaHandler::from_settings(&keyed, Arc::new(ManualCaptchaChannel::new()), Client::new());
        assert_eq!(handler.path(), "2captcha");
    }
}
