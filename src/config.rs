//! Sweep configuration.
//!
//! Every field has a serde default so a partial (or missing) JSON file
//! yields a usable configuration. A handful of environment variables
//! override the file for values that should not live on disk.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Result, SweepError};

/// Environment variable holding the automatic CAPTCHA solver key.
pub const ENV_CAPTCHA_KEY: &str = "A3S_SWEEP_CAPTCHA_KEY";
/// Environment variable overriding the output directory.
pub const ENV_OUTPUT_DIR: &str = "A3S_SWEEP_OUTPUT_DIR";
/// Environment variable pointing at a Chrome/Chromium executable.
pub const ENV_CHROME: &str = "CHROME";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    pub delay: DelaySettings,
    pub cache: CacheSettings,
    pub browser: BrowserSettings,
    pub captcha: CaptchaSettings,
    pub search: SearchSettings,
    pub extraction: ExtractionSettings,
    pub proxies: ProxySettings,
    pub output: OutputSettings,
}

/// Per-domain adaptive delay bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelaySettings {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_ms: u64,
    #[serde(default = "default_floor_delay_ms")]
    pub floor_ms: u64,
    #[serde(default = "default_ceiling_delay_ms")]
    pub ceiling_ms: u64,
    /// Fraction of the current delay used as +/- jitter.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_floor_delay_ms() -> u64 {
    250
}

fn default_ceiling_delay_ms() -> u64 {
    30_000
}

fn default_jitter() -> f64 {
    0.25
}

impl Default for DelaySettings {
    fn default() -> Self {
        Self {
            initial_ms: default_initial_delay_ms(),
            floor_ms: default_floor_delay_ms(),
            ceiling_ms: default_ceiling_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

/// Download cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_cache_max_age_secs")]
    pub max_age_secs: u64,
    #[serde(default = "default_cache_max_bytes")]
    pub max_bytes: u64,
}

fn default_true() -> bool {
    true
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("cache")
}

fn default_cache_max_age_secs() -> u64 {
    86_400
}

fn default_cache_max_bytes() -> u64 {
    100 * 1024 * 1024
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: default_cache_dir(),
            max_age_secs: default_cache_max_age_secs(),
            max_bytes: default_cache_max_bytes(),
        }
    }
}

/// Browser session pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserSettings {
    #[serde(default = "default_warm_pages")]
    pub warm_pages: usize,
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
    #[serde(default = "default_true")]
    pub headless: bool,
    #[serde(default)]
    pub chrome_path: Option<String>,
    #[serde(default)]
    pub launch_args: Vec<String>,
    #[serde(default = "default_navigation_timeout_secs")]
    pub navigation_timeout_secs: u64,
    #[serde(default = "default_checkout_wait_secs")]
    pub checkout_wait_secs: u64,
    #[serde(default = "default_checkout_attempts")]
    pub checkout_attempts: u32,
}

fn default_warm_pages() -> usize {
    3
}

fn default_max_pages() -> usize {
    5
}

fn default_navigation_timeout_secs() -> u64 {
    60
}

fn default_checkout_wait_secs() -> u64 {
    10
}

fn default_checkout_attempts() -> u32 {
    6
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            warm_pages: default_warm_pages(),
            max_pages: default_max_pages(),
            headless: true,
            chrome_path: None,
            launch_args: Vec::new(),
            navigation_timeout_secs: default_navigation_timeout_secs(),
            checkout_wait_secs: default_checkout_wait_secs(),
            checkout_attempts: default_checkout_attempts(),
        }
    }
}

/// CAPTCHA resolution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptchaSettings {
    /// Use the automatic solver when a key is present.
    #[serde(default = "default_true")]
    pub solver_enabled: bool,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_solver_base_url")]
    pub solver_base_url: String,
    #[serde(default = "default_solver_initial_wait_ms")]
    pub solver_initial_wait_ms: u64,
    #[serde(default = "default_solver_poll_interval_ms")]
    pub solver_poll_interval_ms: u64,
    #[serde(default = "default_solver_max_attempts")]
    pub solver_max_attempts: u32,
    #[serde(default = "default_manual_timeout_secs")]
    pub manual_timeout_secs: u64,
}

fn default_solver_base_url() -> String {
    "http://2captcha.com".to_string()
}

fn default_solver_initial_wait_ms() -> u64 {
    10_000
}

fn default_solver_poll_interval_ms() -> u64 {
    5_000
}

fn default_solver_max_attempts() -> u32 {
    30
}

fn default_manual_timeout_secs() -> u64 {
    300
}

impl Default for CaptchaSettings {
    fn default() -> Self {
        Self {
            solver_enabled: true,
            api_key: None,
            solver_base_url: default_solver_base_url(),
            solver_initial_wait_ms: default_solver_initial_wait_ms(),
            solver_poll_interval_ms: default_solver_poll_interval_ms(),
            solver_max_attempts: default_solver_max_attempts(),
            manual_timeout_secs: default_manual_timeout_secs(),
        }
    }
}

/// Search phase settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchSettings {
    /// Upper bound for one backend call (all pages of one term).
    #[serde(default = "default_search_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_pages_per_term")]
    pub max_pages: usize,
    /// Rows requested per structured-API page.
    #[serde(default = "default_api_page_size")]
    pub api_page_size: usize,
    #[serde(default = "default_cordis_sparql_endpoint")]
    pub cordis_sparql_endpoint: String,
    /// Restrict web searches to this domain (`site:` operator).
    #[serde(default)]
    pub site_domain: Option<String>,
}

fn default_search_timeout_secs() -> u64 {
    600
}

fn default_max_pages_per_term() -> usize {
    10
}

fn default_api_page_size() -> usize {
    20
}

fn default_cordis_sparql_endpoint() -> String {
    "https://cordis.europa.eu/datalab/sparql".to_string()
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_search_timeout_secs(),
            max_pages: default_max_pages_per_term(),
            api_page_size: default_api_page_size(),
            cordis_sparql_endpoint: default_cordis_sparql_endpoint(),
            site_domain: None,
        }
    }
}

/// Tabulation phase settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionSettings {
    #[serde(default = "default_extraction_timeout_secs")]
    pub timeout_secs: u64,
    /// Candidates fetched concurrently inside one worker.
    #[serde(default = "default_fan_out")]
    pub fan_out: usize,
    #[serde(default = "default_true")]
    pub track_keywords: bool,
    #[serde(default = "default_download_attempts")]
    pub download_attempts: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_extraction_timeout_secs() -> u64 {
    60
}

fn default_fan_out() -> usize {
    2
}

fn default_download_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    2_000
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for ExtractionSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_extraction_timeout_secs(),
            fan_out: default_fan_out(),
            track_keywords: true,
            download_attempts: default_download_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Proxy endpoints and the domains routed through them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySettings {
    /// Proxy URLs such as `socks5://127.0.0.1:1080`.
    #[serde(default)]
    pub endpoints: Vec<String>,
    #[serde(default)]
    pub random: bool,
    #[serde(default = "default_defense_heavy_domains")]
    pub defense_heavy_domains: Vec<String>,
}

fn default_defense_heavy_domains() -> Vec<String> {
    vec!["google.com".to_string(), "duckduckgo.com".to_string()]
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            random: false,
            defense_heavy_domains: default_defense_heavy_domains(),
        }
    }
}

/// Where result files are written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSettings {
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("results")
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
        }
    }
}

impl SweepConfig {
    /// Reads a JSON configuration file. A missing file yields defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!("Config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let config: SweepConfig = serde_json::from_str(&raw)?;
        Ok(config)
    }

    /// Applies environment overrides.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(key) = std::env::var(ENV_CAPTCHA_KEY) {
            if !key.trim().is_empty() {
                self.captcha.api_key = Some(key.trim().to_string());
            }
        }
        if let Ok(dir) = std::env::var(ENV_OUTPUT_DIR) {
            if !dir.trim().is_empty() {
                self.output.dir = PathBuf::from(dir.trim());
            }
        }
        if self.browser.chrome_path.is_none() {
            if let Ok(chrome) = std::env::var(ENV_CHROME) {
                if !chrome.trim().is_empty() {
                    self.browser.chrome_path = Some(chrome.trim().to_string());
                }
            }
        }
        self
    }

    /// Rejects values that cannot work at runtime.
    pub fn validate(&self) -> Result<()> {
        if self.browser.max_pages == 0 {
            return Err(SweepError::Config("browser.max_pages must be > 0".into()));
        }
        if self.browser.warm_pages > self.browser.max_pages {
            return Err(SweepError::Config(
                "browser.warm_pages cannot exceed browser.max_pages".into(),
            ));
        }
        if self.delay.floor_ms > self.delay.ceiling_ms {
            return Err(SweepError::Config(
                "delay.floor_ms cannot exceed delay.ceiling_ms".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.delay.jitter) {
            return Err(SweepError::Config("delay.jitter must be within 0..=1".into()));
        }
        if self.extraction.fan_out == 0 {
            return Err(SweepError::Config("extraction.fan_out must be > 0".into()));
        }
        if self.extraction.download_attempts == 0 {
            return Err(SweepError::Config(
                "extraction.download_attempts must be > 0".into(),
            ));
        }
        Ok(())
    }

    pub fn search_timeout(&self) -> Duration {
        Duration::from_secs(self.search.timeout_secs)
    }

    pub fn extraction_timeout(&self) -> Duration {
        Duration::from_secs(self.extraction.timeout_secs)
    }

    /// Longest a single CAPTCHA resolution may take on the configured path.
    pub fn captcha_wait(&self) -> Duration {
        let captcha = &self.captcha;
        let automatic = captcha.solver_enabled
            && captcha.api_key.as_deref().is_some_and(|k| !k.trim().is_empty());
        if automatic {
            Duration::from_millis(
                captcha.solver_initial_wait_ms
                    + captcha.solver_poll_interval_ms * u64::from(captcha.solver_max_attempts),
            )
        } else {
            Duration::from_secs(captcha.manual_timeout_secs)
        }
    }

    /// Outer bound for fetching one candidate.
    ///
    /// Covers the longest of the nested waits (download retries with
    /// backoff and pacing, or page checkout plus navigation plus settle) and
    /// then one CAPTCHA resolution, so those bounds fire before this one.
    /// Never below `extraction.timeout_secs`.
    pub fn candidate_timeout(&self) -> Duration {
        let extraction = &self.extraction;
        let attempts = u64::from(extraction.download_attempts.max(1));
        let download = Duration::from_secs(
            attempts * (extraction.request_timeout_secs + self.delay.ceiling_ms / 1000),
        ) + Duration::from_millis(extraction.retry_backoff_ms * attempts * (attempts - 1) / 2);

        let browser = &self.browser;
        let render = Duration::from_secs(
            browser.checkout_wait_secs * u64::from(browser.checkout_attempts)
                + browser.navigation_timeout_secs
                + SETTLE_ALLOWANCE_SECS,
        );

        self.extraction_timeout().max(download).max(render) + self.captcha_wait()
    }
}

/// Two selector settles (after navigation and after a consent click).
const SETTLE_ALLOWANCE_SECS: u64 = 2 * 40;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = SweepConfig::default();
        assert_eq!(config.delay.initial_ms, 1_000);
        assert_eq!(config.delay.ceiling_ms, 30_000);
        assert_eq!(config.cache.max_age_secs, 86_400);
        assert_eq!(config.cache.max_bytes, 100 * 1024 * 1024);
        assert_eq!(config.browser.max_pages, 5);
        assert_eq!(config.captcha.solver_max_attempts, 30);
        assert_eq!(config.captcha.manual_timeout_secs, 300);
        assert_eq!(config.extraction.timeout_secs, 60);
        assert_eq!(config.extraction.fan_out, 2);
        assert!(config.extraction.track_keywords);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_candidate_timeout_outlasts_nested_waits() {
        let mut config = SweepConfig::default();
        assert_eq!(config.captcha_wait(), Duration::from_secs(300));
        let manual = config.candidate_timeout();
        assert!(manual > config.captcha_wait() + config.extraction_timeout());
        assert!(
            manual
                > config.captcha_wait()
                    + Duration::from_secs(config.browser.navigation_timeout_secs)
        );

        config.captcha.api_key = Some("key".to_string());
        assert_eq!(config.captcha_wait(), Duration::from_secs(160));
        assert!(config.candidate_timeout() > Duration::from_secs(160 + 60));

        config.captcha.solver_enabled = false;
        assert_eq!(config.captcha_wait(), Duration::from_secs(300));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: SweepConfig =
            serde_json::from_str(r#"{"delay": {"initial_ms": 500}, "browser": {"headless": false}}"#)
                .unwrap();
        assert_eq!(config.delay.initial_ms, 500);
        assert_eq!(config.delay.floor_ms, 250);
        assert!(!config.browser.headless);
        assert_eq!(config.browser.warm_pages, 3);
        assert_eq!(config.search.max_pages, 10);
    }

    #[test]
    fn test_from_file_missing_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = SweepConfig::from_file(dir.path().join("absent.json")).unwrap();
        assert_eq!(config.extraction.download_attempts, 3);
    }

    #[test]
    fn test_from_file_reads_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sweep.json");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, r#"{{"proxies": {{"endpoints": ["http://10.0.0.1:3128"]}}}}"#).unwrap();
        let config = SweepConfig::from_file(&path).unwrap();
        assert_eq!(config.proxies.endpoints, vec!["http://10.0.0.1:3128"]);
        assert!(config.proxies.defense_heavy_domains.contains(&"google.com".to_string()));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = SweepConfig::default();
        config.delay.floor_ms = 60_000;
        assert!(config.validate().is_err());

        let mut config = SweepConfig::default();
        config.delay.jitter = 1.5;
        assert!(config.validate().is_err());

        let mut config = SweepConfig::default();
        config.browser.max_pages = 0;
        assert!(config.validate().is_err());

        let mut config = SweepConfig::default();
        config.browser.warm_pages = 9;
        assert!(config.validate().is_err());
    }
}
