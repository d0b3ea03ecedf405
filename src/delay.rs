//! Adaptive per-domain request pacing.
//!
//! Each domain carries its own delay. Failures double it up to a ceiling,
//! successes halve it down to a floor. `wait` sleeps for the current delay
//! with jitter, minus whatever time already passed since the previous request
//! to the same domain.

use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::config::DelaySettings;

/// Snapshot of one domain's pacing state.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainDelayState {
    pub domain: String,
    pub current_delay_ms: u64,
}

struct DomainEntry {
    current: Duration,
    next_allowed: Option<Instant>,
}

/// Per-domain adaptive delay table.
pub struct AdaptiveDelay {
    initial: Duration,
    floor: Duration,
    ceiling: Duration,
    jitter: f64,
    domains: Mutex<HashMap<String, DomainEntry>>,
}

impl AdaptiveDelay {
    pub fn new(settings: &DelaySettings) -> Self {
        let floor = Duration::from_millis(settings.floor_ms);
        let ceiling = Duration::from_millis(settings.ceiling_ms.max(settings.floor_ms));
        let initial = Duration::from_millis(settings.initial_ms).clamp(floor, ceiling);
        Self {
            initial,
            floor,
            ceiling,
            jitter: settings.jitter.clamp(0.0, 1.0),
            domains: Mutex::new(HashMap::new()),
        }
    }

    pub fn floor(&self) -> Duration {
        self.floor
    }

    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }

    pub fn initial(&self) -> Duration {
        self.initial
    }

    /// Sleeps until the next request to `domain` is allowed.
    pub async fn wait(&self, domain: &str) {
        let domain = normalize_domain(domain);
        let sleep_for = {
            let mut domains = self.domains.lock().await;
            let initial = self.initial;
            let entry = domains.entry(domain.clone()).or_insert_with(|| DomainEntry {
                current: initial,
                next_allowed: None,
            });

            let target = self.jittered(entry.current);
            let now = Instant::now();
            let sleep_for = match entry.next_allowed {
                // First contact with a domain goes out immediately.
                None => Duration::ZERO,
                Some(reserved) => {
                    let since_reserved = now.saturating_duration_since(reserved);
                    target.saturating_sub(since_reserved)
                }
            };
            entry.next_allowed = Some(now + sleep_for);
            sleep_for
        };

        if !sleep_for.is_zero() {
            debug!(domain = %domain, delay_ms = sleep_for.as_millis() as u64, "Adaptive delay");
            tokio::time::sleep(sleep_for).await;
        }
    }

    /// Doubles the domain's delay, capped at the ceiling.
    pub async fn record_failure(&self, domain: &str) -> Duration {
        let domain = normalize_domain(domain);
        let mut domains = self.domains.lock().await;
        let entry = domains.entry(domain.clone()).or_insert_with(|| DomainEntry {
            current: self.initial,
            next_allowed: None,
        });
        entry.current = (entry.current * 2).min(self.ceiling);
        debug!(domain = %domain, delay_ms = entry.current.as_millis() as u64, "Delay increased");
        entry.current
    }

    /// Halves the domain's delay, bounded below by the floor.
    pub async fn record_success(&self, domain: &str) -> Duration {
        let domain = normalize_domain(domain);
        let mut domains = self.domains.lock().await;
        let entry = domains.entry(domain).or_insert_with(|| DomainEntry {
            current: self.initial,
            next_allowed: None,
        });
        entry.current = (entry.current / 2).max(self.floor);
        entry.current
    }

    /// Restores the initial delay for one domain.
    pub async fn reset(&self, domain: &str) {
        let domain = normalize_domain(domain);
        let mut domains = self.domains.lock().await;
        if let Some(entry) = domains.get_mut(&domain) {
            entry.current = self.initial;
        }
    }

    /// Restores the initial delay for every domain.
    pub async fn reset_all(&self) {
        let mut domains = self.domains.lock().await;
        for entry in domains.values_mut() {
            entry.current = self.initial;
        }
    }

    /// Current delay for a domain (the initial delay if never seen).
    pub async fn current(&self, domain: &str) -> Duration {
        let domain = normalize_domain(domain);
        let domains = self.domains.lock().await;
        domains
            .get(&domain)
            .map(|e| e.current)
            .unwrap_or(self.initial)
    }

    /// State of every tracked domain, sorted by name.
    pub async fn snapshot(&self) -> Vec<DomainDelayState> {
        let domains = self.domains.lock().await;
        let mut states: Vec<_> = domains
            .iter()
            .map(|(domain, entry)| DomainDelayState {
                domain: domain.clone(),
                current_delay_ms: entry.current.as_millis() as u64,
            })
            .collect();
        states.sort_by(|a, b| a.domain.cmp(&b.domain));
        states
    }

    fn jittered(&self, base: Duration) -> Duration {
        let base_ms = base.as_millis() as f64;
        let spread = base_ms * self.jitter;
        let offset = if spread > 0.0 {
            rand::thread_rng().gen_range(-spread..=spread)
        } else {
            0.0
        };
        let ms = (base_ms + offset).max(self.floor.as_millis() as f64);
        Duration::from_millis(ms as u64)
    }
}

/// Host part of a URL (or a bare host), lowercased, without `www.`.
pub fn domain_of(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(parsed) => parsed
            .host_str()
            .map(normalize_domain)
            .unwrap_or_default(),
        Err(_) => normalize_domain(url),
    }
}

fn normalize_domain(domain: &str) -> String {
    let lower = domain.trim().to_ascii_lowercase();
    lower.strip_prefix("www.").unwrap_or(&lower).to_string()
}
