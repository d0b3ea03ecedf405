//! Human-like pacing and interaction.
//!
//! The planners are pure and produce randomized schedules; the live helpers
//! (feature `headless`) replay those schedules against a browser page.

use std::collections::HashMap;
use std::ops::Range;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// One step of a typing schedule.
#[derive(Debug, Clone, PartialEq)]
pub enum Keystroke {
    /// Type a character after `delay`.
    Char { ch: char, delay: Duration },
    /// Erase the previous character after `delay`.
    Backspace { delay: Duration },
}

impl Keystroke {
    pub fn delay(&self) -> Duration {
        match self {
            Keystroke::Char { delay, .. } | Keystroke::Backspace { delay } => *delay,
        }
    }
}

const KEY_DELAY_MS: Range<u64> = 80..251;
const HESITATION_CHANCE: f64 = 0.12;
const HESITATION_FACTOR: f64 = 1.8;
const TYPO_CHANCE: f64 = 0.06;

/// Schedule for typing `text`: a variable delay per character, occasional
/// hesitations and occasional wrong characters corrected with a backspace.
pub fn typing_plan(text: &str) -> Vec<Keystroke> {
    let mut rng = rand::thread_rng();
    let mut plan = Vec::with_capacity(text.len() + 4);

    for ch in text.chars() {
        if ch.is_alphabetic() && rng.gen_bool(TYPO_CHANCE) {
            let wrong = (b'a' + rng.gen_range(0..26u8)) as char;
            plan.push(Keystroke::Char {
                ch: wrong,
                delay: key_delay(&mut rng),
            });
            plan.push(Keystroke::Backspace {
                delay: key_delay(&mut rng),
            });
        }
        let mut delay = key_delay(&mut rng);
        if rng.gen_bool(HESITATION_CHANCE) {
            delay = delay.mul_f64(HESITATION_FACTOR);
        }
        plan.push(Keystroke::Char { ch, delay });
    }
    plan
}

/// Text produced by replaying a typing schedule.
pub fn replay(plan: &[Keystroke]) -> String {
    let mut out = String::new();
    for stroke in plan {
        match stroke {
            Keystroke::Char { ch, .. } => out.push(*ch),
            Keystroke::Backspace { .. } => {
                out.pop();
            }
        }
    }
    out
}

fn key_delay(rng: &mut impl Rng) -> Duration {
    Duration::from_millis(rng.gen_range(KEY_DELAY_MS))
}

/// Pause before acting on a freshly loaded page (3-12 s).
pub fn thinking_time() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(3_000..=12_000))
}

/// Short pause between two interactions.
pub fn short_pause() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(250..=900))
}

/// Point the pointer moves to, and how long it rests there.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MouseStep {
    pub x: i32,
    pub y: i32,
    pub pause: Duration,
}

/// A wandering pointer path of 3-7 points inside a typical viewport.
pub fn mouse_path() -> Vec<MouseStep> {
    let mut rng = rand::thread_rng();
    let moves = rng.gen_range(3..=7);
    (0..moves)
        .map(|_| MouseStep {
            x: rng.gen_range(80..900),
            y: rng.gen_range(80..700),
            pause: Duration::from_millis(rng.gen_range(80..200)),
        })
        .collect()
}

/// Scroll increment and the pause that follows it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrollStep {
    pub pixels: u32,
    pub pause: Duration,
}

/// 2-5 downward scroll increments of 150-300 px each.
pub fn scroll_steps() -> Vec<ScrollStep> {
    let mut rng = rand::thread_rng();
    let passes = rng.gen_range(2..=5);
    (0..passes)
        .map(|_| ScrollStep {
            pixels: rng.gen_range(150..=300),
            pause: Duration::from_millis(rng.gen_range(250..1_200)),
        })
        .collect()
}

/// Enforces a randomized minimum gap between searches of the same session.
pub struct SearchThrottle {
    gap: Range<Duration>,
    last: Mutex<HashMap<String, Instant>>,
}

impl SearchThrottle {
    pub fn new() -> Self {
        Self::with_gap(Duration::from_secs(30)..Duration::from_secs(90))
    }

    pub fn with_gap(gap: Range<Duration>) -> Self {
        Self {
            gap,
            last: Mutex::new(HashMap::new()),
        }
    }

    /// Waits until the gap since the previous search of `session` has passed,
    /// then records the current search.
    pub async fn wait(&self, session: &str) {
        let sleep_for = {
            let mut last = self.last.lock().await;
            let now = Instant::now();
            let sleep_for = match last.get(session) {
                None => Duration::ZERO,
                Some(previous) => {
                    let gap = self.draw_gap();
                    gap.saturating_sub(now.saturating_duration_since(*previous))
                }
            };
            last.insert(session.to_string(), now + sleep_for);
            sleep_for
        };

        if !sleep_for.is_zero() {
            debug!(session = %session, wait_secs = sleep_for.as_secs(), "Search throttle");
            tokio::time::sleep(sleep_for).await;
        }
    }

    fn draw_gap(&self) -> Duration {
        if self.gap.start >= self.gap.end {
            return self.gap.start;
        }
        let ms = rand::thread_rng()
            .gen_range(self.gap.start.as_millis() as u64..self.gap.end.as_millis() as u64);
        Duration::from_millis(ms)
    }
}

impl Default for SearchThrottle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "headless")]
pub use live::{accept_consent, scroll_like_human, type_like_human, wander_mouse};

#[cfg(feature = "headless")]
mod live {
    use chromiumoxide::Page;
    use tracing::debug;

    use super::{mouse_path, scroll_steps, typing_plan, Keystroke};
    use crate::{Result, SweepError};

    /// Consent buttons seen on the search sites this crate drives.
    const CONSENT_SELECTORS: &[&str] = &[
        "button#L2AGLb",
        "button[aria-label='Accept all']",
        "button[aria-label='Aceptar todo']",
        "#cookie-consent-banner .wt-ecl-button",
        ".cck-actions-button[href='#accept']",
        "button[id*='accept']",
        "a[href='#accept']",
    ];

    /// Types into the element matching `selector` following a typing plan.
    pub async fn type_like_human(page: &Page, selector: &str, text: &str) -> Result<()> {
        let element = page
            .find_element(selector)
            .await
            .map_err(|e| SweepError::Browser(format!("Input '{}' not found: {}", selector, e)))?;
        element
            .click()
            .await
            .map_err(|e| SweepError::Browser(format!("Failed to focus input: {}", e)))?;

        for stroke in typing_plan(text) {
            tokio::time::sleep(stroke.delay()).await;
            let typed = match stroke {
                Keystroke::Char { ch, .. } => element.type_str(ch.to_string()).await.map(|_| ()),
                Keystroke::Backspace { .. } => element.press_key("Backspace").await.map(|_| ()),
            };
            typed.map_err(|e| SweepError::Browser(format!("Typing failed: {}", e)))?;
        }
        Ok(())
    }

    /// Moves attention over a few random points of the page.
    pub async fn wander_mouse(page: &Page) {
        for step in mouse_path() {
            let script = format!(
                "document.elementFromPoint({}, {})?.dispatchEvent(new MouseEvent('mousemove', {{bubbles: true, clientX: {}, clientY: {}}}))",
                step.x, step.y, step.x, step.y
            );
            if let Err(e) = page.evaluate(script).await {
                debug!("Mouse move skipped: {}", e);
            }
            tokio::time::sleep(step.pause).await;
        }
    }

    /// Scrolls down in a few uneven increments.
    pub async fn scroll_like_human(page: &Page) {
        for step in scroll_steps() {
            let script = format!("window.scrollBy({{top: {}, behavior: 'smooth'}});", step.pixels);
            if let Err(e) = page.evaluate(script).await {
                debug!("Scroll skipped: {}", e);
            }
            tokio::time::sleep(step.pause).await;
        }
    }

    /// Clicks the first visible cookie/consent button. Returns whether one was clicked.
    pub async fn accept_consent(page: &Page) -> bool {
        for selector in CONSENT_SELECTORS {
            if let Ok(button) = page.find_element(*selector).await {
                if button.click().await.is_ok() {
                    debug!(selector = %selector, "Accepted consent banner");
                    tokio::time::sleep(super::short_pause()).await;
                    return true;
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typing_plan_reproduces_text() {
        for _ in 0..50 {
            let plan = typing_plan("cotton spinning");
            assert_eq!(replay(&plan), "cotton spinning");
        }
    }

    #[test]
    fn test_typing_plan_delays_in_range() {
        let plan = typing_plan("abcdefghijklmnopqrstuvwxyz");
        let max = Duration::from_millis(250).mul_f64(HESITATION_FACTOR);
        for stroke in &plan {
            assert!(stroke.delay() >= Duration::from_millis(80));
            assert!(stroke.delay() <= max);
        }
        assert!(plan.len() >= 26);
    }

    #[test]
    fn test_typing_plan_typos_are_corrected() {
        let text = "a".repeat(500);
        let plan = typing_plan(&text);
        for (i, stroke) in plan.iter().enumerate() {
            if let Keystroke::Backspace { .. } = stroke {
                assert!(i > 0);
                assert!(matches!(plan[i - 1], Keystroke::Char { .. }));
            }
        }
        assert_eq!(replay(&plan), text);
    }

    #[test]
    fn test_thinking_time_range() {
        for _ in 0..20 {
            let t = thinking_time();
            assert!(t >= Duration::from_secs(3) && t <= Duration::from_secs(12));
        }
    }

    #[test]
    fn test_scroll_steps_range() {
        let steps = scroll_steps();
        assert!((2..=5).contains(&steps.len()));
        for step in steps {
            assert!((150..=300).contains(&step.pixels));
        }
    }

    #[test]
    fn test_mouse_path_range() {
        let path = mouse_path();
        assert!((3..=7).contains(&path.len()));
        assert!(path.iter().all(|p| p.x >= 80 && p.y >= 80));
    }

    #[tokio::test(start_paused = true)]
    async fn test_search_throttle_enforces_gap() {
        let throttle = SearchThrottle::with_gap(Duration::from_secs(30)..Duration::from_secs(31));
        let start = Instant::now();
        throttle.wait("google").await;
        assert!(start.elapsed() < Duration::from_secs(1));
        throttle.wait("google").await;
        assert!(start.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_search_throttle_sessions_are_independent() {
        let throttle = SearchThrottle::with_gap(Duration::from_secs(30)..Duration::from_secs(31));
        let start = Instant::now();
        throttle.wait("google").await;
        throttle.wait("cordis").await;
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
