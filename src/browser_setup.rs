//! Chrome/Chromium discovery and launch arguments.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::{Result, SweepError};

#[cfg(target_os = "macos")]
const KNOWN_PATHS: &[&str] = &[
    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
    "/Applications/Chromium.app/Contents/MacOS/Chromium",
    "/Applications/Microsoft Edge.app/Contents/MacOS/Microsoft Edge",
];

#[cfg(all(unix, not(target_os = "macos")))]
const KNOWN_PATHS: &[&str] = &[
    "/opt/google/chrome/chrome",
    "/usr/bin/google-chrome",
    "/usr/bin/google-chrome-stable",
    "/usr/bin/chromium",
    "/usr/bin/chromium-browser",
    "/snap/bin/chromium",
];

#[cfg(windows)]
const KNOWN_PATHS: &[&str] = &[
    r"C:\Program Files\Google\Chrome\Application\chrome.exe",
    r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
];

const KNOWN_COMMANDS: &[&str] = &[
    "google-chrome",
    "google-chrome-stable",
    "chromium",
    "chromium-browser",
    "chrome",
];

/// Detect an existing Chrome/Chromium installation.
///
/// Checks, in order:
/// 1. `CHROME` environment variable
/// 2. Well-known command names in PATH
/// 3. Well-known filesystem paths
pub fn detect_chrome() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("CHROME") {
        let p = PathBuf::from(&path);
        if p.exists() {
            debug!("Chrome found via CHROME env var: {}", path);
            return Some(p);
        }
    }

    for cmd in KNOWN_COMMANDS {
        if let Ok(path) = which::which(cmd) {
            debug!("Chrome found in PATH: {}", path.display());
            return Some(path);
        }
    }

    for path_str in KNOWN_PATHS {
        let p = Path::new(path_str);
        if p.exists() {
            debug!("Chrome found at known path: {}", path_str);
            return Some(p.to_path_buf());
        }
    }

    None
}

/// An explicit path wins; otherwise detection. No browser at all is fatal.
pub fn locate_chrome(explicit: Option<&str>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        let p = PathBuf::from(path);
        if p.exists() {
            return Ok(p);
        }
        return Err(SweepError::FatalInit(format!(
            "configured Chrome executable not found: {}",
            path
        )));
    }
    detect_chrome().ok_or_else(|| {
        SweepError::FatalInit(
            "no Chrome/Chromium installation found; set CHROME or browser.chrome_path".to_string(),
        )
    })
}

/// Arguments for the first launch attempt.
pub fn full_launch_args(headless: bool, proxy_url: Option<&str>) -> Vec<String> {
    let mut args = reduced_launch_args(headless);
    args.extend(
        [
            "--disable-blink-features=AutomationControlled",
            "--disable-extensions",
            "--disable-background-networking",
            "--disable-default-apps",
            "--disable-sync",
            "--disable-translate",
            "--mute-audio",
            "--no-first-run",
            "--disable-infobars",
        ]
        .iter()
        .map(|s| s.to_string()),
    );
    if let Some(proxy) = proxy_url {
        args.push(format!("--proxy-server={}", proxy));
    }
    args
}

/// Minimal set used when the first launch fails.
pub fn reduced_launch_args(headless: bool) -> Vec<String> {
    let mut args = vec![
        "--no-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-gpu".to_string(),
    ];
    if headless {
        args.insert(0, "--headless=new".to_string());
    }
    args
}
