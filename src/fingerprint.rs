//! Randomized browser fingerprints and User-Agent rotation.

use std::collections::VecDeque;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

const DESKTOP_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/129.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36 Edg/131.0.0.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36 Edg/130.0.0.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36 Edg/131.0.0.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36 OPR/116.0.0.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:132.0) Gecko/20100101 Firefox/132.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:132.0) Gecko/20100101 Firefox/132.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/18.1.1 Safari/605.1.15",
];

const MOBILE_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Linux; Android 11; Pixel 5) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Mobile Safari/537.36",
    "Mozilla/5.0 (Linux; Android 13; SM-S916B) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Mobile Safari/537.36",
    "Mozilla/5.0 (Linux; Android 14; Pixel 8 Pro) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0.0.0 Mobile Safari/537.36",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 17_5_1 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.5 Mobile/15E148 Safari/604.1",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 18_0 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/18.0 Mobile/15E148 Safari/604.1",
];

const TABLET_AGENTS: &[&str] = &[
    "Mozilla/5.0 (iPad; CPU OS 17_5 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.5 Mobile/15E148 Safari/604.1",
    "Mozilla/5.0 (Linux; Android 13; SM-X710) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
];

/// Realistic desktop viewports.
const VIEWPORTS: &[(u32, u32)] = &[
    (1920, 1080),
    (1366, 768),
    (1536, 864),
    (1440, 900),
    (1280, 720),
    (1600, 900),
    (1680, 1050),
];

const PIXEL_RATIOS: &[f64] = &[1.0, 1.25, 1.5, 2.0];

/// `(locale, timezone, latitude, longitude)` tuples that belong together.
const REGIONS: &[(&str, &str, f64, f64)] = &[
    ("en-US", "America/New_York", 40.7128, -74.0060),
    ("en-US", "America/Chicago", 41.8781, -87.6298),
    ("en-GB", "Europe/London", 51.5074, -0.1278),
    ("fr-FR", "Europe/Paris", 48.8566, 2.3522),
    ("de-DE", "Europe/Berlin", 52.5200, 13.4050),
    ("es-ES", "Europe/Madrid", 40.4168, -3.7038),
    ("it-IT", "Europe/Rome", 41.9028, 12.4964),
    ("pt-BR", "America/Sao_Paulo", -23.5505, -46.6333),
    ("ja-JP", "Asia/Tokyo", 35.6762, 139.6503),
    ("en-AU", "Australia/Sydney", -33.8688, 151.2093),
];

/// Device class of a User-Agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    #[default]
    Desktop,
    Mobile,
    Tablet,
}

/// Hands out User-Agents, avoiding the last `max_recent` issued.
#[derive(Debug, Clone)]
pub struct UserAgentRotator {
    agents: Vec<String>,
    recent: VecDeque<String>,
    max_recent: usize,
}

impl UserAgentRotator {
    pub fn new(class: DeviceClass) -> Self {
        let agents = match class {
            DeviceClass::Desktop => DESKTOP_AGENTS,
            DeviceClass::Mobile => MOBILE_AGENTS,
            DeviceClass::Tablet => TABLET_AGENTS,
        };
        Self::with_agents(agents.iter().map(|a| a.to_string()).collect())
    }

    pub fn with_agents(agents: Vec<String>) -> Self {
        let agents = if agents.is_empty() {
            DESKTOP_AGENTS.iter().map(|a| a.to_string()).collect()
        } else {
            agents
        };
        Self {
            agents,
            recent: VecDeque::new(),
            max_recent: 10,
        }
    }

    pub fn with_max_recent(mut self, max_recent: usize) -> Self {
        self.max_recent = max_recent;
        self
    }

    /// Next agent, preferring ones not issued recently.
    pub fn next_agent(&mut self) -> String {
        let mut rng = rand::thread_rng();
        let unused: Vec<&String> = self
            .agents
            .iter()
            .filter(|a| !self.recent.contains(a))
            .collect();
        let chosen = match unused.choose(&mut rng) {
            Some(agent) => (*agent).clone(),
            // Every agent was issued recently: fall back to the full pool.
            None => self
                .agents
                .choose(&mut rng)
                .cloned()
                .unwrap_or_else(|| DESKTOP_AGENTS[0].to_string()),
        };

        self.recent.push_back(chosen.clone());
        while self.recent.len() > self.max_recent {
            self.recent.pop_front();
        }
        chosen
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

impl Default for UserAgentRotator {
    fn default() -> Self {
        Self::new(DeviceClass::Desktop)
    }
}

/// One randomized browser identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub viewport: (u32, u32),
    pub locale: String,
    pub timezone: String,
    pub geolocation: (f64, f64),
    pub device_pixel_ratio: f64,
    pub user_agent: String,
}

impl Fingerprint {
    /// `Accept-Language` header value matching the locale.
    pub fn accept_language(&self) -> String {
        let primary = self.locale.split('-').next().unwrap_or("en");
        if primary == "en" {
            format!("{},en;q=0.9", self.locale)
        } else {
            format!("{},{};q=0.9,en;q=0.8", self.locale, primary)
        }
    }

    /// Script installed on every new document of a page using this identity.
    pub fn init_script(&self) -> String {
        let primary = self.locale.split('-').next().unwrap_or("en");
        format!(
            r#"(() => {{
    Object.defineProperty(navigator, 'webdriver', {{ get: () => undefined, configurable: true }});
    Object.defineProperty(navigator, 'languages', {{ get: () => ['{locale}', '{primary}'], configurable: true }});
    Object.defineProperty(navigator, 'language', {{ get: () => '{locale}', configurable: true }});
    Object.defineProperty(window, 'devicePixelRatio', {{ get: () => {dpr}, configurable: true }});
    if (!window.chrome) {{ window.chrome = {{ runtime: {{}} }}; }}
    const coords = {{ latitude: {lat}, longitude: {lon}, accuracy: 50, altitude: null, altitudeAccuracy: null, heading: null, speed: null }};
    if (navigator.geolocation) {{
        navigator.geolocation.getCurrentPosition = (ok) => ok({{ coords, timestamp: Date.now() }});
        navigator.geolocation.watchPosition = (ok) => {{ ok({{ coords, timestamp: Date.now() }}); return 1; }};
    }}
    delete window.__playwright;
    delete window.callPhantom;
    delete window._phantom;
    delete window.domAutomation;
    delete window.domAutomationController;
}})();"#,
            locale = self.locale,
            primary = primary,
            dpr = self.device_pixel_ratio,
            lat = self.geolocation.0,
            lon = self.geolocation.1,
        )
    }
}

/// Produces fresh fingerprints backed by a rotating User-Agent pool.
#[derive(Debug, Clone, Default)]
pub struct FingerprintGenerator {
    rotator: UserAgentRotator,
}

impl FingerprintGenerator {
    pub fn new(rotator: UserAgentRotator) -> Self {
        Self { rotator }
    }

    pub fn generate(&mut self) -> Fingerprint {
        let user_agent = self.rotator.next_agent();
        let mut rng = rand::thread_rng();
        let viewport = *VIEWPORTS.choose(&mut rng).unwrap_or(&(1366, 768));
        let device_pixel_ratio = *PIXEL_RATIOS.choose(&mut rng).unwrap_or(&1.0);
        let (locale, timezone, lat, lon) =
            *REGIONS.choose(&mut rng).unwrap_or(&REGIONS[0]);
        // Small offset so two sessions in one city do not share coordinates.
        let lat = lat + rng.gen_range(-0.05..0.05);
        let lon = lon + rng.gen_range(-0.05..0.05);

        Fingerprint {
            viewport,
            locale: locale.to_string(),
            timezone: timezone.to_string(),
            geolocation: (lat, lon),
            device_pixel_ratio,
            user_agent,
        }
    }
}
