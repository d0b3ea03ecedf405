//! Search backend implementations.

pub mod cordis_api;
pub mod cordis_site;
pub mod duckduckgo;
#[cfg(feature = "headless")]
pub mod google;
pub mod memory;

pub use cordis_api::CordisApi;
pub use cordis_site::CordisSite;
pub use duckduckgo::DuckDuckGo;
#[cfg(feature = "headless")]
pub use google::Google;
pub use memory::StaticBackend;

use scraper::Selector;

use crate::{Result, SweepError};

pub(crate) fn selector(css: &str) -> Result<Selector> {
    Selector::parse(css)
        .map_err(|e| SweepError::Parse(format!("Failed to parse selector: {:?}", e)))
}

/// Element text with whitespace collapsed.
pub(crate) fn element_text(element: scraper::ElementRef<'_>) -> String {
    element
        .text()
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
