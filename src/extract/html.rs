//! Visible text of an HTML page.

use scraper::{ElementRef, Html, Selector};

/// Elements whose subtree never contributes visible text.
const SKIP_TAGS: &[&str] = &[
    "script", "style", "noscript", "iframe", "nav", "footer", "header", "aside", "svg",
    "template", "canvas",
];

/// Class or id values that mark boilerplate blocks.
const NOISE_MARKERS: &[&str] = &[
    "nav",
    "menu",
    "sidebar",
    "advertisement",
    "ad",
    "banner",
    "cookie",
    "popup",
    "modal",
];

/// Main-content regions, in order of preference.
const MAIN_SELECTORS: &[&str] = &[
    "main",
    "article",
    ".content",
    "#content",
    ".main-content",
    ".post-content",
    ".entry-content",
    ".article-content",
    "[role=main]",
];

/// A region must carry at least this much text to be preferred over `body`.
const MIN_REGION_CHARS: usize = 50;

/// Visible text of `html`, from the main-content region when one is found,
/// otherwise from `body`. Whitespace is collapsed.
pub fn visible_text(html: &str) -> String {
    let document = Html::parse_document(html);

    for css in MAIN_SELECTORS {
        let Ok(selector) = Selector::parse(css) else {
            continue;
        };
        for region in document.select(&selector) {
            let text = element_text(&region);
            if text.chars().filter(|c| !c.is_whitespace()).count() >= MIN_REGION_CHARS {
                return text;
            }
        }
    }

    if let Ok(body) = Selector::parse("body") {
        if let Some(body) = document.select(&body).next() {
            return element_text(&body);
        }
    }
    element_text(&document.root_element())
}

/// Text content of the `<title>` element.
pub fn page_title(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("title").ok()?;
    let title = document
        .select(&selector)
        .next()?
        .text()
        .collect::<String>();
    let title = collapse_whitespace(&title);
    (!title.is_empty()).then_some(title)
}

fn element_text(element: &ElementRef) -> String {
    let mut parts = Vec::new();
    collect_text(element, &mut parts);
    collapse_whitespace(&parts.join(" "))
}

fn collect_text(element: &ElementRef, parts: &mut Vec<String>) {
    for child in element.children() {
        if let Some(child_element) = ElementRef::wrap(child) {
            let node = child_element.value();
            if SKIP_TAGS.contains(&node.name()) {
                continue;
            }
            let noisy = node.id().map(is_noise).unwrap_or(false) || node.classes().any(is_noise);
            if noisy {
                continue;
            }
            collect_text(&child_element, parts);
        } else if let Some(text) = child.value().as_text() {
            parts.push(text.text.to_string());
        }
    }
}

fn is_noise(identifier: &str) -> bool {
    let identifier = identifier.to_ascii_lowercase();
    NOISE_MARKERS.contains(&identifier.as_str())
}

pub(crate) fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
