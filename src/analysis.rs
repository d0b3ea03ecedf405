//! Word counting, keyword scoring and the exclusion rule.

use std::collections::{BTreeMap, HashSet};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Spanish and English prepositions and conjunctions.
const STOP_WORDS: &[&str] = &[
    "a", "ante", "bajo", "con", "contra", "de", "desde", "durante", "en", "entre", "hacia",
    "hasta", "mediante", "para", "por", "según", "sin", "sobre", "tras", "y", "e", "ni", "que",
    "o", "u", "pero", "mas", "aunque", "sino", "porque", "pues", "ya", "si", "el", "la", "los",
    "las", "del", "al", "the", "of", "and", "to", "in", "for", "with", "on", "at", "from", "by",
    "about", "as", "into", "like", "through", "after", "over", "between", "out", "against",
    "during", "without", "before", "under", "around", "among", "or", "but", "yet", "so", "nor",
    "if", "while", "because", "though", "although", "since", "unless", "than", "whether", "an",
];

/// Keywords shorter than three characters are not counted.
const MIN_KEYWORD_LEN: usize = 3;

/// The zero-match rule only applies once this many keywords were searched.
const MIN_KEYWORDS_FOR_ZERO_RULE: usize = 3;

fn stop_words() -> &'static HashSet<&'static str> {
    static SET: OnceLock<HashSet<&'static str>> = OnceLock::new();
    SET.get_or_init(|| STOP_WORDS.iter().copied().collect())
}

fn word_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\w+").expect("valid word regex"))
}

pub fn is_stop_word(word: &str) -> bool {
    stop_words().contains(word.to_lowercase().as_str())
}

/// Total words, by whitespace tokenization.
pub fn count_words(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Lowercased words of `text` that are not stop words, in order.
pub fn significant_words(text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    word_pattern()
        .find_iter(&lower)
        .map(|m| m.as_str().to_string())
        .filter(|w| !stop_words().contains(w.as_str()))
        .collect()
}

/// Drops stop words from a query; returns the query unchanged if nothing is left.
pub fn filter_stop_words(query: &str) -> String {
    let kept: Vec<&str> = query
        .split_whitespace()
        .filter(|w| !is_stop_word(w))
        .collect();
    if kept.is_empty() {
        query.to_string()
    } else {
        kept.join(" ")
    }
}

/// Occurrences of the query's keywords in a document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordCounts {
    /// Capitalized single keyword -> word-boundary matches. Zero counts kept.
    pub words: BTreeMap<String, usize>,
    /// Multi-word phrase from the query and its substring matches.
    pub phrase: Option<(String, usize)>,
}

impl KeywordCounts {
    /// Number of distinct single keywords that were searched.
    pub fn searched(&self) -> usize {
        self.words.len()
    }

    /// Sum of every count, phrase included.
    pub fn total_matches(&self) -> usize {
        self.words.values().sum::<usize>() + self.phrase.as_ref().map(|(_, n)| *n).unwrap_or(0)
    }

    /// Non-zero counts, sorted by key.
    pub fn non_zero(&self) -> Vec<(String, usize)> {
        let mut all: Vec<(String, usize)> = self
            .words
            .iter()
            .filter(|(_, n)| **n > 0)
            .map(|(k, n)| (k.clone(), *n))
            .collect();
        if let Some((phrase, n)) = &self.phrase {
            if *n > 0 {
                all.push((format!("\"{}\"", phrase), *n));
            }
        }
        all.sort();
        all
    }
}

/// Counts each significant query word (word-boundary, case-insensitive) and
/// the whole query as a phrase (substring, case-insensitive) in `text`.
pub fn keyword_counts(text: &str, query: &str) -> KeywordCounts {
    let mut counts = KeywordCounts::default();
    let query = query.trim();
    if query.is_empty() {
        return counts;
    }

    let content = text.to_lowercase();
    let mut seen = HashSet::new();
    for word in significant_words(query) {
        if word.chars().count() < MIN_KEYWORD_LEN || !seen.insert(word.clone()) {
            continue;
        }
        let count = match Regex::new(&format!(r"\b{}\b", regex::escape(&word))) {
            Ok(pattern) => pattern.find_iter(&content).count(),
            Err(_) => content.matches(word.as_str()).count(),
        };
        counts.words.insert(capitalize(&word), count);
    }

    let phrase = query
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    if phrase.split(' ').count() > 1 {
        let n = content.matches(phrase.as_str()).count();
        counts.phrase = Some((phrase, n));
    }
    counts
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// `"Total words: N | Key: n | ..."` with zero counts omitted.
pub fn word_summary(total_words: usize, counts: &KeywordCounts) -> String {
    let mut parts = vec![format!("Total words: {}", total_words)];
    for (key, n) in counts.non_zero() {
        parts.push(format!("{}: {}", key, n));
    }
    parts.join(" | ")
}

/// Which exclusion branch fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExclusionCause {
    LowWordCount,
    NoKeywordMatches,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exclusion {
    pub cause: ExclusionCause,
    pub reason: String,
}

/// Applies the exclusion rule. The word-count check runs first.
pub fn evaluate_exclusion(
    word_count: usize,
    counts: &KeywordCounts,
    min_words: usize,
    track_keywords: bool,
) -> Option<Exclusion> {
    if word_count < min_words {
        return Some(Exclusion {
            cause: ExclusionCause::LowWordCount,
            reason: format!("Low word count: {} (minimum {})", word_count, min_words),
        });
    }

    if track_keywords
        && counts.searched() >= MIN_KEYWORDS_FOR_ZERO_RULE
        && counts.words.values().all(|n| *n == 0)
    {
        return Some(Exclusion {
            cause: ExclusionCause::NoKeywordMatches,
            reason: "No keyword matches in content".to_string(),
        });
    }
    None
}

fn description_patterns() -> &'static [Regex; 4] {
    static RES: OnceLock<[Regex; 4]> = OnceLock::new();
    RES.get_or_init(|| {
        [
            Regex::new(r"(?:https?://|www\.)\S+").expect("valid url regex"),
            Regex::new(
                r"(?i)\s+(?:visita|visitar|ver en|ver|click|enlace|link|url|más información en|más en|leer más en|visit|see|read more at|more at)[:\s]+\S+$",
            )
            .expect("valid reference regex"),
            Regex::new(r"\s+\w+\.[A-Za-z]{2,}(?:\.[A-Za-z]{2,})*(?:/\S*)?").expect("valid domain regex"),
            Regex::new(r"\s+").expect("valid whitespace regex"),
        ]
    })
}

/// Removes links, "visit: ..." trailers and bare domains; collapses whitespace.
pub fn clean_description(text: &str) -> String {
    let [urls, trailer, domains, spaces] = description_patterns();
    let cleaned = urls.replace_all(text, "");
    let cleaned = trailer.replace_all(cleaned.trim_end(), "");
    let cleaned = domains.replace_all(&cleaned, "");
    spaces.replace_all(&cleaned, " ").trim().to_string()
}

const SHORT_DESCRIPTION: usize = 100;
const PREVIEW_CHARS: usize = 1000;

/// Cleans a description and, when it is short, replaces it with a cleaned
/// preview of the content if that preview is more than twice as long.
pub fn enrich_description(description: &str, content: &str) -> String {
    let description = clean_description(description);
    if description.chars().count() >= SHORT_DESCRIPTION || content.trim().is_empty() {
        return description;
    }
    let preview: String = content.chars().take(PREVIEW_CHARS).collect();
    let preview = clean_description(&preview);
    if preview.chars().count() > description.chars().count() * 2 {
        preview
    } else {
        description
    }
}
