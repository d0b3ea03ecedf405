//! Subject-code registry and search terms.

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Result, SweepError};

/// One registry row. Immutable for the life of a run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SearchTerm {
    pub code: String,
    pub label: String,
}

fn code_prefix() -> &'static Regex {
    static PREFIX: OnceLock<Regex> = OnceLock::new();
    PREFIX.get_or_init(|| {
        Regex::new(r"^\s*[0-9][0-9.\-/]*(?:\s*[-:.)\u{2013}]\s*|\s+)").expect("valid prefix regex")
    })
}

impl SearchTerm {
    pub fn new(code: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            label: label.into(),
        }
    }

    /// Text sent to a search backend.
    ///
    /// Leading codes such as `"01.0 - "` are removed from the label; the code
    /// itself is used when the label is empty.
    pub fn query_text(&self) -> String {
        let label = self.label.trim();
        let stripped = code_prefix().replace(label, "");
        let stripped = stripped.trim();
        if !stripped.is_empty() {
            stripped.to_string()
        } else if !label.is_empty() {
            label.to_string()
        } else {
            self.code.trim().to_string()
        }
    }
}

/// Ordered list of `(code, label)` rows.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    rows: Vec<SearchTerm>,
}

impl Registry {
    pub fn from_rows(rows: Vec<SearchTerm>) -> Self {
        Self { rows }
    }

    /// Loads the first two columns of a CSV file. A header row whose first
    /// cell reads `code` is skipped.
    pub fn load_csv(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_path(path)
            .map_err(|e| SweepError::Registry(format!("{}: {}", path.display(), e)))?;

        let mut rows = Vec::new();
        for (line, record) in reader.records().enumerate() {
            let record = record?;
            let code = record.get(0).unwrap_or_default();
            let label = record.get(1).unwrap_or_default();
            if code.is_empty() {
                continue;
            }
            if line == 0 && code.eq_ignore_ascii_case("code") {
                continue;
            }
            rows.push(SearchTerm::new(code, label));
        }
        Ok(Self { rows })
    }

    /// Replaces every row.
    pub fn replace(&mut self, rows: Vec<SearchTerm>) {
        self.rows = rows;
    }

    pub fn rows(&self) -> &[SearchTerm] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Inclusive slice between two codes, by position in registry order.
    ///
    /// An unknown `from` starts at the first row and an unknown `to` ends at
    /// the last row. A reversed pair is swapped.
    pub fn range(&self, from_code: &str, to_code: &str) -> Result<Vec<SearchTerm>> {
        if self.rows.is_empty() {
            return Err(SweepError::Registry("registry is empty".into()));
        }
        let from = self
            .rows
            .iter()
            .position(|r| r.code == from_code.trim())
            .unwrap_or(0);
        let to = self
            .rows
            .iter()
            .position(|r| r.code == to_code.trim())
            .unwrap_or(self.rows.len() - 1);
        let (start, end) = if from <= to { (from, to) } else { (to, from) };
        Ok(self.rows[start..=end].to_vec())
    }
}
