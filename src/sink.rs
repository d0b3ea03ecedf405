//! Append-only destinations for kept and omitted results.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::backend::BackendKind;
use crate::registry::SearchTerm;
use crate::Result;

pub const KEPT_HEADER: [&str; 6] = ["code", "label", "title", "description", "url", "wordSummary"];
pub const OMITTED_HEADER: [&str; 6] = ["code", "label", "title", "url", "description", "reason"];

/// A candidate that passed the exclusion rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoredResult {
    pub term: SearchTerm,
    pub title: String,
    pub description: String,
    pub url: String,
    pub word_summary: String,
}

/// A candidate that did not, with the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OmittedResult {
    pub term: SearchTerm,
    pub title: String,
    pub url: String,
    pub description: String,
    pub reason: String,
}

/// What a sink left behind once finished.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SinkSummary {
    pub kept: usize,
    pub omitted: usize,
    /// `None` when the file was removed for having no rows.
    pub kept_path: Option<PathBuf>,
    pub omitted_path: Option<PathBuf>,
}

/// Receives records as soon as they are produced. Every append is durable
/// before it returns.
pub trait ResultSink: Send + Sync {
    fn append_kept(&self, result: &ScoredResult) -> Result<()>;
    fn append_omitted(&self, result: &OmittedResult) -> Result<()>;
    /// Closes the outputs. Header-only files are deleted.
    fn finish(&self) -> Result<SinkSummary>;
}

/// Identifies one worker's output files.
#[derive(Debug, Clone)]
pub struct SinkName<'a> {
    pub from_code: &'a str,
    pub to_code: &'a str,
    pub backend: BackendKind,
    pub worker_id: usize,
}

impl SinkName<'_> {
    fn stem(&self, timestamp: &str) -> String {
        format!(
            "{}_to_{}_{}_worker_{}_{}",
            file_safe(self.from_code),
            file_safe(self.to_code),
            self.backend.slug(),
            self.worker_id,
            timestamp
        )
    }
}

fn file_safe(code: &str) -> String {
    code.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect()
}

struct CsvFile {
    path: PathBuf,
    writer: Mutex<Option<csv::Writer<File>>>,
    rows: AtomicUsize,
}

impl CsvFile {
    fn create(path: PathBuf, header: &[&str]) -> Result<Self> {
        let mut writer = csv::Writer::from_path(&path)?;
        writer.write_record(header)?;
        writer.flush()?;
        Ok(Self {
            path,
            writer: Mutex::new(Some(writer)),
            rows: AtomicUsize::new(0),
        })
    }

    fn append(&self, record: &[&str]) -> Result<()> {
        let mut guard = self.writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(writer) = guard.as_mut() {
            writer.write_record(record)?;
            writer.flush()?;
            self.rows.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Returns the path if the file holds rows, deleting it otherwise.
    fn close(&self) -> Result<Option<PathBuf>> {
        let writer = self
            .writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(mut writer) = writer {
            writer.flush()?;
        }
        if self.rows.load(Ordering::SeqCst) > 0 {
            return Ok(Some(self.path.clone()));
        }
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
            debug!(path = %self.path.display(), "Removed header-only output file");
        }
        Ok(None)
    }
}

/// Two CSV files per worker run, flushed after every record.
pub struct CsvSink {
    kept: CsvFile,
    omitted: CsvFile,
}

impl CsvSink {
    /// Creates `results_<stem>.csv` and `omitted_<stem>.csv` in `dir`.
    pub fn create(dir: impl AsRef<Path>, name: &SinkName<'_>) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let stem = name.stem(&chrono::Local::now().format("%Y%m%d_%H%M%S").to_string());
        let sink = Self {
            kept: CsvFile::create(dir.join(format!("results_{}.csv", stem)), &KEPT_HEADER)?,
            omitted: CsvFile::create(dir.join(format!("omitted_{}.csv", stem)), &OMITTED_HEADER)?,
        };
        info!(path = %sink.kept.path.display(), "Writing results");
        Ok(sink)
    }

    pub fn kept_path(&self) -> &Path {
        &self.kept.path
    }

    pub fn omitted_path(&self) -> &Path {
        &self.omitted.path
    }
}

impl ResultSink for CsvSink {
    fn append_kept(&self, r: &ScoredResult) -> Result<()> {
        self.kept.append(&[
            &r.term.code,
            &r.term.label,
            &r.title,
            &r.description,
            &r.url,
            &r.word_summary,
        ])
    }

    fn append_omitted(&self, r: &OmittedResult) -> Result<()> {
        self.omitted.append(&[
            &r.term.code,
            &r.term.label,
            &r.title,
            &r.url,
            &r.description,
            &r.reason,
        ])
    }

    fn finish(&self) -> Result<SinkSummary> {
        Ok(SinkSummary {
            kept: self.kept.rows.load(Ordering::SeqCst),
            omitted: self.omitted.rows.load(Ordering::SeqCst),
            kept_path: self.kept.close()?,
            omitted_path: self.omitted.close()?,
        })
    }
}

/// Collects records in memory.
#[derive(Default)]
pub struct MemorySink {
    kept: Mutex<Vec<ScoredResult>>,
    omitted: Mutex<Vec<OmittedResult>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kept(&self) -> Vec<ScoredResult> {
        self.kept.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn omitted(&self) -> Vec<OmittedResult> {
        self.omitted.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

impl ResultSink for MemorySink {
    fn append_kept(&self, result: &ScoredResult) -> Result<()> {
        self.kept.lock().unwrap_or_else(|p| p.into_inner()).push(result.clone());
        Ok(())
    }

    fn append_omitted(&self, result: &OmittedResult) -> Result<()> {
        self.omitted.lock().unwrap_or_else(|p| p.into_inner()).push(result.clone());
        Ok(())
    }

    fn finish(&self) -> Result<SinkSummary> {
        Ok(SinkSummary {
            kept: self.kept().len(),
            omitted: self.omitted().len(),
            kept_path: None,
            omitted_path: None,
        })
    }
}
