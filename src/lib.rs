//! # a3s-sweep
//!
//! A two-phase search-and-extract sweeper. For every subject code in a
//! range it asks a search backend for candidate documents, then fetches,
//! de-duplicates, extracts and scores each candidate, writing kept and
//! omitted rows to CSV as it goes.
//!
//! The pipeline is built to run for hours against sites that push back:
//!
//! - Browser session pool with per-checkout fingerprints (`headless` feature)
//! - CAPTCHA detection with automatic or operator-in-the-loop resolution
//! - Per-domain adaptive delay, proxy rotation and a download cache
//! - Text extraction from HTML, PDF, Office documents and plain text
//! - Cooperative stop and per-record flushing
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use a3s_sweep::{
//!     BackendKind, CsvSink, Orchestrator, Registry, SinkName, SweepConfig, SweepContext,
//!     SweepRequest, WorkerProvider,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let context = SweepContext::new(SweepConfig::default()).await?;
//!     let registry = Registry::load_csv("codes.csv")?;
//!     let stack = context.provide(BackendKind::CordisApi, true).await?;
//!     let sink = CsvSink::create(
//!         "results",
//!         &SinkName { from_code: "01.0", to_code: "01.9", backend: BackendKind::CordisApi, worker_id: 1 },
//!     )?;
//!
//!     let orchestrator = Orchestrator::new(stack.backend, stack.fetcher, Arc::new(sink));
//!     let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
//!     let outcome = orchestrator
//!         .run_sweep(&registry, &SweepRequest::new("01.0", "01.9"), &tx)
//!         .await?;
//!     println!("{} kept, {} omitted", outcome.stats.kept, outcome.stats.omitted);
//!     Ok(())
//! }
//! ```

mod error;

pub mod analysis;
pub mod backend;
pub mod backends;
pub mod cache;
pub mod captcha;
pub mod classify;
pub mod config;
pub mod content;
pub mod context;
pub mod delay;
pub mod extract;
pub mod fetcher;
pub mod fetcher_http;
pub mod fingerprint;
pub mod human;
pub mod jobs;
pub mod orchestrator;
pub mod proxy;
pub mod registry;
pub mod sink;

#[cfg(feature = "headless")]
pub mod browser;
#[cfg(feature = "headless")]
pub mod browser_setup;

pub use backend::{BackendKind, CandidateReference, SearchBackend, SearchHit, SearchMode, SearchRequest};
pub use captcha::{CaptchaChallenge, CaptchaHandler, CaptchaSolution, ManualCaptchaChannel};
pub use config::SweepConfig;
pub use content::{ContentFetcher, ExtractedDocument};
pub use context::{SweepContext, WorkerProvider, WorkerStack};
pub use error::{ErrorKind, Result, SweepError};
pub use fetcher::{PageRenderer, RenderedPage, WaitStrategy};
pub use jobs::{JobAck, JobManager, JobRequest, WorkerState, WorkerStatus};
pub use orchestrator::{Orchestrator, Phase, ProgressEvent, SweepOutcome, SweepRequest, SweepStats};
pub use registry::{Registry, SearchTerm};
pub use sink::{CsvSink, MemorySink, OmittedResult, ResultSink, ScoredResult, SinkName};
