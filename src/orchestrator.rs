//! Two-phase sweep: collect candidates for every term, then fetch, score and
//! persist them one by one.
//!
//! Phases run strictly in sequence. Tabulation fetches up to `fan_out`
//! candidates at once but writes records in collection order. A stop request
//! is observed once per term and once per candidate; records already written
//! stay on disk.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::analysis::{enrich_description, evaluate_exclusion, word_summary, ExclusionCause};
use crate::backend::{CandidateReference, SearchBackend, SearchMode, SearchRequest};
use crate::backends::cordis_api::CORDIS_SCHEME;
use crate::captcha::CaptchaHandler;
use crate::classify::MediaKind;
use crate::config::SweepConfig;
use crate::content::{ContentFetcher, ExtractedDocument};
use crate::registry::{Registry, SearchTerm};
use crate::sink::{OmittedResult, ResultSink, ScoredResult, SinkSummary};
use crate::Result;

pub const DUPLICATE_REASON: &str = "Duplicate URL";
pub const EXTRACTION_TIMEOUT_REASON: &str = "Content extraction timed out";
pub const EXTRACTION_FAILED_REASON: &str = "Content extraction failed";

/// One worker's slice of a sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepRequest {
    pub from_code: String,
    pub to_code: String,
    pub min_words: usize,
    pub search_mode: SearchMode,
    pub site_domain: Option<String>,
    pub worker_id: usize,
}

impl SweepRequest {
    pub fn new(from_code: impl Into<String>, to_code: impl Into<String>) -> Self {
        Self {
            from_code: from_code.into(),
            to_code: to_code.into(),
            min_words: 30,
            search_mode: SearchMode::default(),
            site_domain: None,
            worker_id: 1,
        }
    }

    pub fn with_min_words(mut self, min_words: usize) -> Self {
        self.min_words = min_words;
        self
    }

    pub fn with_mode(mut self, mode: SearchMode) -> Self {
        self.search_mode = mode;
        self
    }

    pub fn with_site(mut self, domain: impl Into<String>) -> Self {
        self.site_domain = Some(domain.into());
        self
    }

    pub fn with_worker(mut self, worker_id: usize) -> Self {
        self.worker_id = worker_id;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Idle,
    Collecting,
    Tabulating,
    Done,
    Stopped,
    Failed,
}

impl Phase {
    pub fn is_finished(&self) -> bool {
        matches!(self, Phase::Done | Phase::Stopped | Phase::Failed)
    }
}

/// Running counters. `kept + omitted == processed` at every event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepStats {
    pub terms_total: usize,
    pub terms_searched: usize,
    pub total_urls_found: usize,
    pub processed: usize,
    pub kept: usize,
    pub omitted: usize,
    pub skipped_low_words: usize,
    pub skipped_zero_keywords: usize,
    pub skipped_duplicates: usize,
    pub failed_content_extraction: usize,
    pub total_errors: usize,
    pub captchas_detected: u64,
    pub captchas_solved: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub worker_id: usize,
    pub phase: Phase,
    /// Within the current phase, 0 to 100.
    pub percent: f64,
    pub message: String,
    pub stats: SweepStats,
}

#[derive(Debug, Clone)]
pub struct SweepOutcome {
    pub phase: Phase,
    pub stats: SweepStats,
    pub output: SinkSummary,
}

/// Tunables taken from [`SweepConfig`].
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub fan_out: usize,
    pub search_timeout: Duration,
    /// Outer bound on one candidate fetch, CAPTCHA resolution included.
    pub extraction_timeout: Duration,
    pub track_keywords: bool,
    pub max_pages: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&SweepConfig::default())
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &SweepConfig) -> Self {
        Self {
            fan_out: config.extraction.fan_out.max(1),
            search_timeout: config.search_timeout(),
            extraction_timeout: config.candidate_timeout(),
            track_keywords: config.extraction.track_keywords,
            max_pages: config.search.max_pages,
        }
    }
}

/// What tabulation decided for one candidate.
enum Decision {
    Kept(ScoredResult),
    Omitted(OmittedResult, Omission),
    /// Stop was requested before the fetch began. In-flight fetches still
    /// finish and are written.
    Skipped,
}

#[derive(Debug, Clone, Copy)]
enum Omission {
    LowWords,
    ZeroKeywords,
    ExtractionFailed,
    Duplicate,
}

enum Work {
    Duplicate(CandidateReference),
    Fetch(CandidateReference),
}

/// Drives one worker's sweep.
pub struct Orchestrator {
    backend: Arc<dyn SearchBackend>,
    fetcher: Arc<dyn ContentFetcher>,
    sink: Arc<dyn ResultSink>,
    captcha: Option<Arc<CaptchaHandler>>,
    settings: OrchestratorSettings,
    stop: AtomicBool,
    stats: Mutex<SweepStats>,
    phase: Mutex<Phase>,
}

impl Orchestrator {
    pub fn new(
        backend: Arc<dyn SearchBackend>,
        fetcher: Arc<dyn ContentFetcher>,
        sink: Arc<dyn ResultSink>,
    ) -> Self {
        Self {
            backend,
            fetcher,
            sink,
            captcha: None,
            settings: OrchestratorSettings::default(),
            stop: AtomicBool::new(false),
            stats: Mutex::new(SweepStats::default()),
            phase: Mutex::new(Phase::Idle),
        }
    }

    pub fn with_settings(mut self, settings: OrchestratorSettings) -> Self {
        self.settings = settings;
        self
    }

    /// CAPTCHA counters are read from this handler.
    pub fn with_captcha(mut self, handler: Arc<CaptchaHandler>) -> Self {
        self.captcha = Some(handler);
        self
    }

    /// Cooperative; observed between terms and between candidates.
    pub fn request_stop(&self) {
        if !self.stop.swap(true, Ordering::SeqCst) {
            info!("Stop requested");
        }
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> SweepStats {
        let mut stats = self.stats.lock().unwrap_or_else(|p| p.into_inner()).clone();
        if let Some(handler) = &self.captcha {
            stats.captchas_detected = handler.detected();
            stats.captchas_solved = handler.solved();
        }
        stats
    }

    pub fn phase(&self) -> Phase {
        *self.phase.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_phase(&self, phase: Phase) {
        *self.phase.lock().unwrap_or_else(|p| p.into_inner()) = phase;
    }

    fn update(&self, f: impl FnOnce(&mut SweepStats)) {
        f(&mut self.stats.lock().unwrap_or_else(|p| p.into_inner()));
    }

    fn emit(&self, progress: &UnboundedSender<ProgressEvent>, worker_id: usize, percent: f64, message: String) {
        let event = ProgressEvent {
            worker_id,
            phase: self.phase(),
            percent: percent.clamp(0.0, 100.0),
            message,
            stats: self.stats(),
        };
        // A dropped receiver only means nobody is watching.
        let _ = progress.send(event);
    }

    /// Runs both phases over the inclusive code range.
    ///
    /// Only a registry error aborts the run; per-term and per-candidate
    /// failures are counted and skipped.
    pub async fn run_sweep(
        &self,
        registry: &Registry,
        request: &SweepRequest,
        progress: &UnboundedSender<ProgressEvent>,
    ) -> Result<SweepOutcome> {
        let worker = request.worker_id;
        let terms = match registry.range(&request.from_code, &request.to_code) {
            Ok(terms) => terms,
            Err(e) => {
                error!(worker, "Sweep aborted: {}", e);
                self.set_phase(Phase::Failed);
                self.emit(progress, worker, 0.0, format!("Failed: {}", e));
                return Err(e);
            }
        };
        self.update(|s| s.terms_total = terms.len());
        info!(
            worker,
            backend = self.backend.name(),
            from = %request.from_code,
            to = %request.to_code,
            terms = terms.len(),
            "Sweep started"
        );

        self.set_phase(Phase::Collecting);
        self.emit(progress, worker, 0.0, format!("Searching {} terms", terms.len()));
        let candidates = self.collect(&terms, request, progress).await;

        if !self.stop_requested() {
            self.set_phase(Phase::Tabulating);
            info!(worker, candidates = candidates.len(), "Collection finished");
            self.emit(progress, worker, 0.0, format!("Processing {} results", candidates.len()));
            if let Err(e) = self.tabulate(candidates, request, progress).await {
                error!(worker, "Sweep aborted while writing results: {}", e);
                self.set_phase(Phase::Failed);
                let _ = self.sink.finish();
                self.emit(progress, worker, 0.0, format!("Failed: {}", e));
                return Err(e);
            }
        }

        let output = self.sink.finish()?;
        let phase = if self.stop_requested() { Phase::Stopped } else { Phase::Done };
        self.set_phase(phase);
        let stats = self.stats();
        info!(
            worker,
            kept = stats.kept,
            omitted = stats.omitted,
            errors = stats.total_errors,
            phase = ?phase,
            "Sweep finished"
        );
        self.emit(
            progress,
            worker,
            100.0,
            format!("{} kept, {} omitted, {} errors", stats.kept, stats.omitted, stats.total_errors),
        );
        Ok(SweepOutcome { phase, stats, output })
    }

    async fn collect(
        &self,
        terms: &[SearchTerm],
        request: &SweepRequest,
        progress: &UnboundedSender<ProgressEvent>,
    ) -> Vec<CandidateReference> {
        let worker = request.worker_id;
        let mut candidates = Vec::new();

        for (index, term) in terms.iter().enumerate() {
            if self.stop_requested() {
                break;
            }
            let mut search = SearchRequest::new(term.query_text())
                .with_mode(request.search_mode)
                .with_max_pages(self.settings.max_pages);
            if let Some(domain) = &request.site_domain {
                search = search.with_site(domain.clone());
            }

            let message = match timeout(self.settings.search_timeout, self.backend.search(&search)).await {
                Ok(Ok(hits)) => {
                    let found = hits.len();
                    info!(worker, term = %term.code, hits = found, "Term searched");
                    candidates.extend(
                        hits.into_iter()
                            .map(|hit| CandidateReference::from_hit(hit, term, self.backend.kind())),
                    );
                    self.update(|s| s.total_urls_found += found);
                    format!("{}: {} results", term.code, found)
                }
                Ok(Err(e)) => {
                    warn!(worker, term = %term.code, "Search failed: {}", e);
                    self.update(|s| s.total_errors += 1);
                    format!("{}: search failed", term.code)
                }
                Err(_) => {
                    warn!(worker, term = %term.code, "Search timed out");
                    self.update(|s| s.total_errors += 1);
                    format!("{}: search timed out", term.code)
                }
            };

            self.update(|s| s.terms_searched += 1);
            let percent = (index + 1) as f64 / terms.len() as f64 * 100.0;
            self.emit(progress, worker, percent, message);
        }
        candidates
    }

    async fn tabulate(
        &self,
        candidates: Vec<CandidateReference>,
        request: &SweepRequest,
        progress: &UnboundedSender<ProgressEvent>,
    ) -> Result<()> {
        let worker = request.worker_id;
        let total = candidates.len();
        let allow_browser = self.backend.requires_browser();

        let mut seen = HashSet::new();
        let work: Vec<Work> = candidates
            .into_iter()
            .map(|c| {
                if seen.insert(c.normalized_url()) {
                    Work::Fetch(c)
                } else {
                    Work::Duplicate(c)
                }
            })
            .collect();

        let mut decisions = stream::iter(work)
            .map(|item| self.decide(item, request.min_words, allow_browser))
            .buffered(self.settings.fan_out.max(1));

        while let Some(decision) = decisions.next().await {
            let message = match decision {
                Decision::Skipped => continue,
                Decision::Kept(result) => {
                    self.sink.append_kept(&result)?;
                    self.update(|s| {
                        s.processed += 1;
                        s.kept += 1;
                    });
                    debug!(worker, url = %result.url, "Kept");
                    format!("Kept {}", result.url)
                }
                Decision::Omitted(result, omission) => {
                    self.sink.append_omitted(&result)?;
                    self.update(|s| {
                        s.processed += 1;
                        s.omitted += 1;
                        match omission {
                            Omission::LowWords => s.skipped_low_words += 1,
                            Omission::ZeroKeywords => s.skipped_zero_keywords += 1,
                            Omission::ExtractionFailed => {
                                s.failed_content_extraction += 1;
                                s.total_errors += 1;
                            }
                            Omission::Duplicate => s.skipped_duplicates += 1,
                        }
                    });
                    debug!(worker, url = %result.url, reason = %result.reason, "Omitted");
                    format!("Omitted {}: {}", result.url, result.reason)
                }
            };

            let processed = self.stats().processed;
            self.emit(progress, worker, processed as f64 / total.max(1) as f64 * 100.0, message);
        }
        if self.stop_requested() {
            info!(worker, processed = self.stats().processed, total, "Tabulation stopped");
        }
        Ok(())
    }

    async fn decide(&self, work: Work, min_words: usize, allow_browser: bool) -> Decision {
        let candidate = match work {
            Work::Duplicate(candidate) => {
                return omit(candidate, DUPLICATE_REASON.to_string(), Omission::Duplicate)
            }
            Work::Fetch(candidate) => candidate,
        };
        if self.stop_requested() {
            return Decision::Skipped;
        }

        let document = if candidate.url.starts_with(CORDIS_SCHEME) {
            ExtractedDocument::new(
                candidate.url.clone(),
                MediaKind::Page,
                format!("{} {}", candidate.title, candidate.description),
            )
        } else {
            match timeout(
                self.settings.extraction_timeout,
                self.fetcher.fetch(&candidate.url, allow_browser),
            )
            .await
            {
                Ok(Ok(document)) => document,
                Ok(Err(e)) => {
                    warn!(url = %candidate.url, "Content extraction failed: {}", e);
                    return omit(candidate, EXTRACTION_FAILED_REASON.to_string(), Omission::ExtractionFailed);
                }
                Err(_) => {
                    warn!(url = %candidate.url, "Content extraction timed out");
                    return omit(candidate, EXTRACTION_TIMEOUT_REASON.to_string(), Omission::ExtractionFailed);
                }
            }
        };

        let document = document.score(&candidate.term.query_text());
        if let Some(exclusion) = evaluate_exclusion(
            document.word_count,
            &document.keyword_counts,
            min_words,
            self.settings.track_keywords,
        ) {
            let omission = match exclusion.cause {
                ExclusionCause::LowWordCount => Omission::LowWords,
                ExclusionCause::NoKeywordMatches => Omission::ZeroKeywords,
            };
            return omit(candidate, exclusion.reason, omission);
        }

        Decision::Kept(ScoredResult {
            description: enrich_description(&candidate.description, &document.raw_text),
            word_summary: word_summary(document.word_count, &document.keyword_counts),
            term: candidate.term,
            title: candidate.title,
            url: candidate.url,
        })
    }
}

fn omit(candidate: CandidateReference, reason: String, omission: Omission) -> Decision {
    Decision::Omitted(
        OmittedResult {
            term: candidate.term,
            title: candidate.title,
            url: candidate.url,
            description: candidate.description,
            reason,
        },
        omission,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendKind, SearchHit};
    use crate::backends::StaticBackend;
    use crate::content::StaticContentFetcher;
    use crate::sink::MemorySink;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    fn words(n: usize, filler: &str) -> String {
        vec![filler; n].join(" ")
    }

    fn registry() -> Registry {
        Registry::from_rows(vec![
            SearchTerm::new("01.0", "01.0 - Cotton"),
            SearchTerm::new("02.0", "Wool"),
            SearchTerm::new("03.0", "Silk"),
        ])
    }

    fn drain(rx: &mut UnboundedReceiver<ProgressEvent>) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn build(
        backend: StaticBackend,
        fetcher: StaticContentFetcher,
    ) -> (Orchestrator, Arc<MemorySink>, Arc<StaticContentFetcher>) {
        let sink = Arc::new(MemorySink::new());
        let fetcher = Arc::new(fetcher);
        let orchestrator = Orchestrator::new(Arc::new(backend), fetcher.clone(), sink.clone());
        (orchestrator, sink, fetcher)
    }

    #[tokio::test]
    async fn test_keeps_and_omits_by_word_count() {
        let backend = StaticBackend::new(BackendKind::DuckDuckGo).with_hits(
            "Cotton",
            vec![
                SearchHit::new("https://a.org/short", "Short", "short page"),
                SearchHit::new("https://a.org/long", "Long", "long page"),
            ],
        );
        let fetcher = StaticContentFetcher::new()
            .with_page("https://a.org/short", words(10, "cotton"))
            .with_page("https://a.org/long", words(50, "cotton"));
        let (orchestrator, sink, _) = build(backend, fetcher);
        let (tx, mut rx) = unbounded_channel();

        let outcome = orchestrator
            .run_sweep(&registry(), &SweepRequest::new("01.0", "01.0"), &tx)
            .await
            .unwrap();

        assert_eq!(outcome.phase, Phase::Done);
        assert_eq!(outcome.stats.kept, 1);
        assert_eq!(outcome.stats.omitted, 1);
        assert_eq!(outcome.stats.skipped_low_words, 1);
        assert_eq!(sink.kept()[0].url, "https://a.org/long");
        assert_eq!(sink.kept()[0].word_summary, "Total words: 50 | Cotton: 50");
        assert_eq!(sink.omitted()[0].reason, "Low word count: 10 (minimum 30)");

        let events = drain(&mut rx);
        assert!(events.iter().all(|e| e.stats.kept + e.stats.omitted == e.stats.processed));
        let last = events.last().unwrap();
        assert_eq!(last.phase, Phase::Done);
        assert_eq!(last.percent, 100.0);
    }

    #[tokio::test]
    async fn test_duplicates_are_fetched_once() {
        let hits = vec![
            SearchHit::new("https://a.org/page/", "One", ""),
            SearchHit::new("http://A.org/page#top", "Again", ""),
        ];
        let backend = StaticBackend::new(BackendKind::DuckDuckGo)
            .with_hits("Cotton", hits.clone())
            .with_hits("Wool", hits);
        let fetcher = StaticContentFetcher::new().with_page("https://a.org/page/", words(40, "cotton"));
        let (orchestrator, sink, fetcher) = build(backend, fetcher);
        let (tx, _rx) = unbounded_channel();

        let outcome = orchestrator
            .run_sweep(&registry(), &SweepRequest::new("01.0", "02.0"), &tx)
            .await
            .unwrap();

        assert_eq!(fetcher.calls().len(), 1);
        assert_eq!(outcome.stats.processed, 4);
        assert_eq!(outcome.stats.kept, 1);
        assert_eq!(outcome.stats.skipped_duplicates, 3);
        assert_eq!(outcome.stats.omitted, 3);
        assert_eq!(sink.kept().len(), 1);
        let omitted = sink.omitted();
        assert_eq!(omitted.len(), 3);
        assert!(omitted.iter().all(|r| r.reason == DUPLICATE_REASON));
        assert_eq!(outcome.output.omitted, outcome.stats.omitted);
        assert_eq!(omitted[0].url, "http://A.org/page#top");
        assert_eq!(omitted[0].term.label, "01.0 - Cotton");
    }

    #[tokio::test]
    async fn test_case_distinct_paths_are_not_duplicates() {
        let backend = StaticBackend::new(BackendKind::DuckDuckGo).with_hits(
            "Cotton",
            vec![
                SearchHit::new("https://a.org/doc?id=AbC", "Upper", ""),
                SearchHit::new("https://A.ORG/doc?id=abc", "Lower", ""),
            ],
        );
        let fetcher = StaticContentFetcher::new()
            .with_page("https://a.org/doc?id=AbC", words(40, "cotton"))
            .with_page("https://A.ORG/doc?id=abc", words(40, "cotton"));
        let (orchestrator, sink, fetcher) = build(backend, fetcher);
        let (tx, _rx) = unbounded_channel();

        let outcome = orchestrator
            .run_sweep(&registry(), &SweepRequest::new("01.0", "01.0"), &tx)
            .await
            .unwrap();

        assert_eq!(fetcher.calls().len(), 2);
        assert_eq!(outcome.stats.kept, 2);
        assert_eq!(outcome.stats.skipped_duplicates, 0);
        assert_eq!(sink.kept().len(), 2);
    }

    #[tokio::test]
    async fn test_search_failure_is_counted_and_skipped() {
        let backend = StaticBackend::new(BackendKind::DuckDuckGo)
            .with_failure("Cotton")
            .with_hits("Wool", vec![SearchHit::new("https://b.org/wool", "Wool", "")]);
        let fetcher = StaticContentFetcher::new().with_page("https://b.org/wool", words(40, "wool"));
        let (orchestrator, sink, _) = build(backend, fetcher);
        let (tx, _rx) = unbounded_channel();

        let outcome = orchestrator
            .run_sweep(&registry(), &SweepRequest::new("01.0", "02.0"), &tx)
            .await
            .unwrap();

        assert_eq!(outcome.stats.terms_searched, 2);
        assert_eq!(outcome.stats.total_errors, 1);
        assert_eq!(sink.kept().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_search_timeout_moves_to_next_term() {
        let backend = StaticBackend::new(BackendKind::DuckDuckGo)
            .with_latency("Cotton", Duration::from_secs(3600))
            .with_hits("Wool", vec![SearchHit::new("https://b.org/wool", "Wool", "")]);
        let fetcher = StaticContentFetcher::new().with_page("https://b.org/wool", words(40, "wool"));
        let (orchestrator, sink, _) = build(backend, fetcher);
        let orchestrator = orchestrator.with_settings(OrchestratorSettings {
            search_timeout: Duration::from_secs(5),
            ..OrchestratorSettings::default()
        });
        let (tx, _rx) = unbounded_channel();

        let outcome = orchestrator
            .run_sweep(&registry(), &SweepRequest::new("01.0", "02.0"), &tx)
            .await
            .unwrap();

        assert_eq!(outcome.stats.total_errors, 1);
        assert_eq!(sink.kept().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_extraction_failures_become_omissions() {
        let backend = StaticBackend::new(BackendKind::DuckDuckGo).with_hits(
            "Cotton",
            vec![
                SearchHit::new("https://a.org/broken", "Broken", ""),
                SearchHit::new("https://a.org/slow", "Slow", ""),
            ],
        );
        let fetcher = StaticContentFetcher::new()
            .with_failure("https://a.org/broken")
            .with_page("https://a.org/slow", words(40, "cotton"))
            .with_latency("https://a.org/slow", Duration::from_secs(120));
        let (orchestrator, sink, _) = build(backend, fetcher);
        let (tx, _rx) = unbounded_channel();

        let outcome = orchestrator
            .run_sweep(&registry(), &SweepRequest::new("01.0", "01.0"), &tx)
            .await
            .unwrap();

        let reasons: Vec<String> = sink.omitted().into_iter().map(|o| o.reason).collect();
        assert_eq!(reasons, vec![EXTRACTION_FAILED_REASON, EXTRACTION_TIMEOUT_REASON]);
        assert_eq!(outcome.stats.failed_content_extraction, 2);
        assert_eq!(outcome.stats.total_errors, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_output_keeps_collection_order_under_fan_out() {
        let hits = (0..6)
            .map(|i| SearchHit::new(format!("https://a.org/{}", i), format!("T{}", i), ""))
            .collect();
        let backend = StaticBackend::new(BackendKind::DuckDuckGo).with_hits("Cotton", hits);
        let mut fetcher = StaticContentFetcher::new();
        for i in 0..6 {
            let url = format!("https://a.org/{}", i);
            fetcher = fetcher
                .with_page(url.clone(), words(40, "cotton"))
                .with_latency(url, Duration::from_millis(600 - i * 100));
        }
        let (orchestrator, sink, _) = build(backend, fetcher);
        let orchestrator = orchestrator.with_settings(OrchestratorSettings {
            fan_out: 3,
            ..OrchestratorSettings::default()
        });
        let (tx, _rx) = unbounded_channel();

        orchestrator
            .run_sweep(&registry(), &SweepRequest::new("01.0", "01.0"), &tx)
            .await
            .unwrap();

        let urls: Vec<String> = sink.kept().into_iter().map(|k| k.url).collect();
        let expected: Vec<String> = (0..6).map(|i| format!("https://a.org/{}", i)).collect();
        assert_eq!(urls, expected);
    }

    #[tokio::test]
    async fn test_api_mode_never_allows_browser() {
        let backend = StaticBackend::new(BackendKind::CordisApi).with_hits(
            "Cotton",
            vec![
                SearchHit::new("https://cordis.europa.eu/project/id/1", "Cotton", ""),
                SearchHit::new("cordis://Cotton fibres", "Cotton fibres", "Project: Cotton fibres. cotton"),
            ],
        );
        let fetcher =
            StaticContentFetcher::new().with_page("https://cordis.europa.eu/project/id/1", words(40, "cotton"));
        let (orchestrator, sink, fetcher) = build(backend, fetcher);
        let (tx, _rx) = unbounded_channel();

        orchestrator
            .run_sweep(&registry(), &SweepRequest::new("01.0", "01.0").with_min_words(3), &tx)
            .await
            .unwrap();

        let calls = fetcher.calls();
        assert_eq!(calls, vec![("https://cordis.europa.eu/project/id/1".to_string(), false)]);
        assert_eq!(sink.kept().len(), 2);
    }

    #[tokio::test]
    async fn test_zero_keyword_rule() {
        let registry = Registry::from_rows(vec![SearchTerm::new("03.0", "Raw silk cocoons reeling")]);
        let backend = StaticBackend::new(BackendKind::DuckDuckGo).with_hits(
            "Raw silk cocoons reeling",
            vec![SearchHit::new("https://c.org/1", "T", "")],
        );
        let fetcher = StaticContentFetcher::new().with_page("https://c.org/1", words(40, "unrelated"));
        let (orchestrator, sink, _) = build(backend, fetcher);
        let (tx, _rx) = unbounded_channel();

        let outcome = orchestrator
            .run_sweep(&registry, &SweepRequest::new("03.0", "03.0"), &tx)
            .await
            .unwrap();

        assert_eq!(outcome.stats.skipped_zero_keywords, 1);
        assert_eq!(sink.omitted()[0].reason, "No keyword matches in content");
    }

    #[tokio::test]
    async fn test_stop_before_run_ends_stopped() {
        let backend = StaticBackend::new(BackendKind::DuckDuckGo)
            .with_hits("Cotton", vec![SearchHit::new("https://a.org/1", "T", "")]);
        let (orchestrator, sink, fetcher) = build(backend, StaticContentFetcher::new());
        orchestrator.request_stop();
        let (tx, _rx) = unbounded_channel();

        let outcome = orchestrator
            .run_sweep(&registry(), &SweepRequest::new("01.0", "03.0"), &tx)
            .await
            .unwrap();

        assert_eq!(outcome.phase, Phase::Stopped);
        assert_eq!(outcome.stats.terms_searched, 0);
        assert!(fetcher.calls().is_empty());
        assert!(sink.kept().is_empty());
    }

    #[tokio::test]
    async fn test_empty_registry_fails() {
        let backend = StaticBackend::new(BackendKind::DuckDuckGo);
        let (orchestrator, _, _) = build(backend, StaticContentFetcher::new());
        let (tx, _rx) = unbounded_channel();

        let result = orchestrator
            .run_sweep(&Registry::default(), &SweepRequest::new("01.0", "02.0"), &tx)
            .await;
        assert!(result.is_err());
        assert_eq!(orchestrator.phase(), Phase::Failed);
    }

    #[tokio::test]
    async fn test_label_prefix_is_stripped_from_query() {
        let backend = Arc::new(StaticBackend::new(BackendKind::DuckDuckGo));
        let orchestrator = Orchestrator::new(
            backend.clone(),
            Arc::new(StaticContentFetcher::new()),
            Arc::new(MemorySink::new()),
        );
        let (tx, _rx) = unbounded_channel();
        orchestrator
            .run_sweep(
                &registry(),
                &SweepRequest::new("01.0", "01.0").with_mode(SearchMode::Exact).with_site("a.org"),
                &tx,
            )
            .await
            .unwrap();

        let requests = backend.requests();
        assert_eq!(requests[0].query, "Cotton");
        assert_eq!(requests[0].mode, SearchMode::Exact);
        assert_eq!(requests[0].site_domain.as_deref(), Some("a.org"));
    }
}
