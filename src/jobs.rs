//! Job control: splits a code range across worker slots, runs one
//! orchestrator per slot and exposes their status.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::unbounded_channel;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::backend::{BackendKind, SearchMode};
use crate::captcha::{CaptchaChallenge, CaptchaHandler, CaptchaSolution, ManualCaptchaChannel};
use crate::context::{SweepContext, WorkerProvider};
use crate::orchestrator::{Orchestrator, OrchestratorSettings, Phase, ProgressEvent, SweepRequest};
use crate::registry::{Registry, SearchTerm};
use crate::sink::{CsvSink, SinkName};
use crate::{Result, SweepError};

/// What the operator asks for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    pub from_code: String,
    pub to_code: String,
    pub min_words: usize,
    pub backend: BackendKind,
    pub search_mode: SearchMode,
    pub headless: bool,
    pub workers: usize,
}

impl JobRequest {
    pub fn new(from_code: impl Into<String>, to_code: impl Into<String>, backend: BackendKind) -> Self {
        Self {
            from_code: from_code.into(),
            to_code: to_code.into(),
            min_words: 30,
            backend,
            search_mode: SearchMode::Broad,
            headless: true,
            workers: 1,
        }
    }
}

/// Returned as soon as the workers are spawned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobAck {
    pub job_id: Uuid,
    pub workers: usize,
    pub terms: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Idle,
    Initializing,
    Working,
    Completed,
    Error,
}

/// One slot's view for the control surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub worker_id: usize,
    pub state: WorkerState,
    pub phase: Phase,
    pub from_code: String,
    pub to_code: String,
    pub current_task: String,
    pub progress_percent: f64,
    pub processed: usize,
    pub kept: usize,
    pub omitted: usize,
    pub errors: usize,
}

impl WorkerStatus {
    fn new(worker_id: usize, from_code: &str, to_code: &str) -> Self {
        Self {
            worker_id,
            state: WorkerState::Idle,
            phase: Phase::Idle,
            from_code: from_code.to_string(),
            to_code: to_code.to_string(),
            current_task: String::new(),
            progress_percent: 0.0,
            processed: 0,
            kept: 0,
            omitted: 0,
            errors: 0,
        }
    }
}

/// Splits `terms` into at most `workers` contiguous, disjoint, non-empty
/// chunks, returned as inclusive `(from_code, to_code)` pairs.
pub fn split_range(terms: &[SearchTerm], workers: usize) -> Vec<(String, String)> {
    if terms.is_empty() {
        return Vec::new();
    }
    let workers = workers.clamp(1, terms.len());
    let size = terms.len().div_ceil(workers);
    terms
        .chunks(size)
        .filter_map(|chunk| Some((chunk.first()?.code.clone(), chunk.last()?.code.clone())))
        .collect()
}

type StatusTable = Arc<Mutex<BTreeMap<usize, WorkerStatus>>>;

struct RunningJob {
    id: Uuid,
    stop: Arc<AtomicBool>,
    orchestrators: Arc<Mutex<Vec<Arc<Orchestrator>>>>,
    handles: Vec<JoinHandle<()>>,
    live: Arc<LiveWorkers>,
}

impl RunningJob {
    fn is_running(&self) -> bool {
        self.live.count() > 0
    }
}

/// Count of worker tasks that have not returned yet.
#[derive(Default)]
struct LiveWorkers {
    count: AtomicUsize,
    finished: Notify,
}

impl LiveWorkers {
    fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    async fn wait_idle(&self) {
        loop {
            let finished = self.finished.notified();
            if self.count() == 0 {
                return;
            }
            finished.await;
        }
    }
}

/// Held by a worker task; releases its place in [`LiveWorkers`] on return
/// or panic.
struct LiveGuard(Arc<LiveWorkers>);

impl LiveGuard {
    fn enter(live: &Arc<LiveWorkers>) -> Self {
        live.count.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(live))
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.count.fetch_sub(1, Ordering::SeqCst);
        self.0.finished.notify_waiters();
    }
}

/// Everything a worker task needs, cloned out of the manager.
#[derive(Clone)]
struct WorkerEnv {
    provider: Arc<dyn WorkerProvider>,
    captcha: Option<Arc<CaptchaHandler>>,
    settings: OrchestratorSettings,
    output_dir: PathBuf,
    site_domain: Option<String>,
    statuses: StatusTable,
}

pub struct JobManager {
    provider: Arc<dyn WorkerProvider>,
    channel: Arc<ManualCaptchaChannel>,
    captcha: Option<Arc<CaptchaHandler>>,
    settings: OrchestratorSettings,
    output_dir: PathBuf,
    site_domain: Option<String>,
    registry: RwLock<Registry>,
    statuses: StatusTable,
    job: tokio::sync::Mutex<Option<RunningJob>>,
}

impl JobManager {
    pub fn new(context: Arc<SweepContext>, registry: Registry) -> Self {
        let config = context.config();
        let settings = OrchestratorSettings::from_config(config);
        let output_dir = config.output.dir.clone();
        let site_domain = config.search.site_domain.clone();
        let channel = Arc::clone(context.captcha_channel());
        let captcha = Some(Arc::clone(context.captcha()));
        Self {
            channel,
            captcha,
            settings,
            output_dir,
            site_domain,
            registry: RwLock::new(registry),
            statuses: Arc::new(Mutex::new(BTreeMap::new())),
            job: tokio::sync::Mutex::new(None),
            provider: context,
        }
    }

    /// A manager over any worker provider, writing into `output_dir`.
    pub fn with_provider(
        provider: Arc<dyn WorkerProvider>,
        channel: Arc<ManualCaptchaChannel>,
        registry: Registry,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            provider,
            channel,
            captcha: None,
            settings: OrchestratorSettings::default(),
            output_dir: output_dir.into(),
            site_domain: None,
            registry: RwLock::new(registry),
            statuses: Arc::new(Mutex::new(BTreeMap::new())),
            job: tokio::sync::Mutex::new(None),
        }
    }

    pub fn with_settings(mut self, settings: OrchestratorSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Spawns one worker per chunk of the range and returns immediately.
    pub async fn start(&self, request: JobRequest) -> Result<JobAck> {
        let mut job = self.job.lock().await;
        if job.as_ref().is_some_and(RunningJob::is_running) {
            return Err(SweepError::JobConflict);
        }

        let registry = self.registry.read().unwrap_or_else(|p| p.into_inner()).clone();
        let terms = registry.range(&request.from_code, &request.to_code)?;
        let chunks = split_range(&terms, request.workers);
        if chunks.is_empty() {
            return Err(SweepError::Registry(format!(
                "no codes between {} and {}",
                request.from_code, request.to_code
            )));
        }

        let job_id = Uuid::new_v4();
        let stop = Arc::new(AtomicBool::new(false));
        let orchestrators = Arc::new(Mutex::new(Vec::new()));
        let live = Arc::new(LiveWorkers::default());
        let env = WorkerEnv {
            provider: Arc::clone(&self.provider),
            captcha: self.captcha.clone(),
            settings: self.settings.clone(),
            output_dir: self.output_dir.clone(),
            site_domain: self.site_domain.clone(),
            statuses: Arc::clone(&self.statuses),
        };

        {
            let mut statuses = self.statuses.lock().unwrap_or_else(|p| p.into_inner());
            statuses.clear();
            for (index, (from, to)) in chunks.iter().enumerate() {
                statuses.insert(index + 1, WorkerStatus::new(index + 1, from, to));
            }
        }

        let handles = chunks
            .iter()
            .enumerate()
            .map(|(index, (from, to))| {
                let sweep = SweepRequest {
                    from_code: from.clone(),
                    to_code: to.clone(),
                    min_words: request.min_words,
                    search_mode: request.search_mode,
                    site_domain: env.site_domain.clone(),
                    worker_id: index + 1,
                };
                let guard = LiveGuard::enter(&live);
                let worker = run_worker(
                    env.clone(),
                    registry.clone(),
                    sweep,
                    request.backend,
                    request.headless,
                    Arc::clone(&stop),
                    Arc::clone(&orchestrators),
                );
                tokio::spawn(async move {
                    let _guard = guard;
                    worker.await
                })
            })
            .collect();

        info!(
            job = %job_id,
            workers = chunks.len(),
            terms = terms.len(),
            backend = request.backend.display_name(),
            "Job started"
        );
        *job = Some(RunningJob {
            id: job_id,
            stop,
            orchestrators,
            handles,
            live,
        });
        Ok(JobAck {
            job_id,
            workers: chunks.len(),
            terms: terms.len(),
        })
    }

    /// Asks every worker of the running job to stop after its current unit.
    pub async fn stop(&self) -> Result<()> {
        let job = self.job.lock().await;
        let Some(job) = job.as_ref().filter(|j| j.is_running()) else {
            return Err(SweepError::JobNotRunning);
        };
        job.stop.store(true, Ordering::SeqCst);
        for orchestrator in job.orchestrators.lock().unwrap_or_else(|p| p.into_inner()).iter() {
            orchestrator.request_stop();
        }
        info!(job = %job.id, "Job stop requested");
        Ok(())
    }

    /// Worker statuses ordered by id.
    pub fn status(&self) -> Vec<WorkerStatus> {
        self.statuses
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub async fn is_running(&self) -> bool {
        self.job
            .lock()
            .await
            .as_ref()
            .is_some_and(RunningJob::is_running)
    }

    /// Waits for every worker of the current job to finish. The job counts
    /// as running, and can be stopped, until the last worker returns.
    pub async fn wait(&self) {
        let live = match self.job.lock().await.as_ref() {
            Some(job) => Arc::clone(&job.live),
            None => return,
        };
        live.wait_idle().await;

        let handles = match self.job.lock().await.as_mut() {
            Some(job) if Arc::ptr_eq(&job.live, &live) => std::mem::take(&mut job.handles),
            _ => return,
        };
        for result in join_all(handles).await {
            if let Err(e) = result {
                error!("Worker task panicked: {}", e);
            }
        }
    }

    /// Forwards an operator's answer to the waiting challenge.
    pub fn submit_captcha_solution(&self, solution: CaptchaSolution) -> bool {
        self.channel.submit(solution)
    }

    pub fn pending_challenges(&self) -> Vec<CaptchaChallenge> {
        self.channel.pending()
    }

    /// Replaces the registry wholesale. Refused while a job runs.
    pub async fn replace_registry(&self, rows: Vec<SearchTerm>) -> Result<()> {
        if self.is_running().await {
            return Err(SweepError::JobConflict);
        }
        self.registry.write().unwrap_or_else(|p| p.into_inner()).replace(rows);
        Ok(())
    }

    pub fn registry_rows(&self) -> Vec<SearchTerm> {
        self.registry.read().unwrap_or_else(|p| p.into_inner()).rows().to_vec()
    }
}

fn update_status(statuses: &StatusTable, worker_id: usize, f: impl FnOnce(&mut WorkerStatus)) {
    if let Some(status) = statuses.lock().unwrap_or_else(|p| p.into_inner()).get_mut(&worker_id) {
        f(status);
    }
}

async fn run_worker(
    env: WorkerEnv,
    registry: Registry,
    request: SweepRequest,
    backend: BackendKind,
    headless: bool,
    stop: Arc<AtomicBool>,
    orchestrators: Arc<Mutex<Vec<Arc<Orchestrator>>>>,
) {
    let worker = request.worker_id;
    let statuses = Arc::clone(&env.statuses);
    let fail = |message: String| {
        update_status(&statuses, worker, |s| {
            s.state = WorkerState::Error;
            s.phase = Phase::Failed;
            s.current_task = message;
        });
    };

    update_status(&statuses, worker, |s| {
        s.state = WorkerState::Initializing;
        s.current_task = format!("Starting {}", backend.display_name());
    });

    let stack = match env.provider.provide(backend, headless).await {
        Ok(stack) => stack,
        Err(e) => {
            error!(worker, "Worker could not start: {}", e);
            fail(e.to_string());
            return;
        }
    };

    let sink = match CsvSink::create(
        &env.output_dir,
        &SinkName {
            from_code: &request.from_code,
            to_code: &request.to_code,
            backend,
            worker_id: worker,
        },
    ) {
        Ok(sink) => Arc::new(sink),
        Err(e) => {
            error!(worker, "Cannot open output files: {}", e);
            stack.shutdown().await;
            fail(e.to_string());
            return;
        }
    };

    let mut orchestrator = Orchestrator::new(Arc::clone(&stack.backend), Arc::clone(&stack.fetcher), sink)
        .with_settings(env.settings.clone());
    if let Some(handler) = &env.captcha {
        orchestrator = orchestrator.with_captcha(Arc::clone(handler));
    }
    let orchestrator = Arc::new(orchestrator);
    orchestrators
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .push(Arc::clone(&orchestrator));
    if stop.load(Ordering::SeqCst) {
        orchestrator.request_stop();
    }

    update_status(&statuses, worker, |s| s.state = WorkerState::Working);

    let (tx, mut rx) = unbounded_channel::<ProgressEvent>();
    let forward_statuses = Arc::clone(&statuses);
    let forwarder = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            update_status(&forward_statuses, event.worker_id, |s| {
                s.phase = event.phase;
                s.current_task = event.message;
                s.progress_percent = event.percent;
                s.processed = event.stats.processed;
                s.kept = event.stats.kept;
                s.omitted = event.stats.omitted;
                s.errors = event.stats.total_errors;
            });
        }
    });

    let result = orchestrator.run_sweep(&registry, &request, &tx).await;
    drop(tx);
    if let Err(e) = forwarder.await {
        warn!(worker, "Progress forwarder ended abnormally: {}", e);
    }
    stack.shutdown().await;

    match result {
        Ok(outcome) => update_status(&statuses, worker, |s| {
            s.state = WorkerState::Completed;
            s.phase = outcome.phase;
            s.progress_percent = 100.0;
            s.current_task = format!(
                "{} kept, {} omitted, {} errors",
                outcome.stats.kept, outcome.stats.omitted, outcome.stats.total_errors
            );
        }),
        Err(e) => fail(e.to_string()),
    }
}
