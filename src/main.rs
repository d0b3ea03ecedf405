//! A3S Sweep CLI - runs a sweep over a range of subject codes.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use base64::Engine as _;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use a3s_sweep::captcha::ChallengePayload;
use a3s_sweep::{
    BackendKind, CaptchaChallenge, CaptchaSolution, JobManager, JobRequest, Registry, SearchMode,
    SweepConfig, SweepContext, WorkerState, WorkerStatus,
};

/// A3S Sweep - search, fetch and tabulate documents for a range of codes
#[derive(Parser)]
#[command(name = "a3s-sweep")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a sweep over a code range
    Run(RunArgs),

    /// List available search backends
    Backends,

    /// List registry codes
    Codes(CodesArgs),
}

#[derive(Parser)]
struct RunArgs {
    /// Registry CSV (code, label)
    #[arg(long)]
    registry: PathBuf,

    /// First code of the range (inclusive)
    #[arg(long)]
    from: String,

    /// Last code of the range (inclusive)
    #[arg(long)]
    to: String,

    /// Minimum word count for a kept result
    #[arg(long, default_value = "30")]
    min_words: usize,

    /// Search backend: cordis-api, cordis, google, ddg
    #[arg(short, long, default_value = "cordis-api")]
    backend: String,

    /// Query mode: broad or exact
    #[arg(short, long, default_value = "broad")]
    mode: String,

    /// Concurrent workers; the range is split between them
    #[arg(short, long, default_value = "1")]
    workers: usize,

    /// Show the browser window
    #[arg(long)]
    headful: bool,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output directory (overrides the configuration)
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Parser)]
struct CodesArgs {
    /// Registry CSV (code, label)
    #[arg(long)]
    registry: PathBuf,

    #[arg(long)]
    from: Option<String>,

    #[arg(long)]
    to: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "a3s_sweep=debug,info" } else { "a3s_sweep=info,warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Backends => list_backends(),
        Commands::Codes(args) => list_codes(args),
    }
}

fn list_backends() -> Result<()> {
    println!("Available search backends:\n");
    for kind in BackendKind::ALL {
        let browser = if kind.requires_browser() { "browser" } else { "http" };
        println!("  {:<11} - {} ({})", kind.slug(), kind.display_name(), browser);
    }
    println!();
    println!("Usage: a3s-sweep run --registry codes.csv --from 01.0 --to 01.9 -b ddg");
    Ok(())
}

fn list_codes(args: CodesArgs) -> Result<()> {
    let registry = Registry::load_csv(&args.registry)
        .with_context(|| format!("reading {}", args.registry.display()))?;
    let terms = registry.range(args.from.as_deref().unwrap_or(""), args.to.as_deref().unwrap_or(""))?;
    for term in &terms {
        println!("{}\t{}", term.code, term.label);
    }
    eprintln!("{} codes", terms.len());
    Ok(())
}

async fn run(args: RunArgs) -> Result<()> {
    let backend: BackendKind = args.backend.parse()?;
    let mode: SearchMode = args.mode.parse()?;

    let mut config = match &args.config {
        Some(path) => SweepConfig::from_file(path)?,
        None => SweepConfig::default(),
    }
    .with_env_overrides();
    if let Some(dir) = &args.output {
        config.output.dir = dir.clone();
    }
    let output_dir = config.output.dir.clone();

    let registry = Registry::load_csv(&args.registry)
        .with_context(|| format!("reading {}", args.registry.display()))?;
    let context = Arc::new(SweepContext::new(config).await?);
    let mut announcements = context.captcha_channel().subscribe();
    let jobs = Arc::new(JobManager::new(Arc::clone(&context), registry));

    let ack = jobs
        .start(JobRequest {
            from_code: args.from.clone(),
            to_code: args.to.clone(),
            min_words: args.min_words,
            backend,
            search_mode: mode,
            headless: !args.headful,
            workers: args.workers,
        })
        .await?;
    eprintln!(
        "Job {} started: {} terms, {} workers, backend {}",
        ack.job_id,
        ack.terms,
        ack.workers,
        backend.display_name()
    );
    eprintln!("Answer CAPTCHAs by typing: <challenge-id> <solution>");

    let stdin_jobs = Arc::clone(&jobs);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match parse_solution(&line) {
                Some(solution) => {
                    let id = solution.id;
                    if stdin_jobs.submit_captcha_solution(solution) {
                        eprintln!("Solution for {} accepted", id);
                    } else {
                        eprintln!("No pending challenge {}", id);
                    }
                }
                None if line.trim().is_empty() => {}
                None => eprintln!("Expected: <challenge-id> <solution>"),
            }
        }
    });

    let mut ticker = tokio::time::interval(Duration::from_secs(5));
    let mut stopping = false;
    while jobs.is_running().await {
        tokio::select! {
            _ = ticker.tick() => print_status(&jobs.status()),
            announcement = announcements.recv() => match announcement {
                Ok(challenge) => announce(&challenge, &output_dir),
                Err(RecvError::Lagged(n)) => eprintln!("{} CAPTCHA announcements missed", n),
                Err(RecvError::Closed) => {}
            },
            _ = tokio::signal::ctrl_c(), if !stopping => {
                eprintln!("Stopping after the current unit of work...");
                stopping = true;
                if let Err(e) = jobs.stop().await {
                    eprintln!("{}", e);
                }
            }
        }
    }
    jobs.wait().await;

    let status = jobs.status();
    print_status(&status);
    let failed = status.iter().filter(|s| s.state == WorkerState::Error).count();
    if failed > 0 {
        anyhow::bail!("{} of {} workers failed", failed, status.len());
    }
    Ok(())
}

fn parse_solution(line: &str) -> Option<CaptchaSolution> {
    let (id, value) = line.trim().split_once(char::is_whitespace)?;
    let id = Uuid::parse_str(id).ok()?;
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    Some(CaptchaSolution::new(id, value))
}

fn announce(challenge: &CaptchaChallenge, output_dir: &Path) {
    match &challenge.payload {
        ChallengePayload::Image { png_base64 } => {
            let path = output_dir.join(format!("captcha_{}.png", challenge.id));
            let saved = base64::engine::general_purpose::STANDARD
                .decode(png_base64)
                .map_err(|e| e.to_string())
                .and_then(|bytes| std::fs::write(&path, bytes).map_err(|e| e.to_string()));
            match saved {
                Ok(()) => eprintln!("CAPTCHA {}: image saved to {}", challenge.id, path.display()),
                Err(e) => eprintln!("CAPTCHA {}: image could not be saved ({})", challenge.id, e),
            }
        }
        ChallengePayload::Interactive { site_key, page_url } => {
            eprintln!(
                "CAPTCHA {}: {:?} on {} (site key {})",
                challenge.id, challenge.provider, page_url, site_key
            );
        }
    }
}

fn print_status(status: &[WorkerStatus]) {
    for s in status {
        eprintln!(
            "[worker {}] {:?}/{:?} {:>5.1}% {}..{} processed {} kept {} omitted {} errors {} | {}",
            s.worker_id,
            s.state,
            s.phase,
            s.progress_percent,
            s.from_code,
            s.to_code,
            s.processed,
            s.kept,
            s.omitted,
            s.errors,
            s.current_task
        );
    }
}
