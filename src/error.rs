//! Error types for the sweep library.

use thiserror::Error;

/// Result type alias for sweep operations.
pub type Result<T> = std::result::Result<T, SweepError>;

/// Coarse failure classes used to decide whether a unit of work is retried,
/// skipped, or aborts the owning worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Timeouts and connection failures. Retried with backoff, then skipped.
    TransientNetwork,
    /// Unsupported or corrupt content. Degrades to an empty document.
    ExtractionFailure,
    /// CAPTCHA timed out or was rejected. The navigation is abandoned.
    ChallengeUnresolved,
    /// Pool capacity exhausted after the bounded wait.
    ResourceExhaustion,
    /// The browser engine cannot start. Aborts the owning worker only.
    FatalInit,
    /// Anything else.
    Other,
}

/// Errors that can occur during a sweep.
#[derive(Error, Debug)]
pub enum SweepError {
    /// HTTP request failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Remote answered with a non-success status.
    #[error("HTTP status {status} from {url}")]
    Status { status: u16, url: String },

    /// Failed to parse response.
    #[error("Failed to parse response: {0}")]
    Parse(String),

    /// A bounded operation exceeded its deadline.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// URL parsing error.
    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Tabular output error.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Browser navigation or page operation failed.
    #[error("Browser error: {0}")]
    Browser(String),

    /// The browser engine could not be launched.
    #[error("Browser failed to initialize: {0}")]
    FatalInit(String),

    /// Checkout was attempted before `initialize`.
    #[error("Session pool is not initialized")]
    PoolUninitialized,

    /// No page became available within the bounded wait.
    #[error("Session pool exhausted: {0}")]
    PoolExhausted(String),

    /// Content could not be turned into text.
    #[error("Extraction failed: {0}")]
    Extraction(String),

    /// A CAPTCHA could not be resolved.
    #[error("CAPTCHA unresolved: {0}")]
    Challenge(String),

    /// Registry missing, empty or malformed.
    #[error("Registry error: {0}")]
    Registry(String),

    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// A job is already running.
    #[error("A sweep job is already running")]
    JobConflict,

    /// No job is running.
    #[error("No sweep job is running")]
    JobNotRunning,

    /// Generic error.
    #[error("{0}")]
    Other(String),
}

impl SweepError {
    /// Classifies the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SweepError::Http(_) | SweepError::Status { .. } | SweepError::Timeout(_) => {
                ErrorKind::TransientNetwork
            }
            SweepError::Browser(_) => ErrorKind::TransientNetwork,
            SweepError::Parse(_) | SweepError::Extraction(_) => ErrorKind::ExtractionFailure,
            SweepError::Challenge(_) => ErrorKind::ChallengeUnresolved,
            SweepError::PoolExhausted(_) => ErrorKind::ResourceExhaustion,
            SweepError::FatalInit(_) | SweepError::PoolUninitialized => ErrorKind::FatalInit,
            _ => ErrorKind::Other,
        }
    }

    /// Returns true when the error must abort the owning worker.
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::FatalInit
    }
}
