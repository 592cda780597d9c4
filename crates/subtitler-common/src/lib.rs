use std::time::SystemTime;
use thiserror::Error;

/// Which rolling quota window a check or a pause applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaWindow {
    Daily,
    Monthly,
}

impl std::fmt::Display for QuotaWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuotaWindow::Daily => write!(f, "daily"),
            QuotaWindow::Monthly => write!(f, "monthly"),
        }
    }
}

/// Error taxonomy per the engine's error-handling design: `BadInput`/`NotFound`
/// surface straight to the producer, `ProviderTransient` is retried, `QuotaPause`
/// and `Cancelled` are the only kinds that leave a phase without failing the job.
#[derive(Error, Debug)]
pub enum SubtitlerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid input: {0}")]
    BadInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("provider {provider} transient error: {message}")]
    ProviderTransient { provider: String, message: String },

    #[error("provider {provider} failed: {message}")]
    ProviderFailed { provider: String, message: String },

    #[error("{provider} {window} quota exceeded: {current:.4} / {limit:.4}")]
    QuotaExceeded {
        provider: String,
        window: QuotaWindow,
        current: f64,
        limit: f64,
    },

    #[error("{provider} {window} quota exceeded, resume at {resume_at:?}")]
    QuotaPause {
        provider: String,
        window: QuotaWindow,
        resume_at: SystemTime,
    },

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl SubtitlerError {
    pub fn is_pause(&self) -> bool {
        matches!(self, SubtitlerError::QuotaPause { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, SubtitlerError::Cancelled)
    }

    /// True for errors that justify a bounded retry with backoff (§4.6 failure policy).
    pub fn is_retriable(&self) -> bool {
        matches!(self, SubtitlerError::ProviderTransient { .. })
    }
}

pub type Result<T> = std::result::Result<T, SubtitlerError>;
