//! Error taxonomy for the pipeline and its external capabilities.
//!
//! Only [`GateError::TokenizerUnavailable`] aborts a pipeline pass. Every
//! other failure is isolated by the stage that hit it and reported as a
//! [`StageWarning`](crate::pipeline::StageWarning) on that stage's event.

use std::time::Duration;

/// Errors surfaced by pipeline stages and the recovery APIs.
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    /// No exact tokenizer is available for the model family. Fatal to the
    /// pass: no threshold decision is trustworthy without exact counts.
    #[error("tokenizer unavailable for model family '{family}': {reason}")]
    TokenizerUnavailable { family: String, reason: String },

    /// A handle or record could not be persisted. Recoverable: the reduction
    /// that needed it is skipped.
    #[error("storage failure: {0}")]
    StorageFailure(String),

    /// A remote capability (reranker, summarizer, pruner service) failed.
    /// Recoverable: the caller falls back to local behavior.
    #[error("remote capability failed: {0}")]
    RemoteCapabilityFailure(#[from] CapabilityError),

    /// Recovery was requested for an id that was never issued.
    #[error("no redaction record for prune_id '{0}'")]
    RecordNotFound(String),

    /// Recovery was requested after the record's time-to-live elapsed.
    #[error("redaction record '{0}' has expired")]
    RecordExpired(String),

    /// The redactor cannot honor both the prune ratio and the minimum kept
    /// lines for this input.
    #[error("{lines} lines cannot keep {min_keep_lines} within max_prune_ratio={max_prune_ratio}")]
    ConstraintUnsatisfiable {
        max_prune_ratio: f64,
        min_keep_lines: usize,
        lines: usize,
    },

    /// The requested model is not in the catalog and no explicit limit and
    /// family were supplied.
    #[error("unknown model '{0}'")]
    UnknownModel(String),
}

impl GateError {
    /// Stable snake_case code used in warnings and wire responses.
    pub fn code(&self) -> &'static str {
        match self {
            GateError::TokenizerUnavailable { .. } => "tokenizer_unavailable",
            GateError::StorageFailure(_) => "storage_failure",
            GateError::RemoteCapabilityFailure(_) => "remote_capability_failure",
            GateError::RecordNotFound(_) => "record_not_found",
            GateError::RecordExpired(_) => "record_expired",
            GateError::ConstraintUnsatisfiable { .. } => "constraint_unsatisfiable",
            GateError::UnknownModel(_) => "unknown_model",
        }
    }
}

/// Failures reported by an external capability implementation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CapabilityError {
    #[error("capability unavailable: {0}")]
    Unavailable(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl CapabilityError {
    /// Classify an HTTP status returned by a remote capability.
    pub fn from_status(status: u16, body: &str) -> Self {
        let detail = crate::preview(body, 200);
        match status {
            401 | 403 => CapabilityError::Auth(format!("HTTP {status}: {detail}")),
            429 => CapabilityError::RateLimited(format!("HTTP {status}: {detail}")),
            _ => CapabilityError::Transport(format!("HTTP {status}: {detail}")),
        }
    }
}

impl From<reqwest::Error> for CapabilityError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            CapabilityError::Transport(format!("request timed out: {e}"))
        } else if e.is_decode() {
            CapabilityError::Malformed(e.to_string())
        } else {
            CapabilityError::Transport(e.to_string())
        }
    }
}

/// Convenience alias for pipeline results.
pub type Result<T> = std::result::Result<T, GateError>;
