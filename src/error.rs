use std::path::PathBuf;
use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, MemoryErr>;

/// Error taxonomy for the memory engine.
///
/// Adapters (CLI, future HTTP/MCP surfaces) map these kinds to
/// human-readable strings; the kind itself is the stable contract.
/// Per-item failures inside batch stages never surface here — they are
/// absorbed with a warning at the stage that produced them.
#[derive(Debug, Error)]
pub enum MemoryErr {
    /// The workspace has no state directory yet (`engram init` not run).
    #[error("workspace not initialised: {0} (run `engram init` first)")]
    NotInitialised(PathBuf),

    /// Provider credentials missing, or the endpoint stayed unreachable
    /// after the bounded retry loop.
    #[error("provider `{provider}` unavailable: {cause}")]
    ProviderUnavailable { provider: String, cause: String },

    /// A checkpoint or source file could not be parsed. Callers that see
    /// this for a single item downgrade it to an empty result.
    #[error("parse failed for {item}: {cause}")]
    ParseError { item: String, cause: String },

    /// A best-effort schema migration step failed. Reads continue with
    /// defaulted fields; the error is only surfaced when the table is
    /// unusable outright.
    #[error("schema migration failed on `{table}`: {cause}")]
    SchemaEvolution { table: String, cause: String },

    /// The sync lock was held by another process past the wait budget.
    #[error("sync lock at {0} held by another process (timeout exceeded)")]
    ConcurrencyDenied(PathBuf),

    /// Cooperative cancellation fired mid-pipeline. Partial writes that
    /// already committed are retained; re-running the sync is idempotent.
    #[error("operation cancelled")]
    Cancelled,

    /// A symbol or path lookup matched nothing.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl MemoryErr {
    pub fn internal(e: impl std::fmt::Display) -> Self {
        MemoryErr::Internal(e.to_string())
    }

    /// Stable machine-readable kind, independent of the display text.
    pub fn kind(&self) -> &'static str {
        match self {
            MemoryErr::NotInitialised(_) => "not-initialised",
            MemoryErr::ProviderUnavailable { .. } => "provider-unavailable",
            MemoryErr::ParseError { .. } => "parse-error",
            MemoryErr::SchemaEvolution { .. } => "schema-evolution",
            MemoryErr::ConcurrencyDenied(_) => "concurrency-denied",
            MemoryErr::Cancelled => "cancelled",
            MemoryErr::NotFound(_) => "not-found",
            MemoryErr::Internal(_) => "internal",
        }
    }
}

impl From<std::io::Error> for MemoryErr {
    fn from(e: std::io::Error) -> Self {
        MemoryErr::Internal(format!("io: {e}"))
    }
}

impl From<serde_json::Error> for MemoryErr {
    fn from(e: serde_json::Error) -> Self {
        MemoryErr::Internal(format!("json: {e}"))
    }
}
