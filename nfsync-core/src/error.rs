//! Error types for nfsync-core.

use std::path::PathBuf;

use chrono::NaiveDate;
use thiserror::Error;

/// Input rejected before it reaches any store or the engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// The digits left after normalization are not 11 (CPF) or 14 (CNPJ) long.
    #[error("invalid taxpayer id '{raw}': expected 11 or 14 digits")]
    InvalidTaxId { raw: String },

    /// A calendar date could not be parsed as `YYYY-MM-DD`.
    #[error("invalid date '{raw}': expected YYYY-MM-DD")]
    InvalidDate { raw: String },

    /// The range start falls after its end.
    #[error("invalid date range: {start} is after {end}")]
    InvalidDateRange { start: NaiveDate, end: NaiveDate },
}

/// All errors that can arise from the durable stores and configuration.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying I/O failure, annotated with the path involved.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON encode/decode failure for the ledger or the run status.
    #[error("failed to read JSON at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// YAML parse error on load, with file path and line context from serde_yaml.
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// YAML serialization error (save path).
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// `dirs::home_dir()` returned `None` — cannot locate the default data dir.
    #[error("cannot determine home directory; set $HOME or NFSYNC_DATA_DIR")]
    HomeNotFound,

    /// The identifier is not present in the registry.
    #[error("identifier {id} is not registered")]
    NotFound { id: String },

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Convenience constructor for [`StoreError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.into(),
        source,
    }
}

/// Convenience constructor for [`StoreError::Json`].
pub(crate) fn json_err(path: impl Into<PathBuf>, source: serde_json::Error) -> StoreError {
    StoreError::Json {
        path: path.into(),
        source,
    }
}
