use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

use crate::pipeline::Stage;

#[derive(Debug, Error, Diagnostic)]
pub enum GrimError {
    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("executable not found: {0}")]
    #[diagnostic(help("install it or point `executables` in grimperium.json at it"))]
    ExecutableNotFound(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("{stage} failed for {molecule}: {reason}")]
    StageFailure {
        stage: Stage,
        molecule: String,
        reason: String,
    },

    #[error("calculation failed: {0}")]
    Calculation(String),

    #[error("datastore error: {0}")]
    Datastore(String),

    #[error("timed out after {seconds}s waiting for lock {path}")]
    LockTimeout { path: PathBuf, seconds: u64 },

    #[error("command must be a non-empty argument list")]
    EmptyCommand,

    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error("invalid molecule identifier: {0:?}")]
    InvalidIdentifier(String),

    #[error("unsupported file format: {0}")]
    UnsupportedFormat(String),

    #[error("PubChem request failed: {0}")]
    PubchemHttp(String),

    #[error("PubChem returned status {status}: {message}")]
    PubchemStatus { status: u16, message: String },

    #[error("compound not found in PubChem: {0}")]
    CompoundNotFound(String),

    #[error("failed to read identifier list at {0}")]
    ListRead(PathBuf),

    #[error("batch validation aborted at {0}")]
    ValidationAborted(String),

    #[error("{failed} of {total} molecules failed")]
    BatchFailed { failed: usize, total: usize },
}
