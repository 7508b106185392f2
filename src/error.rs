use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum TaigaError {
    #[error("invalid datafile reference: {0}")]
    InvalidReference(String),

    #[error("datafile not found: {0}")]
    NotFound(String),

    #[error("{permaname} version {version} is deleted; its data is no longer available")]
    DeletedVersion { permaname: String, version: u32 },

    #[error("unable to reach Taiga: {0}")]
    Connectivity(String),

    #[error("Taiga returned status {status}: {message}")]
    HttpStatus { status: u16, message: String },

    #[error("Taiga task {task} failed: {message}")]
    TaskFailed { task: String, message: String },

    #[error("unexpected response from Taiga: {0}")]
    UnexpectedResponse(String),

    #[error("download of {key} is corrupt: expected sha256 {expected}, found {actual}")]
    CorruptDownload {
        key: String,
        expected: String,
        actual: String,
    },

    #[error("{key} is a {data_type} datafile and cannot be provided as {requested}")]
    UnsupportedConversion {
        key: String,
        data_type: String,
        requested: String,
    },

    #[error("virtual datafile references form a cycle: {0}")]
    ResolutionCycle(String),

    #[error("offline and {0} is not available in the cache")]
    OfflineUnavailable(String),

    #[error("fetch of {0} was interrupted")]
    Interrupted(String),

    #[error("conversion to {format} failed: {message}")]
    Conversion { format: String, message: String },

    #[error("cache index error: {0}")]
    Index(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),
}

impl TaigaError {
    /// True for failures that mean the remote could not be reached at all,
    /// as opposed to the remote answering with an error.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, TaigaError::Connectivity(_))
    }
}
