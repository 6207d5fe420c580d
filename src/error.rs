//! Error taxonomy for the sampling core.
//!
//! Out-of-bounds points are deliberately absent here: they are a defined
//! empty-value outcome of the sampler, not a failure.

use std::path::PathBuf;

/// The frame source could not deliver a frame for this tick.
#[derive(Debug, thiserror::Error)]
pub enum AcquisitionError {
    #[error("frame source unavailable: {0}")]
    Unavailable(String),

    #[error("failed to decode frame from {path}: {detail}")]
    Decode { path: String, detail: String },

    #[error("frame buffer is {actual} bytes, expected {expected} for {width}x{height}")]
    BadGeometry {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
}

/// Failures of the on-disk session structure.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("failed to create session at {path}: {source}")]
    CreateSession {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write record file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to flush record file {path}: {source}")]
    Flush {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to save image {path}: {detail}")]
    Image { path: PathBuf, detail: String },

    #[error("failed to write session metadata {path}: {detail}")]
    Metadata { path: PathBuf, detail: String },

    #[error("record file is closed")]
    Closed,
}

/// A single tick failed. The scheduler stays in its current state; whether to
/// keep ticking is the caller's decision.
#[derive(Debug, thiserror::Error)]
pub enum TickError {
    #[error(transparent)]
    Acquisition(#[from] AcquisitionError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Export requests and jobs.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("an export is already running")]
    Busy,

    #[error("session {0} is still being recorded")]
    SessionOpen(String),

    #[error("source session {0} does not exist")]
    MissingSource(PathBuf),

    #[error("{0:?} is not a session id")]
    InvalidSessionId(String),

    #[error("session {0} was never closed")]
    Unclosed(String),

    #[error("no sessions to export")]
    Empty,

    #[error("failed to copy {path}: {source}")]
    Copy {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("export task ended abnormally: {0}")]
    Aborted(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
