use thiserror::Error;

use crate::backup::Engine;

/// Failure of a single backup run. Exactly one of these is reported per run.
#[derive(Error, Debug)]
pub enum BackupError {
    #[error("{engine} dump: could not start {program}: {source}")]
    Invocation {
        engine: Engine,
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{engine} dump: {status}: {stderr}")]
    DumpFailed {
        engine: Engine,
        status: String,
        stderr: String,
    },

    #[error("{engine} dump: timeout: deadline exceeded")]
    DeadlineExceeded { engine: Engine },

    #[error("{engine} dump: cancelled")]
    Cancelled { engine: Engine },

    #[error("{engine} dump: could not wait for dump process: {source}")]
    Wait {
        engine: Engine,
        #[source]
        source: std::io::Error,
    },

    #[error("could not upload backup to {path}: {source}")]
    UploadFailed {
        path: String,
        #[source]
        source: UploadError,
    },

    #[error("backup chain task failed: {0}")]
    Chain(#[from] tokio::task::JoinError),
}

/// Failure reported by an [`ObjectUploader`](crate::backup::s3_upload::ObjectUploader).
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("upload cancelled")]
    Cancelled,

    #[error("failed to read compressed stream: {0}")]
    Read(#[from] std::io::Error),

    #[error("object store request failed: {0}")]
    Store(String),
}

impl BackupError {
    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, BackupError::DeadlineExceeded { .. })
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
