//! Streaming database backups
//!
//! Runs a database dump tool, gzips its output in flight and streams the
//! result to S3-compatible object storage, one dump per engine at a time.

pub mod backup;
pub mod config;
pub mod errors;

pub use backup::logic::BackupPipeline;
pub use backup::{BackupRequest, ConnectionParams, Engine};
pub use errors::{BackupError, UploadError};
