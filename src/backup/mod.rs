pub mod compress;
pub mod db_dump;
pub mod lock;
pub mod logic;
pub mod s3_upload;

use secrecy::SecretString;
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::AppConfig;
use db_dump::DumpInvoker;
use lock::EngineLocks;
use logic::BackupPipeline;
use s3_upload::S3Uploader;

/// Database technology whose dumps are serialized against each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Engine {
    Postgres,
    MySql,
}

impl Engine {
    /// Maps a service-binding label to an engine.
    pub fn from_label(label: &str) -> Option<Self> {
        match label.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "elephantsql" => Some(Engine::Postgres),
            "mysql" | "mariadb" | "mariadbent" => Some(Engine::MySql),
            _ => None,
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Engine::Postgres => f.write_str("postgres"),
            Engine::MySql => f.write_str("mysql"),
        }
    }
}

/// Connection parameters handed to the dump tool.
#[derive(Debug)]
pub struct ConnectionParams {
    pub host: String,
    pub port: u16,
    pub database: Option<String>,
    pub username: String,
    pub password: SecretString,
}

/// Everything one pipeline run needs.
#[derive(Debug)]
pub struct BackupRequest {
    pub engine: Engine,
    pub connection: ConnectionParams,
    pub filename: String,
    pub namespace: String,
    pub instance_name: String,
    pub deadline: Instant,
}

impl BackupRequest {
    /// `{namespace}/{instance_name}/{filename}`
    pub fn object_path(&self) -> String {
        format!("{}/{}/{}", self.namespace, self.instance_name, self.filename)
    }
}

/// Backs up every configured service, or only `only` when given.
///
/// Services run one after another; a failure is logged and the remaining
/// services still run. Returns the number of failed backups.
pub async fn run_backup_flow(app_config: &AppConfig, only: Option<&str>) -> usize {
    let uploader = Arc::new(S3Uploader::connect(&app_config.s3_storage).await);
    let mut locks = EngineLocks::new();
    let cancel = CancellationToken::new();
    let mut failures = 0;

    let services = app_config
        .services
        .iter()
        .filter(|binding| only.is_none_or(|name| binding.name == name));

    for binding in services {
        let prepared = binding
            .to_request(app_config.backup_timeout())
            .and_then(|request| Ok((app_config.dump_tools(request.engine)?, request)));
        let (tools, request) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                error!(service = %binding.name, "could not prepare backup: {:#}", e);
                failures += 1;
                continue;
            }
        };
        let invoker = DumpInvoker::new(request.engine, tools);
        let pipeline = BackupPipeline::new(locks.for_engine(request.engine), invoker, uploader.clone());

        info!(service = %binding.name, engine = %request.engine, "starting backup to {}", request.object_path());
        match pipeline.run(&request, &cancel).await {
            Ok(()) => info!(service = %binding.name, "backup completed"),
            Err(e) => {
                error!(service = %binding.name, "backup failed: {}", e);
                failures += 1;
            }
        }
    }

    failures
}
