// backman/src/config/mod.rs
use anyhow::{Context, Result};
use chrono::Utc;
use secrecy::SecretString;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;

use crate::backup::db_dump::{DumpTools, ToolCommand};
use crate::backup::{BackupRequest, ConnectionParams, Engine};

const DEFAULT_BACKUP_TIMEOUT_SECS: u64 = 60 * 60;

fn default_backup_timeout_secs() -> u64 {
    DEFAULT_BACKUP_TIMEOUT_SECS
}

/// S3-compatible object storage settings.
#[derive(Debug, Deserialize)]
pub struct SpacesConfig {
    pub endpoint_url: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: SecretString,
    pub bucket_name: String,
    #[serde(default)]
    pub force_path_style: bool,
}

/// Optional overrides for the dump tool locations. Unset tools are looked up on `PATH`.
#[derive(Debug, Default, Deserialize)]
pub struct ToolsConfig {
    pub pg_dump: Option<PathBuf>,
    pub pg_dumpall: Option<PathBuf>,
    pub mysqldump: Option<PathBuf>,
}

/// A service-binding descriptor: which engine, what it is called, how to reach it.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceBinding {
    pub label: String,
    pub name: String,
    #[serde(default)]
    pub credentials: HashMap<String, serde_json::Value>,
}

impl ServiceBinding {
    /// Credential value as a string. Numbers are accepted so `"port": 5432` works.
    pub fn credential_string(&self, key: &str) -> Option<String> {
        match self.credentials.get(key)? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    fn required(&self, key: &str) -> Result<String> {
        self.credential_string(key)
            .filter(|v| !v.is_empty())
            .with_context(|| format!("service binding {} has no credential '{}'", self.name, key))
    }

    /// `{name}_{YYYYMMDDHHMMSS}.gz`, UTC.
    pub fn backup_filename(&self) -> String {
        format!("{}_{}.gz", self.name, Utc::now().format("%Y%m%d%H%M%S"))
    }

    /// Builds the request for one backup run of this binding. The deadline
    /// starts counting now, before any wait for the engine lock.
    pub fn to_request(&self, timeout: Duration) -> Result<BackupRequest> {
        let engine = Engine::from_label(&self.label)
            .with_context(|| format!("service binding {} has unsupported label '{}'", self.name, self.label))?;
        let port = self
            .required("port")?
            .parse::<u16>()
            .with_context(|| format!("service binding {} has an invalid port", self.name))?;

        Ok(BackupRequest {
            engine,
            connection: ConnectionParams {
                host: self.required("host")?,
                port,
                database: self.credential_string("database").filter(|db| !db.is_empty()),
                username: self.required("username")?,
                password: SecretString::new(self.credential_string("password").unwrap_or_default()),
            },
            filename: self.backup_filename(),
            namespace: self.label.clone(),
            instance_name: self.name.clone(),
            deadline: Instant::now() + timeout,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_backup_timeout_secs")]
    pub backup_timeout_secs: u64,
    pub s3_storage: SpacesConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub services: Vec<ServiceBinding>,
}

impl AppConfig {
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        Self::from_json_str(&config_content)
            .with_context(|| format!("Failed to parse JSON from config file at {}", config_path.display()))
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        let config: AppConfig = serde_json::from_str(content)?;
        if config.backup_timeout_secs == 0 {
            anyhow::bail!("backup_timeout_secs must be greater than zero");
        }
        for binding in &config.services {
            if Engine::from_label(&binding.label).is_none() {
                anyhow::bail!("service {} has unsupported label '{}'", binding.name, binding.label);
            }
        }
        Ok(config)
    }

    pub fn backup_timeout(&self) -> Duration {
        Duration::from_secs(self.backup_timeout_secs)
    }

    /// Dump tools for `engine`, honouring configured paths and falling back to `PATH`.
    pub fn dump_tools(&self, engine: Engine) -> Result<DumpTools> {
        let defaults = DumpTools::defaults(engine);
        let resolve = |configured: &Option<PathBuf>, default: &ToolCommand| match configured {
            Some(path) => Ok(ToolCommand::new(path.clone())),
            None => ToolCommand::locate(&default.program.to_string_lossy()),
        };
        let (single, whole) = match engine {
            Engine::Postgres => (&self.tools.pg_dump, &self.tools.pg_dumpall),
            Engine::MySql => (&self.tools.mysqldump, &self.tools.mysqldump),
        };
        Ok(DumpTools {
            single_database: resolve(single, &defaults.single_database)?,
            whole_instance: resolve(whole, &defaults.whole_instance)?,
        })
    }
}
