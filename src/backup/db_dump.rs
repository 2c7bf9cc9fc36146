// backman/src/backup/db_dump.rs
use anyhow::{Context, Result as AnyResult};
use secrecy::ExposeSecret;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use which::which;

use super::{ConnectionParams, Engine};
use crate::errors::{BackupError, Result};

/// A program plus any arguments that precede the generated dump arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl ToolCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Resolves `name` on `PATH`.
    pub fn locate(name: &str) -> AnyResult<Self> {
        let program = which(name).with_context(|| {
            format!("{name} executable not found in PATH. Please ensure the database client tools are installed and in your PATH.")
        })?;
        Ok(Self::new(program))
    }
}

/// The dump tools for one engine: one for a single database, one for the whole instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpTools {
    pub single_database: ToolCommand,
    pub whole_instance: ToolCommand,
}

impl DumpTools {
    /// Default tool names for `engine`.
    pub fn defaults(engine: Engine) -> Self {
        match engine {
            Engine::Postgres => Self {
                single_database: ToolCommand::new("pg_dump"),
                whole_instance: ToolCommand::new("pg_dumpall"),
            },
            Engine::MySql => Self {
                single_database: ToolCommand::new("mysqldump"),
                whole_instance: ToolCommand::new("mysqldump"),
            },
        }
    }
}

/// A fully assembled dump invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub envs: Vec<(&'static str, OsString)>,
}

impl DumpCommand {
    fn display(&self) -> String {
        let mut parts = vec![self.program.to_string_lossy().into_owned()];
        parts.extend(self.args.iter().map(|a| a.to_string_lossy().into_owned()));
        parts.join(" ")
    }
}

/// Builds and starts dump processes for one engine.
#[derive(Debug, Clone)]
pub struct DumpInvoker {
    engine: Engine,
    tools: DumpTools,
}

impl DumpInvoker {
    pub fn new(engine: Engine, tools: DumpTools) -> Self {
        Self { engine, tools }
    }

    pub fn engine(&self) -> Engine {
        self.engine
    }

    /// Selects the tool and arguments for `conn`. Connection parameters travel
    /// in `envs` and are applied to the child only.
    pub fn command(&self, conn: &ConnectionParams) -> DumpCommand {
        let database = conn.database.as_deref().filter(|db| !db.is_empty());
        let tool = match database {
            Some(_) => &self.tools.single_database,
            None => &self.tools.whole_instance,
        };
        let mut args = tool.args.clone();
        let envs: Vec<(&'static str, OsString)>;

        match self.engine {
            Engine::Postgres => {
                if let Some(db) = database {
                    args.push(db.into());
                    args.push("-C".into());
                }
                args.push("-c".into());
                args.push("--no-password".into());
                envs = vec![
                    ("PGUSER", conn.username.clone().into()),
                    ("PGPASSWORD", conn.password.expose_secret().into()),
                    ("PGHOST", conn.host.clone().into()),
                    ("PGPORT", conn.port.to_string().into()),
                ];
            }
            Engine::MySql => {
                args.push(format!("--user={}", conn.username).into());
                args.push("--single-transaction".into());
                args.push("--quick".into());
                args.push("--routines".into());
                match database {
                    Some(db) => {
                        args.push("--databases".into());
                        args.push(db.into());
                    }
                    None => args.push("--all-databases".into()),
                }
                envs = vec![
                    ("MYSQL_PWD", conn.password.expose_secret().into()),
                    ("MYSQL_HOST", conn.host.clone().into()),
                    ("MYSQL_TCP_PORT", conn.port.to_string().into()),
                ];
            }
        }

        DumpCommand {
            program: tool.program.clone(),
            args,
            envs,
        }
    }

    /// Spawns the dump for `conn`.
    pub fn start(&self, conn: &ConnectionParams) -> Result<DumpProcess> {
        let dump = self.command(conn);
        debug!(engine = %self.engine, "executing backup command: {}", dump.display());

        let mut child = Command::new(&dump.program)
            .args(&dump.args)
            .envs(dump.envs.iter().map(|(k, v)| (*k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| BackupError::Invocation {
                engine: self.engine,
                program: dump.program.to_string_lossy().into_owned(),
                source,
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take().map(|mut pipe| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                if let Err(e) = pipe.read_to_end(&mut buf).await {
                    warn!("could not read dump stderr: {}", e);
                }
                buf
            })
        });

        Ok(DumpProcess {
            engine: self.engine,
            child,
            stdout,
            stderr,
        })
    }
}

/// How the dump process ended.
#[derive(Debug)]
pub enum DumpExit {
    Finished(ExitStatus),
    DeadlineExceeded(ExitStatus),
    Cancelled(ExitStatus),
}

/// A running dump. Dropping it kills the child.
#[derive(Debug)]
pub struct DumpProcess {
    engine: Engine,
    child: Child,
    stdout: Option<ChildStdout>,
    stderr: Option<JoinHandle<Vec<u8>>>,
}

impl DumpProcess {
    /// Hands out the stdout pipe. Only the first call returns it.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// Waits for the process to exit, killing it when `deadline` passes or
    /// `cancel` fires first.
    ///
    /// `readers` is cancelled before the kill, so whatever consumes stdout
    /// sees the cancellation ahead of the end-of-file caused by the kill.
    pub async fn wait(
        &mut self,
        deadline: Instant,
        cancel: &CancellationToken,
        readers: &CancellationToken,
    ) -> Result<DumpExit> {
        let engine = self.engine;
        let wait_err = |source: std::io::Error| BackupError::Wait { engine, source };

        tokio::select! {
            status = self.child.wait() => status.map(DumpExit::Finished).map_err(wait_err),
            _ = sleep_until(deadline) => {
                warn!(engine = %engine, "dump deadline reached, terminating dump process");
                readers.cancel();
                self.terminate().await.map(DumpExit::DeadlineExceeded).map_err(wait_err)
            }
            _ = cancel.cancelled() => {
                warn!(engine = %engine, "backup cancelled, terminating dump process");
                readers.cancel();
                self.terminate().await.map(DumpExit::Cancelled).map_err(wait_err)
            }
        }
    }

    async fn terminate(&mut self) -> std::io::Result<ExitStatus> {
        if let Err(e) = self.child.start_kill() {
            debug!("kill on dump process failed: {}", e);
        }
        self.child.wait().await
    }

    /// Captured stderr with trailing line endings removed. Only meaningful
    /// after the process has exited.
    pub async fn stderr_text(&mut self) -> String {
        let buf = match self.stderr.take() {
            Some(handle) => handle.await.unwrap_or_default(),
            None => Vec::new(),
        };
        String::from_utf8_lossy(&buf)
            .trim_end_matches(['\r', '\n'])
            .to_string()
    }

    /// Stops collecting stderr without waiting for the pipe to close.
    pub fn discard_stderr(&mut self) {
        if let Some(handle) = self.stderr.take() {
            handle.abort();
        }
    }
}
