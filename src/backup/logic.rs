// backman/src/backup/logic.rs
use std::sync::Arc;
use tokio::process::ChildStdout;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::compress::{GzipHeader, compress_stream, compressed_channel};
use super::db_dump::{DumpExit, DumpInvoker};
use super::lock::EngineLock;
use super::s3_upload::ObjectUploader;
use super::BackupRequest;
use crate::errors::{BackupError, Result};

/// Dump → gzip → upload for one engine type.
///
/// Every run holds the engine lock from before the dump starts until the
/// upload chain has settled, so at most one dump per engine runs at a time.
#[derive(Clone)]
pub struct BackupPipeline {
    lock: EngineLock,
    invoker: DumpInvoker,
    uploader: Arc<dyn ObjectUploader>,
}

impl BackupPipeline {
    pub fn new(lock: EngineLock, invoker: DumpInvoker, uploader: Arc<dyn ObjectUploader>) -> Self {
        Self {
            lock,
            invoker,
            uploader,
        }
    }

    /// Runs one backup. `cancel` is the caller's token; the request's deadline
    /// bounds both the wait for the engine lock and the dump process.
    pub async fn run(&self, request: &BackupRequest, cancel: &CancellationToken) -> Result<()> {
        let engine = self.invoker.engine();
        let _guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!(engine = %engine, "backup of {} cancelled while waiting for the {} lock", request.instance_name, engine);
                return Err(BackupError::Cancelled { engine });
            }
            _ = sleep_until(request.deadline) => {
                warn!(engine = %engine, "deadline reached while waiting for the {} lock", engine);
                return Err(BackupError::DeadlineExceeded { engine });
            }
            guard = self.lock.acquire() => guard,
        };

        let mut process = match self.invoker.start(&request.connection) {
            Ok(process) => process,
            Err(e) => {
                error!("could not run {} dump: {}", engine, e);
                return Err(e);
            }
        };
        info!(engine = %engine, "{} dump started for {}", engine, request.instance_name);

        // Separate from the caller's token so the upload can be aborted as soon
        // as the dump outcome is known.
        let chain_cancel = CancellationToken::new();
        let _chain_cancel_on_exit = chain_cancel.clone().drop_guard();
        let (dump_ok_tx, dump_ok_rx) = oneshot::channel();
        let chain = process
            .take_stdout()
            .map(|stdout| self.spawn_chain(stdout, request, dump_ok_rx, chain_cancel.clone()));

        let exit = process.wait(request.deadline, cancel, &chain_cancel).await;

        // The chain must learn the outcome before anything else is awaited:
        // compression holds back the gzip trailer until it does.
        let dump_ok = matches!(&exit, Ok(DumpExit::Finished(status)) if status.success());
        if !dump_ok {
            chain_cancel.cancel();
        }
        let _ = dump_ok_tx.send(dump_ok);

        let outcome = match exit {
            Err(e) => Err(e),
            Ok(DumpExit::Finished(status)) if status.success() => Ok(()),
            Ok(DumpExit::Finished(status)) if Instant::now() < request.deadline => {
                let stderr = process.stderr_text().await;
                error!("{}", stderr);
                Err(BackupError::DumpFailed {
                    engine,
                    status: status.to_string(),
                    stderr,
                })
            }
            Ok(DumpExit::Finished(_)) | Ok(DumpExit::DeadlineExceeded(_)) => {
                process.discard_stderr();
                Err(BackupError::DeadlineExceeded { engine })
            }
            Ok(DumpExit::Cancelled(_)) => {
                process.discard_stderr();
                Err(BackupError::Cancelled { engine })
            }
        };

        let chain_result = match chain {
            Some(handle) => handle.await.map_err(BackupError::from).and_then(|r| r),
            None => Ok(()),
        };

        match outcome {
            Err(e) => {
                if let Err(chain_err) = chain_result {
                    debug!("ignoring upload chain error after failed dump: {}", chain_err);
                }
                Err(e)
            }
            Ok(()) => chain_result,
        }
    }

    /// Spawns compression and upload as two tasks and returns a handle that
    /// resolves once both are done.
    fn spawn_chain(
        &self,
        stdout: ChildStdout,
        request: &BackupRequest,
        dump_ok: oneshot::Receiver<bool>,
        cancel: CancellationToken,
    ) -> JoinHandle<Result<()>> {
        let uploader = self.uploader.clone();
        let path = request.object_path();
        let header = GzipHeader::now(request.filename.clone());

        tokio::spawn(async move {
            let (sink, body) = compressed_channel();
            let compress_cancel = cancel.clone();
            let compression = tokio::spawn(async move {
                compress_stream(stdout, sink, &header, dump_ok, &compress_cancel).await
            });

            let uploaded = uploader.upload(cancel, &path, body).await;

            match compression.await {
                Ok(Ok(bytes)) => debug!("compressed {} dump bytes for {}", bytes, path),
                Ok(Err(e)) => warn!("compression for {} stopped: {}", path, e),
                Err(e) => warn!("compression task for {} failed: {}", path, e),
            }

            uploaded.map_err(|source| {
                error!("could not upload service backup to {}: {}", path, source);
                BackupError::UploadFailed { path, source }
            })
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::backup::db_dump::{DumpTools, ToolCommand};
    use crate::backup::{ConnectionParams, Engine};
    use crate::errors::UploadError;
    use crate::backup::compress::UploadBody;
    use async_trait::async_trait;
    use flate2::read::GzDecoder;
    use secrecy::SecretString;
    use std::io::Read;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    #[derive(Default)]
    struct MemoryUploader {
        uploads: Mutex<Vec<(String, Vec<u8>)>>,
        fail_with: Option<String>,
        saw_cancel: Mutex<bool>,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    #[async_trait]
    impl ObjectUploader for MemoryUploader {
        async fn upload(
            &self,
            cancel: CancellationToken,
            path: &str,
            mut body: UploadBody,
        ) -> std::result::Result<(), UploadError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);

            let mut buf = Vec::new();
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    *self.saw_cancel.lock().unwrap() = true;
                    Err(UploadError::Cancelled)
                }
                read = body.read_to_end(&mut buf) => read.map(|_| ()).map_err(UploadError::from),
            };
            self.active.fetch_sub(1, Ordering::SeqCst);
            result?;

            if let Some(msg) = &self.fail_with {
                return Err(UploadError::Store(msg.clone()));
            }
            self.uploads.lock().unwrap().push((path.to_string(), buf));
            Ok(())
        }
    }

    fn script_pipeline(script: &str, uploader: Arc<MemoryUploader>, lock: EngineLock) -> BackupPipeline {
        let tool = |name: &str| ToolCommand::new("sh").with_args(["-c", script, name]);
        let tools = DumpTools {
            single_database: tool("pg_dump"),
            whole_instance: tool("pg_dumpall"),
        };
        BackupPipeline::new(lock, DumpInvoker::new(Engine::Postgres, tools), uploader)
    }

    fn request(timeout: Duration) -> BackupRequest {
        BackupRequest {
            engine: Engine::Postgres,
            connection: ConnectionParams {
                host: "localhost".to_string(),
                port: 5432,
                database: Some("orders".to_string()),
                username: "backup".to_string(),
                password: SecretString::new("secret".to_string()),
            },
            filename: "backup.sql.gz".to_string(),
            namespace: "svc".to_string(),
            instance_name: "instance1".to_string(),
            deadline: Instant::now() + timeout,
        }
    }

    fn gunzip(data: &[u8]) -> String {
        let mut out = String::new();
        GzDecoder::new(data).read_to_string(&mut out).unwrap();
        out
    }

    #[tokio::test]
    async fn test_successful_dump_is_uploaded_gzipped() {
        let uploader = Arc::new(MemoryUploader::default());
        let pipeline = script_pipeline("printf DUMPDATA", uploader.clone(), EngineLock::new(Engine::Postgres));

        pipeline
            .run(&request(Duration::from_secs(10)), &CancellationToken::new())
            .await
            .unwrap();

        let uploads = uploader.uploads.lock().unwrap();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].0, "svc/instance1/backup.sql.gz");
        assert_eq!(gunzip(&uploads[0].1), "DUMPDATA");
    }

    #[tokio::test]
    async fn test_dump_receives_database_arguments() {
        let uploader = Arc::new(MemoryUploader::default());
        let pipeline = script_pipeline(r#"printf '%s ' "$@""#, uploader.clone(), EngineLock::new(Engine::Postgres));

        pipeline
            .run(&request(Duration::from_secs(10)), &CancellationToken::new())
            .await
            .unwrap();

        let uploads = uploader.uploads.lock().unwrap();
        assert_eq!(gunzip(&uploads[0].1), "orders -C -c --no-password ");
    }

    #[tokio::test]
    async fn test_failed_dump_reports_trimmed_stderr() {
        let uploader = Arc::new(MemoryUploader::default());
        let pipeline = script_pipeline(
            r#"printf 'connection refused\n' >&2; exit 1"#,
            uploader.clone(),
            EngineLock::new(Engine::Postgres),
        );

        let err = pipeline
            .run(&request(Duration::from_secs(10)), &CancellationToken::new())
            .await
            .unwrap_err();

        match &err {
            BackupError::DumpFailed { stderr, .. } => assert_eq!(stderr, "connection refused"),
            other => panic!("expected DumpFailed, got {other:?}"),
        }
        assert!(err.to_string().contains("connection refused"));
        assert!(!err.is_deadline_exceeded());
        assert!(uploader.uploads.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_deadline_kills_dump_and_cancels_chain() {
        let uploader = Arc::new(MemoryUploader::default());
        let pipeline = script_pipeline(
            "printf 'fatal: something\\n' >&2; exec sleep 5",
            uploader.clone(),
            EngineLock::new(Engine::Postgres),
        );

        let started = std::time::Instant::now();
        let err = pipeline
            .run(&request(Duration::from_secs(1)), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(err.is_deadline_exceeded(), "got {err:?}");
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(*uploader.saw_cancel.lock().unwrap());
        assert!(uploader.uploads.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_caller_cancellation_stops_dump() {
        let uploader = Arc::new(MemoryUploader::default());
        let pipeline = script_pipeline("exec sleep 5", uploader.clone(), EngineLock::new(Engine::Postgres));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let err = pipeline
            .run(&request(Duration::from_secs(10)), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::Cancelled { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn test_upload_failure_surfaces_when_dump_succeeds() {
        let uploader = Arc::new(MemoryUploader {
            fail_with: Some("access denied".to_string()),
            ..Default::default()
        });
        let pipeline = script_pipeline("printf DUMPDATA", uploader, EngineLock::new(Engine::Postgres));

        let err = pipeline
            .run(&request(Duration::from_secs(10)), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            BackupError::UploadFailed { path, source } => {
                assert_eq!(path, "svc/instance1/backup.sql.gz");
                assert!(source.to_string().contains("access denied"));
            }
            other => panic!("expected UploadFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dump_error_takes_precedence_over_upload_error() {
        let uploader = Arc::new(MemoryUploader {
            fail_with: Some("access denied".to_string()),
            ..Default::default()
        });
        let pipeline = script_pipeline(
            "printf partial; printf 'out of memory' >&2; exit 2",
            uploader,
            EngineLock::new(Engine::Postgres),
        );

        let err = pipeline
            .run(&request(Duration::from_secs(10)), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::DumpFailed { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn test_missing_dump_binary_releases_lock() {
        let uploader = Arc::new(MemoryUploader::default());
        let lock = EngineLock::new(Engine::Postgres);
        let tools = DumpTools {
            single_database: ToolCommand::new("/nonexistent/backman-pg_dump"),
            whole_instance: ToolCommand::new("/nonexistent/backman-pg_dumpall"),
        };
        let pipeline = BackupPipeline::new(lock.clone(), DumpInvoker::new(Engine::Postgres, tools), uploader);

        let err = pipeline
            .run(&request(Duration::from_secs(10)), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::Invocation { .. }), "got {err:?}");
        assert!(
            tokio::time::timeout(Duration::from_millis(100), lock.acquire())
                .await
                .is_ok()
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_runs_of_one_engine_never_overlap() {
        let uploader = Arc::new(MemoryUploader::default());
        let lock = EngineLock::new(Engine::Postgres);
        let pipeline = script_pipeline("sleep 0.2; printf DUMPDATA", uploader.clone(), lock);

        let runs: Vec<_> = (0..4)
            .map(|_| {
                let pipeline = pipeline.clone();
                tokio::spawn(async move {
                    pipeline
                        .run(&request(Duration::from_secs(30)), &CancellationToken::new())
                        .await
                })
            })
            .collect();
        for run in runs {
            run.await.unwrap().unwrap();
        }

        assert_eq!(uploader.uploads.lock().unwrap().len(), 4);
        assert_eq!(uploader.max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_partial_output_of_failed_dump_is_never_stored() {
        for _ in 0..3 {
            let uploader = Arc::new(MemoryUploader::default());
            let pipeline = script_pipeline(
                "printf HALF; printf 'boom\\n' >&2; exit 1",
                uploader.clone(),
                EngineLock::new(Engine::Postgres),
            );

            let err = pipeline
                .run(&request(Duration::from_secs(10)), &CancellationToken::new())
                .await
                .unwrap_err();

            match &err {
                BackupError::DumpFailed { stderr, .. } => assert_eq!(stderr, "boom"),
                other => panic!("expected DumpFailed, got {other:?}"),
            }
            assert!(uploader.uploads.lock().unwrap().is_empty());
            assert!(*uploader.saw_cancel.lock().unwrap());
        }
    }

    #[tokio::test]
    async fn test_deadline_expires_while_waiting_for_lock() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let marker = dir.path().join("started");
        let uploader = Arc::new(MemoryUploader::default());
        let lock = EngineLock::new(Engine::Postgres);
        let pipeline = script_pipeline(
            &format!("touch '{}'; printf DUMPDATA", marker.display()),
            uploader.clone(),
            lock.clone(),
        );

        let _held = lock.acquire().await;
        let started = std::time::Instant::now();
        let err = pipeline
            .run(&request(Duration::from_millis(200)), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(err.is_deadline_exceeded(), "got {err:?}");
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!marker.exists(), "dump must not start without the lock");
        assert!(uploader.uploads.lock().unwrap().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_cancellation_while_waiting_for_lock() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let marker = dir.path().join("started");
        let uploader = Arc::new(MemoryUploader::default());
        let lock = EngineLock::new(Engine::Postgres);
        let pipeline = script_pipeline(
            &format!("touch '{}'; printf DUMPDATA", marker.display()),
            uploader,
            lock.clone(),
        );
        let cancel = CancellationToken::new();

        let held = lock.acquire().await;
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let err = pipeline
            .run(&request(Duration::from_secs(10)), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::Cancelled { .. }), "got {err:?}");
        assert!(!marker.exists());

        // The waiting run must not have left the lock in a bad state.
        drop(held);
        assert!(
            tokio::time::timeout(Duration::from_millis(100), lock.acquire())
                .await
                .is_ok()
        );
        Ok(())
    }
}
