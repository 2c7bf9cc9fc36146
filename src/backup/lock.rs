// backman/src/backup/lock.rs
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use super::Engine;

/// Serializes dumps of a single engine type.
///
/// Clones share the same underlying lock, so a pipeline and the scheduler that
/// created it always contend on one instance.
#[derive(Debug, Clone)]
pub struct EngineLock {
    engine: Engine,
    inner: Arc<Mutex<()>>,
}

/// Held for the duration of one pipeline run; dropping it releases the lock.
#[derive(Debug)]
pub struct EngineLockGuard {
    engine: Engine,
    _guard: OwnedMutexGuard<()>,
}

impl EngineLock {
    pub fn new(engine: Engine) -> Self {
        Self {
            engine,
            inner: Arc::new(Mutex::new(())),
        }
    }

    pub fn engine(&self) -> Engine {
        self.engine
    }

    /// Suspends until no other run for this engine holds the lock.
    pub async fn acquire(&self) -> EngineLockGuard {
        debug!(engine = %self.engine, "waiting for engine lock");
        let guard = self.inner.clone().lock_owned().await;
        debug!(engine = %self.engine, "engine lock acquired");
        EngineLockGuard {
            engine: self.engine,
            _guard: guard,
        }
    }
}

impl Drop for EngineLockGuard {
    fn drop(&mut self) {
        debug!(engine = %self.engine, "engine lock released");
    }
}

/// One independent [`EngineLock`] per engine type.
#[derive(Debug, Clone, Default)]
pub struct EngineLocks {
    locks: HashMap<Engine, EngineLock>,
}

impl EngineLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the lock for `engine`, creating it on first use.
    pub fn for_engine(&mut self, engine: Engine) -> EngineLock {
        self.locks
            .entry(engine)
            .or_insert_with(|| EngineLock::new(engine))
            .clone()
    }
}
