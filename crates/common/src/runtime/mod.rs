//! Runtime trait abstracting the host's task executor, clock, and source of
//! randomness away from the engine's background tasks, so the write path,
//! refresh timer, and tombstone pruner can be exercised under a test runtime
//! without spinning up a real Tokio reactor.

use std::{
    future::Future,
    pin::Pin,
    time::{
        Duration,
        SystemTime,
    },
};

use futures::future::BoxFuture;
use rand::RngCore;
use thiserror::Error;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

mod tokio_runtime;
pub use tokio_runtime::TokioRuntime;

#[derive(Error, Debug)]
pub enum JoinError {
    #[error("task canceled")]
    Canceled,
    #[error("task panicked: {0}")]
    Panicked(String),
}

pub trait SpawnHandle: Send + Sync {
    fn shutdown(&mut self);
    fn join(&mut self) -> BoxFuture<'_, Result<(), JoinError>>;
}

/// Shut down a background task and wait for it to finish, swallowing a
/// `Canceled` result since that's the expected outcome of a clean shutdown.
pub async fn shutdown_and_join(mut handle: Box<dyn SpawnHandle>) -> anyhow::Result<()> {
    handle.shutdown();
    match handle.join().await {
        Ok(()) | Err(JoinError::Canceled) => Ok(()),
        Err(e @ JoinError::Panicked(_)) => Err(e.into()),
    }
}

pub trait Runtime: Clone + Send + Sync + 'static {
    /// Sleep for the given duration. Boxed so the trait stays object-safe
    /// for callers that hold a `Box<dyn Runtime>`.
    fn wait(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>>;

    /// Spawn a future on the runtime's executor.
    fn spawn(
        &self,
        name: &'static str,
        f: impl Future<Output = ()> + Send + 'static,
    ) -> Box<dyn SpawnHandle>;

    /// Run a blocking closure without stalling the async executor. Used by
    /// the write path's fsync calls, which are blocking I/O.
    fn spawn_blocking<F, T>(&self, f: F) -> BoxFuture<'static, anyhow::Result<T>>
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static;

    /// Wall-clock time, potentially virtualized under a test runtime.
    fn system_time(&self) -> SystemTime;

    fn unix_timestamp_millis(&self) -> i64 {
        self.system_time()
            .duration_since(SystemTime::UNIX_EPOCH)
            .expect("system time before unix epoch")
            .as_millis() as i64
    }

    /// A monotonic instant, used for background task cadence rather than
    /// for anything persisted.
    fn monotonic_now(&self) -> tokio::time::Instant;

    fn rng(&self) -> Box<dyn RngCore + Send>;
}
