use std::{
    future::Future,
    pin::Pin,
    time::{
        Duration,
        SystemTime,
    },
};

use futures::{
    future::BoxFuture,
    FutureExt,
};
use rand::{
    RngCore,
    SeedableRng,
};

use super::{
    JoinError,
    Runtime,
    SpawnHandle,
};

/// Production [`Runtime`] backed directly by the ambient Tokio executor.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioRuntime;

struct TokioSpawnHandle {
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl SpawnHandle for TokioSpawnHandle {
    fn shutdown(&mut self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }

    fn join(&mut self) -> BoxFuture<'_, Result<(), JoinError>> {
        async move {
            let Some(handle) = self.handle.take() else {
                return Ok(());
            };
            match handle.await {
                Ok(()) => Ok(()),
                Err(e) if e.is_cancelled() => Err(JoinError::Canceled),
                Err(e) => Err(JoinError::Panicked(e.to_string())),
            }
        }
        .boxed()
    }
}

impl Runtime for TokioRuntime {
    fn wait(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(duration))
    }

    fn spawn(
        &self,
        name: &'static str,
        f: impl Future<Output = ()> + Send + 'static,
    ) -> Box<dyn SpawnHandle> {
        let span = tracing::info_span!("background_task", name);
        let handle = tokio::spawn(tracing::Instrument::instrument(f, span));
        Box::new(TokioSpawnHandle {
            handle: Some(handle),
        })
    }

    fn spawn_blocking<F, T>(&self, f: F) -> BoxFuture<'static, anyhow::Result<T>>
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        async move {
            tokio::task::spawn_blocking(f)
                .await
                .map_err(|e| anyhow::anyhow!("blocking task panicked: {e}"))?
        }
        .boxed()
    }

    fn system_time(&self) -> SystemTime {
        SystemTime::now()
    }

    fn monotonic_now(&self) -> tokio::time::Instant {
        tokio::time::Instant::now()
    }

    fn rng(&self) -> Box<dyn RngCore + Send> {
        Box::new(rand::rngs::StdRng::from_os_rng())
    }
}
