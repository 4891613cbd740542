//! A [`Runtime`] for tests: identical to [`TokioRuntime`] except it uses a
//! seeded RNG so property tests are reproducible from a logged seed, and it
//! expects to run under `#[tokio::test(start_paused = true)]` so tests can
//! advance virtual time with `tokio::time::advance` instead of sleeping in
//! wall-clock time.

use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    time::{
        Duration,
        SystemTime,
    },
};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use rand::{
    RngCore,
    SeedableRng,
};

use super::{
    tokio_runtime::TokioRuntime,
    Runtime,
    SpawnHandle,
};

#[derive(Clone)]
pub struct TestRuntime {
    inner: TokioRuntime,
    rng_seed: Arc<Mutex<rand::rngs::StdRng>>,
}

impl TestRuntime {
    pub fn new(seed: u64) -> Self {
        Self {
            inner: TokioRuntime,
            rng_seed: Arc::new(Mutex::new(rand::rngs::StdRng::seed_from_u64(seed))),
        }
    }
}

impl Default for TestRuntime {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Runtime for TestRuntime {
    fn wait(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        self.inner.wait(duration)
    }

    fn spawn(
        &self,
        name: &'static str,
        f: impl Future<Output = ()> + Send + 'static,
    ) -> Box<dyn SpawnHandle> {
        self.inner.spawn(name, f)
    }

    fn spawn_blocking<F, T>(&self, f: F) -> BoxFuture<'static, anyhow::Result<T>>
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.inner.spawn_blocking(f)
    }

    fn system_time(&self) -> SystemTime {
        self.inner.system_time()
    }

    fn monotonic_now(&self) -> tokio::time::Instant {
        self.inner.monotonic_now()
    }

    fn rng(&self) -> Box<dyn RngCore + Send> {
        let next_seed = self.rng_seed.lock().next_u64();
        Box::new(rand::rngs::StdRng::seed_from_u64(next_seed))
    }
}
