//! Background tasks owned by an [`Engine`](crate::Engine): the refresh
//! timer and the async-fsync task (SPEC_FULL §5 "Suspension points"). Both
//! are driven off the injected [`Runtime`] so tests can run them under
//! virtual time instead of real sleeps.

use std::sync::Arc;

use common::{
    runtime::Runtime,
    types::Durability,
};
use errors::ErrorMetadataAnyhowExt;

use crate::Engine;

pub fn start_background_tasks<R: Runtime>(engine: &Arc<Engine<R>>) {
    if let Some(interval) = engine.config.refresh_interval {
        let task_engine = engine.clone();
        let runtime = engine.runtime.clone();
        let handle = runtime.spawn("engine-refresh-timer", async move {
            loop {
                task_engine.runtime.wait(interval).await;
                if let Err(err) = task_engine.refresh() {
                    if err.is_engine_closed() {
                        break;
                    }
                    tracing::warn!(?err, "background refresh failed");
                }
            }
        });
        engine.background.lock().push(handle);
    }

    if matches!(engine.config.translog.durability, Durability::Async) {
        let task_engine = engine.clone();
        let runtime = engine.runtime.clone();
        let interval = engine.config.translog.sync_interval;
        let handle = runtime.spawn("engine-async-fsync", async move {
            loop {
                task_engine.runtime.wait(interval).await;
                if let Err(err) = task_engine.translog.fsync_current_generation() {
                    tracing::warn!(?err, "background fsync failed");
                }
            }
        });
        engine.background.lock().push(handle);
    }
}
