//! Engine-level instrumentation, registered once per process via
//! `metrics::{counter, gauge, histogram}`. Kept in one place so the naming
//! stays consistent instead of being invented ad hoc at each call site.

use once_cell::sync::Lazy;
use prometheus::{
    Histogram,
    IntCounter,
};

pub static INDEX_SECONDS: Lazy<Histogram> = metrics::histogram!("engine_index_seconds", "time spent in Engine::index");
pub static DELETE_SECONDS: Lazy<Histogram> = metrics::histogram!("engine_delete_seconds", "time spent in Engine::delete");
pub static REFRESH_SECONDS: Lazy<Histogram> = metrics::histogram!("engine_refresh_seconds", "time spent in Engine::refresh");
pub static FLUSH_SECONDS: Lazy<Histogram> = metrics::histogram!("engine_flush_seconds", "time spent in Engine::flush");

pub static VERSION_CONFLICTS_TOTAL: Lazy<IntCounter> =
    metrics::counter!("engine_version_conflicts_total", "writes rejected by an external-version or CAS precondition");
pub static STALE_REPLAYS_TOTAL: Lazy<IntCounter> =
    metrics::counter!("engine_stale_replays_total", "replayed writes dropped as no-ops because they were already applied");
pub static FATAL_FAILURES_TOTAL: Lazy<IntCounter> =
    metrics::counter!("engine_fatal_failures_total", "transitions into the Failed lifecycle state");
pub static COMMITS_TOTAL: Lazy<IntCounter> = metrics::counter!("engine_commits_total", "successful Engine::flush commits");
