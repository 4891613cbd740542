//! Thin metrics wrapper around `prometheus`.
//!
//! Mirrors a small slice of the ambient stack every component in this crate
//! was built against: cheap statically-registered counters/histograms,
//! incremented inline, with no exporter wired up here — a host process
//! registers `default_registry()` with whatever scrape endpoint it runs.

mod timer;

pub use once_cell::sync::Lazy;
pub use prometheus::{
    register_histogram,
    register_int_counter,
    register_int_gauge,
    Histogram,
    IntCounter,
    IntGauge,
};
pub use timer::StatusTimer;

/// Register a counter as a static, logging (not panicking) if registration
/// fails because the name collides with an earlier registration — this can
/// happen in tests that construct multiple engines in one process.
///
/// A macro (not a function) because the backing `Lazy<T>` stores its
/// initializer as a bare `fn() -> T`, which only closures with no captures
/// can coerce to; expanding inline keeps `name`/`help` as literals baked
/// into the closure body instead of captured parameters.
#[macro_export]
macro_rules! counter {
    ($name:expr, $help:expr) => {
        $crate::Lazy::new(|| match $crate::register_int_counter!($name, $help) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!("failed to register counter {}: {}", $name, e);
                $crate::IntCounter::new($name, $help)
                    .expect("fallback counter construction cannot fail")
            },
        })
    };
}

#[macro_export]
macro_rules! gauge {
    ($name:expr, $help:expr) => {
        $crate::Lazy::new(|| match $crate::register_int_gauge!($name, $help) {
            Ok(g) => g,
            Err(e) => {
                tracing::warn!("failed to register gauge {}: {}", $name, e);
                $crate::IntGauge::new($name, $help).expect("fallback gauge construction cannot fail")
            },
        })
    };
}

#[macro_export]
macro_rules! histogram {
    ($name:expr, $help:expr) => {
        $crate::Lazy::new(|| match $crate::register_histogram!($name, $help) {
            Ok(h) => h,
            Err(e) => {
                tracing::warn!("failed to register histogram {}: {}", $name, e);
                $crate::Histogram::with_opts(prometheus::HistogramOpts::new($name, $help))
                    .expect("fallback histogram construction cannot fail")
            },
        })
    };
}
