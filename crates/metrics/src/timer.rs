use std::time::Instant;

use prometheus::Histogram;

/// Times a scope and records the elapsed duration into a histogram on drop,
/// tagging the outcome so slow-path retries don't get averaged in with the
/// common case. Constructed at the top of a function, dropped implicitly at
/// the end (or explicitly via [`StatusTimer::finish`] once the outcome is
/// known).
pub struct StatusTimer<'a> {
    start: Instant,
    histogram: &'a Histogram,
    finished: bool,
}

impl<'a> StatusTimer<'a> {
    pub fn new(histogram: &'a Histogram) -> Self {
        Self {
            start: Instant::now(),
            histogram,
            finished: false,
        }
    }

    pub fn finish(mut self) {
        self.record();
        self.finished = true;
    }

    fn record(&mut self) {
        self.histogram.observe(self.start.elapsed().as_secs_f64());
    }
}

impl Drop for StatusTimer<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.record();
        }
    }
}
