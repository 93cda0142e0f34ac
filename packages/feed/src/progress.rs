//! Progress sinks for imports and cleanups.
//!
//! An import reports one unit per feed record; a cleanup reports one unit
//! per product deleted (or counted, on a dry run). The CLI renders these as
//! `indicatif` bars on a terminal and as [`LogProgress`] lines otherwise.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Sink for record and product counts. Shared between the importer and its
/// chunk workers, hence `Send + Sync`.
pub trait ProgressCallback: Send + Sync {
    /// Records in the feed, or products matched by a cleanup.
    fn set_total(&self, total: u64);

    /// Jumps to `pos` units done.
    fn set_position(&self, pos: u64);

    /// `delta` more units done.
    fn inc(&self, delta: u64);

    /// Short status, e.g. the listing page being fetched.
    fn set_message(&self, msg: String);

    /// Run ended; `msg` summarizes its counters.
    fn finish(&self, msg: String);

    /// Run ended without a summary (failed or cancelled).
    fn finish_and_clear(&self);
}

/// Sink for library callers and tests.
pub struct NullProgress;

impl ProgressCallback for NullProgress {
    fn set_total(&self, _total: u64) {}
    fn set_position(&self, _pos: u64) {}
    fn inc(&self, _delta: u64) {}
    fn set_message(&self, _msg: String) {}
    fn finish(&self, _msg: String) {}
    fn finish_and_clear(&self) {}
}

/// Sink used until a caller attaches one.
#[must_use]
pub fn null_progress() -> Arc<dyn ProgressCallback> {
    Arc::new(NullProgress)
}

/// Logs `label: done/total` each time another `every` units complete.
///
/// Used when stderr is not a terminal (cron jobs, CI logs).
pub struct LogProgress {
    label: String,
    every: u64,
    total: AtomicU64,
    position: AtomicU64,
}

impl LogProgress {
    /// Creates a sink logging under `label` every `every` units.
    #[must_use]
    pub fn new(label: &str, every: u64) -> Arc<dyn ProgressCallback> {
        Arc::new(Self::with_label(label, every))
    }

    fn with_label(label: &str, every: u64) -> Self {
        Self {
            label: label.to_string(),
            every: every.max(1),
            total: AtomicU64::new(0),
            position: AtomicU64::new(0),
        }
    }

    /// Whether moving from `before` to `after` crosses a logging boundary.
    const fn crosses(&self, before: u64, after: u64) -> bool {
        after / self.every > before / self.every
    }
}

impl ProgressCallback for LogProgress {
    fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::Relaxed);
    }

    fn set_position(&self, pos: u64) {
        self.position.store(pos, Ordering::Relaxed);
    }

    fn inc(&self, delta: u64) {
        let before = self.position.fetch_add(delta, Ordering::Relaxed);
        let after = before + delta;
        if self.crosses(before, after) {
            let total = self.total.load(Ordering::Relaxed);
            if total > 0 {
                log::info!("{}: {after}/{total}", self.label);
            } else {
                log::info!("{}: {after}", self.label);
            }
        }
    }

    fn set_message(&self, msg: String) {
        log::debug!("{}: {msg}", self.label);
    }

    fn finish(&self, msg: String) {
        log::info!("{}: {msg}", self.label);
    }

    fn finish_and_clear(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_progress_tracks_position() {
        let progress = LogProgress::with_label("Importing", 10);
        progress.set_total(25);
        progress.inc(4);
        progress.inc(4);
        assert_eq!(progress.position.load(Ordering::Relaxed), 8);

        progress.set_position(20);
        progress.inc(5);
        assert_eq!(progress.position.load(Ordering::Relaxed), 25);
        assert_eq!(progress.total.load(Ordering::Relaxed), 25);
    }

    #[test]
    fn log_progress_logs_on_each_boundary() {
        let progress = LogProgress::with_label("Cleaning up", 10);
        assert!(!progress.crosses(0, 9));
        assert!(progress.crosses(9, 10));
        assert!(progress.crosses(5, 25));
        assert!(!progress.crosses(10, 19));
    }

    #[test]
    fn zero_interval_logs_every_unit() {
        let progress = LogProgress::with_label("Importing", 0);
        assert!(progress.crosses(0, 1));
        assert!(progress.crosses(1, 2));
    }
}
