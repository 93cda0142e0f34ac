#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Terminal output for the `elementa` CLI.
//!
//! Imports get a cyan records bar and cleanups a red products bar. When
//! stderr is not a terminal the same progress is written as periodic log
//! lines instead. [`init_logger`] keeps log output above any live bars.

use std::io::IsTerminal as _;
use std::sync::Arc;
use std::time::Duration;

use elementa_feed::progress::{LogProgress, ProgressCallback};
use indicatif::{ProgressBar, ProgressStyle};

pub use indicatif::MultiProgress;

/// Units between log lines when progress is logged instead of drawn.
const LOG_EVERY: u64 = 500;

/// What a progress display counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarKind {
    /// Feed records flowing through an import.
    Records,
    /// Products removed (or counted) by a cleanup run.
    Cleanup,
}

impl BarKind {
    const fn color(self) -> &'static str {
        match self {
            Self::Records => "cyan",
            Self::Cleanup => "red",
        }
    }

    fn spinner_style(self) -> ProgressStyle {
        ProgressStyle::with_template(&format!("{{spinner:.{}}} {{msg}}", self.color()))
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
    }

    fn counted_style(self) -> ProgressStyle {
        ProgressStyle::with_template(&format!(
            "  {{msg}} {{wide_bar:.{}/dim}} {{pos}}/{{len}} {{percent}}% [{{eta}}]",
            self.color()
        ))
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("##-")
    }
}

/// Picks the progress sink for `kind`: a bar on a terminal, log lines
/// otherwise.
#[must_use]
pub fn progress(
    multi: &MultiProgress,
    kind: BarKind,
    message: &str,
) -> Arc<dyn ProgressCallback> {
    if std::io::stderr().is_terminal() {
        Arc::new(IndicatifProgress::new(multi, kind, message))
    } else {
        LogProgress::new(message, LOG_EVERY)
    }
}

/// Live bar for one import or cleanup run.
///
/// Spins while the feed is read or the destination listed, then switches
/// to a counted bar once the total is set.
pub struct IndicatifProgress {
    bar: ProgressBar,
    counted: ProgressStyle,
}

impl IndicatifProgress {
    /// Adds a spinner for `kind` to `multi`.
    #[must_use]
    pub fn new(multi: &MultiProgress, kind: BarKind, message: &str) -> Self {
        let bar = multi.add(ProgressBar::new_spinner());
        bar.enable_steady_tick(Duration::from_millis(100));
        bar.set_style(kind.spinner_style());
        bar.set_message(message.to_string());
        Self {
            bar,
            counted: kind.counted_style(),
        }
    }
}

impl ProgressCallback for IndicatifProgress {
    fn set_total(&self, total: u64) {
        self.bar.set_length(total);
        self.bar.set_position(0);
        self.bar.set_style(self.counted.clone());
    }

    fn set_position(&self, pos: u64) {
        self.bar.set_position(pos);
    }

    fn inc(&self, delta: u64) {
        self.bar.inc(delta);
    }

    fn set_message(&self, msg: String) {
        self.bar.set_message(msg);
    }

    fn finish(&self, msg: String) {
        self.bar.finish_with_message(msg);
    }

    fn finish_and_clear(&self) {
        self.bar.finish_and_clear();
    }
}

/// Sets up `pretty_env_logger` from `RUST_LOG`, wrapped so log lines
/// suspend the bars in the returned [`MultiProgress`] while they print.
#[must_use]
pub fn init_logger() -> MultiProgress {
    let multi = MultiProgress::new();

    let logger = pretty_env_logger::formatted_builder()
        .parse_env("RUST_LOG")
        .build();
    let level = logger.filter();

    // A second call (tests) keeps the first logger.
    if indicatif_log_bridge::LogWrapper::new(multi.clone(), logger)
        .try_init()
        .is_ok()
    {
        log::set_max_level(level);
    }

    multi
}

#[cfg(test)]
mod tests {
    use indicatif::ProgressDrawTarget;

    use super::*;

    fn hidden() -> MultiProgress {
        MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
    }

    #[test]
    fn bar_switches_to_counted_style_on_total() {
        let progress = IndicatifProgress::new(&hidden(), BarKind::Cleanup, "Cleaning up");
        assert_eq!(progress.bar.length(), None);

        progress.set_total(40);
        progress.inc(15);
        assert_eq!(progress.bar.length(), Some(40));
        assert_eq!(progress.bar.position(), 15);

        progress.finish("15 deleted".to_string());
        assert!(progress.bar.is_finished());
    }

    #[test]
    fn kinds_use_distinct_colors() {
        assert_ne!(BarKind::Records.color(), BarKind::Cleanup.color());
    }
}
