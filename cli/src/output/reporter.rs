//! `CliReporter` — terminal implementation of the core `Reporter` sink.
//!
//! Log lines are timestamped and printed above the progress bar. Lines
//! carrying a replace key are status lines polled repeatedly (firmware
//! status); they render as the bar's live message instead of being
//! appended, which is the terminal rendition of the replace-in-place log
//! contract.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use indicatif::ProgressBar;

use crate::install::Reporter;
use crate::output::progress::BAR_SCALE;

/// How often the bar drifts one step toward the last announced target
/// while no real progress update arrives.
const ANIMATE_INTERVAL: Duration = Duration::from_secs(12);

/// One drift step: 1% of the bar.
const ANIMATE_STEP: u64 = BAR_SCALE / 100;

pub struct CliReporter {
    bar: ProgressBar,
    quiet: bool,
    target: AtomicU64,
}

impl CliReporter {
    #[must_use]
    pub fn new(bar: ProgressBar, quiet: bool) -> Arc<Self> {
        Arc::new(Self {
            bar,
            quiet,
            target: AtomicU64::new(0),
        })
    }

    /// Starts the drift task that animates the bar toward the last
    /// reported target. Abort the handle once the run finishes.
    pub fn spawn_animator(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let reporter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ANIMATE_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let target = reporter.target.load(Ordering::SeqCst);
                let position = reporter.bar.position();
                if position < target {
                    reporter
                        .bar
                        .set_position((position + ANIMATE_STEP).min(target));
                }
            }
        })
    }
}

#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn to_position(fraction: f64) -> u64 {
    (fraction.clamp(0.0, 1.0) * BAR_SCALE as f64).round() as u64
}

impl Reporter for CliReporter {
    fn log(&self, line: &str, replace_key: &str) {
        if self.quiet {
            return;
        }
        if replace_key.is_empty() {
            let stamp = chrono::Local::now().format("%H:%M:%S");
            let formatted = format!("[{stamp}] {line}");
            if self.bar.is_hidden() {
                println!("{formatted}");
            } else {
                self.bar.println(formatted);
            }
        } else if self.bar.is_hidden() {
            // No live bar to carry the replaceable status line; emit the
            // latest value as a plain line instead of dropping it.
            let stamp = chrono::Local::now().format("%H:%M:%S");
            println!("[{stamp}] {line}");
        } else {
            self.bar.set_message(line.to_string());
        }
    }

    fn progress(&self, value: f64, target: f64) {
        self.bar.set_position(to_position(value));
        self.target.store(to_position(target), Ordering::SeqCst);
    }
}
