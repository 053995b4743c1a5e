//! Run-wide counters and the periodic stats block.

use std::fmt;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::pool::UniqueIps;

const BAR_TEMPLATE: &str =
    "Processing: {pos} / {len} [{bar:40.cyan/blue}] {percent}% ({elapsed_precise}, eta {eta})";
const SPINNER_TEMPLATE: &str = "{spinner:.green} Processing: {pos} ({per_sec})";

/// Counters shared by every validator, lane and the reporter.
///
/// Everything is monotonic except `requests_this_window`, which the reporter
/// resets at the end of each rate window. The progress counter also drives
/// the progress bar.
pub struct Stats {
    total_requests: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    proxy_successes: AtomicU64,
    proxy_failures: AtomicU64,
    requests_this_window: AtomicU64,
    issued: AtomicU64,
    progress: AtomicU64,
    bar: ProgressBar,
}

impl Default for Stats {
    fn default() -> Self {
        Self::with_progress(ProgressBar::hidden())
    }
}

impl Stats {
    /// Counters without a visible progress bar.
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters whose progress advances `bar`.
    pub fn with_progress(bar: ProgressBar) -> Self {
        Self {
            total_requests: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            proxy_successes: AtomicU64::new(0),
            proxy_failures: AtomicU64::new(0),
            requests_this_window: AtomicU64::new(0),
            issued: AtomicU64::new(0),
            progress: AtomicU64::new(0),
            bar,
        }
    }

    /// A request is about to be sent.
    pub fn on_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.requests_this_window.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// A proxy passed validation and was admitted. Returns the new total.
    pub fn on_proxy_success(&self) -> u64 {
        self.proxy_successes.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn on_proxy_failure(&self) {
        self.proxy_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Advance the progress counter by one attempt.
    pub fn advance_progress(&self) {
        self.progress.fetch_add(1, Ordering::Relaxed);
        self.bar.inc(1);
    }

    /// Add a finished batch to the issued-request total. Returns the new total.
    pub fn add_issued(&self, batch: u64) -> u64 {
        self.issued.fetch_add(batch, Ordering::AcqRel) + batch
    }

    pub fn proxy_successes(&self) -> u64 {
        self.proxy_successes.load(Ordering::Acquire)
    }

    pub fn issued(&self) -> u64 {
        self.issued.load(Ordering::Acquire)
    }

    pub fn progress(&self) -> u64 {
        self.progress.load(Ordering::Relaxed)
    }

    pub fn progress_bar(&self) -> &ProgressBar {
        &self.bar
    }

    /// Zero the per-window request counter.
    pub fn reset_window(&self) {
        self.requests_this_window.store(0, Ordering::Relaxed);
    }

    /// Read every counter. Values are individually consistent, not as a group.
    pub fn snapshot(&self, unique_ips: usize) -> Snapshot {
        Snapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            proxy_successes: self.proxy_successes.load(Ordering::Relaxed),
            proxy_failures: self.proxy_failures.load(Ordering::Relaxed),
            unique_ips,
            requests_per_minute: self.requests_this_window.load(Ordering::Relaxed),
            issued: self.issued.load(Ordering::Relaxed),
            progress: self.progress.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Snapshot {
    pub total_requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub proxy_successes: u64,
    pub proxy_failures: u64,
    pub unique_ips: usize,
    pub requests_per_minute: u64,
    pub issued: u64,
    pub progress: u64,
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "--- STATS ---")?;
        writeln!(f, "Total requests: {}", self.total_requests)?;
        writeln!(f, "Success count: {}", self.successes)?;
        writeln!(f, "Failure count: {}", self.failures)?;
        writeln!(f, "Successful proxy connections: {}", self.proxy_successes)?;
        writeln!(f, "Failed proxy connections: {}", self.proxy_failures)?;
        writeln!(f, "Unique IPs: {}", self.unique_ips)?;
        writeln!(f, "Requests per minute: {}", self.requests_per_minute)?;
        write!(f, "-------------")
    }
}

/// Progress bar for a run: `total` attempts in bounded mode, a spinner counting
/// attempts when the run has no end.
pub fn progress_bar(total: Option<u64>) -> ProgressBar {
    match total {
        Some(total) => {
            let bar = ProgressBar::new(total);
            bar.set_style(
                ProgressStyle::with_template(BAR_TEMPLATE)
                    .map(|style| style.progress_chars("=> "))
                    .unwrap_or_else(|_| ProgressStyle::default_bar()),
            );
            bar
        }
        None => {
            let bar = ProgressBar::new_spinner();
            bar.set_style(
                ProgressStyle::with_template(SPINNER_TEMPLATE)
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            bar.enable_steady_tick(Duration::from_millis(100));
            bar
        }
    }
}

/// Spawn the reporter that prints a snapshot every `interval` and resets the
/// per-minute counter every `window`. It runs until aborted.
///
/// The progress bar is hidden while the block is written so the two do not
/// interleave.
pub fn spawn_reporter(
    stats: Arc<Stats>,
    unique_ips: Arc<UniqueIps>,
    interval: Duration,
    window: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut window_ticker = time::interval_at(time::Instant::now() + window, window);
        window_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = stats.snapshot(unique_ips.len());
                    stats.progress_bar().suspend(|| {
                        let _ = writeln!(std::io::stdout().lock(), "\n{snapshot}");
                    });
                }
                _ = window_ticker.tick() => {
                    stats.reset_window();
                }
            }
        }
    })
}
