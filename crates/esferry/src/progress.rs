//! Run-wide counters and their terminal rendering.
//!
//! Counters are plain atomics shared by every task; correctness never
//! depends on them. A separate reporter task samples them into progress bars.

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// How often the reporter samples the counters.
pub const REPORT_INTERVAL: Duration = Duration::from_millis(200);

/// Shared progress counters.
#[derive(Debug, Default)]
pub struct Progress {
    scroll_total: AtomicU64,
    scrolled: AtomicU64,
    written: AtomicU64,
    bulk_requests: AtomicU64,
    failed_batches: AtomicU64,
    failed_items: AtomicU64,
    malformed: AtomicU64,
}

/// A point-in-time copy of [`Progress`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    /// Sum of the hit totals reported by every slice.
    pub scroll_total: u64,
    /// Documents pulled from the source.
    pub scrolled: u64,
    /// Documents sent to the destination (bulk or file).
    pub written: u64,
    /// Bulk requests sent.
    pub bulk_requests: u64,
    /// Bulk requests that failed outright.
    pub failed_batches: u64,
    /// Items the destination reported as failed inside otherwise successful requests.
    pub failed_items: u64,
    /// Documents that stopped a worker because required fields were missing.
    pub malformed: u64,
}

impl Progress {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Adds a slice's hit total.
    pub fn add_scroll_total(&self, n: u64) {
        self.scroll_total.fetch_add(n, Ordering::Relaxed);
    }

    /// Counts documents pulled from the source.
    pub fn add_scrolled(&self, n: u64) {
        self.scrolled.fetch_add(n, Ordering::Relaxed);
    }

    /// Counts documents written to the destination.
    pub fn add_written(&self, n: u64) {
        self.written.fetch_add(n, Ordering::Relaxed);
    }

    /// Counts one bulk request.
    pub fn inc_bulk_requests(&self) {
        self.bulk_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one failed bulk request.
    pub fn inc_failed_batches(&self) {
        self.failed_batches.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts failed items of a bulk response.
    pub fn add_failed_items(&self, n: u64) {
        self.failed_items.fetch_add(n, Ordering::Relaxed);
    }

    /// Counts a malformed document.
    pub fn inc_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    /// Reads every counter.
    #[must_use]
    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            scroll_total: self.scroll_total.load(Ordering::Relaxed),
            scrolled: self.scrolled.load(Ordering::Relaxed),
            written: self.written.load(Ordering::Relaxed),
            bulk_requests: self.bulk_requests.load(Ordering::Relaxed),
            failed_batches: self.failed_batches.load(Ordering::Relaxed),
            failed_items: self.failed_items.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
        }
    }
}

fn create_progress_bar(multi: &MultiProgress, label: &'static str) -> ProgressBar {
    let pb = multi.add(ProgressBar::new(0));
    pb.set_style(
        ProgressStyle::default_bar()
            .template(
                "{prefix:>6} {spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec}, {eta})",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    pb.set_prefix(label);
    pb
}

/// Background task drawing the counters.
pub struct ProgressReporter {
    stop: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressReporter {
    /// Starts drawing `progress`. When `enabled` is false nothing is drawn.
    ///
    /// `output_label` names the second bar ("Bulk" or "Output").
    #[must_use]
    pub fn start(progress: Arc<Progress>, enabled: bool, output_label: &'static str) -> Self {
        if !enabled {
            return Self {
                stop: None,
                handle: None,
            };
        }

        let (stop, mut stopped) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let multi = MultiProgress::new();
            let scroll_bar = create_progress_bar(&multi, "Scroll");
            let output_bar = create_progress_bar(&multi, output_label);
            let mut ticker = tokio::time::interval(REPORT_INTERVAL);

            let draw = |snapshot: ProgressSnapshot| {
                scroll_bar.set_length(snapshot.scroll_total.max(snapshot.scrolled));
                scroll_bar.set_position(snapshot.scrolled);
                output_bar.set_length(snapshot.scroll_total.max(snapshot.written));
                output_bar.set_position(snapshot.written);
            };

            loop {
                tokio::select! {
                    _ = ticker.tick() => draw(progress.snapshot()),
                    _ = &mut stopped => break,
                }
            }

            draw(progress.snapshot());
            scroll_bar.finish();
            output_bar.finish();
        });

        Self {
            stop: Some(stop),
            handle: Some(handle),
        }
    }

    /// Draws the final state and stops the task.
    pub async fn finish(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let progress = Progress::new();
        progress.add_scroll_total(10);
        progress.add_scroll_total(5);
        progress.add_scrolled(3);
        progress.add_written(2);
        progress.inc_bulk_requests();
        progress.inc_failed_batches();
        progress.add_failed_items(4);
        progress.inc_malformed();

        let snapshot = progress.snapshot();

        assert_eq!(snapshot.scroll_total, 15);
        assert_eq!(snapshot.scrolled, 3);
        assert_eq!(snapshot.written, 2);
        assert_eq!(snapshot.bulk_requests, 1);
        assert_eq!(snapshot.failed_batches, 1);
        assert_eq!(snapshot.failed_items, 4);
        assert_eq!(snapshot.malformed, 1);
    }

    #[tokio::test]
    async fn test_disabled_reporter_finishes_immediately() {
        let reporter = ProgressReporter::start(Progress::new(), false, "Bulk");
        reporter.finish().await;
    }

    #[tokio::test]
    async fn test_enabled_reporter_stops_on_finish() {
        let progress = Progress::new();
        let reporter = ProgressReporter::start(progress.clone(), true, "Output");
        progress.add_scrolled(1);
        reporter.finish().await;
    }
}
