//! Throughput monitoring and metrics collection.

use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::interval;

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Metrics for a recipe run.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Total bytes received from DAP servers
    pub bytes_read: AtomicU64,

    /// Total uncompressed bytes handed to the Zarr writer
    pub bytes_written: AtomicU64,

    /// Fragments opened (data fetched and decoded)
    pub fragments_opened: AtomicU64,

    /// Fragments written to the target
    pub fragments_written: AtomicU64,

    /// Variables skipped because another fragment writes them
    pub variables_skipped: AtomicU64,

    /// Fragments that failed after all retries
    pub failures: AtomicU64,

    /// Retried attempts
    pub retries: AtomicU64,

    start_time: Option<Instant>,

    // Per-stage timing (in microseconds for precision)
    /// Time spent fetching and decoding (microseconds)
    pub open_us: AtomicU64,

    /// Time spent preprocessing (microseconds)
    pub preprocess_us: AtomicU64,

    /// Time spent writing to Zarr (microseconds)
    pub zarr_write_us: AtomicU64,

    /// DDS/DAS cache hits
    pub metadata_cache_hits: AtomicU64,

    /// DDS/DAS cache misses
    pub metadata_cache_misses: AtomicU64,

    /// Requests that waited on an in-flight metadata fetch
    pub metadata_cache_coalesced: AtomicU64,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        })
    }

    pub fn add_bytes_read(&self, bytes: u64) {
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_bytes_written(&self, bytes: u64) {
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_fragment_opened(&self) {
        self.fragments_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_fragment_written(&self) {
        self.fragments_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_variables_skipped(&self, count: u64) {
        self.variables_skipped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_open_time(&self, duration: Duration) {
        self.open_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn add_preprocess_time(&self, duration: Duration) {
        self.preprocess_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn add_zarr_write_time(&self, duration: Duration) {
        self.zarr_write_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn add_metadata_cache_hit(&self) {
        self.metadata_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_metadata_cache_miss(&self) {
        self.metadata_cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_metadata_cache_coalesced(&self) {
        self.metadata_cache_coalesced.fetch_add(1, Ordering::Relaxed);
    }

    /// Elapsed time since start.
    pub fn elapsed(&self) -> Duration {
        self.start_time.map_or(Duration::ZERO, |t| t.elapsed())
    }

    fn per_second(&self, value: f64) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            value / elapsed
        } else {
            0.0
        }
    }

    /// Read throughput in MB/s.
    pub fn read_throughput_mbps(&self) -> f64 {
        self.per_second(self.bytes_read.load(Ordering::Relaxed) as f64 / (1024.0 * 1024.0))
    }

    /// Written fragments per second.
    pub fn fragments_per_second(&self) -> f64 {
        self.per_second(self.fragments_written.load(Ordering::Relaxed) as f64)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let secs = |us: &AtomicU64| us.load(Ordering::Relaxed) as f64 / 1_000_000.0;

        MetricsSnapshot {
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            fragments_opened: self.fragments_opened.load(Ordering::Relaxed),
            fragments_written: self.fragments_written.load(Ordering::Relaxed),
            variables_skipped: self.variables_skipped.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            elapsed: self.elapsed(),
            read_throughput_mbps: self.read_throughput_mbps(),
            fragments_per_second: self.fragments_per_second(),
            open_secs: secs(&self.open_us),
            preprocess_secs: secs(&self.preprocess_us),
            zarr_write_secs: secs(&self.zarr_write_us),
            metadata_cache_hits: self.metadata_cache_hits.load(Ordering::Relaxed),
            metadata_cache_misses: self.metadata_cache_misses.load(Ordering::Relaxed),
            metadata_cache_coalesced: self.metadata_cache_coalesced.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub fragments_opened: u64,
    pub fragments_written: u64,
    pub variables_skipped: u64,
    pub failures: u64,
    pub retries: u64,
    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Duration,
    pub read_throughput_mbps: f64,
    pub fragments_per_second: f64,
    /// Total time spent fetching and decoding (seconds, summed across tasks)
    pub open_secs: f64,
    /// Total time spent preprocessing (seconds, summed across tasks)
    pub preprocess_secs: f64,
    /// Total time spent writing to Zarr (seconds, summed across tasks)
    pub zarr_write_secs: f64,
    pub metadata_cache_hits: u64,
    pub metadata_cache_misses: u64,
    pub metadata_cache_coalesced: u64,
}

impl MetricsSnapshot {
    /// Save metrics to a JSON file.
    pub fn save_to_file(&self, path: &str) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!("Metrics saved to {}", path);
        Ok(())
    }

    fn metadata_hit_rate(&self) -> f64 {
        let total = self.metadata_cache_hits + self.metadata_cache_misses + self.metadata_cache_coalesced;
        if total > 0 {
            (self.metadata_cache_hits + self.metadata_cache_coalesced) as f64 / total as f64 * 100.0
        } else {
            0.0
        }
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let total_stage_time = self.open_secs + self.preprocess_secs + self.zarr_write_secs;
        let pct = |secs: f64| {
            if total_stage_time > 0.0 {
                secs / total_stage_time * 100.0
            } else {
                0.0
            }
        };

        write!(
            f,
            "Fragments: {} opened, {} written | Read: {:.2} GB @ {:.1} MB/s | \
             Written: {:.2} GB | Rate: {:.2} fragments/s | Failures: {} | Retries: {} | \
             Elapsed: {:.1}s | Time: open {:.0}% preprocess {:.0}% zarr {:.0}% | \
             Cache: meta {:.0}%",
            self.fragments_opened,
            self.fragments_written,
            self.bytes_read as f64 / GIB,
            self.read_throughput_mbps,
            self.bytes_written as f64 / GIB,
            self.fragments_per_second,
            self.failures,
            self.retries,
            self.elapsed.as_secs_f64(),
            pct(self.open_secs),
            pct(self.preprocess_secs),
            pct(self.zarr_write_secs),
            self.metadata_hit_rate(),
        )
    }
}

/// Periodic metrics reporter.
pub struct MetricsReporter {
    metrics: Arc<Metrics>,
    interval_secs: u64,
    total_fragments: u64,
}

impl MetricsReporter {
    pub fn new(metrics: Arc<Metrics>, interval_secs: u64, total_fragments: u64) -> Self {
        Self {
            metrics,
            interval_secs: interval_secs.max(1),
            total_fragments,
        }
    }

    /// Log progress every interval until `shutdown` fires.
    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) {
        let mut ticker = interval(Duration::from_secs(self.interval_secs));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = self.metrics.snapshot();
                    let progress = if self.total_fragments > 0 {
                        (snapshot.fragments_written + snapshot.failures) as f64
                            / self.total_fragments as f64
                            * 100.0
                    } else {
                        0.0
                    };

                    tracing::info!("[{:.1}%] {}", progress, snapshot);
                }
                _ = shutdown.recv() => {
                    let snapshot = self.metrics.snapshot();
                    tracing::info!("Final: {}", snapshot);
                    break;
                }
            }
        }
    }

    /// Print a final summary.
    pub fn print_summary(&self) {
        let snapshot = self.metrics.snapshot();

        println!("\n=== Recipe Summary ===");
        println!("Total time: {:.1}s", snapshot.elapsed.as_secs_f64());
        println!("Fragments opened: {}", snapshot.fragments_opened);
        println!("Fragments written: {}", snapshot.fragments_written);
        println!("Variables skipped: {}", snapshot.variables_skipped);
        println!("Data read: {:.2} GB", snapshot.bytes_read as f64 / GIB);
        println!("Data written: {:.2} GB", snapshot.bytes_written as f64 / GIB);
        println!("Read throughput: {:.1} MB/s", snapshot.read_throughput_mbps);
        println!("Failures: {}", snapshot.failures);
        println!("Retries: {}", snapshot.retries);

        let total_stage = snapshot.open_secs + snapshot.preprocess_secs + snapshot.zarr_write_secs;
        if total_stage > 0.0 {
            println!("\n--- Stage Time Breakdown ---");
            println!("Open:        {:>7.1}s ({:>5.1}%)", snapshot.open_secs, snapshot.open_secs / total_stage * 100.0);
            println!("Preprocess:  {:>7.1}s ({:>5.1}%)", snapshot.preprocess_secs, snapshot.preprocess_secs / total_stage * 100.0);
            println!("Zarr write:  {:>7.1}s ({:>5.1}%)", snapshot.zarr_write_secs, snapshot.zarr_write_secs / total_stage * 100.0);
        }

        let metadata_total =
            snapshot.metadata_cache_hits + snapshot.metadata_cache_misses + snapshot.metadata_cache_coalesced;
        if metadata_total > 0 {
            println!("\n--- Cache Statistics ---");
            println!(
                "Metadata cache: {} hits, {} misses, {} coalesced ({:.1}% effective hit rate)",
                snapshot.metadata_cache_hits,
                snapshot.metadata_cache_misses,
                snapshot.metadata_cache_coalesced,
                snapshot.metadata_hit_rate()
            );
        }
        println!("======================\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_snapshot() -> MetricsSnapshot {
        Metrics::default().snapshot()
    }

    #[test]
    fn test_metrics_increment() {
        let metrics = Metrics::new();

        metrics.add_bytes_read(1000);
        metrics.add_bytes_read(500);

        assert_eq!(metrics.bytes_read.load(Ordering::Relaxed), 1500);
    }

    #[test]
    fn test_all_counters() {
        let metrics = Metrics::new();

        metrics.add_bytes_read(1024);
        metrics.add_bytes_written(2048);
        metrics.add_fragment_opened();
        metrics.add_fragment_written();
        metrics.add_fragment_written();
        metrics.add_variables_skipped(3);
        metrics.add_failure();
        metrics.add_retry();
        metrics.add_metadata_cache_hit();
        metrics.add_metadata_cache_miss();
        metrics.add_metadata_cache_coalesced();

        let snapshot = metrics.snapshot();

        assert_eq!(snapshot.bytes_read, 1024);
        assert_eq!(snapshot.bytes_written, 2048);
        assert_eq!(snapshot.fragments_opened, 1);
        assert_eq!(snapshot.fragments_written, 2);
        assert_eq!(snapshot.variables_skipped, 3);
        assert_eq!(snapshot.failures, 1);
        assert_eq!(snapshot.retries, 1);
        assert_eq!(snapshot.metadata_cache_hits, 1);
        assert_eq!(snapshot.metadata_cache_misses, 1);
        assert_eq!(snapshot.metadata_cache_coalesced, 1);
    }

    #[test]
    fn test_timing_metrics() {
        let metrics = Metrics::new();

        metrics.add_open_time(Duration::from_millis(100));
        metrics.add_preprocess_time(Duration::from_millis(50));
        metrics.add_zarr_write_time(Duration::from_millis(75));

        let snapshot = metrics.snapshot();

        assert!((snapshot.open_secs - 0.1).abs() < 0.001);
        assert!((snapshot.preprocess_secs - 0.05).abs() < 0.001);
        assert!((snapshot.zarr_write_secs - 0.075).abs() < 0.001);
    }

    #[test]
    fn test_snapshot_display() {
        let snapshot = MetricsSnapshot {
            fragments_opened: 12,
            fragments_written: 10,
            failures: 2,
            metadata_cache_hits: 60,
            metadata_cache_misses: 20,
            metadata_cache_coalesced: 20,
            elapsed: Duration::from_secs(10),
            ..empty_snapshot()
        };

        let display = format!("{}", snapshot);

        assert!(display.contains("12 opened"));
        assert!(display.contains("10 written"));
        assert!(display.contains("Failures: 2"));
        assert!(display.contains("meta 80%"));
    }

    #[test]
    fn test_zero_elapsed_no_panic() {
        let metrics = Metrics::default();
        metrics.add_bytes_read(1000);

        assert_eq!(metrics.read_throughput_mbps(), 0.0);
        assert_eq!(metrics.fragments_per_second(), 0.0);
    }

    #[test]
    fn test_snapshot_serializes_elapsed_as_seconds() {
        let snapshot = MetricsSnapshot {
            elapsed: Duration::from_millis(1500),
            ..empty_snapshot()
        };
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["elapsed"], serde_json::json!(1.5));
    }

    #[test]
    fn test_metrics_reporter_new() {
        let reporter = MetricsReporter::new(Metrics::new(), 0, 24);

        assert_eq!(reporter.interval_secs, 1);
        assert_eq!(reporter.total_fragments, 24);
    }
}
