use crate::snapshot::{LatencySnapshot, StageLatency};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const NUM_HISTOGRAM_BINS: usize = 100;

/// A span of a packet's lifecycle that latency is measured over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PacketStage {
    /// Queued until written to the socket.
    Queue,
    /// Written until the matching response arrived.
    RoundTrip,
    /// Completed until the callback was invoked.
    Dispatch,
    /// Created until the callback was invoked.
    Total,
}

impl PacketStage {
    pub const ALL: [PacketStage; 4] = [
        PacketStage::Queue,
        PacketStage::RoundTrip,
        PacketStage::Dispatch,
        PacketStage::Total,
    ];

    fn index(self) -> usize {
        match self {
            PacketStage::Queue => 0,
            PacketStage::RoundTrip => 1,
            PacketStage::Dispatch => 2,
            PacketStage::Total => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PacketStage::Queue => "queue",
            PacketStage::RoundTrip => "round_trip",
            PacketStage::Dispatch => "dispatch",
            PacketStage::Total => "total",
        }
    }
}

/// Logarithmic histogram for efficient percentile estimation.
///
/// Uses 100 bins covering the latency range from 1μs upward with
/// logarithmic scaling. Each decade is divided into 10 subdivisions.
///
/// # Performance
///
/// - Lock-free design using atomic operations
/// - O(1) recording
/// - O(bins) percentile calculation
/// - Constant memory usage regardless of sample count
///
/// # Accuracy
///
/// Percentiles are approximate (interpolated inside a bin). Resolution is
/// better at lower latencies where precision matters most.
#[derive(Debug)]
struct LatencyHistogram {
    /// Count of samples in each histogram bin
    bins: [AtomicU64; NUM_HISTOGRAM_BINS],
    /// Running sum of all latencies for average calculation
    total_latency: AtomicU64,
    /// Total number of samples recorded
    sample_count: AtomicU64,
}

impl LatencyHistogram {
    fn new() -> Self {
        let bins: [AtomicU64; NUM_HISTOGRAM_BINS] = std::array::from_fn(|_| AtomicU64::new(0));

        Self {
            bins,
            total_latency: AtomicU64::new(0),
            sample_count: AtomicU64::new(0),
        }
    }

    /// Records a latency sample in microseconds.
    fn record(&self, latency_us: u64) {
        let bin = Self::latency_to_bin(latency_us);

        self.bins[bin].fetch_add(1, Ordering::Relaxed);
        self.total_latency.fetch_add(latency_us, Ordering::Relaxed);
        self.sample_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Maps a latency value to a histogram bin.
    ///
    /// Each decade (power of 10) is divided into 10 bins; bin `d*10 + s`
    /// covers `[s * 10^d, (s+1) * 10^d)` for `s >= 1`.
    fn latency_to_bin(latency_us: u64) -> usize {
        if latency_us == 0 {
            return 0;
        }

        let decade = Self::ilog10(latency_us);
        let leading = latency_us / 10u64.pow(decade);
        let bin = decade as usize * 10 + leading.min(9) as usize;

        bin.min(NUM_HISTOGRAM_BINS - 1)
    }

    /// Integer base-10 logarithm.
    ///
    /// Returns floor(log10(n)) for n > 0.
    fn ilog10(mut n: u64) -> u32 {
        if n == 0 {
            return 0;
        }

        let mut log = 0;
        while n >= 10 {
            n /= 10;
            log += 1;
        }
        log
    }

    /// Lower bound of the bin's range.
    fn bin_to_latency(bin: usize) -> u64 {
        if bin == 0 {
            return 1;
        }

        let decade = (bin / 10) as u32;
        let sub_bin = bin % 10;

        10u64
            .checked_pow(decade)
            .map(|base| base.saturating_mul(sub_bin.max(1) as u64))
            .unwrap_or(u64::MAX)
    }

    /// Estimates the value at a given percentile (0-100).
    ///
    /// Uses linear interpolation within bins. Returns 0 if no samples.
    fn estimate_percentile(&self, percentile: u64) -> u64 {
        let total = self.sample_count.load(Ordering::Relaxed);
        if total == 0 {
            return 0;
        }

        let target_count = ((total * percentile) / 100).max(1);
        let mut cumulative_count = 0;

        for (bin_idx, bin) in self.bins.iter().enumerate() {
            let bin_count = bin.load(Ordering::Relaxed);
            if bin_count > 0 && cumulative_count + bin_count >= target_count {
                let bin_start = Self::bin_to_latency(bin_idx);
                let bin_end = Self::bin_to_latency(bin_idx + 1).max(bin_start);

                let offset_in_bin = target_count - cumulative_count;
                let fraction = offset_in_bin as f64 / bin_count as f64;
                let interpolated = bin_start as f64 + fraction * (bin_end - bin_start) as f64;

                return interpolated as u64;
            }
            cumulative_count += bin_count;
        }

        Self::bin_to_latency(NUM_HISTOGRAM_BINS)
    }

    fn summarize(&self) -> StageLatency {
        let count = self.sample_count.load(Ordering::Relaxed);
        if count == 0 {
            return StageLatency::default();
        }

        StageLatency {
            count,
            avg_us: self.total_latency.load(Ordering::Relaxed) / count,
            p50_us: self.estimate_percentile(50),
            p95_us: self.estimate_percentile(95),
            p99_us: self.estimate_percentile(99),
        }
    }
}

/// Per-connection packet latency registry.
///
/// All recording paths are lock-free; a registry can be shared behind an
/// `Arc` between the connection's dispatcher and any reader of snapshots.
#[derive(Debug)]
pub struct LatencyRegistry {
    stages: [LatencyHistogram; 4],
    completed: AtomicU64,
    failed: AtomicU64,
}

impl LatencyRegistry {
    pub fn new() -> Self {
        Self {
            stages: std::array::from_fn(|_| LatencyHistogram::new()),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Records one sample for a stage.
    pub fn record(&self, stage: PacketStage, elapsed: Duration) {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.stages[stage.index()].record(micros);
    }

    /// Counts a finished packet as completed (response) or failed.
    pub fn record_outcome(&self, success: bool) {
        // Relaxed: snapshots are eventually consistent
        if success {
            self.completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> LatencySnapshot {
        let mut snapshot = LatencySnapshot {
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            stages: Default::default(),
        };
        for stage in PacketStage::ALL {
            snapshot
                .stages
                .insert(stage, self.stages[stage.index()].summarize());
        }
        snapshot
    }
}

impl Default for LatencyRegistry {
    fn default() -> Self {
        Self::new()
    }
}
