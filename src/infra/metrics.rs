//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! All counter updates are lock-free; reporting is the only operation
//! that needs synchronization (via atomic swap).
//!
//! NOTE: All atomics use Relaxed ordering intentionally—these are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Lock cycle duration bucket boundaries (milliseconds)
/// Buckets: ≤250, ≤500, ≤1000, ≤2000, ≤4000, ≤8000, ≤16000, ≤32000, ≤64000, ≤128000, >128000
const CYCLE_MS_BOUNDS: [u64; 10] = [250, 500, 1000, 2000, 4000, 8000, 16000, 32000, 64000, 128000];
const NUM_BUCKETS: usize = 11;

/// Compute bucket index for a cycle duration using binary search
#[inline]
fn bucket_index(duration_ms: u64) -> usize {
    CYCLE_MS_BOUNDS.partition_point(|&bound| bound < duration_ms)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

/// Load all bucket values without resetting
#[inline]
fn load_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.load(Ordering::Relaxed);
    }
    result
}

/// Lock-free metrics collector
///
/// All recording operations are lock-free using atomics.
/// Counters are monotonic; `report()` swaps only the per-interval rate
/// counters so the periodic log shows activity since the last report.
pub struct Metrics {
    /// Qualifying triggers observed (monotonic)
    triggers_total: AtomicU64,
    /// Countdowns armed from Idle (monotonic)
    countdowns_started: AtomicU64,
    /// Countdowns re-armed by a trigger mid-countdown (monotonic)
    countdowns_restarted: AtomicU64,
    /// Countdowns cancelled before expiry (monotonic)
    countdowns_cancelled: AtomicU64,
    /// Lock cycles started (monotonic)
    lock_cycles_total: AtomicU64,
    /// Individual lock attempts inside cycles (monotonic)
    lock_attempts_total: AtomicU64,
    /// Attempts that failed sending the lock command (monotonic)
    lock_call_failures: AtomicU64,
    /// Attempts where the device never reported locked (monotonic)
    verification_failures: AtomicU64,
    /// Cycles that ended with a verified lock (monotonic)
    locks_verified_total: AtomicU64,
    /// Cycles that exhausted their retry budget (monotonic)
    retries_exhausted_total: AtomicU64,
    /// Failure notifications delivered on at least one channel (monotonic)
    notifications_sent: AtomicU64,
    /// Failure notifications that failed on every channel (monotonic)
    notifications_failed: AtomicU64,
    /// MQTT events received (before try_send) (monotonic)
    mqtt_events_received: AtomicU64,
    /// MQTT events dropped due to channel full (monotonic)
    mqtt_events_dropped: AtomicU64,
    /// Service commands received over MQTT or HTTP (monotonic)
    commands_received: AtomicU64,
    /// Lock cycle duration histogram (ms, cumulative)
    cycle_duration_buckets: [AtomicU64; NUM_BUCKETS],
    /// Sum of cycle durations (ms, cumulative)
    cycle_duration_sum_ms: AtomicU64,
    /// Max cycle duration (ms, reset on report)
    cycle_duration_max_ms: AtomicU64,
    /// Events since last report (reset on report)
    events_since_report: AtomicU64,
    /// Last report time (only accessed from reporter, not atomic)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            triggers_total: AtomicU64::new(0),
            countdowns_started: AtomicU64::new(0),
            countdowns_restarted: AtomicU64::new(0),
            countdowns_cancelled: AtomicU64::new(0),
            lock_cycles_total: AtomicU64::new(0),
            lock_attempts_total: AtomicU64::new(0),
            lock_call_failures: AtomicU64::new(0),
            verification_failures: AtomicU64::new(0),
            locks_verified_total: AtomicU64::new(0),
            retries_exhausted_total: AtomicU64::new(0),
            notifications_sent: AtomicU64::new(0),
            notifications_failed: AtomicU64::new(0),
            mqtt_events_received: AtomicU64::new(0),
            mqtt_events_dropped: AtomicU64::new(0),
            commands_received: AtomicU64::new(0),
            cycle_duration_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            cycle_duration_sum_ms: AtomicU64::new(0),
            cycle_duration_max_ms: AtomicU64::new(0),
            events_since_report: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    #[inline]
    pub fn record_trigger(&self) {
        self.triggers_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_countdown_started(&self) {
        self.countdowns_started.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_countdown_restarted(&self) {
        self.countdowns_restarted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_countdown_cancelled(&self) {
        self.countdowns_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_lock_cycle_started(&self) {
        self.lock_cycles_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_lock_attempt(&self) {
        self.lock_attempts_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_lock_call_failure(&self) {
        self.lock_call_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_verification_failure(&self) {
        self.verification_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_lock_verified(&self) {
        self.locks_verified_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_retries_exhausted(&self) {
        self.retries_exhausted_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_notification(&self, delivered: bool) {
        if delivered {
            self.notifications_sent.fetch_add(1, Ordering::Relaxed);
        } else {
            self.notifications_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record an MQTT event received (lock-free)
    #[inline]
    pub fn record_mqtt_event(&self) {
        self.mqtt_events_received.fetch_add(1, Ordering::Relaxed);
        self.events_since_report.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an MQTT event dropped due to channel full (lock-free)
    #[inline]
    pub fn record_mqtt_event_dropped(&self) {
        self.mqtt_events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_command_received(&self) {
        self.commands_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record how long a complete lock cycle took, attempt start to outcome
    #[inline]
    pub fn record_cycle_duration(&self, duration_ms: u64) {
        let bucket = bucket_index(duration_ms);
        self.cycle_duration_buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.cycle_duration_sum_ms.fetch_add(duration_ms, Ordering::Relaxed);
        update_atomic_max(&self.cycle_duration_max_ms, duration_ms);
    }

    #[inline]
    #[allow(dead_code)]
    pub fn triggers_total(&self) -> u64 {
        self.triggers_total.load(Ordering::Relaxed)
    }

    #[inline]
    #[allow(dead_code)]
    pub fn mqtt_events_dropped(&self) -> u64 {
        self.mqtt_events_dropped.load(Ordering::Relaxed)
    }

    /// Calculate and return metrics summary, resetting rate counters
    ///
    /// Monotonic counters are read without reset, so the Prometheus
    /// endpoint and the periodic log reporter can both call this.
    pub fn report(&self) -> MetricsSummary {
        let events_count = self.events_since_report.swap(0, Ordering::Relaxed);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let events_per_sec = if elapsed.as_secs_f64() > 0.0 {
            events_count as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        let cycle_duration_buckets = load_buckets(&self.cycle_duration_buckets);
        let cycle_count: u64 = cycle_duration_buckets.iter().sum();
        let cycle_duration_sum = self.cycle_duration_sum_ms.load(Ordering::Relaxed);
        let cycle_duration_avg_ms =
            if cycle_count > 0 { cycle_duration_sum / cycle_count } else { 0 };
        let cycle_duration_max_ms = self.cycle_duration_max_ms.swap(0, Ordering::Relaxed);

        MetricsSummary {
            triggers_total: self.triggers_total.load(Ordering::Relaxed),
            countdowns_started: self.countdowns_started.load(Ordering::Relaxed),
            countdowns_restarted: self.countdowns_restarted.load(Ordering::Relaxed),
            countdowns_cancelled: self.countdowns_cancelled.load(Ordering::Relaxed),
            lock_cycles_total: self.lock_cycles_total.load(Ordering::Relaxed),
            lock_attempts_total: self.lock_attempts_total.load(Ordering::Relaxed),
            lock_call_failures: self.lock_call_failures.load(Ordering::Relaxed),
            verification_failures: self.verification_failures.load(Ordering::Relaxed),
            locks_verified_total: self.locks_verified_total.load(Ordering::Relaxed),
            retries_exhausted_total: self.retries_exhausted_total.load(Ordering::Relaxed),
            notifications_sent: self.notifications_sent.load(Ordering::Relaxed),
            notifications_failed: self.notifications_failed.load(Ordering::Relaxed),
            mqtt_events_received: self.mqtt_events_received.load(Ordering::Relaxed),
            mqtt_events_dropped: self.mqtt_events_dropped.load(Ordering::Relaxed),
            commands_received: self.commands_received.load(Ordering::Relaxed),
            cycle_duration_buckets,
            cycle_duration_avg_ms,
            cycle_duration_max_ms,
            events_per_sec,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of histogram buckets (exported for the HTTP endpoint)
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

/// Exported bucket bounds for Prometheus formatting
pub const METRICS_CYCLE_MS_BOUNDS: [u64; 10] = CYCLE_MS_BOUNDS;

#[derive(Debug)]
pub struct MetricsSummary {
    pub triggers_total: u64,
    pub countdowns_started: u64,
    pub countdowns_restarted: u64,
    pub countdowns_cancelled: u64,
    pub lock_cycles_total: u64,
    pub lock_attempts_total: u64,
    pub lock_call_failures: u64,
    pub verification_failures: u64,
    pub locks_verified_total: u64,
    pub retries_exhausted_total: u64,
    pub notifications_sent: u64,
    pub notifications_failed: u64,
    pub mqtt_events_received: u64,
    pub mqtt_events_dropped: u64,
    pub commands_received: u64,
    /// Lock cycle duration histogram buckets (ms)
    /// Bounds: ≤250, ≤500, ≤1000, ..., ≤128000, >128000 ms
    pub cycle_duration_buckets: [u64; NUM_BUCKETS],
    /// Average lock cycle duration (ms)
    pub cycle_duration_avg_ms: u64,
    /// Max lock cycle duration since last report (ms)
    pub cycle_duration_max_ms: u64,
    /// MQTT events per second since last report
    pub events_per_sec: f64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            triggers = %self.triggers_total,
            countdowns = %self.countdowns_started,
            cancelled = %self.countdowns_cancelled,
            cycles = %self.lock_cycles_total,
            verified = %self.locks_verified_total,
            exhausted = %self.retries_exhausted_total,
            events_per_sec = format!("{:.1}", self.events_per_sec),
            mqtt_dropped = %self.mqtt_events_dropped,
            cycle_avg_ms = %self.cycle_duration_avg_ms,
            "metrics"
        );
    }
}
