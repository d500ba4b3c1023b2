//! Per-step throughput control: token-bucket rate limiting, sliding
//! error-rate tracking, and the drain strategy applied when a step's
//! error rate crosses its configured threshold.
//!
//! Each step owns exactly one controller instance, shared by the step's
//! concurrent workers; nothing is shared across steps.

#![allow(clippy::cast_precision_loss)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use batchflow_types::definition::{DrainStrategy, ThroughputConfig};

const BACKOFF_BASE_MS: u64 = 100;
const BACKOFF_MAX_MS: u64 = 30_000;
const QUEUE_POLL_MS: u64 = 50;

/// Outcome of asking to admit a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Chunk may execute now.
    Proceed,
    /// Drain strategy SHED is active: the chunk must not execute.
    Shed,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

struct WindowEntry {
    at: Instant,
    total: u64,
    errors: u64,
}

/// Rate limiter + error-rate trip wire for one step.
pub struct ThroughputController {
    /// Token refill rate in records per second (None = unlimited).
    rate: Option<f64>,
    /// Burst capacity: one batch worth of records.
    capacity: f64,
    bucket: Mutex<Bucket>,
    window: Mutex<VecDeque<WindowEntry>>,
    threshold: Option<f64>,
    interval: Duration,
    drain_strategy: DrainStrategy,
    backoff_level: AtomicU32,
    queued: AtomicUsize,
    queue_capacity: usize,
}

impl ThroughputController {
    #[must_use]
    pub fn new(config: &ThroughputConfig) -> Self {
        let rate = config.rate_limit_rps.map(f64::from).filter(|r| *r > 0.0);
        let capacity = config
            .batch_size
            .map(|b| b as f64)
            .or(rate)
            .unwrap_or(1.0)
            .max(1.0);
        Self {
            rate,
            capacity,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
            window: Mutex::new(VecDeque::new()),
            threshold: config.pause_on_error_rate.map(|p| p.threshold),
            interval: Duration::from_secs(
                config
                    .pause_on_error_rate
                    .map_or(0, |p| p.interval_sec)
                    .max(1),
            ),
            drain_strategy: config.drain_strategy,
            backoff_level: AtomicU32::new(0),
            queued: AtomicUsize::new(0),
            queue_capacity: config.queue_capacity,
        }
    }

    /// Ask to admit a chunk of `n` records. Applies the drain strategy
    /// first, then waits on rate-limiter tokens.
    pub async fn admit(&self, n: usize) -> Admission {
        match self.drain_strategy {
            DrainStrategy::Backoff => {
                if self.is_tripped() {
                    let level = self.backoff_level.fetch_add(1, Ordering::Relaxed);
                    let delay_ms =
                        BACKOFF_BASE_MS.saturating_mul(2u64.saturating_pow(level)).min(BACKOFF_MAX_MS);
                    tracing::warn!(
                        delay_ms,
                        level = level + 1,
                        "Error rate above threshold, backing off before admission"
                    );
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                } else if self.window_is_clean() {
                    self.backoff_level.store(0, Ordering::Relaxed);
                }
            }
            DrainStrategy::Shed => {
                if self.is_tripped() {
                    return Admission::Shed;
                }
            }
            DrainStrategy::Queue => {
                let depth = self.queued.fetch_add(1, Ordering::SeqCst) + 1;
                if depth > self.queue_capacity {
                    tracing::warn!(
                        depth,
                        capacity = self.queue_capacity,
                        "Queued chunks exceed configured capacity, backpressure"
                    );
                }
                while self.is_tripped() {
                    tokio::time::sleep(Duration::from_millis(QUEUE_POLL_MS)).await;
                }
                self.queued.fetch_sub(1, Ordering::SeqCst);
            }
        }

        self.acquire(n).await;
        Admission::Proceed
    }

    /// Report chunk results into the sliding error-rate window.
    pub fn record_outcome(&self, processed: usize, errors: usize) {
        if self.threshold.is_none() {
            return;
        }
        let mut window = lock(&self.window);
        window.push_back(WindowEntry {
            at: Instant::now(),
            total: processed as u64,
            errors: errors as u64,
        });
        Self::prune(&mut window, self.interval);
    }

    /// Fraction of record errors over the current window (0.0 when empty).
    #[must_use]
    pub fn error_rate(&self) -> f64 {
        let mut window = lock(&self.window);
        Self::prune(&mut window, self.interval);
        let (total, errors) = window
            .iter()
            .fold((0u64, 0u64), |(t, e), entry| (t + entry.total, e + entry.errors));
        if total == 0 {
            0.0
        } else {
            errors as f64 / total as f64
        }
    }

    /// Whether the error rate currently exceeds the configured threshold.
    #[must_use]
    pub fn is_tripped(&self) -> bool {
        self.threshold
            .is_some_and(|threshold| self.error_rate() > threshold)
    }

    /// Chunks currently parked by the QUEUE drain strategy.
    #[must_use]
    pub fn queued_depth(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    fn window_is_clean(&self) -> bool {
        let mut window = lock(&self.window);
        Self::prune(&mut window, self.interval);
        !window.is_empty() && window.iter().all(|entry| entry.errors == 0)
    }

    fn prune(window: &mut VecDeque<WindowEntry>, interval: Duration) {
        let now = Instant::now();
        while window
            .front()
            .is_some_and(|entry| now.duration_since(entry.at) > interval)
        {
            window.pop_front();
        }
    }

    async fn acquire(&self, n: usize) {
        let Some(rate) = self.rate else {
            return;
        };
        // A chunk larger than the burst capacity could never accumulate
        // enough tokens; its cost is clamped to the capacity.
        let cost = (n as f64).min(self.capacity);
        loop {
            let wait = {
                let mut bucket = lock(&self.bucket);
                let now = Instant::now();
                let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * rate).min(self.capacity);
                bucket.last_refill = now;
                if bucket.tokens >= cost {
                    bucket.tokens -= cost;
                    return;
                }
                Duration::from_secs_f64(((cost - bucket.tokens) / rate).max(0.001))
            };
            tokio::time::sleep(wait).await;
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchflow_types::definition::PauseOnErrorRate;

    fn config(rps: Option<u32>, batch: Option<usize>) -> ThroughputConfig {
        ThroughputConfig {
            rate_limit_rps: rps,
            batch_size: batch,
            ..ThroughputConfig::default()
        }
    }

    fn tripping_config(strategy: DrainStrategy) -> ThroughputConfig {
        ThroughputConfig {
            pause_on_error_rate: Some(PauseOnErrorRate {
                threshold: 0.5,
                interval_sec: 10,
            }),
            drain_strategy: strategy,
            ..ThroughputConfig::default()
        }
    }

    #[tokio::test]
    async fn unlimited_controller_admits_immediately() {
        let controller = ThroughputController::new(&config(None, None));
        let start = Instant::now();
        for _ in 0..100 {
            assert_eq!(controller.admit(1000).await, Admission::Proceed);
        }
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_bounds_a_two_second_window() {
        // rateLimitRps=10, batchSize=5: over 2s at most 2*10 + 5 records.
        let controller = ThroughputController::new(&config(Some(10), Some(5)));
        let start = Instant::now();
        let mut admitted = 0u64;
        while start.elapsed() < Duration::from_secs(2) {
            controller.admit(5).await;
            if start.elapsed() >= Duration::from_secs(2) {
                break;
            }
            admitted += 5;
        }
        assert!(admitted <= 25, "admitted {admitted} > 25");
        assert!(admitted >= 20, "admitted {admitted} < 20");
    }

    #[tokio::test(start_paused = true)]
    async fn error_window_trips_and_recovers() {
        let controller = ThroughputController::new(&tripping_config(DrainStrategy::Shed));
        assert!(!controller.is_tripped());

        controller.record_outcome(10, 8);
        assert!(controller.is_tripped());
        assert!((controller.error_rate() - 0.8).abs() < f64::EPSILON);

        // Window slides past the bad entries.
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(!controller.is_tripped());
        assert!(controller.error_rate().abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn shed_refuses_chunks_while_tripped() {
        let controller = ThroughputController::new(&tripping_config(DrainStrategy::Shed));
        controller.record_outcome(10, 10);
        assert_eq!(controller.admit(5).await, Admission::Shed);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(controller.admit(5).await, Admission::Proceed);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_delays_admission_exponentially() {
        let controller = ThroughputController::new(&tripping_config(DrainStrategy::Backoff));
        controller.record_outcome(10, 10);

        let start = Instant::now();
        assert_eq!(controller.admit(1).await, Admission::Proceed);
        let first = start.elapsed();
        assert!(first >= Duration::from_millis(100));

        let start = Instant::now();
        controller.admit(1).await;
        let second = start.elapsed();
        assert!(second >= first * 2, "second {second:?} not > first {first:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_resets_after_clean_window() {
        let controller = ThroughputController::new(&tripping_config(DrainStrategy::Backoff));
        controller.record_outcome(10, 10);
        controller.admit(1).await;
        assert!(controller.backoff_level.load(Ordering::Relaxed) > 0);

        tokio::time::advance(Duration::from_secs(11)).await;
        controller.record_outcome(10, 0);
        controller.admit(1).await;
        assert_eq!(controller.backoff_level.load(Ordering::Relaxed), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn queue_parks_chunks_until_recovery() {
        let controller =
            std::sync::Arc::new(ThroughputController::new(&tripping_config(DrainStrategy::Queue)));
        controller.record_outcome(10, 10);

        let parked = controller.clone();
        let task = tokio::spawn(async move { parked.admit(5).await });
        // Give the task a chance to park.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(controller.queued_depth(), 1);

        tokio::time::advance(Duration::from_secs(11)).await;
        let admission = task.await.unwrap();
        assert_eq!(admission, Admission::Proceed);
        assert_eq!(controller.queued_depth(), 0);
    }
}
