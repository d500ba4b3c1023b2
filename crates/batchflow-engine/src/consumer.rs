//! Long-running consumers for queue-driven (streaming) pipelines.
//!
//! One consumer per pipeline code: `start` spawns a polling task against
//! a [`ConsumerSource`], `stop` drains gracefully. Starting an active
//! consumer and stopping an inactive one are both no-ops.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::task::JoinHandle;

use batchflow_types::error::PipelineError;
use batchflow_types::record::Record;

const IDLE_POLL_MS: u64 = 100;

/// External queue/event boundary a consumer polls.
#[async_trait]
pub trait ConsumerSource: Send + Sync {
    /// Next batch of messages; `None` when the source is currently idle.
    ///
    /// # Errors
    ///
    /// Transport failures; the consumer counts them and keeps polling.
    async fn next_batch(&self) -> Result<Option<Vec<Record>>, PipelineError>;
}

/// What a consumer does with each batch (typically: run the pipeline).
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    /// Process one batch.
    ///
    /// # Errors
    ///
    /// Processing failures; the consumer counts the batch as failed.
    async fn handle(&self, batch: Vec<Record>) -> Result<(), PipelineError>;
}

#[derive(Default)]
struct Counters {
    messages_processed: AtomicU64,
    messages_failed: AtomicU64,
    /// Epoch milliseconds of the last message; 0 = never.
    last_message_at_ms: AtomicI64,
}

/// Snapshot of one consumer's live counters.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerStats {
    pub messages_processed: u64,
    pub messages_failed: u64,
    pub last_message_at: Option<DateTime<Utc>>,
    pub is_active: bool,
}

struct ConsumerHandle {
    counters: Arc<Counters>,
    stop: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

/// Manages one consumer per pipeline code.
#[derive(Default)]
pub struct ConsumerManager {
    consumers: Mutex<HashMap<String, ConsumerHandle>>,
}

impl ConsumerManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin consuming for `pipeline_code`. Returns false (no-op) if a
    /// consumer for that code is already active.
    pub fn start(
        &self,
        pipeline_code: &str,
        source: Arc<dyn ConsumerSource>,
        handler: Arc<dyn ConsumerHandler>,
    ) -> bool {
        let mut consumers = lock(&self.consumers);
        if let Some(existing) = consumers.get(pipeline_code) {
            if !existing.task.is_finished() {
                tracing::debug!(pipeline = pipeline_code, "Consumer already active");
                return false;
            }
        }

        let counters = Arc::new(Counters::default());
        let stop = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(poll_loop(
            pipeline_code.to_string(),
            source,
            handler,
            counters.clone(),
            stop.clone(),
        ));
        tracing::info!(pipeline = pipeline_code, "Consumer started");
        consumers.insert(
            pipeline_code.to_string(),
            ConsumerHandle {
                counters,
                stop,
                task,
            },
        );
        true
    }

    /// Stop the consumer for `pipeline_code`: finish the batch in flight,
    /// then halt. Returns false (no-op) if no consumer is active.
    pub async fn stop(&self, pipeline_code: &str) -> bool {
        let handle = {
            let mut consumers = lock(&self.consumers);
            consumers.remove(pipeline_code)
        };
        let Some(handle) = handle else {
            tracing::debug!(pipeline = pipeline_code, "No active consumer to stop");
            return false;
        };
        handle.stop.store(true, Ordering::SeqCst);
        if handle.task.await.is_err() {
            tracing::error!(pipeline = pipeline_code, "Consumer task panicked during drain");
        }
        tracing::info!(pipeline = pipeline_code, "Consumer stopped");
        true
    }

    /// Live counters for one consumer; `None` if it was never started.
    #[must_use]
    pub fn stats(&self, pipeline_code: &str) -> Option<ConsumerStats> {
        let consumers = lock(&self.consumers);
        consumers.get(pipeline_code).map(snapshot)
    }

    /// Counters for every managed consumer, sorted by pipeline code.
    #[must_use]
    pub fn all_stats(&self) -> Vec<(String, ConsumerStats)> {
        let consumers = lock(&self.consumers);
        let mut stats: Vec<_> = consumers
            .iter()
            .map(|(code, handle)| (code.clone(), snapshot(handle)))
            .collect();
        stats.sort_by(|a, b| a.0.cmp(&b.0));
        stats
    }
}

fn snapshot(handle: &ConsumerHandle) -> ConsumerStats {
    let last_ms = handle.counters.last_message_at_ms.load(Ordering::SeqCst);
    ConsumerStats {
        messages_processed: handle.counters.messages_processed.load(Ordering::SeqCst),
        messages_failed: handle.counters.messages_failed.load(Ordering::SeqCst),
        last_message_at: (last_ms > 0)
            .then(|| Utc.timestamp_millis_opt(last_ms).single())
            .flatten(),
        is_active: !handle.task.is_finished(),
    }
}

async fn poll_loop(
    pipeline: String,
    source: Arc<dyn ConsumerSource>,
    handler: Arc<dyn ConsumerHandler>,
    counters: Arc<Counters>,
    stop: Arc<AtomicBool>,
) {
    while !stop.load(Ordering::SeqCst) {
        match source.next_batch().await {
            Ok(Some(batch)) if !batch.is_empty() => {
                let batch_len = batch.len() as u64;
                counters
                    .last_message_at_ms
                    .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
                match handler.handle(batch).await {
                    Ok(()) => {
                        counters
                            .messages_processed
                            .fetch_add(batch_len, Ordering::SeqCst);
                    }
                    Err(error) => {
                        counters
                            .messages_failed
                            .fetch_add(batch_len, Ordering::SeqCst);
                        tracing::error!(pipeline, %error, "Consumer batch failed");
                    }
                }
            }
            Ok(_) => {
                tokio::time::sleep(Duration::from_millis(IDLE_POLL_MS)).await;
            }
            Err(error) => {
                counters.messages_failed.fetch_add(1, Ordering::SeqCst);
                tracing::error!(pipeline, %error, "Consumer source poll failed");
                tokio::time::sleep(Duration::from_millis(IDLE_POLL_MS)).await;
            }
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
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    /// Emits `batches` once each, then reports idle forever.
    struct ScriptedSource {
        batches: Mutex<Vec<Vec<Record>>>,
    }

    #[async_trait]
    impl ConsumerSource for ScriptedSource {
        async fn next_batch(&self) -> Result<Option<Vec<Record>>, PipelineError> {
            Ok(lock(&self.batches).pop())
        }
    }

    struct CountingHandler {
        seen: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ConsumerHandler for CountingHandler {
        async fn handle(&self, batch: Vec<Record>) -> Result<(), PipelineError> {
            self.seen.fetch_add(batch.len(), Ordering::SeqCst);
            if self.fail {
                return Err(PipelineError::loading("WRITE_FAILED", "nope"));
            }
            Ok(())
        }
    }

    fn source_with(batches: Vec<Vec<Record>>) -> Arc<ScriptedSource> {
        Arc::new(ScriptedSource {
            batches: Mutex::new(batches),
        })
    }

    #[tokio::test]
    async fn consumes_batches_and_counts() {
        let manager = ConsumerManager::new();
        let handler = Arc::new(CountingHandler {
            seen: AtomicUsize::new(0),
            fail: false,
        });
        let source = source_with(vec![vec![json!({"n": 2})], vec![json!({"n": 1})]]);

        assert!(manager.start("orders", source, handler.clone()));
        // Poll until both batches are through.
        for _ in 0..50 {
            if handler.seen.load(Ordering::SeqCst) == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(manager.stop("orders").await);

        assert_eq!(handler.seen.load(Ordering::SeqCst), 2);
        let stats = manager.stats("orders");
        assert!(stats.is_none(), "stopped consumer is removed");
    }

    #[tokio::test]
    async fn failed_batches_count_as_failed() {
        let manager = ConsumerManager::new();
        let handler = Arc::new(CountingHandler {
            seen: AtomicUsize::new(0),
            fail: true,
        });
        let source = source_with(vec![vec![json!({}), json!({})]]);

        manager.start("orders", source, handler);
        for _ in 0..50 {
            if manager
                .stats("orders")
                .is_some_and(|s| s.messages_failed == 2)
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let stats = manager.stats("orders").unwrap();
        assert_eq!(stats.messages_failed, 2);
        assert_eq!(stats.messages_processed, 0);
        assert!(stats.last_message_at.is_some());
        assert!(stats.is_active);
        manager.stop("orders").await;
    }

    #[tokio::test]
    async fn start_is_noop_when_active_and_stop_is_noop_when_not() {
        let manager = ConsumerManager::new();
        let handler = Arc::new(CountingHandler {
            seen: AtomicUsize::new(0),
            fail: false,
        });
        let source = source_with(vec![]);

        assert!(manager.start("orders", source.clone(), handler.clone()));
        assert!(!manager.start("orders", source, handler));
        assert!(manager.stop("orders").await);
        assert!(!manager.stop("orders").await);
        assert!(!manager.stop("never-started").await);
    }
}
