//! Dead-letter store and patch-and-retry queue.
//!
//! Records that exhaust their retry budget land here with their last
//! error. Operators patch-and-retry (every attempt leaves an immutable
//! audit row) or mark records permanently dead. The stored payload is
//! never mutated — each retry patches the original.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;

use batchflow_types::dead_letter::{DeadLetter, RetryAudit};
use batchflow_types::error::{PipelineError, RecordError};
use batchflow_types::record::{merge_patch, Record};

/// Persistence seam for dead letters. The engine ships an in-memory
/// implementation; durable backends implement the same contract.
pub trait DeadLetterStore: Send + Sync {
    /// Store a freshly captured dead letter.
    ///
    /// # Errors
    ///
    /// Backend-specific storage failures.
    fn insert(&self, letter: DeadLetter) -> Result<(), PipelineError>;

    /// Fetch one dead letter by id.
    ///
    /// # Errors
    ///
    /// Backend-specific storage failures.
    fn get(&self, id: &str) -> Result<Option<DeadLetter>, PipelineError>;

    /// All dead letters, optionally scoped to one pipeline.
    ///
    /// # Errors
    ///
    /// Backend-specific storage failures.
    fn list(&self, pipeline: Option<&str>) -> Result<Vec<DeadLetter>, PipelineError>;

    /// Flip the permanent-dead flag. Returns false for unknown ids.
    ///
    /// # Errors
    ///
    /// Backend-specific storage failures.
    fn set_dead(&self, id: &str, dead: bool) -> Result<bool, PipelineError>;

    /// Append an audit row and bump the letter's retry count. The letter's
    /// payload is left untouched.
    ///
    /// # Errors
    ///
    /// Unknown ids are a CONFIGURATION error.
    fn record_retry(&self, id: &str, audit: RetryAudit) -> Result<(), PipelineError>;

    /// Audit trail for one dead letter, oldest first.
    ///
    /// # Errors
    ///
    /// Backend-specific storage failures.
    fn audits(&self, id: &str) -> Result<Vec<RetryAudit>, PipelineError>;
}

#[derive(Default)]
struct MemoryInner {
    letters: HashMap<String, DeadLetter>,
    audits: HashMap<String, Vec<RetryAudit>>,
    insertion_order: Vec<String>,
}

/// In-memory dead-letter store. The single interior lock serializes
/// writes per record id, so concurrent patch-and-retry attempts cannot
/// lose updates.
#[derive(Default)]
pub struct MemoryDeadLetterStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryDeadLetterStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl DeadLetterStore for MemoryDeadLetterStore {
    fn insert(&self, letter: DeadLetter) -> Result<(), PipelineError> {
        let mut inner = self.lock();
        inner.insertion_order.push(letter.id.clone());
        inner.letters.insert(letter.id.clone(), letter);
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<DeadLetter>, PipelineError> {
        Ok(self.lock().letters.get(id).cloned())
    }

    fn list(&self, pipeline: Option<&str>) -> Result<Vec<DeadLetter>, PipelineError> {
        let inner = self.lock();
        Ok(inner
            .insertion_order
            .iter()
            .filter_map(|id| inner.letters.get(id))
            .filter(|letter| pipeline.is_none_or(|p| letter.pipeline == p))
            .cloned()
            .collect())
    }

    fn set_dead(&self, id: &str, dead: bool) -> Result<bool, PipelineError> {
        let mut inner = self.lock();
        match inner.letters.get_mut(id) {
            Some(letter) => {
                letter.dead = dead;
                letter.updated_at = chrono::Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn record_retry(&self, id: &str, audit: RetryAudit) -> Result<(), PipelineError> {
        let mut inner = self.lock();
        let letter = inner.letters.get_mut(id).ok_or_else(|| {
            PipelineError::configuration("UNKNOWN_DEAD_LETTER", format!("no dead letter '{id}'"))
        })?;
        letter.retry_count += 1;
        letter.updated_at = chrono::Utc::now();
        inner.audits.entry(id.to_string()).or_default().push(audit);
        Ok(())
    }

    fn audits(&self, id: &str) -> Result<Vec<RetryAudit>, PipelineError> {
        Ok(self.lock().audits.get(id).cloned().unwrap_or_default())
    }
}

/// A prepared resubmission: the patched record and where it goes back in.
#[derive(Debug, Clone)]
pub struct RetryDispatch {
    pub dead_letter_id: String,
    pub pipeline: String,
    /// Originating step the record is resubmitted into.
    pub step_key: String,
    pub record: Record,
}

/// Operator-facing retry operations over a [`DeadLetterStore`].
pub struct RetryQueue {
    store: Arc<dyn DeadLetterStore>,
}

impl RetryQueue {
    #[must_use]
    pub fn new(store: Arc<dyn DeadLetterStore>) -> Self {
        Self { store }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn DeadLetterStore> {
        &self.store
    }

    /// Capture a failed record as a dead letter.
    ///
    /// # Errors
    ///
    /// Storage failures from the backing store.
    pub fn capture(
        &self,
        pipeline: &str,
        step_key: &str,
        payload: Record,
        error: RecordError,
    ) -> Result<DeadLetter, PipelineError> {
        let letter = DeadLetter::new(pipeline, step_key, payload, error);
        tracing::warn!(
            pipeline,
            step_key,
            dead_letter_id = letter.id,
            code = letter.error.code,
            "Record dead-lettered"
        );
        self.store.insert(letter.clone())?;
        Ok(letter)
    }

    /// Merge `patch` over the original payload, append an audit row, and
    /// return the resubmission. Returns `None` for unknown ids and for
    /// letters marked permanently dead.
    ///
    /// # Errors
    ///
    /// Storage failures from the backing store.
    pub fn prepare_retry(
        &self,
        id: &str,
        patch: Option<Value>,
        actor: &str,
    ) -> Result<Option<RetryDispatch>, PipelineError> {
        let Some(letter) = self.store.get(id)? else {
            return Ok(None);
        };
        if letter.dead {
            tracing::info!(dead_letter_id = id, "Retry refused: record is marked dead");
            return Ok(None);
        }

        let patch = patch.unwrap_or(Value::Object(serde_json::Map::new()));
        let resulting = merge_patch(&letter.payload, &patch);
        let audit = RetryAudit::new(id, letter.payload.clone(), patch, resulting.clone(), actor);
        self.store.record_retry(id, audit)?;

        Ok(Some(RetryDispatch {
            dead_letter_id: id.to_string(),
            pipeline: letter.pipeline,
            step_key: letter.step_key,
            record: resulting,
        }))
    }

    /// Mark or unmark a dead letter as permanently dead. Audit history is
    /// kept either way. Returns false for unknown ids.
    ///
    /// # Errors
    ///
    /// Storage failures from the backing store.
    pub fn mark_dead(&self, id: &str, dead: bool) -> Result<bool, PipelineError> {
        self.store.set_dead(id, dead)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn queue() -> RetryQueue {
        RetryQueue::new(Arc::new(MemoryDeadLetterStore::new()))
    }

    fn capture_one(queue: &RetryQueue) -> DeadLetter {
        queue
            .capture(
                "order-sync",
                "load-orders",
                json!({"sku": "A-1", "qty": 1}),
                RecordError::new("WRITE_FAILED", "constraint violation"),
            )
            .unwrap()
    }

    #[test]
    fn patch_and_retry_leaves_payload_untouched() {
        let queue = queue();
        let letter = capture_one(&queue);

        let dispatch = queue
            .prepare_retry(&letter.id, Some(json!({"qty": 2})), "ops")
            .unwrap()
            .unwrap();
        assert_eq!(dispatch.record, json!({"sku": "A-1", "qty": 2}));
        assert_eq!(dispatch.step_key, "load-orders");

        let stored = queue.store().get(&letter.id).unwrap().unwrap();
        assert_eq!(stored.payload, json!({"sku": "A-1", "qty": 1}));
        assert_eq!(stored.retry_count, 1);
    }

    #[test]
    fn same_patch_twice_two_audits_same_result() {
        let queue = queue();
        let letter = capture_one(&queue);
        let patch = json!({"qty": 9});

        let first = queue
            .prepare_retry(&letter.id, Some(patch.clone()), "ops")
            .unwrap()
            .unwrap();
        let second = queue
            .prepare_retry(&letter.id, Some(patch), "ops")
            .unwrap()
            .unwrap();

        assert_eq!(first.record, second.record);
        let audits = queue.store().audits(&letter.id).unwrap();
        assert_eq!(audits.len(), 2);
        assert_ne!(audits[0].id, audits[1].id);
        assert_eq!(audits[0].resulting_payload, audits[1].resulting_payload);
        assert_eq!(audits[0].previous_payload, audits[1].previous_payload);
    }

    #[test]
    fn retry_without_patch_resubmits_original() {
        let queue = queue();
        let letter = capture_one(&queue);
        let dispatch = queue.prepare_retry(&letter.id, None, "ops").unwrap().unwrap();
        assert_eq!(dispatch.record, letter.payload);
    }

    #[test]
    fn dead_records_refuse_retry_but_keep_audits() {
        let queue = queue();
        let letter = capture_one(&queue);
        queue
            .prepare_retry(&letter.id, Some(json!({"qty": 2})), "ops")
            .unwrap();

        assert!(queue.mark_dead(&letter.id, true).unwrap());
        assert!(queue.prepare_retry(&letter.id, None, "ops").unwrap().is_none());
        assert_eq!(queue.store().audits(&letter.id).unwrap().len(), 1);

        // Un-marking makes it retryable again.
        assert!(queue.mark_dead(&letter.id, false).unwrap());
        assert!(queue.prepare_retry(&letter.id, None, "ops").unwrap().is_some());
    }

    #[test]
    fn unknown_ids_are_not_errors() {
        let queue = queue();
        assert!(queue.prepare_retry("nope", None, "ops").unwrap().is_none());
        assert!(!queue.mark_dead("nope", true).unwrap());
    }

    #[test]
    fn list_filters_by_pipeline_in_insertion_order() {
        let queue = queue();
        let a = capture_one(&queue);
        queue
            .capture("other", "s", json!({}), RecordError::new("X", "y"))
            .unwrap();
        let b = capture_one(&queue);

        let letters = queue.store().list(Some("order-sync")).unwrap();
        assert_eq!(letters.len(), 2);
        assert_eq!(letters[0].id, a.id);
        assert_eq!(letters[1].id, b.id);
        assert_eq!(queue.store().list(None).unwrap().len(), 3);
    }

    #[test]
    fn concurrent_retries_are_serialized() {
        let queue = Arc::new(queue());
        let letter = capture_one(&queue);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let queue = queue.clone();
                let id = letter.id.clone();
                std::thread::spawn(move || {
                    queue
                        .prepare_retry(&id, Some(json!({"attempt": i})), "ops")
                        .unwrap()
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let stored = queue.store().get(&letter.id).unwrap().unwrap();
        assert_eq!(stored.retry_count, 8);
        assert_eq!(queue.store().audits(&letter.id).unwrap().len(), 8);
    }
}
