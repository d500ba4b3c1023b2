//! Dead letters and retry audit rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::RecordError;
use crate::record::Record;

/// A record that exhausted its retry budget and is held for manual
/// intervention. The stored payload is the original failed payload and is
/// never mutated by patch-and-retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub id: String,
    pub pipeline: String,
    /// Step the record failed in; patch-and-retry resubmits here.
    pub step_key: String,
    pub payload: Record,
    pub error: RecordError,
    pub retry_count: u32,
    /// Marked permanently dead: excluded from reprocessing.
    pub dead: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(
        pipeline: impl Into<String>,
        step_key: impl Into<String>,
        payload: Record,
        error: RecordError,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            pipeline: pipeline.into(),
            step_key: step_key.into(),
            payload,
            error,
            retry_count: 0,
            dead: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One patch-and-retry attempt against a dead letter. Append-only: audit
/// rows are never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryAudit {
    pub id: String,
    pub dead_letter_id: String,
    pub previous_payload: Value,
    pub patch: Value,
    /// `previous_payload` with `patch` merged on top.
    pub resulting_payload: Value,
    pub actor: String,
    pub created_at: DateTime<Utc>,
}

impl RetryAudit {
    pub fn new(
        dead_letter_id: impl Into<String>,
        previous_payload: Value,
        patch: Value,
        resulting_payload: Value,
        actor: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            dead_letter_id: dead_letter_id.into(),
            previous_payload,
            patch,
            resulting_payload,
            actor: actor.into(),
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_dead_letter_is_retryable_and_fresh() {
        let dl = DeadLetter::new(
            "order-sync",
            "load-orders",
            json!({"sku": "A-1"}),
            RecordError::new("WRITE_FAILED", "constraint violation"),
        );
        assert!(!dl.dead);
        assert_eq!(dl.retry_count, 0);
        assert_eq!(dl.created_at, dl.updated_at);
        assert!(!dl.id.is_empty());
    }

    #[test]
    fn audit_serde_roundtrip() {
        let audit = RetryAudit::new(
            "dl-1",
            json!({"qty": 1}),
            json!({"qty": 2}),
            json!({"qty": 2}),
            "ops@example.com",
        );
        let json = serde_json::to_string(&audit).unwrap();
        let back: RetryAudit = serde_json::from_str(&json).unwrap();
        assert_eq!(audit, back);
    }
}
