//! The adapter contract: the one seam every pluggable unit of work
//! satisfies.
//!
//! Adapters never fail a whole batch for a single bad record — individual
//! failures come back as [`RecordError`]s inside [`AdapterOutput`]; an
//! `Err` return means the invocation itself failed (connection refused,
//! timeout, bad credentials) and is subject to step-level retry.

use async_trait::async_trait;
use serde_json::Value;

use batchflow_types::error::{PipelineError, RecordError};
use batchflow_types::record::Record;

/// Context handed to an adapter for one invocation.
#[derive(Debug, Clone)]
pub struct AdapterContext {
    pub pipeline: String,
    pub step_key: String,
    /// Step config, already validated against the adapter's schema.
    pub config: Value,
    /// Pipeline-scoped variables.
    pub variables: serde_json::Map<String, Value>,
}

/// What an adapter produced for one chunk of records.
#[derive(Debug, Default)]
pub struct AdapterOutput {
    /// Records flowing on to successor steps.
    pub records: Vec<Record>,
    /// Individual record failures (validation, business rules).
    pub record_errors: Vec<RecordError>,
    /// Records intentionally discarded (filters, unmatched routes).
    pub dropped: u64,
}

impl AdapterOutput {
    /// All input records passed through unchanged.
    #[must_use]
    pub fn passthrough(records: Vec<Record>) -> Self {
        Self {
            records,
            ..Self::default()
        }
    }
}

/// A pluggable unit of work bound to pipeline steps by `adapter_code`.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Process one chunk of records.
    ///
    /// # Errors
    ///
    /// Returns a [`PipelineError`] when the invocation as a whole fails;
    /// per-record failures belong in [`AdapterOutput::record_errors`].
    async fn invoke(
        &self,
        ctx: &AdapterContext,
        records: Vec<Record>,
    ) -> Result<AdapterOutput, PipelineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl Adapter for Echo {
        async fn invoke(
            &self,
            _ctx: &AdapterContext,
            records: Vec<Record>,
        ) -> Result<AdapterOutput, PipelineError> {
            Ok(AdapterOutput::passthrough(records))
        }
    }

    #[tokio::test]
    async fn passthrough_preserves_records() {
        let ctx = AdapterContext {
            pipeline: "p".into(),
            step_key: "s".into(),
            config: Value::Null,
            variables: serde_json::Map::new(),
        };
        let records = vec![serde_json::json!({"a": 1})];
        let out = Echo.invoke(&ctx, records.clone()).await.unwrap();
        assert_eq!(out.records, records);
        assert!(out.record_errors.is_empty());
        assert_eq!(out.dropped, 0);
    }
}
