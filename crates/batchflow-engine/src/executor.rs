//! Step execution: one compiled step against one batch of records.
//!
//! Handles condition gating, chunking, bounded chunk concurrency,
//! throughput admission, per-chunk timeouts, step-level retry, hook
//! dispatch, continue-on-error semantics, and cooperative cancellation
//! (checked between chunks, never mid-chunk).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;

use batchflow_types::definition::{DrainStrategy, ShedInFlight, StepType};
use batchflow_types::error::{ErrorStage, PipelineError, RecordError};
use batchflow_types::hook::HookStage;
use batchflow_types::record::Record;
use batchflow_types::result::{StepMetrics, StepResult, StepStatus};

use crate::adapter::{Adapter, AdapterContext, AdapterOutput};
use crate::compiler::CompiledStep;
use crate::expr;
use crate::hooks::{HookDispatcher, HookPayload};
use crate::registry::AdapterRegistry;
use crate::throughput::{Admission, ThroughputController};

/// Shared per-run context handed to every step execution.
#[derive(Clone)]
pub struct RunContext {
    pub pipeline: String,
    pub variables: serde_json::Map<String, serde_json::Value>,
    /// Cooperative cancellation flag, checked between chunks.
    pub cancelled: Arc<AtomicBool>,
    pub hooks: Arc<HookDispatcher>,
}

impl RunContext {
    #[must_use]
    pub fn new(pipeline: impl Into<String>, hooks: Arc<HookDispatcher>) -> Self {
        Self {
            pipeline: pipeline.into(),
            variables: serde_json::Map::new(),
            cancelled: Arc::new(AtomicBool::new(false)),
            hooks,
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// A finished step: its result plus the records feeding successors.
pub struct ExecutedStep {
    pub result: StepResult,
    pub outputs: Vec<Record>,
}

/// Executes compiled steps against record batches.
#[derive(Clone)]
pub struct StepExecutor {
    registry: Arc<AdapterRegistry>,
}

/// What one attempt over all chunks produced.
#[derive(Default)]
struct AttemptOutcome {
    /// (chunk offset, records) — flattened in offset order afterwards.
    outputs: Vec<(usize, Vec<Record>)>,
    errors: Vec<RecordError>,
    dropped: u64,
    /// First record error stopped admission (`continue_on_error = false`).
    aborted: bool,
    cancelled: bool,
}

/// Accumulates chunk results as they complete.
struct ChunkCollector<'a> {
    outcome: AttemptOutcome,
    invocation_error: Option<PipelineError>,
    /// Set once no further chunks may start.
    stop_admitting: bool,
    continue_on_error: bool,
    drain_strategy: DrainStrategy,
    shed_in_flight: ShedInFlight,
    controller: &'a ThroughputController,
}

impl ChunkCollector<'_> {
    fn absorb(
        &mut self,
        joined: Result<
            (usize, usize, Result<AdapterOutput, PipelineError>),
            tokio::task::JoinError,
        >,
    ) {
        let (offset, chunk_len, result) = match joined {
            Ok(parts) => parts,
            Err(join_err) => {
                if self.invocation_error.is_none() {
                    self.invocation_error =
                        Some(PipelineError::system("TASK_PANIC", join_err.to_string()));
                }
                self.stop_admitting = true;
                return;
            }
        };

        match result {
            Ok(output) => {
                let error_count = output.record_errors.len();
                self.controller.record_outcome(chunk_len, error_count);

                // SHED with the Drop policy discards output of chunks that
                // were in flight when the threshold tripped.
                let discard = self.drain_strategy == DrainStrategy::Shed
                    && self.shed_in_flight == ShedInFlight::Drop
                    && self.controller.is_tripped();
                if discard {
                    self.outcome.dropped += output.records.len() as u64;
                } else {
                    self.outcome.outputs.push((offset, output.records));
                }

                self.outcome.dropped += output.dropped;
                self.outcome
                    .errors
                    .extend(output.record_errors.into_iter().map(|mut error| {
                        error.record_index = error.record_index.map(|i| i + offset);
                        error
                    }));

                if error_count > 0 && !self.continue_on_error {
                    self.outcome.aborted = true;
                    self.stop_admitting = true;
                }
            }
            Err(error) => {
                if self.invocation_error.is_none() {
                    self.invocation_error = Some(error);
                }
                self.stop_admitting = true;
            }
        }
    }
}

impl StepExecutor {
    #[must_use]
    pub fn new(registry: Arc<AdapterRegistry>) -> Self {
        Self { registry }
    }

    /// Execute one step against a batch. Never returns `Err` — every
    /// failure mode is encoded in the returned [`StepResult`].
    pub async fn execute(
        &self,
        step: &CompiledStep,
        controller: &ThroughputController,
        records: Vec<Record>,
        ctx: &RunContext,
    ) -> ExecutedStep {
        let start = Instant::now();
        let input_count = records.len() as u64;
        let step_key = step.def.key.clone();

        // TRIGGER steps are entry markers: records pass through untouched.
        if step.def.step_type == StepType::Trigger {
            let result = finish(step_key, StepStatus::Success, input_count, records.len(), Vec::new(), 0, None, start);
            return ExecutedStep {
                result,
                outputs: records,
            };
        }

        // Condition-gated records bypass the adapter unchanged.
        let (eligible, bypass, mut condition_errors) = partition(step, records, ctx);

        let adapter = match self
            .registry
            .instantiate(&step.def.adapter_code, &step.def.config)
        {
            Ok(adapter) => adapter,
            Err(error) => {
                let result = finish(
                    step_key.clone(),
                    StepStatus::Error,
                    input_count,
                    0,
                    condition_errors,
                    0,
                    Some(error.with_step(step_key)),
                    start,
                );
                self.fire_completion_hooks(step, &result, ctx);
                return ExecutedStep {
                    result,
                    outputs: Vec::new(),
                };
            }
        };

        let adapter_ctx = Arc::new(AdapterContext {
            pipeline: ctx.pipeline.clone(),
            step_key: step_key.clone(),
            config: step.def.config.clone(),
            variables: ctx.variables.clone(),
        });

        if let Some(stage) = HookStage::before(step.def.step_type) {
            ctx.hooks.fire(
                &HookPayload::new(stage, ctx.pipeline.as_str(), json!({"inputCount": eligible.len()}))
                    .for_step(step_key.as_str()),
            );
        }

        // Step-level retry: the whole attempt re-runs on retryable
        // invocation errors, with a fixed delay between attempts.
        let mut attempt = 0u32;
        let attempt_result = loop {
            attempt += 1;
            let result = self
                .run_attempt(step, &adapter, &adapter_ctx, controller, eligible.clone(), ctx)
                .await;
            match result {
                Ok(outcome) => break Ok(outcome),
                Err(error) if error.retryable && attempt <= step.def.retries => {
                    tracing::warn!(
                        step = step_key,
                        attempt,
                        max_retries = step.def.retries,
                        delay_ms = step.def.retry_delay_ms,
                        stage = %error.stage,
                        "Retryable step failure, will retry"
                    );
                    ctx.hooks.fire(
                        &HookPayload::new(
                            HookStage::OnRetry,
                            ctx.pipeline.as_str(),
                            json!({
                                "attempt": attempt,
                                "maxRetries": step.def.retries,
                                "delayMs": step.def.retry_delay_ms,
                                "error": error.to_string(),
                            }),
                        )
                        .for_step(step_key.as_str()),
                    );
                    tokio::time::sleep(Duration::from_millis(step.def.retry_delay_ms)).await;
                }
                Err(error) => break Err(error),
            }
        };

        let (result, outputs) = match attempt_result {
            Ok(mut outcome) => {
                outcome.errors.append(&mut condition_errors);
                let status = if outcome.cancelled {
                    StepStatus::Cancelled
                } else if outcome.aborted {
                    StepStatus::Error
                } else {
                    StepStatus::Success
                };
                let failure = outcome.aborted.then(|| {
                    record_failure(step.def.step_type, &outcome.errors).with_step(step_key.as_str())
                });

                outcome.outputs.sort_by_key(|(offset, _)| *offset);
                let mut outputs: Vec<Record> = outcome
                    .outputs
                    .into_iter()
                    .flat_map(|(_, records)| records)
                    .collect();
                outputs.extend(bypass);

                let result = finish(
                    step_key,
                    status,
                    input_count,
                    outputs.len(),
                    outcome.errors,
                    outcome.dropped,
                    failure,
                    start,
                );
                (result, outputs)
            }
            Err(error) => {
                let result = finish(
                    step_key.clone(),
                    StepStatus::Error,
                    input_count,
                    0,
                    condition_errors,
                    0,
                    Some(error.with_step(step_key)),
                    start,
                );
                (result, Vec::new())
            }
        };

        self.fire_completion_hooks(step, &result, ctx);
        ExecutedStep { result, outputs }
    }

    async fn run_attempt(
        &self,
        step: &CompiledStep,
        adapter: &Arc<dyn Adapter>,
        adapter_ctx: &Arc<AdapterContext>,
        controller: &ThroughputController,
        eligible: Vec<Record>,
        ctx: &RunContext,
    ) -> Result<AttemptOutcome, PipelineError> {
        let chunk_size = step.def.throughput.batch_size.unwrap_or(0);
        let chunks = chunk_records(eligible, chunk_size);

        let concurrency = if step.def.parallel || step.def.is_async {
            step.def.throughput.concurrency.max(1) as usize
        } else {
            1
        };
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut join_set: JoinSet<(usize, usize, Result<AdapterOutput, PipelineError>)> =
            JoinSet::new();

        let mut collector = ChunkCollector {
            outcome: AttemptOutcome::default(),
            invocation_error: None,
            stop_admitting: false,
            continue_on_error: step.def.continue_on_error,
            drain_strategy: step.def.throughput.drain_strategy,
            shed_in_flight: step.def.throughput.shed_in_flight,
            controller,
        };

        // Admission follows input order; completion order is unordered.
        for (offset, chunk) in chunks {
            // Drain finished chunks first so record errors can stop
            // admission as early as possible.
            while let Some(joined) = join_set.try_join_next() {
                collector.absorb(joined);
            }
            if ctx.is_cancelled() {
                collector.outcome.cancelled = true;
                break;
            }
            if collector.stop_admitting {
                break;
            }

            let chunk_len = chunk.len();
            if controller.admit(chunk_len).await == Admission::Shed {
                collector.outcome.dropped += chunk_len as u64;
                tracing::warn!(step = step.def.key, chunk_len, "Chunk shed by drain strategy");
                continue;
            }

            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let adapter = adapter.clone();
            let adapter_ctx = adapter_ctx.clone();
            let timeout_ms = step.def.timeout_ms;
            join_set.spawn(async move {
                let _permit = permit;
                let result = invoke_with_timeout(&adapter, &adapter_ctx, chunk, timeout_ms).await;
                (offset, chunk_len, result)
            });
        }

        // In-flight chunks always finish; nothing new is started.
        while let Some(joined) = join_set.join_next().await {
            collector.absorb(joined);
        }

        match collector.invocation_error {
            Some(error) => Err(error),
            None => Ok(collector.outcome),
        }
    }

    fn fire_completion_hooks(&self, step: &CompiledStep, result: &StepResult, ctx: &RunContext) {
        for error in &result.errors {
            ctx.hooks.fire(
                &HookPayload::new(
                    HookStage::OnError,
                    ctx.pipeline.as_str(),
                    json!({
                        "error": {
                            "code": error.code,
                            "message": error.message,
                            "recordIndex": error.record_index,
                        }
                    }),
                )
                .for_step(result.step_key.as_str()),
            );
        }

        // AFTER hooks fire regardless of success or failure.
        if let Some(stage) = HookStage::after(step.def.step_type) {
            ctx.hooks.fire(
                &HookPayload::new(
                    stage,
                    ctx.pipeline.as_str(),
                    json!({
                        "status": result.status,
                        "inputCount": result.metrics.input_count,
                        "outputCount": result.metrics.output_count,
                        "errorCount": result.metrics.error_count,
                        "error": result.failure.as_ref().map(ToString::to_string),
                    }),
                )
                .for_step(result.step_key.as_str()),
            );
        }
    }
}

/// Split records by the step condition. Records failing evaluation become
/// record errors; records evaluating falsy bypass the adapter unchanged.
fn partition(
    step: &CompiledStep,
    records: Vec<Record>,
    ctx: &RunContext,
) -> (Vec<Record>, Vec<Record>, Vec<RecordError>) {
    let Some(condition) = &step.condition else {
        return (records, Vec::new(), Vec::new());
    };
    let mut eligible = Vec::new();
    let mut bypass = Vec::new();
    let mut errors = Vec::new();
    for (index, record) in records.into_iter().enumerate() {
        match expr::evaluate(condition, &record, Some(&ctx.variables)) {
            Ok(value) if expr::truthy(&value) => eligible.push(record),
            Ok(_) => bypass.push(record),
            Err(error) => {
                errors.push(RecordError::new("CONDITION_EVAL", error.to_string()).at_index(index));
            }
        }
    }
    (eligible, bypass, errors)
}

async fn invoke_with_timeout(
    adapter: &Arc<dyn Adapter>,
    ctx: &AdapterContext,
    chunk: Vec<Record>,
    timeout_ms: Option<u64>,
) -> Result<AdapterOutput, PipelineError> {
    match timeout_ms {
        Some(ms) => {
            match tokio::time::timeout(Duration::from_millis(ms), adapter.invoke(ctx, chunk)).await
            {
                Ok(result) => result,
                Err(_) => Err(PipelineError::timeout(
                    "STEP_TIMEOUT",
                    format!("adapter call exceeded {ms}ms"),
                )),
            }
        }
        None => adapter.invoke(ctx, chunk).await,
    }
}

/// Split into `(offset, chunk)` pairs; size 0 means one chunk. An empty
/// input still yields one empty chunk so source adapters get invoked.
fn chunk_records(records: Vec<Record>, size: usize) -> Vec<(usize, Vec<Record>)> {
    if records.is_empty() {
        return vec![(0, Vec::new())];
    }
    if size == 0 {
        return vec![(0, records)];
    }
    let mut chunks = Vec::with_capacity(records.len().div_ceil(size));
    let mut offset = 0;
    let mut current = Vec::with_capacity(size);
    for record in records {
        current.push(record);
        if current.len() == size {
            chunks.push((offset, std::mem::take(&mut current)));
            offset += size;
        }
    }
    if !current.is_empty() {
        chunks.push((offset, current));
    }
    chunks
}

fn record_failure(step_type: StepType, errors: &[RecordError]) -> PipelineError {
    let message = errors
        .first()
        .map_or_else(|| "record failure".to_string(), |e| e.message.clone());
    let mut failure = PipelineError::validation("RECORD_FAILURE", message);
    failure.stage = stage_for(step_type);
    failure
}

fn stage_for(step_type: StepType) -> ErrorStage {
    match step_type {
        StepType::Extract => ErrorStage::Extraction,
        StepType::Transform | StepType::Enrich | StepType::Route => ErrorStage::Transformation,
        StepType::Validate => ErrorStage::Validation,
        StepType::Load | StepType::Export | StepType::Feed | StepType::Sink => ErrorStage::Loading,
        StepType::Trigger => ErrorStage::Unknown,
    }
}

#[allow(clippy::too_many_arguments, clippy::cast_precision_loss, clippy::cast_possible_truncation)]
fn finish(
    step_key: String,
    status: StepStatus,
    input_count: u64,
    output_count: usize,
    errors: Vec<RecordError>,
    dropped: u64,
    failure: Option<PipelineError>,
    start: Instant,
) -> StepResult {
    let duration = start.elapsed();
    let output_count = output_count as u64;
    let records_per_sec = if duration.as_secs_f64() > 0.0 {
        output_count as f64 / duration.as_secs_f64()
    } else {
        0.0
    };
    StepResult {
        step_key,
        status,
        metrics: StepMetrics {
            input_count,
            output_count,
            error_count: errors.len() as u64,
            dropped_count: dropped,
            duration_ms: duration.as_millis() as u64,
            records_per_sec,
        },
        errors,
        failure,
    }
}
