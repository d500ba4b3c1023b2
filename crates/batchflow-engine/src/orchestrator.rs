//! Run orchestration: walks the compiled plan stage by stage.
//!
//! Steps inside a stage run concurrently; a step's output feeds each
//! declared successor, with ROUTE steps fanning out per branch via the
//! route evaluator instead of a 1:1 feed. Record errors become dead
//! letters, never silent drops. Cancellation is cooperative: in-flight
//! steps finish their current chunks, later stages never start.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use serde_json::json;
use tokio::task::JoinSet;
use tokio::time::Instant;

use batchflow_types::error::PipelineError;
use batchflow_types::hook::HookStage;
use batchflow_types::record::Record;
use batchflow_types::result::{
    PipelineRun, RunMetrics, RunStatus, StepResult, StepStatus,
};
use uuid::Uuid;

use crate::compiler::{CompiledStep, ExecutionPlan};
use crate::dead_letter::RetryQueue;
use crate::executor::{ExecutedStep, RunContext, StepExecutor};
use crate::hooks::{HookDispatcher, HookPayload};
use crate::registry::AdapterRegistry;
use crate::route::RouteEvaluator;
use crate::throughput::ThroughputController;

const DEFAULT_SAMPLE_LIMIT: usize = 10;

/// Options for a single run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Execute against a capped sample without invoking side-effecting
    /// loaders.
    pub dry_run: bool,
    /// Per-step record cap in dry runs.
    pub sample_limit: usize,
    /// Records seeding the entry steps (trigger/webhook/event payload).
    pub seed: Vec<Record>,
    /// Externally assigned run id (the service hands these out before
    /// spawning); a fresh UUID otherwise.
    pub run_id: Option<String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            sample_limit: DEFAULT_SAMPLE_LIMIT,
            seed: Vec::new(),
            run_id: None,
        }
    }
}

/// Before/after sample of one step, collected during dry runs.
#[derive(Debug, Clone)]
pub struct StepSample {
    pub step: String,
    pub before: Vec<Record>,
    pub after: Vec<Record>,
}

/// Dry-run outcome: metrics, notes, per-step samples.
#[derive(Debug, Clone, Default)]
pub struct DryRunReport {
    pub metrics: RunMetrics,
    pub notes: Vec<String>,
    pub samples: Vec<StepSample>,
}

/// A finished (or failed, or cancelled) run plus its dry-run report.
pub struct RunOutcome {
    pub run: PipelineRun,
    pub dry_run: Option<DryRunReport>,
}

/// Top-level driver owning run status and cancellation.
pub struct RunOrchestrator {
    registry: Arc<AdapterRegistry>,
    hooks: Arc<HookDispatcher>,
    retry_queue: Arc<RetryQueue>,
    executor: StepExecutor,
    routes: RouteEvaluator,
}

impl RunOrchestrator {
    #[must_use]
    pub fn new(
        registry: Arc<AdapterRegistry>,
        hooks: Arc<HookDispatcher>,
        retry_queue: Arc<RetryQueue>,
    ) -> Self {
        Self {
            executor: StepExecutor::new(registry.clone()),
            registry,
            hooks,
            retry_queue,
            routes: RouteEvaluator::new(),
        }
    }

    /// Execute a compiled plan to completion, cancellation, or failure.
    #[allow(clippy::too_many_lines)]
    pub async fn run(
        &self,
        plan: &ExecutionPlan,
        options: RunOptions,
        cancelled: Arc<AtomicBool>,
    ) -> RunOutcome {
        let start = Instant::now();
        let mut run = PipelineRun {
            id: options
                .run_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            pipeline: plan.pipeline.clone(),
            status: RunStatus::Running,
            started_at: Some(chrono::Utc::now()),
            ..PipelineRun::default()
        };
        tracing::info!(
            pipeline = plan.pipeline,
            run_id = run.id,
            dry_run = options.dry_run,
            stages = plan.stages.len(),
            "Starting pipeline run"
        );
        self.hooks.fire(&HookPayload::new(
            HookStage::PipelineStarted,
            plan.pipeline.as_str(),
            json!({"runId": run.id, "startedAt": run.started_at}),
        ));

        let mut ctx = RunContext::new(plan.pipeline.clone(), self.hooks.clone());
        ctx.variables = plan.variables.clone();
        ctx.cancelled = cancelled;

        let controllers: HashMap<String, Arc<ThroughputController>> = plan
            .stages
            .iter()
            .flatten()
            .filter_map(|key| {
                plan.step(key).map(|step| {
                    (
                        key.clone(),
                        Arc::new(ThroughputController::new(&step.def.throughput)),
                    )
                })
            })
            .collect();

        let mut pending: HashMap<String, Vec<Record>> = HashMap::new();
        let mut report = DryRunReport::default();
        let mut fatal: Option<PipelineError> = None;
        let mut saw_cancelled_step = false;

        for (stage_index, stage) in plan.stages.iter().enumerate() {
            if fatal.is_some() {
                break;
            }
            if ctx.is_cancelled() {
                // Further stages never start.
                saw_cancelled_step = true;
                break;
            }

            let mut join_set: JoinSet<(CompiledStep, ExecutedStep)> = JoinSet::new();
            // Inputs are kept for dead-letter payloads and dry-run samples.
            let mut inputs_by_key: HashMap<String, Vec<Record>> = HashMap::new();
            for key in stage {
                let Some(step) = plan.step(key) else {
                    continue;
                };
                let mut records = pending.remove(key).unwrap_or_default();
                // Entry steps receive the trigger payload.
                if stage_index == 0 && step.predecessors.is_empty() {
                    records = options.seed.clone();
                }
                if options.dry_run {
                    records.truncate(options.sample_limit);
                }
                inputs_by_key.insert(key.clone(), records.clone());

                if options.dry_run && self.skipped_in_dry_run(step) {
                    report
                        .notes
                        .push(format!("step '{key}' skipped (side-effecting adapter)"));
                    // Records flow on so downstream steps still see data.
                    let result = StepResult::skipped(key.clone());
                    run.step_results.push(result);
                    self.distribute(step, records, &mut pending);
                    continue;
                }

                let executor = self.executor.clone();
                let controller = controllers
                    .get(key)
                    .cloned()
                    .unwrap_or_else(|| Arc::new(ThroughputController::new(&step.def.throughput)));
                let step = step.clone();
                let task_ctx = ctx.clone();
                join_set.spawn(async move {
                    let executed = executor
                        .execute(&step, &controller, records, &task_ctx)
                        .await;
                    (step, executed)
                });
            }

            while let Some(joined) = join_set.join_next().await {
                let Ok((step, executed)) = joined else {
                    fatal = Some(PipelineError::system(
                        "TASK_PANIC",
                        "step task panicked",
                    ));
                    continue;
                };
                let ExecutedStep {
                    mut result,
                    outputs,
                } = executed;
                let inputs = inputs_by_key.remove(&step.def.key).unwrap_or_default();

                if options.dry_run {
                    report.samples.push(StepSample {
                        step: step.def.key.clone(),
                        before: inputs,
                        after: outputs.iter().take(options.sample_limit).cloned().collect(),
                    });
                } else {
                    self.capture_dead_letters(&step, &result, &inputs, &mut run);
                }

                match result.status {
                    StepStatus::Error if !step.def.continue_on_error => {
                        fatal = Some(result.failure.clone().unwrap_or_else(|| {
                            PipelineError::system("STEP_FAILED", "step failed")
                                .with_step(step.def.key.as_str())
                        }));
                    }
                    StepStatus::Cancelled => saw_cancelled_step = true,
                    _ => {}
                }

                self.route_or_feed(&step, outputs, &mut result, &mut pending);
                run.step_results.push(result);
            }
        }

        // Aggregate metrics over every step that ran.
        let mut metrics = RunMetrics::default();
        for result in &run.step_results {
            metrics.error_count += result.metrics.error_count;
            metrics.dropped_count += result.metrics.dropped_count;
        }
        metrics.records_in = run
            .step_results
            .iter()
            .filter(|r| {
                plan.step(&r.step_key)
                    .is_some_and(|s| s.predecessors.is_empty())
            })
            .map(|r| r.metrics.output_count)
            .sum();
        metrics.records_out = run
            .step_results
            .iter()
            .filter(|r| {
                plan.step(&r.step_key)
                    .is_some_and(|s| s.successors.is_empty())
            })
            .map(|r| r.metrics.output_count)
            .sum();
        metrics.dead_letter_count = run.metrics.dead_letter_count;
        #[allow(clippy::cast_possible_truncation)]
        {
            metrics.duration_ms = start.elapsed().as_millis() as u64;
        }
        run.metrics = metrics;
        run.finished_at = Some(chrono::Utc::now());

        run.status = if let Some(error) = fatal {
            run.error = Some(error);
            RunStatus::Error
        } else if saw_cancelled_step || ctx.is_cancelled() {
            RunStatus::Cancelled
        } else {
            RunStatus::Success
        };

        match run.status {
            RunStatus::Error => {
                tracing::error!(
                    pipeline = plan.pipeline,
                    run_id = run.id,
                    error = run.error.as_ref().map(ToString::to_string),
                    "Pipeline run failed"
                );
                self.hooks.fire(&HookPayload::new(
                    HookStage::PipelineFailed,
                    plan.pipeline.as_str(),
                    json!({
                        "runId": run.id,
                        "error": run.error.as_ref().map(ToString::to_string),
                    }),
                ));
            }
            _ => {
                tracing::info!(
                    pipeline = plan.pipeline,
                    run_id = run.id,
                    status = ?run.status,
                    records_in = run.metrics.records_in,
                    records_out = run.metrics.records_out,
                    duration_ms = run.metrics.duration_ms,
                    "Pipeline run finished"
                );
                self.hooks.fire(&HookPayload::new(
                    HookStage::PipelineCompleted,
                    plan.pipeline.as_str(),
                    json!({
                        "runId": run.id,
                        "status": run.status,
                        "recordsIn": run.metrics.records_in,
                        "recordsOut": run.metrics.records_out,
                        "durationMs": run.metrics.duration_ms,
                    }),
                ));
            }
        }

        if options.dry_run {
            report.metrics = run.metrics;
            RunOutcome {
                run,
                dry_run: Some(report),
            }
        } else {
            RunOutcome { run, dry_run: None }
        }
    }

    /// Resubmit a single record into one step of a plan (patch-and-retry).
    ///
    /// # Errors
    ///
    /// Returns a CONFIGURATION error when the step is not in the plan.
    pub async fn resubmit(
        &self,
        plan: &ExecutionPlan,
        step_key: &str,
        record: Record,
    ) -> Result<StepResult, PipelineError> {
        let step = plan.step(step_key).ok_or_else(|| {
            PipelineError::configuration(
                "UNKNOWN_STEP",
                format!("step '{step_key}' is not part of pipeline '{}'", plan.pipeline),
            )
        })?;
        let mut ctx = RunContext::new(plan.pipeline.clone(), self.hooks.clone());
        ctx.variables = plan.variables.clone();
        let controller = ThroughputController::new(&step.def.throughput);
        let executed = self
            .executor
            .execute(step, &controller, vec![record], &ctx)
            .await;
        Ok(executed.result)
    }

    fn skipped_in_dry_run(&self, step: &CompiledStep) -> bool {
        step.def.step_type.is_side_effecting()
            && !self
                .registry
                .definition(&step.def.adapter_code)
                .is_some_and(|d| d.pure)
    }

    /// Feed a finished step's output to its successors — ROUTE steps fan
    /// out per branch, everything else feeds every successor edge.
    fn route_or_feed(
        &self,
        step: &CompiledStep,
        outputs: Vec<Record>,
        result: &mut StepResult,
        pending: &mut HashMap<String, Vec<Record>>,
    ) {
        if step.successors.is_empty() {
            return;
        }
        if let Some(route) = &step.route {
            let mut forwarded = 0u64;
            let mut dropped = 0u64;
            for record in outputs {
                match self.routes.evaluate(route, &record).branch_name() {
                    Some(branch) => {
                        let mut matched = false;
                        for edge in &step.successors {
                            if edge.branch.as_deref() == Some(branch) {
                                pending.entry(edge.to.clone()).or_default().push(record.clone());
                                matched = true;
                            }
                        }
                        if matched {
                            forwarded += 1;
                        } else {
                            // Branch declared but wired to no edge.
                            dropped += 1;
                        }
                    }
                    None => dropped += 1,
                }
            }
            result.metrics.dropped_count += dropped;
            result.metrics.output_count = forwarded;
            return;
        }

        self.distribute(step, outputs, pending);
    }

    /// Plain 1:N feed along non-branch edges, honoring edge conditions.
    fn distribute(
        &self,
        step: &CompiledStep,
        outputs: Vec<Record>,
        pending: &mut HashMap<String, Vec<Record>>,
    ) {
        for edge in &step.successors {
            let forwarded: Vec<Record> = match &edge.condition {
                Some(condition) => outputs
                    .iter()
                    .filter(|record| {
                        crate::expr::evaluate(condition, record, None)
                            .map(|v| crate::expr::truthy(&v))
                            .unwrap_or(false)
                    })
                    .cloned()
                    .collect(),
                None => outputs.clone(),
            };
            if !forwarded.is_empty() {
                pending.entry(edge.to.clone()).or_default().extend(forwarded);
            }
        }
    }

    fn capture_dead_letters(
        &self,
        step: &CompiledStep,
        result: &StepResult,
        inputs: &[Record],
        run: &mut PipelineRun,
    ) {
        for error in &result.errors {
            let payload = error
                .record_index
                .and_then(|index| inputs.get(index))
                .cloned()
                .unwrap_or(serde_json::Value::Null);
            match self
                .retry_queue
                .capture(&run.pipeline, &step.def.key, payload, error.clone())
            {
                Ok(letter) => {
                    run.metrics.dead_letter_count += 1;
                    self.hooks.fire(
                        &HookPayload::new(
                            HookStage::OnDeadLetter,
                            run.pipeline.as_str(),
                            json!({
                                "deadLetterId": letter.id,
                                "error": {
                                    "code": error.code,
                                    "message": error.message,
                                    "retriable": error.retriable,
                                },
                            }),
                        )
                        .for_step(step.def.key.as_str()),
                    );
                }
                Err(store_error) => {
                    tracing::error!(
                        step = step.def.key,
                        %store_error,
                        "Failed to persist dead letter"
                    );
                }
            }
        }
    }
}
