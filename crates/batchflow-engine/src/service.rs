//! The engine's front door for the transport layer.
//!
//! [`PipelineService`] owns the registry, hook dispatcher, dead-letter
//! store, and consumer manager, and exposes the operations the transport
//! layer (GraphQL/CLI/webhook handlers) calls: validate, start/cancel
//! runs, dry runs, retry-record, mark-dead-letter, consumer control, and
//! queue statistics.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use batchflow_types::definition::PipelineDefinition;
use batchflow_types::error::PipelineError;
use batchflow_types::record::Record;
use batchflow_types::result::{PipelineQueueStats, PipelineRun, QueueStats, RunStatus, StepStatus};
use uuid::Uuid;

use crate::compiler::{self, ExecutionPlan, Validation, ValidationLevel};
use crate::consumer::{ConsumerHandler, ConsumerManager, ConsumerSource};
use crate::dead_letter::{DeadLetterStore, MemoryDeadLetterStore, RetryQueue};
use crate::hooks::HookDispatcher;
use crate::orchestrator::{DryRunReport, RunOptions, RunOrchestrator};
use crate::registry::AdapterRegistry;

struct RunEntry {
    cancelled: Arc<AtomicBool>,
    run: Arc<Mutex<PipelineRun>>,
}

/// Engine facade: one instance per installation.
pub struct PipelineService {
    registry: Arc<AdapterRegistry>,
    hooks: Arc<HookDispatcher>,
    retry_queue: Arc<RetryQueue>,
    consumers: ConsumerManager,
    orchestrator: Arc<RunOrchestrator>,
    pipelines: Mutex<HashMap<String, PipelineDefinition>>,
    runs: Mutex<HashMap<String, RunEntry>>,
}

impl PipelineService {
    /// Service with the in-memory dead-letter store.
    #[must_use]
    pub fn new(registry: Arc<AdapterRegistry>) -> Self {
        Self::with_store(registry, Arc::new(MemoryDeadLetterStore::new()))
    }

    /// Service over a caller-provided dead-letter store.
    #[must_use]
    pub fn with_store(registry: Arc<AdapterRegistry>, store: Arc<dyn DeadLetterStore>) -> Self {
        let hooks = Arc::new(HookDispatcher::new());
        let retry_queue = Arc::new(RetryQueue::new(store));
        let orchestrator = Arc::new(RunOrchestrator::new(
            registry.clone(),
            hooks.clone(),
            retry_queue.clone(),
        ));
        Self {
            registry,
            hooks,
            retry_queue,
            consumers: ConsumerManager::new(),
            orchestrator,
            pipelines: Mutex::new(HashMap::new()),
            runs: Mutex::new(HashMap::new()),
        }
    }

    /// Hook dispatcher, for registering listeners.
    #[must_use]
    pub fn hooks(&self) -> &Arc<HookDispatcher> {
        &self.hooks
    }

    /// Dead-letter operations.
    #[must_use]
    pub fn retry_queue(&self) -> &Arc<RetryQueue> {
        &self.retry_queue
    }

    /// Validate a definition without registering or running it.
    #[must_use]
    pub fn validate(&self, definition: &PipelineDefinition, level: ValidationLevel) -> Validation {
        compiler::validate(definition, &self.registry, level)
    }

    /// Register (or replace) a pipeline definition. The definition must
    /// compile at warn level.
    ///
    /// # Errors
    ///
    /// Returns the compile failure of an invalid definition.
    pub fn register_pipeline(&self, definition: PipelineDefinition) -> Result<(), PipelineError> {
        compiler::compile(&definition, &self.registry, ValidationLevel::Warn).map_err(|failure| {
            PipelineError::configuration("INVALID_PIPELINE", failure.to_string())
        })?;
        lock(&self.pipelines).insert(definition.name.clone(), definition);
        Ok(())
    }

    /// Start a run in the background; the returned [`PipelineRun`] is the
    /// initial snapshot (status RUNNING). Poll [`run`](Self::run) for the
    /// terminal state.
    ///
    /// # Errors
    ///
    /// Unknown pipelines and compile failures are CONFIGURATION errors.
    pub fn start_run(
        &self,
        pipeline: &str,
        seed: Vec<Record>,
    ) -> Result<PipelineRun, PipelineError> {
        let plan = self.compile_registered(pipeline)?;
        let run_id = Uuid::new_v4().to_string();
        let cancelled = Arc::new(AtomicBool::new(false));

        let snapshot = PipelineRun {
            id: run_id.clone(),
            pipeline: pipeline.to_string(),
            status: RunStatus::Running,
            started_at: Some(Utc::now()),
            ..PipelineRun::default()
        };
        let shared = Arc::new(Mutex::new(snapshot.clone()));
        lock(&self.runs).insert(
            run_id.clone(),
            RunEntry {
                cancelled: cancelled.clone(),
                run: shared.clone(),
            },
        );

        let orchestrator = self.orchestrator.clone();
        let options = RunOptions {
            seed,
            run_id: Some(run_id),
            ..RunOptions::default()
        };
        tokio::spawn(async move {
            let outcome = orchestrator.run(&plan, options, cancelled).await;
            *lock(&shared) = outcome.run;
        });

        Ok(snapshot)
    }

    /// Request cancellation of a run and return its current snapshot.
    /// In-flight steps finish their current chunks; later stages never
    /// start. Returns `None` for unknown run ids.
    #[must_use]
    pub fn cancel_run(&self, run_id: &str) -> Option<PipelineRun> {
        let runs = lock(&self.runs);
        let entry = runs.get(run_id)?;
        entry.cancelled.store(true, Ordering::SeqCst);
        tracing::info!(run_id, "Run cancellation requested");
        let snapshot = lock(&entry.run).clone();
        Some(snapshot)
    }

    /// Current snapshot of a run (terminal once the run finished).
    #[must_use]
    pub fn run(&self, run_id: &str) -> Option<PipelineRun> {
        let runs = lock(&self.runs);
        runs.get(run_id).map(|entry| lock(&entry.run).clone())
    }

    /// Execute a registered pipeline against a capped sample without
    /// invoking side-effecting loaders.
    ///
    /// # Errors
    ///
    /// Unknown pipelines and compile failures are CONFIGURATION errors.
    pub async fn dry_run(&self, pipeline: &str) -> Result<DryRunReport, PipelineError> {
        let plan = self.compile_registered(pipeline)?;
        let outcome = self
            .orchestrator
            .run(
                &plan,
                RunOptions {
                    dry_run: true,
                    ..RunOptions::default()
                },
                Arc::new(AtomicBool::new(false)),
            )
            .await;
        outcome.dry_run.ok_or_else(|| {
            PipelineError::system("DRY_RUN_MISSING", "dry run produced no report")
        })
    }

    /// Patch-and-retry a dead letter: merge the patch over the original
    /// payload, append an audit row, and resubmit into the originating
    /// step. Returns whether the resubmission succeeded.
    ///
    /// # Errors
    ///
    /// Storage and compile failures.
    pub async fn retry_record(
        &self,
        error_id: &str,
        patch: Option<Value>,
    ) -> Result<bool, PipelineError> {
        self.retry_record_as(error_id, patch, "system").await
    }

    /// [`retry_record`](Self::retry_record) with an explicit actor for
    /// the audit trail.
    ///
    /// # Errors
    ///
    /// Storage and compile failures.
    pub async fn retry_record_as(
        &self,
        error_id: &str,
        patch: Option<Value>,
        actor: &str,
    ) -> Result<bool, PipelineError> {
        let Some(dispatch) = self.retry_queue.prepare_retry(error_id, patch, actor)? else {
            return Ok(false);
        };
        let plan = self.compile_registered(&dispatch.pipeline)?;
        let result = self
            .orchestrator
            .resubmit(&plan, &dispatch.step_key, dispatch.record)
            .await?;
        let succeeded = result.status == StepStatus::Success && result.errors.is_empty();
        if succeeded {
            // A successful resubmission retires the dead letter.
            self.retry_queue.mark_dead(error_id, true)?;
            tracing::info!(dead_letter_id = error_id, "Retry succeeded, letter retired");
        }
        Ok(succeeded)
    }

    /// Mark or unmark a dead letter as permanently dead.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub fn mark_dead_letter(&self, id: &str, dead: bool) -> Result<bool, PipelineError> {
        self.retry_queue.mark_dead(id, dead)
    }

    /// Start a streaming consumer feeding the named pipeline. No-op
    /// (false) if one is already active.
    ///
    /// # Errors
    ///
    /// Unknown pipelines and compile failures are CONFIGURATION errors.
    pub fn start_consumer(
        &self,
        pipeline: &str,
        source: Arc<dyn ConsumerSource>,
    ) -> Result<bool, PipelineError> {
        let plan = Arc::new(self.compile_registered(pipeline)?);
        let handler = Arc::new(RunPipelineHandler {
            orchestrator: self.orchestrator.clone(),
            plan,
        });
        Ok(self.consumers.start(pipeline, source, handler))
    }

    /// Gracefully stop the consumer for a pipeline. No-op (false) when
    /// none is active.
    pub async fn stop_consumer(&self, pipeline: &str) -> bool {
        self.consumers.stop(pipeline).await
    }

    /// Installation-wide queue statistics.
    #[must_use]
    pub fn queue_stats(&self) -> QueueStats {
        let mut stats = QueueStats::default();
        let today = Utc::now().date_naive();
        {
            let runs = lock(&self.runs);
            for entry in runs.values() {
                let run = lock(&entry.run);
                match run.status {
                    RunStatus::Pending => stats.pending += 1,
                    RunStatus::Running => stats.running += 1,
                    RunStatus::Error => stats.failed += 1,
                    RunStatus::Success => {
                        if run
                            .finished_at
                            .is_some_and(|at| at.date_naive() == today)
                        {
                            stats.completed_today += 1;
                        }
                    }
                    RunStatus::Cancelled => {}
                }
            }
        }
        stats.by_pipeline = self
            .consumers
            .all_stats()
            .into_iter()
            .map(|(pipeline, consumer)| PipelineQueueStats {
                pipeline,
                processed: consumer.messages_processed,
                failed: consumer.messages_failed,
                active: consumer.is_active,
            })
            .collect();
        stats
    }

    fn compile_registered(&self, pipeline: &str) -> Result<ExecutionPlan, PipelineError> {
        let definition = lock(&self.pipelines)
            .get(pipeline)
            .cloned()
            .ok_or_else(|| {
                PipelineError::configuration(
                    "UNKNOWN_PIPELINE",
                    format!("no pipeline '{pipeline}' registered"),
                )
            })?;
        compiler::compile(&definition, &self.registry, ValidationLevel::Warn)
            .map_err(|failure| PipelineError::configuration("INVALID_PIPELINE", failure.to_string()))
    }
}

/// Consumer handler that runs the pipeline once per polled batch.
struct RunPipelineHandler {
    orchestrator: Arc<RunOrchestrator>,
    plan: Arc<ExecutionPlan>,
}

#[async_trait]
impl ConsumerHandler for RunPipelineHandler {
    async fn handle(&self, batch: Vec<Record>) -> Result<(), PipelineError> {
        let outcome = self
            .orchestrator
            .run(
                &self.plan,
                RunOptions {
                    seed: batch,
                    ..RunOptions::default()
                },
                Arc::new(AtomicBool::new(false)),
            )
            .await;
        match outcome.run.status {
            RunStatus::Error => Err(outcome
                .run
                .error
                .unwrap_or_else(|| PipelineError::system("RUN_FAILED", "run failed"))),
            _ => Ok(()),
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
    use crate::adapters::{builtin_registry_with_sink, SharedBuffer};
    use batchflow_types::definition::{PipelineEdge, PipelineStepDefinition, StepType};
    use serde_json::json;
    use std::time::Duration;

    fn service_with_sink() -> (PipelineService, SharedBuffer) {
        let buffer: SharedBuffer = Arc::new(Mutex::new(Vec::new()));
        let registry = Arc::new(builtin_registry_with_sink(buffer.clone()));
        (PipelineService::new(registry), buffer)
    }

    fn sample_definition() -> PipelineDefinition {
        PipelineDefinition {
            name: "orders".into(),
            nodes: vec![
                PipelineStepDefinition::new("extract", StepType::Extract, "memory-extract")
                    .with_config(json!({"records": [{"qty": 1}, {"qty": 2}]})),
                PipelineStepDefinition::new("sink", StepType::Sink, "collect-sink"),
            ],
            edges: vec![PipelineEdge::new("extract", "sink")],
            ..PipelineDefinition::default()
        }
    }

    async fn wait_terminal(service: &PipelineService, run_id: &str) -> PipelineRun {
        for _ in 0..100 {
            if let Some(run) = service.run(run_id) {
                if run.status.is_terminal() {
                    return run;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("run {run_id} did not finish");
    }

    #[tokio::test]
    async fn start_run_executes_in_background() {
        let (service, buffer) = service_with_sink();
        service.register_pipeline(sample_definition()).unwrap();

        let snapshot = service.start_run("orders", Vec::new()).unwrap();
        assert_eq!(snapshot.status, RunStatus::Running);

        let run = wait_terminal(&service, &snapshot.id).await;
        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(run.metrics.records_in, 2);
        assert_eq!(run.metrics.records_out, 2);
        assert_eq!(buffer.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unknown_pipeline_is_a_configuration_error() {
        let (service, _buffer) = service_with_sink();
        let error = service.start_run("ghost", Vec::new()).unwrap_err();
        assert_eq!(error.code, "UNKNOWN_PIPELINE");
    }

    #[tokio::test]
    async fn queue_stats_counts_runs() {
        let (service, _buffer) = service_with_sink();
        service.register_pipeline(sample_definition()).unwrap();
        let snapshot = service.start_run("orders", Vec::new()).unwrap();
        wait_terminal(&service, &snapshot.id).await;

        let stats = service.queue_stats();
        assert_eq!(stats.completed_today, 1);
        assert_eq!(stats.running, 0);
        assert_eq!(stats.failed, 0);
    }

    #[tokio::test]
    async fn retry_record_round_trip() {
        let (service, _buffer) = service_with_sink();
        // Pipeline whose validate step dead-letters records missing 'qty'.
        let definition = PipelineDefinition {
            name: "strict".into(),
            nodes: vec![
                PipelineStepDefinition {
                    continue_on_error: true,
                    ..PipelineStepDefinition::new("validate", StepType::Validate, "schema-validate")
                        .with_config(json!({"required": ["qty"]}))
                },
            ],
            ..PipelineDefinition::default()
        };
        service.register_pipeline(definition).unwrap();

        let snapshot = service
            .start_run("strict", vec![json!({"name": "x"})])
            .unwrap();
        wait_terminal(&service, &snapshot.id).await;

        let letters = service.retry_queue().store().list(Some("strict")).unwrap();
        assert_eq!(letters.len(), 1);
        let letter = &letters[0];
        assert_eq!(letter.payload, json!({"name": "x"}));

        // Without the patch the record still fails.
        assert!(!service.retry_record(&letter.id, None).await.unwrap());
        // With the patch it passes and the letter is retired.
        assert!(service
            .retry_record(&letter.id, Some(json!({"qty": 5})))
            .await
            .unwrap());
        let stored = service.retry_queue().store().get(&letter.id).unwrap().unwrap();
        assert!(stored.dead);
    }

    #[tokio::test]
    async fn mark_dead_letter_flips_state() {
        let (service, _buffer) = service_with_sink();
        let letter = service
            .retry_queue()
            .capture(
                "p",
                "s",
                json!({}),
                batchflow_types::error::RecordError::new("X", "y"),
            )
            .unwrap();
        assert!(service.mark_dead_letter(&letter.id, true).unwrap());
        assert!(!service.mark_dead_letter("ghost", true).unwrap());
    }
}
