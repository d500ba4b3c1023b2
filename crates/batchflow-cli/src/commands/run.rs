use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use anyhow::Result;

use batchflow_engine::adapters::builtin_registry_with_sink;
use batchflow_engine::compiler::{compile, ValidationLevel};
use batchflow_engine::dead_letter::{MemoryDeadLetterStore, RetryQueue};
use batchflow_engine::hooks::HookDispatcher;
use batchflow_engine::loader;
use batchflow_engine::orchestrator::{RunOptions, RunOrchestrator};
use batchflow_types::result::RunStatus;

/// Run a pipeline file to completion and print a summary.
pub async fn execute(path: &Path, dry_run: bool, limit: Option<usize>) -> Result<()> {
    let definition = loader::parse_definition(path)?;
    let buffer = Arc::new(Mutex::new(Vec::new()));
    let registry = Arc::new(builtin_registry_with_sink(buffer.clone()));

    let plan = compile(&definition, &registry, ValidationLevel::Warn)
        .map_err(|failure| anyhow::anyhow!("{failure}"))?;
    for warning in &plan.warnings {
        tracing::warn!("{warning}");
    }

    let hooks = Arc::new(HookDispatcher::new());
    let retry_queue = Arc::new(RetryQueue::new(Arc::new(MemoryDeadLetterStore::new())));
    let orchestrator = RunOrchestrator::new(registry, hooks, retry_queue.clone());

    let mut options = RunOptions {
        dry_run: dry_run || limit.is_some(),
        ..RunOptions::default()
    };
    if let Some(limit) = limit {
        options.sample_limit = limit;
    }
    let dry = options.dry_run;

    let outcome = orchestrator
        .run(&plan, options, Arc::new(AtomicBool::new(false)))
        .await;
    let run = &outcome.run;

    println!(
        "run {} finished: {:?} ({} in, {} out, {} errors, {} dead letters, {}ms)",
        run.id,
        run.status,
        run.metrics.records_in,
        run.metrics.records_out,
        run.metrics.error_count,
        run.metrics.dead_letter_count,
        run.metrics.duration_ms
    );
    for result in &run.step_results {
        println!(
            "  {:<20} {:?}: in={} out={} errors={} dropped={}",
            result.step_key,
            result.status,
            result.metrics.input_count,
            result.metrics.output_count,
            result.metrics.error_count,
            result.metrics.dropped_count
        );
    }

    if dry {
        if let Some(report) = &outcome.dry_run {
            for note in &report.notes {
                println!("note: {note}");
            }
            for sample in &report.samples {
                println!("sample [{}]:", sample.step);
                for (before, after) in sample.before.iter().zip(sample.after.iter()) {
                    println!("  {before} -> {after}");
                }
            }
        }
    }

    let letters = retry_queue.store().list(None)?;
    if !letters.is_empty() {
        println!("{} record(s) dead-lettered:", letters.len());
        for letter in letters {
            println!("  {} [{}] {}", letter.id, letter.step_key, letter.error.message);
        }
    }

    match run.status {
        RunStatus::Success => Ok(()),
        status => anyhow::bail!("run ended with status {status:?}"),
    }
}
