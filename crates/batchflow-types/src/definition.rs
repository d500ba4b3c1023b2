//! Pipeline definition: the node/edge graph a pipeline is compiled from.
//!
//! Definitions originate from a JSON-speaking control plane, so all field
//! names serialize as camelCase. The engine never mutates a definition;
//! it compiles one into an execution plan.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::trigger::Trigger;

// ── Step graph ──────────────────────────────────────────────────────

/// A complete pipeline definition: typed steps plus the edges wiring them.
///
/// Invariants (enforced by the compiler): step keys are unique, every
/// edge endpoint references an existing step, and the graph is acyclic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineDefinition {
    /// Pipeline code, unique within the installation.
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<PipelineStepDefinition>,
    #[serde(default)]
    pub edges: Vec<PipelineEdge>,
    /// Pipeline-scoped variables, visible to expressions as `vars.*`.
    #[serde(default)]
    pub variables: serde_json::Map<String, Value>,
    #[serde(default)]
    pub triggers: Vec<Trigger>,
}

/// The kind of work a step performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepType {
    Trigger,
    Extract,
    Transform,
    Validate,
    Enrich,
    Route,
    Load,
    Export,
    Feed,
    Sink,
}

impl StepType {
    /// Steps of these types write into external systems and are skipped
    /// during dry runs when their adapter is not pure.
    #[must_use]
    pub fn is_side_effecting(self) -> bool {
        matches!(self, Self::Load | Self::Export | Self::Feed)
    }
}

/// One node in the pipeline graph, bound to an adapter and execution knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStepDefinition {
    pub key: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    pub adapter_code: String,
    /// Opaque adapter configuration, validated against the adapter's schema.
    #[serde(default)]
    pub config: Value,
    /// Run chunks of this step concurrently.
    #[serde(default)]
    pub parallel: bool,
    #[serde(default, rename = "async")]
    pub is_async: bool,
    /// Step-level retry attempts after a retryable failure.
    #[serde(default)]
    pub retries: u32,
    /// Fixed delay between step-level retry attempts.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Deadline for a single adapter call, per chunk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Keep processing after record-level errors instead of aborting the run.
    #[serde(default)]
    pub continue_on_error: bool,
    /// Expression gating records into this step; non-matching records
    /// bypass the adapter unchanged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Tie-break ordering among steps of the same stage.
    #[serde(default)]
    pub order: i32,
    #[serde(default)]
    pub throughput: ThroughputConfig,
    /// Declared upstream step keys (informational; edges are authoritative).
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Declared downstream step keys (informational; edges are authoritative).
    #[serde(default)]
    pub outputs: Vec<String>,
}

fn default_retry_delay_ms() -> u64 {
    1_000
}

impl PipelineStepDefinition {
    /// Minimal step with defaults for every execution knob.
    pub fn new(key: impl Into<String>, step_type: StepType, adapter_code: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            step_type,
            adapter_code: adapter_code.into(),
            config: Value::Null,
            parallel: false,
            is_async: false,
            retries: 0,
            retry_delay_ms: default_retry_delay_ms(),
            timeout_ms: None,
            continue_on_error: false,
            condition: None,
            order: 0,
            throughput: ThroughputConfig::default(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }
}

/// A directed edge between two steps. Edges leaving a ROUTE step carry the
/// branch name they belong to; an optional condition expression filters
/// records flowing along the edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineEdge {
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl PipelineEdge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            branch: None,
            condition: None,
        }
    }

    #[must_use]
    pub fn on_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }
}

// ── Throughput ──────────────────────────────────────────────────────

/// Policy applied when a step's error rate crosses its configured threshold.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DrainStrategy {
    /// Exponentially increasing delay before admitting further chunks.
    #[default]
    Backoff,
    /// Stop admitting new chunks until the error rate recovers.
    Shed,
    /// Buffer chunks without executing them, signalling backpressure.
    Queue,
}

/// What SHED does with chunks already in flight when the threshold trips.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShedInFlight {
    /// In-flight chunks finish and their output is kept.
    #[default]
    LetFinish,
    /// In-flight chunk output is discarded and counted as dropped.
    Drop,
}

/// Error-rate trip wire: fraction of record errors over a sliding window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PauseOnErrorRate {
    /// Fraction in `0.0..=1.0`.
    pub threshold: f64,
    /// Sliding window length in seconds.
    pub interval_sec: u64,
}

/// Per-step rate limiting, batching, and drain configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThroughputConfig {
    /// Records per second admitted into the step (None = unlimited).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_rps: Option<u32>,
    /// Concurrent chunks within the step.
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,
    /// Chunk size (None = the whole batch in one chunk).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause_on_error_rate: Option<PauseOnErrorRate>,
    #[serde(default)]
    pub drain_strategy: DrainStrategy,
    #[serde(default)]
    pub shed_in_flight: ShedInFlight,
    /// Buffered-chunk bound for the QUEUE drain strategy.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_concurrency() -> u32 {
    1
}

fn default_queue_capacity() -> usize {
    64
}

impl Default for ThroughputConfig {
    fn default() -> Self {
        Self {
            rate_limit_rps: None,
            concurrency: default_concurrency(),
            batch_size: None,
            pause_on_error_rate: None,
            drain_strategy: DrainStrategy::default(),
            shed_in_flight: ShedInFlight::default(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

// ── Routing ─────────────────────────────────────────────────────────

/// Comparator applied by a route condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Comparator {
    Eq,
    Ne,
    Gt,
    Lt,
    Gte,
    Lte,
    In,
    NotIn,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    Matches,
    Exists,
    IsNull,
}

/// One predicate over a record field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteCondition {
    /// Dotted field path into the record.
    pub field: String,
    pub cmp: Comparator,
    /// Comparison operand; unused for `exists` / `isNull`.
    #[serde(default)]
    pub value: Value,
}

/// A named conditional output of a ROUTE step. All conditions in `when`
/// must hold for the branch to match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteBranch {
    pub name: String,
    #[serde(default)]
    pub when: Vec<RouteCondition>,
}

/// ROUTE step configuration. Branch evaluation is first-match-wins in
/// declaration order; unmatched records with no default are dropped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteConfig {
    #[serde(default)]
    pub branches: Vec<RouteBranch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_branch: Option<String>,
}
