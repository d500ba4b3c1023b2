//! Lifecycle and data hook stages.
//!
//! The stage catalog is fixed; each stage documents an example payload
//! shape used for hook testing. The catalog lives here exactly once —
//! every consumer keys off [`HookStage`].

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

use crate::definition::StepType;

/// A named interception point fired with a structured payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HookStage {
    PipelineStarted,
    PipelineCompleted,
    PipelineFailed,
    BeforeExtract,
    AfterExtract,
    BeforeTransform,
    AfterTransform,
    BeforeValidate,
    AfterValidate,
    BeforeEnrich,
    AfterEnrich,
    BeforeRoute,
    AfterRoute,
    BeforeLoad,
    AfterLoad,
    OnError,
    OnRetry,
    OnDeadLetter,
}

impl fmt::Display for HookStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::PipelineStarted => "PIPELINE_STARTED",
            Self::PipelineCompleted => "PIPELINE_COMPLETED",
            Self::PipelineFailed => "PIPELINE_FAILED",
            Self::BeforeExtract => "BEFORE_EXTRACT",
            Self::AfterExtract => "AFTER_EXTRACT",
            Self::BeforeTransform => "BEFORE_TRANSFORM",
            Self::AfterTransform => "AFTER_TRANSFORM",
            Self::BeforeValidate => "BEFORE_VALIDATE",
            Self::AfterValidate => "AFTER_VALIDATE",
            Self::BeforeEnrich => "BEFORE_ENRICH",
            Self::AfterEnrich => "AFTER_ENRICH",
            Self::BeforeRoute => "BEFORE_ROUTE",
            Self::AfterRoute => "AFTER_ROUTE",
            Self::BeforeLoad => "BEFORE_LOAD",
            Self::AfterLoad => "AFTER_LOAD",
            Self::OnError => "ON_ERROR",
            Self::OnRetry => "ON_RETRY",
            Self::OnDeadLetter => "ON_DEAD_LETTER",
        };
        f.write_str(s)
    }
}

impl HookStage {
    /// Every stage, in catalog order.
    pub const ALL: [HookStage; 18] = [
        Self::PipelineStarted,
        Self::PipelineCompleted,
        Self::PipelineFailed,
        Self::BeforeExtract,
        Self::AfterExtract,
        Self::BeforeTransform,
        Self::AfterTransform,
        Self::BeforeValidate,
        Self::AfterValidate,
        Self::BeforeEnrich,
        Self::AfterEnrich,
        Self::BeforeRoute,
        Self::AfterRoute,
        Self::BeforeLoad,
        Self::AfterLoad,
        Self::OnError,
        Self::OnRetry,
        Self::OnDeadLetter,
    ];

    /// The BEFORE stage fired for a step of `step_type`, if any.
    /// LOAD, EXPORT, FEED and SINK steps share the LOAD stage pair;
    /// TRIGGER steps fire no data hooks.
    #[must_use]
    pub fn before(step_type: StepType) -> Option<Self> {
        match step_type {
            StepType::Extract => Some(Self::BeforeExtract),
            StepType::Transform => Some(Self::BeforeTransform),
            StepType::Validate => Some(Self::BeforeValidate),
            StepType::Enrich => Some(Self::BeforeEnrich),
            StepType::Route => Some(Self::BeforeRoute),
            StepType::Load | StepType::Export | StepType::Feed | StepType::Sink => {
                Some(Self::BeforeLoad)
            }
            StepType::Trigger => None,
        }
    }

    /// The AFTER stage fired for a step of `step_type`, if any.
    #[must_use]
    pub fn after(step_type: StepType) -> Option<Self> {
        match step_type {
            StepType::Extract => Some(Self::AfterExtract),
            StepType::Transform => Some(Self::AfterTransform),
            StepType::Validate => Some(Self::AfterValidate),
            StepType::Enrich => Some(Self::AfterEnrich),
            StepType::Route => Some(Self::AfterRoute),
            StepType::Load | StepType::Export | StepType::Feed | StepType::Sink => {
                Some(Self::AfterLoad)
            }
            StepType::Trigger => None,
        }
    }

    /// Documented example payload for this stage, used by hook tests.
    #[must_use]
    pub fn example_payload(self) -> Value {
        match self {
            Self::PipelineStarted => json!({
                "pipeline": "order-sync",
                "runId": "7f1c6a2e-0000-4000-8000-000000000000",
                "startedAt": "2025-06-01T08:00:00Z"
            }),
            Self::PipelineCompleted => json!({
                "pipeline": "order-sync",
                "runId": "7f1c6a2e-0000-4000-8000-000000000000",
                "status": "SUCCESS",
                "recordsIn": 120,
                "recordsOut": 118,
                "durationMs": 4200
            }),
            Self::PipelineFailed => json!({
                "pipeline": "order-sync",
                "runId": "7f1c6a2e-0000-4000-8000-000000000000",
                "error": {"stage": "LOADING", "code": "WRITE_FAILED", "message": "target rejected batch"}
            }),
            Self::BeforeExtract | Self::BeforeTransform | Self::BeforeValidate
            | Self::BeforeEnrich | Self::BeforeRoute | Self::BeforeLoad => json!({
                "pipeline": "order-sync",
                "stepKey": "extract-orders",
                "inputCount": 50
            }),
            Self::AfterExtract | Self::AfterTransform | Self::AfterValidate
            | Self::AfterEnrich | Self::AfterRoute | Self::AfterLoad => json!({
                "pipeline": "order-sync",
                "stepKey": "extract-orders",
                "status": "SUCCESS",
                "inputCount": 50,
                "outputCount": 50,
                "errorCount": 0
            }),
            Self::OnError => json!({
                "pipeline": "order-sync",
                "stepKey": "validate-orders",
                "error": {"code": "REQUIRED", "message": "missing field 'quantity'", "recordIndex": 3}
            }),
            Self::OnRetry => json!({
                "pipeline": "order-sync",
                "stepKey": "load-orders",
                "attempt": 2,
                "maxRetries": 3,
                "delayMs": 1000
            }),
            Self::OnDeadLetter => json!({
                "pipeline": "order-sync",
                "stepKey": "load-orders",
                "deadLetterId": "2a9a3c4d-0000-4000-8000-000000000000",
                "error": {"code": "WRITE_FAILED", "message": "constraint violation", "retriable": false}
            }),
        }
    }
}
