//! Error model: config-time validation errors, run-time pipeline errors,
//! and per-record errors.
//!
//! [`PipelineError`] carries a stage and severity and drives the engine's
//! retry decisions. Construct via stage-specific factory methods.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

// ── Config-time validation ──────────────────────────────────────────

/// Machine-readable validation failure code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationCode {
    Required,
    InvalidType,
    InvalidFormat,
    TooShort,
    TooLong,
    NotInEnum,
    UnknownField,
    MissingDependency,
    DuplicateKey,
    DanglingReference,
    UnknownAdapter,
    IncompatibleAdapter,
    Cycle,
    UnknownBranch,
    InvalidExpression,
    InvalidSchedule,
}

impl fmt::Display for ValidationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Required => "REQUIRED",
            Self::InvalidType => "INVALID_TYPE",
            Self::InvalidFormat => "INVALID_FORMAT",
            Self::TooShort => "TOO_SHORT",
            Self::TooLong => "TOO_LONG",
            Self::NotInEnum => "NOT_IN_ENUM",
            Self::UnknownField => "UNKNOWN_FIELD",
            Self::MissingDependency => "MISSING_DEPENDENCY",
            Self::DuplicateKey => "DUPLICATE_KEY",
            Self::DanglingReference => "DANGLING_REFERENCE",
            Self::UnknownAdapter => "UNKNOWN_ADAPTER",
            Self::IncompatibleAdapter => "INCOMPATIBLE_ADAPTER",
            Self::Cycle => "CYCLE",
            Self::UnknownBranch => "UNKNOWN_BRANCH",
            Self::InvalidExpression => "INVALID_EXPRESSION",
            Self::InvalidSchedule => "INVALID_SCHEDULE",
        };
        f.write_str(s)
    }
}

/// A single config-time validation failure, surfaced at compile time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{code} at {path}: {message}")]
pub struct ValidationError {
    pub code: ValidationCode,
    /// Where in the definition the problem sits (e.g. `nodes[validate].config.fields`).
    pub path: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(code: ValidationCode, path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            path: path.into(),
            message: message.into(),
        }
    }
}

// ── Run-time pipeline errors ────────────────────────────────────────

/// Pipeline stage an error is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorStage {
    Extraction,
    Transformation,
    Validation,
    Loading,
    Connection,
    Authentication,
    Timeout,
    RateLimit,
    Configuration,
    System,
    Unknown,
}

impl fmt::Display for ErrorStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Extraction => "EXTRACTION",
            Self::Transformation => "TRANSFORMATION",
            Self::Validation => "VALIDATION",
            Self::Loading => "LOADING",
            Self::Connection => "CONNECTION",
            Self::Authentication => "AUTHENTICATION",
            Self::Timeout => "TIMEOUT",
            Self::RateLimit => "RATE_LIMIT",
            Self::Configuration => "CONFIGURATION",
            Self::System => "SYSTEM",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// Severity of a pipeline error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorSeverity {
    Fatal,
    Error,
    Warning,
    Info,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Fatal => "FATAL",
            Self::Error => "ERROR",
            Self::Warning => "WARNING",
            Self::Info => "INFO",
        };
        f.write_str(s)
    }
}

/// Run-time pipeline error with stage, severity, and retry classification.
///
/// CONNECTION / TIMEOUT / RATE_LIMIT errors default to retryable;
/// AUTHENTICATION / CONFIGURATION errors are never retried automatically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("[{stage}/{severity}] {code}: {message}")]
pub struct PipelineError {
    pub stage: ErrorStage,
    pub severity: ErrorSeverity,
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_key: Option<String>,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl PipelineError {
    fn new(
        stage: ErrorStage,
        retryable: bool,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            stage,
            severity: ErrorSeverity::Error,
            code: code.into(),
            message: message.into(),
            step_key: None,
            retryable,
            details: None,
        }
    }

    /// Extraction failure (not retryable).
    #[must_use]
    pub fn extraction(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorStage::Extraction, false, code, message)
    }

    /// Transformation failure (not retryable).
    #[must_use]
    pub fn transformation(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorStage::Transformation, false, code, message)
    }

    /// Validation failure (not retryable).
    #[must_use]
    pub fn validation(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorStage::Validation, false, code, message)
    }

    /// Load failure (not retryable).
    #[must_use]
    pub fn loading(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorStage::Loading, false, code, message)
    }

    /// Connection failure (retryable).
    #[must_use]
    pub fn connection(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorStage::Connection, true, code, message)
    }

    /// Authentication failure (never retried automatically).
    #[must_use]
    pub fn authentication(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorStage::Authentication, false, code, message)
    }

    /// Adapter call exceeded its deadline (retryable).
    #[must_use]
    pub fn timeout(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorStage::Timeout, true, code, message)
    }

    /// Rate limit exceeded (retryable).
    #[must_use]
    pub fn rate_limit(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorStage::RateLimit, true, code, message)
    }

    /// Invalid configuration (never retried automatically).
    #[must_use]
    pub fn configuration(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorStage::Configuration, false, code, message)
    }

    /// Host-side failure: task panics, poisoned locks, channel errors.
    #[must_use]
    pub fn system(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorStage::System, false, code, message)
    }

    /// Attribute the error to a step.
    #[must_use]
    pub fn with_step(mut self, step_key: impl Into<String>) -> Self {
        self.step_key = Some(step_key.into());
        self
    }

    /// Attach structured diagnostic details.
    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Escalate to FATAL severity.
    #[must_use]
    pub fn fatal(mut self) -> Self {
        self.severity = ErrorSeverity::Fatal;
        self
    }
}

// ── Per-record errors ───────────────────────────────────────────────

/// A failure scoped to a single record inside an adapter call.
///
/// Record errors are collected into step results and never crash the
/// process; whether they halt a step depends on `continue_on_error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_index: Option<usize>,
    pub retriable: bool,
}

impl RecordError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            field: None,
            record_index: None,
            retriable: false,
        }
    }

    #[must_use]
    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    #[must_use]
    pub fn at_index(mut self, index: usize) -> Self {
        self.record_index = Some(index);
        self
    }

    #[must_use]
    pub fn retriable(mut self) -> Self {
        self.retriable = true;
        self
    }
}
