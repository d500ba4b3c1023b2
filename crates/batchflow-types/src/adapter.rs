//! Adapter metadata: identity, capability flags, and config schema.
//!
//! An [`AdapterDefinition`] declares what an adapter is and what
//! configuration it accepts. Definitions are registered once at startup
//! and immutable during a run; the engine validates step configs against
//! the declared schema before anything executes.

use serde::{Deserialize, Serialize};

use crate::definition::StepType;

/// Adapter family, aligned with the step types an adapter may serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdapterType {
    Trigger,
    Extractor,
    Transformer,
    Validator,
    Enricher,
    Router,
    Loader,
    Exporter,
    Feed,
    Sink,
}

impl AdapterType {
    /// Whether an adapter of this type may be bound to a step of `step_type`.
    #[must_use]
    pub fn serves(self, step_type: StepType) -> bool {
        matches!(
            (self, step_type),
            (Self::Trigger, StepType::Trigger)
                | (Self::Extractor, StepType::Extract)
                | (Self::Transformer, StepType::Transform)
                | (Self::Validator, StepType::Validate)
                | (Self::Enricher, StepType::Enrich)
                | (Self::Router, StepType::Route)
                | (Self::Loader, StepType::Load)
                | (Self::Exporter, StepType::Export)
                | (Self::Feed, StepType::Feed)
                | (Self::Sink, StepType::Sink)
        )
    }
}

/// Primitive type of a config field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Object,
    Array,
}

/// Schema for one adapter config field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigFieldSchema {
    pub key: String,
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    /// Allowed values for string fields (empty = unconstrained).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enum_values: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    /// Regex the (string) value must match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    /// This field is only meaningful when the named sibling is present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<String>,
}

impl ConfigFieldSchema {
    fn new(key: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            key: key.into(),
            field_type,
            required: false,
            enum_values: Vec::new(),
            min_length: None,
            max_length: None,
            pattern: None,
            depends_on: None,
        }
    }

    #[must_use]
    pub fn string(key: impl Into<String>) -> Self {
        Self::new(key, FieldType::String)
    }

    #[must_use]
    pub fn number(key: impl Into<String>) -> Self {
        Self::new(key, FieldType::Number)
    }

    #[must_use]
    pub fn boolean(key: impl Into<String>) -> Self {
        Self::new(key, FieldType::Boolean)
    }

    #[must_use]
    pub fn object(key: impl Into<String>) -> Self {
        Self::new(key, FieldType::Object)
    }

    #[must_use]
    pub fn array(key: impl Into<String>) -> Self {
        Self::new(key, FieldType::Array)
    }

    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    #[must_use]
    pub fn one_of(mut self, values: &[&str]) -> Self {
        self.enum_values = values.iter().map(|v| (*v).to_string()).collect();
        self
    }

    #[must_use]
    pub fn length(mut self, min: Option<usize>, max: Option<usize>) -> Self {
        self.min_length = min;
        self.max_length = max;
        self
    }

    #[must_use]
    pub fn matching(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    #[must_use]
    pub fn depends_on(mut self, sibling: impl Into<String>) -> Self {
        self.depends_on = Some(sibling.into());
        self
    }
}

/// Declared identity and capabilities of a pluggable adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterDefinition {
    pub adapter_type: AdapterType,
    /// Stable identifier steps bind to (e.g. `"field-map"`).
    pub code: String,
    /// Human-readable display name.
    pub name: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub config_schema: Vec<ConfigFieldSchema>,
    /// Pure adapters have no external side effects and may run in dry runs.
    #[serde(default)]
    pub pure: bool,
    #[serde(default, rename = "async")]
    pub is_async: bool,
    /// Batchable adapters accept many records per invocation.
    #[serde(default)]
    pub batchable: bool,
    /// Permission domain the adapter writes into (loaders/exporters).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_domain: Option<String>,
}

impl AdapterDefinition {
    pub fn new(adapter_type: AdapterType, code: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            adapter_type,
            code: code.into(),
            name: name.into(),
            category: String::new(),
            config_schema: Vec::new(),
            pure: false,
            is_async: false,
            batchable: true,
            permission_domain: None,
        }
    }

    #[must_use]
    pub fn with_schema(mut self, schema: Vec<ConfigFieldSchema>) -> Self {
        self.config_schema = schema;
        self
    }

    #[must_use]
    pub fn pure(mut self) -> Self {
        self.pure = true;
        self
    }

    #[must_use]
    pub fn in_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    #[must_use]
    pub fn writes_to(mut self, domain: impl Into<String>) -> Self {
        self.permission_domain = Some(domain.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adapter_type_serves_matching_step_type() {
        assert!(AdapterType::Extractor.serves(StepType::Extract));
        assert!(AdapterType::Sink.serves(StepType::Sink));
        assert!(!AdapterType::Extractor.serves(StepType::Load));
        assert!(!AdapterType::Loader.serves(StepType::Transform));
    }

    #[test]
    fn field_schema_builders() {
        let field = ConfigFieldSchema::string("mode")
            .required()
            .one_of(&["insert", "upsert"])
            .length(Some(1), Some(16));
        assert!(field.required);
        assert_eq!(field.enum_values, vec!["insert", "upsert"]);
        assert_eq!(field.min_length, Some(1));
        assert_eq!(field.max_length, Some(16));
    }

    #[test]
    fn adapter_definition_roundtrip() {
        let def = AdapterDefinition::new(AdapterType::Loader, "log-load", "Logging loader")
            .with_schema(vec![ConfigFieldSchema::string("level").one_of(&["info", "debug"])])
            .in_category("diagnostics")
            .writes_to("system");
        let json = serde_json::to_string(&def).unwrap();
        let back: AdapterDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(def, back);
        assert!(!back.pure);
        assert_eq!(back.permission_domain.as_deref(), Some("system"));
    }
}
