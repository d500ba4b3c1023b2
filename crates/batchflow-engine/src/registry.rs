//! Adapter registry: metadata plus factories, frozen at startup.
//!
//! The registry is an explicitly constructed, immutable instance passed
//! into the compiler and executor — never process-wide mutable state.
//! Config validation against each adapter's declared field schema happens
//! here, at compile time, before anything executes.

use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;
use serde_json::Value;

use batchflow_types::adapter::{AdapterDefinition, ConfigFieldSchema, FieldType};
use batchflow_types::error::{PipelineError, ValidationCode, ValidationError};

use crate::adapter::Adapter;

/// Builds an adapter instance from a validated step config.
pub type AdapterFactory =
    Arc<dyn Fn(&Value) -> Result<Arc<dyn Adapter>, PipelineError> + Send + Sync>;

struct Entry {
    definition: AdapterDefinition,
    factory: AdapterFactory,
}

/// Immutable catalog of registered adapters.
pub struct AdapterRegistry {
    entries: HashMap<String, Entry>,
}

/// Accumulates registrations before freezing into an [`AdapterRegistry`].
#[derive(Default)]
pub struct RegistryBuilder {
    entries: HashMap<String, Entry>,
}

impl RegistryBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter definition with its factory.
    ///
    /// # Errors
    ///
    /// Fails on duplicate adapter codes — the catalog is keyed by code.
    pub fn register(
        mut self,
        definition: AdapterDefinition,
        factory: AdapterFactory,
    ) -> Result<Self, PipelineError> {
        let code = definition.code.clone();
        if self.entries.contains_key(&code) {
            return Err(PipelineError::configuration(
                "DUPLICATE_ADAPTER",
                format!("adapter code '{code}' registered twice"),
            ));
        }
        self.entries.insert(
            code,
            Entry {
                definition,
                factory,
            },
        );
        Ok(self)
    }

    #[must_use]
    pub fn build(self) -> AdapterRegistry {
        AdapterRegistry {
            entries: self.entries,
        }
    }
}

impl AdapterRegistry {
    #[must_use]
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Look up an adapter definition by code.
    #[must_use]
    pub fn definition(&self, code: &str) -> Option<&AdapterDefinition> {
        self.entries.get(code).map(|e| &e.definition)
    }

    /// Registered adapter codes, unordered.
    #[must_use]
    pub fn codes(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    /// All registered definitions, sorted by code.
    #[must_use]
    pub fn definitions(&self) -> Vec<&AdapterDefinition> {
        let mut defs: Vec<_> = self.entries.values().map(|e| &e.definition).collect();
        defs.sort_by(|a, b| a.code.cmp(&b.code));
        defs
    }

    /// Instantiate an adapter for a step.
    ///
    /// # Errors
    ///
    /// Unknown codes and factory failures surface as CONFIGURATION errors.
    pub fn instantiate(&self, code: &str, config: &Value) -> Result<Arc<dyn Adapter>, PipelineError> {
        let entry = self.entries.get(code).ok_or_else(|| {
            PipelineError::configuration("UNKNOWN_ADAPTER", format!("no adapter '{code}' registered"))
        })?;
        (entry.factory)(config)
    }

    /// Validate a step config against the adapter's declared field schema.
    /// Returns every violation found, not just the first.
    #[must_use]
    pub fn validate_config(&self, code: &str, config: &Value, path: &str) -> Vec<ValidationError> {
        let Some(entry) = self.entries.get(code) else {
            return vec![ValidationError::new(
                ValidationCode::UnknownAdapter,
                path,
                format!("no adapter '{code}' registered"),
            )];
        };
        validate_against_schema(&entry.definition.config_schema, config, path)
    }
}

fn validate_against_schema(
    schema: &[ConfigFieldSchema],
    config: &Value,
    path: &str,
) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    if schema.is_empty() {
        return errors;
    }

    let empty = serde_json::Map::new();
    let map = match config {
        Value::Object(map) => map,
        Value::Null => &empty,
        other => {
            errors.push(ValidationError::new(
                ValidationCode::InvalidType,
                path,
                format!("config must be an object, got {}", json_type_name(other)),
            ));
            return errors;
        }
    };

    for field in schema {
        let field_path = format!("{path}.{}", field.key);
        let Some(value) = map.get(&field.key) else {
            if field.required {
                errors.push(ValidationError::new(
                    ValidationCode::Required,
                    field_path.as_str(),
                    "field is required",
                ));
            }
            continue;
        };

        if let Some(sibling) = &field.depends_on {
            if !map.contains_key(sibling) {
                errors.push(ValidationError::new(
                    ValidationCode::MissingDependency,
                    field_path.as_str(),
                    format!("requires sibling field '{sibling}'"),
                ));
            }
        }

        if !type_matches(field.field_type, value) {
            errors.push(ValidationError::new(
                ValidationCode::InvalidType,
                field_path.as_str(),
                format!(
                    "expected {:?}, got {}",
                    field.field_type,
                    json_type_name(value)
                ),
            ));
            continue;
        }

        if let Some(text) = value.as_str() {
            if let Some(min) = field.min_length {
                if text.len() < min {
                    errors.push(ValidationError::new(
                        ValidationCode::TooShort,
                        field_path.as_str(),
                        format!("length {} below minimum {min}", text.len()),
                    ));
                }
            }
            if let Some(max) = field.max_length {
                if text.len() > max {
                    errors.push(ValidationError::new(
                        ValidationCode::TooLong,
                        field_path.as_str(),
                        format!("length {} above maximum {max}", text.len()),
                    ));
                }
            }
            if !field.enum_values.is_empty() && !field.enum_values.iter().any(|v| v == text) {
                errors.push(ValidationError::new(
                    ValidationCode::NotInEnum,
                    field_path.as_str(),
                    format!("'{text}' not in {:?}", field.enum_values),
                ));
            }
            if let Some(pattern) = &field.pattern {
                match Regex::new(pattern) {
                    Ok(re) if !re.is_match(text) => {
                        errors.push(ValidationError::new(
                            ValidationCode::InvalidFormat,
                            field_path.as_str(),
                            format!("'{text}' does not match /{pattern}/"),
                        ));
                    }
                    Ok(_) => {}
                    Err(_) => {
                        errors.push(ValidationError::new(
                            ValidationCode::InvalidFormat,
                            field_path.as_str(),
                            format!("invalid schema pattern /{pattern}/"),
                        ));
                    }
                }
            }
        }
    }

    errors
}

fn type_matches(expected: FieldType, value: &Value) -> bool {
    match expected {
        FieldType::String => value.is_string(),
        FieldType::Number => value.is_number(),
        FieldType::Boolean => value.is_boolean(),
        FieldType::Object => value.is_object(),
        FieldType::Array => value.is_array(),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{AdapterContext, AdapterOutput};
    use async_trait::async_trait;
    use batchflow_types::adapter::AdapterType;
    use batchflow_types::record::Record;
    use serde_json::json;

    struct Noop;

    #[async_trait]
    impl Adapter for Noop {
        async fn invoke(
            &self,
            _ctx: &AdapterContext,
            records: Vec<Record>,
        ) -> Result<AdapterOutput, PipelineError> {
            Ok(AdapterOutput::passthrough(records))
        }
    }

    fn noop_factory() -> AdapterFactory {
        Arc::new(|_config| Ok(Arc::new(Noop) as Arc<dyn Adapter>))
    }

    fn registry_with_schema(schema: Vec<ConfigFieldSchema>) -> AdapterRegistry {
        AdapterRegistry::builder()
            .register(
                AdapterDefinition::new(AdapterType::Transformer, "demo", "Demo").with_schema(schema),
                noop_factory(),
            )
            .unwrap()
            .build()
    }

    #[test]
    fn duplicate_registration_fails() {
        let result = AdapterRegistry::builder()
            .register(
                AdapterDefinition::new(AdapterType::Sink, "dup", "One"),
                noop_factory(),
            )
            .unwrap()
            .register(
                AdapterDefinition::new(AdapterType::Sink, "dup", "Two"),
                noop_factory(),
            );
        assert!(result.is_err());
    }

    #[test]
    fn unknown_code_reports_unknown_adapter() {
        let registry = registry_with_schema(vec![]);
        let errors = registry.validate_config("missing", &json!({}), "nodes[x].config");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code, ValidationCode::UnknownAdapter);
        assert!(registry.instantiate("missing", &Value::Null).is_err());
    }

    #[test]
    fn required_and_type_checks() {
        let registry = registry_with_schema(vec![
            ConfigFieldSchema::string("mode").required(),
            ConfigFieldSchema::number("limit"),
        ]);
        let errors = registry.validate_config("demo", &json!({"limit": "ten"}), "cfg");
        let codes: Vec<_> = errors.iter().map(|e| e.code).collect();
        assert!(codes.contains(&ValidationCode::Required));
        assert!(codes.contains(&ValidationCode::InvalidType));
    }

    #[test]
    fn string_constraints() {
        let registry = registry_with_schema(vec![ConfigFieldSchema::string("mode")
            .one_of(&["insert", "upsert"])
            .length(Some(2), Some(6))]);

        assert!(registry
            .validate_config("demo", &json!({"mode": "insert"}), "cfg")
            .is_empty());

        let errors = registry.validate_config("demo", &json!({"mode": "replace"}), "cfg");
        assert!(errors
            .iter()
            .any(|e| e.code == ValidationCode::TooLong || e.code == ValidationCode::NotInEnum));
    }

    #[test]
    fn pattern_and_dependency_checks() {
        let registry = registry_with_schema(vec![
            ConfigFieldSchema::string("cursor_field").matching("^[a-z_]+$"),
            ConfigFieldSchema::string("signature").depends_on("secret"),
        ]);

        let errors =
            registry.validate_config("demo", &json!({"cursor_field": "Updated-At"}), "cfg");
        assert_eq!(errors[0].code, ValidationCode::InvalidFormat);

        let errors = registry.validate_config("demo", &json!({"signature": "x"}), "cfg");
        assert_eq!(errors[0].code, ValidationCode::MissingDependency);
    }

    #[test]
    fn null_config_is_an_empty_object() {
        let registry = registry_with_schema(vec![ConfigFieldSchema::string("mode").required()]);
        let errors = registry.validate_config("demo", &Value::Null, "cfg");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code, ValidationCode::Required);
    }

    #[test]
    fn definitions_sorted_by_code() {
        let registry = AdapterRegistry::builder()
            .register(
                AdapterDefinition::new(AdapterType::Sink, "zeta", "Z"),
                noop_factory(),
            )
            .unwrap()
            .register(
                AdapterDefinition::new(AdapterType::Sink, "alpha", "A"),
                noop_factory(),
            )
            .unwrap()
            .build();
        let codes: Vec<_> = registry.definitions().iter().map(|d| d.code.as_str()).collect();
        assert_eq!(codes, vec!["alpha", "zeta"]);
    }
}
