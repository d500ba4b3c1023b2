//! Built-in generic adapters.
//!
//! These are the vendor-neutral adapters every installation carries:
//! in-memory extraction, field mapping, formula and filter transforms,
//! schema validation, static enrichment, routing, and diagnostic sinks.
//! Concrete target-system loaders live outside the engine and register
//! through the same [`AdapterRegistry`] seam.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use batchflow_types::adapter::{AdapterDefinition, AdapterType, ConfigFieldSchema};
use batchflow_types::error::{PipelineError, RecordError};
use batchflow_types::record::{field_path, Record};

use crate::adapter::{Adapter, AdapterContext, AdapterOutput};
use crate::expr::{self, Expr};
use crate::registry::{AdapterFactory, AdapterRegistry, RegistryBuilder};

/// Shared buffer a [`CollectSink`] writes into.
pub type SharedBuffer = Arc<Mutex<Vec<Record>>>;

fn config_error(adapter: &str, error: impl std::fmt::Display) -> PipelineError {
    PipelineError::configuration("ADAPTER_CONFIG", format!("{adapter}: {error}"))
}

// ── memory-extract ──────────────────────────────────────────────────

#[derive(Deserialize)]
struct MemoryExtractConfig {
    #[serde(default)]
    records: Vec<Record>,
}

/// Emits records straight from its config. Input records are ignored —
/// extraction starts a flow.
struct MemoryExtract {
    records: Vec<Record>,
}

#[async_trait]
impl Adapter for MemoryExtract {
    async fn invoke(
        &self,
        _ctx: &AdapterContext,
        _records: Vec<Record>,
    ) -> Result<AdapterOutput, PipelineError> {
        Ok(AdapterOutput::passthrough(self.records.clone()))
    }
}

// ── field-map ───────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FieldMapConfig {
    mapping: serde_json::Map<String, Value>,
    #[serde(default = "default_true")]
    remove_source: bool,
}

fn default_true() -> bool {
    true
}

/// Renames/copies top-level fields according to `mapping`. Fields absent
/// from a record are left alone.
struct FieldMap {
    mapping: Vec<(String, String)>,
    remove_source: bool,
}

#[async_trait]
impl Adapter for FieldMap {
    async fn invoke(
        &self,
        _ctx: &AdapterContext,
        records: Vec<Record>,
    ) -> Result<AdapterOutput, PipelineError> {
        let mapped = records
            .into_iter()
            .map(|mut record| {
                if let Some(map) = record.as_object_mut() {
                    for (from, to) in &self.mapping {
                        let value = if self.remove_source {
                            map.remove(from)
                        } else {
                            map.get(from).cloned()
                        };
                        if let Some(value) = value {
                            map.insert(to.clone(), value);
                        }
                    }
                }
                record
            })
            .collect();
        Ok(AdapterOutput::passthrough(mapped))
    }
}

// ── formula ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct FormulaConfig {
    assignments: serde_json::Map<String, Value>,
}

/// Assigns expression results to top-level fields, e.g.
/// `{"total": "price * qty"}`. Evaluation failures are record errors.
struct Formula {
    assignments: Vec<(String, Expr)>,
}

#[async_trait]
impl Adapter for Formula {
    async fn invoke(
        &self,
        ctx: &AdapterContext,
        records: Vec<Record>,
    ) -> Result<AdapterOutput, PipelineError> {
        let mut output = AdapterOutput::default();
        for (index, mut record) in records.into_iter().enumerate() {
            let mut failed = false;
            for (field, formula) in &self.assignments {
                match expr::evaluate(formula, &record, Some(&ctx.variables)) {
                    Ok(value) => {
                        if let Some(map) = record.as_object_mut() {
                            map.insert(field.clone(), value);
                        }
                    }
                    Err(error) => {
                        output.record_errors.push(
                            RecordError::new("FORMULA_EVAL", error.to_string())
                                .with_field(field.clone())
                                .at_index(index),
                        );
                        failed = true;
                        break;
                    }
                }
            }
            if !failed {
                output.records.push(record);
            }
        }
        Ok(output)
    }
}

// ── filter ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct FilterConfig {
    expression: String,
}

/// Keeps records whose expression is truthy; the rest count as dropped.
struct Filter {
    expression: Expr,
}

#[async_trait]
impl Adapter for Filter {
    async fn invoke(
        &self,
        ctx: &AdapterContext,
        records: Vec<Record>,
    ) -> Result<AdapterOutput, PipelineError> {
        let mut output = AdapterOutput::default();
        for (index, record) in records.into_iter().enumerate() {
            match expr::evaluate(&self.expression, &record, Some(&ctx.variables)) {
                Ok(value) if expr::truthy(&value) => output.records.push(record),
                Ok(_) => output.dropped += 1,
                Err(error) => output
                    .record_errors
                    .push(RecordError::new("FILTER_EVAL", error.to_string()).at_index(index)),
            }
        }
        Ok(output)
    }
}

// ── schema-validate ─────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SchemaValidateConfig {
    #[serde(default)]
    required: Vec<String>,
    #[serde(default)]
    types: serde_json::Map<String, Value>,
}

/// Per-record structural validation: required fields and primitive types.
/// Failing records become record errors and are excluded from the output.
struct SchemaValidate {
    required: Vec<String>,
    types: Vec<(String, String)>,
}

impl SchemaValidate {
    fn record_violation(&self, record: &Record, index: usize) -> Option<RecordError> {
        for field in &self.required {
            if field_path(record, field).is_none_or(Value::is_null) {
                return Some(
                    RecordError::new("REQUIRED", format!("missing field '{field}'"))
                        .with_field(field.clone())
                        .at_index(index),
                );
            }
        }
        for (field, expected) in &self.types {
            let Some(value) = field_path(record, field) else {
                continue;
            };
            let matches = match expected.to_ascii_uppercase().as_str() {
                "STRING" => value.is_string(),
                "NUMBER" => value.is_number(),
                "BOOLEAN" => value.is_boolean(),
                "OBJECT" => value.is_object(),
                "ARRAY" => value.is_array(),
                _ => true,
            };
            if !matches {
                return Some(
                    RecordError::new("INVALID_TYPE", format!("field '{field}' is not {expected}"))
                        .with_field(field.clone())
                        .at_index(index),
                );
            }
        }
        None
    }
}

#[async_trait]
impl Adapter for SchemaValidate {
    async fn invoke(
        &self,
        _ctx: &AdapterContext,
        records: Vec<Record>,
    ) -> Result<AdapterOutput, PipelineError> {
        let mut output = AdapterOutput::default();
        for (index, record) in records.into_iter().enumerate() {
            match self.record_violation(&record, index) {
                Some(error) => output.record_errors.push(error),
                None => output.records.push(record),
            }
        }
        Ok(output)
    }
}

// ── static-enrich ───────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StaticEnrichConfig {
    values: serde_json::Map<String, Value>,
    #[serde(default)]
    overwrite: bool,
}

/// Merges constant values into every record.
struct StaticEnrich {
    values: serde_json::Map<String, Value>,
    overwrite: bool,
}

#[async_trait]
impl Adapter for StaticEnrich {
    async fn invoke(
        &self,
        _ctx: &AdapterContext,
        records: Vec<Record>,
    ) -> Result<AdapterOutput, PipelineError> {
        let enriched = records
            .into_iter()
            .map(|mut record| {
                if let Some(map) = record.as_object_mut() {
                    for (key, value) in &self.values {
                        if self.overwrite || !map.contains_key(key) {
                            map.insert(key.clone(), value.clone());
                        }
                    }
                }
                record
            })
            .collect();
        Ok(AdapterOutput::passthrough(enriched))
    }
}

// ── branch-route ────────────────────────────────────────────────────

/// Pass-through adapter for ROUTE steps. Branch selection itself happens
/// in the orchestrator, which fans the step's output out per branch.
struct BranchRoute;

#[async_trait]
impl Adapter for BranchRoute {
    async fn invoke(
        &self,
        _ctx: &AdapterContext,
        records: Vec<Record>,
    ) -> Result<AdapterOutput, PipelineError> {
        Ok(AdapterOutput::passthrough(records))
    }
}

// ── collect-sink ────────────────────────────────────────────────────

/// Gathers records into a shared in-memory buffer.
pub struct CollectSink {
    buffer: SharedBuffer,
}

impl CollectSink {
    /// A buffer plus a factory producing sinks bound to it.
    #[must_use]
    pub fn shared() -> (SharedBuffer, AdapterFactory) {
        let buffer: SharedBuffer = Arc::new(Mutex::new(Vec::new()));
        let for_factory = buffer.clone();
        let factory: AdapterFactory = Arc::new(move |_config| {
            Ok(Arc::new(CollectSink {
                buffer: for_factory.clone(),
            }) as Arc<dyn Adapter>)
        });
        (buffer, factory)
    }
}

#[async_trait]
impl Adapter for CollectSink {
    async fn invoke(
        &self,
        _ctx: &AdapterContext,
        records: Vec<Record>,
    ) -> Result<AdapterOutput, PipelineError> {
        let mut buffer = match self.buffer.lock() {
            Ok(buffer) => buffer,
            Err(poisoned) => poisoned.into_inner(),
        };
        buffer.extend(records.iter().cloned());
        Ok(AdapterOutput::passthrough(records))
    }
}

// ── log-load ────────────────────────────────────────────────────────

/// Stand-in loader that only logs batch sizes. Not pure: dry runs skip it.
struct LogLoad;

#[async_trait]
impl Adapter for LogLoad {
    async fn invoke(
        &self,
        ctx: &AdapterContext,
        records: Vec<Record>,
    ) -> Result<AdapterOutput, PipelineError> {
        tracing::info!(
            pipeline = ctx.pipeline,
            step = ctx.step_key,
            count = records.len(),
            "log-load received batch"
        );
        Ok(AdapterOutput::passthrough(records))
    }
}

// ── registry assembly ───────────────────────────────────────────────

fn builtin_builder(sink_factory: AdapterFactory) -> RegistryBuilder {
    let register = |builder: RegistryBuilder,
                    definition: AdapterDefinition,
                    factory: AdapterFactory|
     -> RegistryBuilder {
        // Codes are compile-time constants; duplicates cannot happen here.
        builder.register(definition, factory).unwrap_or_else(|_| {
            unreachable!("builtin adapter codes are unique")
        })
    };

    let mut builder = RegistryBuilder::new();

    builder = register(
        builder,
        AdapterDefinition::new(AdapterType::Extractor, "memory-extract", "In-memory extractor")
            .with_schema(vec![ConfigFieldSchema::array("records").required()])
            .in_category("generic")
            .pure(),
        Arc::new(|config| {
            let parsed: MemoryExtractConfig = serde_json::from_value(config.clone())
                .map_err(|e| config_error("memory-extract", e))?;
            Ok(Arc::new(MemoryExtract {
                records: parsed.records,
            }) as Arc<dyn Adapter>)
        }),
    );

    builder = register(
        builder,
        AdapterDefinition::new(AdapterType::Transformer, "field-map", "Field mapper")
            .with_schema(vec![
                ConfigFieldSchema::object("mapping").required(),
                ConfigFieldSchema::boolean("removeSource"),
            ])
            .in_category("generic")
            .pure(),
        Arc::new(|config| {
            let parsed: FieldMapConfig = serde_json::from_value(config.clone())
                .map_err(|e| config_error("field-map", e))?;
            let mapping = parsed
                .mapping
                .into_iter()
                .map(|(from, to)| match to {
                    Value::String(to) => Ok((from, to)),
                    other => Err(config_error(
                        "field-map",
                        format!("mapping target for '{from}' must be a string, got {other}"),
                    )),
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Arc::new(FieldMap {
                mapping,
                remove_source: parsed.remove_source,
            }) as Arc<dyn Adapter>)
        }),
    );

    builder = register(
        builder,
        AdapterDefinition::new(AdapterType::Transformer, "formula", "Formula transform")
            .with_schema(vec![ConfigFieldSchema::object("assignments").required()])
            .in_category("generic")
            .pure(),
        Arc::new(|config| {
            let parsed: FormulaConfig = serde_json::from_value(config.clone())
                .map_err(|e| config_error("formula", e))?;
            let assignments = parsed
                .assignments
                .into_iter()
                .map(|(field, source)| {
                    let source = source.as_str().ok_or_else(|| {
                        config_error("formula", format!("assignment '{field}' must be a string"))
                    })?;
                    let parsed = expr::parse(source).map_err(|e| {
                        config_error("formula", format!("assignment '{field}': {e}"))
                    })?;
                    Ok((field, parsed))
                })
                .collect::<Result<Vec<_>, PipelineError>>()?;
            Ok(Arc::new(Formula { assignments }) as Arc<dyn Adapter>)
        }),
    );

    builder = register(
        builder,
        AdapterDefinition::new(AdapterType::Transformer, "filter", "Expression filter")
            .with_schema(vec![ConfigFieldSchema::string("expression").required()])
            .in_category("generic")
            .pure(),
        Arc::new(|config| {
            let parsed: FilterConfig = serde_json::from_value(config.clone())
                .map_err(|e| config_error("filter", e))?;
            let expression = expr::parse(&parsed.expression)
                .map_err(|e| config_error("filter", e))?;
            Ok(Arc::new(Filter { expression }) as Arc<dyn Adapter>)
        }),
    );

    builder = register(
        builder,
        AdapterDefinition::new(AdapterType::Validator, "schema-validate", "Schema validator")
            .with_schema(vec![
                ConfigFieldSchema::array("required"),
                ConfigFieldSchema::object("types"),
            ])
            .in_category("generic")
            .pure(),
        Arc::new(|config| {
            let parsed: SchemaValidateConfig = serde_json::from_value(config.clone())
                .map_err(|e| config_error("schema-validate", e))?;
            let types = parsed
                .types
                .into_iter()
                .filter_map(|(field, expected)| {
                    expected.as_str().map(|t| (field, t.to_string()))
                })
                .collect();
            Ok(Arc::new(SchemaValidate {
                required: parsed.required,
                types,
            }) as Arc<dyn Adapter>)
        }),
    );

    builder = register(
        builder,
        AdapterDefinition::new(AdapterType::Enricher, "static-enrich", "Static enrichment")
            .with_schema(vec![
                ConfigFieldSchema::object("values").required(),
                ConfigFieldSchema::boolean("overwrite"),
            ])
            .in_category("generic")
            .pure(),
        Arc::new(|config| {
            let parsed: StaticEnrichConfig = serde_json::from_value(config.clone())
                .map_err(|e| config_error("static-enrich", e))?;
            Ok(Arc::new(StaticEnrich {
                values: parsed.values,
                overwrite: parsed.overwrite,
            }) as Arc<dyn Adapter>)
        }),
    );

    builder = register(
        builder,
        AdapterDefinition::new(AdapterType::Router, "branch-route", "Branch router")
            .with_schema(vec![
                ConfigFieldSchema::array("branches"),
                ConfigFieldSchema::string("defaultBranch"),
            ])
            .in_category("generic")
            .pure(),
        Arc::new(|_config| Ok(Arc::new(BranchRoute) as Arc<dyn Adapter>)),
    );

    builder = register(
        builder,
        AdapterDefinition::new(AdapterType::Sink, "collect-sink", "Collecting sink")
            .in_category("diagnostics")
            .pure(),
        sink_factory,
    );

    builder = register(
        builder,
        AdapterDefinition::new(AdapterType::Loader, "log-load", "Logging loader")
            .with_schema(vec![
                ConfigFieldSchema::string("level").one_of(&["info", "debug"])
            ])
            .in_category("diagnostics")
            .writes_to("system"),
        Arc::new(|_config| Ok(Arc::new(LogLoad) as Arc<dyn Adapter>)),
    );

    builder
}

/// A builder pre-loaded with every built-in adapter and `collect-sink`
/// bound to the given buffer — extend with custom adapters, then build.
#[must_use]
pub fn builtin_builder_with_sink(buffer: SharedBuffer) -> RegistryBuilder {
    let factory: AdapterFactory = Arc::new(move |_config| {
        Ok(Arc::new(CollectSink {
            buffer: buffer.clone(),
        }) as Arc<dyn Adapter>)
    });
    builtin_builder(factory)
}

/// The default registry: every built-in adapter, with `collect-sink`
/// bound to a private buffer per instantiation.
#[must_use]
pub fn builtin_registry() -> AdapterRegistry {
    let factory: AdapterFactory = Arc::new(|_config| {
        Ok(Arc::new(CollectSink {
            buffer: Arc::new(Mutex::new(Vec::new())),
        }) as Arc<dyn Adapter>)
    });
    builtin_builder(factory).build()
}

/// The built-in registry with `collect-sink` bound to the given shared
/// buffer — the shape tests and dry runs want.
#[must_use]
pub fn builtin_registry_with_sink(buffer: SharedBuffer) -> AdapterRegistry {
    builtin_builder_with_sink(buffer).build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> AdapterContext {
        AdapterContext {
            pipeline: "test".into(),
            step_key: "step".into(),
            config: Value::Null,
            variables: serde_json::Map::new(),
        }
    }

    fn instantiate(code: &str, config: Value) -> Arc<dyn Adapter> {
        builtin_registry().instantiate(code, &config).unwrap()
    }

    #[tokio::test]
    async fn memory_extract_ignores_input() {
        let adapter = instantiate("memory-extract", json!({"records": [{"a": 1}, {"a": 2}]}));
        let out = adapter.invoke(&ctx(), vec![json!({"seed": true})]).await.unwrap();
        assert_eq!(out.records, vec![json!({"a": 1}), json!({"a": 2})]);
    }

    #[tokio::test]
    async fn field_map_renames_and_leaves_absent_fields() {
        let adapter = instantiate("field-map", json!({"mapping": {"qty": "quantity"}}));
        let out = adapter
            .invoke(&ctx(), vec![json!({"qty": 1}), json!({"name": "x"})])
            .await
            .unwrap();
        assert_eq!(out.records, vec![json!({"quantity": 1}), json!({"name": "x"})]);
    }

    #[tokio::test]
    async fn field_map_can_copy_instead_of_move() {
        let adapter = instantiate(
            "field-map",
            json!({"mapping": {"qty": "quantity"}, "removeSource": false}),
        );
        let out = adapter.invoke(&ctx(), vec![json!({"qty": 2})]).await.unwrap();
        assert_eq!(out.records, vec![json!({"qty": 2, "quantity": 2})]);
    }

    #[tokio::test]
    async fn formula_assigns_and_reports_eval_errors() {
        let adapter = instantiate("formula", json!({"assignments": {"total": "price * qty"}}));
        let out = adapter
            .invoke(
                &ctx(),
                vec![json!({"price": 10, "qty": 3}), json!({"price": "x", "qty": 1})],
            )
            .await
            .unwrap();
        assert_eq!(out.records, vec![json!({"price": 10, "qty": 3, "total": 30.0})]);
        assert_eq!(out.record_errors.len(), 1);
        assert_eq!(out.record_errors[0].code, "FORMULA_EVAL");
        assert_eq!(out.record_errors[0].record_index, Some(1));
    }

    #[test]
    fn formula_with_bad_expression_fails_at_factory_time() {
        let result = builtin_registry()
            .instantiate("formula", &json!({"assignments": {"x": "1 +"}}));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn filter_drops_falsy_records() {
        let adapter = instantiate("filter", json!({"expression": "qty > 1"}));
        let out = adapter
            .invoke(&ctx(), vec![json!({"qty": 1}), json!({"qty": 5})])
            .await
            .unwrap();
        assert_eq!(out.records, vec![json!({"qty": 5})]);
        assert_eq!(out.dropped, 1);
    }

    #[tokio::test]
    async fn schema_validate_checks_required_and_types() {
        let adapter = instantiate(
            "schema-validate",
            json!({"required": ["quantity"], "types": {"quantity": "NUMBER"}}),
        );
        let out = adapter
            .invoke(
                &ctx(),
                vec![
                    json!({"quantity": 1}),
                    json!({"name": "x"}),
                    json!({"quantity": "three"}),
                ],
            )
            .await
            .unwrap();
        assert_eq!(out.records, vec![json!({"quantity": 1})]);
        assert_eq!(out.record_errors.len(), 2);
        assert_eq!(out.record_errors[0].code, "REQUIRED");
        assert_eq!(out.record_errors[1].code, "INVALID_TYPE");
    }

    #[tokio::test]
    async fn static_enrich_respects_overwrite_flag() {
        let adapter = instantiate("static-enrich", json!({"values": {"region": "eu"}}));
        let out = adapter
            .invoke(&ctx(), vec![json!({"region": "us"}), json!({"a": 1})])
            .await
            .unwrap();
        assert_eq!(
            out.records,
            vec![json!({"region": "us"}), json!({"a": 1, "region": "eu"})]
        );

        let adapter = instantiate(
            "static-enrich",
            json!({"values": {"region": "eu"}, "overwrite": true}),
        );
        let out = adapter.invoke(&ctx(), vec![json!({"region": "us"})]).await.unwrap();
        assert_eq!(out.records, vec![json!({"region": "eu"})]);
    }

    #[tokio::test]
    async fn collect_sink_shared_buffer_gathers_records() {
        let buffer: SharedBuffer = Arc::new(Mutex::new(Vec::new()));
        let registry = builtin_registry_with_sink(buffer.clone());
        let adapter = registry.instantiate("collect-sink", &Value::Null).unwrap();
        adapter
            .invoke(&ctx(), vec![json!({"a": 1}), json!({"a": 2})])
            .await
            .unwrap();
        assert_eq!(buffer.lock().unwrap().len(), 2);
    }

    #[test]
    fn builtin_registry_has_the_expected_catalog() {
        let registry = builtin_registry();
        let codes: Vec<_> = registry
            .definitions()
            .iter()
            .map(|d| d.code.clone())
            .collect();
        assert_eq!(
            codes,
            vec![
                "branch-route",
                "collect-sink",
                "field-map",
                "filter",
                "formula",
                "log-load",
                "memory-extract",
                "schema-validate",
                "static-enrich",
            ]
        );
        assert!(!registry.definition("log-load").unwrap().pure);
        assert!(registry.definition("collect-sink").unwrap().pure);
    }
}
