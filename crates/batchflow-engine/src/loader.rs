//! Pipeline definition loading with environment variable substitution.
//!
//! Definition files are YAML (JSON is a subset and parses too); every
//! `${VAR_NAME}` is replaced from the environment before parsing, so
//! credentials and hosts stay out of committed files.

use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;

use batchflow_types::definition::PipelineDefinition;

static ENV_VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid env var regex"));

/// Substitute `${VAR_NAME}` patterns with environment variable values.
///
/// # Errors
///
/// Returns an error naming every referenced variable that is not set.
pub fn substitute_env_vars(input: &str) -> Result<String> {
    let mut result = input.to_string();
    let mut missing = Vec::new();

    for cap in ENV_VAR_RE.captures_iter(input) {
        let var_name = &cap[1];
        match std::env::var(var_name) {
            Ok(value) => {
                result = result.replace(&cap[0], &value);
            }
            Err(_) => missing.push(var_name.to_string()),
        }
    }

    if !missing.is_empty() {
        anyhow::bail!("Missing environment variable(s): {}", missing.join(", "));
    }

    Ok(result)
}

/// Parse a pipeline definition from a YAML string.
///
/// # Errors
///
/// Returns an error if env var substitution fails or the YAML is invalid.
pub fn parse_definition_str(yaml_str: &str) -> Result<PipelineDefinition> {
    let substituted = substitute_env_vars(yaml_str)?;
    let definition: PipelineDefinition =
        serde_yaml::from_str(&substituted).context("Failed to parse pipeline definition")?;
    Ok(definition)
}

/// Parse a pipeline definition file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or the YAML is invalid.
pub fn parse_definition(path: &Path) -> Result<PipelineDefinition> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read pipeline file: {}", path.display()))?;
    parse_definition_str(&content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchflow_types::definition::StepType;

    const SAMPLE: &str = r#"
name: order-sync
nodes:
  - key: extract
    type: EXTRACT
    adapterCode: memory-extract
    config:
      records:
        - sku: A-1
  - key: sink
    type: SINK
    adapterCode: collect-sink
edges:
  - from: extract
    to: sink
variables:
  region: eu
"#;

    #[test]
    fn parses_yaml_definition() {
        let definition = parse_definition_str(SAMPLE).unwrap();
        assert_eq!(definition.name, "order-sync");
        assert_eq!(definition.nodes.len(), 2);
        assert_eq!(definition.nodes[0].step_type, StepType::Extract);
        assert_eq!(definition.edges[0].from, "extract");
        assert_eq!(definition.variables["region"], "eu");
    }

    #[test]
    fn env_vars_substitute_into_config() {
        std::env::set_var("BF_TEST_SKU", "B-7");
        let yaml = SAMPLE.replace("A-1", "${BF_TEST_SKU}");
        let definition = parse_definition_str(&yaml).unwrap();
        assert_eq!(
            definition.nodes[0].config["records"][0]["sku"],
            serde_json::json!("B-7")
        );
        std::env::remove_var("BF_TEST_SKU");
    }

    #[test]
    fn missing_env_vars_all_reported() {
        let result = substitute_env_vars("${BF_MISSING_ONE} and ${BF_MISSING_TWO}");
        let message = result.unwrap_err().to_string();
        assert!(message.contains("BF_MISSING_ONE"));
        assert!(message.contains("BF_MISSING_TWO"));
    }

    #[test]
    fn invalid_yaml_errors() {
        assert!(parse_definition_str("nodes: [{key: broken").is_err());
    }

    #[test]
    fn missing_file_errors_with_path() {
        let error = parse_definition(Path::new("/nonexistent/pipeline.yaml")).unwrap_err();
        assert!(error.to_string().contains("Failed to read pipeline file"));
    }
}
