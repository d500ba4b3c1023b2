use std::path::Path;

use anyhow::Result;

use batchflow_engine::adapters::builtin_registry;
use batchflow_engine::compiler::{validate, ValidationLevel};
use batchflow_engine::loader;

/// Validate a pipeline file and print every issue and warning found.
pub fn execute(path: &Path, strict: bool) -> Result<()> {
    let definition = loader::parse_definition(path)?;
    let registry = builtin_registry();
    let level = if strict {
        ValidationLevel::Strict
    } else {
        ValidationLevel::Warn
    };

    let validation = validate(&definition, &registry, level);

    for warning in &validation.warnings {
        println!("warning: {warning}");
    }
    if validation.is_valid {
        println!(
            "OK: pipeline '{}' is valid ({} steps, {} warnings)",
            definition.name,
            definition.nodes.len(),
            validation.warnings.len()
        );
        Ok(())
    } else {
        for issue in &validation.issues {
            println!("error: {issue}");
        }
        anyhow::bail!("pipeline '{}' is invalid", definition.name);
    }
}
