use anyhow::Result;

use batchflow_engine::adapters::builtin_registry;

/// List the registered adapter catalog.
pub fn execute() -> Result<()> {
    let registry = builtin_registry();
    println!("{:<18} {:<14} {:<12} pure", "CODE", "TYPE", "CATEGORY");
    for definition in registry.definitions() {
        println!(
            "{:<18} {:<14} {:<12} {}",
            definition.code,
            format!("{:?}", definition.adapter_type),
            definition.category,
            definition.pure
        );
    }
    Ok(())
}
