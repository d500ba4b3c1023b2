//! Pipeline compilation: definition validation and execution planning.
//!
//! Compilation is pure and side-effect free — it can serve dry "validate
//! only" requests without executing anything. The plan is a list of
//! stages produced by Kahn's algorithm; every step in a stage is safe to
//! run in parallel with its stage peers.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use batchflow_types::definition::{
    Comparator, PipelineDefinition, PipelineStepDefinition, RouteConfig, StepType,
};
use batchflow_types::error::{ValidationCode, ValidationError};
use batchflow_types::trigger::Trigger;

use crate::expr::{self, Expr};
use crate::registry::AdapterRegistry;

/// How strict stray-branch references are treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ValidationLevel {
    /// Stray branch references are warnings.
    #[default]
    Warn,
    /// Stray branch references fail compilation.
    Strict,
}

/// Outcome of a dry validate request.
#[derive(Debug, Clone, Default)]
pub struct Validation {
    pub is_valid: bool,
    pub issues: Vec<ValidationError>,
    pub warnings: Vec<ValidationError>,
}

/// An edge out of a compiled step, with its parsed condition.
#[derive(Debug, Clone)]
pub struct SuccessorEdge {
    pub to: String,
    pub branch: Option<String>,
    pub condition: Option<Expr>,
}

/// One step with everything the executor needs pre-resolved.
#[derive(Debug, Clone)]
pub struct CompiledStep {
    pub def: PipelineStepDefinition,
    /// Parsed ROUTE configuration, for ROUTE steps only.
    pub route: Option<RouteConfig>,
    /// Parsed step condition.
    pub condition: Option<Expr>,
    pub successors: Vec<SuccessorEdge>,
    pub predecessors: Vec<String>,
}

/// Ordered execution plan: stages of mutually independent steps.
#[derive(Debug)]
pub struct ExecutionPlan {
    pub pipeline: String,
    pub variables: serde_json::Map<String, Value>,
    /// Step keys per stage, in execution order.
    pub stages: Vec<Vec<String>>,
    pub warnings: Vec<ValidationError>,
    steps: HashMap<String, CompiledStep>,
}

impl ExecutionPlan {
    #[must_use]
    pub fn step(&self, key: &str) -> Option<&CompiledStep> {
        self.steps.get(key)
    }

    #[must_use]
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }
}

/// Compilation failure with every issue found, not just the first.
#[derive(Debug, Clone)]
pub struct CompileFailure {
    pub issues: Vec<ValidationError>,
    pub warnings: Vec<ValidationError>,
}

impl std::fmt::Display for CompileFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pipeline compilation failed:")?;
        for issue in &self.issues {
            write!(f, "\n  - {issue}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CompileFailure {}

/// Validate a definition without building a plan.
#[must_use]
pub fn validate(
    definition: &PipelineDefinition,
    registry: &AdapterRegistry,
    level: ValidationLevel,
) -> Validation {
    match compile(definition, registry, level) {
        Ok(plan) => Validation {
            is_valid: true,
            issues: Vec::new(),
            warnings: plan.warnings,
        },
        Err(failure) => Validation {
            is_valid: false,
            issues: failure.issues,
            warnings: failure.warnings,
        },
    }
}

/// Compile a definition into an execution plan.
///
/// # Errors
///
/// Returns a [`CompileFailure`] carrying every CONFIGURATION issue found:
/// duplicate keys, dangling references, unknown adapters, invalid configs,
/// malformed expressions, and cycles (naming the offending step keys).
pub fn compile(
    definition: &PipelineDefinition,
    registry: &AdapterRegistry,
    level: ValidationLevel,
) -> Result<ExecutionPlan, CompileFailure> {
    let mut issues = Vec::new();
    let mut warnings = Vec::new();

    if definition.name.trim().is_empty() {
        issues.push(ValidationError::new(
            ValidationCode::Required,
            "name",
            "pipeline name must not be empty",
        ));
    }

    // Unique step keys.
    let mut node_map: HashMap<&str, &PipelineStepDefinition> = HashMap::new();
    for node in &definition.nodes {
        if node_map.insert(node.key.as_str(), node).is_some() {
            issues.push(ValidationError::new(
                ValidationCode::DuplicateKey,
                format!("nodes[{}]", node.key),
                format!("step key '{}' is declared more than once", node.key),
            ));
        }
    }

    // Edge endpoints must exist.
    for (i, edge) in definition.edges.iter().enumerate() {
        for (end, key) in [("from", &edge.from), ("to", &edge.to)] {
            if !node_map.contains_key(key.as_str()) {
                issues.push(ValidationError::new(
                    ValidationCode::DanglingReference,
                    format!("edges[{i}].{end}"),
                    format!("edge references unknown step '{key}'"),
                ));
            }
        }
    }

    let mut routes: HashMap<String, RouteConfig> = HashMap::new();
    let mut conditions: HashMap<String, Expr> = HashMap::new();

    for node in &definition.nodes {
        let path = format!("nodes[{}]", node.key);
        check_adapter(node, registry, &path, &mut issues);

        if let Some(source) = &node.condition {
            match expr::parse(source) {
                Ok(parsed) => {
                    conditions.insert(node.key.clone(), parsed);
                }
                Err(error) => issues.push(ValidationError::new(
                    ValidationCode::InvalidExpression,
                    format!("{path}.condition"),
                    error.to_string(),
                )),
            }
        }

        if node.step_type == StepType::Route {
            match serde_json::from_value::<RouteConfig>(node.config.clone()) {
                Ok(route) => {
                    check_route(definition, node, &route, level, &mut issues, &mut warnings);
                    routes.insert(node.key.clone(), route);
                }
                Err(error) => issues.push(ValidationError::new(
                    ValidationCode::InvalidType,
                    format!("{path}.config"),
                    format!("invalid route config: {error}"),
                )),
            }
        }

        // Declared input/output lists are informational; flag dangling ones.
        for (list_name, list) in [("inputs", &node.inputs), ("outputs", &node.outputs)] {
            for key in list {
                if !node_map.contains_key(key.as_str()) {
                    warnings.push(ValidationError::new(
                        ValidationCode::DanglingReference,
                        format!("{path}.{list_name}"),
                        format!("declared {list_name} references unknown step '{key}'"),
                    ));
                }
            }
        }
    }

    // Edge conditions must parse.
    let mut edge_conditions: HashMap<usize, Expr> = HashMap::new();
    for (i, edge) in definition.edges.iter().enumerate() {
        if let Some(source) = &edge.condition {
            match expr::parse(source) {
                Ok(parsed) => {
                    edge_conditions.insert(i, parsed);
                }
                Err(error) => issues.push(ValidationError::new(
                    ValidationCode::InvalidExpression,
                    format!("edges[{i}].condition"),
                    error.to_string(),
                )),
            }
        }
    }

    check_triggers(&definition.triggers, &mut issues);

    let stages = topo_stages(definition, &node_map, &mut issues);

    if !issues.is_empty() {
        return Err(CompileFailure { issues, warnings });
    }

    // Assemble compiled steps.
    let mut steps: HashMap<String, CompiledStep> = definition
        .nodes
        .iter()
        .map(|node| {
            (
                node.key.clone(),
                CompiledStep {
                    def: node.clone(),
                    route: routes.remove(&node.key),
                    condition: conditions.remove(&node.key),
                    successors: Vec::new(),
                    predecessors: Vec::new(),
                },
            )
        })
        .collect();

    for (i, edge) in definition.edges.iter().enumerate() {
        if let Some(step) = steps.get_mut(&edge.from) {
            step.successors.push(SuccessorEdge {
                to: edge.to.clone(),
                branch: edge.branch.clone(),
                condition: edge_conditions.remove(&i),
            });
        }
        if let Some(step) = steps.get_mut(&edge.to) {
            if !step.predecessors.contains(&edge.from) {
                step.predecessors.push(edge.from.clone());
            }
        }
    }

    Ok(ExecutionPlan {
        pipeline: definition.name.clone(),
        variables: definition.variables.clone(),
        stages,
        warnings,
        steps,
    })
}

fn check_adapter(
    node: &PipelineStepDefinition,
    registry: &AdapterRegistry,
    path: &str,
    issues: &mut Vec<ValidationError>,
) {
    // TRIGGER steps are entry markers and may omit an adapter entirely.
    if node.step_type == StepType::Trigger && node.adapter_code.is_empty() {
        return;
    }

    match registry.definition(&node.adapter_code) {
        None => issues.push(ValidationError::new(
            ValidationCode::UnknownAdapter,
            format!("{path}.adapterCode"),
            format!("no adapter '{}' registered", node.adapter_code),
        )),
        Some(adapter) => {
            if !adapter.adapter_type.serves(node.step_type) {
                issues.push(ValidationError::new(
                    ValidationCode::IncompatibleAdapter,
                    format!("{path}.adapterCode"),
                    format!(
                        "adapter '{}' ({:?}) cannot serve a {:?} step",
                        node.adapter_code, adapter.adapter_type, node.step_type
                    ),
                ));
            }
            issues.extend(registry.validate_config(
                &node.adapter_code,
                &node.config,
                &format!("{path}.config"),
            ));
        }
    }
}

fn check_route(
    definition: &PipelineDefinition,
    node: &PipelineStepDefinition,
    route: &RouteConfig,
    level: ValidationLevel,
    issues: &mut Vec<ValidationError>,
    warnings: &mut Vec<ValidationError>,
) {
    let declared: HashSet<&str> = route
        .branches
        .iter()
        .map(|b| b.name.as_str())
        .chain(route.default_branch.as_deref())
        .collect();

    for (i, edge) in definition.edges.iter().enumerate() {
        if edge.from != node.key {
            continue;
        }
        match &edge.branch {
            Some(branch) if !declared.contains(branch.as_str()) => {
                let error = ValidationError::new(
                    ValidationCode::UnknownBranch,
                    format!("edges[{i}].branch"),
                    format!(
                        "edge references branch '{branch}' not declared by route step '{}'",
                        node.key
                    ),
                );
                // Stray branch references are fatal only at strict level.
                if level == ValidationLevel::Strict {
                    issues.push(error);
                } else {
                    warnings.push(error);
                }
            }
            Some(_) => {}
            None => warnings.push(ValidationError::new(
                ValidationCode::UnknownBranch,
                format!("edges[{i}]"),
                format!(
                    "edge out of route step '{}' has no branch and will receive no records",
                    node.key
                ),
            )),
        }
    }

    // Regex conditions must at least compile.
    for (bi, branch) in route.branches.iter().enumerate() {
        for (ci, cond) in branch.when.iter().enumerate() {
            if cond.cmp == Comparator::Matches {
                if let Some(pattern) = cond.value.as_str() {
                    if regex::Regex::new(pattern).is_err() {
                        warnings.push(ValidationError::new(
                            ValidationCode::InvalidFormat,
                            format!("nodes[{}].config.branches[{bi}].when[{ci}]", node.key),
                            format!("invalid regex /{pattern}/"),
                        ));
                    }
                }
            }
        }
    }
}

fn check_triggers(triggers: &[Trigger], issues: &mut Vec<ValidationError>) {
    for (i, trigger) in triggers.iter().enumerate() {
        match trigger {
            Trigger::Schedule { cron } => {
                let fields = cron.split_whitespace().count();
                if fields != 5 && fields != 6 {
                    issues.push(ValidationError::new(
                        ValidationCode::InvalidSchedule,
                        format!("triggers[{i}].cron"),
                        format!("cron expression '{cron}' must have 5 or 6 fields"),
                    ));
                }
            }
            Trigger::Webhook { .. } if trigger.requires_secret() => {
                issues.push(ValidationError::new(
                    ValidationCode::Required,
                    format!("triggers[{i}].secretCode"),
                    "authenticated webhook trigger requires a secret reference",
                ));
            }
            _ => {}
        }
    }
}

/// Kahn's algorithm over all edges. Remaining in-degree > 0 after the
/// sort signals a cycle; the offending step keys go into the error.
fn topo_stages(
    definition: &PipelineDefinition,
    node_map: &HashMap<&str, &PipelineStepDefinition>,
    issues: &mut Vec<ValidationError>,
) -> Vec<Vec<String>> {
    let mut in_degree: HashMap<&str, usize> =
        node_map.keys().map(|key| (*key, 0)).collect();
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut seen_pairs: HashSet<(&str, &str)> = HashSet::new();

    for edge in &definition.edges {
        let (from, to) = (edge.from.as_str(), edge.to.as_str());
        if !node_map.contains_key(from) || !node_map.contains_key(to) {
            continue;
        }
        // Parallel edges (several branches to one target) count once.
        if seen_pairs.insert((from, to)) {
            adjacency.entry(from).or_default().push(to);
            *in_degree.entry(to).or_insert(0) += 1;
        }
    }

    let mut stages = Vec::new();
    let mut ready: Vec<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(key, _)| *key)
        .collect();
    let mut resolved = 0usize;

    while !ready.is_empty() {
        sort_stage(&mut ready, node_map);
        let stage: Vec<String> = ready.iter().map(|key| (*key).to_string()).collect();
        resolved += stage.len();

        let mut next: Vec<&str> = Vec::new();
        for key in &ready {
            for successor in adjacency.get(key).into_iter().flatten() {
                let degree = in_degree
                    .get_mut(successor)
                    .unwrap_or_else(|| unreachable!("successor is a known node"));
                *degree -= 1;
                if *degree == 0 {
                    next.push(successor);
                }
            }
        }
        stages.push(stage);
        ready = next;
    }

    if resolved < node_map.len() {
        let mut stuck: Vec<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree > 0)
            .map(|(key, _)| *key)
            .collect();
        stuck.sort_unstable();
        issues.push(ValidationError::new(
            ValidationCode::Cycle,
            "edges",
            format!("cycle detected among steps: {}", stuck.join(", ")),
        ));
    }

    stages
}

/// Deterministic stage order: declared `order` first, then key.
fn sort_stage(stage: &mut [&str], node_map: &HashMap<&str, &PipelineStepDefinition>) {
    stage.sort_by_key(|key| {
        (
            node_map.get(key).map_or(0, |node| node.order),
            (*key).to_string(),
        )
    });
}
