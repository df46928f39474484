//! Execution plan builder
//!
//! Turns the flat operation list of a job definition into an ordered list of
//! groups plus a readiness graph, and rejects definitions whose dependencies
//! cannot be honoured. Every problem found is reported, not just the first.

use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

use super::job_definition::Operation;

/// Validation error codes
pub mod error_codes {
    /// Two operations share an id
    pub const DUPLICATE_ID: &str = "ERR_PLAN_DUPLICATE_ID";

    /// An operation depends on itself
    pub const SELF_DEPENDENCY: &str = "ERR_PLAN_SELF_DEPENDENCY";

    /// An operation depends on an id that is not declared
    pub const UNKNOWN_DEPENDENCY: &str = "ERR_PLAN_UNKNOWN_DEPENDENCY";

    /// An operation depends on an operation of another group
    pub const CROSS_GROUP_DEPENDENCY: &str = "ERR_PLAN_CROSS_GROUP_DEPENDENCY";
}

/// A single problem found while building a plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanValidationError {
    /// Error code (one of [`error_codes`])
    pub code: &'static str,

    /// Human-readable error message
    pub message: String,

    /// Location of the offending operation (e.g. "ops[2]")
    pub path: Option<String>,
}

impl fmt::Display for PlanValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(path) = &self.path {
            write!(f, "{}: {} (at {})", self.code, self.message, path)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}

impl std::error::Error for PlanValidationError {}

/// Rejection of a job definition by the plan builder
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    /// A single validation error
    #[error("Plan validation error: {0}")]
    Invalid(PlanValidationError),

    /// Multiple validation errors
    #[error("{}", MultipleErrorsFormat(.0))]
    MultipleInvalid(Vec<PlanValidationError>),
}

struct MultipleErrorsFormat<'a>(&'a [PlanValidationError]);

impl fmt::Display for MultipleErrorsFormat<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Plan validation failed ({} issues):", self.0.len())?;
        for (i, err) in self.0.iter().enumerate() {
            write!(f, "\n  {}. {}", i + 1, err)?;
        }
        Ok(())
    }
}

impl PlanError {
    /// Wrap one or more validation errors
    pub fn from_validation_errors(errors: Vec<PlanValidationError>) -> Self {
        match <[PlanValidationError; 1]>::try_from(errors) {
            Ok([only]) => PlanError::Invalid(only),
            Err(errors) => PlanError::MultipleInvalid(errors),
        }
    }

    /// Every validation error carried by this rejection
    pub fn errors(&self) -> &[PlanValidationError] {
        match self {
            PlanError::Invalid(error) => std::slice::from_ref(error),
            PlanError::MultipleInvalid(errors) => errors,
        }
    }
}

/// Operations that start together as one scheduling tier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionContext {
    /// Group name (the op id for implicit singleton groups)
    pub group: String,

    /// Member operation ids, in definition order
    pub ops: Vec<String>,
}

/// Which signal of the source operation unlocks the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    /// Unlocked as soon as the source reports startup health
    Ready,
    /// Unlocked only once the source has finished
    Completion,
}

/// One edge of the dependency graph, seen from one end
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyEdge {
    /// Operation at the other end of the edge
    pub op_id: String,
    /// Unlocking signal
    pub kind: EdgeKind,
}

/// Dependency edges of one operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyContext {
    /// Operations this one waits for
    pub dependencies: Vec<DependencyEdge>,
    /// Operations waiting for this one
    pub dependents: Vec<DependencyEdge>,
}

impl DependencyContext {
    /// Ids of dependents unlocked by the given signal
    pub fn dependents_of_kind(&self, kind: EdgeKind) -> Vec<String> {
        self.dependents
            .iter()
            .filter(|edge| edge.kind == kind)
            .map(|edge| edge.op_id.clone())
            .collect()
    }
}

/// Validated execution plan of a job definition
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    op_map: HashMap<String, Operation>,
    op_index: HashMap<String, usize>,
    groups: Vec<ExecutionContext>,
    dependencies: HashMap<String, DependencyContext>,
}

impl ExecutionPlan {
    /// Build and validate the plan for a list of operations
    pub fn build(ops: &[Operation]) -> Result<Self, PlanError> {
        let mut errors = Vec::new();

        let mut op_map: HashMap<String, Operation> = HashMap::with_capacity(ops.len());
        let mut op_index = HashMap::with_capacity(ops.len());
        for (index, op) in ops.iter().enumerate() {
            if op_map.contains_key(&op.id) {
                errors.push(PlanValidationError {
                    code: error_codes::DUPLICATE_ID,
                    message: format!(
                        "Duplicate operation ID: '{}' - operation IDs must be unique within a job",
                        op.id
                    ),
                    path: Some(format!("ops[{}]", index)),
                });
                continue;
            }
            op_map.insert(op.id.clone(), op.clone());
            op_index.insert(op.id.clone(), index);
        }

        let mut groups: Vec<ExecutionContext> = Vec::new();
        let mut group_positions: HashMap<&str, usize> = HashMap::new();
        for (index, op) in ops.iter().enumerate() {
            if op_index.get(&op.id) != Some(&index) {
                continue;
            }
            let group_name = op.group_name();
            match group_positions.get(group_name) {
                Some(&position) => groups[position].ops.push(op.id.clone()),
                None => {
                    group_positions.insert(group_name, groups.len());
                    groups.push(ExecutionContext {
                        group: group_name.to_string(),
                        ops: vec![op.id.clone()],
                    });
                }
            }
        }

        let mut dependencies: HashMap<String, DependencyContext> = op_map
            .keys()
            .map(|id| (id.clone(), DependencyContext::default()))
            .collect();

        for (index, op) in ops.iter().enumerate() {
            if op_index.get(&op.id) != Some(&index) {
                continue;
            }
            let path = Some(format!("ops[{}].execution.depends_on", index));

            for dep in op.depends_on() {
                if dep == &op.id {
                    errors.push(PlanValidationError {
                        code: error_codes::SELF_DEPENDENCY,
                        message: format!("Operation '{}' depends on itself", op.id),
                        path: path.clone(),
                    });
                    continue;
                }

                let Some(target) = op_map.get(dep) else {
                    errors.push(PlanValidationError {
                        code: error_codes::UNKNOWN_DEPENDENCY,
                        message: format!(
                            "Operation '{}' depends on non-existent operation '{}'",
                            op.id, dep
                        ),
                        path: path.clone(),
                    });
                    continue;
                };

                if target.group_name() != op.group_name() {
                    errors.push(PlanValidationError {
                        code: error_codes::CROSS_GROUP_DEPENDENCY,
                        message: format!(
                            "Operation '{}' (group '{}') depends on '{}' from a different group '{}'",
                            op.id,
                            op.group_name(),
                            dep,
                            target.group_name()
                        ),
                        path: path.clone(),
                    });
                    continue;
                }

                if let Some(context) = dependencies.get_mut(&op.id) {
                    context.dependencies.push(DependencyEdge {
                        op_id: dep.clone(),
                        kind: EdgeKind::Ready,
                    });
                }
                if let Some(context) = dependencies.get_mut(dep) {
                    context.dependents.push(DependencyEdge {
                        op_id: op.id.clone(),
                        kind: EdgeKind::Ready,
                    });
                }
            }
        }

        if !errors.is_empty() {
            return Err(PlanError::from_validation_errors(errors));
        }

        Ok(Self {
            op_map,
            op_index,
            groups,
            dependencies,
        })
    }

    /// Groups in execution order
    pub fn groups(&self) -> &[ExecutionContext] {
        &self.groups
    }

    /// Look up an operation by id
    pub fn operation(&self, op_id: &str) -> Option<&Operation> {
        self.op_map.get(op_id)
    }

    /// Position of the operation's state in the flow
    pub fn index_of(&self, op_id: &str) -> Option<usize> {
        self.op_index.get(op_id).copied()
    }

    /// Dependency edges of an operation
    pub fn dependency_context(&self, op_id: &str) -> Option<&DependencyContext> {
        self.dependencies.get(op_id)
    }

    /// Operations unlocked when the given operation reports readiness
    pub fn ready_dependents(&self, op_id: &str) -> Vec<String> {
        self.dependency_context(op_id)
            .map(|context| context.dependents_of_kind(EdgeKind::Ready))
            .unwrap_or_default()
    }

    /// Number of distinct operations in the plan
    pub fn len(&self) -> usize {
        self.op_map.len()
    }

    /// Whether the plan has no operations
    pub fn is_empty(&self) -> bool {
        self.op_map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::job_definition::{ExecutionSettings, OperationType};
    use pretty_assertions::assert_eq;

    fn op(id: &str, group: Option<&str>, depends_on: &[&str]) -> Operation {
        Operation {
            id: id.to_string(),
            op_type: OperationType::ContainerRun,
            args: serde_json::json!({ "image": "ubuntu" }),
            results: Vec::new(),
            execution: Some(ExecutionSettings {
                group: group.map(str::to_string),
                depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
            }),
        }
    }

    #[test]
    fn test_ungrouped_operations_are_singleton_groups_in_order() {
        let ops = vec![op("c", None, &[]), op("a", None, &[]), op("b", None, &[])];

        let plan = ExecutionPlan::build(&ops).unwrap();

        let groups: Vec<_> = plan
            .groups()
            .iter()
            .map(|g| (g.group.as_str(), g.ops.clone()))
            .collect();
        assert_eq!(
            groups,
            vec![
                ("c", vec!["c".to_string()]),
                ("a", vec!["a".to_string()]),
                ("b", vec!["b".to_string()]),
            ]
        );
        assert_eq!(plan.len(), 3);
    }

    #[test]
    fn test_groups_keep_first_insertion_order() {
        let ops = vec![
            op("db", Some("services"), &[]),
            op("setup", None, &[]),
            op("client", Some("services"), &["db"]),
        ];

        let plan = ExecutionPlan::build(&ops).unwrap();

        assert_eq!(plan.groups().len(), 2);
        assert_eq!(plan.groups()[0].group, "services");
        assert_eq!(plan.groups()[0].ops, vec!["db".to_string(), "client".to_string()]);
        assert_eq!(plan.groups()[1].group, "setup");
        assert_eq!(plan.index_of("client"), Some(2));
    }

    #[test]
    fn test_dependencies_produce_ready_edges_both_ways() {
        let ops = vec![
            op("db", Some("g"), &[]),
            op("api", Some("g"), &["db"]),
            op("worker", Some("g"), &["db", "api"]),
        ];

        let plan = ExecutionPlan::build(&ops).unwrap();

        assert_eq!(plan.ready_dependents("db"), vec!["api".to_string(), "worker".to_string()]);
        assert_eq!(plan.ready_dependents("api"), vec!["worker".to_string()]);
        let worker = plan.dependency_context("worker").unwrap();
        assert!(worker
            .dependencies
            .iter()
            .all(|edge| edge.kind == EdgeKind::Ready));
        assert_eq!(worker.dependencies.len(), 2);
    }

    #[test]
    fn test_all_problems_are_reported_together() {
        let ops = vec![
            op("a", Some("g1"), &["a"]),
            op("a", None, &[]),
            op("b", Some("g1"), &["missing"]),
            op("c", Some("g2"), &["b"]),
        ];

        let err = ExecutionPlan::build(&ops).unwrap_err();

        let codes: Vec<_> = err.errors().iter().map(|e| e.code).collect();
        assert_eq!(
            codes,
            vec![
                error_codes::DUPLICATE_ID,
                error_codes::SELF_DEPENDENCY,
                error_codes::UNKNOWN_DEPENDENCY,
                error_codes::CROSS_GROUP_DEPENDENCY,
            ]
        );
        assert!(matches!(err, PlanError::MultipleInvalid(_)));
        assert!(err.to_string().contains("4 issues"));
    }

    #[test]
    fn test_single_problem_is_not_wrapped_in_a_list() {
        let ops = vec![op("a", None, &["ghost"])];

        let err = ExecutionPlan::build(&ops).unwrap_err();

        match &err {
            PlanError::Invalid(error) => {
                assert_eq!(error.code, error_codes::UNKNOWN_DEPENDENCY);
                assert_eq!(error.path.as_deref(), Some("ops[0].execution.depends_on"));
            }
            other => panic!("Expected a single error, got {:?}", other),
        }
    }

    #[test]
    fn test_implicit_groups_reject_cross_operation_dependencies() {
        // Without an explicit group every op is alone, so any dependency crosses groups
        let ops = vec![op("a", None, &[]), op("b", None, &["a"])];

        let err = ExecutionPlan::build(&ops).unwrap_err();

        assert_eq!(err.errors()[0].code, error_codes::CROSS_GROUP_DEPENDENCY);
    }
}
