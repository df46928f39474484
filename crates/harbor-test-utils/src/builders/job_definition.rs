//! Fluent builders for job definitions and their operations.

use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

use harbor_core::domain::job_definition::{ExecutionSettings, GlobalSettings, ResultRule};
use harbor_core::{JobDefinition, LogType, Operation, OperationType};

/// Builder for a single [`Operation`]
#[derive(Debug, Clone)]
pub struct OperationBuilder {
    id: String,
    op_type: OperationType,
    args: Map<String, Value>,
    results: Vec<ResultRule>,
    execution: Option<ExecutionSettings>,
}

impl OperationBuilder {
    /// Operation of any type with empty arguments
    pub fn new(id: &str, op_type: OperationType) -> Self {
        Self {
            id: id.to_string(),
            op_type,
            args: Map::new(),
            results: Vec::new(),
            execution: None,
        }
    }

    /// `container/run` operation with an image
    pub fn run(id: &str, image: &str) -> Self {
        Self::new(id, OperationType::ContainerRun).arg("image", json!(image))
    }

    /// `container/run` operation relying on the global image
    pub fn run_global(id: &str) -> Self {
        Self::new(id, OperationType::ContainerRun)
    }

    /// `container/create-volume` operation
    pub fn volume(id: &str, name: &str) -> Self {
        Self::new(id, OperationType::ContainerCreateVolume).arg("name", json!(name))
    }

    /// Set a raw argument
    pub fn arg(mut self, key: &str, value: Value) -> Self {
        self.args.insert(key.to_string(), value);
        self
    }

    /// Shell command, run through `/bin/sh -c`
    pub fn cmd(self, cmd: &str) -> Self {
        self.arg("cmd", json!(cmd))
    }

    /// Environment variable
    pub fn env(mut self, key: &str, value: &str) -> Self {
        let env = self
            .args
            .entry("env".to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(env) = env {
            env.insert(key.to_string(), json!(value));
        }
        self
    }

    /// Mount a volume declared by a create-volume operation
    pub fn mount(mut self, name: &str, dest: &str) -> Self {
        let volumes = self
            .args
            .entry("volumes".to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(volumes) = volumes {
            volumes.push(json!({ "name": name, "dest": dest }));
        }
        self
    }

    /// Expose a port
    pub fn expose(self, port: u16) -> Self {
        self.arg("expose", json!(port))
    }

    /// Startup health check matching a log pattern
    pub fn log_health_check(self, pattern: &str) -> Self {
        self.health_check(json!({ "type": "log", "pattern": pattern }))
    }

    /// HTTP health check against the exposed port
    pub fn http_health_check(self, path: &str, continuous: bool) -> Self {
        self.health_check(json!({ "type": "http", "path": path, "continuous": continuous }))
    }

    fn health_check(mut self, check: Value) -> Self {
        let checks = self
            .args
            .entry("health_checks".to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(checks) = checks {
            checks.push(check);
        }
        self
    }

    /// Result extraction rule
    pub fn result(mut self, name: &str, regex: &str, log_types: &[LogType]) -> Self {
        self.results.push(ResultRule {
            name: name.to_string(),
            regex: regex.to_string(),
            log_type: log_types.to_vec(),
        });
        self
    }

    /// Schedule the operation in a named group
    pub fn group(mut self, group: &str) -> Self {
        self.execution.get_or_insert_with(Default::default).group = Some(group.to_string());
        self
    }

    /// Wait for another operation's readiness
    pub fn depends_on(mut self, op_id: &str) -> Self {
        self.execution
            .get_or_insert_with(Default::default)
            .depends_on
            .push(op_id.to_string());
        self
    }

    /// Build the operation
    pub fn build(self) -> Operation {
        Operation {
            id: self.id,
            op_type: self.op_type,
            args: Value::Object(self.args),
            results: self.results,
            execution: self.execution,
        }
    }
}

/// Builder for a [`JobDefinition`]
#[derive(Debug, Clone)]
pub struct JobDefinitionBuilder {
    global: Option<GlobalSettings>,
    ops: Vec<Operation>,
}

impl Default for JobDefinitionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl JobDefinitionBuilder {
    /// Empty container job
    pub fn new() -> Self {
        Self {
            global: None,
            ops: Vec::new(),
        }
    }

    /// Default image of every container operation
    pub fn global_image(mut self, image: &str) -> Self {
        self.global.get_or_insert_with(Default::default).image = Some(image.to_string());
        self
    }

    /// Environment shared by every container operation
    pub fn global_env(mut self, key: &str, value: &str) -> Self {
        self.global
            .get_or_insert_with(Default::default)
            .env
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.to_string());
        self
    }

    /// Append an operation
    pub fn op(mut self, op: OperationBuilder) -> Self {
        self.ops.push(op.build());
        self
    }

    /// Build the definition
    pub fn build(self) -> JobDefinition {
        JobDefinition {
            version: "0.1".to_string(),
            job_type: "container".to_string(),
            global: self.global,
            ops: self.ops,
        }
    }
}
