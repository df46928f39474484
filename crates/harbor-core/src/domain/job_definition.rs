//! Job definition model
//!
//! A job definition is the declarative unit of work submitted by a job
//! poster. It is immutable once accepted; the engine only ever reads it.

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

use crate::types::LogType;
use crate::CoreError;

/// Declarative description of a job: a list of operations plus shared defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    /// Definition format version (e.g. "0.1")
    pub version: String,

    /// Job type, "container" for every job this engine runs
    #[serde(rename = "type")]
    pub job_type: String,

    /// Defaults applied to every `container/run` operation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global: Option<GlobalSettings>,

    /// Declared operations, in authoring order
    pub ops: Vec<Operation>,
}

impl JobDefinition {
    /// Parse a job definition from its JSON form
    pub fn from_json(json: &str) -> Result<Self, CoreError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Position of the first operation with the given id
    pub fn index_of(&self, op_id: &str) -> Option<usize> {
        self.ops.iter().position(|op| op.id == op_id)
    }
}

/// Defaults shared by all container operations of a job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalSettings {
    /// Default image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Request GPU access by default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu: Option<bool>,

    /// Environment merged under each operation's own env
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<BTreeMap<String, String>>,

    /// Default working directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<String>,
}

/// Operation type discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationType {
    /// Run a container to completion (or until stopped)
    #[serde(rename = "container/run")]
    ContainerRun,

    /// Create a named volume other operations of the flow can mount
    #[serde(rename = "container/create-volume")]
    ContainerCreateVolume,
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationType::ContainerRun => write!(f, "container/run"),
            OperationType::ContainerCreateVolume => write!(f, "container/create-volume"),
        }
    }
}

/// One declared unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Identifier, unique within the job definition
    pub id: String,

    /// Operation type
    #[serde(rename = "type")]
    pub op_type: OperationType,

    /// Type specific arguments, kept raw until they are interpolated
    #[serde(default)]
    pub args: serde_json::Value,

    /// Result extraction rules, in declaration order
    #[serde(
        default,
        skip_serializing_if = "Vec::is_empty",
        serialize_with = "serialize_result_rules",
        deserialize_with = "deserialize_result_rules"
    )]
    pub results: Vec<ResultRule>,

    /// Grouping and dependency metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionSettings>,
}

impl Operation {
    /// Name of the group this operation is scheduled in
    pub fn group_name(&self) -> &str {
        self.execution
            .as_ref()
            .and_then(|execution| execution.group.as_deref())
            .unwrap_or(&self.id)
    }

    /// Ids this operation waits on before it is launched
    pub fn depends_on(&self) -> &[String] {
        self.execution
            .as_ref()
            .map(|execution| execution.depends_on.as_slice())
            .unwrap_or(&[])
    }
}

/// Execution metadata of an operation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSettings {
    /// Group the operation is co-scheduled with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,

    /// Operations of the same group whose readiness this one waits for
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

/// Named result extraction rule
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRule {
    /// Key the extracted value is stored under
    pub name: String,

    /// Pattern applied to the captured logs
    pub regex: String,

    /// Log types the pattern is applied to; empty means every type
    pub log_type: Vec<LogType>,
}

#[derive(Serialize, Deserialize)]
struct ResultRuleBody {
    regex: String,
    #[serde(rename = "logType", default)]
    log_type: Vec<LogType>,
}

fn serialize_result_rules<S>(rules: &[ResultRule], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let mut map = serializer.serialize_map(Some(rules.len()))?;
    for rule in rules {
        map.serialize_entry(
            &rule.name,
            &ResultRuleBody {
                regex: rule.regex.clone(),
                log_type: rule.log_type.clone(),
            },
        )?;
    }
    map.end()
}

// Result rules are a JSON object; a visitor keeps the authored key order.
fn deserialize_result_rules<'de, D>(deserializer: D) -> Result<Vec<ResultRule>, D::Error>
where
    D: Deserializer<'de>,
{
    struct RulesVisitor;

    impl<'de> Visitor<'de> for RulesVisitor {
        type Value = Vec<ResultRule>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a map of result names to extraction rules")
        }

        fn visit_unit<E>(self) -> Result<Self::Value, E> {
            Ok(Vec::new())
        }

        fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut rules = Vec::with_capacity(access.size_hint().unwrap_or(0));
            while let Some((name, body)) = access.next_entry::<String, ResultRuleBody>()? {
                rules.push(ResultRule {
                    name,
                    regex: body.regex,
                    log_type: body.log_type,
                });
            }
            Ok(rules)
        }
    }

    deserializer.deserialize_any(RulesVisitor)
}

/// A string or list of strings, as accepted for `cmd` and `entrypoint`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StringOrList {
    /// Single string
    One(String),
    /// Already split list
    Many(Vec<String>),
}

/// Volume mount requested by a `container/run` operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    /// Volume name as declared by a `container/create-volume` operation
    pub name: String,

    /// Mount point inside the container
    pub dest: String,
}

/// Health check declared on a `container/run` operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HealthCheck {
    /// HTTP GET against the exposed port
    Http {
        /// Request path
        #[serde(default = "default_health_path")]
        path: String,

        /// Status code counted as healthy
        #[serde(default = "default_expected_status")]
        expected_status: u16,

        /// Keep probing after startup succeeded
        #[serde(default)]
        continuous: bool,
    },

    /// Healthy once a log line matches the pattern
    Log {
        /// Regular expression matched against stdout/stderr
        pattern: String,
    },
}

fn default_health_path() -> String {
    "/".to_string()
}

fn default_expected_status() -> u16 {
    200
}

/// Raw arguments of a `container/run` operation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerRunArgs {
    /// Image reference; falls back to the global image
    #[serde(default)]
    pub image: Option<String>,

    /// Command
    #[serde(default)]
    pub cmd: Option<StringOrList>,

    /// Entrypoint override
    #[serde(default)]
    pub entrypoint: Option<StringOrList>,

    /// Environment variables
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Working directory
    #[serde(default)]
    pub work_dir: Option<String>,

    /// Request GPU access
    #[serde(default)]
    pub gpu: Option<bool>,

    /// Volumes to mount
    #[serde(default)]
    pub volumes: Vec<VolumeMount>,

    /// Port the service listens on, when the operation is exposed
    #[serde(default)]
    pub expose: Option<u16>,

    /// Startup and continuous health checks
    #[serde(default)]
    pub health_checks: Vec<HealthCheck>,
}

/// Arguments of a `container/create-volume` operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateVolumeArgs {
    /// Volume name, scoped to the flow
    pub name: String,
}

/// Canonical container description, after interpolation and normalization
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    /// Image reference
    pub image: String,
    /// Command, already split into argv
    pub cmd: Vec<String>,
    /// Entrypoint, already split into argv
    pub entrypoint: Vec<String>,
    /// Environment, global values merged under the operation's own
    pub env: BTreeMap<String, String>,
    /// Working directory
    pub work_dir: Option<String>,
    /// GPU access
    pub gpu: bool,
    /// Volume mounts (declared names)
    pub volumes: Vec<VolumeMount>,
    /// Exposed port
    pub expose: Option<u16>,
    /// Health checks
    pub health_checks: Vec<HealthCheck>,
}

impl ContainerRunArgs {
    /// Normalize collection-typed fields into their canonical runtime shape
    pub fn normalize(
        self,
        op_id: &str,
        global: Option<&GlobalSettings>,
    ) -> Result<ContainerSpec, CoreError> {
        let image = self
            .image
            .or_else(|| global.and_then(|g| g.image.clone()))
            .filter(|image| !image.trim().is_empty())
            .ok_or_else(|| CoreError::InvalidArguments {
                op_id: op_id.to_string(),
                message: "no image given and no global image configured".to_string(),
            })?;

        let cmd = match self.cmd {
            Some(StringOrList::One(cmd)) => {
                vec!["/bin/sh".to_string(), "-c".to_string(), cmd]
            }
            Some(StringOrList::Many(cmd)) => cmd,
            None => Vec::new(),
        };

        let entrypoint = match self.entrypoint {
            Some(StringOrList::One(entrypoint)) => vec![entrypoint],
            Some(StringOrList::Many(entrypoint)) => entrypoint,
            None => Vec::new(),
        };

        let mut env = global
            .and_then(|g| g.env.clone())
            .unwrap_or_default();
        env.extend(self.env);

        Ok(ContainerSpec {
            image,
            cmd,
            entrypoint,
            env,
            work_dir: self
                .work_dir
                .or_else(|| global.and_then(|g| g.work_dir.clone())),
            gpu: self
                .gpu
                .or_else(|| global.and_then(|g| g.gpu))
                .unwrap_or(false),
            volumes: self.volumes,
            expose: self.expose,
            health_checks: self.health_checks,
        })
    }
}
