//! Argument interpolation
//!
//! Operation arguments may reference data produced by earlier operations of
//! the same flow:
//!
//! - `%%ops.<id>.results.<key>%%` is replaced by an extracted result
//! - `%%ops.<id>.host%%` is replaced by the hostname of the operation's container
//!
//! Interpolation happens on the raw JSON arguments, before they are parsed
//! into their typed form, so every string anywhere in the tree is covered.

use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

use super::flow::Flow;

lazy_static! {
    static ref PLACEHOLDER_REGEX: Regex =
        Regex::new(r"%%ops\.([A-Za-z0-9_\-]+)\.(results\.([A-Za-z0-9_\-]+)|host)%%")
            .expect("placeholder pattern is valid");
}

/// Error raised when a placeholder cannot be resolved
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InterpolationError {
    /// Placeholder names an operation the flow does not have
    #[error("unknown operation '{0}'")]
    UnknownOperation(String),

    /// Placeholder names a result the operation did not produce
    #[error("operation '{op_id}' has no result '{key}'")]
    MissingResult {
        /// Referenced operation
        op_id: String,
        /// Referenced result key
        key: String,
    },

    /// Placeholder names the host of an operation that has none yet
    #[error("operation '{0}' has no host")]
    MissingHost(String),
}

#[derive(Debug, Clone, Default)]
struct OpValues {
    host: Option<String>,
    results: BTreeMap<String, String>,
}

/// Values placeholders resolve against, snapshotted from a flow
#[derive(Debug, Clone, Default)]
pub struct InterpolationStore {
    ops: HashMap<String, OpValues>,
}

impl InterpolationStore {
    /// Snapshot hosts and results of every operation of a flow
    pub fn from_flow(flow: &Flow) -> Self {
        let ops = flow
            .state
            .op_states
            .iter()
            .map(|state| {
                (
                    state.operation_id.clone(),
                    OpValues {
                        host: state.host.clone(),
                        results: state.results.clone().unwrap_or_default(),
                    },
                )
            })
            .collect();

        Self { ops }
    }

    /// Register a host directly
    pub fn with_host(mut self, op_id: impl Into<String>, host: impl Into<String>) -> Self {
        self.ops.entry(op_id.into()).or_default().host = Some(host.into());
        self
    }

    /// Register a result directly
    pub fn with_result(
        mut self,
        op_id: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.ops
            .entry(op_id.into())
            .or_default()
            .results
            .insert(key.into(), value.into());
        self
    }

    /// Replace every placeholder in a string
    ///
    /// The first unresolvable placeholder aborts the whole substitution.
    pub fn interpolate_str(&self, input: &str) -> Result<String, InterpolationError> {
        let mut first_error = None;

        let output = PLACEHOLDER_REGEX.replace_all(input, |caps: &Captures<'_>| {
            match self.resolve(caps) {
                Ok(value) => value,
                Err(err) => {
                    first_error.get_or_insert(err);
                    String::new()
                }
            }
        });

        match first_error {
            Some(err) => Err(err),
            None => Ok(output.into_owned()),
        }
    }

    /// Replace every placeholder in every string of a JSON tree
    pub fn interpolate(&self, value: &Value) -> Result<Value, InterpolationError> {
        Ok(match value {
            Value::String(s) => Value::String(self.interpolate_str(s)?),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.interpolate(item))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(key, item)| Ok((key.clone(), self.interpolate(item)?)))
                    .collect::<Result<_, InterpolationError>>()?,
            ),
            other => other.clone(),
        })
    }

    fn resolve(&self, caps: &Captures<'_>) -> Result<String, InterpolationError> {
        let op_id = &caps[1];
        let values = self
            .ops
            .get(op_id)
            .ok_or_else(|| InterpolationError::UnknownOperation(op_id.to_string()))?;

        match caps.get(3) {
            Some(key) => values.results.get(key.as_str()).cloned().ok_or_else(|| {
                InterpolationError::MissingResult {
                    op_id: op_id.to_string(),
                    key: key.as_str().to_string(),
                }
            }),
            None => values
                .host
                .clone()
                .ok_or_else(|| InterpolationError::MissingHost(op_id.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn store() -> InterpolationStore {
        InterpolationStore::default()
            .with_host("db", "harbor-job-db")
            .with_result("train", "score", "0.93")
    }

    #[test]
    fn test_replaces_results_and_hosts() {
        let out = store()
            .interpolate_str("connect %%ops.db.host%%:5432 score=%%ops.train.results.score%%")
            .unwrap();
        assert_eq!(out, "connect harbor-job-db:5432 score=0.93");
    }

    #[test]
    fn test_leaves_plain_text_alone() {
        let out = store().interpolate_str("100%% sure, %%not.a.placeholder%%").unwrap();
        assert_eq!(out, "100%% sure, %%not.a.placeholder%%");
    }

    #[test]
    fn test_walks_nested_arguments() {
        let args = json!({
            "image": "client",
            "cmd": ["curl", "http://%%ops.db.host%%/"],
            "env": { "SCORE": "%%ops.train.results.score%%" },
            "expose": 8080
        });

        let out = store().interpolate(&args).unwrap();

        assert_eq!(
            out,
            json!({
                "image": "client",
                "cmd": ["curl", "http://harbor-job-db/"],
                "env": { "SCORE": "0.93" },
                "expose": 8080
            })
        );
    }

    #[test]
    fn test_unresolvable_placeholders() {
        let cases = vec![
            (
                "%%ops.nope.host%%",
                InterpolationError::UnknownOperation("nope".to_string()),
            ),
            (
                "%%ops.train.results.loss%%",
                InterpolationError::MissingResult {
                    op_id: "train".to_string(),
                    key: "loss".to_string(),
                },
            ),
            ("%%ops.train.host%%", InterpolationError::MissingHost("train".to_string())),
        ];

        for (input, expected) in cases {
            assert_eq!(store().interpolate_str(input).unwrap_err(), expected);
        }
    }
}
