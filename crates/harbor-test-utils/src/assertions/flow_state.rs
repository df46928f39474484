//! Assertion utilities for validating flow and operation states.

use thiserror::Error;

use harbor_core::{Flow, FlowStatus, OpState, OpStatus};

/// Error type for flow state validation failures
#[derive(Debug, Error)]
pub enum FlowStateValidationError {
    #[error("Invalid flow status: expected {expected}, got {actual}")]
    InvalidFlowStatus { expected: String, actual: String },

    #[error("Invalid status of operation {op_id}: expected {expected}, got {actual}")]
    InvalidOpStatus {
        op_id: String,
        expected: String,
        actual: String,
    },

    #[error("Missing operation state: {0}")]
    MissingOpState(String),

    #[error("Operation {op_id} has no log containing {needle:?}")]
    MissingLog { op_id: String, needle: String },

    #[error("Invalid result {key} of operation {op_id}: expected {expected:?}, got {actual:?}")]
    InvalidResult {
        op_id: String,
        key: String,
        expected: Option<String>,
        actual: Option<String>,
    },

    #[error("Flow validation error: {0}")]
    Other(String),
}

fn op_state<'a>(flow: &'a Flow, op_id: &str) -> Result<&'a OpState, FlowStateValidationError> {
    flow.op_state(op_id)
        .ok_or_else(|| FlowStateValidationError::MissingOpState(op_id.to_string()))
}

/// Asserts that a flow has the expected status.
pub fn assert_flow_status(
    flow: &Flow,
    expected: FlowStatus,
) -> Result<(), FlowStateValidationError> {
    if flow.state.status != expected {
        return Err(FlowStateValidationError::InvalidFlowStatus {
            expected: format!("{expected:?}"),
            actual: format!("{:?}", flow.state.status),
        });
    }
    Ok(())
}

/// Asserts that an operation has the expected status.
pub fn assert_op_status(
    flow: &Flow,
    op_id: &str,
    expected: OpStatus,
) -> Result<(), FlowStateValidationError> {
    let state = op_state(flow, op_id)?;
    if state.status != expected {
        return Err(FlowStateValidationError::InvalidOpStatus {
            op_id: op_id.to_string(),
            expected: format!("{expected:?}"),
            actual: format!("{:?}", state.status),
        });
    }
    Ok(())
}

/// Asserts that one of an operation's persisted log entries contains a string.
pub fn assert_op_logs_contain(
    flow: &Flow,
    op_id: &str,
    needle: &str,
) -> Result<(), FlowStateValidationError> {
    let state = op_state(flow, op_id)?;
    if state.logs.iter().any(|entry| entry.log.contains(needle)) {
        Ok(())
    } else {
        Err(FlowStateValidationError::MissingLog {
            op_id: op_id.to_string(),
            needle: needle.to_string(),
        })
    }
}

/// Asserts the value extracted under a result key; `None` expects the key to be absent.
pub fn assert_op_result(
    flow: &Flow,
    op_id: &str,
    key: &str,
    expected: Option<&str>,
) -> Result<(), FlowStateValidationError> {
    let state = op_state(flow, op_id)?;
    let actual = state
        .results
        .as_ref()
        .and_then(|results| results.get(key))
        .cloned();
    if actual.as_deref() != expected {
        return Err(FlowStateValidationError::InvalidResult {
            op_id: op_id.to_string(),
            key: key.to_string(),
            expected: expected.map(str::to_string),
            actual,
        });
    }
    Ok(())
}

/// Asserts that no operation of the flow has been touched.
pub fn assert_all_ops_init(flow: &Flow) -> Result<(), FlowStateValidationError> {
    for state in &flow.state.op_states {
        if state.status != OpStatus::Init || state.start_time.is_some() {
            return Err(FlowStateValidationError::InvalidOpStatus {
                op_id: state.operation_id.clone(),
                expected: format!("{:?}", OpStatus::Init),
                actual: format!("{:?}", state.status),
            });
        }
    }
    Ok(())
}

/// Asserts that every operation reached a terminal status.
pub fn assert_all_ops_finished(flow: &Flow) -> Result<(), FlowStateValidationError> {
    match flow.state.op_states.iter().find(|state| !state.is_finished()) {
        Some(state) => Err(FlowStateValidationError::Other(format!(
            "operation {} is still {:?}",
            state.operation_id, state.status
        ))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders::{JobDefinitionBuilder, OperationBuilder};
    use harbor_core::{FlowId, LogEntry};

    fn flow() -> Flow {
        let definition = JobDefinitionBuilder::new()
            .op(OperationBuilder::run("a", "ubuntu").cmd("echo hi"))
            .build();
        Flow::new(FlowId::from("flow"), definition)
    }

    #[test]
    fn test_fresh_flow_assertions() {
        let flow = flow();

        assert!(assert_flow_status(&flow, FlowStatus::Init).is_ok());
        assert!(assert_op_status(&flow, "a", OpStatus::Init).is_ok());
        assert!(assert_all_ops_init(&flow).is_ok());
        assert!(assert_all_ops_finished(&flow).is_err());
        assert!(assert_op_result(&flow, "a", "x", None).is_ok());
    }

    #[test]
    fn test_assertion_failures() {
        let mut flow = flow();
        flow.state.op_states[0].logs.push(LogEntry::stdout("hi\n"));

        assert!(matches!(
            assert_flow_status(&flow, FlowStatus::Success),
            Err(FlowStateValidationError::InvalidFlowStatus { .. })
        ));
        assert!(matches!(
            assert_op_status(&flow, "missing", OpStatus::Init),
            Err(FlowStateValidationError::MissingOpState(_))
        ));
        assert!(assert_op_logs_contain(&flow, "a", "hi").is_ok());
        assert!(matches!(
            assert_op_logs_contain(&flow, "a", "bye"),
            Err(FlowStateValidationError::MissingLog { .. })
        ));
    }
}
