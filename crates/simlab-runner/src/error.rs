use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Where a replication-level failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// The generate stage failed. Always fatal for the run.
    Generation,
    /// The analyse stage failed. Transient, triggers a redraw.
    Analysis,
    /// Analysis produced missing or non-finite numbers. Transient.
    InvalidResult,
    /// `max_errors` consecutive attempts failed. Fatal for the condition.
    ConsecutiveFailureLimitExceeded,
    /// Analysis returned something that is neither numeric nor an aggregate.
    TypeContractViolation,
    /// The summarise stage failed. Fatal for the condition.
    Summarise,
}

impl FaultKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FaultKind::Generation => "generation",
            FaultKind::Analysis => "analysis",
            FaultKind::InvalidResult => "invalid_result",
            FaultKind::ConsecutiveFailureLimitExceeded => "consecutive_failure_limit_exceeded",
            FaultKind::TypeContractViolation => "type_contract_violation",
            FaultKind::Summarise => "summarise",
        }
    }

    /// Transient faults are recovered locally by drawing fresh data.
    pub fn is_transient(&self) -> bool {
        matches!(self, FaultKind::Analysis | FaultKind::InvalidResult)
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Fault {
    pub kind: FaultKind,
    pub message: String,
}

impl Fault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Run-level failures. Returned through `anyhow::Error`; callers that need to
/// branch on them use `err.downcast_ref::<SimError>()`.
#[derive(Debug, thiserror::Error)]
pub enum SimError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("output file already exists (clean it first): {0}")]
    OutputExists(PathBuf),
    #[error("checkpoint {path} does not match this run: {reason}")]
    CheckpointMismatch { path: PathBuf, reason: String },
    #[error("data generation failed for condition {condition_id}: {message}")]
    Generation { condition_id: u64, message: String },
    #[error("condition {condition_id} terminated: {message}")]
    ConditionTerminated { condition_id: u64, message: String },
    #[error("worker setup failed: {0}")]
    WorkerSetup(String),
    #[error("persistence failed for {path}: {message}")]
    Persistence { path: PathBuf, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_analysis_and_invalid_result_are_transient() {
        assert!(FaultKind::Analysis.is_transient());
        assert!(FaultKind::InvalidResult.is_transient());
        assert!(!FaultKind::Generation.is_transient());
        assert!(!FaultKind::ConsecutiveFailureLimitExceeded.is_transient());
        assert!(!FaultKind::TypeContractViolation.is_transient());
        assert!(!FaultKind::Summarise.is_transient());
    }

    #[test]
    fn fault_serializes_with_snake_case_kind() {
        let fault = Fault::new(FaultKind::InvalidResult, "x was NaN");
        let v = serde_json::to_value(&fault).expect("serialize");
        assert_eq!(v["kind"], "invalid_result");
        assert_eq!(fault.to_string(), "invalid_result: x was NaN");
    }
}
