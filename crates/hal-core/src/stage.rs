//! Pipeline stage definitions.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{JobId, PropertyBag, Result};

/// Whether a stage is a regular step or runs even after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageKind {
    Step,
    Cleanup,
}

/// A stage failure: a stable numeric code plus a user-facing message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageFailure {
    pub code: i32,
    pub message: String,
    pub context: Value,
}

impl StageFailure {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: Value::Object(Map::new()),
        }
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }
}

/// What a stage produced.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    /// New properties to add to the bag. Existing keys may not be repeated.
    Passed(Map<String, Value>),
    Failed(StageFailure),
}

impl StageOutcome {
    pub fn passed() -> Self {
        StageOutcome::Passed(Map::new())
    }

    pub fn with(key: impl Into<String>, value: Value) -> Self {
        let mut props = Map::new();
        props.insert(key.into(), value);
        StageOutcome::Passed(props)
    }

    pub fn failed(code: i32, message: impl Into<String>) -> Self {
        StageOutcome::Failed(StageFailure::new(code, message))
    }

    pub fn is_passed(&self) -> bool {
        matches!(self, StageOutcome::Passed(_))
    }
}

/// One step of a platform pipeline.
///
/// Stages hold no per-job state and can be reused across jobs. Returning
/// `Err` is a fatal error; expected failures are [`StageOutcome::Failed`].
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> StageKind {
        StageKind::Step
    }

    /// True when this stage creates remote state that needs cleaning up.
    fn allocates_remote(&self) -> bool {
        false
    }

    async fn run(&self, job: &JobId, bag: &PropertyBag) -> Result<StageOutcome>;
}

/// Forced cleanup run when a job dies with remote resources allocated.
#[async_trait]
pub trait EmergencyCleanup: Send + Sync {
    async fn cleanup(&self, job: &JobId, bag: &PropertyBag);
}

/// How a pipeline run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitStatus {
    Success,
    StageFailure { stage: String, code: i32 },
    FatalError { stage: String, message: String },
}

/// Process exit code used for fatal errors.
pub const FATAL_EXIT_CODE: i32 = 1;

impl ExitStatus {
    pub fn code(&self) -> i32 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::StageFailure { code, .. } => *code,
            ExitStatus::FatalError { .. } => FATAL_EXIT_CODE,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExitStatus::Success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(ExitStatus::Success.code(), 0);
        assert_eq!(
            ExitStatus::StageFailure {
                stage: "build".to_string(),
                code: 103
            }
            .code(),
            103
        );
        assert_eq!(
            ExitStatus::FatalError {
                stage: "build".to_string(),
                message: "boom".to_string()
            }
            .code(),
            FATAL_EXIT_CODE
        );
    }

    #[test]
    fn test_outcome_helpers() {
        assert!(StageOutcome::passed().is_passed());
        assert!(!StageOutcome::failed(100, "Unix build system is not configured").is_passed());
        match StageOutcome::with("decrypted", Value::Null) {
            StageOutcome::Passed(props) => assert!(props.contains_key("decrypted")),
            StageOutcome::Failed(_) => panic!("expected pass"),
        }
    }
}
