use crate::models::TaskStatus;
use thiserror::Error;

/// Closed error taxonomy for the workspace-orchestration domain, per the
/// component contracts in spec.md §4 and the error taxonomy in §7.
#[derive(Error, Debug)]
pub enum McodaError {
    #[error("validation failed for {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("precondition failed: {reason}")]
    PreconditionFailed { reason: String },

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("gateway response unparseable after {attempts} attempt(s): {reason}")]
    GatewayUnparseable { attempts: u32, reason: String },

    #[error("agent '{agent}' unreachable: {reason}")]
    AgentUnreachable { agent: String, reason: String },

    #[error("resume not allowed for job {job_id}: {reason}")]
    ResumeNotAllowed { job_id: String, reason: String },

    #[error("step {step} failed for task {task_key} on attempt {attempt}: {reason}")]
    StepFailure {
        task_key: String,
        step: String,
        attempt: i32,
        reason: String,
    },

    #[error("operation cancelled: {reason}")]
    Cancelled { reason: String },

    #[error("fatal error: {0}")]
    Fatal(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid time range: {0}")]
    BadTimeRange(String),

    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: TaskStatus, to: TaskStatus },

    #[error("duplicate key: {0}")]
    DuplicateKey(String),
}

impl McodaError {
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        McodaError::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn precondition(reason: impl Into<String>) -> Self {
        McodaError::PreconditionFailed {
            reason: reason.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        McodaError::NotFound(what.into())
    }

    pub fn invalid_transition(from: TaskStatus, to: TaskStatus) -> Self {
        McodaError::InvalidStateTransition { from, to }
    }

    pub fn step_failure(
        task_key: impl Into<String>,
        step: impl Into<String>,
        attempt: i32,
        reason: impl Into<String>,
    ) -> Self {
        McodaError::StepFailure {
            task_key: task_key.into(),
            step: step.into(),
            attempt,
            reason: reason.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, McodaError::NotFound(_))
    }

    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            McodaError::Validation { .. } | McodaError::BadTimeRange(_)
        )
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            McodaError::StoreUnavailable(_) | McodaError::AgentUnreachable { .. }
        )
    }

    /// HTTP-status-flavored classification, mirroring the teacher's
    /// `TaskError::status_code` convention for callers that need one.
    pub fn status_code(&self) -> u16 {
        match self {
            McodaError::NotFound(_) => 404,
            McodaError::Validation { .. }
            | McodaError::BadTimeRange(_)
            | McodaError::InvalidStateTransition { .. }
            | McodaError::DuplicateKey(_) => 400,
            McodaError::PreconditionFailed { .. } => 412,
            McodaError::Cancelled { .. } => 499,
            McodaError::ResumeNotAllowed { .. } => 409,
            McodaError::StoreUnavailable(_) | McodaError::AgentUnreachable { .. } => 503,
            McodaError::GatewayUnparseable { .. } | McodaError::StepFailure { .. } => 422,
            McodaError::Fatal(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_roundtrip_into_variant() {
        let err = McodaError::validation("key", "must be non-empty");
        assert!(err.is_validation());
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn retryable_classification() {
        assert!(McodaError::StoreUnavailable("timeout".into()).is_retryable());
        assert!(!McodaError::Fatal("boom".into()).is_retryable());
    }

    #[test]
    fn invalid_transition_formats_both_states() {
        let err = McodaError::invalid_transition(TaskStatus::Completed, TaskStatus::InProgress);
        assert!(err.to_string().contains("completed"));
        assert!(err.to_string().contains("in_progress"));
    }
}
