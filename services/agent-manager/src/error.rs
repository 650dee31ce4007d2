//! Errors surfaced by a reconciliation pass.

use std::time::Duration;

use thiserror::Error;

/// Result type for manager operations.
pub type ManagerResult<T> = Result<T, ManagerError>;

/// Errors that fail a reconciliation pass.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// The gather phase did not finish in time. No plan is produced.
    #[error("gathering fleet state timed out after {0:?}")]
    GatherTimeout(Duration),

    /// A collaborator failed while gathering fleet state.
    #[error("gathering fleet state failed: {0}")]
    Gather(#[source] anyhow::Error),

    /// The fleet configuration could not be fetched or decoded.
    #[error("loading fleet configuration failed: {0}")]
    Config(#[source] anyhow::Error),

    /// One or more action groups failed while executing the plan.
    #[error("execution failed in: {}", failed_groups.join(", "))]
    Execution { failed_groups: Vec<String> },
}

impl ManagerError {
    /// Returns true if the pass never reached planning.
    pub fn is_pre_plan(&self) -> bool {
        matches!(
            self,
            ManagerError::GatherTimeout(_) | ManagerError::Gather(_) | ManagerError::Config(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_error_lists_groups() {
        let err = ManagerError::Execution {
            failed_groups: vec!["create".to_string(), "stop".to_string()],
        };
        assert_eq!(err.to_string(), "execution failed in: create, stop");
        assert!(!err.is_pre_plan());
    }

    #[test]
    fn test_gather_timeout_message() {
        let err = ManagerError::GatherTimeout(Duration::from_secs(60));
        assert_eq!(err.to_string(), "gathering fleet state timed out after 60s");
        assert!(err.is_pre_plan());
    }
}
