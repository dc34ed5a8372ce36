//! Kernel-level error type shared across the control plane.

/// Errors surfaced by repositories, coordination primitives and the run
/// lifecycle.
///
/// Policy-blocked outcomes are not errors; they are returned as values by the
/// trigger and policy APIs.
#[derive(Debug, Clone, thiserror::Error)]
pub enum KernelError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("coordinator unavailable: {0}")]
    CoordinatorUnavailable(String),
    #[error("misconfigured: {0}")]
    Misconfigured(String),
    #[error("workflow engine error: {0}")]
    Engine(String),
}

impl KernelError {
    /// Transient errors are retried at the run level; everything else is not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            KernelError::Store(_) | KernelError::CoordinatorUnavailable(_)
        )
    }

    pub fn not_found(what: &str, id: &str) -> Self {
        KernelError::NotFound(format!("{} '{}'", what, id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_infrastructure_errors_are_transient() {
        assert!(KernelError::Store("db down".into()).is_transient());
        assert!(KernelError::CoordinatorUnavailable("timeout".into()).is_transient());
        assert!(!KernelError::Validation("bad".into()).is_transient());
        assert!(!KernelError::Forbidden("no".into()).is_transient());
        assert!(!KernelError::Engine("boom".into()).is_transient());
    }

    #[test]
    fn not_found_formats_subject() {
        let err = KernelError::not_found("run", "run-1");
        assert_eq!(err.to_string(), "not found: run 'run-1'");
    }
}
