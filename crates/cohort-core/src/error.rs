//! Error types shared by every Cohort crate.

use crate::id::Id;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Boxed cause produced by an instantiator.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Why a registered implementation could not be constructed.
#[derive(Error, Debug)]
pub enum InstantiationCause {
    /// The description has no implementation bound to it.
    #[error("no implementation bound to description '{0}'")]
    MissingImplementation(String),

    /// The arguments match none of the signatures the description supports.
    #[error("arguments ({found}) match no supported signature of '{name}'")]
    SignatureMismatch { name: String, found: String },

    /// The implementation's constructor itself failed.
    #[error("constructor failed: {0}")]
    Constructor(#[source] BoxError),
}

/// Signal raised by `wait_to_commit` when a replication transaction ends
/// without committing.
///
/// `timeout_ms` is only present when the deadline expired; an explicit
/// refusal from a member carries its `cause` instead.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AbortSignal {
    pub object_id: Id,
    pub cause: Option<String>,
    pub timeout_ms: Option<u64>,
}

impl AbortSignal {
    pub fn refused(object_id: Id, cause: impl Into<String>) -> Self {
        Self {
            object_id,
            cause: Some(cause.into()),
            timeout_ms: None,
        }
    }

    pub fn timed_out(object_id: Id, timeout_ms: u64) -> Self {
        Self {
            object_id,
            cause: None,
            timeout_ms: Some(timeout_ms),
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.timeout_ms.is_some()
    }
}

impl fmt::Display for AbortSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.cause, self.timeout_ms) {
            (_, Some(ms)) => write!(
                f,
                "add of shared object {} timed out after {}ms",
                self.object_id, ms
            ),
            (Some(cause), None) => {
                write!(f, "add of shared object {} aborted: {}", self.object_id, cause)
            }
            (None, None) => write!(f, "add of shared object {} aborted", self.object_id),
        }
    }
}

impl std::error::Error for AbortSignal {}

/// Errors that can occur in Cohort operations.
#[derive(Error, Debug, Clone)]
pub enum CohortError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("shared object already present: {0}")]
    DuplicateObject(Id),

    #[error("failed to instantiate '{name}'")]
    Instantiation {
        name: String,
        #[source]
        source: Arc<InstantiationCause>,
    },

    #[error("connect failed: {0}")]
    Connect(String),

    #[error(transparent)]
    Abort(#[from] AbortSignal),

    #[error("container has shut down")]
    Shutdown,
}

impl CohortError {
    pub fn instantiation(name: impl Into<String>, cause: InstantiationCause) -> Self {
        CohortError::Instantiation {
            name: name.into(),
            source: Arc::new(cause),
        }
    }
}

pub type Result<T> = std::result::Result<T, CohortError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_abort_signal_distinguishes_timeout() {
        let timeout = AbortSignal::timed_out(Id::from("o1"), 2000);
        let refusal = AbortSignal::refused(Id::from("o1"), "duplicate");

        assert!(timeout.is_timeout());
        assert_eq!(timeout.timeout_ms, Some(2000));
        assert!(!refusal.is_timeout());
        assert_eq!(refusal.cause.as_deref(), Some("duplicate"));
    }

    #[test]
    fn test_instantiation_keeps_cause() {
        let err = CohortError::instantiation(
            "cohort.value",
            InstantiationCause::MissingImplementation("cohort.value".into()),
        );

        let source = err.source().expect("cause attached");
        assert!(source.to_string().contains("no implementation"));
    }

    #[test]
    fn test_abort_converts_into_cohort_error() {
        let err: CohortError = AbortSignal::timed_out(Id::from("o1"), 10).into();
        assert!(matches!(err, CohortError::Abort(ref s) if s.is_timeout()));
        assert!(err.to_string().contains("timed out after 10ms"));
    }
}
