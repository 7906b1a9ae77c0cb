use std::sync::Arc;

use thiserror::Error;

use crate::envelope::EnvelopeError;
use crate::meta::MetaType;

/// The specification itself is malformed, or the metadata cannot be compared
/// against it at all. This is a programmer error: it is returned immediately
/// instead of being collected as a field error.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SpecificationError {
    #[error("metadata must be a map to be verified, found {found}")]
    NotIndexable { found: MetaType },

    #[error("specification field '{key}' accepts no types")]
    EmptyTypeSet { key: String },

    #[error("specification field '{key}' is malformed: {reason}")]
    MalformedField { key: String, reason: String },

    #[error("specification must be a map of fields, found {found}")]
    NotAMap { found: MetaType },
}

/// A task's transform failed while a result was being realized.
///
/// The underlying error is shared so the memoized result can hand the same
/// failure out on every access.
#[derive(Debug, Clone, Error)]
#[error("task '{task}' failed: {cause:#}")]
pub struct InvocationError {
    task: String,
    cause: Arc<anyhow::Error>,
}

impl InvocationError {
    pub fn new(task: impl Into<String>, cause: impl Into<anyhow::Error>) -> Self {
        Self {
            task: task.into(),
            cause: Arc::new(cause.into()),
        }
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn cause(&self) -> &anyhow::Error {
        &self.cause
    }
}

#[derive(Debug, Error)]
pub enum StemError {
    #[error("task '{0}' not found in workspace '{1}'")]
    TaskNotFound(String, String),

    #[error(transparent)]
    Specification(#[from] SpecificationError),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error("worker protocol: {0}")]
    Worker(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invocation_error_keeps_task_and_cause() {
        let err = InvocationError::new("double", anyhow::anyhow!("x is missing"));
        assert_eq!(err.task(), "double");
        assert_eq!(err.to_string(), "task 'double' failed: x is missing");

        let replay = err.clone();
        assert_eq!(replay.cause().to_string(), "x is missing");
    }

    #[test]
    fn specification_error_messages_name_the_field() {
        let err = SpecificationError::EmptyTypeSet { key: "x".into() };
        assert!(err.to_string().contains("'x'"));
    }
}
