// Document-level errors produced by the collaboration engine.
//
// These are surfaced synchronously to the operation's originator and are never
// retried automatically: they indicate a state mismatch, not a transient failure.

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// The document id is not tracked by the engine.
    #[error("document {0} is not tracked")]
    NotFound(Uuid),

    /// A document with this id is already tracked.
    #[error("document {0} already exists")]
    AlreadyExists(Uuid),

    /// The operation references a version that does not exist yet, or is
    /// malformed (zero-length delete/replace, base_version below the retained
    /// history horizon, negative base_version).
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

impl EngineError {
    /// Stable machine-readable code, shared by REST and WebSocket error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "NOT_FOUND",
            EngineError::AlreadyExists(_) => "ALREADY_EXISTS",
            EngineError::InvalidOperation(_) => "INVALID_OPERATION",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        let id = Uuid::nil();
        assert_eq!(EngineError::NotFound(id).code(), "NOT_FOUND");
        assert_eq!(EngineError::AlreadyExists(id).code(), "ALREADY_EXISTS");
        assert_eq!(
            EngineError::InvalidOperation("x".into()).code(),
            "INVALID_OPERATION"
        );
    }

    #[test]
    fn display_includes_detail() {
        let err = EngineError::InvalidOperation("base_version 9 is ahead of version 2".into());
        assert!(err.to_string().contains("base_version 9"));
    }
}
