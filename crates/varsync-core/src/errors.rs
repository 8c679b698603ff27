use crate::ids::{ObjId, VarId};

/// Failures raised while applying a single protocol message.
///
/// None of these abort a batch: the handler turns each one into an `error`
/// push for the originating connection and moves on to the next message.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// Write-direction navigation hit a missing or unwritable node.
    #[error("path failure at {path:?}: {reason}")]
    PathFailure { path: String, reason: String },
    #[error("variable {0} not found")]
    NotFound(VarId),
    #[error("object {0} not found")]
    ObjectNotFound(ObjId),
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("invalid id {id}: {reason}")]
    InvalidId { id: VarId, reason: String },
    #[error("variable {0} is read-only")]
    ReadOnly(VarId),
    #[error("unknown wrapper {0:?}")]
    UnknownWrapper(String),
    /// Backend logic panicked or otherwise failed inside the executor.
    #[error("backend fault: {0}")]
    BackendFault(String),
}

impl ProtocolError {
    pub fn path_failure(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PathFailure {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn malformed(reason: impl std::fmt::Display) -> Self {
        Self::Malformed(reason.to_string())
    }

    /// Short machine-matchable code carried on `error` pushes.
    pub fn code(&self) -> &'static str {
        match self {
            Self::PathFailure { .. } => "path-failure",
            Self::NotFound(_) | Self::ObjectNotFound(_) => "not-found",
            Self::Malformed(_) => "malformed",
            Self::Unauthorized(_) => "unauthorized",
            Self::InvalidId { .. } => "invalid-id",
            Self::ReadOnly(_) => "read-only",
            Self::UnknownWrapper(_) => "unknown-wrapper",
            Self::BackendFault(_) => "backend-fault",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(ProtocolError::path_failure("a.b", "missing a").code(), "path-failure");
        assert_eq!(ProtocolError::NotFound(VarId(3)).code(), "not-found");
        assert_eq!(ProtocolError::ObjectNotFound(ObjId(-1)).code(), "not-found");
        assert_eq!(ProtocolError::malformed("bad").code(), "malformed");
        assert_eq!(ProtocolError::ReadOnly(VarId(2)).code(), "read-only");
        assert_eq!(ProtocolError::BackendFault("boom".into()).code(), "backend-fault");
    }

    #[test]
    fn display_includes_context() {
        let err = ProtocolError::path_failure("father.name", "father is missing");
        let msg = err.to_string();
        assert!(msg.contains("father.name"));
        assert!(msg.contains("father is missing"));
    }
}
