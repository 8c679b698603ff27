use varsync_core::ProtocolError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("session executor closed")]
    ExecutorClosed,

    /// Backend logic panicked inside the executor.
    #[error("backend fault: {0}")]
    BackendFault(String),
}

impl EngineError {
    /// The machine code to push to a client for this failure.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Protocol(e) => e.code(),
            Self::ExecutorClosed => "session-closed",
            Self::BackendFault(_) => "backend-fault",
        }
    }
}

impl From<EngineError> for ProtocolError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Protocol(e) => e,
            other => ProtocolError::BackendFault(other.to_string()),
        }
    }
}
