//! Error types for qjs-runtime
//!
//! Re-exports core errors from qjs-core and adds engine-specific errors.

use thiserror::Error;

// Re-export core error types
pub use qjs_core::{QjsError as CoreError, QjsResult as CoreResult};

/// Errors that can occur during engine operations
#[derive(Error, Debug)]
pub enum EngineError {
    /// Core QuickJS error
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Script execution timed out
    #[error("Script execution timed out after {0}ms")]
    Timeout(u64),

    /// The engine thread has stopped
    #[error("Engine shut down")]
    ShutDown,

    /// The engine thread could not be started
    #[error("Engine thread error: {0}")]
    Thread(String),
}

impl EngineError {
    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Core(CoreError::internal(message))
    }

    /// Whether the error came from script code rather than the engine
    pub fn is_script_error(&self) -> bool {
        matches!(self, Self::Core(e) if e.is_script_error())
    }
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
