use crate::value::{EngineValue, ValueKind};
use thiserror::Error;

/// Result type for engine ABI calls.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors reported by the engine ABI.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("engine has been torn down")]
    Destroyed,

    #[error("stale or invalid value handle")]
    InvalidHandle,

    #[error("expected an object, found {found}")]
    NotAnObject { found: ValueKind },

    #[error("value of kind {found} is not callable")]
    NotAFunction { found: ValueKind },

    #[error("function is not a constructor")]
    NotAConstructor,

    #[error("property '{name}' is not configurable")]
    NotConfigurable { name: String },

    #[error("cyclic prototype chain")]
    PrototypeCycle,

    /// The script runtime failed outside of script control (allocation,
    /// stack overflow, unrelated runtime).
    #[error("script runtime error: {message}")]
    Runtime { message: String },

    /// A value was thrown by script or by a native function.
    #[error("uncaught exception: {message}")]
    Exception { value: EngineValue, message: String },
}

impl EngineError {
    /// The thrown value, when this error is an exception.
    pub fn thrown(&self) -> Option<EngineValue> {
        match self {
            EngineError::Exception { value, .. } => Some(*value),
            _ => None,
        }
    }
}
