use crate::property::PropertyType;
use thiserror::Error;
use trellis_engine::{EngineError, EngineValue};

/// Result type for bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Errors that can occur while crossing the native/script boundary.
#[derive(Debug, Clone, Error)]
pub enum BridgeError {
    /// A handle or context was used after `dispose()`.
    #[error("value used after dispose")]
    UseAfterDispose,

    #[error("no native instance attached to the receiver of '{member}'")]
    MissingNativeInstance { member: String },

    #[error("cannot convert a {found} property value to {expected}")]
    TypeMismatch {
        expected: &'static str,
        found: PropertyType,
    },

    #[error("unknown unit suffix '{suffix}'")]
    UnknownUnit { suffix: String },

    /// Thrown from script or from a script-side callback.
    #[error("script exception: {message}")]
    ScriptException {
        message: String,
        thrown: Option<EngineValue>,
    },

    /// Raised by a native dispatch target.
    #[error("{message}")]
    Native { message: String },

    #[error(transparent)]
    Engine(EngineError),
}

impl BridgeError {
    pub fn native(message: impl Into<String>) -> Self {
        BridgeError::Native {
            message: message.into(),
        }
    }
}

impl From<EngineError> for BridgeError {
    fn from(error: EngineError) -> Self {
        match error {
            EngineError::Destroyed => BridgeError::UseAfterDispose,
            EngineError::Exception { value, message } => BridgeError::ScriptException {
                message,
                thrown: Some(value),
            },
            other => BridgeError::Engine(other),
        }
    }
}
