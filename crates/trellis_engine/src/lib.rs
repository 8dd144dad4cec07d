//! Trellis Engine - scripting engine ABI over QuickJS
//!
//! The bridge talks to its scripting engine only through the handle-based
//! [`Engine`] trait. [`QuickJsEngine`] is the bundled implementation: an
//! rquickjs runtime whose values reach the host as generational slot
//! handles, with native functions, accessors and finalizers layered on top.

pub mod abi;
pub mod error;
pub mod runtime;
pub mod value;

mod slots;

pub use abi::{
    Engine, ExceptionHandler, FinalizeHandler, Invocation, NativeFunction, PropertyDescriptor, PropertyKey,
};
pub use error::{EngineError, EngineResult};
pub use runtime::{EngineStats, QuickJsEngine};
pub use value::{EngineValue, ValueKind};

/// Trellis Engine version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
