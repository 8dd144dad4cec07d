//! Trellis bridge: native handles to script values, native classes exposed
//! to scripts, and the lockable property model shared by both sides.

pub mod callback;
pub mod class;
pub mod context;
pub mod error;
pub mod module;
pub mod native;
pub mod property;
pub mod protect;
pub mod settings;
pub mod value;

pub use callback::{CallRecord, ConstructorCallback, FunctionCallback, GetterCallback, SetterCallback};
pub use class::{ClassBridge, ClassSchema, MemberKind, ObjectBuilder};
pub use context::{Context, ErrorHandler};
pub use error::{BridgeError, BridgeResult};
pub use module::{ImportModule, Module};
pub use native::{Native, NativeClass, ObjectHolder};
pub use property::{LockToken, Property, PropertyType, PropertyValue, Unit, ValueParser, Variant};
pub use protect::ProtectionGuard;
pub use settings::BridgeSettings;
pub use value::ValueHandle;

/// Bridge version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
