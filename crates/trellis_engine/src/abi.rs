//! The engine ABI
//!
//! Everything the bridge does to the scripting engine goes through the
//! object-safe [`Engine`] trait. Implementations use interior mutability and
//! must be re-entrant: no internal borrow may be held while a native function,
//! accessor, finalizer or exception handler runs.

use crate::error::EngineResult;
use crate::value::{EngineValue, ValueKind};
use std::any::Any;
use std::rc::Rc;

/// A host function exposed to script. `Err` carries a thrown value.
pub type NativeFunction = Rc<dyn Fn(&dyn Engine, &Invocation<'_>) -> Result<EngineValue, EngineValue>>;

/// Runs once after an object has been reclaimed, receiving its associated data.
pub type FinalizeHandler = Box<dyn FnOnce(&dyn Engine, Option<Rc<dyn Any>>)>;

/// Receives exceptions that escape to the host.
pub type ExceptionHandler = Rc<dyn Fn(&dyn Engine, EngineValue)>;

/// Arguments of one native function invocation.
///
/// Borrowed for the duration of the call only.
#[derive(Debug, Clone, Copy)]
pub struct Invocation<'a> {
    /// The receiver (`this`). For constructions, the freshly allocated object.
    pub target: EngineValue,
    /// The function object being invoked.
    pub callee: EngineValue,
    pub arguments: &'a [EngineValue],
    pub constructing: bool,
}

impl<'a> Invocation<'a> {
    pub fn argument(&self, index: usize) -> Option<EngineValue> {
        self.arguments.get(index).copied()
    }
}

/// Property key: string name, array index, or symbol.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyKey {
    Name(String),
    Index(u32),
    Symbol(EngineValue),
}

impl From<&str> for PropertyKey {
    fn from(name: &str) -> Self {
        PropertyKey::Name(name.to_string())
    }
}

impl From<String> for PropertyKey {
    fn from(name: String) -> Self {
        PropertyKey::Name(name)
    }
}

impl From<u32> for PropertyKey {
    fn from(index: u32) -> Self {
        PropertyKey::Index(index)
    }
}

/// Property definition, mirroring the two kinds of ECMAScript properties.
///
/// For accessors, a `None` getter or setter keeps whatever the existing
/// property already has.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyDescriptor {
    Data {
        value: EngineValue,
        writable: bool,
        enumerable: bool,
        configurable: bool,
    },
    Accessor {
        getter: Option<EngineValue>,
        setter: Option<EngineValue>,
        enumerable: bool,
        configurable: bool,
    },
}

impl PropertyDescriptor {
    /// Writable, enumerable, configurable data property (plain assignment).
    pub fn value(value: EngineValue) -> Self {
        PropertyDescriptor::Data {
            value,
            writable: true,
            enumerable: true,
            configurable: true,
        }
    }

    /// Non-writable, non-enumerable, non-configurable data property.
    pub fn constant(value: EngineValue) -> Self {
        PropertyDescriptor::Data {
            value,
            writable: false,
            enumerable: false,
            configurable: false,
        }
    }

    /// Non-enumerable, configurable accessor property.
    pub fn accessor(getter: Option<EngineValue>, setter: Option<EngineValue>) -> Self {
        PropertyDescriptor::Accessor {
            getter,
            setter,
            enumerable: false,
            configurable: true,
        }
    }

    pub fn enumerable(&self) -> bool {
        match self {
            PropertyDescriptor::Data { enumerable, .. } => *enumerable,
            PropertyDescriptor::Accessor { enumerable, .. } => *enumerable,
        }
    }

    pub fn configurable(&self) -> bool {
        match self {
            PropertyDescriptor::Data { configurable, .. } => *configurable,
            PropertyDescriptor::Accessor { configurable, .. } => *configurable,
        }
    }
}

/// Handle-based scripting engine interface.
///
/// Heap values stay alive while reachable from a root: the global object, a
/// protected value, or the arguments of an in-flight invocation. A handle to
/// an unprotected value goes stale once a collection pass finds nothing in
/// script reaching it.
pub trait Engine {
    // ------------------------------------------------------------------
    // Creation
    // ------------------------------------------------------------------

    fn undefined(&self) -> EngineValue;
    fn null(&self) -> EngineValue;
    fn boolean(&self, value: bool) -> EngineValue;
    fn number(&self, value: f64) -> EngineValue;
    fn string(&self, value: &str) -> EngineResult<EngineValue>;
    fn symbol(&self, description: &str) -> EngineResult<EngineValue>;

    /// Plain object. `None` gives an object with no prototype.
    fn object(&self, prototype: Option<EngineValue>) -> EngineResult<EngineValue>;
    fn array(&self, elements: &[EngineValue]) -> EngineResult<EngineValue>;
    fn function(&self, name: &str, function: NativeFunction) -> EngineResult<EngineValue>;

    /// Function usable with [`Engine::construct`]; its `prototype` property is
    /// a fresh object whose `constructor` points back at the function.
    fn constructor(&self, name: &str, function: NativeFunction) -> EngineResult<EngineValue>;

    /// Error object with `name` and `message` properties.
    fn error(&self, name: &str, message: &str) -> EngineResult<EngineValue>;

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    fn kind(&self, value: EngineValue) -> EngineResult<ValueKind>;
    fn to_string(&self, value: EngineValue) -> EngineResult<String>;
    fn to_number(&self, value: EngineValue) -> EngineResult<f64>;
    fn to_boolean(&self, value: EngineValue) -> EngineResult<bool>;
    fn strict_equals(&self, a: EngineValue, b: EngineValue) -> EngineResult<bool>;
    fn loose_equals(&self, a: EngineValue, b: EngineValue) -> EngineResult<bool>;

    // ------------------------------------------------------------------
    // Properties
    // ------------------------------------------------------------------

    fn get(&self, object: EngineValue, key: &PropertyKey) -> EngineResult<EngineValue>;
    fn set(&self, object: EngineValue, key: &PropertyKey, value: EngineValue) -> EngineResult<()>;
    fn define(&self, object: EngineValue, key: &PropertyKey, descriptor: PropertyDescriptor) -> EngineResult<()>;
    fn delete(&self, object: EngineValue, key: &PropertyKey) -> EngineResult<bool>;

    /// Enumerable string-keyed own properties, in insertion order.
    fn own_keys(&self, object: EngineValue) -> EngineResult<Vec<String>>;
    fn array_length(&self, array: EngineValue) -> EngineResult<u32>;

    /// The prototype, or null.
    fn prototype(&self, object: EngineValue) -> EngineResult<EngineValue>;
    fn set_prototype(&self, object: EngineValue, prototype: EngineValue) -> EngineResult<()>;

    // ------------------------------------------------------------------
    // Invocation
    // ------------------------------------------------------------------

    fn call(&self, function: EngineValue, this: EngineValue, arguments: &[EngineValue]) -> EngineResult<EngineValue>;
    fn construct(&self, constructor: EngineValue, arguments: &[EngineValue]) -> EngineResult<EngineValue>;

    /// Evaluate source text. `url` tags diagnostics.
    fn evaluate(&self, source: &str, url: &str) -> EngineResult<EngineValue>;

    // ------------------------------------------------------------------
    // Rooting and collection
    // ------------------------------------------------------------------

    fn protect(&self, value: EngineValue) -> EngineResult<()>;
    fn unprotect(&self, value: EngineValue) -> EngineResult<()>;

    /// Full collection pass. Returns the number of handles released.
    fn garbage_collect(&self) -> EngineResult<usize>;

    fn global_object(&self) -> EngineResult<EngineValue>;

    // ------------------------------------------------------------------
    // Native attachment
    // ------------------------------------------------------------------

    fn set_associated(&self, object: EngineValue, data: Option<Rc<dyn Any>>) -> EngineResult<()>;
    fn associated(&self, object: EngineValue) -> EngineResult<Option<Rc<dyn Any>>>;
    fn set_attribute(&self, object: EngineValue, key: u64, data: Option<Rc<dyn Any>>) -> EngineResult<()>;
    fn attribute(&self, object: EngineValue, key: u64) -> EngineResult<Option<Rc<dyn Any>>>;
    fn set_context_attribute(&self, key: u64, data: Option<Rc<dyn Any>>) -> EngineResult<()>;
    fn context_attribute(&self, key: u64) -> EngineResult<Option<Rc<dyn Any>>>;
    fn set_finalizer(&self, object: EngineValue, handler: FinalizeHandler) -> EngineResult<()>;

    /// Exceptions escaping the outermost call, construct or evaluate are
    /// reported here before the `Err` is returned.
    fn set_exception_handler(&self, handler: Option<ExceptionHandler>) -> EngineResult<()>;

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Finalize every remaining native record and release all state.
    fn teardown(&self);
    fn is_destroyed(&self) -> bool;
}
