//! Engine value handles
//!
//! Values are small `Copy` handles. Primitives live inline; strings, symbols
//! and objects occupy a slot in the engine's handle table, referenced by a
//! generational index so that a handle to a released slot can never alias a
//! newer one.

use std::fmt;

/// Slot handle (generation-indexed for safety)
///
/// Format: [32-bit index | 32-bit generation]
/// - Index: Position in the handle table
/// - Generation: Incremented when the slot is released (prevents use-after-free)
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub(crate) struct CellId {
    index: u32,
    generation: u32,
}

impl CellId {
    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub(crate) fn index(&self) -> u32 {
        self.index
    }

    pub(crate) fn generation(&self) -> u32 {
        self.generation
    }

    /// Serialize to 64-bit integer
    pub(crate) fn to_bits(self) -> u64 {
        ((self.generation as u64) << 32) | (self.index as u64)
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub(crate) enum Repr {
    Undefined,
    Null,
    Boolean(bool),
    Number(f64),
    Cell(CellId),
}

/// Opaque reference to a value living in the engine.
///
/// Handles are not owned by native code: an unprotected handle stays valid
/// only while script still reaches its value (see [`crate::Engine::protect`]).
#[derive(Copy, Clone, PartialEq)]
pub struct EngineValue(pub(crate) Repr);

impl EngineValue {
    pub(crate) const UNDEFINED: EngineValue = EngineValue(Repr::Undefined);
    pub(crate) const NULL: EngineValue = EngineValue(Repr::Null);

    pub(crate) fn cell(id: CellId) -> Self {
        EngineValue(Repr::Cell(id))
    }

    pub(crate) fn as_cell(&self) -> Option<CellId> {
        match self.0 {
            Repr::Cell(id) => Some(id),
            _ => None,
        }
    }

    /// Identity bits of the handle slot. Two handles to the same script
    /// object may live in different slots; compare values with
    /// [`crate::Engine::strict_equals`].
    ///
    /// Primitives all report `0`.
    pub fn identity(&self) -> u64 {
        self.as_cell().map(CellId::to_bits).unwrap_or(0)
    }
}

impl fmt::Debug for EngineValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Repr::Undefined => write!(f, "EngineValue::Undefined"),
            Repr::Null => write!(f, "EngineValue::Null"),
            Repr::Boolean(b) => write!(f, "EngineValue::Boolean({})", b),
            Repr::Number(n) => write!(f, "EngineValue::Number({})", n),
            Repr::Cell(id) => write!(f, "EngineValue::Cell({}v{})", id.index(), id.generation()),
        }
    }
}

/// The kind of an engine value.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Undefined,
    Null,
    Boolean,
    Number,
    String,
    Symbol,
    Object,
    Array,
    Function,
}

impl ValueKind {
    /// Whether values of this kind live on the heap.
    pub fn is_heap(self) -> bool {
        matches!(
            self,
            ValueKind::String
                | ValueKind::Symbol
                | ValueKind::Object
                | ValueKind::Array
                | ValueKind::Function
        )
    }

    /// Whether values of this kind can carry properties.
    pub fn is_object(self) -> bool {
        matches!(self, ValueKind::Object | ValueKind::Array | ValueKind::Function)
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Undefined => "undefined",
            ValueKind::Null => "null",
            ValueKind::Boolean => "boolean",
            ValueKind::Number => "number",
            ValueKind::String => "string",
            ValueKind::Symbol => "symbol",
            ValueKind::Object => "object",
            ValueKind::Array => "array",
            ValueKind::Function => "function",
        };
        f.write_str(name)
    }
}
