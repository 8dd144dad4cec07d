//! Style-like property values and the lockable cells that hold them.

mod cell;
mod lock;
mod unit;
mod value;

pub use cell::{ChangeHandler, Property, ValueParser};
pub use lock::LockToken;
pub use unit::{PropertyType, Unit};
pub use value::{PropertyValue, Variant};

/// Permissive numeric prefix parse used by string to number coercion.
pub fn parse_number(text: &str) -> f64 {
    value::scan_number(text)
}
