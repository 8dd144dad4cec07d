//! Property value algebra
//!
//! A [`PropertyValue`] is an immutable tagged variant shared by reference.
//! Coercions to string, number and boolean are computed once and cached, as
//! is the engine form produced by [`PropertyValue::to_handle`].

use super::unit::{PropertyType, Unit};
use crate::context::Context;
use crate::error::{BridgeError, BridgeResult};
use crate::native::{Native, NativeClass};
use crate::value::ValueHandle;
use once_cell::unsync::OnceCell;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use trellis_engine::ValueKind;

/// Payload of a property value.
pub enum Variant {
    Null,
    String(String),
    Number { value: f64, unit: Unit },
    Boolean(bool),
    /// An engine value held as-is.
    Script(ValueHandle),
    /// `var(name, fallbacks...)` style reference.
    Variable { name: String, values: Vec<PropertyValue> },
    /// `name(arguments...)` style call.
    Function { name: String, arguments: Vec<PropertyValue> },
    /// Space separated list of values.
    Composite(Vec<PropertyValue>),
}

struct ValueData {
    variant: Variant,
    string: OnceCell<String>,
    number: OnceCell<f64>,
    boolean: OnceCell<bool>,
    handle: RefCell<Option<ValueHandle>>,
}

/// Shared, immutable property value. Clones share the same container, which
/// is what identity equality compares.
#[derive(Clone)]
pub struct PropertyValue(Rc<ValueData>);

impl PropertyValue {
    fn from_variant(variant: Variant) -> Self {
        Self(Rc::new(ValueData {
            variant,
            string: OnceCell::new(),
            number: OnceCell::new(),
            boolean: OnceCell::new(),
            handle: RefCell::new(None),
        }))
    }

    pub fn null() -> Self {
        Self::from_variant(Variant::Null)
    }

    pub fn from_string(value: impl Into<String>) -> Self {
        Self::from_variant(Variant::String(value.into()))
    }

    pub fn from_number(value: f64) -> Self {
        Self::number_with_unit(value, Unit::None)
    }

    pub fn number_with_unit(value: f64, unit: Unit) -> Self {
        Self::from_variant(Variant::Number { value, unit })
    }

    pub fn from_boolean(value: bool) -> Self {
        Self::from_variant(Variant::Boolean(value))
    }

    pub fn script(value: ValueHandle) -> Self {
        Self::from_variant(Variant::Script(value))
    }

    pub fn variable(name: impl Into<String>, values: Vec<PropertyValue>) -> Self {
        Self::from_variant(Variant::Variable {
            name: name.into(),
            values,
        })
    }

    pub fn function(name: impl Into<String>, arguments: Vec<PropertyValue>) -> Self {
        Self::from_variant(Variant::Function {
            name: name.into(),
            arguments,
        })
    }

    pub fn composite(values: Vec<PropertyValue>) -> Self {
        Self::from_variant(Variant::Composite(values))
    }

    pub fn variant(&self) -> &Variant {
        &self.0.variant
    }

    pub fn property_type(&self) -> PropertyType {
        match &self.0.variant {
            Variant::Null => PropertyType::Null,
            Variant::String(_) => PropertyType::String,
            Variant::Number { .. } => PropertyType::Number,
            Variant::Boolean(_) => PropertyType::Boolean,
            Variant::Variable { .. } => PropertyType::Variable,
            Variant::Function { .. } => PropertyType::Function,
            Variant::Composite(_) => PropertyType::Composite,
            Variant::Script(handle) => match handle.kind() {
                Ok(ValueKind::String) => PropertyType::String,
                Ok(ValueKind::Number) => PropertyType::Number,
                Ok(ValueKind::Boolean) => PropertyType::Boolean,
                Ok(ValueKind::Array) => PropertyType::Array,
                Ok(ValueKind::Function) => PropertyType::Callback,
                Ok(ValueKind::Object) | Ok(ValueKind::Symbol) => PropertyType::Object,
                Ok(ValueKind::Null) | Ok(ValueKind::Undefined) | Err(_) => PropertyType::Null,
            },
        }
    }

    pub fn unit(&self) -> Unit {
        match &self.0.variant {
            Variant::Number { unit, .. } => *unit,
            _ => Unit::None,
        }
    }

    pub fn is_null(&self) -> bool {
        self.property_type() == PropertyType::Null
    }

    pub fn is_string(&self) -> bool {
        self.property_type() == PropertyType::String
    }

    pub fn is_number(&self) -> bool {
        self.property_type() == PropertyType::Number
    }

    pub fn is_boolean(&self) -> bool {
        self.property_type() == PropertyType::Boolean
    }

    pub fn is_object(&self) -> bool {
        self.property_type() == PropertyType::Object
    }

    pub fn is_array(&self) -> bool {
        self.property_type() == PropertyType::Array
    }

    pub fn is_callback(&self) -> bool {
        self.property_type() == PropertyType::Callback
    }

    pub fn is_variable(&self) -> bool {
        matches!(self.0.variant, Variant::Variable { .. })
    }

    pub fn is_function(&self) -> bool {
        matches!(self.0.variant, Variant::Function { .. })
    }

    pub fn is_composite(&self) -> bool {
        matches!(self.0.variant, Variant::Composite(_))
    }

    /// Variable name and fallback values.
    pub fn variable_parts(&self) -> Option<(&str, &[PropertyValue])> {
        match &self.0.variant {
            Variant::Variable { name, values } => Some((name, values)),
            _ => None,
        }
    }

    /// Function name and arguments.
    pub fn function_parts(&self) -> Option<(&str, &[PropertyValue])> {
        match &self.0.variant {
            Variant::Function { name, arguments } => Some((name, arguments)),
            _ => None,
        }
    }

    pub fn composite_parts(&self) -> Option<&[PropertyValue]> {
        match &self.0.variant {
            Variant::Composite(values) => Some(values),
            _ => None,
        }
    }

    fn mismatch(&self, expected: &'static str) -> BridgeError {
        BridgeError::TypeMismatch {
            expected,
            found: self.property_type(),
        }
    }

    pub fn string(&self) -> BridgeResult<String> {
        self.0
            .string
            .get_or_try_init(|| match &self.0.variant {
                Variant::Null => Ok(String::new()),
                Variant::String(value) => Ok(value.clone()),
                Variant::Number { value, unit } => Ok(format!("{}{}", value, unit.suffix())),
                Variant::Boolean(value) => Ok(value.to_string()),
                Variant::Script(handle) => handle.string(),
                _ => Err(self.mismatch("string")),
            })
            .cloned()
    }

    pub fn number(&self) -> BridgeResult<f64> {
        self.0
            .number
            .get_or_try_init(|| match &self.0.variant {
                Variant::Null => Ok(0.0),
                Variant::String(value) => Ok(scan_number(value)),
                Variant::Number { value, .. } => Ok(*value),
                Variant::Boolean(value) => Ok(if *value { 1.0 } else { 0.0 }),
                Variant::Script(handle) => handle.number(),
                _ => Err(self.mismatch("number")),
            })
            .copied()
    }

    pub fn boolean(&self) -> BridgeResult<bool> {
        self.0
            .boolean
            .get_or_try_init(|| match &self.0.variant {
                Variant::Null => Ok(false),
                Variant::String(value) => Ok(!value.is_empty()),
                Variant::Number { value, .. } => Ok(*value > 0.0),
                Variant::Boolean(value) => Ok(*value),
                Variant::Script(handle) => handle.boolean(),
                _ => Err(self.mismatch("boolean")),
            })
            .copied()
    }

    pub fn equals_string(&self, value: &str) -> bool {
        self.is_string() && self.string().map(|s| s == value).unwrap_or(false)
    }

    pub fn equals_number(&self, value: f64) -> bool {
        self.is_number() && self.number().map(|n| n == value).unwrap_or(false)
    }

    pub fn equals_number_with_unit(&self, value: f64, unit: Unit) -> bool {
        self.is_number() && self.unit() == unit && self.number().map(|n| n == value).unwrap_or(false)
    }

    pub fn equals_boolean(&self, value: bool) -> bool {
        self.is_boolean() && self.boolean().map(|b| b == value).unwrap_or(false)
    }

    /// Loose engine equality against the held or materialized engine value.
    pub fn equals_script(&self, value: &ValueHandle) -> bool {
        self.script_value()
            .and_then(|held| held.equals(value).ok())
            .unwrap_or(false)
    }

    /// Type-gated equality. Primitives compare by coerced value, everything
    /// else by container identity.
    pub fn equals(&self, other: &PropertyValue) -> bool {
        match self.property_type() {
            PropertyType::Null => other.is_null(),
            PropertyType::String => self.string().map(|s| other.equals_string(&s)).unwrap_or(false),
            PropertyType::Number => self.number().map(|n| other.equals_number(n)).unwrap_or(false),
            PropertyType::Boolean => self.boolean().map(|b| other.equals_boolean(b)).unwrap_or(false),
            _ => self.same(other),
        }
    }

    /// Whether both values share the same container.
    pub fn same(&self, other: &PropertyValue) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// The engine value this property value holds or has materialized.
    pub fn script_value(&self) -> Option<ValueHandle> {
        match &self.0.variant {
            Variant::Script(handle) => Some(handle.clone()),
            _ => self.0.handle.borrow().clone(),
        }
    }

    pub fn cast<T: NativeClass>(&self) -> Option<Rc<Native<T>>> {
        self.script_value()?.cast::<T>()
    }

    /// Engine form of this value, computed on first request and cached.
    pub fn to_handle(&self, context: &Context) -> BridgeResult<ValueHandle> {
        if let Some(handle) = self.script_value() {
            return Ok(handle);
        }

        let handle = match &self.0.variant {
            Variant::Composite(values) => {
                let parts = values.iter().map(PropertyValue::string).collect::<BridgeResult<Vec<_>>>()?;
                context.string(parts.join(" ").trim())?
            }
            Variant::Number { unit, .. } if *unit != Unit::None => context.string(&self.string()?)?,
            Variant::Null => context.null()?,
            Variant::String(value) => context.string(value)?,
            Variant::Number { value, .. } => context.number(*value)?,
            Variant::Boolean(value) => context.boolean(*value)?,
            Variant::Script(handle) => handle.clone(),
            Variant::Variable { .. } | Variant::Function { .. } => context.undefined()?,
        };

        self.reset_handle(&handle);
        Ok(handle)
    }

    /// Replace the cached engine form.
    pub(crate) fn reset_handle(&self, handle: &ValueHandle) {
        if matches!(self.0.variant, Variant::Script(_)) {
            return;
        }
        let previous = self.0.handle.replace(Some(handle.clone()));
        drop(previous);
    }
}

impl fmt::Debug for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0.variant {
            Variant::Null => write!(f, "Null"),
            Variant::String(value) => write!(f, "String({:?})", value),
            Variant::Number { value, unit } => write!(f, "Number({}{})", value, unit),
            Variant::Boolean(value) => write!(f, "Boolean({})", value),
            Variant::Script(handle) => write!(f, "Script({:?})", handle),
            Variant::Variable { name, values } => write!(f, "Variable({}, {:?})", name, values),
            Variant::Function { name, arguments } => write!(f, "Function({}, {:?})", name, arguments),
            Variant::Composite(values) => write!(f, "Composite({:?})", values),
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::from_string(value)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::from_number(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::from_boolean(value)
    }
}

/// Permissive numeric prefix parse used for string to number coercion.
///
/// Scans leading digits, signs and dots. `limit` counts every character
/// visited, including the one that stopped the scan, so a scan that stops
/// on its first character (or a one character string) yields NaN.
pub(crate) fn scan_number(text: &str) -> f64 {
    if text.is_empty() {
        return 0.0;
    }

    let mut limit = 0;
    let mut prefix = String::new();
    for c in text.chars() {
        limit += 1;
        if !(c.is_numeric() || matches!(c, '+' | '-' | '.')) {
            break;
        }
        prefix.push(c);
    }

    if limit == 1 {
        return f64::NAN;
    }
    prefix.parse::<f64>().unwrap_or(f64::NAN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_number() {
        assert_eq!(scan_number("17px"), 17.0);
        assert_eq!(scan_number("-1abc"), -1.0);
        assert_eq!(scan_number(""), 0.0);
        assert_eq!(scan_number("12.5"), 12.5);
        assert!(scan_number("-").is_nan());
        assert!(scan_number("abc").is_nan());
        assert!(scan_number("5").is_nan());
        assert!(scan_number("--").is_nan());
    }

    #[test]
    fn test_coercions() {
        let value = PropertyValue::number_with_unit(10.0, Unit::Px);
        assert_eq!(value.string().unwrap(), "10px");
        assert_eq!(value.number().unwrap(), 10.0);
        assert!(value.boolean().unwrap());

        let negative = PropertyValue::from_number(-2.0);
        assert!(!negative.boolean().unwrap());

        let flag = PropertyValue::from_boolean(true);
        assert_eq!(flag.string().unwrap(), "true");
        assert_eq!(flag.number().unwrap(), 1.0);

        let text = PropertyValue::from_string("");
        assert!(!text.boolean().unwrap());
        assert_eq!(PropertyValue::from_string("50%").number().unwrap(), 50.0);
    }

    #[test]
    fn test_structured_values_refuse_coercion() {
        let composite = PropertyValue::composite(vec!["a".into(), "b".into()]);
        assert!(matches!(
            composite.string(),
            Err(BridgeError::TypeMismatch {
                found: PropertyType::Composite,
                ..
            })
        ));
        let variable = PropertyValue::variable("accent", vec![]);
        assert!(variable.number().is_err());
        let function = PropertyValue::function("rgb", vec![1.0.into(), 2.0.into(), 3.0.into()]);
        assert!(function.boolean().is_err());
        assert_eq!(function.function_parts().map(|(name, args)| (name, args.len())), Some(("rgb", 3)));
    }

    #[test]
    fn test_equality_is_type_gated() {
        assert!(PropertyValue::null().equals(&PropertyValue::null()));
        assert!(PropertyValue::from_string("a").equals(&PropertyValue::from_string("a")));
        assert!(!PropertyValue::from_string("1").equals(&PropertyValue::from_number(1.0)));
        assert!(PropertyValue::from_number(1.0).equals(&PropertyValue::number_with_unit(1.0, Unit::Px)));
        assert!(!PropertyValue::from_number(1.0).equals_number_with_unit(1.0, Unit::Px));
        assert!(!PropertyValue::from_boolean(false).equals(&PropertyValue::null()));
    }

    #[test]
    fn test_structured_values_compare_by_identity() {
        let a = PropertyValue::composite(vec!["x".into()]);
        let b = PropertyValue::composite(vec!["x".into()]);
        assert!(!a.equals(&b));
        assert!(a.equals(&a.clone()));
    }
}
