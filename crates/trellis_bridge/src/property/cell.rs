use super::lock::{is_locked, LockToken};
use super::unit::{PropertyType, Unit};
use super::value::PropertyValue;
use crate::context::Context;
use crate::error::BridgeResult;
use crate::native::{Native, NativeClass};
use crate::value::ValueHandle;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use trellis_engine::ValueKind;

/// Called after a reset changed the current value.
pub type ChangeHandler = Rc<dyn Fn(&Property)>;

/// Parses stylesheet-like text into a property value.
pub trait ValueParser {
    /// `None` leaves the property untouched.
    fn parse(&self, text: &str) -> Option<PropertyValue>;
}

struct PropertyState {
    initial: PropertyValue,
    current: PropertyValue,
    lock: Option<LockToken>,
}

/// A mutable property cell holding an initial and a current value.
///
/// Every reset carries an optional [`LockToken`]. Once a property is written
/// under a token, writes under any other token (including none) are
/// rejected until the holder writes again with a different lock. The change
/// handler runs only when the current value actually changed, and never
/// while the cell is borrowed, so handlers may read the property back.
pub struct Property {
    state: RefCell<PropertyState>,
    handler: Option<ChangeHandler>,
}

impl Property {
    fn with_initial(initial: PropertyValue) -> Self {
        Self {
            state: RefCell::new(PropertyState {
                current: initial.clone(),
                initial,
                lock: None,
            }),
            handler: None,
        }
    }

    pub fn new() -> Self {
        Self::with_initial(PropertyValue::null())
    }

    pub fn with_string(value: impl Into<String>) -> Self {
        Self::with_initial(PropertyValue::from_string(value))
    }

    pub fn with_number(value: f64) -> Self {
        Self::with_initial(PropertyValue::from_number(value))
    }

    pub fn with_number_unit(value: f64, unit: Unit) -> Self {
        Self::with_initial(PropertyValue::number_with_unit(value, unit))
    }

    pub fn with_boolean(value: bool) -> Self {
        Self::with_initial(PropertyValue::from_boolean(value))
    }

    pub fn with_value(value: PropertyValue) -> Self {
        Self::with_initial(value)
    }

    /// Start out locked by `lock`.
    pub fn locked(self, lock: LockToken) -> Self {
        self.state.borrow_mut().lock = Some(lock);
        self
    }

    pub fn on_change(mut self, handler: impl Fn(&Property) + 'static) -> Self {
        self.handler = Some(Rc::new(handler));
        self
    }

    pub fn value(&self) -> PropertyValue {
        self.state.borrow().current.clone()
    }

    pub fn initial(&self) -> PropertyValue {
        self.state.borrow().initial.clone()
    }

    pub fn lock(&self) -> Option<LockToken> {
        self.state.borrow().lock
    }

    pub fn property_type(&self) -> PropertyType {
        self.value().property_type()
    }

    pub fn unit(&self) -> Unit {
        self.value().unit()
    }

    pub fn string(&self) -> BridgeResult<String> {
        self.value().string()
    }

    pub fn number(&self) -> BridgeResult<f64> {
        self.value().number()
    }

    pub fn boolean(&self) -> BridgeResult<bool> {
        self.value().boolean()
    }

    pub fn is_null(&self) -> bool {
        self.value().is_null()
    }

    /// The current value when it is a variable reference.
    pub fn variable(&self) -> Option<PropertyValue> {
        Some(self.value()).filter(PropertyValue::is_variable)
    }

    pub fn function(&self) -> Option<PropertyValue> {
        Some(self.value()).filter(PropertyValue::is_function)
    }

    pub fn composite(&self) -> Option<PropertyValue> {
        Some(self.value()).filter(PropertyValue::is_composite)
    }

    pub fn script_value(&self) -> Option<ValueHandle> {
        self.value().script_value()
    }

    pub fn cast<T: NativeClass>(&self) -> Option<Rc<Native<T>>> {
        self.value().cast::<T>()
    }

    pub fn equals(&self, value: &PropertyValue) -> bool {
        self.value().equals(value)
    }

    pub fn to_handle(&self, context: &Context) -> BridgeResult<ValueHandle> {
        self.value().to_handle(context)
    }

    /// Check the lock and take it for `lock`. Returns false when rejected.
    fn acquire(&self, lock: Option<LockToken>) -> bool {
        let mut state = self.state.borrow_mut();
        if is_locked(state.lock, lock) {
            tracing::trace!(
                held = ?state.lock.map(|l| l.id()),
                key = ?lock.map(|l| l.id()),
                "property write rejected"
            );
            return false;
        }
        state.lock = lock;
        true
    }

    /// Shared reset path. `next` sees the current and initial values and
    /// returns the replacement, or `None` when nothing changes.
    fn write<F>(&self, lock: Option<LockToken>, next: F) -> bool
    where
        F: FnOnce(&PropertyValue, &PropertyValue) -> Option<PropertyValue>,
    {
        if !self.acquire(lock) {
            return false;
        }

        let (current, initial) = {
            let state = self.state.borrow();
            (state.current.clone(), state.initial.clone())
        };
        let Some(value) = next(&current, &initial) else {
            return false;
        };

        let previous = std::mem::replace(&mut self.state.borrow_mut().current, value);
        drop(previous);

        if let Some(handler) = self.handler.clone() {
            handler(self);
        }
        true
    }

    /// Reset to null.
    pub fn reset_null(&self, lock: Option<LockToken>) -> bool {
        self.write(lock, |current, _| {
            if current.is_null() {
                None
            } else {
                Some(PropertyValue::null())
            }
        })
    }

    /// Reset to the initial value.
    pub fn reset_initial(&self, lock: Option<LockToken>) -> bool {
        self.write(lock, |current, initial| {
            if current.equals(initial) {
                None
            } else {
                Some(initial.clone())
            }
        })
    }

    pub fn reset_string(&self, value: &str, lock: Option<LockToken>) -> bool {
        self.write(lock, |current, _| {
            if current.equals_string(value) {
                None
            } else {
                Some(PropertyValue::from_string(value))
            }
        })
    }

    pub fn reset_number(&self, value: f64, lock: Option<LockToken>) -> bool {
        self.write(lock, |current, _| {
            if current.equals_number(value) {
                None
            } else {
                Some(PropertyValue::from_number(value))
            }
        })
    }

    pub fn reset_number_with_unit(&self, value: f64, unit: Unit, lock: Option<LockToken>) -> bool {
        self.write(lock, |current, _| {
            if current.equals_number_with_unit(value, unit) {
                None
            } else {
                Some(PropertyValue::number_with_unit(value, unit))
            }
        })
    }

    pub fn reset_boolean(&self, value: bool, lock: Option<LockToken>) -> bool {
        self.write(lock, |current, _| {
            if current.equals_boolean(value) {
                None
            } else {
                Some(PropertyValue::from_boolean(value))
            }
        })
    }

    /// Reset to a shared value. An equal current value is kept.
    pub fn reset_value(&self, value: PropertyValue, lock: Option<LockToken>) -> bool {
        self.write(lock, |current, _| {
            if current.equals(&value) {
                None
            } else {
                Some(value)
            }
        })
    }

    /// Reset to another property's current value. Both end up sharing it.
    pub fn reset_property(&self, other: &Property, lock: Option<LockToken>) -> bool {
        let value = other.value();
        self.reset_value(value, lock)
    }

    /// Parse `text` and reset to the result.
    pub fn reset_parsed(&self, text: &str, parser: &dyn ValueParser, lock: Option<LockToken>) -> bool {
        if !self.acquire(lock) {
            return false;
        }
        match parser.parse(text) {
            Some(value) => self.reset_value(value, lock),
            None => false,
        }
    }

    /// Reset from an engine value.
    ///
    /// Primitives go through the matching typed reset. Anything else is
    /// held as a script value unless it is loosely equal to what the
    /// property already holds. In every accepted case the incoming engine
    /// value becomes the cached engine form of the resulting current value.
    pub fn reset_script(&self, value: &ValueHandle, lock: Option<LockToken>) -> BridgeResult<bool> {
        self.reset_script_with(value, None, lock)
    }

    /// Like [`Property::reset_script`], but strings are run through `parser`.
    pub fn reset_script_parsed(
        &self,
        value: &ValueHandle,
        parser: &dyn ValueParser,
        lock: Option<LockToken>,
    ) -> BridgeResult<bool> {
        self.reset_script_with(value, Some(parser), lock)
    }

    fn reset_script_with(
        &self,
        value: &ValueHandle,
        parser: Option<&dyn ValueParser>,
        lock: Option<LockToken>,
    ) -> BridgeResult<bool> {
        if !self.acquire(lock) {
            return Ok(false);
        }

        let changed = match value.kind()? {
            ValueKind::Null | ValueKind::Undefined => self.reset_null(lock),
            ValueKind::String => {
                let text = value.string()?;
                match parser {
                    Some(parser) => self.reset_parsed(&text, parser, lock),
                    None => self.reset_string(&text, lock),
                }
            }
            ValueKind::Number => self.reset_number(value.number()?, lock),
            ValueKind::Boolean => self.reset_boolean(value.boolean()?, lock),
            _ => self.write(lock, |current, _| {
                if current.equals_script(value) {
                    None
                } else {
                    Some(PropertyValue::script(value.clone()))
                }
            }),
        };

        self.value().reset_handle(value);
        Ok(changed)
    }
}

impl Default for Property {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("Property")
            .field("initial", &state.initial)
            .field("current", &state.current)
            .field("lock", &state.lock)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn counted(property: Property) -> (Property, Rc<Cell<u32>>) {
        let count = Rc::new(Cell::new(0));
        let seen = count.clone();
        (property.on_change(move |_| seen.set(seen.get() + 1)), count)
    }

    #[test]
    fn test_change_fires_only_on_change() {
        let (property, count) = counted(Property::with_string("a"));
        assert!(!property.reset_string("a", None));
        assert_eq!(count.get(), 0);
        assert!(property.reset_string("b", None));
        assert_eq!(count.get(), 1);
        assert_eq!(property.string().unwrap(), "b");
        assert!(property.reset_initial(None));
        assert_eq!(property.string().unwrap(), "a");
        assert_eq!(count.get(), 2);
    }

    #[test]
    fn test_lock_rejects_other_writers() {
        let (property, count) = counted(Property::with_number(1.0));
        let a = LockToken::new();
        let b = LockToken::new();

        assert!(property.reset_number(2.0, Some(a)));
        assert!(!property.reset_number(3.0, Some(b)));
        assert!(!property.reset_number(3.0, None));
        assert_eq!(property.number().unwrap(), 2.0);
        assert_eq!(count.get(), 1);

        assert!(property.reset_number(4.0, Some(a)));
        assert_eq!(property.number().unwrap(), 4.0);
    }

    #[test]
    fn test_write_without_key_clears_unlocked_state() {
        let property = Property::with_boolean(false);
        assert!(property.reset_boolean(true, None));
        assert_eq!(property.lock(), None);
        let a = LockToken::new();
        assert!(property.reset_boolean(false, Some(a)));
        assert_eq!(property.lock(), Some(a));
    }

    #[test]
    fn test_initially_locked() {
        let a = LockToken::new();
        let property = Property::with_string("x").locked(a);
        assert!(!property.reset_string("y", None));
        assert!(property.reset_string("y", Some(a)));
    }

    #[test]
    fn test_unit_change_is_a_change() {
        let (property, count) = counted(Property::with_number_unit(10.0, Unit::Px));
        assert!(!property.reset_number_with_unit(10.0, Unit::Px, None));
        assert!(property.reset_number_with_unit(10.0, Unit::Pc, None));
        assert_eq!(property.string().unwrap(), "10%");
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn test_reset_null() {
        let (property, count) = counted(Property::with_string("x"));
        assert!(property.reset_null(None));
        assert!(!property.reset_null(None));
        assert!(property.is_null());
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn test_reset_property_shares_value() {
        let source = Property::with_value(PropertyValue::composite(vec!["a".into()]));
        let target = Property::new();
        assert!(target.reset_property(&source, None));
        assert!(target.value().same(&source.value()));
        assert!(!target.reset_property(&source, None));
    }

    #[test]
    fn test_handler_can_read_back() {
        let observed = Rc::new(RefCell::new(String::new()));
        let sink = observed.clone();
        let property = Property::new().on_change(move |p| {
            *sink.borrow_mut() = p.string().unwrap_or_default();
        });
        property.reset_string("hello", None);
        assert_eq!(*observed.borrow(), "hello");
    }

    struct Upper;

    impl ValueParser for Upper {
        fn parse(&self, text: &str) -> Option<PropertyValue> {
            if text.is_empty() {
                None
            } else {
                Some(PropertyValue::from_string(text.to_uppercase()))
            }
        }
    }

    #[test]
    fn test_reset_parsed() {
        let property = Property::new();
        assert!(property.reset_parsed("abc", &Upper, None));
        assert_eq!(property.string().unwrap(), "ABC");
        assert!(!property.reset_parsed("", &Upper, None));
    }
}
