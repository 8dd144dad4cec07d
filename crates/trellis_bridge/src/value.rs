//! Native handles to engine values
//!
//! A [`ValueHandle`] references one engine value and keeps a protection count.
//! The engine root is taken when the count goes from 0 to 1 and released when
//! it returns to 0, so any number of nested protect/unprotect pairs cost one
//! engine root. Dropping a handle disposes it.

use crate::callback::{self, GetterCallback, SetterCallback};
use crate::context::{attribute_key, Context, ContextInner};
use crate::error::{BridgeError, BridgeResult};
use crate::native::{self, Native, NativeClass};
use crate::protect::ProtectionGuard;
use std::any::Any;
use std::cell::Cell;
use std::fmt;
use std::hash::Hash;
use std::rc::{Rc, Weak};
use trellis_engine::{EngineValue, PropertyDescriptor, PropertyKey, ValueKind};

/// A reference to an engine value owned by native code.
pub struct ValueHandle {
    context: Weak<ContextInner>,
    handle: Cell<Option<EngineValue>>,
    protection: Cell<u32>,
}

impl ValueHandle {
    /// Wrap `value`.
    ///
    /// With `bridge`, a native-backed object that carries a delegate behind the
    /// context's marker symbol is replaced by that delegate. With `protect`,
    /// the handle starts with one protection.
    pub fn create(context: &Context, value: EngineValue, bridge: bool, protect: bool) -> ValueHandle {
        let value = if bridge {
            native::unwrap_delegate(context, value).unwrap_or(value)
        } else {
            value
        };

        let handle = ValueHandle {
            context: context.downgrade(),
            handle: Cell::new(Some(value)),
            protection: Cell::new(0),
        };
        if protect {
            if let Err(error) = handle.protect() {
                tracing::warn!(%error, "new handle could not be protected");
            }
        }
        handle
    }

    /// The live context and raw value, or the disposal error.
    fn live(&self) -> BridgeResult<(Context, EngineValue)> {
        let Some(context) = Context::upgrade(&self.context) else {
            return Err(BridgeError::UseAfterDispose);
        };
        if context.is_disposed() {
            return Err(context.disposal_error());
        }
        match self.handle.get() {
            Some(value) => Ok((context, value)),
            None => Err(context.disposal_error()),
        }
    }

    pub(crate) fn raw(&self) -> Option<EngineValue> {
        self.handle.get()
    }

    /// The raw engine value, for hosts working directly at the engine ABI.
    pub fn engine_value(&self) -> BridgeResult<EngineValue> {
        self.live().map(|(_, value)| value)
    }

    pub fn context(&self) -> Option<Context> {
        Context::upgrade(&self.context).filter(|context| !context.is_disposed())
    }

    pub fn is_disposed(&self) -> bool {
        self.handle.get().is_none()
    }

    pub fn protection_count(&self) -> u32 {
        self.protection.get()
    }

    pub fn protect(&self) -> BridgeResult<()> {
        let (context, value) = self.live()?;
        let count = self.protection.get();
        if count == 0 {
            context.raw_engine().protect(value)?;
            tracing::trace!(value = ?value, "handle protected");
        }
        self.protection.set(count + 1);
        Ok(())
    }

    /// Release one protection. Extra calls and calls on a disposed handle do
    /// nothing.
    pub fn unprotect(&self) {
        let count = self.protection.get();
        let Some(value) = self.handle.get() else {
            return;
        };
        if count == 0 {
            return;
        }
        self.protection.set(count - 1);
        if count == 1 {
            self.release(value);
        }
    }

    fn release(&self, value: EngineValue) {
        let Some(context) = Context::upgrade(&self.context) else {
            return;
        };
        if context.is_disposed() {
            return;
        }
        if let Err(error) = context.raw_engine().unprotect(value) {
            tracing::trace!(%error, "unprotect on a dead value");
        } else {
            tracing::trace!(value = ?value, "handle unprotected");
        }
    }

    /// Drop every protection and clear the handle. Idempotent.
    pub fn dispose(&self) {
        let Some(value) = self.handle.take() else {
            return;
        };
        if self.protection.replace(0) > 0 {
            self.release(value);
        }
    }

    /// Protect for the lifetime of the returned guard.
    pub fn guard(&self) -> BridgeResult<ProtectionGuard<'_>> {
        ProtectionGuard::new(self)
    }

    fn wrap(context: &Context, value: EngineValue) -> ValueHandle {
        ValueHandle::create(context, value, false, true)
    }

    fn raw_of(other: &ValueHandle) -> BridgeResult<EngineValue> {
        other.engine_value()
    }

    pub fn kind(&self) -> BridgeResult<ValueKind> {
        let (context, value) = self.live()?;
        Ok(context.raw_engine().kind(value)?)
    }

    fn kind_is(&self, check: impl FnOnce(ValueKind) -> bool) -> bool {
        self.kind().map(check).unwrap_or(false)
    }

    pub fn is_undefined(&self) -> bool {
        self.kind_is(|kind| kind == ValueKind::Undefined)
    }

    pub fn is_null(&self) -> bool {
        self.kind_is(|kind| kind == ValueKind::Null)
    }

    pub fn is_boolean(&self) -> bool {
        self.kind_is(|kind| kind == ValueKind::Boolean)
    }

    pub fn is_number(&self) -> bool {
        self.kind_is(|kind| kind == ValueKind::Number)
    }

    pub fn is_string(&self) -> bool {
        self.kind_is(|kind| kind == ValueKind::String)
    }

    pub fn is_symbol(&self) -> bool {
        self.kind_is(|kind| kind == ValueKind::Symbol)
    }

    /// Objects, arrays and functions.
    pub fn is_object(&self) -> bool {
        self.kind_is(ValueKind::is_object)
    }

    pub fn is_array(&self) -> bool {
        self.kind_is(|kind| kind == ValueKind::Array)
    }

    pub fn is_function(&self) -> bool {
        self.kind_is(|kind| kind == ValueKind::Function)
    }

    pub fn string(&self) -> BridgeResult<String> {
        let (context, value) = self.live()?;
        Ok(context.raw_engine().to_string(value)?)
    }

    pub fn number(&self) -> BridgeResult<f64> {
        let (context, value) = self.live()?;
        Ok(context.raw_engine().to_number(value)?)
    }

    pub fn boolean(&self) -> BridgeResult<bool> {
        let (context, value) = self.live()?;
        Ok(context.raw_engine().to_boolean(value)?)
    }

    fn get(&self, key: PropertyKey) -> BridgeResult<ValueHandle> {
        let (context, value) = self.live()?;
        let result = context.raw_engine().get(value, &key)?;
        Ok(Self::wrap(&context, result))
    }

    fn put(&self, key: PropertyKey, other: &ValueHandle) -> BridgeResult<()> {
        let (context, value) = self.live()?;
        let other = Self::raw_of(other)?;
        Ok(context.raw_engine().set(value, &key, other)?)
    }

    pub fn property(&self, name: &str) -> BridgeResult<ValueHandle> {
        self.get(PropertyKey::from(name))
    }

    pub fn set_property(&self, name: &str, value: &ValueHandle) -> BridgeResult<()> {
        self.put(PropertyKey::from(name), value)
    }

    pub fn property_at(&self, index: u32) -> BridgeResult<ValueHandle> {
        self.get(PropertyKey::Index(index))
    }

    pub fn set_property_at(&self, index: u32, value: &ValueHandle) -> BridgeResult<()> {
        self.put(PropertyKey::Index(index), value)
    }

    pub fn property_symbol(&self, symbol: &ValueHandle) -> BridgeResult<ValueHandle> {
        self.get(PropertyKey::Symbol(Self::raw_of(symbol)?))
    }

    pub fn set_property_symbol(&self, symbol: &ValueHandle, value: &ValueHandle) -> BridgeResult<()> {
        self.put(PropertyKey::Symbol(Self::raw_of(symbol)?), value)
    }

    fn define(&self, name: &str, descriptor: PropertyDescriptor) -> BridgeResult<()> {
        let (context, value) = self.live()?;
        Ok(context.raw_engine().define(value, &PropertyKey::from(name), descriptor)?)
    }

    /// Define an accessor whose getter and setter are native closures.
    pub fn define_property<G, S>(&self, name: &str, getter: G, setter: S) -> BridgeResult<()>
    where
        G: Fn(&mut GetterCallback<'_>) -> BridgeResult<()> + 'static,
        S: Fn(&mut SetterCallback<'_>) -> BridgeResult<()> + 'static,
    {
        let (context, _) = self.live()?;
        let getter = callback::getter_function(&context, name, getter)?;
        let setter = callback::setter_function(&context, name, setter)?;
        self.define(
            name,
            PropertyDescriptor::accessor(Some(Self::raw_of(&getter)?), Some(Self::raw_of(&setter)?)),
        )
    }

    /// Define a read-only accessor.
    pub fn define_getter<G>(&self, name: &str, getter: G) -> BridgeResult<()>
    where
        G: Fn(&mut GetterCallback<'_>) -> BridgeResult<()> + 'static,
    {
        let (context, _) = self.live()?;
        let getter = callback::getter_function(&context, name, getter)?;
        self.define(name, PropertyDescriptor::accessor(Some(Self::raw_of(&getter)?), None))
    }

    /// Define an accessor from existing functions. A missing half keeps what
    /// the property already had.
    pub fn define_accessor(
        &self,
        name: &str,
        getter: Option<&ValueHandle>,
        setter: Option<&ValueHandle>,
    ) -> BridgeResult<()> {
        let getter = getter.map(Self::raw_of).transpose()?;
        let setter = setter.map(Self::raw_of).transpose()?;
        self.define(name, PropertyDescriptor::accessor(getter, setter))
    }

    /// Non-writable, non-enumerable, non-configurable data property.
    pub fn define_constant(&self, name: &str, value: &ValueHandle) -> BridgeResult<()> {
        self.define(name, PropertyDescriptor::constant(Self::raw_of(value)?))
    }

    /// Writable but non-enumerable data property.
    pub fn define_hidden(&self, name: &str, value: &ValueHandle) -> BridgeResult<()> {
        self.define(
            name,
            PropertyDescriptor::Data {
                value: Self::raw_of(value)?,
                writable: true,
                enumerable: false,
                configurable: true,
            },
        )
    }

    pub fn delete_property(&self, name: &str) -> BridgeResult<bool> {
        let (context, value) = self.live()?;
        Ok(context.raw_engine().delete(value, &PropertyKey::from(name))?)
    }

    fn raw_arguments(arguments: &[&ValueHandle]) -> BridgeResult<Vec<EngineValue>> {
        arguments.iter().map(|argument| Self::raw_of(argument)).collect()
    }

    /// Call with an undefined receiver.
    pub fn call(&self, arguments: &[&ValueHandle]) -> BridgeResult<ValueHandle> {
        let (context, value) = self.live()?;
        let this = context.raw_engine().undefined();
        let arguments = Self::raw_arguments(arguments)?;
        let result = context.raw_engine().call(value, this, &arguments)?;
        Ok(Self::wrap(&context, result))
    }

    pub fn call_with(&self, this: &ValueHandle, arguments: &[&ValueHandle]) -> BridgeResult<ValueHandle> {
        let (context, value) = self.live()?;
        let this = Self::raw_of(this)?;
        let arguments = Self::raw_arguments(arguments)?;
        let result = context.raw_engine().call(value, this, &arguments)?;
        Ok(Self::wrap(&context, result))
    }

    /// Look up `name` and call it with this value as the receiver.
    pub fn call_method(&self, name: &str, arguments: &[&ValueHandle]) -> BridgeResult<ValueHandle> {
        let method = self.property(name)?;
        method.call_with(self, arguments)
    }

    pub fn construct(&self, arguments: &[&ValueHandle]) -> BridgeResult<ValueHandle> {
        let (context, value) = self.live()?;
        let arguments = Self::raw_arguments(arguments)?;
        let result = context.raw_engine().construct(value, &arguments)?;
        Ok(Self::wrap(&context, result))
    }

    /// Visit array elements in order.
    pub fn for_each(&self, mut f: impl FnMut(u32, &ValueHandle)) -> BridgeResult<()> {
        let (context, value) = self.live()?;
        let length = context.raw_engine().array_length(value)?;
        for index in 0..length {
            let element = self.property_at(index)?;
            f(index, &element);
        }
        Ok(())
    }

    /// Visit enumerable own properties in insertion order.
    pub fn for_own(&self, mut f: impl FnMut(&str, &ValueHandle)) -> BridgeResult<()> {
        let (context, value) = self.live()?;
        let keys = context.raw_engine().own_keys(value)?;
        for key in keys {
            let element = self.property(&key)?;
            f(&key, &element);
        }
        Ok(())
    }

    pub fn prototype(&self) -> BridgeResult<ValueHandle> {
        let (context, value) = self.live()?;
        let prototype = context.raw_engine().prototype(value)?;
        Ok(Self::wrap(&context, prototype))
    }

    pub fn set_prototype(&self, prototype: &ValueHandle) -> BridgeResult<()> {
        let (context, value) = self.live()?;
        let prototype = Self::raw_of(prototype)?;
        Ok(context.raw_engine().set_prototype(value, prototype)?)
    }

    /// Loose engine equality.
    pub fn equals(&self, other: &ValueHandle) -> BridgeResult<bool> {
        let (context, value) = self.live()?;
        Ok(context.raw_engine().loose_equals(value, Self::raw_of(other)?)?)
    }

    pub fn strict_equals(&self, other: &ValueHandle) -> BridgeResult<bool> {
        let (context, value) = self.live()?;
        Ok(context.raw_engine().strict_equals(value, Self::raw_of(other)?)?)
    }

    pub fn equals_string(&self, text: &str) -> bool {
        self.is_string() && self.string().map(|s| s == text).unwrap_or(false)
    }

    pub fn equals_number(&self, number: f64) -> bool {
        self.is_number() && self.number().map(|n| n == number).unwrap_or(false)
    }

    pub fn equals_boolean(&self, flag: bool) -> bool {
        self.is_boolean() && self.boolean().map(|b| b == flag).unwrap_or(false)
    }

    /// The native instance of type `T` attached to this object, if any.
    pub fn cast<T: NativeClass>(&self) -> Option<Rc<Native<T>>> {
        let (context, value) = self.live().ok()?;
        native::resolve::<T>(&context, value).ok().flatten()
    }

    pub fn set_attribute<K: Hash + ?Sized>(&self, key: &K, data: Option<Rc<dyn Any>>) -> BridgeResult<()> {
        let (context, value) = self.live()?;
        Ok(context.raw_engine().set_attribute(value, attribute_key(key), data)?)
    }

    pub fn attribute<T: Any, K: Hash + ?Sized>(&self, key: &K) -> Option<Rc<T>> {
        let (context, value) = self.live().ok()?;
        let data = context.raw_engine().attribute(value, attribute_key(key)).ok()??;
        data.downcast::<T>().ok()
    }
}

impl Clone for ValueHandle {
    /// A new handle to the same value with its own protection.
    fn clone(&self) -> Self {
        let clone = ValueHandle {
            context: self.context.clone(),
            handle: Cell::new(self.handle.get()),
            protection: Cell::new(0),
        };
        if clone.handle.get().is_some() && clone.protect().is_err() {
            clone.handle.set(None);
        }
        clone
    }
}

impl Drop for ValueHandle {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for ValueHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueHandle")
            .field("value", &self.handle.get())
            .field("protection", &self.protection.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::BridgeSettings;
    use trellis_engine::QuickJsEngine;

    fn setup() -> (Rc<QuickJsEngine>, Context) {
        let engine = QuickJsEngine::new().unwrap();
        let settings = BridgeSettings {
            strict_disposal: false,
            ..Default::default()
        };
        let context = Context::with_engine(engine.clone(), settings).unwrap();
        (engine, context)
    }

    #[test]
    fn test_protection_is_counted() {
        let (engine, context) = setup();
        let object = context.object().unwrap();
        let raw = object.engine_value().unwrap();
        assert_eq!(object.protection_count(), 1);
        assert_eq!(engine.root_count(raw).unwrap(), 1);

        object.protect().unwrap();
        object.protect().unwrap();
        assert_eq!(object.protection_count(), 3);
        assert_eq!(engine.root_count(raw).unwrap(), 1);

        object.unprotect();
        object.unprotect();
        object.unprotect();
        object.unprotect();
        assert_eq!(object.protection_count(), 0);
        assert_eq!(engine.root_count(raw).unwrap(), 0);
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let (engine, context) = setup();
        let object = context.object().unwrap();
        let raw = object.engine_value().unwrap();
        object.protect().unwrap();
        object.dispose();
        object.dispose();
        object.unprotect();
        assert!(object.is_disposed());
        assert_eq!(engine.root_count(raw).unwrap(), 0);
        assert!(matches!(object.string(), Err(BridgeError::UseAfterDispose)));
    }

    #[test]
    fn test_clone_has_own_protection() {
        let (engine, context) = setup();
        let object = context.object().unwrap();
        let raw = object.engine_value().unwrap();
        let other = object.clone();
        assert_eq!(engine.root_count(raw).unwrap(), 2);
        drop(object);
        assert_eq!(engine.root_count(raw).unwrap(), 1);
        assert_eq!(other.protection_count(), 1);
    }

    #[test]
    fn test_properties_and_enumeration() {
        let (_engine, context) = setup();
        let object = context.object().unwrap();
        object.set_property("a", &context.number(1.0).unwrap()).unwrap();
        object.set_property("b", &context.string("two").unwrap()).unwrap();
        object.define_hidden("c", &context.boolean(true).unwrap()).unwrap();

        let mut seen = Vec::new();
        object.for_own(|key, value| seen.push((key.to_string(), value.string().unwrap()))).unwrap();
        assert_eq!(seen, vec![("a".to_string(), "1".to_string()), ("b".to_string(), "two".to_string())]);
        assert!(object.property("c").unwrap().equals_boolean(true));
        assert!(object.delete_property("a").unwrap());
        assert!(object.property("a").unwrap().is_undefined());
    }

    #[test]
    fn test_arrays() {
        let (_engine, context) = setup();
        let array = context.array().unwrap();
        array.set_property_at(0, &context.number(3.0).unwrap()).unwrap();
        array.set_property_at(1, &context.number(4.0).unwrap()).unwrap();
        let mut sum = 0.0;
        array.for_each(|_, value| sum += value.number().unwrap()).unwrap();
        assert_eq!(sum, 7.0);
        assert!(array.property("length").unwrap().equals_number(2.0));
    }

    #[test]
    fn test_accessor_and_method() {
        let (_engine, context) = setup();
        let object = context.object().unwrap();
        object
            .define_property("size", |cb| cb.returns_number(42.0), |cb| {
                let value = cb.value().number()?;
                assert_eq!(value, 7.0);
                Ok(())
            })
            .unwrap();
        assert!(object.property("size").unwrap().equals_number(42.0));
        object.set_property("size", &context.number(7.0).unwrap()).unwrap();

        let double = context
            .function(Some("double"), |cb| {
                let value = cb.argument(0).number()?;
                cb.returns_number(value * 2.0)
            })
            .unwrap();
        object.set_property("double", &double).unwrap();
        let result = object.call_method("double", &[&context.number(21.0).unwrap()]).unwrap();
        assert!(result.equals_number(42.0));
    }

    #[test]
    fn test_equality_helpers() {
        let (_engine, context) = setup();
        let one = context.number(1.0).unwrap();
        let text = context.string("1").unwrap();
        assert!(one.equals(&text).unwrap());
        assert!(!one.strict_equals(&text).unwrap());
        assert!(!text.equals_number(1.0));
        assert!(text.equals_string("1"));
    }

    #[test]
    fn test_object_attributes() {
        let (_engine, context) = setup();
        let object = context.object().unwrap();
        object.set_attribute("layout", Some(Rc::new(5u32))).unwrap();
        assert_eq!(object.attribute::<u32, _>("layout").as_deref(), Some(&5));
        object.set_attribute("layout", None).unwrap();
        assert!(object.attribute::<u32, _>("layout").is_none());
    }
}
