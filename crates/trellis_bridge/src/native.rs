//! Native instances behind engine objects
//!
//! A [`Native<T>`] pairs the state of a native class with an [`ObjectHolder`]
//! for the engine object it backs. The instance is stored as the object's
//! associated data and torn down by the object's finalizer.
//!
//! When a delegate object is supplied at construction, the backing object
//! and the delegate link to each other through the context's marker symbol,
//! and every value operation made through the holder goes to the delegate.

use crate::class::ClassSchema;
use crate::context::Context;
use crate::error::BridgeResult;
use crate::value::ValueHandle;
use once_cell::unsync::OnceCell;
use std::any::Any;
use std::cell::{Cell, Ref, RefCell, RefMut};
use std::ops::Deref;
use std::rc::Rc;
use trellis_engine::{Engine, EngineValue, PropertyDescriptor, PropertyKey};

/// A native type exposed to scripts.
pub trait NativeClass: Sized + 'static {
    /// Build the native state for a new engine object.
    fn new(context: &Context) -> Self;

    /// Declare the members scripts can reach.
    fn describe(schema: &mut ClassSchema<Self>);

    /// Runs once when the backing object is finalized or the instance is
    /// disposed.
    fn dispose(&mut self) {}
}

/// Own handle plus optional delegate. Value operations go to the delegate
/// when one is set, otherwise to the own handle.
pub struct ObjectHolder {
    handle: ValueHandle,
    delegate: OnceCell<ValueHandle>,
}

impl ObjectHolder {
    fn new(handle: ValueHandle) -> Self {
        Self {
            handle,
            delegate: OnceCell::new(),
        }
    }

    /// The backing object itself.
    pub fn handle(&self) -> &ValueHandle {
        &self.handle
    }

    pub fn delegate(&self) -> Option<&ValueHandle> {
        self.delegate.get()
    }

    /// Where value operations go.
    pub fn value(&self) -> &ValueHandle {
        self.delegate.get().unwrap_or(&self.handle)
    }

    pub fn property(&self, name: &str) -> BridgeResult<ValueHandle> {
        self.value().property(name)
    }

    pub fn set_property(&self, name: &str, value: &ValueHandle) -> BridgeResult<()> {
        self.value().set_property(name, value)
    }

    pub fn property_at(&self, index: u32) -> BridgeResult<ValueHandle> {
        self.value().property_at(index)
    }

    pub fn set_property_at(&self, index: u32, value: &ValueHandle) -> BridgeResult<()> {
        self.value().set_property_at(index, value)
    }

    pub fn call(&self, arguments: &[&ValueHandle]) -> BridgeResult<ValueHandle> {
        self.value().call(arguments)
    }

    pub fn call_method(&self, name: &str, arguments: &[&ValueHandle]) -> BridgeResult<ValueHandle> {
        self.value().call_method(name, arguments)
    }

    pub fn construct(&self, arguments: &[&ValueHandle]) -> BridgeResult<ValueHandle> {
        self.value().construct(arguments)
    }

    pub fn for_each(&self, f: impl FnMut(u32, &ValueHandle)) -> BridgeResult<()> {
        self.value().for_each(f)
    }

    pub fn for_own(&self, f: impl FnMut(&str, &ValueHandle)) -> BridgeResult<()> {
        self.value().for_own(f)
    }

    pub fn prototype(&self) -> BridgeResult<ValueHandle> {
        self.value().prototype()
    }

    pub fn set_prototype(&self, prototype: &ValueHandle) -> BridgeResult<()> {
        self.value().set_prototype(prototype)
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

    pub fn equals(&self, other: &ValueHandle) -> BridgeResult<bool> {
        self.value().equals(other)
    }

    /// Protect the backing object and its delegate.
    pub fn protect(&self) -> BridgeResult<()> {
        self.handle.protect()?;
        if let Some(delegate) = self.delegate.get() {
            delegate.protect()?;
        }
        Ok(())
    }

    pub fn unprotect(&self) {
        self.handle.unprotect();
        if let Some(delegate) = self.delegate.get() {
            delegate.unprotect();
        }
    }

    pub fn dispose(&self) {
        self.handle.dispose();
        if let Some(delegate) = self.delegate.get() {
            delegate.dispose();
        }
    }
}

/// Native state of type `T` backing one engine object.
pub struct Native<T: NativeClass> {
    holder: ObjectHolder,
    state: RefCell<T>,
    disposed: Cell<bool>,
}

impl<T: NativeClass> Native<T> {
    /// Create the native state for `object` and attach it.
    ///
    /// `delegate` is only honored when it is an object. The instance holds
    /// both handles unprotected, so the engine may still collect the object,
    /// which disposes the instance.
    pub(crate) fn attach(context: &Context, object: EngineValue, delegate: Option<EngineValue>) -> BridgeResult<Rc<Self>> {
        let engine = context.engine_ref()?;
        let state = T::new(context);
        let native = Rc::new(Native {
            holder: ObjectHolder::new(ValueHandle::create(context, object, false, false)),
            state: RefCell::new(state),
            disposed: Cell::new(false),
        });

        let delegate = match delegate {
            Some(delegate) if engine.kind(delegate)?.is_object() => Some(delegate),
            _ => None,
        };
        if let Some(delegate) = delegate {
            if let Some(marker) = context.marker() {
                let key = PropertyKey::Symbol(marker);
                engine.define(object, &key, link(delegate))?;
                engine.define(delegate, &key, link(object))?;
            }
            let handle = ValueHandle::create(context, delegate, false, false);
            let _ = native.holder.delegate.set(handle);
        }

        engine.set_associated(object, Some(native.clone() as Rc<dyn Any>))?;
        engine.set_finalizer(
            object,
            Box::new(|_engine: &dyn Engine, data: Option<Rc<dyn Any>>| {
                if let Some(native) = data.and_then(|data| data.downcast::<Native<T>>().ok()) {
                    native.dispose();
                }
            }),
        )?;

        tracing::trace!(object = ?object, delegated = delegate.is_some(), "native instance attached");
        Ok(native)
    }

    pub fn holder(&self) -> &ObjectHolder {
        &self.holder
    }

    pub fn state(&self) -> Ref<'_, T> {
        self.state.borrow()
    }

    pub fn state_mut(&self) -> RefMut<'_, T> {
        self.state.borrow_mut()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.get()
    }

    /// Tear the instance down. Runs at most once.
    pub fn dispose(&self) {
        if self.disposed.replace(true) {
            return;
        }
        match self.state.try_borrow_mut() {
            Ok(mut state) => state.dispose(),
            Err(_) => tracing::warn!("native state borrowed during dispose"),
        }
        self.holder.dispose();
        tracing::trace!("native instance disposed");
    }
}

impl<T: NativeClass> Deref for Native<T> {
    type Target = ObjectHolder;

    fn deref(&self) -> &ObjectHolder {
        &self.holder
    }
}

fn link(value: EngineValue) -> PropertyDescriptor {
    PropertyDescriptor::Data {
        value,
        writable: false,
        enumerable: false,
        configurable: true,
    }
}

/// The native instance of type `T` behind `receiver`, looking through a
/// delegate's link when the receiver carries no instance itself.
pub(crate) fn resolve<T: NativeClass>(context: &Context, receiver: EngineValue) -> BridgeResult<Option<Rc<Native<T>>>> {
    let engine = context.engine_ref()?;
    if !engine.kind(receiver)?.is_object() {
        return Ok(None);
    }
    if let Some(data) = engine.associated(receiver)? {
        return Ok(data.downcast::<Native<T>>().ok());
    }

    let Some(marker) = context.marker() else {
        return Ok(None);
    };
    let linked = engine.get(receiver, &PropertyKey::Symbol(marker))?;
    if !engine.kind(linked)?.is_object() {
        return Ok(None);
    }
    Ok(engine
        .associated(linked)?
        .and_then(|data| data.downcast::<Native<T>>().ok()))
}

/// The delegate of a native-backed object, if it has one.
pub(crate) fn unwrap_delegate(context: &Context, value: EngineValue) -> Option<EngineValue> {
    let engine = context.engine_ref().ok()?;
    if !engine.kind(value).ok()?.is_object() {
        return None;
    }
    engine.associated(value).ok()??;
    let marker = context.marker()?;
    let delegate = engine.get(value, &PropertyKey::Symbol(marker)).ok()?;
    engine.kind(delegate).ok()?.is_object().then_some(delegate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::BridgeSettings;
    use std::cell::Cell as StdCell;

    thread_local! {
        static DISPOSED: StdCell<u32> = StdCell::new(0);
    }

    struct Gadget;

    impl NativeClass for Gadget {
        fn new(_context: &Context) -> Self {
            Gadget
        }

        fn describe(_schema: &mut ClassSchema<Self>) {}

        fn dispose(&mut self) {
            DISPOSED.with(|count| count.set(count.get() + 1));
        }
    }

    #[test]
    fn test_finalizer_disposes_once() {
        DISPOSED.with(|count| count.set(0));
        let context = Context::new(BridgeSettings::default()).unwrap();
        let object = context.object().unwrap();
        let raw = object.engine_value().unwrap();
        let native = Native::<Gadget>::attach(&context, raw, None).unwrap();
        assert!(object.cast::<Gadget>().is_some());

        drop(object);
        context.garbage_collect().unwrap();
        assert!(native.is_disposed());
        native.dispose();
        assert_eq!(DISPOSED.with(|count| count.get()), 1);
        context.dispose();
        assert_eq!(DISPOSED.with(|count| count.get()), 1);
    }

    #[test]
    fn test_delegate_links_both_ways() {
        let context = Context::new(BridgeSettings::default()).unwrap();
        let object = context.object().unwrap();
        let delegate = context.object().unwrap();
        let native = Native::<Gadget>::attach(
            &context,
            object.engine_value().unwrap(),
            Some(delegate.engine_value().unwrap()),
        )
        .unwrap();

        assert!(native.value().strict_equals(&delegate).unwrap());
        assert!(delegate.cast::<Gadget>().is_some());
        let bridged = context.wrap_bridged(object.engine_value().unwrap());
        assert!(bridged.strict_equals(&delegate).unwrap());
        let plain = context.wrap_bridged(delegate.engine_value().unwrap());
        assert!(plain.strict_equals(&delegate).unwrap());
        context.dispose();
    }

    #[test]
    fn test_primitive_delegate_is_ignored() {
        let context = Context::new(BridgeSettings::default()).unwrap();
        let object = context.object().unwrap();
        let native = Native::<Gadget>::attach(
            &context,
            object.engine_value().unwrap(),
            Some(context.number(1.0).unwrap().engine_value().unwrap()),
        )
        .unwrap();
        assert!(native.delegate().is_none());
        assert!(native.value().strict_equals(&object).unwrap());
        context.dispose();
    }
}
