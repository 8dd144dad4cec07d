//! Call marshaling
//!
//! Every engine-to-native call is described by a [`CallRecord`] built for
//! that one invocation: the receiver, the callee, indexed arguments and a
//! single return slot. The record borrows the invocation, so it cannot
//! outlive the call that produced it.

use crate::context::Context;
use crate::error::BridgeResult;
use crate::value::ValueHandle;
use std::ops::{Deref, DerefMut};
use std::rc::Rc;
use trellis_engine::{Engine, EngineValue, Invocation, NativeFunction};

/// Arguments and return slot of one engine-to-native call.
pub struct CallRecord<'a> {
    context: &'a Context,
    invocation: &'a Invocation<'a>,
    result: Option<ValueHandle>,
}

impl<'a> CallRecord<'a> {
    pub fn new(context: &'a Context, invocation: &'a Invocation<'a>) -> Self {
        Self {
            context,
            invocation,
            result: None,
        }
    }

    pub fn context(&self) -> &Context {
        self.context
    }

    /// The receiver of the call.
    pub fn target(&self) -> ValueHandle {
        self.context.wrap(self.invocation.target)
    }

    pub fn callee(&self) -> ValueHandle {
        self.context.wrap(self.invocation.callee)
    }

    pub fn arguments(&self) -> usize {
        self.invocation.arguments.len()
    }

    /// Argument `index`, or undefined past the end.
    pub fn argument(&self, index: usize) -> ValueHandle {
        match self.invocation.argument(index) {
            Some(value) => self.context.wrap(value),
            None => self.context.wrap(self.context.raw_engine().undefined()),
        }
    }

    pub(crate) fn raw_argument(&self, index: usize) -> Option<EngineValue> {
        self.invocation.argument(index)
    }

    pub(crate) fn raw_target(&self) -> EngineValue {
        self.invocation.target
    }

    pub fn is_constructing(&self) -> bool {
        self.invocation.constructing
    }

    /// Set the call's result. A later call replaces an earlier one.
    pub fn returns(&mut self, value: &ValueHandle) {
        let previous = self.result.replace(value.clone());
        drop(previous);
    }

    pub fn returns_value(&mut self, value: ValueHandle) {
        let previous = self.result.replace(value);
        drop(previous);
    }

    pub fn returns_string(&mut self, value: &str) -> BridgeResult<()> {
        let value = self.context.string(value)?;
        self.returns_value(value);
        Ok(())
    }

    pub fn returns_number(&mut self, value: f64) -> BridgeResult<()> {
        let value = self.context.number(value)?;
        self.returns_value(value);
        Ok(())
    }

    pub fn returns_boolean(&mut self, value: bool) -> BridgeResult<()> {
        let value = self.context.boolean(value)?;
        self.returns_value(value);
        Ok(())
    }

    pub fn returns_null(&mut self) -> BridgeResult<()> {
        let value = self.context.null()?;
        self.returns_value(value);
        Ok(())
    }

    pub fn result(&self) -> Option<&ValueHandle> {
        self.result.as_ref()
    }

    /// The value handed back to the engine: the last returned value, or
    /// undefined.
    pub fn into_result(self) -> EngineValue {
        self.result
            .as_ref()
            .and_then(ValueHandle::raw)
            .unwrap_or_else(|| self.context.raw_engine().undefined())
    }
}

macro_rules! call_shape {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        pub struct $name<'a> {
            record: CallRecord<'a>,
        }

        impl<'a> $name<'a> {
            pub fn new(context: &'a Context, invocation: &'a Invocation<'a>) -> Self {
                Self {
                    record: CallRecord::new(context, invocation),
                }
            }

            pub fn into_result(self) -> EngineValue {
                self.record.into_result()
            }
        }

        impl<'a> Deref for $name<'a> {
            type Target = CallRecord<'a>;

            fn deref(&self) -> &CallRecord<'a> {
                &self.record
            }
        }

        impl<'a> DerefMut for $name<'a> {
            fn deref_mut(&mut self) -> &mut CallRecord<'a> {
                &mut self.record
            }
        }
    };
}

call_shape! {
    /// A plain function or method call.
    FunctionCallback
}

call_shape! {
    /// A constructor call. The target is the instance being built.
    ConstructorCallback
}

/// A property read.
pub struct GetterCallback<'a> {
    record: CallRecord<'a>,
    property: &'a str,
}

impl<'a> GetterCallback<'a> {
    pub fn new(context: &'a Context, invocation: &'a Invocation<'a>, property: &'a str) -> Self {
        Self {
            record: CallRecord::new(context, invocation),
            property,
        }
    }

    pub fn property(&self) -> &str {
        self.property
    }

    pub fn into_result(self) -> EngineValue {
        self.record.into_result()
    }
}

impl<'a> Deref for GetterCallback<'a> {
    type Target = CallRecord<'a>;

    fn deref(&self) -> &CallRecord<'a> {
        &self.record
    }
}

impl<'a> DerefMut for GetterCallback<'a> {
    fn deref_mut(&mut self) -> &mut CallRecord<'a> {
        &mut self.record
    }
}

/// A property write.
pub struct SetterCallback<'a> {
    record: CallRecord<'a>,
    property: &'a str,
}

impl<'a> SetterCallback<'a> {
    pub fn new(context: &'a Context, invocation: &'a Invocation<'a>, property: &'a str) -> Self {
        Self {
            record: CallRecord::new(context, invocation),
            property,
        }
    }

    pub fn property(&self) -> &str {
        self.property
    }

    /// The incoming value.
    pub fn value(&self) -> ValueHandle {
        self.record.argument(0)
    }

    pub fn into_result(self) -> EngineValue {
        self.record.into_result()
    }
}

impl<'a> Deref for SetterCallback<'a> {
    type Target = CallRecord<'a>;

    fn deref(&self) -> &CallRecord<'a> {
        &self.record
    }
}

impl<'a> DerefMut for SetterCallback<'a> {
    fn deref_mut(&mut self) -> &mut CallRecord<'a> {
        &mut self.record
    }
}

/// Wrap `body` as an engine function body. The context is held weakly;
/// once it is gone the function returns undefined.
pub(crate) fn trampoline<F>(context: &Context, body: F) -> NativeFunction
where
    F: Fn(&Context, &Invocation<'_>) -> Result<EngineValue, EngineValue> + 'static,
{
    let weak = context.downgrade();
    Rc::new(move |engine: &dyn Engine, invocation: &Invocation<'_>| {
        match Context::upgrade(&weak).filter(|context| !context.is_disposed()) {
            Some(context) => body(&context, invocation),
            None => Ok(engine.undefined()),
        }
    })
}

pub(crate) fn function<F>(context: &Context, name: &str, handler: F) -> BridgeResult<ValueHandle>
where
    F: Fn(&mut FunctionCallback<'_>) -> BridgeResult<()> + 'static,
{
    let body = trampoline(context, move |context: &Context, invocation: &Invocation<'_>| {
        let mut callback = FunctionCallback::new(context, invocation);
        match handler(&mut callback) {
            Ok(()) => Ok(callback.into_result()),
            Err(error) => Err(context.throw(&error)),
        }
    });
    let engine = context.engine_ref()?;
    Ok(context.wrap(engine.function(name, body)?))
}

pub(crate) fn getter_function<F>(context: &Context, property: &str, handler: F) -> BridgeResult<ValueHandle>
where
    F: Fn(&mut GetterCallback<'_>) -> BridgeResult<()> + 'static,
{
    let name = property.to_string();
    let body = trampoline(context, move |context: &Context, invocation: &Invocation<'_>| {
        let mut callback = GetterCallback::new(context, invocation, &name);
        match handler(&mut callback) {
            Ok(()) => Ok(callback.into_result()),
            Err(error) => Err(context.throw(&error)),
        }
    });
    let engine = context.engine_ref()?;
    Ok(context.wrap(engine.function(&format!("get {}", property), body)?))
}

pub(crate) fn setter_function<F>(context: &Context, property: &str, handler: F) -> BridgeResult<ValueHandle>
where
    F: Fn(&mut SetterCallback<'_>) -> BridgeResult<()> + 'static,
{
    let name = property.to_string();
    let body = trampoline(context, move |context: &Context, invocation: &Invocation<'_>| {
        let mut callback = SetterCallback::new(context, invocation, &name);
        match handler(&mut callback) {
            Ok(()) => Ok(callback.into_result()),
            Err(error) => Err(context.throw(&error)),
        }
    });
    let engine = context.engine_ref()?;
    Ok(context.wrap(engine.function(&format!("set {}", property), body)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BridgeError;
    use crate::settings::BridgeSettings;

    #[test]
    fn test_missing_arguments_are_undefined() {
        let context = Context::new(BridgeSettings::default()).unwrap();
        let echo = context
            .function(Some("echo"), |cb| {
                assert_eq!(cb.arguments(), 1);
                assert!(cb.argument(0).equals_number(1.0));
                assert!(cb.argument(3).is_undefined());
                Ok(())
            })
            .unwrap();
        let result = echo.call(&[&context.number(1.0).unwrap()]).unwrap();
        assert!(result.is_undefined());
        context.dispose();
    }

    #[test]
    fn test_last_return_wins() {
        let context = Context::new(BridgeSettings::default()).unwrap();
        let twice = context
            .function(None, |cb| {
                cb.returns_string("first")?;
                cb.returns_number(2.0)
            })
            .unwrap();
        assert!(twice.call(&[]).unwrap().equals_number(2.0));
        context.dispose();
    }

    #[test]
    fn test_errors_are_thrown_into_script() {
        let context = Context::new(BridgeSettings {
            report_unhandled_exceptions: false,
            ..Default::default()
        })
        .unwrap();
        let failing = context
            .function(Some("failing"), |_| Err(BridgeError::native("layout failed")))
            .unwrap();
        match failing.call(&[]) {
            Err(BridgeError::ScriptException { message, thrown }) => {
                assert_eq!(message, "Error: layout failed");
                assert!(thrown.is_some());
            }
            other => panic!("unexpected result {:?}", other),
        }
        context.dispose();
    }

    #[test]
    fn test_reentrant_calls() {
        let context = Context::new(BridgeSettings::default()).unwrap();
        let inner = context.function(Some("inner"), |cb| cb.returns_number(1.0)).unwrap();
        let outer = context
            .function(Some("outer"), move |cb| {
                let value = inner.call(&[])?.number()?;
                cb.returns_number(value + 1.0)
            })
            .unwrap();
        assert!(outer.call(&[]).unwrap().equals_number(2.0));
        context.dispose();
    }
}
