//! Class bridging
//!
//! A [`ClassSchema`] is the static member table of a [`NativeClass`]. At
//! registration every member becomes an engine function whose body resolves
//! the native instance behind the receiver and calls the member's dispatch
//! closure with the marshaled call.
//!
//! [`ClassBridge`] turns a schema into a constructor with a prototype;
//! [`ObjectBuilder`] turns it into a single plain object.

use crate::callback::{self, ConstructorCallback, FunctionCallback, GetterCallback, SetterCallback};
use crate::context::Context;
use crate::error::{BridgeError, BridgeResult};
use crate::native::{self, Native, NativeClass};
use crate::value::ValueHandle;
use std::rc::Rc;
use trellis_engine::{EngineValue, Invocation};

type MethodFn<T> = Rc<dyn Fn(&Native<T>, &mut FunctionCallback<'_>) -> BridgeResult<()>>;
type GetterFn<T> = Rc<dyn Fn(&Native<T>, &mut GetterCallback<'_>) -> BridgeResult<()>>;
type SetterFn<T> = Rc<dyn Fn(&Native<T>, &mut SetterCallback<'_>) -> BridgeResult<()>>;
type StaticFn = Rc<dyn Fn(&mut FunctionCallback<'_>) -> BridgeResult<()>>;
type ConstructorFn<T> = Rc<dyn Fn(&Native<T>, &mut ConstructorCallback<'_>) -> BridgeResult<()>>;

/// Kind of a declared member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    Function,
    Getter,
    Setter,
    Static,
    Constructor,
}

enum Dispatch<T: NativeClass> {
    Function(MethodFn<T>),
    Getter(GetterFn<T>),
    Setter(SetterFn<T>),
    Static(StaticFn),
    Constructor(ConstructorFn<T>),
}

struct Member<T: NativeClass> {
    name: String,
    dispatch: Dispatch<T>,
}

/// Ordered member table of a native class.
pub struct ClassSchema<T: NativeClass> {
    members: Vec<Member<T>>,
}

impl<T: NativeClass> ClassSchema<T> {
    pub fn new() -> Self {
        Self { members: Vec::new() }
    }

    fn push(&mut self, name: &str, dispatch: Dispatch<T>) -> &mut Self {
        self.members.push(Member {
            name: name.to_string(),
            dispatch,
        });
        self
    }

    /// Instance method.
    pub fn function<F>(&mut self, name: &str, f: F) -> &mut Self
    where
        F: Fn(&Native<T>, &mut FunctionCallback<'_>) -> BridgeResult<()> + 'static,
    {
        self.push(name, Dispatch::Function(Rc::new(f)))
    }

    pub fn getter<F>(&mut self, name: &str, f: F) -> &mut Self
    where
        F: Fn(&Native<T>, &mut GetterCallback<'_>) -> BridgeResult<()> + 'static,
    {
        self.push(name, Dispatch::Getter(Rc::new(f)))
    }

    pub fn setter<F>(&mut self, name: &str, f: F) -> &mut Self
    where
        F: Fn(&Native<T>, &mut SetterCallback<'_>) -> BridgeResult<()> + 'static,
    {
        self.push(name, Dispatch::Setter(Rc::new(f)))
    }

    /// Getter and setter pair.
    pub fn property<G, S>(&mut self, name: &str, getter: G, setter: S) -> &mut Self
    where
        G: Fn(&Native<T>, &mut GetterCallback<'_>) -> BridgeResult<()> + 'static,
        S: Fn(&Native<T>, &mut SetterCallback<'_>) -> BridgeResult<()> + 'static,
    {
        self.getter(name, getter).setter(name, setter)
    }

    /// Function on the constructor. Dispatches without a native instance.
    pub fn static_function<F>(&mut self, name: &str, f: F) -> &mut Self
    where
        F: Fn(&mut FunctionCallback<'_>) -> BridgeResult<()> + 'static,
    {
        self.push(name, Dispatch::Static(Rc::new(f)))
    }

    /// Runs after the native instance is attached, in declaration order.
    pub fn constructor<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&Native<T>, &mut ConstructorCallback<'_>) -> BridgeResult<()> + 'static,
    {
        self.push("constructor", Dispatch::Constructor(Rc::new(f)))
    }

    pub fn members(&self) -> impl Iterator<Item = (&str, MemberKind)> {
        self.members.iter().map(|member| {
            let kind = match member.dispatch {
                Dispatch::Function(_) => MemberKind::Function,
                Dispatch::Getter(_) => MemberKind::Getter,
                Dispatch::Setter(_) => MemberKind::Setter,
                Dispatch::Static(_) => MemberKind::Static,
                Dispatch::Constructor(_) => MemberKind::Constructor,
            };
            (member.name.as_str(), kind)
        })
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    fn constructors(&self) -> Vec<ConstructorFn<T>> {
        self.members
            .iter()
            .filter_map(|member| match &member.dispatch {
                Dispatch::Constructor(f) => Some(f.clone()),
                _ => None,
            })
            .collect()
    }

    /// Define every member on `target`. Statics go on `statics` when given.
    fn install(&self, context: &Context, target: &ValueHandle, statics: Option<&ValueHandle>) -> BridgeResult<()> {
        for member in &self.members {
            let name = member.name.as_str();
            match &member.dispatch {
                Dispatch::Function(f) => {
                    let function = method_member(context, name, f.clone())?;
                    target.define_hidden(name, &function)?;
                }
                Dispatch::Getter(f) => {
                    let getter = getter_member(context, name, f.clone())?;
                    target.define_accessor(name, Some(&getter), None)?;
                }
                Dispatch::Setter(f) => {
                    let setter = setter_member(context, name, f.clone())?;
                    target.define_accessor(name, None, Some(&setter))?;
                }
                Dispatch::Static(f) => {
                    let f = f.clone();
                    let function = callback::function(context, name, move |cb| f(cb))?;
                    statics.unwrap_or(target).define_hidden(name, &function)?;
                }
                Dispatch::Constructor(_) => {}
            }
        }
        Ok(())
    }
}

impl<T: NativeClass> Default for ClassSchema<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn instance<T: NativeClass>(context: &Context, receiver: EngineValue, member: &str) -> BridgeResult<Rc<Native<T>>> {
    native::resolve::<T>(context, receiver)?.ok_or_else(|| BridgeError::MissingNativeInstance {
        member: member.to_string(),
    })
}

fn method_member<T: NativeClass>(context: &Context, name: &str, f: MethodFn<T>) -> BridgeResult<ValueHandle> {
    let member = name.to_string();
    callback::function(context, name, move |cb| {
        let native = instance::<T>(cb.context(), cb.raw_target(), &member)?;
        tracing::trace!(member = %member, "method dispatch");
        f(&*native, cb)
    })
}

fn getter_member<T: NativeClass>(context: &Context, name: &str, f: GetterFn<T>) -> BridgeResult<ValueHandle> {
    callback::getter_function(context, name, move |cb| {
        let native = instance::<T>(cb.context(), cb.raw_target(), cb.property())?;
        f(&*native, cb)
    })
}

fn setter_member<T: NativeClass>(context: &Context, name: &str, f: SetterFn<T>) -> BridgeResult<ValueHandle> {
    callback::setter_function(context, name, move |cb| {
        let native = instance::<T>(cb.context(), cb.raw_target(), cb.property())?;
        f(&*native, cb)
    })
}

/// Builds the engine constructor of a native class.
pub struct ClassBridge<T: NativeClass> {
    schema: ClassSchema<T>,
}

impl<T: NativeClass> ClassBridge<T> {
    pub fn new() -> Self {
        let mut schema = ClassSchema::new();
        T::describe(&mut schema);
        Self { schema }
    }

    pub fn schema(&self) -> &ClassSchema<T> {
        &self.schema
    }

    /// Create the constructor named `name`.
    ///
    /// Constructing attaches a fresh native instance to the new object,
    /// taking argument 0 as the delegate when it is an object, then runs the
    /// declared constructor members. Calling without `new` throws.
    pub fn build(&self, context: &Context, name: &str) -> BridgeResult<ValueHandle> {
        let constructors = self.schema.constructors();
        let class_name = name.to_string();
        let body = callback::trampoline(context, move |context: &Context, invocation: &Invocation<'_>| {
            let mut cb = ConstructorCallback::new(context, invocation);
            match construct::<T>(&constructors, &class_name, &mut cb) {
                Ok(()) => Ok(cb.into_result()),
                Err(error) => Err(context.throw(&error)),
            }
        });

        let engine = context.engine_ref()?;
        let constructor = context.wrap(engine.constructor(name, body)?);
        let prototype = constructor.property("prototype")?;
        self.schema.install(context, &prototype, Some(&constructor))?;

        tracing::debug!(class = name, members = self.schema.len(), "class built");
        Ok(constructor)
    }
}

impl<T: NativeClass> Default for ClassBridge<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn construct<T: NativeClass>(
    constructors: &[ConstructorFn<T>],
    name: &str,
    cb: &mut ConstructorCallback<'_>,
) -> BridgeResult<()> {
    if !cb.is_constructing() {
        return Err(BridgeError::native(format!(
            "class constructor {} cannot be invoked without 'new'",
            name
        )));
    }
    let native = Native::<T>::attach(cb.context(), cb.raw_target(), cb.raw_argument(0))?;
    for constructor in constructors {
        constructor(&*native, cb)?;
    }
    Ok(())
}

/// Builds a single object carrying a native class's members directly.
pub struct ObjectBuilder<T: NativeClass> {
    schema: ClassSchema<T>,
}

impl<T: NativeClass> ObjectBuilder<T> {
    pub fn new() -> Self {
        let mut schema = ClassSchema::new();
        T::describe(&mut schema);
        Self { schema }
    }

    /// Create the object and its native instance. The object is not rooted
    /// by the instance; keep a handle to it or make it reachable.
    pub fn build(&self, context: &Context) -> BridgeResult<Rc<Native<T>>> {
        let engine = context.engine_ref()?;
        let object = context.object()?;
        let raw = object.engine_value()?;
        let native = Native::<T>::attach(context, raw, None)?;
        self.schema.install(context, &object, None)?;

        let constructors = self.schema.constructors();
        if !constructors.is_empty() {
            let invocation = Invocation {
                target: raw,
                callee: engine.undefined(),
                arguments: &[],
                constructing: true,
            };
            let mut cb = ConstructorCallback::new(context, &invocation);
            for constructor in &constructors {
                constructor(&*native, &mut cb)?;
            }
        }

        tracing::debug!(members = self.schema.len(), "object built");
        Ok(native)
    }
}

impl<T: NativeClass> Default for ObjectBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::BridgeSettings;

    struct Counter {
        count: f64,
    }

    impl NativeClass for Counter {
        fn new(_context: &Context) -> Self {
            Counter { count: 0.0 }
        }

        fn describe(schema: &mut ClassSchema<Self>) {
            schema
                .constructor(|native, cb| {
                    if cb.arguments() > 1 {
                        native.state_mut().count = cb.argument(1).number()?;
                    }
                    Ok(())
                })
                .function("increment", |native, cb| {
                    let mut state = native.state_mut();
                    state.count += 1.0;
                    cb.returns_number(state.count)
                })
                .property(
                    "count",
                    |native, cb| cb.returns_number(native.state().count),
                    |native, cb| {
                        native.state_mut().count = cb.value().number()?;
                        Ok(())
                    },
                )
                .static_function("zero", |cb| cb.returns_number(0.0));
        }
    }

    fn context() -> Context {
        Context::new(BridgeSettings {
            report_unhandled_exceptions: false,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_schema_order() {
        let bridge = ClassBridge::<Counter>::new();
        let kinds: Vec<_> = bridge.schema().members().map(|(_, kind)| kind).collect();
        assert_eq!(
            kinds,
            vec![
                MemberKind::Constructor,
                MemberKind::Function,
                MemberKind::Getter,
                MemberKind::Setter,
                MemberKind::Static
            ]
        );
    }

    #[test]
    fn test_class_members() {
        let context = context();
        let class = ClassBridge::<Counter>::new().build(&context, "Counter").unwrap();
        let null = context.null().unwrap();
        let start = context.number(5.0).unwrap();
        let counter = class.construct(&[&null, &start]).unwrap();

        assert!(counter.property("count").unwrap().equals_number(5.0));
        assert!(counter.call_method("increment", &[]).unwrap().equals_number(6.0));
        counter.set_property("count", &context.number(1.0).unwrap()).unwrap();
        assert_eq!(counter.cast::<Counter>().unwrap().state().count, 1.0);
        assert!(class.call_method("zero", &[]).unwrap().equals_number(0.0));
        context.dispose();
    }

    #[test]
    fn test_members_are_not_enumerable() {
        let context = context();
        let class = ClassBridge::<Counter>::new().build(&context, "Counter").unwrap();
        let counter = class.construct(&[]).unwrap();
        let mut keys = Vec::new();
        counter.prototype().unwrap().for_own(|key, _| keys.push(key.to_string())).unwrap();
        assert!(keys.is_empty());
        context.dispose();
    }

    #[test]
    fn test_missing_instance_throws() {
        let context = context();
        let class = ClassBridge::<Counter>::new().build(&context, "Counter").unwrap();
        let counter = class.construct(&[]).unwrap();
        let increment = counter.property("increment").unwrap();
        let stranger = context.object().unwrap();
        let error = increment.call_with(&stranger, &[]).unwrap_err();
        match error {
            BridgeError::ScriptException { message, .. } => {
                assert!(message.starts_with("TypeError"));
                assert!(message.contains("increment"));
            }
            other => panic!("unexpected error {:?}", other),
        }
        context.dispose();
    }

    #[test]
    fn test_call_without_new_throws() {
        let context = context();
        let class = ClassBridge::<Counter>::new().build(&context, "Counter").unwrap();
        assert!(matches!(class.call(&[]), Err(BridgeError::ScriptException { .. })));
        context.dispose();
    }

    #[test]
    fn test_object_builder() {
        let context = context();
        let native = ObjectBuilder::<Counter>::new().build(&context).unwrap();
        let object = native.handle().clone();
        assert!(object.call_method("increment", &[]).unwrap().equals_number(1.0));
        assert!(object.call_method("zero", &[]).unwrap().equals_number(0.0));
        assert_eq!(native.state().count, 1.0);
        context.dispose();
    }
}
