//! QuickJS engine
//!
//! Implements the [`Engine`] ABI on top of an rquickjs `Runtime`/`Context`.
//! Script values reach the host as generational slot handles (see
//! [`crate::slots`]); the script side never sees the slot table.
//!
//! Rooting follows the handle contract rather than QuickJS refcounts: a
//! collection pass downgrades every unrooted object slot to a `WeakRef`, so a
//! handle stays usable exactly as long as something in script still reaches
//! the object. A tagged object carries a host marker function; dropping the
//! marker's closure queues the object's native finalizer for the next pass.

use crate::abi::{
    Engine, ExceptionHandler, FinalizeHandler, Invocation, NativeFunction, PropertyDescriptor, PropertyKey,
};
use crate::error::{EngineError, EngineResult};
use crate::slots::{Entry, Slots};
use crate::value::{EngineValue, Repr, ValueKind};
use rquickjs::function::Rest;
use rquickjs::{Context, Ctx, Function, Object, Persistent, Runtime, Value};
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use trellis_metrics::{EngineEvent, EventCounter, PauseTimer};

/// Script-side helpers, evaluated once per engine. Everything the ABI needs
/// that rquickjs does not expose directly goes through these.
const HELPERS: &str = r#"(() => {
    "use strict";
    const tag = Symbol("trellis.native");
    const canWeaken = typeof WeakRef === "function";
    return {
        kind: (v) => (v === null ? "null" : Array.isArray(v) ? "array" : typeof v),
        text: (v) => String(v),
        number: (v) => (typeof v === "symbol" ? NaN : Number(v)),
        truthy: (v) => !!v,
        strictEquals: (a, b) => a === b,
        looseEquals: (a, b) => a == b,
        symbol: (description) => Symbol(description),
        object: (prototype) => Object.create(prototype),
        error: (name, message) => {
            const Kind = globalThis[name];
            const native = typeof Kind === "function" && (Kind === Error || Kind.prototype instanceof Error);
            const error = native ? new Kind(message) : new Error(message);
            if (error.name !== name) {
                Object.defineProperty(error, "name", { value: name, writable: true, configurable: true });
            }
            return error;
        },
        func: (name, call) => {
            const f = { [name](...args) { return call(false, this, f, ...args); } }[name];
            return f;
        },
        ctor: (name, call) => {
            const F = function (...args) { return call(new.target !== undefined, this, F, ...args); };
            Object.defineProperty(F, "name", { value: name });
            return F;
        },
        get: (o, k) => o[k],
        set: (o, k, v) => { Reflect.set(o, k, v); },
        defineData: (o, k, value, writable, enumerable, configurable) =>
            Reflect.defineProperty(o, k, { value, writable, enumerable, configurable }),
        defineAccessor: (o, k, get, set, enumerable, configurable) => {
            const prior = Object.getOwnPropertyDescriptor(o, k);
            const getter = get !== undefined ? get : prior && prior.get;
            const setter = set !== undefined ? set : prior && prior.set;
            const descriptor = { enumerable, configurable };
            if (getter !== undefined) descriptor.get = getter;
            if (setter !== undefined) descriptor.set = setter;
            return Reflect.defineProperty(o, k, descriptor);
        },
        remove: (o, k) => Reflect.deleteProperty(o, k),
        keys: (o) => Object.keys(o),
        length: (a) => (Array.isArray(a) ? a.length : -1),
        prototypeOf: (o) => Object.getPrototypeOf(o),
        setPrototypeOf: (o, p) => Reflect.setPrototypeOf(o, p),
        apply: (f, t, args) => Reflect.apply(f, t, args),
        isConstructor: (f) => {
            try {
                Reflect.construct(String, [], f);
                return true;
            } catch (e) {
                return false;
            }
        },
        construct: (f, args) => Reflect.construct(f, args),
        tagOf: (o) => {
            const own = Object.getOwnPropertyDescriptor(o, tag);
            return own === undefined ? undefined : own.value();
        },
        attach: (o, marker) => {
            Object.defineProperty(o, tag, { value: marker });
        },
        weaken: (o) => (canWeaken ? new WeakRef(o) : null),
        deref: (w) => w.deref(),
    };
})()"#;

/// Handle table statistics snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStats {
    pub live_handles: usize,
    pub rooted_handles: usize,
    pub weak_handles: usize,
    pub collections: u64,
}

struct EngineMetrics {
    events: EventCounter,
    pauses: PauseTimer,
}

/// Host-side data attached to one script object.
#[derive(Default)]
struct NativeRecord {
    associated: Option<Rc<dyn Any>>,
    attributes: HashMap<u64, Rc<dyn Any>>,
    finalizer: Option<FinalizeHandler>,
}

/// Owned by a marker closure. Dropped when the script heap frees the object.
struct Doom {
    id: u64,
    doomed: Rc<RefCell<Vec<u64>>>,
}

impl Doom {
    fn id(&self) -> f64 {
        self.id as f64
    }
}

impl Drop for Doom {
    fn drop(&mut self) {
        if let Ok(mut doomed) = self.doomed.try_borrow_mut() {
            doomed.push(self.id);
        }
    }
}

struct Js {
    // Declared first so the context goes before its runtime.
    context: Context,
    runtime: Runtime,
}

/// Restores the cached context pointer when a scope ends.
struct CtxScope<'a> {
    current: &'a Cell<Option<*const ()>>,
    previous: Option<*const ()>,
}

impl Drop for CtxScope<'_> {
    fn drop(&mut self) {
        self.current.set(self.previous);
    }
}

pub struct QuickJsEngine {
    this: Weak<QuickJsEngine>,
    js: RefCell<Option<Js>>,
    /// The `Ctx` of the innermost active scope. QuickJS locks the runtime
    /// for the length of `Context::with`, so nested calls must reuse it.
    current: Cell<Option<*const ()>>,
    slots: RefCell<Slots>,
    helpers: RefCell<Option<Persistent<Object<'static>>>>,
    global: Cell<EngineValue>,
    records: RefCell<HashMap<u64, NativeRecord>>,
    next_record: Cell<u64>,
    /// Record ids whose objects the script heap has freed.
    doomed: Rc<RefCell<Vec<u64>>>,
    destroyed: Cell<bool>,
    depth: Cell<u32>,
    collections: Cell<u64>,
    exception_handler: RefCell<Option<ExceptionHandler>>,
    context_attributes: RefCell<HashMap<u64, Rc<dyn Any>>>,
    metrics: RefCell<EngineMetrics>,
}

fn runtime_error(error: rquickjs::Error) -> EngineError {
    EngineError::Runtime {
        message: error.to_string(),
    }
}

fn key_name(key: &PropertyKey) -> String {
    match key {
        PropertyKey::Name(name) => name.clone(),
        PropertyKey::Index(index) => index.to_string(),
        PropertyKey::Symbol(_) => "[symbol]".to_string(),
    }
}

impl QuickJsEngine {
    pub fn new() -> EngineResult<Rc<Self>> {
        let runtime = Runtime::new().map_err(runtime_error)?;
        let context = Context::full(&runtime).map_err(runtime_error)?;

        let engine = Rc::new_cyclic(|this| QuickJsEngine {
            this: this.clone(),
            js: RefCell::new(Some(Js { context, runtime })),
            current: Cell::new(None),
            slots: RefCell::new(Slots::default()),
            helpers: RefCell::new(None),
            global: Cell::new(EngineValue::UNDEFINED),
            records: RefCell::new(HashMap::new()),
            next_record: Cell::new(1),
            doomed: Rc::new(RefCell::new(Vec::new())),
            destroyed: Cell::new(false),
            depth: Cell::new(0),
            collections: Cell::new(0),
            exception_handler: RefCell::new(None),
            context_attributes: RefCell::new(HashMap::new()),
            metrics: RefCell::new(EngineMetrics {
                events: EventCounter::new(),
                pauses: PauseTimer::new(32),
            }),
        });
        engine.install()?;

        tracing::debug!("quickjs engine created");
        Ok(engine)
    }

    pub fn stats(&self) -> EngineStats {
        let slots = self.slots.borrow();
        EngineStats {
            live_handles: slots.live_count(),
            rooted_handles: slots.rooted_count(),
            weak_handles: slots.weak_count(),
            collections: self.collections.get(),
        }
    }

    /// Current root count of a heap value (0 for primitives).
    pub fn root_count(&self, value: EngineValue) -> EngineResult<u32> {
        self.live()?;
        match value.as_cell() {
            Some(id) => self.slots.borrow().roots(id),
            None => Ok(0),
        }
    }

    /// Event totals so far. Empty unless built with the `metrics` feature.
    pub fn events(&self) -> EventCounter {
        self.metrics.borrow().events
    }

    // ------------------------------------------------------------------
    // Scopes and helpers
    // ------------------------------------------------------------------

    fn install(&self) -> EngineResult<()> {
        self.with_ctx(|ctx| {
            let helpers: Object = self.check(ctx, ctx.eval(HELPERS))?;
            *self.helpers.borrow_mut() = Some(Persistent::save(ctx, helpers));

            let global = self.adopt_as(ctx, ctx.globals().into_value(), ValueKind::Object)?;
            self.pin(global)?;
            self.global.set(global);
            Ok(())
        })
    }

    fn live(&self) -> EngineResult<()> {
        if self.destroyed.get() {
            return Err(EngineError::Destroyed);
        }
        Ok(())
    }

    fn scope(&self, ctx: &Ctx<'_>) -> CtxScope<'_> {
        let previous = self.current.replace(Some(ctx as *const Ctx<'_> as *const ()));
        CtxScope {
            current: &self.current,
            previous,
        }
    }

    /// Run `f` with a context, reusing the innermost active one.
    fn with_ctx<R>(&self, f: impl FnOnce(&Ctx<'_>) -> EngineResult<R>) -> EngineResult<R> {
        self.live()?;
        if let Some(ptr) = self.current.get() {
            // SAFETY: `ptr` was stored by a `CtxScope` whose `Ctx` is still on
            // the stack below us; the scope clears it before that frame ends.
            let ctx = unsafe { &*(ptr as *const Ctx<'_>) };
            return f(ctx);
        }

        let context = self
            .js
            .borrow()
            .as_ref()
            .map(|js| js.context.clone())
            .ok_or(EngineError::Destroyed)?;
        context.with(|ctx| {
            let _scope = self.scope(&ctx);
            f(&ctx)
        })
    }

    /// Track call depth so exceptions are reported once, at the outermost call.
    fn enter<R>(&self, f: impl FnOnce() -> EngineResult<R>) -> EngineResult<R> {
        let depth = self.depth.get();
        self.depth.set(depth + 1);
        let result = f();
        self.depth.set(depth);

        if depth == 0 {
            if let Err(EngineError::Exception { value, message }) = &result {
                tracing::debug!(%message, "uncaught exception");
                self.metrics.borrow_mut().events.record(EngineEvent::UncaughtException, 1);
                let handler = self.exception_handler.borrow().clone();
                if let Some(handler) = handler {
                    handler(self, *value);
                }
            }
        }
        result
    }

    fn helper<'js>(&self, ctx: &Ctx<'js>, name: &str) -> EngineResult<Function<'js>> {
        let helpers = self.helpers.borrow().clone().ok_or(EngineError::Destroyed)?;
        let helpers = helpers.restore(ctx).map_err(runtime_error)?;
        helpers.get(name).map_err(runtime_error)
    }

    fn check<'js, T>(&self, ctx: &Ctx<'js>, result: rquickjs::Result<T>) -> EngineResult<T> {
        result.map_err(|error| self.caught(ctx, error))
    }

    /// Turn a pending script exception into an `EngineError`.
    fn caught<'js>(&self, ctx: &Ctx<'js>, error: rquickjs::Error) -> EngineError {
        match error {
            rquickjs::Error::Exception => {
                let thrown = ctx.catch();
                let message = self.describe(ctx, &thrown);
                match self.adopt(ctx, thrown) {
                    Ok(value) => EngineError::Exception { value, message },
                    Err(error) => error,
                }
            }
            other => runtime_error(other),
        }
    }

    fn describe<'js>(&self, ctx: &Ctx<'js>, value: &Value<'js>) -> String {
        let text = self
            .helper(ctx, "text")
            .and_then(|text| text.call::<_, String>((value.clone(),)).map_err(runtime_error));
        match text {
            Ok(text) => text,
            Err(_) => {
                // Throwing toString(); drop the secondary exception.
                let _ = ctx.catch();
                "<unprintable value>".to_string()
            }
        }
    }

    // ------------------------------------------------------------------
    // Slots
    // ------------------------------------------------------------------

    fn adopt<'js>(&self, ctx: &Ctx<'js>, value: Value<'js>) -> EngineResult<EngineValue> {
        if value.is_undefined() {
            return Ok(EngineValue::UNDEFINED);
        }
        if value.is_null() {
            return Ok(EngineValue::NULL);
        }
        if let Some(flag) = value.as_bool() {
            return Ok(EngineValue(Repr::Boolean(flag)));
        }
        if let Some(number) = value.as_number() {
            return Ok(EngineValue(Repr::Number(number)));
        }

        let kind: String = self.check(ctx, self.helper(ctx, "kind")?.call((value.clone(),)))?;
        let kind = match kind.as_str() {
            "string" => ValueKind::String,
            "symbol" => ValueKind::Symbol,
            "array" => ValueKind::Array,
            "function" => ValueKind::Function,
            "object" => ValueKind::Object,
            _ => {
                // BigInt and friends surface as plain numbers.
                let number: f64 = self.check(ctx, self.helper(ctx, "number")?.call((value,)))?;
                return Ok(EngineValue(Repr::Number(number)));
            }
        };
        self.adopt_as(ctx, value, kind)
    }

    fn adopt_as<'js>(&self, ctx: &Ctx<'js>, value: Value<'js>, kind: ValueKind) -> EngineResult<EngineValue> {
        let saved = Persistent::save(ctx, value);
        let id = self.slots.borrow_mut().insert(Entry::Strong(saved), kind);
        self.metrics.borrow_mut().events.record(EngineEvent::HandleAdopted, 1);
        Ok(EngineValue::cell(id))
    }

    fn restore<'js>(&self, ctx: &Ctx<'js>, value: EngineValue) -> EngineResult<Value<'js>> {
        match value.0 {
            Repr::Undefined => Ok(Value::new_undefined(ctx.clone())),
            Repr::Null => Ok(Value::new_null(ctx.clone())),
            Repr::Boolean(flag) => Ok(Value::new_bool(ctx.clone(), flag)),
            Repr::Number(number) => Ok(Value::new_number(ctx.clone(), number)),
            Repr::Cell(id) => {
                let entry = self.slots.borrow().entry(id)?;
                match entry {
                    Entry::Strong(saved) => saved.restore(ctx).map_err(runtime_error),
                    Entry::Weak(saved) => {
                        let weak = saved.restore(ctx).map_err(runtime_error)?;
                        let target: Value = self.check(ctx, self.helper(ctx, "deref")?.call((weak,)))?;
                        if target.is_undefined() {
                            return Err(EngineError::InvalidHandle);
                        }
                        Ok(target)
                    }
                }
            }
        }
    }

    /// Release a temporary slot right away.
    fn discard(&self, value: EngineValue) {
        if let Some(id) = value.as_cell() {
            let released = self.slots.borrow_mut().release(id);
            if released.is_some() {
                self.metrics.borrow_mut().events.record(EngineEvent::HandleReleased, 1);
            }
            drop(released);
        }
    }

    fn pin(&self, value: EngineValue) -> EngineResult<()> {
        match value.as_cell() {
            Some(id) => self.slots.borrow_mut().root(id).map(|_| ()),
            None => Ok(()),
        }
    }

    fn unpin(&self, value: EngineValue) {
        if let Some(id) = value.as_cell() {
            let _ = self.slots.borrow_mut().unroot(id);
        }
    }

    /// Turn a weak slot back into a strong one.
    fn strengthen(&self, value: EngineValue) -> EngineResult<()> {
        let Some(id) = value.as_cell() else {
            return Ok(());
        };
        let previous = self.with_ctx(|ctx| {
            let target = self.restore(ctx, value)?;
            let saved = Persistent::save(ctx, target);
            Ok(self.slots.borrow_mut().replace(id, Entry::Strong(saved)))
        })?;
        drop(previous);
        Ok(())
    }

    fn kind_of(&self, value: EngineValue) -> EngineResult<ValueKind> {
        self.live()?;
        Ok(match value.0 {
            Repr::Undefined => ValueKind::Undefined,
            Repr::Null => ValueKind::Null,
            Repr::Boolean(_) => ValueKind::Boolean,
            Repr::Number(_) => ValueKind::Number,
            Repr::Cell(id) => self.slots.borrow().kind(id)?,
        })
    }

    fn expect_object(&self, value: EngineValue) -> EngineResult<ValueKind> {
        let found = self.kind_of(value)?;
        if !found.is_object() {
            return Err(EngineError::NotAnObject { found });
        }
        Ok(found)
    }

    fn key<'js>(&self, ctx: &Ctx<'js>, key: &PropertyKey) -> EngineResult<Value<'js>> {
        match key {
            PropertyKey::Name(name) => {
                let text = rquickjs::String::from_str(ctx.clone(), name).map_err(runtime_error)?;
                Ok(text.into_value())
            }
            PropertyKey::Index(index) => Ok(Value::new_number(ctx.clone(), *index as f64)),
            PropertyKey::Symbol(symbol) => {
                if self.kind_of(*symbol)? != ValueKind::Symbol {
                    return Err(EngineError::InvalidHandle);
                }
                self.restore(ctx, *symbol)
            }
        }
    }

    /// Call a helper on restored values and adopt the result.
    fn apply_helper<'js>(&self, ctx: &Ctx<'js>, name: &str, arguments: &[EngineValue]) -> EngineResult<Value<'js>> {
        let mut args = rquickjs::function::Args::new(ctx.clone(), arguments.len());
        for argument in arguments {
            args.push_arg(self.restore(ctx, *argument)?).map_err(runtime_error)?;
        }
        self.check(ctx, self.helper(ctx, name)?.call_arg(args))
    }

    // ------------------------------------------------------------------
    // Native functions
    // ------------------------------------------------------------------

    fn native_function<'js>(&self, ctx: &Ctx<'js>, native: NativeFunction) -> EngineResult<Function<'js>> {
        let engine = self.this.clone();
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, args: Rest<Value<'js>>| -> rquickjs::Result<Value<'js>> {
                match engine.upgrade() {
                    Some(engine) => engine.dispatch(&ctx, &native, args.0),
                    None => Ok(Value::new_undefined(ctx)),
                }
            },
        )
        .map_err(runtime_error)
    }

    /// Entry point for every script call into a native function. The wrapper
    /// passes `(constructing, this, callee, ...arguments)`.
    fn dispatch<'js>(
        &self,
        ctx: &Ctx<'js>,
        native: &NativeFunction,
        mut args: Vec<Value<'js>>,
    ) -> rquickjs::Result<Value<'js>> {
        let _scope = self.scope(ctx);
        if args.len() < 3 {
            return Ok(Value::new_undefined(ctx.clone()));
        }
        let arguments = args.split_off(3);
        let mut head = args.into_iter();
        let constructing = head.next().and_then(|flag| flag.as_bool()).unwrap_or(false);
        let (Some(this), Some(callee)) = (head.next(), head.next()) else {
            return Ok(Value::new_undefined(ctx.clone()));
        };

        match self.invoke(ctx, native, constructing, this, callee, arguments) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(thrown)) => Err(ctx.throw(thrown)),
            Err(error) => {
                let message = error.to_string();
                let thrown = self
                    .helper(ctx, "error")
                    .and_then(|make| make.call::<_, Value>(("Error", message.as_str())).map_err(runtime_error))
                    .unwrap_or_else(|_| Value::new_undefined(ctx.clone()));
                Err(ctx.throw(thrown))
            }
        }
    }

    fn invoke<'js>(
        &self,
        ctx: &Ctx<'js>,
        native: &NativeFunction,
        constructing: bool,
        this: Value<'js>,
        callee: Value<'js>,
        arguments: Vec<Value<'js>>,
    ) -> EngineResult<Result<Value<'js>, Value<'js>>> {
        let target = self.adopt(ctx, this)?;
        let callee = self.adopt(ctx, callee)?;
        let values = arguments
            .into_iter()
            .map(|argument| self.adopt(ctx, argument))
            .collect::<EngineResult<Vec<_>>>()?;

        // Everything the native sees stays rooted until it returns.
        let pinned: Vec<EngineValue> = [target, callee].into_iter().chain(values.iter().copied()).collect();
        for value in &pinned {
            self.pin(*value)?;
        }
        let invocation = Invocation {
            target,
            callee,
            arguments: &values,
            constructing,
        };
        let outcome = native(self, &invocation);
        for value in &pinned {
            self.unpin(*value);
        }

        match outcome {
            Ok(value) => Ok(Ok(self.restore(ctx, value)?)),
            Err(thrown) => Ok(Err(self.restore(ctx, thrown)?)),
        }
    }

    // ------------------------------------------------------------------
    // Native records
    // ------------------------------------------------------------------

    /// The record id tagged on `object`, tagging it first when `create` is set.
    fn record_id(&self, object: EngineValue, create: bool) -> EngineResult<Option<u64>> {
        self.expect_object(object)?;
        let id = self.with_ctx(|ctx| {
            let target = self.restore(ctx, object)?;
            let tag: Option<f64> = self.check(ctx, self.helper(ctx, "tagOf")?.call((target.clone(),)))?;
            match tag {
                Some(id) => Ok(Some(id as u64)),
                None if create => {
                    let id = self.next_record.get();
                    self.next_record.set(id + 1);
                    let doom = Doom {
                        id,
                        doomed: self.doomed.clone(),
                    };
                    let marker = Function::new(ctx.clone(), move || doom.id()).map_err(runtime_error)?;
                    self.check(ctx, self.helper(ctx, "attach")?.call::<_, ()>((target, marker)))?;
                    Ok(Some(id))
                }
                None => Ok(None),
            }
        })?;

        if let (Some(id), true) = (id, create) {
            self.records.borrow_mut().entry(id).or_default();
        }
        Ok(id)
    }

    fn release_record(&self, record: NativeRecord) {
        let NativeRecord {
            associated,
            attributes,
            finalizer,
        } = record;
        match finalizer {
            Some(finalizer) => finalizer(self, associated),
            None => drop(associated),
        }
        drop(attributes);
    }

    /// Run finalizers for objects the script heap has reclaimed.
    fn finalize_doomed(&self) -> usize {
        let ids = std::mem::take(&mut *self.doomed.borrow_mut());
        let mut finalized = 0;
        for id in ids {
            let record = self.records.borrow_mut().remove(&id);
            if let Some(record) = record {
                self.release_record(record);
                finalized += 1;
            }
        }
        finalized
    }

    // ------------------------------------------------------------------
    // Collection
    // ------------------------------------------------------------------

    /// Downgrade unrooted object slots to weak references and release
    /// unrooted strings and symbols. Returns the number of released slots.
    fn weaken_unrooted(&self) -> EngineResult<(usize, usize)> {
        let candidates = self.slots.borrow().unrooted_strong();
        if candidates.is_empty() {
            return Ok((0, 0));
        }

        let mut replaced = Vec::with_capacity(candidates.len());
        let (mut released, mut weakened) = (0, 0);
        self.with_ctx(|ctx| {
            let weaken = self.helper(ctx, "weaken")?;
            for (id, kind, strong) in candidates {
                let weak = if kind.is_object() {
                    let target = strong.restore(ctx).map_err(runtime_error)?;
                    let weak: Value = self.check(ctx, weaken.call((target,)))?;
                    (!weak.is_null()).then(|| Persistent::save(ctx, weak))
                } else {
                    drop(strong);
                    None
                };

                let mut slots = self.slots.borrow_mut();
                match weak {
                    Some(weak) => {
                        replaced.extend(slots.replace(id, Entry::Weak(weak)));
                        weakened += 1;
                    }
                    None => {
                        replaced.extend(slots.release(id));
                        released += 1;
                    }
                }
            }
            Ok(())
        })?;
        drop(replaced);
        Ok((released, weakened))
    }

    /// Release weak slots whose targets are gone.
    fn sweep_weak(&self) -> EngineResult<usize> {
        let weak = self.slots.borrow().weak();
        if weak.is_empty() {
            return Ok(0);
        }

        let mut released = Vec::new();
        self.with_ctx(|ctx| {
            let deref = self.helper(ctx, "deref")?;
            for (id, saved) in weak {
                let reference = saved.restore(ctx).map_err(runtime_error)?;
                let target: Value = self.check(ctx, deref.call((reference,)))?;
                if target.is_undefined() {
                    released.extend(self.slots.borrow_mut().release(id));
                }
            }
            Ok(())
        })?;
        let count = released.len();
        drop(released);
        Ok(count)
    }

    /// Cycle collection plus the job queue. Only possible outside any scope:
    /// the runtime is locked inside one.
    fn collect_script_heap(&self) {
        if self.current.get().is_some() {
            tracing::trace!("nested collection, deferring script heap pass");
            return;
        }
        let js = self.js.borrow();
        if let Some(js) = js.as_ref() {
            js.runtime.run_gc();
            while let Ok(true) = js.runtime.execute_pending_job() {}
        }
    }
}

impl Engine for QuickJsEngine {
    fn undefined(&self) -> EngineValue {
        EngineValue::UNDEFINED
    }

    fn null(&self) -> EngineValue {
        EngineValue::NULL
    }

    fn boolean(&self, value: bool) -> EngineValue {
        EngineValue(Repr::Boolean(value))
    }

    fn number(&self, value: f64) -> EngineValue {
        EngineValue(Repr::Number(value))
    }

    fn string(&self, value: &str) -> EngineResult<EngineValue> {
        self.with_ctx(|ctx| {
            let text = rquickjs::String::from_str(ctx.clone(), value).map_err(runtime_error)?;
            self.adopt_as(ctx, text.into_value(), ValueKind::String)
        })
    }

    fn symbol(&self, description: &str) -> EngineResult<EngineValue> {
        self.with_ctx(|ctx| {
            let symbol: Value = self.check(ctx, self.helper(ctx, "symbol")?.call((description,)))?;
            self.adopt_as(ctx, symbol, ValueKind::Symbol)
        })
    }

    fn object(&self, prototype: Option<EngineValue>) -> EngineResult<EngineValue> {
        let prototype = match prototype {
            Some(prototype) => {
                self.expect_object(prototype)?;
                prototype
            }
            None => EngineValue::NULL,
        };
        self.with_ctx(|ctx| {
            let object = self.apply_helper(ctx, "object", &[prototype])?;
            self.adopt_as(ctx, object, ValueKind::Object)
        })
    }

    fn array(&self, elements: &[EngineValue]) -> EngineResult<EngineValue> {
        self.with_ctx(|ctx| {
            let array = rquickjs::Array::new(ctx.clone()).map_err(runtime_error)?;
            for (index, element) in elements.iter().enumerate() {
                array.set(index, self.restore(ctx, *element)?).map_err(runtime_error)?;
            }
            self.adopt_as(ctx, array.into_value(), ValueKind::Array)
        })
    }

    fn function(&self, name: &str, function: NativeFunction) -> EngineResult<EngineValue> {
        self.with_ctx(|ctx| {
            let call = self.native_function(ctx, function)?;
            let wrapper: Value = self.check(ctx, self.helper(ctx, "func")?.call((name, call)))?;
            self.adopt_as(ctx, wrapper, ValueKind::Function)
        })
    }

    fn constructor(&self, name: &str, function: NativeFunction) -> EngineResult<EngineValue> {
        self.with_ctx(|ctx| {
            let call = self.native_function(ctx, function)?;
            let wrapper: Value = self.check(ctx, self.helper(ctx, "ctor")?.call((name, call)))?;
            self.adopt_as(ctx, wrapper, ValueKind::Function)
        })
    }

    fn error(&self, name: &str, message: &str) -> EngineResult<EngineValue> {
        self.with_ctx(|ctx| {
            let error: Value = self.check(ctx, self.helper(ctx, "error")?.call((name, message)))?;
            self.adopt_as(ctx, error, ValueKind::Object)
        })
    }

    fn kind(&self, value: EngineValue) -> EngineResult<ValueKind> {
        self.kind_of(value)
    }

    fn to_string(&self, value: EngineValue) -> EngineResult<String> {
        match value.0 {
            Repr::Undefined => return Ok("undefined".to_string()),
            Repr::Null => return Ok("null".to_string()),
            Repr::Boolean(flag) => return Ok(flag.to_string()),
            _ => {}
        }
        self.enter(|| {
            self.with_ctx(|ctx| {
                let value = self.restore(ctx, value)?;
                self.check(ctx, self.helper(ctx, "text")?.call((value,)))
            })
        })
    }

    fn to_number(&self, value: EngineValue) -> EngineResult<f64> {
        match value.0 {
            Repr::Undefined => Ok(f64::NAN),
            Repr::Null => Ok(0.0),
            Repr::Boolean(flag) => Ok(if flag { 1.0 } else { 0.0 }),
            Repr::Number(number) => Ok(number),
            Repr::Cell(_) => self.enter(|| {
                self.with_ctx(|ctx| {
                    let value = self.restore(ctx, value)?;
                    self.check(ctx, self.helper(ctx, "number")?.call((value,)))
                })
            }),
        }
    }

    fn to_boolean(&self, value: EngineValue) -> EngineResult<bool> {
        match value.0 {
            Repr::Undefined | Repr::Null => Ok(false),
            Repr::Boolean(flag) => Ok(flag),
            Repr::Number(number) => Ok(number != 0.0 && !number.is_nan()),
            Repr::Cell(_) => self.with_ctx(|ctx| {
                let value = self.restore(ctx, value)?;
                self.check(ctx, self.helper(ctx, "truthy")?.call((value,)))
            }),
        }
    }

    fn strict_equals(&self, a: EngineValue, b: EngineValue) -> EngineResult<bool> {
        match (a.as_cell(), b.as_cell()) {
            (None, None) => {
                self.live()?;
                Ok(a == b)
            }
            (Some(x), Some(y)) if x == y => {
                self.kind_of(a)?;
                Ok(true)
            }
            (Some(_), Some(_)) => self.with_ctx(|ctx| {
                let same = self.apply_helper(ctx, "strictEquals", &[a, b])?;
                Ok(same.as_bool().unwrap_or(false))
            }),
            _ => {
                self.kind_of(a)?;
                self.kind_of(b)?;
                Ok(false)
            }
        }
    }

    fn loose_equals(&self, a: EngineValue, b: EngineValue) -> EngineResult<bool> {
        self.enter(|| {
            self.with_ctx(|ctx| {
                let same = self.apply_helper(ctx, "looseEquals", &[a, b])?;
                Ok(same.as_bool().unwrap_or(false))
            })
        })
    }

    fn get(&self, object: EngineValue, key: &PropertyKey) -> EngineResult<EngineValue> {
        match self.kind_of(object)? {
            found @ (ValueKind::Undefined | ValueKind::Null) => return Err(EngineError::NotAnObject { found }),
            _ => {}
        }
        self.enter(|| {
            self.with_ctx(|ctx| {
                let target = self.restore(ctx, object)?;
                let key = self.key(ctx, key)?;
                let value: Value = self.check(ctx, self.helper(ctx, "get")?.call((target, key)))?;
                self.adopt(ctx, value)
            })
        })
    }

    fn set(&self, object: EngineValue, key: &PropertyKey, value: EngineValue) -> EngineResult<()> {
        self.expect_object(object)?;
        self.enter(|| {
            self.with_ctx(|ctx| {
                let target = self.restore(ctx, object)?;
                let key = self.key(ctx, key)?;
                let value = self.restore(ctx, value)?;
                self.check(ctx, self.helper(ctx, "set")?.call::<_, ()>((target, key, value)))
            })
        })
    }

    fn define(&self, object: EngineValue, key: &PropertyKey, descriptor: PropertyDescriptor) -> EngineResult<()> {
        self.expect_object(object)?;
        let defined = self.enter(|| {
            self.with_ctx(|ctx| {
                let target = self.restore(ctx, object)?;
                let name = self.key(ctx, key)?;
                match &descriptor {
                    PropertyDescriptor::Data {
                        value,
                        writable,
                        enumerable,
                        configurable,
                    } => {
                        let value = self.restore(ctx, *value)?;
                        self.check(
                            ctx,
                            self.helper(ctx, "defineData")?
                                .call::<_, bool>((target, name, value, *writable, *enumerable, *configurable)),
                        )
                    }
                    PropertyDescriptor::Accessor {
                        getter,
                        setter,
                        enumerable,
                        configurable,
                    } => {
                        let getter = self.restore(ctx, getter.unwrap_or(EngineValue::UNDEFINED))?;
                        let setter = self.restore(ctx, setter.unwrap_or(EngineValue::UNDEFINED))?;
                        self.check(
                            ctx,
                            self.helper(ctx, "defineAccessor")?
                                .call::<_, bool>((target, name, getter, setter, *enumerable, *configurable)),
                        )
                    }
                }
            })
        })?;

        if !defined {
            return Err(EngineError::NotConfigurable { name: key_name(key) });
        }
        Ok(())
    }

    fn delete(&self, object: EngineValue, key: &PropertyKey) -> EngineResult<bool> {
        self.expect_object(object)?;
        self.enter(|| {
            self.with_ctx(|ctx| {
                let target = self.restore(ctx, object)?;
                let key = self.key(ctx, key)?;
                self.check(ctx, self.helper(ctx, "remove")?.call((target, key)))
            })
        })
    }

    fn own_keys(&self, object: EngineValue) -> EngineResult<Vec<String>> {
        self.expect_object(object)?;
        self.with_ctx(|ctx| {
            let target = self.restore(ctx, object)?;
            self.check(ctx, self.helper(ctx, "keys")?.call((target,)))
        })
    }

    fn array_length(&self, array: EngineValue) -> EngineResult<u32> {
        let found = self.kind_of(array)?;
        if found != ValueKind::Array {
            return Err(EngineError::NotAnObject { found });
        }
        self.with_ctx(|ctx| {
            let target = self.restore(ctx, array)?;
            let length: f64 = self.check(ctx, self.helper(ctx, "length")?.call((target,)))?;
            Ok(length as u32)
        })
    }

    fn prototype(&self, object: EngineValue) -> EngineResult<EngineValue> {
        self.expect_object(object)?;
        self.with_ctx(|ctx| {
            let prototype = self.apply_helper(ctx, "prototypeOf", &[object])?;
            self.adopt(ctx, prototype)
        })
    }

    fn set_prototype(&self, object: EngineValue, prototype: EngineValue) -> EngineResult<()> {
        self.expect_object(object)?;
        let found = self.kind_of(prototype)?;
        if found != ValueKind::Null && !found.is_object() {
            return Err(EngineError::NotAnObject { found });
        }
        let applied = self.with_ctx(|ctx| {
            let applied = self.apply_helper(ctx, "setPrototypeOf", &[object, prototype])?;
            Ok(applied.as_bool().unwrap_or(false))
        })?;
        if !applied {
            return Err(EngineError::PrototypeCycle);
        }
        Ok(())
    }

    fn call(&self, function: EngineValue, this: EngineValue, arguments: &[EngineValue]) -> EngineResult<EngineValue> {
        let found = self.kind_of(function)?;
        if found != ValueKind::Function {
            return Err(EngineError::NotAFunction { found });
        }
        self.enter(|| {
            self.with_ctx(|ctx| {
                let list = self.array(arguments)?;
                let result = self.apply_helper(ctx, "apply", &[function, this, list]);
                self.discard(list);
                self.adopt(ctx, result?)
            })
        })
    }

    fn construct(&self, constructor: EngineValue, arguments: &[EngineValue]) -> EngineResult<EngineValue> {
        let found = self.kind_of(constructor)?;
        if found != ValueKind::Function {
            return Err(EngineError::NotAFunction { found });
        }
        self.enter(|| {
            self.with_ctx(|ctx| {
                let constructible = self.apply_helper(ctx, "isConstructor", &[constructor])?;
                if !constructible.as_bool().unwrap_or(false) {
                    return Err(EngineError::NotAConstructor);
                }
                let list = self.array(arguments)?;
                let result = self.apply_helper(ctx, "construct", &[constructor, list]);
                self.discard(list);
                self.adopt(ctx, result?)
            })
        })
    }

    fn evaluate(&self, source: &str, url: &str) -> EngineResult<EngineValue> {
        tracing::debug!(url, bytes = source.len(), "evaluating script");
        self.enter(|| {
            self.with_ctx(|ctx| {
                let result: rquickjs::Result<Value> = ctx.eval(source);
                match self.check(ctx, result) {
                    Ok(value) => self.adopt(ctx, value),
                    Err(EngineError::Exception { value, message }) => Err(EngineError::Exception {
                        value,
                        message: format!("{} ({})", message, url),
                    }),
                    Err(error) => Err(error),
                }
            })
        })
    }

    fn protect(&self, value: EngineValue) -> EngineResult<()> {
        self.live()?;
        let Some(id) = value.as_cell() else {
            return Ok(());
        };
        let weak = self.slots.borrow_mut().root(id)?;
        if weak {
            if let Err(error) = self.strengthen(value) {
                self.unpin(value);
                return Err(error);
            }
        }
        Ok(())
    }

    fn unprotect(&self, value: EngineValue) -> EngineResult<()> {
        self.live()?;
        match value.as_cell() {
            Some(id) => self.slots.borrow_mut().unroot(id),
            None => Ok(()),
        }
    }

    fn garbage_collect(&self) -> EngineResult<usize> {
        self.live()?;
        self.metrics.borrow_mut().pauses.begin();

        let (released, weakened) = self.weaken_unrooted()?;
        self.collect_script_heap();
        let swept = self.sweep_weak()?;
        let finalized = self.finalize_doomed();
        self.collections.set(self.collections.get() + 1);

        {
            let mut metrics = self.metrics.borrow_mut();
            metrics.pauses.end();
            metrics.events.record(EngineEvent::Collection, 1);
            metrics.events.record(EngineEvent::HandleReleased, released + swept);
            metrics.events.record(EngineEvent::HandleWeakened, weakened);
            metrics.events.record(EngineEvent::Finalized, finalized);
        }
        tracing::trace!(released, weakened, swept, finalized, "collection pass");
        Ok(released + swept)
    }

    fn global_object(&self) -> EngineResult<EngineValue> {
        self.live()?;
        Ok(self.global.get())
    }

    fn set_associated(&self, object: EngineValue, data: Option<Rc<dyn Any>>) -> EngineResult<()> {
        let Some(id) = self.record_id(object, data.is_some())? else {
            return Ok(());
        };
        let previous = match self.records.borrow_mut().get_mut(&id) {
            Some(record) => std::mem::replace(&mut record.associated, data),
            None => None,
        };
        drop(previous);
        Ok(())
    }

    fn associated(&self, object: EngineValue) -> EngineResult<Option<Rc<dyn Any>>> {
        let Some(id) = self.record_id(object, false)? else {
            return Ok(None);
        };
        Ok(self.records.borrow().get(&id).and_then(|record| record.associated.clone()))
    }

    fn set_attribute(&self, object: EngineValue, key: u64, data: Option<Rc<dyn Any>>) -> EngineResult<()> {
        let Some(id) = self.record_id(object, data.is_some())? else {
            return Ok(());
        };
        let previous = match self.records.borrow_mut().get_mut(&id) {
            Some(record) => match data {
                Some(data) => record.attributes.insert(key, data),
                None => record.attributes.remove(&key),
            },
            None => None,
        };
        drop(previous);
        Ok(())
    }

    fn attribute(&self, object: EngineValue, key: u64) -> EngineResult<Option<Rc<dyn Any>>> {
        let Some(id) = self.record_id(object, false)? else {
            return Ok(None);
        };
        Ok(self
            .records
            .borrow()
            .get(&id)
            .and_then(|record| record.attributes.get(&key).cloned()))
    }

    fn set_context_attribute(&self, key: u64, data: Option<Rc<dyn Any>>) -> EngineResult<()> {
        self.live()?;
        let previous = match data {
            Some(data) => self.context_attributes.borrow_mut().insert(key, data),
            None => self.context_attributes.borrow_mut().remove(&key),
        };
        drop(previous);
        Ok(())
    }

    fn context_attribute(&self, key: u64) -> EngineResult<Option<Rc<dyn Any>>> {
        self.live()?;
        Ok(self.context_attributes.borrow().get(&key).cloned())
    }

    fn set_finalizer(&self, object: EngineValue, handler: FinalizeHandler) -> EngineResult<()> {
        let Some(id) = self.record_id(object, true)? else {
            return Ok(());
        };
        let previous = match self.records.borrow_mut().get_mut(&id) {
            Some(record) => record.finalizer.replace(handler),
            None => None,
        };
        drop(previous);
        Ok(())
    }

    fn set_exception_handler(&self, handler: Option<ExceptionHandler>) -> EngineResult<()> {
        self.live()?;
        let previous = std::mem::replace(&mut *self.exception_handler.borrow_mut(), handler);
        drop(previous);
        Ok(())
    }

    fn teardown(&self) {
        if self.destroyed.replace(true) {
            return;
        }

        let mut records: Vec<(u64, NativeRecord)> = self.records.borrow_mut().drain().collect();
        records.sort_by_key(|(id, _)| *id);
        let slots = std::mem::take(&mut *self.slots.borrow_mut());
        let helpers = self.helpers.borrow_mut().take();
        let handler = self.exception_handler.borrow_mut().take();
        let attributes = std::mem::take(&mut *self.context_attributes.borrow_mut());
        self.doomed.borrow_mut().clear();

        let finalized = records.len();
        for (_, record) in records {
            self.release_record(record);
        }
        drop(handler);
        drop(attributes);

        // Host references go before the context and runtime they point into.
        drop(slots);
        drop(helpers);
        if let Ok(mut js) = self.js.try_borrow_mut() {
            drop(js.take());
        }

        tracing::debug!(finalized, "quickjs engine torn down");
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.get()
    }
}

impl Drop for QuickJsEngine {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn native(f: impl Fn(&dyn Engine, &Invocation<'_>) -> Result<EngineValue, EngineValue> + 'static) -> NativeFunction {
        Rc::new(f)
    }

    #[test]
    fn test_collect_unrooted_and_stale_handles() {
        let engine = QuickJsEngine::new().unwrap();
        let kept = engine.object(None).unwrap();
        let dropped = engine.object(None).unwrap();
        engine.protect(kept).unwrap();

        assert_eq!(engine.garbage_collect().unwrap(), 1);
        assert_eq!(engine.kind(kept).unwrap(), ValueKind::Object);
        assert!(matches!(engine.kind(dropped), Err(EngineError::InvalidHandle)));

        engine.unprotect(kept).unwrap();
        assert_eq!(engine.garbage_collect().unwrap(), 1);
        assert!(matches!(engine.kind(kept), Err(EngineError::InvalidHandle)));
    }

    #[test]
    fn test_unrooted_handle_survives_while_reachable() {
        let engine = QuickJsEngine::new().unwrap();
        let global = engine.global_object().unwrap();
        let child = engine.object(None).unwrap();
        engine.set(global, &"child".into(), child).unwrap();

        engine.garbage_collect().unwrap();
        assert_eq!(engine.stats().weak_handles, 1);
        engine.set(child, &"size".into(), engine.number(3.0)).unwrap();
        let read = engine.get(global, &"child".into()).unwrap();
        assert!(engine.strict_equals(read, child).unwrap());

        engine.protect(child).unwrap();
        assert_eq!(engine.stats().weak_handles, 0);
        engine.delete(global, &"child".into()).unwrap();
        engine.garbage_collect().unwrap();
        let size = engine.get(child, &"size".into()).unwrap();
        assert_eq!(engine.to_number(size).unwrap(), 3.0);
    }

    #[test]
    fn test_global_properties_are_reachable() {
        let engine = QuickJsEngine::new().unwrap();
        let global = engine.global_object().unwrap();
        let text = engine.string("hello").unwrap();
        engine.set(global, &"greeting".into(), text).unwrap();

        engine.garbage_collect().unwrap();
        assert!(matches!(engine.kind(text), Err(EngineError::InvalidHandle)));
        let read = engine.get(global, &"greeting".into()).unwrap();
        assert_eq!(engine.to_string(read).unwrap(), "hello");
    }

    #[test]
    fn test_finalizer_runs_once_with_associated_data() {
        let engine = QuickJsEngine::new().unwrap();
        let object = engine.object(None).unwrap();
        let runs = Rc::new(Cell::new(0));

        engine.set_associated(object, Some(Rc::new(7_u32))).unwrap();
        let counter = runs.clone();
        engine
            .set_finalizer(
                object,
                Box::new(move |_, data| {
                    let data = data.and_then(|d| d.downcast::<u32>().ok());
                    assert_eq!(data.as_deref(), Some(&7));
                    counter.set(counter.get() + 1);
                }),
            )
            .unwrap();
        let data = engine.associated(object).unwrap().and_then(|d| d.downcast::<u32>().ok());
        assert_eq!(data.as_deref(), Some(&7));

        engine.garbage_collect().unwrap();
        engine.garbage_collect().unwrap();
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn test_accessors_receive_receiver() {
        let engine = QuickJsEngine::new().unwrap();
        let prototype = engine.object(None).unwrap();
        let stored = Rc::new(Cell::new(0.0));

        let getter = engine
            .function("get size", native(|engine, invocation| {
                engine.get(invocation.target, &"raw".into()).map_err(|_| engine.undefined())
            }))
            .unwrap();
        let sink = stored.clone();
        let setter = engine
            .function("set size", native(move |engine, invocation| {
                let value = invocation.argument(0).unwrap_or(engine.undefined());
                sink.set(engine.to_number(value).unwrap_or(f64::NAN));
                Ok(engine.undefined())
            }))
            .unwrap();
        engine
            .define(prototype, &"size".into(), PropertyDescriptor::accessor(Some(getter), None))
            .unwrap();
        engine
            .define(prototype, &"size".into(), PropertyDescriptor::accessor(None, Some(setter)))
            .unwrap();

        let instance = engine.object(Some(prototype)).unwrap();
        engine.set(instance, &"raw".into(), engine.number(4.0)).unwrap();
        assert_eq!(engine.to_number(engine.get(instance, &"size".into()).unwrap()).unwrap(), 4.0);

        engine.set(instance, &"size".into(), engine.number(9.0)).unwrap();
        assert_eq!(stored.get(), 9.0);
        assert_eq!(engine.own_keys(instance).unwrap(), vec!["raw".to_string()]);
    }

    #[test]
    fn test_construct_uses_prototype() {
        let engine = QuickJsEngine::new().unwrap();
        let ctor = engine
            .constructor("Point", native(|engine, invocation| {
                assert!(invocation.constructing);
                let x = invocation.argument(0).unwrap_or(engine.undefined());
                engine.set(invocation.target, &"x".into(), x).map_err(|_| engine.undefined())?;
                Ok(engine.undefined())
            }))
            .unwrap();

        let point = engine.construct(ctor, &[engine.number(3.0)]).unwrap();
        let prototype = engine.get(ctor, &"prototype".into()).unwrap();
        assert!(engine.strict_equals(engine.prototype(point).unwrap(), prototype).unwrap());
        assert_eq!(engine.to_number(engine.get(point, &"x".into()).unwrap()).unwrap(), 3.0);

        let plain = engine.function("plain", native(|engine, _| Ok(engine.null()))).unwrap();
        assert!(matches!(engine.construct(plain, &[]), Err(EngineError::NotAConstructor)));
        assert!(matches!(
            engine.call(engine.number(1.0), engine.undefined(), &[]),
            Err(EngineError::NotAFunction { found: ValueKind::Number })
        ));
    }

    #[test]
    fn test_exception_reported_once_at_outermost_call() {
        let engine = QuickJsEngine::new().unwrap();
        let reports = Rc::new(RefCell::new(Vec::new()));
        let sink = reports.clone();
        engine
            .set_exception_handler(Some(Rc::new(move |engine, thrown| {
                sink.borrow_mut().push(engine.to_string(thrown).unwrap_or_default());
            })))
            .unwrap();

        let thrower = engine
            .function("thrower", native(|engine, _| {
                Err(engine.error("TypeError", "boom").unwrap_or(engine.undefined()))
            }))
            .unwrap();
        let outer = engine
            .function("outer", native(move |engine, _| {
                engine.call(thrower, engine.undefined(), &[]).map_err(|e| e.thrown().unwrap_or(engine.undefined()))
            }))
            .unwrap();
        engine.protect(thrower).unwrap();

        let result = engine.call(outer, engine.undefined(), &[]);
        assert!(matches!(result, Err(EngineError::Exception { .. })));
        assert_eq!(*reports.borrow(), vec!["TypeError: boom".to_string()]);
    }

    #[test]
    fn test_reentrant_gc_keeps_arguments() {
        let engine = QuickJsEngine::new().unwrap();
        let collecting = engine
            .function("collecting", native(|engine, invocation| {
                engine.garbage_collect().map_err(|_| engine.undefined())?;
                Ok(invocation.argument(0).unwrap_or(engine.undefined()))
            }))
            .unwrap();
        engine.protect(collecting).unwrap();

        let argument = engine.string("survivor").unwrap();
        let result = engine.call(collecting, engine.undefined(), &[argument]).unwrap();
        assert_eq!(engine.to_string(result).unwrap(), "survivor");
    }

    #[test]
    fn test_script_calls_back_into_host() {
        let engine = QuickJsEngine::new().unwrap();
        let global = engine.global_object().unwrap();
        let double = engine
            .function("double", native(|engine, invocation| {
                let n = engine.to_number(invocation.argument(0).unwrap_or(engine.undefined())).unwrap_or(0.0);
                Ok(engine.number(n * 2.0))
            }))
            .unwrap();
        engine.set(global, &"double".into(), double).unwrap();

        let result = engine.evaluate("[1, 2, 3].map((n) => double(n)).join(',')", "map.js").unwrap();
        assert_eq!(engine.to_string(result).unwrap(), "2,4,6");
    }

    #[test]
    fn test_evaluate_reports_syntax_errors_with_url() {
        let engine = QuickJsEngine::new().unwrap();
        let value = engine.evaluate("({ width: 10 }).width + 1", "inline.js").unwrap();
        assert_eq!(engine.to_number(value).unwrap(), 11.0);

        match engine.evaluate("{ nope", "broken.js") {
            Err(EngineError::Exception { value, message }) => {
                assert!(message.contains("SyntaxError"));
                assert!(message.ends_with("(broken.js)"));
                assert_eq!(engine.kind(value).unwrap(), ValueKind::Object);
            }
            other => panic!("expected an exception, got {:?}", other),
        }
    }

    #[test]
    fn test_oversized_array_length_throws() {
        let engine = QuickJsEngine::new().unwrap();
        let array = engine.array(&[engine.number(1.0)]).unwrap();

        let result = engine.set(array, &"length".into(), engine.number(1e20));
        assert!(matches!(result, Err(EngineError::Exception { .. })));
        assert_eq!(engine.array_length(array).unwrap(), 1);

        engine.set(array, &PropertyKey::Index(u32::MAX), engine.boolean(true)).unwrap();
        assert_eq!(engine.array_length(array).unwrap(), 1);
    }

    #[test]
    fn test_arrays_and_coercions() {
        let engine = QuickJsEngine::new().unwrap();
        let one = engine.number(1.0);
        let two = engine.string("2").unwrap();
        let array = engine.array(&[one, two]).unwrap();

        assert_eq!(engine.array_length(array).unwrap(), 2);
        assert_eq!(engine.to_string(array).unwrap(), "1,2");
        engine.set(array, &PropertyKey::Index(3), engine.boolean(true)).unwrap();
        assert_eq!(engine.array_length(array).unwrap(), 4);
        assert_eq!(engine.to_string(array).unwrap(), "1,2,,true");

        assert!(engine.loose_equals(one, engine.boolean(true)).unwrap());
        assert!(engine.loose_equals(two, engine.number(2.0)).unwrap());
        assert!(engine.loose_equals(engine.null(), engine.undefined()).unwrap());
        assert!(!engine.strict_equals(one, engine.string("1").unwrap()).unwrap());
        assert!(engine.strict_equals(two, engine.string("2").unwrap()).unwrap());
        assert_eq!(engine.to_string(engine.number(0.5)).unwrap(), "0.5");
    }

    #[test]
    fn test_non_configurable_define_is_rejected() {
        let engine = QuickJsEngine::new().unwrap();
        let global = engine.global_object().unwrap();
        engine.define(global, &"window".into(), PropertyDescriptor::constant(global)).unwrap();
        let result = engine.define(global, &"window".into(), PropertyDescriptor::value(engine.null()));
        assert!(matches!(result, Err(EngineError::NotConfigurable { .. })));

        // Non-writable assignment is silently ignored.
        engine.set(global, &"window".into(), engine.null()).unwrap();
        assert!(engine.strict_equals(engine.get(global, &"window".into()).unwrap(), global).unwrap());
    }

    #[test]
    fn test_symbol_keys() {
        let engine = QuickJsEngine::new().unwrap();
        let marker = engine.symbol("native").unwrap();
        let object = engine.object(None).unwrap();
        let key = PropertyKey::Symbol(marker);

        engine.set(object, &key, engine.number(1.0)).unwrap();
        assert_eq!(engine.to_number(engine.get(object, &key).unwrap()).unwrap(), 1.0);
        assert!(engine.own_keys(object).unwrap().is_empty());
        assert_eq!(engine.to_string(marker).unwrap(), "Symbol(native)");
    }

    #[test]
    fn test_teardown_finalizes_and_destroys() {
        let engine = QuickJsEngine::new().unwrap();
        let object = engine.object(None).unwrap();
        engine.protect(object).unwrap();
        let finalized = Rc::new(Cell::new(false));
        let flag = finalized.clone();
        engine
            .set_finalizer(object, Box::new(move |engine, _| {
                assert!(engine.is_destroyed());
                flag.set(true);
            }))
            .unwrap();

        engine.teardown();
        assert!(finalized.get());
        assert!(matches!(engine.object(None), Err(EngineError::Destroyed)));
        assert!(matches!(engine.global_object(), Err(EngineError::Destroyed)));
        assert!(matches!(engine.evaluate("1", "late.js"), Err(EngineError::Destroyed)));
    }

    #[test]
    fn test_prototype_cycle_rejected() {
        let engine = QuickJsEngine::new().unwrap();
        let a = engine.object(None).unwrap();
        let b = engine.object(Some(a)).unwrap();
        assert!(matches!(engine.set_prototype(a, b), Err(EngineError::PrototypeCycle)));
        engine.set_prototype(b, engine.null()).unwrap();
        assert!(engine.strict_equals(engine.prototype(b).unwrap(), engine.null()).unwrap());
    }
}
