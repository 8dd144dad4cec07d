//! Script context
//!
//! A [`Context`] owns one engine instance and everything the bridge keeps
//! alive inside it: the global object, the native marker symbol, cached
//! sentinel values, the class and object registries, installed modules and
//! the script error handler.

use crate::callback::{self, FunctionCallback};
use crate::class::{ClassBridge, ObjectBuilder};
use crate::error::{BridgeError, BridgeResult};
use crate::module::Module;
use crate::native::NativeClass;
use crate::settings::BridgeSettings;
use crate::value::ValueHandle;
use once_cell::unsync::OnceCell;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::rc::{Rc, Weak};
use trellis_engine::{Engine, EngineValue, QuickJsEngine};

/// Receives every script exception that escapes to the host.
pub type ErrorHandler = Rc<dyn Fn(&Context, &ValueHandle)>;

/// Stable key for the engine's attribute side tables.
pub(crate) fn attribute_key<K: Hash + ?Sized>(key: &K) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

#[derive(Default)]
struct Sentinels {
    null: OnceCell<ValueHandle>,
    undefined: OnceCell<ValueHandle>,
    truthy: OnceCell<ValueHandle>,
    falsy: OnceCell<ValueHandle>,
}

pub(crate) struct ContextInner {
    engine: Rc<dyn Engine>,
    settings: BridgeSettings,
    disposed: Cell<bool>,
    global: RefCell<Option<ValueHandle>>,
    object_prototype: RefCell<Option<ValueHandle>>,
    marker: RefCell<Option<ValueHandle>>,
    sentinels: RefCell<Sentinels>,
    classes: RefCell<HashMap<String, ValueHandle>>,
    objects: RefCell<HashMap<String, ValueHandle>>,
    modules: RefCell<Vec<Box<dyn Module>>>,
    error_handler: RefCell<Option<ErrorHandler>>,
}

/// Shared handle to a script context. Clones refer to the same context.
///
/// A context must be disposed explicitly: native instances living in the
/// engine may hold clones of their context.
#[derive(Clone)]
pub struct Context {
    inner: Rc<ContextInner>,
}

impl Context {
    /// Create a context backed by a fresh QuickJS engine.
    pub fn new(settings: BridgeSettings) -> BridgeResult<Context> {
        Self::with_engine(QuickJsEngine::new()?, settings)
    }

    pub fn with_engine(engine: Rc<dyn Engine>, settings: BridgeSettings) -> BridgeResult<Context> {
        if engine.is_destroyed() {
            return Err(BridgeError::UseAfterDispose);
        }

        let context = Context {
            inner: Rc::new(ContextInner {
                engine,
                settings,
                disposed: Cell::new(false),
                global: RefCell::new(None),
                object_prototype: RefCell::new(None),
                marker: RefCell::new(None),
                sentinels: RefCell::new(Sentinels::default()),
                classes: RefCell::new(HashMap::new()),
                objects: RefCell::new(HashMap::new()),
                modules: RefCell::new(Vec::new()),
                error_handler: RefCell::new(None),
            }),
        };
        context.configure()?;

        tracing::debug!(context = %context.name(), "context created");
        Ok(context)
    }

    fn configure(&self) -> BridgeResult<()> {
        let engine = self.raw_engine();

        let global = self.wrap(engine.global_object()?);
        global.define_constant("global", &global)?;
        global.define_constant("window", &global)?;

        let marker = self.wrap(engine.symbol("native")?);
        global.define_constant("$native", &marker)?;
        let object_prototype = global.property("Object")?.property("prototype")?;

        *self.inner.global.borrow_mut() = Some(global);
        *self.inner.object_prototype.borrow_mut() = Some(object_prototype);
        *self.inner.marker.borrow_mut() = Some(marker);

        let weak = self.downgrade();
        engine.set_exception_handler(Some(Rc::new(move |_engine: &dyn Engine, thrown: EngineValue| {
            if let Some(context) = Context::upgrade(&weak) {
                context.report(thrown);
            }
        })))?;
        Ok(())
    }

    fn report(&self, thrown: EngineValue) {
        let handler = self.inner.error_handler.borrow().clone();
        let error = self.wrap(thrown);
        match handler {
            Some(handler) => handler(self, &error),
            None if self.inner.settings.report_unhandled_exceptions => {
                let message = error.string().unwrap_or_else(|_| "<unprintable>".to_string());
                tracing::error!(context = %self.name(), "unhandled script exception: {}", message);
            }
            None => {}
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<ContextInner> {
        Rc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<ContextInner>) -> Option<Context> {
        weak.upgrade().map(|inner| Context { inner })
    }

    pub(crate) fn raw_engine(&self) -> &dyn Engine {
        &*self.inner.engine
    }

    pub(crate) fn engine_ref(&self) -> BridgeResult<&dyn Engine> {
        if self.is_disposed() {
            return Err(self.disposal_error());
        }
        Ok(self.raw_engine())
    }

    /// The engine behind this context.
    pub fn engine(&self) -> BridgeResult<Rc<dyn Engine>> {
        self.engine_ref()?;
        Ok(self.inner.engine.clone())
    }

    pub fn settings(&self) -> &BridgeSettings {
        &self.inner.settings
    }

    pub fn name(&self) -> &str {
        &self.inner.settings.context_name
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.get()
    }

    /// Whether two contexts are the same.
    pub fn same(&self, other: &Context) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn disposal_error(&self) -> BridgeError {
        if self.inner.settings.strict_disposal {
            panic!("context '{}': value used after dispose", self.name());
        }
        tracing::warn!(context = %self.name(), "value used after dispose");
        BridgeError::UseAfterDispose
    }

    pub(crate) fn marker(&self) -> Option<EngineValue> {
        self.inner.marker.borrow().as_ref().and_then(ValueHandle::raw)
    }

    /// The private symbol under which native-backed objects link to their
    /// delegate.
    pub fn marker_symbol(&self) -> BridgeResult<ValueHandle> {
        self.engine_ref()?;
        self.inner
            .marker
            .borrow()
            .clone()
            .ok_or(BridgeError::UseAfterDispose)
    }

    /// Turn a bridge error into a value the engine can throw.
    pub(crate) fn throw(&self, error: &BridgeError) -> EngineValue {
        let engine = self.raw_engine();
        if let BridgeError::ScriptException { thrown: Some(value), .. } = error {
            return *value;
        }

        let name = match error {
            BridgeError::MissingNativeInstance { .. }
            | BridgeError::TypeMismatch { .. }
            | BridgeError::UseAfterDispose => "TypeError",
            _ => "Error",
        };
        tracing::trace!(%error, "throwing into script");
        engine
            .error(name, &error.to_string())
            .unwrap_or_else(|_| engine.undefined())
    }

    /// Wrap a raw engine value in a protected handle.
    pub fn wrap(&self, value: EngineValue) -> ValueHandle {
        ValueHandle::create(self, value, false, true)
    }

    /// Wrap a raw engine value, substituting the delegate of a native-backed
    /// object.
    pub fn wrap_bridged(&self, value: EngineValue) -> ValueHandle {
        ValueHandle::create(self, value, true, true)
    }

    pub fn global(&self) -> BridgeResult<ValueHandle> {
        self.engine_ref()?;
        self.inner
            .global
            .borrow()
            .clone()
            .ok_or(BridgeError::UseAfterDispose)
    }

    fn sentinel(
        &self,
        slot: impl FnOnce(&Sentinels) -> &OnceCell<ValueHandle>,
        make: impl FnOnce(&dyn Engine) -> EngineValue,
    ) -> BridgeResult<ValueHandle> {
        let engine = self.engine_ref()?;
        let sentinels = self.inner.sentinels.borrow();
        Ok(slot(&sentinels).get_or_init(|| self.wrap(make(engine))).clone())
    }

    pub fn null(&self) -> BridgeResult<ValueHandle> {
        self.sentinel(|s| &s.null, |engine| engine.null())
    }

    pub fn undefined(&self) -> BridgeResult<ValueHandle> {
        self.sentinel(|s| &s.undefined, |engine| engine.undefined())
    }

    pub fn boolean(&self, value: bool) -> BridgeResult<ValueHandle> {
        if value {
            self.sentinel(|s| &s.truthy, |engine| engine.boolean(true))
        } else {
            self.sentinel(|s| &s.falsy, |engine| engine.boolean(false))
        }
    }

    pub fn number(&self, value: f64) -> BridgeResult<ValueHandle> {
        let engine = self.engine_ref()?;
        Ok(self.wrap(engine.number(value)))
    }

    pub fn string(&self, value: &str) -> BridgeResult<ValueHandle> {
        let engine = self.engine_ref()?;
        Ok(self.wrap(engine.string(value)?))
    }

    pub fn symbol(&self, description: &str) -> BridgeResult<ValueHandle> {
        let engine = self.engine_ref()?;
        Ok(self.wrap(engine.symbol(description)?))
    }

    /// A plain object inheriting from `Object.prototype`.
    pub fn object(&self) -> BridgeResult<ValueHandle> {
        let engine = self.engine_ref()?;
        let prototype = self.inner.object_prototype.borrow().as_ref().and_then(ValueHandle::raw);
        Ok(self.wrap(engine.object(prototype)?))
    }

    pub fn array(&self) -> BridgeResult<ValueHandle> {
        let engine = self.engine_ref()?;
        Ok(self.wrap(engine.array(&[])?))
    }

    /// Create a script function backed by a native closure.
    pub fn function<F>(&self, name: Option<&str>, handler: F) -> BridgeResult<ValueHandle>
    where
        F: Fn(&mut FunctionCallback<'_>) -> BridgeResult<()> + 'static,
    {
        self.engine_ref()?;
        callback::function(self, name.unwrap_or(""), handler)
    }

    pub fn object_from_strings<K, V>(&self, entries: impl IntoIterator<Item = (K, V)>) -> BridgeResult<ValueHandle>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let object = self.object()?;
        for (key, value) in entries {
            object.set_property(key.as_ref(), &self.string(value.as_ref())?)?;
        }
        Ok(object)
    }

    pub fn object_from_numbers<K>(&self, entries: impl IntoIterator<Item = (K, f64)>) -> BridgeResult<ValueHandle>
    where
        K: AsRef<str>,
    {
        let object = self.object()?;
        for (key, value) in entries {
            object.set_property(key.as_ref(), &self.number(value)?)?;
        }
        Ok(object)
    }

    /// Evaluate source text. `url` tags diagnostics.
    pub fn evaluate(&self, source: &str, url: &str) -> BridgeResult<ValueHandle> {
        let engine = self.engine_ref()?;
        let result = engine.evaluate(source, url)?;
        Ok(self.wrap(result))
    }

    /// Force a full collection pass. Returns the number of released handles.
    pub fn garbage_collect(&self) -> BridgeResult<usize> {
        let engine = self.engine_ref()?;
        let freed = engine.garbage_collect()?;
        tracing::debug!(context = %self.name(), freed, "collection pass");
        Ok(freed)
    }

    /// Build the constructor for `T` and expose it under `id`. Registering an
    /// id again replaces the previous binding.
    pub fn register_class<T: NativeClass>(&self, id: &str) -> BridgeResult<ValueHandle> {
        let constructor = ClassBridge::<T>::new().build(self, id)?;
        let previous = self
            .inner
            .classes
            .borrow_mut()
            .insert(id.to_string(), constructor.clone());
        tracing::debug!(context = %self.name(), id, replaced = previous.is_some(), "class registered");
        drop(previous);
        Ok(constructor)
    }

    /// Build a singleton object for `T` and expose it under `id`.
    pub fn register_object<T: NativeClass>(&self, id: &str) -> BridgeResult<ValueHandle> {
        let native = ObjectBuilder::<T>::new().build(self)?;
        let object = native.handle().clone();
        let previous = self
            .inner
            .objects
            .borrow_mut()
            .insert(id.to_string(), object.clone());
        tracing::debug!(context = %self.name(), id, replaced = previous.is_some(), "object registered");
        drop(previous);
        Ok(object)
    }

    pub fn class(&self, id: &str) -> Option<ValueHandle> {
        self.inner.classes.borrow().get(id).cloned()
    }

    pub fn object_for(&self, id: &str) -> Option<ValueHandle> {
        self.inner.objects.borrow().get(id).cloned()
    }

    pub fn set_attribute<K: Hash + ?Sized>(&self, key: &K, data: Option<Rc<dyn Any>>) -> BridgeResult<()> {
        let engine = self.engine_ref()?;
        Ok(engine.set_context_attribute(attribute_key(key), data)?)
    }

    pub fn attribute<T: Any, K: Hash + ?Sized>(&self, key: &K) -> Option<Rc<T>> {
        let engine = self.engine_ref().ok()?;
        let data = engine.context_attribute(attribute_key(key)).ok()??;
        data.downcast::<T>().ok()
    }

    /// Configure `module` and keep it until the context is disposed.
    pub fn install(&self, mut module: impl Module + 'static) -> BridgeResult<()> {
        self.engine_ref()?;
        module.configure(self)?;
        tracing::debug!(context = %self.name(), module = module.name(), "module installed");
        self.inner.modules.borrow_mut().push(Box::new(module));
        Ok(())
    }

    /// Install the script exception handler, replacing any previous one.
    pub fn handle_error(&self, handler: impl Fn(&Context, &ValueHandle) + 'static) {
        let previous = self.inner.error_handler.replace(Some(Rc::new(handler)));
        drop(previous);
    }

    /// Run `reload` between the modules' reload notifications, then collect.
    pub fn reload(&self, reload: impl FnOnce(&Context) -> BridgeResult<()>) -> BridgeResult<()> {
        self.engine_ref()?;
        let mut modules = std::mem::take(&mut *self.inner.modules.borrow_mut());
        for module in modules.iter_mut() {
            module.will_reload(self);
        }

        let result = reload(self);
        if self.is_disposed() {
            // Disposed mid-reload: these modules missed the dispose pass.
            for mut module in modules {
                module.dispose(self);
            }
            tracing::debug!(context = %self.name(), "context disposed during reload");
            return result;
        }
        self.garbage_collect()?;

        for module in modules.iter_mut() {
            module.did_reload(self);
        }
        let mut installed = self.inner.modules.borrow_mut();
        let added = std::mem::replace(&mut *installed, modules);
        installed.extend(added);
        result
    }

    /// Release everything the context keeps alive and tear the engine down.
    /// Idempotent.
    pub fn dispose(&self) {
        if self.is_disposed() {
            return;
        }

        let modules = std::mem::take(&mut *self.inner.modules.borrow_mut());
        for mut module in modules {
            module.dispose(self);
        }

        let objects = std::mem::take(&mut *self.inner.objects.borrow_mut());
        let classes = std::mem::take(&mut *self.inner.classes.borrow_mut());
        drop(objects);
        drop(classes);

        let sentinels = std::mem::take(&mut *self.inner.sentinels.borrow_mut());
        drop(sentinels);

        let global = self.inner.global.borrow_mut().take();
        let object_prototype = self.inner.object_prototype.borrow_mut().take();
        let marker = self.inner.marker.borrow_mut().take();
        drop(global);
        drop(object_prototype);
        drop(marker);

        if self.inner.settings.collect_on_dispose {
            if let Err(error) = self.garbage_collect() {
                tracing::warn!(%error, "final collection failed");
            }
        }

        let handler = self.inner.error_handler.borrow_mut().take();
        drop(handler);
        if let Err(error) = self.raw_engine().set_exception_handler(None) {
            tracing::trace!(%error, "exception handler already gone");
        }

        self.inner.disposed.set(true);
        self.raw_engine().teardown();
        tracing::debug!(context = %self.name(), "context disposed");
    }
}
