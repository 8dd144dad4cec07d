//! Context modules
//!
//! A module configures a context once at install time and is told about
//! reloads and disposal for the rest of the context's life.

use crate::callback::FunctionCallback;
use crate::class::{ClassSchema, ObjectBuilder};
use crate::context::Context;
use crate::error::BridgeResult;
use crate::native::{Native, NativeClass};

pub trait Module {
    fn name(&self) -> &str;

    fn configure(&mut self, context: &Context) -> BridgeResult<()>;

    fn dispose(&mut self, _context: &Context) {}

    fn will_reload(&mut self, _context: &Context) {}

    fn did_reload(&mut self, _context: &Context) {}
}

/// Exposes the class and object registries to scripts as the global
/// `__util__` object.
#[derive(Debug, Default)]
pub struct ImportModule;

impl Module for ImportModule {
    fn name(&self) -> &str {
        "import"
    }

    fn configure(&mut self, context: &Context) -> BridgeResult<()> {
        let util = ObjectBuilder::<ImportUtil>::new().build(context)?;
        context.global()?.define_constant("__util__", util.handle())?;
        Ok(())
    }
}

/// Backing state of `__util__`.
pub struct ImportUtil;

impl ImportUtil {
    fn import_class(_native: &Native<Self>, cb: &mut FunctionCallback<'_>) -> BridgeResult<()> {
        let id = cb.argument(0).string()?;
        if let Some(class) = cb.context().class(&id) {
            cb.returns_value(class);
        }
        Ok(())
    }

    fn import_object(_native: &Native<Self>, cb: &mut FunctionCallback<'_>) -> BridgeResult<()> {
        let id = cb.argument(0).string()?;
        if let Some(object) = cb.context().object_for(&id) {
            cb.returns_value(object);
        }
        Ok(())
    }
}

impl NativeClass for ImportUtil {
    fn new(_context: &Context) -> Self {
        ImportUtil
    }

    fn describe(schema: &mut ClassSchema<Self>) {
        schema
            .function("importClass", Self::import_class)
            .function("importObject", Self::import_object);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::BridgeSettings;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Empty;

    impl NativeClass for Empty {
        fn new(_context: &Context) -> Self {
            Empty
        }

        fn describe(_schema: &mut ClassSchema<Self>) {}
    }

    #[test]
    fn test_import_util() {
        let context = Context::new(BridgeSettings::default()).unwrap();
        context.install(ImportModule).unwrap();
        let class = context.register_class::<Empty>("Empty").unwrap();

        let util = context.global().unwrap().property("__util__").unwrap();
        let id = context.string("Empty").unwrap();
        let imported = util.call_method("importClass", &[&id]).unwrap();
        assert!(imported.strict_equals(&class).unwrap());

        let missing = context.string("Missing").unwrap();
        assert!(util.call_method("importObject", &[&missing]).unwrap().is_undefined());
        context.dispose();
    }

    struct Recorder {
        events: Rc<RefCell<Vec<&'static str>>>,
    }

    impl Module for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn configure(&mut self, _context: &Context) -> BridgeResult<()> {
            self.events.borrow_mut().push("configure");
            Ok(())
        }

        fn dispose(&mut self, _context: &Context) {
            self.events.borrow_mut().push("dispose");
        }

        fn will_reload(&mut self, _context: &Context) {
            self.events.borrow_mut().push("will_reload");
        }

        fn did_reload(&mut self, _context: &Context) {
            self.events.borrow_mut().push("did_reload");
        }
    }

    #[test]
    fn test_module_lifecycle() {
        let events = Rc::new(RefCell::new(Vec::new()));
        let context = Context::new(BridgeSettings::default()).unwrap();
        context.install(Recorder { events: events.clone() }).unwrap();

        let inner = events.clone();
        context
            .reload(move |_| {
                inner.borrow_mut().push("reload");
                Ok(())
            })
            .unwrap();
        context.dispose();

        assert_eq!(
            *events.borrow(),
            vec!["configure", "will_reload", "reload", "did_reload", "dispose"]
        );
    }

    #[test]
    fn test_dispose_during_reload_reaches_modules_once() {
        let events = Rc::new(RefCell::new(Vec::new()));
        let context = Context::new(BridgeSettings::default()).unwrap();
        context.install(Recorder { events: events.clone() }).unwrap();

        context
            .reload(|context| {
                context.dispose();
                Ok(())
            })
            .unwrap();
        assert!(context.is_disposed());
        context.dispose();

        assert_eq!(*events.borrow(), vec!["configure", "will_reload", "dispose"]);
    }
}
