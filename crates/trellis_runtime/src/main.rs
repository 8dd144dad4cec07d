//! Trellis Runtime
//!
//! Minimal host binary: boots a script context, registers the demo widget
//! class and drives it through the bridge.

use anyhow::{Context as _, Result};
use tracing_subscriber::EnvFilter;
use trellis_bridge::{BridgeSettings, ClassSchema, Context, ImportModule, LockToken, NativeClass, Property, Unit};
use trellis_engine::QuickJsEngine;

/// Demo native view with two stylable properties.
struct Widget {
    label: Property,
    width: Property,
}

impl NativeClass for Widget {
    fn new(_context: &Context) -> Self {
        Widget {
            label: Property::with_string("").on_change(|property| {
                tracing::info!(label = %property.string().unwrap_or_default(), "label changed");
            }),
            width: Property::with_number_unit(0.0, Unit::Px),
        }
    }

    fn describe(schema: &mut ClassSchema<Self>) {
        schema
            .property(
                "label",
                |native, cb| {
                    let value = native.state().label.to_handle(cb.context())?;
                    cb.returns_value(value);
                    Ok(())
                },
                |native, cb| {
                    native.state().label.reset_script(&cb.value(), None)?;
                    Ok(())
                },
            )
            .property(
                "width",
                |native, cb| {
                    let value = native.state().width.to_handle(cb.context())?;
                    cb.returns_value(value);
                    Ok(())
                },
                |native, cb| {
                    native.state().width.reset_script(&cb.value(), None)?;
                    Ok(())
                },
            )
            .function("describe", |native, cb| {
                let state = native.state();
                let text = format!("{} ({})", state.label.string()?, state.width.string()?);
                cb.returns_string(&text)
            });
    }
}

fn load_settings() -> Result<BridgeSettings> {
    match std::env::args().nth(1) {
        Some(path) => {
            let text = std::fs::read_to_string(&path).with_context(|| format!("reading settings from {}", path))?;
            BridgeSettings::from_json(&text).with_context(|| format!("parsing settings in {}", path))
        }
        None => Ok(BridgeSettings::default()),
    }
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("Trellis v{}", trellis_bridge::VERSION);
    let settings = load_settings()?;

    let engine = QuickJsEngine::new()?;
    let context = Context::with_engine(engine.clone(), settings)?;
    context.handle_error(|_, error| {
        tracing::error!("script error: {}", error.string().unwrap_or_default());
    });
    context.install(ImportModule)?;
    context.register_class::<Widget>("Widget")?;

    let widget = context.evaluate(
        r#"
        const Widget = __util__.importClass("Widget");
        const style = { label: "Hello", width: "120px" };
        const widget = new Widget();
        widget.label = style.label;
        widget.width = style.width;
        widget
        "#,
        "app/style.js",
    )?;
    let summary = widget.call_method("describe", &[])?.string()?;
    tracing::info!(%summary, "widget styled");

    // A layout pass holding the width lock wins over script writes.
    if let Some(native) = widget.cast::<Widget>() {
        let layout = LockToken::new();
        let state = native.state();
        state.width.reset_number_with_unit(240.0, Unit::Px, Some(layout));
        tracing::info!(width = state.width.number()?, "layout resolved");
    }
    widget.set_property("width", &context.number(10.0)?)?;
    tracing::info!(width = %widget.property("width")?.string()?, "after script write");

    let freed = context.garbage_collect()?;
    let stats = engine.stats();
    tracing::info!(
        freed,
        live = stats.live_handles,
        rooted = stats.rooted_handles,
        weak = stats.weak_handles,
        collections = stats.collections,
        "engine handles"
    );

    drop(widget);
    context.dispose();
    tracing::info!("Runtime shut down cleanly");
    Ok(())
}
