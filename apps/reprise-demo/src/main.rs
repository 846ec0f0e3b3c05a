use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use futures::stream;
use reprise_core::{
    Delta, RuntimeConfig, ScriptContext, ScriptResult, SessionId, Table, Transport, Value,
    WidgetIdentity,
};
use reprise_runtime_std::SessionRegistry;
use serde_json::json;

/// Prints every delta as a JSON line and remembers widget identities by
/// label so the demo can drive them.
#[derive(Default)]
struct ConsoleTransport {
    widgets: Mutex<HashMap<String, WidgetIdentity>>,
}

impl ConsoleTransport {
    fn widget(&self, label: &str) -> Option<WidgetIdentity> {
        self.widgets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(label)
            .cloned()
    }
}

impl Transport for ConsoleTransport {
    fn on_pass_complete(&self, session_id: &SessionId, deltas: Vec<Delta>) {
        let mut widgets = self.widgets.lock().unwrap_or_else(PoisonError::into_inner);
        for delta in &deltas {
            if let Some(widget) = delta.payload.widget() {
                if let Some(label) = widget.args.get("label").and_then(Value::as_str) {
                    widgets.insert(label.to_string(), widget.identity.clone());
                }
            }
            match serde_json::to_string(delta) {
                Ok(line) => println!("{session_id} {line}"),
                Err(err) => log::error!("failed to encode delta {}: {err}", delta.id.0),
            }
        }
    }
}

fn app(ctx: &mut ScriptContext<'_>) -> ScriptResult {
    ctx.markdown("# Reprise demo")?;

    let name = ctx.text_input("Your name", "world")?;
    ctx.markdown(format!("Hello, **{name}**!"))?;

    if ctx.button("Increment")? {
        let count = ctx.state().user_value("count").and_then(Value::as_u64).unwrap_or(0);
        ctx.state_mut().set_user_value("count", json!(count + 1));
    }
    let count = ctx.state().user_value("count").and_then(Value::as_u64).unwrap_or(0);
    ctx.table(Table::new(["counter"]).with_row([json!(count)]))?;

    if count > 0 {
        let words = ["Counting ", "up ", "to ", "the ", "next ", "number."];
        ctx.write_stream(reprise_core::stream::from_stream(stream::iter(words)))?;
    }

    ctx.fragment_every("clock", "250ms", |ctx| {
        let now = ctx.now_millis();
        ctx.markdown(format!("_uptime {now} ms_"))
    })
}

fn load_config() -> RuntimeConfig {
    let Some(path) = std::env::args().nth(1) else {
        return RuntimeConfig::default();
    };
    match RuntimeConfig::load(&path) {
        Ok(config) => config,
        Err(err) => {
            log::warn!("{err}; falling back to defaults");
            RuntimeConfig::default()
        }
    }
}

fn main() {
    if std::env::var_os("RUST_LOG").is_some() {
        reprise_runtime_std::logging::init();
    } else {
        reprise_runtime_std::logging::init_with_filter("info");
    }

    let transport = Arc::new(ConsoleTransport::default());
    let registry = SessionRegistry::new(Arc::new(app), transport.clone(), load_config());

    let session = match registry.create_session() {
        Ok(id) => id,
        Err(err) => {
            log::error!("{err}");
            return;
        }
    };
    thread::sleep(Duration::from_millis(100));

    let interactions = [("Your name", json!("Reprise")), ("Increment", json!(true))];
    for (label, value) in interactions {
        let Some(identity) = transport.widget(label) else {
            log::warn!("widget `{label}` was never shown");
            continue;
        };
        if let Err(err) = registry.submit_event(&session, identity, value) {
            log::error!("{err}");
        }
        thread::sleep(Duration::from_millis(100));
    }

    thread::sleep(Duration::from_millis(600));
    if let Err(err) = registry.destroy_session(&session) {
        log::error!("{err}");
    }
}
