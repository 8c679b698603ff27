//! A small embedded backend for trying the server out by hand.

use std::time::Duration;

use varsync_core::message::Properties;
use varsync_core::{ObjectRef, ProtocolError, Value, VarId};
use varsync_engine::{Backend, SessionState};

/// Root object `{counter, step, running, label}` whose counter advances by
/// `step` on every tick while `running` is true. `reset()` sets it back to
/// zero when written.
pub struct DemoBackend {
    tick: Duration,
}

impl DemoBackend {
    pub fn new(tick: Duration) -> Self {
        Self { tick }
    }
}

fn props(pairs: &[(&str, &str)]) -> Properties {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

impl Backend for DemoBackend {
    fn name(&self) -> &str {
        "demo"
    }

    fn start(&self, state: &mut SessionState) -> Result<(), ProtocolError> {
        let root = ObjectRef::with_fields([
            ("counter", Value::from(0i64)),
            ("step", Value::from(1i64)),
            ("running", Value::from(true)),
            ("label", Value::from("varsync demo")),
        ]);
        root.define_method("reset", |obj, arg| {
            if arg.is_some() {
                obj.set("counter", 0i64);
            }
            obj.get("counter").unwrap_or_default()
        });

        state.create_root(Value::from(root.clone()), props(&[("type", "Demo")]))?;
        state.register_standard_name("demo", VarId::ROOT)?;
        for field in ["counter", "step", "running"] {
            state.create_child(VarId::ROOT, Value::Null, props(&[("path", field)]))?;
        }
        state.create_child(VarId::ROOT, Value::Null, props(&[("path", "reset()")]))?;

        state.executor().set_interval(self.tick, move |_| {
            if !matches!(root.get("running"), Some(Value::Bool(true))) {
                return;
            }
            let counter = root.get("counter").and_then(|v| v.as_i64()).unwrap_or(0);
            let step = root.get("step").and_then(|v| v.as_i64()).unwrap_or(1);
            root.set("counter", counter + step);
        });
        tracing::info!(tick_ms = self.tick.as_millis() as u64, "demo backend started");
        Ok(())
    }
}
