use varsync_core::ProtocolError;

use crate::session::SessionState;

/// Embedded backend logic that owns a session's state.
///
/// `start` runs on the session's executor right after the session is
/// created. It must create the root variable and may schedule timers through
/// [`SessionState::executor`].
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    fn start(&self, state: &mut SessionState) -> Result<(), ProtocolError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;
    use varsync_core::message::Properties;
    use varsync_core::{ObjectRef, SessionId, Value, VarId};

    use crate::executor::SessionExecutor;
    use crate::session::{Origin, Role};
    use crate::wrapper::WrapperRegistry;

    struct Ticker;

    impl Backend for Ticker {
        fn name(&self) -> &str {
            "ticker"
        }

        fn start(&self, state: &mut SessionState) -> Result<(), ProtocolError> {
            let root = ObjectRef::with_fields([("ticks", 0i64)]);
            state.create_root(Value::from(root.clone()), Properties::new())?;
            state.executor().set_interval(Duration::from_millis(100), move |_| {
                let ticks = root.get("ticks").and_then(|v| v.as_i64()).unwrap_or(0);
                root.set("ticks", ticks + 1);
            });
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timer_driven_changes_reach_watchers() {
        let id = SessionId::new();
        let sid = id.clone();
        let exec = SessionExecutor::spawn(&id, move |handle| {
            SessionState::new(sid, Arc::new(WrapperRegistry::new()), handle, Duration::from_millis(50))
        });
        let backend: Arc<dyn Backend> = Arc::new(Ticker);
        let starter = Arc::clone(&backend);
        exec.execute(move |state| starter.start(state)).await.unwrap().unwrap();

        let conn = Origin::new(varsync_core::ConnectionId::from_raw("a"), Role::Display);
        let watcher = conn.clone();
        exec.execute(move |state| {
            state.watch(&watcher, VarId::ROOT).unwrap();
            state.take_outbound();
        })
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(250)).await;
        let out = exec.execute(|state| state.take_outbound()).await.unwrap();
        let last = out.last().map(|o| o.message.clone());
        assert_eq!(
            last,
            Some(varsync_core::Message::update(VarId::ROOT, Some(json!({"ticks": 2})), Properties::new()))
        );
    }
}
