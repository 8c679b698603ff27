//! Applies a batch of protocol messages to a session.

use std::time::Duration;

use serde_json::json;
use tracing::{debug, warn};
use varsync_core::{Message, ProtocolError};
use varsync_engine::{EngineError, Origin, SessionState};

use crate::sessions::SessionEntry;

/// What a batch produced for the requester besides pushes.
#[derive(Debug, Default, PartialEq)]
pub struct BatchOutcome {
    /// One entry per `create`, `get` or `getObjects`, in message order.
    pub results: Vec<serde_json::Value>,
    /// Longest wait requested by a `poll` in the batch, already capped.
    pub poll: Option<Duration>,
}

impl BatchOutcome {
    /// The `result` field of a response: absent when nothing produced one.
    pub fn result(&self) -> Option<serde_json::Value> {
        (!self.results.is_empty()).then(|| serde_json::Value::Array(self.results.clone()))
    }
}

/// Run one batch as a single executor job, so the refresh that follows it
/// can never interleave with another batch.
pub async fn handle_batch(
    entry: &SessionEntry,
    origin: Origin,
    messages: Vec<serde_json::Value>,
    max_poll_wait: Duration,
) -> Result<BatchOutcome, EngineError> {
    entry
        .execute(move |state| apply_batch(state, &origin, messages, max_poll_wait))
        .await
}

/// Decode and apply each message in order. A failing message becomes an
/// `error` push for the sender and its siblings still run.
pub fn apply_batch(
    state: &mut SessionState,
    origin: &Origin,
    messages: Vec<serde_json::Value>,
    max_poll_wait: Duration,
) -> BatchOutcome {
    let mut outcome = BatchOutcome::default();
    for raw in messages {
        let message = match Message::decode(raw) {
            Ok(message) => message,
            Err(err) => {
                warn!(connection_id = %origin.connection, error = %err, "rejected malformed message");
                state.push_error(origin, None, &err);
                continue;
            }
        };
        let var_id = message.var_id();
        let kind = message.kind();
        if let Err(err) = apply(state, origin, message, &mut outcome, max_poll_wait) {
            debug!(
                connection_id = %origin.connection,
                kind,
                code = err.code(),
                error = %err,
                "message failed"
            );
            state.push_error(origin, var_id, &err);
        }
    }
    state.refresh_and_notify();
    // Hand everything to the dispatcher before the caller drains queues.
    state.flush_outbound();
    outcome
}

fn apply(
    state: &mut SessionState,
    origin: &Origin,
    message: Message,
    outcome: &mut BatchOutcome,
    max_poll_wait: Duration,
) -> Result<(), ProtocolError> {
    match message {
        Message::Create(create) => {
            let id = state.create_variable(origin, create)?;
            outcome.results.push(json!({ "id": id }));
        }
        Message::Update(update) => state.update_variable(origin, update)?,
        Message::Destroy(destroy) => {
            state.destroy_variable(origin, destroy.var_id)?;
        }
        Message::Watch(watch) => state.watch(origin, watch.var_id)?,
        Message::Unwatch(unwatch) => state.unwatch(origin, unwatch.var_id)?,
        Message::Get(get) => {
            require_privilege(origin, "get")?;
            let data = state.get(&get.var_ids);
            outcome.results.push(serde_json::to_value(data).map_err(ProtocolError::malformed)?);
        }
        Message::GetObjects(get) => {
            require_privilege(origin, "getObjects")?;
            let data = state.get_objects(&get.obj_ids);
            outcome.results.push(serde_json::to_value(data).map_err(ProtocolError::malformed)?);
        }
        Message::Poll(poll) => {
            let wait = poll.wait_duration()?.min(max_poll_wait);
            outcome.poll = Some(outcome.poll.map_or(wait, |w| w.max(wait)));
        }
        Message::Error(report) => {
            warn!(
                connection_id = %origin.connection,
                var_id = ?report.var_id,
                code = %report.code,
                description = %report.description,
                "peer reported error"
            );
        }
    }
    Ok(())
}

fn require_privilege(origin: &Origin, what: &str) -> Result<(), ProtocolError> {
    if origin.role.is_privileged() {
        Ok(())
    } else {
        Err(ProtocolError::Unauthorized(format!("{what} is not available to display clients")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use varsync_core::message::Properties;
    use varsync_core::{ConnectionId, ObjectRef, SessionId, Value, VarId};
    use varsync_engine::{ExecutorHandle, Outbound, Role, SessionExecutor, Target, WrapperRegistry};

    const MAX_WAIT: Duration = Duration::from_secs(30);

    fn session() -> SessionExecutor {
        let id = SessionId::new();
        let sid = id.clone();
        SessionExecutor::spawn(&id, move |handle: ExecutorHandle| {
            let mut state =
                SessionState::new(sid, Arc::new(WrapperRegistry::new()), handle, Duration::from_millis(50));
            let root = ObjectRef::with_fields([("name", "fred")]);
            state.create_root(Value::from(root), Properties::new()).unwrap();
            state
        })
    }

    fn origin(id: &str, role: Role) -> Origin {
        Origin::new(ConnectionId::from_raw(id), role)
    }

    fn to(outbound: &[Outbound], id: &str) -> Vec<Message> {
        outbound
            .iter()
            .filter(|o| o.target == Target::Connection(ConnectionId::from_raw(id)))
            .map(|o| o.message.clone())
            .collect()
    }

    #[tokio::test]
    async fn malformed_entry_does_not_stop_siblings() {
        let exec = session();
        let api = origin("api", Role::Api);
        let (outcome, out) = exec
            .execute(move |state| {
                let outcome = apply_batch(
                    state,
                    &api,
                    vec![
                        json!({"type": "explode"}),
                        json!({"type": "create", "data": {"value": 3, "nowatch": true}}),
                    ],
                    MAX_WAIT,
                );
                (outcome, state.take_outbound())
            })
            .await
            .unwrap();

        assert_eq!(outcome.results, vec![json!({"id": 2})]);
        let errors = to(&out, "api");
        assert!(matches!(&errors[0], Message::Error(e) if e.code == "malformed"));
    }

    #[tokio::test]
    async fn update_to_watched_root_yields_one_update() {
        let exec = session();
        let watcher = origin("a", Role::Display);
        let writer = origin("b", Role::Display);

        let w = watcher.clone();
        exec.execute(move |state| {
            apply_batch(state, &w, vec![json!({"type": "watch", "data": {"varId": 1}})], MAX_WAIT);
            state.take_outbound();
        })
        .await
        .unwrap();

        let out = exec
            .execute(move |state| {
                apply_batch(
                    state,
                    &writer,
                    vec![json!({"type": "update", "data": {"varId": 1, "value": {"name": "wilma"}}})],
                    MAX_WAIT,
                );
                state.take_outbound()
            })
            .await
            .unwrap();

        assert_eq!(
            to(&out, "a"),
            vec![Message::update(VarId::ROOT, Some(json!({"name": "wilma"})), Properties::new())]
        );
        assert!(to(&out, "b").is_empty());
    }

    #[tokio::test]
    async fn privileged_reads_are_refused_to_displays() {
        let exec = session();
        let display = origin("d", Role::Display);
        let backend = origin("p", Role::Backend);

        let (refused, out) = exec
            .execute(move |state| {
                let outcome =
                    apply_batch(state, &display, vec![json!({"type": "get", "data": {"varIds": [1]}})], MAX_WAIT);
                (outcome, state.take_outbound())
            })
            .await
            .unwrap();
        assert!(refused.results.is_empty());
        assert!(matches!(&to(&out, "d")[0], Message::Error(e) if e.code == "unauthorized"));

        let allowed = exec
            .execute(move |state| {
                apply_batch(state, &backend, vec![json!({"type": "get", "data": {"varIds": [1, 99]}})], MAX_WAIT)
            })
            .await
            .unwrap();
        assert_eq!(allowed.results, vec![json!([{"id": 1, "value": {"name": "fred"}}])]);
    }

    #[tokio::test]
    async fn poll_wait_is_capped() {
        let exec = session();
        let api = origin("api", Role::Api);
        let outcome = exec
            .execute(move |state| {
                apply_batch(
                    state,
                    &api,
                    vec![
                        json!({"type": "poll", "data": {"wait": "250ms"}}),
                        json!({"type": "poll", "data": {"wait": "5m"}}),
                    ],
                    MAX_WAIT,
                )
            })
            .await
            .unwrap();
        assert_eq!(outcome.poll, Some(MAX_WAIT));
        assert_eq!(outcome.result(), None);
    }

    #[tokio::test]
    async fn failed_path_write_reports_against_the_variable() {
        let exec = session();
        let api = origin("api", Role::Api);
        let out = exec
            .execute(move |state| {
                apply_batch(
                    state,
                    &api,
                    vec![
                        json!({"type": "create", "data": {"id": 5, "properties": {"path": "father.name"}, "nowatch": true}}),
                        json!({"type": "update", "data": {"varId": 5, "value": "bob"}}),
                    ],
                    MAX_WAIT,
                );
                state.take_outbound()
            })
            .await
            .unwrap();
        let errors = to(&out, "api");
        assert!(matches!(
            &errors[..],
            [Message::Error(e)] if e.code == "path-failure" && e.var_id == Some(VarId(5))
        ));
    }
}
