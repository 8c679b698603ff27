//! Length-prefixed packet protocol.
//!
//! Each frame is a 4-byte big-endian length followed by a JSON batch. The
//! batch must be session-wrapped; `{"session": "new", ...}` creates one.
//! Every request gets exactly one response frame carrying whatever is
//! pending for this connection.

use std::collections::BTreeSet;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec, LengthDelimitedCodecError};
use tracing::{debug, info, info_span, warn, Instrument};
use varsync_core::message::Batch;
use varsync_core::{ConnectionId, Response};
use varsync_engine::{Origin, Role};

use super::TransportError;
use crate::handler;
use crate::pending::PendingQueue;
use crate::sessions::SessionManager;

pub fn codec(max_frame_len: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .big_endian()
        .length_field_length(4)
        .max_frame_length(max_frame_len)
        .new_codec()
}

/// Per-socket state.
struct PacketConnection<'a> {
    id: ConnectionId,
    manager: &'a SessionManager,
    queue: Arc<PendingQueue>,
    /// Sessions this socket has sent batches to.
    sessions: BTreeSet<String>,
}

pub async fn serve<S>(stream: S, manager: &Arc<SessionManager>) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let max_frame_len = manager.config().max_frame_len;
    let mut conn = PacketConnection {
        id: ConnectionId::new(),
        manager,
        queue: Arc::new(PendingQueue::new()),
        sessions: BTreeSet::new(),
    };
    let span = info_span!("packet", connection_id = %conn.id);
    let result = run(Framed::new(stream, codec(max_frame_len)), &mut conn, max_frame_len)
        .instrument(span)
        .await;

    for session in std::mem::take(&mut conn.sessions) {
        manager
            .release_connection(&session, Origin::new(conn.id.clone(), Role::Backend))
            .await;
    }
    info!(connection_id = %conn.id, "packet connection closed");
    result
}

async fn run<S>(
    mut framed: Framed<S, LengthDelimitedCodec>,
    conn: &mut PacketConnection<'_>,
    max_frame_len: usize,
) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(frame) = framed.next().await {
        let frame = frame.map_err(|e| frame_error(e, max_frame_len))?;
        let (mut response, wait) = conn.handle(&frame).await;

        response.pending = match wait {
            Some(wait) => conn.queue.poll(wait).await,
            None => conn.queue.drain(),
        };
        let payload = match serde_json::to_vec(&response) {
            Ok(payload) => payload,
            Err(e) => {
                conn.queue.requeue_front(response.pending);
                return Err(e.into());
            }
        };
        if let Err(e) = framed.send(Bytes::from(payload)).await {
            warn!(requeued = response.pending.len(), "response write failed");
            conn.queue.requeue_front(response.pending);
            return Err(frame_error(e, max_frame_len));
        }
    }
    Ok(())
}

impl PacketConnection<'_> {
    async fn handle(&mut self, frame: &[u8]) -> (Response, Option<Duration>) {
        let batch = match Batch::parse(frame) {
            Ok(batch) => batch,
            Err(e) => {
                warn!(error = %e, "unparseable packet");
                return (Response::error(e.to_string()), None);
            }
        };
        let Some(mut session) = batch.session else {
            return (Response::error("packet batches must name a session"), None);
        };
        if session == "new" {
            match self.manager.create().await {
                Ok(entry) => session = entry.wire_id.clone(),
                Err(e) => return (Response::error(e.to_string()), None),
            }
        }
        let Some(entry) = self.manager.get(&session) else {
            return (Response::error(TransportError::SessionNotFound(session).to_string()), None);
        };

        if self.sessions.insert(session.clone()) {
            if let Err(e) = self
                .manager
                .bind_backend(&entry, &self.id, Arc::clone(&self.queue))
                .await
            {
                return (Response::error(e.to_string()), None);
            }
        } else if let Some(connection) = self.manager.hub().get(&session, &self.id) {
            connection.touch();
        }

        let origin = Origin::new(self.id.clone(), Role::Backend).with_user_event(batch.user_event);
        let max_wait = self.manager.config().max_poll_wait();
        match handler::handle_batch(&entry, origin, batch.messages, max_wait).await {
            Ok(outcome) => {
                debug!(session = %session, results = outcome.results.len(), "batch applied");
                let response = Response {
                    session: Some(session),
                    result: outcome.result(),
                    ..Response::default()
                };
                (response, outcome.poll)
            }
            Err(e) => (Response::error(e.to_string()), None),
        }
    }
}

fn frame_error(e: io::Error, limit: usize) -> TransportError {
    let too_large = e
        .get_ref()
        .is_some_and(|inner| inner.downcast_ref::<LengthDelimitedCodecError>().is_some());
    if too_large {
        TransportError::FrameTooLarge { limit }
    } else {
        TransportError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::AsyncWriteExt;
    use varsync_core::message::Properties;
    use varsync_core::{Message, ObjectRef, Outgoing, ProtocolError, Value, VarId};
    use varsync_engine::{Backend, SessionState, WrapperRegistry};

    use crate::client::ConnectionHub;
    use crate::config::ServerConfig;

    struct Named;

    impl Backend for Named {
        fn name(&self) -> &str {
            "named"
        }

        fn start(&self, state: &mut SessionState) -> Result<(), ProtocolError> {
            let root = ObjectRef::with_fields([("name", "fred")]);
            state.create_root(Value::from(root), Properties::new())?;
            Ok(())
        }
    }

    fn manager() -> Arc<SessionManager> {
        let config = Arc::new(ServerConfig {
            max_frame_len: 1024,
            ..ServerConfig::default()
        });
        Arc::new(SessionManager::new(
            Arc::clone(&config),
            Arc::new(ConnectionHub::new(16)),
            Arc::new(WrapperRegistry::new()),
            Some(Arc::new(Named)),
        ))
    }

    type Client = Framed<tokio::io::DuplexStream, LengthDelimitedCodec>;

    fn connect(manager: &Arc<SessionManager>) -> (Client, tokio::task::JoinHandle<Result<(), TransportError>>) {
        let (client, server) = tokio::io::duplex(4096);
        let manager = Arc::clone(manager);
        let task = tokio::spawn(async move { serve(server, &manager).await });
        (Framed::new(client, codec(1 << 20)), task)
    }

    async fn request(client: &mut Client, body: serde_json::Value) -> Response {
        client.send(Bytes::from(body.to_string())).await.unwrap();
        let frame = client.next().await.unwrap().unwrap();
        serde_json::from_slice(&frame).unwrap()
    }

    #[tokio::test]
    async fn new_session_and_watch_in_one_frame() {
        let manager = manager();
        let (mut client, _task) = connect(&manager);

        let response = request(
            &mut client,
            json!({"session": "new", "messages": [{"type": "watch", "data": {"varId": 1}}]}),
        )
        .await;
        assert_eq!(response.session.as_deref(), Some("1"));
        assert_eq!(response.error, None);
        assert_eq!(
            response.pending,
            vec![Outgoing::Batch(varsync_core::message::SessionBatch {
                session: "1".into(),
                messages: vec![Message::update(VarId::ROOT, Some(json!({"name": "fred"})), Properties::new())],
            })]
        );
        assert!(manager.get("1").unwrap().backend_connection().is_some());
    }

    #[tokio::test]
    async fn envelope_errors_fill_the_error_field() {
        let manager = manager();
        let (mut client, _task) = connect(&manager);

        let missing = request(&mut client, json!([{"type": "watch", "data": {"varId": 1}}])).await;
        assert!(missing.error.unwrap().contains("session"));

        let unknown = request(&mut client, json!({"session": "42", "messages": []})).await;
        assert!(unknown.error.unwrap().contains("unknown session"));

        client.send(Bytes::from_static(b"{not json")).await.unwrap();
        let frame = client.next().await.unwrap().unwrap();
        let garbled: Response = serde_json::from_slice(&frame).unwrap();
        assert!(garbled.error.is_some());
    }

    #[tokio::test]
    async fn create_reports_allocated_id() {
        let manager = manager();
        let (mut client, _task) = connect(&manager);
        let response = request(
            &mut client,
            json!({"session": "new", "messages": [
                {"type": "create", "data": {"value": 1, "nowatch": true}},
                {"type": "create", "data": {"id": 40, "value": 2, "nowatch": true}}
            ]}),
        )
        .await;
        assert_eq!(response.result, Some(json!([{"id": 2}, {"id": 40}])));
    }

    #[tokio::test(start_paused = true)]
    async fn poll_waits_for_relayed_display_changes() {
        let manager = manager();
        let (mut client, _task) = connect(&manager);
        request(&mut client, json!({"session": "new", "messages": []})).await;
        let entry = manager.get("1").unwrap();

        let poller = tokio::spawn(async move {
            let response = request(
                &mut client,
                json!({"session": "1", "messages": [{"type": "poll", "data": {"wait": "5s"}}]}),
            )
            .await;
            (client, response)
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        let display = Origin::new(ConnectionId::from_raw("d"), Role::Display);
        manager.hub().attach_polling("1", &display.connection, Role::Display, None);
        entry.execute(move |s| s.watch(&display, VarId::ROOT)).await.unwrap().unwrap();

        let (_client, response) = poller.await.unwrap();
        assert_eq!(
            response.pending,
            vec![Outgoing::Batch(varsync_core::message::SessionBatch {
                session: "1".into(),
                messages: vec![Message::watch(VarId::ROOT)],
            })]
        );
    }

    #[tokio::test]
    async fn disconnect_releases_watches_and_backend() {
        let manager = manager();
        let (mut client, task) = connect(&manager);
        request(
            &mut client,
            json!({"session": "new", "messages": [{"type": "watch", "data": {"varId": 1}}]}),
        )
        .await;
        let entry = manager.get("1").unwrap();
        assert_eq!(entry.execute(|s| s.watches().count(VarId::ROOT)).await.unwrap(), 1);

        drop(client);
        task.await.unwrap().unwrap();
        assert_eq!(entry.execute(|s| s.watches().count(VarId::ROOT)).await.unwrap(), 0);
        assert_eq!(entry.backend_connection(), None);
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let manager = manager();
        let (mut client, server) = tokio::io::duplex(4096);
        let task = tokio::spawn(async move { serve(server, &manager).await });
        client.write_all(&4096u32.to_be_bytes()).await.unwrap();
        client.write_all(&[b' '; 64]).await.unwrap();
        assert!(matches!(
            task.await.unwrap(),
            Err(TransportError::FrameTooLarge { limit: 1024 })
        ));
    }
}
