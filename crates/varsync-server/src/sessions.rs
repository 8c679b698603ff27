//! Session lifecycle: creation, lookup, backend binding, connection release
//! and teardown.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use varsync_core::message::SessionBatch;
use varsync_core::{ConnectionId, Message, Priority, ProtocolError, SessionId};
use varsync_engine::{
    Backend, Dispatcher, EngineError, ExecutorHandle, Origin, Outbound, Role, SessionExecutor,
    SessionState, Target, WrapperRegistry,
};

use crate::batcher::MessageBatcher;
use crate::client::ConnectionHub;
use crate::config::ServerConfig;
use crate::outgoing::{FlushPolicy, OutgoingBatcher, Sink};
use crate::pending::PendingQueue;

type BackendSlot = Mutex<Option<(ConnectionId, Arc<PendingQueue>)>>;

/// Routes a finished job's messages: polling peers get them queued at once,
/// duplex peers through a trailing debounce, the external backend through a
/// fixed-delay outbox.
struct SessionDispatcher {
    wire_id: String,
    hub: Arc<ConnectionHub>,
    client_debounce: Duration,
    clients: DashMap<ConnectionId, OutgoingBatcher>,
    backend: OutgoingBatcher,
}

impl SessionDispatcher {
    fn new(wire_id: &str, hub: Arc<ConnectionHub>, slot: Arc<BackendSlot>, config: &ServerConfig) -> Self {
        let session = wire_id.to_string();
        let sink: Sink = Arc::new(move |messages: Vec<Message>| match slot.lock().as_ref() {
            Some((_, queue)) => queue.push(SessionBatch {
                session: session.clone(),
                messages,
            }),
            None => debug!(session = %session, dropped = messages.len(), "no backend bound"),
        });
        Self {
            wire_id: wire_id.to_string(),
            hub,
            client_debounce: config.client_debounce(),
            clients: DashMap::new(),
            backend: OutgoingBatcher::new(FlushPolicy::Fixed(config.backend_batch_delay()), sink),
        }
    }

    fn send_to_client(&self, id: ConnectionId, items: Vec<(Priority, Message)>, user_event: bool) {
        let Some(connection) = self.hub.get(&self.wire_id, &id) else {
            debug!(session = %self.wire_id, connection_id = %id, dropped = items.len(), "no such connection");
            return;
        };
        if connection.is_duplex() {
            self.clients
                .entry(id.clone())
                .or_insert_with(|| {
                    let hub = Arc::clone(&self.hub);
                    let session = self.wire_id.clone();
                    let sink: Sink = Arc::new(move |messages: Vec<Message>| {
                        hub.deliver(&session, &id, messages);
                    });
                    OutgoingBatcher::new(FlushPolicy::Trailing(self.client_debounce), sink)
                })
                .enqueue(items, user_event);
        } else {
            let mut batcher = MessageBatcher::new();
            for (priority, message) in items {
                batcher.push(priority, message);
            }
            self.hub.deliver(&self.wire_id, &id, batcher.flush());
        }
    }

    /// Flush and drop a connection's outbox.
    fn forget(&self, id: &ConnectionId) {
        if let Some((_, outbox)) = self.clients.remove(id) {
            outbox.flush_now();
        }
    }
}

impl Dispatcher for SessionDispatcher {
    fn dispatch(&self, batch: Vec<Outbound>, user_event: bool) {
        let mut to_backend = Vec::new();
        let mut per_client: Vec<(ConnectionId, Vec<(Priority, Message)>)> = Vec::new();
        for out in batch {
            match out.target {
                Target::Backend => to_backend.push((out.priority, out.message)),
                Target::Connection(id) => match per_client.iter_mut().find(|(c, _)| *c == id) {
                    Some((_, items)) => items.push((out.priority, out.message)),
                    None => per_client.push((id, vec![(out.priority, out.message)])),
                },
            }
        }
        if !to_backend.is_empty() {
            self.backend.enqueue(to_backend, user_event);
        }
        for (id, items) in per_client {
            self.send_to_client(id, items, user_event);
        }
    }
}

/// One live session.
pub struct SessionEntry {
    pub id: SessionId,
    /// Compact id vended to clients.
    pub wire_id: String,
    handle: ExecutorHandle,
    executor: tokio::sync::Mutex<Option<SessionExecutor>>,
    dispatcher: Arc<SessionDispatcher>,
    backend: Arc<BackendSlot>,
    last_activity: Mutex<Instant>,
}

impl SessionEntry {
    /// Run `f` on the session's executor.
    pub async fn execute<F, R>(&self, f: F) -> Result<R, EngineError>
    where
        F: FnOnce(&mut SessionState) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.touch();
        self.handle.execute(f).await
    }

    pub fn handle(&self) -> &ExecutorHandle {
        &self.handle
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    pub fn backend_connection(&self) -> Option<ConnectionId> {
        self.backend.lock().as_ref().map(|(id, _)| id.clone())
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    async fn teardown(&self) {
        if let Err(e) = self.handle.execute(|state| state.teardown()).await {
            warn!(session_id = %self.id, error = %e, "teardown job failed");
        }
        self.dispatcher.backend.flush_now();
        if let Some(mut executor) = self.executor.lock().await.take() {
            executor.shutdown().await;
        }
    }
}

/// What one cleanup pass did.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Sweep {
    pub parked: usize,
    pub released: usize,
    pub closed: usize,
}

pub struct SessionManager {
    sessions: DashMap<String, Arc<SessionEntry>>,
    next_id: AtomicU64,
    hub: Arc<ConnectionHub>,
    wrappers: Arc<WrapperRegistry>,
    backend: Option<Arc<dyn Backend>>,
    config: Arc<ServerConfig>,
}

impl SessionManager {
    pub fn new(
        config: Arc<ServerConfig>,
        hub: Arc<ConnectionHub>,
        wrappers: Arc<WrapperRegistry>,
        backend: Option<Arc<dyn Backend>>,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            next_id: AtomicU64::new(1),
            hub,
            wrappers,
            backend,
            config,
        }
    }

    pub fn hub(&self) -> &Arc<ConnectionHub> {
        &self.hub
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Create a session, start its executor and run the embedded backend,
    /// if any.
    pub async fn create(&self) -> Result<Arc<SessionEntry>, EngineError> {
        let id = SessionId::new();
        let wire_id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        let slot: Arc<BackendSlot> = Arc::default();
        let dispatcher = Arc::new(SessionDispatcher::new(
            &wire_id,
            Arc::clone(&self.hub),
            Arc::clone(&slot),
            &self.config,
        ));

        let state_id = id.clone();
        let wrappers = Arc::clone(&self.wrappers);
        let throttle = self.config.refresh_throttle();
        let mut executor = SessionExecutor::spawn(&id, move |handle| {
            SessionState::new(state_id, wrappers, handle, throttle)
        });
        let handle = executor.handle().clone();

        let installed: Arc<dyn Dispatcher> = dispatcher.clone();
        let backend = self.backend.clone();
        let prune_every = self.config.registry_prune_interval();
        let started = handle
            .execute(move |state| -> Result<(), ProtocolError> {
                state.set_dispatcher(installed);
                state.executor().set_interval(prune_every, |state| {
                    let pruned = state.prune_registry();
                    if pruned > 0 {
                        debug!(pruned, "pruned object registry");
                    }
                });
                match backend {
                    Some(backend) => backend.start(state),
                    None => Ok(()),
                }
            })
            .await
            .and_then(|r| r.map_err(EngineError::from));
        if let Err(e) = started {
            executor.shutdown().await;
            return Err(e);
        }

        let entry = Arc::new(SessionEntry {
            id,
            wire_id: wire_id.clone(),
            handle,
            executor: tokio::sync::Mutex::new(Some(executor)),
            dispatcher,
            backend: slot,
            last_activity: Mutex::new(Instant::now()),
        });
        self.sessions.insert(wire_id.clone(), Arc::clone(&entry));
        info!(session_id = %entry.id, wire_id = %wire_id, "session created");
        Ok(entry)
    }

    pub fn get(&self, wire_id: &str) -> Option<Arc<SessionEntry>> {
        self.sessions.get(wire_id).map(|e| Arc::clone(e.value()))
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Make `connection` the session's external backend. Display changes are
    /// relayed to `queue` from then on.
    pub async fn bind_backend(
        &self,
        entry: &SessionEntry,
        connection: &ConnectionId,
        queue: Arc<PendingQueue>,
    ) -> Result<(), EngineError> {
        self.hub
            .attach_polling(&entry.wire_id, connection, Role::Backend, Some(Arc::clone(&queue)));
        let fresh = {
            let mut slot = entry.backend.lock();
            let fresh = slot.as_ref().map_or(true, |(bound, _)| bound != connection);
            *slot = Some((connection.clone(), queue));
            fresh
        };
        if fresh {
            entry.execute(|state| state.bind_backend(true)).await?;
            info!(session_id = %entry.id, connection_id = %connection, "backend bound");
        }
        Ok(())
    }

    /// Release a connection's watches and forget it.
    pub async fn release_connection(&self, wire_id: &str, origin: Origin) {
        self.hub.remove(wire_id, &origin.connection);
        let Some(entry) = self.get(wire_id) else {
            return;
        };
        entry.dispatcher.forget(&origin.connection);

        let unbind = {
            let mut slot = entry.backend.lock();
            let bound = slot.as_ref().is_some_and(|(id, _)| *id == origin.connection);
            if bound {
                *slot = None;
            }
            bound
        };
        let connection = origin.connection.clone();
        let released = entry
            .execute(move |state| {
                if unbind {
                    state.bind_backend(false);
                }
                state.unwatch_all(&origin).len()
            })
            .await;
        match released {
            Ok(released) => {
                debug!(session_id = %entry.id, connection_id = %connection, released, "connection released")
            }
            Err(e) => warn!(session_id = %entry.id, connection_id = %connection, error = %e, "release failed"),
        }
    }

    /// Tear a session down and drop its connections.
    pub async fn close(&self, wire_id: &str) -> bool {
        let Some((_, entry)) = self.sessions.remove(wire_id) else {
            return false;
        };
        entry.teardown().await;
        let dropped = self.hub.remove_session(wire_id).len();
        info!(session_id = %entry.id, wire_id = %wire_id, connections = dropped, "session closed");
        true
    }

    pub async fn close_all(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.close(&id).await;
        }
    }

    /// One cleanup pass: park silent duplex peers, release parked peers past
    /// the grace window and idle request/response peers, close idle sessions.
    pub async fn sweep(&self) -> Sweep {
        let mut sweep = Sweep::default();
        let timeout = self.config.heartbeat_timeout();

        for connection in self.hub.stale(timeout) {
            if connection.is_duplex() {
                if self.hub.park_any(&connection.session, &connection.id) {
                    warn!(connection_id = %connection.id, "display client silent, parked");
                    sweep.parked += 1;
                }
            } else if !connection.is_shared() {
                self.release_connection(&connection.session, Origin::new(connection.id.clone(), connection.role))
                    .await;
                sweep.released += 1;
            }
        }

        for connection in self.hub.expired(self.config.reconnect_grace()) {
            info!(connection_id = %connection.id, "reconnect grace expired");
            self.release_connection(&connection.session, Origin::new(connection.id.clone(), connection.role))
                .await;
            sweep.released += 1;
        }

        if let Some(idle_limit) = self.config.session_timeout() {
            let idle: Vec<String> = self
                .sessions
                .iter()
                .filter(|e| {
                    e.value().idle_for() >= idle_limit
                        && self.hub.connections_for_session(e.key()).is_empty()
                })
                .map(|e| e.key().clone())
                .collect();
            for wire_id in idle {
                if self.close(&wire_id).await {
                    sweep.closed += 1;
                }
            }
        }
        sweep
    }

    /// Run [`sweep`](Self::sweep) on an interval.
    pub fn start_cleanup_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        let every = self.config.cleanup_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let sweep = manager.sweep().await;
                if sweep != Sweep::default() {
                    debug!(?sweep, "session cleanup");
                }
            }
        })
    }
}
