use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use varsync_core::message::SessionBatch;
use varsync_core::{ConnectionId, Message, Outgoing};
use varsync_engine::Role;

use crate::pending::PendingQueue;

/// How a connection currently receives messages.
enum Carrier {
    /// Live duplex channel; messages are pushed as soon as they flush.
    Duplex(mpsc::Sender<String>),
    /// Request/response peer; messages wait in the backlog for the next
    /// response.
    Polling,
    /// Duplex peer that dropped and may still reconnect. Messages wait in
    /// the backlog.
    Parked { since: Instant },
}

/// One peer attached to one session.
pub struct Connection {
    pub id: ConnectionId,
    pub session: String,
    pub role: Role,
    carrier: Mutex<Carrier>,
    backlog: Arc<PendingQueue>,
    /// Wrap deliveries as `{session, messages}` (shared packet transports).
    session_wrapped: bool,
    last_seen: Mutex<Instant>,
    epoch: AtomicU64,
}

impl Connection {
    fn new(
        id: ConnectionId,
        session: &str,
        role: Role,
        carrier: Carrier,
        backlog: Arc<PendingQueue>,
        session_wrapped: bool,
    ) -> Self {
        Self {
            id,
            session: session.to_string(),
            role,
            carrier: Mutex::new(carrier),
            backlog,
            session_wrapped,
            last_seen: Mutex::new(Instant::now()),
            epoch: AtomicU64::new(0),
        }
    }

    pub fn backlog(&self) -> &Arc<PendingQueue> {
        &self.backlog
    }

    pub fn is_duplex(&self) -> bool {
        matches!(*self.carrier.lock(), Carrier::Duplex(_))
    }

    pub fn is_parked(&self) -> bool {
        matches!(*self.carrier.lock(), Carrier::Parked { .. })
    }

    /// Backed by a queue shared with other sessions on the same socket.
    pub fn is_shared(&self) -> bool {
        self.session_wrapped
    }

    pub fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    fn wrap(&self, messages: Vec<Message>) -> Vec<Outgoing> {
        if self.session_wrapped {
            vec![Outgoing::Batch(SessionBatch {
                session: self.session.clone(),
                messages,
            })]
        } else {
            messages.into_iter().map(Outgoing::Message).collect()
        }
    }
}

type Key = (String, ConnectionId);

/// Every connection of every session, keyed by (wire session id,
/// connection id) so client-chosen connection ids never collide across
/// sessions.
pub struct ConnectionHub {
    connections: DashMap<Key, Arc<Connection>>,
    max_send_queue: usize,
}

/// Result of attaching a duplex carrier.
pub struct DuplexAttachment {
    pub connection: Arc<Connection>,
    pub rx: mpsc::Receiver<String>,
    /// Identifies this attachment when parking, so a late disconnect of a
    /// replaced socket cannot park its successor.
    pub epoch: u64,
    pub resumed: bool,
}

impl ConnectionHub {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            connections: DashMap::new(),
            max_send_queue,
        }
    }

    /// Attach a live duplex channel. An existing connection with the same id
    /// is resumed and its backlog is delivered first.
    pub fn attach_duplex(&self, session: &str, id: &ConnectionId, role: Role) -> DuplexAttachment {
        let (tx, rx) = mpsc::channel(self.max_send_queue.max(1));
        let key = (session.to_string(), id.clone());
        let existing = self.connections.get(&key).map(|c| Arc::clone(c.value()));

        let (connection, resumed) = match existing {
            Some(connection) => {
                *connection.carrier.lock() = Carrier::Duplex(tx.clone());
                (connection, true)
            }
            None => {
                let connection = Arc::new(Connection::new(
                    id.clone(),
                    session,
                    role,
                    Carrier::Duplex(tx.clone()),
                    Arc::new(PendingQueue::new()),
                    false,
                ));
                self.connections.insert(key, Arc::clone(&connection));
                (connection, false)
            }
        };
        connection.touch();
        let epoch = connection.epoch.fetch_add(1, Ordering::SeqCst) + 1;

        let backlog = connection.backlog.drain();
        if !backlog.is_empty() {
            match serde_json::to_string(&backlog) {
                Ok(text) => {
                    if tx.try_send(text).is_err() {
                        connection.backlog.requeue_front(backlog);
                    }
                }
                Err(e) => tracing::error!(connection_id = %id, error = %e, "failed to encode backlog"),
            }
        }

        DuplexAttachment {
            connection,
            rx,
            epoch,
            resumed,
        }
    }

    /// Attach (or refresh) a request/response connection. A shared queue can
    /// be supplied for transports that serve several sessions on one socket.
    pub fn attach_polling(
        &self,
        session: &str,
        id: &ConnectionId,
        role: Role,
        shared: Option<Arc<PendingQueue>>,
    ) -> Arc<Connection> {
        let key = (session.to_string(), id.clone());
        let connection = self
            .connections
            .entry(key)
            .or_insert_with(|| {
                let session_wrapped = shared.is_some();
                let backlog = shared.unwrap_or_default();
                Arc::new(Connection::new(
                    id.clone(),
                    session,
                    role,
                    Carrier::Polling,
                    backlog,
                    session_wrapped,
                ))
            })
            .value()
            .clone();
        connection.touch();
        connection
    }

    pub fn get(&self, session: &str, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections
            .get(&(session.to_string(), id.clone()))
            .map(|c| Arc::clone(c.value()))
    }

    /// Hand flushed messages to a connection. Duplex peers receive one JSON
    /// array per call; everyone else gets them queued. Returns false when
    /// the connection is unknown or its channel is full.
    pub fn deliver(&self, session: &str, id: &ConnectionId, messages: Vec<Message>) -> bool {
        if messages.is_empty() {
            return true;
        }
        let Some(connection) = self.get(session, id) else {
            tracing::debug!(connection_id = %id, dropped = messages.len(), "no such connection");
            return false;
        };
        let mut carrier = connection.carrier.lock();
        let tx = match &*carrier {
            Carrier::Duplex(tx) => tx.clone(),
            Carrier::Polling | Carrier::Parked { .. } => {
                connection.backlog.push_all(connection.wrap(messages));
                return true;
            }
        };
        let text = match serde_json::to_string(&messages) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(connection_id = %id, error = %e, "failed to encode batch");
                return false;
            }
        };
        match tx.try_send(text) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(text)) => {
                tracing::warn!(
                    connection_id = %id,
                    msg_len = text.len(),
                    "send queue full, dropping batch"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                *carrier = Carrier::Parked {
                    since: Instant::now(),
                };
                drop(carrier);
                connection.backlog.push_all(connection.wrap(messages));
                true
            }
        }
    }

    /// Park a duplex connection whose carrier went away. Ignored if the
    /// connection has been re-attached since `epoch`.
    pub fn park(&self, session: &str, id: &ConnectionId, epoch: u64) -> bool {
        let Some(connection) = self.get(session, id) else {
            return false;
        };
        if connection.epoch.load(Ordering::SeqCst) != epoch {
            return false;
        }
        let mut carrier = connection.carrier.lock();
        if matches!(*carrier, Carrier::Duplex(_)) {
            *carrier = Carrier::Parked {
                since: Instant::now(),
            };
            return true;
        }
        false
    }

    pub fn record_pong(&self, session: &str, id: &ConnectionId) {
        if let Some(connection) = self.get(session, id) {
            connection.touch();
        }
    }

    /// Parked connections whose grace window has run out.
    pub fn expired(&self, grace: Duration) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .filter(|entry| {
                matches!(*entry.value().carrier.lock(), Carrier::Parked { since } if since.elapsed() >= grace)
            })
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Attached connections that have not been heard from within `timeout`.
    pub fn stale(&self, timeout: Duration) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .filter(|entry| {
                let connection = entry.value();
                !connection.is_parked() && connection.idle_for() >= timeout
            })
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Park a duplex connection regardless of epoch.
    pub fn park_any(&self, session: &str, id: &ConnectionId) -> bool {
        match self.get(session, id) {
            Some(connection) => {
                let epoch = connection.epoch.load(Ordering::SeqCst);
                self.park(session, id, epoch)
            }
            None => false,
        }
    }

    pub fn remove(&self, session: &str, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections
            .remove(&(session.to_string(), id.clone()))
            .map(|(_, c)| c)
    }

    pub fn remove_session(&self, session: &str) -> Vec<Arc<Connection>> {
        let keys: Vec<Key> = self
            .connections
            .iter()
            .filter(|entry| entry.key().0 == session)
            .map(|entry| entry.key().clone())
            .collect();
        keys.into_iter()
            .filter_map(|key| self.connections.remove(&key).map(|(_, c)| c))
            .collect()
    }

    pub fn connections_for_session(&self, session: &str) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|entry| entry.key().0 == session)
            .map(|entry| entry.key().1.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }
}
