//! Per-session state: one variable tree, one watch table, one change
//! tracker. Nothing here is shared between sessions; it is only ever
//! touched from the session's executor worker.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use varsync_core::message::{
    CreateMessage, ObjectData, Properties, UpdateMessage, VariableData,
};
use varsync_core::priority::split_priority;
use varsync_core::{
    ConnectionId, IdRange, Message, ObjId, Priority, ProtocolError, SessionId, Value, VarId,
};

use crate::executor::ExecutorHandle;
use crate::registry::ObjectRegistry;
use crate::resolver;
use crate::store::VariableStore;
use crate::tracker::{ChangeTracker, RefreshSchedule};
use crate::variable::validate_properties;
use crate::watch::{UnwatchTransition, WatchTable, WatchTransition};
use crate::wrapper::WrapperRegistry;

/// What kind of peer a message came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// A display client on a persistent duplex channel.
    Display,
    /// An external backend process on the packet protocol.
    Backend,
    /// The request/response text API.
    Api,
}

impl Role {
    fn id_range(self) -> IdRange {
        match self {
            Self::Display => IdRange::Frontend,
            Self::Backend | Self::Api => IdRange::Backend,
        }
    }

    /// May issue privileged reads.
    pub fn is_privileged(self) -> bool {
        !matches!(self, Self::Display)
    }
}

/// The sender of the message currently being applied.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Origin {
    pub connection: ConnectionId,
    pub role: Role,
    /// The batch came from direct user interaction.
    pub user_event: bool,
}

impl Origin {
    pub fn new(connection: ConnectionId, role: Role) -> Self {
        Self {
            connection,
            role,
            user_event: false,
        }
    }

    /// The session's embedded backend logic.
    pub fn embedded() -> Self {
        Self::new(ConnectionId::from_raw("embedded"), Role::Backend)
    }

    pub fn with_user_event(mut self, user_event: bool) -> Self {
        self.user_event = user_event;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Target {
    Connection(ConnectionId),
    /// The session's external backend connection, if one is bound.
    Backend,
}

/// A message produced while applying a job, waiting for dispatch.
#[derive(Clone, Debug, PartialEq)]
pub struct Outbound {
    pub target: Target,
    pub message: Message,
    pub priority: Priority,
}

impl Outbound {
    /// A value always travels at medium priority. A property-only update
    /// takes the highest priority among its keys.
    pub fn new(target: Target, message: Message) -> Self {
        let priority = match &message {
            Message::Update(update) if update.value.is_none() => update
                .properties
                .keys()
                .map(|k| split_priority(k).1)
                .min()
                .unwrap_or_default(),
            _ => Priority::Medium,
        };
        Self {
            target,
            message,
            priority,
        }
    }
}

/// Receives everything a job produced, once the job has finished.
pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, batch: Vec<Outbound>, user_event: bool);
}

pub struct SessionState {
    session_id: SessionId,
    store: VariableStore,
    watches: WatchTable,
    tracker: ChangeTracker,
    wrappers: Arc<WrapperRegistry>,
    executor: ExecutorHandle,
    outbound: Vec<Outbound>,
    user_event: bool,
    dispatcher: Option<Arc<dyn Dispatcher>>,
    backend_bound: bool,
}

impl SessionState {
    /// Each session gets its own object registry. Reference ids are derived
    /// from session-local variable ids, so a registry is never shared.
    pub fn new(
        session_id: SessionId,
        wrappers: Arc<WrapperRegistry>,
        executor: ExecutorHandle,
        refresh_throttle: Duration,
    ) -> Self {
        Self {
            session_id,
            store: VariableStore::new(),
            watches: WatchTable::new(),
            tracker: ChangeTracker::new(Arc::new(ObjectRegistry::new()), refresh_throttle),
            wrappers,
            executor,
            outbound: Vec::new(),
            user_event: false,
            dispatcher: None,
            backend_bound: false,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn store(&self) -> &VariableStore {
        &self.store
    }

    pub fn watches(&self) -> &WatchTable {
        &self.watches
    }

    pub fn tracker(&self) -> &ChangeTracker {
        &self.tracker
    }

    pub fn wrappers(&self) -> &Arc<WrapperRegistry> {
        &self.wrappers
    }

    pub fn executor(&self) -> &ExecutorHandle {
        &self.executor
    }

    pub fn set_dispatcher(&mut self, dispatcher: Arc<dyn Dispatcher>) {
        self.dispatcher = Some(dispatcher);
    }

    /// Relay display-client changes to an external backend connection.
    pub fn bind_backend(&mut self, bound: bool) {
        self.backend_bound = bound;
    }

    pub fn is_backend_bound(&self) -> bool {
        self.backend_bound
    }

    // ── Embedded backend API ──

    /// Create the session root. Only backend logic does this.
    pub fn create_root(&mut self, value: Value, properties: Properties) -> Result<VarId, ProtocolError> {
        self.store.create(VarId::ROOT, None, value)?;
        if let Err(err) = self.store.update(VarId::ROOT, None, &properties, &self.wrappers) {
            let _ = self.store.destroy(VarId::ROOT);
            return Err(err);
        }
        Ok(VarId::ROOT)
    }

    /// Create a variable from backend logic, allocating from the backend range.
    pub fn create_child(
        &mut self,
        parent_id: VarId,
        value: Value,
        properties: Properties,
    ) -> Result<VarId, ProtocolError> {
        let msg = CreateMessage {
            parent_id: Some(parent_id),
            properties,
            no_watch: true,
            unbound: true,
            ..Default::default()
        };
        let id = self.create_variable(&Origin::embedded(), msg)?;
        if let Some(var) = self.store.get_mut(id) {
            var.set_value(value);
        }
        Ok(id)
    }

    pub fn register_standard_name(&mut self, name: &str, id: VarId) -> Result<(), ProtocolError> {
        self.store.register_standard_name(name, id)
    }

    // ── Protocol operations ──

    pub fn create_variable(&mut self, origin: &Origin, msg: CreateMessage) -> Result<VarId, ProtocolError> {
        self.note_origin(origin);
        let range = origin.role.id_range();
        let id = match msg.id {
            Some(id) => id,
            None => self.store.allocate(range),
        };
        if id.range().is_none() {
            return Err(ProtocolError::InvalidId {
                id,
                reason: "not a variable id".into(),
            });
        }
        if origin.role == Role::Display && (id.is_root() || !range.contains(id)) {
            return Err(ProtocolError::InvalidId {
                id,
                reason: "outside the display client range".into(),
            });
        }
        let parent_id = match msg.parent_id {
            Some(parent) => Some(parent),
            None if id.is_root() => None,
            None => Some(VarId::ROOT),
        };
        let value = msg.value.clone().map(Value::from_json).unwrap_or_default();

        self.store.create(id, parent_id, value)?;
        if let Err(err) = self.store.update(id, None, &msg.properties, &self.wrappers) {
            let _ = self.store.destroy(id);
            return Err(err);
        }
        if let Some(var) = self.store.get_mut(id) {
            var.unbound = msg.unbound;
        }
        debug!(session_id = %self.session_id, var_id = %id, "variable created");

        if origin.role == Role::Display && !msg.unbound {
            self.relay(Message::Create(CreateMessage {
                id: Some(id),
                parent_id,
                ..msg.clone()
            }));
        }
        if !msg.no_watch {
            self.watch(origin, id)?;
        }
        Ok(id)
    }

    pub fn update_variable(&mut self, origin: &Origin, msg: UpdateMessage) -> Result<(), ProtocolError> {
        self.note_origin(origin);
        let id = msg.var_id;
        let var = self.store.get(id).ok_or(ProtocolError::NotFound(id))?;
        if msg.value.is_some() && origin.role != Role::Backend && var.is_read_only() {
            return Err(ProtocolError::ReadOnly(id));
        }
        let path = var.path().cloned();
        let parent_id = var.parent_id;
        validate_properties(&msg.properties, &self.wrappers)?;

        let mut direct_value = None;
        if let Some(raw) = msg.value.clone() {
            let value = Value::from_json(raw);
            match path {
                Some(path) => self.write_path(parent_id, &path, value)?,
                None => direct_value = Some(value),
            }
        }
        self.store.update(id, direct_value, &msg.properties, &self.wrappers)?;
        if let Some(var) = self.store.get_mut(id) {
            var.invalidate();
        }

        if origin.role == Role::Display {
            self.relay(Message::Update(msg.clone()));
        }
        self.echo_update(origin, id, msg.value.is_some(), msg.properties);
        Ok(())
    }

    /// Write through a variable path onto its base's backend value. Nothing
    /// is mutated unless the final assignment succeeds.
    fn write_path(
        &mut self,
        parent_id: Option<VarId>,
        path: &varsync_core::Path,
        value: Value,
    ) -> Result<(), ProtocolError> {
        let (base_id, rest) = self
            .tracker
            .base_of(&self.store, parent_id, path)
            .ok_or_else(|| ProtocolError::path_failure(path.as_str(), "no base variable"))?;
        if rest.is_empty() {
            return Err(ProtocolError::path_failure(path.as_str(), "nothing to assign"));
        }
        let base_unpathed = self
            .store
            .get(base_id)
            .is_some_and(|base| base.path().is_none());
        let mut base = if base_unpathed {
            self.store.get(base_id).map(|b| b.value().clone()).unwrap_or_default()
        } else {
            self.tracker.backend_value(&mut self.store, base_id)
        };

        resolver::write(&mut base, rest, value, path)?;

        if !matches!(base, Value::Object(_)) {
            // Value-typed bases were written on a copy.
            if !base_unpathed {
                return Err(ProtocolError::path_failure(path.as_str(), "base value is not writable"));
            }
            if let Some(base_var) = self.store.get_mut(base_id) {
                *base_var.value_mut() = base;
                base_var.invalidate();
            }
        }
        Ok(())
    }

    /// Tell the other watchers about a connection's change and mark it as
    /// sent so the next refresh does not repeat it.
    fn echo_update(&mut self, origin: &Origin, id: VarId, value_changed: bool, properties: Properties) {
        if !self.tracker.is_registered(id) {
            return;
        }
        let value = self.tracker.register(&mut self.store, id);
        let watchers: Vec<ConnectionId> = self
            .watches
            .watchers(id)
            .into_iter()
            .filter(|conn| *conn != origin.connection)
            .collect();
        if !value_changed && properties.is_empty() {
            return;
        }
        for conn in watchers {
            let message = Message::update(id, value_changed.then(|| value.clone()), properties.clone());
            self.push(Target::Connection(conn), message);
        }
    }

    /// Destroy a variable and its descendants. Returns the removed ids.
    pub fn destroy_variable(&mut self, origin: &Origin, id: VarId) -> Result<Vec<VarId>, ProtocolError> {
        self.note_origin(origin);
        if id.is_root() && origin.role == Role::Display {
            return Err(ProtocolError::Unauthorized("display clients cannot destroy the root".into()));
        }
        let removed = self.store.destroy(id)?;

        let mut notify = BTreeSet::new();
        for var in &removed {
            notify.extend(self.watches.remove_variable(*var));
            self.tracker.unregister(*var);
        }
        notify.remove(&origin.connection);
        for conn in notify {
            self.push(Target::Connection(conn), Message::destroy(id));
        }
        if origin.role == Role::Display {
            self.relay(Message::destroy(id));
        }
        debug!(session_id = %self.session_id, var_id = %id, removed = removed.len(), "variable destroyed");
        Ok(removed)
    }

    /// Add a watch. On the first watch the variable is registered with the
    /// tracker; the requester always receives the current value.
    pub fn watch(&mut self, origin: &Origin, id: VarId) -> Result<(), ProtocolError> {
        self.note_origin(origin);
        if !self.store.contains(id) {
            return Err(ProtocolError::NotFound(id));
        }
        let transition = self.watches.watch(&origin.connection, id);
        self.sync_watch_count(id);
        let value = match transition {
            WatchTransition::Activated => {
                if origin.role == Role::Display {
                    self.relay(Message::watch(id));
                }
                self.tracker.register(&mut self.store, id)
            }
            WatchTransition::Unchanged => match self.tracker.last_sent(id) {
                Some(value) => value.clone(),
                None => self.tracker.current(&mut self.store, id),
            },
        };
        let properties = self
            .store
            .get(id)
            .map(|var| var.properties().clone())
            .unwrap_or_default();
        self.push(
            Target::Connection(origin.connection.clone()),
            Message::update(id, Some(value), properties),
        );
        Ok(())
    }

    pub fn unwatch(&mut self, origin: &Origin, id: VarId) -> Result<(), ProtocolError> {
        self.note_origin(origin);
        match self.watches.unwatch(&origin.connection, id) {
            UnwatchTransition::Deactivated => {
                self.tracker.unregister(id);
                if origin.role == Role::Display {
                    self.relay(Message::unwatch(id));
                }
            }
            UnwatchTransition::Unchanged | UnwatchTransition::NotWatched => {}
        }
        self.sync_watch_count(id);
        Ok(())
    }

    /// Drop every watch a connection holds. Returns the variables that are
    /// no longer watched by anyone.
    pub fn unwatch_all(&mut self, origin: &Origin) -> Vec<VarId> {
        let deactivated = self.watches.unwatch_all(&origin.connection);
        for id in &deactivated {
            self.tracker.unregister(*id);
            self.sync_watch_count(*id);
            if origin.role == Role::Display {
                self.relay(Message::unwatch(*id));
            }
        }
        for id in self.store.ids() {
            self.sync_watch_count(id);
        }
        debug!(
            session_id = %self.session_id,
            connection_id = %origin.connection,
            released = deactivated.len(),
            "connection unwatched"
        );
        deactivated
    }

    /// Privileged read of variables by id. Unknown ids are skipped.
    pub fn get(&mut self, ids: &[VarId]) -> Vec<VariableData> {
        ids.iter()
            .filter_map(|id| {
                let properties = self.store.get(*id)?.properties().clone();
                let value = self.tracker.current(&mut self.store, *id);
                Some(VariableData {
                    id: *id,
                    value,
                    properties,
                })
            })
            .collect()
    }

    /// Privileged read of registered objects by reference id.
    pub fn get_objects(&self, ids: &[ObjId]) -> Vec<ObjectData> {
        ids.iter()
            .filter_map(|id| {
                let obj = self.tracker.registry().get(*id)?;
                Some(ObjectData {
                    id: *id,
                    value: self.tracker.serialize_object(&obj),
                })
            })
            .collect()
    }

    /// Recompute every watched variable and queue an update to each watcher
    /// of a changed one.
    pub fn refresh_and_notify(&mut self) -> usize {
        let updates = self.tracker.refresh(&mut self.store);
        let count = updates.len();
        for update in updates {
            for conn in self.watches.watchers(update.var_id) {
                self.push(
                    Target::Connection(conn),
                    Message::update(update.var_id, Some(update.value.clone()), Properties::new()),
                );
            }
        }
        count
    }

    /// Refresh now, or once the throttle window closes.
    pub fn schedule_refresh(&mut self) {
        match self.tracker.schedule() {
            RefreshSchedule::Now => {
                self.refresh_and_notify();
            }
            RefreshSchedule::After(delay) => {
                self.executor.defer_quiet(delay, |state| {
                    state.refresh_and_notify();
                });
            }
            RefreshSchedule::Pending => {}
        }
    }

    pub fn prune_registry(&self) -> usize {
        self.tracker.registry().prune()
    }

    /// Release every watch, destroy the tree and stop all timers.
    pub fn teardown(&mut self) {
        for conn in self.watches.connections() {
            self.unwatch_all(&Origin::new(conn, Role::Api));
        }
        let tops: Vec<VarId> = self
            .store
            .ids()
            .into_iter()
            .filter(|id| self.store.get(*id).is_some_and(|v| v.parent_id.is_none()))
            .collect();
        for id in tops {
            if let Err(err) = self.store.destroy(id) {
                warn!(session_id = %self.session_id, var_id = %id, error = %err, "teardown destroy failed");
            }
            self.tracker.unregister(id);
        }
        self.executor.cancel_timers();
        self.outbound.clear();
        self.user_event = false;
    }

    // ── Outbound ──

    fn push(&mut self, target: Target, message: Message) {
        self.outbound.push(Outbound::new(target, message));
    }

    fn relay(&mut self, message: Message) {
        if self.backend_bound {
            self.push(Target::Backend, message);
        }
    }

    /// Queue an error for the originating connection.
    pub fn push_error(&mut self, origin: &Origin, var_id: Option<VarId>, err: &ProtocolError) {
        self.push(Target::Connection(origin.connection.clone()), Message::error(var_id, err));
    }

    fn note_origin(&mut self, origin: &Origin) {
        self.user_event |= origin.user_event;
    }

    fn sync_watch_count(&mut self, id: VarId) {
        let count = self.watches.count(id);
        if let Some(var) = self.store.get_mut(id) {
            var.watch_count = count;
        }
    }

    /// Take everything queued so far.
    pub fn take_outbound(&mut self) -> Vec<Outbound> {
        self.user_event = false;
        std::mem::take(&mut self.outbound)
    }

    /// Hand queued messages to the dispatcher. Without one they stay queued.
    pub fn flush_outbound(&mut self) {
        let Some(dispatcher) = self.dispatcher.clone() else {
            return;
        };
        if self.outbound.is_empty() {
            self.user_event = false;
            return;
        }
        let user_event = self.user_event;
        let batch = self.take_outbound();
        dispatcher.dispatch(batch, user_event);
    }
}
