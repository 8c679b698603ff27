use std::collections::{BTreeMap, BTreeSet, HashMap};

use varsync_core::{ConnectionId, VarId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchTransition {
    /// The tally went 0 -> 1.
    Activated,
    Unchanged,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnwatchTransition {
    /// The tally went 1 -> 0.
    Deactivated,
    Unchanged,
    /// The connection held no watch on the variable.
    NotWatched,
}

/// Per-session watch tallies, broken down by connection.
#[derive(Debug, Default)]
pub struct WatchTable {
    tallies: HashMap<VarId, BTreeMap<ConnectionId, usize>>,
    by_connection: HashMap<ConnectionId, BTreeSet<VarId>>,
}

impl WatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn watch(&mut self, conn: &ConnectionId, var: VarId) -> WatchTransition {
        let per_conn = self.tallies.entry(var).or_default();
        let was_idle = per_conn.is_empty();
        *per_conn.entry(conn.clone()).or_insert(0) += 1;
        self.by_connection.entry(conn.clone()).or_default().insert(var);
        if was_idle {
            WatchTransition::Activated
        } else {
            WatchTransition::Unchanged
        }
    }

    pub fn unwatch(&mut self, conn: &ConnectionId, var: VarId) -> UnwatchTransition {
        let Some(per_conn) = self.tallies.get_mut(&var) else {
            return UnwatchTransition::NotWatched;
        };
        let Some(count) = per_conn.get_mut(conn) else {
            return UnwatchTransition::NotWatched;
        };
        *count -= 1;
        if *count == 0 {
            per_conn.remove(conn);
            if let Some(vars) = self.by_connection.get_mut(conn) {
                vars.remove(&var);
                if vars.is_empty() {
                    self.by_connection.remove(conn);
                }
            }
        }
        if per_conn.is_empty() {
            self.tallies.remove(&var);
            UnwatchTransition::Deactivated
        } else {
            UnwatchTransition::Unchanged
        }
    }

    /// Drop every watch `conn` holds. Returns the variables whose tally
    /// reached zero as a result, ascending.
    pub fn unwatch_all(&mut self, conn: &ConnectionId) -> Vec<VarId> {
        let Some(vars) = self.by_connection.remove(conn) else {
            return Vec::new();
        };
        let mut deactivated = Vec::new();
        for var in vars {
            if let Some(per_conn) = self.tallies.get_mut(&var) {
                per_conn.remove(conn);
                if per_conn.is_empty() {
                    self.tallies.remove(&var);
                    deactivated.push(var);
                }
            }
        }
        deactivated
    }

    /// Forget a destroyed variable. Returns the connections that watched it.
    pub fn remove_variable(&mut self, var: VarId) -> Vec<ConnectionId> {
        let Some(per_conn) = self.tallies.remove(&var) else {
            return Vec::new();
        };
        for conn in per_conn.keys() {
            if let Some(vars) = self.by_connection.get_mut(conn) {
                vars.remove(&var);
                if vars.is_empty() {
                    self.by_connection.remove(conn);
                }
            }
        }
        per_conn.into_keys().collect()
    }

    /// Net tally across all connections.
    pub fn count(&self, var: VarId) -> usize {
        self.tallies
            .get(&var)
            .map(|per_conn| per_conn.values().sum())
            .unwrap_or(0)
    }

    pub fn watchers(&self, var: VarId) -> Vec<ConnectionId> {
        self.tallies
            .get(&var)
            .map(|per_conn| per_conn.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn watched_by(&self, conn: &ConnectionId) -> Vec<VarId> {
        self.by_connection
            .get(conn)
            .map(|vars| vars.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn connections(&self) -> Vec<ConnectionId> {
        let mut conns: Vec<ConnectionId> = self.by_connection.keys().cloned().collect();
        conns.sort();
        conns
    }

    pub fn is_empty(&self) -> bool {
        self.tallies.is_empty()
    }
}
