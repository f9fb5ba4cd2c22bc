//! Server-side bookkeeping: connection ids and the live connection map.
//!
//! # Concurrency note
//!
//! Neither type locks anything. A server owns its table and touches it
//! only from the thread that ticks it.

use std::collections::{BTreeMap, BTreeSet};

use peerwire_transport::{ConnectionId, StreamSocket};

use crate::{Connection, ConnectionLimits};

/// Hands out connection ids, reusing freed ones lowest-first.
///
/// Fresh ids come from a counter that starts at `1`. An id is never
/// handed out twice without a [`release`](Self::release) in between.
///
/// ```text
/// next_id() → 1, 2, 3      release(2)      next_id() → 2, 4
/// ```
#[derive(Debug, Default)]
pub struct IdPool {
    /// Highest id ever issued; `0` before the first.
    last: i32,

    /// Released ids awaiting reuse. Ordered, so the lowest pops first.
    free: BTreeSet<i32>,
}

impl IdPool {
    /// Creates a pool whose first id will be `1`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the lowest freed id, or the next never-used one.
    pub fn next_id(&mut self) -> ConnectionId {
        if let Some(id) = self.free.pop_first() {
            return ConnectionId::new(id);
        }
        self.last += 1;
        ConnectionId::new(self.last)
    }

    /// Returns `id` to the pool. Ids this pool never issued, and ids
    /// already free, are ignored.
    pub fn release(&mut self, id: ConnectionId) {
        let raw = id.into_inner();
        if raw < 1 || raw > self.last {
            tracing::warn!(connection_id = %id, "released an id that was never issued");
            return;
        }
        if !self.free.insert(raw) {
            tracing::warn!(connection_id = %id, "released an id twice");
        }
    }

    /// Forgets every issued id; the next id is `1` again.
    pub fn clear(&mut self) {
        self.last = 0;
        self.free.clear();
    }
}

/// Live connections keyed by id.
///
/// Iteration is in ascending id order, so broadcasts and ticks visit
/// connections deterministically.
///
/// ## Lifecycle
///
/// ```text
/// open(socket) ──→ [stored, id taken] ──→ remove(id) ──→ [id free for reuse]
///                          │
///                          ▼ drain()
///                  [table empty, ids restart at 1]
/// ```
///
/// A connection that closes stays in the table until its owner calls
/// [`remove`](Self::remove); closing alone never frees the id.
#[derive(Debug)]
pub struct ConnectionTable<S> {
    connections: BTreeMap<ConnectionId, Connection<S>>,

    /// Kept in step with `connections`: an id is taken exactly while a
    /// connection is stored under it.
    ids: IdPool,
}

impl<S: StreamSocket> ConnectionTable<S> {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self {
            connections: BTreeMap::new(),
            ids: IdPool::new(),
        }
    }

    /// Assigns `socket` an id and stores it as a new connection.
    pub fn open(&mut self, socket: S, limits: ConnectionLimits) -> &mut Connection<S> {
        let id = self.ids.next_id();
        self.connections
            .entry(id)
            .or_insert_with(|| Connection::new(id, socket, limits))
    }

    /// Removes a connection and frees its id for reuse.
    pub fn remove(&mut self, id: ConnectionId) -> Option<Connection<S>> {
        let connection = self.connections.remove(&id)?;
        self.ids.release(id);
        Some(connection)
    }

    /// Looks a connection up by id.
    pub fn get(&self, id: ConnectionId) -> Option<&Connection<S>> {
        self.connections.get(&id)
    }

    /// Looks a connection up by id, mutably.
    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection<S>> {
        self.connections.get_mut(&id)
    }

    /// `true` if `id` names a stored connection.
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    /// Ids of every stored connection, ascending.
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.keys().copied().collect()
    }

    /// Mutable access to every stored connection, ascending by id.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Connection<S>> {
        self.connections.values_mut()
    }

    /// Number of stored connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// `true` when no connection is stored.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Removes every connection and resets id allocation.
    pub fn drain(&mut self) -> Vec<Connection<S>> {
        self.ids.clear();
        std::mem::take(&mut self.connections).into_values().collect()
    }
}

impl<S: StreamSocket> Default for ConnectionTable<S> {
    fn default() -> Self {
        Self::new()
    }
}
