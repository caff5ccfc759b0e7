// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Geographically indexed storage of known nodes.
//!
//! Two implementations share the same query logic: [`InMemorySpatialDb`]
//! holds everything in a map, [`SqliteSpatialDb`] adds a write-through
//! sqlite table so the world view survives restarts.  Spatial predicates
//! are evaluated in Rust (haversine), never in SQL.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rusqlite::{params, Connection};
use tracing::debug;

use crate::clock::Clock;
use crate::error::OverlayError;
use crate::events::ListenerRegistry;
use crate::geo::{self, GpsLocation};
use crate::ids::NodeId;
use crate::peer::{NeighbourFilter, NodeDbEntry, NodeInfo, NodeRelation, NodeRole};

/// Interface of the spatial store.  All operations are in-memory and
/// non-suspending; mutations serialize under a single-writer discipline and
/// publish change events after the write lock is released.
pub trait SpatialDatabase: Send + Sync {
    /// The unique Self entry.
    fn this_node(&self) -> NodeDbEntry;

    fn load(&self, id: &NodeId) -> Option<NodeDbEntry>;

    /// Insert a new entry.  `expires` sets a fresh expiry deadline; pass
    /// `false` for entries that must outlive the expiration pass.
    fn store(&self, entry: NodeDbEntry, expires: bool) -> Result<(), OverlayError>;

    /// Replace an existing entry, refreshing its deadline when `expires`.
    fn update(&self, entry: NodeDbEntry, expires: bool) -> Result<(), OverlayError>;

    fn remove(&self, id: &NodeId) -> Result<(), OverlayError>;

    /// Drop every entry whose deadline has passed, publishing a removal
    /// event for each.
    fn expire_old_nodes(&self);

    /// Entry count, optionally restricted to one relation.  The Self entry
    /// counts as relation [`NodeRelation::SelfNode`].
    fn get_node_count(&self, relation: Option<NodeRelation>) -> usize;

    /// Remote entries with the given role, any relation.
    fn get_nodes_by_role(&self, role: NodeRole) -> Vec<NodeDbEntry>;

    /// Neighbours ordered by distance from Self, ascending.
    fn get_neighbours_by_distance(&self) -> Vec<NodeDbEntry>;

    /// At most `max_node_count` entries within `radius_km` of `center`,
    /// ascending by distance, ties broken by node id.  Includes the Self
    /// entry; `filter` includes or excludes neighbours.
    fn get_closest_by_distance(
        &self,
        center: &GpsLocation,
        radius_km: f64,
        max_node_count: usize,
        filter: NeighbourFilter,
    ) -> Vec<NodeDbEntry>;

    /// Uniform sample of remote entries.
    fn get_random_nodes(&self, max_node_count: usize, filter: NeighbourFilter)
        -> Vec<NodeDbEntry>;

    fn distance_km(&self, a: &GpsLocation, b: &GpsLocation) -> f64 {
        geo::distance_km(a, b)
    }

    fn listener_registry(&self) -> &ListenerRegistry;
}

enum Change {
    Added(NodeDbEntry),
    Updated(NodeDbEntry),
    Removed(NodeDbEntry),
}

pub struct InMemorySpatialDb {
    self_id: NodeId,
    entries: RwLock<HashMap<NodeId, NodeDbEntry>>,
    listeners: ListenerRegistry,
    clock: Arc<dyn Clock>,
    entry_expiration: Duration,
    rng: Mutex<StdRng>,
}

impl InMemorySpatialDb {
    pub fn new(
        self_info: NodeInfo,
        clock: Arc<dyn Clock>,
        entry_expiration: Duration,
    ) -> Result<Arc<Self>, OverlayError> {
        Self::with_seed(self_info, clock, entry_expiration, None)
    }

    /// Seedable constructor so random sampling is deterministic under test.
    pub fn with_seed(
        self_info: NodeInfo,
        clock: Arc<dyn Clock>,
        entry_expiration: Duration,
        seed: Option<u64>,
    ) -> Result<Arc<Self>, OverlayError> {
        self_info.location.validate()?;
        let self_id = self_info.id().clone();
        let mut entries = HashMap::new();
        entries.insert(self_id.clone(), NodeDbEntry::self_entry(self_info));
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Arc::new(Self {
            self_id,
            entries: RwLock::new(entries),
            listeners: ListenerRegistry::default(),
            clock,
            entry_expiration,
            rng: Mutex::new(rng),
        }))
    }

    fn deadline(&self, expires: bool) -> Option<u64> {
        expires.then(|| self.clock.now_unix() + self.entry_expiration.as_secs())
    }

    /// Insert a row as-is, preserving its deadline and without publishing.
    /// Used when reloading persisted entries on open.
    pub(crate) fn insert_raw(&self, entry: NodeDbEntry) {
        self.entries
            .write()
            .expect("spatial db lock poisoned")
            .insert(entry.id().clone(), entry);
    }

    fn publish(&self, changes: Vec<Change>) {
        for change in changes {
            match change {
                Change::Added(entry) => self.listeners.publish_added(&entry),
                Change::Updated(entry) => self.listeners.publish_updated(&entry),
                Change::Removed(entry) => self.listeners.publish_removed(&entry),
            }
        }
    }

    /// Remove expired entries and report them, so the sqlite wrapper can
    /// mirror the deletion.
    fn expire_collect(&self) -> Vec<NodeDbEntry> {
        let now = self.clock.now_unix();
        let removed = {
            let mut entries = self.entries.write().expect("spatial db lock poisoned");
            let expired: Vec<NodeId> = entries
                .values()
                .filter(|entry| entry.expires_at.is_some_and(|deadline| deadline < now))
                .map(|entry| entry.id().clone())
                .collect();
            expired
                .iter()
                .filter_map(|id| entries.remove(id))
                .collect::<Vec<_>>()
        };
        if !removed.is_empty() {
            debug!(count = removed.len(), "expired stale node entries");
        }
        self.publish(removed.iter().cloned().map(Change::Removed).collect());
        removed
    }
}

impl SpatialDatabase for InMemorySpatialDb {
    fn this_node(&self) -> NodeDbEntry {
        self.entries
            .read()
            .expect("spatial db lock poisoned")
            .get(&self.self_id)
            .cloned()
            .expect("self entry must exist")
    }

    fn load(&self, id: &NodeId) -> Option<NodeDbEntry> {
        self.entries
            .read()
            .expect("spatial db lock poisoned")
            .get(id)
            .cloned()
    }

    fn store(&self, mut entry: NodeDbEntry, expires: bool) -> Result<(), OverlayError> {
        entry.info.location.validate()?;
        if entry.relation == NodeRelation::SelfNode {
            return Err(OverlayError::Internal(
                "a second self entry cannot be stored".into(),
            ));
        }
        if *entry.id() == self.self_id {
            return Err(OverlayError::ConflictingId(format!(
                "{} is the local node id",
                entry.id()
            )));
        }
        entry.expires_at = self.deadline(expires);
        {
            let mut entries = self.entries.write().expect("spatial db lock poisoned");
            if entries.contains_key(entry.id()) {
                return Err(OverlayError::ConflictingId(entry.id().to_string()));
            }
            entries.insert(entry.id().clone(), entry.clone());
        }
        self.publish(vec![Change::Added(entry)]);
        Ok(())
    }

    fn update(&self, mut entry: NodeDbEntry, expires: bool) -> Result<(), OverlayError> {
        entry.info.location.validate()?;
        entry.expires_at = if entry.relation == NodeRelation::SelfNode {
            None
        } else {
            self.deadline(expires)
        };
        {
            let mut entries = self.entries.write().expect("spatial db lock poisoned");
            let stored = entries
                .get_mut(entry.id())
                .ok_or_else(|| OverlayError::NotFound(entry.id().to_string()))?;
            if (stored.relation == NodeRelation::SelfNode)
                != (entry.relation == NodeRelation::SelfNode)
            {
                return Err(OverlayError::Internal(
                    "update must not change an entry into or out of self".into(),
                ));
            }
            *stored = entry.clone();
        }
        self.publish(vec![Change::Updated(entry)]);
        Ok(())
    }

    fn remove(&self, id: &NodeId) -> Result<(), OverlayError> {
        if *id == self.self_id {
            return Err(OverlayError::InvalidState(
                "the self entry cannot be removed".into(),
            ));
        }
        let removed = {
            let mut entries = self.entries.write().expect("spatial db lock poisoned");
            entries
                .remove(id)
                .ok_or_else(|| OverlayError::NotFound(id.to_string()))?
        };
        self.publish(vec![Change::Removed(removed)]);
        Ok(())
    }

    fn expire_old_nodes(&self) {
        self.expire_collect();
    }

    fn get_node_count(&self, relation: Option<NodeRelation>) -> usize {
        let entries = self.entries.read().expect("spatial db lock poisoned");
        match relation {
            None => entries.len(),
            Some(relation) => entries
                .values()
                .filter(|entry| entry.relation == relation)
                .count(),
        }
    }

    fn get_nodes_by_role(&self, role: NodeRole) -> Vec<NodeDbEntry> {
        self.entries
            .read()
            .expect("spatial db lock poisoned")
            .values()
            .filter(|entry| entry.relation != NodeRelation::SelfNode && entry.role == role)
            .cloned()
            .collect()
    }

    fn get_neighbours_by_distance(&self) -> Vec<NodeDbEntry> {
        let self_location = *self.this_node().location();
        let mut neighbours: Vec<NodeDbEntry> = self
            .entries
            .read()
            .expect("spatial db lock poisoned")
            .values()
            .filter(|entry| entry.relation == NodeRelation::Neighbour)
            .cloned()
            .collect();
        sort_by_distance(&mut neighbours, &self_location);
        neighbours
    }

    fn get_closest_by_distance(
        &self,
        center: &GpsLocation,
        radius_km: f64,
        max_node_count: usize,
        filter: NeighbourFilter,
    ) -> Vec<NodeDbEntry> {
        let mut hits: Vec<NodeDbEntry> = self
            .entries
            .read()
            .expect("spatial db lock poisoned")
            .values()
            .filter(|entry| {
                filter == NeighbourFilter::Included || entry.relation != NodeRelation::Neighbour
            })
            .filter(|entry| geo::distance_km(center, entry.location()) <= radius_km)
            .cloned()
            .collect();
        sort_by_distance(&mut hits, center);
        hits.truncate(max_node_count);
        hits
    }

    fn get_random_nodes(
        &self,
        max_node_count: usize,
        filter: NeighbourFilter,
    ) -> Vec<NodeDbEntry> {
        let mut candidates: Vec<NodeDbEntry> = self
            .entries
            .read()
            .expect("spatial db lock poisoned")
            .values()
            .filter(|entry| entry.relation != NodeRelation::SelfNode)
            .filter(|entry| {
                filter == NeighbourFilter::Included || entry.relation != NodeRelation::Neighbour
            })
            .cloned()
            .collect();
        let mut rng = self.rng.lock().expect("rng lock poisoned");
        candidates.shuffle(&mut *rng);
        candidates.truncate(max_node_count);
        candidates
    }

    fn listener_registry(&self) -> &ListenerRegistry {
        &self.listeners
    }
}

fn sort_by_distance(entries: &mut [NodeDbEntry], center: &GpsLocation) {
    entries.sort_by(|a, b| {
        let da = geo::distance_km(center, a.location());
        let db = geo::distance_km(center, b.location());
        da.partial_cmp(&db)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.id().cmp(b.id()))
    });
}

fn relation_label(relation: NodeRelation) -> &'static str {
    match relation {
        NodeRelation::Colleague => "colleague",
        NodeRelation::Neighbour => "neighbour",
        NodeRelation::SelfNode => "self",
    }
}

/// Write-through sqlite wrapper around [`InMemorySpatialDb`].  Only this
/// database content survives a restart; the schema is a single table with
/// the CBOR-encoded entry as payload.
pub struct SqliteSpatialDb {
    mem: Arc<InMemorySpatialDb>,
    conn: Mutex<Connection>,
}

impl SqliteSpatialDb {
    pub fn open(
        path: impl AsRef<Path>,
        self_info: NodeInfo,
        clock: Arc<dyn Clock>,
        entry_expiration: Duration,
    ) -> Result<Arc<Self>, OverlayError> {
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS nodes (
                node_id TEXT PRIMARY KEY,
                relation TEXT NOT NULL,
                expires_at INTEGER,
                payload BLOB NOT NULL
            );",
        )?;

        let mem = InMemorySpatialDb::new(self_info, clock, entry_expiration)?;
        let mut loaded = 0usize;
        {
            let mut stmt = conn.prepare("SELECT payload FROM nodes")?;
            let rows = stmt.query_map([], |row| row.get::<_, Vec<u8>>(0))?;
            for payload in rows {
                let entry: NodeDbEntry = serde_cbor::from_slice(&payload?)
                    .map_err(|err| OverlayError::Internal(format!("corrupt node row: {err}")))?;
                // The configured identity is authoritative; a self row from a
                // previous run is replaced below.
                if entry.relation == NodeRelation::SelfNode || *entry.id() == *mem.this_node().id()
                {
                    continue;
                }
                mem.insert_raw(entry);
                loaded += 1;
            }
        }
        debug!(loaded, "opened spatial database");

        let db = Arc::new(Self {
            mem,
            conn: Mutex::new(conn),
        });
        db.persist(&db.mem.this_node())?;
        Ok(db)
    }

    fn persist(&self, entry: &NodeDbEntry) -> Result<(), OverlayError> {
        let payload = serde_cbor::to_vec(entry)
            .map_err(|err| OverlayError::Internal(format!("encode node row: {err}")))?;
        let conn = self.conn.lock().expect("sqlite lock poisoned");
        conn.execute(
            "INSERT OR REPLACE INTO nodes (node_id, relation, expires_at, payload)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                entry.id().as_str(),
                relation_label(entry.relation),
                entry.expires_at.map(|deadline| deadline as i64),
                payload
            ],
        )?;
        Ok(())
    }

    fn delete(&self, id: &NodeId) -> Result<(), OverlayError> {
        let conn = self.conn.lock().expect("sqlite lock poisoned");
        conn.execute("DELETE FROM nodes WHERE node_id = ?1", params![id.as_str()])?;
        Ok(())
    }

    fn stored(&self, id: &NodeId) -> Result<NodeDbEntry, OverlayError> {
        self.mem
            .load(id)
            .ok_or_else(|| OverlayError::Internal(format!("entry {id} vanished after write")))
    }
}

impl SpatialDatabase for SqliteSpatialDb {
    fn this_node(&self) -> NodeDbEntry {
        self.mem.this_node()
    }

    fn load(&self, id: &NodeId) -> Option<NodeDbEntry> {
        self.mem.load(id)
    }

    fn store(&self, entry: NodeDbEntry, expires: bool) -> Result<(), OverlayError> {
        let id = entry.id().clone();
        self.mem.store(entry, expires)?;
        self.persist(&self.stored(&id)?)
    }

    fn update(&self, entry: NodeDbEntry, expires: bool) -> Result<(), OverlayError> {
        let id = entry.id().clone();
        self.mem.update(entry, expires)?;
        self.persist(&self.stored(&id)?)
    }

    fn remove(&self, id: &NodeId) -> Result<(), OverlayError> {
        self.mem.remove(id)?;
        self.delete(id)
    }

    fn expire_old_nodes(&self) {
        for removed in self.mem.expire_collect() {
            if let Err(err) = self.delete(removed.id()) {
                debug!(node_id = %removed.id(), %err, "failed to delete expired row");
            }
        }
    }

    fn get_node_count(&self, relation: Option<NodeRelation>) -> usize {
        self.mem.get_node_count(relation)
    }

    fn get_nodes_by_role(&self, role: NodeRole) -> Vec<NodeDbEntry> {
        self.mem.get_nodes_by_role(role)
    }

    fn get_neighbours_by_distance(&self) -> Vec<NodeDbEntry> {
        self.mem.get_neighbours_by_distance()
    }

    fn get_closest_by_distance(
        &self,
        center: &GpsLocation,
        radius_km: f64,
        max_node_count: usize,
        filter: NeighbourFilter,
    ) -> Vec<NodeDbEntry> {
        self.mem
            .get_closest_by_distance(center, radius_km, max_node_count, filter)
    }

    fn get_random_nodes(
        &self,
        max_node_count: usize,
        filter: NeighbourFilter,
    ) -> Vec<NodeDbEntry> {
        self.mem.get_random_nodes(max_node_count, filter)
    }

    fn listener_registry(&self) -> &ListenerRegistry {
        self.mem.listener_registry()
    }
}
