// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Bootstrapping from seeds, wide-area exploration and the periodic
//! maintenance actions.

use std::collections::{HashMap, HashSet};

use rand::Rng;
use tracing::{debug, info, warn};

use crate::error::OverlayError;
use crate::geo::{self, GpsLocation};
use crate::ids::NodeId;
use crate::peer::{
    NeighbourFilter, NetworkEndpoint, NodeDbEntry, NodeInfo, NodeRelation, NodeRole,
};
use crate::remote::NodeHandle;

use super::Node;

/// How many random nodes a seed is asked for while filling the world view.
pub const MAX_BOOTSTRAP_RANDOM_NODES: usize = 100;

/// How many nodes one discovery pass asks for around the sampled point.
pub const DISCOVERY_MAX_NODE_COUNT: usize = 10;

impl Node {
    async fn safe_connect(&self, endpoint: &NetworkEndpoint) -> Option<NodeHandle> {
        match self.proxy_factory.connect_to(endpoint).await {
            Ok(proxy) => Some(proxy),
            Err(err) => {
                debug!(%endpoint, %err, "failed to connect");
                None
            }
        }
    }

    /// Establish a mutual relation with `node` and record it with
    /// role=Initiator.  Returns whether the entry was stored.  Connection
    /// failures and refusals are not errors, only a `false`.
    pub(crate) async fn safe_store_node(
        &self,
        node: NodeInfo,
        relation: NodeRelation,
        proxy: Option<&NodeHandle>,
    ) -> bool {
        if node.id() == self.node_info().id() {
            return false;
        }
        match self.db.load(node.id()) {
            // Upgrading a colleague to a neighbour is the only allowed
            // transition for an already-known node.
            Some(stored)
                if !(stored.relation == NodeRelation::Colleague
                    && relation == NodeRelation::Neighbour) =>
            {
                return false;
            }
            _ => {}
        }
        if relation == NodeRelation::Colleague && self.bubble_overlaps(&node, None) {
            debug!(node_id = %node.id(), "skipping colleague, bubble overlaps");
            return false;
        }

        let connected;
        let proxy = match proxy {
            Some(proxy) => proxy,
            None => {
                let endpoint = node.profile.contact.node_endpoint();
                match self.safe_connect(&endpoint).await {
                    Some(proxy) => {
                        connected = proxy;
                        &connected
                    }
                    None => return false,
                }
            }
        };

        let own_info = self.node_info();
        let outcome = match relation {
            NodeRelation::Colleague => proxy.accept_colleague(own_info).await,
            NodeRelation::Neighbour => proxy.accept_neighbour(own_info).await,
            NodeRelation::SelfNode => return false,
        };
        let accepted = match outcome {
            Ok(Some(info)) => info,
            Ok(None) => {
                debug!(node_id = %node.id(), ?relation, "peer refused relation");
                return false;
            }
            Err(err) => {
                debug!(node_id = %node.id(), %err, "relation handshake failed");
                return false;
            }
        };
        if accepted.id() != node.id() {
            debug!(node_id = %node.id(), "peer answered with a different identity");
            return false;
        }

        let result = match self.db.load(node.id()) {
            Some(stored) => {
                let mut upgraded = stored;
                upgraded.info = accepted;
                upgraded.relation = relation;
                upgraded.role = NodeRole::Initiator;
                self.db.update(upgraded, true)
            }
            None => self.db.store(
                NodeDbEntry::new(accepted, relation, NodeRole::Initiator),
                true,
            ),
        };
        match result {
            Ok(()) => true,
            Err(err) => {
                debug!(node_id = %node.id(), %err, "failed to record accepted relation");
                false
            }
        }
    }

    /// Fill the world view from the configured seeds.  Seeds are tried in
    /// order until the store holds at least one remote entry; connection
    /// failures are skipped, not fatal.
    pub async fn initialize_world(&self) -> Result<bool, OverlayError> {
        let seeds = self.config.seed_nodes.clone();
        for seed in &seeds {
            if self.remote_node_count() > 0 {
                break;
            }
            let Some(proxy) = self.safe_connect(seed).await else {
                continue;
            };
            let seed_info = match proxy.get_node_info().await {
                Ok(info) => info,
                Err(err) => {
                    debug!(endpoint = %seed, %err, "seed did not answer GetNodeInfo");
                    continue;
                }
            };
            self.safe_store_node(seed_info, NodeRelation::Colleague, Some(&proxy))
                .await;

            let random = match proxy
                .get_random_nodes(MAX_BOOTSTRAP_RANDOM_NODES, NeighbourFilter::Included)
                .await
            {
                Ok(nodes) => nodes,
                Err(err) => {
                    debug!(endpoint = %seed, %err, "seed did not answer GetRandomNodes");
                    continue;
                }
            };
            for node in random {
                self.safe_store_node(node, NodeRelation::Colleague, None)
                    .await;
            }
        }

        let stored = self.remote_node_count();
        info!(remote_nodes = stored, "world initialisation finished");
        Ok(stored > 0)
    }

    /// Build the neighbourhood by walking towards Self: query the closest
    /// known node for its closest nodes, handshake the results, hop on.
    pub async fn initialize_neighbourhood(&self) -> Result<bool, OverlayError> {
        let own = self.node_info();
        let target = self.config.neighbourhood_target_size;

        let mut candidates: HashMap<NodeId, NodeInfo> = HashMap::new();
        for entry in self.db.get_closest_by_distance(
            &own.location,
            f64::INFINITY,
            target + 1,
            NeighbourFilter::Included,
        ) {
            if entry.relation != NodeRelation::SelfNode {
                candidates.insert(entry.id().clone(), entry.info);
            }
        }

        let mut queried: HashSet<NodeId> = HashSet::new();
        let mut hops = 0usize;
        while self.neighbour_count() < target && hops < self.config.max_node_hops {
            let Some(next) = closest_unvisited(&candidates, &queried, &own.location) else {
                break;
            };
            queried.insert(next.id().clone());
            hops += 1;

            let Some(proxy) = self.safe_connect(&next.profile.contact.node_endpoint()).await
            else {
                continue;
            };
            let returned = match proxy
                .get_closest_nodes_by_distance(
                    own.location,
                    f64::INFINITY,
                    target,
                    NeighbourFilter::Included,
                )
                .await
            {
                Ok(nodes) => nodes,
                Err(err) => {
                    debug!(node_id = %next.id(), %err, "closest-nodes query failed");
                    continue;
                }
            };

            let mut returned = returned;
            sort_infos_by_distance(&mut returned, &own.location);
            for node in returned {
                if node.id() == own.id() {
                    continue;
                }
                candidates.entry(node.id().clone()).or_insert(node.clone());
                if self.neighbour_count() >= target {
                    break;
                }
                self.safe_store_node(node, NodeRelation::Neighbour, None)
                    .await;
            }
        }

        let established = self.neighbour_count();
        info!(neighbours = established, "neighbourhood initialisation finished");
        Ok(established > 0)
    }

    /// Re-run bootstrapping when the world view or the neighbourhood has
    /// shrunk below target.
    pub async fn ensure_map_filled(&self) -> Result<(), OverlayError> {
        let remote = self.remote_node_count();
        let neighbours = self.neighbour_count();
        if remote >= self.config.map_fill_target
            && neighbours >= self.config.neighbourhood_target_size
        {
            return Ok(());
        }
        debug!(remote, neighbours, "map under target, bootstrapping");
        if self.initialize_world().await? {
            self.initialize_neighbourhood().await?;
        }
        Ok(())
    }

    /// Iterative wide-area search: start from the local view, repeatedly
    /// query the not-yet-queried node closest to `center`, merging results
    /// until `target_node_count` distinct nodes are known or the hop budget
    /// is spent.
    pub(crate) async fn explore(
        &self,
        center: GpsLocation,
        target_node_count: usize,
        max_node_hops: usize,
    ) -> Result<Vec<NodeInfo>, OverlayError> {
        center.validate()?;
        let own = self.node_info();

        let mut collected: HashMap<NodeId, NodeInfo> = HashMap::new();
        for entry in self.db.get_closest_by_distance(
            &center,
            f64::INFINITY,
            target_node_count,
            NeighbourFilter::Included,
        ) {
            collected.insert(entry.id().clone(), entry.info);
        }

        let mut queried: HashSet<NodeId> = HashSet::new();
        queried.insert(own.id().clone());
        let mut hops = 0usize;
        while collected.len() < target_node_count && hops < max_node_hops {
            let Some(next) = closest_unvisited(&collected, &queried, &center) else {
                break;
            };
            queried.insert(next.id().clone());
            hops += 1;

            let Some(proxy) = self.safe_connect(&next.profile.contact.node_endpoint()).await
            else {
                continue;
            };
            match proxy
                .get_closest_nodes_by_distance(
                    center,
                    f64::INFINITY,
                    target_node_count,
                    NeighbourFilter::Included,
                )
                .await
            {
                Ok(returned) => {
                    for node in returned {
                        collected.entry(node.id().clone()).or_insert(node);
                    }
                }
                Err(err) => {
                    debug!(node_id = %next.id(), %err, "exploration hop failed");
                }
            }
        }

        let mut result: Vec<NodeInfo> = collected.into_values().collect();
        sort_infos_by_distance(&mut result, &center);
        result.truncate(target_node_count);
        Ok(result)
    }

    /// Drop entries whose deadline passed.
    pub fn expire_old_nodes(&self) {
        self.db.expire_old_nodes();
    }

    /// Renew every relation this node initiated.  A refused or failed
    /// renewal removes the entry locally.
    pub async fn renew_node_relations(&self) {
        let own = self.node_info();
        for entry in self.db.get_nodes_by_role(NodeRole::Initiator) {
            let endpoint = entry.info.profile.contact.node_endpoint();
            let renewed = match self.safe_connect(&endpoint).await {
                None => None,
                Some(proxy) => {
                    let outcome = match entry.relation {
                        NodeRelation::Colleague => proxy.renew_colleague(own.clone()).await,
                        NodeRelation::Neighbour => proxy.renew_neighbour(own.clone()).await,
                        NodeRelation::SelfNode => continue,
                    };
                    match outcome {
                        Ok(result) => result,
                        Err(err) => {
                            debug!(node_id = %entry.id(), %err, "renewal call failed");
                            None
                        }
                    }
                }
            };
            match renewed {
                Some(info) => {
                    let mut refreshed = entry;
                    refreshed.info = info;
                    if let Err(err) = self.db.update(refreshed, true) {
                        debug!(%err, "failed to refresh renewed entry");
                    }
                }
                None => {
                    warn!(node_id = %entry.id(), "renewal failed, removing entry");
                    if let Err(err) = self.db.remove(entry.id()) {
                        debug!(%err, "failed to remove unrenewed entry");
                    }
                }
            }
        }
    }

    /// Probe a randomly sampled point on the globe through a random known
    /// node and try to win the returned nodes as colleagues.  Discovery
    /// failures never remove entries.
    pub async fn discover_unknown_areas(&self) {
        let sample = {
            let mut rng = self.sampler.lock().expect("sampler lock poisoned");
            let latitude = rng.gen_range(-90.0..=90.0);
            // Upper-inclusive so the antimeridian itself stays reachable.
            let longitude = 180.0 - rng.gen::<f64>() * 360.0;
            GpsLocation::new(latitude, longitude)
        };
        let Ok(sample) = sample else { return };

        let Some(via) = self
            .db
            .get_random_nodes(1, NeighbourFilter::Included)
            .pop()
        else {
            return;
        };
        let Some(proxy) = self
            .safe_connect(&via.info.profile.contact.node_endpoint())
            .await
        else {
            return;
        };
        let returned = match proxy
            .get_closest_nodes_by_distance(
                sample,
                f64::INFINITY,
                DISCOVERY_MAX_NODE_COUNT,
                NeighbourFilter::Included,
            )
            .await
        {
            Ok(nodes) => nodes,
            Err(err) => {
                debug!(%err, "discovery query failed");
                return;
            }
        };
        debug!(%sample, returned = returned.len(), "discovered area");
        for node in returned {
            self.safe_store_node(node, NodeRelation::Colleague, None)
                .await;
        }
    }
}

fn closest_unvisited(
    candidates: &HashMap<NodeId, NodeInfo>,
    queried: &HashSet<NodeId>,
    center: &GpsLocation,
) -> Option<NodeInfo> {
    candidates
        .values()
        .filter(|info| !queried.contains(info.id()))
        .min_by(|a, b| {
            let da = geo::distance_km(center, &a.location);
            let db = geo::distance_km(center, &b.location);
            da.partial_cmp(&db)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id().cmp(b.id()))
        })
        .cloned()
}

fn sort_infos_by_distance(nodes: &mut [NodeInfo], center: &GpsLocation) {
    nodes.sort_by(|a, b| {
        let da = geo::distance_km(center, &a.location);
        let db = geo::distance_km(center, &b.location);
        da.partial_cmp(&db)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id().cmp(b.id()))
    });
}

/// Maintenance entry points used by the scheduler.
impl Node {
    pub async fn run_db_maintenance(&self) {
        self.expire_old_nodes();
        self.renew_node_relations().await;
    }

    pub async fn run_discovery(&self) {
        self.discover_unknown_areas().await;
        if let Err(err) = self.ensure_map_filled().await {
            debug!(%err, "map fill pass failed");
        }
    }
}
