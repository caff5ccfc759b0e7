// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Acceptance policy: colleague bubbles and the neighbour cap.

use tracing::debug;

use crate::error::OverlayError;
use crate::geo::{self, GpsLocation};
use crate::ids::NodeId;
use crate::peer::{NeighbourFilter, NodeDbEntry, NodeInfo, NodeRelation, NodeRole};

use super::Node;

impl Node {
    /// Protective radius around `location`: half the distance to the Nth
    /// closest neighbour once the neighbourhood is established, the
    /// configured minimum before that.
    pub(crate) fn bubble_radius(&self, location: &GpsLocation) -> f64 {
        let target = self.config.neighbourhood_target_size;
        let mut distances: Vec<f64> = self
            .db
            .get_neighbours_by_distance()
            .iter()
            .map(|entry| geo::distance_km(location, entry.location()))
            .collect();
        if distances.len() < target {
            return self.config.min_bubble_radius_km;
        }
        distances.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        distances[target - 1] / 2.0
    }

    /// Whether `candidate`'s bubble intersects the bubble of any stored
    /// colleague or neighbour other than Self and `ignored`.
    pub(crate) fn bubble_overlaps(&self, candidate: &NodeInfo, ignored: Option<&NodeId>) -> bool {
        let candidate_radius = self.bubble_radius(&candidate.location);
        self.db
            .get_closest_by_distance(
                &candidate.location,
                f64::INFINITY,
                usize::MAX,
                NeighbourFilter::Included,
            )
            .iter()
            .filter(|entry| entry.relation != NodeRelation::SelfNode)
            .filter(|entry| entry.id() != candidate.id())
            .filter(|entry| Some(entry.id()) != ignored)
            .any(|entry| {
                let distance = geo::distance_km(&candidate.location, entry.location());
                distance < candidate_radius + self.bubble_radius(entry.location())
            })
    }

    fn check_peer(&self, node: &NodeInfo) -> Result<(), OverlayError> {
        node.location.validate()?;
        if node.id().as_str().is_empty() {
            return Err(OverlayError::BadRequest("node id must not be empty".into()));
        }
        if node.id() == self.node_info().id() {
            return Err(OverlayError::BadRequest(
                "a node cannot form a relation with itself".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn handle_accept_colleague(
        &self,
        node: NodeInfo,
    ) -> Result<Option<NodeInfo>, OverlayError> {
        self.check_peer(&node)?;
        let _guard = self.relation_guard.lock().expect("relation guard poisoned");

        if self.db.load(node.id()).is_some() {
            debug!(node_id = %node.id(), "refusing colleague, already stored");
            return Ok(None);
        }
        if self.bubble_overlaps(&node, None) {
            debug!(node_id = %node.id(), "refusing colleague, bubble overlaps");
            return Ok(None);
        }
        self.db.store(
            NodeDbEntry::new(node.clone(), NodeRelation::Colleague, NodeRole::Acceptor),
            true,
        )?;
        debug!(node_id = %node.id(), "accepted colleague");
        Ok(Some(self.node_info()))
    }

    pub(crate) fn handle_accept_neighbour(
        &self,
        node: NodeInfo,
    ) -> Result<Option<NodeInfo>, OverlayError> {
        self.check_peer(&node)?;
        let _guard = self.relation_guard.lock().expect("relation guard poisoned");

        let stored = self.db.load(node.id());
        if let Some(entry) = &stored {
            if entry.relation == NodeRelation::Neighbour {
                // Accepting an existing neighbour degrades to renewal.
                let mut renewed = entry.clone();
                renewed.info = node;
                self.db.update(renewed, true)?;
                return Ok(Some(self.node_info()));
            }
        }

        let target = self.config.neighbourhood_target_size;
        let neighbours = self.db.get_neighbours_by_distance();
        if neighbours.len() >= target {
            let self_location = self.node_info().location;
            let farthest = neighbours
                .last()
                .expect("neighbour list cannot be empty here")
                .clone();
            let candidate_distance = geo::distance_km(&self_location, &node.location);
            let farthest_distance = geo::distance_km(&self_location, farthest.location());
            if candidate_distance >= farthest_distance {
                debug!(node_id = %node.id(), "refusing neighbour, neighbourhood full");
                return Ok(None);
            }
            // Make room: the farthest neighbour becomes a colleague, unless
            // its bubble would overlap in that role.
            if self.bubble_overlaps(&farthest.info, Some(farthest.id())) {
                debug!(node_id = %farthest.id(), "dropping demoted neighbour, bubble overlaps");
                self.db.remove(farthest.id())?;
            } else {
                let mut demoted = farthest.clone();
                demoted.relation = NodeRelation::Colleague;
                self.db.update(demoted, true)?;
                debug!(node_id = %farthest.id(), "demoted farthest neighbour to colleague");
            }
        }

        match stored {
            Some(entry) => {
                // Colleague upgraded in place; the relationship origin stays.
                let mut upgraded = entry;
                upgraded.info = node.clone();
                upgraded.relation = NodeRelation::Neighbour;
                self.db.update(upgraded, true)?;
            }
            None => {
                self.db.store(
                    NodeDbEntry::new(node.clone(), NodeRelation::Neighbour, NodeRole::Acceptor),
                    true,
                )?;
            }
        }
        debug!(node_id = %node.id(), "accepted neighbour");
        Ok(Some(self.node_info()))
    }

    pub(crate) fn handle_renew(
        &self,
        node: NodeInfo,
        relation: NodeRelation,
    ) -> Result<Option<NodeInfo>, OverlayError> {
        self.check_peer(&node)?;
        let _guard = self.relation_guard.lock().expect("relation guard poisoned");

        match self.db.load(node.id()) {
            Some(entry) if entry.relation == relation => {
                let mut renewed = entry;
                renewed.info = node;
                self.db.update(renewed, true)?;
                Ok(Some(self.node_info()))
            }
            _ => {
                debug!(node_id = %node.id(), ?relation, "refusing renewal of unknown relation");
                Ok(None)
            }
        }
    }
}
