// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::time::Duration;

use crate::peer::{NetworkEndpoint, NodeInfo};

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Identity and position of the local node.
    pub node_info: NodeInfo,
    /// Endpoints pre-configured for bootstrap.
    pub seed_nodes: Vec<NetworkEndpoint>,
    /// Target number of neighbours (N).
    pub neighbourhood_target_size: usize,
    /// Bubble radius used while fewer than N neighbours are known.
    pub min_bubble_radius_km: f64,
    /// Re-run bootstrapping when the world view shrinks below this many
    /// remote entries.
    pub map_fill_target: usize,
    /// Hop budget for neighbourhood initialisation and exploration.
    pub max_node_hops: usize,
    /// Period of the expiration and renewal passes.
    pub db_maintenance_period: Duration,
    /// Lifetime of a stored entry between renewals.
    pub db_expiration_period: Duration,
    /// Period of the unknown-area discovery pass.
    pub discovery_period: Duration,
    /// Seed for the node's random sampler; `None` draws from entropy.
    pub sampler_seed: Option<u64>,
}

impl NodeConfig {
    pub fn new(node_info: NodeInfo) -> Self {
        Self {
            node_info,
            seed_nodes: vec![],
            neighbourhood_target_size: 5,
            min_bubble_radius_km: 10.0,
            map_fill_target: 50,
            max_node_hops: 10,
            db_maintenance_period: Duration::from_secs(60),
            db_expiration_period: Duration::from_secs(24 * 60 * 60),
            discovery_period: Duration::from_secs(5 * 60),
            sampler_seed: None,
        }
    }
}
