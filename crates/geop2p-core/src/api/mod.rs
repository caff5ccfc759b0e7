// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! The overlay maintenance engine.
//!
//! A single [`Node`] value implements three capability surfaces: the local
//! service interface, the node-to-node interface and the client interface.
//! External factories receive only the capability they need.

mod bootstrap;
mod relations;
#[cfg(test)]
mod tests;

pub use bootstrap::{DISCOVERY_MAX_NODE_COUNT, MAX_BOOTSTRAP_RANDOM_NODES};

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::info;

use crate::config::NodeConfig;
use crate::error::OverlayError;
use crate::events::ChangeListener;
use crate::geo::GpsLocation;
use crate::peer::{NeighbourFilter, NodeInfo, NodeRelation, ServiceInfo};
use crate::remote::NodeProxyFactory;
use crate::spatial_db::SpatialDatabase;

/// Interface for services running on the same hardware.
#[async_trait]
pub trait LocalServiceMethods: Send + Sync {
    /// Register a hosted service; answers with the node's own position.
    async fn register_service(&self, service: ServiceInfo) -> Result<GpsLocation, OverlayError>;
    async fn deregister_service(&self, service_type: &str) -> Result<(), OverlayError>;
    async fn get_neighbour_nodes_by_distance(&self) -> Result<Vec<NodeInfo>, OverlayError>;
    async fn get_node_info(&self) -> Result<NodeInfo, OverlayError>;

    // Used through this interface but never exported to remote nodes.
    fn add_listener(&self, listener: Arc<dyn ChangeListener>);
    fn remove_listener(&self, session_id: &str);
}

/// Interface provided for other nodes of the same network.
#[async_trait]
pub trait NodeMethods: Send + Sync {
    async fn get_node_info(&self) -> Result<NodeInfo, OverlayError>;
    async fn get_node_count(&self) -> Result<usize, OverlayError>;
    async fn get_random_nodes(
        &self,
        max_node_count: usize,
        filter: NeighbourFilter,
    ) -> Result<Vec<NodeInfo>, OverlayError>;
    async fn get_closest_nodes_by_distance(
        &self,
        location: GpsLocation,
        radius_km: f64,
        max_node_count: usize,
        filter: NeighbourFilter,
    ) -> Result<Vec<NodeInfo>, OverlayError>;

    async fn accept_colleague(&self, node: NodeInfo) -> Result<Option<NodeInfo>, OverlayError>;
    async fn renew_colleague(&self, node: NodeInfo) -> Result<Option<NodeInfo>, OverlayError>;
    async fn accept_neighbour(&self, node: NodeInfo) -> Result<Option<NodeInfo>, OverlayError>;
    async fn renew_neighbour(&self, node: NodeInfo) -> Result<Option<NodeInfo>, OverlayError>;
}

/// Interface provided to higher-level services and clients.
#[async_trait]
pub trait ClientMethods: Send + Sync {
    async fn get_node_info(&self) -> Result<NodeInfo, OverlayError>;
    async fn get_neighbour_nodes_by_distance(&self) -> Result<Vec<NodeInfo>, OverlayError>;
    async fn get_random_nodes(
        &self,
        max_node_count: usize,
        filter: NeighbourFilter,
    ) -> Result<Vec<NodeInfo>, OverlayError>;
    async fn get_closest_nodes_by_distance(
        &self,
        location: GpsLocation,
        radius_km: f64,
        max_node_count: usize,
        filter: NeighbourFilter,
    ) -> Result<Vec<NodeInfo>, OverlayError>;
    async fn explore_network_nodes_by_distance(
        &self,
        location: GpsLocation,
        target_node_count: usize,
        max_node_hops: usize,
    ) -> Result<Vec<NodeInfo>, OverlayError>;
}

pub struct Node {
    config: NodeConfig,
    db: Arc<dyn SpatialDatabase>,
    proxy_factory: Arc<dyn NodeProxyFactory>,
    services: Mutex<HashMap<String, ServiceInfo>>,
    sampler: Mutex<StdRng>,
    /// Serializes relation changes so acceptance checks and the store
    /// mutation they justify happen atomically.
    relation_guard: Mutex<()>,
}

impl Node {
    pub fn new(
        config: NodeConfig,
        db: Arc<dyn SpatialDatabase>,
        proxy_factory: Arc<dyn NodeProxyFactory>,
    ) -> Arc<Self> {
        let sampler = match config.sampler_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Arc::new(Self {
            config,
            db,
            proxy_factory,
            services: Mutex::new(HashMap::new()),
            sampler: Mutex::new(sampler),
            relation_guard: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn node_info(&self) -> NodeInfo {
        self.db.this_node().info
    }

    fn remote_node_count(&self) -> usize {
        self.db.get_node_count(Some(NodeRelation::Colleague))
            + self.db.get_node_count(Some(NodeRelation::Neighbour))
    }

    fn neighbour_count(&self) -> usize {
        self.db.get_node_count(Some(NodeRelation::Neighbour))
    }

    /// Rewrite the Self entry's address once a routable external address is
    /// learned.  The configured address wins when it is already routable.
    pub fn detected_external_address(&self, address: IpAddr) -> Result<(), OverlayError> {
        let mut entry = self.db.this_node();
        if entry.info.profile.contact.address == address
            || entry.info.profile.contact.is_routable()
        {
            return Ok(());
        }
        info!(%address, "detected external address, updating own contact");
        entry.info.profile.contact.address = address;
        self.db.update(entry, false)
    }

    pub fn registered_services(&self) -> Vec<ServiceInfo> {
        self.services
            .lock()
            .expect("service registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    fn check_query(location: &GpsLocation, radius_km: f64) -> Result<(), OverlayError> {
        location.validate()?;
        if radius_km.is_nan() || radius_km < 0.0 {
            return Err(OverlayError::BadRequest(format!(
                "negative search radius: {radius_km}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl LocalServiceMethods for Node {
    async fn register_service(&self, service: ServiceInfo) -> Result<GpsLocation, OverlayError> {
        if service.service_type.is_empty() {
            return Err(OverlayError::BadRequest(
                "service type must not be empty".into(),
            ));
        }
        self.services
            .lock()
            .expect("service registry lock poisoned")
            .insert(service.service_type.clone(), service);
        Ok(self.node_info().location)
    }

    async fn deregister_service(&self, service_type: &str) -> Result<(), OverlayError> {
        self.services
            .lock()
            .expect("service registry lock poisoned")
            .remove(service_type)
            .map(|_| ())
            .ok_or_else(|| {
                OverlayError::BadRequest(format!("unknown service type {service_type}"))
            })
    }

    async fn get_neighbour_nodes_by_distance(&self) -> Result<Vec<NodeInfo>, OverlayError> {
        Ok(self
            .db
            .get_neighbours_by_distance()
            .into_iter()
            .map(|entry| entry.info)
            .collect())
    }

    async fn get_node_info(&self) -> Result<NodeInfo, OverlayError> {
        Ok(self.node_info())
    }

    fn add_listener(&self, listener: Arc<dyn ChangeListener>) {
        self.db.listener_registry().add(listener);
    }

    fn remove_listener(&self, session_id: &str) {
        self.db.listener_registry().remove(session_id);
    }
}

#[async_trait]
impl NodeMethods for Node {
    async fn get_node_info(&self) -> Result<NodeInfo, OverlayError> {
        Ok(self.node_info())
    }

    async fn get_node_count(&self) -> Result<usize, OverlayError> {
        Ok(self.db.get_node_count(None))
    }

    async fn get_random_nodes(
        &self,
        max_node_count: usize,
        filter: NeighbourFilter,
    ) -> Result<Vec<NodeInfo>, OverlayError> {
        Ok(self
            .db
            .get_random_nodes(max_node_count, filter)
            .into_iter()
            .map(|entry| entry.info)
            .collect())
    }

    async fn get_closest_nodes_by_distance(
        &self,
        location: GpsLocation,
        radius_km: f64,
        max_node_count: usize,
        filter: NeighbourFilter,
    ) -> Result<Vec<NodeInfo>, OverlayError> {
        Self::check_query(&location, radius_km)?;
        Ok(self
            .db
            .get_closest_by_distance(&location, radius_km, max_node_count, filter)
            .into_iter()
            .map(|entry| entry.info)
            .collect())
    }

    async fn accept_colleague(&self, node: NodeInfo) -> Result<Option<NodeInfo>, OverlayError> {
        self.handle_accept_colleague(node)
    }

    async fn renew_colleague(&self, node: NodeInfo) -> Result<Option<NodeInfo>, OverlayError> {
        self.handle_renew(node, NodeRelation::Colleague)
    }

    async fn accept_neighbour(&self, node: NodeInfo) -> Result<Option<NodeInfo>, OverlayError> {
        self.handle_accept_neighbour(node)
    }

    async fn renew_neighbour(&self, node: NodeInfo) -> Result<Option<NodeInfo>, OverlayError> {
        self.handle_renew(node, NodeRelation::Neighbour)
    }
}

#[async_trait]
impl ClientMethods for Node {
    async fn get_node_info(&self) -> Result<NodeInfo, OverlayError> {
        Ok(self.node_info())
    }

    async fn get_neighbour_nodes_by_distance(&self) -> Result<Vec<NodeInfo>, OverlayError> {
        LocalServiceMethods::get_neighbour_nodes_by_distance(self).await
    }

    async fn get_random_nodes(
        &self,
        max_node_count: usize,
        filter: NeighbourFilter,
    ) -> Result<Vec<NodeInfo>, OverlayError> {
        NodeMethods::get_random_nodes(self, max_node_count, filter).await
    }

    async fn get_closest_nodes_by_distance(
        &self,
        location: GpsLocation,
        radius_km: f64,
        max_node_count: usize,
        filter: NeighbourFilter,
    ) -> Result<Vec<NodeInfo>, OverlayError> {
        NodeMethods::get_closest_nodes_by_distance(self, location, radius_km, max_node_count, filter)
            .await
    }

    async fn explore_network_nodes_by_distance(
        &self,
        location: GpsLocation,
        target_node_count: usize,
        max_node_hops: usize,
    ) -> Result<Vec<NodeInfo>, OverlayError> {
        self.explore(location, target_node_count, max_node_hops).await
    }
}
