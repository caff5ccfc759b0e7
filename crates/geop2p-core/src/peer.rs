// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::geo::GpsLocation;
use crate::ids::NodeId;

/// A dialable address: one IP and one TCP port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkEndpoint {
    pub address: IpAddr,
    pub port: u16,
}

impl fmt::Display for NetworkEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// How a node can be reached: one address, the node-to-node port and the
/// local-service/client port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeContact {
    pub address: IpAddr,
    pub node_port: u16,
    pub client_port: u16,
}

impl NodeContact {
    pub fn node_endpoint(&self) -> NetworkEndpoint {
        NetworkEndpoint {
            address: self.address,
            port: self.node_port,
        }
    }

    pub fn client_endpoint(&self) -> NetworkEndpoint {
        NetworkEndpoint {
            address: self.address,
            port: self.client_port,
        }
    }

    /// Whether remote peers could plausibly dial this address.
    pub fn is_routable(&self) -> bool {
        !self.address.is_unspecified() && !self.address.is_loopback()
    }
}

/// Immutable identity tuple of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeProfile {
    pub id: NodeId,
    pub contact: NodeContact,
}

/// Identity plus position: everything another node needs to know.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub profile: NodeProfile,
    pub location: GpsLocation,
}

impl NodeInfo {
    pub fn id(&self) -> &NodeId {
        &self.profile.id
    }
}

/// Which side originated the relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Initiator,
    Acceptor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRelation {
    Colleague,
    Neighbour,
    SelfNode,
}

/// Restricts node-selection queries to include or exclude neighbours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NeighbourFilter {
    Included,
    Excluded,
}

/// A stored row of the spatial database.  `expires_at` is unix seconds;
/// the Self entry never expires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDbEntry {
    pub info: NodeInfo,
    pub relation: NodeRelation,
    pub role: NodeRole,
    pub expires_at: Option<u64>,
}

impl NodeDbEntry {
    pub fn new(info: NodeInfo, relation: NodeRelation, role: NodeRole) -> Self {
        Self {
            info,
            relation,
            role,
            expires_at: None,
        }
    }

    pub fn self_entry(info: NodeInfo) -> Self {
        Self::new(info, NodeRelation::SelfNode, NodeRole::Acceptor)
    }

    pub fn id(&self) -> &NodeId {
        self.info.id()
    }

    pub fn location(&self) -> &GpsLocation {
        &self.info.location
    }
}

/// A service advertised by the local node.  The registry is in-memory only
/// and does not survive a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub service_type: String,
    pub address: IpAddr,
    pub port: u16,
    #[serde(with = "serde_bytes")]
    pub payload: Option<Vec<u8>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact(addr: &str) -> NodeContact {
        NodeContact {
            address: addr.parse().expect("valid ip"),
            node_port: 16980,
            client_port: 16981,
        }
    }

    #[test]
    fn loopback_and_unspecified_are_unroutable() {
        assert!(!contact("127.0.0.1").is_routable());
        assert!(!contact("0.0.0.0").is_routable());
        assert!(contact("203.0.113.7").is_routable());
        assert!(contact("2001:db8::1").is_routable());
    }

    #[test]
    fn entry_cbor_roundtrip() {
        let entry = NodeDbEntry {
            info: NodeInfo {
                profile: NodeProfile {
                    id: NodeId::new("budapest-1").expect("valid id"),
                    contact: contact("203.0.113.7"),
                },
                location: GpsLocation::new(47.5, 19.0).expect("valid location"),
            },
            relation: NodeRelation::Neighbour,
            role: NodeRole::Initiator,
            expires_at: Some(1_700_000_000),
        };
        let encoded = serde_cbor::to_vec(&entry).expect("encode entry");
        let decoded: NodeDbEntry = serde_cbor::from_slice(&encoded).expect("decode entry");
        assert_eq!(decoded, entry);
    }
}
