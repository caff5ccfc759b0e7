use serde::{Deserialize, Serialize};

use crate::geo::GpsLocation;
use crate::ids::NodeId;
use crate::peer::{NeighbourFilter, NodeInfo, ServiceInfo};

/// Protocol version carried by every request.
pub const PROTOCOL_VERSION: [u8; 3] = [1, 0, 0];

/// One framed message: a correlation id plus either a request or the
/// response paired to it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: u32,
    pub body: MessageBody,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum MessageBody {
    Request(Request),
    Response(Response),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Request {
    pub version: [u8; 3],
    pub payload: RequestPayload,
}

impl Request {
    pub fn new(payload: RequestPayload) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            payload,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum RequestPayload {
    LocalService(LocalServiceRequest),
    Node(NodeRequest),
    Client(ClientRequest),
}

/// Requests served only for services and clients on the same host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum LocalServiceRequest {
    RegisterService(ServiceInfo),
    DeregisterService { service_type: String },
    GetNeighbourNodes { keep_alive: bool },
    /// Server-initiated notification on a keepalive session; never a valid
    /// inbound request to a node.
    NeighbourhoodChanged { changes: Vec<NeighbourhoodChange> },
}

/// Requests exchanged between overlay nodes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum NodeRequest {
    GetNodeInfo,
    GetNodeCount,
    GetRandomNodes {
        max_node_count: u32,
        filter: NeighbourFilter,
    },
    GetClosestNodesByDistance {
        location: GpsLocation,
        radius_km: f64,
        max_node_count: u32,
        filter: NeighbourFilter,
    },
    AcceptColleague(NodeInfo),
    RenewColleague(NodeInfo),
    AcceptNeighbour(NodeInfo),
    RenewNeighbour(NodeInfo),
}

/// Requests served for higher-level clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ClientRequest {
    GetNodeInfo,
    GetNeighbourNodes,
    GetRandomNodes {
        max_node_count: u32,
        filter: NeighbourFilter,
    },
    GetClosestNodesByDistance {
        location: GpsLocation,
        radius_km: f64,
        max_node_count: u32,
        filter: NeighbourFilter,
    },
    ExploreNetworkNodesByDistance {
        location: GpsLocation,
        target_node_count: u32,
        max_node_hops: u32,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum NeighbourhoodChange {
    Added(NodeInfo),
    Updated(NodeInfo),
    Removed { node_id: NodeId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Ok,
    BadRequest,
    BadResponse,
    Connection,
    ProtocolViolation,
    InvalidState,
    Internal,
    Unsupported,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    pub status: Status,
    pub details: String,
    pub payload: Option<ResponsePayload>,
}

impl Response {
    pub fn ok(payload: ResponsePayload) -> Self {
        Self {
            status: Status::Ok,
            details: String::new(),
            payload: Some(payload),
        }
    }

    pub fn error(status: Status, details: impl Into<String>) -> Self {
        Self {
            status,
            details: details.into(),
            payload: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ResponsePayload {
    Ack,
    Location(GpsLocation),
    NodeInfo(NodeInfo),
    /// Acceptance/renewal outcome: the acceptor's own info, or refusal.
    OptionalNodeInfo(Option<NodeInfo>),
    NodeList(Vec<NodeInfo>),
    NodeCount(u64),
}
