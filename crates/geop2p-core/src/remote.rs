// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Client side of the node-to-node protocol: a proxy that makes a remote
//! node look like any other [`NodeMethods`] value.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::api::NodeMethods;
use crate::error::OverlayError;
use crate::geo::GpsLocation;
use crate::peer::{NeighbourFilter, NetworkEndpoint, NodeInfo};
use crate::session::Session;
use crate::wire::{
    Message, MessageBody, NodeRequest, Request, RequestPayload, Response, ResponsePayload, Status,
};

/// A callable handle to a (potentially remote) node.
pub type NodeHandle = Arc<dyn NodeMethods>;

/// Produces a remote-node handle for an endpoint, hiding the transport.
#[async_trait]
pub trait NodeProxyFactory: Send + Sync {
    async fn connect_to(&self, endpoint: &NetworkEndpoint) -> Result<NodeHandle, OverlayError>;
}

/// Factory dialing plain TCP sessions.
#[derive(Default)]
pub struct TcpProxyFactory;

impl TcpProxyFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

#[async_trait]
impl NodeProxyFactory for TcpProxyFactory {
    async fn connect_to(&self, endpoint: &NetworkEndpoint) -> Result<NodeHandle, OverlayError> {
        debug!(%endpoint, "connecting");
        let session = Session::connect(endpoint).await?;
        Ok(Arc::new(RemoteNode {
            session: tokio::sync::Mutex::new(session),
            next_id: AtomicU32::new(1),
        }))
    }
}

/// One outbound session, one request in flight at a time.
pub struct RemoteNode {
    session: tokio::sync::Mutex<Session<TcpStream>>,
    next_id: AtomicU32,
}

impl RemoteNode {
    async fn call(&self, payload: NodeRequest) -> Result<Response, OverlayError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let message = Message {
            id,
            body: MessageBody::Request(Request::new(RequestPayload::Node(payload))),
        };

        let mut session = self.session.lock().await;
        session.send_message(&message).await?;
        let reply = session.receive_message().await?;
        let session_id = session.id().clone();
        drop(session);

        if reply.id != id {
            return Err(OverlayError::BadResponse(format!(
                "correlation id mismatch: sent {id}, got {}",
                reply.id
            )));
        }
        let MessageBody::Response(response) = reply.body else {
            return Err(OverlayError::BadResponse(
                "got a request where a response was expected".into(),
            ));
        };
        if response.status != Status::Ok {
            warn!(
                %session_id,
                status = ?response.status,
                details = %response.details,
                "received error response"
            );
            return Err(OverlayError::from_status(response.status, &response.details));
        }
        Ok(response)
    }

    fn node_info(response: Response) -> Result<NodeInfo, OverlayError> {
        match response.payload {
            Some(ResponsePayload::NodeInfo(info)) => Ok(info),
            other => Err(shape_error("NodeInfo", &other)),
        }
    }

    fn optional_node_info(response: Response) -> Result<Option<NodeInfo>, OverlayError> {
        match response.payload {
            Some(ResponsePayload::OptionalNodeInfo(info)) => Ok(info),
            other => Err(shape_error("OptionalNodeInfo", &other)),
        }
    }

    fn node_list(response: Response) -> Result<Vec<NodeInfo>, OverlayError> {
        match response.payload {
            Some(ResponsePayload::NodeList(nodes)) => Ok(nodes),
            other => Err(shape_error("NodeList", &other)),
        }
    }
}

fn shape_error(expected: &str, got: &Option<ResponsePayload>) -> OverlayError {
    OverlayError::BadResponse(format!("expected {expected} payload, got {got:?}"))
}

#[async_trait]
impl NodeMethods for RemoteNode {
    async fn get_node_info(&self) -> Result<NodeInfo, OverlayError> {
        Self::node_info(self.call(NodeRequest::GetNodeInfo).await?)
    }

    async fn get_node_count(&self) -> Result<usize, OverlayError> {
        match self.call(NodeRequest::GetNodeCount).await?.payload {
            Some(ResponsePayload::NodeCount(count)) => Ok(count as usize),
            other => Err(shape_error("NodeCount", &other)),
        }
    }

    async fn get_random_nodes(
        &self,
        max_node_count: usize,
        filter: NeighbourFilter,
    ) -> Result<Vec<NodeInfo>, OverlayError> {
        let response = self
            .call(NodeRequest::GetRandomNodes {
                max_node_count: clamp_count(max_node_count),
                filter,
            })
            .await?;
        Self::node_list(response)
    }

    async fn get_closest_nodes_by_distance(
        &self,
        location: GpsLocation,
        radius_km: f64,
        max_node_count: usize,
        filter: NeighbourFilter,
    ) -> Result<Vec<NodeInfo>, OverlayError> {
        let response = self
            .call(NodeRequest::GetClosestNodesByDistance {
                location,
                radius_km,
                max_node_count: clamp_count(max_node_count),
                filter,
            })
            .await?;
        Self::node_list(response)
    }

    async fn accept_colleague(&self, node: NodeInfo) -> Result<Option<NodeInfo>, OverlayError> {
        Self::optional_node_info(self.call(NodeRequest::AcceptColleague(node)).await?)
    }

    async fn renew_colleague(&self, node: NodeInfo) -> Result<Option<NodeInfo>, OverlayError> {
        Self::optional_node_info(self.call(NodeRequest::RenewColleague(node)).await?)
    }

    async fn accept_neighbour(&self, node: NodeInfo) -> Result<Option<NodeInfo>, OverlayError> {
        Self::optional_node_info(self.call(NodeRequest::AcceptNeighbour(node)).await?)
    }

    async fn renew_neighbour(&self, node: NodeInfo) -> Result<Option<NodeInfo>, OverlayError> {
        Self::optional_node_info(self.call(NodeRequest::RenewNeighbour(node)).await?)
    }
}

fn clamp_count(count: usize) -> u32 {
    u32::try_from(count).unwrap_or(u32::MAX)
}
