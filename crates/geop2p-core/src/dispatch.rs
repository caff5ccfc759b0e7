// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Routes inbound requests to the overlay engine and answers with the
//! paired response.  One dispatcher serves one session.
//!
//! A `GetNeighbourNodes` request with the keepalive flag flips the session
//! into notification-only mode: the read loop ends and the session then
//! carries only server-to-client neighbourhood-change events until the
//! listener is deregistered or the session dies.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::api::{ClientMethods, LocalServiceMethods, Node, NodeMethods};
use crate::error::OverlayError;
use crate::events::ChangeListener;
use crate::ids::SessionId;
use crate::peer::{NodeDbEntry, NodeRelation};
use crate::session::Session;
use crate::wire::{
    ClientRequest, LocalServiceRequest, Message, MessageBody, NeighbourhoodChange, NodeRequest,
    Request, RequestPayload, Response, ResponsePayload, Status,
};

/// Which port the session arrived on.  Local-service variants are only
/// served on the local port; node and client queries are port-independent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchScope {
    NodePort,
    ClientPort,
}

pub struct Dispatcher {
    node: Arc<Node>,
    scope: DispatchScope,
}

impl Dispatcher {
    pub fn new(node: Arc<Node>, scope: DispatchScope) -> Self {
        Self { node, scope }
    }

    /// Serve one request.  Returns the response and whether the session
    /// must transition into notification-only mode.
    pub async fn handle_request(&self, request: Request) -> (Response, bool) {
        let mut keep_alive = false;
        let result = match request.payload {
            RequestPayload::Node(payload) => self.handle_node(payload).await,
            RequestPayload::LocalService(payload) => {
                if self.scope != DispatchScope::ClientPort {
                    Err(OverlayError::Unsupported(
                        "local service requests are only served on the local port".into(),
                    ))
                } else {
                    if let LocalServiceRequest::GetNeighbourNodes { keep_alive: flag } = &payload {
                        keep_alive = *flag;
                    }
                    self.handle_local_service(payload).await
                }
            }
            RequestPayload::Client(payload) => self.handle_client(payload).await,
        };
        match result {
            Ok(payload) => (Response::ok(payload), keep_alive),
            Err(err) => {
                debug!(%err, "request failed");
                (Response::error(err.status(), err.to_string()), false)
            }
        }
    }

    async fn handle_local_service(
        &self,
        payload: LocalServiceRequest,
    ) -> Result<ResponsePayload, OverlayError> {
        let node = self.node.as_ref();
        match payload {
            LocalServiceRequest::RegisterService(service) => {
                let location = node.register_service(service).await?;
                Ok(ResponsePayload::Location(location))
            }
            LocalServiceRequest::DeregisterService { service_type } => {
                node.deregister_service(&service_type).await?;
                Ok(ResponsePayload::Ack)
            }
            LocalServiceRequest::GetNeighbourNodes { .. } => {
                let neighbours =
                    LocalServiceMethods::get_neighbour_nodes_by_distance(node).await?;
                Ok(ResponsePayload::NodeList(neighbours))
            }
            LocalServiceRequest::NeighbourhoodChanged { .. } => Err(OverlayError::Unsupported(
                "neighbourhood change notifications are sent, never served".into(),
            )),
        }
    }

    async fn handle_node(&self, payload: NodeRequest) -> Result<ResponsePayload, OverlayError> {
        let node = self.node.as_ref();
        match payload {
            NodeRequest::GetNodeInfo => {
                Ok(ResponsePayload::NodeInfo(NodeMethods::get_node_info(node).await?))
            }
            NodeRequest::GetNodeCount => {
                let count = node.get_node_count().await?;
                Ok(ResponsePayload::NodeCount(count as u64))
            }
            NodeRequest::GetRandomNodes {
                max_node_count,
                filter,
            } => {
                let nodes =
                    NodeMethods::get_random_nodes(node, max_node_count as usize, filter).await?;
                Ok(ResponsePayload::NodeList(nodes))
            }
            NodeRequest::GetClosestNodesByDistance {
                location,
                radius_km,
                max_node_count,
                filter,
            } => {
                let nodes = NodeMethods::get_closest_nodes_by_distance(
                    node,
                    location,
                    radius_km,
                    max_node_count as usize,
                    filter,
                )
                .await?;
                Ok(ResponsePayload::NodeList(nodes))
            }
            NodeRequest::AcceptColleague(info) => Ok(ResponsePayload::OptionalNodeInfo(
                node.accept_colleague(info).await?,
            )),
            NodeRequest::RenewColleague(info) => Ok(ResponsePayload::OptionalNodeInfo(
                node.renew_colleague(info).await?,
            )),
            NodeRequest::AcceptNeighbour(info) => Ok(ResponsePayload::OptionalNodeInfo(
                node.accept_neighbour(info).await?,
            )),
            NodeRequest::RenewNeighbour(info) => Ok(ResponsePayload::OptionalNodeInfo(
                node.renew_neighbour(info).await?,
            )),
        }
    }

    async fn handle_client(&self, payload: ClientRequest) -> Result<ResponsePayload, OverlayError> {
        let node = self.node.as_ref();
        match payload {
            ClientRequest::GetNodeInfo => {
                Ok(ResponsePayload::NodeInfo(ClientMethods::get_node_info(node).await?))
            }
            ClientRequest::GetNeighbourNodes => {
                let neighbours = ClientMethods::get_neighbour_nodes_by_distance(node).await?;
                Ok(ResponsePayload::NodeList(neighbours))
            }
            ClientRequest::GetRandomNodes {
                max_node_count,
                filter,
            } => {
                let nodes =
                    ClientMethods::get_random_nodes(node, max_node_count as usize, filter).await?;
                Ok(ResponsePayload::NodeList(nodes))
            }
            ClientRequest::GetClosestNodesByDistance {
                location,
                radius_km,
                max_node_count,
                filter,
            } => {
                let nodes = ClientMethods::get_closest_nodes_by_distance(
                    node,
                    location,
                    radius_km,
                    max_node_count as usize,
                    filter,
                )
                .await?;
                Ok(ResponsePayload::NodeList(nodes))
            }
            ClientRequest::ExploreNetworkNodesByDistance {
                location,
                target_node_count,
                max_node_hops,
            } => {
                let nodes = node
                    .explore_network_nodes_by_distance(
                        location,
                        target_node_count as usize,
                        max_node_hops as usize,
                    )
                    .await?;
                Ok(ResponsePayload::NodeList(nodes))
            }
        }
    }
}

/// Per-session change sink.  Holds only a channel sender and a non-owning
/// engine handle; the session task owns the socket, which breaks the
/// session/listener ownership cycle.
struct SessionChangeListener {
    session_id: SessionId,
    tx: mpsc::UnboundedSender<NeighbourhoodChange>,
    node: std::sync::Weak<Node>,
}

impl SessionChangeListener {
    fn forward(&self, change: NeighbourhoodChange) {
        if self.tx.send(change).is_err() {
            // The session is gone; make sure the registration goes with it
            // even if the session task never ran its cleanup.
            if let Some(node) = self.node.upgrade() {
                LocalServiceMethods::remove_listener(node.as_ref(), &self.session_id);
            }
        }
    }
}

impl ChangeListener for SessionChangeListener {
    fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    fn added_node(&self, entry: &NodeDbEntry) {
        if entry.relation == NodeRelation::Neighbour {
            self.forward(NeighbourhoodChange::Added(entry.info.clone()));
        }
    }

    fn updated_node(&self, entry: &NodeDbEntry) {
        if entry.relation == NodeRelation::Neighbour {
            self.forward(NeighbourhoodChange::Updated(entry.info.clone()));
        }
    }

    fn removed_node(&self, entry: &NodeDbEntry) {
        if entry.relation == NodeRelation::Neighbour {
            self.forward(NeighbourhoodChange::Removed {
                node_id: entry.id().clone(),
            });
        }
    }
}

/// Request/response loop for one inbound session, ending either with the
/// stream or with the transition into notification-only mode.
pub async fn serve_session<S>(mut session: Session<S>, node: Arc<Node>, scope: DispatchScope)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let dispatcher = Dispatcher::new(Arc::clone(&node), scope);
    let session_id = session.id().clone();
    let mut notifications: Option<mpsc::UnboundedReceiver<NeighbourhoodChange>> = None;

    loop {
        let message = match session.receive_message().await {
            Ok(message) => message,
            Err(OverlayError::InvalidState(_)) => break, // closed at a frame boundary
            Err(err) => {
                warn!(%session_id, %err, "failed to read request");
                let response = Response::error(err.status(), err.to_string());
                let _ = session
                    .send_message(&Message {
                        id: 0,
                        body: MessageBody::Response(response),
                    })
                    .await;
                break;
            }
        };

        let (response, keep_alive) = match message.body {
            MessageBody::Request(request) => dispatcher.handle_request(request).await,
            MessageBody::Response(_) => (
                Response::error(
                    Status::BadRequest,
                    "a response arrived where a request was expected",
                ),
                false,
            ),
        };
        if session
            .send_message(&Message {
                id: message.id,
                body: MessageBody::Response(response),
            })
            .await
            .is_err()
        {
            break;
        }

        if keep_alive {
            debug!(%session_id, "keepalive requested, serving only notifications from now on");
            let (tx, rx) = mpsc::unbounded_channel();
            LocalServiceMethods::add_listener(
                node.as_ref(),
                Arc::new(SessionChangeListener {
                    session_id: session_id.clone(),
                    tx,
                    node: Arc::downgrade(&node),
                }),
            );
            session.keep_alive();
            notifications = Some(rx);
            break;
        }
    }

    if let Some(mut rx) = notifications {
        let mut next_id = 1u32;
        while let Some(change) = rx.recv().await {
            let request = Request::new(RequestPayload::LocalService(
                LocalServiceRequest::NeighbourhoodChanged {
                    changes: vec![change],
                },
            ));
            let message = Message {
                id: next_id,
                body: MessageBody::Request(request),
            };
            if let Err(err) = session.send_message(&message).await {
                debug!(%session_id, %err, "failed to send change notification");
                break;
            }
            next_id = next_id.wrapping_add(1);
        }
    }

    LocalServiceMethods::remove_listener(node.as_ref(), &session_id);
    debug!(%session_id, "session finished");
}
