// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! TCP front-end: one listener for the node-to-node port, one for the
//! local-service/client port, both speaking the same framing.  Every
//! accepted connection is served by its own task, so a failing session
//! never takes down another one or the process.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::api::Node;
use crate::dispatch::{serve_session, DispatchScope};
use crate::error::OverlayError;
use crate::session::Session;

/// How long draining sessions are given after shutdown before being aborted.
pub const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(5);

pub struct OverlayServer {
    node_addr: SocketAddr,
    client_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    accept_tasks: Vec<JoinHandle<()>>,
}

impl OverlayServer {
    /// Bind both listeners and start accepting.
    pub async fn start(
        node: Arc<Node>,
        node_bind: SocketAddr,
        client_bind: SocketAddr,
    ) -> Result<Self, OverlayError> {
        let node_listener = bind(node_bind).await?;
        let client_listener = bind(client_bind).await?;
        let node_addr = local_addr(&node_listener)?;
        let client_addr = local_addr(&client_listener)?;
        info!(%node_addr, %client_addr, "listening");

        let (shutdown, _) = watch::channel(false);
        let accept_tasks = vec![
            tokio::spawn(accept_loop(
                node_listener,
                Arc::clone(&node),
                DispatchScope::NodePort,
                shutdown.subscribe(),
            )),
            tokio::spawn(accept_loop(
                client_listener,
                node,
                DispatchScope::ClientPort,
                shutdown.subscribe(),
            )),
        ];
        Ok(Self {
            node_addr,
            client_addr,
            shutdown,
            accept_tasks,
        })
    }

    /// Actual bound address of the node-to-node listener.
    pub fn node_addr(&self) -> SocketAddr {
        self.node_addr
    }

    /// Actual bound address of the local-service/client listener.
    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    /// Stop accepting, let in-flight sessions drain within the grace
    /// period, then abort whatever is left.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.accept_tasks {
            if task.await.is_err() {
                warn!("accept loop ended with a panic");
            }
        }
    }
}

async fn bind(addr: SocketAddr) -> Result<TcpListener, OverlayError> {
    TcpListener::bind(addr)
        .await
        .map_err(|err| OverlayError::Connection(format!("bind {addr}: {err}")))
}

fn local_addr(listener: &TcpListener) -> Result<SocketAddr, OverlayError> {
    listener
        .local_addr()
        .map_err(|err| OverlayError::Internal(format!("listener address: {err}")))
}

async fn accept_loop(
    listener: TcpListener,
    node: Arc<Node>,
    scope: DispatchScope,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut sessions = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    debug!(%remote, ?scope, "connection accepted");
                    let node = Arc::clone(&node);
                    sessions.spawn(async move {
                        serve_session(Session::accepted(stream, remote), node, scope).await;
                    });
                }
                Err(err) => {
                    warn!(%err, "failed to accept connection");
                }
            },
        }
        // Reap finished sessions so the set does not grow unbounded.
        while sessions.try_join_next().is_some() {}
    }

    drop(listener);
    let drain = async {
        while sessions.join_next().await.is_some() {}
    };
    if tokio::time::timeout(SHUTDOWN_GRACE_PERIOD, drain).await.is_err() {
        debug!(?scope, "grace period over, aborting remaining sessions");
        sessions.abort_all();
    }
}
