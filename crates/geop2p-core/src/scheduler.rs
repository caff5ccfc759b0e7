// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Single cooperative task driving the periodic maintenance actions with
//! monotonic next-run times.  A task never overlaps itself; different
//! tasks interleave on the same loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::api::Node;

/// How long shutdown waits for the in-flight maintenance action.
pub const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(5);

pub struct MaintenanceScheduler {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MaintenanceScheduler {
    pub fn start(node: Arc<Node>) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(run_loop(node, rx));
        Self { shutdown, task }
    }

    /// Signal cancellation and wait for the current action to finish
    /// within the grace period.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        match tokio::time::timeout(SHUTDOWN_GRACE_PERIOD, self.task).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => warn!("maintenance loop ended with a panic"),
            Err(_) => warn!("maintenance loop did not stop within the grace period"),
        }
    }
}

async fn run_loop(node: Arc<Node>, mut shutdown: watch::Receiver<bool>) {
    let db_period = node.config().db_maintenance_period;
    let discovery_period = node.config().discovery_period;
    let mut next_db_run = Instant::now() + db_period;
    let mut next_discovery_run = Instant::now() + discovery_period;

    loop {
        let wake_at = next_db_run.min(next_discovery_run);
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep_until(wake_at) => {}
        }

        let now = Instant::now();
        if now >= next_db_run {
            debug!("running database maintenance");
            node.run_db_maintenance().await;
            next_db_run = Instant::now() + db_period;
        }
        if now >= next_discovery_run {
            debug!("running discovery");
            node.run_discovery().await;
            next_discovery_run = Instant::now() + discovery_period;
        }
    }
    debug!("maintenance loop stopped");
}
