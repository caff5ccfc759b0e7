// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::ids::SessionId;
use crate::peer::NodeDbEntry;

/// Sink for spatial-store mutations.  Callbacks run synchronously with the
/// mutation that produced them and must not block.
pub trait ChangeListener: Send + Sync {
    fn session_id(&self) -> &SessionId;
    fn on_registered(&self) {}
    fn added_node(&self, entry: &NodeDbEntry);
    fn updated_node(&self, entry: &NodeDbEntry);
    fn removed_node(&self, entry: &NodeDbEntry);
}

/// Mutex-guarded `{session id → listener}` map.  Publication iterates over a
/// snapshot taken under the lock and invokes callbacks outside it; a
/// panicking listener does not stop the others and never rolls back the
/// store mutation.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: Mutex<HashMap<SessionId, Arc<dyn ChangeListener>>>,
}

impl ListenerRegistry {
    pub fn add(&self, listener: Arc<dyn ChangeListener>) {
        let session_id = listener.session_id().clone();
        self.listeners
            .lock()
            .expect("listener registry lock poisoned")
            .insert(session_id, Arc::clone(&listener));
        listener.on_registered();
    }

    pub fn remove(&self, session_id: &str) -> bool {
        self.listeners
            .lock()
            .expect("listener registry lock poisoned")
            .remove(session_id)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.listeners
            .lock()
            .expect("listener registry lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<Arc<dyn ChangeListener>> {
        self.listeners
            .lock()
            .expect("listener registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn publish_added(&self, entry: &NodeDbEntry) {
        self.publish(entry, |listener, entry| listener.added_node(entry));
    }

    pub fn publish_updated(&self, entry: &NodeDbEntry) {
        self.publish(entry, |listener, entry| listener.updated_node(entry));
    }

    pub fn publish_removed(&self, entry: &NodeDbEntry) {
        self.publish(entry, |listener, entry| listener.removed_node(entry));
    }

    fn publish<F>(&self, entry: &NodeDbEntry, deliver: F)
    where
        F: Fn(&dyn ChangeListener, &NodeDbEntry),
    {
        for listener in self.snapshot() {
            let outcome = catch_unwind(AssertUnwindSafe(|| deliver(listener.as_ref(), entry)));
            if outcome.is_err() {
                warn!(
                    session_id = %listener.session_id(),
                    "change listener panicked, skipping"
                );
            }
        }
    }
}
