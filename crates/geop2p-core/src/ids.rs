// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::OverlayError;

/// Opaque node identity.  Must be non-empty; uniqueness across the overlay
/// is the operator's responsibility.  Ordering is lexicographic and is used
/// for every tie-break in distance-sorted results.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub String);

/// Session identity, the `"host:port"` string of the remote endpoint.
pub type SessionId = String;

impl NodeId {
    pub fn new(id: impl Into<String>) -> Result<Self, OverlayError> {
        let id = id.into();
        if id.is_empty() {
            return Err(OverlayError::BadRequest("node id must not be empty".into()));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
