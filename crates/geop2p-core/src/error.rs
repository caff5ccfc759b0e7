// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use thiserror::Error;

use crate::wire::Status;

/// Error taxonomy of the overlay.  Every variant maps onto a wire
/// [`Status`] so errors can cross node boundaries as status + details.
#[derive(Debug, Error)]
pub enum OverlayError {
    /// Malformed or semantically invalid inbound message.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Peer returned a structurally invalid response or a non-OK status.
    #[error("bad response: {0}")]
    BadResponse(String),

    /// TCP-level failure to connect or send.
    #[error("connection failed: {0}")]
    Connection(String),

    /// Framing read failed mid-frame.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Operation on a closed or not-yet-initialized object.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Invariant violation or unexpected failure bubbling out of a method.
    #[error("internal error: {0}")]
    Internal(String),

    /// Feature negotiated off.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Storing an entry would violate node-id uniqueness.
    #[error("conflicting id: {0}")]
    ConflictingId(String),

    /// Update or removal of an unknown node id in the spatial store.
    #[error("not found: {0}")]
    NotFound(String),

    /// GPS coordinate outside the valid range.
    #[error("invalid coordinate: {0}")]
    InvalidCoordinate(String),
}

impl OverlayError {
    pub fn status(&self) -> Status {
        match self {
            Self::BadRequest(_) => Status::BadRequest,
            Self::BadResponse(_) => Status::BadResponse,
            Self::Connection(_) => Status::Connection,
            Self::ProtocolViolation(_) => Status::ProtocolViolation,
            Self::InvalidState(_) => Status::InvalidState,
            Self::Internal(_) => Status::Internal,
            Self::Unsupported(_) => Status::Unsupported,
            // Store-level conflicts surface as request-shaped problems to the
            // caller; a missing id only arises when a maintenance path loses
            // a race against removal, which is an internal slip.
            Self::ConflictingId(_) | Self::InvalidCoordinate(_) => Status::BadRequest,
            Self::NotFound(_) => Status::Internal,
        }
    }

    /// Rebuild an error from a remote response status.  `Ok` is not an
    /// error and is rejected as a bad response.
    pub fn from_status(status: Status, details: &str) -> Self {
        match status {
            Status::Ok => Self::BadResponse("status OK carried as an error".into()),
            Status::BadRequest => Self::BadRequest(details.into()),
            Status::BadResponse => Self::BadResponse(details.into()),
            Status::Connection => Self::Connection(details.into()),
            Status::ProtocolViolation => Self::ProtocolViolation(details.into()),
            Status::InvalidState => Self::InvalidState(details.into()),
            Status::Internal => Self::Internal(details.into()),
            Status::Unsupported => Self::Unsupported(details.into()),
        }
    }
}

impl From<serde_cbor::Error> for OverlayError {
    fn from(err: serde_cbor::Error) -> Self {
        Self::BadRequest(format!("undecodable message: {err}"))
    }
}

impl From<rusqlite::Error> for OverlayError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Internal(format!("spatial database: {err}"))
    }
}
