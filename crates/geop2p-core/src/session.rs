// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Length-prefixed framed message transport over a reliable byte stream.
//!
//! Frame layout: one version byte (constant 1), a little-endian u32 body
//! length, then the CBOR-encoded [`Message`].  A failed read or an
//! oversized frame terminates the session.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::trace;

use crate::error::OverlayError;
use crate::ids::SessionId;
use crate::peer::NetworkEndpoint;
use crate::wire::Message;

pub const FRAME_VERSION: u8 = 1;
pub const MAX_MESSAGE_BYTES: usize = 1024 * 1024;

/// I/O deadline for connects and normal request/response streams.
/// Keepalive sessions clear it and never expire.
pub const NORMAL_STREAM_EXPIRATION: Duration = Duration::from_secs(10);

pub struct Session<S> {
    id: SessionId,
    io: S,
    io_expiration: Option<Duration>,
}

impl Session<TcpStream> {
    /// Dial a remote endpoint.  The connect itself and all subsequent I/O
    /// run under the normal stream expiration.
    pub async fn connect(endpoint: &NetworkEndpoint) -> Result<Self, OverlayError> {
        let addr = SocketAddr::new(endpoint.address, endpoint.port);
        let stream = tokio::time::timeout(NORMAL_STREAM_EXPIRATION, TcpStream::connect(addr))
            .await
            .map_err(|_| OverlayError::Connection(format!("connect to {endpoint} timed out")))?
            .map_err(|err| OverlayError::Connection(format!("connect to {endpoint}: {err}")))?;
        Ok(Self {
            id: endpoint.to_string(),
            io: stream,
            io_expiration: Some(NORMAL_STREAM_EXPIRATION),
        })
    }
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap an accepted stream.  Inbound sessions carry no read deadline;
    /// the peer decides when to speak.
    pub fn accepted(io: S, remote: SocketAddr) -> Self {
        Self {
            id: format!("{}:{}", remote.ip(), remote.port()),
            io,
            io_expiration: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn for_test(io: S, id: &str) -> Self {
        Self {
            id: id.to_owned(),
            io,
            io_expiration: None,
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Switch to keepalive mode: no further I/O deadlines.
    pub fn keep_alive(&mut self) {
        self.io_expiration = None;
    }

    pub async fn send_message(&mut self, message: &Message) -> Result<(), OverlayError> {
        let body = serde_cbor::to_vec(message)
            .map_err(|err| OverlayError::Internal(format!("encode message: {err}")))?;
        if body.len() > MAX_MESSAGE_BYTES {
            return Err(OverlayError::BadRequest(format!(
                "session {} message size is over limit: {}",
                self.id,
                body.len()
            )));
        }
        let expiration = self.io_expiration;
        let id = self.id.clone();
        let write = async {
            self.io.write_u8(FRAME_VERSION).await?;
            self.io.write_u32_le(body.len() as u32).await?;
            self.io.write_all(&body).await?;
            self.io.flush().await?;
            Ok::<(), std::io::Error>(())
        };
        maybe_timeout(expiration, write)
            .await
            .map_err(|err| OverlayError::Connection(format!("session {id} send failed: {err}")))?;
        trace!(session_id = %self.id, bytes = body.len(), "sent message");
        Ok(())
    }

    pub async fn receive_message(&mut self) -> Result<Message, OverlayError> {
        let expiration = self.io_expiration;
        let id = self.id.clone();

        // First header byte separately: a clean EOF here means the remote
        // closed the connection at a frame boundary.
        let version = match maybe_timeout(expiration, self.io.read_u8()).await {
            Ok(version) => version,
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(OverlayError::InvalidState(format!(
                    "session {id} connection is already closed"
                )));
            }
            Err(err) => {
                return Err(OverlayError::Connection(format!(
                    "session {id} failed to read header: {err}"
                )));
            }
        };
        if version != FRAME_VERSION {
            return Err(OverlayError::BadRequest(format!(
                "session {id} unsupported frame version {version}"
            )));
        }

        let body_len = maybe_timeout(expiration, self.io.read_u32_le())
            .await
            .map_err(|err| map_mid_frame(&id, "message header", err))?
            as usize;
        if body_len > MAX_MESSAGE_BYTES {
            return Err(OverlayError::BadRequest(format!(
                "session {id} message size is over limit: {body_len}"
            )));
        }

        let mut body = vec![0u8; body_len];
        maybe_timeout(expiration, self.io.read_exact(&mut body))
            .await
            .map_err(|err| map_mid_frame(&id, "message body", err))?;
        trace!(session_id = %self.id, bytes = body_len, "received message");

        serde_cbor::from_slice(&body).map_err(|err| {
            OverlayError::BadRequest(format!("session {id} undecodable message: {err}"))
        })
    }
}

async fn maybe_timeout<T, F>(expiration: Option<Duration>, op: F) -> Result<T, std::io::Error>
where
    F: std::future::Future<Output = Result<T, std::io::Error>>,
{
    match expiration {
        Some(expiration) => tokio::time::timeout(expiration, op)
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "stream expired"))?,
        None => op.await,
    }
}

fn map_mid_frame(session_id: &str, what: &str, err: std::io::Error) -> OverlayError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        OverlayError::ProtocolViolation(format!(
            "session {session_id} failed to read full {what}, connection may have been closed"
        ))
    } else {
        OverlayError::Connection(format!(
            "session {session_id} failed to read {what}: {err}"
        ))
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::wire::{MessageBody, Request, RequestPayload, NodeRequest};

    fn message(id: u32) -> Message {
        Message {
            id,
            body: MessageBody::Request(Request::new(RequestPayload::Node(
                NodeRequest::GetNodeInfo,
            ))),
        }
    }

    #[tokio::test]
    async fn frame_roundtrip() {
        let (a, b) = tokio::io::duplex(4096);
        let mut sender = Session::for_test(a, "10.0.0.1:16980");
        let mut receiver = Session::for_test(b, "10.0.0.2:16980");

        let sent = message(42);
        sender.send_message(&sent).await.expect("send");
        let received = receiver.receive_message().await.expect("receive");
        assert_eq!(received, sent);
    }

    #[tokio::test]
    async fn eof_at_frame_boundary_is_invalid_state() {
        let (a, b) = tokio::io::duplex(64);
        drop(a);
        let mut session = Session::for_test(b, "10.0.0.2:16980");
        let err = session.receive_message().await.expect_err("must fail");
        assert!(matches!(err, OverlayError::InvalidState(_)), "got {err}");
    }

    #[tokio::test]
    async fn truncated_header_is_protocol_violation() {
        let (mut a, b) = tokio::io::duplex(64);
        a.write_all(&[FRAME_VERSION, 0x10]).await.expect("write");
        drop(a);

        let mut session = Session::for_test(b, "10.0.0.2:16980");
        let err = session.receive_message().await.expect_err("must fail");
        assert!(matches!(err, OverlayError::ProtocolViolation(_)), "got {err}");
    }

    #[tokio::test]
    async fn truncated_body_is_protocol_violation() {
        let (mut a, b) = tokio::io::duplex(64);
        let mut frame = vec![FRAME_VERSION];
        frame.extend_from_slice(&8u32.to_le_bytes());
        frame.extend_from_slice(&[1, 2, 3]); // 3 of 8 promised bytes
        a.write_all(&frame).await.expect("write");
        drop(a);

        let mut session = Session::for_test(b, "10.0.0.2:16980");
        let err = session.receive_message().await.expect_err("must fail");
        assert!(matches!(err, OverlayError::ProtocolViolation(_)), "got {err}");
    }

    #[tokio::test]
    async fn oversized_length_is_bad_request() {
        let (mut a, b) = tokio::io::duplex(64);
        let mut frame = vec![FRAME_VERSION];
        frame.extend_from_slice(&((MAX_MESSAGE_BYTES as u32) + 1).to_le_bytes());
        a.write_all(&frame).await.expect("write");

        let mut session = Session::for_test(b, "10.0.0.2:16980");
        let err = session.receive_message().await.expect_err("must fail");
        assert!(matches!(err, OverlayError::BadRequest(_)), "got {err}");
    }

    #[tokio::test]
    async fn wrong_version_byte_is_bad_request() {
        let (mut a, b) = tokio::io::duplex(64);
        a.write_all(&[9, 0, 0, 0, 0]).await.expect("write");

        let mut session = Session::for_test(b, "10.0.0.2:16980");
        let err = session.receive_message().await.expect_err("must fail");
        assert!(matches!(err, OverlayError::BadRequest(_)), "got {err}");
    }

    #[tokio::test]
    async fn empty_body_decodes_to_bad_request() {
        // A well-formed zero-length frame carries no message at all.
        let (mut a, b) = tokio::io::duplex(64);
        a.write_all(&[FRAME_VERSION, 0, 0, 0, 0]).await.expect("write");

        let mut session = Session::for_test(b, "10.0.0.2:16980");
        let err = session.receive_message().await.expect_err("must fail");
        assert!(matches!(err, OverlayError::BadRequest(_)), "got {err}");
    }

    #[tokio::test]
    async fn body_of_exactly_one_mebibyte_is_accepted() {
        use crate::peer::ServiceInfo;
        use crate::wire::LocalServiceRequest;

        let build = |payload_len: usize| Message {
            id: 1,
            body: MessageBody::Request(Request::new(RequestPayload::LocalService(
                LocalServiceRequest::RegisterService(ServiceInfo {
                    service_type: "profile".into(),
                    address: "10.0.0.1".parse().expect("valid ip"),
                    port: 16985,
                    payload: Some(vec![0u8; payload_len]),
                }),
            ))),
        };
        // Pad the service payload until the encoded body is exactly 1 MiB.
        // The probe payload is large enough that the CBOR byte-string
        // header has the same width as in the final message.
        let probe = 100_000;
        let overhead = serde_cbor::to_vec(&build(probe)).expect("encode").len() - probe;
        let message = build(MAX_MESSAGE_BYTES - overhead);
        assert_eq!(
            serde_cbor::to_vec(&message).expect("encode").len(),
            MAX_MESSAGE_BYTES
        );

        let (a, b) = tokio::io::duplex(MAX_MESSAGE_BYTES + 16);
        let mut sender = Session::for_test(a, "10.0.0.1:16980");
        let mut receiver = Session::for_test(b, "10.0.0.2:16980");

        let send = tokio::spawn(async move {
            sender.send_message(&message).await.expect("send");
            sender
        });
        let received = receiver.receive_message().await.expect("receive");
        send.await.expect("join");
        match received.body {
            MessageBody::Request(_) => {}
            MessageBody::Response(_) => panic!("expected request"),
        }
    }

    #[tokio::test]
    async fn send_rejects_body_over_limit() {
        use crate::peer::ServiceInfo;
        use crate::wire::LocalServiceRequest;

        let message = Message {
            id: 1,
            body: MessageBody::Request(Request::new(RequestPayload::LocalService(
                LocalServiceRequest::RegisterService(ServiceInfo {
                    service_type: "profile".into(),
                    address: "10.0.0.1".parse().expect("valid ip"),
                    port: 16985,
                    payload: Some(vec![0u8; MAX_MESSAGE_BYTES]),
                }),
            ))),
        };
        let (a, _b) = tokio::io::duplex(64);
        let mut sender = Session::for_test(a, "10.0.0.1:16980");
        let err = sender.send_message(&message).await.expect_err("must fail");
        assert!(matches!(err, OverlayError::BadRequest(_)), "got {err}");
    }
}
