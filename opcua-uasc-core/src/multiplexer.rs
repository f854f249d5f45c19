// OPCUA for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! Allocates request ids and matches incoming responses (or aborts) back to the
//! caller awaiting them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use log::warn;
use opcua_types::{status_code::StatusCode, Error};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::{
    comms::{
        message_chunk_info::ChunkInfo, secure_channel::SecureChannel,
        security_header::SecurityHeader,
    },
    errors::ChannelError,
    ResponseMessage,
};

/// What a caller ends up with once their request is no longer pending: either
/// the matching response, or the status/reason the channel aborted it with.
pub type RequestOutcome = Result<ResponseMessage, Error>;

struct PendingRequest {
    reply: oneshot::Sender<RequestOutcome>,
}

/// Tracks in-flight requests for a single secure channel.
///
/// The id counter and pending table both survive a channel renewal: request ids
/// only need to be unique for as long as the channel itself is alive, not for
/// the lifetime of any one security token, so a renewal must not reset them.
pub struct RequestMultiplexer {
    next_request_id: AtomicU32,
    pending: Mutex<HashMap<u32, PendingRequest>>,
}

impl RequestMultiplexer {
    /// Create an empty multiplexer. Request ids start at 1.
    pub fn new() -> Self {
        RequestMultiplexer {
            next_request_id: AtomicU32::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Number of requests currently awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Allocate a fresh request id and register it as pending. Returns the id to
    /// stamp into the outgoing message's sequence header, and a receiver that
    /// resolves once the matching response, or an abort, arrives.
    ///
    /// Unlike the client-handle counters elsewhere in this crate, request ids must
    /// never wrap: a wrapped id could collide with one still pending from early in
    /// the channel's life, silently misrouting a response. Exhausting the `u32`
    /// space is therefore a fatal channel error rather than something to paper
    /// over, per the channel's strictly-increasing request id invariant.
    pub fn begin_request(&self) -> Result<(u32, oneshot::Receiver<RequestOutcome>), ChannelError> {
        let request_id = self
            .next_request_id
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |id| id.checked_add(1))
            .map_err(|_| ChannelError::RequestIdsExhausted)?;
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .insert(request_id, PendingRequest { reply: tx });
        Ok((request_id, rx))
    }

    /// Forget a pending request without resolving it, e.g. because the caller
    /// dropped the receiver (timed out, or is no longer interested).
    pub fn forget(&self, request_id: u32) {
        self.pending.lock().remove(&request_id);
    }

    /// Deliver a decoded response to whoever is awaiting `request_id`.
    ///
    /// A response for a request id that is no longer pending is dropped with a
    /// warning rather than treated as a protocol fault: this is the expected
    /// outcome of a response racing a timeout or a channel close, not an error.
    pub fn complete(&self, request_id: u32, response: ResponseMessage) {
        match self.pending.lock().remove(&request_id) {
            Some(pending) => {
                let _ = pending.reply.send(Ok(response));
            }
            None => {
                warn!(
                    "Received a response for request id {request_id} that is no longer pending, dropping it"
                );
            }
        }
    }

    /// Fail a single pending request, e.g. because the chunk sequence that would
    /// have carried its response was aborted by the sender.
    pub fn abort(&self, request_id: u32, error: Error) {
        match self.pending.lock().remove(&request_id) {
            Some(pending) => {
                let _ = pending.reply.send(Err(error));
            }
            None => {
                warn!(
                    "Received an abort for request id {request_id} that is no longer pending, dropping it"
                );
            }
        }
    }

    /// Fail every pending request with the same status. Used on the close path so
    /// no caller is left waiting on a channel that will never answer.
    pub fn fail_all(&self, status: StatusCode) {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        for (_, pending) in drained {
            let _ = pending
                .reply
                .send(Err(Error::new(status, "secure channel closed")));
        }
    }
}

impl Default for RequestMultiplexer {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate a chunk's header against the channel's installed identity before
/// attempting to decode it.
///
/// The secure channel id must match the one assigned at handshake time, and, for
/// symmetric chunks, the token id must name the current token or the single
/// retained previous token. This is a structural check independent of the
/// security mode in effect: even a `MessageSecurityMode::None` chunk carries a
/// channel id and token id that must be valid.
pub fn validate_chunk_identity(
    secure_channel: &SecureChannel,
    chunk_info: &ChunkInfo,
) -> Result<(), Error> {
    let expected_channel_id = secure_channel.secure_channel_id();
    if expected_channel_id != 0
        && chunk_info.message_header.secure_channel_id != expected_channel_id
    {
        return Err(Error::new(
            StatusCode::BadSecureChannelIdInvalid,
            format!(
                "Chunk secure channel id {} does not match installed id {}",
                chunk_info.message_header.secure_channel_id, expected_channel_id
            ),
        ));
    }

    if let SecurityHeader::Symmetric(header) = &chunk_info.security_header {
        if !secure_channel.has_token(header.token_id) {
            return Err(Error::new(
                StatusCode::BadSecureChannelTokenUnknown,
                format!(
                    "Chunk references unknown security token {}",
                    header.token_id
                ),
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comms::message_chunk::{MessageChunk, MessageChunkType, MessageIsFinalType};
    use opcua_crypto::SecurityPolicy;
    use opcua_types::{CloseSecureChannelResponse, MessageSecurityMode};

    fn unsecured_channel() -> SecureChannel {
        let mut channel = SecureChannel::new_no_certificate_store();
        channel.set_security_policy(SecurityPolicy::None);
        channel.set_security_mode(MessageSecurityMode::None);
        channel
    }

    fn some_response() -> ResponseMessage {
        ResponseMessage::CloseSecureChannel(Box::new(CloseSecureChannelResponse::default()))
    }

    #[test]
    fn request_ids_are_allocated_sequentially() {
        let mux = RequestMultiplexer::new();
        let (id1, _rx1) = mux.begin_request().unwrap();
        let (id2, _rx2) = mux.begin_request().unwrap();
        assert_eq!(id1, 1);
        assert_eq!(id2, 2);
        assert_eq!(mux.pending_count(), 2);
    }

    #[test]
    fn request_id_space_exhaustion_is_a_fatal_channel_error() {
        let mux = RequestMultiplexer::new();
        mux.next_request_id.store(u32::MAX, Ordering::SeqCst);
        let err = mux.begin_request().unwrap_err();
        assert!(matches!(err, ChannelError::RequestIdsExhausted));
    }

    #[tokio::test]
    async fn completing_a_pending_request_resolves_its_receiver() {
        let mux = RequestMultiplexer::new();
        let (id, rx) = mux.begin_request().unwrap();
        mux.complete(id, some_response());
        let outcome = rx.await.unwrap();
        assert!(outcome.is_ok());
        assert_eq!(mux.pending_count(), 0);
    }

    #[test]
    fn completing_an_unknown_request_id_is_dropped_without_panic() {
        let mux = RequestMultiplexer::new();
        mux.complete(42, some_response());
        assert_eq!(mux.pending_count(), 0);
    }

    #[tokio::test]
    async fn aborting_a_pending_request_resolves_its_receiver_with_an_error() {
        let mux = RequestMultiplexer::new();
        let (id, rx) = mux.begin_request().unwrap();
        mux.abort(id, Error::new(StatusCode::BadSecureChannelClosed, "aborted"));
        let outcome = rx.await.unwrap();
        assert_eq!(outcome.unwrap_err().status(), StatusCode::BadSecureChannelClosed);
    }

    #[tokio::test]
    async fn fail_all_resolves_every_pending_request() {
        let mux = RequestMultiplexer::new();
        let (_id1, rx1) = mux.begin_request().unwrap();
        let (_id2, rx2) = mux.begin_request().unwrap();
        mux.fail_all(StatusCode::BadConnectionClosed);
        assert_eq!(
            rx1.await.unwrap().unwrap_err().status(),
            StatusCode::BadConnectionClosed
        );
        assert_eq!(
            rx2.await.unwrap().unwrap_err().status(),
            StatusCode::BadConnectionClosed
        );
        assert_eq!(mux.pending_count(), 0);
    }

    #[test]
    fn validate_chunk_identity_rejects_mismatched_channel_id() {
        let mut channel = unsecured_channel();
        channel.set_secure_channel_id(7);
        let chunk = MessageChunk::new(
            1,
            1,
            MessageChunkType::Message,
            MessageIsFinalType::Final,
            &unsecured_channel_with_id(9),
            &[1, 2, 3],
        )
        .unwrap();
        let chunk_info = chunk.chunk_info(&channel).unwrap();
        let err = validate_chunk_identity(&channel, &chunk_info).unwrap_err();
        assert_eq!(err.status(), StatusCode::BadSecureChannelIdInvalid);
    }

    fn unsecured_channel_with_id(id: u32) -> SecureChannel {
        let mut channel = unsecured_channel();
        channel.set_secure_channel_id(id);
        channel
    }

    #[test]
    fn validate_chunk_identity_rejects_unknown_token() {
        let channel = unsecured_channel();
        let chunk = MessageChunk::new(
            1,
            1,
            MessageChunkType::Message,
            MessageIsFinalType::Final,
            &channel,
            &[1, 2, 3],
        )
        .unwrap();
        let chunk_info = chunk.chunk_info(&channel).unwrap();
        let err = validate_chunk_identity(&channel, &chunk_info).unwrap_err();
        assert_eq!(err.status(), StatusCode::BadSecureChannelTokenUnknown);
    }
}
