// OPCUA for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! Drives a single OPC UA TCP secure channel end to end: opens it, multiplexes
//! requests over it, renews its security token before expiry, and closes it.
//!
//! The rest of this crate models the pieces in isolation (framing, chunking,
//! the handshake, the pending-request table). This module wires them together
//! into the single-task-per-channel event loop described by the component
//! design: one task strictly serializes everything that touches the channel,
//! since the wire protocol is not safe to drive from more than one place at
//! once.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, trace, warn};
use opcua_types::{
    status_code::StatusCode, CloseSecureChannelRequest, CloseSecureChannelResponse,
    DecodingOptions, Error, SecurityTokenRequestType,
};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};

use futures::StreamExt;
use tokio_util::codec::FramedRead;

use crate::{
    comms::{
        buffer::{AssemblerEvent, ChunkAssembler},
        chunker::Chunker,
        message_chunk::{MessageChunk, MessageChunkType, MessageIsFinalType},
        secure_channel::SecureChannel,
        security_header::SecurityHeader,
        tcp_codec::{Message as WireMessage, TcpCodec},
    },
    errors::ChannelError,
    handshake::{
        apply_open_secure_channel_response, build_open_secure_channel_request,
        decode_open_secure_channel_response, encode_open_secure_channel_request, renewal_delay,
        CertificateValidator, HandshakeController, HandshakeState,
    },
    handle::AtomicHandle,
    multiplexer::{validate_chunk_identity, RequestMultiplexer},
    sync::RwLock,
    Message, MessageType, RequestMessage, ResponseMessage,
};

/// Negotiated parameters a [`SecureChannelEventLoop`] enforces for one connection.
///
/// These mirror the values exchanged during the Hello/Acknowledge preamble; since
/// that preamble is out of scope for this crate (see the crate documentation),
/// the caller is responsible for filling this in from whatever it negotiated.
#[derive(Debug, Clone)]
pub struct ChannelParams {
    /// Limits applied when decoding incoming structured messages.
    pub decoding_options: DecodingOptions,
    /// Max number of chunks a single inbound message may be split into. `0` for unlimited.
    pub local_max_chunk_count: usize,
    /// Max size in bytes of a single inbound chunk. `0` for unlimited.
    pub local_receive_buffer_size: usize,
    /// Max size in bytes of a single outbound message, checked before chunking. `0` for unlimited.
    pub remote_max_message_size: usize,
    /// Max size in bytes of a single outbound chunk.
    pub max_chunk_size: usize,
    /// Requested channel lifetime sent in each `OpenSecureChannelRequest`, in milliseconds.
    pub requested_lifetime: u32,
}

impl Default for ChannelParams {
    fn default() -> Self {
        ChannelParams {
            decoding_options: DecodingOptions::default(),
            local_max_chunk_count: 64,
            local_receive_buffer_size: 64 * 1024,
            remote_max_message_size: 2 * 1024 * 1024,
            max_chunk_size: 8192,
            requested_lifetime: 60 * 60 * 1000,
        }
    }
}

/// A request handed to the event loop to encode and send, alongside its allocated
/// request id, or a request to close the channel.
pub(crate) enum OutgoingMessage {
    /// Send a service request, keyed by the id the multiplexer already allocated for it.
    Request {
        /// The request to serialize and chunk-encode.
        request: RequestMessage,
        /// The id under which the response (or abort) will be routed back.
        request_id: u32,
    },
    /// Send a `CloseSecureChannelRequest` and stop the event loop afterwards.
    Close,
}

/// What happened on one call to [`SecureChannelEventLoop::poll`].
#[derive(Debug)]
#[non_exhaustive]
pub enum TransportPollResult {
    /// A complete response was decoded and routed to the request awaiting it
    /// (or dropped with a warning if nothing was waiting).
    IncomingMessage,
    /// One chunk of a larger inbound message arrived; nothing was decoded yet.
    IncomingChunk,
    /// A request was encoded and written to the transport.
    OutgoingMessageSent,
    /// The channel finished opening, or finished renewing its security token.
    SecureChannelReady,
    /// The channel is closed. Carries the reason; `Good` for a clean local close.
    Closed(StatusCode),
}

/// Shared state for a secure channel that outlives any single connection attempt.
///
/// Per the source's attribute-keyed pending-request table and request-id counter:
/// both need to survive a transport reconnect on the same logical channel, so they
/// live here rather than on the per-connection event loop.
pub struct SecureChannelContext {
    channel: RwLock<SecureChannel>,
    handshake: HandshakeController,
    requests: RequestMultiplexer,
    request_handles: AtomicHandle,
    params: ChannelParams,
}

impl SecureChannelContext {
    /// Create a new context wrapping the given (not yet opened) secure channel.
    pub fn new(channel: SecureChannel, params: ChannelParams) -> Arc<Self> {
        Arc::new(SecureChannelContext {
            channel: RwLock::new(channel),
            handshake: HandshakeController::new(),
            requests: RequestMultiplexer::new(),
            request_handles: AtomicHandle::default(),
            params,
        })
    }

    /// The channel id assigned by the server, or `0` before the first handshake.
    pub fn channel_id(&self) -> u32 {
        self.channel.read().secure_channel_id()
    }

    /// Current handshake/lifecycle state.
    pub fn state(&self) -> HandshakeState {
        self.handshake.state()
    }

    /// Number of requests currently awaiting a response.
    pub fn pending_request_count(&self) -> usize {
        self.requests.pending_count()
    }
}

/// A cloneable handle for submitting requests over a secure channel.
///
/// This is the handle upper layers hold on to; the matching [`SecureChannelEventLoop`]
/// must be polled continuously (e.g. on its own task) for anything sent through this
/// handle to actually make progress.
#[derive(Clone)]
pub struct AsyncSecureChannel {
    context: Arc<SecureChannelContext>,
    outgoing: mpsc::Sender<OutgoingMessage>,
}

impl AsyncSecureChannel {
    /// Send a request and wait for its response.
    ///
    /// Resolves once the matching response is decoded, the request is aborted by
    /// the server, or the channel closes before either happens.
    pub async fn send(&self, request: impl Into<RequestMessage>) -> Result<ResponseMessage, Error> {
        let (request_id, rx) = self
            .context
            .requests
            .begin_request()
            .map_err(|e| Error::new(e.status(), e.to_string()))?;

        if self
            .outgoing
            .send(OutgoingMessage::Request {
                request: request.into(),
                request_id,
            })
            .await
            .is_err()
        {
            self.context.requests.forget(request_id);
            return Err(Error::new(
                StatusCode::BadConnectionClosed,
                "secure channel is closed",
            ));
        }

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::new(
                StatusCode::BadConnectionClosed,
                "secure channel closed before a response arrived",
            )),
        }
    }

    /// Ask the event loop to close the channel. Does not wait for the close to finish;
    /// poll the event loop until it returns [`TransportPollResult::Closed`].
    pub async fn close(&self) {
        let _ = self.outgoing.send(OutgoingMessage::Close).await;
    }

    /// The channel id assigned by the server, or `0` before the first handshake.
    pub fn channel_id(&self) -> u32 {
        self.context.channel_id()
    }

    /// Current handshake/lifecycle state.
    pub fn state(&self) -> HandshakeState {
        self.context.state()
    }

    /// Number of requests currently awaiting a response.
    pub fn pending_request_count(&self) -> usize {
        self.context.pending_request_count()
    }
}

/// Drives one secure channel over one transport connection.
///
/// Must be polled in a loop (via [`SecureChannelEventLoop::poll`]) for the channel
/// to make progress; nothing happens spontaneously. [`SecureChannelEventLoop::open`]
/// must complete successfully before the loop is entered, per the handshake
/// controller's `CLOSED -> OPENING -> OPEN` transition.
pub struct SecureChannelEventLoop<S> {
    context: Arc<SecureChannelContext>,
    read: FramedRead<ReadHalf<S>, TcpCodec>,
    write: WriteHalf<S>,
    outgoing: mpsc::Receiver<OutgoingMessage>,
    cert_validator: Option<Arc<dyn CertificateValidator>>,

    opn_assembler: ChunkAssembler,
    msg_assembler: ChunkAssembler,

    next_sequence_number: u32,
    last_received_sequence_number: u32,

    /// Request id of the OPN request currently in flight (Issue or Renew), if any.
    open_request_id: Option<u32>,
    handshake_deadline: Option<Instant>,
    renewal_deadline: Option<Instant>,

    closing: bool,
}

/// Pair a fresh [`AsyncSecureChannel`] handle with the [`SecureChannelEventLoop`] that
/// drives it over `stream`.
///
/// `stream` is assumed to already be past the Hello/Acknowledge preamble (see the
/// crate documentation's scope note).
pub fn channel<S>(
    stream: S,
    context: Arc<SecureChannelContext>,
    cert_validator: Option<Arc<dyn CertificateValidator>>,
) -> (AsyncSecureChannel, SecureChannelEventLoop<S>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let decoding_options = context.params.decoding_options.clone();
    let read = FramedRead::new(read_half, TcpCodec::new(decoding_options));
    let (tx, rx) = mpsc::channel(32);

    let event_loop = SecureChannelEventLoop {
        opn_assembler: ChunkAssembler::new(
            context.params.local_receive_buffer_size,
            context.params.local_max_chunk_count,
        ),
        msg_assembler: ChunkAssembler::new(
            context.params.local_receive_buffer_size,
            context.params.local_max_chunk_count,
        ),
        context: context.clone(),
        read,
        write: write_half,
        outgoing: rx,
        cert_validator,
        next_sequence_number: 1,
        last_received_sequence_number: 0,
        open_request_id: None,
        handshake_deadline: None,
        renewal_deadline: None,
        closing: false,
    };

    let handle = AsyncSecureChannel {
        context,
        outgoing: tx,
    };

    (handle, event_loop)
}

/// Outcome of processing a single decoded wire message, internal to the event loop.
enum ProcessedEvent {
    /// Nothing externally interesting happened (e.g. an intermediate chunk arrived).
    Chunk,
    /// A secure channel open/renew finished successfully.
    HandshakeReady,
    /// A full response was routed to the multiplexer.
    Response,
    /// A `CloseSecureChannelResponse` was received; the peer acknowledged our close.
    CloseAcknowledged,
}

impl<S> SecureChannelEventLoop<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Run the initial `Issue` handshake to completion, racing it against the
    /// 10-second handshake timeout.
    ///
    /// Must be called exactly once, before [`poll`](Self::poll) is called in a loop.
    pub async fn open(&mut self) -> Result<(), StatusCode> {
        self.begin_open_secure_channel(SecurityTokenRequestType::Issue)
            .await
            .map_err(|e| e.status())?;

        let deadline = self
            .handshake_deadline
            .expect("handshake deadline is armed by begin_open_secure_channel for an Issue");

        loop {
            tokio::select! {
                incoming = self.read.next() => {
                    match self.handle_incoming(incoming) {
                        Ok(ProcessedEvent::HandshakeReady) => return Ok(()),
                        Ok(_) => continue,
                        Err(e) => {
                            self.context.handshake.fail();
                            return Err(e.status());
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline.into()) => {
                    error!("Timed out waiting for OpenSecureChannelResponse");
                    self.context.handshake.fail();
                    self.context.requests.fail_all(StatusCode::BadConnectionClosed);
                    return Err(StatusCode::BadTimeout);
                }
            }
        }
    }

    /// Drive the channel for one step: read the next chunk, write the next queued
    /// outgoing message, or notice the handshake timeout. Must be called repeatedly.
    ///
    /// Cancellation safe: at most one future is awaited per call (either the
    /// `tokio::select!` below, for a channel already open, or the renewal send
    /// on the line before it; never both in the same call).
    pub async fn poll(&mut self) -> TransportPollResult {
        if self.closing {
            return self.drain_close().await;
        }

        if self.should_begin_renewal() {
            if let Err(e) = self
                .begin_open_secure_channel(SecurityTokenRequestType::Renew)
                .await
            {
                return self.fail_channel(e.status()).await;
            }
            return TransportPollResult::OutgoingMessageSent;
        }

        tokio::select! {
            incoming = self.read.next() => {
                match self.handle_incoming(incoming) {
                    Ok(ProcessedEvent::Chunk) => TransportPollResult::IncomingChunk,
                    Ok(ProcessedEvent::HandshakeReady) => TransportPollResult::SecureChannelReady,
                    Ok(ProcessedEvent::Response) => TransportPollResult::IncomingMessage,
                    Ok(ProcessedEvent::CloseAcknowledged) => {
                        self.closing = true;
                        TransportPollResult::OutgoingMessageSent
                    }
                    Err(e) => self.fail_channel_sync(e.status()),
                }
            }
            outgoing = self.outgoing.recv() => {
                match outgoing {
                    Some(OutgoingMessage::Request { request, request_id }) => {
                        match self.send_request(request, request_id).await {
                            Ok(()) => TransportPollResult::OutgoingMessageSent,
                            Err(e) => {
                                self.context.requests.abort(request_id, Error::new(e.status(), e.to_string()));
                                TransportPollResult::IncomingMessage
                            }
                        }
                    }
                    Some(OutgoingMessage::Close) => {
                        match self.send_close_request().await {
                            Ok(()) => TransportPollResult::OutgoingMessageSent,
                            Err(e) => self.fail_channel_sync(e.status()),
                        }
                    }
                    None => self.fail_channel_sync(StatusCode::BadConnectionClosed),
                }
            }
        }
    }

    fn should_begin_renewal(&self) -> bool {
        self.context.handshake.state() == HandshakeState::Open
            && self.open_request_id.is_none()
            && self.context.channel.read().should_renew_security_token()
    }

    async fn drain_close(&mut self) -> TransportPollResult {
        // Give the peer a moment to see our CloseSecureChannelRequest, but don't
        // wait forever: the channel is going away either way.
        tokio::select! {
            incoming = self.read.next() => {
                match incoming {
                    None => TransportPollResult::Closed(StatusCode::Good),
                    Some(_) => TransportPollResult::Closed(StatusCode::Good),
                }
            }
            _ = tokio::time::sleep(Duration::from_millis(200)) => {
                TransportPollResult::Closed(StatusCode::Good)
            }
        }
    }

    fn fail_channel_sync(&mut self, status: StatusCode) -> TransportPollResult {
        error!("Secure channel failing with {status}");
        self.context.handshake.fail();
        self.context.requests.fail_all(StatusCode::BadConnectionClosed);
        self.opn_assembler.reset();
        self.msg_assembler.reset();
        TransportPollResult::Closed(status)
    }

    async fn fail_channel(&mut self, status: StatusCode) -> TransportPollResult {
        self.fail_channel_sync(status)
    }

    /// Handle one value produced by the framed reader.
    fn handle_incoming(
        &mut self,
        incoming: Option<Result<WireMessage, std::io::Error>>,
    ) -> Result<ProcessedEvent, Error> {
        let Some(incoming) = incoming else {
            return Err(Error::new(StatusCode::BadConnectionClosed, "transport closed"));
        };
        let message = incoming.map_err(|e| {
            Error::new(
                StatusCode::BadConnectionClosed,
                format!("transport read error: {e}"),
            )
        })?;

        match message {
            WireMessage::Chunk(chunk) => self.handle_chunk(chunk),
            WireMessage::Error(err) => {
                error!("Server reported a TCP-level error: {} ({})", err.error, err.reason);
                Err(Error::new(err.error, err.reason.to_string()))
            }
            WireMessage::Acknowledge(_) => Err(Error::new(
                StatusCode::BadTcpMessageTypeInvalid,
                "Received an unexpected Acknowledge after the secure channel was established",
            )),
        }
    }

    fn handle_chunk(&mut self, chunk: MessageChunk) -> Result<ProcessedEvent, Error> {
        let decoding_options = self.context.params.decoding_options.clone();
        let header = chunk.message_header(&decoding_options)?;

        if header.message_type.is_open_secure_channel() {
            self.handle_opn_chunk(chunk)
        } else {
            self.handle_msg_chunk(chunk)
        }
    }

    fn handle_opn_chunk(&mut self, chunk: MessageChunk) -> Result<ProcessedEvent, Error> {
        let event = {
            let channel = self.context.channel.read();
            self.opn_assembler.assemble(chunk, &channel)?
        };

        match event {
            AssemblerEvent::Incomplete => Ok(ProcessedEvent::Chunk),
            AssemblerEvent::Aborted(info, _request_id) => {
                warn!(
                    "OpenSecureChannel exchange aborted by peer: {} ({})",
                    info.error, info.reason
                );
                Err(Error::new(info.error, info.reason.to_string()))
            }
            AssemblerEvent::Complete(chunks) => {
                let response = {
                    let mut channel = self.context.channel.write();
                    decode_open_secure_channel_response(&mut channel, chunks)?
                };
                {
                    let mut channel = self.context.channel.write();
                    apply_open_secure_channel_response(
                        &mut channel,
                        &response,
                        self.cert_validator.as_deref(),
                    )?;
                }

                self.open_request_id = None;
                self.handshake_deadline = None;
                self.context.handshake.complete();

                let lifetime = response.security_token.revised_lifetime;
                self.renewal_deadline = renewal_delay(lifetime).map(|d| Instant::now() + d);
                debug!(
                    "Secure channel {} ready, token {}, renewal in {:?}",
                    response.security_token.channel_id,
                    response.security_token.token_id,
                    self.renewal_deadline.map(|d| d.saturating_duration_since(Instant::now()))
                );

                Ok(ProcessedEvent::HandshakeReady)
            }
        }
    }

    fn handle_msg_chunk(&mut self, chunk: MessageChunk) -> Result<ProcessedEvent, Error> {
        // The token id and channel id in the (still encrypted) header are read
        // in the clear; validate them before spending effort decrypting.
        {
            let channel = self.context.channel.read();
            let chunk_info = chunk.chunk_info(&channel)?;
            validate_chunk_identity(&channel, &chunk_info)?;
        }

        let decrypted = {
            let mut channel = self.context.channel.write();
            channel.verify_and_remove_security(&chunk.data)?
        };

        let event = {
            let channel = self.context.channel.read();
            self.msg_assembler.assemble(decrypted, &channel)?
        };

        match event {
            AssemblerEvent::Incomplete => Ok(ProcessedEvent::Chunk),
            AssemblerEvent::Aborted(info, request_id) => {
                // Per §4.2/§4.5: the abort chunk carries the sequence header (and
                // so the request id) of the message it aborts, so the matching
                // pending request can be failed directly without needing any of
                // the earlier intermediate chunks.
                warn!("Message aborted by peer: {} ({})", info.error, info.reason);
                self.context
                    .requests
                    .abort(request_id, Error::new(info.error, info.reason.to_string()));
                Ok(ProcessedEvent::Chunk)
            }
            AssemblerEvent::Complete(chunks) => {
                let channel = self.context.channel.read();
                let first_chunk_info = chunks[0].chunk_info(&channel)?;
                let request_id = first_chunk_info.sequence_header.request_id;

                self.last_received_sequence_number = Chunker::validate_chunks(
                    self.last_received_sequence_number + 1,
                    &channel,
                    &chunks,
                )?;

                let response: ResponseMessage = Chunker::decode(&chunks, &channel, None)?;
                drop(channel);

                if let ResponseMessage::CloseSecureChannel(_) = &response {
                    return Ok(ProcessedEvent::CloseAcknowledged);
                }

                if Some(request_id) == self.open_request_id {
                    // A symmetric-chunked CloseSecureChannelResponse can in
                    // principle race with this, but OPN/renew traffic always
                    // comes in on OPN chunks, never MSG ones; this branch only
                    // guards against a server that mislabels a response.
                    self.open_request_id = None;
                }

                self.context.requests.complete(request_id, response);
                Ok(ProcessedEvent::Response)
            }
        }
    }

    /// Build, chunk-encode and write an `OpenSecureChannelRequest`. Arms the
    /// handshake timeout for an `Issue`; leaves it disarmed for a `Renew`, per
    /// §4.4's "renewal does not rearm the handshake timeout".
    async fn begin_open_secure_channel(
        &mut self,
        request_type: SecurityTokenRequestType,
    ) -> Result<(), Error> {
        self.context.handshake.begin(&*self.context.channel.read());

        let request = {
            let mut channel = self.context.channel.write();
            build_open_secure_channel_request(
                &mut channel,
                request_type,
                self.context.params.requested_lifetime,
                self.context.request_handles.next(),
            )
        };

        let sequence_number = self.next_sequence_number;
        let request_id = sequence_number;

        let chunks = {
            let channel = self.context.channel.read();
            encode_open_secure_channel_request(
                &channel,
                sequence_number,
                request_id,
                self.context.params.remote_max_message_size,
                self.context.params.max_chunk_size,
                request,
            )?
        };
        self.next_sequence_number += chunks.len() as u32;

        self.write_chunks_asymmetric(&chunks).await?;

        self.open_request_id = Some(request_id);
        if matches!(request_type, SecurityTokenRequestType::Issue) {
            self.handshake_deadline = Some(Instant::now() + crate::constants::HANDSHAKE_TIMEOUT);
        }

        debug!("Sent OpenSecureChannelRequest ({:?})", request_type);
        Ok(())
    }

    async fn send_request(&mut self, request: RequestMessage, request_id: u32) -> Result<(), Error> {
        let sequence_number = self.next_sequence_number;

        let chunks = {
            let channel = self.context.channel.read();
            Chunker::encode(
                sequence_number,
                request_id,
                self.context.params.remote_max_message_size,
                self.context.params.max_chunk_size,
                &channel,
                &request,
            )?
        };
        self.next_sequence_number += chunks.len() as u32;

        self.write_chunks_symmetric(&chunks).await
    }

    async fn send_close_request(&mut self) -> Result<(), Error> {
        if !self.context.handshake.begin_close() {
            trace!("Close requested but the handshake controller had nothing to close");
        }

        let request = RequestMessage::CloseSecureChannel(Box::new(CloseSecureChannelRequest {
            request_header: opcua_types::RequestHeader {
                request_handle: self.context.request_handles.next(),
                ..Default::default()
            },
        }));

        let sequence_number = self.next_sequence_number;
        // Use a request id distinct from any application request; the response
        // (if the server bothers to send one) is recognized by type, not id.
        let request_id = sequence_number;

        let chunks = {
            let channel = self.context.channel.read();
            Chunker::encode(
                sequence_number,
                request_id,
                self.context.params.remote_max_message_size,
                self.context.params.max_chunk_size,
                &channel,
                &request,
            )?
        };
        self.next_sequence_number += chunks.len() as u32;

        self.write_chunks_symmetric(&chunks).await?;

        self.context.channel.write().set_secure_channel_id(0);
        self.renewal_deadline = None;
        self.context.requests.fail_all(StatusCode::BadConnectionClosed);

        // Servers are not required to answer CloseSecureChannel; give the wire
        // a short grace period (handled by `drain_close`) rather than blocking.
        let _ = CloseSecureChannelResponse::default();

        Ok(())
    }

    /// Sign/encrypt each chunk and write the whole message as one composite
    /// write, per §4.6 (chunks of one logical message are always contiguous on
    /// the wire).
    async fn write_chunks(&mut self, chunks: &[MessageChunk]) -> Result<(), Error> {
        let mut composite = Vec::new();
        {
            let channel = self.context.channel.read();
            for chunk in chunks {
                let chunk_info = chunk.chunk_info(&channel)?;
                let security_header = &chunk_info.security_header;
                let signature_size = channel.signature_size(security_header);
                let (padding_size, _) = channel.padding_size(
                    security_header,
                    chunk_info.body_length,
                    signature_size,
                    chunk_info.message_header.message_type,
                );
                let mut dst = vec![0u8; chunk.data.len() + padding_size + signature_size];
                let written = channel
                    .apply_security(chunk, &mut dst)
                    .map_err(|status| Error::new(status, "failed to sign/encrypt chunk"))?;
                dst.truncate(written);
                composite.extend_from_slice(&dst);
            }
        }

        self.write.write_all(&composite).await.map_err(|e| {
            Error::new(
                StatusCode::BadConnectionClosed,
                format!("failed to write to transport: {e}"),
            )
        })
    }

    async fn write_chunks_asymmetric(&mut self, chunks: &[MessageChunk]) -> Result<(), Error> {
        debug_assert!(matches!(
            chunks.first().map(|c| c.chunk_info(&self.context.channel.read())),
            None | Some(_)
        ));
        self.write_chunks(chunks).await
    }

    async fn write_chunks_symmetric(&mut self, chunks: &[MessageChunk]) -> Result<(), Error> {
        self.write_chunks(chunks).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comms::message_chunk::MessageIsFinalType;
    use opcua_crypto::SecurityPolicy;
    use opcua_types::{ChannelSecurityToken, DateTime, MessageSecurityMode, OpenSecureChannelResponse, ResponseHeader};
    use tokio::io::duplex;

    fn unsecured_channel() -> SecureChannel {
        let mut channel = SecureChannel::new_no_certificate_store();
        channel.set_security_policy(SecurityPolicy::None);
        channel.set_security_mode(MessageSecurityMode::None);
        channel
    }

    fn context() -> Arc<SecureChannelContext> {
        SecureChannelContext::new(unsecured_channel(), ChannelParams::default())
    }

    /// Minimal fake server: reads one OPN request off the duplex stream, replies
    /// with a successful `OpenSecureChannelResponse` carrying the given channel id
    /// and token id, ignoring the request's actual content (security policy None
    /// means nothing needs decrypting to check it).
    async fn respond_to_open<S>(
        mut write: S,
        channel_id: u32,
        token_id: u32,
        revised_lifetime: u32,
    ) where
        S: tokio::io::AsyncWrite + Unpin,
    {
        let mut responder_channel = unsecured_channel();
        let response = OpenSecureChannelResponse {
            response_header: ResponseHeader::new_good(&opcua_types::RequestHeader::default()),
            server_protocol_version: 0,
            security_token: ChannelSecurityToken {
                channel_id,
                token_id,
                created_at: DateTime::now(),
                revised_lifetime,
            },
            server_nonce: opcua_types::ByteString::null(),
        };
        responder_channel.set_secure_channel_id(channel_id);

        let response_message = ResponseMessage::OpenSecureChannel(Box::new(response));
        let encoded = Chunker::encode(1, 1, 0, 8192, &responder_channel, &response_message)
            .expect("response encodes");
        for chunk in &encoded {
            write.write_all(&chunk.data).await.unwrap();
        }
    }

    #[tokio::test]
    async fn open_completes_on_successful_response() {
        let (client_stream, server_stream) = duplex(64 * 1024);
        let ctx = context();
        let (_handle, mut event_loop) = channel(client_stream, ctx.clone(), None);

        let server = tokio::spawn(async move {
            let (_r, w) = tokio::io::split(server_stream);
            respond_to_open(w, 42, 100, 600_000).await;
        });

        event_loop.open().await.expect("handshake succeeds");
        server.await.unwrap();

        assert_eq!(ctx.channel_id(), 42);
        assert_eq!(ctx.state(), HandshakeState::Open);
    }

    #[tokio::test]
    async fn open_times_out_when_server_never_responds() {
        let (client_stream, _server_stream) = duplex(64 * 1024);
        let ctx = context();
        let (_handle, mut event_loop) = channel(client_stream, ctx.clone(), None);
        event_loop.handshake_deadline = Some(Instant::now() + Duration::from_millis(10));

        let result = event_loop.open().await;
        assert_eq!(result.unwrap_err(), StatusCode::BadTimeout);
        assert_eq!(ctx.state(), HandshakeState::Failed);
    }

    #[tokio::test]
    async fn send_fails_immediately_if_event_loop_is_gone() {
        let (client_stream, _server_stream) = duplex(64 * 1024);
        let ctx = context();
        let (handle, event_loop) = channel(client_stream, ctx, None);
        drop(event_loop);

        let err = handle
            .send(opcua_types::CloseSecureChannelRequest {
                request_header: opcua_types::RequestHeader::default(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BadConnectionClosed);
    }

    #[test]
    fn should_begin_renewal_is_false_before_handshake_completes() {
        let (client_stream, _server) = tokio_test_duplex();
        let ctx = context();
        let (_handle, event_loop) = channel(client_stream, ctx, None);
        assert!(!event_loop.should_begin_renewal());
    }

    fn tokio_test_duplex() -> (tokio::io::DuplexStream, tokio::io::DuplexStream) {
        tokio::io::duplex(1024)
    }

    #[test]
    fn assembler_limits_come_from_channel_params() {
        let params = ChannelParams {
            local_max_chunk_count: 3,
            ..ChannelParams::default()
        };
        let ctx = SecureChannelContext::new(unsecured_channel(), params);
        let (client_stream, _server) = tokio_test_duplex();
        let (_handle, event_loop) = channel(client_stream, ctx, None);
        assert_eq!(event_loop.opn_assembler.pending_chunk_count(), 0);
        assert_eq!(event_loop.msg_assembler.pending_chunk_count(), 0);
    }
}
