// OPCUA for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! Accumulates the chunks belonging to a single logical message and hands the
//! completed list off to the decode pipeline, or surfaces an abort.

use std::io::Cursor;

use log::trace;
use opcua_types::{status_code::StatusCode, Error, SimpleBinaryDecodable, UAString};

use super::{message_chunk::MessageChunk, message_chunk::MessageIsFinalType, secure_channel::SecureChannel};

/// A chunk sequence was aborted by the sender. Carries the status code and
/// human-readable reason embedded in the abort chunk's body.
#[derive(Debug, Clone, PartialEq)]
pub struct AbortInfo {
    /// Status code describing why the sequence was aborted.
    pub error: StatusCode,
    /// A human-readable description of the abort, for logging only.
    pub reason: UAString,
}

impl AbortInfo {
    /// Decode an abort chunk's body (`StatusCode` followed by a `UAString` reason),
    /// per Part 6 6.7.2. Returns the decoded reason alongside the request id carried
    /// in the abort chunk's own sequence header, so the caller can route the abort
    /// to the pending request it belongs to.
    fn decode(chunk: &MessageChunk, secure_channel: &SecureChannel) -> Result<(Self, u32), Error> {
        let chunk_info = chunk.chunk_info(secure_channel)?;
        let decoding_options = secure_channel.decoding_options();
        let body = &chunk.data[chunk_info.body_offset..(chunk_info.body_offset + chunk_info.body_length)];
        let mut stream = Cursor::new(body);
        let error = StatusCode::decode(&mut stream, &decoding_options)?;
        let reason = UAString::decode(&mut stream, &decoding_options)?;
        Ok((
            AbortInfo { error, reason },
            chunk_info.sequence_header.request_id,
        ))
    }
}

/// Outcome of appending a chunk to the assembler.
pub enum AssemblerEvent {
    /// More chunks are still expected before the message is complete.
    Incomplete,
    /// The message is complete; contains the ordered chunks ready for decode.
    /// The assembler's internal list has been reset to receive the next message.
    Complete(Vec<MessageChunk>),
    /// The sender aborted the message. No response should be produced for it.
    /// The assembler's internal list has been reset to receive the next message.
    /// Carries the request id from the abort chunk's own sequence header, so the
    /// caller can fail the specific pending request the abort refers to.
    Aborted(AbortInfo, u32),
}

/// Collects chunks for a single channel's inbound messages, one logical message
/// at a time, and enforces the negotiated local receive limits.
pub struct ChunkAssembler {
    chunks: Vec<MessageChunk>,
    bytes_received: usize,
    /// Max size in bytes of a single chunk, 0 for unlimited.
    local_receive_buffer_size: usize,
    /// Max number of chunks per message, 0 for unlimited.
    local_max_chunk_count: usize,
}

impl ChunkAssembler {
    /// Create an assembler enforcing the given negotiated limits.
    pub fn new(local_receive_buffer_size: usize, local_max_chunk_count: usize) -> Self {
        ChunkAssembler {
            chunks: Vec::new(),
            bytes_received: 0,
            local_receive_buffer_size,
            local_max_chunk_count,
        }
    }

    /// Number of chunks currently held for the in-progress message.
    pub fn pending_chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Discard any partially accumulated message, e.g. after a decode error.
    pub fn reset(&mut self) {
        self.chunks.clear();
        self.bytes_received = 0;
    }

    /// Append a freshly decrypted chunk to the in-progress message.
    ///
    /// Chunks with `is_final == Intermediate` accumulate. `Final` completes the
    /// message and returns the accumulated chunk list. `FinalError` is an abort:
    /// the accumulated chunks are discarded and the abort reason is returned
    /// instead, with no response expected.
    pub fn assemble(
        &mut self,
        chunk: MessageChunk,
        secure_channel: &SecureChannel,
    ) -> Result<AssemblerEvent, Error> {
        let chunk_size = chunk.data.len();
        if self.local_receive_buffer_size > 0 && chunk_size > self.local_receive_buffer_size {
            self.reset();
            return Err(Error::new(
                StatusCode::BadTcpMessageTooLarge,
                format!(
                    "Chunk size {} exceeds local receive buffer size {}",
                    chunk_size, self.local_receive_buffer_size
                ),
            ));
        }

        let is_final = {
            let chunk_info = chunk.chunk_info(secure_channel)?;
            chunk_info.message_header.is_final
        };

        if is_final == MessageIsFinalType::FinalError {
            trace!("Received abort chunk, discarding {} accumulated chunks", self.chunks.len());
            let (abort, request_id) = AbortInfo::decode(&chunk, secure_channel)?;
            self.reset();
            return Ok(AssemblerEvent::Aborted(abort, request_id));
        }

        self.bytes_received += chunk_size;
        self.chunks.push(chunk);

        if self.local_max_chunk_count > 0 && self.chunks.len() > self.local_max_chunk_count {
            self.reset();
            return Err(Error::new(
                StatusCode::BadTcpMessageTooLarge,
                format!(
                    "Message exceeds local max chunk count of {}",
                    self.local_max_chunk_count
                ),
            ));
        }

        if is_final == MessageIsFinalType::Final {
            let chunks = std::mem::take(&mut self.chunks);
            self.bytes_received = 0;
            Ok(AssemblerEvent::Complete(chunks))
        } else {
            Ok(AssemblerEvent::Incomplete)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comms::message_chunk::MessageChunkType;
    use opcua_crypto::SecurityPolicy;
    use opcua_types::MessageSecurityMode;

    fn unsecured_channel() -> SecureChannel {
        let mut channel = SecureChannel::new_no_certificate_store();
        channel.set_security_policy(SecurityPolicy::None);
        channel.set_security_mode(MessageSecurityMode::None);
        channel
    }

    #[test]
    fn single_final_chunk_completes_immediately() {
        let channel = unsecured_channel();
        let mut assembler = ChunkAssembler::new(0, 0);
        let chunk = MessageChunk::new(
            1,
            1,
            MessageChunkType::Message,
            MessageIsFinalType::Final,
            &channel,
            &[1, 2, 3],
        )
        .unwrap();
        match assembler.assemble(chunk, &channel).unwrap() {
            AssemblerEvent::Complete(chunks) => assert_eq!(chunks.len(), 1),
            _ => panic!("expected Complete"),
        }
        assert_eq!(assembler.pending_chunk_count(), 0);
    }

    #[test]
    fn intermediate_chunks_accumulate_until_final() {
        let channel = unsecured_channel();
        let mut assembler = ChunkAssembler::new(0, 0);
        let first = MessageChunk::new(
            1,
            1,
            MessageChunkType::Message,
            MessageIsFinalType::Intermediate,
            &channel,
            &[1, 2, 3],
        )
        .unwrap();
        match assembler.assemble(first, &channel).unwrap() {
            AssemblerEvent::Incomplete => {}
            _ => panic!("expected Incomplete"),
        }
        assert_eq!(assembler.pending_chunk_count(), 1);

        let second = MessageChunk::new(
            2,
            1,
            MessageChunkType::Message,
            MessageIsFinalType::Final,
            &channel,
            &[4, 5, 6],
        )
        .unwrap();
        match assembler.assemble(second, &channel).unwrap() {
            AssemblerEvent::Complete(chunks) => assert_eq!(chunks.len(), 2),
            _ => panic!("expected Complete"),
        }
    }

    #[test]
    fn max_chunk_count_is_enforced() {
        let channel = unsecured_channel();
        let mut assembler = ChunkAssembler::new(0, 1);
        let first = MessageChunk::new(
            1,
            1,
            MessageChunkType::Message,
            MessageIsFinalType::Intermediate,
            &channel,
            &[1, 2, 3],
        )
        .unwrap();
        assembler.assemble(first, &channel).unwrap();

        let second = MessageChunk::new(
            2,
            1,
            MessageChunkType::Message,
            MessageIsFinalType::Final,
            &channel,
            &[4, 5, 6],
        )
        .unwrap();
        let err = assembler.assemble(second, &channel).unwrap_err();
        assert_eq!(err.status(), StatusCode::BadTcpMessageTooLarge);
        assert_eq!(assembler.pending_chunk_count(), 0);
    }

    #[test]
    fn abort_chunk_surfaces_its_request_id() {
        use opcua_types::SimpleBinaryEncodable;

        let channel = unsecured_channel();
        let mut assembler = ChunkAssembler::new(0, 0);

        let mut body = Vec::new();
        StatusCode::BadInternalError.encode(&mut body).unwrap();
        UAString::from("x").encode(&mut body).unwrap();

        let abort_chunk = MessageChunk::new(
            1,
            9,
            MessageChunkType::Message,
            MessageIsFinalType::FinalError,
            &channel,
            &body,
        )
        .unwrap();

        match assembler.assemble(abort_chunk, &channel).unwrap() {
            AssemblerEvent::Aborted(info, request_id) => {
                assert_eq!(request_id, 9);
                assert_eq!(info.error, StatusCode::BadInternalError);
                assert_eq!(info.reason.as_ref(), "x");
            }
            _ => panic!("expected Aborted"),
        }
        assert_eq!(assembler.pending_chunk_count(), 0);
    }

    #[test]
    fn oversized_chunk_is_rejected() {
        let channel = unsecured_channel();
        let mut assembler = ChunkAssembler::new(8, 0);
        let chunk = MessageChunk::new(
            1,
            1,
            MessageChunkType::Message,
            MessageIsFinalType::Final,
            &channel,
            &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10],
        )
        .unwrap();
        let err = assembler.assemble(chunk, &channel).unwrap_err();
        assert_eq!(err.status(), StatusCode::BadTcpMessageTooLarge);
    }
}
