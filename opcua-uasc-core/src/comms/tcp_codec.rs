// OPCUA for Rust
// SPDX-License-Identifier: MPL-2.0

//! The [`TcpCodec`] turns a raw byte stream into whole OPC UA TCP frames: the
//! `Acknowledge`/`Error` preamble messages, and the `OPN`/`MSG`/`CLO` chunks that make
//! up the secure channel traffic. This is the "Framing Reader" of the protocol stack
//! — it never interprets chunk contents, only slices complete frames off the wire.

use std::io;

use bytes::{Buf, BytesMut};
use opcua_types::{DecodingOptions, SimpleBinaryDecodable};
use tokio_util::codec::Decoder;

use super::{
    message_chunk::{MessageChunk, MESSAGE_CHUNK_HEADER_SIZE, MESSAGE_SIZE_OFFSET},
    tcp_types::{AcknowledgeMessage, ErrorMessage, ACKNOWLEDGE_MESSAGE, ERROR_MESSAGE},
};

/// One fully-framed unit read off the wire.
#[derive(Debug)]
pub enum Message {
    /// The server's reply to our `Hello`, received exactly once at the start of a
    /// connection.
    Acknowledge(AcknowledgeMessage),
    /// A fatal error reported by the server, in place of an `Acknowledge` or instead
    /// of a chunk later on.
    Error(ErrorMessage),
    /// One chunk of a secure channel message (`OPN`, `MSG` or `CLO`).
    Chunk(MessageChunk),
}

/// Decodes a byte stream into whole [`Message`]s.
pub struct TcpCodec {
    decoding_options: DecodingOptions,
}

impl TcpCodec {
    /// Create a new codec using the given decoding limits.
    pub fn new(decoding_options: DecodingOptions) -> Self {
        TcpCodec { decoding_options }
    }
}

fn invalid_data(reason: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, reason.into())
}

impl Decoder for TcpCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, io::Error> {
        if src.len() < MESSAGE_CHUNK_HEADER_SIZE {
            return Ok(None);
        }

        let message_type = [src[0], src[1], src[2]];
        let message_size =
            u32::from_le_bytes(src[MESSAGE_SIZE_OFFSET..MESSAGE_SIZE_OFFSET + 4].try_into().unwrap())
                as usize;

        if message_size < MESSAGE_CHUNK_HEADER_SIZE {
            return Err(invalid_data(format!(
                "Message size {message_size} is smaller than the chunk header itself"
            )));
        }

        let max = self.decoding_options.max_message_size;
        if max > 0 && message_size > max {
            return Err(invalid_data(format!(
                "Message size {message_size} exceeds the negotiated maximum of {max}"
            )));
        }

        if src.len() < message_size {
            src.reserve(message_size - src.len());
            return Ok(None);
        }

        let frame = src.split_to(message_size);

        let message = match &message_type {
            _ if message_type == *ACKNOWLEDGE_MESSAGE => {
                let mut body = io::Cursor::new(&frame[MESSAGE_CHUNK_HEADER_SIZE..]);
                let ack = AcknowledgeMessage::decode(&mut body, &self.decoding_options)
                    .map_err(|e| invalid_data(e.to_string()))?;
                Message::Acknowledge(ack)
            }
            _ if message_type == *ERROR_MESSAGE => {
                let mut body = io::Cursor::new(&frame[MESSAGE_CHUNK_HEADER_SIZE..]);
                let err = ErrorMessage::decode(&mut body, &self.decoding_options)
                    .map_err(|e| invalid_data(e.to_string()))?;
                Message::Error(err)
            }
            b"OPN" | b"MSG" | b"CLO" => Message::Chunk(MessageChunk {
                data: frame.to_vec(),
            }),
            other => {
                return Err(invalid_data(format!(
                    "Invalid or unexpected message type {other:?}"
                )));
            }
        };

        Ok(Some(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opcua_types::SimpleBinaryEncodable;

    #[test]
    fn decodes_acknowledge() {
        let ack = AcknowledgeMessage {
            protocol_version: 0,
            receive_buffer_size: 65536,
            send_buffer_size: 65536,
            max_message_size: 0,
            max_chunk_count: 0,
        };
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&ack.encode_to_vec());

        let mut codec = TcpCodec::new(DecodingOptions::default());
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(decoded, Message::Acknowledge(a) if a == ack));
        assert!(buf.is_empty());
    }

    #[test]
    fn waits_for_full_frame() {
        let ack = AcknowledgeMessage {
            protocol_version: 0,
            receive_buffer_size: 65536,
            send_buffer_size: 65536,
            max_message_size: 0,
            max_chunk_count: 0,
        };
        let full = ack.encode_to_vec();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&full[..full.len() - 1]);

        let mut codec = TcpCodec::new(DecodingOptions::default());
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn rejects_unknown_message_type() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"XYZ");
        buf.extend_from_slice(&[b'F']);
        buf.extend_from_slice(&8u32.to_le_bytes());

        let mut codec = TcpCodec::new(DecodingOptions::default());
        assert!(codec.decode(&mut buf).is_err());
    }
}
