// OPCUA for Rust
// SPDX-License-Identifier: MPL-2.0

//! The small fixed set of messages exchanged before a secure channel exists: the
//! `Hello`/`Acknowledge` preamble and the `Error` message a server may send instead
//! of an acknowledge. Also home to the raw chunk-type byte constants used by
//! [`super::message_chunk`].

use std::io::{Read, Write};

use opcua_types::{
    process_encode_io_result, read_u32, write_u32, DecodingOptions, EncodingResult,
    SimpleBinaryDecodable, SimpleBinaryEncodable, StatusCode, UAString,
};

/// 3-byte ASCII tag for a plain service-message chunk.
pub const CHUNK_MESSAGE: &[u8] = b"MSG";
/// 3-byte ASCII tag for an OpenSecureChannel chunk.
pub const OPEN_SECURE_CHANNEL_MESSAGE: &[u8] = b"OPN";
/// 3-byte ASCII tag for a CloseSecureChannel chunk.
pub const CLOSE_SECURE_CHANNEL_MESSAGE: &[u8] = b"CLO";
/// 3-byte ASCII tag for a preamble Hello message.
pub const HELLO_MESSAGE: &[u8] = b"HEL";
/// 3-byte ASCII tag for a preamble Acknowledge message.
pub const ACKNOWLEDGE_MESSAGE: &[u8] = b"ACK";
/// 3-byte ASCII tag for an Error message, sent instead of an Acknowledge or in
/// place of a chunk when the server gives up on the connection.
pub const ERROR_MESSAGE: &[u8] = b"ERR";

/// Chunk-type byte for an intermediate chunk.
pub const CHUNK_INTERMEDIATE: u8 = b'C';
/// Chunk-type byte for the final chunk of a message.
pub const CHUNK_FINAL: u8 = b'F';
/// Chunk-type byte for an abort chunk - the final chunk of a message that failed
/// part-way through being produced.
pub const CHUNK_FINAL_ERROR: u8 = b'A';

/// Minimum chunk size permitted by the OPC UA TCP spec, regardless of negotiated
/// buffer sizes.
pub const MIN_CHUNK_SIZE: usize = 8192;

/// The `Hello` message a client sends immediately after connecting, before any
/// secure channel exists.
#[derive(Debug, Clone, PartialEq)]
pub struct HelloMessage {
    /// The latest version of the OPC UA TCP protocol the client supports.
    pub protocol_version: u32,
    /// The largest message size the client can receive, in bytes.
    pub receive_buffer_size: u32,
    /// The largest message size the client will send, in bytes.
    pub send_buffer_size: u32,
    /// The largest overall message size the client will ever construct.
    pub max_message_size: u32,
    /// The largest number of chunks the client will ever assemble into one message.
    pub max_chunk_count: u32,
    /// The url of the endpoint the client wishes to connect to.
    pub endpoint_url: UAString,
}

impl HelloMessage {
    /// Construct a hello message advertising the given buffer and message limits.
    pub fn new(
        endpoint_url: &str,
        send_buffer_size: usize,
        receive_buffer_size: usize,
        max_message_size: usize,
        max_chunk_count: usize,
    ) -> Self {
        HelloMessage {
            protocol_version: crate::constants::PROTOCOL_VERSION,
            receive_buffer_size: receive_buffer_size as u32,
            send_buffer_size: send_buffer_size as u32,
            max_message_size: max_message_size as u32,
            max_chunk_count: max_chunk_count as u32,
            endpoint_url: UAString::from(endpoint_url),
        }
    }
}

impl SimpleBinaryEncodable for HelloMessage {
    /// Size of the message body, not including the 8-byte chunk header that
    /// [`HelloMessage::encode`] writes directly.
    fn byte_len(&self) -> usize {
        4 + 4 + 4 + 4 + 4 + self.endpoint_url.byte_len()
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        let message_size = (8 + self.byte_len()) as u32;

        process_encode_io_result(stream.write_all(HELLO_MESSAGE))?;
        process_encode_io_result(stream.write_all(&[CHUNK_FINAL]))?;
        write_u32(stream, message_size)?;
        write_u32(stream, self.protocol_version)?;
        write_u32(stream, self.receive_buffer_size)?;
        write_u32(stream, self.send_buffer_size)?;
        write_u32(stream, self.max_message_size)?;
        write_u32(stream, self.max_chunk_count)?;
        self.endpoint_url.encode(stream)
    }
}

impl SimpleBinaryDecodable for HelloMessage {
    fn decode<S: Read + ?Sized>(
        stream: &mut S,
        decoding_options: &DecodingOptions,
    ) -> EncodingResult<Self> {
        let protocol_version = read_u32(stream)?;
        let receive_buffer_size = read_u32(stream)?;
        let send_buffer_size = read_u32(stream)?;
        let max_message_size = read_u32(stream)?;
        let max_chunk_count = read_u32(stream)?;
        let endpoint_url = UAString::decode(stream, decoding_options)?;
        Ok(HelloMessage {
            protocol_version,
            receive_buffer_size,
            send_buffer_size,
            max_message_size,
            max_chunk_count,
            endpoint_url,
        })
    }
}

/// The `Acknowledge` message a server sends in response to a `Hello`, carrying the
/// negotiated (possibly revised-down) buffer and message limits.
#[derive(Debug, Clone, PartialEq)]
pub struct AcknowledgeMessage {
    /// The latest version of the OPC UA TCP protocol the server supports.
    pub protocol_version: u32,
    /// The largest message size the server can receive.
    pub receive_buffer_size: u32,
    /// The largest message size the server will send.
    pub send_buffer_size: u32,
    /// The largest overall message size the server will construct.
    pub max_message_size: u32,
    /// The largest number of chunks the server will assemble into one message.
    pub max_chunk_count: u32,
}

impl SimpleBinaryEncodable for AcknowledgeMessage {
    fn byte_len(&self) -> usize {
        4 + 4 + 4 + 4 + 4
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        let message_size = 8 + self.byte_len() as u32;
        process_encode_io_result(stream.write_all(ACKNOWLEDGE_MESSAGE))?;
        process_encode_io_result(stream.write_all(&[CHUNK_FINAL]))?;
        write_u32(stream, message_size)?;
        write_u32(stream, self.protocol_version)?;
        write_u32(stream, self.receive_buffer_size)?;
        write_u32(stream, self.send_buffer_size)?;
        write_u32(stream, self.max_message_size)?;
        write_u32(stream, self.max_chunk_count)
    }
}

impl SimpleBinaryDecodable for AcknowledgeMessage {
    fn decode<S: Read + ?Sized>(stream: &mut S, _: &DecodingOptions) -> EncodingResult<Self> {
        let protocol_version = read_u32(stream)?;
        let receive_buffer_size = read_u32(stream)?;
        let send_buffer_size = read_u32(stream)?;
        let max_message_size = read_u32(stream)?;
        let max_chunk_count = read_u32(stream)?;
        Ok(AcknowledgeMessage {
            protocol_version,
            receive_buffer_size,
            send_buffer_size,
            max_message_size,
            max_chunk_count,
        })
    }
}

/// The `Error` message, sent by a server in place of an `Acknowledge`, or at any
/// later point instead of a chunk, to report a fatal condition and close the
/// connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorMessage {
    /// The status code describing the failure.
    pub error: StatusCode,
    /// A human-readable description of the failure, for logging only.
    pub reason: UAString,
}

impl SimpleBinaryEncodable for ErrorMessage {
    fn byte_len(&self) -> usize {
        4 + self.reason.byte_len()
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        let message_size = 8 + self.byte_len() as u32;
        process_encode_io_result(stream.write_all(ERROR_MESSAGE))?;
        process_encode_io_result(stream.write_all(&[CHUNK_FINAL]))?;
        write_u32(stream, message_size)?;
        self.error.encode(stream)?;
        self.reason.encode(stream)
    }
}

impl SimpleBinaryDecodable for ErrorMessage {
    fn decode<S: Read + ?Sized>(
        stream: &mut S,
        decoding_options: &DecodingOptions,
    ) -> EncodingResult<Self> {
        let error = StatusCode::decode(stream, decoding_options)?;
        let reason = UAString::decode(stream, decoding_options)?;
        Ok(ErrorMessage { error, reason })
    }
}

impl ErrorMessage {
    /// Build an error message from a status code and a plain-text reason.
    pub fn from_status(error: StatusCode, reason: impl Into<String>) -> Self {
        ErrorMessage {
            error,
            reason: UAString::from(reason.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_round_trip() {
        let hello = HelloMessage::new("opc.tcp://localhost:4840/", 65536, 65536, 0, 0);
        let mut buf = Vec::new();
        hello.encode(&mut buf).unwrap();

        // Skip the 8-byte chunk header that encode() writes directly, decode() only
        // reads the body.
        let mut stream = std::io::Cursor::new(&buf[8..]);
        let decoded = HelloMessage::decode(&mut stream, &DecodingOptions::default()).unwrap();
        assert_eq!(decoded, hello);
    }

    #[test]
    fn acknowledge_round_trip() {
        let ack = AcknowledgeMessage {
            protocol_version: 0,
            receive_buffer_size: 65536,
            send_buffer_size: 65536,
            max_message_size: 1 << 20,
            max_chunk_count: 128,
        };
        let mut buf = Vec::new();
        ack.encode(&mut buf).unwrap();
        let mut stream = std::io::Cursor::new(&buf[8..]);
        let decoded = AcknowledgeMessage::decode(&mut stream, &DecodingOptions::default()).unwrap();
        assert_eq!(decoded, ack);
    }
}
