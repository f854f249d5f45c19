// OPCUA for Rust
// SPDX-License-Identifier: MPL-2.0

//! Errors that never cross the wire as a `StatusCode` on their own, but still need a
//! typed representation inside this crate. Every variant has a sensible `StatusCode`
//! it collapses to at the public API boundary.

use opcua_types::StatusCode;
use thiserror::Error;

/// Internal channel errors, distinct from the `StatusCode`s carried by the protocol
/// itself. These represent local programming/resource invariants rather than
/// something the server told us.
#[derive(Error, Debug)]
pub enum ChannelError {
    /// The monotonic request id counter has wrapped around `u32::MAX`. The channel
    /// cannot safely allocate further request ids and must be torn down.
    #[error("request id space exhausted")]
    RequestIdsExhausted,
    /// A send was attempted before the channel has completed its handshake, or
    /// after it has been closed.
    #[error("secure channel is not connected")]
    NotConnected,
    /// A message failed to fit within the negotiated maximum message size.
    #[error("message of {size} bytes exceeds the maximum of {max} bytes")]
    MessageTooLarge {
        /// Size of the message that was rejected.
        size: usize,
        /// Negotiated maximum.
        max: usize,
    },
    /// The outgoing message queue is full or has been dropped.
    #[error("failed to queue outgoing message")]
    SendQueueClosed,
}

impl ChannelError {
    /// Maps this error onto the `StatusCode` a caller should observe.
    pub fn status(&self) -> StatusCode {
        match self {
            ChannelError::RequestIdsExhausted => StatusCode::BadInternalError,
            ChannelError::NotConnected => StatusCode::BadNotConnected,
            ChannelError::MessageTooLarge { .. } => StatusCode::BadRequestTooLarge,
            ChannelError::SendQueueClosed => StatusCode::BadConnectionClosed,
        }
    }
}

impl From<ChannelError> for StatusCode {
    fn from(value: ChannelError) -> Self {
        value.status()
    }
}
