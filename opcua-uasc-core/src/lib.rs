// OPCUA for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

#![warn(missing_docs)]

//! Wire-level building blocks for the OPC UA TCP secure channel: chunk framing,
//! asymmetric/symmetric chunk encoding and decoding, the security token lifecycle,
//! and the request/response message envelopes carried over a channel.
//!
//! This crate deliberately stops at the byte/crypto boundary: structured OPC UA
//! types, certificate handling and key derivation are provided by
//! [`async-opcua-types`](https://docs.rs/async-opcua-types) and
//! [`async-opcua-crypto`](https://docs.rs/async-opcua-crypto).

/// Contains debugging utility helper functions.
pub mod debug {
    use log::{log_enabled, trace};

    /// Prints out the content of a slice in hex and visible char format to aid debugging.
    pub fn log_buffer(message: &str, buf: &[u8]) {
        // No point doing anything unless trace level is on for the "hex" target.
        if !log_enabled!(target: "hex", log::Level::Trace) {
            return;
        }

        let line_len = 32;
        let len = buf.len();
        let last_line_padding = ((len / line_len) + 1) * line_len - len;

        trace!(target: "hex", "{}", message);

        let mut char_line = String::new();
        let mut hex_line = format!("{:08x}: ", 0);

        for (i, b) in buf.iter().enumerate() {
            let value = { *b };
            if i > 0 && i % line_len == 0 {
                trace!(target: "hex", "{} {}", hex_line, char_line);
                hex_line = format!("{:08}: ", i);
                char_line.clear();
            }
            hex_line = format!("{} {:02x}", hex_line, value);
            char_line.push(if (32..=126).contains(&value) {
                value as char
            } else {
                '.'
            });
        }
        if last_line_padding > 0 {
            for _ in 0..last_line_padding {
                hex_line.push_str("   ");
            }
            trace!(target: "hex", "{} {}", hex_line, char_line);
        }
    }
}

/// Contains common OPC-UA constants.
pub mod constants {
    /// Default OPC UA port number, implied by `opc.tcp://` urls that omit one.
    pub const DEFAULT_OPC_UA_SERVER_PORT: u16 = 4840;

    /// OPC UA TCP protocol version sent in Hello/Acknowledge and OpenSecureChannel.
    pub const PROTOCOL_VERSION: u32 = 0;

    /// Handshake timeout: the time allowed between arming the handshake and
    /// receiving a valid `OpenSecureChannelResponse`.
    pub const HANDSHAKE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

    /// Fraction of the revised token lifetime at which renewal is scheduled.
    pub const TOKEN_RENEWAL_RATIO: f32 = 0.75;
}

pub mod channel;
pub mod comms;
pub mod config;
pub mod errors;
pub mod handle;
pub mod handshake;
pub mod multiplexer;
pub mod retry;

pub mod messages;
pub use messages::{Message, MessageType, RequestMessage, ResponseMessage};

/// Tracing macro for obtaining a lock on a `Mutex`. Useful for tracking down deadlocks.
#[macro_export]
macro_rules! trace_lock {
    ( $x:expr ) => {{
        //            use std::thread;
        //            trace!("Thread {:?}, {} locking at {}, line {}", thread::current().id(), stringify!($x), file!(), line!());
        let v = $x.lock();
        //            trace!("Thread {:?}, {} lock completed", thread::current().id(), stringify!($x));
        v
    }};
}

/// Tracing macro for obtaining a read lock on a `RwLock`.
#[macro_export]
macro_rules! trace_read_lock {
    ( $x:expr ) => {{
        let v = $x.read();
        v
    }};
}

/// Tracing macro for obtaining a write lock on a `RwLock`.
#[macro_export]
macro_rules! trace_write_lock {
    ( $x:expr ) => {{
        let v = $x.write();
        v
    }};
}

/// Common synchronous locks. Re-exports locks from `parking_lot` used internally.
pub mod sync {
    /// Read-write lock. Use this if you usually only need to read the value.
    pub type RwLock<T> = parking_lot::RwLock<T>;
    /// Mutually exclusive lock. Use this if you need both read and write often.
    pub type Mutex<T> = parking_lot::Mutex<T>;
}
