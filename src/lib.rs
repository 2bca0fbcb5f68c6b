//! Protocol state machine for OPC UA secure channels (UASC over TCP).
//!
//! This crate performs no I/O whatsoever. An [`Endpoint`] consumes byte
//! buffers received from sockets, socket lifecycle notifications, timer
//! expirations and service-layer commands, and produces a stream of I/O
//! operations (`poll_io`) for a backend to execute plus a stream of
//! service-facing events (`poll`).
//!
//! [`Endpoint`]: struct.Endpoint.html

extern crate aes;
extern crate bytes;
extern crate cbc;
extern crate constant_time_eq;
#[macro_use]
extern crate failure;
extern crate fnv;
extern crate rand;
extern crate ring;
extern crate slab;
#[macro_use]
extern crate slog;

#[cfg(test)]
#[macro_use]
extern crate assert_matches;
#[cfg(test)]
#[macro_use]
extern crate hex_literal;
#[cfg(test)]
extern crate slog_term;

use std::fmt;

mod chunk;
mod coding;
mod connection;
mod crypto;
mod endpoint;
mod message;

#[cfg(test)]
mod tests;

pub use connection::{Connection, ConnectionHandle, SecurityToken, State};
pub use crypto::{Crypto, KeyPair, KeySet, KeySets, PeerIdentity, Pki, SecurityPolicy};
pub use endpoint::{
    ChannelConfig, Config, ConnectError, Endpoint, EndpointConfig, EndpointError, Event, Io,
    ListenerHandle, ListenerState, ReverseClientConfig, SocketId, Timer,
};
pub use message::{
    Acknowledge, ChunkEnd, ErrorMessage, Hello, MessageType, ReverseHello, TcpHeader,
};

/// OPC UA TCP protocol version implemented by this crate.
pub const PROTOCOL_VERSION: u32 = 0;

/// Smallest send/receive buffer size a peer may negotiate (Part 6 §7.1.2).
pub const MIN_BUFFER_SIZE: u32 = 8192;

/// Size of the common message header: type (3) + IsFinal (1) + size (4).
pub const TCP_HEADER_SIZE: usize = 8;

/// Size of the sequence header: sequence number (4) + request id (4).
pub const SEQUENCE_HEADER_SIZE: usize = 8;

/// Size of the symmetric security header (token id).
pub const SYMMETRIC_HEADER_SIZE: usize = 4;

/// Upper bound on endpoint URL and ERR/abort reason strings.
pub const MAX_URL_AND_REASON_LENGTH: usize = 4096;

/// Upper bound on a security policy URI in an asymmetric security header.
pub const MAX_POLICY_URI_LENGTH: usize = 255;

/// Received sequence numbers may wrap once the previous value is within
/// this distance of `u32::MAX`, provided the new value is below it
/// (Part 6 §6.7.2).
pub const SEQUENCE_WRAP_WINDOW: u32 = 1024;

/// Whether this peer initiated the secure channel.
///
/// Note that for reverse-hello connections the TCP roles are swapped while
/// the secure-channel roles are not: the `Client` still issues the OPN.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Side {
    Client,
    Server,
}

impl Side {
    pub fn is_client(self) -> bool {
        self == Side::Client
    }
    pub fn is_server(self) -> bool {
        self == Side::Server
    }
}

impl std::ops::Not for Side {
    type Output = Side;
    fn not(self) -> Side {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }
}

/// Message security mode requested for a channel (Part 4 §7.15).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SecurityMode {
    None,
    Sign,
    SignAndEncrypt,
}

impl SecurityMode {
    /// Wire encoding of the `MessageSecurityMode` enumeration.
    pub fn to_wire(self) -> u32 {
        match self {
            SecurityMode::None => 1,
            SecurityMode::Sign => 2,
            SecurityMode::SignAndEncrypt => 3,
        }
    }

    pub fn from_wire(x: u32) -> Option<SecurityMode> {
        match x {
            1 => Some(SecurityMode::None),
            2 => Some(SecurityMode::Sign),
            3 => Some(SecurityMode::SignAndEncrypt),
            _ => None,
        }
    }
}

/// Set of security modes accepted by a server endpoint for one policy.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SecurityModeMask(pub u8);

impl SecurityModeMask {
    pub const NONE: SecurityModeMask = SecurityModeMask(0x1);
    pub const SIGN: SecurityModeMask = SecurityModeMask(0x2);
    pub const SIGN_AND_ENCRYPT: SecurityModeMask = SecurityModeMask(0x4);

    pub fn contains(self, mode: SecurityMode) -> bool {
        let bit = match mode {
            SecurityMode::None => 0x1,
            SecurityMode::Sign => 0x2,
            SecurityMode::SignAndEncrypt => 0x4,
        };
        self.0 & bit != 0
    }
}

impl std::ops::BitOr for SecurityModeMask {
    type Output = SecurityModeMask;
    fn bitor(self, rhs: SecurityModeMask) -> SecurityModeMask {
        SecurityModeMask(self.0 | rhs.0)
    }
}

/// An OPC UA status code.
///
/// Only the codes the transport layer produces or inspects are named here;
/// any 32-bit value can still be carried.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct StatusCode(pub u32);

macro_rules! status_codes {
    {$($name:ident = $val:expr;)*} => {
        impl StatusCode {
            $(pub const $name: StatusCode = StatusCode($val);)*
            fn name(self) -> Option<&'static str> {
                match self.0 {
                    $($val => Some(stringify!($name)),)*
                    _ => None,
                }
            }
        }
    }
}

status_codes! {
    GOOD = 0x0000_0000;
    BAD_UNEXPECTED_ERROR = 0x8001_0000;
    BAD_INTERNAL_ERROR = 0x8002_0000;
    BAD_OUT_OF_MEMORY = 0x8003_0000;
    BAD_RESOURCE_UNAVAILABLE = 0x8004_0000;
    BAD_ENCODING_ERROR = 0x8006_0000;
    BAD_DECODING_ERROR = 0x8007_0000;
    BAD_TIMEOUT = 0x800A_0000;
    BAD_CERTIFICATE_INVALID = 0x8012_0000;
    BAD_SECURITY_CHECKS_FAILED = 0x8013_0000;
    BAD_CERTIFICATE_TIME_INVALID = 0x8014_0000;
    BAD_CERTIFICATE_USE_NOT_ALLOWED = 0x8018_0000;
    BAD_CERTIFICATE_UNTRUSTED = 0x801A_0000;
    BAD_SECURE_CHANNEL_ID_INVALID = 0x8022_0000;
    BAD_NONCE_INVALID = 0x8024_0000;
    BAD_TCP_SERVER_TOO_BUSY = 0x807D_0000;
    BAD_TCP_MESSAGE_TYPE_INVALID = 0x807E_0000;
    BAD_TCP_SECURE_CHANNEL_UNKNOWN = 0x807F_0000;
    BAD_TCP_MESSAGE_TOO_LARGE = 0x8080_0000;
    BAD_TCP_NOT_ENOUGH_RESOURCES = 0x8081_0000;
    BAD_TCP_INTERNAL_ERROR = 0x8082_0000;
    BAD_TCP_ENDPOINT_URL_INVALID = 0x8083_0000;
    BAD_REQUEST_INTERRUPTED = 0x8084_0000;
    BAD_REQUEST_TIMEOUT = 0x8085_0000;
    BAD_SECURE_CHANNEL_CLOSED = 0x8086_0000;
    BAD_SECURE_CHANNEL_TOKEN_UNKNOWN = 0x8087_0000;
    BAD_INVALID_ARGUMENT = 0x80AB_0000;
    BAD_CONNECTION_CLOSED = 0x80AE_0000;
    BAD_INVALID_STATE = 0x80AF_0000;
    BAD_REQUEST_TOO_LARGE = 0x80B8_0000;
    BAD_RESPONSE_TOO_LARGE = 0x80B9_0000;
    BAD_PROTOCOL_VERSION_UNSUPPORTED = 0x80BE_0000;
    BAD_SECURITY_MODE_REJECTED = 0x80E7_0000;
    BAD_SECURITY_POLICY_REJECTED = 0x80E8_0000;
}

impl StatusCode {
    pub fn is_good(self) -> bool {
        self.0 & 0x8000_0000 == 0
    }

    pub fn is_bad(self) -> bool {
        !self.is_good()
    }

    /// Restrict a status to the subset allowed inside an ERR message
    /// (Part 6 Table 38); anything else travels as `BAD_TCP_INTERNAL_ERROR`.
    pub fn tcp_error(self) -> StatusCode {
        match self {
            StatusCode::BAD_TCP_SERVER_TOO_BUSY
            | StatusCode::BAD_TCP_MESSAGE_TYPE_INVALID
            | StatusCode::BAD_TCP_SECURE_CHANNEL_UNKNOWN
            | StatusCode::BAD_TCP_MESSAGE_TOO_LARGE
            | StatusCode::BAD_TIMEOUT
            | StatusCode::BAD_TCP_NOT_ENOUGH_RESOURCES
            | StatusCode::BAD_TCP_INTERNAL_ERROR
            | StatusCode::BAD_TCP_ENDPOINT_URL_INVALID
            | StatusCode::BAD_SECURITY_CHECKS_FAILED
            | StatusCode::BAD_SECURITY_POLICY_REJECTED
            | StatusCode::BAD_REQUEST_INTERRUPTED
            | StatusCode::BAD_REQUEST_TIMEOUT
            | StatusCode::BAD_SECURE_CHANNEL_CLOSED
            | StatusCode::BAD_SECURE_CHANNEL_ID_INVALID
            | StatusCode::BAD_SECURE_CHANNEL_TOKEN_UNKNOWN
            | StatusCode::BAD_CERTIFICATE_INVALID
            | StatusCode::BAD_CERTIFICATE_UNTRUSTED
            | StatusCode::BAD_CERTIFICATE_TIME_INVALID
            | StatusCode::BAD_CERTIFICATE_USE_NOT_ALLOWED
            | StatusCode::BAD_NONCE_INVALID
            | StatusCode::BAD_OUT_OF_MEMORY
            | StatusCode::BAD_INVALID_ARGUMENT
            | StatusCode::BAD_PROTOCOL_VERSION_UNSUPPORTED => self,
            _ => StatusCode::BAD_TCP_INTERNAL_ERROR,
        }
    }
}

impl fmt::Debug for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{}", name),
            None => write!(f, "StatusCode({:#010x})", self.0),
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl slog::Value for StatusCode {
    fn serialize(
        &self,
        _: &slog::Record,
        key: slog::Key,
        serializer: &mut slog::Serializer,
    ) -> slog::Result {
        serializer.emit_arguments(key, &format_args!("{}", self))
    }
}
