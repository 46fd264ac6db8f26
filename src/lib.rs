//! Connection-level state machine for the QUIC transport protocol
//! (RFC 9000/9001/9002).
//!
//! This library performs no I/O of its own. An `Endpoint` routes received
//! datagrams to `Connection`s by destination connection ID and emits `Io`
//! directives (transmissions, timer-wheel updates) for a backend to execute.
//! Each connection is driven by queued operations drained on a single thread
//! at a time.

extern crate byteorder;
extern crate bytes;
extern crate constant_time_eq;
#[macro_use]
extern crate failure;
extern crate fnv;
#[macro_use]
extern crate lazy_static;
extern crate rand;
extern crate slab;
#[macro_use]
extern crate slog;
#[cfg(test)]
#[macro_use]
extern crate assert_matches;
#[cfg(test)]
extern crate slog_term;

mod cid;
mod coding;
mod congestion;
pub mod connection;
pub mod crypto;
pub mod endpoint;
pub mod frame;
mod loss_detection;
mod operation;
pub mod packet;
mod path;
mod range_set;
mod rtt;
mod send;
mod streams;
mod ticket;
mod timer;
pub mod transport_parameters;

pub use connection::{Connection, ConnectionError, ConnectionHandle};
pub use endpoint::{Config, Endpoint, Event, Io};
pub use frame::Frame;
pub use packet::ConnectionId;
pub use timer::TimerType;

use std::fmt;
use std::ops;
use std::sync::atomic::{AtomicU64, Ordering};

use coding::{BufExt, BufMutExt, Codec};

/// QUIC version 1 (RFC 9000).
pub const VERSION_1: u32 = 0x0000_0001;
/// QUIC version 2 (RFC 9369).
pub const VERSION_2: u32 = 0x6b33_43cf;
/// Sentinel carried by version negotiation packets.
pub const VERSION_NEGOTIATION: u32 = 0;

/// Versions this endpoint speaks, in preference order.
pub const SUPPORTED_VERSIONS: [u32; 2] = [VERSION_2, VERSION_1];

pub fn is_supported_version(version: u32) -> bool {
    SUPPORTED_VERSIONS.contains(&version)
}

/// Versions of the form 0x?a?a?a?a are reserved to exercise negotiation.
pub fn is_reserved_version(version: u32) -> bool {
    version & 0x0f0f_0f0f == 0x0a0a_0a0a
}

/// Two versions interoperate across a compatible upgrade iff their Initial
/// key derivations agree on the first flight. v1 and v2 are mutually
/// compatible; everything else only with itself.
pub fn are_versions_compatible(a: u32, b: u32) -> bool {
    a == b
        || (a == VERSION_1 && b == VERSION_2)
        || (a == VERSION_2 && b == VERSION_1)
}

pub const MAX_CID_SIZE: usize = 20;
pub const MIN_CID_SIZE: usize = 4;
pub const RESET_TOKEN_SIZE: usize = 16;
pub const MIN_INITIAL_SIZE: usize = 1200;
pub const MIN_MTU: u16 = 1248;
/// Header byte + packet number area + reset token
pub const MIN_STATELESS_RESET_SIZE: usize = 1 + 4 + RESET_TOKEN_SIZE;

/// Hard cap on simultaneously tracked network paths.
pub const MAX_PATH_COUNT: usize = 4;
/// Bytes an unvalidated path may be sent per byte received.
pub const AMPLIFICATION_RATIO: u64 = 3;
/// Closing period length, in probe timeouts.
pub const CLOSE_PTO_COUNT: u32 = 3;
/// Random source CID draws before declaring the binding unusable.
pub const CID_MAX_COLLISION_RETRY: u32 = 8;
/// Short-header packets whose header protection is removed in one batch.
pub const MAX_CRYPTO_BATCH_COUNT: usize = 8;
/// Undecryptable packets parked per packet-number space.
pub const MAX_DEFERRED_PACKETS: usize = 10;
/// Packets processed per FlushRecv pass before yielding.
pub const MAX_RECEIVE_FLUSH_COUNT: usize = 100;
/// Source CIDs we keep announced to the peer.
pub const ACTIVE_CONNECTION_ID_LIMIT: u8 = 4;
/// AEAD forgery tolerance before the connection must be abandoned.
pub const AEAD_INTEGRITY_LIMIT: u64 = 1 << 52;

pub use coding::VAR_INT_MAX;

/// Whether an endpoint initiated a connection or accepted it.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
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

impl ops::Not for Side {
    type Output = Side;
    fn not(self) -> Side {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Directionality {
    /// Data flows in both directions
    Bi,
    /// Data flows only from the stream's initiator
    Uni,
}

impl ops::Not for Directionality {
    type Output = Directionality;
    fn not(self) -> Directionality {
        match self {
            Directionality::Bi => Directionality::Uni,
            Directionality::Uni => Directionality::Bi,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct StreamId(pub u64);

impl StreamId {
    pub fn new(initiator: Side, directionality: Directionality, index: u64) -> Self {
        let mut id = index << 2;
        if initiator == Side::Server {
            id |= 0x1;
        }
        if directionality == Directionality::Uni {
            id |= 0x2;
        }
        StreamId(id)
    }
    pub fn initiator(self) -> Side {
        if self.0 & 0x1 == 0 {
            Side::Client
        } else {
            Side::Server
        }
    }
    pub fn directionality(self) -> Directionality {
        if self.0 & 0x2 == 0 {
            Directionality::Bi
        } else {
            Directionality::Uni
        }
    }
    pub fn index(self) -> u64 {
        self.0 >> 2
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Codec for StreamId {
    fn decode<B: bytes::Buf>(buf: &mut B) -> coding::Result<StreamId> {
        buf.get_var().map(StreamId)
    }
    fn encode<B: bytes::BufMut>(&self, buf: &mut B) {
        buf.write_var(self.0);
    }
}

impl slog::Value for StreamId {
    fn serialize(
        &self,
        _: &slog::Record,
        key: slog::Key,
        serializer: &mut slog::Serializer,
    ) -> slog::Result {
        serializer.emit_u64(key, self.0)
    }
}

/// Transport-level error code carried by CONNECTION_CLOSE frames.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct TransportError(pub u64);

impl TransportError {
    pub const NO_ERROR: TransportError = TransportError(0x0);
    pub const INTERNAL_ERROR: TransportError = TransportError(0x1);
    pub const CONNECTION_REFUSED: TransportError = TransportError(0x2);
    pub const FLOW_CONTROL_ERROR: TransportError = TransportError(0x3);
    pub const STREAM_LIMIT_ERROR: TransportError = TransportError(0x4);
    pub const STREAM_STATE_ERROR: TransportError = TransportError(0x5);
    pub const FINAL_SIZE_ERROR: TransportError = TransportError(0x6);
    pub const FRAME_ENCODING_ERROR: TransportError = TransportError(0x7);
    pub const TRANSPORT_PARAMETER_ERROR: TransportError = TransportError(0x8);
    pub const CONNECTION_ID_LIMIT_ERROR: TransportError = TransportError(0x9);
    pub const PROTOCOL_VIOLATION: TransportError = TransportError(0xa);
    pub const INVALID_TOKEN: TransportError = TransportError(0xb);
    pub const APPLICATION_ERROR: TransportError = TransportError(0xc);
    pub const CRYPTO_BUFFER_EXCEEDED: TransportError = TransportError(0xd);
    pub const KEY_UPDATE_ERROR: TransportError = TransportError(0xe);
    pub const AEAD_LIMIT_REACHED: TransportError = TransportError(0xf);
    pub const NO_VIABLE_PATH: TransportError = TransportError(0x10);
    pub const VERSION_NEGOTIATION_ERROR: TransportError = TransportError(0x11);

    /// A TLS alert surfaced as a transport error code.
    pub fn crypto(alert: u8) -> Self {
        TransportError(0x100 | u64::from(alert))
    }

    pub fn is_protocol_error(self) -> bool {
        self.0 != 0 && self.0 <= 0x11
    }

    fn name(self) -> Option<&'static str> {
        Some(match self.0 {
            0x0 => "NO_ERROR",
            0x1 => "INTERNAL_ERROR",
            0x2 => "CONNECTION_REFUSED",
            0x3 => "FLOW_CONTROL_ERROR",
            0x4 => "STREAM_LIMIT_ERROR",
            0x5 => "STREAM_STATE_ERROR",
            0x6 => "FINAL_SIZE_ERROR",
            0x7 => "FRAME_ENCODING_ERROR",
            0x8 => "TRANSPORT_PARAMETER_ERROR",
            0x9 => "CONNECTION_ID_LIMIT_ERROR",
            0xa => "PROTOCOL_VIOLATION",
            0xb => "INVALID_TOKEN",
            0xc => "APPLICATION_ERROR",
            0xd => "CRYPTO_BUFFER_EXCEEDED",
            0xe => "KEY_UPDATE_ERROR",
            0xf => "AEAD_LIMIT_REACHED",
            0x10 => "NO_VIABLE_PATH",
            0x11 => "VERSION_NEGOTIATION_ERROR",
            _ => {
                return None;
            }
        })
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None if self.0 & !0xff == 0x100 => {
                write!(f, "CRYPTO_ERROR(alert {})", self.0 & 0xff)
            }
            None => write!(f, "TRANSPORT_ERROR({:#x})", self.0),
        }
    }
}

impl failure::Fail for TransportError {}

/// Stable status taxonomy surfaced to the application on close.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Fail)]
pub enum Status {
    #[fail(display = "success")]
    Success,
    #[fail(display = "connection refused by peer")]
    ConnectionRefused,
    #[fail(display = "protocol error")]
    ProtocolError,
    #[fail(display = "handshake failure")]
    HandshakeFailure,
    #[fail(display = "no mutually supported ALPN protocol")]
    AlpnNegotiationFailure,
    #[fail(display = "version negotiation failed")]
    VersionNegotiationError,
    #[fail(display = "TLS alert {}", _0)]
    TlsAlert(u8),
    #[fail(display = "canceled by user")]
    UserCanceled,
    #[fail(display = "aborted")]
    Aborted,
    #[fail(display = "connection idle timeout")]
    ConnectionIdle,
    #[fail(display = "peer unreachable")]
    Unreachable,
    #[fail(display = "internal error")]
    InternalError,
}

impl Status {
    /// Map a peer-supplied transport error code onto the local taxonomy.
    pub fn from_error_code(code: u64) -> Status {
        const TLS_ALERT_BASE: u64 = 0x100;
        match code {
            0x0 => Status::Success,
            0x2 => Status::ConnectionRefused,
            0x11 => Status::VersionNegotiationError,
            c if c >= TLS_ALERT_BASE && c < TLS_ALERT_BASE + 0x100 => {
                match (c - TLS_ALERT_BASE) as u8 {
                    120 => Status::AlpnNegotiationFailure,
                    90 => Status::UserCanceled,
                    alert => Status::TlsAlert(alert),
                }
            }
            _ => Status::ProtocolError,
        }
    }
}

/// Process-wide library state: monotonic identifiers and load counters.
/// Immutable after first use except for the atomics.
pub struct Library {
    next_correlation_id: AtomicU64,
    pub counters: Counters,
}

#[derive(Default)]
pub struct Counters {
    pub conn_created: AtomicU64,
    pub conn_handshake_fail: AtomicU64,
    pub conn_protocol_errors: AtomicU64,
    pub conn_app_errors: AtomicU64,
    pub paths_validated: AtomicU64,
    pub pkts_decryption_fail: AtomicU64,
    pub pkts_dropped: AtomicU64,
}

impl Library {
    pub fn next_correlation_id(&self) -> u64 {
        self.next_correlation_id.fetch_add(1, Ordering::Relaxed)
    }
}

lazy_static! {
    pub static ref LIBRARY: Library = Library {
        next_correlation_id: AtomicU64::new(1),
        counters: Counters::default(),
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_id_encoding() {
        let id = StreamId::new(Side::Server, Directionality::Uni, 5);
        assert_eq!(id.0, 5 << 2 | 0x3);
        assert_eq!(id.initiator(), Side::Server);
        assert_eq!(id.directionality(), Directionality::Uni);
        assert_eq!(id.index(), 5);
    }

    #[test]
    fn reserved_versions() {
        assert!(is_reserved_version(0x0a0a_0a0a));
        assert!(is_reserved_version(0x1a2a_3a4a));
        assert!(!is_reserved_version(VERSION_1));
        assert!(!is_reserved_version(VERSION_2));
    }

    #[test]
    fn version_compatibility() {
        assert!(are_versions_compatible(VERSION_1, VERSION_2));
        assert!(are_versions_compatible(VERSION_2, VERSION_1));
        assert!(are_versions_compatible(VERSION_1, VERSION_1));
        assert!(!are_versions_compatible(VERSION_1, 0x5));
    }

    #[test]
    fn error_code_status_mapping() {
        assert_eq!(Status::from_error_code(0x2), Status::ConnectionRefused);
        assert_eq!(
            Status::from_error_code(0x11),
            Status::VersionNegotiationError
        );
        assert_eq!(Status::from_error_code(0x100 + 120), Status::AlpnNegotiationFailure);
        assert_eq!(Status::from_error_code(0x100 + 40), Status::TlsAlert(40));
        assert_eq!(Status::from_error_code(0xa), Status::ProtocolError);
    }
}
