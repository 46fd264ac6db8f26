use std::io::Cursor;

use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BufMut};

use coding::{self, BufExt, BufMutExt};
use packet::ConnectionId;
use {Side, TransportError, MAX_CID_SIZE, RESET_TOKEN_SIZE};

// Parameter IDs from RFC 9000 §18.2 plus registered extensions.
const ORIGINAL_DESTINATION_CONNECTION_ID: u64 = 0x00;
const MAX_IDLE_TIMEOUT: u64 = 0x01;
const STATELESS_RESET_TOKEN: u64 = 0x02;
const MAX_UDP_PAYLOAD_SIZE: u64 = 0x03;
const INITIAL_MAX_DATA: u64 = 0x04;
const INITIAL_MAX_STREAM_DATA_BIDI_LOCAL: u64 = 0x05;
const INITIAL_MAX_STREAM_DATA_BIDI_REMOTE: u64 = 0x06;
const INITIAL_MAX_STREAM_DATA_UNI: u64 = 0x07;
const INITIAL_MAX_STREAMS_BIDI: u64 = 0x08;
const INITIAL_MAX_STREAMS_UNI: u64 = 0x09;
const ACK_DELAY_EXPONENT: u64 = 0x0a;
const MAX_ACK_DELAY: u64 = 0x0b;
const DISABLE_ACTIVE_MIGRATION: u64 = 0x0c;
const PREFERRED_ADDRESS: u64 = 0x0d;
const ACTIVE_CONNECTION_ID_LIMIT: u64 = 0x0e;
const INITIAL_SOURCE_CONNECTION_ID: u64 = 0x0f;
const RETRY_SOURCE_CONNECTION_ID: u64 = 0x10;
const VERSION_INFORMATION: u64 = 0x11;
const MAX_DATAGRAM_FRAME_SIZE: u64 = 0x20;
const CIBIR_ENCODING: u64 = 0x1000;
const GREASE_QUIC_BIT: u64 = 0x2ab2;
const ENABLE_TIMESTAMP: u64 = 0x7158;
const DISABLE_1RTT_ENCRYPTION: u64 = 0xbaad_075e;
const RELIABLE_RESET_ENABLED: u64 = 0x17f7_586d_2cb5_70;
const MIN_ACK_DELAY: u64 = 0xff04_de1b;

const DEFAULT_MAX_UDP_PAYLOAD_SIZE: u64 = 65527;
const MIN_MAX_UDP_PAYLOAD_SIZE: u64 = 1200;
const DEFAULT_ACK_DELAY_EXPONENT: u8 = 3;
const MAX_ACK_DELAY_EXPONENT: u8 = 20;
const DEFAULT_MAX_ACK_DELAY: u64 = 25;
const MAX_MAX_ACK_DELAY: u64 = 1 << 14;
const DEFAULT_ACTIVE_CONNECTION_ID_LIMIT: u64 = 2;
const MAX_STREAM_COUNT: u64 = 1 << 60;

/// Version negotiation info carried inside the version_information
/// parameter (RFC 9368).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VersionInfo {
    pub chosen: u32,
    pub available: Vec<u32>,
}

impl VersionInfo {
    fn read(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < 4 || buf.len() % 4 != 0 {
            return Err(Error::Malformed);
        }
        let chosen = BigEndian::read_u32(buf);
        let available = buf[4..].chunks(4).map(BigEndian::read_u32).collect();
        Ok(VersionInfo { chosen, available })
    }

    fn write(&self, w: &mut Vec<u8>) {
        w.write(self.chosen);
        for &version in &self.available {
            w.write(version);
        }
    }

    fn wire_len(&self) -> usize {
        4 + 4 * self.available.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportParameters {
    pub initial_max_data: u64,
    pub initial_max_stream_data_bidi_local: u64,
    pub initial_max_stream_data_bidi_remote: u64,
    pub initial_max_stream_data_uni: u64,
    pub initial_max_streams_bidi: u64,
    pub initial_max_streams_uni: u64,
    pub max_udp_payload_size: u64,
    /// Milliseconds; 0 disables
    pub max_idle_timeout: u64,
    pub ack_delay_exponent: u8,
    /// Milliseconds
    pub max_ack_delay: u64,
    /// Microseconds
    pub min_ack_delay: Option<u64>,
    pub active_connection_id_limit: u64,
    pub disable_active_migration: bool,
    pub max_datagram_frame_size: Option<u64>,
    pub initial_source_cid: Option<ConnectionId>,
    pub disable_1rtt_encryption: bool,
    pub grease_quic_bit: bool,
    pub reliable_reset_enabled: bool,
    pub timestamp_send_enabled: bool,
    pub timestamp_recv_enabled: bool,
    /// (length, offset)
    pub cibir: Option<(u64, u64)>,
    pub version_information: Option<VersionInfo>,

    // Server-only
    pub original_destination_cid: Option<ConnectionId>,
    pub retry_source_cid: Option<ConnectionId>,
    pub stateless_reset_token: Option<[u8; RESET_TOKEN_SIZE]>,
}

impl Default for TransportParameters {
    fn default() -> Self {
        TransportParameters {
            initial_max_data: 0,
            initial_max_stream_data_bidi_local: 0,
            initial_max_stream_data_bidi_remote: 0,
            initial_max_stream_data_uni: 0,
            initial_max_streams_bidi: 0,
            initial_max_streams_uni: 0,
            max_udp_payload_size: DEFAULT_MAX_UDP_PAYLOAD_SIZE,
            max_idle_timeout: 0,
            ack_delay_exponent: DEFAULT_ACK_DELAY_EXPONENT,
            max_ack_delay: DEFAULT_MAX_ACK_DELAY,
            min_ack_delay: None,
            active_connection_id_limit: DEFAULT_ACTIVE_CONNECTION_ID_LIMIT,
            disable_active_migration: false,
            max_datagram_frame_size: None,
            initial_source_cid: None,
            disable_1rtt_encryption: false,
            grease_quic_bit: false,
            reliable_reset_enabled: false,
            timestamp_send_enabled: false,
            timestamp_recv_enabled: false,
            cibir: None,
            version_information: None,
            original_destination_cid: None,
            retry_source_cid: None,
            stateless_reset_token: None,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Fail)]
pub enum Error {
    #[fail(display = "parameter had illegal value")]
    IllegalValue,
    #[fail(display = "parameters were malformed")]
    Malformed,
}

impl From<Error> for TransportError {
    fn from(_: Error) -> Self {
        TransportError::TRANSPORT_PARAMETER_ERROR
    }
}

impl From<coding::UnexpectedEnd> for Error {
    fn from(_: coding::UnexpectedEnd) -> Self {
        Error::Malformed
    }
}

impl TransportParameters {
    /// Encode for inclusion in the handshake. `side` is the writing
    /// endpoint's role; server-only fields are asserted absent on clients.
    pub fn write(&self, side: Side, w: &mut Vec<u8>) {
        debug_assert!(
            side.is_server()
                || (self.original_destination_cid.is_none()
                    && self.retry_source_cid.is_none()
                    && self.stateless_reset_token.is_none()),
            "client encoded server-only transport parameters"
        );
        macro_rules! varint_tp {
            ($id:expr, $val:expr, $default:expr) => {
                if $val != $default {
                    w.write_var($id);
                    w.write_var(coding::var_len($val) as u64);
                    w.write_var($val);
                }
            };
        }
        varint_tp!(MAX_IDLE_TIMEOUT, self.max_idle_timeout, 0);
        varint_tp!(
            MAX_UDP_PAYLOAD_SIZE,
            self.max_udp_payload_size,
            DEFAULT_MAX_UDP_PAYLOAD_SIZE
        );
        varint_tp!(INITIAL_MAX_DATA, self.initial_max_data, 0);
        varint_tp!(
            INITIAL_MAX_STREAM_DATA_BIDI_LOCAL,
            self.initial_max_stream_data_bidi_local,
            0
        );
        varint_tp!(
            INITIAL_MAX_STREAM_DATA_BIDI_REMOTE,
            self.initial_max_stream_data_bidi_remote,
            0
        );
        varint_tp!(INITIAL_MAX_STREAM_DATA_UNI, self.initial_max_stream_data_uni, 0);
        varint_tp!(INITIAL_MAX_STREAMS_BIDI, self.initial_max_streams_bidi, 0);
        varint_tp!(INITIAL_MAX_STREAMS_UNI, self.initial_max_streams_uni, 0);
        varint_tp!(
            ACK_DELAY_EXPONENT,
            u64::from(self.ack_delay_exponent),
            u64::from(DEFAULT_ACK_DELAY_EXPONENT)
        );
        varint_tp!(MAX_ACK_DELAY, self.max_ack_delay, DEFAULT_MAX_ACK_DELAY);
        varint_tp!(
            ACTIVE_CONNECTION_ID_LIMIT,
            self.active_connection_id_limit,
            DEFAULT_ACTIVE_CONNECTION_ID_LIMIT
        );
        if let Some(x) = self.min_ack_delay {
            w.write_var(MIN_ACK_DELAY);
            w.write_var(coding::var_len(x) as u64);
            w.write_var(x);
        }
        if let Some(x) = self.max_datagram_frame_size {
            w.write_var(MAX_DATAGRAM_FRAME_SIZE);
            w.write_var(coding::var_len(x) as u64);
            w.write_var(x);
        }
        if self.disable_active_migration {
            w.write_var(DISABLE_ACTIVE_MIGRATION);
            w.write_var(0);
        }
        if self.disable_1rtt_encryption {
            w.write_var(DISABLE_1RTT_ENCRYPTION);
            w.write_var(0);
        }
        if self.grease_quic_bit {
            w.write_var(GREASE_QUIC_BIT);
            w.write_var(0);
        }
        if self.reliable_reset_enabled {
            w.write_var(RELIABLE_RESET_ENABLED);
            w.write_var(0);
        }
        if self.timestamp_send_enabled || self.timestamp_recv_enabled {
            let flags = self.timestamp_send_enabled as u64 | (self.timestamp_recv_enabled as u64) << 1;
            w.write_var(ENABLE_TIMESTAMP);
            w.write_var(coding::var_len(flags) as u64);
            w.write_var(flags);
        }
        if let Some((length, offset)) = self.cibir {
            w.write_var(CIBIR_ENCODING);
            w.write_var((coding::var_len(length) + coding::var_len(offset)) as u64);
            w.write_var(length);
            w.write_var(offset);
        }
        if let Some(ref cid) = self.initial_source_cid {
            w.write_var(INITIAL_SOURCE_CONNECTION_ID);
            w.write_var(cid.len() as u64);
            w.extend_from_slice(cid);
        }
        if let Some(ref info) = self.version_information {
            w.write_var(VERSION_INFORMATION);
            w.write_var(info.wire_len() as u64);
            info.write(w);
        }
        if side.is_server() {
            if let Some(ref cid) = self.original_destination_cid {
                w.write_var(ORIGINAL_DESTINATION_CONNECTION_ID);
                w.write_var(cid.len() as u64);
                w.extend_from_slice(cid);
            }
            if let Some(ref cid) = self.retry_source_cid {
                w.write_var(RETRY_SOURCE_CONNECTION_ID);
                w.write_var(cid.len() as u64);
                w.extend_from_slice(cid);
            }
            if let Some(ref token) = self.stateless_reset_token {
                w.write_var(STATELESS_RESET_TOKEN);
                w.write_var(RESET_TOKEN_SIZE as u64);
                w.extend_from_slice(token);
            }
        }
    }

    /// Decode the peer's parameters. `side` is the reading endpoint's role,
    /// so server-only fields are rejected when a server is reading.
    pub fn read(side: Side, buf: &[u8]) -> Result<Self, Error> {
        let mut params = TransportParameters::default();
        let mut seen = Vec::new();
        let mut r = Cursor::new(buf);
        while r.has_remaining() {
            let id = r.get_var()?;
            let len = r.get_var()? as usize;
            if r.remaining() < len {
                return Err(Error::Malformed);
            }
            if seen.contains(&id) {
                return Err(Error::Malformed);
            }
            seen.push(id);
            if side.is_server() {
                match id {
                    ORIGINAL_DESTINATION_CONNECTION_ID
                    | RETRY_SOURCE_CONNECTION_ID
                    | STATELESS_RESET_TOKEN
                    | PREFERRED_ADDRESS => {
                        return Err(Error::IllegalValue);
                    }
                    _ => {}
                }
            }
            let start = r.position() as usize;
            let value = &buf[start..start + len];
            let mut v = Cursor::new(value);
            match id {
                MAX_IDLE_TIMEOUT => {
                    params.max_idle_timeout = Self::exact_var(&mut v)?;
                }
                MAX_UDP_PAYLOAD_SIZE => {
                    let x = Self::exact_var(&mut v)?;
                    if x < MIN_MAX_UDP_PAYLOAD_SIZE || x > DEFAULT_MAX_UDP_PAYLOAD_SIZE {
                        return Err(Error::IllegalValue);
                    }
                    params.max_udp_payload_size = x;
                }
                INITIAL_MAX_DATA => {
                    params.initial_max_data = Self::exact_var(&mut v)?;
                }
                INITIAL_MAX_STREAM_DATA_BIDI_LOCAL => {
                    params.initial_max_stream_data_bidi_local = Self::exact_var(&mut v)?;
                }
                INITIAL_MAX_STREAM_DATA_BIDI_REMOTE => {
                    params.initial_max_stream_data_bidi_remote = Self::exact_var(&mut v)?;
                }
                INITIAL_MAX_STREAM_DATA_UNI => {
                    params.initial_max_stream_data_uni = Self::exact_var(&mut v)?;
                }
                INITIAL_MAX_STREAMS_BIDI => {
                    let x = Self::exact_var(&mut v)?;
                    if x > MAX_STREAM_COUNT {
                        return Err(Error::IllegalValue);
                    }
                    params.initial_max_streams_bidi = x;
                }
                INITIAL_MAX_STREAMS_UNI => {
                    let x = Self::exact_var(&mut v)?;
                    if x > MAX_STREAM_COUNT {
                        return Err(Error::IllegalValue);
                    }
                    params.initial_max_streams_uni = x;
                }
                ACK_DELAY_EXPONENT => {
                    let x = Self::exact_var(&mut v)?;
                    // Over-limit exponents are rejected outright, not clamped
                    if x > u64::from(MAX_ACK_DELAY_EXPONENT) {
                        return Err(Error::IllegalValue);
                    }
                    params.ack_delay_exponent = x as u8;
                }
                MAX_ACK_DELAY => {
                    let x = Self::exact_var(&mut v)?;
                    if x >= MAX_MAX_ACK_DELAY {
                        return Err(Error::IllegalValue);
                    }
                    params.max_ack_delay = x;
                }
                MIN_ACK_DELAY => {
                    params.min_ack_delay = Some(Self::exact_var(&mut v)?);
                }
                ACTIVE_CONNECTION_ID_LIMIT => {
                    // Values below the protocol minimum are treated as 2
                    params.active_connection_id_limit =
                        Self::exact_var(&mut v)?.max(DEFAULT_ACTIVE_CONNECTION_ID_LIMIT);
                }
                DISABLE_ACTIVE_MIGRATION => {
                    if len != 0 {
                        return Err(Error::Malformed);
                    }
                    params.disable_active_migration = true;
                }
                MAX_DATAGRAM_FRAME_SIZE => {
                    params.max_datagram_frame_size = Some(Self::exact_var(&mut v)?);
                }
                INITIAL_SOURCE_CONNECTION_ID => {
                    params.initial_source_cid = Some(Self::cid(value)?);
                }
                ORIGINAL_DESTINATION_CONNECTION_ID => {
                    params.original_destination_cid = Some(Self::cid(value)?);
                }
                RETRY_SOURCE_CONNECTION_ID => {
                    params.retry_source_cid = Some(Self::cid(value)?);
                }
                STATELESS_RESET_TOKEN => {
                    if len != RESET_TOKEN_SIZE {
                        return Err(Error::Malformed);
                    }
                    let mut token = [0; RESET_TOKEN_SIZE];
                    token.copy_from_slice(value);
                    params.stateless_reset_token = Some(token);
                }
                DISABLE_1RTT_ENCRYPTION => {
                    if len != 0 {
                        return Err(Error::Malformed);
                    }
                    params.disable_1rtt_encryption = true;
                }
                GREASE_QUIC_BIT => {
                    if len != 0 {
                        return Err(Error::Malformed);
                    }
                    params.grease_quic_bit = true;
                }
                RELIABLE_RESET_ENABLED => {
                    if len != 0 {
                        return Err(Error::Malformed);
                    }
                    params.reliable_reset_enabled = true;
                }
                ENABLE_TIMESTAMP => {
                    let flags = Self::exact_var(&mut v)?;
                    if flags == 0 || flags > 3 {
                        return Err(Error::IllegalValue);
                    }
                    params.timestamp_send_enabled = flags & 1 != 0;
                    params.timestamp_recv_enabled = flags & 2 != 0;
                }
                CIBIR_ENCODING => {
                    let length = v.get_var()?;
                    let offset = v.get_var()?;
                    if v.has_remaining() || length == 0 {
                        return Err(Error::Malformed);
                    }
                    params.cibir = Some((length, offset));
                }
                VERSION_INFORMATION => {
                    params.version_information = Some(VersionInfo::read(value)?);
                }
                _ => {
                    // Unknown parameters must be ignored
                }
            }
            r.advance(len);
        }

        if let Some(min) = params.min_ack_delay {
            if min > params.max_ack_delay * 1_000 {
                return Err(Error::IllegalValue);
            }
        }
        Ok(params)
    }

    fn exact_var(v: &mut Cursor<&[u8]>) -> Result<u64, Error> {
        let x = v.get_var()?;
        // The length prefix must exactly cover the varint
        if v.has_remaining() {
            return Err(Error::Malformed);
        }
        Ok(x)
    }

    fn cid(value: &[u8]) -> Result<ConnectionId, Error> {
        if value.len() > MAX_CID_SIZE {
            return Err(Error::Malformed);
        }
        Ok(ConnectionId::new(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_server() -> TransportParameters {
        TransportParameters {
            initial_max_data: 1 << 20,
            initial_max_stream_data_bidi_local: 1 << 16,
            initial_max_stream_data_bidi_remote: 1 << 16,
            initial_max_stream_data_uni: 1 << 15,
            initial_max_streams_bidi: 100,
            initial_max_streams_uni: 3,
            max_udp_payload_size: 1472,
            max_idle_timeout: 30_000,
            ack_delay_exponent: 8,
            max_ack_delay: 40,
            min_ack_delay: Some(1_000),
            active_connection_id_limit: 4,
            disable_active_migration: true,
            max_datagram_frame_size: Some(1200),
            initial_source_cid: Some(ConnectionId::new(&[0xab; 8])),
            disable_1rtt_encryption: false,
            grease_quic_bit: true,
            reliable_reset_enabled: true,
            timestamp_send_enabled: true,
            timestamp_recv_enabled: false,
            cibir: Some((6, 0)),
            version_information: Some(VersionInfo {
                chosen: ::VERSION_1,
                available: vec![::VERSION_1, ::VERSION_2],
            }),
            original_destination_cid: Some(ConnectionId::new(&[0x11; 8])),
            retry_source_cid: None,
            stateless_reset_token: Some([0x42; RESET_TOKEN_SIZE]),
        }
    }

    #[test]
    fn roundtrip_preserves_present_fields() {
        let params = sample_server();
        let mut buf = Vec::new();
        params.write(Side::Server, &mut buf);
        let read = TransportParameters::read(Side::Client, &buf).unwrap();
        assert_eq!(read, params);
    }

    #[test]
    fn defaults_encode_to_nothing() {
        let mut buf = Vec::new();
        TransportParameters::default().write(Side::Client, &mut buf);
        assert!(buf.is_empty());
    }

    #[test]
    fn duplicates_rejected() {
        let mut buf = Vec::new();
        for _ in 0..2 {
            buf.write_var(INITIAL_MAX_DATA);
            buf.write_var(1);
            buf.write_var(7);
        }
        assert_eq!(
            TransportParameters::read(Side::Client, &buf),
            Err(Error::Malformed)
        );
    }

    #[test]
    fn server_only_rejected_from_client() {
        let mut buf = Vec::new();
        buf.write_var(STATELESS_RESET_TOKEN);
        buf.write_var(RESET_TOKEN_SIZE as u64);
        buf.extend_from_slice(&[0; RESET_TOKEN_SIZE]);
        assert_eq!(
            TransportParameters::read(Side::Server, &buf),
            Err(Error::IllegalValue)
        );
        assert!(TransportParameters::read(Side::Client, &buf).is_ok());
    }

    #[test]
    fn ack_delay_exponent_over_limit_rejected() {
        let mut buf = Vec::new();
        buf.write_var(ACK_DELAY_EXPONENT);
        buf.write_var(1);
        buf.write_var(21);
        assert_eq!(
            TransportParameters::read(Side::Client, &buf),
            Err(Error::IllegalValue)
        );
    }

    #[test]
    fn udp_payload_size_bounds() {
        for &(value, ok) in &[(1199u64, false), (1200, true), (65527, true), (65528, false)] {
            let mut buf = Vec::new();
            buf.write_var(MAX_UDP_PAYLOAD_SIZE);
            buf.write_var(coding::var_len(value) as u64);
            buf.write_var(value);
            assert_eq!(
                TransportParameters::read(Side::Client, &buf).is_ok(),
                ok,
                "value {}",
                value
            );
        }
    }

    #[test]
    fn min_ack_delay_exceeding_max_rejected() {
        let mut buf = Vec::new();
        buf.write_var(MIN_ACK_DELAY);
        buf.write_var(coding::var_len(26_000) as u64);
        buf.write_var(26_000); // 26 ms in us vs default max_ack_delay 25 ms
        assert_eq!(
            TransportParameters::read(Side::Client, &buf),
            Err(Error::IllegalValue)
        );
    }

    #[test]
    fn active_cid_limit_clamped_to_minimum() {
        let mut buf = Vec::new();
        buf.write_var(ACTIVE_CONNECTION_ID_LIMIT);
        buf.write_var(1);
        buf.write_var(1);
        let params = TransportParameters::read(Side::Client, &buf).unwrap();
        assert_eq!(params.active_connection_id_limit, 2);
    }

    #[test]
    fn reset_token_length_must_be_exact() {
        let mut buf = Vec::new();
        buf.write_var(STATELESS_RESET_TOKEN);
        buf.write_var(15);
        buf.extend_from_slice(&[0; 15]);
        assert_eq!(
            TransportParameters::read(Side::Client, &buf),
            Err(Error::Malformed)
        );
    }

    #[test]
    fn unknown_parameters_ignored() {
        let mut buf = Vec::new();
        buf.write_var(0x3127);
        buf.write_var(4);
        buf.extend_from_slice(&[1, 2, 3, 4]);
        assert_eq!(
            TransportParameters::read(Side::Client, &buf),
            Ok(TransportParameters::default())
        );
    }

    #[test]
    fn version_info_must_be_word_aligned() {
        let mut buf = Vec::new();
        buf.write_var(VERSION_INFORMATION);
        buf.write_var(6);
        buf.extend_from_slice(&[0, 0, 0, 1, 0xff, 0xff]);
        assert_eq!(
            TransportParameters::read(Side::Client, &buf),
            Err(Error::Malformed)
        );
    }
}
