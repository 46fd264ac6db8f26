use std::fmt;
use std::io::Cursor;
use std::ops::Deref;

use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::Rng;
use slog;

use coding::{self, BufExt, BufMutExt};
use {is_supported_version, MAX_CID_SIZE, VERSION_NEGOTIATION};

/// An endpoint-scoped identifier routing packets to a connection.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ConnectionId {
    len: u8,
    bytes: [u8; MAX_CID_SIZE],
}

impl ConnectionId {
    pub fn new(data: &[u8]) -> Self {
        debug_assert!(data.len() <= MAX_CID_SIZE);
        let mut bytes = [0; MAX_CID_SIZE];
        bytes[..data.len()].copy_from_slice(data);
        ConnectionId {
            len: data.len() as u8,
            bytes,
        }
    }

    pub fn random<R: Rng>(rng: &mut R, len: usize) -> Self {
        debug_assert!(len <= MAX_CID_SIZE);
        let mut bytes = [0; MAX_CID_SIZE];
        rng.fill_bytes(&mut bytes[..len]);
        ConnectionId {
            len: len as u8,
            bytes,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }
}

impl Deref for ConnectionId {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ConnectionId({})", self)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.len == 0 {
            return f.write_str("-");
        }
        for byte in self.iter() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl slog::Value for ConnectionId {
    fn serialize(
        &self,
        _: &slog::Record,
        key: slog::Key,
        serializer: &mut slog::Serializer,
    ) -> slog::Result {
        serializer.emit_arguments(key, &format_args!("{}", self))
    }
}

/// Key material classes, in handshake order. A packet protected at one class
/// can only be removed with that class's read key.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum KeyType {
    Initial,
    ZeroRtt,
    Handshake,
    OneRtt,
}

impl KeyType {
    pub fn space(self) -> SpaceId {
        match self {
            KeyType::Initial => SpaceId::Initial,
            KeyType::Handshake => SpaceId::Handshake,
            KeyType::ZeroRtt | KeyType::OneRtt => SpaceId::Data,
        }
    }
}

/// Packet-number spaces. 0-RTT and 1-RTT share the application data space.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum SpaceId {
    Initial = 0,
    Handshake = 1,
    Data = 2,
}

impl SpaceId {
    pub const COUNT: usize = 3;
    pub fn iter() -> impl Iterator<Item = SpaceId> {
        [SpaceId::Initial, SpaceId::Handshake, SpaceId::Data]
            .iter()
            .cloned()
    }
}

/// Long-header packet types that carry protected payloads.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LongType {
    Initial,
    ZeroRtt,
    Handshake,
    Retry,
}

impl LongType {
    /// Wire code for this type under the given version. v2 rotates the
    /// codepoints to resist ossification.
    fn code(self, version: u32) -> u8 {
        use self::LongType::*;
        if version == ::VERSION_2 {
            match self {
                Retry => 0x0,
                Initial => 0x1,
                ZeroRtt => 0x2,
                Handshake => 0x3,
            }
        } else {
            match self {
                Initial => 0x0,
                ZeroRtt => 0x1,
                Handshake => 0x2,
                Retry => 0x3,
            }
        }
    }

    fn from_code(code: u8, version: u32) -> Self {
        use self::LongType::*;
        if version == ::VERSION_2 {
            match code & 0x3 {
                0x0 => Retry,
                0x1 => Initial,
                0x2 => ZeroRtt,
                _ => Handshake,
            }
        } else {
            match code & 0x3 {
                0x0 => Initial,
                0x1 => ZeroRtt,
                0x2 => Handshake,
                _ => Retry,
            }
        }
    }
}

/// A truncated packet number, encoded in the fewest whole bytes that
/// unambiguously identify it relative to the largest acknowledged number.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PacketNumber {
    U8(u8),
    U16(u16),
    U24(u32),
    U32(u32),
}

impl PacketNumber {
    pub fn new(n: u64, largest_acked: u64) -> Self {
        let range = (n - largest_acked) * 2;
        if range < 1 << 8 {
            PacketNumber::U8(n as u8)
        } else if range < 1 << 16 {
            PacketNumber::U16(n as u16)
        } else if range < 1 << 24 {
            PacketNumber::U24(n as u32)
        } else {
            PacketNumber::U32(n as u32)
        }
    }

    pub fn len(self) -> usize {
        use self::PacketNumber::*;
        match self {
            U8(_) => 1,
            U16(_) => 2,
            U24(_) => 3,
            U32(_) => 4,
        }
    }

    /// Low two bits of the first header byte.
    pub fn tag(self) -> u8 {
        (self.len() - 1) as u8
    }

    pub fn encode<B: BufMut>(self, buf: &mut B) {
        use self::PacketNumber::*;
        match self {
            U8(x) => buf.write(x),
            U16(x) => buf.write(x),
            U24(x) => {
                buf.put_u8((x >> 16) as u8);
                buf.put_u16_be(x as u16);
            }
            U32(x) => buf.write(x),
        }
    }

    pub fn decode(len: usize, bytes: &[u8]) -> Self {
        use self::PacketNumber::*;
        debug_assert!(len >= 1 && len <= 4 && bytes.len() >= len);
        match len {
            1 => U8(bytes[0]),
            2 => U16(BigEndian::read_u16(bytes)),
            3 => U24(BigEndian::read_u24(bytes)),
            _ => U32(BigEndian::read_u32(bytes)),
        }
    }

    /// Recover the full packet number closest to one past the largest
    /// successfully processed number in this space.
    pub fn expand(self, expected: u64) -> u64 {
        use self::PacketNumber::*;
        let (truncated, nbits) = match self {
            U8(x) => (u64::from(x), 8),
            U16(x) => (u64::from(x), 16),
            U24(x) => (u64::from(x), 24),
            U32(x) => (u64::from(x), 32),
        };
        let win = 1u64 << nbits;
        let hwin = win / 2;
        let mask = win - 1;
        let candidate = (expected & !mask) | truncated;
        if expected.checked_sub(hwin).map_or(false, |x| candidate <= x) {
            candidate + win
        } else if candidate > expected + hwin && candidate >= win {
            candidate - win
        } else {
            candidate
        }
    }
}

#[derive(Debug, Clone)]
pub enum Header {
    Initial {
        version: u32,
        src_cid: ConnectionId,
        dst_cid: ConnectionId,
        token: Bytes,
        number: PacketNumber,
    },
    Long {
        ty: LongType,
        version: u32,
        src_cid: ConnectionId,
        dst_cid: ConnectionId,
        number: PacketNumber,
    },
    Retry {
        version: u32,
        src_cid: ConnectionId,
        dst_cid: ConnectionId,
    },
    Short {
        dst_cid: ConnectionId,
        number: PacketNumber,
        key_phase: bool,
    },
    VersionNegotiate {
        random: u8,
        src_cid: ConnectionId,
        dst_cid: ConnectionId,
    },
}

impl Header {
    pub fn key_type(&self) -> Option<KeyType> {
        use self::Header::*;
        match *self {
            Initial { .. } => Some(KeyType::Initial),
            Long {
                ty: LongType::Handshake,
                ..
            } => Some(KeyType::Handshake),
            Long {
                ty: LongType::ZeroRtt,
                ..
            } => Some(KeyType::ZeroRtt),
            Short { .. } => Some(KeyType::OneRtt),
            _ => None,
        }
    }

    pub fn dst_cid(&self) -> ConnectionId {
        use self::Header::*;
        match *self {
            Initial { dst_cid, .. }
            | Long { dst_cid, .. }
            | Retry { dst_cid, .. }
            | Short { dst_cid, .. }
            | VersionNegotiate { dst_cid, .. } => dst_cid,
        }
    }

    pub fn number(&self) -> Option<PacketNumber> {
        use self::Header::*;
        match *self {
            Initial { number, .. } | Long { number, .. } | Short { number, .. } => Some(number),
            _ => None,
        }
    }

    pub fn is_short(&self) -> bool {
        match *self {
            Header::Short { .. } => true,
            _ => false,
        }
    }

    /// Write the unprotected header. Long headers leave a placeholder Length
    /// that `PartialEncode::finish` fixes up once the payload size is known.
    pub fn encode(&self, buf: &mut Vec<u8>) -> PartialEncode {
        use self::Header::*;
        match *self {
            Initial {
                version,
                ref src_cid,
                ref dst_cid,
                ref token,
                number,
            } => {
                buf.write(
                    0xc0 | (LongType::Initial.code(version) << 4) | number.tag(),
                );
                buf.write(version);
                Self::encode_cid_pair(buf, dst_cid, src_cid);
                buf.write_var(token.len() as u64);
                buf.extend_from_slice(token);
                let len_pos = buf.len();
                buf.write::<u16>(0); // length placeholder, 2-byte varint
                let pn_pos = buf.len();
                number.encode(buf);
                PartialEncode {
                    len_pos: Some(len_pos),
                    pn_pos: Some(pn_pos),
                    pn_len: number.len(),
                }
            }
            Long {
                ty,
                version,
                ref src_cid,
                ref dst_cid,
                number,
            } => {
                buf.write(0xc0 | (ty.code(version) << 4) | number.tag());
                buf.write(version);
                Self::encode_cid_pair(buf, dst_cid, src_cid);
                let len_pos = buf.len();
                buf.write::<u16>(0);
                let pn_pos = buf.len();
                number.encode(buf);
                PartialEncode {
                    len_pos: Some(len_pos),
                    pn_pos: Some(pn_pos),
                    pn_len: number.len(),
                }
            }
            Retry {
                version,
                ref src_cid,
                ref dst_cid,
            } => {
                buf.write(0xc0 | (LongType::Retry.code(version) << 4));
                buf.write(version);
                Self::encode_cid_pair(buf, dst_cid, src_cid);
                PartialEncode {
                    len_pos: None,
                    pn_pos: None,
                    pn_len: 0,
                }
            }
            Short {
                ref dst_cid,
                number,
                key_phase,
            } => {
                buf.write(0x40 | (if key_phase { 0x04 } else { 0 }) | number.tag());
                buf.extend_from_slice(dst_cid);
                let pn_pos = buf.len();
                number.encode(buf);
                PartialEncode {
                    len_pos: None,
                    pn_pos: Some(pn_pos),
                    pn_len: number.len(),
                }
            }
            VersionNegotiate {
                random,
                ref src_cid,
                ref dst_cid,
            } => {
                buf.write(0x80 | random);
                buf.write(VERSION_NEGOTIATION);
                Self::encode_cid_pair(buf, dst_cid, src_cid);
                PartialEncode {
                    len_pos: None,
                    pn_pos: None,
                    pn_len: 0,
                }
            }
        }
    }

    fn encode_cid_pair(buf: &mut Vec<u8>, dst_cid: &ConnectionId, src_cid: &ConnectionId) {
        buf.write(dst_cid.len() as u8);
        buf.extend_from_slice(dst_cid);
        buf.write(src_cid.len() as u8);
        buf.extend_from_slice(src_cid);
    }
}

/// State needed to finish encoding a packet once its payload is in place.
pub struct PartialEncode {
    len_pos: Option<usize>,
    pn_pos: Option<usize>,
    pn_len: usize,
}

impl PartialEncode {
    /// Patch the long-header Length field and apply header protection.
    /// `header_len` is the length of the full header, packet number
    /// included.
    pub fn finish(self, buf: &mut Vec<u8>, header_key: &::crypto::HeaderKey, header_len: usize) {
        if let Some(len_pos) = self.len_pos {
            let len = buf.len() - len_pos - 2;
            debug_assert!(len < 1 << 14);
            BigEndian::write_u16(&mut buf[len_pos..len_pos + 2], len as u16 | 0x4000);
        }
        let pn_pos = match self.pn_pos {
            Some(x) => x,
            None => {
                return;
            }
        };
        debug_assert_eq!(pn_pos + self.pn_len, header_len);
        let mut sample = [0; SAMPLE_SIZE];
        sample.copy_from_slice(&buf[pn_pos + 4..pn_pos + 4 + SAMPLE_SIZE]);
        let mask = header_key.mask(&sample);
        if buf[0] & 0x80 != 0 {
            buf[0] ^= mask[0] & 0x0f;
        } else {
            buf[0] ^= mask[0] & 0x1f;
        }
        for i in 0..self.pn_len {
            buf[pn_pos + i] ^= mask[1 + i];
        }
    }
}

/// Bytes of ciphertext sampled to derive the header-protection mask.
pub const SAMPLE_SIZE: usize = 16;

#[derive(Debug, Fail, Clone, PartialEq, Eq)]
pub enum PacketDecodeError {
    #[fail(display = "unsupported version {:#x}", version)]
    UnsupportedVersion {
        version: u32,
        source: ConnectionId,
        destination: ConnectionId,
    },
    #[fail(display = "invalid header: {}", _0)]
    InvalidHeader(&'static str),
}

impl From<coding::UnexpectedEnd> for PacketDecodeError {
    fn from(_: coding::UnexpectedEnd) -> Self {
        PacketDecodeError::InvalidHeader("unexpected end of packet")
    }
}

/// A packet whose invariant header has been parsed but whose protected
/// fields (packet number, payload) are still opaque.
#[derive(Debug)]
pub struct PartialDecode {
    first: u8,
    version: u32,
    dst_cid: ConnectionId,
    src_cid: ConnectionId,
    token: Bytes,
    /// Offset of the (protected) packet number area
    header_len: usize,
    buf: BytesMut,
}

impl PartialDecode {
    /// Parse one packet's invariant header out of `data`, returning the
    /// remainder of the datagram if packets are coalesced behind it.
    pub fn new(
        data: BytesMut,
        local_cid_len: usize,
    ) -> Result<(Self, Option<BytesMut>), PacketDecodeError> {
        let mut buf = Cursor::new(&data[..]);
        let first: u8 = buf.get()?;
        if first & 0x80 != 0 {
            // Long header
            let version: u32 = buf.get()?;
            let dst_cid = Self::decode_cid(&mut buf)?;
            let src_cid = Self::decode_cid(&mut buf)?;
            if version == VERSION_NEGOTIATION {
                let header_len = buf.position() as usize;
                return Ok((
                    PartialDecode {
                        first,
                        version,
                        dst_cid,
                        src_cid,
                        token: Bytes::new(),
                        header_len,
                        buf: data,
                    },
                    None,
                ));
            }
            if !is_supported_version(version) {
                return Err(PacketDecodeError::UnsupportedVersion {
                    version,
                    source: src_cid,
                    destination: dst_cid,
                });
            }
            if first & 0x40 == 0 {
                return Err(PacketDecodeError::InvalidHeader("fixed bit unset"));
            }
            let ty = LongType::from_code((first >> 4) & 0x3, version);
            if let LongType::Retry = ty {
                let header_len = buf.position() as usize;
                return Ok((
                    PartialDecode {
                        first,
                        version,
                        dst_cid,
                        src_cid,
                        token: Bytes::new(),
                        header_len,
                        buf: data,
                    },
                    None,
                ));
            }
            let token = if let LongType::Initial = ty {
                let token_len = buf.get_var()? as usize;
                if buf.remaining() < token_len {
                    return Err(PacketDecodeError::InvalidHeader("token out of bounds"));
                }
                let start = buf.position() as usize;
                buf.advance(token_len);
                data.clone().freeze().slice(start, start + token_len)
            } else {
                Bytes::new()
            };
            let len = buf.get_var()? as usize;
            let header_len = buf.position() as usize;
            if len > buf.remaining() {
                return Err(PacketDecodeError::InvalidHeader("payload longer than packet"));
            }
            let packet_len = header_len + len;
            let mut data = data;
            let rest = if packet_len < data.len() {
                Some(data.split_off(packet_len))
            } else {
                None
            };
            Ok((
                PartialDecode {
                    first,
                    version,
                    dst_cid,
                    src_cid,
                    token,
                    header_len,
                    buf: data,
                },
                rest,
            ))
        } else {
            // Short header: runs to the end of the datagram
            if first & 0x40 == 0 {
                return Err(PacketDecodeError::InvalidHeader("fixed bit unset"));
            }
            if buf.remaining() < local_cid_len {
                return Err(PacketDecodeError::InvalidHeader("destination CID out of bounds"));
            }
            let start = buf.position() as usize;
            let dst_cid = ConnectionId::new(&data[start..start + local_cid_len]);
            let header_len = start + local_cid_len;
            Ok((
                PartialDecode {
                    first,
                    version: 0,
                    dst_cid,
                    src_cid: ConnectionId::new(&[]),
                    token: Bytes::new(),
                    header_len,
                    buf: data,
                },
                None,
            ))
        }
    }

    fn decode_cid(buf: &mut Cursor<&[u8]>) -> Result<ConnectionId, PacketDecodeError> {
        let len = buf.get::<u8>()? as usize;
        if len > MAX_CID_SIZE {
            return Err(PacketDecodeError::InvalidHeader("illegal connection ID length"));
        }
        if buf.remaining() < len {
            return Err(PacketDecodeError::InvalidHeader("connection ID out of bounds"));
        }
        let start = buf.position() as usize;
        let cid = ConnectionId::new(&buf.get_ref()[start..start + len]);
        buf.advance(len);
        Ok(cid)
    }

    pub fn is_long(&self) -> bool {
        self.first & 0x80 != 0
    }

    pub fn is_version_negotiate(&self) -> bool {
        self.is_long() && self.version == VERSION_NEGOTIATION
    }

    pub fn is_retry(&self) -> bool {
        self.is_long()
            && self.version != VERSION_NEGOTIATION
            && LongType::from_code((self.first >> 4) & 0x3, self.version) == LongType::Retry
    }

    pub fn is_initial(&self) -> bool {
        self.is_long()
            && self.version != VERSION_NEGOTIATION
            && LongType::from_code((self.first >> 4) & 0x3, self.version) == LongType::Initial
    }

    pub fn key_type(&self) -> Option<KeyType> {
        if !self.is_long() {
            return Some(KeyType::OneRtt);
        }
        if self.version == VERSION_NEGOTIATION {
            return None;
        }
        match LongType::from_code((self.first >> 4) & 0x3, self.version) {
            LongType::Initial => Some(KeyType::Initial),
            LongType::ZeroRtt => Some(KeyType::ZeroRtt),
            LongType::Handshake => Some(KeyType::Handshake),
            LongType::Retry => None,
        }
    }

    pub fn dst_cid(&self) -> ConnectionId {
        self.dst_cid
    }

    pub fn src_cid(&self) -> ConnectionId {
        self.src_cid
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Ciphertext sample for header-protection mask derivation.
    pub fn sample(&self) -> Result<[u8; SAMPLE_SIZE], PacketDecodeError> {
        let start = self.header_len + 4;
        if self.buf.len() < start + SAMPLE_SIZE {
            return Err(PacketDecodeError::InvalidHeader("too short to sample"));
        }
        let mut sample = [0; SAMPLE_SIZE];
        sample.copy_from_slice(&self.buf[start..start + SAMPLE_SIZE]);
        Ok(sample)
    }

    /// Remove header protection with a precomputed mask and expand the packet
    /// number against `expected`, producing a decryptable `Packet`.
    pub fn finish(mut self, mask: [u8; 5], expected: u64) -> Result<Packet, PacketDecodeError> {
        debug_assert!(self.key_type().is_some());
        let long = self.is_long();
        if long {
            self.buf[0] ^= mask[0] & 0x0f;
        } else {
            self.buf[0] ^= mask[0] & 0x1f;
        }
        let first = self.buf[0];
        let pn_len = (first & 0x03) as usize + 1;
        if self.buf.len() < self.header_len + pn_len {
            return Err(PacketDecodeError::InvalidHeader("packet number out of bounds"));
        }
        for i in 0..pn_len {
            self.buf[self.header_len + i] ^= mask[1 + i];
        }
        let number =
            PacketNumber::decode(pn_len, &self.buf[self.header_len..self.header_len + pn_len]);
        let reserved_bits = if long {
            (first >> 2) & 0x3
        } else {
            (first >> 3) & 0x3
        };
        let header = if long {
            match LongType::from_code((first >> 4) & 0x3, self.version) {
                LongType::Initial => Header::Initial {
                    version: self.version,
                    src_cid: self.src_cid,
                    dst_cid: self.dst_cid,
                    token: self.token.clone(),
                    number,
                },
                ty => Header::Long {
                    ty,
                    version: self.version,
                    src_cid: self.src_cid,
                    dst_cid: self.dst_cid,
                    number,
                },
            }
        } else {
            Header::Short {
                dst_cid: self.dst_cid,
                number,
                key_phase: first & 0x04 != 0,
            }
        };
        let mut payload = self.buf;
        let header_data = payload.split_to(self.header_len + pn_len).freeze();
        Ok(Packet {
            header,
            header_data,
            payload,
            number: number.expand(expected),
            reserved_bits,
        })
    }

    /// Complete decoding of packets that carry no protected fields
    /// (Retry and version negotiation).
    pub fn finish_unprotected(self) -> Packet {
        let header = if self.version == VERSION_NEGOTIATION {
            Header::VersionNegotiate {
                random: self.first & 0x7f,
                src_cid: self.src_cid,
                dst_cid: self.dst_cid,
            }
        } else {
            Header::Retry {
                version: self.version,
                src_cid: self.src_cid,
                dst_cid: self.dst_cid,
            }
        };
        let mut payload = self.buf;
        let header_data = payload.split_to(self.header_len).freeze();
        Packet {
            header,
            header_data,
            payload,
            number: 0,
            reserved_bits: 0,
        }
    }
}

pub struct Packet {
    pub header: Header,
    /// Unprotected header bytes, packet number included
    pub header_data: Bytes,
    /// Encrypted payload (AEAD tag included until decryption)
    pub payload: BytesMut,
    /// Fully expanded packet number
    pub number: u64,
    pub reserved_bits: u8,
}

/// Parse the version list from a version negotiation packet's payload.
pub fn parse_version_list(payload: &[u8]) -> Option<Vec<u32>> {
    if payload.is_empty() || payload.len() % 4 != 0 {
        return None;
    }
    Some(payload.chunks(4).map(BigEndian::read_u32).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pn_expansion() {
        // RFC 9000 appendix A.3
        assert_eq!(
            PacketNumber::U16(0x9b32).expand(0xa82f30ea + 1),
            0xa82f9b32
        );
        // Stays put when already nearby
        assert_eq!(PacketNumber::U8(0x33).expand(0x30), 0x33);
        // Wraps downward
        assert_eq!(PacketNumber::U8(0xff).expand(0x1_05), 0xff);
    }

    #[test]
    fn pn_encoding_length() {
        assert_eq!(PacketNumber::new(10, 0).len(), 1);
        assert_eq!(PacketNumber::new(300, 0).len(), 2);
        assert_eq!(PacketNumber::new(0x12_3456, 0).len(), 3);
        assert_eq!(PacketNumber::new(0x1234_5678, 0).len(), 4);
    }

    #[test]
    fn long_type_codes_rotate_in_v2() {
        assert_eq!(LongType::Initial.code(::VERSION_1), 0x0);
        assert_eq!(LongType::Initial.code(::VERSION_2), 0x1);
        assert_eq!(LongType::from_code(0x0, ::VERSION_2), LongType::Retry);
        for &ty in &[
            LongType::Initial,
            LongType::ZeroRtt,
            LongType::Handshake,
            LongType::Retry,
        ] {
            for &v in &[::VERSION_1, ::VERSION_2] {
                assert_eq!(LongType::from_code(ty.code(v), v), ty);
            }
        }
    }

    #[test]
    fn partial_decode_short_header() {
        let mut data = vec![0x41];
        data.extend_from_slice(&[0xaa; 8]); // dst cid
        data.extend_from_slice(&[0; 40]); // pn + payload
        let (decode, rest) = PartialDecode::new(data[..].into(), 8).unwrap();
        assert!(rest.is_none());
        assert!(!decode.is_long());
        assert_eq!(decode.key_type(), Some(KeyType::OneRtt));
        assert_eq!(decode.dst_cid(), ConnectionId::new(&[0xaa; 8]));
    }

    #[test]
    fn partial_decode_rejects_unknown_version() {
        let mut data = vec![0xc0];
        data.extend_from_slice(&[0x0b, 0xad, 0xf0, 0x0d]);
        data.extend_from_slice(&[0, 0]); // empty cids
        assert_matches!(
            PartialDecode::new(data[..].into(), 0),
            Err(PacketDecodeError::UnsupportedVersion { version: 0x0bad_f00d, .. })
        );
    }

    #[test]
    fn partial_decode_coalesced_split() {
        let mut buf = Vec::new();
        let header = Header::Initial {
            version: ::VERSION_1,
            src_cid: ConnectionId::new(&[1; 4]),
            dst_cid: ConnectionId::new(&[2; 8]),
            token: Bytes::new(),
            number: PacketNumber::U8(0),
        };
        header.encode(&mut buf);
        let header_len = buf.len();
        buf.extend_from_slice(&[0; 32]); // payload
        let len = 1 + 32; // pn byte is inside the Length field
        let len_pos = header_len - 3;
        BigEndian::write_u16(&mut buf[len_pos..len_pos + 2], len as u16 | 0x4000);
        buf.extend_from_slice(&[0x41, 0xee]); // trailing bytes = next packet
        let total = buf.len();
        let (decode, rest) = PartialDecode::new(buf[..].into(), 8).unwrap();
        assert!(decode.is_initial());
        assert_eq!(decode.len() + 2, total);
        assert_eq!(&rest.unwrap()[..], &[0x41, 0xee]);
    }

    #[test]
    fn version_list_parsing() {
        assert_eq!(
            parse_version_list(&[0, 0, 0, 1, 0x6b, 0x33, 0x43, 0xcf]),
            Some(vec![::VERSION_1, ::VERSION_2])
        );
        assert_eq!(parse_version_list(&[0, 0, 1]), None);
        assert_eq!(parse_version_list(&[]), None);
    }
}
