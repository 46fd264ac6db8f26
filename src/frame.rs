use std::io::Cursor;
use std::{fmt, mem};

use bytes::{Buf, BufMut, Bytes, IntoBuf};
use slog;

use coding::{BufExt, BufMutExt, UnexpectedEnd};
use packet::{ConnectionId, KeyType};
use range_set::RangeSet;
use {Directionality, StreamId, TransportError, MAX_CID_SIZE, RESET_TOKEN_SIZE};

#[derive(Copy, Clone, Eq, PartialEq)]
pub struct Type(pub u64);

impl Type {
    pub const PADDING: Type = Type(0x00);
    pub const PING: Type = Type(0x01);
    pub const ACK: Type = Type(0x02);
    pub const ACK_ECN: Type = Type(0x03);
    pub const RESET_STREAM: Type = Type(0x04);
    pub const STOP_SENDING: Type = Type(0x05);
    pub const CRYPTO: Type = Type(0x06);
    pub const NEW_TOKEN: Type = Type(0x07);
    // STREAM frames occupy 0x08..=0x0f; low bits are FIN/LEN/OFF
    pub const MAX_DATA: Type = Type(0x10);
    pub const MAX_STREAM_DATA: Type = Type(0x11);
    pub const MAX_STREAMS_BIDI: Type = Type(0x12);
    pub const MAX_STREAMS_UNI: Type = Type(0x13);
    pub const DATA_BLOCKED: Type = Type(0x14);
    pub const STREAM_DATA_BLOCKED: Type = Type(0x15);
    pub const STREAMS_BLOCKED_BIDI: Type = Type(0x16);
    pub const STREAMS_BLOCKED_UNI: Type = Type(0x17);
    pub const NEW_CONNECTION_ID: Type = Type(0x18);
    pub const RETIRE_CONNECTION_ID: Type = Type(0x19);
    pub const PATH_CHALLENGE: Type = Type(0x1a);
    pub const PATH_RESPONSE: Type = Type(0x1b);
    pub const CONNECTION_CLOSE: Type = Type(0x1c);
    pub const APPLICATION_CLOSE: Type = Type(0x1d);
    pub const HANDSHAKE_DONE: Type = Type(0x1e);
    pub const DATAGRAM: Type = Type(0x30);
    pub const DATAGRAM_LEN: Type = Type(0x31);
    pub const IMMEDIATE_ACK: Type = Type(0xac);
    pub const ACK_FREQUENCY: Type = Type(0xaf);
    pub const TIMESTAMP: Type = Type(0x2f5);

    pub fn is_stream(self) -> bool {
        self.0 >= 0x08 && self.0 <= 0x0f
    }

    pub fn is_datagram(self) -> bool {
        self.0 == 0x30 || self.0 == 0x31
    }

    /// Whether a frame of this type may appear in a packet protected with
    /// the given key class. Violations are FRAME_ENCODING_ERROR.
    pub fn is_allowed(self, key: KeyType) -> bool {
        match key {
            KeyType::Initial | KeyType::Handshake => match self {
                Type::PADDING
                | Type::PING
                | Type::ACK
                | Type::ACK_ECN
                | Type::CRYPTO
                | Type::CONNECTION_CLOSE => true,
                _ => false,
            },
            KeyType::ZeroRtt => match self {
                Type::ACK | Type::ACK_ECN | Type::HANDSHAKE_DONE => false,
                _ => true,
            },
            KeyType::OneRtt => true,
        }
    }

    /// Probing frames do not signal a desire to migrate (RFC 9000 §9.2).
    pub fn is_probing(self) -> bool {
        match self {
            Type::PADDING
            | Type::PATH_CHALLENGE
            | Type::PATH_RESPONSE
            | Type::NEW_CONNECTION_ID => true,
            _ => false,
        }
    }

    fn name(self) -> &'static str {
        if self.is_stream() {
            return "STREAM";
        }
        match self {
            Type::PADDING => "PADDING",
            Type::PING => "PING",
            Type::ACK => "ACK",
            Type::ACK_ECN => "ACK_ECN",
            Type::RESET_STREAM => "RESET_STREAM",
            Type::STOP_SENDING => "STOP_SENDING",
            Type::CRYPTO => "CRYPTO",
            Type::NEW_TOKEN => "NEW_TOKEN",
            Type::MAX_DATA => "MAX_DATA",
            Type::MAX_STREAM_DATA => "MAX_STREAM_DATA",
            Type::MAX_STREAMS_BIDI => "MAX_STREAMS_BIDI",
            Type::MAX_STREAMS_UNI => "MAX_STREAMS_UNI",
            Type::DATA_BLOCKED => "DATA_BLOCKED",
            Type::STREAM_DATA_BLOCKED => "STREAM_DATA_BLOCKED",
            Type::STREAMS_BLOCKED_BIDI => "STREAMS_BLOCKED_BIDI",
            Type::STREAMS_BLOCKED_UNI => "STREAMS_BLOCKED_UNI",
            Type::NEW_CONNECTION_ID => "NEW_CONNECTION_ID",
            Type::RETIRE_CONNECTION_ID => "RETIRE_CONNECTION_ID",
            Type::PATH_CHALLENGE => "PATH_CHALLENGE",
            Type::PATH_RESPONSE => "PATH_RESPONSE",
            Type::CONNECTION_CLOSE => "CONNECTION_CLOSE",
            Type::APPLICATION_CLOSE => "APPLICATION_CLOSE",
            Type::HANDSHAKE_DONE => "HANDSHAKE_DONE",
            Type::DATAGRAM | Type::DATAGRAM_LEN => "DATAGRAM",
            Type::IMMEDIATE_ACK => "IMMEDIATE_ACK",
            Type::ACK_FREQUENCY => "ACK_FREQUENCY",
            Type::TIMESTAMP => "TIMESTAMP",
            _ => "UNKNOWN",
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Debug for Type {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Type({:#x} {})", self.0, self.name())
    }
}

impl slog::Value for Type {
    fn serialize(
        &self,
        _: &slog::Record,
        key: slog::Key,
        serializer: &mut slog::Serializer,
    ) -> slog::Result {
        serializer.emit_arguments(key, &format_args!("{}", self))
    }
}

#[derive(Debug, Clone)]
pub enum Frame {
    Padding,
    Ping,
    Ack(Ack),
    ResetStream {
        id: StreamId,
        error_code: u64,
        final_size: u64,
    },
    StopSending {
        id: StreamId,
        error_code: u64,
    },
    Crypto(Crypto),
    NewToken {
        token: Bytes,
    },
    Stream(Stream),
    MaxData(u64),
    MaxStreamData {
        id: StreamId,
        offset: u64,
    },
    MaxStreams {
        directionality: Directionality,
        count: u64,
    },
    DataBlocked {
        offset: u64,
    },
    StreamDataBlocked {
        id: StreamId,
        offset: u64,
    },
    StreamsBlocked {
        directionality: Directionality,
        limit: u64,
    },
    NewConnectionId(NewConnectionId),
    RetireConnectionId {
        sequence: u64,
    },
    PathChallenge([u8; 8]),
    PathResponse([u8; 8]),
    ConnectionClose(ConnectionClose),
    ApplicationClose(ApplicationClose),
    HandshakeDone,
    Datagram {
        data: Bytes,
    },
    AckFrequency {
        sequence: u64,
        packet_tolerance: u64,
        max_ack_delay: u64,
        ignore_order: bool,
    },
    ImmediateAck,
    Timestamp(u64),
    Invalid(Type),
}

impl Frame {
    pub fn ty(&self) -> Type {
        use self::Frame::*;
        match *self {
            Padding => Type::PADDING,
            Ping => Type::PING,
            Ack(_) => Type::ACK,
            ResetStream { .. } => Type::RESET_STREAM,
            StopSending { .. } => Type::STOP_SENDING,
            Crypto(_) => Type::CRYPTO,
            NewToken { .. } => Type::NEW_TOKEN,
            Stream(ref x) => {
                let mut ty = 0x08;
                if x.fin {
                    ty |= 0x01;
                }
                if x.offset != 0 {
                    ty |= 0x04;
                }
                Type(ty | 0x02)
            }
            MaxData(_) => Type::MAX_DATA,
            MaxStreamData { .. } => Type::MAX_STREAM_DATA,
            MaxStreams {
                directionality: Directionality::Bi,
                ..
            } => Type::MAX_STREAMS_BIDI,
            MaxStreams { .. } => Type::MAX_STREAMS_UNI,
            DataBlocked { .. } => Type::DATA_BLOCKED,
            StreamDataBlocked { .. } => Type::STREAM_DATA_BLOCKED,
            StreamsBlocked {
                directionality: Directionality::Bi,
                ..
            } => Type::STREAMS_BLOCKED_BIDI,
            StreamsBlocked { .. } => Type::STREAMS_BLOCKED_UNI,
            NewConnectionId(_) => Type::NEW_CONNECTION_ID,
            RetireConnectionId { .. } => Type::RETIRE_CONNECTION_ID,
            PathChallenge(_) => Type::PATH_CHALLENGE,
            PathResponse(_) => Type::PATH_RESPONSE,
            ConnectionClose(_) => Type::CONNECTION_CLOSE,
            ApplicationClose(_) => Type::APPLICATION_CLOSE,
            HandshakeDone => Type::HANDSHAKE_DONE,
            Datagram { .. } => Type::DATAGRAM_LEN,
            AckFrequency { .. } => Type::ACK_FREQUENCY,
            ImmediateAck => Type::IMMEDIATE_ACK,
            Timestamp(_) => Type::TIMESTAMP,
            Invalid(ty) => ty,
        }
    }
}

/// An ACK frame, with ranges held inclusive and sorted ascending.
#[derive(Debug, Clone)]
pub struct Ack {
    pub largest: u64,
    /// Microseconds, exponent already applied by the receiver
    pub delay: u64,
    pub ranges: Vec<(u64, u64)>,
    pub ecn: Option<EcnCounts>,
}

#[derive(Debug, Copy, Clone, Default)]
pub struct EcnCounts {
    pub ect0: u64,
    pub ect1: u64,
    pub ce: u64,
}

impl Ack {
    fn decode<T: Buf>(buf: &mut T, ecn: bool) -> Result<Ack, UnexpectedEnd> {
        let largest = buf.get_var()?;
        let delay = buf.get_var()?;
        let range_count = buf.get_var()?;
        let first = buf.get_var()?;
        if first > largest {
            return Err(UnexpectedEnd);
        }
        let mut smallest = largest - first;
        let mut ranges = Vec::with_capacity(range_count as usize + 1);
        ranges.push((smallest, largest));
        for _ in 0..range_count {
            let gap = buf.get_var()?;
            let len = buf.get_var()?;
            if gap + 2 > smallest {
                return Err(UnexpectedEnd);
            }
            let end = smallest - gap - 2;
            if len > end {
                return Err(UnexpectedEnd);
            }
            smallest = end - len;
            ranges.push((smallest, end));
        }
        ranges.reverse();
        let ecn = if ecn {
            Some(EcnCounts {
                ect0: buf.get_var()?,
                ect1: buf.get_var()?,
                ce: buf.get_var()?,
            })
        } else {
            None
        };
        Ok(Ack {
            largest,
            delay,
            ranges,
            ecn,
        })
    }

    pub fn encode<B: BufMut>(delay: u64, ranges: &RangeSet, buf: &mut B) {
        debug_assert!(!ranges.is_empty());
        let mut iter = ranges.iter().rev();
        let first = iter.next().unwrap();
        let largest = first.end - 1;
        buf.write(Type::ACK.0 as u8);
        buf.write_var(largest);
        buf.write_var(delay);
        buf.write_var(ranges.len() as u64 - 1);
        buf.write_var(first.end - first.start - 1);
        let mut prev = first.start;
        for block in iter {
            buf.write_var(prev - block.end - 1); // gap - 1 per encoding
            buf.write_var(block.end - block.start - 1);
            prev = block.start;
        }
    }

    pub fn iter(&self) -> ::std::slice::Iter<(u64, u64)> {
        self.ranges.iter()
    }
}

#[derive(Debug, Clone)]
pub struct Crypto {
    pub offset: u64,
    pub data: Bytes,
}

impl Crypto {
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.write(Type::CRYPTO.0 as u8);
        buf.write_var(self.offset);
        buf.write_var(self.data.len() as u64);
        buf.put_slice(&self.data);
    }
}

#[derive(Debug, Clone)]
pub struct Stream {
    pub id: StreamId,
    pub offset: u64,
    pub fin: bool,
    pub data: Bytes,
}

impl Stream {
    pub fn encode<B: BufMut>(&self, length: bool, buf: &mut B) {
        let mut ty = 0x08u8;
        if self.offset != 0 {
            ty |= 0x04;
        }
        if length {
            ty |= 0x02;
        }
        if self.fin {
            ty |= 0x01;
        }
        buf.write(ty);
        buf.write(self.id);
        if self.offset != 0 {
            buf.write_var(self.offset);
        }
        if length {
            buf.write_var(self.data.len() as u64);
        }
        buf.put_slice(&self.data);
    }
}

#[derive(Debug, Clone)]
pub struct NewConnectionId {
    pub sequence: u64,
    pub retire_prior_to: u64,
    pub cid: ConnectionId,
    pub reset_token: [u8; RESET_TOKEN_SIZE],
}

impl NewConnectionId {
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.write(Type::NEW_CONNECTION_ID.0 as u8);
        buf.write_var(self.sequence);
        buf.write_var(self.retire_prior_to);
        buf.write(self.cid.len() as u8);
        buf.put_slice(&self.cid);
        buf.put_slice(&self.reset_token);
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionClose {
    pub error_code: TransportError,
    pub frame_type: Option<Type>,
    pub reason: Bytes,
}

impl fmt::Display for ConnectionClose {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.error_code.fmt(f)?;
        if !self.reason.is_empty() {
            write!(f, ": {}", String::from_utf8_lossy(&self.reason))?;
        }
        Ok(())
    }
}

impl ConnectionClose {
    pub fn encode<B: BufMut>(&self, buf: &mut B, max_len: usize) {
        buf.write(Type::CONNECTION_CLOSE.0 as u8);
        buf.write_var(self.error_code.0);
        buf.write_var(self.frame_type.map_or(0, |x| x.0));
        let max_reason = max_len.saturating_sub(1 + 8 + 8 + 8);
        let reason_len = self.reason.len().min(max_reason);
        buf.write_var(reason_len as u64);
        buf.put_slice(&self.reason[..reason_len]);
    }
}

#[derive(Debug, Clone)]
pub struct ApplicationClose {
    pub error_code: u64,
    pub reason: Bytes,
}

impl fmt::Display for ApplicationClose {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.error_code)?;
        if !self.reason.is_empty() {
            write!(f, ": {}", String::from_utf8_lossy(&self.reason))?;
        }
        Ok(())
    }
}

impl ApplicationClose {
    pub fn encode<B: BufMut>(&self, buf: &mut B, max_len: usize) {
        buf.write(Type::APPLICATION_CLOSE.0 as u8);
        buf.write_var(self.error_code);
        let max_reason = max_len.saturating_sub(1 + 8 + 8);
        let reason_len = self.reason.len().min(max_reason);
        buf.write_var(reason_len as u64);
        buf.put_slice(&self.reason[..reason_len]);
    }
}

/// Iterates frames in a decrypted payload, yielding `Frame::Invalid` and
/// stopping at the first malformed frame.
pub struct Iter {
    bytes: Cursor<Bytes>,
    malformed: bool,
}

impl Iter {
    pub fn new(payload: Bytes) -> Self {
        Iter {
            bytes: payload.into_buf(),
            malformed: false,
        }
    }

    fn take_len(&mut self) -> Result<Bytes, UnexpectedEnd> {
        let len = self.bytes.get_var()? as usize;
        if len > self.bytes.remaining() {
            return Err(UnexpectedEnd);
        }
        let start = self.bytes.position() as usize;
        self.bytes.advance(len);
        Ok(self.bytes.get_ref().slice(start, start + len))
    }

    fn take_remaining(&mut self) -> Bytes {
        let start = self.bytes.position() as usize;
        let data = self.bytes.get_ref().slice_from(start);
        let len = data.len();
        self.bytes.advance(len);
        data
    }

    fn try_next(&mut self) -> Result<Frame, UnexpectedEnd> {
        let ty = Type(self.bytes.get_var()?);
        Ok(match ty {
            Type::PADDING => Frame::Padding,
            Type::PING => Frame::Ping,
            Type::ACK => Frame::Ack(Ack::decode(&mut self.bytes, false)?),
            Type::ACK_ECN => Frame::Ack(Ack::decode(&mut self.bytes, true)?),
            Type::RESET_STREAM => Frame::ResetStream {
                id: self.bytes.get()?,
                error_code: self.bytes.get_var()?,
                final_size: self.bytes.get_var()?,
            },
            Type::STOP_SENDING => Frame::StopSending {
                id: self.bytes.get()?,
                error_code: self.bytes.get_var()?,
            },
            Type::CRYPTO => {
                let offset = self.bytes.get_var()?;
                let data = self.take_len()?;
                Frame::Crypto(Crypto { offset, data })
            }
            Type::NEW_TOKEN => {
                let token = self.take_len()?;
                if token.is_empty() {
                    return Err(UnexpectedEnd);
                }
                Frame::NewToken { token }
            }
            Type::MAX_DATA => Frame::MaxData(self.bytes.get_var()?),
            Type::MAX_STREAM_DATA => Frame::MaxStreamData {
                id: self.bytes.get()?,
                offset: self.bytes.get_var()?,
            },
            Type::MAX_STREAMS_BIDI => Frame::MaxStreams {
                directionality: Directionality::Bi,
                count: self.bytes.get_var()?,
            },
            Type::MAX_STREAMS_UNI => Frame::MaxStreams {
                directionality: Directionality::Uni,
                count: self.bytes.get_var()?,
            },
            Type::DATA_BLOCKED => Frame::DataBlocked {
                offset: self.bytes.get_var()?,
            },
            Type::STREAM_DATA_BLOCKED => Frame::StreamDataBlocked {
                id: self.bytes.get()?,
                offset: self.bytes.get_var()?,
            },
            Type::STREAMS_BLOCKED_BIDI => Frame::StreamsBlocked {
                directionality: Directionality::Bi,
                limit: self.bytes.get_var()?,
            },
            Type::STREAMS_BLOCKED_UNI => Frame::StreamsBlocked {
                directionality: Directionality::Uni,
                limit: self.bytes.get_var()?,
            },
            Type::NEW_CONNECTION_ID => {
                let sequence = self.bytes.get_var()?;
                let retire_prior_to = self.bytes.get_var()?;
                if retire_prior_to > sequence {
                    return Err(UnexpectedEnd);
                }
                let len = self.bytes.get::<u8>()? as usize;
                if len == 0 || len > MAX_CID_SIZE || self.bytes.remaining() < len {
                    return Err(UnexpectedEnd);
                }
                let start = self.bytes.position() as usize;
                let cid = ConnectionId::new(&self.bytes.get_ref()[start..start + len]);
                self.bytes.advance(len);
                if self.bytes.remaining() < RESET_TOKEN_SIZE {
                    return Err(UnexpectedEnd);
                }
                let mut reset_token = [0; RESET_TOKEN_SIZE];
                self.bytes.copy_to_slice(&mut reset_token);
                Frame::NewConnectionId(NewConnectionId {
                    sequence,
                    retire_prior_to,
                    cid,
                    reset_token,
                })
            }
            Type::RETIRE_CONNECTION_ID => Frame::RetireConnectionId {
                sequence: self.bytes.get_var()?,
            },
            Type::PATH_CHALLENGE => {
                if self.bytes.remaining() < 8 {
                    return Err(UnexpectedEnd);
                }
                let mut data = [0; 8];
                self.bytes.copy_to_slice(&mut data);
                Frame::PathChallenge(data)
            }
            Type::PATH_RESPONSE => {
                if self.bytes.remaining() < 8 {
                    return Err(UnexpectedEnd);
                }
                let mut data = [0; 8];
                self.bytes.copy_to_slice(&mut data);
                Frame::PathResponse(data)
            }
            Type::CONNECTION_CLOSE => {
                let error_code = TransportError(self.bytes.get_var()?);
                let frame_type = match self.bytes.get_var()? {
                    0 => None,
                    x => Some(Type(x)),
                };
                let reason = self.take_len()?;
                Frame::ConnectionClose(ConnectionClose {
                    error_code,
                    frame_type,
                    reason,
                })
            }
            Type::APPLICATION_CLOSE => {
                let error_code = self.bytes.get_var()?;
                let reason = self.take_len()?;
                Frame::ApplicationClose(ApplicationClose { error_code, reason })
            }
            Type::HANDSHAKE_DONE => Frame::HandshakeDone,
            Type::DATAGRAM => Frame::Datagram {
                data: self.take_remaining(),
            },
            Type::DATAGRAM_LEN => Frame::Datagram {
                data: self.take_len()?,
            },
            Type::ACK_FREQUENCY => Frame::AckFrequency {
                sequence: self.bytes.get_var()?,
                packet_tolerance: self.bytes.get_var()?,
                max_ack_delay: self.bytes.get_var()?,
                ignore_order: self.bytes.get::<u8>()? != 0,
            },
            Type::IMMEDIATE_ACK => Frame::ImmediateAck,
            Type::TIMESTAMP => Frame::Timestamp(self.bytes.get_var()?),
            _ if ty.is_stream() => {
                let id = self.bytes.get()?;
                let offset = if ty.0 & 0x04 != 0 {
                    self.bytes.get_var()?
                } else {
                    0
                };
                let fin = ty.0 & 0x01 != 0;
                let data = if ty.0 & 0x02 != 0 {
                    self.take_len()?
                } else {
                    self.take_remaining()
                };
                Frame::Stream(Stream {
                    id,
                    offset,
                    fin,
                    data,
                })
            }
            _ => {
                return Ok(Frame::Invalid(ty));
            }
        })
    }
}

impl Iterator for Iter {
    type Item = Frame;
    fn next(&mut self) -> Option<Frame> {
        if self.malformed || !self.bytes.has_remaining() {
            return None;
        }
        match self.try_next() {
            Ok(Frame::Invalid(ty)) => {
                self.malformed = true;
                Some(Frame::Invalid(ty))
            }
            Ok(frame) => Some(frame),
            Err(UnexpectedEnd) => {
                self.malformed = true;
                // Can't trust the current type tag once decoding failed
                let _ = mem::replace(&mut self.bytes, Bytes::new().into_buf());
                Some(Frame::Invalid(Type::PADDING))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(payload: Vec<u8>) -> Vec<Frame> {
        Iter::new(payload.into()).collect()
    }

    #[test]
    fn ack_roundtrip() {
        let mut ranges = RangeSet::new();
        ranges.insert(0..3);
        ranges.insert(5..6);
        ranges.insert(8..11);
        let mut buf = Vec::new();
        Ack::encode(42, &ranges, &mut buf);
        let decoded = frames(buf);
        assert_eq!(decoded.len(), 1);
        match decoded[0] {
            Frame::Ack(ref ack) => {
                assert_eq!(ack.largest, 10);
                assert_eq!(ack.delay, 42);
                assert_eq!(ack.ranges, vec![(0, 2), (5, 5), (8, 10)]);
            }
            ref x => panic!("unexpected frame {:?}", x),
        }
    }

    #[test]
    fn stream_roundtrip() {
        let frame = Stream {
            id: StreamId(3),
            offset: 64,
            fin: true,
            data: Bytes::from(&b"hello"[..]),
        };
        let mut buf = Vec::new();
        frame.encode(true, &mut buf);
        buf.push(0x00); // trailing padding
        let decoded = frames(buf);
        assert_eq!(decoded.len(), 2);
        match decoded[0] {
            Frame::Stream(ref x) => {
                assert_eq!(x.id, StreamId(3));
                assert_eq!(x.offset, 64);
                assert!(x.fin);
                assert_eq!(&x.data[..], b"hello");
            }
            ref x => panic!("unexpected frame {:?}", x),
        }
        assert_matches!(decoded[1], Frame::Padding);
    }

    #[test]
    fn new_connection_id_roundtrip() {
        let frame = NewConnectionId {
            sequence: 7,
            retire_prior_to: 2,
            cid: ConnectionId::new(&[0xab; 8]),
            reset_token: [0x11; RESET_TOKEN_SIZE],
        };
        let mut buf = Vec::new();
        frame.encode(&mut buf);
        match frames(buf).pop().unwrap() {
            Frame::NewConnectionId(x) => {
                assert_eq!(x.sequence, 7);
                assert_eq!(x.retire_prior_to, 2);
                assert_eq!(x.cid, ConnectionId::new(&[0xab; 8]));
                assert_eq!(x.reset_token, [0x11; RESET_TOKEN_SIZE]);
            }
            x => panic!("unexpected frame {:?}", x),
        }
    }

    #[test]
    fn malformed_frame_stops_iteration() {
        // RESET_STREAM truncated mid-field
        let decoded = frames(vec![0x04, 0x01]);
        assert_eq!(decoded.len(), 1);
        assert_matches!(decoded[0], Frame::Invalid(_));
    }

    #[test]
    fn retire_prior_to_after_sequence_is_malformed() {
        let frame = NewConnectionId {
            sequence: 1,
            retire_prior_to: 3,
            cid: ConnectionId::new(&[1; 4]),
            reset_token: [0; RESET_TOKEN_SIZE],
        };
        let mut buf = Vec::new();
        frame.encode(&mut buf);
        // encode doesn't validate; decode must
        let mut patched = buf.clone();
        patched[1] = 1; // sequence
        patched[2] = 3; // retire prior to
        assert_matches!(frames(patched)[0], Frame::Invalid(_));
    }

    #[test]
    fn level_acceptance() {
        assert!(Type::CRYPTO.is_allowed(KeyType::Initial));
        assert!(Type::ACK.is_allowed(KeyType::Handshake));
        assert!(!Type::ACK.is_allowed(KeyType::ZeroRtt));
        assert!(!Type::HANDSHAKE_DONE.is_allowed(KeyType::ZeroRtt));
        assert!(Type(0x08).is_allowed(KeyType::ZeroRtt));
        assert!(!Type(0x08).is_allowed(KeyType::Handshake));
        assert!(Type::HANDSHAKE_DONE.is_allowed(KeyType::OneRtt));
        assert!(!Type::NEW_CONNECTION_ID.is_allowed(KeyType::Initial));
    }

    #[test]
    fn probing_classification() {
        assert!(Type::PATH_CHALLENGE.is_probing());
        assert!(Type::NEW_CONNECTION_ID.is_probing());
        assert!(!Type::RETIRE_CONNECTION_ID.is_probing());
        assert!(!Type(0x08).is_probing());
    }
}
