//! Interface to the TLS engine and packet-protection primitives.
//!
//! The connection core never touches cipher internals: it installs and
//! discards opaque key objects per encryption level, feeds CRYPTO stream
//! bytes to a `Session`, and polls the session for newly available keys,
//! negotiated ALPN, and the peer's transport-parameter blob.

use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};

use packet::{ConnectionId, KeyType, SpaceId};
use Side;

#[derive(Debug, Clone, Eq, PartialEq, Fail)]
pub enum TlsError {
    #[fail(display = "TLS alert {} received", _0)]
    Alert(u8),
    #[fail(display = "TLS handshake failed: {}", _0)]
    HandshakeFailed(&'static str),
}

/// Removes header protection. Stateless; one instance per key generation.
pub trait HeaderKey: Send {
    /// Derive the 5-byte mask from a ciphertext sample.
    fn mask(&self, sample: &[u8]) -> [u8; 5];
}

/// AEAD protection for a single direction and key generation.
pub trait PacketKey: Send {
    /// In-place encrypt `buf[header_len..]`, appending the authentication tag.
    fn encrypt(&self, packet_number: u64, buf: &mut Vec<u8>, header_len: usize);
    /// In-place decrypt and authenticate, truncating the tag on success.
    fn decrypt(
        &self,
        packet_number: u64,
        header: &[u8],
        payload: &mut BytesMut,
    ) -> Result<(), ()>;
    fn tag_len(&self) -> usize;
}

pub struct Keys {
    pub header: Box<HeaderKey>,
    pub packet: Box<PacketKey>,
}

pub struct KeyPair {
    pub write: Keys,
    pub read: Keys,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EarlyDataState {
    Unknown,
    Accepted,
    Rejected,
}

/// The TLS handshake engine, driven entirely through this interface.
pub trait Session {
    /// Packet protection for Initial packets, derived from the client's
    /// destination CID. Re-derived after Retry and on version change.
    fn initial_keys(&self, version: u32, dst_cid: &ConnectionId, side: Side) -> KeyPair;
    /// Begin (or, after Retry, restart) the handshake with our encoded
    /// transport parameters installed in the relevant extension.
    fn start_handshake(&mut self, local_tp: &[u8]) -> Result<(), TlsError>;
    /// Consume contiguous peer CRYPTO bytes received at a level.
    fn read_handshake(&mut self, space: SpaceId, data: &[u8]) -> Result<(), TlsError>;
    /// Drain handshake bytes pending transmission at a level.
    fn write_handshake(&mut self, space: SpaceId, buf: &mut Vec<u8>);
    /// Take keys that became available for `level`, at most once per level.
    fn take_keys(&mut self, level: KeyType) -> Option<KeyPair>;
    /// Derive the next 1-RTT key generation for a key update.
    fn next_1rtt_keys(&mut self) -> KeyPair;
    fn is_handshaking(&self) -> bool;
    fn early_data_state(&self) -> EarlyDataState;
    fn alpn_protocol(&self) -> Option<&[u8]>;
    /// The peer's raw transport-parameters extension, once received.
    fn peer_transport_parameters(&self) -> Option<&[u8]>;
    fn peer_certificate(&self) -> Option<Bytes>;
    /// Validate a Retry packet's integrity tag under `version`'s labels.
    fn retry_integrity_valid(
        &self,
        version: u32,
        orig_dst_cid: &ConnectionId,
        packet: &[u8],
    ) -> bool;
    /// Server: wrap an encoded resumption ticket into a NewSessionTicket.
    fn queue_ticket(&mut self, ticket: &[u8]) -> Result<(), TlsError>;
    /// Client: take a session ticket delivered by the server, if any.
    fn take_received_ticket(&mut self) -> Option<Bytes>;
}

/// Reassembles the CRYPTO stream of one packet-number space.
#[derive(Default)]
struct Assembler {
    chunks: BTreeMap<u64, Bytes>,
    offset: u64,
}

impl Assembler {
    fn insert(&mut self, offset: u64, data: Bytes) {
        if offset + data.len() as u64 <= self.offset || data.is_empty() {
            return;
        }
        self.chunks.entry(offset).or_insert(data);
    }

    /// Append newly contiguous bytes to `out`.
    fn read(&mut self, out: &mut Vec<u8>) {
        loop {
            let (start, data) = match self.chunks.iter().next() {
                Some((&start, data)) if start <= self.offset => (start, data.clone()),
                _ => {
                    return;
                }
            };
            self.chunks.remove(&start);
            let end = start + data.len() as u64;
            if end > self.offset {
                let skip = (self.offset - start) as usize;
                out.extend_from_slice(&data[skip..]);
                self.offset = end;
            }
        }
    }

    fn clear(&mut self) {
        self.chunks.clear();
        self.offset = 0;
    }
}

/// Per-connection cryptographic state: the TLS session plus installed key
/// material for every encryption level.
pub struct Crypto {
    pub tls: Box<Session>,
    read_keys: [Option<Keys>; 4],
    write_keys: [Option<Keys>; 4],
    /// Previous-generation 1-RTT read keys, kept for reordered packets
    prev_1rtt_read: Option<Keys>,
    /// Speculatively derived next generation, not yet current
    next_1rtt: Option<KeyPair>,
    /// Highest level with an installed read key
    pub read_level: Option<KeyType>,
    assemblers: [Assembler; 3],
    /// Server app is still deciding whether to accept a resumption ticket
    pub ticket_validation_pending: bool,
    /// Server app rejected the ticket before TLS asked for a verdict
    pub ticket_validation_rejecting: bool,
}

impl Crypto {
    pub fn new(tls: Box<Session>) -> Self {
        Crypto {
            tls,
            read_keys: [None, None, None, None],
            write_keys: [None, None, None, None],
            prev_1rtt_read: None,
            next_1rtt: None,
            read_level: None,
            assemblers: [
                Assembler::default(),
                Assembler::default(),
                Assembler::default(),
            ],
            ticket_validation_pending: false,
            ticket_validation_rejecting: false,
        }
    }

    /// Install Initial keys for the given version and destination CID.
    pub fn initialize(&mut self, version: u32, dst_cid: &ConnectionId, side: Side) {
        let pair = self.tls.initial_keys(version, dst_cid, side);
        self.install(KeyType::Initial, pair);
    }

    /// Tear down all transient handshake state for a connection restart
    /// (Retry or version negotiation), then re-derive Initial keys.
    pub fn reset(&mut self, version: u32, dst_cid: &ConnectionId, side: Side) {
        for keys in &mut self.read_keys {
            *keys = None;
        }
        for keys in &mut self.write_keys {
            *keys = None;
        }
        self.prev_1rtt_read = None;
        self.next_1rtt = None;
        self.read_level = None;
        for assembler in &mut self.assemblers {
            assembler.clear();
        }
        self.initialize(version, dst_cid, side);
    }

    /// Re-derive Initial keys after a compatible version change.
    pub fn on_version_change(&mut self, version: u32, dst_cid: &ConnectionId, side: Side) {
        let pair = self.tls.initial_keys(version, dst_cid, side);
        self.install(KeyType::Initial, pair);
    }

    fn install(&mut self, level: KeyType, pair: KeyPair) {
        self.write_keys[level as usize] = Some(pair.write);
        self.read_keys[level as usize] = Some(pair.read);
        if self.read_level.map_or(true, |x| level > x) {
            self.read_level = Some(level);
        }
    }

    /// Feed one CRYPTO frame into the space's reassembler and run the TLS
    /// machine over any newly contiguous bytes, installing new keys.
    pub fn process_frame(
        &mut self,
        space: SpaceId,
        offset: u64,
        data: Bytes,
    ) -> Result<(), TlsError> {
        self.assemblers[space as usize].insert(offset, data);
        let mut contiguous = Vec::new();
        self.assemblers[space as usize].read(&mut contiguous);
        if !contiguous.is_empty() {
            self.tls.read_handshake(space, &contiguous)?;
        }
        self.poll_keys();
        Ok(())
    }

    /// Install any keys the session has produced since the last poll.
    pub fn poll_keys(&mut self) {
        for &level in &[KeyType::ZeroRtt, KeyType::Handshake, KeyType::OneRtt] {
            if self.read_keys[level as usize].is_none() {
                if let Some(pair) = self.tls.take_keys(level) {
                    self.install(level, pair);
                }
            }
        }
    }

    /// Server-side ticket transmission (spec: ProcessAppData).
    pub fn process_app_data(&mut self, ticket: &[u8]) -> Result<(), TlsError> {
        self.tls.queue_ticket(ticket)
    }

    pub fn read_keys(&self, level: KeyType) -> Option<&Keys> {
        self.read_keys[level as usize].as_ref()
    }

    pub fn write_keys(&self, level: KeyType) -> Option<&Keys> {
        self.write_keys[level as usize].as_ref()
    }

    pub fn prev_1rtt_read(&self) -> Option<&Keys> {
        self.prev_1rtt_read.as_ref()
    }

    /// Speculatively derive the next key generation if not already staged,
    /// returning its read keys for a trial decrypt.
    pub fn generate_new_keys(&mut self) -> &Keys {
        if self.next_1rtt.is_none() {
            self.next_1rtt = Some(self.tls.next_1rtt_keys());
        }
        &self.next_1rtt.as_ref().unwrap().read
    }

    pub fn has_staged_keys(&self) -> bool {
        self.next_1rtt.is_some()
    }

    /// Commit the staged key generation as current. The outgoing generation's
    /// read keys are retained until the peer is known to have moved on.
    pub fn update_key_phase(&mut self) {
        let pair = self
            .next_1rtt
            .take()
            .expect("key phase update without staged keys");
        self.prev_1rtt_read = self.read_keys[KeyType::OneRtt as usize].take();
        self.install(KeyType::OneRtt, pair);
    }

    pub fn discard_keys(&mut self, level: KeyType) {
        self.read_keys[level as usize] = None;
        self.write_keys[level as usize] = None;
        if level == KeyType::OneRtt {
            self.prev_1rtt_read = None;
            self.next_1rtt = None;
        }
    }
}

/// Deterministic stand-in crypto for exercising the connection machinery
/// without a real TLS stack.
#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::VecDeque;

    /// Header protection that leaves headers in the clear.
    pub struct NullHeaderKey;

    impl HeaderKey for NullHeaderKey {
        fn mask(&self, _: &[u8]) -> [u8; 5] {
            [0; 5]
        }
    }

    pub const TAG_LEN: usize = 16;

    /// "AEAD" that authenticates with a constant per-level tag and leaves
    /// plaintext untouched, so tests can build packets by hand.
    pub struct TagKey(pub u8);

    impl PacketKey for TagKey {
        fn encrypt(&self, _: u64, buf: &mut Vec<u8>, _: usize) {
            buf.extend_from_slice(&[self.0; TAG_LEN]);
        }
        fn decrypt(&self, _: u64, _: &[u8], payload: &mut BytesMut) -> Result<(), ()> {
            if payload.len() < TAG_LEN {
                return Err(());
            }
            let split = payload.len() - TAG_LEN;
            if payload[split..] != [self.0; TAG_LEN][..] {
                return Err(());
            }
            payload.truncate(split);
            Ok(())
        }
        fn tag_len(&self) -> usize {
            TAG_LEN
        }
    }

    pub fn keys(tag: u8) -> KeyPair {
        KeyPair {
            write: Keys {
                header: Box::new(NullHeaderKey),
                packet: Box::new(TagKey(tag)),
            },
            read: Keys {
                header: Box::new(NullHeaderKey),
                packet: Box::new(TagKey(tag)),
            },
        }
    }

    /// Per-level tags so tests can distinguish key generations.
    pub const INITIAL_TAG: u8 = 0x10;
    pub const ZERO_RTT_TAG: u8 = 0x20;
    pub const HANDSHAKE_TAG: u8 = 0x30;
    pub const ONE_RTT_TAG: u8 = 0x40;

    /// Scriptable fake session. Tests push key levels and state transitions.
    pub struct FakeSession {
        pub side: Side,
        pub handshaking: bool,
        pub early_data: EarlyDataState,
        pub alpn: Option<Vec<u8>>,
        pub peer_params: Option<Vec<u8>>,
        pub local_params: Option<Vec<u8>>,
        /// Installed as `peer_params` once handshake bytes arrive
        pub pending_peer_params: Option<Vec<u8>>,
        /// Leave the handshaking state after the first read
        pub complete_after_read: bool,
        pub available_keys: VecDeque<(KeyType, u8)>,
        pub outbound: Vec<(SpaceId, Vec<u8>)>,
        pub received: Vec<(SpaceId, Vec<u8>)>,
        pub queued_tickets: Vec<Vec<u8>>,
        pub inbound_ticket: Option<Bytes>,
        pub retry_valid: bool,
        next_generation: u8,
    }

    impl FakeSession {
        pub fn new(side: Side) -> Self {
            FakeSession {
                side,
                handshaking: true,
                early_data: EarlyDataState::Unknown,
                alpn: Some(b"h3".to_vec()),
                peer_params: None,
                local_params: None,
                pending_peer_params: None,
                complete_after_read: false,
                available_keys: VecDeque::new(),
                outbound: Vec::new(),
                received: Vec::new(),
                queued_tickets: Vec::new(),
                inbound_ticket: None,
                retry_valid: true,
                next_generation: ONE_RTT_TAG,
            }
        }

        pub fn stage_keys(&mut self, level: KeyType) {
            let tag = match level {
                KeyType::Initial => INITIAL_TAG,
                KeyType::ZeroRtt => ZERO_RTT_TAG,
                KeyType::Handshake => HANDSHAKE_TAG,
                KeyType::OneRtt => ONE_RTT_TAG,
            };
            self.available_keys.push_back((level, tag));
        }
    }

    impl Session for FakeSession {
        fn initial_keys(&self, _: u32, _: &ConnectionId, _: Side) -> KeyPair {
            keys(INITIAL_TAG)
        }
        fn start_handshake(&mut self, local_tp: &[u8]) -> Result<(), TlsError> {
            self.local_params = Some(local_tp.to_vec());
            self.outbound
                .push((SpaceId::Initial, b"client-hello".to_vec()));
            Ok(())
        }
        fn read_handshake(&mut self, space: SpaceId, data: &[u8]) -> Result<(), TlsError> {
            self.received.push((space, data.to_vec()));
            if let Some(params) = self.pending_peer_params.take() {
                self.peer_params = Some(params);
            }
            if self.complete_after_read {
                self.handshaking = false;
            }
            Ok(())
        }
        fn write_handshake(&mut self, space: SpaceId, buf: &mut Vec<u8>) {
            let mut rest = Vec::new();
            for (s, data) in self.outbound.drain(..) {
                if s == space {
                    buf.extend_from_slice(&data);
                } else {
                    rest.push((s, data));
                }
            }
            self.outbound = rest;
        }
        fn take_keys(&mut self, level: KeyType) -> Option<KeyPair> {
            if self.available_keys.front().map(|x| x.0) == Some(level) {
                let (_, tag) = self.available_keys.pop_front().unwrap();
                Some(keys(tag))
            } else {
                None
            }
        }
        fn next_1rtt_keys(&mut self) -> KeyPair {
            self.next_generation = self.next_generation.wrapping_add(1);
            keys(self.next_generation)
        }
        fn is_handshaking(&self) -> bool {
            self.handshaking
        }
        fn early_data_state(&self) -> EarlyDataState {
            self.early_data
        }
        fn alpn_protocol(&self) -> Option<&[u8]> {
            self.alpn.as_ref().map(|x| &x[..])
        }
        fn peer_transport_parameters(&self) -> Option<&[u8]> {
            self.peer_params.as_ref().map(|x| &x[..])
        }
        fn peer_certificate(&self) -> Option<Bytes> {
            None
        }
        fn retry_integrity_valid(&self, _: u32, _: &ConnectionId, _: &[u8]) -> bool {
            self.retry_valid
        }
        fn queue_ticket(&mut self, ticket: &[u8]) -> Result<(), TlsError> {
            self.queued_tickets.push(ticket.to_vec());
            Ok(())
        }
        fn take_received_ticket(&mut self) -> Option<Bytes> {
            self.inbound_ticket.take()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn assembler_handles_reordering() {
        let mut assembler = Assembler::default();
        assembler.insert(4, Bytes::from(&b"efgh"[..]));
        let mut out = Vec::new();
        assembler.read(&mut out);
        assert!(out.is_empty());
        assembler.insert(0, Bytes::from(&b"abcd"[..]));
        assembler.read(&mut out);
        assert_eq!(&out[..], b"abcdefgh");
    }

    #[test]
    fn assembler_discards_stale_overlap() {
        let mut assembler = Assembler::default();
        assembler.insert(0, Bytes::from(&b"abcd"[..]));
        let mut out = Vec::new();
        assembler.read(&mut out);
        assembler.insert(2, Bytes::from(&b"cdef"[..]));
        assembler.read(&mut out);
        assert_eq!(&out[..], b"abcdef");
    }

    #[test]
    fn keys_install_in_level_order() {
        let mut session = FakeSession::new(Side::Client);
        session.stage_keys(KeyType::Handshake);
        let mut crypto = Crypto::new(Box::new(session));
        crypto.initialize(::VERSION_1, &ConnectionId::new(&[1; 8]), Side::Client);
        assert_eq!(crypto.read_level, Some(KeyType::Initial));
        crypto
            .process_frame(SpaceId::Initial, 0, Bytes::from(&b"sh"[..]))
            .unwrap();
        assert_eq!(crypto.read_level, Some(KeyType::Handshake));
        assert!(crypto.read_keys(KeyType::Handshake).is_some());
        assert!(crypto.read_keys(KeyType::OneRtt).is_none());
    }

    #[test]
    fn key_phase_update_retains_previous_generation() {
        let mut session = FakeSession::new(Side::Client);
        session.stage_keys(KeyType::OneRtt);
        let mut crypto = Crypto::new(Box::new(session));
        crypto.initialize(::VERSION_1, &ConnectionId::new(&[1; 8]), Side::Client);
        crypto.poll_keys();
        assert!(crypto.read_keys(KeyType::OneRtt).is_some());
        crypto.generate_new_keys();
        assert!(crypto.has_staged_keys());
        crypto.update_key_phase();
        assert!(crypto.prev_1rtt_read().is_some());
        assert!(!crypto.has_staged_keys());
    }

    #[test]
    fn discard_initial_keys() {
        let mut crypto = Crypto::new(Box::new(FakeSession::new(Side::Server)));
        crypto.initialize(::VERSION_1, &ConnectionId::new(&[2; 8]), Side::Server);
        assert!(crypto.read_keys(KeyType::Initial).is_some());
        crypto.discard_keys(KeyType::Initial);
        assert!(crypto.read_keys(KeyType::Initial).is_none());
        assert!(crypto.write_keys(KeyType::Initial).is_none());
    }
}
