//! The binding/routing seam: owns the connection table, routes received
//! datagrams to connections by destination CID, and hands the backend its
//! pending I/O directives (transmissions and timer-wheel updates).
//!
//! This object performs no I/O itself. The embedding delivers datagrams via
//! `handle`, fires timers via `timeout`, drives scheduled connections via
//! `drive`, and executes whatever `poll_io` yields.

use std::collections::VecDeque;
use std::net::SocketAddrV6;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use fnv::{FnvHashMap, FnvHashSet};
use rand::{rngs::OsRng, RngCore};
use slab::Slab;
use slog::Logger;

use congestion::NewRenoConfig;
use connection::{Configuration, Connection, ConnectionError, ConnectionHandle};
use crypto::Session;
use packet::{ConnectionId, Header, PacketDecodeError, PartialDecode};
use {Directionality, Side, Status, MIN_INITIAL_SIZE, SUPPORTED_VERSIONS};

/// Parameters governing every connection sharing this endpoint.
pub struct Config {
    /// Length of locally issued CIDs; constrains how many simultaneous
    /// connections can share a binding.
    pub local_cid_len: usize,
    /// Post-handshake idle timeout (ms). The effective value is the lesser
    /// of this and the peer's. 0 for none.
    pub idle_timeout_ms: u64,
    /// Idle timeout while the handshake is still in progress (ms).
    pub handshake_idle_timeout_ms: u64,
    /// Non-zero keeps connections alive with periodic PINGs (ms).
    pub keep_alive_interval_ms: u64,
    /// Operations a connection may execute per drain before yielding to
    /// other connections on its worker.
    pub max_operations_per_drain: usize,
    /// Maximum number of peer-initiated bidirectional streams at one time.
    pub max_remote_bi_streams: u64,
    /// Maximum number of peer-initiated unidirectional streams at one time.
    pub max_remote_uni_streams: u64,
    /// Bytes the peer may send on one stream before becoming blocked.
    pub stream_receive_window: u64,
    /// Bytes the peer may send across all streams before becoming blocked.
    pub receive_window: u64,
    /// Maximum number of incoming connections to buffer.
    pub accept_buffer: u32,
    /// Smallest ack delay we are prepared to request via ACK_FREQUENCY
    /// (μs); 0 disables the extension.
    pub min_ack_delay_us: u64,
    /// Offer the timestamp extension for one-way delay estimation.
    pub enable_timestamps: bool,
    pub grease_quic_bit: bool,
    pub reliable_reset: bool,
    pub congestion: NewRenoConfig,
}

impl Default for Config {
    fn default() -> Self {
        const EXPECTED_RTT: u64 = 100; // ms
        const MAX_STREAM_BANDWIDTH: u64 = 12500 * 1000; // bytes/s
                                                        // Window size needed to avoid pipeline
                                                        // stalls
        const STREAM_RWND: u64 = MAX_STREAM_BANDWIDTH / 1000 * EXPECTED_RTT;
        Config {
            local_cid_len: 8,
            idle_timeout_ms: 30_000,
            handshake_idle_timeout_ms: 10_000,
            keep_alive_interval_ms: 0,
            max_operations_per_drain: 16,
            max_remote_bi_streams: 100,
            max_remote_uni_streams: 3,
            stream_receive_window: STREAM_RWND,
            receive_window: 8 * STREAM_RWND,
            accept_buffer: 1024,
            min_ack_delay_us: 1_000,
            enable_timestamps: false,
            grease_quic_bit: false,
            reliable_reset: false,
            congestion: NewRenoConfig::default(),
        }
    }
}

/// State shared between the endpoint and its connections while draining.
pub struct Context {
    pub rng: OsRng,
    pub config: Arc<Config>,
    pub io: VecDeque<Io>,
    pub events: VecDeque<(ConnectionHandle, Event)>,
    pub incoming: VecDeque<ConnectionHandle>,
    pub incoming_handshakes: usize,
    /// Connections with queued operations awaiting a drain
    pub dirty_conns: FnvHashSet<ConnectionHandle>,
    /// Source-CID routing table shared with the binding
    pub connection_ids: FnvHashMap<ConnectionId, ConnectionHandle>,
}

/// Creates the TLS engine for each new connection.
pub trait SessionFactory {
    fn new_session(&mut self, side: Side) -> Box<Session>;
}

/// Events indicated to the application.
#[derive(Debug)]
pub enum Event {
    /// The handshake completed and the connection is usable.
    Connected { alpn: Option<Vec<u8>> },
    /// The peer's application closed the connection.
    ShutdownInitiatedByPeer { error_code: u64 },
    /// The transport closed the connection, locally or by peer action.
    ShutdownInitiatedByTransport { status: Status, error_code: u64 },
    /// Both directions are closed; the handle may be released.
    ShutdownComplete {
        handshake_completed: bool,
        peer_acknowledged_shutdown: bool,
        app_close_in_progress: bool,
    },
    /// Server only: a client presented a valid resumption ticket.
    Resumed { app_data: Bytes },
    /// Client only: a ticket arrived that the app may store for resumption.
    ResumptionTicketReceived { ticket: Box<[u8]> },
    PeerCertificateReceived { cert: Bytes },
    /// The peer migrated to a new address.
    PeerAddressChanged { address: SocketAddrV6 },
    /// The peer wants more streams than we currently allow.
    PeerNeedsStreams { directionality: Directionality },
    ReliableResetNegotiated { enabled: bool },
    OneWayDelayNegotiated {
        send_enabled: bool,
        recv_enabled: bool,
    },
}

/// I/O directives for the backend to execute.
#[derive(Debug)]
pub enum Io {
    Transmit {
        destination: SocketAddrV6,
        packet: Box<[u8]>,
    },
    /// (Re)register this connection's single timer-wheel entry; `None`
    /// deregisters it.
    TimerUpdate {
        connection: ConnectionHandle,
        /// Absolute μs
        time: Option<u64>,
    },
}

pub struct Endpoint {
    log: Logger,
    pub ctx: Context,
    sessions: Box<SessionFactory>,
    /// Routes the client's original destination CID to the server-side
    /// connection until the handshake settles real CIDs
    connection_ids_initial: FnvHashMap<ConnectionId, ConnectionHandle>,
    connection_remotes: FnvHashMap<SocketAddrV6, ConnectionHandle>,
    pub connections: Slab<Connection>,
    listen: bool,
}

impl Endpoint {
    pub fn new(log: Logger, config: Config, sessions: Box<SessionFactory>, listen: bool) -> Self {
        let config = Arc::new(config);
        debug_assert!(config.local_cid_len <= ::MAX_CID_SIZE);
        Endpoint {
            log,
            ctx: Context {
                rng: OsRng::new().expect("system RNG unavailable"),
                config,
                io: VecDeque::new(),
                events: VecDeque::new(),
                incoming: VecDeque::new(),
                incoming_handshakes: 0,
                dirty_conns: FnvHashSet::default(),
                connection_ids: FnvHashMap::default(),
            },
            sessions,
            connection_ids_initial: FnvHashMap::default(),
            connection_remotes: FnvHashMap::default(),
            connections: Slab::new(),
            listen,
        }
    }

    /// Get an application-facing event.
    pub fn poll(&mut self) -> Option<(ConnectionHandle, Event)> {
        self.ctx.events.pop_front()
    }

    /// Get a pending I/O directive.
    pub fn poll_io(&mut self) -> Option<Io> {
        self.ctx.io.pop_front()
    }

    /// Drain operations for every scheduled connection. A connection that
    /// still has work after its drain quantum stays scheduled.
    pub fn drive(&mut self, now: u64) {
        loop {
            let handle = match self.ctx.dirty_conns.iter().next() {
                Some(&x) => x,
                None => break,
            };
            let has_more = self.connections[handle.0].drain_operations(&mut self.ctx, now);
            if !has_more {
                self.ctx.dirty_conns.remove(&handle);
            }
            if !has_more && self.ctx.dirty_conns.is_empty() {
                break;
            }
        }
    }

    /// Process an incoming UDP datagram.
    pub fn handle(&mut self, now: u64, remote: SocketAddrV6, data: BytesMut) {
        let datagram_len = data.len();
        let (pd, _) = match PartialDecode::new(data.clone(), self.ctx.config.local_cid_len) {
            Ok(x) => x,
            Err(PacketDecodeError::UnsupportedVersion {
                source,
                destination,
                ..
            }) => {
                if !self.listen {
                    debug!(self.log, "dropping packet with unsupported version");
                    return;
                }
                trace!(self.log, "sending version negotiation");
                let mut buf = Vec::new();
                Header::VersionNegotiate {
                    random: self.ctx.rng.next_u32() as u8 & 0x7f,
                    src_cid: destination,
                    dst_cid: source,
                }
                .encode(&mut buf);
                use coding::BufMutExt;
                buf.write::<u32>(0x0a1a_2a3a); // reserved version to exercise negotiation
                for &version in &SUPPORTED_VERSIONS {
                    buf.write::<u32>(version);
                }
                self.ctx.io.push_back(Io::Transmit {
                    destination: remote,
                    packet: buf.into_boxed_slice(),
                });
                return;
            }
            Err(e) => {
                trace!(self.log, "unable to decode invariant header"; "reason" => %e);
                return;
            }
        };

        //
        // Route to an existing connection, if any
        //

        let dst_cid = pd.dst_cid();
        let known = {
            let by_cid = if self.ctx.config.local_cid_len > 0 {
                self.ctx.connection_ids.get(&dst_cid)
            } else {
                None
            };
            by_cid
                .or_else(|| self.connection_ids_initial.get(&dst_cid))
                .or_else(|| self.connection_remotes.get(&remote))
                .cloned()
        };
        if let Some(handle) = known {
            if self.connections[handle.0].queue_recv_packet(remote, data) {
                self.ctx.dirty_conns.insert(handle);
            }
            return;
        }

        //
        // Potentially create a new server-side connection
        //

        if !self.listen {
            debug!(self.log, "dropping packet for unrecognized connection";
                   "cid" => %dst_cid);
            return;
        }
        if !pd.is_initial() {
            debug!(self.log, "ignoring non-initial packet for unknown connection";
                   "cid" => %dst_cid);
            return;
        }
        if datagram_len < MIN_INITIAL_SIZE {
            debug!(self.log, "ignoring short initial"; "cid" => %dst_cid);
            return;
        }
        if self.ctx.incoming.len() + self.ctx.incoming_handshakes
            >= self.ctx.config.accept_buffer as usize
        {
            debug!(self.log, "rejecting connection due to full accept buffer");
            return;
        }

        let handle = match self.add_connection(now, remote, dst_cid, pd.src_cid(), pd.version()) {
            Some(x) => x,
            None => {
                return;
            }
        };
        self.connection_ids_initial.insert(dst_cid, handle);
        self.ctx.incoming_handshakes += 1;
        if self.connections[handle.0].queue_recv_packet(remote, data) {
            self.ctx.dirty_conns.insert(handle);
        }
    }

    /// Initiate an outgoing connection.
    pub fn connect(
        &mut self,
        now: u64,
        remote: SocketAddrV6,
        configuration: Arc<Configuration>,
        server_name: &str,
    ) -> Result<ConnectionHandle, ConnectionError> {
        let local_cid = self.new_cid();
        let rem_cid = ConnectionId::random(&mut self.ctx.rng, ::MAX_CID_SIZE);
        trace!(self.log, "initial dcid"; "value" => %rem_cid);
        let tls = self.sessions.new_session(Side::Client);
        let entry = self.connections.vacant_entry();
        let handle = ConnectionHandle(entry.key());
        self.ctx.connection_ids.insert(local_cid, handle);
        let mut conn = Connection::new(
            self.log.new(o!("connection" => local_cid)),
            &mut self.ctx,
            handle,
            Side::Client,
            remote,
            rem_cid,
            local_cid,
            rem_cid,
            tls,
            SUPPORTED_VERSIONS[0],
            now,
        );
        conn.start(&mut self.ctx, now, configuration, server_name)?;
        entry.insert(conn);
        self.connection_remotes.insert(remote, handle);
        self.ctx.dirty_conns.insert(handle);
        Ok(handle)
    }

    fn new_cid(&mut self) -> ConnectionId {
        loop {
            let cid = ConnectionId::random(&mut self.ctx.rng, self.ctx.config.local_cid_len);
            if !self.ctx.connection_ids.contains_key(&cid) {
                break cid;
            }
            debug_assert!(self.ctx.config.local_cid_len > 0);
        }
    }

    fn add_connection(
        &mut self,
        now: u64,
        remote: SocketAddrV6,
        init_dst_cid: ConnectionId,
        rem_cid: ConnectionId,
        version: u32,
    ) -> Option<ConnectionHandle> {
        let local_cid = self.new_cid();
        let tls = self.sessions.new_session(Side::Server);
        let entry = self.connections.vacant_entry();
        let handle = ConnectionHandle(entry.key());
        self.ctx.connection_ids.insert(local_cid, handle);
        let conn = Connection::new(
            self.log.new(o!("connection" => local_cid)),
            &mut self.ctx,
            handle,
            Side::Server,
            remote,
            init_dst_cid,
            local_cid,
            rem_cid,
            tls,
            version,
            now,
        );
        entry.insert(conn);
        self.connection_remotes.insert(remote, handle);
        Some(handle)
    }

    /// Bind a server-side connection to its configuration after accept.
    pub fn set_configuration(
        &mut self,
        now: u64,
        handle: ConnectionHandle,
        configuration: Arc<Configuration>,
    ) -> Result<(), ConnectionError> {
        let conn = &mut self.connections[handle.0];
        conn.set_configuration(&mut self.ctx, now, configuration)?;
        self.ctx.dirty_conns.insert(handle);
        Ok(())
    }

    /// Handle this connection's timer-wheel entry firing.
    pub fn timeout(&mut self, now: u64, handle: ConnectionHandle) {
        if self.connections[handle.0].on_timer_wheel_fire(&mut self.ctx, now) {
            self.ctx.dirty_conns.insert(handle);
        }
    }

    /// Initiate an application shutdown of a connection.
    pub fn shutdown(&mut self, handle: ConnectionHandle, flags: u32, error_code: u64) {
        if self.connections[handle.0].shutdown(flags, error_code) {
            self.ctx.dirty_conns.insert(handle);
        }
    }

    /// Accept an incoming connection whose handshake has completed.
    pub fn accept(&mut self) -> Option<ConnectionHandle> {
        self.ctx.incoming.pop_front()
    }

    pub fn connection(&self, handle: ConnectionHandle) -> &Connection {
        &self.connections[handle.0]
    }

    pub fn connection_mut(&mut self, handle: ConnectionHandle) -> &mut Connection {
        &mut self.connections[handle.0]
    }

    /// The application is done with its handle; free the connection once
    /// it has fully shut down.
    pub fn close_handle(&mut self, handle: ConnectionHandle) {
        if self.connections[handle.0].close_handle() {
            self.forget(handle);
        }
    }

    fn forget(&mut self, handle: ConnectionHandle) {
        {
            let conn = &self.connections[handle.0];
            for source_cid in conn.source_cids.iter() {
                self.ctx.connection_ids.remove(&source_cid.cid);
            }
            self.connection_ids_initial.remove(&conn.orig_dst_cid);
            if let Some(path) = conn.paths.first() {
                self.connection_remotes.remove(&path.remote);
            }
        }
        self.ctx.io.push_back(Io::TimerUpdate {
            connection: handle,
            time: None,
        });
        self.ctx.dirty_conns.remove(&handle);
        self.connections.remove(handle.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crypto::testing::FakeSession;
    use packet::PacketNumber;
    use std::net::Ipv6Addr;

    struct Factory;

    impl SessionFactory for Factory {
        fn new_session(&mut self, side: Side) -> Box<Session> {
            Box::new(FakeSession::new(side))
        }
    }

    fn logger() -> Logger {
        Logger::root(::slog::Discard, o!())
    }

    fn endpoint(listen: bool) -> Endpoint {
        Endpoint::new(logger(), Config::default(), Box::new(Factory), listen)
    }

    fn addr(port: u16) -> SocketAddrV6 {
        SocketAddrV6::new(Ipv6Addr::LOCALHOST, port, 0, 0)
    }

    #[test]
    fn connect_registers_local_cid() {
        let mut endpoint = endpoint(false);
        let configuration = Arc::new(Configuration {
            alpn: vec![b"h3".to_vec()],
            resumption_enabled: false,
        });
        let handle = endpoint
            .connect(0, addr(4433), configuration, "example.com")
            .unwrap();
        assert_eq!(endpoint.ctx.connection_ids.len(), 1);
        assert!(endpoint.ctx.dirty_conns.contains(&handle));
        endpoint.drive(0);
        // The client's first flight went out
        assert!(endpoint.poll_io().is_some());
    }

    #[test]
    fn unknown_version_triggers_version_negotiation() {
        let mut endpoint = endpoint(true);
        let mut packet = vec![0xc0];
        packet.extend_from_slice(&[0x0b, 0xad, 0xf0, 0x0d]); // unknown version
        packet.push(8);
        packet.extend_from_slice(&[0xaa; 8]); // dst cid
        packet.push(8);
        packet.extend_from_slice(&[0xbb; 8]); // src cid
        packet.resize(1200, 0);
        endpoint.handle(0, addr(9999), BytesMut::from(&packet[..]));
        match endpoint.poll_io() {
            Some(Io::Transmit { packet, .. }) => {
                // Version negotiation: long header, version zero
                assert_eq!(packet[0] & 0x80, 0x80);
                assert_eq!(&packet[1..5], &[0, 0, 0, 0]);
            }
            x => panic!("expected version negotiation, got {:?}", x),
        }
    }

    #[test]
    fn version_negotiation_not_sent_when_not_listening() {
        let mut endpoint = endpoint(false);
        let mut packet = vec![0xc0];
        packet.extend_from_slice(&[0x0b, 0xad, 0xf0, 0x0d]);
        packet.push(0);
        packet.push(0);
        packet.resize(1200, 0);
        endpoint.handle(0, addr(9999), BytesMut::from(&packet[..]));
        assert!(endpoint.poll_io().is_none());
    }

    #[test]
    fn initial_for_unknown_cid_creates_server_connection() {
        let mut endpoint = endpoint(true);
        let header = Header::Initial {
            version: ::VERSION_1,
            src_cid: ConnectionId::new(&[0xcc; 8]),
            dst_cid: ConnectionId::new(&[0xdd; 8]),
            token: Bytes::new(),
            number: PacketNumber::U8(0),
        };
        let mut buf = Vec::new();
        header.encode(&mut buf);
        buf.resize(1200, 0);
        endpoint.handle(0, addr(1111), BytesMut::from(&buf[..]));
        assert_eq!(endpoint.connections.len(), 1);
        assert_eq!(endpoint.ctx.incoming_handshakes, 1);
        let (&cid, &handle) = endpoint.connection_ids_initial.iter().next().unwrap();
        assert_eq!(cid, ConnectionId::new(&[0xdd; 8]));
        assert_eq!(endpoint.connection(handle).side, Side::Server);
    }

    #[test]
    fn short_initial_ignored() {
        let mut endpoint = endpoint(true);
        let header = Header::Initial {
            version: ::VERSION_1,
            src_cid: ConnectionId::new(&[0xcc; 8]),
            dst_cid: ConnectionId::new(&[0xdd; 8]),
            token: Bytes::new(),
            number: PacketNumber::U8(0),
        };
        let mut buf = Vec::new();
        header.encode(&mut buf);
        buf.resize(100, 0); // far below the 1200-byte Initial floor
        endpoint.handle(0, addr(1111), BytesMut::from(&buf[..]));
        assert!(endpoint.connections.is_empty());
    }

    #[test]
    fn close_handle_frees_connection_and_routes() {
        let mut endpoint = endpoint(false);
        let configuration = Arc::new(Configuration {
            alpn: vec![b"h3".to_vec()],
            resumption_enabled: false,
        });
        let handle = endpoint
            .connect(0, addr(4433), configuration, "example.com")
            .unwrap();
        endpoint.drive(0);
        endpoint.close_handle(handle);
        assert!(endpoint.connections.is_empty());
        assert!(endpoint.ctx.connection_ids.is_empty());
    }
}
