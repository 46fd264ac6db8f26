//! The per-connection core: all state and logic for a single QUIC
//! connection from handshake to termination.
//!
//! A connection is driven exclusively through its operation queue. I/O
//! threads append received datagrams to the receive queue and enqueue a
//! FlushRecv operation; the owning worker calls `drain_operations`, which
//! executes everything else — the receive pipeline, send signaling, timers,
//! and API calls — on one thread at a time.

use std::collections::VecDeque;
use std::net::SocketAddrV6;
use std::sync::Arc;
use std::{cmp, fmt};

use bytes::{Bytes, BytesMut};
use constant_time_eq::constant_time_eq;
use rand::RngCore;
use slog::Logger;

use cid::{DestCid, DestCidList, SourceCidList};
use coding::BufMutExt;
use congestion::{Controller, NewReno};
use crypto::{Crypto, EarlyDataState, Keys, Session, TlsError};
use endpoint::{Context, Event, Io};
use frame::{self, Frame, Type};
use loss_detection::SentPacket;
use operation::{ApiCall, OperQueue, Operation};
use packet::{
    ConnectionId, Header, KeyType, LongType, Packet, PacketNumber, PartialDecode, SpaceId,
};
use path::Path;
use range_set::RangeSet;
use send::{flags, Retransmits, Send};
use streams::StreamSet;
use ticket;
use timer::{TimerTable, TimerType};
use transport_parameters::{TransportParameters, VersionInfo};
use {
    are_versions_compatible, is_reserved_version, is_supported_version, Side, Status,
    TransportError, ACTIVE_CONNECTION_ID_LIMIT, AEAD_INTEGRITY_LIMIT, CID_MAX_COLLISION_RETRY,
    CLOSE_PTO_COUNT, LIBRARY, MAX_CRYPTO_BATCH_COUNT, MAX_DEFERRED_PACKETS, MAX_PATH_COUNT,
    MAX_RECEIVE_FLUSH_COUNT, MIN_INITIAL_SIZE, MIN_STATELESS_RESET_SIZE, RESET_TOKEN_SIZE,
    SUPPORTED_VERSIONS, VAR_INT_MAX,
};

/// Received datagrams parked while the operation queue catches up.
const MAX_RECEIVE_QUEUE_COUNT: usize = 180;
/// Ack ranges tracked per space; older ranges age out first.
const MAX_ACK_RANGES: usize = 64;
/// Longest close reason phrase retained or forwarded.
const MAX_CLOSE_REASON_LENGTH: usize = 512;
/// Ack-eliciting packets tolerated before an ack must be sent.
const DEFAULT_PACKET_TOLERANCE: u64 = 2;

pub mod close_flags {
    /// The close was initiated by the peer.
    pub const REMOTE: u32 = 1 << 0;
    /// Application-layer close rather than a transport error.
    pub const APPLICATION: u32 = 1 << 1;
    /// No CONNECTION_CLOSE is sent and no draining period is observed.
    pub const SILENT: u32 = 1 << 2;
    /// Raise a ShutdownInitiated event to the application.
    pub const SEND_NOTIFICATION: u32 = 1 << 3;
    /// Transport-internal close.
    pub const INTERNAL: u32 = SEND_NOTIFICATION;
    pub const INTERNAL_SILENT: u32 = SEND_NOTIFICATION | SILENT;
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ConnectionHandle(pub usize);

impl From<ConnectionHandle> for usize {
    fn from(x: ConnectionHandle) -> usize {
        x.0
    }
}

#[derive(Debug, Fail)]
pub enum ConnectionError {
    #[fail(display = "peer doesn't implement any supported version")]
    VersionMismatch,
    #[fail(display = "{}", _0)]
    TransportError(TransportError),
    #[fail(display = "{}", _0)]
    Tls(TlsError),
    #[fail(display = "connection closed")]
    Closed,
}

impl From<TransportError> for ConnectionError {
    fn from(x: TransportError) -> Self {
        ConnectionError::TransportError(x)
    }
}

/// Per-connection credentials: the ALPN list the TLS engine negotiates
/// against, and resumption policy.
#[derive(Debug, Clone)]
pub struct Configuration {
    pub alpn: Vec<Vec<u8>>,
    pub resumption_enabled: bool,
}

/// Typed reference kinds; the total gates freeing, and debug builds keep
/// the per-kind split for leak diagnosis.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RefType {
    HandleOwner = 0,
    Route = 1,
    LossDetection = 2,
    Worker = 3,
}

const REF_TYPE_COUNT: usize = 4;

#[derive(Debug, Default)]
pub struct ConnState {
    pub initialized: bool,
    pub started: bool,
    pub connected: bool,
    pub handshake_confirmed: bool,
    pub share_binding: bool,
    pub external_owner: bool,
    pub handle_closed: bool,
    pub closed_locally: bool,
    pub closed_remotely: bool,
    pub shutdown_complete: bool,
    /// Set while we have not heard the peer acknowledge our close
    pub shutdown_complete_timed_out: bool,
    pub app_closed: bool,
    pub process_shutdown_complete: bool,
    pub disable_1rtt_encryption: bool,
    pub resumption_enabled: bool,
    pub got_first_server_response: bool,
    pub handshake_used_retry_packet: bool,
    pub peer_transport_params_valid: bool,
    pub compatible_ver_neg_attempted: bool,
    pub compatible_ver_neg_completed: bool,
    /// Deferred migration to another worker at the next clean point
    pub update_worker: bool,
}

#[derive(Debug, Default)]
pub struct TimingStats {
    pub start: u64,
    /// Estimated peer clock offset, μs
    pub phase_shift: i64,
}

#[derive(Debug, Default)]
pub struct RecvStats {
    pub total_datagrams: u64,
    pub total_bytes: u64,
    pub valid_packets: u64,
    pub dropped_packets: u64,
    pub duplicate_packets: u64,
    pub decryption_failures: u64,
}

#[derive(Debug, Default)]
pub struct SendStats {
    pub total_packets: u64,
    pub total_bytes: u64,
    pub retransmittable_packets: u64,
}

#[derive(Debug, Default)]
pub struct MiscStats {
    pub dest_cid_update_count: u64,
}

#[derive(Debug, Default)]
pub struct Stats {
    pub correlation_id: u64,
    pub version_negotiation: bool,
    pub stateless_retry: bool,
    pub timing: TimingStats,
    pub recv: RecvStats,
    pub send: SendStats,
    pub misc: MiscStats,
}

/// One packet-number space: ack tracking, loss detection, packets deferred
/// for keys, and (for 1-RTT) key-phase bookkeeping.
pub struct PacketSpace {
    /// One past the largest authenticated packet number
    pub next_recv_pn: u64,
    pub largest_recv_time: u64,
    /// Authenticated packet numbers, for duplicate rejection and acks
    pub recvd: RangeSet,
    pub deferred: VecDeque<(SocketAddrV6, PartialDecode)>,
    pub loss: ::loss_detection::LossDetection,
    /// Handshake bytes pending (re)transmission at this level
    pub pending_crypto: Vec<frame::Crypto>,
    pub crypto_send_offset: u64,
    pub current_key_phase: bool,
    pub read_key_phase_start_pn: u64,
}

impl PacketSpace {
    fn new() -> Self {
        PacketSpace {
            next_recv_pn: 0,
            largest_recv_time: 0,
            recvd: RangeSet::new(),
            deferred: VecDeque::new(),
            loss: ::loss_detection::LossDetection::new(),
            pending_crypto: Vec::new(),
            crypto_send_offset: 0,
            current_key_phase: false,
            read_key_phase_start_pn: 0,
        }
    }

    fn reset(&mut self, cc: &mut Controller) {
        self.next_recv_pn = 0;
        self.largest_recv_time = 0;
        self.recvd = RangeSet::new();
        self.deferred.clear();
        self.loss.discard(cc);
        self.loss = ::loss_detection::LossDetection::new();
        self.pending_crypto.clear();
        self.crypto_send_offset = 0;
        self.current_key_phase = false;
        self.read_key_phase_start_pn = 0;
    }
}

struct FrameSummary {
    ack_eliciting: bool,
    non_probing: bool,
}

enum KeyAction {
    Use,
    Defer,
    Drop(&'static str),
}

pub struct Connection {
    log: Logger,
    pub side: Side,
    pub handle: ConnectionHandle,
    pub state: ConnState,
    pub stats: Stats,
    ref_count: u32,
    #[cfg(debug_assertions)]
    ref_types: [u32; REF_TYPE_COUNT],
    version: u32,
    /// Version in use before a version negotiation packet moved us
    pub previous_version: Option<u32>,
    /// Version first attempted, before any compatible upgrade
    pub original_version: u32,
    /// Destination CID the client put in its very first Initial
    pub orig_dst_cid: ConnectionId,
    pub retry_source_cid: Option<ConnectionId>,
    server_name: Option<String>,
    configuration: Option<Arc<Configuration>>,
    pub crypto: Crypto,
    spaces: [PacketSpace; SpaceId::COUNT],
    pub source_cids: SourceCidList,
    pub dest_cids: DestCidList,
    /// How many source CIDs we keep announced, bounded by the peer's limit
    source_cid_limit: u8,
    local_reset_token: [u8; RESET_TOKEN_SIZE],
    /// Index 0 is the active path
    pub paths: Vec<Path>,
    timers: TimerTable,
    pub send: Send,
    cc: Box<Controller>,
    pub streams: StreamSet,
    oper_queue: OperQueue,
    recv_queue: VecDeque<(SocketAddrV6, BytesMut)>,
    recv_queue_bytes: u64,
    local_params: TransportParameters,
    pub peer_params: TransportParameters,
    /// Local parameters frozen at handshake time, for minting tickets
    handshake_tp: Option<TransportParameters>,
    peer_ack_freq_seq: Option<u64>,
    packet_tolerance: u64,
    last_peer_timestamp: Option<u64>,
    pub close_status: Option<Status>,
    pub close_error_code: u64,
    pub close_reason: Option<String>,
    /// μs; 0 disables
    keep_alive_interval: u64,
    handshake_idle_ms: u64,
}

impl Connection {
    pub fn new(
        log: Logger,
        ctx: &mut Context,
        handle: ConnectionHandle,
        side: Side,
        remote: SocketAddrV6,
        init_dst_cid: ConnectionId,
        local_cid: ConnectionId,
        rem_cid: ConnectionId,
        tls: Box<Session>,
        version: u32,
        now: u64,
    ) -> Self {
        let mut crypto = Crypto::new(tls);
        crypto.initialize(version, &init_dst_cid, side);

        let mut local_reset_token = [0; RESET_TOKEN_SIZE];
        ctx.rng.fill_bytes(&mut local_reset_token);
        let mut source_cids = SourceCidList::default();
        source_cids.push(local_cid, local_reset_token, true);

        let mut dest_cids = DestCidList::default();
        let mut head = DestCid::new(rem_cid, 0);
        head.used_locally = true;
        head.path = Some(0);
        dest_cids.push(head);

        // The client knows the server address is genuine; a server must
        // earn validation through the handshake.
        let mut path = Path::new(remote, side.is_client());
        path.dest_cid_seq = Some(0);

        let mut state = ConnState::default();
        state.share_binding = true;
        state.external_owner = true;
        state.initialized = side.is_client();

        let mut stats = Stats::default();
        stats.correlation_id = LIBRARY.next_correlation_id();
        stats.timing.start = now;

        let config = ctx.config.clone();
        Connection {
            log,
            side,
            handle,
            state,
            stats,
            ref_count: 1,
            #[cfg(debug_assertions)]
            ref_types: [1, 0, 0, 0],
            version,
            previous_version: None,
            original_version: version,
            orig_dst_cid: init_dst_cid,
            retry_source_cid: None,
            server_name: None,
            configuration: None,
            crypto,
            spaces: [PacketSpace::new(), PacketSpace::new(), PacketSpace::new()],
            source_cids,
            dest_cids,
            source_cid_limit: ACTIVE_CONNECTION_ID_LIMIT,
            local_reset_token,
            paths: vec![path],
            timers: TimerTable::new(),
            send: Send::new(),
            cc: Box::new(NewReno::new(config.congestion)),
            streams: StreamSet::new(
                side,
                config.max_remote_bi_streams,
                config.max_remote_uni_streams,
                config.stream_receive_window,
                config.receive_window,
            ),
            oper_queue: OperQueue::new(Operation::ApiCall(ApiCall::Shutdown {
                flags: close_flags::INTERNAL_SILENT,
                error_code: 0,
            })),
            recv_queue: VecDeque::new(),
            recv_queue_bytes: 0,
            local_params: TransportParameters::default(),
            peer_params: TransportParameters::default(),
            handshake_tp: None,
            peer_ack_freq_seq: None,
            packet_tolerance: DEFAULT_PACKET_TOLERANCE,
            last_peer_timestamp: None,
            close_status: None,
            close_error_code: 0,
            close_reason: None,
            keep_alive_interval: config.keep_alive_interval_ms * 1_000,
            handshake_idle_ms: config.handshake_idle_timeout_ms,
        }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// The name the client supplied for SNI, if any.
    pub fn server_name(&self) -> Option<&str> {
        self.server_name.as_ref().map(|x| &x[..])
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed_locally || self.state.closed_remotely
    }

    pub fn add_ref(&mut self, ty: RefType) {
        self.ref_count += 1;
        #[cfg(debug_assertions)]
        {
            self.ref_types[ty as usize] += 1;
        }
        #[cfg(not(debug_assertions))]
        {
            let _ = ty;
        }
    }

    /// Returns true when the last reference went away and the connection may
    /// be freed, provided any external handle is closed too.
    pub fn release_ref(&mut self, ty: RefType) -> bool {
        debug_assert!(self.ref_count > 0);
        #[cfg(debug_assertions)]
        {
            debug_assert!(self.ref_types[ty as usize] > 0);
            self.ref_types[ty as usize] -= 1;
        }
        #[cfg(not(debug_assertions))]
        {
            let _ = ty;
        }
        self.ref_count -= 1;
        self.ref_count == 0 && (!self.state.external_owner || self.state.handle_closed)
    }

    /// The application dropped its handle; frees once internal refs drain.
    pub fn close_handle(&mut self) -> bool {
        debug_assert!(!self.state.handle_closed);
        self.state.handle_closed = true;
        self.release_ref(RefType::HandleOwner)
    }

    //
    // API surface
    //

    /// Client-only: bind credentials, install transport parameters, and
    /// begin the handshake.
    pub fn start(
        &mut self,
        ctx: &mut Context,
        now: u64,
        configuration: Arc<Configuration>,
        server_name: &str,
    ) -> Result<(), ConnectionError> {
        debug_assert!(self.side.is_client());
        self.state.resumption_enabled = configuration.resumption_enabled;
        self.configuration = Some(configuration);
        self.server_name = Some(server_name.into());
        self.install_local_transport_parameters(ctx)
            .map_err(ConnectionError::Tls)?;
        self.state.started = true;
        self.stats.timing.start = now;
        trace!(self.log, "connection started"; "server" => server_name);
        self.post_crypto_progress(ctx, now);
        self.reset_idle_timeout(ctx, now);
        Ok(())
    }

    /// Server-only: bind the configuration chosen by the listener after
    /// accept.
    pub fn set_configuration(
        &mut self,
        ctx: &mut Context,
        now: u64,
        configuration: Arc<Configuration>,
    ) -> Result<(), ConnectionError> {
        debug_assert!(self.side.is_server());
        self.state.resumption_enabled = configuration.resumption_enabled;
        self.configuration = Some(configuration);
        self.install_local_transport_parameters(ctx)
            .map_err(ConnectionError::Tls)?;
        self.state.started = true;
        self.stats.timing.start = now;
        self.post_crypto_progress(ctx, now);
        self.reset_idle_timeout(ctx, now);
        Ok(())
    }

    fn install_local_transport_parameters(&mut self, ctx: &mut Context) -> Result<(), TlsError> {
        let params = self.generate_local_transport_parameters(ctx);
        let mut blob = Vec::new();
        params.write(self.side, &mut blob);
        if self.side.is_server() {
            self.handshake_tp = Some(params.clone());
        }
        self.local_params = params;
        self.crypto.tls.start_handshake(&blob)
    }

    fn generate_local_transport_parameters(&mut self, ctx: &Context) -> TransportParameters {
        let config = &ctx.config;
        let mut params = TransportParameters::default();
        params.initial_max_data = config.receive_window;
        params.initial_max_stream_data_bidi_local = config.stream_receive_window;
        params.initial_max_stream_data_bidi_remote = config.stream_receive_window;
        params.initial_max_stream_data_uni = config.stream_receive_window;
        params.initial_max_streams_bidi = config.max_remote_bi_streams;
        params.initial_max_streams_uni = config.max_remote_uni_streams;
        params.max_idle_timeout = config.idle_timeout_ms;
        params.active_connection_id_limit = u64::from(ACTIVE_CONNECTION_ID_LIMIT);
        params.initial_source_cid = self.source_cids.initial().map(|x| x.cid);
        params.max_datagram_frame_size = Some(65527);
        params.min_ack_delay = if config.min_ack_delay_us != 0 {
            Some(config.min_ack_delay_us)
        } else {
            None
        };
        params.grease_quic_bit = config.grease_quic_bit;
        params.reliable_reset_enabled = config.reliable_reset;
        params.timestamp_send_enabled = config.enable_timestamps;
        params.timestamp_recv_enabled = config.enable_timestamps;
        params.version_information = Some(VersionInfo {
            chosen: self.version,
            available: SUPPORTED_VERSIONS.to_vec(),
        });
        if self.side.is_server() {
            params.original_destination_cid = Some(self.orig_dst_cid);
            params.stateless_reset_token = Some(self.local_reset_token);
            params.retry_source_cid = self.retry_source_cid;
        }
        params
    }

    /// Queue an application shutdown. Returns true when the connection must
    /// be scheduled on its worker.
    pub fn shutdown(&mut self, user_flags: u32, error_code: u64) -> bool {
        self.oper_queue.enqueue(Operation::ApiCall(ApiCall::Shutdown {
            flags: user_flags | close_flags::APPLICATION,
            error_code,
        }))
    }

    pub fn send_resumption_ticket(&mut self, app_data: Vec<u8>, final_ticket: bool) -> bool {
        self.oper_queue
            .enqueue(Operation::ApiCall(ApiCall::SendResumptionTicket {
                app_data,
                final_ticket,
            }))
    }

    pub fn complete_resumption_ticket_validation(&mut self, accepted: bool) -> bool {
        self.oper_queue.enqueue(Operation::ApiCall(
            ApiCall::CompleteResumptionTicketValidation { accepted },
        ))
    }

    pub fn complete_certificate_validation(&mut self, accepted: bool, tls_alert: u8) -> bool {
        self.oper_queue
            .enqueue(Operation::ApiCall(ApiCall::CompleteCertificateValidation {
                accepted,
                tls_alert,
            }))
    }

    /// Ping the remote endpoint, e.g. to keep an otherwise idle connection
    /// from timing out.
    pub fn ping(&mut self) -> bool {
        self.signal_send(flags::PING)
    }

    pub fn queue_unreachable(&mut self, remote: SocketAddrV6) -> bool {
        self.oper_queue.enqueue(Operation::Unreachable(remote))
    }

    pub fn queue_route_completion(&mut self, remote: SocketAddrV6, succeeded: bool) -> bool {
        if succeeded {
            self.oper_queue.enqueue(Operation::RouteCompletion {
                path_remote: remote,
                succeeded,
            })
        } else {
            // Failure jumps the queue; shutdown must not wait behind
            // ordinary work
            self.oper_queue.enqueue_front(Operation::RouteCompletion {
                path_remote: remote,
                succeeded,
            })
        }
    }

    /// Force an emergency shutdown through the preallocated backup
    /// operation, for callers that cannot allocate a new one.
    pub fn queue_backup_shutdown(&mut self) -> bool {
        self.oper_queue.enqueue_backup()
    }

    pub fn queue_trace_rundown(&mut self) -> bool {
        self.oper_queue.enqueue(Operation::TraceRundown)
    }

    //
    // Receive queue
    //

    /// Called from the datapath with a routed datagram. Returns true when
    /// the connection must be scheduled on its worker.
    pub fn queue_recv_packet(&mut self, remote: SocketAddrV6, data: BytesMut) -> bool {
        if self.recv_queue.len() >= MAX_RECEIVE_QUEUE_COUNT {
            self.stats.recv.dropped_packets += 1;
            return false;
        }
        let was_empty = self.recv_queue.is_empty();
        self.recv_queue_bytes += data.len() as u64;
        self.recv_queue.push_back((remote, data));
        if was_empty {
            self.oper_queue.enqueue(Operation::FlushRecv)
        } else {
            false
        }
    }

    //
    // Operation drain
    //

    /// Execute up to `max_operations_per_drain` queued operations. Returns
    /// true when more work remains and the worker should re-schedule us.
    pub fn drain_operations(&mut self, ctx: &mut Context, now: u64) -> bool {
        if !self.state.initialized && !self.state.shutdown_complete {
            // Server-side initialization happens lazily on the first drain
            debug_assert!(self.side.is_server());
            self.state.initialized = true;
            trace!(self.log, "initialize complete");
            if self.keep_alive_interval != 0 {
                self.timer_set(ctx, TimerType::KeepAlive, now, self.keep_alive_interval);
            }
        }

        let max_operations = ctx.config.max_operations_per_drain;
        let mut count = 0;
        let mut has_more = true;
        while !self.state.update_worker && count < max_operations {
            count += 1;
            let oper = match self.oper_queue.dequeue() {
                Some(x) => x,
                None => {
                    has_more = false;
                    break;
                }
            };
            match oper {
                Operation::ApiCall(call) => {
                    self.process_api_operation(ctx, now, call);
                }
                Operation::FlushRecv => {
                    if !self.state.shutdown_complete && !self.flush_recv(ctx, now) {
                        // Packets remain; go back through the queue so other
                        // connections on this worker get a turn
                        self.oper_queue.enqueue(Operation::FlushRecv);
                    }
                }
                Operation::FlushSend => {
                    if self.state.shutdown_complete {
                        self.send.flush_pending = false;
                    } else if self.flush_send(ctx, now) {
                        self.send.flush_pending = false;
                    } else {
                        self.oper_queue.enqueue(Operation::FlushSend);
                    }
                }
                Operation::FlushStreamRecv(_) => {
                    // Stream data delivery lives outside the core
                }
                Operation::TimerExpired(ty) => {
                    if !self.state.shutdown_complete {
                        self.process_expired_timer(ctx, now, ty);
                    }
                }
                Operation::Unreachable(remote) => {
                    if !self.state.shutdown_complete {
                        self.process_unreachable(ctx, now, remote);
                    }
                }
                Operation::RouteCompletion { succeeded, .. } => {
                    if !self.state.shutdown_complete && !succeeded {
                        self.silently_abort(ctx, now);
                    }
                }
                Operation::TraceRundown => {
                    self.trace_rundown();
                }
            }
        }

        if self.state.process_shutdown_complete {
            self.on_shutdown_complete(ctx);
        }
        has_more && !self.oper_queue.is_empty()
    }

    fn process_api_operation(&mut self, ctx: &mut Context, now: u64, call: ApiCall) {
        match call {
            ApiCall::Shutdown {
                flags: close,
                error_code,
            } => {
                self.try_close(ctx, now, close, None, error_code, &[]);
            }
            ApiCall::SendResumptionTicket { app_data, .. } => {
                self.process_send_resumption_ticket(&app_data);
            }
            ApiCall::CompleteResumptionTicketValidation { accepted } => {
                if self.crypto.ticket_validation_pending {
                    self.crypto.ticket_validation_pending = false;
                    if !accepted {
                        debug!(self.log, "resumption rejected by app");
                    }
                    self.post_crypto_progress(ctx, now);
                } else if !accepted {
                    // Rejection arrived before TLS asked for a verdict
                    self.crypto.ticket_validation_rejecting = true;
                }
            }
            ApiCall::CompleteCertificateValidation {
                accepted,
                tls_alert,
            } => {
                if accepted {
                    self.post_crypto_progress(ctx, now);
                } else {
                    self.try_close(
                        ctx,
                        now,
                        close_flags::INTERNAL,
                        None,
                        TransportError::crypto(tls_alert).0,
                        &[],
                    );
                }
            }
        }
    }

    fn process_send_resumption_ticket(&mut self, app_data: &[u8]) {
        if self.side.is_client() || !self.state.connected || !self.state.resumption_enabled {
            debug!(self.log, "ignoring resumption ticket request in invalid state");
            return;
        }
        let handshake_tp = match self.handshake_tp {
            Some(ref x) => x.clone(),
            None => {
                return;
            }
        };
        let alpn = self
            .crypto
            .tls
            .alpn_protocol()
            .map(|x| x.to_vec())
            .unwrap_or_default();
        let encoded = ticket::encode_server_ticket(self.version, &alpn, &handshake_tp, app_data);
        if let Err(e) = self.crypto.process_app_data(&encoded) {
            debug!(self.log, "failed to queue resumption ticket"; "reason" => %e);
        }
    }

    /// Server-side ingestion of a resumption ticket presented by a client.
    /// Returns whether resumption may proceed, possibly pending the app's
    /// asynchronous verdict.
    pub fn recv_resumption_ticket(&mut self, ctx: &mut Context, ticket_data: &[u8]) -> bool {
        if self.side.is_client() {
            return false;
        }
        if self.crypto.ticket_validation_rejecting {
            self.crypto.ticket_validation_rejecting = false;
            self.crypto.ticket_validation_pending = false;
            return false;
        }
        let alpn_list = match self.configuration {
            Some(ref x) => x.alpn.clone(),
            None => {
                return false;
            }
        };
        let (ticket_version, resumed, app_data) =
            match ticket::decode_server_ticket(ticket_data, &alpn_list) {
                Ok(x) => x,
                Err(e) => {
                    debug!(self.log, "rejecting resumption ticket"; "reason" => %e);
                    return false;
                }
            };
        if ticket_version != self.version {
            debug!(self.log, "resumption ticket for different version");
            return false;
        }
        // Reject tickets minted under more generous settings than now apply
        if resumed.active_connection_id_limit > u64::from(ACTIVE_CONNECTION_ID_LIMIT)
            || resumed.initial_max_data > self.local_params.initial_max_data
            || resumed.initial_max_stream_data_bidi_local
                > self.local_params.initial_max_stream_data_bidi_local
            || resumed.initial_max_stream_data_bidi_remote
                > self.local_params.initial_max_stream_data_bidi_remote
            || resumed.initial_max_stream_data_uni > self.local_params.initial_max_stream_data_uni
            || resumed.initial_max_streams_bidi > self.local_params.initial_max_streams_bidi
            || resumed.initial_max_streams_uni > self.local_params.initial_max_streams_uni
        {
            debug!(self.log, "resumption ticket exceeds current settings");
            return false;
        }
        self.crypto.ticket_validation_pending = true;
        ctx.events
            .push_back((self.handle, Event::Resumed { app_data }));
        true
    }

    //
    // Receive pipeline
    //

    /// Process queued datagrams, at most `MAX_RECEIVE_FLUSH_COUNT` per pass.
    /// Returns true when the queue is fully drained.
    fn flush_recv(&mut self, ctx: &mut Context, now: u64) -> bool {
        let limit = cmp::min(self.recv_queue.len(), MAX_RECEIVE_FLUSH_COUNT);
        let mut batch: Vec<(SocketAddrV6, PartialDecode)> = Vec::new();
        for _ in 0..limit {
            let (remote, data) = match self.recv_queue.pop_front() {
                Some(x) => x,
                None => break,
            };
            self.recv_queue_bytes -= data.len() as u64;
            self.stats.recv.total_datagrams += 1;
            self.stats.recv.total_bytes += data.len() as u64;
            let mut rest = Some(data);
            while let Some(chunk) = rest.take() {
                let (pd, tail) = match PartialDecode::new(chunk, ctx.config.local_cid_len) {
                    Ok(x) => x,
                    Err(e) => {
                        trace!(self.log, "header decode failed"; "reason" => %e);
                        self.stats.recv.dropped_packets += 1;
                        break;
                    }
                };
                rest = tail;
                if pd.key_type() == Some(KeyType::OneRtt) {
                    // Short-header packets batch so header protection comes
                    // off for the whole run at once
                    if batch.last().map_or(false, |x| x.0 != remote)
                        || batch.len() == MAX_CRYPTO_BATCH_COUNT
                    {
                        self.process_batch(ctx, now, &mut batch);
                    }
                    batch.push((remote, pd));
                } else {
                    self.process_batch(ctx, now, &mut batch);
                    self.recv_one(ctx, now, remote, pd);
                }
            }
        }
        self.process_batch(ctx, now, &mut batch);
        self.prune_invalid_paths();
        self.recv_queue.is_empty()
    }

    fn process_batch(
        &mut self,
        ctx: &mut Context,
        now: u64,
        batch: &mut Vec<(SocketAddrV6, PartialDecode)>,
    ) {
        for (remote, pd) in batch.drain(..).collect::<Vec<_>>() {
            self.recv_one(ctx, now, remote, pd);
        }
    }

    fn packet_drop(&mut self, reason: &'static str) {
        trace!(self.log, "dropping packet"; "reason" => reason);
        self.stats.recv.dropped_packets += 1;
    }

    fn path_id(&mut self, remote: SocketAddrV6) -> Option<usize> {
        if let Some(i) = self.paths.iter().position(|x| x.remote == remote) {
            return Some(i);
        }
        if self.paths.len() >= MAX_PATH_COUNT {
            return None;
        }
        self.paths.push(Path::new(remote, false));
        Some(self.paths.len() - 1)
    }

    fn recv_one(&mut self, ctx: &mut Context, now: u64, remote: SocketAddrV6, pd: PartialDecode) {
        let packet_bytes = pd.len() as u64;
        let path_id = match self.path_id(remote) {
            Some(x) => x,
            None => {
                self.packet_drop("too many paths");
                return;
            }
        };
        self.paths[path_id].on_bytes_received(packet_bytes);

        if pd.is_version_negotiate() {
            let packet = pd.finish_unprotected();
            self.recv_ver_neg(ctx, now, packet);
            return;
        }
        if pd.is_retry() {
            let packet = pd.finish_unprotected();
            self.recv_retry(ctx, now, packet);
            return;
        }

        if pd.is_long() && pd.version() != self.version {
            // A compatible server may upgrade us mid-handshake
            if self.side.is_client()
                && !self.state.compatible_ver_neg_attempted
                && is_supported_version(pd.version())
                && are_versions_compatible(self.version, pd.version())
            {
                trace!(self.log, "compatible version upgrade";
                       "old" => format!("{:#x}", self.version),
                       "new" => format!("{:#x}", pd.version()));
                self.state.compatible_ver_neg_attempted = true;
                self.version = pd.version();
                self.on_version_set();
                let basis = self.initial_key_basis();
                self.crypto
                    .on_version_change(self.version, &basis, self.side);
            } else {
                self.packet_drop("invalid version");
                return;
            }
        }

        let key_type = match pd.key_type() {
            Some(x) => x,
            None => {
                self.packet_drop("no key type");
                return;
            }
        };
        match self.key_action(key_type) {
            KeyAction::Use => {}
            KeyAction::Defer => {
                let space_idx = key_type.space() as usize;
                if self.spaces[space_idx].deferred.len() >= MAX_DEFERRED_PACKETS {
                    self.packet_drop("max deferred packet count reached");
                } else {
                    trace!(self.log, "deferring packet"; "key" => ?key_type);
                    self.spaces[space_idx].deferred.push_back((remote, pd));
                }
                return;
            }
            KeyAction::Drop(reason) => {
                self.packet_drop(reason);
                return;
            }
        }

        let space_id = key_type.space();
        let pkt_dst_cid = pd.dst_cid();
        let is_initial_packet = pd.is_initial();
        let sample = match pd.sample() {
            Ok(x) => x,
            Err(_) => {
                self.packet_drop("too short to sample");
                return;
            }
        };
        let expected = self.spaces[space_id as usize].next_recv_pn;
        let mask = {
            let keys = self.crypto.read_keys(key_type).unwrap();
            keys.header.mask(&sample)
        };
        let mut packet = match pd.finish(mask, expected) {
            Ok(x) => x,
            Err(e) => {
                trace!(self.log, "header unprotect failed"; "reason" => %e);
                self.stats.recv.dropped_packets += 1;
                return;
            }
        };
        if packet.number > VAR_INT_MAX {
            self.packet_drop("packet number too big");
            return;
        }

        // Decide which 1-RTT key generation this packet belongs to
        let mut use_prev = false;
        let mut trial_new = false;
        if let Header::Short { key_phase, .. } = packet.header {
            let space = &self.spaces[SpaceId::Data as usize];
            if key_phase != space.current_key_phase {
                if packet.number < space.read_key_phase_start_pn {
                    if self.crypto.prev_1rtt_read().is_none() {
                        self.packet_drop("no previous keys for old phase");
                        return;
                    }
                    use_prev = true;
                } else {
                    trace!(self.log, "possible peer key update"; "pn" => packet.number);
                    trial_new = true;
                }
            }
        }

        // A failed decrypt must not be able to trash the reset token
        let mut reset_candidate = None;
        if self.side.is_client()
            && packet.header.is_short()
            && packet.payload.len() >= RESET_TOKEN_SIZE
            && packet.header_data.len() + packet.payload.len() >= MIN_STATELESS_RESET_SIZE
        {
            let mut token = [0; RESET_TOKEN_SIZE];
            token.copy_from_slice(&packet.payload[packet.payload.len() - RESET_TOKEN_SIZE..]);
            reset_candidate = Some(token);
        }

        let decrypted = {
            let keys: &Keys = if trial_new {
                self.crypto.generate_new_keys()
            } else if use_prev {
                self.crypto.prev_1rtt_read().unwrap()
            } else {
                self.crypto.read_keys(key_type).unwrap()
            };
            keys.packet
                .decrypt(packet.number, &packet.header_data, &mut packet.payload)
                .is_ok()
        };

        if !decrypted {
            if let Some(candidate) = reset_candidate {
                let mut is_reset = false;
                for dest_cid in self.dest_cids.iter() {
                    match dest_cid.reset_token {
                        Some(ref token) if !dest_cid.retired => {
                            if constant_time_eq(token, &candidate) {
                                is_reset = true;
                                break;
                            }
                        }
                        _ => {}
                    }
                }
                if is_reset {
                    debug!(self.log, "received stateless reset");
                    self.try_close(
                        ctx,
                        now,
                        close_flags::INTERNAL_SILENT,
                        Some(Status::Aborted),
                        0,
                        &[],
                    );
                    return;
                }
            }
            self.stats.recv.decryption_failures += 1;
            LIBRARY
                .counters
                .pkts_decryption_fail
                .fetch_add(1, ::std::sync::atomic::Ordering::Relaxed);
            self.packet_drop("decryption failure");
            if self.stats.recv.decryption_failures >= AEAD_INTEGRITY_LIMIT {
                self.transport_error(ctx, now, TransportError::AEAD_LIMIT_REACHED);
            }
            return;
        }
        self.stats.recv.valid_packets += 1;

        if packet.reserved_bits != 0 {
            self.packet_drop("reserved bits set");
            self.transport_error(ctx, now, TransportError::PROTOCOL_VIOLATION);
            return;
        }

        {
            let space = &mut self.spaces[space_id as usize];
            if !space.recvd.insert_one(packet.number) {
                self.stats.recv.duplicate_packets += 1;
                trace!(self.log, "duplicate packet"; "pn" => packet.number);
                return;
            }
            if space.recvd.len() > MAX_ACK_RANGES {
                space.recvd.pop_min();
            }
        }

        // Commit key-phase bookkeeping now that the packet authenticated
        if packet.header.is_short() {
            let space = &mut self.spaces[SpaceId::Data as usize];
            if trial_new {
                self.crypto.update_key_phase();
                space.current_key_phase = !space.current_key_phase;
                space.read_key_phase_start_pn = packet.number;
            } else if !use_prev && packet.number < space.read_key_phase_start_pn {
                space.read_key_phase_start_pn = packet.number;
            }
        }

        let is_new_largest;
        {
            let space = &mut self.spaces[space_id as usize];
            is_new_largest = packet.number + 1 > space.next_recv_pn;
            if is_new_largest {
                space.next_recv_pn = packet.number + 1;
                space.largest_recv_time = now;
            }
        }

        if self.side.is_server() && key_type == KeyType::Handshake {
            // First Handshake decrypt proves the client owns its address
            // and obsoletes Initial keys
            self.crypto.discard_keys(KeyType::Initial);
            self.spaces[SpaceId::Initial as usize]
                .loss
                .discard(&mut *self.cc);
            self.spaces[SpaceId::Initial as usize].deferred.clear();
            self.paths[path_id].set_valid();
        }
        if self.side.is_client() && is_initial_packet && !self.state.connected {
            if let Header::Initial { src_cid, .. } = packet.header {
                self.update_dest_cid(src_cid);
            }
        }

        let payload = packet.payload.freeze();
        let summary = match self.recv_frames(ctx, now, path_id, key_type, payload) {
            Ok(x) => x,
            Err(()) => {
                return;
            }
        };

        if summary.ack_eliciting {
            match space_id {
                SpaceId::Initial | SpaceId::Handshake => {
                    self.signal_send(flags::ACK);
                }
                SpaceId::Data => {
                    if !self.timers.is_set(TimerType::AckDelay) {
                        let delay = self.local_max_ack_delay_us();
                        self.timer_set(ctx, TimerType::AckDelay, now, delay);
                    }
                }
            }
        }
        self.reset_idle_timeout(ctx, now);
        self.recv_post_processing(
            ctx,
            now,
            path_id,
            pkt_dst_cid,
            summary.non_probing,
            is_new_largest,
        );
    }

    fn key_action(&self, key_type: KeyType) -> KeyAction {
        if self.crypto.read_level.map_or(true, |level| key_type > level) {
            if key_type == KeyType::ZeroRtt
                && self.crypto.tls.early_data_state() != EarlyDataState::Unknown
            {
                return KeyAction::Drop("0-RTT not currently accepted");
            }
            return KeyAction::Defer;
        }
        if self.side.is_server() && !self.state.handshake_confirmed && key_type == KeyType::OneRtt
        {
            // A server must not process 1-RTT packets before the handshake
            // completes
            return KeyAction::Defer;
        }
        if self.crypto.read_keys(key_type).is_none() {
            return KeyAction::Drop("key no longer accepted");
        }
        KeyAction::Use
    }

    /// Re-run packets parked for keys that have since been installed.
    fn flush_deferred(&mut self, ctx: &mut Context, now: u64) {
        for space_id in SpaceId::iter() {
            loop {
                let ready = {
                    let space = &self.spaces[space_id as usize];
                    match space.deferred.front() {
                        Some(&(_, ref pd)) => pd.key_type().map_or(false, |kt| {
                            match self.key_action(kt) {
                                KeyAction::Defer => false,
                                _ => true,
                            }
                        }),
                        None => break,
                    }
                };
                if !ready {
                    break;
                }
                let (remote, pd) = self.spaces[space_id as usize]
                    .deferred
                    .pop_front()
                    .unwrap();
                self.recv_one(ctx, now, remote, pd);
            }
        }
    }

    //
    // Version handling
    //

    /// The CID Initial keys derive from: for a client, its current first
    /// dest CID; for a server, the CID the client originally sent.
    fn initial_key_basis(&self) -> ConnectionId {
        match self.side {
            Side::Client => self
                .dest_cids
                .head()
                .map(|x| x.cid)
                .unwrap_or(self.orig_dst_cid),
            Side::Server => self.orig_dst_cid,
        }
    }

    fn on_version_set(&mut self) {
        trace!(self.log, "using version"; "version" => format!("{:#x}", self.version));
    }

    fn recv_ver_neg(&mut self, ctx: &mut Context, now: u64, packet: Packet) {
        if self.side.is_server() {
            self.packet_drop("version negotiation sent to server");
            return;
        }
        if self.stats.version_negotiation || self.state.got_first_server_response {
            self.packet_drop("version negotiation already handled");
            return;
        }
        let versions = match ::packet::parse_version_list(&packet.payload) {
            Some(x) => x,
            None => {
                self.packet_drop("malformed version negotiation");
                return;
            }
        };
        let mut supported = 0;
        for &version in &versions {
            trace!(self.log, "version negotiation offer"; "version" => format!("{:#x}", version));
            if version == self.version && !is_reserved_version(version) {
                self.packet_drop("version negotiation includes current version");
                return;
            }
            if supported == 0 && is_supported_version(version) && !is_reserved_version(version) {
                supported = version;
            }
        }
        if supported == 0 {
            debug!(self.log, "version negotiation contained no supported versions");
            self.try_close(
                ctx,
                now,
                close_flags::INTERNAL_SILENT,
                Some(Status::VersionNegotiationError),
                0,
                &[],
            );
            return;
        }
        self.stats.version_negotiation = true;
        self.previous_version = Some(self.version);
        self.version = supported;
        self.on_version_set();
        let basis = self.initial_key_basis();
        self.crypto
            .on_version_change(self.version, &basis, self.side);
        self.restart(ctx, now, true);
    }

    fn recv_retry(&mut self, ctx: &mut Context, now: u64, packet: Packet) {
        if self.side.is_server() {
            self.packet_drop("retry sent to server");
            return;
        }
        if self.state.got_first_server_response {
            self.packet_drop("already received server response");
            return;
        }
        if self.is_closed() {
            self.packet_drop("retry while shutting down");
            return;
        }
        if packet.payload.len() <= RESET_TOKEN_SIZE {
            self.packet_drop("no room for retry token");
            return;
        }
        let token_len = packet.payload.len() - RESET_TOKEN_SIZE;
        let orig_dst_cid = match self.dest_cids.head() {
            Some(x) => x.cid,
            None => {
                self.packet_drop("no destination CID");
                return;
            }
        };
        let mut full_packet = Vec::with_capacity(packet.header_data.len() + packet.payload.len());
        full_packet.extend_from_slice(&packet.header_data);
        full_packet.extend_from_slice(&packet.payload);
        if !self
            .crypto
            .tls
            .retry_integrity_valid(self.version, &orig_dst_cid, &full_packet)
        {
            self.packet_drop("invalid retry integrity field");
            return;
        }

        self.send.initial_token = Bytes::from(&packet.payload[..token_len]);

        let src_cid = match packet.header {
            Header::Retry { src_cid, .. } => src_cid,
            _ => unreachable!(),
        };
        self.update_dest_cid(src_cid);
        self.retry_source_cid = Some(src_cid);
        self.state.got_first_server_response = true;
        self.state.handshake_used_retry_packet = true;

        // Initial protection re-keys under the server's chosen CID
        self.crypto.discard_keys(KeyType::Initial);
        let basis = self.initial_key_basis();
        self.crypto
            .on_version_change(self.version, &basis, self.side);
        self.stats.stateless_retry = true;
        self.restart(ctx, now, false);
    }

    /// Client-side replacement of the head dest CID from a server packet.
    fn update_dest_cid(&mut self, src_cid: ConnectionId) {
        let updated = {
            let head = match self.dest_cids.head_mut() {
                Some(x) => x,
                None => {
                    return;
                }
            };
            if head.cid == src_cid {
                false
            } else {
                head.cid = src_cid;
                true
            }
        };
        if updated {
            trace!(self.log, "destination CID updated"; "cid" => %src_cid);
            self.stats.misc.dest_cid_update_count += 1;
        }
    }

    /// Rewind handshake state for a Retry or version change. A complete
    /// restart also resets the Handshake and 1-RTT spaces and the TLS
    /// machine.
    fn restart(&mut self, ctx: &mut Context, now: u64, complete: bool) {
        for (i, space) in self.spaces.iter_mut().enumerate() {
            if complete || i == SpaceId::Initial as usize {
                space.reset(&mut *self.cc);
            }
        }
        if complete {
            let basis = self.initial_key_basis();
            self.crypto.reset(self.version, &basis, self.side);
        }
        self.local_params.version_information = Some(VersionInfo {
            chosen: self.version,
            available: SUPPORTED_VERSIONS.to_vec(),
        });
        let mut blob = Vec::new();
        self.local_params.write(self.side, &mut blob);
        if let Err(e) = self.crypto.tls.start_handshake(&blob) {
            debug!(self.log, "handshake restart failed"; "reason" => %e);
            self.fatal_error(ctx, now, Status::InternalError);
            return;
        }
        self.post_crypto_progress(ctx, now);
        self.reset_idle_timeout(ctx, now);
    }

    //
    // Frame processing
    //

    fn recv_frames(
        &mut self,
        ctx: &mut Context,
        now: u64,
        path_id: usize,
        key_type: KeyType,
        payload: Bytes,
    ) -> Result<FrameSummary, ()> {
        let mut summary = FrameSummary {
            ack_eliciting: false,
            non_probing: false,
        };
        let mut closed = self.is_closed();
        for frame in frame::Iter::new(payload) {
            let ty = frame.ty();
            if !ty.is_allowed(key_type) {
                debug!(self.log, "frame not allowed at level"; "type" => ty, "key" => ?key_type);
                self.transport_error(ctx, now, TransportError::FRAME_ENCODING_ERROR);
                return Err(());
            }
            if !ty.is_probing() {
                summary.non_probing = true;
            }
            match frame {
                Frame::Padding => {}
                Frame::Ping => {
                    summary.ack_eliciting = true;
                }
                Frame::Ack(ack) => {
                    self.recv_ack(ctx, now, path_id, key_type, &ack)?;
                }
                Frame::Crypto(c) => {
                    summary.ack_eliciting = true;
                    if closed {
                        continue;
                    }
                    let space = key_type.space();
                    if let Err(e) = self.crypto.process_frame(space, c.offset, c.data) {
                        debug!(self.log, "TLS error"; "reason" => %e);
                        let code = match e {
                            TlsError::Alert(alert) => TransportError::crypto(alert),
                            TlsError::HandshakeFailed(_) => TransportError::crypto(40),
                        };
                        self.transport_error(ctx, now, code);
                        return Err(());
                    }
                    self.post_crypto_progress(ctx, now);
                }
                Frame::NewToken { .. } => {
                    summary.ack_eliciting = true;
                    if self.side.is_server() {
                        self.transport_error(ctx, now, TransportError::PROTOCOL_VIOLATION);
                        return Err(());
                    }
                    // Token caching is the embedding's concern
                }
                Frame::Stream(s) => {
                    summary.ack_eliciting = true;
                    if closed {
                        continue;
                    }
                    if let Err(e) = self.streams.recv_stream(&s) {
                        self.transport_error(ctx, now, e);
                        return Err(());
                    }
                }
                Frame::ResetStream { id, final_size, .. } => {
                    summary.ack_eliciting = true;
                    if closed {
                        continue;
                    }
                    if let Err(e) = self.streams.recv_reset(id, final_size) {
                        self.transport_error(ctx, now, e);
                        return Err(());
                    }
                }
                Frame::StopSending { id, .. } => {
                    summary.ack_eliciting = true;
                    if closed {
                        continue;
                    }
                    if let Err(e) = self.streams.recv_stop_sending(id) {
                        self.transport_error(ctx, now, e);
                        return Err(());
                    }
                }
                Frame::MaxData(offset) => {
                    summary.ack_eliciting = true;
                    if closed {
                        continue;
                    }
                    self.streams.recv_max_data(offset);
                }
                Frame::MaxStreamData { id, .. } => {
                    summary.ack_eliciting = true;
                    if closed {
                        continue;
                    }
                    if let Err(e) = self.streams.recv_max_stream_data(id) {
                        self.transport_error(ctx, now, e);
                        return Err(());
                    }
                }
                Frame::MaxStreams {
                    directionality,
                    count,
                } => {
                    summary.ack_eliciting = true;
                    if closed {
                        continue;
                    }
                    if count > 1 << 60 {
                        self.transport_error(ctx, now, TransportError::FRAME_ENCODING_ERROR);
                        return Err(());
                    }
                    self.streams.recv_max_streams(directionality, count);
                }
                Frame::DataBlocked { offset } => {
                    summary.ack_eliciting = true;
                    debug!(self.log, "peer blocked at connection level"; "offset" => offset);
                }
                Frame::StreamDataBlocked { id, offset } => {
                    summary.ack_eliciting = true;
                    debug!(self.log, "peer blocked at stream level"; "stream" => id, "offset" => offset);
                }
                Frame::StreamsBlocked { directionality, .. } => {
                    summary.ack_eliciting = true;
                    if closed {
                        continue;
                    }
                    ctx.events
                        .push_back((self.handle, Event::PeerNeedsStreams { directionality }));
                }
                Frame::NewConnectionId(f) => {
                    summary.ack_eliciting = true;
                    if closed {
                        continue;
                    }
                    self.recv_new_connection_id(ctx, now, &f)?;
                }
                Frame::RetireConnectionId { sequence } => {
                    summary.ack_eliciting = true;
                    if closed {
                        continue;
                    }
                    self.recv_retire_connection_id(ctx, now, sequence)?;
                }
                Frame::PathChallenge(data) => {
                    summary.ack_eliciting = true;
                    if closed {
                        continue;
                    }
                    self.paths[path_id].send_response = true;
                    self.paths[path_id].response = data;
                    self.signal_send(flags::PATH_RESPONSE);
                }
                Frame::PathResponse(data) => {
                    summary.ack_eliciting = true;
                    if closed {
                        continue;
                    }
                    for path in &mut self.paths {
                        if !path.peer_validated && path.challenge == data {
                            path.set_valid();
                            LIBRARY
                                .counters
                                .paths_validated
                                .fetch_add(1, ::std::sync::atomic::Ordering::Relaxed);
                            trace!(self.log, "path validated"; "remote" => %path.remote);
                            break;
                        }
                    }
                }
                Frame::ConnectionClose(reason) => {
                    debug!(self.log, "connection closed by peer"; "reason" => %reason);
                    self.try_close(
                        ctx,
                        now,
                        close_flags::REMOTE | close_flags::SEND_NOTIFICATION,
                        None,
                        reason.error_code.0,
                        &reason.reason,
                    );
                    closed = true;
                }
                Frame::ApplicationClose(reason) => {
                    debug!(self.log, "connection closed by peer application"; "reason" => %reason);
                    self.try_close(
                        ctx,
                        now,
                        close_flags::REMOTE
                            | close_flags::APPLICATION
                            | close_flags::SEND_NOTIFICATION,
                        None,
                        reason.error_code,
                        &reason.reason,
                    );
                    closed = true;
                }
                Frame::HandshakeDone => {
                    summary.ack_eliciting = true;
                    if self.side.is_server() || !self.state.connected {
                        self.transport_error(ctx, now, TransportError::PROTOCOL_VIOLATION);
                        return Err(());
                    }
                    if !self.state.handshake_confirmed {
                        trace!(self.log, "handshake confirmed");
                        self.state.handshake_confirmed = true;
                        self.crypto.discard_keys(KeyType::Handshake);
                        self.spaces[SpaceId::Handshake as usize]
                            .loss
                            .discard(&mut *self.cc);
                        self.flush_deferred(ctx, now);
                    }
                }
                Frame::Datagram { data } => {
                    summary.ack_eliciting = true;
                    if closed {
                        continue;
                    }
                    match self.local_params.max_datagram_frame_size {
                        Some(limit) if (data.len() as u64) <= limit => {}
                        _ => {
                            self.transport_error(ctx, now, TransportError::PROTOCOL_VIOLATION);
                            return Err(());
                        }
                    }
                }
                Frame::AckFrequency {
                    sequence,
                    packet_tolerance,
                    ..
                } => {
                    summary.ack_eliciting = true;
                    if self.local_params.min_ack_delay.is_none() {
                        self.transport_error(ctx, now, TransportError::FRAME_ENCODING_ERROR);
                        return Err(());
                    }
                    if self.peer_ack_freq_seq.map_or(false, |prev| sequence <= prev) {
                        // Stale update
                        continue;
                    }
                    self.peer_ack_freq_seq = Some(sequence);
                    self.packet_tolerance = packet_tolerance.max(1);
                    trace!(self.log, "packet tolerance updated"; "tolerance" => self.packet_tolerance);
                }
                Frame::ImmediateAck => {
                    summary.ack_eliciting = true;
                    self.signal_send(flags::ACK);
                }
                Frame::Timestamp(ts) => {
                    if !self.local_params.timestamp_recv_enabled {
                        self.transport_error(ctx, now, TransportError::FRAME_ENCODING_ERROR);
                        return Err(());
                    }
                    self.last_peer_timestamp = Some(ts);
                }
                Frame::Invalid(ty) => {
                    debug!(self.log, "received malformed frame"; "type" => ty);
                    self.transport_error(ctx, now, TransportError::FRAME_ENCODING_ERROR);
                    return Err(());
                }
            }
        }
        Ok(summary)
    }

    fn recv_ack(
        &mut self,
        ctx: &mut Context,
        now: u64,
        path_id: usize,
        key_type: KeyType,
        ack: &frame::Ack,
    ) -> Result<(), ()> {
        let exponent = if key_type == KeyType::OneRtt && self.state.peer_transport_params_valid {
            self.peer_params.ack_delay_exponent
        } else {
            3
        };
        let ack_delay = ack.delay << exponent;
        let peer_timestamp = self.last_peer_timestamp.take();
        let space_id = key_type.space();
        let outcome = {
            let space = &mut self.spaces[space_id as usize];
            space.loss.on_ack_received(
                now,
                ack,
                ack_delay,
                peer_timestamp,
                &mut self.paths[path_id].rtt,
                &mut self.stats.timing.phase_shift,
                &mut *self.cc,
            )
        };
        let outcome = match outcome {
            Ok(x) => x,
            Err(e) => {
                self.transport_error(ctx, now, e);
                return Err(());
            }
        };
        let mut lost_flags = 0;
        for (_, info) in outcome.lost {
            lost_flags |= info.retransmits.flags;
            if !info.retransmits.crypto.is_empty() {
                lost_flags |= flags::CRYPTO;
                self.spaces[space_id as usize]
                    .pending_crypto
                    .extend(info.retransmits.crypto);
            }
        }
        if lost_flags != 0 {
            self.signal_send(lost_flags);
        }
        let timeout = {
            let space = &self.spaces[space_id as usize];
            space
                .loss
                .next_timeout(&self.paths[path_id].rtt, self.peer_max_ack_delay_us())
        };
        match timeout {
            Some(t) => {
                self.timer_set_absolute(ctx, TimerType::LossDetection, t);
            }
            None => {
                self.timer_cancel(ctx, TimerType::LossDetection);
            }
        }
        Ok(())
    }

    fn recv_new_connection_id(
        &mut self,
        ctx: &mut Context,
        now: u64,
        f: &frame::NewConnectionId,
    ) -> Result<(), ()> {
        if self.dest_cids.head().map_or(true, |x| x.cid.is_empty()) {
            debug!(self.log, "NEW_CONNECTION_ID with zero-length CID in use");
            self.transport_error(ctx, now, TransportError::PROTOCOL_VIOLATION);
            return Err(());
        }
        let mut replace_retired = false;
        if self.dest_cids.retire_prior_to < f.retire_prior_to {
            let (retired, needed) = self.dest_cids.on_retire_prior_to(f.retire_prior_to);
            if !retired.is_empty() {
                self.signal_send(flags::RETIRE_CONNECTION_ID);
            }
            replace_retired = needed;
            if self.retired_cid_limit_exceeded(ctx, now) {
                return Err(());
            }
        }
        let existing = self.dest_cids.get_by_seq(f.sequence).map(|x| x.cid);
        match existing {
            None => {
                let mut entry = DestCid::new(f.cid, f.sequence);
                entry.reset_token = Some(f.reset_token);
                trace!(self.log, "new destination CID"; "seq" => f.sequence, "cid" => %f.cid);
                self.dest_cids.push(entry);
                if f.sequence < self.dest_cids.retire_prior_to {
                    self.dest_cids.retire(f.sequence);
                    self.signal_send(flags::RETIRE_CONNECTION_ID);
                    if self.retired_cid_limit_exceeded(ctx, now) {
                        return Err(());
                    }
                }
                if self.dest_cids.active_count() > ACTIVE_CONNECTION_ID_LIMIT as usize {
                    debug!(self.log, "peer exceeded CID limit");
                    if replace_retired {
                        self.silently_abort(ctx, now);
                    } else {
                        self.transport_error(ctx, now, TransportError::PROTOCOL_VIOLATION);
                    }
                    return Err(());
                }
            }
            Some(cid) => {
                if cid != f.cid {
                    self.transport_error(ctx, now, TransportError::PROTOCOL_VIOLATION);
                    return Err(());
                }
            }
        }
        if replace_retired && !self.replace_retired_cids(ctx, now) {
            return Err(());
        }
        Ok(())
    }

    fn retired_cid_limit_exceeded(&mut self, ctx: &mut Context, now: u64) -> bool {
        if self.dest_cids.retired_count > 8 * u64::from(ACTIVE_CONNECTION_ID_LIMIT) {
            debug!(self.log, "peer exceeded retire CID limit");
            self.silently_abort(ctx, now);
            return true;
        }
        false
    }

    fn recv_retire_connection_id(
        &mut self,
        ctx: &mut Context,
        now: u64,
        sequence: u64,
    ) -> Result<(), ()> {
        if sequence >= self.source_cids.next_sequence {
            self.transport_error(ctx, now, TransportError::PROTOCOL_VIOLATION);
            return Err(());
        }
        match self.source_cids.remove_retired(sequence) {
            None => {}
            Some((already_retired, is_last)) => {
                if is_last {
                    debug!(self.log, "last source CID retired");
                    self.try_close(
                        ctx,
                        now,
                        close_flags::INTERNAL_SILENT,
                        None,
                        TransportError::PROTOCOL_VIOLATION.0,
                        &[],
                    );
                } else if !already_retired {
                    // Replace it so the peer keeps a full set to migrate to
                    self.generate_new_source_cid(ctx, now, false);
                }
            }
        }
        Ok(())
    }

    //
    // Post-processing: CID usage and path migration
    //

    fn recv_post_processing(
        &mut self,
        ctx: &mut Context,
        now: u64,
        path_id: usize,
        pkt_dst_cid: ConnectionId,
        non_probing: bool,
        is_new_largest: bool,
    ) {
        let mut peer_updated_cid = false;
        if !pkt_dst_cid.is_empty() {
            if let Some(source_cid) = self.source_cids.get_by_buf(&pkt_dst_cid) {
                if !source_cid.used_by_peer {
                    source_cid.used_by_peer = true;
                    if !source_cid.is_initial {
                        peer_updated_cid = true;
                    }
                }
            }
        }

        if !self.paths[path_id].got_valid_packet {
            self.paths[path_id].got_valid_packet = true;
            if path_id != 0 {
                // First valid packet on a non-active path: give it a CID of
                // its own and challenge both it and the active path
                let needs_cid = self.paths[path_id].dest_cid_seq.is_none()
                    || (peer_updated_cid
                        && self.dest_cids.head().map_or(false, |x| !x.cid.is_empty()));
                if needs_cid {
                    match self.dest_cids.unused_seq() {
                        None => {
                            debug!(self.log, "no unused CID for new path");
                            self.paths[path_id].got_valid_packet = false;
                            self.paths[path_id].dest_cid_seq = None;
                            return;
                        }
                        Some(seq) => {
                            let entry = self.dest_cids.get_by_seq_mut(seq).unwrap();
                            entry.used_locally = true;
                            entry.path = Some(path_id);
                            self.paths[path_id].dest_cid_seq = Some(seq);
                        }
                    }
                }
                self.paths[path_id].start_validation(&mut ctx.rng, now);
                if self.paths[0].peer_validated {
                    // Force revalidation of the active path too
                    self.paths[0].start_validation(&mut ctx.rng, now);
                }
                self.signal_send(flags::PATH_CHALLENGE);
            }
        } else if peer_updated_cid {
            // Peer rotated its CID; rotate ours in response unless we
            // started the rotation
            if !self.paths[path_id].initiated_cid_update {
                self.retire_current_dest_cid(ctx, now, path_id);
            } else {
                self.paths[path_id].initiated_cid_update = false;
            }
        }

        if non_probing && is_new_largest && path_id != 0 {
            self.set_path_active(path_id);
            let address = self.paths[0].remote;
            trace!(self.log, "peer address changed"; "remote" => %address);
            ctx.events
                .push_back((self.handle, Event::PeerAddressChanged { address }));
        }
    }

    fn set_path_active(&mut self, path_id: usize) {
        debug_assert!(path_id != 0 && path_id < self.paths.len());
        self.paths.swap(0, path_id);
        for entry in self.dest_cids.iter_mut() {
            entry.path = match entry.path {
                Some(0) => Some(path_id),
                Some(p) if p == path_id => Some(0),
                x => x,
            };
        }
    }

    /// Drop any non-active path that never produced a valid packet.
    fn prune_invalid_paths(&mut self) {
        let mut i = self.paths.len();
        while i > 1 {
            i -= 1;
            if self.paths[i].got_valid_packet {
                continue;
            }
            if let Some(seq) = self.paths[i].dest_cid_seq {
                if let Some(entry) = self.dest_cids.get_by_seq_mut(seq) {
                    entry.path = None;
                    entry.used_locally = false;
                }
            }
            self.paths.remove(i);
            for entry in self.dest_cids.iter_mut() {
                if let Some(p) = entry.path {
                    if p > i {
                        entry.path = Some(p - 1);
                    }
                }
            }
        }
    }

    fn retire_current_dest_cid(&mut self, ctx: &mut Context, now: u64, path_id: usize) -> bool {
        let current_seq = match self.paths[path_id].dest_cid_seq {
            Some(x) => x,
            None => {
                return false;
            }
        };
        if self
            .dest_cids
            .get_by_seq(current_seq)
            .map_or(false, |x| x.cid.is_empty())
        {
            trace!(self.log, "zero length CID, not retiring");
            return true;
        }
        let new_seq = match self.dest_cids.unused_seq() {
            Some(x) => x,
            None => {
                warn!(self.log, "no replacement CID available for retirement");
                return false;
            }
        };
        if let Some(old) = self.dest_cids.get_by_seq_mut(current_seq) {
            old.path = None;
        }
        self.dest_cids.retire(current_seq);
        self.signal_send(flags::RETIRE_CONNECTION_ID);
        {
            let entry = self.dest_cids.get_by_seq_mut(new_seq).unwrap();
            entry.used_locally = true;
            entry.path = Some(path_id);
        }
        self.paths[path_id].dest_cid_seq = Some(new_seq);
        self.stats.misc.dest_cid_update_count += 1;
        !self.retired_cid_limit_exceeded(ctx, now)
    }

    /// After a retire-prior-to sweep, every path whose CID was retired
    /// draws a replacement. A non-active path with none is removed; the
    /// active path with none is fatal.
    fn replace_retired_cids(&mut self, ctx: &mut Context, now: u64) -> bool {
        let mut i = 0;
        while i < self.paths.len() {
            let retired = match self.paths[i].dest_cid_seq {
                Some(seq) => self.dest_cids.get_by_seq(seq).map_or(true, |x| x.retired),
                None => false,
            };
            if !retired {
                i += 1;
                continue;
            }
            match self.dest_cids.unused_seq() {
                Some(seq) => {
                    {
                        let entry = self.dest_cids.get_by_seq_mut(seq).unwrap();
                        entry.used_locally = true;
                        entry.path = Some(i);
                    }
                    self.paths[i].dest_cid_seq = Some(seq);
                    self.paths[i].initiated_cid_update = true;
                    i += 1;
                }
                None => {
                    if i == 0 {
                        debug!(self.log, "active path has no replacement for retired CID");
                        self.silently_abort(ctx, now);
                        return false;
                    }
                    warn!(self.log, "non-active path has no replacement for retired CID");
                    self.paths.remove(i);
                    for entry in self.dest_cids.iter_mut() {
                        if let Some(p) = entry.path {
                            if p > i {
                                entry.path = Some(p - 1);
                            }
                        }
                    }
                }
            }
        }
        true
    }

    //
    // Source CID management
    //

    /// Draw a fresh source CID, retrying on collision with the binding's
    /// routing table.
    pub fn generate_new_source_cid(
        &mut self,
        ctx: &mut Context,
        now: u64,
        is_initial: bool,
    ) -> Option<ConnectionId> {
        if !self.state.share_binding {
            // Not sharing the binding means no CID is actually in use
            return None;
        }
        let mut tries = 0;
        let cid = loop {
            let cid = ConnectionId::random(&mut ctx.rng, ctx.config.local_cid_len);
            if !ctx.connection_ids.contains_key(&cid) {
                ctx.connection_ids.insert(cid, self.handle);
                break cid;
            }
            tries += 1;
            trace!(self.log, "CID collision, trying again");
            if tries > CID_MAX_COLLISION_RETRY {
                debug!(self.log, "too many CID collisions");
                self.fatal_error(ctx, now, Status::InternalError);
                return None;
            }
        };
        let mut token = [0; RESET_TOKEN_SIZE];
        ctx.rng.fill_bytes(&mut token);
        let needs_to_send = {
            let entry = self.source_cids.push(cid, token, is_initial);
            trace!(self.log, "new source CID"; "seq" => entry.sequence, "cid" => %cid);
            entry.needs_to_send
        };
        if needs_to_send {
            self.signal_send(flags::NEW_CONNECTION_ID);
        }
        Some(cid)
    }

    /// Top up (or, when rotating, fully replace) the source CIDs announced
    /// to the peer.
    pub fn generate_new_source_cids(
        &mut self,
        ctx: &mut Context,
        now: u64,
        replace_existing: bool,
    ) {
        if !self.state.share_binding {
            return;
        }
        let new_count = if replace_existing {
            self.source_cids.retire_all();
            usize::from(self.source_cid_limit)
        } else {
            usize::from(self.source_cid_limit).saturating_sub(self.source_cids.active_count())
        };
        for _ in 0..new_count {
            if self.generate_new_source_cid(ctx, now, false).is_none() {
                break;
            }
        }
    }

    //
    // Transport parameters
    //

    fn process_peer_transport_parameters(
        &mut self,
        ctx: &mut Context,
        now: u64,
        blob: &[u8],
    ) -> bool {
        let params = match TransportParameters::read(self.side, blob) {
            Ok(x) => x,
            Err(e) => {
                debug!(self.log, "invalid peer transport parameters"; "reason" => %e);
                self.transport_error(ctx, now, TransportError::TRANSPORT_PARAMETER_ERROR);
                return false;
            }
        };

        // The CIDs the parameters claim must match the CIDs the packets used
        let head_cid = self.dest_cids.head().map(|x| x.cid);
        if params.initial_source_cid != head_cid {
            debug!(self.log, "initial_source_connection_id mismatch");
            self.transport_error(ctx, now, TransportError::TRANSPORT_PARAMETER_ERROR);
            return false;
        }
        if self.side.is_client() {
            if params.original_destination_cid != Some(self.orig_dst_cid) {
                debug!(self.log, "original_destination_connection_id mismatch");
                self.transport_error(ctx, now, TransportError::TRANSPORT_PARAMETER_ERROR);
                return false;
            }
            let retry_ok = match (
                self.state.handshake_used_retry_packet,
                params.retry_source_cid,
            ) {
                (true, Some(cid)) => Some(cid) == self.retry_source_cid,
                (false, None) => true,
                _ => false,
            };
            if !retry_ok {
                debug!(self.log, "retry_source_connection_id mismatch");
                self.transport_error(ctx, now, TransportError::TRANSPORT_PARAMETER_ERROR);
                return false;
            }
        }

        if let Some(info) = params.version_information.clone() {
            if !self.process_version_info(ctx, now, &info) {
                return false;
            }
        }

        if let Some(token) = params.stateless_reset_token {
            if let Some(head) = self.dest_cids.head_mut() {
                head.reset_token = Some(token);
            }
        }
        self.streams.set_params(&params);
        self.source_cid_limit = cmp::min(
            u64::from(ACTIVE_CONNECTION_ID_LIMIT),
            params.active_connection_id_limit,
        ) as u8;
        if params.disable_1rtt_encryption && self.local_params.disable_1rtt_encryption {
            self.state.disable_1rtt_encryption = true;
        }
        if self.local_params.reliable_reset_enabled {
            ctx.events.push_back((
                self.handle,
                Event::ReliableResetNegotiated {
                    enabled: params.reliable_reset_enabled,
                },
            ));
        }
        if self.local_params.timestamp_send_enabled || self.local_params.timestamp_recv_enabled {
            ctx.events.push_back((
                self.handle,
                Event::OneWayDelayNegotiated {
                    send_enabled: self.local_params.timestamp_send_enabled
                        && params.timestamp_recv_enabled,
                    recv_enabled: self.local_params.timestamp_recv_enabled
                        && params.timestamp_send_enabled,
                },
            ));
        }
        self.peer_params = params;
        self.state.peer_transport_params_valid = true;
        trace!(self.log, "peer transport parameters valid");
        true
    }

    /// Version-information handling: servers attempt a compatible upgrade,
    /// clients enforce downgrade prevention.
    fn process_version_info(&mut self, ctx: &mut Context, now: u64, info: &VersionInfo) -> bool {
        if info.chosen == 0 {
            debug!(self.log, "version info chosen version is zero");
            self.transport_error(ctx, now, TransportError::TRANSPORT_PARAMETER_ERROR);
            return false;
        }
        if info.chosen != self.version {
            debug!(self.log, "version info chosen version doesn't match long header";
                   "chosen" => format!("{:#x}", info.chosen),
                   "current" => format!("{:#x}", self.version));
            self.transport_error(ctx, now, TransportError::TRANSPORT_PARAMETER_ERROR);
            return false;
        }
        if self.side.is_server() {
            let current_index = match SUPPORTED_VERSIONS.iter().position(|&v| v == self.version) {
                Some(x) => x,
                None => {
                    self.try_close(
                        ctx,
                        now,
                        close_flags::INTERNAL_SILENT,
                        Some(Status::VersionNegotiationError),
                        0,
                        &[],
                    );
                    return false;
                }
            };
            // Try to move to a version we prefer over the client's choice
            for &candidate in &SUPPORTED_VERSIONS[..current_index] {
                if is_reserved_version(candidate) {
                    continue;
                }
                for &available in &info.available {
                    if available == 0 {
                        debug!(self.log, "version info available versions contains zero");
                        self.transport_error(ctx, now, TransportError::TRANSPORT_PARAMETER_ERROR);
                        return false;
                    }
                    if !is_reserved_version(available)
                        && available == candidate
                        && are_versions_compatible(info.chosen, available)
                    {
                        trace!(self.log, "compatible version upgrade";
                               "old" => format!("{:#x}", self.version),
                               "new" => format!("{:#x}", candidate));
                        self.version = candidate;
                        self.on_version_set();
                        let basis = self.initial_key_basis();
                        self.crypto
                            .on_version_change(self.version, &basis, self.side);
                    }
                }
            }
            true
        } else {
            let mut client_chosen = 0u32;
            let mut original_found = false;
            for &available in &info.available {
                if available == 0 {
                    debug!(self.log, "version info available versions contains zero");
                    self.transport_error(ctx, now, TransportError::TRANSPORT_PARAMETER_ERROR);
                    return false;
                }
                if self.stats.version_negotiation
                    && client_chosen == 0
                    && is_supported_version(available)
                    && !is_reserved_version(available)
                {
                    client_chosen = available;
                }
                if self.original_version == available {
                    original_found = true;
                }
            }
            if client_chosen == 0 && is_supported_version(info.chosen) {
                client_chosen = info.chosen;
            }
            if client_chosen == 0
                || (client_chosen != self.original_version && client_chosen != info.chosen)
            {
                debug!(self.log, "downgrade prevention failed");
                self.transport_error(ctx, now, TransportError::VERSION_NEGOTIATION_ERROR);
                return false;
            }
            if let Some(previous) = self.previous_version {
                if previous == info.chosen {
                    debug!(self.log, "previous version is server chosen version");
                    self.transport_error(ctx, now, TransportError::VERSION_NEGOTIATION_ERROR);
                    return false;
                }
                if !is_reserved_version(previous) && info.available.contains(&previous) {
                    debug!(self.log, "version that caused negotiation is still available");
                    self.transport_error(ctx, now, TransportError::VERSION_NEGOTIATION_ERROR);
                    return false;
                }
            }
            if self.state.compatible_ver_neg_attempted {
                if !are_versions_compatible(self.original_version, info.chosen) {
                    debug!(self.log, "upgrade incompatible with original version");
                    self.transport_error(ctx, now, TransportError::VERSION_NEGOTIATION_ERROR);
                    return false;
                }
                if !original_found {
                    debug!(self.log, "original version missing from available versions");
                    self.transport_error(ctx, now, TransportError::VERSION_NEGOTIATION_ERROR);
                    return false;
                }
                self.state.compatible_ver_neg_completed = true;
                trace!(self.log, "compatible version upgrade complete";
                       "original" => format!("{:#x}", self.original_version),
                       "final" => format!("{:#x}", self.version));
            }
            true
        }
    }

    //
    // Handshake progress
    //

    /// Poll the TLS machine after feeding it: install parameters, surface
    /// events, drain outbound handshake data, and re-run deferred packets.
    fn post_crypto_progress(&mut self, ctx: &mut Context, now: u64) {
        if self.crypto.ticket_validation_pending {
            // Handshake progress is suspended until the app decides
            return;
        }
        if !self.state.peer_transport_params_valid {
            let blob = self
                .crypto
                .tls
                .peer_transport_parameters()
                .map(|x| x.to_vec());
            if let Some(blob) = blob {
                if !self.process_peer_transport_parameters(ctx, now, &blob) {
                    return;
                }
            }
        }

        self.crypto.poll_keys();

        if !self.state.connected
            && self.state.peer_transport_params_valid
            && !self.crypto.tls.is_handshaking()
        {
            self.state.connected = true;
            trace!(self.log, "connected");
            if let Some(cert) = self.crypto.tls.peer_certificate() {
                ctx.events
                    .push_back((self.handle, Event::PeerCertificateReceived { cert }));
            }
            let alpn = self.crypto.tls.alpn_protocol().map(|x| x.to_vec());
            ctx.events.push_back((self.handle, Event::Connected { alpn }));
            self.paths[0].set_valid();
            if self.side.is_server() {
                // The server confirms as soon as the handshake completes
                self.state.handshake_confirmed = true;
                self.signal_send(flags::HANDSHAKE_DONE);
                self.crypto.discard_keys(KeyType::Handshake);
                self.spaces[SpaceId::Handshake as usize]
                    .loss
                    .discard(&mut *self.cc);
                self.generate_new_source_cids(ctx, now, false);
                ctx.incoming_handshakes = ctx.incoming_handshakes.saturating_sub(1);
                ctx.incoming.push_back(self.handle);
            }
            self.reset_idle_timeout(ctx, now);
        }

        // Outbound handshake bytes become CRYPTO frames at their space
        let mut wrote = false;
        for space_id in SpaceId::iter() {
            let mut buf = Vec::new();
            self.crypto.tls.write_handshake(space_id, &mut buf);
            if buf.is_empty() {
                continue;
            }
            let space = &mut self.spaces[space_id as usize];
            let offset = space.crypto_send_offset;
            space.crypto_send_offset += buf.len() as u64;
            space.pending_crypto.push(frame::Crypto {
                offset,
                data: buf.into(),
            });
            wrote = true;
        }
        if wrote {
            self.signal_send(flags::CRYPTO);
        }

        if self.side.is_client() && self.state.peer_transport_params_valid {
            if let Some(tls_ticket) = self.crypto.tls.take_received_ticket() {
                let encoded =
                    ticket::encode_client_ticket(self.version, &self.peer_params, &tls_ticket);
                trace!(self.log, "resumption ticket received");
                ctx.events.push_back((
                    self.handle,
                    Event::ResumptionTicketReceived {
                        ticket: encoded.into_boxed_slice(),
                    },
                ));
            }
        }

        self.flush_deferred(ctx, now);
    }

    //
    // Close pipeline
    //

    /// The single close path. `close` says who is closing and how; `status`
    /// carries a local status in place of a wire error code.
    pub(crate) fn try_close(
        &mut self,
        ctx: &mut Context,
        now: u64,
        close: u32,
        status: Option<Status>,
        error_code: u64,
        reason: &[u8],
    ) {
        let closed_remotely = close & close_flags::REMOTE != 0;
        let mut silent = close & close_flags::SILENT != 0;

        if (closed_remotely && self.state.closed_remotely)
            || (!closed_remotely && self.state.closed_locally)
        {
            // Already closed in this direction
            if silent && self.state.closed_locally && !self.state.closed_remotely {
                self.state.process_shutdown_complete = true;
            }
            return;
        }

        let mut is_first_close = true;
        if closed_remotely && !self.state.closed_locally {
            // Peer closed first
            if !self.state.connected && self.side.is_client() {
                // A rejected connection attempt skips the draining period
                silent = true;
            }
            if !silent {
                let drain = cmp::max(15_000, 2 * self.paths[0].rtt.smoothed_or_initial());
                self.timer_set(ctx, TimerType::Shutdown, now, drain);
                self.signal_send(flags::CONNECTION_CLOSE);
            }
        } else if !closed_remotely && !self.state.closed_remotely {
            // Locally closed first: wait out the closing period
            if !silent {
                let pto = self.paths[0]
                    .rtt
                    .probe_timeout(self.peer_max_ack_delay_us(), CLOSE_PTO_COUNT);
                self.timer_set(ctx, TimerType::Shutdown, now, pto);
                let flag = if close & close_flags::APPLICATION != 0 {
                    flags::APPLICATION_CLOSE
                } else {
                    flags::CONNECTION_CLOSE
                };
                self.signal_send(flag);
            }
        } else {
            trace!(self.log, "connection close complete");
            // Second direction closed
            if self.side.is_client() {
                // Clients clean up immediately; socket teardown handles any
                // leftover packets
            } else if !silent {
                let drain = cmp::max(15_000, 2 * self.paths[0].rtt.smoothed_or_initial());
                self.timer_set(ctx, TimerType::Shutdown, now, drain);
            }
            is_first_close = false;
        }

        if closed_remotely {
            self.state.closed_remotely = true;
        } else {
            self.state.closed_locally = true;
        }

        if is_first_close {
            self.state.shutdown_complete_timed_out = true;

            for ty in TimerType::all() {
                if ty != TimerType::Shutdown {
                    self.timer_cancel(ctx, ty);
                }
            }

            match status {
                Some(s) => {
                    self.close_status = Some(s);
                    self.close_error_code = TransportError::INTERNAL_ERROR.0;
                }
                None => {
                    debug_assert!(error_code <= VAR_INT_MAX);
                    self.close_error_code = error_code;
                    self.close_status = Some(if close & close_flags::APPLICATION != 0 {
                        Status::Aborted
                    } else {
                        if TransportError(error_code).is_protocol_error() {
                            LIBRARY
                                .counters
                                .conn_protocol_errors
                                .fetch_add(1, ::std::sync::atomic::Ordering::Relaxed);
                        }
                        Status::from_error_code(error_code)
                    });
                }
            }

            if close & close_flags::APPLICATION != 0 {
                self.state.app_closed = true;
            }

            if close & close_flags::SEND_NOTIFICATION != 0 && self.state.external_owner {
                if closed_remotely && close & close_flags::APPLICATION != 0 {
                    ctx.events
                        .push_back((self.handle, Event::ShutdownInitiatedByPeer { error_code }));
                } else {
                    ctx.events.push_back((
                        self.handle,
                        Event::ShutdownInitiatedByTransport {
                            status: self.close_status.unwrap(),
                            error_code: self.close_error_code,
                        },
                    ));
                }
            }

            self.close_reason = if reason.is_empty() {
                None
            } else {
                let bounded = &reason[..cmp::min(reason.len(), MAX_CLOSE_REASON_LENGTH)];
                Some(String::from_utf8_lossy(bounded).into_owned())
            };

            if self.state.started {
                self.log_statistics();
            }

            self.streams.shutdown();
        }

        if silent {
            self.send.clear();
        }
        if silent || (self.state.closed_remotely && self.state.closed_locally) {
            self.state.shutdown_complete_timed_out = false;
            self.state.process_shutdown_complete = true;
        }
    }

    fn transport_error(&mut self, ctx: &mut Context, now: u64, error: TransportError) {
        self.try_close(ctx, now, close_flags::INTERNAL, None, error.0, &[]);
    }

    fn fatal_error(&mut self, ctx: &mut Context, now: u64, status: Status) {
        self.try_close(ctx, now, close_flags::INTERNAL_SILENT, Some(status), 0, &[]);
    }

    /// Abandon the connection without telling the peer anything.
    fn silently_abort(&mut self, ctx: &mut Context, now: u64) {
        self.fatal_error(ctx, now, Status::Aborted);
    }

    fn on_shutdown_complete(&mut self, ctx: &mut Context) {
        if self.state.shutdown_complete {
            return;
        }
        self.state.shutdown_complete = true;
        self.state.process_shutdown_complete = false;
        for ty in TimerType::all() {
            self.timer_cancel(ctx, ty);
        }
        trace!(self.log, "shutdown complete";
               "timed_out" => self.state.shutdown_complete_timed_out);
        if self.state.external_owner {
            ctx.events.push_back((
                self.handle,
                Event::ShutdownComplete {
                    handshake_completed: self.state.connected,
                    peer_acknowledged_shutdown: !self.state.shutdown_complete_timed_out,
                    app_close_in_progress: self.state.handle_closed,
                },
            ));
        }
    }

    fn log_statistics(&self) {
        info!(self.log, "connection statistics";
              "correlation" => self.stats.correlation_id,
              "srtt_us" => self.paths[0].rtt.smoothed,
              "recv_datagrams" => self.stats.recv.total_datagrams,
              "recv_dropped" => self.stats.recv.dropped_packets,
              "recv_duplicates" => self.stats.recv.duplicate_packets,
              "send_packets" => self.stats.send.total_packets);
    }

    fn trace_rundown(&self) {
        debug!(self.log, "rundown";
               "version" => format!("{:#x}", self.version),
               "started" => self.state.started,
               "connected" => self.state.connected,
               "shutdown" => self.state.shutdown_complete,
               "paths" => self.paths.len(),
               "source_cids" => self.source_cids.len(),
               "recv_queue_bytes" => self.recv_queue_bytes);
    }

    //
    // Timers
    //

    fn timer_set(&mut self, ctx: &mut Context, ty: TimerType, now: u64, delay: u64) {
        if self.timers.set(ty, now, delay) {
            ctx.io.push_back(Io::TimerUpdate {
                connection: self.handle,
                time: self.timers.next_expiration(),
            });
        }
    }

    fn timer_set_absolute(&mut self, ctx: &mut Context, ty: TimerType, time: u64) {
        if self.timers.set_absolute(ty, time) {
            ctx.io.push_back(Io::TimerUpdate {
                connection: self.handle,
                time: self.timers.next_expiration(),
            });
        }
    }

    fn timer_cancel(&mut self, ctx: &mut Context, ty: TimerType) {
        if self.timers.cancel(ty) {
            ctx.io.push_back(Io::TimerUpdate {
                connection: self.handle,
                time: self.timers.next_expiration(),
            });
        }
    }

    /// The worker's timer wheel fired. Ack-delay and pacing flush sends
    /// inline; everything else goes through the operation queue. Returns
    /// true when the connection must be scheduled.
    pub fn on_timer_wheel_fire(&mut self, ctx: &mut Context, now: u64) -> bool {
        let expired = self.timers.take_expired(now);
        if !expired.is_empty() {
            ctx.io.push_back(Io::TimerUpdate {
                connection: self.handle,
                time: self.timers.next_expiration(),
            });
        }
        let mut needs_schedule = false;
        for ty in expired {
            match ty {
                TimerType::AckDelay | TimerType::Pacing => {
                    self.send.set_flag(flags::ACK);
                    self.flush_send(ctx, now);
                }
                _ => {
                    needs_schedule |= self.oper_queue.enqueue(Operation::TimerExpired(ty));
                }
            }
        }
        needs_schedule
    }

    fn process_expired_timer(&mut self, ctx: &mut Context, now: u64, ty: TimerType) {
        trace!(self.log, "timer expired"; "type" => ty);
        match ty {
            TimerType::Idle => {
                self.try_close(
                    ctx,
                    now,
                    close_flags::INTERNAL_SILENT,
                    Some(Status::ConnectionIdle),
                    0,
                    &[],
                );
            }
            TimerType::KeepAlive => {
                self.signal_send(flags::PING);
                if self.keep_alive_interval != 0 {
                    self.timer_set(ctx, TimerType::KeepAlive, now, self.keep_alive_interval);
                }
            }
            TimerType::LossDetection => {
                self.process_loss_detection_timeout(ctx, now);
            }
            TimerType::Shutdown => {
                // The peer never acknowledged our close; stop waiting
                self.state.closed_remotely = true;
                self.state.process_shutdown_complete = true;
            }
            TimerType::AckDelay | TimerType::Pacing => {
                self.send.set_flag(flags::ACK);
                self.flush_send(ctx, now);
            }
        }
    }

    fn process_loss_detection_timeout(&mut self, ctx: &mut Context, now: u64) {
        let mut lost_flags = 0;
        let mut probe = false;
        for space_id in SpaceId::iter() {
            let due = {
                let space = &self.spaces[space_id as usize];
                space.loss.loss_time.map_or(false, |t| t <= now)
            };
            if due {
                let lost = {
                    let rtt = self.paths[0].rtt.clone();
                    let space = &mut self.spaces[space_id as usize];
                    space.loss.detect_lost_packets(now, &rtt, &mut *self.cc)
                };
                for (_, info) in lost {
                    lost_flags |= info.retransmits.flags;
                    if !info.retransmits.crypto.is_empty() {
                        lost_flags |= flags::CRYPTO;
                        self.spaces[space_id as usize]
                            .pending_crypto
                            .extend(info.retransmits.crypto);
                    }
                }
            } else if !self.spaces[space_id as usize].loss.sent_packets.is_empty() {
                self.spaces[space_id as usize].loss.on_probe_timeout();
                probe = true;
            }
        }
        if lost_flags != 0 {
            self.signal_send(lost_flags);
        }
        if probe {
            self.signal_send(flags::PING);
        }
        let timeout = self.spaces[SpaceId::Data as usize]
            .loss
            .next_timeout(&self.paths[0].rtt, self.peer_max_ack_delay_us());
        if let Some(t) = timeout {
            self.timer_set_absolute(ctx, TimerType::LossDetection, t);
        }
    }

    fn process_unreachable(&mut self, ctx: &mut Context, now: u64, remote: SocketAddrV6) {
        // Only meaningful before the peer has proven it can reach us
        if self.state.handshake_confirmed || self.state.got_first_server_response {
            trace!(self.log, "ignoring unreachable"; "remote" => %remote);
            return;
        }
        debug!(self.log, "peer unreachable"; "remote" => %remote);
        self.try_close(
            ctx,
            now,
            close_flags::INTERNAL_SILENT,
            Some(Status::Unreachable),
            0,
            &[],
        );
    }

    fn idle_timeout_us(&self) -> u64 {
        let ms = if self.state.connected {
            let local = self.local_params.max_idle_timeout;
            let peer = self.peer_params.max_idle_timeout;
            match (local, peer) {
                (0, x) | (x, 0) => x,
                (a, b) => cmp::min(a, b),
            }
        } else {
            self.handshake_idle_ms
        };
        ms * 1_000
    }

    fn reset_idle_timeout(&mut self, ctx: &mut Context, now: u64) {
        if self.is_closed() {
            return;
        }
        let timeout = self.idle_timeout_us();
        if timeout != 0 {
            // Never shorter than the time we'd spend waiting out a close
            let floor = self.paths[0]
                .rtt
                .probe_timeout(self.peer_max_ack_delay_us(), CLOSE_PTO_COUNT);
            self.timer_set(ctx, TimerType::Idle, now, cmp::max(timeout, floor));
        }
        if self.keep_alive_interval != 0 && self.state.connected {
            self.timer_set(ctx, TimerType::KeepAlive, now, self.keep_alive_interval);
        }
    }

    fn peer_max_ack_delay_us(&self) -> u64 {
        self.peer_params.max_ack_delay * 1_000
    }

    fn local_max_ack_delay_us(&self) -> u64 {
        self.local_params.max_ack_delay * 1_000
    }

    //
    // Send signaling and packet assembly
    //

    fn signal_send(&mut self, flag: u32) -> bool {
        if self.send.set_flag(flag) {
            self.send.flush_pending = true;
            self.oper_queue.enqueue(Operation::FlushSend)
        } else {
            false
        }
    }

    /// Assemble and emit packets for the pending send flags. Returns true
    /// when all signaled work was flushed.
    fn flush_send(&mut self, ctx: &mut Context, now: u64) -> bool {
        if self.state.shutdown_complete {
            return true;
        }
        if self
            .send
            .has_flag(flags::CONNECTION_CLOSE | flags::APPLICATION_CLOSE)
        {
            let app = self.send.has_flag(flags::APPLICATION_CLOSE);
            self.send
                .clear_flag(flags::CONNECTION_CLOSE | flags::APPLICATION_CLOSE);
            self.send_close_packet(ctx, now, app);
            return true;
        }

        for space_id in SpaceId::iter() {
            let key_type = match space_id {
                SpaceId::Initial => KeyType::Initial,
                SpaceId::Handshake => KeyType::Handshake,
                SpaceId::Data => KeyType::OneRtt,
            };
            if self.crypto.write_keys(key_type).is_none() {
                continue;
            }
            let mut payload = Vec::new();
            let mut retransmits = Retransmits::default();
            {
                let space = &mut self.spaces[space_id as usize];
                for c in space.pending_crypto.drain(..) {
                    c.encode(&mut payload);
                    retransmits.crypto.push(c);
                }
                if !space.recvd.is_empty() {
                    let delay = now.saturating_sub(space.largest_recv_time);
                    frame::Ack::encode(delay >> 3, &space.recvd, &mut payload);
                }
            }
            if space_id == SpaceId::Data {
                self.append_one_rtt_frames(&mut payload, &mut retransmits);
            }
            if payload.is_empty() {
                continue;
            }
            let ack_only = retransmits.flags == 0 && retransmits.crypto.is_empty();
            self.send_packet(ctx, now, space_id, payload, ack_only, 0, retransmits);
        }
        self.send.clear_flag(flags::ACK | flags::CRYPTO);
        self.timer_cancel(ctx, TimerType::AckDelay);

        if self
            .send
            .has_flag(flags::PATH_CHALLENGE | flags::PATH_RESPONSE)
        {
            self.send
                .clear_flag(flags::PATH_CHALLENGE | flags::PATH_RESPONSE);
            self.send_path_frames(ctx, now);
        }
        true
    }

    fn append_one_rtt_frames(&mut self, payload: &mut Vec<u8>, retransmits: &mut Retransmits) {
        if self.send.has_flag(flags::PING) {
            self.send.clear_flag(flags::PING);
            payload.write_var(Type::PING.0);
            retransmits.flags |= flags::PING;
        }
        if self.send.has_flag(flags::HANDSHAKE_DONE) {
            self.send.clear_flag(flags::HANDSHAKE_DONE);
            payload.write_var(Type::HANDSHAKE_DONE.0);
            retransmits.flags |= flags::HANDSHAKE_DONE;
        }
        if self.send.has_flag(flags::NEW_CONNECTION_ID) {
            self.send.clear_flag(flags::NEW_CONNECTION_ID);
            let retire_prior_to = self
                .source_cids
                .iter()
                .filter(|x| x.retired)
                .map(|x| x.sequence + 1)
                .max()
                .unwrap_or(0);
            let pending: Vec<frame::NewConnectionId> = self
                .source_cids
                .iter()
                .filter(|x| x.needs_to_send && !x.retired)
                .map(|x| frame::NewConnectionId {
                    sequence: x.sequence,
                    retire_prior_to,
                    cid: x.cid,
                    reset_token: x.reset_token,
                })
                .collect();
            for f in &pending {
                f.encode(payload);
                if let Some(entry) = self.source_cids.get_by_seq(f.sequence) {
                    entry.needs_to_send = false;
                }
            }
            if !pending.is_empty() {
                retransmits.flags |= flags::NEW_CONNECTION_ID;
            }
        }
        if self.send.has_flag(flags::RETIRE_CONNECTION_ID) {
            self.send.clear_flag(flags::RETIRE_CONNECTION_ID);
            let pending = self.dest_cids.pending_retirement();
            for &sequence in &pending {
                payload.write_var(Type::RETIRE_CONNECTION_ID.0);
                payload.write_var(sequence);
                if let Some(entry) = self.dest_cids.get_by_seq_mut(sequence) {
                    entry.needs_to_send = false;
                }
            }
            if !pending.is_empty() {
                retransmits.flags |= flags::RETIRE_CONNECTION_ID;
            }
        }
    }

    fn send_path_frames(&mut self, ctx: &mut Context, now: u64) {
        for i in 0..self.paths.len() {
            let mut payload = Vec::new();
            let mut retransmits = Retransmits::default();
            if self.paths[i].send_challenge {
                payload.write_var(Type::PATH_CHALLENGE.0);
                let challenge = self.paths[i].challenge;
                payload.extend_from_slice(&challenge);
                retransmits.flags |= flags::PATH_CHALLENGE;
            }
            if self.paths[i].send_response {
                self.paths[i].send_response = false;
                payload.write_var(Type::PATH_RESPONSE.0);
                let response = self.paths[i].response;
                payload.extend_from_slice(&response);
                retransmits.flags |= flags::PATH_RESPONSE;
            }
            if !payload.is_empty() {
                self.send_packet(ctx, now, SpaceId::Data, payload, false, i, retransmits);
            }
        }
    }

    fn send_close_packet(&mut self, ctx: &mut Context, now: u64, app: bool) {
        let space_id = if self.crypto.write_keys(KeyType::OneRtt).is_some() {
            SpaceId::Data
        } else if self.crypto.write_keys(KeyType::Handshake).is_some() {
            SpaceId::Handshake
        } else if self.crypto.write_keys(KeyType::Initial).is_some() {
            SpaceId::Initial
        } else {
            return;
        };
        let mut payload = Vec::new();
        let max_len = usize::from(self.paths[0].mtu);
        let reason = self
            .close_reason
            .as_ref()
            .map(|x| Bytes::from(x.as_bytes().to_vec()))
            .unwrap_or_else(Bytes::new);
        // An application close must not leak application state before the
        // handshake completes
        if app && space_id == SpaceId::Data {
            frame::ApplicationClose {
                error_code: self.close_error_code,
                reason,
            }
            .encode(&mut payload, max_len);
        } else {
            frame::ConnectionClose {
                error_code: if app {
                    TransportError::APPLICATION_ERROR
                } else {
                    TransportError(self.close_error_code)
                },
                frame_type: None,
                reason,
            }
            .encode(&mut payload, max_len);
        }
        self.send_packet(ctx, now, space_id, payload, true, 0, Retransmits::default());
    }

    fn path_dest_cid(&self, path_id: usize) -> ConnectionId {
        self.paths[path_id]
            .dest_cid_seq
            .and_then(|seq| self.dest_cids.get_by_seq(seq))
            .map(|x| x.cid)
            .unwrap_or_else(|| self.dest_cids.head().map(|x| x.cid).unwrap())
    }

    fn send_packet(
        &mut self,
        ctx: &mut Context,
        now: u64,
        space_id: SpaceId,
        mut payload: Vec<u8>,
        ack_only: bool,
        path_id: usize,
        retransmits: Retransmits,
    ) {
        let key_type = match space_id {
            SpaceId::Initial => KeyType::Initial,
            SpaceId::Handshake => KeyType::Handshake,
            SpaceId::Data => KeyType::OneRtt,
        };
        if self.crypto.write_keys(key_type).is_none() {
            return;
        }
        let dst_cid = self.path_dest_cid(path_id);
        let src_cid = self.source_cids.initial().map(|x| x.cid).unwrap();
        let (pn, largest_acked) = {
            let loss = &mut self.spaces[space_id as usize].loss;
            let largest_acked = loss.largest_acked.unwrap_or(0);
            (loss.next_packet_number(), largest_acked)
        };
        let number = PacketNumber::new(pn, largest_acked);
        let header = match space_id {
            SpaceId::Initial => Header::Initial {
                version: self.version,
                src_cid,
                dst_cid,
                token: self.send.initial_token.clone(),
                number,
            },
            SpaceId::Handshake => Header::Long {
                ty: LongType::Handshake,
                version: self.version,
                src_cid,
                dst_cid,
                number,
            },
            SpaceId::Data => Header::Short {
                dst_cid,
                number,
                key_phase: self.spaces[SpaceId::Data as usize].current_key_phase,
            },
        };
        // Leave enough ciphertext past the number for the peer's HP sample
        while payload.len() < 8 {
            payload.push(0);
        }
        let mut buf = Vec::with_capacity(payload.len() + 64);
        let partial = header.encode(&mut buf);
        let header_len = buf.len();
        buf.extend_from_slice(&payload);
        let tag_len = {
            let keys = self.crypto.write_keys(key_type).unwrap();
            keys.packet.tag_len()
        };
        if space_id == SpaceId::Initial && self.side.is_client() && buf.len() < MIN_INITIAL_SIZE - tag_len
        {
            buf.resize(MIN_INITIAL_SIZE - tag_len, 0);
        }
        if !self.paths[path_id].on_bytes_sent((buf.len() + tag_len) as u64) {
            trace!(self.log, "send blocked by amplification limit");
            return;
        }
        {
            let keys = self.crypto.write_keys(key_type).unwrap();
            keys.packet.encrypt(pn, &mut buf, header_len);
            partial.finish(&mut buf, &*keys.header, header_len);
        }
        self.stats.send.total_packets += 1;
        self.stats.send.total_bytes += buf.len() as u64;
        if !ack_only {
            self.stats.send.retransmittable_packets += 1;
        }
        let sent = SentPacket {
            time: now,
            bytes: if ack_only { 0 } else { buf.len() as u16 },
            ack_eliciting: !ack_only,
            acks: RangeSet::new(),
            retransmits,
        };
        self.spaces[space_id as usize]
            .loss
            .on_packet_sent(now, pn, sent, &mut *self.cc);
        trace!(self.log, "sending packet"; "pn" => pn, "space" => ?space_id, "bytes" => buf.len());
        ctx.io.push_back(Io::Transmit {
            destination: self.paths[path_id].remote,
            packet: buf.into_boxed_slice(),
        });
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Connection")
            .field("handle", &self.handle)
            .field("side", &self.side)
            .field("version", &self.version)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crypto::testing::{FakeSession, NullHeaderKey, HANDSHAKE_TAG, INITIAL_TAG, ONE_RTT_TAG, TAG_LEN};
    use endpoint::Config;
    use fnv::{FnvHashMap, FnvHashSet};
    use rand::rngs::OsRng;
    use std::net::Ipv6Addr;

    const LOCAL_CID: [u8; 8] = [0x11; 8];
    const INIT_DCID: [u8; 8] = [0x77; 8];

    fn logger() -> Logger {
        Logger::root(::slog::Discard, o!())
    }

    fn test_ctx() -> Context {
        Context {
            rng: OsRng::new().unwrap(),
            config: Arc::new(Config::default()),
            io: VecDeque::new(),
            events: VecDeque::new(),
            incoming: VecDeque::new(),
            incoming_handshakes: 0,
            dirty_conns: FnvHashSet::default(),
            connection_ids: FnvHashMap::default(),
        }
    }

    fn remote_addr() -> SocketAddrV6 {
        SocketAddrV6::new(Ipv6Addr::LOCALHOST, 4433, 0, 0)
    }

    fn configuration() -> Arc<Configuration> {
        Arc::new(Configuration {
            alpn: vec![b"h3".to_vec()],
            resumption_enabled: true,
        })
    }

    fn client(ctx: &mut Context, session: FakeSession) -> Connection {
        let mut conn = Connection::new(
            logger(),
            ctx,
            ConnectionHandle(0),
            Side::Client,
            remote_addr(),
            ConnectionId::new(&INIT_DCID),
            ConnectionId::new(&LOCAL_CID),
            ConnectionId::new(&INIT_DCID),
            Box::new(session),
            ::VERSION_1,
            0,
        );
        conn.start(ctx, 0, configuration(), "example.com").unwrap();
        conn
    }

    /// A client that already finished its handshake with 1-RTT keys.
    fn connected_client(ctx: &mut Context) -> Connection {
        let mut session = FakeSession::new(Side::Client);
        session.stage_keys(KeyType::OneRtt);
        let mut conn = client(ctx, session);
        conn.crypto.poll_keys();
        conn.state.connected = true;
        conn.state.handshake_confirmed = true;
        conn
    }

    /// Encode a packet and seal it with the test AEAD's constant tag.
    fn seal(header: Header, frames: &[u8], tag: u8) -> BytesMut {
        let mut buf = Vec::new();
        let partial = header.encode(&mut buf);
        let header_len = buf.len();
        buf.extend_from_slice(frames);
        // Room for the header-protection sample on receive
        while buf.len() < header_len + 4 {
            buf.push(0);
        }
        buf.extend_from_slice(&[tag; TAG_LEN]);
        partial.finish(&mut buf, &NullHeaderKey, header_len);
        BytesMut::from(&buf[..])
    }

    fn one_rtt(pn: u64, frames: &[u8]) -> BytesMut {
        seal(
            Header::Short {
                dst_cid: ConnectionId::new(&LOCAL_CID),
                number: PacketNumber::new(pn, 0),
                key_phase: false,
            },
            frames,
            ONE_RTT_TAG,
        )
    }

    fn handshake(pn: u64, frames: &[u8]) -> BytesMut {
        seal(
            Header::Long {
                ty: LongType::Handshake,
                version: ::VERSION_1,
                src_cid: ConnectionId::new(&INIT_DCID),
                dst_cid: ConnectionId::new(&LOCAL_CID),
                number: PacketNumber::new(pn, 0),
            },
            frames,
            HANDSHAKE_TAG,
        )
    }

    fn drain(conn: &mut Connection, ctx: &mut Context, now: u64) {
        while conn.drain_operations(ctx, now) {}
    }

    fn shutdown_complete_event(ctx: &Context) -> Option<(bool, bool)> {
        ctx.events
            .iter()
            .filter_map(|&(_, ref e)| match *e {
                Event::ShutdownComplete {
                    handshake_completed,
                    peer_acknowledged_shutdown,
                    ..
                } => Some((handshake_completed, peer_acknowledged_shutdown)),
                _ => None,
            })
            .next()
    }

    #[test]
    fn retry_rotates_cid_and_caches_token() {
        let mut ctx = test_ctx();
        let mut conn = client(&mut ctx, FakeSession::new(Side::Client));
        let header = Header::Retry {
            version: ::VERSION_1,
            src_cid: ConnectionId::new(&[0x51; 8]),
            dst_cid: ConnectionId::new(&LOCAL_CID),
        };
        let mut buf = Vec::new();
        header.encode(&mut buf);
        buf.extend_from_slice(&[1, 2, 3, 4, 5]); // token
        buf.extend_from_slice(&[0xee; 16]); // integrity tag
        conn.queue_recv_packet(remote_addr(), BytesMut::from(&buf[..]));
        drain(&mut conn, &mut ctx, 1_000);

        assert_eq!(&conn.send.initial_token[..], &[1, 2, 3, 4, 5]);
        assert_eq!(
            conn.dest_cids.head().unwrap().cid,
            ConnectionId::new(&[0x51; 8])
        );
        assert!(conn.state.handshake_used_retry_packet);
        assert!(conn.state.got_first_server_response);
        assert!(conn.stats.stateless_retry);
        assert_eq!(conn.retry_source_cid, Some(ConnectionId::new(&[0x51; 8])));
        // No application event fires for a retry
        assert!(ctx.events.iter().all(|&(_, ref e)| match *e {
            Event::Connected { .. } => false,
            _ => true,
        }));
    }

    #[test]
    fn version_negotiation_no_match_closes_silently() {
        let mut ctx = test_ctx();
        let mut conn = client(&mut ctx, FakeSession::new(Side::Client));
        let header = Header::VersionNegotiate {
            random: 7,
            src_cid: ConnectionId::new(&INIT_DCID),
            dst_cid: ConnectionId::new(&LOCAL_CID),
        };
        let mut buf = Vec::new();
        header.encode(&mut buf);
        buf.extend_from_slice(&[0, 0, 0, 5, 0, 0, 0, 6]); // versions 0x5, 0x6
        conn.queue_recv_packet(remote_addr(), BytesMut::from(&buf[..]));
        drain(&mut conn, &mut ctx, 1_000);

        assert_eq!(conn.close_status, Some(Status::VersionNegotiationError));
        assert!(conn.state.shutdown_complete);
        assert_eq!(conn.send.flags(), 0);
        assert_eq!(shutdown_complete_event(&ctx), Some((false, true)));
    }

    #[test]
    fn stateless_reset_closes_silently_with_aborted() {
        let mut ctx = test_ctx();
        let mut conn = connected_client(&mut ctx);
        let token = [0x99; RESET_TOKEN_SIZE];
        conn.dest_cids.head_mut().unwrap().reset_token = Some(token);

        let header = Header::Short {
            dst_cid: ConnectionId::new(&LOCAL_CID),
            number: PacketNumber::U8(3),
            key_phase: false,
        };
        let mut buf = Vec::new();
        let partial = header.encode(&mut buf);
        let header_len = buf.len();
        buf.extend_from_slice(&[0xab; 24]); // garbage that fails the AEAD
        buf.extend_from_slice(&token);
        partial.finish(&mut buf, &NullHeaderKey, header_len);
        conn.queue_recv_packet(remote_addr(), BytesMut::from(&buf[..]));
        drain(&mut conn, &mut ctx, 1_000);

        assert_eq!(conn.close_status, Some(Status::Aborted));
        assert!(conn.state.shutdown_complete);
        assert_eq!(conn.send.flags(), 0);
        assert_eq!(conn.stats.recv.decryption_failures, 0);
    }

    #[test]
    fn duplicate_packet_is_counted_once() {
        let mut ctx = test_ctx();
        let mut session = FakeSession::new(Side::Client);
        session.stage_keys(KeyType::Handshake);
        let mut conn = client(&mut ctx, session);
        conn.crypto.poll_keys();

        // An ack-eliciting packet gets our handshake ack packet 0 sent
        conn.queue_recv_packet(remote_addr(), handshake(0, &[0x01]));
        drain(&mut conn, &mut ctx, 1_000);
        assert!(conn.stats.send.total_packets > 0);

        // Two copies of the same packet, both acking our packet 0
        let mut ranges = RangeSet::new();
        ranges.insert_one(0);
        let mut ack = Vec::new();
        frame::Ack::encode(0, &ranges, &mut ack);
        conn.queue_recv_packet(remote_addr(), handshake(1, &ack));
        conn.queue_recv_packet(remote_addr(), handshake(1, &ack));
        drain(&mut conn, &mut ctx, 2_000);

        assert_eq!(conn.stats.recv.duplicate_packets, 1);
        assert!(conn.close_status.is_none());
        assert!(conn.paths[0].rtt.got_first_sample);
    }

    #[test]
    fn retire_limit_overflow_aborts_silently() {
        let mut ctx = test_ctx();
        let mut conn = connected_client(&mut ctx);
        for seq in 1..=40u64 {
            let ncid = frame::NewConnectionId {
                sequence: seq,
                retire_prior_to: seq,
                cid: ConnectionId::new(&[seq as u8; 8]),
                reset_token: [seq as u8; RESET_TOKEN_SIZE],
            };
            let mut fbuf = Vec::new();
            ncid.encode(&mut fbuf);
            conn.queue_recv_packet(remote_addr(), one_rtt(seq, &fbuf));
        }
        drain(&mut conn, &mut ctx, 1_000);

        assert!(conn.dest_cids.retired_count > 8 * u64::from(ACTIVE_CONNECTION_ID_LIMIT));
        assert_eq!(conn.close_status, Some(Status::Aborted));
        assert!(conn.state.shutdown_complete);
        assert_eq!(conn.send.flags(), 0);
    }

    #[test]
    fn compatible_version_upgrade_completes() {
        let mut ctx = test_ctx();
        let mut session = FakeSession::new(Side::Client);
        let server_cid = ConnectionId::new(&[0x52; 8]);
        let mut tp = TransportParameters::default();
        tp.initial_max_data = 1 << 16;
        tp.initial_source_cid = Some(server_cid);
        tp.original_destination_cid = Some(ConnectionId::new(&INIT_DCID));
        tp.version_information = Some(VersionInfo {
            chosen: ::VERSION_2,
            available: vec![::VERSION_1, ::VERSION_2],
        });
        let mut blob = Vec::new();
        tp.write(Side::Server, &mut blob);
        session.pending_peer_params = Some(blob);
        let mut conn = client(&mut ctx, session);

        let crypto_frame = frame::Crypto {
            offset: 0,
            data: Bytes::from(&b"server-hello"[..]),
        };
        let mut fbuf = Vec::new();
        crypto_frame.encode(&mut fbuf);
        let packet = seal(
            Header::Initial {
                version: ::VERSION_2,
                src_cid: server_cid,
                dst_cid: ConnectionId::new(&LOCAL_CID),
                token: Bytes::new(),
                number: PacketNumber::U8(0),
            },
            &fbuf,
            INITIAL_TAG,
        );
        conn.queue_recv_packet(remote_addr(), packet);
        drain(&mut conn, &mut ctx, 1_000);

        assert!(conn.state.compatible_ver_neg_attempted);
        assert!(conn.state.compatible_ver_neg_completed);
        assert_eq!(conn.version(), ::VERSION_2);
        assert_eq!(conn.original_version, ::VERSION_1);
        assert!(conn.close_status.is_none());
        assert_eq!(conn.dest_cids.head().unwrap().cid, server_cid);
    }

    #[test]
    fn local_close_then_peer_close_completes_shutdown() {
        let mut ctx = test_ctx();
        let mut conn = connected_client(&mut ctx);
        conn.shutdown(0, 42);
        drain(&mut conn, &mut ctx, 1_000);
        assert!(conn.state.closed_locally);
        assert!(!conn.state.shutdown_complete);
        assert!(conn.state.app_closed);
        // The close packet went out
        assert!(ctx.io.iter().any(|io| match *io {
            Io::Transmit { .. } => true,
            _ => false,
        }));

        let mut fbuf = Vec::new();
        frame::ConnectionClose {
            error_code: TransportError::NO_ERROR,
            frame_type: None,
            reason: Bytes::new(),
        }
        .encode(&mut fbuf, 128);
        conn.queue_recv_packet(remote_addr(), one_rtt(0, &fbuf));
        drain(&mut conn, &mut ctx, 2_000);

        assert!(conn.state.closed_remotely);
        assert!(conn.state.shutdown_complete);
        assert_eq!(shutdown_complete_event(&ctx), Some((true, true)));
    }

    #[test]
    fn idle_timer_closes_with_connection_idle() {
        let mut ctx = test_ctx();
        let mut conn = client(&mut ctx, FakeSession::new(Side::Client));
        drain(&mut conn, &mut ctx, 0);
        assert!(conn.on_timer_wheel_fire(&mut ctx, 1 << 40));
        drain(&mut conn, &mut ctx, 1 << 40);
        assert_eq!(conn.close_status, Some(Status::ConnectionIdle));
        assert!(conn.state.shutdown_complete);
    }

    #[test]
    fn peer_app_close_raises_peer_shutdown_event() {
        let mut ctx = test_ctx();
        let mut conn = connected_client(&mut ctx);
        let mut fbuf = Vec::new();
        frame::ApplicationClose {
            error_code: 7,
            reason: Bytes::from(&b"done"[..]),
        }
        .encode(&mut fbuf, 128);
        conn.queue_recv_packet(remote_addr(), one_rtt(0, &fbuf));
        drain(&mut conn, &mut ctx, 1_000);

        assert!(conn.state.closed_remotely);
        assert_eq!(conn.close_reason.as_ref().map(|x| &x[..]), Some("done"));
        assert!(ctx.events.iter().any(|&(_, ref e)| match *e {
            Event::ShutdownInitiatedByPeer { error_code: 7 } => true,
            _ => false,
        }));
        // Draining: CONNECTION_CLOSE echo requested, shutdown timer armed
        assert!(conn.state.process_shutdown_complete || !conn.state.shutdown_complete);
    }

    #[test]
    fn disallowed_frame_at_level_is_fatal() {
        let mut ctx = test_ctx();
        let mut session = FakeSession::new(Side::Client);
        session.stage_keys(KeyType::Handshake);
        let mut conn = client(&mut ctx, session);
        conn.crypto.poll_keys();
        // STREAM frame (0x08) is not allowed at handshake level
        conn.queue_recv_packet(remote_addr(), handshake(0, &[0x08, 0x04, 0x00]));
        drain(&mut conn, &mut ctx, 1_000);
        assert!(conn.state.closed_locally);
        assert_eq!(conn.close_error_code, TransportError::FRAME_ENCODING_ERROR.0);
    }

    #[test]
    fn server_defers_one_rtt_until_confirmed() {
        let mut ctx = test_ctx();
        let mut session = FakeSession::new(Side::Server);
        session.stage_keys(KeyType::OneRtt);
        let mut conn = Connection::new(
            logger(),
            &mut ctx,
            ConnectionHandle(1),
            Side::Server,
            remote_addr(),
            ConnectionId::new(&INIT_DCID),
            ConnectionId::new(&LOCAL_CID),
            ConnectionId::new(&[0x22; 8]),
            Box::new(session),
            ::VERSION_1,
            0,
        );
        conn.crypto.poll_keys();
        conn.queue_recv_packet(remote_addr(), one_rtt(0, &[0x01]));
        drain(&mut conn, &mut ctx, 1_000);
        // Parked, not processed
        assert_eq!(conn.stats.recv.valid_packets, 0);
        assert!(conn.close_status.is_none());
    }

    #[test]
    fn key_phase_flip_decrypts_under_new_generation() {
        let mut ctx = test_ctx();
        let mut conn = connected_client(&mut ctx);
        // Tag for the staged next generation (FakeSession counts up)
        let packet = seal(
            Header::Short {
                dst_cid: ConnectionId::new(&LOCAL_CID),
                number: PacketNumber::U8(5),
                key_phase: true,
            },
            &[0x01],
            ONE_RTT_TAG + 1,
        );
        conn.queue_recv_packet(remote_addr(), packet);
        drain(&mut conn, &mut ctx, 1_000);
        assert_eq!(conn.stats.recv.valid_packets, 1);
        assert!(conn.close_status.is_none());
        // Old-generation keys are retained for reordered packets
        assert!(conn.crypto.prev_1rtt_read().is_some());
    }

    #[test]
    fn resumption_ticket_validation_gates_on_app() {
        let mut ctx = test_ctx();
        let mut session = FakeSession::new(Side::Server);
        session.complete_after_read = true;
        let mut conn = Connection::new(
            logger(),
            &mut ctx,
            ConnectionHandle(2),
            Side::Server,
            remote_addr(),
            ConnectionId::new(&INIT_DCID),
            ConnectionId::new(&LOCAL_CID),
            ConnectionId::new(&[0x22; 8]),
            Box::new(session),
            ::VERSION_1,
            0,
        );
        conn.set_configuration(&mut ctx, 0, configuration()).unwrap();
        let ticket = ::ticket::encode_server_ticket(
            ::VERSION_1,
            b"h3",
            &conn.local_params.clone(),
            b"app-state",
        );
        assert!(conn.recv_resumption_ticket(&mut ctx, &ticket));
        assert!(conn.crypto.ticket_validation_pending);
        assert!(ctx.events.iter().any(|&(_, ref e)| match *e {
            Event::Resumed { ref app_data } => &app_data[..] == b"app-state",
            _ => false,
        }));
        conn.complete_resumption_ticket_validation(true);
        drain(&mut conn, &mut ctx, 1_000);
        assert!(!conn.crypto.ticket_validation_pending);
    }

    #[test]
    fn oversized_ticket_rejected() {
        let mut ctx = test_ctx();
        let mut conn = Connection::new(
            logger(),
            &mut ctx,
            ConnectionHandle(3),
            Side::Server,
            remote_addr(),
            ConnectionId::new(&INIT_DCID),
            ConnectionId::new(&LOCAL_CID),
            ConnectionId::new(&[0x22; 8]),
            Box::new(FakeSession::new(Side::Server)),
            ::VERSION_1,
            0,
        );
        conn.set_configuration(&mut ctx, 0, configuration()).unwrap();
        let mut inflated = conn.local_params.clone();
        inflated.initial_max_data = conn.local_params.initial_max_data + 1;
        let ticket = ::ticket::encode_server_ticket(::VERSION_1, b"h3", &inflated, &[]);
        assert!(!conn.recv_resumption_ticket(&mut ctx, &ticket));
        assert!(!conn.crypto.ticket_validation_pending);
    }
}
