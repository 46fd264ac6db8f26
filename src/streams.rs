//! Frame-level stream semantics: limit accounting, flow control, and the
//! protocol-error checks the receive path must make. Data buffering and
//! delivery live outside the connection core.

use fnv::FnvHashMap;

use frame;
use {Directionality, Side, StreamId, TransportError};

#[derive(Debug, Default)]
struct Recv {
    /// Highest offset seen (received byte high watermark)
    limit: u64,
    final_size: Option<u64>,
    max_stream_data: u64,
    reset: bool,
}

#[derive(Debug)]
pub struct StreamSet {
    side: Side,
    /// Peer-granted limits on locally initiated streams [bidi, uni]
    max_local: [u64; 2],
    next_local: [u64; 2],
    /// Our limits on peer-initiated streams [bidi, uni]
    max_remote: [u64; 2],
    /// Count of peer streams opened so far [bidi, uni]
    opened_remote: [u64; 2],
    /// Default flow-control window for newly opened peer streams
    stream_recv_window: u64,
    recv: FnvHashMap<StreamId, Recv>,
    /// Connection-level flow control
    pub data_recvd: u64,
    pub local_max_data: u64,
    pub peer_max_data: u64,
    pub data_sent: u64,
}

fn dir_index(directionality: Directionality) -> usize {
    match directionality {
        Directionality::Bi => 0,
        Directionality::Uni => 1,
    }
}

impl StreamSet {
    pub fn new(
        side: Side,
        max_remote_bidi: u64,
        max_remote_uni: u64,
        stream_recv_window: u64,
        receive_window: u64,
    ) -> Self {
        StreamSet {
            side,
            max_local: [0, 0],
            next_local: [0, 0],
            max_remote: [max_remote_bidi, max_remote_uni],
            opened_remote: [0, 0],
            stream_recv_window,
            recv: FnvHashMap::default(),
            data_recvd: 0,
            local_max_data: receive_window,
            peer_max_data: 0,
            data_sent: 0,
        }
    }

    /// Install the peer's transport parameters once validated.
    pub fn set_params(&mut self, params: &::transport_parameters::TransportParameters) {
        self.max_local = [
            params.initial_max_streams_bidi,
            params.initial_max_streams_uni,
        ];
        self.peer_max_data = self.peer_max_data.max(params.initial_max_data);
    }

    /// Look up or lazily create receive state, enforcing stream limits and
    /// direction legality.
    fn recv_state(&mut self, id: StreamId) -> Result<Option<&mut Recv>, TransportError> {
        if id.initiator() == self.side {
            if id.directionality() == Directionality::Uni {
                // We can't receive on our own unidirectional streams
                return Err(TransportError::STREAM_STATE_ERROR);
            }
            if id.index() >= self.next_local[0] {
                // Peer "responded" on a stream we never opened
                return Err(TransportError::STREAM_STATE_ERROR);
            }
            return Ok(Some(self.recv.entry(id).or_insert_with(Recv::default)));
        }
        let dir = dir_index(id.directionality());
        if id.index() >= self.max_remote[dir] {
            return Err(TransportError::STREAM_LIMIT_ERROR);
        }
        if id.index() >= self.opened_remote[dir] {
            self.opened_remote[dir] = id.index() + 1;
        }
        let window = self.stream_recv_window;
        Ok(Some(self.recv.entry(id).or_insert_with(|| Recv {
            max_stream_data: window,
            ..Recv::default()
        })))
    }

    /// Validate a STREAM frame and account its bytes. Returns the count of
    /// newly received bytes.
    pub fn recv_stream(&mut self, frame: &frame::Stream) -> Result<u64, TransportError> {
        let data_recvd = self.data_recvd;
        let local_max_data = self.local_max_data;
        let rs = match self.recv_state(frame.id)? {
            Some(x) => x,
            None => {
                return Ok(0);
            }
        };
        let end = frame.offset + frame.data.len() as u64;
        if let Some(final_size) = rs.final_size {
            if end > final_size || (frame.fin && end != final_size) {
                return Err(TransportError::FINAL_SIZE_ERROR);
            }
        }
        if end > rs.max_stream_data {
            return Err(TransportError::FLOW_CONTROL_ERROR);
        }
        let new_bytes = end.saturating_sub(rs.limit);
        if data_recvd + new_bytes > local_max_data {
            return Err(TransportError::FLOW_CONTROL_ERROR);
        }
        if frame.fin {
            rs.final_size = Some(end);
        }
        rs.limit = rs.limit.max(end);
        self.data_recvd += new_bytes;
        Ok(new_bytes)
    }

    /// Validate RESET_STREAM; returns newly accounted bytes.
    pub fn recv_reset(&mut self, id: StreamId, final_size: u64) -> Result<u64, TransportError> {
        let data_recvd = self.data_recvd;
        let local_max_data = self.local_max_data;
        let rs = match self.recv_state(id)? {
            Some(x) => x,
            None => {
                return Ok(0);
            }
        };
        if let Some(known) = rs.final_size {
            if known != final_size {
                return Err(TransportError::FINAL_SIZE_ERROR);
            }
        }
        if final_size < rs.limit {
            return Err(TransportError::FINAL_SIZE_ERROR);
        }
        let new_bytes = final_size - rs.limit;
        if data_recvd + new_bytes > local_max_data {
            return Err(TransportError::FLOW_CONTROL_ERROR);
        }
        rs.final_size = Some(final_size);
        rs.reset = true;
        rs.limit = final_size;
        self.data_recvd += new_bytes;
        Ok(new_bytes)
    }

    /// STOP_SENDING is only valid for streams we can send on.
    pub fn recv_stop_sending(&mut self, id: StreamId) -> Result<(), TransportError> {
        if id.initiator() != self.side && id.directionality() == Directionality::Uni {
            return Err(TransportError::STREAM_STATE_ERROR);
        }
        if id.initiator() == self.side && id.index() >= self.next_local[dir_index(id.directionality())] {
            return Err(TransportError::STREAM_STATE_ERROR);
        }
        Ok(())
    }

    /// MAX_STREAM_DATA is only valid for streams we can send on.
    pub fn recv_max_stream_data(&mut self, id: StreamId) -> Result<(), TransportError> {
        if id.initiator() != self.side && id.directionality() == Directionality::Uni {
            return Err(TransportError::STREAM_STATE_ERROR);
        }
        Ok(())
    }

    pub fn recv_max_data(&mut self, offset: u64) {
        self.peer_max_data = self.peer_max_data.max(offset);
    }

    /// Returns true when the limit actually increased.
    pub fn recv_max_streams(&mut self, directionality: Directionality, count: u64) -> bool {
        let dir = dir_index(directionality);
        if count > self.max_local[dir] {
            self.max_local[dir] = count;
            return true;
        }
        false
    }

    pub fn open(&mut self, directionality: Directionality) -> Option<StreamId> {
        let dir = dir_index(directionality);
        if self.next_local[dir] >= self.max_local[dir] {
            return None;
        }
        let id = StreamId::new(self.side, directionality, self.next_local[dir]);
        self.next_local[dir] += 1;
        Some(id)
    }

    /// Discard all stream state on close.
    pub fn shutdown(&mut self) {
        self.recv.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn set() -> StreamSet {
        StreamSet::new(Side::Server, 4, 2, 1 << 12, 1 << 14)
    }

    fn stream_frame(id: StreamId, offset: u64, len: usize, fin: bool) -> frame::Stream {
        frame::Stream {
            id,
            offset,
            fin,
            data: Bytes::from(vec![0; len]),
        }
    }

    #[test]
    fn remote_stream_limit_enforced() {
        let mut s = set();
        let ok = StreamId::new(Side::Client, Directionality::Bi, 3);
        assert!(s.recv_stream(&stream_frame(ok, 0, 10, false)).is_ok());
        let over = StreamId::new(Side::Client, Directionality::Bi, 4);
        assert_eq!(
            s.recv_stream(&stream_frame(over, 0, 10, false)),
            Err(TransportError::STREAM_LIMIT_ERROR)
        );
    }

    #[test]
    fn receiving_on_own_uni_stream_is_state_error() {
        let mut s = set();
        let id = StreamId::new(Side::Server, Directionality::Uni, 0);
        assert_eq!(
            s.recv_stream(&stream_frame(id, 0, 1, false)),
            Err(TransportError::STREAM_STATE_ERROR)
        );
    }

    #[test]
    fn final_size_violations() {
        let mut s = set();
        let id = StreamId::new(Side::Client, Directionality::Uni, 0);
        assert!(s.recv_stream(&stream_frame(id, 0, 10, true)).is_ok());
        // Data past the final size
        assert_eq!(
            s.recv_stream(&stream_frame(id, 10, 1, false)),
            Err(TransportError::FINAL_SIZE_ERROR)
        );
        // Conflicting RESET_STREAM final size
        assert_eq!(s.recv_reset(id, 11), Err(TransportError::FINAL_SIZE_ERROR));
        assert_eq!(s.recv_reset(id, 10), Ok(0));
    }

    #[test]
    fn connection_flow_control_enforced() {
        let mut s = StreamSet::new(Side::Server, 4, 2, 1 << 20, 16);
        let id = StreamId::new(Side::Client, Directionality::Uni, 0);
        assert!(s.recv_stream(&stream_frame(id, 0, 16, false)).is_ok());
        let id2 = StreamId::new(Side::Client, Directionality::Uni, 1);
        assert_eq!(
            s.recv_stream(&stream_frame(id2, 0, 1, false)),
            Err(TransportError::FLOW_CONTROL_ERROR)
        );
    }

    #[test]
    fn stream_flow_control_enforced() {
        let mut s = StreamSet::new(Side::Server, 4, 2, 8, 1 << 20);
        let id = StreamId::new(Side::Client, Directionality::Uni, 0);
        assert_eq!(
            s.recv_stream(&stream_frame(id, 0, 9, false)),
            Err(TransportError::FLOW_CONTROL_ERROR)
        );
    }

    #[test]
    fn duplicate_bytes_not_double_counted() {
        let mut s = set();
        let id = StreamId::new(Side::Client, Directionality::Bi, 0);
        assert_eq!(s.recv_stream(&stream_frame(id, 0, 10, false)), Ok(10));
        assert_eq!(s.recv_stream(&stream_frame(id, 0, 10, false)), Ok(0));
        assert_eq!(s.data_recvd, 10);
    }

    #[test]
    fn local_open_respects_peer_limit() {
        let mut s = set();
        assert_eq!(s.open(Directionality::Bi), None);
        s.recv_max_streams(Directionality::Bi, 1);
        assert_eq!(
            s.open(Directionality::Bi),
            Some(StreamId::new(Side::Server, Directionality::Bi, 0))
        );
        assert_eq!(s.open(Directionality::Bi), None);
    }
}
