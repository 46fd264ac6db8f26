//! Resumption ticket encoding.
//!
//! Server tickets carry the transport parameters that were in force when the
//! ticket was minted plus opaque application state; they travel to the peer
//! inside NewSessionTicket messages and come back in the TLS pre-shared-key
//! extension. Client tickets bundle the server's ticket with the peer's
//! transport parameters and the negotiated version so 0-RTT flight limits can
//! be reconstructed before the handshake completes.

use bytes::{Buf, Bytes};
use std::io::Cursor;

use coding::{self, BufExt, BufMutExt};
use transport_parameters::TransportParameters;
use Side;

const TICKET_VERSION: u8 = 1;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Fail)]
pub enum TicketError {
    #[fail(display = "unsupported ticket encoding version")]
    UnsupportedVersion,
    #[fail(display = "malformed ticket")]
    Malformed,
    #[fail(display = "ticket ALPN not in configured list")]
    AlpnMismatch,
}

impl From<coding::UnexpectedEnd> for TicketError {
    fn from(_: coding::UnexpectedEnd) -> Self {
        TicketError::Malformed
    }
}

pub fn encode_server_ticket(
    quic_version: u32,
    alpn: &[u8],
    handshake_tp: &TransportParameters,
    app_data: &[u8],
) -> Vec<u8> {
    let mut tp_buf = Vec::new();
    handshake_tp.write(Side::Server, &mut tp_buf);
    let mut buf = Vec::new();
    buf.write(TICKET_VERSION);
    buf.write(quic_version);
    buf.write_var(alpn.len() as u64);
    buf.write_var(tp_buf.len() as u64);
    buf.write_var(app_data.len() as u64);
    buf.extend_from_slice(alpn);
    buf.extend_from_slice(&tp_buf);
    buf.extend_from_slice(app_data);
    buf
}

/// Decode a server ticket presented back by a client. The negotiated ALPN
/// must still be configured or resumption is refused.
pub fn decode_server_ticket(
    ticket: &[u8],
    alpn_list: &[Vec<u8>],
) -> Result<(u32, TransportParameters, Bytes), TicketError> {
    let mut r = Cursor::new(ticket);
    if r.get::<u8>()? != TICKET_VERSION {
        return Err(TicketError::UnsupportedVersion);
    }
    let quic_version: u32 = r.get()?;
    let alpn_len = r.get_var()? as usize;
    let tp_len = r.get_var()? as usize;
    let app_len = r.get_var()? as usize;
    let header = r.position() as usize;
    if ticket.len() != header + alpn_len + tp_len + app_len {
        return Err(TicketError::Malformed);
    }
    let alpn = &ticket[header..header + alpn_len];
    if !alpn_list.iter().any(|x| &x[..] == alpn) {
        return Err(TicketError::AlpnMismatch);
    }
    let tp_bytes = &ticket[header + alpn_len..header + alpn_len + tp_len];
    let params = TransportParameters::read(Side::Client, tp_bytes)
        .map_err(|_| TicketError::Malformed)?;
    let app_data = Bytes::from(&ticket[header + alpn_len + tp_len..]);
    Ok((quic_version, params, app_data))
}

pub fn encode_client_ticket(
    quic_version: u32,
    peer_tp: &TransportParameters,
    ticket: &[u8],
) -> Vec<u8> {
    let mut tp_buf = Vec::new();
    peer_tp.write(Side::Server, &mut tp_buf);
    let mut buf = Vec::new();
    buf.write(TICKET_VERSION);
    buf.write(quic_version);
    buf.write_var(tp_buf.len() as u64);
    buf.write_var(ticket.len() as u64);
    buf.extend_from_slice(&tp_buf);
    buf.extend_from_slice(ticket);
    buf
}

pub fn decode_client_ticket(
    buf: &[u8],
) -> Result<(u32, TransportParameters, Bytes), TicketError> {
    let mut r = Cursor::new(buf);
    if r.get::<u8>()? != TICKET_VERSION {
        return Err(TicketError::UnsupportedVersion);
    }
    let quic_version: u32 = r.get()?;
    let tp_len = r.get_var()? as usize;
    let ticket_len = r.get_var()? as usize;
    let header = r.position() as usize;
    if buf.len() != header + tp_len + ticket_len {
        return Err(TicketError::Malformed);
    }
    let params = TransportParameters::read(Side::Client, &buf[header..header + tp_len])
        .map_err(|_| TicketError::Malformed)?;
    let ticket = Bytes::from(&buf[header + tp_len..]);
    Ok((quic_version, params, ticket))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> TransportParameters {
        TransportParameters {
            initial_max_data: 1 << 16,
            initial_max_streams_bidi: 10,
            initial_max_streams_uni: 2,
            initial_max_stream_data_bidi_local: 4096,
            initial_max_stream_data_bidi_remote: 4096,
            initial_max_stream_data_uni: 1024,
            active_connection_id_limit: 4,
            ..TransportParameters::default()
        }
    }

    #[test]
    fn server_ticket_roundtrip() {
        let alpns = vec![b"h3".to_vec(), b"hq-interop".to_vec()];
        let ticket = encode_server_ticket(::VERSION_1, b"h3", &params(), b"app state");
        let (version, tp, app) = decode_server_ticket(&ticket, &alpns).unwrap();
        assert_eq!(version, ::VERSION_1);
        assert_eq!(tp, params());
        assert_eq!(&app[..], b"app state");
    }

    #[test]
    fn server_ticket_rejects_unconfigured_alpn() {
        let ticket = encode_server_ticket(::VERSION_1, b"h3", &params(), &[]);
        assert_eq!(
            decode_server_ticket(&ticket, &[b"spdy".to_vec()]),
            Err(TicketError::AlpnMismatch)
        );
    }

    #[test]
    fn client_ticket_roundtrip() {
        let encoded = encode_client_ticket(::VERSION_2, &params(), b"opaque tls ticket");
        let (version, tp, ticket) = decode_client_ticket(&encoded).unwrap();
        assert_eq!(version, ::VERSION_2);
        assert_eq!(tp, params());
        assert_eq!(&ticket[..], b"opaque tls ticket");
    }

    #[test]
    fn truncated_ticket_rejected() {
        let ticket = encode_server_ticket(::VERSION_1, b"h3", &params(), b"data");
        assert_eq!(
            decode_server_ticket(&ticket[..ticket.len() - 1], &[b"h3".to_vec()]),
            Err(TicketError::Malformed)
        );
    }

    #[test]
    fn unknown_ticket_version_rejected() {
        let mut ticket = encode_client_ticket(::VERSION_1, &params(), b"x");
        ticket[0] = 9;
        assert_eq!(
            decode_client_ticket(&ticket),
            Err(TicketError::UnsupportedVersion)
        );
    }
}
