//! Per-path state: addressing, validation, and the anti-amplification
//! allowance that bounds sends to unvalidated peers.

use std::net::SocketAddrV6;

use rand::Rng;

use rtt::RttEstimator;
use {AMPLIFICATION_RATIO, MIN_MTU};

#[derive(Debug)]
pub struct Path {
    pub remote: SocketAddrV6,
    /// Sequence of the dest CID assigned to this path
    pub dest_cid_seq: Option<u64>,
    /// The peer's ownership of `remote` has been proven
    pub peer_validated: bool,
    /// At least one authenticated packet arrived on this path
    pub got_valid_packet: bool,
    /// We rotated the CID ourselves; suppress the reactive rotation
    pub initiated_cid_update: bool,
    pub send_challenge: bool,
    pub send_response: bool,
    /// Fixed per validation round; reused across retransmits
    pub challenge: [u8; 8],
    pub response: [u8; 8],
    pub validation_start: u64,
    /// Bytes we may still send before validation completes
    pub allowance: u64,
    pub mtu: u16,
    pub rtt: RttEstimator,
}

impl Path {
    pub fn new(remote: SocketAddrV6, peer_validated: bool) -> Self {
        Path {
            remote,
            dest_cid_seq: None,
            peer_validated,
            got_valid_packet: false,
            initiated_cid_update: false,
            send_challenge: false,
            send_response: false,
            challenge: [0; 8],
            response: [0; 8],
            validation_start: 0,
            allowance: 0,
            mtu: MIN_MTU,
            rtt: RttEstimator::default(),
        }
    }

    /// Credit the anti-amplification allowance for received bytes.
    pub fn on_bytes_received(&mut self, bytes: u64) {
        if !self.peer_validated {
            self.allowance = self.allowance.saturating_add(AMPLIFICATION_RATIO * bytes);
        }
    }

    /// Debit the allowance; returns false when the send must be withheld.
    pub fn on_bytes_sent(&mut self, bytes: u64) -> bool {
        if self.peer_validated {
            return true;
        }
        if self.allowance < bytes {
            return false;
        }
        self.allowance -= bytes;
        true
    }

    pub fn set_valid(&mut self) {
        self.peer_validated = true;
        self.send_challenge = false;
        self.validation_start = 0;
    }

    /// Arm a fresh challenge round on this path.
    pub fn start_validation<R: Rng>(&mut self, rng: &mut R, now: u64) {
        self.peer_validated = false;
        self.send_challenge = true;
        self.validation_start = now;
        rng.fill_bytes(&mut self.challenge);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    fn addr(port: u16) -> SocketAddrV6 {
        SocketAddrV6::new(Ipv6Addr::LOCALHOST, port, 0, 0)
    }

    #[test]
    fn amplification_allowance() {
        let mut path = Path::new(addr(4433), false);
        assert!(!path.on_bytes_sent(1));
        path.on_bytes_received(1200);
        assert_eq!(path.allowance, 3 * 1200);
        assert!(path.on_bytes_sent(3 * 1200));
        assert!(!path.on_bytes_sent(1));
    }

    #[test]
    fn validation_lifts_allowance_cap() {
        let mut path = Path::new(addr(4433), false);
        path.set_valid();
        assert!(path.on_bytes_sent(1 << 30));
    }

    #[test]
    fn challenge_payload_fixed_within_round() {
        let mut rng = ::rand::thread_rng();
        let mut path = Path::new(addr(1), true);
        path.start_validation(&mut rng, 100);
        let first = path.challenge;
        assert!(path.send_challenge);
        assert!(!path.peer_validated);
        assert_eq!(path.challenge, first);
        path.start_validation(&mut rng, 200);
        // A new round draws a new payload (overwhelmingly likely to differ)
        assert_eq!(path.validation_start, 200);
    }
}
