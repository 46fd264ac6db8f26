//! Congestion controller interface and the default NewReno-style
//! implementation.

/// Interface the loss-detection machinery drives. Packet numbers come from
/// the sending space's sequence.
pub trait Controller: Send {
    fn on_packet_sent(&mut self, bytes: u64);
    fn on_packet_acked(&mut self, packet: u64, bytes: u64);
    /// `largest_lost` starts a new recovery epoch unless one is in progress.
    fn on_packets_lost(&mut self, largest_lost: u64, largest_sent: u64, bytes: u64);
    /// Ack of a packet sent after an RTO fires confirms the timeout was real.
    fn on_retransmission_timeout_verified(&mut self);
    fn window(&self) -> u64;
    fn bytes_in_flight(&self) -> u64;
    fn available(&self) -> u64 {
        self.window().saturating_sub(self.bytes_in_flight())
    }
}

#[derive(Debug, Copy, Clone)]
pub struct NewRenoConfig {
    pub default_mss: u64,
    pub initial_window: u64,
    pub minimum_window: u64,
    /// 0.16 fixed point
    pub loss_reduction_factor: u16,
}

impl Default for NewRenoConfig {
    fn default() -> Self {
        NewRenoConfig {
            default_mss: 1460,
            initial_window: 10 * 1460,
            minimum_window: 2 * 1460,
            loss_reduction_factor: 0x8000, // 1/2
        }
    }
}

pub struct NewReno {
    config: NewRenoConfig,
    window: u64,
    ssthresh: u64,
    /// Largest packet sent when loss was last detected; acks beyond it
    /// leave recovery.
    end_of_recovery: u64,
    in_flight: u64,
}

impl NewReno {
    pub fn new(config: NewRenoConfig) -> Self {
        NewReno {
            window: config.initial_window,
            ssthresh: u64::max_value(),
            end_of_recovery: 0,
            in_flight: 0,
            config,
        }
    }

    fn in_recovery(&self, packet: u64) -> bool {
        packet <= self.end_of_recovery
    }
}

impl Controller for NewReno {
    fn on_packet_sent(&mut self, bytes: u64) {
        self.in_flight += bytes;
    }

    fn on_packet_acked(&mut self, packet: u64, bytes: u64) {
        self.in_flight = self.in_flight.saturating_sub(bytes);
        if self.in_recovery(packet) {
            // The window does not grow during recovery
            return;
        }
        if self.window < self.ssthresh {
            // Slow start
            self.window += bytes;
        } else {
            // Congestion avoidance
            self.window += self.config.default_mss * bytes / self.window;
        }
    }

    fn on_packets_lost(&mut self, largest_lost: u64, largest_sent: u64, bytes: u64) {
        self.in_flight = self.in_flight.saturating_sub(bytes);
        if self.in_recovery(largest_lost) {
            return;
        }
        self.end_of_recovery = largest_sent;
        self.window = (self.window * u64::from(self.config.loss_reduction_factor)) >> 16;
        self.window = self.window.max(self.config.minimum_window);
        self.ssthresh = self.window;
    }

    fn on_retransmission_timeout_verified(&mut self) {
        self.window = self.config.minimum_window;
    }

    fn window(&self) -> u64 {
        self.window
    }

    fn bytes_in_flight(&self) -> u64 {
        self.in_flight
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> NewReno {
        NewReno::new(NewRenoConfig::default())
    }

    #[test]
    fn slow_start_doubles_on_full_window_ack() {
        let mut cc = controller();
        let initial = cc.window();
        cc.on_packet_sent(initial);
        cc.on_packet_acked(1, initial);
        assert_eq!(cc.window(), 2 * initial);
        assert_eq!(cc.bytes_in_flight(), 0);
    }

    #[test]
    fn loss_halves_window_and_sets_ssthresh() {
        let mut cc = controller();
        cc.on_packet_sent(5000);
        let before = cc.window();
        cc.on_packets_lost(7, 10, 1200);
        assert_eq!(cc.window(), before / 2);
        // Still in recovery: acks up to pn 10 do not grow the window
        cc.on_packet_acked(9, 1200);
        assert_eq!(cc.window(), before / 2);
        // Loss within the same epoch does not halve again
        cc.on_packets_lost(10, 10, 1200);
        assert_eq!(cc.window(), before / 2);
        // An ack past the epoch resumes growth, now in congestion avoidance
        cc.on_packet_sent(1200);
        cc.on_packet_acked(11, 1200);
        assert!(cc.window() > before / 2);
    }

    #[test]
    fn window_never_drops_below_minimum() {
        let mut cc = controller();
        let mut largest = 10;
        for _ in 0..10 {
            cc.on_packets_lost(largest, largest, 0);
            largest += 10;
        }
        assert_eq!(cc.window(), NewRenoConfig::default().minimum_window);
    }

    #[test]
    fn rto_verification_collapses_window() {
        let mut cc = controller();
        cc.on_retransmission_timeout_verified();
        assert_eq!(cc.window(), NewRenoConfig::default().minimum_window);
    }
}
