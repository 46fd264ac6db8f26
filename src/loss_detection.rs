//! Per-packet-number-space tracking of in-flight packets, ack processing,
//! and loss/probe timing.

use std::collections::BTreeMap;

use congestion::Controller;
use frame;
use range_set::RangeSet;
use rtt::RttEstimator;
use send::Retransmits;
use TransportError;

/// Packet reordering tolerated before earlier packets are declared lost.
pub const REORDERING_THRESHOLD: u64 = 3;

#[derive(Debug, Clone)]
pub struct SentPacket {
    /// Absolute μs
    pub time: u64,
    /// 0 iff ack-only
    pub bytes: u16,
    pub ack_eliciting: bool,
    /// Acks this packet carried, so their state can be released on ack
    pub acks: RangeSet,
    pub retransmits: Retransmits,
}

impl SentPacket {
    pub fn ack_only(&self) -> bool {
        self.bytes == 0
    }
}

/// Outcome of processing one ACK frame.
#[derive(Default)]
#[derive(Debug)]
pub struct AckOutcome {
    pub newly_acked: Vec<(u64, SentPacket)>,
    pub lost: Vec<(u64, SentPacket)>,
    /// RTT sample taken (the largest acked was newly acked)
    pub rtt_updated: bool,
}

#[derive(Default)]
pub struct LossDetection {
    pub sent_packets: BTreeMap<u64, SentPacket>,
    next_packet_number: u64,
    pub largest_acked: Option<u64>,
    pub largest_sent: u64,
    /// Absolute μs at which the earliest tracked packet is declared lost
    pub loss_time: Option<u64>,
    pub time_of_last_ack_eliciting: u64,
    pub pto_count: u32,
    /// Set once an RTO fires; verified or refuted by the next ack
    largest_sent_before_rto: Option<u64>,
}

impl LossDetection {
    pub fn new() -> Self {
        LossDetection::default()
    }

    pub fn next_packet_number(&mut self) -> u64 {
        let n = self.next_packet_number;
        self.next_packet_number += 1;
        debug_assert!(n <= ::VAR_INT_MAX);
        self.largest_sent = n;
        n
    }

    pub fn peek_next_packet_number(&self) -> u64 {
        self.next_packet_number
    }

    pub fn on_packet_sent(
        &mut self,
        now: u64,
        packet: u64,
        sent: SentPacket,
        cc: &mut Controller,
    ) {
        if sent.bytes != 0 {
            self.time_of_last_ack_eliciting = now;
            cc.on_packet_sent(u64::from(sent.bytes));
        }
        self.sent_packets.insert(packet, sent);
    }

    /// Process an ACK frame: validate, collect newly acked and lost packets,
    /// update RTT, and feed the congestion controller.
    pub fn on_ack_received(
        &mut self,
        now: u64,
        ack: &frame::Ack,
        ack_delay: u64,
        peer_timestamp: Option<u64>,
        rtt: &mut RttEstimator,
        phase_shift: &mut i64,
        cc: &mut Controller,
    ) -> Result<AckOutcome, TransportError> {
        if ack.largest >= self.next_packet_number {
            // Acking a packet we never sent
            return Err(TransportError::PROTOCOL_VIOLATION);
        }
        let mut outcome = AckOutcome::default();
        self.largest_acked = Some(self.largest_acked.map_or(ack.largest, |x| x.max(ack.largest)));

        if let Some(info) = self.sent_packets.get(&ack.largest) {
            let mut sample = now.saturating_sub(info.time);
            // Peer-reported delay is discounted, bounded below by min RTT
            if sample.saturating_sub(rtt.min.min(sample)) > ack_delay {
                sample -= ack_delay;
            }
            let timestamps = peer_timestamp.map(|ts| (info.time, ts));
            rtt.update(sample, timestamps, phase_shift);
            outcome.rtt_updated = true;
        }

        for &(start, end) in ack.iter() {
            let range: Vec<u64> = self
                .sent_packets
                .range(start..=end)
                .map(|(&n, _)| n)
                .collect();
            for packet in range {
                let info = self.sent_packets.remove(&packet).unwrap();
                if !info.ack_only() {
                    cc.on_packet_acked(packet, u64::from(info.bytes));
                }
                outcome.newly_acked.push((packet, info));
            }
        }

        if !outcome.newly_acked.is_empty() {
            if let Some(before_rto) = self.largest_sent_before_rto.take() {
                if outcome.newly_acked.iter().any(|&(n, _)| n > before_rto) {
                    cc.on_retransmission_timeout_verified();
                }
            }
            self.pto_count = 0;
        }

        outcome.lost = self.detect_lost_packets(now, rtt, cc);
        Ok(outcome)
    }

    /// FACK-style threshold detection plus a time threshold of 9/8 RTT.
    pub fn detect_lost_packets(
        &mut self,
        now: u64,
        rtt: &RttEstimator,
        cc: &mut Controller,
    ) -> Vec<(u64, SentPacket)> {
        let largest_acked = match self.largest_acked {
            Some(x) => x,
            None => {
                return Vec::new();
            }
        };
        self.loss_time = None;
        let loss_delay = rtt.latest.max(rtt.smoothed_or_initial()) * 9 / 8;
        let mut lost = Vec::new();
        for (&packet, info) in self.sent_packets.range(..largest_acked) {
            let time_since_sent = now.saturating_sub(info.time);
            if time_since_sent >= loss_delay || largest_acked - packet > REORDERING_THRESHOLD {
                lost.push(packet);
            } else if self.loss_time.is_none() {
                self.loss_time = Some(info.time + loss_delay);
            }
        }
        let mut out = Vec::with_capacity(lost.len());
        if let Some(&largest_lost) = lost.last() {
            let mut lost_bytes = 0;
            for packet in lost {
                let info = self.sent_packets.remove(&packet).unwrap();
                lost_bytes += u64::from(info.bytes);
                out.push((packet, info));
            }
            if lost_bytes != 0 {
                cc.on_packets_lost(largest_lost, self.largest_sent, lost_bytes);
            }
        }
        out
    }

    /// A probe timeout fired: next flight gets one more exponential backoff.
    pub fn on_probe_timeout(&mut self) {
        if self.pto_count == 0 {
            self.largest_sent_before_rto = Some(self.largest_sent);
        }
        self.pto_count += 1;
    }

    /// When the loss-detection timer should next fire, if anything is
    /// outstanding.
    pub fn next_timeout(&self, rtt: &RttEstimator, max_ack_delay: u64) -> Option<u64> {
        if let Some(loss_time) = self.loss_time {
            return Some(loss_time);
        }
        if self.sent_packets.values().all(|x| x.ack_only()) {
            return None;
        }
        let timeout = rtt.pto(max_ack_delay) * (1 << self.pto_count.min(20));
        Some(self.time_of_last_ack_eliciting + timeout)
    }

    /// Forget all state, e.g. when a space's keys are discarded. In-flight
    /// bytes are released without a congestion penalty.
    pub fn discard(&mut self, cc: &mut Controller) {
        let mut bytes = 0;
        for (_, info) in ::std::mem::replace(&mut self.sent_packets, BTreeMap::new()) {
            bytes += u64::from(info.bytes);
        }
        if bytes != 0 {
            // Packet 0 is inside every recovery epoch, so the window is untouched
            cc.on_packets_lost(0, self.largest_sent, bytes);
        }
        self.loss_time = None;
        self.pto_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use congestion::{NewReno, NewRenoConfig};
    use frame::Ack;

    fn sent(time: u64, bytes: u16) -> SentPacket {
        SentPacket {
            time,
            bytes,
            ack_eliciting: bytes != 0,
            acks: RangeSet::new(),
            retransmits: Retransmits::default(),
        }
    }

    fn ack_of(ranges: Vec<(u64, u64)>) -> Ack {
        Ack {
            largest: ranges.iter().map(|x| x.1).max().unwrap(),
            delay: 0,
            ranges,
            ecn: None,
        }
    }

    struct Harness {
        loss: LossDetection,
        rtt: RttEstimator,
        cc: NewReno,
        shift: i64,
    }

    impl Harness {
        fn new() -> Self {
            Harness {
                loss: LossDetection::new(),
                rtt: RttEstimator::default(),
                cc: NewReno::new(NewRenoConfig::default()),
                shift: 0,
            }
        }

        fn send(&mut self, now: u64, bytes: u16) -> u64 {
            let pn = self.loss.next_packet_number();
            self.loss
                .on_packet_sent(now, pn, sent(now, bytes), &mut self.cc);
            pn
        }

        fn ack(&mut self, now: u64, ranges: Vec<(u64, u64)>) -> AckOutcome {
            self.loss
                .on_ack_received(
                    now,
                    &ack_of(ranges),
                    0,
                    None,
                    &mut self.rtt,
                    &mut self.shift,
                    &mut self.cc,
                )
                .unwrap()
        }
    }

    #[test]
    fn ack_of_unsent_packet_is_protocol_violation() {
        let mut h = Harness::new();
        h.send(0, 1200);
        let err = h.loss.on_ack_received(
            1000,
            &ack_of(vec![(0, 5)]),
            0,
            None,
            &mut h.rtt,
            &mut h.shift,
            &mut h.cc,
        );
        assert_matches!(err, Err(e) if e == TransportError::PROTOCOL_VIOLATION);
    }

    #[test]
    fn ack_updates_rtt_and_releases_bytes() {
        let mut h = Harness::new();
        h.send(0, 1200);
        let outcome = h.ack(30_000, vec![(0, 0)]);
        assert!(outcome.rtt_updated);
        assert_eq!(h.rtt.latest, 30_000);
        assert_eq!(outcome.newly_acked.len(), 1);
        assert_eq!(h.cc.bytes_in_flight(), 0);
    }

    #[test]
    fn second_ack_of_same_packet_is_inert() {
        let mut h = Harness::new();
        h.send(0, 1200);
        h.send(0, 1200);
        let first = h.ack(10_000, vec![(0, 0)]);
        assert_eq!(first.newly_acked.len(), 1);
        let window = h.cc.window();
        let again = h.ack(11_000, vec![(0, 0)]);
        assert!(again.newly_acked.is_empty());
        assert_eq!(h.cc.window(), window);
    }

    #[test]
    fn reordering_threshold_declares_loss() {
        let mut h = Harness::new();
        for _ in 0..6 {
            h.send(0, 1200);
        }
        let outcome = h.ack(10_000, vec![(5, 5)]);
        // Packets 0 and 1 are more than REORDERING_THRESHOLD behind 5
        let lost: Vec<u64> = outcome.lost.iter().map(|x| x.0).collect();
        assert_eq!(lost, vec![0, 1]);
        assert!(h.loss.loss_time.is_some());
    }

    #[test]
    fn probe_timeout_backs_off_exponentially() {
        let mut h = Harness::new();
        h.send(0, 1200);
        let mut shift = 0i64;
        h.rtt.update(10_000, None, &mut shift);
        let base = h.loss.next_timeout(&h.rtt, 0).unwrap();
        h.loss.on_probe_timeout();
        let doubled = h.loss.next_timeout(&h.rtt, 0).unwrap();
        assert_eq!(doubled, 2 * base);
    }

    #[test]
    fn ack_only_packets_do_not_arm_timer() {
        let mut h = Harness::new();
        h.send(0, 0);
        assert_eq!(h.loss.next_timeout(&h.rtt, 0), None);
    }
}
