use crate::data_arrival_rate::DataArrivalRate;
use crate::link_capacity::LinkCapacity;
use crate::packet_header::PacketHeader;
use crate::sequence::PacketSeq;
use crate::types::TICK_TIME;
use rand::rngs::StdRng;
use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

pub const MIN_CONGESTION_WINDOW: usize = 16 * 1024;
pub const MAX_CONGESTION_WINDOW: usize = 8 * 1024 * 1024;

const SMOOTH: f64 = 0.125;
const SENDING_RATE_DECREASE: f64 = 1.125;

/// The main congestion control algorithm, based on the design of UDT.
///
/// The receiver side feeds the link capacity and data arrival rate
/// estimators and decides which packet-level ACKs to send; the sender side
/// turns the remote host's estimates plus ACK/NAK feedback into a congestion
/// window and a sending rate, exposed as a per-tick byte allowance.
pub struct CongestionControl {
    congestion_window: usize,
    /// Bytes per second; 0 means we are still in the slow start phase.
    sending_rate: f64,
    total_data_sent_in_slow_start: usize,

    link_capacity: LinkCapacity,
    data_arrival_rate: DataArrivalRate,

    avg_packet_size: Option<f64>,

    /// The average number of NAKs in a congestion period.
    avg_nak_count: f64,
    /// The number of NAKs in the current congestion period.
    nak_count: u32,
    /// How often the rate has been decreased in this congestion period.
    dec_count: u32,
    dec_random: u32,
    /// The newest sent sequence number when the sending rate was last
    /// decreased.
    last_dec_seq: Option<PacketSeq>,

    newest_sent_sn: Option<PacketSeq>,
    newest_seen_ack_sn: Option<PacketSeq>,

    // state for knowing which ACKs to send and when
    newest_seen_sn: Option<PacketSeq>,
    newest_sent_ack_sn: Option<PacketSeq>,

    remote_link_capacity: Option<f64>,
    remote_data_arrival_rate: Option<f64>,

    rng: StdRng,
}

impl CongestionControl {
    pub fn new(now: Instant, rng: StdRng) -> CongestionControl {
        CongestionControl {
            congestion_window: MIN_CONGESTION_WINDOW,
            sending_rate: 0.0,
            total_data_sent_in_slow_start: 0,
            link_capacity: LinkCapacity::new(now),
            data_arrival_rate: DataArrivalRate::new(),
            avg_packet_size: None,
            avg_nak_count: 1.0,
            nak_count: 1,
            dec_count: 1,
            dec_random: 2,
            last_dec_seq: None,
            newest_sent_sn: None,
            newest_seen_ack_sn: None,
            newest_seen_sn: None,
            newest_sent_ack_sn: None,
            remote_link_capacity: None,
            remote_data_arrival_rate: None,
            rng,
        }
    }

    fn end_slow_start_phase(&mut self) {
        self.sending_rate = self.remote_data_arrival_rate.unwrap_or(0.0);
        debug!("leaving slow start with a sending rate of {} B/s", self.sending_rate);
    }

    fn on_ack(&mut self, rtt: Duration) {
        if 0.0 == self.sending_rate {
            // we are in the slow start phase
            self.congestion_window = self.total_data_sent_in_slow_start.max(MIN_CONGESTION_WINDOW);

            if self.congestion_window >= MAX_CONGESTION_WINDOW {
                self.congestion_window = MAX_CONGESTION_WINDOW;
                self.end_slow_start_phase();
            }
        }
        else {
            let mut inc = 1.0;

            if let Some(remote_link_capacity) = self.remote_link_capacity {
                if remote_link_capacity > self.sending_rate {
                    // these are constants as specified by UDT
                    const ALPHA: f64 = 8.0;
                    const BETA: f64 = 0.000_001_5;
                    inc = (10f64
                        .powf(((remote_link_capacity - self.sending_rate) * ALPHA).log10().ceil())
                        * BETA)
                        .max(1.0);
                }
            }

            self.sending_rate += inc / TICK_TIME.as_secs_f64();

            let arrival_rate = self.remote_data_arrival_rate.unwrap_or(0.0);
            self.congestion_window = ((arrival_rate * (rtt + TICK_TIME).as_secs_f64()) as usize
                + 10 * 1024)
                .min(MAX_CONGESTION_WINDOW);
        }
    }

    fn on_nak(&mut self, nak: PacketSeq) {
        if 0.0 == self.sending_rate {
            // We got a NAK during slow start. Ignore it unless we already
            // know the remote link capacity and arrival rate; without them
            // we cannot leave slow start in a meaningful way.
            if self.remote_link_capacity.is_none() || self.remote_data_arrival_rate.is_none() {
                return;
            }

            self.end_slow_start_phase();
            return;
        }

        let starts_new_period = self
            .last_dec_seq
            .map(|last| nak.diff_signed(last) > 0)
            .unwrap_or(true);

        if starts_new_period {
            self.sending_rate /= SENDING_RATE_DECREASE;

            self.avg_nak_count = (1.0 - SMOOTH) * self.avg_nak_count + SMOOTH * self.nak_count as f64;
            self.nak_count = 1;
            self.dec_random = self.rng.random_range(0..self.avg_nak_count as u32 + 1) + 1;
            self.dec_count = 1;
            self.last_dec_seq = self.newest_sent_sn;
        }
        else {
            if self.dec_count <= 5 && self.nak_count == self.dec_count * self.dec_random {
                // dec_count <= 5 bounds the decrease to roughly 50% per
                // congestion period (1.125^6 ~ 2)
                self.sending_rate /= SENDING_RATE_DECREASE;
                self.dec_count += 1;
                self.last_dec_seq = self.newest_sent_sn;
            }

            self.nak_count += 1;
        }
    }

    /// Feeds a received packet header into the congestion state.
    pub fn got_packet(
        &mut self,
        now: Instant,
        rtt: Duration,
        header: &PacketHeader,
        packet_length: usize,
    ) {
        if let Some(sequence_number) = header.sequence_number {
            self.link_capacity.got_packet(now, sequence_number, packet_length);
        }
        self.data_arrival_rate.got_packet(now, packet_length);

        if let Some(link_capacity) = header.link_capacity {
            // guard against bogus data
            if link_capacity > 0 {
                self.remote_link_capacity = Some(match self.remote_link_capacity {
                    None => link_capacity as f64,
                    Some(prev) => (1.0 - SMOOTH) * prev + SMOOTH * link_capacity as f64,
                });
            }
        }

        if let Some(arrival_rate) = header.arrival_rate {
            if arrival_rate > 0 {
                self.remote_data_arrival_rate = Some(match self.remote_data_arrival_rate {
                    None => arrival_rate as f64,
                    Some(prev) => (1.0 - SMOOTH) * prev + SMOOTH * arrival_rate as f64,
                });
            }
        }

        if let Some(ack) = header.ack {
            let is_newer = self
                .newest_seen_ack_sn
                .map(|prev| ack.diff_signed(prev) > 0)
                .unwrap_or(true);
            if is_newer {
                self.newest_seen_ack_sn = Some(ack);
            }

            self.on_ack(rtt);
        }

        if let Some(nak) = header.nak {
            self.on_nak(nak);
        }

        if let Some(sequence_number) = header.sequence_number {
            let is_newer = self
                .newest_seen_sn
                .map(|prev| sequence_number.diff_signed(prev) > 0)
                .unwrap_or(true);
            if is_newer {
                self.newest_seen_sn = Some(sequence_number);
            }
        }
    }

    pub fn on_rto(&mut self) {
        self.sending_rate /= 2.0;
    }

    pub fn on_data_sent(&mut self, sequence_number: PacketSeq, size: usize) {
        if self.newest_sent_sn.is_none() {
            self.newest_seen_ack_sn = Some(sequence_number.prev());
        }
        self.newest_sent_sn = Some(sequence_number);

        if 0.0 == self.sending_rate {
            self.total_data_sent_in_slow_start += size;
        }

        self.avg_packet_size = Some(match self.avg_packet_size {
            None => size as f64,
            Some(prev) => (1.0 - SMOOTH) * prev + SMOOTH * size as f64,
        });
    }

    /// The packet-level ACK to piggyback onto the next outgoing packet:
    /// the newest seen sequence number, but each value only once.
    pub fn ack(&mut self) -> Option<PacketSeq> {
        if self.newest_seen_sn == self.newest_sent_ack_sn {
            return None;
        }

        self.newest_sent_ack_sn = self.newest_seen_sn;
        self.newest_seen_sn
    }

    /// Current estimated link capacity in bytes per second.
    pub fn link_capacity(&self) -> f64 {
        self.link_capacity.calculate()
    }

    /// Current data arrival rate in bytes per second.
    pub fn data_arrival_rate(&self) -> f64 {
        self.data_arrival_rate.calculate()
    }

    /// The number of bytes we are allowed to send this tick.
    pub fn tick_allowance(&self) -> usize {
        let packets_in_transit = match (self.newest_sent_sn, self.newest_seen_ack_sn) {
            (Some(sent), Some(acked)) => {
                // presumably half of the un-acked packets are in transit, the
                // other half's ACKs are in transit
                sent.diff(acked) / 2
            }
            _ => 0,
        };

        let in_transit_bytes = packets_in_transit as f64 * self.avg_packet_size.unwrap_or(0.0);
        let cwnd_allowance = (self.congestion_window as f64 - in_transit_bytes).max(0.0) as usize;
        let rate_allowance = (self.sending_rate * TICK_TIME.as_secs_f64()) as usize;

        let allowance = if 0 == rate_allowance {
            cwnd_allowance
        }
        else {
            cwnd_allowance.min(rate_allowance)
        };
        trace!("tick allowance is {} bytes", allowance);
        allowance
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn congestion_control() -> CongestionControl {
        CongestionControl::new(Instant::now(), StdRng::seed_from_u64(4711))
    }

    fn header_with_seq(sn: u32) -> PacketHeader {
        PacketHeader {
            sequence_number: Some(PacketSeq::from_raw(sn)),
            ..PacketHeader::default()
        }
    }

    #[test]
    fn test_ack_returns_newest_seen_exactly_once() {
        let mut cc = congestion_control();
        let now = Instant::now();

        assert_eq!(cc.ack(), None);

        cc.got_packet(now, Duration::from_millis(100), &header_with_seq(7), 100);
        assert_eq!(cc.ack(), Some(PacketSeq::from_raw(7)));
        assert_eq!(cc.ack(), None);

        cc.got_packet(now, Duration::from_millis(100), &header_with_seq(8), 100);
        assert_eq!(cc.ack(), Some(PacketSeq::from_raw(8)));
        assert_eq!(cc.ack(), None);
    }

    #[test]
    fn test_old_sequence_number_does_not_regress_ack() {
        let mut cc = congestion_control();
        let now = Instant::now();

        cc.got_packet(now, Duration::from_millis(100), &header_with_seq(9), 100);
        cc.got_packet(now, Duration::from_millis(100), &header_with_seq(5), 100);
        assert_eq!(cc.ack(), Some(PacketSeq::from_raw(9)));
    }

    #[test]
    fn test_slow_start_window_grows_with_sent_data() {
        let mut cc = congestion_control();
        let now = Instant::now();

        for i in 0..100 {
            cc.on_data_sent(PacketSeq::from_raw(i), 1000);
        }

        let ack_header = PacketHeader {
            ack: Some(PacketSeq::from_raw(99)),
            ..PacketHeader::default()
        };
        cc.got_packet(now, Duration::from_millis(100), &ack_header, 100);

        assert_eq!(cc.congestion_window, 100_000.max(MIN_CONGESTION_WINDOW));
        assert_eq!(cc.sending_rate, 0.0);
    }

    #[test]
    fn test_nak_without_remote_estimates_keeps_slow_start() {
        let mut cc = congestion_control();
        let now = Instant::now();

        let nak_header = PacketHeader {
            nak: Some(PacketSeq::from_raw(3)),
            ..PacketHeader::default()
        };
        cc.got_packet(now, Duration::from_millis(100), &nak_header, 100);

        assert_eq!(cc.sending_rate, 0.0);
    }

    #[test]
    fn test_nak_with_remote_estimates_ends_slow_start() {
        let mut cc = congestion_control();
        let now = Instant::now();

        let metrics_header = PacketHeader {
            link_capacity: Some(200_000),
            arrival_rate: Some(100_000),
            ..PacketHeader::default()
        };
        cc.got_packet(now, Duration::from_millis(100), &metrics_header, 100);

        cc.on_data_sent(PacketSeq::from_raw(0), 1000);
        let nak_header = PacketHeader {
            nak: Some(PacketSeq::from_raw(0)),
            ..PacketHeader::default()
        };
        cc.got_packet(now, Duration::from_millis(100), &nak_header, 100);

        assert_eq!(cc.sending_rate, 100_000.0);
    }

    #[test]
    fn test_new_congestion_period_decreases_sending_rate() {
        let mut cc = congestion_control();
        cc.sending_rate = 9000.0;
        cc.on_data_sent(PacketSeq::from_raw(10), 1000);

        cc.on_nak(PacketSeq::from_raw(5));
        assert_eq!(cc.sending_rate, 8000.0);
        assert_eq!(cc.last_dec_seq, Some(PacketSeq::from_raw(10)));

        // a NAK older than the newest sent sequence number at the time of the
        // last decrease does not start a new period
        let rate_before = cc.sending_rate;
        cc.on_nak(PacketSeq::from_raw(6));
        assert_eq!(cc.nak_count, 2);
        assert!(cc.sending_rate <= rate_before);
    }

    #[test]
    fn test_rto_halves_sending_rate() {
        let mut cc = congestion_control();
        cc.sending_rate = 5000.0;
        cc.on_rto();
        assert_eq!(cc.sending_rate, 2500.0);
    }

    #[test]
    fn test_tick_allowance_in_slow_start_is_window_bound() {
        let cc = congestion_control();
        assert_eq!(cc.tick_allowance(), MIN_CONGESTION_WINDOW);
    }

    #[test]
    fn test_tick_allowance_subtracts_in_transit_data() {
        let mut cc = congestion_control();
        for i in 0..10 {
            cc.on_data_sent(PacketSeq::from_raw(i), 1000);
        }

        // 10 unacked packets, half assumed in transit
        let expected = MIN_CONGESTION_WINDOW - 5 * 1000;
        assert_eq!(cc.tick_allowance(), expected);
    }

    #[test]
    fn test_tick_allowance_respects_sending_rate() {
        let mut cc = congestion_control();
        cc.sending_rate = 10_000.0;
        assert_eq!(cc.tick_allowance(), 1000);
    }
}
