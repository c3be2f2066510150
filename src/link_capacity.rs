use crate::median_filter::MedianFilter;
use crate::sequence::PacketSeq;
use tokio::time::Instant;

/// Every 16th packet starts a probe pair that the immediately following
/// packet closes, provided the two are the same size.
const PACKET_PAIR_INTERVAL: u32 = 16;

/// Receiver-side link capacity estimation via the packet-pair technique, as
/// used by the UDT congestion control algorithm: back-to-back equally-sized
/// packets are spread out by the bottleneck link, so their arrival spacing
/// measures its capacity.
pub struct LinkCapacity {
    last_packet: Option<PacketSeq>,
    last_packet_time: Instant,
    last_packet_size: usize,
    // bytes per second
    median_filter: MedianFilter,
}

impl LinkCapacity {
    pub fn new(now: Instant) -> LinkCapacity {
        LinkCapacity {
            last_packet: None,
            last_packet_time: now,
            last_packet_size: 0,
            // Start with 512 B/s. That is sufficiently conservative, while
            // avoiding to confuse the congestion control algorithm with a
            // much too low value (such as 0 or 1)
            median_filter: MedianFilter::new(512.0),
        }
    }

    pub fn got_packet(&mut self, now: Instant, sequence_number: PacketSeq, packet_length: usize) {
        let sn_mod = sequence_number.to_raw() % PACKET_PAIR_INTERVAL;

        if 0 == sn_mod {
            self.last_packet = Some(sequence_number);
            self.last_packet_time = now;
            self.last_packet_size = packet_length;
        }
        else if 1 == sn_mod
            && self.last_packet_size == packet_length
            && self.last_packet.is_some_and(|last| sequence_number.diff_signed(last) == 1)
        {
            let time_difference = now - self.last_packet_time;
            if !time_difference.is_zero() {
                self.median_filter
                    .push_value(packet_length as f64 / time_difference.as_secs_f64());
            }

            // count each packet pair only once
            self.last_packet = None;
        }
    }

    /// Estimated link capacity in bytes per second.
    pub fn calculate(&self) -> f64 {
        self.median_filter.calculate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_packet_pair_measures_capacity() {
        let now = Instant::now();
        let mut capacity = LinkCapacity::new(now);

        for i in 0..64 {
            let base = now + Duration::from_secs(i);
            capacity.got_packet(base, PacketSeq::from_raw(i as u32 * 16), 1000);
            // 1000 bytes in 10ms = 100_000 B/s
            capacity.got_packet(base + Duration::from_millis(10), PacketSeq::from_raw(i as u32 * 16 + 1), 1000);
        }

        assert!((capacity.calculate() - 100_000.0).abs() < 1.0);
    }

    #[test]
    fn test_differently_sized_pair_is_ignored() {
        let now = Instant::now();
        let mut capacity = LinkCapacity::new(now);

        capacity.got_packet(now, PacketSeq::from_raw(16), 1000);
        capacity.got_packet(now + Duration::from_millis(10), PacketSeq::from_raw(17), 500);

        assert_eq!(capacity.calculate(), 512.0);
    }

    #[test]
    fn test_non_consecutive_pair_is_ignored() {
        let now = Instant::now();
        let mut capacity = LinkCapacity::new(now);

        capacity.got_packet(now, PacketSeq::from_raw(16), 1000);
        // 33 is mod-16 == 1 but does not follow 16
        capacity.got_packet(now + Duration::from_millis(10), PacketSeq::from_raw(33), 1000);

        assert_eq!(capacity.calculate(), 512.0);
    }
}
