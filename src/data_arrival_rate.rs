use crate::median_filter::MedianFilter;
use tokio::time::Instant;

/// Receiver-side data arrival rate estimation for the UDT congestion control
/// algorithm: the inter-packet gap of all arriving packets, median-filtered.
pub struct DataArrivalRate {
    last_packet_time: Option<Instant>,
    // bytes per second
    median_filter: MedianFilter,
}

impl DataArrivalRate {
    pub fn new() -> DataArrivalRate {
        DataArrivalRate {
            last_packet_time: None,
            median_filter: MedianFilter::new(512.0),
        }
    }

    /// Call for every received packet; this is cheap.
    pub fn got_packet(&mut self, now: Instant, packet_length: usize) {
        if let Some(last) = self.last_packet_time {
            let gap = now - last;
            if !gap.is_zero() {
                self.median_filter.push_value(packet_length as f64 / gap.as_secs_f64());
            }
        }
        self.last_packet_time = Some(now);
    }

    /// Current data arrival rate in bytes per second. Somewhat costly; meant
    /// to be called per tick, not per packet.
    pub fn calculate(&self) -> f64 {
        self.median_filter.calculate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_steady_arrival_rate() {
        let now = Instant::now();
        let mut rate = DataArrivalRate::new();

        for i in 0..=64u64 {
            // 500 bytes every 5ms = 100_000 B/s
            rate.got_packet(now + Duration::from_millis(5 * i), 500);
        }

        assert!((rate.calculate() - 100_000.0).abs() < 1.0);
    }

    #[test]
    fn test_first_packet_produces_no_sample() {
        let mut rate = DataArrivalRate::new();
        rate.got_packet(Instant::now(), 500);
        assert_eq!(rate.calculate(), 512.0);
    }
}
