use crate::packet_header::PacketHeader;
use crate::sequence::PacketSeq;
use crate::types::{INIT_RTO, MAX_RTO, MIN_RTO, TICK_TIME};
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// RTT sampling and RTO computation for one connection.
///
/// RTT is measured via the packet-header RTT request/response fields: at most
/// one request is outstanding at a time, and a new one is armed only when the
/// previous one was answered or a full RTO has passed (probing at most once
/// per RTO, per RFC 6298's spirit).
pub struct ConnTime {
    init_time: Option<Instant>,

    // NB: `rto` is not the value `rto()` returns, only the smoothed base
    // value; the effective RTO additionally depends on `exp_count`.
    rto: Duration,
    srtt: Option<Duration>,
    rttvar: Option<Duration>,

    /// Consecutive RTO timeouts since the last received packet.
    exp_count: u32,

    rtt_request_id: Option<u16>,
    rtt_request_time: Instant,
}

impl ConnTime {
    pub fn new(now: Instant) -> ConnTime {
        ConnTime {
            init_time: None,
            rto: INIT_RTO,
            srtt: None,
            rttvar: None,
            exp_count: 0,
            rtt_request_id: None,
            rtt_request_time: now,
        }
    }

    /// NAT punchthrough measures the direct path with its own ConnTime and
    /// adopts it into the connection when the path switch happens.
    pub fn swap(&mut self, other: &mut ConnTime) {
        std::mem::swap(self, other);
    }

    pub fn on_rto_timeout(&mut self) {
        self.exp_count += 1;
    }

    /// Feeds a received packet: resets the timeout escalation and, if the
    /// packet answers our outstanding RTT request, folds the measured RTT
    /// into the estimator.
    pub fn got_packet(&mut self, now: Instant, header: &PacketHeader) {
        self.exp_count = 0;

        if let Some(response) = header.rtt_response {
            if Some(response.id) == self.rtt_request_id {
                let delay = Duration::from_millis(response.delay_millis as u64);
                let elapsed = now - self.rtt_request_time;
                self.got_rtt_response(elapsed.saturating_sub(delay));
                self.rtt_request_id = None;
            }
        }
    }

    fn got_rtt_response(&mut self, rtt: Duration) {
        const ALPHA: f64 = 0.125;
        const K: u32 = 4;

        match (self.srtt, self.rttvar) {
            (Some(srtt), Some(rttvar)) => {
                let deviation = if srtt > rtt { srtt - rtt } else { rtt - srtt };
                self.srtt = Some(srtt.mul_f64(1.0 - ALPHA) + rtt.mul_f64(ALPHA));
                self.rttvar = Some(rttvar.mul_f64(1.0 - ALPHA) + deviation.mul_f64(ALPHA));
            }
            _ => {
                self.srtt = Some(rtt);
                self.rttvar = Some(rtt / 2);
            }
        }

        self.rto = self.srtt.unwrap() + self.rttvar.unwrap() * K;
        trace!("rtt sample {:?} -> srtt {:?}, rto {:?}", rtt, self.srtt.unwrap(), self.rto);
    }

    /// Arms an RTT request for the packet about to be sent, if probing is
    /// due. Not a getter: a `true` return obliges the caller to actually
    /// send the request.
    #[must_use]
    pub fn rtt_request(&mut self, now: Instant, sequence_number: PacketSeq) -> bool {
        if self.rtt_request_id.is_none() || now - self.rtt_request_time > self.rto() {
            self.rtt_request_time = now;
            self.rtt_request_id = Some(sequence_number.low16());
            true
        }
        else {
            false
        }
    }

    pub fn rtt(&self) -> Option<Duration> {
        self.srtt
    }

    /// The effective RTO: the smoothed base value, inflated by the number of
    /// unanswered timeouts since the last received packet, plus one tick.
    pub fn rto(&self) -> Duration {
        (self.rto * (1 + self.exp_count) + TICK_TIME).clamp(MIN_RTO, MAX_RTO)
    }

    /// The NAK probing interval, roughly two round trips.
    pub fn nak_interval(&self) -> Duration {
        (self.srtt.unwrap_or(INIT_RTO) * 2).clamp(MIN_RTO, MAX_RTO)
    }

    /// Time since the connection was initiated; the first call defines zero.
    pub fn current_time(&mut self, now: Instant) -> Duration {
        match self.init_time {
            Some(init_time) => now - init_time,
            None => {
                self.init_time = Some(now);
                Duration::ZERO
            }
        }
    }

    /// The packet-header timestamp for a packet sent at `now`.
    pub fn timestamp(&mut self, now: Instant) -> u16 {
        self.current_time(now).as_millis() as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet_header::RttResponse;
    use rstest::rstest;

    fn response_header(id: u16, delay_millis: u8) -> PacketHeader {
        PacketHeader {
            rtt_response: Some(RttResponse { id, delay_millis }),
            ..PacketHeader::default()
        }
    }

    #[test]
    fn test_initial_rto() {
        let time = ConnTime::new(Instant::now());
        assert_eq!(time.rto(), INIT_RTO + TICK_TIME);
        assert_eq!(time.rtt(), None);
    }

    #[test]
    fn test_first_sample_initializes_srtt_and_rttvar() {
        let now = Instant::now();
        let mut time = ConnTime::new(now);

        assert!(time.rtt_request(now, PacketSeq::from_raw(5)));
        time.got_packet(now + Duration::from_millis(200), &response_header(5, 0));

        assert_eq!(time.rtt(), Some(Duration::from_millis(200)));
        // srtt + 4 * rttvar = 200ms + 4 * 100ms
        assert_eq!(time.rto(), Duration::from_millis(600) + TICK_TIME);
    }

    #[test]
    fn test_response_delay_is_subtracted() {
        let now = Instant::now();
        let mut time = ConnTime::new(now);

        assert!(time.rtt_request(now, PacketSeq::from_raw(5)));
        time.got_packet(now + Duration::from_millis(200), &response_header(5, 50));

        assert_eq!(time.rtt(), Some(Duration::from_millis(150)));
    }

    #[test]
    fn test_smoothing_follows_rfc_constants() {
        let now = Instant::now();
        let mut time = ConnTime::new(now);

        assert!(time.rtt_request(now, PacketSeq::from_raw(1)));
        time.got_packet(now + Duration::from_millis(100), &response_header(1, 0));

        let t1 = now + Duration::from_secs(10);
        assert!(time.rtt_request(t1, PacketSeq::from_raw(2)));
        time.got_packet(t1 + Duration::from_millis(200), &response_header(2, 0));

        // srtt = 0.875 * 100 + 0.125 * 200 = 112.5ms
        assert_eq!(time.rtt(), Some(Duration::from_micros(112_500)));
    }

    #[test]
    fn test_mismatched_response_id_is_ignored() {
        let now = Instant::now();
        let mut time = ConnTime::new(now);

        assert!(time.rtt_request(now, PacketSeq::from_raw(5)));
        time.got_packet(now + Duration::from_millis(200), &response_header(6, 0));

        assert_eq!(time.rtt(), None);
    }

    #[test]
    fn test_request_is_rate_limited_to_one_per_rto() {
        let now = Instant::now();
        let mut time = ConnTime::new(now);

        assert!(time.rtt_request(now, PacketSeq::from_raw(1)));
        // outstanding and RTO not yet elapsed
        assert!(!time.rtt_request(now + Duration::from_millis(500), PacketSeq::from_raw(2)));
        // a full RTO has passed without a response
        assert!(time.rtt_request(now + Duration::from_secs(2), PacketSeq::from_raw(3)));
    }

    #[test]
    fn test_answered_request_allows_immediate_rearm() {
        let now = Instant::now();
        let mut time = ConnTime::new(now);

        assert!(time.rtt_request(now, PacketSeq::from_raw(1)));
        time.got_packet(now + Duration::from_millis(50), &response_header(1, 0));
        assert!(time.rtt_request(now + Duration::from_millis(60), PacketSeq::from_raw(2)));
    }

    #[rstest]
    #[case(0, 1)]
    #[case(1, 2)]
    #[case(3, 4)]
    fn test_exp_count_inflates_rto(#[case] timeouts: u32, #[case] factor: u32) {
        let mut time = ConnTime::new(Instant::now());
        for _ in 0..timeouts {
            time.on_rto_timeout();
        }
        assert_eq!(time.rto(), (INIT_RTO * factor + TICK_TIME).clamp(MIN_RTO, MAX_RTO));
    }

    #[test]
    fn test_received_packet_resets_exp_count() {
        let now = Instant::now();
        let mut time = ConnTime::new(now);
        time.on_rto_timeout();
        time.on_rto_timeout();

        time.got_packet(now, &PacketHeader::default());
        assert_eq!(time.rto(), INIT_RTO + TICK_TIME);
    }

    #[test]
    fn test_rto_is_clamped() {
        let mut time = ConnTime::new(Instant::now());
        for _ in 0..100 {
            time.on_rto_timeout();
        }
        assert_eq!(time.rto(), MAX_RTO);
    }

    #[test]
    fn test_current_time_is_relative_to_first_call() {
        let now = Instant::now();
        let mut time = ConnTime::new(now);
        assert_eq!(time.current_time(now), Duration::ZERO);
        assert_eq!(time.current_time(now + Duration::from_secs(3)), Duration::from_secs(3));
    }

    #[test]
    fn test_swap() {
        let now = Instant::now();
        let mut a = ConnTime::new(now);
        let mut b = ConnTime::new(now);
        assert!(b.rtt_request(now, PacketSeq::from_raw(1)));
        b.got_packet(now + Duration::from_millis(40), &response_header(1, 0));

        a.swap(&mut b);
        assert_eq!(a.rtt(), Some(Duration::from_millis(40)));
        assert_eq!(b.rtt(), None);
    }
}
