use crate::sequence::{read24, write24, PacketSeq};
use anyhow::bail;
use bitflags::bitflags;
use bytes::{Buf, BufMut};
use std::fmt::{Debug, Formatter};

bitflags! {
    #[derive(Copy, Clone, Eq, PartialEq, Debug)]
    pub struct PacketFlags: u8 {
        const SEQUENCE_NUMBER = 0x01;
        const ACK             = 0x02;
        const NAK             = 0x04;
        const LINK_CAPACITY   = 0x08;
        const ARRIVAL_RATE    = 0x10;
        const RTT_REQUEST     = 0x20;
        const RTT_RESPONSE    = 0x40;
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct RttResponse {
    /// Low 16 bits of the packet sequence number that requested the probe.
    pub id: u16,
    /// Milliseconds between receiving the request and sending this response.
    pub delay_millis: u8,
}

/// The per-packet header. Apart from the flags byte and the timestamp, every
/// field is optional and gated by its flag bit, so the wire length is fully
/// determined by the flags byte before anything else is parsed.
///
/// A packet whose header carries no optional fields and no message frames is
/// a heartbeat.
#[derive(Clone, Eq, PartialEq, Default)]
pub struct PacketHeader {
    /// Connection-relative send time in milliseconds, mod 2^16.
    pub timestamp: u16,
    pub sequence_number: Option<PacketSeq>,
    pub ack: Option<PacketSeq>,
    pub nak: Option<PacketSeq>,
    /// Estimated link capacity in bytes per second.
    pub link_capacity: Option<u32>,
    /// Measured data arrival rate in bytes per second.
    pub arrival_rate: Option<u32>,
    pub rtt_request: Option<u16>,
    pub rtt_response: Option<RttResponse>,
}

impl Debug for PacketHeader {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "PKT{{@{}", self.timestamp)?;
        if let Some(sn) = self.sequence_number {
            write!(f, " #{}", sn.to_raw())?;
        }
        if let Some(ack) = self.ack {
            write!(f, " ack:{}", ack.to_raw())?;
        }
        if let Some(nak) = self.nak {
            write!(f, " nak:{}", nak.to_raw())?;
        }
        write!(f, "}}")
    }
}

impl PacketHeader {
    /// flags byte + timestamp
    pub const MIN_LENGTH: usize = 3;

    pub fn flags(&self) -> PacketFlags {
        let mut flags = PacketFlags::empty();
        if self.sequence_number.is_some() {
            flags |= PacketFlags::SEQUENCE_NUMBER;
        }
        if self.ack.is_some() {
            flags |= PacketFlags::ACK;
        }
        if self.nak.is_some() {
            flags |= PacketFlags::NAK;
        }
        if self.link_capacity.is_some() {
            flags |= PacketFlags::LINK_CAPACITY;
        }
        if self.arrival_rate.is_some() {
            flags |= PacketFlags::ARRIVAL_RATE;
        }
        if self.rtt_request.is_some() {
            flags |= PacketFlags::RTT_REQUEST;
        }
        if self.rtt_response.is_some() {
            flags |= PacketFlags::RTT_RESPONSE;
        }
        flags
    }

    /// The wire length implied by a flags byte.
    pub fn length_for_flags(flags: PacketFlags) -> usize {
        let mut len = Self::MIN_LENGTH;
        if flags.contains(PacketFlags::SEQUENCE_NUMBER) {
            len += 3;
        }
        if flags.contains(PacketFlags::ACK) {
            len += 3;
        }
        if flags.contains(PacketFlags::NAK) {
            len += 3;
        }
        if flags.contains(PacketFlags::LINK_CAPACITY) {
            len += 4;
        }
        if flags.contains(PacketFlags::ARRIVAL_RATE) {
            len += 4;
        }
        if flags.contains(PacketFlags::RTT_REQUEST) {
            len += 2;
        }
        if flags.contains(PacketFlags::RTT_RESPONSE) {
            len += 3;
        }
        len
    }

    pub fn serialized_length(&self) -> usize {
        Self::length_for_flags(self.flags())
    }

    /// Parses a packet header from the start of `buf`. Returns the header and
    /// its length. Only the header needs to fit in the buffer, not the whole
    /// packet.
    pub fn parse(buf: &[u8]) -> anyhow::Result<(PacketHeader, usize)> {
        if buf.is_empty() {
            bail!("empty packet");
        }

        let Some(flags) = PacketFlags::from_bits(buf[0]) else {
            bail!("invalid packet flags {:#04x}", buf[0]);
        };

        let header_length = Self::length_for_flags(flags);
        if buf.len() < header_length {
            bail!("packet of {} bytes too short for header of {} bytes", buf.len(), header_length);
        }

        let mut cur = &buf[1..header_length];
        let mut header = PacketHeader {
            timestamp: cur.get_u16(),
            ..PacketHeader::default()
        };

        if flags.contains(PacketFlags::SEQUENCE_NUMBER) {
            header.sequence_number = Some(PacketSeq::from_raw(read24(&mut cur)));
        }
        if flags.contains(PacketFlags::ACK) {
            header.ack = Some(PacketSeq::from_raw(read24(&mut cur)));
        }
        if flags.contains(PacketFlags::NAK) {
            header.nak = Some(PacketSeq::from_raw(read24(&mut cur)));
        }
        if flags.contains(PacketFlags::LINK_CAPACITY) {
            header.link_capacity = Some(cur.get_u32());
        }
        if flags.contains(PacketFlags::ARRIVAL_RATE) {
            header.arrival_rate = Some(cur.get_u32());
        }
        if flags.contains(PacketFlags::RTT_REQUEST) {
            header.rtt_request = Some(cur.get_u16());
        }
        if flags.contains(PacketFlags::RTT_RESPONSE) {
            header.rtt_response = Some(RttResponse {
                id: cur.get_u16(),
                delay_millis: cur.get_u8(),
            });
        }

        Ok((header, header_length))
    }

    /// Writes the header into the start of `buf`, returning the number of
    /// bytes written. Fails without writing anything if the buffer is too
    /// small.
    pub fn write(&self, buf: &mut [u8]) -> anyhow::Result<usize> {
        let header_length = self.serialized_length();
        if buf.len() < header_length {
            bail!("buffer of {} bytes too small for header of {} bytes", buf.len(), header_length);
        }

        let mut cur = &mut buf[..header_length];
        cur.put_u8(self.flags().bits());
        cur.put_u16(self.timestamp);

        if let Some(sn) = self.sequence_number {
            write24(&mut cur, sn.to_raw());
        }
        if let Some(ack) = self.ack {
            write24(&mut cur, ack.to_raw());
        }
        if let Some(nak) = self.nak {
            write24(&mut cur, nak.to_raw());
        }
        if let Some(cap) = self.link_capacity {
            cur.put_u32(cap);
        }
        if let Some(rate) = self.arrival_rate {
            cur.put_u32(rate);
        }
        if let Some(req) = self.rtt_request {
            cur.put_u16(req);
        }
        if let Some(resp) = self.rtt_response {
            cur.put_u16(resp.id);
            cur.put_u8(resp.delay_millis);
        }

        Ok(header_length)
    }

    /// Writes a field-less header as used for control packets and heartbeats.
    pub fn write_empty(buf: &mut [u8], timestamp: u16) -> anyhow::Result<usize> {
        PacketHeader {
            timestamp,
            ..PacketHeader::default()
        }
        .write(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn full_header() -> PacketHeader {
        PacketHeader {
            timestamp: 4711,
            sequence_number: Some(PacketSeq::from_raw(0xab_cdef)),
            ack: Some(PacketSeq::from_raw(17)),
            nak: Some(PacketSeq::from_raw(0xff_ffff)),
            link_capacity: Some(1_000_000),
            arrival_rate: Some(65_536),
            rtt_request: Some(0xcdef),
            rtt_response: Some(RttResponse { id: 3, delay_millis: 250 }),
        }
    }

    #[rstest]
    #[case::empty(PacketHeader::default())]
    #[case::seq_only(PacketHeader { timestamp: 1, sequence_number: Some(PacketSeq::from_raw(7)), ..PacketHeader::default() })]
    #[case::ack_only(PacketHeader { ack: Some(PacketSeq::from_raw(99)), ..PacketHeader::default() })]
    #[case::nak(PacketHeader { sequence_number: Some(PacketSeq::from_raw(8)), nak: Some(PacketSeq::from_raw(5)), ..PacketHeader::default() })]
    #[case::metrics(PacketHeader { link_capacity: Some(512), arrival_rate: Some(9000), rtt_request: Some(42), ..PacketHeader::default() })]
    #[case::rtt_response(PacketHeader { rtt_response: Some(RttResponse { id: 0xffff, delay_millis: 0 }), ..PacketHeader::default() })]
    #[case::everything(full_header())]
    fn test_round_trip(#[case] header: PacketHeader) {
        let mut buf = [0u8; 64];
        let written = header.write(&mut buf).unwrap();
        assert_eq!(written, header.serialized_length());

        let (parsed, parsed_len) = PacketHeader::parse(&buf[..written]).unwrap();
        assert_eq!(parsed_len, written);
        assert_eq!(parsed, header);
    }

    #[rstest]
    #[case(PacketFlags::empty(), 3)]
    #[case(PacketFlags::SEQUENCE_NUMBER, 6)]
    #[case(PacketFlags::SEQUENCE_NUMBER | PacketFlags::ACK, 9)]
    #[case(PacketFlags::NAK, 6)]
    #[case(PacketFlags::LINK_CAPACITY | PacketFlags::ARRIVAL_RATE, 11)]
    #[case(PacketFlags::RTT_REQUEST, 5)]
    #[case(PacketFlags::RTT_RESPONSE, 6)]
    #[case(PacketFlags::all(), 25)]
    fn test_length_for_flags(#[case] flags: PacketFlags, #[case] expected: usize) {
        assert_eq!(PacketHeader::length_for_flags(flags), expected);
    }

    #[test]
    fn test_parse_rejects_truncated_header() {
        let mut buf = [0u8; 64];
        let written = full_header().write(&mut buf).unwrap();

        for len in 0..written {
            assert!(PacketHeader::parse(&buf[..len]).is_err(), "accepted {} bytes", len);
        }
    }

    #[test]
    fn test_parse_rejects_reserved_flag_bit() {
        assert!(PacketHeader::parse(&[0x80, 0, 0]).is_err());
    }

    #[test]
    fn test_write_rejects_small_buffer() {
        let mut buf = [0u8; 4];
        assert!(full_header().write(&mut buf).is_err());
    }

    #[test]
    fn test_write_empty_is_a_heartbeat() {
        let mut buf = [0u8; 8];
        let written = PacketHeader::write_empty(&mut buf, 17).unwrap();
        assert_eq!(written, PacketHeader::MIN_LENGTH);

        let (parsed, len) = PacketHeader::parse(&buf[..written]).unwrap();
        assert_eq!(len, written);
        assert_eq!(parsed.flags(), PacketFlags::empty());
        assert_eq!(parsed.timestamp, 17);
    }
}
