//! Cyclic sequence number arithmetic.
//!
//! Packet sequence numbers are 24 bits wide, message (channel) sequence
//! numbers are 16 bits wide. Both wrap around, so all comparisons go through
//! the cyclic helpers in this module. Components that need a total order
//! (loss ranges, receive buffers, sender buffers) expand wrapped numbers
//! into non-wrapping `u64`s by guessing from the value they expect next.

use bytes::{Buf, BufMut};

pub const PACKET_SEQ_BITS: u32 = 24;
pub const PACKET_SEQ_MASK: u32 = 0x00ff_ffff;

/// A 24-bit wrapping packet sequence number.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct PacketSeq(u32);

impl PacketSeq {
    pub const ZERO: PacketSeq = PacketSeq(0);

    pub fn from_raw(raw: u32) -> PacketSeq {
        PacketSeq(raw & PACKET_SEQ_MASK)
    }

    pub fn to_raw(self) -> u32 {
        self.0
    }

    pub fn next(self) -> PacketSeq {
        PacketSeq(self.0.wrapping_add(1) & PACKET_SEQ_MASK)
    }

    pub fn prev(self) -> PacketSeq {
        PacketSeq(self.0.wrapping_sub(1) & PACKET_SEQ_MASK)
    }

    /// The low 16 bits, as used for RTT request/response correlation.
    pub fn low16(self) -> u16 {
        self.0 as u16
    }

    /// Cyclically signed difference `self - other`, positive if `self` is newer.
    pub fn diff_signed(self, other: PacketSeq) -> i32 {
        cyclic_difference_signed::<PACKET_SEQ_BITS>(self.0, other.0)
    }

    /// Cyclic distance from `other` up to `self`.
    pub fn diff(self, other: PacketSeq) -> u32 {
        self.0.wrapping_sub(other.0) & PACKET_SEQ_MASK
    }
}

pub fn cyclic_difference<const BITS: u32>(a: u32, b: u32) -> u32 {
    let mask = (1u32 << BITS) - 1;
    a.wrapping_sub(b) & mask
}

/// Signed cyclic difference `a - b`: positive if `a` is ahead of `b`,
/// interpreting distances above half the cycle as negative.
pub fn cyclic_difference_signed<const BITS: u32>(a: u32, b: u32) -> i32 {
    let diff = cyclic_difference::<BITS>(a, b);
    if diff > ((1u32 << BITS) - 1) / 2 {
        diff as i32 - (1i32 << BITS)
    }
    else {
        diff as i32
    }
}

pub fn cyclic_max16(a: u16, b: u16) -> u16 {
    if cyclic_difference_signed::<16>(a as u32, b as u32) > 0 {
        a
    }
    else {
        b
    }
}

/// Given the non-wrapping sequence number we expect next, guess the
/// non-wrapping value of a wrapped number that just arrived.
///
/// A wrapped number that is (cyclically) older than expected maps to a value
/// below `expected`, a newer one to a value above it. The guess is clamped so
/// it cannot go below zero for numbers older than the start of the stream.
pub fn guess_non_wrapping<const BITS: u32>(expected: u64, wrapped: u32) -> u64 {
    let mask = ((1u64 << BITS) - 1) as u32;

    // positive diff means older than expected
    let diff = cyclic_difference_signed::<BITS>(expected as u32 & mask, wrapped & mask);

    if diff > 0 && diff as u64 > expected {
        wrapped as u64
    }
    else if diff >= 0 {
        expected - diff as u64
    }
    else {
        expected + (-diff) as u64
    }
}

/// Reads a 3-byte sequence number field (low byte first).
pub fn read24(buf: &mut impl Buf) -> u32 {
    let b0 = buf.get_u8() as u32;
    let b1 = buf.get_u8() as u32;
    let b2 = buf.get_u8() as u32;
    b0 | (b1 << 8) | (b2 << 16)
}

/// Writes a 3-byte sequence number field (low byte first).
pub fn write24(buf: &mut impl BufMut, num: u32) {
    buf.put_u8(num as u8);
    buf.put_u8((num >> 8) as u8);
    buf.put_u8((num >> 16) as u8);
}
