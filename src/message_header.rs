use crate::sequence::{read24, write24};
use anyhow::bail;
use bitflags::bitflags;
use bytes::{Buf, BufMut};
use std::fmt::{Debug, Formatter};

bitflags! {
    #[derive(Copy, Clone, Eq, PartialEq, Default)]
    pub struct MessageFlags: u8 {
        /// Reserved: message splitting is not implemented.
        const SPLIT_NOT_FIRST = 0x40;
        /// Reserved: message splitting is not implemented.
        const SPLIT_NOT_LAST  = 0x20;
        const PRX             = 0x10;
        const RST             = 0x08;
        const SYN             = 0x04;
        const ACK             = 0x02;
        /// Selective ack is not implemented; a set SACK bit is always invalid.
        const SACK            = 0x01;
    }
}

impl MessageFlags {
    /// SYN-RST-ACK is the close-confirm message, not a message with ack data,
    /// and PRX messages never carry ack data either.
    pub fn has_ack_data(self) -> bool {
        self.contains(MessageFlags::ACK)
            && !self.contains(MessageFlags::RST | MessageFlags::SYN)
            && !self.contains(MessageFlags::PRX)
    }

    pub fn is_control(self) -> bool {
        self.intersects(MessageFlags::PRX | MessageFlags::RST | MessageFlags::SYN)
    }
}

impl Debug for MessageFlags {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for (name, flag) in [
            ("PRX", MessageFlags::PRX),
            ("SYN", MessageFlags::SYN),
            ("RST", MessageFlags::RST),
            ("ACK", MessageFlags::ACK),
            ("SACK", MessageFlags::SACK),
        ] {
            if self.contains(flag) {
                if !first {
                    write!(f, "-")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        if first {
            write!(f, "DATA")?;
        }
        Ok(())
    }
}

/// The length of the sequence number field, which depends on the kind of
/// message: payload-bearing messages carry their 16-bit channel sequence
/// number in a 3-byte field (the packet-header field width, high byte zero),
/// zero-length SYN messages carry the 16-bit initial sequence number in a
/// 2-byte field, and everything else has no sequence number field at all.
fn sequence_number_field_length(payload_length: usize, flags: MessageFlags) -> usize {
    if payload_length != 0 {
        3
    }
    else if flags.contains(MessageFlags::SYN) {
        2
    }
    else {
        0
    }
}

/// The exact message header length for a given (length, flags) combination.
pub fn header_length(payload_length: usize, flags: MessageFlags) -> usize {
    MessageHeader::MIN_LENGTH
        + sequence_number_field_length(payload_length, flags)
        + if flags.has_ack_data() { 2 } else { 0 }
}

/// A message frame header, in parsed form. Several message frames can share
/// one packet; `parse_next_message` walks them.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct MessageHeader {
    pub flags: MessageFlags,
    pub channel_qualifier: u8,
    /// `None` for pure-ACK frames and for messages that carry no sequence
    /// number (unreliable without payload, PRX handshake messages).
    pub sequence_number: Option<u16>,
    pub ack: Option<u16>,
    pub header_length: usize,
    /// Payload length; 0 for a pure-ACK or handshake frame.
    pub length: usize,
}

impl MessageHeader {
    /// flags byte, channel qualifier, 2-byte payload length
    pub const MIN_LENGTH: usize = 4;

    /// Parses one message header from the start of `buf`. Only the header has
    /// to fit into the buffer, not its payload.
    pub fn parse(buf: &[u8]) -> anyhow::Result<MessageHeader> {
        if buf.len() < Self::MIN_LENGTH {
            bail!("message header needs {} bytes, got {}", Self::MIN_LENGTH, buf.len());
        }

        let Some(flags) = MessageFlags::from_bits(buf[0]) else {
            bail!("invalid message flags {:#04x}", buf[0]);
        };
        let channel_qualifier = buf[1];
        let length = u16::from_be_bytes([buf[2], buf[3]]) as usize;

        let header_length = header_length(length, flags);
        if header_length > buf.len() {
            bail!("message header of {} bytes overruns buffer of {}", header_length, buf.len());
        }

        // The sequence number field is present for every SYN message, but for
        // PRX-SYN messages its value is meaningless and must be ignored.
        let has_sequence_number = length != 0
            || (flags.contains(MessageFlags::SYN) && !flags.contains(MessageFlags::PRX));

        let mut cur = &buf[Self::MIN_LENGTH..header_length];
        let sequence_number = match sequence_number_field_length(length, flags) {
            3 => {
                let raw = read24(&mut cur);
                has_sequence_number.then_some(raw as u16)
            }
            2 => {
                let raw = cur.get_u16();
                has_sequence_number.then_some(raw)
            }
            _ => None,
        };
        let ack = flags.has_ack_data().then(|| cur.get_u16());

        Ok(MessageHeader {
            flags,
            channel_qualifier,
            sequence_number,
            ack,
            header_length,
            length,
        })
    }

    /// Advances through the message frames of a packet body. `offset` is
    /// updated past the parsed message and its payload. Returns the header
    /// plus the offset of its payload.
    ///
    /// Fails if a declared payload overruns the buffer or a SACK flag is
    /// present; the caller is expected to drop the rest of the packet.
    pub fn parse_next_message(buf: &[u8], offset: &mut usize) -> anyhow::Result<(MessageHeader, usize)> {
        if *offset + Self::MIN_LENGTH > buf.len() {
            bail!("truncated message frame at offset {}", *offset);
        }

        let header = MessageHeader::parse(&buf[*offset..])?;

        let data_offset = *offset + header.header_length;
        if data_offset + header.length > buf.len() {
            bail!("message payload of {} bytes overruns packet", header.length);
        }

        *offset += header.header_length + header.length;

        if header.flags.contains(MessageFlags::SACK) {
            bail!("SACK is not implemented");
        }

        Ok((header, data_offset))
    }
}

/// Writes one message frame (header plus payload) into `buf` at `offset`.
///
/// Returns the number of bytes written, or 0 if the buffer did not have
/// enough space, in which case nothing is written.
pub fn write_message(
    buf: &mut [u8],
    offset: usize,
    ack: Option<u16>,
    channel_qualifier: u8,
    sequence_number: u16,
    data: &[u8],
    mut flags: MessageFlags,
) -> usize {
    debug_assert!(
        ack.is_none() || (flags | MessageFlags::ACK).has_ack_data(),
        "ack data is not representable for flags {:?}",
        flags
    );

    if ack.is_some() {
        flags |= MessageFlags::ACK;
    }

    let sequence_number_field = sequence_number_field_length(data.len(), flags);
    let total = MessageHeader::MIN_LENGTH
        + sequence_number_field
        + if ack.is_some() { 2 } else { 0 }
        + data.len();

    if buf.len() < offset || buf.len() - offset < total {
        return 0;
    }

    let mut cur = &mut buf[offset..offset + total];
    cur.put_u8(flags.bits());
    cur.put_u8(channel_qualifier);
    cur.put_u16(data.len() as u16);
    match sequence_number_field {
        3 => write24(&mut cur, sequence_number as u32),
        2 => cur.put_u16(sequence_number),
        _ => {}
    }
    if let Some(ack) = ack {
        cur.put_u16(ack);
    }
    cur.put_slice(data);

    total
}
