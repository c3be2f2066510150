use crate::message_header::{self, MessageFlags};
use crate::packet_header::PacketHeader;
use crate::types::{Priority, SenderChannel};
use bytes::{BufMut, Bytes, BytesMut};
use std::net::SocketAddr;

/// A message as it exists on the sender side of the pipeline: queued for the
/// next flush, and, if reliable, retained in the sender buffer until it is
/// acknowledged. Shared ownership between queue and buffer goes through
/// `Arc<Message>`; the payload itself is a cheaply clonable `Bytes`.
pub struct Message {
    pub channel: SenderChannel,
    /// Non-wrapping sequence number; the low 16 bits go onto the wire.
    pub sequence_number: u64,
    pub flags: MessageFlags,
    pub priority: Priority,
    pub data: Bytes,
}

impl Message {
    /// Message header size assuming the largest sequence number and ack
    /// fields. Used for buffer accounting, which must be stable per message.
    pub const MAX_HEADER_SIZE: usize = message_header::MessageHeader::MIN_LENGTH + 3 + 2;

    pub fn data_message(
        channel: SenderChannel,
        sequence_number: u64,
        data: Bytes,
        priority: Priority,
    ) -> Message {
        Message {
            channel,
            sequence_number,
            flags: MessageFlags::empty(),
            priority,
            data,
        }
    }

    /// A SYN/RST handshake message on the control channel.
    pub fn control(flags: MessageFlags, sequence_number: u64) -> Message {
        Message::control_with_data(flags, sequence_number, Bytes::new())
    }

    pub fn control_with_data(flags: MessageFlags, sequence_number: u64, data: Bytes) -> Message {
        Message {
            channel: SenderChannel::Control,
            sequence_number,
            flags,
            priority: Priority::High,
            data,
        }
    }

    /// Upper bound of the encoded size; the sender buffer and the send queue
    /// rely on this being the same value every time for a given message.
    pub fn approximate_size(&self) -> usize {
        Self::MAX_HEADER_SIZE + self.data.len()
    }

    pub fn is_control(&self) -> bool {
        self.flags.is_control()
    }

    pub fn wire_sequence_number(&self) -> u16 {
        self.sequence_number as u16
    }

    /// Writes this message as a frame into `buf` at `offset`; returns the
    /// bytes written, 0 if there was no space.
    pub fn write_into(&self, buf: &mut [u8], offset: usize, ack: Option<u16>) -> usize {
        message_header::write_message(
            buf,
            offset,
            ack,
            self.channel.wire_byte(),
            self.wire_sequence_number(),
            &self.data,
            self.flags,
        )
    }
}

/// Builds a complete single-message control packet (field-less packet header
/// plus one message frame), as used for handshake and punchthrough messages
/// that bypass the send queue's batching.
pub fn write_control_packet(
    timestamp: u16,
    flags: MessageFlags,
    sequence_number: u16,
    data: &[u8],
    mtu: usize,
) -> Option<Vec<u8>> {
    let mut buf = vec![0u8; mtu];

    let header_length = PacketHeader::write_empty(&mut buf, timestamp).ok()?;
    let message_length =
        message_header::write_message(&mut buf, header_length, None, 0, sequence_number, data, flags);
    if 0 == message_length {
        return None;
    }

    buf.truncate(header_length + message_length);
    Some(buf)
}

/// The payload of a PRX-ACK message: this host's view of its own (inner)
/// endpoint, IP address bytes followed by the port, both in network byte
/// order. The mediator combines this with the address it observed to form
/// the endpoint pair used during NAT punchthrough.
pub fn endpoint_bytes(addr: SocketAddr) -> Bytes {
    let mut buf = BytesMut::new();
    match addr {
        SocketAddr::V4(v4) => buf.put_slice(&v4.ip().octets()),
        SocketAddr::V6(v6) => buf.put_slice(&v6.ip().octets()),
    }
    buf.put_u16(addr.port());
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message_header::MessageHeader;
    use std::str::FromStr;

    #[test]
    fn test_control_packet_layout() {
        let packet = write_control_packet(99, MessageFlags::SYN | MessageFlags::RST, 0x0102, &[], 576).unwrap();

        let (packet_header, header_length) = PacketHeader::parse(&packet).unwrap();
        assert_eq!(header_length, PacketHeader::MIN_LENGTH);
        assert_eq!(packet_header.timestamp, 99);
        assert_eq!(packet_header.sequence_number, None);

        let message = MessageHeader::parse(&packet[header_length..]).unwrap();
        assert_eq!(message.flags, MessageFlags::SYN | MessageFlags::RST);
        assert_eq!(message.sequence_number, Some(0x0102));
        assert_eq!(message.length, 0);
        assert_eq!(packet.len(), header_length + message.header_length);
    }

    #[test]
    fn test_control_packet_with_payload_that_does_not_fit() {
        assert!(write_control_packet(0, MessageFlags::PRX, 0, &[0u8; 600], 576).is_none());
    }

    #[test]
    fn test_endpoint_bytes_v4() {
        let addr = SocketAddr::from_str("10.1.2.3:513").unwrap();
        assert_eq!(endpoint_bytes(addr).as_ref(), &[10, 1, 2, 3, 2, 1]);
    }

    #[test]
    fn test_endpoint_bytes_v6() {
        let addr = SocketAddr::from_str("[::1]:256").unwrap();
        let bytes = endpoint_bytes(addr);
        assert_eq!(bytes.len(), 18);
        assert_eq!(&bytes[16..], &[1, 0]);
    }
}
