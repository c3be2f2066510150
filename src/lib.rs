//! A connection-oriented reliable-transport protocol over UDP, providing
//!  per-channel reliability and ordering guarantees while prioritising low
//!  latency over TCP-style fully in-sequence delivery.
//!
//! ## Design goals
//!
//! * The abstraction is sending / receiving *messages* (defined-length chunks
//!   of data as opposed to streams of bytes)
//! * Each connection multiplexes up to 32 logical channels, and each channel
//!   picks its own trade-off between latency and delivery guarantees:
//!   * *unreliable*: fire and forget
//!   * *unreliable sequenced*: fire and forget, but stale messages are
//!     dropped and the application is told how many messages it missed
//!   * *reliable sequenced*: only the newest message is retransmitted; older
//!     unacknowledged ones are abandoned (suitable for state snapshots)
//!   * *reliable ordered*: everything arrives, in order
//! * Loss feedback is negative (NAK) at the packet level, with positive ACKs
//!   only where reliability semantics require them
//! * Congestion control follows the UDT design: the receiver estimates link
//!   capacity (packet pairs) and data arrival rate (inter-packet gap), feeds
//!   them back in packet headers, and the sender derives a congestion window
//!   and sending rate from them
//! * RTT is measured with explicit request/response header fields, at most
//!   one probe per RTO; the RTO follows the TCP computation
//!   (SRTT/RTTVAR, exponential backoff while the peer stays silent)
//! * Connections are explicit: a SYN / SYN-RST / SYN-RST-ACK open handshake,
//!   an RST / SYN-RST-ACK close handshake, heartbeats while idle, and a
//!   connection timeout with a warning ("connection lost") stage
//! * Peer-to-peer connections are set up through a relaying mediator and
//!   then migrated to a direct path via NAT punchthrough: both peers probe
//!   each other's inner and outer endpoint candidates with HMAC-authenticated
//!   PRX-SYN messages, the first valid answer wins (the inner endpoint wins
//!   late if both answer), and the relay is torn down afterwards
//!
//! ## Packet header
//!
//! All packets start with a variable-length header whose length is fully
//! determined by its first byte (numbers in network byte order unless noted):
//!
//! ```ascii
//! 0:  flags (8 bits):
//!     * 0x01 sequence number present
//!     * 0x02 ack present
//!     * 0x04 nak present
//!     * 0x08 link capacity present
//!     * 0x10 arrival rate present
//!     * 0x20 rtt request present
//!     * 0x40 rtt response present
//!     * 0x80 invalid
//! 1:  timestamp (u16): connection-relative send time in milliseconds
//! 3:  sequence number (3 bytes, low byte first), if flagged
//! *:  ack (3 bytes), nak (3 bytes), link capacity (u32), arrival rate (u32),
//!     rtt request (u16), rtt response (u16 + 1 delay byte), each if flagged
//! ```
//!
//! A packet that is only a header is a heartbeat.
//!
//! ## Message header
//!
//! The packet body is a sequence of message frames:
//!
//! ```ascii
//! 0:  flags (8 bits): 0x40/0x20 split (reserved, not implemented), 0x10 PRX,
//!     0x08 RST, 0x04 SYN, 0x02 ACK, 0x01 SACK (always invalid)
//! 1:  channel qualifier: bits 6-7 channel type, bits 0-4 channel number,
//!     bit 5 reserved (must be 0)
//! 2:  payload length (u16)
//! 4:  sequence number: 3 bytes (low byte first) if the payload length is
//!     non-zero, else 2 bytes (u16) for SYN messages, else absent
//! *:  ack (u16), only for ACK messages that are neither PRX nor SYN-RST-ACK
//! *:  payload
//! ```
//!
//! The (PRX, SYN, RST, ACK) flag combination selects the message type:
//! SYN is a connect request, SYN-RST the connect reply, RST a close request,
//! SYN-RST-ACK both the close confirmation and the final leg of the open
//! handshake; the PRX combinations belong to the NAT punchthrough
//! sub-protocol. Everything else is a data message.
//!
//! Message sequence numbers are 16-bit values; the 3-byte wire field keeps
//! its high byte zero. Messages bigger than one MTU-sized packet cannot be
//! sent: the split flag bits exist in the wire format, but splitting is not
//! implemented.
//!
//! ## Concurrency model
//!
//! A connection is not internally parallel: every UDP receive, timer
//! callback and API call for it is serialized through one lock, and delegate
//! callbacks fire only after the triggering event has been fully processed.
//! Independent connections do not share mutable state and run concurrently.
//!
//! ## Related
//!
//! * UDT, whose congestion control this protocol adapts
//!   * optimized for bulk data over fast, lossy networks; single channel
//! * QUIC
//!   * stream multiplexing and connection migration, but stream-oriented,
//!     with enforced TLS and a far bigger surface
//! * ENet / RakNet
//!   * the same channel-based selective-reliability idea for games; RakNet
//!     is also where the NAT punchthrough approach is borrowed from

mod config;
mod congestion_control;
mod conn_time;
mod connection;
mod data_arrival_rate;
mod error;
mod link_capacity;
mod logical_connection;
mod loss_list;
mod median_filter;
mod message;
mod message_handler;
mod message_header;
mod nat_punchthrough;
mod packet_header;
mod receiver_buffer;
mod rto_timer;
mod send_queue;
mod sender_buffer;
mod sequence;
mod socket;
mod types;

pub use config::SockConfig;
pub use connection::{Connection, ConnectionDelegate};
pub use error::RudpError;
pub use socket::{DatagramSocket, RudpSocket, SocketDelegate};
pub use types::{
    ChannelQualifier, ChannelType, ConnectionType, DisconnectReason, P2pState, Priority,
};
