use num_enum::TryFromPrimitive;
use std::fmt::{Debug, Formatter};
use std::time::Duration;

pub const DEFAULT_MTU: usize = 576;
pub const DEFAULT_HEARTBEAT_FREQUENCY: f64 = 0.3;
pub const DEFAULT_TICK_FREQUENCY: f64 = 10.0;
pub const DEFAULT_HEARTBEATS_BEFORE_CONNECTION_WARNING: f64 = 2.5;
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_RECEIVER_BUFFER_SIZE: usize = 2048;
pub const DEFAULT_SENDER_BUFFER_SIZE: usize = 8192;

pub const MIN_RTO: Duration = Duration::from_millis(100);
pub const MAX_RTO: Duration = Duration::from_secs(20);
pub const INIT_RTO: Duration = Duration::from_secs(1);

/// One tick of the send/flush timer. The effective RTO adds one tick interval
/// so that a retransmission scheduled right after a tick does not fire before
/// the next flush had a chance to run.
pub const TICK_TIME: Duration = Duration::from_millis(100);

/// Message channels are multiplexed over one connection. The qualifier byte
/// carries the channel type in its top two bits and the channel number in its
/// low five; bit 5 is reserved and must be zero.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ChannelQualifier(u8);

impl ChannelQualifier {
    pub const DEFAULT: ChannelQualifier = ChannelQualifier(0xc0); // reliable ordered, channel 0

    pub fn new(channel_type: ChannelType, number: u8) -> ChannelQualifier {
        ChannelQualifier(((channel_type as u8) << 6) | (number & 0x1f))
    }

    pub fn from_raw(raw: u8) -> Option<ChannelQualifier> {
        if 0 == raw & 0x20 {
            Some(ChannelQualifier(raw))
        }
        else {
            None
        }
    }

    pub fn to_raw(self) -> u8 {
        self.0
    }

    pub fn channel_type(self) -> ChannelType {
        // The two type bits cover all four enum values, so this cannot fail
        ChannelType::try_from((self.0 & 0xc0) >> 6).expect("two bits always map to a channel type")
    }

    pub fn number(self) -> u8 {
        self.0 & 0x1f
    }

    pub fn is_reliable(self) -> bool {
        matches!(
            self.channel_type(),
            ChannelType::ReliableSequenced | ChannelType::ReliableOrdered
        )
    }
}

impl Debug for ChannelQualifier {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}({})", self.channel_type(), self.number())
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, TryFromPrimitive)]
#[repr(u8)]
pub enum ChannelType {
    Unreliable = 0,
    UnreliableSequenced = 1,
    ReliableSequenced = 2,
    ReliableOrdered = 3,
}

/// Send priority. Only the relative order of the variants is wire-relevant;
/// the send queue currently treats all priorities alike (FIFO).
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub enum Priority {
    Immediate,
    #[default]
    High,
    Medium,
    Low,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum DisconnectReason {
    ThisHostClosed,
    OtherHostClosed,
    ConnectionTimedOut,
    OtherHostDidNotRespond,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ConnectionType {
    Server,
    Client,
    P2P,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum P2pState {
    NotEstablishing,
    Establishing,
    Established,
    Failed,
}

/// The channel a message is sent on: the regular data channels, or the
/// connection-level control channel used for SYN/RST handshake messages.
/// `Control` sorts before every data channel, mirroring its role as the
/// "channel -1" of the wire protocol.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub enum SenderChannel {
    Control,
    Data(ChannelQualifier),
}

impl SenderChannel {
    /// The qualifier byte written to the wire. The control channel has no
    /// qualifier of its own; it is written as zero and identified by its
    /// SYN/RST/PRX flags instead.
    pub fn wire_byte(self) -> u8 {
        match self {
            SenderChannel::Control => 0,
            SenderChannel::Data(cq) => cq.to_raw(),
        }
    }
}
