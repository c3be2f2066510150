use crate::error::RudpError;
use crate::message::Message;
use crate::message_header::{MessageFlags, MessageHeader};
use crate::packet_header::PacketHeader;
use crate::receiver_buffer::ReceiverBuffer;
use crate::send_queue::{PacketContext, SendQueue};
use crate::sender_buffer::SenderBuffer;
use crate::sequence::guess_non_wrapping;
use crate::types::*;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Events produced by connection processing, dispatched to the connection
/// delegate after the triggering datagram or call has been fully handled.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// The open handshake finished (or failed, for the initiating side).
    Opened { error: Option<DisconnectReason> },
    Message { channel: ChannelQualifier, data: Bytes },
    Disconnected(DisconnectReason),
    /// Traffic resumed after a connection-lost warning. (The warning itself
    /// is raised directly by the timer, outside regular processing.)
    ConnectionRegained,
    /// One or more messages on an unreliable sequenced channel are known to
    /// have been skipped.
    PacketLoss { channel: ChannelQualifier, count: u64 },
    P2p(P2pState),
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum State {
    Opening,
    Open,
    Closing,
    Closed,
}

/// Everything the logical connection needs to act on an inbound message or
/// an API call: the sibling components of its connection, plus the output
/// collectors for packets and delegate events.
pub struct ConnContext<'a> {
    pub now: Instant,
    pub sender_buffer: &'a mut SenderBuffer,
    pub receiver_buffer: &'a mut ReceiverBuffer,
    pub send_queue: &'a mut SendQueue,
    pub packet: PacketContext<'a>,
    pub out: &'a mut Vec<Vec<u8>>,
    pub events: &'a mut Vec<ConnectionEvent>,
    /// Set when something was queued that the tick timer should flush.
    pub needs_tick: &'a mut bool,
}

/// The connection state machine: open/close handshake and the per-channel
/// reliability and ordering semantics.
pub struct LogicalConnection {
    state: State,
    conn_type: ConnectionType,

    /// The connect() callback has not fired yet (client/P2P side).
    opened_callback_pending: bool,

    initial_sequence_number: u16,
    other_host_initial_sequence_number: u16,

    /// Next sequence number to send, per channel (non-wrapping).
    sequence_memo: FxHashMap<u8, u64>,
    /// Next expected inbound sequence number, per channel (non-wrapping).
    other_host_sequence_memo: FxHashMap<u8, u64>,
    /// The single not-yet-acked message per reliable sequenced channel.
    reliable_sequenced_buffer: FxHashMap<u8, u64>,

    syn_msg_sequence_number: Option<u64>,
    rst_enqueued: bool,
    /// Cookie sent with the SYN of a P2P connection.
    p2p_cookie: Option<Bytes>,
}

impl LogicalConnection {
    /// A connection that initiates the handshake (client or P2P). The SYN is
    /// registered as a reliable message, so it is retransmitted on RTO until
    /// the SYN-RST reply arrives.
    pub fn new_client(
        conn_type: ConnectionType,
        initial_sequence_number: u16,
        p2p_cookie: Option<Bytes>,
        ctx: &mut ConnContext<'_>,
    ) -> LogicalConnection {
        let mut conn = LogicalConnection {
            state: State::Opening,
            conn_type,
            opened_callback_pending: true,
            initial_sequence_number,
            other_host_initial_sequence_number: 0,
            sequence_memo: FxHashMap::default(),
            other_host_sequence_memo: FxHashMap::default(),
            reliable_sequenced_buffer: FxHashMap::default(),
            syn_msg_sequence_number: None,
            rst_enqueued: false,
            p2p_cookie,
        };
        conn.send_syn(ctx);
        conn
    }

    /// A connection accepted from an inbound SYN; replies SYN-RST right away
    /// and waits for the handshake ack.
    pub fn new_server(
        initial_sequence_number: u16,
        other_host_initial_sequence_number: u16,
        ctx: &mut ConnContext<'_>,
    ) -> LogicalConnection {
        let mut conn = LogicalConnection {
            state: State::Opening,
            conn_type: ConnectionType::Server,
            opened_callback_pending: false,
            initial_sequence_number,
            other_host_initial_sequence_number,
            sequence_memo: FxHashMap::default(),
            other_host_sequence_memo: FxHashMap::default(),
            reliable_sequenced_buffer: FxHashMap::default(),
            syn_msg_sequence_number: None,
            rst_enqueued: false,
            p2p_cookie: None,
        };
        conn.resend_init_message(ctx);
        conn
    }

    fn send_syn(&mut self, ctx: &mut ConnContext<'_>) {
        let cookie = self.p2p_cookie.clone().unwrap_or_default();
        let msg = Arc::new(Message::control_with_data(
            MessageFlags::SYN,
            self.initial_sequence_number as u64,
            cookie,
        ));

        self.syn_msg_sequence_number = Some(msg.sequence_number);

        // The SYN should be the first message on the whole connection, so
        // registering it cannot meaningfully fail.
        ctx.sender_buffer
            .register_reliable_message(ctx.now, msg.clone())
            .expect("sender buffer cannot be full before the handshake");
        ctx.send_queue.enqueue_message(ctx.now, msg, &mut ctx.packet, ctx.out);
    }

    /// (Re-)sends the handshake reply. Used on construction of a server
    /// connection and whenever a duplicate SYN indicates the reply was lost.
    pub fn resend_init_message(&mut self, ctx: &mut ConnContext<'_>) {
        let msg = Arc::new(Message::control(
            MessageFlags::SYN | MessageFlags::RST,
            self.initial_sequence_number as u64,
        ));
        ctx.send_queue.enqueue_message(ctx.now, msg, &mut ctx.packet, ctx.out);
    }

    fn release_syn_msg(&mut self, ctx: &mut ConnContext<'_>) {
        if let Some(sn) = self.syn_msg_sequence_number.take() {
            ctx.sender_buffer.deregister_reliable_messages(SenderChannel::Control, sn);
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_opening(&self) -> bool {
        self.state == State::Opening
    }

    pub fn is_open(&self) -> bool {
        self.state == State::Open
    }

    pub fn is_closed(&self) -> bool {
        self.state == State::Closed
    }

    pub fn connection_type(&self) -> ConnectionType {
        self.conn_type
    }

    pub fn other_host_initial_sequence_number(&self) -> u16 {
        self.other_host_initial_sequence_number
    }

    fn next_send_sequence_number(&self, channel_qualifier: u8) -> u64 {
        self.sequence_memo
            .get(&channel_qualifier)
            .copied()
            .unwrap_or(self.initial_sequence_number as u64)
    }

    fn expected_recv_sequence_number(&self, channel_qualifier: u8) -> u64 {
        self.other_host_sequence_memo
            .get(&channel_qualifier)
            .copied()
            .unwrap_or(self.other_host_initial_sequence_number as u64)
    }

    /// Expands an inbound 16-bit ack into the non-wrapping sequence number
    /// space of our outbound channel, capped at the newest sent number.
    fn guess_acked_sequence_number(&self, channel_qualifier: u8, ack: u16) -> u64 {
        let next_to_send = self.next_send_sequence_number(channel_qualifier);
        guess_non_wrapping::<16>(next_to_send, ack as u32).min(next_to_send.saturating_sub(1))
    }

    /// Sends a message on a channel. For reliable channel types the message
    /// is additionally retained in the sender buffer until acknowledged.
    pub fn send(
        &mut self,
        data: Bytes,
        channel: ChannelQualifier,
        priority: Priority,
        max_message_size: usize,
        ctx: &mut ConnContext<'_>,
    ) -> Result<(), RudpError> {
        if self.state == State::Closed || self.state == State::Closing {
            return Err(RudpError::Closed);
        }
        if data.is_empty() {
            return Err(RudpError::EmptyMessage);
        }
        if data.len() > max_message_size {
            return Err(RudpError::MessageTooBig {
                size: data.len(),
                max: max_message_size,
            });
        }

        let cq = channel.to_raw();
        let prev_sequence_memo = self.next_send_sequence_number(cq);

        let msg = Arc::new(Message::data_message(
            SenderChannel::Data(channel),
            prev_sequence_memo,
            data,
            priority,
        ));
        self.sequence_memo.insert(cq, prev_sequence_memo + 1);

        let prev_reliable_sequenced_slot = if ChannelType::ReliableSequenced == channel.channel_type() {
            // only the newest message per reliable sequenced channel is kept
            // for retransmission
            let prev_slot = self.reliable_sequenced_buffer.insert(cq, msg.sequence_number);
            if prev_slot.is_some() {
                ctx.sender_buffer
                    .deregister_reliable_messages(SenderChannel::Data(channel), prev_sequence_memo);
            }
            prev_slot
        }
        else {
            None
        };

        if channel.is_reliable() {
            if let Err(err) = ctx.sender_buffer.register_reliable_message(ctx.now, msg.clone()) {
                // undo the sequence bump; the message was never sent
                self.sequence_memo.insert(cq, prev_sequence_memo);
                match prev_reliable_sequenced_slot {
                    Some(prev) => {
                        self.reliable_sequenced_buffer.insert(cq, prev);
                    }
                    None => {
                        self.reliable_sequenced_buffer.remove(&cq);
                    }
                }
                return Err(err);
            }
        }

        ctx.send_queue.enqueue_message(ctx.now, msg, &mut ctx.packet, ctx.out);
        *ctx.needs_tick = true;

        Ok(())
    }

    /// Initiates the close handshake. The actual RST control message goes
    /// out once the sender buffer has drained, so reliable messages already
    /// in flight get a chance to finish.
    pub fn close(&mut self, ctx: &mut ConnContext<'_>) -> Result<(), RudpError> {
        if self.state == State::Closing || self.state == State::Closed {
            return Err(RudpError::Closed);
        }

        if self.state == State::Opening {
            // cancel the opening process
            self.release_syn_msg(ctx);
            if self.opened_callback_pending {
                self.opened_callback_pending = false;
                ctx.events.push(ConnectionEvent::Opened {
                    error: Some(DisconnectReason::ThisHostClosed),
                });
            }
        }

        self.state = State::Closing;
        self.maybe_enqueue_rst(ctx);

        Ok(())
    }

    fn maybe_enqueue_rst(&mut self, ctx: &mut ConnContext<'_>) {
        if self.state != State::Closing || self.rst_enqueued || !ctx.sender_buffer.is_empty() {
            return;
        }

        debug!("sender buffer drained, sending RST");
        self.rst_enqueued = true;

        let msg = Arc::new(Message::control(
            MessageFlags::RST,
            self.initial_sequence_number as u64,
        ));
        if ctx
            .sender_buffer
            .register_reliable_message(ctx.now, msg.clone())
            .is_ok()
        {
            ctx.send_queue.enqueue_message(ctx.now, msg, &mut ctx.packet, ctx.out);
        }
    }

    /// The handshake reply arrived. Only valid while this (initiating) side
    /// is still opening; replies with the handshake ack and fires the open
    /// callback.
    pub fn got_syn_rst(&mut self, other_host_initial_sequence_number: u16, ctx: &mut ConnContext<'_>) -> bool {
        if self.state != State::Opening || self.conn_type == ConnectionType::Server {
            return false;
        }

        self.release_syn_msg(ctx);
        self.other_host_initial_sequence_number = other_host_initial_sequence_number;
        self.state = State::Open;

        let ack = Arc::new(Message::control(
            MessageFlags::SYN | MessageFlags::RST | MessageFlags::ACK,
            0,
        ));
        ctx.send_queue.enqueue_message(ctx.now, ack, &mut ctx.packet, ctx.out);

        if self.opened_callback_pending {
            self.opened_callback_pending = false;
            ctx.events.push(ConnectionEvent::Opened { error: None });
        }

        true
    }

    /// SYN-RST-ACK is context dependent: for a server connection still in
    /// the handshake it completes the open; otherwise it confirms the close
    /// handshake.
    pub fn got_syn_rst_ack(&mut self, ctx: &mut ConnContext<'_>) {
        if self.conn_type == ConnectionType::Server && self.state == State::Opening {
            debug!("handshake ack received, connection open");
            self.state = State::Open;
            return;
        }

        if self.state == State::Closed {
            // duplicate close confirms are part of normal operation
            return;
        }

        // The other host could send a close confirm without this host ever
        // having initiated a close; report that as the other host closing,
        // which is closer to the truth than claiming this host did.
        let reason = if self.state == State::Closing {
            DisconnectReason::ThisHostClosed
        }
        else {
            DisconnectReason::OtherHostClosed
        };
        self.state = State::Closed;
        ctx.events.push(ConnectionEvent::Disconnected(reason));
    }

    /// The other host requests a close. The SYN-RST-ACK reply is sent by the
    /// message handler regardless of connection state.
    pub fn got_rst(&mut self, ctx: &mut ConnContext<'_>) {
        if self.state != State::Closed {
            self.state = State::Closed;
            ctx.events.push(ConnectionEvent::Disconnected(DisconnectReason::OtherHostClosed));
        }
    }

    /// Forced teardown without (or after) the close handshake.
    pub fn was_closed(&mut self, reason: DisconnectReason, events: &mut Vec<ConnectionEvent>) {
        if self.opened_callback_pending {
            self.opened_callback_pending = false;
            events.push(ConnectionEvent::Opened {
                error: Some(DisconnectReason::OtherHostDidNotRespond),
            });
        }

        if self.state != State::Closed {
            self.state = State::Closed;
            events.push(ConnectionEvent::Disconnected(reason));
        }
    }

    /// Applies the per-channel-type receive semantics to one data message.
    /// Returns false if the message was dropped (out of order, protocol
    /// violation, or buffered for later).
    pub fn got_message(&mut self, header: &MessageHeader, data: Bytes, ctx: &mut ConnContext<'_>) -> bool {
        if self.state == State::Closed {
            return false;
        }

        if header
            .flags
            .intersects(MessageFlags::SPLIT_NOT_FIRST | MessageFlags::SPLIT_NOT_LAST)
        {
            debug!("got message with split flags, which are not supported - dropping");
            return false;
        }

        let Some(channel) = ChannelQualifier::from_raw(header.channel_qualifier) else {
            debug!("got message with invalid channel qualifier {:#04x} - dropping", header.channel_qualifier);
            return false;
        };

        // a server connection that sees data has had its handshake ack
        // swallowed; the traffic itself proves the other side is open
        if self.conn_type == ConnectionType::Server && self.state == State::Opening {
            self.state = State::Open;
        }

        match channel.channel_type() {
            ChannelType::Unreliable | ChannelType::UnreliableSequenced => {
                self.got_unreliable_message(channel, header, data, ctx)
            }
            ChannelType::ReliableSequenced => {
                self.got_reliable_sequenced_message(channel, header, data, ctx)
            }
            ChannelType::ReliableOrdered => {
                self.got_reliable_ordered_message(channel, header, data, ctx)
            }
        }
    }

    fn got_unreliable_message(
        &mut self,
        channel: ChannelQualifier,
        header: &MessageHeader,
        data: Bytes,
        ctx: &mut ConnContext<'_>,
    ) -> bool {
        if header.flags.contains(MessageFlags::ACK) {
            debug!("got unreliable message with ACK flag - dropping");
            return false;
        }

        if ChannelType::UnreliableSequenced == channel.channel_type() {
            if let Some(sequence_number) = header.sequence_number {
                let expected = self.expected_recv_sequence_number(channel.to_raw());
                let guessed = guess_non_wrapping::<16>(expected, sequence_number as u32);

                self.other_host_sequence_memo
                    .insert(channel.to_raw(), expected.max(guessed + 1));

                if guessed < expected {
                    // arrived out of order; drop it
                    return false;
                }
                if guessed > expected {
                    ctx.events.push(ConnectionEvent::PacketLoss {
                        channel,
                        count: guessed - expected,
                    });
                }
            }
        }

        if 0 != header.length {
            ctx.events.push(ConnectionEvent::Message { channel, data });
        }
        true
    }

    fn got_reliable_sequenced_message(
        &mut self,
        channel: ChannelQualifier,
        header: &MessageHeader,
        data: Bytes,
        ctx: &mut ConnContext<'_>,
    ) -> bool {
        if let Some(sequence_number) = header.sequence_number {
            let expected = self.expected_recv_sequence_number(channel.to_raw());
            let guessed = guess_non_wrapping::<16>(expected, sequence_number as u32);

            self.other_host_sequence_memo
                .insert(channel.to_raw(), expected.max(guessed + 1));

            if guessed < expected {
                // arrived out of order; drop it
                return false;
            }

            // every message on this channel type is acked individually
            if ctx.send_queue.enqueue_ack(channel.to_raw(), sequence_number) {
                *ctx.needs_tick = true;
            }
        }

        if let Some(ack) = header.ack {
            // deregister only if it acks the newest message on the channel;
            // anything older is already superseded
            if self.reliable_sequenced_buffer.get(&channel.to_raw()).copied()
                .is_some_and(|slot| slot as u16 == ack)
            {
                let slot = self.reliable_sequenced_buffer.remove(&channel.to_raw()).unwrap();
                ctx.sender_buffer
                    .deregister_reliable_messages(SenderChannel::Data(channel), slot);
                self.maybe_enqueue_rst(ctx);
            }
        }

        if 0 != header.length {
            ctx.events.push(ConnectionEvent::Message { channel, data });
        }
        true
    }

    fn got_reliable_ordered_message(
        &mut self,
        channel: ChannelQualifier,
        header: &MessageHeader,
        data: Bytes,
        ctx: &mut ConnContext<'_>,
    ) -> bool {
        let expected = self.expected_recv_sequence_number(channel.to_raw());
        let guessed = header
            .sequence_number
            .map(|sn| guess_non_wrapping::<16>(expected, sn as u32));

        if let Some(guessed) = guessed {
            if guessed <= expected {
                // ack what we have: the received number if it is the expected
                // one, else the newest in-order number we know
                let ack = if guessed == expected { guessed } else { expected - 1 };
                if ctx.send_queue.enqueue_ack(channel.to_raw(), ack as u16) {
                    *ctx.needs_tick = true;
                }
            }
        }

        if let Some(ack) = header.ack {
            let acked = self.guess_acked_sequence_number(channel.to_raw(), ack);
            ctx.sender_buffer
                .deregister_reliable_messages(SenderChannel::Data(channel), acked);
            self.maybe_enqueue_rst(ctx);
        }

        let Some(guessed) = guessed else {
            // a pure-ACK frame
            return true;
        };

        if guessed != expected {
            if guessed > expected {
                // newer than expected: hold it until the gap is filled
                trace!("buffering ahead-of-sequence message #{} on {:?}", guessed, channel);
                ctx.receiver_buffer.buffer_message(guessed, header.clone(), data);
            }
            return false;
        }

        self.other_host_sequence_memo.insert(channel.to_raw(), guessed + 1);

        if 0 != header.length {
            ctx.events.push(ConnectionEvent::Message { channel, data });

            // the gap just closed; release the contiguous run behind it
            for buffered in ctx.receiver_buffer.flush_buffer(channel.to_raw(), guessed) {
                self.other_host_sequence_memo
                    .insert(channel.to_raw(), buffered.sequence_number + 1);
                if ctx
                    .send_queue
                    .enqueue_ack(channel.to_raw(), buffered.sequence_number as u16)
                {
                    *ctx.needs_tick = true;
                }
                ctx.events.push(ConnectionEvent::Message {
                    channel,
                    data: buffered.data,
                });
            }
        }

        true
    }

    /// A packet arrived; lets the close handshake make progress if it was
    /// waiting for in-flight messages to drain.
    pub fn got_packet(&mut self, _header: &PacketHeader, ctx: &mut ConnContext<'_>) {
        self.maybe_enqueue_rst(ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::congestion_control::CongestionControl;
    use crate::conn_time::ConnTime;
    use crate::loss_list::LossList;
    use crate::message_header;
    use crate::send_queue::PendingRttResponse;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rstest::rstest;

    struct Harness {
        now: Instant,
        sender_buffer: SenderBuffer,
        receiver_buffer: ReceiverBuffer,
        send_queue: SendQueue,
        conn_time: ConnTime,
        congestion: CongestionControl,
        loss_list: LossList,
        pending_rtt_response: Option<PendingRttResponse>,
        out: Vec<Vec<u8>>,
        events: Vec<ConnectionEvent>,
        needs_tick: bool,
    }

    impl Harness {
        fn new() -> Harness {
            let now = Instant::now();
            Harness {
                now,
                sender_buffer: SenderBuffer::new(8192),
                receiver_buffer: ReceiverBuffer::new(2048),
                send_queue: SendQueue::new(576),
                conn_time: ConnTime::new(now),
                congestion: CongestionControl::new(now, StdRng::seed_from_u64(1)),
                loss_list: LossList::new(),
                pending_rtt_response: None,
                out: Vec::new(),
                events: Vec::new(),
                needs_tick: false,
            }
        }

        fn ctx(&mut self) -> ConnContext<'_> {
            ConnContext {
                now: self.now,
                sender_buffer: &mut self.sender_buffer,
                receiver_buffer: &mut self.receiver_buffer,
                send_queue: &mut self.send_queue,
                packet: crate::send_queue::PacketContext {
                    conn_time: &mut self.conn_time,
                    congestion: &mut self.congestion,
                    loss_list: &mut self.loss_list,
                    pending_rtt_response: &mut self.pending_rtt_response,
                },
                out: &mut self.out,
                events: &mut self.events,
                needs_tick: &mut self.needs_tick,
            }
        }

        fn client(&mut self) -> LogicalConnection {
            LogicalConnection::new_client(ConnectionType::Client, 100, None, &mut self.ctx())
        }

        fn open_client(&mut self) -> LogicalConnection {
            let mut conn = self.client();
            assert!(conn.got_syn_rst(500, &mut self.ctx()));
            self.out.clear();
            self.events.clear();
            conn
        }

        fn received_messages(&self) -> Vec<(ChannelQualifier, Vec<u8>)> {
            self.events
                .iter()
                .filter_map(|event| match event {
                    ConnectionEvent::Message { channel, data } => Some((*channel, data.to_vec())),
                    _ => None,
                })
                .collect()
        }
    }

    fn data_header(channel: ChannelQualifier, sequence_number: u16, length: usize) -> MessageHeader {
        MessageHeader {
            flags: MessageFlags::empty(),
            channel_qualifier: channel.to_raw(),
            sequence_number: Some(sequence_number),
            ack: None,
            header_length: message_header::header_length(length, MessageFlags::empty()),
            length,
        }
    }

    fn ack_header(channel: ChannelQualifier, ack: u16) -> MessageHeader {
        MessageHeader {
            flags: MessageFlags::ACK,
            channel_qualifier: channel.to_raw(),
            sequence_number: None,
            ack: Some(ack),
            header_length: message_header::header_length(0, MessageFlags::ACK),
            length: 0,
        }
    }

    fn reliable_ordered() -> ChannelQualifier {
        ChannelQualifier::new(ChannelType::ReliableOrdered, 1)
    }

    fn unreliable_sequenced() -> ChannelQualifier {
        ChannelQualifier::new(ChannelType::UnreliableSequenced, 1)
    }

    fn reliable_sequenced() -> ChannelQualifier {
        ChannelQualifier::new(ChannelType::ReliableSequenced, 1)
    }

    #[test]
    fn test_client_sends_syn_and_opens_on_syn_rst() {
        let mut harness = Harness::new();
        let mut conn = harness.client();

        assert!(conn.is_opening());
        // the SYN went out immediately and is retained for retransmission
        assert_eq!(harness.out.len(), 1);
        assert!(!harness.sender_buffer.is_empty());

        assert!(conn.got_syn_rst(500, &mut harness.ctx()));
        assert!(conn.is_open());
        assert_eq!(conn.other_host_initial_sequence_number(), 500);
        // SYN deregistered, handshake ack sent
        assert!(harness.sender_buffer.is_empty());
        assert_eq!(harness.out.len(), 2);
        assert!(matches!(harness.events[..], [ConnectionEvent::Opened { error: None }]));
    }

    #[test]
    fn test_duplicate_syn_rst_is_rejected() {
        let mut harness = Harness::new();
        let mut conn = harness.open_client();
        assert!(!conn.got_syn_rst(500, &mut harness.ctx()));
    }

    #[test]
    fn test_server_opens_on_handshake_ack() {
        let mut harness = Harness::new();
        let mut conn = LogicalConnection::new_server(300, 100, &mut harness.ctx());

        assert!(conn.is_opening());
        assert_eq!(harness.out.len(), 1);

        conn.got_syn_rst_ack(&mut harness.ctx());
        assert!(conn.is_open());
        assert!(harness.events.is_empty());
    }

    #[test]
    fn test_server_opens_on_data_if_ack_was_lost() {
        let mut harness = Harness::new();
        let mut conn = LogicalConnection::new_server(300, 100, &mut harness.ctx());

        let header = data_header(reliable_ordered(), 100, 3);
        assert!(conn.got_message(&header, Bytes::from_static(b"abc"), &mut harness.ctx()));
        assert!(conn.is_open());
    }

    #[test]
    fn test_send_assigns_consecutive_sequence_numbers() {
        let mut harness = Harness::new();
        let mut conn = harness.open_client();

        conn.send(Bytes::from_static(b"a"), reliable_ordered(), Priority::High, 400, &mut harness.ctx())
            .unwrap();
        conn.send(Bytes::from_static(b"b"), reliable_ordered(), Priority::High, 400, &mut harness.ctx())
            .unwrap();

        assert_eq!(conn.next_send_sequence_number(reliable_ordered().to_raw()), 102);
        assert!(!harness.sender_buffer.is_empty());
    }

    #[test]
    fn test_send_on_closed_connection_fails() {
        let mut harness = Harness::new();
        let mut conn = harness.open_client();
        conn.was_closed(DisconnectReason::ConnectionTimedOut, &mut harness.events);

        assert_eq!(
            conn.send(Bytes::from_static(b"a"), reliable_ordered(), Priority::High, 400, &mut harness.ctx()),
            Err(RudpError::Closed)
        );
    }

    #[test]
    fn test_send_empty_message_fails() {
        let mut harness = Harness::new();
        let mut conn = harness.open_client();

        assert_eq!(
            conn.send(Bytes::new(), reliable_ordered(), Priority::High, 400, &mut harness.ctx()),
            Err(RudpError::EmptyMessage)
        );
    }

    #[test]
    fn test_send_oversized_message_fails() {
        let mut harness = Harness::new();
        let mut conn = harness.open_client();

        assert_eq!(
            conn.send(Bytes::from(vec![0; 401]), reliable_ordered(), Priority::High, 400, &mut harness.ctx()),
            Err(RudpError::MessageTooBig { size: 401, max: 400 })
        );
    }

    #[test]
    fn test_failed_send_rolls_back_sequence_memo() {
        let mut harness = Harness::new();
        let mut conn = harness.open_client();
        harness.sender_buffer = SenderBuffer::new(0);

        assert_eq!(
            conn.send(Bytes::from_static(b"abc"), reliable_ordered(), Priority::High, 400, &mut harness.ctx()),
            Err(RudpError::SenderBufferFull)
        );
        assert_eq!(conn.next_send_sequence_number(reliable_ordered().to_raw()), 100);
    }

    #[test]
    fn test_unreliable_send_never_hits_sender_buffer() {
        let mut harness = Harness::new();
        let mut conn = harness.open_client();
        harness.sender_buffer = SenderBuffer::new(0);

        let unreliable = ChannelQualifier::new(ChannelType::Unreliable, 0);
        conn.send(Bytes::from_static(b"abc"), unreliable, Priority::High, 400, &mut harness.ctx())
            .unwrap();
        assert!(harness.sender_buffer.is_empty());
    }

    #[test]
    fn test_unreliable_message_with_ack_flag_is_a_violation() {
        let mut harness = Harness::new();
        let mut conn = harness.open_client();

        let mut header = data_header(unreliable_sequenced(), 500, 3);
        header.flags |= MessageFlags::ACK;
        header.ack = Some(1);
        assert!(!conn.got_message(&header, Bytes::from_static(b"abc"), &mut harness.ctx()));
        assert!(harness.events.is_empty());
    }

    #[test]
    fn test_unreliable_sequenced_drops_old_and_reports_loss() {
        let mut harness = Harness::new();
        let mut conn = harness.open_client();
        let channel = unreliable_sequenced();

        // in order
        assert!(conn.got_message(&data_header(channel, 500, 1), Bytes::from_static(b"a"), &mut harness.ctx()));
        // skips 501 and 502
        assert!(conn.got_message(&data_header(channel, 503, 1), Bytes::from_static(b"b"), &mut harness.ctx()));
        // stale duplicate
        assert!(!conn.got_message(&data_header(channel, 501, 1), Bytes::from_static(b"c"), &mut harness.ctx()));

        assert_eq!(harness.received_messages().len(), 2);
        assert!(harness
            .events
            .iter()
            .any(|e| matches!(e, ConnectionEvent::PacketLoss { count: 2, .. })));
    }

    #[test]
    fn test_reliable_sequenced_acks_every_message() {
        let mut harness = Harness::new();
        let mut conn = harness.open_client();
        let channel = reliable_sequenced();

        assert!(conn.got_message(&data_header(channel, 500, 1), Bytes::from_static(b"a"), &mut harness.ctx()));
        assert!(harness.needs_tick);
        assert_eq!(harness.received_messages().len(), 1);
    }

    #[test]
    fn test_reliable_sequenced_ack_deregisters_only_newest() {
        let mut harness = Harness::new();
        let mut conn = harness.open_client();
        let channel = reliable_sequenced();

        conn.send(Bytes::from_static(b"a"), channel, Priority::High, 400, &mut harness.ctx())
            .unwrap(); // seq 100
        conn.send(Bytes::from_static(b"b"), channel, Priority::High, 400, &mut harness.ctx())
            .unwrap(); // seq 101, supersedes 100

        // an ack for the stale message does nothing
        assert!(conn.got_message(&ack_header(channel, 100), Bytes::new(), &mut harness.ctx()));
        assert!(!harness.sender_buffer.is_empty());

        // the ack for the newest one clears the channel
        assert!(conn.got_message(&ack_header(channel, 101), Bytes::new(), &mut harness.ctx()));
        assert!(harness.sender_buffer.is_empty());
    }

    #[test]
    fn test_reliable_ordered_out_of_order_is_buffered_and_flushed() {
        let mut harness = Harness::new();
        let mut conn = harness.open_client();
        let channel = reliable_ordered();

        // 500 in order, then 502 before 501
        assert!(conn.got_message(&data_header(channel, 500, 1), Bytes::from_static(b"a"), &mut harness.ctx()));
        assert!(!conn.got_message(&data_header(channel, 502, 1), Bytes::from_static(b"c"), &mut harness.ctx()));
        assert_eq!(harness.received_messages().len(), 1);

        // 501 closes the gap; 501 and 502 are delivered in order
        assert!(conn.got_message(&data_header(channel, 501, 1), Bytes::from_static(b"b"), &mut harness.ctx()));
        let messages = harness.received_messages();
        assert_eq!(
            messages.iter().map(|(_, data)| data.as_slice()).collect::<Vec<_>>(),
            vec![b"a".as_slice(), b"b".as_slice(), b"c".as_slice()]
        );
    }

    #[test]
    fn test_reliable_ordered_cumulative_ack_deregisters() {
        let mut harness = Harness::new();
        let mut conn = harness.open_client();
        let channel = reliable_ordered();

        for payload in [b"a", b"b", b"c"] {
            conn.send(Bytes::from_static(payload), channel, Priority::High, 400, &mut harness.ctx())
                .unwrap();
        }

        // ack of 101 covers 100 and 101
        assert!(conn.got_message(&ack_header(channel, 101), Bytes::new(), &mut harness.ctx()));
        assert!(!harness.sender_buffer.is_empty());
        assert!(conn.got_message(&ack_header(channel, 102), Bytes::new(), &mut harness.ctx()));
        assert!(harness.sender_buffer.is_empty());
    }

    #[test]
    fn test_close_is_idempotent_error() {
        let mut harness = Harness::new();
        let mut conn = harness.open_client();

        conn.close(&mut harness.ctx()).unwrap();
        assert_eq!(conn.close(&mut harness.ctx()), Err(RudpError::Closed));
    }

    #[test]
    fn test_close_while_opening_fails_the_open_callback() {
        let mut harness = Harness::new();
        let mut conn = harness.client();
        harness.events.clear();

        conn.close(&mut harness.ctx()).unwrap();
        assert!(matches!(
            harness.events[..],
            [ConnectionEvent::Opened {
                error: Some(DisconnectReason::ThisHostClosed)
            }]
        ));
    }

    #[test]
    fn test_close_defers_rst_until_sender_buffer_drains() {
        let mut harness = Harness::new();
        let mut conn = harness.open_client();
        let channel = reliable_ordered();

        conn.send(Bytes::from_static(b"a"), channel, Priority::High, 400, &mut harness.ctx())
            .unwrap();
        harness.out.clear();

        conn.close(&mut harness.ctx()).unwrap();
        // the in-flight message is still unacked; no RST yet
        assert!(harness.out.is_empty());

        // the ack drains the buffer, which releases the RST
        assert!(conn.got_message(&ack_header(channel, 100), Bytes::new(), &mut harness.ctx()));
        assert_eq!(harness.out.len(), 1);

        // RST is answered by SYN-RST-ACK, completing the close
        conn.got_syn_rst_ack(&mut harness.ctx());
        assert!(conn.is_closed());
        assert!(harness
            .events
            .iter()
            .any(|e| matches!(e, ConnectionEvent::Disconnected(DisconnectReason::ThisHostClosed))));
    }

    #[test]
    fn test_got_rst_closes() {
        let mut harness = Harness::new();
        let mut conn = harness.open_client();

        conn.got_rst(&mut harness.ctx());
        assert!(conn.is_closed());
        assert!(matches!(
            harness.events[..],
            [ConnectionEvent::Disconnected(DisconnectReason::OtherHostClosed)]
        ));
    }

    #[test]
    fn test_unsolicited_syn_rst_ack_reports_other_host_closed() {
        let mut harness = Harness::new();
        let mut conn = harness.open_client();

        conn.got_syn_rst_ack(&mut harness.ctx());
        assert!(conn.is_closed());
        assert!(matches!(
            harness.events[..],
            [ConnectionEvent::Disconnected(DisconnectReason::OtherHostClosed)]
        ));
    }

    #[rstest]
    #[case(DisconnectReason::ConnectionTimedOut)]
    #[case(DisconnectReason::OtherHostDidNotRespond)]
    fn test_was_closed_while_opening_fails_open_callback(#[case] reason: DisconnectReason) {
        let mut harness = Harness::new();
        let mut conn = harness.client();
        harness.events.clear();

        conn.was_closed(reason, &mut harness.events);
        assert!(conn.is_closed());
        assert!(matches!(
            harness.events[..],
            [
                ConnectionEvent::Opened {
                    error: Some(DisconnectReason::OtherHostDidNotRespond)
                },
                ConnectionEvent::Disconnected(_)
            ]
        ));
    }

    #[test]
    fn test_split_flagged_message_is_dropped() {
        let mut harness = Harness::new();
        let mut conn = harness.open_client();

        let mut header = data_header(reliable_ordered(), 500, 3);
        header.flags |= MessageFlags::SPLIT_NOT_LAST;
        assert!(!conn.got_message(&header, Bytes::from_static(b"abc"), &mut harness.ctx()));
        assert!(harness.events.is_empty());
    }
}
