use crate::congestion_control::CongestionControl;
use crate::conn_time::ConnTime;
use crate::loss_list::LossList;
use crate::message::Message;
use crate::message_header::{write_message, MessageFlags};
use crate::packet_header::{PacketHeader, RttResponse};
use crate::sequence::{cyclic_max16, PacketSeq};
use crate::types::{SenderChannel, INIT_RTO};
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{trace, warn};

/// An inbound RTT request waiting to be answered by the next outgoing packet.
pub struct PendingRttResponse {
    pub id: u16,
    pub received_at: Instant,
}

/// The connection state a flush annotates its packet header from.
pub struct PacketContext<'a> {
    pub conn_time: &'a mut ConnTime,
    pub congestion: &'a mut CongestionControl,
    pub loss_list: &'a mut LossList,
    pub pending_rtt_response: &'a mut Option<PendingRttResponse>,
}

impl PacketContext<'_> {
    fn take_rtt_response(&mut self, now: Instant) -> Option<RttResponse> {
        self.pending_rtt_response.take().map(|pending| RttResponse {
            id: pending.id,
            delay_millis: (now - pending.received_at).as_millis().min(u8::MAX as u128) as u8,
        })
    }
}

/// Per-tick outbound batching: queued messages plus pending channel ACKs are
/// packed into MTU-sized packets, one packet header per flush. Control
/// messages (PRX/RST/SYN flags) bypass the batching and leave immediately in
/// a packet of their own.
pub struct SendQueue {
    mtu: usize,
    queue: Vec<Arc<Message>>,
    queue_size: usize,
    /// Newest ACK per channel, merged with a cyclic max.
    acks: FxHashMap<u8, u16>,
    enqueue_heartbeat: bool,
    next_sequence_number: PacketSeq,
}

impl SendQueue {
    pub fn new(mtu: usize) -> SendQueue {
        SendQueue {
            mtu,
            queue: Vec::new(),
            queue_size: 0,
            acks: FxHashMap::default(),
            enqueue_heartbeat: false,
            next_sequence_number: PacketSeq::ZERO,
        }
    }

    pub fn enqueue_heartbeat(&mut self) {
        self.enqueue_heartbeat = true;
    }

    /// Remembers that `sequence_number` should be ACKed on `channel`.
    /// Returns true if at least one ack is now pending.
    pub fn enqueue_ack(&mut self, channel_qualifier: u8, sequence_number: u16) -> bool {
        self.acks
            .entry(channel_qualifier)
            .and_modify(|prev| *prev = cyclic_max16(*prev, sequence_number))
            .or_insert(sequence_number);
        !self.acks.is_empty()
    }

    /// Queues a message for the next flush. Control messages are sent
    /// immediately instead, and a queue that would outgrow the MTU is
    /// flushed eagerly before the message is added.
    pub fn enqueue_message(
        &mut self,
        now: Instant,
        message: Arc<Message>,
        ctx: &mut PacketContext<'_>,
        out: &mut Vec<Vec<u8>>,
    ) {
        if message.is_control() {
            // cannot be bundled with other messages; send it right away
            self.send_message_in_separate_packet(now, &message, ctx, out);
            return;
        }

        let msg_size = message.approximate_size();
        if self.queue_size + msg_size >= self.mtu {
            self.flush(now, ctx, out);
        }

        self.queue_size += msg_size;
        self.queue.push(message);
    }

    fn send_message_in_separate_packet(
        &mut self,
        now: Instant,
        message: &Message,
        ctx: &mut PacketContext<'_>,
        out: &mut Vec<Vec<u8>>,
    ) {
        let mut buf = vec![0u8; self.mtu];

        let header_length = PacketHeader::write_empty(&mut buf, ctx.conn_time.timestamp(now))
            .expect("mtu is validated to hold a packet header");
        let message_length = message.write_into(&mut buf, header_length, None);
        if 0 == message_length {
            warn!("control message of {} bytes does not fit the mtu, dropping", message.data.len());
            return;
        }

        buf.truncate(header_length + message_length);
        out.push(buf);
    }

    /// Packs everything pending into at most one packet. Returns true if a
    /// packet was produced (including a bare heartbeat).
    pub fn flush(&mut self, now: Instant, ctx: &mut PacketContext<'_>, out: &mut Vec<Vec<u8>>) -> bool {
        let mut sent_packet = false;

        if !self.queue.is_empty() || !self.acks.is_empty() {
            sent_packet = self.flush_data_packet(now, ctx, out);
        }

        if !sent_packet && self.enqueue_heartbeat {
            out.push(self.heartbeat_packet(now, ctx));
            sent_packet = true;
        }

        self.clear_queue();
        self.enqueue_heartbeat = false;

        sent_packet
    }

    fn flush_data_packet(
        &mut self,
        now: Instant,
        ctx: &mut PacketContext<'_>,
        out: &mut Vec<Vec<u8>>,
    ) -> bool {
        let mut buf = vec![0u8; self.mtu];
        let sequence_number = self.next_sequence_number;

        let rtt = ctx.conn_time.rtt().unwrap_or(INIT_RTO);
        let mut header = PacketHeader {
            timestamp: ctx.conn_time.timestamp(now),
            sequence_number: Some(sequence_number),
            ack: ctx.congestion.ack(),
            nak: ctx.loss_list.calculate_nak(now, rtt),
            rtt_response: ctx.take_rtt_response(now),
            ..PacketHeader::default()
        };

        // metrics ride along only when a new RTT probe is armed, which is
        // rate-limited to once per RTO
        if ctx.conn_time.rtt_request(now, sequence_number) {
            header.rtt_request = Some(sequence_number.low16());
            header.link_capacity = Some(ctx.congestion.link_capacity() as u32);
            header.arrival_rate = Some(ctx.congestion.data_arrival_rate() as u32);
        }

        let header_length = header.write(&mut buf).expect("mtu is validated to hold a packet header");
        let mut pos = header_length;

        // each channel's ACK is included at most once per flush
        let mut acks_sent_in_this_tick: FxHashSet<u8> = FxHashSet::default();

        for message in &self.queue {
            let ack = match message.channel {
                SenderChannel::Data(cq) if acks_sent_in_this_tick.insert(cq.to_raw()) => {
                    self.acks.get(&cq.to_raw()).copied()
                }
                _ => None,
            };

            let written = message.write_into(&mut buf, pos, ack);
            if 0 == written {
                // Cannot happen while enqueue_message flushes eagerly at the
                // MTU boundary, but a dropped frame beats a truncated packet.
                warn!("message did not fit into flushed packet, dropping from this flush");
                continue;
            }
            pos += written;
        }

        // remaining unsent ACKs become zero-payload ACK frames
        for (&channel_qualifier, &ack) in &self.acks {
            if acks_sent_in_this_tick.contains(&channel_qualifier) {
                continue;
            }
            pos += write_message(&mut buf, pos, Some(ack), channel_qualifier, 0, &[], MessageFlags::empty());
        }

        if pos == header_length {
            return false;
        }

        trace!("flushing packet #{} with {} bytes", sequence_number.to_raw(), pos);

        buf.truncate(pos);
        out.push(buf);

        self.next_sequence_number = sequence_number.next();
        ctx.congestion.on_data_sent(sequence_number, pos);

        true
    }

    /// A header-only packet; keeps the connection's timeout handling alive
    /// and carries any pending header annotations.
    fn heartbeat_packet(&mut self, now: Instant, ctx: &mut PacketContext<'_>) -> Vec<u8> {
        let rtt = ctx.conn_time.rtt().unwrap_or(INIT_RTO);
        let header = PacketHeader {
            timestamp: ctx.conn_time.timestamp(now),
            ack: ctx.congestion.ack(),
            nak: ctx.loss_list.calculate_nak(now, rtt),
            rtt_response: ctx.take_rtt_response(now),
            ..PacketHeader::default()
        };

        let mut buf = vec![0u8; self.mtu];
        let len = header.write(&mut buf).expect("mtu is validated to hold a packet header");
        buf.truncate(len);
        buf
    }

    fn clear_queue(&mut self) {
        self.queue.clear();
        self.queue_size = 0;
    }

    pub fn queued_bytes(&self) -> usize {
        self.queue_size
    }
}
