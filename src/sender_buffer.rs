use crate::error::RudpError;
use crate::message::Message;
use crate::types::SenderChannel;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

struct Entry {
    message: Arc<Message>,
    /// When the message was (re-)placed in the buffer; retransmission is due
    /// once this is a full RTO in the past.
    registration_time: Instant,
}

/// Holds all reliable messages that have not been acknowledged yet.
///
/// Besides the full per-channel index, the buffer maintains a second view
/// with at most one entry per channel: the channel's oldest unacknowledged
/// message, ordered by registration time. RTO-driven retransmission walks
/// that view, so each RTO retransmits one message per stalled channel, and
/// re-stamping the walked entries keeps retransmission round-robin fair
/// across channels.
pub struct SenderBuffer {
    /// Byte capacity (counting approximate encoded sizes).
    size: usize,

    send_buffer: BTreeMap<(SenderChannel, u64), Entry>,
    send_buffer_size: usize,

    /// The retransmission view: at most one key per channel.
    next_msg_tree: BTreeMap<(Instant, SenderChannel, u64), Arc<Message>>,
    next_msg_keys: FxHashMap<SenderChannel, (Instant, u64)>,
}

impl SenderBuffer {
    pub fn new(size: usize) -> SenderBuffer {
        SenderBuffer {
            size,
            send_buffer: BTreeMap::new(),
            send_buffer_size: 0,
            next_msg_tree: BTreeMap::new(),
            next_msg_keys: FxHashMap::default(),
        }
    }

    /// Registers a reliable message, failing if the buffer's byte cap has no
    /// room for it.
    pub fn register_reliable_message(
        &mut self,
        now: Instant,
        message: Arc<Message>,
    ) -> Result<(), RudpError> {
        let msg_size = message.approximate_size();
        if self.send_buffer_size + msg_size > self.size {
            return Err(RudpError::SenderBufferFull);
        }

        let channel = message.channel;

        // the channel's first unacknowledged message leads retransmission;
        // later registrations do not replace it
        if !self.next_msg_keys.contains_key(&channel) {
            self.next_msg_keys.insert(channel, (now, message.sequence_number));
            self.next_msg_tree
                .insert((now, channel, message.sequence_number), message.clone());
        }

        let key = (channel, message.sequence_number);
        if !self.send_buffer.contains_key(&key) {
            self.send_buffer.insert(
                key,
                Entry {
                    message,
                    registration_time: now,
                },
            );
            self.send_buffer_size += msg_size;
        }

        Ok(())
    }

    /// Removes every buffered message on `channel` with a sequence number up
    /// to and including `sequence_number`. If the channel's retransmission
    /// slot was among them, the channel's new oldest message (if any) takes
    /// its place.
    pub fn deregister_reliable_messages(&mut self, channel: SenderChannel, sequence_number: u64) {
        let to_remove: Vec<u64> = self
            .send_buffer
            .range((channel, 0)..=(channel, sequence_number))
            .map(|(&(_, sn), _)| sn)
            .collect();
        if to_remove.is_empty() {
            return;
        }

        trace!("deregistering {} acked messages on {:?}", to_remove.len(), channel);

        let mut was_in_next_tree = false;
        for sn in to_remove {
            let entry = self.send_buffer.remove(&(channel, sn)).expect("key was just found");
            self.send_buffer_size -= entry.message.approximate_size();

            if self.next_msg_keys.get(&channel) == Some(&(entry.registration_time, sn)) {
                self.next_msg_keys.remove(&channel);
                self.next_msg_tree.remove(&(entry.registration_time, channel, sn));
                was_in_next_tree = true;
            }
        }

        if was_in_next_tree {
            // promote the channel's new oldest remaining message
            if let Some((&(_, sn), entry)) = self
                .send_buffer
                .range((channel, 0)..=(channel, u64::MAX))
                .next()
            {
                self.next_msg_keys.insert(channel, (entry.registration_time, sn));
                self.next_msg_tree
                    .insert((entry.registration_time, channel, sn), entry.message.clone());
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.next_msg_tree.is_empty()
    }

    #[cfg(test)]
    pub fn buffered_bytes(&self) -> usize {
        self.send_buffer_size
    }

    /// Invokes `f` for the oldest unacknowledged message of every channel
    /// whose age has reached `rto`, then re-stamps those entries to `now`,
    /// moving them to the back of the retransmission order.
    pub fn each_current_message(
        &mut self,
        now: Instant,
        rto: Duration,
        mut f: impl FnMut(&Arc<Message>),
    ) {
        let mut to_push_to_the_end = Vec::new();

        for (&(registration_time, channel, sn), message) in &self.next_msg_tree {
            if now - registration_time < rto {
                // this message was (re-)sent less than an RTO ago, and so is
                // everything after it
                break;
            }

            to_push_to_the_end.push((registration_time, channel, sn));
            f(message);
        }

        for (registration_time, channel, sn) in to_push_to_the_end {
            let message = self
                .next_msg_tree
                .remove(&(registration_time, channel, sn))
                .expect("key was just iterated");
            self.next_msg_tree.insert((now, channel, sn), message);
            self.next_msg_keys.insert(channel, (now, sn));

            if let Some(entry) = self.send_buffer.get_mut(&(channel, sn)) {
                entry.registration_time = now;
            }
        }
    }
}
