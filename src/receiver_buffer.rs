use crate::message_header::MessageHeader;
use bytes::Bytes;
use std::collections::BTreeMap;
use tracing::{debug, trace};

pub struct BufferedMessage {
    /// Non-wrapping channel sequence number.
    pub sequence_number: u64,
    pub data: Bytes,
}

/// Buffers reliable-ordered messages that arrived ahead of the expected
/// sequence number, until the gap before them is filled.
///
/// The buffer is bounded by a byte cap; messages beyond the cap are silently
/// dropped and recovered later through retransmission.
pub struct ReceiverBuffer {
    size: usize,
    tree: BTreeMap<(u8, u64), (MessageHeader, Bytes)>,
    buffer_size: usize,
}

impl ReceiverBuffer {
    pub fn new(size: usize) -> ReceiverBuffer {
        ReceiverBuffer {
            size,
            tree: BTreeMap::new(),
            buffer_size: 0,
        }
    }

    fn entry_size(header: &MessageHeader) -> usize {
        header.header_length + header.length
    }

    /// Stores an ahead-of-sequence message. Drops it if the byte cap would
    /// be exceeded; duplicates are kept only once.
    pub fn buffer_message(&mut self, sequence_number: u64, header: MessageHeader, data: Bytes) {
        let msg_size = Self::entry_size(&header);
        if self.buffer_size + msg_size > self.size {
            debug!(
                "receiver buffer full ({} + {} > {}), dropping message #{}",
                self.buffer_size, msg_size, self.size, sequence_number
            );
            return;
        }

        let key = (header.channel_qualifier, sequence_number);
        if self.tree.insert(key, (header, data)).is_none() {
            self.buffer_size += msg_size;
        }
    }

    /// Releases the contiguous run of buffered messages following the just
    /// delivered sequence number: stale entries up to and including
    /// `sequence_number` are discarded, and every directly following entry
    /// is removed and returned, in order, until the first gap.
    pub fn flush_buffer(&mut self, channel_qualifier: u8, sequence_number: u64) -> Vec<BufferedMessage> {
        let mut released = Vec::new();
        let mut expected = sequence_number + 1;

        loop {
            let Some((&(_, sn), _)) = self
                .tree
                .range((channel_qualifier, 0)..=(channel_qualifier, expected))
                .next()
            else {
                break;
            };

            let (header, data) = self.tree.remove(&(channel_qualifier, sn)).expect("key was just found");
            self.buffer_size -= Self::entry_size(&header);

            if sn < expected {
                // a stale duplicate of something already delivered
                continue;
            }

            trace!("releasing buffered message #{} on channel {:#04x}", sn, channel_qualifier);
            released.push(BufferedMessage {
                sequence_number: sn,
                data,
            });
            expected = sn + 1;
        }

        released
    }

    #[cfg(test)]
    fn buffered_bytes(&self) -> usize {
        self.buffer_size
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.tree.len()
    }
}
