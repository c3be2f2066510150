use crate::sequence::{guess_non_wrapping, PacketSeq, PACKET_SEQ_BITS, PACKET_SEQ_MASK};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

#[derive(Clone, Debug)]
struct LostPacketRange {
    /// Non-wrapping sequence numbers, both inclusive.
    oldest: u64,
    newest: u64,
    last_feedback_time: Instant,
    num_feedbacks: u32,
}

/// Tracks which packets were inferred lost, and which of them to NAK when.
///
/// The NAK to send out is the oldest sequence number of the newest lost range
/// whose feedback backoff has elapsed: a range is eligible `rtt * (2 + n)`
/// after its last feedback, where `n` is the number of times it has already
/// been reported. Once a number has been reported, no older number is ever
/// reported again, which is what allows pruning old ranges.
pub struct LossList {
    /// Non-wrapping; `None` until the first packet arrives.
    newest_sequence_number: Option<u64>,
    /// Keyed by each range's `newest`. Invariant: ranges are disjoint and
    /// non-adjacent; every range's `oldest` is greater than the previous
    /// range's `newest` plus one.
    loss_set: BTreeMap<u64, LostPacketRange>,
}

impl LossList {
    pub fn new() -> LossList {
        LossList {
            newest_sequence_number: None,
            loss_set: BTreeMap::new(),
        }
    }

    /// Records a received packet sequence number.
    ///
    /// In-order arrival just advances the newest-seen number. An arrival that
    /// skips numbers inserts the skipped range as lost. A late arrival of a
    /// previously-lost number splits the range containing it.
    pub fn got_packet(&mut self, now: Instant, sequence_number: PacketSeq) {
        let Some(newest) = self.newest_sequence_number else {
            self.newest_sequence_number = Some(sequence_number.to_raw() as u64);
            return;
        };

        let expected = newest + 1;
        let guessed = guess_non_wrapping::<PACKET_SEQ_BITS>(expected, sequence_number.to_raw());

        if guessed == expected {
            // the packet we expected; nothing to do with the loss set
            self.newest_sequence_number = Some(guessed);
        }
        else if guessed <= newest {
            // an old packet, presumably arrived out of order: if a lost range
            // contains it, split that range around it
            self.remove_from_loss_set(guessed);
        }
        else {
            trace!("packets {}..{} inferred lost", newest + 1, guessed - 1);
            self.loss_set.insert(
                guessed - 1,
                LostPacketRange {
                    oldest: newest + 1,
                    newest: guessed - 1,
                    last_feedback_time: now,
                    num_feedbacks: 0,
                },
            );
            self.newest_sequence_number = Some(guessed);
        }
    }

    fn remove_from_loss_set(&mut self, sequence_number: u64) {
        let Some((&key, range)) = self.loss_set.range(sequence_number..).next() else {
            return;
        };
        if range.oldest > sequence_number {
            // the range we found does not contain this sequence number
            return;
        }

        let range = self.loss_set.remove(&key).expect("key was just found");

        if range.oldest < sequence_number {
            let lower = LostPacketRange {
                newest: sequence_number - 1,
                ..range.clone()
            };
            self.loss_set.insert(lower.newest, lower);
        }
        if range.newest > sequence_number {
            let upper = LostPacketRange {
                oldest: sequence_number + 1,
                num_feedbacks: 0,
                ..range
            };
            self.loss_set.insert(upper.newest, upper);
        }
    }

    /// Calculates the NAK to send, if any. Intended to be called once per NAK
    /// timeout: on a hit it bumps the range's feedback count, shrinks it past
    /// the reported number, and prunes everything older.
    pub fn calculate_nak(&mut self, now: Instant, rtt: Duration) -> Option<PacketSeq> {
        let key = self
            .loss_set
            .iter()
            .rev()
            .find(|(_, range)| range.last_feedback_time + rtt * (2 + range.num_feedbacks) <= now)
            .map(|(&key, _)| key)?;

        // prune all older ranges: once reported, older numbers are never
        // reported again
        let newer = self.loss_set.split_off(&(key + 1));
        let range = self.loss_set.remove(&key).expect("key was just found");
        self.loss_set = newer;

        let nak = range.oldest;
        if range.oldest + 1 <= range.newest {
            self.loss_set.insert(
                range.newest,
                LostPacketRange {
                    oldest: range.oldest + 1,
                    newest: range.newest,
                    last_feedback_time: now,
                    num_feedbacks: range.num_feedbacks + 1,
                },
            );
        }

        Some(PacketSeq::from_raw((nak & PACKET_SEQ_MASK as u64) as u32))
    }

    #[cfg(test)]
    fn ranges(&self) -> Vec<(u64, u64)> {
        self.loss_set.values().map(|r| (r.oldest, r.newest)).collect()
    }
}
