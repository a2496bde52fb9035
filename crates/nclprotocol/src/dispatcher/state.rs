//! Bookkeeping of published, acknowledged and checkpointed sequence numbers.
//!
//! Invariant: `last_checkpoint <= checkpointable <= last_observed_seq`, where
//! `checkpointable` is `last_observed_seq` with nothing pending and
//! `last_acked_seq_num` otherwise.

use crate::ncl::PubFuture;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// A message handed to the publisher and not yet acknowledged.
#[derive(Debug)]
pub(crate) struct PendingMessage {
    pub event_seq_num: u64,
    pub publish_time: Instant,
    pub future: PubFuture,
}

/// Pending messages in publish order.
#[derive(Debug, Default)]
pub(crate) struct PendingMessageStore {
    messages: VecDeque<PendingMessage>,
}

impl PendingMessageStore {
    pub fn add(&mut self, message: PendingMessage) {
        self.messages.push_back(message);
    }

    /// Drop every message with a sequence number up to `seq_num`.
    /// Returns how many were removed.
    pub fn remove_up_to(&mut self, seq_num: u64) -> usize {
        let before = self.messages.len();
        self.messages.retain(|m| m.event_seq_num > seq_num);
        before - self.messages.len()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PendingMessage> {
        self.messages.iter_mut()
    }

    pub fn oldest(&self) -> Option<&PendingMessage> {
        self.messages.front()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }
}

#[derive(Debug, Default)]
pub(crate) struct DispatcherState {
    pub last_acked_seq_num: u64,
    pub last_observed_seq: u64,
    pub last_checkpoint: u64,
    pub last_ack_time: Option<Instant>,
    pub pending: PendingMessageStore,
}

impl DispatcherState {
    pub fn update_last_observed(&mut self, seq_num: u64) {
        self.last_observed_seq = self.last_observed_seq.max(seq_num);
    }

    /// Record an ack; everything up to `seq_num` is delivered.
    /// Returns how many pending messages were released.
    pub fn update_last_acked(&mut self, seq_num: u64) -> usize {
        self.last_acked_seq_num = self.last_acked_seq_num.max(seq_num);
        self.last_ack_time = Some(Instant::now());
        self.pending.remove_up_to(seq_num)
    }

    /// Sequence number safe to checkpoint, or 0 when nothing new is safe.
    pub fn get_checkpoint_seq_num(&self) -> u64 {
        let candidate = if self.pending.is_empty() {
            self.last_observed_seq
        } else {
            self.last_acked_seq_num
        };
        if candidate > self.last_checkpoint {
            candidate
        } else {
            0
        }
    }

    pub fn update_last_checkpoint(&mut self, seq_num: u64) {
        self.last_checkpoint = self.last_checkpoint.max(seq_num);
    }

    /// Whether pending messages have waited longer than `stall_timeout`
    /// without progress.
    pub fn is_stalled(&self, stall_timeout: Duration) -> bool {
        let Some(oldest) = self.pending.oldest() else {
            return false;
        };
        let since = match self.last_ack_time {
            Some(acked) => acked.max(oldest.publish_time),
            None => oldest.publish_time,
        };
        since.elapsed() > stall_timeout
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
