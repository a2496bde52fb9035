//! Tracking of the last processed inbound sequence number.

use crate::envelope::Message;
use crate::ncl::ProcessingNotifier;
use std::sync::atomic::{AtomicU64, Ordering};

/// Last sequence number processed from a remote peer.
///
/// The value only moves forward through [`update_last_seq_num`] and
/// [`ProcessingNotifier::on_processed`]; [`override_last_seq_num`] exists for
/// the handshake, where the orchestrator dictates the resume point.
///
/// [`update_last_seq_num`]: SequenceTracker::update_last_seq_num
/// [`override_last_seq_num`]: SequenceTracker::override_last_seq_num
#[derive(Debug, Default)]
pub struct SequenceTracker {
    last_seq_num: AtomicU64,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_last_seq_num(self, seq_num: u64) -> Self {
        self.last_seq_num.store(seq_num, Ordering::SeqCst);
        self
    }

    /// Advance to `seq_num` if it is newer than the current value.
    pub fn update_last_seq_num(&self, seq_num: u64) {
        self.last_seq_num.fetch_max(seq_num, Ordering::SeqCst);
    }

    /// Replace the current value, even with an older one.
    pub fn override_last_seq_num(&self, seq_num: u64) {
        self.last_seq_num.store(seq_num, Ordering::SeqCst);
    }

    pub fn get_last_seq_num(&self) -> u64 {
        self.last_seq_num.load(Ordering::SeqCst)
    }
}

impl ProcessingNotifier for SequenceTracker {
    fn on_processed(&self, message: &Message) {
        if let Some(seq_num) = message.seq_num() {
            self.update_last_seq_num(seq_num);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::KEY_SEQ_NUM;
    use std::sync::Arc;

    fn message(seq_num: u64) -> Message {
        Message::new("ExecutionUpsert", serde_json::Value::Null).with_metadata(KEY_SEQ_NUM, seq_num)
    }

    #[test]
    fn test_monotonic_updates() {
        let tracker = SequenceTracker::new().with_last_seq_num(5);
        let mut previous = tracker.get_last_seq_num();

        for seq in [3, 9, 7, 9, 12, 1, 0, 15] {
            if seq % 2 == 0 {
                tracker.update_last_seq_num(seq);
            } else {
                tracker.on_processed(&message(seq));
            }
            let current = tracker.get_last_seq_num();
            assert!(current >= previous, "regressed from {previous} to {current}");
            previous = current;
        }
        assert_eq!(tracker.get_last_seq_num(), 15);
    }

    #[test]
    fn test_override_moves_backwards() {
        let tracker = SequenceTracker::new().with_last_seq_num(200);
        tracker.override_last_seq_num(124);
        assert_eq!(tracker.get_last_seq_num(), 124);
    }

    #[test]
    fn test_messages_without_seq_num_ignored() {
        let tracker = SequenceTracker::new().with_last_seq_num(10);
        tracker.on_processed(&Message::new("Ack", serde_json::Value::Null));
        assert_eq!(tracker.get_last_seq_num(), 10);
    }

    #[tokio::test]
    async fn test_concurrent_updates() {
        let tracker = Arc::new(SequenceTracker::new());
        let mut handles = Vec::new();
        for worker in 0..8u64 {
            let tracker = tracker.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..100 {
                    tracker.update_last_seq_num(worker * 100 + i);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(tracker.get_last_seq_num(), 799);
    }
}
