//! Progress records for transfers moving through the shared-bandwidth path.

use crate::{Message, Rate, Tick};

/// Handle to a transfer generation owned by the subnet.
///
/// Handles are never reused within a run; every rescheduling produces a
/// fresh generation under a fresh handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransferId(pub(crate) u64);

/// Lifecycle state of a transfer generation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferStatus {
    /// Current generation of an active transfer.
    Live,
    /// Replaced by a newer generation; the delivery event still in flight
    /// for this one must be ignored when it fires.
    Superseded,
    /// Transfer torn down before completion; the delivery event still in
    /// flight must be ignored when it fires.
    Cancelled,
    /// Handed to the recipient.
    Delivered,
}

/// One generation of a transfer: the rate granted by a reallocation pass
/// and the bytes that were outstanding when it was granted.
///
/// Progress is linear: after `elapsed` ticks the generation has
/// `baseline - rate * elapsed` bytes left, floored at zero.
#[derive(Clone, Debug)]
pub struct TransferProgress {
    /// The message being moved.
    pub message: Message,
    /// Rate granted to this generation, in bytes per tick.
    pub rate: Rate,
    /// Bytes outstanding at `since`.
    pub baseline: f64,
    /// Tick the generation was created.
    pub since: Tick,
    /// Set on the admission-time generation, which has no delivery event in
    /// flight yet (the first event is produced by the first reallocation).
    pub first: bool,
    /// Lifecycle state.
    pub status: TransferStatus,
}

impl TransferProgress {
    /// Admission-time generation: the full message outstanding, no rate yet.
    pub(crate) fn admitted(message: Message, now: Tick) -> Self {
        let baseline = message.size() as f64;
        Self {
            message,
            rate: 0.0,
            baseline,
            since: now,
            first: true,
            status: TransferStatus::Live,
        }
    }

    /// Generation for an atomic datagram. Arrival completes it, so the byte
    /// accounting carries nothing.
    pub(crate) fn atomic(message: Message, now: Tick) -> Self {
        Self {
            message,
            rate: 0.0,
            baseline: 0.0,
            since: now,
            first: true,
            status: TransferStatus::Live,
        }
    }

    /// Successor generation produced by a reallocation pass: whatever is
    /// outstanding now, at the freshly granted rate.
    pub(crate) fn rescheduled(&self, rate: Rate, now: Tick) -> Self {
        Self {
            message: self.message.clone(),
            rate,
            baseline: self.remaining_bytes(now),
            since: now,
            first: false,
            status: TransferStatus::Live,
        }
    }

    /// Bytes still outstanding at `now` under this generation's rate.
    pub fn remaining_bytes(&self, now: Tick) -> f64 {
        let elapsed = now.saturating_sub(self.since) as f64;
        (self.baseline - self.rate * elapsed).max(0.0)
    }

    /// Whether this is the current generation of an active transfer.
    pub fn is_live(&self) -> bool {
        self.status == TransferStatus::Live
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Transport;
    use bytes::Bytes;

    fn message(len: usize) -> Message {
        Message::with_fragments(1, 2, Bytes::from(vec![0u8; len]), 4, Transport::Ordered)
    }

    #[test]
    fn depletion_is_linear_and_floored() {
        let mut progress = TransferProgress::admitted(message(1000), 5);
        progress.rate = 100.0;

        assert_eq!(progress.remaining_bytes(5), 1000.0);
        assert_eq!(progress.remaining_bytes(8), 700.0);
        assert_eq!(progress.remaining_bytes(15), 0.0);
        // Never negative, even past completion.
        assert_eq!(progress.remaining_bytes(50), 0.0);
        // A clock earlier than the generation has consumed nothing.
        assert_eq!(progress.remaining_bytes(0), 1000.0);
    }

    #[test]
    fn admission_starts_with_full_size() {
        let progress = TransferProgress::admitted(message(1234), 7);
        assert_eq!(progress.baseline, 1234.0);
        assert_eq!(progress.rate, 0.0);
        assert_eq!(progress.since, 7);
        assert!(progress.first);
        assert!(progress.is_live());
    }

    #[test]
    fn rescheduling_baselines_at_current_remainder() {
        let mut first = TransferProgress::admitted(message(1000), 0);
        first.rate = 50.0;

        let second = first.rescheduled(80.0, 10);
        assert_eq!(second.baseline, 500.0);
        assert_eq!(second.rate, 80.0);
        assert_eq!(second.since, 10);
        assert!(!second.first);
        assert!(second.is_live());
        assert_eq!(second.message, first.message);

        assert_eq!(second.remaining_bytes(12), 340.0);
    }

    #[test]
    fn atomic_generation_carries_no_accounting() {
        let progress = TransferProgress::atomic(message(500), 3);
        assert_eq!(progress.baseline, 0.0);
        assert_eq!(progress.remaining_bytes(100), 0.0);
        assert!(progress.first);
    }
}
