//! Messages exchanged between simulated nodes.

use crate::{MessageId, NetId};
use bytes::Bytes;

/// Maximum bytes a single datagram can carry. Larger payloads split into
/// multiple fragments and move through the shared-bandwidth transfer path.
pub const MTU: u64 = 65_507;

/// Delivery guarantees requested for a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Transport {
    /// Fire-and-forget: subject to the loss model, never retransmitted.
    BestEffort,
    /// Reliable stream: exempt from the loss draw but capped by the
    /// steady-state throughput estimate for the endpoint pair.
    Ordered,
}

/// A message addressed from one simulated node to another.
///
/// An identifier is assigned on first admission and kept for the lifetime of
/// the value, so retransmitting the same message reuses the identifier.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    /// Sender.
    pub origin: NetId,
    /// Recipient.
    pub recipient: NetId,
    /// Application payload.
    pub payload: Bytes,
    /// Number of fragments the payload splits into (1 = atomic datagram).
    pub fragments: u32,
    /// Requested delivery guarantees.
    pub transport: Transport,

    id: Option<MessageId>,
}

impl Message {
    /// Create a message whose fragment count follows from the payload size.
    pub fn new(origin: NetId, recipient: NetId, payload: Bytes, transport: Transport) -> Self {
        let fragments = fragments(payload.len() as u64);
        Self {
            origin,
            recipient,
            payload,
            fragments,
            transport,
            id: None,
        }
    }

    /// Create a message with an explicit fragment count, for callers that
    /// account for segmentation themselves (protocol overhead, jumbo frames).
    pub fn with_fragments(
        origin: NetId,
        recipient: NetId,
        payload: Bytes,
        fragments: u32,
        transport: Transport,
    ) -> Self {
        Self {
            origin,
            recipient,
            payload,
            fragments: fragments.max(1),
            transport,
            id: None,
        }
    }

    /// Payload size in bytes.
    pub fn size(&self) -> u64 {
        self.payload.len() as u64
    }

    /// Identifier, if one has been assigned yet.
    pub fn id(&self) -> Option<MessageId> {
        self.id
    }

    /// Whether the message fits in a single datagram.
    pub fn is_atomic(&self) -> bool {
        self.fragments <= 1
    }

    /// Return the message identifier, drawing a fresh one from `next` on
    /// first admission.
    pub(crate) fn assign_id(&mut self, next: &mut MessageId) -> MessageId {
        match self.id {
            Some(id) => id,
            None => {
                let id = *next;
                *next += 1;
                self.id = Some(id);
                id
            }
        }
    }
}

/// Fragments needed to carry `bytes` over the wire.
fn fragments(bytes: u64) -> u32 {
    bytes.div_ceil(MTU).max(1) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(len: usize) -> Message {
        Message::new(1, 2, Bytes::from(vec![0u8; len]), Transport::BestEffort)
    }

    #[test]
    fn fragment_count_follows_payload_size() {
        assert_eq!(message(0).fragments, 1);
        assert_eq!(message(1).fragments, 1);
        assert_eq!(message(MTU as usize).fragments, 1);
        assert_eq!(message(MTU as usize + 1).fragments, 2);
        assert_eq!(message(3 * MTU as usize).fragments, 3);
    }

    #[test]
    fn atomic_iff_single_fragment() {
        assert!(message(10).is_atomic());
        let big = Message::with_fragments(1, 2, Bytes::from_static(b"x"), 4, Transport::Ordered);
        assert!(!big.is_atomic());
    }

    #[test]
    fn explicit_fragment_count_is_clamped_to_one() {
        let msg = Message::with_fragments(1, 2, Bytes::new(), 0, Transport::BestEffort);
        assert_eq!(msg.fragments, 1);
    }

    #[test]
    fn identifier_assigned_once() {
        let mut next = 7;
        let mut msg = message(10);
        assert_eq!(msg.id(), None);
        assert_eq!(msg.assign_id(&mut next), 7);
        assert_eq!(next, 8);

        // Retransmission keeps the original identifier.
        assert_eq!(msg.assign_id(&mut next), 7);
        assert_eq!(next, 8);
        assert_eq!(msg.id(), Some(7));
    }
}
