//! Deterministic dispatch of pending subnet events.
//!
//! Events fire in tick order; events on the same tick fire in the order
//! they were produced. Every dispatch feeds an [Auditor] hash chain so two
//! runs can be compared for divergence.

use crate::{
    latency::LatencyModel,
    subnet::{Event, Payload},
    Error, Network, Subnet, Tick,
};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Hash chain over everything a scheduler has dispatched.
///
/// Two runs over the same seed, topology, and workload must end with equal
/// states; the first differing dispatch diverges the chains for good.
#[derive(Clone, Debug, Default)]
pub struct Auditor {
    hash: Vec<u8>,
}

impl Auditor {
    fn record(&mut self, tick: Tick, payload: &Payload) {
        let mut hasher = Sha256::new();
        hasher.update(&self.hash);
        hasher.update(tick.to_be_bytes());
        match payload {
            Payload::MessageReceived(transfer) => {
                hasher.update([0u8]);
                hasher.update(transfer.0.to_be_bytes());
            }
            Payload::BandwidthReallocation => {
                hasher.update([1u8]);
            }
        }
        self.hash = hasher.finalize().to_vec();
    }

    /// Digest of everything dispatched so far, as hex.
    pub fn state(&self) -> String {
        self.hash.iter().map(|b| format!("{b:02x}")).collect()
    }
}

/// Orders pending events and drives them back into a subnet.
pub struct Scheduler {
    now: Tick,
    sequence: u64,
    queue: BTreeMap<(Tick, u64), Payload>,
    auditor: Auditor,
}

impl Scheduler {
    /// Create a scheduler with an empty queue at `start`.
    pub fn new(start: Tick) -> Self {
        Self {
            now: start,
            sequence: 0,
            queue: BTreeMap::new(),
            auditor: Auditor::default(),
        }
    }

    /// Current virtual time.
    pub fn now(&self) -> Tick {
        self.now
    }

    /// Number of events waiting to fire.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Tick of the next event to fire, if any.
    pub fn next_tick(&self) -> Option<Tick> {
        self.queue.keys().next().map(|(tick, _)| *tick)
    }

    /// The dispatch audit chain.
    pub fn auditor(&self) -> &Auditor {
        &self.auditor
    }

    /// Enqueue events relative to the current time. Delays saturate, so an
    /// effectively-never event parks at the far end of the queue.
    pub fn schedule(&mut self, events: Vec<Event>) {
        for event in events {
            let at = self.now.saturating_add(event.delay);
            self.queue.insert((at, self.sequence), event.payload);
            self.sequence += 1;
        }
    }

    /// Fire the next event, advancing time to it. Returns whether anything
    /// was dispatched. A dispatch error leaves the event consumed.
    pub fn step<L: LatencyModel>(
        &mut self,
        subnet: &mut Subnet<L>,
        network: &mut Network,
    ) -> Result<bool, Error> {
        let Some(((tick, _), payload)) = self.queue.pop_first() else {
            return Ok(false);
        };
        self.now = tick;
        self.auditor.record(tick, &payload);
        let events = match payload {
            Payload::MessageReceived(transfer) => {
                subnet.on_message_received(network, transfer, tick)?
            }
            Payload::BandwidthReallocation => subnet.on_bandwidth_reallocation(network, tick),
        };
        self.schedule(events);
        Ok(true)
    }

    /// Fire events until the queue drains, returning how many fired.
    pub fn run<L: LatencyModel>(
        &mut self,
        subnet: &mut Subnet<L>,
        network: &mut Network,
    ) -> Result<usize, Error> {
        let mut dispatched = 0;
        while self.step(subnet, network)? {
            dispatched += 1;
        }
        Ok(dispatched)
    }

    /// Fire every event due at or before `deadline`, then advance time to
    /// the deadline. Returns how many fired.
    pub fn run_until<L: LatencyModel>(
        &mut self,
        deadline: Tick,
        subnet: &mut Subnet<L>,
        network: &mut Network,
    ) -> Result<usize, Error> {
        let mut dispatched = 0;
        while self.next_tick().is_some_and(|tick| tick <= deadline) {
            self.step(subnet, network)?;
            dispatched += 1;
        }
        self.now = self.now.max(deadline);
        Ok(dispatched)
    }
}

#[cfg(test)]
impl Scheduler {
    /// Queue contents in dispatch order.
    pub(crate) fn queued(&self) -> Vec<(Tick, Payload)> {
        self.queue
            .iter()
            .map(|((tick, _), payload)| (*tick, *payload))
            .collect()
    }
}
