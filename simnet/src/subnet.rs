//! Transport orchestration for one simulated network segment.
//!
//! The subnet admits messages, shares bandwidth among the transfers in
//! flight, and produces the events an external scheduler must fire back
//! into it. Atomic datagrams are committed to the sender's uplink and get
//! their delivery event at admission; larger messages become
//! bandwidth-shared transfers whose delivery events come from reallocation
//! passes.
//!
//! A transfer's life is a chain of generations. Admission creates the
//! first, which has no delivery event in flight; every reallocation pass
//! that moves the pair's grant replaces the current generation with a
//! successor carrying a fresh delivery event. A retired generation whose
//! event is still in flight keeps its arena slot until the event fires and
//! is ignored.

use crate::{
    bandwidth::{BandwidthManager, Pair},
    latency::LatencyModel,
    message::Transport,
    metrics::{DropReason, Metrics},
    transfer::{TransferProgress, TransferStatus},
    Error, Message, MessageId, NetId, Network, Rate, Tick, TransferId,
};
use prometheus_client::registry::Registry;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

/// An event for the external scheduler to fire back into the subnet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Event {
    /// Ticks from now until the event fires.
    pub delay: Tick,
    /// What to dispatch when it fires.
    pub payload: Payload,
}

/// Work dispatched back into the subnet when an event fires.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Payload {
    /// A delivery attempt for a transfer generation.
    MessageReceived(TransferId),
    /// A debounced bandwidth reallocation pass.
    BandwidthReallocation,
}

/// Configuration for a [Subnet].
pub struct Config<L> {
    /// Latency, loss, and throughput queries.
    pub latency: L,
    /// Registry for transport counters.
    pub registry: Arc<Mutex<Registry>>,
}

/// The transport core of one simulated network segment.
pub struct Subnet<L: LatencyModel> {
    latency: L,
    metrics: Metrics,
    bandwidth: BandwidthManager,

    /// Every generation that may still be referenced by an in-flight event.
    transfers: BTreeMap<TransferId, TransferProgress>,
    /// Live transfers of each allocation, in message-identifier order.
    buckets: BTreeMap<Pair, BTreeMap<MessageId, TransferId>>,
    /// Live shared-bandwidth transfers by message identifier.
    index: BTreeMap<MessageId, TransferId>,

    next_message_id: MessageId,
    next_transfer_id: u64,
    /// Tick a reallocation pass is already scheduled for, if any.
    next_reallocation: Option<Tick>,
}

impl<L: LatencyModel> Subnet<L> {
    /// Create a subnet with no transfers in flight.
    pub fn new(cfg: Config<L>) -> Self {
        Self {
            latency: cfg.latency,
            metrics: Metrics::init(cfg.registry),
            bandwidth: BandwidthManager::new(),
            transfers: BTreeMap::new(),
            buckets: BTreeMap::new(),
            index: BTreeMap::new(),
            next_message_id: 0,
            next_transfer_id: 0,
            next_reallocation: None,
        }
    }

    /// Admit a message for transport at `now`.
    ///
    /// The first admission assigns the message its identifier; sending the
    /// same message again is a retransmission under the same identifier.
    /// Returned events are relative to `now` and must be enqueued by the
    /// caller. A message addressed to its own sender is dropped, as is a
    /// best-effort message that loses its delivery draw; both are silent
    /// no-ops that return no events.
    pub fn send(
        &mut self,
        network: &mut Network,
        message: &mut Message,
        now: Tick,
    ) -> Result<Vec<Event>, Error> {
        let origin = message.origin;
        let recipient = message.recipient;
        if !network.contains(origin) {
            return Err(Error::UnknownNode(origin));
        }
        if !network.contains(recipient) {
            return Err(Error::UnknownNode(recipient));
        }
        if origin == recipient {
            debug!(origin, reason = "self", "dropping message");
            self.metrics
                .dropped
                .get_or_create(&DropReason::self_dial())
                .inc();
            return Ok(Vec::new());
        }

        self.metrics.sent.inc();

        let loss = self.latency.loss_probability(network, message);
        if message.transport == Transport::BestEffort && network.gen_double() < loss {
            debug!(origin, recipient, id = ?message.id(), reason = "loss", "dropping message");
            self.metrics
                .dropped
                .get_or_create(&DropReason::loss())
                .inc();
            return Ok(Vec::new());
        }

        // A message that survives the draw takes its identifier; a lost
        // first send consumes none.
        let id = message.assign_id(&mut self.next_message_id);

        if message.is_atomic() {
            return Ok(vec![self.send_atomic(network, message, now)?]);
        }
        self.send_transfer(network, message, id, now)
    }

    /// Abort the shared-bandwidth transfer carrying `id`.
    ///
    /// The transfer is torn down immediately; if a delivery event for it is
    /// in flight, the retired generation absorbs that event when it fires.
    /// Cancelling a message that is unknown, already delivered, or atomic
    /// reports [Error::UnknownMessage].
    pub fn cancel_transmission(
        &mut self,
        network: &Network,
        id: MessageId,
        now: Tick,
    ) -> Result<Vec<Event>, Error> {
        self.release(network, id, TransferStatus::Cancelled)?;
        self.metrics.cancelled.inc();
        debug!(id, "transfer cancelled");
        let mut events = Vec::new();
        self.schedule_reallocation(now, &mut events);
        Ok(events)
    }

    /// Tear down everything touching `node`: every allocation it sends on
    /// or receives on, and every transfer inside those allocations.
    ///
    /// The node stays registered; delivery events already in flight for
    /// atomic datagrams addressed to it still land.
    pub fn on_disconnect(&mut self, node: NetId, now: Tick) -> Vec<Event> {
        let removed = self.bandwidth.remove_connections(node);
        let mut torn_down = 0usize;
        for allocation in &removed {
            let pair = (allocation.origin, allocation.recipient);
            let Some(bucket) = self.buckets.remove(&pair) else {
                continue;
            };
            for (id, tid) in bucket {
                self.index.remove(&id);
                self.retire(tid, TransferStatus::Cancelled);
                self.metrics.cancelled.inc();
                torn_down += 1;
            }
        }
        debug!(
            node,
            allocations = removed.len(),
            transfers = torn_down,
            "node disconnected"
        );
        let mut events = Vec::new();
        self.schedule_reallocation(now, &mut events);
        events
    }

    /// Fire a delivery event for `transfer`.
    ///
    /// A retired generation absorbs its stale event here and is collected.
    /// A live generation completes: the message is handed to the recipient
    /// and, for shared-bandwidth transfers, the freed capacity schedules a
    /// reallocation.
    pub fn on_message_received(
        &mut self,
        network: &mut Network,
        transfer: TransferId,
        now: Tick,
    ) -> Result<Vec<Event>, Error> {
        let Some(progress) = self.transfers.get(&transfer) else {
            self.metrics.stale.inc();
            trace!(?transfer, "ignoring event for unknown generation");
            return Ok(Vec::new());
        };
        if !progress.is_live() {
            let status = progress.status;
            self.transfers.remove(&transfer);
            self.metrics.stale.inc();
            trace!(?transfer, ?status, "ignoring stale delivery");
            return Ok(Vec::new());
        }

        let message = progress.message.clone();
        if message.is_atomic() {
            self.transfers.remove(&transfer);
            self.deliver(network, message)?;
            return Ok(Vec::new());
        }

        // Completion of the live generation of a shared-bandwidth transfer.
        let id = message.id().expect("transfer admitted without identifier");
        self.unlink(network, &message, id)?;
        self.transfers.remove(&transfer);
        self.deliver(network, message)?;

        // The freed capacity is shared out again.
        let mut events = Vec::new();
        self.schedule_reallocation(now, &mut events);
        Ok(events)
    }

    /// Run the debounced reallocation pass: recompute every allocation's
    /// grant, then replace the generations of every allocation whose grant
    /// moved.
    pub fn on_bandwidth_reallocation(&mut self, network: &Network, now: Tick) -> Vec<Event> {
        // A pass consumes its own marker only. A trigger earlier on this
        // tick may already have debounced a later pass; wiping that marker
        // here would let the next trigger schedule a duplicate for the
        // same tick.
        if self.next_reallocation.is_some_and(|at| at <= now) {
            self.next_reallocation = None;
        }
        self.metrics.reallocations.inc();
        self.bandwidth.allocate_bandwidth(network);
        let changed = self.bandwidth.take_changed();
        trace!(changed = changed.len(), "reallocating bandwidth");
        let mut events = Vec::new();
        for pair in changed {
            self.reschedule(network, pair, now, &mut events);
        }
        events
    }

    /// Serialize an atomic datagram onto the sender's uplink and produce
    /// its delivery event: wait for the uplink, push the bytes at the lower
    /// of the two endpoint capacities, then propagate.
    fn send_atomic(
        &mut self,
        network: &mut Network,
        message: &Message,
        now: Tick,
    ) -> Result<Event, Error> {
        let origin = message.origin;
        let recipient = message.recipient;
        let rate = {
            let sender = network.node(origin).ok_or(Error::UnknownNode(origin))?;
            let receiver = network
                .node(recipient)
                .ok_or(Error::UnknownNode(recipient))?;
            sender.uplink.min(receiver.downlink)
        };
        let serialization = self.latency.transmission_delay(message.size() as f64, rate);
        let propagation = self.latency.propagation_delay(network, origin, recipient);

        let sender = network.node_mut(origin).ok_or(Error::UnknownNode(origin))?;
        let commitment = now
            .max(sender.next_free_send())
            .saturating_add(serialization);
        sender.commit_send(commitment);
        let delay = (commitment - now).saturating_add(propagation);

        let tid = self.allocate_transfer_id();
        self.transfers
            .insert(tid, TransferProgress::atomic(message.clone(), now));
        trace!(origin, recipient, id = ?message.id(), delay, "datagram admitted");
        Ok(Event {
            delay,
            payload: Payload::MessageReceived(tid),
        })
    }

    /// Admit a message onto the shared-bandwidth path. No delivery event is
    /// produced here; the first comes from the next reallocation pass.
    fn send_transfer(
        &mut self,
        network: &Network,
        message: &Message,
        id: MessageId,
        now: Tick,
    ) -> Result<Vec<Event>, Error> {
        // A retransmission while the previous attempt is still in flight
        // tears the old attempt down first.
        if self.index.contains_key(&id) {
            self.release(network, id, TransferStatus::Cancelled)?;
        }

        let required = self.required_rate(network, message)?;
        self.bandwidth
            .add_connection(message.origin, message.recipient, required);

        let tid = self.allocate_transfer_id();
        self.transfers
            .insert(tid, TransferProgress::admitted(message.clone(), now));
        self.buckets
            .entry((message.origin, message.recipient))
            .or_default()
            .insert(id, tid);
        self.index.insert(id, tid);
        trace!(
            origin = message.origin,
            recipient = message.recipient,
            id,
            size = message.size(),
            fragments = message.fragments,
            "transfer admitted"
        );

        let mut events = Vec::new();
        self.schedule_reallocation(now, &mut events);
        Ok(events)
    }

    /// Replace every generation in the pair's bucket under the freshly
    /// granted rate: single pass over the bucket in message-identifier
    /// order, equal split of what is left of the grant, reliable flows
    /// capped by the pair's throughput estimate.
    fn reschedule(&mut self, network: &Network, pair: Pair, now: Tick, events: &mut Vec<Event>) {
        let Some(bucket) = self.buckets.get(&pair) else {
            return;
        };
        let entries: Vec<(MessageId, TransferId)> =
            bucket.iter().map(|(id, tid)| (*id, *tid)).collect();

        let mut pool = self
            .bandwidth
            .allocation(pair.0, pair.1)
            .map(|allocation| allocation.allocated)
            .unwrap_or(0.0);
        let mut waiting = entries.len();
        let propagation = self.latency.propagation_delay(network, pair.0, pair.1);
        let cap = self.latency.throughput_cap(network, pair.0, pair.1);

        let mut fresh = BTreeMap::new();
        for (id, tid) in entries {
            let equal = pool / waiting as f64;
            let (share, remaining, next) = {
                let old = self
                    .transfers
                    .get(&tid)
                    .expect("bucketed transfer missing a generation");
                let mut share = equal;
                if old.message.transport == Transport::Ordered {
                    share = share.min(cap);
                }
                (share, old.remaining_bytes(now), old.rescheduled(share, now))
            };
            pool -= share;
            waiting -= 1;

            let delay = self
                .latency
                .transmission_delay(remaining, share)
                .saturating_add(propagation);
            let successor = self.allocate_transfer_id();
            self.retire(tid, TransferStatus::Superseded);
            self.transfers.insert(successor, next);
            self.index.insert(id, successor);
            fresh.insert(id, successor);
            events.push(Event {
                delay,
                payload: Payload::MessageReceived(successor),
            });
            self.metrics.reschedules.inc();
            trace!(
                origin = pair.0,
                recipient = pair.1,
                id,
                share,
                remaining,
                delay,
                "transfer rescheduled"
            );
        }
        self.buckets.insert(pair, fresh);
    }

    /// Tear down the live transfer registered for `id` and retire its
    /// generation with `status`.
    fn release(
        &mut self,
        network: &Network,
        id: MessageId,
        status: TransferStatus,
    ) -> Result<(), Error> {
        let tid = self
            .index
            .get(&id)
            .copied()
            .ok_or(Error::UnknownMessage(id))?;
        let message = self
            .transfers
            .get(&tid)
            .expect("indexed transfer missing a generation")
            .message
            .clone();
        self.unlink(network, &message, id)?;
        self.retire(tid, status);
        Ok(())
    }

    /// Release the bandwidth and map slots held by a live transfer.
    fn unlink(&mut self, network: &Network, message: &Message, id: MessageId) -> Result<(), Error> {
        let required = self.required_rate(network, message)?;
        self.bandwidth
            .remove_connection(message.origin, message.recipient, required)?;
        self.index.remove(&id);
        let pair = (message.origin, message.recipient);
        if let Some(bucket) = self.buckets.get_mut(&pair) {
            bucket.remove(&id);
            if bucket.is_empty() {
                self.buckets.remove(&pair);
            }
        }
        Ok(())
    }

    /// Retire a generation. The admission-time generation has no delivery
    /// event in flight and is dropped outright; later generations keep
    /// their arena slot under the retired status until their event fires.
    fn retire(&mut self, id: TransferId, status: TransferStatus) {
        let Some(progress) = self.transfers.get_mut(&id) else {
            return;
        };
        if progress.first {
            self.transfers.remove(&id);
        } else {
            progress.status = status;
        }
    }

    /// Hand a message to its recipient.
    fn deliver(&mut self, network: &mut Network, message: Message) -> Result<(), Error> {
        let recipient = message.recipient;
        let node = network
            .node_mut(recipient)
            .ok_or(Error::UnknownNode(recipient))?;
        trace!(origin = message.origin, recipient, id = ?message.id(), "message delivered");
        node.deliver(message);
        self.metrics.delivered.inc();
        Ok(())
    }

    /// Debounce a reallocation pass: schedule one a tick out unless one is
    /// already pending.
    fn schedule_reallocation(&mut self, now: Tick, events: &mut Vec<Event>) {
        let due = now.saturating_add(1);
        if let Some(at) = self.next_reallocation {
            if at >= due {
                return;
            }
        }
        self.next_reallocation = Some(due);
        events.push(Event {
            delay: 1,
            payload: Payload::BandwidthReallocation,
        });
    }

    /// Rate a transfer asks for at admission: the sender's uplink, capped
    /// by the pair's throughput estimate for reliable flows.
    fn required_rate(&self, network: &Network, message: &Message) -> Result<Rate, Error> {
        let sender = network
            .node(message.origin)
            .ok_or(Error::UnknownNode(message.origin))?;
        let mut required = sender.uplink;
        if message.transport == Transport::Ordered {
            required = required.min(self.latency.throughput_cap(
                network,
                message.origin,
                message.recipient,
            ));
        }
        Ok(required)
    }

    fn allocate_transfer_id(&mut self) -> TransferId {
        let id = TransferId(self.next_transfer_id);
        self.next_transfer_id += 1;
        id
    }
}

#[cfg(test)]
impl<L: LatencyModel> Subnet<L> {
    /// The generation behind a handle.
    pub(crate) fn generation(&self, id: TransferId) -> Option<&TransferProgress> {
        self.transfers.get(&id)
    }

    /// Number of generations in the arena, any status.
    pub(crate) fn generations(&self) -> usize {
        self.transfers.len()
    }

    /// Generations retired as cancelled and awaiting their stale event.
    pub(crate) fn tombstones(&self) -> usize {
        self.transfers
            .values()
            .filter(|t| t.status == TransferStatus::Cancelled)
            .count()
    }

    /// Generations replaced by a successor and awaiting their stale event.
    pub(crate) fn superseded(&self) -> usize {
        self.transfers
            .values()
            .filter(|t| t.status == TransferStatus::Superseded)
            .count()
    }

    /// Live transfer handle for a message identifier.
    pub(crate) fn lookup(&self, id: MessageId) -> Option<TransferId> {
        self.index.get(&id).copied()
    }

    /// Number of live shared-bandwidth transfers.
    pub(crate) fn indexed(&self) -> usize {
        self.index.len()
    }

    /// Bucket contents for a pair, in message-identifier order.
    pub(crate) fn bucket(&self, origin: NetId, recipient: NetId) -> Vec<(MessageId, TransferId)> {
        self.buckets
            .get(&(origin, recipient))
            .map(|bucket| bucket.iter().map(|(id, tid)| (*id, *tid)).collect())
            .unwrap_or_default()
    }

    /// The bandwidth manager, for allocation assertions.
    pub(crate) fn bandwidth(&self) -> &BandwidthManager {
        &self.bandwidth
    }

    /// Tick a reallocation pass is pending for, if any.
    pub(crate) fn pending_reallocation(&self) -> Option<Tick> {
        self.next_reallocation
    }

    /// The metrics container, for counter assertions.
    pub(crate) fn metrics(&self) -> &Metrics {
        &self.metrics
    }
}
