//! Fair-share bandwidth accounting between node pairs.
//!
//! Every ordered `(sender, receiver)` pair with at least one transfer in
//! flight holds an [Allocation]. An allocation pass divides each node's
//! uplink across the allocations sending from it and each downlink across
//! the allocations received by it; an allocation is granted the lower of
//! its two shares, so neither endpoint is ever oversubscribed.

use crate::{Error, NetId, Network, Rate};
use std::collections::{BTreeMap, BTreeSet};
use std::mem;

/// Ordered sender-receiver pair identifying an allocation.
pub type Pair = (NetId, NetId);

/// Shared bandwidth state for one ordered pair of nodes.
#[derive(Clone, Debug, PartialEq)]
pub struct Allocation {
    /// Sender.
    pub origin: NetId,
    /// Receiver.
    pub recipient: NetId,
    /// Number of transfers competing on the pair.
    pub connections: usize,
    /// Sum of the rates the competing transfers asked for at admission.
    pub required: Rate,
    /// Rate granted by the last allocation pass, in bytes per tick.
    pub allocated: Rate,
}

/// Divides node capacities among the allocations competing for them.
pub struct BandwidthManager {
    allocations: BTreeMap<Pair, Allocation>,
    changed: BTreeSet<Pair>,
}

impl BandwidthManager {
    /// Create a manager with no allocations.
    pub fn new() -> Self {
        Self {
            allocations: BTreeMap::new(),
            changed: BTreeSet::new(),
        }
    }

    /// Register one more competing connection on the pair, creating the
    /// allocation if it is the first. `required` is the rate the transfer
    /// asked for at admission and is tracked for accounting.
    pub fn add_connection(&mut self, origin: NetId, recipient: NetId, required: Rate) {
        let allocation = self
            .allocations
            .entry((origin, recipient))
            .or_insert(Allocation {
                origin,
                recipient,
                connections: 0,
                required: 0.0,
                allocated: 0.0,
            });
        allocation.connections += 1;
        allocation.required += required;
    }

    /// Release one connection from the pair, subtracting the rate it asked
    /// for at admission. The allocation is dropped once its last connection
    /// is released.
    pub fn remove_connection(
        &mut self,
        origin: NetId,
        recipient: NetId,
        required: Rate,
    ) -> Result<(), Error> {
        let pair = (origin, recipient);
        let allocation = self
            .allocations
            .get_mut(&pair)
            .ok_or(Error::UnknownConnection(origin, recipient))?;
        allocation.connections -= 1;
        allocation.required = (allocation.required - required).max(0.0);
        if allocation.connections == 0 {
            self.allocations.remove(&pair);
            self.changed.remove(&pair);
        }
        Ok(())
    }

    /// Drop every allocation that sends from or delivers to `node`,
    /// returning the removed allocations in pair order.
    pub fn remove_connections(&mut self, node: NetId) -> Vec<Allocation> {
        let doomed: Vec<Pair> = self
            .allocations
            .keys()
            .filter(|(origin, recipient)| *origin == node || *recipient == node)
            .copied()
            .collect();
        let mut removed = Vec::with_capacity(doomed.len());
        for pair in doomed {
            self.changed.remove(&pair);
            if let Some(allocation) = self.allocations.remove(&pair) {
                removed.push(allocation);
            }
        }
        removed
    }

    /// Recompute every allocation's granted rate from current capacities and
    /// membership, recording which allocations moved.
    ///
    /// Baseline policy: each node's capacity splits equally across its
    /// competing allocations (pair order breaks ties by construction), and
    /// a pair is granted the lower of its egress and ingress shares.
    pub fn allocate_bandwidth(&mut self, network: &Network) {
        let mut egress: BTreeMap<NetId, usize> = BTreeMap::new();
        let mut ingress: BTreeMap<NetId, usize> = BTreeMap::new();
        for (origin, recipient) in self.allocations.keys() {
            *egress.entry(*origin).or_default() += 1;
            *ingress.entry(*recipient).or_default() += 1;
        }

        for (pair, allocation) in self.allocations.iter_mut() {
            let uplink = network.node(pair.0).map(|n| n.uplink).unwrap_or(0.0);
            let downlink = network.node(pair.1).map(|n| n.downlink).unwrap_or(0.0);
            let up_share = uplink / egress[&pair.0] as f64;
            let down_share = downlink / ingress[&pair.1] as f64;
            let granted = up_share.min(down_share);
            if granted != allocation.allocated {
                allocation.allocated = granted;
                self.changed.insert(*pair);
            }
        }
    }

    /// Drain the set of allocations whose granted rate moved since the
    /// previous drain, in pair order.
    pub fn take_changed(&mut self) -> Vec<Pair> {
        mem::take(&mut self.changed).into_iter().collect()
    }

    /// Look up the allocation for a pair.
    pub fn allocation(&self, origin: NetId, recipient: NetId) -> Option<&Allocation> {
        self.allocations.get(&(origin, recipient))
    }

    /// Number of active allocations.
    pub fn len(&self) -> usize {
        self.allocations.len()
    }

    /// Whether any allocation is active.
    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }

    /// Iterate over all allocations in pair order.
    pub fn allocations(&self) -> impl Iterator<Item = &Allocation> {
        self.allocations.values()
    }
}

#[cfg(test)]
impl BandwidthManager {
    /// Granted rate for a pair, zero if absent.
    pub(crate) fn granted(&self, origin: NetId, recipient: NetId) -> Rate {
        self.allocation(origin, recipient)
            .map(|a| a.allocated)
            .unwrap_or(0.0)
    }

    /// Pairs currently marked changed.
    pub(crate) fn changed(&self) -> Vec<Pair> {
        self.changed.iter().copied().collect()
    }
}
