//! Registry of simulated nodes.

use crate::{Error, Message, NetId, Rate, Tick};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::collections::{BTreeMap, VecDeque};

/// Configuration for a [Network].
#[derive(Clone, Debug)]
pub struct Config {
    /// Seed for all randomness consumed during the run (currently the
    /// per-message loss draw). Identical seeds over identical workloads
    /// produce identical runs.
    pub seed: u64,
}

/// A participant in the simulation.
#[derive(Clone, Debug)]
pub struct Node {
    /// Identifier.
    pub id: NetId,
    /// Outbound capacity in bytes per tick.
    pub uplink: Rate,
    /// Inbound capacity in bytes per tick.
    pub downlink: Rate,
    /// Region key used by the latency tables.
    pub locality: String,

    next_free_send: Tick,
    inbox: VecDeque<Message>,
}

impl Node {
    /// Create a node. Capacities are in bytes per tick.
    pub fn new(id: NetId, uplink: Rate, downlink: Rate, locality: impl Into<String>) -> Self {
        Self {
            id,
            uplink,
            downlink,
            locality: locality.into(),
            next_free_send: 0,
            inbox: VecDeque::new(),
        }
    }

    /// Earliest tick at which the uplink is free to serialize another
    /// atomic datagram.
    pub fn next_free_send(&self) -> Tick {
        self.next_free_send
    }

    /// Record that the uplink is busy serializing until `commitment`.
    pub(crate) fn commit_send(&mut self, commitment: Tick) {
        self.next_free_send = commitment;
    }

    /// Hand a message to the application layer.
    pub(crate) fn deliver(&mut self, message: Message) {
        self.inbox.push_back(message);
    }

    /// Take the oldest delivered message, if any.
    pub fn recv(&mut self) -> Option<Message> {
        self.inbox.pop_front()
    }

    /// Number of delivered messages not yet consumed.
    pub fn pending(&self) -> usize {
        self.inbox.len()
    }
}

/// All nodes participating in a simulation, plus the run's randomness.
pub struct Network {
    nodes: BTreeMap<NetId, Node>,
    rng: StdRng,
}

impl Network {
    /// Create an empty network.
    pub fn new(cfg: Config) -> Self {
        Self {
            nodes: BTreeMap::new(),
            rng: StdRng::seed_from_u64(cfg.seed),
        }
    }

    /// Add a node to the registry.
    pub fn register(&mut self, node: Node) -> Result<(), Error> {
        let id = node.id;
        if self.nodes.contains_key(&id) {
            return Err(Error::DuplicateNode(id));
        }
        self.nodes.insert(id, node);
        Ok(())
    }

    /// Look up a node.
    pub fn node(&self, id: NetId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    /// Look up a node mutably, e.g. to drain its inbox.
    pub fn node_mut(&mut self, id: NetId) -> Option<&mut Node> {
        self.nodes.get_mut(&id)
    }

    /// Whether `id` is registered.
    pub fn contains(&self, id: NetId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Number of registered nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Iterate over all nodes in identifier order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Uniform draw in `[0, 1)`, used for the per-message loss decision.
    pub(crate) fn gen_double(&mut self) -> f64 {
        self.rng.gen()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Transport;
    use bytes::Bytes;

    fn network() -> Network {
        Network::new(Config { seed: 0 })
    }

    #[test]
    fn register_and_lookup() {
        let mut net = network();
        net.register(Node::new(1, 100.0, 200.0, "DE")).unwrap();
        net.register(Node::new(2, 50.0, 50.0, "US")).unwrap();

        assert_eq!(net.len(), 2);
        assert!(net.contains(1));
        assert!(!net.contains(3));
        assert_eq!(net.node(2).unwrap().locality, "US");
        assert!(net.node(3).is_none());
    }

    #[test]
    fn duplicate_registration_rejected() {
        let mut net = network();
        net.register(Node::new(1, 1.0, 1.0, "DE")).unwrap();
        assert!(matches!(
            net.register(Node::new(1, 2.0, 2.0, "US")),
            Err(Error::DuplicateNode(1))
        ));
        // Original registration untouched.
        assert_eq!(net.node(1).unwrap().uplink, 1.0);
    }

    #[test]
    fn inbox_preserves_delivery_order() {
        let mut node = Node::new(1, 1.0, 1.0, "DE");
        for size in [1usize, 2, 3] {
            node.deliver(Message::new(
                2,
                1,
                Bytes::from(vec![0u8; size]),
                Transport::BestEffort,
            ));
        }
        assert_eq!(node.pending(), 3);
        assert_eq!(node.recv().unwrap().size(), 1);
        assert_eq!(node.recv().unwrap().size(), 2);
        assert_eq!(node.recv().unwrap().size(), 3);
        assert!(node.recv().is_none());
    }

    #[test]
    fn same_seed_same_draws() {
        let mut a = network();
        let mut b = network();
        for _ in 0..16 {
            assert_eq!(a.gen_double(), b.gen_double());
        }
    }
}
