//! Latency, loss, and throughput estimation for simulated links.

use crate::{message::Transport, Message, NetId, Network, Rate, Tick};
use std::collections::BTreeMap;

/// Constant of the Mathis steady-state TCP throughput estimate, `sqrt(3/2)`.
const MATHIS_C: f64 = 1.224_744_871_391_589;

/// Maximum segment size assumed for reliable flows, in bytes.
const MSS: f64 = 1460.0;

/// Timing and loss queries the transport core makes about a pair of nodes.
///
/// Implementations must be deterministic: for a fixed topology the same
/// query always returns the same answer.
pub trait LatencyModel {
    /// Ticks a signal needs to travel from `origin` to `recipient`,
    /// independent of message size.
    fn propagation_delay(&self, network: &Network, origin: NetId, recipient: NetId) -> Tick;

    /// Ticks needed to push `bytes` onto the wire at `rate` bytes per tick.
    ///
    /// A non-positive rate yields [Tick::MAX]: the transfer makes no
    /// progress until it is rescheduled with a real share.
    fn transmission_delay(&self, bytes: f64, rate: Rate) -> Tick;

    /// Probability that `message` is lost in transit.
    fn loss_probability(&self, network: &Network, message: &Message) -> f64;

    /// Upper bound on the sustained rate a reliable flow between the pair
    /// can reach, in bytes per tick. [f64::INFINITY] means unconstrained.
    fn throughput_cap(&self, network: &Network, origin: NetId, recipient: NetId) -> Rate;
}

/// Delay summary for a pair of localities, in ticks.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LinkMetrics {
    /// Fastest observed one-way delay.
    pub min_delay: f64,
    /// Expected one-way delay.
    pub avg_delay: f64,
    /// Number of samples behind the summary.
    pub weight: f64,
}

/// Configuration for a [GnpLatencyModel].
#[derive(Clone, Debug)]
pub struct Config {
    /// Metrics assumed for locality pairs without a measured entry.
    pub default: LinkMetrics,
    /// Probability that any single fragment is lost in transit.
    pub fragment_loss: f64,
}

/// Latency model backed by measured link summaries between localities.
///
/// Propagation is the expected delay plus the expected jitter
/// (`avg + (avg - min)`); loss compounds the per-fragment probability over
/// a message's fragment count; reliable flows are capped by the Mathis
/// estimate over the pair's round trip.
pub struct GnpLatencyModel {
    links: BTreeMap<String, BTreeMap<String, LinkMetrics>>,
    default: LinkMetrics,
    fragment_loss: f64,
}

impl GnpLatencyModel {
    /// Create a model with no measured links.
    pub fn new(cfg: Config) -> Self {
        Self {
            links: BTreeMap::new(),
            default: cfg.default,
            fragment_loss: cfg.fragment_loss,
        }
    }

    /// Record the measured summary for a pair of localities. Lookups match
    /// either orientation, so one direction suffices.
    pub fn insert(&mut self, a: impl Into<String>, b: impl Into<String>, metrics: LinkMetrics) {
        self.links.entry(a.into()).or_default().insert(b.into(), metrics);
    }

    /// Summary for a pair of localities, falling back to the default entry.
    pub fn metrics(&self, a: &str, b: &str) -> LinkMetrics {
        self.lookup(a, b)
            .or_else(|| self.lookup(b, a))
            .unwrap_or(self.default)
    }

    /// Expected one-way delay between two nodes, before rounding to ticks.
    pub fn expected_delay(&self, network: &Network, origin: NetId, recipient: NetId) -> f64 {
        let metrics = match (network.node(origin), network.node(recipient)) {
            (Some(a), Some(b)) => self.metrics(&a.locality, &b.locality),
            _ => self.default,
        };
        metrics.avg_delay + (metrics.avg_delay - metrics.min_delay)
    }

    fn lookup(&self, a: &str, b: &str) -> Option<LinkMetrics> {
        self.links.get(a).and_then(|peers| peers.get(b)).copied()
    }
}

impl LatencyModel for GnpLatencyModel {
    fn propagation_delay(&self, network: &Network, origin: NetId, recipient: NetId) -> Tick {
        self.expected_delay(network, origin, recipient).max(0.0).round() as Tick
    }

    fn transmission_delay(&self, bytes: f64, rate: Rate) -> Tick {
        if rate <= 0.0 {
            return Tick::MAX;
        }
        let ticks = (bytes / rate).ceil();
        if ticks >= Tick::MAX as f64 {
            Tick::MAX
        } else {
            ticks as Tick
        }
    }

    fn loss_probability(&self, _network: &Network, message: &Message) -> f64 {
        match message.transport {
            // Loss surfaces as reduced throughput for reliable flows.
            Transport::Ordered => 0.0,
            Transport::BestEffort => {
                1.0 - (1.0 - self.fragment_loss).powi(message.fragments as i32)
            }
        }
    }

    fn throughput_cap(&self, network: &Network, origin: NetId, recipient: NetId) -> Rate {
        if self.fragment_loss <= 0.0 {
            return f64::INFINITY;
        }
        let rtt = 2.0 * self.expected_delay(network, origin, recipient);
        if rtt <= 0.0 {
            return f64::INFINITY;
        }
        MSS * MATHIS_C / (rtt * self.fragment_loss.sqrt())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{self, Node};
    use bytes::Bytes;
    use test_case::test_case;

    const TOLERANCE: f64 = 0.0001;

    fn metrics(min_delay: f64, avg_delay: f64, weight: f64) -> LinkMetrics {
        LinkMetrics {
            min_delay,
            avg_delay,
            weight,
        }
    }

    /// Model loaded with measured summaries for a handful of regions.
    fn model(fragment_loss: f64) -> GnpLatencyModel {
        let mut model = GnpLatencyModel::new(Config {
            default: metrics(500.0, 750.0, 0.0),
            fragment_loss,
        });
        model.insert("DE", "DE", metrics(10.0, 12.5, 1.0));
        model.insert("US", "DE", metrics(200.0, 250.0, 2.0));
        model.insert("JP", "JP", metrics(20.0, 25.0, 3.0));
        model.insert("EU", "JP", metrics(300.0, 375.0, 4.0));
        model.insert("US", "CA", metrics(30.0, 30.0, 5.0));
        model.insert("JP", "CA", metrics(250.0, 275.0, 6.0));
        model.insert("BR", "BR", metrics(40.0, 45.0, 7.0));
        model.insert("CA", "BR", metrics(100.0, 120.0, 8.0));
        model
    }

    fn network(localities: &[&str]) -> Network {
        let mut net = Network::new(network::Config { seed: 0 });
        for (id, locality) in localities.iter().enumerate() {
            net.register(Node::new(id as NetId, 10.0, 10.0, *locality))
                .unwrap();
        }
        net
    }

    #[test_case("DE", "DE", 15.0; "intra germany")]
    #[test_case("US", "DE", 300.0; "transatlantic")]
    #[test_case("JP", "JP", 30.0; "intra japan")]
    #[test_case("EU", "JP", 450.0; "europe to japan")]
    #[test_case("US", "CA", 30.0; "no jitter margin")]
    #[test_case("JP", "CA", 300.0; "pacific")]
    #[test_case("BR", "BR", 50.0; "intra brazil")]
    #[test_case("CA", "BR", 140.0; "americas")]
    fn expected_delay_adds_jitter_margin(a: &str, b: &str, expected: f64) {
        let model = model(0.0);
        let net = network(&[a, b]);
        assert!((model.expected_delay(&net, 0, 1) - expected).abs() <= TOLERANCE);
        // Orientation of the measured entry does not matter.
        assert!((model.expected_delay(&net, 1, 0) - expected).abs() <= TOLERANCE);
    }

    #[test]
    fn propagation_rounds_to_ticks() {
        let model = model(0.0);
        let net = network(&["DE", "DE"]);
        assert_eq!(model.propagation_delay(&net, 0, 1), 15);
    }

    #[test]
    fn unmeasured_pair_falls_back_to_default() {
        let model = model(0.0);
        let net = network(&["DE", "AU"]);
        // default (500, 750) => 750 + 250
        assert!((model.expected_delay(&net, 0, 1) - 1000.0).abs() <= TOLERANCE);
    }

    #[test]
    fn unknown_node_falls_back_to_default() {
        let model = model(0.0);
        let net = network(&["DE"]);
        assert!((model.expected_delay(&net, 0, 99) - 1000.0).abs() <= TOLERANCE);
    }

    #[test]
    fn transmission_rounds_up() {
        let model = model(0.0);
        assert_eq!(model.transmission_delay(0.0, 10.0), 0);
        assert_eq!(model.transmission_delay(100.0, 10.0), 10);
        assert_eq!(model.transmission_delay(101.0, 10.0), 11);
        assert_eq!(model.transmission_delay(1.0, 10.0), 1);
    }

    #[test]
    fn starved_rate_never_completes() {
        let model = model(0.0);
        assert_eq!(model.transmission_delay(100.0, 0.0), Tick::MAX);
        assert_eq!(model.transmission_delay(100.0, -1.0), Tick::MAX);
    }

    #[test]
    fn loss_compounds_over_fragments() {
        let model = model(0.1);
        let net = network(&["DE", "DE"]);

        let single = Message::with_fragments(0, 1, Bytes::new(), 1, Transport::BestEffort);
        assert!((model.loss_probability(&net, &single) - 0.1).abs() <= TOLERANCE);

        let double = Message::with_fragments(0, 1, Bytes::new(), 2, Transport::BestEffort);
        assert!((model.loss_probability(&net, &double) - 0.19).abs() <= TOLERANCE);
    }

    #[test]
    fn reliable_transport_is_exempt_from_loss() {
        let model = model(0.5);
        let net = network(&["DE", "DE"]);
        let msg = Message::with_fragments(0, 1, Bytes::new(), 8, Transport::Ordered);
        assert_eq!(model.loss_probability(&net, &msg), 0.0);
    }

    #[test]
    fn lossless_link_has_no_throughput_cap() {
        let model = model(0.0);
        let net = network(&["DE", "DE"]);
        assert_eq!(model.throughput_cap(&net, 0, 1), f64::INFINITY);
    }

    #[test]
    fn throughput_cap_shrinks_with_distance() {
        let model = model(0.01);
        let net = network(&["DE", "DE", "US"]);
        let near = model.throughput_cap(&net, 0, 1);
        let far = model.throughput_cap(&net, 0, 2);
        assert!(near.is_finite() && far.is_finite());
        assert!(near > far);

        // DE<->DE: rtt = 30, p = 0.01 => 1460 * sqrt(3/2) / (30 * 0.1)
        let expected = 1460.0 * MATHIS_C / 3.0;
        assert!((near - expected).abs() <= TOLERANCE);
    }
}
