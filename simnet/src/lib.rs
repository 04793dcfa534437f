//! Deterministic discrete-event simulation of message transport over
//! bandwidth-shared links.
//!
//! A [Subnet] admits messages between registered [Node]s and turns them
//! into events for a [Scheduler] to fire back into it. Small messages are
//! serialized onto the sender's uplink and delivered after propagation;
//! larger ones become transfers that share pair bandwidth, are rescheduled
//! whenever a debounced reallocation pass moves a grant, and complete when
//! their final generation's delivery event fires. Timing and loss come
//! from a [latency::LatencyModel]; the only randomness is the seeded loss
//! draw, so runs with equal seeds over equal workloads are identical.
//!
//! # Example
//!
//! ```rust
//! use simnet::{latency, network, subnet, Message, Network, Node, Scheduler, Subnet, Transport};
//! use bytes::Bytes;
//! use prometheus_client::registry::Registry;
//! use std::sync::{Arc, Mutex};
//!
//! // Two nodes joined by symmetric 10 byte/tick links.
//! let mut network = Network::new(network::Config { seed: 42 });
//! network.register(Node::new(1, 10.0, 10.0, "DE")).unwrap();
//! network.register(Node::new(2, 10.0, 10.0, "US")).unwrap();
//!
//! let latency = latency::GnpLatencyModel::new(latency::Config {
//!     default: latency::LinkMetrics { min_delay: 5.0, avg_delay: 5.0, weight: 0.0 },
//!     fragment_loss: 0.0,
//! });
//! let mut subnet = Subnet::new(subnet::Config {
//!     latency,
//!     registry: Arc::new(Mutex::new(Registry::default())),
//! });
//! let mut scheduler = Scheduler::new(0);
//!
//! // A multi-fragment message moves through the shared-bandwidth path.
//! let mut message =
//!     Message::with_fragments(1, 2, Bytes::from(vec![0u8; 100]), 4, Transport::BestEffort);
//! let events = subnet.send(&mut network, &mut message, scheduler.now()).unwrap();
//! scheduler.schedule(events);
//! scheduler.run(&mut subnet, &mut network).unwrap();
//!
//! let delivered = network.node_mut(2).unwrap().recv().unwrap();
//! assert_eq!(delivered.size(), 100);
//! ```

pub mod bandwidth;
pub mod cache;
pub mod latency;
pub mod message;
pub mod metrics;
pub mod network;
pub mod scheduler;
pub mod subnet;
pub mod transfer;

pub use cache::BlockCache;
pub use message::{Message, Transport, MTU};
pub use network::{Network, Node};
pub use scheduler::{Auditor, Scheduler};
pub use subnet::{Event, Payload, Subnet};
pub use transfer::{TransferId, TransferProgress, TransferStatus};

use thiserror::Error;

/// Node identifier.
pub type NetId = u64;

/// Virtual time instant or span, in ticks.
pub type Tick = u64;

/// Bandwidth in bytes per tick.
pub type Rate = f64;

/// Message identifier, assigned on first admission.
pub type MessageId = u64;

/// Errors reported by the transport core.
#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown message: {0}")]
    UnknownMessage(MessageId),
    #[error("unknown connection: {0}->{1}")]
    UnknownConnection(NetId, NetId),
    #[error("unknown node: {0}")]
    UnknownNode(NetId),
    #[error("duplicate node: {0}")]
    DuplicateNode(NetId),
}
