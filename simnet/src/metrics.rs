//! Counters tracking what the transport core does to messages.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;
use std::sync::{Arc, Mutex};

/// Label for messages that never reached their recipient.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DropReason {
    /// Why the message was dropped.
    pub reason: String,
}

impl DropReason {
    /// Message addressed to its own sender.
    pub fn self_dial() -> Self {
        Self {
            reason: "self".to_string(),
        }
    }

    /// Message lost to the loss model.
    pub fn loss() -> Self {
        Self {
            reason: "loss".to_string(),
        }
    }
}

/// Metrics exposed by the transport core.
#[derive(Debug)]
pub struct Metrics {
    /// Messages admitted for transport.
    pub sent: Counter,
    /// Messages handed to a recipient.
    pub delivered: Counter,
    /// Messages dropped before transport, by reason.
    pub dropped: Family<DropReason, Counter>,
    /// Transfers cancelled before completion.
    pub cancelled: Counter,
    /// Delivery events ignored because their generation was retired.
    pub stale: Counter,
    /// Bandwidth reallocation passes executed.
    pub reallocations: Counter,
    /// Transfer generations produced by rescheduling.
    pub reschedules: Counter,
}

impl Metrics {
    /// Create and register metrics against `registry`.
    pub fn init(registry: Arc<Mutex<Registry>>) -> Self {
        let metrics = Self {
            sent: Counter::default(),
            delivered: Counter::default(),
            dropped: Family::default(),
            cancelled: Counter::default(),
            stale: Counter::default(),
            reallocations: Counter::default(),
            reschedules: Counter::default(),
        };
        {
            let mut registry = registry.lock().unwrap();
            registry.register(
                "messages_sent",
                "Messages admitted for transport",
                metrics.sent.clone(),
            );
            registry.register(
                "messages_delivered",
                "Messages handed to a recipient",
                metrics.delivered.clone(),
            );
            registry.register(
                "messages_dropped",
                "Messages dropped before transport",
                metrics.dropped.clone(),
            );
            registry.register(
                "transfers_cancelled",
                "Transfers cancelled before completion",
                metrics.cancelled.clone(),
            );
            registry.register(
                "stale_deliveries",
                "Delivery events ignored because their generation was retired",
                metrics.stale.clone(),
            );
            registry.register(
                "bandwidth_reallocations",
                "Bandwidth reallocation passes executed",
                metrics.reallocations.clone(),
            );
            registry.register(
                "transfer_reschedules",
                "Transfer generations produced by rescheduling",
                metrics.reschedules.clone(),
            );
        }
        metrics
    }
}
