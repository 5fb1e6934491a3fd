use crate::error::BusError;
use async_trait::async_trait;
use gw_protocol::{Envelope, Subject};

/// A message delivered to a wildcard subscriber: the concrete subject it was
/// published on plus the decoded envelope.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub subject: Subject,
    pub envelope: Envelope,
}

/// A live-class wildcard subscription. Delivery is serial per subscription
/// from the adapter's perspective -- the dispatcher parallelizes fan-out
/// downstream.
#[async_trait]
pub trait BusSubscription: Send {
    async fn next(&mut self) -> Option<BusMessage>;
}

/// A durable, queue-group subscription used exclusively by the federation
/// worker (out of the core's scope, but the capability lives on the same
/// adapter interface).
#[async_trait]
pub trait WorkSubscription: Send {
    async fn next(&mut self) -> Option<WorkMessage>;
}

#[derive(Debug, Clone)]
pub struct WorkMessage {
    pub subject: Subject,
    pub envelope: Envelope,
}

/// The durable event bus capability interface. The core depends only on
/// this trait.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Fire-and-forget publish with at-least-once delivery to durable
    /// subscribers. Failures are reported synchronously to the caller.
    async fn publish(&self, subject: &Subject, envelope: &Envelope) -> Result<(), BusError>;

    /// Idempotent creation of the two retention classes at boot (live:
    /// time-bounded; federation: work-queue with redelivery).
    async fn ensure_streams(&self) -> Result<(), BusError>;

    /// Install a wildcard subscription on the live class, e.g. `<ns>.>`.
    async fn subscribe_wildcard(
        &self,
        pattern: &str,
    ) -> Result<Box<dyn BusSubscription>, BusError>;

    /// Durable, queue-group subscription on the federation-retry subject,
    /// with redelivery on nack. Never used by the dispatcher itself.
    async fn work_subscribe(
        &self,
        subject: &str,
        queue_group: &str,
    ) -> Result<Box<dyn WorkSubscription>, BusError>;
}
