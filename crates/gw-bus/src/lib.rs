//! gw-bus: the durable event bus adapter capability interface, plus a NATS
//! JetStream implementation and an in-process implementation used by tests
//! and single-node deployments.

mod error;
mod in_memory;
mod nats;
mod trait_def;

pub use error::BusError;
pub use in_memory::InMemoryBus;
pub use nats::{connect_with_backoff, NatsBus};
pub use trait_def::{Bus, BusMessage, BusSubscription, WorkMessage, WorkSubscription};
