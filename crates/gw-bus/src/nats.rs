//! NATS JetStream-backed bus adapter.
//!
//! Two retention classes: a `Limits`-retention stream
//! carrying every client-facing category (time-bounded, best-effort) and a
//! `WorkQueue`-retention stream carrying only `<ns>.federation.retry`
//! (durable, redelivered on nack). Grounded in the JetStream stream/subject
//! layout shown in the pack's `cim-keys` NATS module (a `Limits` events
//! stream alongside a `WorkQueue` commands stream) and the reconnect +
//! `tokio::select!` subscribe loop shown in the pack's `coop` NATS relay
//! subscriber.

use crate::error::BusError;
use crate::trait_def::{Bus, BusMessage, BusSubscription, WorkMessage, WorkSubscription};
use async_nats::jetstream::{self, consumer::pull, stream::RetentionPolicy};
use async_trait::async_trait;
use futures_util::StreamExt;
use gw_protocol::{Envelope, Subject};
use std::time::Duration;
use tracing::{error, warn};

const LIVE_STREAM: &str = "GATEWAY_LIVE";
const FEDERATION_STREAM: &str = "GATEWAY_FEDERATION";
const LIVE_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);
const FEDERATION_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Client-facing categories carried on the live-class stream. Kept disjoint
/// from the federation-retry subject so the two streams never claim
/// overlapping subject space.
const LIVE_CATEGORIES: &[&str] = &[
    "message", "channel", "guild", "user", "presence", "voice", "poll", "automod", "announcement",
];

pub struct NatsBus {
    namespace: String,
    client: async_nats::Client,
    jetstream: jetstream::Context,
}

impl NatsBus {
    pub async fn connect(url: &str, namespace: &str) -> Result<Self, BusError> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| BusError::EnsureStreams { source: Box::new(e) })?;
        let jetstream = jetstream::new(client.clone());
        Ok(Self {
            namespace: namespace.to_owned(),
            client,
            jetstream,
        })
    }

    fn live_subjects(&self) -> Vec<String> {
        LIVE_CATEGORIES
            .iter()
            .map(|category| format!("{}.{category}.>", self.namespace))
            .collect()
    }

    fn federation_subject(&self) -> String {
        format!("{}.federation.retry", self.namespace)
    }
}

#[async_trait]
impl Bus for NatsBus {
    async fn publish(&self, subject: &Subject, envelope: &Envelope) -> Result<(), BusError> {
        let payload = serde_json::to_vec(envelope)?;
        self.jetstream
            .publish(subject.as_str().to_owned(), payload.into())
            .await
            .map_err(|e| BusError::Publish {
                subject: subject.as_str().to_owned(),
                source: Box::new(e),
            })?;
        Ok(())
    }

    async fn ensure_streams(&self) -> Result<(), BusError> {
        self.jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: LIVE_STREAM.to_owned(),
                subjects: self.live_subjects(),
                retention: RetentionPolicy::Limits,
                max_age: LIVE_MAX_AGE,
                ..Default::default()
            })
            .await
            .map_err(|e| BusError::EnsureStreams { source: Box::new(e) })?;

        self.jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: FEDERATION_STREAM.to_owned(),
                subjects: vec![self.federation_subject()],
                retention: RetentionPolicy::WorkQueue,
                max_age: FEDERATION_MAX_AGE,
                ..Default::default()
            })
            .await
            .map_err(|e| BusError::EnsureStreams { source: Box::new(e) })?;

        Ok(())
    }

    async fn subscribe_wildcard(
        &self,
        pattern: &str,
    ) -> Result<Box<dyn BusSubscription>, BusError> {
        let sub = self
            .client
            .subscribe(pattern.to_owned())
            .await
            .map_err(|e| BusError::Subscribe {
                pattern: pattern.to_owned(),
                source: Box::new(e),
            })?;
        Ok(Box::new(NatsSubscription { inner: sub }))
    }

    async fn work_subscribe(
        &self,
        subject: &str,
        queue_group: &str,
    ) -> Result<Box<dyn WorkSubscription>, BusError> {
        let stream = self
            .jetstream
            .get_stream(FEDERATION_STREAM)
            .await
            .map_err(|e| BusError::Subscribe {
                pattern: subject.to_owned(),
                source: Box::new(e),
            })?;
        let consumer = stream
            .get_or_create_consumer(
                queue_group,
                pull::Config {
                    durable_name: Some(queue_group.to_owned()),
                    filter_subject: subject.to_owned(),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| BusError::Subscribe {
                pattern: subject.to_owned(),
                source: Box::new(e),
            })?;
        let messages = consumer
            .messages()
            .await
            .map_err(|e| BusError::Subscribe {
                pattern: subject.to_owned(),
                source: Box::new(e),
            })?;
        Ok(Box::new(NatsWorkSubscription { inner: messages }))
    }
}

struct NatsSubscription {
    inner: async_nats::Subscriber,
}

#[async_trait]
impl BusSubscription for NatsSubscription {
    async fn next(&mut self) -> Option<BusMessage> {
        loop {
            let msg = self.inner.next().await?;
            let subject = match Subject::parse(msg.subject.as_str()) {
                Ok(s) => s,
                Err(e) => {
                    warn!(subject = %msg.subject, error = %e, "dropping message with malformed subject");
                    continue;
                }
            };
            let envelope: Envelope = match serde_json::from_slice(&msg.payload) {
                Ok(e) => e,
                Err(e) => {
                    warn!(subject = %subject, error = %e, "dropping message with malformed envelope");
                    continue;
                }
            };
            return Some(BusMessage { subject, envelope });
        }
    }
}

struct NatsWorkSubscription {
    inner: pull::Stream,
}

#[async_trait]
impl WorkSubscription for NatsWorkSubscription {
    async fn next(&mut self) -> Option<WorkMessage> {
        loop {
            let msg = match self.inner.next().await? {
                Ok(msg) => msg,
                Err(e) => {
                    error!(error = %e, "federation consumer stream error");
                    return None;
                }
            };
            let subject = match Subject::parse(msg.subject.as_str()) {
                Ok(s) => s,
                Err(_) => {
                    let _ = msg.ack().await;
                    continue;
                }
            };
            let envelope: Envelope = match serde_json::from_slice(&msg.payload) {
                Ok(e) => e,
                Err(_) => {
                    let _ = msg.ack().await;
                    continue;
                }
            };
            let _ = msg.ack().await;
            return Some(WorkMessage { subject, envelope });
        }
    }
}

/// Reconnect-with-backoff wrapper around `NatsBus::connect`, grounded in the
/// `backoff` dependency already present in the pack (`discorsd`'s
/// `Cargo.toml`) and the reconnect-loop shape in the pack's `coop` NATS
/// relay subscriber. Sessions stay open during a
/// transient bus outage; only a warning is logged.
pub async fn connect_with_backoff(url: &str, namespace: &str) -> Result<NatsBus, BusError> {
    let operation = || async {
        NatsBus::connect(url, namespace)
            .await
            .map_err(backoff::Error::transient)
    };
    backoff::future::retry(backoff::ExponentialBackoff::default(), operation)
        .await
        .map_err(|e| {
            error!(url = %url, error = %e, "exhausted retries connecting to bus");
            e
        })
}
