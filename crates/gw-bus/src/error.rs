use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("failed to publish to subject {subject}: {source}")]
    Publish {
        subject: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("failed to subscribe to pattern {pattern}: {source}")]
    Subscribe {
        pattern: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("failed to ensure durable streams: {source}")]
    EnsureStreams {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("bus connection unavailable")]
    Disconnected,
    #[error("envelope serialization failed: {0}")]
    Codec(#[from] serde_json::Error),
}
