use std::env;
use std::time::Duration;

/// Environment-variable configuration loaded once at startup, mirroring the
/// teacher's flat `env::var` loading in `main.rs`, extended with the
/// gateway-specific knobs the distilled spec calls out (bus endpoint,
/// heartbeat interval, origin allowlist).
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: String,
    pub log_level: String,
    pub namespace: String,
    pub bus_backend: BusBackend,
    pub nats_url: Option<String>,
    pub heartbeat_interval: Duration,
    pub identify_deadline: Duration,
    pub allowed_origins: Vec<String>,
    pub shutdown_drain: Duration,
    /// How long a resumably-closed session's record survives in the
    /// registry awaiting a RESUME before it is evicted for good (P3/P4).
    pub resume_grace: Duration,
    pub replay_buffer_len: usize,
    pub send_queue_capacity: usize,
    pub slow_consumer_drop_threshold: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BusBackend {
    Nats,
    InMemory,
}

impl Config {
    pub fn from_env() -> Self {
        let bus_backend = match env::var("GATEWAY_BUS_BACKEND").as_deref() {
            Ok("nats") => BusBackend::Nats,
            _ => BusBackend::InMemory,
        };
        let allowed_origins = env::var("SESSION_ALLOWED_ORIGINS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToOwned::to_owned)
            .collect::<Vec<_>>();

        if bus_backend == BusBackend::Nats && allowed_origins.is_empty() {
            // Design Note C: a non-dev profile must never accept an empty
            // allowlist. InMemory/dev deployments are permitted to run
            // without one (e.g. local smoke tests).
            panic!("SESSION_ALLOWED_ORIGINS must be set to a non-empty list in production");
        }

        Self {
            database_url: env::var("DATABASE_URL").expect("DATABASE_URL must be set"),
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_owned()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned()),
            namespace: env::var("GATEWAY_NAMESPACE").unwrap_or_else(|_| "amityvox".to_owned()),
            bus_backend,
            nats_url: env::var("NATS_URL").ok(),
            heartbeat_interval: Duration::from_millis(
                env::var("HEARTBEAT_INTERVAL_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(41_000),
            ),
            identify_deadline: Duration::from_secs(10),
            allowed_origins,
            shutdown_drain: Duration::from_secs(10),
            resume_grace: Duration::from_secs(
                env::var("RESUME_GRACE_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(60),
            ),
            replay_buffer_len: env::var("REPLAY_BUFFER_LEN")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(250),
            send_queue_capacity: env::var("SEND_QUEUE_CAPACITY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(256),
            slow_consumer_drop_threshold: env::var("SLOW_CONSUMER_DROP_THRESHOLD")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(32),
        }
    }
}
