use std::sync::Arc;

use gateway::config::{BusBackend, Config};
use gateway::repo::PgMembershipRepo;
use gateway::resolver::Resolver;
use gateway::session::SessionState;
use gateway::{db, dispatcher, AppState};
use gw_bus::{Bus, InMemoryBus};
use gw_protocol::{op, Frame};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let config = Config::from_env();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log_level.clone()))
        .init();

    info!("connecting to database...");
    let pool = db::create_pool(&config.database_url).await;
    db::run_migrations(&pool).await;
    info!("migrations applied");

    let bus: Arc<dyn Bus> = match config.bus_backend {
        BusBackend::Nats => {
            let url = config
                .nats_url
                .clone()
                .expect("NATS_URL must be set when GATEWAY_BUS_BACKEND=nats");
            let nats = gw_bus::connect_with_backoff(&url, &config.namespace)
                .await
                .expect("failed to connect to NATS");
            nats.ensure_streams().await.expect("failed to ensure JetStream streams");
            Arc::new(nats) as Arc<dyn Bus>
        }
        BusBackend::InMemory => Arc::new(InMemoryBus::new()),
    };

    let repo = Arc::new(PgMembershipRepo::new(pool.clone()));
    let resolver = Arc::new(Resolver::new(repo, false));
    let state = AppState::new(config.clone(), bus.clone(), resolver, pool);

    let pattern = format!("{}.>", config.namespace);
    tokio::spawn(dispatcher::run(Arc::new(state.clone()), pattern));

    let router = gateway::build_router(state.clone());
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("failed to bind");
    info!(addr = %config.bind_addr, "gateway listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(state))
        .await
        .expect("server error");
    info!("gateway shut down gracefully");
}

/// Waits for SIGTERM/Ctrl-C, nudges every LIVE session to reconnect, then
/// gives them `shutdown_drain` to do so before axum stops accepting new
/// connections and this future returns.
async fn shutdown_signal(state: AppState) {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }

    let registry = state.sessions.read().await;
    for session in registry.values() {
        if session.state().await == SessionState::Live {
            let _ = session.try_send(Frame::new(op::RECONNECT)).await;
        }
    }
    drop(registry);

    tokio::time::sleep(state.config.shutdown_drain).await;
}
