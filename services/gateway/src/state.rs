use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use gw_bus::Bus;
use sqlx::PgPool;
use tokio::sync::{broadcast, RwLock};

use crate::admin_events::AdminEvent;
use crate::config::Config;
use crate::resolver::Resolver;
use crate::session::Session;

/// `sessions: map<session_id, session>` and the secondary
/// `user_sessions: map<user_id, set<session_id>>` index, each behind its own
/// read-write lock, never held across I/O -- grounded in the teacher's
/// `BroadcastRegistry`/`ReceiverSessionRegistry` pattern
/// (`services/server/src/state.rs`), generalized from "one registry per
/// concern" to the session + user-index registries this gateway needs.
pub type SessionRegistry = Arc<RwLock<HashMap<String, Arc<Session>>>>;
pub type UserSessionIndex = Arc<RwLock<HashMap<String, std::collections::HashSet<String>>>>;
pub type TokenSessionIndex = Arc<RwLock<HashMap<String, String>>>;

#[derive(Default)]
pub struct Metrics {
    pub dispatch_counts: std::sync::Mutex<HashMap<String, u64>>,
    pub drop_count: AtomicU64,
    pub replay_invocations: AtomicU64,
    pub resume_successes: AtomicU64,
    pub resume_failures: AtomicU64,
    pub bus_subscribe_restarts: AtomicU64,
}

impl Metrics {
    pub fn record_dispatch(&self, category: &str) {
        let mut counts = self.dispatch_counts.lock().unwrap();
        *counts.entry(category.to_owned()).or_insert(0) += 1;
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub bus: Arc<dyn Bus>,
    pub resolver: Arc<Resolver>,
    pub db: PgPool,
    pub sessions: SessionRegistry,
    pub user_sessions: UserSessionIndex,
    pub token_sessions: TokenSessionIndex,
    pub metrics: Arc<Metrics>,
    pub admin_tx: broadcast::Sender<AdminEvent>,
    pub logger: Arc<gw_ops_log::UiLogger<AdminEvent>>,
    pub ready: Arc<std::sync::atomic::AtomicBool>,
}

impl AppState {
    pub fn new(config: Config, bus: Arc<dyn Bus>, resolver: Arc<Resolver>, db: PgPool) -> Self {
        let (admin_tx, _) = broadcast::channel(4096);
        let logger = Arc::new(gw_ops_log::UiLogger::with_buffer(
            admin_tx.clone(),
            |entry| AdminEvent::LogEntry { entry },
            500,
        ));
        Self {
            config: Arc::new(config),
            bus,
            resolver,
            db,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            user_sessions: Arc::new(RwLock::new(HashMap::new())),
            token_sessions: Arc::new(RwLock::new(HashMap::new())),
            metrics: Arc::new(Metrics::default()),
            admin_tx,
            logger,
            ready: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    pub async fn insert_session(&self, session: Arc<Session>) {
        let id = session.id.clone();
        let token = session.session_token().await;
        self.token_sessions.write().await.insert(token, id.clone());
        self.sessions.write().await.insert(id, session);
    }

    pub async fn session_by_token(&self, token: &str) -> Option<Arc<Session>> {
        let id = self.token_sessions.read().await.get(token).cloned()?;
        self.get_session(&id).await
    }

    /// Invariant: a session appears in the user index iff `state == LIVE`
    /// and `user_id != ""`.
    pub async fn index_user_session(&self, user_id: &str, session_id: &str) {
        self.user_sessions
            .write()
            .await
            .entry(user_id.to_owned())
            .or_default()
            .insert(session_id.to_owned());
    }

    pub async fn unindex_user_session(&self, user_id: &str, session_id: &str) {
        let mut index = self.user_sessions.write().await;
        if let Some(set) = index.get_mut(user_id) {
            set.remove(session_id);
            if set.is_empty() {
                index.remove(user_id);
            }
        }
    }

    pub async fn remove_session(&self, session_id: &str) -> Option<Arc<Session>> {
        let removed = self.sessions.write().await.remove(session_id);
        if let Some(session) = &removed {
            let token = session.session_token().await;
            self.token_sessions.write().await.remove(&token);
        }
        removed
    }

    pub async fn get_session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub async fn sessions_for_user(&self, user_id: &str) -> Vec<Arc<Session>> {
        let ids = self
            .user_sessions
            .read()
            .await
            .get(user_id)
            .cloned()
            .unwrap_or_default();
        let registry = self.sessions.read().await;
        ids.iter().filter_map(|id| registry.get(id).cloned()).collect()
    }

    pub async fn live_session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Session count broken down by lifecycle state, for the per-state
    /// gauges the metrics endpoint exports. Always includes every
    /// `SessionState` variant, even at zero, so a dashboard panel doesn't
    /// have to special-case a missing series.
    pub async fn session_counts_by_state(&self) -> HashMap<crate::session::SessionState, usize> {
        use crate::session::SessionState;
        let mut counts = HashMap::new();
        for state in [
            SessionState::Accepted,
            SessionState::Identifying,
            SessionState::Live,
            SessionState::Resuming,
            SessionState::Closing,
            SessionState::Closed,
        ] {
            counts.insert(state, 0);
        }
        for session in self.sessions.read().await.values() {
            *counts.entry(session.state().await).or_insert(0) += 1;
        }
        counts
    }

    pub fn publish_admin_event(&self, event: AdminEvent) {
        let _ = self.admin_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::membership::fake::FakeMembershipRepo;
    use crate::session::SessionState;
    use gw_bus::InMemoryBus;

    fn make_state() -> AppState {
        let bus: Arc<dyn Bus> = Arc::new(InMemoryBus::new());
        let resolver = Arc::new(Resolver::new(Arc::new(FakeMembershipRepo::default()), false));
        AppState::new(test_config(), bus, resolver, test_db_pool())
    }

    fn test_config() -> Config {
        std::env::set_var("DATABASE_URL", "postgres://unused/unused");
        std::env::set_var("SESSION_ALLOWED_ORIGINS", "https://example.test");
        Config::from_env()
    }

    /// A lazily-connecting pool never touches the network; safe to construct
    /// in unit tests that never exercise `PgMembershipRepo`/`validate_account_token`.
    fn test_db_pool() -> PgPool {
        PgPool::connect_lazy("postgres://unused/unused").expect("lazy pool never connects eagerly")
    }

    #[tokio::test]
    async fn user_session_index_tracks_insert_and_removal() {
        let state = make_state();
        let (session, _rx) = Session::new("s1".to_owned(), "tok".to_owned(), 16, 16);
        let session = Arc::new(session);
        session.set_state(SessionState::Live).await;
        state.insert_session(session.clone()).await;
        state.index_user_session("u1", "s1").await;

        let found = state.sessions_for_user("u1").await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "s1");

        state.unindex_user_session("u1", "s1").await;
        assert!(state.sessions_for_user("u1").await.is_empty());
    }

    #[tokio::test]
    async fn remove_session_drops_it_from_the_primary_registry() {
        let state = make_state();
        let (session, _rx) = Session::new("s2".to_owned(), "tok".to_owned(), 16, 16);
        state.insert_session(Arc::new(session)).await;
        assert!(state.get_session("s2").await.is_some());
        state.remove_session("s2").await;
        assert!(state.get_session("s2").await.is_none());
    }
}
