use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct AdminSessionView {
    pub session_id: String,
    pub user_id: Option<String>,
    pub state: String,
    pub last_seq: u64,
    pub connected_secs: u64,
}

/// Lists every session currently held in the registry, grounded in the
/// teacher's `http::admin::list_tokens` shape (a flat JSON array, no
/// pagination -- acceptable at this registry's expected scale).
pub async fn list_sessions(State(state): State<AppState>) -> Json<Vec<AdminSessionView>> {
    let registry = state.sessions.read().await;
    let mut views = Vec::with_capacity(registry.len());
    for session in registry.values() {
        views.push(AdminSessionView {
            session_id: session.id.clone(),
            user_id: session.user_id().await,
            state: format!("{:?}", session.state().await),
            last_seq: session.last_seq().await,
            connected_secs: session.connected_since.elapsed().as_secs(),
        });
    }
    Json(views)
}
