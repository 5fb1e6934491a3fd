use std::sync::atomic::Ordering;

use axum::extract::State;
use axum::response::IntoResponse;

use crate::state::AppState;

/// Plain-text Prometheus exposition, grounded in the teacher's
/// `http::metrics::get_metrics` stream-counter dump, generalized from
/// per-stream read counters to this gateway's dispatch/resume/drop counters.
pub async fn get_metrics(State(state): State<AppState>) -> impl IntoResponse {
    let mut out = String::new();

    out.push_str("# HELP amityvox_gateway_live_sessions Currently connected sessions.\n");
    out.push_str("# TYPE amityvox_gateway_live_sessions gauge\n");
    out.push_str(&format!(
        "amityvox_gateway_live_sessions {}\n",
        state.live_session_count().await
    ));

    out.push_str("# HELP amityvox_gateway_sessions Connected sessions by lifecycle state.\n");
    out.push_str("# TYPE amityvox_gateway_sessions gauge\n");
    for (session_state, count) in state.session_counts_by_state().await {
        out.push_str(&format!(
            "amityvox_gateway_sessions{{state=\"{}\"}} {count}\n",
            session_state.as_label()
        ));
    }

    out.push_str("# HELP amityvox_gateway_dispatch_total Events dispatched per subject category.\n");
    out.push_str("# TYPE amityvox_gateway_dispatch_total counter\n");
    for (category, count) in state.metrics.dispatch_counts.lock().unwrap().iter() {
        out.push_str(&format!(
            "amityvox_gateway_dispatch_total{{category=\"{category}\"}} {count}\n"
        ));
    }

    out.push_str("# HELP amityvox_gateway_drop_total Frames dropped to a slow consumer.\n");
    out.push_str("# TYPE amityvox_gateway_drop_total counter\n");
    out.push_str(&format!(
        "amityvox_gateway_drop_total {}\n",
        state.metrics.drop_count.load(Ordering::Relaxed)
    ));

    out.push_str("# HELP amityvox_gateway_resume_success_total Successful RESUME handshakes.\n");
    out.push_str("# TYPE amityvox_gateway_resume_success_total counter\n");
    out.push_str(&format!(
        "amityvox_gateway_resume_success_total {}\n",
        state.metrics.resume_successes.load(Ordering::Relaxed)
    ));

    out.push_str("# HELP amityvox_gateway_resume_failure_total RESUME handshakes rejected as out-of-window.\n");
    out.push_str("# TYPE amityvox_gateway_resume_failure_total counter\n");
    out.push_str(&format!(
        "amityvox_gateway_resume_failure_total {}\n",
        state.metrics.resume_failures.load(Ordering::Relaxed)
    ));

    out.push_str("# HELP amityvox_gateway_replay_invocations_total RESUME handshakes that attempted a replay.\n");
    out.push_str("# TYPE amityvox_gateway_replay_invocations_total counter\n");
    out.push_str(&format!(
        "amityvox_gateway_replay_invocations_total {}\n",
        state.metrics.replay_invocations.load(Ordering::Relaxed)
    ));

    out.push_str("# HELP amityvox_gateway_bus_subscribe_restarts_total Bus subscription restarts.\n");
    out.push_str("# TYPE amityvox_gateway_bus_subscribe_restarts_total counter\n");
    out.push_str(&format!(
        "amityvox_gateway_bus_subscribe_restarts_total {}\n",
        state.metrics.bus_subscribe_restarts.load(Ordering::Relaxed)
    ));

    out
}
