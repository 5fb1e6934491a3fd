//! Events pushed to the admin dashboard SSE stream, mirroring the teacher's
//! `dashboard_events::DashboardEvent` shape and serde tagging.

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AdminEvent {
    SessionConnected { session_id: String },
    SessionIdentified { session_id: String, user_id: String },
    SessionClosed { session_id: String, code: u16, resumable: bool },
    SessionExpired { session_id: String },
    DispatchCount { category: String, delivered: u64 },
    LogEntry { entry: String },
}
