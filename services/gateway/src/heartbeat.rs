//! Pure heartbeat-timeout decision, applied by each session's reader loop on
//! its own tick -- there is no separate sweeper fiber; the per-connection
//! `tokio::select!` loop (grounded in `ws_forwarder.rs`'s heartbeat-interval
//! arm) is both simpler and matches the teacher's one-fiber-per-connection
//! model.

use std::time::{Duration, Instant};

use gw_protocol::close_code;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatStatus {
    Alive,
    /// Missed the H+slack deadline: close resumable, client reconnects.
    ResumableTimeout,
    /// Missed the 2*H hard deadline: close non-resumable.
    NonResumableTimeout,
}

impl HeartbeatStatus {
    pub fn close_code(self) -> Option<u16> {
        match self {
            HeartbeatStatus::Alive => None,
            HeartbeatStatus::ResumableTimeout => Some(close_code::SESSION_TIMEOUT),
            HeartbeatStatus::NonResumableTimeout => Some(close_code::HEARTBEAT_FAILED),
        }
    }
}

/// `interval` is H as advertised in HELLO. Slack is 1.5*H; the hard bound is
/// 2*H (P10).
pub fn check(last_heartbeat: Instant, now: Instant, interval: Duration) -> HeartbeatStatus {
    let elapsed = now.saturating_duration_since(last_heartbeat);
    if elapsed >= interval * 2 {
        HeartbeatStatus::NonResumableTimeout
    } else if elapsed >= interval + interval / 2 {
        HeartbeatStatus::ResumableTimeout
    } else {
        HeartbeatStatus::Alive
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn within_slack_window_is_alive() {
        let now = Instant::now();
        let last = now - Duration::from_secs(10);
        assert_eq!(check(last, now, Duration::from_secs(41)), HeartbeatStatus::Alive);
    }

    #[test]
    fn past_h_plus_slack_but_under_2h_is_resumable() {
        let now = Instant::now();
        let last = now - Duration::from_secs(65);
        assert_eq!(
            check(last, now, Duration::from_secs(41)),
            HeartbeatStatus::ResumableTimeout
        );
    }

    #[test]
    fn past_2h_is_non_resumable() {
        let now = Instant::now();
        let last = now - Duration::from_secs(83);
        assert_eq!(
            check(last, now, Duration::from_secs(41)),
            HeartbeatStatus::NonResumableTimeout
        );
    }

    #[test]
    fn close_code_mapping_matches_contract_resumability() {
        assert_eq!(
            HeartbeatStatus::ResumableTimeout.close_code(),
            Some(close_code::SESSION_TIMEOUT)
        );
        assert!(close_code::is_resumable(
            HeartbeatStatus::ResumableTimeout.close_code().unwrap()
        ));
        assert_eq!(
            HeartbeatStatus::NonResumableTimeout.close_code(),
            Some(close_code::HEARTBEAT_FAILED)
        );
        assert!(!close_code::is_resumable(
            HeartbeatStatus::NonResumableTimeout.close_code().unwrap()
        ));
    }
}
