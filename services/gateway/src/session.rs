//! The session's volatile state: lifecycle, replay buffer, peer set. Mirrors
//! the shape `spec.md` assigns per session, grounded in the teacher's
//! bounded-`VecDeque` usage (`announcer.rs`'s `AnnouncerRuntime`) for the
//! replay ring and its per-connection ownership model for the rest.

use std::collections::{HashSet, VecDeque};
use std::time::Instant;

use gw_protocol::Frame;
use tokio::sync::{mpsc, Mutex, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Accepted,
    Identifying,
    Live,
    Resuming,
    Closing,
    Closed,
}

impl SessionState {
    /// Lowercase label used in the metrics endpoint's `state="..."` tag.
    pub fn as_label(&self) -> &'static str {
        match self {
            SessionState::Accepted => "accepted",
            SessionState::Identifying => "identifying",
            SessionState::Live => "live",
            SessionState::Resuming => "resuming",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReplayFrame {
    pub seq: u64,
    pub event_type: String,
    pub data: serde_json::Value,
}

/// Bounded ring of the last `cap` frames sent, used to honor RESUME.
#[derive(Debug)]
pub struct ReplayBuffer {
    frames: VecDeque<ReplayFrame>,
    cap: usize,
}

impl ReplayBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            frames: VecDeque::with_capacity(cap),
            cap,
        }
    }

    pub fn push(&mut self, frame: ReplayFrame) {
        if self.frames.len() >= self.cap {
            self.frames.pop_front();
        }
        self.frames.push_back(frame);
    }

    pub fn oldest_seq(&self) -> Option<u64> {
        self.frames.front().map(|f| f.seq)
    }

    /// Frames with `seq > after`, in order. Empty if `after` is at or beyond
    /// the buffer's tail.
    pub fn frames_after(&self, after: u64) -> Vec<ReplayFrame> {
        self.frames
            .iter()
            .filter(|f| f.seq > after)
            .cloned()
            .collect()
    }
}

/// Snapshot of resolver-relevant session fields, cloned out from behind the
/// session mutex before any store lookup runs -- the resolver never holds a
/// session lock while it may suspend.
#[derive(Debug, Clone)]
pub struct ResolverView {
    pub state: SessionState,
    pub user_id: Option<String>,
    pub guilds: HashSet<String>,
    pub dm_channels: HashSet<String>,
    pub subscriptions: HashSet<String>,
    pub peers: HashSet<String>,
}

/// Fields mutated over a session's lifetime, guarded by one mutex per
/// session. The dispatcher acquires this only to advance `last_seq`, append
/// to the replay buffer, and read the resolver snapshot above.
pub struct SessionInner {
    pub state: SessionState,
    pub user_id: Option<String>,
    pub guilds: HashSet<String>,
    pub dm_channels: HashSet<String>,
    pub subscriptions: HashSet<String>,
    pub peers: HashSet<String>,
    pub last_seq: u64,
    pub replay_buffer: ReplayBuffer,
    pub session_token: String,
    pub last_heartbeat: Instant,
    pub drop_count: u32,
}

pub struct Session {
    pub id: String,
    pub connected_since: Instant,
    /// Rebindable: a successful RESUME hands the session a fresh channel
    /// pair, since the prior connection's receiver fiber has already exited.
    send_tx: RwLock<mpsc::Sender<Frame>>,
    inner: Mutex<SessionInner>,
}

impl Session {
    pub fn new(
        id: String,
        session_token: String,
        replay_buffer_len: usize,
        send_queue_capacity: usize,
    ) -> (Self, mpsc::Receiver<Frame>) {
        let (send_tx, send_rx) = mpsc::channel(send_queue_capacity);
        let session = Self {
            id,
            connected_since: Instant::now(),
            send_tx: RwLock::new(send_tx),
            inner: Mutex::new(SessionInner {
                state: SessionState::Accepted,
                user_id: None,
                guilds: HashSet::new(),
                dm_channels: HashSet::new(),
                subscriptions: HashSet::new(),
                peers: HashSet::new(),
                last_seq: 0,
                replay_buffer: ReplayBuffer::new(replay_buffer_len),
                session_token,
                last_heartbeat: Instant::now(),
                drop_count: 0,
            }),
        };
        (session, send_rx)
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    pub async fn set_state(&self, state: SessionState) {
        self.inner.lock().await.state = state;
    }

    pub async fn touch_heartbeat(&self) {
        self.inner.lock().await.last_heartbeat = Instant::now();
    }

    pub async fn last_heartbeat(&self) -> Instant {
        self.inner.lock().await.last_heartbeat
    }

    pub async fn session_token(&self) -> String {
        self.inner.lock().await.session_token.clone()
    }

    pub async fn user_id(&self) -> Option<String> {
        self.inner.lock().await.user_id.clone()
    }

    pub async fn resolver_view(&self) -> ResolverView {
        let inner = self.inner.lock().await;
        ResolverView {
            state: inner.state,
            user_id: inner.user_id.clone(),
            guilds: inner.guilds.clone(),
            dm_channels: inner.dm_channels.clone(),
            subscriptions: inner.subscriptions.clone(),
            peers: inner.peers.clone(),
        }
    }

    /// Populates identity after a successful IDENTIFY and transitions to
    /// LIVE. Does not touch `send_queue` or registries -- that's the Session
    /// Manager's job.
    pub async fn identify(
        &self,
        user_id: String,
        guilds: HashSet<String>,
        dm_channels: HashSet<String>,
        peers: HashSet<String>,
    ) {
        let mut inner = self.inner.lock().await;
        inner.user_id = Some(user_id);
        inner.guilds = guilds;
        inner.dm_channels = dm_channels;
        inner.peers = peers;
        inner.state = SessionState::Live;
    }

    pub async fn set_subscriptions(&self, channel_ids: HashSet<String>) {
        self.inner.lock().await.subscriptions = channel_ids;
    }

    pub async fn add_guild(&self, guild_id: &str) {
        self.inner.lock().await.guilds.insert(guild_id.to_owned());
    }

    pub async fn remove_guild(&self, guild_id: &str) {
        self.inner.lock().await.guilds.remove(guild_id);
    }

    pub async fn add_peer(&self, user_id: &str) {
        self.inner.lock().await.peers.insert(user_id.to_owned());
    }

    pub async fn remove_peer(&self, user_id: &str) {
        self.inner.lock().await.peers.remove(user_id);
    }

    /// Resume bookkeeping: returns the replay set, or an error carrying the
    /// buffer's oldest covered seq if `client_last_seq` predates it (P4).
    pub async fn resume_frames(&self, client_last_seq: u64) -> Result<Vec<ReplayFrame>, u64> {
        let mut inner = self.inner.lock().await;
        match inner.replay_buffer.oldest_seq() {
            Some(oldest) if client_last_seq < oldest => Err(oldest),
            _ => {
                inner.state = SessionState::Live;
                Ok(inner.replay_buffer.frames_after(client_last_seq))
            }
        }
    }

    /// Assigns the next `seq`, appends to the replay buffer, and enqueues a
    /// DISPATCH frame. Returns `false` (without blocking) if the send queue
    /// was full -- the caller counts this as a drop per the slow-consumer
    /// policy, never awaiting the write.
    pub async fn deliver(&self, event_type: &str, data: &serde_json::Value) -> bool {
        let frame = {
            let mut inner = self.inner.lock().await;
            inner.last_seq += 1;
            let seq = inner.last_seq;
            inner.replay_buffer.push(ReplayFrame {
                seq,
                event_type: event_type.to_owned(),
                data: data.clone(),
            });
            Frame::dispatch(event_type, seq, data.clone())
        };
        if self.try_send(frame).await {
            true
        } else {
            self.inner.lock().await.drop_count += 1;
            false
        }
    }

    pub async fn drop_count(&self) -> u32 {
        self.inner.lock().await.drop_count
    }

    pub async fn reset_drop_count(&self) {
        self.inner.lock().await.drop_count = 0;
    }

    pub async fn last_seq(&self) -> u64 {
        self.inner.lock().await.last_seq
    }

    /// Non-blocking enqueue onto the current send queue. Used by the
    /// dispatcher's reconnect-on-slow-consumer path, which doesn't go
    /// through `deliver`'s seq/replay-buffer bookkeeping.
    pub async fn try_send(&self, frame: Frame) -> bool {
        self.send_tx.read().await.try_send(frame).is_ok()
    }

    /// Installs a fresh bounded channel for a resumed connection and returns
    /// the new receiver half for that connection's fiber to read from.
    pub async fn rebind_send_queue(&self, capacity: usize) -> mpsc::Receiver<Frame> {
        let (tx, rx) = mpsc::channel(capacity);
        *self.send_tx.write().await = tx;
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_session() -> (Session, mpsc::Receiver<Frame>) {
        Session::new("s1".to_owned(), "tok".to_owned(), 4, 8)
    }

    #[tokio::test]
    async fn deliver_assigns_strictly_increasing_seq_and_enqueues() {
        let (session, mut rx) = make_session();
        assert!(session.deliver("A", &json!({})).await);
        assert!(session.deliver("B", &json!({})).await);

        let f1 = rx.recv().await.unwrap();
        let f2 = rx.recv().await.unwrap();
        assert_eq!(f1.s, Some(1));
        assert_eq!(f2.s, Some(2));
    }

    #[tokio::test]
    async fn replay_buffer_evicts_beyond_capacity() {
        let (session, _rx) = make_session();
        for i in 0..10 {
            session.deliver(&format!("E{i}"), &json!({})).await;
        }
        // cap is 4: resuming from seq=0 should only see the last 4 frames.
        let frames = session.resume_frames(0).await.unwrap_err();
        assert_eq!(frames, 7); // oldest retained seq after 10 pushes into a 4-cap ring
    }

    #[tokio::test]
    async fn resume_within_window_replays_exact_tail() {
        let (session, mut rx) = make_session();
        for i in 1..=4 {
            session.deliver(&format!("E{i}"), &json!({i: i})).await;
            rx.recv().await;
        }
        let replayed = session.resume_frames(2).await.unwrap();
        assert_eq!(replayed.iter().map(|f| f.seq).collect::<Vec<_>>(), vec![3, 4]);
    }

    #[tokio::test]
    async fn deliver_counts_drops_without_blocking_when_queue_is_full() {
        let (session, _rx) = Session::new("s2".to_owned(), "tok".to_owned(), 250, 1);
        assert!(session.deliver("A", &json!({})).await);
        assert!(!session.deliver("B", &json!({})).await);
        assert_eq!(session.drop_count().await, 1);
    }
}
