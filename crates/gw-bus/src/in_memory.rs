//! Single-process bus adapter built on `tokio::sync::broadcast`, grounded in
//! the teacher's `AppState::get_or_create_broadcast` per-key broadcast
//! registry (`services/server/src/state.rs`), generalized here to a single
//! process-wide channel since subject patterns -- not fixed keys -- decide
//! delivery. Used by `gw-test-utils` and by single-node deployments.

use crate::error::BusError;
use crate::trait_def::{Bus, BusMessage, BusSubscription, WorkMessage, WorkSubscription};
use async_trait::async_trait;
use gw_protocol::{Envelope, Subject};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};

const LIVE_CAPACITY: usize = 4096;

#[derive(Default)]
struct WorkQueue {
    members: Vec<mpsc::Sender<WorkMessage>>,
    next: AtomicUsize,
}

pub struct InMemoryBus {
    live_tx: broadcast::Sender<BusMessage>,
    work_queues: Mutex<std::collections::HashMap<String, Arc<WorkQueue>>>,
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBus {
    pub fn new() -> Self {
        let (live_tx, _rx) = broadcast::channel(LIVE_CAPACITY);
        Self {
            live_tx,
            work_queues: Mutex::new(std::collections::HashMap::new()),
        }
    }
}

fn matches_pattern(pattern: &str, subject: &str) -> bool {
    let pattern_segments: Vec<&str> = pattern.split('.').collect();
    let subject_segments: Vec<&str> = subject.split('.').collect();
    let mut pi = 0;
    let mut si = 0;
    while pi < pattern_segments.len() {
        match pattern_segments[pi] {
            ">" => return true,
            "*" => {
                if si >= subject_segments.len() {
                    return false;
                }
            }
            seg => {
                if si >= subject_segments.len() || subject_segments[si] != seg {
                    return false;
                }
            }
        }
        pi += 1;
        si += 1;
    }
    si == subject_segments.len()
}

struct InMemorySubscription {
    pattern: String,
    rx: broadcast::Receiver<BusMessage>,
}

#[async_trait]
impl BusSubscription for InMemorySubscription {
    async fn next(&mut self) -> Option<BusMessage> {
        loop {
            match self.rx.recv().await {
                Ok(msg) if matches_pattern(&self.pattern, msg.subject.as_str()) => {
                    return Some(msg)
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

struct InMemoryWorkSubscription {
    rx: mpsc::Receiver<WorkMessage>,
}

#[async_trait]
impl WorkSubscription for InMemoryWorkSubscription {
    async fn next(&mut self) -> Option<WorkMessage> {
        self.rx.recv().await
    }
}

#[async_trait]
impl Bus for InMemoryBus {
    async fn publish(&self, subject: &Subject, envelope: &Envelope) -> Result<(), BusError> {
        use gw_protocol::RoutingClass;
        let msg = BusMessage {
            subject: subject.clone(),
            envelope: envelope.clone(),
        };
        if gw_protocol::classify(subject) == RoutingClass::FederationInternal {
            let queues = self.work_queues.lock().await;
            if let Some(queue) = queues.get(subject.as_str()) {
                if !queue.members.is_empty() {
                    let idx = queue.next.fetch_add(1, Ordering::Relaxed) % queue.members.len();
                    let work = WorkMessage {
                        subject: subject.clone(),
                        envelope: envelope.clone(),
                    };
                    let _ = queue.members[idx].send(work).await;
                }
            }
            return Ok(());
        }
        // Broadcast publish never "fails" for lack of subscribers -- that is
        // the live class's best-effort, drop-oldest contract.
        let _ = self.live_tx.send(msg);
        Ok(())
    }

    async fn ensure_streams(&self) -> Result<(), BusError> {
        Ok(())
    }

    async fn subscribe_wildcard(
        &self,
        pattern: &str,
    ) -> Result<Box<dyn BusSubscription>, BusError> {
        Ok(Box::new(InMemorySubscription {
            pattern: pattern.to_owned(),
            rx: self.live_tx.subscribe(),
        }))
    }

    async fn work_subscribe(
        &self,
        subject: &str,
        queue_group: &str,
    ) -> Result<Box<dyn WorkSubscription>, BusError> {
        let key = format!("{subject}::{queue_group}");
        let (tx, rx) = mpsc::channel(256);
        let mut queues = self.work_queues.lock().await;
        queues.entry(key).or_default().members.push(tx);
        Ok(Box::new(InMemoryWorkSubscription { rx }))
    }
}
