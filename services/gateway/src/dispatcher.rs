//! The bus-subscriber fiber: decode, resolve once per event, fan out under a
//! registry read-lock without ever suspending on I/O while holding it.
//! Grounded in `ws_forwarder.rs`'s event-batch `tokio::select!` loop,
//! generalized from a single connection to a registry-wide fan-out.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use gw_bus::BusSubscription;
use gw_protocol::Envelope;
use tracing::{error, info, warn};

use crate::admin_events::AdminEvent;
use crate::presence;
use crate::state::AppState;

/// Drives the bus subscription for as long as the process runs. A dropped
/// subscription (JetStream hiccup, server restart) is spec.md §7 error kind
/// 5 -- recoverable, not fatal -- so this resubscribes with exponential
/// backoff rather than letting dispatch die with the process still up.
/// Grounded in `gw_bus::connect_with_backoff`'s retry shape, applied here to
/// the ongoing consume loop rather than just the initial connect.
pub async fn run(state: Arc<AppState>, pattern: String) {
    loop {
        let sub = match subscribe_with_backoff(&state, &pattern).await {
            Some(sub) => sub,
            None => return, // only returns None if the process is shutting down
        };
        info!(pattern = %pattern, "dispatcher attached to bus subscription");
        state.ready.store(true, Ordering::SeqCst);

        run_once(&state, sub).await;

        state.ready.store(false, Ordering::SeqCst);
        state.metrics.bus_subscribe_restarts.fetch_add(1, Ordering::Relaxed);
        warn!(pattern = %pattern, "bus subscription ended, resubscribing");
    }
}

async fn run_once(state: &Arc<AppState>, mut sub: Box<dyn BusSubscription>) {
    while let Some(msg) = sub.next().await {
        handle_message(state, msg.subject, msg.envelope).await;
    }
}

async fn subscribe_with_backoff(state: &Arc<AppState>, pattern: &str) -> Option<Box<dyn BusSubscription>> {
    let operation = || async {
        state
            .bus
            .subscribe_wildcard(pattern)
            .await
            .map_err(backoff::Error::transient)
    };
    match backoff::future::retry(backoff::ExponentialBackoff::default(), operation).await {
        Ok(sub) => Some(sub),
        Err(e) => {
            error!(pattern = %pattern, error = %e, "exhausted retries resubscribing to bus");
            None
        }
    }
}

async fn handle_message(state: &Arc<AppState>, subject: gw_protocol::Subject, envelope: Envelope) {
    if !envelope.has_required_hint(subject.category_path()) {
        warn!(subject = %subject, "dropping event missing a required routing hint");
        return;
    }

    if subject.category_path() == "channel.update" || subject.category_path() == "channel.delete"
    {
        if let Some(channel_id) = envelope.channel_id.as_deref() {
            state.resolver.invalidate_channel(channel_id).await;
        }
    }

    if subject.category_path() == "guild.member_add"
        || subject.category_path() == "guild.member_remove"
    {
        if let (Some(guild_id), Some(actor_id)) =
            (envelope.guild_id.as_deref(), envelope.actor_id.as_deref())
        {
            let added = subject.category_path() == "guild.member_add";
            presence::handle_membership_change(state, guild_id, actor_id, added).await;
        }
    }

    // Resolve the channel→guild/DM mapping once, before the lock, per the
    // no-I/O-under-lock invariant.
    let channel_scope = match envelope.channel_id.as_deref() {
        Some(c) => state.resolver.resolve_channel(c).await,
        None => None,
    };

    let delivered = {
        let registry = state.sessions.read().await;
        let mut delivered = 0u64;
        for session in registry.values() {
            let view = session.resolver_view().await;
            if !state
                .resolver
                .may_deliver_sync(&view, &subject, &envelope, channel_scope.as_ref())
            {
                continue;
            }
            if session.deliver(&envelope.event_type, &envelope.data).await {
                delivered += 1;
            } else {
                state.metrics.drop_count.fetch_add(1, Ordering::Relaxed);
                if session.drop_count().await >= state.config.slow_consumer_drop_threshold {
                    let _ = session
                        .try_send(gw_protocol::Frame::new(gw_protocol::op::RECONNECT))
                        .await;
                    session
                        .set_state(crate::session::SessionState::Closing)
                        .await;
                }
            }
        }
        delivered
        // read-lock dropped here; no store I/O occurred inside this block.
    };

    let category = subject.category().to_owned();
    state.metrics.record_dispatch(&category);
    if delivered > 0 {
        state.publish_admin_event(AdminEvent::DispatchCount { category, delivered });
    }
}
