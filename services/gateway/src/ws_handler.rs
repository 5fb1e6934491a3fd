//! The per-connection WebSocket fiber: upgrade, handshake (IDENTIFY/RESUME),
//! then a single `tokio::select!` loop multiplexing inbound client frames,
//! outbound DISPATCH frames off the session's send queue, and heartbeat
//! enforcement. One task per connection, grounded in the teacher's
//! `ws_forwarder_handler`/`handle_forwarder_socket` shape
//! (`ws_forwarder.rs`), generalized from a single forwarder-hello handshake
//! to IDENTIFY-or-RESUME and from one fixed message kind to the full client
//! opcode table.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use gw_protocol::{
    close_code, op, Envelope, Frame, IdentifyPayload, PresenceUpdatePayload, RequestMembersPayload,
    ResumePayload, Subject, SubscribePayload, TypingPayload, VoiceStateUpdatePayload,
};

use crate::admin_events::AdminEvent;
use crate::auth::new_session_token;
use crate::errors::GatewayError;
use crate::heartbeat;
use crate::repo::validate_account_token;
use crate::session::Session;
use crate::state::AppState;

pub async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    if !origin_allowed(&state, &headers) {
        return (StatusCode::FORBIDDEN, "origin not allowed").into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state))
        .into_response()
}

fn origin_allowed(state: &AppState, headers: &HeaderMap) -> bool {
    if state.config.allowed_origins.is_empty() {
        return true;
    }
    headers
        .get("origin")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|origin| state.config.allowed_origins.iter().any(|o| o == origin))
}

async fn send_frame(socket: &mut WebSocket, frame: &Frame) -> bool {
    match serde_json::to_string(frame) {
        Ok(text) => socket.send(Message::Text(text.into())).await.is_ok(),
        Err(_) => false,
    }
}

async fn close_with(socket: &mut WebSocket, code: u16, reason: &str) {
    let _ = socket
        .send(Message::Close(Some(axum::extract::ws::CloseFrame {
            code,
            reason: reason.to_owned().into(),
        })))
        .await;
}

/// Closes the socket on the code `GatewayError::close_code` assigns the
/// error kind, using the error's own `Display` as the close reason. Every
/// handshake/session-loop failure path closes through here so the close
/// code taxonomy lives in one place (`errors.rs`) instead of being
/// re-decided at each call site.
async fn close_with_error(socket: &mut WebSocket, err: GatewayError) -> u16 {
    let code = err.close_code().unwrap_or(close_code::UNKNOWN);
    close_with(socket, code, &err.to_string()).await;
    code
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let hello = Frame::new(op::HELLO).with_data(json!({
        "heartbeat_interval_ms": state.config.heartbeat_interval.as_millis() as u64,
        "build": env!("CARGO_PKG_VERSION"),
    }));
    if !send_frame(&mut socket, &hello).await {
        return;
    }

    let session_id = Uuid::new_v4().to_string();
    state.publish_admin_event(AdminEvent::SessionConnected {
        session_id: session_id.clone(),
    });

    let first = match tokio::time::timeout(state.config.identify_deadline, socket.recv()).await {
        Ok(Some(Ok(Message::Text(text)))) => serde_json::from_str::<Frame>(&text).ok(),
        _ => None,
    };

    let Some(frame) = first else {
        close_with_error(&mut socket, GatewayError::AuthFailed).await;
        return;
    };

    let (session, mut send_rx, user_id) = match frame.op {
        op::IDENTIFY => match handshake_identify(&mut socket, &state, &session_id, &frame).await {
            Some(established) => established,
            None => return,
        },
        op::RESUME => match handshake_resume(&mut socket, &state, &frame).await {
            Some(established) => established,
            None => return,
        },
        _ => {
            close_with_error(
                &mut socket,
                GatewayError::ProtocolViolation("expected identify or resume".to_owned()),
            )
            .await;
            return;
        }
    };

    let issued_code = run_session_loop(&mut socket, &state, &session, &mut send_rx, &user_id).await;
    let code = issued_code.unwrap_or(close_code::UNKNOWN);
    let resumable = close_code::is_resumable(code);

    state.publish_admin_event(AdminEvent::SessionClosed {
        session_id: session.id.clone(),
        code,
        resumable,
    });

    if resumable {
        // P3/P4: retain the session record -- replay buffer, send queue,
        // resolver state -- for a grace window so a RESUME can still find
        // it. If nothing resumes it within the window, evict it for good.
        session.set_state(crate::session::SessionState::Closing).await;
        info!(session_id = %session.id, user_id = %user_id, "session disconnected, awaiting resume");
        schedule_grace_eviction(state, session, user_id);
    } else {
        state.remove_session(&session.id).await;
        state.unindex_user_session(&user_id, &session.id).await;
        info!(session_id = %session.id, user_id = %user_id, "session ended (non-resumable)");
    }
}

/// Evicts a disconnected-but-resumable session once `resume_grace` elapses,
/// unless a RESUME already brought it back to LIVE in the meantime.
fn schedule_grace_eviction(state: AppState, session: Arc<Session>, user_id: String) {
    let grace = state.config.resume_grace;
    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        if session.state().await != crate::session::SessionState::Live {
            state.remove_session(&session.id).await;
            state.unindex_user_session(&user_id, &session.id).await;
            state.publish_admin_event(AdminEvent::SessionExpired {
                session_id: session.id.clone(),
            });
            info!(session_id = %session.id, "resume grace window elapsed, session evicted");
        }
    });
}

async fn handshake_identify(
    socket: &mut WebSocket,
    state: &AppState,
    session_id: &str,
    frame: &Frame,
) -> Option<(Arc<Session>, tokio::sync::mpsc::Receiver<Frame>, String)> {
    let payload: IdentifyPayload = match frame.payload() {
        Ok(p) => p,
        Err(_) => {
            close_with_error(
                socket,
                GatewayError::ProtocolViolation("malformed identify payload".to_owned()),
            )
            .await;
            return None;
        }
    };

    let claims = match validate_account_token(&state.db, &payload.token).await {
        Some(c) => c,
        None => {
            close_with_error(socket, GatewayError::AuthFailed).await;
            return None;
        }
    };

    let (guilds, dm_channels, peers) = state.resolver.identity_scope(&claims.account_id).await;

    let (session, send_rx) = Session::new(
        session_id.to_owned(),
        new_session_token(),
        state.config.replay_buffer_len,
        state.config.send_queue_capacity,
    );
    let session = Arc::new(session);
    session
        .identify(claims.account_id.clone(), guilds, dm_channels, peers)
        .await;

    state.insert_session(session.clone()).await;
    state.index_user_session(&claims.account_id, session_id).await;
    state.publish_admin_event(AdminEvent::SessionIdentified {
        session_id: session_id.to_owned(),
        user_id: claims.account_id.clone(),
    });

    let ready = Frame::dispatch(
        "READY",
        0,
        json!({
            "session_id": session_id,
            "session_token": session.session_token().await,
            "user_id": claims.account_id,
        }),
    );
    if !send_frame(socket, &ready).await {
        state.remove_session(session_id).await;
        return None;
    }

    publish_presence_update(state, &claims.account_id, "online").await;

    Some((session, send_rx, claims.account_id))
}

async fn handshake_resume(
    socket: &mut WebSocket,
    state: &AppState,
    frame: &Frame,
) -> Option<(Arc<Session>, tokio::sync::mpsc::Receiver<Frame>, String)> {
    let payload: ResumePayload = match frame.payload() {
        Ok(p) => p,
        Err(_) => {
            close_with_error(
                socket,
                GatewayError::ProtocolViolation("malformed resume payload".to_owned()),
            )
            .await;
            return None;
        }
    };

    let Some(session) = state.session_by_token(&payload.session_token).await else {
        close_with_error(socket, GatewayError::AuthFailed).await;
        return None;
    };

    state.metrics.replay_invocations.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    match session.resume_frames(payload.seq).await {
        Ok(replay) => {
            let Some(user_id) = session.user_id().await else {
                close_with_error(socket, GatewayError::AuthFailed).await;
                return None;
            };
            // The prior connection's cleanup path (or the grace-eviction
            // task) may have already dropped this session from the user
            // index; restore it now that resume has brought it back to LIVE.
            state.index_user_session(&user_id, &session.id).await;
            state.metrics.resume_successes.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            let resumed = Frame::dispatch("RESUMED", session.last_seq().await, json!({"replayed": replay.len()}));
            if !send_frame(socket, &resumed).await {
                return None;
            }
            for f in replay {
                let frame = Frame::dispatch(f.event_type, f.seq, f.data);
                if !send_frame(socket, &frame).await {
                    return None;
                }
            }
            // `Session::new` handed its `send_rx` half to the first
            // connection's fiber, which has since exited. Install a fresh
            // channel for this reconnect.
            let new_rx = session.rebind_send_queue(state.config.send_queue_capacity).await;
            Some((session, new_rx, user_id))
        }
        Err(oldest) => {
            state.metrics.resume_failures.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            close_with_error(
                socket,
                GatewayError::ResumeOutOfWindow {
                    client_last_seq: payload.seq,
                    buffer_oldest: oldest,
                },
            )
            .await;
            // P4: no partial replay, and the session record itself is gone
            // -- the client must re-identify from scratch, not retry RESUME.
            state.remove_session(&session.id).await;
            if let Some(user_id) = session.user_id().await {
                state.unindex_user_session(&user_id, &session.id).await;
            }
            None
        }
    }
}

async fn publish_presence_update(state: &AppState, user_id: &str, status: &str) {
    if let Ok(subject) = Subject::parse(format!("{}.presence.update", state.config.namespace)) {
        let envelope = Envelope::new("PRESENCE_UPDATE", json!({"status": status})).with_actor(user_id);
        let _ = state.bus.publish(&subject, &envelope).await;
    }
}

/// Runs the connection's multiplex loop until it should close. Returns the
/// close code the server itself issued, or `None` when the socket just went
/// away (client close, network error) -- callers treat a `None` the same as
/// the resumable `UNKNOWN` code.
async fn run_session_loop(
    socket: &mut WebSocket,
    state: &AppState,
    session: &Arc<Session>,
    send_rx: &mut tokio::sync::mpsc::Receiver<Frame>,
    user_id: &str,
) -> Option<u16> {
    let mut heartbeat_check = tokio::time::interval(state.config.heartbeat_interval / 4);
    heartbeat_check.tick().await;

    loop {
        tokio::select! {
            _ = heartbeat_check.tick() => {
                let status = heartbeat::check(
                    session.last_heartbeat().await,
                    std::time::Instant::now(),
                    state.config.heartbeat_interval,
                );
                if let Some(code) = status.close_code() {
                    warn!(session_id = %session.id, ?status, "heartbeat timeout");
                    close_with(socket, code, "heartbeat timeout").await;
                    return Some(code);
                }
            }
            maybe_frame = send_rx.recv() => {
                match maybe_frame {
                    Some(frame) => {
                        let is_reconnect = frame.op == op::RECONNECT;
                        if !send_frame(socket, &frame).await {
                            return None;
                        }
                        if is_reconnect {
                            // The dispatcher decided this slow consumer must
                            // reconnect; the hint has been forwarded, now
                            // actually close the socket on a resumable code.
                            let code = close_with_error(socket, GatewayError::SlowConsumer).await;
                            return Some(code);
                        }
                    }
                    None => return None,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if !handle_client_frame(socket, state, session, user_id, &text).await {
                            return None;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = socket.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => return None,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(session_id = %session.id, error = %e, "websocket error");
                        return None;
                    }
                }
            }
        }
    }
}

/// Returns `false` when the connection should close.
async fn handle_client_frame(
    socket: &mut WebSocket,
    state: &AppState,
    session: &Arc<Session>,
    user_id: &str,
    text: &str,
) -> bool {
    let frame: Frame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => {
            warn!(session_id = %session.id, error = %e, "malformed client frame");
            return true;
        }
    };

    match frame.op {
        op::HEARTBEAT => {
            session.touch_heartbeat().await;
            send_frame(socket, &Frame::new(op::HEARTBEAT_ACK)).await
        }
        op::PRESENCE_UPDATE => {
            if let Ok(payload) = frame.payload::<PresenceUpdatePayload>() {
                publish_presence_update(state, user_id, &payload.status).await;
            }
            true
        }
        op::VOICE_STATE_UPDATE => {
            if let Ok(payload) = frame.payload::<VoiceStateUpdatePayload>() {
                if let Ok(subject) = Subject::parse(format!("{}.voice.state_update", state.config.namespace)) {
                    let envelope = Envelope::new(
                        "VOICE_STATE_UPDATE",
                        json!({"self_mute": payload.self_mute, "self_deaf": payload.self_deaf}),
                    )
                    .with_actor(user_id)
                    .with_channel(payload.channel_id);
                    let _ = state.bus.publish(&subject, &envelope).await;
                }
            }
            true
        }
        op::TYPING => {
            if let Ok(payload) = frame.payload::<TypingPayload>() {
                if let Ok(subject) = Subject::parse(format!("{}.channel.typing_start", state.config.namespace)) {
                    let envelope = Envelope::new("TYPING_START", json!({}))
                        .with_actor(user_id)
                        .with_channel(payload.channel_id);
                    let _ = state.bus.publish(&subject, &envelope).await;
                }
            }
            true
        }
        op::SUBSCRIBE => {
            if let Ok(payload) = frame.payload::<SubscribePayload>() {
                session.set_subscriptions(payload.channel_ids.into_iter().collect()).await;
            }
            true
        }
        op::REQUEST_MEMBERS => {
            if let Ok(payload) = frame.payload::<RequestMembersPayload>() {
                let members = state.resolver.guild_members(&payload.guild_id).await;
                let chunk = Frame::new(op::DISPATCH).with_data(json!({
                    "type": "GUILD_MEMBERS_CHUNK",
                    "guild_id": payload.guild_id,
                    "members": members.into_iter().take(payload.limit.max(1) as usize).collect::<Vec<_>>(),
                }));
                send_frame(socket, &chunk).await
            } else {
                true
            }
        }
        _ => {
            warn!(session_id = %session.id, op = frame.op, "unexpected client opcode");
            true
        }
    }
}
