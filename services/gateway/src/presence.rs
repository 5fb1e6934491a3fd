//! Presence peer-set maintenance: incremental updates to the in-session peer
//! set on guild membership changes, so rule 3 of the resolver stays O(1)
//! without recomputing `friends ∪ guild-mates` on every presence event.

use std::sync::Arc;

use crate::state::AppState;

/// React to `guild.member_add` / `guild.member_remove`: update every live
/// session's `guilds` set for the affected user, and every live session's
/// `peers` set for the user's new/former guild-mates.
pub async fn handle_membership_change(
    state: &Arc<AppState>,
    guild_id: &str,
    user_id: &str,
    added: bool,
) {
    let affected_user_sessions = state.sessions_for_user(user_id).await;
    for session in &affected_user_sessions {
        if added {
            session.add_guild(guild_id).await;
        } else {
            session.remove_guild(guild_id).await;
        }
    }

    let members = state.resolver.guild_members(guild_id).await;
    for member_id in &members {
        if member_id == user_id {
            continue;
        }
        if !added && state.resolver.shares_context(user_id, member_id).await {
            continue;
        }
        let member_sessions = state.sessions_for_user(member_id).await;
        for session in &member_sessions {
            if added {
                session.add_peer(user_id).await;
            } else {
                session.remove_peer(user_id).await;
            }
        }
        for session in &affected_user_sessions {
            if added {
                session.add_peer(member_id).await;
            } else {
                session.remove_peer(member_id).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    // Exercised end-to-end via `tests/presence_fanout.rs`, which drives two
    // real sessions through identify and a membership-change event -- unit
    // testing this function in isolation would just re-mock `AppState`.
}
