//! The Authorization Resolver: the pure predicate `may_deliver`, fail-closed
//! by construction, plus the bounded channel→guild cache it reads through.
//! Rule order below follows the hint-driven priority exactly: subject-class
//! gated rules (announcement, presence/user, relationship, call-ring) are
//! checked first, then envelope-hint-driven rules (guild_id, channel_id),
//! falling through to a hard-false default.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use gw_protocol::{classify, Envelope, RoutingClass, Subject};
use lru::LruCache;
use tokio::sync::Mutex;

use crate::repo::{ChannelScope, MembershipRepo};
use crate::session::{ResolverView, SessionState};

const CHANNEL_CACHE_CAPACITY: usize = 32_768;
const CHANNEL_CACHE_TTL: Duration = Duration::from_secs(60);

struct CacheEntry {
    scope: ChannelScope,
    cached_at: Instant,
}

/// Bounded LRU, TTL 60s, keyed by channel id. Misses are filled by a single
/// store lookup; the resolver never holds this lock across that lookup --
/// the lock only ever wraps an in-memory LRU operation.
pub struct ResolverCache {
    inner: Mutex<LruCache<String, CacheEntry>>,
}

impl Default for ResolverCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ResolverCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LruCache::new(
                std::num::NonZeroUsize::new(CHANNEL_CACHE_CAPACITY).unwrap(),
            )),
        }
    }

    async fn get(&self, channel_id: &str) -> Option<ChannelScope> {
        let mut cache = self.inner.lock().await;
        match cache.get(channel_id) {
            Some(entry) if entry.cached_at.elapsed() < CHANNEL_CACHE_TTL => {
                Some(entry.scope.clone())
            }
            Some(_) => {
                cache.pop(channel_id);
                None
            }
            None => None,
        }
    }

    async fn put(&self, channel_id: String, scope: ChannelScope) {
        self.inner.lock().await.put(
            channel_id,
            CacheEntry {
                scope,
                cached_at: Instant::now(),
            },
        );
    }

    /// Dropped by the dispatcher on `channel.update`/`channel.delete`.
    pub async fn invalidate(&self, channel_id: &str) {
        self.inner.lock().await.pop(channel_id);
    }
}

/// Reads both `id`/`<entity>_id` payload keys per the compatibility-mode
/// contract (Open Question A). Only consulted when `payload_introspection`
/// is explicitly enabled -- off by default in this implementation.
fn introspect_routing_hints(
    data: &serde_json::Value,
) -> (Option<String>, Option<String>, Option<String>) {
    let as_string = |key: &str| -> Option<String> {
        data.get(key).and_then(|v| v.as_str()).map(ToOwned::to_owned)
    };
    let actor = as_string("actor_id")
        .or_else(|| as_string("user_id"))
        .or_else(|| as_string("id"));
    let channel = as_string("channel_id");
    let guild = as_string("guild_id");
    (actor, channel, guild)
}

pub struct Resolver {
    cache: ResolverCache,
    repo: Arc<dyn MembershipRepo>,
    payload_introspection: bool,
}

impl Resolver {
    pub fn new(repo: Arc<dyn MembershipRepo>, payload_introspection: bool) -> Self {
        Self {
            cache: ResolverCache::new(),
            repo,
            payload_introspection,
        }
    }

    pub async fn invalidate_channel(&self, channel_id: &str) {
        self.cache.invalidate(channel_id).await;
    }

    pub async fn guild_members(&self, guild_id: &str) -> HashSet<String> {
        self.repo.guild_members(guild_id).await.unwrap_or_default()
    }

    /// Whether `a` and `b` still have any peer-granting relationship --
    /// friendship, a shared guild, or a shared DM channel. Queried fresh
    /// against the store rather than an in-session snapshot, since presence
    /// peer maintenance must reflect membership as of the event just applied,
    /// not the session's stale `guilds` set for the *other* user.
    pub async fn shares_context(&self, a: &str, b: &str) -> bool {
        let friends = self.repo.friends_of(a).await.unwrap_or_default();
        if friends.contains(b) {
            return true;
        }
        let guilds_a = self.repo.guilds_of(a).await.unwrap_or_default();
        let guilds_b = self.repo.guilds_of(b).await.unwrap_or_default();
        if guilds_a.intersection(&guilds_b).next().is_some() {
            return true;
        }
        let dms_a = self.repo.dm_channels_of(a).await.unwrap_or_default();
        let dms_b = self.repo.dm_channels_of(b).await.unwrap_or_default();
        dms_a.intersection(&dms_b).next().is_some()
    }

    /// Bootstraps a freshly-identified session: its guilds, its DM channels,
    /// and its peer set (friends ∪ guild-mates), in the three lookups the
    /// Session Manager needs before it can mark a session LIVE.
    pub async fn identity_scope(
        &self,
        user_id: &str,
    ) -> (HashSet<String>, HashSet<String>, HashSet<String>) {
        let guilds = self.repo.guilds_of(user_id).await.unwrap_or_default();
        let dm_channels = self.repo.dm_channels_of(user_id).await.unwrap_or_default();
        let peers = compute_peer_set(self.repo.as_ref(), user_id, &guilds).await;
        (guilds, dm_channels, peers)
    }

    /// Cache-or-store lookup. The only place this resolver ever suspends on
    /// I/O; the dispatcher calls this *before* acquiring the registry lock
    /// and passes the result into `may_deliver_sync` for every session, so
    /// the per-session fan-out loop never touches the store (P11).
    pub async fn resolve_channel(&self, channel_id: &str) -> Option<ChannelScope> {
        if let Some(scope) = self.cache.get(channel_id).await {
            return Some(scope);
        }
        let scope = self.repo.channel_to_guild(channel_id).await.ok()?;
        self.cache.put(channel_id.to_owned(), scope.clone()).await;
        Some(scope)
    }

    /// Convenience wrapper for call sites (tests, single-session checks)
    /// that don't need to batch the channel lookup ahead of a fan-out loop.
    pub async fn may_deliver(
        &self,
        view: &ResolverView,
        subject: &Subject,
        envelope: &Envelope,
    ) -> bool {
        let channel_id = envelope.channel_id.as_deref();
        let precomputed = match channel_id {
            Some(c) => self.resolve_channel(c).await,
            None => None,
        };
        self.may_deliver_sync(view, subject, envelope, precomputed.as_ref())
    }

    /// The pure predicate: no suspension, no lock, no I/O. `channel_scope`
    /// must already reflect `envelope.channel_id` (or be `None` if the
    /// envelope carries no channel hint) -- resolved once per inbound event
    /// by the dispatcher before the registry read-lock is taken.
    pub fn may_deliver_sync(
        &self,
        view: &ResolverView,
        subject: &Subject,
        envelope: &Envelope,
        channel_scope: Option<&ChannelScope>,
    ) -> bool {
        // 1. Pre-identify gate.
        if view.state != SessionState::Live {
            return false;
        }

        // 2. Announcement: broadcast to every LIVE session.
        if subject.category() == "announcement" {
            return true;
        }

        let class = classify(subject);

        let (mut actor_id, mut channel_id, mut guild_id) = (
            envelope.actor_id.clone(),
            envelope.channel_id.clone(),
            envelope.guild_id.clone(),
        );
        if self.payload_introspection {
            let (i_actor, i_channel, i_guild) = introspect_routing_hints(&envelope.data);
            actor_id = actor_id.or(i_actor);
            channel_id = channel_id.or(i_channel);
            guild_id = guild_id.or(i_guild);
        }

        // 3. Self-scoped (channel.ack): only the acting user's own sessions,
        // never a peer's, even a guild-mate who'd otherwise see a
        // UserScoped/PresenceExpanded event from the same actor.
        if class == RoutingClass::SelfScoped {
            let (Some(actor), Some(me)) = (actor_id.as_deref(), view.user_id.as_deref()) else {
                return false;
            };
            return actor == me;
        }

        // 4. Presence / user-update: self, friend, or shared-guild peer.
        if matches!(class, RoutingClass::PresenceExpanded | RoutingClass::UserScoped) {
            let (Some(actor), Some(me)) = (actor_id.as_deref(), view.user_id.as_deref()) else {
                return false;
            };
            return actor == me || view.peers.contains(actor);
        }

        // 5. User relationship events: routed only to the targeted user.
        if class == RoutingClass::UserRelationship {
            let Some(actor) = actor_id.as_deref() else {
                return false;
            };
            return Some(actor) == view.user_id.as_deref();
        }

        // 6. Call-ring: DM/group recipients, excluding the caller.
        if class == RoutingClass::CallRing {
            let (Some(me), Some(channel)) = (view.user_id.as_deref(), channel_id.as_deref())
            else {
                return false;
            };
            let _ = channel; // channel id itself only mattered for the lookup, already done.
            if actor_id.as_deref() == Some(me) {
                return false;
            }
            return matches!(
                channel_scope,
                Some(ChannelScope::Dm(recipients)) if recipients.contains(me)
            );
        }

        // 7. Guild-scoped: envelope already carries guild_id.
        if let Some(g) = guild_id.as_deref() {
            return view.guilds.contains(g);
        }

        // 8 + 9. Channel-scoped: use the precomputed scope, then narrow by
        // explicit subscription if the session declared one.
        if let Some(c) = channel_id.as_deref() {
            let allowed = match channel_scope {
                Some(ChannelScope::Guild(g)) => view.guilds.contains(g),
                Some(ChannelScope::Dm(recipients)) => {
                    view.user_id.as_deref().is_some_and(|me| recipients.contains(me))
                }
                None => false,
            };
            if !allowed {
                return false;
            }
            if !view.subscriptions.is_empty() {
                return view.subscriptions.contains(c);
            }
            return true;
        }

        // 10. Default: fail-closed.
        false
    }
}

/// Precomputed on identify, incrementally maintained: `friends(user) ∪
/// members(g) for g in user.guilds`.
pub async fn compute_peer_set(
    repo: &dyn MembershipRepo,
    user_id: &str,
    guilds: &HashSet<String>,
) -> HashSet<String> {
    let mut peers = repo.friends_of(user_id).await.unwrap_or_default();
    for guild_id in guilds {
        if let Ok(members) = repo.guild_members(guild_id).await {
            peers.extend(members);
        }
    }
    peers.remove(user_id);
    peers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::membership::fake::FakeMembershipRepo;
    use gw_protocol::Envelope;
    use serde_json::json;

    fn live_view(user_id: &str, guilds: &[&str], peers: &[&str]) -> ResolverView {
        ResolverView {
            state: SessionState::Live,
            user_id: Some(user_id.to_owned()),
            guilds: guilds.iter().map(|s| s.to_string()).collect(),
            dm_channels: HashSet::new(),
            subscriptions: HashSet::new(),
            peers: peers.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn resolver() -> Resolver {
        Resolver::new(Arc::new(FakeMembershipRepo::default()), false)
    }

    #[tokio::test]
    async fn pre_identify_session_never_receives_anything() {
        let r = resolver();
        let mut view = live_view("u1", &[], &[]);
        view.state = SessionState::Identifying;
        let subject = Subject::parse("amityvox.announcement.outage").unwrap();
        let env = Envelope::new("OUTAGE", json!({}));
        assert!(!r.may_deliver(&view, &subject, &env).await);
    }

    #[tokio::test]
    async fn announcement_reaches_every_live_session() {
        let r = resolver();
        let view = live_view("u1", &[], &[]);
        let subject = Subject::parse("amityvox.announcement.outage").unwrap();
        let env = Envelope::new("OUTAGE", json!({}));
        assert!(r.may_deliver(&view, &subject, &env).await);
    }

    #[tokio::test]
    async fn guild_scoped_event_requires_membership() {
        let r = resolver();
        let member = live_view("u1", &["g1"], &[]);
        let outsider = live_view("u2", &["g2"], &[]);
        let subject = Subject::parse("amityvox.guild.update").unwrap();
        let env = Envelope::new("GUILD_UPDATE", json!({})).with_guild("g1");

        assert!(r.may_deliver(&member, &subject, &env).await);
        assert!(!r.may_deliver(&outsider, &subject, &env).await);
    }

    #[tokio::test]
    async fn channel_scoped_guild_message_resolves_via_cache_fallback() {
        let repo = Arc::new(FakeMembershipRepo::default());
        repo.channels
            .write()
            .await
            .insert("c1".to_owned(), ChannelScope::Guild("g1".to_owned()));
        let r = Resolver::new(repo, false);

        let member = live_view("u1", &["g1"], &[]);
        let outsider = live_view("u2", &["g2"], &[]);
        let subject = Subject::parse("amityvox.message.create").unwrap();
        let env = Envelope::new("MESSAGE_CREATE", json!({})).with_channel("c1");

        assert!(r.may_deliver(&member, &subject, &env).await);
        assert!(!r.may_deliver(&outsider, &subject, &env).await);
    }

    #[tokio::test]
    async fn dm_message_reaches_only_recipients() {
        let repo = Arc::new(FakeMembershipRepo::default());
        repo.channels.write().await.insert(
            "dm1".to_owned(),
            ChannelScope::Dm(["u1", "u2"].into_iter().map(String::from).collect()),
        );
        let r = Resolver::new(repo, false);

        let u1 = live_view("u1", &[], &[]);
        let u2 = live_view("u2", &[], &[]);
        let u3 = live_view("u3", &[], &[]);
        let subject = Subject::parse("amityvox.message.create").unwrap();
        let env = Envelope::new("MESSAGE_CREATE", json!({})).with_channel("dm1");

        assert!(r.may_deliver(&u1, &subject, &env).await);
        assert!(r.may_deliver(&u2, &subject, &env).await);
        assert!(!r.may_deliver(&u3, &subject, &env).await);
    }

    #[tokio::test]
    async fn explicit_subscription_narrows_channel_scoped_delivery() {
        let repo = Arc::new(FakeMembershipRepo::default());
        repo.channels
            .write()
            .await
            .insert("c1".to_owned(), ChannelScope::Guild("g1".to_owned()));
        repo.channels
            .write()
            .await
            .insert("c2".to_owned(), ChannelScope::Guild("g1".to_owned()));
        let r = Resolver::new(repo, false);

        let mut subscribed = live_view("u1", &["g1"], &[]);
        subscribed.subscriptions.insert("c1".to_owned());

        let subject = Subject::parse("amityvox.message.create").unwrap();
        let on_c1 = Envelope::new("MESSAGE_CREATE", json!({})).with_channel("c1");
        let on_c2 = Envelope::new("MESSAGE_CREATE", json!({})).with_channel("c2");

        assert!(r.may_deliver(&subscribed, &subject, &on_c1).await);
        assert!(!r.may_deliver(&subscribed, &subject, &on_c2).await);
    }

    #[tokio::test]
    async fn presence_update_reaches_self_friends_and_guildmates_only() {
        let r = resolver();
        let me = live_view("u1", &[], &["u2", "u3"]);
        let stranger = live_view("u4", &[], &[]);
        let subject = Subject::parse("amityvox.presence.update").unwrap();
        let env = Envelope::new("PRESENCE_UPDATE", json!({})).with_actor("u2");

        assert!(r.may_deliver(&me, &subject, &env).await);
        assert!(!r.may_deliver(&stranger, &subject, &env).await);
    }

    #[tokio::test]
    async fn channel_ack_never_reaches_a_guildmate_even_though_presence_would() {
        let r = resolver();
        let acker = live_view("u1", &[], &["u2"]);
        let guildmate = live_view("u2", &[], &["u1"]);
        let subject = Subject::parse("amityvox.channel.ack").unwrap();
        let env = Envelope::new("CHANNEL_ACK", json!({})).with_actor("u1");

        assert!(r.may_deliver(&acker, &subject, &env).await);
        assert!(!r.may_deliver(&guildmate, &subject, &env).await);
    }

    #[tokio::test]
    async fn relationship_event_routes_only_to_targeted_user() {
        let r = resolver();
        let target = live_view("u2", &[], &[]);
        let bystander = live_view("u3", &[], &[]);
        let subject = Subject::parse("amityvox.user.relationship_add").unwrap();
        let env = Envelope::new("RELATIONSHIP_ADD", json!({})).with_actor("u2");

        assert!(r.may_deliver(&target, &subject, &env).await);
        assert!(!r.may_deliver(&bystander, &subject, &env).await);
    }

    #[tokio::test]
    async fn call_ring_excludes_the_caller_and_reaches_other_recipients() {
        let repo = Arc::new(FakeMembershipRepo::default());
        repo.channels.write().await.insert(
            "dm1".to_owned(),
            ChannelScope::Dm(["u1", "u2"].into_iter().map(String::from).collect()),
        );
        let r = Resolver::new(repo, false);

        let caller = live_view("u1", &[], &[]);
        let callee = live_view("u2", &[], &[]);
        let subject = Subject::parse("amityvox.call.ring").unwrap();
        let env = Envelope::new("CALL_RING", json!({}))
            .with_channel("dm1")
            .with_actor("u1");

        assert!(!r.may_deliver(&caller, &subject, &env).await);
        assert!(r.may_deliver(&callee, &subject, &env).await);
    }

    #[tokio::test]
    async fn missing_required_hint_fails_closed() {
        let r = resolver();
        let view = live_view("u1", &["g1"], &[]);
        let subject = Subject::parse("amityvox.message.create").unwrap();
        let env = Envelope::new("MESSAGE_CREATE", json!({}));
        assert!(!r.may_deliver(&view, &subject, &env).await);
    }

    #[tokio::test]
    async fn compute_peer_set_unions_friends_and_guildmates_excluding_self() {
        let repo = FakeMembershipRepo::default();
        repo.friends
            .write()
            .await
            .insert("u1".to_owned(), ["u3"].into_iter().map(String::from).collect());
        repo.guild_members_map.write().await.insert(
            "g1".to_owned(),
            ["u1", "u2"].into_iter().map(String::from).collect(),
        );
        let guilds = ["g1".to_owned()].into_iter().collect();
        let peers = compute_peer_set(&repo, "u1", &guilds).await;
        assert_eq!(peers, ["u2", "u3"].into_iter().map(String::from).collect());
    }

    #[tokio::test]
    async fn shares_context_is_true_while_any_guild_dm_or_friendship_remains() {
        let repo = FakeMembershipRepo::default();
        repo.guilds
            .write()
            .await
            .insert("u1".to_owned(), ["g1", "g2"].into_iter().map(String::from).collect());
        repo.guilds
            .write()
            .await
            .insert("u2".to_owned(), ["g2"].into_iter().map(String::from).collect());
        let resolver = Resolver::new(Arc::new(repo), false);

        // u1 and u2 still share g2 even after u1 leaves g1.
        assert!(resolver.shares_context("u1", "u2").await);
    }

    #[tokio::test]
    async fn shares_context_is_false_once_no_guild_dm_or_friendship_remains() {
        let repo = FakeMembershipRepo::default();
        repo.guilds
            .write()
            .await
            .insert("u1".to_owned(), HashSet::new());
        repo.guilds
            .write()
            .await
            .insert("u2".to_owned(), ["g2"].into_iter().map(String::from).collect());
        let resolver = Resolver::new(Arc::new(repo), false);

        assert!(!resolver.shares_context("u1", "u2").await);
    }
}
