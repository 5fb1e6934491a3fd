//! The server-internal event envelope: type tag, opaque payload, routing
//! hints. `data` is never parsed by the dispatcher.

use serde::{Deserialize, Serialize};

/// Routing metadata placed on the envelope by the producer. Any hint may be
/// empty; the dispatcher MUST NOT fall back to parsing `data` to recover a
/// missing hint (payload introspection is an explicit, separately-gated
/// compatibility mode -- see `resolver::introspect_routing_hints`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Uppercase symbolic name delivered to clients verbatim, e.g. `MESSAGE_CREATE`.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Opaque payload, forwarded byte-for-byte to clients.
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guild_id: Option<String>,
}

impl Envelope {
    pub fn new(event_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            actor_id: None,
            channel_id: None,
            guild_id: None,
        }
    }

    pub fn with_actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    pub fn with_channel(mut self, channel_id: impl Into<String>) -> Self {
        self.channel_id = Some(channel_id.into());
        self
    }

    pub fn with_guild(mut self, guild_id: impl Into<String>) -> Self {
        self.guild_id = Some(guild_id.into());
        self
    }

    /// True when a producer of this category has satisfied the required-hint
    /// contract for `category_path` (the full `<category>.<action>` tail, so
    /// that `channel.ack` -- user-scoped per Open Question B -- can demand
    /// `actor_id` instead of the generic channel-scoped `channel_id`). Used
    /// by the dispatcher to decide whether to drop-with-warning per Open
    /// Question A.
    pub fn has_required_hint(&self, category_path: &str) -> bool {
        if category_path == "channel.ack" {
            return self.actor_id.is_some();
        }
        let category = category_path.split('.').next().unwrap_or_default();
        match category {
            "message" | "channel" | "voice" | "poll" | "automod" => self.channel_id.is_some(),
            "guild" => self.guild_id.is_some(),
            "user" | "presence" => self.actor_id.is_some(),
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trips_through_json_with_type_renamed() {
        let env = Envelope::new("MESSAGE_CREATE", json!({"content": "hi"}))
            .with_channel("c1")
            .with_guild("g1");
        let text = serde_json::to_string(&env).unwrap();
        assert!(text.contains("\"type\":\"MESSAGE_CREATE\""));
        let back: Envelope = serde_json::from_str(&text).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn omits_empty_hints_from_serialized_form() {
        let env = Envelope::new("USER_UPDATE", json!({}));
        let text = serde_json::to_string(&env).unwrap();
        assert!(!text.contains("actor_id"));
        assert!(!text.contains("channel_id"));
        assert!(!text.contains("guild_id"));
    }

    #[test]
    fn required_hint_check_matches_routing_table() {
        let missing_channel = Envelope::new("MESSAGE_CREATE", json!({}));
        assert!(!missing_channel.has_required_hint("message"));

        let with_channel = missing_channel.with_channel("c1");
        assert!(with_channel.has_required_hint("message"));

        let broadcast = Envelope::new("OUTAGE", json!({}));
        assert!(broadcast.has_required_hint("announcement"));
    }

    #[test]
    fn channel_ack_requires_actor_id_not_channel_id() {
        let missing_actor = Envelope::new("CHANNEL_ACK", json!({})).with_channel("c1");
        assert!(!missing_actor.has_required_hint("channel.ack"));

        let with_actor = Envelope::new("CHANNEL_ACK", json!({})).with_actor("user-1");
        assert!(with_actor.has_required_hint("channel.ack"));
    }
}
