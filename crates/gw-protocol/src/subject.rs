//! Subject taxonomy: the dot-separated routing namespace published and
//! subscribed to on the durable bus.

use std::fmt;

/// A validated `<namespace>.<category>.<action>` subject string.
///
/// Construction is the input-boundary check: producers and the dispatcher
/// never see a malformed subject past `Subject::parse`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Subject(String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubjectError {
    Empty,
    EmptySegment,
    NotLowercase,
    TooFewSegments,
}

impl fmt::Display for SubjectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubjectError::Empty => write!(f, "subject is empty"),
            SubjectError::EmptySegment => write!(f, "subject has an empty segment"),
            SubjectError::NotLowercase => write!(f, "subject must be lowercase"),
            SubjectError::TooFewSegments => write!(f, "subject needs at least namespace.category"),
        }
    }
}

impl std::error::Error for SubjectError {}

impl Subject {
    pub fn parse(raw: impl Into<String>) -> Result<Self, SubjectError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(SubjectError::Empty);
        }
        if !raw.chars().all(|c| c.is_ascii_lowercase() || c == '.' || c == '_') {
            return Err(SubjectError::NotLowercase);
        }
        let segments: Vec<&str> = raw.split('.').collect();
        if segments.len() < 2 {
            return Err(SubjectError::TooFewSegments);
        }
        if segments.iter().any(|s| s.is_empty()) {
            return Err(SubjectError::EmptySegment);
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The `<namespace>` segment.
    pub fn namespace(&self) -> &str {
        self.0.split('.').next().unwrap_or_default()
    }

    /// The `<category>.<action>` tail, e.g. `message.create`.
    pub fn category_path(&self) -> &str {
        self.0.splitn(2, '.').nth(1).unwrap_or_default()
    }

    /// The `<category>` segment alone, e.g. `message`.
    pub fn category(&self) -> &str {
        self.category_path().split('.').next().unwrap_or_default()
    }

    pub fn starts_with_category(&self, category: &str) -> bool {
        self.category() == category
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The routing class a subject's category resolves to, per the reserved
/// top-category table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingClass {
    ChannelScoped,
    GuildScoped,
    UserScoped,
    /// Routed only to the acting user's own sessions -- never to peers, even
    /// ones that would otherwise see a `UserScoped`/`PresenceExpanded` event
    /// from this actor. `channel.ack` is the only member (Open Question B).
    SelfScoped,
    PresenceExpanded,
    CallRing,
    UserRelationship,
    Broadcast,
    FederationInternal,
    Unknown,
}

/// Classify a subject's category for routing purposes. Unrecognized
/// categories fail closed as `Unknown`, which the resolver always denies.
pub fn classify(subject: &Subject) -> RoutingClass {
    if subject.category_path().ends_with("federation.retry") {
        return RoutingClass::FederationInternal;
    }
    if subject.category_path() == "channel.ack" {
        // Read receipts must never leak to co-members (Open Question B):
        // routed only to the acking user's own sessions, not the channel,
        // and not even to guild/DM peers the way plain UserScoped events are.
        return RoutingClass::SelfScoped;
    }
    match subject.category() {
        "message" | "channel" | "voice" | "poll" | "automod" => RoutingClass::ChannelScoped,
        "guild" => RoutingClass::GuildScoped,
        "presence" => RoutingClass::PresenceExpanded,
        "user" if subject.category_path().starts_with("user.relationship_") => {
            RoutingClass::UserRelationship
        }
        "user" => RoutingClass::UserScoped,
        "call" if subject.category_path() == "call.ring" => RoutingClass::CallRing,
        "announcement" => RoutingClass::Broadcast,
        _ => RoutingClass::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_subject() {
        let s = Subject::parse("amityvox.message.create").unwrap();
        assert_eq!(s.namespace(), "amityvox");
        assert_eq!(s.category(), "message");
        assert_eq!(s.category_path(), "message.create");
    }

    #[test]
    fn rejects_empty_uppercase_and_short_subjects() {
        assert_eq!(Subject::parse(""), Err(SubjectError::Empty));
        assert_eq!(
            Subject::parse("amityvox.Message.Create"),
            Err(SubjectError::NotLowercase)
        );
        assert_eq!(Subject::parse("amityvox"), Err(SubjectError::TooFewSegments));
        assert_eq!(
            Subject::parse("amityvox..create"),
            Err(SubjectError::EmptySegment)
        );
    }

    #[test]
    fn classifies_reserved_categories() {
        let message = Subject::parse("amityvox.message.create").unwrap();
        assert_eq!(classify(&message), RoutingClass::ChannelScoped);

        let guild = Subject::parse("amityvox.guild.update").unwrap();
        assert_eq!(classify(&guild), RoutingClass::GuildScoped);

        let presence = Subject::parse("amityvox.presence.update").unwrap();
        assert_eq!(classify(&presence), RoutingClass::PresenceExpanded);

        let relationship = Subject::parse("amityvox.user.relationship_add").unwrap();
        assert_eq!(classify(&relationship), RoutingClass::UserRelationship);

        let user = Subject::parse("amityvox.user.update").unwrap();
        assert_eq!(classify(&user), RoutingClass::UserScoped);

        let ring = Subject::parse("amityvox.call.ring").unwrap();
        assert_eq!(classify(&ring), RoutingClass::CallRing);

        let announcement = Subject::parse("amityvox.announcement.outage").unwrap();
        assert_eq!(classify(&announcement), RoutingClass::Broadcast);

        let retry = Subject::parse("amityvox.federation.retry").unwrap();
        assert_eq!(classify(&retry), RoutingClass::FederationInternal);

        let unknown = Subject::parse("amityvox.widget.spin").unwrap();
        assert_eq!(classify(&unknown), RoutingClass::Unknown);
    }

    #[test]
    fn channel_ack_is_self_scoped_not_channel_scoped() {
        let ack = Subject::parse("amityvox.channel.ack").unwrap();
        assert_eq!(classify(&ack), RoutingClass::SelfScoped);

        let other_channel_action = Subject::parse("amityvox.channel.update").unwrap();
        assert_eq!(classify(&other_channel_action), RoutingClass::ChannelScoped);
    }
}
