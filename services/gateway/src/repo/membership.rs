//! Relational-store lookups the Authorization Resolver depends on: the
//! channel→guild/DM mapping, friendship, and guild membership. Queries
//! follow the teacher's direct-`sqlx::query!` style (`repo/events.rs`); the
//! trait boundary is new -- it exists so resolver unit tests can supply a
//! fake without a live Postgres instance, which the teacher's direct-coupled
//! `repo/` modules don't need since they're exercised only via
//! `testcontainers` integration tests.

use std::collections::HashSet;

use async_trait::async_trait;
use sqlx::PgPool;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelScope {
    Guild(String),
    Dm(HashSet<String>),
}

#[async_trait]
pub trait MembershipRepo: Send + Sync {
    async fn channel_to_guild(&self, channel_id: &str) -> Result<ChannelScope, sqlx::Error>;
    async fn guilds_of(&self, user_id: &str) -> Result<HashSet<String>, sqlx::Error>;
    async fn dm_channels_of(&self, user_id: &str) -> Result<HashSet<String>, sqlx::Error>;
    async fn friends_of(&self, user_id: &str) -> Result<HashSet<String>, sqlx::Error>;
    async fn guild_members(&self, guild_id: &str) -> Result<HashSet<String>, sqlx::Error>;
}

pub struct PgMembershipRepo {
    pool: PgPool,
}

impl PgMembershipRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MembershipRepo for PgMembershipRepo {
    async fn channel_to_guild(&self, channel_id: &str) -> Result<ChannelScope, sqlx::Error> {
        let row = sqlx::query!(
            r#"SELECT guild_id FROM channels WHERE channel_id = $1"#,
            channel_id
        )
        .fetch_one(&self.pool)
        .await?;

        match row.guild_id {
            Some(guild_id) => Ok(ChannelScope::Guild(guild_id)),
            None => {
                let recipients = sqlx::query!(
                    r#"SELECT user_id FROM dm_recipients WHERE channel_id = $1"#,
                    channel_id
                )
                .fetch_all(&self.pool)
                .await?
                .into_iter()
                .map(|r| r.user_id)
                .collect();
                Ok(ChannelScope::Dm(recipients))
            }
        }
    }

    async fn guilds_of(&self, user_id: &str) -> Result<HashSet<String>, sqlx::Error> {
        let rows = sqlx::query!(
            r#"SELECT guild_id FROM guild_members WHERE user_id = $1"#,
            user_id
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.guild_id).collect())
    }

    async fn dm_channels_of(&self, user_id: &str) -> Result<HashSet<String>, sqlx::Error> {
        let rows = sqlx::query!(
            r#"SELECT channel_id FROM dm_recipients WHERE user_id = $1"#,
            user_id
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.channel_id).collect())
    }

    async fn friends_of(&self, user_id: &str) -> Result<HashSet<String>, sqlx::Error> {
        let rows = sqlx::query!(
            r#"SELECT CASE WHEN user_a = $1 THEN user_b ELSE user_a END AS "friend!"
               FROM friendships WHERE user_a = $1 OR user_b = $1"#,
            user_id
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.friend).collect())
    }

    async fn guild_members(&self, guild_id: &str) -> Result<HashSet<String>, sqlx::Error> {
        let rows = sqlx::query!(
            r#"SELECT user_id FROM guild_members WHERE guild_id = $1"#,
            guild_id
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.user_id).collect())
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::RwLock;

    /// In-memory `MembershipRepo` for resolver unit tests -- no Postgres
    /// required.
    #[derive(Default)]
    pub struct FakeMembershipRepo {
        pub channels: RwLock<HashMap<String, ChannelScope>>,
        pub guilds: RwLock<HashMap<String, HashSet<String>>>,
        pub dm_channels: RwLock<HashMap<String, HashSet<String>>>,
        pub friends: RwLock<HashMap<String, HashSet<String>>>,
        pub guild_members_map: RwLock<HashMap<String, HashSet<String>>>,
    }

    #[async_trait]
    impl MembershipRepo for FakeMembershipRepo {
        async fn channel_to_guild(&self, channel_id: &str) -> Result<ChannelScope, sqlx::Error> {
            self.channels
                .read()
                .await
                .get(channel_id)
                .cloned()
                .ok_or(sqlx::Error::RowNotFound)
        }

        async fn guilds_of(&self, user_id: &str) -> Result<HashSet<String>, sqlx::Error> {
            Ok(self.guilds.read().await.get(user_id).cloned().unwrap_or_default())
        }

        async fn dm_channels_of(&self, user_id: &str) -> Result<HashSet<String>, sqlx::Error> {
            Ok(self
                .dm_channels
                .read()
                .await
                .get(user_id)
                .cloned()
                .unwrap_or_default())
        }

        async fn friends_of(&self, user_id: &str) -> Result<HashSet<String>, sqlx::Error> {
            Ok(self.friends.read().await.get(user_id).cloned().unwrap_or_default())
        }

        async fn guild_members(&self, guild_id: &str) -> Result<HashSet<String>, sqlx::Error> {
            Ok(self
                .guild_members_map
                .read()
                .await
                .get(guild_id)
                .cloned()
                .unwrap_or_default())
        }
    }
}
