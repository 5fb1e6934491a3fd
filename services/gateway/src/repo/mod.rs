pub mod membership;
pub mod tokens;

pub use membership::{ChannelScope, MembershipRepo, PgMembershipRepo};
pub use tokens::{validate_account_token, AccountClaims};
