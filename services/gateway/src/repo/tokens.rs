use sha2::{Digest, Sha256};
use sqlx::PgPool;

pub struct AccountClaims {
    pub account_id: String,
}

/// Token lookup by SHA-256 hash, grounded in the teacher's `auth.rs`
/// device-token lookup, generalized from device tokens to account session
/// tokens (authentication token minting itself stays out of scope).
pub async fn validate_account_token(pool: &PgPool, raw_token: &str) -> Option<AccountClaims> {
    let hash = Sha256::digest(raw_token.as_bytes());
    let hash_bytes = hash.as_slice().to_vec();
    let row = sqlx::query!(
        r#"SELECT account_id
           FROM account_tokens
           WHERE token_hash = $1
             AND revoked_at IS NULL"#,
        hash_bytes.as_slice()
    )
    .fetch_optional(pool)
    .await
    .ok()??;
    Some(AccountClaims {
        account_id: row.account_id,
    })
}
