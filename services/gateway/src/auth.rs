use axum::http::HeaderMap;

/// Resume credentials are opaque strings bound to a session id, minted by
/// the Session Manager at accept and never persisted -- unlike account
/// tokens, they live only in the session registry's grace window.
pub fn new_session_token() -> String {
    use base64::Engine;
    use rand::RngCore;
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

pub fn extract_bearer(authorization: &str) -> Option<&str> {
    authorization.strip_prefix("Bearer ")
}

pub fn extract_token_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(extract_bearer)
        .map(ToOwned::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_token_from_headers_handles_missing_malformed_and_valid_bearer() {
        let missing = HeaderMap::new();
        assert_eq!(extract_token_from_headers(&missing), None);

        let mut malformed = HeaderMap::new();
        malformed.insert(
            "authorization",
            axum::http::HeaderValue::from_static("Basic abc123"),
        );
        assert_eq!(extract_token_from_headers(&malformed), None);

        let mut valid = HeaderMap::new();
        valid.insert(
            "authorization",
            axum::http::HeaderValue::from_static("Bearer token-123"),
        );
        assert_eq!(
            extract_token_from_headers(&valid),
            Some("token-123".to_owned())
        );
    }

    #[test]
    fn session_tokens_are_unique_and_url_safe() {
        let a = new_session_token();
        let b = new_session_token();
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }
}
