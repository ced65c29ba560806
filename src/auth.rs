//! Shared-key authentication for the terminal endpoints.
//!
//! The WebSocket handshake accepts the credential from two places, checked
//! in order: the `Authorization: Key <K>` header, then the `?key=<K>` query
//! parameter. The query fallback exists because browsers cannot set
//! arbitrary headers on WebSocket upgrade requests. Debug builds also accept
//! a built-in development key so a locally built host works out of the box.

/// Scheme expected in the `Authorization` header.
const KEY_SCHEME: &str = "Key ";

/// Well-known key accepted by debug builds only. Release builds compile this
/// acceptance path out entirely.
#[cfg(debug_assertions)]
pub const DEV_FALLBACK_KEY: &str = "hydrogen-dev";

/// Validate a WebSocket handshake credential.
///
/// The first source that yields a credential is authoritative: a present
/// `Key`-scheme header wins over the query parameter. No credential at all
/// is a refusal.
pub fn handshake_key_valid(
    expected: &str,
    authorization: Option<&str>,
    query_key: Option<&str>,
) -> bool {
    let header_key = authorization.and_then(|h| h.strip_prefix(KEY_SCHEME));
    let Some(candidate) = header_key.or(query_key) else {
        return false;
    };
    if constant_time_eq(expected.as_bytes(), candidate.as_bytes()) {
        return true;
    }
    #[cfg(debug_assertions)]
    if constant_time_eq(DEV_FALLBACK_KEY.as_bytes(), candidate.as_bytes()) {
        return true;
    }
    false
}

/// Constant-time byte comparison to prevent timing side-channel attacks.
///
/// Always iterates over the full length of `expected` regardless of
/// `provided` length, so an attacker cannot determine the key length from
/// response times.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for i in 0..expected.len() {
        let p = if i < provided.len() {
            provided[i]
        } else {
            0xff
        };
        diff |= expected[i] ^ p;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_keys_match() {
        assert!(constant_time_eq(b"secret-key", b"secret-key"));
    }

    #[test]
    fn different_keys_do_not_match() {
        assert!(!constant_time_eq(b"secret-key", b"secret-kez"));
        assert!(!constant_time_eq(b"secret-key", b"secret"));
        assert!(!constant_time_eq(b"secret-key", b"secret-key-longer"));
        assert!(!constant_time_eq(b"secret-key", b""));
    }

    #[test]
    fn empty_expected_only_matches_empty() {
        assert!(constant_time_eq(b"", b""));
        assert!(!constant_time_eq(b"", b"x"));
    }

    #[test]
    fn header_credential_is_accepted() {
        assert!(handshake_key_valid("K", Some("Key K"), None));
    }

    #[test]
    fn header_credential_wins_over_the_query() {
        // A wrong header key is a refusal even with a valid query key
        assert!(!handshake_key_valid("K", Some("Key WRONG"), Some("K")));
    }

    #[test]
    fn query_credential_is_the_fallback() {
        assert!(handshake_key_valid("K", None, Some("K")));
        assert!(!handshake_key_valid("K", None, Some("WRONG")));
        // A non-Key authorization scheme is not a credential
        assert!(handshake_key_valid("K", Some("Bearer K"), Some("K")));
    }

    #[test]
    fn missing_credential_is_refused() {
        assert!(!handshake_key_valid("K", None, None));
    }

    #[cfg(debug_assertions)]
    #[test]
    fn dev_fallback_key_is_accepted_in_debug_builds() {
        assert!(handshake_key_valid("K", None, Some(DEV_FALLBACK_KEY)));
    }
}
