//! Cache key layout.
//!
//! Two kinds of keys live under one namespace:
//!
//! ```text
//! {ns}:tok:{token_hash}               hash   session fields (the cache entry)
//! {ns}:idx:{user_id}:{session_id}     string token_hash (secondary index)
//! ```
//!
//! Validation only ever knows the token, so the entry key is derived from the
//! token hash. The index key lets invalidation find entries by session id or
//! by user with a pattern SCAN over index keys only.
//!
//! Ids are stored with `%` and `:` percent-encoded, so an index key splits
//! back into exactly one `(user_id, session_id)` pair.

use std::borrow::Cow;

/// Builder for namespaced session cache keys.
#[derive(Clone, Debug)]
pub struct SessionKeys {
    namespace: String,
}

impl SessionKeys {
    pub fn new(namespace: impl Into<String>) -> Self {
        SessionKeys {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Key of the hash holding the session fields.
    pub fn entry(&self, token_hash: &str) -> String {
        Self::build_composite(&[&self.namespace, "tok", token_hash])
    }

    /// Key of the index entry pointing at a session's token hash.
    pub fn index(&self, user_id: &str, session_id: &str) -> String {
        Self::build_composite(&[
            &self.namespace,
            "idx",
            &encode_id(user_id),
            &encode_id(session_id),
        ])
    }

    /// SCAN pattern matching every index entry of one session.
    pub fn session_pattern(&self, session_id: &str) -> String {
        format!(
            "{}:idx:*:{}",
            escape_glob(&self.namespace),
            escape_glob(&encode_id(session_id))
        )
    }

    /// SCAN pattern matching every index entry of one user.
    pub fn user_pattern(&self, user_id: &str) -> String {
        format!(
            "{}:idx:{}:*",
            escape_glob(&self.namespace),
            escape_glob(&encode_id(user_id))
        )
    }

    /// Build composite key from multiple parts.
    pub fn build_composite(parts: &[&str]) -> String {
        parts.join(":")
    }

    /// Split an index key back into `(user_id, session_id)`.
    pub fn parse_index(&self, key: &str) -> Option<(String, String)> {
        let rest = key.strip_prefix(self.namespace.as_str())?.strip_prefix(":idx:")?;
        let (user_id, session_id) = rest.split_once(':')?;
        if session_id.contains(':') {
            return None;
        }
        Some((decode_id(user_id)?, decode_id(session_id)?))
    }
}

fn encode_id(raw: &str) -> Cow<'_, str> {
    if !raw.contains(['%', ':']) {
        return Cow::Borrowed(raw);
    }
    let mut out = String::with_capacity(raw.len() + 4);
    for c in raw.chars() {
        match c {
            '%' => out.push_str("%25"),
            ':' => out.push_str("%3A"),
            _ => out.push(c),
        }
    }
    Cow::Owned(out)
}

fn decode_id(encoded: &str) -> Option<String> {
    let mut out = String::with_capacity(encoded.len());
    let mut rest = encoded;
    while let Some(at) = rest.find('%') {
        out.push_str(&rest[..at]);
        let escape = rest.get(at..at + 3)?;
        match escape {
            "%25" => out.push('%'),
            "%3A" => out.push(':'),
            _ => return None,
        }
        rest = &rest[at + 3..];
    }
    out.push_str(rest);
    Some(out)
}

/// Escape glob metacharacters so ids are matched literally by SCAN MATCH.
fn escape_glob(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_key() {
        let keys = SessionKeys::new("session");
        assert_eq!(keys.entry("abc123"), "session:tok:abc123");
    }

    #[test]
    fn test_index_key_and_patterns() {
        let keys = SessionKeys::new("session");
        assert_eq!(keys.index("u1", "s1"), "session:idx:u1:s1");
        assert_eq!(keys.user_pattern("u1"), "session:idx:u1:*");
        assert_eq!(keys.session_pattern("s1"), "session:idx:*:s1");
    }

    #[test]
    fn test_colons_in_ids_are_encoded() {
        let keys = SessionKeys::new("session");
        assert_eq!(keys.index("u:1", "s%1"), "session:idx:u%3A1:s%251");
        assert_eq!(keys.session_pattern("x:s1"), "session:idx:*:x%3As1");
        assert_eq!(
            keys.parse_index("session:idx:u%3A1:s%251"),
            Some(("u:1".to_string(), "s%1".to_string()))
        );
    }

    #[test]
    fn test_patterns_escape_glob_characters() {
        let keys = SessionKeys::new("session");
        assert_eq!(keys.user_pattern("a*b"), "session:idx:a\\*b:*");
    }

    #[test]
    fn test_parse_index() {
        let keys = SessionKeys::new("session");
        assert_eq!(
            keys.parse_index("session:idx:u1:s1"),
            Some(("u1".to_string(), "s1".to_string()))
        );
        assert_eq!(keys.parse_index("session:tok:abc"), None);
        assert_eq!(keys.parse_index("other:idx:u1:s1"), None);
        assert_eq!(keys.parse_index("session:idx:u1:x:s1"), None);
        assert_eq!(keys.parse_index("session:idx:u1:s%zz"), None);
    }
}
