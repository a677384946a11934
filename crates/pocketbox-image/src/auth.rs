//! Registry bearer-token authentication.
//!
//! Reference: <https://docs.docker.com/registry/spec/auth/token/>

use std::sync::{Arc, LazyLock};

use chrono::Utc;
use pocketbox_common::constants::DEFAULT_TOKEN_LIFETIME;
use pocketbox_common::error::{PocketboxError, Result};
use pocketbox_common::records::AuthToken;
use pocketbox_common::store::MetadataStore;
use regex::Regex;
use serde::Deserialize;

static CHALLENGE_SCHEME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?i:bearer)\s+").unwrap_or_else(|_| unreachable!("static regex"))
});

static CHALLENGE_PARAM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?P<key>[A-Za-z_]+)\s*=\s*"(?P<value>[^"]*)""#)
        .unwrap_or_else(|_| unreachable!("static regex"))
});

/// A parsed `WWW-Authenticate: Bearer ...` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    /// Token endpoint.
    pub realm: String,
    /// Service name, empty when the registry omitted it.
    pub service: String,
}

impl AuthChallenge {
    /// Parses a `WWW-Authenticate` header value.
    ///
    /// Parameters may appear in any order; `realm` is required and `service`
    /// defaults to the empty string.
    ///
    /// # Errors
    ///
    /// Returns [`PocketboxError::Integrity`] if the scheme is not `Bearer` or
    /// the realm is missing.
    pub fn parse(header: &str) -> Result<Self> {
        let unsupported = || PocketboxError::Integrity {
            message: format!("unsupported WWW-Authenticate challenge: {header}"),
        };
        let scheme = CHALLENGE_SCHEME.find(header).ok_or_else(unsupported)?;
        let params = &header[scheme.end()..];

        let mut realm = None;
        let mut service = String::new();
        for captures in CHALLENGE_PARAM.captures_iter(params) {
            let value = captures["value"].to_string();
            match captures["key"].to_ascii_lowercase().as_str() {
                "realm" => realm = Some(value),
                "service" => service = value,
                _ => {}
            }
        }

        let realm = realm.filter(|r| !r.is_empty()).ok_or_else(unsupported)?;
        Ok(Self { realm, service })
    }

    /// Builds the token request URL granting pull access to `repository`.
    #[must_use]
    pub fn token_url(&self, repository: &str) -> String {
        let separator = if self.realm.contains('?') { '&' } else { '?' };
        format!(
            "{}{separator}service={}&scope=repository:{repository}:pull",
            self.realm, self.service
        )
    }
}

/// Body returned by a token endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    /// Token (Docker Hub field name).
    pub token: Option<String>,
    /// Token (OAuth2 field name).
    pub access_token: Option<String>,
    /// Lifetime in seconds.
    pub expires_in: Option<u64>,
}

impl TokenResponse {
    /// Returns whichever token field the server filled in.
    ///
    /// # Errors
    ///
    /// Returns [`PocketboxError::Integrity`] if neither field is present.
    pub fn into_token(self) -> Result<(String, Option<u64>)> {
        self.token
            .or(self.access_token)
            .filter(|t| !t.is_empty())
            .map(|t| (t, self.expires_in))
            .ok_or_else(|| PocketboxError::Integrity {
                message: "token response carries no token".into(),
            })
    }
}

/// Token cache keyed by the exact token URL, persisted in the metadata store.
#[derive(Clone)]
pub struct TokenCache {
    store: Arc<dyn MetadataStore>,
}

impl std::fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCache").finish_non_exhaustive()
    }
}

impl TokenCache {
    /// Creates a cache on top of `store`.
    #[must_use]
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self { store }
    }

    /// Returns an unexpired token for `auth_url`, purging stale entries first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn get(&self, auth_url: &str) -> Result<Option<String>> {
        let now = Utc::now();
        let purged = self.store.purge_expired_tokens(now)?;
        if purged > 0 {
            tracing::debug!(purged, "purged expired registry tokens");
        }
        Ok(self
            .store
            .get_token(auth_url)?
            .filter(|t| !t.is_expired(now))
            .map(|t| t.token))
    }

    /// Stores a token valid for `expires_in` seconds (60 when unknown).
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn put(&self, auth_url: &str, token: &str, expires_in: Option<u64>) -> Result<()> {
        let lifetime = expires_in.map_or(DEFAULT_TOKEN_LIFETIME, std::time::Duration::from_secs);
        let lifetime = chrono::Duration::from_std(lifetime)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        self.store.put_token(&AuthToken {
            auth_url: auth_url.to_string(),
            token: token.to_string(),
            expires_at: Utc::now() + lifetime,
        })
    }
}

#[cfg(test)]
mod tests {
    use pocketbox_common::store::JsonStore;

    use super::*;

    #[test]
    fn parse_docker_hub_challenge() {
        let challenge = AuthChallenge::parse(
            r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/alpine:pull""#,
        )
        .expect("parse");
        assert_eq!(challenge.realm, "https://auth.docker.io/token");
        assert_eq!(challenge.service, "registry.docker.io");
        assert_eq!(
            challenge.token_url("library/alpine"),
            "https://auth.docker.io/token?service=registry.docker.io&scope=repository:library/alpine:pull"
        );
    }

    #[test]
    fn parse_accepts_any_order_and_missing_service() {
        let challenge =
            AuthChallenge::parse(r#"bearer scope="x", realm="http://127.0.0.1:9/token""#)
                .expect("parse");
        assert_eq!(challenge.realm, "http://127.0.0.1:9/token");
        assert_eq!(challenge.service, "");
    }

    #[test]
    fn parse_rejects_basic_and_missing_realm() {
        assert!(AuthChallenge::parse(r#"Basic realm="registry""#).is_err());
        assert!(AuthChallenge::parse(r#"Bearer service="registry""#).is_err());
        assert!(AuthChallenge::parse("").is_err());
    }

    #[test]
    fn token_response_accepts_either_field() {
        let hub: TokenResponse =
            serde_json::from_str(r#"{"token":"a","expires_in":300}"#).expect("json");
        assert_eq!(hub.into_token().expect("token"), ("a".to_string(), Some(300)));

        let oauth: TokenResponse =
            serde_json::from_str(r#"{"access_token":"b"}"#).expect("json");
        assert_eq!(oauth.into_token().expect("token"), ("b".to_string(), None));

        let empty: TokenResponse = serde_json::from_str("{}").expect("json");
        assert!(empty.into_token().is_err());
    }

    #[test]
    fn cache_returns_fresh_token_and_drops_expired() {
        let store = Arc::new(JsonStore::in_memory());
        let cache = TokenCache::new(store.clone());
        cache.put("https://auth/token?a", "fresh", Some(300)).expect("put");
        assert_eq!(
            cache.get("https://auth/token?a").expect("get").as_deref(),
            Some("fresh")
        );

        store
            .put_token(&AuthToken {
                auth_url: "https://auth/token?b".into(),
                token: "stale".into(),
                expires_at: Utc::now() - chrono::Duration::seconds(5),
            })
            .expect("put");
        assert_eq!(cache.get("https://auth/token?b").expect("get"), None);
        assert!(store.get_token("https://auth/token?b").expect("get").is_none());
    }
}
