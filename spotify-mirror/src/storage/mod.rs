mod token_cache;

use serde::{Deserialize, Serialize};
use spotify_core::OAuthToken;

pub(crate) use token_cache::restrict_permissions;
pub use token_cache::{TokenCache, TokenCacheError};

/// Persisted OAuth credentials. `expires_at` is a unix timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthState {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
}

impl OAuthState {
    pub fn from_oauth_token(token: &OAuthToken) -> Self {
        Self::from_oauth_token_at(token, crate::sync::model::now_unix())
    }

    fn from_oauth_token_at(token: &OAuthToken, now: i64) -> Self {
        Self {
            access_token: token.access_token.clone(),
            refresh_token: token.refresh_token.clone(),
            expires_at: token
                .expires_in
                .map(|secs| now.saturating_add(i64::try_from(secs).unwrap_or(i64::MAX))),
            scope: token.scope.clone(),
            token_type: Some(token.token_type.clone()),
        }
    }

    /// A state for a token handed in from outside; never refreshed.
    pub fn static_token(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            expires_at: None,
            scope: None,
            token_type: Some("Bearer".into()),
        }
    }
}
