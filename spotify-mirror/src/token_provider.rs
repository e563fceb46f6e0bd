use spotify_core::OAuthClient;
use thiserror::Error;

use crate::storage::{OAuthState, TokenCache, TokenCacheError};
use crate::sync::model::now_unix;

#[derive(Debug, Error)]
pub enum TokenProviderError {
    #[error("oauth client is required to refresh expired token")]
    MissingOAuthClient,
    #[error("refresh token is missing")]
    MissingRefreshToken,
    #[error("oauth refresh failed: {0}")]
    OAuth(#[from] spotify_core::OAuthError),
    #[error("failed to persist refreshed token: {0}")]
    Cache(#[from] TokenCacheError),
}

pub struct TokenProvider {
    state: OAuthState,
    oauth_client: Option<OAuthClient>,
    cache: Option<TokenCache>,
    refresh_skew_secs: i64,
}

impl TokenProvider {
    pub fn new(state: OAuthState, oauth_client: Option<OAuthClient>) -> Self {
        Self {
            state,
            oauth_client,
            cache: None,
            refresh_skew_secs: 60,
        }
    }

    /// Refreshed tokens are written back to `cache`.
    pub fn with_cache(mut self, cache: TokenCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub async fn valid_access_token(&mut self) -> Result<String, TokenProviderError> {
        if self.should_refresh() {
            self.refresh().await?;
        }
        Ok(self.state.access_token.clone())
    }

    pub fn state(&self) -> &OAuthState {
        &self.state
    }

    pub async fn refresh_now(&mut self) -> Result<String, TokenProviderError> {
        self.refresh().await?;
        Ok(self.state.access_token.clone())
    }

    fn should_refresh(&self) -> bool {
        let Some(expires_at) = self.state.expires_at else {
            return false;
        };
        expires_at <= now_unix().saturating_add(self.refresh_skew_secs)
    }

    async fn refresh(&mut self) -> Result<(), TokenProviderError> {
        let refresh_token = self
            .state
            .refresh_token
            .clone()
            .ok_or(TokenProviderError::MissingRefreshToken)?;
        let client = self
            .oauth_client
            .as_ref()
            .ok_or(TokenProviderError::MissingOAuthClient)?;
        let token = client.refresh_token(&refresh_token).await?;
        let mut refreshed = OAuthState::from_oauth_token(&token);
        // The token endpoint may omit fields that stay valid across a refresh.
        if refreshed.refresh_token.is_none() {
            refreshed.refresh_token = Some(refresh_token);
        }
        if refreshed.scope.is_none() {
            refreshed.scope = self.state.scope.clone();
        }
        if refreshed.token_type.is_none() {
            refreshed.token_type = self.state.token_type.clone();
        }
        if let Some(cache) = &self.cache {
            cache.save(&refreshed).await?;
        }
        tracing::debug!(expires_at = ?refreshed.expires_at, "access token refreshed");
        self.state = refreshed;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn expired_state(refresh_token: Option<&str>) -> OAuthState {
        OAuthState {
            access_token: "old-token".into(),
            refresh_token: refresh_token.map(str::to_string),
            expires_at: Some(0),
            scope: Some("user-library-read".into()),
            token_type: Some("Bearer".into()),
        }
    }

    async fn token_server(refresh_in_response: bool) -> MockServer {
        let server = MockServer::start().await;
        let mut body = json!({
            "access_token": "new-token",
            "token_type": "Bearer",
            "expires_in": 3600
        });
        if refresh_in_response {
            body["refresh_token"] = json!("refresh-2");
        }
        Mock::given(method("POST"))
            .and(path("/api/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=refresh-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn returns_current_token_when_not_expired() {
        let mut provider = TokenProvider::new(
            OAuthState {
                access_token: "token-1".into(),
                refresh_token: Some("refresh-1".into()),
                expires_at: Some(i64::MAX),
                scope: None,
                token_type: Some("Bearer".into()),
            },
            None,
        );

        let token = provider
            .valid_access_token()
            .await
            .expect("token should be valid");
        assert_eq!(token, "token-1");
    }

    #[tokio::test]
    async fn token_without_expiry_is_never_refreshed() {
        let mut provider = TokenProvider::new(OAuthState::static_token("fixed"), None);
        assert_eq!(provider.valid_access_token().await.unwrap(), "fixed");
    }

    #[tokio::test]
    async fn refreshes_token_when_expired() {
        let server = token_server(true).await;
        let oauth_client = OAuthClient::with_base_url(&server.uri(), "client-id", "secret")
            .expect("oauth client should be built");
        let mut provider = TokenProvider::new(expired_state(Some("refresh-1")), Some(oauth_client));

        let token = provider
            .valid_access_token()
            .await
            .expect("token should refresh");
        assert_eq!(token, "new-token");
        assert_eq!(provider.state().refresh_token.as_deref(), Some("refresh-2"));
        assert!(provider.state().expires_at.unwrap() > now_unix());
    }

    #[tokio::test]
    async fn refresh_keeps_old_refresh_token_and_persists() {
        let server = token_server(false).await;
        let dir = tempfile::tempdir().unwrap();
        let cache = TokenCache::new(dir.path().join("auth-cache.json"));
        let oauth_client = OAuthClient::with_base_url(&server.uri(), "client-id", "secret").unwrap();
        let mut provider = TokenProvider::new(expired_state(Some("refresh-1")), Some(oauth_client))
            .with_cache(cache.clone());

        provider.refresh_now().await.unwrap();

        let saved = cache.load().await.unwrap().expect("cache should be written");
        assert_eq!(saved.access_token, "new-token");
        assert_eq!(saved.refresh_token.as_deref(), Some("refresh-1"));
        assert_eq!(saved.scope.as_deref(), Some("user-library-read"));
    }

    #[tokio::test]
    async fn returns_error_when_expired_and_no_refresh_token() {
        let mut provider = TokenProvider::new(expired_state(None), None);

        let err = provider
            .valid_access_token()
            .await
            .expect_err("expected missing refresh token error");
        assert!(matches!(err, TokenProviderError::MissingRefreshToken));
    }

    #[tokio::test]
    async fn returns_error_when_expired_without_oauth_client() {
        let mut provider = TokenProvider::new(expired_state(Some("refresh-1")), None);

        let err = provider
            .valid_access_token()
            .await
            .expect_err("expected missing client error");
        assert!(matches!(err, TokenProviderError::MissingOAuthClient));
    }
}
