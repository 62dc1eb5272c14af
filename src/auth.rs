use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use chrono::{DateTime, Duration, Utc};
use reqwest::{header, Client};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::{
    config::DiagnocatConfig,
    error::{DiagnocatError, Result},
};

/// Lifetime given to an issued user token.
pub const TOKEN_TTL_HOURS: i64 = 23;

#[derive(Clone)]
pub struct Credential {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

impl Credential {
    /// True while the token is non-empty and not expired.
    pub fn is_valid(&self) -> bool {
        !self.token.is_empty() && Utc::now() < self.expires_at
    }
}

enum AuthMode {
    ApiKey(String),
    Password { email: String, password: String },
    Unconfigured,
}

impl fmt::Debug for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMode::ApiKey(_) => f.write_str("ApiKey(..)"),
            AuthMode::Password { email, .. } => write!(f, "Password({})", email),
            AuthMode::Unconfigured => f.write_str("Unconfigured"),
        }
    }
}

#[derive(Serialize)]
struct AuthTokenRequest<'a> {
    client_host_id: &'a str,
    email: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct AuthTokenResponse {
    #[serde(default)]
    token: String,
}

/// Source of the `Authorization` header for every call.
///
/// With a static API key the header is built on each call. Otherwise a user
/// token is issued from email/password and reused until it expires. A stale
/// cache is refreshed under the write lock, so concurrent callers share a
/// single issuance request, and its error when it fails.
#[derive(Debug)]
pub struct CredentialCache {
    mode: AuthMode,
    token_url: String,
    client_host_id: String,
    ttl: Duration,
    http: Client,
    state: RwLock<TokenState>,
    /// Finished issuance attempts. Read before locking, so a caller that queued
    /// behind a failed issuance shares its error instead of retrying at once.
    issued: AtomicU64,
}

#[derive(Debug, Default)]
struct TokenState {
    credential: Option<Credential>,
    last_error: Option<String>,
}

impl TokenState {
    fn valid_token(&self) -> Option<String> {
        self.credential
            .as_ref()
            .filter(|credential| credential.is_valid())
            .map(|credential| credential.token.clone())
    }
}

impl CredentialCache {
    /// Picks the API key when one is configured, the email/password pair otherwise.
    pub fn new(config: &DiagnocatConfig, http: Client) -> Result<Self> {
        let mode = match (&config.api_key, &config.email, &config.password) {
            (Some(key), _, _) => AuthMode::ApiKey(key.clone()),
            (None, Some(email), Some(password)) => AuthMode::Password {
                email: email.clone(),
                password: password.clone(),
            },
            _ => AuthMode::Unconfigured,
        };

        Ok(CredentialCache {
            mode,
            token_url: format!("{}/v2/auth/token", config.api_url()?),
            client_host_id: config.client_host_id.clone(),
            ttl: Duration::hours(TOKEN_TTL_HOURS),
            http,
            state: RwLock::new(TokenState::default()),
            issued: AtomicU64::new(0),
        })
    }

    /// Overrides the lifetime of issued tokens.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Whether an API key or an email/password pair is available.
    pub fn is_configured(&self) -> bool {
        !matches!(self.mode, AuthMode::Unconfigured)
    }

    /// Headers for a JSON call to the API.
    pub async fn auth_headers(&self) -> Result<header::HeaderMap> {
        let token = match &self.mode {
            AuthMode::ApiKey(key) => key.clone(),
            AuthMode::Password { email, password } => self.user_token(email, password).await?,
            AuthMode::Unconfigured => {
                return Err(DiagnocatError::Auth(
                    "neither an API key nor email/password are configured".to_string(),
                ))
            }
        };

        let mut headers = header::HeaderMap::new();
        let mut auth = header::HeaderValue::from_str(&format!("Bearer {}", token))?;
        auth.set_sensitive(true);
        headers.insert(header::AUTHORIZATION, auth);
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static("application/json"),
        );
        Ok(headers)
    }

    async fn user_token(&self, email: &str, password: &str) -> Result<String> {
        let seen = self.issued.load(Ordering::Acquire);
        if let Some(token) = self.state.read().await.valid_token() {
            return Ok(token);
        }

        let mut state = self.state.write().await;

        // Another caller may have refreshed while we waited for the lock.
        if let Some(token) = state.valid_token() {
            return Ok(token);
        }
        if self.issued.load(Ordering::Acquire) != seen {
            if let Some(message) = &state.last_error {
                return Err(DiagnocatError::Auth(message.clone()));
            }
        }

        info!("Authenticating with Diagnocat as {}", email);
        let issued = self.issue(email, password).await;
        self.issued.fetch_add(1, Ordering::Release);
        match issued {
            Ok(credential) => {
                let token = credential.token.clone();
                state.credential = Some(credential);
                state.last_error = None;
                debug!("Diagnocat user token cached");
                Ok(token)
            }
            Err(e) => {
                state.last_error = Some(match &e {
                    DiagnocatError::Auth(message) => message.clone(),
                    other => other.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn issue(&self, email: &str, password: &str) -> Result<Credential> {
        let body = AuthTokenRequest {
            client_host_id: &self.client_host_id,
            email,
            password,
        };

        let response = self
            .http
            .post(&self.token_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| DiagnocatError::Auth(format!("token request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(DiagnocatError::Auth(format!(
                "token request returned {}: {}",
                status, text
            )));
        }

        let parsed: AuthTokenResponse = response
            .json()
            .await
            .map_err(|e| DiagnocatError::Auth(format!("invalid token response: {}", e)))?;
        if parsed.token.is_empty() {
            return Err(DiagnocatError::Auth(
                "token missing in response".to_string(),
            ));
        }

        Ok(Credential {
            token: parsed.token,
            expires_at: Utc::now() + self.ttl,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration as StdDuration};

    use futures_util::future::join_all;
    use wiremock::{
        matchers::{body_json, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;

    fn password_config(server: &MockServer) -> DiagnocatConfig {
        DiagnocatConfig::default()
            .with_base_url(server.uri())
            .with_credentials("doc@clinic.test", "secret")
    }

    fn bearer(headers: &header::HeaderMap) -> &str {
        headers[header::AUTHORIZATION].to_str().unwrap()
    }

    #[tokio::test]
    async fn api_key_needs_no_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let config = DiagnocatConfig::default()
            .with_base_url(server.uri())
            .with_api_key("static-key");
        let cache = CredentialCache::new(&config, Client::new()).unwrap();

        let headers = cache.auth_headers().await.unwrap();
        assert_eq!(bearer(&headers), "Bearer static-key");
    }

    #[tokio::test]
    async fn token_is_reused_within_validity() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/auth/token"))
            .and(body_json(serde_json::json!({
                "client_host_id": "dental-clinic-backend",
                "email": "doc@clinic.test",
                "password": "secret",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"token": "t-1"})))
            .expect(1)
            .mount(&server)
            .await;

        let cache = CredentialCache::new(&password_config(&server), Client::new()).unwrap();

        let first = cache.auth_headers().await.unwrap();
        let second = cache.auth_headers().await.unwrap();
        assert_eq!(bearer(&first), "Bearer t-1");
        assert_eq!(bearer(&second), "Bearer t-1");
    }

    #[tokio::test]
    async fn concurrent_refresh_is_single_flight() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/auth/token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"token": "shared"}))
                    .set_delay(StdDuration::from_millis(100)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let cache = Arc::new(CredentialCache::new(&password_config(&server), Client::new()).unwrap());

        let handles = (0..8).map(|_| {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.auth_headers().await })
        });
        let results = join_all(handles).await;

        for result in results {
            let headers = result.unwrap().unwrap();
            assert_eq!(bearer(&headers), "Bearer shared");
        }
    }

    #[tokio::test]
    async fn concurrent_callers_share_a_failed_issuance() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/auth/token"))
            .respond_with(
                ResponseTemplate::new(500)
                    .set_body_string("auth backend down")
                    .set_delay(StdDuration::from_millis(100)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let cache = Arc::new(CredentialCache::new(&password_config(&server), Client::new()).unwrap());

        let handles = (0..8).map(|_| {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.auth_headers().await })
        });
        let results = join_all(handles).await;

        for result in results {
            match result.unwrap() {
                Err(DiagnocatError::Auth(msg)) => assert!(msg.contains("auth backend down")),
                other => panic!("expected an auth error, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn expired_token_is_refreshed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/auth/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"token": "short"})))
            .expect(2)
            .mount(&server)
            .await;

        let cache = CredentialCache::new(&password_config(&server), Client::new())
            .unwrap()
            .with_ttl(Duration::zero());

        cache.auth_headers().await.unwrap();
        cache.auth_headers().await.unwrap();
    }

    #[tokio::test]
    async fn unconfigured_credentials_fail() {
        let cache = CredentialCache::new(&DiagnocatConfig::default(), Client::new()).unwrap();
        assert!(!cache.is_configured());
        assert!(matches!(
            cache.auth_headers().await,
            Err(DiagnocatError::Auth(_))
        ));
    }

    #[tokio::test]
    async fn rejected_or_empty_token_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/auth/token"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad password"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v2/auth/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"token": ""})))
            .mount(&server)
            .await;

        let cache = CredentialCache::new(&password_config(&server), Client::new()).unwrap();

        match cache.auth_headers().await {
            Err(DiagnocatError::Auth(msg)) => assert!(msg.contains("bad password")),
            other => panic!("expected an auth error, got {:?}", other),
        }
        assert!(matches!(
            cache.auth_headers().await,
            Err(DiagnocatError::Auth(_))
        ));
    }
}
