use std::{env, fmt, time::Duration};

use crate::error::{DiagnocatError, Result};

pub const DEFAULT_API_URL: &str = "https://app2.diagnocat.ru/partner-api";
pub const DEFAULT_CLIENT_HOST_ID: &str = "dental-clinic-backend";

/// Environment variables read by [DiagnocatConfig::from_env].
pub const ENV_API_URL: &str = "DIAGNOCAT_API_URL";
pub const ENV_API_KEY: &str = "DIAGNOCAT_API_KEY";
pub const ENV_EMAIL: &str = "DIAGNOCAT_EMAIL";
pub const ENV_PASSWORD: &str = "DIAGNOCAT_PASSWORD";
pub const ENV_CLIENT_HOST_ID: &str = "DIAGNOCAT_CLIENT_HOST_ID";

/// Bounds of the session polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        PollConfig {
            max_attempts: 180,
            interval: Duration::from_secs(2),
        }
    }
}

/// Everything needed to talk to a Diagnocat environment.
///
/// Either `api_key` or both `email` and `password` must be set for authenticated
/// calls to succeed. With an API key the email/password pair is ignored.
#[derive(Clone)]
pub struct DiagnocatConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub email: Option<String>,
    pub password: Option<String>,
    pub client_host_id: String,
    /// Timeout of metadata calls. The payload upload never uses it.
    pub request_timeout: Duration,
    pub poll: PollConfig,
}

impl fmt::Debug for DiagnocatConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiagnocatConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("email", &self.email)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("client_host_id", &self.client_host_id)
            .field("request_timeout", &self.request_timeout)
            .field("poll", &self.poll)
            .finish()
    }
}

impl Default for DiagnocatConfig {
    fn default() -> Self {
        DiagnocatConfig {
            base_url: DEFAULT_API_URL.to_string(),
            api_key: None,
            email: None,
            password: None,
            client_host_id: DEFAULT_CLIENT_HOST_ID.to_string(),
            request_timeout: Duration::from_secs(30),
            poll: PollConfig::default(),
        }
    }
}

impl DiagnocatConfig {
    /// Reads the configuration from the `DIAGNOCAT_*` environment variables.
    ///
    /// Unset or blank variables fall back to the defaults: the production API
    /// URL, the default client host id and no credentials.
    ///
    /// # Returns
    ///
    /// * A DiagnocatConfig with the default timeouts and poll budget.
    pub fn from_env() -> Self {
        DiagnocatConfig {
            base_url: non_empty_var(ENV_API_URL).unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            api_key: non_empty_var(ENV_API_KEY),
            email: non_empty_var(ENV_EMAIL),
            password: non_empty_var(ENV_PASSWORD),
            client_host_id: non_empty_var(ENV_CLIENT_HOST_ID)
                .unwrap_or_else(|| DEFAULT_CLIENT_HOST_ID.to_string()),
            ..Default::default()
        }
    }

    /// Points the client at another environment, e.g. a staging or mock server.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Authenticates every call with a static API key.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Authenticates with a user token issued for this account.
    pub fn with_credentials(mut self, email: impl Into<String>, password: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_poll(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    /// Base URL without a trailing slash, so paths can be appended verbatim.
    pub fn api_url(&self) -> Result<String> {
        let url = self.base_url.trim_end_matches('/');
        if url.is_empty() {
            return Err(DiagnocatError::Config("the API URL is empty".to_string()));
        }
        Ok(url.to_string())
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}
