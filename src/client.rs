use std::{future::Future, sync::Arc};

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::{
    auth::CredentialCache,
    config::{DiagnocatConfig, PollConfig},
    error::{DiagnocatError, Result, Stage},
};

/// Handle on one Diagnocat environment.
///
/// Metadata calls share a client bounded by the configured request timeout.
/// Payload uploads go through a second client without any timeout, since a
/// large archive can legitimately take minutes.
#[derive(Debug, Clone)]
pub struct DiagnocatClient {
    pub(crate) api_url: String,
    pub(crate) http: Client,
    pub(crate) upload_http: Client,
    pub(crate) credentials: Arc<CredentialCache>,
    pub(crate) poll: PollConfig,
}

/// A decoded JSON answer, with the raw body kept for diagnostics.
pub(crate) struct JsonReply<T> {
    pub status: StatusCode,
    pub body: String,
    pub value: T,
}

impl DiagnocatClient {
    /// Builds a client with its own credential cache.
    ///
    /// # Arguments
    ///
    /// * `config` - Environment, credentials and timeouts to use.
    ///
    /// # Returns
    ///
    /// * A Result wrapping the client, or a Config error if the API URL is empty
    /// or an HTTP client cannot be built.
    pub fn new(config: &DiagnocatConfig) -> Result<Self> {
        let http = build_http(config)?;
        let credentials = Arc::new(CredentialCache::new(config, http.clone())?);
        Self::with_credentials(config, credentials)
    }

    /// Builds a client on top of a credential cache shared with other clients.
    pub fn with_credentials(
        config: &DiagnocatConfig,
        credentials: Arc<CredentialCache>,
    ) -> Result<Self> {
        let upload_http = Client::builder().build().map_err(|e| {
            DiagnocatError::Config(format!("failed to build the upload HTTP client: {}", e))
        })?;

        Ok(DiagnocatClient {
            api_url: config.api_url()?,
            http: build_http(config)?,
            upload_http,
            credentials,
            poll: config.poll,
        })
    }

    /// Base URL every API path is appended to.
    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// The credential cache, to share it with another client.
    pub fn credentials(&self) -> &Arc<CredentialCache> {
        &self.credentials
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_url, path)
    }

    /// Attaches the auth headers and sends. A request that never gets an answer
    /// fails the stage.
    pub(crate) async fn send(&self, stage: Stage, request: RequestBuilder) -> Result<Response> {
        let headers = self.credentials.auth_headers().await?;
        dispatch(stage, request.headers(headers)).await
    }
}

pub(crate) async fn dispatch(stage: Stage, request: RequestBuilder) -> Result<Response> {
    request
        .send()
        .await
        .map_err(|e| DiagnocatError::transport(stage, e))
}

fn build_http(config: &DiagnocatConfig) -> Result<Client> {
    Client::builder()
        .timeout(config.request_timeout)
        .build()
        .map_err(|e| DiagnocatError::Config(format!("failed to build the HTTP client: {}", e)))
}

/// Reads the body and decodes it, as long as the status is one of `accepted`.
pub(crate) async fn read_json<T: DeserializeOwned>(
    stage: Stage,
    response: Response,
    accepted: &[StatusCode],
) -> Result<JsonReply<T>> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| DiagnocatError::transport(stage, e))?;

    if !accepted.contains(&status) {
        return Err(DiagnocatError::stage(stage, status, body));
    }

    match serde_json::from_str(&body) {
        Ok(value) => Ok(JsonReply {
            status,
            body,
            value,
        }),
        Err(e) => Err(DiagnocatError::stage(
            stage,
            status,
            format!("undecodable response ({}): {}", e, body),
        )),
    }
}

/// Resolves to [DiagnocatError::Cancelled] as soon as `cancel` fires, dropping
/// whatever `fut` was doing.
pub(crate) async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(DiagnocatError::Cancelled),
        result = fut => result,
    }
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use wiremock::{
        matchers::{header, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::{test_support::client, *};

    #[tokio::test]
    async fn send_attaches_bearer_header() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ping"))
            .and(header("authorization", "Bearer test-key"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = client(&server);
        let response = client
            .send(Stage::CheckConnection, client.http.get(client.url("/ping")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn read_json_rejects_unexpected_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502).set_body_string("upstream down"))
            .mount(&server)
            .await;

        let client = client(&server);
        let response = client
            .send(Stage::GetReport, client.http.get(client.url("/x")))
            .await
            .unwrap();
        let err = read_json::<serde_json::Value>(Stage::GetReport, response, &[StatusCode::OK])
            .await
            .err()
            .unwrap();

        match err {
            DiagnocatError::Stage {
                stage,
                status,
                body,
            } => {
                assert_eq!(stage, Stage::GetReport);
                assert_eq!(status, Some(StatusCode::BAD_GATEWAY));
                assert_eq!(body, "upstream down");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn cancellable_stops_pending_work() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<()> = cancellable(&cancel, async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(DiagnocatError::Cancelled)));
    }
}
