use std::{path::Path, time::Duration};

use bytes::Bytes;
use futures_util::{TryStream, TryStreamExt};
use reqwest::{header, Body};
use tokio::{fs::File, time::Instant};
use tokio_util::codec::{BytesCodec, FramedRead};
use tracing::{debug, error, info};

use crate::{
    client::{dispatch, DiagnocatClient},
    error::{DiagnocatError, Result, Stage},
};

/// Minimum wall time between two progress lines.
pub const PROGRESS_INTERVAL: Duration = Duration::from_secs(2);

/// Counts the bytes handed to the HTTP body and logs them now and then.
struct Progress {
    total: u64,
    sent: u64,
    last_log: Instant,
}

impl Progress {
    fn new(total: u64) -> Self {
        Progress {
            total,
            sent: 0,
            last_log: Instant::now(),
        }
    }

    /// Returns whether a progress line was logged.
    fn record(&mut self, len: usize) -> bool {
        self.sent += len as u64;
        if self.last_log.elapsed() < PROGRESS_INTERVAL {
            return false;
        }
        self.last_log = Instant::now();
        info!(
            "Uploaded {:.1} / {:.1} MB ({:.1}%)",
            self.sent as f64 / 1024.0 / 1024.0,
            self.total as f64 / 1024.0 / 1024.0,
            percent(self.sent, self.total)
        );
        true
    }
}

fn percent(sent: u64, total: u64) -> f64 {
    if total == 0 {
        return 100.0;
    }
    sent as f64 / total as f64 * 100.0
}

impl DiagnocatClient {
    /// Streams a file from disk to a presigned upload URL.
    pub async fn upload_file(&self, url: &str, path: &Path) -> Result<()> {
        let file = File::open(path).await?;
        let total_size = file.metadata().await?.len();
        debug!("Uploading {} ({} bytes)", path.display(), total_size);

        let stream = FramedRead::new(file, BytesCodec::new());
        self.upload_stream(url, stream, total_size).await
    }

    /// PUTs `stream` to a presigned URL as one request of `total_size` bytes.
    ///
    /// The payload is never buffered in memory and the request has no timeout.
    /// Any 2xx answer is a success.
    pub async fn upload_stream<S>(&self, url: &str, stream: S, total_size: u64) -> Result<()>
    where
        S: TryStream + Send + Sync + 'static,
        S::Ok: AsRef<[u8]>,
        S::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
        Bytes: From<S::Ok>,
    {
        let stage = Stage::Upload;
        let mut progress = Progress::new(total_size);
        let stream = stream.inspect_ok(move |chunk| {
            progress.record(chunk.as_ref().len());
        });

        let request = self
            .upload_http
            .put(url)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .header(header::CONTENT_LENGTH, total_size)
            .body(Body::wrap_stream(stream));

        let start = std::time::Instant::now();
        let response = dispatch(stage, request).await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!("Error {} while uploading payload", status);
            return Err(DiagnocatError::stage(stage, status, body));
        }

        info!(
            "Payload of {} bytes uploaded in {:?}",
            total_size,
            start.elapsed()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use reqwest::StatusCode;
    use wiremock::{
        matchers::{header, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;
    use crate::client::test_support::client;

    #[tokio::test]
    async fn file_is_streamed_with_explicit_length() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/bucket/scan.zip"))
            .and(header("content-length", "11"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"hello world").unwrap();

        client(&server)
            .upload_file(&format!("{}/bucket/scan.zip", server.uri()), file.path())
            .await
            .unwrap();

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests[0].body, b"hello world");
    }

    #[test]
    fn progress_is_logged_at_most_every_interval() {
        let mut progress = Progress::new(100);
        assert!(!progress.record(10));

        progress.last_log = Instant::now() - PROGRESS_INTERVAL;
        assert!(progress.record(10));
        assert!(!progress.record(10));
        assert_eq!(progress.sent, 30);
    }

    #[tokio::test]
    async fn any_2xx_is_success() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let chunks: Vec<std::io::Result<Bytes>> = vec![Ok(Bytes::from_static(b"abc"))];
        client(&server)
            .upload_stream(
                &format!("{}/bucket/a", server.uri()),
                futures_util::stream::iter(chunks),
                3,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn rejected_upload_carries_body() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(403).set_body_string("SignatureDoesNotMatch"))
            .mount(&server)
            .await;

        let chunks: Vec<std::io::Result<Bytes>> = vec![Ok(Bytes::from_static(b"abc"))];
        let err = client(&server)
            .upload_stream(
                &format!("{}/bucket/a", server.uri()),
                futures_util::stream::iter(chunks),
                3,
            )
            .await
            .unwrap_err();

        match err {
            DiagnocatError::Stage {
                stage,
                status,
                body,
            } => {
                assert_eq!(stage, Stage::Upload);
                assert_eq!(status, Some(StatusCode::FORBIDDEN));
                assert_eq!(body, "SignatureDoesNotMatch");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn percent_of_empty_payload() {
        assert_eq!(percent(0, 0), 100.0);
        assert_eq!(percent(50, 200), 25.0);
    }
}
