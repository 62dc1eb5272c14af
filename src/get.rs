use std::path::Path;

use chrono::Utc;
use futures_util::StreamExt;
use reqwest::{header, StatusCode};
use serde::{de::DeserializeOwned, Deserialize};
use tokio::{fs, io::AsyncWriteExt, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    client::{cancellable, dispatch, read_json, DiagnocatClient},
    error::{DiagnocatError, Result, Stage},
    structs::{
        AnalysisSummary, DiagnosesResponse, OrthoMeasurements, PatientSummary, Report,
        ReportExport, SessionStatus, UploadSession,
    },
};

const OK: &[StatusCode] = &[StatusCode::OK];

/// Longest error body kept from a failed PDF download.
const MAX_ERROR_BODY: usize = 64 * 1024;

#[derive(Deserialize, Debug, Default)]
struct SessionInfoResponse {
    #[serde(default)]
    session_info: SessionInfo,
}

#[derive(Deserialize, Debug, Default)]
struct SessionInfo {
    #[serde(default)]
    status: String,
    #[serde(default)]
    error: Option<String>,
}

impl DiagnocatClient {
    /// Checks that the API answers and accepts our credentials.
    pub async fn check_connection(&self) -> Result<()> {
        let stage = Stage::CheckConnection;
        let response = self
            .send(stage, self.http.get(self.url("/v2/participants")))
            .await?;
        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(DiagnocatError::stage(stage, status, body));
        }
        info!("Diagnocat API connection successful");
        Ok(())
    }

    async fn session_info(&self, session_id: &str) -> Result<SessionInfo> {
        let stage = Stage::PollSession;
        let request = self
            .http
            .get(self.url("/v1/upload/session-info"))
            .query(&[("session_id", session_id)]);
        let response = self.send(stage, request).await?;
        let reply = read_json::<SessionInfoResponse>(stage, response, OK).await?;
        Ok(reply.value.session_info)
    }

    /// Polls a closing session until the service reports it closed.
    ///
    /// Every query consumes one attempt of the configured budget, including
    /// queries that fail in transit, which are logged and skipped. There is no
    /// sleep after a terminal observation. A session still recorded as opened
    /// is moved to closing first, since the service only processes closed
    /// uploads.
    pub async fn wait_for_session_closed(
        &self,
        session: &mut UploadSession,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let max_attempts = self.poll.max_attempts;

        // Processing only starts once the close was requested.
        if session.status() == &SessionStatus::Opened {
            debug!(
                session_id = %session.session_id,
                "Polling a session not recorded as closing, treating it as closing"
            );
            session.advance(SessionStatus::Closing);
        }

        if let Some(done) = terminal_outcome(session) {
            return done;
        }

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(DiagnocatError::Cancelled),
                    _ = sleep(self.poll.interval) => {}
                }
            }

            let info = match cancellable(cancel, self.session_info(&session.session_id)).await {
                Ok(info) => info,
                Err(e @ (DiagnocatError::Cancelled | DiagnocatError::Auth(_))) => return Err(e),
                Err(e) => {
                    warn!(
                        session_id = %session.session_id,
                        attempt,
                        "Session status query failed, retrying: {}",
                        e
                    );
                    continue;
                }
            };

            match SessionStatus::from_wire(&info.status, info.error.as_deref()) {
                Some(observed) => {
                    if !session.advance(observed) {
                        debug!(
                            session_id = %session.session_id,
                            status = %info.status,
                            "Ignoring status that does not move the session forward"
                        );
                    }
                }
                None => debug!(
                    session_id = %session.session_id,
                    status = %info.status,
                    "Unrecognised session status"
                ),
            }

            if let Some(done) = terminal_outcome(session) {
                return done;
            }
            debug!(session_id = %session.session_id, attempt, "Session still processing");
        }

        warn!(
            session_id = %session.session_id,
            "Session did not finish processing after {} attempts",
            max_attempts
        );
        Err(DiagnocatError::PollTimeout {
            session_id: session.session_id.clone(),
            attempts: max_attempts,
        })
    }

    /// Lists the patients of the account, to find the uid an upload needs.
    ///
    /// # Arguments
    ///
    /// * `limit` - Maximum number of patients returned by the service.
    ///
    /// # Returns
    ///
    /// * A Result wrapping the patients, possibly empty.
    pub async fn list_patients(&self, limit: u32) -> Result<Vec<PatientSummary>> {
        let stage = Stage::ListPatients;
        let request = self
            .http
            .get(self.url("/v2/patients"))
            .query(&[("limit", limit)]);
        let response = self.send(stage, request).await?;
        let patients: Vec<PatientSummary> = read_json(stage, response, OK).await?.value;
        debug!(count = patients.len(), "Patients listed");
        Ok(patients)
    }

    /// Lists the analyses of a patient.
    pub async fn list_analyses(&self, patient_uid: &str) -> Result<Vec<AnalysisSummary>> {
        let stage = Stage::ListAnalyses;
        let request = self
            .http
            .get(self.url("/v2/analyses"))
            .query(&[("patient_uid", patient_uid)]);
        let response = self.send(stage, request).await?;
        Ok(read_json(stage, response, OK).await?.value)
    }

    /// Fetches a report. Once it is complete, diagnoses and orthodontic
    /// measurements are fetched too; failures of those two are logged and the
    /// report is returned without them.
    pub async fn get_status(&self, report_id: &str) -> Result<Report> {
        let stage = Stage::GetReport;
        let response = self
            .send(stage, self.http.get(self.url(&format!("/v2/analyses/{}", report_id))))
            .await?;
        let mut report: Report = read_json(stage, response, OK).await?.value;

        if !report.is_complete() {
            debug!(report_id, status = %report.status, "Report not complete yet");
            return Ok(report);
        }

        match self.fetch_diagnoses::<serde_json::Value>(report_id).await {
            Ok(diagnoses) => report.diagnoses = Some(diagnoses),
            Err(e) => warn!(report_id, "Could not fetch diagnoses: {}", e),
        }

        match self.get_ortho_measurements(report_id).await {
            Ok(ortho) => report.ortho_measurements = ortho,
            Err(e) => warn!(report_id, "Could not fetch ortho measurements: {}", e),
        }

        Ok(report)
    }

    /// Tooth by tooth findings of a complete report.
    pub async fn get_diagnoses(&self, report_id: &str) -> Result<DiagnosesResponse> {
        self.fetch_diagnoses(report_id).await
    }

    async fn fetch_diagnoses<T: DeserializeOwned>(&self, report_id: &str) -> Result<T> {
        let stage = Stage::GetDiagnoses;
        let response = self
            .send(
                stage,
                self.http
                    .get(self.url(&format!("/v2/analyses/{}/diagnoses", report_id))),
            )
            .await?;
        Ok(read_json(stage, response, OK).await?.value)
    }

    /// Orthodontic measurements, or `None` when the analysis type has none.
    pub async fn get_ortho_measurements(&self, report_id: &str) -> Result<Option<OrthoMeasurements>> {
        let stage = Stage::GetOrthoMeasurements;
        let response = self
            .send(
                stage,
                self.http
                    .get(self.url(&format!("/v2/analyses/{}/ortho-measurements", report_id))),
            )
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(read_json(stage, response, OK).await?.value))
    }

    /// Saves the PDF rendering of a report, creating the parent directory of
    /// `destination` if needed.
    ///
    /// # Arguments
    ///
    /// * `report_id` - Report id, the analysis uid or its id_v3 fallback.
    /// * `destination` - File the PDF is streamed to.
    ///
    /// # Returns
    ///
    /// * A Result wrapping the number of bytes written.
    ///
    /// # Errors
    ///
    /// An empty id or destination is a Config error. Any answer but 200 is a
    /// `download_pdf` stage error carrying at most 64 KiB of its body.
    pub async fn download_pdf(&self, report_id: &str, destination: &Path) -> Result<u64> {
        let stage = Stage::DownloadPdf;
        if report_id.is_empty() {
            return Err(DiagnocatError::Config("a report id is required".to_string()));
        }
        if destination.as_os_str().is_empty() {
            return Err(DiagnocatError::Config(
                "an output path is required".to_string(),
            ));
        }

        if let Some(parent) = destination.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let mut headers = self.credentials.auth_headers().await?;
        headers.remove(header::CONTENT_TYPE);
        headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static("application/pdf"),
        );
        let request = self
            .http
            .get(self.url(&format!("/v2/analyses/{}/pdf", report_id)))
            .headers(headers);
        let response = dispatch(stage, request).await?;

        let status = response.status();
        if status != StatusCode::OK {
            let mut body = response.text().await.unwrap_or_default();
            if body.len() > MAX_ERROR_BODY {
                let mut end = MAX_ERROR_BODY;
                while !body.is_char_boundary(end) {
                    end -= 1;
                }
                body.truncate(end);
            }
            return Err(DiagnocatError::stage(stage, status, body));
        }

        let mut file = fs::File::create(destination).await?;
        let mut written = 0u64;
        let mut chunks = response.bytes_stream();
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk.map_err(|e| DiagnocatError::transport(stage, e))?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        info!(report_id, "PDF saved to {} ({} bytes)", destination.display(), written);
        Ok(written)
    }

    /// Snapshot of a report for export. Unlike [DiagnocatClient::get_status],
    /// a complete report whose diagnoses cannot be fetched is an error.
    pub async fn export_report(&self, report_id: &str) -> Result<ReportExport> {
        let report = self.get_status(report_id).await?;

        let diagnoses = if report.is_complete() {
            Some(self.get_diagnoses(report_id).await?)
        } else {
            None
        };

        Ok(ReportExport {
            fetched_at: Utc::now(),
            source: self.api_url.clone(),
            report_id: report_id.to_string(),
            report,
            diagnoses,
        })
    }
}

fn terminal_outcome(session: &UploadSession) -> Option<Result<()>> {
    match session.status() {
        SessionStatus::Closed => {
            info!(session_id = %session.session_id, "Session processing complete");
            Some(Ok(()))
        }
        SessionStatus::Error(message) => Some(Err(DiagnocatError::RemoteTerminal {
            session_id: session.session_id.clone(),
            message: message.clone(),
        })),
        _ => None,
    }
}
