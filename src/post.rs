use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::{
    client::{read_json, DiagnocatClient},
    error::{DiagnocatError, Result, Stage},
    structs::{
        Analysis, AnalysisType, Patient, PatientCreate, RemoteStudy, SessionStatus, StudyCreate,
        UploadSession, UploadTarget,
    },
};

const CREATED: &[StatusCode] = &[StatusCode::OK, StatusCode::CREATED];
const OK: &[StatusCode] = &[StatusCode::OK];

#[derive(Serialize)]
struct OpenSessionRequest<'a> {
    study_uid: &'a str,
}

#[derive(Deserialize)]
struct OpenSessionResponse {
    #[serde(default)]
    session_id: String,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Serialize)]
struct RequestUploadUrlsRequest<'a> {
    session_id: &'a str,
    keys: &'a [String],
}

#[derive(Deserialize)]
struct RequestUploadUrlsResponse {
    #[serde(default)]
    upload_urls: Vec<UploadTarget>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Serialize)]
struct SessionRequest<'a> {
    session_id: &'a str,
}

#[derive(Deserialize)]
struct AckResponse {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Serialize)]
struct RequestAnalysisRequest {
    analysis_type: AnalysisType,
}

impl DiagnocatClient {
    /// Registers a patient on the Diagnocat side and returns it with its uid.
    pub async fn create_patient(&self, patient: &PatientCreate) -> Result<Patient> {
        let stage = Stage::CreatePatient;
        let request = self.http.post(self.url("/v2/patients")).json(patient);
        let response = self.send(stage, request).await?;
        let reply = read_json::<Patient>(stage, response, CREATED).await?;

        if reply.value.uid.is_empty() {
            return Err(DiagnocatError::stage(stage, reply.status, reply.body));
        }

        info!(patient_uid = %reply.value.uid, "Patient created");
        Ok(reply.value)
    }

    /// Creates the study an upload session will be attached to.
    ///
    /// An answer without a study uid is a failure even on a success status.
    pub async fn create_study(&self, patient_uid: &str, study: &StudyCreate) -> Result<RemoteStudy> {
        let stage = Stage::CreateStudy;
        debug!(patient_uid, "Creating study");

        let request = self
            .http
            .post(self.url(&format!("/v2/patients/{}/studies", patient_uid)))
            .json(study);
        let response = self.send(stage, request).await?;
        let reply = read_json::<RemoteStudy>(stage, response, CREATED).await?;

        if reply.value.uid.is_empty() {
            error!(patient_uid, "Study created without uid");
            return Err(DiagnocatError::stage(stage, reply.status, reply.body));
        }

        info!(study_uid = %reply.value.uid, "Study created");
        Ok(reply.value)
    }

    /// Opens an upload session on a study. Only the study uid is sent: the
    /// service rejects the legacy patient field at this step.
    pub async fn open_session(&self, study_uid: &str) -> Result<UploadSession> {
        let stage = Stage::OpenSession;
        let request = self
            .http
            .post(self.url("/v1/upload/open-session"))
            .json(&OpenSessionRequest { study_uid });
        let response = self.send(stage, request).await?;
        let reply = read_json::<OpenSessionResponse>(stage, response, OK).await?;

        if reply.value.session_id.is_empty() {
            let message = match reply.value.error.filter(|e| !e.is_empty()) {
                Some(message) => format!("empty session_id (error={})", message),
                None => format!("empty session_id: {}", reply.body),
            };
            return Err(DiagnocatError::stage(stage, reply.status, message));
        }

        info!(session_id = %reply.value.session_id, study_uid, "Upload session opened");
        Ok(UploadSession::opened(reply.value.session_id))
    }

    /// Asks for one presigned upload URL per key. At least one target must come
    /// back.
    pub async fn request_upload_targets(
        &self,
        session_id: &str,
        keys: &[String],
    ) -> Result<Vec<UploadTarget>> {
        let stage = Stage::RequestUploadUrls;
        let request = self
            .http
            .post(self.url("/v1/upload/request-upload-urls"))
            .json(&RequestUploadUrlsRequest { session_id, keys });
        let response = self.send(stage, request).await?;
        let reply = read_json::<RequestUploadUrlsResponse>(stage, response, OK).await?;

        if reply.value.upload_urls.is_empty() {
            let message = match reply.value.error.filter(|e| !e.is_empty()) {
                Some(message) => format!("no upload_urls returned (error={})", message),
                None => format!("no upload_urls returned: {}", reply.body),
            };
            return Err(DiagnocatError::stage(stage, reply.status, message));
        }

        debug!(
            session_id,
            count = reply.value.upload_urls.len(),
            "Upload targets received"
        );
        Ok(reply.value.upload_urls)
    }

    /// Starts closing the session. Processing continues server side; completion
    /// is only observable through [DiagnocatClient::wait_for_session_closed].
    pub async fn close_session(&self, session: &mut UploadSession) -> Result<()> {
        let stage = Stage::CloseSession;
        let request = self
            .http
            .post(self.url("/v1/upload/start-session-close"))
            .json(&SessionRequest {
                session_id: &session.session_id,
            });
        let response = self.send(stage, request).await?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| DiagnocatError::transport(stage, e))?;

        if status != StatusCode::OK {
            return Err(DiagnocatError::stage(stage, status, body));
        }

        // An empty body is a bare acknowledgement; an explicit refusal is not.
        if let Ok(ack) = serde_json::from_str::<AckResponse>(&body) {
            if !ack.ok && ack.error.as_deref().is_some_and(|e| !e.is_empty()) {
                return Err(DiagnocatError::stage(
                    stage,
                    status,
                    ack.error.unwrap_or_default(),
                ));
            }
        }

        session.advance(SessionStatus::Closing);
        info!(session_id = %session.session_id, "Session closing started");
        Ok(())
    }

    /// Triggers an analysis on a study whose session is closed.
    pub async fn request_analysis(
        &self,
        study_uid: &str,
        analysis_type: AnalysisType,
    ) -> Result<Analysis> {
        let stage = Stage::RequestAnalysis;
        let request = self
            .http
            .post(self.url(&format!("/v2/studies/{}/analyses", study_uid)))
            .json(&RequestAnalysisRequest { analysis_type });
        let response = self.send(stage, request).await?;
        let reply = read_json::<Analysis>(stage, response, CREATED).await?;

        info!(
            uid = %reply.value.uid,
            id_v3 = %reply.value.id_v3,
            report_id = %reply.value.report_id(),
            "Analysis requested"
        );
        Ok(reply.value)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::{
        matchers::{body_json, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;
    use crate::{client::test_support::client, structs::StudyType};

    #[tokio::test]
    async fn create_study_returns_identifiers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/patients/p-1/studies"))
            .respond_with(
                ResponseTemplate::new(201).set_body_json(json!({"uid": "st-1", "id_v3": "v3-1"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let study = client(&server)
            .create_study("p-1", &StudyCreate::today(None, StudyType::Cbct))
            .await
            .unwrap();
        assert_eq!(study.uid, "st-1");
        assert_eq!(study.id_v3, "v3-1");
    }

    #[tokio::test]
    async fn create_study_with_empty_uid_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"uid": ""})))
            .mount(&server)
            .await;

        let err = client(&server)
            .create_study("p-1", &StudyCreate::today(None, StudyType::Cbct))
            .await
            .unwrap_err();
        assert_eq!(err.stage_name(), Some(Stage::CreateStudy));
    }

    #[tokio::test]
    async fn open_session_sends_only_study_uid() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/upload/open-session"))
            .and(body_json(json!({"study_uid": "st-1"})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"ok": true, "session_id": "se-1"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let session = client(&server).open_session("st-1").await.unwrap();
        assert_eq!(session.session_id, "se-1");
        assert_eq!(session.status(), &SessionStatus::Opened);
    }

    #[tokio::test]
    async fn open_session_surfaces_embedded_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/upload/open-session"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"ok": false, "session_id": "", "error": "study locked"})),
            )
            .mount(&server)
            .await;

        let err = client(&server).open_session("st-1").await.unwrap_err();
        assert_eq!(err.stage_name(), Some(Stage::OpenSession));
        assert!(err.to_string().contains("study locked"));
    }

    #[tokio::test]
    async fn request_upload_targets_requires_one_target() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/upload/request-upload-urls"))
            .and(body_json(json!({"session_id": "se-1", "keys": ["scan.zip"]})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"ok": true, "upload_urls": []})),
            )
            .mount(&server)
            .await;

        let err = client(&server)
            .request_upload_targets("se-1", &["scan.zip".to_string()])
            .await
            .unwrap_err();
        assert_eq!(err.stage_name(), Some(Stage::RequestUploadUrls));
    }

    #[tokio::test]
    async fn close_session_moves_to_closing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/upload/start-session-close"))
            .and(body_json(json!({"session_id": "se-1"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let mut session = UploadSession::opened("se-1");
        client(&server).close_session(&mut session).await.unwrap();
        assert_eq!(session.status(), &SessionStatus::Closing);
    }

    #[tokio::test]
    async fn close_session_refusal_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/upload/start-session-close"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"ok": false, "error": "no files"})),
            )
            .mount(&server)
            .await;

        let mut session = UploadSession::opened("se-1");
        let err = client(&server).close_session(&mut session).await.unwrap_err();
        assert_eq!(err.stage_name(), Some(Stage::CloseSession));
        assert_eq!(session.status(), &SessionStatus::Opened);
    }

    #[tokio::test]
    async fn request_analysis_failure_carries_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/studies/st-1/analyses"))
            .and(body_json(json!({"analysis_type": "GP"})))
            .respond_with(ResponseTemplate::new(409).set_body_string("study not ready"))
            .mount(&server)
            .await;

        let err = client(&server)
            .request_analysis("st-1", AnalysisType::Gp)
            .await
            .unwrap_err();
        match err {
            DiagnocatError::Stage {
                stage,
                status,
                body,
            } => {
                assert_eq!(stage, Stage::RequestAnalysis);
                assert_eq!(status, Some(StatusCode::CONFLICT));
                assert_eq!(body, "study not ready");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn create_patient_requires_uid() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/patients"))
            .respond_with(
                ResponseTemplate::new(201)
                    .set_body_json(json!({"uid": "p-9", "name_part1": "Ada", "name_part2": "L"})),
            )
            .mount(&server)
            .await;

        let patient = client(&server)
            .create_patient(&PatientCreate {
                name_part1: "Ada".into(),
                name_part2: "L".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(patient.uid, "p-9");
    }
}
