use std::path::Path;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{
    client::{cancellable, DiagnocatClient},
    error::{DiagnocatError, Result, Stage},
    structs::{
        select_upload_target, Analysis, AnalysisType, RemoteStudy, StudyCreate, StudyType,
        UploadStudyResult,
    },
};

/// Knobs of [DiagnocatClient::upload_study].
#[derive(Debug, Clone)]
pub struct UploadOptions {
    pub study_name: Option<String>,
    pub study_type: StudyType,
    pub analysis_type: AnalysisType,
}

impl Default for UploadOptions {
    fn default() -> Self {
        UploadOptions {
            study_name: Some("Upload from API".to_string()),
            study_type: StudyType::Cbct,
            analysis_type: AnalysisType::Gp,
        }
    }
}

impl DiagnocatClient {
    /// Uploads one file for an existing patient and requests its analysis.
    ///
    /// Steps run strictly in order: create study, open session, request the
    /// upload URL, stream the file, close the session, wait for processing,
    /// request the analysis. The first failure aborts the run. A study created
    /// before that failure is not deleted.
    ///
    /// # Arguments
    ///
    /// * `patient_uid` - Uid of an existing Diagnocat patient.
    /// * `file` - Study file; its file name is the upload key.
    /// * `options` - Study name, study type and analysis type.
    /// * `cancel` - Aborts the run between or during steps.
    ///
    /// # Returns
    ///
    /// * A Result wrapping the ids of everything created, the report id included.
    pub async fn upload_study(
        &self,
        patient_uid: &str,
        file: &Path,
        options: &UploadOptions,
        cancel: &CancellationToken,
    ) -> Result<UploadStudyResult> {
        let key = file
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| {
                DiagnocatError::Config(format!("{} has no usable file name", file.display()))
            })?
            .to_string();

        info!("Step 0: creating study for patient {}", patient_uid);
        let study_request = StudyCreate::today(options.study_name.clone(), options.study_type);
        let study = cancellable(cancel, self.create_study(patient_uid, &study_request)).await?;

        match self.upload_to_study(&study, &key, file, options, cancel).await {
            Ok((session_id, analysis)) => Ok(UploadStudyResult {
                patient_uid: patient_uid.to_string(),
                study_uid: study.uid,
                study_id_v3: study.id_v3,
                session_id,
                analysis_uid: analysis.uid,
                analysis_id_v3: analysis.id_v3,
                status: analysis.status,
            }),
            Err(e) => {
                error!(
                    study_uid = %study.uid,
                    "Upload aborted, remote study left without analysis: {}",
                    e
                );
                Err(e)
            }
        }
    }

    async fn upload_to_study(
        &self,
        study: &RemoteStudy,
        key: &str,
        file: &Path,
        options: &UploadOptions,
        cancel: &CancellationToken,
    ) -> Result<(String, Analysis)> {
        info!("Step 1: opening upload session for study {}", study.uid);
        let mut session = cancellable(cancel, self.open_session(&study.uid)).await?;

        info!("Step 2: requesting upload URL");
        let keys = [key.to_string()];
        let targets =
            cancellable(cancel, self.request_upload_targets(&session.session_id, &keys)).await?;
        let target = select_upload_target(&targets, key).ok_or_else(|| DiagnocatError::Stage {
            stage: Stage::RequestUploadUrls,
            status: None,
            body: format!("no upload URL returned for key {}", key),
        })?;

        info!("Step 3: uploading {}", file.display());
        cancellable(cancel, self.upload_file(&target.url, file)).await?;

        info!("Step 4: closing upload session {}", session.session_id);
        cancellable(cancel, self.close_session(&mut session)).await?;

        info!("Step 5: waiting for session processing");
        self.wait_for_session_closed(&mut session, cancel).await?;

        info!("Step 6: requesting {:?} analysis", options.analysis_type);
        let analysis = cancellable(
            cancel,
            self.request_analysis(&study.uid, options.analysis_type),
        )
        .await?;

        info!("Use this report id for status checks: {}", analysis.report_id());
        Ok((session.session_id, analysis))
    }
}
