use std::fmt;

use reqwest::StatusCode;
use thiserror::Error;

/// Pipeline step an error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    CheckConnection,
    CreatePatient,
    ListPatients,
    CreateStudy,
    OpenSession,
    RequestUploadUrls,
    Upload,
    CloseSession,
    PollSession,
    RequestAnalysis,
    ListAnalyses,
    GetReport,
    GetDiagnoses,
    GetOrthoMeasurements,
    DownloadPdf,
}

impl Stage {
    /// Name used in error messages and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::CheckConnection => "check_connection",
            Stage::CreatePatient => "create_patient",
            Stage::ListPatients => "list_patients",
            Stage::CreateStudy => "create_study",
            Stage::OpenSession => "open_session",
            Stage::RequestUploadUrls => "request_upload_urls",
            Stage::Upload => "upload",
            Stage::CloseSession => "close_session",
            Stage::PollSession => "poll_session",
            Stage::RequestAnalysis => "request_analysis",
            Stage::ListAnalyses => "list_analyses",
            Stage::GetReport => "get_report",
            Stage::GetDiagnoses => "get_diagnoses",
            Stage::GetOrthoMeasurements => "get_ortho_measurements",
            Stage::DownloadPdf => "download_pdf",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum DiagnocatError {
    #[error("Authentication failed: {0}")]
    Auth(String),
    #[error("Stage {stage} failed ({}): {body}", display_status(.status))]
    Stage {
        stage: Stage,
        status: Option<StatusCode>,
        body: String,
    },
    #[error("Session {session_id} did not reach a terminal state after {attempts} attempts")]
    PollTimeout { session_id: String, attempts: u32 },
    #[error("Session {session_id} processing failed remotely: {message}")]
    RemoteTerminal { session_id: String, message: String },
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid header value: {0}")]
    InvalidHeader(#[from] reqwest::header::InvalidHeaderValue),
}

fn display_status(status: &Option<StatusCode>) -> String {
    match status {
        Some(status) => status.to_string(),
        None => "no response".to_string(),
    }
}

impl DiagnocatError {
    /// A stage answered, but not with what the protocol requires.
    pub(crate) fn stage(stage: Stage, status: StatusCode, body: impl Into<String>) -> Self {
        DiagnocatError::Stage {
            stage,
            status: Some(status),
            body: body.into(),
        }
    }

    /// A stage never got an answer.
    pub(crate) fn transport(stage: Stage, err: reqwest::Error) -> Self {
        DiagnocatError::Stage {
            stage,
            status: None,
            body: err.to_string(),
        }
    }

    /// The stage that failed, for errors raised by a pipeline step.
    pub fn stage_name(&self) -> Option<Stage> {
        match self {
            DiagnocatError::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, DiagnocatError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_error_names_the_stage_and_status() {
        let err = DiagnocatError::stage(Stage::CreateStudy, StatusCode::BAD_REQUEST, "nope");
        assert_eq!(
            err.to_string(),
            "Stage create_study failed (400 Bad Request): nope"
        );
        assert_eq!(err.stage_name(), Some(Stage::CreateStudy));
    }

    #[test]
    fn stage_error_without_response() {
        let err = DiagnocatError::Stage {
            stage: Stage::Upload,
            status: None,
            body: "connection reset".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Stage upload failed (no response): connection reset"
        );
    }
}
