use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Modality of a study, as expected by the study creation endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum StudyType {
    #[default]
    Cbct,
    Panorama,
    Fmx,
    Stl,
}

/// Kind of AI analysis to run on a study.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnalysisType {
    /// General purpose analysis, used by the upload pipeline.
    #[default]
    Gp,
    Cbct,
    CbctOrtho,
    CbctEndo,
    CbctImplant,
    Panorama,
    Fmx,
}

#[derive(Serialize, Debug, Clone)]
pub struct StudyCreate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub study_name: Option<String>,
    pub study_type: StudyType,
    /// Formatted as `YYYY-MM-DD`.
    pub study_date: String,
}

impl StudyCreate {
    /// A study dated today (UTC).
    pub fn today(study_name: Option<String>, study_type: StudyType) -> Self {
        StudyCreate {
            study_name,
            study_type,
            study_date: Utc::now().format("%Y-%m-%d").to_string(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct RemoteStudy {
    pub uid: String,
    #[serde(default)]
    pub id_v3: String,
}

#[derive(Serialize, Debug, Clone, Default)]
pub struct PatientCreate {
    pub name_part1: String,
    pub name_part2: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_of_birth: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patient_id: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Patient {
    pub uid: String,
    #[serde(default)]
    pub name_part1: String,
    #[serde(default)]
    pub name_part2: String,
    #[serde(default)]
    pub gender: Option<String>,
    #[serde(default)]
    pub date_of_birth: Option<String>,
    #[serde(default)]
    pub patient_id: Option<String>,
}

/// One entry of the account's patient list.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct PatientSummary {
    pub uid: String,
    #[serde(default)]
    pub name: PatientName,
    #[serde(default)]
    pub gender: Option<String>,
    #[serde(default)]
    pub date_of_birth: Option<String>,
    #[serde(default)]
    pub external_id: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct PatientName {
    #[serde(default)]
    pub given: String,
    #[serde(default)]
    pub family: String,
}

/// Server side state of an upload session.
///
/// The only accepted orders are `Opened -> Closing -> Closed` and
/// `Opened -> Closing -> Error`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Opened,
    Closing,
    Closed,
    Error(String),
}

impl SessionStatus {
    /// Maps a `session_info.status` value. `None` means the service did not say
    /// anything that moves the session forward.
    pub fn from_wire(status: &str, error: Option<&str>) -> Option<Self> {
        match status {
            "started" | "open" | "opened" => Some(SessionStatus::Opened),
            "closing" => Some(SessionStatus::Closing),
            "closed" => Some(SessionStatus::Closed),
            "error" => Some(SessionStatus::Error(
                error
                    .filter(|e| !e.is_empty())
                    .unwrap_or("unknown error")
                    .to_string(),
            )),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Closed | SessionStatus::Error(_))
    }

    fn can_advance_to(&self, next: &SessionStatus) -> bool {
        matches!(
            (self, next),
            (SessionStatus::Opened, SessionStatus::Closing)
                | (SessionStatus::Closing, SessionStatus::Closed)
                | (SessionStatus::Closing, SessionStatus::Error(_))
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSession {
    pub session_id: String,
    status: SessionStatus,
}

impl UploadSession {
    /// A session the service just opened, before any close request.
    pub fn opened(session_id: impl Into<String>) -> Self {
        UploadSession {
            session_id: session_id.into(),
            status: SessionStatus::Opened,
        }
    }

    pub fn status(&self) -> &SessionStatus {
        &self.status
    }

    /// Moves the session forward. Backward, repeated or skipping transitions are
    /// ignored and reported as `false`; the recorded status never regresses.
    pub fn advance(&mut self, next: SessionStatus) -> bool {
        if !self.status.can_advance_to(&next) {
            return false;
        }
        self.status = next;
        true
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct UploadTarget {
    pub key: String,
    pub url: String,
}

/// Exact key lookup among the targets returned for a session.
pub fn select_upload_target<'a>(targets: &'a [UploadTarget], key: &str) -> Option<&'a UploadTarget> {
    targets.iter().find(|t| t.key == key)
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Analysis {
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub id_v3: String,
    #[serde(default)]
    pub status: String,
}

impl Analysis {
    /// Identifier to use for every later report lookup: `uid`, or `id_v3` when
    /// the service left `uid` empty.
    pub fn report_id(&self) -> &str {
        report_id(&self.uid, &self.id_v3)
    }
}

fn report_id<'a>(uid: &'a str, id_v3: &'a str) -> &'a str {
    if uid.is_empty() {
        id_v3
    } else {
        uid
    }
}

/// Entry of the analyses listing of a patient.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct AnalysisSummary {
    pub uid: String,
    #[serde(default)]
    pub study_uid: String,
    #[serde(default)]
    pub patient_uid: String,
    #[serde(default)]
    pub analysis_type: String,
    #[serde(default)]
    pub complete: bool,
    #[serde(default)]
    pub started: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub pdf_url: Option<String>,
    #[serde(default)]
    pub preview_url: Option<String>,
    #[serde(default)]
    pub webpage_url: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct Report {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub complete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdf_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webpage_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview_url: Option<String>,
    /// Opaque; a JSON `null` is read as absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnoses: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ortho_measurements: Option<OrthoMeasurements>,
}

impl Report {
    /// Whether the analysis is finished. `complete` is authoritative but a
    /// `"complete"` status is also accepted; a mismatch is only logged.
    pub fn is_complete(&self) -> bool {
        let by_status = self.status == "complete";
        if by_status != self.complete {
            warn!(
                report_id = %self.id,
                status = %self.status,
                complete = self.complete,
                "Report status and complete flag disagree"
            );
        }
        self.complete || by_status
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct DiagnosesResponse {
    #[serde(default)]
    pub diagnoses: Vec<ToothDiagnosis>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ToothDiagnosis {
    pub tooth_number: i32,
    #[serde(default)]
    pub text_comment: String,
    #[serde(default)]
    pub attributes: serde_json::Value,
    #[serde(default)]
    pub periodontal_status: serde_json::Value,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct OrthoMeasurements {
    #[serde(default)]
    pub cephalometric_measurements: Vec<CephalometricMeasurement>,
    #[serde(default)]
    pub teeth_analysis: serde_json::Value,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct CephalometricMeasurement {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub values: serde_json::Value,
    #[serde(default)]
    pub unit: String,
}

/// Self contained snapshot of a report, stamped at fetch time.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ReportExport {
    pub fetched_at: DateTime<Utc>,
    pub source: String,
    pub report_id: String,
    pub report: Report,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnoses: Option<DiagnosesResponse>,
}

/// Every identifier produced by one run of the upload pipeline.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct UploadStudyResult {
    pub patient_uid: String,
    pub study_uid: String,
    pub study_id_v3: String,
    pub session_id: String,
    pub analysis_uid: String,
    pub analysis_id_v3: String,
    pub status: String,
}

impl UploadStudyResult {
    pub fn report_id(&self) -> &str {
        report_id(&self.analysis_uid, &self.analysis_id_v3)
    }
}
