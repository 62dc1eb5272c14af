//! # diagnocat_rs
//! ## Before you begin
//! This library is intended to be used with the Diagnocat partner API. To use it you need either an API key
//! or the email/password of a Diagnocat account, and the URL of the environment you wish to use.
//!
//! These values are usually provided as environment variables. More details in the [DiagnocatConfig] documentation.
//!
//! ## Description
//! **diagnocat_rs** is a client library in Rust for sending dental imaging studies to Diagnocat, an AI
//! diagnostics service, and for fetching the resulting reports.
//!
//! The interaction with the API happens in two independent phases:
//!
//! 1. Uploading a study with [DiagnocatClient::upload_study]. This creates a remote study, opens an upload
//!    session, streams the file to a presigned URL, closes the session, waits for the service to process it
//!    and requests an analysis. Each step is also available on its own.
//! 2. Fetching results, at any later time, with [DiagnocatClient::get_status], [DiagnocatClient::export_report]
//!    or [DiagnocatClient::download_pdf], keyed by the report id returned by the first phase.
//!
//! Authentication is handled by [CredentialCache], which reuses a user token until it expires and can be shared
//! between clients.
//!
//! ## Example
//! ```rust no_run
//! use std::path::Path;
//!
//! use diagnocat_rs::{DiagnocatClient, DiagnocatConfig, UploadOptions};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! pub async fn main() {
//!     let client = DiagnocatClient::new(&DiagnocatConfig::from_env()).unwrap();
//!
//!     let result = client
//!         .upload_study(
//!             "patient-uid",
//!             Path::new("scan.zip"),
//!             &UploadOptions::default(),
//!             &CancellationToken::new(),
//!         )
//!         .await
//!         .unwrap();
//!
//!     let report = client.get_status(result.report_id()).await.unwrap();
//!     if report.is_complete() {
//!         client
//!             .download_pdf(result.report_id(), Path::new("reports/report.pdf"))
//!             .await
//!             .unwrap();
//!     }
//! }
//! ```

mod auth;
mod client;
mod config;
mod error;
mod get;
mod pipeline;
mod post;
mod structs;
mod upload;

pub use auth::{Credential, CredentialCache, TOKEN_TTL_HOURS};
pub use client::DiagnocatClient;
pub use config::{DiagnocatConfig, PollConfig, DEFAULT_API_URL};
pub use error::{DiagnocatError, Result, Stage};
pub use pipeline::UploadOptions;
pub use structs::{
    select_upload_target, Analysis, AnalysisSummary, AnalysisType, CephalometricMeasurement,
    DiagnosesResponse, OrthoMeasurements, Patient, PatientCreate, PatientName, PatientSummary, RemoteStudy, Report,
    ReportExport, SessionStatus, StudyCreate, StudyType, ToothDiagnosis, UploadSession,
    UploadStudyResult, UploadTarget,
};
pub use upload::PROGRESS_INTERVAL;
