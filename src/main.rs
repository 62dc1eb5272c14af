use std::{fs, path::PathBuf, process};

use clap::{Parser, Subcommand, ValueEnum};
use diagnocat_rs::{
    AnalysisType, DiagnocatClient, DiagnocatConfig, DiagnocatError, PatientCreate, StudyType,
    UploadOptions,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    #[command(subcommand)]
    command: Command,
    /// Override the API URL from the environment variable
    #[clap(short = 'a', long, global = true)]
    api_url: Option<String>,
    /// Override the API key from the environment variable
    #[clap(short = 'k', long, global = true)]
    api_key: Option<String>,
    /// Override the account email from the environment variable
    #[clap(short = 'e', long, global = true)]
    email: Option<String>,
    /// Override the account password from the environment variable
    #[clap(short = 'p', long, global = true)]
    password: Option<String>,
    /// Set the log level
    #[arg(value_enum)]
    #[clap(short = 'L', long, default_value = "info", global = true)]
    log_level: LogLevel,
    /// Display timestamps with log messages
    #[clap(short = 'T', long, global = true)]
    timestamp: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a study file for a patient and request its analysis
    Upload {
        /// Path to the study file (DICOM or archive)
        file: PathBuf,
        /// Patient UID in Diagnocat
        #[clap(short = 'P', long)]
        patient: String,
        /// Type of the study
        #[arg(value_enum)]
        #[clap(short = 's', long, default_value = "cbct")]
        study_type: StudyType,
        /// Analysis to request once the upload is processed
        #[arg(value_enum)]
        #[clap(short = 'y', long, default_value = "gp")]
        analysis_type: AnalysisType,
        /// Name given to the remote study
        #[clap(short = 'n', long, default_value = "Upload from API")]
        study_name: String,
    },
    /// Show the status of an analysis
    Status {
        /// Report/analysis id
        id: String,
    },
    /// Export a report and its diagnoses as JSON
    Export {
        /// Report/analysis id
        id: String,
        /// Write the JSON to a file instead of stdout
        #[clap(short = 'o', long)]
        out: Option<PathBuf>,
        /// Disable pretty printing
        #[clap(short = 'c', long)]
        compact: bool,
    },
    /// Download the PDF of a report
    Pdf {
        /// Report/analysis id
        id: String,
        /// Output file
        #[clap(short = 'o', long, default_value = "report.pdf")]
        out: PathBuf,
    },
    /// Create a patient
    CreatePatient {
        #[clap(long)]
        first_name: String,
        #[clap(long)]
        last_name: String,
        #[clap(long)]
        gender: Option<String>,
        /// Formatted as YYYY-MM-DD
        #[clap(long)]
        date_of_birth: Option<String>,
        /// Identifier of the patient in the local system
        #[clap(long)]
        patient_id: Option<String>,
    },
    /// List the patients of the account
    Patients {
        /// Maximum number of patients to list
        #[clap(short = 'l', long, default_value_t = 50)]
        limit: u32,
    },
    /// List the analyses of a patient
    Analyses {
        /// Patient UID in Diagnocat
        #[clap(short = 'P', long)]
        patient: String,
    },
    /// Check that the API is reachable with the configured credentials
    Check,
}

#[derive(Copy, Clone, ValueEnum, Debug)]
enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Quiet,
}

#[tokio::main]
pub async fn main() {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    tracing_subscriber_handler(&args);

    let config = config_from_args(&args);
    let client = match DiagnocatClient::new(&config) {
        Ok(client) => client,
        Err(e) => {
            error!("Error: {}", e);
            process::exit(1);
        }
    };

    if !client.credentials().is_configured() {
        warn!("No Diagnocat credentials configured, authenticated calls will fail.");
    }

    if let Err(e) = run(&client, args.command).await {
        error!("Error: {}", e);
        process::exit(1);
    }
}

async fn run(client: &DiagnocatClient, command: Command) -> Result<(), DiagnocatError> {
    match command {
        Command::Upload {
            file,
            patient,
            study_type,
            analysis_type,
            study_name,
        } => {
            let cancel = CancellationToken::new();
            let trigger = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, cancelling the upload.");
                    trigger.cancel();
                }
            });

            let options = UploadOptions {
                study_name: Some(study_name),
                study_type,
                analysis_type,
            };
            let result = client
                .upload_study(&patient, &file, &options, &cancel)
                .await?;

            println!("{}", serde_json::to_string_pretty(&result)?);
            info!("Use this id for status checks: {}", result.report_id());
        }
        Command::Status { id } => {
            let report = client.get_status(&id).await?;
            println!("ID:       {}", report.id);
            println!("Status:   {}", report.status);
            println!("Complete: {}", report.complete);
            if let Some(err) = &report.error {
                println!("Error:    {}", err);
            }
            if report.is_complete() {
                if let Some(url) = &report.webpage_url {
                    println!("Webpage:  {}", url);
                }
                if let Some(url) = &report.pdf_url {
                    println!("PDF:      {}", url);
                }
                if let Some(url) = &report.preview_url {
                    println!("Preview:  {}", url);
                }
            } else {
                println!("Still processing...");
            }
        }
        Command::Export { id, out, compact } => {
            let export = client.export_report(&id).await?;
            let json = if compact {
                serde_json::to_string(&export)?
            } else {
                serde_json::to_string_pretty(&export)?
            };
            match out {
                Some(path) => {
                    fs::write(&path, json)?;
                    info!("Wrote export JSON to {}", path.display());
                }
                None => println!("{}", json),
            }
        }
        Command::Pdf { id, out } => {
            let written = client.download_pdf(&id, &out).await?;
            println!("Saved {} ({} bytes)", out.display(), written);
        }
        Command::CreatePatient {
            first_name,
            last_name,
            gender,
            date_of_birth,
            patient_id,
        } => {
            let patient = client
                .create_patient(&PatientCreate {
                    name_part1: first_name,
                    name_part2: last_name,
                    gender,
                    date_of_birth,
                    patient_id,
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&patient)?);
        }
        Command::Patients { limit } => {
            let patients = client.list_patients(limit).await?;
            if patients.is_empty() {
                println!("No patients found in this account");
            }
            for (i, patient) in patients.iter().enumerate() {
                println!("{}. {} {}", i + 1, patient.name.given, patient.name.family);
                println!("   UID: {}", patient.uid);
                if let Some(external_id) = &patient.external_id {
                    println!("   External ID: {}", external_id);
                }
                if let Some(gender) = &patient.gender {
                    println!("   Gender: {}", gender);
                }
                if let Some(date_of_birth) = &patient.date_of_birth {
                    println!("   DOB: {}", date_of_birth);
                }
            }
        }
        Command::Analyses { patient } => {
            let analyses = client.list_analyses(&patient).await?;
            println!("{}", serde_json::to_string_pretty(&analyses)?);
        }
        Command::Check => client.check_connection().await?,
    }
    Ok(())
}

/// Environment first, then whatever was given on the command line.
fn config_from_args(args: &Args) -> DiagnocatConfig {
    let mut config = DiagnocatConfig::from_env();
    if let Some(url) = &args.api_url {
        config = config.with_base_url(url);
    }
    if let Some(key) = &args.api_key {
        config = config.with_api_key(key);
    }
    if let Some(email) = &args.email {
        config.email = Some(email.clone());
    }
    if let Some(password) = &args.password {
        config.password = Some(password.clone());
    }
    config
}

fn tracing_subscriber_handler(args: &Args) {
    let env_filter = match args.log_level {
        LogLevel::Debug => "diagnocat_rs=debug,diagnocat=debug",
        LogLevel::Info => "diagnocat_rs=info,diagnocat=info",
        LogLevel::Warn => "diagnocat_rs=warn,diagnocat=warn",
        LogLevel::Error => "diagnocat_rs=error,diagnocat=error",
        LogLevel::Quiet => "diagnocat_rs=off,diagnocat=off",
    };

    // "if" because the subscriber doesn't yield the same type with or without time, which prevents
    // using a match statement.
    if args.timestamp {
        let sub = tracing_subscriber::fmt::Subscriber::builder()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .finish();
        tracing::subscriber::set_global_default(sub)
            .expect("Error while setting subscriber for tracing.");
    } else {
        let sub = tracing_subscriber::fmt::Subscriber::builder()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .without_time()
            .finish();
        tracing::subscriber::set_global_default(sub)
            .expect("Error while setting subscriber for tracing.");
    };
}
