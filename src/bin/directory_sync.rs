use std::process::ExitCode;

use clap::{Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use bbmri_directory_sync::config::{ConfigLoader, Credentials, ResolvedConfig};
use bbmri_directory_sync::directory::DirectoryHttpClient;
use bbmri_directory_sync::error::SyncError;
use bbmri_directory_sync::fhir::FhirHttpClient;
use bbmri_directory_sync::outcome::Outcome;
use bbmri_directory_sync::output::JsonOutput;
use bbmri_directory_sync::sync::{Sync, SyncOptions};

#[derive(Parser)]
#[command(name = "directory-sync")]
#[command(about = "Synchronizes a local FHIR store with the BBMRI-ERIC Directory")]
#[command(version, author)]
struct Cli {
    /// Path to the config file (default: ./directory-sync.json)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Override the star model donor threshold from the config file
    #[arg(long, global = true)]
    min_donors: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Update collection sizes in the Directory")]
    Sizes,
    #[command(about = "Update the full collection attribute set in the Directory")]
    Attributes,
    #[command(about = "Rebuild and push the anonymized fact table")]
    StarModel,
    #[command(about = "Copy biobank names from the Directory into the FHIR store")]
    Biobanks,
    #[command(about = "Run all sync jobs in order")]
    All,
}

fn main() -> ExitCode {
    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(report) => {
            eprintln!("{report:?}");
            if let Some(sync) = report.downcast_ref::<SyncError>() {
                return ExitCode::from(map_exit_code(sync));
            }
            ExitCode::from(1)
        }
    }
}

fn map_exit_code(error: &SyncError) -> u8 {
    match error {
        SyncError::MissingConfig
        | SyncError::ConfigRead(_)
        | SyncError::ConfigParse(_)
        | SyncError::MissingCredentials
        | SyncError::InvalidDirectoryId(_) => 2,
        SyncError::FhirHttp(_)
        | SyncError::FhirStatus { .. }
        | SyncError::DirectoryHttp(_)
        | SyncError::DirectoryStatus { .. }
        | SyncError::DirectoryLogin(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<bool> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ConfigLoader::resolve(cli.config.as_deref())?;

    let fhir = FhirHttpClient::new(&config.fhir_url, config.timeout)?;
    let directory = build_directory_client(&config)?;
    let sync = Sync::new(
        fhir,
        directory,
        SyncOptions {
            default_collection: config.default_collection.clone(),
            include_diagnosis_available: config.include_diagnosis_available,
            min_donors: cli.min_donors.unwrap_or(config.min_donors),
        },
    );

    let today = chrono::Local::now().date_naive();
    let jobs: Vec<(&str, Vec<Outcome>)> = match cli.command {
        Command::Sizes => vec![("collection-sizes", sync.sync_collection_sizes())],
        Command::Attributes => vec![("collection-attributes", sync.sync_collection_attributes())],
        Command::StarModel => vec![("star-model", sync.sync_star_model(today))],
        Command::Biobanks => vec![("biobank-names", sync.sync_biobank_names())],
        Command::All => vec![
            ("biobank-names", sync.sync_biobank_names()),
            ("collection-sizes", sync.sync_collection_sizes()),
            ("collection-attributes", sync.sync_collection_attributes()),
            ("star-model", sync.sync_star_model(today)),
        ],
    };

    let mut success = true;
    for (job, outcomes) in &jobs {
        JsonOutput::print_report(job, outcomes).into_diagnostic()?;
        success &= !outcomes.iter().any(Outcome::is_error);
    }
    Ok(success)
}

fn build_directory_client(config: &ResolvedConfig) -> Result<DirectoryHttpClient, SyncError> {
    match &config.credentials {
        Credentials::Token(token) => {
            DirectoryHttpClient::with_token(&config.directory_url, token, config.timeout)
        }
        Credentials::Login { username, password } => DirectoryHttpClient::with_login(
            &config.directory_url,
            username,
            password,
            config.timeout,
        ),
    }
}
