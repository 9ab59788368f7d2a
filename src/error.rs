use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum SyncError {
    #[error("invalid BBMRI-ERIC identifier: {0}")]
    InvalidDirectoryId(String),

    #[error("missing config file directory-sync.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("no Directory credentials configured (set directory_token or directory_user_name/directory_pass)")]
    MissingCredentials,

    #[error("FHIR request failed: {0}")]
    FhirHttp(String),

    #[error("FHIR store returned status {status}: {message}")]
    FhirStatus { status: u16, message: String },

    #[error("unexpected FHIR response shape: {0}")]
    FhirResponse(String),

    #[error("Directory request failed: {0}")]
    DirectoryHttp(String),

    #[error("Directory returned status {status}: {message}")]
    DirectoryStatus { status: u16, message: String },

    #[error("Directory login failed: {0}")]
    DirectoryLogin(String),

    #[error("unexpected Directory response shape: {0}")]
    DirectoryResponse(String),

    #[error("cannot derive order of magnitude for {field} of {collection}: value is zero")]
    ZeroCount {
        collection: String,
        field: &'static str,
    },

    #[error("no Directory snapshot for collection {0}")]
    MissingSnapshot(String),

    #[error("Directory snapshot for collection {collection} has no {field}")]
    IncompleteSnapshot {
        collection: String,
        field: &'static str,
    },

    #[error("empty batch: {0}")]
    EmptyBatch(&'static str),
}
