use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::domain::BbmriEricId;
use crate::error::SyncError;

/// Raw on-disk configuration, `directory-sync.json`.
#[derive(Debug, Deserialize)]
pub struct Config {
    pub fhir_url: String,
    pub directory_url: String,
    #[serde(default)]
    pub directory_user_name: Option<String>,
    #[serde(default)]
    pub directory_pass: Option<String>,
    #[serde(default)]
    pub directory_token: Option<String>,
    #[serde(default)]
    pub default_collection_id: Option<String>,
    #[serde(default)]
    pub min_donors: Option<u64>,
    #[serde(default)]
    pub include_diagnosis_available: Option<bool>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// How to authenticate against the Directory. A pre-provisioned token wins
/// over username and password.
#[derive(Debug, Clone)]
pub enum Credentials {
    Token(String),
    Login { username: String, password: String },
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub fhir_url: String,
    pub directory_url: String,
    pub credentials: Credentials,
    pub default_collection: Option<BbmriEricId>,
    pub min_donors: u64,
    pub include_diagnosis_available: bool,
    pub timeout: Duration,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, SyncError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from("directory-sync.json"),
        };

        if path.is_none() && !config_path.exists() {
            return Err(SyncError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| SyncError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| SyncError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, SyncError> {
        let credentials = match (
            config.directory_token,
            config.directory_user_name,
            config.directory_pass,
        ) {
            (Some(token), _, _) => Credentials::Token(token),
            (None, Some(username), Some(password)) => Credentials::Login { username, password },
            _ => return Err(SyncError::MissingCredentials),
        };

        let default_collection = config
            .default_collection_id
            .as_deref()
            .map(str::parse)
            .transpose()?;

        Ok(ResolvedConfig {
            fhir_url: config.fhir_url,
            directory_url: config.directory_url,
            credentials,
            default_collection,
            min_donors: config.min_donors.unwrap_or(10),
            include_diagnosis_available: config.include_diagnosis_available.unwrap_or(false),
            timeout: Duration::from_secs(config.timeout_secs.unwrap_or(30)),
        })
    }
}
