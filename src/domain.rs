use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// A BBMRI-ERIC identifier of the form `bbmri-eric:ID:<CC>_<suffix>`,
/// optionally followed by `:collection:<n>`. The country code is always the
/// two upper-case letters directly after `ID:`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BbmriEricId {
    country_code: String,
    suffix: String,
}

fn id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new("^bbmri-eric:ID:([A-Z]{2})(_.+)$").unwrap())
}

impl BbmriEricId {
    /// The two-letter upper-case country code, e.g. "DE".
    pub fn country_code(&self) -> &str {
        &self.country_code
    }

    /// Everything after the country code, including any `:collection:` part.
    pub fn suffix(&self) -> &str {
        &self.suffix
    }
}

impl fmt::Display for BbmriEricId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bbmri-eric:ID:{}{}", self.country_code, self.suffix)
    }
}

impl FromStr for BbmriEricId {
    type Err = SyncError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let captures = id_pattern()
            .captures(value)
            .ok_or_else(|| SyncError::InvalidDirectoryId(value.to_string()))?;
        Ok(Self {
            country_code: captures[1].to_string(),
            suffix: captures[2].to_string(),
        })
    }
}

impl Serialize for BbmriEricId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for BbmriEricId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}

/// Raw per-collection aggregate, as derived from the clinical store. Values
/// still carry the clinical vocabulary; conversion to Directory vocabulary
/// happens in `attributes`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionStat {
    pub id: BbmriEricId,
    pub size: u64,
    pub number_of_donors: u64,
    pub sex: Vec<String>,
    pub age_low: Option<i32>,
    pub age_high: Option<i32>,
    pub materials: Vec<String>,
    pub storage_temperatures: Vec<String>,
    pub diagnosis_available: Vec<String>,
}

/// The Directory's current descriptive metadata for one collection. Fetched
/// once per run and merged read-only into the PUT payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrySnapshot {
    pub name: Option<String>,
    pub description: Option<String>,
    pub contact_id: Option<String>,
    pub country_id: Option<String>,
    pub biobank_id: Option<String>,
    pub type_ids: Vec<String>,
    pub data_category_ids: Vec<String>,
    pub network_ids: Vec<String>,
}

/// A biobank as known to the Directory.
#[derive(Debug, Clone, Deserialize)]
pub struct DirectoryBiobank {
    pub id: String,
    pub name: Option<String>,
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_biobank_id() {
        let id: BbmriEricId = "bbmri-eric:ID:DE_LMB".parse().unwrap();
        assert_eq!(id.country_code(), "DE");
        assert_eq!(id.suffix(), "_LMB");
        assert_eq!(id.to_string(), "bbmri-eric:ID:DE_LMB");
    }

    #[test]
    fn parse_collection_id_round_trip() {
        let id: BbmriEricId = "bbmri-eric:ID:DE_185943:collection:0".parse().unwrap();
        assert_eq!(id.country_code(), "DE");
        assert_eq!(id.to_string(), "bbmri-eric:ID:DE_185943:collection:0");
    }

    #[test]
    fn parse_rejects_wrong_prefix() {
        let err = "foo:ID:DE_X".parse::<BbmriEricId>().unwrap_err();
        assert_matches!(err, SyncError::InvalidDirectoryId(_));
    }

    #[test]
    fn parse_rejects_missing_underscore() {
        let err = "bbmri-eric:ID:GERMUG".parse::<BbmriEricId>().unwrap_err();
        assert_matches!(err, SyncError::InvalidDirectoryId(_));
    }

    #[test]
    fn parse_rejects_lowercase_country() {
        assert!("bbmri-eric:ID:de_LMB".parse::<BbmriEricId>().is_err());
    }

    #[test]
    fn serde_round_trip() {
        let id: BbmriEricId = "bbmri-eric:ID:NL_001".parse().unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"bbmri-eric:ID:NL_001\"");
        let back: BbmriEricId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
