//! Directory (MOLGENIS) gateway: the trait the sync jobs consume and a
//! blocking HTTP implementation against the Directory REST API.

use std::collections::{HashMap, HashSet};
use std::thread;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::attributes::CollectionEntity;
use crate::domain::{BbmriEricId, DirectoryBiobank, RegistrySnapshot};
use crate::error::SyncError;
use crate::star_model::FactRecord;

const TOKEN_HEADER: &str = "x-molgenis-token";
// The Directory caps api/v2 page sizes at 10000 rows.
const PAGE_SIZE: usize = 10_000;

/// One entry of the collection size PUT payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectionSizeUpdate {
    pub id: BbmriEricId,
    pub size: u64,
}

pub trait DirectoryClient: Send + Sync {
    /// Looks a biobank up by id. Unknown biobanks yield `None` rather than an
    /// error, callers decide whether that is a problem.
    fn fetch_biobank(&self, id: &BbmriEricId) -> Result<Option<DirectoryBiobank>, SyncError>;
    fn list_collection_ids(&self, country_code: &str) -> Result<Vec<BbmriEricId>, SyncError>;
    fn update_collection_sizes(
        &self,
        country_code: &str,
        updates: &[CollectionSizeUpdate],
    ) -> Result<(), SyncError>;
    fn fetch_collection_snapshots(
        &self,
        country_code: &str,
        ids: &[BbmriEricId],
    ) -> Result<HashMap<BbmriEricId, RegistrySnapshot>, SyncError>;
    fn push_collection_attributes(
        &self,
        country_code: &str,
        entities: &[CollectionEntity],
    ) -> Result<(), SyncError>;
    fn push_fact_table(&self, country_code: &str, facts: &[FactRecord]) -> Result<(), SyncError>;
    /// Which of the given diagnosis codes the Directory accepts.
    fn list_valid_diagnoses(&self, codes: &[String]) -> Result<HashSet<String>, SyncError>;
}

pub struct DirectoryHttpClient {
    client: Client,
    base_url: String,
    token: String,
}

impl DirectoryHttpClient {
    /// Authenticates with username and password, trading them for a session
    /// token.
    pub fn with_login(
        base_url: &str,
        username: &str,
        password: &str,
        timeout: Duration,
    ) -> Result<Self, SyncError> {
        let mut client = Self::with_token(base_url, "", timeout)?;
        let url = format!("{}/api/v1/login", client.base_url);
        let response = client.send_with_retries(|| {
            client
                .client
                .post(&url)
                .json(&json!({"username": username, "password": password}))
        })?;
        if !response.status().is_success() {
            let message = response
                .text()
                .unwrap_or_else(|_| "login rejected".to_string());
            return Err(SyncError::DirectoryLogin(message));
        }
        let body: Value = response
            .json()
            .map_err(|err| SyncError::DirectoryLogin(err.to_string()))?;
        let token = body
            .get("token")
            .and_then(Value::as_str)
            .ok_or_else(|| SyncError::DirectoryLogin("login response has no token".to_string()))?;
        client.token = token.to_string();
        Ok(client)
    }

    /// Uses a pre-provisioned API token, skipping the login round trip.
    pub fn with_token(base_url: &str, token: &str, timeout: Duration) -> Result<Self, SyncError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("directory-sync/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| SyncError::DirectoryHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|err| SyncError::DirectoryHttp(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    fn send_with_retries<F>(&self, mut make_req: F) -> Result<reqwest::blocking::Response, SyncError>
    where
        F: FnMut() -> reqwest::blocking::RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            match make_req().header(TOKEN_HEADER, &self.token).send() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && matches!(status, 429 | 500 | 502 | 503 | 504) {
                        thread::sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1)));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES
                        && (err.is_timeout() || err.is_connect() || err.is_request())
                    {
                        thread::sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1)));
                        attempt += 1;
                        continue;
                    }
                    return Err(SyncError::DirectoryHttp(err.to_string()));
                }
            }
        }
    }

    fn handle_status(
        response: reqwest::blocking::Response,
    ) -> Result<reqwest::blocking::Response, SyncError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "Directory request failed".to_string());
        Err(SyncError::DirectoryStatus { status, message })
    }

    fn get_json(&self, url: &str) -> Result<Value, SyncError> {
        let response = self.send_with_retries(|| self.client.get(url))?;
        let response = Self::handle_status(response)?;
        response
            .json()
            .map_err(|err| SyncError::DirectoryHttp(err.to_string()))
    }

    fn put_entities<T: Serialize>(&self, url: &str, entities: &[T]) -> Result<(), SyncError> {
        let payload = json!({"entities": entities});
        let response = self.send_with_retries(|| self.client.put(url).json(&payload))?;
        Self::handle_status(response)?;
        Ok(())
    }

    /// Pages through an api/v2 table, collecting the raw rows.
    fn fetch_rows(&self, table: &str, attrs: &str) -> Result<Vec<Value>, SyncError> {
        let mut rows = Vec::new();
        let mut start = 0usize;
        loop {
            let url = format!(
                "{}/api/v2/{table}?attrs={attrs}&start={start}&num={PAGE_SIZE}",
                self.base_url
            );
            let body = self.get_json(&url)?;
            let items = body
                .get("items")
                .and_then(Value::as_array)
                .ok_or_else(|| {
                    SyncError::DirectoryResponse(format!("table {table} response has no items"))
                })?;
            let page_len = items.len();
            rows.extend(items.iter().cloned());
            if page_len < PAGE_SIZE {
                return Ok(rows);
            }
            start += PAGE_SIZE;
        }
    }

    fn collections_table(country_code: &str) -> String {
        format!("eu_bbmri_eric_{}_collections", country_code)
    }
}

impl DirectoryClient for DirectoryHttpClient {
    fn fetch_biobank(&self, id: &BbmriEricId) -> Result<Option<DirectoryBiobank>, SyncError> {
        let url = format!("{}/api/v2/eu_bbmri_eric_biobanks/{id}", self.base_url);
        let response = self.send_with_retries(|| self.client.get(&url))?;
        if response.status().as_u16() == 404 {
            return Ok(None);
        }
        let response = Self::handle_status(response)?;
        let biobank = response
            .json()
            .map_err(|err| SyncError::DirectoryResponse(err.to_string()))?;
        Ok(Some(biobank))
    }

    fn list_collection_ids(&self, country_code: &str) -> Result<Vec<BbmriEricId>, SyncError> {
        let rows = self.fetch_rows(&Self::collections_table(country_code), "id")?;
        Ok(parse_collection_ids(&rows))
    }

    fn update_collection_sizes(
        &self,
        country_code: &str,
        updates: &[CollectionSizeUpdate],
    ) -> Result<(), SyncError> {
        if updates.is_empty() {
            return Err(SyncError::EmptyBatch("collection size update"));
        }
        debug!(
            "updating size of {} collections in {country_code}",
            updates.len()
        );
        let url = format!(
            "{}/api/v2/{}/size",
            self.base_url,
            Self::collections_table(country_code)
        );
        self.put_entities(&url, updates)
    }

    fn fetch_collection_snapshots(
        &self,
        country_code: &str,
        ids: &[BbmriEricId],
    ) -> Result<HashMap<BbmriEricId, RegistrySnapshot>, SyncError> {
        let mut snapshots = HashMap::with_capacity(ids.len());
        for id in ids {
            let url = format!(
                "{}/api/v2/{}/{id}",
                self.base_url,
                Self::collections_table(country_code)
            );
            let row = self.get_json(&url)?;
            snapshots.insert(id.clone(), parse_snapshot(&row));
        }
        Ok(snapshots)
    }

    fn push_collection_attributes(
        &self,
        country_code: &str,
        entities: &[CollectionEntity],
    ) -> Result<(), SyncError> {
        if entities.is_empty() {
            return Err(SyncError::EmptyBatch("collection attribute update"));
        }
        debug!(
            "updating attributes of {} collections in {country_code}",
            entities.len()
        );
        let url = format!(
            "{}/api/v2/{}",
            self.base_url,
            Self::collections_table(country_code)
        );
        self.put_entities(&url, entities)
    }

    fn push_fact_table(&self, country_code: &str, facts: &[FactRecord]) -> Result<(), SyncError> {
        if facts.is_empty() {
            return Err(SyncError::EmptyBatch("fact table update"));
        }
        debug!("pushing {} facts for {country_code}", facts.len());
        let url = format!(
            "{}/api/v2/eu_bbmri_eric_{country_code}_facts",
            self.base_url
        );
        self.put_entities(&url, facts)
    }

    fn list_valid_diagnoses(&self, codes: &[String]) -> Result<HashSet<String>, SyncError> {
        let rows = self.fetch_rows("eu_bbmri_eric_disease_types", "id")?;
        let known: HashSet<&str> = rows
            .iter()
            .filter_map(|row| row.get("id").and_then(Value::as_str))
            .collect();
        Ok(codes
            .iter()
            .filter(|code| known.contains(code.as_str()))
            .cloned()
            .collect())
    }
}

/// Extracts the collection ids from the raw table rows. National-node tables
/// occasionally carry rows with malformed ids; those are skipped with a
/// warning instead of failing the whole listing.
fn parse_collection_ids(rows: &[Value]) -> Vec<BbmriEricId> {
    rows.iter()
        .filter_map(|row| row.get("id").and_then(Value::as_str))
        .filter_map(|id| match id.parse() {
            Ok(id) => Some(id),
            Err(_) => {
                warn!("ignoring collection row with unparseable id {id}");
                None
            }
        })
        .collect()
}

/// Extracts the descriptive snapshot fields from a collection row. Reference
/// attributes come back expanded as objects with an `id`.
fn parse_snapshot(row: &Value) -> RegistrySnapshot {
    RegistrySnapshot {
        name: string_of(row, "name"),
        description: string_of(row, "description"),
        contact_id: ref_id(row.get("contact")),
        country_id: ref_id(row.get("country")),
        biobank_id: ref_id(row.get("biobank")),
        type_ids: ref_ids(row.get("type")),
        data_category_ids: ref_ids(row.get("data_categories")),
        network_ids: ref_ids(row.get("network")),
    }
}

fn string_of(row: &Value, field: &str) -> Option<String> {
    row.get(field).and_then(Value::as_str).map(str::to_string)
}

fn ref_id(value: Option<&Value>) -> Option<String> {
    value?
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn ref_ids(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|v| v.get("id").and_then(Value::as_str))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_expanded_collection_row() {
        let row = json!({
            "id": "bbmri-eric:ID:DE_X:collection:0",
            "name": "Test Collection",
            "contact": {"id": "contact-1", "email": "x@example.com"},
            "country": {"id": "DE"},
            "biobank": {"id": "bbmri-eric:ID:DE_X", "name": "Test Biobank"},
            "type": [{"id": "SAMPLE"}, {"id": "RD"}],
            "data_categories": [{"id": "BIOLOGICAL_SAMPLES"}],
            "network": []
        });
        let snapshot = parse_snapshot(&row);
        assert_eq!(snapshot.name.as_deref(), Some("Test Collection"));
        assert_eq!(snapshot.description, None);
        assert_eq!(snapshot.contact_id.as_deref(), Some("contact-1"));
        assert_eq!(snapshot.country_id.as_deref(), Some("DE"));
        assert_eq!(snapshot.biobank_id.as_deref(), Some("bbmri-eric:ID:DE_X"));
        assert_eq!(snapshot.type_ids, vec!["SAMPLE", "RD"]);
        assert_eq!(snapshot.data_category_ids, vec!["BIOLOGICAL_SAMPLES"]);
        assert!(snapshot.network_ids.is_empty());
    }

    #[test]
    fn missing_references_stay_unset() {
        let snapshot = parse_snapshot(&json!({"id": "x"}));
        assert_eq!(snapshot.contact_id, None);
        assert_eq!(snapshot.biobank_id, None);
        assert!(snapshot.type_ids.is_empty());
    }

    #[test]
    fn collection_id_listing_skips_malformed_rows() {
        let rows = vec![
            json!({"id": "bbmri-eric:ID:DE_X:collection:0"}),
            json!({"id": "junk"}),
            json!({"name": "row without id"}),
            json!({"id": "bbmri-eric:ID:DE_X:collection:1"}),
        ];
        let ids = parse_collection_ids(&rows);
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0].to_string(), "bbmri-eric:ID:DE_X:collection:0");
        assert_eq!(ids[1].to_string(), "bbmri-eric:ID:DE_X:collection:1");
    }

    #[test]
    fn size_update_wire_format() {
        let update = CollectionSizeUpdate {
            id: "bbmri-eric:ID:DE_X:collection:0".parse().unwrap(),
            size: 42,
        };
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["id"], "bbmri-eric:ID:DE_X:collection:0");
        assert_eq!(json["size"], 42);
    }
}
