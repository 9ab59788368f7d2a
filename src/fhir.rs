//! Clinical (FHIR R4) gateway: the trait the pipelines consume and a
//! blocking HTTP implementation against a FHIR REST base URL.

use std::collections::HashMap;
use std::thread;
use std::time::Duration;

use chrono::NaiveDate;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde_json::Value;
use tracing::warn;

use crate::domain::BbmriEricId;
use crate::error::SyncError;

const BBMRI_IDENTIFIER_SYSTEM: &str = "http://www.bbmri-eric.eu/";
const BIOBANK_PROFILE: &str = "https://fhir.bbmri.de/StructureDefinition/Biobank";
const COLLECTION_PROFILE: &str = "https://fhir.bbmri.de/StructureDefinition/Collection";
const CUSTODIAN_EXTENSION: &str = "https://fhir.bbmri.de/StructureDefinition/Custodian";
const STORAGE_TEMPERATURE_EXTENSION: &str =
    "https://fhir.bbmri.de/StructureDefinition/StorageTemperature";
const SAMPLE_DIAGNOSIS_EXTENSION: &str = "https://fhir.bbmri.de/StructureDefinition/SampleDiagnosis";
const SIZE_MEASURE: &str = "https://fhir.bbmri.de/Measure/size";

/// A biobank or collection Organization as known to the clinical store.
#[derive(Debug, Clone)]
pub struct OrganizationRef {
    /// FHIR logical id, e.g. the `xyz` of `Organization/xyz`.
    pub fhir_id: String,
    pub bbmri_id: Option<BbmriEricId>,
    pub name: Option<String>,
}

/// One specimen joined with its donor: everything the aggregation and star
/// model steps need, still in clinical vocabulary.
#[derive(Debug, Clone)]
pub struct SpecimenRecord {
    pub collection_id: Option<BbmriEricId>,
    pub patient_id: String,
    pub sex: Option<String>,
    pub age_at_collection: Option<String>,
    pub material: Option<String>,
    pub storage_temperature: Option<String>,
    pub diagnoses: Vec<String>,
}

pub trait FhirClient: Send + Sync {
    fn list_biobanks(&self) -> Result<Vec<OrganizationRef>, SyncError>;
    fn list_collections(&self) -> Result<Vec<OrganizationRef>, SyncError>;
    fn fetch_specimen_count(&self) -> Result<u64, SyncError>;
    /// Evaluates the collection size measure; counts are keyed by the FHIR
    /// logical id of the stratifying collection Organization.
    fn evaluate_size_measure(&self) -> Result<HashMap<String, u64>, SyncError>;
    fn fetch_specimen_records(&self) -> Result<Vec<SpecimenRecord>, SyncError>;
    fn update_organization_name(&self, fhir_id: &str, name: &str) -> Result<(), SyncError>;
}

#[derive(Clone)]
pub struct FhirHttpClient {
    client: Client,
    base_url: String,
}

impl FhirHttpClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, SyncError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("directory-sync/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| SyncError::FhirHttp(err.to_string()))?,
        );
        headers.insert("Accept", HeaderValue::from_static("application/fhir+json"));
        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|err| SyncError::FhirHttp(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
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
            match make_req().send() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        thread::sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1)));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        thread::sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1)));
                        attempt += 1;
                        continue;
                    }
                    return Err(SyncError::FhirHttp(err.to_string()));
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
            .unwrap_or_else(|_| "FHIR request failed".to_string());
        Err(SyncError::FhirStatus { status, message })
    }

    fn get_json(&self, url: &str) -> Result<Value, SyncError> {
        let response = self.send_with_retries(|| self.client.get(url))?;
        let response = Self::handle_status(response)?;
        response
            .json()
            .map_err(|err| SyncError::FhirHttp(err.to_string()))
    }

    /// Collects the resources of a searchset bundle, following `next` links.
    fn search_all(&self, first_url: &str) -> Result<Vec<Value>, SyncError> {
        let mut resources = Vec::new();
        let mut url = Some(first_url.to_string());
        while let Some(current) = url.take() {
            let bundle = self.get_json(&current)?;
            if let Some(entries) = bundle.get("entry").and_then(Value::as_array) {
                for entry in entries {
                    if let Some(resource) = entry.get("resource") {
                        resources.push(resource.clone());
                    }
                }
            }
            url = bundle
                .get("link")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .find(|link| link.get("relation").and_then(Value::as_str) == Some("next"))
                .and_then(|link| link.get("url").and_then(Value::as_str))
                .map(str::to_string);
        }
        Ok(resources)
    }

    fn list_organizations(&self, profile: &str) -> Result<Vec<OrganizationRef>, SyncError> {
        let url = format!(
            "{}/Organization?_profile={profile}&_count=200",
            self.base_url
        );
        let orgs = self.search_all(&url)?;
        Ok(orgs.iter().map(organization_ref).collect())
    }

    fn fetch_patients(&self, ids: &[String]) -> Result<HashMap<String, Value>, SyncError> {
        let mut patients = HashMap::new();
        for chunk in ids.chunks(100) {
            let url = format!(
                "{}/Patient?_id={}&_count=100",
                self.base_url,
                chunk.join(",")
            );
            for patient in self.search_all(&url)? {
                if let Some(id) = patient.get("id").and_then(Value::as_str) {
                    patients.insert(id.to_string(), patient.clone());
                }
            }
        }
        Ok(patients)
    }

    fn fetch_condition_codes(&self) -> Result<HashMap<String, Vec<String>>, SyncError> {
        let url = format!("{}/Condition?_count=200", self.base_url);
        let mut by_patient: HashMap<String, Vec<String>> = HashMap::new();
        for condition in self.search_all(&url)? {
            let Some(patient_id) = condition
                .get("subject")
                .and_then(|s| s.get("reference"))
                .and_then(Value::as_str)
                .and_then(|r| r.strip_prefix("Patient/"))
            else {
                continue;
            };
            let codes = condition
                .get("code")
                .and_then(|c| c.get("coding"))
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter_map(|coding| coding.get("code").and_then(Value::as_str));
            by_patient
                .entry(patient_id.to_string())
                .or_default()
                .extend(codes.map(str::to_string));
        }
        Ok(by_patient)
    }
}

impl FhirClient for FhirHttpClient {
    fn list_biobanks(&self) -> Result<Vec<OrganizationRef>, SyncError> {
        self.list_organizations(BIOBANK_PROFILE)
    }

    fn list_collections(&self) -> Result<Vec<OrganizationRef>, SyncError> {
        self.list_organizations(COLLECTION_PROFILE)
    }

    fn fetch_specimen_count(&self) -> Result<u64, SyncError> {
        let url = format!("{}/Specimen?_summary=count", self.base_url);
        let bundle = self.get_json(&url)?;
        bundle
            .get("total")
            .and_then(Value::as_u64)
            .ok_or_else(|| SyncError::FhirResponse("Specimen count bundle has no total".to_string()))
    }

    fn evaluate_size_measure(&self) -> Result<HashMap<String, u64>, SyncError> {
        let url = format!(
            "{}/Measure/$evaluate-measure?periodStart=1900&periodEnd=2100&measure={SIZE_MEASURE}",
            self.base_url
        );
        let report = self.get_json(&url)?;
        Ok(extract_stratifier_counts(&report))
    }

    fn fetch_specimen_records(&self) -> Result<Vec<SpecimenRecord>, SyncError> {
        let url = format!("{}/Specimen?_count=200", self.base_url);
        let specimens = self.search_all(&url)?;

        let mut patient_ids: Vec<String> = specimens
            .iter()
            .filter_map(|s| patient_id_of(s))
            .map(str::to_string)
            .collect();
        patient_ids.sort();
        patient_ids.dedup();

        let patients = self.fetch_patients(&patient_ids)?;
        let conditions = self.fetch_condition_codes()?;

        let mut records = Vec::with_capacity(specimens.len());
        for specimen in &specimens {
            let Some(patient_id) = patient_id_of(specimen) else {
                warn!("skipping specimen without patient reference");
                continue;
            };
            let Some(patient) = patients.get(patient_id) else {
                warn!("skipping specimen of unknown patient {patient_id}");
                continue;
            };
            records.push(specimen_record(
                specimen,
                patient_id,
                patient,
                conditions.get(patient_id).map(Vec::as_slice).unwrap_or(&[]),
            ));
        }
        Ok(records)
    }

    fn update_organization_name(&self, fhir_id: &str, name: &str) -> Result<(), SyncError> {
        let url = format!("{}/Organization/{fhir_id}", self.base_url);
        let mut organization = self.get_json(&url)?;
        organization["name"] = Value::String(name.to_string());
        let response = self.send_with_retries(|| {
            self.client
                .put(&url)
                .header("Content-Type", "application/fhir+json")
                .json(&organization)
        })?;
        Self::handle_status(response)?;
        Ok(())
    }
}

fn organization_ref(org: &Value) -> OrganizationRef {
    let bbmri_id = org
        .get("identifier")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .find(|i| i.get("system").and_then(Value::as_str) == Some(BBMRI_IDENTIFIER_SYSTEM))
        .and_then(|i| i.get("value").and_then(Value::as_str))
        .and_then(|v| v.parse().ok());
    OrganizationRef {
        fhir_id: org
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        bbmri_id,
        name: org
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_string),
    }
}

fn extract_stratifier_counts(report: &Value) -> HashMap<String, u64> {
    let strata = report
        .pointer("/group/0/stratifier/0/stratum")
        .and_then(Value::as_array);
    let mut counts = HashMap::new();
    for stratum in strata.into_iter().flatten() {
        let Some(text) = stratum.pointer("/value/text").and_then(Value::as_str) else {
            continue;
        };
        // Stratum values look like "Organization/<id>".
        let parts: Vec<&str> = text.split('/').collect();
        if parts.len() != 2 {
            continue;
        }
        if let Some(count) = stratum.pointer("/population/0/count").and_then(Value::as_u64) {
            counts.insert(parts[1].to_string(), count);
        }
    }
    counts
}

fn patient_id_of(specimen: &Value) -> Option<&str> {
    specimen
        .pointer("/subject/reference")
        .and_then(Value::as_str)
        .and_then(|r| r.strip_prefix("Patient/"))
}

fn specimen_record(
    specimen: &Value,
    patient_id: &str,
    patient: &Value,
    patient_conditions: &[String],
) -> SpecimenRecord {
    let sex = patient
        .get("gender")
        .and_then(Value::as_str)
        .map(str::to_string);

    let collected = specimen
        .pointer("/collection/collectedDateTime")
        .and_then(Value::as_str)
        .and_then(parse_fhir_date);
    let birth_date = patient
        .get("birthDate")
        .and_then(Value::as_str)
        .and_then(parse_fhir_date);
    let age_at_collection = age_in_years(birth_date, collected);

    let material = specimen
        .pointer("/type/text")
        .and_then(Value::as_str)
        .or_else(|| specimen.pointer("/type/coding/0/code").and_then(Value::as_str))
        .map(str::to_string);

    let mut diagnoses: Vec<String> = patient_conditions.to_vec();
    diagnoses.extend(extension_codes(specimen, SAMPLE_DIAGNOSIS_EXTENSION));
    diagnoses.sort();
    diagnoses.dedup();

    SpecimenRecord {
        collection_id: custodian_collection_id(specimen),
        patient_id: patient_id.to_string(),
        sex,
        age_at_collection,
        material,
        storage_temperature: extension_codes(specimen, STORAGE_TEMPERATURE_EXTENSION)
            .into_iter()
            .next(),
        diagnoses,
    }
}

fn custodian_collection_id(specimen: &Value) -> Option<BbmriEricId> {
    specimen
        .get("extension")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .find(|e| e.get("url").and_then(Value::as_str) == Some(CUSTODIAN_EXTENSION))
        .and_then(|e| e.pointer("/valueReference/identifier/value"))
        .and_then(Value::as_str)
        .and_then(|v| v.parse().ok())
}

fn extension_codes(specimen: &Value, extension_url: &str) -> Vec<String> {
    specimen
        .get("extension")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter(|e| e.get("url").and_then(Value::as_str) == Some(extension_url))
        .flat_map(|e| {
            e.pointer("/valueCodeableConcept/coding")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter_map(|coding| coding.get("code").and_then(Value::as_str))
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .collect()
}

/// FHIR dates may be year, year-month, or full dates; partial dates resolve
/// to the first day of the period.
fn parse_fhir_date(value: &str) -> Option<NaiveDate> {
    let date_part = value.get(..10).unwrap_or(value);
    if let Ok(date) = NaiveDate::parse_from_str(date_part, "%Y-%m-%d") {
        return Some(date);
    }
    if let Some(year_month) = value.get(..7) {
        if let Ok(date) = NaiveDate::parse_from_str(&format!("{year_month}-01"), "%Y-%m-%d") {
            return Some(date);
        }
    }
    let year = value.get(..4)?;
    NaiveDate::parse_from_str(&format!("{year}-01-01"), "%Y-%m-%d").ok()
}

fn age_in_years(birth_date: Option<NaiveDate>, collected: Option<NaiveDate>) -> Option<String> {
    let (birth, collected) = (birth_date?, collected?);
    match collected.years_since(birth) {
        Some(years) => Some(years.to_string()),
        None => {
            warn!("specimen collected before the donor's birth date, dropping age");
            None
        }
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn extracts_stratifier_counts() {
        let report = json!({
            "group": [{
                "stratifier": [{
                    "stratum": [
                        {
                            "value": {"text": "Organization/collection-1"},
                            "population": [{"count": 42}]
                        },
                        {
                            "value": {"text": "not-a-reference"},
                            "population": [{"count": 7}]
                        }
                    ]
                }]
            }]
        });
        let counts = extract_stratifier_counts(&report);
        assert_eq!(counts.len(), 1);
        assert_eq!(counts["collection-1"], 42);
    }

    #[test]
    fn organization_ref_picks_bbmri_identifier() {
        let org = json!({
            "id": "org-1",
            "name": "Test Biobank",
            "identifier": [
                {"system": "urn:other", "value": "xyz"},
                {"system": "http://www.bbmri-eric.eu/", "value": "bbmri-eric:ID:DE_LMB"}
            ]
        });
        let reference = organization_ref(&org);
        assert_eq!(reference.fhir_id, "org-1");
        assert_eq!(reference.name.as_deref(), Some("Test Biobank"));
        assert_eq!(
            reference.bbmri_id.unwrap().to_string(),
            "bbmri-eric:ID:DE_LMB"
        );
    }

    #[test]
    fn specimen_record_joins_patient_and_extensions() {
        let specimen = json!({
            "id": "spec-1",
            "subject": {"reference": "Patient/pat-1"},
            "type": {"coding": [{"code": "whole-blood"}]},
            "collection": {"collectedDateTime": "2020-06-01"},
            "extension": [
                {
                    "url": "https://fhir.bbmri.de/StructureDefinition/Custodian",
                    "valueReference": {"identifier": {"value": "bbmri-eric:ID:DE_X:collection:0"}}
                },
                {
                    "url": "https://fhir.bbmri.de/StructureDefinition/StorageTemperature",
                    "valueCodeableConcept": {"coding": [{"code": "temperatureGN"}]}
                },
                {
                    "url": "https://fhir.bbmri.de/StructureDefinition/SampleDiagnosis",
                    "valueCodeableConcept": {"coding": [{"code": "C75"}]}
                }
            ]
        });
        let patient = json!({"id": "pat-1", "gender": "male", "birthDate": "1990-01-15"});

        let record = specimen_record(&specimen, "pat-1", &patient, &["E23.1".to_string()]);
        assert_eq!(record.patient_id, "pat-1");
        assert_eq!(record.sex.as_deref(), Some("male"));
        assert_eq!(record.age_at_collection.as_deref(), Some("30"));
        assert_eq!(record.material.as_deref(), Some("whole-blood"));
        assert_eq!(record.storage_temperature.as_deref(), Some("temperatureGN"));
        assert_eq!(record.diagnoses, vec!["C75", "E23.1"]);
        assert_eq!(
            record.collection_id.unwrap().to_string(),
            "bbmri-eric:ID:DE_X:collection:0"
        );
    }

    #[test]
    fn partial_fhir_dates_resolve_to_period_start() {
        assert_eq!(
            parse_fhir_date("1990"),
            NaiveDate::from_ymd_opt(1990, 1, 1)
        );
        assert_eq!(
            parse_fhir_date("1990-06"),
            NaiveDate::from_ymd_opt(1990, 6, 1)
        );
        assert_eq!(
            parse_fhir_date("1990-06-15T12:00:00Z"),
            NaiveDate::from_ymd_opt(1990, 6, 15)
        );
    }

    #[test]
    fn negative_age_is_dropped() {
        let birth = NaiveDate::from_ymd_opt(2000, 1, 1);
        let collected = NaiveDate::from_ymd_opt(1990, 1, 1);
        assert_eq!(age_in_years(birth, collected), None);
        assert_eq!(age_in_years(collected, birth).as_deref(), Some("10"));
    }
}
