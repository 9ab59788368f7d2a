//! Converts per-collection aggregates into the Directory collection PUT
//! payload. The whole batch fails if any single collection fails: a partially
//! converted batch must never be pushed.

use serde::Serialize;
use tracing::error;

use crate::convert;
use crate::domain::{BbmriEricId, CollectionStat};
use crate::error::SyncError;

/// One entry of the Directory collection PUT payload, with the wire field
/// names the Directory expects. Descriptive fields stay empty until the merge
/// step copies them over from the Directory's own snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectionEntity {
    pub id: BbmriEricId,
    pub size: u64,
    pub order_of_magnitude: u32,
    pub number_of_donors: u64,
    pub order_of_magnitude_donors: u32,
    pub sex: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age_low: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age_high: Option<i32>,
    pub materials: Vec<String>,
    pub storage_temperatures: Vec<String>,
    pub diagnosis_available: Vec<String>,
    #[serde(rename = "type")]
    pub type_ids: Vec<String>,
    pub data_categories: Vec<String>,
    pub network: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub biobank: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConvertOptions {
    /// The Directory rejects whole PUT payloads over unknown ICD-10 codes in
    /// `diagnosis_available`, so the field is emitted empty unless this is
    /// explicitly enabled.
    pub include_diagnosis_available: bool,
}

/// Converts a batch of collection aggregates, all-or-nothing.
pub fn convert_collections(
    stats: &[CollectionStat],
    options: &ConvertOptions,
) -> Result<Vec<CollectionEntity>, SyncError> {
    stats
        .iter()
        .map(|stat| {
            convert_collection(stat, options).inspect_err(|err| {
                error!("problem converting clinical attributes to Directory attributes: {err}");
            })
        })
        .collect()
}

fn convert_collection(
    stat: &CollectionStat,
    options: &ConvertOptions,
) -> Result<CollectionEntity, SyncError> {
    // Order of magnitude is mandatory in the Directory and can be derived
    // from the counts, but only for positive values.
    let order_of_magnitude = order_of_magnitude(&stat.id, "size", stat.size)?;
    let order_of_magnitude_donors =
        self::order_of_magnitude(&stat.id, "number_of_donors", stat.number_of_donors)?;

    let diagnosis_available = if options.include_diagnosis_available {
        dedup(
            stat.diagnosis_available
                .iter()
                .filter_map(|code| convert::convert_diagnosis(code)),
        )
    } else {
        Vec::new()
    };

    Ok(CollectionEntity {
        id: stat.id.clone(),
        size: stat.size,
        order_of_magnitude,
        number_of_donors: stat.number_of_donors,
        order_of_magnitude_donors,
        sex: stat.sex.iter().map(|s| convert::convert_sex(s)).collect(),
        age_low: stat.age_low,
        age_high: stat.age_high,
        materials: convert::convert_material_list(&stat.materials),
        storage_temperatures: convert::convert_storage_temperature_list(&stat.storage_temperatures),
        diagnosis_available,
        type_ids: Vec::new(),
        data_categories: Vec::new(),
        network: Vec::new(),
        name: None,
        description: None,
        contact: None,
        country: None,
        biobank: None,
    })
}

fn order_of_magnitude(
    id: &BbmriEricId,
    field: &'static str,
    value: u64,
) -> Result<u32, SyncError> {
    if value == 0 {
        return Err(SyncError::ZeroCount {
            collection: id.to_string(),
            field,
        });
    }
    Ok(value.ilog10())
}

fn dedup(values: impl Iterator<Item = String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    values.filter(|v| seen.insert(v.clone())).collect()
}
