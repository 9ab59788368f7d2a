//! Derives Directory-facing reports from raw clinical resources: per
//! collection sizes, per collection attribute aggregates, and the star model
//! input rows.

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::{info, warn};

use crate::domain::{BbmriEricId, CollectionStat};
use crate::error::SyncError;
use crate::fhir::{FhirClient, SpecimenRecord};
use crate::star_model::{InputRow, StarModelDataset};

/// Determines the specimen count per collection.
///
/// Sites with exactly one biobank and one collection usually do not assign
/// specimens to collections at all. For those the total specimen count of the
/// store is attributed to the sole collection. Everyone else gets the
/// stratified size measure.
pub fn collection_sizes(
    fhir: &dyn FhirClient,
    default_collection: Option<&BbmriEricId>,
) -> Result<BTreeMap<BbmriEricId, u64>, SyncError> {
    let biobanks = fhir.list_biobanks()?;
    let collections = fhir.list_collections()?;

    if biobanks.len() == 1 && collections.len() == 1 {
        if let Some(id) = &collections[0].bbmri_id {
            let total = fhir.fetch_specimen_count()?;
            info!("single-collection site, attributing all {total} specimens to {id}");
            return Ok(BTreeMap::from([(id.clone(), total)]));
        }
    }

    let counts = fhir.evaluate_size_measure()?;
    let by_fhir_id: HashMap<&str, &BbmriEricId> = collections
        .iter()
        .filter_map(|c| c.bbmri_id.as_ref().map(|id| (c.fhir_id.as_str(), id)))
        .collect();

    let mut sizes: BTreeMap<BbmriEricId, u64> = BTreeMap::new();
    for (fhir_id, count) in counts {
        let id = match by_fhir_id.get(fhir_id.as_str()) {
            Some(id) => (*id).clone(),
            None => match default_collection {
                Some(default) => default.clone(),
                None => {
                    warn!("dropping {count} specimens of unmapped collection {fhir_id}");
                    continue;
                }
            },
        };
        // Several strata may fold onto one collection (unmapped ones onto the
        // default), so counts are summed rather than assigned.
        *sizes.entry(id).or_insert(0) += count;
    }
    Ok(sizes)
}

/// Assigns specimen records to collections. Records without a custodian get
/// the configured default collection, or the site's sole collection when
/// there is exactly one. Records that cannot be assigned are dropped.
pub fn group_by_collection(
    records: Vec<SpecimenRecord>,
    known_collections: &[BbmriEricId],
    default_collection: Option<&BbmriEricId>,
) -> BTreeMap<BbmriEricId, Vec<SpecimenRecord>> {
    let sole_collection = match known_collections {
        [only] => Some(only),
        _ => None,
    };
    let mut grouped: BTreeMap<BbmriEricId, Vec<SpecimenRecord>> = BTreeMap::new();
    let mut dropped = 0usize;
    for record in records {
        let id = record
            .collection_id
            .clone()
            .or_else(|| default_collection.cloned())
            .or_else(|| sole_collection.cloned());
        match id {
            Some(id) => grouped.entry(id).or_default().push(record),
            None => dropped += 1,
        }
    }
    if dropped > 0 {
        warn!("dropped {dropped} specimens without an assignable collection");
    }
    grouped
}

/// Aggregates the grouped specimen records into one attribute summary per
/// collection. Values stay in clinical vocabulary.
pub fn collection_stats(
    grouped: &BTreeMap<BbmriEricId, Vec<SpecimenRecord>>,
) -> Vec<CollectionStat> {
    grouped
        .iter()
        .map(|(id, records)| {
            let donors: HashSet<&str> = records.iter().map(|r| r.patient_id.as_str()).collect();
            let ages: Vec<i32> = records
                .iter()
                .filter_map(|r| r.age_at_collection.as_deref())
                .filter_map(|a| a.parse().ok())
                .collect();
            CollectionStat {
                id: id.clone(),
                size: records.len() as u64,
                number_of_donors: donors.len() as u64,
                sex: distinct(records.iter().filter_map(|r| r.sex.as_deref())),
                age_low: ages.iter().min().copied(),
                age_high: ages.iter().max().copied(),
                materials: distinct(records.iter().filter_map(|r| r.material.as_deref())),
                storage_temperatures: distinct(
                    records.iter().filter_map(|r| r.storage_temperature.as_deref()),
                ),
                diagnosis_available: distinct(
                    records.iter().flat_map(|r| r.diagnoses.iter().map(String::as_str)),
                ),
            }
        })
        .collect()
}

/// Fans the grouped specimen records out into star model input rows, one row
/// per specimen and diagnosis. Specimens without any diagnosis contribute one
/// row with the diagnosis unset.
pub fn star_model_input(
    grouped: &BTreeMap<BbmriEricId, Vec<SpecimenRecord>>,
    min_donors: u64,
) -> StarModelDataset {
    let mut dataset = StarModelDataset::new(min_donors);
    for (collection, records) in grouped {
        for record in records {
            let base = InputRow::new(
                record.material.as_deref(),
                &record.patient_id,
                record.sex.as_deref(),
                record.age_at_collection.as_deref(),
            );
            if record.diagnoses.is_empty() {
                dataset.add_input_row(collection.clone(), base);
                continue;
            }
            for diagnosis in &record.diagnoses {
                dataset.add_input_row(collection.clone(), base.with_diagnosis(diagnosis));
            }
        }
    }
    dataset
}

fn distinct<'a>(values: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut seen = HashSet::new();
    values
        .filter(|v| seen.insert(*v))
        .map(str::to_string)
        .collect()
}
