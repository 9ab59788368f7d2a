//! Sync job orchestration. Each job pulls from the clinical store, converts,
//! and pushes to the Directory, reporting its result as a list of outcomes
//! instead of failing the process.

use std::collections::{BTreeMap, HashSet};

use chrono::NaiveDate;
use tracing::{info, warn};

use crate::attributes::{CollectionEntity, ConvertOptions, convert_collections};
use crate::directory::{CollectionSizeUpdate, DirectoryClient};
use crate::domain::BbmriEricId;
use crate::fhir::{FhirClient, SpecimenRecord};
use crate::merge::merge_snapshots;
use crate::outcome::{Outcome, error_outcomes};
use crate::reporting;
use crate::star_model::diagnosis_corrections;

/// Per-run settings shared by the sync jobs.
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Collection that receives specimens without an assignable collection.
    pub default_collection: Option<BbmriEricId>,
    pub include_diagnosis_available: bool,
    /// Privacy threshold for the star model; groups with fewer donors are
    /// withheld. Zero disables filtering.
    pub min_donors: u64,
}

pub struct Sync<F, D> {
    fhir: F,
    directory: D,
    options: SyncOptions,
}

impl<F: FhirClient, D: DirectoryClient> Sync<F, D> {
    pub fn new(fhir: F, directory: D, options: SyncOptions) -> Self {
        Self {
            fhir,
            directory,
            options,
        }
    }

    /// Updates the collection `size` attribute in the Directory. Collections
    /// are pushed per country; a failing country never blocks the others.
    pub fn sync_collection_sizes(&self) -> Vec<Outcome> {
        let sizes = match reporting::collection_sizes(
            &self.fhir,
            self.options.default_collection.as_ref(),
        ) {
            Ok(sizes) => sizes,
            Err(err) => return error_outcomes("collection size determination", err),
        };
        if sizes.is_empty() {
            return error_outcomes("collection size determination", "no collections found");
        }

        let mut by_country: BTreeMap<String, Vec<CollectionSizeUpdate>> = BTreeMap::new();
        for (id, size) in sizes {
            by_country
                .entry(id.country_code().to_string())
                .or_default()
                .push(CollectionSizeUpdate { id, size });
        }

        let mut outcomes = Vec::new();
        for (country, updates) in by_country {
            // Only collections the Directory already knows can be updated;
            // the size endpoint rejects batches containing unknown ids.
            let known: HashSet<BbmriEricId> = match self.directory.list_collection_ids(&country) {
                Ok(ids) => ids.into_iter().collect(),
                Err(err) => {
                    outcomes.push(Outcome::error(
                        &format!("collection listing for {country}"),
                        err,
                    ));
                    continue;
                }
            };
            let updates: Vec<CollectionSizeUpdate> = updates
                .into_iter()
                .inspect(|update| {
                    if !known.contains(&update.id) {
                        warn!("skipping {}: unknown to the Directory", update.id);
                    }
                })
                .filter(|update| known.contains(&update.id))
                .collect();
            if updates.is_empty() {
                outcomes.push(Outcome::error(
                    &format!("collection size update for {country}"),
                    "no collection is known to the Directory",
                ));
                continue;
            }
            match self.directory.update_collection_sizes(&country, &updates) {
                Ok(()) => {
                    info!("updated {} collection sizes in {country}", updates.len());
                    outcomes.push(Outcome::updated("collection size", updates.len()));
                }
                Err(err) => {
                    warn!("collection size update for {country} failed: {err}");
                    outcomes.push(Outcome::error(
                        &format!("collection size update for {country}"),
                        err,
                    ));
                }
            }
        }
        outcomes
    }

    /// Updates the full collection attribute set (counts, demographics,
    /// materials) in the Directory. The whole job stops at the first failing
    /// step, a partial push is worse than none.
    pub fn sync_collection_attributes(&self) -> Vec<Outcome> {
        let grouped = match self.grouped_specimens() {
            Ok(grouped) => grouped,
            Err(outcomes) => return outcomes,
        };
        if grouped.is_empty() {
            return error_outcomes("collection attribute update", "no specimens found");
        }

        let stats = reporting::collection_stats(&grouped);
        let convert_options = ConvertOptions {
            include_diagnosis_available: self.options.include_diagnosis_available,
        };
        let mut entities = match convert_collections(&stats, &convert_options) {
            Ok(entities) => entities,
            Err(err) => return error_outcomes("collection attribute conversion", err),
        };

        let mut outcomes = Vec::new();
        for (country, country_entities) in split_by_country(&mut entities) {
            let ids: Vec<BbmriEricId> =
                country_entities.iter().map(|e| e.id.clone()).collect();
            let snapshots = match self.directory.fetch_collection_snapshots(&country, &ids) {
                Ok(snapshots) => snapshots,
                Err(err) => return error_outcomes("Directory snapshot fetch", err),
            };
            if let Err(err) = merge_snapshots(&snapshots, country_entities) {
                return error_outcomes("Directory snapshot merge", err);
            }
            if let Err(err) = self
                .directory
                .push_collection_attributes(&country, country_entities)
            {
                return error_outcomes(
                    &format!("collection attribute update for {country}"),
                    err,
                );
            }
            info!(
                "updated attributes of {} collections in {country}",
                country_entities.len()
            );
            outcomes.push(Outcome::updated(
                "collection attribute",
                country_entities.len(),
            ));
        }
        outcomes
    }

    /// Builds the anonymized fact table from the clinical store and replaces
    /// the Directory's facts with it. `today` becomes the facts' last update
    /// date.
    pub fn sync_star_model(&self, today: NaiveDate) -> Vec<Outcome> {
        let grouped = match self.grouped_specimens() {
            Ok(grouped) => grouped,
            Err(outcomes) => return outcomes,
        };

        let mut dataset = reporting::star_model_input(&grouped, self.options.min_donors);
        if dataset.input_row_count() == 0 {
            return error_outcomes("star model aggregation", "no input rows");
        }
        dataset.create_fact_tables(today);
        info!(
            "aggregated {} input rows into {} facts",
            dataset.input_row_count(),
            dataset.fact_count()
        );
        if dataset.fact_count() == 0 {
            return vec![Outcome::info(
                "no fact met the donor threshold, nothing to push",
            )];
        }

        // The Directory rejects whole fact batches over a single unknown
        // diagnosis code, so unknown codes are remapped or withheld upfront.
        // Parents are queried alongside so subcodes can fall back to them.
        let used = dataset.disease_codes();
        let mut query = used.clone();
        query.extend(
            used.iter()
                .filter_map(|code| code.split_once('.').map(|(parent, _)| parent.to_string())),
        );
        query.sort();
        query.dedup();
        let accepted = match self.directory.list_valid_diagnoses(&query) {
            Ok(accepted) => accepted,
            Err(err) => return error_outcomes("Directory diagnosis lookup", err),
        };
        let corrections = diagnosis_corrections(&used, &accepted);
        dataset.apply_diagnosis_corrections(&corrections);
        if dataset.fact_count() == 0 {
            return vec![Outcome::info(
                "all facts were withheld after diagnosis correction",
            )];
        }

        // All collections of a run belong to one national node.
        let Some(country) = dataset.country_code().map(str::to_string) else {
            return error_outcomes("star model update", "facts carry no country code");
        };
        match self.directory.push_fact_table(&country, dataset.facts()) {
            Ok(()) => vec![Outcome::updated("fact", dataset.fact_count())],
            Err(err) => error_outcomes(&format!("fact table update for {country}"), err),
        }
    }

    /// Copies biobank names from the Directory into the clinical store. The
    /// Directory is authoritative for names; local stores tend to carry
    /// placeholders.
    pub fn sync_biobank_names(&self) -> Vec<Outcome> {
        let biobanks = match self.fhir.list_biobanks() {
            Ok(biobanks) => biobanks,
            Err(err) => return error_outcomes("biobank listing", err),
        };

        let mut updated = 0usize;
        let mut outcomes = Vec::new();
        for biobank in biobanks {
            let Some(id) = &biobank.bbmri_id else {
                outcomes.push(Outcome::error(
                    "biobank name update",
                    format!("biobank {} has no Directory id", biobank.fhir_id),
                ));
                continue;
            };
            let directory_name = match self.directory.fetch_biobank(id) {
                Ok(Some(entry)) => entry.name,
                Ok(None) => {
                    outcomes.push(Outcome::info(format!(
                        "biobank {id} not found in the Directory, skipping"
                    )));
                    continue;
                }
                Err(err) => {
                    outcomes.push(Outcome::error("biobank name update", err));
                    continue;
                }
            };
            let Some(name) = directory_name else {
                continue;
            };
            if biobank.name.as_deref() == Some(name.as_str()) {
                continue;
            }
            match self
                .fhir
                .update_organization_name(&biobank.fhir_id, &name)
            {
                Ok(()) => {
                    info!("renamed biobank {id} to {name:?}");
                    updated += 1;
                }
                Err(err) => outcomes.push(Outcome::error("biobank name update", err)),
            }
        }
        outcomes.push(Outcome::updated("biobank name", updated));
        outcomes
    }

    fn grouped_specimens(
        &self,
    ) -> Result<BTreeMap<BbmriEricId, Vec<SpecimenRecord>>, Vec<Outcome>> {
        let records = self
            .fhir
            .fetch_specimen_records()
            .map_err(|err| error_outcomes("specimen fetch", err))?;
        let collections = self
            .fhir
            .list_collections()
            .map_err(|err| error_outcomes("collection listing", err))?;
        let known: Vec<BbmriEricId> = collections
            .into_iter()
            .filter_map(|c| c.bbmri_id)
            .collect();
        Ok(reporting::group_by_collection(
            records,
            &known,
            self.options.default_collection.as_ref(),
        ))
    }
}

/// Splits a converted batch into per-country slices. Entities are sorted by
/// id first, so one country is always one contiguous run.
fn split_by_country(
    entities: &mut [CollectionEntity],
) -> Vec<(String, &mut [CollectionEntity])> {
    entities.sort_by(|a, b| a.id.cmp(&b.id));
    let mut result = Vec::new();
    let mut rest = entities;
    while !rest.is_empty() {
        let country = rest[0].id.country_code().to_string();
        let split = rest
            .iter()
            .position(|e| e.id.country_code() != country)
            .unwrap_or(rest.len());
        let (head, tail) = rest.split_at_mut(split);
        result.push((country, head));
        rest = tail;
    }
    result
}
