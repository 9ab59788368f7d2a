//! Star model aggregation: turns per-patient specimen rows into anonymized,
//! threshold-filtered fact records ready for the Directory fact table.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::NaiveDate;
use serde::Serialize;
use tracing::warn;

use crate::convert;
use crate::domain::BbmriEricId;

const FACT_ID_PREFIX: &str = "bbmri-eric:factID:";
const COLLECTION_ID_PREFIX: &str = "bbmri-eric:ID:";

/// One Patient x Specimen x Diagnosis combination. Values are already in
/// Directory vocabulary; the age at diagnosis stays a raw string until
/// bucketing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputRow {
    pub patient_id: String,
    pub sex: Option<String>,
    pub diagnosis: Option<String>,
    pub age_at_diagnosis: Option<String>,
    pub sample_material: Option<String>,
}

impl InputRow {
    pub fn new(
        sample_material: Option<&str>,
        patient_id: &str,
        sex: Option<&str>,
        age_at_diagnosis: Option<&str>,
    ) -> Self {
        Self {
            patient_id: patient_id.to_string(),
            sex: sex.map(convert::convert_sex),
            diagnosis: None,
            age_at_diagnosis: age_at_diagnosis.map(str::to_string),
            sample_material: sample_material.map(convert::convert_material),
        }
    }

    /// A copy of this row for one concrete diagnosis. Codes the Directory
    /// vocabulary cannot express leave the diagnosis unset, which discards
    /// the row during grouping.
    pub fn with_diagnosis(&self, diagnosis: &str) -> Self {
        let mut row = self.clone();
        row.diagnosis = convert::convert_diagnosis(diagnosis);
        row
    }
}

/// One anonymized group, in Directory fact table wire format. Counts go over
/// the wire as strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FactRecord {
    pub sex: String,
    pub disease: String,
    pub age_range: String,
    pub sample_type: String,
    pub number_of_donors: String,
    pub number_of_samples: String,
    pub id: String,
    pub last_update: String,
    pub collection: BbmriEricId,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct GroupKey {
    sex: String,
    disease: String,
    age_range: String,
    sample_material: String,
}

impl GroupKey {
    fn canonical(&self) -> String {
        format!(
            "{}_{}_{}_{}",
            self.sex, self.disease, self.age_range, self.sample_material
        )
    }
}

/// Run-scoped accumulator: raw input rows per collection on the way in, the
/// flat fact list on the way out.
#[derive(Debug, Default)]
pub struct StarModelDataset {
    input: BTreeMap<BbmriEricId, Vec<InputRow>>,
    facts: Vec<FactRecord>,
    min_donors: u64,
}

impl StarModelDataset {
    /// `min_donors` is the privacy threshold: groups with fewer donors are
    /// withheld from the output. Zero disables filtering.
    pub fn new(min_donors: u64) -> Self {
        Self {
            min_donors,
            ..Self::default()
        }
    }

    pub fn add_input_row(&mut self, collection: BbmriEricId, row: InputRow) {
        self.input.entry(collection).or_default().push(row);
    }

    pub fn input_row_count(&self) -> usize {
        self.input.values().map(Vec::len).sum()
    }

    pub fn facts(&self) -> &[FactRecord] {
        &self.facts
    }

    pub fn fact_count(&self) -> usize {
        self.facts.len()
    }

    /// Country code shared by all facts, taken from the first fact's
    /// collection id. All collections of a run belong to one site.
    pub fn country_code(&self) -> Option<&str> {
        self.facts.first().map(|fact| fact.collection.country_code())
    }

    /// The distinct disease codes present in the fact output.
    pub fn disease_codes(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.facts
            .iter()
            .filter(|fact| seen.insert(fact.disease.clone()))
            .map(|fact| fact.disease.clone())
            .collect()
    }

    /// Groups the input rows into fact records, applying the donor threshold
    /// before any output is built. `today` becomes the facts' `last_update`.
    pub fn create_fact_tables(&mut self, today: NaiveDate) {
        let last_update = today.to_string();
        for (collection, rows) in &self.input {
            let mut groups: BTreeMap<GroupKey, u64> = BTreeMap::new();
            for row in rows {
                // Rows with any missing grouping field cannot be anonymized
                // into a bucket and are discarded.
                let (Some(sex), Some(disease), Some(material)) =
                    (&row.sex, &row.diagnosis, &row.sample_material)
                else {
                    continue;
                };
                let key = GroupKey {
                    sex: sex.clone(),
                    disease: disease.clone(),
                    age_range: cut_age_range(row.age_at_diagnosis.as_deref()).to_string(),
                    sample_material: material.clone(),
                };
                *groups.entry(key).or_insert(0) += 1;
            }

            for (key, count) in groups {
                if self.min_donors > 0 && count < self.min_donors {
                    continue;
                }
                // One row per patient/diagnosis/specimen combination, so the
                // group count doubles as donor count and sample count.
                let count = count.to_string();
                self.facts.push(FactRecord {
                    id: fact_id(collection, &key),
                    sex: key.sex,
                    disease: key.disease,
                    age_range: key.age_range,
                    sample_type: key.sample_material,
                    number_of_donors: count.clone(),
                    number_of_samples: count,
                    last_update: last_update.clone(),
                    collection: collection.clone(),
                });
            }
        }
    }

    /// Applies Directory-side diagnosis corrections: facts whose disease code
    /// maps to a replacement are rewritten, facts whose code maps to `None`
    /// are withheld.
    pub fn apply_diagnosis_corrections(&mut self, corrections: &HashMap<String, Option<String>>) {
        self.facts.retain_mut(|fact| {
            match corrections.get(&fact.disease) {
                Some(Some(replacement)) => {
                    fact.disease = replacement.clone();
                    true
                }
                Some(None) => {
                    warn!(
                        "withholding fact {}: diagnosis {} unknown to the Directory",
                        fact.id, fact.disease
                    );
                    false
                }
                None => true,
            }
        });
    }
}

/// Buckets an age at diagnosis into the Directory's fixed age ranges.
pub fn cut_age_range(age: Option<&str>) -> &'static str {
    let Some(age) = age.map(str::trim).filter(|a| !a.is_empty()) else {
        return "Unknown";
    };
    let Ok(age) = age.parse::<i64>() else {
        return "Unknown";
    };
    if age < 2 {
        "Infant"
    } else if age < 13 {
        "Child"
    } else if age < 18 {
        "Adolescent"
    } else if age < 45 {
        "Adult"
    } else if age < 65 {
        "Middle-aged"
    } else if age < 80 {
        "Aged (65-79 years)"
    } else {
        "Aged (>80 years)"
    }
}

/// Computes corrections for disease codes the Directory does not accept.
/// A subcode like `urn:miriam:icd:E23.1` falls back to its three-character
/// parent when the parent is accepted; everything else is marked for
/// withholding.
pub fn diagnosis_corrections(
    used: &[String],
    accepted: &HashSet<String>,
) -> HashMap<String, Option<String>> {
    let mut corrections = HashMap::new();
    for code in used {
        if accepted.contains(code) {
            continue;
        }
        let parent = code.split_once('.').map(|(prefix, _)| prefix.to_string());
        let correction = parent.filter(|p| accepted.contains(p));
        corrections.insert(code.clone(), correction);
    }
    corrections
}

/// Synthesizes a fact id unique per (collection, group) within a run. The
/// mandatory `bbmri-eric:factID:` prefix is followed by the collection id
/// without its own prefix (colons flattened) and an FNV-1a hash of the group
/// key, which is stable across runs and platforms.
fn fact_id(collection: &BbmriEricId, key: &GroupKey) -> String {
    let collection_part = collection
        .to_string()
        .strip_prefix(COLLECTION_ID_PREFIX)
        .map(str::to_string)
        .unwrap_or_else(|| collection.to_string())
        .replace(':', "_");
    format!(
        "{FACT_ID_PREFIX}{collection_part}_{}",
        fnv1a64(key.canonical().as_bytes())
    )
}

/// 64-bit FNV-1a over the raw bytes.
fn fnv1a64(bytes: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x100_0000_01b3;
    let mut hash = OFFSET_BASIS;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collection() -> BbmriEricId {
        "bbmri-eric:ID:DE_X:collection:0".parse().unwrap()
    }

    fn row(sex: &str, diagnosis: &str, age: &str, material: &str) -> InputRow {
        InputRow::new(Some(material), "p1", Some(sex), Some(age)).with_diagnosis(diagnosis)
    }

    #[test]
    fn age_range_boundaries() {
        let cases = [
            ("0", "Infant"),
            ("1", "Infant"),
            ("12", "Child"),
            ("17", "Adolescent"),
            ("44", "Adult"),
            ("64", "Middle-aged"),
            ("79", "Aged (65-79 years)"),
            ("80", "Aged (>80 years)"),
        ];
        for (age, expected) in cases {
            assert_eq!(cut_age_range(Some(age)), expected, "age {age}");
        }
    }

    #[test]
    fn age_range_unknown_cases() {
        assert_eq!(cut_age_range(None), "Unknown");
        assert_eq!(cut_age_range(Some("")), "Unknown");
        assert_eq!(cut_age_range(Some("  ")), "Unknown");
        assert_eq!(cut_age_range(Some("not-a-number")), "Unknown");
    }

    #[test]
    fn donor_threshold_is_applied_before_output() {
        let today = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();

        let mut nine = StarModelDataset::new(10);
        for _ in 0..9 {
            nine.add_input_row(collection(), row("male", "C75", "30", "Tissue"));
        }
        nine.create_fact_tables(today);
        assert_eq!(nine.fact_count(), 0);

        let mut ten = StarModelDataset::new(10);
        for _ in 0..10 {
            ten.add_input_row(collection(), row("male", "C75", "30", "Tissue"));
        }
        ten.create_fact_tables(today);
        assert_eq!(ten.fact_count(), 1);
        assert_eq!(ten.facts()[0].number_of_donors, "10");
        assert_eq!(ten.facts()[0].number_of_samples, "10");
    }

    #[test]
    fn zero_threshold_disables_filtering() {
        let mut dataset = StarModelDataset::new(0);
        dataset.add_input_row(collection(), row("male", "C75", "30", "Tissue"));
        dataset.create_fact_tables(NaiveDate::from_ymd_opt(2024, 5, 1).unwrap());
        assert_eq!(dataset.fact_count(), 1);
    }

    #[test]
    fn rows_missing_grouping_fields_are_discarded() {
        let mut dataset = StarModelDataset::new(0);
        // No diagnosis at all.
        dataset.add_input_row(
            collection(),
            InputRow::new(Some("Tissue"), "p1", Some("male"), Some("30")),
        );
        // Diagnosis code the converter rejects.
        dataset.add_input_row(collection(), row("male", "C75.11", "30", "Tissue"));
        // Missing sex.
        dataset.add_input_row(
            collection(),
            InputRow::new(Some("Tissue"), "p1", None, Some("30")).with_diagnosis("C75"),
        );
        dataset.create_fact_tables(NaiveDate::from_ymd_opt(2024, 5, 1).unwrap());
        assert_eq!(dataset.fact_count(), 0);
    }

    #[test]
    fn aggregates_two_rows_into_one_fact() {
        let mut dataset = StarModelDataset::new(2);
        dataset.add_input_row(collection(), row("male", "C75", "30", "Tissue"));
        dataset.add_input_row(collection(), row("male", "C75", "31", "Tissue"));
        dataset.create_fact_tables(NaiveDate::from_ymd_opt(2024, 5, 1).unwrap());

        assert_eq!(dataset.fact_count(), 1);
        let fact = &dataset.facts()[0];
        assert_eq!(fact.sex, "MALE");
        assert_eq!(fact.disease, "urn:miriam:icd:C75");
        assert_eq!(fact.age_range, "Adult");
        assert_eq!(fact.sample_type, "TISSUE_FROZEN");
        assert_eq!(fact.number_of_donors, "2");
        assert_eq!(fact.last_update, "2024-05-01");
        assert_eq!(fact.collection, collection());
        assert!(fact.id.starts_with("bbmri-eric:factID:DE_X_collection_0_"));
    }

    #[test]
    fn fact_ids_are_stable_and_distinct_per_group() {
        let today = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let build = || {
            let mut dataset = StarModelDataset::new(0);
            dataset.add_input_row(collection(), row("male", "C75", "30", "Tissue"));
            dataset.add_input_row(collection(), row("female", "C75", "30", "Tissue"));
            dataset.create_fact_tables(today);
            dataset
        };
        let first = build();
        let second = build();
        assert_eq!(first.facts(), second.facts());
        assert_ne!(first.facts()[0].id, first.facts()[1].id);
    }

    #[test]
    fn corrections_remap_to_parent_or_withhold() {
        let accepted: HashSet<String> = ["urn:miriam:icd:E23".to_string()].into_iter().collect();
        let used = vec![
            "urn:miriam:icd:E23".to_string(),
            "urn:miriam:icd:E23.1".to_string(),
            "urn:miriam:icd:Z99.9".to_string(),
        ];
        let corrections = diagnosis_corrections(&used, &accepted);
        assert!(!corrections.contains_key("urn:miriam:icd:E23"));
        assert_eq!(
            corrections["urn:miriam:icd:E23.1"],
            Some("urn:miriam:icd:E23".to_string())
        );
        assert_eq!(corrections["urn:miriam:icd:Z99.9"], None);
    }

    #[test]
    fn apply_corrections_rewrites_and_withholds() {
        let mut dataset = StarModelDataset::new(0);
        dataset.add_input_row(collection(), row("male", "E23.1", "30", "Tissue"));
        dataset.add_input_row(collection(), row("male", "Z99.9", "30", "Tissue"));
        dataset.create_fact_tables(NaiveDate::from_ymd_opt(2024, 5, 1).unwrap());
        assert_eq!(dataset.fact_count(), 2);

        let corrections: HashMap<String, Option<String>> = [
            (
                "urn:miriam:icd:E23.1".to_string(),
                Some("urn:miriam:icd:E23".to_string()),
            ),
            ("urn:miriam:icd:Z99.9".to_string(), None),
        ]
        .into_iter()
        .collect();
        dataset.apply_diagnosis_corrections(&corrections);

        assert_eq!(dataset.fact_count(), 1);
        assert_eq!(dataset.facts()[0].disease, "urn:miriam:icd:E23");
    }
}
