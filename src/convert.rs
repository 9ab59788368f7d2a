//! Conversion of clinical-domain vocabulary to Directory vocabulary.
//!
//! All functions are total: they never fail on well-formed input. Values the
//! Directory cannot represent are either mapped to a placeholder (`OTHER`) or
//! dropped with a warning (diagnosis codes).

use tracing::warn;

const MIRIAM_ICD_PREFIX: &str = "urn:miriam:icd:";

/// One rewrite step for sample material codes. Rules are applied in table
/// order, each to the output of the previous one.
#[derive(Debug, Clone, Copy)]
enum MaterialRule {
    /// Remove every occurrence of the given fragment.
    Strip(&'static str),
    /// Replace the whole value when it matches exactly.
    Exact(&'static str, &'static str),
    /// Replace the whole value when it ends with the given suffix.
    SuffixTo(&'static str, &'static str),
}

/// Material names that differ between the clinical store and the Directory,
/// plus clinical materials the Directory has no code for (mapped to `OTHER`).
static MATERIAL_REWRITES: &[MaterialRule] = &[
    MaterialRule::Strip("_VITAL"),
    MaterialRule::Exact("TISSUE_FORMALIN", "TISSUE_PARAFFIN_EMBEDDED"),
    MaterialRule::Exact("TISSUE", "TISSUE_FROZEN"),
    MaterialRule::Exact("CF_DNA", "CDNA"),
    MaterialRule::Exact("BLOOD_SERUM", "SERUM"),
    MaterialRule::Exact("STOOL_FAECES", "FECES"),
    MaterialRule::Exact("BLOOD_PLASMA", "SERUM"),
    MaterialRule::SuffixTo("_OTHER", "OTHER"),
    MaterialRule::Exact("DERIVATIVE", "OTHER"),
    MaterialRule::Exact("CSF_LIQUOR", "OTHER"),
    MaterialRule::Exact("LIQUID", "OTHER"),
    MaterialRule::Exact("ASCITES", "OTHER"),
    MaterialRule::Exact("TISSUE_PAXGENE_OR_ELSE", "OTHER"),
];

/// Sex codes largely overlap between the clinical store and the Directory,
/// but the Directory wants upper case.
pub fn convert_sex(sex: &str) -> String {
    sex.to_uppercase()
}

/// Maps a clinical sample material code to the Directory's material
/// vocabulary.
pub fn convert_material(material: &str) -> String {
    let mut value = material.to_uppercase().replace('-', "_");
    for rule in MATERIAL_REWRITES {
        value = match *rule {
            MaterialRule::Strip(fragment) => value.replace(fragment, ""),
            MaterialRule::Exact(from, to) if value == from => to.to_string(),
            MaterialRule::SuffixTo(suffix, to) if value.ends_with(suffix) => to.to_string(),
            _ => value,
        };
    }
    value
}

/// Converts a list of material codes, removing duplicates. Several clinical
/// codes collapse onto the same Directory code, so deduplication must happen
/// after mapping.
pub fn convert_material_list<I, S>(materials: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    dedup(materials.into_iter().map(|m| convert_material(m.as_ref())))
}

/// The Directory understands most clinical storage temperature codes, but it
/// does not know about gaseous nitrogen.
pub fn convert_storage_temperature(storage_temperature: &str) -> String {
    storage_temperature.replace("temperatureGN", "temperatureOther")
}

pub fn convert_storage_temperature_list<I, S>(temperatures: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    dedup(
        temperatures
            .into_iter()
            .map(|t| convert_storage_temperature(t.as_ref())),
    )
}

/// Maps an ICD-10 diagnosis code to the Directory's MIRIAM URN form. Codes
/// that are neither already prefixed nor 3 or 5 characters long (`C75`,
/// `E23.1`) are rejected.
pub fn convert_diagnosis(diagnosis: &str) -> Option<String> {
    if diagnosis.starts_with(MIRIAM_ICD_PREFIX) {
        Some(diagnosis.to_string())
    } else if diagnosis.len() == 3 || diagnosis.len() == 5 {
        Some(format!("{MIRIAM_ICD_PREFIX}{diagnosis}"))
    } else {
        warn!("invalid diagnosis code {diagnosis}, dropping");
        None
    }
}

fn dedup(values: impl Iterator<Item = String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    values.filter(|v| seen.insert(v.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sex_is_upper_cased() {
        assert_eq!(convert_sex("male"), "MALE");
        assert_eq!(convert_sex("FEMALE"), "FEMALE");
    }

    #[test]
    fn material_basic_normalization() {
        assert_eq!(convert_material("whole-blood"), "WHOLE_BLOOD");
    }

    #[test]
    fn material_vital_suffix_is_stripped_before_renames() {
        // Tissue-Vital loses _VITAL, then bare TISSUE becomes TISSUE_FROZEN.
        assert_eq!(convert_material("Tissue-Vital"), "TISSUE_FROZEN");
    }

    #[test]
    fn material_renames() {
        assert_eq!(convert_material("TISSUE_FORMALIN"), "TISSUE_PARAFFIN_EMBEDDED");
        assert_eq!(convert_material("CF_DNA"), "CDNA");
        assert_eq!(convert_material("Blood-Serum"), "SERUM");
        assert_eq!(convert_material("STOOL_FAECES"), "FECES");
        assert_eq!(convert_material("BLOOD_PLASMA"), "SERUM");
    }

    #[test]
    fn material_unknowns_map_to_other() {
        assert_eq!(convert_material("URINE_OTHER"), "OTHER");
        assert_eq!(convert_material("DERIVATIVE"), "OTHER");
        assert_eq!(convert_material("CSF_LIQUOR"), "OTHER");
        assert_eq!(convert_material("Ascites"), "OTHER");
        assert_eq!(convert_material("TISSUE_PAXGENE_OR_ELSE"), "OTHER");
    }

    #[test]
    fn material_list_deduplicates_after_mapping() {
        let converted = convert_material_list(["Tissue-Vital", "TISSUE", "Blood-Serum"]);
        assert_eq!(converted, vec!["TISSUE_FROZEN", "SERUM"]);
    }

    #[test]
    fn storage_temperature_gaseous_nitrogen() {
        assert_eq!(convert_storage_temperature("temperatureGN"), "temperatureOther");
        assert_eq!(convert_storage_temperature("temperature2to10"), "temperature2to10");
    }

    #[test]
    fn storage_temperature_list_deduplicates() {
        let converted =
            convert_storage_temperature_list(["temperatureGN", "temperatureOther", "temperature2to10"]);
        assert_eq!(converted, vec!["temperatureOther", "temperature2to10"]);
    }

    #[test]
    fn diagnosis_passthrough_and_prefix() {
        assert_eq!(
            convert_diagnosis("urn:miriam:icd:C75").as_deref(),
            Some("urn:miriam:icd:C75")
        );
        assert_eq!(convert_diagnosis("C75").as_deref(), Some("urn:miriam:icd:C75"));
        assert_eq!(convert_diagnosis("E23.1").as_deref(), Some("urn:miriam:icd:E23.1"));
    }

    #[test]
    fn diagnosis_rejects_odd_lengths() {
        assert_eq!(convert_diagnosis("C7"), None);
        assert_eq!(convert_diagnosis("C75.11"), None);
        assert_eq!(convert_diagnosis(""), None);
    }
}
