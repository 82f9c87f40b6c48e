use std::collections::{BTreeMap, BTreeSet, HashMap};

const SEXES: &[&str] = &["male", "female"];
const BENIGN_MALIGNANT: &[&str] = &[
    "benign",
    "malignant",
    "indeterminate",
    "indeterminate/benign",
    "indeterminate/malignant",
];
const ANATOM_SITES: &[&str] = &[
    "head/neck",
    "upper extremity",
    "lower extremity",
    "anterior torso",
    "posterior torso",
    "lateral torso",
    "palms/soles",
    "oral/genital",
];
const IMAGE_TYPES: &[&str] = &[
    "dermoscopic",
    "clinical: close-up",
    "clinical: overview",
    "TBP tile: close-up",
    "TBP tile: overview",
    "RCM: macroscopic",
    "RCM: tile",
    "RCM: mosaic",
];
const DERMOSCOPIC_TYPES: &[&str] = &[
    "contact polarized",
    "contact non-polarized",
    "non-contact polarized",
];
const CONFIRM_TYPES: &[&str] = &[
    "histopathology",
    "serial imaging showing no change",
    "single image expert consensus",
    "confocal microscopy with consensus dermoscopy",
];
const FITZPATRICK_TYPES: &[&str] = &["I", "II", "III", "IV", "V", "VI"];
const MEL_CLASSES: &[&str] = &[
    "melanoma in situ",
    "invasive melanoma",
    "recurrent/persistent melanoma, in situ",
    "recurrent/persistent melanoma, invasive",
    "melanoma NOS",
];
const MEL_TYPES: &[&str] = &[
    "superficial spreading melanoma",
    "nodular melanoma",
    "lentigo maligna melanoma",
    "acral lentiginous melanoma",
    "melanoma NOS",
];
const NEVUS_TYPES: &[&str] = &[
    "blue",
    "combined",
    "nevus NOS",
    "deep penetrating",
    "halo",
    "persistent/recurrent",
    "pigmented spindle cell of reed",
    "plexiform spindle cell",
    "special site",
    "spitz",
];
const DIAGNOSES: &[&str] = &[
    "actinic keratosis",
    "adnexal tumor",
    "AIMP",
    "angiofibroma or fibrous papule",
    "angiokeratoma",
    "angioma",
    "atypical melanocytic proliferation",
    "atypical spitz tumor",
    "basal cell carcinoma",
    "cafe-au-lait macule",
    "clear cell acanthoma",
    "dermatofibroma",
    "lentigo NOS",
    "lentigo simplex",
    "lichenoid keratosis",
    "melanoma",
    "melanoma metastasis",
    "merkel cell carcinoma",
    "mucosal melanotic macule",
    "neurofibroma",
    "nevus",
    "nevus spilus",
    "other",
    "pigmented benign keratosis",
    "pyogenic granuloma",
    "scar",
    "sebaceous adenoma",
    "sebaceous hyperplasia",
    "seborrheic keratosis",
    "solar lentigo",
    "squamous cell carcinoma",
    "verruca",
];

const MELANOMA_ONLY: &[&str] = &[
    "mel_class",
    "mel_mitotic_index",
    "mel_thick_mm",
    "mel_type",
    "mel_ulcer",
];

#[derive(Debug, Clone, Copy)]
enum Rule {
    Choice(&'static [&'static str]),
    Diagnosis,
    Boolean,
    Number { min: f64, max: Option<f64> },
    Integer { min: i64, max: Option<i64> },
    Text,
}

struct Field {
    name: &'static str,
    rule: Rule,
}

const FIELDS: &[Field] = &[
    Field { name: "age", rule: Rule::Integer { min: 0, max: Some(120) } },
    Field { name: "sex", rule: Rule::Choice(SEXES) },
    Field { name: "benign_malignant", rule: Rule::Choice(BENIGN_MALIGNANT) },
    Field { name: "diagnosis", rule: Rule::Diagnosis },
    Field { name: "diagnosis_confirm_type", rule: Rule::Choice(CONFIRM_TYPES) },
    Field { name: "personal_hx_mm", rule: Rule::Boolean },
    Field { name: "family_hx_mm", rule: Rule::Boolean },
    Field { name: "clin_size_long_diam_mm", rule: Rule::Number { min: 0.0, max: None } },
    Field { name: "melanocytic", rule: Rule::Boolean },
    Field { name: "anatom_site_general", rule: Rule::Choice(ANATOM_SITES) },
    Field { name: "image_type", rule: Rule::Choice(IMAGE_TYPES) },
    Field { name: "dermoscopic_type", rule: Rule::Choice(DERMOSCOPIC_TYPES) },
    Field { name: "fitzpatrick_skin_type", rule: Rule::Choice(FITZPATRICK_TYPES) },
    Field { name: "nevus_type", rule: Rule::Choice(NEVUS_TYPES) },
    Field { name: "mel_class", rule: Rule::Choice(MEL_CLASSES) },
    Field { name: "mel_type", rule: Rule::Choice(MEL_TYPES) },
    Field { name: "mel_thick_mm", rule: Rule::Number { min: 0.0, max: Some(20.0) } },
    Field { name: "mel_mitotic_index", rule: Rule::Integer { min: 0, max: None } },
    Field { name: "mel_ulcer", rule: Rule::Boolean },
    Field { name: "concomitant_biopsy", rule: Rule::Boolean },
    Field { name: "acquisition_day", rule: Rule::Integer { min: 0, max: None } },
    Field { name: "marker_pen", rule: Rule::Boolean },
    Field { name: "hairy", rule: Rule::Boolean },
    Field { name: "blurry", rule: Rule::Boolean },
    Field { name: "patient_id", rule: Rule::Text },
    Field { name: "lesion_id", rule: Rule::Text },
    Field { name: "rcm_case_id", rule: Rule::Text },
];

/// Columns the archive ingests as structured metadata. Anything else is
/// kept as unstructured text.
const EXTRA_KNOWN_COLUMNS: &[&str] = &["isic_id", "filename", "attribution", "copyright_license"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldProblem {
    pub column: String,
    pub message: String,
}

impl FieldProblem {
    fn new(column: &str, message: impl Into<String>) -> Self {
        Self {
            column: column.to_string(),
            message: message.into(),
        }
    }
}

/// One row's identity columns, kept for the cross-row pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowIdentity {
    pub patient_id: Option<String>,
    pub lesion_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFault {
    pub message: String,
    pub examples: Vec<String>,
}

pub fn is_known_column(column: &str) -> bool {
    FIELDS.iter().any(|field| field.name == column) || EXTRA_KNOWN_COLUMNS.contains(&column)
}

pub fn unstructured_columns<'a, I>(headers: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    headers
        .into_iter()
        .filter(|header| !is_known_column(header))
        .map(str::to_string)
        .collect()
}

/// Checks one row. Blank cells count as absent.
pub fn validate_row(row: &HashMap<&str, &str>) -> Vec<FieldProblem> {
    let mut problems = Vec::new();
    for field in FIELDS {
        let Some(value) = row.get(field.name).map(|value| value.trim()) else {
            continue;
        };
        if value.is_empty() {
            continue;
        }
        if let Some(message) = check(field.name, field.rule, value) {
            problems.push(FieldProblem::new(field.name, message));
        }
    }
    problems.extend(cross_field_problems(row));
    problems
}

fn check(name: &str, rule: Rule, value: &str) -> Option<String> {
    match rule {
        Rule::Choice(allowed) => {
            (!allowed.contains(&value))
                .then(|| format!("Input should be {}", expected_list(allowed)))
        }
        Rule::Diagnosis => (!DIAGNOSES.contains(&value))
            .then(|| format!("Unsupported value for {name}: '{value}'.")),
        Rule::Boolean => parse_bool(value)
            .is_none()
            .then(|| "Input should be a valid boolean, unable to interpret input".to_string()),
        Rule::Number { min, max } => match value.parse::<f64>() {
            Ok(number) if number.is_finite() => bounds_message(number, min, max),
            _ => Some(
                "Input should be a valid number, unable to parse string as a number".to_string(),
            ),
        },
        Rule::Integer { min, max } => match value.parse::<i64>() {
            Ok(number) => bounds_message(number, min, max),
            Err(_) => Some(
                "Input should be a valid integer, unable to parse string as an integer".to_string(),
            ),
        },
        Rule::Text => None,
    }
}

fn bounds_message<T: PartialOrd + std::fmt::Display>(
    value: T,
    min: T,
    max: Option<T>,
) -> Option<String> {
    if value < min {
        return Some(format!("Input should be greater than or equal to {min}"));
    }
    match max {
        Some(max) if value > max => Some(format!("Input should be less than or equal to {max}")),
        _ => None,
    }
}

fn cross_field_problems(row: &HashMap<&str, &str>) -> Vec<FieldProblem> {
    let present = |name: &str| {
        row.get(name)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    };
    let mut problems = Vec::new();

    if let Some(diagnosis) = present("diagnosis") {
        if diagnosis != "melanoma" {
            for &field in MELANOMA_ONLY {
                if present(field).is_some() {
                    problems.push(FieldProblem::new(
                        field,
                        format!("{field} is only allowed for melanoma diagnoses."),
                    ));
                }
            }
        }
        if diagnosis != "nevus" && present("nevus_type").is_some() {
            problems.push(FieldProblem::new(
                "nevus_type",
                "nevus_type is only allowed for nevus diagnoses.",
            ));
        }
    }

    if let Some(image_type) = present("image_type") {
        if image_type != "dermoscopic" && present("dermoscopic_type").is_some() {
            problems.push(FieldProblem::new(
                "dermoscopic_type",
                "dermoscopic_type is only allowed for dermoscopic images.",
            ));
        }
    }

    problems
}

/// Cross-row checks over every row that named a patient or a lesion.
pub fn validate_batch(rows: &[RowIdentity]) -> Vec<BatchFault> {
    let mut patients_by_lesion: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    let mut lesion_order: Vec<&str> = Vec::new();
    for row in rows {
        let (Some(lesion), Some(patient)) = (row.lesion_id.as_deref(), row.patient_id.as_deref())
        else {
            continue;
        };
        let patients = patients_by_lesion.entry(lesion).or_default();
        if patients.is_empty() {
            lesion_order.push(lesion);
        }
        patients.insert(patient);
    }

    let examples: Vec<String> = lesion_order
        .into_iter()
        .filter(|lesion| patients_by_lesion[lesion].len() > 1)
        .map(str::to_string)
        .collect();

    if examples.is_empty() {
        return Vec::new();
    }
    vec![BatchFault {
        message: "One or more lesions belong to multiple patients".to_string(),
        examples,
    }]
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "t" | "yes" | "y" | "on" | "1" => Some(true),
        "false" | "f" | "no" | "n" | "off" | "0" => Some(false),
        _ => None,
    }
}

fn expected_list(allowed: &[&str]) -> String {
    let quoted: Vec<String> = allowed.iter().map(|value| format!("'{value}'")).collect();
    match quoted.split_last() {
        None => String::new(),
        Some((last, [])) => last.clone(),
        Some((last, rest)) => format!("{} or {last}", rest.join(", ")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row<'a>(pairs: &[(&'a str, &'a str)]) -> HashMap<&'a str, &'a str> {
        pairs.iter().copied().collect()
    }

    #[test]
    fn enum_messages_list_choices() {
        let problems = validate_row(&row(&[("sex", "bar")]));
        assert_eq!(
            problems,
            vec![FieldProblem::new("sex", "Input should be 'male' or 'female'")]
        );
    }

    #[test]
    fn diagnosis_names_the_value() {
        let problems = validate_row(&row(&[("diagnosis", "foo")]));
        assert_eq!(problems[0].message, "Unsupported value for diagnosis: 'foo'.");
    }

    #[test]
    fn blank_and_unknown_cells_pass() {
        assert!(validate_row(&row(&[("sex", ""), ("my_notes", "anything")])).is_empty());
    }

    #[test]
    fn ranges_are_enforced() {
        let problems = validate_row(&row(&[("age", "-3"), ("clin_size_long_diam_mm", "abc")]));
        assert_eq!(problems.len(), 2);
        assert_eq!(problems[0].message, "Input should be greater than or equal to 0");
    }

    #[test]
    fn melanoma_fields_need_melanoma() {
        let problems = validate_row(&row(&[("diagnosis", "nevus"), ("mel_thick_mm", "1.5")]));
        assert_eq!(problems.len(), 1);
        assert_eq!(problems[0].column, "mel_thick_mm");
    }

    #[test]
    fn lesion_spanning_patients_is_a_batch_fault() {
        let rows = vec![
            RowIdentity {
                patient_id: Some("p1".into()),
                lesion_id: Some("l1".into()),
            },
            RowIdentity {
                patient_id: Some("p1".into()),
                lesion_id: Some("l2".into()),
            },
            RowIdentity {
                patient_id: Some("p2".into()),
                lesion_id: Some("l1".into()),
            },
        ];
        let faults = validate_batch(&rows);
        assert_eq!(faults.len(), 1);
        assert!(faults[0].message.contains("belong to multiple patients"));
        assert_eq!(faults[0].examples, vec!["l1"]);
    }

    #[test]
    fn unstructured_columns_are_reported_in_header_order() {
        let headers = ["isic_id", "zeta", "diagnosis", "alpha"];
        assert_eq!(unstructured_columns(headers), vec!["zeta", "alpha"]);
    }
}
