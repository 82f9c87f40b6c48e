use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::Write;

use serde_json::Value;

use crate::domain::Record;
use crate::error::ArchiveError;
use crate::progress::ProgressSink;

pub const BASE_FIELDS: [&str; 3] = ["isic_id", "attribution", "copyright_license"];
pub const ANONYMOUS_ATTRIBUTION: &str = "Anonymous";

/// One flattened record: base fields plus every acquisition and clinical field.
pub type FlatRow = BTreeMap<String, Value>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataTable {
    pub columns: Vec<String>,
    pub rows: Vec<FlatRow>,
}

impl MetadataTable {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Distinct licenses in first-seen order.
    pub fn licenses(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        self.rows
            .iter()
            .filter_map(|row| row.get("copyright_license").map(cell_text))
            .filter(|license| seen.insert(license.clone()))
            .collect()
    }

    pub fn write_csv<W: Write>(&self, writer: W) -> Result<(), ArchiveError> {
        let mut csv = csv::Writer::from_writer(writer);
        csv.write_record(&self.columns)
            .map_err(|err| ArchiveError::Csv(err.to_string()))?;
        for row in &self.rows {
            csv.write_record(
                self.columns
                    .iter()
                    .map(|column| row.get(column).map(cell_text).unwrap_or_default()),
            )
            .map_err(|err| ArchiveError::Csv(err.to_string()))?;
        }
        csv.flush()
            .map_err(|err| ArchiveError::Csv(err.to_string()))
    }
}

/// Flattens every record. The header is only known once the whole stream is
/// consumed, so rows are buffered.
pub fn extract<I>(records: I, progress: &dyn ProgressSink) -> Result<MetadataTable, ArchiveError>
where
    I: IntoIterator<Item = Result<Record, ArchiveError>>,
{
    let mut fields = BTreeSet::new();
    let mut rows = Vec::new();
    for record in records {
        let record = record?;
        let row = flatten(record)?;
        fields.extend(
            row.keys()
                .filter(|key| !BASE_FIELDS.contains(&key.as_str()))
                .cloned(),
        );
        rows.push(row);
        progress.advance(1);
    }

    let columns = BASE_FIELDS
        .iter()
        .map(|field| field.to_string())
        .chain(fields)
        .collect();
    Ok(MetadataTable { columns, rows })
}

fn flatten(record: Record) -> Result<FlatRow, ArchiveError> {
    let mut row = FlatRow::new();
    row.insert("isic_id".to_string(), Value::String(record.isic_id.clone()));
    row.insert("attribution".to_string(), Value::String(record.attribution));
    row.insert(
        "copyright_license".to_string(),
        Value::String(record.copyright_license),
    );

    let metadata = record.metadata;
    for (field, value) in metadata.acquisition.into_iter().chain(metadata.clinical) {
        if BASE_FIELDS.contains(&field.as_str()) || row.contains_key(&field) {
            return Err(ArchiveError::MetadataFieldCollision {
                isic_id: record.isic_id,
                field,
            });
        }
        row.insert(field, value);
    }
    Ok(row)
}

/// Attribution strings ordered by number of images (descending), then name,
/// with "Anonymous" moved to the end.
pub fn attributions(rows: &[FlatRow]) -> Vec<String> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for row in rows {
        let attribution = row.get("attribution").map(cell_text).unwrap_or_default();
        *counts.entry(attribution).or_default() += 1;
    }
    let mut ordered: Vec<(String, usize)> = counts.into_iter().collect();
    ordered.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ordered.sort_by_key(|(name, _)| name == ANONYMOUS_ATTRIBUTION);
    ordered.into_iter().map(|(name, _)| name).collect()
}

pub fn attribution_text(rows: &[FlatRow]) -> String {
    attributions(rows).join("\n\n")
}

/// CSV cell for a metadata value: strings verbatim, null as empty.
pub fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => number.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn row(attribution: &str) -> FlatRow {
        let mut row = FlatRow::new();
        row.insert("attribution".to_string(), json!(attribution));
        row
    }

    #[test]
    fn attributions_order_by_count_then_name() {
        let rows: Vec<FlatRow> = ["Anonymous", "Foo", "Foo", "Bar", "Bar", "Baz"]
            .into_iter()
            .map(row)
            .collect();
        assert_eq!(attributions(&rows), vec!["Bar", "Foo", "Baz", "Anonymous"]);
    }

    #[test]
    fn anonymous_goes_last_even_when_most_common() {
        let rows: Vec<FlatRow> = ["Anonymous", "Anonymous", "Anonymous", "Foo"]
            .into_iter()
            .map(row)
            .collect();
        assert_eq!(attributions(&rows), vec!["Foo", "Anonymous"]);
    }

    #[test]
    fn cells_render_scalars() {
        assert_eq!(cell_text(&json!(null)), "");
        assert_eq!(cell_text(&json!(true)), "true");
        assert_eq!(cell_text(&json!(42)), "42");
        assert_eq!(cell_text(&json!(2.5)), "2.5");
        assert_eq!(cell_text(&json!("nevus")), "nevus");
    }
}
