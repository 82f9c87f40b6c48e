use assert_matches::assert_matches;
use serde_json::json;

use isic_cli::domain::Record;
use isic_cli::error::ArchiveError;
use isic_cli::metadata::{self, FlatRow};
use isic_cli::progress::SilentProgress;

fn record(isic_id: &str, attribution: &str, metadata: serde_json::Value) -> Record {
    serde_json::from_value(json!({
        "isic_id": isic_id,
        "attribution": attribution,
        "copyright_license": "CC-BY",
        "files": { "full": { "url": format!("https://cdn.example.org/{isic_id}.jpg"), "size": 5 } },
        "metadata": metadata,
    }))
    .unwrap()
}

fn rows(attributions: &[&str]) -> Vec<FlatRow> {
    attributions
        .iter()
        .map(|attribution| {
            let mut row = FlatRow::new();
            row.insert("attribution".to_string(), json!(attribution));
            row
        })
        .collect()
}

#[test]
fn attribution_ties_break_by_name() {
    assert_eq!(
        metadata::attributions(&rows(&["foo", "bar", "foo", "bar"])),
        vec!["bar", "foo"]
    );
}

#[test]
fn attribution_anonymous_last() {
    assert_eq!(
        metadata::attributions(&rows(&["foo", "foo", "bar", "Anonymous"])),
        vec!["foo", "bar", "Anonymous"]
    );
    assert_eq!(
        metadata::attribution_text(&rows(&["foo", "bar"])),
        "bar\n\nfoo"
    );
}

#[test]
fn extract_builds_sorted_header() {
    let records = vec![
        Ok(record(
            "ISIC_0000001",
            "foo",
            json!({ "acquisition": { "pixels_x": 640 }, "clinical": { "sex": "male" } }),
        )),
        Ok(record(
            "ISIC_0000002",
            "bar",
            json!({ "clinical": { "age_approx": 50, "melanocytic": true } }),
        )),
    ];
    let table = metadata::extract(records, &SilentProgress).unwrap();

    assert_eq!(
        table.columns,
        vec![
            "isic_id",
            "attribution",
            "copyright_license",
            "age_approx",
            "melanocytic",
            "pixels_x",
            "sex"
        ]
    );
    assert_eq!(table.len(), 2);
    assert_eq!(table.licenses(), vec!["CC-BY"]);

    let mut csv = Vec::new();
    table.write_csv(&mut csv).unwrap();
    let csv = String::from_utf8(csv).unwrap();
    let lines: Vec<&str> = csv.lines().collect();
    assert_eq!(lines[1], "ISIC_0000001,foo,CC-BY,,,640,male");
    assert_eq!(lines[2], "ISIC_0000002,bar,CC-BY,50,true,,");
}

#[test]
fn extract_rejects_colliding_fields() {
    let records = vec![Ok(record(
        "ISIC_0000003",
        "foo",
        json!({ "acquisition": { "sex": "male" }, "clinical": { "sex": "female" } }),
    ))];
    let err = metadata::extract(records, &SilentProgress).unwrap_err();
    assert_matches!(
        err,
        ArchiveError::MetadataFieldCollision { ref isic_id, ref field }
            if isic_id == "ISIC_0000003" && field == "sex"
    );
}

#[test]
fn extract_of_nothing_is_empty() {
    let table = metadata::extract(Vec::new(), &SilentProgress).unwrap();
    assert!(table.is_empty());
    assert_eq!(table.columns.len(), 3);
}
