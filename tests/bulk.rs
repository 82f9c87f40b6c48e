use isic_cli::bulk::{BulkSummary, NO_PERMS_OR_MISSING, SUCCEEDED, bucket_label};
use isic_cli::domain::BulkOperation;

fn summary(pairs: &[(&str, &[&str])]) -> BulkSummary {
    BulkSummary::from_buckets(pairs.iter().map(|(bucket, ids)| {
        (
            *bucket,
            ids.iter().map(|id| id.to_string()).collect::<Vec<_>>(),
        )
    }))
}

#[test]
fn merge_keeps_every_bucket() {
    let merged = summary(&[(SUCCEEDED, &["ISIC_0000001"])]).merge(summary(&[
        (SUCCEEDED, &["ISIC_0000002"]),
        ("failed", &["ISIC_0000003"]),
    ]));
    assert_eq!(merged.bucket(SUCCEEDED), ["ISIC_0000001", "ISIC_0000002"]);
    assert_eq!(merged.bucket("failed"), ["ISIC_0000003"]);
    assert!(merged.bucket(NO_PERMS_OR_MISSING).is_empty());
    assert_eq!(merged.total(), 3);
}

#[test]
fn merge_with_empty_is_identity() {
    let summary = summary(&[(SUCCEEDED, &["ISIC_0000001"])]);
    assert_eq!(summary.clone().merge(BulkSummary::default()), summary);
    assert_eq!(BulkSummary::default().merge(summary.clone()), summary);
}

#[test]
fn summary_serializes_as_plain_map() {
    let summary = summary(&[("failed", &["ISIC_0000003"])]);
    let json = serde_json::to_value(&summary).unwrap();
    assert_eq!(json, serde_json::json!({ "failed": ["ISIC_0000003"] }));
    let back: BulkSummary = serde_json::from_value(json).unwrap();
    assert_eq!(back, summary);
}

#[test]
fn unknown_buckets_are_humanized() {
    assert_eq!(
        bucket_label("no_perms_or_does_not_exist", BulkOperation::AddImages),
        "No permission or image does not exist"
    );
    assert_eq!(bucket_label("some_new_state", BulkOperation::RemoveImages), "some new state");
}
