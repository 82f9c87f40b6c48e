use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::api::ArchiveApi;
use crate::domain::{BulkOperation, IsicId};
use crate::error::ArchiveError;
use crate::progress::ProgressSink;

pub const BULK_BATCH_SIZE: usize = 50;

pub const SUCCEEDED: &str = "succeeded";
pub const NO_PERMS_OR_MISSING: &str = "no_perms_or_does_not_exist";
pub const PRIVATE_IMAGE_PUBLIC_COLLECTION: &str = "private_image_public_collection";

/// Outcome bucket -> identifiers, as reported by the archive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BulkSummary(BTreeMap<String, Vec<String>>);

impl BulkSummary {
    pub fn from_buckets<I, K, V>(buckets: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: IntoIterator<Item = String>,
    {
        Self(
            buckets
                .into_iter()
                .map(|(key, ids)| (key.into(), ids.into_iter().collect()))
                .collect(),
        )
    }

    /// Concatenates bucket lists; `self`'s entries come first.
    pub fn merge(mut self, other: BulkSummary) -> BulkSummary {
        for (bucket, ids) in other.0 {
            self.0.entry(bucket).or_default().extend(ids);
        }
        self
    }

    pub fn bucket(&self, name: &str) -> &[String] {
        self.0.get(name).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn buckets(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.0
            .iter()
            .map(|(bucket, ids)| (bucket.as_str(), ids.as_slice()))
    }

    pub fn total(&self) -> usize {
        self.0.values().map(Vec::len).sum()
    }
}

/// Human label for one outcome bucket.
pub fn bucket_label(bucket: &str, operation: BulkOperation) -> String {
    match bucket {
        SUCCEEDED => format!("Image {}", operation.verb()),
        NO_PERMS_OR_MISSING => "No permission or image does not exist".to_string(),
        PRIVATE_IMAGE_PUBLIC_COLLECTION => "Private image in public collection".to_string(),
        other => other.replace('_', " "),
    }
}

/// Sends `ids` to the collection in batches of 50 and folds the partial summaries.
/// Callers validate identifiers and the lock state beforehand.
pub fn apply(
    api: &dyn ArchiveApi,
    collection_id: u64,
    operation: BulkOperation,
    ids: &[IsicId],
    progress: &dyn ProgressSink,
) -> Result<BulkSummary, ArchiveError> {
    progress.start(
        &format!("{} images", operation_gerund(operation)),
        ids.len() as u64,
    );
    let mut summary = BulkSummary::default();
    for batch in ids.chunks(BULK_BATCH_SIZE) {
        let partial = api.bulk_collection_operation(collection_id, operation, batch)?;
        tracing::debug!(
            collection_id,
            batch = batch.len(),
            reported = partial.total(),
            "bulk batch applied"
        );
        summary = summary.merge(partial);
        progress.advance(batch.len() as u64);
    }
    progress.finish();
    Ok(summary)
}

fn operation_gerund(operation: BulkOperation) -> &'static str {
    match operation {
        BulkOperation::AddImages => "Adding",
        BulkOperation::RemoveImages => "Removing",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(pairs: &[(&str, &[&str])]) -> BulkSummary {
        BulkSummary::from_buckets(
            pairs
                .iter()
                .map(|(key, ids)| (*key, ids.iter().map(|id| id.to_string()).collect::<Vec<_>>())),
        )
    }

    #[test]
    fn merge_concatenates_per_bucket() {
        let a = summary(&[(SUCCEEDED, &["ISIC_0000001"])]);
        let b = summary(&[
            (SUCCEEDED, &["ISIC_0000002"]),
            (NO_PERMS_OR_MISSING, &["ISIC_0000003"]),
        ]);
        let merged = a.merge(b);
        assert_eq!(merged.bucket(SUCCEEDED), ["ISIC_0000001", "ISIC_0000002"]);
        assert_eq!(merged.bucket(NO_PERMS_OR_MISSING), ["ISIC_0000003"]);
        assert_eq!(merged.total(), 3);
    }

    #[test]
    fn merge_is_associative() {
        let a = summary(&[(SUCCEEDED, &["ISIC_0000001"])]);
        let b = summary(&[(PRIVATE_IMAGE_PUBLIC_COLLECTION, &["ISIC_0000002"])]);
        let c = summary(&[(SUCCEEDED, &["ISIC_0000003"])]);
        let left = a.clone().merge(b.clone()).merge(c.clone());
        let right = a.merge(b.merge(c));
        assert_eq!(left, right);
    }

    #[test]
    fn labels_follow_operation() {
        assert_eq!(bucket_label(SUCCEEDED, BulkOperation::AddImages), "Image added");
        assert_eq!(
            bucket_label(SUCCEEDED, BulkOperation::RemoveImages),
            "Image removed"
        );
    }
}
