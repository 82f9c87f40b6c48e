use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ArchiveError;

static ISIC_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^ISIC_\d{7}$").expect("static regex"));
static COLLECTION_IDS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)(,\d+)*$").expect("static regex"));

const DEFAULT_IMAGE_EXTENSION: &str = "jpg";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IsicId(String);

impl IsicId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IsicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for IsicId {
    type Err = ArchiveError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if !ISIC_ID_RE.is_match(trimmed) {
            return Err(ArchiveError::InvalidIsicId(value.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

/// Parses a newline delimited list of ISIC IDs, skipping blank lines and
/// dropping repeats while keeping first-seen order. Fails on the first
/// malformed line.
pub fn parse_isic_id_list(input: &str) -> Result<Vec<IsicId>, ArchiveError> {
    let mut seen = std::collections::HashSet::new();
    let mut ids = Vec::new();
    for line in input.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let id: IsicId = line.parse()?;
        if seen.insert(id.clone()) {
            ids.push(id);
        }
    }
    Ok(ids)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionFilter(Vec<u64>);

impl CollectionFilter {
    pub fn ids(&self) -> &[u64] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_param(&self) -> String {
        self.0
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl FromStr for CollectionFilter {
    type Err = ArchiveError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.is_empty() {
            return Ok(Self::default());
        }
        if !COLLECTION_IDS_RE.is_match(value) {
            return Err(ArchiveError::InvalidCollectionIds(value.to_string()));
        }
        let ids = value
            .split(',')
            .map(|part| {
                part.parse::<u64>()
                    .map_err(|_| ArchiveError::InvalidCollectionIds(value.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self(ids))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchQuery {
    pub query: String,
    pub collections: CollectionFilter,
}

impl SearchQuery {
    pub fn new(query: impl Into<String>, collections: CollectionFilter) -> Self {
        Self {
            query: query.into(),
            collections,
        }
    }

    pub fn is_unfiltered(&self) -> bool {
        self.query.trim().is_empty() && self.collections.is_empty()
    }

    pub fn params(&self) -> Vec<(&'static str, String)> {
        vec![
            ("query", self.query.clone()),
            ("collections", self.collections.to_param()),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub url: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageFiles {
    pub full: FileDescriptor,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageMetadata {
    #[serde(default)]
    pub acquisition: BTreeMap<String, Value>,
    #[serde(default)]
    pub clinical: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub isic_id: String,
    #[serde(default)]
    pub attribution: String,
    #[serde(default)]
    pub copyright_license: String,
    pub files: ImageFiles,
    #[serde(default)]
    pub metadata: ImageMetadata,
}

impl Record {
    /// Extension of the full-size file, taken from the URL path. Synthetic
    /// development images have none, so those fall back to jpg.
    pub fn extension(&self) -> String {
        let path = Url::parse(&self.files.full.url)
            .map(|url| url.path().to_string())
            .unwrap_or_else(|_| self.files.full.url.clone());
        let file_name = path.rsplit('/').next().unwrap_or_default();
        match file_name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => ext.to_string(),
            _ => DEFAULT_IMAGE_EXTENSION.to_string(),
        }
    }

    pub fn declared_size(&self) -> u64 {
        self.files.full.size
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Page<T> {
    #[serde(default)]
    pub count: Option<u64>,
    #[serde(default)]
    pub next: Option<String>,
    pub results: Vec<T>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collection {
    pub id: u64,
    pub name: String,
    pub public: bool,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub doi: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cohort {
    pub id: u64,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: u64,
    pub email: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkOperation {
    AddImages,
    RemoveImages,
}

impl BulkOperation {
    pub fn endpoint(self) -> &'static str {
        match self {
            BulkOperation::AddImages => "populate-from-list",
            BulkOperation::RemoveImages => "remove-from-list",
        }
    }

    pub fn verb(self) -> &'static str {
        match self {
            BulkOperation::AddImages => "added",
            BulkOperation::RemoveImages => "removed",
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn record_with_url(url: &str) -> Record {
        Record {
            isic_id: "ISIC_0000000".to_string(),
            attribution: String::new(),
            copyright_license: "CC-0".to_string(),
            files: ImageFiles {
                full: FileDescriptor {
                    url: url.to_string(),
                    size: 5,
                },
            },
            metadata: ImageMetadata::default(),
        }
    }

    #[test]
    fn extension_comes_from_url_path() {
        let record = record_with_url(
            "https://bucket.s3.amazonaws.com/images/ISIC_0000000.JPG?X-Amz-Signature=abc.def",
        );
        assert_eq!(record.extension(), "JPG");
    }

    #[test]
    fn extension_defaults_to_jpg() {
        let record = record_with_url("http://127.0.0.1:8000/media/images/abcdef");
        assert_eq!(record.extension(), "jpg");
    }

    #[test]
    fn collection_filter_rejects_garbage() {
        let err = "1,,2".parse::<CollectionFilter>().unwrap_err();
        assert_matches!(err, ArchiveError::InvalidCollectionIds(_));
    }
}
