use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use reqwest::blocking::Client;
use serde::Deserialize;

use crate::api::user_agent;
use crate::error::ArchiveError;

const RELEASE_INDEX_URL: &str = "https://crates.io/api/v1/crates/isic-cli";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl Version {
    pub fn current() -> Option<Self> {
        env!("CARGO_PKG_VERSION").parse().ok()
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for Version {
    type Err = String;

    /// Accepts plain releases only; pre-release and build suffixes are rejected.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim().trim_start_matches('v');
        let mut parts = trimmed.split('.');
        let mut next = || -> Result<u64, String> {
            parts
                .next()
                .ok_or_else(|| format!("incomplete version: {value}"))?
                .parse::<u64>()
                .map_err(|_| format!("not a release version: {value}"))
        };
        let version = Self {
            major: next()?,
            minor: next()?,
            patch: next()?,
        };
        if parts.next().is_some() {
            return Err(format!("not a release version: {value}"));
        }
        Ok(version)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeType {
    Major,
    Minor,
    Patch,
}

pub fn upgrade_type(from: Version, to: Version) -> Option<UpgradeType> {
    if to <= from {
        return None;
    }
    if to.major != from.major {
        Some(UpgradeType::Major)
    } else if to.minor != from.minor {
        Some(UpgradeType::Minor)
    } else {
        Some(UpgradeType::Patch)
    }
}

pub trait ReleaseIndex {
    fn newest_release(&self) -> Result<Option<Version>, ArchiveError>;
}

#[derive(Deserialize)]
struct CrateResponse {
    #[serde(rename = "crate")]
    krate: CrateInfo,
}

#[derive(Deserialize)]
struct CrateInfo {
    max_stable_version: Option<String>,
}

pub struct CratesIoIndex {
    client: Client,
}

impl CratesIoIndex {
    pub fn new() -> Result<Self, ArchiveError> {
        let client = Client::builder()
            .user_agent(user_agent())
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|err| ArchiveError::Http(err.to_string()))?;
        Ok(Self { client })
    }
}

impl ReleaseIndex for CratesIoIndex {
    fn newest_release(&self) -> Result<Option<Version>, ArchiveError> {
        let response = self
            .client
            .get(RELEASE_INDEX_URL)
            .send()
            .map_err(|err| ArchiveError::Http(err.to_string()))?;
        if !response.status().is_success() {
            return Err(ArchiveError::ApiStatus {
                status: response.status().as_u16(),
                message: "release index lookup failed".to_string(),
            });
        }
        let body: CrateResponse = response
            .json()
            .map_err(|err| ArchiveError::Http(err.to_string()))?;
        Ok(body
            .krate
            .max_stable_version
            .and_then(|version| version.parse().ok()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionStatus {
    Current,
    UpgradeSuggested { newest: Version },
}

/// A newer major release blocks; anything smaller is only suggested. A
/// failed lookup never blocks.
pub fn check_for_newer_version(
    current: Version,
    index: &dyn ReleaseIndex,
) -> Result<VersionStatus, ArchiveError> {
    let newest = match index.newest_release() {
        Ok(Some(newest)) => newest,
        Ok(None) => return Ok(VersionStatus::Current),
        Err(err) => {
            tracing::warn!(error = %err, "failed to check for a newer version of isic-cli");
            return Ok(VersionStatus::Current);
        }
    };
    match upgrade_type(current, newest) {
        Some(UpgradeType::Major) => Err(ArchiveError::UpgradeRequired {
            current: current.to_string(),
            newest: newest.to_string(),
        }),
        Some(_) => Ok(VersionStatus::UpgradeSuggested { newest }),
        None => Ok(VersionStatus::Current),
    }
}
