use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum ArchiveError {
    #[error("invalid ISIC ID: {0}")]
    #[diagnostic(help("ISIC IDs look like ISIC_0000000 (ISIC_ followed by 7 digits)"))]
    InvalidIsicId(String),

    #[error("improperly formatted value \"{0}\"")]
    #[diagnostic(help("expected a comma separated list of collection ids, e.g. 2,17,42"))]
    InvalidCollectionIds(String),

    #[error("invalid search query string \"{0}\"")]
    #[diagnostic(help("see `isic image download --help` for examples of the search syntax"))]
    InvalidSearchQuery(String),

    #[error("--sandbox is mutually exclusive with --dev")]
    ConflictingEnvironments,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("output path is not writable: {0}")]
    OutputNotWritable(String),

    #[error("input file is not readable: {0}")]
    InputNotReadable(String),

    #[error("{kind} {id} does not exist or you don't have access to it.")]
    NotFoundOrInaccessible { kind: &'static str, id: String },

    #[error("\"{0}\" is locked for modifications.")]
    CollectionLocked(String),

    #[error("This command requires a logged in user, use the `isic user login` command to continue.")]
    LoginRequired,

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("archive request failed: {0}")]
    Http(String),

    #[error("archive returned status {status}: {message}")]
    ApiStatus { status: u16, message: String },

    #[error("download of {isic_id} failed after retrying: {message}")]
    DownloadExhausted { isic_id: String, message: String },

    #[error("download of {isic_id} returned status {status}")]
    DownloadStatus { isic_id: String, status: u16 },

    #[error("upload failed: {0}")]
    Upload(String),

    #[error("{0}")]
    AccessionRejected(String),

    #[error("metadata field {field} of {isic_id} appears in both acquisition and clinical metadata")]
    MetadataFieldCollision { isic_id: String, field: String },

    #[error("No rows found in csv!")]
    EmptyCsv,

    #[error("failed to read csv: {0}")]
    Csv(String),

    #[error("metadata has {row_problems} row level and {batch_problems} batch level problem(s)")]
    ValidationFailed {
        row_problems: usize,
        batch_problems: usize,
    },

    #[error("version {newest} of isic-cli is available, you must upgrade from {current} before continuing")]
    UpgradeRequired { current: String, newest: String },

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl ArchiveError {
    pub fn exit_code(&self) -> u8 {
        match self {
            ArchiveError::InvalidCollectionIds(_)
            | ArchiveError::InvalidSearchQuery(_)
            | ArchiveError::ConflictingEnvironments
            | ArchiveError::ConfigRead(_)
            | ArchiveError::ConfigParse(_)
            | ArchiveError::OutputNotWritable(_)
            | ArchiveError::InputNotReadable(_)
            | ArchiveError::NotFoundOrInaccessible { .. } => 2,
            _ => 1,
        }
    }

    /// Errors the user can act on directly. Everything else gets the crash banner.
    pub fn is_expected(&self) -> bool {
        !matches!(
            self,
            ArchiveError::Http(_)
                | ArchiveError::ApiStatus { .. }
                | ArchiveError::DownloadExhausted { .. }
                | ArchiveError::DownloadStatus { .. }
                | ArchiveError::Upload(_)
                | ArchiveError::MetadataFieldCollision { .. }
                | ArchiveError::Filesystem(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_errors_exit_with_two() {
        let err = ArchiveError::NotFoundOrInaccessible {
            kind: "Collection",
            id: "7".to_string(),
        };
        assert_eq!(err.exit_code(), 2);
        assert_eq!(
            err.to_string(),
            "Collection 7 does not exist or you don't have access to it."
        );
        assert_eq!(ArchiveError::InvalidCollectionIds("a,b".into()).exit_code(), 2);
    }

    #[test]
    fn unreadable_input_is_a_usage_error_without_banner() {
        let err = ArchiveError::InputNotReadable("ids.txt: No such file or directory".into());
        assert_eq!(err.exit_code(), 2);
        assert!(err.is_expected());
    }

    #[test]
    fn data_errors_exit_with_one() {
        assert_eq!(ArchiveError::InvalidIsicId("bad-id".into()).exit_code(), 1);
        assert_eq!(ArchiveError::CollectionLocked("foo".into()).exit_code(), 1);
        assert_eq!(
            ArchiveError::ValidationFailed {
                row_problems: 1,
                batch_problems: 0
            }
            .exit_code(),
            1
        );
    }

    #[test]
    fn transport_failures_are_unexpected() {
        assert!(!ArchiveError::Http("connection reset".into()).is_expected());
        assert!(ArchiveError::LoginRequired.is_expected());
    }
}
