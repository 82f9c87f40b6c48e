use std::fs;
use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::{Builder, NamedTempFile};

use crate::error::ArchiveError;

const PARTIAL_MARKER: &str = ".isic-partial";
const METADATA_FILE: &str = "metadata.csv";
const ATTRIBUTION_FILE: &str = "attribution.txt";
const LICENSES_DIR: &str = "licenses";

/// Layout of one download destination directory.
#[derive(Debug, Clone)]
pub struct DownloadStore {
    root: Utf8PathBuf,
    pid: u32,
}

impl DownloadStore {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self {
            root,
            pid: std::process::id(),
        }
    }

    pub fn from_path(root: &std::path::Path) -> Result<Self, ArchiveError> {
        let root = Utf8PathBuf::from_path_buf(root.to_path_buf()).map_err(|path| {
            ArchiveError::OutputNotWritable(format!("{} is not valid UTF-8", path.display()))
        })?;
        Ok(Self::new(root))
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn image_path(&self, isic_id: &str, extension: &str) -> Utf8PathBuf {
        self.root.join(format!("{isic_id}.{extension}"))
    }

    pub fn metadata_csv_path(&self) -> Utf8PathBuf {
        self.root.join(METADATA_FILE)
    }

    pub fn attribution_path(&self) -> Utf8PathBuf {
        self.root.join(ATTRIBUTION_FILE)
    }

    pub fn licenses_dir(&self) -> Utf8PathBuf {
        self.root.join(LICENSES_DIR)
    }

    pub fn license_path(&self, license: &str) -> Utf8PathBuf {
        self.licenses_dir().join(format!("{license}.txt"))
    }

    /// Creates the directory and proves it accepts new files.
    pub fn ensure_root(&self) -> Result<(), ArchiveError> {
        fs::create_dir_all(self.root.as_std_path())
            .map_err(|err| ArchiveError::OutputNotWritable(format!("{}: {err}", self.root)))?;
        Builder::new()
            .prefix(".isic-write-check.")
            .tempfile_in(self.root.as_std_path())
            .map(drop)
            .map_err(|err| ArchiveError::OutputNotWritable(format!("{}: {err}", self.root)))
    }

    /// Prefix shared by every partial file this process creates.
    pub fn partial_prefix(&self) -> String {
        format!("{PARTIAL_MARKER}.{}.", self.pid)
    }

    pub fn create_partial(&self, isic_id: &str) -> Result<NamedTempFile, ArchiveError> {
        Builder::new()
            .prefix(&format!("{}{isic_id}.", self.partial_prefix()))
            .tempfile_in(self.root.as_std_path())
            .map_err(|err| ArchiveError::Filesystem(err.to_string()))
    }

    /// Partial files left behind by this process.
    pub fn partial_files(&self) -> Result<Vec<Utf8PathBuf>, ArchiveError> {
        let prefix = self.partial_prefix();
        let entries = match fs::read_dir(self.root.as_std_path()) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(ArchiveError::Filesystem(err.to_string())),
        };
        let mut found = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| ArchiveError::Filesystem(err.to_string()))?;
            let name = entry.file_name();
            if name.to_string_lossy().starts_with(&prefix) {
                found.push(self.root.join(name.to_string_lossy().as_ref()));
            }
        }
        found.sort();
        Ok(found)
    }
}

/// Writes through a temp file in the same directory, then renames.
pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), ArchiveError> {
    let parent = path
        .parent()
        .ok_or_else(|| ArchiveError::Filesystem(format!("invalid destination {path}")))?;
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| ArchiveError::Filesystem(err.to_string()))?;
    let mut temp = Builder::new()
        .prefix(".isic-write.")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| ArchiveError::Filesystem(err.to_string()))?;
    temp.write_all(content)
        .map_err(|err| ArchiveError::Filesystem(err.to_string()))?;
    temp.persist(path.as_std_path())
        .map_err(|err| ArchiveError::Filesystem(err.error.to_string()))?;
    Ok(())
}

/// True when `path` already holds a file of exactly `size` bytes.
pub fn is_complete(path: &Utf8Path, size: u64) -> bool {
    fs::metadata(path.as_std_path())
        .map(|meta| meta.is_file() && meta.len() == size)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths() {
        let store = DownloadStore::new(Utf8PathBuf::from("out"));
        assert_eq!(store.image_path("ISIC_0000000", "jpg"), "out/ISIC_0000000.jpg");
        assert_eq!(store.license_path("CC-BY"), "out/licenses/CC-BY.txt");
        assert!(store.partial_prefix().starts_with(".isic-partial."));
    }

    #[test]
    fn partial_files_only_match_this_process() {
        let temp = tempfile::tempdir().unwrap();
        let store = DownloadStore::from_path(temp.path()).unwrap();
        let ours = store.create_partial("ISIC_0000001").unwrap();
        let other = format!(".isic-partial.{}.ISIC_0000002.abc", std::process::id() + 1);
        fs::write(temp.path().join(other), b"x").unwrap();
        fs::write(temp.path().join("ISIC_0000003.jpg"), b"x").unwrap();

        let found = store.partial_files().unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].as_std_path(), ours.path());
    }
}
