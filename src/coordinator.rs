use std::fs;
use std::io::ErrorKind;
use std::sync::Once;

use rayon::ThreadPoolBuilder;
use rayon::prelude::*;

use crate::domain::Record;
use crate::download::Downloader;
use crate::error::ArchiveError;
use crate::progress::ProgressSink;
use crate::store::DownloadStore;

pub const DOWNLOAD_CHUNK_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadPhase {
    Idle,
    CountingResults,
    SizeCheck,
    Downloading,
    WritingArtifacts,
    Done,
    Cancelled,
    Failed,
}

impl DownloadPhase {
    pub fn can_move_to(self, next: DownloadPhase) -> bool {
        use DownloadPhase::*;
        matches!(
            (self, next),
            (Idle, CountingResults)
                | (CountingResults, SizeCheck)
                | (CountingResults, Downloading)
                | (SizeCheck, Downloading)
                | (SizeCheck, Cancelled)
                | (Downloading, WritingArtifacts)
                | (Downloading, Cancelled)
                | (WritingArtifacts, Done)
        ) || (next == Failed && !matches!(self, Done | Cancelled | Failed))
    }
}

/// Tracks the image download lifecycle, logging every transition.
#[derive(Debug)]
pub struct PhaseTracker {
    phase: DownloadPhase,
}

impl PhaseTracker {
    pub fn new() -> Self {
        Self {
            phase: DownloadPhase::Idle,
        }
    }

    pub fn phase(&self) -> DownloadPhase {
        self.phase
    }

    pub fn enter(&mut self, next: DownloadPhase) {
        debug_assert!(
            self.phase.can_move_to(next),
            "illegal download transition {:?} -> {next:?}",
            self.phase
        );
        tracing::debug!(from = ?self.phase, to = ?next, "download phase");
        self.phase = next;
    }
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Downloads every record on a bounded pool, 100 at a time, and returns
/// the records in enumeration order once all of them are on disk.
pub fn download_all<I>(
    downloader: &Downloader,
    records: I,
    store: &DownloadStore,
    workers: usize,
    progress: &dyn ProgressSink,
) -> Result<Vec<Record>, ArchiveError>
where
    I: IntoIterator<Item = Result<Record, ArchiveError>>,
{
    let pool = ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .thread_name(|index| format!("isic-download-{index}"))
        .build()
        .map_err(|err| ArchiveError::Filesystem(err.to_string()))?;

    let mut all = Vec::new();
    let mut records = records.into_iter();
    loop {
        let chunk = records
            .by_ref()
            .take(DOWNLOAD_CHUNK_SIZE)
            .collect::<Result<Vec<_>, _>>()?;
        if chunk.is_empty() {
            break;
        }
        pool.install(|| {
            chunk
                .par_iter()
                .try_for_each(|record| downloader.download_one(record, store, progress).map(drop))
        })?;
        tracing::debug!(chunk = chunk.len(), total = all.len() + chunk.len(), "chunk downloaded");
        all.extend(chunk);
    }
    Ok(all)
}

/// Removes this process's partial files. Returns how many were removed.
pub fn cleanup_partial_files(store: &DownloadStore) -> usize {
    let paths = match store.partial_files() {
        Ok(paths) => paths,
        Err(err) => {
            tracing::warn!(error = %err, "unable to list partially downloaded files");
            return 0;
        }
    };
    let mut removed = 0;
    let mut permission_errors = false;
    for path in paths {
        match fs::remove_file(path.as_std_path()) {
            Ok(()) => removed += 1,
            // A worker may have renamed it into place after listing.
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) if err.kind() == ErrorKind::PermissionDenied => permission_errors = true,
            Err(err) => tracing::warn!(path = %path, error = %err, "failed to remove partial file"),
        }
    }
    if permission_errors {
        tracing::warn!("Permission error while cleaning up one or more partially downloaded files");
    }
    removed
}

/// Runs partial-file cleanup when dropped, covering normal and error exits.
pub struct PartialFileGuard {
    store: DownloadStore,
}

impl PartialFileGuard {
    pub fn new(store: DownloadStore) -> Self {
        Self { store }
    }
}

impl Drop for PartialFileGuard {
    fn drop(&mut self) {
        let removed = cleanup_partial_files(&self.store);
        if removed > 0 {
            tracing::debug!(removed, "removed partial files");
        }
    }
}

static INTERRUPT_CLEANUP: Once = Once::new();

/// Installs a SIGINT/SIGTERM handler that removes partial files once and
/// exits with status 1. Only one handler can exist per process.
pub fn install_interrupt_cleanup(store: DownloadStore) -> Result<(), ArchiveError> {
    ctrlc::set_handler(move || {
        INTERRUPT_CLEANUP.call_once(|| {
            cleanup_partial_files(&store);
        });
        std::process::exit(1);
    })
    .map_err(|err| ArchiveError::Filesystem(format!("unable to install signal handler: {err}")))
}

#[cfg(test)]
mod tests {
    use super::DownloadPhase::*;
    use super::*;

    #[test]
    fn lifecycle_transitions() {
        assert!(Idle.can_move_to(CountingResults));
        assert!(CountingResults.can_move_to(Downloading));
        assert!(SizeCheck.can_move_to(Cancelled));
        assert!(Downloading.can_move_to(Failed));
        assert!(!Idle.can_move_to(Downloading));
        assert!(!Done.can_move_to(Failed));
        assert!(!WritingArtifacts.can_move_to(Cancelled));
    }

    #[test]
    fn cleanup_removes_only_own_partials() {
        let temp = tempfile::tempdir().unwrap();
        let store = DownloadStore::from_path(temp.path()).unwrap();
        let partial = store.create_partial("ISIC_0000001").unwrap();
        let (_, path) = partial.keep().unwrap();
        fs::write(temp.path().join("ISIC_0000002.jpg"), b"done").unwrap();

        assert_eq!(cleanup_partial_files(&store), 1);
        assert!(!path.exists());
        assert!(temp.path().join("ISIC_0000002.jpg").exists());
    }
}
