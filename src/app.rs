use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::Serialize;
use serde_json::Value;

use crate::api::ArchiveApi;
use crate::bulk::{self, BulkSummary};
use crate::config::ResolvedConfig;
use crate::coordinator::{self, DownloadPhase, PartialFileGuard, PhaseTracker};
use crate::domain::{BulkOperation, Collection, SearchQuery, User, parse_isic_id_list};
use crate::download::Downloader;
use crate::error::ArchiveError;
use crate::metadata::{self, MetadataTable};
use crate::output::{bytes_to_human, intcomma};
use crate::paginate;
use crate::progress::{ProgressEvent, ProgressSink, SilentProgress};
use crate::store::{self, DownloadStore};
use crate::upload::ACCESSION_FIELD_ID;
use crate::validate::{self, ValidationReport};

pub const SNAPSHOT_URL: &str =
    "https://isic-archive.s3.us-east-1.amazonaws.com/snapshots/ISIC_images.zip";
pub const GUEST_HINT: &str =
    "Psst, you're logged out. Logging in with `isic user login` might return more data.";

/// Checks run at the top of a command, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    RequireLogin,
    SuggestGuestLogin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskShortfall {
    pub required: u64,
    pub available: u64,
}

impl DiskShortfall {
    pub fn required_human(&self) -> String {
        bytes_to_human(self.required)
    }

    pub fn available_human(&self) -> String {
        bytes_to_human(self.available)
    }
}

pub trait Confirm {
    /// Asked when the download will not fit. `false` cancels.
    fn proceed_without_space(&self, shortfall: &DiskShortfall) -> bool;
}

pub struct Decline;

impl Confirm for Decline {
    fn proceed_without_space(&self, _shortfall: &DiskShortfall) -> bool {
        false
    }
}

pub trait DiskSpace {
    fn available(&self, path: &Path) -> Option<u64>;
}

pub struct FsDiskSpace;

impl DiskSpace for FsDiskSpace {
    fn available(&self, path: &Path) -> Option<u64> {
        match fs2::available_space(path) {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                tracing::debug!(path = %path.display(), error = %err, "unable to read free space");
                None
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImageDownloadRequest {
    pub query: SearchQuery,
    pub limit: Option<u64>,
    pub outdir: PathBuf,
}

impl ImageDownloadRequest {
    /// Unfiltered, unlimited requests would mirror the whole archive.
    pub fn is_full_archive(&self) -> bool {
        self.query.is_unfiltered() && self.limit.is_none()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageDownloadSummary {
    pub outdir: String,
    pub images: u64,
    pub metadata_records: u64,
    pub metadata_path: String,
    pub attribution_path: String,
    pub licenses_dir: String,
    pub licenses: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub enum ImageDownloadOutcome {
    Completed(ImageDownloadSummary),
    Cancelled,
}

pub struct App<A: ArchiveApi> {
    api: A,
    config: ResolvedConfig,
    user: Option<User>,
}

impl<A: ArchiveApi> App<A> {
    pub fn new(api: A, config: ResolvedConfig, user: Option<User>) -> Self {
        Self { api, config, user }
    }

    /// Looks the user up through `api`. Guests skip the lookup.
    pub fn connect(api: A, config: ResolvedConfig, guest: bool) -> Result<Self, ArchiveError> {
        let user = if guest { None } else { api.current_user()? };
        Ok(Self::new(api, config, user))
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn user(&self) -> Option<&User> {
        self.user.as_ref()
    }

    /// Returns hints to show the user. Fails when a requirement is unmet.
    pub fn check(&self, preconditions: &[Precondition]) -> Result<Vec<&'static str>, ArchiveError> {
        let mut hints = Vec::new();
        for precondition in preconditions {
            match precondition {
                Precondition::RequireLogin if self.user.is_none() => {
                    return Err(ArchiveError::LoginRequired);
                }
                Precondition::SuggestGuestLogin if self.user.is_none() => hints.push(GUEST_HINT),
                _ => {}
            }
        }
        Ok(hints)
    }

    pub fn list_collections(&self) -> Result<Vec<Collection>, ArchiveError> {
        let mut collections =
            paginate::fetch_collections(&self.api).collect::<Result<Vec<_>, _>>()?;
        collections.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(collections)
    }

    /// Adds or removes images. Identifiers and the lock state are checked
    /// before anything is sent.
    pub fn modify_collection(
        &self,
        collection_id: u64,
        operation: BulkOperation,
        isic_ids: &str,
        progress: &dyn ProgressSink,
    ) -> Result<BulkSummary, ArchiveError> {
        let ids = parse_isic_id_list(isic_ids)?;
        let collection = self.api.collection(collection_id)?;
        if collection.locked {
            return Err(ArchiveError::CollectionLocked(collection.name));
        }
        tracing::debug!(collection_id, images = ids.len(), ?operation, "modifying collection");
        bulk::apply(&self.api, collection_id, operation, &ids, progress)
    }

    pub fn validate_metadata(
        &self,
        csv_path: &Path,
        progress: &dyn ProgressSink,
    ) -> Result<ValidationReport, ArchiveError> {
        validate::validate_path(csv_path, progress)
    }

    /// Number of records a command will process once `limit` is applied.
    pub fn planned_count(
        &self,
        query: &SearchQuery,
        limit: Option<u64>,
    ) -> Result<u64, ArchiveError> {
        let count = self.api.search_count(query)?;
        Ok(limit.map(|limit| limit.min(count)).unwrap_or(count))
    }

    pub fn download_metadata(
        &self,
        query: &SearchQuery,
        limit: Option<u64>,
        progress: &dyn ProgressSink,
    ) -> Result<MetadataTable, ArchiveError> {
        let planned = self.planned_count(query, limit)?;
        progress.start(
            &format!("Downloading metadata records ({})", intcomma(planned)),
            planned,
        );
        let records = paginate::fetch_records(&self.api, query).take(planned as usize);
        let table = metadata::extract(records, progress)?;
        progress.finish();
        Ok(table)
    }

    pub fn download_images(
        &self,
        request: &ImageDownloadRequest,
        downloader: &Downloader,
        confirm: &dyn Confirm,
        disk: &dyn DiskSpace,
        progress: &dyn ProgressSink,
    ) -> Result<ImageDownloadOutcome, ArchiveError> {
        let store = DownloadStore::from_path(&request.outdir)?;
        store.ensure_root()?;
        let _cleanup = PartialFileGuard::new(store.clone());

        let mut tracker = PhaseTracker::new();
        let result = self.run_image_download(
            request,
            downloader,
            confirm,
            disk,
            progress,
            &store,
            &mut tracker,
        );
        if result.is_err() {
            tracker.enter(DownloadPhase::Failed);
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn run_image_download(
        &self,
        request: &ImageDownloadRequest,
        downloader: &Downloader,
        confirm: &dyn Confirm,
        disk: &dyn DiskSpace,
        progress: &dyn ProgressSink,
        store: &DownloadStore,
        tracker: &mut PhaseTracker,
    ) -> Result<ImageDownloadOutcome, ArchiveError> {
        let started = Instant::now();
        tracker.enter(DownloadPhase::CountingResults);
        let planned = self.planned_count(&request.query, request.limit)?;

        // A limit makes the exact byte total unknowable.
        let message = if request.limit.is_none() {
            tracker.enter(DownloadPhase::SizeCheck);
            let required = self.api.search_size(&request.query)?;
            if let Some(available) = disk.available(store.root().as_std_path()) {
                let shortfall = DiskShortfall { required, available };
                if required > available && !confirm.proceed_without_space(&shortfall) {
                    tracker.enter(DownloadPhase::Cancelled);
                    return Ok(ImageDownloadOutcome::Cancelled);
                }
            }
            format!(
                "Downloading images + metadata ({} files, {})",
                intcomma(planned),
                bytes_to_human(required)
            )
        } else {
            format!("Downloading images + metadata ({} files)", intcomma(planned))
        };

        tracker.enter(DownloadPhase::Downloading);
        progress.start(&message, planned);
        let records = paginate::fetch_records(&self.api, &request.query).take(planned as usize);
        let downloaded = coordinator::download_all(
            downloader,
            records,
            store,
            self.config.download_workers,
            progress,
        )?;
        progress.finish();

        tracker.enter(DownloadPhase::WritingArtifacts);
        let table = metadata::extract(downloaded.into_iter().map(Ok), &SilentProgress)?;
        let summary = self.write_artifacts(store, &table)?;

        tracker.enter(DownloadPhase::Done);
        progress.event(ProgressEvent {
            message: format!(
                "Downloaded {} images to {}",
                intcomma(summary.images),
                summary.outdir
            ),
            elapsed: Some(started.elapsed()),
        });
        Ok(ImageDownloadOutcome::Completed(summary))
    }

    fn write_artifacts(
        &self,
        store: &DownloadStore,
        table: &MetadataTable,
    ) -> Result<ImageDownloadSummary, ArchiveError> {
        let mut csv = Vec::new();
        table.write_csv(&mut csv)?;
        store::write_bytes_atomic(&store.metadata_csv_path(), &csv)?;
        store::write_bytes_atomic(
            &store.attribution_path(),
            metadata::attribution_text(&table.rows).as_bytes(),
        )?;

        fs::create_dir_all(store.licenses_dir().as_std_path())
            .map_err(|err| ArchiveError::Filesystem(err.to_string()))?;
        let licenses = table.licenses();
        for license in &licenses {
            let text = self.api.license_text(license)?;
            store::write_bytes_atomic(&store.license_path(license), text.as_bytes())?;
        }

        Ok(ImageDownloadSummary {
            outdir: store.root().to_string(),
            images: table.len() as u64,
            metadata_records: table.len() as u64,
            metadata_path: store.metadata_csv_path().to_string(),
            attribution_path: store.attribution_path().to_string(),
            licenses_dir: store.licenses_dir().to_string(),
            licenses,
        })
    }

    pub fn upload_accession(
        &self,
        cohort_id: u64,
        path: &Path,
        progress: &dyn ProgressSink,
    ) -> Result<Value, ArchiveError> {
        self.api.cohort(cohort_id)?;
        if !path.is_file() {
            return Err(ArchiveError::Upload(format!("{} is not a file", path.display())));
        }
        let blob = self.api.upload_blob(path, ACCESSION_FIELD_ID, progress)?;
        self.api.create_accession(cohort_id, &blob)
    }
}

/// Fails early when `path` cannot be created or written.
pub fn prepare_output_file(path: &Path) -> Result<(), ArchiveError> {
    if path.is_dir() {
        return Err(ArchiveError::OutputNotWritable(format!(
            "{} is a directory",
            path.display()
        )));
    }
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    if !parent.is_dir() {
        return Err(ArchiveError::OutputNotWritable(format!(
            "{} does not exist",
            parent.display()
        )));
    }
    let not_writable =
        |err: io::Error| ArchiveError::OutputNotWritable(format!("{}: {err}", path.display()));
    // Nothing is created or truncated here; an empty result set leaves the path untouched.
    if path.exists() {
        fs::OpenOptions::new()
            .write(true)
            .open(path)
            .map(drop)
            .map_err(not_writable)
    } else {
        tempfile::Builder::new()
            .prefix(".isic-write-check.")
            .tempfile_in(parent)
            .map(drop)
            .map_err(not_writable)
    }
}

/// Reads a whole text input, from stdin when `path` is `-`.
pub fn read_input_text(path: &Path) -> Result<String, ArchiveError> {
    let content = if path == Path::new("-") {
        io::read_to_string(io::stdin())
    } else {
        fs::read_to_string(path)
    };
    content.map_err(|err| ArchiveError::InputNotReadable(format!("{}: {err}", path.display())))
}

/// Writes the table to `path`, or stdout when `path` is absent or `-`.
pub fn write_metadata_output(
    table: &MetadataTable,
    path: Option<&Path>,
) -> Result<(), ArchiveError> {
    match path {
        Some(path) if path != Path::new("-") => {
            let file = fs::File::create(path).map_err(|err| {
                ArchiveError::OutputNotWritable(format!("{}: {err}", path.display()))
            })?;
            table.write_csv(io::BufWriter::new(file))
        }
        _ => table.write_csv(io::stdout().lock()),
    }
}
