use std::fs;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread;

use assert_matches::assert_matches;
use serde_json::{Value, json};
use tiny_http::{Response, Server, StatusCode};

use isic_cli::api::ArchiveApi;
use isic_cli::app::{
    App, Confirm, Decline, DiskShortfall, DiskSpace, ImageDownloadOutcome, ImageDownloadRequest,
};
use isic_cli::bulk::BulkSummary;
use isic_cli::config::{Environment, ResolvedConfig};
use isic_cli::coordinator::cleanup_partial_files;
use isic_cli::domain::{BulkOperation, Cohort, Collection, IsicId, Page, Record, SearchQuery, User};
use isic_cli::download::{DownloadOutcome, Downloader, RetryPolicy};
use isic_cli::error::ArchiveError;
use isic_cli::progress::{ProgressSink, SilentProgress};
use isic_cli::store::DownloadStore;

const IMAGE_BODY: &[u8] = b"hello";

fn spawn_image_server() -> (String, Arc<AtomicUsize>) {
    let server = Server::http("127.0.0.1:0").unwrap();
    let base = format!("http://{}", server.server_addr());
    let requests = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&requests);
    thread::spawn(move || {
        for req in server.incoming_requests() {
            counter.fetch_add(1, Ordering::SeqCst);
            let response = if req.url().starts_with("/ISIC_") {
                Response::from_data(IMAGE_BODY.to_vec())
            } else {
                Response::from_data(Vec::new()).with_status_code(StatusCode(404))
            };
            let _ = req.respond(response);
        }
    });
    (base, requests)
}

/// Answers every request with a body shorter than its Content-Length.
fn spawn_truncating_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { continue };
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|window| window == b"\r\n\r\n") {
                match stream.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(read) => request.extend_from_slice(&buf[..read]),
                }
            }
            let _ = stream.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nhello");
            let _ = stream.flush();
        }
    });
    base
}

fn record(base: &str, isic_id: &str) -> Record {
    serde_json::from_value(json!({
        "isic_id": isic_id,
        "attribution": "Anonymous",
        "copyright_license": "CC-0",
        "files": { "full": { "url": format!("{base}/{isic_id}.jpg"), "size": IMAGE_BODY.len() } },
        "metadata": { "acquisition": { "pixels_x": 10 }, "clinical": { "sex": "female" } },
    }))
    .unwrap()
}

struct SearchOnly {
    records: Vec<Record>,
}

fn unused<T>() -> Result<T, ArchiveError> {
    Err(ArchiveError::Http("not implemented".to_string()))
}

impl ArchiveApi for SearchOnly {
    fn current_user(&self) -> Result<Option<User>, ArchiveError> {
        Ok(None)
    }

    fn collection(&self, _id: u64) -> Result<Collection, ArchiveError> {
        unused()
    }

    fn collections_page(&self, _next: Option<&str>) -> Result<Page<Collection>, ArchiveError> {
        unused()
    }

    fn search_page(
        &self,
        _query: &SearchQuery,
        _next: Option<&str>,
    ) -> Result<Page<Record>, ArchiveError> {
        Ok(Page {
            count: Some(self.records.len() as u64),
            next: None,
            results: self.records.clone(),
        })
    }

    fn search_count(&self, _query: &SearchQuery) -> Result<u64, ArchiveError> {
        Ok(self.records.len() as u64)
    }

    fn search_size(&self, _query: &SearchQuery) -> Result<u64, ArchiveError> {
        Ok(self.records.iter().map(Record::declared_size).sum())
    }

    fn license_text(&self, license: &str) -> Result<String, ArchiveError> {
        Ok(format!("{license} license text"))
    }

    fn bulk_collection_operation(
        &self,
        _collection_id: u64,
        _operation: BulkOperation,
        _ids: &[IsicId],
    ) -> Result<BulkSummary, ArchiveError> {
        unused()
    }

    fn cohort(&self, _id: u64) -> Result<Cohort, ArchiveError> {
        unused()
    }

    fn create_accession(
        &self,
        _cohort_id: u64,
        _original_blob: &str,
    ) -> Result<Value, ArchiveError> {
        unused()
    }

    fn upload_blob(
        &self,
        _path: &Path,
        _field_id: &str,
        _progress: &dyn ProgressSink,
    ) -> Result<String, ArchiveError> {
        unused()
    }
}

struct FixedDisk(u64);

impl DiskSpace for FixedDisk {
    fn available(&self, _path: &Path) -> Option<u64> {
        Some(self.0)
    }
}

struct Accept;

impl Confirm for Accept {
    fn proceed_without_space(&self, _shortfall: &DiskShortfall) -> bool {
        true
    }
}

#[derive(Default)]
struct CountingProgress {
    advanced: AtomicU64,
}

impl CountingProgress {
    fn count(&self) -> u64 {
        self.advanced.load(Ordering::SeqCst)
    }
}

impl ProgressSink for CountingProgress {
    fn advance(&self, delta: u64) {
        self.advanced.fetch_add(delta, Ordering::SeqCst);
    }
}

fn config() -> ResolvedConfig {
    ResolvedConfig::for_environment(Environment::Dev)
}

fn downloader() -> Downloader {
    Downloader::new(&config())
        .unwrap()
        .with_retry(RetryPolicy::immediate(2))
}

#[test]
fn downloads_images_and_artifacts_once() {
    let (base, requests) = spawn_image_server();
    let app = App::new(
        SearchOnly {
            records: vec![record(&base, "ISIC_0000001")],
        },
        config(),
        None,
    );
    let temp = tempfile::tempdir().unwrap();
    let request = ImageDownloadRequest {
        query: SearchQuery::default(),
        limit: None,
        outdir: temp.path().join("out"),
    };

    let outcome = app
        .download_images(&request, &downloader(), &Decline, &FixedDisk(u64::MAX), &SilentProgress)
        .unwrap();
    let summary = match outcome {
        ImageDownloadOutcome::Completed(summary) => summary,
        ImageDownloadOutcome::Cancelled => panic!("download was cancelled"),
    };
    assert_eq!(summary.images, 1);
    assert_eq!(summary.licenses, vec!["CC-0"]);

    let out = temp.path().join("out");
    assert_eq!(fs::read(out.join("ISIC_0000001.jpg")).unwrap(), IMAGE_BODY);
    let csv = fs::read_to_string(out.join("metadata.csv")).unwrap();
    assert_eq!(
        csv.lines().collect::<Vec<_>>(),
        vec![
            "isic_id,attribution,copyright_license,pixels_x,sex",
            "ISIC_0000001,Anonymous,CC-0,10,female"
        ]
    );
    assert_eq!(fs::read_to_string(out.join("attribution.txt")).unwrap(), "Anonymous");
    assert_eq!(
        fs::read_to_string(out.join("licenses").join("CC-0.txt")).unwrap(),
        "CC-0 license text"
    );
    assert_eq!(requests.load(Ordering::SeqCst), 1);

    // Files already on disk with the declared size are not fetched again.
    app.download_images(&request, &downloader(), &Decline, &FixedDisk(u64::MAX), &SilentProgress)
        .unwrap();
    assert_eq!(requests.load(Ordering::SeqCst), 1);

    let store = DownloadStore::from_path(&out).unwrap();
    assert!(store.partial_files().unwrap().is_empty());
}

#[test]
fn insufficient_space_asks_before_downloading() {
    let (base, requests) = spawn_image_server();
    let app = App::new(
        SearchOnly {
            records: vec![record(&base, "ISIC_0000002")],
        },
        config(),
        None,
    );
    let temp = tempfile::tempdir().unwrap();
    let request = ImageDownloadRequest {
        query: SearchQuery::default(),
        limit: None,
        outdir: temp.path().to_path_buf(),
    };

    let outcome = app
        .download_images(&request, &downloader(), &Decline, &FixedDisk(1), &SilentProgress)
        .unwrap();
    assert_matches!(outcome, ImageDownloadOutcome::Cancelled);
    assert_eq!(requests.load(Ordering::SeqCst), 0);
    assert!(!temp.path().join("ISIC_0000002.jpg").exists());

    let outcome = app
        .download_images(&request, &downloader(), &Accept, &FixedDisk(1), &SilentProgress)
        .unwrap();
    assert_matches!(outcome, ImageDownloadOutcome::Completed(_));
    assert!(temp.path().join("ISIC_0000002.jpg").exists());
}

#[test]
fn limited_downloads_skip_the_size_check() {
    let (base, _requests) = spawn_image_server();
    let app = App::new(
        SearchOnly {
            records: vec![record(&base, "ISIC_0000003"), record(&base, "ISIC_0000004")],
        },
        config(),
        None,
    );
    let temp = tempfile::tempdir().unwrap();
    let request = ImageDownloadRequest {
        query: SearchQuery::default(),
        limit: Some(1),
        outdir: temp.path().to_path_buf(),
    };

    let outcome = app
        .download_images(&request, &downloader(), &Decline, &FixedDisk(0), &SilentProgress)
        .unwrap();
    assert_matches!(outcome, ImageDownloadOutcome::Completed(ref summary) if summary.images == 1);
    assert!(temp.path().join("ISIC_0000003.jpg").exists());
    assert!(!temp.path().join("ISIC_0000004.jpg").exists());
}

#[test]
fn truncated_stream_leaves_nothing_behind() {
    let base = spawn_truncating_server();
    let temp = tempfile::tempdir().unwrap();
    let store = DownloadStore::from_path(temp.path()).unwrap();
    let record = record(&base, "ISIC_0000005");

    let err = downloader()
        .download_one(&record, &store, &SilentProgress)
        .unwrap_err();
    assert_matches!(
        err,
        ArchiveError::DownloadExhausted { ref isic_id, .. } if isic_id == "ISIC_0000005"
    );

    assert!(!temp.path().join("ISIC_0000005.jpg").exists());
    assert!(store.partial_files().unwrap().is_empty());
    assert_eq!(cleanup_partial_files(&store), 0);
}

#[test]
fn error_status_is_not_retried() {
    let (base, requests) = spawn_image_server();
    let temp = tempfile::tempdir().unwrap();
    let store = DownloadStore::from_path(temp.path()).unwrap();
    let mut missing = record(&base, "ISIC_0000006");
    missing.files.full.url = format!("{base}/gone.jpg");

    let err = downloader()
        .download_one(&missing, &store, &SilentProgress)
        .unwrap_err();
    assert_matches!(err, ArchiveError::DownloadStatus { status: 404, .. });
    assert_eq!(requests.load(Ordering::SeqCst), 1);
}

#[test]
fn existing_complete_file_is_skipped() {
    let temp = tempfile::tempdir().unwrap();
    let store = DownloadStore::from_path(temp.path()).unwrap();
    fs::write(temp.path().join("ISIC_0000007.jpg"), IMAGE_BODY).unwrap();
    let record = record("http://127.0.0.1:9", "ISIC_0000007");

    let outcome = downloader()
        .download_one(&record, &store, &SilentProgress)
        .unwrap();
    assert_eq!(outcome, DownloadOutcome::AlreadyPresent);
}

#[test]
fn progress_advances_once_per_record_downloaded_or_skipped() {
    let (base, requests) = spawn_image_server();
    let records = (20..23)
        .map(|n| record(&base, &format!("ISIC_00000{n}")))
        .collect();
    let app = App::new(SearchOnly { records }, config(), None);
    let temp = tempfile::tempdir().unwrap();
    let request = ImageDownloadRequest {
        query: SearchQuery::default(),
        limit: None,
        outdir: temp.path().to_path_buf(),
    };

    let progress = CountingProgress::default();
    app.download_images(&request, &downloader(), &Decline, &FixedDisk(u64::MAX), &progress)
        .unwrap();
    assert_eq!(progress.count(), 3);
    assert_eq!(requests.load(Ordering::SeqCst), 3);

    app.download_images(&request, &downloader(), &Decline, &FixedDisk(u64::MAX), &progress)
        .unwrap();
    assert_eq!(progress.count(), 6);
    assert_eq!(requests.load(Ordering::SeqCst), 3);
}

#[test]
fn failed_image_aborts_before_artifacts_are_written() {
    let (base, _requests) = spawn_image_server();
    let mut gone = record(&base, "ISIC_0000031");
    gone.files.full.url = format!("{base}/gone.jpg");
    let app = App::new(
        SearchOnly {
            records: vec![record(&base, "ISIC_0000030"), gone],
        },
        config(),
        None,
    );
    let temp = tempfile::tempdir().unwrap();
    let request = ImageDownloadRequest {
        query: SearchQuery::default(),
        limit: None,
        outdir: temp.path().to_path_buf(),
    };

    let err = app
        .download_images(&request, &downloader(), &Decline, &FixedDisk(u64::MAX), &SilentProgress)
        .unwrap_err();
    assert_matches!(
        err,
        ArchiveError::DownloadStatus { ref isic_id, status: 404 } if isic_id == "ISIC_0000031"
    );

    let store = DownloadStore::from_path(temp.path()).unwrap();
    assert!(store.partial_files().unwrap().is_empty());
    assert!(!temp.path().join("ISIC_0000031.jpg").exists());
    assert!(!temp.path().join("metadata.csv").exists());
    assert!(!temp.path().join("attribution.txt").exists());
    assert!(!temp.path().join("licenses").exists());
}
