use std::io::{self, Read, Write};
use std::thread;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};

use crate::api::user_agent;
use crate::config::ResolvedConfig;
use crate::domain::Record;
use crate::error::ArchiveError;
use crate::progress::ProgressSink;
use crate::store::{self, DownloadStore};

const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const CONNECT_TIMEOUT_SECS: u64 = 10;
const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Exponential backoff: `multiplier * 2^(attempt - 1)` clamped to `[min_delay, max_delay]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub multiplier: Duration,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            multiplier: Duration::from_secs(1),
            min_delay: Duration::from_secs(3),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            multiplier: Duration::ZERO,
            min_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retrying after the given failed attempt (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let raw = self.multiplier.saturating_mul(1u32 << exponent);
        raw.clamp(self.min_delay, self.max_delay.max(self.min_delay))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    AlreadyPresent,
    Downloaded { bytes: u64 },
}

#[derive(Debug)]
enum AttemptError {
    Transient(String),
    Fatal(ArchiveError),
}

/// Fetches full-size image files from pre-signed URLs. Carries no
/// credentials: the URLs authorize themselves.
#[derive(Clone)]
pub struct Downloader {
    client: Client,
    retry: RetryPolicy,
}

impl Downloader {
    pub fn new(config: &ResolvedConfig) -> Result<Self, ArchiveError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&user_agent())
                .map_err(|err| ArchiveError::Http(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(config.request_timeout)
            .build()
            .map_err(|err| ArchiveError::Http(err.to_string()))?;
        Ok(Self {
            client,
            retry: config.retry.clone(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn download_one(
        &self,
        record: &Record,
        store: &DownloadStore,
        progress: &dyn ProgressSink,
    ) -> Result<DownloadOutcome, ArchiveError> {
        let target = store.image_path(&record.isic_id, &record.extension());
        if store::is_complete(&target, record.declared_size()) {
            tracing::debug!(isic_id = %record.isic_id, "already downloaded, skipping");
            progress.advance(1);
            return Ok(DownloadOutcome::AlreadyPresent);
        }

        let mut attempt = 1;
        loop {
            match self.attempt(record, store, &target) {
                Ok(bytes) => {
                    progress.advance(1);
                    return Ok(DownloadOutcome::Downloaded { bytes });
                }
                Err(AttemptError::Fatal(err)) => return Err(err),
                Err(AttemptError::Transient(message)) => {
                    if attempt >= self.retry.max_attempts {
                        return Err(ArchiveError::DownloadExhausted {
                            isic_id: record.isic_id.clone(),
                            message,
                        });
                    }
                    let delay = self.retry.delay_for(attempt);
                    tracing::debug!(
                        isic_id = %record.isic_id,
                        attempt,
                        ?delay,
                        error = %message,
                        "retrying image download"
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
            }
        }
    }

    fn attempt(
        &self,
        record: &Record,
        store: &DownloadStore,
        target: &camino::Utf8Path,
    ) -> Result<u64, AttemptError> {
        let mut response = self
            .client
            .get(&record.files.full.url)
            .send()
            .map_err(classify_send_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(AttemptError::Fatal(ArchiveError::DownloadStatus {
                isic_id: record.isic_id.clone(),
                status: status.as_u16(),
            }));
        }
        let expected = response.content_length();

        // Dropping the temp file on any early return removes it.
        let mut partial = store
            .create_partial(&record.isic_id)
            .map_err(AttemptError::Fatal)?;
        let written = copy_body(&mut response, partial.as_file_mut())?;
        if let Some(expected) = expected {
            if written != expected {
                return Err(AttemptError::Transient(format!(
                    "truncated body: received {written} of {expected} bytes"
                )));
            }
        }
        partial
            .as_file_mut()
            .flush()
            .map_err(|err| AttemptError::Fatal(ArchiveError::Filesystem(err.to_string())))?;
        partial
            .persist(target.as_std_path())
            .map_err(|err| AttemptError::Fatal(ArchiveError::Filesystem(err.error.to_string())))?;
        Ok(written)
    }
}

/// Like `io::copy`, but only failures reading the body are worth retrying.
fn copy_body<R: Read, W: Write>(reader: &mut R, writer: &mut W) -> Result<u64, AttemptError> {
    let mut buffer = [0u8; COPY_BUFFER_SIZE];
    let mut written = 0;
    loop {
        let read = match reader.read(&mut buffer) {
            Ok(0) => return Ok(written),
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(AttemptError::Transient(err.to_string())),
        };
        writer
            .write_all(&buffer[..read])
            .map_err(|err| AttemptError::Fatal(ArchiveError::Filesystem(err.to_string())))?;
        written += read as u64;
    }
}

fn classify_send_error(err: reqwest::Error) -> AttemptError {
    if err.is_connect() || err.is_timeout() || err.is_request() || err.is_body() {
        AttemptError::Transient(err.to_string())
    } else {
        AttemptError::Fatal(ArchiveError::Http(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_clamped_exponential() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = (1..=5).map(|n| policy.delay_for(n).as_secs()).collect();
        assert_eq!(delays, vec![3, 3, 4, 8, 10]);
    }

    #[test]
    fn immediate_policy_never_sleeps() {
        let policy = RetryPolicy::immediate(3);
        assert_eq!(policy.delay_for(1), Duration::ZERO);
        assert_eq!(policy.delay_for(3), Duration::ZERO);
    }

    struct FullDisk;

    impl Write for FullDisk {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::other("no space left on device"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct DroppedConnection {
        sent: bool,
    }

    impl Read for DroppedConnection {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.sent {
                return Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer"));
            }
            self.sent = true;
            buf[..5].copy_from_slice(b"hello");
            Ok(5)
        }
    }

    #[test]
    fn local_write_failure_is_not_retried() {
        let result = copy_body(&mut "hello".as_bytes(), &mut FullDisk);
        assert!(matches!(
            result,
            Err(AttemptError::Fatal(ArchiveError::Filesystem(_)))
        ));
    }

    #[test]
    fn broken_body_stream_is_retried() {
        let mut sink = Vec::new();
        let result = copy_body(&mut DroppedConnection { sent: false }, &mut sink);
        assert!(matches!(result, Err(AttemptError::Transient(_))));
        assert_eq!(sink, b"hello");
    }

    #[test]
    fn copies_whole_body() {
        let body = vec![7u8; COPY_BUFFER_SIZE * 2 + 3];
        let mut sink = Vec::new();
        assert_eq!(copy_body(&mut body.as_slice(), &mut sink).unwrap() as usize, body.len());
        assert_eq!(sink, body);
    }
}
