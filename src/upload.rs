use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use reqwest::blocking::Client;
use reqwest::header::ETAG;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::api::ArchiveHttpClient;
use crate::error::ArchiveError;
use crate::progress::ProgressSink;

pub const ACCESSION_FIELD_ID: &str = "ingest.Accession.original_blob";

#[derive(Debug, Deserialize)]
struct InitializedUpload {
    upload_id: String,
    upload_signature: String,
    parts: Vec<PresignedPart>,
}

#[derive(Debug, Deserialize)]
struct PresignedPart {
    part_number: u32,
    size: u64,
    upload_url: String,
}

#[derive(Debug, Serialize)]
struct CompletedPart {
    part_number: u32,
    size: u64,
    etag: String,
}

#[derive(Debug, Deserialize)]
struct CompletionRequest {
    complete_url: String,
    body: String,
}

#[derive(Debug, Deserialize)]
struct FinalizedUpload {
    field_value: String,
}

/// Multipart upload through the archive's signed storage endpoints:
/// initialize, PUT each part, complete, finalize.
pub struct BlobUploader<'a> {
    api: &'a ArchiveHttpClient,
    storage: Client,
}

impl<'a> BlobUploader<'a> {
    pub fn new(api: &'a ArchiveHttpClient, storage: Client) -> Self {
        Self { api, storage }
    }

    /// Uploads `path` and returns the opaque field value to attach to a model.
    pub fn upload(
        &self,
        path: &Path,
        field_id: &str,
        progress: &dyn ProgressSink,
    ) -> Result<String, ArchiveError> {
        let mut file = File::open(path).map_err(|err| ArchiveError::Upload(err.to_string()))?;
        let file_size = file
            .metadata()
            .map_err(|err| ArchiveError::Upload(err.to_string()))?
            .len();
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .ok_or_else(|| ArchiveError::Upload(format!("{} has no file name", path.display())))?;

        let init: InitializedUpload = self.api.post_json(
            "s3-upload/upload-initialize/",
            &json!({ "field_id": field_id, "file_name": file_name, "file_size": file_size }),
        )?;
        tracing::debug!(
            upload_id = %init.upload_id,
            parts = init.parts.len(),
            "upload initialized"
        );

        progress.start("Uploading", file_size);
        let mut completed = Vec::with_capacity(init.parts.len());
        let mut offset = 0u64;
        for part in &init.parts {
            let etag = self.put_part(&mut file, offset, part)?;
            offset += part.size;
            progress.advance(part.size);
            completed.push(CompletedPart {
                part_number: part.part_number,
                size: part.size,
                etag,
            });
        }
        progress.finish();

        let completion: CompletionRequest = self.api.post_json(
            "s3-upload/upload-complete/",
            &json!({
                "upload_signature": init.upload_signature,
                "upload_id": init.upload_id,
                "parts": completed,
            }),
        )?;
        let response = self
            .storage
            .post(&completion.complete_url)
            .body(completion.body)
            .send()
            .map_err(|err| ArchiveError::Upload(err.to_string()))?;
        if !response.status().is_success() {
            return Err(ArchiveError::Upload(format!(
                "completing upload returned status {}",
                response.status().as_u16()
            )));
        }

        let finalized: FinalizedUpload = self.api.post_json(
            "s3-upload/upload-finalize/",
            &json!({ "upload_signature": init.upload_signature }),
        )?;
        Ok(finalized.field_value)
    }

    fn put_part(
        &self,
        file: &mut File,
        offset: u64,
        part: &PresignedPart,
    ) -> Result<String, ArchiveError> {
        file.seek(SeekFrom::Start(offset))
            .map_err(|err| ArchiveError::Upload(err.to_string()))?;
        let mut chunk = Vec::with_capacity(part.size as usize);
        file.by_ref()
            .take(part.size)
            .read_to_end(&mut chunk)
            .map_err(|err| ArchiveError::Upload(err.to_string()))?;
        if chunk.len() as u64 != part.size {
            return Err(ArchiveError::Upload(format!(
                "file changed during upload: part {} is short",
                part.part_number
            )));
        }

        let response = self
            .storage
            .put(&part.upload_url)
            .body(chunk)
            .send()
            .map_err(|err| ArchiveError::Upload(err.to_string()))?;
        if !response.status().is_success() {
            return Err(ArchiveError::Upload(format!(
                "part {} returned status {}",
                part.part_number,
                response.status().as_u16()
            )));
        }
        response
            .headers()
            .get(ETAG)
            .and_then(|etag| etag.to_str().ok())
            .map(|etag| etag.to_string())
            .ok_or_else(|| ArchiveError::Upload(format!("part {} has no ETag", part.part_number)))
    }
}
