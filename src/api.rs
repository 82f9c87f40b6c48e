use std::path::Path;
use std::thread;
use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue, USER_AGENT};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::bulk::BulkSummary;
use crate::config::ResolvedConfig;
use crate::domain::{BulkOperation, Cohort, Collection, IsicId, Page, Record, SearchQuery, User};
use crate::error::ArchiveError;
use crate::progress::ProgressSink;
use crate::upload::BlobUploader;

const MAX_RETRIES: usize = 3;
const BASE_DELAY_MS: u64 = 200;

pub trait ArchiveApi: Send + Sync {
    fn current_user(&self) -> Result<Option<User>, ArchiveError>;
    fn collection(&self, id: u64) -> Result<Collection, ArchiveError>;
    fn collections_page(&self, next: Option<&str>) -> Result<Page<Collection>, ArchiveError>;
    fn search_page(
        &self,
        query: &SearchQuery,
        next: Option<&str>,
    ) -> Result<Page<Record>, ArchiveError>;
    fn search_count(&self, query: &SearchQuery) -> Result<u64, ArchiveError>;
    fn search_size(&self, query: &SearchQuery) -> Result<u64, ArchiveError>;
    fn license_text(&self, license: &str) -> Result<String, ArchiveError>;
    fn bulk_collection_operation(
        &self,
        collection_id: u64,
        operation: BulkOperation,
        ids: &[IsicId],
    ) -> Result<BulkSummary, ArchiveError>;
    fn cohort(&self, id: u64) -> Result<Cohort, ArchiveError>;
    fn create_accession(&self, cohort_id: u64, original_blob: &str)
    -> Result<Value, ArchiveError>;
    fn upload_blob(
        &self,
        path: &Path,
        field_id: &str,
        progress: &dyn ProgressSink,
    ) -> Result<String, ArchiveError>;
}

#[derive(Deserialize)]
struct SizeResponse {
    size: u64,
}

#[derive(Clone)]
pub struct ArchiveHttpClient {
    client: Client,
    storage: Client,
    base_url: Url,
    authenticated: bool,
}

impl ArchiveHttpClient {
    pub fn new(
        config: &ResolvedConfig,
        auth_headers: Option<HeaderMap>,
    ) -> Result<Self, ArchiveError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&user_agent())
                .map_err(|err| ArchiveError::Http(err.to_string()))?,
        );
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        let authenticated = auth_headers.is_some();
        if let Some(auth) = auth_headers {
            headers.extend(auth);
        }

        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(10))
            .timeout(config.request_timeout)
            .build()
            .map_err(|err| ArchiveError::Http(err.to_string()))?;
        // Signed storage URLs must not see the archive's credentials.
        let storage = Client::builder()
            .user_agent(user_agent())
            .connect_timeout(Duration::from_secs(10))
            .timeout(config.request_timeout)
            .build()
            .map_err(|err| ArchiveError::Http(err.to_string()))?;
        let base_url =
            Url::parse(&config.api_url).map_err(|err| ArchiveError::Http(err.to_string()))?;

        Ok(Self {
            client,
            storage,
            base_url,
            authenticated,
        })
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn endpoint(&self, path: &str) -> Result<Url, ArchiveError> {
        self.base_url
            .join(path)
            .map_err(|err| ArchiveError::Http(err.to_string()))
    }

    pub fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &Value,
    ) -> Result<T, ArchiveError> {
        let url = self.endpoint(path)?;
        let response = self.send_with_retries(false, || self.client.post(url.clone()).json(body))?;
        let response = handle_status(response)?;
        response
            .json()
            .map_err(|err| ArchiveError::Http(err.to_string()))
    }

    fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, ArchiveError> {
        let response = self.send_with_retries(true, || self.client.get(url.clone()))?;
        let response = handle_status(response)?;
        response
            .json()
            .map_err(|err| ArchiveError::Http(err.to_string()))
    }

    fn search_url(
        &self,
        path: &str,
        query: &SearchQuery,
        limit: Option<u64>,
    ) -> Result<Url, ArchiveError> {
        let mut url = self.endpoint(path)?;
        {
            let mut pairs = url.query_pairs_mut();
            for (name, value) in query.params() {
                pairs.append_pair(name, &value);
            }
            if let Some(limit) = limit {
                pairs.append_pair("limit", &limit.to_string());
            }
        }
        Ok(url)
    }

    fn search_get<T: DeserializeOwned>(
        &self,
        query: &SearchQuery,
        url: Url,
    ) -> Result<T, ArchiveError> {
        let response = self.send_with_retries(true, || self.client.get(url.clone()))?;
        if response.status() == StatusCode::BAD_REQUEST {
            let status = response.status().as_u16();
            let message = response.text().unwrap_or_default();
            if is_query_syntax_complaint(&message) {
                return Err(ArchiveError::InvalidSearchQuery(query.query.clone()));
            }
            return Err(ArchiveError::ApiStatus { status, message });
        }
        let response = handle_status(response)?;
        response
            .json()
            .map_err(|err| ArchiveError::Http(err.to_string()))
    }

    fn get_or_not_found<T: DeserializeOwned>(
        &self,
        path: &str,
        kind: &'static str,
        id: u64,
    ) -> Result<T, ArchiveError> {
        let url = self.endpoint(path)?;
        let response = self.send_with_retries(true, || self.client.get(url.clone()))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(ArchiveError::NotFoundOrInaccessible {
                kind,
                id: id.to_string(),
            });
        }
        let response = handle_status(response)?;
        response
            .json()
            .map_err(|err| ArchiveError::Http(err.to_string()))
    }

    fn send_with_retries<F>(
        &self,
        idempotent: bool,
        mut make_req: F,
    ) -> Result<Response, ArchiveError>
    where
        F: FnMut() -> RequestBuilder,
    {
        let mut attempt = 0usize;
        loop {
            let response = make_req().send();
            match response {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if idempotent && attempt < MAX_RETRIES && is_retryable_status(status) {
                        tracing::debug!(status, attempt, "retrying archive request");
                        backoff(attempt);
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    let retryable = if idempotent {
                        is_retryable_error(&err)
                    } else {
                        err.is_connect()
                    };
                    if attempt < MAX_RETRIES && retryable {
                        tracing::debug!(error = %err, attempt, "retrying archive request");
                        backoff(attempt);
                        attempt += 1;
                        continue;
                    }
                    return Err(ArchiveError::Http(err.to_string()));
                }
            }
        }
    }
}

impl ArchiveApi for ArchiveHttpClient {
    fn current_user(&self) -> Result<Option<User>, ArchiveError> {
        if !self.authenticated {
            return Ok(None);
        }
        let url = self.endpoint("users/me/")?;
        let response = self.send_with_retries(true, || self.client.get(url.clone()))?;
        if matches!(
            response.status(),
            StatusCode::NOT_FOUND | StatusCode::UNAUTHORIZED
        ) {
            return Ok(None);
        }
        let response = handle_status(response)?;
        response
            .json()
            .map(Some)
            .map_err(|err| ArchiveError::Http(err.to_string()))
    }

    fn collection(&self, id: u64) -> Result<Collection, ArchiveError> {
        self.get_or_not_found(&format!("collections/{id}/"), "Collection", id)
    }

    fn collections_page(&self, next: Option<&str>) -> Result<Page<Collection>, ArchiveError> {
        let url = match next {
            Some(next) => Url::parse(next).map_err(|err| ArchiveError::Http(err.to_string()))?,
            None => self.endpoint("collections/")?,
        };
        self.get_json(url)
    }

    fn search_page(
        &self,
        query: &SearchQuery,
        next: Option<&str>,
    ) -> Result<Page<Record>, ArchiveError> {
        let url = match next {
            Some(next) => Url::parse(next).map_err(|err| ArchiveError::Http(err.to_string()))?,
            None => self.search_url("images/search/", query, None)?,
        };
        self.search_get(query, url)
    }

    fn search_count(&self, query: &SearchQuery) -> Result<u64, ArchiveError> {
        let url = self.search_url("images/search/", query, Some(1))?;
        let page: Page<Value> = self.search_get(query, url)?;
        Ok(page.count.unwrap_or(page.results.len() as u64))
    }

    fn search_size(&self, query: &SearchQuery) -> Result<u64, ArchiveError> {
        let url = self.search_url("images/search/size/", query, None)?;
        let size: SizeResponse = self.search_get(query, url)?;
        Ok(size.size)
    }

    fn license_text(&self, license: &str) -> Result<String, ArchiveError> {
        let url = self.endpoint(&format!("zip-download/license-file/{license}/"))?;
        let response = self.send_with_retries(true, || self.client.get(url.clone()))?;
        let response = handle_status(response)?;
        response
            .text()
            .map_err(|err| ArchiveError::Http(err.to_string()))
    }

    fn bulk_collection_operation(
        &self,
        collection_id: u64,
        operation: BulkOperation,
        ids: &[IsicId],
    ) -> Result<BulkSummary, ArchiveError> {
        let body = json!({ "isic_ids": ids });
        self.post_json(
            &format!("collections/{collection_id}/{}/", operation.endpoint()),
            &body,
        )
    }

    fn cohort(&self, id: u64) -> Result<Cohort, ArchiveError> {
        self.get_or_not_found(&format!("cohorts/{id}/"), "Cohort", id)
    }

    fn create_accession(
        &self,
        cohort_id: u64,
        original_blob: &str,
    ) -> Result<Value, ArchiveError> {
        let url = self.endpoint("accessions/")?;
        let body = json!({ "original_blob": original_blob, "cohort": cohort_id });
        let response = self.send_with_retries(false, || self.client.post(url.clone()).json(&body))?;
        if response.status() == StatusCode::BAD_REQUEST {
            let status = response.status().as_u16();
            let message = response.text().unwrap_or_default();
            if let Some(reason) = non_field_error(&message) {
                return Err(ArchiveError::AccessionRejected(reason));
            }
            return Err(ArchiveError::ApiStatus { status, message });
        }
        let response = handle_status(response)?;
        response
            .json()
            .map_err(|err| ArchiveError::Http(err.to_string()))
    }

    fn upload_blob(
        &self,
        path: &Path,
        field_id: &str,
        progress: &dyn ProgressSink,
    ) -> Result<String, ArchiveError> {
        BlobUploader::new(self, self.storage.clone()).upload(path, field_id, progress)
    }
}

pub fn user_agent() -> String {
    format!("isic-cli/{}", env!("CARGO_PKG_VERSION"))
}

fn handle_status(response: Response) -> Result<Response, ArchiveError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let message = response
        .text()
        .unwrap_or_else(|_| "archive request failed".to_string());
    Err(ArchiveError::ApiStatus { status, message })
}

fn is_query_syntax_complaint(body: &str) -> bool {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| {
            value
                .get("message")
                .map(|message| message.to_string().contains("query"))
        })
        .unwrap_or(false)
}

fn non_field_error(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    value
        .get("non_field_errors")?
        .as_array()?
        .first()?
        .as_str()
        .map(|message| message.to_string())
}

fn backoff(attempt: usize) {
    let delay = BASE_DELAY_MS * (attempt as u64 + 1);
    thread::sleep(Duration::from_millis(delay));
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}
