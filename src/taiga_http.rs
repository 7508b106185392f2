use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::thread;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Deserializer};
use tracing::{debug, info};

use crate::config::ApiConfig;
use crate::coordinator::Cancellation;
use crate::domain::{CanonicalKey, DataType, VersionSpec, VersionState};
use crate::error::TaigaError;
use crate::reference::StructuredReference;
use crate::remote::{
    ByteFetcher, DatafileMetadata, DatasetVersionMetadata, DownloadInfo, MetadataResolver,
    latest_version,
};

const BASE_DELAY_MS: u64 = 200;
const TASK_POLL_INTERVAL: Duration = Duration::from_secs(1);
const CHUNK_SIZE: usize = 1024 * 1024;

/// Taiga REST client. Signed download URLs are fetched without credentials.
#[derive(Clone)]
pub struct TaigaHttpClient {
    client: Client,
    download_client: Client,
    base_url: String,
    max_retries: usize,
}

impl TaigaHttpClient {
    pub fn new(config: &ApiConfig) -> Result<Self, TaigaError> {
        let user_agent = HeaderValue::from_str(&format!("taiga-cache/{}", env!("CARGO_PKG_VERSION")))
            .map_err(|err| TaigaError::Connectivity(err.to_string()))?;

        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, user_agent.clone());
        if let Some(token) = &config.token {
            let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| TaigaError::ConfigParse("token is not a valid header".to_string()))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|err| TaigaError::Connectivity(err.to_string()))?;

        let mut download_headers = HeaderMap::new();
        download_headers.insert(USER_AGENT, user_agent);
        let download_client = Client::builder()
            .default_headers(download_headers)
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|err| TaigaError::Connectivity(err.to_string()))?;

        Ok(Self {
            client,
            download_client,
            base_url: config.url.trim_end_matches('/').to_string(),
            max_retries: config.max_retries,
        })
    }

    fn api_url(&self, endpoint: &str) -> String {
        format!("{}/api/{}", self.base_url, endpoint)
    }

    fn handle_status(response: Response, context: &str) -> Result<Response, TaigaError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::NOT_FOUND {
            return Err(TaigaError::NotFound(context.to_string()));
        }
        let message = response
            .text()
            .ok()
            .filter(|text| !text.trim().is_empty())
            .unwrap_or_else(|| format!("request for {context} failed"));
        Err(TaigaError::HttpStatus {
            status: status.as_u16(),
            message,
        })
    }

    fn send_with_retries<F>(&self, mut make_req: F) -> Result<Response, TaigaError>
    where
        F: FnMut() -> RequestBuilder,
    {
        let mut attempt = 0usize;
        loop {
            let response = make_req().send();
            match response {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < self.max_retries && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        debug!(status, attempt, "retrying Taiga request");
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < self.max_retries && is_retryable_error(&err) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        debug!(error = %err, attempt, "retrying Taiga request");
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(TaigaError::Connectivity(err.to_string()));
                }
            }
        }
    }

    fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        url: &str,
        query: &[(&str, String)],
        context: &str,
    ) -> Result<T, TaigaError> {
        let response = self.send_with_retries(|| self.client.get(url).query(query))?;
        let response = Self::handle_status(response, context)?;
        response
            .json()
            .map_err(|err| TaigaError::UnexpectedResponse(err.to_string()))
    }

    fn dataset_summary(&self, permaname: &str) -> Result<DatasetPayload, TaigaError> {
        self.get_json(&self.api_url(&format!("dataset/{permaname}")), &[], permaname)
    }

    fn poll_task(&self, task_id: &str, cancel: &Cancellation) -> Result<(), TaigaError> {
        let url = self.api_url(&format!("task_status/{task_id}"));
        loop {
            cancel.check(format!("task {task_id}"))?;
            let status: TaskStatusPayload = self.get_json(&url, &[], task_id)?;
            match status.state.as_str() {
                "SUCCESS" => return Ok(()),
                "FAILURE" | "REVOKED" => {
                    return Err(TaigaError::TaskFailed {
                        task: task_id.to_string(),
                        message: status.message.unwrap_or_else(|| status.state.clone()),
                    });
                }
                state => {
                    debug!(task = task_id, state, "waiting for conversion task");
                    thread::sleep(TASK_POLL_INTERVAL);
                }
            }
        }
    }

    fn stream_to(
        &self,
        url: &str,
        destination: &Path,
        cancel: &Cancellation,
        label: &str,
    ) -> Result<u64, TaigaError> {
        let response = self.send_with_retries(|| self.download_client.get(url))?;
        let mut response = Self::handle_status(response, label)?;
        let mut file =
            File::create(destination).map_err(|err| TaigaError::Filesystem(err.to_string()))?;
        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut total = 0u64;
        loop {
            cancel.check(label)?;
            let read = response
                .read(&mut buffer)
                .map_err(|err| TaigaError::Connectivity(err.to_string()))?;
            if read == 0 {
                break;
            }
            file.write_all(&buffer[..read])
                .map_err(|err| TaigaError::Filesystem(err.to_string()))?;
            total += read as u64;
        }
        file.sync_all()
            .map_err(|err| TaigaError::Filesystem(err.to_string()))?;
        Ok(total)
    }
}

impl MetadataResolver for TaigaHttpClient {
    fn resolve(&self, reference: &StructuredReference) -> Result<DatafileMetadata, TaigaError> {
        let mut query: Vec<(&str, String)> = vec![("format", "metadata".to_string())];
        match (&reference.opaque_id, &reference.dataset_name) {
            (Some(id), _) => query.push(("dataset_version_id", id.clone())),
            (None, Some(name)) => {
                query.push(("dataset_permaname", name.clone()));
                if let Some(VersionSpec::Number(version)) = reference.dataset_version {
                    query.push(("version", version.to_string()));
                }
            }
            (None, None) => {
                return Err(TaigaError::InvalidReference(reference.to_string()));
            }
        }
        if let Some(file) = &reference.file_name {
            query.push(("datafile_name", file.clone()));
        }

        let payload: DatafilePayload =
            self.get_json(&self.api_url("datafile"), &query, &reference.to_string())?;
        payload.into_metadata()
    }

    fn dataset_version(
        &self,
        permaname: &str,
        version: VersionSpec,
    ) -> Result<DatasetVersionMetadata, TaigaError> {
        let number = match version {
            VersionSpec::Number(number) => number,
            VersionSpec::Latest => {
                let summary = self.dataset_summary(permaname)?;
                latest_version(summary.version_states()?).ok_or_else(|| {
                    TaigaError::NotFound(format!("{permaname} has no available version"))
                })?
            }
        };
        let context = format!("{permaname}.{number}");
        let payload: DatasetVersionPayload = self.get_json(
            &self.api_url(&format!("dataset/{permaname}/{number}")),
            &[],
            &context,
        )?;
        payload.into_metadata(permaname)
    }
}

impl ByteFetcher for TaigaHttpClient {
    fn download(
        &self,
        key: &CanonicalKey,
        data_type: DataType,
        destination: &Path,
        cancel: &Cancellation,
    ) -> Result<DownloadInfo, TaigaError> {
        let (format, server_converted) = match data_type {
            DataType::NumericMatrix | DataType::HeterogeneousTable => ("csv", true),
            DataType::Raw => ("raw_test", false),
        };
        let query = [
            ("dataset_permaname", key.permaname().to_string()),
            ("version", key.version().to_string()),
            ("datafile_name", key.file_name().to_string()),
            ("format", format.to_string()),
        ];
        let url = self.api_url("datafile");
        let label = key.to_string();

        loop {
            cancel.check(&label)?;
            let response = self.send_with_retries(|| self.client.get(&url).query(&query))?;
            if response.status() == StatusCode::ACCEPTED {
                let task_id: String = response
                    .json()
                    .map_err(|err| TaigaError::UnexpectedResponse(err.to_string()))?;
                info!(key = %key, task = %task_id, "waiting for Taiga to convert datafile");
                self.poll_task(&task_id, cancel)?;
                continue;
            }
            let response = Self::handle_status(response, &label)?;
            let payload: DownloadPayload = response
                .json()
                .map_err(|err| TaigaError::UnexpectedResponse(err.to_string()))?;
            let signed_url = payload.urls.and_then(|urls| urls.into_iter().next()).ok_or_else(
                || TaigaError::UnexpectedResponse(format!("no download url for {key}")),
            )?;
            let bytes = self.stream_to(&signed_url, destination, cancel, &label)?;
            debug!(key = %key, bytes, "downloaded datafile");
            return Ok(DownloadInfo {
                declared_sha256: payload.sha256,
                server_converted,
                bytes,
            });
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DatafilePayload {
    pub dataset_permaname: String,
    #[serde(deserialize_with = "version_number")]
    pub dataset_version: u32,
    pub datafile_name: String,
    pub state: String,
    pub reason_state: Option<String>,
    pub datafile_format: String,
    pub underlying_file_id: Option<String>,
    pub original_file_sha256: Option<String>,
}

impl DatafilePayload {
    pub fn into_metadata(self) -> Result<DatafileMetadata, TaigaError> {
        Ok(DatafileMetadata {
            key: CanonicalKey::new(
                self.dataset_permaname,
                self.dataset_version,
                self.datafile_name,
            )?,
            data_type: DataType::from_taiga_format(&self.datafile_format)?,
            state: self.state.parse()?,
            reason_state: self.reason_state,
            original_sha256: self.original_file_sha256,
            underlying: parse_underlying(self.underlying_file_id)?,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct DatasetVersionPayload {
    pub dataset: DatasetPayload,
    #[serde(rename = "datasetVersion")]
    pub dataset_version: VersionPayload,
}

impl DatasetVersionPayload {
    pub fn into_metadata(self, requested: &str) -> Result<DatasetVersionMetadata, TaigaError> {
        let permaname = if self.dataset.permanames.iter().any(|name| name == requested) {
            requested.to_string()
        } else {
            self.dataset.permanames.last().cloned().ok_or_else(|| {
                TaigaError::UnexpectedResponse(format!("{requested} has no permaname"))
            })?
        };
        let version = self.dataset_version.name;
        let state: VersionState = self.dataset_version.state.parse()?;
        let reason_state = self.dataset_version.reason_state;

        let files = self
            .dataset_version
            .datafiles
            .into_iter()
            .map(|file| {
                Ok(DatafileMetadata {
                    key: CanonicalKey::new(permaname.as_str(), version, file.name)?,
                    data_type: DataType::from_taiga_format(&file.format)?,
                    state,
                    reason_state: reason_state.clone(),
                    original_sha256: file.original_file_sha256,
                    underlying: parse_underlying(file.underlying_file_id)?,
                })
            })
            .collect::<Result<Vec<_>, TaigaError>>()?;

        Ok(DatasetVersionMetadata {
            permaname,
            version,
            state,
            reason_state,
            files,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct DatasetPayload {
    #[serde(default)]
    pub permanames: Vec<String>,
    #[serde(default)]
    pub versions: Vec<VersionSummaryPayload>,
}

impl DatasetPayload {
    fn version_states(&self) -> Result<Vec<(u32, VersionState)>, TaigaError> {
        self.versions
            .iter()
            .map(|version| Ok((version.name, version.state.parse()?)))
            .collect()
    }
}

#[derive(Debug, Deserialize)]
pub struct VersionSummaryPayload {
    #[serde(deserialize_with = "version_number")]
    pub name: u32,
    pub state: String,
}

#[derive(Debug, Deserialize)]
pub struct VersionPayload {
    #[serde(deserialize_with = "version_number")]
    pub name: u32,
    pub state: String,
    pub reason_state: Option<String>,
    #[serde(default)]
    pub datafiles: Vec<FilePayload>,
}

#[derive(Debug, Deserialize)]
pub struct FilePayload {
    pub name: String,
    #[serde(rename = "type")]
    pub format: String,
    pub underlying_file_id: Option<String>,
    pub original_file_sha256: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DownloadPayload {
    urls: Option<Vec<String>>,
    sha256: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TaskStatusPayload {
    state: String,
    message: Option<String>,
}

fn parse_underlying(value: Option<String>) -> Result<Option<CanonicalKey>, TaigaError> {
    value
        .filter(|id| !id.is_empty())
        .map(|id| {
            id.parse::<CanonicalKey>().map_err(|_| {
                TaigaError::UnexpectedResponse(format!("malformed underlying_file_id: {id}"))
            })
        })
        .transpose()
}

/// Taiga reports version numbers as strings in some payloads.
fn version_number<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u32),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(number) => Ok(number),
        Raw::Text(text) => text.trim().parse().map_err(serde::de::Error::custom),
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_numbers_accept_strings() {
        let summary: VersionSummaryPayload =
            serde_json::from_str(r#"{"name": "4", "state": "approved"}"#).unwrap();
        assert_eq!(summary.name, 4);
        let summary: VersionSummaryPayload =
            serde_json::from_str(r#"{"name": 5, "state": "deleted"}"#).unwrap();
        assert_eq!(summary.name, 5);
    }

    #[test]
    fn virtual_datafile_payload() {
        let payload: DatafilePayload = serde_json::from_str(
            r#"{
                "dataset_permaname": "ds-abc123",
                "dataset_version": "4",
                "datafile_name": "table1",
                "state": "Approved",
                "datafile_format": "Columnar",
                "datafile_type": "virtual",
                "underlying_file_id": "ds-orig-x1.2/data"
            }"#,
        )
        .unwrap();
        let metadata = payload.into_metadata().unwrap();
        assert!(metadata.is_virtual());
        assert_eq!(metadata.real_key().to_string(), "ds-orig-x1.2/data");
        assert_eq!(metadata.data_type, DataType::HeterogeneousTable);
    }
}
