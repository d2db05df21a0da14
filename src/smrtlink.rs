use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::domain::{DatasetUuid, Job, JobId, ProjectId, ProjectPayload};
use crate::error::ShareError;

const API_PREFIX: &str = "/SMRTLink/1.0.0";

pub trait SmrtLinkClient: Send + Sync {
    /// `None` when the project does not exist (anymore).
    fn get_project(&self, id: ProjectId) -> Result<Option<ProjectPayload>, ShareError>;
    fn get_project_ids(&self) -> Result<Vec<ProjectId>, ShareError>;
    fn get_jobs_created_after(&self, watermark: DateTime<Utc>) -> Result<Vec<Job>, ShareError>;
    /// `None` when the job has been deleted.
    fn get_job(&self, id: JobId) -> Result<Option<Job>, ShareError>;
    fn get_job_datasets(&self, id: JobId) -> Result<Vec<DatasetUuid>, ShareError>;
    /// Analysis jobs that used `uuid` as an input, regardless of when they ran.
    fn get_dataset_jobs(&self, uuid: &DatasetUuid) -> Result<Vec<Job>, ShareError>;
    fn get_job_files(&self, id: JobId) -> Result<Vec<Utf8PathBuf>, ShareError>;
}

#[derive(Debug, Deserialize)]
struct ProjectSummary {
    id: ProjectId,
}

#[derive(Debug, Deserialize)]
struct EntryPoint {
    #[serde(rename = "datasetUUID")]
    dataset_uuid: DatasetUuid,
}

#[derive(Debug, Deserialize)]
struct DataStoreFile {
    path: Utf8PathBuf,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_token_lifetime")]
    expires_in: u64,
}

fn default_token_lifetime() -> u64 {
    3600
}

struct CachedToken {
    value: String,
    valid_until: Instant,
}

pub struct SmrtLinkHttpClient {
    client: Client,
    base_url: String,
    username: String,
    password: String,
    token: Mutex<Option<CachedToken>>,
}

impl SmrtLinkHttpClient {
    pub fn new(
        base_url: &str,
        username: &str,
        password: &str,
        verify_tls: bool,
    ) -> Result<Self, ShareError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("smrtlink-share/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| ShareError::SmrtLinkHttp(err.to_string()))?,
        );
        // SMRT Link installs commonly run with a self-signed certificate.
        let client = Client::builder()
            .default_headers(headers)
            .danger_accept_invalid_certs(!verify_tls)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|err| ShareError::SmrtLinkHttp(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            username: username.to_string(),
            password: password.to_string(),
            token: Mutex::new(None),
        })
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}{API_PREFIX}{path}", self.base_url)
    }

    fn access_token(&self) -> Result<String, ShareError> {
        let mut cached = self
            .token
            .lock()
            .map_err(|_| ShareError::SmrtLinkHttp("token cache lock poisoned".to_string()))?;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.valid_until {
                return Ok(token.value.clone());
            }
        }
        let url = format!("{}/token", self.base_url);
        let response = self.send_with_retries(|| {
            self.client.post(&url).form(&[
                ("grant_type", "password"),
                ("username", self.username.as_str()),
                ("password", self.password.as_str()),
                ("scope", "welcome"),
            ])
        })?;
        let token: TokenResponse = Self::handle_status(response)?
            .json()
            .map_err(|err| ShareError::SmrtLinkHttp(err.to_string()))?;
        let lifetime = Duration::from_secs(token.expires_in.saturating_sub(60));
        *cached = Some(CachedToken {
            value: token.access_token.clone(),
            valid_until: Instant::now() + lifetime,
        });
        Ok(token.access_token)
    }

    fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Option<T>, ShareError> {
        let token = self.access_token()?;
        let url = self.api_url(path);
        let response = self.send_with_retries(|| {
            self.client.get(&url).bearer_auth(&token).query(query)
        })?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let value = Self::handle_status(response)?
            .json()
            .map_err(|err| ShareError::SmrtLinkHttp(err.to_string()))?;
        Ok(Some(value))
    }

    fn handle_status(response: Response) -> Result<Response, ShareError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "SMRT Link request failed".to_string());
        Err(ShareError::SmrtLinkStatus { status, message })
    }

    fn send_with_retries<F>(&self, mut make_req: F) -> Result<Response, ShareError>
    where
        F: FnMut() -> RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            match make_req().send() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(ShareError::SmrtLinkHttp(err.to_string()));
                }
            }
        }
    }
}

impl SmrtLinkClient for SmrtLinkHttpClient {
    fn get_project(&self, id: ProjectId) -> Result<Option<ProjectPayload>, ShareError> {
        self.get_json(&format!("/smrt-link/projects/{id}"), &[])
    }

    fn get_project_ids(&self) -> Result<Vec<ProjectId>, ShareError> {
        let projects: Vec<ProjectSummary> = self
            .get_json("/smrt-link/projects", &[])?
            .unwrap_or_default();
        Ok(projects.into_iter().map(|project| project.id).collect())
    }

    fn get_jobs_created_after(&self, watermark: DateTime<Utc>) -> Result<Vec<Job>, ShareError> {
        let filter = format!(
            "gt:{}",
            watermark.to_rfc3339_opts(SecondsFormat::Millis, true)
        );
        Ok(self
            .get_json("/smrt-link/job-manager/jobs/analysis", &[("createdAt", filter)])?
            .unwrap_or_default())
    }

    fn get_job(&self, id: JobId) -> Result<Option<Job>, ShareError> {
        self.get_json(&format!("/smrt-link/job-manager/jobs/analysis/{id}"), &[])
    }

    fn get_job_datasets(&self, id: JobId) -> Result<Vec<DatasetUuid>, ShareError> {
        let entry_points: Vec<EntryPoint> = self
            .get_json(
                &format!("/smrt-link/job-manager/jobs/analysis/{id}/entry-points"),
                &[],
            )?
            .unwrap_or_default();
        Ok(entry_points
            .into_iter()
            .map(|entry| entry.dataset_uuid)
            .collect())
    }

    fn get_dataset_jobs(&self, uuid: &DatasetUuid) -> Result<Vec<Job>, ShareError> {
        Ok(self
            .get_json(&format!("/smrt-link/datasets/{uuid}/jobs"), &[])?
            .unwrap_or_default())
    }

    fn get_job_files(&self, id: JobId) -> Result<Vec<Utf8PathBuf>, ShareError> {
        let files: Vec<DataStoreFile> = self
            .get_json(
                &format!("/smrt-link/job-manager/jobs/analysis/{id}/datastore"),
                &[],
            )?
            .unwrap_or_default();
        Ok(files.into_iter().map(|file| file.path).collect())
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
    fn api_urls_include_prefix() {
        let client =
            SmrtLinkHttpClient::new("https://smrtlink.local:8243/", "admin", "secret", false)
                .unwrap();
        assert_eq!(
            client.api_url("/smrt-link/projects/4"),
            "https://smrtlink.local:8243/SMRTLink/1.0.0/smrt-link/projects/4"
        );
    }

    #[test]
    fn entry_points_deserialize() {
        let entries: Vec<EntryPoint> = serde_json::from_str(
            r#"[{"jobId": 3, "datasetUUID": "aaaaaaaa-0000-0000-0000-000000000001", "datasetType": "PacBio.DataSet.ConsensusReadSet"}]"#,
        )
        .unwrap();
        assert_eq!(
            entries[0].dataset_uuid.as_str(),
            "aaaaaaaa-0000-0000-0000-000000000001"
        );
    }
}
