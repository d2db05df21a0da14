use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};

use crate::error::ShareError;

const AUTH_URL: &str = "https://auth.globus.org/v2/oauth2/token";
const TRANSFER_URL: &str = "https://transfer.api.globus.org/v0.10";
const TRANSFER_SCOPE: &str = "urn:globus:auth:scope:transfer.api.globus.org:all";

/// A read grant on one path of a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GrantRequest {
    pub principal: String,
    pub path: String,
    pub permissions: String,
    pub expiry: DateTime<Utc>,
}

impl GrantRequest {
    pub fn read_only(principal: &str, path: String, expiry: DateTime<Utc>) -> Self {
        Self {
            principal: principal.to_string(),
            path,
            permissions: "r".to_string(),
            expiry,
        }
    }
}

pub trait AccessControlClient: Send + Sync {
    /// Creates the grant and returns its id. Fails with `GrantExists` when an
    /// identical rule is already present and with `GrantQuotaExceeded` when
    /// the collection cannot hold more rules.
    fn add_grant(&self, collection_id: &str, request: &GrantRequest) -> Result<String, ShareError>;
    fn delete_grant(&self, collection_id: &str, grant_id: &str) -> Result<(), ShareError>;
}

#[derive(Debug, Serialize)]
struct AccessRule<'a> {
    #[serde(rename = "DATA_TYPE")]
    data_type: &'a str,
    principal_type: &'a str,
    principal: &'a str,
    path: &'a str,
    permissions: &'a str,
    expiration_date: String,
}

#[derive(Debug, Deserialize)]
struct AccessRuleCreated {
    access_id: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct TransferErrorBody {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
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

pub struct GlobusHttpClient {
    client: Client,
    client_id: String,
    client_secret: String,
    token: Mutex<Option<CachedToken>>,
}

impl GlobusHttpClient {
    pub fn new(client_id: &str, client_secret: &str) -> Result<Self, ShareError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("smrtlink-share/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| ShareError::GlobusHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| ShareError::GlobusHttp(err.to_string()))?;
        Ok(Self {
            client,
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            token: Mutex::new(None),
        })
    }

    fn access_token(&self) -> Result<String, ShareError> {
        let mut cached = self
            .token
            .lock()
            .map_err(|_| ShareError::GlobusHttp("token cache lock poisoned".to_string()))?;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.valid_until {
                return Ok(token.value.clone());
            }
        }

        let response = self.send_with_retries(|| {
            self.client
                .post(AUTH_URL)
                .basic_auth(&self.client_id, Some(&self.client_secret))
                .form(&[("grant_type", "client_credentials"), ("scope", TRANSFER_SCOPE)])
        })?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "Globus token request failed".to_string());
            return Err(ShareError::GlobusStatus { status, message });
        }
        let token: TokenResponse = response
            .json()
            .map_err(|err| ShareError::GlobusHttp(err.to_string()))?;
        // Refresh a minute early so a token never expires mid-request.
        let lifetime = Duration::from_secs(token.expires_in.saturating_sub(60));
        *cached = Some(CachedToken {
            value: token.access_token.clone(),
            valid_until: Instant::now() + lifetime,
        });
        Ok(token.access_token)
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
                    return Err(ShareError::GlobusHttp(err.to_string()));
                }
            }
        }
    }
}

impl AccessControlClient for GlobusHttpClient {
    fn add_grant(&self, collection_id: &str, request: &GrantRequest) -> Result<String, ShareError> {
        let token = self.access_token()?;
        let rule = AccessRule {
            data_type: "access",
            principal_type: "identity",
            principal: &request.principal,
            path: &request.path,
            permissions: &request.permissions,
            expiration_date: request.expiry.to_rfc3339_opts(SecondsFormat::Secs, true),
        };
        let url = format!("{TRANSFER_URL}/endpoint/{collection_id}/access");
        let response =
            self.send_with_retries(|| self.client.post(&url).bearer_auth(&token).json(&rule))?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let text = response.text().unwrap_or_default();
            return Err(classify_transfer_error(status, &text));
        }
        let created: AccessRuleCreated = response
            .json()
            .map_err(|err| ShareError::GlobusHttp(err.to_string()))?;
        match created.access_id {
            serde_json::Value::String(id) => Ok(id),
            serde_json::Value::Number(id) => Ok(id.to_string()),
            other => Err(ShareError::GlobusHttp(format!(
                "unexpected access_id in response: {other}"
            ))),
        }
    }

    fn delete_grant(&self, collection_id: &str, grant_id: &str) -> Result<(), ShareError> {
        let token = self.access_token()?;
        let url = format!("{TRANSFER_URL}/endpoint/{collection_id}/access/{grant_id}");
        let response =
            self.send_with_retries(|| self.client.delete(&url).bearer_auth(&token))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().unwrap_or_default();
            return Err(classify_transfer_error(status, &text));
        }
        Ok(())
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

fn classify_transfer_error(status: u16, body: &str) -> ShareError {
    let parsed = serde_json::from_str::<TransferErrorBody>(body).ok();
    let (code, message) = match parsed {
        Some(error) => (error.code, error.message),
        None => (String::new(), body.to_string()),
    };
    if code == "Exists" {
        return ShareError::GrantExists;
    }
    if code.starts_with("LimitExceeded") {
        return ShareError::GrantQuotaExceeded(message);
    }
    ShareError::GlobusStatus { status, message }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn transfer_errors_are_classified() {
        assert_matches!(
            classify_transfer_error(409, r#"{"code": "Exists", "message": "rule exists"}"#),
            ShareError::GrantExists
        );
        assert_matches!(
            classify_transfer_error(
                409,
                r#"{"code": "LimitExceeded.AccessRules", "message": "too many rules"}"#
            ),
            ShareError::GrantQuotaExceeded(message) if message == "too many rules"
        );
        assert_matches!(
            classify_transfer_error(502, "bad gateway"),
            ShareError::GlobusStatus { status: 502, .. }
        );
    }

    #[test]
    fn access_rule_wire_shape() {
        let rule = AccessRule {
            data_type: "access",
            principal_type: "identity",
            principal: "bob",
            path: "/Movie m1 - s1/",
            permissions: "r",
            expiration_date: "2024-06-01T00:00:00Z".to_string(),
        };
        let value = serde_json::to_value(&rule).unwrap();
        assert_eq!(value["DATA_TYPE"], "access");
        assert_eq!(value["path"], "/Movie m1 - s1/");
        assert_eq!(value["expiration_date"], "2024-06-01T00:00:00Z");
    }

    #[test]
    fn gateway_and_throttling_statuses_are_retried() {
        assert!(is_retryable_status(502));
        assert!(is_retryable_status(429));
        assert!(!is_retryable_status(409));
        assert!(!is_retryable_status(404));
    }
}
