use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::domain::ProjectId;
use crate::engine::{DEFAULT_RETENTION_DAYS, EngineSettings, GENERAL_PROJECT};
use crate::error::ShareError;
use crate::jobs::{DEFAULT_POLL_CEILING, DEFAULT_POLL_INTERVAL, PollSettings};
use crate::notify::DEFAULT_NOTIFICATION_DELAY;

pub const CONFIG_FILE_NAME: &str = "smrtlink-share.json";
pub const SMRTLINK_PASSWORD_ENV: &str = "SMRTLINK_PASSWORD";
pub const GLOBUS_CLIENT_SECRET_ENV: &str = "GLOBUS_CLIENT_SECRET";

#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    pub staging_root: Utf8PathBuf,
    #[serde(default)]
    pub database_path: Option<Utf8PathBuf>,
    #[serde(default)]
    pub service_uid: Option<u32>,
    pub smrtlink: SmrtLinkSection,
    pub globus: GlobusSection,
    #[serde(default)]
    pub permission_retention_days: Option<i64>,
    #[serde(default)]
    pub notification_delay_ms: Option<u64>,
    #[serde(default)]
    pub poll_interval_secs: Option<u64>,
    #[serde(default)]
    pub poll_ceiling_secs: Option<u64>,
    #[serde(default)]
    pub excluded_projects: Option<Vec<ProjectId>>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SmrtLinkSection {
    pub base_url: String,
    pub username: String,
    #[serde(default)]
    pub verify_tls: Option<bool>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct GlobusSection {
    pub collection_id: String,
    pub client_id: String,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub staging_root: Utf8PathBuf,
    pub database_path: Utf8PathBuf,
    /// `None` means the owner of `staging_root`.
    pub service_uid: Option<u32>,
    pub smrtlink_url: String,
    pub smrtlink_username: String,
    pub smrtlink_verify_tls: bool,
    pub globus_collection_id: String,
    pub globus_client_id: String,
    pub retention: chrono::Duration,
    pub notification_delay: Duration,
    pub poll: PollSettings,
    pub excluded_projects: Vec<ProjectId>,
}

impl ResolvedConfig {
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            collection_id: self.globus_collection_id.clone(),
            retention: self.retention,
            poll: self.poll,
            excluded_projects: self.excluded_projects.clone(),
        }
    }
}

/// Credentials that never live in the config file.
#[derive(Clone)]
pub struct Secrets {
    pub smrtlink_password: String,
    pub globus_client_secret: String,
}

impl Secrets {
    pub fn from_env() -> Result<Self, ShareError> {
        Ok(Self {
            smrtlink_password: required_env(SMRTLINK_PASSWORD_ENV)?,
            globus_client_secret: required_env(GLOBUS_CLIENT_SECRET_ENV)?,
        })
    }
}

fn required_env(name: &str) -> Result<String, ShareError> {
    std::env::var(name).map_err(|_| ShareError::MissingEnv(name.to_string()))
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, ShareError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(CONFIG_FILE_NAME),
        };

        if path.is_none() && !config_path.exists() {
            return Err(ShareError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| ShareError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| ShareError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, ShareError> {
        let database_path = match config.database_path {
            Some(path) => path,
            None => default_database_path()?,
        };

        let retention_days = config
            .permission_retention_days
            .unwrap_or(DEFAULT_RETENTION_DAYS);
        if retention_days <= 0 {
            return Err(ShareError::ConfigParse(format!(
                "permission_retention_days must be positive, got {retention_days}"
            )));
        }

        let interval = config
            .poll_interval_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_POLL_INTERVAL);
        let ceiling = config
            .poll_ceiling_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_POLL_CEILING);
        if interval.is_zero() || ceiling < interval {
            return Err(ShareError::ConfigParse(
                "poll_interval_secs must be positive and not exceed poll_ceiling_secs".to_string(),
            ));
        }

        Ok(ResolvedConfig {
            staging_root: config.staging_root,
            database_path,
            service_uid: config.service_uid,
            smrtlink_url: config.smrtlink.base_url,
            smrtlink_username: config.smrtlink.username,
            smrtlink_verify_tls: config.smrtlink.verify_tls.unwrap_or(false),
            globus_collection_id: config.globus.collection_id,
            globus_client_id: config.globus.client_id,
            retention: chrono::Duration::days(retention_days),
            notification_delay: config
                .notification_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_NOTIFICATION_DELAY),
            poll: PollSettings { interval, ceiling },
            excluded_projects: config
                .excluded_projects
                .unwrap_or_else(|| vec![GENERAL_PROJECT]),
        })
    }
}

pub fn default_database_path() -> Result<Utf8PathBuf, ShareError> {
    BaseDirs::new()
        .and_then(|dirs| {
            Utf8PathBuf::from_path_buf(dirs.data_dir().join("smrtlink-share").join("state.db")).ok()
        })
        .ok_or_else(|| ShareError::Filesystem("unable to resolve data directory".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> Config {
        serde_json::from_str(
            r#"{
                "staging_root": "/srv/staging",
                "database_path": "/var/lib/smrtlink-share/state.db",
                "smrtlink": {"base_url": "https://smrtlink.local:8243", "username": "svc"},
                "globus": {"collection_id": "c0ffee", "client_id": "client"}
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn defaults_fill_optional_fields() {
        let resolved = ConfigLoader::resolve_config(minimal()).unwrap();
        assert_eq!(resolved.retention, chrono::Duration::days(30));
        assert_eq!(resolved.notification_delay, Duration::from_millis(1000));
        assert_eq!(resolved.poll.interval, Duration::from_secs(30));
        assert_eq!(resolved.poll.ceiling, Duration::from_secs(86_400));
        assert_eq!(resolved.excluded_projects, vec![ProjectId::new(1)]);
        assert_eq!(resolved.service_uid, None);
        assert!(!resolved.smrtlink_verify_tls);
    }

    #[test]
    fn rejects_non_positive_retention() {
        let mut config = minimal();
        config.permission_retention_days = Some(0);
        assert!(ConfigLoader::resolve_config(config).is_err());
    }
}
