use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum ShareError {
    #[error("invalid project id: {0}")]
    InvalidProjectId(String),

    #[error("invalid dataset uuid: {0}")]
    InvalidDatasetUuid(String),

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("missing config file smrtlink-share.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("missing environment variable {0}")]
    MissingEnv(String),

    #[error("SMRT Link request failed: {0}")]
    SmrtLinkHttp(String),

    #[error("SMRT Link returned status {status}: {message}")]
    SmrtLinkStatus { status: u16, message: String },

    #[error("SMRT Link has no shareable projects")]
    NoProjects,

    #[error("project {0} not found in SMRT Link")]
    ProjectNotFound(i64),

    #[error("Globus request failed: {0}")]
    GlobusHttp(String),

    #[error("Globus returned status {status}: {message}")]
    GlobusStatus { status: u16, message: String },

    #[error("Globus access rule already exists")]
    GrantExists,

    #[error("Globus access rule limit reached: {0}")]
    #[diagnostic(help("remove stale access rules on the collection or raise its rule limit"))]
    GrantQuotaExceeded(String),

    #[error("failed to read dataset document {path}: {message}")]
    Document { path: String, message: String },

    #[error("state database error: {0}")]
    Database(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("unsupported notification: {0}")]
    UnknownNotification(String),
}

impl From<rusqlite::Error> for ShareError {
    fn from(err: rusqlite::Error) -> Self {
        ShareError::Database(err.to_string())
    }
}
