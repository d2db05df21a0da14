use std::fmt;
use std::str::FromStr;

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ShareError;

/// Role of the member who created a project; owners already see their data in SMRT Link.
pub const OWNER_ROLE: &str = "OWNER";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(i64);

impl ProjectId {
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ProjectId {
    type Err = ShareError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let id = value
            .trim()
            .parse::<i64>()
            .map_err(|_| ShareError::InvalidProjectId(value.to_string()))?;
        if id <= 0 {
            return Err(ShareError::InvalidProjectId(value.to_string()));
        }
        Ok(Self(id))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DatasetUuid(String);

impl DatasetUuid {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DatasetUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DatasetUuid {
    type Err = ShareError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let uuid = Uuid::parse_str(value.trim())
            .map_err(|_| ShareError::InvalidDatasetUuid(value.to_string()))?;
        Ok(Self(uuid.hyphenated().to_string()))
    }
}

impl TryFrom<String> for DatasetUuid {
    type Error = ShareError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DatasetUuid> for String {
    fn from(value: DatasetUuid) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemberId(String);

impl MemberId {
    pub fn new(login: impl Into<String>) -> Self {
        Self(login.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(i64);

impl JobId {
    pub fn new(value: i64) -> Self {
        Self(value)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A dataset as listed in a SMRT Link project payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetDescription {
    pub uuid: DatasetUuid,
    pub name: String,
    pub path: Utf8PathBuf,
    #[serde(default)]
    pub num_children: u32,
    #[serde(default)]
    pub parent_uuid: Option<DatasetUuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectMemberEntry {
    pub login: String,
    pub role: String,
}

/// Raw project payload returned by `GET /smrt-link/projects/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectPayload {
    pub id: ProjectId,
    pub name: String,
    #[serde(default)]
    pub datasets: Vec<DatasetDescription>,
    #[serde(default)]
    pub members: Vec<ProjectMemberEntry>,
}

/// Current remote state of a project, owners already filtered out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectSnapshot {
    pub id: ProjectId,
    pub name: String,
    pub datasets: Vec<DatasetDescription>,
    pub members: Vec<MemberId>,
}

impl ProjectSnapshot {
    pub fn dir_name(&self) -> String {
        format!("Project {}: {}", self.id, self.name)
    }
}

impl From<ProjectPayload> for ProjectSnapshot {
    fn from(payload: ProjectPayload) -> Self {
        let mut members = Vec::new();
        for entry in payload.members {
            if entry.role == OWNER_ROLE {
                continue;
            }
            let member = MemberId::new(entry.login);
            if !members.contains(&member) {
                members.push(member);
            }
        }
        Self {
            id: payload.id,
            name: payload.name,
            datasets: payload.datasets,
            members,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Created,
    Submitted,
    Running,
    Successful,
    Failed,
    Terminated,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Pending,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn phase(self) -> JobPhase {
        match self {
            JobState::Created | JobState::Submitted | JobState::Running => JobPhase::Pending,
            JobState::Successful => JobPhase::Succeeded,
            JobState::Failed | JobState::Terminated | JobState::Aborted => JobPhase::Failed,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            JobState::Created => "CREATED",
            JobState::Submitted => "SUBMITTED",
            JobState::Running => "RUNNING",
            JobState::Successful => "SUCCESSFUL",
            JobState::Failed => "FAILED",
            JobState::Terminated => "TERMINATED",
            JobState::Aborted => "ABORTED",
        };
        write!(f, "{label}")
    }
}

/// An analysis job as reported by the job manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
}
