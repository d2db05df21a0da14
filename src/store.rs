use std::fs;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;

use crate::domain::{DatasetUuid, MemberId, ProjectId};
use crate::error::ShareError;

/// Watermark used before any analysis job has been seen.
pub const INITIAL_JOB_WATERMARK: &str = "2000-01-01T00:00:00Z";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS dataset (
    uuid TEXT PRIMARY KEY,
    project_id INTEGER NOT NULL,
    dir_path TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS dataset_project ON dataset (project_id);
CREATE TABLE IF NOT EXISTS project_member (
    project_id INTEGER NOT NULL,
    member_id TEXT NOT NULL,
    PRIMARY KEY (project_id, member_id)
);
CREATE TABLE IF NOT EXISTS permission (
    grant_id TEXT PRIMARY KEY,
    member_id TEXT NOT NULL,
    dataset_id TEXT NOT NULL,
    expiry TEXT NOT NULL,
    UNIQUE (member_id, dataset_id)
);
CREATE TABLE IF NOT EXISTS last_job_update (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    timestamp TEXT NOT NULL
);
";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatasetRecord {
    pub uuid: DatasetUuid,
    pub project_id: ProjectId,
    pub dir_path: Utf8PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberRecord {
    pub project_id: ProjectId,
    pub member_id: MemberId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PermissionRecord {
    pub grant_id: String,
    pub member_id: MemberId,
    pub dataset_id: DatasetUuid,
    pub expiry: DateTime<Utc>,
}

/// Durable record of what has been staged and shared.
///
/// All writes are single statements keyed on the table's primary or unique
/// key, so concurrent reconciliations of the same project converge instead of
/// failing.
pub struct StateStore {
    conn: Mutex<Connection>,
}

impl StateStore {
    pub fn open(path: &Utf8Path) -> Result<Self, ShareError> {
        if let Some(parent) = path.parent() {
            if !parent.as_str().is_empty() {
                fs::create_dir_all(parent.as_std_path())
                    .map_err(|err| ShareError::Filesystem(err.to_string()))?;
            }
        }
        let conn = Connection::open(path.as_std_path())?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update_and_check(None, "journal_mode", "wal", |row| {
            row.get::<_, String>(0)
        })?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, ShareError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, ShareError> {
        conn.execute_batch(SCHEMA)?;
        conn.execute(
            "INSERT OR IGNORE INTO last_job_update (id, timestamp) VALUES (1, ?1)",
            params![INITIAL_JOB_WATERMARK],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, ShareError> {
        self.conn
            .lock()
            .map_err(|_| ShareError::Database("state store lock poisoned".to_string()))
    }

    pub fn dataset(&self, uuid: &DatasetUuid) -> Result<Option<DatasetRecord>, ShareError> {
        let conn = self.conn()?;
        let raw = conn
            .query_row(
                "SELECT uuid, project_id, dir_path FROM dataset WHERE uuid = ?1",
                params![uuid.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        raw.map(dataset_record).transpose()
    }

    pub fn datasets_in_project(
        &self,
        project_id: ProjectId,
    ) -> Result<Vec<DatasetRecord>, ShareError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT uuid, project_id, dir_path FROM dataset WHERE project_id = ?1 ORDER BY uuid",
        )?;
        let rows = stmt
            .query_map(params![project_id.get()], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(dataset_record).collect()
    }

    /// Datasets recorded under `project_id` that are not in `current`.
    pub fn removed_datasets(
        &self,
        project_id: ProjectId,
        current: &[DatasetUuid],
    ) -> Result<Vec<DatasetRecord>, ShareError> {
        Ok(self
            .datasets_in_project(project_id)?
            .into_iter()
            .filter(|record| !current.contains(&record.uuid))
            .collect())
    }

    pub fn insert_dataset(&self, record: &DatasetRecord) -> Result<(), ShareError> {
        self.conn()?.execute(
            "INSERT INTO dataset (uuid, project_id, dir_path) VALUES (?1, ?2, ?3)
             ON CONFLICT (uuid) DO UPDATE SET project_id = excluded.project_id,
                                              dir_path = excluded.dir_path",
            params![
                record.uuid.as_str(),
                record.project_id.get(),
                record.dir_path.as_str()
            ],
        )?;
        Ok(())
    }

    pub fn reassign_dataset(
        &self,
        uuid: &DatasetUuid,
        project_id: ProjectId,
    ) -> Result<(), ShareError> {
        self.conn()?.execute(
            "UPDATE dataset SET project_id = ?1 WHERE uuid = ?2",
            params![project_id.get(), uuid.as_str()],
        )?;
        Ok(())
    }

    pub fn delete_dataset(&self, uuid: &DatasetUuid) -> Result<(), ShareError> {
        self.conn()?.execute(
            "DELETE FROM dataset WHERE uuid = ?1",
            params![uuid.as_str()],
        )?;
        Ok(())
    }

    pub fn members(&self, project_id: ProjectId) -> Result<Vec<MemberRecord>, ShareError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT member_id FROM project_member WHERE project_id = ?1 ORDER BY member_id",
        )?;
        let rows = stmt
            .query_map(params![project_id.get()], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .map(|member_id| MemberRecord {
                project_id,
                member_id: MemberId::new(member_id),
            })
            .collect())
    }

    pub fn member_exists(
        &self,
        project_id: ProjectId,
        member_id: &MemberId,
    ) -> Result<bool, ShareError> {
        let found = self
            .conn()?
            .query_row(
                "SELECT 1 FROM project_member WHERE project_id = ?1 AND member_id = ?2",
                params![project_id.get(), member_id.as_str()],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Members recorded under `project_id` that are not in `current`.
    pub fn removed_members(
        &self,
        project_id: ProjectId,
        current: &[MemberId],
    ) -> Result<Vec<MemberRecord>, ShareError> {
        Ok(self
            .members(project_id)?
            .into_iter()
            .filter(|record| !current.contains(&record.member_id))
            .collect())
    }

    /// Returns `false` when the member was already recorded.
    pub fn add_member(&self, project_id: ProjectId, member_id: &MemberId) -> Result<bool, ShareError> {
        let changed = self.conn()?.execute(
            "INSERT OR IGNORE INTO project_member (project_id, member_id) VALUES (?1, ?2)",
            params![project_id.get(), member_id.as_str()],
        )?;
        Ok(changed > 0)
    }

    pub fn delete_member(&self, project_id: ProjectId, member_id: &MemberId) -> Result<(), ShareError> {
        self.conn()?.execute(
            "DELETE FROM project_member WHERE project_id = ?1 AND member_id = ?2",
            params![project_id.get(), member_id.as_str()],
        )?;
        Ok(())
    }

    pub fn delete_members(&self, project_id: ProjectId) -> Result<usize, ShareError> {
        let changed = self.conn()?.execute(
            "DELETE FROM project_member WHERE project_id = ?1",
            params![project_id.get()],
        )?;
        Ok(changed)
    }

    pub fn permission(
        &self,
        member_id: &MemberId,
        dataset_id: &DatasetUuid,
    ) -> Result<Option<PermissionRecord>, ShareError> {
        let conn = self.conn()?;
        let raw = conn
            .query_row(
                "SELECT grant_id, member_id, dataset_id, expiry FROM permission
                 WHERE member_id = ?1 AND dataset_id = ?2",
                params![member_id.as_str(), dataset_id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;
        raw.map(permission_record).transpose()
    }

    pub fn permissions_for_dataset(
        &self,
        dataset_id: &DatasetUuid,
    ) -> Result<Vec<PermissionRecord>, ShareError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT grant_id, member_id, dataset_id, expiry FROM permission
             WHERE dataset_id = ?1 ORDER BY member_id",
        )?;
        let rows = stmt
            .query_map(params![dataset_id.as_str()], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(permission_record).collect()
    }

    /// Returns `false` when a grant for the same member and dataset is already recorded.
    pub fn insert_permission(&self, record: &PermissionRecord) -> Result<bool, ShareError> {
        let changed = self.conn()?.execute(
            "INSERT OR IGNORE INTO permission (grant_id, member_id, dataset_id, expiry)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                record.grant_id,
                record.member_id.as_str(),
                record.dataset_id.as_str(),
                format_timestamp(&record.expiry)
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn delete_permission(&self, grant_id: &str) -> Result<(), ShareError> {
        self.conn()?.execute(
            "DELETE FROM permission WHERE grant_id = ?1",
            params![grant_id],
        )?;
        Ok(())
    }

    pub fn delete_expired_permissions(&self, now: DateTime<Utc>) -> Result<usize, ShareError> {
        let changed = self.conn()?.execute(
            "DELETE FROM permission WHERE expiry < ?1",
            params![format_timestamp(&now)],
        )?;
        Ok(changed)
    }

    pub fn last_job_update(&self) -> Result<DateTime<Utc>, ShareError> {
        let raw: String = self.conn()?.query_row(
            "SELECT timestamp FROM last_job_update WHERE id = 1",
            [],
            |row| row.get(0),
        )?;
        parse_timestamp(&raw)
    }

    /// Moves the watermark forward; an older `timestamp` leaves it unchanged.
    pub fn advance_last_job_update(&self, timestamp: DateTime<Utc>) -> Result<(), ShareError> {
        let current = self.last_job_update()?;
        if timestamp <= current {
            return Ok(());
        }
        self.conn()?.execute(
            "UPDATE last_job_update SET timestamp = ?1 WHERE id = 1",
            params![format_timestamp(&timestamp)],
        )?;
        Ok(())
    }
}

fn dataset_record((uuid, project_id, dir_path): (String, i64, String)) -> Result<DatasetRecord, ShareError> {
    Ok(DatasetRecord {
        uuid: uuid.parse()?,
        project_id: ProjectId::new(project_id),
        dir_path: Utf8PathBuf::from(dir_path),
    })
}

fn permission_record(
    (grant_id, member_id, dataset_id, expiry): (String, String, String, String),
) -> Result<PermissionRecord, ShareError> {
    Ok(PermissionRecord {
        grant_id,
        member_id: MemberId::new(member_id),
        dataset_id: dataset_id.parse()?,
        expiry: parse_timestamp(&expiry)?,
    })
}

/// Fixed-width UTC form so that text comparison in SQL matches time order.
pub fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, ShareError> {
    DateTime::parse_from_rfc3339(value)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|_| ShareError::InvalidTimestamp(value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watermark_starts_at_initial_value_and_only_advances() {
        let store = StateStore::open_in_memory().unwrap();
        let initial = store.last_job_update().unwrap();
        assert_eq!(initial, parse_timestamp(INITIAL_JOB_WATERMARK).unwrap());

        let later = parse_timestamp("2024-03-01T10:00:00Z").unwrap();
        store.advance_last_job_update(later).unwrap();
        store.advance_last_job_update(initial).unwrap();
        assert_eq!(store.last_job_update().unwrap(), later);
    }

    #[test]
    fn timestamps_sort_as_text() {
        let a = parse_timestamp("2024-03-01T09:59:59.5Z").unwrap();
        let b = parse_timestamp("2024-03-01T10:00:00Z").unwrap();
        assert!(format_timestamp(&a) < format_timestamp(&b));
    }
}
