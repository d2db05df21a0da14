use std::sync::Arc;

use camino::Utf8Path;
use chrono::{Duration, Utc};
use tracing::{info, warn};

use crate::domain::{DatasetUuid, MemberId};
use crate::error::ShareError;
use crate::globus::{AccessControlClient, GrantRequest};
use crate::store::{PermissionRecord, StateStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrantOutcome {
    Granted(PermissionRecord),
    /// A grant already exists locally or remotely; nothing was created.
    AlreadyGranted,
    /// The remote call failed in a retryable way; the next reconciliation retries.
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevokeOutcome {
    Revoked,
    NotGranted,
    /// The remote deletion failed; the local record is kept for a later retry.
    Failed,
}

/// Issues and withdraws time-bounded read grants on the shared collection,
/// keeping one local record per (member, dataset) grant.
pub struct PermissionManager<A: AccessControlClient> {
    access: A,
    store: Arc<StateStore>,
    collection_id: String,
    retention: Duration,
}

impl<A: AccessControlClient> PermissionManager<A> {
    pub fn new(access: A, store: Arc<StateStore>, collection_id: &str, retention: Duration) -> Self {
        Self {
            access,
            store,
            collection_id: collection_id.to_string(),
            retention,
        }
    }

    /// Grants `member` read access to the dataset staged at `dir_path`.
    ///
    /// Quota exhaustion is returned as an error because it needs an operator;
    /// every other remote failure is logged and reported as `Skipped`.
    pub fn grant(
        &self,
        dataset: &DatasetUuid,
        dir_path: &Utf8Path,
        member: &MemberId,
    ) -> Result<GrantOutcome, ShareError> {
        if self.store.permission(member, dataset)?.is_some() {
            return Ok(GrantOutcome::AlreadyGranted);
        }

        let expiry = Utc::now() + self.retention;
        let request = GrantRequest::read_only(member.as_str(), collection_path(dir_path), expiry);
        match self.access.add_grant(&self.collection_id, &request) {
            Ok(grant_id) => {
                let record = PermissionRecord {
                    grant_id,
                    member_id: member.clone(),
                    dataset_id: dataset.clone(),
                    expiry,
                };
                if !self.store.insert_permission(&record)? {
                    // A concurrent reconciliation recorded its own grant first.
                    info!(%dataset, %member, grant = %record.grant_id, "grant raced, withdrawing duplicate");
                    if let Err(err) = self.access.delete_grant(&self.collection_id, &record.grant_id) {
                        warn!(%dataset, %member, "failed to withdraw duplicate grant: {err}");
                    }
                    return Ok(GrantOutcome::AlreadyGranted);
                }
                info!(%dataset, %member, grant = %record.grant_id, "granted read access");
                Ok(GrantOutcome::Granted(record))
            }
            Err(ShareError::GrantExists) => {
                info!(%dataset, %member, "access rule already exists");
                Ok(GrantOutcome::AlreadyGranted)
            }
            Err(err @ ShareError::GrantQuotaExceeded(_)) => Err(err),
            Err(err) => {
                warn!(%dataset, %member, "grant skipped: {err}");
                Ok(GrantOutcome::Skipped)
            }
        }
    }

    pub fn revoke(&self, dataset: &DatasetUuid, member: &MemberId) -> Result<RevokeOutcome, ShareError> {
        match self.store.permission(member, dataset)? {
            Some(record) => self.revoke_record(&record),
            None => {
                info!(%dataset, %member, "no grant recorded, nothing to revoke");
                Ok(RevokeOutcome::NotGranted)
            }
        }
    }

    /// Revokes every recorded grant on `dataset`; returns how many were withdrawn.
    pub fn revoke_all(&self, dataset: &DatasetUuid) -> Result<usize, ShareError> {
        let mut revoked = 0;
        for record in self.store.permissions_for_dataset(dataset)? {
            if self.revoke_record(&record)? == RevokeOutcome::Revoked {
                revoked += 1;
            }
        }
        Ok(revoked)
    }

    fn revoke_record(&self, record: &PermissionRecord) -> Result<RevokeOutcome, ShareError> {
        if let Err(err) = self.access.delete_grant(&self.collection_id, &record.grant_id) {
            warn!(
                dataset = %record.dataset_id,
                member = %record.member_id,
                grant = %record.grant_id,
                "failed to revoke grant: {err}"
            );
            return Ok(RevokeOutcome::Failed);
        }
        self.store.delete_permission(&record.grant_id)?;
        info!(
            dataset = %record.dataset_id,
            member = %record.member_id,
            grant = %record.grant_id,
            "revoked read access"
        );
        Ok(RevokeOutcome::Revoked)
    }

    /// Forgets grants whose expiry has passed. The remote rules lapse on their own.
    pub fn sweep_expired(&self) -> Result<usize, ShareError> {
        let removed = self.store.delete_expired_permissions(Utc::now())?;
        if removed > 0 {
            info!(removed, "removed expired permission records");
        }
        Ok(removed)
    }
}

/// Path of a staged directory as seen from the collection root.
pub fn collection_path(dir_path: &Utf8Path) -> String {
    format!("/{}/", dir_path.as_str().trim_matches('/'))
}
