use std::collections::HashSet;
use std::sync::Arc;

use camino::Utf8PathBuf;
use chrono::Duration;
use serde::Serialize;
use tracing::{error, info};

use crate::collection::{self, ChildKind, Dataset, DatasetKind};
use crate::document::DocumentReader;
use crate::domain::{DatasetDescription, DatasetUuid, MemberId, ProjectId, ProjectSnapshot};
use crate::error::ShareError;
use crate::globus::AccessControlClient;
use crate::jobs::{Discovery, JobTracker, PollSettings, TrackOutcome};
use crate::permissions::{GrantOutcome, PermissionManager, RevokeOutcome};
use crate::smrtlink::SmrtLinkClient;
use crate::staging::Stager;
use crate::store::{DatasetRecord, StateStore};

/// SMRT Link's catch-all project that every user can already see.
pub const GENERAL_PROJECT: ProjectId = ProjectId::new(1);
pub const DEFAULT_RETENTION_DAYS: i64 = 30;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub collection_id: String,
    pub retention: Duration,
    pub poll: PollSettings,
    pub excluded_projects: Vec<ProjectId>,
}

impl EngineSettings {
    pub fn new(collection_id: &str) -> Self {
        Self {
            collection_id: collection_id.to_string(),
            retention: Duration::days(DEFAULT_RETENTION_DAYS),
            poll: PollSettings::default(),
            excluded_projects: vec![GENERAL_PROJECT],
        }
    }
}

/// What one reconciliation pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub project_id: Option<ProjectId>,
    pub datasets_added: usize,
    pub datasets_reassigned: usize,
    pub datasets_unchanged: usize,
    pub datasets_removed: usize,
    pub datasets_failed: usize,
    pub members_added: usize,
    pub members_removed: usize,
    pub grants_created: usize,
    pub grants_revoked: usize,
    /// Earlier analyses of newly shared datasets.
    pub analyses: AnalysisReport,
}

impl ReconcileReport {
    fn for_project(project_id: ProjectId) -> Self {
        Self {
            project_id: Some(project_id),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AnalysisReport {
    pub staged: usize,
    pub tracked: usize,
    pub tracked_staged: usize,
    pub tracked_failed: usize,
}

enum DatasetChange {
    Added(DatasetRecord),
    Reassigned(DatasetRecord),
    Unchanged(DatasetRecord),
    /// Staged as part of its parent.
    Nested,
    /// Recorded on its own before its parent joined the project; the stale
    /// record was removed and the number of revoked grants is carried.
    Absorbed(usize),
    StageFailed,
}

/// Mirrors SMRT Link project state into the staging area and the collection's
/// access rules.
pub struct Engine<S: SmrtLinkClient, A: AccessControlClient, D: DocumentReader> {
    smrtlink: Arc<S>,
    documents: D,
    store: Arc<StateStore>,
    stager: Stager,
    permissions: PermissionManager<A>,
    jobs: JobTracker<S>,
    excluded_projects: Vec<ProjectId>,
}

impl<S: SmrtLinkClient, A: AccessControlClient, D: DocumentReader> Engine<S, A, D> {
    pub fn new(
        smrtlink: Arc<S>,
        access: A,
        documents: D,
        store: Arc<StateStore>,
        stager: Stager,
        settings: EngineSettings,
    ) -> Self {
        let permissions = PermissionManager::new(
            access,
            Arc::clone(&store),
            &settings.collection_id,
            settings.retention,
        );
        let jobs = JobTracker::new(
            Arc::clone(&smrtlink),
            Arc::clone(&store),
            stager.clone(),
            settings.poll,
        );
        Self {
            smrtlink,
            documents,
            store,
            stager,
            permissions,
            jobs,
            excluded_projects: settings.excluded_projects,
        }
    }

    pub fn is_excluded(&self, project_id: ProjectId) -> bool {
        self.excluded_projects.contains(&project_id)
    }

    pub fn new_project(&self) {
        if let Err(err) = self.try_new_project() {
            error!("new project notification failed: {err}");
        }
    }

    pub fn updated_project(&self, project_id: ProjectId) {
        if let Err(err) = self.try_updated_project(project_id) {
            error!(%project_id, "project update failed: {err}");
        }
    }

    pub fn deleted_project(&self, project_id: ProjectId) {
        if let Err(err) = self.try_deleted_project(project_id) {
            error!(%project_id, "project deletion failed: {err}");
        }
    }

    pub fn new_analyses(&self) {
        if let Err(err) = self.try_new_analyses() {
            error!("analysis discovery failed: {err}");
        }
    }

    pub fn expired_permissions(&self) {
        if let Err(err) = self.permissions.sweep_expired() {
            error!("expired permission sweep failed: {err}");
        }
    }

    /// Reconciles the most recently created project. A project that is already
    /// on record is reconciled as an update.
    pub fn try_new_project(&self) -> Result<ReconcileReport, ShareError> {
        let project_id = self
            .smrtlink
            .get_project_ids()?
            .into_iter()
            .filter(|id| !self.is_excluded(*id))
            .max()
            .ok_or(ShareError::NoProjects)?;
        let snapshot = self.fetch_snapshot(project_id)?;
        if !self.store.datasets_in_project(project_id)?.is_empty()
            || !self.store.members(project_id)?.is_empty()
        {
            info!(%project_id, "project already on record, reconciling as update");
        }
        self.reconcile(&snapshot)
    }

    pub fn try_updated_project(&self, project_id: ProjectId) -> Result<ReconcileReport, ShareError> {
        if self.is_excluded(project_id) {
            info!(%project_id, "ignoring excluded project");
            return Ok(ReconcileReport::for_project(project_id));
        }
        let snapshot = self.fetch_snapshot(project_id)?;
        self.reconcile(&snapshot)
    }

    /// Unstages and revokes everything recorded under `project_id`.
    pub fn try_deleted_project(&self, project_id: ProjectId) -> Result<ReconcileReport, ShareError> {
        let mut report = ReconcileReport::for_project(project_id);
        if self.is_excluded(project_id) {
            info!(%project_id, "ignoring excluded project");
            return Ok(report);
        }
        for record in self.store.datasets_in_project(project_id)? {
            match self.remove_dataset(&record) {
                Ok(revoked) => {
                    report.datasets_removed += 1;
                    report.grants_revoked += revoked;
                }
                Err(err) => {
                    error!(%project_id, dataset = %record.uuid, "unable to remove dataset: {err}");
                    report.datasets_failed += 1;
                }
            }
        }
        report.members_removed = self.store.delete_members(project_id)?;
        info!(%project_id, datasets = report.datasets_removed, "removed project");
        Ok(report)
    }

    /// Stages outputs of jobs that already succeeded, then waits on the rest.
    pub fn try_new_analyses(&self) -> Result<AnalysisReport, ShareError> {
        let discovery = self.jobs.discover_new()?;
        Ok(self.stage_analyses(discovery))
    }

    fn stage_analyses(&self, discovery: Discovery) -> AnalysisReport {
        let mut report = AnalysisReport {
            staged: discovery
                .completed
                .iter()
                .filter(|collection| self.stager.stage(collection))
                .count(),
            tracked: discovery.pending.len(),
            ..AnalysisReport::default()
        };
        for (_, outcome) in self.jobs.track(discovery.pending) {
            match outcome {
                TrackOutcome::Staged(count) => report.tracked_staged += count,
                TrackOutcome::Failed | TrackOutcome::Vanished | TrackOutcome::TimedOut => {
                    report.tracked_failed += 1
                }
            }
        }
        report
    }

    pub fn try_expired_permissions(&self) -> Result<usize, ShareError> {
        self.permissions.sweep_expired()
    }

    fn fetch_snapshot(&self, project_id: ProjectId) -> Result<ProjectSnapshot, ShareError> {
        self.smrtlink
            .get_project(project_id)?
            .map(ProjectSnapshot::from)
            .ok_or(ShareError::ProjectNotFound(project_id.get()))
    }

    /// Brings the local record, the staging area and the grants in line with
    /// `snapshot`. Failures for a single dataset or member are logged and do
    /// not stop the rest of the pass.
    pub fn reconcile(&self, snapshot: &ProjectSnapshot) -> Result<ReconcileReport, ShareError> {
        let project_id = snapshot.id;
        let mut report = ReconcileReport::for_project(project_id);

        // Computed before any insert so that membership changes of this pass
        // cannot shadow each other.
        let removed_members = self.store.removed_members(project_id, &snapshot.members)?;
        for member in &snapshot.members {
            if self.store.add_member(project_id, member)? {
                report.members_added += 1;
            }
        }

        let current: Vec<DatasetUuid> = snapshot
            .datasets
            .iter()
            .map(|description| description.uuid.clone())
            .collect();
        let present: HashSet<DatasetUuid> = current.iter().cloned().collect();

        let mut added = Vec::new();
        let mut reassigned = Vec::new();
        let mut unchanged = Vec::new();
        let mut analyses = Discovery::default();
        for description in &snapshot.datasets {
            match self.apply_dataset(project_id, description, &present, &mut analyses) {
                Ok(DatasetChange::Added(record)) => added.push(record),
                Ok(DatasetChange::Reassigned(record)) => reassigned.push(record),
                Ok(DatasetChange::Unchanged(record)) => unchanged.push(record),
                Ok(DatasetChange::Nested) => {}
                Ok(DatasetChange::Absorbed(revoked)) => {
                    report.datasets_removed += 1;
                    report.grants_revoked += revoked;
                }
                Ok(DatasetChange::StageFailed) => report.datasets_failed += 1,
                Err(err) => {
                    error!(%project_id, dataset = %description.uuid, "skipping dataset: {err}");
                    report.datasets_failed += 1;
                }
            }
        }
        report.datasets_added = added.len();
        report.datasets_reassigned = reassigned.len();
        report.datasets_unchanged = unchanged.len();

        for record in self.store.removed_datasets(project_id, &current)? {
            match self.remove_dataset(&record) {
                Ok(revoked) => {
                    report.datasets_removed += 1;
                    report.grants_revoked += revoked;
                }
                Err(err) => {
                    error!(%project_id, dataset = %record.uuid, "unable to remove dataset: {err}");
                    report.datasets_failed += 1;
                }
            }
        }

        let remaining = self.store.datasets_in_project(project_id)?;
        for member in removed_members {
            for record in &remaining {
                match self.permissions.revoke(&record.uuid, &member.member_id) {
                    Ok(RevokeOutcome::Revoked) => report.grants_revoked += 1,
                    Ok(_) => {}
                    Err(err) => error!(
                        %project_id,
                        dataset = %record.uuid,
                        member = %member.member_id,
                        "unable to revoke: {err}"
                    ),
                }
            }
            self.store.delete_member(project_id, &member.member_id)?;
            report.members_removed += 1;
            info!(%project_id, member = %member.member_id, "removed member");
        }

        for record in &added {
            report.grants_created += self.grant_all(project_id, record, &snapshot.members);
        }
        for record in &reassigned {
            match self.permissions.revoke_all(&record.uuid) {
                Ok(revoked) => report.grants_revoked += revoked,
                Err(err) => {
                    error!(%project_id, dataset = %record.uuid, "unable to revoke prior grants: {err}");
                }
            }
            report.grants_created += self.grant_all(project_id, record, &snapshot.members);
        }
        // Members already holding a grant are skipped by the permission
        // manager, so this only retries grants that did not go through.
        for record in &unchanged {
            report.grants_created += self.grant_all(project_id, record, &snapshot.members);
        }

        if !analyses.is_empty() {
            report.analyses = self.stage_analyses(analyses);
        }

        info!(
            %project_id,
            added = report.datasets_added,
            reassigned = report.datasets_reassigned,
            removed = report.datasets_removed,
            grants = report.grants_created,
            revoked = report.grants_revoked,
            "reconciled project"
        );
        Ok(report)
    }

    fn apply_dataset(
        &self,
        project_id: ProjectId,
        description: &DatasetDescription,
        present: &HashSet<DatasetUuid>,
        analyses: &mut Discovery,
    ) -> Result<DatasetChange, ShareError> {
        if collection::classify(description, present) == DatasetKind::Child {
            return match self.store.dataset(&description.uuid)? {
                Some(record) if record.project_id == project_id => {
                    info!(
                        %project_id,
                        dataset = %record.uuid,
                        "parent joined the project, removing standalone copy"
                    );
                    Ok(DatasetChange::Absorbed(self.remove_dataset(&record)?))
                }
                _ => Ok(DatasetChange::Nested),
            };
        }
        match self.store.dataset(&description.uuid)? {
            None => {
                let dataset = Dataset::resolve(description, &self.documents)?;
                let Some(targets) = self.stage_dataset(&dataset) else {
                    return Ok(DatasetChange::StageFailed);
                };
                let record = DatasetRecord {
                    uuid: description.uuid.clone(),
                    project_id,
                    dir_path: dataset.dir_path(),
                };
                self.store.insert_dataset(&record)?;
                info!(%project_id, dataset = %record.uuid, dir = %record.dir_path, "added dataset");
                for (uuid, dir_path) in targets {
                    match self.jobs.dataset_analyses(&uuid, &dir_path) {
                        Ok(found) => analyses.merge(found),
                        Err(err) => {
                            error!(%project_id, dataset = %uuid, "unable to list analyses: {err}");
                        }
                    }
                }
                Ok(DatasetChange::Added(record))
            }
            Some(record) if record.project_id == project_id => Ok(DatasetChange::Unchanged(record)),
            Some(record) => {
                self.store.reassign_dataset(&record.uuid, project_id)?;
                info!(
                    %project_id,
                    dataset = %record.uuid,
                    from = %record.project_id,
                    "reassigned dataset"
                );
                Ok(DatasetChange::Reassigned(DatasetRecord {
                    project_id,
                    ..record
                }))
            }
        }
    }

    /// Stages the dataset directory, then each child directory below it.
    /// Only the dataset's own directory decides success; a child that fails is
    /// logged and left out. Returns the datasets whose analyses belong in the
    /// staged directories.
    fn stage_dataset(&self, dataset: &Dataset) -> Option<Vec<(DatasetUuid, Utf8PathBuf)>> {
        if !self.stager.stage(&dataset.collection()) {
            return None;
        }
        let mut targets = vec![(dataset.uuid().clone(), dataset.dir_path())];
        for child in dataset.children() {
            if !self.stager.stage(&child.collection()) {
                error!(dataset = %dataset.uuid(), child = %child.dir_path(), "child directory not staged");
                continue;
            }
            if let ChildKind::Sample { uuid: Some(uuid), .. } = &child.kind {
                match uuid.parse::<DatasetUuid>() {
                    Ok(uuid) => targets.push((uuid, child.dir_path())),
                    Err(err) => {
                        error!(dataset = %dataset.uuid(), child = %child.dir_path(), "{err}");
                    }
                }
            }
        }
        Some(targets)
    }

    /// Unstages `record`, revokes its grants and forgets it. Returns the
    /// number of grants revoked.
    fn remove_dataset(&self, record: &DatasetRecord) -> Result<usize, ShareError> {
        self.stager.unstage(&record.dir_path);
        let revoked = self.permissions.revoke_all(&record.uuid)?;
        self.store.delete_dataset(&record.uuid)?;
        info!(project_id = %record.project_id, dataset = %record.uuid, "removed dataset");
        Ok(revoked)
    }

    fn grant_all(&self, project_id: ProjectId, record: &DatasetRecord, members: &[MemberId]) -> usize {
        let mut granted = 0;
        for member in members {
            match self.permissions.grant(&record.uuid, &record.dir_path, member) {
                Ok(GrantOutcome::Granted(_)) => granted += 1,
                Ok(GrantOutcome::AlreadyGranted | GrantOutcome::Skipped) => {}
                Err(err @ ShareError::GrantQuotaExceeded(_)) => error!(
                    %project_id,
                    dataset = %record.uuid,
                    %member,
                    "access rule quota exhausted, operator action required: {err}"
                ),
                Err(err) => {
                    error!(%project_id, dataset = %record.uuid, %member, "grant failed: {err}");
                }
            }
        }
        granted
    }
}
