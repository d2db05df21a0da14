use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, error, info, warn};

use crate::collection::FileCollection;
use crate::domain::{DatasetUuid, Job, JobId, JobPhase};
use crate::error::ShareError;
use crate::smrtlink::SmrtLinkClient;
use crate::staging::Stager;
use crate::store::StateStore;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_POLL_CEILING: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    pub interval: Duration,
    pub ceiling: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            ceiling: DEFAULT_POLL_CEILING,
        }
    }
}

/// A job that has not reached a terminal state, with the staged directories
/// of the datasets it analyses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingJob {
    pub job: Job,
    pub dataset_dirs: Vec<Utf8PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Discovery {
    /// Output collections of jobs that had already succeeded.
    pub completed: Vec<FileCollection>,
    pub pending: Vec<PendingJob>,
}

impl Discovery {
    pub fn is_empty(&self) -> bool {
        self.completed.is_empty() && self.pending.is_empty()
    }

    pub fn merge(&mut self, other: Discovery) {
        self.completed.extend(other.completed);
        self.pending.extend(other.pending);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackOutcome {
    /// Number of collections staged successfully.
    Staged(usize),
    Failed,
    Vanished,
    TimedOut,
}

pub struct JobTracker<S: SmrtLinkClient> {
    client: Arc<S>,
    store: Arc<StateStore>,
    stager: Stager,
    settings: PollSettings,
}

impl<S: SmrtLinkClient> JobTracker<S> {
    pub fn new(client: Arc<S>, store: Arc<StateStore>, stager: Stager, settings: PollSettings) -> Self {
        Self {
            client,
            store,
            stager,
            settings,
        }
    }

    /// Fetches jobs created after the stored watermark and sorts them into
    /// completed output collections and jobs still running.
    ///
    /// The watermark moves to the newest job's creation time only once every
    /// job has been classified; any error leaves it where it was so the same
    /// jobs are seen again on the next call.
    pub fn discover_new(&self) -> Result<Discovery, ShareError> {
        let watermark = self.store.last_job_update()?;
        let jobs = self.client.get_jobs_created_after(watermark)?;
        let mut discovery = Discovery::default();
        let mut newest = watermark;

        for job in jobs {
            newest = newest.max(job.created_at);
            let dataset_dirs = self.dataset_dirs(job.id)?;
            if dataset_dirs.is_empty() {
                debug!(job = %job.id, "job analyses no shared dataset, ignoring");
                continue;
            }
            match job.state.phase() {
                JobPhase::Succeeded => {
                    let files = self.client.get_job_files(job.id)?;
                    discovery.completed.extend(
                        dataset_dirs
                            .iter()
                            .map(|dir| FileCollection::analysis(dir, job.id, &job.name, files.clone())),
                    );
                }
                JobPhase::Pending => {
                    info!(job = %job.id, state = %job.state, "tracking pending job");
                    discovery.pending.push(PendingJob { job, dataset_dirs });
                }
                JobPhase::Failed => {
                    info!(job = %job.id, state = %job.state, "job did not succeed, not staging");
                }
            }
        }

        self.store.advance_last_job_update(newest)?;
        Ok(discovery)
    }

    /// Sorts every analysis of one dataset, old ones included, into output
    /// collections under `dir_path` and jobs still running. Used when a
    /// dataset is first shared, since the watermark has already passed its
    /// earlier jobs. The watermark is left alone.
    pub fn dataset_analyses(
        &self,
        uuid: &DatasetUuid,
        dir_path: &Utf8Path,
    ) -> Result<Discovery, ShareError> {
        let mut discovery = Discovery::default();
        for job in self.client.get_dataset_jobs(uuid)? {
            match job.state.phase() {
                JobPhase::Succeeded => {
                    let files = self.client.get_job_files(job.id)?;
                    discovery
                        .completed
                        .push(FileCollection::analysis(dir_path, job.id, &job.name, files));
                }
                JobPhase::Pending => {
                    info!(job = %job.id, dataset = %uuid, state = %job.state, "tracking pending job");
                    discovery.pending.push(PendingJob {
                        job,
                        dataset_dirs: vec![dir_path.to_path_buf()],
                    });
                }
                JobPhase::Failed => {
                    debug!(job = %job.id, dataset = %uuid, state = %job.state, "skipping unsuccessful job");
                }
            }
        }
        Ok(discovery)
    }

    fn dataset_dirs(&self, job_id: JobId) -> Result<Vec<Utf8PathBuf>, ShareError> {
        let mut dirs = Vec::new();
        for uuid in self.client.get_job_datasets(job_id)? {
            if let Some(record) = self.store.dataset(&uuid)? {
                dirs.push(record.dir_path);
            }
        }
        Ok(dirs)
    }

    /// Polls every pending job on its own thread until each one succeeds,
    /// fails, disappears or runs past the ceiling. Returns when all are done.
    pub fn track(&self, pending: Vec<PendingJob>) -> Vec<(JobId, TrackOutcome)> {
        thread::scope(|scope| {
            let handles: Vec<_> = pending
                .iter()
                .map(|job| (job.job.id, scope.spawn(move || self.await_completion(job))))
                .collect();
            handles
                .into_iter()
                .map(|(id, handle)| {
                    let outcome = handle.join().unwrap_or_else(|_| {
                        error!(job = %id, "job tracking thread panicked");
                        TrackOutcome::Failed
                    });
                    (id, outcome)
                })
                .collect()
        })
    }

    fn await_completion(&self, pending: &PendingJob) -> TrackOutcome {
        let id = pending.job.id;
        let started = Instant::now();
        loop {
            let elapsed = started.elapsed();
            if elapsed >= self.settings.ceiling {
                error!(job = %id, waited_secs = elapsed.as_secs(), "gave up waiting for job");
                return TrackOutcome::TimedOut;
            }
            thread::sleep(self.settings.interval.min(self.settings.ceiling - elapsed));

            let job = match self.client.get_job(id) {
                Ok(Some(job)) => job,
                Ok(None) => {
                    warn!(job = %id, "job no longer exists, stopped tracking");
                    return TrackOutcome::Vanished;
                }
                Err(err) => {
                    warn!(job = %id, "unable to poll job: {err}");
                    continue;
                }
            };
            match job.state.phase() {
                JobPhase::Pending => continue,
                JobPhase::Failed => {
                    info!(job = %id, state = %job.state, "job did not succeed, not staging");
                    return TrackOutcome::Failed;
                }
                JobPhase::Succeeded => return self.stage_outputs(&job, &pending.dataset_dirs),
            }
        }
    }

    fn stage_outputs(&self, job: &Job, dataset_dirs: &[Utf8PathBuf]) -> TrackOutcome {
        let files = match self.client.get_job_files(job.id) {
            Ok(files) => files,
            Err(err) => {
                error!(job = %job.id, "unable to list job outputs: {err}");
                return TrackOutcome::Failed;
            }
        };
        let staged = dataset_dirs
            .iter()
            .map(|dir| FileCollection::analysis(dir, job.id, &job.name, files.clone()))
            .filter(|collection| self.stager.stage(collection))
            .count();
        info!(job = %job.id, staged, "staged analysis outputs");
        TrackOutcome::Staged(staged)
    }
}
