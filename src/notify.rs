use std::fmt;
use std::sync::{Arc, LazyLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use regex::Regex;
use tracing::info;

use crate::document::DocumentReader;
use crate::domain::ProjectId;
use crate::engine::Engine;
use crate::error::ShareError;
use crate::globus::AccessControlClient;
use crate::smrtlink::SmrtLinkClient;

pub const DEFAULT_NOTIFICATION_DELAY: Duration = Duration::from_millis(1000);

static PROJECT_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/smrt-link/projects/(\d+)/?$").unwrap());

/// A SMRT Link webhook, identified by its HTTP method and path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    NewProject,
    UpdatedProject(ProjectId),
    DeletedProject(ProjectId),
    NewAnalyses,
}

impl Notification {
    pub fn from_request(method: &str, path: &str) -> Result<Self, ShareError> {
        let path = path.split('?').next().unwrap_or(path);
        let unknown = || ShareError::UnknownNotification(format!("{method} {path}"));
        let method = method.to_ascii_uppercase();
        match method.as_str() {
            "POST" if path.trim_end_matches('/') == "/smrt-link/projects" => Ok(Self::NewProject),
            "POST" if path.trim_end_matches('/') == "/smrt-link/job-manager/jobs/analysis" => {
                Ok(Self::NewAnalyses)
            }
            "PUT" | "DELETE" => {
                let id = PROJECT_PATH
                    .captures(path)
                    .and_then(|caps| caps.get(1))
                    .ok_or_else(unknown)?
                    .as_str()
                    .parse::<ProjectId>()
                    .map_err(|_| unknown())?;
                if method == "PUT" {
                    Ok(Self::UpdatedProject(id))
                } else {
                    Ok(Self::DeletedProject(id))
                }
            }
            _ => Err(unknown()),
        }
    }

    /// Whether SMRT Link may still be writing the change when it notifies.
    /// Deletions have nothing left to read back.
    pub fn needs_settling(&self) -> bool {
        !matches!(self, Self::DeletedProject(_))
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NewProject => write!(f, "new project"),
            Self::UpdatedProject(id) => write!(f, "project {id} updated"),
            Self::DeletedProject(id) => write!(f, "project {id} deleted"),
            Self::NewAnalyses => write!(f, "new analyses"),
        }
    }
}

/// Runs each notification on its own worker thread so the webhook can be
/// acknowledged immediately.
pub struct Dispatcher<S, A, D>
where
    S: SmrtLinkClient,
    A: AccessControlClient,
    D: DocumentReader,
{
    engine: Arc<Engine<S, A, D>>,
    delay: Duration,
}

impl<S, A, D> Dispatcher<S, A, D>
where
    S: SmrtLinkClient + 'static,
    A: AccessControlClient + 'static,
    D: DocumentReader + 'static,
{
    pub fn new(engine: Arc<Engine<S, A, D>>, delay: Duration) -> Self {
        Self { engine, delay }
    }

    pub fn dispatch(&self, notification: Notification) -> JoinHandle<()> {
        info!(%notification, "received notification");
        let engine = Arc::clone(&self.engine);
        let delay = if notification.needs_settling() {
            self.delay
        } else {
            Duration::ZERO
        };
        thread::spawn(move || {
            // Gives SMRT Link a moment to commit before it is queried again.
            thread::sleep(delay);
            match notification {
                Notification::NewProject => engine.new_project(),
                Notification::UpdatedProject(id) => engine.updated_project(id),
                Notification::DeletedProject(id) => engine.deleted_project(id),
                Notification::NewAnalyses => engine.new_analyses(),
            }
        })
    }

    pub fn dispatch_request(&self, method: &str, path: &str) -> Result<JoinHandle<()>, ShareError> {
        Ok(self.dispatch(Notification::from_request(method, path)?))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn routes_project_notifications() {
        assert_eq!(
            Notification::from_request("POST", "/smrt-link/projects").unwrap(),
            Notification::NewProject
        );
        assert_eq!(
            Notification::from_request("put", "/smrt-link/projects/12").unwrap(),
            Notification::UpdatedProject(ProjectId::new(12))
        );
        assert_eq!(
            Notification::from_request("DELETE", "/smrt-link/projects/12/").unwrap(),
            Notification::DeletedProject(ProjectId::new(12))
        );
        assert_eq!(
            Notification::from_request("POST", "/smrt-link/job-manager/jobs/analysis").unwrap(),
            Notification::NewAnalyses
        );
    }

    #[test]
    fn rejects_unknown_routes() {
        assert_matches!(
            Notification::from_request("GET", "/smrt-link/projects"),
            Err(ShareError::UnknownNotification(_))
        );
        assert_matches!(
            Notification::from_request("PUT", "/smrt-link/projects"),
            Err(ShareError::UnknownNotification(_))
        );
        assert_matches!(
            Notification::from_request("DELETE", "/smrt-link/projects/0"),
            Err(ShareError::UnknownNotification(_))
        );
    }

    #[test]
    fn deletions_skip_the_settling_delay() {
        assert!(Notification::NewProject.needs_settling());
        assert!(!Notification::DeletedProject(ProjectId::new(3)).needs_settling());
    }
}
