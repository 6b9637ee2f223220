//! Job records, the lifecycle state machine, and the ownership guard.
//!
//! The store plays the document-store role: a JSON-file-backed map guarded
//! by an `RwLock`. Every status change goes through [`JobStore::transition`],
//! which only accepts edges from the lifecycle table; nothing else in the
//! crate writes a status.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::auth::AuthSession;
use crate::config::Config;

/// Uploads strictly above this size are handled in `large` mode; a file
/// of exactly this size is still `normal`.
pub const LARGE_MODE_THRESHOLD_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Starting,
    Running,
    Cleaning,
    Completed,
    Cleaned,
    Failed,
}

impl JobStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Cleaning => "cleaning",
            Self::Completed => "completed",
            Self::Cleaned => "cleaned",
            Self::Failed => "failed",
        }
    }
}

/// Lifecycle events that may move a job between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEvent {
    AnalysisDelegated,
    CleaningDelegated,
    WorkerSucceeded,
    WorkerFailed,
}

impl JobEvent {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AnalysisDelegated => "analysis_delegated",
            Self::CleaningDelegated => "cleaning_delegated",
            Self::WorkerSucceeded => "worker_succeeded",
            Self::WorkerFailed => "worker_failed",
        }
    }
}

/// The transition table. Any pair not listed is rejected.
///
/// A cleaning failure falls back to `completed`, not `failed`: a failed
/// cleaning run must not regress a previously completed analysis.
#[must_use]
pub fn next_status(from: JobStatus, event: JobEvent) -> Option<JobStatus> {
    use JobEvent as E;
    use JobStatus as S;

    match (from, event) {
        (S::Starting, E::AnalysisDelegated) => Some(S::Running),
        (S::Running, E::WorkerSucceeded) => Some(S::Completed),
        (S::Running, E::WorkerFailed) => Some(S::Failed),
        (S::Completed | S::Failed | S::Cleaned, E::CleaningDelegated) => Some(S::Cleaning),
        (S::Cleaning, E::WorkerSucceeded) => Some(S::Cleaned),
        (S::Cleaning, E::WorkerFailed) => Some(S::Completed),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobMode {
    Normal,
    Large,
}

impl JobMode {
    #[must_use]
    pub fn for_size(bytes: u64) -> Self {
        if bytes > LARGE_MODE_THRESHOLD_BYTES {
            Self::Large
        } else {
            Self::Normal
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Large => "large",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub owner: String,
    pub status: JobStatus,
    pub mode: JobMode,
    pub source_filename: String,
    pub source_path: String,
    pub cleaned_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum JobStoreError {
    #[error("job not found")]
    NotFound,
    #[error("invalid transition: {event} not allowed from {from}")]
    InvalidTransition {
        from: &'static str,
        event: &'static str,
    },
    #[error("{message}")]
    Persistence { message: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct JobStoreState {
    jobs: HashMap<String, Job>,
}

#[derive(Clone)]
pub struct JobStore {
    state: Arc<RwLock<JobStoreState>>,
    path: Option<PathBuf>,
}

impl JobStore {
    pub fn from_config(config: &Config) -> Self {
        let path = config.job_store_path.clone();
        let state = load_state(path.as_deref());
        Self {
            state: Arc::new(RwLock::new(state)),
            path,
        }
    }

    /// Creates a new job in `starting`. Ids are generated by the caller
    /// (uuid v4) and never reused.
    pub async fn create(
        &self,
        id: String,
        owner: String,
        mode: JobMode,
        source_filename: String,
        source_path: String,
    ) -> Result<Job, JobStoreError> {
        let now = Utc::now();
        let job = Job {
            id: id.clone(),
            owner,
            status: JobStatus::Starting,
            mode,
            source_filename,
            source_path,
            cleaned_path: None,
            created_at: now,
            updated_at: now,
        };

        let snapshot = {
            let mut state = self.state.write().await;
            state.jobs.insert(id, job.clone());
            state.clone()
        };
        self.persist(&snapshot).await?;

        Ok(job)
    }

    pub async fn get(&self, job_id: &str) -> Option<Job> {
        self.state.read().await.jobs.get(job_id).cloned()
    }

    /// Ownership guard: admins see every job, everyone else only their
    /// own. `None` is indistinguishable from a missing job by design.
    pub async fn resolve_accessible(&self, job_id: &str, session: &AuthSession) -> Option<Job> {
        let job = self.get(job_id).await?;
        if session.is_admin() || job.owner == session.subject_id {
            Some(job)
        } else {
            None
        }
    }

    /// Applies a lifecycle event, enforcing the transition table.
    /// Last-write-wins; there is no optimistic concurrency token.
    pub async fn transition(&self, job_id: &str, event: JobEvent) -> Result<Job, JobStoreError> {
        let (job, snapshot) = {
            let mut state = self.state.write().await;
            let job = state.jobs.get_mut(job_id).ok_or(JobStoreError::NotFound)?;

            let next = next_status(job.status, event).ok_or(JobStoreError::InvalidTransition {
                from: job.status.as_str(),
                event: event.as_str(),
            })?;

            job.status = next;
            job.updated_at = Utc::now();
            (job.clone(), state.clone())
        };
        self.persist(&snapshot).await?;

        Ok(job)
    }

    pub async fn set_cleaned_path(
        &self,
        job_id: &str,
        cleaned_path: String,
    ) -> Result<Job, JobStoreError> {
        let (job, snapshot) = {
            let mut state = self.state.write().await;
            let job = state.jobs.get_mut(job_id).ok_or(JobStoreError::NotFound)?;
            job.cleaned_path = Some(cleaned_path);
            job.updated_at = Utc::now();
            (job.clone(), state.clone())
        };
        self.persist(&snapshot).await?;

        Ok(job)
    }

    /// Jobs visible to the session: all for admins, own otherwise.
    /// Newest first.
    pub async fn list_visible(&self, session: &AuthSession) -> Vec<Job> {
        let state = self.state.read().await;
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|job| session.is_admin() || job.owner == session.subject_id)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    /// Removes a job record. Returns the removed job, or `None` if it was
    /// already gone (deletion is idempotent).
    pub async fn delete(&self, job_id: &str) -> Result<Option<Job>, JobStoreError> {
        let (job, snapshot) = {
            let mut state = self.state.write().await;
            let job = state.jobs.remove(job_id);
            (job, state.clone())
        };
        if job.is_some() {
            self.persist(&snapshot).await?;
        }
        Ok(job)
    }

    async fn persist(&self, state: &JobStoreState) -> Result<(), JobStoreError> {
        persist_state(self.path.as_deref(), state)
            .await
            .map_err(|message| JobStoreError::Persistence { message })
    }
}

fn load_state(path: Option<&std::path::Path>) -> JobStoreState {
    let Some(path) = path else {
        return JobStoreState::default();
    };

    let raw = match std::fs::read_to_string(path) {
        Ok(value) => value,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            return JobStoreState::default();
        }
        Err(error) => {
            tracing::warn!(
                target: "datawash.jobs",
                path = %path.display(),
                error = %error,
                "failed to read job store; booting with empty state",
            );
            return JobStoreState::default();
        }
    };

    match serde_json::from_str::<JobStoreState>(&raw) {
        Ok(state) => state,
        Err(error) => {
            tracing::warn!(
                target: "datawash.jobs",
                path = %path.display(),
                error = %error,
                "failed to parse job store; booting with empty state",
            );
            JobStoreState::default()
        }
    }
}

pub(crate) async fn persist_state<T: Serialize>(
    path: Option<&std::path::Path>,
    state: &T,
) -> Result<(), String> {
    let Some(path) = path else {
        return Ok(());
    };

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|error| format!("failed to prepare store directory: {error}"))?;
    }

    let payload = serde_json::to_vec(state)
        .map_err(|error| format!("failed to encode store payload: {error}"))?;
    let temp_path = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));

    tokio::fs::write(&temp_path, payload)
        .await
        .map_err(|error| format!("failed to write store payload: {error}"))?;

    tokio::fs::rename(&temp_path, path)
        .await
        .map_err(|error| format!("failed to finalize store payload: {error}"))?;

    Ok(())
}

pub(crate) use persist_state as persist_json_state;
