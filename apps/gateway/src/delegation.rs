//! Background delegation tasks and their failure supervisor.
//!
//! Handlers enqueue work, transition the job, and return 202; the actual
//! worker call runs in a spawned task owned by a [`Delegator`]. Task
//! failures are never silent: each one is reported over an mpsc channel to
//! a supervisor that logs it, in addition to the audit trail entry.

use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use datawash_worker_client::{
    AnalyzeRequest, CleanRequest, CleaningOutcome, WorkerClient, WorkerClientError,
};

use crate::audit::{AuditEventKind, AuditTrail};
use crate::jobs::{Job, JobEvent, JobStore};
use crate::results::{
    AnalysisSummary, CleaningSummary, ResultEnvelope, ResultKind, ResultStore,
};

/// One failed delegation, as seen by the supervisor.
#[derive(Debug, Clone)]
pub struct DelegationFailure {
    pub job_id: String,
    pub operation: &'static str,
    pub classification: &'static str,
    pub message: String,
}

#[derive(Clone)]
pub struct DelegationReporter {
    tx: mpsc::UnboundedSender<DelegationFailure>,
}

impl DelegationReporter {
    /// Builds a reporter plus the receiving end for a supervisor.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<DelegationFailure>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// A send failure means the supervisor is gone (shutdown); nothing
    /// useful is left to do with the report at that point.
    pub fn report(&self, failure: DelegationFailure) {
        let _ = self.tx.send(failure);
    }
}

/// Drains the failure channel for the lifetime of the process.
pub fn spawn_supervisor(mut rx: mpsc::UnboundedReceiver<DelegationFailure>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(failure) = rx.recv().await {
            tracing::warn!(
                target: "datawash.delegation",
                job_id = %failure.job_id,
                operation = failure.operation,
                classification = failure.classification,
                message = %failure.message,
                "delegated operation failed",
            );
        }
    })
}

/// Owns everything a background delegation task needs.
#[derive(Clone)]
pub struct Delegator {
    pub jobs: JobStore,
    pub results: ResultStore,
    pub audit: AuditTrail,
    pub worker: WorkerClient,
    pub reporter: DelegationReporter,
}

impl Delegator {
    pub fn spawn_analysis(&self, job: Job) -> JoinHandle<()> {
        let delegator = self.clone();
        tokio::spawn(async move { delegator.run_analysis(job).await })
    }

    pub fn spawn_cleaning(
        &self,
        job: Job,
        requested_mode: Option<String>,
        rules: Vec<String>,
    ) -> JoinHandle<()> {
        let delegator = self.clone();
        tokio::spawn(async move { delegator.run_cleaning(job, requested_mode, rules).await })
    }

    /// The analysis task body. The caller has already transitioned the job
    /// to `running` and written the `analysis_enqueued` audit event.
    pub async fn run_analysis(&self, job: Job) {
        self.audit.append_detached(
            Some(&job.id),
            AuditEventKind::AnalysisStarted,
            &json!({ "mode": job.mode.as_str() }),
        );

        let request = AnalyzeRequest {
            job_id: job.id.clone(),
            file_path: job.source_path.clone(),
            mode: job.mode.as_str().to_string(),
            options: json!({}),
        };

        match self.worker.analyze(&request).await {
            Ok(outcome) => {
                let summary = AnalysisSummary::from_worker_summary(outcome.summary.as_ref());
                let envelope = ResultEnvelope::new(ResultKind::Analysis, outcome.result);
                if let Err(error) = self.results.upsert_analysis(&job.id, envelope, summary).await {
                    self.settle_failure(
                        &job,
                        "analyze",
                        AuditEventKind::AnalysisFailed,
                        "internal",
                        error.to_string(),
                    )
                    .await;
                    return;
                }

                self.apply_transition(&job, "analyze", JobEvent::WorkerSucceeded)
                    .await;
                self.audit.append_detached(
                    Some(&job.id),
                    AuditEventKind::AnalysisCompleted,
                    &json!({ "mode": job.mode.as_str() }),
                );
            }
            Err(error) => {
                self.settle_worker_failure(&job, "analyze", AuditEventKind::AnalysisFailed, &error)
                    .await;
            }
        }
    }

    /// The cleaning task body. The caller has already transitioned the job
    /// to `cleaning` and written the `cleaning_enqueued` audit event.
    pub async fn run_cleaning(&self, job: Job, requested_mode: Option<String>, rules: Vec<String>) {
        self.audit.append_detached(
            Some(&job.id),
            AuditEventKind::CleaningStarted,
            &json!({ "mode": job.mode.as_str(), "requested_mode": requested_mode }),
        );

        let request = CleanRequest {
            job_id: job.id.clone(),
            file_path: job.source_path.clone(),
            mode: job.mode.as_str().to_string(),
            rules,
            options: json!({ "cleaning_mode": requested_mode }),
        };

        match self.worker.clean(&request).await {
            Ok(outcome) => self.settle_cleaning_success(&job, outcome).await,
            Err(error) => {
                // Transition falls back to `completed`; the cleaning
                // failure must not regress the analysis outcome.
                self.settle_worker_failure(&job, "clean", AuditEventKind::CleaningFailed, &error)
                    .await;
            }
        }
    }

    async fn settle_cleaning_success(&self, job: &Job, outcome: CleaningOutcome) {
        // One audit row per applied rule, before the terminal event.
        for rule in &outcome.rules_applied {
            self.audit.append_detached(
                Some(&job.id),
                AuditEventKind::RuleApplied,
                &json!({ "rule": rule }),
            );
        }

        let summary =
            CleaningSummary::from_worker_outcome(outcome.summary.as_ref(), &outcome.rules_applied);
        let envelope = ResultEnvelope::new(
            ResultKind::Cleaning,
            json!({
                "cleaned_file_path": outcome.cleaned_file_path.clone(),
                "rules_applied": outcome.rules_applied.clone(),
                "summary": outcome.summary.clone(),
            }),
        );
        if let Err(error) = self.results.upsert_cleaning(&job.id, envelope, summary).await {
            self.settle_failure(
                job,
                "clean",
                AuditEventKind::CleaningFailed,
                "internal",
                error.to_string(),
            )
            .await;
            return;
        }

        if let Err(error) = self
            .jobs
            .set_cleaned_path(&job.id, outcome.cleaned_file_path.clone())
            .await
        {
            self.reporter.report(DelegationFailure {
                job_id: job.id.clone(),
                operation: "clean",
                classification: "internal",
                message: error.to_string(),
            });
        }

        self.apply_transition(job, "clean", JobEvent::WorkerSucceeded)
            .await;
        self.audit.append_detached(
            Some(&job.id),
            AuditEventKind::CleaningCompleted,
            &json!({
                "cleaned_file_path": outcome.cleaned_file_path,
                "rules_applied": outcome.rules_applied,
            }),
        );
    }

    async fn settle_worker_failure(
        &self,
        job: &Job,
        operation: &'static str,
        terminal_event: AuditEventKind,
        error: &WorkerClientError,
    ) {
        self.settle_failure(
            job,
            operation,
            terminal_event,
            error.classification(),
            error.to_string(),
        )
        .await;
    }

    async fn settle_failure(
        &self,
        job: &Job,
        operation: &'static str,
        terminal_event: AuditEventKind,
        classification: &'static str,
        message: String,
    ) {
        self.apply_transition(job, operation, JobEvent::WorkerFailed)
            .await;
        self.audit.append_detached(
            Some(&job.id),
            terminal_event,
            &json!({ "classification": classification, "message": message }),
        );
        self.reporter.report(DelegationFailure {
            job_id: job.id.clone(),
            operation,
            classification,
            message,
        });
    }

    /// Post-delegation transitions can legitimately fail (the job may have
    /// been deleted mid-run); that is reported, not fatal.
    async fn apply_transition(&self, job: &Job, operation: &'static str, event: JobEvent) {
        if let Err(error) = self.jobs.transition(&job.id, event).await {
            self.reporter.report(DelegationFailure {
                job_id: job.id.clone(),
                operation,
                classification: "internal",
                message: error.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use crate::audit::Database;
    use crate::config::Config;
    use crate::jobs::JobMode;

    fn delegator(
        config: &Config,
    ) -> (Delegator, mpsc::UnboundedReceiver<DelegationFailure>) {
        let (reporter, rx) = DelegationReporter::channel();
        let audit = AuditTrail::new(Database::open_in_memory().unwrap());
        let worker = WorkerClient::from_base_url(&config.worker_base_url, config.worker_timeout_ms)
            .unwrap();
        (
            Delegator {
                jobs: JobStore::from_config(config),
                results: ResultStore::from_config(config),
                audit,
                worker,
                reporter,
            },
            rx,
        )
    }

    #[tokio::test]
    async fn unreachable_worker_fails_the_job_and_reports() {
        let mut config = Config::for_tests(PathBuf::from("/tmp/unused"));
        config.job_store_path = None;
        config.result_store_path = None;
        // TCP port 9 (discard) refuses connections on loopback.
        config.worker_base_url = "http://127.0.0.1:9".to_string();

        let (delegator, mut rx) = delegator(&config);
        let job = delegator
            .jobs
            .create(
                "job_1".to_string(),
                "u1".to_string(),
                JobMode::Normal,
                "data.csv".to_string(),
                "/tmp/job_1.csv".to_string(),
            )
            .await
            .unwrap();
        let job = delegator
            .jobs
            .transition(&job.id, JobEvent::AnalysisDelegated)
            .await
            .unwrap();

        delegator.run_analysis(job).await;

        let settled = delegator.jobs.get("job_1").await.unwrap();
        assert_eq!(settled.status.as_str(), "failed");
        assert!(!delegator.results.has_analysis("job_1").await);

        let events = delegator.audit.events_for_job("job_1").unwrap();
        let kinds: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(kinds, vec!["analysis_started", "analysis_failed"]);
        assert_eq!(events[1].payload["classification"], "transport");

        let failure = rx.recv().await.unwrap();
        assert_eq!(failure.job_id, "job_1");
        assert_eq!(failure.operation, "analyze");
        assert_eq!(failure.classification, "transport");
    }

    #[tokio::test]
    async fn cleaning_failure_falls_back_to_completed() {
        let mut config = Config::for_tests(PathBuf::from("/tmp/unused"));
        config.job_store_path = None;
        config.result_store_path = None;
        config.worker_base_url = "http://127.0.0.1:9".to_string();

        let (delegator, mut rx) = delegator(&config);
        let job = delegator
            .jobs
            .create(
                "job_1".to_string(),
                "u1".to_string(),
                JobMode::Normal,
                "data.csv".to_string(),
                "/tmp/job_1.csv".to_string(),
            )
            .await
            .unwrap();
        delegator
            .jobs
            .transition(&job.id, JobEvent::AnalysisDelegated)
            .await
            .unwrap();
        delegator
            .jobs
            .transition(&job.id, JobEvent::WorkerSucceeded)
            .await
            .unwrap();
        let job = delegator
            .jobs
            .transition(&job.id, JobEvent::CleaningDelegated)
            .await
            .unwrap();

        delegator.run_cleaning(job, Some("strict".to_string()), vec![]).await;

        let settled = delegator.jobs.get("job_1").await.unwrap();
        assert_eq!(settled.status.as_str(), "completed");

        let events = delegator.audit.events_for_job("job_1").unwrap();
        let kinds: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(kinds, vec!["cleaning_started", "cleaning_failed"]);

        assert_eq!(rx.recv().await.unwrap().operation, "clean");
    }
}
