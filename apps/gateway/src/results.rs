//! Worker output persistence, keyed 1:1 by job id.
//!
//! Payloads are stored as versioned tagged envelopes instead of raw blobs:
//! consumers decode by `kind` and fail explicitly on an unexpected shape
//! rather than silently accepting arbitrary structure.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::config::Config;
use crate::jobs::persist_json_state;

pub const RESULT_SCHEMA_VERSION: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultKind {
    Analysis,
    Cleaning,
}

impl ResultKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Analysis => "analysis",
            Self::Cleaning => "cleaning",
        }
    }
}

/// Versioned envelope around a worker-defined payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub schema_version: u16,
    pub kind: ResultKind,
    pub body: Value,
}

#[derive(Debug, Error)]
pub enum ResultDecodeError {
    #[error("unsupported result schema version {found} (supported: {supported})")]
    UnsupportedVersion { found: u16, supported: u16 },
    #[error("unexpected result kind {found} (expected {expected})")]
    UnexpectedKind {
        found: &'static str,
        expected: &'static str,
    },
}

impl ResultEnvelope {
    #[must_use]
    pub fn new(kind: ResultKind, body: Value) -> Self {
        Self {
            schema_version: RESULT_SCHEMA_VERSION,
            kind,
            body,
        }
    }

    /// Kind-driven decode: returns the body only if the envelope carries
    /// the expected kind at a supported schema version.
    pub fn decode(&self, expected: ResultKind) -> Result<&Value, ResultDecodeError> {
        if self.schema_version != RESULT_SCHEMA_VERSION {
            return Err(ResultDecodeError::UnsupportedVersion {
                found: self.schema_version,
                supported: RESULT_SCHEMA_VERSION,
            });
        }
        if self.kind != expected {
            return Err(ResultDecodeError::UnexpectedKind {
                found: self.kind.as_str(),
                expected: expected.as_str(),
            });
        }
        Ok(&self.body)
    }
}

/// Typed summary reported alongside an analysis payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisSummary {
    pub analysis_kind: Option<String>,
    pub row_count: Option<u64>,
}

impl AnalysisSummary {
    /// Extracted from the worker's optional free-form summary.
    #[must_use]
    pub fn from_worker_summary(summary: Option<&Value>) -> Self {
        let Some(summary) = summary else {
            return Self::default();
        };
        Self {
            analysis_kind: summary
                .get("analysis_kind")
                .and_then(Value::as_str)
                .map(str::to_string),
            row_count: summary.get("row_count").and_then(Value::as_u64),
        }
    }
}

/// Typed summary reported alongside a cleaning payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CleaningSummary {
    pub rows_removed: Option<u64>,
    pub rules_applied: Vec<String>,
}

impl CleaningSummary {
    #[must_use]
    pub fn from_worker_outcome(summary: Option<&Value>, rules_applied: &[String]) -> Self {
        Self {
            rows_removed: summary
                .and_then(|value| value.get("rows_removed"))
                .and_then(Value::as_u64),
            rules_applied: rules_applied.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub job_id: String,
    pub envelope: ResultEnvelope,
    pub summary: AnalysisSummary,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleaningRecord {
    pub job_id: String,
    pub envelope: ResultEnvelope,
    pub summary: CleaningSummary,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum ResultStoreError {
    #[error("{message}")]
    Persistence { message: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct ResultStoreState {
    analysis: HashMap<String, AnalysisRecord>,
    cleaning: HashMap<String, CleaningRecord>,
}

#[derive(Clone)]
pub struct ResultStore {
    state: Arc<RwLock<ResultStoreState>>,
    path: Option<PathBuf>,
}

impl ResultStore {
    pub fn from_config(config: &Config) -> Self {
        let path = config.result_store_path.clone();
        let state = load_state(path.as_deref());
        Self {
            state: Arc::new(RwLock::new(state)),
            path,
        }
    }

    /// Idempotent upsert: at most one live analysis result per job id;
    /// a replay replaces the payload and keeps the original `created_at`.
    pub async fn upsert_analysis(
        &self,
        job_id: &str,
        envelope: ResultEnvelope,
        summary: AnalysisSummary,
    ) -> Result<AnalysisRecord, ResultStoreError> {
        let now = Utc::now();
        let (record, snapshot) = {
            let mut state = self.state.write().await;
            let created_at = state
                .analysis
                .get(job_id)
                .map_or(now, |existing| existing.created_at);
            let record = AnalysisRecord {
                job_id: job_id.to_string(),
                envelope,
                summary,
                created_at,
                updated_at: now,
            };
            state.analysis.insert(job_id.to_string(), record.clone());
            (record, state.clone())
        };
        self.persist(&snapshot).await?;
        Ok(record)
    }

    pub async fn upsert_cleaning(
        &self,
        job_id: &str,
        envelope: ResultEnvelope,
        summary: CleaningSummary,
    ) -> Result<CleaningRecord, ResultStoreError> {
        let now = Utc::now();
        let (record, snapshot) = {
            let mut state = self.state.write().await;
            let created_at = state
                .cleaning
                .get(job_id)
                .map_or(now, |existing| existing.created_at);
            let record = CleaningRecord {
                job_id: job_id.to_string(),
                envelope,
                summary,
                created_at,
                updated_at: now,
            };
            state.cleaning.insert(job_id.to_string(), record.clone());
            (record, state.clone())
        };
        self.persist(&snapshot).await?;
        Ok(record)
    }

    pub async fn analysis_for(&self, job_id: &str) -> Option<AnalysisRecord> {
        self.state.read().await.analysis.get(job_id).cloned()
    }

    pub async fn cleaning_for(&self, job_id: &str) -> Option<CleaningRecord> {
        self.state.read().await.cleaning.get(job_id).cloned()
    }

    pub async fn has_analysis(&self, job_id: &str) -> bool {
        self.state.read().await.analysis.contains_key(job_id)
    }

    pub async fn has_cleaning(&self, job_id: &str) -> bool {
        self.state.read().await.cleaning.contains_key(job_id)
    }

    /// Drops both result records for a job. Idempotent.
    pub async fn delete_for_job(&self, job_id: &str) -> Result<(), ResultStoreError> {
        let (changed, snapshot) = {
            let mut state = self.state.write().await;
            let removed_analysis = state.analysis.remove(job_id).is_some();
            let removed_cleaning = state.cleaning.remove(job_id).is_some();
            (removed_analysis || removed_cleaning, state.clone())
        };
        if changed {
            self.persist(&snapshot).await?;
        }
        Ok(())
    }

    async fn persist(&self, state: &ResultStoreState) -> Result<(), ResultStoreError> {
        persist_json_state(self.path.as_deref(), state)
            .await
            .map_err(|message| ResultStoreError::Persistence { message })
    }
}

fn load_state(path: Option<&std::path::Path>) -> ResultStoreState {
    let Some(path) = path else {
        return ResultStoreState::default();
    };

    let raw = match std::fs::read_to_string(path) {
        Ok(value) => value,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            return ResultStoreState::default();
        }
        Err(error) => {
            tracing::warn!(
                target: "datawash.results",
                path = %path.display(),
                error = %error,
                "failed to read result store; booting with empty state",
            );
            return ResultStoreState::default();
        }
    };

    match serde_json::from_str::<ResultStoreState>(&raw) {
        Ok(state) => state,
        Err(error) => {
            tracing::warn!(
                target: "datawash.results",
                path = %path.display(),
                error = %error,
                "failed to parse result store; booting with empty state",
            );
            ResultStoreState::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> ResultStore {
        ResultStore {
            state: Arc::new(RwLock::new(ResultStoreState::default())),
            path: None,
        }
    }

    #[tokio::test]
    async fn upsert_replaces_rather_than_appends() {
        let store = store();
        store
            .upsert_analysis(
                "job_1",
                ResultEnvelope::new(ResultKind::Analysis, json!({"quality_report": {"v": 1}})),
                AnalysisSummary::default(),
            )
            .await
            .unwrap();
        let replaced = store
            .upsert_analysis(
                "job_1",
                ResultEnvelope::new(ResultKind::Analysis, json!({"quality_report": {"v": 2}})),
                AnalysisSummary::default(),
            )
            .await
            .unwrap();

        let stored = store.analysis_for("job_1").await.unwrap();
        assert_eq!(stored.envelope.body["quality_report"]["v"], 2);
        assert_eq!(stored.created_at, replaced.created_at);
        assert!(store.has_analysis("job_1").await);
    }

    #[tokio::test]
    async fn delete_for_job_drops_both_kinds_and_is_idempotent() {
        let store = store();
        store
            .upsert_analysis(
                "job_1",
                ResultEnvelope::new(ResultKind::Analysis, json!({})),
                AnalysisSummary::default(),
            )
            .await
            .unwrap();
        store
            .upsert_cleaning(
                "job_1",
                ResultEnvelope::new(ResultKind::Cleaning, json!({})),
                CleaningSummary::default(),
            )
            .await
            .unwrap();

        store.delete_for_job("job_1").await.unwrap();
        assert!(!store.has_analysis("job_1").await);
        assert!(!store.has_cleaning("job_1").await);

        store.delete_for_job("job_1").await.unwrap();
    }

    #[test]
    fn decode_rejects_wrong_kind_and_version() {
        let envelope = ResultEnvelope::new(ResultKind::Analysis, json!({"ok": true}));
        assert!(envelope.decode(ResultKind::Analysis).is_ok());
        assert!(matches!(
            envelope.decode(ResultKind::Cleaning),
            Err(ResultDecodeError::UnexpectedKind { .. })
        ));

        let future = ResultEnvelope {
            schema_version: 99,
            kind: ResultKind::Analysis,
            body: json!({}),
        };
        assert!(matches!(
            future.decode(ResultKind::Analysis),
            Err(ResultDecodeError::UnsupportedVersion { .. })
        ));
    }

    #[test]
    fn summaries_extract_known_fields_only() {
        let summary = AnalysisSummary::from_worker_summary(Some(&json!({
            "analysis_kind": "descriptive",
            "row_count": 42,
            "unknown_field": true,
        })));
        assert_eq!(summary.analysis_kind.as_deref(), Some("descriptive"));
        assert_eq!(summary.row_count, Some(42));

        let cleaning = CleaningSummary::from_worker_outcome(
            Some(&json!({"rows_removed": 7})),
            &["trim_whitespace".to_string()],
        );
        assert_eq!(cleaning.rows_removed, Some(7));
        assert_eq!(cleaning.rules_applied, vec!["trim_whitespace"]);
    }
}
