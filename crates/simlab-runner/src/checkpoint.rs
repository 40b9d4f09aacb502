//! Durable per-condition progress, used to resume an interrupted run.
//!
//! A run keeps exactly one checkpoint file, keyed by output file name and
//! worker id. It is rewritten atomically after each finished condition (and
//! every `checkpoint_every` replications) and removed once the final table
//! has been written.

use crate::error::{Fault, SimError};
use crate::tally::FaultTally;
use crate::value::{AnalysisResult, SummaryRow};
use anyhow::{anyhow, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use simlab_core::atomic_write_json_pretty;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const CHECKPOINT_SCHEMA_VERSION: &str = "simlab_checkpoint_v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionStatus {
    Running,
    Completed,
    Aborted,
}

impl ConditionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionStatus::Running => "running",
            ConditionStatus::Completed => "completed",
            ConditionStatus::Aborted => "aborted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionCheckpoint {
    pub condition_id: u64,
    pub seed: u64,
    pub status: ConditionStatus,
    pub completed_replications: usize,
    pub results: Vec<AnalysisResult>,
    pub tally: FaultTally,
    pub termination: Option<Fault>,
    #[serde(default, with = "crate::value::summary_cells")]
    pub summary: Option<SummaryRow>,
    pub elapsed_secs: f64,
    pub completed_at: Option<String>,
}

impl ConditionCheckpoint {
    pub fn fresh(condition_id: u64, seed: u64) -> Self {
        Self {
            condition_id,
            seed,
            status: ConditionStatus::Running,
            completed_replications: 0,
            results: Vec::new(),
            tally: FaultTally::default(),
            termination: None,
            summary: None,
            elapsed_secs: 0.0,
            completed_at: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status != ConditionStatus::Running
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub schema_version: String,
    pub filename: String,
    pub worker_id: String,
    /// Digest of the design and every setting that changes results.
    pub fingerprint: String,
    pub created_at: String,
    pub updated_at: String,
    pub conditions: BTreeMap<u64, ConditionCheckpoint>,
}

impl CheckpointRecord {
    pub fn new(filename: &str, worker_id: &str, fingerprint: &str) -> Self {
        let now = Utc::now().to_rfc3339();
        Self {
            schema_version: CHECKPOINT_SCHEMA_VERSION.to_string(),
            filename: filename.to_string(),
            worker_id: worker_id.to_string(),
            fingerprint: fingerprint.to_string(),
            created_at: now.clone(),
            updated_at: now,
            conditions: BTreeMap::new(),
        }
    }

    /// Why this record cannot be resumed by the given run, if it cannot.
    pub fn incompatibility(&self, filename: &str, worker_id: &str, fingerprint: &str) -> Option<String> {
        if self.schema_version != CHECKPOINT_SCHEMA_VERSION {
            return Some(format!("schema version {}", self.schema_version));
        }
        if self.filename != filename {
            return Some(format!("written for output '{}'", self.filename));
        }
        if self.worker_id != worker_id {
            return Some(format!("written by worker '{}'", self.worker_id));
        }
        if self.fingerprint != fingerprint {
            return Some("design or run settings changed since it was written".to_string());
        }
        None
    }

    pub fn finished_count(&self) -> usize {
        self.conditions.values().filter(|c| c.is_finished()).count()
    }
}

/// Per-condition line of [`CheckpointSummary`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConditionProgress {
    pub condition_id: u64,
    pub status: ConditionStatus,
    pub completed_replications: usize,
    pub errors: usize,
    pub warnings: usize,
    pub termination: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckpointSummary {
    pub path: PathBuf,
    pub filename: String,
    pub worker_id: String,
    pub updated_at: String,
    pub conditions: Vec<ConditionProgress>,
}

impl CheckpointSummary {
    pub fn from_record(path: &Path, record: &CheckpointRecord) -> Self {
        let conditions = record
            .conditions
            .values()
            .map(|c| ConditionProgress {
                condition_id: c.condition_id,
                status: c.status,
                completed_replications: c.completed_replications,
                errors: c.tally.total_errors(),
                warnings: c.tally.total_warnings(),
                termination: c.termination.as_ref().map(|f| f.message.clone()),
            })
            .collect();
        Self {
            path: path.to_path_buf(),
            filename: record.filename.clone(),
            worker_id: record.worker_id.clone(),
            updated_at: record.updated_at.clone(),
            conditions,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
    strict: bool,
}

impl CheckpointStore {
    /// `strict` turns write failures into errors instead of logged warnings.
    pub fn new(path: impl Into<PathBuf>, strict: bool) -> Self {
        Self {
            path: path.into(),
            strict,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn load(&self) -> Result<Option<CheckpointRecord>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&self.path)?;
        let record: CheckpointRecord = serde_json::from_slice(&bytes)
            .map_err(|e| anyhow!("corrupt checkpoint {}: {}", self.path.display(), e))?;
        Ok(Some(record))
    }

    pub fn save(&self, record: &mut CheckpointRecord) -> Result<()> {
        record.updated_at = Utc::now().to_rfc3339();
        let written = serde_json::to_value(&*record)
            .map_err(anyhow::Error::from)
            .and_then(|value| atomic_write_json_pretty(&self.path, &value));
        match written {
            Ok(()) => {
                debug!(path = %self.path.display(), finished = record.finished_count(), "checkpoint written");
                Ok(())
            }
            Err(e) if self.strict => Err(SimError::Persistence {
                path: self.path.clone(),
                message: e.to_string(),
            }
            .into()),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "checkpoint write failed; continuing");
                Ok(())
            }
        }
    }

    pub fn remove(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FaultKind;
    use crate::value::AnalysisValue;

    fn sample_record() -> CheckpointRecord {
        let mut record = CheckpointRecord::new("out.json", "w1", "sha256:abc");
        let mut running = ConditionCheckpoint::fresh(1, 11);
        running.completed_replications = 1;
        running.results.push(AnalysisResult {
            replication: 1,
            value: AnalysisValue::Scalar(0.25),
            errors: vec!["singular".to_string()],
            warnings: vec![],
        });
        running.tally.record_warning("slow");
        record.conditions.insert(1, running);
        let mut aborted = ConditionCheckpoint::fresh(2, 22);
        aborted.status = ConditionStatus::Aborted;
        aborted.termination = Some(Fault::new(FaultKind::ConsecutiveFailureLimitExceeded, "limit"));
        record.conditions.insert(2, aborted);
        record
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CheckpointStore::new(dir.path().join("ckpt.json"), true);
        assert!(store.load().expect("load").is_none());
        let mut record = sample_record();
        store.save(&mut record).expect("save");
        let loaded = store.load().expect("load").expect("present");
        assert_eq!(loaded, record);
        assert_eq!(loaded.finished_count(), 1);
        store.remove().expect("remove");
        assert!(!store.exists());
        store.remove().expect("removing twice is fine");
    }

    #[test]
    fn non_finite_summary_cells_survive_a_reload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CheckpointStore::new(dir.path().join("ckpt.json"), true);
        let mut record = sample_record();
        let mut done = ConditionCheckpoint::fresh(3, 33);
        done.status = ConditionStatus::Completed;
        done.summary = Some(SummaryRow::from([
            ("mean".to_string(), 0.5),
            ("sd".to_string(), f64::NAN),
            ("t".to_string(), f64::INFINITY),
            ("lo".to_string(), f64::NEG_INFINITY),
        ]));
        record.conditions.insert(3, done);
        store.save(&mut record).expect("save");
        let loaded = store.load().expect("load").expect("present");
        let summary = loaded.conditions[&3].summary.as_ref().expect("summary");
        let keys: Vec<&str> = summary.keys().map(|k| k.as_str()).collect();
        assert_eq!(keys, vec!["mean", "sd", "t", "lo"]);
        assert_eq!(summary["mean"], 0.5);
        assert!(summary["sd"].is_nan());
        assert_eq!(summary["t"], f64::INFINITY);
        assert_eq!(summary["lo"], f64::NEG_INFINITY);
        assert_eq!(loaded.conditions[&1], record.conditions[&1]);

        let raw: serde_json::Value =
            serde_json::from_slice(&fs::read(store.path()).expect("read")).expect("json");
        assert_eq!(raw["conditions"]["3"]["summary"]["sd"], serde_json::json!("NaN"));
    }

    #[test]
    fn incompatibility_names_the_mismatch() {
        let record = sample_record();
        assert!(record.incompatibility("out.json", "w1", "sha256:abc").is_none());
        let why = record
            .incompatibility("out.json", "w2", "sha256:abc")
            .expect("worker mismatch");
        assert!(why.contains("w1"), "{}", why);
        assert!(record.incompatibility("out.json", "w1", "sha256:def").is_some());
        assert!(record.incompatibility("other.json", "w1", "sha256:abc").is_some());
    }

    #[test]
    fn non_strict_store_swallows_write_failures() {
        let dir = tempfile::tempdir().expect("tempdir");
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"file, not a directory").expect("write");
        let target = blocker.join("ckpt.json");
        let mut record = sample_record();
        CheckpointStore::new(&target, false)
            .save(&mut record)
            .expect("lenient save must not fail");
        let err = CheckpointStore::new(&target, true)
            .save(&mut record)
            .expect_err("strict save must fail");
        assert!(matches!(
            err.downcast_ref::<SimError>(),
            Some(SimError::Persistence { .. })
        ));
    }

    #[test]
    fn summary_reports_progress_per_condition() {
        let record = sample_record();
        let summary = CheckpointSummary::from_record(Path::new("ckpt.json"), &record);
        assert_eq!(summary.conditions.len(), 2);
        assert_eq!(summary.conditions[0].completed_replications, 1);
        assert_eq!(summary.conditions[0].warnings, 1);
        assert_eq!(summary.conditions[1].status, ConditionStatus::Aborted);
        assert_eq!(summary.conditions[1].termination.as_deref(), Some("limit"));
    }
}
