//! The final design + results table.

use crate::checkpoint::{ConditionCheckpoint, ConditionStatus};
use crate::design::{Condition, ID_COLUMN};
use crate::error::SimError;
use anyhow::Result;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fs;
use std::io::Write;
use std::path::Path;

pub const TABLE_SCHEMA_VERSION: &str = "simlab_results_v1";
pub const REPLICATIONS_COLUMN: &str = "REPLICATIONS";
pub const SIM_TIME_COLUMN: &str = "SIM_TIME";
pub const SEED_COLUMN: &str = "SEED";
pub const COMPLETED_COLUMN: &str = "COMPLETED";
pub const TERMINATED_COLUMN: &str = "TERMINATED";
pub const ERROR_PREFIX: &str = "ERROR: ";
pub const WARNING_PREFIX: &str = "WARNING: ";

pub type TableRow = IndexMap<String, Value>;

/// Build the table row for a finished condition.
pub fn condition_row(condition: &Condition, state: &ConditionCheckpoint) -> TableRow {
    let mut row = TableRow::new();
    row.insert(ID_COLUMN.to_string(), json!(condition.id));
    for (k, v) in &condition.factors {
        row.insert(k.clone(), v.clone());
    }
    if state.status == ConditionStatus::Completed {
        if let Some(summary) = &state.summary {
            for (k, v) in summary {
                let cell = serde_json::Number::from_f64(*v)
                    .map(Value::Number)
                    .unwrap_or(Value::Null);
                row.insert(k.clone(), cell);
            }
        }
    }
    row.insert(REPLICATIONS_COLUMN.to_string(), json!(state.completed_replications));
    row.insert(SIM_TIME_COLUMN.to_string(), json!(state.elapsed_secs));
    row.insert(SEED_COLUMN.to_string(), json!(state.seed));
    row.insert(COMPLETED_COLUMN.to_string(), json!(state.completed_at));
    row.insert(
        TERMINATED_COLUMN.to_string(),
        json!(state.termination.as_ref().map(|f| f.message.clone())),
    );
    for (msg, n) in &state.tally.errors {
        row.insert(format!("{}{}", ERROR_PREFIX, msg), json!(n));
    }
    for (msg, n) in &state.tally.warnings {
        row.insert(format!("{}{}", WARNING_PREFIX, msg), json!(n));
    }
    row
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMeta {
    pub runner_version: String,
    pub worker_id: String,
    pub packages: Vec<String>,
    pub replications: usize,
    pub parallel: String,
    pub elapsed_secs: f64,
    pub aborted: Vec<u64>,
    pub created_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FinalTable {
    pub columns: Vec<String>,
    pub rows: Vec<TableRow>,
}

impl FinalTable {
    /// Columns are the ordered union over rows, with the `ERROR: ` and then
    /// `WARNING: ` count columns last. Cells a row lacks are filled with null.
    pub fn from_rows(rows: Vec<TableRow>) -> Self {
        let mut base: IndexMap<String, ()> = IndexMap::new();
        let mut errors: Vec<String> = Vec::new();
        let mut warnings: Vec<String> = Vec::new();
        for row in &rows {
            for k in row.keys() {
                if k.starts_with(ERROR_PREFIX) {
                    if !errors.contains(k) {
                        errors.push(k.clone());
                    }
                } else if k.starts_with(WARNING_PREFIX) {
                    if !warnings.contains(k) {
                        warnings.push(k.clone());
                    }
                } else {
                    base.insert(k.clone(), ());
                }
            }
        }
        errors.sort();
        warnings.sort();
        let columns: Vec<String> = base.into_keys().chain(errors).chain(warnings).collect();
        let rows = rows
            .into_iter()
            .map(|row| {
                columns
                    .iter()
                    .map(|c| (c.clone(), row.get(c).cloned().unwrap_or(Value::Null)))
                    .collect()
            })
            .collect();
        Self { columns, rows }
    }

    pub fn row(&self, id: u64) -> Option<&TableRow> {
        self.rows
            .iter()
            .find(|r| r.get(ID_COLUMN).and_then(|v| v.as_u64()) == Some(id))
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Copy of the table without the columns that vary between identical runs.
    pub fn without_timing(&self) -> FinalTable {
        let drop = [SIM_TIME_COLUMN, COMPLETED_COLUMN];
        FinalTable {
            columns: self
                .columns
                .iter()
                .filter(|c| !drop.contains(&c.as_str()))
                .cloned()
                .collect(),
            rows: self
                .rows
                .iter()
                .map(|r| {
                    r.iter()
                        .filter(|(k, _)| !drop.contains(&k.as_str()))
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect()
                })
                .collect(),
        }
    }

    pub fn to_document(&self, meta: &RunMeta) -> Value {
        json!({
            "schema_version": TABLE_SCHEMA_VERSION,
            "columns": self.columns,
            "rows": self.rows,
            "meta": meta,
        })
    }

    /// Write the table to `path`. An existing file is never replaced.
    pub fn write_new(&self, path: &Path, meta: &RunMeta) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(&self.to_document(meta))?;
        if let Some(parent) = path.parent() {
            simlab_core::ensure_dir(parent)?;
        }
        let mut file = match fs::OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(SimError::OutputExists(path.to_path_buf()).into())
            }
            Err(e) => return Err(e.into()),
        };
        file.write_all(&bytes)?;
        file.sync_all()?;
        Ok(())
    }

    /// Read a table written by [`FinalTable::write_new`].
    pub fn load(path: &Path) -> Result<(FinalTable, RunMeta)> {
        #[derive(Deserialize)]
        struct Document {
            columns: Vec<String>,
            rows: Vec<TableRow>,
            meta: RunMeta,
        }
        let doc: Document = serde_json::from_slice(&fs::read(path)?)?;
        Ok((
            FinalTable {
                columns: doc.columns,
                rows: doc.rows,
            },
            doc.meta,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Fault, FaultKind};

    fn condition(id: u64, n: u64) -> Condition {
        let mut f = IndexMap::new();
        f.insert("N".to_string(), json!(n));
        Condition::new(id, f)
    }

    #[test]
    fn completed_row_carries_summary_and_counts() {
        let c = condition(1, 30);
        let mut s = ConditionCheckpoint::fresh(1, 77);
        s.status = ConditionStatus::Completed;
        s.completed_replications = 100;
        let mut summary = IndexMap::new();
        summary.insert("bias".to_string(), 0.01);
        s.summary = Some(summary);
        s.tally.record_warning("slow");
        let row = condition_row(&c, &s);
        let keys: Vec<&str> = row.keys().map(|k| k.as_str()).collect();
        assert_eq!(
            keys,
            vec!["ID", "N", "bias", "REPLICATIONS", "SIM_TIME", "SEED", "COMPLETED", "TERMINATED", "WARNING: slow"]
        );
        assert_eq!(row["SEED"], json!(77));
        assert_eq!(row["TERMINATED"], Value::Null);
    }

    #[test]
    fn aborted_row_has_no_summary_but_a_reason() {
        let c = condition(2, 10);
        let mut s = ConditionCheckpoint::fresh(2, 1);
        s.status = ConditionStatus::Aborted;
        s.summary = Some(IndexMap::from([("bias".to_string(), 1.0)]));
        s.termination = Some(Fault::new(FaultKind::ConsecutiveFailureLimitExceeded, "limit hit"));
        let row = condition_row(&c, &s);
        assert!(row.get("bias").is_none());
        assert_eq!(row["TERMINATED"], json!("limit hit"));
    }

    #[test]
    fn union_columns_fill_gaps_and_put_counts_last() {
        let mut a = TableRow::new();
        a.insert("ID".into(), json!(1));
        a.insert("ERROR: b".into(), json!(2));
        a.insert("bias".into(), json!(0.1));
        let mut b = TableRow::new();
        b.insert("ID".into(), json!(2));
        b.insert("WARNING: w".into(), json!(1));
        b.insert("ERROR: a".into(), json!(3));
        b.insert("TERMINATED".into(), json!("x"));
        let t = FinalTable::from_rows(vec![a, b]);
        assert_eq!(t.columns, vec!["ID", "bias", "TERMINATED", "ERROR: a", "ERROR: b", "WARNING: w"]);
        assert_eq!(t.row(1).expect("row 1")["ERROR: a"], Value::Null);
        assert_eq!(t.row(2).expect("row 2")["bias"], Value::Null);
        assert_eq!(t.rows[0].len(), t.columns.len());
    }

    #[test]
    fn write_new_refuses_to_overwrite() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.json");
        let t = FinalTable::from_rows(vec![]);
        let meta = RunMeta {
            runner_version: "test".into(),
            worker_id: "w".into(),
            packages: vec![],
            replications: 1,
            parallel: "sequential".into(),
            elapsed_secs: 0.0,
            aborted: vec![],
            created_at: "now".into(),
        };
        t.write_new(&path, &meta).expect("first write");
        let err = t.write_new(&path, &meta).expect_err("second write");
        assert!(matches!(err.downcast_ref::<SimError>(), Some(SimError::OutputExists(_))));
        let (loaded, loaded_meta) = FinalTable::load(&path).expect("load");
        assert_eq!(loaded, t);
        assert_eq!(loaded_meta, meta);
    }
}
