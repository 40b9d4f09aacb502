//! Design table: one [`Condition`] per row.

use anyhow::{anyhow, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

/// Column used for the condition id in design files and the final table.
pub const ID_COLUMN: &str = "ID";

/// One parameter combination under simulation. Read-only once the run starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub id: u64,
    pub factors: IndexMap<String, Value>,
}

impl Condition {
    pub fn new(id: u64, factors: IndexMap<String, Value>) -> Self {
        Self { id, factors }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.factors.get(name)
    }

    pub fn f64(&self, name: &str) -> Result<f64> {
        self.get(name)
            .and_then(|v| v.as_f64())
            .ok_or_else(|| anyhow!("condition {} has no numeric factor '{}'", self.id, name))
    }

    pub fn u64(&self, name: &str) -> Result<u64> {
        self.get(name)
            .and_then(|v| v.as_u64())
            .ok_or_else(|| anyhow!("condition {} has no integer factor '{}'", self.id, name))
    }

    pub fn str(&self, name: &str) -> Result<&str> {
        self.get(name)
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("condition {} has no string factor '{}'", self.id, name))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Design {
    conditions: Vec<Condition>,
}

impl Design {
    /// Build from factor rows; ids are assigned `1..=n` in row order.
    pub fn from_rows(rows: Vec<IndexMap<String, Value>>) -> Self {
        let conditions = rows
            .into_iter()
            .enumerate()
            .map(|(i, factors)| Condition::new(i as u64 + 1, factors))
            .collect();
        Self { conditions }
    }

    pub fn from_conditions(conditions: Vec<Condition>) -> Result<Self> {
        let mut seen = BTreeSet::new();
        for c in &conditions {
            if !seen.insert(c.id) {
                return Err(anyhow!("duplicate condition id {} in design", c.id));
            }
        }
        Ok(Self { conditions })
    }

    /// Load a YAML or JSON list of factor maps. A row may carry its own `ID`.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| anyhow!("failed to read design {}: {}", path.display(), e))?;
        let rows: Vec<IndexMap<String, Value>> = serde_yaml::from_str(&raw)
            .map_err(|e| anyhow!("failed to parse design {}: {}", path.display(), e))?;
        Self::from_loaded_rows(rows)
    }

    fn from_loaded_rows(rows: Vec<IndexMap<String, Value>>) -> Result<Self> {
        let mut conditions = Vec::with_capacity(rows.len());
        for (i, mut factors) in rows.into_iter().enumerate() {
            let id = match factors.shift_remove(ID_COLUMN) {
                Some(v) => v
                    .as_u64()
                    .ok_or_else(|| anyhow!("design row {} has a non-integer ID: {}", i + 1, v))?,
                None => i as u64 + 1,
            };
            conditions.push(Condition::new(id, factors));
        }
        Self::from_conditions(conditions)
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn get(&self, id: u64) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.id == id)
    }

    pub fn len(&self) -> usize {
        self.conditions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn factor_names(&self) -> Vec<String> {
        let mut names: IndexMap<String, ()> = IndexMap::new();
        for c in &self.conditions {
            for k in c.factors.keys() {
                names.insert(k.clone(), ());
            }
        }
        names.into_keys().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rows_get_sequential_ids() {
        let mut a = IndexMap::new();
        a.insert("N".to_string(), json!(10));
        let mut b = IndexMap::new();
        b.insert("N".to_string(), json!(20));
        let design = Design::from_rows(vec![a, b]);
        let ids: Vec<u64> = design.conditions().iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(design.get(2).expect("row 2").u64("N").expect("N"), 20);
    }

    #[test]
    fn loaded_rows_honour_explicit_ids_and_reject_duplicates() {
        let rows: Vec<IndexMap<String, Value>> =
            serde_yaml::from_str("- {ID: 7, N: 5, dist: normal}\n- {N: 10, dist: skewed}\n")
                .expect("yaml");
        let design = Design::from_loaded_rows(rows).expect("design");
        assert_eq!(design.conditions()[0].id, 7);
        assert_eq!(design.conditions()[1].id, 2);
        assert!(design.conditions()[0].get(ID_COLUMN).is_none());
        assert_eq!(design.conditions()[1].str("dist").expect("dist"), "skewed");
        assert_eq!(design.factor_names(), vec!["N".to_string(), "dist".to_string()]);

        let dup: Vec<IndexMap<String, Value>> =
            serde_yaml::from_str("- {ID: 1, N: 5}\n- {ID: 1, N: 10}\n").expect("yaml");
        let err = Design::from_loaded_rows(dup).expect_err("duplicate ids");
        assert!(err.to_string().contains("duplicate condition id 1"));
    }

    #[test]
    fn missing_factor_is_an_error() {
        let design = Design::from_rows(vec![IndexMap::new()]);
        let err = design.conditions()[0].f64("sigma").expect_err("missing");
        assert!(err.to_string().contains("sigma"));
    }
}
