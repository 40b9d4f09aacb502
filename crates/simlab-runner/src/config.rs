use crate::error::SimError;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_MAX_ERRORS: usize = 50;
pub const DEFAULT_REPLICATIONS: usize = 100;
pub const DEFAULT_FILENAME: &str = "simlab-results.json";

/// Unit of work handed to the worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parallelism {
    #[default]
    Sequential,
    Replications,
    Conditions,
}

impl Parallelism {
    pub fn as_str(&self) -> &'static str {
        match self {
            Parallelism::Sequential => "sequential",
            Parallelism::Replications => "replications",
            Parallelism::Conditions => "conditions",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub replications: usize,
    pub max_errors: usize,
    pub save: bool,
    pub save_results: bool,
    pub save_seeds: bool,
    pub save_generate_data: bool,
    pub load_seed: Option<PathBuf>,
    pub filename: String,
    pub out_dir: PathBuf,
    /// One seed per design row, in design order.
    pub seed: Option<Vec<u64>>,
    pub warnings_as_errors: bool,
    pub packages: Vec<String>,
    pub parallel: Parallelism,
    pub ncores: Option<usize>,
    pub checkpoint_every: Option<usize>,
    pub stop_on_fatal: bool,
    pub strict_persistence: bool,
    pub store_results: bool,
    pub worker_id: Option<String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            replications: DEFAULT_REPLICATIONS,
            max_errors: DEFAULT_MAX_ERRORS,
            save: true,
            save_results: false,
            save_seeds: false,
            save_generate_data: false,
            load_seed: None,
            filename: DEFAULT_FILENAME.to_string(),
            out_dir: PathBuf::from("."),
            seed: None,
            warnings_as_errors: false,
            packages: Vec::new(),
            parallel: Parallelism::Sequential,
            ncores: None,
            checkpoint_every: None,
            stop_on_fatal: false,
            strict_persistence: false,
            store_results: true,
            worker_id: None,
        }
    }
}

impl RunConfig {
    pub fn with_replications(mut self, replications: usize) -> Self {
        self.replications = replications;
        self
    }

    /// Load from YAML or JSON (JSON is a YAML subset). Missing keys take defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| anyhow!("failed to read config {}: {}", path.display(), e))?;
        let config: RunConfig = serde_yaml::from_str(&raw)
            .map_err(|e| anyhow!("failed to parse config {}: {}", path.display(), e))?;
        Ok(config)
    }

    /// `save_results` needs the checkpoint to know which rows were written.
    pub fn effective_save(&self) -> bool {
        (self.save || self.save_results) && self.load_seed.is_none()
    }

    pub fn effective_replications(&self) -> usize {
        if self.load_seed.is_some() {
            1
        } else {
            self.replications
        }
    }

    /// Execution-context identifier used to key persisted artifacts.
    pub fn worker_id(&self) -> String {
        if let Some(id) = self.worker_id.as_deref().filter(|s| !s.trim().is_empty()) {
            return sanitize_component(id);
        }
        std::env::var("HOSTNAME")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(|s| sanitize_component(&s))
            .unwrap_or_else(|| "localhost".to_string())
    }

    pub fn validate(&self, design_len: usize) -> Result<(), SimError> {
        let mut problems = Vec::new();
        if self.replications == 0 {
            problems.push("replications must be a positive integer".to_string());
        }
        if self.max_errors == 0 {
            problems.push("max_errors must be a positive integer".to_string());
        }
        if self.filename.trim().is_empty() {
            problems.push("filename must not be empty".to_string());
        }
        if self.ncores == Some(0) {
            problems.push("ncores must be positive when set".to_string());
        }
        if self.checkpoint_every == Some(0) {
            problems.push("checkpoint_every must be positive when set".to_string());
        }
        if let Some(seeds) = &self.seed {
            if seeds.len() != design_len {
                problems.push(format!(
                    "seed has {} entries but the design has {} conditions",
                    seeds.len(),
                    design_len
                ));
            }
        }
        if self.load_seed.is_some() && design_len != 1 {
            problems.push(format!(
                "load_seed replays a single condition but the design has {}",
                design_len
            ));
        }
        if design_len == 0 {
            problems.push("design has no conditions".to_string());
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(SimError::InvalidConfig(problems.join("; ")))
        }
    }
}

fn sanitize_component(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = RunConfig::default();
        assert_eq!(c.max_errors, 50);
        assert!(c.save);
        assert!(!c.save_results);
        assert_eq!(c.filename, "simlab-results.json");
        assert_eq!(c.parallel, Parallelism::Sequential);
    }

    #[test]
    fn yaml_fills_missing_fields_with_defaults() {
        let c: RunConfig = serde_yaml::from_str(
            "replications: 250\nparallel: replications\nseed: [1, 2]\nworker_id: node a\n",
        )
        .expect("parse");
        assert_eq!(c.replications, 250);
        assert_eq!(c.parallel, Parallelism::Replications);
        assert_eq!(c.seed, Some(vec![1, 2]));
        assert_eq!(c.max_errors, DEFAULT_MAX_ERRORS);
        assert_eq!(c.worker_id(), "node_a");
    }

    #[test]
    fn save_results_forces_save() {
        let c = RunConfig {
            save: false,
            save_results: true,
            ..RunConfig::default()
        };
        assert!(c.effective_save());
    }

    #[test]
    fn load_seed_forces_single_unsaved_replication() {
        let c = RunConfig {
            load_seed: Some(PathBuf::from("seed-1.json")),
            ..RunConfig::default()
        };
        assert!(!c.effective_save());
        assert_eq!(c.effective_replications(), 1);
        assert!(c.validate(1).is_ok());
        assert!(c.validate(2).is_err());
    }

    #[test]
    fn validate_reports_every_problem() {
        let c = RunConfig {
            replications: 0,
            max_errors: 0,
            seed: Some(vec![1]),
            ncores: Some(0),
            ..RunConfig::default()
        };
        let msg = c.validate(3).expect_err("invalid").to_string();
        assert!(msg.contains("replications"), "{}", msg);
        assert!(msg.contains("max_errors"), "{}", msg);
        assert!(msg.contains("seed has 1 entries"), "{}", msg);
        assert!(msg.contains("ncores"), "{}", msg);
    }
}
