use crate::config::RunConfig;
use std::path::{Path, PathBuf};

/// Every on-disk location a run touches, keyed by output file name and worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    pub out_dir: PathBuf,
    pub filename: String,
    pub worker_id: String,
}

impl RunPaths {
    pub fn new(out_dir: impl Into<PathBuf>, filename: impl Into<String>, worker_id: impl Into<String>) -> Self {
        Self {
            out_dir: out_dir.into(),
            filename: filename.into(),
            worker_id: worker_id.into(),
        }
    }

    pub fn from_config(config: &RunConfig) -> Self {
        Self::new(config.out_dir.clone(), config.filename.clone(), config.worker_id())
    }

    fn stem(&self) -> &str {
        Path::new(&self.filename)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("simlab-results")
    }

    /// Final aggregated table.
    pub fn output(&self) -> PathBuf {
        self.out_dir.join(&self.filename)
    }

    pub fn checkpoint(&self) -> PathBuf {
        self.out_dir
            .join(format!("SIMLAB-TEMPFILE_{}_{}.json", self.stem(), self.worker_id))
    }

    pub fn results_dir(&self) -> PathBuf {
        self.out_dir
            .join(format!("{}-results_{}", self.stem(), self.worker_id))
    }

    pub fn results_file(&self, condition_id: u64) -> PathBuf {
        self.results_dir()
            .join(format!("results-row-{}.json", condition_id))
    }

    pub fn seeds_dir(&self) -> PathBuf {
        self.out_dir
            .join(format!("{}-seeds_{}", self.stem(), self.worker_id))
    }

    pub fn generated_data_dir(&self) -> PathBuf {
        self.out_dir
            .join(format!("{}-generate-data_{}", self.stem(), self.worker_id))
    }

    pub fn generated_data_file(&self, condition_id: u64, replication: usize) -> PathBuf {
        self.generated_data_dir()
            .join(format!("design-row-{}", condition_id))
            .join(format!("data-{}.json", replication))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_derived_from_file_stem_and_worker() {
        let p = RunPaths::new("/tmp/sim", "study.json", "node1");
        assert_eq!(p.output(), PathBuf::from("/tmp/sim/study.json"));
        assert_eq!(
            p.checkpoint(),
            PathBuf::from("/tmp/sim/SIMLAB-TEMPFILE_study_node1.json")
        );
        assert_eq!(
            p.results_file(4),
            PathBuf::from("/tmp/sim/study-results_node1/results-row-4.json")
        );
        assert_eq!(
            p.generated_data_file(4, 9),
            PathBuf::from("/tmp/sim/study-generate-data_node1/design-row-4/data-9.json")
        );
        assert_eq!(p.seeds_dir(), PathBuf::from("/tmp/sim/study-seeds_node1"));
    }
}
