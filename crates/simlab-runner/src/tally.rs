use crate::seed::SeedState;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Seed that led to a failed attempt, kept so the draw can be replayed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSeed {
    pub replication: usize,
    pub attempt: usize,
    pub message: String,
    pub seed: SeedState,
}

/// Frequency of each distinct error and warning message within a condition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultTally {
    #[serde(default)]
    pub errors: BTreeMap<String, usize>,
    #[serde(default)]
    pub warnings: BTreeMap<String, usize>,
    #[serde(default)]
    pub error_seeds: Vec<ErrorSeed>,
}

impl FaultTally {
    pub fn record_error(&mut self, message: &str, replication: usize, attempt: usize, seed: SeedState) {
        *self.errors.entry(message.to_string()).or_default() += 1;
        self.error_seeds.push(ErrorSeed {
            replication,
            attempt,
            message: message.to_string(),
            seed,
        });
    }

    pub fn record_warning(&mut self, message: &str) {
        *self.warnings.entry(message.to_string()).or_default() += 1;
    }

    /// Fold `other` in. Callers merge in replication order.
    pub fn merge(&mut self, other: FaultTally) {
        for (k, v) in other.errors {
            *self.errors.entry(k).or_default() += v;
        }
        for (k, v) in other.warnings {
            *self.warnings.entry(k).or_default() += v;
        }
        self.error_seeds.extend(other.error_seeds);
    }

    pub fn total_errors(&self) -> usize {
        self.errors.values().sum()
    }

    pub fn total_warnings(&self) -> usize {
        self.warnings.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seed::replication_rng;

    #[test]
    fn merge_adds_counts_and_keeps_seed_order() {
        let seed = SeedState::capture(&replication_rng(1, 1));
        let mut a = FaultTally::default();
        a.record_error("singular", 1, 1, seed.clone());
        a.record_warning("slow");
        let mut b = FaultTally::default();
        b.record_error("singular", 2, 1, seed.clone());
        b.record_error("diverged", 2, 2, seed);
        b.record_warning("slow");
        a.merge(b);
        assert_eq!(a.errors.get("singular"), Some(&2));
        assert_eq!(a.errors.get("diverged"), Some(&1));
        assert_eq!(a.warnings.get("slow"), Some(&2));
        assert_eq!(a.total_errors(), 3);
        let reps: Vec<usize> = a.error_seeds.iter().map(|s| s.replication).collect();
        assert_eq!(reps, vec![1, 2, 2]);
    }
}
