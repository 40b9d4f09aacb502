//! Runs all replications of one condition, sequentially or on a worker pool.

use crate::checkpoint::{ConditionCheckpoint, ConditionStatus};
use crate::replication::{run_replication, ReplicationEnv, ReplicationOutcome};
use crate::seed::{replication_rng, SeedState, SimRng};
use crate::simulation::Simulation;
use anyhow::Result;
use rayon::prelude::*;
use rayon::ThreadPool;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info};

pub(crate) struct ConditionJob<'a, S: Simulation> {
    pub env: ReplicationEnv<'a, S>,
    pub replications: usize,
    /// Dispatch replications on this pool; `None` runs them in order here.
    pub pool: Option<&'a ThreadPool>,
    pub checkpoint_every: Option<usize>,
    /// Replay state for the first attempt of replication 1.
    pub loaded_seed: Option<&'a SeedState>,
}

impl<'a, S: Simulation> ConditionJob<'a, S> {
    fn rng_for(&self, condition_seed: u64, replication: usize) -> Result<SimRng> {
        match self.loaded_seed {
            Some(state) if replication == 1 => state.restore(),
            _ => Ok(replication_rng(condition_seed, replication)),
        }
    }

    /// Continue `state` from its completed count up to `replications`.
    ///
    /// Results are folded into `state` in replication order. On a fatal
    /// replication the condition is marked aborted and nothing after that
    /// index is kept. `on_progress` is called at every mid-condition
    /// checkpoint boundary.
    pub fn run<F>(&self, state: &mut ConditionCheckpoint, mut on_progress: F) -> Result<()>
    where
        F: FnMut(&ConditionCheckpoint) -> Result<()>,
    {
        let start = state.completed_replications + 1;
        if start > self.replications {
            return Ok(());
        }
        debug!(
            condition = state.condition_id,
            from = start,
            to = self.replications,
            parallel = self.pool.is_some(),
            "running replications"
        );
        match self.pool {
            Some(pool) => self.run_pooled(pool, state, start, &mut on_progress),
            None => self.run_sequential(state, start, &mut on_progress),
        }
    }

    fn run_sequential<F>(&self, state: &mut ConditionCheckpoint, start: usize, on_progress: &mut F) -> Result<()>
    where
        F: FnMut(&ConditionCheckpoint) -> Result<()>,
    {
        for r in start..=self.replications {
            let rng = self.rng_for(state.seed, r)?;
            let outcome = run_replication(&self.env, r, rng)?;
            if !absorb(state, r, outcome) {
                return Ok(());
            }
            if let Some(every) = self.checkpoint_every {
                if r % every == 0 && r < self.replications {
                    on_progress(state)?;
                }
            }
        }
        Ok(())
    }

    fn run_pooled<F>(
        &self,
        pool: &ThreadPool,
        state: &mut ConditionCheckpoint,
        start: usize,
        on_progress: &mut F,
    ) -> Result<()>
    where
        F: FnMut(&ConditionCheckpoint) -> Result<()>,
    {
        let chunk = self.checkpoint_every.unwrap_or(self.replications).max(1);
        let condition_seed = state.seed;
        let mut next = start;
        while next <= self.replications {
            let end = (next + chunk - 1).min(self.replications);
            // Lowest index that ended the condition; later indices are skipped.
            let stop_at = AtomicUsize::new(usize::MAX);
            let outcomes: Vec<Option<Result<ReplicationOutcome>>> = pool.install(|| {
                (next..=end)
                    .into_par_iter()
                    .map(|r| {
                        if r > stop_at.load(Ordering::Acquire) {
                            return None;
                        }
                        let outcome = self
                            .rng_for(condition_seed, r)
                            .and_then(|rng| run_replication(&self.env, r, rng));
                        if !matches!(outcome, Ok(ReplicationOutcome::Success { .. })) {
                            stop_at.fetch_min(r, Ordering::AcqRel);
                        }
                        Some(outcome)
                    })
                    .collect()
            });
            for (r, outcome) in (next..=end).zip(outcomes) {
                let Some(outcome) = outcome else {
                    break;
                };
                if !absorb(state, r, outcome?) {
                    return Ok(());
                }
            }
            if self.checkpoint_every.is_some() && end < self.replications {
                on_progress(state)?;
            }
            next = end + 1;
        }
        Ok(())
    }
}

/// Fold one outcome into the condition state. Returns false once aborted.
fn absorb(state: &mut ConditionCheckpoint, replication: usize, outcome: ReplicationOutcome) -> bool {
    match outcome {
        ReplicationOutcome::Success { result, tally } => {
            state.results.push(result);
            state.tally.merge(tally);
            state.completed_replications = replication;
            true
        }
        ReplicationOutcome::Fatal { fault, tally } => {
            state.tally.merge(tally);
            info!(
                condition = state.condition_id,
                completed = state.completed_replications,
                kind = %fault.kind,
                "condition aborted"
            );
            state.termination = Some(fault);
            state.status = ConditionStatus::Aborted;
            false
        }
    }
}
