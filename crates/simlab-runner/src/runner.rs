//! Run-level orchestration: resume detection, condition dispatch,
//! summarisation, checkpointing and the final table.

use crate::checkpoint::{CheckpointRecord, CheckpointStore, ConditionCheckpoint, ConditionStatus};
use crate::condition::ConditionJob;
use crate::config::{Parallelism, RunConfig};
use crate::design::{Condition, Design};
use crate::error::{Fault, FaultKind, SimError};
use crate::invoke::{invoke, Stage, StageOutcome};
use crate::paths::RunPaths;
use crate::replication::{soft_persist, ReplicationEnv};
use crate::seed::{load_seed, SeedState, SeedStore};
use crate::simulation::Simulation;
use crate::table::{condition_row, FinalTable, RunMeta};
use crate::tally::FaultTally;
use crate::value::{AnalysisValue, ResultSet};
use anyhow::{anyhow, Result};
use chrono::Utc;
use parking_lot::Mutex;
use rayon::prelude::*;
use rayon::ThreadPool;
use serde_json::{json, Value};
use simlab_core::{canonical_json_digest, write_new_unique_json};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Outcome of a completed run.
#[derive(Debug, Clone)]
pub struct SimResults {
    pub table: FinalTable,
    pub meta: RunMeta,
    /// Analysis results per condition id; empty unless `store_results`.
    pub results: BTreeMap<u64, ResultSet>,
    pub tallies: BTreeMap<u64, FaultTally>,
    pub terminations: BTreeMap<u64, Fault>,
    /// Where the final table was written.
    pub output: PathBuf,
}

impl SimResults {
    pub fn aborted(&self) -> Vec<u64> {
        self.terminations.keys().copied().collect()
    }

    /// True when no condition produced a summary row.
    pub fn all_failed(&self) -> bool {
        !self.table.is_empty() && self.terminations.len() == self.table.len()
    }

    pub fn results_for(&self, condition_id: u64) -> Option<&ResultSet> {
        self.results.get(&condition_id)
    }
}

/// One draw regenerated from a persisted seed.
#[derive(Debug)]
pub struct Replay<D> {
    pub condition_id: u64,
    pub seed: SeedState,
    pub data: D,
    pub outcome: StageOutcome<AnalysisValue>,
}

pub struct SimRunner<S: Simulation> {
    sim: S,
    design: Design,
    fixed: Value,
    config: RunConfig,
}

impl<S: Simulation> SimRunner<S> {
    pub fn new(sim: S, design: Design, config: RunConfig) -> Self {
        Self {
            sim,
            design,
            fixed: Value::Null,
            config,
        }
    }

    /// Objects passed unchanged to every stage call.
    pub fn with_fixed_objects(mut self, fixed: Value) -> Self {
        self.fixed = fixed;
        self
    }

    pub fn simulation(&self) -> &S {
        &self.sim
    }

    pub fn design(&self) -> &Design {
        &self.design
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn paths(&self) -> RunPaths {
        RunPaths::from_config(&self.config)
    }

    /// Digest of everything that changes results; a checkpoint is only
    /// resumed by a run with the same fingerprint.
    pub fn fingerprint(&self) -> String {
        canonical_json_digest(&json!({
            "design": self.design,
            "fixed_objects": self.fixed,
            "replications": self.config.effective_replications(),
            "max_errors": self.config.max_errors,
            "warnings_as_errors": self.config.warnings_as_errors,
            "seed": self.config.seed,
        }))
    }

    pub fn run(&self) -> Result<SimResults> {
        let started = Instant::now();
        let config = &self.config;
        config.validate(self.design.len())?;
        let paths = self.paths();
        let output = paths.output();
        if output.exists() {
            return Err(SimError::OutputExists(output).into());
        }
        let save = config.effective_save();
        let replications = config.effective_replications();
        let store = CheckpointStore::new(paths.checkpoint(), config.strict_persistence);
        let fingerprint = self.fingerprint();

        let mut record = match save.then(|| store.load()).transpose()?.flatten() {
            Some(existing) => {
                if let Some(reason) =
                    existing.incompatibility(&config.filename, &paths.worker_id, &fingerprint)
                {
                    return Err(SimError::CheckpointMismatch {
                        path: store.path().to_path_buf(),
                        reason,
                    }
                    .into());
                }
                info!(
                    path = %store.path().display(),
                    finished = existing.finished_count(),
                    "resuming from checkpoint"
                );
                existing
            }
            None => CheckpointRecord::new(&config.filename, &paths.worker_id, &fingerprint),
        };
        for (i, condition) in self.design.conditions().iter().enumerate() {
            let seed = config
                .seed
                .as_ref()
                .and_then(|s| s.get(i).copied())
                .unwrap_or_else(rand::random);
            record
                .conditions
                .entry(condition.id)
                .or_insert_with(|| ConditionCheckpoint::fresh(condition.id, seed));
        }
        if save {
            store.save(&mut record)?;
        }

        let loaded_seed = config.load_seed.as_deref().map(load_seed).transpose()?;
        let seed_store = config.save_seeds.then(|| SeedStore::new(paths.seeds_dir()));
        let pool = match config.parallel {
            Parallelism::Sequential => None,
            _ => Some(build_pool(config.ncores)?),
        };
        self.setup_workers(pool.as_ref())?;

        let pending: Vec<&Condition> = self
            .design
            .conditions()
            .iter()
            .filter(|c| record.conditions.get(&c.id).map_or(true, |s| !s.is_finished()))
            .collect();
        info!(
            conditions = self.design.len(),
            pending = pending.len(),
            replications,
            parallel = config.parallel.as_str(),
            worker = %paths.worker_id,
            "starting simulation"
        );

        let ctx = RunContext {
            paths: &paths,
            store: &store,
            save,
            replications,
            seed_store: seed_store.as_ref(),
            loaded_seed: loaded_seed.as_ref(),
            record: Mutex::new(record),
            halt: AtomicBool::new(false),
        };
        match (config.parallel, pool.as_ref()) {
            (Parallelism::Conditions, Some(pool)) => {
                let outcomes: Vec<Result<()>> = pool.install(|| {
                    pending
                        .par_iter()
                        .map(|c| self.run_condition(&ctx, c, None))
                        .collect()
                });
                outcomes.into_iter().collect::<Result<Vec<()>>>()?;
            }
            (_, rep_pool) => {
                for c in &pending {
                    self.run_condition(&ctx, c, rep_pool)?;
                }
            }
        }

        let record = ctx.record.into_inner();
        self.finish(&paths, &store, save, record, started)
    }

    /// Run one pending condition to completion or abort and record it.
    fn run_condition(&self, ctx: &RunContext<'_>, condition: &Condition, pool: Option<&ThreadPool>) -> Result<()> {
        if ctx.halt.load(Ordering::Acquire) {
            return Ok(());
        }
        let config = &self.config;
        let mut state = {
            let record = ctx.record.lock();
            record
                .conditions
                .get(&condition.id)
                .cloned()
                .ok_or_else(|| anyhow!("no checkpoint entry for condition {}", condition.id))?
        };
        let timer = Instant::now();
        let base_elapsed = state.elapsed_secs;
        let job = ConditionJob {
            env: ReplicationEnv {
                sim: &self.sim,
                condition,
                fixed: &self.fixed,
                max_errors: config.max_errors,
                warnings_as_errors: config.warnings_as_errors,
                seed_store: ctx.seed_store,
                data_paths: config.save_generate_data.then_some(ctx.paths),
                strict_persistence: config.strict_persistence,
            },
            replications: ctx.replications,
            pool,
            checkpoint_every: config.checkpoint_every,
            loaded_seed: ctx.loaded_seed,
        };
        let ran = job.run(&mut state, |progress| {
            let mut snapshot = progress.clone();
            snapshot.elapsed_secs = base_elapsed + timer.elapsed().as_secs_f64();
            ctx.record_progress(snapshot)
        });
        if let Err(e) = ran {
            ctx.halt.store(true, Ordering::Release);
            state.elapsed_secs = base_elapsed + timer.elapsed().as_secs_f64();
            // Keep what was completed so a fixed configuration can resume.
            if let Err(save_err) = ctx.record_progress(state) {
                warn!(error = %save_err, "could not record progress after failure");
            }
            return Err(e);
        }

        if state.status == ConditionStatus::Running {
            let results = ResultSet::new(std::mem::take(&mut state.results));
            let (summary, _) = invoke(Stage::Summarise, |_| {
                self.sim.summarise(condition, &results, &self.fixed)
            })
            .into_parts();
            state.results = results.into_inner();
            match summary {
                Ok(row) => {
                    state.summary = Some(row);
                    state.status = ConditionStatus::Completed;
                }
                Err(message) => {
                    state.termination = Some(Fault::new(FaultKind::Summarise, message));
                    state.status = ConditionStatus::Aborted;
                }
            }
        }
        state.elapsed_secs = base_elapsed + timer.elapsed().as_secs_f64();
        state.completed_at = Some(Utc::now().to_rfc3339());

        match &state.termination {
            None => info!(
                condition = condition.id,
                replications = state.completed_replications,
                errors = state.tally.total_errors(),
                warnings = state.tally.total_warnings(),
                secs = state.elapsed_secs,
                "condition completed"
            ),
            Some(fault) => warn!(
                condition = condition.id,
                completed = state.completed_replications,
                kind = %fault.kind,
                reason = %fault.message,
                "condition terminated"
            ),
        }

        if config.save_results {
            let artifact = json!({
                "condition": condition,
                "status": state.status,
                "summary": state.summary,
                "termination": state.termination,
                "tally": state.tally,
                "results": state.results,
            });
            let target = ctx.paths.results_file(condition.id);
            soft_persist(write_new_unique_json(&target, &artifact), &target, config.strict_persistence)?;
        }

        let escalate = config.stop_on_fatal && state.status == ConditionStatus::Aborted;
        let termination = state.termination.clone();
        ctx.record_progress(state)?;
        if escalate {
            ctx.halt.store(true, Ordering::Release);
            let message = termination.map(|f| f.message).unwrap_or_default();
            return Err(SimError::ConditionTerminated {
                condition_id: condition.id,
                message,
            }
            .into());
        }
        Ok(())
    }

    fn finish(
        &self,
        paths: &RunPaths,
        store: &CheckpointStore,
        save: bool,
        record: CheckpointRecord,
        started: Instant,
    ) -> Result<SimResults> {
        let mut rows = Vec::with_capacity(self.design.len());
        let mut results = BTreeMap::new();
        let mut tallies = BTreeMap::new();
        let mut terminations = BTreeMap::new();
        let mut elapsed_secs = started.elapsed().as_secs_f64();
        for condition in self.design.conditions() {
            let state = record
                .conditions
                .get(&condition.id)
                .ok_or_else(|| anyhow!("condition {} has no recorded state", condition.id))?;
            if !state.is_finished() {
                return Err(anyhow!("condition {} did not finish", condition.id));
            }
            rows.push(condition_row(condition, state));
            elapsed_secs = elapsed_secs.max(state.elapsed_secs);
            if self.config.store_results {
                results.insert(condition.id, ResultSet::new(state.results.clone()));
            }
            tallies.insert(condition.id, state.tally.clone());
            if let Some(fault) = &state.termination {
                terminations.insert(condition.id, fault.clone());
            }
        }
        let table = FinalTable::from_rows(rows);
        let meta = RunMeta {
            runner_version: env!("CARGO_PKG_VERSION").to_string(),
            worker_id: paths.worker_id.clone(),
            packages: self.config.packages.clone(),
            replications: self.config.effective_replications(),
            parallel: self.config.parallel.as_str().to_string(),
            elapsed_secs,
            aborted: terminations.keys().copied().collect(),
            created_at: Utc::now().to_rfc3339(),
        };
        let output = paths.output();
        table.write_new(&output, &meta)?;
        if save {
            store.remove()?;
            debug!(path = %store.path().display(), "checkpoint removed");
        }
        info!(
            output = %output.display(),
            conditions = table.len(),
            aborted = terminations.len(),
            "simulation finished"
        );
        Ok(SimResults {
            table,
            meta,
            results,
            tallies,
            terminations,
            output,
        })
    }

    fn setup_workers(&self, pool: Option<&ThreadPool>) -> Result<()> {
        let packages = &self.config.packages;
        let outcomes = match pool {
            Some(pool) => pool.broadcast(|_| self.sim.setup_worker(packages)),
            None => vec![self.sim.setup_worker(packages)],
        };
        for outcome in outcomes {
            outcome.map_err(|e| SimError::WorkerSetup(format!("{:#}", e)))?;
        }
        Ok(())
    }

    /// Regenerate and re-analyse one draw of `condition_id` from a seed file.
    pub fn replay(&self, condition_id: u64, seed_path: &Path) -> Result<Replay<S::Data>> {
        let condition = self
            .design
            .get(condition_id)
            .ok_or_else(|| anyhow!("condition {} is not in the design", condition_id))?;
        let seed = load_seed(seed_path)?;
        let mut rng = seed.restore()?;
        self.sim
            .setup_worker(&self.config.packages)
            .map_err(|e| SimError::WorkerSetup(format!("{:#}", e)))?;
        let (generated, _) =
            invoke(Stage::Generate, |_| self.sim.generate(condition, &self.fixed, &mut rng)).into_parts();
        let data = generated.map_err(|message| SimError::Generation {
            condition_id,
            message,
        })?;
        let outcome = invoke(Stage::Analyse, |diag| {
            self.sim.analyse(condition, &data, &self.fixed, diag)
        });
        Ok(Replay {
            condition_id,
            seed,
            data,
            outcome,
        })
    }
}

/// Convenience wrapper around [`SimRunner`].
pub fn run_simulation<S: Simulation>(sim: S, design: Design, fixed: Value, config: RunConfig) -> Result<SimResults> {
    SimRunner::new(sim, design, config)
        .with_fixed_objects(fixed)
        .run()
}

struct RunContext<'a> {
    paths: &'a RunPaths,
    store: &'a CheckpointStore,
    save: bool,
    replications: usize,
    seed_store: Option<&'a SeedStore>,
    loaded_seed: Option<&'a SeedState>,
    record: Mutex<CheckpointRecord>,
    halt: AtomicBool,
}

impl RunContext<'_> {
    fn record_progress(&self, state: ConditionCheckpoint) -> Result<()> {
        let mut record = self.record.lock();
        record.conditions.insert(state.condition_id, state);
        if self.save {
            self.store.save(&mut record)?;
        }
        Ok(())
    }
}

fn build_pool(ncores: Option<usize>) -> Result<ThreadPool> {
    let mut builder = rayon::ThreadPoolBuilder::new().thread_name(|i| format!("simlab-worker-{}", i));
    if let Some(n) = ncores {
        builder = builder.num_threads(n);
    }
    builder
        .build()
        .map_err(|e| anyhow!("failed to build worker pool: {}", e))
}
