//! Drives one replication to a valid result or a fatal outcome.
//!
//! ```text
//! Generate -> Analyse -> Validate -> Success
//!    ^                      |
//!    +------- Retry <-------+   (analysis fault or missing values)
//!               |
//!               +-> Fatal     (max_errors consecutive failures)
//! ```
//!
//! A retry always regenerates: the failed draw is discarded and the next
//! attempt continues the replication's random stream.

use crate::design::Condition;
use crate::error::{Fault, FaultKind, SimError};
use crate::invoke::{invoke, Stage};
use crate::paths::RunPaths;
use crate::seed::{SeedState, SeedStore, SimRng};
use crate::simulation::Simulation;
use crate::tally::FaultTally;
use crate::value::{AnalysisResult, AnalysisValue};
use anyhow::Result;
use serde_json::Value;
use simlab_core::write_new_unique_json;
use std::path::Path;
use tracing::{debug, warn};

/// Everything a replication needs that does not change between replications.
pub(crate) struct ReplicationEnv<'a, S: Simulation> {
    pub sim: &'a S,
    pub condition: &'a Condition,
    pub fixed: &'a Value,
    pub max_errors: usize,
    pub warnings_as_errors: bool,
    pub seed_store: Option<&'a SeedStore>,
    /// Set when generated data is persisted.
    pub data_paths: Option<&'a RunPaths>,
    pub strict_persistence: bool,
}

#[derive(Debug)]
pub(crate) enum ReplicationOutcome {
    Success { result: AnalysisResult, tally: FaultTally },
    Fatal { fault: Fault, tally: FaultTally },
}

enum Step<D> {
    Generate,
    Analyse(D),
    Validate {
        value: AnalysisValue,
        warnings: Vec<String>,
    },
    Retry(Fault),
}

/// Run replication `replication` from `rng`.
///
/// `Err` is reserved for run-level failures: a generation fault, or a
/// persistence failure under strict persistence.
pub(crate) fn run_replication<S: Simulation>(
    env: &ReplicationEnv<'_, S>,
    replication: usize,
    mut rng: SimRng,
) -> Result<ReplicationOutcome> {
    let condition_id = env.condition.id;
    let mut tally = FaultTally::default();
    let mut history: Vec<String> = Vec::new();
    let mut attempt = 0usize;
    let mut consecutive = 0usize;
    let mut seed = SeedState::capture(&rng);
    let mut step: Step<S::Data> = Step::Generate;

    loop {
        step = match step {
            Step::Generate => {
                attempt += 1;
                seed = SeedState::capture(&rng);
                if let Some(store) = env.seed_store {
                    let written = store.persist(condition_id, replication, &seed);
                    soft_persist(written, store.root(), env.strict_persistence)?;
                }
                let (generated, _) =
                    invoke(Stage::Generate, |_| env.sim.generate(env.condition, env.fixed, &mut rng)).into_parts();
                let data = match generated {
                    Ok(data) => data,
                    Err(message) => {
                        return Err(SimError::Generation {
                            condition_id,
                            message,
                        }
                        .into())
                    }
                };
                if let Some(paths) = env.data_paths {
                    let target = paths.generated_data_file(condition_id, replication);
                    let written = serde_json::to_value(&data)
                        .map_err(anyhow::Error::from)
                        .and_then(|v| write_new_unique_json(&target, &v));
                    soft_persist(written, &target, env.strict_persistence)?;
                }
                Step::Analyse(data)
            }
            Step::Analyse(data) => {
                let (analysed, warnings) = invoke(Stage::Analyse, |diag| {
                    env.sim.analyse(env.condition, &data, env.fixed, diag)
                })
                .into_parts();
                match analysed {
                    Err(message) => Step::Retry(Fault::new(FaultKind::Analysis, message)),
                    Ok(value) => {
                        let warnings: Vec<String> = warnings.into_iter().map(|w| w.message).collect();
                        match warnings.first() {
                            Some(first) if env.warnings_as_errors => {
                                Step::Retry(Fault::new(FaultKind::Analysis, first.clone()))
                            }
                            _ => Step::Validate { value, warnings },
                        }
                    }
                }
            }
            Step::Validate { value, warnings } => {
                let invalid = value.invalid_entries();
                if !invalid.is_empty() {
                    Step::Retry(Fault::new(
                        FaultKind::InvalidResult,
                        format!(
                            "analyse returned missing or non-finite values for: {}",
                            invalid.join(", ")
                        ),
                    ))
                } else if let Err(message) = value.check_type() {
                    return Ok(ReplicationOutcome::Fatal {
                        fault: Fault::new(FaultKind::TypeContractViolation, message),
                        tally,
                    });
                } else {
                    // Only warnings of the kept draw are counted.
                    for w in &warnings {
                        tally.record_warning(w);
                    }
                    return Ok(ReplicationOutcome::Success {
                        result: AnalysisResult {
                            replication,
                            value,
                            errors: history,
                            warnings,
                        },
                        tally,
                    });
                }
            }
            Step::Retry(fault) => {
                tally.record_error(&fault.message, replication, attempt, seed.clone());
                consecutive += 1;
                debug!(
                    condition = condition_id,
                    replication,
                    attempt,
                    kind = %fault.kind,
                    error = %fault.message,
                    "attempt failed; redrawing"
                );
                if consecutive >= env.max_errors {
                    let message = format!(
                        "condition {} was terminated because it had {} consecutive errors; last error: {}",
                        condition_id, env.max_errors, fault.message
                    );
                    return Ok(ReplicationOutcome::Fatal {
                        fault: Fault::new(FaultKind::ConsecutiveFailureLimitExceeded, message),
                        tally,
                    });
                }
                history.push(fault.message);
                Step::Generate
            }
        };
    }
}

/// Persistence failures are logged and ignored unless persistence is strict.
pub(crate) fn soft_persist<T>(written: Result<T>, path: &Path, strict: bool) -> Result<()> {
    match written {
        Ok(_) => Ok(()),
        Err(e) if strict => Err(SimError::Persistence {
            path: path.to_path_buf(),
            message: e.to_string(),
        }
        .into()),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "persisting artifact failed; continuing");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoke::Diagnostics;
    use crate::seed::replication_rng;
    use crate::value::{ResultSet, SummaryRow};
    use anyhow::anyhow;
    use indexmap::IndexMap;
    use rand::Rng;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Analysis fails on the first `fail_first` attempts, then behaves.
    struct Scripted {
        generated: AtomicUsize,
        fail_first: usize,
        mode: Mode,
    }

    #[derive(Clone, Copy)]
    enum Mode {
        Error,
        NaN,
        Warn,
        WarnNaN,
        Text,
    }

    impl Scripted {
        fn new(fail_first: usize, mode: Mode) -> Self {
            Self {
                generated: AtomicUsize::new(0),
                fail_first,
                mode,
            }
        }
    }

    impl Simulation for Scripted {
        type Data = (usize, f64);

        fn generate(&self, _c: &Condition, _f: &Value, rng: &mut SimRng) -> anyhow::Result<(usize, f64)> {
            let n = self.generated.fetch_add(1, Ordering::SeqCst) + 1;
            Ok((n, rng.gen()))
        }

        fn analyse(
            &self,
            _c: &Condition,
            data: &(usize, f64),
            _f: &Value,
            diag: &mut Diagnostics,
        ) -> anyhow::Result<AnalysisValue> {
            let (n, x) = *data;
            if let Mode::Text = self.mode {
                return Ok(AnalysisValue::Structured(json!("not a number")));
            }
            if n > self.fail_first {
                return Ok(AnalysisValue::vector([("x", x), ("attempt", n as f64)]));
            }
            match self.mode {
                Mode::Error => Err(anyhow!("model did not converge")),
                Mode::NaN => Ok(AnalysisValue::vector([("x", f64::NAN), ("attempt", n as f64)])),
                Mode::Warn => {
                    diag.warn("step size too large");
                    Ok(AnalysisValue::vector([("x", x), ("attempt", n as f64)]))
                }
                Mode::WarnNaN => {
                    diag.warn("step size too large");
                    Ok(AnalysisValue::vector([("x", f64::NAN), ("attempt", n as f64)]))
                }
                Mode::Text => unreachable!(),
            }
        }

        fn summarise(&self, _c: &Condition, _r: &ResultSet, _f: &Value) -> anyhow::Result<SummaryRow> {
            Ok(SummaryRow::new())
        }
    }

    struct BrokenGenerator;

    impl Simulation for BrokenGenerator {
        type Data = ();

        fn generate(&self, _c: &Condition, _f: &Value, _r: &mut SimRng) -> anyhow::Result<()> {
            Err(anyhow!("unknown distribution 'cauchyy'"))
        }

        fn analyse(&self, _c: &Condition, _d: &(), _f: &Value, _g: &mut Diagnostics) -> anyhow::Result<AnalysisValue> {
            Ok(AnalysisValue::Scalar(0.0))
        }

        fn summarise(&self, _c: &Condition, _r: &ResultSet, _f: &Value) -> anyhow::Result<SummaryRow> {
            Ok(SummaryRow::new())
        }
    }

    fn env<'a, S: Simulation>(sim: &'a S, condition: &'a Condition, fixed: &'a Value, max_errors: usize) -> ReplicationEnv<'a, S> {
        ReplicationEnv {
            sim,
            condition,
            fixed,
            max_errors,
            warnings_as_errors: false,
            seed_store: None,
            data_paths: None,
            strict_persistence: false,
        }
    }

    fn condition() -> Condition {
        Condition::new(3, IndexMap::new())
    }

    #[test]
    fn transient_failures_redraw_until_success() {
        let sim = Scripted::new(2, Mode::Error);
        let c = condition();
        let fixed = Value::Null;
        let out = run_replication(&env(&sim, &c, &fixed, 50), 1, replication_rng(9, 1)).expect("run");
        match out {
            ReplicationOutcome::Success { result, tally } => {
                assert_eq!(result.value.get("attempt"), Some(3.0));
                assert_eq!(result.errors, vec!["model did not converge"; 2]);
                assert_eq!(tally.errors.get("model did not converge"), Some(&2));
                assert_eq!(tally.error_seeds.len(), 2);
                assert_eq!(tally.error_seeds[1].attempt, 2);
            }
            other => panic!("expected success, got {:?}", other),
        }
        assert_eq!(sim.generated.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn always_failing_analysis_stops_after_exactly_max_errors_attempts() {
        let sim = Scripted::new(usize::MAX, Mode::Error);
        let c = condition();
        let fixed = Value::Null;
        let out = run_replication(&env(&sim, &c, &fixed, 7), 1, replication_rng(9, 1)).expect("run");
        match out {
            ReplicationOutcome::Fatal { fault, tally } => {
                assert_eq!(fault.kind, FaultKind::ConsecutiveFailureLimitExceeded);
                assert!(fault.message.contains("condition 3"), "{}", fault.message);
                assert!(fault.message.contains("7 consecutive errors"), "{}", fault.message);
                assert!(fault.message.contains("model did not converge"), "{}", fault.message);
                assert_eq!(tally.total_errors(), 7);
            }
            other => panic!("expected fatal, got {:?}", other),
        }
        assert_eq!(sim.generated.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn missing_values_trigger_a_redraw_naming_the_entries() {
        let sim = Scripted::new(1, Mode::NaN);
        let c = condition();
        let fixed = Value::Null;
        let out = run_replication(&env(&sim, &c, &fixed, 50), 2, replication_rng(9, 2)).expect("run");
        match out {
            ReplicationOutcome::Success { result, tally } => {
                assert_eq!(result.replication, 2);
                assert_eq!(result.errors.len(), 1);
                assert!(result.errors[0].contains(": x"), "{}", result.errors[0]);
                assert_eq!(tally.total_errors(), 1);
            }
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[test]
    fn warnings_are_counted_or_escalated() {
        let c = condition();
        let fixed = Value::Null;

        let sim = Scripted::new(1, Mode::Warn);
        match run_replication(&env(&sim, &c, &fixed, 50), 1, replication_rng(1, 1)).expect("run") {
            ReplicationOutcome::Success { result, tally } => {
                assert_eq!(result.warnings, vec!["step size too large"]);
                assert_eq!(tally.warnings.get("step size too large"), Some(&1));
                assert_eq!(tally.total_errors(), 0);
            }
            other => panic!("expected success, got {:?}", other),
        }

        let sim = Scripted::new(1, Mode::Warn);
        let mut strict = env(&sim, &c, &fixed, 50);
        strict.warnings_as_errors = true;
        match run_replication(&strict, 1, replication_rng(1, 1)).expect("run") {
            ReplicationOutcome::Success { result, tally } => {
                assert!(result.warnings.is_empty());
                assert_eq!(result.errors, vec!["step size too large"]);
                assert_eq!(tally.errors.get("step size too large"), Some(&1));
                assert!(tally.warnings.is_empty());
            }
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[test]
    fn warnings_of_a_discarded_draw_are_not_counted() {
        let sim = Scripted::new(1, Mode::WarnNaN);
        let c = condition();
        let fixed = Value::Null;
        match run_replication(&env(&sim, &c, &fixed, 50), 1, replication_rng(4, 1)).expect("run") {
            ReplicationOutcome::Success { result, tally } => {
                assert_eq!(result.errors.len(), 1);
                assert!(result.warnings.is_empty());
                assert!(tally.warnings.is_empty());
                assert_eq!(tally.total_errors(), 1);
            }
            other => panic!("expected success, got {:?}", other),
        }
        assert_eq!(sim.generated.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn non_numeric_result_is_fatal_without_retry() {
        let sim = Scripted::new(0, Mode::Text);
        let c = condition();
        let fixed = Value::Null;
        match run_replication(&env(&sim, &c, &fixed, 50), 1, replication_rng(1, 1)).expect("run") {
            ReplicationOutcome::Fatal { fault, .. } => {
                assert_eq!(fault.kind, FaultKind::TypeContractViolation)
            }
            other => panic!("expected fatal, got {:?}", other),
        }
        assert_eq!(sim.generated.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn generation_fault_is_a_run_level_error() {
        let c = condition();
        let fixed = Value::Null;
        let err = run_replication(&env(&BrokenGenerator, &c, &fixed, 50), 1, replication_rng(1, 1))
            .expect_err("generation fault");
        match err.downcast_ref::<SimError>() {
            Some(SimError::Generation { condition_id, message }) => {
                assert_eq!(*condition_id, 3);
                assert!(message.contains("cauchyy"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn seeds_and_data_are_persisted_per_attempt() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = RunPaths::new(dir.path(), "out.json", "w");
        let store = SeedStore::new(paths.seeds_dir());
        let sim = Scripted::new(1, Mode::Error);
        let c = condition();
        let fixed = Value::Null;
        let mut e = env(&sim, &c, &fixed, 50);
        e.seed_store = Some(&store);
        e.data_paths = Some(&paths);
        run_replication(&e, 4, replication_rng(5, 4)).expect("run");
        let seed_dir = paths.seeds_dir().join("design-row-3");
        assert!(seed_dir.join("seed-4.json").exists());
        assert!(seed_dir.join("seed-4-1.json").exists());
        let data_dir = paths.generated_data_dir().join("design-row-3");
        assert!(data_dir.join("data-4.json").exists());
        assert!(data_dir.join("data-4-1.json").exists());
    }
}
