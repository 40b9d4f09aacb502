//! Monte Carlo simulation runner.
//!
//! A study is a [`Design`] of conditions and a [`Simulation`] providing the
//! generate, analyse and summarise stages. [`SimRunner`] replicates every
//! condition with reproducible per-replication random streams, retries
//! failed draws up to a consecutive-error limit, checkpoints progress so an
//! interrupted run resumes where it stopped, and writes one summary row per
//! condition to a final table.

pub mod checkpoint;
pub mod clean;
mod condition;
pub mod config;
pub mod design;
pub mod error;
pub mod invoke;
pub mod paths;
mod replication;
mod runner;
pub mod seed;
pub mod simulation;
pub mod table;
pub mod tally;
pub mod value;

pub use checkpoint::{CheckpointRecord, CheckpointStore, CheckpointSummary, ConditionStatus};
pub use clean::{clean, inspect, list_artifacts, CleanTargets};
pub use config::{Parallelism, RunConfig};
pub use design::{Condition, Design};
pub use error::{Fault, FaultKind, SimError};
pub use invoke::{invoke, Diagnostics, Stage, StageOutcome, Warning};
pub use paths::RunPaths;
pub use runner::{run_simulation, Replay, SimResults, SimRunner};
pub use seed::{load_seed, replication_rng, SeedState, SimRng};
pub use simulation::Simulation;
pub use table::{FinalTable, RunMeta};
pub use tally::FaultTally;
pub use value::{AnalysisResult, AnalysisValue, ResultSet, SummaryRow};
