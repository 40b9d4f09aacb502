use crate::design::Condition;
use crate::invoke::Diagnostics;
use crate::seed::SimRng;
use crate::value::{AnalysisValue, ResultSet, SummaryRow};
use serde::Serialize;
use serde_json::Value;

/// The three user stages of a Monte Carlo study.
///
/// Every stage may fail by returning `Err` or by panicking; the runner turns
/// both into classified outcomes. `fixed` carries the run's fixed objects,
/// shared read-only by every call.
pub trait Simulation: Sync {
    /// Generated data. Serialized only when generated data persistence is on.
    type Data: Serialize;

    /// Runs once on every worker before any stage executes there.
    fn setup_worker(&self, _packages: &[String]) -> anyhow::Result<()> {
        Ok(())
    }

    fn generate(&self, condition: &Condition, fixed: &Value, rng: &mut SimRng) -> anyhow::Result<Self::Data>;

    /// Non-fatal problems go to `diag`; they are counted per condition and
    /// attached to the replication's result.
    fn analyse(
        &self,
        condition: &Condition,
        data: &Self::Data,
        fixed: &Value,
        diag: &mut Diagnostics,
    ) -> anyhow::Result<AnalysisValue>;

    fn summarise(&self, condition: &Condition, results: &ResultSet, fixed: &Value) -> anyhow::Result<SummaryRow>;
}
