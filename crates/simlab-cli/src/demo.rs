//! Built-in study: how well do the sample mean, a trimmed mean and the median
//! recover the centre of normal and skewed populations?
//!
//! Design factors: `N` (sample size, required), `dist` (`normal` or
//! `skewed`, default `normal`) and `mu` (population mean, default 0).

use anyhow::{anyhow, Result};
use rand::Rng;
use serde_json::Value;
use simlab_runner::{AnalysisValue, Condition, Diagnostics, ResultSet, SimRng, Simulation, SummaryRow};
use std::f64::consts::PI;

pub const ESTIMATORS: [&str; 3] = ["mean", "trimmed", "median"];
const TRIM: f64 = 0.1;
const SMALL_SAMPLE: usize = 10;
/// Degrees of freedom of the centred chi-square used for `skewed`.
const SKEW_DF: usize = 3;

pub struct MeanEstimation;

impl Simulation for MeanEstimation {
    type Data = Vec<f64>;

    fn generate(&self, condition: &Condition, _fixed: &Value, rng: &mut SimRng) -> Result<Vec<f64>> {
        let n = condition.u64("N")? as usize;
        if n < 2 {
            return Err(anyhow!("N must be at least 2, got {}", n));
        }
        let mu = population_mean(condition);
        match distribution(condition) {
            "normal" => Ok((0..n).map(|_| mu + standard_normal(rng)).collect()),
            "skewed" => {
                let scale = (2.0 * SKEW_DF as f64).sqrt();
                Ok((0..n)
                    .map(|_| {
                        let chi2: f64 = (0..SKEW_DF).map(|_| standard_normal(rng).powi(2)).sum();
                        mu + (chi2 - SKEW_DF as f64) / scale
                    })
                    .collect())
            }
            other => Err(anyhow!("unknown distribution '{}'", other)),
        }
    }

    fn analyse(&self, _condition: &Condition, data: &Vec<f64>, _fixed: &Value, diag: &mut Diagnostics) -> Result<AnalysisValue> {
        if data.len() < SMALL_SAMPLE {
            diag.warn(format!("sample of {} is too small for a stable trimmed mean", data.len()));
        }
        let mut sorted = data.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));
        Ok(AnalysisValue::vector([
            ("mean", mean(&sorted)),
            ("trimmed", trimmed_mean(&sorted, TRIM)),
            ("median", median(&sorted)),
        ]))
    }

    fn summarise(&self, condition: &Condition, results: &ResultSet, _fixed: &Value) -> Result<SummaryRow> {
        if results.is_empty() {
            return Err(anyhow!("no replications to summarise"));
        }
        let mu = population_mean(condition);
        let mut row = SummaryRow::new();
        for name in ESTIMATORS {
            let estimates = results.column(name);
            row.insert(format!("bias.{}", name), mean(&estimates) - mu);
            let mse = estimates.iter().map(|e| (e - mu).powi(2)).sum::<f64>() / estimates.len() as f64;
            row.insert(format!("rmse.{}", name), mse.sqrt());
        }
        Ok(row)
    }
}

fn population_mean(condition: &Condition) -> f64 {
    condition.f64("mu").unwrap_or(0.0)
}

fn distribution(condition: &Condition) -> &str {
    condition.str("dist").unwrap_or("normal")
}

/// Box-Muller.
fn standard_normal(rng: &mut SimRng) -> f64 {
    let u1 = 1.0 - rng.gen::<f64>();
    let u2 = rng.gen::<f64>();
    (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// `sorted` must be in ascending order.
fn trimmed_mean(sorted: &[f64], trim: f64) -> f64 {
    let k = (sorted.len() as f64 * trim).floor() as usize;
    mean(&sorted[k..sorted.len() - k])
}

fn median(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n % 2 == 0 {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    } else {
        sorted[n / 2]
    }
}
