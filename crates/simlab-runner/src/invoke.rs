//! Fault-isolated execution of user stage functions.
//!
//! A stage either returns a value or fails; a failure is any `Err` the stage
//! returns or any panic that unwinds out of it. Failures come back as a
//! [`StageOutcome::Error`] value, never as a propagated fault. Warnings are
//! collected through an explicit [`Diagnostics`] channel handed to the stage.

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Generate,
    Analyse,
    Summarise,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Generate => "generate",
            Stage::Analyse => "analyse",
            Stage::Summarise => "summarise",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A non-fatal diagnostic raised by a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warning {
    /// Call that raised it, e.g. `analyse` or a user-supplied helper name.
    pub call: String,
    pub message: String,
}

/// Collector passed to stages. Recording a warning never interrupts the stage.
#[derive(Debug)]
pub struct Diagnostics {
    stage: Stage,
    warnings: Vec<Warning>,
}

impl Diagnostics {
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            warnings: Vec::new(),
        }
    }

    pub fn warn(&mut self, message: impl AsRef<str>) {
        let call = self.stage.as_str().to_string();
        self.warn_from(call, message);
    }

    /// Record a warning attributed to a specific call inside the stage.
    pub fn warn_from(&mut self, call: impl Into<String>, message: impl AsRef<str>) {
        self.warnings.push(Warning {
            call: call.into(),
            message: clean_message(message.as_ref()),
        });
    }

    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    pub fn is_empty(&self) -> bool {
        self.warnings.is_empty()
    }

    fn into_warnings(self) -> Vec<Warning> {
        self.warnings
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome<T> {
    Ok(T),
    Warned { value: T, warnings: Vec<Warning> },
    Error { message: String },
}

impl<T> StageOutcome<T> {
    pub fn is_error(&self) -> bool {
        matches!(self, StageOutcome::Error { .. })
    }

    pub fn warnings(&self) -> &[Warning] {
        match self {
            StageOutcome::Warned { warnings, .. } => warnings,
            _ => &[],
        }
    }

    /// Split into the value (or failure message) and the captured warnings.
    pub fn into_parts(self) -> (Result<T, String>, Vec<Warning>) {
        match self {
            StageOutcome::Ok(value) => (Ok(value), Vec::new()),
            StageOutcome::Warned { value, warnings } => (Ok(value), warnings),
            StageOutcome::Error { message } => (Err(message), Vec::new()),
        }
    }
}

/// Run `f` with fault isolation and warning capture.
pub fn invoke<T, F>(stage: Stage, f: F) -> StageOutcome<T>
where
    F: FnOnce(&mut Diagnostics) -> anyhow::Result<T>,
{
    let mut diag = Diagnostics::new(stage);
    let res = catch_unwind(AssertUnwindSafe(|| f(&mut diag)));
    match res {
        Ok(Ok(value)) => {
            if diag.is_empty() {
                StageOutcome::Ok(value)
            } else {
                StageOutcome::Warned {
                    value,
                    warnings: diag.into_warnings(),
                }
            }
        }
        Ok(Err(err)) => StageOutcome::Error {
            message: clean_message(&format!("{:#}", err)),
        },
        Err(payload) => StageOutcome::Error {
            message: clean_message(&panic_message(payload)),
        },
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panic: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panic: {}", s)
    } else {
        "panic: <non-string payload>".to_string()
    }
}

/// Strip call-site boilerplate so only the user-meaningful text remains.
///
/// Handles `Error in <call> : msg`, `Warning in <call>: msg`, leading
/// `Error:`/`Warning:` labels and the `panic:` tag added for unwound stages,
/// then collapses whitespace so equal messages count as one signature.
pub fn clean_message(raw: &str) -> String {
    let mut msg = raw.trim();
    loop {
        let before = msg;
        for label in ["Error in ", "Warning in "] {
            if let Some(rest) = msg.strip_prefix(label) {
                if let Some(idx) = rest.find(':') {
                    msg = rest[idx + 1..].trim_start();
                }
            }
        }
        for label in ["Error:", "Warning:", "error:", "warning:", "panic:"] {
            if let Some(rest) = msg.strip_prefix(label) {
                msg = rest.trim_start();
            }
        }
        if msg == before {
            break;
        }
    }
    msg.split_whitespace().collect::<Vec<_>>().join(" ")
}
