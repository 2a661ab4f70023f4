//! Pipeline runner executing steps in declared order.
//!
//! Each step's condition is evaluated against the provisioning context just
//! before the step would run. A false condition skips the step; the first
//! failing step aborts the run and no later step is attempted.

use std::collections::HashSet;
use std::fmt;

use anyhow::Result;
use strum::Display;
use tracing::{debug, info, warn};

use crate::context::ProvisioningContext;
use crate::error::ProvisionError;
use crate::step::{Step, StepOutcome};

/// Attached as context to the error of a failing step.
///
/// Recover it with `err.downcast_ref::<StepFailure>()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFailure {
    pub step: String,
    /// 1-based position of the step
    pub index: usize,
    pub total: usize,
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "step '{}' ({}/{}) failed", self.step, self.index, self.total)
    }
}

/// How a step ended in a run.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum StepStatus {
    Completed,
    Skipped,
    #[strum(to_string = "incomplete")]
    Incomplete(String),
}

impl From<StepOutcome> for StepStatus {
    fn from(outcome: StepOutcome) -> Self {
        match outcome {
            StepOutcome::Completed => Self::Completed,
            StepOutcome::Incomplete(reason) => Self::Incomplete(reason),
        }
    }
}

/// Per-step results of a successful run, in execution order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    entries: Vec<(String, StepStatus)>,
}

impl RunReport {
    fn record(&mut self, step: &str, status: StepStatus) {
        self.entries.push((step.to_string(), status));
    }

    pub fn entries(&self) -> &[(String, StepStatus)] {
        &self.entries
    }

    pub fn status(&self, step: &str) -> Option<&StepStatus> {
        self.entries.iter().find(|(name, _)| name == step).map(|(_, status)| status)
    }

    fn names_with<F>(&self, predicate: F) -> Vec<&str>
    where
        F: Fn(&StepStatus) -> bool,
    {
        self.entries
            .iter()
            .filter(|(_, status)| predicate(status))
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn completed(&self) -> Vec<&str> {
        self.names_with(|s| *s == StepStatus::Completed)
    }

    pub fn skipped(&self) -> Vec<&str> {
        self.names_with(|s| *s == StepStatus::Skipped)
    }

    pub fn incomplete(&self) -> Vec<&str> {
        self.names_with(|s| matches!(s, StepStatus::Incomplete(_)))
    }
}

/// Ordered sequence of steps borrowed from a profile.
pub struct Pipeline<'a> {
    steps: &'a [Step],
}

impl<'a> Pipeline<'a> {
    pub fn new(steps: &'a [Step]) -> Self {
        Self { steps }
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Validates every step and checks that step names are unique.
    ///
    /// For `Validation` errors, prepends the step position and name to the
    /// message. Other variants are wrapped in `Validation` with the same
    /// prefix so no step loses its position information.
    pub fn validate(&self) -> Result<(), ProvisionError> {
        let mut names = HashSet::new();
        for (index, step) in self.steps.iter().enumerate() {
            let prefix = format!("step {} ('{}')", index + 1, step.name);
            if !names.insert(step.name.as_str()) {
                return Err(ProvisionError::Validation(format!(
                    "{}: duplicate step name",
                    prefix
                )));
            }
            step.validate().map_err(|e| match e {
                ProvisionError::Validation(msg) => {
                    ProvisionError::Validation(format!("{} validation failed: {}", prefix, msg))
                }
                ProvisionError::Io {
                    context,
                    message,
                    source,
                } => ProvisionError::Io {
                    context: format!("{} validation failed: {}", prefix, context),
                    message,
                    source,
                },
                other => {
                    ProvisionError::Validation(format!("{} validation failed: {}", prefix, other))
                }
            })?;
        }
        Ok(())
    }

    /// Runs the steps in order.
    ///
    /// Returns the report of all steps on success. On the first failure the
    /// error carries a [`StepFailure`] context naming the step.
    pub fn run(&self, ctx: &mut ProvisioningContext) -> Result<RunReport> {
        let mut report = RunReport::default();
        if self.is_empty() {
            info!("pipeline has no steps");
            return Ok(report);
        }

        let total = self.len();
        info!("starting pipeline with {} step(s)", total);

        for (index, step) in self.steps.iter().enumerate() {
            if !step.should_run(ctx) {
                debug!(
                    "skipping step {}/{}: {} (condition: {})",
                    index + 1,
                    total,
                    step.name,
                    step.when
                );
                report.record(&step.name, StepStatus::Skipped);
                continue;
            }

            info!("running step {}/{}: {}", index + 1, total, step.name);
            let outcome = step.execute(ctx).map_err(|e| {
                e.context(StepFailure {
                    step: step.name.clone(),
                    index: index + 1,
                    total,
                })
            })?;
            if let StepOutcome::Incomplete(reason) = &outcome {
                warn!("step '{}' is incomplete: {}", step.name, reason);
            }
            report.record(&step.name, outcome.into());
        }

        info!(
            "pipeline finished: {} completed, {} skipped, {} incomplete",
            report.completed().len(),
            report.skipped().len(),
            report.incomplete().len()
        );
        let sources: Vec<_> = ctx.sources.registered_names().collect();
        if !sources.is_empty() {
            info!("package sources left registered: {}", sources.join(", "));
        }
        Ok(report)
    }
}
