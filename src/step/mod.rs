//! Provisioning steps.
//!
//! A step is a named unit of work with a run condition and an action.
//! Steps are declared in a profile and run strictly in order by the
//! [`Pipeline`](crate::pipeline::Pipeline).

mod action;
mod condition;

pub use action::{HOSTNAME_BIN, StepAction, StepOutcome};
pub use condition::Condition;

use anyhow::Result;
use serde::Deserialize;

use crate::context::ProvisioningContext;
use crate::error::ProvisionError;

/// A named, optionally conditional unit of provisioning work.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Step {
    pub name: String,
    /// Run condition; a step without one always runs
    #[serde(default)]
    pub when: Condition,
    pub action: StepAction,
}

impl Step {
    pub fn new(name: impl Into<String>, action: StepAction) -> Self {
        Self {
            name: name.into(),
            when: Condition::always(),
            action,
        }
    }

    #[must_use]
    pub fn when(mut self, condition: Condition) -> Self {
        self.when = condition;
        self
    }

    pub fn validate(&self) -> Result<(), ProvisionError> {
        if self.name.trim().is_empty() {
            return Err(ProvisionError::Validation("step name must not be empty".to_string()));
        }
        self.action.validate()
    }

    /// Returns whether the step's condition holds in `ctx`.
    pub fn should_run(&self, ctx: &ProvisioningContext) -> bool {
        self.when.evaluate(ctx)
    }

    #[tracing::instrument(skip_all, fields(step = %self.name, action = self.action.kind()))]
    pub fn execute(&self, ctx: &mut ProvisioningContext) -> Result<StepOutcome> {
        self.action.execute(ctx)
    }
}
