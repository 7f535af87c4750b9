//! The analysis plugin interface and its stored outcomes.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::analysis::crop::Crop;
use crate::error::PluginError;
use crate::identity::IdentitySnapshot;

/// Which crop a plugin wants to look at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    Face,
    Body,
    Pose,
    /// The whole frame.
    Generic,
}

/// Where a plugin runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Execution {
    /// On the frame loop, before the frame returns.
    #[default]
    Inline,
    /// On the worker pool; the result lands in a later frame.
    Background,
}

/// An analysis run periodically against each visible identity.
///
/// Implementations must tolerate being called from a worker thread when
/// [`Execution::Background`] is selected.
pub trait Plugin: Send + Sync {
    /// Unique name, used as the key for stored results.
    fn name(&self) -> &str;

    fn input_kind(&self) -> InputKind;

    /// Minimum time between two successful runs for the same identity.
    fn interval(&self) -> Duration;

    fn execution(&self) -> Execution {
        Execution::Inline
    }

    fn invoke(&self, crop: &Crop, identity: &IdentitySnapshot) -> Result<Value, PluginError>;
}

/// Adapts a closure into a [`Plugin`].
pub struct FnPlugin<F> {
    name: String,
    input_kind: InputKind,
    interval: Duration,
    execution: Execution,
    func: F,
}

impl<F> FnPlugin<F>
where
    F: Fn(&Crop, &IdentitySnapshot) -> Result<Value, PluginError> + Send + Sync,
{
    pub fn new(
        name: impl Into<String>,
        input_kind: InputKind,
        interval: Duration,
        func: F,
    ) -> Self {
        Self {
            name: name.into(),
            input_kind,
            interval,
            execution: Execution::Inline,
            func,
        }
    }

    /// Run on the worker pool instead of the frame loop.
    pub fn background(mut self) -> Self {
        self.execution = Execution::Background;
        self
    }
}

impl<F> fmt::Debug for FnPlugin<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnPlugin")
            .field("name", &self.name)
            .field("input_kind", &self.input_kind)
            .field("interval", &self.interval)
            .field("execution", &self.execution)
            .finish_non_exhaustive()
    }
}

impl<F> Plugin for FnPlugin<F>
where
    F: Fn(&Crop, &IdentitySnapshot) -> Result<Value, PluginError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn input_kind(&self) -> InputKind {
        self.input_kind
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn execution(&self) -> Execution {
        self.execution
    }

    fn invoke(&self, crop: &Crop, identity: &IdentitySnapshot) -> Result<Value, PluginError> {
        (self.func)(crop, identity)
    }
}

/// What a plugin invocation produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum PluginOutcome {
    Success(Value),
    Failed(String),
}

/// Latest outcome of one plugin for one identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginResult {
    pub outcome: PluginOutcome,
    pub produced_at: DateTime<Utc>,
}

impl PluginResult {
    pub fn new(outcome: PluginOutcome, produced_at: DateTime<Utc>) -> Self {
        Self {
            outcome,
            produced_at,
        }
    }

    pub(crate) fn from_invocation(
        result: Result<Value, PluginError>,
        produced_at: DateTime<Utc>,
    ) -> Self {
        let outcome = match result {
            Ok(value) => PluginOutcome::Success(value),
            Err(err) => PluginOutcome::Failed(err.to_string()),
        };
        Self::new(outcome, produced_at)
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, PluginOutcome::Success(_))
    }

    pub fn value(&self) -> Option<&Value> {
        match &self.outcome {
            PluginOutcome::Success(value) => Some(value),
            PluginOutcome::Failed(_) => None,
        }
    }
}

/// Invoke a plugin, turning a panic into a [`PluginError::Panicked`].
pub(crate) fn invoke_isolated(
    plugin: &dyn Plugin,
    crop: &Crop,
    identity: &IdentitySnapshot,
) -> Result<Value, PluginError> {
    panic::catch_unwind(AssertUnwindSafe(|| plugin.invoke(crop, identity)))
        .unwrap_or_else(|payload| Err(PluginError::Panicked(panic_message(payload.as_ref()))))
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
