//! Error types for identity tracking.

use thiserror::Error;

/// Contract violations surfaced by the identity store and tracker.
///
/// Everything rooted in untrusted input (detections, plugin output) is
/// recovered locally and never shows up here.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TrackingError {
    /// No identity with this id exists in the store.
    #[error("identity {0} does not exist")]
    UnknownIdentity(u64),

    /// A mutation was requested on a retired identity.
    #[error("identity {0} is retired and can no longer be modified")]
    RetiredIdentity(u64),

    /// An identity cannot be merged into itself.
    #[error("cannot merge identity {0} into itself")]
    SelfMerge(u64),

    /// An embedding with the wrong number of components reached the store.
    #[error("embedding has {got} components, expected {expected}")]
    DimensionMismatch { expected: usize, got: usize },

    /// The tracker configuration is inconsistent.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The storage collaborator failed to load or delete records.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Invalid combinations of configuration values.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("{name} must be a finite positive number, got {value}")]
    InvalidThreshold { name: &'static str, value: f32 },

    #[error(
        "thresholds must satisfy duplicate < match <= candidate \
         (got {duplicate}, {matching}, {candidate})"
    )]
    ThresholdOrder {
        duplicate: f32,
        matching: f32,
        candidate: f32,
    },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Failure reported by a plugin invocation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PluginError {
    /// The plugin ran and reported a failure.
    #[error("{0}")]
    Failed(String),

    /// The plugin panicked while running.
    #[error("plugin panicked: {0}")]
    Panicked(String),

    /// A background invocation did not finish before its deadline.
    #[error("plugin exceeded its deadline of {0:?}")]
    Timeout(std::time::Duration),

    /// The background worker pool went away before the job completed.
    #[error("worker pool shut down before the job completed")]
    Disconnected,
}

impl PluginError {
    /// Convenience constructor for plugin implementations.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Failure reported by a storage collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("storage error: {message}")]
pub struct StorageError {
    pub message: String,
}

impl StorageError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
