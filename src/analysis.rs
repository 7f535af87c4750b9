//! Per-identity analysis plugins and their scheduling.
//!
//! Plugins see a crop of the current frame plus a read-only snapshot of the
//! identity, and return a JSON value. Outcomes, failures included, are stored
//! on the identity under the plugin's name.

mod crop;
mod plugin;
mod registry;
mod scheduler;
mod worker_pool;

pub use crop::Crop;
pub use plugin::{Execution, FnPlugin, InputKind, Plugin, PluginOutcome, PluginResult};
pub use registry::{PluginRegistry, PluginStatus};
pub use scheduler::{AnalysisScheduler, AnalysisSummary};
