//! Registered analysis plugins and their enabled state.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::analysis::plugin::{Execution, InputKind, Plugin};

/// Registry view of one plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginStatus {
    pub name: String,
    pub input_kind: InputKind,
    pub interval: Duration,
    pub execution: Execution,
    pub enabled: bool,
}

struct Entry {
    plugin: Arc<dyn Plugin>,
    enabled: bool,
}

/// Plugins in registration order. Names are unique.
#[derive(Default)]
pub struct PluginRegistry {
    entries: Vec<Entry>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a plugin, enabled. A plugin already registered under the same
    /// name is replaced in place; returns `true` in that case.
    pub fn register(&mut self, plugin: Arc<dyn Plugin>) -> bool {
        let name = plugin.name().to_string();
        let entry = Entry {
            plugin,
            enabled: true,
        };
        match self.position(&name) {
            Some(index) => {
                self.entries[index] = entry;
                info!(plugin = %name, "Replaced analysis plugin");
                true
            }
            None => {
                self.entries.push(entry);
                info!(plugin = %name, "Registered analysis plugin");
                false
            }
        }
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        match self.position(name) {
            Some(index) => {
                self.entries.remove(index);
                info!(plugin = %name, "Unregistered analysis plugin");
                true
            }
            None => false,
        }
    }

    pub fn enable(&mut self, name: &str) -> bool {
        self.set_enabled(name, true)
    }

    pub fn disable(&mut self, name: &str) -> bool {
        self.set_enabled(name, false)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.position(name)
            .is_some_and(|index| self.entries[index].enabled)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn status(&self) -> Vec<PluginStatus> {
        self.entries
            .iter()
            .map(|entry| PluginStatus {
                name: entry.plugin.name().to_string(),
                input_kind: entry.plugin.input_kind(),
                interval: entry.plugin.interval(),
                execution: entry.plugin.execution(),
                enabled: entry.enabled,
            })
            .collect()
    }

    pub(crate) fn enabled(&self) -> impl Iterator<Item = &Arc<dyn Plugin>> {
        self.entries
            .iter()
            .filter(|entry| entry.enabled)
            .map(|entry| &entry.plugin)
    }

    fn set_enabled(&mut self, name: &str, enabled: bool) -> bool {
        let Some(index) = self.position(name) else {
            return false;
        };
        self.entries[index].enabled = enabled;
        info!(plugin = %name, enabled, "Changed analysis plugin state");
        true
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.plugin.name() == name)
    }
}
