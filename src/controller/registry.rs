use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::gitlab::types::{Project, Timestamp};
use crate::window::SyncWindow;

/// Which optional entity kinds are exported for a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportFlags {
    pub sections: bool,
    pub test_reports: bool,
    pub traces: bool,
    pub metrics: bool,
    pub merge_requests: bool,
    pub deployments: bool,
}

impl Default for ExportFlags {
    fn default() -> Self {
        Self {
            sections: true,
            test_reports: true,
            traces: true,
            metrics: true,
            merge_requests: true,
            deployments: true,
        }
    }
}

impl ExportFlags {
    /// Whether job logs have to be downloaded at all. Traces carry a span
    /// per section, so they need logs too.
    pub fn needs_logs(&self) -> bool {
        self.sections || self.metrics || self.traces
    }
}

/// Historical range a project is synced over during catch-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CatchUp {
    pub enabled: bool,
    pub updated_after: Option<Timestamp>,
    pub updated_before: Option<Timestamp>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectSettings {
    pub id: i64,
    pub full_path: String,
    pub export: ExportFlags,
    pub catch_up: CatchUp,
}

impl ProjectSettings {
    /// Settings for `project`; a catch-up range without a lower bound starts
    /// at the project's creation.
    pub fn new(project: &Project, export: ExportFlags, mut catch_up: CatchUp) -> Self {
        if catch_up.updated_after.is_none() {
            catch_up.updated_after = project.created_at;
        }
        Self {
            id: project.id,
            full_path: project.full_path.clone(),
            export,
            catch_up,
        }
    }

    pub fn catches_up_in(&self, window: &SyncWindow) -> bool {
        self.catch_up.enabled
            && window.overlaps(self.catch_up.updated_after, self.catch_up.updated_before)
    }

    fn matches(&self, pattern: &str) -> bool {
        self.full_path == pattern || self.id.to_string() == pattern
    }
}

/// Projects keyed by id, in resolution order.
pub type Registry = IndexMap<i64, ProjectSettings>;

/// A bounded slice of the registry processed as one unit.
pub type FetchBatch = Vec<ProjectSettings>;

pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Splits the projects of `registry` accepted by `filter` into batches of at
/// most `size`.
pub fn batches(
    registry: &Registry,
    size: usize,
    filter: impl Fn(&ProjectSettings) -> bool,
) -> Vec<FetchBatch> {
    let selected: Vec<ProjectSettings> = registry
        .values()
        .filter(|settings| filter(settings))
        .cloned()
        .collect();
    selected
        .chunks(size.max(1))
        .map(<[ProjectSettings]>::to_vec)
        .collect()
}

/// Collects the outcome of resolving namespaces and explicit projects into a
/// fresh [`Registry`].
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    entries: Registry,
    exclusions: Vec<String>,
}

impl RegistryBuilder {
    /// Adds a project found through a namespace. The first namespace listing a
    /// project wins.
    pub fn add_from_namespace(&mut self, settings: ProjectSettings) {
        self.entries.entry(settings.id).or_insert(settings);
    }

    /// Adds an explicitly configured project, replacing whatever a namespace
    /// contributed for the same id.
    pub fn add_explicit(&mut self, settings: ProjectSettings) {
        self.entries.insert(settings.id, settings);
    }

    /// Drops projects whose full path or id equals `pattern`.
    pub fn exclude(&mut self, pattern: impl Into<String>) {
        self.exclusions.push(pattern.into());
    }

    pub fn build(mut self) -> Registry {
        let exclusions = std::mem::take(&mut self.exclusions);
        self.entries
            .retain(|_, settings| !exclusions.iter().any(|pattern| settings.matches(pattern)));
        self.entries
    }
}
