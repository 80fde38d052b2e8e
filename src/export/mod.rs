//! Conversion of fetched records to wire messages and fan-out to sinks.

mod sink;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use log::{debug, warn};
use serde::Serialize;
use serde_json::Value;

#[cfg(test)]
pub(crate) use sink::recording::RecordingSink;
pub use sink::{FileSink, HttpSink, Sink};

use crate::config::SinkConfig;
use crate::error::{Result, SyncError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Projects,
    Pipelines,
    Jobs,
    Bridges,
    Sections,
    Metrics,
    TestReports,
    TestSuites,
    TestCases,
    MergeRequests,
    Deployments,
    Runners,
    Traces,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Projects => "projects",
            Self::Pipelines => "pipelines",
            Self::Jobs => "jobs",
            Self::Bridges => "bridges",
            Self::Sections => "sections",
            Self::Metrics => "metrics",
            Self::TestReports => "testreports",
            Self::TestSuites => "testsuites",
            Self::TestCases => "testcases",
            Self::MergeRequests => "mergerequests",
            Self::Deployments => "deployments",
            Self::Runners => "runners",
            Self::Traces => "traces",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encodes records to JSON values, skipping the ones that fail.
fn encode<T: Serialize>(kind: EntityKind, records: &[T]) -> Vec<Value> {
    records
        .iter()
        .filter_map(|record| match serde_json::to_value(record) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Skipping {kind} record that failed to encode: {e}");
                None
            }
        })
        .collect()
}

/// Sends records to every configured sink.
#[derive(Clone, Default)]
pub struct Exporter {
    sinks: Vec<Arc<dyn Sink>>,
}

impl Exporter {
    pub fn new(sinks: Vec<Arc<dyn Sink>>) -> Self {
        Self { sinks }
    }

    pub fn from_config(endpoints: &[SinkConfig], timeout: Option<Duration>) -> Result<Self> {
        let mut sinks: Vec<Arc<dyn Sink>> = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            match endpoint {
                SinkConfig::Http { address } => {
                    sinks.push(Arc::new(HttpSink::new(address, timeout)?));
                }
                SinkConfig::File { path } => sinks.push(Arc::new(FileSink::new(path))),
            }
        }
        Ok(Self::new(sinks))
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    /// Exports one entity kind.
    ///
    /// # Errors
    /// All sinks are tried; the failures of those that refused are joined.
    pub async fn export<T: Serialize>(&self, kind: EntityKind, records: &[T]) -> Result<()> {
        self.send(kind, encode(kind, records)).await
    }

    async fn send(&self, kind: EntityKind, values: Vec<Value>) -> Result<()> {
        if values.is_empty() || self.sinks.is_empty() {
            return Ok(());
        }
        debug!(
            "Exporting {} {kind} to {} sinks",
            values.len(),
            self.sinks.len()
        );

        let sends = self.sinks.iter().map(|sink| sink.send(kind, &values));
        let errors: Vec<SyncError> = join_all(sends)
            .await
            .into_iter()
            .zip(&self.sinks)
            .filter_map(|(result, sink)| {
                result.err().inspect(|e| warn!("Sink '{}' failed: {e}", sink.name()))
            })
            .collect();

        SyncError::join_result(errors)
    }

    /// Exports every kind of `batch` in the order they were added.
    ///
    /// # Errors
    /// A failing kind does not stop the ones after it; all failures are
    /// joined.
    pub async fn export_batch(&self, batch: ExportBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut errors = Vec::new();
        for (kind, values) in batch.kinds {
            if let Err(e) = self.send(kind, values).await {
                errors.push(e);
            }
        }
        SyncError::join_result(errors)
    }
}

/// Records of several kinds that belong to one export.
#[derive(Debug, Default)]
pub struct ExportBatch {
    kinds: Vec<(EntityKind, Vec<Value>)>,
}

impl ExportBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<T: Serialize>(&mut self, kind: EntityKind, records: &[T]) -> &mut Self {
        let values = encode(kind, records);
        match self.kinds.iter_mut().find(|(k, _)| *k == kind) {
            Some((_, existing)) => existing.extend(values),
            None => self.kinds.push((kind, values)),
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.iter().all(|(_, values)| values.is_empty())
    }
}
