//! The sync loop: keeps the project registry, moves the time window forward
//! (or backward during catch-up), and drives the fetch tasks and the exporter
//! for every batch of projects.

pub mod registry;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use log::{debug, error, info, warn};
use tokio::sync::RwLock;
use tokio::time::{interval, MissedTickBehavior};

use self::registry::{
    batches, ExportFlags, FetchBatch, ProjectSettings, Registry, RegistryBuilder,
};
use crate::cancel::CancellationToken;
use crate::config::{Config, NamespaceConfig, ProjectConfig, ProjectDefaults};
use crate::error::{Result, SyncError};
use crate::export::{EntityKind, ExportBatch, Exporter};
use crate::fetch::{
    attach_job_logs, fetch_deployments, fetch_job_logs, fetch_merge_requests,
    fetch_pipeline_hierarchies, fetch_project_changes, fetch_runners, fetch_test_reports,
    FetchContext,
};
use crate::gitlab::hierarchy::PipelineHierarchy;
use crate::gitlab::types::{Deployment, Pipeline, Project, Runner, TestReport};
use crate::gitlab::GitLabApi;
use crate::pool::Collected;
use crate::trace::TraceData;
use crate::window::{catch_up_windows, SyncWindow};

/// Readiness check handed out to a health endpoint.
pub type ReadinessProbe = Box<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct Settings {
    /// Tick of the live sync, and the span of its first window
    pub interval: Duration,
    /// Span of every catch-up window
    pub catch_up_interval: Duration,
    pub batch_size: usize,
    pub concurrency: usize,
    pub defaults: ProjectDefaults,
    pub namespaces: Vec<NamespaceConfig>,
    pub projects: Vec<ProjectConfig>,
}

impl Settings {
    pub fn from_config(config: &Config) -> Self {
        let controller = &config.controller;
        Self {
            interval: Duration::from_secs(controller.interval_secs),
            catch_up_interval: Duration::from_secs(controller.catch_up_interval_secs),
            batch_size: controller.batch_size,
            concurrency: controller.concurrency,
            defaults: config.project_defaults,
            namespaces: config.namespaces.clone(),
            projects: config.projects.clone(),
        }
    }
}

fn span(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365))
}

/// Moves fetched values into a list and their errors into `errors`. An
/// aborted fetch contributes its error and nothing else.
fn gather<T>(fetched: Result<Collected<T>>, errors: &mut Vec<SyncError>) -> Vec<T> {
    match fetched {
        Ok(collected) => {
            errors.extend(collected.errors);
            collected.values
        }
        Err(e) => {
            errors.push(e);
            Vec::new()
        }
    }
}

pub struct Controller {
    ctx: FetchContext,
    exporter: Exporter,
    settings: Settings,
    registry: RwLock<Arc<Registry>>,
}

impl Controller {
    /// `cancel` stops every loop and every fetch started by this controller.
    pub fn new(
        api: Arc<dyn GitLabApi>,
        exporter: Exporter,
        settings: Settings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            ctx: FetchContext::new(api, settings.concurrency, cancel),
            exporter,
            settings,
            registry: RwLock::new(Arc::new(Registry::new())),
        }
    }

    /// Current registry snapshot.
    pub async fn projects(&self) -> Arc<Registry> {
        Arc::clone(&*self.registry.read().await)
    }

    /// Rebuilds the registry from the configured namespaces and projects.
    ///
    /// Explicit projects override what a namespace contributed; exclusions are
    /// applied last. The new registry replaces the old one in a single swap.
    ///
    /// # Errors
    /// Any failing lookup aborts the rebuild and leaves the registry as it was.
    pub async fn resolve_projects(&self) -> Result<usize> {
        let defaults = self.settings.defaults;
        let api = &self.ctx.api;
        let mut builder = RegistryBuilder::default();

        for namespace in &self.settings.namespaces {
            let kind = match namespace.kind {
                Some(kind) => kind,
                None => self.ctx.call(api.namespace_kind(&namespace.id)).await?,
            };
            let projects = self
                .ctx
                .call(api.namespace_projects(
                    &namespace.id,
                    kind,
                    namespace.include_subgroups,
                    namespace.with_shared,
                ))
                .await?;
            debug!(
                "Namespace '{}' ({kind:?}) has {} projects",
                namespace.id,
                projects.len()
            );

            let export = namespace.export.unwrap_or(defaults.export);
            let catch_up = namespace.catch_up.unwrap_or(defaults.catch_up);
            for project in &projects {
                builder.add_from_namespace(ProjectSettings::new(project, export, catch_up));
            }
            for pattern in &namespace.exclude {
                builder.exclude(pattern.as_str());
            }
        }

        for configured in &self.settings.projects {
            let project = self.ctx.call(api.project(&configured.id)).await?;
            builder.add_explicit(ProjectSettings::new(
                &project,
                configured.export.unwrap_or(defaults.export),
                configured.catch_up.unwrap_or(defaults.catch_up),
            ));
        }

        let registry = builder.build();
        let count = registry.len();
        *self.registry.write().await = Arc::new(registry);
        info!("Resolved {count} projects");
        Ok(count)
    }

    /// Re-resolves the registry every `every` until cancelled. A failed
    /// refresh keeps the previous registry.
    pub async fn refresh_projects(&self, every: Duration) {
        let cancel = &self.ctx.cancel;
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            match self.resolve_projects().await {
                Ok(_) => {}
                Err(e) if e.is_cancelled() => return,
                Err(e) => warn!("Keeping the previous project registry: {e}"),
            }
        }
    }

    /// Live sync. Every tick covers the time since the previous one; a tick
    /// that takes longer than the interval delays the next instead of
    /// overlapping with it.
    pub async fn run(&self) {
        let cancel = &self.ctx.cancel;
        let mut ticker = interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut window: Option<SyncWindow> = None;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let first_iteration = window.is_none();
            let current = match window {
                Some(previous) => previous.advance(Utc::now()),
                None => SyncWindow::trailing(span(self.settings.interval)),
            };
            window = Some(current);

            let batches = self.batches(|_| true).await;
            debug!(
                "Syncing {} to {} in {} batches",
                current.after,
                current.before,
                batches.len()
            );
            match self.process_batches(&batches, current, first_iteration).await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => break,
                Err(e) => error!("Sync of {} to {} failed: {e}", current.after, current.before),
            }
        }

        info!("Sync loop stopped");
    }

    /// Walks backward from now over the configured catch-up ranges.
    ///
    /// Each window only includes projects whose range overlaps it; windows
    /// without any are skipped. The walk ends at the oldest range start.
    ///
    /// # Errors
    /// Failed windows don't stop the walk and are joined at the end;
    /// cancellation returns at once.
    pub async fn catch_up(&self) -> Result<()> {
        let floor = self
            .registry
            .read()
            .await
            .values()
            .filter(|settings| settings.catch_up.enabled)
            .filter_map(|settings| settings.catch_up.updated_after)
            .min();
        let Some(floor) = floor else {
            info!("No project needs catching up");
            return Ok(());
        };

        info!("Catching up back to {floor}");
        let mut errors = Vec::new();
        for window in catch_up_windows(Utc::now(), span(self.settings.catch_up_interval), floor) {
            if self.ctx.cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            let batches = self
                .batches(|settings| settings.catches_up_in(&window))
                .await;
            if batches.is_empty() {
                debug!("Nothing to catch up between {} and {}", window.after, window.before);
                continue;
            }

            debug!(
                "Catching up {} to {} in {} batches",
                window.after,
                window.before,
                batches.len()
            );
            match self.process_batches(&batches, window, false).await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!("Catch-up of {} to {} failed: {e}", window.after, window.before);
                    errors.push(e);
                }
            }
        }

        info!("Catch-up finished");
        SyncError::join_result(errors)
    }

    /// A readiness check that outlives the controller.
    pub fn readiness_probe(&self) -> ReadinessProbe {
        let api = Arc::clone(&self.ctx.api);
        Box::new(move || {
            let api = Arc::clone(&api);
            async move { api.check_readiness().await }.boxed()
        })
    }

    async fn batches(&self, filter: impl Fn(&ProjectSettings) -> bool) -> Vec<FetchBatch> {
        let registry = self.registry.read().await;
        batches(&registry, self.settings.batch_size, filter)
    }

    async fn process_batches(
        &self,
        batches: &[FetchBatch],
        window: SyncWindow,
        first_iteration: bool,
    ) -> Result<()> {
        let results = join_all(
            batches
                .iter()
                .map(|batch| self.process(batch, window, first_iteration)),
        )
        .await;
        SyncError::join_result(results.into_iter().filter_map(Result::err).collect())
    }

    /// Syncs one batch: finds out which projects changed, then exports project
    /// metadata, CI data and merge requests independently of each other.
    ///
    /// `first_iteration` exports the metadata of every project, changed or
    /// not.
    pub async fn process(
        &self,
        batch: &[ProjectSettings],
        window: SyncWindow,
        first_iteration: bool,
    ) -> Result<()> {
        let ids: Vec<i64> = batch.iter().map(|settings| settings.id).collect();
        let Collected {
            values: changes,
            mut errors,
        } = fetch_project_changes(&self.ctx, &ids, window).await?;

        let by_id: HashMap<i64, &ProjectSettings> =
            batch.iter().map(|settings| (settings.id, settings)).collect();
        let projects: Vec<&Project> = changes
            .iter()
            .filter(|change| first_iteration || change.updated)
            .map(|change| &change.project)
            .collect();
        let with_pipelines: Vec<&ProjectSettings> = changes
            .iter()
            .filter(|change| change.pipelines > 0)
            .filter_map(|change| by_id.get(&change.project.id).copied())
            .collect();
        let with_merge_requests: Vec<i64> = changes
            .iter()
            .filter(|change| change.merge_requests > 0)
            .filter_map(|change| by_id.get(&change.project.id))
            .filter(|settings| settings.export.merge_requests)
            .map(|settings| settings.id)
            .collect();

        let (exported, ci, merge_requests) = tokio::join!(
            self.exporter.export(EntityKind::Projects, &projects),
            self.sync_ci(&with_pipelines, window),
            self.sync_merge_requests(&with_merge_requests, window),
        );
        errors.extend([exported, ci, merge_requests].into_iter().filter_map(Result::err));

        SyncError::join_result(errors)
    }

    async fn sync_ci(&self, projects: &[&ProjectSettings], window: SyncWindow) -> Result<()> {
        if projects.is_empty() {
            return Ok(());
        }
        let ids: Vec<i64> = projects.iter().map(|settings| settings.id).collect();
        let flags: HashMap<i64, ExportFlags> = projects
            .iter()
            .map(|settings| (settings.id, settings.export))
            .collect();
        let export_of = |hierarchy: &PipelineHierarchy| {
            flags
                .get(&hierarchy.root().pipeline.project_id)
                .copied()
                .unwrap_or_default()
        };

        let mut errors = Vec::new();
        let mut hierarchies = gather(
            fetch_pipeline_hierarchies(&self.ctx, &ids, window).await,
            &mut errors,
        );

        let mut log_jobs = Vec::new();
        let mut report_pipelines = Vec::new();
        let mut runner_ids = BTreeSet::new();
        for hierarchy in &hierarchies {
            let export = export_of(hierarchy);
            for entry in hierarchy.depth_first() {
                if export.needs_logs() {
                    log_jobs.extend(entry.jobs.iter().cloned());
                }
                if export.test_reports {
                    report_pipelines.push(entry.pipeline.clone());
                }
                runner_ids.extend(entry.jobs.iter().filter_map(|job| job.runner_id));
            }
        }
        let deployment_projects: Vec<i64> = projects
            .iter()
            .filter(|settings| settings.export.deployments)
            .map(|settings| settings.id)
            .collect();

        let (logs, reports, deployments, runners) = tokio::join!(
            fetch_job_logs(&self.ctx, &log_jobs),
            fetch_test_reports(&self.ctx, &report_pipelines),
            fetch_deployments(&self.ctx, &deployment_projects, window),
            fetch_runners(&self.ctx, runner_ids),
        );
        attach_job_logs(&mut hierarchies, gather(logs, &mut errors));
        let reports = gather(reports, &mut errors);
        let deployments = gather(deployments, &mut errors);
        let runners = gather(runners, &mut errors);

        let mut batch = ExportBatch::new();
        for hierarchy in &hierarchies {
            push_hierarchy(&mut batch, hierarchy, export_of(hierarchy));
        }
        push_test_reports(&mut batch, &reports);
        batch
            .push::<Deployment>(EntityKind::Deployments, &deployments)
            .push::<Runner>(EntityKind::Runners, &runners);

        if let Err(e) = self.exporter.export_batch(batch).await {
            errors.push(e);
        }
        SyncError::join_result(errors)
    }

    async fn sync_merge_requests(&self, ids: &[i64], window: SyncWindow) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let (merge_requests, fetch_error) =
            fetch_merge_requests(&self.ctx, ids, window).await?.into_parts();
        let exported = self
            .exporter
            .export(EntityKind::MergeRequests, &merge_requests)
            .await;

        SyncError::join_result(fetch_error.into_iter().chain(exported.err()).collect())
    }
}

/// Adds a pipeline hierarchy to `batch`, parents before children.
fn push_hierarchy(batch: &mut ExportBatch, hierarchy: &PipelineHierarchy, export: ExportFlags) {
    let entries = hierarchy.depth_first();
    let pipelines: Vec<&Pipeline> = entries.iter().map(|entry| &entry.pipeline).collect();
    batch.push(EntityKind::Pipelines, &pipelines);

    for entry in &entries {
        batch
            .push(EntityKind::Jobs, &entry.jobs)
            .push(EntityKind::Bridges, &entry.bridges);
        if export.sections {
            batch.push(EntityKind::Sections, &entry.sections);
        }
        if export.metrics {
            batch.push(EntityKind::Metrics, &entry.metrics);
        }
    }

    if export.traces {
        let trace = TraceData::from_hierarchy(hierarchy);
        if !trace.is_empty() {
            batch.push(EntityKind::Traces, &trace.into_spans());
        }
    }
}

fn push_test_reports(batch: &mut ExportBatch, reports: &[TestReport]) {
    batch.push(EntityKind::TestReports, reports);
    for report in reports {
        let (suites, cases) = report.flatten();
        batch
            .push(EntityKind::TestSuites, &suites)
            .push(EntityKind::TestCases, &cases);
    }
}
