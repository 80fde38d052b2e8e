use std::collections::{HashSet, VecDeque};

use log::{debug, warn};

use super::FetchContext;
use crate::error::{Result, SyncError};
use crate::gitlab::gid::parse_gid;
use crate::gitlab::hierarchy::{HierarchyEntry, PipelineHierarchy};
use crate::gitlab::nodes::{CiJob, PipelineNode, ProjectPipelinesNode};
use crate::gitlab::pagination::{drain_inner, flatten_nested, HasInner, Nested};
use crate::gitlab::types::PipelineRef;
use crate::pool::{Collected, WorkerPool};
use crate::window::SyncWindow;

/// Fetches every pipeline of `ids` updated in `window` as a hierarchy: the
/// pipeline, its jobs and bridges with their artifacts, and every downstream
/// pipeline reachable through bridges.
///
/// A pipeline whose upstream pipeline was updated in the same window is left
/// to its parent's hierarchy; any other child becomes a root of its own and
/// keeps its upstream reference.
///
/// # Errors
/// Failing to page through projects or pipelines aborts the fetch. Failures
/// while completing a single hierarchy are collected and the hierarchy is
/// exported with what could be fetched; conversion failures are logged and
/// the record is skipped.
pub async fn fetch_pipeline_hierarchies(
    ctx: &FetchContext,
    ids: &[i64],
    window: SyncWindow,
) -> Result<Collected<PipelineHierarchy>> {
    if ids.is_empty() {
        return Ok(Collected::default());
    }

    let nested = flatten_nested(
        |cursor| ctx.call(ctx.api.projects_pipelines(ids, window, cursor)),
        |project: &ProjectPipelinesNode, cursor: Option<String>| {
            let path = project.full_path.clone();
            async move {
                ctx.call(ctx.api.project_pipelines(&path, window, cursor))
                    .await
            }
        },
    )
    .await?;

    let fetched: HashSet<i64> = nested
        .iter()
        .flat_map(|project| &project.inner)
        .filter_map(|node| parse_gid(&node.id).ok())
        .collect();

    let mut pool = WorkerPool::new(ctx.cancel.clone());
    for Nested { parent, inner } in nested {
        let project_id = match parse_gid(&parent.id) {
            Ok(id) => id,
            Err(e) => {
                warn!("Skipping pipelines of '{}': {e}", parent.full_path);
                continue;
            }
        };

        for node in inner {
            if upstream_fetched(&node, &fetched) {
                debug!(
                    "Pipeline {} of '{}' is part of its upstream hierarchy",
                    node.iid, parent.full_path
                );
                continue;
            }

            let ctx = ctx.clone();
            let project_path = parent.full_path.clone();
            pool.submit(async move { build_hierarchy(&ctx, project_id, &project_path, node).await });
        }
    }

    let joined = pool.join().await?;
    let mut collected = Collected {
        values: Vec::new(),
        errors: joined.errors,
    };
    for (hierarchy, errors) in joined.values {
        collected.values.extend(hierarchy);
        collected.errors.extend(errors);
    }
    Ok(collected)
}

/// Whether the pipeline that triggered `node` is itself among the pipelines
/// fetched for this window, so `node` is reached through its bridge.
fn upstream_fetched(node: &PipelineNode, fetched: &HashSet<i64>) -> bool {
    node.upstream
        .as_ref()
        .and_then(|upstream| parse_gid(&upstream.id).ok())
        .is_some_and(|id| fetched.contains(&id))
}

/// A hierarchy along with the downstream pipelines that could not be added
/// to it.
type PartialHierarchy = (Option<PipelineHierarchy>, Vec<SyncError>);

/// Builds the hierarchy rooted at `root`, following bridges breadth-first.
///
/// The hierarchy is `None` when the root itself cannot be converted. A
/// downstream pipeline that fails to load is left out together with its own
/// children, and its error is returned next to the hierarchy.
async fn build_hierarchy(
    ctx: &FetchContext,
    project_id: i64,
    project_path: &str,
    root: PipelineNode,
) -> Result<PartialHierarchy> {
    let Some(entry) = build_entry(ctx, project_id, project_path, root).await? else {
        return Ok((None, Vec::new()));
    };

    let mut hierarchy = PipelineHierarchy::new(entry);
    let mut pending: VecDeque<(i64, i64, PipelineRef)> = downstream_refs(hierarchy.root());
    let mut errors = Vec::new();

    while let Some((parent, parent_project, downstream)) = pending.pop_front() {
        if hierarchy.contains(downstream.id) {
            continue;
        }

        let child_project = match downstream.project_id {
            Some(id) => id,
            None => parent_project,
        };

        let loaded = match ctx
            .call(ctx.api.pipeline(&downstream.project_path, &downstream.iid))
            .await
        {
            Ok(Some(node)) => {
                build_entry(ctx, child_project, &downstream.project_path, node).await
            }
            Ok(None) => {
                debug!(
                    "Downstream pipeline {} of '{}' is not visible",
                    downstream.iid, downstream.project_path
                );
                continue;
            }
            Err(e) => Err(e),
        };
        let child = match loaded {
            Ok(Some(child)) => child,
            Ok(None) => continue,
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                warn!(
                    "Leaving downstream pipeline {} out of pipeline {}: {e}",
                    downstream.id,
                    hierarchy.root_id()
                );
                errors.push(e);
                continue;
            }
        };

        pending.extend(downstream_refs(&child));
        if !hierarchy.attach(parent, child) {
            debug!("Pipeline {} already attached", downstream.id);
        }
    }

    debug!(
        "Pipeline {} of '{project_path}' spans {} pipelines",
        hierarchy.root_id(),
        hierarchy.len()
    );
    Ok((Some(hierarchy), errors))
}

fn downstream_refs(entry: &HierarchyEntry) -> VecDeque<(i64, i64, PipelineRef)> {
    entry
        .bridges
        .iter()
        .filter_map(|bridge| bridge.downstream.clone())
        .map(|downstream| (entry.pipeline.id, entry.pipeline.project_id, downstream))
        .collect()
}

/// Converts one pipeline and drains its jobs and their artifacts.
async fn build_entry(
    ctx: &FetchContext,
    project_id: i64,
    project_path: &str,
    mut node: PipelineNode,
) -> Result<Option<HierarchyEntry>> {
    let first_jobs = node.take_inner();
    let iid = node.iid.clone();

    let pipeline = match node.into_pipeline(project_id, project_path) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            warn!("Skipping pipeline {iid} of '{project_path}': {e}");
            return Ok(None);
        }
    };

    let jobs = drain_inner(first_jobs, |cursor| {
        ctx.call(ctx.api.pipeline_jobs(project_path, &iid, cursor))
    })
    .await?;

    let mut entry = HierarchyEntry::new(pipeline);
    for mut job in jobs {
        let gid = job.id.clone().unwrap_or_default();
        let artifacts = drain_inner(job.take_inner(), |cursor| {
            ctx.call(ctx.api.job_artifacts(project_path, &gid, cursor))
        })
        .await?;

        match job.into_ci_job(&entry.pipeline, artifacts) {
            Ok(CiJob::Build(job)) => entry.jobs.push(job),
            Ok(CiJob::Bridge(bridge)) => entry.bridges.push(bridge),
            Err(e) => warn!("Skipping job of pipeline {}: {e}", entry.pipeline.id),
        }
    }

    Ok(Some(entry))
}
