use std::collections::HashMap;

use log::debug;

use super::FetchContext;
use crate::error::Result;
use crate::gitlab::hierarchy::PipelineHierarchy;
use crate::gitlab::types::{Job, JobMetric, JobSection};
use crate::joblog::{self, backfill_open};
use crate::pool::{Collected, WorkerPool};

/// Sections and metrics recovered from one job's log.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobLog {
    pub job_id: i64,
    pub pipeline_id: i64,
    pub sections: Vec<JobSection>,
    pub metrics: Vec<JobMetric>,
}

/// Downloads and parses the log of every job that started.
///
/// Sections still open at the end of a log are closed at the job's finish
/// time when it has one.
///
/// # Errors
/// Only cancellation is returned as an error; per-job download failures are
/// collected.
pub async fn fetch_job_logs(ctx: &FetchContext, jobs: &[Job]) -> Result<Collected<JobLog>> {
    let mut pool = WorkerPool::new(ctx.cancel.clone());

    for job in jobs.iter().filter(|job| job.started_at.is_some()) {
        let ctx = ctx.clone();
        let job = job.clone();
        pool.submit(async move {
            let log = ctx.call(ctx.api.job_log(job.project_id, job.id)).await?;
            Ok(job_log_records(&job, &log))
        });
    }

    pool.join().await
}

fn job_log_records(job: &Job, log: &[u8]) -> JobLog {
    let parsed = joblog::parse(log);
    for error in &parsed.errors {
        debug!("Job {}: rejected log {error}", job.id);
    }

    let mut sections = parsed.sections;
    if let Some(finished_at) = job.finished_at {
        backfill_open(&mut sections, finished_at.timestamp());
    }

    JobLog {
        job_id: job.id,
        pipeline_id: job.pipeline_id,
        sections: sections
            .into_iter()
            .enumerate()
            .map(|(index, section)| JobSection {
                job_id: job.id,
                pipeline_id: job.pipeline_id,
                project_id: job.project_id,
                index,
                name: section.name,
                start: section.start,
                end: section.end,
            })
            .collect(),
        metrics: parsed
            .metrics
            .into_iter()
            .map(|metric| JobMetric {
                job_id: job.id,
                pipeline_id: job.pipeline_id,
                project_id: job.project_id,
                name: metric.name,
                labels: metric.labels,
                value: metric.value,
                timestamp: metric.timestamp,
            })
            .collect(),
    }
}

/// Moves parsed logs into the hierarchy entries of their pipelines.
///
/// Logs of pipelines outside `hierarchies` are dropped.
pub fn attach_job_logs(hierarchies: &mut [PipelineHierarchy], logs: Vec<JobLog>) {
    let mut by_pipeline: HashMap<i64, Vec<JobLog>> = HashMap::new();
    for log in logs {
        by_pipeline.entry(log.pipeline_id).or_default().push(log);
    }

    for hierarchy in hierarchies.iter_mut() {
        for entry in hierarchy.entries_mut() {
            if let Some(logs) = by_pipeline.remove(&entry.pipeline.id) {
                for log in logs {
                    entry.sections.extend(log.sections);
                    entry.metrics.extend(log.metrics);
                }
            }
        }
    }

    if !by_pipeline.is_empty() {
        debug!("{} pipelines had logs but no hierarchy", by_pipeline.len());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::cancel::CancellationToken;
    use crate::gitlab::fake::FakeGitLab;
    use crate::gitlab::hierarchy::HierarchyEntry;
    use crate::gitlab::types::Pipeline;

    fn job(id: i64, started: bool) -> Job {
        Job {
            id,
            pipeline_id: 7,
            project_id: 3,
            name: format!("job{id}"),
            started_at: started.then(|| Utc.timestamp_opt(1_700_000_000, 0).unwrap()),
            finished_at: Some(Utc.timestamp_opt(1_700_000_500, 0).unwrap()),
            ..Job::default()
        }
    }

    #[tokio::test]
    async fn parses_logs_and_backfills_open_sections() {
        let mut fake = FakeGitLab::default();
        fake.logs.insert(
            1,
            b"section_start:1700000010:build\r\x1b[0K\nMETRIC_duration{stage=\"build\"} 4.5\nsection_start:1700000020:upload\r\x1b[0K\n"
                .to_vec(),
        );
        let ctx = FetchContext::new(Arc::new(fake), 2, CancellationToken::new());

        let collected = fetch_job_logs(&ctx, &[job(1, true), job(2, false)])
            .await
            .unwrap();

        assert!(collected.errors.is_empty());
        assert_eq!(collected.values.len(), 1, "jobs that never started have no log");
        let log = &collected.values[0];
        assert_eq!(log.job_id, 1);
        assert_eq!(log.metrics.len(), 1);
        assert_eq!(log.metrics[0].name, "duration");
        assert_eq!(log.metrics[0].project_id, 3);
        assert_eq!(log.sections.len(), 2);
        assert!(log.sections.iter().all(|s| s.end == Some(1_700_000_500)));
    }

    #[tokio::test]
    async fn missing_logs_are_collected_as_errors() {
        let ctx = FetchContext::new(Arc::new(FakeGitLab::default()), 2, CancellationToken::new());
        let collected = fetch_job_logs(&ctx, &[job(1, true)]).await.unwrap();
        assert!(collected.values.is_empty());
        assert_eq!(collected.errors.len(), 1);
    }

    #[test]
    fn attaches_logs_to_their_pipeline() {
        let mut hierarchies = vec![PipelineHierarchy::new(HierarchyEntry::new(Pipeline {
            id: 7,
            ..Pipeline::default()
        }))];
        let log = job_log_records(&job(1, true), b"METRIC_a 1\n");

        attach_job_logs(&mut hierarchies, vec![log]);
        assert_eq!(hierarchies[0].root().metrics.len(), 1);
    }
}
