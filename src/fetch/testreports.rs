use log::debug;

use super::FetchContext;
use crate::error::Result;
use crate::gitlab::types::{Pipeline, TestReport};
use crate::pool::{Collected, WorkerPool};

/// Fetches the test report of every finished pipeline. Pipelines without any
/// test results are left out.
pub async fn fetch_test_reports(
    ctx: &FetchContext,
    pipelines: &[Pipeline],
) -> Result<Collected<TestReport>> {
    let mut pool = WorkerPool::new(ctx.cancel.clone());

    for pipeline in pipelines.iter().filter(|p| p.finished_at.is_some()) {
        let ctx = ctx.clone();
        let (project_id, pipeline_id) = (pipeline.project_id, pipeline.id);
        pool.submit(async move {
            ctx.call(ctx.api.pipeline_test_report(project_id, pipeline_id))
                .await
        });
    }

    let mut collected = pool.join().await?;
    collected.values.retain(|report| {
        let empty = report.total_count == 0 && report.test_suites.is_empty();
        if empty {
            debug!("Pipeline {} has no test report", report.pipeline_id);
        }
        !empty
    });
    Ok(collected)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::cancel::CancellationToken;
    use crate::gitlab::fake::FakeGitLab;

    #[tokio::test]
    async fn keeps_only_non_empty_reports_of_finished_pipelines() {
        let mut fake = FakeGitLab::default();
        fake.test_reports.insert(
            1,
            TestReport {
                total_count: 3,
                ..TestReport::default()
            },
        );
        let fake = Arc::new(fake);
        let ctx = FetchContext::new(fake.clone(), 2, CancellationToken::new());

        let finished = chrono::Utc::now();
        let pipelines = vec![
            Pipeline {
                id: 1,
                project_id: 9,
                finished_at: Some(finished),
                ..Pipeline::default()
            },
            Pipeline {
                id: 2,
                project_id: 9,
                finished_at: Some(finished),
                ..Pipeline::default()
            },
            Pipeline {
                id: 3,
                project_id: 9,
                ..Pipeline::default()
            },
        ];

        let collected = fetch_test_reports(&ctx, &pipelines).await.unwrap();
        assert_eq!(collected.values.len(), 1);
        assert_eq!(collected.values[0].pipeline_id, 1);
        assert_eq!(collected.values[0].project_id, 9);
        assert_eq!(fake.calls("pipeline_test_report"), 2);
    }
}
