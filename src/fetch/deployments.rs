use super::FetchContext;
use crate::error::Result;
use crate::gitlab::types::Deployment;
use crate::pool::{Collected, WorkerPool};
use crate::window::SyncWindow;

/// Fetches deployments updated in `window`, one task per project.
pub async fn fetch_deployments(
    ctx: &FetchContext,
    ids: &[i64],
    window: SyncWindow,
) -> Result<Collected<Deployment>> {
    let mut pool = WorkerPool::new(ctx.cancel.clone());

    for &project_id in ids {
        let ctx = ctx.clone();
        pool.submit(async move { ctx.call(ctx.api.deployments(project_id, window)).await });
    }

    let collected = pool.join().await?;
    Ok(Collected {
        values: collected.values.into_iter().flatten().collect(),
        errors: collected.errors,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;

    use super::*;
    use crate::cancel::CancellationToken;
    use crate::gitlab::fake::FakeGitLab;

    #[tokio::test]
    async fn gathers_deployments_of_all_projects() {
        let mut fake = FakeGitLab::default();
        fake.deployments.insert(
            1,
            vec![
                Deployment {
                    id: 10,
                    project_id: 1,
                    ..Deployment::default()
                },
                Deployment {
                    id: 11,
                    project_id: 1,
                    ..Deployment::default()
                },
            ],
        );
        fake.deployments.insert(
            2,
            vec![Deployment {
                id: 20,
                project_id: 2,
                ..Deployment::default()
            }],
        );
        let ctx = FetchContext::new(Arc::new(fake), 2, CancellationToken::new());

        let collected = fetch_deployments(&ctx, &[1, 2, 3], SyncWindow::trailing(Duration::hours(1)))
            .await
            .unwrap();

        let mut ids: Vec<_> = collected.values.iter().map(|d| d.id).collect();
        ids.sort_unstable();
        assert_eq!(ids, [10, 11, 20]);
    }
}
