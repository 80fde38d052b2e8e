//! Per-entity fetch tasks.
//!
//! Every remote call goes through [`FetchContext::call`], which holds one unit
//! of the shared semaphore for the duration of the call. All entity kinds and
//! all batches compete for the same permits, capping total outbound API
//! concurrency.

mod deployments;
mod joblogs;
mod mergerequests;
mod pipelines;
mod projects;
mod runners;
mod testreports;

use std::future::Future;
use std::sync::Arc;

use log::warn;
use tokio::sync::Semaphore;

pub use deployments::fetch_deployments;
pub use joblogs::{attach_job_logs, fetch_job_logs};
pub use mergerequests::fetch_merge_requests;
pub use pipelines::fetch_pipeline_hierarchies;
pub use projects::fetch_project_changes;
pub use runners::fetch_runners;
pub use testreports::fetch_test_reports;

use crate::cancel::CancellationToken;
use crate::error::{Result, SyncError};
use crate::gitlab::GitLabApi;

pub const DEFAULT_CONCURRENCY: usize = 42;

/// Shared handles passed to every fetch task.
#[derive(Clone)]
pub struct FetchContext {
    pub api: Arc<dyn GitLabApi>,
    pub limiter: Arc<Semaphore>,
    pub cancel: CancellationToken,
}

impl FetchContext {
    pub fn new(api: Arc<dyn GitLabApi>, concurrency: usize, cancel: CancellationToken) -> Self {
        Self {
            api,
            limiter: Arc::new(Semaphore::new(concurrency.max(1))),
            cancel,
        }
    }

    /// Runs one bounded unit of remote work while holding a permit.
    ///
    /// `work` is not polled before a permit is held. Both the wait for a
    /// permit and the call itself return [`SyncError::Cancelled`] promptly
    /// once the token fires.
    pub async fn call<T>(&self, work: impl Future<Output = Result<T>>) -> Result<T> {
        let _permit = tokio::select! {
            permit = self.limiter.acquire() => permit.map_err(|_| SyncError::Cancelled)?,
            () = self.cancel.cancelled() => return Err(SyncError::Cancelled),
        };

        tokio::select! {
            result = work => result,
            () = self.cancel.cancelled() => Err(SyncError::Cancelled),
        }
    }
}

/// Converts every item, logging and dropping those that fail.
pub(crate) fn convert_all<I, T>(
    items: impl IntoIterator<Item = I>,
    what: &str,
    mut convert: impl FnMut(I) -> Result<T>,
) -> Vec<T> {
    items
        .into_iter()
        .filter_map(|item| match convert(item) {
            Ok(converted) => Some(converted),
            Err(e) => {
                warn!("Skipping {what}: {e}");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::gitlab::fake::FakeGitLab;
    use crate::pool::WorkerPool;

    fn context(concurrency: usize) -> FetchContext {
        FetchContext::new(
            Arc::new(FakeGitLab::default()),
            concurrency,
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn permits_bound_concurrent_calls() {
        const TASKS: usize = 20;
        const PERMITS: usize = 3;

        let ctx = context(PERMITS);
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut pool = WorkerPool::new(ctx.cancel.clone());
        for i in 0..TASKS {
            let ctx = ctx.clone();
            let active = Arc::clone(&active);
            let max_seen = Arc::clone(&max_seen);
            pool.submit(async move {
                ctx.call(async {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(i)
                })
                .await
            });
        }

        let collected = pool.join().await.unwrap();
        assert_eq!(collected.values.len(), TASKS);
        assert!(collected.errors.is_empty());
        assert!(max_seen.load(Ordering::SeqCst) <= PERMITS);
        assert!(max_seen.load(Ordering::SeqCst) >= 1);
        assert_eq!(ctx.limiter.available_permits(), PERMITS);
    }

    #[tokio::test]
    async fn permit_wait_honours_cancellation() {
        let ctx = context(1);
        let _held = ctx.limiter.clone().acquire_owned().await.unwrap();

        let waiter = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.call(async { Ok(()) }).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        ctx.cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(SyncError::Cancelled)));
    }

    #[tokio::test]
    async fn in_flight_call_honours_cancellation() {
        let ctx = context(1);
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel.cancel();
        });

        let result = ctx
            .call(async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(SyncError::Cancelled)));
        assert_eq!(ctx.limiter.available_permits(), 1);
    }

    #[test]
    fn convert_all_skips_failures() {
        let converted = convert_all(["1", "x", "3"], "number", |s| {
            s.parse::<i32>()
                .map_err(|e| SyncError::Conversion(e.to_string()))
        });
        assert_eq!(converted, [1, 3]);
    }
}
