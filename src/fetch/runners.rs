use std::collections::BTreeSet;

use super::FetchContext;
use crate::error::Result;
use crate::gitlab::types::Runner;
use crate::pool::{Collected, WorkerPool};

/// Fetches each distinct runner once.
pub async fn fetch_runners(
    ctx: &FetchContext,
    ids: impl IntoIterator<Item = i64>,
) -> Result<Collected<Runner>> {
    let ids: BTreeSet<i64> = ids.into_iter().collect();
    let mut pool = WorkerPool::new(ctx.cancel.clone());

    for id in ids {
        let ctx = ctx.clone();
        pool.submit(async move { ctx.call(ctx.api.runner(id)).await });
    }

    pool.join().await
}
