use log::debug;

use super::{convert_all, FetchContext};
use crate::error::Result;
use crate::gitlab::pagination::Paginator;
use crate::gitlab::types::ProjectChanges;
use crate::pool::Collected;
use crate::window::SyncWindow;

/// Resolves which of `ids` changed inside `window` with one combined query:
/// project metadata plus the number of pipelines and merge requests updated in
/// the window.
///
/// # Errors
/// Pagination failures abort the fetch. Projects whose ids cannot be parsed
/// are logged and skipped.
pub async fn fetch_project_changes(
    ctx: &FetchContext,
    ids: &[i64],
    window: SyncWindow,
) -> Result<Collected<ProjectChanges>> {
    if ids.is_empty() {
        return Ok(Collected::default());
    }

    let nodes = Paginator::new(|cursor| ctx.call(ctx.api.project_changes(ids, window, cursor)))
        .collect_all()
        .await?;

    let changes = convert_all(nodes, "project", |node| {
        let (project, pipelines, merge_requests) = node.into_project()?;
        let updated = [project.updated_at, project.last_activity_at]
            .into_iter()
            .flatten()
            .any(|at| window.contains(at));
        Ok(ProjectChanges {
            project,
            updated,
            pipelines,
            merge_requests,
        })
    });

    debug!(
        "{} of {} projects report changes between {} and {}",
        changes
            .iter()
            .filter(|c| c.updated || c.pipelines > 0 || c.merge_requests > 0)
            .count(),
        ids.len(),
        window.after,
        window.before
    );

    Ok(Collected::from_values(changes))
}
