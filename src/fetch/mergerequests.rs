use log::{debug, warn};

use super::{convert_all, FetchContext};
use crate::error::{Result, SyncError};
use crate::gitlab::gid::parse_gid;
use crate::gitlab::nodes::{MergeRequestFields, MergeRequestNode, ProjectMergeRequestsNode};
use crate::gitlab::pagination::{flatten_nested, merge_partials, Nested};
use crate::gitlab::types::MergeRequest;
use crate::pool::Collected;
use crate::window::SyncWindow;

/// One pass over the merge requests of `ids`, restricted to `fields`.
async fn fetch_pass(
    ctx: &FetchContext,
    ids: &[i64],
    window: SyncWindow,
    fields: MergeRequestFields,
) -> Result<Vec<Nested<ProjectMergeRequestsNode, MergeRequestNode>>> {
    flatten_nested(
        |cursor| ctx.call(ctx.api.merge_requests(ids, window, fields, cursor)),
        |project: &ProjectMergeRequestsNode, cursor: Option<String>| {
            let path = project.full_path.clone();
            async move {
                ctx.call(ctx.api.project_merge_requests(&path, window, fields, cursor))
                    .await
            }
        },
    )
    .await
}

/// Fetches merge requests updated in `window`.
///
/// A merge request has more fields than one query may request, so the same
/// paginated query runs once per field subset and the partial records are
/// merged by id into the `core` records. Partials whose id never showed up in
/// the `core` pass are reported as errors and otherwise ignored.
///
/// # Errors
/// A failing pass aborts the fetch.
pub async fn fetch_merge_requests(
    ctx: &FetchContext,
    ids: &[i64],
    window: SyncWindow,
) -> Result<Collected<MergeRequest>> {
    if ids.is_empty() {
        return Ok(Collected::default());
    }

    let (core, extra, participants) = futures::try_join!(
        fetch_pass(ctx, ids, window, MergeRequestFields::Core),
        fetch_pass(ctx, ids, window, MergeRequestFields::Extra),
        fetch_pass(ctx, ids, window, MergeRequestFields::Participants),
    )?;

    let mut base = Vec::new();
    for Nested { parent, inner } in core {
        let project_id = match parse_gid(&parent.id) {
            Ok(id) => id,
            Err(e) => {
                warn!("Skipping merge requests of '{}': {e}", parent.full_path);
                continue;
            }
        };
        base.extend(convert_all(inner, "merge request", |node| {
            node.into_merge_request(project_id)
        }));
    }

    let mut errors = Vec::new();
    let mut records = base;
    for (fields, pass) in [
        (MergeRequestFields::Extra, extra),
        (MergeRequestFields::Participants, participants),
    ] {
        let partials = convert_all(
            pass.into_iter().flat_map(|nested| nested.inner),
            "merge request partial",
            |node| Ok((node.numeric_id()?, node)),
        );

        let outcome = merge_partials(
            records,
            partials,
            |mr| mr.id,
            |(id, _)| *id,
            |mr, (_, node)| node.merge_into(mr),
        );
        records = outcome.records;

        if !outcome.orphans.is_empty() {
            warn!(
                "{} merge requests from the {} pass have no core record: {:?}",
                outcome.orphans.len(),
                fields.as_str(),
                outcome.orphans
            );
            errors.extend(outcome.orphans.into_iter().map(|id| {
                SyncError::Conversion(format!(
                    "merge request {id} from the {} pass has no core record",
                    fields.as_str()
                ))
            }));
        }
    }

    debug!("Fetched {} merge requests", records.len());
    Ok(Collected {
        values: records,
        errors,
    })
}
