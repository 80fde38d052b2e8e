use crate::error::{Result, SyncError};

/// Extracts the numeric id from a GraphQL Global ID.
///
/// GitLab GIDs look like `gid://gitlab/Ci::Pipeline/123`; the id is everything
/// after the last slash and must be a positive integer.
pub fn parse_gid(gid: &str) -> Result<i64> {
    let Some(rest) = gid.strip_prefix("gid://gitlab/") else {
        return Err(SyncError::Conversion(format!("malformed global id '{gid}'")));
    };

    rest.rsplit('/')
        .next()
        .and_then(|id| id.parse::<i64>().ok())
        .filter(|id| *id > 0)
        .ok_or_else(|| SyncError::Conversion(format!("malformed global id '{gid}'")))
}

/// Builds the Global ID of a project, as expected by `projects(ids:)`.
pub fn project_gid(id: i64) -> String {
    format!("gid://gitlab/Project/{id}")
}
