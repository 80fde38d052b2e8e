use serde::Deserialize;
use serde_json::json;

use super::core::GitLabClient;
use crate::error::{Result, SyncError};
use crate::gitlab::gid::project_gid;
use crate::gitlab::nodes::{
    ArtifactNode, JobNode, MergeRequestFields, MergeRequestNode, PipelineNode,
    ProjectChangesNode, ProjectMergeRequestsNode, ProjectPipelinesNode,
};
use crate::gitlab::pagination::{Connection, HasInner, Page};
use crate::window::SyncWindow;

macro_rules! document {
    ($($file:literal),+ $(,)?) => {
        concat!($(include_str!(concat!("queries/", $file))),+)
    };
}

const PROJECT_CHANGES: &str = document!("project_changes.graphql");
const PROJECTS_PIPELINES: &str = document!(
    "artifact_fields.graphql",
    "job_fields.graphql",
    "pipeline_fields.graphql",
    "projects_pipelines.graphql",
);
const PROJECT_PIPELINES: &str = document!(
    "artifact_fields.graphql",
    "job_fields.graphql",
    "pipeline_fields.graphql",
    "project_pipelines.graphql",
);
const PIPELINE: &str = document!(
    "artifact_fields.graphql",
    "job_fields.graphql",
    "pipeline_fields.graphql",
    "pipeline.graphql",
);
const PIPELINE_JOBS: &str = document!(
    "artifact_fields.graphql",
    "job_fields.graphql",
    "pipeline_jobs.graphql",
);
const JOB_ARTIFACTS: &str = document!("artifact_fields.graphql", "job_artifacts.graphql");

const MERGE_REQUESTS_CORE: &str =
    document!("merge_request_core.graphql", "merge_requests.graphql");
const MERGE_REQUESTS_EXTRA: &str =
    document!("merge_request_extra.graphql", "merge_requests.graphql");
const MERGE_REQUESTS_PARTICIPANTS: &str =
    document!("merge_request_participants.graphql", "merge_requests.graphql");

const PROJECT_MERGE_REQUESTS_CORE: &str =
    document!("merge_request_core.graphql", "project_merge_requests.graphql");
const PROJECT_MERGE_REQUESTS_EXTRA: &str =
    document!("merge_request_extra.graphql", "project_merge_requests.graphql");
const PROJECT_MERGE_REQUESTS_PARTICIPANTS: &str = document!(
    "merge_request_participants.graphql",
    "project_merge_requests.graphql"
);

#[derive(Debug, Deserialize)]
struct ProjectsData<T> {
    projects: Option<Connection<T>>,
}

#[derive(Debug, Deserialize)]
struct ProjectData<T> {
    project: Option<T>,
}

#[derive(Debug, Deserialize)]
struct PipelinesHolder {
    pipelines: Option<Connection<PipelineNode>>,
}

#[derive(Debug, Deserialize)]
struct PipelineHolder {
    pipeline: Option<PipelineNode>,
}

#[derive(Debug, Deserialize)]
struct JobHolder {
    job: Option<JobNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MergeRequestsHolder {
    merge_requests: Option<Connection<MergeRequestNode>>,
}

fn project_gids(ids: &[i64]) -> Vec<String> {
    ids.iter().copied().map(project_gid).collect()
}

fn window_variables(window: SyncWindow) -> (String, String) {
    (window.after.to_rfc3339(), window.before.to_rfc3339())
}

impl GitLabClient {
    async fn project_scoped<T>(
        &self,
        operation: &'static str,
        query: &'static str,
        project_path: &str,
        variables: serde_json::Value,
    ) -> Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        let data: ProjectData<T> = self
            .execute_graphql_request(operation, query, variables)
            .await?;
        data.project
            .ok_or_else(|| SyncError::ProjectNotFound(project_path.to_string()))
    }

    pub(super) async fn fetch_project_changes(
        &self,
        ids: &[i64],
        window: SyncWindow,
        cursor: Option<String>,
    ) -> Result<Page<ProjectChangesNode>> {
        let (after, before) = window_variables(window);
        let data: ProjectsData<ProjectChangesNode> = self
            .execute_graphql_request(
                "ProjectChanges",
                PROJECT_CHANGES,
                json!({
                    "ids": project_gids(ids),
                    "updatedAfter": after,
                    "updatedBefore": before,
                    "after": cursor,
                }),
            )
            .await?;
        Ok(data.projects.into())
    }

    pub(super) async fn fetch_projects_pipelines(
        &self,
        ids: &[i64],
        window: SyncWindow,
        cursor: Option<String>,
    ) -> Result<Page<ProjectPipelinesNode>> {
        let (after, before) = window_variables(window);
        let data: ProjectsData<ProjectPipelinesNode> = self
            .execute_graphql_request(
                "ProjectsPipelines",
                PROJECTS_PIPELINES,
                json!({
                    "ids": project_gids(ids),
                    "updatedAfter": after,
                    "updatedBefore": before,
                    "after": cursor,
                }),
            )
            .await?;
        Ok(data.projects.into())
    }

    pub(super) async fn fetch_project_pipelines(
        &self,
        project_path: &str,
        window: SyncWindow,
        cursor: Option<String>,
    ) -> Result<Page<PipelineNode>> {
        let (after, before) = window_variables(window);
        let project: PipelinesHolder = self
            .project_scoped(
                "ProjectPipelines",
                PROJECT_PIPELINES,
                project_path,
                json!({
                    "fullPath": project_path,
                    "updatedAfter": after,
                    "updatedBefore": before,
                    "after": cursor,
                }),
            )
            .await?;
        Ok(project.pipelines.into())
    }

    pub(super) async fn fetch_pipeline(
        &self,
        project_path: &str,
        iid: &str,
    ) -> Result<Option<PipelineNode>> {
        let project: PipelineHolder = self
            .project_scoped(
                "Pipeline",
                PIPELINE,
                project_path,
                json!({ "fullPath": project_path, "iid": iid }),
            )
            .await?;
        Ok(project.pipeline)
    }

    pub(super) async fn fetch_pipeline_jobs(
        &self,
        project_path: &str,
        iid: &str,
        cursor: Option<String>,
    ) -> Result<Page<JobNode>> {
        let project: PipelineHolder = self
            .project_scoped(
                "PipelineJobs",
                PIPELINE_JOBS,
                project_path,
                json!({ "fullPath": project_path, "iid": iid, "after": cursor }),
            )
            .await?;
        Ok(project
            .pipeline
            .map(|mut pipeline| pipeline.take_inner())
            .unwrap_or_else(|| Page::last(Vec::new())))
    }

    pub(super) async fn fetch_job_artifacts(
        &self,
        project_path: &str,
        job_gid: &str,
        cursor: Option<String>,
    ) -> Result<Page<ArtifactNode>> {
        let project: JobHolder = self
            .project_scoped(
                "JobArtifacts",
                JOB_ARTIFACTS,
                project_path,
                json!({ "fullPath": project_path, "id": job_gid, "after": cursor }),
            )
            .await?;
        Ok(project
            .job
            .map(|mut job| job.take_inner())
            .unwrap_or_else(|| Page::last(Vec::new())))
    }

    pub(super) async fn fetch_merge_requests(
        &self,
        ids: &[i64],
        window: SyncWindow,
        fields: MergeRequestFields,
        cursor: Option<String>,
    ) -> Result<Page<ProjectMergeRequestsNode>> {
        let query = match fields {
            MergeRequestFields::Core => MERGE_REQUESTS_CORE,
            MergeRequestFields::Extra => MERGE_REQUESTS_EXTRA,
            MergeRequestFields::Participants => MERGE_REQUESTS_PARTICIPANTS,
        };
        let (after, before) = window_variables(window);
        let data: ProjectsData<ProjectMergeRequestsNode> = self
            .execute_graphql_request(
                "MergeRequests",
                query,
                json!({
                    "ids": project_gids(ids),
                    "updatedAfter": after,
                    "updatedBefore": before,
                    "after": cursor,
                }),
            )
            .await?;
        Ok(data.projects.into())
    }

    pub(super) async fn fetch_project_merge_requests(
        &self,
        project_path: &str,
        window: SyncWindow,
        fields: MergeRequestFields,
        cursor: Option<String>,
    ) -> Result<Page<MergeRequestNode>> {
        let query = match fields {
            MergeRequestFields::Core => PROJECT_MERGE_REQUESTS_CORE,
            MergeRequestFields::Extra => PROJECT_MERGE_REQUESTS_EXTRA,
            MergeRequestFields::Participants => PROJECT_MERGE_REQUESTS_PARTICIPANTS,
        };
        let (after, before) = window_variables(window);
        let project: MergeRequestsHolder = self
            .project_scoped(
                "ProjectMergeRequests",
                query,
                project_path,
                json!({
                    "fullPath": project_path,
                    "updatedAfter": after,
                    "updatedBefore": before,
                    "after": cursor,
                }),
            )
            .await?;
        Ok(project.merge_requests.into())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use mockito::{Matcher, Server};

    use super::super::core::fast_retry;
    use super::*;

    fn window() -> SyncWindow {
        SyncWindow::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
        )
    }

    #[test]
    fn documents_carry_their_fragments() {
        assert!(PROJECTS_PIPELINES.contains("fragment PipelineFields"));
        assert!(PROJECTS_PIPELINES.contains("fragment JobFields"));
        assert!(PIPELINE_JOBS.contains("fragment ArtifactFields"));
        assert!(!PIPELINE_JOBS.contains("fragment PipelineFields"));
        assert!(MERGE_REQUESTS_EXTRA.contains("diffStatsSummary"));
        assert!(!MERGE_REQUESTS_EXTRA.contains("participants"));
        assert!(PROJECT_MERGE_REQUESTS_PARTICIPANTS.contains("reviewers"));
    }

    #[tokio::test]
    async fn project_changes_sends_window_and_gids() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/api/graphql")
            .match_body(Matcher::PartialJson(json!({
                "operationName": "ProjectChanges",
                "variables": {
                    "ids": ["gid://gitlab/Project/1", "gid://gitlab/Project/2"],
                    "updatedAfter": "2024-01-01T00:00:00+00:00",
                    "updatedBefore": "2024-01-02T00:00:00+00:00",
                    "after": null
                }
            })))
            .with_status(200)
            .with_body(
                r#"{"data": {"projects": {
                    "nodes": [{"id": "gid://gitlab/Project/1", "fullPath": "g/a", "name": "a",
                               "pipelines": {"count": 2}, "mergeRequests": {"count": 1}}],
                    "pageInfo": {"endCursor": "next", "hasNextPage": true}}}}"#,
            )
            .create_async()
            .await;

        let client = GitLabClient::new(&server.url(), None, fast_retry(0), None).unwrap();
        let page = client
            .fetch_project_changes(&[1, 2], window(), None)
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].full_path, "g/a");
        assert_eq!(page.next_cursor().as_deref(), Some("next"));
    }

    #[tokio::test]
    async fn missing_project_is_reported() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/api/graphql")
            .with_status(200)
            .with_body(r#"{"data": {"project": null}}"#)
            .create_async()
            .await;

        let client = GitLabClient::new(&server.url(), None, fast_retry(0), None).unwrap();
        let err = client
            .fetch_project_pipelines("g/missing", window(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::ProjectNotFound(path) if path == "g/missing"));
    }

    #[tokio::test]
    async fn pipeline_jobs_returns_job_page() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/api/graphql")
            .match_body(Matcher::PartialJson(json!({
                "variables": {"fullPath": "g/a", "iid": "4", "after": "c1"}
            })))
            .with_status(200)
            .with_body(
                r#"{"data": {"project": {"pipeline": {"id": "gid://gitlab/Ci::Pipeline/9", "iid": "4",
                    "jobs": {"nodes": [{"id": "gid://gitlab/Ci::Build/3", "name": "test"}],
                             "pageInfo": {"endCursor": null, "hasNextPage": false}}}}}}"#,
            )
            .create_async()
            .await;

        let client = GitLabClient::new(&server.url(), None, fast_retry(0), None).unwrap();
        let page = client
            .fetch_pipeline_jobs("g/a", "4", Some("c1".into()))
            .await
            .unwrap();

        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].name.as_deref(), Some("test"));
        assert!(page.next_cursor().is_none());
    }
}
