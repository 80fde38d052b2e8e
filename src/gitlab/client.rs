mod core;
mod graphql;
mod rest;

use async_trait::async_trait;

pub use self::core::{GitLabClient, RetryPolicy};
use super::api::{GitLabApi, NamespaceKind};
use super::nodes::{
    ArtifactNode, JobNode, MergeRequestFields, MergeRequestNode, PipelineNode,
    ProjectChangesNode, ProjectMergeRequestsNode, ProjectPipelinesNode,
};
use super::pagination::Page;
use super::types::{Deployment, Project, Runner, TestReport};
use crate::error::Result;
use crate::window::SyncWindow;

#[async_trait]
impl GitLabApi for GitLabClient {
    async fn namespace_kind(&self, namespace: &str) -> Result<NamespaceKind> {
        self.fetch_namespace_kind(namespace).await
    }

    async fn namespace_projects(
        &self,
        namespace: &str,
        kind: NamespaceKind,
        include_subgroups: bool,
        with_shared: bool,
    ) -> Result<Vec<Project>> {
        self.fetch_namespace_projects(namespace, kind, include_subgroups, with_shared)
            .await
    }

    async fn project(&self, project: &str) -> Result<Project> {
        self.fetch_project(project).await
    }

    async fn project_changes(
        &self,
        ids: &[i64],
        window: SyncWindow,
        cursor: Option<String>,
    ) -> Result<Page<ProjectChangesNode>> {
        self.fetch_project_changes(ids, window, cursor).await
    }

    async fn projects_pipelines(
        &self,
        ids: &[i64],
        window: SyncWindow,
        cursor: Option<String>,
    ) -> Result<Page<ProjectPipelinesNode>> {
        self.fetch_projects_pipelines(ids, window, cursor).await
    }

    async fn project_pipelines(
        &self,
        project_path: &str,
        window: SyncWindow,
        cursor: Option<String>,
    ) -> Result<Page<PipelineNode>> {
        self.fetch_project_pipelines(project_path, window, cursor)
            .await
    }

    async fn pipeline(&self, project_path: &str, iid: &str) -> Result<Option<PipelineNode>> {
        self.fetch_pipeline(project_path, iid).await
    }

    async fn pipeline_jobs(
        &self,
        project_path: &str,
        pipeline_iid: &str,
        cursor: Option<String>,
    ) -> Result<Page<JobNode>> {
        self.fetch_pipeline_jobs(project_path, pipeline_iid, cursor)
            .await
    }

    async fn job_artifacts(
        &self,
        project_path: &str,
        job_gid: &str,
        cursor: Option<String>,
    ) -> Result<Page<ArtifactNode>> {
        self.fetch_job_artifacts(project_path, job_gid, cursor)
            .await
    }

    async fn job_log(&self, project_id: i64, job_id: i64) -> Result<Vec<u8>> {
        self.fetch_job_log(project_id, job_id).await
    }

    async fn pipeline_test_report(
        &self,
        project_id: i64,
        pipeline_id: i64,
    ) -> Result<TestReport> {
        self.fetch_test_report(project_id, pipeline_id).await
    }

    async fn merge_requests(
        &self,
        ids: &[i64],
        window: SyncWindow,
        fields: MergeRequestFields,
        cursor: Option<String>,
    ) -> Result<Page<ProjectMergeRequestsNode>> {
        self.fetch_merge_requests(ids, window, fields, cursor).await
    }

    async fn project_merge_requests(
        &self,
        project_path: &str,
        window: SyncWindow,
        fields: MergeRequestFields,
        cursor: Option<String>,
    ) -> Result<Page<MergeRequestNode>> {
        self.fetch_project_merge_requests(project_path, window, fields, cursor)
            .await
    }

    async fn deployments(&self, project_id: i64, window: SyncWindow) -> Result<Vec<Deployment>> {
        self.fetch_deployments(project_id, window).await
    }

    async fn runner(&self, id: i64) -> Result<Runner> {
        self.fetch_runner(id).await
    }

    async fn check_readiness(&self) -> Result<()> {
        self.fetch_version().await
    }
}
