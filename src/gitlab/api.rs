use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::nodes::{
    ArtifactNode, JobNode, MergeRequestFields, MergeRequestNode, PipelineNode,
    ProjectChangesNode, ProjectMergeRequestsNode, ProjectPipelinesNode,
};
use super::pagination::Page;
use super::types::{Deployment, Project, Runner, TestReport};
use crate::error::Result;
use crate::window::SyncWindow;

/// Kind of container a namespace id refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceKind {
    User,
    Group,
}

/// Remote calls used by the fetch tasks and the controller.
///
/// Every method issues a single bounded unit of work: one page, one object or
/// one byte stream.
#[async_trait]
pub trait GitLabApi: Send + Sync {
    /// Resolves whether `namespace` (id or full path) is a user or a group.
    async fn namespace_kind(&self, namespace: &str) -> Result<NamespaceKind>;

    /// All projects of a namespace, following offset pagination.
    async fn namespace_projects(
        &self,
        namespace: &str,
        kind: NamespaceKind,
        include_subgroups: bool,
        with_shared: bool,
    ) -> Result<Vec<Project>>;

    /// A single project by numeric id or full path.
    async fn project(&self, project: &str) -> Result<Project>;

    /// Project metadata plus counts of pipelines and merge requests updated in
    /// `window`.
    async fn project_changes(
        &self,
        ids: &[i64],
        window: SyncWindow,
        cursor: Option<String>,
    ) -> Result<Page<ProjectChangesNode>>;

    /// Projects with their first page of pipelines updated in `window`.
    async fn projects_pipelines(
        &self,
        ids: &[i64],
        window: SyncWindow,
        cursor: Option<String>,
    ) -> Result<Page<ProjectPipelinesNode>>;

    /// Remaining pipelines of one project.
    async fn project_pipelines(
        &self,
        project_path: &str,
        window: SyncWindow,
        cursor: Option<String>,
    ) -> Result<Page<PipelineNode>>;

    /// One pipeline with its first page of jobs; `None` when it does not exist.
    async fn pipeline(&self, project_path: &str, iid: &str) -> Result<Option<PipelineNode>>;

    /// Remaining jobs of one pipeline.
    async fn pipeline_jobs(
        &self,
        project_path: &str,
        pipeline_iid: &str,
        cursor: Option<String>,
    ) -> Result<Page<JobNode>>;

    /// Remaining artifacts of one job, addressed by its global id.
    async fn job_artifacts(
        &self,
        project_path: &str,
        job_gid: &str,
        cursor: Option<String>,
    ) -> Result<Page<ArtifactNode>>;

    /// Raw job log.
    async fn job_log(&self, project_id: i64, job_id: i64) -> Result<Vec<u8>>;

    async fn pipeline_test_report(&self, project_id: i64, pipeline_id: i64)
        -> Result<TestReport>;

    /// Projects with their first page of merge requests updated in `window`,
    /// restricted to one field subset.
    async fn merge_requests(
        &self,
        ids: &[i64],
        window: SyncWindow,
        fields: MergeRequestFields,
        cursor: Option<String>,
    ) -> Result<Page<ProjectMergeRequestsNode>>;

    /// Remaining merge requests of one project, restricted to one field subset.
    async fn project_merge_requests(
        &self,
        project_path: &str,
        window: SyncWindow,
        fields: MergeRequestFields,
        cursor: Option<String>,
    ) -> Result<Page<MergeRequestNode>>;

    /// Deployments of one project updated in `window`.
    async fn deployments(&self, project_id: i64, window: SyncWindow) -> Result<Vec<Deployment>>;

    async fn runner(&self, id: i64) -> Result<Runner>;

    /// Cheap authenticated call used by health checks.
    async fn check_readiness(&self) -> Result<()>;
}
