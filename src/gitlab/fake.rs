//! In-memory [`GitLabApi`] for tests.
//!
//! Stored connections are complete; the fake cuts them into pages of
//! `page_size` (0 means everything on one page) when serving, so callers see
//! the same inline-first-page shape as the real API.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use indexmap::IndexMap;

use super::api::{GitLabApi, NamespaceKind};
use super::gid::{parse_gid, project_gid};
use super::nodes::{
    ArtifactNode, CountNode, JobNode, MergeRequestFields, MergeRequestNode, PipelineNode,
    PipelineRefNode, ProjectChangesNode, ProjectMergeRequestsNode, ProjectPipelinesNode,
    ProjectRefNode,
};
use super::pagination::{Connection, Page, PageInfo};
use super::types::{Deployment, Project, Runner, TestReport};
use crate::error::{Result, SyncError};
use crate::window::SyncWindow;

#[derive(Default)]
pub struct FakeGitLab {
    pub page_size: usize,
    pub projects: Vec<Project>,
    pub namespaces: HashMap<String, (NamespaceKind, Vec<i64>)>,
    pub changes: Vec<ProjectChangesNode>,
    pub pipelines: IndexMap<i64, Vec<PipelineNode>>,
    pub logs: HashMap<i64, Vec<u8>>,
    pub test_reports: HashMap<i64, TestReport>,
    pub merge_requests: HashMap<(i64, &'static str), Vec<MergeRequestNode>>,
    pub deployments: HashMap<i64, Vec<Deployment>>,
    pub runners: HashMap<i64, Runner>,
    failing: HashSet<String>,
    calls: Mutex<Vec<String>>,
}

impl FakeGitLab {
    pub fn with_project(id: i64, full_path: &str) -> Self {
        let mut fake = Self::default();
        fake.add_project(id, full_path);
        fake
    }

    pub fn add_project(&mut self, id: i64, full_path: &str) {
        self.projects.push(Project {
            id,
            full_path: full_path.to_string(),
            name: full_path.rsplit('/').next().unwrap_or(full_path).to_string(),
            namespace_path: full_path
                .rsplit_once('/')
                .map(|(ns, _)| ns.to_string())
                .unwrap_or_default(),
            ..Project::default()
        });
    }

    /// Marks the project as changed: updated metadata, one pipeline and one
    /// merge request in any window.
    pub fn mark_changed(&mut self, id: i64) {
        let project = self.project_by_id(id).cloned().unwrap_or_default();
        self.changes.push(ProjectChangesNode {
            id: project_gid(id),
            full_path: project.full_path,
            name: project.name,
            updated_at: Some(chrono::Utc::now() - chrono::Duration::seconds(1)),
            pipelines: Some(CountNode { count: 1 }),
            merge_requests: Some(CountNode { count: 1 }),
            ..ProjectChangesNode::default()
        });
    }

    pub fn add_pipeline(&mut self, project_id: i64, pipeline: PipelineNode) {
        self.pipelines.entry(project_id).or_default().push(pipeline);
    }

    pub fn add_merge_requests(
        &mut self,
        project_id: i64,
        fields: MergeRequestFields,
        nodes: Vec<MergeRequestNode>,
    ) {
        self.merge_requests
            .insert((project_id, fields.as_str()), nodes);
    }

    /// Makes every call of `method` fail with a server error.
    pub fn fail(&mut self, method: &str) {
        self.failing.insert(method.to_string());
    }

    pub fn calls(&self, method: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.as_str() == method)
            .count()
    }

    pub fn connection<T>(items: Vec<T>) -> Connection<T> {
        Connection {
            nodes: items.into_iter().map(Some).collect(),
            page_info: PageInfo::default(),
        }
    }

    fn record(&self, method: &str) -> Result<()> {
        self.calls.lock().unwrap().push(method.to_string());
        if self.failing.contains(method) {
            return Err(SyncError::ApiError {
                status: 500,
                message: format!("{method} failed"),
            });
        }
        Ok(())
    }

    fn project_by_id(&self, id: i64) -> Option<&Project> {
        self.projects.iter().find(|p| p.id == id)
    }

    fn project_by_path(&self, path: &str) -> Result<&Project> {
        self.projects
            .iter()
            .find(|p| p.full_path == path)
            .ok_or_else(|| SyncError::ProjectNotFound(path.to_string()))
    }

    fn page<T: Clone>(&self, items: &[T], cursor: Option<&str>) -> Page<T> {
        let start = cursor.and_then(|c| c.parse::<usize>().ok()).unwrap_or(0);
        let size = if self.page_size == 0 {
            items.len().max(1)
        } else {
            self.page_size
        };
        let end = (start + size).min(items.len());
        let slice = items.get(start..end).unwrap_or_default().to_vec();
        if end < items.len() {
            Page::with_next(slice, end.to_string())
        } else {
            Page::last(slice)
        }
    }

    fn connection_page<T: Clone>(&self, items: Vec<T>) -> Connection<T> {
        let page = self.page(&items, None);
        Connection {
            nodes: page.items.into_iter().map(Some).collect(),
            page_info: page.page_info,
        }
    }

    fn serve_job(&self, job: &JobNode) -> JobNode {
        let mut job = job.clone();
        let artifacts: Vec<ArtifactNode> = Page::from(job.artifacts.take()).items;
        job.artifacts = Some(self.connection_page(artifacts));
        job
    }

    fn serve_pipeline(&self, pipeline: &PipelineNode) -> PipelineNode {
        let mut pipeline = pipeline.clone();
        let jobs: Vec<JobNode> = Page::from(pipeline.jobs.take())
            .items
            .iter()
            .map(|job| self.serve_job(job))
            .collect();
        pipeline.jobs = Some(self.connection_page(jobs));
        pipeline
    }

    fn project_pipelines_of(&self, project_id: i64) -> Vec<PipelineNode> {
        self.pipelines
            .get(&project_id)
            .map(|pipelines| pipelines.iter().map(|p| self.serve_pipeline(p)).collect())
            .unwrap_or_default()
    }

    fn find_pipeline(&self, project_path: &str, iid: &str) -> Result<Option<&PipelineNode>> {
        let project = self.project_by_path(project_path)?;
        Ok(self
            .pipelines
            .get(&project.id)
            .and_then(|pipelines| pipelines.iter().find(|p| p.iid == iid)))
    }

    fn selected_projects(&self, ids: &[i64]) -> Vec<&Project> {
        ids.iter().filter_map(|id| self.project_by_id(*id)).collect()
    }

    fn merge_requests_of(&self, project_id: i64, fields: MergeRequestFields) -> Vec<MergeRequestNode> {
        self.merge_requests
            .get(&(project_id, fields.as_str()))
            .cloned()
            .unwrap_or_default()
    }
}

pub fn pipeline_node(id: i64, iid: &str, upstream: Option<(i64, &str, i64, &str)>) -> PipelineNode {
    PipelineNode {
        id: format!("gid://gitlab/Ci::Pipeline/{id}"),
        iid: iid.to_string(),
        status: "SUCCESS".to_string(),
        ref_: Some("main".to_string()),
        source: Some(if upstream.is_some() { "parent_pipeline" } else { "push" }.to_string()),
        created_at: Some(chrono::Utc::now() - chrono::Duration::minutes(10)),
        started_at: Some(chrono::Utc::now() - chrono::Duration::minutes(9)),
        finished_at: Some(chrono::Utc::now() - chrono::Duration::minutes(1)),
        duration: Some(480),
        upstream: upstream.map(|(id, iid, project_id, path)| PipelineRefNode {
            id: format!("gid://gitlab/Ci::Pipeline/{id}"),
            iid: iid.to_string(),
            project: Some(ProjectRefNode {
                id: Some(project_gid(project_id)),
                full_path: path.to_string(),
            }),
        }),
        ..PipelineNode::default()
    }
}

pub fn job_node(id: i64, name: &str, artifacts: Vec<ArtifactNode>) -> JobNode {
    JobNode {
        id: Some(format!("gid://gitlab/Ci::Build/{id}")),
        name: Some(name.to_string()),
        kind: Some("BUILD".to_string()),
        status: Some("SUCCESS".to_string()),
        created_at: Some(chrono::Utc::now() - chrono::Duration::minutes(9)),
        started_at: Some(chrono::Utc::now() - chrono::Duration::minutes(8)),
        finished_at: Some(chrono::Utc::now() - chrono::Duration::minutes(2)),
        duration: Some(360),
        artifacts: Some(FakeGitLab::connection(artifacts)),
        ..JobNode::default()
    }
}

pub fn bridge_node(
    id: i64,
    name: &str,
    downstream_id: i64,
    downstream_iid: &str,
    downstream_project: Option<(i64, &str)>,
) -> JobNode {
    JobNode {
        id: Some(format!("gid://gitlab/Ci::Bridge/{id}")),
        name: Some(name.to_string()),
        kind: Some("BRIDGE".to_string()),
        status: Some("SUCCESS".to_string()),
        downstream_pipeline: Some(PipelineRefNode {
            id: format!("gid://gitlab/Ci::Pipeline/{downstream_id}"),
            iid: downstream_iid.to_string(),
            project: downstream_project.map(|(id, path)| ProjectRefNode {
                id: Some(project_gid(id)),
                full_path: path.to_string(),
            }),
        }),
        ..JobNode::default()
    }
}

pub fn artifact_node(name: &str) -> ArtifactNode {
    ArtifactNode {
        name: Some(name.to_string()),
        file_type: Some("ARCHIVE".to_string()),
        size: Some(1024),
        download_path: None,
    }
}

pub fn merge_request_node(id: i64, iid: &str) -> MergeRequestNode {
    MergeRequestNode {
        id: format!("gid://gitlab/MergeRequest/{id}"),
        iid: iid.to_string(),
        ..MergeRequestNode::default()
    }
}

#[async_trait]
impl GitLabApi for FakeGitLab {
    async fn namespace_kind(&self, namespace: &str) -> Result<NamespaceKind> {
        self.record("namespace_kind")?;
        self.namespaces
            .get(namespace)
            .map(|(kind, _)| *kind)
            .ok_or_else(|| SyncError::NamespaceNotFound(namespace.to_string()))
    }

    async fn namespace_projects(
        &self,
        namespace: &str,
        _kind: NamespaceKind,
        _include_subgroups: bool,
        _with_shared: bool,
    ) -> Result<Vec<Project>> {
        self.record("namespace_projects")?;
        let (_, ids) = self
            .namespaces
            .get(namespace)
            .ok_or_else(|| SyncError::NamespaceNotFound(namespace.to_string()))?;
        Ok(self.selected_projects(ids).into_iter().cloned().collect())
    }

    async fn project(&self, project: &str) -> Result<Project> {
        self.record("project")?;
        self.projects
            .iter()
            .find(|p| p.full_path == project || p.id.to_string() == project)
            .cloned()
            .ok_or_else(|| SyncError::ProjectNotFound(project.to_string()))
    }

    async fn project_changes(
        &self,
        ids: &[i64],
        _window: SyncWindow,
        cursor: Option<String>,
    ) -> Result<Page<ProjectChangesNode>> {
        self.record("project_changes")?;
        let selected: Vec<ProjectChangesNode> = self
            .changes
            .iter()
            .filter(|c| parse_gid(&c.id).map_or(true, |id| ids.contains(&id)))
            .cloned()
            .collect();
        Ok(self.page(&selected, cursor.as_deref()))
    }

    async fn projects_pipelines(
        &self,
        ids: &[i64],
        _window: SyncWindow,
        cursor: Option<String>,
    ) -> Result<Page<ProjectPipelinesNode>> {
        self.record("projects_pipelines")?;
        let nodes: Vec<ProjectPipelinesNode> = self
            .selected_projects(ids)
            .into_iter()
            .map(|project| ProjectPipelinesNode {
                id: project_gid(project.id),
                full_path: project.full_path.clone(),
                pipelines: Some(self.connection_page(self.project_pipelines_of(project.id))),
            })
            .collect();
        Ok(self.page(&nodes, cursor.as_deref()))
    }

    async fn project_pipelines(
        &self,
        project_path: &str,
        _window: SyncWindow,
        cursor: Option<String>,
    ) -> Result<Page<PipelineNode>> {
        self.record("project_pipelines")?;
        let project = self.project_by_path(project_path)?;
        let pipelines = self.project_pipelines_of(project.id);
        Ok(self.page(&pipelines, cursor.as_deref()))
    }

    async fn pipeline(&self, project_path: &str, iid: &str) -> Result<Option<PipelineNode>> {
        self.record("pipeline")?;
        Ok(self
            .find_pipeline(project_path, iid)?
            .map(|p| self.serve_pipeline(p)))
    }

    async fn pipeline_jobs(
        &self,
        project_path: &str,
        pipeline_iid: &str,
        cursor: Option<String>,
    ) -> Result<Page<JobNode>> {
        self.record("pipeline_jobs")?;
        let jobs: Vec<JobNode> = self
            .find_pipeline(project_path, pipeline_iid)?
            .and_then(|p| p.jobs.clone())
            .map(|jobs| Page::from(jobs).items)
            .unwrap_or_default()
            .iter()
            .map(|job| self.serve_job(job))
            .collect();
        Ok(self.page(&jobs, cursor.as_deref()))
    }

    async fn job_artifacts(
        &self,
        project_path: &str,
        job_gid: &str,
        cursor: Option<String>,
    ) -> Result<Page<ArtifactNode>> {
        self.record("job_artifacts")?;
        let project = self.project_by_path(project_path)?;
        let artifacts = self
            .pipelines
            .get(&project.id)
            .into_iter()
            .flatten()
            .filter_map(|p| p.jobs.as_ref())
            .flat_map(|jobs| jobs.nodes.iter().flatten())
            .find(|job| job.id.as_deref() == Some(job_gid))
            .and_then(|job| job.artifacts.clone())
            .map(|artifacts| Page::from(artifacts).items)
            .unwrap_or_default();
        Ok(self.page(&artifacts, cursor.as_deref()))
    }

    async fn job_log(&self, _project_id: i64, job_id: i64) -> Result<Vec<u8>> {
        self.record("job_log")?;
        self.logs.get(&job_id).cloned().ok_or(SyncError::ApiError {
            status: 404,
            message: format!("no log for job {job_id}"),
        })
    }

    async fn pipeline_test_report(
        &self,
        project_id: i64,
        pipeline_id: i64,
    ) -> Result<TestReport> {
        self.record("pipeline_test_report")?;
        let mut report = self.test_reports.get(&pipeline_id).cloned().unwrap_or_default();
        report.project_id = project_id;
        report.pipeline_id = pipeline_id;
        Ok(report)
    }

    async fn merge_requests(
        &self,
        ids: &[i64],
        _window: SyncWindow,
        fields: MergeRequestFields,
        cursor: Option<String>,
    ) -> Result<Page<ProjectMergeRequestsNode>> {
        self.record("merge_requests")?;
        self.record(&format!("merge_requests:{}", fields.as_str()))?;
        let nodes: Vec<ProjectMergeRequestsNode> = self
            .selected_projects(ids)
            .into_iter()
            .map(|project| ProjectMergeRequestsNode {
                id: project_gid(project.id),
                full_path: project.full_path.clone(),
                merge_requests: Some(
                    self.connection_page(self.merge_requests_of(project.id, fields)),
                ),
            })
            .collect();
        Ok(self.page(&nodes, cursor.as_deref()))
    }

    async fn project_merge_requests(
        &self,
        project_path: &str,
        _window: SyncWindow,
        fields: MergeRequestFields,
        cursor: Option<String>,
    ) -> Result<Page<MergeRequestNode>> {
        self.record("project_merge_requests")?;
        let project = self.project_by_path(project_path)?;
        let nodes = self.merge_requests_of(project.id, fields);
        Ok(self.page(&nodes, cursor.as_deref()))
    }

    async fn deployments(&self, project_id: i64, _window: SyncWindow) -> Result<Vec<Deployment>> {
        self.record("deployments")?;
        Ok(self.deployments.get(&project_id).cloned().unwrap_or_default())
    }

    async fn runner(&self, id: i64) -> Result<Runner> {
        self.record("runner")?;
        self.runners.get(&id).cloned().ok_or(SyncError::ApiError {
            status: 404,
            message: format!("no runner {id}"),
        })
    }

    async fn check_readiness(&self) -> Result<()> {
        self.record("check_readiness")
    }
}
