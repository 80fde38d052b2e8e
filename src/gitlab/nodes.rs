//! GraphQL response shapes and their conversion into domain records.

use serde::Deserialize;

use super::gid::parse_gid;
use super::pagination::{Connection, HasInner, Page};
use super::types::{
    Bridge, Job, JobArtifact, MergeRequest, Pipeline, PipelineRef, Project, Timestamp,
};
use crate::error::{Result, SyncError};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectRefNode {
    pub id: Option<String>,
    pub full_path: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserNode {
    pub username: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NameNode {
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TitleNode {
    pub title: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CountNode {
    #[serde(default)]
    pub count: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryNode {
    pub root_ref: Option<String>,
}

/// Project metadata plus per-window change counters.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectChangesNode {
    pub id: String,
    pub full_path: String,
    #[serde(default)]
    pub name: String,
    pub description: Option<String>,
    pub web_url: Option<String>,
    pub visibility: Option<String>,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub star_count: i64,
    #[serde(default)]
    pub forks_count: i64,
    pub created_at: Option<Timestamp>,
    pub updated_at: Option<Timestamp>,
    pub last_activity_at: Option<Timestamp>,
    pub namespace: Option<ProjectRefNode>,
    pub repository: Option<RepositoryNode>,
    pub pipelines: Option<CountNode>,
    pub merge_requests: Option<CountNode>,
}

impl ProjectChangesNode {
    pub fn into_project(self) -> Result<(Project, i64, i64)> {
        let id = parse_gid(&self.id)?;
        let pipelines = self.pipelines.map_or(0, |c| c.count);
        let merge_requests = self.merge_requests.map_or(0, |c| c.count);

        let project = Project {
            id,
            namespace_path: self
                .namespace
                .map(|ns| ns.full_path)
                .unwrap_or_else(|| parent_path(&self.full_path)),
            full_path: self.full_path,
            name: self.name,
            description: self.description,
            web_url: self.web_url,
            default_branch: self.repository.and_then(|r| r.root_ref),
            visibility: self.visibility,
            archived: self.archived,
            star_count: self.star_count,
            forks_count: self.forks_count,
            created_at: self.created_at,
            updated_at: self.updated_at,
            last_activity_at: self.last_activity_at,
        };

        Ok((project, pipelines, merge_requests))
    }
}

fn parent_path(full_path: &str) -> String {
    full_path
        .rsplit_once('/')
        .map(|(parent, _)| parent.to_string())
        .unwrap_or_default()
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRefNode {
    pub id: String,
    pub iid: String,
    pub project: Option<ProjectRefNode>,
}

impl PipelineRefNode {
    pub fn into_ref(self, fallback_project_path: &str) -> Result<PipelineRef> {
        let id = parse_gid(&self.id)?;
        let (project_id, project_path) = match self.project {
            Some(project) => (
                project.id.as_deref().map(parse_gid).transpose()?,
                project.full_path,
            ),
            None => (None, fallback_project_path.to_string()),
        };
        Ok(PipelineRef {
            id,
            iid: self.iid,
            project_id,
            project_path,
        })
    }
}

/// A project with the first page of its pipelines.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectPipelinesNode {
    pub id: String,
    pub full_path: String,
    pub pipelines: Option<Connection<PipelineNode>>,
}

impl HasInner for ProjectPipelinesNode {
    type Inner = PipelineNode;

    fn take_inner(&mut self) -> Page<PipelineNode> {
        self.pipelines.take().into()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineNode {
    pub id: String,
    pub iid: String,
    #[serde(default)]
    pub status: String,
    #[serde(rename = "ref")]
    pub ref_: Option<String>,
    pub sha: Option<String>,
    pub source: Option<String>,
    pub user: Option<UserNode>,
    pub created_at: Option<Timestamp>,
    pub updated_at: Option<Timestamp>,
    pub started_at: Option<Timestamp>,
    pub finished_at: Option<Timestamp>,
    pub duration: Option<i64>,
    pub queued_duration: Option<f64>,
    pub coverage: Option<f64>,
    pub upstream: Option<PipelineRefNode>,
    pub project: Option<ProjectRefNode>,
    pub jobs: Option<Connection<JobNode>>,
}

impl HasInner for PipelineNode {
    type Inner = JobNode;

    fn take_inner(&mut self) -> Page<JobNode> {
        self.jobs.take().into()
    }
}

impl PipelineNode {
    #[allow(clippy::cast_precision_loss)]
    pub fn into_pipeline(self, project_id: i64, project_path: &str) -> Result<Pipeline> {
        let upstream = self
            .upstream
            .map(|upstream| upstream.into_ref(project_path))
            .transpose()?;

        Ok(Pipeline {
            id: parse_gid(&self.id)?,
            iid: self.iid,
            project_id,
            project_path: project_path.to_string(),
            ref_: self.ref_,
            sha: self.sha,
            source: self.source,
            status: self.status.to_lowercase(),
            user: self.user.map(|u| u.username),
            created_at: self.created_at,
            updated_at: self.updated_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            duration: self.duration.map(|d| d as f64),
            queued_duration: self.queued_duration,
            coverage: self.coverage,
            upstream,
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactNode {
    pub name: Option<String>,
    pub file_type: Option<String>,
    pub size: Option<i64>,
    pub download_path: Option<String>,
}

impl From<ArtifactNode> for JobArtifact {
    fn from(node: ArtifactNode) -> Self {
        Self {
            name: node.name,
            file_type: node.file_type.map(|t| t.to_lowercase()),
            size: node.size,
            download_path: node.download_path,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunnerRefNode {
    pub id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobNode {
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    /// `BUILD` or `BRIDGE`
    pub kind: Option<String>,
    pub status: Option<String>,
    pub stage: Option<NameNode>,
    #[serde(default)]
    pub allow_failure: bool,
    #[serde(default)]
    pub retried: Option<bool>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    pub failure_message: Option<String>,
    pub runner: Option<RunnerRefNode>,
    pub created_at: Option<Timestamp>,
    pub queued_at: Option<Timestamp>,
    pub started_at: Option<Timestamp>,
    pub finished_at: Option<Timestamp>,
    pub duration: Option<i64>,
    pub queued_duration: Option<f64>,
    pub downstream_pipeline: Option<PipelineRefNode>,
    pub artifacts: Option<Connection<ArtifactNode>>,
}

impl HasInner for JobNode {
    type Inner = ArtifactNode;

    fn take_inner(&mut self) -> Page<ArtifactNode> {
        self.artifacts.take().into()
    }
}

/// A pipeline job, either a build or a trigger.
#[derive(Debug, Clone, PartialEq)]
pub enum CiJob {
    Build(Job),
    Bridge(Bridge),
}

impl JobNode {
    pub fn is_bridge(&self) -> bool {
        self.kind.as_deref() == Some("BRIDGE")
    }

    pub fn numeric_id(&self) -> Result<i64> {
        let id = self
            .id
            .as_deref()
            .ok_or_else(|| SyncError::Conversion("job without id".to_string()))?;
        parse_gid(id)
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn into_ci_job(
        self,
        pipeline: &Pipeline,
        artifacts: Vec<ArtifactNode>,
    ) -> Result<CiJob> {
        let id = self.numeric_id()?;
        let is_bridge = self.is_bridge();
        let name = self.name.unwrap_or_default();
        let stage = self.stage.and_then(|s| s.name);
        let status = self.status.unwrap_or_default().to_lowercase();
        let duration = self.duration.map(|d| d as f64);

        if is_bridge {
            let downstream = self
                .downstream_pipeline
                .map(|d| d.into_ref(&pipeline.project_path))
                .transpose()?;
            return Ok(CiJob::Bridge(Bridge {
                id,
                pipeline_id: pipeline.id,
                project_id: pipeline.project_id,
                name,
                stage,
                status,
                allow_failure: self.allow_failure,
                created_at: self.created_at,
                started_at: self.started_at,
                finished_at: self.finished_at,
                duration,
                queued_duration: self.queued_duration,
                downstream,
            }));
        }

        let runner_id = self
            .runner
            .map(|runner| parse_gid(&runner.id))
            .transpose()?;

        Ok(CiJob::Build(Job {
            id,
            pipeline_id: pipeline.id,
            project_id: pipeline.project_id,
            name,
            stage,
            status,
            tags: self.tags.unwrap_or_default(),
            allow_failure: self.allow_failure,
            retried: self.retried.unwrap_or(false),
            failure_message: self.failure_message,
            runner_id,
            created_at: self.created_at,
            queued_at: self.queued_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            duration,
            queued_duration: self.queued_duration,
            artifacts: artifacts.into_iter().map(JobArtifact::from).collect(),
        }))
    }
}

/// Field subsets of a merge request, fetched in separate passes to stay under
/// the query complexity limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeRequestFields {
    Core,
    Extra,
    Participants,
}

impl MergeRequestFields {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Core => "core",
            Self::Extra => "extra",
            Self::Participants => "participants",
        }
    }
}

/// A project with the first page of its merge requests.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectMergeRequestsNode {
    pub id: String,
    pub full_path: String,
    pub merge_requests: Option<Connection<MergeRequestNode>>,
}

impl HasInner for ProjectMergeRequestsNode {
    type Inner = MergeRequestNode;

    fn take_inner(&mut self) -> Page<MergeRequestNode> {
        self.merge_requests.take().into()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffStatsNode {
    pub additions: Option<i64>,
    pub deletions: Option<i64>,
    pub file_count: Option<i64>,
}

/// Any of the merge request field subsets; fields outside the fetched subset
/// are absent.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeRequestNode {
    pub id: String,
    pub iid: String,

    pub title: Option<String>,
    pub state: Option<String>,
    pub source_branch: Option<String>,
    pub target_branch: Option<String>,
    pub author: Option<UserNode>,
    pub draft: Option<bool>,
    pub labels: Option<Connection<TitleNode>>,
    pub web_url: Option<String>,
    pub created_at: Option<Timestamp>,
    pub updated_at: Option<Timestamp>,
    pub merged_at: Option<Timestamp>,
    pub closed_at: Option<Timestamp>,

    pub diff_stats_summary: Option<DiffStatsNode>,
    pub user_notes_count: Option<i64>,
    pub approved: Option<bool>,
    pub merge_status_enum: Option<String>,

    pub participants: Option<Connection<UserNode>>,
    pub assignees: Option<Connection<UserNode>>,
    pub reviewers: Option<Connection<UserNode>>,
}

fn usernames(connection: Option<Connection<UserNode>>) -> Vec<String> {
    Page::from(connection)
        .items
        .into_iter()
        .map(|u| u.username)
        .collect()
}

impl MergeRequestNode {
    pub fn numeric_id(&self) -> Result<i64> {
        parse_gid(&self.id)
    }

    /// Builds the base record from a `core` pass node.
    pub fn into_merge_request(self, project_id: i64) -> Result<MergeRequest> {
        Ok(MergeRequest {
            id: parse_gid(&self.id)?,
            iid: self.iid,
            project_id,
            title: self.title.unwrap_or_default(),
            state: self.state.unwrap_or_default(),
            source_branch: self.source_branch,
            target_branch: self.target_branch,
            author: self.author.map(|a| a.username),
            draft: self.draft.unwrap_or(false),
            labels: Page::from(self.labels)
                .items
                .into_iter()
                .map(|l| l.title)
                .collect(),
            web_url: self.web_url,
            created_at: self.created_at,
            updated_at: self.updated_at,
            merged_at: self.merged_at,
            closed_at: self.closed_at,
            ..MergeRequest::default()
        })
    }

    /// Copies the fields of an `extra` or `participants` pass node.
    pub fn merge_into(self, record: &mut MergeRequest) {
        if let Some(stats) = self.diff_stats_summary {
            record.additions = stats.additions;
            record.deletions = stats.deletions;
            record.file_count = stats.file_count;
        }
        if self.user_notes_count.is_some() {
            record.user_notes_count = self.user_notes_count;
        }
        if self.approved.is_some() {
            record.approved = self.approved;
        }
        if let Some(status) = self.merge_status_enum {
            record.merge_status = Some(status.to_lowercase());
        }
        if self.participants.is_some() {
            record.participants = usernames(self.participants);
        }
        if self.assignees.is_some() {
            record.assignees = usernames(self.assignees);
        }
        if self.reviewers.is_some() {
            record.reviewers = usernames(self.reviewers);
        }
    }
}
