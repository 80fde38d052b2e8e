use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

pub type Timestamp = DateTime<Utc>;

/// Project metadata.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    /// Path including namespace (e.g., "group/subgroup/project")
    pub full_path: String,
    pub name: String,
    pub namespace_path: String,
    pub description: Option<String>,
    pub web_url: Option<String>,
    pub default_branch: Option<String>,
    pub visibility: Option<String>,
    pub archived: bool,
    pub star_count: i64,
    pub forks_count: i64,
    pub created_at: Option<Timestamp>,
    pub updated_at: Option<Timestamp>,
    pub last_activity_at: Option<Timestamp>,
}

/// Result of the combined "what changed in this window" query for one project.
#[derive(Debug, Clone)]
pub struct ProjectChanges {
    pub project: Project,
    /// Project metadata itself changed inside the window
    pub updated: bool,
    /// Pipelines updated inside the window
    pub pipelines: i64,
    /// Merge requests updated inside the window
    pub merge_requests: i64,
}

/// Weak reference to a pipeline, possibly in another project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PipelineRef {
    pub id: i64,
    pub iid: String,
    pub project_id: Option<i64>,
    pub project_path: String,
}

/// A GitLab CI/CD pipeline execution.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: i64,
    /// Project-scoped id, used to address the pipeline through its project
    pub iid: String,
    pub project_id: i64,
    pub project_path: String,
    pub ref_: Option<String>,
    pub sha: Option<String>,
    /// Trigger source (e.g., "push", "schedule", "parent_pipeline")
    pub source: Option<String>,
    pub status: String,
    pub user: Option<String>,
    pub created_at: Option<Timestamp>,
    pub updated_at: Option<Timestamp>,
    pub started_at: Option<Timestamp>,
    pub finished_at: Option<Timestamp>,
    /// Seconds
    pub duration: Option<f64>,
    /// Seconds
    pub queued_duration: Option<f64>,
    pub coverage: Option<f64>,
    pub upstream: Option<PipelineRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobArtifact {
    pub name: Option<String>,
    pub file_type: Option<String>,
    pub size: Option<i64>,
    pub download_path: Option<String>,
}

/// A build job.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub pipeline_id: i64,
    pub project_id: i64,
    pub name: String,
    pub stage: Option<String>,
    pub status: String,
    pub tags: Vec<String>,
    pub allow_failure: bool,
    pub retried: bool,
    pub failure_message: Option<String>,
    pub runner_id: Option<i64>,
    pub created_at: Option<Timestamp>,
    pub queued_at: Option<Timestamp>,
    pub started_at: Option<Timestamp>,
    pub finished_at: Option<Timestamp>,
    pub duration: Option<f64>,
    pub queued_duration: Option<f64>,
    pub artifacts: Vec<JobArtifact>,
}

/// A trigger job that starts a downstream pipeline.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Bridge {
    pub id: i64,
    pub pipeline_id: i64,
    pub project_id: i64,
    pub name: String,
    pub stage: Option<String>,
    pub status: String,
    pub allow_failure: bool,
    pub created_at: Option<Timestamp>,
    pub started_at: Option<Timestamp>,
    pub finished_at: Option<Timestamp>,
    pub duration: Option<f64>,
    pub queued_duration: Option<f64>,
    pub downstream: Option<PipelineRef>,
}

/// A log section attributed to its job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSection {
    pub job_id: i64,
    pub pipeline_id: i64,
    pub project_id: i64,
    /// Position of the section in the job's close order
    pub index: usize,
    pub name: String,
    /// Unix seconds
    pub start: i64,
    /// Unix seconds
    pub end: Option<i64>,
}

/// A log metric attributed to its job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMetric {
    pub job_id: i64,
    pub pipeline_id: i64,
    pub project_id: i64,
    pub name: String,
    pub labels: IndexMap<String, String>,
    pub value: f64,
    pub timestamp: Option<i64>,
}

/// Pipeline test report summary as returned by the REST API.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TestReport {
    #[serde(default)]
    pub pipeline_id: i64,
    #[serde(default)]
    pub project_id: i64,
    #[serde(default)]
    pub total_time: f64,
    #[serde(default)]
    pub total_count: i64,
    #[serde(default)]
    pub success_count: i64,
    #[serde(default)]
    pub failed_count: i64,
    #[serde(default)]
    pub skipped_count: i64,
    #[serde(default)]
    pub error_count: i64,
    #[serde(default, skip_serializing)]
    pub test_suites: Vec<TestSuite>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TestSuite {
    pub name: String,
    #[serde(default)]
    pub total_time: f64,
    #[serde(default)]
    pub total_count: i64,
    #[serde(default)]
    pub success_count: i64,
    #[serde(default)]
    pub failed_count: i64,
    #[serde(default)]
    pub skipped_count: i64,
    #[serde(default)]
    pub error_count: i64,
    pub suite_error: Option<String>,
    #[serde(default, skip_serializing)]
    pub test_cases: Vec<TestCase>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TestCase {
    pub status: String,
    pub name: String,
    pub classname: Option<String>,
    pub file: Option<String>,
    #[serde(default)]
    pub execution_time: f64,
    pub system_output: Option<String>,
    pub stack_trace: Option<String>,
}

/// Test suite flattened out of its report for export.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestSuiteRecord {
    pub pipeline_id: i64,
    pub project_id: i64,
    pub index: usize,
    #[serde(flatten)]
    pub suite: TestSuite,
}

/// Test case flattened out of its suite for export.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestCaseRecord {
    pub pipeline_id: i64,
    pub project_id: i64,
    pub suite_index: usize,
    pub suite_name: String,
    #[serde(flatten)]
    pub case: TestCase,
}

impl TestReport {
    pub fn flatten(&self) -> (Vec<TestSuiteRecord>, Vec<TestCaseRecord>) {
        let mut suites = Vec::with_capacity(self.test_suites.len());
        let mut cases = Vec::new();

        for (index, suite) in self.test_suites.iter().enumerate() {
            cases.extend(suite.test_cases.iter().map(|case| TestCaseRecord {
                pipeline_id: self.pipeline_id,
                project_id: self.project_id,
                suite_index: index,
                suite_name: suite.name.clone(),
                case: case.clone(),
            }));
            suites.push(TestSuiteRecord {
                pipeline_id: self.pipeline_id,
                project_id: self.project_id,
                index,
                suite: suite.clone(),
            });
        }

        (suites, cases)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MergeRequest {
    pub id: i64,
    pub iid: String,
    pub project_id: i64,
    pub title: String,
    pub state: String,
    pub source_branch: Option<String>,
    pub target_branch: Option<String>,
    pub author: Option<String>,
    pub draft: bool,
    pub labels: Vec<String>,
    pub web_url: Option<String>,
    pub created_at: Option<Timestamp>,
    pub updated_at: Option<Timestamp>,
    pub merged_at: Option<Timestamp>,
    pub closed_at: Option<Timestamp>,

    pub additions: Option<i64>,
    pub deletions: Option<i64>,
    pub file_count: Option<i64>,
    pub user_notes_count: Option<i64>,
    pub approved: Option<bool>,
    pub merge_status: Option<String>,

    pub participants: Vec<String>,
    pub assignees: Vec<String>,
    pub reviewers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Deployment {
    pub id: i64,
    pub iid: i64,
    pub project_id: i64,
    pub environment: Option<String>,
    pub status: String,
    pub ref_: Option<String>,
    pub sha: Option<String>,
    pub user: Option<String>,
    pub job_id: Option<i64>,
    pub pipeline_id: Option<i64>,
    pub created_at: Option<Timestamp>,
    pub updated_at: Option<Timestamp>,
    pub finished_at: Option<Timestamp>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Runner {
    pub id: i64,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub runner_type: Option<String>,
    #[serde(default)]
    pub is_shared: bool,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub online: Option<bool>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default, rename(deserialize = "tag_list"))]
    pub tags: Vec<String>,
}
