use log::debug;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use url::Url;

use super::core::GitLabClient;
use crate::error::{Result, SyncError};
use crate::gitlab::api::NamespaceKind;
use crate::gitlab::types::{Deployment, Project, Runner, TestReport, Timestamp};
use crate::window::SyncWindow;

const PER_PAGE: &str = "100";

/// Percent-encodes a numeric id or a full path for use as one path segment.
pub(super) fn encode_id(id: &str) -> String {
    url::form_urlencoded::byte_serialize(id.as_bytes()).collect()
}

#[derive(Debug, Deserialize)]
struct RestNamespace {
    kind: String,
}

#[derive(Debug, Default, Deserialize)]
struct RestNamespaceRef {
    full_path: String,
}

#[derive(Debug, Deserialize)]
struct RestProject {
    id: i64,
    path_with_namespace: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    namespace: RestNamespaceRef,
    description: Option<String>,
    web_url: Option<String>,
    default_branch: Option<String>,
    visibility: Option<String>,
    #[serde(default)]
    archived: bool,
    #[serde(default)]
    star_count: i64,
    #[serde(default)]
    forks_count: i64,
    created_at: Option<Timestamp>,
    updated_at: Option<Timestamp>,
    last_activity_at: Option<Timestamp>,
}

impl From<RestProject> for Project {
    fn from(p: RestProject) -> Self {
        Self {
            id: p.id,
            full_path: p.path_with_namespace,
            name: p.name,
            namespace_path: p.namespace.full_path,
            description: p.description,
            web_url: p.web_url,
            default_branch: p.default_branch,
            visibility: p.visibility,
            archived: p.archived,
            star_count: p.star_count,
            forks_count: p.forks_count,
            created_at: p.created_at,
            updated_at: p.updated_at,
            last_activity_at: p.last_activity_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RestUser {
    username: String,
}

#[derive(Debug, Deserialize)]
struct RestEnvironment {
    name: String,
}

#[derive(Debug, Deserialize)]
struct RestPipelineRef {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct RestDeployable {
    id: i64,
    pipeline: Option<RestPipelineRef>,
}

#[derive(Debug, Deserialize)]
struct RestDeployment {
    id: i64,
    iid: i64,
    #[serde(default)]
    status: String,
    #[serde(rename = "ref")]
    ref_: Option<String>,
    sha: Option<String>,
    user: Option<RestUser>,
    environment: Option<RestEnvironment>,
    deployable: Option<RestDeployable>,
    created_at: Option<Timestamp>,
    updated_at: Option<Timestamp>,
    finished_at: Option<Timestamp>,
}

impl RestDeployment {
    fn into_deployment(self, project_id: i64) -> Deployment {
        let (job_id, pipeline_id) = match self.deployable {
            Some(d) => (Some(d.id), d.pipeline.map(|p| p.id)),
            None => (None, None),
        };
        Deployment {
            id: self.id,
            iid: self.iid,
            project_id,
            environment: self.environment.map(|e| e.name),
            status: self.status,
            ref_: self.ref_,
            sha: self.sha,
            user: self.user.map(|u| u.username),
            job_id,
            pipeline_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
            finished_at: self.finished_at,
        }
    }
}

/// Maps a 404 to `not_found`, keeping every other error as is.
fn or_not_found(err: SyncError, not_found: impl FnOnce() -> SyncError) -> SyncError {
    match err {
        SyncError::ApiError { status: 404, .. } => not_found(),
        other => other,
    }
}

impl GitLabClient {
    pub(super) async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T> {
        let response = self.send(|| self.client.get(url.clone())).await?;
        Ok(response.json().await?)
    }

    pub(super) async fn get_bytes(&self, url: Url) -> Result<Vec<u8>> {
        let response = self.send(|| self.client.get(url.clone())).await?;
        Ok(response.bytes().await?.to_vec())
    }

    /// Follows offset pagination through the `x-next-page` header until the
    /// server reports no further page.
    pub(super) async fn get_paginated<T: DeserializeOwned>(&self, url: Url) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let mut page = String::from("1");

        loop {
            let mut page_url = url.clone();
            page_url
                .query_pairs_mut()
                .append_pair("per_page", PER_PAGE)
                .append_pair("page", &page);

            let response = self.send(|| self.client.get(page_url.clone())).await?;
            let next = response
                .headers()
                .get("x-next-page")
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_owned);

            let batch: Vec<T> = response.json().await?;
            debug!("GET {} page {page}: {} items", url.path(), batch.len());
            items.extend(batch);

            match next {
                Some(next) if next != page => page = next,
                _ => break,
            }
        }

        Ok(items)
    }

    pub(super) async fn fetch_namespace_kind(&self, namespace: &str) -> Result<NamespaceKind> {
        let url = self.api_endpoint(&format!("namespaces/{}", encode_id(namespace)))?;
        let ns: RestNamespace = self
            .get_json(url)
            .await
            .map_err(|e| or_not_found(e, || SyncError::NamespaceNotFound(namespace.to_string())))?;

        match ns.kind.as_str() {
            "user" => Ok(NamespaceKind::User),
            "group" => Ok(NamespaceKind::Group),
            other => Err(SyncError::Conversion(format!(
                "unknown namespace kind '{other}' for '{namespace}'"
            ))),
        }
    }

    pub(super) async fn fetch_namespace_projects(
        &self,
        namespace: &str,
        kind: NamespaceKind,
        include_subgroups: bool,
        with_shared: bool,
    ) -> Result<Vec<Project>> {
        let mut url = match kind {
            NamespaceKind::Group => {
                self.api_endpoint(&format!("groups/{}/projects", encode_id(namespace)))?
            }
            NamespaceKind::User => {
                self.api_endpoint(&format!("users/{}/projects", encode_id(namespace)))?
            }
        };
        if kind == NamespaceKind::Group {
            url.query_pairs_mut()
                .append_pair("include_subgroups", if include_subgroups { "true" } else { "false" })
                .append_pair("with_shared", if with_shared { "true" } else { "false" });
        }

        let projects: Vec<RestProject> = self
            .get_paginated(url)
            .await
            .map_err(|e| or_not_found(e, || SyncError::NamespaceNotFound(namespace.to_string())))?;
        Ok(projects.into_iter().map(Project::from).collect())
    }

    pub(super) async fn fetch_project(&self, project: &str) -> Result<Project> {
        let url = self.api_endpoint(&format!("projects/{}", encode_id(project)))?;
        let rest: RestProject = self
            .get_json(url)
            .await
            .map_err(|e| or_not_found(e, || SyncError::ProjectNotFound(project.to_string())))?;
        Ok(rest.into())
    }

    pub(super) async fn fetch_job_log(&self, project_id: i64, job_id: i64) -> Result<Vec<u8>> {
        let url = self.api_endpoint(&format!("projects/{project_id}/jobs/{job_id}/trace"))?;
        self.get_bytes(url).await
    }

    pub(super) async fn fetch_test_report(
        &self,
        project_id: i64,
        pipeline_id: i64,
    ) -> Result<TestReport> {
        let url = self.api_endpoint(&format!(
            "projects/{project_id}/pipelines/{pipeline_id}/test_report"
        ))?;
        let mut report: TestReport = self.get_json(url).await?;
        report.project_id = project_id;
        report.pipeline_id = pipeline_id;
        Ok(report)
    }

    pub(super) async fn fetch_deployments(
        &self,
        project_id: i64,
        window: SyncWindow,
    ) -> Result<Vec<Deployment>> {
        let mut url = self.api_endpoint(&format!("projects/{project_id}/deployments"))?;
        url.query_pairs_mut()
            .append_pair("updated_after", &window.after.to_rfc3339())
            .append_pair("updated_before", &window.before.to_rfc3339())
            .append_pair("order_by", "updated_at");

        let deployments: Vec<RestDeployment> = self.get_paginated(url).await?;
        Ok(deployments
            .into_iter()
            .map(|d| d.into_deployment(project_id))
            .collect())
    }

    pub(super) async fn fetch_runner(&self, id: i64) -> Result<Runner> {
        let url = self.api_endpoint(&format!("runners/{id}"))?;
        self.get_json(url).await
    }

    pub(super) async fn fetch_version(&self) -> Result<()> {
        let url = self.api_endpoint("version")?;
        let _: serde_json::Value = self.get_json(url).await?;
        Ok(())
    }
}
