use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::controller::registry::{CatchUp, ExportFlags, DEFAULT_BATCH_SIZE};
use crate::fetch::DEFAULT_CONCURRENCY;
use crate::gitlab::{NamespaceKind, RetryPolicy};

/// Configuration file structure for cisync.
///
/// Every section is optional; an empty file yields a configuration that
/// syncs nothing against gitlab.com.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub gitlab: GitLabConfig,

    /// Where exported records are sent
    pub endpoints: Vec<SinkConfig>,

    /// Export and catch-up settings for projects that don't override them
    pub project_defaults: ProjectDefaults,

    pub namespaces: Vec<NamespaceConfig>,

    pub projects: Vec<ProjectConfig>,

    pub controller: ControllerConfig,

    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GitLabConfig {
    /// GitLab instance base URL
    pub url: String,

    /// GitLab personal access token
    pub token: Option<String>,

    pub client: ClientConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub max_retries: u32,

    /// Delay before the first retry, doubled on every further one
    pub retry_delay_ms: u64,

    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SinkConfig {
    Http { address: String },
    /// `-` writes to stdout
    File { path: String },
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct ProjectDefaults {
    pub export: ExportFlags,
    pub catch_up: CatchUp,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NamespaceConfig {
    /// Full path or numeric id of a user or group
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,

    /// Probed through the API when missing
    pub kind: Option<NamespaceKind>,

    #[serde(default)]
    pub include_subgroups: bool,

    #[serde(default)]
    pub with_shared: bool,

    /// Project paths or ids to leave out
    #[serde(default)]
    pub exclude: Vec<String>,

    pub export: Option<ExportFlags>,

    pub catch_up: Option<CatchUp>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProjectConfig {
    /// Full path or numeric id
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,

    pub export: Option<ExportFlags>,

    pub catch_up: Option<CatchUp>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub interval_secs: u64,
    pub catch_up_interval_secs: u64,
    pub batch_size: usize,
    pub concurrency: usize,
    pub refresh_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
}

impl Default for GitLabConfig {
    fn default() -> Self {
        Self {
            url: default_gitlab_url(),
            token: None,
            client: ClientConfig::default(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_delay_ms: 1000,
            timeout_secs: None,
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            catch_up_interval_secs: 86_400,
            batch_size: DEFAULT_BATCH_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
            refresh_interval_secs: 3600,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

fn default_gitlab_url() -> String {
    "https://gitlab.com".to_string()
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Number(i64),
        Text(String),
    }

    Ok(match Id::deserialize(deserializer)? {
        Id::Number(n) => n.to_string(),
        Id::Text(s) => s,
    })
}

impl ClientConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.retry_delay_ms),
            ..RetryPolicy::default()
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

impl Config {
    /// Load configuration from a file.
    ///
    /// Searches for configuration files in this order:
    /// 1. Specified path
    /// 2. ./cisync.yaml
    /// 3. ./cisync.yml
    ///
    /// Returns default configuration if no file is found.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load_from_path(path);
        }

        for candidate in ["cisync.yaml", "cisync.yml"] {
            let path = Path::new(candidate);
            if path.exists() {
                return Self::load_from_path(path);
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file path.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_yaml(&contents)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        // An empty document deserializes to unit, not to an empty mapping.
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(contents).context("Failed to parse YAML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.gitlab.url.trim().is_empty() {
            bail!("gitlab.url must not be empty");
        }

        let controller = &self.controller;
        if controller.batch_size == 0 {
            bail!("controller.batch_size must be at least 1");
        }
        if controller.concurrency == 0 {
            bail!("controller.concurrency must be at least 1");
        }
        for (name, value) in [
            ("interval_secs", controller.interval_secs),
            ("catch_up_interval_secs", controller.catch_up_interval_secs),
            ("refresh_interval_secs", controller.refresh_interval_secs),
        ] {
            if value == 0 {
                bail!("controller.{name} must be at least 1");
            }
        }

        for (i, endpoint) in self.endpoints.iter().enumerate() {
            match endpoint {
                SinkConfig::Http { address } if address.trim().is_empty() => {
                    bail!("endpoints[{i}]: http sink needs an address")
                }
                SinkConfig::File { path } if path.trim().is_empty() => {
                    bail!("endpoints[{i}]: file sink needs a path")
                }
                _ => {}
            }
        }

        Ok(())
    }
}
