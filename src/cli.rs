use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::auth::Token;
use crate::cancel::CancellationToken;
use crate::config::Config;
use crate::controller::{Controller, Settings};
use crate::export::Exporter;
use crate::gitlab::GitLabClient;
use crate::joblog::{self, EofPolicy};

#[derive(Parser)]
#[command(name = "cisync")]
#[command(author, version, about = "GitLab CI/CD telemetry sync", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to ./cisync.yaml or ./cisync.yml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Overrides `gitlab.token`
    #[arg(short, long, global = true, env = "GITLAB_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Overrides `gitlab.url`
    #[arg(short, long, global = true)]
    url: Option<String>,

    #[arg(short, long, global = true)]
    output: Option<PathBuf>,

    #[arg(short, long, global = true, default_value_t = false)]
    pretty: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync continuously until interrupted
    Run {
        /// Also walk back over the configured catch-up ranges
        #[arg(long, default_value_t = false)]
        catch_up: bool,
    },
    /// Resolve and print the project registry
    Resolve,
    /// Parse a job log file and print its sections and metrics
    ParseLog {
        file: PathBuf,

        /// Close sections still open at the end of the log at this unix time
        #[arg(long)]
        close_at: Option<i64>,
    },
    /// Check that GitLab is reachable
    Check,
}

impl Cli {
    /// Loads the configuration file and applies command-line overrides.
    pub fn load_config(&self) -> Result<Config> {
        let mut config = Config::load(self.config.as_deref())?;
        if let Some(token) = &self.token {
            config.gitlab.token = Some(token.clone());
        }
        if let Some(url) = &self.url {
            config.gitlab.url = url.clone();
        }
        config.validate().context("Invalid configuration")?;
        Ok(config)
    }

    fn build_controller(config: &Config, cancel: CancellationToken) -> Result<Controller> {
        let gitlab = &config.gitlab;
        let token = gitlab.token.as_deref().map(Token::from);
        let client = GitLabClient::new(
            &gitlab.url,
            token,
            gitlab.client.retry_policy(),
            gitlab.client.timeout(),
        )
        .context("Failed to create GitLab client")?;

        let exporter = Exporter::from_config(&config.endpoints, gitlab.client.timeout())
            .context("Failed to set up endpoints")?;
        if exporter.sink_count() == 0 {
            warn!("No endpoints configured, fetched data will be dropped");
        }

        Ok(Controller::new(
            Arc::new(client),
            exporter,
            Settings::from_config(config),
            cancel,
        ))
    }

    fn write_output(&self, value: &impl Serialize) -> Result<()> {
        let json_output = if self.pretty {
            serde_json::to_string_pretty(value)?
        } else {
            serde_json::to_string(value)?
        };

        if let Some(output_path) = &self.output {
            std::fs::write(output_path, json_output)
                .with_context(|| format!("Failed to write {}", output_path.display()))?;
            info!("Output written to: {}", output_path.display());
        } else {
            println!("{}", json_output);
        }

        Ok(())
    }

    async fn execute_run(
        &self,
        config: &Config,
        catch_up: bool,
        cancel: CancellationToken,
    ) -> Result<()> {
        let controller = Self::build_controller(config, cancel)?;
        let count = controller
            .resolve_projects()
            .await
            .context("Failed to resolve projects")?;
        info!("Syncing {count} projects");

        let catching_up = async {
            if !catch_up {
                return;
            }
            match controller.catch_up().await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => {}
                Err(e) => warn!("Catch-up finished with errors: {e}"),
            }
        };
        let refresh = Duration::from_secs(config.controller.refresh_interval_secs);

        tokio::join!(
            controller.run(),
            controller.refresh_projects(refresh),
            catching_up
        );
        Ok(())
    }

    async fn execute_resolve(&self, config: &Config) -> Result<()> {
        let controller = Self::build_controller(config, CancellationToken::new())?;
        controller
            .resolve_projects()
            .await
            .context("Failed to resolve projects")?;

        let registry = controller.projects().await;
        let projects: Vec<_> = registry.values().collect();
        self.write_output(&projects)
    }

    fn execute_parse_log(&self, file: &Path, close_at: Option<i64>) -> Result<()> {
        let log = std::fs::read(file)
            .with_context(|| format!("Failed to read log file: {}", file.display()))?;
        let policy = close_at.map_or(EofPolicy::LeaveOpen, EofPolicy::CloseAt);

        let parsed = joblog::parse_with(&log, policy);
        info!(
            "Parsed {} sections and {} metrics, rejected {} lines",
            parsed.sections.len(),
            parsed.metrics.len(),
            parsed.errors.len()
        );
        self.write_output(&parsed)
    }

    async fn execute_check(&self, config: &Config) -> Result<()> {
        let controller = Self::build_controller(config, CancellationToken::new())?;
        let probe = controller.readiness_probe();
        probe()
            .await
            .with_context(|| format!("GitLab at {} is not ready", config.gitlab.url))?;
        info!("GitLab at {} is ready", config.gitlab.url);
        Ok(())
    }

    pub async fn execute(&self, config: &Config, cancel: CancellationToken) -> Result<()> {
        match &self.command {
            Commands::Run { catch_up } => self.execute_run(config, *catch_up, cancel).await,
            Commands::Resolve => self.execute_resolve(config).await,
            Commands::ParseLog { file, close_at } => self.execute_parse_log(file, *close_at),
            Commands::Check => self.execute_check(config).await,
        }
    }
}
