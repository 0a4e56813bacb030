//! CLI command implementations.

pub mod health;
pub mod runner;
pub mod worker;

use anyhow::{Context, Result};
use hal_config::{AgentConfig, JobConfiguration};
use hal_core::executor::CommandExecutor;
use hal_executor::{AwsCli, ProcessExecutor, RemoteRunner};
use std::path::Path;
use std::sync::Arc;

const DEFAULT_CONFIG: &str = "hal.kdl";

/// Load the agent configuration, falling back to `./hal.kdl` and then to defaults.
pub fn load_config(path: Option<&Path>) -> Result<Arc<AgentConfig>> {
    let config = match path {
        Some(path) => AgentConfig::load(path)
            .with_context(|| format!("Failed to load config file: {}", path.display()))?,
        None if Path::new(DEFAULT_CONFIG).exists() => AgentConfig::load(Path::new(DEFAULT_CONFIG))
            .with_context(|| format!("Failed to load config file: {DEFAULT_CONFIG}"))?,
        None => AgentConfig::default(),
    };
    Ok(Arc::new(config))
}

/// Executor for pipeline commands: local, SSH and SSM targets.
pub(crate) fn executor(config: &AgentConfig) -> Arc<dyn CommandExecutor> {
    Arc::new(RemoteRunner::for_agent(config))
}

pub(crate) fn aws(config: &AgentConfig) -> AwsCli {
    AwsCli::for_agent(Arc::new(ProcessExecutor::new()), config)
}

pub fn validate(config: &AgentConfig, job: Option<&Path>) -> Result<()> {
    println!("Agent configuration is valid");
    println!("  workspace: {}", config.workspace.display());
    println!("  jobs: {}", config.jobs.display());
    println!("  credentials: {}", config.credentials.len());

    if let Some(path) = job {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read job configuration: {}", path.display()))?;
        let job = JobConfiguration::from_yaml(&content)
            .map_err(|e| anyhow::anyhow!("Job configuration error: {e}"))?;
        println!("Job configuration is valid (system: {})", job.system);
    }
    Ok(())
}
