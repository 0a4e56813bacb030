//! `hal health` checks.

use anyhow::Result;
use hal_config::AgentConfig;
use hal_deployer::{BeanstalkHealthChecker, CodeDeployHealthChecker};
use std::sync::Arc;

use super::aws;

pub async fn codedeploy(
    config: Arc<AgentConfig>,
    application: &str,
    group: &str,
    deployment: Option<String>,
    json: bool,
) -> Result<()> {
    let checker = CodeDeployHealthChecker::new(Arc::new(aws(&config)))
        .with_utc_offset(config.utc_offset);
    let health = match deployment {
        Some(id) => checker.deployment_instances_health(&id).await,
        None => checker.last_deployment_instances_health(application, group).await,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&health)?);
        return Ok(());
    }

    println!("Status: {}", health.status);
    if let Some(instances) = &health.instances {
        if let Some(message) = &instances.error_message {
            println!("Error: {message}");
        }
        if !instances.summary.is_empty() {
            println!("\n{}", instances.summary);
        }
        if !instances.detailed.is_empty() {
            println!("\n{}", instances.detailed);
        }
    }
    Ok(())
}

pub async fn beanstalk(config: Arc<AgentConfig>, application: &str, environment: &str, json: bool) -> Result<()> {
    let checker = BeanstalkHealthChecker::new(Arc::new(aws(&config)));
    let health = checker.environment_health(application, environment).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&health)?);
    } else {
        println!("Status: {}", health.status);
        println!("Health: {}", health.health);
    }
    Ok(())
}
