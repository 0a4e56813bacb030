//! Job resolution: turn a job id into the property bag its pipeline runs on.

use hal_config::{AgentConfig, JobConfiguration};
use hal_core::job::{Build, JobStatus, Push, TargetKind};
use hal_core::{Error, JobId, PropertyBag, Result};
use hal_executor::hostname::validate_hostname;
use serde_json::{Map, Value, json};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::queue::JobStore;

fn path_string(base: &Path, name: &str) -> String {
    base.join(name).display().to_string()
}

/// Variables every job command sees, in a stable order.
fn base_environment(config: &AgentConfig) -> Map<String, Value> {
    let mut env = Map::new();
    env.insert(
        "HOME".to_string(),
        json!(format!("{}/", path_string(&config.workspace, "home"))),
    );
    env.insert("PATH".to_string(), json!(config.env_path));
    env
}

fn build_variables(env: &mut Map<String, Value>, build: &Build) {
    env.insert("HAL_BUILDID".to_string(), json!(build.id.to_string()));
    env.insert("HAL_COMMIT".to_string(), json!(build.commit));
    env.insert("HAL_GITREF".to_string(), json!(build.reference));
    env.insert("HAL_ENVIRONMENT".to_string(), json!(build.environment));
    env.insert("HAL_REPO".to_string(), json!(build.repository.key));
}

pub struct BuildResolver {
    store: Arc<dyn JobStore>,
    config: Arc<AgentConfig>,
}

impl BuildResolver {
    pub fn new(store: Arc<dyn JobStore>, config: Arc<AgentConfig>) -> Self {
        Self { store, config }
    }

    pub async fn resolve(&self, id: &JobId) -> Result<(Build, PropertyBag)> {
        let build = self
            .store
            .build(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Build \"{id}\" could not be found!")))?;
        if build.status != JobStatus::Waiting {
            return Err(Error::Conflict(format!(
                "Build \"{id}\" has a status of \"{}\"! It cannot be rebuilt.",
                build.status
            )));
        }

        let base = &self.config.workspace;
        let download = path_string(base, &format!("hal9000-download-{id}.tar.gz"));
        let path = path_string(base, &format!("hal9000-build-{id}"));
        let temp_archive = path_string(base, &format!("hal9000-{id}.tar.gz"));
        let archive = path_string(&self.config.archive, &format!("hal9000-{id}.tar.gz"));

        let mut env = base_environment(&self.config);
        build_variables(&mut env, &build);

        let mut bag = PropertyBag::new(base)?;
        bag.insert(
            "build",
            json!({ "id": build.id.to_string(), "platform": build.platform }),
        )?;
        bag.insert(
            "location",
            json!({
                "download": download,
                "path": path,
                "archive": archive,
                "tempArchive": temp_archive,
            }),
        )?;
        bag.insert(
            "github",
            json!({
                "user": build.repository.github_user,
                "repo": build.repository.github_repo,
                "reference": build.commit,
            }),
        )?;
        bag.insert("configuration", JobConfiguration::from_repository(&build.repository))?;
        bag.insert("environmentVariables", env)?;
        bag.insert("encrypted", &build.encrypted)?;
        bag.insert("artifacts", vec![download, path, temp_archive])?;

        info!(job_id = %id, repository = %build.repository.key, "Resolved build");
        Ok((build, bag))
    }
}

pub struct PushResolver {
    store: Arc<dyn JobStore>,
    config: Arc<AgentConfig>,
}

impl PushResolver {
    pub fn new(store: Arc<dyn JobStore>, config: Arc<AgentConfig>) -> Self {
        Self { store, config }
    }

    pub async fn resolve(&self, id: &JobId) -> Result<(Push, PropertyBag)> {
        let push = self
            .store
            .push(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Push \"{id}\" could not be found!")))?;
        if push.status != JobStatus::Waiting {
            return Err(Error::Conflict(format!(
                "Push \"{id}\" has a status of \"{}\"! It cannot be redeployed.",
                push.status
            )));
        }
        let target = push
            .target
            .clone()
            .ok_or_else(|| Error::InvalidInput(format!("Push \"{id}\" has no deployment target!")))?;
        let running = self.store.pushes_to(&target.id, JobStatus::Pushing).await?;
        if running.iter().any(|p| p.id != push.id) {
            return Err(Error::Conflict(format!(
                "Push \"{id}\" is trying to clobber a running push! It cannot be deployed at this time."
            )));
        }

        let build = &push.build;
        let base = &self.config.workspace;
        let path = path_string(base, &format!("hal9000-push-{id}"));
        let temp_archive = path_string(base, &format!("hal9000-{id}.tar.gz"));
        let archive = path_string(&self.config.archive, &format!("hal9000-{}.tar.gz", build.id));

        let mut location = Map::new();
        location.insert("path".to_string(), json!(path));
        location.insert("archive".to_string(), json!(archive));
        location.insert("tempArchive".to_string(), json!(temp_archive));

        let (hostname, remote_path) = match &target.kind {
            TargetKind::Rsync { server, path } => {
                let hostname = validate_hostname(server, &self.config.hostname_suffixes).await?;
                location.insert(
                    "syncPath".to_string(),
                    json!(format!("{}@{hostname}:{path}", self.config.ssh_user)),
                );
                (Some(hostname), path.clone())
            }
            TargetKind::S3 { path, .. } => (None, path.clone()),
            TargetKind::ElasticBeanstalk { .. } | TargetKind::CodeDeploy { .. } => (None, String::new()),
        };

        let mut env = base_environment(&self.config);
        env.insert("HAL_HOSTNAME".to_string(), json!(hostname.clone().unwrap_or_default()));
        env.insert("HAL_PATH".to_string(), json!(remote_path));
        build_variables(&mut env, build);

        let mut server_env = env.clone();
        server_env.remove("HOME");
        server_env.remove("PATH");

        let repository = &build.repository;
        let push_properties = json!({
            "id": build.id.to_string(),
            "source": format!(
                "{}/{}/{}",
                self.config.github_web.trim_end_matches('/'),
                repository.github_user,
                repository.github_repo
            ),
            "env": build.environment,
            "user": push.user,
            "reference": build.reference,
            "commit": build.commit,
            "date": push.created.to_rfc3339(),
        });

        let mut bag = PropertyBag::new(base)?;
        bag.insert("push", json!({ "id": id.to_string(), "method": target.kind.method() }))?;
        bag.insert("target", &target)?;
        if let Some(hostname) = hostname {
            bag.insert("hostname", hostname)?;
        }
        bag.insert("location", location)?;
        bag.insert("configuration", JobConfiguration::from_repository(repository))?;
        bag.insert("environmentVariables", env)?;
        bag.insert("serverEnvironmentVariables", server_env)?;
        bag.insert("pushProperties", push_properties)?;
        bag.insert("artifacts", vec![temp_archive, path])?;

        info!(job_id = %id, target = %target.id, method = target.kind.method(), "Resolved push");
        Ok((push, bag))
    }
}
