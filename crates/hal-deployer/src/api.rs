//! Provider APIs used by the push platforms and health checks.
//!
//! Responses are the raw JSON documents returned by the provider, read with
//! JSONPath expressions by the callers.

use async_trait::async_trait;
use hal_core::Result;
use hal_executor::aws::{AwsArg, AwsCli};
use hal_executor::download::GithubDownloader;
use serde_json::Value;

/// A new CodeDeploy deployment of an S3 bundle.
#[derive(Debug, Clone, PartialEq)]
pub struct DeploymentRequest {
    pub application: String,
    pub group: String,
    pub bucket: String,
    pub key: String,
    pub configuration: Option<String>,
    pub description: String,
}

#[async_trait]
pub trait CodeDeployApi: Send + Sync {
    async fn list_deployments(&self, application: &str, group: &str) -> Result<Value>;

    async fn get_deployment(&self, id: &str) -> Result<Value>;

    async fn list_deployment_instances(&self, id: &str) -> Result<Value>;

    async fn batch_get_deployment_instances(&self, id: &str, instance_ids: &[String]) -> Result<Value>;

    async fn create_deployment(&self, request: &DeploymentRequest) -> Result<Value>;
}

#[async_trait]
pub trait ElasticBeanstalkApi: Send + Sync {
    async fn describe_environments(&self, application: &str, environment: &str) -> Result<Value>;

    async fn create_application_version(
        &self,
        application: &str,
        label: &str,
        bucket: &str,
        key: &str,
        description: &str,
    ) -> Result<Value>;

    async fn update_environment(&self, application: &str, environment: &str, label: &str) -> Result<Value>;
}

#[async_trait]
pub trait CommitApi: Send + Sync {
    /// Compare `base` with `head` in `user/repo`.
    async fn compare(&self, user: &str, repo: &str, base: &str, head: &str) -> Result<Value>;
}

#[async_trait]
impl CommitApi for GithubDownloader {
    async fn compare(&self, user: &str, repo: &str, base: &str, head: &str) -> Result<Value> {
        GithubDownloader::compare(self, user, repo, base, head).await
    }
}

/// Environments are addressed by id when the value looks like one.
pub fn is_environment_id(environment: &str) -> bool {
    environment.starts_with("e-")
}

#[async_trait]
impl CodeDeployApi for AwsCli {
    async fn list_deployments(&self, application: &str, group: &str) -> Result<Value> {
        self.call(
            "deploy",
            "list-deployments",
            &[
                AwsArg::Value("application-name", application.to_string()),
                AwsArg::Value("deployment-group-name", group.to_string()),
            ],
        )
        .await
    }

    async fn get_deployment(&self, id: &str) -> Result<Value> {
        self.call("deploy", "get-deployment", &[AwsArg::Value("deployment-id", id.to_string())])
            .await
    }

    async fn list_deployment_instances(&self, id: &str) -> Result<Value> {
        self.call(
            "deploy",
            "list-deployment-instances",
            &[AwsArg::Value("deployment-id", id.to_string())],
        )
        .await
    }

    async fn batch_get_deployment_instances(&self, id: &str, instance_ids: &[String]) -> Result<Value> {
        self.call(
            "deploy",
            "batch-get-deployment-instances",
            &[
                AwsArg::Value("deployment-id", id.to_string()),
                AwsArg::List("instance-ids", instance_ids.to_vec()),
            ],
        )
        .await
    }

    async fn create_deployment(&self, request: &DeploymentRequest) -> Result<Value> {
        let mut args = vec![
            AwsArg::Value("application-name", request.application.clone()),
            AwsArg::Value("deployment-group-name", request.group.clone()),
            AwsArg::Value(
                "s3-location",
                format!("bucket={},key={},bundleType=tgz", request.bucket, request.key),
            ),
            AwsArg::Value("description", request.description.clone()),
        ];
        if let Some(config) = &request.configuration {
            args.push(AwsArg::Value("deployment-config-name", config.clone()));
        }
        self.call("deploy", "create-deployment", &args).await
    }
}

#[async_trait]
impl ElasticBeanstalkApi for AwsCli {
    async fn describe_environments(&self, application: &str, environment: &str) -> Result<Value> {
        let selector = if is_environment_id(environment) {
            "environment-ids"
        } else {
            "environment-names"
        };
        self.call(
            "elasticbeanstalk",
            "describe-environments",
            &[
                AwsArg::Value("application-name", application.to_string()),
                AwsArg::List(selector, vec![environment.to_string()]),
            ],
        )
        .await
    }

    async fn create_application_version(
        &self,
        application: &str,
        label: &str,
        bucket: &str,
        key: &str,
        description: &str,
    ) -> Result<Value> {
        self.call(
            "elasticbeanstalk",
            "create-application-version",
            &[
                AwsArg::Value("application-name", application.to_string()),
                AwsArg::Value("version-label", label.to_string()),
                AwsArg::Value("source-bundle", format!("S3Bucket={bucket},S3Key={key}")),
                AwsArg::Value("description", description.to_string()),
            ],
        )
        .await
    }

    async fn update_environment(&self, application: &str, environment: &str, label: &str) -> Result<Value> {
        let selector = if is_environment_id(environment) {
            "environment-id"
        } else {
            "environment-name"
        };
        self.call(
            "elasticbeanstalk",
            "update-environment",
            &[
                AwsArg::Value("application-name", application.to_string()),
                AwsArg::Value(selector, environment.to_string()),
                AwsArg::Value("version-label", label.to_string()),
            ],
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hal_core::executor::{CommandExecutor, CommandOutput, CommandTarget};
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingExecutor {
        commands: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CommandExecutor for RecordingExecutor {
        async fn execute(
            &self,
            _target: &CommandTarget,
            command: &str,
            _env: &BTreeMap<String, String>,
            _timeout: Duration,
        ) -> Result<CommandOutput> {
            self.commands.lock().unwrap().push(command.to_string());
            Ok(CommandOutput {
                exit_code: Some(0),
                stdout: "{}".to_string(),
                ..Default::default()
            })
        }
    }

    #[tokio::test]
    async fn test_environment_selector() {
        let executor = Arc::new(RecordingExecutor::default());
        let aws = AwsCli::new(executor.clone(), Duration::from_secs(5));
        aws.describe_environments("app", "e-abc123").await.unwrap();
        aws.describe_environments("app", "production").await.unwrap();
        aws.update_environment("app", "e-abc123", "v1").await.unwrap();

        let commands = executor.commands.lock().unwrap();
        assert!(commands[0].contains("--environment-ids e-abc123"));
        assert!(commands[1].contains("--environment-names production"));
        assert!(commands[2].contains("--environment-id e-abc123"));
    }

    #[tokio::test]
    async fn test_create_deployment_arguments() {
        let executor = Arc::new(RecordingExecutor::default());
        let aws = AwsCli::new(executor.clone(), Duration::from_secs(5));
        aws.create_deployment(&DeploymentRequest {
            application: "app".to_string(),
            group: "blue".to_string(),
            bucket: "bundles".to_string(),
            key: "app/hal9000-push-1.tar.gz".to_string(),
            configuration: Some("CodeDeployDefault.OneAtATime".to_string()),
            description: "hal9000 push 1".to_string(),
        })
        .await
        .unwrap();

        let commands = executor.commands.lock().unwrap();
        assert!(commands[0].contains("--s3-location bucket=bundles,key=app/hal9000-push-1.tar.gz,bundleType=tgz"));
        assert!(commands[0].contains("--deployment-config-name CodeDeployDefault.OneAtATime"));
    }
}
