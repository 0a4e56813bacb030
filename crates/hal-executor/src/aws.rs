//! Thin client over the `aws` command line tool.
//!
//! Every call runs `aws <service> <operation> ... --output json` through a
//! [`CommandExecutor`] and returns the parsed JSON document. Results are
//! read with JSONPath expressions.

use hal_config::AgentConfig;
use hal_core::executor::{CommandExecutor, CommandTarget};
use hal_core::{Error, Result};
use serde_json::Value;
use serde_json_path::JsonPath;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::process::shell_quote;

/// An argument to an `aws` call.
#[derive(Debug, Clone)]
pub enum AwsArg {
    /// `--name value`
    Value(&'static str, String),
    /// `--name v1 v2 ...`
    List(&'static str, Vec<String>),
    /// `--name`
    Flag(&'static str),
    /// A bare positional argument (used by `aws s3`).
    Positional(String),
}

#[derive(Clone)]
pub struct AwsCli {
    executor: Arc<dyn CommandExecutor>,
    region: Option<String>,
    profile: Option<String>,
    timeout: Duration,
}

impl AwsCli {
    pub fn new(executor: Arc<dyn CommandExecutor>, timeout: Duration) -> Self {
        Self {
            executor,
            region: None,
            profile: None,
            timeout,
        }
    }

    /// Client with the agent's region, profile and command timeout.
    pub fn for_agent(executor: Arc<dyn CommandExecutor>, config: &AgentConfig) -> Self {
        Self::new(executor, config.timeouts.command)
            .with_region(config.aws_region.clone())
            .with_profile(config.aws_profile.clone())
    }

    pub fn with_region(mut self, region: Option<String>) -> Self {
        self.region = region;
        self
    }

    pub fn with_profile(mut self, profile: Option<String>) -> Self {
        self.profile = profile;
        self
    }

    /// Render the full command line for a call.
    pub fn command_line(&self, service: &str, operation: &str, args: &[AwsArg]) -> String {
        let mut parts = vec!["aws".to_string(), service.to_string(), operation.to_string()];
        for arg in args {
            match arg {
                AwsArg::Value(name, value) => {
                    parts.push(format!("--{name}"));
                    parts.push(shell_quote(value));
                }
                AwsArg::List(name, values) => {
                    parts.push(format!("--{name}"));
                    parts.extend(values.iter().map(|v| shell_quote(v)));
                }
                AwsArg::Flag(name) => parts.push(format!("--{name}")),
                AwsArg::Positional(value) => parts.push(shell_quote(value)),
            }
        }
        if let Some(region) = &self.region {
            parts.push("--region".to_string());
            parts.push(shell_quote(region));
        }
        if let Some(profile) = &self.profile {
            parts.push("--profile".to_string());
            parts.push(shell_quote(profile));
        }
        parts.push("--output".to_string());
        parts.push("json".to_string());
        parts.join(" ")
    }

    /// Run a call and parse its JSON output. Empty output yields `Null`.
    pub async fn call(&self, service: &str, operation: &str, args: &[AwsArg]) -> Result<Value> {
        let command = self.command_line(service, operation, args);
        debug!(service, operation, "Calling AWS");

        let output = self
            .executor
            .execute(&CommandTarget::local(), &command, &BTreeMap::new(), self.timeout)
            .await?;

        if !output.is_success() {
            return Err(Error::Provider(format!(
                "aws {service} {operation} failed: {}",
                output.combined()
            )));
        }

        let stdout = output.stdout.trim();
        if stdout.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(stdout)
            .map_err(|e| Error::Provider(format!("aws {service} {operation} returned invalid JSON: {e}")))
    }
}

/// First node matched by a JSONPath expression.
pub fn query(value: &Value, path: &str) -> Result<Option<Value>> {
    let path = JsonPath::parse(path)
        .map_err(|e| Error::Internal(format!("invalid JSONPath {path}: {e}")))?;
    Ok(path.query(value).first().cloned())
}

/// String at a JSONPath expression, if present.
pub fn query_str(value: &Value, path: &str) -> Result<Option<String>> {
    Ok(query(value, path)?.and_then(|v| v.as_str().map(str::to_string)))
}

/// Every node matched by a JSONPath expression.
pub fn query_all(value: &Value, path: &str) -> Result<Vec<Value>> {
    let path = JsonPath::parse(path)
        .map_err(|e| Error::Internal(format!("invalid JSONPath {path}: {e}")))?;
    Ok(path.query(value).all().into_iter().cloned().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use hal_core::executor::CommandOutput;
    use serde_json::json;
    use std::sync::Mutex;

    struct RecordingExecutor {
        commands: Mutex<Vec<String>>,
        output: CommandOutput,
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
            Ok(self.output.clone())
        }
    }

    fn cli(output: CommandOutput) -> (AwsCli, Arc<RecordingExecutor>) {
        let executor = Arc::new(RecordingExecutor {
            commands: Mutex::new(Vec::new()),
            output,
        });
        let cli = AwsCli::new(executor.clone(), Duration::from_secs(30))
            .with_region(Some("us-east-1".to_string()));
        (cli, executor)
    }

    #[test]
    fn test_command_line() {
        let (cli, _) = cli(CommandOutput::default());
        let line = cli.command_line(
            "deploy",
            "list-deployments",
            &[
                AwsArg::Value("application-name", "my app".to_string()),
                AwsArg::List("include-only-statuses", vec!["Succeeded".to_string()]),
            ],
        );
        assert_eq!(
            line,
            "aws deploy list-deployments --application-name 'my app' --include-only-statuses Succeeded --region us-east-1 --output json"
        );
    }

    #[tokio::test]
    async fn test_call_parses_json() {
        let (cli, executor) = cli(CommandOutput {
            exit_code: Some(0),
            stdout: r#"{"deployments": ["d-1", "d-2"]}"#.to_string(),
            ..Default::default()
        });
        let value = cli.call("deploy", "list-deployments", &[]).await.unwrap();
        assert_eq!(query_str(&value, "$.deployments[0]").unwrap().as_deref(), Some("d-1"));
        assert_eq!(executor.commands.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_call_failure_is_provider_error() {
        let (cli, _) = cli(CommandOutput {
            exit_code: Some(255),
            stderr: "An error occurred (ApplicationDoesNotExistException)".to_string(),
            ..Default::default()
        });
        let err = cli.call("deploy", "list-deployments", &[]).await.unwrap_err();
        assert!(matches!(err, Error::Provider(ref m) if m.contains("ApplicationDoesNotExist")));
    }

    #[test]
    fn test_query_helpers() {
        let doc = json!({"instancesList": ["i-1", "i-2"], "deploymentInfo": {"status": "Failed"}});
        assert_eq!(query_all(&doc, "$.instancesList[*]").unwrap().len(), 2);
        assert_eq!(
            query_str(&doc, "$.deploymentInfo.status").unwrap().as_deref(),
            Some("Failed")
        );
        assert!(query(&doc, "$.missing").unwrap().is_none());
    }
}
