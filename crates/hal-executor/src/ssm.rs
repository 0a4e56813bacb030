//! Command execution on cloud instances through SSM.

use async_trait::async_trait;
use hal_config::AgentConfig;
use hal_core::executor::{CommandExecutor, CommandOutput, CommandTarget};
use hal_core::{Error, Result};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use crate::aws::{AwsArg, AwsCli, query, query_str};
use crate::process::{ProcessExecutor, check_env_names, shell_quote};

const PENDING_STATES: [&str; 3] = ["Pending", "InProgress", "Delayed"];

/// Runs commands through `aws ssm send-command` and polls for the result.
#[derive(Clone)]
pub struct SsmExecutor {
    aws: AwsCli,
    poll_interval: Duration,
}

impl SsmExecutor {
    pub fn new(aws: AwsCli) -> Self {
        Self {
            aws,
            poll_interval: Duration::from_secs(5),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Lines of the script sent to the instance.
    pub fn script(command: &str, env: &BTreeMap<String, String>, windows: bool) -> Vec<String> {
        let mut lines: Vec<String> = env
            .iter()
            .map(|(k, v)| {
                if windows {
                    format!("$env:{k} = '{}'", v.replace('\'', "''"))
                } else {
                    format!("export {k}={}", shell_quote(v))
                }
            })
            .collect();
        lines.push(command.to_string());
        lines
    }

    async fn send(
        &self,
        instance_id: &str,
        windows: bool,
        cwd: Option<&str>,
        lines: Vec<String>,
        timeout: Duration,
    ) -> Result<String> {
        let document = if windows {
            "AWS-RunPowerShellScript"
        } else {
            "AWS-RunShellScript"
        };
        let mut parameters = json!({
            "commands": lines,
            "executionTimeout": [timeout.as_secs().max(1).to_string()],
        });
        if let Some(dir) = cwd {
            parameters["workingDirectory"] = json!([dir]);
        }

        let response = self
            .aws
            .call(
                "ssm",
                "send-command",
                &[
                    AwsArg::List("instance-ids", vec![instance_id.to_string()]),
                    AwsArg::Value("document-name", document.to_string()),
                    AwsArg::Value("parameters", parameters.to_string()),
                ],
            )
            .await?;

        query_str(&response, "$.Command.CommandId")?
            .ok_or_else(|| Error::Provider("send-command returned no command id".to_string()))
    }

    async fn cancel(&self, command_id: &str, instance_id: &str) {
        let result = self
            .aws
            .call(
                "ssm",
                "cancel-command",
                &[
                    AwsArg::Value("command-id", command_id.to_string()),
                    AwsArg::List("instance-ids", vec![instance_id.to_string()]),
                ],
            )
            .await;
        if let Err(e) = result {
            warn!(command_id, instance_id, error = %e, "Failed to cancel SSM command");
        }
    }
}

#[async_trait]
impl CommandExecutor for SsmExecutor {
    async fn execute(
        &self,
        target: &CommandTarget,
        command: &str,
        env: &BTreeMap<String, String>,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let CommandTarget::Ssm {
            instance_id,
            windows,
            cwd,
        } = target
        else {
            return Err(Error::InvalidInput(format!(
                "SSM executor cannot run on {}",
                target.describe()
            )));
        };
        check_env_names(env)?;

        let lines = Self::script(command, env, *windows);
        let command_id = self
            .send(instance_id, *windows, cwd.as_deref(), lines, timeout)
            .await?;
        info!(instance_id, command_id, "Sent SSM command");

        let deadline = Instant::now() + timeout;
        let mut last = CommandOutput::default();
        loop {
            sleep(self.poll_interval).await;

            match self
                .aws
                .call(
                    "ssm",
                    "get-command-invocation",
                    &[
                        AwsArg::Value("command-id", command_id.clone()),
                        AwsArg::Value("instance-id", instance_id.clone()),
                    ],
                )
                .await
            {
                Ok(invocation) => {
                    let status = query_str(&invocation, "$.Status")?.unwrap_or_default();
                    last.stdout = query_str(&invocation, "$.StandardOutputContent")?.unwrap_or_default();
                    last.stderr = query_str(&invocation, "$.StandardErrorContent")?.unwrap_or_default();

                    if !PENDING_STATES.contains(&status.as_str()) {
                        last.exit_code = query(&invocation, "$.ResponseCode")?
                            .and_then(|v| v.as_i64())
                            .and_then(|c| i32::try_from(c).ok());
                        last.timed_out = status == "TimedOut";
                        debug!(command_id, status, "SSM command finished");
                        return Ok(last);
                    }
                }
                // The invocation is not always visible right after sending.
                Err(e) => debug!(command_id, error = %e, "SSM invocation not ready"),
            }

            if Instant::now() >= deadline {
                warn!(instance_id, command_id, "SSM command timed out");
                self.cancel(&command_id, instance_id).await;
                last.exit_code = None;
                last.timed_out = true;
                return Ok(last);
            }
        }
    }
}

/// Dispatches each target to the executor that can reach it.
#[derive(Clone)]
pub struct RemoteRunner {
    process: Arc<ProcessExecutor>,
    ssm: Option<SsmExecutor>,
}

impl RemoteRunner {
    pub fn new(process: Arc<ProcessExecutor>) -> Self {
        Self { process, ssm: None }
    }

    pub fn with_ssm(mut self, ssm: SsmExecutor) -> Self {
        self.ssm = Some(ssm);
        self
    }

    /// Local and SSH targets run as processes. SSM targets go through the
    /// `aws` tool, which itself runs locally.
    pub fn for_agent(config: &AgentConfig) -> Self {
        let process = Arc::new(ProcessExecutor::new());
        let aws = AwsCli::for_agent(process.clone(), config);
        Self::new(process).with_ssm(SsmExecutor::new(aws))
    }
}

#[async_trait]
impl CommandExecutor for RemoteRunner {
    async fn execute(
        &self,
        target: &CommandTarget,
        command: &str,
        env: &BTreeMap<String, String>,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        match target {
            CommandTarget::Ssm { .. } => match &self.ssm {
                Some(ssm) => ssm.execute(target, command, env, timeout).await,
                None => Err(Error::Configuration(
                    "SSM execution requires AWS configuration".to_string(),
                )),
            },
            _ => self.process.execute(target, command, env, timeout).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Replays canned `aws` responses in order.
    struct ScriptedAws {
        responses: Mutex<Vec<CommandOutput>>,
        commands: Mutex<Vec<String>>,
    }

    impl ScriptedAws {
        fn new(stdouts: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(
                    stdouts
                        .iter()
                        .rev()
                        .map(|s| CommandOutput {
                            exit_code: Some(0),
                            stdout: s.to_string(),
                            ..Default::default()
                        })
                        .collect(),
                ),
                commands: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl CommandExecutor for ScriptedAws {
        async fn execute(
            &self,
            _target: &CommandTarget,
            command: &str,
            _env: &BTreeMap<String, String>,
            _timeout: Duration,
        ) -> Result<CommandOutput> {
            self.commands.lock().unwrap().push(command.to_string());
            Ok(self.responses.lock().unwrap().pop().unwrap_or_default())
        }
    }

    fn ssm(aws: Arc<ScriptedAws>) -> SsmExecutor {
        SsmExecutor::new(AwsCli::new(aws, Duration::from_secs(5)))
            .with_poll_interval(Duration::from_millis(1))
    }

    fn target() -> CommandTarget {
        CommandTarget::Ssm {
            instance_id: "i-0abc".to_string(),
            windows: true,
            cwd: Some("C:\\hal\\job".to_string()),
        }
    }

    #[test]
    fn test_script_lines() {
        let env = BTreeMap::from([("HAL_BUILDID".to_string(), "it's".to_string())]);
        assert_eq!(
            SsmExecutor::script("dotnet build", &env, true),
            vec!["$env:HAL_BUILDID = 'it''s'", "dotnet build"]
        );
        assert_eq!(
            SsmExecutor::script("make", &env, false),
            vec![r"export HAL_BUILDID='it'\''s'", "make"]
        );
    }

    #[tokio::test]
    async fn test_polls_until_finished() {
        let aws = ScriptedAws::new(&[
            r#"{"Command": {"CommandId": "cmd-1"}}"#,
            r#"{"Status": "InProgress", "StandardOutputContent": "restoring"}"#,
            r#"{"Status": "Failed", "ResponseCode": 2, "StandardOutputContent": "restoring\nbuild failed", "StandardErrorContent": "error CS1002"}"#,
        ]);
        let output = ssm(aws.clone())
            .execute(&target(), "dotnet build", &BTreeMap::new(), Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(output.exit_code, Some(2));
        assert!(output.stdout.ends_with("build failed"));
        assert_eq!(output.stderr, "error CS1002");
        assert!(!output.timed_out);

        let commands = aws.commands.lock().unwrap();
        assert!(commands[0].contains("AWS-RunPowerShellScript"));
        assert!(commands[1].contains("get-command-invocation"));
    }

    #[tokio::test]
    async fn test_timeout_cancels_command() {
        let aws = ScriptedAws::new(&[
            r#"{"Command": {"CommandId": "cmd-2"}}"#,
            r#"{"Status": "InProgress", "StandardOutputContent": "partial"}"#,
            r#"{"Status": "InProgress", "StandardOutputContent": "partial"}"#,
            r#"{"Status": "InProgress", "StandardOutputContent": "partial"}"#,
        ]);
        let output = ssm(aws.clone())
            .execute(&target(), "sleep", &BTreeMap::new(), Duration::from_millis(0))
            .await
            .unwrap();
        assert!(output.timed_out);
        assert_eq!(output.stdout, "partial");
        let commands = aws.commands.lock().unwrap();
        assert!(commands.last().unwrap().contains("cancel-command"));
    }

    #[tokio::test]
    async fn test_runner_dispatches_ssm_targets() {
        let aws = ScriptedAws::new(&[
            r#"{"Command": {"CommandId": "cmd-3"}}"#,
            r#"{"Status": "Success", "ResponseCode": 0, "StandardOutputContent": "Build succeeded"}"#,
        ]);
        let runner = RemoteRunner::new(Arc::new(ProcessExecutor::new())).with_ssm(ssm(aws.clone()));
        let output = runner
            .execute(&target(), "dotnet build", &BTreeMap::new(), Duration::from_secs(30))
            .await
            .unwrap();
        assert!(output.is_success());
        assert_eq!(output.stdout, "Build succeeded");
        assert!(aws.commands.lock().unwrap()[0].contains("send-command"));
    }

    #[test]
    fn test_agent_runner_reaches_ssm() {
        let config = AgentConfig {
            aws_region: Some("us-east-1".to_string()),
            ..AgentConfig::default()
        };
        let runner = RemoteRunner::for_agent(&config);
        let ssm = runner.ssm.as_ref().unwrap();
        assert!(
            ssm.aws
                .command_line("ssm", "send-command", &[])
                .contains("--region us-east-1")
        );
    }

    #[tokio::test]
    async fn test_runner_requires_ssm_configuration() {
        let runner = RemoteRunner::new(Arc::new(ProcessExecutor::new()));
        let err = runner
            .execute(&target(), "dir", &BTreeMap::new(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
