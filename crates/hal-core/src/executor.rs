//! Command execution abstraction.
//!
//! A [`CommandExecutor`] runs one shell command against a [`CommandTarget`]
//! (the local host, a server over SSH, or a cloud instance over SSM) with a
//! hard timeout.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::{Error, Result};

/// Where a command runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandTarget {
    Local {
        #[serde(default)]
        cwd: Option<PathBuf>,
    },
    Ssh {
        user: String,
        host: String,
        #[serde(default)]
        port: Option<u16>,
        #[serde(default)]
        identity: Option<PathBuf>,
        #[serde(default)]
        cwd: Option<String>,
    },
    Ssm {
        instance_id: String,
        /// Use the PowerShell document instead of the shell script document.
        #[serde(default)]
        windows: bool,
        #[serde(default)]
        cwd: Option<String>,
    },
}

impl CommandTarget {
    pub fn local() -> Self {
        CommandTarget::Local { cwd: None }
    }

    pub fn local_in(cwd: impl Into<PathBuf>) -> Self {
        CommandTarget::Local {
            cwd: Some(cwd.into()),
        }
    }

    pub fn ssh(user: impl Into<String>, host: impl Into<String>) -> Self {
        CommandTarget::Ssh {
            user: user.into(),
            host: host.into(),
            port: None,
            identity: None,
            cwd: None,
        }
    }

    /// Short description used in events and logs.
    pub fn describe(&self) -> String {
        match self {
            CommandTarget::Local { .. } => "localhost".to_string(),
            CommandTarget::Ssh { user, host, .. } => format!("{user}@{host}"),
            CommandTarget::Ssm { instance_id, .. } => format!("ssm:{instance_id}"),
        }
    }
}

/// Result of one command.
///
/// Output captured before a timeout is kept.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandOutput {
    /// `None` when the process was killed or the exit code is unknown.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn is_success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// Stdout and stderr joined, trimmed.
    pub fn combined(&self) -> String {
        let stdout = self.stdout.trim_end();
        let stderr = self.stderr.trim_end();
        match (stdout.is_empty(), stderr.is_empty()) {
            (true, _) => stderr.to_string(),
            (_, true) => stdout.to_string(),
            _ => format!("{stdout}\n{stderr}"),
        }
    }

    /// Turn a failed output into a transport error carrying the command line.
    pub fn into_result(self, command: &str) -> Result<CommandOutput> {
        if self.is_success() {
            return Ok(self);
        }
        if self.timed_out {
            return Err(Error::Timeout(format!("`{command}` timed out")));
        }
        Err(Error::Transport {
            command: command.to_string(),
            exit_code: self.exit_code,
            output: self.combined(),
        })
    }
}

/// Runs commands. Implementations never retry.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run `command` through a shell on `target`.
    ///
    /// Returns `Err` only when the command could not be started; a non-zero
    /// exit or a timeout is reported in the [`CommandOutput`].
    async fn execute(
        &self,
        target: &CommandTarget,
        command: &str,
        env: &BTreeMap<String, String>,
        timeout: Duration,
    ) -> Result<CommandOutput>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_success() {
        let ok = CommandOutput {
            exit_code: Some(0),
            ..Default::default()
        };
        assert!(ok.is_success());

        let timed_out = CommandOutput {
            exit_code: Some(0),
            timed_out: true,
            ..Default::default()
        };
        assert!(!timed_out.is_success());
    }

    #[test]
    fn test_into_result_carries_output() {
        let failed = CommandOutput {
            exit_code: Some(2),
            stdout: "building\n".to_string(),
            stderr: "make: *** error\n".to_string(),
            timed_out: false,
        };
        match failed.into_result("make all") {
            Err(Error::Transport {
                command,
                exit_code,
                output,
            }) => {
                assert_eq!(command, "make all");
                assert_eq!(exit_code, Some(2));
                assert_eq!(output, "building\nmake: *** error");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_target_describe() {
        assert_eq!(CommandTarget::ssh("deploy", "web1").describe(), "deploy@web1");
        assert_eq!(CommandTarget::local().describe(), "localhost");
    }
}
