//! Local and SSH command execution.

use async_trait::async_trait;
use hal_core::executor::{CommandExecutor, CommandOutput, CommandTarget};
use hal_core::{Error, Result};
use regex::Regex;
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// How long to wait for output readers after the process has exited.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

static ENV_NAME: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").ok());

/// Quote a string for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@,+%".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Reject environment names a shell would not accept.
pub fn check_env_names(env: &BTreeMap<String, String>) -> Result<()> {
    let Some(pattern) = ENV_NAME.as_ref() else {
        return Err(Error::Internal("environment name pattern failed to compile".to_string()));
    };
    match env.keys().find(|k| !pattern.is_match(k)) {
        Some(bad) => Err(Error::InvalidInput(format!(
            "invalid environment variable name: {bad}"
        ))),
        None => Ok(()),
    }
}

/// Build the script run by the remote shell: change directory, export the
/// environment, then run the command.
pub fn remote_script(command: &str, env: &BTreeMap<String, String>, cwd: Option<&str>) -> String {
    let mut parts = Vec::new();
    if let Some(dir) = cwd {
        parts.push(format!("cd {}", shell_quote(dir)));
    }
    if !env.is_empty() {
        let exports: Vec<String> = env
            .iter()
            .map(|(k, v)| format!("{k}={}", shell_quote(v)))
            .collect();
        parts.push(format!("export {}", exports.join(" ")));
    }
    parts.push(command.to_string());
    parts.join(" && ")
}

/// Runs commands on the local host or over `ssh`.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    ssh_options: Vec<String>,
}

impl Default for ProcessExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessExecutor {
    pub fn new() -> Self {
        Self {
            ssh_options: vec![
                "-o".to_string(),
                "BatchMode=yes".to_string(),
                "-o".to_string(),
                "StrictHostKeyChecking=accept-new".to_string(),
            ],
        }
    }

    /// Arguments for `ssh` to run `script` on `user@host`.
    pub fn ssh_args(
        &self,
        user: &str,
        host: &str,
        port: Option<u16>,
        identity: Option<&Path>,
        script: &str,
    ) -> Vec<String> {
        let mut args = self.ssh_options.clone();
        if let Some(port) = port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        if let Some(identity) = identity {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        args.push(format!("{user}@{host}"));
        args.push(script.to_string());
        args
    }

    /// Spawn `program` with a hard timeout, capturing output as it arrives.
    pub async fn run_program(
        &self,
        program: &str,
        args: &[String],
        env: &BTreeMap<String, String>,
        cwd: Option<&Path>,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        // Own group, so a timeout reaches background children too.
        #[cfg(unix)]
        cmd.process_group(0);

        debug!(program, ?args, "Spawning process");
        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Internal(format!("failed to spawn {program}: {e}")))?;

        let stdout_buf = Arc::new(Mutex::new(Vec::new()));
        let stderr_buf = Arc::new(Mutex::new(Vec::new()));
        let stdout_task = child.stdout.take().map(|s| drain(s, stdout_buf.clone()));
        let stderr_task = child.stderr.take().map(|s| drain(s, stderr_buf.clone()));

        let (exit_code, timed_out) = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => (status?.code(), false),
            Err(_) => {
                warn!(program, timeout_secs = timeout.as_secs(), "Process timed out, killing");
                kill_tree(&mut child, program).await;
                (None, true)
            }
        };

        for task in [stdout_task, stderr_task].into_iter().flatten() {
            if tokio::time::timeout(DRAIN_GRACE, task).await.is_err() {
                debug!(program, "Output reader still open after exit");
            }
        }

        Ok(CommandOutput {
            exit_code,
            stdout: take_string(&stdout_buf),
            stderr: take_string(&stderr_buf),
            timed_out,
        })
    }
}

/// Kill the child's process group, then the child itself.
async fn kill_tree(child: &mut Child, program: &str) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        if let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok())
            && let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL)
        {
            warn!(program, pid, error = %e, "Failed to kill process group");
        }
    }
    if let Err(e) = child.kill().await {
        warn!(program, error = %e, "Failed to kill timed out process");
    }
}

fn drain<R>(mut reader: R, buf: Arc<Mutex<Vec<u8>>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if let Ok(mut b) = buf.lock() {
                        b.extend_from_slice(&chunk[..n]);
                    }
                }
            }
        }
    })
}

fn take_string(buf: &Arc<Mutex<Vec<u8>>>) -> String {
    buf.lock()
        .map(|b| String::from_utf8_lossy(&b).into_owned())
        .unwrap_or_default()
}

#[async_trait]
impl CommandExecutor for ProcessExecutor {
    async fn execute(
        &self,
        target: &CommandTarget,
        command: &str,
        env: &BTreeMap<String, String>,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        check_env_names(env)?;

        match target {
            CommandTarget::Local { cwd } => {
                let args = vec!["-c".to_string(), command.to_string()];
                self.run_program("sh", &args, env, cwd.as_deref(), timeout)
                    .await
            }
            CommandTarget::Ssh {
                user,
                host,
                port,
                identity,
                cwd,
            } => {
                let script = remote_script(command, env, cwd.as_deref());
                let args = self.ssh_args(user, host, *port, identity.as_deref(), &script);
                self.run_program("ssh", &args, &BTreeMap::new(), None, timeout)
                    .await
            }
            CommandTarget::Ssm { .. } => Err(Error::InvalidInput(
                "SSM targets are handled by the SSM executor".to_string(),
            )),
        }
    }
}
