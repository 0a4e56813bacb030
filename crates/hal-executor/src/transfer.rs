//! File transfer over rsync, scp and S3.

use async_trait::async_trait;
use hal_core::executor::{CommandExecutor, CommandTarget};
use hal_core::transfer::{FileTransfer, RemoteLocation, check_transfer_paths};
use hal_core::{Error, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::aws::{AwsArg, AwsCli};
use crate::process::shell_quote;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SshTransport {
    Rsync,
    Scp,
}

/// Transfers to servers over SSH.
#[derive(Clone)]
pub struct SshTransfer {
    executor: Arc<dyn CommandExecutor>,
    transport: SshTransport,
    identity: Option<PathBuf>,
    timeout: Duration,
}

impl SshTransfer {
    pub fn new(executor: Arc<dyn CommandExecutor>, transport: SshTransport, timeout: Duration) -> Self {
        Self {
            executor,
            transport,
            identity: None,
            timeout,
        }
    }

    pub fn with_identity(mut self, identity: Option<PathBuf>) -> Self {
        self.identity = identity;
        self
    }

    fn ssh_command(&self) -> String {
        let mut ssh = "ssh -o BatchMode=yes".to_string();
        if let Some(identity) = &self.identity {
            ssh.push_str(&format!(" -i {}", shell_quote(&identity.display().to_string())));
        }
        ssh
    }

    fn ssh_target(&self, user: &str, host: &str) -> CommandTarget {
        CommandTarget::Ssh {
            user: user.to_string(),
            host: host.to_string(),
            port: None,
            identity: self.identity.clone(),
            cwd: None,
        }
    }

    /// Command line copying `local` to the remote location.
    pub fn outgoing_command(&self, local: &Path, remote: &str, excludes: &[String]) -> String {
        let local = format!("{}/", local.display().to_string().trim_end_matches('/'));
        match self.transport {
            SshTransport::Rsync => {
                let mut parts = vec![
                    "rsync".to_string(),
                    "-rlDz".to_string(),
                    "--delete-after".to_string(),
                    format!("--rsh={}", shell_quote(&self.ssh_command())),
                ];
                parts.extend(excludes.iter().map(|e| format!("--exclude={}", shell_quote(e))));
                parts.push(shell_quote(&local));
                parts.push(shell_quote(remote));
                parts.join(" ")
            }
            SshTransport::Scp => {
                let mut parts = vec!["scp".to_string(), "-r".to_string(), "-o".to_string(), "BatchMode=yes".to_string()];
                if let Some(identity) = &self.identity {
                    parts.push("-i".to_string());
                    parts.push(shell_quote(&identity.display().to_string()));
                }
                parts.push(format!("{}.", shell_quote(&local)));
                parts.push(shell_quote(remote));
                parts.join(" ")
            }
        }
    }

    /// Command line copying the remote location into `local`.
    pub fn incoming_command(&self, remote: &str, local: &Path) -> String {
        let local = local.display().to_string();
        match self.transport {
            SshTransport::Rsync => format!(
                "rsync -rlDz --rsh={} {} {}",
                shell_quote(&self.ssh_command()),
                shell_quote(&format!("{}/", remote.trim_end_matches('/'))),
                shell_quote(&format!("{}/", local.trim_end_matches('/')))
            ),
            SshTransport::Scp => {
                let identity = self
                    .identity
                    .as_ref()
                    .map(|i| format!(" -i {}", shell_quote(&i.display().to_string())))
                    .unwrap_or_default();
                format!(
                    "scp -r -o BatchMode=yes{} {} {}",
                    identity,
                    shell_quote(&format!("{}/.", remote.trim_end_matches('/'))),
                    shell_quote(&local)
                )
            }
        }
    }

    async fn remote(&self, user: &str, host: &str, command: &str) -> Result<hal_core::executor::CommandOutput> {
        self.executor
            .execute(&self.ssh_target(user, host), command, &BTreeMap::new(), self.timeout)
            .await
    }

    /// Make sure the target directory exists, is writeable and is owned by
    /// `user`. A missing directory is created; existing permissions are never
    /// changed.
    pub async fn verify_target(&self, user: &str, host: &str, path: &str) -> Result<()> {
        let connect = self.remote(user, host, "true").await?;
        if !connect.is_success() {
            return Err(Error::Transport {
                command: format!("ssh {user}@{host}"),
                exit_code: connect.exit_code,
                output: format!("Could not connect to server: {}", connect.combined()),
            });
        }

        let quoted = shell_quote(path);
        if !self.remote(user, host, &format!("test -d {quoted}")).await?.is_success() {
            info!(host, path, "Create target directory");
            let mkdir = format!("mkdir {quoted}");
            self.remote(user, host, &mkdir).await?.into_result(&mkdir)?;
        }

        let writeable = self
            .remote(user, host, &format!("test -w {quoted}"))
            .await?
            .is_success();

        let ls = format!("ls -ld {quoted}");
        let listing = self.remote(user, host, &ls).await?;
        if !listing.is_success() {
            return Err(Error::Transport {
                command: ls,
                exit_code: listing.exit_code,
                output: format!("Could not read permissions of target directory: {}", listing.combined()),
            });
        }

        let owned = self
            .remote(
                user,
                host,
                &format!("find {quoted} -prune -user {} -type d", shell_quote(user)),
            )
            .await?;
        let owned = owned.is_success() && !owned.stdout.trim().is_empty();

        if !writeable || !owned {
            warn!(host, path, writeable, owned, "Could not verify permissions of target directory");
            return Err(Error::Permission {
                directory: path.to_string(),
                listing: listing.stdout.trim().to_string(),
                required_owner: user.to_string(),
                writeable,
            });
        }
        Ok(())
    }

    /// Copy without verifying the target first.
    pub async fn sync_to(&self, local: &Path, remote: &RemoteLocation, excludes: &[String]) -> Result<()> {
        check_transfer_paths(local, remote)?;
        let RemoteLocation::Ssh { .. } = remote else {
            return Err(Error::InvalidInput(format!("{remote} is not an SSH location")));
        };
        let command = self.outgoing_command(local, &remote.uri(), excludes);
        self.executor
            .execute(&CommandTarget::local(), &command, &BTreeMap::new(), self.timeout)
            .await?
            .into_result(&command)?;
        Ok(())
    }
}

#[async_trait]
impl FileTransfer for SshTransfer {
    async fn push(&self, local: &Path, remote: &RemoteLocation, excludes: &[String]) -> Result<()> {
        check_transfer_paths(local, remote)?;
        if let RemoteLocation::Ssh { user, host, path } = remote {
            self.verify_target(user, host, path).await?;
        }
        self.sync_to(local, remote, excludes).await
    }

    async fn pull(&self, remote: &RemoteLocation, local: &Path) -> Result<()> {
        check_transfer_paths(local, remote)?;
        let RemoteLocation::Ssh { .. } = remote else {
            return Err(Error::InvalidInput(format!("{remote} is not an SSH location")));
        };
        tokio::fs::create_dir_all(local).await?;
        let command = self.incoming_command(&remote.uri(), local);
        self.executor
            .execute(&CommandTarget::local(), &command, &BTreeMap::new(), self.timeout)
            .await?
            .into_result(&command)?;
        Ok(())
    }
}

/// Strip the prefixes S3 keys must not start with.
pub fn normalize_s3_prefix(directory: &str) -> &str {
    if directory == "." {
        ""
    } else if let Some(rest) = directory.strip_prefix("./") {
        rest
    } else if let Some(rest) = directory.strip_prefix('/') {
        rest
    } else {
        directory
    }
}

/// Transfers to S3 with `aws s3`.
#[derive(Clone)]
pub struct S3Transfer {
    aws: AwsCli,
}

impl S3Transfer {
    pub fn new(aws: AwsCli) -> Self {
        Self { aws }
    }
}

#[async_trait]
impl FileTransfer for S3Transfer {
    /// A file is copied to the key; a directory is synced under the key
    /// prefix, removing objects that no longer exist locally.
    async fn push(&self, local: &Path, remote: &RemoteLocation, excludes: &[String]) -> Result<()> {
        check_transfer_paths(local, remote)?;
        let RemoteLocation::S3 { bucket, key } = remote else {
            return Err(Error::InvalidInput(format!("{remote} is not an S3 location")));
        };
        let uri = format!("s3://{}/{}", bucket, normalize_s3_prefix(key));
        let source = AwsArg::Positional(local.display().to_string());

        if local.is_dir() {
            let mut args = vec![source, AwsArg::Positional(uri), AwsArg::Flag("delete")];
            args.extend(excludes.iter().map(|e| AwsArg::Value("exclude", e.clone())));
            self.aws.call("s3", "sync", &args).await?;
        } else {
            self.aws
                .call("s3", "cp", &[source, AwsArg::Positional(uri)])
                .await?;
        }
        Ok(())
    }

    async fn pull(&self, remote: &RemoteLocation, local: &Path) -> Result<()> {
        check_transfer_paths(local, remote)?;
        let RemoteLocation::S3 { bucket, key } = remote else {
            return Err(Error::InvalidInput(format!("{remote} is not an S3 location")));
        };
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let uri = format!("s3://{}/{}", bucket, normalize_s3_prefix(key));
        self.aws
            .call(
                "s3",
                "cp",
                &[AwsArg::Positional(uri), AwsArg::Positional(local.display().to_string())],
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hal_core::executor::CommandOutput;
    use std::sync::Mutex;

    /// Answers remote commands from a table of (prefix, exit code, stdout).
    struct FakeServer {
        answers: Vec<(&'static str, i32, &'static str)>,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CommandExecutor for FakeServer {
        async fn execute(
            &self,
            _target: &CommandTarget,
            command: &str,
            _env: &BTreeMap<String, String>,
            _timeout: Duration,
        ) -> Result<CommandOutput> {
            self.seen.lock().unwrap().push(command.to_string());
            let (code, stdout) = self
                .answers
                .iter()
                .find(|(prefix, _, _)| command.starts_with(prefix))
                .map(|(_, code, out)| (*code, *out))
                .unwrap_or((0, ""));
            Ok(CommandOutput {
                exit_code: Some(code),
                stdout: stdout.to_string(),
                ..Default::default()
            })
        }
    }

    fn transfer(answers: Vec<(&'static str, i32, &'static str)>) -> (SshTransfer, Arc<FakeServer>) {
        let server = Arc::new(FakeServer {
            answers,
            seen: Mutex::new(Vec::new()),
        });
        let transfer = SshTransfer::new(server.clone(), SshTransport::Rsync, Duration::from_secs(30));
        (transfer, server)
    }

    #[test]
    fn test_rsync_command() {
        let (transfer, _) = transfer(vec![]);
        let transfer = transfer.with_identity(Some(PathBuf::from("/keys/deploy")));
        let command = transfer.outgoing_command(
            Path::new("/tmp/hal/hal9000-push-1234"),
            "sshuser@127.0.0.1:/herp/derp",
            &["config/database.ini".to_string(), "data/".to_string()],
        );
        assert_eq!(
            command,
            "rsync -rlDz --delete-after --rsh='ssh -o BatchMode=yes -i /keys/deploy' \
             --exclude=config/database.ini --exclude=data/ /tmp/hal/hal9000-push-1234/ \
             sshuser@127.0.0.1:/herp/derp"
        );
    }

    #[test]
    fn test_scp_command() {
        let server = Arc::new(FakeServer {
            answers: vec![],
            seen: Mutex::new(Vec::new()),
        });
        let scp = SshTransfer::new(server, SshTransport::Scp, Duration::from_secs(30));
        assert_eq!(
            scp.outgoing_command(Path::new("/tmp/hal/job"), "u@h:/srv", &[]),
            "scp -r -o BatchMode=yes /tmp/hal/job/. u@h:/srv"
        );
        assert_eq!(
            scp.incoming_command("u@h:/srv/out", Path::new("/tmp/hal/job")),
            "scp -r -o BatchMode=yes u@h:/srv/out/. /tmp/hal/job"
        );
    }

    #[tokio::test]
    async fn test_verify_creates_missing_directory() {
        let (transfer, server) = transfer(vec![
            ("test -d", 1, ""),
            ("ls -ld", 0, "drwxr-xr-x 2 sshuser sshuser 4096 /herp/derp\n"),
            ("find", 0, "/herp/derp\n"),
        ]);
        transfer
            .verify_target("sshuser", "127.0.0.1", "/herp/derp")
            .await
            .unwrap();
        let seen = server.seen.lock().unwrap();
        assert!(seen.iter().any(|c| c == "mkdir /herp/derp"));
        assert!(!seen.iter().any(|c| c.starts_with("chmod") || c.starts_with("chown")));
    }

    #[tokio::test]
    async fn test_verify_reports_listing_on_wrong_owner() {
        let (transfer, _) = transfer(vec![
            ("ls -ld", 0, "drwxr-xr-x 2 root root 4096 /herp/derp\n"),
            ("find", 0, ""),
        ]);
        let err = transfer
            .verify_target("sshuser", "127.0.0.1", "/herp/derp")
            .await
            .unwrap_err();
        match err {
            Error::Permission {
                listing,
                required_owner,
                writeable,
                ..
            } => {
                assert!(listing.contains("root root"));
                assert_eq!(required_owner, "sshuser");
                assert!(writeable);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_verify_unreachable_server() {
        let (transfer, _) = transfer(vec![("true", 255, "")]);
        let err = transfer.verify_target("u", "h", "/srv").await.unwrap_err();
        assert!(matches!(err, Error::Transport { ref output, .. } if output.contains("Could not connect")));
    }

    #[tokio::test]
    async fn test_push_rejects_traversal() {
        let (transfer, server) = transfer(vec![]);
        let remote = RemoteLocation::Ssh {
            user: "u".to_string(),
            host: "h".to_string(),
            path: "/srv/../etc".to_string(),
        };
        let err = transfer.push(Path::new("/tmp/hal/job"), &remote, &[]).await.unwrap_err();
        assert!(matches!(err, Error::Traversal { .. }));
        assert!(server.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_normalize_s3_prefix() {
        assert_eq!(normalize_s3_prefix("."), "");
        assert_eq!(normalize_s3_prefix("./site"), "site");
        assert_eq!(normalize_s3_prefix("/site"), "site");
        assert_eq!(normalize_s3_prefix("site/assets"), "site/assets");
    }

    #[tokio::test]
    async fn test_s3_push_file_uses_cp() {
        let server = Arc::new(FakeServer {
            answers: vec![],
            seen: Mutex::new(Vec::new()),
        });
        let s3 = S3Transfer::new(AwsCli::new(server.clone(), Duration::from_secs(30)));
        let remote = RemoteLocation::S3 {
            bucket: "hal-artifacts".to_string(),
            key: "/builds/hal9000-1.tar.gz".to_string(),
        };
        s3.push(Path::new("/tmp/hal/hal9000-1.tar.gz"), &remote, &[])
            .await
            .unwrap();
        let seen = server.seen.lock().unwrap();
        assert_eq!(
            seen[0],
            "aws s3 cp /tmp/hal/hal9000-1.tar.gz s3://hal-artifacts/builds/hal9000-1.tar.gz --output json"
        );
    }
}
