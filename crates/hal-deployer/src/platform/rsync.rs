//! Rsync push: verify the target directory, report what changed since the
//! last push, run `pre_push` on the server, rsync the checkout over, then run
//! `post_push`.
//!
//! Every push leaves `.hal9000.push.yml` in the target directory. The next
//! push reads it back to compare commits.

use async_trait::async_trait;
use hal_core::executor::CommandTarget;
use hal_core::stage::{Stage, StageOutcome};
use hal_core::transfer::RemoteLocation;
use hal_core::{Error, JobId, PropertyBag, Result};
use hal_executor::process::shell_quote;
use hal_executor::stages::{RunCommandsStage, TargetFn, fail, job_configuration};
use hal_executor::transfer::{SshTransfer, SshTransport};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{PushContext, prepare};

pub const UNPACK_FAILED: i32 = 300;
pub const TRANSFORM_FAILED: i32 = 301;
pub const VERIFY_FAILED: i32 = 302;
pub const PRE_PUSH_FAILED: i32 = 303;
pub const RSYNC_FAILED: i32 = 304;
pub const POST_PUSH_FAILED: i32 = 305;

/// Record of the push, written into the deployed tree.
pub const PUSH_FILE: &str = ".hal9000.push.yml";

const EVENT_MESSAGE: &str = "Code Deployment";
const DELTA_MESSAGE: &str = "Code Delta";
const ERR_TIMEOUT: &str = "Deploying code to server took too long";

#[derive(Debug, Deserialize)]
struct RsyncTarget {
    path: String,
}

/// Server and directory of the push, with the hostname as validated by the
/// resolver.
struct Destination {
    user: String,
    host: String,
    path: String,
    identity: Option<PathBuf>,
}

impl Destination {
    fn from_bag(ctx: &PushContext, bag: &PropertyBag) -> Result<Self> {
        let target: RsyncTarget = bag.get_as("target")?;
        let host = bag.get_str("hostname")?.to_string();
        let user = ctx.config.ssh_user.clone();
        Ok(Self {
            identity: ctx.wallet.find(&user, &host).map(|c| c.identity.clone()),
            user,
            host,
            path: target.path,
        })
    }

    fn location(&self) -> RemoteLocation {
        RemoteLocation::Ssh {
            user: self.user.clone(),
            host: self.host.clone(),
            path: self.path.clone(),
        }
    }

    fn target(&self) -> CommandTarget {
        CommandTarget::Ssh {
            user: self.user.clone(),
            host: self.host.clone(),
            port: None,
            identity: self.identity.clone(),
            cwd: Some(self.path.clone()),
        }
    }

    fn transfer(&self, ctx: &PushContext) -> SshTransfer {
        SshTransfer::new(ctx.executor.clone(), SshTransport::Rsync, ctx.config.timeouts.push)
            .with_identity(self.identity.clone())
    }
}

pub fn stages(ctx: &PushContext) -> Vec<Arc<dyn Stage>> {
    let server: TargetFn = {
        let ctx = ctx.clone();
        Arc::new(move |bag: &PropertyBag| Ok(Destination::from_bag(&ctx, bag)?.target()))
    };

    let remote_commands = |list: &'static str, code: i32, message: &str| -> Arc<dyn Stage> {
        Arc::new(
            RunCommandsStage::new(list, ctx.executor.clone(), ctx.logger.clone(), server.clone(), list, code)
                .with_env_key("serverEnvironmentVariables")
                .with_timeout(ctx.config.timeouts.push)
                .with_message(message),
        )
    };

    let mut stages = prepare(ctx, UNPACK_FAILED, TRANSFORM_FAILED);
    stages.push(Arc::new(VerifyStage { ctx: ctx.clone() }));
    stages.push(Arc::new(CodeDeltaStage { ctx: ctx.clone() }));
    stages.push(remote_commands("pre_push", PRE_PUSH_FAILED, "Pre push command failed"));
    stages.push(Arc::new(RsyncStage { ctx: ctx.clone() }));
    stages.push(remote_commands("post_push", POST_PUSH_FAILED, "Post push command failed"));
    stages
}

struct VerifyStage {
    ctx: PushContext,
}

#[async_trait]
impl Stage for VerifyStage {
    fn name(&self) -> &str {
        "verify"
    }

    async fn run(&self, _job: &JobId, bag: &PropertyBag) -> Result<StageOutcome> {
        let dest = Destination::from_bag(&self.ctx, bag)?;
        let logger = self.ctx.logger.as_ref();

        match dest.transfer(&self.ctx).verify_target(&dest.user, &dest.host, &dest.path).await {
            Ok(()) => Ok(StageOutcome::passed()),
            Err(Error::Permission {
                directory,
                listing,
                required_owner,
                writeable,
            }) => Ok(fail(
                logger,
                VERIFY_FAILED,
                "Could not verify permissions of target directory",
                json!({
                    "directory": directory,
                    "listing": listing,
                    "requiredOwner": required_owner,
                    "writeable": writeable,
                }),
            )),
            Err(Error::Transport { command, output, .. }) => Ok(fail(
                logger,
                VERIFY_FAILED,
                "Could not verify target directory",
                json!({ "command": command, "output": output }),
            )),
            Err(e) => Err(e),
        }
    }
}

/// The push file found on the server.
#[derive(Debug, Default, Deserialize)]
struct PreviousPush {
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    date: Option<String>,
    commit: String,
    #[serde(default)]
    reference: Option<String>,
    #[serde(default)]
    source: Option<String>,
}

/// `owner/repo` from a repository web URL.
fn repository_of(source: &str) -> Option<(&str, &str)> {
    let (_, rest) = source.split_once("://")?;
    let mut parts = rest.trim_end_matches('/').split('/').skip(1);
    let owner = parts.next().filter(|p| !p.is_empty())?;
    let repo = parts.next().filter(|p| !p.is_empty())?;
    if parts.next().is_some() {
        return None;
    }
    Some((owner, repo.trim_end_matches(".git")))
}

/// Logs how the code on the server differs from the code being pushed.
/// Never fails the push.
struct CodeDeltaStage {
    ctx: PushContext,
}

impl CodeDeltaStage {
    async fn previous(&self, dest: &Destination) -> Option<PreviousPush> {
        let file = format!("{}/{PUSH_FILE}", dest.path.trim_end_matches('/'));
        let command = format!("cat {}", shell_quote(&file));
        let output = self
            .ctx
            .executor
            .execute(&dest.target(), &command, &BTreeMap::new(), self.ctx.config.timeouts.command)
            .await
            .ok()?;
        if !output.is_success() {
            return None;
        }
        serde_yaml_ng::from_str(&output.stdout).ok()
    }

    async fn delta(&self, previous: &PreviousPush, commit: &str) -> Value {
        let mut context = json!({ "user": previous.user, "time": previous.date });
        if previous.commit == commit {
            context["status"] = json!("No change. Code was redeployed.");
            return context;
        }

        context["status"] = json!("Code change found.");
        context["gitCommit"] = json!(previous.commit);
        let Some((owner, repo)) = previous.source.as_deref().and_then(repository_of) else {
            return context;
        };
        context["gitReference"] = json!(previous.reference);

        match self.ctx.commits.compare(owner, repo, &previous.commit, commit).await {
            Ok(comparison) => {
                context["githubComparisonURL"] = comparison["permalink_url"].clone();
                let mut status = json!({ "status": comparison["status"] });
                for key in ["ahead_by", "behind_by"] {
                    let count = &comparison[key];
                    if count.as_u64().is_some_and(|n| n > 0) || count.as_str().is_some_and(|s| !s.is_empty()) {
                        status[key] = count.clone();
                    }
                }
                context["commitStatus"] = status;
            }
            Err(e) => debug!(owner, repo, error = %e, "Could not compare commits"),
        }
        context
    }
}

#[async_trait]
impl Stage for CodeDeltaStage {
    fn name(&self) -> &str {
        "code_delta"
    }

    async fn run(&self, job: &JobId, bag: &PropertyBag) -> Result<StageOutcome> {
        let dest = Destination::from_bag(&self.ctx, bag)?;
        let commit = bag.get_str("pushProperties.commit").unwrap_or_default();

        match self.previous(&dest).await {
            Some(previous) => {
                let context = self.delta(&previous, commit).await;
                self.ctx.logger.success(DELTA_MESSAGE, context);
            }
            None => debug!(job_id = %job, server = %dest.host, "No previous push found on server"),
        }
        Ok(StageOutcome::passed())
    }
}

/// Write the push file into the checkout so it lands on the server.
async fn write_push_file(checkout: &std::path::Path, bag: &PropertyBag) -> Result<()> {
    let properties: Value = bag.get_as("pushProperties")?;
    let yaml = serde_yaml_ng::to_string(&properties)
        .map_err(|e| Error::Internal(format!("serialization: {e}")))?;
    tokio::fs::write(checkout.join(PUSH_FILE), yaml).await?;
    Ok(())
}

struct RsyncStage {
    ctx: PushContext,
}

#[async_trait]
impl Stage for RsyncStage {
    fn name(&self) -> &str {
        "rsync"
    }

    async fn run(&self, job: &JobId, bag: &PropertyBag) -> Result<StageOutcome> {
        let dest = Destination::from_bag(&self.ctx, bag)?;
        let checkout = bag.get_path("location.path")?;
        let excludes = job_configuration(bag)?.exclude;
        let transfer = dest.transfer(&self.ctx);
        let location = dest.location();
        let command = transfer.outgoing_command(&checkout, &location.uri(), &excludes);
        let logger = self.ctx.logger.as_ref();

        if let Err(e) = write_push_file(&checkout, bag).await {
            warn!(job_id = %job, error = %e, "Could not write push file");
        }

        info!(job_id = %job, server = %dest.host, path = %dest.path, "Deploying code");
        match transfer.sync_to(&checkout, &location, &excludes).await {
            Ok(()) => {
                logger.success(EVENT_MESSAGE, json!({ "command": command }));
                Ok(StageOutcome::passed())
            }
            Err(Error::Timeout(_)) => Ok(fail(logger, RSYNC_FAILED, ERR_TIMEOUT, json!({ "command": command }))),
            Err(Error::Transport { exit_code, output, .. }) => Ok(fail(
                logger,
                RSYNC_FAILED,
                EVENT_MESSAGE,
                json!({ "command": command, "exitCode": exit_code, "output": output }),
            )),
            Err(e) => Err(e),
        }
    }
}
