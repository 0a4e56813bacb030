//! Unix build platform: rsync the checkout to a build server, run the build
//! commands there over ssh, and rsync the result back.

use async_trait::async_trait;
use hal_core::credential::CredentialWallet;
use hal_core::executor::{CommandExecutor, CommandTarget};
use hal_core::paths::has_traversal;
use hal_core::stage::{EmergencyCleanup, Stage, StageKind, StageOutcome};
use hal_core::transfer::{FileTransfer, RemoteLocation};
use hal_core::{JobId, PropertyBag, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

use super::{BuildPlatform, BuildSystem, PlatformContext};
use crate::hostname::validate_hostname;
use crate::process::shell_quote;
use crate::stages::{DecryptStage, RunCommandsStage, TargetFn, fail};
use crate::transfer::{SshTransfer, SshTransport};

pub const CONFIGURE_FAILED: i32 = 100;
pub const EXPORT_FAILED: i32 = 101;
pub const DECRYPT_FAILED: i32 = 102;
pub const BUILD_FAILED: i32 = 103;
pub const IMPORT_FAILED: i32 = 104;

/// The `unix` bag entry written by the configure stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnixBuildServer {
    pub server: String,
    pub user: String,
    pub remote_path: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl UnixBuildServer {
    fn location(&self) -> RemoteLocation {
        RemoteLocation::Ssh {
            user: self.user.clone(),
            host: self.server.clone(),
            path: self.remote_path.clone(),
        }
    }
}

fn identity(wallet: &CredentialWallet, user: &str, server: &str) -> Option<PathBuf> {
    wallet.find(user, server).map(|c| c.identity.clone())
}

fn transfer(ctx: &PlatformContext, server: &UnixBuildServer) -> SshTransfer {
    SshTransfer::new(ctx.executor.clone(), SshTransport::Rsync, ctx.config.timeouts.command)
        .with_identity(identity(&ctx.wallet, &server.user, &server.server))
}

pub fn platform(ctx: &PlatformContext) -> BuildPlatform {
    let cleanup = Arc::new(UnixCleanup::new(ctx.clone()));

    let wallet = ctx.wallet.clone();
    let build_target: TargetFn = Arc::new(move |bag: &PropertyBag| {
        let server: UnixBuildServer = bag.get_as("unix")?;
        Ok(CommandTarget::Ssh {
            identity: identity(&wallet, &server.user, &server.server),
            user: server.user,
            host: server.server,
            port: None,
            cwd: Some(server.remote_path),
        })
    });
    let build_env = ctx
        .config
        .unix
        .as_ref()
        .map(|u| u.env.clone())
        .unwrap_or_default();

    let stages: Vec<Arc<dyn Stage>> = vec![
        Arc::new(ConfigureStage { ctx: ctx.clone() }),
        Arc::new(ExportStage { ctx: ctx.clone() }),
        Arc::new(DecryptStage::new(ctx.decrypter.clone(), ctx.logger.clone(), DECRYPT_FAILED)),
        Arc::new(
            RunCommandsStage::new("build", ctx.executor.clone(), ctx.logger.clone(), build_target, "build", BUILD_FAILED)
                .with_extra_env(build_env)
                .with_timeout(ctx.config.timeouts.build)
                .with_message("Build command failed"),
        ),
        Arc::new(ImportStage { ctx: ctx.clone() }),
        cleanup.clone(),
    ];

    BuildPlatform {
        system: BuildSystem::Unix,
        stages,
        emergency: Some(cleanup),
    }
}

/// Checks the build server configuration and picks the remote directory.
struct ConfigureStage {
    ctx: PlatformContext,
}

#[async_trait]
impl Stage for ConfigureStage {
    fn name(&self) -> &str {
        "configure"
    }

    async fn run(&self, job: &JobId, _bag: &PropertyBag) -> Result<StageOutcome> {
        let logger = self.ctx.logger.as_ref();
        let Some(unix) = &self.ctx.config.unix else {
            return Ok(fail(logger, CONFIGURE_FAILED, "Unix build system is not configured", json!({})));
        };

        let server = match validate_hostname(&unix.server, &self.ctx.config.hostname_suffixes).await {
            Ok(server) => server,
            Err(e) => {
                return Ok(fail(
                    logger,
                    CONFIGURE_FAILED,
                    "Unix build system is not configured",
                    json!({ "server": unix.server, "error": e.to_string() }),
                ));
            }
        };

        let entry = UnixBuildServer {
            server,
            user: unix.user.clone(),
            remote_path: format!("{}/hal9000-build-{}", unix.path.trim_end_matches('/'), job),
            env: unix.env.clone(),
        };
        info!(job_id = %job, server = %entry.server, path = %entry.remote_path, "Configured unix build server");
        Ok(StageOutcome::with("unix", serde_json::to_value(entry)?))
    }
}

struct ExportStage {
    ctx: PlatformContext,
}

#[async_trait]
impl Stage for ExportStage {
    fn name(&self) -> &str {
        "export"
    }

    fn allocates_remote(&self) -> bool {
        true
    }

    async fn run(&self, _job: &JobId, bag: &PropertyBag) -> Result<StageOutcome> {
        let server: UnixBuildServer = bag.get_as("unix")?;
        let checkout = bag.get_path("location.path")?;

        match transfer(&self.ctx, &server).push(&checkout, &server.location(), &[]).await {
            Ok(()) => Ok(StageOutcome::passed()),
            Err(e) => Ok(fail(
                self.ctx.logger.as_ref(),
                EXPORT_FAILED,
                "Failed to export build to build system",
                json!({ "server": server.server, "path": server.remote_path, "error": e.to_string() }),
            )),
        }
    }
}

struct ImportStage {
    ctx: PlatformContext,
}

#[async_trait]
impl Stage for ImportStage {
    fn name(&self) -> &str {
        "import"
    }

    async fn run(&self, _job: &JobId, bag: &PropertyBag) -> Result<StageOutcome> {
        let server: UnixBuildServer = bag.get_as("unix")?;
        let checkout = bag.get_path("location.path")?;

        match transfer(&self.ctx, &server).pull(&server.location(), &checkout).await {
            Ok(()) => Ok(StageOutcome::passed()),
            Err(e) => Ok(fail(
                self.ctx.logger.as_ref(),
                IMPORT_FAILED,
                "Failed to import build artifacts from build system",
                json!({ "server": server.server, "path": server.remote_path, "error": e.to_string() }),
            )),
        }
    }
}

/// Removes the remote build directory. Shared by the final stage and the
/// emergency handler; only the first of them acts.
struct UnixCleanup {
    ctx: PlatformContext,
    removed: AtomicBool,
}

impl UnixCleanup {
    fn new(ctx: PlatformContext) -> Self {
        Self {
            ctx,
            removed: AtomicBool::new(false),
        }
    }

    async fn remove_remote(&self, job: &JobId, bag: &PropertyBag) {
        let Ok(server) = bag.get_as::<UnixBuildServer>("unix") else {
            return;
        };
        if self.removed.swap(true, Ordering::SeqCst) {
            debug!(job_id = %job, "Remote build directory already removed");
            return;
        }
        if has_traversal(&server.remote_path) || !server.remote_path.contains("hal9000-build-") {
            warn!(job_id = %job, path = %server.remote_path, "Refusing to remove remote directory");
            return;
        }

        let target = CommandTarget::Ssh {
            user: server.user.clone(),
            host: server.server.clone(),
            port: None,
            identity: identity(&self.ctx.wallet, &server.user, &server.server),
            cwd: None,
        };
        let command = format!("rm -rf {}", shell_quote(&server.remote_path));
        let result = self
            .ctx
            .executor
            .execute(&target, &command, &BTreeMap::new(), self.ctx.config.timeouts.command)
            .await
            .and_then(|output| output.into_result(&command));
        if let Err(e) = result {
            warn!(job_id = %job, server = %server.server, error = %e, "Failed to remove remote build directory");
        }
    }
}

#[async_trait]
impl Stage for UnixCleanup {
    fn name(&self) -> &str {
        "cleanup-remote"
    }

    fn kind(&self) -> StageKind {
        StageKind::Cleanup
    }

    async fn run(&self, job: &JobId, bag: &PropertyBag) -> Result<StageOutcome> {
        self.remove_remote(job, bag).await;
        Ok(StageOutcome::passed())
    }
}

#[async_trait]
impl EmergencyCleanup for UnixCleanup {
    async fn cleanup(&self, job: &JobId, bag: &PropertyBag) {
        self.remove_remote(job, bag).await;
    }
}
