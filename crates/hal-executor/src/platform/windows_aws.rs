//! Windows build platform on a cloud instance.
//!
//! The checkout travels through S3: it is packed and uploaded, then the
//! instance fetches and extracts it through SSM. Build output goes back the
//! same way. Nothing on the instance is reachable over SSH.

use async_trait::async_trait;
use hal_core::executor::{CommandExecutor, CommandTarget};
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
use uuid::Uuid;

use super::{BuildPlatform, BuildSystem, PlatformContext};
use crate::archive::ArchiveManager;
use crate::aws::AwsArg;
use crate::stages::{DecryptStage, RunCommandsStage, TargetFn, fail};
use crate::transfer::S3Transfer;

pub const CONFIGURE_FAILED: i32 = 200;
pub const EXPORT_FAILED: i32 = 201;
pub const DECRYPT_FAILED: i32 = 202;
pub const BUILD_FAILED: i32 = 203;
pub const IMPORT_FAILED: i32 = 204;
pub const CLEANUP_FAILED: i32 = 205;

/// The `windows` bag entry written by the configure stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowsBuilder {
    pub instance_id: String,
    pub bucket: String,
    pub remote_path: String,
    pub input_object: String,
    pub output_object: String,
}

impl WindowsBuilder {
    fn target(&self, cwd: Option<String>) -> CommandTarget {
        CommandTarget::Ssm {
            instance_id: self.instance_id.clone(),
            windows: true,
            cwd,
        }
    }

    fn object(&self, key: &str) -> RemoteLocation {
        RemoteLocation::S3 {
            bucket: self.bucket.clone(),
            key: key.to_string(),
        }
    }

    /// Fetch the input archive and extract it into the build directory.
    fn export_script(&self) -> String {
        let archive = format!("{}.tar.gz", self.remote_path);
        [
            format!("New-Item -ItemType Directory -Force -Path {} | Out-Null", ps_quote(&self.remote_path)),
            format!(
                "aws s3 cp {} {}",
                ps_quote(&format!("s3://{}/{}", self.bucket, self.input_object)),
                ps_quote(&archive)
            ),
            format!("tar -xzf {} -C {}", ps_quote(&archive), ps_quote(&self.remote_path)),
            format!("Remove-Item -Force {}", ps_quote(&archive)),
        ]
        .join("; ")
    }

    /// Archive the build directory and upload it as the output object.
    fn import_script(&self) -> String {
        let archive = format!("{}-output.tar.gz", self.remote_path);
        [
            format!("tar -czf {} -C {} .", ps_quote(&archive), ps_quote(&self.remote_path)),
            format!(
                "aws s3 cp {} {}",
                ps_quote(&archive),
                ps_quote(&format!("s3://{}/{}", self.bucket, self.output_object))
            ),
            format!("Remove-Item -Force {}", ps_quote(&archive)),
        ]
        .join("; ")
    }
}

/// Quote a string for PowerShell.
fn ps_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

pub fn platform(ctx: &PlatformContext) -> BuildPlatform {
    let cleanup = Arc::new(WindowsCleanup::new(ctx.clone()));

    let build_target: TargetFn = Arc::new(|bag: &PropertyBag| {
        let builder: WindowsBuilder = bag.get_as("windows")?;
        Ok(builder.target(Some(builder.remote_path.clone())))
    });
    let build_env = ctx
        .config
        .windows_aws
        .as_ref()
        .map(|w| w.env.clone())
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
        system: BuildSystem::WindowsAws,
        stages,
        emergency: Some(cleanup),
    }
}

struct ConfigureStage {
    ctx: PlatformContext,
}

#[async_trait]
impl Stage for ConfigureStage {
    fn name(&self) -> &str {
        "configure"
    }

    async fn run(&self, job: &JobId, _bag: &PropertyBag) -> Result<StageOutcome> {
        let Some(windows) = &self.ctx.config.windows_aws else {
            return Ok(fail(
                self.ctx.logger.as_ref(),
                CONFIGURE_FAILED,
                "Windows build platform is not configured correctly",
                json!({}),
            ));
        };
        if windows.instance_id.is_empty() || windows.bucket.is_empty() {
            return Ok(fail(
                self.ctx.logger.as_ref(),
                CONFIGURE_FAILED,
                "Windows build platform is not configured correctly",
                json!({ "instanceId": windows.instance_id, "bucket": windows.bucket }),
            ));
        }

        let unique = Uuid::new_v4().simple().to_string();
        let builder = WindowsBuilder {
            instance_id: windows.instance_id.clone(),
            bucket: windows.bucket.clone(),
            remote_path: format!("{}\\hal9000-build-{}", windows.path.trim_end_matches('\\'), job),
            input_object: format!("hal9000-build-{job}-{unique}-input.tar.gz"),
            output_object: format!("hal9000-build-{job}-{unique}-output.tar.gz"),
        };
        info!(job_id = %job, instance_id = %builder.instance_id, "Configured windows build instance");
        Ok(StageOutcome::with("windows", serde_json::to_value(builder)?))
    }
}

struct ExportStage {
    ctx: PlatformContext,
}

impl ExportStage {
    async fn export(&self, job: &JobId, bag: &PropertyBag, builder: &WindowsBuilder) -> Result<()> {
        let checkout = bag.get_path("location.path")?;
        let local = bag.workspace_path(&format!("hal9000-build-{job}-input.tar.gz"))?;

        let result = async {
            ArchiveManager::new().pack(&checkout, ".", &local).await?;
            S3Transfer::new(self.ctx.aws.clone())
                .push(&local, &builder.object(&builder.input_object), &[])
                .await
        }
        .await;
        if let Err(e) = tokio::fs::remove_file(&local).await {
            warn!(path = %local.display(), error = %e, "Failed to remove local input archive");
        }
        result?;

        let script = builder.export_script();
        self.ctx
            .executor
            .execute(&builder.target(None), &script, &BTreeMap::new(), self.ctx.config.timeouts.command)
            .await?
            .into_result(&script)?;
        Ok(())
    }
}

#[async_trait]
impl Stage for ExportStage {
    fn name(&self) -> &str {
        "export"
    }

    fn allocates_remote(&self) -> bool {
        true
    }

    async fn run(&self, job: &JobId, bag: &PropertyBag) -> Result<StageOutcome> {
        let builder: WindowsBuilder = bag.get_as("windows")?;
        match self.export(job, bag, &builder).await {
            Ok(()) => Ok(StageOutcome::passed()),
            Err(e) => Ok(fail(
                self.ctx.logger.as_ref(),
                EXPORT_FAILED,
                "Failed to export build to build system",
                json!({ "instanceId": builder.instance_id, "error": e.to_string() }),
            )),
        }
    }
}

struct ImportStage {
    ctx: PlatformContext,
}

impl ImportStage {
    async fn import(&self, job: &JobId, bag: &PropertyBag, builder: &WindowsBuilder) -> Result<()> {
        let script = builder.import_script();
        self.ctx
            .executor
            .execute(&builder.target(None), &script, &BTreeMap::new(), self.ctx.config.timeouts.command)
            .await?
            .into_result(&script)?;

        let checkout = bag.get_path("location.path")?;
        let local: PathBuf = bag.workspace_path(&format!("hal9000-build-{job}-output.tar.gz"))?;
        let result = async {
            S3Transfer::new(self.ctx.aws.clone())
                .pull(&builder.object(&builder.output_object), &local)
                .await?;
            ArchiveManager::new().unpack(&local, &checkout, false).await
        }
        .await;
        if local.exists()
            && let Err(e) = tokio::fs::remove_file(&local).await
        {
            warn!(path = %local.display(), error = %e, "Failed to remove local output archive");
        }
        result
    }
}

#[async_trait]
impl Stage for ImportStage {
    fn name(&self) -> &str {
        "import"
    }

    async fn run(&self, job: &JobId, bag: &PropertyBag) -> Result<StageOutcome> {
        let builder: WindowsBuilder = bag.get_as("windows")?;
        match self.import(job, bag, &builder).await {
            Ok(()) => Ok(StageOutcome::passed()),
            Err(e) => Ok(fail(
                self.ctx.logger.as_ref(),
                IMPORT_FAILED,
                "Failed to import build artifacts from build system",
                json!({ "instanceId": builder.instance_id, "error": e.to_string() }),
            )),
        }
    }
}

/// Removes the S3 objects and the build directory on the instance. Shared by
/// the final stage and the emergency handler; only the first of them acts.
struct WindowsCleanup {
    ctx: PlatformContext,
    removed: AtomicBool,
}

impl WindowsCleanup {
    fn new(ctx: PlatformContext) -> Self {
        Self {
            ctx,
            removed: AtomicBool::new(false),
        }
    }

    async fn remove(&self, builder: &WindowsBuilder) -> Vec<String> {
        let mut errors = Vec::new();
        if self.removed.swap(true, Ordering::SeqCst) {
            debug!(instance_id = %builder.instance_id, "Windows build already cleaned up");
            return errors;
        }

        for key in [&builder.input_object, &builder.output_object] {
            let uri = format!("s3://{}/{}", builder.bucket, key);
            // Removing a missing object succeeds.
            if let Err(e) = self.ctx.aws.call("s3", "rm", &[AwsArg::Positional(uri)]).await {
                errors.push(e.to_string());
            }
        }

        let script = format!(
            "if (Test-Path {path}) {{ Remove-Item -Recurse -Force {path} }}",
            path = ps_quote(&builder.remote_path)
        );
        let removed = self
            .ctx
            .executor
            .execute(&builder.target(None), &script, &BTreeMap::new(), self.ctx.config.timeouts.command)
            .await
            .and_then(|output| output.into_result(&script));
        if let Err(e) = removed {
            errors.push(e.to_string());
        }
        errors
    }
}

#[async_trait]
impl Stage for WindowsCleanup {
    fn name(&self) -> &str {
        "cleanup-remote"
    }

    fn kind(&self) -> StageKind {
        StageKind::Cleanup
    }

    async fn run(&self, _job: &JobId, bag: &PropertyBag) -> Result<StageOutcome> {
        let Ok(builder) = bag.get_as::<WindowsBuilder>("windows") else {
            return Ok(StageOutcome::passed());
        };
        let errors = self.remove(&builder).await;
        if errors.is_empty() {
            return Ok(StageOutcome::passed());
        }
        Ok(fail(
            self.ctx.logger.as_ref(),
            CLEANUP_FAILED,
            "Failed to clean up build system",
            json!({ "instanceId": builder.instance_id, "errors": errors }),
        ))
    }
}

#[async_trait]
impl EmergencyCleanup for WindowsCleanup {
    async fn cleanup(&self, job: &JobId, bag: &PropertyBag) {
        let Ok(builder) = bag.get_as::<WindowsBuilder>("windows") else {
            return;
        };
        for error in self.remove(&builder).await {
            warn!(job_id = %job, %error, "Emergency cleanup of windows build failed");
        }
    }
}
