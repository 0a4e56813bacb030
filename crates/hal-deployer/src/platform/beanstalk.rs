//! Elastic Beanstalk push: upload a bundle, register it as an application
//! version, point the environment at it and wait for the environment to come
//! back healthy.

use async_trait::async_trait;
use hal_core::health::{BeanstalkHealth, BeanstalkStatus};
use hal_core::stage::{Stage, StageOutcome};
use hal_core::transfer::RemoteLocation;
use hal_core::{JobId, PropertyBag, Result};
use hal_executor::ArchiveManager;
use hal_executor::stages::{PackStage, fail};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::debug;

use super::{LocationFn, Payload, PushContext, UploadStage, build_id, bundle_key, prepare};
use crate::beanstalk::BeanstalkHealthChecker;

pub const UNPACK_FAILED: i32 = 500;
pub const PACK_FAILED: i32 = 501;
pub const UPLOAD_FAILED: i32 = 502;
pub const VERSION_FAILED: i32 = 503;
pub const UPDATE_FAILED: i32 = 504;
pub const HEALTH_FAILED: i32 = 505;
pub const TRANSFORM_FAILED: i32 = 506;

#[derive(Debug, Deserialize)]
struct BeanstalkTarget {
    application: String,
    environment: String,
    bucket: String,
}

pub fn stages(ctx: &PushContext) -> Vec<Arc<dyn Stage>> {
    let location: LocationFn = Arc::new(|job: &JobId, bag: &PropertyBag| -> Result<RemoteLocation> {
        let target: BeanstalkTarget = bag.get_as("target")?;
        Ok(RemoteLocation::S3 {
            key: bundle_key(&target.application, bag, job)?,
            bucket: target.bucket,
        })
    });

    let mut stages = prepare(ctx, UNPACK_FAILED, TRANSFORM_FAILED);
    stages.push(Arc::new(
        PackStage::new(ArchiveManager::dereferencing(), ctx.logger.clone(), PACK_FAILED)
            .with_event("Pack deployment into archive"),
    ));
    stages.push(Arc::new(UploadStage::new(ctx, UPLOAD_FAILED, Payload::Package, location)));
    stages.push(Arc::new(VersionStage { ctx: ctx.clone() }));
    stages.push(Arc::new(UpdateStage { ctx: ctx.clone() }));
    stages.push(Arc::new(HealthStage { ctx: ctx.clone() }));
    stages
}

fn version_label(bag: &PropertyBag, job: &JobId) -> Result<String> {
    Ok(format!("hal9000-{}-{job}", build_id(bag)?))
}

struct VersionStage {
    ctx: PushContext,
}

#[async_trait]
impl Stage for VersionStage {
    fn name(&self) -> &str {
        "version"
    }

    async fn run(&self, job: &JobId, bag: &PropertyBag) -> Result<StageOutcome> {
        let target: BeanstalkTarget = bag.get_as("target")?;
        let RemoteLocation::S3 { bucket, key } = bag.get_as::<RemoteLocation>("upload")? else {
            return Ok(fail(
                self.ctx.logger.as_ref(),
                VERSION_FAILED,
                "Application bundle was not uploaded to S3",
                json!({}),
            ));
        };
        let label = version_label(bag, job)?;
        let description = format!("HAL9000 build {} push {job}", build_id(bag)?);

        match self
            .ctx
            .beanstalk
            .create_application_version(&target.application, &label, &bucket, &key, &description)
            .await
        {
            Ok(_) => {
                self.ctx.logger.success(
                    "Create application version",
                    json!({ "application": target.application, "version": label }),
                );
                Ok(StageOutcome::with("version", json!(label)))
            }
            Err(e) => Ok(fail(
                self.ctx.logger.as_ref(),
                VERSION_FAILED,
                "Unable to create application version",
                json!({ "application": target.application, "version": label, "error": e.to_string() }),
            )),
        }
    }
}

/// Deploys the new version to an environment that is ready to take it.
struct UpdateStage {
    ctx: PushContext,
}

#[async_trait]
impl Stage for UpdateStage {
    fn name(&self) -> &str {
        "deploy"
    }

    async fn run(&self, _job: &JobId, bag: &PropertyBag) -> Result<StageOutcome> {
        let target: BeanstalkTarget = bag.get_as("target")?;
        let label = bag.get_str("version")?;
        let logger = self.ctx.logger.as_ref();

        let health = BeanstalkHealthChecker::new(self.ctx.beanstalk.clone())
            .environment_health(&target.application, &target.environment)
            .await;
        let context = json!({
            "environment": target.environment,
            "status": health.status.as_str(),
            "health": health.health.as_str(),
        });
        if health.status == BeanstalkStatus::Missing {
            return Ok(fail(logger, UPDATE_FAILED, "Elastic Beanstalk environment not found", context));
        }
        if health.status != BeanstalkStatus::Ready {
            return Ok(fail(logger, UPDATE_FAILED, "Elastic Beanstalk environment is not ready", context));
        }

        match self
            .ctx
            .beanstalk
            .update_environment(&target.application, &target.environment, label)
            .await
        {
            Ok(_) => {
                logger.success(
                    "Update Elastic Beanstalk environment",
                    json!({ "environment": target.environment, "version": label }),
                );
                Ok(StageOutcome::passed())
            }
            Err(e) => Ok(fail(
                logger,
                UPDATE_FAILED,
                "Unable to update Elastic Beanstalk environment",
                json!({ "environment": target.environment, "error": e.to_string() }),
            )),
        }
    }
}

/// Polls the environment until it is Ready and Green.
struct HealthStage {
    ctx: PushContext,
}

#[async_trait]
impl Stage for HealthStage {
    fn name(&self) -> &str {
        "health"
    }

    async fn run(&self, job: &JobId, bag: &PropertyBag) -> Result<StageOutcome> {
        let target: BeanstalkTarget = bag.get_as("target")?;
        let checker = BeanstalkHealthChecker::new(self.ctx.beanstalk.clone());
        let timeouts = &self.ctx.config.timeouts;
        let logger = self.ctx.logger.as_ref();
        let deadline = Instant::now() + timeouts.push;

        loop {
            let health = checker
                .environment_health(&target.application, &target.environment)
                .await;
            debug!(job_id = %job, status = %health.status, health = %health.health, "Polled Elastic Beanstalk environment");
            let context = json!({
                "environment": target.environment,
                "status": health.status.as_str(),
                "health": health.health.as_str(),
            });

            if health.is_ready() {
                logger.success("Elastic Beanstalk environment is healthy", context);
                return Ok(StageOutcome::passed());
            }
            if matches!(
                health.status,
                BeanstalkStatus::Missing | BeanstalkStatus::Terminating | BeanstalkStatus::Terminated
            ) || (health.status == BeanstalkStatus::Ready && health.health == BeanstalkHealth::Red)
            {
                return Ok(fail(logger, HEALTH_FAILED, "Elastic Beanstalk environment is unhealthy", context));
            }
            if Instant::now() >= deadline {
                return Ok(fail(
                    logger,
                    HEALTH_FAILED,
                    "Elastic Beanstalk environment did not become healthy in time",
                    context,
                ));
            }
            tokio::time::sleep(timeouts.health_poll).await;
        }
    }
}
