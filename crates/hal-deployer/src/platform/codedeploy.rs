//! CodeDeploy push: upload a bundle, start a deployment of it and poll the
//! deployment until it reaches a terminal state.

use async_trait::async_trait;
use hal_core::health::CodeDeployStatus;
use hal_core::stage::{Stage, StageOutcome};
use hal_core::transfer::RemoteLocation;
use hal_core::{JobId, PropertyBag, Result};
use hal_executor::ArchiveManager;
use hal_executor::aws::query_str;
use hal_executor::stages::{PackStage, fail};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{LocationFn, Payload, PushContext, UploadStage, build_id, bundle_key, prepare};
use crate::api::DeploymentRequest;
use crate::codedeploy::CodeDeployHealthChecker;

pub const UNPACK_FAILED: i32 = 600;
pub const PACK_FAILED: i32 = 601;
pub const UPLOAD_FAILED: i32 = 602;
pub const DEPLOY_FAILED: i32 = 603;
pub const HEALTH_FAILED: i32 = 604;
pub const TRANSFORM_FAILED: i32 = 605;

#[derive(Debug, Deserialize)]
struct CodeDeployTarget {
    application: String,
    group: String,
    bucket: String,
    #[serde(default)]
    configuration: Option<String>,
}

pub fn stages(ctx: &PushContext) -> Vec<Arc<dyn Stage>> {
    let location: LocationFn = Arc::new(|job: &JobId, bag: &PropertyBag| -> Result<RemoteLocation> {
        let target: CodeDeployTarget = bag.get_as("target")?;
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
    stages.push(Arc::new(DeployStage { ctx: ctx.clone() }));
    stages.push(Arc::new(PollStage { ctx: ctx.clone() }));
    stages
}

struct DeployStage {
    ctx: PushContext,
}

#[async_trait]
impl Stage for DeployStage {
    fn name(&self) -> &str {
        "deploy"
    }

    async fn run(&self, job: &JobId, bag: &PropertyBag) -> Result<StageOutcome> {
        let target: CodeDeployTarget = bag.get_as("target")?;
        let logger = self.ctx.logger.as_ref();
        let RemoteLocation::S3 { bucket, key } = bag.get_as::<RemoteLocation>("upload")? else {
            return Ok(fail(
                logger,
                DEPLOY_FAILED,
                "Application bundle was not uploaded to S3",
                json!({}),
            ));
        };

        let request = DeploymentRequest {
            description: format!("HAL9000 build {} push {job}", build_id(bag)?),
            application: target.application,
            group: target.group,
            bucket,
            key,
            configuration: target.configuration,
        };
        let context = json!({
            "application": request.application,
            "group": request.group,
            "bundle": format!("s3://{}/{}", request.bucket, request.key),
        });

        let response = match self.ctx.codedeploy.create_deployment(&request).await {
            Ok(response) => response,
            Err(e) => {
                let mut context = context;
                context["error"] = json!(e.to_string());
                return Ok(fail(logger, DEPLOY_FAILED, "Unable to create CodeDeploy deployment", context));
            }
        };
        let Some(id) = query_str(&response, "$.deploymentId")? else {
            return Ok(fail(logger, DEPLOY_FAILED, "Unable to create CodeDeploy deployment", context));
        };

        info!(job_id = %job, deployment = %id, "Started CodeDeploy deployment");
        let mut context = context;
        context["deploymentId"] = json!(id);
        logger.success("Create CodeDeploy deployment", context);
        Ok(StageOutcome::with("deployment", json!(id)))
    }
}

/// Polls the deployment until it is terminal or the push timeout passes.
struct PollStage {
    ctx: PushContext,
}

#[async_trait]
impl Stage for PollStage {
    fn name(&self) -> &str {
        "health"
    }

    async fn run(&self, job: &JobId, bag: &PropertyBag) -> Result<StageOutcome> {
        let id = bag.get_str("deployment")?;
        let checker =
            CodeDeployHealthChecker::new(self.ctx.codedeploy.clone()).with_utc_offset(self.ctx.config.utc_offset);
        let timeouts = &self.ctx.config.timeouts;
        let logger = self.ctx.logger.as_ref();
        let deadline = Instant::now() + timeouts.push;

        loop {
            let health = checker.deployment_health(id).await;
            debug!(job_id = %job, deployment = id, status = %health.status, "Polled CodeDeploy deployment");
            if health.status == CodeDeployStatus::Invalid {
                warn!(job_id = %job, deployment = id, "CodeDeploy status unavailable, retrying");
            }

            if health.status.is_terminal() {
                if health.status.is_success() {
                    logger.success(
                        "CodeDeploy deployment succeeded",
                        json!({ "deploymentId": id, "overview": health.overview }),
                    );
                    return Ok(StageOutcome::passed());
                }

                let detail = checker.deployment_instances_health(id).await;
                let instances = detail.instances.as_ref();
                return Ok(fail(
                    logger,
                    HEALTH_FAILED,
                    "CodeDeploy deployment failed",
                    json!({
                        "deploymentId": id,
                        "status": detail.status.as_str(),
                        "overview": detail.overview,
                        "error": detail.error,
                        "instances": instances.map(|i| i.summary.as_str()),
                        "detailed": instances.map(|i| i.detailed.as_str()),
                    }),
                ));
            }

            if Instant::now() >= deadline {
                return Ok(fail(
                    logger,
                    HEALTH_FAILED,
                    "CodeDeploy deployment took too long",
                    json!({ "deploymentId": id, "status": health.status.as_str(), "overview": health.overview }),
                ));
            }
            tokio::time::sleep(timeouts.health_poll).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    fn bag(with_deployment: bool) -> PropertyBag {
        let mut bag = push_bag(json!({
            "id": "t3",
            "type": "code_deploy",
            "application": "app",
            "group": "blue",
            "bucket": "bundles",
        }));
        bag.insert(
            "upload",
            json!({"type": "s3", "bucket": "bundles", "key": "app/hal9000-5678-1234.tar.gz"}),
        )
        .unwrap();
        if with_deployment {
            bag.insert("deployment", "d-TEST").unwrap();
        }
        bag
    }

    fn deployments(statuses: &[&str]) -> FakeAws {
        let queue: VecDeque<_> = statuses
            .iter()
            .map(|s| json!({"deploymentInfo": {"status": s}}))
            .collect();
        FakeAws {
            deployments: Mutex::new(queue),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_deploy_records_deployment_id() {
        let h = harness(RecordingExecutor::default(), FakeAws::default());
        let outcome = DeployStage { ctx: h.ctx.clone() }
            .run(&JobId::from("1234"), &bag(false))
            .await
            .unwrap();
        let StageOutcome::Passed(props) = outcome else {
            panic!("expected pass");
        };
        assert_eq!(props["deployment"], "d-TEST");
        assert_eq!(
            h.aws.calls.lock().unwrap()[0],
            "create-deployment s3://bundles/app/hal9000-5678-1234.tar.gz"
        );
    }

    #[tokio::test]
    async fn test_poll_until_succeeded() {
        let h = harness(
            RecordingExecutor::default(),
            deployments(&["Created", "InProgress", "Succeeded"]),
        );
        let outcome = PollStage { ctx: h.ctx.clone() }
            .run(&JobId::from("1234"), &bag(true))
            .await
            .unwrap();
        assert!(outcome.is_passed());
        assert_eq!(h.aws.calls.lock().unwrap().len(), 3);
        assert_eq!(h.logger.events()[0].message, "CodeDeploy deployment succeeded");
    }

    #[tokio::test]
    async fn test_poll_survives_provider_error() {
        let aws = deployments(&["Succeeded"]);
        *aws.deployment_errors.lock().unwrap() = 1;
        let h = harness(RecordingExecutor::default(), aws);
        let outcome = PollStage { ctx: h.ctx.clone() }
            .run(&JobId::from("1234"), &bag(true))
            .await
            .unwrap();
        assert!(outcome.is_passed());
        assert_eq!(h.aws.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_poll_reports_failure() {
        let h = harness(RecordingExecutor::default(), deployments(&["InProgress", "Failed"]));
        let outcome = PollStage { ctx: h.ctx.clone() }
            .run(&JobId::from("1234"), &bag(true))
            .await
            .unwrap();
        let StageOutcome::Failed(failure) = outcome else {
            panic!("expected failure");
        };
        assert_eq!(failure.code, HEALTH_FAILED);
        assert_eq!(failure.context["status"], "Failed");
    }

    #[tokio::test]
    async fn test_poll_times_out() {
        let mut h = harness(RecordingExecutor::default(), deployments(&["InProgress"]));
        let mut config = (*h.ctx.config).clone();
        config.timeouts.push = std::time::Duration::from_millis(20);
        h.ctx.config = Arc::new(config);

        let outcome = PollStage { ctx: h.ctx.clone() }
            .run(&JobId::from("1234"), &bag(true))
            .await
            .unwrap();
        assert!(matches!(outcome, StageOutcome::Failed(ref f) if f.message == "CodeDeploy deployment took too long"));
    }
}
