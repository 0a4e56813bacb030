//! Push platforms.
//!
//! Every push starts from the persisted build archive: unpack it, read the
//! job configuration, run the build transform commands in the checkout, then
//! hand over to the method-specific stages.

use async_trait::async_trait;
use hal_config::AgentConfig;
use hal_core::credential::CredentialWallet;
use hal_core::event::EventLogger;
use hal_core::executor::CommandExecutor;
use hal_core::job::{Target, TargetKind};
use hal_core::stage::{Stage, StageOutcome};
use hal_core::transfer::{FileTransfer, RemoteLocation};
use hal_core::{JobId, PropertyBag, Result};
use hal_executor::AwsCli;
use hal_executor::download::GithubDownloader;
use hal_executor::stages::{ReadConfigurationStage, RunCommandsStage, UnpackStage, fail, job_configuration, local_checkout};
use hal_executor::transfer::S3Transfer;
use serde_json::json;
use std::sync::Arc;

use crate::api::{CodeDeployApi, CommitApi, ElasticBeanstalkApi};

pub mod beanstalk;
pub mod codedeploy;
pub mod rsync;
pub mod s3;

/// Capabilities shared by every push platform's stages.
#[derive(Clone)]
pub struct PushContext {
    pub config: Arc<AgentConfig>,
    pub executor: Arc<dyn CommandExecutor>,
    pub logger: Arc<dyn EventLogger>,
    pub wallet: Arc<CredentialWallet>,
    /// Object storage used for uploads.
    pub storage: Arc<dyn FileTransfer>,
    pub codedeploy: Arc<dyn CodeDeployApi>,
    pub beanstalk: Arc<dyn ElasticBeanstalkApi>,
    /// Source host used to describe what changed since the last push.
    pub commits: Arc<dyn CommitApi>,
}

impl PushContext {
    /// Context backed by the `aws` command line tool.
    pub fn with_aws(
        config: Arc<AgentConfig>,
        executor: Arc<dyn CommandExecutor>,
        logger: Arc<dyn EventLogger>,
        aws: AwsCli,
    ) -> Self {
        Self {
            wallet: Arc::new(config.wallet()),
            commits: Arc::new(GithubDownloader::new(config.github_api.clone(), config.github_token.clone())),
            config,
            executor,
            logger,
            storage: Arc::new(S3Transfer::new(aws.clone())),
            codedeploy: Arc::new(aws.clone()),
            beanstalk: Arc::new(aws),
        }
    }
}

pub struct PushPlatform {
    pub method: &'static str,
    pub stages: Vec<Arc<dyn Stage>>,
}

pub fn push_platform(target: &Target, ctx: &PushContext) -> PushPlatform {
    let stages = match &target.kind {
        TargetKind::Rsync { .. } => rsync::stages(ctx),
        TargetKind::S3 { archive, .. } => s3::stages(ctx, *archive),
        TargetKind::ElasticBeanstalk { .. } => beanstalk::stages(ctx),
        TargetKind::CodeDeploy { .. } => codedeploy::stages(ctx),
    };
    PushPlatform {
        method: target.kind.method(),
        stages,
    }
}

/// Unpack, configuration and build transform stages.
fn prepare(ctx: &PushContext, unpack_code: i32, transform_code: i32) -> Vec<Arc<dyn Stage>> {
    vec![
        Arc::new(UnpackStage::build_archive(ctx.logger.clone(), unpack_code)),
        Arc::new(ReadConfigurationStage::new(ctx.logger.clone())),
        Arc::new(
            RunCommandsStage::new(
                "build_transform",
                ctx.executor.clone(),
                ctx.logger.clone(),
                local_checkout(),
                "build_transform",
                transform_code,
            )
            .with_timeout(ctx.config.timeouts.build)
            .with_message("Build transform command failed"),
        ),
    ]
}

/// Id of the build being pushed.
pub(crate) fn build_id(bag: &PropertyBag) -> Result<&str> {
    bag.get_str("pushProperties.id")
}

/// Object key for a deployment bundle uploaded on behalf of `application`.
pub(crate) fn bundle_key(application: &str, bag: &PropertyBag, job: &JobId) -> Result<String> {
    Ok(format!("{application}/hal9000-{}-{job}.tar.gz", build_id(bag)?))
}

pub(crate) type LocationFn = Arc<dyn Fn(&JobId, &PropertyBag) -> Result<RemoteLocation> + Send + Sync>;

/// What an [`UploadStage`] sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Payload {
    /// The archive written by the pack stage.
    Package,
    /// The checkout tree, minus configured excludes.
    Checkout,
}

/// Sends the payload to object storage and records where it went as `upload`.
pub(crate) struct UploadStage {
    ctx: PushContext,
    code: i32,
    payload: Payload,
    location: LocationFn,
}

impl UploadStage {
    pub(crate) fn new(ctx: &PushContext, code: i32, payload: Payload, location: LocationFn) -> Self {
        Self {
            ctx: ctx.clone(),
            code,
            payload,
            location,
        }
    }
}

#[async_trait]
impl Stage for UploadStage {
    fn name(&self) -> &str {
        "upload"
    }

    async fn run(&self, job: &JobId, bag: &PropertyBag) -> Result<StageOutcome> {
        let remote = (self.location)(job, bag)?;
        let (local, excludes) = match self.payload {
            Payload::Package => (bag.get_path("location.tempArchive")?, Vec::new()),
            Payload::Checkout => (bag.get_path("location.path")?, job_configuration(bag)?.exclude),
        };

        match self.ctx.storage.push(&local, &remote, &excludes).await {
            Ok(()) => {
                self.ctx
                    .logger
                    .success("Upload to S3", json!({ "location": remote.uri() }));
                Ok(StageOutcome::with("upload", serde_json::to_value(&remote)?))
            }
            Err(e) => Ok(fail(
                self.ctx.logger.as_ref(),
                self.code,
                "Unable to upload deployment to S3",
                json!({ "location": remote.uri(), "error": e.to_string() }),
            )),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Fakes shared by the platform tests.

    use super::*;
    use crate::api::DeploymentRequest;
    use hal_core::Error;
    use hal_core::event::MemoryEventLogger;
    use hal_core::executor::{CommandOutput, CommandTarget};
    use serde_json::Value;
    use std::collections::{BTreeMap, VecDeque};
    use std::path::Path;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    pub struct RecordingExecutor {
        pub commands: Mutex<Vec<(CommandTarget, String)>>,
        /// Exit codes handed out in order; 0 once exhausted.
        pub exit_codes: Mutex<VecDeque<i32>>,
        pub stdout: String,
    }

    #[async_trait]
    impl CommandExecutor for RecordingExecutor {
        async fn execute(
            &self,
            target: &CommandTarget,
            command: &str,
            _env: &BTreeMap<String, String>,
            _timeout: Duration,
        ) -> Result<CommandOutput> {
            self.commands.lock().unwrap().push((target.clone(), command.to_string()));
            let code = self.exit_codes.lock().unwrap().pop_front().unwrap_or(0);
            Ok(CommandOutput {
                exit_code: Some(code),
                stdout: self.stdout.clone(),
                ..Default::default()
            })
        }
    }

    #[derive(Default)]
    pub struct RecordingStorage {
        pub pushed: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl FileTransfer for RecordingStorage {
        async fn push(&self, local: &Path, remote: &RemoteLocation, _excludes: &[String]) -> Result<()> {
            self.pushed
                .lock()
                .unwrap()
                .push((local.display().to_string(), remote.uri()));
            Ok(())
        }

        async fn pull(&self, _remote: &RemoteLocation, _local: &Path) -> Result<()> {
            Ok(())
        }
    }

    /// Provider fake replaying canned responses.
    #[derive(Default)]
    pub struct FakeAws {
        pub deployments: Mutex<VecDeque<Value>>,
        /// Number of `get_deployment` calls that fail before answers are replayed.
        pub deployment_errors: Mutex<usize>,
        pub environments: Mutex<VecDeque<Value>>,
        pub calls: Mutex<Vec<String>>,
    }

    impl FakeAws {
        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    fn next(queue: &Mutex<VecDeque<Value>>) -> Value {
        let mut queue = queue.lock().unwrap();
        if queue.len() > 1 {
            queue.pop_front().unwrap_or_default()
        } else {
            queue.front().cloned().unwrap_or_default()
        }
    }

    #[async_trait]
    impl CodeDeployApi for FakeAws {
        async fn list_deployments(&self, _application: &str, _group: &str) -> Result<Value> {
            Ok(json!({"deployments": []}))
        }

        async fn get_deployment(&self, id: &str) -> Result<Value> {
            self.record(format!("get-deployment {id}"));
            {
                let mut errors = self.deployment_errors.lock().unwrap();
                if *errors > 0 {
                    *errors -= 1;
                    return Err(Error::Provider("throttled".to_string()));
                }
            }
            Ok(next(&self.deployments))
        }

        async fn list_deployment_instances(&self, _id: &str) -> Result<Value> {
            Ok(json!({"instancesList": []}))
        }

        async fn batch_get_deployment_instances(&self, _id: &str, _ids: &[String]) -> Result<Value> {
            Ok(Value::Null)
        }

        async fn create_deployment(&self, request: &DeploymentRequest) -> Result<Value> {
            self.record(format!("create-deployment s3://{}/{}", request.bucket, request.key));
            Ok(json!({"deploymentId": "d-TEST"}))
        }
    }

    #[async_trait]
    impl ElasticBeanstalkApi for FakeAws {
        async fn describe_environments(&self, _application: &str, environment: &str) -> Result<Value> {
            self.record(format!("describe-environments {environment}"));
            Ok(next(&self.environments))
        }

        async fn create_application_version(
            &self,
            application: &str,
            label: &str,
            bucket: &str,
            key: &str,
            _description: &str,
        ) -> Result<Value> {
            self.record(format!("create-application-version {application} {label} s3://{bucket}/{key}"));
            Ok(Value::Null)
        }

        async fn update_environment(&self, _application: &str, environment: &str, label: &str) -> Result<Value> {
            self.record(format!("update-environment {environment} {label}"));
            Ok(Value::Null)
        }
    }

    /// Commit comparisons answered from a canned document.
    #[derive(Default)]
    pub struct FakeCommits {
        pub comparison: Option<Value>,
        pub compared: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CommitApi for FakeCommits {
        async fn compare(&self, user: &str, repo: &str, base: &str, head: &str) -> Result<Value> {
            self.compared
                .lock()
                .unwrap()
                .push(format!("{user}/{repo} {base}...{head}"));
            self.comparison
                .clone()
                .ok_or_else(|| Error::Provider("Not Found".to_string()))
        }
    }

    pub struct Harness {
        pub ctx: PushContext,
        pub executor: Arc<RecordingExecutor>,
        pub storage: Arc<RecordingStorage>,
        pub aws: Arc<FakeAws>,
        pub commits: Arc<FakeCommits>,
        pub logger: Arc<MemoryEventLogger>,
    }

    pub fn harness(executor: RecordingExecutor, aws: FakeAws) -> Harness {
        harness_with_commits(executor, aws, FakeCommits::default())
    }

    pub fn harness_with_commits(executor: RecordingExecutor, aws: FakeAws, commits: FakeCommits) -> Harness {
        let commits = Arc::new(commits);
        let executor = Arc::new(executor);
        let storage = Arc::new(RecordingStorage::default());
        let aws = Arc::new(aws);
        let logger = Arc::new(MemoryEventLogger::new());
        let mut config = AgentConfig {
            ssh_user: "sshuser".to_string(),
            ..AgentConfig::default()
        };
        config.timeouts.health_poll = Duration::from_millis(1);
        config.timeouts.push = Duration::from_secs(5);

        let ctx = PushContext {
            wallet: Arc::new(config.wallet()),
            config: Arc::new(config),
            executor: executor.clone(),
            logger: logger.clone(),
            storage: storage.clone(),
            codedeploy: aws.clone(),
            beanstalk: aws.clone(),
            commits: commits.clone(),
        };
        Harness {
            ctx,
            executor,
            storage,
            aws,
            commits,
            logger,
        }
    }

    /// A bag shaped like the push resolver's output.
    pub fn push_bag(target: Value) -> PropertyBag {
        let mut bag = PropertyBag::new("/tmp/hal").unwrap();
        bag.insert(
            "location",
            json!({
                "path": "/tmp/hal/hal9000-push-1234",
                "archive": "/archive/hal9000-5678.tar.gz",
                "tempArchive": "/tmp/hal/hal9000-1234.tar.gz",
            }),
        )
        .unwrap();
        bag.insert("pushProperties", json!({ "id": "5678" })).unwrap();
        bag.insert("target", target).unwrap();
        bag
    }
}
