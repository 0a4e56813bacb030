//! Single-job runners: `hal runner build` and `hal runner deploy`.

use anyhow::{Context, Result};
use hal_config::AgentConfig;
use hal_core::event::{EventLevel, EventLogger, MemoryEventLogger, TracingEventLogger};
use hal_core::job::JobStatus;
use hal_core::secret::StaticDecrypter;
use hal_core::stage::{ExitStatus, Stage};
use hal_core::JobId;
use hal_deployer::{PushContext, push_platform};
use hal_executor::download::GithubDownloader;
use hal_executor::platform::{BuildSystem, PlatformContext, build_platform};
use hal_executor::stages::{CleanupStage, DownloadStage, PACK_FAILED, PackStage, ReadConfigurationStage, UnpackStage};
use hal_executor::ArchiveManager;
use hal_scheduler::{BuildResolver, FileJobStore, JobStore, PushResolver, StagePipeline};
use serde_json::json;
use std::sync::Arc;
use tracing::info;

use super::{aws, executor};

fn store(config: &AgentConfig) -> Arc<dyn JobStore> {
    Arc::new(FileJobStore::new(config.jobs.clone()))
}

fn finished(status: &ExitStatus) -> JobStatus {
    if status.is_success() {
        JobStatus::Success
    } else {
        JobStatus::Error
    }
}

fn print_summary(job: &JobId, status: &ExitStatus, logger: &MemoryEventLogger, json: bool) -> Result<()> {
    if json {
        let summary = json!({
            "job": job,
            "exit": status,
            "code": status.code(),
            "events": logger.events(),
            "kept": logger.kept(),
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    for event in logger.events() {
        let marker = match event.level {
            EventLevel::Info => " ",
            EventLevel::Success => "✓",
            EventLevel::Failure => "✗",
        };
        println!("{marker} {}", event.message);
    }
    match status {
        ExitStatus::Success => println!("\n✓ Job {job} succeeded"),
        ExitStatus::StageFailure { stage, code } => {
            println!("\n✗ Job {job} failed in stage '{stage}' (code {code})")
        }
        ExitStatus::FatalError { stage, message } => {
            println!("\n✗ Job {job} aborted in stage '{stage}': {message}")
        }
    }
    Ok(())
}

pub async fn build(config: Arc<AgentConfig>, id: &str, json: bool) -> Result<i32> {
    let id = JobId::new(id);
    let store = store(&config);
    let (build, bag) = BuildResolver::new(store.clone(), config.clone())
        .resolve(&id)
        .await
        .with_context(|| format!("Failed to resolve build {id}"))?;

    let system = match build.platform.as_deref() {
        Some(name) => name.parse::<BuildSystem>()?,
        None => BuildSystem::Unix,
    };

    let logger = Arc::new(MemoryEventLogger::forwarding(TracingEventLogger));
    let events: Arc<dyn EventLogger> = logger.clone();
    let ctx = PlatformContext {
        config: config.clone(),
        executor: executor(&config),
        logger: events.clone(),
        decrypter: Arc::new(StaticDecrypter::new(config.secrets.clone())),
        aws: aws(&config),
        wallet: Arc::new(config.wallet()),
    };
    let platform = build_platform(system, &ctx);

    let downloader = GithubDownloader::new(config.github_api.clone(), config.github_token.clone());
    let mut stages: Vec<Arc<dyn Stage>> = vec![
        Arc::new(DownloadStage::new(downloader, events.clone())),
        Arc::new(UnpackStage::source(events.clone())),
        Arc::new(ReadConfigurationStage::new(events.clone()).for_system(system.config_name())),
    ];
    stages.extend(platform.stages);
    stages.push(Arc::new(PackStage::new(ArchiveManager::new(), events.clone(), PACK_FAILED).persisted()));
    stages.push(Arc::new(CleanupStage));

    let pipeline = StagePipeline::new(stages, events)
        .with_emergency(platform.emergency)
        .running_as(JobStatus::Building);
    info!(job_id = %id, system = system.config_name(), stages = ?pipeline.stage_names(), "Starting build");

    store.set_build_status(&id, JobStatus::Building).await?;
    let status = pipeline.run(&id, bag).await;
    store.set_build_status(&id, finished(&status)).await?;

    print_summary(&id, &status, &logger, json)?;
    Ok(status.code())
}

pub async fn deploy(config: Arc<AgentConfig>, id: &str, json: bool) -> Result<i32> {
    let id = JobId::new(id);
    let store = store(&config);
    let (push, bag) = PushResolver::new(store.clone(), config.clone())
        .resolve(&id)
        .await
        .with_context(|| format!("Failed to resolve push {id}"))?;
    let target = push
        .target
        .as_ref()
        .with_context(|| format!("Push {id} has no deployment target"))?;

    let logger = Arc::new(MemoryEventLogger::forwarding(TracingEventLogger));
    let events: Arc<dyn EventLogger> = logger.clone();
    let ctx = PushContext::with_aws(config.clone(), executor(&config), events.clone(), aws(&config));
    let platform = push_platform(target, &ctx);

    let mut stages = platform.stages;
    stages.push(Arc::new(CleanupStage));

    let pipeline = StagePipeline::new(stages, events).running_as(JobStatus::Pushing);
    info!(job_id = %id, target = %target.id, method = platform.method, stages = ?pipeline.stage_names(), "Starting push");

    store.set_push_status(&id, JobStatus::Pushing).await?;
    let status = pipeline.run(&id, bag).await;
    store.set_push_status(&id, finished(&status)).await?;

    print_summary(&id, &status, &logger, json)?;
    Ok(status.code())
}
