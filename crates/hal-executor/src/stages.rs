//! Stages shared by build and push pipelines.
//!
//! Bag keys read and written here:
//!
//! | key | written by |
//! |-----|------------|
//! | `github.user`, `github.repo`, `github.reference` | build resolver |
//! | `location.download`, `location.path`, `location.archive`, `location.tempArchive` | resolvers |
//! | `environmentVariables`, `encrypted`, `artifacts`, `configuration` | resolvers |
//! | `jobConfiguration` | [`ReadConfigurationStage`] |
//! | `decrypted` | [`DecryptStage`] |
//! | `package` | [`PackStage`] |

use async_trait::async_trait;
use hal_config::JobConfiguration;
use hal_core::event::EventLogger;
use hal_core::executor::{CommandExecutor, CommandTarget};
use hal_core::secret::{PropertyDecrypter, merge_into_env};
use hal_core::stage::{Stage, StageFailure, StageKind, StageOutcome};
use hal_core::{Error, JobId, PropertyBag, Result};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::archive::{ArchiveManager, format_megabytes};
use crate::download::GithubDownloader;

pub const DOWNLOAD_FAILED: i32 = 10;
pub const UNPACK_FAILED: i32 = 11;
pub const CONFIGURATION_FAILED: i32 = 12;
pub const PACK_FAILED: i32 = 13;

pub const JOB_CONFIGURATION: &str = "jobConfiguration";

/// The configuration read from the checkout, falling back to the one
/// derived from the repository record.
pub fn job_configuration(bag: &PropertyBag) -> Result<JobConfiguration> {
    if bag.contains(JOB_CONFIGURATION) {
        bag.get_as(JOB_CONFIGURATION)
    } else if bag.contains("configuration") {
        bag.get_as("configuration")
    } else {
        Ok(JobConfiguration::default())
    }
}

/// Environment from `env_key` with decrypted properties merged in.
pub fn job_environment(bag: &PropertyBag, env_key: &str) -> Result<BTreeMap<String, String>> {
    let env = bag.get_string_map(env_key)?;
    let decrypted = bag.get_string_map("decrypted")?;
    Ok(merge_into_env(&env, &decrypted))
}

/// Record a failure event and build the matching outcome.
pub fn fail(logger: &dyn EventLogger, code: i32, message: &str, context: serde_json::Value) -> StageOutcome {
    logger.failure(message, context.clone());
    StageOutcome::Failed(StageFailure::new(code, message).with_context(context))
}

/// Resolves the command target from the bag at run time.
pub type TargetFn = Arc<dyn Fn(&PropertyBag) -> Result<CommandTarget> + Send + Sync>;

/// Runs commands in the local checkout.
pub fn local_checkout() -> TargetFn {
    Arc::new(|bag: &PropertyBag| Ok(CommandTarget::local_in(bag.get_path("location.path")?)))
}

pub struct DownloadStage {
    downloader: GithubDownloader,
    logger: Arc<dyn EventLogger>,
}

impl DownloadStage {
    pub fn new(downloader: GithubDownloader, logger: Arc<dyn EventLogger>) -> Self {
        Self { downloader, logger }
    }
}

#[async_trait]
impl Stage for DownloadStage {
    fn name(&self) -> &str {
        "download"
    }

    async fn run(&self, _job: &JobId, bag: &PropertyBag) -> Result<StageOutcome> {
        let user = bag.get_str("github.user")?;
        let repo = bag.get_str("github.repo")?;
        let reference = bag.get_str("github.reference")?;
        let target = bag.get_path("location.download")?;

        match self.downloader.download(user, repo, reference, &target).await {
            Ok(size) => {
                self.logger.keep("filesize", json!({ "download": size }));
                self.logger
                    .success("Download GitHub archive", json!({ "size": format_megabytes(size) }));
                Ok(StageOutcome::passed())
            }
            Err(e) => {
                let context = json!({
                    "repository": format!("{user}/{repo}"),
                    "reference": reference,
                    "target": target.display().to_string(),
                    "error": e.to_string(),
                });
                Ok(fail(
                    self.logger.as_ref(),
                    DOWNLOAD_FAILED,
                    "GitHub archive download failed",
                    context,
                ))
            }
        }
    }
}

/// Extracts an archive from the bag into `location.path`.
pub struct UnpackStage {
    archives: ArchiveManager,
    logger: Arc<dyn EventLogger>,
    code: i32,
    source_key: &'static str,
    strip_top_level: bool,
}

impl UnpackStage {
    /// Unpack the downloaded GitHub tarball.
    pub fn source(logger: Arc<dyn EventLogger>) -> Self {
        Self {
            archives: ArchiveManager::new(),
            logger,
            code: UNPACK_FAILED,
            source_key: "location.download",
            strip_top_level: true,
        }
    }

    /// Unpack a stored build archive.
    pub fn build_archive(logger: Arc<dyn EventLogger>, code: i32) -> Self {
        Self {
            archives: ArchiveManager::new(),
            logger,
            code,
            source_key: "location.archive",
            strip_top_level: false,
        }
    }
}

#[async_trait]
impl Stage for UnpackStage {
    fn name(&self) -> &str {
        "unpack"
    }

    async fn run(&self, _job: &JobId, bag: &PropertyBag) -> Result<StageOutcome> {
        let archive = bag.get_str(self.source_key)?;
        let target = bag.get_path("location.path")?;

        if !Path::new(archive).is_file() {
            return Ok(fail(
                self.logger.as_ref(),
                self.code,
                "Archive not found",
                json!({ "archive": archive }),
            ));
        }

        match self
            .archives
            .unpack(Path::new(archive), &target, self.strip_top_level)
            .await
        {
            Ok(()) => Ok(StageOutcome::passed()),
            Err(e) => Ok(fail(
                self.logger.as_ref(),
                self.code,
                "Unable to unpack archive",
                json!({ "archive": archive, "error": e.to_string() }),
            )),
        }
    }
}

/// Overlays `.hal9000.yml` from the checkout on the repository configuration.
pub struct ReadConfigurationStage {
    logger: Arc<dyn EventLogger>,
    /// Build system the pipeline was assembled for.
    system: Option<String>,
}

impl ReadConfigurationStage {
    pub fn new(logger: Arc<dyn EventLogger>) -> Self {
        Self {
            logger,
            system: None,
        }
    }

    /// Fail when the repository asks for a different build system.
    pub fn for_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    fn failed(&self, message: &str, context: serde_json::Value) -> StageOutcome {
        fail(self.logger.as_ref(), CONFIGURATION_FAILED, message, context)
    }
}

#[async_trait]
impl Stage for ReadConfigurationStage {
    fn name(&self) -> &str {
        "configuration"
    }

    async fn run(&self, _job: &JobId, bag: &PropertyBag) -> Result<StageOutcome> {
        let checkout = bag.get_path("location.path")?;
        let mut config = job_configuration(bag)?;
        let file = checkout.join(hal_config::job::CONFIG_FILE);

        if file.is_file() {
            let bytes = tokio::fs::read(&file).await?;
            let Ok(text) = String::from_utf8(bytes) else {
                return Ok(self.failed(
                    "Configuration file is not valid UTF-8",
                    json!({ "file": hal_config::job::CONFIG_FILE }),
                ));
            };
            if let Err(e) = config.apply_yaml(&text) {
                return Ok(self.failed(&e.to_string(), json!({ "file": hal_config::job::CONFIG_FILE })));
            }
            self.logger
                .success("Found .hal9000.yml configuration", serde_json::to_value(&config)?);
        } else {
            debug!(path = %checkout.display(), "Using repository configuration");
        }

        if let Some(expected) = &self.system
            && config.system != "global"
            && &config.system != expected
        {
            return Ok(self.failed(
                "Build system does not match this platform",
                json!({ "requested": config.system, "platform": expected }),
            ));
        }

        Ok(StageOutcome::with(JOB_CONFIGURATION, serde_json::to_value(&config)?))
    }
}

/// Resolves `encrypted` properties through the decrypter.
pub struct DecryptStage {
    decrypter: Arc<dyn PropertyDecrypter>,
    logger: Arc<dyn EventLogger>,
    code: i32,
}

impl DecryptStage {
    pub fn new(decrypter: Arc<dyn PropertyDecrypter>, logger: Arc<dyn EventLogger>, code: i32) -> Self {
        Self {
            decrypter,
            logger,
            code,
        }
    }
}

#[async_trait]
impl Stage for DecryptStage {
    fn name(&self) -> &str {
        "decrypt"
    }

    async fn run(&self, _job: &JobId, bag: &PropertyBag) -> Result<StageOutcome> {
        let encrypted = bag.get_string_map("encrypted")?;
        let decrypted = self.decrypter.decrypt(&encrypted);

        if decrypted.len() != encrypted.len() {
            let err = Error::Decryption {
                expected: encrypted.len(),
                actual: decrypted.len(),
            };
            let message = "An error occured while decrypting encrypted configuration";
            let missing: Vec<&String> = encrypted.keys().filter(|k| !decrypted.contains_key(*k)).collect();
            return Ok(fail(
                self.logger.as_ref(),
                self.code,
                message,
                json!({ "error": err.to_string(), "properties": missing }),
            ));
        }

        if !decrypted.is_empty() {
            info!(count = decrypted.len(), "Decrypted properties");
        }
        Ok(StageOutcome::with("decrypted", serde_json::to_value(decrypted)?))
    }
}

/// Runs one command list from the job configuration.
pub struct RunCommandsStage {
    name: String,
    executor: Arc<dyn CommandExecutor>,
    logger: Arc<dyn EventLogger>,
    target: TargetFn,
    commands: &'static str,
    env_key: &'static str,
    extra_env: BTreeMap<String, String>,
    timeout: Duration,
    code: i32,
    message: String,
}

impl RunCommandsStage {
    pub fn new(
        name: impl Into<String>,
        executor: Arc<dyn CommandExecutor>,
        logger: Arc<dyn EventLogger>,
        target: TargetFn,
        commands: &'static str,
        code: i32,
    ) -> Self {
        let name = name.into();
        Self {
            message: format!("{name} command failed"),
            name,
            executor,
            logger,
            target,
            commands,
            env_key: "environmentVariables",
            extra_env: BTreeMap::new(),
            timeout: Duration::from_secs(300),
            code,
        }
    }

    pub fn with_env_key(mut self, key: &'static str) -> Self {
        self.env_key = key;
        self
    }

    /// Variables added on top of the job environment.
    pub fn with_extra_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.extra_env = env;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}

#[async_trait]
impl Stage for RunCommandsStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, job: &JobId, bag: &PropertyBag) -> Result<StageOutcome> {
        let config = job_configuration(bag)?;
        let commands = config.commands(self.commands).unwrap_or_default();
        if commands.is_empty() {
            debug!(job_id = %job, stage = %self.name, "No commands to run");
            return Ok(StageOutcome::passed());
        }

        let target = (self.target)(bag)?;
        let mut env = self.extra_env.clone();
        env.extend(job_environment(bag, self.env_key)?);

        for command in commands {
            info!(job_id = %job, stage = %self.name, target = %target.describe(), "Running command");
            let output = self.executor.execute(&target, command, &env, self.timeout).await?;
            let context = json!({
                "command": command,
                "exitCode": output.exit_code,
                "timedOut": output.timed_out,
                "output": output.combined(),
            });

            if !output.is_success() {
                return Ok(fail(self.logger.as_ref(), self.code, &self.message, context));
            }
            self.logger.success(&format!("Run {} command", self.name), context);
        }

        Ok(StageOutcome::passed())
    }
}

/// Archives the configured dist directory of the checkout.
pub struct PackStage {
    archives: ArchiveManager,
    logger: Arc<dyn EventLogger>,
    code: i32,
    /// Also copy the archive to `location.archive`.
    persist: bool,
    event: &'static str,
}

impl PackStage {
    pub fn new(archives: ArchiveManager, logger: Arc<dyn EventLogger>, code: i32) -> Self {
        Self {
            archives,
            logger,
            code,
            persist: false,
            event: "Archive build",
        }
    }

    pub fn persisted(mut self) -> Self {
        self.persist = true;
        self
    }

    /// Message of the success event.
    pub fn with_event(mut self, event: &'static str) -> Self {
        self.event = event;
        self
    }

    fn failed(&self, message: &str, context: serde_json::Value) -> StageOutcome {
        fail(self.logger.as_ref(), self.code, message, context)
    }
}

#[async_trait]
impl Stage for PackStage {
    fn name(&self) -> &str {
        "pack"
    }

    async fn run(&self, _job: &JobId, bag: &PropertyBag) -> Result<StageOutcome> {
        let checkout = bag.get_path("location.path")?;
        let target = bag.get_path("location.tempArchive")?;
        let config = job_configuration(bag)?;

        let summary = match self.archives.pack(&checkout, &config.dist, &target).await {
            Ok(summary) => summary,
            Err(Error::Traversal { path }) => {
                return Ok(self.failed(
                    "Invalid distribution directory specified",
                    json!({ "path": path }),
                ));
            }
            Err(Error::NotFound(_)) => {
                return Ok(self.failed(
                    "Distribution directory not found",
                    json!({ "path": config.dist }),
                ));
            }
            Err(e) => {
                return Ok(self.failed("Unable to pack build archive", json!({ "error": e.to_string() })));
            }
        };

        self.logger.keep("filesize", json!({ "archive": summary.size }));
        self.logger.success(self.event, json!({ "size": summary.size_mb() }));

        if self.persist {
            let stored = bag.get_str("location.archive")?;
            if let Some(parent) = Path::new(stored).parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            if let Err(e) = tokio::fs::copy(&target, stored).await {
                return Ok(self.failed(
                    "Unable to move build archive to permanent storage",
                    json!({ "archive": stored, "error": e.to_string() }),
                ));
            }
        }

        Ok(StageOutcome::with("package", serde_json::to_value(summary)?))
    }
}

/// Removes every local path listed in `artifacts`.
#[derive(Default)]
pub struct CleanupStage;

#[async_trait]
impl Stage for CleanupStage {
    fn name(&self) -> &str {
        "cleanup"
    }

    fn kind(&self) -> StageKind {
        StageKind::Cleanup
    }

    async fn run(&self, job: &JobId, bag: &PropertyBag) -> Result<StageOutcome> {
        for artifact in bag.get_string_list("artifacts")? {
            let path = match bag.ensure_within(Path::new(&artifact)) {
                Ok(path) => path,
                Err(e) => {
                    warn!(job_id = %job, artifact, error = %e, "Refusing to remove artifact");
                    continue;
                }
            };
            let result = if path.is_dir() {
                tokio::fs::remove_dir_all(&path).await
            } else if path.exists() {
                tokio::fs::remove_file(&path).await
            } else {
                Ok(())
            };
            if let Err(e) = result {
                warn!(job_id = %job, path = %path.display(), error = %e, "Failed to remove artifact");
            }
        }
        Ok(StageOutcome::passed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hal_core::event::MemoryEventLogger;
    use hal_core::executor::CommandOutput;
    use hal_core::secret::StaticDecrypter;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct MockExecutor {
        fail_on: Option<&'static str>,
        runs: Mutex<Vec<(String, BTreeMap<String, String>)>>,
    }

    impl MockExecutor {
        fn new(fail_on: Option<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                fail_on,
                runs: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl CommandExecutor for MockExecutor {
        async fn execute(
            &self,
            _target: &CommandTarget,
            command: &str,
            env: &BTreeMap<String, String>,
            _timeout: Duration,
        ) -> Result<CommandOutput> {
            self.runs.lock().unwrap().push((command.to_string(), env.clone()));
            let failed = self.fail_on == Some(command);
            Ok(CommandOutput {
                exit_code: Some(if failed { 2 } else { 0 }),
                stdout: format!("ran {command}"),
                ..Default::default()
            })
        }
    }

    fn bag(dir: &TempDir) -> PropertyBag {
        let base = dir.path();
        let mut bag = PropertyBag::new(base).unwrap();
        bag.insert(
            "location",
            json!({
                "path": base.join("hal9000-build-1").display().to_string(),
                "archive": base.join("archive/hal9000-1.tar.gz").display().to_string(),
                "tempArchive": base.join("hal9000-1.tar.gz").display().to_string(),
            }),
        )
        .unwrap();
        bag.insert("environmentVariables", json!({ "HAL_BUILDID": "1" })).unwrap();
        std::fs::create_dir_all(base.join("hal9000-build-1")).unwrap();
        bag
    }

    fn logger() -> Arc<MemoryEventLogger> {
        Arc::new(MemoryEventLogger::new())
    }

    #[tokio::test]
    async fn test_read_configuration_overlays_yaml() {
        let dir = TempDir::new().unwrap();
        let mut bag = bag(&dir);
        let repo_config = JobConfiguration {
            build: vec!["make".to_string()],
            ..JobConfiguration::default()
        };
        bag.insert("configuration", &repo_config).unwrap();
        std::fs::write(
            dir.path().join("hal9000-build-1/.hal9000.yml"),
            "system: unix\nbuild: [\"npm install\", \"npm test\"]\n",
        )
        .unwrap();

        let events = logger();
        let outcome = ReadConfigurationStage::new(events.clone())
            .for_system("unix")
            .run(&JobId::from("1"), &bag)
            .await
            .unwrap();
        let StageOutcome::Passed(props) = outcome else {
            panic!("expected pass");
        };
        bag.merge(props).unwrap();
        let config = job_configuration(&bag).unwrap();
        assert_eq!(config.build, vec!["npm install", "npm test"]);
        assert_eq!(events.events()[0].message, "Found .hal9000.yml configuration");
    }

    #[tokio::test]
    async fn test_read_configuration_rejects_other_system() {
        let dir = TempDir::new().unwrap();
        let bag = bag(&dir);
        std::fs::write(dir.path().join("hal9000-build-1/.hal9000.yml"), "system: windows\n").unwrap();
        let outcome = ReadConfigurationStage::new(logger())
            .for_system("unix")
            .run(&JobId::from("1"), &bag)
            .await
            .unwrap();
        assert!(matches!(outcome, StageOutcome::Failed(f) if f.code == CONFIGURATION_FAILED));
    }

    #[tokio::test]
    async fn test_read_configuration_rejects_invalid_utf8() {
        let dir = TempDir::new().unwrap();
        let bag = bag(&dir);
        std::fs::write(dir.path().join("hal9000-build-1/.hal9000.yml"), b"build: [\"\xff\xfe\"]\n").unwrap();
        let events = logger();
        let outcome = ReadConfigurationStage::new(events.clone())
            .run(&JobId::from("1"), &bag)
            .await
            .unwrap();
        assert!(matches!(outcome, StageOutcome::Failed(ref f) if f.code == CONFIGURATION_FAILED));
        assert_eq!(events.failures()[0].message, "Configuration file is not valid UTF-8");
    }

    #[tokio::test]
    async fn test_decrypt_count_mismatch() {
        let dir = TempDir::new().unwrap();
        let mut bag = bag(&dir);
        bag.insert("encrypted", json!({ "db": "db-password", "api": "api-key" })).unwrap();
        let decrypter = Arc::new(StaticDecrypter::new(HashMap::from([(
            "db-password".to_string(),
            "hunter2".to_string(),
        )])));
        let events = logger();

        let outcome = DecryptStage::new(decrypter, events.clone(), 102)
            .run(&JobId::from("1"), &bag)
            .await
            .unwrap();
        match outcome {
            StageOutcome::Failed(failure) => {
                assert_eq!(failure.code, 102);
                assert_eq!(failure.context["properties"], json!(["api"]));
            }
            StageOutcome::Passed(_) => panic!("expected failure"),
        }
        assert_eq!(events.failures().len(), 1);
    }

    #[tokio::test]
    async fn test_commands_get_decrypted_env_and_stop_on_failure() {
        let dir = TempDir::new().unwrap();
        let mut bag = bag(&dir);
        bag.insert(
            JOB_CONFIGURATION,
            JobConfiguration {
                build: vec!["make".to_string(), "make test".to_string(), "make dist".to_string()],
                ..JobConfiguration::default()
            },
        )
        .unwrap();
        bag.insert("decrypted", json!({ "db": "hunter2" })).unwrap();

        let executor = MockExecutor::new(Some("make test"));
        let stage = RunCommandsStage::new("build", executor.clone(), logger(), local_checkout(), "build", 103)
            .with_extra_env(BTreeMap::from([("NODE_ENV".to_string(), "production".to_string())]));
        let outcome = stage.run(&JobId::from("1"), &bag).await.unwrap();

        assert!(matches!(outcome, StageOutcome::Failed(ref f) if f.code == 103));
        let runs = executor.runs.lock().unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].1["ENCRYPTED_DB"], "hunter2");
        assert_eq!(runs[0].1["HAL_BUILDID"], "1");
        assert_eq!(runs[0].1["NODE_ENV"], "production");
    }

    #[tokio::test]
    async fn test_empty_command_list_passes() {
        let dir = TempDir::new().unwrap();
        let bag = bag(&dir);
        let executor = MockExecutor::new(None);
        let outcome = RunCommandsStage::new("pre_push", executor.clone(), logger(), local_checkout(), "pre_push", 303)
            .run(&JobId::from("1"), &bag)
            .await
            .unwrap();
        assert!(outcome.is_passed());
        assert!(executor.runs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pack_reports_missing_dist() {
        let dir = TempDir::new().unwrap();
        let mut bag = bag(&dir);
        bag.insert(
            JOB_CONFIGURATION,
            JobConfiguration {
                dist: "public".to_string(),
                ..JobConfiguration::default()
            },
        )
        .unwrap();
        let events = logger();
        let outcome = PackStage::new(ArchiveManager::new(), events.clone(), PACK_FAILED)
            .run(&JobId::from("1"), &bag)
            .await
            .unwrap();
        assert!(!outcome.is_passed());
        assert_eq!(events.failures()[0].message, "Distribution directory not found");
    }

    #[tokio::test]
    async fn test_pack_persists_archive() {
        let dir = TempDir::new().unwrap();
        let bag = bag(&dir);
        std::fs::write(dir.path().join("hal9000-build-1/index.html"), "hi").unwrap();
        let events = logger();
        let outcome = PackStage::new(ArchiveManager::new(), events.clone(), PACK_FAILED)
            .persisted()
            .run(&JobId::from("1"), &bag)
            .await
            .unwrap();
        assert!(outcome.is_passed());
        assert!(dir.path().join("archive/hal9000-1.tar.gz").is_file());
        assert!(events.kept()["filesize"]["archive"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_cleanup_removes_artifacts_inside_workspace() {
        let dir = TempDir::new().unwrap();
        let mut bag = bag(&dir);
        let outside = TempDir::new().unwrap();
        std::fs::write(dir.path().join("hal9000-1.tar.gz"), "x").unwrap();
        bag.insert(
            "artifacts",
            json!([
                dir.path().join("hal9000-1.tar.gz").display().to_string(),
                dir.path().join("hal9000-build-1").display().to_string(),
                outside.path().display().to_string(),
            ]),
        )
        .unwrap();

        let outcome = CleanupStage.run(&JobId::from("1"), &bag).await.unwrap();
        assert!(outcome.is_passed());
        assert!(!dir.path().join("hal9000-1.tar.gz").exists());
        assert!(!dir.path().join("hal9000-build-1").exists());
        assert!(outside.path().exists());
    }
}
