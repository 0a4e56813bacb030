//! Deploy worker: launches one runner process per waiting push.

use crate::queue::JobStore;
use hal_config::AgentConfig;
use hal_core::job::{JobStatus, Push};
use hal_core::{JobId, Result};
use std::collections::HashSet;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{error, info, warn};

const FRAME_WIDTH: usize = 116;
const OUTPUT_GRACE: Duration = Duration::from_secs(5);

/// How a spawned job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Success,
    Failed(Option<i32>),
    TimedOut,
}

impl JobOutcome {
    fn header(&self) -> &'static str {
        match self {
            JobOutcome::Success => "✔ success",
            JobOutcome::Failed(_) => "✖ error",
            JobOutcome::TimedOut => "❗ timed out",
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobReport {
    pub push: JobId,
    pub target: String,
    pub outcome: JobOutcome,
    pub output: String,
}

/// Render child output inside a bookended box.
pub fn frame_output(title: &str, outcome: JobOutcome, output: &str) -> String {
    let border = format!("+{}+", "-".repeat(FRAME_WIDTH + 2));
    let mut lines = vec![border.clone()];
    lines.push(format!("| {:<FRAME_WIDTH$} |", format!("{title} finished: {}", outcome.header())));
    lines.push(border.clone());
    for line in output.lines() {
        lines.push(format!("| {line:<FRAME_WIDTH$} |"));
    }
    lines.push(border);
    lines.join("\n")
}

/// Targets that already had a job launched during this invocation.
#[derive(Debug, Default)]
struct SeenTargets(HashSet<String>);

impl SeenTargets {
    /// Returns false if the target was already claimed.
    fn claim(&mut self, target: &str) -> bool {
        self.0.insert(target.to_string())
    }
}

struct RunningJob {
    push: JobId,
    target: String,
    child: Child,
    started: Instant,
    output: JoinHandle<String>,
}

async fn read_all<R: AsyncRead + Unpin>(stream: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut stream) = stream {
        let _ = stream.read_to_end(&mut buf).await;
    }
    buf
}

fn collect(stdout: Option<ChildStdout>, stderr: Option<ChildStderr>) -> JoinHandle<String> {
    tokio::spawn(async move {
        let (out, err) = tokio::join!(read_all(stdout), read_all(stderr));
        let mut text = String::from_utf8_lossy(&out).into_owned();
        text.push_str(&String::from_utf8_lossy(&err));
        text
    })
}

pub struct DeployWorker {
    store: Arc<dyn JobStore>,
    interval: Duration,
    timeout: Duration,
    program: String,
    args: Vec<String>,
}

impl DeployWorker {
    pub fn new(store: Arc<dyn JobStore>, config: &AgentConfig, config_path: Option<PathBuf>) -> Self {
        let mut args = Vec::new();
        if let Some(path) = config_path {
            args.push("--config".to_string());
            args.push(path.display().to_string());
        }
        args.extend(["runner".to_string(), "deploy".to_string()]);
        Self {
            store,
            interval: config.worker.interval,
            timeout: config.worker.timeout,
            program: config.worker.program.clone(),
            args,
        }
    }

    /// Replace the spawned command. The push id is appended as the last argument.
    pub fn with_command(mut self, program: impl Into<String>, args: Vec<String>) -> Self {
        self.program = program.into();
        self.args = args;
        self
    }

    pub fn with_timing(mut self, interval: Duration, timeout: Duration) -> Self {
        self.interval = interval;
        self.timeout = timeout;
        self
    }

    /// Launch every eligible waiting push and wait for all of them.
    pub async fn run(&self) -> Result<Vec<JobReport>> {
        let waiting = self.store.waiting_pushes().await?;
        info!(count = waiting.len(), "Found waiting pushes");

        let mut seen = SeenTargets::default();
        let mut running = Vec::new();
        for push in waiting {
            if let Some(job) = self.launch(push, &mut seen).await? {
                running.push(job);
            }
        }

        let mut reports = Vec::new();
        while !running.is_empty() {
            sleep(self.interval).await;
            let mut still_running = Vec::new();
            for mut job in running {
                match self.check(&mut job).await {
                    Some(outcome) => reports.push(self.finish(job, outcome).await),
                    None => still_running.push(job),
                }
            }
            running = still_running;
        }
        Ok(reports)
    }

    async fn launch(&self, push: Push, seen: &mut SeenTargets) -> Result<Option<RunningJob>> {
        let Some(target) = push.target.as_ref().map(|t| t.id.clone()) else {
            warn!(push_id = %push.id, "Push has no deployment target");
            self.store.set_push_status(&push.id, JobStatus::Error).await?;
            return Ok(None);
        };
        if !seen.claim(&target) {
            info!(push_id = %push.id, %target, "Skipping push, target already has a job this run");
            return Ok(None);
        }

        let spawned = Command::new(&self.program)
            .args(&self.args)
            .arg(push.id.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                error!(push_id = %push.id, program = %self.program, error = %e, "Failed to spawn deployment");
                return Ok(None);
            }
        };

        info!(push_id = %push.id, %target, "Launched deployment");
        let output = collect(child.stdout.take(), child.stderr.take());
        Ok(Some(RunningJob {
            push: push.id,
            target,
            child,
            started: Instant::now(),
            output,
        }))
    }

    async fn check(&self, job: &mut RunningJob) -> Option<JobOutcome> {
        match job.child.try_wait() {
            Ok(Some(status)) if status.success() => Some(JobOutcome::Success),
            Ok(Some(status)) => Some(JobOutcome::Failed(status.code())),
            Ok(None) if job.started.elapsed() >= self.timeout => {
                if let Err(e) = job.child.kill().await {
                    warn!(push_id = %job.push, error = %e, "Failed to kill timed out deployment");
                }
                Some(JobOutcome::TimedOut)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(push_id = %job.push, error = %e, "Failed to check deployment status");
                Some(JobOutcome::Failed(None))
            }
        }
    }

    async fn finish(&self, job: RunningJob, outcome: JobOutcome) -> JobReport {
        // Grandchildren of a killed job may still hold the pipes open.
        let output = match tokio::time::timeout(OUTPUT_GRACE, job.output).await {
            Ok(Ok(output)) => output,
            _ => String::new(),
        };
        let title = format!("Push {} to {}", job.push, job.target);
        let framed = frame_output(&title, outcome, &output);
        match outcome {
            JobOutcome::Success => info!("Deployment Success: {}\n{framed}", job.push),
            JobOutcome::Failed(_) => error!("Deployment Failed: {}\n{framed}", job.push),
            JobOutcome::TimedOut => error!("Deployment Timeout: {}\n{framed}", job.push),
        }
        JobReport {
            push: job.push,
            target: job.target,
            outcome,
            output,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryJobStore;
    use crate::queue::fixtures::{push, rsync_target};

    fn worker(store: Arc<MemoryJobStore>, script: &str) -> DeployWorker {
        DeployWorker::new(store, &AgentConfig::default(), None)
            .with_command("sh", vec!["-c".to_string(), script.to_string(), "hal".to_string()])
            .with_timing(Duration::from_millis(10), Duration::from_secs(5))
    }

    #[test]
    fn test_frame_output() {
        let framed = frame_output("Push 1", JobOutcome::Success, "line one\nline two");
        let lines: Vec<&str> = framed.lines().collect();
        assert_eq!(lines.len(), 6);
        assert_eq!(lines[0], format!("+{}+", "-".repeat(118)));
        assert!(lines[1].starts_with("| Push 1 finished: ✔ success "));
        assert!(lines[3].starts_with("| line one "));
        assert!(lines[3].ends_with(" |"));
        assert_eq!(lines[3].len(), 120);
    }

    #[test]
    fn test_seen_targets() {
        let mut seen = SeenTargets::default();
        assert!(seen.claim("t1"));
        assert!(!seen.claim("t1"));
        assert!(seen.claim("t2"));
    }

    #[tokio::test]
    async fn test_launches_one_job_per_target() {
        let store = Arc::new(MemoryJobStore::new());
        store.add_push(push("1", JobStatus::Waiting, Some(rsync_target("t1"))));
        store.add_push(push("2", JobStatus::Waiting, Some(rsync_target("t1"))));
        store.add_push(push("3", JobStatus::Waiting, Some(rsync_target("t2"))));

        let mut reports = worker(store, "echo deploying $1").run().await.unwrap();
        reports.sort_by(|a, b| a.push.cmp(&b.push));

        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].push, JobId::from("1"));
        assert_eq!(reports[0].outcome, JobOutcome::Success);
        assert_eq!(reports[0].output.trim(), "deploying 1");
        assert_eq!(reports[1].push, JobId::from("3"));
    }

    #[tokio::test]
    async fn test_push_without_target_marked_error() {
        let store = Arc::new(MemoryJobStore::new());
        store.add_push(push("1", JobStatus::Waiting, None));

        let reports = worker(store.clone(), "exit 0").run().await.unwrap();
        assert!(reports.is_empty());
        let updated = store.push(&JobId::from("1")).await.unwrap().unwrap();
        assert_eq!(updated.status, JobStatus::Error);
    }

    #[tokio::test]
    async fn test_failed_job() {
        let store = Arc::new(MemoryJobStore::new());
        store.add_push(push("1", JobStatus::Waiting, Some(rsync_target("t1"))));

        let reports = worker(store, "echo broken >&2; exit 3").run().await.unwrap();
        assert_eq!(reports[0].outcome, JobOutcome::Failed(Some(3)));
        assert_eq!(reports[0].output.trim(), "broken");
    }

    #[tokio::test]
    async fn test_timed_out_job_is_killed() {
        let store = Arc::new(MemoryJobStore::new());
        store.add_push(push("1", JobStatus::Waiting, Some(rsync_target("t1"))));

        let started = Instant::now();
        let reports = worker(store, "exec sleep 30")
            .with_timing(Duration::from_millis(10), Duration::from_millis(100))
            .run()
            .await
            .unwrap();
        assert_eq!(reports[0].outcome, JobOutcome::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
