//! `hal worker deploy`.

use anyhow::Result;
use hal_config::AgentConfig;
use hal_scheduler::{DeployWorker, FileJobStore, JobOutcome};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;

pub async fn deploy(config: Arc<AgentConfig>, config_path: Option<PathBuf>, json: bool) -> Result<()> {
    let store = Arc::new(FileJobStore::new(config.jobs.clone()));
    let reports = DeployWorker::new(store, &config, config_path).run().await?;

    if json {
        let summary: Vec<_> = reports
            .iter()
            .map(|r| {
                let outcome = match r.outcome {
                    JobOutcome::Success => "success",
                    JobOutcome::Failed(_) => "error",
                    JobOutcome::TimedOut => "timeout",
                };
                json!({ "push": r.push, "target": r.target, "outcome": outcome })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else if reports.is_empty() {
        println!("No pushes to deploy");
    } else {
        for report in &reports {
            let marker = match report.outcome {
                JobOutcome::Success => "✔",
                JobOutcome::Failed(_) => "✖",
                JobOutcome::TimedOut => "❗",
            };
            println!("{marker} push {} to {}", report.push, report.target);
        }
    }
    Ok(())
}
