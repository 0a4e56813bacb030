//! Stage pipeline - runs a platform's stages in order for one job.

use futures::FutureExt;
use hal_core::event::EventLogger;
use hal_core::job::JobStatus;
use hal_core::stage::{EmergencyCleanup, ExitStatus, Stage, StageKind, StageOutcome};
use hal_core::{JobId, PropertyBag};
use serde_json::json;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::emergency::EmergencyGuard;

/// A fixed, ordered list of stages.
///
/// After the first failure only cleanup stages run. Stages may only add
/// properties; a stage returning a key that is already set is fatal.
pub struct StagePipeline {
    stages: Vec<Arc<dyn Stage>>,
    logger: Arc<dyn EventLogger>,
    emergency: Option<Arc<dyn EmergencyCleanup>>,
    running: JobStatus,
}

impl StagePipeline {
    pub fn new(stages: Vec<Arc<dyn Stage>>, logger: Arc<dyn EventLogger>) -> Self {
        Self {
            stages,
            logger,
            emergency: None,
            running: JobStatus::Building,
        }
    }

    /// Handler armed before the first stage that allocates remote resources.
    pub fn with_emergency(mut self, handler: Option<Arc<dyn EmergencyCleanup>>) -> Self {
        self.emergency = handler;
        self
    }

    /// Status reported while the pipeline runs.
    pub fn running_as(mut self, status: JobStatus) -> Self {
        self.running = status;
        self
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub async fn run(&self, job: &JobId, mut bag: PropertyBag) -> ExitStatus {
        self.logger.status(job, self.running);
        let mut guard: Option<EmergencyGuard> = None;
        let mut exit: Option<ExitStatus> = None;

        for stage in &self.stages {
            let name = stage.name();
            if exit.is_some() && stage.kind() != StageKind::Cleanup {
                debug!(job_id = %job, stage = %name, "Skipping stage after failure");
                continue;
            }

            if exit.is_none()
                && guard.is_none()
                && stage.allocates_remote()
                && let Some(handler) = &self.emergency
            {
                guard = Some(EmergencyGuard::arm(handler.clone(), job, &bag));
            }

            info!(job_id = %job, stage = %name, "Running stage");
            let result = AssertUnwindSafe(stage.run(job, &bag)).catch_unwind().await;

            let status = match result {
                Ok(Ok(StageOutcome::Passed(props))) => match bag.merge(props) {
                    Ok(()) => {
                        if let Some(guard) = guard.as_mut() {
                            guard.refresh(&bag);
                        }
                        continue;
                    }
                    Err(e) => ExitStatus::FatalError {
                        stage: name.to_string(),
                        message: e.to_string(),
                    },
                },
                Ok(Ok(StageOutcome::Failed(failure))) => {
                    error!(job_id = %job, stage = %name, code = failure.code, "{}", failure.message);
                    self.logger.failure(
                        &format!("Stage {name} failed"),
                        json!({ "stage": name, "code": failure.code, "message": failure.message }),
                    );
                    ExitStatus::StageFailure {
                        stage: name.to_string(),
                        code: failure.code,
                    }
                }
                Ok(Err(e)) => ExitStatus::FatalError {
                    stage: name.to_string(),
                    message: e.to_string(),
                },
                Err(panic) => ExitStatus::FatalError {
                    stage: name.to_string(),
                    message: panic_message(panic.as_ref()),
                },
            };

            if let ExitStatus::FatalError { message, .. } = &status {
                error!(job_id = %job, stage = %name, error = %message, "Fatal error");
                self.logger.failure(
                    &format!("Stage {name} failed"),
                    json!({ "stage": name, "error": message }),
                );
            }

            if exit.is_some() {
                warn!(job_id = %job, stage = %name, "Cleanup stage failed after an earlier failure");
                continue;
            }
            if let Some(guard) = &guard {
                guard.fire().await;
            }
            exit = Some(status);
        }

        if let Some(guard) = &guard {
            guard.disarm();
        }

        let exit = exit.unwrap_or(ExitStatus::Success);
        let final_status = if exit.is_success() {
            JobStatus::Success
        } else {
            JobStatus::Error
        };
        info!(job_id = %job, status = %final_status, code = exit.code(), "Pipeline finished");
        self.logger.status(job, final_status);
        exit
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panic: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panic: {s}")
    } else {
        "panic".to_string()
    }
}
