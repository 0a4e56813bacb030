//! Job event stream.
//!
//! Events are what a job reports to its users (stage failures, archive sizes,
//! status changes). They are distinct from diagnostic logging, which goes
//! through `tracing` directly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Mutex;
use tracing::{error, info};

use crate::{JobId, job::JobStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Info,
    Success,
    Failure,
}

/// One recorded job event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub timestamp: DateTime<Utc>,
    pub level: EventLevel,
    pub message: String,
    pub context: Value,
}

/// Sink for job events, injected into every stage that reports progress.
pub trait EventLogger: Send + Sync {
    fn event(&self, level: EventLevel, message: &str, context: Value);

    /// Store a named statistic (archive size, download size) for the job.
    fn keep(&self, key: &str, data: Value);

    /// Signal a job status change to whoever owns the job record.
    fn status(&self, job: &JobId, status: JobStatus);

    fn success(&self, message: &str, context: Value) {
        self.event(EventLevel::Success, message, context);
    }

    fn failure(&self, message: &str, context: Value) {
        self.event(EventLevel::Failure, message, context);
    }
}

/// Forwards events to `tracing`.
#[derive(Debug, Default)]
pub struct TracingEventLogger;

impl EventLogger for TracingEventLogger {
    fn event(&self, level: EventLevel, message: &str, context: Value) {
        match level {
            EventLevel::Failure => error!(%context, "{message}"),
            EventLevel::Success | EventLevel::Info => info!(?level, %context, "{message}"),
        }
    }

    fn keep(&self, key: &str, data: Value) {
        info!(key, %data, "Recorded job statistic");
    }

    fn status(&self, job: &JobId, status: JobStatus) {
        info!(job_id = %job, %status, "Job status changed");
    }
}

/// Records events in memory, optionally forwarding them to another logger.
///
/// Used by the CLI for the end-of-job summary, and by tests.
#[derive(Default)]
pub struct MemoryEventLogger {
    events: Mutex<Vec<JobEvent>>,
    kept: Mutex<Map<String, Value>>,
    statuses: Mutex<Vec<(JobId, JobStatus)>>,
    forward: Option<Box<dyn EventLogger>>,
}

impl MemoryEventLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn forwarding(inner: impl EventLogger + 'static) -> Self {
        Self {
            forward: Some(Box::new(inner)),
            ..Self::default()
        }
    }

    pub fn events(&self) -> Vec<JobEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn kept(&self) -> Map<String, Value> {
        self.kept.lock().map(|k| k.clone()).unwrap_or_default()
    }

    pub fn statuses(&self) -> Vec<(JobId, JobStatus)> {
        self.statuses.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn failures(&self) -> Vec<JobEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.level == EventLevel::Failure)
            .collect()
    }
}

impl EventLogger for MemoryEventLogger {
    fn event(&self, level: EventLevel, message: &str, context: Value) {
        if let Ok(mut events) = self.events.lock() {
            events.push(JobEvent {
                timestamp: Utc::now(),
                level,
                message: message.to_string(),
                context: context.clone(),
            });
        }
        if let Some(inner) = &self.forward {
            inner.event(level, message, context);
        }
    }

    fn keep(&self, key: &str, data: Value) {
        if let Ok(mut kept) = self.kept.lock() {
            match (kept.get_mut(key), &data) {
                (Some(Value::Object(existing)), Value::Object(new)) => {
                    existing.extend(new.clone());
                }
                _ => {
                    kept.insert(key.to_string(), data.clone());
                }
            }
        }
        if let Some(inner) = &self.forward {
            inner.keep(key, data);
        }
    }

    fn status(&self, job: &JobId, status: JobStatus) {
        if let Ok(mut statuses) = self.statuses.lock() {
            statuses.push((job.clone(), status));
        }
        if let Some(inner) = &self.forward {
            inner.status(job, status);
        }
    }
}
