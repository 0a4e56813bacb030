//! Job scheduling for the HAL agent.
//!
//! Resolves build and push records into property bags, runs stage pipelines
//! over them, and launches one runner process per waiting push.

pub mod emergency;
pub mod orchestrator;
pub mod queue;
pub mod resolver;
pub mod worker;

pub use emergency::EmergencyGuard;
pub use orchestrator::StagePipeline;
pub use queue::{FileJobStore, JobStore, MemoryJobStore};
pub use resolver::{BuildResolver, PushResolver};
pub use worker::{DeployWorker, JobOutcome, JobReport, frame_output};
