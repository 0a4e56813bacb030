//! Configuration parsing for the HAL deployment agent.
//!
//! This crate handles parsing of:
//! - Per-repository job configuration (`.hal9000.yml`)
//! - Agent system configuration (`hal.kdl`)

pub mod error;
pub mod job;
pub mod system;

pub use error::{ConfigError, ConfigResult};
pub use job::JobConfiguration;
pub use system::AgentConfig;
