//! Core domain types and traits for the HAL deployment agent.
//!
//! This crate contains:
//! - Job identifiers and build/push records
//! - The property bag threaded through pipeline stages
//! - Stage, executor, transfer and event-logger traits
//! - Canonical health states for remote deployment services
//! - Credential lookup and encrypted property resolution

pub mod credential;
pub mod error;
pub mod event;
pub mod executor;
pub mod health;
pub mod id;
pub mod job;
pub mod paths;
pub mod property;
pub mod secret;
pub mod stage;
pub mod transfer;

pub use error::{Error, Result};
pub use id::JobId;
pub use property::PropertyBag;
