//! Job execution backends for the HAL agent.
//!
//! Provides:
//! - Command execution on the local host, over SSH and through SSM
//! - rsync, scp and S3 file transfer
//! - tar.gz packing and unpacking of job workspaces
//! - The stages shared by build and push pipelines
//! - The unix and windows build platforms

pub mod archive;
pub mod aws;
pub mod download;
pub mod hostname;
pub mod platform;
pub mod process;
pub mod ssm;
pub mod stages;
pub mod transfer;

pub use archive::ArchiveManager;
pub use aws::AwsCli;
pub use process::ProcessExecutor;
pub use ssm::{RemoteRunner, SsmExecutor};
