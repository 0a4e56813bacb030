//! Push platforms and deployment health checks for the HAL agent.
//!
//! Provides:
//! - Provider APIs for CodeDeploy and Elastic Beanstalk
//! - Health checkers mapping provider statuses onto canonical states
//! - Push platforms: rsync, S3, Elastic Beanstalk, CodeDeploy

pub mod api;
pub mod beanstalk;
pub mod codedeploy;
pub mod format;
pub mod platform;

pub use api::{CodeDeployApi, CommitApi, ElasticBeanstalkApi};
pub use beanstalk::BeanstalkHealthChecker;
pub use codedeploy::CodeDeployHealthChecker;
pub use platform::{PushContext, PushPlatform, push_platform};
