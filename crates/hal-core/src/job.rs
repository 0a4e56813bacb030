//! Build and push job records.
//!
//! These are snapshots handed to the agent by the job store. The pipeline
//! never writes them back; status changes go through
//! [`EventLogger::status`](crate::event::EventLogger::status).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::JobId;

/// Lifecycle status shared by builds and pushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Waiting,
    Building,
    Pushing,
    Success,
    Error,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Waiting => "Waiting",
            JobStatus::Building => "Building",
            JobStatus::Pushing => "Pushing",
            JobStatus::Success => "Success",
            JobStatus::Error => "Error",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A source repository registered with the system.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Repository {
    /// Short unique key, exposed to commands as `HAL_REPO`.
    pub key: String,
    pub github_user: String,
    pub github_repo: String,
    #[serde(default)]
    pub build_cmd: Option<String>,
    #[serde(default)]
    pub build_transform_cmd: Option<String>,
    #[serde(default)]
    pub pre_push_cmd: Option<String>,
    #[serde(default)]
    pub post_push_cmd: Option<String>,
}

/// Where a push delivers its code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TargetKind {
    Rsync {
        server: String,
        path: String,
    },
    S3 {
        bucket: String,
        #[serde(default)]
        path: String,
        /// Upload a single archive instead of syncing the tree.
        #[serde(default)]
        archive: bool,
    },
    ElasticBeanstalk {
        application: String,
        environment: String,
        bucket: String,
    },
    CodeDeploy {
        application: String,
        group: String,
        bucket: String,
        #[serde(default)]
        configuration: Option<String>,
    },
}

impl TargetKind {
    pub fn method(&self) -> &'static str {
        match self {
            TargetKind::Rsync { .. } => "rsync",
            TargetKind::S3 { .. } => "s3",
            TargetKind::ElasticBeanstalk { .. } => "eb",
            TargetKind::CodeDeploy { .. } => "cd",
        }
    }
}

/// A deployment target. Only one push may be active per target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub id: String,
    #[serde(flatten)]
    pub kind: TargetKind,
}

/// A build of a repository at a specific reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    pub id: JobId,
    pub status: JobStatus,
    pub repository: Repository,
    /// Environment key, exposed as `HAL_ENVIRONMENT`.
    pub environment: String,
    /// Branch, tag or pull request reference.
    pub reference: String,
    pub commit: String,
    #[serde(default)]
    pub user: Option<String>,
    /// Build system requested for this build (`unix`, `windows_aws`).
    #[serde(default)]
    pub platform: Option<String>,
    /// Encrypted properties keyed by name.
    #[serde(default)]
    pub encrypted: std::collections::BTreeMap<String, String>,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
}

/// A push of a finished build to a deployment target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Push {
    pub id: JobId,
    pub status: JobStatus,
    pub build: Build,
    #[serde(default)]
    pub target: Option<Target>,
    #[serde(default)]
    pub user: Option<String>,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_terminal() {
        assert!(JobStatus::Success.is_terminal());
        assert!(JobStatus::Error.is_terminal());
        assert!(!JobStatus::Waiting.is_terminal());
        assert!(!JobStatus::Pushing.is_terminal());
    }

    #[test]
    fn test_target_deserialize() {
        let json = r#"{"id": "t1", "type": "rsync", "server": "127.0.0.1", "path": "/herp/derp"}"#;
        let target: Target = serde_json::from_str(json).unwrap();
        assert_eq!(target.id, "t1");
        assert_eq!(target.kind.method(), "rsync");
        assert!(matches!(target.kind, TargetKind::Rsync { ref path, .. } if path == "/herp/derp"));
    }
}
