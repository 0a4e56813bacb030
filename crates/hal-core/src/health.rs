//! Canonical health states for remote deployment services.
//!
//! Providers report free-form status strings. Known values map onto closed
//! enums; anything else is carried through in an `Other` variant so new
//! provider states are still visible.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// CodeDeploy deployment status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodeDeployStatus {
    Created,
    Queued,
    InProgress,
    Succeeded,
    Failed,
    Stopped,
    Ready,
    /// The provider could not be queried.
    Invalid,
    /// The deployment group has never been deployed.
    Missing,
    Other(String),
}

impl CodeDeployStatus {
    pub fn from_provider(status: &str) -> Self {
        match status {
            "Created" => Self::Created,
            "Queued" => Self::Queued,
            "InProgress" => Self::InProgress,
            "Succeeded" => Self::Succeeded,
            "Failed" => Self::Failed,
            "Stopped" => Self::Stopped,
            "Ready" => Self::Ready,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Created => "Created",
            Self::Queued => "Queued",
            Self::InProgress => "InProgress",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Stopped => "Stopped",
            Self::Ready => "Ready",
            Self::Invalid => "Invalid",
            Self::Missing => "None",
            Self::Other(raw) => raw,
        }
    }

    /// States where per-instance detail is worth fetching.
    pub fn has_instances(&self) -> bool {
        matches!(
            self,
            Self::InProgress | Self::Succeeded | Self::Ready | Self::Stopped | Self::Failed
        )
    }

    /// States a poller stops on. `Invalid` is not one: the provider may
    /// answer on the next attempt.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Stopped | Self::Ready | Self::Missing
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Ready)
    }
}

impl std::fmt::Display for CodeDeployStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Diagnostics attached to a failed lifecycle event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub message: String,
    pub script_name: String,
    pub error_code: String,
    pub log_tail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub name: String,
    pub status: String,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub duration: String,
    /// Only set for failed events.
    pub diagnostics: Option<Diagnostics>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceHealth {
    /// Full instance id as reported (may be an ARN).
    pub id: String,
    /// Last path segment of `id`.
    pub short_id: String,
    /// `Original`, `Original (Blue)` or `Replacement (Green)`.
    pub display_type: String,
    pub status: String,
    pub last_updated: Option<DateTime<Utc>>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub duration: String,
    pub last_finished_event: Option<String>,
    pub events: Vec<LifecycleEvent>,
}

/// Per-instance breakdown of a deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstancesHealth {
    pub ids: Vec<String>,
    pub error_message: Option<String>,
    pub instances: Vec<InstanceHealth>,
    /// Rendered one-row-per-instance table.
    pub summary: String,
    /// Rendered per-instance event tables with diagnostics.
    pub detailed: String,
}

/// One poll of a CodeDeploy deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeDeployHealth {
    pub status: CodeDeployStatus,
    pub overview: Option<Value>,
    pub error: Option<Value>,
    pub instances: Option<InstancesHealth>,
}

impl CodeDeployHealth {
    pub fn new(status: CodeDeployStatus) -> Self {
        Self {
            status,
            overview: None,
            error: None,
            instances: None,
        }
    }
}

/// Elastic Beanstalk environment status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BeanstalkStatus {
    Launching,
    Updating,
    Ready,
    Terminating,
    Terminated,
    Missing,
    Unknown,
    Other(String),
}

impl BeanstalkStatus {
    pub fn from_provider(status: &str) -> Self {
        match status {
            "Launching" => Self::Launching,
            "Updating" => Self::Updating,
            "Ready" => Self::Ready,
            "Terminating" => Self::Terminating,
            "Terminated" => Self::Terminated,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Launching => "Launching",
            Self::Updating => "Updating",
            Self::Ready => "Ready",
            Self::Terminating => "Terminating",
            Self::Terminated => "Terminated",
            Self::Missing => "Missing",
            Self::Unknown => "Unknown",
            Self::Other(raw) => raw,
        }
    }
}

impl std::fmt::Display for BeanstalkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Elastic Beanstalk environment health color.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BeanstalkHealth {
    Red,
    Yellow,
    Green,
    Grey,
    Other(String),
}

impl BeanstalkHealth {
    pub fn from_provider(health: &str) -> Self {
        match health {
            "Red" => Self::Red,
            "Yellow" => Self::Yellow,
            "Green" => Self::Green,
            "Grey" => Self::Grey,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Red => "Red",
            Self::Yellow => "Yellow",
            Self::Green => "Green",
            Self::Grey => "Grey",
            Self::Other(raw) => raw,
        }
    }
}

impl std::fmt::Display for BeanstalkHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeanstalkEnvironmentHealth {
    pub status: BeanstalkStatus,
    pub health: BeanstalkHealth,
}

impl BeanstalkEnvironmentHealth {
    /// Deployed and healthy.
    pub fn is_ready(&self) -> bool {
        self.status == BeanstalkStatus::Ready && self.health == BeanstalkHealth::Green
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codedeploy_passthrough() {
        assert_eq!(CodeDeployStatus::from_provider("InProgress"), CodeDeployStatus::InProgress);
        let unknown = CodeDeployStatus::from_provider("Baking");
        assert_eq!(unknown, CodeDeployStatus::Other("Baking".to_string()));
        assert_eq!(unknown.to_string(), "Baking");
        assert!(!unknown.is_terminal());
    }

    #[test]
    fn test_codedeploy_invalid_keeps_polling() {
        assert!(!CodeDeployStatus::Invalid.is_terminal());
        assert!(CodeDeployStatus::Failed.is_terminal());
        assert!(CodeDeployStatus::Succeeded.is_terminal());
    }

    #[test]
    fn test_codedeploy_instance_states() {
        for status in ["InProgress", "Succeeded", "Ready", "Stopped", "Failed"] {
            assert!(CodeDeployStatus::from_provider(status).has_instances());
        }
        assert!(!CodeDeployStatus::Created.has_instances());
        assert!(!CodeDeployStatus::Queued.has_instances());
        assert!(!CodeDeployStatus::Missing.has_instances());
    }

    #[test]
    fn test_beanstalk_passthrough() {
        assert_eq!(BeanstalkStatus::from_provider("Ready"), BeanstalkStatus::Ready);
        assert_eq!(BeanstalkHealth::from_provider("Purple").as_str(), "Purple");
        let ready = BeanstalkEnvironmentHealth {
            status: BeanstalkStatus::Ready,
            health: BeanstalkHealth::Green,
        };
        assert!(ready.is_ready());
    }
}
