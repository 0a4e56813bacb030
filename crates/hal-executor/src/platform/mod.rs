//! Build platforms.
//!
//! Each platform contributes a fixed list of stages that run between reading
//! the job configuration and packing the build, plus an optional emergency
//! cleanup for the remote resources it allocates.

use hal_config::AgentConfig;
use hal_core::credential::CredentialWallet;
use hal_core::event::EventLogger;
use hal_core::executor::CommandExecutor;
use hal_core::secret::PropertyDecrypter;
use hal_core::stage::{EmergencyCleanup, Stage};
use hal_core::{Error, Result};
use std::str::FromStr;
use std::sync::Arc;

use crate::aws::AwsCli;

pub mod unix;
pub mod windows_aws;

/// Build system selected for a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildSystem {
    Unix,
    WindowsAws,
}

impl BuildSystem {
    /// Name used by the `system` key of `.hal9000.yml`.
    pub fn config_name(&self) -> &'static str {
        match self {
            BuildSystem::Unix => "unix",
            BuildSystem::WindowsAws => "windows",
        }
    }
}

impl FromStr for BuildSystem {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "unix" | "global" => Ok(BuildSystem::Unix),
            "windows" | "windows_aws" | "windows-aws" => Ok(BuildSystem::WindowsAws),
            other => Err(Error::InvalidInput(format!("unknown build system \"{other}\""))),
        }
    }
}

/// Capabilities shared by every platform's stages.
#[derive(Clone)]
pub struct PlatformContext {
    pub config: Arc<AgentConfig>,
    pub executor: Arc<dyn CommandExecutor>,
    pub logger: Arc<dyn EventLogger>,
    pub decrypter: Arc<dyn PropertyDecrypter>,
    pub aws: AwsCli,
    pub wallet: Arc<CredentialWallet>,
}

pub struct BuildPlatform {
    pub system: BuildSystem,
    pub stages: Vec<Arc<dyn Stage>>,
    pub emergency: Option<Arc<dyn EmergencyCleanup>>,
}

pub fn build_platform(system: BuildSystem, ctx: &PlatformContext) -> BuildPlatform {
    match system {
        BuildSystem::Unix => unix::platform(ctx),
        BuildSystem::WindowsAws => windows_aws::platform(ctx),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_system_names() {
        assert_eq!("unix".parse::<BuildSystem>().unwrap(), BuildSystem::Unix);
        assert_eq!("Windows".parse::<BuildSystem>().unwrap(), BuildSystem::WindowsAws);
        assert_eq!("windows_aws".parse::<BuildSystem>().unwrap(), BuildSystem::WindowsAws);
        assert!("beos".parse::<BuildSystem>().is_err());
        assert_eq!(BuildSystem::WindowsAws.config_name(), "windows");
    }
}
