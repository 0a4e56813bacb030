//! Agent system configuration (`hal.kdl`).
//!
//! ```kdl
//! agent {
//!     workspace "/var/lib/hal/workspace"
//!     archive "/var/lib/hal/archive"
//!     jobs "/var/lib/hal/jobs"
//!     path "/usr/local/bin:/usr/bin:/bin"
//!     github-api "https://api.github.com"
//!     github-web "https://github.com"
//!     timezone "-05:00"
//! }
//! timeouts command=300 build=1800 push=1800 health-poll=10
//! worker interval=5 timeout=3600 program="hal"
//! ssh user="deploy"
//! aws region="us-east-1"
//! unix server="builder.example.com" user="builder" path="/var/lib/hal/builds" {
//!     env NODE_ENV="production"
//! }
//! windows-aws instance-id="i-0abc" bucket="hal-builds" path="C:\\hal\\builds"
//! credentials {
//!     credential "deploy" "*" identity="/etc/hal/keys/deploy"
//! }
//! secrets {
//!     secret "db-password" "hunter2"
//! }
//! hostname-suffixes ".corp.example.com" ".example.com"
//! ```

use hal_core::credential::{Credential, CredentialWallet};
use kdl::{KdlDocument, KdlNode, KdlValue};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{ConfigError, ConfigResult};

/// Remote build server for the unix platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnixBuilderConfig {
    pub server: String,
    pub user: String,
    /// Parent directory for per-build working directories on the server.
    pub path: String,
    pub env: BTreeMap<String, String>,
}

/// Cloud build instance for the windows platform, reached over SSM and S3.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowsAwsConfig {
    pub instance_id: String,
    pub bucket: String,
    pub path: String,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timeouts {
    pub command: Duration,
    pub build: Duration,
    pub push: Duration,
    /// Delay between deployment health checks.
    pub health_poll: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            command: Duration::from_secs(300),
            build: Duration::from_secs(1800),
            push: Duration::from_secs(1800),
            health_poll: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Delay between child status checks. Must be 1 to 29 seconds.
    pub interval: Duration,
    /// Hard limit per spawned job.
    pub timeout: Duration,
    /// Program spawned for each job.
    pub program: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(3600),
            program: "hal".to_string(),
        }
    }
}

/// Agent-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Base directory for per-job workspaces.
    pub workspace: PathBuf,
    /// Where finished build archives are kept.
    pub archive: PathBuf,
    /// Directory of the JSON job store.
    pub jobs: PathBuf,
    /// `PATH` given to job commands.
    pub env_path: String,
    pub github_api: String,
    pub github_web: String,
    pub github_token: Option<String>,
    pub timeouts: Timeouts,
    pub worker: WorkerConfig,
    /// Remote user for rsync targets.
    pub ssh_user: String,
    pub aws_region: Option<String>,
    pub aws_profile: Option<String>,
    pub unix: Option<UnixBuilderConfig>,
    pub windows_aws: Option<WindowsAwsConfig>,
    pub credentials: Vec<Credential>,
    #[serde(skip_serializing)]
    pub secrets: HashMap<String, String>,
    pub hostname_suffixes: Vec<String>,
    /// UTC offset used when rendering health report times, in seconds.
    pub utc_offset: i32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            workspace: PathBuf::from("/tmp/hal"),
            archive: PathBuf::from("/var/lib/hal/archive"),
            jobs: PathBuf::from("/var/lib/hal/jobs"),
            env_path: "/usr/local/bin:/usr/bin:/bin".to_string(),
            github_api: "https://api.github.com".to_string(),
            github_web: "https://github.com".to_string(),
            github_token: None,
            timeouts: Timeouts::default(),
            worker: WorkerConfig::default(),
            ssh_user: "deploy".to_string(),
            aws_region: None,
            aws_profile: None,
            unix: None,
            windows_aws: None,
            credentials: Vec::new(),
            secrets: HashMap::new(),
            hostname_suffixes: Vec::new(),
            utc_offset: 0,
        }
    }
}

impl AgentConfig {
    /// Read and parse a KDL configuration file.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path)?;
        parse_agent_config(&text)
    }

    pub fn wallet(&self) -> CredentialWallet {
        self.credentials.iter().cloned().collect()
    }
}

/// Parse agent configuration from KDL text. Unset values keep their defaults.
pub fn parse_agent_config(kdl: &str) -> ConfigResult<AgentConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = AgentConfig::default();
    let mut seen = Vec::new();

    for node in doc.nodes() {
        let name = node.name().value();
        if seen.contains(&name) {
            return Err(ConfigError::Duplicate(name.to_string()));
        }
        seen.push(name);

        match name {
            "agent" => parse_agent_block(node, &mut config)?,
            "timeouts" => {
                if let Some(secs) = get_seconds_prop(node, "command")? {
                    config.timeouts.command = secs;
                }
                if let Some(secs) = get_seconds_prop(node, "build")? {
                    config.timeouts.build = secs;
                }
                if let Some(secs) = get_seconds_prop(node, "push")? {
                    config.timeouts.push = secs;
                }
                if let Some(secs) = get_seconds_prop(node, "health-poll")? {
                    config.timeouts.health_poll = secs;
                }
            }
            "worker" => {
                if let Some(interval) = get_seconds_prop(node, "interval")? {
                    if interval.is_zero() || interval >= Duration::from_secs(30) {
                        return Err(ConfigError::InvalidValue {
                            field: "worker.interval".to_string(),
                            message: "must be between 1 and 29 seconds".to_string(),
                        });
                    }
                    config.worker.interval = interval;
                }
                if let Some(timeout) = get_seconds_prop(node, "timeout")? {
                    config.worker.timeout = timeout;
                }
                if let Some(program) = get_string_prop(node, "program") {
                    config.worker.program = program;
                }
            }
            "ssh" => {
                if let Some(user) = get_string_prop(node, "user") {
                    config.ssh_user = user;
                }
            }
            "aws" => {
                config.aws_region = get_string_prop(node, "region");
                config.aws_profile = get_string_prop(node, "profile");
            }
            "unix" => {
                config.unix = Some(UnixBuilderConfig {
                    server: require_string_prop(node, "unix", "server")?,
                    user: require_string_prop(node, "unix", "user")?,
                    path: require_string_prop(node, "unix", "path")?,
                    env: parse_env_children(node),
                });
            }
            "windows-aws" => {
                config.windows_aws = Some(WindowsAwsConfig {
                    instance_id: require_string_prop(node, "windows-aws", "instance-id")?,
                    bucket: require_string_prop(node, "windows-aws", "bucket")?,
                    path: get_string_prop(node, "path").unwrap_or_else(|| "C:\\hal".to_string()),
                    env: parse_env_children(node),
                });
            }
            "credentials" => {
                for child in child_nodes(node) {
                    if child.name().value() != "credential" {
                        continue;
                    }
                    let args = get_all_string_args(child);
                    let [username, server] = args.as_slice() else {
                        return Err(ConfigError::MissingField(
                            "credential requires a username and a server".to_string(),
                        ));
                    };
                    let identity = require_string_prop(child, "credential", "identity")?;
                    config
                        .credentials
                        .push(Credential::new(username.clone(), server.clone(), identity));
                }
            }
            "secrets" => {
                for child in child_nodes(node) {
                    if child.name().value() != "secret" {
                        continue;
                    }
                    let args = get_all_string_args(child);
                    let [secret_name, value] = args.as_slice() else {
                        return Err(ConfigError::MissingField(
                            "secret requires a name and a value".to_string(),
                        ));
                    };
                    if config.secrets.insert(secret_name.clone(), value.clone()).is_some() {
                        return Err(ConfigError::Duplicate(format!("secret {secret_name}")));
                    }
                }
            }
            "hostname-suffixes" => {
                config.hostname_suffixes = get_all_string_args(node);
            }
            _ => {} // Ignore unknown nodes
        }
    }

    Ok(config)
}

fn parse_agent_block(node: &KdlNode, config: &mut AgentConfig) -> ConfigResult<()> {
    for child in child_nodes(node) {
        let value = get_first_string_arg(child);
        match (child.name().value(), value) {
            ("workspace", Some(v)) => config.workspace = absolute_path("agent.workspace", v)?,
            ("archive", Some(v)) => config.archive = absolute_path("agent.archive", v)?,
            ("jobs", Some(v)) => config.jobs = PathBuf::from(v),
            ("path", Some(v)) => config.env_path = v,
            ("github-api", Some(v)) => config.github_api = v.trim_end_matches('/').to_string(),
            ("github-web", Some(v)) => config.github_web = v.trim_end_matches('/').to_string(),
            ("github-token", Some(v)) => config.github_token = Some(v),
            ("timezone", Some(v)) => config.utc_offset = parse_utc_offset(&v)?,
            (other, None) => {
                return Err(ConfigError::MissingField(format!("agent.{other} value")));
            }
            _ => {}
        }
    }
    Ok(())
}

fn absolute_path(field: &str, value: String) -> ConfigResult<PathBuf> {
    let path = PathBuf::from(value);
    if !path.is_absolute() {
        return Err(ConfigError::InvalidValue {
            field: field.to_string(),
            message: format!("{} is not an absolute path", path.display()),
        });
    }
    Ok(path)
}

/// Parse `UTC`, `+HH:MM` or `-HH:MM` into seconds east of UTC.
fn parse_utc_offset(value: &str) -> ConfigResult<i32> {
    let invalid = || ConfigError::InvalidValue {
        field: "agent.timezone".to_string(),
        message: format!("\"{value}\" is not UTC or an offset like +02:00"),
    };
    if value.eq_ignore_ascii_case("utc") || value == "Z" {
        return Ok(0);
    }
    let (sign, rest) = match value.split_at_checked(1) {
        Some(("+", rest)) => (1, rest),
        Some(("-", rest)) => (-1, rest),
        _ => return Err(invalid()),
    };
    let (hours, minutes) = rest.split_once(':').ok_or_else(invalid)?;
    let hours: i32 = hours.parse().map_err(|_| invalid())?;
    let minutes: i32 = minutes.parse().map_err(|_| invalid())?;
    if hours > 14 || minutes > 59 {
        return Err(invalid());
    }
    Ok(sign * (hours * 3600 + minutes * 60))
}

fn parse_env_children(node: &KdlNode) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    for child in child_nodes(node).filter(|c| c.name().value() == "env") {
        for entry in child.entries() {
            if let (Some(key), Some(value)) = (entry.name(), value_to_string(entry.value())) {
                env.insert(key.value().to_string(), value);
            }
        }
    }
    env
}

// Helper functions for extracting values from KDL nodes

fn child_nodes(node: &KdlNode) -> impl Iterator<Item = &KdlNode> {
    node.children().into_iter().flat_map(|c| c.nodes().iter())
}

fn value_to_string(value: &KdlValue) -> Option<String> {
    if let Some(s) = value.as_string() {
        return Some(s.to_string());
    }
    if let Some(i) = value.as_integer() {
        return Some(i.to_string());
    }
    value.as_bool().map(|b| b.to_string())
}

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn require_string_prop(node: &KdlNode, section: &str, name: &str) -> ConfigResult<String> {
    get_string_prop(node, name).ok_or_else(|| ConfigError::MissingField(format!("{section}.{name}")))
}

fn get_seconds_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<Duration>> {
    let Some(value) = node.get(name) else {
        return Ok(None);
    };
    let secs = value
        .as_integer()
        .and_then(|i| u64::try_from(i).ok())
        .ok_or_else(|| ConfigError::InvalidValue {
            field: name.to_string(),
            message: "expected a non-negative number of seconds".to_string(),
        })?;
    Ok(Some(Duration::from_secs(secs)))
}
