//! Per-repository job configuration (`.hal9000.yml`).

use hal_core::job::Repository;
use serde::{Deserialize, Serialize};
use serde_yaml_ng::{Mapping, Value};
use std::path::Path;
use tracing::debug;

use crate::{ConfigError, ConfigResult};

/// File name looked up at the root of a checked-out repository.
pub const CONFIG_FILE: &str = ".hal9000.yml";

/// Upper bound on commands per list.
pub const MAX_COMMANDS: usize = 10;

/// Command lists, in the order they are read.
pub const COMMAND_LISTS: [&str; 6] = [
    "exclude",
    "build",
    "build_transform",
    "pre_push",
    "deploy",
    "post_push",
];

/// Commands and settings controlling a build and its pushes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfiguration {
    /// Build system to use (`global` lets the agent decide).
    pub system: String,
    /// Directory, relative to the checkout, that gets archived.
    pub dist: String,
    pub exclude: Vec<String>,
    pub build: Vec<String>,
    pub build_transform: Vec<String>,
    pub pre_push: Vec<String>,
    pub deploy: Vec<String>,
    pub post_push: Vec<String>,
}

impl Default for JobConfiguration {
    fn default() -> Self {
        Self {
            system: "global".to_string(),
            dist: ".".to_string(),
            exclude: vec!["config/database.ini".to_string(), "data/".to_string()],
            build: Vec::new(),
            build_transform: Vec::new(),
            pre_push: Vec::new(),
            deploy: Vec::new(),
            post_push: Vec::new(),
        }
    }
}

impl JobConfiguration {
    /// Defaults overlaid with the commands stored on the repository record.
    pub fn from_repository(repository: &Repository) -> Self {
        let single = |cmd: &Option<String>| -> Vec<String> {
            cmd.as_deref()
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(|c| vec![c.to_string()])
                .unwrap_or_default()
        };

        Self {
            build: single(&repository.build_cmd),
            build_transform: single(&repository.build_transform_cmd),
            pre_push: single(&repository.pre_push_cmd),
            post_push: single(&repository.post_push_cmd),
            ..Self::default()
        }
    }

    /// Parse a `.hal9000.yml` document on top of the defaults.
    pub fn from_yaml(text: &str) -> ConfigResult<Self> {
        let mut config = Self::default();
        config.apply_yaml(text)?;
        Ok(config)
    }

    /// Overlay a `.hal9000.yml` document.
    ///
    /// `system` and `dist` are only replaced when set; every command list is
    /// replaced, and a list missing from the document becomes empty.
    pub fn apply_yaml(&mut self, text: &str) -> ConfigResult<()> {
        let doc: Value = serde_yaml_ng::from_str(text)?;
        let map = doc
            .as_mapping()
            .ok_or_else(|| ConfigError::InvalidDocument("expected a mapping".to_string()))?;

        let system = read_scalar(map, "system")?;
        let dist = read_scalar(map, "dist")?;

        let parsed = Self {
            system: system.unwrap_or_else(|| self.system.clone()),
            dist: dist.unwrap_or_else(|| self.dist.clone()),
            exclude: read_list(map, "exclude")?,
            build: read_list(map, "build")?,
            build_transform: read_list(map, "build_transform")?,
            pre_push: read_list(map, "pre_push")?,
            deploy: read_list(map, "deploy")?,
            post_push: read_list(map, "post_push")?,
        };
        *self = parsed;
        Ok(())
    }

    /// Read `.hal9000.yml` from a checkout directory.
    ///
    /// Returns `Ok(None)` when the file does not exist.
    pub fn load(dir: &Path) -> ConfigResult<Option<Self>> {
        let path = dir.join(CONFIG_FILE);
        if !path.exists() {
            debug!(path = %path.display(), "No job configuration file found");
            return Ok(None);
        }
        let text = std::fs::read_to_string(&path)?;
        Self::from_yaml(&text).map(Some)
    }

    /// Command list by its configuration key.
    pub fn commands(&self, key: &str) -> Option<&[String]> {
        match key {
            "exclude" => Some(&self.exclude),
            "build" => Some(&self.build),
            "build_transform" => Some(&self.build_transform),
            "pre_push" => Some(&self.pre_push),
            "deploy" => Some(&self.deploy),
            "post_push" => Some(&self.post_push),
            _ => None,
        }
    }
}

fn is_unset(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => Some(String::new()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s.clone()),
        Value::Sequence(_) | Value::Mapping(_) | Value::Tagged(_) => None,
    }
}

fn read_scalar(map: &Mapping, key: &str) -> ConfigResult<Option<String>> {
    match map.get(key) {
        None => Ok(None),
        Some(value) if is_unset(value) => Ok(None),
        Some(value) => scalar_to_string(value)
            .map(|s| Some(s.trim().to_string()))
            .ok_or_else(|| ConfigError::InvalidKey(key.to_string())),
    }
}

fn read_list(map: &Mapping, key: &str) -> ConfigResult<Vec<String>> {
    let Some(value) = map.get(key) else {
        return Ok(Vec::new());
    };

    let entries: Vec<&Value> = match value {
        Value::Sequence(items) => items.iter().collect(),
        other => vec![other],
    };

    if entries.len() > MAX_COMMANDS {
        return Err(ConfigError::TooManyCommands(key.to_string()));
    }

    let mut commands = Vec::with_capacity(entries.len());
    for entry in entries {
        let command =
            scalar_to_string(entry).ok_or_else(|| ConfigError::InvalidKey(key.to_string()))?;
        let command = command.trim();
        if !command.is_empty() {
            commands.push(command.to_string());
        }
    }
    Ok(commands)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = JobConfiguration::default();
        assert_eq!(config.system, "global");
        assert_eq!(config.dist, ".");
        assert_eq!(config.exclude, vec!["config/database.ini", "data/"]);
        assert!(config.build.is_empty());
    }

    #[test]
    fn test_parse_full_document() {
        let yaml = r#"
system: " node8 "
dist: dist/
exclude:
  - .git
build:
  - npm install
  - "  npm run build  "
build_transform: bin/transform
pre_push: []
post_push:
  - bin/notify
"#;
        let config = JobConfiguration::from_yaml(yaml).unwrap();
        assert_eq!(config.system, "node8");
        assert_eq!(config.dist, "dist/");
        assert_eq!(config.exclude, vec![".git"]);
        assert_eq!(config.build, vec!["npm install", "npm run build"]);
        assert_eq!(config.build_transform, vec!["bin/transform"]);
        assert!(config.pre_push.is_empty());
        assert!(config.deploy.is_empty());
        assert_eq!(config.post_push, vec!["bin/notify"]);
    }

    #[test]
    fn test_missing_lists_replace_defaults() {
        let config = JobConfiguration::from_yaml("system: unix").unwrap();
        assert_eq!(config.system, "unix");
        assert_eq!(config.dist, ".");
        assert!(config.exclude.is_empty());
    }

    #[test]
    fn test_too_many_commands() {
        let commands: Vec<String> = (0..11).map(|i| format!("  - cmd{i}")).collect();
        let yaml = format!("build:\n{}", commands.join("\n"));
        let err = JobConfiguration::from_yaml(&yaml).unwrap_err();
        assert!(matches!(err, ConfigError::TooManyCommands(ref key) if key == "build"));
        assert_eq!(
            err.to_string(),
            "Too many commands specified for \"build\". Must be less than 10."
        );
    }

    #[test]
    fn test_ten_commands_allowed() {
        let commands: Vec<String> = (0..10).map(|i| format!("  - cmd{i}")).collect();
        let yaml = format!("deploy:\n{}", commands.join("\n"));
        let config = JobConfiguration::from_yaml(&yaml).unwrap();
        assert_eq!(config.deploy.len(), 10);
    }

    #[test]
    fn test_null_and_scalar_entries() {
        let yaml = r#"
build:
  - ~
  - 42
  - "   "
  - " make "
pre_push: 5
"#;
        let config = JobConfiguration::from_yaml(yaml).unwrap();
        assert_eq!(config.build, vec!["42", "make"]);
        assert_eq!(config.pre_push, vec!["5"]);
    }

    #[test]
    fn test_nested_entry_rejected() {
        let yaml = "build:\n  - [nested, list]\n";
        let err = JobConfiguration::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidKey(ref key) if key == "build"));
        assert_eq!(err.to_string(), "configuration key \"build\" is invalid");
    }

    #[test]
    fn test_non_scalar_system_rejected() {
        let err = JobConfiguration::from_yaml("system:\n  - a\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidKey(ref key) if key == "system"));
    }

    #[test]
    fn test_invalid_documents() {
        assert!(matches!(
            JobConfiguration::from_yaml("- just\n- a list\n"),
            Err(ConfigError::InvalidDocument(_))
        ));
        assert!(matches!(
            JobConfiguration::from_yaml("build: [unclosed"),
            Err(ConfigError::Yaml(_))
        ));
    }

    #[test]
    fn test_from_repository() {
        let repository = Repository {
            key: "repokey".to_string(),
            github_user: "user1".to_string(),
            github_repo: "repo1".to_string(),
            build_cmd: None,
            build_transform_cmd: Some("bin/build-transform".to_string()),
            pre_push_cmd: Some("bin/pre".to_string()),
            post_push_cmd: Some("bin/post".to_string()),
        };
        let config = JobConfiguration::from_repository(&repository);
        assert!(config.build.is_empty());
        assert_eq!(config.build_transform, vec!["bin/build-transform"]);
        assert_eq!(config.pre_push, vec!["bin/pre"]);
        assert_eq!(config.post_push, vec!["bin/post"]);
        assert_eq!(config.exclude, vec!["config/database.ini", "data/"]);
    }

    #[test]
    fn test_load_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(JobConfiguration::load(dir.path()).unwrap().is_none());

        std::fs::write(dir.path().join(CONFIG_FILE), "dist: public\n").unwrap();
        let config = JobConfiguration::load(dir.path()).unwrap().unwrap();
        assert_eq!(config.dist, "public");
    }
}
