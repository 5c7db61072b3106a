use crate::defaults;
use crate::deploy::PipelineSettings;
use crate::error::{Error, Result};
use crate::stage::{CredentialRef, ExtraCommands, HostRef, StageDefinition, StageRegistry};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root structure of `stagehand.yml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployConfig {
    /// Git repo name (without `.git`), which is also the folder name on hosts.
    #[serde(default)]
    pub project: String,

    #[serde(default = "default_path")]
    pub path: String,

    #[serde(default = "default_local_path")]
    pub local_path: String,

    #[serde(default = "default_cache_path")]
    pub cache_path: String,

    #[serde(default = "default_identity_file")]
    pub identity_file: Option<String>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_extra_commands")]
    pub extra_commands: ExtraCommands,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependency_command: Option<String>,

    #[serde(default)]
    pub stages: BTreeMap<String, StageConfig>,
}

/// Per-stage section. Anything left out falls back to the top-level value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageConfig {
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_commands: Option<ExtraCommands>,
}

fn default_path() -> String {
    defaults::PATH_TEMPLATE.to_string()
}

fn default_local_path() -> String {
    defaults::LOCAL_PATH_TEMPLATE.to_string()
}

fn default_cache_path() -> String {
    defaults::CACHE_PATH.to_string()
}

fn default_identity_file() -> Option<String> {
    Some(defaults::IDENTITY_FILE.to_string())
}

fn default_timeout_secs() -> u64 {
    defaults::OPERATION_TIMEOUT_SECS
}

fn default_extra_commands() -> ExtraCommands {
    ExtraCommands {
        os: Vec::new(),
        path: defaults::extra_path_commands(),
    }
}

/// Where to read the config from: explicit path, then `STAGEHAND_CONFIG`,
/// then `stagehand.yml` in the working directory.
pub fn config_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    match std::env::var(defaults::CONFIG_ENV_VAR) {
        Ok(path) if !path.trim().is_empty() => PathBuf::from(shellexpand::tilde(&path).as_ref()),
        _ => PathBuf::from(defaults::CONFIG_FILE_NAME),
    }
}

pub fn load(explicit: Option<&Path>) -> Result<DeployConfig> {
    let path = config_path(explicit);
    let display = path.display().to_string();

    let contents = std::fs::read_to_string(&path).map_err(|e| {
        Error::internal_io(e.to_string(), Some(format!("read {}", display))).with_hint(format!(
            "Create {} or pass --config <file>",
            defaults::CONFIG_FILE_NAME
        ))
    })?;

    from_str(&contents, &display)
}

pub fn from_str(contents: &str, origin: &str) -> Result<DeployConfig> {
    let mut config: DeployConfig =
        serde_yml::from_str(contents).map_err(|e| Error::config_invalid_yaml(origin, e))?;
    config.normalize(origin)?;
    Ok(config)
}

impl DeployConfig {
    fn normalize(&mut self, origin: &str) -> Result<()> {
        if self.project.trim().is_empty() {
            return Err(Error::config_missing_key("project", Some(origin.to_string())));
        }

        if self.timeout_secs == 0 {
            return Err(Error::config_invalid_value(
                "timeout_secs",
                Some("0".to_string()),
                "timeout must be at least one second",
            ));
        }

        // A cache path without a trailing slash would turn `rm -rf <path>*.php`
        // into a sibling glob.
        if !self.cache_path.is_empty() && !self.cache_path.ends_with('/') {
            self.cache_path.push('/');
        }

        let mut canonical = BTreeMap::new();
        for (name, stage) in std::mem::take(&mut self.stages) {
            let key = defaults::canonical_stage_name(&name).to_string();
            if canonical.insert(key.clone(), stage).is_some() {
                return Err(Error::config_invalid_value(
                    "stages",
                    Some(name),
                    format!("stage '{}' is defined more than once", key),
                ));
            }
        }
        self.stages = canonical;

        for (name, stage) in &self.stages {
            let mut seen = HashSet::new();
            for host in &stage.hosts {
                if !seen.insert(host.as_str()) {
                    return Err(Error::config_invalid_value(
                        format!("stages.{}.hosts", name),
                        Some(host.clone()),
                        format!("host '{}' is listed more than once", host),
                    ));
                }
            }
        }

        Ok(())
    }

    fn stage_definition(&self, name: &str, stage: &StageConfig) -> StageDefinition {
        let is_local = name == defaults::LOCAL_STAGE;
        let path_template = stage.path.clone().unwrap_or_else(|| {
            if is_local {
                self.local_path.clone()
            } else {
                self.path.clone()
            }
        });
        let credential = match stage.identity_file.as_ref().or(self.identity_file.as_ref()) {
            Some(path) => CredentialRef::identity_file(path.clone()),
            None => CredentialRef::none(),
        };

        StageDefinition {
            name: name.to_string(),
            hosts: stage.hosts.iter().map(|h| HostRef::new(h.trim())).collect(),
            path_template,
            branch: stage.branch.clone().filter(|b| !b.trim().is_empty()),
            credential,
            extra_commands: stage
                .extra_commands
                .clone()
                .unwrap_or_else(|| self.extra_commands.clone()),
        }
    }

    pub fn registry(&self) -> Result<StageRegistry> {
        StageRegistry::new(
            self.stages
                .iter()
                .map(|(name, stage)| self.stage_definition(name, stage))
                .collect(),
        )
    }

    pub fn settings(&self) -> PipelineSettings {
        PipelineSettings {
            cache_path: self.cache_path.clone(),
            dependency_command: self.dependency_command.clone(),
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}
