use crate::defaults;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A host as written in the config: an alias or hostname that `ssh` resolves
/// through the user's SSH client configuration.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostRef(String);

impl HostRef {
    pub fn new(host: impl Into<String>) -> Self {
        Self(host.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for hosts that refer to this machine.
    pub fn is_loopback(&self) -> bool {
        matches!(self.0.as_str(), "localhost" | "127.0.0.1" | "::1")
    }
}

impl fmt::Display for HostRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for HostRef {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// The SSH identity used to authenticate against a stage's hosts.
/// `None` leaves key selection to ssh-agent and the SSH client config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialRef(Option<String>);

impl CredentialRef {
    pub fn identity_file(path: impl Into<String>) -> Self {
        Self(Some(path.into()))
    }

    pub fn none() -> Self {
        Self(None)
    }

    pub fn path(&self) -> Option<&str> {
        self.0.as_deref().filter(|p| !p.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraCommands {
    /// Run after the deploy, wherever the shell lands (e.g. `redis-cli flushall`).
    #[serde(default)]
    pub os: Vec<String>,
    /// Run after the deploy from the project root (e.g. composer, npm, pip).
    #[serde(default)]
    pub path: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageDefinition {
    pub name: String,
    pub hosts: Vec<HostRef>,
    pub path_template: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    pub credential: CredentialRef,
    pub extra_commands: ExtraCommands,
}

impl StageDefinition {
    pub fn is_local(&self) -> bool {
        self.name == defaults::LOCAL_STAGE
    }

    /// Folder name the project lives under for this stage: bare for live and
    /// local, `<stage>.<project>` for everything else.
    pub fn project_folder(&self, project: &str) -> String {
        if defaults::UNPREFIXED_STAGES.contains(&self.name.as_str()) {
            project.to_string()
        } else {
            format!("{}.{}", self.name, project)
        }
    }
}

/// Every configured stage, keyed by canonical name. Built once at startup and
/// only read afterwards.
#[derive(Debug, Clone, Default)]
pub struct StageRegistry {
    stages: BTreeMap<String, StageDefinition>,
}

impl StageRegistry {
    pub fn new(definitions: Vec<StageDefinition>) -> Result<Self> {
        let mut stages = BTreeMap::new();
        for definition in definitions {
            let name = definition.name.clone();
            if stages.insert(name.clone(), definition).is_some() {
                return Err(Error::config_invalid_value(
                    "stages",
                    Some(name.clone()),
                    format!("stage '{}' is defined more than once", name),
                ));
            }
        }
        Ok(Self { stages })
    }

    /// Look up a stage by name or alias (`prod`, `dev`, `localhost`, ...).
    pub fn lookup(&self, name: &str) -> Result<&StageDefinition> {
        let canonical = defaults::canonical_stage_name(name);
        self.stages
            .get(canonical)
            .ok_or_else(|| Error::stage_not_found(name, self.names()))
    }

    pub fn names(&self) -> Vec<String> {
        self.stages.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StageDefinition> {
        self.stages.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(name: &str) -> StageDefinition {
        StageDefinition {
            name: name.to_string(),
            hosts: vec![HostRef::new("web01")],
            path_template: "/var/www/%s/".to_string(),
            branch: Some(name.to_string()),
            credential: CredentialRef::none(),
            extra_commands: ExtraCommands::default(),
        }
    }

    #[test]
    fn lookup_follows_aliases() {
        let registry = StageRegistry::new(vec![stage("live"), stage("develop")]).unwrap();
        assert_eq!(registry.lookup("prod").unwrap().name, "live");
        assert_eq!(registry.lookup("dev").unwrap().name, "develop");
    }

    #[test]
    fn unknown_stage_fails() {
        let registry = StageRegistry::new(vec![stage("live")]).unwrap();
        let err = registry.lookup("staging").unwrap_err();
        assert_eq!(err.code, crate::ErrorCode::StageNotFound);
    }

    #[test]
    fn duplicate_stage_is_rejected() {
        let err = StageRegistry::new(vec![stage("live"), stage("live")]).unwrap_err();
        assert_eq!(err.code, crate::ErrorCode::ConfigInvalidValue);
    }

    #[test]
    fn project_folder_prefixes_all_but_live_and_local() {
        assert_eq!(stage("live").project_folder("app"), "app");
        assert_eq!(stage("local").project_folder("app"), "app");
        assert_eq!(stage("staging").project_folder("app"), "staging.app");
        assert_eq!(stage("qa").project_folder("app"), "qa.app");
    }

    #[test]
    fn loopback_hosts() {
        assert!(HostRef::new("127.0.0.1").is_loopback());
        assert!(HostRef::new("localhost").is_loopback());
        assert!(!HostRef::new("dev01").is_loopback());
    }

    #[test]
    fn empty_credential_path_is_none() {
        assert_eq!(CredentialRef::identity_file("").path(), None);
        assert_eq!(
            CredentialRef::identity_file("~/.ssh/id_rsa").path(),
            Some("~/.ssh/id_rsa")
        );
    }
}
