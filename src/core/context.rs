use crate::defaults;
use crate::deploy;
use crate::error::{Error, Result};
use crate::operation::Operation;
use crate::stage::{CredentialRef, HostRef, StageDefinition, StageRegistry};
use serde::Serialize;
use std::time::Duration;

/// Everything one invocation needs to run against a stage. Built fresh per
/// invocation by [`StageResolver::resolve`] and never mutated afterwards;
/// narrower tasks derive a new context with [`ExecutionContext::with_commands`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionContext {
    pub stage_name: String,
    pub hosts: Vec<HostRef>,
    pub resolved_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    pub credential: CredentialRef,
    /// Run every host through local process execution instead of SSH.
    pub local: bool,
    pub commands: Vec<Operation>,
    /// Per-host precondition: when set, hosts where this path does not exist
    /// skip `commands` entirely and report success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub only_if_exists: Option<String>,
    #[serde(skip)]
    pub timeout: Duration,
}

impl ExecutionContext {
    pub fn with_commands(&self, commands: Vec<Operation>) -> Self {
        Self {
            commands,
            only_if_exists: None,
            ..self.clone()
        }
    }

    pub fn with_precondition(mut self, path: impl Into<String>) -> Self {
        self.only_if_exists = Some(path.into());
        self
    }
}

/// Maps stage names to execution contexts.
pub struct StageResolver<'a> {
    registry: &'a StageRegistry,
    timeout: Duration,
}

impl<'a> StageResolver<'a> {
    pub fn new(registry: &'a StageRegistry) -> Self {
        Self {
            registry,
            timeout: defaults::operation_timeout(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Resolve `name` (or an alias) for `project`. The returned context holds
    /// the canonical deploy operation list.
    pub fn resolve(&self, name: &str, project: &str) -> Result<ExecutionContext> {
        let definition = self.registry.lookup(name)?;

        if definition.hosts.is_empty() {
            return Err(Error::stage_no_hosts(&definition.name));
        }

        let resolved_path = resolve_path(definition, project)?;
        let commands = deploy::deploy_operations(definition, &resolved_path);

        Ok(ExecutionContext {
            stage_name: definition.name.clone(),
            hosts: definition.hosts.clone(),
            resolved_path,
            branch: definition.branch.clone(),
            credential: definition.credential.clone(),
            local: definition.is_local(),
            commands,
            only_if_exists: None,
            timeout: self.timeout,
        })
    }
}

/// Substitute the stage's project folder into its path template. The result
/// always ends with `/`.
pub fn resolve_path(definition: &StageDefinition, project: &str) -> Result<String> {
    let template = &definition.path_template;
    let placeholders = template.matches(defaults::PATH_PLACEHOLDER).count();

    if placeholders == 0 {
        return Err(Error::stage_invalid_path_template(
            &definition.name,
            template,
            format!("'{}' has no substitution point", template),
        ));
    }
    if placeholders > 1 {
        return Err(Error::stage_invalid_path_template(
            &definition.name,
            template,
            format!("'{}' has more than one substitution point", template),
        ));
    }
    if project.trim().is_empty() {
        return Err(Error::stage_invalid_path_template(
            &definition.name,
            template,
            "project name is empty",
        ));
    }

    let mut path = template.replacen(
        defaults::PATH_PLACEHOLDER,
        &definition.project_folder(project),
        1,
    );
    if path.trim().is_empty() {
        return Err(Error::stage_invalid_path_template(
            &definition.name,
            template,
            "substituted path is empty",
        ));
    }
    if !path.ends_with('/') {
        path.push('/');
    }

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::ExtraCommands;
    use crate::ErrorCode;

    fn definition(name: &str, template: &str, hosts: &[&str]) -> StageDefinition {
        StageDefinition {
            name: name.to_string(),
            hosts: hosts.iter().map(|h| HostRef::new(*h)).collect(),
            path_template: template.to_string(),
            branch: if name == "local" {
                None
            } else {
                Some(name.to_string())
            },
            credential: CredentialRef::none(),
            extra_commands: ExtraCommands::default(),
        }
    }

    fn registry() -> StageRegistry {
        StageRegistry::new(vec![
            definition("live", "/var/www/%s/", &["web01"]),
            definition("staging", "/var/www/%s/", &["web01"]),
            definition("testing", "/var/www/%s/", &["web01"]),
            definition("develop", "/var/www/%s", &["dev01", "dev02"]),
            definition("local", "~/home/projects/%s/", &["127.0.0.1"]),
            definition("empty", "/var/www/%s/", &[]),
            definition("broken", "/var/www/app/", &["web01"]),
        ])
        .unwrap()
    }

    #[test]
    fn staging_gets_prefixed_folder() {
        let registry = registry();
        let ctx = StageResolver::new(&registry).resolve("staging", "app").unwrap();
        assert_eq!(ctx.resolved_path, "/var/www/staging.app/");
    }

    #[test]
    fn live_and_local_get_bare_folder() {
        let registry = registry();
        let resolver = StageResolver::new(&registry);
        assert_eq!(resolver.resolve("live", "app").unwrap().resolved_path, "/var/www/app/");
        assert_eq!(
            resolver.resolve("localhost", "app").unwrap().resolved_path,
            "~/home/projects/app/"
        );
    }

    #[test]
    fn missing_trailing_slash_is_added() {
        let registry = registry();
        let ctx = StageResolver::new(&registry).resolve("dev", "app").unwrap();
        assert_eq!(ctx.resolved_path, "/var/www/develop.app/");
        assert_eq!(ctx.hosts.len(), 2);
    }

    #[test]
    fn every_stage_with_hosts_resolves() {
        let registry = registry();
        let resolver = StageResolver::new(&registry);
        for def in registry.iter() {
            if def.hosts.is_empty() || def.name == "broken" {
                continue;
            }
            let ctx = resolver.resolve(&def.name, "jream.network").unwrap();
            assert!(ctx.resolved_path.ends_with('/'));
            assert!(ctx.resolved_path.contains("jream.network"));
        }
    }

    #[test]
    fn empty_hosts_fail() {
        let registry = registry();
        let err = StageResolver::new(&registry).resolve("empty", "app").unwrap_err();
        assert_eq!(err.code, ErrorCode::StageNoHosts);
    }

    #[test]
    fn template_without_placeholder_fails() {
        let registry = registry();
        let err = StageResolver::new(&registry).resolve("broken", "app").unwrap_err();
        assert_eq!(err.code, ErrorCode::StageInvalidPathTemplate);
    }

    #[test]
    fn empty_project_fails() {
        let registry = registry();
        let err = StageResolver::new(&registry).resolve("live", "  ").unwrap_err();
        assert_eq!(err.code, ErrorCode::StageInvalidPathTemplate);
    }

    #[test]
    fn resolving_twice_is_structurally_equal() {
        let registry = registry();
        let resolver = StageResolver::new(&registry);
        assert_eq!(
            resolver.resolve("staging", "app").unwrap(),
            resolver.resolve("staging", "app").unwrap()
        );
    }

    #[test]
    fn local_stage_is_flagged_local() {
        let registry = registry();
        let ctx = StageResolver::new(&registry).resolve("local", "app").unwrap();
        assert!(ctx.local);
        assert_eq!(ctx.branch, None);
    }
}
