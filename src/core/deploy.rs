use serde::Serialize;
use std::time::Duration;

use crate::context::{ExecutionContext, StageResolver};
use crate::defaults;
use crate::error::{Error, Result};
use crate::executor::{ParallelExecutor, RunReport};
use crate::operation::Operation;
use crate::stage::{StageDefinition, StageRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Task {
    Deploy,
    ClearCache,
    UpdateDependencies,
}

impl Task {
    pub fn as_str(&self) -> &'static str {
        match self {
            Task::Deploy => "deploy",
            Task::ClearCache => "rmcache",
            Task::UpdateDependencies => "composer",
        }
    }
}

/// Pipeline-wide settings that don't vary per stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSettings {
    /// Relative to the project path; always ends with `/`.
    pub cache_path: String,
    pub dependency_command: Option<String>,
    pub timeout: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            cache_path: defaults::CACHE_PATH.to_string(),
            dependency_command: None,
            timeout: defaults::operation_timeout(),
        }
    }
}

/// Canonical deploy sequence: enter the project, check out and pull the
/// stage branch, then the extra path and OS commands. Stages without a branch
/// skip both git operations.
pub fn deploy_operations(definition: &StageDefinition, resolved_path: &str) -> Vec<Operation> {
    let mut ops = vec![Operation::ChangeDir(resolved_path.to_string())];

    if let Some(branch) = definition.branch.as_deref().filter(|b| !b.is_empty()) {
        ops.push(Operation::GitCheckout(branch.to_string()));
        ops.push(Operation::GitPull(branch.to_string()));
    }

    ops.extend(
        definition
            .extra_commands
            .path
            .iter()
            .cloned()
            .map(Operation::ShellCommand),
    );
    ops.extend(
        definition
            .extra_commands
            .os
            .iter()
            .cloned()
            .map(Operation::ShellCommand),
    );

    ops
}

/// Cache eviction sequence. Local runs happen from the caller's working
/// directory; remote runs are scoped to the project path.
pub fn clear_cache_operations(context: &ExecutionContext, cache_path: &str) -> Vec<Operation> {
    let mut ops = Vec::new();
    if !context.local {
        ops.push(Operation::ChangeDir(context.resolved_path.clone()));
    }
    ops.extend(
        defaults::cache_clear_commands(cache_path)
            .into_iter()
            .map(Operation::ShellCommand),
    );
    ops
}

/// The dependency-manager command: explicit override, else the first extra
/// path command that invokes the dependency manager, else the default.
pub fn dependency_command(definition: &StageDefinition, settings: &PipelineSettings) -> String {
    if let Some(cmd) = settings.dependency_command.as_deref().filter(|c| !c.trim().is_empty()) {
        return cmd.to_string();
    }

    definition
        .extra_commands
        .path
        .iter()
        .find(|cmd| cmd.split_whitespace().next() == Some(defaults::DEPENDENCY_MANAGER))
        .cloned()
        .unwrap_or_else(|| defaults::DEPENDENCY_COMMAND.to_string())
}

pub fn update_dependencies_operations(
    definition: &StageDefinition,
    context: &ExecutionContext,
    settings: &PipelineSettings,
) -> Vec<Operation> {
    vec![
        Operation::ChangeDir(context.resolved_path.clone()),
        Operation::ShellCommand(dependency_command(definition, settings)),
    ]
}

struct SelectedStage {
    definition: StageDefinition,
    context: ExecutionContext,
}

/// One CLI invocation: a stage must be selected before any task runs, and
/// the selection lives here rather than in shared state.
pub struct Invocation<'a> {
    registry: &'a StageRegistry,
    project: String,
    settings: PipelineSettings,
    selected: Option<SelectedStage>,
}

impl<'a> Invocation<'a> {
    pub fn new(registry: &'a StageRegistry, project: impl Into<String>, settings: PipelineSettings) -> Self {
        Self {
            registry,
            project: project.into(),
            settings,
            selected: None,
        }
    }

    /// Resolve and select a stage. Configuration errors surface here, before
    /// any host is contacted.
    pub fn select_stage(&mut self, name: &str) -> Result<&ExecutionContext> {
        let context = StageResolver::new(self.registry)
            .with_timeout(self.settings.timeout)
            .resolve(name, &self.project)?;
        let definition = self.registry.lookup(name)?.clone();

        log_status!(
            "stage",
            "Selected '{}' ({} host(s), {})",
            context.stage_name,
            context.hosts.len(),
            context.resolved_path
        );

        let selected = self.selected.insert(SelectedStage {
            definition,
            context,
        });
        Ok(&selected.context)
    }

    fn require(&self, task: Task) -> Result<&SelectedStage> {
        self.selected
            .as_ref()
            .ok_or_else(|| Error::stage_not_selected(task.as_str()))
    }

    /// The context `task` would run with, without contacting any host.
    pub fn plan(&self, task: Task) -> Result<ExecutionContext> {
        let selected = self.require(task)?;
        let context = &selected.context;

        Ok(match task {
            Task::Deploy => context.clone(),
            Task::ClearCache => context
                .with_commands(clear_cache_operations(context, &self.settings.cache_path))
                .with_precondition(self.settings.cache_path.clone()),
            Task::UpdateDependencies => context.with_commands(update_dependencies_operations(
                &selected.definition,
                context,
                &self.settings,
            )),
        })
    }

    pub fn run(&self, task: Task, executor: &ParallelExecutor) -> Result<RunReport> {
        let context = self.plan(task)?;
        log_status!(
            "deploy",
            "{} on stage '{}'",
            task.as_str(),
            context.stage_name
        );
        Ok(executor.run(&context))
    }

    pub fn deploy(&self, executor: &ParallelExecutor) -> Result<RunReport> {
        self.run(Task::Deploy, executor)
    }

    pub fn clear_cache(&self, executor: &ParallelExecutor) -> Result<RunReport> {
        self.run(Task::ClearCache, executor)
    }

    pub fn update_dependencies(&self, executor: &ParallelExecutor) -> Result<RunReport> {
        self.run(Task::UpdateDependencies, executor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::{CredentialRef, ExtraCommands, HostRef};
    use crate::ErrorCode;

    fn definition(name: &str, branch: Option<&str>) -> StageDefinition {
        StageDefinition {
            name: name.to_string(),
            hosts: vec![HostRef::new("web01")],
            path_template: "/var/www/%s/".to_string(),
            branch: branch.map(str::to_string),
            credential: CredentialRef::none(),
            extra_commands: ExtraCommands {
                os: vec!["redis-cli -n 1 flushdb".to_string()],
                path: vec![
                    "npm ci".to_string(),
                    "composer install --no-dev".to_string(),
                ],
            },
        }
    }

    #[test]
    fn deploy_checks_out_before_pulling() {
        let ops = deploy_operations(&definition("staging", Some("staging")), "/var/www/staging.app/");
        assert_eq!(
            ops,
            vec![
                Operation::ChangeDir("/var/www/staging.app/".into()),
                Operation::GitCheckout("staging".into()),
                Operation::GitPull("staging".into()),
                Operation::ShellCommand("npm ci".into()),
                Operation::ShellCommand("composer install --no-dev".into()),
                Operation::ShellCommand("redis-cli -n 1 flushdb".into()),
            ]
        );
    }

    #[test]
    fn branchless_stage_has_no_git_operations() {
        let ops = deploy_operations(&definition("local", None), "~/home/projects/app/");
        assert!(!ops.iter().any(Operation::is_git));
        assert_eq!(ops[0], Operation::ChangeDir("~/home/projects/app/".into()));
    }

    #[test]
    fn dependency_command_prefers_configured_manager_entry() {
        let settings = PipelineSettings::default();
        assert_eq!(
            dependency_command(&definition("live", Some("master")), &settings),
            "composer install --no-dev"
        );

        let mut bare = definition("live", Some("master"));
        bare.extra_commands.path.clear();
        assert_eq!(dependency_command(&bare, &settings), defaults::DEPENDENCY_COMMAND);

        let custom = PipelineSettings {
            dependency_command: Some("pip install -r requirements.txt".to_string()),
            ..PipelineSettings::default()
        };
        assert_eq!(
            dependency_command(&bare, &custom),
            "pip install -r requirements.txt"
        );
    }

    #[test]
    fn tasks_require_a_selected_stage() {
        let registry = StageRegistry::new(vec![definition("live", Some("master"))]).unwrap();
        let invocation = Invocation::new(&registry, "app", PipelineSettings::default());

        for task in [Task::Deploy, Task::ClearCache, Task::UpdateDependencies] {
            let err = invocation.plan(task).unwrap_err();
            assert_eq!(err.code, ErrorCode::StageNotSelected);
        }
    }

    #[test]
    fn clear_cache_plan_is_scoped_remotely_and_guarded() {
        let registry = StageRegistry::new(vec![definition("live", Some("master"))]).unwrap();
        let mut invocation = Invocation::new(&registry, "app", PipelineSettings::default());
        invocation.select_stage("prod").unwrap();

        let ctx = invocation.plan(Task::ClearCache).unwrap();
        assert_eq!(ctx.commands[0], Operation::ChangeDir("/var/www/app/".into()));
        assert_eq!(ctx.commands.len(), 6);
        assert_eq!(ctx.only_if_exists.as_deref(), Some(defaults::CACHE_PATH));
    }

    #[test]
    fn clear_cache_plan_is_unscoped_locally() {
        let registry = StageRegistry::new(vec![definition("local", None)]).unwrap();
        let mut invocation = Invocation::new(&registry, "app", PipelineSettings::default());
        invocation.select_stage("localhost").unwrap();

        let ctx = invocation.plan(Task::ClearCache).unwrap();
        assert_eq!(ctx.commands.len(), 5);
        assert_eq!(
            ctx.commands[0],
            Operation::ShellCommand("redis-cli flushall".into())
        );
    }

    #[test]
    fn update_dependencies_plan() {
        let registry = StageRegistry::new(vec![definition("develop", Some("develop"))]).unwrap();
        let mut invocation = Invocation::new(&registry, "app", PipelineSettings::default());
        invocation.select_stage("dev").unwrap();

        let ctx = invocation.plan(Task::UpdateDependencies).unwrap();
        assert_eq!(
            ctx.commands,
            vec![
                Operation::ChangeDir("/var/www/develop.app/".into()),
                Operation::ShellCommand("composer install --no-dev".into()),
            ]
        );
        assert_eq!(ctx.only_if_exists, None);
    }
}
