use clap::error::ErrorKind;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

use stagehand::cancel::CancelFlag;
use stagehand::deploy::{Invocation, Task};
use stagehand::executor::{ParallelExecutor, RunReport};
use stagehand::ssh::SshSessionFactory;
use stagehand::{Error, ExecutionContext};

use super::{CmdResult, GlobalArgs};

#[derive(Args)]
pub struct StageArgs {
    #[command(subcommand)]
    pub task: TaskCommand,
}

impl StageArgs {
    pub fn on(self, stage: &str) -> StageInvocation {
        StageInvocation {
            stage: stage.to_string(),
            task: self.task,
        }
    }
}

pub struct StageInvocation {
    pub stage: String,
    pub task: TaskCommand,
}

#[derive(Subcommand, Clone, Copy)]
pub enum TaskCommand {
    /// Check out and pull the stage branch, then run the extra commands
    Deploy,
    /// Flush redis and remove compiled templates (skipped where the cache path is missing)
    #[command(visible_alias = "clear-cache")]
    Rmcache,
    /// Run the dependency manager from the project root
    #[command(visible_alias = "update-dependencies")]
    Composer,
    /// Show the operations a task would run, without connecting to any host
    Plan {
        #[arg(value_enum, default_value_t = TaskName::Deploy)]
        task: TaskName,
    },
}

#[derive(ValueEnum, Clone, Copy)]
pub enum TaskName {
    Deploy,
    Rmcache,
    Composer,
}

impl From<TaskName> for Task {
    fn from(name: TaskName) -> Self {
        match name {
            TaskName::Deploy => Task::Deploy,
            TaskName::Rmcache => Task::ClearCache,
            TaskName::Composer => Task::UpdateDependencies,
        }
    }
}

impl TaskCommand {
    fn task(&self) -> Task {
        match self {
            TaskCommand::Deploy => Task::Deploy,
            TaskCommand::Rmcache => Task::ClearCache,
            TaskCommand::Composer => Task::UpdateDependencies,
            TaskCommand::Plan { task } => (*task).into(),
        }
    }
}

/// Tasks for stages that only exist in the config file (`stagehand qa deploy`).
/// Global flags given after the stage name land here and override the ones
/// given before it.
#[derive(Parser)]
struct ExternalStage {
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true)]
    project: Option<String>,

    #[command(subcommand)]
    task: TaskCommand,
}

pub fn parse_external(
    raw: Vec<String>,
    global: &GlobalArgs,
) -> stagehand::Result<(StageInvocation, GlobalArgs)> {
    let stage = raw.first().cloned().ok_or_else(|| {
        Error::validation_invalid_argument("stage", "Missing stage name", None, None)
    })?;

    // clap treats the first element as the binary name, which is the stage here
    let parsed = ExternalStage::try_parse_from(&raw).map_err(|e| {
        if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) {
            e.exit();
        }
        Error::validation_invalid_argument(
            "task",
            e.to_string(),
            Some(stage.clone()),
            Some(vec![
                "deploy".to_string(),
                "rmcache".to_string(),
                "composer".to_string(),
                "plan".to_string(),
            ]),
        )
    })?;

    let global = GlobalArgs {
        config: parsed.config.or_else(|| global.config.clone()),
        project: parsed.project.or_else(|| global.project.clone()),
    };

    Ok((
        StageInvocation {
            stage,
            task: parsed.task,
        },
        global,
    ))
}

#[derive(Serialize)]
pub struct RunOutput {
    pub command: String,
    pub project: String,
    pub stage: String,
    pub task: Task,
    pub report: RunReport,
}

#[derive(Serialize)]
pub struct PlanOutput {
    pub command: String,
    pub project: String,
    pub stage: String,
    pub task: Task,
    pub context: ExecutionContext,
}

#[derive(Serialize)]
#[serde(untagged)]
pub enum StageOutput {
    Run(RunOutput),
    Plan(PlanOutput),
}

pub fn run(invocation: StageInvocation, global: &GlobalArgs) -> CmdResult<StageOutput> {
    let config = global.load_config()?;
    let registry = config.registry()?;

    let mut session = Invocation::new(&registry, config.project.clone(), config.settings());
    let stage = session.select_stage(&invocation.stage)?.stage_name.clone();
    let task = invocation.task.task();

    if let TaskCommand::Plan { .. } = invocation.task {
        let context = session.plan(task)?;
        return Ok((
            StageOutput::Plan(PlanOutput {
                command: "stage.plan".to_string(),
                project: config.project,
                stage,
                task,
                context,
            }),
            0,
        ));
    }

    let cancel = CancelFlag::new();
    if let Err(err) = cancel.install_ctrlc_handler() {
        stagehand::log_status!("stage", "{}", err);
    }
    let executor =
        ParallelExecutor::new(Arc::new(SshSessionFactory)).with_cancel_flag(cancel);

    let report = session.run(task, &executor)?;
    log_report(&report);

    let exit_code = report.overall_status.exit_code();
    Ok((
        StageOutput::Run(RunOutput {
            command: format!("stage.{}", task.as_str()),
            project: config.project,
            stage,
            task,
            report,
        }),
        exit_code,
    ))
}

fn log_report(report: &RunReport) {
    for result in report.results.values() {
        if let Some(reason) = &result.skipped {
            stagehand::log_status!("stage", "{}: skipped ({})", result.host, reason);
        } else if result.succeeded() {
            stagehand::log_status!("stage", "{}: ok", result.host);
        } else if let Some(failed) = result.failed_operation() {
            stagehand::log_status!(
                "stage",
                "{}: failed at operation {} ({}), exit {}",
                result.host,
                result.failed_at.unwrap_or_default(),
                failed.op,
                failed.exit_code
            );
        } else {
            let reason = result
                .error
                .as_ref()
                .map(|e| e.message.as_str())
                .unwrap_or("cancelled");
            stagehand::log_status!("stage", "{}: failed before running ({})", result.host, reason);
        }
    }
}
