use std::path::PathBuf;

use stagehand::config::{self, DeployConfig};

pub type CmdResult<T> = stagehand::Result<(T, i32)>;

#[derive(Debug, Clone, Default)]
pub(crate) struct GlobalArgs {
    pub config: Option<PathBuf>,
    pub project: Option<String>,
}

impl GlobalArgs {
    pub(crate) fn load_config(&self) -> stagehand::Result<DeployConfig> {
        let mut config = config::load(self.config.as_deref())?;
        if let Some(project) = self.project.as_deref().filter(|p| !p.trim().is_empty()) {
            config.project = project.to_string();
        }
        Ok(config)
    }
}

pub mod stage;
pub mod stages;

/// Dispatch a command to its handler and map result to JSON.
macro_rules! dispatch {
    ($args:expr, $global:expr, $module:ident) => {
        crate::output::map_cmd_result_to_json($module::run($args, $global))
    };
}

pub(crate) fn run_json(
    command: crate::Commands,
    global: &GlobalArgs,
) -> (stagehand::Result<serde_json::Value>, i32) {
    match command {
        crate::Commands::Live(args) => dispatch!(args.on("live"), global, stage),
        crate::Commands::Stage(args) => dispatch!(args.on("staging"), global, stage),
        crate::Commands::Test(args) => dispatch!(args.on("testing"), global, stage),
        crate::Commands::Dev(args) => dispatch!(args.on("develop"), global, stage),
        crate::Commands::Localhost(args) => dispatch!(args.on("local"), global, stage),
        crate::Commands::Stages => dispatch!((), global, stages),
        crate::Commands::Other(raw) => match stage::parse_external(raw, global) {
            Ok((invocation, global)) => dispatch!(invocation, &global, stage),
            Err(err) => crate::output::map_cmd_result_to_json::<()>(Err(err)),
        },
    }
}
