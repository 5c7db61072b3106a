use clap::{Parser, Subcommand};
use std::path::PathBuf;

use commands::stage::StageArgs;
use commands::GlobalArgs;

mod commands;
mod output;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "stagehand")]
#[command(version = VERSION)]
#[command(about = "Run deploy, cache and dependency tasks across the hosts of a stage")]
struct Cli {
    /// Config file (defaults to $STAGEHAND_CONFIG, then ./stagehand.yml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the project name from the config file
    #[arg(long, global = true)]
    project: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Production hosts (master)
    #[command(visible_alias = "prod")]
    Live(StageArgs),
    /// Staging hosts
    Stage(StageArgs),
    /// Testing hosts
    Test(StageArgs),
    /// Development hosts
    #[command(visible_alias = "develop")]
    Dev(StageArgs),
    /// This machine, without SSH or git
    Localhost(StageArgs),
    /// List configured stages with their hosts and resolved paths
    Stages,
    /// Any other stage defined in the config file
    #[command(external_subcommand)]
    Other(Vec<String>),
}

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    let global = GlobalArgs {
        config: cli.config,
        project: cli.project,
    };

    let (json_result, exit_code) = commands::run_json(cli.command, &global);
    if let Err(err) = output::print_json_result(json_result) {
        eprintln!("{}", err.message);
    }

    std::process::ExitCode::from(exit_code_to_u8(exit_code))
}

fn exit_code_to_u8(code: i32) -> u8 {
    if code <= 0 {
        0
    } else if code >= 255 {
        255
    } else {
        code as u8
    }
}
