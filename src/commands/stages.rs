use serde::Serialize;

use stagehand::context::resolve_path;

use super::{CmdResult, GlobalArgs};

#[derive(Serialize)]
pub struct StageEntry {
    pub name: String,
    pub hosts: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Why this stage cannot run as configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub problem: Option<String>,
}

#[derive(Serialize)]
pub struct StagesOutput {
    pub command: String,
    pub project: String,
    pub stages: Vec<StageEntry>,
}

pub fn run(_args: (), global: &GlobalArgs) -> CmdResult<StagesOutput> {
    let config = global.load_config()?;
    let registry = config.registry()?;

    let stages = registry
        .iter()
        .map(|definition| {
            let resolved = resolve_path(definition, &config.project);
            let problem = if definition.hosts.is_empty() {
                Some("no hosts configured".to_string())
            } else {
                resolved.as_ref().err().map(|e| e.message.clone())
            };

            StageEntry {
                name: definition.name.clone(),
                hosts: definition.hosts.iter().map(|h| h.to_string()).collect(),
                branch: definition.branch.clone(),
                path: resolved.ok(),
                problem,
            }
        })
        .collect();

    Ok((
        StagesOutput {
            command: "stages.list".to_string(),
            project: config.project,
            stages,
        },
        0,
    ))
}
