use crate::utils::shell;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One unit of work in a pipeline. Operations carry no host binding; the same
/// list is replayed against every host of a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Operation {
    /// Scope marker: every following operation runs with this directory as
    /// its working directory. Not a remote call.
    ChangeDir(String),
    GitCheckout(String),
    GitPull(String),
    ShellCommand(String),
}

impl Operation {
    /// Shell text to execute, or `None` for scope markers.
    pub fn command(&self) -> Option<String> {
        match self {
            Operation::ChangeDir(_) => None,
            Operation::GitCheckout(branch) => {
                Some(format!("git checkout {}", shell::quote_arg(branch)))
            }
            Operation::GitPull(branch) => {
                Some(format!("git pull origin {}", shell::quote_arg(branch)))
            }
            Operation::ShellCommand(text) => Some(text.clone()),
        }
    }

    pub fn is_git(&self) -> bool {
        matches!(self, Operation::GitCheckout(_) | Operation::GitPull(_))
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::ChangeDir(path) => write!(f, "cd {}", path),
            other => f.write_str(&other.command().unwrap_or_default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_dir_has_no_command() {
        assert_eq!(Operation::ChangeDir("/var/www/app/".into()).command(), None);
    }

    #[test]
    fn git_operations_render_branch() {
        assert_eq!(
            Operation::GitCheckout("master".into()).command().unwrap(),
            "git checkout master"
        );
        assert_eq!(
            Operation::GitPull("feature/x y".into()).command().unwrap(),
            "git pull origin 'feature/x y'"
        );
    }

    #[test]
    fn serializes_as_tagged_variant() {
        let json = serde_json::to_value(Operation::GitPull("develop".into())).unwrap();
        assert_eq!(json["type"], "git_pull");
        assert_eq!(json["value"], "develop");
    }
}
