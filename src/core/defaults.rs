use std::time::Duration;

/// Config file looked up in the working directory when no path is given.
pub const CONFIG_FILE_NAME: &str = "stagehand.yml";

/// Environment variable that overrides the config file location.
pub const CONFIG_ENV_VAR: &str = "STAGEHAND_CONFIG";

/// The `%s` is replaced by the (possibly stage-prefixed) project folder name.
pub const PATH_TEMPLATE: &str = "/var/www/%s/";
pub const LOCAL_PATH_TEMPLATE: &str = "~/home/projects/%s/";
pub const PATH_PLACEHOLDER: &str = "%s";

/// Relative to the project path. Skipped entirely when missing on the target.
pub const CACHE_PATH: &str = "var/cache/twig/";

pub const IDENTITY_FILE: &str = "~/.ssh/id_rsa";

pub const DEPENDENCY_MANAGER: &str = "composer";
pub const DEPENDENCY_COMMAND: &str = "composer update --prefer-dist --no-dev --optimize-autoloader";

pub const OPERATION_TIMEOUT_SECS: u64 = 600;

/// Stages deployed to the bare project folder. Every other stage is prefixed
/// with `<stage>.`.
pub const UNPREFIXED_STAGES: &[&str] = &["live", "local"];

/// Stage that runs on this machine instead of over SSH.
pub const LOCAL_STAGE: &str = "local";

/// CLI/config spellings mapped to canonical stage names.
pub const STAGE_ALIASES: &[(&str, &str)] = &[
    ("prod", "live"),
    ("production", "live"),
    ("stage", "staging"),
    ("test", "testing"),
    ("dev", "develop"),
    ("development", "develop"),
    ("localhost", "local"),
];

pub fn operation_timeout() -> Duration {
    Duration::from_secs(OPERATION_TIMEOUT_SECS)
}

pub fn extra_path_commands() -> Vec<String> {
    vec![DEPENDENCY_COMMAND.to_string()]
}

/// Cache eviction commands, in execution order. `cache_path` must end with `/`.
pub fn cache_clear_commands(cache_path: &str) -> Vec<String> {
    vec![
        "redis-cli flushall".to_string(),
        format!(
            "find {} -type f -name '*.volt.php' -exec rm -rf {{}} +",
            cache_path
        ),
        format!(
            "find {} -type f -name '*.volt_e_.php' -exec rm -rf {{}} +",
            cache_path
        ),
        format!("rm -rf {}*%%.php", cache_path),
        format!("rm -rf {}*.volt.php", cache_path),
    ]
}

/// Map an alias like `prod` to its canonical stage name.
pub fn canonical_stage_name(name: &str) -> &str {
    STAGE_ALIASES
        .iter()
        .find(|(alias, _)| *alias == name)
        .map(|(_, canonical)| *canonical)
        .unwrap_or(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_resolve_to_canonical_names() {
        assert_eq!(canonical_stage_name("prod"), "live");
        assert_eq!(canonical_stage_name("dev"), "develop");
        assert_eq!(canonical_stage_name("localhost"), "local");
        assert_eq!(canonical_stage_name("qa"), "qa");
    }

    #[test]
    fn cache_commands_keep_literal_find_braces() {
        let cmds = cache_clear_commands("var/cache/twig/");
        assert_eq!(cmds.len(), 5);
        assert_eq!(cmds[0], "redis-cli flushall");
        assert_eq!(
            cmds[1],
            "find var/cache/twig/ -type f -name '*.volt.php' -exec rm -rf {} +"
        );
        assert_eq!(cmds[3], "rm -rf var/cache/twig/*%%.php");
    }
}
