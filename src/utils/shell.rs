//! Shell escaping and quoting utilities.

/// Escape a value for use inside single quotes.
/// Replaces `'` with `'\''` (end quote, escaped quote, start quote).
pub fn escape_single_quote_content(value: &str) -> String {
    value.replace('\'', "'\\''")
}

/// Quote a single argument for shell execution.
/// - Empty strings become `''`
/// - Strings with shell metacharacters are wrapped in single quotes
/// - Embedded single quotes are escaped
pub fn quote_arg(arg: &str) -> String {
    if arg.is_empty() {
        return "''".to_string();
    }

    // Characters that require quoting
    const SHELL_META: &[char] = &[
        ' ', '\t', '\n', '\'', '"', '\\', '$', '`', '!', '*', '?', '[', ']', '(', ')', '{', '}',
        '<', '>', '|', '&', ';', '#', '~',
    ];

    if !arg.contains(SHELL_META) {
        return arg.to_string();
    }

    format!("'{}'", escape_single_quote_content(arg))
}

/// Quote a path for shell execution (always quotes).
pub fn quote_path(path: &str) -> String {
    format!("'{}'", escape_single_quote_content(path))
}

/// Quote a path that the remote shell should still tilde-expand.
/// `~/projects/app` becomes `~/'projects/app'`; anything else is fully quoted.
pub fn quote_remote_path(path: &str) -> String {
    if path == "~" {
        return "~".to_string();
    }
    match path.strip_prefix("~/") {
        Some(rest) if rest.is_empty() => "~/".to_string(),
        Some(rest) => format!("~/{}", quote_path(rest)),
        None => quote_path(path),
    }
}

/// Prefix a command with a directory change so both run in one shell
/// invocation: `cd '<dir>' && <command>`.
pub fn scoped_command(dir: Option<&str>, command: &str) -> String {
    match dir {
        Some(dir) => format!("cd {} && {}", quote_remote_path(dir), command),
        None => command.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_arg_simple() {
        assert_eq!(quote_arg("master"), "master");
        assert_eq!(quote_arg("release/1.2"), "release/1.2");
    }

    #[test]
    fn quote_arg_with_spaces() {
        assert_eq!(quote_arg("hello world"), "'hello world'");
    }

    #[test]
    fn quote_arg_with_single_quote() {
        assert_eq!(quote_arg("it's"), "'it'\\''s'");
    }

    #[test]
    fn quote_arg_empty() {
        assert_eq!(quote_arg(""), "''");
    }

    #[test]
    fn quote_path_with_quote() {
        assert_eq!(quote_path("/var/www/it's"), "'/var/www/it'\\''s'");
    }

    #[test]
    fn remote_path_keeps_tilde_outside_quotes() {
        assert_eq!(
            quote_remote_path("~/home/projects/app/"),
            "~/'home/projects/app/'"
        );
        assert_eq!(quote_remote_path("~"), "~");
        assert_eq!(quote_remote_path("/var/www/app/"), "'/var/www/app/'");
    }

    #[test]
    fn scoped_command_chains_with_and() {
        assert_eq!(
            scoped_command(Some("/var/www/staging.app/"), "git pull origin staging"),
            "cd '/var/www/staging.app/' && git pull origin staging"
        );
        assert_eq!(scoped_command(None, "redis-cli flushall"), "redis-cli flushall");
    }
}
