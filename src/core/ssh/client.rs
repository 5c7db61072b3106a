use crate::error::{Error, RemoteCommandTimeoutDetails, Result};
use crate::stage::{CredentialRef, HostRef};
use crate::utils::shell;
use std::io::Read;
use std::process::{Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::RemoteSession;

const POLL_INTERVAL: Duration = Duration::from_millis(25);
const CONNECT_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
    pub exit_code: i32,
}

impl CommandOutput {
    fn spawn_error(context: &str, err: std::io::Error) -> Self {
        Self {
            stdout: String::new(),
            stderr: format!("{}: {}", context, err),
            success: false,
            exit_code: -1,
        }
    }
}

/// One host's command channel. Remote hosts go through the system `ssh`
/// binary; the local stage and loopback hosts run `sh -c` directly.
pub struct SshClient {
    pub host: HostRef,
    pub identity_file: Option<String>,
    /// When true, all commands run locally instead of over SSH.
    pub is_local: bool,
    pub timeout: Duration,
}

impl SshClient {
    /// Open a session: validate the identity file and, for remote hosts,
    /// probe the connection so auth and network failures surface before the
    /// first real operation.
    pub fn open(
        host: &HostRef,
        credential: &CredentialRef,
        timeout: Duration,
        force_local: bool,
    ) -> Result<Self> {
        let is_local = force_local || host.is_loopback();
        if is_local {
            log_status!("ssh", "Host '{}' is local, using local execution", host);
            return Ok(Self {
                host: host.clone(),
                identity_file: None,
                is_local,
                timeout,
            });
        }

        let identity_file = match credential.path() {
            Some(path) => {
                let expanded = shellexpand::tilde(path).to_string();
                if !std::path::Path::new(&expanded).exists() {
                    return Err(Error::ssh_identity_file_not_found(host.as_str(), expanded));
                }
                Some(expanded)
            }
            None => None,
        };

        let client = Self {
            host: host.clone(),
            identity_file,
            is_local,
            timeout,
        };
        client.probe()?;
        Ok(client)
    }

    fn probe(&self) -> Result<()> {
        let backoff_secs = [0, 2, 5]; // delays before attempt 1, 2, 3

        let mut last = CommandOutput::default();
        for attempt in 0..CONNECT_ATTEMPTS {
            let delay = backoff_secs.get(attempt as usize).copied().unwrap_or(5);
            if delay > 0 {
                log_status!(
                    "ssh",
                    "Connection to '{}' failed (attempt {}/{}), retrying in {}s...",
                    self.host,
                    attempt,
                    CONNECT_ATTEMPTS,
                    delay
                );
                thread::sleep(Duration::from_secs(delay));
            }

            last = self.execute("true")?;
            if last.success {
                return Ok(());
            }
            if is_auth_failure(&last) || !is_transient_ssh_error(&last) {
                break;
            }
        }

        if is_auth_failure(&last) {
            Err(Error::ssh_auth_failed(
                self.host.as_str(),
                last.exit_code,
                last.stderr,
            ))
        } else {
            Err(Error::ssh_connect_failed(
                self.host.as_str(),
                last.exit_code,
                last.stderr,
            ))
        }
    }

    fn build_ssh_args(&self, command: &str) -> Vec<String> {
        let mut args = Vec::new();

        if let Some(identity_file) = &self.identity_file {
            args.push("-i".to_string());
            args.push(identity_file.clone());
        }

        // Never prompt, fail fast on dead hosts, and forward the agent so the
        // remote `git pull` can use the caller's keys.
        args.extend([
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "ConnectTimeout=10".to_string(),
            "-o".to_string(),
            "ServerAliveInterval=15".to_string(),
            "-o".to_string(),
            "ServerAliveCountMax=3".to_string(),
            "-o".to_string(),
            "ForwardAgent=yes".to_string(),
        ]);

        args.push(self.host.as_str().to_string());
        args.push(command.to_string());

        args
    }

    /// Run `command` once. Non-zero exits come back as `Ok` output; only a
    /// timeout is an error here.
    pub fn execute(&self, command: &str) -> Result<CommandOutput> {
        let mut cmd = if self.is_local {
            local_shell(command)
        } else {
            let mut cmd = Command::new("ssh");
            cmd.args(self.build_ssh_args(command));
            cmd
        };

        match output_with_timeout(&mut cmd, self.timeout) {
            Ok(Some(output)) => Ok(output),
            Ok(None) => Err(Error::remote_command_timeout(RemoteCommandTimeoutDetails {
                command: command.to_string(),
                host: self.host.to_string(),
                timeout_secs: self.timeout.as_secs_f64(),
            })),
            Err(e) if self.is_local => Ok(CommandOutput::spawn_error("Command error", e)),
            Err(e) => Ok(CommandOutput::spawn_error("SSH error", e)),
        }
    }

    fn execute_local_in(&self, command: &str, dir: &str) -> Result<CommandOutput> {
        let expanded = shellexpand::tilde(dir).to_string();
        let mut cmd = local_shell(command);
        cmd.current_dir(&expanded);

        match output_with_timeout(&mut cmd, self.timeout) {
            Ok(Some(output)) => Ok(output),
            Ok(None) => Err(Error::remote_command_timeout(RemoteCommandTimeoutDetails {
                command: command.to_string(),
                host: self.host.to_string(),
                timeout_secs: self.timeout.as_secs_f64(),
            })),
            Err(e) => Ok(CommandOutput::spawn_error(
                &format!("Command error in {}", expanded),
                e,
            )),
        }
    }
}

impl RemoteSession for SshClient {
    fn host(&self) -> &HostRef {
        &self.host
    }

    fn run(&mut self, command: &str, cwd: Option<&str>) -> Result<CommandOutput> {
        if self.is_local {
            return match cwd {
                Some(dir) => self.execute_local_in(command, dir),
                None => self.execute(command),
            };
        }

        let output = self.execute(&shell::scoped_command(cwd, command))?;
        if is_transport_failure(&output) {
            return Err(Error::ssh_connect_failed(
                self.host.as_str(),
                output.exit_code,
                output.stderr,
            ));
        }
        Ok(output)
    }
}

fn local_shell(command: &str) -> Command {
    #[cfg(windows)]
    let cmd = {
        let mut cmd = Command::new("cmd");
        cmd.args(["/C", command]);
        cmd
    };

    #[cfg(not(windows))]
    let cmd = {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", command]);
        cmd
    };

    cmd
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

fn join_reader(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).to_string())
        .unwrap_or_default()
}

/// Spawn `cmd` and wait for it up to `timeout`. Returns `Ok(None)` when the
/// deadline passed; the child is killed and its pipes are abandoned.
///
/// On unix the child gets its own process group, so a terminal Ctrl-C only
/// reaches stagehand and in-flight commands run to completion.
fn output_with_timeout(
    cmd: &mut Command,
    timeout: Duration,
) -> std::io::Result<Option<CommandOutput>> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let mut child = cmd.spawn()?;
    let stdout = child.stdout.take().map(spawn_reader);
    let stderr = child.stderr.take().map(spawn_reader);

    let deadline = Instant::now() + timeout;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            // Grandchildren may still hold the pipes open; don't join readers.
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    };

    Ok(Some(CommandOutput {
        stdout: join_reader(stdout),
        stderr: join_reader(stderr),
        success: status.success(),
        exit_code: status.code().unwrap_or(-1),
    }))
}

fn is_auth_failure(output: &CommandOutput) -> bool {
    let stderr = output.stderr.to_lowercase();
    stderr.contains("permission denied") || stderr.contains("too many authentication failures")
}

/// Check if an SSH failure is a connection error rather than a remote command failure.
fn is_transient_ssh_error(output: &CommandOutput) -> bool {
    // SSH exit code 255 = connection error (not a remote command failure)
    output.exit_code == 255 || has_connection_error(output)
}

/// A command that exits 255 on its own is still a command failure; only
/// treat 255 as a dropped transport when ssh said so on stderr.
fn is_transport_failure(output: &CommandOutput) -> bool {
    output.exit_code == 255 && (is_auth_failure(output) || has_connection_error(output))
}

fn has_connection_error(output: &CommandOutput) -> bool {
    let stderr = output.stderr.to_lowercase();
    let transient_patterns = [
        "connection refused",
        "connection reset",
        "connection timed out",
        "no route to host",
        "network is unreachable",
        "temporary failure in name resolution",
        "could not resolve hostname",
        "broken pipe",
        "ssh_exchange_identification",
        "connection closed by remote host",
    ];

    transient_patterns.iter().any(|p| stderr.contains(p))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn local(timeout: Duration) -> SshClient {
        SshClient::open(&HostRef::new("127.0.0.1"), &CredentialRef::none(), timeout, false)
            .unwrap()
    }

    #[test]
    fn loopback_host_opens_without_ssh() {
        let client = local(Duration::from_secs(5));
        assert!(client.is_local);
        assert!(client.identity_file.is_none());
    }

    #[test]
    fn local_run_captures_output_and_exit_code() {
        let mut client = local(Duration::from_secs(5));
        let out = client.run("echo hello; echo oops >&2; exit 3", None).unwrap();
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr.trim(), "oops");
        assert_eq!(out.exit_code, 3);
        assert!(!out.success);
    }

    #[test]
    fn local_run_honours_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = local(Duration::from_secs(5));
        let out = client
            .run("pwd", Some(dir.path().to_str().unwrap()))
            .unwrap();
        let reported = std::fs::canonicalize(out.stdout.trim()).unwrap();
        assert_eq!(reported, std::fs::canonicalize(dir.path()).unwrap());
    }

    #[test]
    fn local_run_in_missing_directory_fails_without_error() {
        let mut client = local(Duration::from_secs(5));
        let out = client.run("true", Some("/definitely/not/here/")).unwrap();
        assert!(!out.success);
        assert_eq!(out.exit_code, -1);
    }

    #[test]
    fn slow_command_times_out() {
        let mut client = local(Duration::from_millis(200));
        let err = client.run("sleep 5", None).unwrap_err();
        assert_eq!(err.code, crate::ErrorCode::RemoteCommandTimeout);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn local_commands_run_outside_the_callers_process_group() {
        // Field 5 of /proc/<pid>/stat is the process group id.
        let mut client = local(Duration::from_secs(5));
        let out = client
            .run(r#"read -r _ _ _ _ pgrp _ < /proc/$$/stat; [ "$pgrp" = "$$" ]"#, None)
            .unwrap();
        assert!(out.success, "child shell should lead its own process group");
    }

    #[test]
    fn missing_identity_file_is_rejected_before_connecting() {
        let err = SshClient::open(
            &HostRef::new("web01.invalid"),
            &CredentialRef::identity_file("/nonexistent/id_rsa"),
            Duration::from_secs(1),
            false,
        )
        .err()
        .unwrap();
        assert_eq!(err.code, crate::ErrorCode::SshIdentityFileNotFound);
    }

    #[test]
    fn ssh_args_end_with_host_and_command() {
        let client = SshClient {
            host: HostRef::new("dev01"),
            identity_file: Some("/home/me/.ssh/id_rsa".to_string()),
            is_local: false,
            timeout: Duration::from_secs(1),
        };
        let args = client.build_ssh_args("git pull origin develop");
        assert_eq!(args[0], "-i");
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.contains(&"ForwardAgent=yes".to_string()));
        assert_eq!(args[args.len() - 2], "dev01");
        assert_eq!(args[args.len() - 1], "git pull origin develop");
    }

    #[test]
    fn transient_detection() {
        let refused = CommandOutput {
            stderr: "ssh: connect to host x port 22: Connection refused".to_string(),
            exit_code: 255,
            ..Default::default()
        };
        let remote_fail = CommandOutput {
            stderr: "fatal: couldn't find remote ref".to_string(),
            exit_code: 1,
            ..Default::default()
        };
        assert!(is_transient_ssh_error(&refused));
        assert!(!is_transient_ssh_error(&remote_fail));
        assert!(is_auth_failure(&CommandOutput {
            stderr: "git@host: Permission denied (publickey).".to_string(),
            exit_code: 255,
            ..Default::default()
        }));
    }

    #[test]
    fn command_exiting_255_is_not_a_transport_failure() {
        let command_exit = CommandOutput {
            stdout: "partial output".to_string(),
            stderr: "script gave up".to_string(),
            exit_code: 255,
            ..Default::default()
        };
        assert!(!is_transport_failure(&command_exit));

        let dropped = CommandOutput {
            stderr: "Connection closed by remote host".to_string(),
            exit_code: 255,
            ..Default::default()
        };
        assert!(is_transport_failure(&dropped));

        let refused_but_exit_1 = CommandOutput {
            stderr: "curl: connection refused".to_string(),
            exit_code: 1,
            ..Default::default()
        };
        assert!(!is_transport_failure(&refused_but_exit_1));
    }
}
