//! Host sessions.
//!
//! The executor only sees [`RemoteSession`] and [`SessionFactory`]; whether a
//! host is reached over SSH or through local process execution is decided when
//! the session is opened.

mod client;

pub use client::{CommandOutput, SshClient};

use crate::context::ExecutionContext;
use crate::error::Result;
use crate::stage::HostRef;
use crate::utils::shell;

pub trait RemoteSession: Send {
    fn host(&self) -> &HostRef;

    /// Run `command` with `cwd` as working directory and block until it exits
    /// or the session timeout elapses. A non-zero exit is returned as output;
    /// transport failures and timeouts are errors.
    fn run(&mut self, command: &str, cwd: Option<&str>) -> Result<CommandOutput>;

    /// Non-destructive existence check, relative to `cwd` when given.
    fn path_exists(&mut self, path: &str, cwd: Option<&str>) -> Result<bool> {
        let probe = format!("test -e {}", shell::quote_remote_path(path));
        Ok(self.run(&probe, cwd)?.success)
    }
}

pub trait SessionFactory: Send + Sync {
    fn open(&self, host: &HostRef, context: &ExecutionContext) -> Result<Box<dyn RemoteSession>>;
}

/// Production factory: SSH for remote hosts, local execution for the local
/// stage and loopback hosts.
#[derive(Debug, Clone, Copy, Default)]
pub struct SshSessionFactory;

impl SessionFactory for SshSessionFactory {
    fn open(&self, host: &HostRef, context: &ExecutionContext) -> Result<Box<dyn RemoteSession>> {
        let client = SshClient::open(host, &context.credential, context.timeout, context.local)?;
        Ok(Box::new(client))
    }
}
