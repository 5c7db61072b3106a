//! Parallel multi-host execution.
//!
//! One worker thread per host runs the context's operation list in order on
//! its own session. A failing operation halts only that host; siblings run to
//! completion. Host-scoped errors are captured into [`SessionResult`] and
//! never returned from [`ParallelExecutor::run`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use serde::Serialize;

use crate::context::ExecutionContext;
use crate::error::{Error, ErrorCode, RemoteCommandFailedDetails};
use crate::operation::Operation;
use crate::ssh::{CommandOutput, RemoteSession, SessionFactory};
use crate::stage::HostRef;
use crate::utils::cancel::CancelFlag;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostError {
    pub code: ErrorCode,
    pub message: String,
    pub details: serde_json::Value,
}

impl From<Error> for HostError {
    fn from(err: Error) -> Self {
        Self {
            code: err.code,
            message: err.message,
            details: err.details,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationOutcome {
    pub op: Operation,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl OperationOutcome {
    fn from_output(op: &Operation, output: CommandOutput) -> Self {
        Self {
            op: op.clone(),
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
        }
    }

    fn scope(op: &Operation) -> Self {
        Self {
            op: op.clone(),
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionResult {
    pub host: HostRef,
    pub per_operation: Vec<OperationOutcome>,
    /// Index into the context's operation list where this host stopped.
    /// `Some(0)` with an empty `per_operation` means the host never got to run
    /// anything (connection failure or cancellation before dispatch), so the
    /// index does not point at an outcome. Cancellation between operations
    /// likewise leaves `failed_at` one past the last outcome. Use
    /// [`SessionResult::failed_operation`], which returns `None` in both cases,
    /// rather than indexing `per_operation` directly.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<HostError>,
    /// Set when the precondition path was missing and nothing was run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub cancelled: bool,
}

impl SessionResult {
    fn new(host: &HostRef) -> Self {
        Self {
            host: host.clone(),
            per_operation: Vec::new(),
            failed_at: None,
            error: None,
            skipped: None,
            cancelled: false,
        }
    }

    fn failed_before_start(host: &HostRef, err: Error) -> Self {
        Self {
            failed_at: Some(0),
            error: Some(err.into()),
            ..Self::new(host)
        }
    }

    fn not_dispatched(host: &HostRef) -> Self {
        Self {
            failed_at: Some(0),
            cancelled: true,
            ..Self::new(host)
        }
    }

    pub fn succeeded(&self) -> bool {
        self.failed_at.is_none()
    }

    /// The operation this host stopped at, if it failed on one.
    pub fn failed_operation(&self) -> Option<&OperationOutcome> {
        let index = self.failed_at?;
        self.per_operation.get(index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    PartialFailure,
    TotalFailure,
}

impl RunStatus {
    pub fn from_results<'a>(results: impl IntoIterator<Item = &'a SessionResult>) -> Self {
        let (mut succeeded, mut failed) = (0usize, 0usize);
        for result in results {
            if result.succeeded() {
                succeeded += 1;
            } else {
                failed += 1;
            }
        }

        if failed == 0 {
            RunStatus::Success
        } else if succeeded == 0 {
            RunStatus::TotalFailure
        } else {
            RunStatus::PartialFailure
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            RunStatus::Success => 0,
            RunStatus::TotalFailure => 20,
            RunStatus::PartialFailure => 21,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedHost {
    pub host: HostRef,
    pub failed_at: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub total_hosts: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed_hosts: Vec<FailedHost>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub stage_name: String,
    pub results: BTreeMap<HostRef, SessionResult>,
    pub overall_status: RunStatus,
    pub summary: RunSummary,
    pub started_at: String,
    pub duration_ms: u128,
}

impl RunReport {
    pub fn new(stage_name: &str, results: BTreeMap<HostRef, SessionResult>) -> Self {
        Self::with_timing(stage_name, results, chrono::Utc::now().to_rfc3339(), 0)
    }

    fn with_timing(
        stage_name: &str,
        results: BTreeMap<HostRef, SessionResult>,
        started_at: String,
        duration_ms: u128,
    ) -> Self {
        let overall_status = RunStatus::from_results(results.values());
        let summary = build_summary(&results);
        Self {
            stage_name: stage_name.to_string(),
            results,
            overall_status,
            summary,
            started_at,
            duration_ms,
        }
    }

    pub fn result_for(&self, host: &str) -> Option<&SessionResult> {
        self.results.get(&HostRef::new(host))
    }
}

fn build_summary(results: &BTreeMap<HostRef, SessionResult>) -> RunSummary {
    let failed_hosts: Vec<FailedHost> = results
        .values()
        .filter_map(|result| {
            let failed_at = result.failed_at?;
            Some(FailedHost {
                host: result.host.clone(),
                failed_at,
                operation: result.failed_operation().map(|o| o.op.to_string()),
                error: match (&result.error, result.cancelled) {
                    (Some(err), _) => Some(err.message.clone()),
                    (None, true) => Some("cancelled".to_string()),
                    (None, false) => None,
                },
            })
        })
        .collect();

    RunSummary {
        total_hosts: results.len(),
        succeeded: results.values().filter(|r| r.succeeded()).count(),
        failed: failed_hosts.len(),
        skipped: results.values().filter(|r| r.skipped.is_some()).count(),
        failed_hosts,
    }
}

pub struct ParallelExecutor {
    factory: Arc<dyn SessionFactory>,
    cancel: CancelFlag,
}

impl ParallelExecutor {
    pub fn new(factory: Arc<dyn SessionFactory>) -> Self {
        Self {
            factory,
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Fan the context's operations out over every host and block until all
    /// host workers have finished.
    pub fn run(&self, context: &ExecutionContext) -> RunReport {
        let started = Instant::now();
        let started_at = chrono::Utc::now().to_rfc3339();
        let context = Arc::new(context.clone());

        log_status!(
            "executor",
            "Running {} operation(s) on {} host(s) for stage '{}'",
            context.commands.len(),
            context.hosts.len(),
            context.stage_name
        );

        let mut handles = Vec::with_capacity(context.hosts.len());
        let mut results = BTreeMap::new();

        for host in &context.hosts {
            if self.cancel.is_cancelled() {
                log_status!("executor", "[{}] not dispatched: cancelled", host);
                results.insert(host.clone(), SessionResult::not_dispatched(host));
                continue;
            }

            let worker_host = host.clone();
            let factory = Arc::clone(&self.factory);
            let context = Arc::clone(&context);
            let cancel = self.cancel.clone();
            let handle = thread::spawn(move || {
                run_host(&worker_host, factory.as_ref(), &context, &cancel)
            });
            handles.push((host.clone(), handle));
        }

        for (host, handle) in handles {
            let result = handle.join().unwrap_or_else(|_| {
                SessionResult::failed_before_start(
                    &host,
                    Error::internal_unexpected("Host worker thread panicked"),
                )
            });
            // Each worker owns exactly one key; only this thread inserts.
            results.insert(host, result);
        }

        let report = RunReport::with_timing(
            &context.stage_name,
            results,
            started_at,
            started.elapsed().as_millis(),
        );
        log_status!(
            "executor",
            "Stage '{}': {}/{} host(s) succeeded",
            report.stage_name,
            report.summary.succeeded,
            report.summary.total_hosts
        );
        report
    }
}

/// Run every operation for one host, stopping at the first failure.
fn run_host(
    host: &HostRef,
    factory: &dyn SessionFactory,
    context: &ExecutionContext,
    cancel: &CancelFlag,
) -> SessionResult {
    let mut session = match factory.open(host, context) {
        Ok(session) => session,
        Err(err) => {
            log_status!("executor", "[{}] connection failed: {}", host, err);
            return SessionResult::failed_before_start(host, err);
        }
    };

    let mut result = SessionResult::new(host);

    if let Some(path) = &context.only_if_exists {
        let probe_scope = context.commands.iter().find_map(|op| match op {
            Operation::ChangeDir(dir) => Some(dir.as_str()),
            _ => None,
        });
        match session.path_exists(path, probe_scope) {
            Ok(true) => {}
            Ok(false) => {
                log_status!("executor", "[{}] {} does not exist, skipping", host, path);
                result.skipped = Some(format!("'{}' does not exist", path));
                return result;
            }
            Err(err) => {
                return SessionResult::failed_before_start(host, err);
            }
        }
    }

    run_operations(session.as_mut(), &context.commands, cancel, &mut result);

    if result.succeeded() {
        log_status!("executor", "[{}] done", host);
    } else if let Some(index) = result.failed_at {
        log_status!("executor", "[{}] failed at operation {}", host, index);
    }
    result
}

fn run_operations(
    session: &mut dyn RemoteSession,
    commands: &[Operation],
    cancel: &CancelFlag,
    result: &mut SessionResult,
) {
    let mut scope: Option<String> = None;

    for (index, op) in commands.iter().enumerate() {
        if cancel.is_cancelled() {
            result.cancelled = true;
            result.failed_at = Some(index);
            return;
        }

        let command = match op {
            Operation::ChangeDir(dir) => {
                scope = Some(dir.clone());
                result.per_operation.push(OperationOutcome::scope(op));
                continue;
            }
            other => other.command().unwrap_or_default(),
        };

        log_status!("executor", "[{}] {}", session.host(), op);

        match session.run(&command, scope.as_deref()) {
            Ok(output) => {
                let success = output.success;
                let outcome = OperationOutcome::from_output(op, output);
                if !success {
                    result.error = Some(
                        Error::remote_command_failed(RemoteCommandFailedDetails {
                            command: command.clone(),
                            exit_code: outcome.exit_code,
                            stdout: outcome.stdout.clone(),
                            stderr: outcome.stderr.clone(),
                            host: session.host().to_string(),
                        })
                        .into(),
                    );
                    result.per_operation.push(outcome);
                    result.failed_at = Some(index);
                    return;
                }
                result.per_operation.push(outcome);
            }
            Err(err) => {
                result.per_operation.push(OperationOutcome {
                    op: op.clone(),
                    exit_code: -1,
                    stdout: String::new(),
                    stderr: err.message.clone(),
                });
                result.error = Some(err.into());
                result.failed_at = Some(index);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(host: &str, failed_at: Option<usize>) -> SessionResult {
        SessionResult {
            failed_at,
            ..SessionResult::new(&HostRef::new(host))
        }
    }

    #[test]
    fn status_is_success_when_nothing_failed() {
        let results = [result("a", None), result("b", None)];
        assert_eq!(RunStatus::from_results(&results), RunStatus::Success);
    }

    #[test]
    fn status_is_partial_when_some_failed() {
        let results = [result("a", None), result("b", Some(1))];
        assert_eq!(RunStatus::from_results(&results), RunStatus::PartialFailure);
    }

    #[test]
    fn status_is_total_when_all_failed() {
        let results = [result("a", Some(0)), result("b", Some(3))];
        assert_eq!(RunStatus::from_results(&results), RunStatus::TotalFailure);
    }

    #[test]
    fn exit_codes_distinguish_partial_from_total() {
        assert_eq!(RunStatus::Success.exit_code(), 0);
        assert_ne!(
            RunStatus::PartialFailure.exit_code(),
            RunStatus::TotalFailure.exit_code()
        );
    }

    #[test]
    fn summary_names_failed_hosts() {
        let mut results = BTreeMap::new();
        results.insert(HostRef::new("a"), result("a", None));
        let mut skipped = result("c", None);
        skipped.skipped = Some("missing".to_string());
        results.insert(HostRef::new("c"), skipped);
        results.insert(HostRef::new("b"), SessionResult::not_dispatched(&HostRef::new("b")));

        let report = RunReport::new("staging", results);
        assert_eq!(report.overall_status, RunStatus::PartialFailure);
        assert_eq!(report.summary.succeeded, 2);
        assert_eq!(report.summary.skipped, 1);
        assert_eq!(report.summary.failed_hosts.len(), 1);
        assert_eq!(report.summary.failed_hosts[0].host.as_str(), "b");
        assert_eq!(
            report.summary.failed_hosts[0].error.as_deref(),
            Some("cancelled")
        );
    }

    #[test]
    fn failure_before_first_operation_has_no_failed_operation() {
        let host = HostRef::new("web01");
        let unreachable = SessionResult::failed_before_start(
            &host,
            Error::ssh_connect_failed("web01", 255, "Connection refused"),
        );
        assert_eq!(unreachable.failed_at, Some(0));
        assert!(unreachable.per_operation.is_empty());
        assert!(unreachable.failed_operation().is_none());

        let cancelled = SessionResult::not_dispatched(&host);
        assert!(!cancelled.succeeded());
        assert!(cancelled.failed_operation().is_none());
    }
}
