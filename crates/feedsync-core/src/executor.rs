//! Subprocess execution for readiness checks, the sync trigger and the
//! docker-compose orchestration commands.
//!
//! Three shapes are provided:
//! - [`execute`]: stdout as a lazy, finite [`LineStream`]; the exit status is
//!   checked once the stream is exhausted.
//! - [`run_captured`]: drains a stream into an [`ExecutionResult`] and fails
//!   on a non-zero exit (the `check_output` shape).
//! - [`BackgroundProcess`]: a child with inherited stdio whose liveness is
//!   polled between status checks.
//!
//! Every child is owned by exactly one value and is killed and reaped when
//! that value is dropped before the process finished. Children are also
//! registered with a [`Cancellation`] so another thread can kill and reap
//! them all, even while the owner is blocked reading their output.

use std::collections::HashMap;
use std::io::{self, BufRead, BufReader};
use std::iter::FusedIterator;
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use crate::error::{FeedSyncError, Result};

const REAP_POLL: Duration = Duration::from_millis(20);

/// Render an argv the way a user would type it, quoting empty arguments and
/// arguments containing whitespace.
pub fn display_command(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| {
            if arg.is_empty() || arg.chars().any(char::is_whitespace) {
                format!("'{}'", arg.replace('\'', r"'\''"))
            } else {
                arg.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Build a [`Command`] for `argv`, resolving the program on `PATH` first so a
/// missing binary is reported by name instead of as a bare `ENOENT`.
fn build_command(argv: &[String]) -> Result<(Command, String)> {
    let display = display_command(argv);
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| FeedSyncError::Config("command template is empty".into()))?;

    let resolved = which::which(program).map_err(|e| FeedSyncError::Spawn {
        command: display.clone(),
        source: io::Error::new(io::ErrorKind::NotFound, format!("{program}: {e}")),
    })?;

    let mut cmd = Command::new(resolved);
    cmd.args(args);
    Ok((cmd, display))
}

fn exit_code(status: ExitStatus) -> i32 {
    // Killed by signal (Unix)
    status.code().unwrap_or(-1)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

type SharedChild = Arc<Mutex<Child>>;

#[derive(Default)]
struct Registry {
    cancelled: bool,
    next_id: u64,
    children: HashMap<u64, SharedChild>,
}

/// Cloneable handle over every child spawned through it.
///
/// [`Cancellation::cancel`] kills and reaps all live children and refuses
/// later spawns with [`FeedSyncError::Cancelled`].
#[derive(Clone, Default)]
pub struct Cancellation {
    registry: Arc<Mutex<Registry>>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        lock(&self.registry).cancelled
    }

    /// Number of children currently tracked.
    pub fn live_children(&self) -> usize {
        lock(&self.registry).children.len()
    }

    pub fn cancel(&self) {
        let children = {
            let mut registry = lock(&self.registry);
            registry.cancelled = true;
            std::mem::take(&mut registry.children)
        };
        tracing::debug!(count = children.len(), "cancelling child processes");
        for child in children.into_values() {
            kill_and_reap(&mut lock(&child));
        }
    }

    fn track(&self, mut child: Child, command: &str) -> Result<TrackedChild> {
        let mut registry = lock(&self.registry);
        if registry.cancelled {
            kill_and_reap(&mut child);
            return Err(FeedSyncError::Cancelled {
                command: command.to_string(),
            });
        }
        let id = registry.next_id;
        registry.next_id += 1;
        let child = Arc::new(Mutex::new(child));
        registry.children.insert(id, Arc::clone(&child));
        Ok(TrackedChild {
            id,
            child,
            owner: self.clone(),
        })
    }
}

fn kill_and_reap(child: &mut Child) {
    if let Ok(None) = child.try_wait() {
        let _ = child.kill();
    }
    let _ = child.wait();
}

/// A child owned by one executor value and visible to its [`Cancellation`].
struct TrackedChild {
    id: u64,
    child: SharedChild,
    owner: Cancellation,
}

impl TrackedChild {
    fn try_wait(&self) -> io::Result<Option<ExitStatus>> {
        lock(&self.child).try_wait()
    }

    /// Block until the child exits. The lock is released between checks so
    /// a concurrent cancel is never held up.
    fn wait(&self) -> io::Result<ExitStatus> {
        loop {
            if let Some(status) = self.try_wait()? {
                return Ok(status);
            }
            thread::sleep(REAP_POLL);
        }
    }

    /// Kill the child if it is still running, then reap it.
    fn terminate(&self, command: &str) {
        let mut child = lock(&self.child);
        if let Ok(None) = child.try_wait() {
            tracing::debug!(command = %command, "killing unfinished process");
        }
        kill_and_reap(&mut child);
    }
}

impl Drop for TrackedChild {
    fn drop(&mut self) {
        lock(&self.owner.registry).children.remove(&self.id);
    }
}

// ---------------------------------------------------------------------------
// LineStream
// ---------------------------------------------------------------------------

/// Lines of a running command's stdout.
///
/// Yields `Ok(line)` for every line as it is produced. When stdout reaches
/// EOF the child is reaped; a non-zero exit yields exactly one
/// [`FeedSyncError::ProcessFailed`] after the last line. The stream is fused
/// and cannot be restarted.
pub struct LineStream {
    command: String,
    child: Option<TrackedChild>,
    stdout: Option<BufReader<ChildStdout>>,
}

/// Spawn `argv` with stdout captured and stderr passed through.
pub fn execute(argv: &[String], cancel: &Cancellation) -> Result<LineStream> {
    let (mut cmd, command) = build_command(argv)?;
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());

    tracing::debug!(command = %command, "spawning");
    let mut child = cmd.spawn().map_err(|source| FeedSyncError::Spawn {
        command: command.clone(),
        source,
    })?;

    let Some(stdout) = child.stdout.take() else {
        kill_and_reap(&mut child);
        return Err(FeedSyncError::Spawn {
            command,
            source: io::Error::other("stdout not captured"),
        });
    };

    let child = cancel.track(child, &command)?;
    Ok(LineStream {
        command,
        child: Some(child),
        stdout: Some(BufReader::new(stdout)),
    })
}

impl LineStream {
    /// Read the next stdout line, without its line terminator. Invalid UTF-8
    /// is replaced rather than treated as an error.
    fn read_line(&mut self) -> Option<io::Result<String>> {
        let reader = self.stdout.as_mut()?;
        let mut buf = Vec::new();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => {
                self.stdout = None;
                None
            }
            Ok(_) => {
                if buf.last() == Some(&b'\n') {
                    buf.pop();
                    if buf.last() == Some(&b'\r') {
                        buf.pop();
                    }
                }
                Some(Ok(String::from_utf8_lossy(&buf).into_owned()))
            }
            Err(e) => {
                self.stdout = None;
                Some(Err(e))
            }
        }
    }

    /// Close stdout and wait for the child. Returns `None` once reaped.
    fn reap(&mut self) -> Option<io::Result<i32>> {
        self.stdout = None;
        let child = self.child.take()?;
        Some(child.wait().map(exit_code))
    }

    /// Drain the remaining output and wait for the process, regardless of
    /// its exit status.
    pub fn collect_output(mut self) -> Result<ExecutionResult> {
        let mut lines = Vec::new();
        while let Some(line) = self.read_line() {
            lines.push(line?);
        }
        let exit_code = self.reap().transpose()?.unwrap_or(0);
        Ok(ExecutionResult {
            command: self.command.clone(),
            lines,
            exit_code,
        })
    }
}

impl Iterator for LineStream {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.read_line() {
            Some(Ok(line)) => return Some(Ok(line)),
            Some(Err(e)) => return Some(Err(FeedSyncError::Io(e))),
            None => {}
        }

        match self.reap()? {
            Ok(0) => None,
            Ok(code) => Some(Err(FeedSyncError::ProcessFailed {
                command: self.command.clone(),
                exit_code: code,
            })),
            Err(e) => Some(Err(FeedSyncError::Io(e))),
        }
    }
}

impl FusedIterator for LineStream {}

impl Drop for LineStream {
    fn drop(&mut self) {
        self.stdout = None;
        if let Some(child) = self.child.take() {
            child.terminate(&self.command);
        }
    }
}

// ---------------------------------------------------------------------------
// ExecutionResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub command: String,
    pub lines: Vec<String>,
    pub exit_code: i32,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Full captured stdout with trailing whitespace removed.
    pub fn output(&self) -> String {
        self.lines.join("\n").trim_end().to_string()
    }

    pub fn into_checked(self) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(FeedSyncError::ProcessFailed {
                command: self.command,
                exit_code: self.exit_code,
            })
        }
    }
}

/// Run `argv` to completion, capturing stdout. A non-zero exit is an error.
pub fn run_captured(argv: &[String], cancel: &Cancellation) -> Result<ExecutionResult> {
    execute(argv, cancel)?.collect_output()?.into_checked()
}

// ---------------------------------------------------------------------------
// BackgroundProcess
// ---------------------------------------------------------------------------

/// A command left running while the caller does other work.
///
/// Stdout and stderr are inherited so the command's own output reaches the
/// console. If the value is dropped while the process is still running, the
/// process is killed.
pub struct BackgroundProcess {
    command: String,
    child: TrackedChild,
    exit_code: Option<i32>,
}

impl BackgroundProcess {
    pub fn spawn(argv: &[String], cancel: &Cancellation) -> Result<Self> {
        let (mut cmd, command) = build_command(argv)?;
        cmd.stdin(Stdio::null());

        tracing::debug!(command = %command, "spawning in background");
        let child = cmd.spawn().map_err(|source| FeedSyncError::Spawn {
            command: command.clone(),
            source,
        })?;
        let child = cancel.track(child, &command)?;

        Ok(Self {
            command,
            child,
            exit_code: None,
        })
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Non-blocking liveness check: `Some(code)` once the process has exited.
    pub fn try_exit_code(&mut self) -> Result<Option<i32>> {
        if self.exit_code.is_some() {
            return Ok(self.exit_code);
        }
        if let Some(status) = self.child.try_wait()? {
            self.exit_code = Some(exit_code(status));
        }
        Ok(self.exit_code)
    }
}

impl Drop for BackgroundProcess {
    fn drop(&mut self) {
        if self.exit_code.is_none() {
            self.child.terminate(&self.command);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    fn sh(script: &str) -> Vec<String> {
        argv(&["sh", "-c", script])
    }

    fn run(script: &str) -> Result<LineStream> {
        execute(&sh(script), &Cancellation::new())
    }

    #[test]
    fn streams_lines_in_order() {
        let lines: Vec<String> = run("echo one; echo two; echo three")
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(lines, vec!["one", "two", "three"]);
    }

    #[test]
    fn non_zero_exit_fails_after_all_lines() {
        let mut stream = run("echo a; echo b; exit 3").unwrap();
        assert_eq!(stream.next().unwrap().unwrap(), "a");
        assert_eq!(stream.next().unwrap().unwrap(), "b");
        match stream.next() {
            Some(Err(FeedSyncError::ProcessFailed { exit_code, command })) => {
                assert_eq!(exit_code, 3);
                assert!(command.starts_with("sh -c"));
            }
            other => panic!("expected ProcessFailed, got {other:?}"),
        }
        assert!(stream.next().is_none());
        assert!(stream.next().is_none(), "stream must stay exhausted");
    }

    #[test]
    fn silent_failure_still_reports_exit_code() {
        let results: Vec<_> = execute(&argv(&["false"]), &Cancellation::new())
            .unwrap()
            .collect();
        assert_eq!(results.len(), 1);
        assert!(matches!(
            results[0],
            Err(FeedSyncError::ProcessFailed { exit_code: 1, .. })
        ));
    }

    #[test]
    fn missing_binary_is_spawn_error() {
        let err = execute(
            &argv(&["definitely-not-a-real-binary-xyz"]),
            &Cancellation::new(),
        )
        .err()
        .expect("spawn should fail");
        assert!(matches!(err, FeedSyncError::Spawn { .. }));
        assert!(err.to_string().contains("definitely-not-a-real-binary-xyz"));
    }

    #[test]
    fn empty_command_is_config_error() {
        assert!(matches!(
            execute(&[], &Cancellation::new()),
            Err(FeedSyncError::Config(_))
        ));
    }

    #[test]
    fn run_captured_collects_output() {
        let result = run_captured(&sh("printf 'abc123\\n'"), &Cancellation::new()).unwrap();
        assert!(result.success());
        assert_eq!(result.output(), "abc123");
    }

    #[test]
    fn run_captured_rejects_failure() {
        let err = run_captured(&sh("echo partial; exit 2"), &Cancellation::new()).unwrap_err();
        assert!(matches!(err, FeedSyncError::ProcessFailed { exit_code: 2, .. }));
    }

    #[test]
    fn collect_output_keeps_non_zero_code() {
        let result = run("echo x; exit 4").unwrap().collect_output().unwrap();
        assert_eq!(result.lines, vec!["x"]);
        assert_eq!(result.exit_code, 4);
        assert!(!result.success());
    }

    #[test]
    fn dropping_unfinished_stream_kills_child() {
        let start = Instant::now();
        let cancel = Cancellation::new();
        let mut stream = execute(&sh("echo started; sleep 30"), &cancel).unwrap();
        assert_eq!(stream.next().unwrap().unwrap(), "started");
        assert_eq!(cancel.live_children(), 1);
        drop(stream);
        assert_eq!(cancel.live_children(), 0);
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn finished_children_leave_the_registry() {
        let cancel = Cancellation::new();
        run_captured(&argv(&["true"]), &cancel).unwrap();
        assert_eq!(cancel.live_children(), 0);
    }

    #[test]
    fn cancel_from_another_thread_unblocks_reader() {
        let start = Instant::now();
        let cancel = Cancellation::new();
        let mut stream = execute(&sh("echo started; exec sleep 30"), &cancel).unwrap();
        assert_eq!(stream.next().unwrap().unwrap(), "started");

        let remote = cancel.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            remote.cancel();
        });

        // Blocks on the sleeping child until it is killed.
        match stream.next() {
            Some(Err(FeedSyncError::ProcessFailed { exit_code, .. })) => assert_eq!(exit_code, -1),
            other => panic!("expected ProcessFailed, got {other:?}"),
        }
        canceller.join().unwrap();
        assert!(cancel.is_cancelled());
        assert_eq!(cancel.live_children(), 0);
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn spawn_after_cancel_is_refused() {
        let cancel = Cancellation::new();
        cancel.cancel();
        let err = run_captured(&argv(&["true"]), &cancel).unwrap_err();
        assert!(matches!(err, FeedSyncError::Cancelled { .. }));
        let err = BackgroundProcess::spawn(&argv(&["true"]), &cancel)
            .err()
            .expect("spawn should be refused");
        assert!(matches!(err, FeedSyncError::Cancelled { .. }));
    }

    #[test]
    fn cancel_kills_background_process() {
        let cancel = Cancellation::new();
        let mut proc = BackgroundProcess::spawn(&argv(&["sleep", "30"]), &cancel).unwrap();
        assert_eq!(proc.try_exit_code().unwrap(), None);
        cancel.cancel();
        assert_eq!(proc.try_exit_code().unwrap(), Some(-1));
    }

    #[test]
    fn background_process_reports_exit_code() {
        let cancel = Cancellation::new();
        let mut ok = BackgroundProcess::spawn(&argv(&["true"]), &cancel).unwrap();
        let mut failing = BackgroundProcess::spawn(&sh("exit 1"), &cancel).unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        let (mut ok_code, mut fail_code) = (None, None);
        while (ok_code.is_none() || fail_code.is_none()) && Instant::now() < deadline {
            ok_code = ok.try_exit_code().unwrap();
            fail_code = failing.try_exit_code().unwrap();
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(ok_code, Some(0));
        assert_eq!(fail_code, Some(1));
        // Cached after the first observation.
        assert_eq!(ok.try_exit_code().unwrap(), Some(0));
    }

    #[test]
    fn background_process_still_running() {
        let start = Instant::now();
        let cancel = Cancellation::new();
        let mut proc = BackgroundProcess::spawn(&argv(&["sleep", "30"]), &cancel).unwrap();
        assert_eq!(proc.try_exit_code().unwrap(), None);
        drop(proc);
        assert_eq!(cancel.live_children(), 0);
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn display_command_quotes_awkward_args() {
        let cmd = argv(&["cli", "--feedsready", "", "pg_dump -U postgres"]);
        assert_eq!(
            display_command(&cmd),
            "cli --feedsready '' 'pg_dump -U postgres'"
        );
    }
}
