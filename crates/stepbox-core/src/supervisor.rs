//! Process supervision with graceful-then-forced shutdown.
//!
//! Each supervised process gets two tasks: an exit watcher that owns the
//! child and reports how it ended, and a stop-race watcher that turns a stop
//! request (or cancellation) into SIGTERM, a grace window and, if needed, a
//! forced kill.

use crate::config::SupervisorConfig;
use crate::error::{CoreError, Result};
use crate::output::{pump, OutputBuffer, OutputLogs};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::fmt;
use std::io::{self, Write};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// A signal that fires at most once and can be awaited by any number of tasks.
#[derive(Debug, Clone)]
pub struct Latch {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

impl Latch {
    /// Create an unfired latch.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Fire the latch. Returns `true` only for the call that fired it.
    pub fn fire(&self) -> bool {
        !self.tx.send_replace(true)
    }

    /// Whether the latch has fired.
    pub fn is_fired(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the latch fires. Returns immediately if it already has.
    pub async fn fired(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|fired| *fired).await;
    }
}

/// Unique identifier for a supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessId(Uuid);

impl ProcessId {
    /// Generate a new random process ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ProcessId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Process is running and no stop was requested.
    Running,
    /// A stop was requested; waiting for the process to exit.
    Stopping,
    /// Process has exited (naturally or killed).
    Exited,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessState::Running => write!(f, "running"),
            ProcessState::Stopping => write!(f, "stopping"),
            ProcessState::Exited => write!(f, "exited"),
        }
    }
}

/// Termination statistics for one process.
#[derive(Debug, Default)]
pub struct ProcessStats {
    term_signals: AtomicU32,
    killed: AtomicBool,
}

impl ProcessStats {
    /// Number of graceful termination signals delivered.
    pub fn term_signals(&self) -> u32 {
        self.term_signals.load(Ordering::Relaxed)
    }

    /// Whether the grace window expired and the process was force-killed.
    pub fn killed(&self) -> bool {
        self.killed.load(Ordering::Relaxed)
    }
}

/// State shared between a process handle and its watcher tasks.
#[derive(Debug)]
struct Shared {
    command: String,
    pid: Option<u32>,
    stop: Latch,
    stopped: Latch,
    kill: Latch,
    exit: OnceLock<ExitStatus>,
    stats: ProcessStats,
    notes: Option<OutputBuffer>,
}

impl Shared {
    /// Write a supervisory line to the stderr sink, if output is captured.
    fn note(&self, message: &str) {
        if let Some(sink) = &self.notes {
            let line = format!("> {message}\n");
            let _ = sink.clone().write_all(line.as_bytes());
        }
    }
}

/// Starts external commands and watches over them.
#[derive(Debug, Clone, Default)]
pub struct Supervisor {
    config: SupervisorConfig,
    cancel: Latch,
}

impl Supervisor {
    /// Create a supervisor with the given configuration.
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            cancel: Latch::new(),
        }
    }

    /// Attach an external cancellation latch. Firing it stops every process
    /// started by this supervisor, exactly as `request_stop` would.
    pub fn with_cancellation(mut self, cancel: Latch) -> Self {
        self.cancel = cancel;
        self
    }

    /// Get the supervisor configuration.
    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Spawn `cmd` and start watching it.
    ///
    /// With `logs`, stdout and stderr are captured under
    /// `stdout: <cmd>` / `stderr: <cmd>`; otherwise they are inherited.
    /// Must be called from within a tokio runtime.
    pub fn start(&self, mut cmd: Command, logs: Option<&mut OutputLogs>) -> Result<SupervisedProcess> {
        let command = describe(&cmd);
        let sinks = logs.map(|logs| logs.attach(&command));
        if sinks.is_some() {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        }

        let started_at = Utc::now();
        let notes = sinks.as_ref().map(|(_, stderr)| stderr.clone());
        if let Some(sink) = &notes {
            let line = format!("> start {} {}\n", started_at.to_rfc3339(), command);
            let _ = sink.clone().write_all(line.as_bytes());
        }

        let mut child = cmd.spawn().map_err(|source| {
            tracing::warn!(command = %command, error = %source, "Failed to start process");
            CoreError::Launch {
                command: command.clone(),
                source,
            }
        })?;
        let pid = child.id();

        let mut pumps = Vec::new();
        if let Some((stdout_sink, stderr_sink)) = sinks {
            if let Some(stdout) = child.stdout.take() {
                pumps.push(tokio::spawn(pump(stdout, stdout_sink)));
            }
            if let Some(stderr) = child.stderr.take() {
                pumps.push(tokio::spawn(pump(stderr, stderr_sink)));
            }
        }

        let id = ProcessId::new();
        tracing::info!(process_id = %id, command = %command, pid, "Process started");

        let shared = Arc::new(Shared {
            command,
            pid,
            stop: Latch::new(),
            stopped: Latch::new(),
            kill: Latch::new(),
            exit: OnceLock::new(),
            stats: ProcessStats::default(),
            notes,
        });

        let waiter = tokio::spawn(watch_exit(
            child,
            pumps,
            Arc::clone(&shared),
            self.config.grace_period,
        ));
        let racer = tokio::spawn(watch_stop(
            Arc::clone(&shared),
            self.cancel.clone(),
            self.config.grace_period,
        ));

        Ok(SupervisedProcess {
            id,
            started_at,
            shared,
            waiter,
            racer,
        })
    }

    /// Run `cmd` to completion. A non-zero exit is an error.
    pub async fn run(&self, cmd: Command, logs: Option<&mut OutputLogs>) -> Result<()> {
        let process = self.start(cmd, logs)?;
        process.stopped().await;
        process.release().await
    }
}

/// Handle to a running (or finished) supervised process.
///
/// Dropping the handle without calling [`release`](Self::release) leaves the
/// process and its watchers running.
#[derive(Debug)]
pub struct SupervisedProcess {
    id: ProcessId,
    started_at: DateTime<Utc>,
    shared: Arc<Shared>,
    waiter: JoinHandle<Result<()>>,
    racer: JoinHandle<Result<()>>,
}

impl SupervisedProcess {
    /// Get the process ID assigned by the supervisor.
    pub fn id(&self) -> ProcessId {
        self.id
    }

    /// OS process id, if the OS reported one.
    pub fn pid(&self) -> Option<u32> {
        self.shared.pid
    }

    /// Debug rendering of the command line.
    pub fn command(&self) -> &str {
        &self.shared.command
    }

    /// When the process was started.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ProcessState {
        if self.shared.stopped.is_fired() {
            ProcessState::Exited
        } else if self.shared.stop.is_fired() {
            ProcessState::Stopping
        } else {
            ProcessState::Running
        }
    }

    /// Whether the process has exited.
    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.is_fired()
    }

    /// Exit status, once the process has exited.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.shared.exit.get().copied()
    }

    /// Exit code, once the process has exited. `None` if it was ended by a
    /// signal.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_status().and_then(|status| status.code())
    }

    /// Termination statistics.
    pub fn stats(&self) -> &ProcessStats {
        &self.shared.stats
    }

    /// Wait until the process has exited.
    ///
    /// Captured output may still be draining at this point; it is complete
    /// once [`release`](Self::release) returns.
    pub async fn stopped(&self) {
        self.shared.stopped.fired().await
    }

    /// Ask the process to stop. Safe to call any number of times.
    pub fn request_stop(&self) {
        if self.shared.stop.fire() {
            tracing::debug!(process_id = %self.id, "Stop requested");
        }
    }

    /// Stop the process and wait for both watchers.
    ///
    /// Returns the exit watcher's error first, then the stop watcher's.
    pub async fn release(self) -> Result<()> {
        self.request_stop();
        let waited = self.waiter.await.map_err(CoreError::from).and_then(|r| r);
        let raced = self.racer.await.map_err(CoreError::from).and_then(|r| r);
        waited.and(raced)
    }
}

/// Owns the child: waits for exit or a kill request, then publishes the result.
///
/// `stopped` fires as soon as the child is reaped. Output pumps are drained
/// afterwards for at most `drain`, since a background grandchild may hold
/// the pipes open long after the child itself is gone.
async fn watch_exit(
    mut child: Child,
    mut pumps: Vec<JoinHandle<io::Result<u64>>>,
    shared: Arc<Shared>,
    drain: Duration,
) -> Result<()> {
    let waited = tokio::select! {
        status = child.wait() => status,
        _ = shared.kill.fired() => {
            if let Err(e) = child.start_kill() {
                tracing::warn!(command = %shared.command, error = %e, "Failed to kill process");
            }
            child.wait().await
        }
    };

    let result = match waited {
        Ok(status) => {
            let _ = shared.exit.set(status);
            shared.note(&format!("stopped {} {}", Utc::now().to_rfc3339(), status));
            tracing::info!(command = %shared.command, pid = shared.pid, %status, "Process exited");
            if status.success() {
                Ok(())
            } else {
                Err(CoreError::Exited {
                    command: shared.command.clone(),
                    status,
                })
            }
        }
        Err(source) => Err(CoreError::Wait {
            command: shared.command.clone(),
            source,
        }),
    };

    // Checked before `stopped` fires so a stop issued after exit can't hide
    // a failure that already happened.
    let stop_requested = shared.stop.is_fired();
    shared.stopped.fire();

    let drained = tokio::time::timeout(drain, join_all(pumps.iter_mut())).await;
    match drained {
        Ok(results) => {
            for pumped in results {
                match pumped {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => tracing::warn!(command = %shared.command, error = %e, "Output pump failed"),
                    Err(e) => tracing::warn!(command = %shared.command, error = ?e, "Output pump panicked"),
                }
            }
        }
        Err(_) => {
            tracing::warn!(
                command = %shared.command,
                drain_ms = drain.as_millis() as u64,
                "Output still open after exit, abandoning pumps"
            );
            for pump in &pumps {
                pump.abort();
            }
        }
    }

    if stop_requested {
        Ok(())
    } else {
        result
    }
}

/// Turns a stop request or cancellation into SIGTERM, a grace window and a
/// forced kill.
async fn watch_stop(shared: Arc<Shared>, cancel: Latch, grace: Duration) -> Result<()> {
    tokio::select! {
        biased;

        _ = shared.stopped.fired() => return Ok(()),
        _ = shared.stop.fired() => {}
        _ = cancel.fired() => {
            tracing::info!(command = %shared.command, "Cancelled, stopping process");
            shared.stop.fire();
        }
    }

    // A reaped pid may already belong to someone else.
    if shared.stopped.is_fired() || shared.exit.get().is_some() {
        return Ok(());
    }

    if let Some(pid) = shared.pid {
        shared.note(&format!("sending sigterm {}", Utc::now().to_rfc3339()));
        match send_terminate(pid) {
            Ok(()) => {
                shared.stats.term_signals.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(command = %shared.command, pid, "Sent SIGTERM");
            }
            Err(e) => tracing::warn!(command = %shared.command, pid, error = %e, "Failed to send SIGTERM"),
        }
    }

    let started = Instant::now();
    tokio::select! {
        _ = shared.stopped.fired() => {
            tracing::debug!(
                command = %shared.command,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Process stopped within grace period"
            );
        }
        _ = tokio::time::sleep(grace) => {
            tracing::warn!(
                command = %shared.command,
                grace_ms = grace.as_millis() as u64,
                "Grace period expired, killing process"
            );
            shared.stats.killed.store(true, Ordering::Relaxed);
            shared.kill.fire();
        }
    }

    Ok(())
}

#[cfg(unix)]
fn send_terminate(pid: u32) -> io::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid = i32::try_from(pid).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    kill(Pid::from_raw(pid), Signal::SIGTERM).map_err(io::Error::from)
}

#[cfg(not(unix))]
fn send_terminate(_pid: u32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "graceful termination is not available on this platform",
    ))
}

fn describe(cmd: &Command) -> String {
    format!("{:?}", cmd.as_std())
}

/// Interval between connection attempts in [`wait_socket`].
#[cfg(unix)]
const SOCKET_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Wait until a unix socket served by `process` accepts connections.
///
/// Fails early with [`CoreError::ProcessStopped`] if the process exits first.
#[cfg(unix)]
pub async fn wait_socket(
    path: &std::path::Path,
    timeout: Duration,
    process: &SupervisedProcess,
) -> Result<()> {
    let start = Instant::now();
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        if process.is_stopped() {
            return Err(CoreError::ProcessStopped {
                command: process.command().to_string(),
                path: path.to_path_buf(),
            });
        }

        match tokio::net::UnixStream::connect(path).await {
            Ok(_) => {
                tracing::debug!(
                    path = %path.display(),
                    attempts,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Socket ready"
                );
                return Ok(());
            }
            Err(e) => {
                if start.elapsed() >= timeout {
                    tracing::warn!(path = %path.display(), attempts, error = %e, "Socket not ready in time");
                    return Err(CoreError::SocketTimeout {
                        path: path.to_path_buf(),
                        timeout,
                    });
                }
                tracing::trace!(path = %path.display(), attempts, error = %e, "Socket not ready, retrying");
                tokio::time::sleep(SOCKET_RETRY_INTERVAL).await;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    const TEST_TIMEOUT: Duration = Duration::from_secs(10);

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    fn supervisor(grace: Duration) -> Supervisor {
        Supervisor::new(SupervisorConfig::builder().grace_period(grace).build().unwrap())
    }

    #[test]
    fn test_latch_fires_once() {
        let latch = Latch::new();
        assert!(!latch.is_fired());
        assert!(latch.fire());
        assert!(!latch.fire());
        assert!(latch.clone().is_fired());
    }

    #[tokio::test]
    async fn test_latch_wakes_waiters() {
        let latch = Latch::new();
        let waiter = {
            let latch = latch.clone();
            tokio::spawn(async move { latch.fired().await })
        };
        latch.fire();
        tokio::time::timeout(TEST_TIMEOUT, waiter).await.unwrap().unwrap();
        // already fired: returns immediately
        latch.fired().await;
    }

    #[tokio::test]
    async fn test_start_captures_output() {
        let mut logs = OutputLogs::new();
        let process = supervisor(Duration::from_secs(5))
            .start(sh("echo out; echo err >&2"), Some(&mut logs))
            .unwrap();
        let command = process.command().to_string();

        tokio::time::timeout(TEST_TIMEOUT, process.stopped()).await.unwrap();
        assert_eq!(process.state(), ProcessState::Exited);
        assert_eq!(process.exit_code(), Some(0));
        process.release().await.unwrap();

        assert_eq!(logs.stdout(&command).as_deref(), Some("out\n"));
        let stderr = logs.stderr(&command).unwrap();
        assert!(stderr.contains("> start "));
        assert!(stderr.contains("err\n"));
        assert!(stderr.contains("> stopped "));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_reported() {
        let process = supervisor(Duration::from_secs(5)).start(sh("exit 3"), None).unwrap();
        tokio::time::timeout(TEST_TIMEOUT, process.stopped()).await.unwrap();
        assert_eq!(process.exit_code(), Some(3));

        let err = process.release().await.unwrap_err();
        match err {
            CoreError::Exited { status, .. } => assert_eq!(status.code(), Some(3)),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_run_reports_failure() {
        let supervisor = supervisor(Duration::from_secs(5));
        supervisor.run(sh("true"), None).await.unwrap();
        assert!(matches!(
            supervisor.run(sh("false"), None).await,
            Err(CoreError::Exited { .. })
        ));
    }

    #[tokio::test]
    async fn test_launch_failure() {
        let result = supervisor(Duration::from_secs(5))
            .start(Command::new("/nonexistent/stepbox-missing-binary"), None);
        assert!(matches!(result, Err(CoreError::Launch { .. })));
    }

    #[tokio::test]
    async fn test_stop_twice_sends_one_signal() {
        let process = supervisor(Duration::from_secs(5))
            .start(sh("exec sleep 30"), None)
            .unwrap();
        assert_eq!(process.state(), ProcessState::Running);

        process.request_stop();
        process.request_stop();
        assert_ne!(process.state(), ProcessState::Running);

        tokio::time::timeout(TEST_TIMEOUT, process.stopped()).await.unwrap();
        assert_eq!(process.stats().term_signals(), 1);
        assert!(!process.stats().killed());
        assert_eq!(process.exit_code(), None);

        // stop was requested, so the signal exit is not an error
        tokio::time::timeout(TEST_TIMEOUT, process.release())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_grace_expiry_forces_kill() {
        let mut logs = OutputLogs::new();
        let process = supervisor(Duration::from_millis(300))
            .start(
                sh("trap '' TERM; echo ready; exec sleep 30"),
                Some(&mut logs),
            )
            .unwrap();
        let command = process.command().to_string();

        let ready = async {
            while !logs.stdout(&command).unwrap_or_default().contains("ready") {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(TEST_TIMEOUT, ready).await.unwrap();

        process.request_stop();
        tokio::time::timeout(TEST_TIMEOUT, process.stopped()).await.unwrap();
        assert_eq!(process.stats().term_signals(), 1);
        assert!(process.stats().killed());
        process.release().await.unwrap();

        assert!(logs.stderr(&command).unwrap().contains("> sending sigterm"));
    }

    #[tokio::test]
    async fn test_background_child_does_not_hold_up_exit() {
        let grace = Duration::from_millis(300);
        let mut logs = OutputLogs::new();
        let process = supervisor(grace)
            .start(sh("sleep 8 & echo hi"), Some(&mut logs))
            .unwrap();
        let command = process.command().to_string();

        tokio::time::timeout(Duration::from_secs(2), process.stopped())
            .await
            .expect("stopped should fire once the shell exits");
        assert_eq!(process.state(), ProcessState::Exited);
        assert_eq!(process.exit_code(), Some(0));

        let started = Instant::now();
        tokio::time::timeout(grace + Duration::from_secs(2), process.release())
            .await
            .expect("release should not wait on the background child")
            .unwrap();
        assert!(started.elapsed() < grace + Duration::from_secs(2));
        assert!(logs.stdout(&command).unwrap().contains("hi"));
    }

    #[tokio::test]
    async fn test_stop_after_exit_sends_nothing() {
        let process = supervisor(Duration::from_secs(5)).start(sh("true"), None).unwrap();
        tokio::time::timeout(TEST_TIMEOUT, process.stopped()).await.unwrap();

        process.request_stop();
        assert_eq!(process.state(), ProcessState::Exited);

        let stats = Arc::clone(&process.shared);
        process.release().await.unwrap();
        assert_eq!(stats.stats.term_signals(), 0);
        assert!(!stats.stats.killed());
    }

    #[tokio::test]
    async fn test_cancellation_acts_as_stop() {
        let cancel = Latch::new();
        let process = supervisor(Duration::from_secs(5))
            .with_cancellation(cancel.clone())
            .start(sh("exec sleep 30"), None)
            .unwrap();

        cancel.fire();
        tokio::time::timeout(TEST_TIMEOUT, process.stopped()).await.unwrap();
        assert_eq!(process.stats().term_signals(), 1);
        process.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_socket_ready() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ready.sock");
        let _listener = tokio::net::UnixListener::bind(&path).unwrap();

        let process = supervisor(Duration::from_secs(5))
            .start(sh("exec sleep 30"), None)
            .unwrap();
        wait_socket(&path, Duration::from_secs(2), &process).await.unwrap();
        process.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_socket_fails_when_process_stops() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("never.sock");

        let process = supervisor(Duration::from_secs(5)).start(sh("true"), None).unwrap();
        tokio::time::timeout(TEST_TIMEOUT, process.stopped()).await.unwrap();

        let err = wait_socket(&path, Duration::from_secs(2), &process)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ProcessStopped { .. }));
        process.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_socket_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("never.sock");

        let process = supervisor(Duration::from_secs(5))
            .start(sh("exec sleep 30"), None)
            .unwrap();
        let err = wait_socket(&path, Duration::from_millis(200), &process)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::SocketTimeout { .. }));
        process.release().await.unwrap();
    }
}
