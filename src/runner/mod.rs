//! Spawning, tracking and terminating the external inference process.

mod capture;

use crate::error::LaunchError;
use crate::extract::EventExtractor;
use crate::model::{CommandSpec, RunId};
use crate::relay::RelaySender;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tempfile::TempPath;
use time::OffsetDateTime;
use tokio::net::unix::pipe;
use tokio::process::Command;
use tokio::sync::watch;

pub const NOT_FOUND: &str = "No process found or it has already stopped.";
pub const ALREADY_FINISHED: &str = "Process already finished.";
pub const STOPPED: &str = "Inference stopped successfully.";

type Registry = Arc<Mutex<HashMap<RunId, Arc<RunHandle>>>>;

/// One in-flight execution of the inference program.
#[derive(Debug)]
pub struct RunHandle {
    pid: RunId,
    started_at: OffsetDateTime,
    spec: CommandSpec,
    cancelled: AtomicBool,
    exited: watch::Receiver<bool>,
}

impl RunHandle {
    pub fn pid(&self) -> RunId {
        self.pid
    }

    pub fn started_at(&self) -> OffsetDateTime {
        self.started_at
    }

    pub fn spec(&self) -> &CommandSpec {
        &self.spec
    }

    /// Set once a stop request has started signalling the process group.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// True once the output stream closed and the process was reaped.
    pub fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    /// Resolve once the run has exited.
    pub async fn exited(&self) {
        let mut rx = self.exited.clone();
        // The sender only drops after flagging exit, so an error also means done.
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Wait up to `limit` for the run to exit. Returns whether it did.
    pub async fn wait_exit(&self, limit: Duration) -> bool {
        let mut rx = self.exited.clone();
        let done = matches!(
            tokio::time::timeout(limit, rx.wait_for(|done| *done)).await,
            Ok(Ok(_))
        );
        done
    }
}

/// Owns the active-run registry and enforces that at most one run is active.
pub struct ProcessRunner {
    registry: Registry,
    relay: RelaySender,
    extractor: Arc<dyn EventExtractor>,
    grace_period: Duration,
}

impl ProcessRunner {
    pub fn new(
        relay: RelaySender,
        extractor: Arc<dyn EventExtractor>,
        grace_period: Duration,
    ) -> Self {
        Self {
            registry: Arc::new(Mutex::new(HashMap::new())),
            relay,
            extractor,
            grace_period,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RunId, Arc<RunHandle>>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Exited runs may linger in the registry until their capture task unregisters
    /// them; they never count as busy.
    pub fn is_busy(&self) -> bool {
        self.lock().values().any(|h| !h.has_exited())
    }

    /// The foreground run, if any.
    pub fn active(&self) -> Option<Arc<RunHandle>> {
        self.lock().values().find(|h| !h.has_exited()).cloned()
    }

    pub fn get(&self, pid: RunId) -> Option<Arc<RunHandle>> {
        self.lock().get(&pid).cloned()
    }

    /// Spawn `spec` in its own process group with stdout and stderr merged into one pipe.
    ///
    /// `scratch` files are kept alive until the process has been reaped. Must be called
    /// from within a Tokio runtime; the capture loop runs as a task on it.
    pub fn start(
        &self,
        spec: CommandSpec,
        scratch: Vec<TempPath>,
    ) -> Result<Arc<RunHandle>, LaunchError> {
        let mut active = self.lock();
        if active.values().any(|h| !h.has_exited()) {
            return Err(LaunchError::Busy);
        }
        active.retain(|_, h| !h.has_exited());

        let (reader, writer) =
            std::io::pipe().map_err(|e| LaunchError::io("create output pipe", e))?;
        let writer_err = writer
            .try_clone()
            .map_err(|e| LaunchError::io("duplicate output pipe", e))?;
        let output = pipe::Receiver::from_owned_fd(OwnedFd::from(reader))
            .map_err(|e| LaunchError::io("register output pipe", e))?;

        // The command owns our copies of the write end; dropping it at the end of this
        // block leaves the child as the only writer, so EOF means the group is done.
        let child = {
            let mut cmd = Command::new(spec.program());
            cmd.args(spec.get_args())
                .stdin(Stdio::null())
                .stdout(writer)
                .stderr(writer_err)
                .process_group(0);
            if let Some(dir) = spec.get_current_dir() {
                cmd.current_dir(dir);
            }
            for (key, value) in spec.get_env() {
                cmd.env(key, value);
            }
            cmd.spawn().map_err(|source| LaunchError::Spawn {
                program: spec.program().to_string(),
                source,
            })?
        };

        let Some(pid) = child.id() else {
            return Err(LaunchError::io(
                "track spawned process",
                std::io::Error::other("process exited before its id could be read"),
            ));
        };

        let (exited_tx, exited_rx) = watch::channel(false);
        let handle = Arc::new(RunHandle {
            pid,
            started_at: OffsetDateTime::now_utc(),
            spec,
            cancelled: AtomicBool::new(false),
            exited: exited_rx,
        });
        active.insert(pid, handle.clone());
        drop(active);

        tracing::info!(pid, command = %handle.spec.display(), "run started");

        let capture = capture::Capture {
            child,
            output,
            handle: handle.clone(),
            registry: self.registry.clone(),
            relay: self.relay.clone(),
            extractor: self.extractor.clone(),
            scratch,
            exited_tx,
        };
        tokio::spawn(capture.run());

        Ok(handle)
    }

    /// Terminate the process group of `pid`: SIGTERM, then SIGKILL after the grace period.
    ///
    /// Always returns a status line; signalling failures are reported, not raised.
    pub async fn stop(&self, pid: RunId) -> String {
        let Some(handle) = self.get(pid) else {
            tracing::debug!(pid, "stop requested for unknown run");
            return NOT_FOUND.to_string();
        };
        if handle.has_exited() {
            return ALREADY_FINISHED.to_string();
        }

        handle.cancelled.store(true, Ordering::Release);
        let Ok(raw) = i32::try_from(pid) else {
            return format!("Error stopping process: invalid pid {pid}");
        };
        let group = Pid::from_raw(raw);

        if let Err(e) = signal_group(group, Signal::SIGTERM) {
            tracing::warn!(pid, error = %e, "SIGTERM failed");
            return format!("Error stopping process: {e}");
        }
        if !handle.wait_exit(self.grace_period).await {
            tracing::warn!(pid, grace = ?self.grace_period, "run still alive, sending SIGKILL");
            if let Err(e) = signal_group(group, Signal::SIGKILL) {
                tracing::warn!(pid, error = %e, "SIGKILL failed");
                return format!("Error stopping process: {e}");
            }
        }

        remove_if_current(&self.registry, &handle);
        tracing::info!(pid, "run terminated");
        STOPPED.to_string()
    }
}

/// Signal a whole process group. A group that is already gone counts as success.
fn signal_group(group: Pid, signal: Signal) -> nix::Result<()> {
    match killpg(group, signal) {
        Err(Errno::ESRCH) => Ok(()),
        other => other,
    }
}

/// Remove the registry entry for `handle` if it is still the one registered under its pid.
fn remove_if_current(registry: &Registry, handle: &Arc<RunHandle>) {
    let mut map = registry.lock().unwrap_or_else(PoisonError::into_inner);
    if map
        .get(&handle.pid)
        .is_some_and(|current| Arc::ptr_eq(current, handle))
    {
        map.remove(&handle.pid);
        tracing::debug!(pid = handle.pid, "run unregistered");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::MarkerExtractor;
    use crate::model::DEFAULT_MARKER;
    use crate::relay::OutputRelay;
    use std::time::Instant;

    fn runner(grace: Duration) -> (ProcessRunner, OutputRelay) {
        let (tx, relay) = OutputRelay::new();
        let extractor = Arc::new(MarkerExtractor::new(DEFAULT_MARKER).unwrap());
        (ProcessRunner::new(tx, extractor, grace), relay)
    }

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh").arg("-c").arg(script)
    }

    async fn wait_unregistered(runner: &ProcessRunner, pid: RunId) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while runner.get(pid).is_some() {
            assert!(Instant::now() < deadline, "run {pid} never unregistered");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn captures_merged_output_and_unregisters_on_exit() {
        let (runner, mut relay) = runner(Duration::from_secs(2));
        let handle = runner
            .start(
                sh("echo out; echo err 1>&2; echo 'Created mix: /tmp/x.mp3'"),
                Vec::new(),
            )
            .unwrap();
        assert!(handle.wait_exit(Duration::from_secs(5)).await);
        assert!(!runner.is_busy());
        wait_unregistered(&runner, handle.pid()).await;

        let drained = relay.drain();
        assert_eq!(drained.lines.len(), 3);
        assert!(drained.lines.contains(&"out".to_string()));
        assert!(drained.lines.contains(&"err".to_string()));
        assert_eq!(drained.artifacts.len(), 1);
        assert_eq!(drained.artifacts[0].path, std::path::Path::new("/tmp/x.mp3"));
    }

    #[tokio::test]
    async fn second_start_is_rejected_while_active() {
        let (runner, _relay) = runner(Duration::from_millis(200));
        let first = runner.start(sh("sleep 5"), Vec::new()).unwrap();
        let second = runner.start(sh("echo never"), Vec::new());
        assert!(matches!(second, Err(LaunchError::Busy)));
        assert_eq!(runner.active().map(|h| h.pid()), Some(first.pid()));

        assert_eq!(runner.stop(first.pid()).await, STOPPED);
        assert!(!runner.is_busy());
    }

    #[tokio::test]
    async fn spawn_failure_registers_nothing() {
        let (runner, _relay) = runner(Duration::from_secs(2));
        let err = runner
            .start(CommandSpec::new("/definitely/not/here-12345"), Vec::new())
            .unwrap_err();
        assert!(matches!(err, LaunchError::Spawn { .. }), "{err}");
        assert!(!runner.is_busy());
    }

    #[tokio::test]
    async fn stop_unknown_pid_is_informational() {
        let (runner, _relay) = runner(Duration::from_secs(2));
        assert_eq!(runner.stop(999_999).await, NOT_FOUND);
    }

    #[tokio::test]
    async fn stop_escalates_when_sigterm_is_ignored() {
        let (runner, mut relay) = runner(Duration::from_millis(300));
        let handle = runner
            .start(sh("trap '' TERM; echo ready; sleep 30"), Vec::new())
            .unwrap();

        // Make sure the trap is installed before signalling.
        let deadline = Instant::now() + Duration::from_secs(5);
        while relay.drain().lines.is_empty() {
            assert!(Instant::now() < deadline, "child never became ready");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let started = Instant::now();
        let msg = runner.stop(handle.pid()).await;
        assert_eq!(msg, STOPPED);
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(handle.is_cancelled());
        assert!(!runner.is_busy());
        assert!(handle.wait_exit(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn stop_after_exit_reports_nothing_to_stop() {
        let (runner, _relay) = runner(Duration::from_secs(2));
        let handle = runner.start(sh("true"), Vec::new()).unwrap();
        assert!(handle.wait_exit(Duration::from_secs(5)).await);
        wait_unregistered(&runner, handle.pid()).await;
        assert_eq!(runner.stop(handle.pid()).await, NOT_FOUND);
    }

    #[tokio::test]
    async fn stop_of_exited_but_registered_run_reports_finished() {
        let (runner, _relay) = runner(Duration::from_secs(2));
        let handle = runner.start(sh("true"), Vec::new()).unwrap();
        assert!(handle.wait_exit(Duration::from_secs(5)).await);
        wait_unregistered(&runner, handle.pid()).await;

        // Exit is published before the entry is removed; pin that window open.
        runner.lock().insert(handle.pid(), handle.clone());
        assert!(!runner.is_busy());
        assert!(runner.active().is_none());
        assert_eq!(runner.stop(handle.pid()).await, ALREADY_FINISHED);
        assert!(!handle.is_cancelled());

        // A lingering finished entry does not block the next run.
        let next = runner.start(sh("true"), Vec::new()).unwrap();
        assert!(next.wait_exit(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn scratch_files_outlive_the_process_only() {
        let (runner, _relay) = runner(Duration::from_secs(2));
        let tmp = tempfile::NamedTempFile::new().unwrap().into_temp_path();
        let path = tmp.to_path_buf();
        let handle = runner
            .start(sh(&format!("cat '{}'", path.display())), vec![tmp])
            .unwrap();
        assert!(handle.wait_exit(Duration::from_secs(5)).await);
        assert!(!path.exists());
    }
}
