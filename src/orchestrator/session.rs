//! The start/stop/poll surface presentation layers talk to.

use crate::command;
use crate::error::LaunchError;
use crate::extract::{EventExtractor, MarkerExtractor};
use crate::model::{GenerationConfig, LauncherSettings, RunId, SessionState};
use crate::relay::OutputRelay;
use crate::runner::{ProcessRunner, RunHandle};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

pub const NOTHING_RUNNING: &str = "No process is running.";

/// Result of a start request: a status line, and the run when something was spawned.
///
/// `handle` is returned even if the run already exited, so callers never miss its end.
#[derive(Debug, Clone)]
pub struct StartOutcome {
    pub message: String,
    pub run_id: Option<RunId>,
    pub handle: Option<Arc<RunHandle>>,
}

/// Log text and audio path after a poll. `changed` is false when nothing new arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollUpdate {
    pub log: String,
    pub audio: Option<PathBuf>,
    pub changed: bool,
}

/// Owns the runner and the consumer side of the relay. One per application.
pub struct SessionController {
    runner: ProcessRunner,
    relay: Mutex<OutputRelay>,
    settings: LauncherSettings,
}

impl SessionController {
    pub fn new(settings: LauncherSettings) -> Result<Self, LaunchError> {
        let extractor = MarkerExtractor::new(&settings.marker).map_err(|e| {
            LaunchError::InvalidConfig(format!("artifact marker {:?}: {e}", settings.marker))
        })?;
        tracing::debug!(marker = extractor.marker(), "artifact extractor ready");
        Ok(Self::with_extractor(settings, Arc::new(extractor)))
    }

    pub fn with_extractor(settings: LauncherSettings, extractor: Arc<dyn EventExtractor>) -> Self {
        let (tx, relay) = OutputRelay::new();
        Self {
            runner: ProcessRunner::new(tx, extractor, settings.grace_period),
            relay: Mutex::new(relay),
            settings,
        }
    }

    pub fn settings(&self) -> &LauncherSettings {
        &self.settings
    }

    pub fn active_run(&self) -> Option<Arc<RunHandle>> {
        self.runner.active()
    }

    pub fn state(&self) -> SessionState {
        match self.active_run() {
            None => SessionState::Idle,
            Some(h) if h.is_cancelled() => SessionState::Stopping(h.pid()),
            Some(h) => SessionState::Running(h.pid()),
        }
    }

    /// Validate `cfg`, materialize its inputs, and spawn the run.
    pub fn try_start(&self, cfg: &GenerationConfig) -> Result<Arc<RunHandle>, LaunchError> {
        // Checked up front so a rejected request leaves no temp files behind.
        if self.runner.is_busy() {
            return Err(LaunchError::Busy);
        }
        let prepared = command::prepare(cfg, &self.settings)?;
        self.runner.start(prepared.spec, prepared.scratch)
    }

    pub fn request_start(&self, cfg: &GenerationConfig) -> StartOutcome {
        match self.try_start(cfg) {
            Ok(handle) => StartOutcome {
                message: format!(
                    "Inference started. Outputs will be saved in {}...",
                    cfg.output_dir.display()
                ),
                run_id: Some(handle.pid()),
                handle: Some(handle),
            },
            Err(e) => {
                if !matches!(e, LaunchError::Busy) {
                    tracing::warn!(error = %e, "run not started");
                }
                StartOutcome {
                    message: e.to_string(),
                    run_id: None,
                    handle: None,
                }
            }
        }
    }

    /// Stop `run_id`. Never fails; the returned line says what happened.
    pub async fn request_stop(&self, run_id: Option<RunId>) -> String {
        match run_id {
            Some(pid) if self.runner.is_busy() => self.runner.stop(pid).await,
            _ => NOTHING_RUNNING.to_string(),
        }
    }

    /// Append newly captured lines to `log` and take the newest reported artifact.
    pub fn poll(&self, mut log: String, audio: Option<PathBuf>) -> PollUpdate {
        let drained = self
            .relay
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain();
        if drained.is_empty() {
            return PollUpdate {
                log,
                audio,
                changed: false,
            };
        }

        for line in &drained.lines {
            log.push_str(line);
            log.push('\n');
        }
        let audio = drained.artifacts.into_iter().last().map(|ev| ev.path).or(audio);
        PollUpdate {
            log,
            audio,
            changed: true,
        }
    }
}
