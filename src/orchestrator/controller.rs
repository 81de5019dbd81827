//! Run lifecycle controller.
//!
//! Owns start/stop orchestration and emits events for presentation layers.

use super::session::SessionController;
use crate::model::{GenerationConfig, RunId};
use crate::runner::RunHandle;
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// Commands emitted by UI layers to control runs.
#[derive(Debug, Clone)]
pub(crate) enum UiCommand {
    Start(Box<GenerationConfig>),
    Stop,
    Quit,
}

/// Lifecycle notifications for presentation layers. Log text travels through `poll`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PanelEvent {
    Started { run_id: RunId, message: String },
    Status(String),
    Finished { run_id: RunId, cancelled: bool },
}

/// Orchestrate runs based on UI commands and emit events back to presentation layers.
pub(crate) async fn run_controller(
    session: Arc<SessionController>,
    start_on_launch: Option<GenerationConfig>,
    event_tx: UnboundedSender<PanelEvent>,
    mut cmd_rx: UnboundedReceiver<UiCommand>,
) -> Result<()> {
    let mut run: Option<Arc<RunHandle>> = None;
    let mut stop_task: Option<JoinHandle<String>> = None;
    let mut quit_pending = false;
    // Stop watchdog: if a stop takes longer than expected, keep the UI informed.
    let mut stop_deadline: Option<tokio::time::Instant> = None;
    let mut watchdog = tokio::time::interval(Duration::from_millis(500));
    let stop_budget = session.settings().grace_period + Duration::from_secs(1);

    if let Some(cfg) = start_on_launch {
        run = start(&session, &cfg, &event_tx);
    }

    loop {
        tokio::select! {
            // Once quitting, a closed channel would resolve on every turn.
            cmd = cmd_rx.recv(), if !quit_pending => {
                match cmd {
                    Some(UiCommand::Start(cfg)) => {
                        // A stopped run keeps emitting until its output closes; starting
                        // before `Finished` would mix its tail into the new log.
                        let draining = run.as_ref().is_some_and(|h| h.is_cancelled());
                        if stop_task.is_some() || draining {
                            let _ = event_tx.send(PanelEvent::Status(
                                "Still stopping the previous run…".into(),
                            ));
                        } else if let Some(handle) = start(&session, &cfg, &event_tx) {
                            run = Some(handle);
                        }
                    }
                    Some(UiCommand::Stop) => {
                        if stop_task.is_none() {
                            stop_task = Some(spawn_stop(&session, run.as_ref().map(|h| h.pid())));
                            stop_deadline = Some(tokio::time::Instant::now() + stop_budget);
                            if run.is_some() {
                                let _ = event_tx.send(PanelEvent::Status("Stopping…".into()));
                            }
                        }
                    }
                    Some(UiCommand::Quit) | None => {
                        // Quit never leaves an inference process behind.
                        quit_pending = true;
                        match &run {
                            Some(handle) if stop_task.is_none() => {
                                stop_task = Some(spawn_stop(&session, Some(handle.pid())));
                                stop_deadline = Some(tokio::time::Instant::now() + stop_budget);
                            }
                            Some(_) => {}
                            None if stop_task.is_none() => break Ok(()),
                            None => {}
                        }
                    }
                }
            }
            // The handle stays in `run` until this branch wins, so completion is never missed.
            run_id = async {
                match &run {
                    Some(handle) => {
                        handle.exited().await;
                        handle.pid()
                    }
                    None => futures::future::pending().await,
                }
            } => {
                let cancelled = run.take().is_some_and(|h| h.is_cancelled());
                let _ = event_tx.send(PanelEvent::Finished { run_id, cancelled });
                if quit_pending && stop_task.is_none() {
                    break Ok(());
                }
            }
            maybe_stopped = async {
                match stop_task.as_mut() {
                    Some(task) => task.await,
                    None => futures::future::pending().await,
                }
            } => {
                stop_task = None;
                stop_deadline = None;
                let msg = match maybe_stopped {
                    Ok(msg) => msg,
                    Err(e) => format!("Stop task failed: {e}"),
                };
                let _ = event_tx.send(PanelEvent::Status(msg));
                if quit_pending && run.as_ref().map_or(true, |h| h.has_exited()) {
                    break Ok(());
                }
            }
            _ = watchdog.tick() => {
                if let Some(deadline) = stop_deadline {
                    if tokio::time::Instant::now() >= deadline && stop_task.is_some() {
                        let _ = event_tx.send(PanelEvent::Status("Still stopping…".into()));
                        stop_deadline = None;
                    }
                }
            }
        }
    }
}

fn start(
    session: &SessionController,
    cfg: &GenerationConfig,
    event_tx: &UnboundedSender<PanelEvent>,
) -> Option<Arc<RunHandle>> {
    let outcome = session.request_start(cfg);
    match outcome.run_id {
        Some(run_id) => {
            let _ = event_tx.send(PanelEvent::Started {
                run_id,
                message: outcome.message,
            });
        }
        None => {
            let _ = event_tx.send(PanelEvent::Status(outcome.message));
        }
    }
    outcome.handle
}

/// Stopping waits out the grace period, so it runs beside the command loop.
fn spawn_stop(session: &Arc<SessionController>, run_id: Option<RunId>) -> JoinHandle<String> {
    let session = session.clone();
    tokio::spawn(async move { session.request_stop(run_id).await })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LauncherSettings;
    use tokio::sync::mpsc;

    async fn next_event(rx: &mut UnboundedReceiver<PanelEvent>) -> PanelEvent {
        tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("controller went quiet")
            .expect("controller hung up")
    }

    fn session(dir: &std::path::Path, script: &str) -> Arc<SessionController> {
        let path = dir.join("infer.sh");
        std::fs::write(&path, script).unwrap();
        let settings = LauncherSettings {
            python: "sh".into(),
            infer_script: path,
            input_dir: dir.join("inputs"),
            grace_period: Duration::from_millis(200),
            ..Default::default()
        };
        Arc::new(SessionController::new(settings).unwrap())
    }

    fn config(dir: &std::path::Path) -> GenerationConfig {
        GenerationConfig {
            genre: "rock".into(),
            lyrics: "[chorus] hey".into(),
            output_dir: dir.join("out"),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn start_finish_then_quit() {
        let dir = tempfile::tempdir().unwrap();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let ctl = tokio::spawn(run_controller(
            session(dir.path(), "echo hi\n"),
            None,
            event_tx,
            cmd_rx,
        ));

        cmd_tx.send(UiCommand::Start(Box::new(config(dir.path())))).unwrap();
        let PanelEvent::Started { run_id, .. } = next_event(&mut event_rx).await else {
            panic!("expected Started");
        };
        assert_eq!(
            next_event(&mut event_rx).await,
            PanelEvent::Finished {
                run_id,
                cancelled: false
            }
        );

        cmd_tx.send(UiCommand::Quit).unwrap();
        ctl.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn quit_stops_the_active_run() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(dir.path(), "sleep 30\n");
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let ctl = tokio::spawn(run_controller(
            session.clone(),
            Some(config(dir.path())),
            event_tx,
            cmd_rx,
        ));

        assert!(matches!(
            next_event(&mut event_rx).await,
            PanelEvent::Started { .. }
        ));
        drop(cmd_tx);
        tokio::time::timeout(Duration::from_secs(10), ctl)
            .await
            .expect("controller did not exit")
            .unwrap()
            .unwrap();
        assert_eq!(session.state(), crate::model::SessionState::Idle);
    }

    #[tokio::test]
    async fn start_waits_until_a_stopped_run_has_drained() {
        let dir = tempfile::tempdir().unwrap();
        // The detached sleep keeps the output pipe open after the group is killed.
        let session = session(dir.path(), "setsid sleep 3 &\necho ready\nsleep 30\n");
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let ctl = tokio::spawn(run_controller(
            session.clone(),
            Some(config(dir.path())),
            event_tx,
            cmd_rx,
        ));
        let PanelEvent::Started { run_id, .. } = next_event(&mut event_rx).await else {
            panic!("expected Started");
        };

        let mut log = String::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !log.contains("ready") {
            assert!(tokio::time::Instant::now() < deadline, "run never printed");
            log = session.poll(log, None).log;
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        cmd_tx.send(UiCommand::Stop).unwrap();
        assert_eq!(
            next_event(&mut event_rx).await,
            PanelEvent::Status("Stopping…".into())
        );
        assert_eq!(
            next_event(&mut event_rx).await,
            PanelEvent::Status(crate::runner::STOPPED.into())
        );

        cmd_tx.send(UiCommand::Start(Box::new(config(dir.path())))).unwrap();
        assert_eq!(
            next_event(&mut event_rx).await,
            PanelEvent::Status("Still stopping the previous run…".into())
        );
        assert_eq!(
            next_event(&mut event_rx).await,
            PanelEvent::Finished {
                run_id,
                cancelled: true
            }
        );

        cmd_tx.send(UiCommand::Quit).unwrap();
        ctl.await.unwrap().unwrap();
    }
}
