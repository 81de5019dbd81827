//! Background read loop for one run.

use super::{Registry, RunHandle};
use crate::extract::{decode_line, EventExtractor};
use crate::relay::RelaySender;
use std::sync::Arc;
use tempfile::TempPath;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::unix::pipe;
use tokio::process::Child;
use tokio::sync::watch;

/// State moved into the capture task. The task is the only reader of the run's output.
pub(super) struct Capture {
    pub child: Child,
    pub output: pipe::Receiver,
    pub handle: Arc<RunHandle>,
    pub registry: Registry,
    pub relay: RelaySender,
    pub extractor: Arc<dyn EventExtractor>,
    pub scratch: Vec<TempPath>,
    pub exited_tx: watch::Sender<bool>,
}

impl Capture {
    pub(super) async fn run(self) {
        let Capture {
            mut child,
            output,
            handle,
            registry,
            relay,
            extractor,
            scratch,
            exited_tx,
        } = self;
        let pid = handle.pid();

        let mut reader = BufReader::new(output);
        let mut buf = Vec::with_capacity(512);
        let mut lines = 0usize;
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = decode_line(&buf);
                    let event = extractor.extract(&line);
                    relay.push_line(line);
                    if let Some(ev) = event {
                        tracing::info!(pid, path = %ev.path.display(), "artifact reported");
                        relay.push_artifact(ev);
                    }
                    lines += 1;
                }
                Err(e) => {
                    tracing::warn!(pid, error = %e, "reading run output failed");
                    break;
                }
            }
        }

        // Reap so the child does not linger as a zombie.
        match child.wait().await {
            Ok(status) => tracing::info!(pid, %status, lines, "run exited"),
            Err(e) => tracing::warn!(pid, error = %e, "waiting for run failed"),
        }

        drop(scratch);
        // Publish exit first so a concurrent stop sees a finished run, not a missing one.
        exited_tx.send_replace(true);
        super::remove_if_current(&registry, &handle);
    }
}
