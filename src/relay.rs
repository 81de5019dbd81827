//! Queues carrying captured output from a run's capture task to whoever polls.

use crate::model::ArtifactEvent;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Producer side, handed to capture tasks. Sending never blocks.
#[derive(Debug, Clone)]
pub struct RelaySender {
    lines: UnboundedSender<String>,
    artifacts: UnboundedSender<ArtifactEvent>,
}

impl RelaySender {
    pub fn push_line(&self, line: String) {
        // The consumer is gone only during shutdown; nothing left to show the line to.
        let _ = self.lines.send(line);
    }

    pub fn push_artifact(&self, event: ArtifactEvent) {
        let _ = self.artifacts.send(event);
    }
}

/// Everything that was queued at the time of a drain, in producer order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Drained {
    pub lines: Vec<String>,
    pub artifacts: Vec<ArtifactEvent>,
}

impl Drained {
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty() && self.artifacts.is_empty()
    }
}

/// Consumer side of the line and artifact queues.
#[derive(Debug)]
pub struct OutputRelay {
    lines: UnboundedReceiver<String>,
    artifacts: UnboundedReceiver<ArtifactEvent>,
}

impl OutputRelay {
    pub fn new() -> (RelaySender, OutputRelay) {
        let (lines_tx, lines_rx) = mpsc::unbounded_channel();
        let (artifacts_tx, artifacts_rx) = mpsc::unbounded_channel();
        (
            RelaySender {
                lines: lines_tx,
                artifacts: artifacts_tx,
            },
            OutputRelay {
                lines: lines_rx,
                artifacts: artifacts_rx,
            },
        )
    }

    /// Pop everything currently queued without waiting for more.
    pub fn drain(&mut self) -> Drained {
        let mut out = Drained::default();
        while let Ok(line) = self.lines.try_recv() {
            out.lines.push(line);
        }
        while let Ok(ev) = self.artifacts.try_recv() {
            out.artifacts.push(ev);
        }
        out
    }
}
