use crate::model::{GenerationConfig, RunId, SessionState};
use crate::orchestrator::results::AudioFile;
use crate::orchestrator::{PanelEvent, PollUpdate, ProcessedRun};
use std::path::PathBuf;
use std::time::Instant;

pub const TAB_LOGS: usize = 0;
pub const TAB_RESULTS: usize = 1;
pub const TAB_PARAMETERS: usize = 2;
pub const TAB_HELP: usize = 3;
pub const TAB_COUNT: usize = 4;

pub struct UiState {
    pub tab: usize,
    pub info: String,
    pub session: SessionState,

    /// Everything the current run printed, one line per `\n`.
    pub log: String,
    /// Lines scrolled up from the tail; 0 follows new output.
    pub log_scroll: usize,
    pub audio: Option<PathBuf>,
    pub run_id: Option<RunId>,
    pub run_started: Option<Instant>,
    /// Set by `Finished`; post-processing waits for the final poll.
    pub finished: Option<bool>,

    pub results: Vec<AudioFile>,
    pub results_selected: usize,
    pub results_scroll_offset: usize,

    pub cfg: GenerationConfig,
    pub preset_path: Option<PathBuf>,
}

impl UiState {
    pub fn new(cfg: GenerationConfig, preset_path: Option<PathBuf>) -> Self {
        Self {
            tab: TAB_LOGS,
            info: String::new(),
            session: SessionState::Idle,
            log: String::new(),
            log_scroll: 0,
            audio: None,
            run_id: None,
            run_started: None,
            finished: None,
            results: Vec::new(),
            results_selected: 0,
            results_scroll_offset: 0,
            cfg,
            preset_path,
        }
    }

    pub fn apply_event(&mut self, ev: PanelEvent) {
        match ev {
            PanelEvent::Started { run_id, message } => {
                // A new run owns a fresh log.
                self.log.clear();
                self.log_scroll = 0;
                self.audio = None;
                self.run_id = Some(run_id);
                self.run_started = Some(Instant::now());
                self.finished = None;
                self.session = SessionState::Running(run_id);
                self.info = message;
            }
            PanelEvent::Status(msg) => {
                self.info = msg;
            }
            PanelEvent::Finished { run_id, cancelled } => {
                if self.run_id == Some(run_id) {
                    self.finished = Some(cancelled);
                }
            }
        }
    }

    pub fn apply_poll(&mut self, update: PollUpdate) {
        self.log = update.log;
        self.audio = update.audio;
    }

    /// Take the log and audio out for `SessionController::poll`, which hands them back.
    pub fn take_for_poll(&mut self) -> (String, Option<PathBuf>) {
        (std::mem::take(&mut self.log), self.audio.take())
    }

    pub fn apply_processed(&mut self, processed: ProcessedRun, cancelled: bool) {
        self.audio = processed.audio;
        self.set_results(processed.results);
        self.run_started = None;
        self.info = if cancelled {
            "Run stopped.".into()
        } else {
            processed.messages.last().cloned().unwrap_or_default()
        };
    }

    pub fn set_results(&mut self, results: Vec<AudioFile>) {
        self.results = results;
        if self.results_selected >= self.results.len() {
            self.results_selected = self.results.len().saturating_sub(1);
        }
        if self.results_scroll_offset > self.results_selected {
            self.results_scroll_offset = self.results_selected;
        }
    }

    pub fn selected_result(&self) -> Option<&AudioFile> {
        self.results.get(self.results_selected)
    }

    pub fn select_up(&mut self) {
        if self.results_selected > 0 {
            self.results_selected -= 1;
            if self.results_selected < self.results_scroll_offset {
                self.results_scroll_offset = self.results_selected;
            }
        }
    }

    pub fn select_down(&mut self, visible: usize) {
        if self.results_selected + 1 < self.results.len() {
            self.results_selected += 1;
            let visible = visible.max(1);
            if self.results_selected >= self.results_scroll_offset + visible {
                self.results_scroll_offset = self.results_selected + 1 - visible;
            }
        }
    }

    pub fn scroll_log_up(&mut self, lines: usize) {
        let total = self.log.lines().count();
        self.log_scroll = (self.log_scroll + lines).min(total.saturating_sub(1));
    }

    pub fn scroll_log_down(&mut self, lines: usize) {
        self.log_scroll = self.log_scroll.saturating_sub(lines);
    }

    /// The `height` lines ending `log_scroll` lines above the tail, oldest first.
    pub fn visible_log(&self, height: usize) -> Vec<&str> {
        let body = self.log.strip_suffix('\n').unwrap_or(&self.log);
        if body.is_empty() {
            return Vec::new();
        }
        let mut lines: Vec<&str> = body
            .rsplit('\n')
            .skip(self.log_scroll)
            .take(height)
            .collect();
        lines.reverse();
        lines
    }

    pub fn elapsed_secs(&self) -> Option<u64> {
        self.run_started.map(|t| t.elapsed().as_secs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    fn state() -> UiState {
        UiState::new(GenerationConfig::default(), None)
    }

    fn file(name: &str) -> AudioFile {
        AudioFile {
            path: PathBuf::from(name),
            modified: SystemTime::UNIX_EPOCH,
            bytes: 1,
        }
    }

    #[test]
    fn started_resets_the_previous_log() {
        let mut s = state();
        s.log = "old\n".into();
        s.audio = Some("/old.mp3".into());
        s.apply_event(PanelEvent::Started {
            run_id: 7,
            message: "Inference started.".into(),
        });
        assert!(s.log.is_empty());
        assert_eq!(s.audio, None);
        assert_eq!(s.session, SessionState::Running(7));

        s.apply_event(PanelEvent::Finished {
            run_id: 8,
            cancelled: false,
        });
        assert_eq!(s.finished, None);
        s.apply_event(PanelEvent::Finished {
            run_id: 7,
            cancelled: true,
        });
        assert_eq!(s.finished, Some(true));
    }

    #[test]
    fn visible_log_follows_the_tail_and_scrolls() {
        let mut s = state();
        s.log = (0..10).map(|i| format!("l{i}\n")).collect();
        assert_eq!(s.visible_log(3), vec!["l7", "l8", "l9"]);

        s.scroll_log_up(2);
        assert_eq!(s.visible_log(3), vec!["l5", "l6", "l7"]);
        s.scroll_log_up(100);
        assert_eq!(s.visible_log(3), vec!["l0"]);
        s.scroll_log_down(100);
        assert_eq!(s.log_scroll, 0);

        s.log.clear();
        assert!(s.visible_log(3).is_empty());
    }

    #[test]
    fn selection_stays_in_bounds() {
        let mut s = state();
        s.set_results(vec![file("a.mp3"), file("b.mp3"), file("c.mp3")]);
        s.select_down(2);
        s.select_down(2);
        s.select_down(2);
        assert_eq!(s.results_selected, 2);
        assert_eq!(s.results_scroll_offset, 1);

        s.set_results(vec![file("a.mp3")]);
        assert_eq!(s.results_selected, 0);
        assert_eq!(s.selected_result().map(AudioFile::file_name).as_deref(), Some("a.mp3"));
        s.select_up();
        assert_eq!(s.results_selected, 0);
    }
}
