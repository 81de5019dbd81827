mod help;
mod panels;
mod state;
mod widgets;

use crate::cli::{self, Cli};
use crate::model::{GenerationConfig, LauncherSettings, SessionState};
use crate::orchestrator::{self, results, PanelEvent, SessionController, UiCommand};
use anyhow::{Context, Result};
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph, Tabs},
    Terminal,
};
use state::{UiState, TAB_COUNT, TAB_HELP, TAB_LOGS, TAB_PARAMETERS, TAB_RESULTS};
use std::path::PathBuf;
use std::sync::Arc;
use std::{io, time::Duration, time::Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use widgets::{copy_to_clipboard, wrapped_kv};

pub async fn run(args: Cli, settings: LauncherSettings, cfg: GenerationConfig) -> Result<()> {
    // Unbounded channels avoid backpressure and task switching in the hot path.
    let (event_tx, event_rx) = mpsc::unbounded_channel::<PanelEvent>();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<UiCommand>();

    let session = Arc::new(SessionController::new(settings).context("invalid launcher settings")?);
    let preset_path = cli::preset_path(&args).or_else(cli::default_preset_path);
    let start_on_launch = args.generate_on_launch.then(|| cfg.clone());

    // TUI runs in a dedicated thread to keep all blocking I/O out of the Tokio runtime.
    let ui_session = session.clone();
    let ui_handle = std::thread::spawn(move || {
        run_threaded(ui_session, cfg, preset_path, event_rx, cmd_tx)
    });

    let res = orchestrator::run_controller(session, start_on_launch, event_tx, cmd_rx).await;

    let join_res = tokio::task::spawn_blocking(move || ui_handle.join()).await;
    if let Ok(joined) = join_res {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(anyhow::anyhow!("TUI thread panicked")),
        }
    }

    res
}

/// Run the TUI loop on a dedicated thread.
///
/// The UI thread owns the poll timer: every `poll_interval` it drains the session's
/// output into its log buffer.
fn run_threaded(
    session: Arc<SessionController>,
    cfg: GenerationConfig,
    preset_path: Option<PathBuf>,
    mut event_rx: UnboundedReceiver<PanelEvent>,
    cmd_tx: UnboundedSender<UiCommand>,
) -> Result<()> {
    enable_raw_mode().context("enable raw mode")?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen).ok();

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).context("create terminal")?;
    terminal.clear().ok();

    // UiState is owned by the UI thread only; no cross-thread mutation.
    let mut state = UiState::new(cfg, preset_path);
    refresh_results(&mut state);
    let mut run_output_dir = state.cfg.output_dir.clone();
    let mut pending_output_dir: Option<PathBuf> = None;

    let tick_rate = Duration::from_millis(100);
    let poll_interval = session.settings().poll_interval;
    let mut last_tick = Instant::now();
    let mut last_poll = Instant::now();

    let res = loop {
        // Drain events without blocking to keep UI responsive; unbounded channel avoids backpressure.
        while let Ok(ev) = event_rx.try_recv() {
            if matches!(ev, PanelEvent::Started { .. }) {
                run_output_dir = pending_output_dir
                    .take()
                    .unwrap_or_else(|| state.cfg.output_dir.clone());
            }
            state.apply_event(ev);
        }

        if state.finished.is_some() || last_poll.elapsed() >= poll_interval {
            let (log, audio) = state.take_for_poll();
            state.apply_poll(session.poll(log, audio));
            state.session = session.state();
            // The run was reaped before `Finished` was sent, so this poll saw its last line.
            if let Some(cancelled) = state.finished.take() {
                let processed =
                    orchestrator::process_run_completion(&run_output_dir, state.audio.as_deref());
                state.apply_processed(processed, cancelled);
            }
            last_poll = Instant::now();
        }

        if last_tick.elapsed() >= tick_rate {
            terminal
                .draw(|f| draw(f.area(), f, &state, session.settings()))
                .ok();
            last_tick = Instant::now();
        }

        // Poll input with a short timeout to avoid blocking the render loop.
        if event::poll(Duration::from_millis(10)).unwrap_or(false) {
            if let Ok(Event::Key(k)) = event::read() {
                if k.kind != KeyEventKind::Press {
                    continue;
                }
                let page = terminal
                    .size()
                    .map(|s| (s.height as usize).saturating_sub(3 + 2 + 6))
                    .unwrap_or(10)
                    .max(1);
                match (k.modifiers, k.code) {
                    (_, KeyCode::Char('q')) | (KeyModifiers::CONTROL, KeyCode::Char('c')) => {
                        let _ = cmd_tx.send(UiCommand::Quit);
                        break Ok(());
                    }
                    (_, KeyCode::Char('g')) => {
                        if state.session == SessionState::Idle {
                            state.info = "Starting…".into();
                        }
                        pending_output_dir = Some(state.cfg.output_dir.clone());
                        let _ = cmd_tx.send(UiCommand::Start(Box::new(state.cfg.clone())));
                        state.tab = TAB_LOGS;
                    }
                    (_, KeyCode::Char('s')) => {
                        let _ = cmd_tx.send(UiCommand::Stop);
                    }
                    (_, KeyCode::Char('o')) => reload_preset(&mut state),
                    (_, KeyCode::Char('w')) => write_preset(&mut state),
                    (_, KeyCode::Char('r')) => {
                        if state.tab == TAB_RESULTS {
                            let old_count = state.results.len();
                            refresh_results(&mut state);
                            let new_count = state.results.len();
                            state.info = if new_count > old_count {
                                format!("Refreshed: {} new file(s)", new_count - old_count)
                            } else if new_count < old_count {
                                format!("Refreshed: {} file(s) removed", old_count - new_count)
                            } else {
                                "Refreshed".into()
                            };
                        }
                    }
                    (_, KeyCode::Char('y')) => {
                        let path = if state.tab == TAB_RESULTS {
                            state.selected_result().map(|f| f.path.clone())
                        } else {
                            state.audio.clone()
                        };
                        state.info = match path.as_deref().map(results::select_audio) {
                            Some(Ok(path)) => {
                                let path = path.to_string_lossy().into_owned();
                                match copy_to_clipboard(&path) {
                                    Ok(_) => format!("✓ Copied to clipboard: {path}"),
                                    Err(e) => format!("Clipboard copy failed: {e:#}"),
                                }
                            }
                            Some(Err(msg)) => msg,
                            None => "No audio file to copy yet.".into(),
                        };
                    }
                    (_, KeyCode::Tab) => {
                        state.tab = (state.tab + 1) % TAB_COUNT;
                        if state.tab == TAB_RESULTS {
                            refresh_results(&mut state);
                        }
                    }
                    (_, KeyCode::Char('?')) => {
                        state.tab = TAB_HELP;
                    }
                    (_, KeyCode::Up) | (_, KeyCode::Char('k')) => match state.tab {
                        TAB_RESULTS => state.select_up(),
                        TAB_LOGS => state.scroll_log_up(1),
                        _ => {}
                    },
                    (_, KeyCode::Down) | (_, KeyCode::Char('j')) => match state.tab {
                        TAB_RESULTS => state.select_down(page),
                        TAB_LOGS => state.scroll_log_down(1),
                        _ => {}
                    },
                    (_, KeyCode::PageUp) if state.tab == TAB_LOGS => state.scroll_log_up(page),
                    (_, KeyCode::PageDown) if state.tab == TAB_LOGS => {
                        state.scroll_log_down(page)
                    }
                    (_, KeyCode::End) if state.tab == TAB_LOGS => state.log_scroll = 0,
                    _ => {}
                }
            }
        }
    };

    disable_raw_mode().ok();
    let mut stdout = io::stdout();
    execute!(stdout, LeaveAlternateScreen).ok();
    res
}

fn refresh_results(state: &mut UiState) {
    match results::list_audio(&state.cfg.output_dir) {
        Ok(files) => state.set_results(files),
        Err(e) => state.info = format!("Listing results failed: {e}"),
    }
}

fn reload_preset(state: &mut UiState) {
    let Some(path) = state.preset_path.clone() else {
        state.info = "No preset file configured.".into();
        return;
    };
    match cli::load_preset(&path) {
        Ok(cfg) => {
            state.cfg = cfg;
            state.info = format!("Loaded preset: {}", path.display());
            refresh_results(state);
        }
        Err(e) => state.info = format!("Preset load failed: {e:#}"),
    }
}

fn write_preset(state: &mut UiState) {
    let Some(path) = state.preset_path.clone() else {
        state.info = "No preset file configured.".into();
        return;
    };
    state.info = match cli::save_preset(&path, &state.cfg) {
        Ok(()) => format!("Saved preset: {}", path.display()),
        Err(e) => format!("Preset save failed: {e:#}"),
    };
}

fn draw(area: Rect, f: &mut ratatui::Frame, state: &UiState, settings: &LauncherSettings) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(3), Constraint::Min(0)].as_ref())
        .split(area);

    let tabs = Tabs::new(vec![
        Line::from("Logs"),
        Line::from("Results"),
        Line::from("Parameters"),
        Line::from("Help"),
    ])
    .select(state.tab)
    .block(Block::default().borders(Borders::ALL).title("yue-panel"))
    .highlight_style(Style::default().fg(Color::Yellow));
    f.render_widget(tabs, chunks[0]);

    match state.tab {
        TAB_LOGS => draw_logs(chunks[1], f, state),
        TAB_RESULTS => panels::draw_results(chunks[1], f, state),
        TAB_PARAMETERS => panels::draw_parameters(chunks[1], f, state, settings),
        _ => help::draw_help(chunks[1], f),
    }
}

fn draw_logs(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let mut status: Vec<Line<'static>> = Vec::new();

    let color = match state.session {
        SessionState::Idle => Color::Gray,
        SessionState::Running(_) => Color::Green,
        SessionState::Stopping(_) => Color::Yellow,
    };
    let mut first = vec![
        Span::styled("State:", Style::default().fg(Color::Gray)),
        Span::raw(" "),
        Span::styled(state.session.to_string(), Style::default().fg(color)),
    ];
    if let Some(secs) = state.elapsed_secs() {
        first.push(Span::raw(format!("  {}m{:02}s", secs / 60, secs % 60)));
    }
    first.push(Span::styled(
        "   g: generate  s: stop  ?: help",
        Style::default().fg(Color::DarkGray),
    ));
    status.push(Line::from(first));

    let audio = state
        .audio
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "-".into());
    status.extend(wrapped_kv("Audio", &audio, area.width));
    status.extend(wrapped_kv("Info", &state.info, area.width));

    let status_height = (status.len() as u16 + 2).min(area.height / 2).max(3);
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(status_height), Constraint::Min(0)].as_ref())
        .split(area);

    f.render_widget(
        Paragraph::new(status).block(Block::default().borders(Borders::ALL).title("Run")),
        chunks[0],
    );

    let height = chunks[1].height.saturating_sub(2) as usize;
    let lines: Vec<Line> = state
        .visible_log(height)
        .into_iter()
        .map(|l| Line::from(l.to_string()))
        .collect();
    let title = if state.log_scroll > 0 {
        format!("Log (scrolled {} lines, End to follow)", state.log_scroll)
    } else {
        "Log".to_string()
    };
    f.render_widget(
        Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title(title)),
        chunks[1],
    );
}
