use super::state::{UiState, TAB_RESULTS};
use crate::model::{LauncherSettings, PromptConditioning};
use ratatui::{
    layout::Rect,
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph},
    Frame,
};
use std::time::SystemTime;

/// Header lines above the result list.
pub const RESULTS_HEADER_LINES: usize = 2;

fn format_modified(t: SystemTime) -> String {
    let utc = time::OffsetDateTime::from(t);
    let (dt, suffix) = match time::UtcOffset::current_local_offset() {
        Ok(offset) => (utc.to_offset(offset), ""),
        // Fallback to UTC if local offset can't be determined
        Err(_) => (utc, " UTC"),
    };
    let fmt = time::macros::format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    match dt.format(fmt) {
        Ok(s) => format!("{s}{suffix}"),
        Err(_) => "-".into(),
    }
}

fn format_size(bytes: u64) -> String {
    const MB: f64 = 1024.0 * 1024.0;
    if bytes as f64 >= MB {
        format!("{:.1} MB", bytes as f64 / MB)
    } else {
        format!("{:.0} KB", (bytes as f64 / 1024.0).ceil())
    }
}

pub fn draw_results(area: Rect, f: &mut Frame, state: &UiState) {
    let mut lines: Vec<Line> = Vec::new();
    // Borders plus the header.
    let max_items = (area.height as usize).saturating_sub(2 + RESULTS_HEADER_LINES);

    let total = state.results.len();
    let current = if total > 0 {
        state.results_selected + 1
    } else {
        0
    };
    lines.push(Line::from(vec![
        Span::raw(format!(
            "{} ({current}/{total}) - ",
            state.cfg.output_dir.display()
        )),
        Span::styled("↑/↓/j/k", Style::default().fg(Color::Magenta)),
        Span::raw(": navigate, "),
        Span::styled("r", Style::default().fg(Color::Magenta)),
        Span::raw(": refresh, "),
        Span::styled("y", Style::default().fg(Color::Magenta)),
        Span::raw(": copy path"),
    ]));
    lines.push(Line::from(""));

    if state.results.is_empty() {
        lines.push(Line::from(Span::styled(
            "No audio files yet.",
            Style::default().fg(Color::Gray),
        )));
    }

    let offset = {
        let mut offset = state.results_scroll_offset.min(total.saturating_sub(1));
        if state.results_selected < offset {
            offset = state.results_selected;
        } else if max_items > 0 && state.results_selected >= offset + max_items {
            offset = state.results_selected + 1 - max_items;
        }
        offset
    };

    for (idx, file) in state
        .results
        .iter()
        .enumerate()
        .skip(offset)
        .take(max_items)
    {
        let selected = state.tab == TAB_RESULTS && idx == state.results_selected;
        let is_latest = state.audio.as_deref() == Some(file.path.as_path());
        let style = if selected {
            Style::default().fg(Color::Black).bg(Color::Yellow)
        } else {
            Style::default()
        };
        let mut spans = vec![
            Span::styled(format!("{:<40}", file.file_name()), style),
            Span::raw("  "),
            Span::styled(
                format!("{:>9}", format_size(file.bytes)),
                Style::default().fg(Color::Gray),
            ),
            Span::raw("  "),
            Span::styled(
                format_modified(file.modified),
                Style::default().fg(Color::Gray),
            ),
        ];
        if is_latest {
            spans.push(Span::styled(
                "  ← latest run",
                Style::default().fg(Color::Green),
            ));
        }
        lines.push(Line::from(spans));
    }

    let p = Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title("Results"));
    f.render_widget(p, area);
}

fn kv(label: &str, value: String) -> Line<'static> {
    Line::from(vec![
        Span::styled(format!("{label:<22}"), Style::default().fg(Color::Gray)),
        Span::raw(value),
    ])
}

fn on_off(v: bool) -> String {
    if v { "on" } else { "off" }.to_string()
}

pub fn draw_parameters(area: Rect, f: &mut Frame, state: &UiState, settings: &LauncherSettings) {
    let cfg = &state.cfg;
    let section = |title: &'static str| {
        Line::from(Span::styled(
            title,
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD),
        ))
    };

    let mut lines = vec![
        section("Models"),
        kv(
            "Stage 1",
            format!("{} ({})", cfg.stage1_model, cfg.stage1_quantization.as_flag_value()),
        ),
        kv(
            "Stage 2",
            format!("{} ({})", cfg.stage2_model, cfg.stage2_quantization.as_flag_value()),
        ),
        kv("Tokenizer", cfg.tokenizer.display().to_string()),
        Line::from(""),
        section("Generation"),
        kv("Genre", cfg.genre.trim().to_string()),
        kv(
            "Lyrics",
            format!(
                "{} line(s), {} chars",
                cfg.lyrics.lines().count(),
                cfg.lyrics.chars().count()
            ),
        ),
        kv("Segments", cfg.run_n_segments.to_string()),
        kv("Stage 2 batch size", cfg.stage2_batch_size.to_string()),
        kv("Max new tokens", cfg.max_new_tokens.to_string()),
        kv("Seed", cfg.seed.to_string()),
        kv("Repetition penalty", format!("{:.2}", cfg.repetition_penalty)),
        kv("CUDA device", cfg.cuda_idx.to_string()),
        kv("Output directory", cfg.output_dir.display().to_string()),
    ];

    let prompt = match &cfg.prompt {
        None => "none".to_string(),
        Some(PromptConditioning::Single {
            audio,
            start_secs,
            end_secs,
        }) => format!("{} [{start_secs}s..{end_secs}s]", audio.display()),
        Some(PromptConditioning::DualTrack {
            vocal,
            instrumental,
            start_secs,
            end_secs,
        }) => format!(
            "vocal {} + instrumental {} [{start_secs}s..{end_secs}s]",
            vocal.display(),
            instrumental.display()
        ),
    };
    lines.push(kv("Audio prompt", prompt));
    lines.push(Line::from(""));
    lines.push(section("Memory & speed"));
    lines.push(kv(
        "MMGP profile",
        cfg.mmgp_profile
            .map(|p| p.get().to_string())
            .unwrap_or_else(|| "off".into()),
    ));
    lines.push(kv("Offload model", on_off(!cfg.disable_offload_model)));
    lines.push(kv("Keep intermediate", on_off(cfg.keep_intermediate)));
    lines.push(kv("SDPA", on_off(cfg.sdpa)));
    lines.push(kv("Compile", on_off(cfg.compile)));
    lines.push(Line::from(""));
    lines.push(section("Launcher"));
    lines.push(kv(
        "Command",
        format!("{} {}", settings.python, settings.infer_script.display()),
    ));
    lines.push(kv("Project directory", settings.project_dir.display().to_string()));
    if let Some(conda) = &settings.conda {
        lines.push(kv("Conda env", conda.env_name.clone()));
    }
    lines.push(kv(
        "Preset file",
        state
            .preset_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "-".into()),
    ));

    let p = Paragraph::new(lines).block(
        Block::default()
            .borders(Borders::ALL)
            .title("Parameters (o: reload preset, w: write preset)"),
    );
    f.render_widget(p, area);
}
