use ratatui::{
    layout::Rect,
    style::Color,
    style::Style,
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph},
    Frame,
};

fn key_line(key: &'static str, pad: usize, what: &'static str) -> Line<'static> {
    Line::from(vec![
        Span::raw("  "),
        Span::styled(key, Style::default().fg(Color::Magenta)),
        Span::raw(" ".repeat(pad)),
        Span::raw(what),
    ])
}

pub fn draw_help(area: Rect, f: &mut Frame) {
    let p = Paragraph::new(vec![
        Line::from("Keybinds:"),
        Line::from(vec![
            Span::raw("  "),
            Span::styled("q", Style::default().fg(Color::Magenta)),
            Span::raw(" / "),
            Span::styled("Ctrl-C", Style::default().fg(Color::Magenta)),
            Span::raw("  Quit (stops a running generation)"),
        ]),
        key_line("g", 11, "Generate with the current parameters"),
        key_line("s", 11, "Stop the running generation"),
        key_line("o", 11, "Reload parameters from the preset file"),
        key_line("w", 11, "Write parameters to the preset file"),
        key_line("tab", 9, "Switch tabs"),
        key_line("?", 11, "Show this help"),
        Line::from(""),
        Line::from("Logs tab:"),
        key_line("↑/↓", 9, "Scroll one line"),
        key_line("PgUp/PgDn", 3, "Scroll one page"),
        key_line("End", 9, "Follow new output"),
        key_line("y", 11, "Copy the generated audio path to clipboard"),
        Line::from(""),
        Line::from("Results tab:"),
        Line::from(vec![
            Span::raw("  "),
            Span::styled("↑/↓", Style::default().fg(Color::Magenta)),
            Span::raw(" or "),
            Span::styled("j/k", Style::default().fg(Color::Magenta)),
            Span::raw("  Navigate"),
        ]),
        key_line("r", 11, "Refresh the output directory"),
        key_line("y", 11, "Copy selected file path to clipboard"),
    ])
    .block(Block::default().borders(Borders::ALL).title("Help"));
    f.render_widget(p, area);
}
