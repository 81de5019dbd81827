//! Pieces shared by the tabs: wrapped key/value status lines and clipboard access.

use anyhow::{anyhow, Result};
use ratatui::{
    style::{Color, Style},
    text::{Line, Span},
};
use std::sync::mpsc::{self, Sender};
use std::sync::OnceLock;
use std::time::Duration;

/// Lay `value` out after `label:` inside a bordered block `width` columns wide.
///
/// Continuation lines are indented by two columns. Blank values produce no lines.
pub fn wrapped_kv(label: &str, value: &str, width: u16) -> Vec<Line<'static>> {
    let value = value.trim();
    if value.is_empty() {
        return Vec::new();
    }

    // Two columns of border and padding on each side.
    let inner = usize::from(width.saturating_sub(4)).max(1);
    let head = format!("{label}:");
    let chars: Vec<char> = value.chars().collect();
    let first_width = inner.saturating_sub(head.chars().count() + 1).max(1);
    let (first, rest) = chars.split_at(first_width.min(chars.len()));

    let mut lines = vec![Line::from(vec![
        Span::styled(head, Style::default().fg(Color::Gray)),
        Span::raw(" "),
        Span::raw(first.iter().collect::<String>()),
    ])];
    for chunk in rest.chunks(inner.saturating_sub(2).max(1)) {
        lines.push(Line::from(vec![
            Span::raw("  "),
            Span::raw(chunk.iter().collect::<String>()),
        ]));
    }
    lines
}

/// How long each copy keeps its clipboard open. On Linux the owner serves the
/// contents, so dropping it right away can lose the copy.
const CLIPBOARD_HOLD: Duration = Duration::from_secs(2);

static CLIPBOARD: OnceLock<Sender<String>> = OnceLock::new();

fn clipboard_thread() -> Sender<String> {
    let (tx, rx) = mpsc::channel::<String>();
    std::thread::spawn(move || {
        for text in rx {
            match arboard::Clipboard::new() {
                Ok(mut clipboard) => match clipboard.set_text(text) {
                    Ok(()) => std::thread::sleep(CLIPBOARD_HOLD),
                    Err(e) => tracing::warn!(error = %e, "clipboard write failed"),
                },
                Err(e) => tracing::warn!(error = %e, "clipboard unavailable"),
            }
        }
    });
    tx
}

/// Queue `text` for the clipboard thread, starting it on first use. Never blocks.
pub fn copy_to_clipboard(text: &str) -> Result<()> {
    CLIPBOARD
        .get_or_init(clipboard_thread)
        .send(text.to_owned())
        .map_err(|_| anyhow!("clipboard thread has exited"))
}
