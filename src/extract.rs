//! Turning raw output lines into text and artifact notifications.

use crate::model::ArtifactEvent;
use regex::Regex;

/// Finds structured events in one line of the inference program's output.
pub trait EventExtractor: Send + Sync {
    fn extract(&self, line: &str) -> Option<ArtifactEvent>;
}

/// Matches `<marker> <path>` and reports everything up to the next whitespace as the path.
#[derive(Debug, Clone)]
pub struct MarkerExtractor {
    marker: String,
    pattern: Regex,
}

impl MarkerExtractor {
    pub fn new(marker: &str) -> Result<Self, regex::Error> {
        let pattern = Regex::new(&format!(r"{}\s*(\S+)", regex::escape(marker)))?;
        Ok(Self {
            marker: marker.to_string(),
            pattern,
        })
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }
}

impl EventExtractor for MarkerExtractor {
    fn extract(&self, line: &str) -> Option<ArtifactEvent> {
        if !line.contains(&self.marker) {
            return None;
        }
        self.pattern
            .captures(line)
            .and_then(|c| c.get(1))
            .map(|m| ArtifactEvent::new(m.as_str()))
    }
}

/// Decode one raw line, substituting U+FFFD for invalid UTF-8 and dropping the line terminator.
pub fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}
