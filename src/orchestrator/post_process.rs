//! Post-run processing.
//!
//! Settles on the audio file a finished run produced and refreshes the results listing.

use super::results::{self, AudioFile};
use std::path::{Path, PathBuf};

/// Result of post-run processing, ready for presentation layers.
pub(crate) struct ProcessedRun {
    pub audio: Option<PathBuf>,
    pub messages: Vec<String>,
    pub results: Vec<AudioFile>,
}

/// Pick the final audio for a finished run: the reported artifact when there is one,
/// otherwise the newest audio file in the output directory.
pub(crate) fn process_run_completion(output_dir: &Path, reported: Option<&Path>) -> ProcessedRun {
    let mut messages = Vec::new();

    let audio = match reported {
        Some(path) => {
            let resolved = results::resolve_artifact(output_dir, path);
            if resolved.exists() {
                messages.push(format!("File ready: {}", resolved.display()));
            } else {
                messages.push(format!("Reported file is missing: {}", resolved.display()));
            }
            Some(resolved)
        }
        None => {
            let newest = results::newest_audio(output_dir);
            match &newest {
                Some(p) => messages.push(format!("Newest output: {}", p.display())),
                None => messages.push("Run finished without producing audio.".into()),
            }
            newest
        }
    };

    let results = match results::list_audio(output_dir) {
        Ok(files) => files,
        Err(e) => {
            messages.push(format!("Listing {} failed: {e}", output_dir.display()));
            Vec::new()
        }
    };

    ProcessedRun {
        audio,
        messages,
        results,
    }
}
