//! Browsing the results directory.

use crate::command::has_audio_extension;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// A produced audio file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFile {
    pub path: PathBuf,
    pub modified: SystemTime,
    pub bytes: u64,
}

impl AudioFile {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Audio files directly inside `dir`, newest first. A missing directory is empty.
pub fn list_audio(dir: &Path) -> std::io::Result<Vec<AudioFile>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if !has_audio_extension(&path) {
            continue;
        }
        let meta = entry.metadata()?;
        if !meta.is_file() {
            continue;
        }
        files.push(AudioFile {
            path,
            modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            bytes: meta.len(),
        });
    }
    files.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| a.path.cmp(&b.path)));
    Ok(files)
}

pub fn newest_audio(dir: &Path) -> Option<PathBuf> {
    list_audio(dir)
        .ok()
        .and_then(|files| files.into_iter().next())
        .map(|f| f.path)
}

/// Check that a user-picked path is a single existing audio file.
pub fn select_audio(path: &Path) -> Result<PathBuf, String> {
    if path.is_dir() {
        return Err("Please select a single file and not a folder.".into());
    }
    if !path.exists() {
        return Err(format!("File not found: {}", path.display()));
    }
    if !has_audio_extension(path) {
        return Err(format!("File is not an audio file: {}", path.display()));
    }
    Ok(path.to_path_buf())
}

/// Map a reported artifact path onto the output directory when the program reported it
/// relative to its own working directory.
pub fn resolve_artifact(output_dir: &Path, reported: &Path) -> PathBuf {
    if reported.exists() {
        return reported.to_path_buf();
    }
    if let Some(name) = reported.file_name() {
        let candidate = output_dir.join(name);
        if candidate.exists() {
            return candidate;
        }
    }
    reported.to_path_buf()
}
