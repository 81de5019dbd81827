use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Process id of a spawned inference run. Also the id of its process group.
pub type RunId = u32;

pub const DEFAULT_MARKER: &str = "Created mix:";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LauncherSettings {
    pub python: String,
    pub infer_script: PathBuf,
    /// Root of the inference checkout; codec checkpoints live under it.
    pub project_dir: PathBuf,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Where prompt audio is copied before a run.
    pub input_dir: PathBuf,
    #[serde(default)]
    pub conda: Option<CondaEnv>,
    #[serde(with = "humantime_serde")]
    pub grace_period: Duration,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    pub marker: String,
}

impl Default for LauncherSettings {
    fn default() -> Self {
        Self {
            python: "python".into(),
            infer_script: PathBuf::from("infer.py"),
            project_dir: PathBuf::from("/workspace/YuE-Interface"),
            working_dir: None,
            input_dir: PathBuf::from("/workspace/inputs"),
            conda: None,
            grace_period: Duration::from_secs(2),
            poll_interval: Duration::from_millis(500),
            marker: DEFAULT_MARKER.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CondaEnv {
    pub activate_script: PathBuf,
    pub env_name: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quantization {
    #[default]
    Bf16,
    Int8,
    Int4,
    Nf4,
}

impl Quantization {
    pub fn as_flag_value(self) -> &'static str {
        match self {
            Quantization::Bf16 => "bf16",
            Quantization::Int8 => "int8",
            Quantization::Int4 => "int4",
            Quantization::Nf4 => "nf4",
        }
    }
}

impl std::str::FromStr for Quantization {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bf16" => Ok(Quantization::Bf16),
            "int8" => Ok(Quantization::Int8),
            "int4" => Ok(Quantization::Int4),
            "nf4" => Ok(Quantization::Nf4),
            other => Err(format!("unknown quantization '{other}' (expected bf16, int8, int4 or nf4)")),
        }
    }
}

/// Memory-management profile for GPUs with little VRAM.
///
/// 1 is the fastest (about 16 GB), 3 quantizes to 8 bits (about 12 GB),
/// 4 offloads sequentially and is very slow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct MmgpProfile(u8);

impl MmgpProfile {
    pub const SUPPORTED: [u8; 3] = [1, 3, 4];

    pub fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for MmgpProfile {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        if Self::SUPPORTED.contains(&v) {
            Ok(Self(v))
        } else {
            Err(format!("unsupported MMGP profile {v} (expected 1, 3 or 4)"))
        }
    }
}

impl From<MmgpProfile> for u8 {
    fn from(p: MmgpProfile) -> u8 {
        p.0
    }
}

/// In-context-learning conditioning. Single and dual-track prompts are mutually exclusive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PromptConditioning {
    Single {
        audio: PathBuf,
        start_secs: f64,
        end_secs: f64,
    },
    DualTrack {
        vocal: PathBuf,
        instrumental: PathBuf,
        start_secs: f64,
        end_secs: f64,
    },
}

impl PromptConditioning {
    pub fn window(&self) -> (f64, f64) {
        match self {
            PromptConditioning::Single {
                start_secs,
                end_secs,
                ..
            }
            | PromptConditioning::DualTrack {
                start_secs,
                end_secs,
                ..
            } => (*start_secs, *end_secs),
        }
    }
}

/// Everything the user picks for one generation. Stored as a JSON preset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub stage1_model: String,
    pub stage1_quantization: Quantization,
    pub stage2_model: String,
    pub stage2_quantization: Quantization,
    pub tokenizer: PathBuf,
    pub genre: String,
    pub lyrics: String,
    pub run_n_segments: u32,
    pub stage2_batch_size: u32,
    pub output_dir: PathBuf,
    pub cuda_idx: u32,
    pub max_new_tokens: u32,
    pub seed: u64,
    pub repetition_penalty: f64,
    pub prompt: Option<PromptConditioning>,
    pub disable_offload_model: bool,
    pub keep_intermediate: bool,
    pub mmgp_profile: Option<MmgpProfile>,
    pub sdpa: bool,
    pub compile: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            stage1_model: "/workspace/models/YuE-s1-7B-anneal-en-cot".into(),
            stage1_quantization: Quantization::Bf16,
            stage2_model: "/workspace/models/YuE-s2-1B-general".into(),
            stage2_quantization: Quantization::Bf16,
            tokenizer: PathBuf::from(
                "/workspace/YuE-Interface/inference/mm_tokenizer_v0.2_hf/tokenizer.model",
            ),
            genre: String::new(),
            lyrics: String::new(),
            run_n_segments: 2,
            stage2_batch_size: 4,
            output_dir: PathBuf::from("/workspace/outputs"),
            cuda_idx: 0,
            max_new_tokens: 3000,
            seed: 42,
            repetition_penalty: 1.1,
            prompt: None,
            disable_offload_model: false,
            keep_intermediate: false,
            mmgp_profile: None,
            sdpa: false,
            compile: false,
        }
    }
}

/// An output file announced by the inference program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactEvent {
    pub path: PathBuf,
}

impl ArtifactEvent {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Running(RunId),
    Stopping(RunId),
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Running(pid) => write!(f, "running (pid {pid})"),
            SessionState::Stopping(pid) => write!(f, "stopping (pid {pid})"),
        }
    }
}

/// Program, arguments, working directory and environment overlay for one run.
///
/// Arguments are handed to the OS as a vector; no shell ever re-parses them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    program: String,
    args: Vec<String>,
    current_dir: Option<PathBuf>,
    env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Append `flag value`.
    pub fn flag(self, flag: &str, value: impl fmt::Display) -> Self {
        self.arg(flag).arg(value.to_string())
    }

    pub fn path_flag(self, flag: &str, value: &Path) -> Self {
        self.arg(flag).arg(value.to_string_lossy().into_owned())
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    pub fn get_current_dir(&self) -> Option<&Path> {
        self.current_dir.as_deref()
    }

    pub fn get_env(&self) -> &[(String, String)] {
        &self.env
    }

    /// Shell-quoted rendering, for logs only.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(shell_quote)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn shell_quote(s: &str) -> String {
    let plain = !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if plain {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_quotes_only_when_needed() {
        let spec = CommandSpec::new("python")
            .arg("infer.py")
            .flag("--genre_txt", "/tmp/my genre.txt")
            .arg("it's");
        assert_eq!(
            spec.display(),
            r#"python infer.py --genre_txt '/tmp/my genre.txt' 'it'\''s'"#
        );
    }

    #[test]
    fn mmgp_profile_rejects_unsupported_values() {
        assert!(MmgpProfile::try_from(2).is_err());
        assert_eq!(MmgpProfile::try_from(3).map(MmgpProfile::get), Ok(3));
    }

    #[test]
    fn preset_round_trips_through_json() {
        let cfg = GenerationConfig {
            genre: "pop airy vocal".into(),
            prompt: Some(PromptConditioning::DualTrack {
                vocal: "v.mp3".into(),
                instrumental: "i.mp3".into(),
                start_secs: 0.0,
                end_secs: 30.0,
            }),
            mmgp_profile: MmgpProfile::try_from(4).ok(),
            stage1_quantization: Quantization::Int4,
            ..Default::default()
        };
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(json.contains("\"mode\":\"dual_track\""));
        assert!(json.contains("\"stage1_quantization\":\"int4\""));
        let back: GenerationConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn partial_preset_fills_defaults() {
        let cfg: GenerationConfig = serde_json::from_str(r#"{"seed": 7}"#).unwrap();
        assert_eq!(cfg.seed, 7);
        assert_eq!(cfg.max_new_tokens, 3000);
        assert!(serde_json::from_str::<GenerationConfig>(r#"{"mmgp_profile": 2}"#).is_err());
    }
}
