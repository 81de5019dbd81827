//! Building the inference command line from user configuration.
//!
//! Free text never reaches a shell: genre and lyrics go to temporary files, prompt
//! audio is copied under a sanitized name, and everything else is a separate argv entry.

use crate::error::LaunchError;
use crate::model::{CommandSpec, CondaEnv, GenerationConfig, LauncherSettings, PromptConditioning};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::TempPath;

const AUDIO_EXTENSIONS: [&str; 5] = ["mp3", "wav", "flac", "ogg", "m4a"];

/// Runs `exec "$@"` inside an activated conda env; paths and names arrive as positional
/// parameters so they are never parsed as script text.
const CONDA_SCRIPT: &str = r#"source "$0" && conda activate "$1" && shift && exec "$@""#;

/// A command ready to spawn plus the temporary files it refers to.
#[derive(Debug)]
pub struct PreparedRun {
    pub spec: CommandSpec,
    pub scratch: Vec<TempPath>,
}

/// Prompt audio after it has been staged into the input directory.
#[derive(Debug, Clone, PartialEq)]
pub enum StagedPrompt {
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

/// Files the command line points at.
#[derive(Debug, Clone)]
pub struct InputFiles {
    pub genre_txt: PathBuf,
    pub lyrics_txt: PathBuf,
    pub prompt: Option<StagedPrompt>,
}

/// Reject configurations the inference program cannot run. No side effects.
pub fn validate(cfg: &GenerationConfig) -> Result<(), LaunchError> {
    let invalid = |msg: &str| Err(LaunchError::InvalidConfig(msg.to_string()));

    if cfg.stage1_model.trim().is_empty() || cfg.stage2_model.trim().is_empty() {
        return invalid("both stage1 and stage2 models are required");
    }
    if cfg.genre.trim().is_empty() {
        return invalid("genre text is empty");
    }
    if cfg.lyrics.trim().is_empty() {
        return invalid("lyrics text is empty");
    }
    if cfg.run_n_segments == 0 {
        return invalid("number of segments must be at least 1");
    }
    if cfg.stage2_batch_size == 0 {
        return invalid("stage2 batch size must be at least 1");
    }
    if cfg.max_new_tokens == 0 {
        return invalid("max new tokens must be at least 1");
    }
    if !cfg.repetition_penalty.is_finite() || cfg.repetition_penalty <= 0.0 {
        return invalid("repetition penalty must be a positive number");
    }
    if cfg.mmgp_profile.is_some()
        && (cfg.stage1_quantization != Default::default()
            || cfg.stage2_quantization != Default::default())
    {
        return invalid("MMGP only works with the original bf16 models");
    }

    if let Some(prompt) = &cfg.prompt {
        let (start, end) = prompt.window();
        if !start.is_finite() || !end.is_finite() || start < 0.0 || end <= start {
            return invalid("prompt end time must be after a non-negative start time");
        }
        match prompt {
            PromptConditioning::Single { audio, .. } => check_audio(audio)?,
            PromptConditioning::DualTrack {
                vocal,
                instrumental,
                ..
            } => {
                check_audio(vocal)?;
                check_audio(instrumental)?;
            }
        }
    }
    Ok(())
}

fn check_audio(path: &Path) -> Result<(), LaunchError> {
    if !path.is_file() {
        return Err(LaunchError::MissingFile(path.to_path_buf()));
    }
    if !has_audio_extension(path) {
        return Err(LaunchError::UnsupportedAudio(path.to_path_buf()));
    }
    Ok(())
}

pub(crate) fn has_audio_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| AUDIO_EXTENSIONS.iter().any(|a| a.eq_ignore_ascii_case(e)))
}

/// Replace everything except ASCII letters, digits and dots with `_`.
pub fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' { c } else { '_' })
        .collect()
}

/// Copy a prompt file into `input_dir` under a sanitized name.
pub fn stage_audio(src: &Path, input_dir: &Path) -> Result<PathBuf, LaunchError> {
    stage_audio_as(src, input_dir, "")
}

/// Like [`stage_audio`], with `prefix` prepended to the staged name.
///
/// Dual-track prompts stage each track under its own prefix, so two files that
/// share a name in different folders cannot overwrite each other.
pub fn stage_audio_as(src: &Path, input_dir: &Path, prefix: &str) -> Result<PathBuf, LaunchError> {
    let name = src
        .file_name()
        .map(|n| format!("{prefix}{}", sanitize_file_name(&n.to_string_lossy())))
        .ok_or_else(|| LaunchError::MissingFile(src.to_path_buf()))?;
    std::fs::create_dir_all(input_dir).map_err(|e| {
        LaunchError::io(format!("create input directory {}", input_dir.display()), e)
    })?;
    let dest = input_dir.join(name);
    if dest != src {
        std::fs::copy(src, &dest)
            .map_err(|e| LaunchError::io(format!("copy {}", src.display()), e))?;
    }
    Ok(dest)
}

fn write_text_file(prefix: &str, content: &str) -> Result<TempPath, LaunchError> {
    let mut file = tempfile::Builder::new()
        .prefix(prefix)
        .suffix(".txt")
        .tempfile()
        .map_err(|e| LaunchError::io("create temporary text file", e))?;
    file.write_all(content.as_bytes())
        .and_then(|_| file.flush())
        .map_err(|e| LaunchError::io("write temporary text file", e))?;
    Ok(file.into_temp_path())
}

/// Validate, touch the filesystem, and build the command for one run.
pub fn prepare(
    cfg: &GenerationConfig,
    settings: &LauncherSettings,
) -> Result<PreparedRun, LaunchError> {
    validate(cfg)?;

    std::fs::create_dir_all(&cfg.output_dir).map_err(|e| {
        LaunchError::io(
            format!("create output directory {}", cfg.output_dir.display()),
            e,
        )
    })?;

    let prompt = match &cfg.prompt {
        None => None,
        Some(PromptConditioning::Single {
            audio,
            start_secs,
            end_secs,
        }) => Some(StagedPrompt::Single {
            audio: stage_audio(audio, &settings.input_dir)?,
            start_secs: *start_secs,
            end_secs: *end_secs,
        }),
        Some(PromptConditioning::DualTrack {
            vocal,
            instrumental,
            start_secs,
            end_secs,
        }) => Some(StagedPrompt::DualTrack {
            vocal: stage_audio_as(vocal, &settings.input_dir, "vocal_")?,
            instrumental: stage_audio_as(instrumental, &settings.input_dir, "instrumental_")?,
            start_secs: *start_secs,
            end_secs: *end_secs,
        }),
    };

    let genre = write_text_file("genre-", &cfg.genre)?;
    let lyrics = write_text_file("lyrics-", &cfg.lyrics)?;
    let inputs = InputFiles {
        genre_txt: genre.to_path_buf(),
        lyrics_txt: lyrics.to_path_buf(),
        prompt,
    };

    Ok(PreparedRun {
        spec: build_command(cfg, settings, &inputs),
        scratch: vec![genre, lyrics],
    })
}

/// Pure mapping from configuration to argv.
pub fn build_command(
    cfg: &GenerationConfig,
    settings: &LauncherSettings,
    inputs: &InputFiles,
) -> CommandSpec {
    let codec = settings.project_dir.join("inference").join("xcodec_mini_infer");

    let mut spec = CommandSpec::new(settings.python.clone())
        .arg(settings.infer_script.to_string_lossy().into_owned())
        .flag("--stage1_model", &cfg.stage1_model)
        .flag("--quantization_stage1", cfg.stage1_quantization.as_flag_value())
        .flag("--stage2_model", &cfg.stage2_model)
        .flag("--quantization_stage2", cfg.stage2_quantization.as_flag_value())
        .path_flag("--tokenizer", &cfg.tokenizer)
        .flag("--repetition_penalty", cfg.repetition_penalty)
        .path_flag("--genre_txt", &inputs.genre_txt)
        .path_flag("--lyrics_txt", &inputs.lyrics_txt)
        .flag("--run_n_segments", cfg.run_n_segments)
        .flag("--stage2_batch_size", cfg.stage2_batch_size)
        .path_flag("--output_dir", &cfg.output_dir)
        .flag("--cuda_idx", cfg.cuda_idx)
        .flag("--seed", cfg.seed)
        .flag("--max_new_tokens", cfg.max_new_tokens)
        .path_flag("--basic_model_config", &codec.join("final_ckpt/config.yaml"))
        .path_flag("--resume_path", &codec.join("final_ckpt/ckpt_00360000.pth"))
        .path_flag("--config_path", &codec.join("decoders/config.yaml"))
        .path_flag("--vocal_decoder_path", &codec.join("decoders/decoder_131000.pth"))
        .path_flag("--inst_decoder_path", &codec.join("decoders/decoder_151000.pth"));

    match &inputs.prompt {
        None => {}
        Some(StagedPrompt::Single {
            audio,
            start_secs,
            end_secs,
        }) => {
            spec = spec
                .arg("--use_audio_prompt")
                .path_flag("--audio_prompt_path", audio)
                .flag("--prompt_start_time", start_secs)
                .flag("--prompt_end_time", end_secs);
        }
        Some(StagedPrompt::DualTrack {
            vocal,
            instrumental,
            start_secs,
            end_secs,
        }) => {
            spec = spec
                .arg("--use_dual_tracks_prompt")
                .path_flag("--vocal_track_prompt_path", vocal)
                .path_flag("--instrumental_track_prompt_path", instrumental)
                .flag("--prompt_start_time", start_secs)
                .flag("--prompt_end_time", end_secs);
        }
    }

    if cfg.disable_offload_model {
        spec = spec.arg("--disable_offload_model");
    }
    if cfg.keep_intermediate {
        spec = spec.arg("--keep_intermediate");
    }
    if let Some(profile) = cfg.mmgp_profile {
        spec = spec.arg("--use_mmgp").flag("--mmgp_profile", profile.get());
    }
    if cfg.sdpa {
        spec = spec.arg("--sdpa");
    }
    if cfg.compile {
        spec = spec.arg("--compile");
    }

    let mut spec = match &settings.conda {
        Some(conda) => wrap_in_conda(spec, conda),
        None => spec,
    };
    // Python block-buffers a piped stdout; unbuffered output keeps the log live.
    spec = spec.env("PYTHONUNBUFFERED", "1");
    if let Some(dir) = &settings.working_dir {
        spec = spec.current_dir(dir.clone());
    }
    spec
}

fn wrap_in_conda(inner: CommandSpec, conda: &CondaEnv) -> CommandSpec {
    CommandSpec::new("bash")
        .arg("-c")
        .arg(CONDA_SCRIPT)
        .arg(conda.activate_script.to_string_lossy().into_owned())
        .arg(conda.env_name.clone())
        .arg(inner.program())
        .args(inner.get_args().iter().cloned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MmgpProfile, Quantization};

    fn cfg() -> GenerationConfig {
        GenerationConfig {
            genre: "inspiring female uplifting pop airy vocal".into(),
            lyrics: "[verse]\nit's a $(rm -rf /) kind of day; `echo hi`\n".into(),
            ..Default::default()
        }
    }

    fn inputs() -> InputFiles {
        InputFiles {
            genre_txt: "/tmp/genre.txt".into(),
            lyrics_txt: "/tmp/lyrics.txt".into(),
            prompt: None,
        }
    }

    fn value_of<'a>(spec: &'a CommandSpec, flag: &str) -> Option<&'a str> {
        let args = spec.get_args();
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    #[test]
    fn builds_flag_per_parameter() {
        let spec = build_command(&cfg(), &LauncherSettings::default(), &inputs());
        assert_eq!(spec.program(), "python");
        assert_eq!(spec.get_args()[0], "infer.py");
        assert_eq!(value_of(&spec, "--genre_txt"), Some("/tmp/genre.txt"));
        assert_eq!(value_of(&spec, "--quantization_stage1"), Some("bf16"));
        assert_eq!(value_of(&spec, "--run_n_segments"), Some("2"));
        assert_eq!(value_of(&spec, "--stage2_batch_size"), Some("4"));
        assert_eq!(value_of(&spec, "--max_new_tokens"), Some("3000"));
        assert_eq!(value_of(&spec, "--repetition_penalty"), Some("1.1"));
        assert_eq!(value_of(&spec, "--seed"), Some("42"));
        assert_eq!(
            value_of(&spec, "--resume_path"),
            Some("/workspace/YuE-Interface/inference/xcodec_mini_infer/final_ckpt/ckpt_00360000.pth")
        );
        for absent in ["--use_audio_prompt", "--use_mmgp", "--sdpa", "--compile", "--keep_intermediate"] {
            assert!(!spec.get_args().iter().any(|a| a == absent), "{absent}");
        }
        assert_eq!(spec.get_env(), &[("PYTHONUNBUFFERED".to_string(), "1".to_string())]);
    }

    #[test]
    fn optional_switches_and_prompts() {
        let cfg = GenerationConfig {
            keep_intermediate: true,
            disable_offload_model: true,
            sdpa: true,
            compile: true,
            mmgp_profile: MmgpProfile::try_from(3).ok(),
            ..cfg()
        };
        let inputs = InputFiles {
            prompt: Some(StagedPrompt::DualTrack {
                vocal: "/in/v.mp3".into(),
                instrumental: "/in/i.mp3".into(),
                start_secs: 5.0,
                end_secs: 35.5,
            }),
            ..inputs()
        };
        let spec = build_command(&cfg, &LauncherSettings::default(), &inputs);
        let args = spec.get_args();
        for present in [
            "--use_dual_tracks_prompt",
            "--keep_intermediate",
            "--disable_offload_model",
            "--use_mmgp",
            "--sdpa",
            "--compile",
        ] {
            assert!(args.iter().any(|a| a == present), "{present}");
        }
        assert_eq!(value_of(&spec, "--mmgp_profile"), Some("3"));
        assert_eq!(value_of(&spec, "--vocal_track_prompt_path"), Some("/in/v.mp3"));
        assert_eq!(value_of(&spec, "--prompt_start_time"), Some("5"));
        assert_eq!(value_of(&spec, "--prompt_end_time"), Some("35.5"));
        assert!(!args.iter().any(|a| a == "--use_audio_prompt"));
    }

    #[test]
    fn conda_wrapper_passes_everything_as_positional_args() {
        let settings = LauncherSettings {
            conda: Some(CondaEnv {
                activate_script: "/opt/conda/etc/profile.d/conda.sh".into(),
                env_name: "py env; rm -rf ~".into(),
            }),
            working_dir: Some("/workspace/YuE-Interface/inference".into()),
            ..Default::default()
        };
        let spec = build_command(&cfg(), &settings, &inputs());
        assert_eq!(spec.program(), "bash");
        let args = spec.get_args();
        assert_eq!(args[0], "-c");
        assert_eq!(args[1], CONDA_SCRIPT);
        assert_eq!(args[2], "/opt/conda/etc/profile.d/conda.sh");
        assert_eq!(args[3], "py env; rm -rf ~");
        assert_eq!(args[4], "python");
        assert_eq!(args[5], "infer.py");
        assert_eq!(
            spec.get_current_dir(),
            Some(Path::new("/workspace/YuE-Interface/inference"))
        );
    }

    #[test]
    fn validation_fails_fast() {
        let empty_genre = GenerationConfig {
            genre: "  ".into(),
            ..cfg()
        };
        assert!(matches!(validate(&empty_genre), Err(LaunchError::InvalidConfig(_))));

        let mmgp_quantized = GenerationConfig {
            mmgp_profile: MmgpProfile::try_from(1).ok(),
            stage2_quantization: Quantization::Int8,
            ..cfg()
        };
        assert!(matches!(validate(&mmgp_quantized), Err(LaunchError::InvalidConfig(_))));

        let missing_prompt = GenerationConfig {
            prompt: Some(PromptConditioning::Single {
                audio: "/no/such/prompt.mp3".into(),
                start_secs: 0.0,
                end_secs: 30.0,
            }),
            ..cfg()
        };
        assert!(matches!(validate(&missing_prompt), Err(LaunchError::MissingFile(_))));

        let dir = tempfile::tempdir().unwrap();
        let notes = dir.path().join("notes.txt");
        std::fs::write(&notes, "x").unwrap();
        let wrong_format = GenerationConfig {
            prompt: Some(PromptConditioning::Single {
                audio: notes,
                start_secs: 0.0,
                end_secs: 30.0,
            }),
            ..cfg()
        };
        assert!(matches!(validate(&wrong_format), Err(LaunchError::UnsupportedAudio(_))));

        let song = dir.path().join("song.MP3");
        std::fs::write(&song, "x").unwrap();
        let backwards = GenerationConfig {
            prompt: Some(PromptConditioning::Single {
                audio: song,
                start_secs: 30.0,
                end_secs: 10.0,
            }),
            ..cfg()
        };
        assert!(matches!(validate(&backwards), Err(LaunchError::InvalidConfig(_))));

        assert!(validate(&cfg()).is_ok());
    }

    #[test]
    fn sanitizes_staged_file_names() {
        assert_eq!(sanitize_file_name("my song (v2).mp3"), "my_song__v2_.mp3");
        assert_eq!(sanitize_file_name("ünï.wav"), "_n_.wav");

        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("ref track.mp3");
        std::fs::write(&src, b"ID3").unwrap();
        let input_dir = dir.path().join("inputs");
        let staged = stage_audio(&src, &input_dir).unwrap();
        assert_eq!(staged, input_dir.join("ref_track.mp3"));
        assert_eq!(std::fs::read(&staged).unwrap(), b"ID3");
    }

    #[test]
    fn prepare_writes_text_files_and_creates_output_dir() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = GenerationConfig {
            output_dir: dir.path().join("outputs"),
            ..cfg()
        };
        let settings = LauncherSettings {
            input_dir: dir.path().join("inputs"),
            ..Default::default()
        };
        let prepared = prepare(&cfg, &settings).unwrap();
        assert!(cfg.output_dir.is_dir());
        assert_eq!(prepared.scratch.len(), 2);

        let lyrics_path = value_of(&prepared.spec, "--lyrics_txt").unwrap().to_string();
        assert_eq!(std::fs::read_to_string(&lyrics_path).unwrap(), cfg.lyrics);
        drop(prepared);
        assert!(!Path::new(&lyrics_path).exists());
    }

    #[test]
    fn dual_track_prompts_with_the_same_name_stay_distinct() {
        let dir = tempfile::tempdir().unwrap();
        for (sub, bytes) in [("v", b"VOCAL".as_slice()), ("i", b"INSTR".as_slice())] {
            std::fs::create_dir_all(dir.path().join(sub)).unwrap();
            std::fs::write(dir.path().join(sub).join("track.mp3"), bytes).unwrap();
        }
        let cfg = GenerationConfig {
            output_dir: dir.path().join("outputs"),
            prompt: Some(PromptConditioning::DualTrack {
                vocal: dir.path().join("v/track.mp3"),
                instrumental: dir.path().join("i/track.mp3"),
                start_secs: 0.0,
                end_secs: 30.0,
            }),
            ..cfg()
        };
        let settings = LauncherSettings {
            input_dir: dir.path().join("inputs"),
            ..Default::default()
        };
        let prepared = prepare(&cfg, &settings).unwrap();

        let vocal = value_of(&prepared.spec, "--vocal_track_prompt_path").unwrap();
        let instrumental = value_of(&prepared.spec, "--instrumental_track_prompt_path").unwrap();
        assert_ne!(vocal, instrumental);
        assert_eq!(Path::new(vocal), settings.input_dir.join("vocal_track.mp3"));
        assert_eq!(std::fs::read(vocal).unwrap(), b"VOCAL");
        assert_eq!(std::fs::read(instrumental).unwrap(), b"INSTR");
    }
}
