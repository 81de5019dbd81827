use crate::model::{
    CondaEnv, GenerationConfig, LauncherSettings, MmgpProfile, PromptConditioning, Quantization,
    DEFAULT_MARKER,
};
use crate::orchestrator::{process_run_completion, SessionController};
use crate::runner::RunHandle;
use anyhow::{Context, Result};
use clap::Parser;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

/// Output line routing for stdout/stderr writer.
#[derive(Debug, PartialEq)]
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "yue-panel",
    version,
    about = "Launch YuE music generation runs and follow their output, with optional TUI"
)]
pub struct Cli {
    /// Run one generation, stream its log to stdout and exit (no TUI)
    #[arg(long)]
    pub headless: bool,

    /// Start generating as soon as the TUI opens
    #[arg(long)]
    pub generate_on_launch: bool,

    /// Load generation parameters from a JSON preset
    #[arg(long)]
    pub preset: Option<PathBuf>,

    /// Write the effective generation parameters to a JSON preset
    #[arg(long)]
    pub save_preset: Option<PathBuf>,

    /// Python interpreter used to run the inference script
    #[arg(long, default_value = "python")]
    pub python: String,

    /// Inference script
    #[arg(long, default_value = "infer.py")]
    pub infer_script: PathBuf,

    /// Inference checkout; codec checkpoints are resolved under it
    #[arg(long, default_value = "/workspace/YuE-Interface")]
    pub project_dir: PathBuf,

    /// Working directory for the inference process
    #[arg(long)]
    pub working_dir: Option<PathBuf>,

    /// Directory prompt audio is copied into before a run
    #[arg(long, default_value = "/workspace/inputs")]
    pub input_dir: PathBuf,

    /// Conda activate script (e.g. /opt/conda/etc/profile.d/conda.sh)
    #[arg(long, requires = "conda_env")]
    pub conda_activate: Option<PathBuf>,

    /// Conda environment to activate before running the script
    #[arg(long, requires = "conda_activate")]
    pub conda_env: Option<String>,

    /// Time between SIGTERM and SIGKILL when stopping a run
    #[arg(long, default_value = "2s")]
    pub grace_period: humantime::Duration,

    /// How often the log view is refreshed
    #[arg(long, default_value = "500ms")]
    pub poll_interval: humantime::Duration,

    /// Log text that announces the finished audio file
    #[arg(long, default_value = DEFAULT_MARKER)]
    pub marker: String,

    /// Stage 1 model path or hub id
    #[arg(long)]
    pub stage1_model: Option<String>,

    /// Stage 1 quantization (bf16, int8, int4, nf4)
    #[arg(long)]
    pub stage1_quantization: Option<Quantization>,

    /// Stage 2 model path or hub id
    #[arg(long)]
    pub stage2_model: Option<String>,

    /// Stage 2 quantization (bf16, int8, int4, nf4)
    #[arg(long)]
    pub stage2_quantization: Option<Quantization>,

    /// Tokenizer model file
    #[arg(long)]
    pub tokenizer: Option<PathBuf>,

    /// Genre tags, e.g. "inspiring female uplifting pop airy vocal"
    #[arg(long, conflicts_with = "genre_file")]
    pub genre: Option<String>,

    /// Read genre tags from a file
    #[arg(long)]
    pub genre_file: Option<PathBuf>,

    /// Lyrics with [verse]/[chorus] section labels
    #[arg(long, conflicts_with = "lyrics_file")]
    pub lyrics: Option<String>,

    /// Read lyrics from a file
    #[arg(long)]
    pub lyrics_file: Option<PathBuf>,

    /// Number of lyric segments to generate
    #[arg(long)]
    pub run_n_segments: Option<u32>,

    /// Stage 2 batch size
    #[arg(long)]
    pub stage2_batch_size: Option<u32>,

    /// Output directory
    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    /// CUDA device index
    #[arg(long)]
    pub cuda_idx: Option<u32>,

    /// Max new tokens per segment
    #[arg(long)]
    pub max_new_tokens: Option<u32>,

    /// Random seed
    #[arg(long)]
    pub seed: Option<u64>,

    /// Repetition penalty
    #[arg(long)]
    pub repetition_penalty: Option<f64>,

    /// Condition on a single reference track
    #[arg(long, conflicts_with_all = ["vocal_prompt", "instrumental_prompt"])]
    pub audio_prompt: Option<PathBuf>,

    /// Condition on a vocal track (needs --instrumental-prompt)
    #[arg(long, requires = "instrumental_prompt")]
    pub vocal_prompt: Option<PathBuf>,

    /// Condition on an instrumental track (needs --vocal-prompt)
    #[arg(long, requires = "vocal_prompt")]
    pub instrumental_prompt: Option<PathBuf>,

    /// Start of the prompt window in seconds
    #[arg(long, default_value_t = 0.0)]
    pub prompt_start: f64,

    /// End of the prompt window in seconds
    #[arg(long, default_value_t = 30.0)]
    pub prompt_end: f64,

    /// Keep the model on the GPU between stages
    #[arg(long)]
    pub disable_offload_model: bool,

    /// Keep intermediate outputs
    #[arg(long)]
    pub keep_intermediate: bool,

    /// MMGP memory profile (1, 3 or 4); requires bf16 for both stages
    #[arg(long, value_parser = parse_mmgp_profile)]
    pub mmgp_profile: Option<MmgpProfile>,

    /// Use SDPA attention
    #[arg(long)]
    pub sdpa: bool,

    /// Compile the model (slow first run)
    #[arg(long)]
    pub compile: bool,
}

fn parse_mmgp_profile(s: &str) -> Result<MmgpProfile, String> {
    let n: u8 = s.parse().map_err(|e| format!("{e}"))?;
    MmgpProfile::try_from(n)
}

pub async fn run(args: Cli) -> Result<()> {
    let settings = build_settings(&args);
    let cfg = build_generation_config(&args)?;

    if let Some(p) = args.save_preset.as_deref() {
        save_preset(p, &cfg)?;
    }

    if !args.headless {
        #[cfg(feature = "tui")]
        {
            return crate::tui::run(args, settings, cfg).await;
        }
        #[cfg(not(feature = "tui"))]
        {
            // Fallback when built without TUI support.
            return run_text(settings, cfg).await;
        }
    }

    run_text(settings, cfg).await
}

/// Build `LauncherSettings` from CLI arguments.
pub fn build_settings(args: &Cli) -> LauncherSettings {
    let conda = match (&args.conda_activate, &args.conda_env) {
        (Some(activate_script), Some(env_name)) => Some(CondaEnv {
            activate_script: activate_script.clone(),
            env_name: env_name.clone(),
        }),
        _ => None,
    };
    LauncherSettings {
        python: args.python.clone(),
        infer_script: args.infer_script.clone(),
        project_dir: args.project_dir.clone(),
        working_dir: args.working_dir.clone(),
        input_dir: args.input_dir.clone(),
        conda,
        grace_period: Duration::from(args.grace_period),
        poll_interval: Duration::from(args.poll_interval),
        marker: args.marker.clone(),
    }
}

/// Preset to start from: `--preset` when given, else the default preset if it exists.
pub fn preset_path(args: &Cli) -> Option<PathBuf> {
    args.preset
        .clone()
        .or_else(|| default_preset_path().filter(|p| p.exists()))
}

pub fn default_preset_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("yue-panel").join("preset.json"))
}

pub fn load_preset(path: &Path) -> Result<GenerationConfig> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read preset {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("invalid preset {}", path.display()))
}

pub fn save_preset(path: &Path, cfg: &GenerationConfig) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let data = serde_json::to_string_pretty(cfg)?;
    std::fs::write(path, data).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

/// Build a `GenerationConfig`: preset (or defaults) overridden by CLI arguments.
pub fn build_generation_config(args: &Cli) -> Result<GenerationConfig> {
    let base = match preset_path(args) {
        Some(p) => load_preset(&p)?,
        None => GenerationConfig::default(),
    };
    apply_overrides(base, args)
}

fn apply_overrides(mut cfg: GenerationConfig, args: &Cli) -> Result<GenerationConfig> {
    if let Some(v) = &args.stage1_model {
        cfg.stage1_model = v.clone();
    }
    if let Some(v) = args.stage1_quantization {
        cfg.stage1_quantization = v;
    }
    if let Some(v) = &args.stage2_model {
        cfg.stage2_model = v.clone();
    }
    if let Some(v) = args.stage2_quantization {
        cfg.stage2_quantization = v;
    }
    if let Some(v) = &args.tokenizer {
        cfg.tokenizer = v.clone();
    }
    if let Some(text) = text_arg(args.genre.as_deref(), args.genre_file.as_deref())? {
        cfg.genre = text;
    }
    if let Some(text) = text_arg(args.lyrics.as_deref(), args.lyrics_file.as_deref())? {
        cfg.lyrics = text;
    }
    if let Some(v) = args.run_n_segments {
        cfg.run_n_segments = v;
    }
    if let Some(v) = args.stage2_batch_size {
        cfg.stage2_batch_size = v;
    }
    if let Some(v) = &args.output_dir {
        cfg.output_dir = v.clone();
    }
    if let Some(v) = args.cuda_idx {
        cfg.cuda_idx = v;
    }
    if let Some(v) = args.max_new_tokens {
        cfg.max_new_tokens = v;
    }
    if let Some(v) = args.seed {
        cfg.seed = v;
    }
    if let Some(v) = args.repetition_penalty {
        cfg.repetition_penalty = v;
    }

    if let Some(audio) = &args.audio_prompt {
        cfg.prompt = Some(PromptConditioning::Single {
            audio: audio.clone(),
            start_secs: args.prompt_start,
            end_secs: args.prompt_end,
        });
    } else if let (Some(vocal), Some(instrumental)) = (&args.vocal_prompt, &args.instrumental_prompt)
    {
        cfg.prompt = Some(PromptConditioning::DualTrack {
            vocal: vocal.clone(),
            instrumental: instrumental.clone(),
            start_secs: args.prompt_start,
            end_secs: args.prompt_end,
        });
    }

    // Switches only turn things on; a preset is the place to keep them on.
    cfg.disable_offload_model |= args.disable_offload_model;
    cfg.keep_intermediate |= args.keep_intermediate;
    cfg.sdpa |= args.sdpa;
    cfg.compile |= args.compile;
    if args.mmgp_profile.is_some() {
        cfg.mmgp_profile = args.mmgp_profile;
    }
    Ok(cfg)
}

fn text_arg(inline: Option<&str>, file: Option<&Path>) -> Result<Option<String>> {
    match (inline, file) {
        (Some(text), _) => Ok(Some(text.to_string())),
        (None, Some(path)) => std::fs::read_to_string(path)
            .map(Some)
            .with_context(|| format!("failed to read {}", path.display())),
        (None, None) => Ok(None),
    }
}

/// Run once without the TUI: stream the log to stdout, Ctrl-C stops the run.
async fn run_text(settings: LauncherSettings, cfg: GenerationConfig) -> Result<()> {
    let poll_interval = settings.poll_interval;
    let session = Arc::new(SessionController::new(settings).context("invalid launcher settings")?);
    let handle = session.try_start(&cfg).context("inference did not start")?;
    let run_id = handle.pid();

    let (out_tx, out_handle) = spawn_output_writer();
    let _ = out_tx.send(OutputLine::Stderr(format!("$ {}", handle.spec().display())));
    let _ = out_tx.send(OutputLine::Stderr(format!(
        "Inference started (pid {run_id}). Outputs will be saved in {}...",
        cfg.output_dir.display()
    )));

    let mut sigint = signal(SignalKind::interrupt()).context("failed to listen for Ctrl-C")?;
    let (interrupt_tx, mut interrupt_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while sigint.recv().await.is_some() {
            if interrupt_tx.send(()).is_err() {
                break;
            }
        }
    });

    let audio = follow_run(&session, &handle, &mut interrupt_rx, &out_tx, poll_interval).await?;

    let cancelled = handle.is_cancelled();
    let processed = process_run_completion(&cfg.output_dir, audio.as_deref());
    for msg in processed.messages {
        let _ = out_tx.send(OutputLine::Stderr(msg));
    }
    drop(out_tx);
    let _ = out_handle.await;

    if cancelled {
        anyhow::bail!("run {run_id} was stopped before it finished");
    }
    if processed.audio.is_none() {
        anyhow::bail!("run {run_id} finished without producing audio");
    }
    Ok(())
}

/// Relay the run's output until it exits. Each interrupt requests a stop; another
/// interrupt is accepted once the previous stop has reported back.
async fn follow_run(
    session: &Arc<SessionController>,
    handle: &RunHandle,
    interrupts: &mut mpsc::UnboundedReceiver<()>,
    out_tx: &mpsc::UnboundedSender<OutputLine>,
    poll_interval: Duration,
) -> Result<Option<PathBuf>> {
    let run_id = handle.pid();
    let mut audio: Option<PathBuf> = None;
    let mut stop_task: Option<tokio::task::JoinHandle<String>> = None;
    let mut ticker = tokio::time::interval(poll_interval);

    let flush = |audio: &mut Option<PathBuf>| {
        // Lines are printed as they arrive, so the log is not accumulated here.
        let update = session.poll(String::new(), audio.take());
        *audio = update.audio;
        if !update.changed {
            return;
        }
        for line in update.log.lines() {
            let _ = out_tx.send(OutputLine::Stdout(line.to_string()));
        }
    };

    loop {
        tokio::select! {
            _ = ticker.tick() => flush(&mut audio),
            _ = handle.exited() => break,
            Some(()) = interrupts.recv(), if stop_task.is_none() => {
                let session = session.clone();
                stop_task = Some(tokio::spawn(async move {
                    session.request_stop(Some(run_id)).await
                }));
            }
            // A failed stop leaves the run alive; clearing the task lets Ctrl-C retry.
            stopped = async {
                match stop_task.as_mut() {
                    Some(task) => task.await,
                    None => futures::future::pending().await,
                }
            } => {
                stop_task = None;
                let msg = stopped.context("stop task failed")?;
                let _ = out_tx.send(OutputLine::Stderr(msg));
            }
        }
    }
    // Everything captured before the process was reaped is already queued.
    flush(&mut audio);

    let took = time::OffsetDateTime::now_utc() - handle.started_at();
    let _ = out_tx.send(OutputLine::Stderr(format!(
        "Run finished after {}s",
        took.whole_seconds()
    )));
    if let Some(task) = stop_task {
        let msg = task.await.context("stop task failed")?;
        let _ = out_tx.send(OutputLine::Stderr(msg));
    }
    Ok(audio)
}
