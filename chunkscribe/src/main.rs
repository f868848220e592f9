//! Chunkscribe CLI - transcribe audio and video files through OpenAI-compatible APIs
mod fmt;

use chrono::Local;
use chunkscribe_core::export::{self, ExportFormat};
use chunkscribe_core::media::{FfmpegTranscoder, FfprobeProber, MediaChunker, MediaProber};
use chunkscribe_core::{
    build_queue, FileTranscriptionTask, PipelineConfig, QueueEvent, QueueHandle, ScratchDir,
    TaskId, TaskInput, TaskKind, TaskRunner, TaskStatus, TranscriptionOptions,
    TranscriptionTaskQueue,
};
use clap::{Parser, Subcommand};
use futures::{Stream, StreamExt as _};
use indicatif::{HumanBytes, HumanDuration, MultiProgress, ProgressBar, ProgressStyle};
use owo_colors::OwoColorize as _;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::fmt::CompactFormatter;

const BYTES_PER_MB: u64 = 1024 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging
    if cli.verbose {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_env_filter(EnvFilter::builder().parse("trace,hyper=info,reqwest=debug")?)
            .with_writer(std::io::stderr)
            .init();
    } else {
        let filter = match EnvFilter::try_from_default_env() {
            Ok(filter) => filter,
            Err(_) => EnvFilter::builder().parse("info,hyper=warn,reqwest=warn")?,
        };
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .compact()
            .without_time()
            .with_target(false)
            .event_format(CompactFormatter)
            .with_writer(std::io::stderr)
            .init();
    }
    debug!("Command line arguments: {:?}", cli);

    let config = match effective_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            process::exit(2);
        }
    };

    // Handle subcommands
    if let Some(command) = cli.command.clone() {
        return handle_command(command, &cli, &config).await;
    }

    if cli.inputs.is_empty() {
        error!("No input specified. Pass one or more files or URLs to transcribe.");
        process::exit(1);
    }

    let options = transcription_options(&cli);
    let mut tasks = Vec::with_capacity(cli.inputs.len());
    for input in &cli.inputs {
        let task = match parse_input(input, options.clone()) {
            Ok(task) => task,
            Err(e) => {
                error!("{}", e);
                process::exit(1);
            }
        };
        tasks.push(task);
    }

    let failed = run_tasks(&cli, &config, tasks).await?;
    if failed > 0 {
        process::exit(1);
    }
    Ok(())
}

const ABOUT: &str = "Transcribe or translate audio and video files, in size-bounded chunks";
#[derive(Parser, Debug)]
#[command(name = env!("CARGO_PKG_NAME"), author = env!("CARGO_PKG_AUTHORS"))]
#[command(about = ABOUT)]
#[command(version)]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Files or http(s) URLs to transcribe (when no subcommand)
    #[arg(value_name = "INPUT")]
    inputs: Vec<String>,

    /// Transcribe in the spoken language, or translate to English
    #[arg(long, value_enum, default_value = "transcribe")]
    task: TaskArg,

    /// Language code (e.g., en, es, fr). Auto-detect if not specified
    #[arg(short, long)]
    language: Option<String>,

    /// Backend model identifier
    #[arg(short, long)]
    model: Option<String>,

    /// API key for the transcription backend
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// API root of an OpenAI-compatible server
    #[arg(long)]
    base_url: Option<String>,

    /// Largest chunk uploaded in one request, in MiB
    #[arg(long, value_name = "MB")]
    max_chunk_mb: Option<u64>,

    /// Number of files transcribed at the same time
    #[arg(short, long)]
    workers: Option<usize>,

    /// Output format: text, json, srt, vtt, txt
    #[arg(short, long, value_enum, default_value = "text")]
    output: OutputFormat,

    /// Write transcripts into this directory instead of stdout
    #[arg(short = 'd', long)]
    output_dir: Option<PathBuf>,

    /// Configuration file (JSON)
    #[arg(short, long, env = "CHUNKSCRIBE_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug, Clone)]
enum Commands {
    /// Normalize and probe a file, then show how it would be chunked
    Probe {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
    /// Configuration file commands
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand, Debug, Clone)]
enum ConfigCommands {
    /// Print the default configuration file location
    Path,
    /// Print the effective configuration
    Show,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum TaskArg {
    Transcribe,
    Translate,
}

impl From<TaskArg> for TaskKind {
    fn from(arg: TaskArg) -> Self {
        match arg {
            TaskArg::Transcribe => TaskKind::Transcribe,
            TaskArg::Translate => TaskKind::Translate,
        }
    }
}

/// Output format options
#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum OutputFormat {
    /// Plain text with timestamps
    Text,
    /// JSON task record with segments
    Json,
    /// SRT subtitle format
    Srt,
    /// WebVTT subtitle format
    Vtt,
    /// Plain text output (clean, no timestamps)
    Txt,
}

impl From<OutputFormat> for ExportFormat {
    fn from(format: OutputFormat) -> Self {
        match format {
            OutputFormat::Text => ExportFormat::Text,
            OutputFormat::Json => ExportFormat::Json,
            OutputFormat::Srt => ExportFormat::Srt,
            OutputFormat::Vtt => ExportFormat::Vtt,
            OutputFormat::Txt => ExportFormat::Txt,
        }
    }
}

/// Config file values, overridden by command line flags
fn effective_config(cli: &Cli) -> anyhow::Result<PipelineConfig> {
    let mut config = PipelineConfig::load(cli.config.as_deref())?;

    if let Some(ref base_url) = cli.base_url {
        config = config.with_base_url(base_url.clone());
    }
    if let Some(ref api_key) = cli.api_key {
        config = config.with_api_key(api_key.clone());
    }
    if let Some(mb) = cli.max_chunk_mb {
        config = config.with_max_chunk_bytes(mb.saturating_mul(BYTES_PER_MB));
    }
    if let Some(workers) = cli.workers {
        config = config.with_workers(workers);
    }

    config.validate()?;
    Ok(config)
}

fn transcription_options(cli: &Cli) -> TranscriptionOptions {
    let mut options = TranscriptionOptions::new().with_task(cli.task.into());
    if let Some(ref language) = cli.language {
        options = options.with_language(language.clone());
    }
    if let Some(ref model) = cli.model {
        options = options.with_model(model.clone());
    }
    options
}

/// A URL becomes a download task, anything else must be an existing file
fn parse_input(input: &str, options: TranscriptionOptions) -> anyhow::Result<FileTranscriptionTask> {
    if input.starts_with("http://") || input.starts_with("https://") {
        return Ok(FileTranscriptionTask::from_url(input, options));
    }
    let path = Path::new(input);
    if !path.exists() {
        anyhow::bail!("Input file not found: {}", path.display());
    }
    Ok(FileTranscriptionTask::from_file(path, options))
}

/// Run every task through the queue; returns how many failed
async fn run_tasks(
    cli: &Cli,
    config: &PipelineConfig,
    tasks: Vec<FileTranscriptionTask>,
) -> anyhow::Result<usize> {
    let to_stdout = cli.output_dir.is_none() && tasks.len() == 1;
    let tasks: Vec<_> = tasks
        .into_iter()
        .map(|task| {
            let dir = match (&cli.output_dir, &task.input) {
                (Some(dir), _) => dir.clone(),
                (None, TaskInput::File(path)) => path
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .unwrap_or(Path::new("."))
                    .to_path_buf(),
                (None, TaskInput::Url(_)) => PathBuf::from("."),
            };
            task.with_output_directory(dir)
        })
        .collect();

    let (queue, handle) = build_queue(config)?;
    let events = handle.events();
    drive(queue, handle, events, tasks, ExportFormat::from(cli.output), to_stdout).await
}

/// Submit `tasks`, follow `events` until the queue has finished them all,
/// and deliver each transcript as it completes. Returns how many failed.
async fn drive<R, S>(
    queue: TranscriptionTaskQueue<R>,
    handle: QueueHandle,
    events: S,
    tasks: Vec<FileTranscriptionTask>,
    format: ExportFormat,
    to_stdout: bool,
) -> anyhow::Result<usize>
where
    R: TaskRunner,
    S: Stream<Item = QueueEvent>,
{
    let mut events = std::pin::pin!(events);
    let mut worker = tokio::spawn(queue.run());

    let multi = MultiProgress::new();
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} {prefix:.bold} [{bar:30.cyan/blue}] {pos}/{len} {msg}")?
        .progress_chars("#>-");

    let mut bars: HashMap<TaskId, ProgressBar> = HashMap::new();
    for task in tasks {
        let bar = multi.add(ProgressBar::new(1));
        bar.set_style(style.clone());
        bar.set_prefix(task.input.display_name());
        bar.set_message("queued");
        bars.insert(task.id, bar);
        handle.add_task(task)?;
    }

    let mut settled: HashSet<TaskId> = HashSet::new();
    let mut failed = 0;
    let mut lagged = false;
    let mut stopping = false;
    let mut worker_done = false;

    loop {
        let mut check_done = false;
        tokio::select! {
            biased;
            event = events.next() => match event {
                None | Some(QueueEvent::Completed) => break,
                Some(QueueEvent::Lagged { skipped }) => {
                    multi.suspend(|| warn!("Missed {} queue updates, resynchronizing", skipped));
                    lagged = true;
                    check_done = true;
                }
                Some(QueueEvent::Progress { task_id, progress }) => {
                    if let Some(bar) = bars.get(&task_id) {
                        bar.set_length(progress.total as u64);
                        bar.set_position(progress.completed as u64);
                    }
                }
                Some(QueueEvent::TaskUpdated(task)) => {
                    let Some(bar) = bars.get(&task.id) else {
                        continue;
                    };
                    if task.status.is_terminal() && !settled.insert(task.id) {
                        continue;
                    }
                    match task.status {
                        TaskStatus::Queued => bar.set_message("queued"),
                        TaskStatus::InProgress => {
                            bar.set_message(match task.options.task {
                                TaskKind::Transcribe => "transcribing",
                                TaskKind::Translate => "translating",
                            });
                            bar.enable_steady_tick(Duration::from_millis(120));
                        }
                        TaskStatus::Completed => {
                            match deliver(&multi, &task, format, to_stdout).await {
                                Ok(()) => bar.finish_with_message("done".green().to_string()),
                                Err(e) => {
                                    failed += 1;
                                    bar.abandon_with_message("not written".red().to_string());
                                    multi.suspend(|| {
                                        error!("{}: could not write transcript: {:#}", task.input, e)
                                    });
                                }
                            }
                        }
                        TaskStatus::Failed => {
                            failed += 1;
                            bar.abandon_with_message("failed".red().to_string());
                            multi.suspend(|| {
                                error!(
                                    "{}: {}",
                                    task.input,
                                    task.error.as_deref().unwrap_or("unknown error")
                                )
                            });
                        }
                        TaskStatus::Canceled => {
                            bar.abandon_with_message("cancelled".yellow().to_string());
                        }
                    }
                    check_done = task.status.is_terminal();
                }
            },
            _ = tokio::signal::ctrl_c(), if !stopping => {
                warn!("Interrupted, cancelling remaining tasks");
                for id in bars.keys() {
                    handle.cancel_task(*id)?;
                }
                handle.stop()?;
                stopping = true;
            }
            // The run loop sends Completed right before it returns; only
            // reached when that event was lost to a lag
            _ = &mut worker => {
                worker_done = true;
                break;
            }
        }

        if check_done && !stopping && all_settled(&handle, &bars, &settled, lagged).await {
            if let Err(e) = handle.stop() {
                debug!("queue already closed: {}", e);
            }
            stopping = true;
        }
    }

    if !worker_done {
        worker.await?;
    }

    for (id, bar) in &bars {
        if !settled.contains(id) {
            failed += 1;
            bar.abandon_with_message("no result".red().to_string());
            error!("{}: the queue finished without reporting a result", bar.prefix());
        }
    }
    Ok(failed)
}

/// Whether every submitted task has reached a terminal status. After a lag
/// some terminal updates may never arrive, so the queue is asked directly.
async fn all_settled(
    handle: &QueueHandle,
    bars: &HashMap<TaskId, ProgressBar>,
    settled: &HashSet<TaskId>,
    lagged: bool,
) -> bool {
    if settled.len() == bars.len() {
        return true;
    }
    if !lagged {
        return false;
    }
    match handle.unfinished().await {
        Ok(unfinished) => {
            debug!(unfinished = unfinished.len(), "resynchronized with the queue");
            !unfinished.iter().any(|id| bars.contains_key(id))
        }
        Err(_) => true,
    }
}

/// Print or write a finished transcript
async fn deliver(
    multi: &MultiProgress,
    task: &FileTranscriptionTask,
    format: ExportFormat,
    to_stdout: bool,
) -> anyhow::Result<()> {
    if to_stdout {
        let rendered = export::render(task, format)?;
        multi.suspend(|| print!("{}", rendered));
        return Ok(());
    }

    let dir = task
        .output_directory
        .clone()
        .unwrap_or_else(|| PathBuf::from("."));
    let path = export::write_export(task, format, &dir, &Local::now()).await?;

    let elapsed = match (task.started_at, task.completed_at) {
        (Some(start), Some(end)) => (end - start).to_std().unwrap_or_default(),
        _ => Duration::ZERO,
    };
    multi.suspend(|| {
        println!(
            "{} {} in {:#} -> {}",
            "Success:".green().bold(),
            task.input.display_name(),
            HumanDuration(elapsed).cyan(),
            path.display()
        )
    });
    Ok(())
}

async fn handle_command(command: Commands, cli: &Cli, config: &PipelineConfig) -> anyhow::Result<()> {
    match command {
        Commands::Probe { file } => handle_probe(&file, config, cli.verbose).await,
        Commands::Config { command } => handle_config_command(command, config),
    }
}

/// Show duration, intermediate size and chunk plan without calling the backend
async fn handle_probe(file: &Path, config: &PipelineConfig, verbose: bool) -> anyhow::Result<()> {
    if !file.exists() {
        error!("Input file not found: {}", file.display());
        process::exit(1);
    }

    let chunker = MediaChunker::new(
        FfmpegTranscoder::new(&config.ffmpeg_path),
        ScratchDir::new(&config.scratch_dir),
        config.max_chunk_bytes,
    );
    let prober = FfprobeProber::new(&config.ffprobe_path);

    info!("Normalizing {}", file.display());
    let audio = chunker.normalize(file).await?;
    let info = prober.probe(audio.path()).await?;
    let plan = chunker.plan(&audio, info.duration_secs);

    println!("{}", "Media Summary:".green().bold());
    println!(
        "Duration: {}",
        HumanDuration(Duration::from_secs_f64(info.duration_secs)).cyan()
    );
    println!(
        "Intermediate audio: {} (limit {})",
        HumanBytes(audio.size_bytes()).cyan(),
        HumanBytes(config.max_chunk_bytes)
    );
    if plan.is_split() {
        println!("Chunks: {}", plan.len().to_string().cyan());
    } else {
        println!("Chunks: {} (sent whole)", "1".cyan());
    }
    if verbose || plan.is_split() {
        for span in plan.spans() {
            println!(
                "  #{:<3} {:>10.3}s -> {:>10.3}s",
                span.index + 1,
                span.start_secs,
                span.end_secs
            );
        }
    }
    Ok(())
}

fn handle_config_command(command: ConfigCommands, config: &PipelineConfig) -> anyhow::Result<()> {
    match command {
        ConfigCommands::Path => {
            println!("{}", PipelineConfig::default_path()?.display());
        }
        ConfigCommands::Show => {
            println!("{}", serde_json::to_string_pretty(&redacted(config))?);
        }
    }
    Ok(())
}

fn redacted(config: &PipelineConfig) -> PipelineConfig {
    let mut shown = config.clone();
    if shown.backend.api_key.is_some() {
        shown.backend.api_key = Some("<redacted>".to_string());
    }
    shown
}
