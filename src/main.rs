use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use av_composer::{
    composition::{BoundaryPolicy, LengthPolicy},
    config::{Config, OutputCategory},
    engine::ExecutionEngine,
    media::{manifest::MANIFEST_FILE, FrameRate, MediaSource, StoragePolicy},
    planner::{CompositionRequest, Destination, Operation, RequestOptions, SourceSpec, StageInvocation},
    stages::{ParamValue, StageParams, StageRegistry},
};

#[derive(Parser)]
#[command(
    name = "av-composer",
    version,
    about = "Enhance audio and video assets and compose them into one synchronized file",
    long_about = "AV-Composer runs enhancement stages over audio and video sources, then concatenates them or binds an audio track to a video with explicit length policies. Every request is validated before any media is decoded."
)]
struct Cli {
    /// Configuration file (optional)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Keep intermediates on disk instead of in memory
    #[arg(long, global = true)]
    on_disk: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a stage chain over one source
    Enhance(EnhanceArgs),
    /// Join sources end to end, in the order given
    Concat(ConcatArgs),
    /// Bind an audio source to a video source
    Attach(AttachArgs),
    /// List the available stages and their parameters
    Stages,
    /// Write a configuration file with default values
    InitConfig {
        #[arg(default_value = "av-composer.toml")]
        path: PathBuf,
    },
}

#[derive(Args)]
struct EnhanceArgs {
    /// Source file or frame directory
    #[arg(short, long)]
    input: PathBuf,

    /// Stage to apply, as `name` or `name:key=value,key=value`; repeatable
    #[arg(short, long = "stage")]
    stages: Vec<String>,

    /// Output file name, resolved under the enhanced output directory
    #[arg(short, long)]
    output: PathBuf,

    /// Frame rate for plain image directories
    #[arg(long)]
    fps: Option<f64>,
}

#[derive(Args)]
struct ConcatArgs {
    /// Sources to join, in order
    #[arg(short, long = "input", required = true)]
    inputs: Vec<PathBuf>,

    /// Output file name, resolved under the merged output directory
    #[arg(short, long)]
    output: PathBuf,

    /// How inputs ending on a partial unit are squared off (pad, truncate)
    #[arg(long)]
    boundary: Option<BoundaryPolicy>,

    /// Frame rate for plain image directories
    #[arg(long)]
    fps: Option<f64>,
}

#[derive(Args)]
struct AttachArgs {
    /// Video source
    #[arg(long)]
    video: PathBuf,

    /// Audio source
    #[arg(long)]
    audio: PathBuf,

    /// Stage applied to the video before attaching; repeatable
    #[arg(long = "video-stage")]
    video_stages: Vec<String>,

    /// Stage applied to the audio before attaching; repeatable
    #[arg(long = "audio-stage")]
    audio_stages: Vec<String>,

    /// Seconds of silence before the audio starts
    #[arg(long, default_value_t = 0.0)]
    offset: f64,

    /// How shorter audio is reconciled (trim, loop, pad-silence)
    #[arg(long)]
    policy: Option<LengthPolicy>,

    /// Mismatch accepted without a policy, in milliseconds
    #[arg(long)]
    tolerance_ms: Option<u64>,

    /// Output file name, resolved under the final output directory
    #[arg(short, long)]
    output: PathBuf,

    /// Frame rate for plain image directories
    #[arg(long)]
    fps: Option<f64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    info!("Starting AV-Composer v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = match &cli.config {
        Some(config_path) => {
            info!("Loading configuration from {:?}", config_path);
            Config::from_file(config_path)?
        }
        None => {
            info!("Using default configuration");
            Config::default()
        }
    };

    let mut options = config.request_options();
    if cli.on_disk {
        options.storage_policy = StoragePolicy::OnDisk;
    }

    let (request, category) = match cli.command {
        Commands::Stages => {
            list_stages();
            return Ok(());
        }
        Commands::InitConfig { path } => {
            Config::default().save_to_file(&path)?;
            info!("Wrote default configuration to {:?}", path);
            return Ok(());
        }
        Commands::Enhance(args) => enhance_request(args, options)?,
        Commands::Concat(args) => concat_request(args, options)?,
        Commands::Attach(args) => attach_request(args, options)?,
    };

    let request = resolve_destination(request, &config, category);
    let engine = ExecutionEngine::new(&config)?;
    match engine.execute(request).await {
        Ok(output) => {
            match &output.destination {
                Some(path) => info!("Done! Output saved to: {:?}", path),
                None => info!("Done! {:?} lasting {:?}", output.segment.kind(), output.segment.duration()),
            }
            Ok(())
        }
        Err(e) => {
            error!("{}", e);
            bail!(e.user_message())
        }
    }
}

fn list_stages() {
    let registry = StageRegistry::new();
    for name in registry.available_stages() {
        let Some(stage) = registry.get(&name) else { continue };
        let capabilities = stage.capabilities();
        println!(
            "{:<14} {:?} -> {:?}  {}",
            name,
            capabilities.input_kinds,
            capabilities.output_kind,
            stage.description()
        );
        for param in &capabilities.params {
            let default = param
                .default
                .as_ref()
                .map(|v| format!(" (default {})", v))
                .unwrap_or_default();
            println!("    {:<12} {}{}", param.name, param.description, default);
        }
    }
}

fn enhance_request(args: EnhanceArgs, options: RequestOptions) -> Result<(CompositionRequest, OutputCategory)> {
    let mut spec = SourceSpec::new(source_for(&args.input, args.fps)?);
    for stage in &args.stages {
        spec = spec.with_stage(parse_stage(stage)?);
    }
    let request = CompositionRequest::new(Operation::Enhance)
        .with_input(spec)
        .with_options(options)
        .with_destination(Destination::file(args.output));
    Ok((request, OutputCategory::Enhanced))
}

fn concat_request(args: ConcatArgs, mut options: RequestOptions) -> Result<(CompositionRequest, OutputCategory)> {
    if args.boundary.is_some() {
        options.boundary_policy = args.boundary;
    }
    let mut request = CompositionRequest::new(Operation::Concat)
        .with_options(options)
        .with_destination(Destination::file(args.output));
    for input in &args.inputs {
        request = request.with_input(SourceSpec::new(source_for(input, args.fps)?));
    }
    Ok((request, OutputCategory::Merged))
}

fn attach_request(args: AttachArgs, mut options: RequestOptions) -> Result<(CompositionRequest, OutputCategory)> {
    if !args.offset.is_finite() || args.offset < 0.0 {
        bail!("Offset must be a non-negative number of seconds");
    }
    if args.policy.is_some() {
        options.length_policy = args.policy;
    }
    if let Some(ms) = args.tolerance_ms {
        options.tolerance = Duration::from_millis(ms);
    }

    let mut video = SourceSpec::new(source_for(&args.video, args.fps)?);
    for stage in &args.video_stages {
        video = video.with_stage(parse_stage(stage)?);
    }
    let mut audio = SourceSpec::new(MediaSource::file(&args.audio));
    for stage in &args.audio_stages {
        audio = audio.with_stage(parse_stage(stage)?);
    }

    let request = CompositionRequest::new(Operation::AttachAudio {
        offset: Duration::from_secs_f64(args.offset),
    })
    .with_input(video)
    .with_input(audio)
    .with_options(options)
    .with_destination(Destination::file(args.output));
    Ok((request, OutputCategory::Final))
}

/// Place relative output names under the configured directory for their category
fn resolve_destination(request: CompositionRequest, config: &Config, category: OutputCategory) -> CompositionRequest {
    match request.destination.clone() {
        Destination::File { path, format } => request.with_destination(Destination::File {
            path: config.output.resolve(category, path),
            format,
        }),
        Destination::InMemory => request,
    }
}

/// Plain image directories need a frame rate; everything else loads as a file
fn source_for(path: &Path, fps: Option<f64>) -> Result<MediaSource> {
    if path.is_dir() && !path.join(MANIFEST_FILE).exists() {
        let fps = fps.ok_or_else(|| anyhow!("{:?} is an image directory; pass --fps", path))?;
        let rate = FrameRate::from_fps(fps).ok_or_else(|| anyhow!("Invalid frame rate: {}", fps))?;
        return Ok(MediaSource::ImageSequence {
            dir: path.to_path_buf(),
            rate,
        });
    }
    Ok(MediaSource::file(path))
}

/// Parse `name` or `name:key=value,key=value`
fn parse_stage(text: &str) -> Result<StageInvocation> {
    let (name, rest) = match text.split_once(':') {
        Some((name, rest)) => (name.trim(), Some(rest)),
        None => (text.trim(), None),
    };
    if name.is_empty() {
        bail!("Empty stage name in '{}'", text);
    }

    let mut params = StageParams::new();
    for pair in rest.into_iter().flat_map(|r| r.split(',')).filter(|p| !p.trim().is_empty()) {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("Expected key=value in stage '{}', got '{}'", name, pair))?;
        params.insert(key.trim(), ParamValue::parse(value.trim()));
    }
    Ok(StageInvocation::new(name, params))
}
