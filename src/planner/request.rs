use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    composition::{BoundaryPolicy, LengthPolicy},
    engine::CancellationToken,
    media::{MediaSource, StoragePolicy},
    stages::StageParams,
};

/// What a request asks the pipeline to produce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Run the stage chain of a single input
    Enhance,
    /// Sequence all inputs in order
    Concat,
    /// Bind the second input (audio) to the first (video)
    AttachAudio { offset: Duration },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Enhance => "enhance",
            Operation::Concat => "concat",
            Operation::AttachAudio { .. } => "attach_audio",
        }
    }
}

/// One stage applied to one input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageInvocation {
    pub stage: String,

    #[serde(default)]
    pub params: StageParams,
}

impl StageInvocation {
    pub fn new<S: Into<String>>(stage: S, params: StageParams) -> Self {
        Self {
            stage: stage.into(),
            params,
        }
    }

    /// Invocation relying on configured or declared defaults
    pub fn named<S: Into<String>>(stage: S) -> Self {
        Self::new(stage, StageParams::new())
    }
}

/// An input source together with its stage chain, applied in order
#[derive(Debug)]
pub struct SourceSpec {
    pub source: MediaSource,
    pub stages: Vec<StageInvocation>,
}

impl SourceSpec {
    pub fn new(source: MediaSource) -> Self {
        Self {
            source,
            stages: Vec::new(),
        }
    }

    pub fn with_stage(mut self, stage: StageInvocation) -> Self {
        self.stages.push(stage);
        self
    }
}

/// Container written for a file destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputFormat {
    /// 32-bit float WAV; audio segments only
    Wav,
    /// Directory of PNG frames, an optional `audio.wav` and a `segment.toml` manifest
    FrameSequence,
    /// H.264/AAC through the external ffmpeg process
    Mp4,
}

impl OutputFormat {
    /// Infer the format from a destination path
    pub fn from_path<P: AsRef<Path>>(path: P) -> Option<Self> {
        match path.as_ref().extension().and_then(|e| e.to_str()) {
            Some(ext) => match ext.to_lowercase().as_str() {
                "wav" => Some(OutputFormat::Wav),
                "mp4" | "m4v" | "mov" => Some(OutputFormat::Mp4),
                _ => None,
            },
            None => Some(OutputFormat::FrameSequence),
        }
    }
}

/// Where a committed segment goes
#[derive(Debug, Clone, PartialEq)]
pub enum Destination {
    /// Hand the segment back to the caller
    InMemory,
    /// Persist to `path`; the format is inferred from the path when `None`
    File {
        path: PathBuf,
        format: Option<OutputFormat>,
    },
}

impl Destination {
    pub fn file<P: Into<PathBuf>>(path: P) -> Self {
        Destination::File {
            path: path.into(),
            format: None,
        }
    }
}

/// Per-request execution options
#[derive(Debug, Clone, PartialEq)]
pub struct RequestOptions {
    /// Upper bound for each probe, decode, spill and persist operation
    pub timeout: Duration,
    pub storage_policy: StoragePolicy,
    pub max_parallel_stages: usize,
    pub length_policy: Option<LengthPolicy>,
    pub boundary_policy: Option<BoundaryPolicy>,

    /// Largest audio/video mismatch accepted without a length policy
    pub tolerance: Duration,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            storage_policy: StoragePolicy::InMemory,
            max_parallel_stages: num_cpus::get(),
            length_policy: None,
            boundary_policy: None,
            tolerance: Duration::ZERO,
        }
    }
}

/// Everything one call to the engine needs; the engine keeps no session state
#[derive(Debug)]
pub struct CompositionRequest {
    pub operation: Operation,
    pub inputs: Vec<SourceSpec>,
    pub destination: Destination,
    pub options: RequestOptions,
    pub cancel: CancellationToken,
}

impl CompositionRequest {
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            inputs: Vec::new(),
            destination: Destination::InMemory,
            options: RequestOptions::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_input(mut self, input: SourceSpec) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn with_destination(mut self, destination: Destination) -> Self {
        self.destination = destination;
        self
    }

    pub fn with_options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}
